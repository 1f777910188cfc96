//! Tether core types: resource descriptors, links, relation rules, events and errors.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod resource;

pub use config::TetherConfig;
pub use resource::{link_identity, Link, LinkList, Resource};

pub mod prelude {
    pub use super::{
        CoreError, EntityDescriptor, EntityEvent, Link, LinkList, Multiplicity, RelationBinding,
        RelationOperation, RelationSyncRule, RelationUpdate, RelationUpdateEvent, Resource,
        SyncMetadata, SyncType, TetherConfig,
    };
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("conversion: {0}")]
    Conversion(String),
    #[error("invalid link format: {0}")]
    InvalidLinkFormat(String),
    #[error("missing mandatory link {relation} on {resource}")]
    MissingMandatoryLink { resource: String, relation: String },
    #[error("resource {0} has no identity to link back with")]
    MissingIdentity(String),
    #[error("unknown resource type: {0}")]
    UnknownResource(String),
    #[error("invalid descriptor: {0} (expect domain/package/name)")]
    InvalidDescriptor(String),
}

impl CoreError {
    /// Stable label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Conversion(_) => "conversion",
            CoreError::InvalidLinkFormat(_) => "invalid_link_format",
            CoreError::MissingMandatoryLink { .. } => "missing_mandatory_link",
            CoreError::MissingIdentity(_) => "missing_identity",
            CoreError::UnknownResource(_) => "unknown_resource",
            CoreError::InvalidDescriptor(_) => "invalid_descriptor",
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 { chrono::Utc::now().timestamp_millis() }

/// Identity of a resource type. All parts are lower-cased on construction, so
/// equality and hashing are case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityDescriptor {
    domain: String,
    package: String,
    name: String,
}

impl EntityDescriptor {
    pub fn new(domain: &str, package: &str, name: &str) -> Self {
        Self { domain: domain.to_ascii_lowercase(), package: package.to_ascii_lowercase(), name: name.to_ascii_lowercase() }
    }

    pub fn domain(&self) -> &str { &self.domain }
    pub fn package(&self) -> &str { &self.package }
    pub fn name(&self) -> &str { &self.name }

    pub fn same_component(&self, domain: &str, package: &str) -> bool {
        self.domain.eq_ignore_ascii_case(domain) && self.package.eq_ignore_ascii_case(package)
    }
}

impl fmt::Display for EntityDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain, self.package, self.name)
    }
}

impl FromStr for EntityDescriptor {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [domain, package, name] if !domain.is_empty() && !package.is_empty() && !name.is_empty() => {
                Ok(Self::new(domain, package, name))
            }
            _ => Err(CoreError::InvalidDescriptor(s.to_string())),
        }
    }
}

impl TryFrom<String> for EntityDescriptor {
    type Error = CoreError;
    fn try_from(s: String) -> Result<Self, Self::Error> { s.parse() }
}

impl From<EntityDescriptor> for String {
    fn from(d: EntityDescriptor) -> Self { d.to_string() }
}

/// Cardinality of one side of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Multiplicity {
    One,
    ZeroOrOne,
    ZeroOrMany,
    OneOrMany,
}

impl Multiplicity {
    pub fn is_single(self) -> bool { matches!(self, Multiplicity::One | Multiplicity::ZeroOrOne) }
    pub fn is_many(self) -> bool { !self.is_single() }
    pub fn is_required(self) -> bool { matches!(self, Multiplicity::One | Multiplicity::OneOrMany) }
}

/// One managed relation direction: a change on the triggering type under
/// `target_relation` is mirrored onto `target` under `inverse_relation`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSyncRule {
    pub target_relation: String,
    pub inverse_relation: String,
    pub target: EntityDescriptor,
    pub target_multiplicity: Multiplicity,
    pub inverse_multiplicity: Multiplicity,
    pub is_source: bool,
}

impl RelationSyncRule {
    /// The triggering resource must carry at least one link under `target_relation`.
    pub fn is_mandatory(&self) -> bool { self.target_multiplicity.is_required() }

    pub fn is_many_to_many(&self) -> bool {
        self.target_multiplicity.is_many() && self.inverse_multiplicity.is_many()
    }

    /// Links dropped from the triggering side must be actively removed from the target.
    pub fn should_prune_links(&self) -> bool {
        self.target_multiplicity.is_single() || (self.is_many_to_many() && self.is_source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RelationOperation {
    Add,
    Delete,
}

impl RelationOperation {
    pub fn as_str(self) -> &'static str {
        match self { RelationOperation::Add => "add", RelationOperation::Delete => "delete" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationBinding {
    pub relation: String,
    pub links: Vec<Link>,
}

/// A cross-resource mutation: put (or remove) `binding.links` under
/// `binding.relation` on every target addressed by `target_ids`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationUpdate {
    pub target: EntityDescriptor,
    /// Target identities in `field/value` form.
    pub target_ids: Vec<String>,
    pub binding: RelationBinding,
    pub operation: RelationOperation,
    #[serde(default)]
    pub timestamp: i64,
}

impl RelationUpdate {
    /// Key shared by every update addressing the same targets, relation and links,
    /// regardless of operation. A later update with the same key supersedes an earlier one.
    pub fn supersede_key(&self) -> String {
        let mut ids: Vec<String> = self.target_ids.iter().map(|s| s.to_ascii_lowercase()).collect();
        ids.sort_unstable();
        let mut links: Vec<String> = self
            .binding
            .links
            .iter()
            .map(|l| l.identity().unwrap_or_else(|_| l.href.to_ascii_lowercase()))
            .collect();
        links.sort_unstable();
        format!("{}|{}|{}|{}", self.target, ids.join(","), self.binding.relation.to_ascii_lowercase(), links.join(","))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncType {
    Full,
    Delta,
    Delete,
}

impl SyncType {
    pub fn as_str(self) -> &'static str {
        match self { SyncType::Full => "full", SyncType::Delta => "delta", SyncType::Delete => "delete" }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMetadata {
    #[serde(rename = "type")]
    pub sync_type: SyncType,
    pub correlation_id: String,
    pub total_size: u64,
}

/// Inbound entity change. `resource == None` signals deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityEvent {
    pub resource_type: EntityDescriptor,
    pub id: String,
    #[serde(default)]
    pub resource: Option<serde_json::Value>,
    pub timestamp: i64,
    #[serde(default)]
    pub sync: Option<SyncMetadata>,
}

/// Inbound relation update addressed to this (or another) component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationUpdateEvent {
    pub org_id: String,
    #[serde(flatten)]
    pub update: RelationUpdate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(target: Multiplicity, inverse: Multiplicity, is_source: bool) -> RelationSyncRule {
        RelationSyncRule {
            target_relation: "class".into(),
            inverse_relation: "student".into(),
            target: EntityDescriptor::new("school", "roster", "class"),
            target_multiplicity: target,
            inverse_multiplicity: inverse,
            is_source,
        }
    }

    #[test]
    fn descriptor_is_case_insensitive() {
        let a = EntityDescriptor::new("School", "ROSTER", "Student");
        let b: EntityDescriptor = "school/roster/student".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "school/roster/student");
        assert!("school/roster".parse::<EntityDescriptor>().is_err());
    }

    #[test]
    fn descriptor_serializes_as_path() {
        let d = EntityDescriptor::new("a", "B", "c");
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v, serde_json::json!("a/b/c"));
        let back: EntityDescriptor = serde_json::from_value(serde_json::json!("A/b/C")).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn rule_flags_follow_multiplicity() {
        let one = rule(Multiplicity::One, Multiplicity::ZeroOrMany, false);
        assert!(one.is_mandatory());
        assert!(one.should_prune_links());

        let optional = rule(Multiplicity::ZeroOrOne, Multiplicity::ZeroOrMany, false);
        assert!(!optional.is_mandatory());
        assert!(optional.should_prune_links());

        let many_src = rule(Multiplicity::ZeroOrMany, Multiplicity::ZeroOrMany, true);
        assert!(many_src.is_many_to_many());
        assert!(many_src.should_prune_links());

        let many_one = rule(Multiplicity::OneOrMany, Multiplicity::One, false);
        assert!(many_one.is_mandatory());
        assert!(!many_one.should_prune_links());
    }

    #[test]
    fn supersede_key_ignores_operation_and_order() {
        let mk = |op, ids: Vec<&str>| RelationUpdate {
            target: EntityDescriptor::new("a", "b", "c"),
            target_ids: ids.into_iter().map(String::from).collect(),
            binding: RelationBinding { relation: "Rel".into(), links: vec![Link::new("http://x/a/b/c/systemid/1")] },
            operation: op,
            timestamp: 0,
        };
        let add = mk(RelationOperation::Add, vec!["systemid/2", "systemid/3"]);
        let del = mk(RelationOperation::Delete, vec!["systemid/3", "SYSTEMID/2"]);
        assert_eq!(add.supersede_key(), del.supersede_key());
    }

    #[test]
    fn entity_event_decodes_with_sync_metadata() {
        let ev: EntityEvent = serde_json::from_value(serde_json::json!({
            "resource_type": "school/roster/student",
            "id": "1",
            "resource": null,
            "timestamp": 10,
            "sync": { "type": "FULL", "correlation_id": "c1", "total_size": 3 }
        }))
        .unwrap();
        assert!(ev.resource.is_none());
        assert_eq!(ev.sync.unwrap().sync_type, SyncType::Full);
    }
}
