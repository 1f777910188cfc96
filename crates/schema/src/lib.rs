//! Tether schema: resource/relation declarations, the rule-construction policy
//! and the read-only relation rule registry built from them at startup.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use tether_core::{EntityDescriptor, Multiplicity, RelationSyncRule};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InverseSpec {
    pub name: String,
    pub multiplicity: Multiplicity,
}

/// One relation declared on a resource type, with its inverse on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSpec {
    pub name: String,
    pub target: EntityDescriptor,
    pub multiplicity: Multiplicity,
    #[serde(default)]
    pub inverse: Option<InverseSpec>,
    /// Declared owner of a many-to-many pair.
    #[serde(default)]
    pub source: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    pub resource: EntityDescriptor,
    #[serde(default)]
    pub id_fields: Vec<String>,
    #[serde(default)]
    pub relations: Vec<RelationSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaFile {
    pub resources: Vec<ResourceSchema>,
}

/// Supplies the relation rules each resource type triggers. Queried once at startup.
pub trait RuleSource: Send + Sync {
    fn rules(&self) -> Result<Vec<(EntityDescriptor, Vec<RelationSyncRule>)>>;
}

impl SchemaFile {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading schema file {}", path))?;
        Self::from_json_str(&raw).with_context(|| format!("parsing schema file {}", path))
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let schema: SchemaFile = serde_json::from_str(raw)?;
        Ok(schema)
    }

    /// Identifier fields for each declared type in the given component; all
    /// types when `domain` is empty.
    pub fn cached_types(&self, domain: &str, package: &str) -> Vec<(EntityDescriptor, Vec<String>)> {
        self.resources
            .iter()
            .filter(|r| domain.is_empty() || r.resource.same_component(domain, package))
            .map(|r| (r.resource.clone(), r.id_fields.iter().map(|f| f.to_ascii_lowercase()).collect()))
            .collect()
    }

    pub fn id_fields(&self, descriptor: &EntityDescriptor) -> Vec<String> {
        self.resources
            .iter()
            .find(|r| &r.resource == descriptor)
            .map(|r| r.id_fields.iter().map(|f| f.to_ascii_lowercase()).collect())
            .unwrap_or_default()
    }
}

impl RuleSource for SchemaFile {
    fn rules(&self) -> Result<Vec<(EntityDescriptor, Vec<RelationSyncRule>)>> { Ok(build_rules(&self.resources)) }
}

/// Whether a declared relation pair is kept under automatic management.
/// Excluded: single-valued on both sides, and many-to-many seen from the
/// non-source side.
pub fn is_managed(spec: &RelationSpec, inverse: &InverseSpec) -> bool {
    let (fwd, back) = (spec.multiplicity, inverse.multiplicity);
    if fwd.is_single() && back.is_single() {
        return false;
    }
    if fwd.is_many() && back.is_many() && !spec.source {
        return false;
    }
    true
}

pub fn build_rules(resources: &[ResourceSchema]) -> Vec<(EntityDescriptor, Vec<RelationSyncRule>)> {
    let mut out = Vec::new();
    for r in resources {
        let mut rules = Vec::new();
        for spec in r.relations.iter() {
            let Some(inverse) = spec.inverse.as_ref() else { continue };
            if !is_managed(spec, inverse) {
                debug!(resource = %r.resource, relation = %spec.name, "schema: relation pair not managed");
                continue;
            }
            rules.push(RelationSyncRule {
                target_relation: spec.name.clone(),
                inverse_relation: inverse.name.clone(),
                target: spec.target.clone(),
                target_multiplicity: spec.multiplicity,
                inverse_multiplicity: inverse.multiplicity,
                is_source: spec.source,
            });
        }
        if !rules.is_empty() {
            out.push((r.resource.clone(), rules));
        }
    }
    out
}

/// Immutable lookup from a resource type to the rules it triggers, plus the
/// reverse index of inverse relation names held by each target type.
#[derive(Debug, Default)]
pub struct RelationRuleRegistry {
    triggered: FxHashMap<EntityDescriptor, Vec<RelationSyncRule>>,
    inverse: FxHashMap<EntityDescriptor, FxHashSet<String>>,
    none: FxHashSet<String>,
}

impl RelationRuleRegistry {
    pub fn empty() -> Self { Self::default() }

    pub fn from_source(source: &dyn RuleSource) -> Result<Self> {
        let rules = source.rules().context("querying relation rule source")?;
        Ok(Self::from_rules(rules))
    }

    pub fn from_rules<I>(rules: I) -> Self
    where
        I: IntoIterator<Item = (EntityDescriptor, Vec<RelationSyncRule>)>,
    {
        let mut me = Self::default();
        for (descriptor, list) in rules {
            for rule in list {
                me.inverse.entry(rule.target.clone()).or_default().insert(rule.inverse_relation.clone());
                let slot = me.triggered.entry(descriptor.clone()).or_default();
                if !slot.contains(&rule) {
                    slot.push(rule);
                }
            }
        }
        info!(types = me.triggered.len(), rules = me.rule_count(), "schema: relation rules installed");
        me
    }

    pub fn rules_triggered_by(&self, descriptor: &EntityDescriptor) -> &[RelationSyncRule] {
        self.triggered.get(descriptor).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn inverse_relations_of(&self, descriptor: &EntityDescriptor) -> &FxHashSet<String> {
        self.inverse.get(descriptor).unwrap_or(&self.none)
    }

    pub fn rule_count(&self) -> usize { self.triggered.values().map(|v| v.len()).sum() }

    /// `(triggering type, rule)` pairs in a stable order.
    pub fn all_rules(&self) -> Vec<(EntityDescriptor, RelationSyncRule)> {
        let mut out: Vec<(EntityDescriptor, RelationSyncRule)> = self
            .triggered
            .iter()
            .flat_map(|(d, rules)| rules.iter().map(move |r| (d.clone(), r.clone())))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.target_relation.cmp(&b.1.target_relation)));
        out
    }
}
