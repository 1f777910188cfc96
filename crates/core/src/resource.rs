//! Resource payloads and link identity.
//!
//! A link's identity is the last two `/`-separated segments of its href,
//! lower-cased (e.g. `systemid/123`). Two links with the same identity are the
//! same link even when their base URLs differ. Query strings and other unusual
//! href shapes are not special-cased.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{CoreError, EntityDescriptor};

pub type LinkList = SmallVec<[Link; 2]>;

pub const SELF_RELATION: &str = "self";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub href: String,
}

impl Link {
    pub fn new(href: impl Into<String>) -> Self { Self { href: href.into() } }

    pub fn identity(&self) -> Result<String, CoreError> { link_identity(&self.href) }

    /// Identity comparison, falling back to case-insensitive href equality when
    /// either side has no parseable identity.
    pub fn same_target(&self, other: &Link) -> bool {
        match (self.identity(), other.identity()) {
            (Ok(a), Ok(b)) => a == b,
            _ => self.href.eq_ignore_ascii_case(&other.href),
        }
    }
}

pub fn link_identity(href: &str) -> Result<String, CoreError> {
    let segs: Vec<&str> = href.split('/').filter(|s| !s.is_empty()).collect();
    if segs.len() < 2 {
        return Err(CoreError::InvalidLinkFormat(href.to_string()));
    }
    Ok(format!("{}/{}", segs[segs.len() - 2], segs[segs.len() - 1]).to_ascii_lowercase())
}

/// A resource as delivered by an adapter: free-form attributes plus `_links`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(rename = "_links", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub links: BTreeMap<String, LinkList>,
    #[serde(flatten)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

impl Resource {
    pub fn from_value(raw: serde_json::Value) -> Result<Self, CoreError> {
        if !raw.is_object() {
            return Err(CoreError::Conversion(format!("expected object, got {}", kind_of(&raw))));
        }
        serde_json::from_value(raw).map_err(|e| CoreError::Conversion(e.to_string()))
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn links(&self, relation: &str) -> &[Link] {
        self.links.get(relation).map(|l| l.as_slice()).unwrap_or(&[])
    }

    pub fn has_relation(&self, relation: &str) -> bool {
        self.links.get(relation).map(|l| !l.is_empty()).unwrap_or(false)
    }

    /// Adds `link` under `relation` unless an equivalent link is present. Returns true if added.
    pub fn add_unique(&mut self, relation: &str, link: Link) -> bool {
        let list = self.links.entry(relation.to_string()).or_default();
        if list.iter().any(|l| l.same_target(&link)) {
            return false;
        }
        list.push(link);
        true
    }

    /// Removes every link equivalent to `link`; drops the relation key when it
    /// becomes empty. Returns true if anything was removed.
    pub fn remove_matching(&mut self, relation: &str, link: &Link) -> bool {
        let Some(list) = self.links.get_mut(relation) else { return false };
        let before = list.len();
        list.retain(|l| !l.same_target(link));
        let removed = list.len() != before;
        if list.is_empty() {
            self.links.remove(relation);
        }
        removed
    }

    /// Scalar value of a top-level attribute (case-insensitive name). Objects
    /// carrying a `value` member are treated as identifier wrappers.
    pub fn field_value(&self, field: &str) -> Option<String> {
        let v = self
            .attributes
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(field))
            .map(|(_, v)| v)?;
        scalar(v).or_else(|| v.get("value").and_then(scalar))
    }

    /// Identities (`field/value`, lower-cased) under the given identifier fields.
    pub fn identities(&self, fields: &[String]) -> Vec<String> {
        fields
            .iter()
            .filter_map(|f| self.field_value(f).map(|v| format!("{}/{}", f, v).to_ascii_lowercase()))
            .collect()
    }

    /// Link other resources should hold to reach this one: the first `self`
    /// link, else one synthesized from the first identity.
    pub fn back_link(&self, descriptor: &EntityDescriptor, fields: &[String]) -> Result<Link, CoreError> {
        if let Some(l) = self.links(SELF_RELATION).first() {
            return Ok(l.clone());
        }
        let identity = self
            .identities(fields)
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::MissingIdentity(descriptor.to_string()))?;
        Ok(Link::new(format!("{}/{}", descriptor, identity)))
    }
}

fn scalar(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn kind_of(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_is_last_two_segments() {
        assert_eq!(link_identity("https://api.example.no/school/roster/student/systemid/ABC").unwrap(), "systemid/abc");
        assert_eq!(link_identity("systemid/1").unwrap(), "systemid/1");
        assert_eq!(link_identity("systemid/1/").unwrap(), "systemid/1");
        assert!(matches!(link_identity("abc"), Err(CoreError::InvalidLinkFormat(_))));
        assert!(link_identity("").is_err());
    }

    #[test]
    fn same_target_tolerates_base_url() {
        let a = Link::new("https://a.example/x/y/systemid/1");
        let b = Link::new("http://b.example/other/SystemId/1");
        assert!(a.same_target(&b));
        assert!(!a.same_target(&Link::new("https://a.example/x/y/systemid/2")));
    }

    #[test]
    fn decode_links_and_attributes() {
        let r = Resource::from_value(json!({
            "systemId": { "value": "42" },
            "name": "Kari",
            "_links": { "class": [{ "href": "https://x/school/roster/class/systemid/7" }] }
        }))
        .unwrap();
        assert_eq!(r.field_value("systemid").as_deref(), Some("42"));
        assert_eq!(r.field_value("name").as_deref(), Some("Kari"));
        assert_eq!(r.links("class").len(), 1);
        assert_eq!(r.identities(&["systemid".into(), "missing".into()]), vec!["systemid/42".to_string()]);
    }

    #[test]
    fn conversion_failures_are_reported() {
        assert!(matches!(Resource::from_value(json!([1, 2])), Err(CoreError::Conversion(_))));
        assert!(matches!(Resource::from_value(json!({ "_links": "nope" })), Err(CoreError::Conversion(_))));
    }

    #[test]
    fn add_unique_and_remove_matching() {
        let mut r = Resource::default();
        assert!(r.add_unique("rel", Link::new("https://a/x/systemid/1")));
        assert!(!r.add_unique("rel", Link::new("https://b/y/SYSTEMID/1")));
        assert!(r.add_unique("rel", Link::new("https://a/x/systemid/2")));
        assert_eq!(r.links("rel").len(), 2);

        assert!(r.remove_matching("rel", &Link::new("systemid/1")));
        assert_eq!(r.links("rel").len(), 1);
        assert!(r.remove_matching("rel", &Link::new("systemid/2")));
        assert!(!r.links.contains_key("rel"));
        assert!(!r.remove_matching("rel", &Link::new("systemid/2")));
    }

    #[test]
    fn back_link_prefers_self() {
        let d = EntityDescriptor::new("school", "roster", "student");
        let fields = vec!["systemid".to_string()];
        let mut r = Resource::from_value(json!({ "systemid": "1" })).unwrap();
        assert_eq!(r.back_link(&d, &fields).unwrap().href, "school/roster/student/systemid/1");
        r.add_unique(SELF_RELATION, Link::new("https://x/school/roster/student/systemid/1"));
        assert_eq!(r.back_link(&d, &fields).unwrap().href, "https://x/school/roster/student/systemid/1");
        let empty = Resource::default();
        assert!(matches!(empty.back_link(&d, &fields), Err(CoreError::MissingIdentity(_))));
    }
}
