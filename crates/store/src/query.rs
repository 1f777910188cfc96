//! Minimal typed filter usable as the `list` predicate.
//!
//! Tokens (whitespace separated, all must match):
//! - `field:path.to.attr=value` attribute equality (dot path, optional `[i]` per segment)
//! - `link:relation` relation has at least one link
//! - `link:relation=field/value` relation holds a link with that identity
//! - anything else: case-insensitive substring over top-level string attributes

use tether_core::{link_identity, Resource};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldQuery {
    fields: Vec<(String, String)>,
    links: Vec<(String, Option<String>)>,
    free: Vec<String>,
}

impl FieldQuery {
    pub fn parse(q: &str) -> Self {
        let mut out = Self::default();
        for tok in q.split_whitespace() {
            if let Some(rest) = tok.strip_prefix("field:") {
                if let Some((path, val)) = rest.split_once('=') {
                    if !path.is_empty() { out.fields.push((path.to_string(), val.to_string())); continue; }
                }
            }
            if let Some(rest) = tok.strip_prefix("link:") {
                match rest.split_once('=') {
                    Some((rel, id)) if !rel.is_empty() => { out.links.push((rel.to_string(), Some(id.to_ascii_lowercase()))); continue; }
                    None if !rest.is_empty() => { out.links.push((rest.to_string(), None)); continue; }
                    _ => {}
                }
            }
            out.free.push(tok.to_ascii_lowercase());
        }
        out
    }

    pub fn is_empty(&self) -> bool { self.fields.is_empty() && self.links.is_empty() && self.free.is_empty() }

    pub fn matches(&self, r: &Resource) -> bool {
        let root = serde_json::Value::Object(r.attributes.clone());
        for (path, want) in self.fields.iter() {
            let ok = extract_path(&root, path).map(|v| render(v).as_deref() == Some(want.as_str())).unwrap_or(false);
            if !ok { return false; }
        }
        for (rel, id) in self.links.iter() {
            let links = r.links(rel);
            let ok = match id {
                None => !links.is_empty(),
                Some(id) => links.iter().any(|l| link_identity(&l.href).map(|x| &x == id).unwrap_or(false)),
            };
            if !ok { return false; }
        }
        self.free.iter().all(|term| {
            r.attributes.values().any(|v| v.as_str().map(|s| s.to_ascii_lowercase().contains(term)).unwrap_or(false))
        })
    }
}

fn render(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn extract_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    use serde_json::Value;
    let mut cur = root;
    for seg in path.split('.') {
        if seg.is_empty() { return None; }
        let (key, idx_opt) = if let Some(brk) = seg.find('[') {
            let end = seg.get(brk + 1..)?.find(']')? + brk + 1;
            let idx: usize = seg[brk + 1..end].parse().ok()?;
            (&seg[..brk], Some(idx))
        } else {
            (seg, None)
        };
        match cur {
            Value::Object(map) => { cur = map.get(key)?; }
            _ => return None,
        }
        if let Some(i) = idx_opt {
            match cur {
                Value::Array(arr) => { cur = arr.get(i)?; }
                _ => return None,
            }
        }
    }
    Some(cur)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn student() -> Resource {
        Resource::from_value(json!({
            "systemId": { "value": "7" },
            "name": "Kari Nordmann",
            "contacts": [{ "email": "kari@x.no" }],
            "_links": { "class": [{ "href": "https://x/school/roster/class/systemid/3a" }] }
        }))
        .unwrap()
    }

    #[test]
    fn field_and_link_filters() {
        let r = student();
        assert!(FieldQuery::parse("field:systemId.value=7").matches(&r));
        assert!(FieldQuery::parse("field:contacts[0].email=kari@x.no").matches(&r));
        assert!(!FieldQuery::parse("field:systemId.value=8").matches(&r));
        assert!(FieldQuery::parse("link:class").matches(&r));
        assert!(FieldQuery::parse("link:class=SYSTEMID/3A").matches(&r));
        assert!(!FieldQuery::parse("link:teacher").matches(&r));
    }

    #[test]
    fn free_text_and_empty() {
        let r = student();
        assert!(FieldQuery::parse("nordmann").matches(&r));
        assert!(!FieldQuery::parse("hansen").matches(&r));
        let q = FieldQuery::parse("   ");
        assert!(q.is_empty());
        assert!(q.matches(&r));
    }
}
