//! Tether store: one indexed in-RAM table per resource type.
//! Primary map by id, secondary maps by declared identifier fields, stable
//! insertion order, and a last-updated watermark.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tether_core::{EntityDescriptor, Resource};
use tracing::{debug, info};

pub mod lock;
pub mod query;

pub use lock::ResourceLocks;
pub use query::FieldQuery;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub resource: Arc<Resource>,
    pub timestamp: i64,
    seq: u64,
}

impl CacheEntry {
    /// Table position; stable across updates, fresh after a remove.
    pub fn seq(&self) -> u64 { self.seq }
}

#[derive(Default)]
struct Inner {
    entries: FxHashMap<String, CacheEntry>,
    order: BTreeMap<u64, String>,
    // field -> value -> ids in write order (field and value lower-cased)
    indices: FxHashMap<String, FxHashMap<String, SmallVec<[String; 1]>>>,
    next_seq: u64,
    last_updated: i64,
}

impl Inner {
    fn unindex(&mut self, fields: &[String], id: &str, resource: &Resource) {
        for field in fields {
            let Some(value) = resource.field_value(field) else { continue };
            let Some(rows) = self.indices.get_mut(field) else { continue };
            let key = value.to_ascii_lowercase();
            if let Some(owners) = rows.get_mut(&key) {
                owners.retain(|owner| owner != id);
                if owners.is_empty() {
                    rows.remove(&key);
                }
            }
        }
    }

    /// Earliest written entry still carrying `value` under `field`.
    fn lookup(&self, field: &str, value: &str) -> Option<&String> {
        self.indices.get(&field.to_ascii_lowercase())?.get(&value.to_ascii_lowercase())?.first()
    }

    fn index(&mut self, fields: &[String], id: &str, resource: &Resource) {
        for field in fields {
            if let Some(value) = resource.field_value(field) {
                let owners = self.indices.entry(field.clone()).or_default().entry(value.to_ascii_lowercase()).or_default();
                if !owners.iter().any(|owner| owner == id) {
                    owners.push(id.to_string());
                }
            }
        }
    }
}

/// All cached entries of one resource type.
pub struct ResourceStore {
    descriptor: EntityDescriptor,
    index_fields: Vec<String>,
    inner: RwLock<Inner>,
}

impl ResourceStore {
    pub fn new(descriptor: EntityDescriptor, index_fields: &[String]) -> Self {
        Self {
            descriptor,
            index_fields: index_fields.iter().map(|f| f.to_ascii_lowercase()).collect(),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn descriptor(&self) -> &EntityDescriptor { &self.descriptor }
    pub fn index_fields(&self) -> &[String] { &self.index_fields }
    pub fn len(&self) -> usize { self.inner.read().entries.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn last_updated(&self) -> i64 { self.inner.read().last_updated }

    /// Upsert. An existing entry keeps its position in the table.
    pub fn put(&self, id: &str, resource: Resource, timestamp: i64) {
        let resource = Arc::new(resource);
        let mut g = self.inner.write();
        let seq = match g.entries.remove(id) {
            Some(old) => {
                g.unindex(&self.index_fields, id, &old.resource);
                old.seq
            }
            None => {
                let seq = g.next_seq;
                g.next_seq += 1;
                g.order.insert(seq, id.to_string());
                seq
            }
        };
        g.index(&self.index_fields, id, &resource);
        g.entries.insert(id.to_string(), CacheEntry { resource, timestamp, seq });
        g.last_updated = g.last_updated.max(timestamp);
        let n = g.entries.len();
        drop(g);
        metrics::gauge!("cache_entries", n as f64, "resource" => self.descriptor.to_string());
    }

    /// Replaces `id` only if it still holds exactly `seen`. Returns false when
    /// the entry was removed or rewritten since `seen` was read.
    pub fn put_if_current(&self, id: &str, seen: &CacheEntry, resource: Resource, timestamp: i64) -> bool {
        let mut g = self.inner.write();
        let current = g.entries.get(id).map(|e| e.seq == seen.seq && Arc::ptr_eq(&e.resource, &seen.resource)).unwrap_or(false);
        if !current {
            debug!(resource = %self.descriptor, id = %id, "store: conditional put lost to a concurrent change");
            return false;
        }
        let resource = Arc::new(resource);
        g.unindex(&self.index_fields, id, &seen.resource);
        g.index(&self.index_fields, id, &resource);
        g.entries.insert(id.to_string(), CacheEntry { resource, timestamp, seq: seen.seq });
        g.last_updated = g.last_updated.max(timestamp);
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<Resource>> {
        self.inner.read().entries.get(id).map(|e| Arc::clone(&e.resource))
    }

    pub fn entry(&self, id: &str) -> Option<CacheEntry> { self.inner.read().entries.get(id).cloned() }

    pub fn get_by_index_field(&self, field: &str, value: &str) -> Option<Arc<Resource>> {
        let g = self.inner.read();
        let id = g.lookup(field, value)?;
        g.entries.get(id).map(|e| Arc::clone(&e.resource))
    }

    /// Primary id of the entry addressed by a `field/value` identity.
    pub fn resolve(&self, identity: &str) -> Option<String> {
        let (field, value) = identity.split_once('/')?;
        let g = self.inner.read();
        g.lookup(field, value).cloned()
    }

    pub fn remove(&self, id: &str, timestamp: i64) -> Option<Arc<Resource>> {
        let mut g = self.inner.write();
        let old = g.entries.remove(id)?;
        g.unindex(&self.index_fields, id, &old.resource);
        g.order.remove(&old.seq);
        g.last_updated = g.last_updated.max(timestamp);
        let n = g.entries.len();
        drop(g);
        metrics::gauge!("cache_entries", n as f64, "resource" => self.descriptor.to_string());
        Some(old.resource)
    }

    /// Entries with `timestamp >= since` matching `filter`, in table order,
    /// after skipping `offset`. `size == 0` means no limit.
    pub fn list<F>(&self, size: usize, offset: usize, since: i64, filter: F) -> Vec<Arc<Resource>>
    where
        F: Fn(&Resource) -> bool,
    {
        let g = self.inner.read();
        let limit = if size == 0 { usize::MAX } else { size };
        g.order
            .values()
            .filter_map(|id| g.entries.get(id))
            .filter(|e| e.timestamp >= since)
            .filter(|e| filter(e.resource.as_ref()))
            .skip(offset)
            .take(limit)
            .map(|e| Arc::clone(&e.resource))
            .collect()
    }

    /// `(id, timestamp, resource)` for every entry in table order.
    pub fn snapshot(&self) -> Vec<(String, i64, Arc<Resource>)> {
        let g = self.inner.read();
        g.order
            .values()
            .filter_map(|id| g.entries.get(id).map(|e| (id.clone(), e.timestamp, Arc::clone(&e.resource))))
            .collect()
    }

    /// Removes every entry written strictly before `cutoff`.
    pub fn evict_older_than(&self, cutoff: i64) -> Vec<(String, Arc<Resource>)> {
        let mut g = self.inner.write();
        let stale: Vec<String> = g
            .order
            .values()
            .filter(|id| g.entries.get(*id).map(|e| e.timestamp < cutoff).unwrap_or(false))
            .cloned()
            .collect();
        let mut out = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(old) = g.entries.remove(&id) {
                g.unindex(&self.index_fields, &id, &old.resource);
                g.order.remove(&old.seq);
                out.push((id, old.resource));
            }
        }
        let n = g.entries.len();
        drop(g);
        if !out.is_empty() {
            info!(resource = %self.descriptor, evicted = out.len(), cutoff, "store: evicted stale entries");
            metrics::counter!("cache_evicted_total", out.len() as u64, "resource" => self.descriptor.to_string());
        } else {
            debug!(resource = %self.descriptor, cutoff, "store: nothing to evict");
        }
        metrics::gauge!("cache_entries", n as f64, "resource" => self.descriptor.to_string());
        out
    }
}

/// Stores for every resource type this instance caches. Fixed at construction.
#[derive(Default)]
pub struct CacheRegistry {
    stores: FxHashMap<EntityDescriptor, Arc<ResourceStore>>,
}

impl CacheRegistry {
    pub fn new<I>(types: I) -> Self
    where
        I: IntoIterator<Item = (EntityDescriptor, Vec<String>)>,
    {
        let stores = types
            .into_iter()
            .map(|(d, fields)| (d.clone(), Arc::new(ResourceStore::new(d, &fields))))
            .collect();
        Self { stores }
    }

    pub fn get(&self, descriptor: &EntityDescriptor) -> Option<&Arc<ResourceStore>> { self.stores.get(descriptor) }

    pub fn contains(&self, descriptor: &EntityDescriptor) -> bool { self.stores.contains_key(descriptor) }

    pub fn descriptors(&self) -> Vec<EntityDescriptor> {
        let mut v: Vec<EntityDescriptor> = self.stores.keys().cloned().collect();
        v.sort();
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> ResourceStore {
        ResourceStore::new(EntityDescriptor::new("school", "roster", "student"), &["systemId".to_string(), "email".to_string()])
    }

    fn res(system_id: &str, email: &str) -> Resource {
        Resource::from_value(json!({ "systemId": { "value": system_id }, "email": email })).unwrap()
    }

    #[test]
    fn put_get_and_index_lookup() {
        let s = store();
        s.put("1", res("a1", "a@x.no"), 10);
        assert_eq!(s.len(), 1);
        assert!(s.get("1").is_some());
        assert!(s.get_by_index_field("SYSTEMID", "A1").is_some());
        assert!(s.get_by_index_field("email", "a@x.no").is_some());
        assert_eq!(s.resolve("systemid/a1").as_deref(), Some("1"));
        assert_eq!(s.last_updated(), 10);
    }

    #[test]
    fn update_replaces_index_rows_and_keeps_order() {
        let s = store();
        s.put("1", res("a1", "a@x.no"), 10);
        s.put("2", res("b1", "b@x.no"), 11);
        s.put("1", res("a2", "a@x.no"), 12);
        assert!(s.get_by_index_field("systemid", "a1").is_none());
        assert!(s.get_by_index_field("systemid", "a2").is_some());
        let ids: Vec<String> = s.snapshot().into_iter().map(|(id, _, _)| id).collect();
        assert_eq!(ids, vec!["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn watermark_never_moves_backwards() {
        let s = store();
        s.put("1", res("a1", "a"), 20);
        s.put("2", res("b1", "b"), 5);
        assert_eq!(s.last_updated(), 20);
        s.remove("2", 30);
        assert_eq!(s.last_updated(), 30);
        assert!(s.get_by_index_field("systemid", "b1").is_none());
    }

    #[test]
    fn list_filters_then_pages() {
        let s = store();
        for i in 0..6 {
            s.put(&i.to_string(), res(&format!("s{}", i), &format!("{}@x", i)), i as i64);
        }
        assert_eq!(s.list(0, 0, 0, |_| true).len(), 6);
        assert_eq!(s.list(0, 0, 3, |_| true).len(), 3);
        let page = s.list(2, 1, 0, |r| r.field_value("systemid").map(|v| v != "s0").unwrap_or(false));
        let got: Vec<String> = page.iter().filter_map(|r| r.field_value("systemid")).collect();
        assert_eq!(got, vec!["s2".to_string(), "s3".to_string()]);
    }

    #[test]
    fn evict_strictly_older() {
        let s = store();
        s.put("1", res("a", "a"), 10);
        s.put("2", res("b", "b"), 20);
        s.put("3", res("c", "c"), 30);
        let evicted = s.evict_older_than(20);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "1");
        assert!(s.get("2").is_some());
        assert!(s.get_by_index_field("systemid", "a").is_none());
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn shared_index_value_survives_removal_of_one_owner() {
        let s = store();
        s.put("1", res("a1", "x@y"), 10);
        s.put("2", res("a2", "x@y"), 11);
        assert_eq!(s.resolve("email/x@y").as_deref(), Some("1"));
        s.remove("2", 12);
        assert!(s.get("1").is_some());
        assert!(s.get_by_index_field("email", "x@y").is_some());

        s.put("2", res("a2", "x@y"), 13);
        s.remove("1", 14);
        assert_eq!(s.resolve("email/x@y").as_deref(), Some("2"));
        s.remove("2", 15);
        assert!(s.get_by_index_field("email", "x@y").is_none());
    }

    #[test]
    fn conditional_put_refuses_evicted_or_rewritten_entry() {
        let s = store();
        s.put("1", res("a1", "a"), 50);
        let seen = s.entry("1").unwrap();
        assert_eq!(s.evict_older_than(100).len(), 1);
        assert!(!s.put_if_current("1", &seen, res("a1", "a"), 120));
        assert!(s.get("1").is_none());
        assert!(s.get_by_index_field("systemid", "a1").is_none());

        s.put("2", res("b1", "b"), 10);
        let seen = s.entry("2").unwrap();
        s.put("2", res("b2", "b"), 11);
        assert!(!s.put_if_current("2", &seen, res("b3", "b"), 12));
        assert!(s.get_by_index_field("systemid", "b2").is_some());

        let seen = s.entry("2").unwrap();
        assert!(s.put_if_current("2", &seen, res("b4", "b"), 13));
        assert!(s.get_by_index_field("systemid", "b2").is_none());
        assert_eq!(s.entry("2").unwrap().timestamp, 13);
    }

    #[test]
    fn registry_lookup_is_case_insensitive() {
        let reg = CacheRegistry::new(vec![(EntityDescriptor::new("School", "Roster", "Student"), vec!["systemid".to_string()])]);
        assert!(reg.get(&EntityDescriptor::new("school", "roster", "student")).is_some());
        assert!(!reg.contains(&EntityDescriptor::new("school", "roster", "class")));
    }
}
