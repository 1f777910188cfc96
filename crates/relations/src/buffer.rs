//! Links addressed to targets that are not cached yet.
//!
//! Keyed by (target type, target identity, relation). Whoever caches the
//! target later drains its entries with `take_links` and merges them in.

use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tether_core::{EntityDescriptor, Link};
use tracing::debug;

type BufferKey = (EntityDescriptor, String, String);

#[derive(Debug, Clone)]
struct Pending {
    link: Link,
    at: i64,
}

pub struct UnresolvedRelationBuffer {
    retention_ms: i64,
    entries: Mutex<FxHashMap<BufferKey, Vec<Pending>>>,
}

fn key(resource: &EntityDescriptor, identity: &str, relation: &str) -> BufferKey {
    (resource.clone(), identity.to_ascii_lowercase(), relation.to_string())
}

impl UnresolvedRelationBuffer {
    pub fn new(retention: Duration) -> Self {
        Self { retention_ms: retention.as_millis().min(i64::MAX as u128) as i64, entries: Mutex::new(FxHashMap::default()) }
    }

    /// Queues `link` for the target. Returns false when an equivalent link is already waiting.
    pub fn register_link(&self, resource: &EntityDescriptor, identity: &str, relation: &str, link: Link, at: i64) -> bool {
        let mut g = self.entries.lock();
        let list = g.entry(key(resource, identity, relation)).or_default();
        if list.iter().any(|p| p.link.same_target(&link)) {
            return false;
        }
        list.push(Pending { link, at });
        true
    }

    /// Cancels a waiting link. Returns true if one was removed.
    pub fn remove_link(&self, resource: &EntityDescriptor, identity: &str, relation: &str, link: &Link) -> bool {
        let mut g = self.entries.lock();
        let k = key(resource, identity, relation);
        let Some(list) = g.get_mut(&k) else { return false };
        let before = list.len();
        list.retain(|p| !p.link.same_target(link));
        let removed = list.len() != before;
        if list.is_empty() {
            g.remove(&k);
        }
        removed
    }

    pub fn take_links(&self, resource: &EntityDescriptor, identity: &str, relation: &str) -> Vec<Link> {
        self.entries
            .lock()
            .remove(&key(resource, identity, relation))
            .map(|list| list.into_iter().map(|p| p.link).collect())
            .unwrap_or_default()
    }

    /// Drops links that have waited longer than the retention period.
    pub fn clean_up(&self, now: i64) -> usize {
        let cutoff = now.saturating_sub(self.retention_ms);
        let mut removed = 0usize;
        let mut g = self.entries.lock();
        g.retain(|_, list| {
            let before = list.len();
            list.retain(|p| p.at >= cutoff);
            removed += before - list.len();
            !list.is_empty()
        });
        if removed > 0 {
            debug!(removed, cutoff, "buffer: expired unresolved links");
        }
        removed
    }

    /// Number of waiting links.
    pub fn len(&self) -> usize { self.entries.lock().values().map(|l| l.len()).sum() }
    pub fn is_empty(&self) -> bool { self.entries.lock().is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn class() -> EntityDescriptor { EntityDescriptor::new("school", "roster", "class") }

    #[test]
    fn register_dedups_and_take_clears() {
        let b = UnresolvedRelationBuffer::new(Duration::from_secs(60));
        assert!(b.register_link(&class(), "systemid/2", "student", Link::new("https://a/student/systemid/1"), 10));
        assert!(!b.register_link(&class(), "SYSTEMID/2", "student", Link::new("http://b/x/systemid/1"), 11));
        assert!(b.register_link(&class(), "systemid/2", "student", Link::new("https://a/student/systemid/9"), 12));
        assert_eq!(b.len(), 2);
        let got = b.take_links(&class(), "systemid/2", "student");
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].href, "https://a/student/systemid/1");
        assert!(b.is_empty());
        assert!(b.take_links(&class(), "systemid/2", "student").is_empty());
    }

    #[test]
    fn remove_cancels_pending_link() {
        let b = UnresolvedRelationBuffer::new(Duration::from_secs(60));
        b.register_link(&class(), "systemid/2", "student", Link::new("systemid/1"), 10);
        assert!(b.remove_link(&class(), "systemid/2", "student", &Link::new("x/systemid/1")));
        assert!(!b.remove_link(&class(), "systemid/2", "student", &Link::new("systemid/1")));
        assert!(b.is_empty());
    }

    #[test]
    fn clean_up_respects_retention() {
        let b = UnresolvedRelationBuffer::new(Duration::from_millis(100));
        b.register_link(&class(), "systemid/2", "student", Link::new("systemid/1"), 1_000);
        b.register_link(&class(), "systemid/3", "student", Link::new("systemid/1"), 1_050);
        assert_eq!(b.clean_up(1_120), 1);
        assert_eq!(b.len(), 1);
        assert_eq!(b.clean_up(1_150), 0);
        assert_eq!(b.clean_up(10_000), 1);
        assert!(b.is_empty());
    }
}
