//! Per-entity mutexes keyed by (resource type, id).
//!
//! Every mutation of one logical entity, whether a direct write or a relation
//! update from another resource, runs inside `with_lock` for that entity.
//! Mutexes are created on first use and dropped again once no caller holds or
//! waits on them.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tether_core::EntityDescriptor;

type LockKey = (EntityDescriptor, String);

#[derive(Default)]
pub struct ResourceLocks {
    locks: Mutex<FxHashMap<LockKey, Arc<Mutex<()>>>>,
}

impl ResourceLocks {
    pub fn new() -> Self { Self::default() }

    /// Runs `f` while holding the lock for `(descriptor, id)`. The lock is
    /// released on every exit path, including unwinding.
    pub fn with_lock<R>(&self, descriptor: &EntityDescriptor, id: &str, f: impl FnOnce() -> R) -> R {
        let key: LockKey = (descriptor.clone(), id.to_string());
        let entity = Arc::clone(self.locks.lock().entry(key.clone()).or_default());
        let out = {
            let _held = entity.lock();
            f()
        };
        self.release(&key, entity);
        out
    }

    fn release(&self, key: &LockKey, entity: Arc<Mutex<()>>) {
        let mut map = self.locks.lock();
        // map + this caller
        if Arc::strong_count(&entity) == 2 {
            map.remove(key);
        }
    }

    /// Number of live lock entries.
    pub fn len(&self) -> usize { self.locks.lock().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn serializes_same_key_and_cleans_up() {
        let locks = Arc::new(ResourceLocks::new());
        let d = EntityDescriptor::new("school", "roster", "student");
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (locks, d, inside, max_inside) = (Arc::clone(&locks), d.clone(), Arc::clone(&inside), Arc::clone(&max_inside));
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        locks.with_lock(&d, "1", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_inside.fetch_max(now, Ordering::SeqCst);
                            std::thread::yield_now();
                            inside.fetch_sub(1, Ordering::SeqCst);
                        });
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[test]
    fn returns_closure_value_and_releases_on_error() {
        let locks = ResourceLocks::new();
        let d = EntityDescriptor::new("school", "roster", "student");
        let r: Result<(), &str> = locks.with_lock(&d, "1", || Err("boom"));
        assert!(r.is_err());
        // would deadlock if the first lock leaked
        assert_eq!(locks.with_lock(&d, "1", || 7), 7);
        assert!(locks.is_empty());
    }
}
