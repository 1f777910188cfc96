//! Keeps both ends of every managed relation in sync.
//!
//! A write to a resource runs under that resource's own lock: the previous
//! entry is read, inverse links are carried over and buffered links merged in,
//! stale links are turned into DELETE updates, current links into ADD updates,
//! and the merged resource is stored. The derived updates are handed back to
//! the caller and applied after the lock is released, each under the lock of
//! its target, so two entity locks are never held at once.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tether_core::{
    now_millis, CoreError, EntityDescriptor, Link, RelationBinding, RelationOperation, RelationSyncRule,
    RelationUpdate, Resource,
};
use tether_schema::RelationRuleRegistry;
use tether_store::{CacheRegistry, ResourceLocks, ResourceStore};
use tracing::{debug, warn};

use crate::buffer::UnresolvedRelationBuffer;

/// What `apply` did with an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every addressed target was cached and has been mutated (or already matched).
    Applied,
    /// At least one target is not cached yet; the change waits in the buffer.
    Pending,
    /// The target type is not cached by this instance.
    NotLocal,
}

pub struct RelationReconciler {
    rules: Arc<ArcSwap<RelationRuleRegistry>>,
    stores: Arc<CacheRegistry>,
    locks: Arc<ResourceLocks>,
    buffer: Arc<UnresolvedRelationBuffer>,
}

impl RelationReconciler {
    pub fn new(
        rules: Arc<ArcSwap<RelationRuleRegistry>>,
        stores: Arc<CacheRegistry>,
        locks: Arc<ResourceLocks>,
        buffer: Arc<UnresolvedRelationBuffer>,
    ) -> Self {
        Self { rules, stores, locks, buffer }
    }

    fn store(&self, descriptor: &EntityDescriptor) -> Result<&Arc<ResourceStore>, CoreError> {
        self.stores.get(descriptor).ok_or_else(|| CoreError::UnknownResource(descriptor.to_string()))
    }

    /// Merges and stores `incoming`, returning the relation updates its links imply.
    pub fn reconcile(
        &self,
        descriptor: &EntityDescriptor,
        id: &str,
        incoming: Resource,
        timestamp: i64,
    ) -> Result<Vec<RelationUpdate>, CoreError> {
        let store = self.store(descriptor)?;
        let rules = self.rules.load();
        let updates = self.locks.with_lock(descriptor, id, || {
            let old = store.get(id);
            let merged = self.merge_inverse(&rules, store, old.as_deref(), incoming);
            let mut updates = Vec::new();
            for rule in rules.rules_triggered_by(descriptor) {
                let derived = match old.as_deref() {
                    Some(old) if rule.should_prune_links() => {
                        prune_updates(rule, descriptor, store.index_fields(), old, &merged, timestamp)
                    }
                    _ => Ok(Vec::new()),
                }
                .and_then(|mut pruned| {
                    pruned.extend(add_updates(rule, descriptor, store.index_fields(), &merged, timestamp)?);
                    Ok(pruned)
                });
                match derived {
                    Ok(list) => updates.extend(list),
                    Err(e) => rule_error(descriptor, id, rule, &e),
                }
            }
            store.put(id, merged, timestamp);
            updates
        });
        debug!(resource = %descriptor, id = %id, updates = updates.len(), "reconciler: resource stored");
        Ok(updates)
    }

    /// Removes the resource and returns DELETE updates for every link it held
    /// under a managed relation.
    pub fn remove(&self, descriptor: &EntityDescriptor, id: &str, timestamp: i64) -> Result<Vec<RelationUpdate>, CoreError> {
        let store = self.store(descriptor)?;
        let removed = self.locks.with_lock(descriptor, id, || store.remove(id, timestamp));
        Ok(match removed {
            Some(old) => self.removal_updates(descriptor, &old, timestamp),
            None => {
                debug!(resource = %descriptor, id = %id, "reconciler: delete for uncached resource");
                Vec::new()
            }
        })
    }

    /// DELETE updates withdrawing `resource` from every target it links to.
    pub fn removal_updates(&self, descriptor: &EntityDescriptor, resource: &Resource, timestamp: i64) -> Vec<RelationUpdate> {
        let fields = self.stores.get(descriptor).map(|s| s.index_fields().to_vec()).unwrap_or_default();
        let rules = self.rules.load();
        let mut out = Vec::new();
        for rule in rules.rules_triggered_by(descriptor) {
            let links = resource.links(&rule.target_relation);
            if links.is_empty() {
                continue;
            }
            let derived = resource.back_link(descriptor, &fields).and_then(|back| {
                links
                    .iter()
                    .map(|l| -> Result<RelationUpdate, CoreError> {
                        Ok(update(rule, vec![l.identity()?], back.clone(), RelationOperation::Delete, timestamp))
                    })
                    .collect::<Result<Vec<_>, CoreError>>()
            });
            match derived {
                Ok(list) => out.extend(list),
                Err(e) => rule_error(descriptor, "-", rule, &e),
            }
        }
        out
    }

    /// Applies one update to every addressed target. Targets that are not
    /// cached get the change buffered instead.
    pub fn apply(&self, update: &RelationUpdate) -> ApplyOutcome {
        let Some(store) = self.stores.get(&update.target) else { return ApplyOutcome::NotLocal };
        let relation = update.binding.relation.as_str();
        let mut pending = false;
        for identity in update.target_ids.iter() {
            let applied = match store.resolve(identity) {
                Some(target_id) => self.locks.with_lock(&update.target, &target_id, || {
                    let Some(entry) = store.entry(&target_id) else { return false };
                    let mut target = (*entry.resource).clone();
                    let changed = update.binding.links.iter().fold(false, |acc, link| {
                        acc | match update.operation {
                            RelationOperation::Add => target.add_unique(relation, link.clone()),
                            RelationOperation::Delete => target.remove_matching(relation, link),
                        }
                    });
                    // Taking the later timestamp keeps a relation-touched target alive
                    // through a FULL run that never resends it; that is intended.
                    // The put fails if eviction removed the entry after it was read.
                    !changed || store.put_if_current(&target_id, &entry, target, entry.timestamp.max(update.timestamp))
                }),
                None => false,
            };
            for link in update.binding.links.iter() {
                match (applied, update.operation) {
                    (false, RelationOperation::Add) => {
                        self.buffer.register_link(&update.target, identity, relation, link.clone(), now_millis());
                    }
                    // A direct apply consumes anything still waiting for the same link.
                    _ => {
                        self.buffer.remove_link(&update.target, identity, relation, link);
                    }
                }
            }
            pending |= !applied;
        }
        if pending {
            ApplyOutcome::Pending
        } else {
            ApplyOutcome::Applied
        }
    }

    fn merge_inverse(
        &self,
        rules: &RelationRuleRegistry,
        store: &ResourceStore,
        old: Option<&Resource>,
        mut incoming: Resource,
    ) -> Resource {
        let descriptor = store.descriptor();
        let identities = incoming.identities(store.index_fields());
        for relation in rules.inverse_relations_of(descriptor) {
            if !incoming.has_relation(relation) {
                for link in old.map(|o| o.links(relation)).unwrap_or(&[]) {
                    incoming.add_unique(relation, link.clone());
                }
            }
            for identity in identities.iter() {
                for link in self.buffer.take_links(descriptor, identity, relation) {
                    incoming.add_unique(relation, link);
                }
            }
        }
        incoming
    }
}

fn update(rule: &RelationSyncRule, target_ids: Vec<String>, back: Link, operation: RelationOperation, timestamp: i64) -> RelationUpdate {
    RelationUpdate {
        target: rule.target.clone(),
        target_ids,
        binding: RelationBinding { relation: rule.inverse_relation.clone(), links: vec![back] },
        operation,
        timestamp,
    }
}

fn prune_updates(
    rule: &RelationSyncRule,
    descriptor: &EntityDescriptor,
    fields: &[String],
    old: &Resource,
    new: &Resource,
    timestamp: i64,
) -> Result<Vec<RelationUpdate>, CoreError> {
    let current = new.links(&rule.target_relation);
    let stale: Vec<&Link> = old.links(&rule.target_relation).iter().filter(|l| !current.iter().any(|c| c.same_target(l))).collect();
    if stale.is_empty() {
        return Ok(Vec::new());
    }
    let back = new.back_link(descriptor, fields).or_else(|_| old.back_link(descriptor, fields))?;
    stale
        .into_iter()
        .map(|l| -> Result<RelationUpdate, CoreError> {
            Ok(update(rule, vec![l.identity()?], back.clone(), RelationOperation::Delete, timestamp))
        })
        .collect()
}

fn add_updates(
    rule: &RelationSyncRule,
    descriptor: &EntityDescriptor,
    fields: &[String],
    resource: &Resource,
    timestamp: i64,
) -> Result<Vec<RelationUpdate>, CoreError> {
    let links = resource.links(&rule.target_relation);
    if links.is_empty() {
        if rule.is_mandatory() {
            return Err(CoreError::MissingMandatoryLink {
                resource: descriptor.to_string(),
                relation: rule.target_relation.clone(),
            });
        }
        return Ok(Vec::new());
    }
    let take = if rule.is_many_to_many() { links.len() } else { 1 };
    let target_ids = links.iter().take(take).map(|l| l.identity()).collect::<Result<Vec<_>, _>>()?;
    let back = resource.back_link(descriptor, fields)?;
    Ok(vec![update(rule, target_ids, back, RelationOperation::Add, timestamp)])
}

fn rule_error(descriptor: &EntityDescriptor, id: &str, rule: &RelationSyncRule, e: &CoreError) {
    warn!(resource = %descriptor, id = %id, relation = %rule.target_relation, error = %e, "reconciler: rule skipped");
    metrics::counter!("relation_rule_errors_total", 1u64, "kind" => e.kind());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tether_core::Multiplicity;

    fn student_d() -> EntityDescriptor { EntityDescriptor::new("school", "roster", "student") }
    fn class_d() -> EntityDescriptor { EntityDescriptor::new("school", "roster", "class") }

    fn class_rule(target_multiplicity: Multiplicity) -> RelationSyncRule {
        RelationSyncRule {
            target_relation: "class".into(),
            inverse_relation: "student".into(),
            target: class_d(),
            target_multiplicity,
            inverse_multiplicity: Multiplicity::ZeroOrMany,
            is_source: false,
        }
    }

    fn fixture(rule: RelationSyncRule) -> RelationReconciler {
        let rules = RelationRuleRegistry::from_rules(vec![(student_d(), vec![rule])]);
        let fields = vec!["systemid".to_string()];
        let stores = CacheRegistry::new(vec![(student_d(), fields.clone()), (class_d(), fields)]);
        RelationReconciler::new(
            Arc::new(ArcSwap::from_pointee(rules)),
            Arc::new(stores),
            Arc::new(ResourceLocks::new()),
            Arc::new(UnresolvedRelationBuffer::new(Duration::from_secs(60))),
        )
    }

    fn student(id: &str, classes: &[&str]) -> Resource {
        let links: Vec<_> = classes.iter().map(|c| json!({ "href": format!("https://x/school/roster/class/systemid/{}", c) })).collect();
        Resource::from_value(json!({ "systemId": { "value": id }, "_links": { "class": links } })).unwrap()
    }

    fn class(id: &str) -> Resource { Resource::from_value(json!({ "systemId": { "value": id } })).unwrap() }

    #[test]
    fn derives_add_for_first_target_only() {
        let r = fixture(class_rule(Multiplicity::ZeroOrOne));
        let updates = r.reconcile(&student_d(), "1", student("1", &["a", "b"]), 10).unwrap();
        assert_eq!(updates.len(), 1);
        let u = &updates[0];
        assert_eq!(u.operation, RelationOperation::Add);
        assert_eq!(u.target_ids, vec!["systemid/a".to_string()]);
        assert_eq!(u.binding.relation, "student");
        assert_eq!(u.binding.links[0].href, "school/roster/student/systemid/1");
    }

    #[test]
    fn mandatory_rule_failure_does_not_block_write() {
        let r = fixture(class_rule(Multiplicity::One));
        let updates = r.reconcile(&student_d(), "1", student("1", &[]), 10).unwrap();
        assert!(updates.is_empty());
        assert!(r.stores.get(&student_d()).unwrap().get("1").is_some());
    }

    #[test]
    fn dropped_link_is_pruned() {
        let r = fixture(class_rule(Multiplicity::ZeroOrOne));
        r.reconcile(&student_d(), "1", student("1", &["a"]), 10).unwrap();
        let updates = r.reconcile(&student_d(), "1", student("1", &["b"]), 11).unwrap();
        let ops: Vec<(RelationOperation, String)> =
            updates.iter().map(|u| (u.operation, u.target_ids[0].clone())).collect();
        assert_eq!(ops, vec![(RelationOperation::Delete, "systemid/a".into()), (RelationOperation::Add, "systemid/b".into())]);
    }

    #[test]
    fn apply_buffers_then_merges_on_arrival() {
        let r = fixture(class_rule(Multiplicity::ZeroOrOne));
        let updates = r.reconcile(&student_d(), "1", student("1", &["a"]), 10).unwrap();
        assert_eq!(r.apply(&updates[0]), ApplyOutcome::Pending);
        assert_eq!(r.buffer.len(), 1);
        r.reconcile(&class_d(), "c-a", class("a"), 12).unwrap();
        let stored = r.stores.get(&class_d()).unwrap().get("c-a").unwrap();
        assert_eq!(stored.links("student").len(), 1);
        assert!(r.buffer.is_empty());
        // now resolvable and idempotent
        assert_eq!(r.apply(&updates[0]), ApplyOutcome::Applied);
        assert_eq!(r.stores.get(&class_d()).unwrap().get("c-a").unwrap().links("student").len(), 1);
    }

    #[test]
    fn evicted_target_is_not_brought_back() {
        let r = fixture(class_rule(Multiplicity::ZeroOrOne));
        r.reconcile(&class_d(), "c-a", class("a"), 50).unwrap();
        let classes = r.stores.get(&class_d()).unwrap();
        assert_eq!(classes.evict_older_than(100).len(), 1);
        let updates = r.reconcile(&student_d(), "1", student("1", &["a"]), 120).unwrap();
        assert_eq!(r.apply(&updates[0]), ApplyOutcome::Pending);
        assert!(classes.get("c-a").is_none());
        assert_eq!(r.buffer.len(), 1);
    }

    #[test]
    fn inverse_links_survive_resend_without_them() {
        let r = fixture(class_rule(Multiplicity::ZeroOrOne));
        r.reconcile(&class_d(), "c-a", class("a"), 10).unwrap();
        for u in r.reconcile(&student_d(), "1", student("1", &["a"]), 11).unwrap() {
            assert_eq!(r.apply(&u), ApplyOutcome::Applied);
        }
        r.reconcile(&class_d(), "c-a", class("a"), 12).unwrap();
        let stored = r.stores.get(&class_d()).unwrap().get("c-a").unwrap();
        assert_eq!(stored.links("student")[0].identity().unwrap(), "systemid/1");
    }

    #[test]
    fn remove_withdraws_back_links() {
        let r = fixture(class_rule(Multiplicity::ZeroOrOne));
        r.reconcile(&student_d(), "1", student("1", &["a"]), 10).unwrap();
        let updates = r.remove(&student_d(), "1", 11).unwrap();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].operation, RelationOperation::Delete);
        assert!(r.remove(&student_d(), "1", 12).unwrap().is_empty());
        let unknown = EntityDescriptor::new("school", "roster", "teacher");
        assert!(matches!(r.remove(&unknown, "1", 1), Err(CoreError::UnknownResource(_))));
    }

    #[test]
    fn update_for_uncached_type_is_not_local() {
        let r = fixture(class_rule(Multiplicity::ZeroOrOne));
        let u = RelationUpdate {
            target: EntityDescriptor::new("school", "org", "school"),
            target_ids: vec!["systemid/1".into()],
            binding: RelationBinding { relation: "student".into(), links: vec![Link::new("systemid/1")] },
            operation: RelationOperation::Add,
            timestamp: 1,
        };
        assert_eq!(r.apply(&u), ApplyOutcome::NotLocal);
    }
}
