//! Tether pipeline façade (in-process).
//!
//! Two entry points feed the caches: entity events (upsert/delete plus
//! optional sync metadata) and relation update events addressed to this
//! component. Reads go through the same façade.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tether_core::{
    now_millis, CoreError, EntityDescriptor, EntityEvent, RelationUpdate, RelationUpdateEvent, Resource, TetherConfig,
};
use tether_relations::{
    DeadLetterPublisher, RelationApplier, RelationPublisher, RelationReconciler, RelationRetryQueue, RelationRouter,
    RetryPolicy, Route, UnresolvedRelationBuffer,
};
use tether_schema::{RelationRuleRegistry, RuleSource, SchemaFile};
use tether_store::{CacheRegistry, FieldQuery, ResourceLocks, ResourceStore};
use tether_sync::{SessionStatus, SyncOutcome, SyncSessionTracker};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod channel;

pub use channel::{spawn_consumers, ChannelPublisher, Consumers};

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum TetherError {
    #[error("conversion: {0}")]
    Conversion(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("ignored: {0}")]
    Ignored(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type TetherResult<T> = Result<T, TetherError>;

impl From<CoreError> for TetherError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Conversion(m) => TetherError::Conversion(m),
            CoreError::UnknownResource(d) => TetherError::NotFound(format!("no store for {}", d)),
            other => TetherError::Validation(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for TetherError {
    fn from(e: anyhow::Error) -> Self { TetherError::Internal(e.to_string()) }
}

/// What one entity event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityOutcome {
    /// Relation updates derived from the write (or delete).
    pub derived: usize,
    pub sync: Option<SyncOutcome>,
    /// Entries evicted because this event completed a FULL run.
    pub evicted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub resource: String,
    pub entries: usize,
    pub last_updated: i64,
}

/// Runtime counters and configuration exposed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Stats {
    pub stores: Vec<StoreStats>,
    pub rules: usize,
    pub buffered_links: usize,
    pub retry_pending: usize,
    pub lock_entries: usize,
    pub sessions: Vec<SessionStatus>,
    pub config: Option<TetherConfig>,
}

pub struct Pipeline {
    config: TetherConfig,
    stores: Arc<CacheRegistry>,
    rules: Arc<ArcSwap<RelationRuleRegistry>>,
    locks: Arc<ResourceLocks>,
    buffer: Arc<UnresolvedRelationBuffer>,
    reconciler: Arc<RelationReconciler>,
    router: Arc<RelationRouter>,
    retry: RelationRetryQueue,
    sync: SyncSessionTracker,
}

impl Pipeline {
    /// Pipeline over `stores` with no relation rules yet; see `install_rules`.
    pub fn new(config: TetherConfig, stores: CacheRegistry, publisher: Arc<dyn RelationPublisher>) -> Self {
        let stores = Arc::new(stores);
        let rules = Arc::new(ArcSwap::from_pointee(RelationRuleRegistry::empty()));
        let locks = Arc::new(ResourceLocks::new());
        let buffer = Arc::new(UnresolvedRelationBuffer::new(config.buffer_retention()));
        let reconciler = Arc::new(RelationReconciler::new(
            Arc::clone(&rules),
            Arc::clone(&stores),
            Arc::clone(&locks),
            Arc::clone(&buffer),
        ));
        let router = Arc::new(RelationRouter::new(Arc::clone(&reconciler), publisher));
        let retry = RelationRetryQueue::new(RetryPolicy::from_config(&config));
        Self { config, stores, rules, locks, buffer, reconciler, router, retry, sync: SyncSessionTracker::new() }
    }

    /// Caches every schema type of the configured component and installs the schema's rules.
    pub fn from_schema(config: TetherConfig, schema: &SchemaFile, publisher: Arc<dyn RelationPublisher>) -> anyhow::Result<Self> {
        let stores = CacheRegistry::new(schema.cached_types(&config.domain, &config.package));
        let me = Self::new(config, stores, publisher);
        me.install_rules(schema)?;
        Ok(me)
    }

    /// Queries `source` once and swaps in the resulting registry.
    pub fn install_rules(&self, source: &dyn RuleSource) -> anyhow::Result<usize> {
        let registry = RelationRuleRegistry::from_source(source)?;
        let n = registry.rule_count();
        self.rules.store(Arc::new(registry));
        Ok(n)
    }

    pub fn config(&self) -> &TetherConfig { &self.config }
    pub fn rules(&self) -> Arc<RelationRuleRegistry> { self.rules.load_full() }
    pub fn descriptors(&self) -> Vec<EntityDescriptor> { self.stores.descriptors() }

    /// Starts redelivery of relation updates whose targets were missing.
    pub fn spawn_retry_worker(&self, dead_letter: Arc<dyn DeadLetterPublisher>, cancel: CancellationToken) -> JoinHandle<()> {
        let applier: Arc<dyn RelationApplier> = Arc::clone(&self.router) as Arc<dyn RelationApplier>;
        self.retry.spawn(applier, dead_letter, cancel)
    }

    fn store(&self, descriptor: &EntityDescriptor) -> TetherResult<&Arc<ResourceStore>> {
        self.stores.get(descriptor).ok_or_else(|| TetherError::NotFound(format!("no store for {}", descriptor)))
    }

    /// Writes (or deletes) the resource, dispatches the relation updates it
    /// implies and advances its sync run. An unconvertible payload is skipped
    /// without any write, but still counts towards its run so the run can
    /// complete; the conversion error is returned afterwards.
    pub fn process_entity_event(&self, event: EntityEvent) -> TetherResult<EntityOutcome> {
        let t0 = Instant::now();
        let d = event.resource_type;
        self.store(&d)?;
        let written = match event.resource {
            Some(raw) => match Resource::from_value(raw) {
                Ok(resource) => Ok(self.reconciler.reconcile(&d, &event.id, resource, event.timestamp)?),
                Err(e) => {
                    warn!(resource = %d, id = %event.id, error = %e, "pipeline: event skipped");
                    metrics::counter!("pipeline_events_skipped_total", 1u64, "kind" => e.kind());
                    Err(e)
                }
            },
            None => Ok(self.reconciler.remove(&d, &event.id, event.timestamp)?),
        };
        let (derived, skipped) = match written {
            Ok(updates) => {
                let n = updates.len();
                self.dispatch_all(updates);
                (n, None)
            }
            Err(e) => (0, Some(e)),
        };

        let sync = event.sync.as_ref().map(|meta| self.sync.record(&d, meta, event.timestamp));
        let evicted = match &sync {
            Some(SyncOutcome::Completed { evict_before: Some(cutoff) }) => self.evict(&d, *cutoff)?,
            _ => 0,
        };
        metrics::histogram!("pipeline_event_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => "entity");
        debug!(resource = %d, id = %event.id, derived, evicted, sync = ?sync, "pipeline: entity event processed");
        if let Some(e) = skipped {
            return Err(e.into());
        }
        Ok(EntityOutcome { derived, sync, evicted })
    }

    pub fn process_relation_update_event(&self, event: RelationUpdateEvent) -> TetherResult<Route> {
        let t0 = Instant::now();
        let mut update = event.update;
        let c = &self.config;
        if !c.domain.is_empty() && !update.target.same_component(&c.domain, &c.package) {
            return Err(TetherError::Ignored(format!("{} is not served by {}/{}", update.target, c.domain, c.package)));
        }
        if !c.org_id.is_empty() && event.org_id != c.org_id {
            return Err(TetherError::Ignored(format!("org {} is not {}", event.org_id, c.org_id)));
        }
        self.store(&update.target)?;
        if update.timestamp == 0 {
            update.timestamp = now_millis();
        }
        let route = self.router.dispatch(update, &self.retry);
        metrics::histogram!("pipeline_event_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => "relation");
        Ok(route)
    }

    fn dispatch_all(&self, updates: Vec<RelationUpdate>) {
        for update in updates {
            self.router.dispatch(update, &self.retry);
        }
    }

    pub fn get(&self, descriptor: &EntityDescriptor, id: &str) -> TetherResult<Arc<Resource>> {
        self.store(descriptor)?.get(id).ok_or_else(|| TetherError::NotFound(format!("{} {}", descriptor, id)))
    }

    pub fn get_by_index_field(&self, descriptor: &EntityDescriptor, field: &str, value: &str) -> TetherResult<Arc<Resource>> {
        self.store(descriptor)?
            .get_by_index_field(field, value)
            .ok_or_else(|| TetherError::NotFound(format!("{} {}={}", descriptor, field, value)))
    }

    pub fn list<F>(&self, descriptor: &EntityDescriptor, size: usize, offset: usize, since: i64, filter: F) -> TetherResult<Vec<Arc<Resource>>>
    where
        F: Fn(&Resource) -> bool,
    {
        Ok(self.store(descriptor)?.list(size, offset, since, filter))
    }

    /// `list` filtered by a `FieldQuery` string.
    pub fn search(&self, descriptor: &EntityDescriptor, query: &str, size: usize, offset: usize, since: i64) -> TetherResult<Vec<Arc<Resource>>> {
        let q = FieldQuery::parse(query);
        self.list(descriptor, size, offset, since, |r| q.matches(r))
    }

    /// Evicts entries written before `cutoff` and withdraws their links from related resources.
    pub fn evict(&self, descriptor: &EntityDescriptor, cutoff: i64) -> TetherResult<usize> {
        let evicted = self.store(descriptor)?.evict_older_than(cutoff);
        let n = evicted.len();
        for (id, resource) in evicted {
            debug!(resource = %descriptor, id = %id, "pipeline: withdrawing links of evicted entry");
            self.dispatch_all(self.reconciler.removal_updates(descriptor, &resource, cutoff));
        }
        if n > 0 {
            info!(resource = %descriptor, evicted = n, cutoff, "pipeline: stale entries evicted");
        }
        Ok(n)
    }

    /// Purges unresolved links older than the retention period.
    pub fn clean_up_buffer(&self) -> usize { self.buffer.clean_up(now_millis()) }

    pub fn stats(&self) -> Stats {
        let stores = self
            .stores
            .descriptors()
            .into_iter()
            .filter_map(|d| {
                self.stores.get(&d).map(|s| StoreStats { resource: d.to_string(), entries: s.len(), last_updated: s.last_updated() })
            })
            .collect();
        Stats {
            stores,
            rules: self.rules.load().rule_count(),
            buffered_links: self.buffer.len(),
            retry_pending: self.retry.len(),
            lock_entries: self.locks.len(),
            sessions: self.sync.active_sessions(),
            config: Some(self.config.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_api_errors() {
        assert!(matches!(TetherError::from(CoreError::Conversion("x".into())), TetherError::Conversion(_)));
        assert!(matches!(TetherError::from(CoreError::UnknownResource("a/b/c".into())), TetherError::NotFound(_)));
        assert!(matches!(TetherError::from(CoreError::InvalidLinkFormat("x".into())), TetherError::Validation(_)));
    }

    #[test]
    fn errors_serialize_for_transport() {
        let v = serde_json::to_value(TetherError::Ignored("org".into())).unwrap();
        assert_eq!(v, serde_json::json!({ "Ignored": "org" }));
        assert_eq!(TetherError::NotFound("x".into()).to_string(), "not_found: x");
    }
}
