//! Tether sync: tracks FULL/DELTA/DELETE synchronization runs and reports
//! when a FULL run has completed and stale entries may be evicted.
//!
//! FULL sessions are keyed by resource type, one at a time. DELTA and DELETE
//! sessions are keyed by resource type, sync type and correlation id, so any
//! number of them may run side by side.

#![forbid(unsafe_code)]

use std::collections::VecDeque;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tether_core::{EntityDescriptor, SyncMetadata, SyncType};
use tracing::{debug, info, warn};

pub mod state;

pub use state::{SyncInput, SyncPhase, SyncProgress, SyncState};

/// Superseded FULL correlation ids remembered per resource type.
const SUPERSEDED_KEEP: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SyncKey {
    Full(EntityDescriptor),
    Partial { resource: EntityDescriptor, sync_type: SyncType, correlation_id: String },
}

impl SyncKey {
    pub fn for_event(resource: &EntityDescriptor, meta: &SyncMetadata) -> Self {
        match meta.sync_type {
            SyncType::Full => SyncKey::Full(resource.clone()),
            t => SyncKey::Partial {
                resource: resource.clone(),
                sync_type: t,
                correlation_id: meta.correlation_id.clone(),
            },
        }
    }

    pub fn sync_type(&self) -> SyncType {
        match self { SyncKey::Full(_) => SyncType::Full, SyncKey::Partial { sync_type, .. } => *sync_type }
    }
}

impl std::fmt::Display for SyncKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncKey::Full(d) => write!(f, "full:{}", d),
            SyncKey::Partial { resource, sync_type, correlation_id } => {
                write!(f, "{}:{}:{}", sync_type.as_str(), resource, correlation_id)
            }
        }
    }
}

/// Result of recording one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Started,
    Incremented,
    /// `evict_before` is set for FULL runs: entries older than it were not part of the run.
    Completed { evict_before: Option<i64> },
    ResourceNameChanged,
    TotalSizeChanged,
    /// A new FULL run replaced the one carrying `superseded`; the new one has started.
    ConcurrentFullSync { superseded: String },
    /// Event belongs to a FULL run that has already been superseded.
    Rejected,
    /// Event belongs to a failed run; counted but not reported further.
    Untracked,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Started => "started",
            SyncOutcome::Incremented => "incremented",
            SyncOutcome::Completed { .. } => "completed",
            SyncOutcome::ResourceNameChanged => "resource_name_changed",
            SyncOutcome::TotalSizeChanged => "total_size_changed",
            SyncOutcome::ConcurrentFullSync { .. } => "concurrent_full_sync",
            SyncOutcome::Rejected => "rejected",
            SyncOutcome::Untracked => "untracked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub key: String,
    pub phase: SyncPhase,
    pub correlation_id: String,
    pub processed: u64,
    pub total_size: u64,
    pub started_at: i64,
}

#[derive(Default)]
struct Sessions {
    active: FxHashMap<SyncKey, SyncState>,
    superseded: FxHashMap<EntityDescriptor, VecDeque<String>>,
}

#[derive(Default)]
pub struct SyncSessionTracker {
    inner: Mutex<Sessions>,
}

impl SyncSessionTracker {
    pub fn new() -> Self { Self::default() }

    pub fn record(&self, resource: &EntityDescriptor, meta: &SyncMetadata, timestamp: i64) -> SyncOutcome {
        let outcome = self.transition(resource, meta, timestamp);
        metrics::counter!("sync_events_total", 1u64, "outcome" => outcome.as_str(), "type" => meta.sync_type.as_str());
        outcome
    }

    fn transition(&self, resource: &EntityDescriptor, meta: &SyncMetadata, timestamp: i64) -> SyncOutcome {
        let key = SyncKey::for_event(resource, meta);
        let input = SyncInput {
            resource: resource.name(),
            correlation_id: &meta.correlation_id,
            total_size: meta.total_size,
            timestamp,
        };
        let mut g = self.inner.lock();
        let mut replaced = None;
        if let SyncKey::Full(d) = &key {
            if g.superseded.get(d).map(|ids| ids.contains(&meta.correlation_id)).unwrap_or(false) {
                debug!(resource = %d, correlation_id = %meta.correlation_id, "sync: event from superseded full run");
                return SyncOutcome::Rejected;
            }
            let running = g.active.get(&key).and_then(|s| s.progress()).map(|p| p.correlation_id.clone());
            if let Some(old_id) = running.filter(|id| id != &meta.correlation_id) {
                if let Some(old) = g.active.remove(&key) {
                    let old = old.into_concurrent();
                    warn!(resource = %d, superseded = %old_id, correlation_id = %meta.correlation_id,
                        processed = old.progress().map(|p| p.processed).unwrap_or(0), "sync: concurrent full sync; older run dropped");
                }
                let ids = g.superseded.entry(d.clone()).or_default();
                ids.push_back(old_id.clone());
                while ids.len() > SUPERSEDED_KEEP {
                    ids.pop_front();
                }
                replaced = Some(old_id);
            }
        }

        let prev = g.active.remove(&key).unwrap_or(SyncState::Init);
        let fresh = matches!(prev, SyncState::Init);
        let next = prev.next(input);
        let outcome = match &next {
            SyncState::Completed(p) => {
                let evict_before = matches!(key, SyncKey::Full(_)).then_some(p.started_at);
                info!(session = %key, processed = p.processed, started_at = p.started_at, "sync: run completed");
                return SyncOutcome::Completed { evict_before };
            }
            SyncState::InProgress(_) if fresh => SyncOutcome::Started,
            SyncState::InProgress(_) => SyncOutcome::Incremented,
            SyncState::ResourceNameChanged(p) => {
                warn!(session = %key, expected = %p.resource, got = %resource.name(), "sync: resource changed within run");
                SyncOutcome::ResourceNameChanged
            }
            SyncState::TotalSizeChanged(p) => {
                warn!(session = %key, expected = p.total_size, got = meta.total_size, "sync: total size changed within run");
                SyncOutcome::TotalSizeChanged
            }
            SyncState::FailedAndUntracked(p) | SyncState::ConcurrentFullSync(p) => {
                if p.processed >= p.total_size {
                    debug!(session = %key, "sync: failed run drained");
                    return SyncOutcome::Untracked;
                }
                SyncOutcome::Untracked
            }
            SyncState::Init => SyncOutcome::Untracked,
        };
        g.active.insert(key, next);
        match replaced {
            Some(superseded) => SyncOutcome::ConcurrentFullSync { superseded },
            None => outcome,
        }
    }

    /// Snapshot of every tracked run, ordered by key.
    pub fn active_sessions(&self) -> Vec<SessionStatus> {
        let g = self.inner.lock();
        let mut keyed: Vec<(&SyncKey, &SyncState)> = g.active.iter().collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));
        keyed
            .into_iter()
            .filter_map(|(k, s)| {
                s.progress().map(|p| SessionStatus {
                    key: k.to_string(),
                    phase: s.phase(),
                    correlation_id: p.correlation_id.clone(),
                    processed: p.processed,
                    total_size: p.total_size,
                    started_at: p.started_at,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize { self.inner.lock().active.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
