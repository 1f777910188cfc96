//! Delayed redelivery of relation updates that could not be applied yet.
//!
//! One worker task owns the schedule: a min-heap ordered by due time. Producers
//! push under a mutex and wake the worker through a `Notify`. Every queued
//! update carries the sequence number it was enqueued with; the queue keeps
//! the latest sequence per supersede key, so an entry overtaken by a newer
//! operation on the same link (queued or applied directly) is dropped when it
//! comes due.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tether_core::{RelationUpdate, TetherConfig};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{DeadLetter, DeadLetterPublisher, RelationApplier};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub exponential: bool,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self::from_config(&TetherConfig::default()) }
}

impl RetryPolicy {
    pub fn from_config(c: &TetherConfig) -> Self {
        Self {
            initial: Duration::from_millis(c.retry_initial_ms),
            multiplier: c.retry_multiplier,
            exponential: c.retry_exponential,
            max_attempts: c.retry_max_attempts.max(1),
        }
    }

    /// Wait before delivery attempt `attempt` (1-based). Never below 1 ms.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial.as_secs_f64() * 1000.0;
        let ms = if self.exponential {
            base * self.multiplier.powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32)
        } else {
            base
        };
        let ms = if ms.is_finite() { ms.clamp(1.0, u64::MAX as f64) } else { u64::MAX as f64 };
        Duration::from_millis(ms as u64)
    }
}

#[derive(Debug)]
struct Scheduled {
    due: Instant,
    seq: u64,
    attempt: u32,
    key: String,
    update: RelationUpdate,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool { self.due == other.due && self.seq == other.seq }
}
impl Eq for Scheduled {}
impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}
impl Ord for Scheduled {
    fn cmp(&self, other: &Self) -> Ordering { self.due.cmp(&other.due).then(self.seq.cmp(&other.seq)) }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<Scheduled>>,
    latest: FxHashMap<String, u64>,
    next_seq: u64,
}

struct Shared {
    policy: RetryPolicy,
    state: Mutex<QueueState>,
    wake: Notify,
}

/// Cloneable handle; all clones feed the same worker.
#[derive(Clone)]
pub struct RelationRetryQueue {
    shared: Arc<Shared>,
}

impl RelationRetryQueue {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { shared: Arc::new(Shared { policy, state: Mutex::new(QueueState::default()), wake: Notify::new() }) }
    }

    pub fn policy(&self) -> RetryPolicy { self.shared.policy }

    /// Schedules first redelivery of `update`, superseding anything queued for the same key.
    pub fn enqueue(&self, update: RelationUpdate) {
        let key = update.supersede_key();
        let due = Instant::now() + self.shared.policy.delay(1);
        {
            let mut g = self.shared.state.lock();
            let seq = g.next_seq;
            g.next_seq += 1;
            g.latest.insert(key.clone(), seq);
            g.heap.push(Reverse(Scheduled { due, seq, attempt: 1, key, update }));
        }
        self.shared.wake.notify_one();
    }

    /// Marks queued entries for the same key as stale after a direct apply.
    pub fn note_applied(&self, update: &RelationUpdate) {
        let key = update.supersede_key();
        let mut g = self.shared.state.lock();
        if g.latest.remove(&key).is_some() {
            debug!(resource = %update.target, relation = %update.binding.relation, "retry: queued update superseded by direct apply");
        }
    }

    /// Number of live (not superseded) queued updates.
    pub fn len(&self) -> usize { self.shared.state.lock().latest.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Spawns the worker. It runs until `cancel` fires; anything still queued then is dropped.
    pub fn spawn(
        &self,
        applier: Arc<dyn RelationApplier>,
        dead_letter: Arc<dyn DeadLetterPublisher>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                let next_due = shared.state.lock().heap.peek().map(|Reverse(s)| s.due);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = shared.wake.notified() => continue,
                    _ = tokio::time::sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                        for item in take_due(&shared) {
                            deliver(&shared, item, applier.as_ref(), dead_letter.as_ref());
                        }
                    }
                }
            }
            let dropped = shared.state.lock().heap.len();
            info!(dropped, "retry worker stopped");
        })
    }
}

fn take_due(shared: &Shared) -> Vec<Scheduled> {
    let now = Instant::now();
    let mut g = shared.state.lock();
    let mut out = Vec::new();
    while g.heap.peek().map(|Reverse(s)| s.due <= now).unwrap_or(false) {
        if let Some(Reverse(item)) = g.heap.pop() {
            if g.latest.get(&item.key) == Some(&item.seq) {
                out.push(item);
            } else {
                metrics::counter!("relation_retry_total", 1u64, "result" => "superseded");
            }
        }
    }
    out
}

fn deliver(shared: &Shared, item: Scheduled, applier: &dyn RelationApplier, dead_letter: &dyn DeadLetterPublisher) {
    let err = match applier.apply(&item.update) {
        Ok(()) => {
            finish(shared, &item);
            metrics::counter!("relation_retry_total", 1u64, "result" => "success");
            debug!(resource = %item.update.target, attempt = item.attempt, "retry: delivered");
            return;
        }
        Err(e) => e,
    };
    if item.attempt < shared.policy.max_attempts {
        let attempt = item.attempt + 1;
        debug!(resource = %item.update.target, attempt, error = %err, "retry: rescheduled");
        metrics::counter!("relation_retry_total", 1u64, "result" => "retry");
        let due = Instant::now() + shared.policy.delay(attempt);
        shared.state.lock().heap.push(Reverse(Scheduled { due, attempt, ..item }));
        return;
    }
    finish(shared, &item);
    warn!(resource = %item.update.target, attempts = item.attempt, error = %err, "retry: exhausted; dead-lettering");
    metrics::counter!("relation_dead_letter_total", 1u64);
    let letter = DeadLetter { update: item.update, attempts: item.attempt, error: err.to_string() };
    if let Err(e) = dead_letter.dead_letter(letter) {
        warn!(error = %e, "retry: dead-letter publish failed");
    }
}

fn finish(shared: &Shared, item: &Scheduled) {
    let mut g = shared.state.lock();
    if g.latest.get(&item.key) == Some(&item.seq) {
        g.latest.remove(&item.key);
    }
}
