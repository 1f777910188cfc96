//! Channel adapters: tokio mpsc publishers for outbound relation updates and
//! dead letters, and consumer loops feeding inbound events into a pipeline.

use std::sync::Arc;

use anyhow::anyhow;
use tether_core::{EntityEvent, RelationUpdate, RelationUpdateEvent};
use tether_relations::{DeadLetter, DeadLetterPublisher, RelationPublisher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{Pipeline, TetherError};

/// Bounded mpsc sender usable from synchronous code. A full or closed channel
/// is reported as an error so the caller can retry.
pub struct ChannelPublisher<T> {
    tx: mpsc::Sender<T>,
}

impl<T> ChannelPublisher<T> {
    pub fn new(cap: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(cap.max(1));
        (Self { tx }, rx)
    }

    fn send(&self, item: T) -> anyhow::Result<()> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow!("outbound channel full"),
            mpsc::error::TrySendError::Closed(_) => anyhow!("outbound channel closed"),
        })
    }
}

impl RelationPublisher for ChannelPublisher<RelationUpdate> {
    fn publish(&self, update: RelationUpdate) -> anyhow::Result<()> { self.send(update) }
}

impl DeadLetterPublisher for ChannelPublisher<DeadLetter> {
    fn dead_letter(&self, letter: DeadLetter) -> anyhow::Result<()> { self.send(letter) }
}

pub struct Consumers {
    pub entities: mpsc::Sender<EntityEvent>,
    pub relations: mpsc::Sender<RelationUpdateEvent>,
    loops: Vec<JoinHandle<()>>,
    cleanup: JoinHandle<()>,
    cancel: CancellationToken,
}

impl Consumers {
    /// Closes both inbound channels, waits for the loops to drain what is
    /// already queued, then stops the cleanup task.
    pub async fn shutdown(self) {
        drop(self.entities);
        drop(self.relations);
        for t in self.loops {
            let _ = t.await;
        }
        self.cancel.cancel();
        let _ = self.cleanup.await;
    }
}

/// Spawns one consumer loop per event kind plus the periodic buffer cleanup.
/// Loops end when their channel closes or `cancel` fires.
pub fn spawn_consumers(pipeline: Arc<Pipeline>, cap: usize, cancel: CancellationToken) -> Consumers {
    let (entity_tx, mut entity_rx) = mpsc::channel::<EntityEvent>(cap.max(1));
    let (relation_tx, mut relation_rx) = mpsc::channel::<RelationUpdateEvent>(cap.max(1));
    let cancel = cancel.child_token();
    let mut loops = Vec::with_capacity(2);

    loops.push(tokio::spawn({
        let (pipeline, cancel) = (Arc::clone(&pipeline), cancel.clone());
        async move {
            let mut processed = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = entity_rx.recv() => {
                        let Some(event) = maybe else { break };
                        processed += 1;
                        if let Err(e) = pipeline.process_entity_event(event) {
                            log_error("entity", &e);
                        }
                    }
                }
            }
            info!(processed, "entity consumer stopped");
        }
    }));

    loops.push(tokio::spawn({
        let (pipeline, cancel) = (Arc::clone(&pipeline), cancel.clone());
        async move {
            let mut processed = 0u64;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    maybe = relation_rx.recv() => {
                        let Some(event) = maybe else { break };
                        processed += 1;
                        if let Err(e) = pipeline.process_relation_update_event(event) {
                            log_error("relation", &e);
                        }
                    }
                }
            }
            info!(processed, "relation consumer stopped");
        }
    }));

    let cleanup = tokio::spawn({
        let every = pipeline.config().buffer_cleanup_interval();
        let cancel = cancel.clone();
        async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = pipeline.clean_up_buffer();
                        debug!(removed, "buffer cleanup tick");
                    }
                }
            }
        }
    });

    Consumers { entities: entity_tx, relations: relation_tx, loops, cleanup, cancel }
}

fn log_error(kind: &'static str, e: &TetherError) {
    match e {
        TetherError::Ignored(m) => debug!(kind, reason = %m, "consumer: event ignored"),
        other => warn!(kind, error = %other, "consumer: event failed"),
    }
}
