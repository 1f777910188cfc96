//! Tether relations: derivation, application, buffering and retry of
//! cross-resource relation updates.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tether_core::RelationUpdate;

pub mod buffer;
pub mod reconciler;
pub mod retry;
pub mod route;

pub use buffer::UnresolvedRelationBuffer;
pub use reconciler::{ApplyOutcome, RelationReconciler};
pub use retry::{RelationRetryQueue, RetryPolicy};
pub use route::{RelationRouter, Route};

/// Outbound sink for updates whose target type is cached elsewhere.
pub trait RelationPublisher: Send + Sync {
    fn publish(&self, update: RelationUpdate) -> anyhow::Result<()>;
}

/// An update the retry queue gave up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub update: RelationUpdate,
    pub attempts: u32,
    pub error: String,
}

pub trait DeadLetterPublisher: Send + Sync {
    fn dead_letter(&self, letter: DeadLetter) -> anyhow::Result<()>;
}

/// Redelivery target used by the retry worker. An error means "try again later".
pub trait RelationApplier: Send + Sync {
    fn apply(&self, update: &RelationUpdate) -> anyhow::Result<()>;
}
