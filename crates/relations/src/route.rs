//! Routing of derived and inbound relation updates: apply locally, wait for a
//! missing target, or hand off to the instance that caches the target type.

use std::sync::Arc;

use anyhow::bail;
use tether_core::RelationUpdate;
use tracing::{debug, warn};

use crate::reconciler::{ApplyOutcome, RelationReconciler};
use crate::retry::RelationRetryQueue;
use crate::{RelationApplier, RelationPublisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Local,
    Buffered,
    Published,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self { Route::Local => "local", Route::Buffered => "buffered", Route::Published => "published" }
    }
}

pub struct RelationRouter {
    reconciler: Arc<RelationReconciler>,
    publisher: Arc<dyn RelationPublisher>,
}

impl RelationRouter {
    pub fn new(reconciler: Arc<RelationReconciler>, publisher: Arc<dyn RelationPublisher>) -> Self {
        Self { reconciler, publisher }
    }

    pub fn route(&self, update: &RelationUpdate) -> anyhow::Result<Route> {
        let route = match self.reconciler.apply(update) {
            ApplyOutcome::Applied => Route::Local,
            ApplyOutcome::Pending => Route::Buffered,
            ApplyOutcome::NotLocal => {
                self.publisher.publish(update.clone())?;
                Route::Published
            }
        };
        metrics::counter!(
            "relation_updates_total", 1u64,
            "op" => update.operation.as_str(), "route" => route.as_str()
        );
        Ok(route)
    }

    /// Routes `update` and schedules a retry when it could not be completed.
    pub fn dispatch(&self, update: RelationUpdate, retry: &RelationRetryQueue) -> Route {
        match self.route(&update) {
            Ok(Route::Buffered) => {
                debug!(resource = %update.target, ids = ?update.target_ids, op = update.operation.as_str(), "router: target not cached; retry scheduled");
                retry.enqueue(update);
                Route::Buffered
            }
            Ok(route) => {
                retry.note_applied(&update);
                route
            }
            Err(e) => {
                warn!(resource = %update.target, error = %e, "router: publish failed; retry scheduled");
                retry.enqueue(update);
                Route::Buffered
            }
        }
    }
}

impl RelationApplier for RelationRouter {
    fn apply(&self, update: &RelationUpdate) -> anyhow::Result<()> {
        match self.route(update)? {
            Route::Buffered => bail!("target {} {:?} not cached", update.target, update.target_ids),
            Route::Local | Route::Published => Ok(()),
        }
    }
}
