//! RAII guard for detached operation workers.
//!
//! A worker that panics or is cancelled never reaches its own error path.
//! The guard notices on drop and records the failure so the task and the
//! cluster phase do not stay in progress forever.

use std::sync::Arc;

use cluster_core::{EntityPatch, Operation, Phase};
use db::EntityStore;
use events::{Event, EventBus};
use tracing::{debug, error, warn};

use crate::task_tracker::TaskTracker;

const ABORTED_MESSAGE: &str = "Operation terminated unexpectedly";

/// Marks the operation failed on drop unless [`OperationGuard::mark_completed`] was called.
///
/// # Example
///
/// ```ignore
/// let mut guard = OperationGuard::new(cluster_id, Operation::Create, task.clone(), store, bus);
/// // ... drive the operation, including its own error handling ...
/// guard.mark_completed();
/// ```
pub struct OperationGuard {
    cluster_id: String,
    operation: Operation,
    task: TaskTracker,
    entities: Arc<dyn EntityStore>,
    event_bus: Option<EventBus>,
    completed: bool,
}

impl OperationGuard {
    pub fn new(
        cluster_id: impl Into<String>,
        operation: Operation,
        task: TaskTracker,
        entities: Arc<dyn EntityStore>,
        event_bus: Option<EventBus>,
    ) -> Self {
        let cluster_id = cluster_id.into();
        debug!(
            cluster_id = %cluster_id,
            operation = %operation,
            task_id = %task.id(),
            "Operation guard created"
        );

        Self {
            cluster_id,
            operation,
            task,
            entities,
            event_bus,
            completed: false,
        }
    }

    /// The worker reached a terminal outcome on its own, success or failure.
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }

        warn!(
            cluster_id = %self.cluster_id,
            operation = %self.operation,
            task_id = %self.task.id(),
            "Operation worker stopped without completing - marking failed"
        );

        if let Some(bus) = &self.event_bus {
            bus.emit(Event::Error {
                message: ABORTED_MESSAGE.to_string(),
                context: Some(format!("{} {}", self.operation, self.cluster_id)),
            });
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            error!(cluster_id = %self.cluster_id, "No runtime available to record operation failure");
            return;
        };

        let task = self.task.clone();
        let entities = Arc::clone(&self.entities);
        let cluster_id = self.cluster_id.clone();
        let phase = Phase::failed(self.operation);
        runtime.spawn(async move {
            task.fail(ABORTED_MESSAGE, ABORTED_MESSAGE).await;
            let patch = EntityPatch::new().with_phase(phase);
            if let Err(e) = entities.update(&cluster_id, patch).await {
                if !e.is_not_found() {
                    error!(cluster_id = %cluster_id, error = %e, "Failed to mark aborted operation failed");
                }
            }
        });
    }
}
