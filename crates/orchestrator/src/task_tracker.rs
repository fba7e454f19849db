//! Pollable progress records for lifecycle operations.
//!
//! A [`TaskTracker`] is shared between the worker driving an operation and
//! any child workers it spawns. Terminal states are final: once a tracker
//! reaches `Success` or `Error` every further update is ignored, so a racing
//! sibling can never overwrite the outcome.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use cluster_core::{Operation, Task, TaskStatus};
use db::TaskStore;
use events::{Event, EventBus};
use tokio::sync::Mutex;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::Result;

#[derive(Clone)]
pub struct TaskTracker {
    id: Uuid,
    task: Arc<Mutex<Task>>,
    store: Option<Arc<dyn TaskStore>>,
    event_bus: Option<EventBus>,
}

impl TaskTracker {
    pub fn new(task: Task) -> Self {
        Self {
            id: task.id,
            task: Arc::new(Mutex::new(task)),
            store: None,
            event_bus: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn href(&self) -> String {
        format!("/api/tasks/{}", self.id)
    }

    pub async fn snapshot(&self) -> Task {
        self.task.lock().await.clone()
    }

    pub async fn is_terminal(&self) -> bool {
        self.task.lock().await.is_terminal()
    }

    /// Returns `false` without touching anything when the task is already terminal.
    pub async fn update(
        &self,
        status: TaskStatus,
        message: impl Into<String>,
        error_detail: Option<String>,
    ) -> bool {
        let message = message.into();
        let mut task = self.task.lock().await;

        if task.is_terminal() {
            debug!(
                task_id = %self.id,
                current = task.status.as_str(),
                ignored = status.as_str(),
                "Ignoring update of terminal task"
            );
            return false;
        }

        task.status = status;
        task.message = message;
        task.error_detail = error_detail;
        task.updated_at = chrono::Utc::now();

        // Persist while holding the lock so stored updates keep their order.
        if let Some(store) = &self.store {
            if let Err(e) = store.save(&task).await {
                error!(task_id = %self.id, error = %e, "Failed to persist task update");
            }
        }

        if let Some(bus) = &self.event_bus {
            bus.emit(Event::TaskUpdated {
                task_id: task.id,
                cluster_id: task.cluster_id.clone(),
                status: task.status.as_str().to_string(),
                message: task.message.clone(),
            });
        }

        debug!(task_id = %self.id, status = task.status.as_str(), message = %task.message, "Task updated");
        true
    }

    pub async fn running(&self, message: impl Into<String>) -> bool {
        self.update(TaskStatus::Running, message, None).await
    }

    pub async fn succeed(&self, message: impl Into<String>) -> bool {
        self.update(TaskStatus::Success, message, None).await
    }

    pub async fn fail(&self, message: impl Into<String>, error_detail: impl Into<String>) -> bool {
        self.update(TaskStatus::Error, message, Some(error_detail.into()))
            .await
    }
}

impl std::fmt::Debug for TaskTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskTracker").field("id", &self.id).finish()
    }
}

/// Creates trackers and answers polls by task id.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    trackers: Arc<RwLock<HashMap<Uuid, TaskTracker>>>,
    store: Option<Arc<dyn TaskStore>>,
    event_bus: Option<EventBus>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Register a new `Running` task and publish its first state.
    pub async fn start(
        &self,
        operation: Operation,
        cluster_id: Option<String>,
        message: impl Into<String>,
    ) -> TaskTracker {
        let mut task = Task::new(operation, cluster_id);
        task.message = message.into();

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&task).await {
                error!(task_id = %task.id, error = %e, "Failed to persist new task");
            }
        }

        let mut tracker = TaskTracker::new(task);
        if let Some(store) = &self.store {
            tracker = tracker.with_store(Arc::clone(store));
        }
        if let Some(bus) = &self.event_bus {
            tracker = tracker.with_event_bus(bus.clone());
        }

        match self.trackers.write() {
            Ok(mut trackers) => {
                trackers.insert(tracker.id(), tracker.clone());
            }
            Err(_) => warn!(task_id = %tracker.id(), "Task registry lock poisoned; task is only pollable from the store"),
        }

        tracker
    }

    pub fn tracker(&self, id: Uuid) -> Option<TaskTracker> {
        self.trackers
            .read()
            .ok()
            .and_then(|trackers| trackers.get(&id).cloned())
    }

    /// Live snapshot, falling back to the store for tasks of earlier processes.
    pub async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        if let Some(tracker) = self.tracker(id) {
            return Ok(Some(tracker.snapshot().await));
        }
        match &self.store {
            Some(store) => Ok(store.find_by_id(id).await?),
            None => Ok(None),
        }
    }

    /// Drop trackers of finished tasks; stored copies stay pollable.
    pub async fn prune_terminal(&self) -> usize {
        let trackers: Vec<TaskTracker> = match self.trackers.read() {
            Ok(trackers) => trackers.values().cloned().collect(),
            Err(_) => return 0,
        };

        let mut finished = Vec::new();
        for tracker in trackers {
            if tracker.is_terminal().await {
                finished.push(tracker.id());
            }
        }

        if let Ok(mut trackers) = self.trackers.write() {
            for id in &finished {
                trackers.remove(id);
            }
        }
        finished.len()
    }

    pub fn len(&self) -> usize {
        self.trackers.read().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("tracked", &self.len())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemoryStore;

    fn tracker() -> TaskTracker {
        TaskTracker::new(Task::new(Operation::Create, Some("urn:cluster:1".to_string())))
    }

    #[tokio::test]
    async fn test_terminal_update_is_noop() {
        let tracker = tracker();

        assert!(tracker.succeed("Created cluster").await);
        assert!(!tracker.fail("late failure", "boom").await);
        assert!(!tracker.running("still going").await);

        let task = tracker.snapshot().await;
        assert_eq!(task.status, TaskStatus::Success);
        assert_eq!(task.message, "Created cluster");
        assert!(task.error_detail.is_none());
    }

    #[tokio::test]
    async fn test_error_is_final_too() {
        let tracker = tracker();

        assert!(tracker.fail("Failed", "disk full").await);
        assert!(!tracker.succeed("ok").await);
        assert_eq!(tracker.snapshot().await.status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_running_updates_overwrite() {
        let tracker = tracker();

        assert!(tracker.running("Creating control plane").await);
        assert!(tracker.running("Creating workers").await);
        assert_eq!(tracker.snapshot().await.message, "Creating workers");
    }

    #[tokio::test]
    async fn test_racing_terminal_updates_keep_first() {
        let tracker = tracker();
        let a = tracker.clone();
        let b = tracker.clone();

        let (ra, rb) = tokio::join!(a.fail("child a", "x"), b.fail("child b", "y"));
        assert!(ra ^ rb);
        assert_eq!(tracker.snapshot().await.status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn test_update_publishes_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let tracker = tracker().with_event_bus(bus);

        tracker.running("step").await;

        let envelope = rx.recv().await.unwrap();
        assert!(matches!(
            envelope.event,
            Event::TaskUpdated { ref status, .. } if status == "running"
        ));
    }

    #[tokio::test]
    async fn test_registry_get_and_store_fallback() {
        let store = Arc::new(MemoryStore::new());
        let registry = TaskRegistry::new().with_store(store.clone());

        let tracker = registry
            .start(Operation::Delete, Some("urn:cluster:1".to_string()), "Deleting")
            .await;
        tracker.succeed("Deleted").await;

        let polled = registry.get(tracker.id()).await.unwrap().unwrap();
        assert_eq!(polled.status, TaskStatus::Success);

        // A registry of a later process only has the store.
        let later = TaskRegistry::new().with_store(store);
        let stored = later.get(tracker.id()).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Success);
        assert_eq!(stored.message, "Deleted");

        assert!(later.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_prune_terminal() {
        let registry = TaskRegistry::new();
        let done = registry.start(Operation::Create, None, "a").await;
        let _running = registry.start(Operation::Create, None, "b").await;
        done.succeed("ok").await;

        assert_eq!(registry.prune_terminal().await, 1);
        assert_eq!(registry.len(), 1);
        assert!(registry.tracker(done.id()).is_none());
    }
}
