use std::sync::{Arc, RwLock};
use std::time::Duration;

use db::{EntityStore, TaskStore};
use events::EventBus;
use orchestrator::{BackendFactory, OrchestratorConfig, ServiceDeps, SimulatedCloud, TaskRegistry};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::ServerConfig;
use crate::routes::events::{EventBuffer, SharedEventBuffer, DEFAULT_EVENT_BUFFER_SIZE};

#[derive(Clone)]
pub struct AppState {
    pub factory: BackendFactory,
    pub tasks: TaskRegistry,
    pub event_bus: EventBus,
    pub event_buffer: SharedEventBuffer,
}

impl AppState {
    /// `event_bus` must be the bus the factory's backends publish to.
    pub fn new(factory: BackendFactory, event_bus: EventBus) -> Self {
        Self {
            tasks: factory.tasks().clone(),
            factory,
            event_bus,
            event_buffer: Arc::new(RwLock::new(EventBuffer::new(DEFAULT_EVENT_BUFFER_SIZE))),
        }
    }

    /// State over the in-process simulated infrastructure.
    pub fn simulated(
        entities: Arc<dyn EntityStore>,
        task_store: Arc<dyn TaskStore>,
        server_config: &ServerConfig,
        orchestrator_config: OrchestratorConfig,
    ) -> orchestrator::Result<Self> {
        let event_bus = EventBus::new();
        let cloud = Arc::new(
            SimulatedCloud::new().with_external_ips(server_config.external_ips.iter().cloned()),
        );
        let tasks = TaskRegistry::new()
            .with_store(task_store)
            .with_event_bus(event_bus.clone());

        let deps = ServiceDeps::new(
            entities,
            cloud.clone(),
            cloud.clone(),
            Arc::new(server_config.template_catalog()),
            cloud,
        )
        .with_tasks(tasks)
        .with_event_bus(event_bus.clone());

        let factory = BackendFactory::new(deps, orchestrator_config)?;
        Ok(Self::new(factory, event_bus))
    }

    /// Periodically forget finished tasks; stored copies stay pollable.
    pub fn spawn_task_pruner(&self, interval: Duration) -> JoinHandle<()> {
        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pruned = tasks.prune_terminal().await;
                if pruned > 0 {
                    debug!(pruned, remaining = tasks.len(), "Pruned finished tasks");
                }
            }
        })
    }
}
