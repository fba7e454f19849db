//! Cluster lifecycle state machine.
//!
//! Every mutating operation validates its preconditions synchronously, moves
//! the cluster to `<OP>:IN_PROGRESS`, registers a task and returns. The
//! infrastructure work runs on a detached worker that always ends with the
//! task terminal and the phase `<OP>:SUCCEEDED` or `<OP>:FAILED`.

mod create;
mod delete;
mod nodes;
mod query;
mod resize;
mod upgrade;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use cluster_core::{
    software_string, ClusterEntity, EntityPatch, Node, NodeRole, Operation, Phase, SoftwareStatus,
    Template, TemplateRef,
};
use db::EntityStore;
use events::{Event, EventBus};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::bootstrap::NodeBootstrap;
use crate::config::OrchestratorConfig;
use crate::context::RequestContext;
use crate::error::{OrchestratorError, Result};
use crate::infra::{
    GuestScriptExecutor, InfraProvider, NetworkGateway, NetworkScope, TemplateRegistry, VmGroupRef,
};
use crate::network::NetworkExposure;
use crate::provisioner::NodeProvisioner;
use crate::resources::OperationGuard;
use crate::state_machine::ClusterStateMachine;
use crate::task_tracker::{TaskRegistry, TaskTracker};

pub use resize::ResizePlan;

/// Collaborators shared by every backend.
#[derive(Clone)]
pub struct ServiceDeps {
    pub entities: Arc<dyn EntityStore>,
    pub infra: Arc<dyn InfraProvider>,
    pub guest: Arc<dyn GuestScriptExecutor>,
    pub templates: Arc<dyn TemplateRegistry>,
    pub gateway: Arc<dyn NetworkGateway>,
    pub tasks: TaskRegistry,
    pub event_bus: Option<EventBus>,
}

impl ServiceDeps {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        infra: Arc<dyn InfraProvider>,
        guest: Arc<dyn GuestScriptExecutor>,
        templates: Arc<dyn TemplateRegistry>,
        gateway: Arc<dyn NetworkGateway>,
    ) -> Self {
        Self {
            entities,
            infra,
            guest,
            templates,
            gateway,
            tasks: TaskRegistry::new(),
            event_bus: None,
        }
    }

    pub fn with_tasks(mut self, tasks: TaskRegistry) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }
}

/// Lifecycle engine for one entity schema generation.
pub struct ClusterService<B: NodeBootstrap> {
    bootstrap: Arc<B>,
    entity_type: String,
    entities: Arc<dyn EntityStore>,
    templates: Arc<dyn TemplateRegistry>,
    provisioner: NodeProvisioner,
    exposure: NetworkExposure,
    tasks: TaskRegistry,
    event_bus: Option<EventBus>,
    config: Arc<OrchestratorConfig>,
}

impl<B: NodeBootstrap> Clone for ClusterService<B> {
    fn clone(&self) -> Self {
        Self {
            bootstrap: Arc::clone(&self.bootstrap),
            entity_type: self.entity_type.clone(),
            entities: Arc::clone(&self.entities),
            templates: Arc::clone(&self.templates),
            provisioner: self.provisioner.clone(),
            exposure: self.exposure.clone(),
            tasks: self.tasks.clone(),
            event_bus: self.event_bus.clone(),
            config: Arc::clone(&self.config),
        }
    }
}

impl<B: NodeBootstrap> ClusterService<B> {
    pub fn new(
        bootstrap: B,
        entity_type: impl Into<String>,
        deps: &ServiceDeps,
        config: Arc<OrchestratorConfig>,
    ) -> Self {
        Self {
            bootstrap: Arc::new(bootstrap),
            entity_type: entity_type.into(),
            entities: Arc::clone(&deps.entities),
            templates: Arc::clone(&deps.templates),
            provisioner: NodeProvisioner::new(
                Arc::clone(&deps.infra),
                Arc::clone(&deps.guest),
                Arc::clone(&deps.templates),
                &config,
            ),
            exposure: NetworkExposure::new(Arc::clone(&deps.gateway)),
            tasks: deps.tasks.clone(),
            event_bus: deps.event_bus.clone(),
            config,
        }
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn generation(&self) -> &'static str {
        self.bootstrap.generation()
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }

    fn emit(&self, event: Event) {
        if let Some(bus) = &self.event_bus {
            bus.emit(event);
        }
    }

    /// Validated phase change persisted together with `patch`.
    async fn transition(
        &self,
        entity: &ClusterEntity,
        to: Phase,
        patch: EntityPatch,
    ) -> Result<ClusterEntity> {
        let from = entity.status.phase;
        ClusterStateMachine::validate_transition(&from, &to)?;

        let updated = self.entities.update(&entity.id, patch.with_phase(to)).await?;
        info!(cluster_id = %entity.id, from = %from, to = %to, "Cluster phase changed");
        self.emit(Event::ClusterPhaseChanged {
            cluster_id: entity.id.clone(),
            cluster_name: entity.name.clone(),
            from_phase: from.to_string(),
            to_phase: to.to_string(),
        });
        Ok(updated)
    }

    /// Persist the start of an operation whose task is already registered.
    ///
    /// A failed write ends the task in `Error` so no task stays running
    /// without a worker.
    async fn record_start(
        &self,
        entity: &ClusterEntity,
        to: Phase,
        patch: EntityPatch,
        task: &TaskTracker,
    ) -> Result<ClusterEntity> {
        match self.transition(entity, to, patch).await {
            Ok(updated) => Ok(updated),
            Err(e) => Err(self.abandon_start(&entity.id, to.operation, task, e).await),
        }
    }

    /// Settle an operation that failed before its worker was spawned.
    ///
    /// The task is failed and a phase already moved to `<operation>:IN_PROGRESS`
    /// is recorded as failed. Returns `error` for the caller.
    async fn abandon_start(
        &self,
        cluster_id: &str,
        operation: Operation,
        task: &TaskTracker,
        error: OrchestratorError,
    ) -> OrchestratorError {
        error!(
            cluster_id,
            operation = operation.as_str(),
            error = %error,
            "Failed to record operation start"
        );
        task.fail(
            format!(
                "Error starting {} of cluster {}",
                operation.as_str().to_lowercase(),
                cluster_id
            ),
            error.to_string(),
        )
        .await;

        match self.entities.get(cluster_id).await {
            Ok(current) if current.status.phase == Phase::in_progress(operation) => {
                self.fail_operation(cluster_id, operation).await
            }
            Ok(_) => {}
            Err(e) => warn!(cluster_id, error = %e, "Failed to reload cluster after aborted start"),
        }
        error
    }

    /// Record `<operation>:FAILED`. Errors are logged so they never mask the original failure.
    async fn fail_operation(&self, cluster_id: &str, operation: Operation) {
        let current = match self.entities.get(cluster_id).await {
            Ok(entity) => entity,
            Err(e) => {
                error!(cluster_id, error = %e, "Failed to load cluster while recording failure");
                return;
            }
        };

        let failed = Phase::failed(operation);
        if current.status.phase == failed {
            return;
        }
        if !ClusterStateMachine::can_transition(&current.status.phase, &failed) {
            warn!(
                cluster_id,
                from = %current.status.phase,
                to = %failed,
                "Forcing failed phase outside the regular transitions"
            );
        }

        match self
            .entities
            .update(cluster_id, EntityPatch::new().with_phase(failed))
            .await
        {
            Ok(_) => self.emit(Event::ClusterPhaseChanged {
                cluster_id: cluster_id.to_string(),
                cluster_name: current.name.clone(),
                from_phase: current.status.phase.to_string(),
                to_phase: failed.to_string(),
            }),
            Err(e) => error!(cluster_id, error = %e, "Failed to record failed phase"),
        }
    }

    /// Rewrite `status.nodes` from live infrastructure.
    ///
    /// Without an `external_id`, or when the nodes cannot be read, the stored
    /// entity is returned unchanged.
    async fn sync_entity(&self, cluster_id: &str) -> Result<ClusterEntity> {
        let entity = self.entities.get(cluster_id).await?;
        let Some(external_id) = entity.external_id.clone() else {
            return Ok(entity);
        };

        let group = match self.provisioner.find_group(&external_id).await {
            Ok(group) => group,
            Err(e) => {
                warn!(cluster_id, error = %e, "Failed to resolve VM group during sync");
                return Ok(entity);
            }
        };
        let Some(nodes) = self.provisioner.node_details(&group).await else {
            warn!(cluster_id, "Failed to read node details during sync");
            return Ok(entity);
        };

        let nodes = with_external_endpoint(nodes, entity.status.external_ip.as_deref());
        if nodes == entity.status.nodes {
            return Ok(entity);
        }
        debug!(cluster_id, nodes = nodes.len(), "Synchronized cluster nodes");
        Ok(self
            .entities
            .update(cluster_id, EntityPatch::new().with_nodes(nodes))
            .await?)
    }

    /// Sync on an error path; failures are only logged.
    async fn sync_quietly(&self, cluster_id: &str) {
        if let Err(e) = self.sync_entity(cluster_id).await {
            error!(cluster_id, error = %e, "Failed to synchronize cluster after failure");
        }
    }

    async fn template_for(&self, reference: &TemplateRef) -> Result<Template> {
        self.templates
            .get_template(&reference.name, reference.revision)
            .await?
            .ok_or_else(|| OrchestratorError::InvalidTemplate(reference.to_string()))
    }

    async fn group_for(&self, entity: &ClusterEntity) -> Result<VmGroupRef> {
        let external_id = entity.external_id.as_deref().ok_or_else(|| {
            OrchestratorError::operation(format!(
                "Cluster '{}' ({}) has no backing vApp",
                entity.name, entity.id
            ))
        })?;
        self.provisioner.find_group(external_id).await
    }

    fn control_plane_name(entity: &ClusterEntity) -> Result<String> {
        entity.control_plane().map(|n| n.name.clone()).ok_or_else(|| {
            OrchestratorError::operation(format!(
                "No control plane node found for cluster '{}' ({})",
                entity.name, entity.id
            ))
        })
    }

    fn scope(entity: &ClusterEntity) -> NetworkScope {
        NetworkScope::new(&entity.org_name, &entity.vdc_name, &entity.spec.network)
    }

    /// Run `work` on a detached worker guarded against panics and cancellation.
    fn spawn_operation<F>(
        &self,
        ctx: &RequestContext,
        operation: Operation,
        cluster_id: &str,
        task: &TaskTracker,
        work: F,
    ) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut guard = OperationGuard::new(
            cluster_id,
            operation,
            task.clone(),
            Arc::clone(&self.entities),
            self.event_bus.clone(),
        );
        let span = ctx.operation_span(operation, cluster_id);

        tokio::spawn(
            async move {
                work.await;
                guard.mark_completed();
            }
            .instrument(span),
        )
    }
}

/// The control-plane node of an exposed cluster reports the external address.
fn with_external_endpoint(mut nodes: Vec<Node>, external_ip: Option<&str>) -> Vec<Node> {
    if let Some(ip) = external_ip {
        for node in nodes.iter_mut().filter(|n| n.role == NodeRole::ControlPlane) {
            node.ip = Some(ip.to_string());
        }
    }
    nodes
}

pub fn software_status(template: &Template) -> SoftwareStatus {
    let v = &template.versions;
    SoftwareStatus {
        kubernetes: Some(software_string(&v.kubernetes, &v.kubernetes_version)),
        cni: Some(software_string(&v.cni, &v.cni_version)),
        docker_version: Some(v.docker_version.clone()),
        os: Some(v.os.clone()),
        distribution: Some(template.reference()),
    }
}

/// Metadata tags describing a cluster and the template it runs.
pub fn cluster_metadata(cluster_id: &str, template: &Template) -> BTreeMap<String, String> {
    let v = &template.versions;
    [
        ("cse.cluster.id", cluster_id.to_string()),
        ("cse.version", env!("CARGO_PKG_VERSION").to_string()),
        ("cse.template.name", template.name.clone()),
        ("cse.template.revision", template.revision.to_string()),
        ("cse.os", v.os.clone()),
        ("cse.docker.version", v.docker_version.clone()),
        ("cse.kubernetes", v.kubernetes.clone()),
        ("cse.kubernetes.version", v.kubernetes_version.clone()),
        ("cse.cni", v.cni.clone()),
        ("cse.cni.version", v.cni_version.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}
