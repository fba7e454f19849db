use cluster_core::{
    upgrade_targets, version_of, ClusterEntity, EntityPatch, NodeRole, Operation, Phase, Template,
    TemplateRef, UpgradeDelta,
};
use tracing::{debug, error, info};

use super::{cluster_metadata, software_status, ClusterService};
use crate::backend::ClusterOperation;
use crate::bootstrap::NodeBootstrap;
use crate::context::RequestContext;
use crate::error::{OrchestratorError, Result};
use crate::infra::VmGroupRef;
use crate::provisioner::ScriptKind;
use crate::state_machine::ClusterStateMachine;
use crate::task_tracker::TaskTracker;

impl<B: NodeBootstrap> ClusterService<B> {
    /// Templates the cluster may be upgraded to.
    pub async fn get_upgrade_plan(
        &self,
        _ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<Vec<Template>> {
        let entity = self.entities.get(cluster_id).await?;
        self.upgrade_plan_for(&entity).await
    }

    async fn upgrade_plan_for(&self, entity: &ClusterEntity) -> Result<Vec<Template>> {
        let current = entity
            .status
            .software
            .distribution
            .clone()
            .unwrap_or_else(|| entity.spec.template.clone());
        let templates = self.templates.list_templates().await?;
        Ok(upgrade_targets(&current, &templates))
    }

    pub async fn upgrade_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        target: TemplateRef,
    ) -> Result<ClusterOperation> {
        let entity = self.entities.get(cluster_id).await?;
        ClusterStateMachine::ensure_idle(&entity)?;

        let template = self
            .upgrade_plan_for(&entity)
            .await?
            .into_iter()
            .find(|t| t.reference() == target)
            .ok_or_else(|| OrchestratorError::InvalidUpgradeTarget {
                cluster: entity.name.clone(),
                target: target.to_string(),
            })?;
        let next = ClusterStateMachine::begin(&entity, Operation::Upgrade)?;

        let task = self
            .tasks
            .start(
                Operation::Upgrade,
                Some(entity.id.clone()),
                format!(
                    "Upgrading cluster '{}' ({}) to {}",
                    entity.name, entity.id, target
                ),
            )
            .await;
        let entity = self
            .record_start(&entity, next, EntityPatch::new().with_task_href(task.href()), &task)
            .await?;
        info!(cluster_id = %entity.id, target = %target, "Upgrading cluster");

        let service = self.clone();
        let worker_entity = entity.clone();
        let worker_task = task.clone();
        let handle = self.spawn_operation(ctx, Operation::Upgrade, &entity.id, &task, async move {
            service.run_upgrade(worker_entity, template, worker_task).await;
        });

        Ok(ClusterOperation::new(entity, task, handle))
    }

    async fn run_upgrade(&self, entity: ClusterEntity, target: Template, task: TaskTracker) {
        match self.upgrade_software(&entity, &target, &task).await {
            Ok(message) => {
                info!(cluster_id = %entity.id, target = %target.reference(), "Cluster upgraded");
                task.succeed(message).await;
            }
            Err(e) => {
                error!(cluster_id = %entity.id, error = %e, "Cluster upgrade failed");
                self.fail_operation(&entity.id, Operation::Upgrade).await;
                self.sync_quietly(&entity.id).await;
                task.fail(
                    format!("Error upgrading cluster '{}' ({})", entity.name, entity.id),
                    e.to_string(),
                )
                .await;
            }
        }
    }

    async fn upgrade_software(
        &self,
        entity: &ClusterEntity,
        target: &Template,
        task: &TaskTracker,
    ) -> Result<String> {
        let group = self.group_for(entity).await?;
        let software = &entity.status.software;
        let delta = UpgradeDelta::between(
            software.kubernetes.as_deref().map(version_of).unwrap_or("0"),
            software.cni.as_deref().map(version_of).unwrap_or("0"),
            software.docker_version.as_deref().unwrap_or(""),
            &target.versions,
        )?;
        debug!(
            cluster_id = %entity.id,
            kubernetes = delta.kubernetes,
            docker = delta.docker,
            cni = delta.cni,
            "Computed upgrade steps"
        );

        let control_plane = Self::control_plane_name(entity)?;
        let workers = entity.node_names(NodeRole::Worker);
        let scripts = self.provisioner.scripts();

        if delta.kubernetes {
            task.running(format!(
                "Upgrading Kubernetes on control plane node {}",
                control_plane
            ))
            .await;
            let script = scripts
                .versioned(target, ScriptKind::ControlPlaneKubernetesUpgrade)
                .await?;
            self.upgrade_node(&group, &control_plane, &control_plane, &script)
                .await?;

            let script = scripts
                .versioned(target, ScriptKind::WorkerKubernetesUpgrade)
                .await?;
            for worker in &workers {
                task.running(format!("Upgrading Kubernetes on worker node {}", worker))
                    .await;
                self.upgrade_node(&group, &control_plane, worker, &script)
                    .await?;
            }
        }

        let kubernetes_nodes: Vec<String> = std::iter::once(control_plane.clone())
            .chain(workers.iter().cloned())
            .collect();

        if delta.needs_drain_all() {
            task.running("Draining all kubernetes nodes").await;
            self.provisioner
                .drain_nodes(&group, &control_plane, &kubernetes_nodes)
                .await?;

            if delta.docker {
                task.running("Upgrading Docker on all kubernetes nodes").await;
                let script = scripts.versioned(target, ScriptKind::DockerUpgrade).await?;
                self.provisioner
                    .run_on_nodes(&group, &kubernetes_nodes, &script)
                    .await?;
            }

            if delta.cni {
                task.running(format!("Applying CNI on control plane node {}", control_plane))
                    .await;
                let script = scripts.versioned(target, ScriptKind::CniApply).await?;
                self.provisioner
                    .run_on_nodes(&group, std::slice::from_ref(&control_plane), &script)
                    .await?;
            }
        }

        // Also recovers nodes left cordoned by an earlier interrupted upgrade.
        task.running("Uncordoning all kubernetes nodes").await;
        self.provisioner
            .uncordon_nodes(&group, &control_plane, &kubernetes_nodes)
            .await?;

        self.provisioner
            .set_metadata(&group, &cluster_metadata(&entity.id, target))
            .await?;

        let current = self.entities.get(&entity.id).await?;
        let mut spec = current.spec.clone();
        spec.template = target.reference();
        self.transition(
            &current,
            Phase::succeeded(Operation::Upgrade),
            EntityPatch::new()
                .with_software(software_status(target))
                .with_spec(spec),
        )
        .await?;

        Ok(format!(
            "Upgraded cluster '{}' ({}) to {}",
            entity.name,
            entity.id,
            target.reference()
        ))
    }

    /// Drain, run `script` on, then uncordon a single node.
    async fn upgrade_node(
        &self,
        group: &VmGroupRef,
        control_plane: &str,
        node: &str,
        script: &str,
    ) -> Result<()> {
        let nodes = [node.to_string()];
        self.provisioner
            .drain_nodes(group, control_plane, &nodes)
            .await?;
        self.provisioner.run_on_nodes(group, &nodes, script).await?;
        self.provisioner
            .uncordon_nodes(group, control_plane, &nodes)
            .await
    }
}
