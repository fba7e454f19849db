use cluster_core::{
    ClusterEntity, EntityPatch, NodeRole, Operation, Phase, TaskStatus, Template,
};
use events::Event;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::ClusterService;
use crate::backend::ClusterOperation;
use crate::bootstrap::{BootstrapContext, NodeBootstrap};
use crate::context::RequestContext;
use crate::error::{OrchestratorError, Result};
use crate::infra::VmGroupRef;
use crate::network::rewrite_kubeconfig_endpoint;
use crate::provisioner::NodeRequest;
use crate::requests::ResizeRequest;
use crate::state_machine::ClusterStateMachine;
use crate::task_tracker::TaskTracker;

/// Node additions, removals and exposure change derived from a resize request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizePlan {
    pub desired_workers: u32,
    pub desired_nfs: u32,
    pub workers_to_add: u32,
    pub nfs_to_add: u32,
    /// Nodes removed, taken from the tail of each pool.
    pub nodes_to_remove: Vec<String>,
    pub unexpose: bool,
}

impl ResizePlan {
    /// Validate `request` against the live topology of `entity`.
    ///
    /// Rejects negative counts, nfs scale-down unless allowed, simultaneous
    /// shrinking of both pools and requests that change nothing.
    pub fn compute(
        entity: &ClusterEntity,
        request: &ResizeRequest,
        allow_nfs_scale_down: bool,
    ) -> Result<Self> {
        let workers = entity.node_names(NodeRole::Worker);
        let nfs = entity.node_names(NodeRole::Nfs);
        let current_workers = workers.len() as u32;
        let current_nfs = nfs.len() as u32;

        let (desired_workers, desired_nfs) =
            request.desired_counts(current_workers, current_nfs)?;

        if desired_nfs < current_nfs && !allow_nfs_scale_down {
            return Err(OrchestratorError::invalid_request(
                "Scaling down nfs nodes is not supported",
            ));
        }
        if desired_workers < current_workers && desired_nfs < current_nfs {
            return Err(OrchestratorError::invalid_request(
                "Cannot scale down worker and nfs nodes in the same request",
            ));
        }
        if request.expose == Some(true) && !entity.status.exposed {
            return Err(OrchestratorError::invalid_request(format!(
                "Exposing existing cluster '{}' is not supported",
                entity.name
            )));
        }

        let unexpose = entity.status.exposed && request.expose == Some(false);
        if !unexpose && desired_workers == current_workers && desired_nfs == current_nfs {
            return Err(OrchestratorError::invalid_request(format!(
                "cluster '{}' already has {} workers and {} nfs nodes and is already not exposed",
                entity.name, current_workers, current_nfs
            )));
        }

        let nodes_to_remove = workers
            .into_iter()
            .skip(desired_workers as usize)
            .chain(nfs.into_iter().skip(desired_nfs as usize))
            .collect();

        Ok(Self {
            desired_workers,
            desired_nfs,
            workers_to_add: desired_workers.saturating_sub(current_workers),
            nfs_to_add: desired_nfs.saturating_sub(current_nfs),
            nodes_to_remove,
            unexpose,
        })
    }

    pub fn adds_nodes(&self) -> bool {
        self.workers_to_add > 0 || self.nfs_to_add > 0
    }

    pub fn removes_nodes(&self) -> bool {
        !self.nodes_to_remove.is_empty()
    }
}

impl<B: NodeBootstrap> ClusterService<B> {
    pub async fn resize_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: ResizeRequest,
    ) -> Result<ClusterOperation> {
        request.check_pool_limits(self.config.max_nodes_per_pool)?;
        let entity = self.entities.get(cluster_id).await?;
        let plan = ResizePlan::compute(&entity, &request, self.config.allow_nfs_scale_down)?;
        let next = ClusterStateMachine::begin(&entity, Operation::Update)?;

        let mut spec = entity.spec.clone();
        spec.workers.count = plan.desired_workers;
        spec.nfs.count = plan.desired_nfs;
        if plan.unexpose {
            spec.expose = false;
        }

        let task = self
            .tasks
            .start(
                Operation::Update,
                Some(entity.id.clone()),
                format!("Resizing cluster '{}' ({})", entity.name, entity.id),
            )
            .await;
        let entity = self
            .record_start(
                &entity,
                next,
                EntityPatch::new().with_spec(spec).with_task_href(task.href()),
                &task,
            )
            .await?;

        info!(
            cluster_id = %entity.id,
            workers = plan.desired_workers,
            nfs = plan.desired_nfs,
            unexpose = plan.unexpose,
            "Resizing cluster"
        );

        let service = self.clone();
        let worker_entity = entity.clone();
        let worker_task = task.clone();
        let handle = self.spawn_operation(ctx, Operation::Update, &entity.id, &task, async move {
            service.run_resize(worker_entity, plan, worker_task).await;
        });

        Ok(ClusterOperation::new(entity, task, handle))
    }

    async fn resize_inputs(&self, entity: &ClusterEntity) -> Result<(Template, VmGroupRef)> {
        let template = self.template_for(&entity.spec.template).await?;
        let group = self.group_for(entity).await?;
        Ok((template, group))
    }

    /// Monitor: runs the add and delete children, then settles the phase.
    async fn run_resize(&self, entity: ClusterEntity, plan: ResizePlan, task: TaskTracker) {
        let (template, group) = match self.resize_inputs(&entity).await {
            Ok(inputs) => inputs,
            Err(e) => {
                self.fail_update(&entity, &task, "Error resizing cluster", e).await;
                return;
            }
        };

        let mut children: Vec<JoinHandle<()>> = Vec::new();
        let mut outcomes = Vec::new();

        if plan.adds_nodes() {
            let service = self.clone();
            let (child_entity, child_group, child_task) =
                (entity.clone(), group.clone(), task.clone());
            let (workers, nfs) = (plan.workers_to_add, plan.nfs_to_add);
            let handle = tokio::spawn(
                async move {
                    service
                        .resize_add_nodes(&child_entity, &template, &child_group, &child_task, workers, nfs)
                        .await;
                }
                .in_current_span(),
            );
            if self.config.serialize_add_before_delete {
                outcomes.push(handle.await);
            } else {
                children.push(handle);
            }
        }

        if plan.removes_nodes() {
            if task.is_terminal().await {
                debug!(cluster_id = %entity.id, "Skipping node removal after failed addition");
            } else {
                let service = self.clone();
                let (child_entity, child_group, child_task) =
                    (entity.clone(), group.clone(), task.clone());
                let victims = plan.nodes_to_remove.clone();
                children.push(tokio::spawn(
                    async move {
                        service
                            .resize_delete_nodes(&child_entity, &child_group, &child_task, victims)
                            .await;
                    }
                    .in_current_span(),
                ));
            }
        }

        for child in children {
            outcomes.push(child.await);
        }
        for outcome in outcomes {
            if let Err(e) = outcome {
                error!(cluster_id = %entity.id, error = %e, "Resize step terminated unexpectedly");
                task.fail("Resize step terminated unexpectedly", e.to_string())
                    .await;
            }
        }

        if task.snapshot().await.status == TaskStatus::Error {
            self.fail_operation(&entity.id, Operation::Update).await;
            return;
        }

        let mut message = format!("Resized cluster '{}' ({})", entity.name, entity.id);
        if plan.unexpose {
            if let Err(e) = self.unexpose_cluster(&entity.id, &group).await {
                warn!(cluster_id = %entity.id, error = %e, "Failed to un-expose cluster");
                message.push_str(" and failed to un-expose the cluster");
            }
        }

        match self.finish_update(&entity.id).await {
            Ok(_) => {
                info!(cluster_id = %entity.id, "Cluster resized");
                task.succeed(message).await;
            }
            Err(e) => self.fail_update(&entity, &task, "Error resizing cluster", e).await,
        }
    }

    async fn resize_add_nodes(
        &self,
        entity: &ClusterEntity,
        template: &Template,
        group: &VmGroupRef,
        task: &TaskTracker,
        workers: u32,
        nfs: u32,
    ) {
        if let Err(e) = self
            .add_nodes_step(entity, template, group, task, workers, nfs)
            .await
        {
            if entity.spec.rollback_on_failure {
                if let Some(names) = e.node_names() {
                    info!(cluster_id = %entity.id, nodes = ?names, "Rolling back added nodes");
                    let cp = entity.control_plane().map(|n| n.name.as_str());
                    if let Err(rollback) = self.provisioner.delete_nodes(group, cp, names).await {
                        error!(cluster_id = %entity.id, error = %rollback, "Failed to roll back added nodes");
                    }
                }
            }
            self.fail_update(entity, task, "Error adding nodes to cluster", e)
                .await;
        }
    }

    async fn add_nodes_step(
        &self,
        entity: &ClusterEntity,
        template: &Template,
        group: &VmGroupRef,
        task: &TaskTracker,
        workers: u32,
        nfs: u32,
    ) -> Result<()> {
        let spec = &entity.spec;
        let scope = Self::scope(entity);
        let bootstrap = BootstrapContext {
            group,
            cluster_id: &entity.id,
            cluster_name: &entity.name,
            template,
            spec,
            scope: &scope,
        };

        if workers > 0 {
            let control_plane = Self::control_plane_name(entity)?;
            task.running(format!(
                "Adding {} worker node(s) to cluster '{}' ({})",
                workers, entity.name, entity.id
            ))
            .await;
            let request =
                NodeRequest::from_pool(NodeRole::Worker, workers, &spec.network, &spec.workers);
            let names = self
                .bootstrap
                .provision_workers(&self.provisioner, &bootstrap, &request, &control_plane)
                .await?;
            self.emit(Event::NodesAdded {
                cluster_id: entity.id.clone(),
                role: NodeRole::Worker.as_str().to_string(),
                node_names: names,
            });
        }

        if nfs > 0 {
            task.running(format!(
                "Adding {} NFS node(s) to cluster '{}' ({})",
                nfs, entity.name, entity.id
            ))
            .await;
            let request = NodeRequest::from_pool(NodeRole::Nfs, nfs, &spec.network, &spec.nfs);
            let names = self
                .bootstrap
                .provision_nfs(&self.provisioner, &bootstrap, &request)
                .await?;
            self.emit(Event::NodesAdded {
                cluster_id: entity.id.clone(),
                role: NodeRole::Nfs.as_str().to_string(),
                node_names: names,
            });
        }

        Ok(())
    }

    async fn resize_delete_nodes(
        &self,
        entity: &ClusterEntity,
        group: &VmGroupRef,
        task: &TaskTracker,
        victims: Vec<String>,
    ) {
        task.running(format!(
            "Deleting {} node(s) from cluster '{}' ({})",
            victims.len(),
            entity.name,
            entity.id
        ))
        .await;

        let control_plane = entity.control_plane().map(|n| n.name.as_str());
        match self
            .provisioner
            .delete_nodes(group, control_plane, &victims)
            .await
        {
            Ok(()) => self.emit(Event::NodesDeleted {
                cluster_id: entity.id.clone(),
                node_names: victims,
            }),
            Err(e) => {
                self.fail_update(entity, task, "Error deleting nodes from cluster", e)
                    .await
            }
        }
    }

    /// Remove the DNAT rule and point the kubeconfig back at the internal address.
    async fn unexpose_cluster(&self, cluster_id: &str, group: &VmGroupRef) -> Result<()> {
        let current = self.entities.get(cluster_id).await?;
        let control_plane = Self::control_plane_name(&current)?;
        let internal_ip = self
            .bootstrap
            .control_plane_ip(&self.provisioner, group, &control_plane)
            .await?;

        let mut patch = EntityPatch::new().with_exposed(false, None);
        if let Some(kubeconfig) = &current.status.kubeconfig {
            let rewritten = rewrite_kubeconfig_endpoint(kubeconfig, &internal_ip);
            self.provisioner
                .write_kubeconfig(group, std::slice::from_ref(&control_plane), &rewritten)
                .await?;
            patch = patch.with_kubeconfig(Some(rewritten));
        }

        self.exposure
            .unexpose(&Self::scope(&current), &current.name, &current.id)
            .await?;

        let nodes = current
            .status
            .nodes
            .iter()
            .cloned()
            .map(|mut node| {
                if node.role == NodeRole::ControlPlane {
                    node.ip = Some(internal_ip.clone());
                }
                node
            })
            .collect();
        self.entities
            .update(cluster_id, patch.with_nodes(nodes))
            .await?;

        self.emit(Event::ClusterUnexposed {
            cluster_id: cluster_id.to_string(),
            internal_ip,
        });
        Ok(())
    }

    /// Resynchronize nodes and settle an update on `UPDATE:SUCCEEDED`.
    pub(super) async fn finish_update(&self, cluster_id: &str) -> Result<ClusterEntity> {
        let current = self.sync_entity(cluster_id).await?;
        self.transition(&current, Phase::succeeded(Operation::Update), EntityPatch::new())
            .await
    }

    /// Error path shared by update-family workers.
    pub(super) async fn fail_update(
        &self,
        entity: &ClusterEntity,
        task: &TaskTracker,
        context: &str,
        err: OrchestratorError,
    ) {
        error!(cluster_id = %entity.id, error = %err, "{}", context);
        self.fail_operation(&entity.id, Operation::Update).await;
        self.sync_quietly(&entity.id).await;
        task.fail(
            format!("{} '{}' ({})", context, entity.name, entity.id),
            err.to_string(),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cluster_core::{ClusterSpec, Node, NodePoolSpec, TemplateRef};

    fn entity(workers: usize, nfs: usize, exposed: bool) -> ClusterEntity {
        let spec = ClusterSpec {
            control_plane: NodePoolSpec::with_count(1),
            workers: NodePoolSpec::with_count(workers as u32),
            nfs: NodePoolSpec::with_count(nfs as u32),
            network: "net".to_string(),
            template: TemplateRef::new("ubuntu", 1),
            ssh_key: None,
            rollback_on_failure: true,
            expose: exposed,
        };
        let mut entity = ClusterEntity::new("foo", "org", "vdc", "native:2.0.0", spec);
        entity.status.phase = Phase::succeeded(Operation::Create);
        entity.status.exposed = exposed;
        entity.status.nodes.push(Node::new("mstr-aaaa", NodeRole::ControlPlane));
        for i in 0..workers {
            entity.status.nodes.push(Node::new(format!("node-w{:03}", i), NodeRole::Worker));
        }
        for i in 0..nfs {
            entity.status.nodes.push(Node::new(format!("nfsd-n{:03}", i), NodeRole::Nfs));
        }
        entity
    }

    #[test]
    fn test_scale_up_workers() {
        let plan = ResizePlan::compute(&entity(2, 0, false), &ResizeRequest::workers(4), false).unwrap();
        assert_eq!(plan.workers_to_add, 2);
        assert_eq!(plan.nfs_to_add, 0);
        assert!(plan.nodes_to_remove.is_empty());
        assert!(!plan.unexpose);
    }

    #[test]
    fn test_scale_down_takes_tail_workers() {
        let plan = ResizePlan::compute(&entity(3, 0, false), &ResizeRequest::workers(1), false).unwrap();
        assert_eq!(plan.nodes_to_remove, vec!["node-w001", "node-w002"]);
        assert!(!plan.adds_nodes());
    }

    #[test]
    fn test_nfs_scale_down_rejected() {
        let request = ResizeRequest::workers(0).with_nfs(1);
        let err = ResizePlan::compute(&entity(2, 2, false), &request, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid request: Scaling down nfs nodes is not supported"
        );
    }

    #[test]
    fn test_nfs_scale_down_when_allowed() {
        let request = ResizeRequest::default().with_nfs(1);
        let plan = ResizePlan::compute(&entity(2, 2, false), &request, true).unwrap();
        assert_eq!(plan.nodes_to_remove, vec!["nfsd-n001"]);
    }

    #[test]
    fn test_both_pools_shrinking_rejected() {
        let request = ResizeRequest::workers(1).with_nfs(0);
        let err = ResizePlan::compute(&entity(2, 2, false), &request, true).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    }

    #[test]
    fn test_noop_rejected() {
        let err = ResizePlan::compute(&entity(2, 1, false), &ResizeRequest::workers(2), false)
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("cluster 'foo' already has 2 workers and 1 nfs nodes and is already not exposed"));
    }

    #[test]
    fn test_unexpose_alone_is_valid() {
        let request = ResizeRequest::default().with_expose(false);
        let plan = ResizePlan::compute(&entity(2, 0, true), &request, false).unwrap();
        assert!(plan.unexpose);
        assert!(!plan.adds_nodes());
        assert!(!plan.removes_nodes());
    }

    #[test]
    fn test_negative_count_rejected() {
        let err = ResizePlan::compute(&entity(2, 0, false), &ResizeRequest::workers(-3), false)
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidRequest(_)));
    }
}
