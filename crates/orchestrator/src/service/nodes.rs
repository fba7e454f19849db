use std::collections::HashSet;

use cluster_core::{ClusterEntity, EntityPatch, NodeRole, Operation};
use events::Event;
use tracing::info;

use super::ClusterService;
use crate::backend::ClusterOperation;
use crate::bootstrap::NodeBootstrap;
use crate::context::RequestContext;
use crate::error::{OrchestratorError, Result};
use crate::state_machine::ClusterStateMachine;
use crate::task_tracker::TaskTracker;

impl<B: NodeBootstrap> ClusterService<B> {
    /// Remove the named worker or NFS nodes from a cluster.
    pub async fn delete_nodes(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        node_names: Vec<String>,
    ) -> Result<ClusterOperation> {
        if node_names.is_empty() {
            return Err(OrchestratorError::invalid_request(
                "at least one node name is required",
            ));
        }

        let entity = self.entities.get(cluster_id).await?;
        let control_planes: HashSet<String> =
            entity.node_names(NodeRole::ControlPlane).into_iter().collect();
        if let Some(name) = node_names.iter().find(|n| {
            control_planes.contains(*n)
                || NodeRole::from_node_name(n) == Some(NodeRole::ControlPlane)
        }) {
            return Err(OrchestratorError::invalid_request(format!(
                "control plane node {} cannot be deleted",
                name
            )));
        }
        let next = ClusterStateMachine::begin(&entity, Operation::Update)?;

        let role_of = |name: &String| {
            entity
                .status
                .nodes
                .iter()
                .find(|n| &n.name == name)
                .map(|n| n.role)
                .or_else(|| NodeRole::from_node_name(name))
        };
        let removed_workers = node_names
            .iter()
            .filter(|n| role_of(n) == Some(NodeRole::Worker))
            .count() as u32;
        let removed_nfs = node_names
            .iter()
            .filter(|n| role_of(n) == Some(NodeRole::Nfs))
            .count() as u32;

        let mut spec = entity.spec.clone();
        spec.workers.count = spec.workers.count.saturating_sub(removed_workers);
        spec.nfs.count = spec.nfs.count.saturating_sub(removed_nfs);

        let task = self
            .tasks
            .start(
                Operation::Update,
                Some(entity.id.clone()),
                format!(
                    "Deleting nodes {:?} from cluster '{}' ({})",
                    node_names, entity.name, entity.id
                ),
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
        info!(cluster_id = %entity.id, nodes = ?node_names, "Deleting nodes");

        let service = self.clone();
        let worker_entity = entity.clone();
        let worker_task = task.clone();
        let handle = self.spawn_operation(ctx, Operation::Update, &entity.id, &task, async move {
            service
                .run_delete_nodes(worker_entity, node_names, worker_task)
                .await;
        });

        Ok(ClusterOperation::new(entity, task, handle))
    }

    async fn run_delete_nodes(
        &self,
        entity: ClusterEntity,
        node_names: Vec<String>,
        task: TaskTracker,
    ) {
        match self.remove_nodes(&entity, &node_names).await {
            Ok(()) => {
                info!(cluster_id = %entity.id, nodes = ?node_names, "Nodes deleted");
                task.succeed(format!(
                    "Deleted nodes {:?} from cluster '{}' ({})",
                    node_names, entity.name, entity.id
                ))
                .await;
            }
            Err(e) => {
                self.fail_update(&entity, &task, "Error deleting nodes from cluster", e)
                    .await
            }
        }
    }

    async fn remove_nodes(&self, entity: &ClusterEntity, node_names: &[String]) -> Result<()> {
        let group = self.group_for(entity).await?;
        let control_plane = entity.control_plane().map(|n| n.name.as_str());

        self.provisioner
            .delete_nodes(&group, control_plane, node_names)
            .await?;
        self.emit(Event::NodesDeleted {
            cluster_id: entity.id.clone(),
            node_names: node_names.to_vec(),
        });

        self.finish_update(&entity.id).await?;
        Ok(())
    }
}
