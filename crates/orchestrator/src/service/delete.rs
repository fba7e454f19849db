use cluster_core::{ClusterEntity, EntityPatch, Operation, Phase};
use events::Event;
use tracing::{error, info, warn};

use super::ClusterService;
use crate::backend::ClusterOperation;
use crate::bootstrap::NodeBootstrap;
use crate::context::RequestContext;
use crate::error::{OrchestratorError, Result};
use crate::infra::InfraError;
use crate::state_machine::ClusterStateMachine;
use crate::task_tracker::TaskTracker;

impl<B: NodeBootstrap> ClusterService<B> {
    pub async fn delete_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<ClusterOperation> {
        let entity = self.entities.get(cluster_id).await?;
        let next = ClusterStateMachine::begin(&entity, Operation::Delete)?;

        let task = self
            .tasks
            .start(
                Operation::Delete,
                Some(entity.id.clone()),
                format!("Deleting cluster '{}' ({})", entity.name, entity.id),
            )
            .await;
        let entity = self
            .record_start(&entity, next, EntityPatch::new().with_task_href(task.href()), &task)
            .await?;
        info!(cluster_id = %entity.id, cluster_name = %entity.name, "Deleting cluster");

        let service = self.clone();
        let worker_entity = entity.clone();
        let worker_task = task.clone();
        let handle = self.spawn_operation(ctx, Operation::Delete, &entity.id, &task, async move {
            service.run_delete(worker_entity, worker_task).await;
        });

        Ok(ClusterOperation::new(entity, task, handle))
    }

    async fn run_delete(&self, entity: ClusterEntity, task: TaskTracker) {
        match self.teardown_cluster(&entity).await {
            Ok(message) => {
                info!(cluster_id = %entity.id, "Cluster deleted");
                task.succeed(message).await;
            }
            Err(e) => {
                error!(cluster_id = %entity.id, error = %e, "Cluster deletion failed");
                self.fail_operation(&entity.id, Operation::Delete).await;
                task.fail(
                    format!("Error deleting cluster '{}' ({})", entity.name, entity.id),
                    e.to_string(),
                )
                .await;
            }
        }
    }

    async fn teardown_cluster(&self, entity: &ClusterEntity) -> Result<String> {
        let mut message = match &entity.external_id {
            Some(external_id) => {
                match self.provisioner.find_group(external_id).await {
                    Ok(group) => self.provisioner.delete_group(&group).await?,
                    Err(OrchestratorError::Infra(InfraError::NotFound(_))) => {
                        warn!(cluster_id = %entity.id, external_id, "Cluster vApp already gone");
                    }
                    Err(e) => return Err(e),
                }
                format!("Deleted cluster '{}' ({})", entity.name, entity.id)
            }
            None => format!("VApp for cluster {} not present", entity.name),
        };

        if entity.status.exposed {
            if let Err(e) = self
                .exposure
                .unexpose(&Self::scope(entity), &entity.name, &entity.id)
                .await
            {
                warn!(cluster_id = %entity.id, error = %e, "Failed to delete dnat rule");
                message.push_str(" with failed dnat rule deletion");
            }
        }

        if self.config.delete_entity_on_cluster_delete {
            self.entities.delete(&entity.id).await?;
            self.emit(Event::ClusterDeleted {
                cluster_id: entity.id.clone(),
                cluster_name: entity.name.clone(),
            });
        } else {
            let current = self.entities.get(&entity.id).await?;
            self.transition(
                &current,
                Phase::succeeded(Operation::Delete),
                EntityPatch::new().with_nodes(Vec::new()),
            )
            .await?;
        }

        Ok(message)
    }
}
