use cluster_core::{ClusterEntity, EntityState, NodeRole};
use db::{EntityFilter, Page, PageRequest};
use tracing::{debug, warn};

use super::ClusterService;
use crate::backend::ClusterOperation;
use crate::bootstrap::NodeBootstrap;
use crate::context::RequestContext;
use crate::error::{OrchestratorError, Result};
use crate::requests::UpdateClusterRequest;

impl<B: NodeBootstrap> ClusterService<B> {
    /// Entity with `status.nodes` refreshed from live infrastructure.
    pub async fn get_cluster_info(
        &self,
        _ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<ClusterEntity> {
        self.sync_entity(cluster_id).await
    }

    pub async fn get_cluster_config(
        &self,
        _ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<String> {
        let entity = self.entities.get(cluster_id).await?;
        if entity.state != EntityState::Resolved {
            return Err(OrchestratorError::operation(format!(
                "Cluster '{}' ({}) is not in a valid state to fetch its kube-config",
                entity.name, entity.id
            )));
        }
        if let Some(kubeconfig) = entity
            .status
            .kubeconfig
            .as_deref()
            .filter(|k| !k.trim().is_empty())
        {
            return Ok(kubeconfig.to_string());
        }

        let missing = || OrchestratorError::operation("Failed to get cluster kube-config");
        let Some(control_plane) = entity.node_names(NodeRole::ControlPlane).into_iter().next()
        else {
            return Err(missing());
        };
        let group = self.group_for(&entity).await?;

        match self
            .bootstrap
            .kubeconfig(&self.provisioner, &group, &control_plane)
            .await
        {
            Ok(Some(kubeconfig)) => Ok(kubeconfig),
            Ok(None) => Err(missing()),
            Err(e) => {
                warn!(cluster_id, error = %e, "Failed to read kubeconfig from control plane");
                Err(missing())
            }
        }
    }

    /// Route a generic update to resize or upgrade depending on what differs.
    pub async fn update_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: UpdateClusterRequest,
    ) -> Result<ClusterOperation> {
        let entity = self.entities.get(cluster_id).await?;
        let workers = entity.nodes_with_role(NodeRole::Worker).count() as i64;
        let nfs = entity.nodes_with_role(NodeRole::Nfs).count() as i64;

        let counts_differ = request.workers.is_some_and(|w| w != workers)
            || request.nfs.is_some_and(|n| n != nfs);
        let unexpose = entity.status.exposed && request.expose == Some(false);
        if counts_differ || unexpose {
            debug!(cluster_id, "Dispatching update as resize");
            return self
                .resize_cluster(ctx, cluster_id, request.as_resize())
                .await;
        }

        let current = entity
            .status
            .software
            .distribution
            .as_ref()
            .unwrap_or(&entity.spec.template);
        if let Some(target) = request.template.filter(|t| t != current) {
            debug!(cluster_id, target = %target, "Dispatching update as upgrade");
            return self.upgrade_cluster(ctx, cluster_id, target).await;
        }

        Err(OrchestratorError::invalid_request(
            "update not supported for the specified input specification",
        ))
    }

    pub async fn list_clusters(
        &self,
        _ctx: &RequestContext,
        filter: &EntityFilter,
    ) -> Result<Vec<ClusterEntity>> {
        Ok(self
            .entities
            .list_by_type(&self.entity_type, filter, PageRequest::all())
            .await?
            .items)
    }

    pub async fn get_clusters_by_page(
        &self,
        _ctx: &RequestContext,
        filter: &EntityFilter,
        page: PageRequest,
    ) -> Result<Page<ClusterEntity>> {
        Ok(self
            .entities
            .list_by_type(&self.entity_type, filter, page)
            .await?)
    }
}
