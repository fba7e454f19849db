//! Backend selection by entity schema generation.
//!
//! Clusters of entity type `native:1.x` are bootstrapped with post-boot guest
//! scripts, `native:2.x` with cloud-init. Both expose the same
//! [`ClusterBackend`] operations; [`BackendFactory`] picks the one matching a
//! cluster's stored entity type.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cluster_core::{parse_version, ClusterEntity, Task, Template, TemplateRef};
use db::{EntityFilter, EntityStore, Page, PageRequest};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bootstrap::{CloudInitBootstrap, NodeBootstrap, ScriptBootstrap};
use crate::config::OrchestratorConfig;
use crate::context::RequestContext;
use crate::error::{OrchestratorError, Result};
use crate::requests::{CreateClusterRequest, ResizeRequest, UpdateClusterRequest};
use crate::service::{ClusterService, ServiceDeps};
use crate::task_tracker::{TaskRegistry, TaskTracker};

pub const SCRIPTED_ENTITY_TYPE: &str = "native:1.0.0";
pub const CLOUD_INIT_ENTITY_TYPE: &str = "native:2.0.0";

pub type ScriptedBackend = ClusterService<ScriptBootstrap>;
pub type CloudInitBackend = ClusterService<CloudInitBootstrap>;

/// An accepted operation whose infrastructure work runs in the background.
#[derive(Debug)]
pub struct ClusterOperation {
    /// Entity as it was when the operation was accepted.
    pub entity: ClusterEntity,
    pub task: TaskTracker,
    handle: JoinHandle<()>,
}

impl ClusterOperation {
    pub(crate) fn new(entity: ClusterEntity, task: TaskTracker, handle: JoinHandle<()>) -> Self {
        Self {
            entity,
            task,
            handle,
        }
    }

    pub fn task_id(&self) -> Uuid {
        self.task.id()
    }

    pub fn task_href(&self) -> String {
        self.task.href()
    }

    /// Wait for the worker and return the final task state.
    pub async fn wait(self) -> Task {
        if let Err(e) = self.handle.await {
            warn!(task_id = %self.task.id(), error = %e, "Operation worker did not finish cleanly");
            // The operation guard records the failure from a spawned task.
            for _ in 0..100 {
                if self.task.is_terminal().await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
        self.task.snapshot().await
    }

    /// Let the worker run on without waiting for it.
    pub fn detach(self) -> (ClusterEntity, TaskTracker) {
        (self.entity, self.task)
    }
}

/// Lifecycle operations of one entity schema generation.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    fn entity_type(&self) -> &str;

    fn generation(&self) -> &'static str;

    async fn create_cluster(
        &self,
        ctx: &RequestContext,
        request: CreateClusterRequest,
    ) -> Result<ClusterOperation>;

    async fn resize_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: ResizeRequest,
    ) -> Result<ClusterOperation>;

    async fn delete_cluster(&self, ctx: &RequestContext, cluster_id: &str)
        -> Result<ClusterOperation>;

    async fn upgrade_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        target: TemplateRef,
    ) -> Result<ClusterOperation>;

    async fn delete_nodes(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        node_names: Vec<String>,
    ) -> Result<ClusterOperation>;

    async fn update_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: UpdateClusterRequest,
    ) -> Result<ClusterOperation>;

    async fn get_cluster_info(&self, ctx: &RequestContext, cluster_id: &str)
        -> Result<ClusterEntity>;

    async fn get_cluster_config(&self, ctx: &RequestContext, cluster_id: &str) -> Result<String>;

    async fn get_upgrade_plan(&self, ctx: &RequestContext, cluster_id: &str)
        -> Result<Vec<Template>>;

    async fn list_clusters(
        &self,
        ctx: &RequestContext,
        filter: &EntityFilter,
    ) -> Result<Vec<ClusterEntity>>;

    async fn get_clusters_by_page(
        &self,
        ctx: &RequestContext,
        filter: &EntityFilter,
        page: PageRequest,
    ) -> Result<Page<ClusterEntity>>;
}

#[async_trait]
impl<B: NodeBootstrap> ClusterBackend for ClusterService<B> {
    fn entity_type(&self) -> &str {
        ClusterService::entity_type(self)
    }

    fn generation(&self) -> &'static str {
        ClusterService::generation(self)
    }

    async fn create_cluster(
        &self,
        ctx: &RequestContext,
        request: CreateClusterRequest,
    ) -> Result<ClusterOperation> {
        ClusterService::create_cluster(self, ctx, request).await
    }

    async fn resize_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: ResizeRequest,
    ) -> Result<ClusterOperation> {
        ClusterService::resize_cluster(self, ctx, cluster_id, request).await
    }

    async fn delete_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<ClusterOperation> {
        ClusterService::delete_cluster(self, ctx, cluster_id).await
    }

    async fn upgrade_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        target: TemplateRef,
    ) -> Result<ClusterOperation> {
        ClusterService::upgrade_cluster(self, ctx, cluster_id, target).await
    }

    async fn delete_nodes(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        node_names: Vec<String>,
    ) -> Result<ClusterOperation> {
        ClusterService::delete_nodes(self, ctx, cluster_id, node_names).await
    }

    async fn update_cluster(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
        request: UpdateClusterRequest,
    ) -> Result<ClusterOperation> {
        ClusterService::update_cluster(self, ctx, cluster_id, request).await
    }

    async fn get_cluster_info(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<ClusterEntity> {
        ClusterService::get_cluster_info(self, ctx, cluster_id).await
    }

    async fn get_cluster_config(&self, ctx: &RequestContext, cluster_id: &str) -> Result<String> {
        ClusterService::get_cluster_config(self, ctx, cluster_id).await
    }

    async fn get_upgrade_plan(
        &self,
        ctx: &RequestContext,
        cluster_id: &str,
    ) -> Result<Vec<Template>> {
        ClusterService::get_upgrade_plan(self, ctx, cluster_id).await
    }

    async fn list_clusters(
        &self,
        ctx: &RequestContext,
        filter: &EntityFilter,
    ) -> Result<Vec<ClusterEntity>> {
        ClusterService::list_clusters(self, ctx, filter).await
    }

    async fn get_clusters_by_page(
        &self,
        ctx: &RequestContext,
        filter: &EntityFilter,
        page: PageRequest,
    ) -> Result<Page<ClusterEntity>> {
        ClusterService::get_clusters_by_page(self, ctx, filter, page).await
    }
}

/// Entity schema generation, from the major version of an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaVersion {
    /// Post-boot guest scripts.
    V1,
    /// Cloud-init injected before first boot.
    V2,
}

impl SchemaVersion {
    /// `"native:2.0.0"` selects [`SchemaVersion::V2`].
    pub fn from_entity_type(entity_type: &str) -> Result<Self> {
        let unsupported =
            || OrchestratorError::invalid_request(format!("Unsupported entity type '{}'", entity_type));

        let raw = entity_type.rsplit(':').next().unwrap_or(entity_type);
        let version = parse_version(raw).map_err(|_| unsupported())?;
        match version.major {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            _ => Err(unsupported()),
        }
    }

    pub fn canonical_entity_type(&self) -> &'static str {
        match self {
            Self::V1 => SCRIPTED_ENTITY_TYPE,
            Self::V2 => CLOUD_INIT_ENTITY_TYPE,
        }
    }
}

/// Holds one backend per schema generation over shared collaborators.
#[derive(Clone)]
pub struct BackendFactory {
    scripted: Arc<ScriptedBackend>,
    cloud_init: Arc<CloudInitBackend>,
    entities: Arc<dyn EntityStore>,
    tasks: TaskRegistry,
    default_version: SchemaVersion,
}

impl BackendFactory {
    /// Fails when the configured entity type names no known generation.
    pub fn new(deps: ServiceDeps, config: OrchestratorConfig) -> Result<Self> {
        let default_version = SchemaVersion::from_entity_type(&config.entity_type)?;
        let entity_type_for = |version: SchemaVersion| {
            if version == default_version {
                config.entity_type.clone()
            } else {
                version.canonical_entity_type().to_string()
            }
        };

        let scripted_type = entity_type_for(SchemaVersion::V1);
        let cloud_init_type = entity_type_for(SchemaVersion::V2);
        let config = Arc::new(config);
        debug!(
            scripted = %scripted_type,
            cloud_init = %cloud_init_type,
            default = ?default_version,
            "Creating cluster backends"
        );

        Ok(Self {
            scripted: Arc::new(ClusterService::new(
                ScriptBootstrap,
                scripted_type,
                &deps,
                Arc::clone(&config),
            )),
            cloud_init: Arc::new(ClusterService::new(
                CloudInitBootstrap,
                cloud_init_type,
                &deps,
                config,
            )),
            entities: Arc::clone(&deps.entities),
            tasks: deps.tasks.clone(),
            default_version,
        })
    }

    pub fn backend(&self, version: SchemaVersion) -> Arc<dyn ClusterBackend> {
        match version {
            SchemaVersion::V1 => self.scripted.clone() as Arc<dyn ClusterBackend>,
            SchemaVersion::V2 => self.cloud_init.clone() as Arc<dyn ClusterBackend>,
        }
    }

    /// Backend used for new clusters.
    pub fn default_backend(&self) -> Arc<dyn ClusterBackend> {
        self.backend(self.default_version)
    }

    pub fn for_entity_type(&self, entity_type: &str) -> Result<Arc<dyn ClusterBackend>> {
        Ok(self.backend(SchemaVersion::from_entity_type(entity_type)?))
    }

    /// Backend matching the stored entity type of an existing cluster.
    pub async fn for_cluster(&self, cluster_id: &str) -> Result<Arc<dyn ClusterBackend>> {
        let entity = self.entities.get(cluster_id).await?;
        self.for_entity_type(&entity.entity_type)
    }

    /// Clusters of every generation.
    pub async fn list_clusters(
        &self,
        ctx: &RequestContext,
        filter: &EntityFilter,
    ) -> Result<Vec<ClusterEntity>> {
        let mut clusters = self.scripted.list_clusters(ctx, filter).await?;
        clusters.extend(self.cloud_init.list_clusters(ctx, filter).await?);
        clusters.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(clusters)
    }

    pub fn tasks(&self) -> &TaskRegistry {
        &self.tasks
    }
}
