use std::collections::BTreeMap;

use cluster_core::{
    validate_cluster_name, ClusterEntity, EntityPatch, Node, NodeRole, Operation, Phase, Template,
};
use db::{EntityFilter, PageRequest};
use events::Event;
use tracing::{debug, error, info, warn};

use super::{cluster_metadata, software_status, with_external_endpoint, ClusterService};
use crate::backend::ClusterOperation;
use crate::bootstrap::{BootstrapContext, ControlPlaneOutcome, NodeBootstrap};
use crate::context::RequestContext;
use crate::error::{OrchestratorError, Result};
use crate::infra::VmGroupRef;
use crate::provisioner::NodeRequest;
use crate::requests::CreateClusterRequest;
use crate::task_tracker::TaskTracker;

/// Nodes created so far, used when live node details are unavailable.
#[derive(Default)]
struct CreatedNodes {
    control_plane: Option<ControlPlaneOutcome>,
    workers: Vec<String>,
    nfs: Vec<String>,
}

impl CreatedNodes {
    fn into_nodes(self) -> Vec<Node> {
        let mut nodes = Vec::new();
        if let Some(cp) = self.control_plane {
            let ip = cp.external_ip.unwrap_or(cp.internal_ip);
            nodes.push(Node::new(cp.node_name, NodeRole::ControlPlane).with_ip(ip));
        }
        nodes.extend(self.workers.into_iter().map(|n| Node::new(n, NodeRole::Worker)));
        nodes.extend(self.nfs.into_iter().map(|n| Node::new(n, NodeRole::Nfs)));
        nodes
    }
}

impl<B: NodeBootstrap> ClusterService<B> {
    pub async fn create_cluster(
        &self,
        ctx: &RequestContext,
        request: CreateClusterRequest,
    ) -> Result<ClusterOperation> {
        validate_cluster_name(&request.name)?;
        request.check_pool_limits(self.config.max_nodes_per_pool)?;

        let filter = EntityFilter::by_name(&request.name, &request.org_name, &request.vdc_name);
        let existing = self
            .entities
            .list_by_type(&self.entity_type, &filter, PageRequest::all())
            .await?;
        if existing.total > 0 {
            return Err(OrchestratorError::ClusterAlreadyExists {
                name: request.name,
                org: request.org_name,
                vdc: request.vdc_name,
            });
        }

        let template = self
            .resolve_template(request.template_name.as_deref(), request.template_revision)
            .await?;

        let mut entity = ClusterEntity::new(
            &request.name,
            &request.org_name,
            &request.vdc_name,
            &self.entity_type,
            request.to_spec(template.reference()),
        );
        entity.status.phase = Phase::in_progress(Operation::Create);
        entity.status.software = software_status(&template);

        let entity = self.entities.create(&self.entity_type, entity).await?;

        let task = self
            .tasks
            .start(
                Operation::Create,
                Some(entity.id.clone()),
                format!("Creating cluster vApp {} ({})", entity.name, entity.id),
            )
            .await;
        let entity = match self.register_created(&entity.id, &task).await {
            Ok(entity) => entity,
            Err(e) => {
                return Err(self
                    .abandon_start(&entity.id, Operation::Create, &task, e)
                    .await)
            }
        };

        info!(
            cluster_id = %entity.id,
            cluster_name = %entity.name,
            template = %template.reference(),
            workers = entity.spec.workers.count,
            nfs = entity.spec.nfs.count,
            generation = self.generation(),
            "Creating cluster"
        );

        let service = self.clone();
        let worker_entity = entity.clone();
        let worker_task = task.clone();
        let handle = self.spawn_operation(ctx, Operation::Create, &entity.id, &task, async move {
            service.run_create(worker_entity, template, worker_task).await;
        });

        Ok(ClusterOperation::new(entity, task, handle))
    }

    async fn register_created(&self, cluster_id: &str, task: &TaskTracker) -> Result<ClusterEntity> {
        self.entities.resolve(cluster_id).await?;
        Ok(self
            .entities
            .update(cluster_id, EntityPatch::new().with_task_href(task.href()))
            .await?)
    }

    /// Resolve the requested template; both parts absent selects the configured default.
    pub(super) async fn resolve_template(
        &self,
        name: Option<&str>,
        revision: Option<u32>,
    ) -> Result<Template> {
        let reference = match (name, revision) {
            (Some(name), Some(revision)) => cluster_core::TemplateRef::new(name, revision),
            (None, None) => self.config.default_template.clone().ok_or_else(|| {
                OrchestratorError::InvalidTemplate("no template given and no default configured".to_string())
            })?,
            (Some(name), None) => {
                return Err(OrchestratorError::InvalidTemplate(format!(
                    "template '{}' requires a revision",
                    name
                )))
            }
            (None, Some(revision)) => {
                return Err(OrchestratorError::InvalidTemplate(format!(
                    "template revision {} requires a template name",
                    revision
                )))
            }
        };
        self.template_for(&reference).await
    }

    async fn run_create(&self, entity: ClusterEntity, template: Template, task: TaskTracker) {
        match self.provision_cluster(&entity, &template, &task).await {
            Ok(message) => {
                info!(cluster_id = %entity.id, "Cluster created");
                task.succeed(message).await;
            }
            Err(e) => self.handle_create_failure(&entity, &task, e).await,
        }
    }

    async fn provision_cluster(
        &self,
        entity: &ClusterEntity,
        template: &Template,
        task: &TaskTracker,
    ) -> Result<String> {
        let group = self
            .provisioner
            .create_group(&entity.name, &entity.spec.network)
            .await?;
        self.entities
            .update(&entity.id, EntityPatch::new().with_external_id(&group.id))
            .await?;
        self.provisioner
            .set_metadata(&group, &cluster_metadata(&entity.id, template))
            .await?;

        let mut created = CreatedNodes::default();
        self.provision_nodes(entity, template, task, &group, &mut created)
            .await?;

        let live = self.provisioner.node_details(&group).await;
        let external_ip = created
            .control_plane
            .as_ref()
            .and_then(|cp| cp.external_ip.clone());
        let nodes = match live {
            Some(nodes) => with_external_endpoint(nodes, external_ip.as_deref()),
            None => {
                warn!(cluster_id = %entity.id, "Live node details unavailable; recording created nodes");
                created.into_nodes()
            }
        };

        let current = self.entities.get(&entity.id).await?;
        self.transition(
            &current,
            Phase::succeeded(Operation::Create),
            EntityPatch::new().with_nodes(nodes),
        )
        .await?;

        Ok(format!("Created cluster '{}' ({})", entity.name, entity.id))
    }

    async fn provision_nodes(
        &self,
        entity: &ClusterEntity,
        template: &Template,
        task: &TaskTracker,
        group: &VmGroupRef,
        created: &mut CreatedNodes,
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

        task.running(format!(
            "Creating control plane node for cluster '{}' ({})",
            entity.name, entity.id
        ))
        .await;
        let exposure = spec.expose.then_some(&self.exposure);
        let cp = self
            .bootstrap
            .provision_control_plane(&self.provisioner, &bootstrap, exposure)
            .await?;
        let cp_name = cp.node_name.clone();

        let master_ip = BTreeMap::from([("cse.master.ip".to_string(), cp.internal_ip.clone())]);
        self.provisioner.set_metadata(group, &master_ip).await?;

        let mut patch = EntityPatch::new().with_kubeconfig(cp.kubeconfig.clone());
        if let Some(ip) = &cp.external_ip {
            patch = patch.with_exposed(true, Some(ip.clone()));
        }
        self.entities.update(&entity.id, patch).await?;

        if let Some(ip) = &cp.external_ip {
            self.emit(Event::ClusterExposed {
                cluster_id: entity.id.clone(),
                external_ip: ip.clone(),
            });
        }
        self.emit(Event::NodesAdded {
            cluster_id: entity.id.clone(),
            role: NodeRole::ControlPlane.as_str().to_string(),
            node_names: vec![cp_name.clone()],
        });
        created.control_plane = Some(cp);

        if spec.workers.count > 0 {
            task.running(format!(
                "Creating {} worker node(s) for cluster '{}' ({})",
                spec.workers.count, entity.name, entity.id
            ))
            .await;
            let request = NodeRequest::from_pool(
                NodeRole::Worker,
                spec.workers.count,
                &spec.network,
                &spec.workers,
            );
            let workers = self
                .bootstrap
                .provision_workers(&self.provisioner, &bootstrap, &request, &cp_name)
                .await
                .map_err(|e| match e {
                    e @ OrchestratorError::NodeCreation { .. } => {
                        OrchestratorError::WorkerNodeCreation(e.to_string())
                    }
                    other => other,
                })?;
            debug!(cluster_id = %entity.id, workers = ?workers, "Workers joined");
            self.emit(Event::NodesAdded {
                cluster_id: entity.id.clone(),
                role: NodeRole::Worker.as_str().to_string(),
                node_names: workers.clone(),
            });
            created.workers = workers;
        }

        if spec.nfs.count > 0 {
            task.running(format!(
                "Creating {} NFS node(s) for cluster '{}' ({})",
                spec.nfs.count, entity.name, entity.id
            ))
            .await;
            let request =
                NodeRequest::from_pool(NodeRole::Nfs, spec.nfs.count, &spec.network, &spec.nfs);
            let nfs = self
                .bootstrap
                .provision_nfs(&self.provisioner, &bootstrap, &request)
                .await
                .map_err(|e| OrchestratorError::NfsNodeCreation(e.to_string()))?;
            self.emit(Event::NodesAdded {
                cluster_id: entity.id.clone(),
                role: NodeRole::Nfs.as_str().to_string(),
                node_names: nfs.clone(),
            });
            created.nfs = nfs;
        }

        Ok(())
    }

    async fn handle_create_failure(
        &self,
        entity: &ClusterEntity,
        task: &TaskTracker,
        err: OrchestratorError,
    ) {
        error!(cluster_id = %entity.id, error = %err, "Cluster creation failed");
        self.fail_operation(&entity.id, Operation::Create).await;

        let message = if entity.spec.rollback_on_failure {
            self.rollback_create(entity).await;
            format!(
                "Error creating cluster '{}' ({}); the partial cluster was removed",
                entity.name, entity.id
            )
        } else {
            self.sync_quietly(&entity.id).await;
            format!("Error creating cluster '{}' ({})", entity.name, entity.id)
        };

        task.fail(message, err.to_string()).await;
    }

    /// Remove every trace of a failed create. Each step is best-effort.
    async fn rollback_create(&self, entity: &ClusterEntity) {
        info!(cluster_id = %entity.id, "Rolling back failed cluster creation");

        let current = match self.entities.get(&entity.id).await {
            Ok(current) => current,
            Err(e) => {
                error!(cluster_id = %entity.id, error = %e, "Failed to load cluster for rollback");
                entity.clone()
            }
        };

        if let Some(external_id) = &current.external_id {
            let deleted = match self.provisioner.find_group(external_id).await {
                Ok(group) => self.provisioner.delete_group(&group).await,
                Err(e) => Err(e),
            };
            if let Err(e) = deleted {
                error!(cluster_id = %entity.id, error = %e, "Failed to delete cluster vApp during rollback");
            }
        }

        // The rule may exist even if the failure hit before exposure was recorded.
        if current.spec.expose || current.status.exposed {
            if let Err(e) = self
                .exposure
                .unexpose(&Self::scope(&current), &current.name, &current.id)
                .await
            {
                warn!(cluster_id = %entity.id, error = %e, "Failed to delete dnat rule during rollback");
            }
        }

        match self.entities.delete(&entity.id).await {
            Ok(()) => self.emit(Event::ClusterDeleted {
                cluster_id: entity.id.clone(),
                cluster_name: entity.name.clone(),
            }),
            Err(e) => error!(cluster_id = %entity.id, error = %e, "Failed to delete cluster entity during rollback"),
        }
    }
}
