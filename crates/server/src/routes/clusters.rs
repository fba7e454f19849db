use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use cluster_core::{ClusterEntity, Template, TemplateRef};
use db::{EntityFilter, PageRequest, DEFAULT_PAGE_SIZE};
use orchestrator::{ClusterOperation, CreateClusterRequest, ResizeRequest, UpdateClusterRequest};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use super::request_context;
use crate::error::AppError;
use crate::state::AppState;

/// Accepted operation: poll `task_href` for progress.
#[derive(Debug, Serialize, ToSchema)]
pub struct OperationResponse {
    pub task_id: Uuid,
    pub task_href: String,
    pub cluster: ClusterEntity,
}

impl From<ClusterOperation> for OperationResponse {
    fn from(operation: ClusterOperation) -> Self {
        let task_id = operation.task_id();
        let task_href = operation.task_href();
        let (entity, _task) = operation.detach();
        Self {
            task_id,
            task_href,
            cluster: redacted(entity),
        }
    }
}

type Accepted = (StatusCode, Json<OperationResponse>);

fn accepted(operation: ClusterOperation) -> Accepted {
    (StatusCode::ACCEPTED, Json(operation.into()))
}

/// Kubeconfig is only served by the config endpoint.
fn redacted(mut entity: ClusterEntity) -> ClusterEntity {
    entity.status.kubeconfig = None;
    entity
}

#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListClustersQuery {
    pub name: Option<String>,
    pub org_name: Option<String>,
    pub vdc_name: Option<String>,
    /// 1-based page number
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClusterListResponse {
    pub items: Vec<ClusterEntity>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ClusterConfigResponse {
    pub kubeconfig: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DeleteNodesRequest {
    pub nodes: Vec<String>,
}

#[utoipa::path(
    get,
    path = "/api/clusters",
    params(ListClustersQuery),
    responses(
        (status = 200, description = "Clusters of every schema generation", body = ClusterListResponse)
    ),
    tag = "clusters"
)]
pub async fn list_clusters(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListClustersQuery>,
) -> Result<Json<ClusterListResponse>, AppError> {
    let ctx = request_context(&headers);
    let filter = EntityFilter {
        name: query.name,
        org_name: query.org_name,
        vdc_name: query.vdc_name,
    };
    let page = PageRequest::new(
        query.page.unwrap_or(1),
        query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    );

    let clusters = state.factory.list_clusters(&ctx, &filter).await?;
    let total = clusters.len() as u64;
    let items = clusters
        .into_iter()
        .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
        .take(page.page_size as usize)
        .map(redacted)
        .collect();

    Ok(Json(ClusterListResponse {
        items,
        total,
        page: page.page,
        page_size: page.page_size,
    }))
}

#[utoipa::path(
    post,
    path = "/api/clusters",
    request_body = CreateClusterRequest,
    responses(
        (status = 202, description = "Cluster creation accepted", body = OperationResponse),
        (status = 400, description = "Invalid name or template"),
        (status = 409, description = "Cluster name already in use"),
    ),
    tag = "clusters"
)]
pub async fn create_cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateClusterRequest>,
) -> Result<Accepted, AppError> {
    let ctx = request_context(&headers);
    info!(request_id = %ctx.request_id, cluster = %payload.name, "Create cluster requested");

    let backend = state.factory.default_backend();
    let operation = backend.create_cluster(&ctx, payload).await?;
    Ok(accepted(operation))
}

#[utoipa::path(
    get,
    path = "/api/clusters/{id}",
    params(("id" = String, Path, description = "Cluster ID")),
    responses(
        (status = 200, description = "Cluster with nodes refreshed from infrastructure", body = ClusterEntity),
        (status = 404, description = "Cluster not found"),
    ),
    tag = "clusters"
)]
pub async fn get_cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ClusterEntity>, AppError> {
    let ctx = request_context(&headers);
    let backend = state.factory.for_cluster(&id).await?;
    let entity = backend.get_cluster_info(&ctx, &id).await?;
    Ok(Json(redacted(entity)))
}

#[utoipa::path(
    patch,
    path = "/api/clusters/{id}",
    params(("id" = String, Path, description = "Cluster ID")),
    request_body = UpdateClusterRequest,
    responses(
        (status = 202, description = "Resize or upgrade accepted", body = OperationResponse),
        (status = 400, description = "Nothing to change"),
        (status = 409, description = "Cluster busy"),
    ),
    tag = "clusters"
)]
pub async fn update_cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<UpdateClusterRequest>,
) -> Result<Accepted, AppError> {
    let ctx = request_context(&headers);
    let backend = state.factory.for_cluster(&id).await?;
    let operation = backend.update_cluster(&ctx, &id, payload).await?;
    Ok(accepted(operation))
}

#[utoipa::path(
    delete,
    path = "/api/clusters/{id}",
    params(("id" = String, Path, description = "Cluster ID")),
    responses(
        (status = 202, description = "Deletion accepted", body = OperationResponse),
        (status = 404, description = "Cluster not found"),
        (status = 409, description = "Cluster busy"),
    ),
    tag = "clusters"
)]
pub async fn delete_cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Accepted, AppError> {
    let ctx = request_context(&headers);
    info!(request_id = %ctx.request_id, cluster_id = %id, "Delete cluster requested");

    let backend = state.factory.for_cluster(&id).await?;
    let operation = backend.delete_cluster(&ctx, &id).await?;
    Ok(accepted(operation))
}

#[utoipa::path(
    post,
    path = "/api/clusters/{id}/resize",
    params(("id" = String, Path, description = "Cluster ID")),
    request_body = ResizeRequest,
    responses(
        (status = 202, description = "Resize accepted", body = OperationResponse),
        (status = 400, description = "Invalid node counts"),
        (status = 409, description = "Cluster busy"),
    ),
    tag = "clusters"
)]
pub async fn resize_cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<ResizeRequest>,
) -> Result<Accepted, AppError> {
    let ctx = request_context(&headers);
    let backend = state.factory.for_cluster(&id).await?;
    let operation = backend.resize_cluster(&ctx, &id, payload).await?;
    Ok(accepted(operation))
}

#[utoipa::path(
    post,
    path = "/api/clusters/{id}/upgrade",
    params(("id" = String, Path, description = "Cluster ID")),
    request_body = TemplateRef,
    responses(
        (status = 202, description = "Upgrade accepted", body = OperationResponse),
        (status = 400, description = "Not a valid upgrade target"),
        (status = 409, description = "Cluster busy"),
    ),
    tag = "clusters"
)]
pub async fn upgrade_cluster(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(target): Json<TemplateRef>,
) -> Result<Accepted, AppError> {
    let ctx = request_context(&headers);
    let backend = state.factory.for_cluster(&id).await?;
    let operation = backend.upgrade_cluster(&ctx, &id, target).await?;
    Ok(accepted(operation))
}

#[utoipa::path(
    get,
    path = "/api/clusters/{id}/upgrade-plan",
    params(("id" = String, Path, description = "Cluster ID")),
    responses(
        (status = 200, description = "Templates the cluster can upgrade to", body = Vec<Template>),
        (status = 404, description = "Cluster not found"),
    ),
    tag = "clusters"
)]
pub async fn get_upgrade_plan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<Template>>, AppError> {
    let ctx = request_context(&headers);
    let backend = state.factory.for_cluster(&id).await?;
    Ok(Json(backend.get_upgrade_plan(&ctx, &id).await?))
}

#[utoipa::path(
    get,
    path = "/api/clusters/{id}/config",
    params(("id" = String, Path, description = "Cluster ID")),
    responses(
        (status = 200, description = "Cluster kubeconfig", body = ClusterConfigResponse),
        (status = 404, description = "Cluster not found"),
        (status = 500, description = "Kubeconfig unavailable"),
    ),
    tag = "clusters"
)]
pub async fn get_cluster_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ClusterConfigResponse>, AppError> {
    let ctx = request_context(&headers);
    let backend = state.factory.for_cluster(&id).await?;
    let kubeconfig = backend.get_cluster_config(&ctx, &id).await?;
    Ok(Json(ClusterConfigResponse { kubeconfig }))
}

#[utoipa::path(
    post,
    path = "/api/clusters/{id}/delete-nodes",
    params(("id" = String, Path, description = "Cluster ID")),
    request_body = DeleteNodesRequest,
    responses(
        (status = 202, description = "Node deletion accepted", body = OperationResponse),
        (status = 400, description = "Empty list or control plane node named"),
        (status = 409, description = "Cluster busy"),
    ),
    tag = "clusters"
)]
pub async fn delete_nodes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<DeleteNodesRequest>,
) -> Result<Accepted, AppError> {
    if payload.nodes.iter().any(|n| n.trim().is_empty()) {
        return Err(AppError::BadRequest("Node names cannot be empty".to_string()));
    }

    let ctx = request_context(&headers);
    let backend = state.factory.for_cluster(&id).await?;
    let operation = backend.delete_nodes(&ctx, &id, payload.nodes).await?;
    Ok(accepted(operation))
}
