pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Cluster Lifecycle API",
        version = "0.1.0",
        description = "Create, resize, upgrade and delete kubernetes clusters and poll their operations"
    ),
    paths(
        routes::health_check,
        routes::list_clusters,
        routes::create_cluster,
        routes::get_cluster,
        routes::update_cluster,
        routes::delete_cluster,
        routes::resize_cluster,
        routes::upgrade_cluster,
        routes::get_upgrade_plan,
        routes::get_cluster_config,
        routes::delete_nodes,
        routes::get_task,
        routes::events::events_stream,
    ),
    components(schemas(
        routes::HealthResponse,
        routes::OperationResponse,
        routes::ClusterListResponse,
        routes::ClusterConfigResponse,
        routes::DeleteNodesRequest,
        routes::TaskResponse,
        error::ErrorResponse,
        orchestrator::CreateClusterRequest,
        orchestrator::ResizeRequest,
        orchestrator::UpdateClusterRequest,
        cluster_core::ClusterEntity,
        cluster_core::Template,
        cluster_core::TemplateRef,
        cluster_core::TaskStatus,
    )),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "clusters", description = "Cluster lifecycle operations"),
        (name = "tasks", description = "Operation progress polling"),
        (name = "events", description = "Real-time lifecycle events (SSE)"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api/openapi.json", ApiDoc::openapi()))
        .route("/health", get(routes::health_check))
        .route(
            "/api/clusters",
            get(routes::list_clusters).post(routes::create_cluster),
        )
        .route(
            "/api/clusters/{id}",
            get(routes::get_cluster)
                .patch(routes::update_cluster)
                .delete(routes::delete_cluster),
        )
        .route("/api/clusters/{id}/resize", post(routes::resize_cluster))
        .route("/api/clusters/{id}/upgrade", post(routes::upgrade_cluster))
        .route(
            "/api/clusters/{id}/upgrade-plan",
            get(routes::get_upgrade_plan),
        )
        .route("/api/clusters/{id}/config", get(routes::get_cluster_config))
        .route(
            "/api/clusters/{id}/delete-nodes",
            post(routes::delete_nodes),
        )
        .route("/api/tasks/{id}", get(routes::get_task))
        .route("/api/events", get(routes::events::events_stream))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
