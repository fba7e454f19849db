use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use orchestrator::OrchestratorError;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Orchestrator(OrchestratorError),
}

#[derive(Serialize, ToSchema)]
pub struct ErrorResponse {
    error: String,
    message: String,
}

impl AppError {
    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg),
            AppError::Orchestrator(err) => {
                let message = err.to_string();
                match err {
                    e if e.is_not_found() => (StatusCode::NOT_FOUND, "not_found", message),
                    OrchestratorError::ClusterAlreadyExists { .. } => {
                        (StatusCode::CONFLICT, "cluster_exists", message)
                    }
                    OrchestratorError::ClusterBusy { .. }
                    | OrchestratorError::InvalidTransition { .. } => {
                        (StatusCode::CONFLICT, "cluster_busy", message)
                    }
                    OrchestratorError::InvalidClusterName(_)
                    | OrchestratorError::InvalidTemplate(_)
                    | OrchestratorError::InvalidUpgradeTarget { .. }
                    | OrchestratorError::InvalidRequest(_)
                    | OrchestratorError::Core(_) => {
                        (StatusCode::BAD_REQUEST, "invalid_request", message)
                    }
                    other => {
                        tracing::error!(error = ?other, "Orchestrator error");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "operation_failed",
                            message,
                        )
                    }
                }
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = self.parts();

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}

impl From<OrchestratorError> for AppError {
    fn from(err: OrchestratorError) -> Self {
        AppError::Orchestrator(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn status_of(err: OrchestratorError) -> StatusCode {
        AppError::from(err).parts().0
    }

    #[test]
    fn test_orchestrator_error_status_codes() {
        assert_eq!(
            status_of(OrchestratorError::ClusterNotFound("urn:cluster:1".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(OrchestratorError::TaskNotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(OrchestratorError::ClusterBusy {
                name: "foo".into(),
                phase: "UPDATE:IN_PROGRESS".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(OrchestratorError::ClusterAlreadyExists {
                name: "foo".into(),
                org: "org".into(),
                vdc: "vdc".into()
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(OrchestratorError::InvalidClusterName("1foo".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(OrchestratorError::invalid_request("nope")),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(OrchestratorError::operation("Failed to get cluster kube-config")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_type_labels() {
        let (_, label, message) = AppError::NotFound("Task not found: x".into()).parts();
        assert_eq!(label, "not_found");
        assert_eq!(message, "Task not found: x");
    }
}
