use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use cluster_core::{Task, TaskStatus};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;

/// Pollable view of an operation's progress.
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskResponse {
    pub id: Uuid,
    pub operation: String,
    pub cluster_id: Option<String>,
    pub status: TaskStatus,
    pub message: String,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            operation: task.operation.to_string(),
            cluster_id: task.cluster_id,
            status: task.status,
            message: task.message,
            error_message: task.error_detail,
            created_at: task.created_at,
            updated_at: task.updated_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/tasks/{id}",
    params(
        ("id" = Uuid, Path, description = "Task ID"),
    ),
    responses(
        (status = 200, description = "Task state", body = TaskResponse),
        (status = 404, description = "Task not found"),
    ),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskResponse>, AppError> {
    match state.tasks.get(id).await? {
        Some(task) => Ok(Json(task.into())),
        None => Err(AppError::NotFound(format!("Task not found: {}", id))),
    }
}
