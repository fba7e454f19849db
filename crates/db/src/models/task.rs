use cluster_core::{Operation, Task, TaskStatus};
use uuid::Uuid;

use super::cluster::millis_to_datetime;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TaskRow {
    pub id: String,
    pub operation: String,
    pub cluster_id: Option<String>,
    pub status: String,
    pub message: String,
    pub error_detail: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRow {
    pub fn into_domain(self) -> Task {
        Task {
            id: Uuid::parse_str(&self.id).unwrap_or_default(),
            operation: Operation::parse(&self.operation).unwrap_or_default(),
            cluster_id: self.cluster_id,
            status: TaskStatus::parse(&self.status).unwrap_or_default(),
            message: self.message,
            error_detail: self.error_detail,
            created_at: millis_to_datetime(self.created_at),
            updated_at: millis_to_datetime(self.updated_at),
        }
    }
}

impl From<&Task> for TaskRow {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.to_string(),
            operation: task.operation.as_str().to_string(),
            cluster_id: task.cluster_id.clone(),
            status: task.status.as_str().to_string(),
            message: task.message.clone(),
            error_detail: task.error_detail.clone(),
            created_at: task.created_at.timestamp_millis(),
            updated_at: task.updated_at.timestamp_millis(),
        }
    }
}
