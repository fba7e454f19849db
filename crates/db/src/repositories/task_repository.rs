use async_trait::async_trait;
use cluster_core::Task;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::DbError;
use crate::models::TaskRow;
use crate::store::TaskStore;

#[derive(Clone)]
pub struct TaskRepository {
    pool: SqlitePool,
}

impl TaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for TaskRepository {
    async fn save(&self, task: &Task) -> Result<(), DbError> {
        let row = TaskRow::from(task);

        sqlx::query(
            r#"
            INSERT INTO tasks (id, operation, cluster_id, status, message, error_detail, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                message = excluded.message,
                error_detail = excluded.error_detail,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&row.id)
        .bind(&row.operation)
        .bind(&row.cluster_id)
        .bind(&row.status)
        .bind(&row.message)
        .bind(&row.error_detail)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Task>, DbError> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, operation, cluster_id, status, message, error_detail, created_at, updated_at
            FROM tasks
            WHERE id = ?
            "#,
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(TaskRow::into_domain))
    }

    async fn find_by_cluster(&self, cluster_id: &str) -> Result<Vec<Task>, DbError> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            r#"
            SELECT id, operation, cluster_id, status, message, error_detail, created_at, updated_at
            FROM tasks
            WHERE cluster_id = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(cluster_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TaskRow::into_domain).collect())
    }
}
