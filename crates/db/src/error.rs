use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Entity already exists: {0}")]
    EntityExists(String),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),
}

impl DbError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound(_) | Self::TaskNotFound(_))
    }
}
