use cluster_core::CoreError;
use db::DbError;
use thiserror::Error;
use uuid::Uuid;

use crate::infra::InfraError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Cluster '{name}' already exists in {org}/{vdc}")]
    ClusterAlreadyExists {
        name: String,
        org: String,
        vdc: String,
    },

    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Invalid cluster name '{0}': must start with a letter, contain only alphanumerics or '-' and be at most 25 characters")]
    InvalidClusterName(String),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Error creating control plane node: {0}")]
    ControlPlaneNodeCreation(String),

    #[error("Error creating worker node: {0}")]
    WorkerNodeCreation(String),

    #[error("Error creating NFS node: {0}")]
    NfsNodeCreation(String),

    #[error("Join cluster failure on nodes {node_names:?}: {message}")]
    ClusterJoining {
        node_names: Vec<String>,
        message: String,
    },

    #[error("Couldn't initialize cluster: {0}")]
    ClusterInitialization(String),

    #[error("Failure on creating nodes {node_names:?}: {message}")]
    NodeCreation {
        node_names: Vec<String>,
        message: String,
    },

    #[error("Script execution failed on node '{node}': {message}")]
    ScriptExecution { node: String, message: String },

    #[error("Cluster '{name}' is busy ({phase}); wait for the current operation to finish")]
    ClusterBusy { name: String, phase: String },

    #[error("Template {target} is not a valid upgrade target for cluster '{cluster}'")]
    InvalidUpgradeTarget { cluster: String, target: String },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0}")]
    ClusterOperation(String),

    #[error("Failed to delete nodes: {0}")]
    DeleteNode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Storage error: {0}")]
    Store(DbError),

    #[error("Infrastructure error: {0}")]
    Infra(#[from] InfraError),

    #[error("Domain error: {0}")]
    Core(CoreError),
}

impl OrchestratorError {
    pub fn node_creation(node_names: Vec<String>, message: impl Into<String>) -> Self {
        Self::NodeCreation {
            node_names,
            message: message.into(),
        }
    }

    pub fn joining(node_names: Vec<String>, message: impl Into<String>) -> Self {
        Self::ClusterJoining {
            node_names,
            message: message.into(),
        }
    }

    pub fn script(node: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ScriptExecution {
            node: node.into(),
            message: message.into(),
        }
    }

    pub fn operation(message: impl Into<String>) -> Self {
        Self::ClusterOperation(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    /// Names of the nodes an add/join step attempted, used for targeted rollback.
    pub fn node_names(&self) -> Option<&[String]> {
        match self {
            Self::NodeCreation { node_names, .. } | Self::ClusterJoining { node_names, .. } => {
                Some(node_names)
            }
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ClusterNotFound(_) | Self::TaskNotFound(_))
    }
}

impl From<DbError> for OrchestratorError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::EntityNotFound(id) => Self::ClusterNotFound(id),
            DbError::TaskNotFound(id) => Self::TaskNotFound(id),
            other => Self::Store(other),
        }
    }
}

impl From<CoreError> for OrchestratorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::InvalidClusterName(name) => Self::InvalidClusterName(name),
            other => Self::Core(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;
