//! Cluster lifecycle event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope wrapping all events with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            event,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum Event {
    /// Cluster phase moved, e.g. `CREATE:IN_PROGRESS` -> `CREATE:SUCCEEDED`
    #[serde(rename = "cluster.phase_changed")]
    ClusterPhaseChanged {
        cluster_id: String,
        cluster_name: String,
        from_phase: String,
        to_phase: String,
    },

    #[serde(rename = "cluster.deleted")]
    ClusterDeleted {
        cluster_id: String,
        cluster_name: String,
    },

    #[serde(rename = "cluster.exposed")]
    ClusterExposed {
        cluster_id: String,
        external_ip: String,
    },

    #[serde(rename = "cluster.unexposed")]
    ClusterUnexposed {
        cluster_id: String,
        internal_ip: String,
    },

    #[serde(rename = "nodes.added")]
    NodesAdded {
        cluster_id: String,
        role: String,
        node_names: Vec<String>,
    },

    #[serde(rename = "nodes.deleted")]
    NodesDeleted {
        cluster_id: String,
        node_names: Vec<String>,
    },

    /// Progress or terminal update of an operation task
    #[serde(rename = "task.updated")]
    TaskUpdated {
        task_id: Uuid,
        cluster_id: Option<String>,
        status: String,
        message: String,
    },

    #[serde(rename = "error")]
    Error {
        message: String,
        context: Option<String>,
    },
}

impl Event {
    /// Cluster this event concerns, if any.
    pub fn cluster_id(&self) -> Option<&str> {
        match self {
            Self::ClusterPhaseChanged { cluster_id, .. }
            | Self::ClusterDeleted { cluster_id, .. }
            | Self::ClusterExposed { cluster_id, .. }
            | Self::ClusterUnexposed { cluster_id, .. }
            | Self::NodesAdded { cluster_id, .. }
            | Self::NodesDeleted { cluster_id, .. } => Some(cluster_id),
            Self::TaskUpdated { cluster_id, .. } => cluster_id.as_deref(),
            Self::Error { .. } => None,
        }
    }
}
