use std::time::Duration;

use cluster_core::TemplateRef;
use serde::{Deserialize, Serialize};

use crate::infra::GuestCredentials;

pub const DEFAULT_ENTITY_TYPE: &str = "native:2.0.0";
pub const DEFAULT_MAX_NODES_PER_POOL: u32 = 100;

/// Guest script readiness and retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptBudget {
    /// Readiness probes before a VM is declared unable to run scripts.
    pub readiness_attempts: u32,
    pub readiness_interval_secs: u64,
    /// Executions per script; only transport errors are retried.
    pub retry_attempts: u32,
}

impl ScriptBudget {
    pub fn readiness_interval(&self) -> Duration {
        Duration::from_secs(self.readiness_interval_secs)
    }
}

impl Default for ScriptBudget {
    fn default() -> Self {
        Self {
            readiness_attempts: 30,
            readiness_interval_secs: 2,
            retry_attempts: 1,
        }
    }
}

/// Polling budget for guest properties published by cloud-init.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuestPropertyBudget {
    pub attempts: u32,
    pub interval_secs: u64,
}

impl GuestPropertyBudget {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for GuestPropertyBudget {
    fn default() -> Self {
        Self {
            attempts: 120,
            interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Entity type new clusters are created with; its major version selects the backend.
    pub entity_type: String,
    pub default_template: Option<TemplateRef>,
    pub allow_nfs_scale_down: bool,
    /// Wait for a resize's add-nodes child before starting its delete-nodes child.
    pub serialize_add_before_delete: bool,
    pub delete_entity_on_cluster_delete: bool,
    /// Upper bound on the worker and nfs counts a request may ask for.
    pub max_nodes_per_pool: u32,
    pub guest_credentials: GuestCredentials,
    pub script: ScriptBudget,
    pub guest_property: GuestPropertyBudget,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            entity_type: DEFAULT_ENTITY_TYPE.to_string(),
            default_template: None,
            allow_nfs_scale_down: false,
            serialize_add_before_delete: true,
            delete_entity_on_cluster_delete: true,
            max_nodes_per_pool: DEFAULT_MAX_NODES_PER_POOL,
            guest_credentials: GuestCredentials::default(),
            script: ScriptBudget::default(),
            guest_property: GuestPropertyBudget::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self
    }

    pub fn with_default_template(mut self, template: TemplateRef) -> Self {
        self.default_template = Some(template);
        self
    }

    pub fn with_nfs_scale_down(mut self, allow: bool) -> Self {
        self.allow_nfs_scale_down = allow;
        self
    }

    pub fn with_serialized_resize(mut self, serialize: bool) -> Self {
        self.serialize_add_before_delete = serialize;
        self
    }

    pub fn with_entity_deletion(mut self, delete: bool) -> Self {
        self.delete_entity_on_cluster_delete = delete;
        self
    }

    pub fn with_max_nodes_per_pool(mut self, max: u32) -> Self {
        self.max_nodes_per_pool = max;
        self
    }

    pub fn with_guest_credentials(mut self, credentials: GuestCredentials) -> Self {
        self.guest_credentials = credentials;
        self
    }

    pub fn with_script_budget(mut self, budget: ScriptBudget) -> Self {
        self.script = budget;
        self
    }

    pub fn with_guest_property_budget(mut self, budget: GuestPropertyBudget) -> Self {
        self.guest_property = budget;
        self
    }
}
