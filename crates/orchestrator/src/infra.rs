//! Infrastructure capabilities consumed by the orchestrator.
//!
//! The virtualization platform, guest operations, template catalog and edge
//! gateway are external collaborators. Each is reached through one of the
//! traits below so the lifecycle engine can run against any implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cluster_core::{NodeRole, Template};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::provisioner::ScriptKind;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InfraError {
    #[error("Request failed: {0}")]
    Request(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Task {task} finished with status {status}")]
    TaskFailed { task: String, status: String },

    #[error("Timed out: {0}")]
    Timeout(String),
}

impl InfraError {
    pub fn request(message: impl Into<String>) -> Self {
        Self::Request(message.into())
    }
}

pub type InfraResult<T> = std::result::Result<T, InfraError>;

/// Live handle of the VM group backing a cluster.
///
/// Only `id` is persisted (as the entity's `external_id`); the handle is
/// re-resolved through [`InfraProvider::find_vm_group`] for each operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmGroupRef {
    pub id: String,
    pub name: String,
}

impl VmGroupRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Asynchronous infrastructure task handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InfraTaskRef {
    pub id: String,
    pub operation: String,
}

impl InfraTaskRef {
    pub fn new(id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfraTaskStatus {
    Success,
    Error(String),
    Aborted,
}

impl InfraTaskStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Lifecycle state of a VM as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmState {
    /// The VM record exists but has not materialized yet.
    Unresolved,
    Resolved,
    PoweredOn,
    PoweredOff,
    Suspended,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    pub name: String,
    pub state: VmState,
    pub ip: Option<String>,
    pub sizing_class: Option<String>,
}

/// Clone request for one VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub name: String,
    pub role: NodeRole,
    pub source_vm: String,
    pub catalog_item: String,
    pub network: String,
    pub storage_profile: Option<String>,
    pub sizing_class: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

impl Default for GuestCredentials {
    fn default() -> Self {
        Self {
            username: "root".to_string(),
            password: String::new(),
        }
    }
}

/// Organization, VDC and network a cluster lives in; gateways are resolved from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkScope {
    pub org_name: String,
    pub vdc_name: String,
    pub network: String,
}

impl NetworkScope {
    pub fn new(
        org_name: impl Into<String>,
        vdc_name: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            org_name: org_name.into(),
            vdc_name: vdc_name.into(),
            network: network.into(),
        }
    }
}

#[async_trait]
pub trait InfraProvider: Send + Sync {
    async fn create_vm_group(&self, name: &str, network: &str) -> InfraResult<VmGroupRef>;

    async fn find_vm_group(&self, external_id: &str) -> InfraResult<VmGroupRef>;

    async fn add_vms(
        &self,
        group: &VmGroupRef,
        specs: &[VmSpec],
        power_on: bool,
    ) -> InfraResult<InfraTaskRef>;

    async fn power_on(&self, group: &VmGroupRef, vm: &str) -> InfraResult<InfraTaskRef>;

    async fn set_metadata(
        &self,
        group: &VmGroupRef,
        metadata: &BTreeMap<String, String>,
    ) -> InfraResult<InfraTaskRef>;

    async fn delete_vm_group(&self, group: &VmGroupRef) -> InfraResult<InfraTaskRef>;

    /// Block until `task` reaches a terminal status.
    async fn wait_for_task_status(&self, task: &InfraTaskRef) -> InfraResult<InfraTaskStatus>;

    async fn list_vms(&self, group: &VmGroupRef) -> InfraResult<Vec<VmInfo>>;

    async fn undeploy_vm(&self, group: &VmGroupRef, vm: &str) -> InfraResult<InfraTaskRef>;

    async fn delete_vms(&self, group: &VmGroupRef, names: &[String]) -> InfraResult<InfraTaskRef>;

    async fn set_guest_customization(
        &self,
        group: &VmGroupRef,
        vm: &str,
        data: &str,
    ) -> InfraResult<InfraTaskRef>;

    /// `None` until the guest publishes the property.
    async fn get_guest_property(
        &self,
        group: &VmGroupRef,
        vm: &str,
        key: &str,
    ) -> InfraResult<Option<String>>;
}

#[async_trait]
pub trait GuestScriptExecutor: Send + Sync {
    async fn wait_until_tools_ready(&self, group: &VmGroupRef, vm: &str) -> InfraResult<()>;

    async fn execute_script(
        &self,
        group: &VmGroupRef,
        vm: &str,
        credentials: &GuestCredentials,
        script: &str,
    ) -> InfraResult<ScriptOutput>;
}

#[async_trait]
pub trait TemplateRegistry: Send + Sync {
    async fn get_template(&self, name: &str, revision: u32) -> InfraResult<Option<Template>>;

    async fn list_templates(&self) -> InfraResult<Vec<Template>>;

    /// Template specific body for `kind`; `None` selects the built-in default.
    async fn script(&self, _template: &Template, _kind: ScriptKind) -> InfraResult<Option<String>> {
        Ok(None)
    }
}

#[async_trait]
pub trait NetworkGateway: Send + Sync {
    async fn get_available_ip(&self, scope: &NetworkScope) -> InfraResult<Option<String>>;

    /// Map `external_ip` to `internal_ip` on the kubernetes API port.
    async fn add_dnat_rule(
        &self,
        scope: &NetworkScope,
        name: &str,
        internal_ip: &str,
        external_ip: &str,
    ) -> InfraResult<()>;

    async fn delete_dnat_rule(&self, scope: &NetworkScope, name: &str) -> InfraResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_output_success() {
        assert!(ScriptOutput::success("ok").is_success());
        assert!(!ScriptOutput::failure(2, "boom").is_success());
    }

    #[test]
    fn test_default_credentials_are_root() {
        assert_eq!(GuestCredentials::default().username, "root");
    }

    #[test]
    fn test_task_failed_display() {
        let err = InfraError::TaskFailed {
            task: "task-1".to_string(),
            status: "aborted".to_string(),
        };
        assert_eq!(err.to_string(), "Task task-1 finished with status aborted");
    }
}
