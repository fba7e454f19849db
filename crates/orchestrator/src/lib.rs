//! Cluster lifecycle orchestration.
//!
//! Accepts create, resize, delete, upgrade and node-deletion requests for
//! kubernetes clusters, validates them against the stored entity and runs
//! the infrastructure work on detached workers that report through tasks.

pub mod backend;
pub mod bootstrap;
pub mod config;
pub mod context;
pub mod error;
pub mod infra;
pub mod network;
pub mod provisioner;
pub mod requests;
pub mod resources;
pub mod service;
pub mod simulated;
pub mod state_machine;
pub mod task_tracker;

pub use backend::{
    BackendFactory, CloudInitBackend, ClusterBackend, ClusterOperation, SchemaVersion,
    ScriptedBackend, CLOUD_INIT_ENTITY_TYPE, SCRIPTED_ENTITY_TYPE,
};
pub use config::{GuestPropertyBudget, OrchestratorConfig, ScriptBudget, DEFAULT_ENTITY_TYPE};
pub use context::RequestContext;
pub use error::{OrchestratorError, Result};
pub use infra::{
    GuestCredentials, GuestScriptExecutor, InfraError, InfraProvider, InfraResult, InfraTaskRef,
    InfraTaskStatus, NetworkGateway, NetworkScope, ScriptOutput, TemplateRegistry, VmGroupRef,
    VmInfo, VmSpec, VmState,
};
pub use requests::{CreateClusterRequest, ResizeRequest, UpdateClusterRequest};
pub use service::{ClusterService, ResizePlan, ServiceDeps};
pub use simulated::{SimulatedCloud, StaticTemplates};
pub use state_machine::ClusterStateMachine;
pub use task_tracker::{TaskRegistry, TaskTracker};
