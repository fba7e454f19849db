//! How nodes become kubernetes members.
//!
//! Each entity schema generation bootstraps nodes differently. Generation 1
//! boots VMs and customizes them with guest scripts; generation 2 injects
//! cloud-init data before first boot and reads results back from guest
//! properties. Both are expressed as a [`NodeBootstrap`] over the shared
//! [`NodeProvisioner`] primitives.

mod cloud_init;
mod scripted;

use async_trait::async_trait;
use cluster_core::{ClusterSpec, Template};

use crate::error::Result;
use crate::infra::{NetworkScope, VmGroupRef};
use crate::network::NetworkExposure;
use crate::provisioner::{NodeProvisioner, NodeRequest};

pub use cloud_init::{
    CloudInitBootstrap, JOIN_STATUS_PROPERTY, JOIN_STATUS_SUCCESSFUL, KUBECONFIG_PROPERTY,
    TOKEN_INFO_PROPERTY,
};
pub use scripted::ScriptBootstrap;

/// Everything a bootstrap step needs to know about the cluster being built.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapContext<'a> {
    pub group: &'a VmGroupRef,
    pub cluster_id: &'a str,
    pub cluster_name: &'a str,
    pub template: &'a Template,
    pub spec: &'a ClusterSpec,
    pub scope: &'a NetworkScope,
}

impl BootstrapContext<'_> {
    pub fn ssh_key(&self) -> Option<&str> {
        self.spec.ssh_key.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneOutcome {
    pub node_name: String,
    pub internal_ip: String,
    /// Set when the endpoint was exposed through the gateway.
    pub external_ip: Option<String>,
    pub kubeconfig: Option<String>,
}

#[async_trait]
pub trait NodeBootstrap: Send + Sync + 'static {
    fn generation(&self) -> &'static str;

    /// Create, optionally expose and initialize the single control-plane node.
    async fn provision_control_plane(
        &self,
        provisioner: &NodeProvisioner,
        ctx: &BootstrapContext<'_>,
        exposure: Option<&NetworkExposure>,
    ) -> Result<ControlPlaneOutcome>;

    /// Add worker nodes and join them to the control plane.
    ///
    /// Fails with `NodeCreation` or `ClusterJoining` naming the affected nodes.
    async fn provision_workers(
        &self,
        provisioner: &NodeProvisioner,
        ctx: &BootstrapContext<'_>,
        request: &NodeRequest,
        control_plane: &str,
    ) -> Result<Vec<String>>;

    async fn provision_nfs(
        &self,
        provisioner: &NodeProvisioner,
        ctx: &BootstrapContext<'_>,
        request: &NodeRequest,
    ) -> Result<Vec<String>>;

    async fn control_plane_ip(
        &self,
        provisioner: &NodeProvisioner,
        group: &VmGroupRef,
        control_plane: &str,
    ) -> Result<String>;

    /// Current kubeconfig read from the live control plane.
    async fn kubeconfig(
        &self,
        provisioner: &NodeProvisioner,
        group: &VmGroupRef,
        control_plane: &str,
    ) -> Result<Option<String>>;
}
