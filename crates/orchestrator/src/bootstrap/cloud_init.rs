use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cluster_core::NodeRole;
use tracing::{debug, info};

use super::{BootstrapContext, ControlPlaneOutcome, NodeBootstrap};
use crate::error::{OrchestratorError, Result};
use crate::infra::VmGroupRef;
use crate::network::{NetworkExposure, KUBE_API_PORT};
use crate::provisioner::{JoinCommand, NodeProvisioner, NodeRequest};

pub const TOKEN_INFO_PROPERTY: &str = "guestinfo.kubeadm.token.info";
pub const KUBECONFIG_PROPERTY: &str = "guestinfo.kubeconfig";
pub const JOIN_STATUS_PROPERTY: &str = "guestinfo.postcustomization.kubeadm.node.join.status";
pub const JOIN_STATUS_SUCCESSFUL: &str = "successful";

/// Cloud-init data injected before first boot; progress is read from guest properties.
#[derive(Debug, Clone, Copy, Default)]
pub struct CloudInitBootstrap;

fn decode_kubeconfig(encoded: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| OrchestratorError::ClusterInitialization(format!("Invalid kubeconfig encoding: {}", e)))?;
    String::from_utf8(bytes)
        .map_err(|e| OrchestratorError::ClusterInitialization(format!("Invalid kubeconfig: {}", e)))
}

async fn launch_worker(
    provisioner: &NodeProvisioner,
    ctx: &BootstrapContext<'_>,
    name: &str,
    join: &JoinCommand,
) -> Result<()> {
    let data = provisioner
        .scripts()
        .cloud_init_worker(ctx.template, name, join, ctx.ssh_key())
        .await?;
    provisioner.customize_guest(ctx.group, name, &data).await?;
    provisioner.power_on(ctx.group, name).await
}

#[async_trait]
impl NodeBootstrap for CloudInitBootstrap {
    fn generation(&self) -> &'static str {
        "cloud-init"
    }

    async fn provision_control_plane(
        &self,
        provisioner: &NodeProvisioner,
        ctx: &BootstrapContext<'_>,
        exposure: Option<&NetworkExposure>,
    ) -> Result<ControlPlaneOutcome> {
        let cp_error = |e: OrchestratorError| OrchestratorError::ControlPlaneNodeCreation(e.to_string());

        let request = NodeRequest::from_pool(
            NodeRole::ControlPlane,
            1,
            &ctx.spec.network,
            &ctx.spec.control_plane,
        );
        let specs = provisioner
            .clone_nodes(ctx.group, ctx.template, &request, false)
            .await
            .map_err(cp_error)?;
        let node_name = specs
            .first()
            .map(|s| s.name.clone())
            .ok_or_else(|| OrchestratorError::ControlPlaneNodeCreation("no node created".to_string()))?;

        let internal_ip = provisioner
            .primary_ip(ctx.group, &node_name)
            .await
            .map_err(cp_error)?;

        // The endpoint is baked into cloud-init, so exposure has to succeed first.
        let external_ip = match exposure {
            Some(exposure) => Some(
                exposure
                    .expose(ctx.scope, &internal_ip, ctx.cluster_name, ctx.cluster_id)
                    .await
                    .map_err(cp_error)?,
            ),
            None => None,
        };
        let endpoint = format!(
            "{}:{}",
            external_ip.as_deref().unwrap_or(internal_ip.as_str()),
            KUBE_API_PORT
        );

        let data = provisioner
            .scripts()
            .cloud_init_control_plane(ctx.template, &node_name, &endpoint, ctx.ssh_key())
            .await?;
        provisioner
            .customize_guest(ctx.group, &node_name, &data)
            .await
            .map_err(cp_error)?;
        provisioner
            .power_on(ctx.group, &node_name)
            .await
            .map_err(cp_error)?;

        let init_error = |e: OrchestratorError| OrchestratorError::ClusterInitialization(e.to_string());
        provisioner
            .wait_for_guest_property(ctx.group, &node_name, TOKEN_INFO_PROPERTY)
            .await
            .map_err(init_error)?;
        let encoded = provisioner
            .wait_for_guest_property(ctx.group, &node_name, KUBECONFIG_PROPERTY)
            .await
            .map_err(init_error)?;
        let kubeconfig = decode_kubeconfig(&encoded)?;

        info!(cluster_id = ctx.cluster_id, node = %node_name, endpoint = %endpoint, "Control plane ready");
        Ok(ControlPlaneOutcome {
            node_name,
            internal_ip,
            external_ip,
            kubeconfig: Some(kubeconfig),
        })
    }

    async fn provision_workers(
        &self,
        provisioner: &NodeProvisioner,
        ctx: &BootstrapContext<'_>,
        request: &NodeRequest,
        control_plane: &str,
    ) -> Result<Vec<String>> {
        let specs = provisioner
            .clone_nodes(ctx.group, ctx.template, request, false)
            .await?;
        let names: Vec<String> = specs.into_iter().map(|s| s.name).collect();
        if names.is_empty() {
            return Ok(names);
        }

        let raw = provisioner
            .wait_for_guest_property(ctx.group, control_plane, TOKEN_INFO_PROPERTY)
            .await
            .map_err(|e| OrchestratorError::joining(names.clone(), e.to_string()))?;
        let join = JoinCommand::parse(raw.trim()).ok_or_else(|| {
            OrchestratorError::joining(names.clone(), format!("Malformed join command '{}'", raw.trim()))
        })?;

        for name in &names {
            launch_worker(provisioner, ctx, name, &join)
                .await
                .map_err(|e| OrchestratorError::node_creation(names.clone(), e.to_string()))?;
        }

        let mut failed = Vec::new();
        let mut messages = Vec::new();
        for name in &names {
            match provisioner
                .wait_for_guest_property(ctx.group, name, JOIN_STATUS_PROPERTY)
                .await
            {
                Ok(status) if status.trim() == JOIN_STATUS_SUCCESSFUL => {
                    debug!(node = %name, "Node joined cluster");
                }
                Ok(status) => {
                    messages.push(format!("{}: join status '{}'", name, status.trim()));
                    failed.push(name.clone());
                }
                Err(e) => {
                    messages.push(format!("{}: {}", name, e));
                    failed.push(name.clone());
                }
            }
        }

        if !failed.is_empty() {
            return Err(OrchestratorError::joining(failed, messages.join("; ")));
        }
        Ok(names)
    }

    async fn provision_nfs(
        &self,
        provisioner: &NodeProvisioner,
        ctx: &BootstrapContext<'_>,
        request: &NodeRequest,
    ) -> Result<Vec<String>> {
        // NFS servers are not kubernetes members; they are set up after boot.
        let specs = provisioner
            .add_nodes(ctx.group, ctx.template, request, ctx.ssh_key())
            .await?;
        Ok(specs.into_iter().map(|s| s.name).collect())
    }

    async fn control_plane_ip(
        &self,
        provisioner: &NodeProvisioner,
        group: &VmGroupRef,
        control_plane: &str,
    ) -> Result<String> {
        provisioner.primary_ip(group, control_plane).await
    }

    async fn kubeconfig(
        &self,
        provisioner: &NodeProvisioner,
        group: &VmGroupRef,
        control_plane: &str,
    ) -> Result<Option<String>> {
        let encoded = provisioner
            .wait_for_guest_property(group, control_plane, KUBECONFIG_PROPERTY)
            .await?;
        decode_kubeconfig(&encoded).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_kubeconfig() {
        let encoded = STANDARD.encode("apiVersion: v1\n");
        assert_eq!(decode_kubeconfig(&encoded).unwrap(), "apiVersion: v1\n");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_kubeconfig("%%%not-base64").unwrap_err();
        assert!(matches!(err, OrchestratorError::ClusterInitialization(_)));
    }
}
