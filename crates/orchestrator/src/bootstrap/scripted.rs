use async_trait::async_trait;
use cluster_core::NodeRole;
use tracing::{info, warn};

use super::{BootstrapContext, ControlPlaneOutcome, NodeBootstrap};
use crate::error::{OrchestratorError, Result};
use crate::infra::VmGroupRef;
use crate::network::NetworkExposure;
use crate::provisioner::{NodeProvisioner, NodeRequest};

/// Post-boot customization through guest scripts.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptBootstrap;

#[async_trait]
impl NodeBootstrap for ScriptBootstrap {
    fn generation(&self) -> &'static str {
        "scripted"
    }

    async fn provision_control_plane(
        &self,
        provisioner: &NodeProvisioner,
        ctx: &BootstrapContext<'_>,
        exposure: Option<&NetworkExposure>,
    ) -> Result<ControlPlaneOutcome> {
        let request = NodeRequest::from_pool(
            NodeRole::ControlPlane,
            1,
            &ctx.spec.network,
            &ctx.spec.control_plane,
        );
        let specs = provisioner
            .add_nodes(ctx.group, ctx.template, &request, ctx.ssh_key())
            .await
            .map_err(|e| OrchestratorError::ControlPlaneNodeCreation(e.to_string()))?;
        let node_name = specs
            .first()
            .map(|s| s.name.clone())
            .ok_or_else(|| OrchestratorError::ControlPlaneNodeCreation("no node created".to_string()))?;

        let internal_ip = provisioner
            .control_plane_ip(ctx.group, &node_name)
            .await
            .map_err(|e| OrchestratorError::ControlPlaneNodeCreation(e.to_string()))?;

        // Exposure is best-effort here; the cluster stays reachable internally.
        let mut external_ip = None;
        if let Some(exposure) = exposure {
            match exposure
                .expose(ctx.scope, &internal_ip, ctx.cluster_name, ctx.cluster_id)
                .await
            {
                Ok(ip) => external_ip = Some(ip),
                Err(e) => warn!(
                    cluster_id = ctx.cluster_id,
                    error = %e,
                    "Failed to expose cluster; continuing unexposed"
                ),
            }
        }

        provisioner
            .init_cluster(ctx.group, ctx.template, &node_name, external_ip.as_deref())
            .await?;

        let kubeconfig = match provisioner.read_kubeconfig(ctx.group, &node_name).await {
            Ok(config) => Some(config),
            Err(e) => {
                warn!(cluster_id = ctx.cluster_id, error = %e, "Failed to read kubeconfig");
                None
            }
        };

        info!(cluster_id = ctx.cluster_id, node = %node_name, "Control plane ready");
        Ok(ControlPlaneOutcome {
            node_name,
            internal_ip,
            external_ip,
            kubeconfig,
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
            .add_nodes(ctx.group, ctx.template, request, ctx.ssh_key())
            .await?;
        let names: Vec<String> = specs.into_iter().map(|s| s.name).collect();

        provisioner
            .join_cluster(ctx.group, ctx.template, control_plane, &names)
            .await?;
        Ok(names)
    }

    async fn provision_nfs(
        &self,
        provisioner: &NodeProvisioner,
        ctx: &BootstrapContext<'_>,
        request: &NodeRequest,
    ) -> Result<Vec<String>> {
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
        provisioner.control_plane_ip(group, control_plane).await
    }

    async fn kubeconfig(
        &self,
        provisioner: &NodeProvisioner,
        group: &VmGroupRef,
        control_plane: &str,
    ) -> Result<Option<String>> {
        let config = provisioner.read_kubeconfig(group, control_plane).await?;
        Ok(Some(config).filter(|c| !c.trim().is_empty()))
    }
}
