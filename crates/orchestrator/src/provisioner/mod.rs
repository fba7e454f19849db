//! Node provisioning on top of the infrastructure and guest capabilities.
//!
//! [`NodeProvisioner`] clones VMs into a cluster's VM group and drives the
//! kubernetes node lifecycle on them: initialize, join, drain, uncordon and
//! delete. Bootstrap specifics (post-boot scripts vs. cloud-init) live in
//! [`crate::bootstrap`] and are built from the primitives here.

mod guest;
mod names;
mod scripts;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use cluster_core::{Node, NodePoolSpec, NodeRole, Template};
use tracing::{debug, info, warn};

use crate::config::{GuestPropertyBudget, OrchestratorConfig};
use crate::error::{OrchestratorError, Result};
use crate::infra::{
    GuestScriptExecutor, InfraError, InfraProvider, InfraTaskRef, TemplateRegistry, VmGroupRef,
    VmInfo, VmSpec, VmState,
};

pub use guest::GuestRunner;
pub use names::generate_node_names;
pub use scripts::{
    parse_nfs_exports, render, with_control_plane_endpoint, JoinCommand, ScriptCatalog,
    ScriptKind, KUBECONFIG_PATH,
};

/// What to clone for one node pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRequest {
    pub role: NodeRole,
    pub count: u32,
    pub network: String,
    pub storage_profile: Option<String>,
    pub sizing_class: Option<String>,
}

impl NodeRequest {
    pub fn new(role: NodeRole, count: u32, network: impl Into<String>) -> Self {
        Self {
            role,
            count,
            network: network.into(),
            storage_profile: None,
            sizing_class: None,
        }
    }

    pub fn from_pool(role: NodeRole, count: u32, network: &str, pool: &NodePoolSpec) -> Self {
        Self {
            role,
            count,
            network: network.to_string(),
            storage_profile: pool.storage_profile.clone(),
            sizing_class: pool.sizing_class.clone(),
        }
    }
}

#[derive(Clone)]
pub struct NodeProvisioner {
    infra: Arc<dyn InfraProvider>,
    guest: GuestRunner,
    scripts: ScriptCatalog,
    guest_property: GuestPropertyBudget,
}

impl NodeProvisioner {
    pub fn new(
        infra: Arc<dyn InfraProvider>,
        executor: Arc<dyn GuestScriptExecutor>,
        templates: Arc<dyn TemplateRegistry>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            infra,
            guest: GuestRunner::new(
                executor,
                config.guest_credentials.clone(),
                config.script.clone(),
            ),
            scripts: ScriptCatalog::new(templates),
            guest_property: config.guest_property.clone(),
        }
    }

    pub fn guest(&self) -> &GuestRunner {
        &self.guest
    }

    pub fn scripts(&self) -> &ScriptCatalog {
        &self.scripts
    }

    pub async fn create_group(&self, name: &str, network: &str) -> Result<VmGroupRef> {
        self.infra
            .create_vm_group(name, network)
            .await
            .map_err(|e| OrchestratorError::operation(format!("Error creating cluster vApp: {}", e)))
    }

    pub async fn find_group(&self, external_id: &str) -> Result<VmGroupRef> {
        Ok(self.infra.find_vm_group(external_id).await?)
    }

    pub async fn delete_group(&self, group: &VmGroupRef) -> Result<()> {
        let task = self.infra.delete_vm_group(group).await?;
        self.wait(&task).await
    }

    /// Block on an infrastructure task; any non-success outcome is an error.
    pub async fn wait(&self, task: &InfraTaskRef) -> Result<()> {
        let status = self.infra.wait_for_task_status(task).await?;
        if status.is_success() {
            return Ok(());
        }
        Err(InfraError::TaskFailed {
            task: format!("{} ({})", task.operation, task.id),
            status: format!("{:?}", status),
        }
        .into())
    }

    pub async fn set_metadata(
        &self,
        group: &VmGroupRef,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        let task = self.infra.set_metadata(group, metadata).await?;
        self.wait(&task).await
    }

    pub async fn power_on(&self, group: &VmGroupRef, vm: &str) -> Result<()> {
        let task = self.infra.power_on(group, vm).await?;
        self.wait(&task).await
    }

    pub async fn customize_guest(&self, group: &VmGroupRef, vm: &str, data: &str) -> Result<()> {
        let task = self.infra.set_guest_customization(group, vm, data).await?;
        self.wait(&task).await
    }

    pub async fn list_vms(&self, group: &VmGroupRef) -> Result<Vec<VmInfo>> {
        Ok(self.infra.list_vms(group).await?)
    }

    /// Clone `request.count` VMs from the template with fresh names.
    ///
    /// Every failure is reported as [`OrchestratorError::NodeCreation`]
    /// carrying all names of the batch.
    pub async fn clone_nodes(
        &self,
        group: &VmGroupRef,
        template: &Template,
        request: &NodeRequest,
        power_on: bool,
    ) -> Result<Vec<VmSpec>> {
        if request.count == 0 {
            return Ok(Vec::new());
        }

        let existing: HashSet<String> = self
            .list_vms(group)
            .await?
            .into_iter()
            .map(|vm| vm.name)
            .collect();
        let names = generate_node_names(request.role, request.count, &existing)
            .map_err(|e| OrchestratorError::node_creation(Vec::new(), e.to_string()))?;

        let specs: Vec<VmSpec> = names
            .iter()
            .map(|name| VmSpec {
                name: name.clone(),
                role: request.role,
                source_vm: template.source_vm.clone(),
                catalog_item: template.catalog_item.clone(),
                network: request.network.clone(),
                storage_profile: request.storage_profile.clone(),
                sizing_class: request.sizing_class.clone(),
            })
            .collect();

        debug!(group = %group.name, role = request.role.as_str(), nodes = ?names, "Cloning nodes");
        let cloned = match self.infra.add_vms(group, &specs, power_on).await {
            Ok(task) => self.wait(&task).await,
            Err(e) => Err(e.into()),
        };
        cloned.map_err(|e| OrchestratorError::node_creation(names.clone(), e.to_string()))?;
        Ok(specs)
    }

    /// Clone powered-on nodes and customize them with post-boot scripts.
    pub async fn add_nodes(
        &self,
        group: &VmGroupRef,
        template: &Template,
        request: &NodeRequest,
        ssh_key: Option<&str>,
    ) -> Result<Vec<VmSpec>> {
        let specs = self.clone_nodes(group, template, request, true).await?;
        let names: Vec<String> = specs.iter().map(|s| s.name.clone()).collect();

        let customized = async {
            for spec in &specs {
                self.guest.wait_ready(group, &spec.name).await?;
                if let Some(key) = ssh_key {
                    let script = self.scripts.ssh_key(template, key).await?;
                    self.guest.run(group, &spec.name, &script).await?;
                }
                if spec.role == NodeRole::Nfs {
                    let script = self.scripts.body(template, ScriptKind::NfsEnable).await?;
                    self.guest.run(group, &spec.name, &script).await?;
                }
            }
            Ok::<(), OrchestratorError>(())
        }
        .await;

        customized.map_err(|e| OrchestratorError::node_creation(names, e.to_string()))?;
        info!(group = %group.name, role = request.role.as_str(), count = specs.len(), "Nodes added");
        Ok(specs)
    }

    pub async fn init_cluster(
        &self,
        group: &VmGroupRef,
        template: &Template,
        control_plane: &str,
        expose_ip: Option<&str>,
    ) -> Result<()> {
        let script = self.scripts.control_plane_init(template, expose_ip).await?;
        self.guest
            .run_when_ready(group, control_plane, &script)
            .await
            .map_err(|e| OrchestratorError::ClusterInitialization(e.to_string()))?;
        info!(group = %group.name, control_plane, "Control plane initialized");
        Ok(())
    }

    pub async fn join_command(&self, group: &VmGroupRef, control_plane: &str) -> Result<JoinCommand> {
        let output = self
            .guest
            .run_when_ready(group, control_plane, scripts::JOIN_COMMAND_SCRIPT)
            .await?;
        JoinCommand::parse(output.stdout.trim()).ok_or_else(|| {
            OrchestratorError::operation(format!(
                "Unexpected join command from {}: '{}'",
                control_plane,
                output.stdout.trim()
            ))
        })
    }

    /// Join `workers` to the cluster; the error lists the nodes that failed.
    pub async fn join_cluster(
        &self,
        group: &VmGroupRef,
        template: &Template,
        control_plane: &str,
        workers: &[String],
    ) -> Result<()> {
        if workers.is_empty() {
            return Ok(());
        }

        let join = self
            .join_command(group, control_plane)
            .await
            .map_err(|e| OrchestratorError::joining(workers.to_vec(), e.to_string()))?;
        let script = self.scripts.node_join(template, &join).await?;

        let mut failed = Vec::new();
        let mut messages = Vec::new();
        for (node, result) in self.guest.run_on_nodes(group, workers, &script).await {
            if let Err(e) = result {
                messages.push(e.to_string());
                failed.push(node);
            }
        }

        if !failed.is_empty() {
            return Err(OrchestratorError::joining(failed, messages.join("; ")));
        }
        info!(group = %group.name, workers = ?workers, "Nodes joined cluster");
        Ok(())
    }

    /// Internal address of the control plane as reported by its guest.
    pub async fn control_plane_ip(&self, group: &VmGroupRef, control_plane: &str) -> Result<String> {
        let output = self
            .guest
            .run_when_ready(group, control_plane, scripts::CONTROL_PLANE_IP_SCRIPT)
            .await?;
        let ip = output.stdout.trim();
        if ip.is_empty() {
            return Err(OrchestratorError::operation(format!(
                "Failed to get the IP of control plane node {}",
                control_plane
            )));
        }
        Ok(ip.to_string())
    }

    /// Primary address the provider reports for `vm`.
    pub async fn primary_ip(&self, group: &VmGroupRef, vm: &str) -> Result<String> {
        self.list_vms(group)
            .await?
            .into_iter()
            .find(|info| info.name == vm)
            .and_then(|info| info.ip)
            .ok_or_else(|| {
                OrchestratorError::operation(format!("No IP address reported for node {}", vm))
            })
    }

    /// Run `script` on each node; every failing node is named in the error.
    pub async fn run_on_nodes(&self, group: &VmGroupRef, nodes: &[String], script: &str) -> Result<()> {
        let failures: Vec<String> = self
            .guest
            .run_on_nodes(group, nodes, script)
            .await
            .into_iter()
            .filter_map(|(_, result)| result.err().map(|e| e.to_string()))
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::script(nodes.join(","), failures.join("; ")))
        }
    }

    pub async fn drain_nodes(&self, group: &VmGroupRef, control_plane: &str, nodes: &[String]) -> Result<()> {
        for node in nodes {
            debug!(node = %node, "Draining node");
            self.guest
                .run_when_ready(group, control_plane, &scripts::drain_command(node))
                .await?;
        }
        Ok(())
    }

    pub async fn uncordon_nodes(
        &self,
        group: &VmGroupRef,
        control_plane: &str,
        nodes: &[String],
    ) -> Result<()> {
        for node in nodes {
            debug!(node = %node, "Uncordoning node");
            self.guest
                .run_when_ready(group, control_plane, &scripts::uncordon_command(node))
                .await?;
        }
        Ok(())
    }

    /// Remove nodes from kubernetes and from the VM group.
    ///
    /// Drain, `kubectl delete node` and undeploy are best-effort; only the
    /// final VM deletion can fail the call. Without a control plane the
    /// kubernetes steps are skipped.
    pub async fn delete_nodes(
        &self,
        group: &VmGroupRef,
        control_plane: Option<&str>,
        nodes: &[String],
    ) -> Result<()> {
        if nodes.is_empty() {
            return Ok(());
        }

        if let Some(cp) = control_plane {
            for node in nodes {
                if let Err(e) = self
                    .guest
                    .run_when_ready(group, cp, &scripts::drain_command(node))
                    .await
                {
                    warn!(node = %node, error = %e, "Failed to drain node; deleting anyway");
                }
            }
            for node in nodes {
                if let Err(e) = self
                    .guest
                    .run(group, cp, &scripts::delete_node_command(node))
                    .await
                {
                    warn!(node = %node, error = %e, "Failed to delete node from kubernetes");
                }
            }
        }

        for node in nodes {
            let undeployed = match self.infra.undeploy_vm(group, node).await {
                Ok(task) => self.wait(&task).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = undeployed {
                warn!(node = %node, error = %e, "Failed to undeploy VM");
            }
        }

        let deleted = match self.infra.delete_vms(group, nodes).await {
            Ok(task) => self.wait(&task).await,
            Err(e) => Err(e.into()),
        };
        deleted.map_err(|e| OrchestratorError::DeleteNode(format!("{:?}: {}", nodes, e)))?;

        info!(group = %group.name, nodes = ?nodes, "Nodes deleted");
        Ok(())
    }

    /// Live node list of the group, `None` when it cannot be read.
    pub async fn node_details(&self, group: &VmGroupRef) -> Option<Vec<Node>> {
        let vms = match self.list_vms(group).await {
            Ok(vms) => vms,
            Err(e) => {
                warn!(group = %group.name, error = %e, "Failed to list VMs");
                return None;
            }
        };

        let mut nodes = Vec::with_capacity(vms.len());
        for vm in vms {
            if vm.state == VmState::Unresolved {
                continue;
            }
            let Some(role) = NodeRole::from_node_name(&vm.name) else {
                debug!(vm = %vm.name, "Skipping VM without a node role prefix");
                continue;
            };

            let mut node = Node::new(vm.name.clone(), role).with_sizing_class(vm.sizing_class.clone());
            if let Some(ip) = &vm.ip {
                node = node.with_ip(ip.clone());
            }

            if role == NodeRole::Nfs {
                let Some(ip) = vm.ip.as_deref() else {
                    warn!(vm = %vm.name, "NFS node has no IP yet, skipping its exports");
                    nodes.push(node);
                    continue;
                };
                let output = match self
                    .guest
                    .run(group, &vm.name, &scripts::nfs_exports_command(ip))
                    .await
                {
                    Ok(output) => output,
                    Err(e) => {
                        warn!(vm = %vm.name, error = %e, "Failed to read NFS exports");
                        return None;
                    }
                };
                node = node.with_nfs_exports(parse_nfs_exports(&output.stdout));
            }
            nodes.push(node);
        }
        Some(nodes)
    }

    pub async fn read_kubeconfig(&self, group: &VmGroupRef, control_plane: &str) -> Result<String> {
        let output = self
            .guest
            .run_when_ready(group, control_plane, &scripts::read_kubeconfig_command())
            .await?;
        Ok(output.stdout)
    }

    pub async fn write_kubeconfig(
        &self,
        group: &VmGroupRef,
        control_planes: &[String],
        kubeconfig: &str,
    ) -> Result<()> {
        self.run_on_nodes(group, control_planes, &scripts::write_kubeconfig_command(kubeconfig))
            .await
    }

    /// Poll a guest property until it is published.
    pub async fn wait_for_guest_property(
        &self,
        group: &VmGroupRef,
        vm: &str,
        key: &str,
    ) -> Result<String> {
        for attempt in 1..=self.guest_property.attempts {
            match self.infra.get_guest_property(group, vm, key).await {
                Ok(Some(value)) if !value.trim().is_empty() => return Ok(value),
                Ok(_) => debug!(vm, key, attempt, "Guest property not published yet"),
                Err(e) => debug!(vm, key, attempt, error = %e, "Failed to read guest property"),
            }
            tokio::time::sleep(self.guest_property.interval()).await;
        }
        Err(InfraError::Timeout(format!("guest property {} on {}", key, vm)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_request_from_pool() {
        let pool = NodePoolSpec {
            count: 3,
            sizing_class: Some("small".to_string()),
            storage_profile: Some("gold".to_string()),
        };
        let request = NodeRequest::from_pool(NodeRole::Worker, 2, "net", &pool);
        assert_eq!(request.count, 2);
        assert_eq!(request.sizing_class.as_deref(), Some("small"));
        assert_eq!(request.storage_profile.as_deref(), Some("gold"));
        assert_eq!(request.network, "net");
    }
}
