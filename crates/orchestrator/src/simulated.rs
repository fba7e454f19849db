//! In-process infrastructure for local runs and API tests.
//!
//! [`SimulatedCloud`] answers the provider, guest executor and gateway traits
//! from memory. Guest scripts are answered by pattern and cloud-init data is
//! acted on at power-on by publishing the guest properties a real image
//! would set, so both bootstrap generations run to completion.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cluster_core::{Template, TemplateVersions};
use tracing::debug;
use uuid::Uuid;

use crate::infra::{
    GuestCredentials, GuestScriptExecutor, InfraError, InfraProvider, InfraResult, InfraTaskRef,
    InfraTaskStatus, NetworkGateway, NetworkScope, ScriptOutput, TemplateRegistry, VmGroupRef,
    VmInfo, VmSpec, VmState,
};

const TOKEN_INFO_PROPERTY: &str = "guestinfo.kubeadm.token.info";
const KUBECONFIG_PROPERTY: &str = "guestinfo.kubeconfig";
const JOIN_STATUS_PROPERTY: &str = "guestinfo.postcustomization.kubeadm.node.join.status";

#[derive(Debug, Clone)]
struct SimVm {
    ip: String,
    sizing_class: Option<String>,
    powered_on: bool,
    customization: Option<String>,
}

#[derive(Debug, Clone, Default)]
struct SimGroup {
    name: String,
    vms: BTreeMap<String, SimVm>,
    metadata: BTreeMap<String, String>,
    endpoint: Option<String>,
}

#[derive(Default)]
struct CloudState {
    groups: HashMap<String, SimGroup>,
    allocated_ips: u32,
    properties: HashMap<(String, String), String>,
    dnat_rules: BTreeMap<String, (String, String)>,
    free_ips: Vec<String>,
    script_count: usize,
}

#[derive(Default)]
pub struct SimulatedCloud {
    state: Mutex<CloudState>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// External addresses handed out by the gateway, in order.
    pub fn with_external_ips<I, S>(self, ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().free_ips = ips.into_iter().map(Into::into).collect();
        self
    }

    fn state(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn group_count(&self) -> usize {
        self.state().groups.len()
    }

    pub fn vm_names(&self, external_id: &str) -> Vec<String> {
        self.state()
            .groups
            .get(external_id)
            .map(|g| g.vms.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn metadata(&self, external_id: &str) -> BTreeMap<String, String> {
        self.state()
            .groups
            .get(external_id)
            .map(|g| g.metadata.clone())
            .unwrap_or_default()
    }

    pub fn dnat_rule_names(&self) -> Vec<String> {
        self.state().dnat_rules.keys().cloned().collect()
    }

    pub fn script_count(&self) -> usize {
        self.state().script_count
    }

    fn next_ip(state: &mut CloudState) -> String {
        state.allocated_ips += 1;
        let n = state.allocated_ips + 1;
        format!("10.0.{}.{}", n / 250, n % 250)
    }

    fn ip_of(state: &CloudState, vm: &str) -> String {
        state
            .groups
            .values()
            .find_map(|g| g.vms.get(vm).map(|v| v.ip.clone()))
            .unwrap_or_default()
    }

    fn kubeconfig(endpoint: &str) -> String {
        format!(
            "apiVersion: v1\nclusters:\n- cluster:\n    server: https://{}\n  name: kubernetes\n",
            endpoint
        )
    }

    fn join_command(control_plane_ip: &str) -> String {
        format!(
            "kubeadm join {}:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash sha256:{}",
            control_plane_ip,
            Uuid::new_v4().simple()
        )
    }

    fn endpoint_option(script: &str) -> Option<String> {
        const OPTION: &str = "--control-plane-endpoint=\"";
        let start = script.find(OPTION)? + OPTION.len();
        let rest = &script[start..];
        rest.find('"').map(|end| rest[..end].to_string())
    }

    fn task(operation: &str) -> InfraTaskRef {
        InfraTaskRef::new(Uuid::new_v4().to_string(), operation)
    }

    fn group_mut<'a>(
        state: &'a mut CloudState,
        group: &VmGroupRef,
    ) -> InfraResult<&'a mut SimGroup> {
        state
            .groups
            .get_mut(&group.id)
            .ok_or_else(|| InfraError::NotFound(group.id.clone()))
    }

    fn boot(state: &mut CloudState, group: &VmGroupRef, vm: &str) {
        let Some(sim) = state
            .groups
            .get(&group.id)
            .and_then(|g| g.vms.get(vm))
            .cloned()
        else {
            return;
        };
        let Some(data) = sim.customization else {
            return;
        };

        if data.contains("kubeadm init") {
            let endpoint =
                Self::endpoint_option(&data).unwrap_or_else(|| format!("{}:6443", sim.ip));
            if let Some(g) = state.groups.get_mut(&group.id) {
                g.endpoint = Some(endpoint.clone());
            }
            state.properties.insert(
                (vm.to_string(), TOKEN_INFO_PROPERTY.to_string()),
                Self::join_command(&sim.ip),
            );
            state.properties.insert(
                (vm.to_string(), KUBECONFIG_PROPERTY.to_string()),
                STANDARD.encode(Self::kubeconfig(&endpoint)),
            );
        } else if data.contains("kubeadm join") {
            state.properties.insert(
                (vm.to_string(), JOIN_STATUS_PROPERTY.to_string()),
                "successful".to_string(),
            );
        }
    }
}

#[async_trait]
impl InfraProvider for SimulatedCloud {
    async fn create_vm_group(&self, name: &str, network: &str) -> InfraResult<VmGroupRef> {
        let id = format!("urn:vapp:{}", Uuid::new_v4());
        debug!(group = %name, network, "Simulating vm group creation");
        self.state().groups.insert(
            id.clone(),
            SimGroup {
                name: name.to_string(),
                ..SimGroup::default()
            },
        );
        Ok(VmGroupRef::new(id, name))
    }

    async fn find_vm_group(&self, external_id: &str) -> InfraResult<VmGroupRef> {
        let state = self.state();
        let group = state
            .groups
            .get(external_id)
            .ok_or_else(|| InfraError::NotFound(external_id.to_string()))?;
        Ok(VmGroupRef::new(external_id, group.name.clone()))
    }

    async fn add_vms(
        &self,
        group: &VmGroupRef,
        specs: &[VmSpec],
        power_on: bool,
    ) -> InfraResult<InfraTaskRef> {
        let mut state = self.state();
        let ips: Vec<String> = specs.iter().map(|_| Self::next_ip(&mut state)).collect();
        let target = Self::group_mut(&mut state, group)?;
        for (spec, ip) in specs.iter().zip(ips) {
            target.vms.insert(
                spec.name.clone(),
                SimVm {
                    ip,
                    sizing_class: spec.sizing_class.clone(),
                    powered_on: power_on,
                    customization: None,
                },
            );
        }
        Ok(Self::task("addVms"))
    }

    async fn power_on(&self, group: &VmGroupRef, vm: &str) -> InfraResult<InfraTaskRef> {
        let mut state = self.state();
        {
            let target = Self::group_mut(&mut state, group)?;
            let sim = target
                .vms
                .get_mut(vm)
                .ok_or_else(|| InfraError::NotFound(vm.to_string()))?;
            sim.powered_on = true;
        }
        Self::boot(&mut state, group, vm);
        Ok(Self::task("powerOn"))
    }

    async fn set_metadata(
        &self,
        group: &VmGroupRef,
        metadata: &BTreeMap<String, String>,
    ) -> InfraResult<InfraTaskRef> {
        let mut state = self.state();
        let target = Self::group_mut(&mut state, group)?;
        target.metadata.extend(metadata.clone());
        Ok(Self::task("metadataUpdate"))
    }

    async fn delete_vm_group(&self, group: &VmGroupRef) -> InfraResult<InfraTaskRef> {
        self.state()
            .groups
            .remove(&group.id)
            .ok_or_else(|| InfraError::NotFound(group.id.clone()))?;
        Ok(Self::task("vdcDeleteVapp"))
    }

    async fn wait_for_task_status(&self, _task: &InfraTaskRef) -> InfraResult<InfraTaskStatus> {
        Ok(InfraTaskStatus::Success)
    }

    async fn list_vms(&self, group: &VmGroupRef) -> InfraResult<Vec<VmInfo>> {
        let mut state = self.state();
        let target = Self::group_mut(&mut state, group)?;
        Ok(target
            .vms
            .iter()
            .map(|(name, vm)| VmInfo {
                name: name.clone(),
                state: if vm.powered_on {
                    VmState::PoweredOn
                } else {
                    VmState::PoweredOff
                },
                ip: Some(vm.ip.clone()),
                sizing_class: vm.sizing_class.clone(),
            })
            .collect())
    }

    async fn undeploy_vm(&self, group: &VmGroupRef, vm: &str) -> InfraResult<InfraTaskRef> {
        let mut state = self.state();
        let target = Self::group_mut(&mut state, group)?;
        if let Some(sim) = target.vms.get_mut(vm) {
            sim.powered_on = false;
        }
        Ok(Self::task("vappUndeployPowerOff"))
    }

    async fn delete_vms(&self, group: &VmGroupRef, names: &[String]) -> InfraResult<InfraTaskRef> {
        let mut state = self.state();
        let target = Self::group_mut(&mut state, group)?;
        for name in names {
            target.vms.remove(name);
        }
        Ok(Self::task("vappRecomposeVms"))
    }

    async fn set_guest_customization(
        &self,
        group: &VmGroupRef,
        vm: &str,
        data: &str,
    ) -> InfraResult<InfraTaskRef> {
        let mut state = self.state();
        let target = Self::group_mut(&mut state, group)?;
        let sim = target
            .vms
            .get_mut(vm)
            .ok_or_else(|| InfraError::NotFound(vm.to_string()))?;
        sim.customization = Some(data.to_string());
        Ok(Self::task("vmUpdateGuestCustomization"))
    }

    async fn get_guest_property(
        &self,
        _group: &VmGroupRef,
        vm: &str,
        key: &str,
    ) -> InfraResult<Option<String>> {
        Ok(self
            .state()
            .properties
            .get(&(vm.to_string(), key.to_string()))
            .cloned())
    }
}

#[async_trait]
impl GuestScriptExecutor for SimulatedCloud {
    async fn wait_until_tools_ready(&self, _group: &VmGroupRef, _vm: &str) -> InfraResult<()> {
        Ok(())
    }

    async fn execute_script(
        &self,
        group: &VmGroupRef,
        vm: &str,
        _credentials: &GuestCredentials,
        script: &str,
    ) -> InfraResult<ScriptOutput> {
        let mut state = self.state();
        state.script_count += 1;

        let ip = Self::ip_of(&state, vm);
        let output = if script.contains("ip route get 1") {
            ScriptOutput::success(format!("{}\n", ip))
        } else if script.contains("--print-join-command") {
            ScriptOutput::success(format!("{}\n", Self::join_command(&ip)))
        } else if script.contains("kubeadm init") {
            let endpoint =
                Self::endpoint_option(script).unwrap_or_else(|| format!("{}:6443", ip));
            if let Some(g) = state.groups.get_mut(&group.id) {
                g.endpoint = Some(endpoint);
            }
            ScriptOutput::success("")
        } else if script.contains("cat /root/.kube/config") {
            let endpoint = state
                .groups
                .get(&group.id)
                .and_then(|g| g.endpoint.clone())
                .unwrap_or_else(|| format!("{}:6443", ip));
            ScriptOutput::success(Self::kubeconfig(&endpoint))
        } else if script.contains("showmount -e") {
            ScriptOutput::success(format!("Export list for {}:\n/export/vol1 *\n", ip))
        } else {
            ScriptOutput::success("")
        };
        Ok(output)
    }
}

#[async_trait]
impl NetworkGateway for SimulatedCloud {
    async fn get_available_ip(&self, _scope: &NetworkScope) -> InfraResult<Option<String>> {
        let mut state = self.state();
        if state.free_ips.is_empty() {
            return Ok(None);
        }
        Ok(Some(state.free_ips.remove(0)))
    }

    async fn add_dnat_rule(
        &self,
        _scope: &NetworkScope,
        name: &str,
        internal_ip: &str,
        external_ip: &str,
    ) -> InfraResult<()> {
        self.state().dnat_rules.insert(
            name.to_string(),
            (internal_ip.to_string(), external_ip.to_string()),
        );
        Ok(())
    }

    async fn delete_dnat_rule(&self, _scope: &NetworkScope, name: &str) -> InfraResult<()> {
        let mut state = self.state();
        let (_, external) = state
            .dnat_rules
            .remove(name)
            .ok_or_else(|| InfraError::NotFound(name.to_string()))?;
        state.free_ips.push(external);
        Ok(())
    }
}

/// Fixed template catalog.
#[derive(Debug, Clone, Default)]
pub struct StaticTemplates {
    templates: Vec<Template>,
}

impl StaticTemplates {
    pub fn new(templates: Vec<Template>) -> Self {
        Self { templates }
    }

    /// Two ubuntu revisions, the second upgradable from the first.
    pub fn sample() -> Self {
        let template = |revision: u32, kubernetes: &str, cni: &str, docker: &str, from: &[&str]| {
            Template {
                name: "ubuntu-16.04_k8-1.21_weave-2.8.1".to_string(),
                revision,
                kind: "native".to_string(),
                versions: TemplateVersions {
                    kubernetes: "upstream".to_string(),
                    kubernetes_version: kubernetes.to_string(),
                    cni: "weave".to_string(),
                    cni_version: cni.to_string(),
                    docker_version: docker.to_string(),
                    os: "ubuntu-16.04".to_string(),
                },
                upgrade_from: from.iter().map(|s| s.to_string()).collect(),
                source_vm: "ubuntu-k8s-vm".to_string(),
                catalog_item: format!("ubuntu-k8s_rev{}", revision),
                deprecated: false,
            }
        };
        Self::new(vec![
            template(1, "1.20.5", "2.6.5", "19.03.15", &[]),
            template(
                2,
                "1.21.2",
                "2.8.1",
                "20.10.7",
                &["ubuntu-16.04_k8-1.21_weave-2.8.1"],
            ),
        ])
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }
}

#[async_trait]
impl TemplateRegistry for StaticTemplates {
    async fn get_template(&self, name: &str, revision: u32) -> InfraResult<Option<Template>> {
        Ok(self
            .templates
            .iter()
            .find(|t| t.name == name && t.revision == revision)
            .cloned())
    }

    async fn list_templates(&self) -> InfraResult<Vec<Template>> {
        Ok(self.templates.clone())
    }
}
