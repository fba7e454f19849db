//! In-memory infrastructure for lifecycle tests.
//!
//! [`FakeCloud`] plays VM provider, guest executor and edge gateway at once.
//! Guest scripts are answered by pattern and cloud-init data is "executed" on
//! power-on by publishing the guest properties a real image would set.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cluster_core::{ClusterEntity, EntityPatch, Template, TemplateRef, TemplateVersions};
use db::{DbError, EntityFilter, EntityStore, MemoryStore, Page, PageRequest};
use events::EventBus;
use orchestrator::{
    BackendFactory, GuestCredentials, GuestPropertyBudget, GuestScriptExecutor, InfraError,
    InfraProvider, InfraResult, InfraTaskRef, InfraTaskStatus, NetworkGateway, NetworkScope,
    OrchestratorConfig, ScriptBudget, ScriptOutput, ServiceDeps, TaskRegistry, TemplateRegistry,
    VmGroupRef, VmInfo, VmSpec, VmState,
};
use uuid::Uuid;

pub const SCRIPTED: &str = "native:1.0.0";
pub const CLOUD_INIT: &str = "native:2.0.0";

#[derive(Debug, Clone)]
pub struct FakeVm {
    pub ip: String,
    pub sizing_class: Option<String>,
    pub powered_on: bool,
    pub customization: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeGroup {
    pub name: String,
    pub vms: BTreeMap<String, FakeVm>,
    pub metadata: BTreeMap<String, String>,
    /// `<host>:<port>` written into the kubeconfig by `kubeadm init`
    pub endpoint: Option<String>,
}

#[derive(Default)]
struct CloudState {
    groups: HashMap<String, FakeGroup>,
    next_ip: u8,
    scripts: Vec<(String, String)>,
    properties: HashMap<(String, String), String>,
    dnat_rules: BTreeMap<String, (String, String)>,
    free_ips: Vec<String>,
    failing_scripts: Vec<String>,
    fail_cloud_init_join: bool,
    fail_add_vms: bool,
    /// VMs whose IP is not reported yet.
    pending_ips: Vec<String>,
}

#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub fn new() -> Self {
        let cloud = Self::default();
        cloud.state().free_ips = vec!["203.0.113.10".to_string(), "203.0.113.11".to_string()];
        cloud
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CloudState> {
        self.state.lock().unwrap()
    }

    /// Every guest script containing `pattern` exits with status 1.
    pub fn fail_scripts_containing(&self, pattern: &str) {
        self.state().failing_scripts.push(pattern.to_string());
    }

    /// Cloud-init workers report a failed join.
    pub fn fail_cloud_init_join(&self) {
        self.state().fail_cloud_init_join = true;
    }

    pub fn fail_add_vms(&self) {
        self.state().fail_add_vms = true;
    }

    /// `list_vms` reports no IP for `vm` until [`FakeCloud::reset_failures`].
    pub fn hide_ip(&self, vm: &str) {
        self.state().pending_ips.push(vm.to_string());
    }

    pub fn reset_failures(&self) {
        let mut state = self.state();
        state.failing_scripts.clear();
        state.fail_cloud_init_join = false;
        state.fail_add_vms = false;
        state.pending_ips.clear();
    }

    pub fn group_count(&self) -> usize {
        self.state().groups.len()
    }

    pub fn group(&self, external_id: &str) -> Option<FakeGroup> {
        self.state().groups.get(external_id).cloned()
    }

    pub fn vm_names(&self, external_id: &str) -> Vec<String> {
        self.group(external_id)
            .map(|g| g.vms.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn scripts(&self) -> Vec<(String, String)> {
        self.state().scripts.clone()
    }

    pub fn script_count(&self) -> usize {
        self.state().scripts.len()
    }

    pub fn scripts_containing(&self, pattern: &str) -> Vec<String> {
        self.state()
            .scripts
            .iter()
            .filter(|(_, script)| script.contains(pattern))
            .map(|(vm, _)| vm.clone())
            .collect()
    }

    pub fn dnat_rules(&self) -> BTreeMap<String, (String, String)> {
        self.state().dnat_rules.clone()
    }

    fn ip_of(state: &CloudState, vm: &str) -> Option<String> {
        state
            .groups
            .values()
            .find_map(|g| g.vms.get(vm).map(|v| v.ip.clone()))
    }

    fn kubeconfig(endpoint: &str) -> String {
        format!(
            "apiVersion: v1\nclusters:\n- cluster:\n    server: https://{}\n  name: kubernetes\n",
            endpoint
        )
    }

    fn join_command(cp_ip: &str) -> String {
        format!(
            "kubeadm join {}:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash sha256:feedbeef",
            cp_ip
        )
    }

    fn endpoint_option(script: &str) -> Option<String> {
        let start = script.find("--control-plane-endpoint=\"")? + "--control-plane-endpoint=\"".len();
        let rest = &script[start..];
        rest.find('"').map(|end| rest[..end].to_string())
    }

    fn task(operation: &str) -> InfraTaskRef {
        InfraTaskRef::new(Uuid::new_v4().to_string(), operation)
    }

    fn group_mut<'a>(state: &'a mut CloudState, group: &VmGroupRef) -> InfraResult<&'a mut FakeGroup> {
        state
            .groups
            .get_mut(&group.id)
            .ok_or_else(|| InfraError::NotFound(group.id.clone()))
    }

    /// Run cloud-init data attached to `vm`.
    fn boot(state: &mut CloudState, group: &VmGroupRef, vm: &str) {
        let Some(fake) = state.groups.get(&group.id).and_then(|g| g.vms.get(vm)).cloned() else {
            return;
        };
        let Some(data) = fake.customization else {
            return;
        };

        if data.contains("kubeadm init") {
            let endpoint = Self::endpoint_option(&data).unwrap_or_else(|| format!("{}:6443", fake.ip));
            if let Some(g) = state.groups.get_mut(&group.id) {
                g.endpoint = Some(endpoint.clone());
            }
            state.properties.insert(
                (vm.to_string(), "guestinfo.kubeadm.token.info".to_string()),
                Self::join_command(&fake.ip),
            );
            state.properties.insert(
                (vm.to_string(), "guestinfo.kubeconfig".to_string()),
                STANDARD.encode(Self::kubeconfig(&endpoint)),
            );
        } else if data.contains("kubeadm join") {
            let status = if state.fail_cloud_init_join { "failed" } else { "successful" };
            state.properties.insert(
                (
                    vm.to_string(),
                    "guestinfo.postcustomization.kubeadm.node.join.status".to_string(),
                ),
                status.to_string(),
            );
        }
    }
}

#[async_trait]
impl InfraProvider for FakeCloud {
    async fn create_vm_group(&self, name: &str, _network: &str) -> InfraResult<VmGroupRef> {
        let id = format!("urn:vapp:{}", Uuid::new_v4());
        self.state().groups.insert(
            id.clone(),
            FakeGroup {
                name: name.to_string(),
                ..FakeGroup::default()
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
        if state.fail_add_vms {
            return Err(InfraError::request("quota exceeded"));
        }
        let mut ips = Vec::new();
        for _ in specs {
            state.next_ip += 1;
            ips.push(format!("10.0.0.{}", state.next_ip + 1));
        }
        let target = Self::group_mut(&mut state, group)?;
        for (spec, ip) in specs.iter().zip(ips) {
            target.vms.insert(
                spec.name.clone(),
                FakeVm {
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
            let fake = target
                .vms
                .get_mut(vm)
                .ok_or_else(|| InfraError::NotFound(vm.to_string()))?;
            fake.powered_on = true;
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
        let pending = state.pending_ips.clone();
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
                ip: (!pending.contains(name)).then(|| vm.ip.clone()),
                sizing_class: vm.sizing_class.clone(),
            })
            .collect())
    }

    async fn undeploy_vm(&self, group: &VmGroupRef, vm: &str) -> InfraResult<InfraTaskRef> {
        let mut state = self.state();
        let target = Self::group_mut(&mut state, group)?;
        if let Some(fake) = target.vms.get_mut(vm) {
            fake.powered_on = false;
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
        let fake = target
            .vms
            .get_mut(vm)
            .ok_or_else(|| InfraError::NotFound(vm.to_string()))?;
        fake.customization = Some(data.to_string());
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
impl GuestScriptExecutor for FakeCloud {
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
        state.scripts.push((vm.to_string(), script.to_string()));

        if state.failing_scripts.iter().any(|p| script.contains(p.as_str())) {
            return Ok(ScriptOutput::failure(1, "injected failure\n"));
        }

        let ip = Self::ip_of(&state, vm).unwrap_or_default();
        let output = if script == "uname -a" {
            ScriptOutput::success("Linux node 5.4.0 x86_64 GNU/Linux\n")
        } else if script.contains("ip route get 1") {
            ScriptOutput::success(format!("{}\n", ip))
        } else if script.contains("--print-join-command") {
            ScriptOutput::success(format!("{}\n", Self::join_command(&ip)))
        } else if script.contains("kubeadm init") {
            let endpoint = Self::endpoint_option(script).unwrap_or_else(|| format!("{}:6443", ip));
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
impl NetworkGateway for FakeCloud {
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

/// Entity store over [`MemoryStore`] whose next `update` calls can be made to fail.
pub struct FlakyEntities {
    inner: Arc<MemoryStore>,
    failing_updates: AtomicUsize,
}

impl FlakyEntities {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            failing_updates: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_updates(&self, count: usize) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EntityStore for FlakyEntities {
    async fn get(&self, id: &str) -> Result<ClusterEntity, DbError> {
        self.inner.get(id).await
    }

    async fn create(&self, entity_type: &str, entity: ClusterEntity) -> Result<ClusterEntity, DbError> {
        self.inner.create(entity_type, entity).await
    }

    async fn update(&self, id: &str, patch: EntityPatch) -> Result<ClusterEntity, DbError> {
        if self.take_failure() {
            let broken = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
            return Err(DbError::Serialization(broken));
        }
        self.inner.update(id, patch).await
    }

    async fn delete(&self, id: &str) -> Result<(), DbError> {
        self.inner.delete(id).await
    }

    async fn resolve(&self, id: &str) -> Result<ClusterEntity, DbError> {
        self.inner.resolve(id).await
    }

    async fn list_by_type(
        &self,
        entity_type: &str,
        filter: &EntityFilter,
        page: PageRequest,
    ) -> Result<Page<ClusterEntity>, DbError> {
        self.inner.list_by_type(entity_type, filter, page).await
    }
}

pub struct FakeTemplates(pub Vec<Template>);

#[async_trait]
impl TemplateRegistry for FakeTemplates {
    async fn get_template(&self, name: &str, revision: u32) -> InfraResult<Option<Template>> {
        Ok(self
            .0
            .iter()
            .find(|t| t.name == name && t.revision == revision)
            .cloned())
    }

    async fn list_templates(&self) -> InfraResult<Vec<Template>> {
        Ok(self.0.clone())
    }
}

pub fn template(
    name: &str,
    revision: u32,
    kubernetes: &str,
    cni: &str,
    docker: &str,
    upgrade_from: &[&str],
) -> Template {
    Template {
        name: name.to_string(),
        revision,
        kind: "native".to_string(),
        versions: TemplateVersions {
            kubernetes: "upstream".to_string(),
            kubernetes_version: kubernetes.to_string(),
            cni: "weave".to_string(),
            cni_version: cni.to_string(),
            docker_version: docker.to_string(),
            os: "ubuntu-20.04".to_string(),
        },
        upgrade_from: upgrade_from.iter().map(|s| s.to_string()).collect(),
        source_vm: format!("{}-vm", name),
        catalog_item: format!("{}_rev{}", name, revision),
        deprecated: false,
    }
}

pub fn templates() -> Vec<Template> {
    vec![
        template("ubuntu-k8s", 1, "1.20.5", "2.6.5", "19.03.15", &[]),
        template("ubuntu-k8s", 2, "1.21.2", "2.8.1", "20.10.7", &["ubuntu-k8s"]),
        template("ubuntu-x", 9, "1.22.0", "2.8.1", "20.10.7", &["photon-k8s"]),
    ]
}

pub fn test_config(entity_type: &str) -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_entity_type(entity_type)
        .with_default_template(TemplateRef::new("ubuntu-k8s", 1))
        .with_script_budget(ScriptBudget {
            readiness_attempts: 3,
            readiness_interval_secs: 0,
            retry_attempts: 1,
        })
        .with_guest_property_budget(GuestPropertyBudget {
            attempts: 3,
            interval_secs: 0,
        })
}

pub fn deps(cloud: &Arc<FakeCloud>, store: &Arc<MemoryStore>, events: &EventBus) -> ServiceDeps {
    ServiceDeps::new(
        store.clone(),
        cloud.clone(),
        cloud.clone(),
        Arc::new(FakeTemplates(templates())),
        cloud.clone(),
    )
    .with_tasks(
        TaskRegistry::new()
            .with_store(store.clone())
            .with_event_bus(events.clone()),
    )
    .with_event_bus(events.clone())
}

pub struct Harness {
    pub cloud: Arc<FakeCloud>,
    pub store: Arc<MemoryStore>,
    pub events: EventBus,
    pub factory: BackendFactory,
}

impl Harness {
    pub fn new(entity_type: &str) -> Self {
        Self::with_config(test_config(entity_type))
    }

    pub fn with_config(config: OrchestratorConfig) -> Self {
        let cloud = Arc::new(FakeCloud::new());
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::new();

        let factory = BackendFactory::new(deps(&cloud, &store, &events), config).unwrap();
        Self {
            cloud,
            store,
            events,
            factory,
        }
    }

    /// Harness whose backends write entities through a [`FlakyEntities`] store.
    pub fn with_flaky_entities(entity_type: &str) -> (Self, Arc<FlakyEntities>) {
        let cloud = Arc::new(FakeCloud::new());
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::new();
        let flaky = Arc::new(FlakyEntities::new(store.clone()));

        let mut service_deps = deps(&cloud, &store, &events);
        service_deps.entities = flaky.clone();
        let factory = BackendFactory::new(service_deps, test_config(entity_type)).unwrap();
        (
            Self {
                cloud,
                store,
                events,
                factory,
            },
            flaky,
        )
    }

    pub async fn entity(&self, id: &str) -> ClusterEntity {
        self.store.get(id).await.unwrap()
    }
}
