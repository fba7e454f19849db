use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::node::{Node, NodeRole};
use super::phase::Phase;
use super::template::TemplateRef;

/// Persistence state of an entity record in the store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    #[default]
    PreCreated,
    Resolved,
    ResolutionError,
}

impl EntityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PreCreated => "pre_created",
            Self::Resolved => "resolved",
            Self::ResolutionError => "resolution_error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pre_created" => Some(Self::PreCreated),
            "resolved" => Some(Self::Resolved),
            "resolution_error" => Some(Self::ResolutionError),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct NodePoolSpec {
    pub count: u32,
    #[serde(default)]
    pub sizing_class: Option<String>,
    #[serde(default)]
    pub storage_profile: Option<String>,
}

impl NodePoolSpec {
    pub fn with_count(count: u32) -> Self {
        Self {
            count,
            ..Default::default()
        }
    }
}

/// Desired topology of a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ClusterSpec {
    pub control_plane: NodePoolSpec,
    pub workers: NodePoolSpec,
    #[serde(default)]
    pub nfs: NodePoolSpec,
    pub network: String,
    pub template: TemplateRef,
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub rollback_on_failure: bool,
    #[serde(default)]
    pub expose: bool,
}

impl ClusterSpec {
    pub fn pool(&self, role: NodeRole) -> &NodePoolSpec {
        match role {
            NodeRole::ControlPlane => &self.control_plane,
            NodeRole::Worker => &self.workers,
            NodeRole::Nfs => &self.nfs,
        }
    }
}

/// Installed software, as reported in status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct SoftwareStatus {
    /// `"<distribution> <version>"`
    pub kubernetes: Option<String>,
    /// `"<cni> <version>"`
    pub cni: Option<String>,
    pub docker_version: Option<String>,
    pub os: Option<String>,
    pub distribution: Option<TemplateRef>,
}

/// Observed state of a cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ClusterStatus {
    #[schema(value_type = String, example = "CREATE:SUCCEEDED")]
    pub phase: Phase,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub exposed: bool,
    #[serde(default)]
    pub external_ip: Option<String>,
    #[serde(default)]
    pub software: SoftwareStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub task_href: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ClusterEntity {
    pub id: String,
    pub name: String,
    pub org_name: String,
    pub vdc_name: String,
    pub entity_type: String,
    pub state: EntityState,
    /// Opaque reference to the backing VM-group
    pub external_id: Option<String>,
    pub spec: ClusterSpec,
    pub status: ClusterStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClusterEntity {
    pub fn new(
        name: impl Into<String>,
        org_name: impl Into<String>,
        vdc_name: impl Into<String>,
        entity_type: impl Into<String>,
        spec: ClusterSpec,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("urn:cluster:{}", uuid::Uuid::new_v4()),
            name: name.into(),
            org_name: org_name.into(),
            vdc_name: vdc_name.into(),
            entity_type: entity_type.into(),
            state: EntityState::default(),
            external_id: None,
            spec,
            status: ClusterStatus::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn nodes_with_role(&self, role: NodeRole) -> impl Iterator<Item = &Node> {
        self.status.nodes.iter().filter(move |n| n.role == role)
    }

    pub fn node_names(&self, role: NodeRole) -> Vec<String> {
        self.nodes_with_role(role).map(|n| n.name.clone()).collect()
    }

    pub fn control_plane(&self) -> Option<&Node> {
        self.nodes_with_role(NodeRole::ControlPlane).next()
    }

    pub fn is_busy(&self) -> bool {
        self.status.phase.is_busy()
    }
}

/// Field changes applied to a stored entity.
///
/// Every `None` field is left untouched. `external_ip` and `kubeconfig`
/// are doubly optional so they can be cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityPatch {
    pub phase: Option<Phase>,
    pub nodes: Option<Vec<Node>>,
    pub exposed: Option<bool>,
    pub external_ip: Option<Option<String>>,
    pub external_id: Option<String>,
    pub kubeconfig: Option<Option<String>>,
    pub spec: Option<ClusterSpec>,
    pub software: Option<SoftwareStatus>,
    pub task_href: Option<String>,
}

impl EntityPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = Some(phase);
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = Some(nodes);
        self
    }

    pub fn with_exposed(mut self, exposed: bool, external_ip: Option<String>) -> Self {
        self.exposed = Some(exposed);
        self.external_ip = Some(external_ip);
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_kubeconfig(mut self, kubeconfig: Option<String>) -> Self {
        self.kubeconfig = Some(kubeconfig);
        self
    }

    pub fn with_spec(mut self, spec: ClusterSpec) -> Self {
        self.spec = Some(spec);
        self
    }

    pub fn with_software(mut self, software: SoftwareStatus) -> Self {
        self.software = Some(software);
        self
    }

    pub fn with_task_href(mut self, href: impl Into<String>) -> Self {
        self.task_href = Some(href.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn apply(self, entity: &mut ClusterEntity) {
        if let Some(phase) = self.phase {
            entity.status.phase = phase;
        }
        if let Some(nodes) = self.nodes {
            entity.status.nodes = nodes;
        }
        if let Some(exposed) = self.exposed {
            entity.status.exposed = exposed;
        }
        if let Some(external_ip) = self.external_ip {
            entity.status.external_ip = external_ip;
        }
        if let Some(external_id) = self.external_id {
            entity.external_id = Some(external_id);
        }
        if let Some(kubeconfig) = self.kubeconfig {
            entity.status.kubeconfig = kubeconfig;
        }
        if let Some(spec) = self.spec {
            entity.spec = spec;
        }
        if let Some(software) = self.software {
            entity.status.software = software;
        }
        if let Some(href) = self.task_href {
            entity.status.task_href = Some(href);
        }
        entity.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::phase::Operation;

    fn spec() -> ClusterSpec {
        ClusterSpec {
            control_plane: NodePoolSpec::with_count(1),
            workers: NodePoolSpec::with_count(2),
            nfs: NodePoolSpec::default(),
            network: "ovdc-net".to_string(),
            template: TemplateRef::new("ubuntu-k8s", 1),
            ssh_key: None,
            rollback_on_failure: true,
            expose: false,
        }
    }

    #[test]
    fn test_entity_creation() {
        let entity = ClusterEntity::new("foo", "org1", "vdc1", "native:2.0.0", spec());

        assert!(entity.id.starts_with("urn:cluster:"));
        assert_eq!(entity.state, EntityState::PreCreated);
        assert!(entity.external_id.is_none());
        assert!(!entity.is_busy());
        assert!(entity.control_plane().is_none());
    }

    #[test]
    fn test_nodes_with_role() {
        let mut entity = ClusterEntity::new("foo", "org1", "vdc1", "native:2.0.0", spec());
        entity.status.nodes = vec![
            Node::new("mstr-aaaa", NodeRole::ControlPlane),
            Node::new("node-bbbb", NodeRole::Worker),
            Node::new("node-cccc", NodeRole::Worker),
        ];

        assert_eq!(entity.control_plane().map(|n| n.name.as_str()), Some("mstr-aaaa"));
        assert_eq!(entity.node_names(NodeRole::Worker), vec!["node-bbbb", "node-cccc"]);
        assert!(entity.node_names(NodeRole::Nfs).is_empty());
        assert_eq!(entity.spec.pool(NodeRole::Worker).count, 2);
    }

    #[test]
    fn test_patch_apply() {
        let mut entity = ClusterEntity::new("foo", "org1", "vdc1", "native:2.0.0", spec());
        entity.status.external_ip = Some("203.0.113.5".to_string());
        entity.status.exposed = true;

        EntityPatch::new()
            .with_phase(Phase::in_progress(Operation::Update))
            .with_exposed(false, None)
            .with_external_id("vapp-123")
            .apply(&mut entity);

        assert!(entity.is_busy());
        assert!(!entity.status.exposed);
        assert!(entity.status.external_ip.is_none());
        assert_eq!(entity.external_id.as_deref(), Some("vapp-123"));
    }

    #[test]
    fn test_empty_patch_leaves_fields() {
        let mut entity = ClusterEntity::new("foo", "org1", "vdc1", "native:2.0.0", spec());
        entity.status.kubeconfig = Some("apiVersion: v1".to_string());
        let patch = EntityPatch::new();
        assert!(patch.is_empty());

        patch.apply(&mut entity);
        assert_eq!(entity.status.kubeconfig.as_deref(), Some("apiVersion: v1"));
    }

    #[test]
    fn test_entity_serde_keeps_phase_string() {
        let mut entity = ClusterEntity::new("foo", "org1", "vdc1", "native:2.0.0", spec());
        entity.status.phase = Phase::succeeded(Operation::Create);

        let value = serde_json::to_value(&entity).unwrap();
        assert_eq!(value["status"]["phase"], "CREATE:SUCCEEDED");

        let decoded: ClusterEntity = serde_json::from_value(value).unwrap();
        assert_eq!(decoded.status.phase, entity.status.phase);
    }
}
