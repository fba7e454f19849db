use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
    Nfs,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ControlPlane => "control_plane",
            Self::Worker => "worker",
            Self::Nfs => "nfs",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "control_plane" => Some(Self::ControlPlane),
            "worker" => Some(Self::Worker),
            "nfs" => Some(Self::Nfs),
            _ => None,
        }
    }

    /// VM name prefix identifying the role inside a VM-group.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::ControlPlane => "mstr",
            Self::Worker => "node",
            Self::Nfs => "nfsd",
        }
    }

    pub fn from_node_name(name: &str) -> Option<Self> {
        [Self::ControlPlane, Self::Worker, Self::Nfs]
            .into_iter()
            .find(|role| name.starts_with(role.prefix()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Node {
    pub name: String,
    pub role: NodeRole,
    pub ip: Option<String>,
    pub sizing_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nfs_exports: Option<Vec<String>>,
}

impl Node {
    pub fn new(name: impl Into<String>, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            role,
            ip: None,
            sizing_class: None,
            nfs_exports: None,
        }
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_sizing_class(mut self, sizing_class: Option<String>) -> Self {
        self.sizing_class = sizing_class;
        self
    }

    pub fn with_nfs_exports(mut self, exports: Vec<String>) -> Self {
        self.nfs_exports = Some(exports);
        self
    }
}
