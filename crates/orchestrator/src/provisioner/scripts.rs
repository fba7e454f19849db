//! Guest scripts run on cluster nodes.
//!
//! Each [`ScriptKind`] has a minimal built-in body. A template registry can
//! ship its own body per template; placeholders of the form `{name}` are
//! substituted in either case.

use std::fmt;
use std::sync::{Arc, OnceLock};

use cluster_core::Template;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::infra::TemplateRegistry;
use crate::network::KUBE_API_PORT;

pub const READINESS_PROBE: &str = "uname -a";
pub const JOIN_COMMAND_SCRIPT: &str =
    "#!/usr/bin/env bash\nkubeadm token create --print-join-command\n";
pub const CONTROL_PLANE_IP_SCRIPT: &str =
    "#!/usr/bin/env bash\nip route get 1 | awk '{print $NF;exit}'\n";
pub const KUBECONFIG_PATH: &str = "/root/.kube/config";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptKind {
    ControlPlaneInit,
    NodeJoin,
    NfsEnable,
    SshKey,
    DockerUpgrade,
    ControlPlaneKubernetesUpgrade,
    WorkerKubernetesUpgrade,
    CniApply,
    CloudInitControlPlane,
    CloudInitWorker,
}

impl ScriptKind {
    pub fn file_name(&self) -> &'static str {
        match self {
            Self::ControlPlaneInit => "mstr.sh",
            Self::NodeJoin => "node.sh",
            Self::NfsEnable => "nfsd.sh",
            Self::SshKey => "ssh-key.sh",
            Self::DockerUpgrade => "docker-upgrade.sh",
            Self::ControlPlaneKubernetesUpgrade => "control-plane-k8s-upgrade.sh",
            Self::WorkerKubernetesUpgrade => "worker-k8s-upgrade.sh",
            Self::CniApply => "cni-apply.sh",
            Self::CloudInitControlPlane => "cloud-init-control-plane.yaml",
            Self::CloudInitWorker => "cloud-init-node.yaml",
        }
    }

    pub fn default_body(&self) -> &'static str {
        match self {
            Self::ControlPlaneInit => CONTROL_PLANE_INIT,
            Self::NodeJoin => NODE_JOIN,
            Self::NfsEnable => NFS_ENABLE,
            Self::SshKey => SSH_KEY,
            Self::DockerUpgrade => DOCKER_UPGRADE,
            Self::ControlPlaneKubernetesUpgrade => CONTROL_PLANE_K8S_UPGRADE,
            Self::WorkerKubernetesUpgrade => WORKER_K8S_UPGRADE,
            Self::CniApply => CNI_APPLY,
            Self::CloudInitControlPlane => CLOUD_INIT_CONTROL_PLANE,
            Self::CloudInitWorker => CLOUD_INIT_WORKER,
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

const CONTROL_PLANE_INIT: &str = r#"#!/usr/bin/env bash
set -e
kubeadm init --kubernetes-version=v{kubernetes_version} --pod-network-cidr=10.96.0.0/12 > /root/kubeadm-init.out
mkdir -p /root/.kube
cp -f /etc/kubernetes/admin.conf /root/.kube/config
chown root:root /root/.kube/config
kubectl apply -f /root/{cni}-{cni_version}.yml
"#;

const NODE_JOIN: &str = r#"#!/usr/bin/env bash
set -e
kubeadm join {ip_port} --token {token} --discovery-token-ca-cert-hash {discovery_token_ca_cert_hash}
"#;

const NFS_ENABLE: &str = r#"#!/usr/bin/env bash
set -e
mkdir -p /export/vol1
echo "/export/vol1 *(rw,sync,no_root_squash,no_subtree_check)" >> /etc/exports
systemctl enable --now nfs-server
exportfs -ra
"#;

const SSH_KEY: &str = r#"#!/usr/bin/env bash
mkdir -p /root/.ssh
echo '{ssh_key}' >> /root/.ssh/authorized_keys
chmod -R go-rwx /root/.ssh
"#;

const DOCKER_UPGRADE: &str = r#"#!/usr/bin/env bash
set -e
apt-get -q update
apt-get -q install -y --allow-downgrades docker-ce={docker_version}
systemctl restart docker
"#;

const CONTROL_PLANE_K8S_UPGRADE: &str = r#"#!/usr/bin/env bash
set -e
kubeadm upgrade apply v{kubernetes_version} -y
systemctl restart kubelet
"#;

const WORKER_K8S_UPGRADE: &str = r#"#!/usr/bin/env bash
set -e
kubeadm upgrade node
systemctl restart kubelet
"#;

const CNI_APPLY: &str = r#"#!/usr/bin/env bash
set -e
kubectl apply -f /root/{cni}-{cni_version}.yml
"#;

const CLOUD_INIT_CONTROL_PLANE: &str = r#"#cloud-config
hostname: {vm_host_name}
ssh_authorized_keys:
  - "{ssh_key}"
runcmd:
  - kubeadm init --kubernetes-version=v{kubernetes_version} --control-plane-endpoint="{control_plane_endpoint}" --pod-network-cidr=10.96.0.0/12
  - mkdir -p /root/.kube && cp -f /etc/kubernetes/admin.conf /root/.kube/config
  - kubectl apply -f /root/{cni}-{cni_version}.yml
  - vmtoolsd --cmd "info-set guestinfo.kubeconfig $(base64 -w0 /root/.kube/config)"
  - vmtoolsd --cmd "info-set guestinfo.kubeadm.token.info $(kubeadm token create --print-join-command --ttl 0)"
"#;

const CLOUD_INIT_WORKER: &str = r#"#cloud-config
hostname: {vm_host_name}
ssh_authorized_keys:
  - "{ssh_key}"
runcmd:
  - kubeadm join {ip_port} --token {token} --discovery-token-ca-cert-hash {discovery_token_ca_cert_hash}
  - vmtoolsd --cmd "info-set guestinfo.postcustomization.kubeadm.node.join.status successful"
"#;

/// Substitute `{key}` placeholders; unknown placeholders are left alone.
pub fn render(body: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(body.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

static ENDPOINT_OPTION: OnceLock<Option<Regex>> = OnceLock::new();

/// Point `kubeadm init` at `expose_ip`, replacing an existing endpoint option.
pub fn with_control_plane_endpoint(script: &str, expose_ip: &str) -> String {
    let option = format!("--control-plane-endpoint=\"{}:{}\"", expose_ip, KUBE_API_PORT);
    let endpoint_re = ENDPOINT_OPTION
        .get_or_init(|| Regex::new(r#"--control-plane-endpoint=\S+"#).ok())
        .as_ref();

    let mut rewritten = script
        .lines()
        .map(|line| {
            if !line.trim_start().starts_with("kubeadm init ") {
                return line.to_string();
            }
            match endpoint_re {
                Some(re) if re.is_match(line) => re.replace(line, option.as_str()).into_owned(),
                _ => line.replacen("kubeadm init", &format!("kubeadm init {}", option), 1),
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    if script.ends_with('\n') {
        rewritten.push('\n');
    }
    rewritten
}

/// Parsed `kubeadm join <ip:port> --token <t> --discovery-token-ca-cert-hash <h>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCommand {
    pub ip_port: String,
    pub token: String,
    pub discovery_token_ca_cert_hash: String,
}

impl JoinCommand {
    pub fn parse(raw: &str) -> Option<Self> {
        let parts: Vec<&str> = raw.split_whitespace().collect();
        if parts.len() != 7 {
            return None;
        }
        Some(Self {
            ip_port: parts[2].to_string(),
            token: parts[4].to_string(),
            discovery_token_ca_cert_hash: parts[6].to_string(),
        })
    }

    fn vars(&self) -> [(&str, &str); 3] {
        [
            ("ip_port", self.ip_port.as_str()),
            ("token", self.token.as_str()),
            (
                "discovery_token_ca_cert_hash",
                self.discovery_token_ca_cert_hash.as_str(),
            ),
        ]
    }
}

pub fn drain_command(node: &str) -> String {
    format!(
        "#!/usr/bin/env bash\nkubectl drain {} --ignore-daemonsets --timeout=60s --delete-local-data\n",
        node
    )
}

pub fn uncordon_command(node: &str) -> String {
    format!("#!/usr/bin/env bash\nkubectl uncordon {}\n", node)
}

pub fn delete_node_command(node: &str) -> String {
    format!("#!/usr/bin/env bash\nkubectl delete node {}\n", node)
}

pub fn nfs_exports_command(ip: &str) -> String {
    format!("#!/usr/bin/env bash\nshowmount -e {}\n", ip)
}

pub fn read_kubeconfig_command() -> String {
    format!("#!/usr/bin/env bash\ncat {}\n", KUBECONFIG_PATH)
}

pub fn write_kubeconfig_command(kubeconfig: &str) -> String {
    format!(
        "#!/usr/bin/env bash\necho '{}' > {}\n",
        kubeconfig, KUBECONFIG_PATH
    )
}

/// Exported paths from `showmount -e` output: first token of every line after the header.
pub fn parse_nfs_exports(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Script bodies for a template, with registry overrides taking precedence.
#[derive(Clone)]
pub struct ScriptCatalog {
    registry: Arc<dyn TemplateRegistry>,
}

impl ScriptCatalog {
    pub fn new(registry: Arc<dyn TemplateRegistry>) -> Self {
        Self { registry }
    }

    pub async fn body(&self, template: &Template, kind: ScriptKind) -> Result<String> {
        Ok(self
            .registry
            .script(template, kind)
            .await?
            .unwrap_or_else(|| kind.default_body().to_string()))
    }

    /// Body rendered with the template's software versions.
    pub async fn versioned(&self, template: &Template, kind: ScriptKind) -> Result<String> {
        let body = self.body(template, kind).await?;
        Ok(render(&body, &version_vars(template)))
    }

    pub async fn control_plane_init(
        &self,
        template: &Template,
        expose_ip: Option<&str>,
    ) -> Result<String> {
        let script = self.versioned(template, ScriptKind::ControlPlaneInit).await?;
        Ok(match expose_ip {
            Some(ip) => with_control_plane_endpoint(&script, ip),
            None => script,
        })
    }

    pub async fn node_join(&self, template: &Template, join: &JoinCommand) -> Result<String> {
        let body = self.body(template, ScriptKind::NodeJoin).await?;
        Ok(render(&body, &join.vars()))
    }

    pub async fn ssh_key(&self, template: &Template, ssh_key: &str) -> Result<String> {
        let body = self.body(template, ScriptKind::SshKey).await?;
        Ok(render(&body, &[("ssh_key", ssh_key)]))
    }

    pub async fn cloud_init_control_plane(
        &self,
        template: &Template,
        host_name: &str,
        control_plane_endpoint: &str,
        ssh_key: Option<&str>,
    ) -> Result<String> {
        let body = self.versioned(template, ScriptKind::CloudInitControlPlane).await?;
        Ok(render(
            &body,
            &[
                ("vm_host_name", host_name),
                ("control_plane_endpoint", control_plane_endpoint),
                ("ssh_key", ssh_key.unwrap_or_default()),
            ],
        ))
    }

    pub async fn cloud_init_worker(
        &self,
        template: &Template,
        host_name: &str,
        join: &JoinCommand,
        ssh_key: Option<&str>,
    ) -> Result<String> {
        let body = self.body(template, ScriptKind::CloudInitWorker).await?;
        let mut vars = vec![
            ("vm_host_name", host_name),
            ("ssh_key", ssh_key.unwrap_or_default()),
        ];
        vars.extend(join.vars());
        Ok(render(&body, &vars))
    }
}

fn version_vars(template: &Template) -> [(&str, &str); 4] {
    [
        ("kubernetes_version", template.versions.kubernetes_version.as_str()),
        ("cni", template.versions.cni.as_str()),
        ("cni_version", template.versions.cni_version.as_str()),
        ("docker_version", template.versions.docker_version.as_str()),
    ]
}
