//! Exposure of a cluster's control-plane endpoint through the edge gateway.

use std::sync::{Arc, OnceLock};

use regex::Regex;
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};
use crate::infra::{NetworkGateway, NetworkScope};

pub const KUBE_API_PORT: u16 = 6443;

const EXPOSE_RULE_SUFFIX: &str = "expose";

static IP_PORT_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn ip_port_regex() -> Option<&'static Regex> {
    IP_PORT_PATTERN
        .get_or_init(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d{1,5}\b").ok())
        .as_ref()
}

/// Deterministic DNAT rule name; the cluster id keeps it unique per gateway.
pub fn dnat_rule_name(cluster_name: &str, cluster_id: &str) -> String {
    format!("{}_{}_{}", cluster_name, cluster_id, EXPOSE_RULE_SUFFIX)
}

/// Point every `<ipv4>:<port>` endpoint in `kubeconfig` at `new_ip` on the API port.
pub fn rewrite_kubeconfig_endpoint(kubeconfig: &str, new_ip: &str) -> String {
    match ip_port_regex() {
        Some(re) => re
            .replace_all(kubeconfig, format!("{}:{}", new_ip, KUBE_API_PORT).as_str())
            .into_owned(),
        None => kubeconfig.to_string(),
    }
}

#[derive(Clone)]
pub struct NetworkExposure {
    gateway: Arc<dyn NetworkGateway>,
}

impl NetworkExposure {
    pub fn new(gateway: Arc<dyn NetworkGateway>) -> Self {
        Self { gateway }
    }

    /// Reserve an external address and map it to `internal_ip`.
    ///
    /// Returns the external address the control-plane endpoint should use.
    pub async fn expose(
        &self,
        scope: &NetworkScope,
        internal_ip: &str,
        cluster_name: &str,
        cluster_id: &str,
    ) -> Result<String> {
        let external_ip = self
            .gateway
            .get_available_ip(scope)
            .await?
            .ok_or_else(|| {
                OrchestratorError::operation(format!(
                    "No available ips found for cluster {} ({})",
                    cluster_name, cluster_id
                ))
            })?;

        let rule = dnat_rule_name(cluster_name, cluster_id);
        debug!(rule = %rule, internal_ip, external_ip = %external_ip, "Adding DNAT rule");
        self.gateway
            .add_dnat_rule(scope, &rule, internal_ip, &external_ip)
            .await?;

        info!(cluster_id, external_ip = %external_ip, "Cluster exposed");
        Ok(external_ip)
    }

    pub async fn unexpose(
        &self,
        scope: &NetworkScope,
        cluster_name: &str,
        cluster_id: &str,
    ) -> Result<()> {
        let rule = dnat_rule_name(cluster_name, cluster_id);
        self.gateway.delete_dnat_rule(scope, &rule).await?;
        info!(cluster_id, rule = %rule, "Cluster unexposed");
        Ok(())
    }
}
