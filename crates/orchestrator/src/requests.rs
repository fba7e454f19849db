//! Inputs of the lifecycle operations.

use cluster_core::{ClusterSpec, NodePoolSpec, TemplateRef};
use serde::{Deserialize, Serialize};

use crate::error::{OrchestratorError, Result};

fn default_workers() -> u32 {
    2
}

fn default_rollback() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct CreateClusterRequest {
    pub name: String,
    pub org_name: String,
    pub vdc_name: String,
    pub network: String,
    /// Falls back to the configured default template when both are absent.
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub template_revision: Option<u32>,
    #[serde(default = "default_workers")]
    pub workers: u32,
    #[serde(default)]
    pub nfs: u32,
    #[serde(default)]
    pub control_plane_sizing_class: Option<String>,
    #[serde(default)]
    pub worker_sizing_class: Option<String>,
    #[serde(default)]
    pub nfs_sizing_class: Option<String>,
    #[serde(default)]
    pub storage_profile: Option<String>,
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default = "default_rollback")]
    pub rollback: bool,
    #[serde(default)]
    pub expose: bool,
}

impl CreateClusterRequest {
    pub fn new(
        name: impl Into<String>,
        org_name: impl Into<String>,
        vdc_name: impl Into<String>,
        network: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            org_name: org_name.into(),
            vdc_name: vdc_name.into(),
            network: network.into(),
            template_name: None,
            template_revision: None,
            workers: default_workers(),
            nfs: 0,
            control_plane_sizing_class: None,
            worker_sizing_class: None,
            nfs_sizing_class: None,
            storage_profile: None,
            ssh_key: None,
            rollback: default_rollback(),
            expose: false,
        }
    }

    pub fn with_template(mut self, name: impl Into<String>, revision: u32) -> Self {
        self.template_name = Some(name.into());
        self.template_revision = Some(revision);
        self
    }

    pub fn with_workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_nfs(mut self, nfs: u32) -> Self {
        self.nfs = nfs;
        self
    }

    pub fn with_ssh_key(mut self, ssh_key: impl Into<String>) -> Self {
        self.ssh_key = Some(ssh_key.into());
        self
    }

    pub fn with_rollback(mut self, rollback: bool) -> Self {
        self.rollback = rollback;
        self
    }

    pub fn with_expose(mut self, expose: bool) -> Self {
        self.expose = expose;
        self
    }

    /// Reject worker or nfs counts above `max`.
    pub fn check_pool_limits(&self, max: u32) -> Result<()> {
        check_pool_limit("worker", i64::from(self.workers), max)?;
        check_pool_limit("nfs", i64::from(self.nfs), max)
    }

    fn pool(&self, count: u32, sizing_class: &Option<String>) -> NodePoolSpec {
        NodePoolSpec {
            count,
            sizing_class: sizing_class.clone(),
            storage_profile: self.storage_profile.clone(),
        }
    }

    pub fn to_spec(&self, template: TemplateRef) -> ClusterSpec {
        ClusterSpec {
            control_plane: self.pool(1, &self.control_plane_sizing_class),
            workers: self.pool(self.workers, &self.worker_sizing_class),
            nfs: self.pool(self.nfs, &self.nfs_sizing_class),
            network: self.network.clone(),
            template,
            ssh_key: self.ssh_key.clone(),
            rollback_on_failure: self.rollback,
            expose: self.expose,
        }
    }
}

/// Desired node counts and exposure; absent fields keep the current value.
///
/// Counts are signed so negative input can be rejected with a proper error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ResizeRequest {
    #[serde(default)]
    pub workers: Option<i64>,
    #[serde(default)]
    pub nfs: Option<i64>,
    #[serde(default)]
    pub expose: Option<bool>,
}

impl ResizeRequest {
    pub fn workers(workers: i64) -> Self {
        Self {
            workers: Some(workers),
            ..Self::default()
        }
    }

    pub fn with_nfs(mut self, nfs: i64) -> Self {
        self.nfs = Some(nfs);
        self
    }

    pub fn with_expose(mut self, expose: bool) -> Self {
        self.expose = Some(expose);
        self
    }

    /// Reject requested counts above `max`.
    pub fn check_pool_limits(&self, max: u32) -> Result<()> {
        if let Some(workers) = self.workers {
            check_pool_limit("worker", workers, max)?;
        }
        if let Some(nfs) = self.nfs {
            check_pool_limit("nfs", nfs, max)?;
        }
        Ok(())
    }

    /// Resolve against current counts, rejecting negative values.
    pub fn desired_counts(&self, current_workers: u32, current_nfs: u32) -> Result<(u32, u32)> {
        Ok((
            desired_count("worker", self.workers, current_workers)?,
            desired_count("nfs", self.nfs, current_nfs)?,
        ))
    }
}

fn check_pool_limit(kind: &str, requested: i64, max: u32) -> Result<()> {
    if requested > i64::from(max) {
        return Err(OrchestratorError::invalid_request(format!(
            "{} count {} exceeds the limit of {} nodes",
            kind, requested, max
        )));
    }
    Ok(())
}

fn desired_count(kind: &str, requested: Option<i64>, current: u32) -> Result<u32> {
    match requested {
        None => Ok(current),
        Some(n) => u32::try_from(n).map_err(|_| {
            OrchestratorError::invalid_request(format!(
                "{} count must be a non-negative integer, got {}",
                kind, n
            ))
        }),
    }
}

/// Generic update: dispatched to resize or upgrade depending on what differs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct UpdateClusterRequest {
    #[serde(default)]
    pub workers: Option<i64>,
    #[serde(default)]
    pub nfs: Option<i64>,
    #[serde(default)]
    pub expose: Option<bool>,
    #[serde(default)]
    pub template: Option<TemplateRef>,
}

impl UpdateClusterRequest {
    pub fn as_resize(&self) -> ResizeRequest {
        ResizeRequest {
            workers: self.workers,
            nfs: self.nfs,
            expose: self.expose,
        }
    }
}
