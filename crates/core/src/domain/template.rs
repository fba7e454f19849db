use serde::{Deserialize, Serialize};
use std::fmt;
use utoipa::ToSchema;

use crate::error::{CoreError, Result};

/// Reference to a template by `(name, revision)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, ToSchema)]
pub struct TemplateRef {
    pub name: String,
    pub revision: u32,
}

impl TemplateRef {
    pub fn new(name: impl Into<String>, revision: u32) -> Self {
        Self {
            name: name.into(),
            revision,
        }
    }
}

impl fmt::Display for TemplateRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (revision {})", self.name, self.revision)
    }
}

/// Software versions a template installs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct TemplateVersions {
    /// Kubernetes distribution name, e.g. "upstream"
    pub kubernetes: String,
    pub kubernetes_version: String,
    pub cni: String,
    pub cni_version: String,
    pub docker_version: String,
    pub os: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Template {
    pub name: String,
    pub revision: u32,
    pub kind: String,
    pub versions: TemplateVersions,
    #[serde(default)]
    pub upgrade_from: Vec<String>,
    /// Name of the VM inside the catalog item that nodes are cloned from
    pub source_vm: String,
    pub catalog_item: String,
    #[serde(default)]
    pub deprecated: bool,
}

impl Template {
    pub fn reference(&self) -> TemplateRef {
        TemplateRef::new(self.name.clone(), self.revision)
    }

    /// Whether a cluster built from `current` may move to this template.
    ///
    /// The template must list the current template name in `upgrade_from`,
    /// and a template with the same name must carry a strictly newer revision.
    pub fn is_upgrade_target_for(&self, current: &TemplateRef) -> bool {
        if !self.upgrade_from.iter().any(|name| name == &current.name) {
            return false;
        }
        !(self.name == current.name && self.revision <= current.revision)
    }
}

/// All templates a cluster on `current` may be upgraded to.
pub fn upgrade_targets<'a>(
    current: &TemplateRef,
    templates: impl IntoIterator<Item = &'a Template>,
) -> Vec<Template> {
    templates
        .into_iter()
        .filter(|t| t.is_upgrade_target_for(current))
        .cloned()
        .collect()
}

/// `"<name> <version>"`, the form stored in cluster status.
pub fn software_string(name: &str, version: &str) -> String {
    format!("{} {}", name, version)
}

/// Last whitespace separated token of a software string.
pub fn version_of(software: &str) -> &str {
    software.split_whitespace().last().unwrap_or("")
}

pub fn parse_version(raw: &str) -> Result<semver::Version> {
    let trimmed = raw.trim().trim_start_matches('v');
    let normalized = match trimmed.split('.').count() {
        1 => format!("{}.0.0", trimmed),
        2 => format!("{}.0", trimmed),
        _ => trimmed.to_string(),
    };
    semver::Version::parse(&normalized).map_err(|e| CoreError::InvalidVersion {
        version: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Which software components an upgrade between two version sets touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UpgradeDelta {
    pub kubernetes: bool,
    pub docker: bool,
    pub cni: bool,
}

impl UpgradeDelta {
    /// Docker versions are `YY.MM.patch` and compare lexicographically.
    /// Kubernetes is re-applied even at an equal version; CNI is re-applied
    /// when its version grows or kubernetes moves to a new minor/major.
    pub fn between(
        current_kubernetes: &str,
        current_cni: &str,
        current_docker: &str,
        target: &TemplateVersions,
    ) -> Result<Self> {
        let c_k8s = parse_version(current_kubernetes)?;
        let t_k8s = parse_version(&target.kubernetes_version)?;
        let c_cni = parse_version(current_cni)?;
        let t_cni = parse_version(&target.cni_version)?;

        Ok(Self {
            kubernetes: t_k8s >= c_k8s,
            docker: target.docker_version.as_str() > current_docker,
            cni: t_cni > c_cni || t_k8s.major > c_k8s.major || t_k8s.minor > c_k8s.minor,
        })
    }

    pub fn needs_drain_all(&self) -> bool {
        self.docker || self.cni
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template(name: &str, revision: u32, upgrade_from: &[&str]) -> Template {
        Template {
            name: name.to_string(),
            revision,
            kind: "native".to_string(),
            versions: TemplateVersions::default(),
            upgrade_from: upgrade_from.iter().map(|s| s.to_string()).collect(),
            source_vm: format!("{}-vm", name),
            catalog_item: format!("{}_rev{}", name, revision),
            deprecated: false,
        }
    }

    #[test]
    fn test_upgrade_targets() {
        let current = TemplateRef::new("ubuntu-k8s", 2);
        let templates = vec![
            template("ubuntu-k8s", 1, &["ubuntu-k8s"]),
            template("ubuntu-k8s", 2, &["ubuntu-k8s"]),
            template("ubuntu-k8s", 3, &["ubuntu-k8s"]),
            template("photon-k8s", 1, &["ubuntu-k8s"]),
            template("ubuntu-x", 9, &["photon-k8s"]),
        ];

        let targets = upgrade_targets(&current, &templates);
        let refs: Vec<TemplateRef> = targets.iter().map(Template::reference).collect();

        assert_eq!(
            refs,
            vec![
                TemplateRef::new("ubuntu-k8s", 3),
                TemplateRef::new("photon-k8s", 1)
            ]
        );
    }

    #[test]
    fn test_parse_version_normalizes() {
        assert_eq!(parse_version("v1.21").unwrap(), semver::Version::new(1, 21, 0));
        assert_eq!(parse_version("1.20.8").unwrap(), semver::Version::new(1, 20, 8));
        assert!(parse_version("not-a-version").is_err());
    }

    #[test]
    fn test_software_string() {
        let s = software_string("antrea", "0.11.3");
        assert_eq!(s, "antrea 0.11.3");
        assert_eq!(version_of(&s), "0.11.3");
        assert_eq!(version_of(""), "");
    }

    #[test]
    fn test_upgrade_delta_minor_bump() {
        let target = TemplateVersions {
            kubernetes: "upstream".to_string(),
            kubernetes_version: "1.21.2".to_string(),
            cni: "antrea".to_string(),
            cni_version: "0.11.3".to_string(),
            docker_version: "20.10.7".to_string(),
            os: "ubuntu-20.04".to_string(),
        };

        let delta = UpgradeDelta::between("1.20.8", "0.11.3", "19.03.15", &target).unwrap();
        assert!(delta.kubernetes);
        assert!(delta.docker);
        // same CNI version but kubernetes moved to a new minor
        assert!(delta.cni);
        assert!(delta.needs_drain_all());
    }

    #[test]
    fn test_upgrade_delta_patch_only() {
        let target = TemplateVersions {
            kubernetes_version: "1.20.9".to_string(),
            cni_version: "0.11.3".to_string(),
            docker_version: "19.03.15".to_string(),
            ..Default::default()
        };

        let delta = UpgradeDelta::between("1.20.8", "0.11.3", "19.03.15", &target).unwrap();
        assert!(delta.kubernetes);
        assert!(!delta.docker);
        assert!(!delta.cni);
        assert!(!delta.needs_drain_all());
    }
}
