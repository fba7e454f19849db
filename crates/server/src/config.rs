use cluster_core::Template;
use orchestrator::StaticTemplates;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tracing::{debug, warn};

pub const CONFIG_FILE: &str = "config.json";

/// Environment the API server provisions into, stored as `config.json`
/// in the server's data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// External addresses the edge gateway may hand out when exposing clusters
    pub external_ips: Vec<String>,
    /// Template catalog; empty selects the built-in sample catalog
    pub templates: Vec<Template>,
    /// Seconds between sweeps of finished in-memory tasks, 0 disables pruning
    pub task_prune_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            external_ips: vec![
                "192.0.2.10".to_string(),
                "192.0.2.11".to_string(),
                "192.0.2.12".to_string(),
            ],
            templates: Vec::new(),
            task_prune_interval_secs: 3600,
        }
    }
}

impl ServerConfig {
    /// Read config from `dir`, falling back to defaults on any problem
    pub async fn read(dir: &Path) -> Self {
        let config_path = dir.join(CONFIG_FILE);

        if !config_path.exists() {
            debug!(path = %config_path.display(), "Config file does not exist, using defaults");
            return Self::default();
        }

        match fs::read_to_string(&config_path).await {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => {
                    debug!(path = %config_path.display(), "Config loaded successfully");
                    config
                }
                Err(e) => {
                    warn!(path = %config_path.display(), error = %e, "Failed to parse config, using defaults");
                    Self::default()
                }
            },
            Err(e) => {
                warn!(path = %config_path.display(), error = %e, "Failed to read config file, using defaults");
                Self::default()
            }
        }
    }

    pub async fn write(&self, dir: &Path) -> std::io::Result<()> {
        if !dir.exists() {
            fs::create_dir_all(dir).await?;
        }

        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, content).await?;
        debug!(path = %config_path.display(), "Config saved successfully");

        Ok(())
    }

    pub fn template_catalog(&self) -> StaticTemplates {
        if self.templates.is_empty() {
            StaticTemplates::sample()
        } else {
            StaticTemplates::new(self.templates.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_read_nonexistent() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig::read(temp_dir.path()).await;
        assert_eq!(config, ServerConfig::default());
    }

    #[tokio::test]
    async fn test_config_write_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig {
            external_ips: vec!["198.51.100.7".to_string()],
            templates: StaticTemplates::sample().templates().to_vec(),
            task_prune_interval_secs: 0,
        };

        config.write(temp_dir.path()).await.unwrap();

        let loaded = ServerConfig::read(temp_dir.path()).await;
        assert_eq!(loaded, config);
        assert_eq!(loaded.template_catalog().templates().len(), 2);
    }

    #[tokio::test]
    async fn test_config_invalid_json_falls_back() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join(CONFIG_FILE), "{ not json").unwrap();

        let config = ServerConfig::read(temp_dir.path()).await;
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"external_ips": ["198.51.100.1"]}"#).unwrap();
        assert_eq!(config.external_ips, vec!["198.51.100.1"]);
        assert_eq!(config.task_prune_interval_secs, 3600);
        assert!(config.template_catalog().templates().len() > 0);
    }
}
