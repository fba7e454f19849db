use std::path::Path;

use anyhow::{Context, Result};
use orchestrator::OrchestratorConfig;
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE: &str = "clusterctl.toml";
pub const DEFAULT_PORT: u16 = 3001;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub server: ListenConfig,
    pub orchestrator: OrchestratorConfig,
}

impl CliConfig {
    /// Missing file yields the defaults; a malformed one is an error.
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub async fn save(&self, dir: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        tokio::fs::write(dir.join(CONFIG_FILE), content)
            .await
            .context("Failed to write config")?;
        Ok(())
    }
}
