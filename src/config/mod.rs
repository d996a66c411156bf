//! Configuration management for topocache

pub mod schema;

pub use schema::{Config, EnvironConfig, PartitionConfig, SystemConfig, TopologyConfig};

use crate::error::{TopoError, TopoResult};
use crate::topology::cache;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("topocache")
            .join("config.toml")
    }

    /// Resolve the topology cache root for one run
    ///
    /// Precedence: explicit override (CLI flag or environment), then
    /// `general.topology_dir`, then the home directory default.
    pub fn topology_root(config: &Config, override_dir: Option<&Path>) -> TopoResult<PathBuf> {
        let override_dir = override_dir.or(config.general.topology_dir.as_deref());
        cache::resolve_root(dirs::home_dir().as_deref(), override_dir)
    }

    /// Resolve the shared stage directory for probe jobs
    ///
    /// Falls back to a hidden directory below the topology root when no home
    /// directory is available.
    pub fn stage_dir(config: &Config, topology_root: &Path) -> PathBuf {
        if let Some(dir) = &config.topology.stage_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .map(|home| home.join(".topocache").join("stage"))
            .unwrap_or_else(|| topology_root.join(".stage"))
    }

    /// Load configuration, creating default if not exists
    pub async fn load(&self) -> TopoResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> TopoResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| TopoError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| TopoError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> TopoResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            TopoError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> TopoResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| TopoError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
