//! Configuration schema for topocache
//!
//! Configuration is stored at `~/.config/topocache/config.toml`

use crate::topology::{DeviceInfo, ProcessorInfo};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Detection tuning
    pub topology: TopologyConfig,

    /// The system whose partitions are detected
    pub system: SystemConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Probe remote partitions through their scheduler
    pub remote_detect: bool,

    /// Topology cache root (default: `~/.topocache/topology`)
    pub topology_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            remote_detect: true,
            topology_dir: None,
        }
    }
}

/// Detection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    /// Maximum number of partitions probed at the same time
    pub max_concurrent_probes: usize,

    /// Give up on a remote probe after this many seconds (0 = wait for the scheduler)
    pub probe_timeout_secs: u64,

    /// Interval between job state queries
    pub poll_interval_secs: u64,

    /// Probe jobs a single batch scheduler may run at the same time
    pub scheduler_max_jobs: usize,

    /// Command run by probe jobs (default: this executable)
    pub probe_command: Vec<String>,

    /// Shared directory for probe job scripts and output (default: `~/.topocache/stage`)
    pub stage_dir: Option<PathBuf>,
}

impl TopologyConfig {
    pub fn probe_timeout(&self) -> Option<Duration> {
        (self.probe_timeout_secs > 0).then(|| Duration::from_secs(self.probe_timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_probes: 4,
            probe_timeout_secs: 0,
            poll_interval_secs: 5,
            scheduler_max_jobs: 8,
            probe_command: vec![],
            stage_dir: None,
        }
    }
}

/// System description
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// System name, first half of every cache key
    pub name: String,

    /// Execution partitions
    pub partitions: Vec<PartitionConfig>,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "generic".to_string(),
            partitions: vec![PartitionConfig::default()],
        }
    }
}

/// One execution partition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Partition name, second half of the cache key
    pub name: String,

    /// Scheduler backend: "local" or "slurm"
    pub scheduler: String,

    /// Parallel launcher: "local", "srun", "mpirun", ...
    pub launcher: String,

    /// Scheduler access options passed to every job
    pub access: Vec<String>,

    /// Programming environments; probe jobs use the first one
    pub environs: Vec<EnvironConfig>,

    /// Known processor topology; skips processor detection when set
    pub processor: Option<ProcessorInfo>,

    /// Known devices; skips device detection when non-empty
    pub devices: Vec<DeviceInfo>,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            scheduler: "local".to_string(),
            launcher: "local".to_string(),
            access: vec![],
            environs: vec![EnvironConfig::default()],
            processor: None,
            devices: vec![],
        }
    }
}

/// Programming environment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironConfig {
    /// Environment name
    pub name: String,

    /// Modules to load
    pub modules: Vec<String>,

    /// Environment variables to export
    pub variables: BTreeMap<String, String>,
}

impl Default for EnvironConfig {
    fn default() -> Self {
        Self {
            name: "builtin".to_string(),
            modules: vec![],
            variables: BTreeMap::new(),
        }
    }
}
