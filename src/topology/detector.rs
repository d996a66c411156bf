//! Per-partition topology detection
//!
//! Each partition moves through
//!
//! ```text
//! Unprobed -> CacheCheck -> CacheHit ----------------------------> ResultReady
//!                        \-> CacheMissOrInvalid -> Probing ------/
//! ```
//!
//! with `--force` jumping from `Unprobed` straight to `Probing`. Probing picks
//! one strategy:
//!
//! | Partition | Scheduler | Strategy |
//! |-----------|-----------|----------|
//! | local | - | local probe, no devices |
//! | remote | can submit | remote probe job |
//! | remote | cannot submit | local probe, degraded |
//!
//! A partition whose processor is pinned in the configuration is never
//! probed; only its cached devices are read.
//!
//! The degraded case attaches the topology of the host running the detector.
//! It is an approximation of the remote hardware, logged as such, and still
//! cached. When a remote probe fails, the same local snapshot is attached but
//! not cached, so the next run retries the job.

use crate::config::{Config, ConfigManager};
use crate::error::{TopoError, TopoResult};
use crate::system::{Partition, System};
use crate::topology::cache::{CacheKey, CacheStore, Lookup};
use crate::topology::info::{DeviceInfo, ProcessorInfo};
use crate::topology::local::{HostIntrospector, LocalProbe, SysinfoIntrospector};
use crate::topology::remote::{RemoteProbe, RemoteProbeConfig};
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Where a partition's topology came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Provenance {
    /// Pinned in the configuration file
    Configured,
    /// Read from the topology cache
    Cache,
    /// Probed on this host
    LocalProbe,
    /// Probed by a job on the partition
    RemoteProbe,
    /// This host's topology standing in for a remote partition
    DegradedLocal,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Configured => "configured",
            Self::Cache => "cache",
            Self::LocalProbe => "local-probe",
            Self::RemoteProbe => "remote-probe",
            Self::DegradedLocal => "degraded-local",
        };
        write!(f, "{}", name)
    }
}

/// Detection progress of a single partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionState {
    Unprobed,
    CacheCheck,
    CacheHit,
    CacheMissOrInvalid,
    Probing,
    ResultReady,
}

/// Knobs of one detection run
#[derive(Debug, Clone)]
pub struct DetectOptions {
    /// Bypass the cache and probe every partition
    pub force: bool,
    /// Allow remote probe jobs
    pub remote_detect: bool,
    /// Partitions detected at the same time
    pub max_concurrent_partitions: usize,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            force: false,
            remote_detect: true,
            max_concurrent_partitions: 4,
        }
    }
}

/// A probe result waiting to be cached and attached
struct Probed {
    processor: ProcessorInfo,
    devices: Option<Vec<DeviceInfo>>,
    provenance: Provenance,
    persist: bool,
}

/// Detects and caches the topology of every partition of a system
pub struct TopologyDetector {
    store: CacheStore,
    local: LocalProbe,
    remote: RemoteProbe,
    options: DetectOptions,
}

impl TopologyDetector {
    pub fn new(
        store: CacheStore,
        introspector: Arc<dyn HostIntrospector>,
        remote: RemoteProbeConfig,
        options: DetectOptions,
    ) -> Self {
        Self {
            store,
            local: LocalProbe::new(introspector),
            remote: RemoteProbe::new(remote),
            options,
        }
    }

    /// Build a detector for this host from the loaded configuration
    pub fn from_config(
        config: &Config,
        topology_dir: Option<&Path>,
        force: bool,
    ) -> TopoResult<Self> {
        let root = ConfigManager::topology_root(config, topology_dir)?;
        debug!("Topology cache root: {}", root.display());

        let probe_command = if config.topology.probe_command.is_empty() {
            std::env::current_exe()
                .map(|exe| vec![exe.to_string_lossy().into_owned()])
                .unwrap_or_default()
        } else {
            config.topology.probe_command.clone()
        };

        let remote = RemoteProbeConfig {
            probe_command,
            stage_dir: ConfigManager::stage_dir(config, &root),
            timeout: config.topology.probe_timeout(),
            max_concurrent: config.topology.max_concurrent_probes,
        };
        let options = DetectOptions {
            force,
            remote_detect: config.general.remote_detect,
            max_concurrent_partitions: config.topology.max_concurrent_probes,
        };

        Ok(Self::new(
            CacheStore::new(root),
            Arc::new(SysinfoIntrospector::new()),
            remote,
            options,
        ))
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// Detect every partition of `system`
    ///
    /// Partitions are independent: a failure in one never stops the others.
    /// Errors are reported after all partitions were processed: the first
    /// system-wide error if any, else the first partition failure.
    pub async fn detect_topology(&self, system: &mut System) -> TopoResult<()> {
        let System {
            name, partitions, ..
        } = system;
        let system_name = name.as_str();

        let results: Vec<TopoResult<()>> = stream::iter(partitions.iter_mut())
            .map(|part| self.detect_partition(system_name, part))
            .buffer_unordered(self.options.max_concurrent_partitions.max(1))
            .collect()
            .await;

        let mut first_failure: Option<TopoError> = None;
        for err in results.into_iter().filter_map(Result::err) {
            error!("{}", err);
            let replace = match &first_failure {
                None => true,
                Some(current) => current.is_partition_scoped() && !err.is_partition_scoped(),
            };
            if replace {
                first_failure = Some(err);
            }
        }

        match first_failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Detect a single partition and attach the result to it
    pub async fn detect_partition(&self, system: &str, part: &mut Partition) -> TopoResult<()> {
        let key = CacheKey::new(system, part.name());
        transition(&key, DetectionState::Unprobed);

        if part.is_fully_configured() {
            debug!("Topology of {} is configured, skipping detection", key);
            part.attach_configured();
            transition(&key, DetectionState::ResultReady);
            return Ok(());
        }

        if let Some(processor) = part.configured_processor().cloned() {
            debug!("Processor of {} is configured, resolving devices only", key);
            let devices = match self.store.read_devices(&key).await {
                Lookup::Hit(devices) => devices,
                Lookup::Absent => Vec::new(),
                Lookup::Invalid(e) => {
                    info!("Ignoring cached devices of {}: {}", key, e);
                    Vec::new()
                }
            };
            part.attach(processor, devices, Provenance::Configured);
            transition(&key, DetectionState::ResultReady);
            return Ok(());
        }

        if self.options.force {
            debug!("Forced detection of {}, bypassing cache", key);
        } else {
            transition(&key, DetectionState::CacheCheck);
            match self.store.read_entry(&key).await {
                Lookup::Hit(entry) => {
                    transition(&key, DetectionState::CacheHit);
                    part.attach(entry.processor, entry.devices, Provenance::Cache);
                    transition(&key, DetectionState::ResultReady);
                    return Ok(());
                }
                Lookup::Absent => debug!("No cached topology for {}", key),
                Lookup::Invalid(e) => info!("Re-probing {}: {}", key, e),
            }
            transition(&key, DetectionState::CacheMissOrInvalid);
        }

        transition(&key, DetectionState::Probing);
        let probed = self.probe(&key, part).await?;

        let devices = if probed.persist {
            match self
                .store
                .write_entry(&key, &probed.processor, probed.devices.as_deref())
                .await
            {
                Ok(devices) => devices,
                Err(e) => {
                    warn!("Failed to cache topology of {}: {}", key, e);
                    probed.devices.unwrap_or_default()
                }
            }
        } else {
            match probed.devices {
                Some(devices) => devices,
                None => self.store.read_devices(&key).await.hit().unwrap_or_default(),
            }
        };

        info!("Detected topology of {} ({})", key, probed.provenance);
        part.attach(probed.processor, devices, probed.provenance);
        transition(&key, DetectionState::ResultReady);
        Ok(())
    }

    /// Run the probe strategy matching the partition
    async fn probe(&self, key: &CacheKey, part: &Partition) -> TopoResult<Probed> {
        if part.is_local() {
            let processor = self.local.probe().await.map_err(|e| fatal(key, e))?;
            return Ok(Probed {
                processor,
                devices: None,
                provenance: Provenance::LocalProbe,
                persist: true,
            });
        }

        let scheduler = part.scheduler();
        if scheduler.supports_submission() {
            if self.options.remote_detect {
                match self.remote.probe(key.system(), part).await {
                    Ok(report) => {
                        return Ok(Probed {
                            processor: report.processor,
                            devices: Some(report.devices),
                            provenance: Provenance::RemoteProbe,
                            persist: true,
                        })
                    }
                    Err(e) => warn!("{}; using this host's topology for {}", e, key),
                }
            } else {
                warn!(
                    "Remote detection disabled; using this host's topology for {}",
                    key
                );
            }
        } else {
            warn!(
                "Partition {} is remote but scheduler '{}' cannot submit jobs; \
                 using this host's topology as a best-effort approximation",
                key,
                scheduler.name()
            );
        }

        let processor = self.local.probe().await.map_err(|e| fatal(key, e))?;
        Ok(Probed {
            processor,
            devices: None,
            provenance: Provenance::DegradedLocal,
            persist: !scheduler.supports_submission(),
        })
    }
}

/// Detect and cache the topology of every partition using the default host
/// introspector
pub async fn detect_topology(system: &mut System, config: &Config, force: bool) -> TopoResult<()> {
    TopologyDetector::from_config(config, None, force)?
        .detect_topology(system)
        .await
}

fn transition(key: &CacheKey, state: DetectionState) {
    debug!(partition = %key, state = ?state, "topology detection");
}

fn fatal(key: &CacheKey, source: TopoError) -> TopoError {
    TopoError::ConfigurationFatal {
        partition: key.to_string(),
        reason: source.to_string(),
    }
}
