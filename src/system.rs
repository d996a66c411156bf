//! Runtime system model
//!
//! Built from [`SystemConfig`]; each partition owns its scheduler backend and
//! receives its processor and devices from topology detection.

use crate::config::{EnvironConfig, SystemConfig, TopologyConfig};
use crate::error::{TopoError, TopoResult};
use crate::scheduler::{create_scheduler, JobScheduler, LocalScheduler};
use crate::topology::{DeviceInfo, ProcessorInfo, Provenance};
use std::fmt;
use std::sync::Arc;

/// An execution partition of a system
pub struct Partition {
    name: String,
    scheduler: Arc<dyn JobScheduler>,
    launcher: String,
    access: Vec<String>,
    environs: Vec<EnvironConfig>,
    configured_processor: Option<ProcessorInfo>,
    configured_devices: Vec<DeviceInfo>,
    processor: Option<ProcessorInfo>,
    devices: Vec<DeviceInfo>,
    provenance: Option<Provenance>,
}

impl Partition {
    /// Create a partition with no configured topology
    pub fn new(
        name: impl Into<String>,
        scheduler: Arc<dyn JobScheduler>,
        launcher: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            scheduler,
            launcher: launcher.into(),
            access: vec![],
            environs: vec![EnvironConfig::default()],
            configured_processor: None,
            configured_devices: vec![],
            processor: None,
            devices: vec![],
            provenance: None,
        }
    }

    /// A partition running directly on this host
    pub fn local(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(LocalScheduler::new()), "local")
    }

    pub fn with_access(mut self, access: Vec<String>) -> Self {
        self.access = access;
        self
    }

    pub fn with_environs(mut self, environs: Vec<EnvironConfig>) -> Self {
        self.environs = environs;
        self
    }

    /// Pin the processor topology; detection never overrides it
    ///
    /// An empty record pins nothing.
    pub fn with_processor(mut self, processor: ProcessorInfo) -> Self {
        self.configured_processor = (!processor.is_empty()).then_some(processor);
        self
    }

    /// Pin the device list; detection never overrides a non-empty list
    pub fn with_devices(mut self, devices: Vec<DeviceInfo>) -> Self {
        self.configured_devices = devices;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> &dyn JobScheduler {
        self.scheduler.as_ref()
    }

    pub fn launcher(&self) -> &str {
        &self.launcher
    }

    pub fn access(&self) -> &[String] {
        &self.access
    }

    pub fn environs(&self) -> &[EnvironConfig] {
        &self.environs
    }

    /// True when jobs of this partition run on the current host
    pub fn is_local(&self) -> bool {
        self.scheduler.name() == "local" && self.launcher == "local"
    }

    /// Processor pinned by the configuration
    pub fn configured_processor(&self) -> Option<&ProcessorInfo> {
        self.configured_processor.as_ref()
    }

    /// True when the configuration fully pins the topology
    pub fn is_fully_configured(&self) -> bool {
        self.configured_processor.is_some() && !self.configured_devices.is_empty()
    }

    /// Detected (or configured) processor; `None` before detection
    pub fn processor(&self) -> Option<&ProcessorInfo> {
        self.processor.as_ref().or(self.configured_processor.as_ref())
    }

    /// Detected (or configured) devices
    pub fn devices(&self) -> &[DeviceInfo] {
        if self.configured_devices.is_empty() {
            &self.devices
        } else {
            &self.configured_devices
        }
    }

    /// Where the attached topology came from
    pub fn provenance(&self) -> Option<Provenance> {
        self.provenance
    }

    /// Launcher prefix for running a single task on a compute node
    pub fn launcher_command(&self) -> Vec<String> {
        let prefix: &[&str] = match self.launcher.as_str() {
            "srun" => &["srun", "-n", "1"],
            "mpirun" | "mpiexec" => &["mpirun", "-np", "1"],
            "alps" | "aprun" => &["aprun", "-n", "1"],
            _ => &[],
        };
        prefix.iter().map(|s| s.to_string()).collect()
    }

    /// Attach a detection result; configured values stay authoritative
    pub(crate) fn attach(
        &mut self,
        processor: ProcessorInfo,
        devices: Vec<DeviceInfo>,
        provenance: Provenance,
    ) {
        self.processor = Some(self.configured_processor.clone().unwrap_or(processor));
        self.devices = devices;
        self.provenance = Some(provenance);
    }

    /// Attach the configured topology as-is
    pub(crate) fn attach_configured(&mut self) {
        self.processor = self.configured_processor.clone();
        self.provenance = Some(Provenance::Configured);
    }
}

impl fmt::Debug for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("name", &self.name)
            .field("scheduler", &self.scheduler.name())
            .field("launcher", &self.launcher)
            .field("processor", &self.processor)
            .field("devices", &self.devices)
            .field("provenance", &self.provenance)
            .finish()
    }
}

/// A system and its partitions
#[derive(Debug)]
pub struct System {
    pub name: String,
    pub partitions: Vec<Partition>,
}

impl System {
    /// Build the runtime model, instantiating each partition's scheduler
    pub fn from_config(config: &SystemConfig, settings: &TopologyConfig) -> TopoResult<Self> {
        let partitions = config
            .partitions
            .iter()
            .map(|part| {
                let scheduler = create_scheduler(&part.scheduler, settings)?;
                let mut partition = Partition::new(&part.name, scheduler, &part.launcher)
                    .with_access(part.access.clone())
                    .with_environs(part.environs.clone())
                    .with_devices(part.devices.clone());
                if let Some(processor) = &part.processor {
                    partition = partition.with_processor(processor.clone());
                }
                Ok(partition)
            })
            .collect::<TopoResult<Vec<_>>>()?;

        Ok(Self {
            name: config.name.clone(),
            partitions,
        })
    }

    /// Look up a partition by name
    pub fn partition(&self, name: &str) -> TopoResult<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| TopoError::PartitionNotFound(name.to_string()))
    }
}
