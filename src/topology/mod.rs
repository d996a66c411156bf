//! Processor and device topology of system partitions
//!
//! Detection results are cached per `(system, partition)` below the topology
//! root so that later runs skip probing.

pub mod cache;
pub mod detector;
pub mod devices;
pub mod info;
pub mod local;
pub mod remote;

pub use cache::{CacheKey, CacheStore, CachedTopology, Lookup};
pub use detector::{detect_topology, DetectOptions, DetectionState, Provenance, TopologyDetector};
pub use devices::enumerate_devices;
pub use info::{DeviceInfo, Frozen, InfoMap, ProbeReport, ProcessorInfo};
pub use local::{HostIntrospector, LocalProbe, SysinfoIntrospector};
pub use remote::{RemoteProbe, RemoteProbeConfig};
