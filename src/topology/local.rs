//! Local processor probe
//!
//! Wraps the host introspector. The snapshot is taken at most once per probe
//! instance, so every partition falling back to it in one run sees the same
//! record.

use crate::error::{TopoError, TopoResult};
use crate::topology::info::{InfoMap, ProcessorInfo};
use serde_json::Value;
use std::sync::Arc;
use sysinfo::{CpuRefreshKind, RefreshKind, System};
use tokio::sync::OnceCell;
use tracing::debug;

/// OS introspection of the current host
pub trait HostIntrospector: Send + Sync {
    /// Raw processor properties of this host
    fn cpuinfo(&self) -> TopoResult<InfoMap>;
}

/// Host introspection backed by `sysinfo`
///
/// Reports the ISA as `platform`. The microarchitecture is not known here,
/// so no `arch` key is written.
#[derive(Debug, Default)]
pub struct SysinfoIntrospector;

impl SysinfoIntrospector {
    pub fn new() -> Self {
        Self
    }
}

impl HostIntrospector for SysinfoIntrospector {
    fn cpuinfo(&self) -> TopoResult<InfoMap> {
        let sys = System::new_with_specifics(
            RefreshKind::new().with_cpu(CpuRefreshKind::everything()),
        );
        let cpus = sys.cpus();
        let first = cpus.first().ok_or_else(|| {
            TopoError::IntrospectionUnavailable("no CPUs reported by the OS".to_string())
        })?;

        let logical = cpus.len();
        let physical = sys.physical_core_count().unwrap_or(logical).clamp(1, logical);
        let per_core = (logical / physical).max(1);
        let sockets = count_sockets().unwrap_or(1).clamp(1, logical);

        let mut info = InfoMap::new();
        info.insert("platform".into(), Value::from(std::env::consts::ARCH));
        info.insert("vendor".into(), Value::from(first.vendor_id().trim()));
        info.insert("model".into(), Value::from(first.brand().trim()));
        info.insert("num_cpus".into(), Value::from(logical));
        info.insert("num_cpus_per_core".into(), Value::from(per_core));
        info.insert("num_cpus_per_socket".into(), Value::from(logical / sockets));
        info.insert("num_sockets".into(), Value::from(sockets));

        if let Some(nodes) = count_numa_nodes() {
            let mut topology = InfoMap::new();
            topology.insert("num_numa_nodes".into(), Value::from(nodes));
            info.insert("topology".into(), Value::Object(topology));
        }

        Ok(info)
    }
}

#[cfg(target_os = "linux")]
fn count_sockets() -> Option<usize> {
    use std::collections::BTreeSet;

    let entries = std::fs::read_dir("/sys/devices/system/cpu").ok()?;
    let packages: BTreeSet<String> = entries
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.strip_prefix("cpu")
                .is_some_and(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        })
        .filter_map(|e| std::fs::read_to_string(e.path().join("topology/physical_package_id")).ok())
        .map(|id| id.trim().to_string())
        .collect();

    (!packages.is_empty()).then_some(packages.len())
}

#[cfg(not(target_os = "linux"))]
fn count_sockets() -> Option<usize> {
    None
}

#[cfg(target_os = "linux")]
fn count_numa_nodes() -> Option<usize> {
    let entries = std::fs::read_dir("/sys/devices/system/node").ok()?;
    let nodes = entries
        .filter_map(Result::ok)
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.strip_prefix("node")
                .is_some_and(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()))
        })
        .count();

    (nodes > 0).then_some(nodes)
}

#[cfg(not(target_os = "linux"))]
fn count_numa_nodes() -> Option<usize> {
    None
}

/// Processor probe of the host this process runs on
pub struct LocalProbe {
    introspector: Arc<dyn HostIntrospector>,
    snapshot: OnceCell<ProcessorInfo>,
}

impl LocalProbe {
    pub fn new(introspector: Arc<dyn HostIntrospector>) -> Self {
        Self {
            introspector,
            snapshot: OnceCell::new(),
        }
    }

    /// Processor record of the current host
    ///
    /// The mapping is exactly what the introspector reports.
    pub async fn probe(&self) -> TopoResult<ProcessorInfo> {
        self.snapshot
            .get_or_try_init(|| async {
                let introspector = Arc::clone(&self.introspector);
                let info = tokio::task::spawn_blocking(move || introspector.cpuinfo())
                    .await
                    .map_err(|e| TopoError::Internal(format!("host introspection panicked: {e}")))??;

                debug!("Local processor snapshot has {} properties", info.len());
                ProcessorInfo::new(info)
            })
            .await
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingIntrospector {
        calls: AtomicUsize,
    }

    impl HostIntrospector for CountingIntrospector {
        fn cpuinfo(&self) -> TopoResult<InfoMap> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut info = InfoMap::new();
            info.insert("arch".into(), Value::from("haswell"));
            info.insert("num_cpus".into(), Value::from(24));
            Ok(info)
        }
    }

    struct BrokenIntrospector;

    impl HostIntrospector for BrokenIntrospector {
        fn cpuinfo(&self) -> TopoResult<InfoMap> {
            Err(TopoError::IntrospectionUnavailable("unsupported".to_string()))
        }
    }

    #[tokio::test]
    async fn probe_wraps_introspector_output() {
        let introspector = Arc::new(CountingIntrospector {
            calls: AtomicUsize::new(0),
        });
        let probe = LocalProbe::new(introspector.clone());

        let cpu = probe.probe().await.unwrap();
        assert_eq!(cpu.info(), &introspector.cpuinfo().unwrap());
        assert_eq!(cpu.num_cpus(), Some(24));
    }

    #[tokio::test]
    async fn probe_snapshots_once() {
        let introspector = Arc::new(CountingIntrospector {
            calls: AtomicUsize::new(0),
        });
        let probe = LocalProbe::new(introspector.clone());

        let first = probe.probe().await.unwrap();
        let second = probe.probe().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(introspector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn probe_propagates_unavailable() {
        let probe = LocalProbe::new(Arc::new(BrokenIntrospector));
        assert!(matches!(
            probe.probe().await,
            Err(TopoError::IntrospectionUnavailable(_))
        ));
    }

    #[test]
    fn sysinfo_reports_core_counts() {
        let info = SysinfoIntrospector::new().cpuinfo().unwrap();
        let cpu = ProcessorInfo::new(info).unwrap();
        assert!(cpu.num_cpus().unwrap() >= 1);
        assert!(cpu.num_sockets().unwrap() >= 1);
        assert!(cpu.num_cpus_per_core().unwrap() >= 1);
        assert!(cpu.num_cpus_per_core().unwrap() <= cpu.num_cpus().unwrap());
        assert_eq!(cpu.platform(), Some(std::env::consts::ARCH));
        assert_eq!(cpu.arch(), None);
    }
}
