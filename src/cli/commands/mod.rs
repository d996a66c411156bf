//! CLI command implementations

pub mod cache;
pub mod config;
pub mod detect;
pub mod probe;
pub mod show;

pub use cache::execute as cache;
pub use config::execute as config;
pub use detect::execute as detect;
pub use probe::execute as probe;
pub use show::execute as show;

use crate::cli::args::OutputFormat;
use crate::error::TopoResult;
use crate::topology::{DeviceInfo, ProcessorInfo};
use console::style;
use serde::Serialize;

/// One partition in a topology listing
#[derive(Debug, Serialize)]
pub(crate) struct TopologyRow {
    system: String,
    partition: String,
    state: String,
    processor: Option<ProcessorInfo>,
    devices: Vec<DeviceInfo>,
}

impl TopologyRow {
    pub(crate) fn new(
        system: &str,
        partition: &str,
        state: impl Into<String>,
        processor: Option<&ProcessorInfo>,
        devices: &[DeviceInfo],
    ) -> Self {
        Self {
            system: system.to_string(),
            partition: partition.to_string(),
            state: state.into(),
            processor: processor.cloned(),
            devices: devices.to_vec(),
        }
    }

    fn device_summary(&self) -> String {
        if self.devices.is_empty() {
            return "-".to_string();
        }
        self.devices
            .iter()
            .map(|d| format!("{}x {}:{}", d.num_devices(), d.device_type(), d.arch()))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub(crate) fn print_rows(rows: &[TopologyRow], format: OutputFormat) -> TopoResult<()> {
    match format {
        OutputFormat::Table => print_table(rows),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(rows)?),
    }
    Ok(())
}

fn print_table(rows: &[TopologyRow]) {
    println!(
        "{:<24} {:<16} {:<14} {:>6} {:>8}  {}",
        style("PARTITION").bold(),
        style("STATE").bold(),
        style("ARCH").bold(),
        style("CPUS").bold(),
        style("SOCKETS").bold(),
        style("DEVICES").bold()
    );
    println!("{}", "-".repeat(90));

    for row in rows {
        let state = match row.state.as_str() {
            "not cached" | "unresolved" => style(row.state.as_str()).dim(),
            "invalid" => style(row.state.as_str()).red(),
            "degraded-local" => style(row.state.as_str()).yellow(),
            _ => style(row.state.as_str()).green(),
        };
        let processor = row.processor.as_ref();
        let arch = processor.and_then(|p| p.arch().or(p.platform())).unwrap_or("-");
        let count = |n: Option<u64>| n.map(|n| n.to_string()).unwrap_or_else(|| "-".into());

        println!(
            "{:<24} {:<16} {:<14} {:>6} {:>8}  {}",
            format!("{}:{}", row.system, row.partition),
            state,
            arch,
            count(processor.and_then(|p| p.num_cpus())),
            count(processor.and_then(|p| p.num_sockets())),
            row.device_summary()
        );
    }

    println!();
    println!("{} partition(s)", rows.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_summary_lists_groups() {
        let row = TopologyRow::new(
            "generic",
            "gpu",
            "cache",
            None,
            &[DeviceInfo::gpu("a100", 8), DeviceInfo::gpu("sm_90", 1)],
        );
        assert_eq!(row.device_summary(), "8x gpu:a100, 1x gpu:sm_90");
    }

    #[test]
    fn rows_serialize_with_null_processor() {
        let row = TopologyRow::new("generic", "default", "not cached", None, &[]);
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["partition"], "default");
        assert!(json["processor"].is_null());
        assert_eq!(json["devices"], serde_json::json!([]));
    }
}
