//! Probe command - report the topology of the current host
//!
//! This is the payload of remote probe jobs: the detector parses the single
//! JSON line it prints.

use crate::cli::args::ProbeArgs;
use crate::error::{TopoError, TopoResult};
use crate::topology::{enumerate_devices, LocalProbe, ProbeReport, SysinfoIntrospector};
use std::sync::Arc;
use tokio::fs;
use tracing::debug;

/// Execute the probe command
pub async fn execute(args: ProbeArgs) -> TopoResult<()> {
    let processor = LocalProbe::new(Arc::new(SysinfoIntrospector::new()))
        .probe()
        .await?;
    let devices = enumerate_devices().await;
    debug!("Found {} device group(s)", devices.len());

    let line = serde_json::to_string(&ProbeReport { processor, devices })?;

    if let Some(path) = args.output {
        fs::write(&path, format!("{line}\n"))
            .await
            .map_err(|e| TopoError::io(format!("writing probe report to {}", path.display()), e))?;
    }

    println!("{line}");
    Ok(())
}
