//! Accelerator enumeration for probe jobs
//!
//! Only used by the `probe` payload running on a compute node. GPUs of the
//! same model are grouped into one record, in the order the driver lists
//! them.

use crate::topology::info::{DeviceInfo, InfoMap};
use serde_json::Value;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Enumerate attached accelerators; a missing driver tool means no devices
pub async fn enumerate_devices() -> Vec<DeviceInfo> {
    let output = Command::new("nvidia-smi")
        .args(["--query-gpu=name,compute_cap", "--format=csv,noheader"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await;

    match output {
        Ok(output) if output.status.success() => {
            parse_nvidia_listing(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(output) => {
            debug!("nvidia-smi exited with {}", output.status);
            Vec::new()
        }
        Err(e) => {
            debug!("nvidia-smi not available: {}", e);
            Vec::new()
        }
    }
}

/// Group `name, compute_cap` CSV lines into device records
fn parse_nvidia_listing(listing: &str) -> Vec<DeviceInfo> {
    let mut groups: Vec<(String, String, u64)> = Vec::new();

    for line in listing.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let mut fields = line.splitn(2, ',').map(str::trim);
        let model = fields.next().unwrap_or_default().to_string();
        let arch = fields
            .next()
            .and_then(sm_arch)
            .unwrap_or_else(|| model.to_lowercase().replace(' ', "_"));

        match groups.iter_mut().find(|(m, a, _)| *m == model && *a == arch) {
            Some((_, _, count)) => *count += 1,
            None => groups.push((model, arch, 1)),
        }
    }

    groups
        .into_iter()
        .filter_map(|(model, arch, count)| {
            let mut info = InfoMap::new();
            info.insert("type".into(), Value::from("gpu"));
            info.insert("arch".into(), Value::from(arch));
            info.insert("model".into(), Value::from(model));
            info.insert("num_devices".into(), Value::from(count));
            DeviceInfo::new(info).ok()
        })
        .collect()
}

/// `8.0` -> `sm_80`
fn sm_arch(compute_cap: &str) -> Option<String> {
    let (major, minor) = compute_cap.split_once('.')?;
    let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    (digits(major) && digits(minor)).then(|| format!("sm_{major}{minor}"))
}
