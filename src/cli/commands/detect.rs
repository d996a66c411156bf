//! Detect command - probe and cache partition topologies

use super::{print_rows, TopologyRow};
use crate::cli::args::DetectArgs;
use crate::config::Config;
use crate::error::TopoResult;
use crate::system::System;
use crate::topology::TopologyDetector;
use std::path::Path;

/// Execute the detect command
///
/// Partitions that were resolved are listed even when another one failed.
pub async fn execute(args: DetectArgs, config: &Config, topology_dir: Option<&Path>) -> TopoResult<()> {
    let mut system = System::from_config(&config.system, &config.topology)?;
    let detector = TopologyDetector::from_config(config, topology_dir, args.force)?;

    let outcome = detector.detect_topology(&mut system).await;

    let rows: Vec<TopologyRow> = system
        .partitions
        .iter()
        .map(|part| {
            let state = part
                .provenance()
                .map(|p| p.to_string())
                .unwrap_or_else(|| "unresolved".to_string());
            TopologyRow::new(&system.name, part.name(), state, part.processor(), part.devices())
        })
        .collect();
    print_rows(&rows, args.format)?;

    outcome
}
