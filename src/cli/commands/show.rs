//! Show command - list cached topologies without probing

use super::{print_rows, TopologyRow};
use crate::cli::args::ShowArgs;
use crate::config::{Config, ConfigManager};
use crate::error::TopoResult;
use crate::system::System;
use crate::topology::{CacheKey, CacheStore, Lookup, Provenance};
use std::path::Path;

/// Execute the show command
pub async fn execute(args: ShowArgs, config: &Config, topology_dir: Option<&Path>) -> TopoResult<()> {
    let store = CacheStore::new(ConfigManager::topology_root(config, topology_dir)?);
    let system = System::from_config(&config.system, &config.topology)?;

    let mut rows = Vec::with_capacity(system.partitions.len());
    for part in &system.partitions {
        if part.is_fully_configured() {
            rows.push(TopologyRow::new(
                &system.name,
                part.name(),
                Provenance::Configured.to_string(),
                part.processor(),
                part.devices(),
            ));
            continue;
        }

        let key = CacheKey::new(&system.name, part.name());
        let row = match store.read_entry(&key).await {
            Lookup::Hit(entry) => TopologyRow::new(
                &system.name,
                part.name(),
                Provenance::Cache.to_string(),
                Some(&entry.processor),
                &entry.devices,
            ),
            Lookup::Absent => TopologyRow::new(&system.name, part.name(), "not cached", None, &[]),
            Lookup::Invalid(_) => TopologyRow::new(&system.name, part.name(), "invalid", None, &[]),
        };
        rows.push(row);
    }

    print_rows(&rows, args.format)
}
