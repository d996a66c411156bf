//! Cache command - inspect and clear the topology cache

use crate::cli::args::{CacheAction, CacheArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{TopoError, TopoResult};
use crate::topology::{CacheKey, CacheStore};
use crate::ui::{self, UiContext};
use std::path::Path;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config, topology_dir: Option<&Path>) -> TopoResult<()> {
    let store = CacheStore::new(ConfigManager::topology_root(config, topology_dir)?);

    match args.action {
        CacheAction::Path => {
            println!("{}", store.root().display());
            Ok(())
        }
        CacheAction::Clear { partition } => clear(&store, config, partition.as_deref()).await,
    }
}

async fn clear(store: &CacheStore, config: &Config, partition: Option<&str>) -> TopoResult<()> {
    let ctx = UiContext::detect();

    let Some(partition) = partition else {
        let removed = store.clear_all().await?;
        if removed == 0 {
            ui::step_info(&ctx, "Topology cache is empty");
        } else {
            ui::step_ok_detail(
                &ctx,
                &format!("Removed {} cached topolog{}", removed, if removed == 1 { "y" } else { "ies" }),
                &store.root().display().to_string(),
            );
        }
        return Ok(());
    };

    if !config.system.partitions.iter().any(|p| p.name == partition) {
        return Err(TopoError::PartitionNotFound(partition.to_string()));
    }

    let key = CacheKey::new(&config.system.name, partition);
    if store.clear(&key).await? {
        ui::step_ok(&ctx, &format!("Cleared cached topology of {}", key));
    } else {
        ui::step_info(&ctx, &format!("No cached topology for {}", key));
    }
    Ok(())
}
