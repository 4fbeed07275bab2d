//! Clear command - drop every entry of a profile

use crate::cache::{CacheFileStore, JsonSidecar};
use crate::cli::args::ClearArgs;
use crate::config::Config;
use crate::error::CacheResult;
use crate::ui::{self, UiContext};
use std::sync::Arc;

/// Execute the clear command
pub async fn execute(args: ClearArgs, config: &Config) -> CacheResult<()> {
    let ctx = UiContext::detect().with_auto_yes(args.yes);

    // Removal is by directory, so the sidecar channel does not matter here.
    let store = CacheFileStore::new(
        config.cache.location.clone(),
        &config.general.profile,
        Arc::new(JsonSidecar),
    )?;

    if !store.root().exists() {
        ui::step_ok(&ctx, "Cache is already empty");
        return Ok(());
    }

    println!(
        "This will remove all cached data under {}",
        store.root().display()
    );
    if !ui::confirm(&ctx, "Are you sure?") {
        println!("Aborted.");
        return Ok(());
    }

    store.clear().await?;
    ui::step_ok_detail(&ctx, "Cache cleared", &config.general.profile);

    Ok(())
}
