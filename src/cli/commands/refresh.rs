//! Refresh command - one eviction and cleanup cycle

use crate::cache::{format_bytes, EvictionManager, RefreshReport};
use crate::cli::args::{OutputFormat, RefreshArgs};
use crate::config::Config;
use crate::error::CacheResult;
use crate::ui::{self, UiContext};

/// Execute the refresh command
pub async fn execute(args: RefreshArgs, config: &Config) -> CacheResult<()> {
    let eviction = EvictionManager::new(&config.cache);
    let ctx = UiContext::detect();

    let Some(report) = eviction.refresh_cache().await? else {
        ui::step_warn_hint(
            &ctx,
            "Another refresh is already running",
            "Try again once it finishes",
        );
        return Ok(());
    };

    match args.format {
        OutputFormat::Table => print_report(&ctx, eviction.policy_name(), &report),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Plain => {
            println!("{}", report.evicted);
            println!("{}", report.remaining_bytes);
        }
    }

    Ok(())
}

fn print_report(ctx: &UiContext, policy: &str, report: &RefreshReport) {
    if report.evicted == 0 {
        ui::step_ok_detail(
            ctx,
            "Cache within limit",
            &format!("{} entries, {}", report.scanned, format_bytes(report.total_bytes)),
        );
    } else {
        ui::step_ok_detail(
            ctx,
            &format!("Evicted {} entries", report.evicted),
            &format!("{} freed, {} policy", format_bytes(report.evicted_bytes), policy),
        );
    }

    if report.orphans_removed > 0 {
        ui::step_ok(
            ctx,
            &format!("Removed {} leftover lock/temp files", report.orphans_removed),
        );
    }

    ui::key_value(ctx, "Remaining", &format_bytes(report.remaining_bytes));
}
