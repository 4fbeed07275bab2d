//! Stats command - report cache footprint

use crate::cache::{format_bytes, CacheSizeStatus, CacheUsage, EvictionManager};
use crate::cli::args::{OutputFormat, StatsArgs};
use crate::config::Config;
use crate::error::CacheResult;
use crate::ui::{self, UiContext};
use serde::Serialize;
use std::path::Path;

/// Execute the stats command
pub async fn execute(args: StatsArgs, config: &Config) -> CacheResult<()> {
    let eviction = EvictionManager::new(&config.cache);
    let usage = eviction.usage().await?;

    match args.format {
        OutputFormat::Table => print_table(config, eviction.policy_name(), &usage),
        OutputFormat::Json => print_json(config, eviction.policy_name(), &usage)?,
        OutputFormat::Plain => print_plain(&usage),
    }

    Ok(())
}

fn print_table(config: &Config, policy: &str, usage: &CacheUsage) {
    let ctx = UiContext::detect();

    ui::section(&ctx, "Cache");
    ui::key_value(&ctx, "Location", &config.cache.location.display().to_string());
    ui::key_value(&ctx, "Profile", &config.general.profile);
    ui::key_value(&ctx, "Cache line", &config.cache.cache_line_size.to_string());
    ui::key_value(&ctx, "Policy", policy);
    ui::key_value(&ctx, "Entries", &usage.entries.to_string());

    let summary = format!(
        "{} / {} ({:.1}%)",
        format_bytes(usage.total_bytes),
        format_bytes(usage.limit_bytes),
        usage.percentage()
    );
    ui::key_value_status(
        &ctx,
        "Usage",
        &summary,
        usage.status() == CacheSizeStatus::Ok,
    );

    if usage.status() == CacheSizeStatus::Exceeded {
        ui::remark(&ctx, "Run `chunkcache refresh` to evict down to the limit");
    }
}

#[derive(Serialize)]
struct StatsJson<'a> {
    location: &'a Path,
    profile: &'a str,
    cache_line_size: u64,
    policy: &'a str,
    entries: usize,
    total_bytes: u64,
    limit_bytes: u64,
    percentage: f64,
    status: CacheSizeStatus,
}

fn print_json(config: &Config, policy: &str, usage: &CacheUsage) -> CacheResult<()> {
    let output = StatsJson {
        location: &config.cache.location,
        profile: &config.general.profile,
        cache_line_size: config.cache.cache_line_bytes(),
        policy,
        entries: usage.entries,
        total_bytes: usage.total_bytes,
        limit_bytes: usage.limit_bytes,
        percentage: usage.percentage(),
        status: usage.status(),
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_plain(usage: &CacheUsage) {
    println!("{}", usage.entries);
    println!("{}", usage.total_bytes);
    println!("{}", usage.limit_bytes);
}
