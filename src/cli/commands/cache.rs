//! Cache command - inspect and collect build artifacts

use crate::cache::{format_bytes, BuildCache, CacheEntry};
use crate::cli::args::{CacheAction, CacheArgs, OutputFormat};
use crate::config::SiteConfig;
use crate::error::ByoeResult;
use crate::snapshot::SnapshotStore;
use console::style;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &SiteConfig) -> ByoeResult<()> {
    let cache = BuildCache::open(config.cache_root(), config.lease.stale_after_secs).await?;

    match args.action {
        CacheAction::List { format } => list_entries(&cache, format).await,
        CacheAction::Gc { dry_run } => gc_entries(&cache, config, dry_run).await,
    }
}

async fn list_entries(cache: &BuildCache, format: OutputFormat) -> ByoeResult<()> {
    let entries = cache.list().await?;

    if entries.is_empty() {
        match format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => println!("Build cache is empty."),
        }
        return Ok(());
    }

    match format {
        OutputFormat::Table => print_table(&entries),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
        OutputFormat::Plain => {
            for entry in &entries {
                println!("{} {}", entry.hash, entry.label());
            }
        }
    }

    Ok(())
}

fn print_table(entries: &[CacheEntry]) {
    println!(
        "{:<10} {:<10} {:<36} {:<10} {:<17}",
        "HASH", "ECO", "PACKAGE", "SIZE", "COMMITTED"
    );
    println!("{}", "-".repeat(86));

    let mut total = 0;
    for entry in entries {
        let size = entry.size_bytes();
        total += size;
        println!(
            "{:<10} {:<10} {:<36} {:<10} {:<17}",
            entry.hash.short(),
            entry.ecosystem,
            entry.label(),
            format_bytes(size),
            entry.committed_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!();
    println!("Total: {} artifact(s), {}", entries.len(), format_bytes(total));
}

async fn gc_entries(cache: &BuildCache, config: &SiteConfig, dry_run: bool) -> ByoeResult<()> {
    let store = SnapshotStore::new(&config.storage);
    let report = store.gc(cache, dry_run).await?;

    if report.removed.is_empty() {
        println!(
            "Nothing to collect: {} referenced, {} being built.",
            report.kept, report.leased
        );
        return Ok(());
    }

    println!("Unreferenced artifacts:");
    for entry in &report.removed {
        println!(
            "  {} {} ({})",
            style("•").red(),
            entry.label(),
            entry.hash.short()
        );
    }
    println!();

    if report.dry_run {
        println!(
            "Dry run - would free {} from {} artifact(s).",
            format_bytes(report.freed_bytes),
            report.removed.len()
        );
    } else {
        println!(
            "{} Removed {} artifact(s), freed {}",
            style("✓").green(),
            report.removed.len(),
            format_bytes(report.freed_bytes)
        );
    }
    if report.leased > 0 {
        println!("Skipped {} artifact(s) with a live lease.", report.leased);
    }

    Ok(())
}
