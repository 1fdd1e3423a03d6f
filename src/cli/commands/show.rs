//! Show command - print a snapshot's lock records

use crate::cli::args::{OutputFormat, ShowArgs};
use crate::config::SiteConfig;
use crate::error::ByoeResult;
use crate::snapshot::{SnapId, SnapshotStore};
use crate::ui::{self, UiContext};
use console::style;

/// Reads go through the channel pointer unless an id or a channel is given
pub async fn execute(args: ShowArgs, config: &SiteConfig) -> ByoeResult<()> {
    let store = SnapshotStore::new(&config.storage);
    let id = args.snap_id.as_deref().map(str::parse::<SnapId>).transpose()?;
    let snapshot = match args.channel {
        Some(channel) => {
            store
                .resolve_for_period(channel, chrono::Local::now().naive_local())
                .await?
        }
        None => store.resolve(id.as_ref(), config.storage.channel).await?,
    };
    let records = snapshot.lock_records().await?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Plain => {
            for record in &records {
                for node in &record.nodes {
                    println!(
                        "{} {} {} {}",
                        record.layer_id(),
                        node.name,
                        node.version,
                        node.hash
                    );
                }
            }
        }
        OutputFormat::Table => {
            let ctx = UiContext::detect();
            ui::intro(&ctx, &format!("Snapshot {}", snapshot.id));
            ui::key_value(&ctx, "Channel", snapshot.channel.as_str());
            ui::key_value(&ctx, "Status", snapshot.status.as_str());
            if snapshot.pruned {
                ui::key_value(&ctx, "Views", "pruned");
            }

            for record in &records {
                ui::section(
                    &ctx,
                    &format!(
                        "{} ({}, {} node(s))",
                        record.layer_id(),
                        record.record.ecosystem,
                        record.nodes.len()
                    ),
                );
                for node in &record.nodes {
                    let root = record.record.roots.contains(&node.hash);
                    let name = if root {
                        style(node.name.as_str()).bold()
                    } else {
                        style(node.name.as_str())
                    };
                    println!(
                        "  {:<28} {:<16} {}",
                        name,
                        node.version,
                        style(node.hash.short()).dim()
                    );
                }
            }
        }
    }

    Ok(())
}
