//! Snapshots command - list snapshots and the channel pointer

use crate::cli::args::{OutputFormat, SnapshotsArgs};
use crate::config::SiteConfig;
use crate::error::ByoeResult;
use crate::snapshot::{SnapId, Snapshot, SnapshotStatus, SnapshotStore};
use crate::ui::{self, UiContext};
use console::style;

pub async fn execute(args: SnapshotsArgs, config: &SiteConfig) -> ByoeResult<()> {
    let store = SnapshotStore::new(&config.storage);
    let snapshots = store.list().await?;
    let current = store.current(config.storage.channel).await?;

    if snapshots.is_empty() {
        match args.format {
            OutputFormat::Json => println!("[]"),
            OutputFormat::Plain => {}
            OutputFormat::Table => {
                let ctx = UiContext::detect();
                ui::step_info(&ctx, "No snapshots yet");
            }
        }
        return Ok(());
    }

    match args.format {
        OutputFormat::Table => print_table(&snapshots, current.as_ref(), config),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&snapshots)?),
        OutputFormat::Plain => {
            for snapshot in &snapshots {
                println!("{} {}", snapshot.id, snapshot.status);
            }
        }
    }

    Ok(())
}

fn print_table(snapshots: &[Snapshot], current: Option<&SnapId>, config: &SiteConfig) {
    let ctx = UiContext::detect();
    ui::intro(&ctx, "Snapshots");

    println!(
        "  {:<24} {:<11} {:<8} {:<9} {:<17}",
        style("ID").bold(),
        style("STATUS").bold(),
        style("ENVS").bold(),
        style("INSTALLS").bold(),
        style("CREATED").bold()
    );
    println!("  {}", "-".repeat(72));

    for snapshot in snapshots {
        let status = match snapshot.status {
            SnapshotStatus::Published => style(snapshot.status.as_str()).green(),
            SnapshotStatus::Validated | SnapshotStatus::Building => {
                style(snapshot.status.as_str()).yellow()
            }
            SnapshotStatus::Failed => style(snapshot.status.as_str()).red(),
        };
        let failed = snapshot.failed_envs().count();
        let envs = format!("{}/{}", snapshot.envs.len() - failed, snapshot.envs.len());
        let created = snapshot
            .created_at
            .with_timezone(&chrono::Local)
            .format("%Y-%m-%d %H:%M")
            .to_string();

        let mut marks = Vec::new();
        if current == Some(&snapshot.id) {
            marks.push(style(format!("<- {}", config.storage.channel)).cyan().to_string());
        }
        if snapshot.pruned {
            marks.push(style("pruned").dim().to_string());
        }

        println!(
            "  {:<24} {:<11} {:<8} {:<9} {:<17} {}",
            snapshot.id.to_string(),
            status,
            envs,
            snapshot.installs,
            created,
            marks.join(" ")
        );
    }

    println!();
    println!("  {} snapshot(s)", snapshots.len());
}
