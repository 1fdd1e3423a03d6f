//! Update command - build and publish a new snapshot

use crate::cli::args::UpdateArgs;
use crate::config::SiteConfig;
use crate::error::{ByoeError, ByoeResult};
use crate::snapshot::{
    EnvOutcome, EnvStatus, LayerStatus, SnapshotManager, UpdateOptions, UpdateReport,
};
use crate::ui::{self, TaskSpinner, UiContext};
use tokio::sync::watch;
use tracing::warn;

pub async fn execute(args: UpdateArgs, config: &SiteConfig) -> ByoeResult<()> {
    let ctx = UiContext::detect();
    let channel = config.storage.channel;

    let (abort_tx, abort_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling outstanding builds");
            let _ = abort_tx.send(true);
        }
    });

    ui::intro(&ctx, &format!("byoe update ({channel})"));

    let mut spinner = TaskSpinner::new(&ctx);
    spinner.start("Concretizing and building...");

    let manager = SnapshotManager::from_config(config.clone());
    let options = UpdateOptions {
        label: args.label,
        only: args.only,
    };
    let report = match manager.update(options, abort_rx).await {
        Ok(report) => report,
        Err(e) => {
            spinner.stop_error("Update failed");
            return Err(e);
        }
    };

    let id = report.snapshot.id.to_string();
    if report.published {
        spinner.stop(&format!("Snapshot {id} built"));
    } else {
        spinner.stop_error(&format!("Snapshot {id} did not validate"));
    }

    print_envs(&ctx, report.snapshot.envs.values());
    print_summary(&ctx, &report);

    let failed = report.snapshot.failed_envs().count();
    if report.success() {
        ui::outro_success(&ctx, &format!("Published {id} to {channel}"));
        Ok(())
    } else if report.published {
        ui::outro_warn(&ctx, &format!("Published {id} to {channel}"));
        Err(ByoeError::User(format!(
            "{failed} optional environment(s) failed in {id}"
        )))
    } else if report.snapshot.aborted {
        ui::outro_error(&ctx, "Aborted; channel unchanged");
        Err(ByoeError::User(format!("update of {id} was aborted")))
    } else {
        ui::outro_error(&ctx, "Channel unchanged");
        Err(ByoeError::User(format!(
            "{failed} environment(s) failed in {id}"
        )))
    }
}

fn print_envs<'a>(ctx: &UiContext, envs: impl Iterator<Item = &'a EnvOutcome>) {
    for env in envs {
        let tag = if env.required { "" } else { " (optional)" };
        ui::section(ctx, &format!("{}{} - {}", env.name, tag, env.status));

        for layer in &env.layers {
            let mut line = format!("{} {}", layer.name(), layer.status);
            if layer.node_count > 0 {
                line.push_str(&format!(", {} node(s)", layer.node_count));
            }
            if layer.unchanged {
                line.push_str(", unchanged");
            }

            match layer.status {
                LayerStatus::Succeeded => ui::step_ok(ctx, &line),
                LayerStatus::Partial | LayerStatus::Skipped | LayerStatus::Pending => {
                    ui::step_warn(ctx, &line)
                }
                LayerStatus::Failed => ui::step_error(ctx, &line),
            }

            if let Some(error) = &layer.error {
                ui::remark(ctx, error);
            }
            for node in &layer.failed_nodes {
                ui::step_error_detail(
                    ctx,
                    &format!("{}@{} ({})", node.name, node.version, node.hash.short()),
                    &node.reason,
                );
                if let Some(log) = &node.log {
                    ui::remark(ctx, &format!("log: {}", log.display()));
                }
                if let Some(job) = &node.job_id {
                    ui::remark(ctx, &format!("job: {job}"));
                }
            }
        }

        if env.status == EnvStatus::Failed && !env.required {
            ui::remark(ctx, "optional environment, snapshot not blocked");
        }
    }
}

fn print_summary(ctx: &UiContext, report: &UpdateReport) {
    ui::section(ctx, "Summary");
    ui::key_value(ctx, "Installs", &report.snapshot.installs.to_string());
    if report.recovered > 0 {
        ui::key_value(ctx, "Recovered jobs", &report.recovered.to_string());
    }
    ui::key_value_status(
        ctx,
        "Status",
        report.snapshot.status.as_str(),
        report.published,
    );
    if let Some(previous) = &report.previous {
        ui::key_value(ctx, "Previous", &previous.to_string());
    }
    if !report.pruned.is_empty() {
        let pruned: Vec<_> = report.pruned.iter().map(|id| id.to_string()).collect();
        ui::key_value(ctx, "Pruned", &pruned.join(", "));
    }
}
