//! Init-dir command - create the storage layout and a starter config

use crate::cli::args::InitDirArgs;
use crate::config::{ConfigManager, SiteConfig};
use crate::error::{ByoeError, ByoeResult};
use crate::snapshot::SnapshotStore;
use crate::ui::{self, UiContext};
use std::path::Path;
use tokio::fs;

/// Starter site configuration; `{base_dir}` is filled in
const CONFIG_TEMPLATE: &str = r#"# byoe site configuration
# Environments live in conf.d/envs/<name>.toml next to this file,
# isolated apps in conf.d/apps/<name>.toml.

[storage]
base_dir = "{base_dir}"
channel = "fresh"                  # bloody, fresh, stable, stale, old

[build]
# max_tasks = 4                    # concurrent local installs
# poll_interval_ms = 30000
# scratch_dir = "/tmp/byoe"

# [build.batch]
# enabled = true                   # submit installs with sbatch
# [build.batch.phases.install]
# tasks_per_job = 16
# max_jobs = 4
# args = "--time=04:00:00"

[retention]
keep = 3

[ecosystems.base]
# compiler = "gcc@12"
# target = "x86_64_v3"

[ecosystems.app]
channels = ["conda-forge"]

# [ecosystems.venv]
# index_url = "https://pypi.org/simple"

# [ecosystems.apptainer]
# command = "apptainer"
"#;

/// Example environment written on first init
const ENV_TEMPLATE: &str = r#"# One environment per file; the file name is the environment name.
required = true

[[layers]]
kind = "base"
packages = ["zlib"]

[[layers]]
kind = "index"
packages = ["numpy"]
"#;

pub async fn execute(args: InitDirArgs, config_path: Option<&Path>) -> ByoeResult<()> {
    let ctx = UiContext::detect();
    let manager = match config_path {
        Some(path) => ConfigManager::with_path(path.to_path_buf()),
        None => ConfigManager::new(),
    };

    if manager.path().exists() && !args.force {
        return Err(ByoeError::User(format!(
            "{} already exists. Use --force to overwrite.",
            manager.path().display()
        )));
    }

    let base_dir = match args.base_dir {
        Some(dir) => dir,
        None => SiteConfig::default().storage.base_dir,
    };
    let base_dir = if base_dir.is_absolute() {
        base_dir
    } else {
        std::env::current_dir()
            .map_err(|e| ByoeError::io("getting current directory", e))?
            .join(base_dir)
    };

    let content = CONFIG_TEMPLATE.replace("{base_dir}", &base_dir.display().to_string());
    let config: SiteConfig = toml::from_str(&content)?;

    if let Some(parent) = manager.path().parent() {
        ensure_dir(parent).await?;
    }
    fs::write(manager.path(), &content)
        .await
        .map_err(|e| ByoeError::io(format!("writing {}", manager.path().display()), e))?;
    ui::step_ok_detail(&ctx, "Wrote site config", &manager.path().display().to_string());

    let envs = manager.envs_dir();
    ensure_dir(&envs).await?;
    let example = envs.join("example.toml");
    if !example.exists() {
        fs::write(&example, ENV_TEMPLATE)
            .await
            .map_err(|e| ByoeError::io(format!("writing {}", example.display()), e))?;
        ui::step_ok_detail(&ctx, "Wrote example environment", &example.display().to_string());
    }

    ensure_dir(&manager.apps_dir()).await?;

    ConfigManager::ensure_storage_dirs(&config).await?;
    SnapshotStore::new(&config.storage).init().await?;
    ui::step_ok_detail(&ctx, "Created storage layout", &base_dir.display().to_string());

    Ok(())
}

async fn ensure_dir(dir: &Path) -> ByoeResult<()> {
    if !dir.exists() {
        fs::create_dir_all(dir)
            .await
            .map_err(|e| ByoeError::io(format!("creating directory {}", dir.display()), e))?;
    }
    Ok(())
}
