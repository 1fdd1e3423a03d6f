//! Isolated-app adapter backed by micromamba
//!
//! Each requested app becomes one node with its own prefix. The full
//! solved package set is folded into the node's options, so the node
//! hash changes whenever any pinned package in the app changes.

use super::{
    build_error_output, request_name, run_capture, CommandLine, Ecosystem, EcosystemAdapter,
    InstallContext, ResolveRequest, ResolvedGraph, ResolvedPackage,
};
use crate::concretize::ConcreteNode;
use crate::config::schema::AppEcosystemConfig;
use crate::error::{ByoeError, ByoeResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use tracing::{debug, info};

const PIN_PREFIX: &str = "pin:";

/// micromamba-backed isolated app ecosystem
pub struct MicromambaAdapter {
    config: AppEcosystemConfig,
}

#[derive(Debug, Deserialize)]
struct DryRun {
    #[serde(default)]
    actions: Actions,
}

#[derive(Debug, Default, Deserialize)]
struct Actions {
    #[serde(rename = "LINK", default)]
    link: Vec<LinkAction>,
}

#[derive(Debug, Deserialize)]
struct LinkAction {
    name: String,
    version: String,
    #[serde(default)]
    build_string: String,
}

impl MicromambaAdapter {
    pub fn new(config: AppEcosystemConfig) -> Self {
        Self { config }
    }

    fn with_channels(&self, mut cmd: CommandLine) -> CommandLine {
        cmd = cmd.arg("--override-channels");
        for channel in &self.config.channels {
            cmd = cmd.args(["-c", channel.as_str()]);
        }
        cmd
    }

    /// Turn one dry-run solve into a single app node
    fn app_package(app: &str, output: &str) -> ByoeResult<ResolvedPackage> {
        let solved: DryRun = serde_json::from_str(output)?;
        let version = solved
            .actions
            .link
            .iter()
            .find(|l| l.name == app)
            .map(|l| l.version.clone())
            .ok_or_else(|| ByoeError::Unsatisfiable {
                reason: format!("solver did not select {app}"),
            })?;

        let options = solved
            .actions
            .link
            .iter()
            .map(|l| {
                (
                    format!("{PIN_PREFIX}{}", l.name),
                    format!("{}={}", l.version, l.build_string),
                )
            })
            .collect();

        Ok(ResolvedPackage {
            key: app.to_string(),
            name: app.to_string(),
            version,
            deps: vec![],
            options,
            native_id: None,
        })
    }
}

#[async_trait]
impl EcosystemAdapter for MicromambaAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Conda
    }

    fn adapter_name(&self) -> &'static str {
        "micromamba"
    }

    async fn is_available(&self) -> bool {
        run_capture(&CommandLine::new(&self.config.command).arg("--version"))
            .await
            .map(|out| out.success)
            .unwrap_or(false)
    }

    async fn resolve(&self, request: &ResolveRequest) -> ByoeResult<ResolvedGraph> {
        info!(
            "Solving {}/{} with micromamba ({} apps)",
            request.env,
            request.layer,
            request.packages.len()
        );

        let mut graph = ResolvedGraph::default();
        for spec in &request.packages {
            let app = request_name(spec);
            let prefix = request.workdir.join("dry-run").join(app);
            let cmd = self
                .with_channels(CommandLine::new(&self.config.command).args([
                    "create",
                    "--dry-run",
                    "--json",
                    "--yes",
                    "-p",
                ]))
                .arg(prefix.display().to_string())
                .arg(spec.as_str())
                .current_dir(&request.workdir);

            let out = run_capture(&cmd).await?;
            if !out.success {
                let tail = build_error_output(&out.stdout, &out.stderr);
                if tail.contains("could not solve")
                    || tail.contains("nothing provides")
                    || tail.contains("solver_problems")
                {
                    return Err(ByoeError::Unsatisfiable { reason: tail });
                }
                return Err(ByoeError::command_exec("micromamba create --dry-run", tail));
            }

            let package = Self::app_package(app, &out.stdout)?;
            debug!("{} pins {} packages", app, package.options.len());
            graph.roots.push(package.key.clone());
            graph.packages.push(package);
        }
        Ok(graph)
    }

    fn install_commands(
        &self,
        node: &ConcreteNode,
        ctx: &InstallContext,
    ) -> ByoeResult<Vec<CommandLine>> {
        let pins: Vec<String> = node
            .options
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(PIN_PREFIX).map(|name| format!("{name}={v}")))
            .collect();
        if pins.is_empty() {
            return Err(ByoeError::Internal(format!(
                "app {} has no pinned packages",
                node.name
            )));
        }

        let cmd = self
            .with_channels(CommandLine::new(&self.config.command).args(["create", "--yes", "-p"]))
            .arg(ctx.prefix.join("env").display().to_string())
            .args(pins);
        Ok(vec![cmd])
    }

    async fn query(&self, _node: &ConcreteNode, prefix: &Path) -> ByoeResult<bool> {
        Ok(prefix.join("env").join("conda-meta").is_dir())
    }
}
