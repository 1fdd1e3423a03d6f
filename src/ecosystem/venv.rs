//! Python app adapter: one private, relocatable venv per app, built with uv
//!
//! Like conda apps, each request becomes a single node whose options carry
//! every pinned distribution, so a pin change anywhere in the app rehashes
//! it. The app's commands are linked into `<prefix>/bin`.

use super::pip::UvAdapter;
use super::{
    build_error_output, normalize_name, request_name, run_capture, shell_quote, CommandLine,
    Ecosystem, EcosystemAdapter, InstallContext, ResolveRequest, ResolvedGraph, ResolvedPackage,
};
use crate::concretize::ConcreteNode;
use crate::config::schema::VenvEcosystemConfig;
use crate::error::{ByoeError, ByoeResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

const PIN_PREFIX: &str = "pin:";
const PYTHON_KEY: &str = "python";
const SYSTEM_SITE_KEY: &str = "system-site-packages";
const EXPORTED_KEY: &str = "exported";

/// uv-backed isolated Python app ecosystem
pub struct VenvAdapter {
    config: VenvEcosystemConfig,
}

impl VenvAdapter {
    pub fn new(config: VenvEcosystemConfig) -> Self {
        Self { config }
    }

    fn uv(&self) -> CommandLine {
        CommandLine::new(&self.config.command)
    }

    fn with_index(&self, cmd: CommandLine) -> CommandLine {
        match &self.config.index_url {
            Some(url) => cmd.args(["--index-url", url.as_str()]),
            None => cmd,
        }
    }

    /// Fold one compiled requirement set into a single app node
    fn app_package(
        app: &str,
        compiled: &str,
        python: Option<&str>,
        request: &ResolveRequest,
    ) -> ByoeResult<ResolvedPackage> {
        let graph = UvAdapter::parse_compiled(compiled, &[app.to_string()])?;
        let key = normalize_name(app);
        let version = graph
            .packages
            .iter()
            .find(|p| p.key == key)
            .map(|p| p.version.clone())
            .ok_or_else(|| ByoeError::Unsatisfiable {
                reason: format!("resolver did not select {app}"),
            })?;

        let mut options: BTreeMap<String, String> = graph
            .packages
            .iter()
            .map(|p| (format!("{PIN_PREFIX}{}", p.name), p.version.clone()))
            .collect();
        if let Some(python) = python {
            options.insert(PYTHON_KEY.to_string(), python.to_string());
        }
        if request.options.system_site_packages == Some(true) {
            options.insert(SYSTEM_SITE_KEY.to_string(), "true".to_string());
        }
        if !request.options.exported.is_empty() {
            options.insert(EXPORTED_KEY.to_string(), request.options.exported.join(","));
        }

        Ok(ResolvedPackage {
            key: app.to_string(),
            name: app.to_string(),
            version,
            deps: vec![],
            options,
            native_id: None,
        })
    }

    /// Link the app's commands into `<prefix>/bin`.
    ///
    /// Explicitly exported commands must exist; the default command named
    /// after the app is linked only when the app ships one.
    fn expose_script(node: &ConcreteNode, prefix: &Path) -> String {
        let bin = prefix.join("bin");
        let venv_bin = prefix.join("venv").join("bin");
        let (commands, required): (Vec<&str>, bool) = match node.options.get(EXPORTED_KEY) {
            Some(list) => (list.split(',').collect(), true),
            None => (vec![node.name.as_str()], false),
        };

        let mut script = format!("mkdir -p {}", shell_quote(&bin.display().to_string()));
        for command in commands {
            let check = format!(
                "[ -e {} ]",
                shell_quote(&venv_bin.join(command).display().to_string())
            );
            let link = format!(
                "ln -sf {} {}",
                shell_quote(&format!("../venv/bin/{command}")),
                shell_quote(&bin.join(command).display().to_string())
            );
            if required {
                script.push_str(&format!(" && {check} && {link}"));
            } else {
                script.push_str(&format!(" && if {check}; then {link}; fi"));
            }
        }
        script
    }
}

#[async_trait]
impl EcosystemAdapter for VenvAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Venv
    }

    fn adapter_name(&self) -> &'static str {
        "uv-venv"
    }

    async fn is_available(&self) -> bool {
        run_capture(&self.uv().arg("--version"))
            .await
            .map(|out| out.success)
            .unwrap_or(false)
    }

    async fn resolve(&self, request: &ResolveRequest) -> ByoeResult<ResolvedGraph> {
        info!(
            "Resolving {}/{} with uv ({} apps)",
            request.env,
            request.layer,
            request.packages.len()
        );
        let python = request
            .options
            .python
            .clone()
            .or_else(|| UvAdapter::toolchain_version(request));

        let mut graph = ResolvedGraph::default();
        for spec in &request.packages {
            let app = request_name(spec);
            let input = request.workdir.join(format!("{app}.in"));
            let output = request.workdir.join(format!("{app}.txt"));
            tokio::fs::write(&input, format!("{spec}\n"))
                .await
                .map_err(|e| ByoeError::io(format!("writing {}", input.display()), e))?;

            let mut cmd = self.with_index(self.uv().args(["pip", "compile"])).args([
                input.display().to_string(),
                "--output-file".to_string(),
                output.display().to_string(),
                "--no-header".to_string(),
                "--annotation-style".to_string(),
                "line".to_string(),
            ]);
            if let Some(version) = &python {
                cmd = cmd.args(["--python-version", version.as_str()]);
            }

            let out = run_capture(&cmd.current_dir(&request.workdir)).await?;
            if !out.success {
                let tail = build_error_output(&out.stdout, &out.stderr);
                if tail.contains("No solution found") || tail.contains("unsatisfiable") {
                    return Err(ByoeError::Unsatisfiable { reason: tail });
                }
                return Err(ByoeError::command_exec("uv pip compile", tail));
            }

            let compiled = tokio::fs::read_to_string(&output)
                .await
                .map_err(|e| ByoeError::io(format!("reading {}", output.display()), e))?;
            let package = Self::app_package(app, &compiled, python.as_deref(), request)?;
            debug!("{} pins {} distributions", app, package.options.len());
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
            .filter_map(|(k, v)| k.strip_prefix(PIN_PREFIX).map(|name| format!("{name}=={v}")))
            .collect();
        if pins.is_empty() {
            return Err(ByoeError::Internal(format!(
                "app {} has no pinned distributions",
                node.name
            )));
        }

        let venv = ctx.prefix.join("venv");
        let mut create = self
            .uv()
            .args(["venv", "--relocatable"])
            .arg(venv.display().to_string());
        if let Some(python) = node.options.get(PYTHON_KEY) {
            create = create.args(["--python", python.as_str()]);
        }
        if node.options.contains_key(SYSTEM_SITE_KEY) {
            create = create.arg("--system-site-packages");
        }

        let install = self
            .with_index(self.uv().args(["pip", "install", "--no-deps", "--python"]))
            .arg(venv.join("bin").join("python").display().to_string())
            .args(pins);

        Ok(vec![
            create,
            install,
            CommandLine::shell(Self::expose_script(node, &ctx.prefix)),
        ])
    }

    async fn query(&self, _node: &ConcreteNode, prefix: &Path) -> ByoeResult<bool> {
        let python = prefix.join("venv").join("bin").join("python");
        Ok(tokio::fs::symlink_metadata(&python).await.is_ok() && prefix.join("bin").is_dir())
    }
}
