//! Package-index adapter backed by `uv pip`

use super::{
    build_error_output, request_name, run_capture, CommandLine, Ecosystem, EcosystemAdapter,
    InstallContext, ResolveRequest, ResolvedGraph, ResolvedPackage,
};
use crate::concretize::ConcreteNode;
use crate::config::schema::IndexEcosystemConfig;
use crate::error::{ByoeError, ByoeResult};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

pub const DEFAULT_TOOLCHAIN: &str = "python";

/// PEP 503 name normalization
pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_lowercase()
        .replace(['_', '.'], "-")
}

/// uv-backed package-index ecosystem
pub struct UvAdapter {
    config: IndexEcosystemConfig,
}

impl UvAdapter {
    pub fn new(config: IndexEcosystemConfig) -> Self {
        Self { config }
    }

    fn uv(&self) -> CommandLine {
        CommandLine::new(&self.config.command).arg("pip")
    }

    fn with_index(&self, cmd: CommandLine) -> CommandLine {
        match &self.config.index_url {
            Some(url) => cmd.args(["--index-url", url.as_str()]),
            None => cmd,
        }
    }

    /// Python interpreter version provided by the layer below, if any
    pub(super) fn toolchain_version(request: &ResolveRequest) -> Option<String> {
        let name = request
            .options
            .toolchain
            .as_deref()
            .unwrap_or(DEFAULT_TOOLCHAIN);
        request
            .upstream
            .iter()
            .find(|n| n.name == name)
            .map(|n| n.version.clone())
    }

    /// Upstream `py-*` packages become constraints so pip does not shadow them
    fn constraints(request: &ResolveRequest) -> String {
        request
            .upstream
            .iter()
            .filter_map(|n| {
                n.name
                    .strip_prefix("py-")
                    .map(|name| format!("{}=={}\n", name, n.version))
            })
            .collect()
    }

    /// Parse `uv pip compile --annotation-style line` output
    pub(super) fn parse_compiled(output: &str, requests: &[String]) -> ByoeResult<ResolvedGraph> {
        let mut pins: BTreeMap<String, (String, String)> = BTreeMap::new();
        let mut dependents: Vec<(String, String)> = Vec::new();

        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
                continue;
            }
            let (requirement, comment) = match line.split_once('#') {
                Some((r, c)) => (r.trim(), c.trim()),
                None => (line, ""),
            };
            let requirement = requirement
                .split(';')
                .next()
                .unwrap_or(requirement)
                .trim();
            let Some((name, version)) = requirement.split_once("==") else {
                return Err(ByoeError::command_exec(
                    "uv pip compile",
                    format!("unpinned requirement in output: {line}"),
                ));
            };
            let key = normalize_name(request_name(name));
            pins.insert(key.clone(), (request_name(name).to_string(), version.trim().to_string()));

            if let Some(via) = comment.strip_prefix("via") {
                for parent in via.split(',').map(str::trim) {
                    if parent.is_empty() || parent.starts_with('-') {
                        continue;
                    }
                    dependents.push((normalize_name(parent), key.clone()));
                }
            }
        }

        let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (parent, child) in dependents {
            if pins.contains_key(&parent) {
                deps.entry(parent).or_default().insert(child);
            }
        }

        let packages = pins
            .into_iter()
            .map(|(key, (name, version))| ResolvedPackage {
                deps: deps
                    .remove(&key)
                    .map(|d| d.into_iter().collect())
                    .unwrap_or_default(),
                key,
                name,
                version,
                options: BTreeMap::new(),
                native_id: None,
            })
            .collect();

        Ok(ResolvedGraph {
            packages,
            roots: requests
                .iter()
                .map(|r| normalize_name(request_name(r)))
                .collect(),
        })
    }
}

#[async_trait]
impl EcosystemAdapter for UvAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Pip
    }

    fn adapter_name(&self) -> &'static str {
        "uv"
    }

    async fn is_available(&self) -> bool {
        run_capture(&CommandLine::new(&self.config.command).arg("--version"))
            .await
            .map(|out| out.success)
            .unwrap_or(false)
    }

    async fn resolve(&self, request: &ResolveRequest) -> ByoeResult<ResolvedGraph> {
        let input = request.workdir.join("requirements.in");
        let constraints = request.workdir.join("constraints.txt");
        let output = request.workdir.join("requirements.txt");

        let mut content = request.packages.join("\n");
        content.push('\n');
        tokio::fs::write(&input, content)
            .await
            .map_err(|e| ByoeError::io(format!("writing {}", input.display()), e))?;
        tokio::fs::write(&constraints, Self::constraints(request))
            .await
            .map_err(|e| ByoeError::io(format!("writing {}", constraints.display()), e))?;

        let mut cmd = self.with_index(self.uv().arg("compile")).args([
            input.display().to_string(),
            "--constraint".to_string(),
            constraints.display().to_string(),
            "--output-file".to_string(),
            output.display().to_string(),
            "--no-header".to_string(),
            "--annotation-style".to_string(),
            "line".to_string(),
        ]);
        let python = Self::toolchain_version(request);
        if let Some(version) = &python {
            cmd = cmd.args(["--python-version", version.as_str()]);
        }

        info!(
            "Resolving {}/{} with uv ({} requirements)",
            request.env,
            request.layer,
            request.packages.len()
        );
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
        let mut graph = Self::parse_compiled(&compiled, &request.packages)?;
        if let Some(version) = python {
            for pkg in &mut graph.packages {
                pkg.options.insert("python".to_string(), version.clone());
            }
        }
        debug!("uv resolved {} packages", graph.packages.len());
        Ok(graph)
    }

    fn install_commands(
        &self,
        node: &ConcreteNode,
        ctx: &InstallContext,
    ) -> ByoeResult<Vec<CommandLine>> {
        let mut cmd = self.with_index(self.uv().arg("install")).args([
            "--no-deps".to_string(),
            "--target".to_string(),
            ctx.prefix.join("site-packages").display().to_string(),
        ]);
        if let Some(python) = node.options.get("python") {
            cmd = cmd.args(["--python-version", python.as_str()]);
        }
        Ok(vec![cmd.arg(format!("{}=={}", node.name, node.version))])
    }

    async fn query(&self, node: &ConcreteNode, prefix: &Path) -> ByoeResult<bool> {
        let site = prefix.join("site-packages");
        let Ok(entries) = std::fs::read_dir(&site) else {
            return Ok(false);
        };
        let wanted = format!(
            "{}-{}.dist-info",
            normalize_name(&node.name).replace('-', "_"),
            node.version
        );
        Ok(entries
            .filter_map(|e| e.ok())
            .any(|e| normalize_name(&e.file_name().to_string_lossy()) == normalize_name(&wanted)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const COMPILED: &str = "\
numpy==1.26.4             # via -r requirements.in, pandas, scipy
pandas==2.2.1             # via -r requirements.in
python-dateutil==2.9.0    # via pandas
scipy==1.12.0             # via -r requirements.in
six==1.16.0               # via python-dateutil
";

    #[test]
    fn normalizes_names() {
        assert_eq!(normalize_name("Python_Dateutil"), "python-dateutil");
        assert_eq!(normalize_name("zope.interface"), "zope-interface");
    }

    #[test]
    fn parses_compiled_requirements() {
        let requests = vec!["pandas>=2".to_string(), "SciPy".to_string()];
        let graph = UvAdapter::parse_compiled(COMPILED, &requests).unwrap();

        assert_eq!(graph.roots, vec!["pandas", "scipy"]);
        assert_eq!(graph.packages.len(), 5);

        let pandas = graph.packages.iter().find(|p| p.key == "pandas").unwrap();
        assert_eq!(pandas.version, "2.2.1");
        assert_eq!(pandas.deps, vec!["numpy", "python-dateutil"]);

        let six = graph.packages.iter().find(|p| p.key == "six").unwrap();
        assert!(six.deps.is_empty());
    }

    #[test]
    fn rejects_unpinned_output() {
        assert!(UvAdapter::parse_compiled("numpy>=1\n", &[]).is_err());
    }

    #[test]
    fn constraints_from_base_python_packages() {
        let upstream = vec![
            ConcreteNode::new(Ecosystem::Spack, "python", "3.11.7", BTreeMap::new(), None, vec![]),
            ConcreteNode::new(Ecosystem::Spack, "py-numpy", "1.26.4", BTreeMap::new(), None, vec![]),
        ];
        let request = ResolveRequest {
            env: "science".to_string(),
            layer: "1-index".to_string(),
            packages: vec!["pandas".to_string()],
            options: Default::default(),
            workdir: PathBuf::from("/tmp"),
            upstream,
        };
        assert_eq!(UvAdapter::constraints(&request), "numpy==1.26.4\n");
        assert_eq!(UvAdapter::toolchain_version(&request).as_deref(), Some("3.11.7"));
    }

    #[tokio::test]
    async fn query_finds_dist_info() {
        let temp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(
            temp.path()
                .join("site-packages")
                .join("python_dateutil-2.9.0.dist-info"),
        )
        .unwrap();
        let node = ConcreteNode::new(
            Ecosystem::Pip,
            "python-dateutil",
            "2.9.0",
            BTreeMap::new(),
            None,
            vec![],
        );
        let adapter = UvAdapter::new(IndexEcosystemConfig::default());
        assert!(adapter.query(&node, temp.path()).await.unwrap());
    }
}
