//! Base ecosystem adapter backed by Spack environments

use super::{
    build_error_output, run_capture, CommandLine, Ecosystem, EcosystemAdapter, InstallContext,
    ResolveRequest, ResolvedGraph, ResolvedPackage,
};
use crate::concretize::ConcreteNode;
use crate::config::schema::BaseEcosystemConfig;
use crate::error::{ByoeError, ByoeResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Phrases Spack uses when the solver rejects a spec set
const UNSAT_MARKERS: &[&str] = &[
    "unsatisfiable",
    "no version for",
    "conflicts with",
    "cannot satisfy",
    "does not satisfy",
    "no valid value for variant",
];

/// Spack-backed base ecosystem
pub struct SpackAdapter {
    config: BaseEcosystemConfig,
}

impl SpackAdapter {
    pub fn new(config: BaseEcosystemConfig) -> Self {
        Self { config }
    }

    fn spack(&self, workdir: &Path) -> CommandLine {
        CommandLine::new(&self.config.command)
            .arg("-e")
            .arg(workdir.display().to_string())
    }

    /// Environment manifest for one layer. JSON is valid YAML.
    fn manifest(request: &ResolveRequest) -> serde_json::Value {
        let options = &request.options;
        let mut packages = serde_json::Map::new();

        let mut require = Vec::new();
        if let Some(compiler) = &options.compiler {
            require.push(format!("%{compiler}"));
        }
        if let Some(target) = &options.target {
            require.push(format!("target={target}"));
        }
        let mut all = serde_json::Map::new();
        if !require.is_empty() {
            all.insert("require".into(), serde_json::json!(require.join(" ")));
        }
        if !options.providers.is_empty() {
            all.insert("providers".into(), serde_json::json!(options.providers));
        }
        if !all.is_empty() {
            packages.insert("all".into(), serde_json::Value::Object(all));
        }

        for (pkg, variants) in &options.variants {
            packages.insert(pkg.clone(), serde_json::json!({ "variants": variants }));
        }
        for (pkg, prefix) in &options.externals {
            let entry = packages
                .entry(pkg.clone())
                .or_insert_with(|| serde_json::json!({}));
            if let Some(obj) = entry.as_object_mut() {
                obj.insert(
                    "externals".into(),
                    serde_json::json!([{ "spec": pkg, "prefix": prefix }]),
                );
                obj.insert("buildable".into(), serde_json::json!(false));
            }
        }

        serde_json::json!({
            "spack": {
                "specs": request.packages,
                "view": false,
                "concretizer": { "unify": true, "reuse": false },
                "packages": packages,
            }
        })
    }

    fn parse_lock(content: &str, path: &Path) -> ByoeResult<ResolvedGraph> {
        let lock: SpackLock =
            serde_json::from_str(content).map_err(|e| ByoeError::LockRecordParse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let packages = lock
            .concrete_specs
            .into_iter()
            .map(|(hash, spec)| {
                let mut options = BTreeMap::new();
                if let Some(target) = spec.arch.as_ref().and_then(arch_target) {
                    options.insert("target".to_string(), target);
                }
                if let Some(compiler) = spec.compiler.as_ref().and_then(compiler_spec) {
                    options.insert("compiler".to_string(), compiler);
                }
                ResolvedPackage {
                    key: hash.clone(),
                    name: spec.name,
                    version: spec.version,
                    deps: spec.dependencies.into_iter().map(|d| d.hash).collect(),
                    options,
                    native_id: Some(hash),
                }
            })
            .collect();

        Ok(ResolvedGraph {
            packages,
            roots: lock.roots.into_iter().map(|r| r.hash).collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SpackLock {
    roots: Vec<LockRoot>,
    concrete_specs: BTreeMap<String, LockSpec>,
}

#[derive(Debug, Deserialize)]
struct LockRoot {
    hash: String,
}

#[derive(Debug, Deserialize)]
struct LockSpec {
    name: String,
    version: String,
    #[serde(default)]
    arch: Option<serde_json::Value>,
    #[serde(default)]
    compiler: Option<serde_json::Value>,
    #[serde(default)]
    dependencies: Vec<LockDep>,
}

#[derive(Debug, Deserialize)]
struct LockDep {
    hash: String,
}

/// `arch.target` is a plain string for generic targets and an object otherwise
fn arch_target(arch: &serde_json::Value) -> Option<String> {
    match arch.get("target")? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => other.get("name")?.as_str().map(str::to_string),
    }
}

fn compiler_spec(compiler: &serde_json::Value) -> Option<String> {
    let name = compiler.get("name")?.as_str()?;
    let version = compiler.get("version").and_then(|v| v.as_str());
    Some(match version {
        Some(v) => format!("{name}@{v}"),
        None => name.to_string(),
    })
}

fn is_unsatisfiable(output: &str) -> bool {
    let lower = output.to_lowercase();
    UNSAT_MARKERS.iter().any(|m| lower.contains(m))
}

#[async_trait]
impl EcosystemAdapter for SpackAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Spack
    }

    fn adapter_name(&self) -> &'static str {
        "spack"
    }

    async fn is_available(&self) -> bool {
        run_capture(&CommandLine::new(&self.config.command).arg("--version"))
            .await
            .map(|out| out.success)
            .unwrap_or(false)
    }

    async fn resolve(&self, request: &ResolveRequest) -> ByoeResult<ResolvedGraph> {
        let manifest_path = request.workdir.join("spack.yaml");
        let manifest = serde_json::to_string_pretty(&Self::manifest(request))?;
        tokio::fs::write(&manifest_path, manifest)
            .await
            .map_err(|e| ByoeError::io(format!("writing {}", manifest_path.display()), e))?;

        info!(
            "Concretizing {}/{} with spack ({} specs)",
            request.env,
            request.layer,
            request.packages.len()
        );
        let out = run_capture(
            &self
                .spack(&request.workdir)
                .args(["concretize", "--fresh", "--force"]),
        )
        .await?;

        if !out.success {
            let tail = build_error_output(&out.stdout, &out.stderr);
            if is_unsatisfiable(&tail) {
                return Err(ByoeError::Unsatisfiable { reason: tail });
            }
            return Err(ByoeError::command_exec("spack concretize", tail));
        }

        let lock_path = request.workdir.join("spack.lock");
        let content = tokio::fs::read_to_string(&lock_path)
            .await
            .map_err(|e| ByoeError::io(format!("reading {}", lock_path.display()), e))?;
        let graph = Self::parse_lock(&content, &lock_path)?;
        debug!("spack resolved {} packages", graph.packages.len());
        Ok(graph)
    }

    fn install_commands(
        &self,
        node: &ConcreteNode,
        ctx: &InstallContext,
    ) -> ByoeResult<Vec<CommandLine>> {
        let dag_hash = node.native_id.as_deref().ok_or_else(|| {
            ByoeError::Internal(format!("spack node {} has no DAG hash", node.name))
        })?;
        let spec = format!("/{dag_hash}");

        let mut commands = vec![self.spack(&ctx.workdir).args([
            "install".to_string(),
            "--only".to_string(),
            "package".to_string(),
            "--no-add".to_string(),
            "--fail-fast".to_string(),
            "-j".to_string(),
            ctx.jobs.max(1).to_string(),
            spec.clone(),
        ])];

        let location = self
            .spack(&ctx.workdir)
            .args(["location", "-i", spec.as_str()])
            .to_shell();
        commands.push(CommandLine::shell(format!(
            "ln -sfn \"$({})\" {}",
            location,
            super::shell_quote(&ctx.prefix.join("install").display().to_string())
        )));

        if let Some(mirror) = &self.config.mirror {
            commands.push(self.spack(&ctx.workdir).args([
                "buildcache",
                "push",
                "--unsigned",
                "--only",
                "package",
                mirror.as_str(),
                spec.as_str(),
            ]));
        }
        Ok(commands)
    }

    async fn query(&self, node: &ConcreteNode, prefix: &Path) -> ByoeResult<bool> {
        let Some(dag_hash) = node.native_id.as_deref() else {
            return Ok(false);
        };
        if !prefix.join("install").exists() {
            return Ok(false);
        }
        let out = run_capture(
            &CommandLine::new(&self.config.command)
                .args(["find", "--format", "{hash}"])
                .arg(format!("/{dag_hash}")),
        )
        .await?;
        Ok(out.success && out.stdout.trim().starts_with(dag_hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LayerOptions;
    use std::path::PathBuf;

    const LOCK: &str = r#"{
  "_meta": {"file-type": "spack-lockfile", "lockfile-version": 5},
  "roots": [{"hash": "aaaa1111", "spec": "foo@1.0"}],
  "concrete_specs": {
    "aaaa1111": {
      "name": "foo", "version": "1.0",
      "arch": {"platform": "linux", "os": "rhel8", "target": {"name": "zen2", "vendor": "AuthenticAMD"}},
      "compiler": {"name": "gcc", "version": "12.2.0"},
      "dependencies": [{"name": "zlib", "hash": "bbbb2222", "parameters": {"deptypes": ["build", "link"]}}]
    },
    "bbbb2222": {
      "name": "zlib", "version": "1.3",
      "arch": {"platform": "linux", "os": "rhel8", "target": "x86_64"}
    }
  }
}"#;

    fn request(options: LayerOptions) -> ResolveRequest {
        ResolveRequest {
            env: "science".to_string(),
            layer: "0-base".to_string(),
            packages: vec!["foo@1.0".to_string(), "hdf5".to_string()],
            options,
            workdir: PathBuf::from("/tmp/work"),
            upstream: vec![],
        }
    }

    #[test]
    fn parses_spack_lock() {
        let graph = SpackAdapter::parse_lock(LOCK, Path::new("spack.lock")).unwrap();
        assert_eq!(graph.roots, vec!["aaaa1111"]);
        assert_eq!(graph.packages.len(), 2);

        let foo = graph.packages.iter().find(|p| p.name == "foo").unwrap();
        assert_eq!(foo.deps, vec!["bbbb2222"]);
        assert_eq!(foo.options["target"], "zen2");
        assert_eq!(foo.options["compiler"], "gcc@12.2.0");
        assert_eq!(foo.native_id.as_deref(), Some("aaaa1111"));

        let zlib = graph.packages.iter().find(|p| p.name == "zlib").unwrap();
        assert_eq!(zlib.options["target"], "x86_64");
    }

    #[test]
    fn manifest_carries_pins() {
        let mut options = LayerOptions {
            compiler: Some("gcc@12".to_string()),
            target: Some("x86_64_v3".to_string()),
            ..Default::default()
        };
        options.variants.insert("hdf5".to_string(), "+mpi".to_string());
        options
            .externals
            .insert("slurm".to_string(), PathBuf::from("/usr"));

        let manifest = SpackAdapter::manifest(&request(options));
        let packages = &manifest["spack"]["packages"];
        assert_eq!(packages["all"]["require"], "%gcc@12 target=x86_64_v3");
        assert_eq!(packages["hdf5"]["variants"], "+mpi");
        assert_eq!(packages["slurm"]["buildable"], false);
        assert_eq!(manifest["spack"]["specs"][0], "foo@1.0");
    }

    #[test]
    fn detects_unsatisfiable_output() {
        assert!(is_unsatisfiable("==> Error: concretization failed: No version for 'foo' satisfies '@9'"));
        assert!(!is_unsatisfiable("==> Error: could not fetch mirror index"));
    }

    #[test]
    fn install_commands_use_dag_hash() {
        let adapter = SpackAdapter::new(BaseEcosystemConfig {
            mirror: Some("site-mirror".to_string()),
            ..Default::default()
        });
        let node = ConcreteNode::new(
            Ecosystem::Spack,
            "foo",
            "1.0",
            BTreeMap::new(),
            Some("aaaa1111".to_string()),
            vec![],
        );
        let ctx = InstallContext {
            prefix: PathBuf::from("/cache/staging/x/artifact"),
            workdir: PathBuf::from("/work/science/0-base"),
            log_path: PathBuf::from("/logs/foo.log"),
            scratch_dir: None,
            jobs: 8,
        };

        let commands = adapter.install_commands(&node, &ctx).unwrap();
        assert_eq!(commands.len(), 3);
        assert!(commands[0].args.contains(&"/aaaa1111".to_string()));
        assert!(commands[0].args.contains(&"8".to_string()));
        assert!(commands[1].args[1].contains("location -i /aaaa1111"));
        assert!(commands[2].args.contains(&"site-mirror".to_string()));
    }
}
