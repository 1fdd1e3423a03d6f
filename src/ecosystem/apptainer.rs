//! Container app adapter backed by Apptainer
//!
//! Every requested image reference becomes one app node. The artifact
//! holds `image.sif` plus small wrapper scripts in `bin/` that run the
//! image relative to their own location, so they survive the move from
//! staging into the cache.

use super::{
    run_capture, shell_quote, CommandLine, Ecosystem, EcosystemAdapter, InstallContext,
    ResolveRequest, ResolvedGraph, ResolvedPackage,
};
use crate::concretize::ConcreteNode;
use crate::config::schema::ApptainerEcosystemConfig;
use crate::config::LayerOptions;
use crate::error::{ByoeError, ByoeResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

const IMAGE_FILE: &str = "image.sif";
const IMAGE_KEY: &str = "image";
const GPU_KEY: &str = "gpu";
const EXPORTED_KEY: &str = "exported";

/// Apptainer-backed container app ecosystem
pub struct ApptainerAdapter {
    config: ApptainerEcosystemConfig,
}

/// A parsed image reference such as `docker://rocker/rstudio:4.3.2`
#[derive(Debug, PartialEq)]
struct ImageRef {
    name: String,
    version: String,
    digest: Option<String>,
}

impl ImageRef {
    fn parse(reference: &str) -> ByoeResult<Self> {
        let unsatisfiable = |why: &str| ByoeError::Unsatisfiable {
            reason: format!("image reference '{reference}' {why}"),
        };
        let Some((_, path)) = reference.split_once("://") else {
            return Err(unsatisfiable("has no source such as docker://"));
        };

        let (path, digest) = match path.split_once('@') {
            Some((path, digest)) => (path, Some(digest.to_string())),
            None => (path, None),
        };
        let last = path.rsplit('/').next().unwrap_or(path);
        let (name, tag) = match last.split_once(':') {
            Some((name, tag)) => (name, Some(tag)),
            None => (last, None),
        };
        if name.is_empty() {
            return Err(unsatisfiable("names no image"));
        }

        let version = match (&digest, tag) {
            (Some(digest), _) => digest.clone(),
            (None, Some(tag)) if !tag.is_empty() => tag.to_string(),
            _ => "latest".to_string(),
        };
        Ok(Self {
            name: name.to_string(),
            version,
            digest,
        })
    }

    /// `latest` and untagged references move without the node hash changing
    fn is_floating(&self) -> bool {
        self.digest.is_none() && self.version == "latest"
    }
}

impl ApptainerAdapter {
    pub fn new(config: ApptainerEcosystemConfig) -> Self {
        Self { config }
    }

    fn app_package(reference: &str, options: &LayerOptions) -> ByoeResult<ResolvedPackage> {
        let image = ImageRef::parse(reference)?;
        if image.is_floating() {
            warn!(
                "{} is not pinned to a tag or digest; updates to it are not rebuilt",
                reference
            );
        }

        let mut pins = BTreeMap::new();
        pins.insert(IMAGE_KEY.to_string(), reference.to_string());
        if let Some(gpu) = options.gpu {
            pins.insert(GPU_KEY.to_string(), gpu.apptainer_flag().to_string());
        }
        if !options.exported.is_empty() {
            pins.insert(EXPORTED_KEY.to_string(), options.exported.join(","));
        }

        Ok(ResolvedPackage {
            key: image.name.clone(),
            name: image.name,
            version: image.version,
            deps: vec![],
            options: pins,
            native_id: image.digest,
        })
    }

    /// Shell script writing one wrapper per exported command.
    ///
    /// Without exported commands a single wrapper named after the app runs
    /// the image's default runscript.
    fn wrapper_script(&self, node: &ConcreteNode, prefix: &Path) -> String {
        let bin = prefix.join("bin");
        let apptainer = shell_quote(&self.config.command);
        let gpu = node
            .options
            .get(GPU_KEY)
            .map(|flag| format!(" {flag}"))
            .unwrap_or_default();
        let image = format!("\"$(dirname \"$0\")/../{IMAGE_FILE}\"");

        let wrappers: Vec<(String, String)> = match node.options.get(EXPORTED_KEY) {
            Some(list) => list
                .split(',')
                .map(|cmd| {
                    let body =
                        format!("exec {apptainer} exec{gpu} {image} {} \"$@\"", shell_quote(cmd));
                    (cmd.to_string(), body)
                })
                .collect(),
            None => vec![(
                node.name.clone(),
                format!("exec {apptainer} run{gpu} {image} \"$@\""),
            )],
        };

        let mut script = format!(
            "set -e\nmkdir -p {}\n",
            shell_quote(&bin.display().to_string())
        );
        for (name, body) in wrappers {
            let path = shell_quote(&bin.join(&name).display().to_string());
            script.push_str(&format!(
                "cat > {path} <<'BYOE_WRAPPER'\n#!/bin/sh\n{body}\nBYOE_WRAPPER\nchmod 755 {path}\n"
            ));
        }
        script
    }
}

#[async_trait]
impl EcosystemAdapter for ApptainerAdapter {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Apptainer
    }

    fn adapter_name(&self) -> &'static str {
        "apptainer"
    }

    async fn is_available(&self) -> bool {
        run_capture(&CommandLine::new(&self.config.command).arg("--version"))
            .await
            .map(|out| out.success)
            .unwrap_or(false)
    }

    async fn resolve(&self, request: &ResolveRequest) -> ByoeResult<ResolvedGraph> {
        info!(
            "Pinning {}/{} images ({} apps)",
            request.env,
            request.layer,
            request.packages.len()
        );
        let mut graph = ResolvedGraph::default();
        for reference in &request.packages {
            let package = Self::app_package(reference, &request.options)?;
            if graph.packages.iter().any(|p| p.key == package.key) {
                return Err(ByoeError::Unsatisfiable {
                    reason: format!("two images in one layer are named {}", package.key),
                });
            }
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
        let reference = node.options.get(IMAGE_KEY).ok_or_else(|| {
            ByoeError::Internal(format!("app {} has no image reference", node.name))
        })?;

        let build = CommandLine::new(&self.config.command)
            .arg("build")
            .arg(ctx.prefix.join(IMAGE_FILE).display().to_string())
            .arg(reference.as_str())
            .env("APPTAINER_PYTHREADS", ctx.jobs.to_string());
        let wrappers = CommandLine::shell(self.wrapper_script(node, &ctx.prefix));
        Ok(vec![build, wrappers])
    }

    async fn query(&self, _node: &ConcreteNode, prefix: &Path) -> ByoeResult<bool> {
        Ok(prefix.join(IMAGE_FILE).is_file() && prefix.join("bin").is_dir())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::GpuRuntime;
    use std::path::PathBuf;

    fn node(reference: &str, options: &LayerOptions) -> ConcreteNode {
        let package = ApptainerAdapter::app_package(reference, options).unwrap();
        ConcreteNode::new(
            Ecosystem::Apptainer,
            package.name,
            package.version,
            package.options,
            package.native_id,
            vec![],
        )
    }

    #[test]
    fn parses_image_references() {
        let tagged = ImageRef::parse("docker://quay.io/biocontainers/samtools:1.19--h50ea8bc_0").unwrap();
        assert_eq!(tagged.name, "samtools");
        assert_eq!(tagged.version, "1.19--h50ea8bc_0");
        assert!(!tagged.is_floating());

        let pinned = ImageRef::parse("docker://rocker/rstudio@sha256:4f5e").unwrap();
        assert_eq!(pinned.name, "rstudio");
        assert_eq!(pinned.version, "sha256:4f5e");
        assert_eq!(pinned.digest.as_deref(), Some("sha256:4f5e"));

        let floating = ImageRef::parse("library://alpine").unwrap();
        assert_eq!(floating.version, "latest");
        assert!(floating.is_floating());

        assert!(matches!(
            ImageRef::parse("rocker/rstudio:4.3.2"),
            Err(ByoeError::Unsatisfiable { .. })
        ));
        assert!(ImageRef::parse("docker://rocker/").is_err());
    }

    #[test]
    fn default_wrapper_runs_the_image() {
        let adapter = ApptainerAdapter::new(ApptainerEcosystemConfig::default());
        let options = LayerOptions {
            gpu: Some(GpuRuntime::Nvidia),
            ..Default::default()
        };
        let script = adapter.wrapper_script(&node("docker://rocker/rstudio:4.3.2", &options), Path::new("/p"));
        assert!(script.starts_with("set -e\nmkdir -p /p/bin\n"));
        assert!(script.contains("cat > /p/bin/rstudio <<'BYOE_WRAPPER'\n#!/bin/sh\n"));
        assert!(script.contains("exec apptainer run --nv \"$(dirname \"$0\")/../image.sif\" \"$@\"\n"));
        assert!(script.ends_with("chmod 755 /p/bin/rstudio\n"));
    }

    #[test]
    fn exported_commands_get_exec_wrappers() {
        let adapter = ApptainerAdapter::new(ApptainerEcosystemConfig::default());
        let options = LayerOptions {
            exported: vec!["samtools".to_string(), "bgzip".to_string()],
            ..Default::default()
        };
        let script = adapter.wrapper_script(
            &node("docker://quay.io/biocontainers/samtools:1.19--h50ea8bc_0", &options),
            Path::new("/p"),
        );
        assert!(script.contains("exec apptainer exec \"$(dirname \"$0\")/../image.sif\" bgzip \"$@\""));
        assert!(script.contains("chmod 755 /p/bin/samtools\n"));
        assert!(!script.contains(" run "));
    }

    #[test]
    fn gpu_and_exports_change_the_node() {
        let plain = node("docker://rocker/rstudio:4.3.2", &LayerOptions::default());
        let gpu = node(
            "docker://rocker/rstudio:4.3.2",
            &LayerOptions {
                gpu: Some(GpuRuntime::Rocm),
                ..Default::default()
            },
        );
        assert_ne!(plain.hash, gpu.hash);
    }

    #[tokio::test]
    async fn duplicate_image_names_are_rejected() {
        let adapter = ApptainerAdapter::new(ApptainerEcosystemConfig::default());
        let request = ResolveRequest {
            env: "main".to_string(),
            layer: "1-app".to_string(),
            packages: vec![
                "docker://rocker/rstudio:4.3.2".to_string(),
                "docker://other/rstudio:1.0".to_string(),
            ],
            options: LayerOptions::default(),
            workdir: PathBuf::from("/work"),
            upstream: vec![],
        };
        assert!(matches!(
            adapter.resolve(&request).await,
            Err(ByoeError::Unsatisfiable { .. })
        ));
    }

    #[tokio::test]
    async fn install_builds_then_wraps() {
        let adapter = ApptainerAdapter::new(ApptainerEcosystemConfig::default());
        let ctx = InstallContext {
            prefix: PathBuf::from("/cache/staging/x/artifact"),
            workdir: PathBuf::from("/work"),
            log_path: PathBuf::from("/logs/rstudio.log"),
            scratch_dir: None,
            jobs: 8,
        };
        let node = node("docker://rocker/rstudio:4.3.2", &LayerOptions::default());
        let commands = adapter.install_commands(&node, &ctx).unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[0].args,
            vec![
                "build",
                "/cache/staging/x/artifact/image.sif",
                "docker://rocker/rstudio:4.3.2"
            ]
        );
        assert!(commands[0]
            .env
            .contains(&("APPTAINER_PYTHREADS".to_string(), "8".to_string())));
        assert_eq!(commands[1].program, "sh");

        let temp = tempfile::TempDir::new().unwrap();
        assert!(!adapter.query(&node, temp.path()).await.unwrap());
        std::fs::write(temp.path().join("image.sif"), "").unwrap();
        std::fs::create_dir(temp.path().join("bin")).unwrap();
        assert!(adapter.query(&node, temp.path()).await.unwrap());
    }
}
