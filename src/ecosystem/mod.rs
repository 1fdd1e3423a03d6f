//! Ecosystem adapters
//!
//! Every external package manager is wrapped behind [`EcosystemAdapter`]:
//! - base ecosystem: Spack, builds from source against system libraries
//! - package index: uv, pins wheels from a Python package index
//! - isolated apps: micromamba, one self-contained prefix per app
//! - Python apps: a private uv-built venv per app
//! - container apps: an Apptainer image plus wrapper scripts
//!
//! Adapters own their process invocation and output parsing. Nothing
//! outside this module knows what a `spack.lock` looks like.

mod apptainer;
mod command;
mod conda;
mod factory;
mod pip;
mod spack;
mod venv;

pub use apptainer::ApptainerAdapter;
pub use command::{shell_quote, CommandLine};
pub use conda::MicromambaAdapter;
pub use factory::create_adapters;
pub use pip::{normalize_name, UvAdapter, DEFAULT_TOOLCHAIN};
pub use spack::SpackAdapter;
pub use venv::VenvAdapter;

pub(crate) use command::{build_error_output, run_capture, run_logged};

use crate::concretize::ConcreteNode;
use crate::config::LayerOptions;
use crate::error::{ByoeError, ByoeResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Package ecosystems a node can originate from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Spack,
    Pip,
    Conda,
    Venv,
    Apptainer,
}

impl Ecosystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spack => "spack",
            Self::Pip => "pip",
            Self::Conda => "conda",
            Self::Venv => "venv",
            Self::Apptainer => "apptainer",
        }
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to an adapter's resolver
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    /// Environment and layer, for diagnostics only
    pub env: String,
    pub layer: String,

    /// Abstract package requests in the ecosystem's syntax
    pub packages: Vec<String>,

    /// Effective options after site pins and defaults are applied
    pub options: LayerOptions,

    /// Private scratch directory for this layer's tool files
    pub workdir: PathBuf,

    /// Concrete nodes of the layers below this one
    pub upstream: Vec<ConcreteNode>,
}

/// One package as reported by an ecosystem resolver
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPackage {
    /// Identifier unique within the graph
    pub key: String,
    pub name: String,
    pub version: String,

    /// Keys of direct dependencies
    pub deps: Vec<String>,

    /// Build options that distinguish artifacts of the same version
    pub options: BTreeMap<String, String>,

    /// The ecosystem's own identity for the package, if it has one
    pub native_id: Option<String>,
}

/// Resolver output before canonicalization
#[derive(Debug, Clone, Default)]
pub struct ResolvedGraph {
    pub packages: Vec<ResolvedPackage>,

    /// Keys of the requested packages, in request order
    pub roots: Vec<String>,
}

/// Where and how a node gets installed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallContext {
    /// Empty directory that becomes the cached artifact
    pub prefix: PathBuf,

    /// The layer workdir the node was concretized in
    pub workdir: PathBuf,

    /// Build output goes here
    pub log_path: PathBuf,

    /// Exported as TMPDIR
    pub scratch_dir: Option<PathBuf>,

    /// Parallelism available to the install
    pub jobs: usize,
}

/// Uniform capability surface over one package manager
#[async_trait]
pub trait EcosystemAdapter: Send + Sync {
    /// Ecosystem tag stamped on every node this adapter produces
    fn ecosystem(&self) -> Ecosystem;

    /// Human-readable tool name for display
    fn adapter_name(&self) -> &'static str;

    /// Check if the tool is installed and runnable
    async fn is_available(&self) -> bool;

    /// Resolve abstract requests into a pinned graph.
    ///
    /// Constraint conflicts are reported as [`ByoeError::Unsatisfiable`];
    /// any other error means the tool itself failed.
    async fn resolve(&self, request: &ResolveRequest) -> ByoeResult<ResolvedGraph>;

    /// Commands that install one node into `ctx.prefix`.
    ///
    /// Batch backends write these into job scripts.
    fn install_commands(
        &self,
        node: &ConcreteNode,
        ctx: &InstallContext,
    ) -> ByoeResult<Vec<CommandLine>>;

    /// Install one node into `ctx.prefix`, logging to `ctx.log_path`
    async fn install(&self, node: &ConcreteNode, ctx: &InstallContext) -> ByoeResult<()> {
        for command in self.install_commands(node, ctx)? {
            let command = match &ctx.scratch_dir {
                Some(dir) => command.env("TMPDIR", dir.display().to_string()),
                None => command,
            };
            run_logged(&command, &ctx.log_path).await.map_err(|e| {
                tracing::debug!("Install step for {} failed: {}", node.name, e);
                ByoeError::BuildJob {
                    node: format!("{}@{}", node.name, node.version),
                    ecosystem: node.ecosystem.to_string(),
                    log: ctx.log_path.clone(),
                }
            })?;
        }
        Ok(())
    }

    /// Whether the ecosystem considers the node realized at `prefix`
    async fn query(&self, node: &ConcreteNode, prefix: &std::path::Path) -> ByoeResult<bool>;
}

/// The adapters available to a run, one per ecosystem
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: Vec<Arc<dyn EcosystemAdapter>>,
}

impl AdapterSet {
    pub fn new(adapters: Vec<Arc<dyn EcosystemAdapter>>) -> Self {
        Self { adapters }
    }

    /// Register an adapter, replacing any for the same ecosystem
    pub fn with(mut self, adapter: Arc<dyn EcosystemAdapter>) -> Self {
        self.adapters
            .retain(|a| a.ecosystem() != adapter.ecosystem());
        self.adapters.push(adapter);
        self
    }

    pub fn get(&self, ecosystem: Ecosystem) -> ByoeResult<Arc<dyn EcosystemAdapter>> {
        self.adapters
            .iter()
            .find(|a| a.ecosystem() == ecosystem)
            .cloned()
            .ok_or_else(|| ByoeError::Internal(format!("no adapter registered for {ecosystem}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn EcosystemAdapter>> {
        self.adapters.iter()
    }
}

/// Strip version and extras from a request, e.g. `hdf5@1.14+mpi` -> `hdf5`
pub fn request_name(request: &str) -> &str {
    let end = request
        .find(|c: char| matches!(c, '@' | '=' | '<' | '>' | '!' | '~' | '[' | ';' | '+' | ' ' | '%' | '^'))
        .unwrap_or(request.len());
    request[..end].trim()
}
