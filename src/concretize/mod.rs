//! Concretization: abstract layer requests to pinned, hashed lock records
//!
//! The concretizer injects site policy into the layer's options, asks the
//! ecosystem adapter to resolve, and canonicalizes the answer. Adapter
//! failures come back as structured [`ByoeError::Concretization`] errors
//! scoped to the environment layer.

pub mod graph;
pub mod node;
pub mod record;

pub use graph::{canonicalize, Canonical, GraphError};
pub use node::{BuildMetadata, ConcreteNode, NodeHash};
pub use record::{layer_id, LockRecord, RecordHeader};

use crate::config::schema::ConflictPolicy;
use crate::config::{LayerKind, LayerOptions, LayerSpec, SiteConfig};
use crate::ecosystem::{normalize_name, AdapterSet, Ecosystem, ResolveRequest, DEFAULT_TOOLCHAIN};
use crate::error::{ByoeError, ByoeResult};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Turns layer specifications into lock records
pub struct Concretizer {
    config: Arc<SiteConfig>,
    adapters: Arc<AdapterSet>,
}

impl Concretizer {
    pub fn new(config: Arc<SiteConfig>, adapters: Arc<AdapterSet>) -> Self {
        Self { config, adapters }
    }

    /// Site pins, then kind defaults, then the layer's own options
    pub fn effective_options(&self, layer: &LayerSpec) -> LayerOptions {
        let mut site = LayerOptions::default();
        if layer.kind == LayerKind::Base {
            let base = &self.config.ecosystems.base;
            site.compiler = base.compiler.clone();
            site.target = base.target.clone();
            site.providers = base.providers.clone();
        }
        let defaults = self.config.defaults.for_kind(layer.kind).over(&site);
        layer.options.over(&defaults)
    }

    /// Concretize layer `index` of `env` on top of the `upstream` records
    pub async fn concretize(
        &self,
        env: &str,
        index: usize,
        layer: &LayerSpec,
        workdir: &Path,
        upstream: &[LockRecord],
    ) -> ByoeResult<LockRecord> {
        let layer_name = format!("{}-{}", index, layer.kind);
        let ecosystem = layer.ecosystem();
        let fail = |unsatisfiable: bool, reason: String| ByoeError::Concretization {
            env: env.to_string(),
            layer: layer_name.clone(),
            ecosystem: ecosystem.to_string(),
            unsatisfiable,
            reason,
        };

        let adapter = self.adapters.get(ecosystem)?;
        if !adapter.is_available().await {
            return Err(ByoeError::AdapterUnavailable {
                ecosystem: ecosystem.to_string(),
                command: adapter.adapter_name().to_string(),
            });
        }

        tokio::fs::create_dir_all(workdir)
            .await
            .map_err(|e| ByoeError::io(format!("creating {}", workdir.display()), e))?;

        let options = self.effective_options(layer);
        let upstream_nodes: Vec<ConcreteNode> = upstream
            .iter()
            .flat_map(|r| r.nodes.iter().cloned())
            .collect();
        let request = ResolveRequest {
            env: env.to_string(),
            layer: layer_name.clone(),
            packages: layer.packages.clone(),
            options: options.clone(),
            workdir: workdir.to_path_buf(),
            upstream: upstream_nodes.clone(),
        };

        info!("Concretizing {}/{} ({})", env, layer_name, adapter.adapter_name());
        let resolved = match adapter.resolve(&request).await {
            Ok(graph) => graph,
            Err(ByoeError::Unsatisfiable { reason }) => return Err(fail(true, reason)),
            Err(e) => return Err(fail(false, e.to_string())),
        };

        if resolved.roots.len() != layer.packages.len() {
            return Err(fail(
                true,
                format!(
                    "resolver returned {} roots for {} requests",
                    resolved.roots.len(),
                    layer.packages.len()
                ),
            ));
        }
        if let Some(missing) = resolved
            .roots
            .iter()
            .find(|root| !resolved.packages.iter().any(|p| &&p.key == root))
        {
            return Err(fail(true, format!("requested package '{missing}' was not resolved")));
        }

        let implicit = match layer.kind {
            LayerKind::PackageIndex => {
                let toolchain = options.toolchain.as_deref().unwrap_or(DEFAULT_TOOLCHAIN);
                match upstream_nodes.iter().find(|n| n.name == toolchain) {
                    Some(node) => vec![node.hash.clone()],
                    None => {
                        debug!("No upstream {} node for {}/{}", toolchain, env, layer_name);
                        vec![]
                    }
                }
            }
            _ => vec![],
        };

        let Canonical { nodes, keys } = canonicalize(ecosystem, &resolved.packages, &implicit)
            .map_err(|e| fail(false, e.to_string()))?;

        if layer.kind == LayerKind::PackageIndex {
            let conflicts = base_conflicts(&nodes, &upstream_nodes);
            if !conflicts.is_empty() {
                let reason = format!("conflicts with base layer: {}", conflicts.join(", "));
                match options.conflict_policy.unwrap_or_default() {
                    ConflictPolicy::Reject => return Err(fail(true, reason)),
                    ConflictPolicy::Warn => warn!("{}/{}: {}", env, layer_name, reason),
                }
            }
        }

        let roots = resolved
            .roots
            .iter()
            .filter_map(|k| keys.get(k).cloned())
            .collect();

        debug!("{}/{} concretized to {} nodes", env, layer_name, nodes.len());
        Ok(LockRecord {
            record: RecordHeader {
                format: record::FORMAT_VERSION,
                env: env.to_string(),
                index,
                kind: layer.kind,
                ecosystem,
                created_at: Utc::now(),
                requests: layer.packages.clone(),
                roots,
            },
            nodes,
        })
    }
}

/// `py-numpy`, `NumPy` and `numpy` all name the same package
fn comparable_name(name: &str) -> String {
    let lower = name.to_lowercase();
    normalize_name(lower.strip_prefix("py-").unwrap_or(&lower))
}

/// Package-index pins whose version disagrees with an upstream base node
fn base_conflicts(nodes: &[ConcreteNode], upstream: &[ConcreteNode]) -> Vec<String> {
    let base: HashMap<String, &ConcreteNode> = upstream
        .iter()
        .filter(|n| n.ecosystem == Ecosystem::Spack)
        .map(|n| (comparable_name(&n.name), n))
        .collect();

    nodes
        .iter()
        .filter_map(|n| {
            base.get(&comparable_name(&n.name))
                .filter(|b| b.version != n.version)
                .map(|b| format!("{} (base {}, index {})", n.name, b.version, n.version))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecosystem::{
        CommandLine, EcosystemAdapter, InstallContext, ResolvedGraph, ResolvedPackage,
    };
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Adapter that answers from a canned graph and records requests
    struct CannedAdapter {
        ecosystem: Ecosystem,
        graph: ResolvedGraph,
        unsat: bool,
        seen: Mutex<Vec<ResolveRequest>>,
    }

    impl CannedAdapter {
        fn new(ecosystem: Ecosystem, graph: ResolvedGraph) -> Self {
            Self {
                ecosystem,
                graph,
                unsat: false,
                seen: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl EcosystemAdapter for CannedAdapter {
        fn ecosystem(&self) -> Ecosystem {
            self.ecosystem
        }

        fn adapter_name(&self) -> &'static str {
            "canned"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn resolve(&self, request: &ResolveRequest) -> ByoeResult<ResolvedGraph> {
            self.seen.lock().unwrap().push(request.clone());
            if self.unsat {
                return Err(ByoeError::Unsatisfiable {
                    reason: "no version of foo matches @9".to_string(),
                });
            }
            Ok(self.graph.clone())
        }

        fn install_commands(
            &self,
            _node: &ConcreteNode,
            _ctx: &InstallContext,
        ) -> ByoeResult<Vec<CommandLine>> {
            Ok(vec![])
        }

        async fn query(&self, _node: &ConcreteNode, _prefix: &Path) -> ByoeResult<bool> {
            Ok(true)
        }
    }

    fn pkg(name: &str, version: &str, deps: &[&str]) -> ResolvedPackage {
        ResolvedPackage {
            key: name.to_string(),
            name: name.to_string(),
            version: version.to_string(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            options: BTreeMap::new(),
            native_id: None,
        }
    }

    fn layer(kind: LayerKind, packages: &[&str]) -> LayerSpec {
        LayerSpec {
            kind,
            packages: packages.iter().map(|p| p.to_string()).collect(),
            options: LayerOptions::default(),
            required: None,
            tool: None,
        }
    }

    fn base_record(nodes: Vec<ConcreteNode>) -> LockRecord {
        LockRecord {
            record: RecordHeader {
                format: record::FORMAT_VERSION,
                env: "science".to_string(),
                index: 0,
                kind: LayerKind::Base,
                ecosystem: Ecosystem::Spack,
                created_at: Utc::now(),
                requests: vec![],
                roots: vec![],
            },
            nodes,
        }
    }

    fn concretizer(config: SiteConfig, adapter: Arc<CannedAdapter>) -> Concretizer {
        Concretizer::new(
            Arc::new(config),
            Arc::new(AdapterSet::default().with(adapter)),
        )
    }

    #[tokio::test]
    async fn produces_ordered_record() {
        let temp = TempDir::new().unwrap();
        let graph = ResolvedGraph {
            packages: vec![pkg("hdf5", "1.14.3", &["zlib"]), pkg("zlib", "1.3.1", &[])],
            roots: vec!["hdf5".to_string()],
        };
        let adapter = Arc::new(CannedAdapter::new(Ecosystem::Spack, graph));
        let c = concretizer(SiteConfig::default(), adapter);

        let record = c
            .concretize("science", 0, &layer(LayerKind::Base, &["hdf5@1.14"]), temp.path(), &[])
            .await
            .unwrap();

        assert_eq!(record.nodes[0].name, "zlib");
        assert_eq!(record.nodes[1].name, "hdf5");
        assert_eq!(record.record.roots, vec![record.nodes[1].hash.clone()]);
        assert_eq!(record.layer_id(), "science/0-base");
    }

    #[tokio::test]
    async fn unsatisfiable_is_structured() {
        let temp = TempDir::new().unwrap();
        let mut adapter = CannedAdapter::new(Ecosystem::Spack, ResolvedGraph::default());
        adapter.unsat = true;
        let c = concretizer(SiteConfig::default(), Arc::new(adapter));

        let err = c
            .concretize("science", 0, &layer(LayerKind::Base, &["foo@9"]), temp.path(), &[])
            .await
            .unwrap_err();
        match err {
            ByoeError::Concretization {
                env,
                layer,
                unsatisfiable,
                reason,
                ..
            } => {
                assert_eq!(env, "science");
                assert_eq!(layer, "0-base");
                assert!(unsatisfiable);
                assert!(reason.contains("foo"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn missing_root_is_unsatisfiable() {
        let temp = TempDir::new().unwrap();
        let graph = ResolvedGraph {
            packages: vec![pkg("zlib", "1.3.1", &[])],
            roots: vec!["hdf5".to_string()],
        };
        let c = concretizer(
            SiteConfig::default(),
            Arc::new(CannedAdapter::new(Ecosystem::Spack, graph)),
        );
        let err = c
            .concretize("science", 0, &layer(LayerKind::Base, &["hdf5"]), temp.path(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ByoeError::Concretization { unsatisfiable: true, .. }));
    }

    #[tokio::test]
    async fn site_pins_reach_the_adapter() {
        let temp = TempDir::new().unwrap();
        let mut config = SiteConfig::default();
        config.ecosystems.base.compiler = Some("gcc@11".to_string());
        config.ecosystems.base.target = Some("zen2".to_string());
        config.defaults.base.compiler = Some("gcc@12".to_string());

        let graph = ResolvedGraph {
            packages: vec![pkg("zlib", "1.3.1", &[])],
            roots: vec!["zlib".to_string()],
        };
        let adapter = Arc::new(CannedAdapter::new(Ecosystem::Spack, graph));
        let c = concretizer(config, adapter.clone());
        c.concretize("science", 0, &layer(LayerKind::Base, &["zlib"]), temp.path(), &[])
            .await
            .unwrap();

        let seen = adapter.seen.lock().unwrap();
        assert_eq!(seen[0].options.compiler.as_deref(), Some("gcc@12"));
        assert_eq!(seen[0].options.target.as_deref(), Some("zen2"));
    }

    #[tokio::test]
    async fn index_layer_depends_on_toolchain() {
        let temp = TempDir::new().unwrap();
        let python =
            ConcreteNode::new(Ecosystem::Spack, "python", "3.11.7", BTreeMap::new(), None, vec![]);
        let graph = ResolvedGraph {
            packages: vec![pkg("requests", "2.31.0", &[])],
            roots: vec!["requests".to_string()],
        };
        let c = concretizer(
            SiteConfig::default(),
            Arc::new(CannedAdapter::new(Ecosystem::Pip, graph)),
        );

        let record = c
            .concretize(
                "science",
                1,
                &layer(LayerKind::PackageIndex, &["requests"]),
                temp.path(),
                &[base_record(vec![python.clone()])],
            )
            .await
            .unwrap();
        assert_eq!(record.nodes[0].deps, vec![python.hash]);
    }

    #[tokio::test]
    async fn base_conflict_rejected_or_warned() {
        let temp = TempDir::new().unwrap();
        let base_numpy =
            ConcreteNode::new(Ecosystem::Spack, "py-numpy", "1.26.4", BTreeMap::new(), None, vec![]);
        let graph = ResolvedGraph {
            packages: vec![pkg("numpy", "2.0.0", &[])],
            roots: vec!["numpy".to_string()],
        };
        let c = concretizer(
            SiteConfig::default(),
            Arc::new(CannedAdapter::new(Ecosystem::Pip, graph)),
        );
        let upstream = [base_record(vec![base_numpy])];

        let mut index = layer(LayerKind::PackageIndex, &["numpy"]);
        let err = c
            .concretize("science", 1, &index, temp.path(), &upstream)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("conflicts with base layer"));

        index.options.conflict_policy = Some(ConflictPolicy::Warn);
        c.concretize("science", 1, &index, temp.path(), &upstream)
            .await
            .unwrap();
    }

    #[test]
    fn comparable_names() {
        assert_eq!(comparable_name("py-NumPy"), "numpy");
        assert_eq!(comparable_name("python_dateutil"), "python-dateutil");
    }
}
