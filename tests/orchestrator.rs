//! End-to-end update runs against in-process ecosystem adapters

use async_trait::async_trait;
use byoe::cache::BuildCache;
use byoe::concretize::ConcreteNode;
use byoe::config::{AppSpec, AppTool, EnvironmentSpec, LayerKind, LayerSpec, SiteConfig};
use byoe::ecosystem::{
    request_name, AdapterSet, CommandLine, Ecosystem, EcosystemAdapter, InstallContext,
    ResolveRequest, ResolvedGraph, ResolvedPackage,
};
use byoe::error::{ByoeError, ByoeResult};
use byoe::scheduler::{BatchLimits, BuildBackend, BuildJob, JobStatus, LocalBackend};
use byoe::snapshot::{EnvStatus, LayerStatus, SnapshotManager, SnapshotStatus, UpdateOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;

/// A package manager backed by an in-memory catalog
struct FakeAdapter {
    ecosystem: Ecosystem,
    catalog: Mutex<BTreeMap<String, (String, Vec<String>)>>,
    unsatisfiable: Mutex<Vec<String>>,
    broken: Mutex<Vec<String>>,
    installs: Mutex<Vec<String>>,
    /// Node whose install raises the abort flag and then takes a while
    abort_during: Mutex<Option<(String, watch::Sender<bool>)>>,
}

impl FakeAdapter {
    fn new(ecosystem: Ecosystem, packages: &[(&str, &str, &[&str])]) -> Arc<Self> {
        let catalog = packages
            .iter()
            .map(|(name, version, deps)| {
                (
                    name.to_string(),
                    (version.to_string(), deps.iter().map(|d| d.to_string()).collect()),
                )
            })
            .collect();
        Arc::new(Self {
            ecosystem,
            catalog: Mutex::new(catalog),
            unsatisfiable: Mutex::new(Vec::new()),
            broken: Mutex::new(Vec::new()),
            installs: Mutex::new(Vec::new()),
            abort_during: Mutex::new(None),
        })
    }

    fn set_version(&self, name: &str, version: &str) {
        if let Some(entry) = self.catalog.lock().unwrap().get_mut(name) {
            entry.0 = version.to_string();
        }
    }

    fn break_install(&self, name: &str) {
        self.broken.lock().unwrap().push(name.to_string());
    }

    fn fix_install(&self, name: &str) {
        self.broken.lock().unwrap().retain(|n| n != name);
    }

    fn abort_while_installing(&self, name: &str, abort: watch::Sender<bool>) {
        *self.abort_during.lock().unwrap() = Some((name.to_string(), abort));
    }

    fn make_unsatisfiable(&self, name: &str) {
        self.unsatisfiable.lock().unwrap().push(name.to_string());
    }

    /// Names installed since the last call
    fn take_installs(&self) -> Vec<String> {
        let mut installs = std::mem::take(&mut *self.installs.lock().unwrap());
        installs.sort();
        installs
    }
}

#[async_trait]
impl EcosystemAdapter for FakeAdapter {
    fn ecosystem(&self) -> Ecosystem {
        self.ecosystem
    }

    fn adapter_name(&self) -> &'static str {
        "fake"
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn resolve(&self, request: &ResolveRequest) -> ByoeResult<ResolvedGraph> {
        let catalog = self.catalog.lock().unwrap().clone();
        let unsatisfiable = self.unsatisfiable.lock().unwrap().clone();

        let mut graph = ResolvedGraph::default();
        let mut queue = Vec::new();
        for package in &request.packages {
            let name = request_name(package).to_string();
            if unsatisfiable.contains(&name) {
                return Err(ByoeError::Unsatisfiable {
                    reason: format!("{name} conflicts with the site pins"),
                });
            }
            graph.roots.push(name.clone());
            queue.push(name);
        }

        while let Some(name) = queue.pop() {
            if graph.packages.iter().any(|p| p.key == name) {
                continue;
            }
            let Some((version, deps)) = catalog.get(&name) else {
                return Err(ByoeError::Unsatisfiable {
                    reason: format!("no package named {name}"),
                });
            };
            queue.extend(deps.iter().cloned());
            graph.packages.push(ResolvedPackage {
                key: name.clone(),
                name,
                version: version.clone(),
                deps: deps.clone(),
                options: BTreeMap::new(),
                native_id: None,
            });
        }
        Ok(graph)
    }

    fn install_commands(
        &self,
        _node: &ConcreteNode,
        _ctx: &InstallContext,
    ) -> ByoeResult<Vec<CommandLine>> {
        Ok(vec![])
    }

    async fn install(&self, node: &ConcreteNode, ctx: &InstallContext) -> ByoeResult<()> {
        if self.broken.lock().unwrap().contains(&node.name) {
            return Err(ByoeError::BuildJob {
                node: node.label(),
                ecosystem: node.ecosystem.to_string(),
                log: ctx.log_path.clone(),
            });
        }
        let abort = {
            let mut slot = self.abort_during.lock().unwrap();
            match slot.as_ref() {
                Some((name, _)) if *name == node.name => slot.take(),
                _ => None,
            }
        };
        if let Some((_, tx)) = abort {
            tx.send(true).unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        std::fs::write(ctx.prefix.join("installed"), node.label()).unwrap();
        self.installs.lock().unwrap().push(node.name.clone());
        Ok(())
    }

    async fn query(&self, _node: &ConcreteNode, prefix: &Path) -> ByoeResult<bool> {
        Ok(prefix.join("installed").exists())
    }
}

/// A batch queue whose cancellations arrive after the job already ran
struct LateCancelQueue {
    inner: LocalBackend,
    cancels: AtomicUsize,
}

#[async_trait]
impl BuildBackend for LateCancelQueue {
    fn backend_name(&self) -> &'static str {
        "late-cancel"
    }

    fn limits(&self) -> BatchLimits {
        self.inner.limits()
    }

    fn cpus_per_task(&self, tasks: usize) -> usize {
        self.inner.cpus_per_task(tasks)
    }

    fn scratch_dir(&self) -> Option<PathBuf> {
        self.inner.scratch_dir()
    }

    async fn submit(&self, job: &BuildJob) -> ByoeResult<String> {
        self.inner.submit(job).await
    }

    async fn poll(&self, job: &BuildJob) -> ByoeResult<JobStatus> {
        self.inner.poll(job).await
    }

    async fn cancel(&self, _job: &BuildJob) -> ByoeResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Site {
    _temp: TempDir,
    spack: Arc<FakeAdapter>,
    pip: Arc<FakeAdapter>,
    venv: Arc<FakeAdapter>,
    config: SiteConfig,
}

impl Site {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let spack = FakeAdapter::new(
            Ecosystem::Spack,
            &[
                ("zlib", "1.3.1", &[]),
                ("hdf5", "1.14.3", &["zlib"]),
                ("netcdf-c", "4.9.2", &["hdf5"]),
                ("python", "3.11.9", &["zlib"]),
                ("fftw", "3.3.10", &[]),
            ],
        );
        let pip = FakeAdapter::new(
            Ecosystem::Pip,
            &[("numpy", "1.26.4", &[]), ("xarray", "2024.3.0", &["numpy"])],
        );
        let venv = FakeAdapter::new(Ecosystem::Venv, &[("black", "24.3.0", &[])]);

        let mut config = SiteConfig::default();
        config.storage.base_dir = temp.path().join("stack");
        config.build.poll_interval_ms = 5;
        config.build.max_tasks = 2;
        config.build.retry.base_delay_ms = 1;
        config.build.retry.max_delay_ms = 2;
        config.retention.keep = 3;

        Self {
            _temp: temp,
            spack,
            pip,
            venv,
            config,
        }
    }

    fn add_env(&mut self, name: &str, required: bool, layers: &[(LayerKind, &[&str])]) {
        let env = EnvironmentSpec {
            layers: layers
                .iter()
                .map(|(kind, packages)| LayerSpec {
                    kind: *kind,
                    packages: packages.iter().map(|p| p.to_string()).collect(),
                    options: Default::default(),
                    required: None,
                    tool: None,
                })
                .collect(),
            required,
            ..Default::default()
        };
        self.config.envs.insert(name.to_string(), env);
    }

    fn adapters(&self) -> Arc<AdapterSet> {
        Arc::new(
            AdapterSet::default()
                .with(self.spack.clone())
                .with(self.pip.clone())
                .with(self.venv.clone()),
        )
    }

    fn manager(&self) -> SnapshotManager {
        let adapters = self.adapters();
        let backend: Arc<dyn BuildBackend> = Arc::new(LocalBackend::new(adapters.clone(), 2));
        SnapshotManager::new(Arc::new(self.config.clone()), adapters, backend)
    }
}

fn no_abort() -> watch::Receiver<bool> {
    let (_tx, rx) = watch::channel(false);
    rx
}

fn science_site() -> Site {
    let mut site = Site::new();
    site.add_env(
        "science",
        true,
        &[
            (LayerKind::Base, &["netcdf-c", "python"]),
            (LayerKind::PackageIndex, &["xarray"]),
        ],
    );
    site
}

#[tokio::test]
async fn unchanged_inputs_install_nothing() {
    let site = science_site();
    let manager = site.manager();

    let first = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(first.success());
    assert_eq!(first.snapshot.installs, 6);
    assert_eq!(
        site.spack.take_installs(),
        vec!["hdf5", "netcdf-c", "python", "zlib"]
    );
    assert_eq!(site.pip.take_installs(), vec!["numpy", "xarray"]);

    let second = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(second.success());
    assert_eq!(second.snapshot.installs, 0);
    assert!(site.spack.take_installs().is_empty());
    assert!(site.pip.take_installs().is_empty());
    assert_eq!(second.previous.as_ref(), Some(&first.snapshot.id));

    let env = &second.snapshot.envs["science"];
    assert!(env.layers.iter().all(|l| l.unchanged));
    assert_eq!(
        manager.store().current(site.config.storage.channel).await.unwrap(),
        Some(second.snapshot.id.clone())
    );
}

#[tokio::test]
async fn version_bump_rebuilds_only_the_affected_subgraph() {
    let site = science_site();
    let manager = site.manager();

    manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    site.spack.take_installs();
    site.pip.take_installs();

    site.spack.set_version("hdf5", "1.14.4");
    let report = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(report.success());
    assert_eq!(site.spack.take_installs(), vec!["hdf5", "netcdf-c"]);
    assert!(site.pip.take_installs().is_empty());

    let layers = &report.snapshot.envs["science"].layers;
    assert!(!layers[0].unchanged);
    assert!(layers[1].unchanged);
}

#[tokio::test]
async fn shared_nodes_build_once_across_environments() {
    let mut site = Site::new();
    site.add_env("climate", true, &[(LayerKind::Base, &["netcdf-c"])]);
    site.add_env("spectral", true, &[(LayerKind::Base, &["fftw", "zlib"])]);
    let manager = site.manager();

    let report = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(report.success());
    assert_eq!(
        site.spack.take_installs(),
        vec!["fftw", "hdf5", "netcdf-c", "zlib"]
    );

    let records = report.snapshot.lock_records().await.unwrap();
    let zlib: Vec<_> = records
        .iter()
        .flat_map(|r| r.nodes.iter())
        .filter(|n| n.name == "zlib")
        .map(|n| n.hash.clone())
        .collect();
    assert_eq!(zlib.len(), 2);
    assert_eq!(zlib[0], zlib[1]);
}

#[tokio::test]
async fn base_layer_failure_keeps_the_channel() {
    let site = science_site();
    let manager = site.manager();
    let channel = site.config.storage.channel;

    let good = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();

    site.spack.make_unsatisfiable("netcdf-c");
    let bad = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(!bad.published);
    assert_eq!(bad.snapshot.status, SnapshotStatus::Failed);

    let env = &bad.snapshot.envs["science"];
    assert_eq!(env.status, EnvStatus::Failed);
    assert_eq!(env.layers[0].status, LayerStatus::Failed);
    assert!(env.layers[0].error.as_deref().unwrap().contains("netcdf-c"));
    assert_eq!(env.layers[1].status, LayerStatus::Skipped);

    assert_eq!(
        manager.store().current(channel).await.unwrap(),
        Some(good.snapshot.id.clone())
    );
    let resolved = manager.store().resolve(None, channel).await.unwrap();
    assert_eq!(resolved.id, good.snapshot.id);

    // The failed run stays on disk for inspection
    let failed = manager.store().load(&bad.snapshot.id).await.unwrap();
    assert_eq!(failed.status, SnapshotStatus::Failed);
}

#[tokio::test]
async fn optional_env_failure_does_not_block_publish() {
    let mut site = Site::new();
    site.add_env("core", true, &[(LayerKind::Base, &["zlib"])]);
    site.add_env("extras", false, &[(LayerKind::Base, &["fftw"])]);
    site.spack.break_install("fftw");
    let manager = site.manager();

    let report = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(report.published);
    assert!(!report.success());
    assert_eq!(report.snapshot.envs["core"].status, EnvStatus::Succeeded);

    let extras = &report.snapshot.envs["extras"];
    assert_eq!(extras.status, EnvStatus::Failed);
    let failed = &extras.layers[0].failed_nodes;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].name, "fftw");
    assert!(failed[0].log.is_some());
}

#[tokio::test]
async fn retention_prunes_and_gc_collects_old_artifacts() {
    let mut site = science_site();
    site.config.retention.keep = 1;
    let manager = site.manager();

    let first = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    site.spack.set_version("zlib", "1.3.2");
    let second = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(second.success());
    assert_eq!(second.pruned, vec![first.snapshot.id.clone()]);

    let pruned = manager.store().load(&first.snapshot.id).await.unwrap();
    assert!(pruned.pruned);
    assert!(!pruned.views_dir().exists());
    // Lock records survive pruning
    assert!(!pruned.lock_records().await.unwrap().is_empty());

    let cache = BuildCache::open(site.config.cache_root(), 600).await.unwrap();
    let report = manager.store().gc(&cache, false).await.unwrap();
    // Everything depends on zlib, so the whole first generation is garbage
    assert_eq!(report.removed.len(), 6);
    assert_eq!(cache.list().await.unwrap().len(), 6);

    let again = manager.store().gc(&cache, false).await.unwrap();
    assert!(again.removed.is_empty());
}

#[tokio::test]
async fn only_restricts_the_run() {
    let mut site = Site::new();
    site.add_env("climate", true, &[(LayerKind::Base, &["netcdf-c"])]);
    site.add_env("spectral", true, &[(LayerKind::Base, &["fftw"])]);
    let manager = site.manager();

    let options = UpdateOptions {
        label: Some("rc".to_string()),
        only: vec!["spectral".to_string()],
    };
    let report = manager.update(options, no_abort()).await.unwrap();
    assert!(report.success());
    assert_eq!(report.snapshot.id.to_string().rsplit('.').next(), Some("rc0"));
    assert_eq!(report.snapshot.envs.len(), 1);
    assert_eq!(site.spack.take_installs(), vec!["fftw"]);

    let unknown = UpdateOptions {
        label: None,
        only: vec!["nope".to_string()],
    };
    assert!(matches!(
        manager.update(unknown, no_abort()).await,
        Err(ByoeError::User(_))
    ));
}

#[tokio::test]
async fn concurrent_updates_share_one_build() {
    let mut site = Site::new();
    site.add_env("climate", true, &[(LayerKind::Base, &["netcdf-c"])]);
    site.add_env("spectral", true, &[(LayerKind::Base, &["fftw", "zlib"])]);
    let first = site.manager();
    let second = site.manager();

    let only = |env: &str| UpdateOptions {
        label: None,
        only: vec![env.to_string()],
    };
    let (a, b) = tokio::join!(
        first.update(only("climate"), no_abort()),
        second.update(only("spectral"), no_abort())
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.success());
    assert!(b.success());
    assert_ne!(a.snapshot.id, b.snapshot.id);

    // zlib is needed by both runs but installed by only one of them
    assert_eq!(
        site.spack.take_installs(),
        vec!["fftw", "hdf5", "netcdf-c", "zlib"]
    );
    assert_eq!(a.snapshot.installs + b.snapshot.installs, 4);

    let cache = BuildCache::open(site.config.cache_root(), 600).await.unwrap();
    assert_eq!(cache.list().await.unwrap().len(), 4);
}

#[tokio::test]
async fn rerun_after_failure_builds_only_what_is_missing() {
    let site = science_site();
    site.spack.break_install("hdf5");
    let manager = site.manager();

    let failed = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(!failed.published);
    assert_eq!(site.spack.take_installs(), vec!["python", "zlib"]);
    assert_eq!(site.pip.take_installs(), vec!["numpy", "xarray"]);
    let base = &failed.snapshot.envs["science"].layers[0];
    let names: Vec<&str> = base.failed_nodes.iter().map(|n| n.name.as_str()).collect();
    assert!(names.contains(&"hdf5"));
    assert!(names.contains(&"netcdf-c"));

    site.spack.fix_install("hdf5");
    let fixed = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(fixed.success());
    assert_eq!(fixed.snapshot.installs, 2);
    assert_eq!(site.spack.take_installs(), vec!["hdf5", "netcdf-c"]);
    assert!(site.pip.take_installs().is_empty());
}

#[tokio::test]
async fn abort_still_commits_jobs_that_finish_in_the_grace_period() {
    let mut site = Site::new();
    site.config.build.abort_grace_secs = 10;
    site.add_env("io", true, &[(LayerKind::Base, &["hdf5"])]);

    let (tx, rx) = watch::channel(false);
    site.spack.abort_while_installing("zlib", tx);
    let adapters = site.adapters();
    let queue = Arc::new(LateCancelQueue {
        inner: LocalBackend::new(adapters.clone(), 2),
        cancels: AtomicUsize::new(0),
    });
    let manager = SnapshotManager::new(Arc::new(site.config.clone()), adapters, queue.clone());

    let report = manager.update(UpdateOptions::default(), rx).await.unwrap();
    assert!(report.snapshot.aborted);
    assert!(!report.published);
    assert_eq!(report.snapshot.status, SnapshotStatus::Failed);
    assert!(queue.cancels.load(Ordering::SeqCst) >= 1);
    assert_eq!(site.spack.take_installs(), vec!["zlib"]);

    let records = report.snapshot.lock_records().await.unwrap();
    let node = |name: &str| {
        records[0]
            .nodes
            .iter()
            .find(|n| n.name == name)
            .unwrap()
            .hash
            .clone()
    };
    let cache = BuildCache::open(site.config.cache_root(), 600).await.unwrap();
    assert!(cache.lookup(&node("zlib")).await.unwrap().is_some());
    assert!(cache.lookup(&node("hdf5")).await.unwrap().is_none());

    // The next run picks up from the committed zlib
    let resumed = site.manager().update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(resumed.success());
    assert_eq!(site.spack.take_installs(), vec!["hdf5"]);
}

#[tokio::test]
async fn site_apps_join_environments_as_optional_layers() {
    let mut site = science_site();
    site.add_env("minimal", true, &[(LayerKind::Base, &["zlib"])]);
    if let Some(env) = site.config.envs.get_mut("minimal") {
        env.exclude_apps.push("black".to_string());
    }
    site.config.apps.insert(
        "black".to_string(),
        AppSpec {
            tool: AppTool::Venv,
            packages: vec!["black".to_string()],
            ..Default::default()
        },
    );
    site.venv.break_install("black");
    let manager = site.manager();

    let report = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(report.published);
    let science = &report.snapshot.envs["science"];
    assert_eq!(science.layers.len(), 3);
    assert_eq!(science.layers[2].ecosystem, Ecosystem::Venv);
    assert!(!science.layers[2].required);
    assert_eq!(science.layers[2].failed_nodes[0].name, "black");
    assert_eq!(report.snapshot.envs["minimal"].layers.len(), 1);

    site.venv.fix_install("black");
    let report = manager.update(UpdateOptions::default(), no_abort()).await.unwrap();
    assert!(report.success());
    assert_eq!(site.venv.take_installs(), vec!["black"]);
    let views = report.snapshot.views_dir().join("science").join("app");
    assert!(views.join("black").join("installed").is_file());
}
