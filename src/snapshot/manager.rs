//! Snapshot update orchestration
//!
//! One `update` walks `INIT -> CONCRETIZING -> BUILDING -> VALIDATING`
//! and ends `PUBLISHED` or `FAILED`. Node and layer failures are recorded
//! in the snapshot and never abort sibling work; only storage problems
//! end a run with an error.

use crate::cache::BuildCache;
use crate::concretize::{Concretizer, LockRecord, NodeHash};
use crate::config::{ConfigManager, EnvironmentSpec, SiteConfig};
use crate::ecosystem::{create_adapters, AdapterSet};
use crate::error::{ByoeError, ByoeResult};
use crate::journal::EventJournal;
use crate::scheduler::{create_backend, BuildBackend, BuildRequest, JobScheduler, NodeOutcome};
use crate::snapshot::id::SnapId;
use crate::snapshot::policy::{evaluate_env, layer_status, snapshot_passes};
use crate::snapshot::state::{
    EnvOutcome, FailedNode, LayerOutcome, LayerStatus, Snapshot, SnapshotStatus,
};
use crate::snapshot::store::SnapshotStore;
use chrono::Utc;
use futures_util::future::join_all;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// What to build
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub label: Option<String>,

    /// Restrict the run to these environments
    pub only: Vec<String>,
}

/// Outcome of one update run
#[derive(Debug)]
pub struct UpdateReport {
    pub snapshot: Snapshot,
    pub published: bool,

    /// Channel target before this run published
    pub previous: Option<SnapId>,

    pub pruned: Vec<SnapId>,
    pub recovered: usize,
}

impl UpdateReport {
    /// Published with no failed environment
    pub fn success(&self) -> bool {
        self.published && self.snapshot.failed_envs().next().is_none()
    }
}

/// Lock records of one run, keyed by environment and layer index
type Records = BTreeMap<(String, usize), LockRecord>;

/// Drives a snapshot from allocation to publish
pub struct SnapshotManager {
    config: Arc<SiteConfig>,
    adapters: Arc<AdapterSet>,
    backend: Arc<dyn BuildBackend>,
    store: SnapshotStore,
    journal: EventJournal,
}

impl SnapshotManager {
    pub fn new(
        config: Arc<SiteConfig>,
        adapters: Arc<AdapterSet>,
        backend: Arc<dyn BuildBackend>,
    ) -> Self {
        Self {
            store: SnapshotStore::new(&config.storage),
            journal: EventJournal::new(&config),
            config,
            adapters,
            backend,
        }
    }

    /// Wire up the real adapters and the configured backend
    pub fn from_config(config: SiteConfig) -> Self {
        let adapters = Arc::new(create_adapters(&config));
        let backend = create_backend(&config, adapters.clone());
        Self::new(Arc::new(config), adapters, backend)
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }

    /// Build and, if it validates, publish a new snapshot
    pub async fn update(
        &self,
        options: UpdateOptions,
        abort: watch::Receiver<bool>,
    ) -> ByoeResult<UpdateReport> {
        let envs = self.select_envs(&options.only)?;
        ConfigManager::ensure_storage_dirs(&self.config).await?;
        let id = self.store.allocate(options.label.as_deref()).await?;
        info!("Building snapshot {} for channel {}", id, self.config.storage.channel);

        let result = self.run(&id, envs, abort).await;
        if let Err(e) = &result {
            self.mark_failed(&id, e).await;
        }
        self.store.release(&id).await;
        result
    }

    fn select_envs(&self, only: &[String]) -> ByoeResult<Vec<(String, EnvironmentSpec)>> {
        if self.config.envs.is_empty() {
            return Err(ByoeError::User(
                "no environments configured; add one under conf.d/envs/".to_string(),
            ));
        }
        if let Some(unknown) = only.iter().find(|n| !self.config.envs.contains_key(*n)) {
            return Err(ByoeError::User(format!("unknown environment '{unknown}'")));
        }
        Ok(self
            .config
            .envs
            .iter()
            .filter(|(name, _)| only.is_empty() || only.contains(name))
            .map(|(name, spec)| {
                let expanded = EnvironmentSpec {
                    layers: self.config.env_layers(spec),
                    ..spec.clone()
                };
                (name.clone(), expanded)
            })
            .collect())
    }

    async fn run(
        &self,
        id: &SnapId,
        envs: Vec<(String, EnvironmentSpec)>,
        abort: watch::Receiver<bool>,
    ) -> ByoeResult<UpdateReport> {
        let channel = self.config.storage.channel;
        let mut snapshot = Snapshot::new(id.clone(), channel, self.store.snapshot_dir(id));
        self.store.save(&snapshot).await?;
        let site_conf = toml::to_string_pretty(&*self.config)?;
        fs::write(snapshot.site_conf_path(), site_conf)
            .await
            .map_err(|e| ByoeError::io("writing site configuration copy", e))?;
        let names: Vec<&String> = envs.iter().map(|(n, _)| n).collect();
        self.journal
            .record("snapshot.allocated", &json!({"id": id, "channel": channel, "envs": names}))
            .await;

        // Concretize every environment, layers in order
        let previous_digests = self.previous_digests(channel).await;
        let concretizer = Concretizer::new(self.config.clone(), self.adapters.clone());
        let work_root = self.config.storage.work_dir().join(id.to_string());
        let results = join_all(envs.iter().map(|(name, spec)| {
            self.concretize_env(&concretizer, &snapshot.dir, &work_root, name, spec, &previous_digests)
        }))
        .await;

        let mut records = Records::new();
        for result in results {
            let (outcome, env_records) = result?;
            for record in env_records {
                records.insert((outcome.name.clone(), record.record.index), record);
            }
            snapshot.envs.insert(outcome.name.clone(), outcome);
        }
        snapshot.touch();
        self.store.save(&snapshot).await?;
        self.journal
            .record("snapshot.concretized", &json!({"id": id, "layers": records.len()}))
            .await;

        // Build whatever the cache does not have
        let cache = BuildCache::open(self.config.cache_root(), self.config.lease.stale_after_secs).await?;
        let scheduler = JobScheduler::new(
            self.config.clone(),
            cache.clone(),
            self.adapters.clone(),
            self.backend.clone(),
        );
        let recovered = scheduler.recover_orphans().await?;
        if recovered > 0 {
            info!("Recovered {} artifacts from interrupted runs", recovered);
        }
        let requests = self.build_requests(id, &work_root, &records);
        let build = scheduler.run(requests, abort).await?;
        snapshot.installs = build.installs;
        snapshot.aborted = build.aborted;
        self.journal
            .record(
                "snapshot.built",
                &json!({
                    "id": id,
                    "installs": build.installs,
                    "failed": build.failed().count(),
                    "aborted": build.aborted,
                }),
            )
            .await;

        // Validate
        apply_outcomes(&mut snapshot, &records, &build.outcomes);
        if build.aborted || !snapshot_passes(snapshot.envs.values()) {
            snapshot.status = SnapshotStatus::Failed;
            snapshot.finished_at = Some(Utc::now());
            snapshot.touch();
            self.store.save(&snapshot).await?;
            let failed: Vec<&String> = snapshot.failed_envs().map(|e| &e.name).collect();
            self.journal
                .record("snapshot.failed", &json!({"id": id, "failed_envs": failed, "aborted": build.aborted}))
                .await;
            warn!("Snapshot {} failed validation and was not published", id);
            return Ok(UpdateReport {
                snapshot,
                published: false,
                previous: self.store.current(channel).await?,
                pruned: Vec::new(),
                recovered,
            });
        }
        snapshot.status = SnapshotStatus::Validated;
        snapshot.touch();
        self.store.save(&snapshot).await?;

        // Publish
        self.materialize_views(&snapshot, &records, &cache, &build.outcomes).await?;
        snapshot.status = SnapshotStatus::Published;
        snapshot.finished_at = Some(Utc::now());
        snapshot.touch();
        self.store.save(&snapshot).await?;
        let previous = self.store.publish(&snapshot).await?;
        self.journal
            .record("snapshot.published", &json!({"id": id, "channel": channel, "previous": previous}))
            .await;

        let pruned = self
            .store
            .apply_retention(channel, self.config.retention.keep)
            .await?;
        if !pruned.is_empty() {
            self.journal
                .record("snapshot.pruned", &json!({"channel": channel, "ids": pruned}))
                .await;
        }

        Ok(UpdateReport {
            snapshot,
            published: true,
            previous,
            pruned,
            recovered,
        })
    }

    /// Layer id to lock digest of the channel's current snapshot
    async fn previous_digests(&self, channel: crate::config::Channel) -> HashMap<String, String> {
        let current = match self.store.resolve(None, channel).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!("No previous snapshot to compare against: {}", e);
                return HashMap::new();
            }
        };
        match current.lock_records().await {
            Ok(records) => records
                .iter()
                .map(|r| (r.layer_id(), r.digest()))
                .collect(),
            Err(e) => {
                warn!("Could not read lock records of {}: {}", current.id, e);
                HashMap::new()
            }
        }
    }

    async fn concretize_env(
        &self,
        concretizer: &Concretizer,
        snapshot_dir: &Path,
        work_root: &Path,
        name: &str,
        spec: &EnvironmentSpec,
        previous: &HashMap<String, String>,
    ) -> ByoeResult<(EnvOutcome, Vec<LockRecord>)> {
        let mut layers = Vec::with_capacity(spec.layers.len());
        let mut records: Vec<LockRecord> = Vec::new();
        let mut blocked = false;

        for (index, layer) in spec.layers.iter().enumerate() {
            let mut outcome = LayerOutcome::pending(index, layer.kind, layer.is_required());
            outcome.ecosystem = layer.ecosystem();
            if blocked {
                outcome.status = LayerStatus::Skipped;
                layers.push(outcome);
                continue;
            }

            let workdir = work_root.join(name).join(outcome.name());
            match concretizer
                .concretize(name, index, layer, &workdir, &records)
                .await
            {
                Ok(record) => {
                    let rel = Snapshot::lock_path(name, &record);
                    record.save(&snapshot_dir.join(&rel)).await?;
                    let digest = record.digest();
                    outcome.unchanged = previous.get(&record.layer_id()) == Some(&digest);
                    outcome.node_count = record.nodes.len();
                    outcome.lock = Some(rel);
                    outcome.lock_digest = Some(digest);
                    records.push(record);
                }
                Err(e) => {
                    warn!("Concretizing {}/{} failed: {}", name, outcome.name(), e);
                    outcome.status = LayerStatus::Failed;
                    outcome.error = Some(e.to_string());
                    blocked = outcome.required;
                }
            }
            layers.push(outcome);
        }

        let env = EnvOutcome {
            name: name.to_string(),
            required: spec.required,
            best_effort: spec.best_effort,
            status: evaluate_env(&layers, spec.best_effort),
            layers,
        };
        Ok((env, records))
    }

    /// One request per distinct node across all lock records
    fn build_requests(&self, id: &SnapId, work_root: &Path, records: &Records) -> Vec<BuildRequest> {
        let logs = self.config.storage.logs_dir().join(id.to_string());
        let mut seen: HashSet<&NodeHash> = HashSet::new();
        let mut requests = Vec::new();
        for ((env, _), record) in records {
            let workdir = work_root
                .join(env)
                .join(format!("{}-{}", record.record.index, record.record.kind));
            for node in &record.nodes {
                if !seen.insert(&node.hash) {
                    continue;
                }
                requests.push(BuildRequest {
                    node: node.clone(),
                    workdir: workdir.clone(),
                    log_path: logs.join(format!("{}-{}.log", node.name, node.hash.short())),
                });
            }
        }
        debug!("{} distinct nodes across {} lock records", requests.len(), records.len());
        requests
    }

    /// Symlink every built node of every usable layer into
    /// `views/<env>/<kind>/<pkg>`
    async fn materialize_views(
        &self,
        snapshot: &Snapshot,
        records: &Records,
        cache: &BuildCache,
        outcomes: &BTreeMap<NodeHash, NodeOutcome>,
    ) -> ByoeResult<()> {
        for env in snapshot.envs.values() {
            if env.status == crate::snapshot::state::EnvStatus::Failed {
                continue;
            }
            for layer in &env.layers {
                if !matches!(layer.status, LayerStatus::Succeeded | LayerStatus::Partial) {
                    continue;
                }
                let Some(record) = records.get(&(env.name.clone(), layer.index)) else {
                    continue;
                };
                let dir = snapshot.views_dir().join(&env.name).join(layer.kind.as_str());
                fs::create_dir_all(&dir)
                    .await
                    .map_err(|e| ByoeError::io(format!("creating {}", dir.display()), e))?;

                for node in &record.nodes {
                    if !outcomes.get(&node.hash).is_some_and(NodeOutcome::is_success) {
                        continue;
                    }
                    let Some(entry) = cache.lookup(&node.hash).await? else {
                        warn!("{} vanished from the cache before publish", node.label());
                        continue;
                    };
                    let mut link = dir.join(&node.name);
                    if fs::symlink_metadata(&link).await.is_ok() {
                        link = dir.join(format!("{}-{}", node.name, node.hash.short()));
                    }
                    fs::symlink(&entry.artifact, &link)
                        .await
                        .map_err(|e| ByoeError::io(format!("linking {}", link.display()), e))?;
                }
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &SnapId, error: &ByoeError) {
        let Ok(mut snapshot) = self.store.load(id).await else {
            return;
        };
        snapshot.status = SnapshotStatus::Failed;
        snapshot.finished_at = Some(Utc::now());
        snapshot.touch();
        if let Err(e) = self.store.save(&snapshot).await {
            warn!("Could not record failure of {}: {}", id, e);
        }
        self.journal
            .record("snapshot.failed", &json!({"id": id, "error": error.to_string()}))
            .await;
    }
}

/// Fold node outcomes into layer and environment statuses
fn apply_outcomes(
    snapshot: &mut Snapshot,
    records: &Records,
    outcomes: &BTreeMap<NodeHash, NodeOutcome>,
) {
    for env in snapshot.envs.values_mut() {
        for layer in env.layers.iter_mut() {
            if layer.status != LayerStatus::Pending {
                continue;
            }
            let Some(record) = records.get(&(env.name.clone(), layer.index)) else {
                continue;
            };
            layer.failed_nodes = record
                .nodes
                .iter()
                .filter_map(|node| {
                    let (reason, log, job_id) = match outcomes.get(&node.hash) {
                        Some(o) if o.is_success() => return None,
                        Some(NodeOutcome::Failed { reason, log, job_id }) => {
                            (reason.clone(), log.clone(), job_id.clone())
                        }
                        _ => ("not built".to_string(), None::<PathBuf>, None),
                    };
                    Some(FailedNode {
                        hash: node.hash.clone(),
                        name: node.name.clone(),
                        version: node.version.clone(),
                        ecosystem: node.ecosystem,
                        reason,
                        log,
                        job_id,
                    })
                })
                .collect();
            layer.status = layer_status(record.nodes.len(), layer.failed_nodes.len());
        }
        env.status = evaluate_env(&env.layers, env.best_effort);
    }
}
