//! Build scheduling
//!
//! The scheduler takes the concrete nodes a snapshot needs and drives them
//! to a terminal outcome. Cache hits end immediately. Everything else is
//! reserved in the cache once its dependencies are available, batched
//! into jobs and handed to a [`BuildBackend`]. The control loop sleeps
//! between polls and never busy-waits.

pub mod backend;
pub mod job;
mod local;
mod retry;
mod slurm;

pub use backend::{create_backend, BatchLimits, BuildBackend, JobStatus};
pub use job::{recover_orphaned_jobs, BuildJob, BuildTask, Recovery, TaskResult};
pub use local::LocalBackend;
pub use retry::{backoff_delay, with_retry};
pub use slurm::SlurmBackend;

use crate::cache::{BuildCache, Lease, Reservation};
use crate::concretize::{BuildMetadata, ConcreteNode, NodeHash};
use crate::config::schema::INSTALL_PHASE;
use crate::config::SiteConfig;
use crate::ecosystem::AdapterSet;
use crate::error::{ByoeError, ByoeResult};
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// A node the snapshot needs, with where its build output goes
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub node: ConcreteNode,
    pub workdir: PathBuf,
    pub log_path: PathBuf,
}

/// Terminal state of one node
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOutcome {
    /// Already in the cache
    Cached,
    /// Built and committed in this run
    Built(BuildMetadata),
    Failed {
        reason: String,
        log: Option<PathBuf>,
        job_id: Option<String>,
    },
}

impl NodeOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
            log: None,
            job_id: None,
        }
    }
}

/// Result of one scheduler run
#[derive(Debug, Default)]
pub struct BuildReport {
    pub outcomes: BTreeMap<NodeHash, NodeOutcome>,

    /// Nodes built and committed by this run
    pub installs: usize,

    pub aborted: bool,
}

impl BuildReport {
    pub fn failed(&self) -> impl Iterator<Item = (&NodeHash, &NodeOutcome)> {
        self.outcomes.iter().filter(|(_, o)| !o.is_success())
    }
}

struct InFlight {
    job: BuildJob,
    leases: Vec<Lease>,

    /// Taken over from a run that went away; a run does not wait for these
    adopted: bool,
}

enum Readiness {
    Ready,
    Blocked,
    Failed(String),
}

/// Drives concrete nodes through the cache and a build backend
pub struct JobScheduler {
    config: Arc<SiteConfig>,
    cache: BuildCache,
    adapters: Arc<AdapterSet>,
    backend: Arc<dyn BuildBackend>,
    adopted: Mutex<Vec<InFlight>>,
}

impl JobScheduler {
    pub fn new(
        config: Arc<SiteConfig>,
        cache: BuildCache,
        adapters: Arc<AdapterSet>,
        backend: Arc<dyn BuildBackend>,
    ) -> Self {
        Self {
            config,
            cache,
            adapters,
            backend,
            adopted: Mutex::new(Vec::new()),
        }
    }

    pub fn cache(&self) -> &BuildCache {
        &self.cache
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.backend_name()
    }

    /// Commit work left behind by runs that died or were aborted.
    ///
    /// Jobs the backend still runs are taken over and harvested by the
    /// next [`run`](Self::run). Returns the number of artifacts committed.
    pub async fn recover_orphans(&self) -> ByoeResult<usize> {
        let recovery = recover_orphaned_jobs(&self.cache, &*self.backend).await?;
        let flights = recovery
            .adopted
            .into_iter()
            .map(|(job, leases)| InFlight {
                job,
                leases,
                adopted: true,
            });
        self.adopted_jobs()?.extend(flights);
        Ok(recovery.committed)
    }

    fn adopted_jobs(&self) -> ByoeResult<std::sync::MutexGuard<'_, Vec<InFlight>>> {
        self.adopted
            .lock()
            .map_err(|_| ByoeError::Internal("adopted job table poisoned".to_string()))
    }

    /// Build every requested node that is not cached yet.
    ///
    /// Node failures are recorded in the report; only cache or filesystem
    /// problems abort the run with an error. Flipping `abort` to `true`
    /// cancels queued work and drains in-flight jobs for the grace period.
    pub async fn run(
        &self,
        requests: Vec<BuildRequest>,
        mut abort: watch::Receiver<bool>,
    ) -> ByoeResult<BuildReport> {
        let mut report = BuildReport::default();
        let labels: HashMap<NodeHash, String> = requests
            .iter()
            .map(|r| (r.node.hash.clone(), r.node.label()))
            .collect();
        let mut pending: BTreeMap<NodeHash, BuildRequest> = requests
            .into_iter()
            .map(|r| (r.node.hash.clone(), r))
            .collect();
        let mut waiting_since: HashMap<NodeHash, Instant> = HashMap::new();
        let mut ready: Vec<(BuildTask, Lease)> = Vec::new();
        let mut inflight: Vec<InFlight> = std::mem::take(&mut *self.adopted_jobs()?);

        let poll = Duration::from_millis(self.config.build.poll_interval_ms);
        let heartbeat_every = Duration::from_secs(self.config.lease.heartbeat_secs.max(1));
        let grace = Duration::from_secs(self.config.build.abort_grace_secs);
        let mut last_heartbeat = Instant::now();
        let mut abort_deadline: Option<Instant> = None;
        let mut abort_closed = false;

        info!(
            "Scheduling {} nodes on the {} backend",
            pending.len(),
            self.backend.backend_name()
        );

        loop {
            if abort_deadline.is_none() && *abort.borrow() {
                warn!("Abort requested, draining in-flight jobs for up to {:?}", grace);
                report.aborted = true;
                abort_deadline = Some(Instant::now() + grace);

                for (task, lease) in ready.drain(..) {
                    self.release(lease, &task.staging).await;
                    report
                        .outcomes
                        .insert(task.node.hash.clone(), NodeOutcome::failed("aborted before submission"));
                }
                for hash in std::mem::take(&mut pending).into_keys() {
                    report.outcomes.insert(hash, NodeOutcome::failed("aborted"));
                }
                waiting_since.clear();
                for flight in inflight.iter().filter(|f| !f.adopted) {
                    if let Err(e) = self.backend.cancel(&flight.job).await {
                        warn!("Could not cancel job {}: {}", flight.job.short_id(), e);
                    }
                }
            }

            if abort_deadline.is_none() {
                let progressed = self
                    .schedule(&mut pending, &labels, &mut waiting_since, &mut ready, &mut report)
                    .await?;
                self.submit_ready(&mut ready, &mut inflight, &mut report).await;

                if !progressed
                    && ready.is_empty()
                    && inflight.is_empty()
                    && waiting_since.is_empty()
                    && !pending.is_empty()
                {
                    for hash in std::mem::take(&mut pending).into_keys() {
                        report
                            .outcomes
                            .insert(hash, NodeOutcome::failed("dependencies never became available"));
                    }
                }
            }

            if pending.is_empty() && ready.is_empty() && inflight.iter().all(|f| f.adopted) {
                break;
            }

            if let Some(deadline) = abort_deadline {
                if Instant::now() >= deadline {
                    for flight in inflight.drain(..) {
                        if flight.adopted {
                            self.adopted_jobs()?.push(flight);
                            continue;
                        }
                        warn!(
                            "Job {} still running after abort, leaving it for the next run",
                            flight.job.short_id()
                        );
                        for task in &flight.job.tasks {
                            report.outcomes.insert(
                                task.node.hash.clone(),
                                NodeOutcome::Failed {
                                    reason: "aborted while building".to_string(),
                                    log: Some(task.log_path.clone()),
                                    job_id: flight.job.handle.clone(),
                                },
                            );
                        }
                    }
                    break;
                }
            }

            if !inflight.is_empty() || !waiting_since.is_empty() {
                let wait = match abort_deadline {
                    Some(deadline) => poll.min(deadline.saturating_duration_since(Instant::now())),
                    None => poll,
                };
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = abort.changed(), if abort_deadline.is_none() && !abort_closed => {
                        if changed.is_err() {
                            abort_closed = true;
                        }
                    }
                }
            }

            self.harvest(&mut inflight, &mut report).await;

            if last_heartbeat.elapsed() >= heartbeat_every {
                self.heartbeat(&mut inflight, &mut ready).await;
                last_heartbeat = Instant::now();
            }
        }

        let leftover: Vec<InFlight> = inflight.into_iter().filter(|f| f.adopted).collect();
        if !leftover.is_empty() {
            info!(
                "{} adopted job(s) still running, harvesting them in a later run",
                leftover.len()
            );
            self.adopted_jobs()?.extend(leftover);
        }

        info!(
            "Build finished: {} installed, {} failed",
            report.installs,
            report.failed().count()
        );
        Ok(report)
    }

    async fn readiness(
        &self,
        node: &ConcreteNode,
        labels: &HashMap<NodeHash, String>,
        outcomes: &BTreeMap<NodeHash, NodeOutcome>,
    ) -> ByoeResult<Readiness> {
        for dep in &node.deps {
            match labels.get(dep) {
                Some(label) => match outcomes.get(dep) {
                    Some(outcome) if outcome.is_success() => {}
                    Some(_) => return Ok(Readiness::Failed(format!("dependency {label} failed"))),
                    None => return Ok(Readiness::Blocked),
                },
                None => {
                    if self.cache.lookup(dep).await?.is_none() {
                        return Ok(Readiness::Failed(format!(
                            "dependency {} is neither requested nor cached",
                            dep.short()
                        )));
                    }
                }
            }
        }
        Ok(Readiness::Ready)
    }

    /// Reserve every pending node whose dependencies are available
    async fn schedule(
        &self,
        pending: &mut BTreeMap<NodeHash, BuildRequest>,
        labels: &HashMap<NodeHash, String>,
        waiting_since: &mut HashMap<NodeHash, Instant>,
        ready: &mut Vec<(BuildTask, Lease)>,
        report: &mut BuildReport,
    ) -> ByoeResult<bool> {
        let wait_timeout = Duration::from_secs(self.config.lease.wait_timeout_secs);
        let mut progressed = false;
        let hashes: Vec<NodeHash> = pending.keys().cloned().collect();

        for hash in hashes {
            let Some(request) = pending.get(&hash) else {
                continue;
            };
            match self.readiness(&request.node, labels, &report.outcomes).await? {
                Readiness::Blocked => continue,
                Readiness::Failed(reason) => {
                    debug!("{} cannot build: {}", request.node.label(), reason);
                    pending.remove(&hash);
                    waiting_since.remove(&hash);
                    report.outcomes.insert(hash, NodeOutcome::failed(reason));
                    progressed = true;
                    continue;
                }
                Readiness::Ready => {}
            }

            match self.cache.reserve(&hash).await {
                Ok(Reservation::Cached(_)) => {
                    debug!("Cache hit for {}", request.node.label());
                    pending.remove(&hash);
                    waiting_since.remove(&hash);
                    report.outcomes.insert(hash, NodeOutcome::Cached);
                    progressed = true;
                }
                Ok(Reservation::Granted(lease)) => {
                    waiting_since.remove(&hash);
                    progressed = true;
                    let staging = match self.stage(&lease, request).await {
                        Ok(dir) => dir,
                        Err(e) => {
                            error!("Preparing {} failed: {}", request.node.label(), e);
                            if let Err(release) = self.cache.abandon(lease, None).await {
                                warn!("{}", release);
                            }
                            pending.remove(&hash);
                            report.outcomes.insert(hash, NodeOutcome::failed(e.to_string()));
                            continue;
                        }
                    };
                    if let Some(request) = pending.remove(&hash) {
                        ready.push((
                            BuildTask {
                                node: request.node,
                                workdir: request.workdir,
                                staging,
                                log_path: request.log_path,
                            },
                            lease,
                        ));
                    }
                }
                Ok(Reservation::AlreadyBuilding(info)) => {
                    let since = *waiting_since.entry(hash.clone()).or_insert_with(Instant::now);
                    // Our own holds belong to adopted jobs, which end on their own
                    if info.holder != self.cache.holder() && since.elapsed() > wait_timeout {
                        let err = ByoeError::lease(
                            &hash,
                            format!("still held by {} on {} after {:?}", info.holder, info.host, wait_timeout),
                        );
                        pending.remove(&hash);
                        waiting_since.remove(&hash);
                        report.outcomes.insert(hash, NodeOutcome::failed(err.to_string()));
                        progressed = true;
                    } else {
                        debug!(
                            "{} is being built by {} on {}, waiting",
                            request.node.label(),
                            info.holder,
                            info.host
                        );
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!("Reserving {} failed, will retry: {}", request.node.label(), e);
                    waiting_since.entry(hash).or_insert_with(Instant::now);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(progressed)
    }

    /// Staging directory and log directory for a granted node
    async fn stage(&self, lease: &Lease, request: &BuildRequest) -> ByoeResult<PathBuf> {
        if let Some(parent) = request.log_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ByoeError::io(format!("creating {}", parent.display()), e))?;
        }
        self.cache.prepare_staging(lease).await
    }

    /// Batch ready tasks into jobs while backend capacity allows
    async fn submit_ready(
        &self,
        ready: &mut Vec<(BuildTask, Lease)>,
        inflight: &mut Vec<InFlight>,
        report: &mut BuildReport,
    ) {
        let limits = self.backend.limits();
        while inflight.len() < limits.max_jobs.max(1) && !ready.is_empty() {
            let take = ready.len().min(limits.tasks_per_job.max(1));
            let (tasks, leases): (Vec<BuildTask>, Vec<Lease>) = ready.drain(..take).unzip();
            let cpus = self.backend.cpus_per_task(tasks.len());
            let mut job = BuildJob::new(
                &self.cache.jobs_dir(),
                INSTALL_PHASE,
                self.backend.backend_name(),
                self.cache.holder(),
                tasks,
                self.backend.scratch_dir(),
                cpus,
            );

            let submitted = match job.write_manifest().await {
                Ok(()) => {
                    let job_ref = &job;
                    with_retry(&self.config.build.retry, "job submission", || {
                        self.backend.submit(job_ref)
                    })
                    .await
                }
                Err(e) => Err(e),
            };

            match submitted {
                Ok(handle) => {
                    debug!("Job {} submitted as {}", job.short_id(), handle);
                    job.handle = Some(handle);
                    if let Err(e) = job.write_manifest().await {
                        warn!("Could not record handle of job {}: {}", job.short_id(), e);
                    }
                    inflight.push(InFlight {
                        job,
                        leases,
                        adopted: false,
                    });
                }
                Err(e) => {
                    error!("Submitting job {} failed: {}", job.short_id(), e);
                    for (task, lease) in job.tasks.iter().zip(leases) {
                        self.release(lease, &task.staging).await;
                        report.outcomes.insert(
                            task.node.hash.clone(),
                            NodeOutcome::Failed {
                                reason: e.to_string(),
                                log: Some(task.log_path.clone()),
                                job_id: None,
                            },
                        );
                    }
                    job.remove().await;
                }
            }
        }
    }

    /// Poll in-flight jobs and collect the finished ones
    async fn harvest(&self, inflight: &mut Vec<InFlight>, report: &mut BuildReport) {
        let mut still_running = Vec::with_capacity(inflight.len());
        for flight in inflight.drain(..) {
            let job = &flight.job;
            let status = with_retry(&self.config.build.retry, "job poll", || {
                self.backend.poll(job)
            })
            .await;
            match status {
                Ok(JobStatus::Finished) => self.collect(flight, report).await,
                Ok(_) => still_running.push(flight),
                Err(e) => {
                    error!("Lost track of job {}: {}", flight.job.short_id(), e);
                    if let Err(e) = self.backend.cancel(&flight.job).await {
                        debug!("Cancel after poll failure: {}", e);
                    }
                    let InFlight { job, leases, .. } = flight;
                    for (task, lease) in job.tasks.iter().zip(leases) {
                        self.release(lease, &task.staging).await;
                        report.outcomes.insert(
                            task.node.hash.clone(),
                            NodeOutcome::Failed {
                                reason: e.to_string(),
                                log: Some(task.log_path.clone()),
                                job_id: job.handle.clone(),
                            },
                        );
                    }
                }
            }
        }
        *inflight = still_running;
    }

    /// Commit verified successes of a finished job and record failures.
    ///
    /// Errors stay with the node they happened to; the other tasks of the
    /// job are still committed.
    async fn collect(&self, flight: InFlight, report: &mut BuildReport) {
        let InFlight { job, leases, .. } = flight;
        let mut all_committed = true;

        for (task, lease) in job.tasks.iter().zip(leases) {
            let node = &task.node;
            let result = job.read_status(&node.hash).await;
            let verified = match &result {
                Some(r) if r.succeeded => self.verify(task).await,
                _ => false,
            };

            match result {
                Some(r) if verified => {
                    let build = BuildMetadata {
                        duration_ms: r.duration_ms,
                        backend: job.backend.clone(),
                        job_id: job.handle.clone(),
                        built_at: Utc::now(),
                    };
                    match self.cache.commit(lease, node, &task.staging, build.clone()).await {
                        Ok(_) => {
                            report.installs += 1;
                            report.outcomes.insert(node.hash.clone(), NodeOutcome::Built(build));
                        }
                        Err(e) => {
                            all_committed = false;
                            error!("Committing {} failed: {}", node.label(), e);
                            report.outcomes.insert(
                                node.hash.clone(),
                                NodeOutcome::Failed {
                                    reason: format!("commit failed: {e}"),
                                    log: Some(task.log_path.clone()),
                                    job_id: job.handle.clone(),
                                },
                            );
                        }
                    }
                }
                other => {
                    all_committed = false;
                    let reason = match other {
                        Some(r) if r.succeeded => {
                            "install reported success but the prefix failed verification".to_string()
                        }
                        Some(r) => r.reason.unwrap_or_else(|| "install failed".to_string()),
                        None => "job ended without reporting a status".to_string(),
                    };
                    warn!(
                        "{} failed: {} (log: {})",
                        node.label(),
                        reason,
                        task.log_path.display()
                    );
                    self.release(lease, &task.staging).await;
                    report.outcomes.insert(
                        node.hash.clone(),
                        NodeOutcome::Failed {
                            reason,
                            log: Some(task.log_path.clone()),
                            job_id: job.handle.clone(),
                        },
                    );
                }
            }
        }

        if all_committed {
            job.remove().await;
        } else {
            info!("Keeping failed job directory {}", job.dir.display());
        }
    }

    /// Give a lease back; a failure here only concerns that node
    async fn release(&self, lease: Lease, staging: &std::path::Path) {
        if let Err(e) = self.cache.abandon(lease, Some(staging)).await {
            warn!("{}", e);
        }
    }

    async fn verify(&self, task: &BuildTask) -> bool {
        let adapter = match self.adapters.get(task.node.ecosystem) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };
        match adapter.query(&task.node, &task.prefix()).await {
            Ok(found) => found,
            Err(e) => {
                warn!("Verifying {} failed: {}", task.node.label(), e);
                false
            }
        }
    }

    async fn heartbeat(&self, inflight: &mut [InFlight], ready: &mut [(BuildTask, Lease)]) {
        let leases = inflight
            .iter_mut()
            .flat_map(|f| f.leases.iter_mut())
            .chain(ready.iter_mut().map(|(_, lease)| lease));
        for lease in leases {
            if let Err(e) = self.cache.heartbeat(lease).await {
                warn!("{}", e);
            }
        }
    }
}
