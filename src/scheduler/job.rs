//! Build jobs and their on-disk state
//!
//! Every job owns a directory under the cache's `jobs/`:
//! `manifest.json` describes the tasks, and each task leaves a
//! `<hash>.status` file when it ends. Status files are plain text so a
//! batch script can write them with `printf`:
//!
//! ```text
//! succeeded
//! 183042
//! ```
//!
//! Line one is `succeeded` or `failed`, line two the duration in
//! milliseconds, anything after that a failure reason.

use crate::cache::{hostname, BuildCache, Lease, Reservation};
use crate::concretize::record::write_atomic;
use crate::concretize::{BuildMetadata, ConcreteNode, NodeHash};
use crate::ecosystem::InstallContext;
use crate::error::{ByoeError, ByoeResult};
use crate::scheduler::backend::{BuildBackend, JobStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MANIFEST_FILE: &str = "manifest.json";

/// One node to build inside a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildTask {
    pub node: ConcreteNode,

    /// Layer workdir the node was concretized in
    pub workdir: PathBuf,

    /// Staging directory from the cache; the install prefix lives inside
    pub staging: PathBuf,

    pub log_path: PathBuf,
}

impl BuildTask {
    pub fn prefix(&self) -> PathBuf {
        BuildCache::staged_prefix(&self.staging)
    }
}

/// A batch of tasks submitted to a backend as one unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub id: String,
    pub phase: String,
    pub backend: String,

    /// Cache holder id of the run that submitted the job
    pub owner: Uuid,
    pub host: String,
    pub pid: u32,

    pub tasks: Vec<BuildTask>,

    /// Backend job id once submitted
    #[serde(default)]
    pub handle: Option<String>,

    pub submitted_at: DateTime<Utc>,
    pub scratch_dir: Option<PathBuf>,

    /// Parallelism granted to each task
    pub cpus_per_task: usize,

    #[serde(skip)]
    pub dir: PathBuf,
}

impl BuildJob {
    pub fn new(
        jobs_root: &Path,
        phase: &str,
        backend: &str,
        owner: Uuid,
        tasks: Vec<BuildTask>,
        scratch_dir: Option<PathBuf>,
        cpus_per_task: usize,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            dir: jobs_root.join(&id),
            id,
            phase: phase.to_string(),
            backend: backend.to_string(),
            owner,
            host: hostname(),
            pid: std::process::id(),
            tasks,
            handle: None,
            submitted_at: Utc::now(),
            scratch_dir,
            cpus_per_task: cpus_per_task.max(1),
        }
    }

    pub fn short_id(&self) -> &str {
        &self.id[..self.id.len().min(8)]
    }

    pub fn status_path(&self, hash: &NodeHash) -> PathBuf {
        self.dir.join(format!("{}.status", hash))
    }

    /// Install context handed to the ecosystem adapter
    pub fn install_context(&self, task: &BuildTask) -> InstallContext {
        InstallContext {
            prefix: task.prefix(),
            workdir: task.workdir.clone(),
            log_path: task.log_path.clone(),
            scratch_dir: self.scratch_dir.clone(),
            jobs: self.cpus_per_task,
        }
    }

    pub async fn write_manifest(&self) -> ByoeResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| ByoeError::io(format!("creating {}", self.dir.display()), e))?;
        write_atomic(&self.dir.join(MANIFEST_FILE), &serde_json::to_vec_pretty(self)?).await
    }

    pub async fn load(dir: &Path) -> ByoeResult<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = fs::read_to_string(&path)
            .await
            .map_err(|e| ByoeError::io(format!("reading {}", path.display()), e))?;
        let mut job: BuildJob = serde_json::from_str(&content)?;
        job.dir = dir.to_path_buf();
        Ok(job)
    }

    /// Result a task reported, if it got that far
    pub async fn read_status(&self, hash: &NodeHash) -> Option<TaskResult> {
        let content = fs::read_to_string(self.status_path(hash)).await.ok()?;
        TaskResult::parse(&content)
    }

    pub async fn write_status(&self, hash: &NodeHash, result: &TaskResult) -> ByoeResult<()> {
        write_atomic(&self.status_path(hash), result.to_text().as_bytes()).await
    }

    /// Drop the job directory; failed jobs are kept for diagnosis
    pub async fn remove(&self) {
        if let Err(e) = fs::remove_dir_all(&self.dir).await {
            debug!("Could not remove job dir {}: {}", self.dir.display(), e);
        }
    }
}

/// What a task reported when it ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub succeeded: bool,
    pub duration_ms: u64,
    pub reason: Option<String>,
}

impl TaskResult {
    pub fn success(duration_ms: u64) -> Self {
        Self {
            succeeded: true,
            duration_ms,
            reason: None,
        }
    }

    pub fn failure(duration_ms: u64, reason: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            duration_ms,
            reason: Some(reason.into()),
        }
    }

    pub fn to_text(&self) -> String {
        let status = if self.succeeded { "succeeded" } else { "failed" };
        match &self.reason {
            Some(reason) => format!("{}\n{}\n{}\n", status, self.duration_ms, reason),
            None => format!("{}\n{}\n", status, self.duration_ms),
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.lines();
        let succeeded = match lines.next()?.trim() {
            "succeeded" => true,
            "failed" => false,
            _ => return None,
        };
        let duration_ms = lines
            .next()
            .and_then(|l| l.trim().parse().ok())
            .unwrap_or(0);
        let reason = lines.collect::<Vec<_>>().join("\n").trim().to_string();
        let reason = (!reason.is_empty()).then_some(reason);
        Some(Self {
            succeeded,
            duration_ms,
            reason,
        })
    }
}

/// What [`recover_orphaned_jobs`] did
#[derive(Debug, Default)]
pub struct Recovery {
    /// Artifacts committed from finished jobs
    pub committed: usize,

    /// Jobs the backend still runs, now leased to this run
    pub adopted: Vec<(BuildJob, Vec<Lease>)>,
}

/// Settle jobs whose run has gone away.
///
/// A job is orphaned when its owner is not this run and not a live process
/// on this host. The backend is asked about each one first: finished jobs
/// have their successful results committed, while jobs still queued or
/// running are taken over with fresh leases so nobody builds their nodes
/// twice. Jobs the backend cannot report on are left untouched.
pub async fn recover_orphaned_jobs(
    cache: &BuildCache,
    backend: &dyn BuildBackend,
) -> ByoeResult<Recovery> {
    let mut recovery = Recovery::default();
    let jobs_dir = cache.jobs_dir();
    let mut dirs = match fs::read_dir(&jobs_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(recovery),
        Err(e) => return Err(ByoeError::io(format!("reading {}", jobs_dir.display()), e)),
    };

    let me = hostname();
    while let Some(dir) = dirs
        .next_entry()
        .await
        .map_err(|e| ByoeError::io(format!("reading {}", jobs_dir.display()), e))?
    {
        let Ok(job) = BuildJob::load(&dir.path()).await else {
            continue;
        };
        if job.owner == cache.holder()
            || (job.host == me && crate::cache::lease::process_alive(job.pid))
        {
            continue;
        }

        match backend_state(&job, backend).await {
            Some(JobStatus::Finished) => {
                recovery.committed += settle_finished(cache, &job).await?;
            }
            Some(_) => {
                if let Some(adopted) = adopt_running(cache, job).await? {
                    recovery.adopted.push(adopted);
                }
            }
            None => {}
        }
    }
    Ok(recovery)
}

/// Where the backend says an orphaned job is, if it can tell
async fn backend_state(job: &BuildJob, backend: &dyn BuildBackend) -> Option<JobStatus> {
    let Some(handle) = &job.handle else {
        // Never submitted
        return Some(JobStatus::Finished);
    };
    // Local jobs die with the run that started them
    if job.backend == "local" {
        return Some(JobStatus::Finished);
    }
    if job.backend != backend.backend_name() {
        warn!(
            "Job {} ran on the {} backend as {}; leaving it for a {} run to recover",
            job.short_id(),
            job.backend,
            handle,
            job.backend
        );
        return None;
    }
    match backend.poll(job).await {
        Ok(status) => Some(status),
        Err(e) => {
            warn!("Could not ask about orphaned job {}: {}", job.short_id(), e);
            None
        }
    }
}

/// Commit what a finished job built; returns the number of commits
async fn settle_finished(cache: &BuildCache, job: &BuildJob) -> ByoeResult<usize> {
    let mut committed = 0;
    let mut settled = true;
    for task in &job.tasks {
        let hash = &task.node.hash;
        let status = job.read_status(hash).await;
        match cache.reserve(hash).await? {
            Reservation::Cached(_) => {
                if let Err(e) = fs::remove_dir_all(&task.staging).await {
                    debug!("Could not remove {}: {}", task.staging.display(), e);
                }
            }
            Reservation::AlreadyBuilding(_) => settled = false,
            Reservation::Granted(lease) => match status {
                Some(result) if result.succeeded && task.prefix().exists() => {
                    let build = BuildMetadata {
                        duration_ms: result.duration_ms,
                        backend: job.backend.clone(),
                        job_id: job.handle.clone(),
                        built_at: Utc::now(),
                    };
                    match cache.commit(lease, &task.node, &task.staging, build).await {
                        Ok(_) => committed += 1,
                        Err(e) => {
                            warn!("Could not commit {}: {}", task.node.label(), e);
                            settled = false;
                        }
                    }
                }
                _ => {
                    settled = false;
                    if let Err(e) = cache.abandon(lease, Some(&task.staging)).await {
                        warn!("{}", e);
                    }
                }
            },
        }
    }

    if settled {
        info!("Recovered orphaned job {}", job.short_id());
        job.remove().await;
    } else {
        warn!(
            "Keeping job directory {} with unfinished or failed tasks",
            job.dir.display()
        );
    }
    Ok(committed)
}

/// Lease the nodes of a job that is still running to this run
async fn adopt_running(
    cache: &BuildCache,
    mut job: BuildJob,
) -> ByoeResult<Option<(BuildJob, Vec<Lease>)>> {
    let mut tasks = Vec::new();
    let mut leases = Vec::new();
    for task in std::mem::take(&mut job.tasks) {
        match cache.reserve(&task.node.hash).await? {
            Reservation::Granted(lease) => {
                tasks.push(task);
                leases.push(lease);
            }
            Reservation::Cached(_) => {}
            Reservation::AlreadyBuilding(info) => debug!(
                "{} of job {} is held by {} on {}",
                task.node.label(),
                job.short_id(),
                info.holder,
                info.host
            ),
        }
    }
    if tasks.is_empty() {
        return Ok(None);
    }

    job.tasks = tasks;
    job.owner = cache.holder();
    job.host = hostname();
    job.pid = std::process::id();
    if let Err(e) = job.write_manifest().await {
        warn!("Could not record takeover of job {}: {}", job.short_id(), e);
    }
    info!(
        "Job {} is still running, taking over {} task(s)",
        job.short_id(),
        job.tasks.len()
    );
    Ok(Some((job, leases)))
}
