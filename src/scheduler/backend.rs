//! Build backend abstraction
//!
//! A backend runs whole jobs. The scheduler decides what goes into a job;
//! the backend only knows how to start it, ask about it and stop it.

use crate::config::schema::INSTALL_PHASE;
use crate::config::SiteConfig;
use crate::ecosystem::AdapterSet;
use crate::error::ByoeResult;
use crate::scheduler::job::BuildJob;
use crate::scheduler::local::LocalBackend;
use crate::scheduler::slurm::SlurmBackend;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Coarse job state as the backend sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Running,
    /// Done one way or another; task status files tell the rest
    Finished,
}

/// How the scheduler should batch work for a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub tasks_per_job: usize,
    pub max_jobs: usize,
}

/// Where install jobs run
#[async_trait]
pub trait BuildBackend: Send + Sync {
    fn backend_name(&self) -> &'static str;

    fn limits(&self) -> BatchLimits;

    /// Parallelism each task of a job of `tasks` tasks may use
    fn cpus_per_task(&self, tasks: usize) -> usize;

    /// Exported as TMPDIR to installs
    fn scratch_dir(&self) -> Option<PathBuf>;

    /// Start a job and return the backend's handle for it
    async fn submit(&self, job: &BuildJob) -> ByoeResult<String>;

    async fn poll(&self, job: &BuildJob) -> ByoeResult<JobStatus>;

    /// Best-effort cancellation
    async fn cancel(&self, job: &BuildJob) -> ByoeResult<()>;
}

/// Pick the backend the configuration asks for.
///
/// Inside a Slurm allocation the allocation is reused: installs run
/// locally with as many tasks as the node has CPUs instead of nesting
/// `sbatch`.
pub fn create_backend(config: &SiteConfig, adapters: Arc<AdapterSet>) -> Arc<dyn BuildBackend> {
    let batch = &config.build.batch;
    let phase = batch.phase(INSTALL_PHASE);

    if batch.enabled && phase.enabled {
        if let Some(cpus) = allocation_cpus() {
            info!("Inside a Slurm allocation, building locally with {} tasks", cpus);
            return Arc::new(
                LocalBackend::new(adapters, cpus).with_scratch_dir(config.build.scratch_dir.clone()),
            );
        }
        debug!("Using Slurm backend for {}", INSTALL_PHASE);
        return Arc::new(SlurmBackend::new(
            batch.clone(),
            phase,
            config.build.scratch_dir.clone(),
            adapters,
        ));
    }

    Arc::new(
        LocalBackend::new(adapters, config.build.max_tasks)
            .with_scratch_dir(config.build.scratch_dir.clone()),
    )
}

fn allocation_cpus() -> Option<usize> {
    std::env::var("SLURM_CPUS_ON_NODE")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .filter(|&n| n > 0)
}
