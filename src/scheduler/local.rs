//! Local backend: installs run as child processes of this run

use crate::ecosystem::AdapterSet;
use crate::error::{ByoeError, ByoeResult};
use crate::scheduler::backend::{BatchLimits, BuildBackend, JobStatus};
use crate::scheduler::job::{BuildJob, TaskResult};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Runs install jobs on this machine, bounded by a semaphore
pub struct LocalBackend {
    adapters: Arc<AdapterSet>,
    max_tasks: usize,
    scratch_dir: Option<PathBuf>,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LocalBackend {
    pub fn new(adapters: Arc<AdapterSet>, max_tasks: usize) -> Self {
        let max_tasks = max_tasks.max(1);
        Self {
            adapters,
            max_tasks,
            scratch_dir: None,
            permits: Arc::new(Semaphore::new(max_tasks)),
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_scratch_dir(mut self, scratch_dir: Option<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir;
        self
    }
}

async fn run_job(job: BuildJob, adapters: Arc<AdapterSet>, permits: Arc<Semaphore>) {
    let tasks = job.tasks.iter().map(|task| {
        let job = &job;
        let adapters = &adapters;
        let permits = &permits;
        async move {
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            let start = Instant::now();
            let outcome = match adapters.get(task.node.ecosystem) {
                Ok(adapter) => adapter.install(&task.node, &job.install_context(task)).await,
                Err(e) => Err(e),
            };
            let elapsed = start.elapsed().as_millis() as u64;
            let result = match outcome {
                Ok(()) => TaskResult::success(elapsed),
                Err(e) => TaskResult::failure(elapsed, e.to_string()),
            };
            if let Err(e) = job.write_status(&task.node.hash, &result).await {
                debug!("Could not write status for {}: {}", task.node.name, e);
            }
        }
    });
    join_all(tasks).await;
}

#[async_trait]
impl BuildBackend for LocalBackend {
    fn backend_name(&self) -> &'static str {
        "local"
    }

    fn limits(&self) -> BatchLimits {
        BatchLimits {
            tasks_per_job: 1,
            max_jobs: self.max_tasks,
        }
    }

    /// The machine's CPUs shared between concurrent installs
    fn cpus_per_task(&self, _tasks: usize) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        (cpus / self.max_tasks).max(1)
    }

    fn scratch_dir(&self) -> Option<PathBuf> {
        self.scratch_dir.clone()
    }

    async fn submit(&self, job: &BuildJob) -> ByoeResult<String> {
        let handle = format!("local-{}", job.short_id());
        let task = tokio::spawn(run_job(
            job.clone(),
            self.adapters.clone(),
            self.permits.clone(),
        ));
        self.running
            .lock()
            .map_err(|_| ByoeError::Internal("local job table poisoned".to_string()))?
            .insert(job.id.clone(), task);
        debug!("Started local job {}", handle);
        Ok(handle)
    }

    async fn poll(&self, job: &BuildJob) -> ByoeResult<JobStatus> {
        let mut running = self
            .running
            .lock()
            .map_err(|_| ByoeError::Internal("local job table poisoned".to_string()))?;
        match running.get(&job.id) {
            Some(handle) if !handle.is_finished() => Ok(JobStatus::Running),
            _ => {
                running.remove(&job.id);
                Ok(JobStatus::Finished)
            }
        }
    }

    async fn cancel(&self, job: &BuildJob) -> ByoeResult<()> {
        let handle = self
            .running
            .lock()
            .map_err(|_| ByoeError::Internal("local job table poisoned".to_string()))?
            .remove(&job.id);
        if let Some(handle) = handle {
            // Child processes are spawned with kill_on_drop
            handle.abort();
        }
        Ok(())
    }
}
