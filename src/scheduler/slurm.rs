//! Slurm backend: one `sbatch` job per batch of installs
//!
//! The job script runs every task in the background and waits. Each task
//! appends to its own log and leaves a status file in the job directory,
//! which is all the scheduler reads back.

use crate::config::schema::{BatchConfig, PhaseConfig};
use crate::ecosystem::{run_capture, shell_quote, AdapterSet, CommandLine};
use crate::error::{ByoeError, ByoeResult};
use crate::scheduler::backend::{BatchLimits, BuildBackend, JobStatus};
use crate::scheduler::job::BuildJob;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

const BACKEND: &str = "slurm";
const SCRIPT_FILE: &str = "job.sh";

/// Submits install batches with `sbatch` and tracks them with `squeue`
pub struct SlurmBackend {
    batch: BatchConfig,
    phase: PhaseConfig,
    scratch_dir: Option<PathBuf>,
    adapters: Arc<AdapterSet>,
}

impl SlurmBackend {
    pub fn new(
        batch: BatchConfig,
        phase: PhaseConfig,
        scratch_dir: Option<PathBuf>,
        adapters: Arc<AdapterSet>,
    ) -> Self {
        Self {
            batch,
            phase,
            scratch_dir,
            adapters,
        }
    }

    /// Render the batch script for a job
    pub fn script(&self, job: &BuildJob) -> ByoeResult<String> {
        let dir = job.dir.display().to_string();
        let mut script = String::from("#!/bin/bash\n");
        script.push_str(&format!("#SBATCH --job-name=byoe-{}\n", job.short_id()));
        script.push_str(&format!(
            "#SBATCH --output={}\n",
            shell_quote(&format!("{}/slurm-%j.out", dir))
        ));
        script.push_str("#SBATCH --ntasks=1\n");
        script.push_str(&format!("#SBATCH --cpus-per-task={}\n", self.phase.tasks_per_job));
        script.push_str("set -u\n");
        if let Some(scratch) = &job.scratch_dir {
            script.push_str(&format!(
                "export TMPDIR={}\nmkdir -p \"$TMPDIR\"\n",
                shell_quote(&scratch.display().to_string())
            ));
        }
        script.push_str(
            "\nnow_ms() { date +%s%3N; }\n\
             finish() {\n  printf '%s\\n%s\\n%s\\n' \"$2\" \"$(( $(now_ms) - $3 ))\" \"$4\" > \"$1.tmp\" && mv \"$1.tmp\" \"$1\"\n}\n\n",
        );

        for task in &job.tasks {
            let adapter = self.adapters.get(task.node.ecosystem)?;
            let commands = adapter.install_commands(&task.node, &job.install_context(task))?;
            let body = commands
                .iter()
                .map(CommandLine::to_shell)
                .collect::<Vec<_>>()
                .join(" && ");
            let status = shell_quote(&job.status_path(&task.node.hash).display().to_string());
            let log = shell_quote(&task.log_path.display().to_string());

            script.push_str(&format!("# {}\n", task.node.label()));
            script.push_str("(\n  start=$(now_ms)\n");
            script.push_str(&format!("  if {{ {}; }} >> {} 2>&1; then\n", body, log));
            script.push_str(&format!("    finish {} succeeded \"$start\" ''\n", status));
            script.push_str("  else\n    rc=$?\n");
            script.push_str(&format!(
                "    finish {} failed \"$start\" \"exit status $rc, see {}\"\n",
                status,
                task.log_path.display()
            ));
            script.push_str("  fi\n) &\n\n");
        }
        script.push_str("wait\n");
        Ok(script)
    }
}

/// Map `squeue -o %T` output to a job status
fn parse_state(output: &str) -> JobStatus {
    match output.lines().next().map(str::trim) {
        None | Some("") => JobStatus::Finished,
        Some("PENDING") | Some("CONFIGURING") | Some("REQUEUED") | Some("SUSPENDED") => {
            JobStatus::Queued
        }
        Some("RUNNING") | Some("COMPLETING") | Some("STAGE_OUT") => JobStatus::Running,
        Some(_) => JobStatus::Finished,
    }
}

/// `sbatch --parsable` prints `<id>` or `<id>;<cluster>`
fn parse_job_id(output: &str) -> Option<String> {
    let line = output.lines().find(|l| !l.trim().is_empty())?;
    let id = line.split(';').next()?.trim();
    (!id.is_empty() && id.chars().all(|c| c.is_ascii_digit() || c == '_')).then(|| id.to_string())
}

#[async_trait]
impl BuildBackend for SlurmBackend {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    fn limits(&self) -> BatchLimits {
        BatchLimits {
            tasks_per_job: self.phase.tasks_per_job,
            max_jobs: self.phase.max_jobs,
        }
    }

    fn cpus_per_task(&self, tasks: usize) -> usize {
        (self.phase.tasks_per_job / tasks.max(1)).max(1)
    }

    /// The phase's compute-node scratch wins over the site default
    fn scratch_dir(&self) -> Option<PathBuf> {
        self.phase.scratch_dir.clone().or_else(|| self.scratch_dir.clone())
    }

    async fn submit(&self, job: &BuildJob) -> ByoeResult<String> {
        let script_path = job.dir.join(SCRIPT_FILE);
        tokio::fs::write(&script_path, self.script(job)?)
            .await
            .map_err(|e| ByoeError::io(format!("writing {}", script_path.display()), e))?;

        let cmd = CommandLine::new(&self.batch.sbatch)
            .arg("--parsable")
            .args(self.phase.args.split_whitespace())
            .arg(script_path.display().to_string())
            .current_dir(&job.dir);
        let out = run_capture(&cmd)
            .await
            .map_err(|e| ByoeError::backend(BACKEND, e.to_string()))?;
        if !out.success {
            return Err(ByoeError::backend(
                BACKEND,
                format!("sbatch failed: {}", out.stderr.trim()),
            ));
        }
        let id = parse_job_id(&out.stdout).ok_or_else(|| {
            ByoeError::backend(BACKEND, format!("unexpected sbatch output: {}", out.stdout.trim()))
        })?;
        info!(
            "Submitted Slurm job {} ({} installs)",
            id,
            job.tasks.len()
        );
        Ok(id)
    }

    async fn poll(&self, job: &BuildJob) -> ByoeResult<JobStatus> {
        let Some(id) = &job.handle else {
            return Ok(JobStatus::Finished);
        };
        let cmd = CommandLine::new(&self.batch.squeue).args(["-h", "-j", id.as_str(), "-o", "%T"]);
        let out = run_capture(&cmd)
            .await
            .map_err(|e| ByoeError::backend(BACKEND, e.to_string()))?;
        if !out.success {
            // Jobs that left the queue are unknown to squeue
            if out.stderr.contains("Invalid job id") {
                return Ok(JobStatus::Finished);
            }
            return Err(ByoeError::backend(
                BACKEND,
                format!("squeue failed: {}", out.stderr.trim()),
            ));
        }
        let status = parse_state(&out.stdout);
        debug!("Slurm job {} is {:?}", id, status);
        Ok(status)
    }

    async fn cancel(&self, job: &BuildJob) -> ByoeResult<()> {
        let Some(id) = &job.handle else {
            return Ok(());
        };
        let out = run_capture(&CommandLine::new(&self.batch.scancel).arg(id.as_str()))
            .await
            .map_err(|e| ByoeError::backend(BACKEND, e.to_string()))?;
        if !out.success {
            return Err(ByoeError::backend(
                BACKEND,
                format!("scancel {} failed: {}", id, out.stderr.trim()),
            ));
        }
        Ok(())
    }
}
