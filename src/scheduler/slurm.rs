//! Slurm backend
//!
//! Submits probe jobs with `sbatch` and tracks them through `sacct`, falling
//! back to `squeue` while the job is not yet visible in accounting.

use crate::error::{TopoError, TopoResult};
use crate::scheduler::{shell_quote, JobHandle, JobOutcome, JobScheduler, ProbeJob};
use async_trait::async_trait;
use std::fmt;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Consecutive polls without any state before a job is declared lost
const MAX_MISSING_POLLS: u32 = 10;

/// Terminal classification of a Slurm job state
#[derive(Debug, Clone, PartialEq, Eq)]
enum Terminal {
    Completed,
    Failed(String),
    Cancelled,
}

/// Map a Slurm state string to a terminal state, `None` while still active
fn classify(state: &str) -> Option<Terminal> {
    let state = state.trim();
    let base = state.split_whitespace().next().unwrap_or_default();
    match base {
        "COMPLETED" => Some(Terminal::Completed),
        "CANCELLED" => Some(Terminal::Cancelled),
        "FAILED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" | "REVOKED" => Some(Terminal::Failed(state.to_string())),
        _ => None,
    }
}

/// Extract the job ID from `sbatch --parsable` output (`<id>[;<cluster>]`)
fn parse_job_id(stdout: &str) -> Option<String> {
    let id = stdout.lines().next()?.split(';').next()?.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Captured result of a scheduler command
#[derive(Debug, Clone, Default)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Runs Slurm client commands
#[async_trait]
pub(crate) trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> TopoResult<CommandOutput>;
}

/// Runs commands on this host through `tokio::process`
struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[&str]) -> TopoResult<CommandOutput> {
        debug!("Executing: {} {:?}", program, args);

        let output = Command::new(program)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| TopoError::command_failed(format!("{} {:?}", program, args), e))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Slurm scheduler backend
pub struct SlurmScheduler {
    poll_interval: Duration,
    max_jobs: usize,
    runner: Arc<dyn CommandRunner>,
}

impl SlurmScheduler {
    /// Create a Slurm backend polling job state every `poll_interval`
    pub fn new(poll_interval: Duration, max_jobs: usize) -> Self {
        Self::with_runner(poll_interval, max_jobs, Arc::new(ProcessRunner))
    }

    pub(crate) fn with_runner(
        poll_interval: Duration,
        max_jobs: usize,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            poll_interval,
            max_jobs: max_jobs.max(1),
            runner,
        }
    }

    /// Render the batch script of a job
    fn render_script(job: &ProbeJob) -> String {
        let stdout = job.workdir.join(format!("{}.out", job.name));
        let stderr = job.workdir.join(format!("{}.err", job.name));

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("#SBATCH --job-name={}", shell_quote(&job.name)),
            format!("#SBATCH --output={}", shell_quote(&stdout.to_string_lossy())),
            format!("#SBATCH --error={}", shell_quote(&stderr.to_string_lossy())),
            "#SBATCH --nodes=1".to_string(),
            "#SBATCH --ntasks=1".to_string(),
        ];
        lines.extend(job.access.iter().map(|opt| format!("#SBATCH {}", opt)));
        lines.push(format!("cd {}", shell_quote(&job.workdir.to_string_lossy())));
        lines.push(job.script_body());
        lines.push(String::new());
        lines.join("\n")
    }

    /// Current state of a job, if the scheduler reports one
    ///
    /// `sacct` is empty on clusters without accounting storage and for jobs
    /// not yet recorded; `squeue` only lists jobs that have not finished.
    async fn query_state(&self, id: &str) -> TopoResult<Option<String>> {
        let output = self
            .runner
            .run("sacct", &["-j", id, "-X", "-n", "-P", "-o", "State"])
            .await?;
        if let Some(state) = first_line(&output.stdout) {
            return Ok(Some(state));
        }

        let output = self.runner.run("squeue", &["-h", "-j", id, "-o", "%T"]).await?;
        Ok(first_line(&output.stdout))
    }
}

impl fmt::Debug for SlurmScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlurmScheduler")
            .field("poll_interval", &self.poll_interval)
            .field("max_jobs", &self.max_jobs)
            .finish()
    }
}

fn first_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

/// Captured output of a job that left the queue, if it wrote any
async fn finished_output(path: &Path) -> Option<String> {
    match fs::read_to_string(path).await {
        Ok(output) if !output.trim().is_empty() => Some(output),
        _ => None,
    }
}

#[async_trait]
impl JobScheduler for SlurmScheduler {
    fn name(&self) -> &'static str {
        "slurm"
    }

    fn supports_submission(&self) -> bool {
        true
    }

    fn max_concurrent_jobs(&self) -> usize {
        self.max_jobs
    }

    async fn submit(&self, job: &ProbeJob) -> TopoResult<JobHandle> {
        fs::create_dir_all(&job.workdir).await.map_err(|e| {
            TopoError::io(format!("creating stage directory {}", job.workdir.display()), e)
        })?;

        let script = job.workdir.join(format!("{}.sh", job.name));
        fs::write(&script, Self::render_script(job))
            .await
            .map_err(|e| TopoError::io(format!("writing job script {}", script.display()), e))?;

        let script_arg = script.to_string_lossy();
        let output = self
            .runner
            .run("sbatch", &["--parsable", script_arg.as_ref()])
            .await?;
        if !output.success {
            return Err(TopoError::command_exec("sbatch", output.stderr.trim()));
        }

        let id = parse_job_id(&output.stdout).ok_or_else(|| {
            TopoError::JobSubmit(format!("sbatch returned no job ID: {}", output.stdout.trim()))
        })?;

        info!("Submitted Slurm job {} ({})", id, job.name);
        Ok(JobHandle {
            id,
            stdout: job.workdir.join(format!("{}.out", job.name)),
        })
    }

    async fn wait(&self, handle: &JobHandle) -> TopoResult<JobOutcome> {
        let mut missing = 0;
        loop {
            match self.query_state(&handle.id).await? {
                Some(state) => {
                    missing = 0;
                    match classify(&state) {
                        Some(Terminal::Completed) => break,
                        Some(Terminal::Cancelled) => return Ok(JobOutcome::Cancelled),
                        Some(Terminal::Failed(reason)) => {
                            return Ok(JobOutcome::Failed { reason })
                        }
                        None => debug!("Job {} is {}", handle.id, state),
                    }
                }
                None => {
                    // Without accounting, a finished job only leaves its output behind
                    if let Some(output) = finished_output(&handle.stdout).await {
                        debug!("Job {} left the queue with output", handle.id);
                        return Ok(JobOutcome::Completed { output });
                    }
                    missing += 1;
                    if missing >= MAX_MISSING_POLLS {
                        warn!("Job {} vanished from the scheduler", handle.id);
                        return Ok(JobOutcome::Failed {
                            reason: "job state no longer reported by the scheduler".to_string(),
                        });
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        let output = fs::read_to_string(&handle.stdout).await.map_err(|e| {
            TopoError::io(format!("reading job output {}", handle.stdout.display()), e)
        })?;
        Ok(JobOutcome::Completed { output })
    }

    async fn cancel(&self, handle: &JobHandle) -> TopoResult<()> {
        let output = self.runner.run("scancel", &[handle.id.as_str()]).await?;
        if !output.success {
            return Err(TopoError::command_exec("scancel", output.stderr.trim()));
        }
        info!("Cancelled Slurm job {}", handle.id);
        Ok(())
    }
}
