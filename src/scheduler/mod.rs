//! Job scheduler abstraction
//!
//! Remote topology probes run as small batch jobs. The scheduler backend owns
//! submission, progress tracking and cancellation; callers only submit and
//! await a terminal [`JobOutcome`].

mod local;
mod slurm;

pub use local::LocalScheduler;
pub use slurm::SlurmScheduler;

use crate::config::TopologyConfig;
use crate::error::{TopoError, TopoResult};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// A detection job ready for submission
#[derive(Debug, Clone)]
pub struct ProbeJob {
    /// Job name as shown by the scheduler
    pub name: String,
    /// Scheduler access options (e.g. `-p gpu`, `--account=proj`)
    pub access: Vec<String>,
    /// Environment modules loaded before the payload runs
    pub modules: Vec<String>,
    /// Environment variables exported before the payload runs
    pub variables: BTreeMap<String, String>,
    /// Payload command line, launcher prefix included
    pub command: Vec<String>,
    /// Directory holding the job script and captured output
    pub workdir: PathBuf,
}

impl ProbeJob {
    /// Shell body of the job: environment setup followed by the payload
    pub fn script_body(&self) -> String {
        let mut lines = Vec::new();
        for module in &self.modules {
            lines.push(format!("module load {}", shell_quote(module)));
        }
        for (name, value) in &self.variables {
            lines.push(format!("export {}={}", name, shell_quote(value)));
        }
        lines.push(
            self.command
                .iter()
                .map(|arg| shell_quote(arg))
                .collect::<Vec<_>>()
                .join(" "),
        );
        lines.join("\n")
    }
}

/// Reference to a submitted job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Scheduler-assigned job ID
    pub id: String,
    /// File receiving the job's standard output
    pub stdout: PathBuf,
}

/// Terminal state of a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Job finished successfully; carries its captured standard output
    Completed { output: String },
    /// Job ended in a failure state
    Failed { reason: String },
    /// Job was cancelled before completing
    Cancelled,
}

/// Abstract batch scheduler interface
#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Registered scheduler name (`local`, `slurm`, ...)
    fn name(&self) -> &'static str;

    /// Whether this scheduler can run jobs on compute nodes
    fn supports_submission(&self) -> bool;

    /// Jobs of this scheduler allowed in flight at the same time
    fn max_concurrent_jobs(&self) -> usize {
        1
    }

    /// Submit a job and return its handle
    async fn submit(&self, job: &ProbeJob) -> TopoResult<JobHandle>;

    /// Wait until the job reaches a terminal state
    async fn wait(&self, handle: &JobHandle) -> TopoResult<JobOutcome>;

    /// Cancel a submitted job
    async fn cancel(&self, _handle: &JobHandle) -> TopoResult<()> {
        Ok(())
    }
}

/// Create the scheduler backend registered under `name`
pub fn create_scheduler(name: &str, settings: &TopologyConfig) -> TopoResult<Arc<dyn JobScheduler>> {
    match name {
        "local" => Ok(Arc::new(LocalScheduler::new())),
        "slurm" | "squeue" => Ok(Arc::new(SlurmScheduler::new(
            settings.poll_interval(),
            settings.scheduler_max_jobs,
        ))),
        other => Err(TopoError::UnknownScheduler(other.to_string())),
    }
}

/// Quote a word for a POSIX shell unless it is obviously safe
pub(crate) fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}
