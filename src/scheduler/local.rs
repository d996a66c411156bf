//! Local scheduler: runs everything on the current host, no batch jobs

use crate::error::{TopoError, TopoResult};
use crate::scheduler::{JobHandle, JobOutcome, JobScheduler, ProbeJob};
use async_trait::async_trait;

/// Scheduler of partitions that execute directly on this host
#[derive(Debug, Default)]
pub struct LocalScheduler;

impl LocalScheduler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobScheduler for LocalScheduler {
    fn name(&self) -> &'static str {
        "local"
    }

    fn supports_submission(&self) -> bool {
        false
    }

    async fn submit(&self, _job: &ProbeJob) -> TopoResult<JobHandle> {
        Err(TopoError::SubmissionUnsupported(self.name().to_string()))
    }

    async fn wait(&self, _handle: &JobHandle) -> TopoResult<JobOutcome> {
        Err(TopoError::SubmissionUnsupported(self.name().to_string()))
    }
}
