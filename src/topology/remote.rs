//! Remote processor and device probe
//!
//! Runs `<probe command> probe` as a one-node job on the partition and parses
//! the report it prints. Every failure comes back as
//! [`TopoError::ProbeFailure`] so the detector can fall back.

use crate::error::{TopoError, TopoResult};
use crate::scheduler::{JobOutcome, JobScheduler, ProbeJob};
use crate::system::Partition;
use crate::topology::info::ProbeReport;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Probe settings shared by all partitions of a run
#[derive(Debug, Clone)]
pub struct RemoteProbeConfig {
    /// Command that prints a probe report, without the `probe` subcommand
    pub probe_command: Vec<String>,
    /// Shared directory for job scripts and output
    pub stage_dir: PathBuf,
    /// Give up waiting after this long and cancel the job
    pub timeout: Option<Duration>,
    /// Maximum number of probe jobs in flight across all schedulers
    pub max_concurrent: usize,
}

/// Job-based topology probe
///
/// In-flight jobs are bounded globally and per scheduler, the latter by the
/// scheduler's own [`JobScheduler::max_concurrent_jobs`].
pub struct RemoteProbe {
    config: RemoteProbeConfig,
    permits: Arc<Semaphore>,
    scheduler_permits: Mutex<HashMap<&'static str, Arc<Semaphore>>>,
}

impl RemoteProbe {
    pub fn new(config: RemoteProbeConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            permits,
            scheduler_permits: Mutex::new(HashMap::new()),
        }
    }

    /// Job slots of one scheduler, shared by every partition it serves
    fn scheduler_slots(&self, scheduler: &dyn JobScheduler) -> Arc<Semaphore> {
        let mut slots = self
            .scheduler_permits
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        slots
            .entry(scheduler.name())
            .or_insert_with(|| Arc::new(Semaphore::new(scheduler.max_concurrent_jobs().max(1))))
            .clone()
    }

    /// Build the detection job of a partition
    pub fn build_job(&self, system: &str, part: &Partition) -> TopoResult<ProbeJob> {
        let environ = part.environs().first().ok_or_else(|| {
            TopoError::probe_failure(part.name(), "partition has no programming environment")
        })?;
        if self.config.probe_command.is_empty() {
            return Err(TopoError::probe_failure(part.name(), "no probe command configured"));
        }

        let name = format!(
            "topocache-probe-{}-{}-{}",
            system,
            part.name(),
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let mut command = part.launcher_command();
        command.extend(self.config.probe_command.iter().cloned());
        command.push("probe".to_string());

        Ok(ProbeJob {
            workdir: self.config.stage_dir.join(&name),
            name,
            access: part.access().to_vec(),
            modules: environ.modules.clone(),
            variables: environ.variables.clone(),
            command,
        })
    }

    /// Probe a partition through its scheduler
    ///
    /// Callers must not hold any cache lock: this waits for a batch job.
    pub async fn probe(&self, system: &str, part: &Partition) -> TopoResult<ProbeReport> {
        let scheduler = part.scheduler();
        if !scheduler.supports_submission() {
            return Err(TopoError::SubmissionUnsupported(scheduler.name().to_string()));
        }

        let job = self.build_job(system, part)?;
        let _slot = self
            .scheduler_slots(scheduler)
            .acquire_owned()
            .await
            .map_err(|e| TopoError::Internal(format!("scheduler job slots closed: {e}")))?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| TopoError::Internal(format!("probe permits closed: {e}")))?;

        let handle = scheduler
            .submit(&job)
            .await
            .map_err(|e| TopoError::probe_failure(part.name(), e.to_string()))?;
        info!(
            "Waiting for topology probe job {} on {}:{}",
            handle.id,
            system,
            part.name()
        );

        let waited = match self.config.timeout {
            Some(limit) => match tokio::time::timeout(limit, scheduler.wait(&handle)).await {
                Ok(waited) => waited,
                Err(_) => {
                    if let Err(e) = scheduler.cancel(&handle).await {
                        warn!("Failed to cancel probe job {}: {}", handle.id, e);
                    }
                    return Err(TopoError::probe_failure(
                        part.name(),
                        format!("job {} did not finish within {:?}", handle.id, limit),
                    ));
                }
            },
            None => scheduler.wait(&handle).await,
        };

        match waited.map_err(|e| TopoError::probe_failure(part.name(), e.to_string()))? {
            JobOutcome::Completed { output } => parse_report(part.name(), &output),
            JobOutcome::Failed { reason } => Err(TopoError::probe_failure(
                part.name(),
                format!("job {} failed: {}", handle.id, reason),
            )),
            JobOutcome::Cancelled => Err(TopoError::probe_failure(
                part.name(),
                format!("job {} was cancelled", handle.id),
            )),
        }
    }
}

/// Parse the probe report from a job's captured output
///
/// The report is the last line holding a JSON object; anything printed
/// before it (module banners, launcher noise) is ignored.
pub fn parse_report(partition: &str, output: &str) -> TopoResult<ProbeReport> {
    let line = output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .last()
        .ok_or_else(|| TopoError::probe_failure(partition, "job produced no probe report"))?;

    let report: ProbeReport = serde_json::from_str(line).map_err(|e| {
        TopoError::probe_failure(partition, format!("unparseable probe report: {e}"))
    })?;
    debug!(
        "Probe of {} reported {} device group(s)",
        partition,
        report.devices.len()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironConfig;
    use crate::error::TopoResult;
    use crate::scheduler::{JobHandle, JobScheduler, LocalScheduler};
    use async_trait::async_trait;
    use futures_util::future::join_all;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedScheduler {
        outcome: JobOutcome,
        hang: bool,
        submitted: Mutex<Vec<ProbeJob>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl ScriptedScheduler {
        fn new(outcome: JobOutcome) -> Self {
            Self {
                outcome,
                hang: false,
                submitted: Mutex::new(vec![]),
                cancelled: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl JobScheduler for ScriptedScheduler {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn supports_submission(&self) -> bool {
            true
        }

        async fn submit(&self, job: &ProbeJob) -> TopoResult<JobHandle> {
            self.submitted.lock().unwrap().push(job.clone());
            Ok(JobHandle {
                id: "42".to_string(),
                stdout: job.workdir.join("out"),
            })
        }

        async fn wait(&self, _handle: &JobHandle) -> TopoResult<JobOutcome> {
            if self.hang {
                std::future::pending::<()>().await;
            }
            Ok(self.outcome.clone())
        }

        async fn cancel(&self, handle: &JobHandle) -> TopoResult<()> {
            self.cancelled.lock().unwrap().push(handle.id.clone());
            Ok(())
        }
    }

    fn probe(timeout: Option<Duration>) -> RemoteProbe {
        RemoteProbe::new(RemoteProbeConfig {
            probe_command: vec!["/opt/topocache/bin/topocache".to_string()],
            stage_dir: PathBuf::from("/scratch/stage"),
            timeout,
            max_concurrent: 2,
        })
    }

    fn partition(scheduler: Arc<ScriptedScheduler>) -> Partition {
        Partition::new("gpu", scheduler, "srun")
            .with_access(vec!["-p gpu".to_string()])
            .with_environs(vec![EnvironConfig {
                name: "gnu".to_string(),
                modules: vec!["PrgEnv-gnu".to_string()],
                variables: BTreeMap::new(),
            }])
    }

    const REPORT: &str = r#"{"processor":{"arch":"zen3","num_cpus":64},"devices":[{"type":"gpu","arch":"sm_80","num_devices":4}]}"#;

    #[tokio::test]
    async fn completed_job_yields_report() {
        let scheduler = Arc::new(ScriptedScheduler::new(JobOutcome::Completed {
            output: format!("Loading PrgEnv-gnu\n{REPORT}\n"),
        }));
        let part = partition(scheduler.clone());

        let report = probe(None).probe("alps", &part).await.unwrap();
        assert_eq!(report.processor.num_cpus(), Some(64));
        assert_eq!(report.devices[0].arch(), "sm_80");

        let jobs = scheduler.submitted.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].access, vec!["-p gpu"]);
        assert_eq!(jobs[0].modules, vec!["PrgEnv-gnu"]);
        assert_eq!(
            jobs[0].command,
            vec!["srun", "-n", "1", "/opt/topocache/bin/topocache", "probe"]
        );
        assert!(jobs[0].workdir.starts_with("/scratch/stage"));
    }

    #[tokio::test]
    async fn failed_job_is_probe_failure() {
        let scheduler = Arc::new(ScriptedScheduler::new(JobOutcome::Failed {
            reason: "NODE_FAIL".to_string(),
        }));
        let result = probe(None).probe("alps", &partition(scheduler)).await;
        assert!(matches!(result, Err(TopoError::ProbeFailure { .. })));
    }

    #[tokio::test]
    async fn cancelled_job_is_probe_failure() {
        let scheduler = Arc::new(ScriptedScheduler::new(JobOutcome::Cancelled));
        let result = probe(None).probe("alps", &partition(scheduler)).await;
        assert!(matches!(result, Err(TopoError::ProbeFailure { .. })));
    }

    #[tokio::test]
    async fn garbage_output_is_probe_failure() {
        let scheduler = Arc::new(ScriptedScheduler::new(JobOutcome::Completed {
            output: "{\"processor\": ".to_string(),
        }));
        let result = probe(None).probe("alps", &partition(scheduler)).await;
        assert!(matches!(result, Err(TopoError::ProbeFailure { .. })));
    }

    #[tokio::test]
    async fn hanging_job_times_out_and_is_cancelled() {
        let mut scripted = ScriptedScheduler::new(JobOutcome::Cancelled);
        scripted.hang = true;
        let scheduler = Arc::new(scripted);

        let result = probe(Some(Duration::from_millis(50)))
            .probe("alps", &partition(scheduler.clone()))
            .await;

        assert!(matches!(result, Err(TopoError::ProbeFailure { .. })));
        assert_eq!(*scheduler.cancelled.lock().unwrap(), vec!["42".to_string()]);
    }

    #[tokio::test]
    async fn local_scheduler_is_rejected() {
        let part = Partition::new("login", Arc::new(LocalScheduler::new()), "mpirun");
        let result = probe(None).probe("alps", &part).await;
        assert!(matches!(result, Err(TopoError::SubmissionUnsupported(_))));
    }

    /// Counts jobs between submission and completion
    struct BusyScheduler {
        limit: usize,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobScheduler for BusyScheduler {
        fn name(&self) -> &'static str {
            "busy"
        }

        fn supports_submission(&self) -> bool {
            true
        }

        fn max_concurrent_jobs(&self) -> usize {
            self.limit
        }

        async fn submit(&self, job: &ProbeJob) -> TopoResult<JobHandle> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            Ok(JobHandle {
                id: job.name.clone(),
                stdout: job.workdir.join("out"),
            })
        }

        async fn wait(&self, _handle: &JobHandle) -> TopoResult<JobOutcome> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(JobOutcome::Completed {
                output: REPORT.to_string(),
            })
        }
    }

    #[tokio::test]
    async fn scheduler_job_limit_is_honoured() {
        let scheduler = Arc::new(BusyScheduler {
            limit: 2,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let parts: Vec<Partition> = (0..6)
            .map(|i| Partition::new(format!("p{i}"), scheduler.clone(), "srun"))
            .collect();

        // Global bound above the scheduler's own limit
        let remote = RemoteProbe::new(RemoteProbeConfig {
            probe_command: vec!["topocache".to_string()],
            stage_dir: PathBuf::from("/scratch/stage"),
            timeout: None,
            max_concurrent: 8,
        });
        let results = join_all(parts.iter().map(|part| remote.probe("alps", part))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(scheduler.peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn global_limit_caps_generous_scheduler() {
        let scheduler = Arc::new(BusyScheduler {
            limit: 16,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let parts: Vec<Partition> = (0..6)
            .map(|i| Partition::new(format!("p{i}"), scheduler.clone(), "srun"))
            .collect();

        let remote = probe(None);
        let results = join_all(parts.iter().map(|part| remote.probe("alps", part))).await;

        assert!(results.iter().all(Result::is_ok));
        assert_eq!(scheduler.peak.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn parse_report_requires_output() {
        assert!(parse_report("gpu", "").is_err());
        assert!(parse_report("gpu", "srun: error: no nodes\n").is_err());
        let report = parse_report("gpu", r#"{"processor": {}}"#).unwrap();
        assert!(report.processor.is_empty());
        assert!(report.devices.is_empty());
    }
}
