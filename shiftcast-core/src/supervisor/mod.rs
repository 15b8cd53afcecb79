pub mod process;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::command::{BuildError, CommandBuilder, JobCommand};
use crate::desired::{DesiredJob, DesiredState};
use crate::models::{JobKey, JobPurpose};

pub use process::{
    JobExit, JobOutput, LaunchSpec, ManagedProcess, ProcessLauncher, SystemLauncher,
};

/// A job the supervisor launched and still owns.
pub struct RunningJob {
    pub key: JobKey,
    pub command: JobCommand,
    pub started_at: NaiveDateTime,
    process: Box<dyn ManagedProcess>,
}

impl RunningJob {
    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }
}

impl fmt::Debug for RunningJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningJob")
            .field("key", &self.key)
            .field("pid", &self.pid())
            .field("started_at", &self.started_at)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub key: JobKey,
    pub pid: Option<u32>,
    pub started_at: NaiveDateTime,
    pub command: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReapedJob {
    pub key: JobKey,
    pub exit: JobExit,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeferredJob {
    pub key: JobKey,
    pub transient: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchFailure {
    pub key: JobKey,
    pub error: String,
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub reaped: Vec<ReapedJob>,
    pub started: Vec<JobKey>,
    pub restarted: Vec<JobKey>,
    pub stopped: Vec<JobKey>,
    pub deferred: Vec<DeferredJob>,
    pub launch_failures: Vec<LaunchFailure>,
}

impl ReconcileReport {
    pub fn is_quiet(&self) -> bool {
        self.reaped.is_empty()
            && self.started.is_empty()
            && self.restarted.is_empty()
            && self.stopped.is_empty()
            && self.launch_failures.is_empty()
    }
}

/// Owns every running job and drives it towards the desired state.
pub struct ProcessSupervisor {
    builder: CommandBuilder,
    launcher: Arc<dyn ProcessLauncher>,
    stop_timeout: Duration,
    running: BTreeMap<JobKey, RunningJob>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("builder", &self.builder)
            .field("stop_timeout", &self.stop_timeout)
            .field("running", &self.running.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProcessSupervisor {
    pub fn new(
        builder: CommandBuilder,
        launcher: Option<Arc<dyn ProcessLauncher>>,
        stop_timeout: Duration,
    ) -> Self {
        let launcher = launcher.unwrap_or_else(|| Arc::new(SystemLauncher));
        Self {
            builder,
            launcher,
            stop_timeout,
            running: BTreeMap::new(),
        }
    }

    pub fn builder(&self) -> &CommandBuilder {
        &self.builder
    }

    pub fn is_running(&self, key: &JobKey) -> bool {
        self.running.contains_key(key)
    }

    pub fn running_jobs(&self) -> Vec<JobSnapshot> {
        self.running
            .values()
            .map(|job| JobSnapshot {
                key: job.key,
                pid: job.pid(),
                started_at: job.started_at,
                command: job.command.to_string(),
            })
            .collect()
    }

    /// One pass: reap, start or restart what is desired, stop the rest.
    pub async fn reconcile(
        &mut self,
        desired: &DesiredState,
        now: NaiveDateTime,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.reap(&mut report);

        for (key, job) in desired {
            if let Some(running) = self.running.get(key) {
                if key.purpose == JobPurpose::Record {
                    continue;
                }
                let command = match self.build(job, now) {
                    Ok(command) => command,
                    Err(err) => {
                        debug!(
                            job = %key,
                            error = %err,
                            "keeping running playback, rebuild failed"
                        );
                        continue;
                    }
                };
                if command == running.command {
                    continue;
                }
                info!(job = %key, "command changed, restarting");
                self.stop(key).await;
                if self.launch(job, command, now, &mut report) {
                    report.restarted.push(*key);
                }
                continue;
            }

            match self.build(job, now) {
                Ok(command) => {
                    if self.launch(job, command, now, &mut report) {
                        report.started.push(*key);
                    }
                }
                Err(err) => {
                    if err.is_transient() {
                        debug!(job = %key, error = %err, "job deferred");
                    } else {
                        warn!(job = %key, error = %err, "cannot build job command");
                    }
                    report.deferred.push(DeferredJob {
                        key: *key,
                        transient: err.is_transient(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let undesired: Vec<JobKey> = self
            .running
            .keys()
            .filter(|key| !desired.contains_key(key))
            .copied()
            .collect();
        for key in undesired {
            self.stop(&key).await;
            report.stopped.push(key);
        }

        report
    }

    /// Stops every running job.
    pub async fn shutdown(&mut self) -> Vec<JobKey> {
        let keys: Vec<JobKey> = self.running.keys().copied().collect();
        for key in &keys {
            self.stop(key).await;
        }
        keys
    }

    fn reap(&mut self, report: &mut ReconcileReport) {
        let mut exited = Vec::new();
        for (key, job) in self.running.iter_mut() {
            match job.process.try_wait() {
                Ok(Some(exit)) => exited.push((*key, exit)),
                Ok(None) => {}
                Err(err) => warn!(job = %key, error = %err, "failed to poll job status"),
            }
        }
        for (key, exit) in exited {
            self.running.remove(&key);
            warn!(job = %key, status = %exit, "job exited");
            report.reaped.push(ReapedJob { key, exit });
        }
    }

    fn build(&self, job: &DesiredJob, now: NaiveDateTime) -> Result<JobCommand, BuildError> {
        self.builder
            .build(&job.bundle, job.key.purpose, job.target(), now)
    }

    fn launch(
        &mut self,
        job: &DesiredJob,
        command: JobCommand,
        now: NaiveDateTime,
        report: &mut ReconcileReport,
    ) -> bool {
        let spec = LaunchSpec {
            key: job.key,
            output: JobOutput::LogFile(self.builder.layout().job_log_path(&job.key)),
            command,
        };
        match self.launcher.launch(&spec) {
            Ok(process) => {
                info!(
                    job = %job.key,
                    channel_id = job.key.channel_id,
                    pid = process.pid(),
                    command = %spec.command,
                    "job started"
                );
                self.running.insert(
                    job.key,
                    RunningJob {
                        key: job.key,
                        command: spec.command,
                        started_at: now,
                        process,
                    },
                );
                true
            }
            Err(err) => {
                warn!(job = %job.key, error = %err, "failed to launch job");
                report.launch_failures.push(LaunchFailure {
                    key: job.key,
                    error: err.to_string(),
                });
                false
            }
        }
    }

    async fn stop(&mut self, key: &JobKey) {
        let Some(mut job) = self.running.remove(key) else {
            return;
        };
        match job.process.terminate(self.stop_timeout).await {
            Ok(exit) => info!(job = %key, pid = job.pid(), status = %exit, "job stopped"),
            Err(err) => {
                warn!(job = %key, pid = job.pid(), error = %err, "failed to stop job cleanly")
            }
        }
    }
}
