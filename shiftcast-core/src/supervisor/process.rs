use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::command::JobCommand;
use crate::models::JobKey;

/// Where a launched job's output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutput {
    /// stdout discarded, stderr appended to the file.
    LogFile(PathBuf),
    /// Both streams shared with the caller.
    Inherit,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub key: JobKey,
    pub command: JobCommand,
    pub output: JobOutput,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl JobExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for JobExit {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;
        Self {
            code: status.code(),
            signal,
        }
    }
}

impl fmt::Display for JobExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Handle on one launched job. Owned exclusively by whoever launched it.
#[async_trait::async_trait]
pub trait ManagedProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit check; reaps the process when it has exited.
    fn try_wait(&mut self) -> io::Result<Option<JobExit>>;

    async fn wait(&mut self) -> io::Result<JobExit>;

    /// SIGTERM, up to `grace` to exit, then SIGKILL. Always reaps.
    async fn terminate(&mut self, grace: Duration) -> io::Result<JobExit>;
}

pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ManagedProcess>>;
}

/// Launches jobs as OS processes, each leading its own process group.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

impl ProcessLauncher for SystemLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ManagedProcess>> {
        let mut command = Command::new(&spec.command.program);
        command.args(&spec.command.args).stdin(Stdio::null());

        match &spec.output {
            JobOutput::LogFile(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let log = OpenOptions::new().create(true).append(true).open(path)?;
                command.stdout(Stdio::null()).stderr(Stdio::from(log));
            }
            JobOutput::Inherit => {
                command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        #[cfg(unix)]
        command.process_group(0);

        let child = command.spawn()?;
        let pid = child.id();
        debug!(key = %spec.key, pid, "process spawned");
        Ok(Box::new(SystemProcess { child, pid }))
    }
}

struct SystemProcess {
    child: Child,
    pid: Option<u32>,
}

#[async_trait::async_trait]
impl ManagedProcess for SystemProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<JobExit>> {
        Ok(self.child.try_wait()?.map(JobExit::from))
    }

    async fn wait(&mut self) -> io::Result<JobExit> {
        Ok(self.child.wait().await?.into())
    }

    async fn terminate(&mut self, grace: Duration) -> io::Result<JobExit> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.into());
        }

        self.send_term();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(status) => Ok(status?.into()),
            Err(_) => {
                warn!(
                    pid = self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "process ignored SIGTERM, killing"
                );
                self.send_kill();
                Ok(self.child.wait().await?.into())
            }
        }
    }
}

impl SystemProcess {
    #[cfg(unix)]
    fn send_term(&mut self) {
        if let Some(pid) = self.pid {
            if let Err(err) = signal_group(pid, libc::SIGTERM) {
                warn!(pid, error = %err, "failed to signal process group");
            }
        }
    }

    #[cfg(not(unix))]
    fn send_term(&mut self) {
        if let Err(err) = self.child.start_kill() {
            warn!(pid = self.pid, error = %err, "failed to stop process");
        }
    }

    fn send_kill(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            if let Err(err) = signal_group(pid, libc::SIGKILL) {
                warn!(pid, error = %err, "failed to kill process group");
            }
        }
        if let Err(err) = self.child.start_kill() {
            debug!(pid = self.pid, error = %err, "direct kill after group kill failed");
        }
    }
}

/// Signals the process group led by `pid`. A group that is already gone is not an error.
#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let pgid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}
