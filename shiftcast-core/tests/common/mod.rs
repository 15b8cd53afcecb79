#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use shiftcast_core::{
    Channel, ChannelBundle, JobCommand, JobExit, JobKey, LaunchSpec, ManagedProcess,
    OutputProfile, OutputTarget, ProcessLauncher,
};

#[derive(Default)]
struct FakeState {
    next_pid: u32,
    fail_launches: bool,
    launched: Vec<(JobKey, JobCommand)>,
    terminated: Vec<JobKey>,
    exits: HashMap<u32, JobExit>,
    live: HashMap<JobKey, u32>,
}

/// Records launches instead of spawning processes.
#[derive(Clone, Default)]
pub struct FakeLauncher {
    state: Arc<Mutex<FakeState>>,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launched(&self) -> Vec<JobKey> {
        self.state.lock().unwrap().launched.iter().map(|(key, _)| *key).collect()
    }

    pub fn launches_of(&self, key: JobKey) -> Vec<JobCommand> {
        self.state
            .lock()
            .unwrap()
            .launched
            .iter()
            .filter(|(launched, _)| *launched == key)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn terminated(&self) -> Vec<JobKey> {
        self.state.lock().unwrap().terminated.clone()
    }

    pub fn set_failing(&self, fail: bool) {
        self.state.lock().unwrap().fail_launches = fail;
    }

    /// Makes the live process of `key` exit with `code`.
    pub fn crash(&self, key: JobKey, code: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(pid) = state.live.get(&key).copied() {
            state.exits.insert(pid, JobExit { code: Some(code), signal: None });
        }
    }
}

impl ProcessLauncher for FakeLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ManagedProcess>> {
        let mut state = self.state.lock().unwrap();
        if state.fail_launches {
            return Err(io::Error::new(io::ErrorKind::NotFound, "ffmpeg not found"));
        }
        state.next_pid += 1;
        let pid = 1000 + state.next_pid;
        state.launched.push((spec.key, spec.command.clone()));
        state.live.insert(spec.key, pid);
        Ok(Box::new(FakeProcess {
            key: spec.key,
            pid,
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeProcess {
    key: JobKey,
    pid: u32,
    state: Arc<Mutex<FakeState>>,
}

#[async_trait::async_trait]
impl ManagedProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn try_wait(&mut self) -> io::Result<Option<JobExit>> {
        Ok(self.state.lock().unwrap().exits.get(&self.pid).copied())
    }

    async fn wait(&mut self) -> io::Result<JobExit> {
        Ok(self
            .try_wait()?
            .unwrap_or(JobExit { code: Some(0), signal: None }))
    }

    async fn terminate(&mut self, _grace: Duration) -> io::Result<JobExit> {
        let mut state = self.state.lock().unwrap();
        state.terminated.push(self.key);
        let exit = JobExit { code: None, signal: Some(15) };
        state.exits.insert(self.pid, exit);
        Ok(exit)
    }
}

/// Wednesday noon, inside an all-day schedule.
pub fn noon() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1)
        .and_then(|date| date.and_hms_opt(12, 0, 0))
        .unwrap()
}

pub fn live_bundle(channel_id: i64, target_id: i64) -> ChannelBundle {
    let mut channel = Channel::new(channel_id, format!("channel{channel_id}"));
    channel.input_url = format!("udp://@239.10.0.{channel_id}:5000");
    ChannelBundle::new(channel, OutputProfile::default_copy()).with_target(OutputTarget::new(
        target_id,
        channel_id,
        format!("udp://10.1.0.{target_id}:6000"),
    ))
}
