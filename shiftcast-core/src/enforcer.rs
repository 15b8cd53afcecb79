use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::command::CommandBuilder;
use crate::config::ShiftcastConfig;
use crate::desired::compute_desired;
use crate::models::{ChannelBundle, JobKey};
use crate::recording::{PruneReport, RetentionEngine, SegmentInventory};
use crate::store::ChannelRepository;
use crate::supervisor::{ProcessLauncher, ProcessSupervisor, ReconcileReport};

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    /// Set when the channel store could not be read; nothing else was done.
    pub skipped: bool,
    pub channels: usize,
    pub desired: usize,
    pub reconcile: ReconcileReport,
    pub retention: Vec<PruneReport>,
}

/// The reconciliation loop: configuration in, supervised processes out.
pub struct EnforcerLoop {
    repository: Arc<dyn ChannelRepository>,
    supervisor: ProcessSupervisor,
    retention: RetentionEngine,
    poll_interval: Duration,
}

impl fmt::Debug for EnforcerLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnforcerLoop")
            .field("supervisor", &self.supervisor)
            .field("retention", &self.retention)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl EnforcerLoop {
    pub fn new(
        config: &ShiftcastConfig,
        repository: Arc<dyn ChannelRepository>,
        launcher: Option<Arc<dyn ProcessLauncher>>,
    ) -> Self {
        let supervisor = ProcessSupervisor::new(
            CommandBuilder::from_config(config),
            launcher,
            config.stop_timeout(),
        );
        let retention = RetentionEngine::new(
            SegmentInventory::new(config.media_layout()),
            config.playback.playlist_window_seconds,
            config.retention.safety_margin_seconds,
        );
        Self::from_parts(repository, supervisor, retention, config.poll_interval())
    }

    pub fn from_parts(
        repository: Arc<dyn ChannelRepository>,
        supervisor: ProcessSupervisor,
        retention: RetentionEngine,
        poll_interval: Duration,
    ) -> Self {
        Self {
            repository,
            supervisor,
            retention,
            poll_interval,
        }
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub fn into_supervisor(self) -> ProcessSupervisor {
        self.supervisor
    }

    /// One reconciliation pass at local time `now`.
    pub async fn tick(&mut self, now: NaiveDateTime) -> TickReport {
        let bundles = match self.repository.load_channels() {
            Ok(bundles) => bundles,
            Err(err) => {
                warn!(error = %err, "failed to load channels, skipping tick");
                return TickReport {
                    skipped: true,
                    ..TickReport::default()
                };
            }
        };

        let channels = bundles.len();
        let pruning: Vec<ChannelBundle> = bundles
            .iter()
            .filter(|bundle| bundle.channel.retention.enabled)
            .cloned()
            .collect();

        let desired = compute_desired(bundles, now);
        let reconcile = self.supervisor.reconcile(&desired, now).await;

        let retention = pruning
            .iter()
            .map(|bundle| self.retention.prune_segments(bundle, now))
            .collect();

        let report = TickReport {
            skipped: false,
            channels,
            desired: desired.len(),
            reconcile,
            retention,
        };
        if report.reconcile.is_quiet() {
            debug!(channels, desired = report.desired, "tick finished");
        } else {
            info!(
                channels,
                desired = report.desired,
                started = report.reconcile.started.len(),
                restarted = report.reconcile.restarted.len(),
                stopped = report.reconcile.stopped.len(),
                reaped = report.reconcile.reaped.len(),
                launch_failures = report.reconcile.launch_failures.len(),
                "tick finished"
            );
        }
        report
    }

    /// Ticks on the poll interval until `shutdown` resolves, then stops every job.
    pub async fn run<F>(&mut self, shutdown: F) -> Vec<JobKey>
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(poll_ms = self.poll_interval.as_millis() as u64, "enforcer started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.tick(Local::now().naive_local()).await;
                }
            }
        }

        let stopped = self.supervisor.shutdown().await;
        info!(stopped = stopped.len(), "enforcer stopped");
        stopped
    }
}
