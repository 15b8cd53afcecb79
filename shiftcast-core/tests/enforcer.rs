mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use common::{live_bundle, noon, FakeLauncher};
use shiftcast_core::{
    ChannelBundle, ChannelRepository, EnforcerLoop, JobKey, ShiftcastConfig,
    StaticChannelRepository, StoreError, StoreResult,
};

struct Fixture {
    _media: tempfile::TempDir,
    media_root: std::path::PathBuf,
    repo: Arc<StaticChannelRepository>,
    launcher: FakeLauncher,
    enforcer: EnforcerLoop,
}

fn fixture(bundles: Vec<ChannelBundle>) -> Fixture {
    let media = tempfile::tempdir().unwrap();
    let mut config = ShiftcastConfig::default();
    config.paths.media_root = media.path().to_path_buf();
    config.playback.playlist_window_seconds = 3600;
    config.retention.safety_margin_seconds = 0;
    config.enforcer.poll_interval_seconds = 1;

    let repo = Arc::new(StaticChannelRepository::new(bundles));
    let launcher = FakeLauncher::new();
    let enforcer = EnforcerLoop::new(
        &config,
        repo.clone(),
        Some(Arc::new(launcher.clone())),
    );
    Fixture {
        media_root: media.path().to_path_buf(),
        _media: media,
        repo,
        launcher,
        enforcer,
    }
}

#[tokio::test]
async fn live_channel_runs_one_playback_and_stops_when_target_disabled() {
    let mut fx = fixture(vec![live_bundle(1, 10)]);
    let key = JobKey::playback(1, 10);

    let report = fx.enforcer.tick(noon()).await;
    assert_eq!(report.desired, 1);
    assert_eq!(report.reconcile.started, vec![key]);
    assert!(fx.enforcer.supervisor().is_running(&key));
    assert!(!fx.enforcer.supervisor().is_running(&JobKey::record(1)));

    fx.repo.update(|bundles| bundles[0].targets[0].enabled = false);
    let report = fx.enforcer.tick(noon()).await;
    assert_eq!(report.desired, 0);
    assert_eq!(report.reconcile.stopped, vec![key]);
    assert_eq!(fx.launcher.terminated(), vec![key]);
    assert!(fx.enforcer.supervisor().running_jobs().is_empty());
}

#[tokio::test]
async fn delayed_channel_records_while_playback_waits_for_segments() {
    let mut fx = fixture(vec![live_bundle(2, 20).with_timeshift(600)]);
    let record = JobKey::record(2);
    let playback = JobKey::playback(2, 20);

    for _ in 0..3 {
        let report = fx.enforcer.tick(noon()).await;
        assert_eq!(report.desired, 2);
        assert_eq!(report.reconcile.deferred.len(), 1);
        assert_eq!(report.reconcile.deferred[0].key, playback);
        assert!(report.reconcile.deferred[0].transient);
        assert!(fx.enforcer.supervisor().is_running(&record));
    }
    assert_eq!(fx.launcher.launches_of(record).len(), 1);
    assert!(fx.launcher.launches_of(playback).is_empty());

    // the record job's first segment appears on disk
    let day = fx.media_root.join("recordings/channel2/20240501");
    fs::create_dir_all(&day).unwrap();
    fs::write(day.join("channel2_20240501-114500.ts"), b"ts").unwrap();

    let report = fx.enforcer.tick(noon()).await;
    assert_eq!(report.reconcile.started, vec![playback]);
    let command = &fx.launcher.launches_of(playback)[0];
    assert!(command.args.iter().any(|arg| arg == "concat"));
}

#[tokio::test]
async fn editing_target_url_restarts_playback_exactly_once() {
    let mut fx = fixture(vec![live_bundle(3, 30)]);
    let key = JobKey::playback(3, 30);
    fx.enforcer.tick(noon()).await;

    fx.repo
        .update(|bundles| bundles[0].targets[0].target_url = "udp://10.9.9.9:7000".into());
    let report = fx.enforcer.tick(noon()).await;
    assert_eq!(report.reconcile.restarted, vec![key]);
    assert!(report.reconcile.started.is_empty());
    assert_eq!(fx.launcher.terminated(), vec![key]);
    let launches = fx.launcher.launches_of(key);
    assert_eq!(launches.len(), 2);
    assert!(launches[1]
        .args
        .last()
        .is_some_and(|url| url.starts_with("udp://10.9.9.9:7000")));

    for _ in 0..2 {
        let report = fx.enforcer.tick(noon()).await;
        assert!(report.reconcile.restarted.is_empty());
    }
    assert_eq!(fx.launcher.launches_of(key).len(), 2);
}

#[tokio::test]
async fn record_job_is_not_restarted_on_command_change() {
    let mut fx = fixture(vec![live_bundle(4, 40).with_timeshift(600)]);
    fx.enforcer.tick(noon()).await;
    fx.repo
        .update(|bundles| bundles[0].channel.input_url = "udp://@239.99.0.1:5000".into());
    fx.enforcer.tick(noon()).await;
    assert_eq!(fx.launcher.launches_of(JobKey::record(4)).len(), 1);
    assert!(fx.launcher.terminated().is_empty());
}

#[tokio::test]
async fn crashed_job_is_reaped_and_relaunched_in_the_same_tick() {
    let mut fx = fixture(vec![live_bundle(5, 50)]);
    let key = JobKey::playback(5, 50);
    fx.enforcer.tick(noon()).await;

    fx.launcher.crash(key, 1);
    let report = fx.enforcer.tick(noon()).await;
    assert_eq!(report.reconcile.reaped.len(), 1);
    assert_eq!(report.reconcile.reaped[0].key, key);
    assert_eq!(report.reconcile.reaped[0].exit.code, Some(1));
    assert_eq!(report.reconcile.started, vec![key]);
    assert_eq!(fx.launcher.launches_of(key).len(), 2);
}

#[tokio::test]
async fn launch_failures_are_retried_next_tick() {
    let mut fx = fixture(vec![live_bundle(6, 60)]);
    let key = JobKey::playback(6, 60);
    fx.launcher.set_failing(true);
    let report = fx.enforcer.tick(noon()).await;
    assert_eq!(report.reconcile.launch_failures.len(), 1);
    assert!(!fx.enforcer.supervisor().is_running(&key));

    fx.launcher.set_failing(false);
    let report = fx.enforcer.tick(noon()).await;
    assert_eq!(report.reconcile.started, vec![key]);
}

#[tokio::test]
async fn broken_channel_does_not_block_the_others() {
    let mut broken = live_bundle(7, 70);
    broken.targets[0].target_url = String::new();
    let mut fx = fixture(vec![broken, live_bundle(8, 80)]);
    let report = fx.enforcer.tick(noon()).await;
    assert_eq!(report.reconcile.started, vec![JobKey::playback(8, 80)]);
    assert_eq!(report.reconcile.deferred.len(), 1);
    assert!(!report.reconcile.deferred[0].transient);
}

struct FailingRepository;

impl ChannelRepository for FailingRepository {
    fn load_channels(&self) -> StoreResult<Vec<ChannelBundle>> {
        Err(StoreError::MissingStore)
    }
}

#[tokio::test]
async fn store_failure_skips_the_tick_without_stopping_jobs() {
    let media = tempfile::tempdir().unwrap();
    let mut config = ShiftcastConfig::default();
    config.paths.media_root = media.path().to_path_buf();
    let launcher = FakeLauncher::new();
    let repo = Arc::new(StaticChannelRepository::new(vec![live_bundle(9, 90)]));
    let mut enforcer = EnforcerLoop::new(&config, repo, Some(Arc::new(launcher.clone())));
    enforcer.tick(noon()).await;

    let supervisor = enforcer.into_supervisor();
    let mut failing = EnforcerLoop::from_parts(
        Arc::new(FailingRepository),
        supervisor,
        shiftcast_core::RetentionEngine::new(
            shiftcast_core::SegmentInventory::new(config.media_layout()),
            3600,
            0,
        ),
        Duration::from_secs(1),
    );
    let report = failing.tick(noon()).await;
    assert!(report.skipped);
    assert!(failing.supervisor().is_running(&JobKey::playback(9, 90)));
    assert!(launcher.terminated().is_empty());
}

#[tokio::test]
async fn retention_runs_for_auto_delete_channels() {
    let mut bundle = live_bundle(11, 110);
    bundle.channel.retention.enabled = true;
    bundle.channel.retention.max_age_days = Some(1);
    bundle.channel.schedule.days.wednesday = false;
    let mut fx = fixture(vec![bundle]);

    let old = noon() - ChronoDuration::days(3);
    let folder = fx
        .media_root
        .join(format!("recordings/channel11/{}", old.format("%Y%m%d")));
    fs::create_dir_all(&folder).unwrap();
    let segment = folder.join(format!("channel11_{}.ts", old.format("%Y%m%d-%H%M%S")));
    fs::write(&segment, b"ts").unwrap();

    let report = fx.enforcer.tick(noon()).await;
    assert_eq!(report.desired, 0);
    assert_eq!(report.retention.len(), 1);
    assert_eq!(report.retention[0].deleted, 1);
    assert!(!segment.exists());
}

#[tokio::test]
async fn retention_leaves_the_fresh_record_directory_in_place() {
    let mut bundle = live_bundle(14, 140).with_timeshift(600);
    bundle.channel.retention.enabled = true;
    bundle.channel.retention.keep_last_segments = Some(10);
    let mut fx = fixture(vec![bundle]);

    let report = fx.enforcer.tick(noon()).await;
    assert!(report.reconcile.started.contains(&JobKey::record(14)));
    assert_eq!(report.retention.len(), 1);
    assert_eq!(report.retention[0].removed_dirs, 0);
    assert!(fx.media_root.join("recordings/channel14/20240501").is_dir());

    let report = fx.enforcer.tick(noon()).await;
    assert!(report.reconcile.reaped.is_empty());
    assert_eq!(fx.launcher.launches_of(JobKey::record(14)).len(), 1);
}

#[tokio::test]
async fn run_stops_every_job_on_shutdown() {
    let mut fx = fixture(vec![live_bundle(12, 120), live_bundle(13, 130)]);
    let mut stopped = fx
        .enforcer
        .run(tokio::time::sleep(Duration::from_millis(200)))
        .await;
    stopped.sort();
    assert_eq!(
        stopped,
        vec![JobKey::playback(12, 120), JobKey::playback(13, 130)]
    );
    assert_eq!(fx.launcher.terminated().len(), 2);
    assert!(fx.enforcer.supervisor().running_jobs().is_empty());
    assert!(fx.repo.load_channels().is_ok());
}
