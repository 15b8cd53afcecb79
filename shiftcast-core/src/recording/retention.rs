use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use chrono::{Duration, NaiveDateTime};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::models::{Channel, ChannelBundle};

use super::{expand_template, normalize, SegmentFile, SegmentInventory};

/// Counters for one retention pass over a channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub channel_id: i64,
    pub channel: String,
    pub dry_run: bool,
    pub scanned: usize,
    pub deleted: usize,
    pub skipped_protected: usize,
    pub skipped_missing: usize,
    pub skipped_errors: usize,
    pub removed_dirs: usize,
}

#[derive(Debug, Clone)]
pub struct RetentionEngine {
    inventory: SegmentInventory,
    window_seconds: u64,
    safety_margin_seconds: u64,
}

impl RetentionEngine {
    pub fn new(
        inventory: SegmentInventory,
        window_seconds: u64,
        safety_margin_seconds: u64,
    ) -> Self {
        Self {
            inventory,
            window_seconds,
            safety_margin_seconds,
        }
    }

    /// Segments stamped at or after this instant may still be read by playback.
    pub fn protect_threshold(&self, bundle: &ChannelBundle, now: NaiveDateTime) -> NaiveDateTime {
        let delay = u64::from(bundle.active_delay().unwrap_or(0));
        let protected = delay
            + self.window_seconds
            + bundle.channel.segment_seconds()
            + self.safety_margin_seconds;
        now - Duration::seconds(protected.min(u64::from(u32::MAX)) as i64)
    }

    /// Full pass: deletes expired segments, then removes empty recording folders.
    pub fn prune(&self, bundle: &ChannelBundle, now: NaiveDateTime, dry_run: bool) -> PruneReport {
        self.run_pass(bundle, now, dry_run, true)
    }

    /// Deletes expired segments only. Folders are left in place since a record
    /// job may have just been handed an empty output directory.
    pub fn prune_segments(&self, bundle: &ChannelBundle, now: NaiveDateTime) -> PruneReport {
        self.run_pass(bundle, now, false, false)
    }

    fn run_pass(
        &self,
        bundle: &ChannelBundle,
        now: NaiveDateTime,
        dry_run: bool,
        clean_folders: bool,
    ) -> PruneReport {
        let channel = &bundle.channel;
        let mut report = PruneReport {
            channel_id: channel.id,
            channel: channel.name.clone(),
            dry_run,
            ..PruneReport::default()
        };
        let policy = &channel.retention;
        if !policy.enabled {
            return report;
        }

        let prefix = format!("{}_", channel.name);
        let segments: Vec<SegmentFile> = self
            .inventory
            .scan(channel)
            .into_iter()
            .filter(|segment| {
                segment
                    .path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix))
            })
            .collect();
        report.scanned = segments.len();

        let mut candidates: BTreeMap<&Path, NaiveDateTime> = BTreeMap::new();

        if let Some(days) = policy.max_age_days.filter(|days| *days > 0) {
            let cutoff = now - Duration::days(i64::from(days));
            for segment in segments.iter().filter(|segment| segment.timestamp < cutoff) {
                candidates.insert(&segment.path, segment.timestamp);
            }
        }

        // keep-last-N is applied per recording folder
        if let Some(keep) = policy.keep_last_segments.filter(|keep| *keep > 0) {
            let keep = keep as usize;
            let mut by_folder: BTreeMap<&Path, Vec<&SegmentFile>> = BTreeMap::new();
            for segment in &segments {
                by_folder.entry(segment.folder()).or_default().push(segment);
            }
            for items in by_folder.values() {
                if items.len() > keep {
                    for segment in &items[..items.len() - keep] {
                        candidates.insert(&segment.path, segment.timestamp);
                    }
                }
            }
        }

        let protect = self.protect_threshold(bundle, now);
        for (path, timestamp) in candidates {
            if !path.exists() {
                report.skipped_missing += 1;
                continue;
            }
            if timestamp >= protect {
                report.skipped_protected += 1;
                continue;
            }
            if dry_run {
                report.deleted += 1;
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => report.deleted += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => report.skipped_missing += 1,
                Err(err) => {
                    warn!(
                        channel_id = channel.id,
                        path = %path.display(),
                        error = %err,
                        "failed to delete segment"
                    );
                    report.skipped_errors += 1;
                }
            }
        }

        if clean_folders && !dry_run {
            report.removed_dirs = self.remove_empty_folders(channel);
        }

        if report.deleted > 0 || report.skipped_errors > 0 {
            info!(
                channel_id = channel.id,
                scanned = report.scanned,
                deleted = report.deleted,
                protected = report.skipped_protected,
                missing = report.skipped_missing,
                errors = report.skipped_errors,
                dry_run,
                "retention pass finished"
            );
        }
        report
    }

    /// Removes empty directories whose path matches the recording template.
    fn remove_empty_folders(&self, channel: &Channel) -> usize {
        let Some(pattern) = self.folder_pattern(channel) else {
            return 0;
        };
        let root = self.inventory.root(channel);
        let mut removed = 0;
        for entry in WalkDir::new(&root)
            .min_depth(1)
            .contents_first(true)
            .into_iter()
            .filter_map(Result::ok)
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let path = normalize(entry.path());
            if !pattern.is_match(&path.to_string_lossy()) || !is_empty_dir(&path) {
                continue;
            }
            match fs::remove_dir(&path) {
                Ok(()) => removed += 1,
                Err(err) => {
                    warn!(
                        channel_id = channel.id,
                        path = %path.display(),
                        error = %err,
                        "failed to remove empty recording folder"
                    );
                }
            }
        }
        removed
    }

    /// Regex over normalized folder paths, `{date}`/`{time}` matching within one component.
    fn folder_pattern(&self, channel: &Channel) -> Option<Regex> {
        let expanded = expand_template(&channel.recording_path_template, &channel.name, "*", "*");
        let resolved = normalize(&self.inventory.layout().resolve(expanded));
        let resolved = resolved.to_string_lossy();
        if !resolved.contains('*') {
            return None;
        }
        let body = resolved
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join("[^/]*");
        Regex::new(&format!("^{body}$")).ok()
    }
}

fn is_empty_dir(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}
