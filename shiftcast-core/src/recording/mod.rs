//! Recorded segments on disk: where they live, how they are discovered, and
//! how they are consumed (playlist windows) and deleted (retention).

pub mod playlist;
pub mod retention;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local, NaiveDateTime};
use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::config::MediaLayout;
use crate::models::Channel;

pub use playlist::{render_playlist, select_window, PlaylistWindow, PlaylistWindowBuilder};
pub use retention::{PruneReport, RetentionEngine};

pub const SEGMENT_EXTENSION: &str = "ts";
pub const SEGMENT_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// One recorded chunk, stamped in local time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub timestamp: NaiveDateTime,
}

impl SegmentFile {
    pub fn folder(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new(""))
    }
}

/// Substitutes `{channel}`, `{date}` and `{time}` in a recording path template.
pub fn expand_template(template: &str, channel: &str, date: &str, time: &str) -> String {
    template
        .replace("{channel}", channel)
        .replace("{date}", date)
        .replace("{time}", time)
}

/// Directory a record job started at `now` writes into.
pub fn record_directory(layout: &MediaLayout, channel: &Channel, now: NaiveDateTime) -> PathBuf {
    let expanded = expand_template(
        &channel.recording_path_template,
        &channel.name,
        &now.format("%Y%m%d").to_string(),
        &now.format("%H%M%S").to_string(),
    );
    layout.resolve(expanded)
}

/// ffmpeg `-strftime` output pattern for a record job writing into `dir`.
pub fn segment_pattern(dir: &Path, channel: &Channel) -> PathBuf {
    dir.join(format!("{}_%Y%m%d-%H%M%S.{SEGMENT_EXTENSION}", channel.name))
}

/// Finds the recorded segments of a channel below the media root.
#[derive(Debug, Clone)]
pub struct SegmentInventory {
    layout: MediaLayout,
}

impl SegmentInventory {
    pub fn new(layout: MediaLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &MediaLayout {
        &self.layout
    }

    /// The directory scanned for a channel's segments.
    pub fn root(&self, channel: &Channel) -> PathBuf {
        let expanded = expand_template(&channel.recording_path_template, &channel.name, "", "");
        let root = normalize(&self.layout.resolve(expanded));
        if root.exists() {
            root
        } else {
            self.layout.root().join("recordings").join(&channel.name)
        }
    }

    /// Every `.ts` file under the channel root, oldest first.
    pub fn scan(&self, channel: &Channel) -> Vec<SegmentFile> {
        let root = self.root(channel);
        let pattern = filename_pattern(&channel.name);
        let mut segments = Vec::new();

        for entry in WalkDir::new(&root).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(
                        root = %root.display(),
                        error = %err,
                        "skipping unreadable inventory entry"
                    );
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_EXTENSION) {
                continue;
            }
            if let Some(timestamp) = segment_timestamp(&pattern, path) {
                segments.push(SegmentFile {
                    path: path.to_path_buf(),
                    timestamp,
                });
            }
        }

        segments.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.path.cmp(&b.path)));
        segments
    }
}

/// Collapses repeated and trailing separators left behind by empty placeholders.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    path.components().collect()
}

fn filename_pattern(channel_name: &str) -> Option<Regex> {
    Regex::new(&format!(
        r"^{}_(\d{{8}}-\d{{6}})\.{SEGMENT_EXTENSION}$",
        regex::escape(channel_name)
    ))
    .ok()
}

/// Timestamp from `<channel>_YYYYMMDD-HHMMSS.ts`, else the file's mtime.
fn segment_timestamp(pattern: &Option<Regex>, path: &Path) -> Option<NaiveDateTime> {
    let from_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .and_then(|name| pattern.as_ref()?.captures(name))
        .and_then(|captures| {
            NaiveDateTime::parse_from_str(&captures[1], SEGMENT_TIMESTAMP_FORMAT).ok()
        });
    if from_name.is_some() {
        return from_name;
    }
    let modified = std::fs::metadata(path).and_then(|meta| meta.modified()).ok()?;
    Some(DateTime::<Local>::from(modified).naive_local())
}
