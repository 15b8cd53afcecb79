use std::fs;
use std::path::{Path, PathBuf};

use chrono::{Duration, NaiveDateTime};
use tracing::debug;

use crate::command::{BuildError, BuildResult};
use crate::models::Channel;

use super::{SegmentFile, SegmentInventory};

/// Segments selected for one delayed playback run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaylistWindow {
    pub start: NaiveDateTime,
    pub target: NaiveDateTime,
    pub segments: Vec<PathBuf>,
}

/// Picks segments stamped within `[now - delay - window, now - delay]`.
///
/// Nothing newer than the delayed target is ever selected, otherwise playback
/// would creep towards live as soon as a fresh segment lands on disk.
pub fn select_window(
    segments: &[SegmentFile],
    now: NaiveDateTime,
    delay_seconds: u32,
    window_seconds: u64,
) -> PlaylistWindow {
    let target = now - Duration::seconds(i64::from(delay_seconds));
    let start = target - Duration::seconds(window_seconds.min(u64::from(u32::MAX)) as i64);

    let mut chosen: Vec<&SegmentFile> = segments
        .iter()
        .filter(|segment| start <= segment.timestamp && segment.timestamp <= target)
        .collect();
    chosen.sort_by_key(|segment| segment.timestamp);

    PlaylistWindow {
        start,
        target,
        segments: chosen.into_iter().map(|segment| segment.path.clone()).collect(),
    }
}

/// Concat demuxer playlist, one `file '<path>'` line per segment.
pub fn render_playlist(paths: &[PathBuf]) -> String {
    let mut out = String::new();
    for path in paths {
        out.push_str("file '");
        out.push_str(&path.to_string_lossy().replace('\'', r"'\''"));
        out.push_str("'\n");
    }
    out
}

#[derive(Debug, Clone)]
pub struct PlaylistWindowBuilder {
    inventory: SegmentInventory,
    window_seconds: u64,
}

impl PlaylistWindowBuilder {
    pub fn new(inventory: SegmentInventory, window_seconds: u64) -> Self {
        Self {
            inventory,
            window_seconds,
        }
    }

    pub fn window_seconds(&self) -> u64 {
        self.window_seconds
    }

    /// Writes the channel's playlist for the current window and returns its path.
    pub fn build_window(
        &self,
        channel: &Channel,
        delay_seconds: u32,
        now: NaiveDateTime,
    ) -> BuildResult<PathBuf> {
        let segments = self.inventory.scan(channel);
        let window = select_window(&segments, now, delay_seconds, self.window_seconds);
        if window.segments.is_empty() {
            return Err(BuildError::SegmentsNotReady {
                channel: channel.name.clone(),
                delay_seconds,
                window_seconds: self.window_seconds,
            });
        }

        let path = self.inventory.layout().playlist_path(channel.id);
        write_playlist(&path, &window.segments)?;
        debug!(
            channel_id = channel.id,
            segments = window.segments.len(),
            target = %window.target,
            "playlist window written"
        );
        Ok(path)
    }
}

fn write_playlist(path: &Path, segments: &[PathBuf]) -> BuildResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| BuildError::io(parent, err))?;
    }
    fs::write(path, render_playlist(segments)).map_err(|err| BuildError::io(path, err))
}
