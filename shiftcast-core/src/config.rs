use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::models::JobKey;

pub const DEFAULT_PLAYLIST_WINDOW_SECONDS: u64 = 3 * 3600;
pub const DEFAULT_SAFETY_MARGIN_SECONDS: u64 = 3600;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ShiftcastConfig {
    pub paths: PathsSection,
    pub enforcer: EnforcerSection,
    pub playback: PlaybackSection,
    pub retention: RetentionSection,
    pub ffmpeg: FfmpegSection,
    pub logging: LoggingSection,
}

impl ShiftcastConfig {
    /// Rebases relative `media_root` and `store` paths onto `base`.
    pub fn with_base_dir<P: AsRef<Path>>(mut self, base: P) -> Self {
        let base = base.as_ref();
        self.paths.media_root = rebase(base, &self.paths.media_root);
        self.paths.store = rebase(base, &self.paths.store);
        self
    }

    pub fn media_layout(&self) -> MediaLayout {
        MediaLayout::new(&self.paths.media_root)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.enforcer.poll_interval_seconds)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.enforcer.stop_timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.enforcer.poll_interval_seconds == 0 {
            return Err(ConfigError::Invalid {
                key: "enforcer.poll_interval_seconds",
                reason: "must be greater than zero".into(),
            });
        }
        if self.ffmpeg.binary.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                key: "ffmpeg.binary",
                reason: "must not be empty".into(),
            });
        }
        Ok(())
    }
}

fn rebase(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub media_root: PathBuf,
    pub store: PathBuf,
}

impl Default for PathsSection {
    fn default() -> Self {
        Self {
            media_root: PathBuf::from("media"),
            store: PathBuf::from("data/channels.sqlite"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EnforcerSection {
    pub poll_interval_seconds: u64,
    pub stop_timeout_seconds: u64,
}

impl Default for EnforcerSection {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            stop_timeout_seconds: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlaybackSection {
    pub playlist_window_seconds: u64,
}

impl Default for PlaybackSection {
    fn default() -> Self {
        Self {
            playlist_window_seconds: DEFAULT_PLAYLIST_WINDOW_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    pub safety_margin_seconds: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            safety_margin_seconds: DEFAULT_SAFETY_MARGIN_SECONDS,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FfmpegSection {
    pub binary: PathBuf,
}

impl Default for FfmpegSection {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("ffmpeg"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// On-disk layout below the media root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaLayout {
    root: PathBuf,
}

impl MediaLayout {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins relative paths under the media root, keeps absolute ones.
    pub fn resolve<P: AsRef<Path>>(&self, candidate: P) -> PathBuf {
        rebase(&self.root, candidate.as_ref())
    }

    pub fn playlist_path(&self, channel_id: i64) -> PathBuf {
        self.root
            .join("playlists")
            .join(format!("channel_{channel_id}"))
            .join("concat.txt")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs").join("ffmpeg")
    }

    pub fn job_log_path(&self, key: &JobKey) -> PathBuf {
        let target = key
            .target_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "none".to_string());
        self.log_dir().join(format!(
            "ffmpeg_ch{}_{}_t{}.log",
            key.channel_id,
            key.purpose.as_str(),
            target
        ))
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ShiftcastConfig> {
    let path = path.as_ref();
    let config: ShiftcastConfig = load_toml(path)?;
    config.validate()?;
    let base = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Ok(config.with_base_dir(base))
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}
