use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error(
        "no recorded segments ready for channel {channel:?} (delay={delay_seconds}s, window={window_seconds}s)"
    )]
    SegmentsNotReady {
        channel: String,
        delay_seconds: u32,
        window_seconds: u64,
    },
    #[error("invalid output target: {0}")]
    InvalidTarget(String),
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl BuildError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Transient failures are expected to resolve on their own on a later tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, BuildError::SegmentsNotReady { .. })
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;
