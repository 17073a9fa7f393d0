#![forbid(unsafe_code)]

//! Shared kernel types for aulos.
//!
//! Everything here is deliberately tiny: stream kinds, the download-id
//! generator handed around instead of a process-wide global, and a bitrate
//! estimate helper used by asset metadata.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("duration must be non-zero to estimate a bitrate")]
    ZeroDuration,
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Kind of an elementary stream inside the container.
///
/// Ordering matters: `Video` outranks `Audio` outranks `Subtitle` when a
/// primary track is selected for a segment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
}

impl StreamKind {
    /// Rank for primary-track selection; lower is preferred.
    pub fn selection_rank(self) -> u8 {
        match self {
            Self::Video => 0,
            Self::Audio => 1,
            Self::Subtitle => 2,
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Video => f.write_str("video"),
            Self::Audio => f.write_str("audio"),
            Self::Subtitle => f.write_str("subtitle"),
        }
    }
}

/// Monotonic download-id source.
///
/// Owned by the top-level streaming context and passed by handle; ids are
/// unique per generator, not per process.
#[derive(Debug, Clone, Default)]
pub struct DownloadIdGen {
    next: Arc<AtomicU64>,
}

impl DownloadIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Integer bits-per-second estimate from a byte count over a wall duration.
///
/// # Errors
///
/// Returns [`CoreError::ZeroDuration`] for a zero duration.
pub fn estimate_bitrate(bytes: u64, duration: Duration) -> CoreResult<u64> {
    let secs = duration.as_secs_f64();
    if secs <= 0.0 {
        return Err(CoreError::ZeroDuration);
    }
    Ok(((bytes as f64) * 8.0 / secs).round() as u64)
}
