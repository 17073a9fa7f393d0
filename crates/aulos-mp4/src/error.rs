use thiserror::Error;

use crate::boxes::FourCc;

/// Error surfaced by a [`ScanRead`](crate::ScanRead) implementation.
#[derive(Debug, Error, Clone)]
#[error("{detail}")]
pub struct ScanReadError {
    pub detail: String,
}

impl ScanReadError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum Mp4Error {
    /// The first box of the file was not the file-type box.
    #[error("leading box '{found}' is not a file-type box; not a supported container")]
    NotAContainer { found: FourCc },

    #[error("malformed box header at offset {at_offset}")]
    MalformedHeader { at_offset: u64 },

    #[error("malformed '{box_type}' box: {detail}")]
    MalformedBox { box_type: FourCc, detail: String },

    /// The stream ended in the middle of a box header or payload.
    #[error("container truncated at offset {at_offset}")]
    Truncated { at_offset: u64 },

    /// End of file was reached before the required metadata box; the file is
    /// not organized for progressive playback.
    #[error("metadata box not found before end of file; file is not progressive")]
    IncompleteMetadata,

    #[error("read failed at offset {at_offset}: {source}")]
    Read {
        at_offset: u64,
        #[source]
        source: ScanReadError,
    },
}

impl Mp4Error {
    pub fn malformed_box(box_type: FourCc, detail: impl Into<String>) -> Self {
        Self::MalformedBox {
            box_type,
            detail: detail.into(),
        }
    }

    /// Format errors are fatal and non-retryable.
    pub fn is_format_error(&self) -> bool {
        !matches!(self, Self::Read { .. })
    }
}

pub type Mp4Result<T> = Result<T, Mp4Error>;
