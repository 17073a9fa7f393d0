use aulos_mp4::Mp4Error;
use aulos_net::NetError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// A segment request is already in flight; the single-outstanding-
    /// request invariant forbids queueing another.
    #[error("a segment request is already active; try again later")]
    TryAgainLater,

    #[error("network failure: {0}")]
    Net(#[from] NetError),

    #[error("container failure: {0}")]
    Mp4(#[from] Mp4Error),

    #[error("worker thread is gone")]
    WorkerGone,

    #[error("unknown track id {0}")]
    UnknownTrack(u32),

    #[error("sink rejected an access unit: {0}")]
    Sink(String),

    #[error("ring buffer starved: waited for {wanted} bytes at offset {offset}")]
    StarvedBuffer { offset: u64, wanted: usize },

    #[error("byte stream ended {missing} bytes short of a complete sample")]
    TruncatedSample { missing: usize },

    #[error("cancelled")]
    Cancelled,
}

pub type StreamResult<T> = Result<T, StreamError>;
