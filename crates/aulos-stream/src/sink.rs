use std::time::Duration;

use aulos_asset::SegmentRequest;
use aulos_core::StreamKind;
use bytes::Bytes;
use thiserror::Error;

/// One decodable sample plus timing, handed to the downstream decoder.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub track_id: u32,
    pub kind: StreamKind,
    pub dts: Duration,
    pub pts: Duration,
    pub duration: Duration,
    pub is_sync: bool,
    pub data: Bytes,
}

#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink cannot take the unit right now; the reader retries with
    /// bounded backoff.
    #[error("downstream backpressure")]
    Backpressure,

    #[error("sink failure: {0}")]
    Fatal(String),
}

/// Terminal state of one segment request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    Completed,
    Failed,
    Cancelled,
}

/// Final report for one segment: the request with its download statistics
/// populated, the terminal state, and the error detail when there was one.
#[derive(Debug, Clone)]
pub struct SegmentOutcome {
    pub state: SegmentState,
    pub request: SegmentRequest,
    pub error: Option<String>,
}

/// Downstream consumer of demuxed media.
///
/// Called from the segment reader's worker thread. `on_segment_done` fires
/// for every request, whatever its terminal state, so statistics are never
/// lost.
pub trait AccessUnitSink: Send {
    fn on_access_unit(&mut self, unit: AccessUnit) -> Result<(), SinkError>;

    /// One track hit its true end of stream; the sink can finalize it while
    /// other tracks keep producing.
    fn on_track_ended(&mut self, track_id: u32, kind: StreamKind);

    fn on_segment_done(&mut self, outcome: SegmentOutcome);
}
