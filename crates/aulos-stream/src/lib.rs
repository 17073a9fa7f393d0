#![forbid(unsafe_code)]

//! Streaming orchestration for aulos.
//!
//! Wires the pieces into a pipeline: a [`PlaylistWorker`] downloads the
//! leading metadata region and builds the [`aulos_asset::MediaAsset`];
//! a [`SegmentReaderWorker`] then executes one
//! [`aulos_asset::SegmentRequest`] at a time — fetch session in, access
//! units out. The ring buffer is the only synchronization point between the
//! network tasks and the demux thread.

mod error;
mod events;
mod fetch;
mod playlist;
mod reader;
mod ring_reader;
mod sink;

pub use error::{StreamError, StreamResult};
pub use events::{StreamContext, StreamEvent};
pub use fetch::{FetchOptions, FetchRequest, FetchSession};
pub use playlist::{PlaylistOptions, PlaylistWorker};
pub use reader::{SegmentReaderWorker, WorkerOptions, WorkerState};
pub use ring_reader::RingScanReader;
pub use sink::{AccessUnit, AccessUnitSink, SegmentOutcome, SegmentState, SinkError};
