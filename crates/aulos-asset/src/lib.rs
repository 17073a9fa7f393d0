#![forbid(unsafe_code)]

//! Asset model and segment-request synthesis.
//!
//! A [`MediaAsset`] holds the immutable parsed tracks of one progressive
//! container and translates playback intents — start here, continue, retry,
//! loop — into bounded [`SegmentRequest`]s for the segment reader.

mod asset;
mod error;
mod request;

pub use asset::{AssetOptions, MediaAsset, SegmentSource};
pub use error::{AssetError, AssetResult};
pub use request::{LoopState, SegmentRequest, TrackDescriptor};
