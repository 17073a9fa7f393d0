#![forbid(unsafe_code)]

//! Container-format layer of aulos.
//!
//! This crate owns exactly as much MP4 as the streaming client needs: an
//! incremental top-level box scanner that finds the metadata region of a
//! progressive file, a `moov` parser that flattens sample tables into
//! per-track `(timestamp, offset, size)` triples, and a seekable cursor over
//! those tables. Full box-grammar decoding beyond that is out of scope.

mod boxes;
mod cursor;
mod error;
mod moov;
mod scan;
mod track;

#[cfg(any(test, feature = "test-fixtures"))]
pub mod fixture;

pub use boxes::{BoxHeader, BoxSize, FourCc};
pub use cursor::{SearchMode, SeekError, TrackCursor};
pub use error::{Mp4Error, Mp4Result, ScanReadError};
pub use moov::parse_moov;
pub use scan::{BoxInfo, BoxScanner, MetadataSink, ScanControl, ScanRead, ScanSummary};
pub use track::{CodecInfo, SampleInfo, SampleTable, Track};
