use std::time::Duration;

use aulos_core::StreamKind;
use aulos_mp4::FourCc;
use aulos_net::{ConnectionInfo, RangeSpec};

/// Playback-looping counters threaded through segment requests so playback
/// can restart seamlessly at end of content.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopState {
    pub enabled: bool,
    pub loop_count: u32,
    /// Absolute playback time at which the current loop iteration began.
    pub base_time: Duration,
}

/// One unit of work for the segment reader: a bounded byte span of the
/// container covering the primary track and its dependent tracks.
///
/// Owned by exactly one reader at a time; the fields below the marker are
/// progress/diagnostics the owning reader fills in while working.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRequest {
    pub download_id: u64,
    pub primary_track_id: u32,
    pub primary_kind: StreamKind,
    pub dependent_track_ids: Vec<u32>,

    /// First byte of the segment.
    pub start_offset: u64,
    /// Last byte (inclusive); `None` leaves the segment open until end of
    /// stream.
    pub end_offset: Option<u64>,
    /// Decode timestamp expected at the start of the segment.
    pub first_timestamp: Duration,

    pub is_first: bool,
    pub is_last: bool,
    pub is_continuation: bool,
    /// Every selected track was already at end of stream; there is nothing
    /// to download and playback can stop cleanly.
    pub all_tracks_ended: bool,
    /// Replace this segment's media with filler; nothing is downloaded or
    /// emitted, timestamps simply advance.
    pub insert_filler_data: bool,

    pub retry_count: u32,
    pub loop_state: LoopState,

    // -- filled in by the owning segment reader --
    /// Byte position demuxing has verifiably reached; retries resume here.
    pub cursor_byte_pos: u64,
    /// Largest `dts + duration` emitted across this segment's tracks; feeds
    /// the loop base time.
    pub largest_end_timestamp: Duration,
    /// Exact byte span covered by this segment's samples.
    pub bytes_in_segment: u64,
    pub connection_info: Option<ConnectionInfo>,
}

impl SegmentRequest {
    /// The HTTP byte range this segment should fetch.
    pub fn byte_range(&self) -> RangeSpec {
        RangeSpec::new(self.start_offset, self.end_offset)
    }

    /// All track ids this segment demuxes, primary first.
    pub fn selected_track_ids(&self) -> Vec<u32> {
        let mut ids = Vec::with_capacity(1 + self.dependent_track_ids.len());
        ids.push(self.primary_track_id);
        ids.extend_from_slice(&self.dependent_track_ids);
        ids
    }
}

/// Read-only track metadata exposed to the playback scheduler.
#[derive(Debug, Clone)]
pub struct TrackDescriptor {
    pub id: u32,
    pub kind: StreamKind,
    pub codec: FourCc,
    pub language: String,
    pub duration: Duration,
    /// Average bitrate estimate from the sample tables, when derivable.
    pub bitrate: Option<u64>,
}
