use std::{sync::Arc, time::Duration};

use aulos_core::{estimate_bitrate, DownloadIdGen, StreamKind};
use aulos_mp4::{SampleInfo, SearchMode, SeekError, Track, TrackCursor};
use tracing::debug;

use crate::{
    error::{AssetError, AssetResult},
    request::{LoopState, SegmentRequest, TrackDescriptor},
};

/// Capability interface shared by every container flavor that can synthesize
/// segment requests. The playback scheduler depends only on this.
pub trait SegmentSource: Send + Sync {
    fn get_starting_segment(
        &self,
        start_time: Duration,
        mode: SearchMode,
    ) -> AssetResult<SegmentRequest>;

    fn get_next_segment(&self, current: &SegmentRequest) -> AssetResult<SegmentRequest>;

    fn get_retry_segment(
        &self,
        current: &SegmentRequest,
        allow_filler: bool,
    ) -> AssetResult<SegmentRequest>;

    fn get_looping_segment(
        &self,
        finished: &[SegmentRequest],
        start_time: Duration,
        mode: SearchMode,
    ) -> AssetResult<SegmentRequest>;

    fn get_track_metadata(&self, kind: Option<StreamKind>) -> Vec<TrackDescriptor>;

    fn get_total_duration(&self) -> Duration;

    /// Seekable span: total duration minus a trailing guard, so seeks never
    /// land past the last locatable sync point.
    fn get_seekable_range(&self) -> (Duration, Duration);
}

#[derive(Debug, Clone)]
pub struct AssetOptions {
    /// Hard cap on any single segment's byte span, independent of content
    /// bitrate.
    pub max_segment_size: u64,
    /// Upper bound on the trailing seek guard.
    pub seek_guard_cap: Duration,
}

impl Default for AssetOptions {
    fn default() -> Self {
        Self {
            max_segment_size: 4 * 1024 * 1024,
            seek_guard_cap: Duration::from_secs(1),
        }
    }
}

/// Immutable parsed asset: all tracks, the overall duration, and the
/// segment-request synthesis on top of them.
///
/// Tracks are immutable after [`build`](Self::build), so every synthesis
/// method is safe to call concurrently without further locking.
pub struct MediaAsset {
    tracks: Vec<Arc<Track>>,
    total_duration: Duration,
    ids: DownloadIdGen,
    options: AssetOptions,
}

impl MediaAsset {
    pub fn build(tracks: Vec<Track>, ids: DownloadIdGen, options: AssetOptions) -> Arc<Self> {
        let total_duration = tracks.iter().map(|t| t.duration).max().unwrap_or_default();
        let mut tracks: Vec<Arc<Track>> = tracks.into_iter().map(Arc::new).collect();
        // Stable rank order: the richest timeline first, file order within a
        // kind.
        tracks.sort_by_key(|t| t.kind.selection_rank());
        Arc::new(Self {
            tracks,
            total_duration,
            ids,
            options,
        })
    }

    pub fn tracks(&self) -> &[Arc<Track>] {
        &self.tracks
    }

    pub fn track_by_id(&self, id: u32) -> Option<&Arc<Track>> {
        self.tracks.iter().find(|t| t.id == id)
    }

    /// Fresh single-writer cursor over one track.
    pub fn create_cursor(&self, track_id: u32) -> Option<TrackCursor> {
        self.track_by_id(track_id)
            .map(|t| TrackCursor::new(t.clone()))
    }

    fn new_request(&self, primary: &Track, start_offset: u64) -> SegmentRequest {
        SegmentRequest {
            download_id: self.ids.next_id(),
            primary_track_id: primary.id,
            primary_kind: primary.kind,
            dependent_track_ids: Vec::new(),
            start_offset,
            end_offset: None,
            first_timestamp: Duration::ZERO,
            is_first: false,
            is_last: false,
            is_continuation: false,
            all_tracks_ended: false,
            insert_filler_data: false,
            retry_count: 0,
            loop_state: LoopState::default(),
            cursor_byte_pos: start_offset,
            largest_end_timestamp: Duration::ZERO,
            bytes_in_segment: 0,
            connection_info: None,
        }
    }

    /// Walk the selected tracks' samples interleaved by file offset from
    /// `start_offset` and bound the span at the size cap.
    ///
    /// `end_offset` stays `None` when every remaining sample fits — the
    /// segment runs to the unbounded tail. The recorded byte count is always
    /// the exact accumulated span, never the cap value.
    fn bound_span(&self, track_ids: &[u32], primary_id: u32, start_offset: u64) -> Option<BoundedSpan> {
        let tracks: Vec<&Arc<Track>> = track_ids
            .iter()
            .filter_map(|id| self.track_by_id(*id))
            .collect();
        let mut walk = InterleavedWalk::new(&tracks, start_offset);

        let mut end: Option<u64> = None;
        let mut first_ts: Option<Duration> = None;
        let mut first_primary_ts: Option<Duration> = None;
        let mut truncated = false;

        while let Some(peek) = walk.peek() {
            if end.is_some() && peek.offset - start_offset >= self.options.max_segment_size {
                truncated = true;
                break;
            }
            let sample = walk.next().expect("peeked sample");
            if first_ts.is_none() {
                first_ts = Some(sample.dts);
            }
            if first_primary_ts.is_none() && sample.track_id == primary_id {
                first_primary_ts = Some(sample.dts);
            }
            end = Some(end.map_or(sample.end_offset(), |e| e.max(sample.end_offset())));
        }

        let end = end?;
        Some(BoundedSpan {
            end_offset: truncated.then(|| end - 1),
            bytes: end - start_offset,
            first_timestamp: first_primary_ts.or(first_ts).unwrap_or_default(),
            is_last: !truncated,
        })
    }

    /// First sample at or past `offset` on any selected track.
    fn first_sample_at_or_after(&self, track_ids: &[u32], offset: u64) -> Option<SampleInfo> {
        let tracks: Vec<&Arc<Track>> = track_ids
            .iter()
            .filter_map(|id| self.track_by_id(*id))
            .collect();
        InterleavedWalk::new(&tracks, offset).next()
    }
}

struct BoundedSpan {
    end_offset: Option<u64>,
    bytes: u64,
    first_timestamp: Duration,
    is_last: bool,
}

impl SegmentSource for MediaAsset {
    fn get_starting_segment(
        &self,
        start_time: Duration,
        mode: SearchMode,
    ) -> AssetResult<SegmentRequest> {
        // Seek every track; the best-ranked track with data becomes the
        // primary, exhausted tracks drop out, and a track whose tables are
        // not parseable yet aborts the whole request.
        let mut located: Vec<(&Arc<Track>, SampleInfo)> = Vec::new();
        let mut any_at_eos = false;
        let mut any_with_data = false;

        for track in &self.tracks {
            let mut cursor = TrackCursor::new(track.clone());
            match cursor.seek_to_time(start_time, mode) {
                Ok(()) => {
                    let mut sample = cursor.current().expect("seek positioned the cursor");
                    // Video playback must begin on a sync sample.
                    if track.kind == StreamKind::Video && !sample.is_sync {
                        if let Some(sync_idx) = track.samples.sync_at_or_before(sample.index) {
                            sample = track.sample(sync_idx).expect("sync index in range");
                        }
                    }
                    located.push((track, sample));
                    any_with_data = true;
                }
                Err(SeekError::EndOfStream) => any_at_eos = true,
                Err(SeekError::NotFound) => {}
                Err(SeekError::InsufficientData) => return Err(AssetError::BeforeStart),
            }
        }

        if !any_with_data {
            if any_at_eos {
                // Every track that has data is past its end: a clean stop,
                // flagged on the request rather than reported as an error.
                let primary = self.tracks.first().ok_or(AssetError::NotFound)?;
                let mut request = self.new_request(primary, 0);
                request.all_tracks_ended = true;
                request.is_first = true;
                request.is_last = true;
                request.first_timestamp = start_time;
                return Ok(request);
            }
            return Err(AssetError::NotFound);
        }

        // `self.tracks` is rank-sorted, so the first located track wins.
        let (primary_track, primary_sample) = located[0];
        let start_offset = primary_sample.offset;
        let dependent_ids: Vec<u32> = located[1..].iter().map(|(t, _)| t.id).collect();

        let mut selected = vec![primary_track.id];
        selected.extend_from_slice(&dependent_ids);
        let span = self
            .bound_span(&selected, primary_track.id, start_offset)
            .ok_or(AssetError::NotFound)?;

        debug!(
            primary = primary_track.id,
            kind = %primary_track.kind,
            start_offset,
            end_offset = ?span.end_offset,
            bytes = span.bytes,
            "starting segment"
        );

        let mut request = self.new_request(primary_track, start_offset);
        request.dependent_track_ids = dependent_ids;
        request.end_offset = span.end_offset;
        request.first_timestamp = primary_sample.dts;
        request.is_first = true;
        request.is_last = span.is_last;
        request.bytes_in_segment = span.bytes;
        Ok(request)
    }

    fn get_next_segment(&self, current: &SegmentRequest) -> AssetResult<SegmentRequest> {
        if current.all_tracks_ended {
            return Err(AssetError::PastEnd);
        }
        let Some(end) = current.end_offset else {
            // The current segment already runs to the unbounded tail.
            return Err(AssetError::PastEnd);
        };

        let start_offset = end + 1;
        let selected = current.selected_track_ids();
        let span = self
            .bound_span(&selected, current.primary_track_id, start_offset)
            .ok_or(AssetError::PastEnd)?;

        let primary = self
            .track_by_id(current.primary_track_id)
            .ok_or(AssetError::NotFound)?;

        let mut request = self.new_request(primary, start_offset);
        request.dependent_track_ids = current.dependent_track_ids.clone();
        request.end_offset = span.end_offset;
        request.first_timestamp = span.first_timestamp;
        request.is_continuation = true;
        request.is_last = span.is_last;
        request.bytes_in_segment = span.bytes;
        request.loop_state = current.loop_state;
        Ok(request)
    }

    fn get_retry_segment(
        &self,
        current: &SegmentRequest,
        allow_filler: bool,
    ) -> AssetResult<SegmentRequest> {
        if allow_filler {
            // Reuse the request as-is and let the reader substitute filler.
            let mut request = current.clone();
            request.download_id = self.ids.next_id();
            request.insert_filler_data = true;
            request.retry_count += 1;
            request.connection_info = None;
            return Ok(request);
        }

        // Resume from the last demuxed byte position, not the segment start.
        let resume = current.cursor_byte_pos.max(current.start_offset);
        if let Some(end) = current.end_offset {
            if resume > end {
                return Err(AssetError::NotFound);
            }
        }

        let selected = current.selected_track_ids();
        let first = self
            .first_sample_at_or_after(&selected, resume)
            .ok_or(AssetError::NotFound)?;

        let primary = self
            .track_by_id(current.primary_track_id)
            .ok_or(AssetError::NotFound)?;

        let mut request = self.new_request(primary, resume);
        request.dependent_track_ids = current.dependent_track_ids.clone();
        request.end_offset = current.end_offset;
        request.first_timestamp = first.dts;
        request.is_first = current.is_first && resume == current.start_offset;
        request.is_last = current.is_last;
        request.is_continuation = current.is_continuation || resume > current.start_offset;
        request.retry_count = current.retry_count + 1;
        request.loop_state = current.loop_state;
        request.bytes_in_segment = match current.end_offset {
            Some(end) => end + 1 - resume,
            None => current
                .bytes_in_segment
                .saturating_sub(resume - current.start_offset),
        };
        Ok(request)
    }

    fn get_looping_segment(
        &self,
        finished: &[SegmentRequest],
        start_time: Duration,
        mode: SearchMode,
    ) -> AssetResult<SegmentRequest> {
        if finished.is_empty() {
            return Err(AssetError::PastEnd);
        }

        // The loop restarts at the largest end timestamp any finished
        // segment reached, so playback time keeps increasing monotonically.
        let base_time = finished
            .iter()
            .map(|r| r.largest_end_timestamp)
            .max()
            .unwrap_or_default();
        let loop_count = finished
            .iter()
            .map(|r| r.loop_state.loop_count)
            .max()
            .unwrap_or(0)
            + 1;

        match self.get_starting_segment(start_time, mode) {
            Ok(mut request) if !request.all_tracks_ended => {
                request.loop_state = LoopState {
                    enabled: true,
                    loop_count,
                    base_time,
                };
                Ok(request)
            }
            // No valid restart point: really done now.
            _ => Err(AssetError::PastEnd),
        }
    }

    fn get_track_metadata(&self, kind: Option<StreamKind>) -> Vec<TrackDescriptor> {
        self.tracks
            .iter()
            .filter(|t| kind.is_none_or(|k| t.kind == k))
            .map(|t| TrackDescriptor {
                id: t.id,
                kind: t.kind,
                codec: t.codec.fourcc,
                language: t.language.clone(),
                duration: t.duration,
                bitrate: estimate_bitrate(t.total_sample_bytes(), t.duration).ok(),
            })
            .collect()
    }

    fn get_total_duration(&self) -> Duration {
        self.total_duration
    }

    fn get_seekable_range(&self) -> (Duration, Duration) {
        let guard = self
            .tracks
            .first()
            .and_then(|t| {
                let last = t.samples.len().checked_sub(1)?;
                let sync = t.samples.sync_at_or_before(last)?;
                let sync_dts = t.ticks_to_duration(t.samples.dts_ticks(sync));
                Some(t.duration.saturating_sub(sync_dts))
            })
            .unwrap_or_default()
            .min(self.options.seek_guard_cap);
        (
            Duration::ZERO,
            self.total_duration.saturating_sub(guard),
        )
    }
}

/// Merges the selected tracks' samples in ascending file-offset order,
/// starting at a byte position.
struct InterleavedWalk<'a> {
    fronts: Vec<(&'a Arc<Track>, Option<usize>)>,
}

impl<'a> InterleavedWalk<'a> {
    fn new(tracks: &[&'a Arc<Track>], start_offset: u64) -> Self {
        let fronts = tracks
            .iter()
            .map(|t| (*t, t.samples.first_offset_at_or_after(start_offset)))
            .collect();
        Self { fronts }
    }

    fn peek(&self) -> Option<SampleInfo> {
        self.fronts
            .iter()
            .filter_map(|(t, idx)| idx.and_then(|i| t.sample(i)))
            .min_by_key(|s| s.offset)
    }

    fn next(&mut self) -> Option<SampleInfo> {
        let min = self.peek()?;
        for (t, idx) in &mut self.fronts {
            if t.id == min.track_id {
                let next = idx.map(|i| i + 1);
                *idx = next.filter(|&i| i < t.samples.len());
                break;
            }
        }
        Some(min)
    }
}
