use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::track::{SampleInfo, Track};

/// How a time-based search resolves to a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    /// Last sample starting at or before the target.
    Before,
    /// First sample starting at or after the target.
    After,
    /// Last sample starting strictly before the target.
    StrictlyBefore,
    /// First sample starting strictly after the target.
    StrictlyAfter,
    /// Whichever neighbor is closer; equal distances resolve to the earlier
    /// sample.
    Closest,
}

impl SearchMode {
    fn searches_forward(self) -> bool {
        matches!(self, Self::After | Self::StrictlyAfter | Self::Closest)
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SeekError {
    /// No sample satisfies the search; the track genuinely has nothing
    /// there.
    #[error("no sample satisfies the search")]
    NotFound,

    /// The sample tables covering the target are not available yet; retry
    /// once more metadata has arrived.
    #[error("sample tables for the target are not available yet")]
    InsufficientData,

    /// The target lies at or past the end of the track. Not a failure —
    /// the caller decides whether this track is simply finished.
    #[error("target is at or past the end of the track")]
    EndOfStream,
}

/// Stateful cursor over one track's sample table.
///
/// Single-writer: each in-flight segment request gets its own cursor, and
/// two requests never share one.
#[derive(Debug, Clone)]
pub struct TrackCursor {
    track: Arc<Track>,
    /// Current sample index; `None` before the first positioning call.
    index: Option<usize>,
}

impl TrackCursor {
    pub fn new(track: Arc<Track>) -> Self {
        Self { track, index: None }
    }

    pub fn track(&self) -> &Arc<Track> {
        &self.track
    }

    /// Position the cursor on the sample selected by `(time, mode)`.
    pub fn seek_to_time(&mut self, time: Duration, mode: SearchMode) -> Result<(), SeekError> {
        let table = &self.track.samples;
        if table.is_empty() {
            return Err(SeekError::NotFound);
        }
        if mode.searches_forward() && time >= self.track.duration {
            return Err(SeekError::EndOfStream);
        }

        let ticks = self.track.duration_to_ticks(time);
        let found = match mode {
            SearchMode::Before => table.last_at_or_before(ticks).ok_or(SeekError::NotFound)?,
            SearchMode::StrictlyBefore => match table.last_at_or_before(ticks) {
                Some(idx) if table.dts_ticks(idx) == ticks => {
                    idx.checked_sub(1).ok_or(SeekError::NotFound)?
                }
                Some(idx) => idx,
                None => return Err(SeekError::NotFound),
            },
            SearchMode::After => table
                .first_at_or_after(ticks)
                .ok_or(SeekError::EndOfStream)?,
            SearchMode::StrictlyAfter => {
                let idx = match table.first_at_or_after(ticks) {
                    Some(idx) if table.dts_ticks(idx) == ticks => idx + 1,
                    Some(idx) => idx,
                    None => return Err(SeekError::EndOfStream),
                };
                if idx >= table.len() {
                    return Err(SeekError::EndOfStream);
                }
                idx
            }
            SearchMode::Closest => {
                let before = table.last_at_or_before(ticks);
                let after = match before {
                    Some(idx) if idx + 1 < table.len() => Some(idx + 1),
                    Some(_) => None,
                    None => Some(0),
                };
                match (before, after) {
                    (Some(b), Some(a)) => {
                        let d_before = ticks - table.dts_ticks(b);
                        let d_after = table.dts_ticks(a) - ticks;
                        // Equal distances resolve to the earlier sample.
                        if d_after < d_before {
                            a
                        } else {
                            b
                        }
                    }
                    (Some(b), None) => b,
                    (None, Some(a)) => a,
                    (None, None) => return Err(SeekError::NotFound),
                }
            }
        };

        self.index = Some(found);
        Ok(())
    }

    /// Move to the next sample in file-offset order and return it.
    ///
    /// A fresh cursor yields the first sample. Past the last sample this
    /// keeps returning [`SeekError::EndOfStream`].
    pub fn advance(&mut self) -> Result<SampleInfo, SeekError> {
        let next = match self.index {
            None => 0,
            Some(idx) => idx + 1,
        };
        let info = self.track.sample(next).ok_or(SeekError::EndOfStream)?;
        self.index = Some(next);
        Ok(info)
    }

    /// The sample the cursor is currently positioned on.
    pub fn current(&self) -> Option<SampleInfo> {
        self.index.and_then(|idx| self.track.sample(idx))
    }

    pub fn file_offset_of_current(&self) -> Option<u64> {
        self.current().map(|s| s.offset)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::fixture::simple_track;

    /// dts (ms): 0, 100, 200, 300; offsets 0, 100, 250, 400.
    fn track() -> Arc<Track> {
        Arc::new(simple_track(
            7,
            aulos_core::StreamKind::Video,
            1000,
            &[
                (0, 100, 0, 100, true),
                (100, 100, 100, 150, false),
                (200, 100, 250, 150, true),
                (300, 100, 400, 200, false),
            ],
        ))
    }

    #[rstest]
    #[case::before(SearchMode::Before)]
    #[case::after(SearchMode::After)]
    #[case::strictly_before(SearchMode::StrictlyBefore)]
    #[case::strictly_after(SearchMode::StrictlyAfter)]
    #[case::closest(SearchMode::Closest)]
    fn seek_is_idempotent(#[case] mode: SearchMode) {
        let target = Duration::from_millis(150);

        let mut first = TrackCursor::new(track());
        first.seek_to_time(target, mode).unwrap();

        let mut second = TrackCursor::new(track());
        second.seek_to_time(target, mode).unwrap();

        assert_eq!(first.current(), second.current());
    }

    #[rstest]
    #[case::exact_hit(SearchMode::Before, 200, 2)]
    #[case::between(SearchMode::Before, 250, 2)]
    #[case::exact_excluded(SearchMode::StrictlyBefore, 200, 1)]
    #[case::forward_exact(SearchMode::After, 200, 2)]
    #[case::forward_between(SearchMode::After, 150, 2)]
    #[case::forward_exact_excluded(SearchMode::StrictlyAfter, 200, 3)]
    #[case::closest_low(SearchMode::Closest, 130, 1)]
    #[case::closest_high(SearchMode::Closest, 170, 2)]
    fn search_modes(#[case] mode: SearchMode, #[case] ms: u64, #[case] expected_index: usize) {
        let mut cursor = TrackCursor::new(track());
        cursor
            .seek_to_time(Duration::from_millis(ms), mode)
            .unwrap();
        assert_eq!(cursor.current().unwrap().index, expected_index);
    }

    #[test]
    fn closest_tie_breaks_to_earlier_sample() {
        let mut cursor = TrackCursor::new(track());
        // 150ms is exactly between the samples at 100ms and 200ms.
        cursor
            .seek_to_time(Duration::from_millis(150), SearchMode::Closest)
            .unwrap();
        assert_eq!(cursor.current().unwrap().index, 1);
    }

    #[rstest]
    #[case::after(SearchMode::After)]
    #[case::strictly_after(SearchMode::StrictlyAfter)]
    #[case::closest(SearchMode::Closest)]
    fn forward_search_past_duration_is_end_of_stream(#[case] mode: SearchMode) {
        let mut cursor = TrackCursor::new(track());
        let err = cursor
            .seek_to_time(Duration::from_millis(400), mode)
            .unwrap_err();
        assert_eq!(err, SeekError::EndOfStream);
    }

    #[test]
    fn backward_search_past_duration_still_lands() {
        let mut cursor = TrackCursor::new(track());
        cursor
            .seek_to_time(Duration::from_secs(10), SearchMode::Before)
            .unwrap();
        assert_eq!(cursor.current().unwrap().index, 3);
    }

    #[test]
    fn empty_track_has_no_data_at_all() {
        let empty = Arc::new(simple_track(9, aulos_core::StreamKind::Audio, 1000, &[]));
        let mut cursor = TrackCursor::new(empty);
        assert_eq!(
            cursor.seek_to_time(Duration::ZERO, SearchMode::Before),
            Err(SeekError::NotFound)
        );
    }

    #[test]
    fn advance_walks_in_file_offset_order_then_ends() {
        let mut cursor = TrackCursor::new(track());
        let offsets: Vec<u64> = std::iter::from_fn(|| cursor.advance().ok().map(|s| s.offset))
            .collect();
        assert_eq!(offsets, vec![0, 100, 250, 400]);
        assert_eq!(cursor.advance(), Err(SeekError::EndOfStream));
        assert_eq!(cursor.advance(), Err(SeekError::EndOfStream));
        // The cursor stays parked on the last sample.
        assert_eq!(cursor.file_offset_of_current(), Some(400));
    }

    #[test]
    fn seek_then_advance_continues_from_position() {
        let mut cursor = TrackCursor::new(track());
        cursor
            .seek_to_time(Duration::from_millis(100), SearchMode::Before)
            .unwrap();
        assert_eq!(cursor.advance().unwrap().index, 2);
    }

    #[test]
    fn seek_before_first_sample_strictly_is_not_found() {
        let mut cursor = TrackCursor::new(track());
        assert_eq!(
            cursor.seek_to_time(Duration::ZERO, SearchMode::StrictlyBefore),
            Err(SeekError::NotFound)
        );
    }
}
