use std::time::Duration;

use aulos_core::StreamKind;

use crate::boxes::FourCc;

/// Codec descriptor — the sample-entry fourcc plus whatever the metadata
/// parse could cheaply recover.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecInfo {
    pub fourcc: FourCc,
}

/// One decodable sample and where to find it in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleInfo {
    pub track_id: u32,
    pub kind: StreamKind,
    /// Index into the track's sample table.
    pub index: usize,
    /// Decode timestamp.
    pub dts: Duration,
    /// Presentation timestamp (dts shifted by the composition offset).
    pub pts: Duration,
    pub duration: Duration,
    /// Absolute file offset of the sample payload.
    pub offset: u64,
    pub size: u32,
    pub is_sync: bool,
}

impl SampleInfo {
    /// First byte past the sample payload.
    pub fn end_offset(&self) -> u64 {
        self.offset + u64::from(self.size)
    }

    /// Decode end timestamp (dts + duration).
    pub fn end_dts(&self) -> Duration {
        self.dts + self.duration
    }
}

/// Flattened per-track sample table, struct-of-arrays.
///
/// All vectors have identical length; `sync` is `None` when every sample is
/// a sync sample. Timestamps are in track timescale ticks.
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    dts: Vec<u64>,
    durations: Vec<u32>,
    offsets: Vec<u64>,
    sizes: Vec<u32>,
    composition_offsets: Option<Vec<i32>>,
    sync: Option<Vec<bool>>,
}

impl SampleTable {
    /// Assemble a table from parallel columns.
    ///
    /// # Panics
    ///
    /// Panics if column lengths disagree — the metadata parser validates
    /// box-level counts before getting here.
    pub fn from_parts(
        dts: Vec<u64>,
        durations: Vec<u32>,
        offsets: Vec<u64>,
        sizes: Vec<u32>,
        composition_offsets: Option<Vec<i32>>,
        sync: Option<Vec<bool>>,
    ) -> Self {
        let n = dts.len();
        assert_eq!(durations.len(), n);
        assert_eq!(offsets.len(), n);
        assert_eq!(sizes.len(), n);
        if let Some(c) = &composition_offsets {
            assert_eq!(c.len(), n);
        }
        if let Some(s) = &sync {
            assert_eq!(s.len(), n);
        }
        Self {
            dts,
            durations,
            offsets,
            sizes,
            composition_offsets,
            sync,
        }
    }

    pub fn len(&self) -> usize {
        self.dts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dts.is_empty()
    }

    pub fn dts_ticks(&self, index: usize) -> u64 {
        self.dts[index]
    }

    pub fn offset(&self, index: usize) -> u64 {
        self.offsets[index]
    }

    pub fn size(&self, index: usize) -> u32 {
        self.sizes[index]
    }

    pub fn is_sync(&self, index: usize) -> bool {
        self.sync.as_ref().map_or(true, |s| s[index])
    }

    /// Index of the last sync sample at or before `index`.
    pub fn sync_at_or_before(&self, index: usize) -> Option<usize> {
        (0..=index).rev().find(|&i| self.is_sync(i))
    }

    /// Binary search: index of the last sample with `dts <= ticks`.
    pub fn last_at_or_before(&self, ticks: u64) -> Option<usize> {
        match self.dts.partition_point(|&t| t <= ticks) {
            0 => None,
            n => Some(n - 1),
        }
    }

    /// Binary search: index of the first sample with `dts >= ticks`.
    pub fn first_at_or_after(&self, ticks: u64) -> Option<usize> {
        let idx = self.dts.partition_point(|&t| t < ticks);
        (idx < self.dts.len()).then_some(idx)
    }

    /// Binary search over file offsets: first sample at or past `offset`.
    ///
    /// Valid because samples are stored in file-offset order.
    pub fn first_offset_at_or_after(&self, offset: u64) -> Option<usize> {
        let idx = self.offsets.partition_point(|&o| o < offset);
        (idx < self.offsets.len()).then_some(idx)
    }
}

/// Immutable parsed track. Shared read-only by all cursors and the asset.
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub kind: StreamKind,
    /// ISO-639-2/T language from the media header (`und` when unset).
    pub language: String,
    pub timescale: u32,
    pub duration: Duration,
    pub codec: CodecInfo,
    pub samples: SampleTable,
}

impl Track {
    pub fn ticks_to_duration(&self, ticks: u64) -> Duration {
        if self.timescale == 0 {
            return Duration::ZERO;
        }
        let ts = u64::from(self.timescale);
        let secs = ticks / ts;
        let nanos = (ticks % ts) * 1_000_000_000 / ts;
        Duration::new(secs, nanos as u32)
    }

    pub fn duration_to_ticks(&self, d: Duration) -> u64 {
        (d.as_secs_f64() * f64::from(self.timescale)).round() as u64
    }

    /// Materialize one sample's info, converting ticks to durations.
    pub fn sample(&self, index: usize) -> Option<SampleInfo> {
        if index >= self.samples.len() {
            return None;
        }
        let dts_ticks = self.samples.dts[index];
        let dur_ticks = u64::from(self.samples.durations[index]);
        let comp = self
            .samples
            .composition_offsets
            .as_ref()
            .map_or(0i64, |c| i64::from(c[index]));
        let pts_ticks = (dts_ticks as i64 + comp).max(0) as u64;

        Some(SampleInfo {
            track_id: self.id,
            kind: self.kind,
            index,
            dts: self.ticks_to_duration(dts_ticks),
            pts: self.ticks_to_duration(pts_ticks),
            duration: self.ticks_to_duration(dur_ticks),
            offset: self.samples.offsets[index],
            size: self.samples.sizes[index],
            is_sync: self.samples.is_sync(index),
        })
    }

    /// Total bytes across all samples (for bitrate estimates).
    pub fn total_sample_bytes(&self) -> u64 {
        self.samples.sizes.iter().map(|&s| u64::from(s)).sum()
    }
}
