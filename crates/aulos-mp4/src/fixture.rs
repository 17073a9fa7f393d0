//! Synthetic containers and tracks for tests.
//!
//! The muxer here writes just enough of a progressive MP4 (ftyp + moov +
//! mdat, one chunk per sample) to exercise the scanner, the metadata parser
//! and the streaming pipeline end to end.

use std::{collections::HashMap, time::Duration};

use aulos_core::StreamKind;

use crate::{
    boxes::FourCc,
    error::ScanReadError,
    scan::ScanRead,
    track::{CodecInfo, SampleTable, Track},
};

/// [`ScanRead`] over an in-memory byte slice.
pub struct SliceReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl ScanRead for SliceReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ScanReadError> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn has_reached_eof(&self) -> bool {
        self.pos == self.data.len()
    }

    fn current_offset(&self) -> u64 {
        self.pos as u64
    }
}

/// Build a [`Track`] directly from `(dts, duration, offset, size, sync)`
/// rows, bypassing the container entirely.
pub fn simple_track(
    id: u32,
    kind: StreamKind,
    timescale: u32,
    rows: &[(u64, u32, u64, u32, bool)],
) -> Track {
    let dts: Vec<u64> = rows.iter().map(|r| r.0).collect();
    let durations: Vec<u32> = rows.iter().map(|r| r.1).collect();
    let offsets: Vec<u64> = rows.iter().map(|r| r.2).collect();
    let sizes: Vec<u32> = rows.iter().map(|r| r.3).collect();
    let sync = if rows.iter().all(|r| r.4) {
        None
    } else {
        Some(rows.iter().map(|r| r.4).collect())
    };

    let duration_ticks = rows.last().map_or(0, |r| r.0 + u64::from(r.1));
    let ts = u64::from(timescale.max(1));
    let duration = Duration::new(
        duration_ticks / ts,
        ((duration_ticks % ts) * 1_000_000_000 / ts) as u32,
    );

    let fourcc = match kind {
        StreamKind::Video => *b"avc1",
        StreamKind::Audio => *b"mp4a",
        StreamKind::Subtitle => *b"tx3g",
    };

    Track {
        id,
        kind,
        language: "und".to_string(),
        timescale,
        duration,
        codec: CodecInfo {
            fourcc: FourCc(fourcc),
        },
        samples: SampleTable::from_parts(dts, durations, offsets, sizes, None, sync),
    }
}

#[derive(Clone, Copy)]
pub struct FixtureSample {
    pub duration_ticks: u32,
    pub size: u32,
    pub sync: bool,
}

impl FixtureSample {
    pub fn new(duration_ticks: u32, size: u32) -> Self {
        Self {
            duration_ticks,
            size,
            sync: false,
        }
    }

    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }
}

#[derive(Clone)]
pub struct FixtureTrack {
    pub id: u32,
    pub kind: StreamKind,
    pub timescale: u32,
    pub codec: [u8; 4],
    pub language: String,
    pub samples: Vec<FixtureSample>,
}

impl FixtureTrack {
    pub fn new(id: u32, kind: StreamKind, timescale: u32, codec: [u8; 4]) -> Self {
        Self {
            id,
            kind,
            timescale,
            codec,
            language: "und".to_string(),
            samples: Vec::new(),
        }
    }

    pub fn language(mut self, lang: &str) -> Self {
        self.language = lang.to_string();
        self
    }

    pub fn sample(mut self, sample: FixtureSample) -> Self {
        self.samples.push(sample);
        self
    }

    /// Evenly-spaced all-sync samples covering `total` seconds.
    pub fn with_uniform_samples(mut self, count: usize, duration_ticks: u32, size: u32) -> Self {
        for _ in 0..count {
            self.samples.push(FixtureSample::new(duration_ticks, size).sync());
        }
        self
    }

    fn dts_seconds(&self, index: usize) -> f64 {
        let ticks: u64 = self.samples[..index]
            .iter()
            .map(|s| u64::from(s.duration_ticks))
            .sum();
        ticks as f64 / f64::from(self.timescale)
    }
}

/// A fully muxed synthetic container.
pub struct MuxedContainer {
    pub bytes: Vec<u8>,
    moov_payload_range: std::ops::Range<usize>,
    payloads: HashMap<(u32, usize), (u64, Vec<u8>)>,
}

impl MuxedContainer {
    pub fn build(tracks: &[FixtureTrack]) -> Self {
        let ftyp = mux_box(b"ftyp", {
            let mut p = Vec::new();
            p.extend_from_slice(b"isom");
            p.extend_from_slice(&0u32.to_be_bytes());
            p.extend_from_slice(b"isomiso2");
            p
        });

        // mdat order: merge all samples by decode time, stable by track
        // position, matching how a progressive muxer interleaves.
        let mut order: Vec<(usize, usize)> = Vec::new();
        for (t, track) in tracks.iter().enumerate() {
            for s in 0..track.samples.len() {
                order.push((t, s));
            }
        }
        order.sort_by(|&(ta, sa), &(tb, sb)| {
            tracks[ta]
                .dts_seconds(sa)
                .partial_cmp(&tracks[tb].dts_seconds(sb))
                .unwrap()
                .then(ta.cmp(&tb))
        });

        // moov size is independent of the offset values, so build once with
        // placeholders to learn the layout, then rebuild with real offsets.
        let zero_offsets: HashMap<(usize, usize), u64> =
            order.iter().map(|&key| (key, 0)).collect();
        let moov_probe = mux_moov(tracks, &zero_offsets);
        let mdat_payload_start = (ftyp.len() + moov_probe.len() + 8) as u64;

        let mut offsets: HashMap<(usize, usize), u64> = HashMap::new();
        let mut at = mdat_payload_start;
        for &(t, s) in &order {
            offsets.insert((t, s), at);
            at += u64::from(tracks[t].samples[s].size);
        }

        let moov = mux_moov(tracks, &offsets);
        assert_eq!(moov.len(), moov_probe.len());

        let mut mdat_payload = Vec::new();
        let mut payloads = HashMap::new();
        for &(t, s) in &order {
            let track = &tracks[t];
            let size = track.samples[s].size as usize;
            let fill = (track.id as usize * 31 + s) as u8;
            let payload = vec![fill; size];
            payloads.insert((track.id, s), (offsets[&(t, s)], payload.clone()));
            mdat_payload.extend_from_slice(&payload);
        }
        let mdat = mux_box(b"mdat", mdat_payload);

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&ftyp);
        let moov_payload_start = bytes.len() + 8;
        bytes.extend_from_slice(&moov);
        let moov_payload_end = bytes.len();
        bytes.extend_from_slice(&mdat);

        Self {
            bytes,
            moov_payload_range: moov_payload_start..moov_payload_end,
            payloads,
        }
    }

    pub fn moov_payload(&self) -> &[u8] {
        &self.bytes[self.moov_payload_range.clone()]
    }

    /// Expected payload bytes of one sample.
    pub fn sample_payload(&self, track_id: u32, index: usize) -> &[u8] {
        &self.payloads[&(track_id, index)].1
    }

    /// Absolute file offset of one sample.
    pub fn sample_offset(&self, track_id: u32, index: usize) -> u64 {
        self.payloads[&(track_id, index)].0
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn mux_box(ty: &[u8; 4], payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
    out.extend_from_slice(ty);
    out.extend_from_slice(&payload);
    out
}

fn full_box_header(version: u8) -> Vec<u8> {
    vec![version, 0, 0, 0]
}

fn mux_moov(tracks: &[FixtureTrack], offsets: &HashMap<(usize, usize), u64>) -> Vec<u8> {
    let movie_duration_ms: u64 = tracks
        .iter()
        .map(|t| {
            let ticks: u64 = t.samples.iter().map(|s| u64::from(s.duration_ticks)).sum();
            ticks * 1000 / u64::from(t.timescale)
        })
        .max()
        .unwrap_or(0);

    let mut payload = mux_box(b"mvhd", {
        let mut p = full_box_header(0);
        p.extend_from_slice(&[0u8; 8]); // creation/modification time
        p.extend_from_slice(&1000u32.to_be_bytes()); // movie timescale
        p.extend_from_slice(&(movie_duration_ms as u32).to_be_bytes());
        p.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate 1.0
        p.extend_from_slice(&0x0100u16.to_be_bytes()); // volume 1.0
        p.extend_from_slice(&[0u8; 10]); // reserved
        p.extend_from_slice(&identity_matrix());
        p.extend_from_slice(&[0u8; 24]); // predefined
        p.extend_from_slice(&u32::MAX.to_be_bytes()); // next track id
        p
    });

    for (t, track) in tracks.iter().enumerate() {
        payload.extend_from_slice(&mux_trak(t, track, offsets));
    }
    mux_box(b"moov", payload)
}

fn identity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}

fn mux_trak(track_pos: usize, track: &FixtureTrack, offsets: &HashMap<(usize, usize), u64>) -> Vec<u8> {
    let duration_ticks: u64 = track
        .samples
        .iter()
        .map(|s| u64::from(s.duration_ticks))
        .sum();

    let tkhd = mux_box(b"tkhd", {
        let mut p = full_box_header(0);
        p[3] = 0x07; // enabled | in movie | in preview
        p.extend_from_slice(&[0u8; 8]); // creation/modification time
        p.extend_from_slice(&track.id.to_be_bytes());
        p.extend_from_slice(&[0u8; 4]); // reserved
        p.extend_from_slice(&((duration_ticks * 1000 / u64::from(track.timescale)) as u32).to_be_bytes());
        p.extend_from_slice(&[0u8; 8]); // reserved
        p.extend_from_slice(&[0u8; 8]); // layer, alternate group, volume, reserved
        p.extend_from_slice(&identity_matrix());
        p.extend_from_slice(&[0u8; 8]); // width, height
        p
    });

    let mdhd = mux_box(b"mdhd", {
        let mut p = full_box_header(0);
        p.extend_from_slice(&[0u8; 8]);
        p.extend_from_slice(&track.timescale.to_be_bytes());
        p.extend_from_slice(&(duration_ticks as u32).to_be_bytes());
        p.extend_from_slice(&pack_language(&track.language).to_be_bytes());
        p.extend_from_slice(&[0u8; 2]); // predefined
        p
    });

    let handler: &[u8; 4] = match track.kind {
        StreamKind::Video => b"vide",
        StreamKind::Audio => b"soun",
        StreamKind::Subtitle => b"sbtl",
    };
    let hdlr = mux_box(b"hdlr", {
        let mut p = full_box_header(0);
        p.extend_from_slice(&[0u8; 4]); // predefined
        p.extend_from_slice(handler);
        p.extend_from_slice(&[0u8; 12]); // reserved
        p.push(0); // empty name
        p
    });

    let stbl = mux_stbl(track_pos, track, offsets);
    let minf = mux_box(b"minf", stbl);
    let mdia = mux_box(b"mdia", [mdhd, hdlr, minf].concat());
    mux_box(b"trak", [tkhd, mdia].concat())
}

fn mux_stbl(track_pos: usize, track: &FixtureTrack, offsets: &HashMap<(usize, usize), u64>) -> Vec<u8> {
    let stsd = mux_box(b"stsd", {
        let mut p = full_box_header(0);
        p.extend_from_slice(&1u32.to_be_bytes()); // entry count
        p.extend_from_slice(&16u32.to_be_bytes()); // minimal sample entry
        p.extend_from_slice(&track.codec);
        p.extend_from_slice(&[0u8; 6]); // reserved
        p.extend_from_slice(&1u16.to_be_bytes()); // data reference index
        p
    });

    // stts: run-length compress consecutive equal deltas.
    let mut runs: Vec<(u32, u32)> = Vec::new();
    for s in &track.samples {
        match runs.last_mut() {
            Some((n, delta)) if *delta == s.duration_ticks => *n += 1,
            _ => runs.push((1, s.duration_ticks)),
        }
    }
    let stts = mux_box(b"stts", {
        let mut p = full_box_header(0);
        p.extend_from_slice(&(runs.len() as u32).to_be_bytes());
        for (n, delta) in runs {
            p.extend_from_slice(&n.to_be_bytes());
            p.extend_from_slice(&delta.to_be_bytes());
        }
        p
    });

    let stsz = mux_box(b"stsz", {
        let mut p = full_box_header(0);
        p.extend_from_slice(&0u32.to_be_bytes()); // per-sample sizes follow
        p.extend_from_slice(&(track.samples.len() as u32).to_be_bytes());
        for s in &track.samples {
            p.extend_from_slice(&s.size.to_be_bytes());
        }
        p
    });

    // One chunk per sample.
    let stsc = mux_box(b"stsc", {
        let mut p = full_box_header(0);
        p.extend_from_slice(&1u32.to_be_bytes());
        p.extend_from_slice(&1u32.to_be_bytes()); // first chunk
        p.extend_from_slice(&1u32.to_be_bytes()); // samples per chunk
        p.extend_from_slice(&1u32.to_be_bytes()); // sample description index
        p
    });

    let stco = mux_box(b"stco", {
        let mut p = full_box_header(0);
        p.extend_from_slice(&(track.samples.len() as u32).to_be_bytes());
        for s in 0..track.samples.len() {
            p.extend_from_slice(&(offsets[&(track_pos, s)] as u32).to_be_bytes());
        }
        p
    });

    let mut children = [stsd, stts, stsz, stsc, stco].concat();

    if track.samples.iter().any(|s| !s.sync) {
        let sync_indices: Vec<u32> = track
            .samples
            .iter()
            .enumerate()
            .filter(|(_, s)| s.sync)
            .map(|(i, _)| i as u32 + 1)
            .collect();
        let stss = mux_box(b"stss", {
            let mut p = full_box_header(0);
            p.extend_from_slice(&(sync_indices.len() as u32).to_be_bytes());
            for idx in sync_indices {
                p.extend_from_slice(&idx.to_be_bytes());
            }
            p
        });
        children.extend_from_slice(&stss);
    }

    mux_box(b"stbl", children)
}

fn pack_language(lang: &str) -> u16 {
    let bytes = lang.as_bytes();
    if bytes.len() != 3 || !bytes.iter().all(u8::is_ascii_lowercase) {
        return 0x55C4; // "und"
    }
    (u16::from(bytes[0] - 0x60) << 10)
        | (u16::from(bytes[1] - 0x60) << 5)
        | u16::from(bytes[2] - 0x60)
}
