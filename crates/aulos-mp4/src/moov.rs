//! `moov` parsing: just enough of the box grammar to flatten each track's
//! sample tables into absolute `(timestamp, file offset, size)` triples.

use std::time::Duration;

use aulos_core::StreamKind;
use tracing::debug;

use crate::{
    boxes::FourCc,
    error::{Mp4Error, Mp4Result},
    track::{CodecInfo, SampleTable, Track},
};

/// Parse a complete `moov` payload into immutable tracks.
///
/// Tracks with handlers the client cannot stream (hint tracks, timed
/// metadata, ...) are skipped.
pub fn parse_moov(payload: &[u8]) -> Mp4Result<Vec<Track>> {
    let mut tracks = Vec::new();

    let mut walker = Walker::new(payload, FourCc::MOOV);
    while let Some((ty, body)) = walker.next_box()? {
        if ty == FourCc::TRAK {
            if let Some(track) = parse_trak(body)? {
                debug!(
                    track_id = track.id,
                    kind = %track.kind,
                    samples = track.samples.len(),
                    "parsed track"
                );
                tracks.push(track);
            }
        }
    }

    if tracks.is_empty() {
        return Err(Mp4Error::malformed_box(
            FourCc::MOOV,
            "no streamable tracks",
        ));
    }
    Ok(tracks)
}

fn parse_trak(body: &[u8]) -> Mp4Result<Option<Track>> {
    let mut track_id = None;
    let mut mdia: Option<&[u8]> = None;

    let mut walker = Walker::new(body, FourCc::TRAK);
    while let Some((ty, child)) = walker.next_box()? {
        match ty {
            FourCc::TKHD => track_id = Some(parse_tkhd(child)?),
            FourCc::MDIA => mdia = Some(child),
            _ => {}
        }
    }

    let (Some(track_id), Some(mdia)) = (track_id, mdia) else {
        return Err(Mp4Error::malformed_box(
            FourCc::TRAK,
            "missing track or media header",
        ));
    };

    let mut header = None;
    let mut kind = None;
    let mut stbl: Option<&[u8]> = None;

    let mut walker = Walker::new(mdia, FourCc::MDIA);
    while let Some((ty, child)) = walker.next_box()? {
        match ty {
            FourCc::MDHD => header = Some(parse_mdhd(child)?),
            FourCc::HDLR => kind = parse_hdlr(child)?,
            FourCc::MINF => {
                let mut minf = Walker::new(child, FourCc::MINF);
                while let Some((ty, grandchild)) = minf.next_box()? {
                    if ty == FourCc::STBL {
                        stbl = Some(grandchild);
                    }
                }
            }
            _ => {}
        }
    }

    let Some(kind) = kind else {
        // Hint/metadata track; not an error, just not ours.
        return Ok(None);
    };
    let Some(MediaHeader {
        timescale,
        duration_ticks,
        language,
    }) = header
    else {
        return Err(Mp4Error::malformed_box(FourCc::MDIA, "missing media header"));
    };
    let Some(stbl) = stbl else {
        return Err(Mp4Error::malformed_box(FourCc::MDIA, "missing sample table"));
    };

    let raw = parse_stbl(stbl)?;
    let (samples, codec) = build_sample_table(raw)?;

    let duration = if let Some(ticks) = duration_ticks {
        ticks_to_duration(ticks, timescale)
    } else {
        // Unset media duration; derive from the last sample.
        match samples.len().checked_sub(1) {
            Some(last) => ticks_to_duration(samples.dts_ticks(last), timescale),
            None => Duration::ZERO,
        }
    };

    Ok(Some(Track {
        id: track_id,
        kind,
        language,
        timescale,
        duration,
        codec,
        samples,
    }))
}

struct MediaHeader {
    timescale: u32,
    duration_ticks: Option<u64>,
    language: String,
}

fn parse_tkhd(body: &[u8]) -> Mp4Result<u32> {
    let version = *body
        .first()
        .ok_or_else(|| Mp4Error::malformed_box(FourCc::TKHD, "empty"))?;
    let id_at = if version == 1 { 20 } else { 12 };
    be_u32(body, id_at, FourCc::TKHD)
}

fn parse_mdhd(body: &[u8]) -> Mp4Result<MediaHeader> {
    let version = *body
        .first()
        .ok_or_else(|| Mp4Error::malformed_box(FourCc::MDHD, "empty"))?;

    let (timescale, duration_raw, lang_at) = if version == 1 {
        (
            be_u32(body, 20, FourCc::MDHD)?,
            be_u64(body, 24, FourCc::MDHD)?,
            32,
        )
    } else {
        (
            be_u32(body, 12, FourCc::MDHD)?,
            u64::from(be_u32(body, 16, FourCc::MDHD)?),
            20,
        )
    };
    if timescale == 0 {
        return Err(Mp4Error::malformed_box(FourCc::MDHD, "zero timescale"));
    }

    let unset = if version == 1 {
        duration_raw == u64::MAX
    } else {
        duration_raw == u64::from(u32::MAX)
    };
    let duration_ticks = (!unset && duration_raw != 0).then_some(duration_raw);

    let packed = be_u16(body, lang_at, FourCc::MDHD)?;
    let language = decode_language(packed);

    Ok(MediaHeader {
        timescale,
        duration_ticks,
        language,
    })
}

fn decode_language(packed: u16) -> String {
    if packed == 0 || packed == 0x7FFF {
        return "und".to_string();
    }
    let chars = [
        ((packed >> 10) & 0x1F) as u8 + 0x60,
        ((packed >> 5) & 0x1F) as u8 + 0x60,
        (packed & 0x1F) as u8 + 0x60,
    ];
    match std::str::from_utf8(&chars) {
        Ok(s) if chars.iter().all(u8::is_ascii_lowercase) => s.to_string(),
        _ => "und".to_string(),
    }
}

fn parse_hdlr(body: &[u8]) -> Mp4Result<Option<StreamKind>> {
    let handler = FourCc([
        *body.get(8).ok_or_else(|| Mp4Error::malformed_box(FourCc::HDLR, "short"))?,
        *body.get(9).ok_or_else(|| Mp4Error::malformed_box(FourCc::HDLR, "short"))?,
        *body.get(10).ok_or_else(|| Mp4Error::malformed_box(FourCc::HDLR, "short"))?,
        *body.get(11).ok_or_else(|| Mp4Error::malformed_box(FourCc::HDLR, "short"))?,
    ]);
    Ok(match &handler.0 {
        b"vide" => Some(StreamKind::Video),
        b"soun" => Some(StreamKind::Audio),
        b"text" | b"sbtl" | b"subt" => Some(StreamKind::Subtitle),
        _ => None,
    })
}

#[derive(Default)]
struct RawStbl {
    codec: Option<FourCc>,
    stts: Vec<(u32, u32)>,
    ctts: Option<Vec<(u32, i32)>>,
    uniform_size: u32,
    sizes: Vec<u32>,
    sample_count: u32,
    stsc: Vec<(u32, u32)>,
    chunk_offsets: Vec<u64>,
    stss: Option<Vec<u32>>,
}

fn parse_stbl(body: &[u8]) -> Mp4Result<RawStbl> {
    let mut raw = RawStbl::default();

    let mut walker = Walker::new(body, FourCc::STBL);
    while let Some((ty, child)) = walker.next_box()? {
        match ty {
            FourCc::STSD => {
                // entry_count, then the first sample entry's size + format.
                let count = be_u32(child, 4, FourCc::STSD)?;
                if count > 0 {
                    raw.codec = Some(FourCc([
                        *child.get(12).ok_or_else(|| {
                            Mp4Error::malformed_box(FourCc::STSD, "short sample entry")
                        })?,
                        *child.get(13).unwrap_or(&0),
                        *child.get(14).unwrap_or(&0),
                        *child.get(15).unwrap_or(&0),
                    ]));
                }
            }
            FourCc::STTS => {
                let count = be_u32(child, 4, FourCc::STTS)? as usize;
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    entries.push((
                        be_u32(child, 8 + i * 8, FourCc::STTS)?,
                        be_u32(child, 12 + i * 8, FourCc::STTS)?,
                    ));
                }
                raw.stts = entries;
            }
            FourCc::CTTS => {
                let count = be_u32(child, 4, FourCc::CTTS)? as usize;
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    entries.push((
                        be_u32(child, 8 + i * 8, FourCc::CTTS)?,
                        be_u32(child, 12 + i * 8, FourCc::CTTS)? as i32,
                    ));
                }
                raw.ctts = Some(entries);
            }
            FourCc::STSZ => {
                raw.uniform_size = be_u32(child, 4, FourCc::STSZ)?;
                raw.sample_count = be_u32(child, 8, FourCc::STSZ)?;
                if raw.uniform_size == 0 {
                    let count = raw.sample_count as usize;
                    let mut sizes = Vec::with_capacity(count);
                    for i in 0..count {
                        sizes.push(be_u32(child, 12 + i * 4, FourCc::STSZ)?);
                    }
                    raw.sizes = sizes;
                }
            }
            FourCc::STSC => {
                let count = be_u32(child, 4, FourCc::STSC)? as usize;
                let mut entries = Vec::with_capacity(count);
                for i in 0..count {
                    entries.push((
                        be_u32(child, 8 + i * 12, FourCc::STSC)?,
                        be_u32(child, 12 + i * 12, FourCc::STSC)?,
                    ));
                }
                raw.stsc = entries;
            }
            FourCc::STCO => {
                let count = be_u32(child, 4, FourCc::STCO)? as usize;
                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    offsets.push(u64::from(be_u32(child, 8 + i * 4, FourCc::STCO)?));
                }
                raw.chunk_offsets = offsets;
            }
            FourCc::CO64 => {
                let count = be_u32(child, 4, FourCc::CO64)? as usize;
                let mut offsets = Vec::with_capacity(count);
                for i in 0..count {
                    offsets.push(be_u64(child, 8 + i * 8, FourCc::CO64)?);
                }
                raw.chunk_offsets = offsets;
            }
            FourCc::STSS => {
                let count = be_u32(child, 4, FourCc::STSS)? as usize;
                let mut indices = Vec::with_capacity(count);
                for i in 0..count {
                    indices.push(be_u32(child, 8 + i * 4, FourCc::STSS)?);
                }
                raw.stss = Some(indices);
            }
            _ => {}
        }
    }

    Ok(raw)
}

fn build_sample_table(raw: RawStbl) -> Mp4Result<(SampleTable, CodecInfo)> {
    let codec = CodecInfo {
        fourcc: raw.codec.unwrap_or(FourCc([0; 4])),
    };

    let stts_total: u64 = raw.stts.iter().map(|&(n, _)| u64::from(n)).sum();
    if stts_total != u64::from(raw.sample_count) {
        return Err(Mp4Error::malformed_box(
            FourCc::STTS,
            format!(
                "timing covers {stts_total} samples but size table declares {}",
                raw.sample_count
            ),
        ));
    }
    let count = raw.sample_count as usize;

    // Decode timestamps and durations from the delta runs.
    let mut dts = Vec::with_capacity(count);
    let mut durations = Vec::with_capacity(count);
    let mut t = 0u64;
    for &(n, delta) in &raw.stts {
        for _ in 0..n {
            dts.push(t);
            durations.push(delta);
            t += u64::from(delta);
        }
    }

    // Sizes.
    let sizes: Vec<u32> = if raw.uniform_size != 0 {
        vec![raw.uniform_size; count]
    } else {
        if raw.sizes.len() != count {
            return Err(Mp4Error::malformed_box(FourCc::STSZ, "size table short"));
        }
        raw.sizes
    };

    // Absolute offsets: chunk base plus the cumulative size of preceding
    // samples within the chunk.
    if raw.stsc.is_empty() && count > 0 {
        return Err(Mp4Error::malformed_box(FourCc::STSC, "empty chunk map"));
    }
    let mut offsets = Vec::with_capacity(count);
    let mut sample = 0usize;
    'chunks: for (chunk_idx, &chunk_base) in raw.chunk_offsets.iter().enumerate() {
        let chunk_no = chunk_idx as u32 + 1;
        let per_chunk = raw
            .stsc
            .iter()
            .take_while(|&&(first, _)| first <= chunk_no)
            .last()
            .map(|&(_, n)| n)
            .ok_or_else(|| {
                Mp4Error::malformed_box(FourCc::STSC, "chunk precedes first run")
            })?;

        let mut within = 0u64;
        for _ in 0..per_chunk {
            if sample == count {
                break 'chunks;
            }
            offsets.push(chunk_base + within);
            within += u64::from(sizes[sample]);
            sample += 1;
        }
    }
    if sample != count {
        return Err(Mp4Error::malformed_box(
            FourCc::STCO,
            format!("chunk offsets cover {sample} of {count} samples"),
        ));
    }

    // Sync flags: absent table means every sample is a sync sample.
    let sync = match raw.stss {
        None => None,
        Some(indices) => {
            let mut flags = vec![false; count];
            for one_based in indices {
                let idx = one_based
                    .checked_sub(1)
                    .map(|i| i as usize)
                    .filter(|&i| i < count)
                    .ok_or_else(|| {
                        Mp4Error::malformed_box(FourCc::STSS, "sync index out of range")
                    })?;
                flags[idx] = true;
            }
            Some(flags)
        }
    };

    // Composition offsets, expanded per sample.
    let composition = match raw.ctts {
        None => None,
        Some(runs) => {
            let mut out = Vec::with_capacity(count);
            for (n, offset) in runs {
                for _ in 0..n {
                    out.push(offset);
                }
            }
            if out.len() != count {
                return Err(Mp4Error::malformed_box(FourCc::CTTS, "run length mismatch"));
            }
            Some(out)
        }
    };

    Ok((
        SampleTable::from_parts(dts, durations, offsets, sizes, composition, sync),
        codec,
    ))
}

fn ticks_to_duration(ticks: u64, timescale: u32) -> Duration {
    let ts = u64::from(timescale);
    Duration::new(ticks / ts, ((ticks % ts) * 1_000_000_000 / ts) as u32)
}

/// Iterates the child boxes of a fully-buffered payload.
struct Walker<'a> {
    data: &'a [u8],
    pos: usize,
    enclosing: FourCc,
}

impl<'a> Walker<'a> {
    fn new(data: &'a [u8], enclosing: FourCc) -> Self {
        Self {
            data,
            pos: 0,
            enclosing,
        }
    }

    fn next_box(&mut self) -> Mp4Result<Option<(FourCc, &'a [u8])>> {
        if self.pos == self.data.len() {
            return Ok(None);
        }
        let data: &'a [u8] = self.data;
        let rest = &data[self.pos..];
        if rest.len() < 8 {
            return Err(Mp4Error::malformed_box(
                self.enclosing,
                "trailing bytes shorter than a box header",
            ));
        }

        let size32 = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let ty = FourCc([rest[4], rest[5], rest[6], rest[7]]);

        let (header_len, total) = match size32 {
            0 => (8usize, rest.len() as u64),
            1 => {
                if rest.len() < 16 {
                    return Err(Mp4Error::malformed_box(self.enclosing, "short largesize"));
                }
                let large = u64::from_be_bytes([
                    rest[8], rest[9], rest[10], rest[11], rest[12], rest[13], rest[14], rest[15],
                ]);
                (16usize, large)
            }
            n => (8usize, u64::from(n)),
        };

        if total < header_len as u64 || total > rest.len() as u64 {
            return Err(Mp4Error::malformed_box(
                self.enclosing,
                format!("child '{ty}' size {total} exceeds its parent"),
            ));
        }

        let total = total as usize;
        let body = &rest[header_len..total];
        self.pos += total;
        Ok(Some((ty, body)))
    }
}

fn be_u16(b: &[u8], at: usize, ty: FourCc) -> Mp4Result<u16> {
    b.get(at..at + 2)
        .map(|s| u16::from_be_bytes([s[0], s[1]]))
        .ok_or_else(|| Mp4Error::malformed_box(ty, "unexpected end of box"))
}

fn be_u32(b: &[u8], at: usize, ty: FourCc) -> Mp4Result<u32> {
    b.get(at..at + 4)
        .map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
        .ok_or_else(|| Mp4Error::malformed_box(ty, "unexpected end of box"))
}

fn be_u64(b: &[u8], at: usize, ty: FourCc) -> Mp4Result<u64> {
    b.get(at..at + 8)
        .map(|s| u64::from_be_bytes([s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7]]))
        .ok_or_else(|| Mp4Error::malformed_box(ty, "unexpected end of box"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FixtureSample, FixtureTrack, MuxedContainer};

    fn video_track() -> FixtureTrack {
        FixtureTrack::new(1, StreamKind::Video, 1000, *b"avc1")
            .sample(FixtureSample::new(100, 100).sync())
            .sample(FixtureSample::new(100, 150))
            .sample(FixtureSample::new(100, 150))
            .sample(FixtureSample::new(100, 200).sync())
    }

    fn audio_track() -> FixtureTrack {
        FixtureTrack::new(2, StreamKind::Audio, 48_000, *b"mp4a")
            .language("eng")
            .sample(FixtureSample::new(1024, 40))
            .sample(FixtureSample::new(1024, 40))
    }

    #[test]
    fn parses_two_track_movie() {
        let muxed = MuxedContainer::build(&[video_track(), audio_track()]);
        let tracks = parse_moov(muxed.moov_payload()).unwrap();
        assert_eq!(tracks.len(), 2);

        let video = &tracks[0];
        assert_eq!(video.id, 1);
        assert_eq!(video.kind, StreamKind::Video);
        assert_eq!(video.timescale, 1000);
        assert_eq!(video.codec.fourcc, FourCc(*b"avc1"));
        assert_eq!(video.samples.len(), 4);
        assert_eq!(video.duration, Duration::from_millis(400));

        let audio = &tracks[1];
        assert_eq!(audio.id, 2);
        assert_eq!(audio.kind, StreamKind::Audio);
        assert_eq!(audio.language, "eng");
        assert_eq!(audio.samples.len(), 2);
    }

    #[test]
    fn sample_offsets_are_absolute_and_cumulative() {
        let muxed = MuxedContainer::build(&[video_track()]);
        let tracks = parse_moov(muxed.moov_payload()).unwrap();
        let table = &tracks[0].samples;

        // Every sample's offset points at exactly its payload in the file.
        for idx in 0..table.len() {
            let offset = table.offset(idx) as usize;
            let size = table.size(idx) as usize;
            let expected = muxed.sample_payload(1, idx);
            assert_eq!(&muxed.bytes[offset..offset + size], expected);
        }
    }

    #[test]
    fn timing_and_sync_flags() {
        let muxed = MuxedContainer::build(&[video_track()]);
        let track = &parse_moov(muxed.moov_payload()).unwrap()[0];

        let s0 = track.sample(0).unwrap();
        assert_eq!(s0.dts, Duration::ZERO);
        assert_eq!(s0.duration, Duration::from_millis(100));
        assert!(s0.is_sync);

        let s2 = track.sample(2).unwrap();
        assert_eq!(s2.dts, Duration::from_millis(200));
        assert!(!s2.is_sync);

        let s3 = track.sample(3).unwrap();
        assert!(s3.is_sync);
    }

    #[test]
    fn all_samples_sync_without_sync_table() {
        let muxed = MuxedContainer::build(&[audio_track()]);
        let track = &parse_moov(muxed.moov_payload()).unwrap()[0];
        assert!((0..track.samples.len()).all(|i| track.samples.is_sync(i)));
    }

    #[test]
    fn rejects_moov_without_tracks() {
        // An mvhd-only moov payload.
        let mut payload = Vec::new();
        payload.extend_from_slice(&(8u32 + 4).to_be_bytes());
        payload.extend_from_slice(b"mvhd");
        payload.extend_from_slice(&[0u8; 4]);

        assert!(matches!(
            parse_moov(&payload),
            Err(Mp4Error::MalformedBox { .. })
        ));
    }

    #[test]
    fn rejects_child_larger_than_parent() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&64u32.to_be_bytes());
        payload.extend_from_slice(b"trak");
        payload.extend_from_slice(&[0u8; 8]); // only 8 payload bytes present

        assert!(matches!(
            parse_moov(&payload),
            Err(Mp4Error::MalformedBox { .. })
        ));
    }

    #[test]
    fn language_decoding() {
        assert_eq!(decode_language(0), "und");
        // 'e'-0x60=5, 'n'-0x60=14, 'g'-0x60=7 → 0b00101_01110_00111
        assert_eq!(decode_language(0b0001_0101_1100_0111), "eng");
    }
}
