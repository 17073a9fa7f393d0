use tracing::{debug, trace};

use crate::{
    boxes::{BoxHeader, BoxSize, FourCc},
    error::{Mp4Error, Mp4Result, ScanReadError},
};

/// Read side of the scanner: three callbacks over an incrementally arriving
/// byte stream. The scanner never seeks; it only consumes forward.
pub trait ScanRead {
    /// Read up to `buf.len()` bytes. Returning `Ok(0)` means end of data.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ScanReadError>;

    fn has_reached_eof(&self) -> bool;

    /// Absolute offset of the next byte `read` would return.
    fn current_offset(&self) -> u64;
}

/// One recognized top-level box, as passed to the notification callback.
#[derive(Debug, Clone, Copy)]
pub struct BoxInfo {
    pub box_type: FourCc,
    pub box_size: BoxSize,
    pub file_offset: u64,
    pub payload_offset: u64,
}

/// Notification callback verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanControl {
    Continue,
    Stop,
}

/// Collaborator receiving recognized metadata box payloads.
pub trait MetadataSink {
    fn on_metadata_box(&mut self, box_type: FourCc, payload: &[u8]) -> Mp4Result<()>;
}

/// What the scan saw before it stopped.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    pub saw_file_type: bool,
    pub saw_movie_metadata: bool,
    /// Major brand from the file-type box payload, when present.
    pub major_brand: Option<FourCc>,
    /// The fragment/media-data box the scan stopped at, with its offset.
    pub stopped_at: Option<(FourCc, u64)>,
    /// Offset of the first byte that was not consumed by the scan.
    pub resume_offset: u64,
}

impl ScanSummary {
    /// True when enough metadata was seen to build an asset.
    pub fn has_required_metadata(&self) -> bool {
        self.saw_file_type && self.saw_movie_metadata
    }
}

enum Fill {
    Full,
    /// Stream ended after `got` of the requested bytes.
    Eof { got: usize },
}

/// Incremental top-level box scanner.
///
/// Walks self-describing boxes through a [`ScanRead`], notifying `on_box`
/// once per recognized header and handing metadata payloads to the
/// [`MetadataSink`]. Scanning stops successfully at the first fragment-index
/// or media-data box.
pub struct BoxScanner;

impl BoxScanner {
    const SKIP_CHUNK: usize = 16 * 1024;

    pub fn scan<R, F, M>(reader: &mut R, metadata: &mut M, mut on_box: F) -> Mp4Result<ScanSummary>
    where
        R: ScanRead,
        F: FnMut(&BoxInfo) -> ScanControl,
        M: MetadataSink,
    {
        let mut summary = ScanSummary::default();
        let mut first_box = true;

        loop {
            let file_offset = reader.current_offset();
            summary.resume_offset = file_offset;

            let mut prefix = [0u8; BoxHeader::BASE_LEN];
            match Self::fill(reader, &mut prefix)? {
                Fill::Full => {}
                Fill::Eof { got: 0 } if !first_box => {
                    // Clean end of file between boxes.
                    if summary.saw_movie_metadata {
                        return Ok(summary);
                    }
                    return Err(Mp4Error::IncompleteMetadata);
                }
                Fill::Eof { .. } => {
                    return Err(Mp4Error::Truncated {
                        at_offset: file_offset,
                    });
                }
            }

            let (size32, box_type) = BoxHeader::decode_prefix(&prefix);

            let mut header_len = BoxHeader::BASE_LEN as u64;
            let box_size = match size32 {
                0 => BoxSize::ToEof,
                1 => {
                    let mut large = [0u8; BoxHeader::LARGESIZE_LEN];
                    match Self::fill(reader, &mut large)? {
                        Fill::Full => {}
                        Fill::Eof { .. } => {
                            return Err(Mp4Error::Truncated {
                                at_offset: file_offset,
                            })
                        }
                    }
                    header_len += BoxHeader::LARGESIZE_LEN as u64;
                    BoxSize::Sized(u64::from_be_bytes(large))
                }
                n => BoxSize::Sized(u64::from(n)),
            };

            // Extended uuid box types carry 16 extra header bytes we never
            // interpret.
            if box_type == FourCc::UUID {
                let mut ext = [0u8; 16];
                match Self::fill(reader, &mut ext)? {
                    Fill::Full => {}
                    Fill::Eof { .. } => {
                        return Err(Mp4Error::Truncated {
                            at_offset: file_offset,
                        })
                    }
                }
                header_len += 16;
            }

            if let BoxSize::Sized(total) = box_size {
                if total < header_len {
                    return Err(Mp4Error::MalformedHeader {
                        at_offset: file_offset,
                    });
                }
            }

            if first_box {
                if box_type != FourCc::FTYP && box_type != FourCc::STYP {
                    return Err(Mp4Error::NotAContainer { found: box_type });
                }
                first_box = false;
            }

            let header = BoxHeader {
                box_type,
                box_size,
                header_len: header_len as u8,
            };
            let info = BoxInfo {
                box_type,
                box_size,
                file_offset,
                payload_offset: file_offset + header_len,
            };
            trace!(box_type = %box_type, offset = file_offset, ?box_size, "top-level box");

            if on_box(&info) == ScanControl::Stop {
                summary.stopped_at = Some((box_type, file_offset));
                summary.resume_offset = file_offset;
                return Ok(summary);
            }

            if box_type.ends_metadata_scan() {
                debug!(box_type = %box_type, offset = file_offset, "metadata scan complete");
                summary.stopped_at = Some((box_type, file_offset));
                summary.resume_offset = file_offset;
                if summary.saw_movie_metadata {
                    return Ok(summary);
                }
                return Err(Mp4Error::IncompleteMetadata);
            }

            match box_type {
                FourCc::FTYP | FourCc::STYP => {
                    let payload = Self::read_payload(reader, &header, file_offset)?;
                    summary.saw_file_type = true;
                    if payload.len() >= 4 {
                        summary.major_brand =
                            Some(FourCc([payload[0], payload[1], payload[2], payload[3]]));
                    }
                }
                FourCc::MOOV => {
                    let payload = Self::read_payload(reader, &header, file_offset)?;
                    metadata.on_metadata_box(box_type, &payload)?;
                    summary.saw_movie_metadata = true;
                }
                _ => {
                    Self::skip_payload(reader, &header)?;
                }
            }
        }
    }

    fn fill<R: ScanRead>(reader: &mut R, buf: &mut [u8]) -> Mp4Result<Fill> {
        let mut got = 0;
        while got < buf.len() {
            let offset = reader.current_offset();
            let n = reader.read(&mut buf[got..]).map_err(|source| Mp4Error::Read {
                at_offset: offset,
                source,
            })?;
            if n == 0 {
                return Ok(Fill::Eof { got });
            }
            got += n;
        }
        Ok(Fill::Full)
    }

    fn read_payload<R: ScanRead>(
        reader: &mut R,
        header: &BoxHeader,
        file_offset: u64,
    ) -> Mp4Result<Vec<u8>> {
        let Some(len) = header.payload_len() else {
            // A metadata box running to end-of-file cannot precede the media
            // data it describes.
            return Err(Mp4Error::MalformedHeader {
                at_offset: file_offset,
            });
        };
        let len = usize::try_from(len).map_err(|_| Mp4Error::MalformedHeader {
            at_offset: file_offset,
        })?;

        let mut payload = vec![0u8; len];
        match Self::fill(reader, &mut payload)? {
            Fill::Full => Ok(payload),
            Fill::Eof { got } => Err(Mp4Error::Truncated {
                at_offset: file_offset + u64::from(header.header_len) + got as u64,
            }),
        }
    }

    fn skip_payload<R: ScanRead>(reader: &mut R, header: &BoxHeader) -> Mp4Result<()> {
        let mut remaining = match header.payload_len() {
            Some(len) => len,
            None => u64::MAX, // drain to end of file
        };
        let mut scratch = vec![0u8; Self::SKIP_CHUNK];

        while remaining > 0 {
            let want = remaining.min(scratch.len() as u64) as usize;
            match Self::fill(reader, &mut scratch[..want])? {
                Fill::Full => remaining -= want as u64,
                Fill::Eof { .. } => {
                    if header.payload_len().is_some() {
                        return Err(Mp4Error::Truncated {
                            at_offset: reader.current_offset(),
                        });
                    }
                    break;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::fixture::SliceReader;

    struct NullSink;

    impl MetadataSink for NullSink {
        fn on_metadata_box(&mut self, _: FourCc, _: &[u8]) -> Mp4Result<()> {
            Ok(())
        }
    }

    struct CollectSink(Vec<(FourCc, usize)>);

    impl MetadataSink for CollectSink {
        fn on_metadata_box(&mut self, box_type: FourCc, payload: &[u8]) -> Mp4Result<()> {
            self.0.push((box_type, payload.len()));
            Ok(())
        }
    }

    fn push_box(out: &mut Vec<u8>, ty: &[u8; 4], payload: &[u8]) {
        out.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
        out.extend_from_slice(ty);
        out.extend_from_slice(payload);
    }

    fn minimal_file() -> Vec<u8> {
        let mut data = Vec::new();
        push_box(&mut data, b"ftyp", b"isom\x00\x00\x02\x00isomiso2");
        push_box(&mut data, b"free", &[0u8; 12]);
        push_box(&mut data, b"moov", &[0u8; 32]);
        push_box(&mut data, b"mdat", &[0u8; 64]);
        data
    }

    #[test]
    fn scan_stops_at_media_data() {
        let data = minimal_file();
        let mut reader = SliceReader::new(&data);
        let mut sink = CollectSink(Vec::new());
        let mut seen = Vec::new();

        let summary = BoxScanner::scan(&mut reader, &mut sink, |info| {
            seen.push((info.box_type, info.file_offset));
            ScanControl::Continue
        })
        .unwrap();

        assert!(summary.has_required_metadata());
        assert_eq!(summary.major_brand, Some(FourCc(*b"isom")));
        let mdat_offset = data.len() as u64 - 72;
        assert_eq!(summary.stopped_at, Some((FourCc::MDAT, mdat_offset)));
        assert_eq!(summary.resume_offset, mdat_offset);
        assert_eq!(sink.0, vec![(FourCc::MOOV, 32)]);
        assert_eq!(
            seen.iter().map(|(t, _)| *t).collect::<Vec<_>>(),
            vec![FourCc::FTYP, FourCc::FREE, FourCc::MOOV, FourCc::MDAT]
        );
    }

    #[test]
    fn first_box_must_be_file_type() {
        let mut data = Vec::new();
        push_box(&mut data, b"free", &[0u8; 4]);
        push_box(&mut data, b"ftyp", b"isom");

        let mut reader = SliceReader::new(&data);
        let err = BoxScanner::scan(&mut reader, &mut NullSink, |_| ScanControl::Continue)
            .unwrap_err();
        assert!(matches!(err, Mp4Error::NotAContainer { found } if found == FourCc::FREE));
    }

    #[test]
    fn media_data_before_metadata_is_incomplete() {
        let mut data = Vec::new();
        push_box(&mut data, b"ftyp", b"isom");
        push_box(&mut data, b"mdat", &[0u8; 16]);
        push_box(&mut data, b"moov", &[0u8; 8]);

        let mut reader = SliceReader::new(&data);
        let err = BoxScanner::scan(&mut reader, &mut NullSink, |_| ScanControl::Continue)
            .unwrap_err();
        assert!(matches!(err, Mp4Error::IncompleteMetadata));
    }

    #[test]
    fn eof_without_metadata_is_incomplete() {
        let mut data = Vec::new();
        push_box(&mut data, b"ftyp", b"isom");
        push_box(&mut data, b"free", &[0u8; 4]);

        let mut reader = SliceReader::new(&data);
        let err = BoxScanner::scan(&mut reader, &mut NullSink, |_| ScanControl::Continue)
            .unwrap_err();
        assert!(matches!(err, Mp4Error::IncompleteMetadata));
    }

    #[test]
    fn eof_mid_header_is_truncation() {
        let mut data = Vec::new();
        push_box(&mut data, b"ftyp", b"isom");
        let cut = data.len() + 3;
        push_box(&mut data, b"free", &[0u8; 8]);
        data.truncate(cut);

        let mut reader = SliceReader::new(&data);
        let err = BoxScanner::scan(&mut reader, &mut NullSink, |_| ScanControl::Continue)
            .unwrap_err();
        assert!(matches!(err, Mp4Error::Truncated { at_offset: 12 }));
    }

    #[test]
    fn largesize_header_is_honored() {
        let mut data = Vec::new();
        push_box(&mut data, b"ftyp", b"isom");
        // 64-bit sized free box: size32 == 1, payload of 10 bytes.
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(b"free");
        data.extend_from_slice(&(16u64 + 10).to_be_bytes());
        data.extend_from_slice(&[0u8; 10]);
        push_box(&mut data, b"moov", &[0u8; 8]);
        push_box(&mut data, b"mdat", &[]);

        let mut reader = SliceReader::new(&data);
        let summary = BoxScanner::scan(&mut reader, &mut NullSink, |_| ScanControl::Continue)
            .unwrap();
        assert!(summary.saw_movie_metadata);
    }

    #[rstest]
    #[case::stop_at_first(1)]
    #[case::stop_at_second(2)]
    fn callback_stop_ends_scan(#[case] stop_after: usize) {
        let data = minimal_file();
        let mut reader = SliceReader::new(&data);
        let mut count = 0usize;

        let summary = BoxScanner::scan(&mut reader, &mut NullSink, |_| {
            count += 1;
            if count == stop_after {
                ScanControl::Stop
            } else {
                ScanControl::Continue
            }
        })
        .unwrap();

        assert_eq!(count, stop_after);
        assert!(summary.stopped_at.is_some());
    }

    #[test]
    fn undersized_box_is_malformed() {
        let mut data = Vec::new();
        push_box(&mut data, b"ftyp", b"isom");
        // size 4 is smaller than the 8-byte header itself
        data.extend_from_slice(&4u32.to_be_bytes());
        data.extend_from_slice(b"free");

        let mut reader = SliceReader::new(&data);
        let err = BoxScanner::scan(&mut reader, &mut NullSink, |_| ScanControl::Continue)
            .unwrap_err();
        assert!(matches!(err, Mp4Error::MalformedHeader { at_offset: 12 }));
    }
}
