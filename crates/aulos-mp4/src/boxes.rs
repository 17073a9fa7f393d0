use std::fmt;

/// Four-character box/codec identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    pub const FTYP: FourCc = FourCc(*b"ftyp");
    pub const STYP: FourCc = FourCc(*b"styp");
    pub const MOOV: FourCc = FourCc(*b"moov");
    pub const MOOF: FourCc = FourCc(*b"moof");
    pub const SIDX: FourCc = FourCc(*b"sidx");
    pub const MDAT: FourCc = FourCc(*b"mdat");
    pub const FREE: FourCc = FourCc(*b"free");
    pub const SKIP: FourCc = FourCc(*b"skip");
    pub const UUID: FourCc = FourCc(*b"uuid");

    pub const MVHD: FourCc = FourCc(*b"mvhd");
    pub const TRAK: FourCc = FourCc(*b"trak");
    pub const TKHD: FourCc = FourCc(*b"tkhd");
    pub const MDIA: FourCc = FourCc(*b"mdia");
    pub const MDHD: FourCc = FourCc(*b"mdhd");
    pub const HDLR: FourCc = FourCc(*b"hdlr");
    pub const MINF: FourCc = FourCc(*b"minf");
    pub const STBL: FourCc = FourCc(*b"stbl");
    pub const STSD: FourCc = FourCc(*b"stsd");
    pub const STTS: FourCc = FourCc(*b"stts");
    pub const CTTS: FourCc = FourCc(*b"ctts");
    pub const STSC: FourCc = FourCc(*b"stsc");
    pub const STSZ: FourCc = FourCc(*b"stsz");
    pub const STCO: FourCc = FourCc(*b"stco");
    pub const CO64: FourCc = FourCc(*b"co64");
    pub const STSS: FourCc = FourCc(*b"stss");

    /// True for the boxes that end the leading-metadata scan: the first
    /// fragment or media-data box.
    pub fn ends_metadata_scan(self) -> bool {
        matches!(self, Self::MOOF | Self::SIDX | Self::MDAT)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, "\\x{b:02x}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// Total encoded size of a box, header included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoxSize {
    Sized(u64),
    /// `size == 0`: the box extends to end of file.
    ToEof,
}

/// Decoded top-level box header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub box_type: FourCc,
    pub box_size: BoxSize,
    /// Bytes the header itself occupies (8, or 16 with a 64-bit size).
    pub header_len: u8,
}

impl BoxHeader {
    /// Minimum bytes needed before anything can be decoded.
    pub const BASE_LEN: usize = 8;
    /// Extra bytes when `size == 1` announces a 64-bit size.
    pub const LARGESIZE_LEN: usize = 8;

    /// Decode the fixed 8-byte prefix: `(size32, type)`.
    pub fn decode_prefix(bytes: &[u8; 8]) -> (u32, FourCc) {
        let size32 = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let box_type = FourCc([bytes[4], bytes[5], bytes[6], bytes[7]]);
        (size32, box_type)
    }

    /// Payload length when the total size is known.
    pub fn payload_len(&self) -> Option<u64> {
        match self.box_size {
            BoxSize::Sized(total) => Some(total.saturating_sub(u64::from(self.header_len))),
            BoxSize::ToEof => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_decodes_size_and_type() {
        let (size, ty) = BoxHeader::decode_prefix(&[0, 0, 0, 24, b'f', b't', b'y', b'p']);
        assert_eq!(size, 24);
        assert_eq!(ty, FourCc::FTYP);
    }

    #[test]
    fn display_escapes_non_ascii() {
        assert_eq!(FourCc(*b"moov").to_string(), "moov");
        assert_eq!(FourCc([0xa9, b'n', b'a', b'm']).to_string(), "\\xa9nam");
    }

    #[test]
    fn scan_ending_boxes() {
        assert!(FourCc::MDAT.ends_metadata_scan());
        assert!(FourCc::MOOF.ends_metadata_scan());
        assert!(FourCc::SIDX.ends_metadata_scan());
        assert!(!FourCc::MOOV.ends_metadata_scan());
        assert!(!FourCc::FREE.ends_metadata_scan());
    }
}
