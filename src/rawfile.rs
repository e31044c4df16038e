//! `.fcraw` container: a fixed header followed by length-prefixed frames
//!
//! ```text
//! 0   magic "FCRW"
//! 4   version      u16
//! 6   colour tag   u8
//! 7   reserved
//! 8   cols         u32
//! 12  rows         u32
//! 16  frame rate   f32
//! 20  reserved     12 bytes
//! 32  records: frame length u32, then that many pixel bytes
//! ```
//!
//! All integers are little endian.

use crate::error::SourceError;
use crate::frame::ColourSpace;

pub const EXTENSION: &str = "fcraw";
pub const MAGIC: [u8; 4] = *b"FCRW";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 32;
pub const RECORD_PREFIX_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawHeader {
    pub colour: ColourSpace,
    pub cols: u32,
    pub rows: u32,
    pub frame_rate: f32,
}

impl RawHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&MAGIC);
        out[4..6].copy_from_slice(&VERSION.to_le_bytes());
        out[6] = self.colour.tag();
        out[8..12].copy_from_slice(&self.cols.to_le_bytes());
        out[12..16].copy_from_slice(&self.rows.to_le_bytes());
        out[16..20].copy_from_slice(&self.frame_rate.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SourceError> {
        if bytes.len() < HEADER_LEN {
            return Err(SourceError::Malformed(format!(
                "header needs {} bytes, file has {}",
                HEADER_LEN,
                bytes.len()
            )));
        }
        if bytes[0..4] != MAGIC {
            return Err(SourceError::Malformed("bad magic".into()));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(SourceError::Unsupported(format!("container version {}", version)));
        }
        let colour = ColourSpace::from_tag(bytes[6])
            .ok_or_else(|| SourceError::Malformed(format!("unknown colour tag {}", bytes[6])))?;

        Ok(Self {
            colour,
            cols: read_u32(bytes, 8),
            rows: read_u32(bytes, 12),
            frame_rate: f32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]),
        })
    }
}

pub fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

/// Offsets and lengths of every frame record after the header
pub fn index_records(bytes: &[u8]) -> Result<Vec<(usize, usize)>, SourceError> {
    let mut records = Vec::new();
    let mut at = HEADER_LEN;
    while at < bytes.len() {
        if at + RECORD_PREFIX_LEN > bytes.len() {
            return Err(SourceError::Malformed(format!("truncated record prefix at {}", at)));
        }
        let len = read_u32(bytes, at) as usize;
        let start = at + RECORD_PREFIX_LEN;
        if start + len > bytes.len() {
            return Err(SourceError::Malformed(format!(
                "record at {} claims {} bytes, {} remain",
                at,
                len,
                bytes.len() - start
            )));
        }
        records.push((start, len));
        at = start + len;
    }
    Ok(records)
}
