//! Synthetic source producing numbered frames

use std::time::Instant;

use tracing::{info, instrument};

use crate::error::{PullError, SourceError};
use crate::frame::{ColourSpace, VideoFrame};
use crate::source::{check_pull_colour, Attachments, VideoSource};

/// Emits frames whose bytes encode their sequence number.
///
/// The first eight bytes hold the sequence number (little endian, truncated
/// for smaller frames), the rest is filled with its low byte. Frames alias
/// the source's own buffer, which is rewritten on every pull.
pub struct TestPatternSource {
    colour: ColourSpace,
    cols: u32,
    rows: u32,
    frame_rate: f64,
    limit: Option<u64>,
    buffer: Vec<u8>,
    sequence: u64,
    attachments: Attachments,
}

impl TestPatternSource {
    #[instrument]
    pub fn new(colour: ColourSpace, cols: u32, rows: u32, frame_rate: f64) -> Result<Self, SourceError> {
        let len = colour.frame_len(cols, rows).ok_or_else(|| {
            SourceError::Unsupported(format!("test pattern cannot emit variable-rate {}", colour))
        })?;
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(SourceError::Unsupported(format!("frame rate {}", frame_rate)));
        }

        info!(%colour, cols, rows, frame_rate, "Test pattern source ready");
        Ok(Self {
            colour,
            cols,
            rows,
            frame_rate,
            limit: None,
            buffer: vec![0; len],
            sequence: 0,
            attachments: Attachments::new(),
        })
    }

    /// Stop after `frames` frames; later pulls report end of stream
    pub fn with_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    /// Frames produced so far
    pub fn produced(&self) -> u64 {
        self.sequence
    }

    /// Sequence number encoded in a frame's pixels
    pub fn decode_sequence(data: &[u8]) -> u64 {
        let mut bytes = [0u8; 8];
        let n = data.len().min(8);
        bytes[..n].copy_from_slice(&data[..n]);
        u64::from_le_bytes(bytes)
    }

    fn paint(&mut self) {
        let seq = self.sequence;
        self.buffer.fill(seq as u8);
        let stamp = seq.to_le_bytes();
        let n = self.buffer.len().min(stamp.len());
        self.buffer[..n].copy_from_slice(&stamp[..n]);
    }
}

impl VideoSource for TestPatternSource {
    fn pull_frame<'s>(&'s mut self, frame: &mut VideoFrame<'s>) -> Result<(), PullError> {
        check_pull_colour(self.colour, frame)?;
        if self.limit.is_some_and(|limit| self.sequence >= limit) {
            return Err(PullError::EndOfStream);
        }

        self.paint();
        let sequence = self.sequence;
        self.sequence += 1;

        frame.init_from_slice(&self.buffer, self.cols, self.rows)?;
        frame.stamp(sequence, Instant::now());
        Ok(())
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn frame_dimensions(&self) -> (u32, u32) {
        (self.cols, self.rows)
    }

    fn colour(&self) -> ColourSpace {
        self.colour
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}
