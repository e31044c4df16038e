//! Video frame buffers with explicit ownership
//!
//! A [`VideoFrame`] either owns its pixel storage or aliases storage that
//! belongs to the source that filled it. The alias is a plain borrow: its
//! lifetime is tied to the `pull_frame` call that produced it, so it cannot
//! outlive the source's next pull. Copying a frame always yields owned
//! storage.

use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::FrameError;

/// Pixel encodings shared by sources and targets.
///
/// No conversion happens between them; both ends agree on one by
/// configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColourSpace {
    Bgra,
    Rgb24,
    Bgr24,
    Mono8,
    Mono16,
    /// Planar YUV 4:2:0
    I420,
    Nv12,
    Uyvy,
    Yuyv,
    BayerRggb8,
    BayerBggr8,
    BayerGrbg8,
    BayerGbrg8,
    Bayer16,
    /// Compressed, so frames carry a variable number of bytes
    Mjpeg,
}

impl ColourSpace {
    pub const ALL: [ColourSpace; 15] = [
        ColourSpace::Bgra,
        ColourSpace::Rgb24,
        ColourSpace::Bgr24,
        ColourSpace::Mono8,
        ColourSpace::Mono16,
        ColourSpace::I420,
        ColourSpace::Nv12,
        ColourSpace::Uyvy,
        ColourSpace::Yuyv,
        ColourSpace::BayerRggb8,
        ColourSpace::BayerBggr8,
        ColourSpace::BayerGrbg8,
        ColourSpace::BayerGbrg8,
        ColourSpace::Bayer16,
        ColourSpace::Mjpeg,
    ];

    /// Number of bytes a `cols` x `rows` frame occupies, `None` for
    /// variable-rate formats.
    pub fn frame_len(self, cols: u32, rows: u32) -> Option<usize> {
        let (w, h) = (cols as usize, rows as usize);
        let pixels = w * h;
        let len = match self {
            ColourSpace::Bgra => pixels * 4,
            ColourSpace::Rgb24 | ColourSpace::Bgr24 => pixels * 3,
            ColourSpace::Mono16 | ColourSpace::Bayer16 => pixels * 2,
            ColourSpace::Uyvy | ColourSpace::Yuyv => pixels * 2,
            ColourSpace::Mono8
            | ColourSpace::BayerRggb8
            | ColourSpace::BayerBggr8
            | ColourSpace::BayerGrbg8
            | ColourSpace::BayerGbrg8 => pixels,
            // Full-resolution luma plus two quarter-resolution chroma planes
            ColourSpace::I420 | ColourSpace::Nv12 => pixels + 2 * w.div_ceil(2) * h.div_ceil(2),
            ColourSpace::Mjpeg => return None,
        };
        Some(len)
    }

    pub fn is_variable_rate(self) -> bool {
        matches!(self, ColourSpace::Mjpeg)
    }

    /// Stable on-disk tag
    pub fn tag(self) -> u8 {
        match self {
            ColourSpace::Bgra => 1,
            ColourSpace::Rgb24 => 2,
            ColourSpace::Bgr24 => 3,
            ColourSpace::Mono8 => 4,
            ColourSpace::Mono16 => 5,
            ColourSpace::I420 => 6,
            ColourSpace::Nv12 => 7,
            ColourSpace::Uyvy => 8,
            ColourSpace::Yuyv => 9,
            ColourSpace::BayerRggb8 => 10,
            ColourSpace::BayerBggr8 => 11,
            ColourSpace::BayerGrbg8 => 12,
            ColourSpace::BayerGbrg8 => 13,
            ColourSpace::Bayer16 => 14,
            ColourSpace::Mjpeg => 15,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.tag() == tag)
    }
}

impl fmt::Display for ColourSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColourSpace::Bgra => "BGRA",
            ColourSpace::Rgb24 => "RGB24",
            ColourSpace::Bgr24 => "BGR24",
            ColourSpace::Mono8 => "mono8",
            ColourSpace::Mono16 => "mono16",
            ColourSpace::I420 => "I420",
            ColourSpace::Nv12 => "NV12",
            ColourSpace::Uyvy => "UYVY",
            ColourSpace::Yuyv => "YUYV",
            ColourSpace::BayerRggb8 => "BayerRG8",
            ColourSpace::BayerBggr8 => "BayerBG8",
            ColourSpace::BayerGrbg8 => "BayerGR8",
            ColourSpace::BayerGbrg8 => "BayerGB8",
            ColourSpace::Bayer16 => "Bayer16",
            ColourSpace::Mjpeg => "MJPEG",
        };
        f.write_str(name)
    }
}

/// Whether [`VideoFrame::init_from_slice`] copies or aliases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    /// Copy into storage the frame owns
    Owned,
    /// Alias the source's storage (zero-copy)
    #[default]
    Borrowed,
}

/// Pixel storage of a frame
#[derive(Debug)]
pub enum FrameData<'a> {
    Owned(Vec<u8>),
    Borrowed(&'a [u8]),
}

impl FrameData<'_> {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            FrameData::Owned(buf) => buf,
            FrameData::Borrowed(slice) => slice,
        }
    }

    fn empty(ownership: Ownership) -> FrameData<'static> {
        match ownership {
            Ownership::Owned => FrameData::Owned(Vec::new()),
            Ownership::Borrowed => FrameData::Borrowed(&[]),
        }
    }
}

/// A single video frame.
///
/// `'a` is the lifetime of aliased source storage; owned frames can be
/// `VideoFrame<'static>`.
#[derive(Debug)]
pub struct VideoFrame<'a> {
    colour: ColourSpace,
    ownership: Ownership,
    data: FrameData<'a>,
    cols: u32,
    rows: u32,
    sequence: u64,
    captured_at: Instant,
}

impl<'a> VideoFrame<'a> {
    /// Empty frame ready to be filled by a source
    pub fn new(colour: ColourSpace, ownership: Ownership) -> Self {
        Self {
            colour,
            ownership,
            data: FrameData::empty(ownership),
            cols: 0,
            rows: 0,
            sequence: 0,
            captured_at: Instant::now(),
        }
    }

    /// Fill the frame from `data`.
    ///
    /// Owning frames copy, reusing their current allocation where it is large
    /// enough. Borrowing frames keep `data` as an alias and never allocate.
    /// The length is not checked against `colour`, `cols` and `rows`; use
    /// [`check_len`](Self::check_len) for that.
    pub fn init_from_slice(&mut self, data: &'a [u8], cols: u32, rows: u32) -> Result<(), FrameError> {
        match self.ownership {
            Ownership::Owned => {
                let mut buf = match mem::replace(&mut self.data, FrameData::Borrowed(&[])) {
                    FrameData::Owned(buf) => buf,
                    FrameData::Borrowed(_) => Vec::new(),
                };
                let copied = copy_into(&mut buf, data);
                self.data = FrameData::Owned(buf);
                copied?;
            }
            Ownership::Borrowed => self.data = FrameData::Borrowed(data),
        }
        self.cols = cols;
        self.rows = rows;
        Ok(())
    }

    /// Attach producer metadata
    pub fn stamp(&mut self, sequence: u64, captured_at: Instant) {
        self.sequence = sequence;
        self.captured_at = captured_at;
    }

    pub fn colour(&self) -> ColourSpace {
        self.colour
    }

    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    pub fn is_owned(&self) -> bool {
        matches!(self.data, FrameData::Owned(_))
    }

    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    pub fn len(&self) -> usize {
        self.data().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data().is_empty()
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.cols, self.rows)
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    /// Byte length the colour space requires at the current dimensions
    pub fn expected_len(&self) -> Option<usize> {
        self.colour.frame_len(self.cols, self.rows)
    }

    pub fn check_len(&self) -> Result<(), FrameError> {
        match self.expected_len() {
            Some(expected) if expected != self.len() => Err(FrameError::LengthMismatch {
                colour: self.colour,
                cols: self.cols,
                rows: self.rows,
                expected,
                actual: self.len(),
            }),
            _ => Ok(()),
        }
    }

    /// Owning deep copy that reports allocation failure instead of aborting
    pub fn try_to_owned(&self) -> Result<VideoFrame<'static>, FrameError> {
        let mut buf = Vec::new();
        copy_into(&mut buf, self.data())?;
        Ok(VideoFrame {
            colour: self.colour,
            ownership: Ownership::Owned,
            data: FrameData::Owned(buf),
            cols: self.cols,
            rows: self.rows,
            sequence: self.sequence,
            captured_at: self.captured_at,
        })
    }

    /// Move the storage out, leaving an empty frame of the same mode behind
    pub fn take(&mut self) -> VideoFrame<'a> {
        VideoFrame {
            colour: self.colour,
            ownership: self.ownership,
            data: mem::replace(&mut self.data, FrameData::empty(self.ownership)),
            cols: mem::take(&mut self.cols),
            rows: mem::take(&mut self.rows),
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }

    /// Drop any alias and keep owned capacity for the next fill
    pub fn into_scratch(self) -> VideoFrame<'static> {
        let data = match self.data {
            FrameData::Owned(mut buf) => {
                buf.clear();
                FrameData::Owned(buf)
            }
            FrameData::Borrowed(_) => FrameData::empty(self.ownership),
        };
        VideoFrame {
            colour: self.colour,
            ownership: self.ownership,
            data,
            cols: 0,
            rows: 0,
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }

    /// Reference-counted owned copy for handing across threads
    pub fn freeze(&self) -> SharedFrame {
        SharedFrame {
            data: Bytes::copy_from_slice(self.data()),
            meta: Arc::new(FrameMetadata {
                sequence: self.sequence,
                cols: self.cols,
                rows: self.rows,
                colour: self.colour,
                captured_at: self.captured_at,
            }),
        }
    }
}

impl Clone for VideoFrame<'_> {
    /// Always deep-copies, so the clone outlives whatever this frame aliased
    fn clone(&self) -> Self {
        Self {
            colour: self.colour,
            ownership: Ownership::Owned,
            data: FrameData::Owned(self.data().to_vec()),
            cols: self.cols,
            rows: self.rows,
            sequence: self.sequence,
            captured_at: self.captured_at,
        }
    }
}

fn copy_into(buf: &mut Vec<u8>, data: &[u8]) -> Result<(), FrameError> {
    buf.clear();
    buf.try_reserve_exact(data.len())
        .map_err(|_| FrameError::Allocation {
            requested: data.len(),
        })?;
    buf.extend_from_slice(data);
    Ok(())
}

/// Owned frame that can be shared across threads without copying
#[derive(Debug, Clone)]
pub struct SharedFrame {
    pub data: Bytes,
    pub meta: Arc<FrameMetadata>,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub cols: u32,
    pub rows: u32,
    pub colour: ColourSpace,
    pub captured_at: Instant,
}
