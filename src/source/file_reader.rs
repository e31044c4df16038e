//! Memory-mapped playback of `.fcraw` recordings

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Instant;

use memmap2::Mmap;
use tracing::{debug, info, instrument};

use crate::error::{PullError, SourceError};
use crate::frame::{ColourSpace, VideoFrame};
use crate::rawfile::{self, RawHeader};
use crate::source::{check_pull_colour, Attachments, VideoSource};

/// Plays back a recording written by [`RawFileWriter`](crate::target::RawFileWriter).
///
/// Frames alias the mapping directly; nothing is copied unless the pulling
/// frame owns its storage.
pub struct RawFileReader {
    path: PathBuf,
    map: Mmap,
    header: RawHeader,
    records: Vec<(usize, usize)>,
    cursor: usize,
    looping: bool,
    sequence: u64,
    attachments: Attachments,
}

impl RawFileReader {
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: the mapping is read-only and the recording is not expected to
        // be modified while it is being played back.
        let map = unsafe { Mmap::map(&file)? };

        let header = RawHeader::decode(&map)?;
        let records = rawfile::index_records(&map)?;
        if let Some(expected) = header.colour.frame_len(header.cols, header.rows) {
            if let Some(&(at, len)) = records.iter().find(|&&(_, len)| len != expected) {
                return Err(SourceError::Malformed(format!(
                    "record at {} holds {} bytes, {} at {}x{} needs {}",
                    at, len, header.colour, header.cols, header.rows, expected
                )));
            }
        }

        info!(
            colour = %header.colour,
            cols = header.cols,
            rows = header.rows,
            frame_rate = header.frame_rate,
            frames = records.len(),
            "Raw file opened"
        );

        Ok(Self {
            path,
            map,
            header,
            records,
            cursor: 0,
            looping: false,
            sequence: 0,
            attachments: Attachments::new(),
        })
    }

    /// Restart from the first frame instead of ending the stream
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frame_count(&self) -> usize {
        self.records.len()
    }
}

impl VideoSource for RawFileReader {
    fn pull_frame<'s>(&'s mut self, frame: &mut VideoFrame<'s>) -> Result<(), PullError> {
        check_pull_colour(self.header.colour, frame)?;

        if self.cursor >= self.records.len() {
            if !self.looping || self.records.is_empty() {
                return Err(PullError::EndOfStream);
            }
            debug!(path = %self.path.display(), "Looping playback");
            self.cursor = 0;
        }

        let (start, len) = self.records[self.cursor];
        self.cursor += 1;
        let sequence = self.sequence;
        self.sequence += 1;

        frame.init_from_slice(&self.map[start..start + len], self.header.cols, self.header.rows)?;
        frame.stamp(sequence, Instant::now());
        Ok(())
    }

    fn frame_rate(&self) -> f64 {
        f64::from(self.header.frame_rate)
    }

    fn frame_dimensions(&self) -> (u32, u32) {
        (self.header.cols, self.header.rows)
    }

    fn colour(&self) -> ColourSpace {
        self.header.colour
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}
