//! Writes frames into an `.fcraw` container

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, IntoInnerError, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use crate::error::TargetError;
use crate::frame::{ColourSpace, VideoFrame};
use crate::rawfile::{self, RawHeader};
use crate::target::{check_colour, check_filetype_support, Lifecycle, TargetState, VideoTarget};

/// Raw frame recorder.
///
/// The header carries the dimensions of the first frame; later frames with
/// other dimensions are rejected. Every check runs before any byte of the
/// frame is written, so a rejected frame leaves the file untouched. After a
/// failed write the writer refuses further frames, and `finalize` cuts the
/// file back to the last complete record.
pub struct RawFileWriter {
    colour: ColourSpace,
    lifecycle: Lifecycle,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    frame_rate: f32,
    dimensions: Option<(u32, u32)>,
    frames_written: u64,
    /// File length through the last complete record
    committed: u64,
    broken: bool,
}

impl RawFileWriter {
    pub fn new(colour: ColourSpace) -> Self {
        Self {
            colour,
            lifecycle: Lifecycle::default(),
            path: None,
            writer: None,
            frame_rate: 0.0,
            dimensions: None,
            frames_written: 0,
            committed: 0,
            broken: false,
        }
    }

    pub fn colour(&self) -> ColourSpace {
        self.colour
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    fn header(&self) -> RawHeader {
        let (cols, rows) = self.dimensions.unwrap_or((0, 0));
        RawHeader {
            colour: self.colour,
            cols,
            rows,
            frame_rate: self.frame_rate,
        }
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>, TargetError> {
        self.writer.as_mut().ok_or(TargetError::InvalidState {
            operation: "write to",
            state: self.lifecycle.state(),
        })
    }
}

impl VideoTarget for RawFileWriter {
    #[instrument(skip(self))]
    fn initialize(&mut self, destination: &str, frame_rate: f32) -> Result<(), TargetError> {
        self.lifecycle.ensure_uninitialized()?;
        check_filetype_support(destination, rawfile::EXTENSION)?;

        let mut writer = BufWriter::new(File::create(destination)?);
        // Placeholder until the first frame fixes the dimensions
        writer.write_all(&[0u8; rawfile::HEADER_LEN])?;

        self.writer = Some(writer);
        self.path = Some(PathBuf::from(destination));
        self.frame_rate = frame_rate;
        self.committed = rawfile::HEADER_LEN as u64;
        self.lifecycle.begin()?;

        info!(path = destination, colour = %self.colour, frame_rate, "Raw writer initialized");
        Ok(())
    }

    fn accept(&mut self, frame: &VideoFrame<'_>) -> Result<(), TargetError> {
        self.lifecycle.ensure_ready()?;
        if self.broken {
            return Err(TargetError::Io(io::Error::other(
                "recording stopped after an earlier write failure",
            )));
        }
        check_colour(self.colour, frame)?;
        frame.check_len()?;
        if let Some(expected) = self.dimensions {
            if expected != frame.dimensions() {
                return Err(TargetError::DimensionMismatch {
                    expected,
                    actual: frame.dimensions(),
                });
            }
        }
        let len = u32::try_from(frame.len()).map_err(|_| {
            TargetError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "frame larger than 4 GiB",
            ))
        })?;

        let writer = self.writer()?;
        let written = writer
            .write_all(&len.to_le_bytes())
            .and_then(|()| writer.write_all(frame.data()));
        if let Err(e) = written {
            self.broken = true;
            warn!(path = ?self.path, error = %e, "Write failed, no further frames accepted");
            return Err(e.into());
        }

        self.committed += (rawfile::RECORD_PREFIX_LEN + frame.len()) as u64;
        self.dimensions.get_or_insert(frame.dimensions());
        self.frames_written += 1;
        Ok(())
    }

    /// Closes the writer even if finishing the file fails.
    fn finalize(&mut self) -> Result<(), TargetError> {
        self.lifecycle.ensure_ready()?;

        let header = self.header().encode();
        let writer = self.writer.take().ok_or(TargetError::InvalidState {
            operation: "finalize",
            state: self.lifecycle.state(),
        })?;
        self.lifecycle.end()?;

        let mut file = if self.broken {
            // Unflushed bytes may belong to the failed record
            drop(writer.into_parts());
            let path = self.path.as_deref().ok_or(TargetError::InvalidState {
                operation: "finalize",
                state: self.lifecycle.state(),
            })?;
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(self.committed)?;
            file
        } else {
            writer.into_inner().map_err(IntoInnerError::into_error)?
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.sync_all()?;

        info!(
            path = ?self.path,
            frames = self.frames_written,
            "Raw writer finalized"
        );
        Ok(())
    }

    fn state(&self) -> TargetState {
        self.lifecycle.state()
    }
}

impl Drop for RawFileWriter {
    fn drop(&mut self) {
        if self.lifecycle.state() == TargetState::Ready {
            warn!(path = ?self.path, "Raw writer dropped without finalize");
            if let Err(e) = self.finalize() {
                debug!("Finalize on drop failed: {}", e);
            }
        }
    }
}
