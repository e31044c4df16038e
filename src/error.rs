//! Error types shared by frames, sources, targets and the broadcast daemon

use std::io;

use thiserror::Error;

use crate::frame::ColourSpace;
use crate::target::TargetState;

/// Frame buffer failures
#[derive(Debug, Error)]
pub enum FrameError {
    /// Backing storage for an owning copy could not be obtained
    #[error("cannot allocate {requested} bytes of frame storage")]
    Allocation { requested: usize },

    #[error("frame holds {actual} bytes, {colour} at {cols}x{rows} needs {expected}")]
    LengthMismatch {
        colour: ColourSpace,
        cols: u32,
        rows: u32,
        expected: usize,
        actual: usize,
    },
}

/// A pull that did not yield a usable frame.
///
/// Expected in steady state and never fatal: the daemon logs it and retries
/// on the next period.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("requested {requested} frame but source emits {emitted}")]
    ColourMismatch {
        requested: ColourSpace,
        emitted: ColourSpace,
    },

    #[error("end of stream")]
    EndOfStream,

    #[error("source is not streaming")]
    NotStreaming,

    #[error("capture failed: {0}")]
    Capture(String),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Failure raised by a consumer during initialize, accept or finalize
#[derive(Debug, Error)]
pub enum TargetError {
    #[error("{0}")]
    InvalidDestination(String),

    #[error("colour space mismatch: target expects {expected}, frame is {actual}")]
    ColourMismatch {
        expected: ColourSpace,
        actual: ColourSpace,
    },

    #[error("frame dimensions changed from {expected:?} to {actual:?}")]
    DimensionMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("cannot {operation} a target that is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: TargetState,
    },

    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("target panicked: {0}")]
    Panicked(String),
}

/// Failure to construct a source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("malformed container: {0}")]
    Malformed(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

/// Broadcast daemon lifecycle failures
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("frame rate must be finite and positive, got {0}")]
    InvalidFrameRate(f64),

    #[error("cannot spawn broadcast thread: {0}")]
    Spawn(#[source] io::Error),
}
