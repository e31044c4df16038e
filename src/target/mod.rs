//! Frame consumers
//!
//! A target is initialized once, receives frames while `Ready`, and is
//! finalized once. Sources only ever call [`VideoTarget::on_frame`]; the
//! owner of the target drives `initialize` and `finalize`.

pub mod queue;
pub mod raw_writer;

pub use queue::FrameQueue;
pub use raw_writer::RawFileWriter;

use serde::{Deserialize, Serialize};

use crate::error::TargetError;
use crate::frame::{ColourSpace, VideoFrame};

/// Lifecycle phase of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TargetState {
    #[default]
    Uninitialized,
    Ready,
    Finalized,
}

pub trait VideoTarget: Send {
    /// Prepare for a run, e.g. open `destination`
    fn initialize(&mut self, destination: &str, frame_rate: f32) -> Result<(), TargetError>;

    /// Append one frame. A colour space other than the one the target was
    /// configured for is an error, never converted.
    fn accept(&mut self, frame: &VideoFrame<'_>) -> Result<(), TargetError>;

    /// Complete the run, e.g. flush and close
    fn finalize(&mut self) -> Result<(), TargetError>;

    fn state(&self) -> TargetState;

    /// Called by the broadcast loop for every delivered frame.
    ///
    /// The frame is only borrowed for the duration of the call; targets that
    /// keep it must copy it.
    fn on_frame(&mut self, frame: &VideoFrame<'_>) -> Result<(), TargetError> {
        self.accept(frame)
    }
}

/// State machine shared by the bundled targets
#[derive(Debug, Default)]
pub struct Lifecycle {
    state: TargetState,
}

impl Lifecycle {
    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn ensure_uninitialized(&self) -> Result<(), TargetError> {
        self.expect("initialize", TargetState::Uninitialized)
    }

    pub fn begin(&mut self) -> Result<(), TargetError> {
        self.ensure_uninitialized()?;
        self.state = TargetState::Ready;
        Ok(())
    }

    pub fn ensure_ready(&self) -> Result<(), TargetError> {
        self.expect("accept frames on", TargetState::Ready)
    }

    pub fn end(&mut self) -> Result<(), TargetError> {
        self.expect("finalize", TargetState::Ready)?;
        self.state = TargetState::Finalized;
        Ok(())
    }

    fn expect(&self, operation: &'static str, wanted: TargetState) -> Result<(), TargetError> {
        if self.state == wanted {
            Ok(())
        } else {
            Err(TargetError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

/// Reject a frame whose colour space differs from `expected`
pub fn check_colour(expected: ColourSpace, frame: &VideoFrame<'_>) -> Result<(), TargetError> {
    if frame.colour() == expected {
        Ok(())
    } else {
        Err(TargetError::ColourMismatch {
            expected,
            actual: frame.colour(),
        })
    }
}

/// Reject destinations that cannot carry the `extension` suffix
pub fn check_filetype_support(destination: &str, extension: &str) -> Result<(), TargetError> {
    if destination.is_empty() {
        return Err(TargetError::InvalidDestination("Empty filepath specified".into()));
    }
    // +1 for the dot
    if destination.len() <= extension.len() + 1 {
        return Err(TargetError::InvalidDestination(
            "Filepath not long enough to deduce output format".into(),
        ));
    }
    if !destination.ends_with(extension) {
        return Err(TargetError::InvalidDestination(format!(
            "Filetype of {} not supported, use *.{} instead",
            destination, extension
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_order() {
        let mut lifecycle = Lifecycle::default();
        assert!(lifecycle.ensure_ready().is_err());
        assert!(lifecycle.end().is_err());

        lifecycle.begin().unwrap();
        assert_eq!(lifecycle.state(), TargetState::Ready);
        assert!(lifecycle.begin().is_err());
        lifecycle.ensure_ready().unwrap();

        lifecycle.end().unwrap();
        assert_eq!(lifecycle.state(), TargetState::Finalized);
        assert!(matches!(
            lifecycle.end(),
            Err(TargetError::InvalidState {
                state: TargetState::Finalized,
                ..
            })
        ));
        assert!(lifecycle.ensure_ready().is_err());
    }

    #[test]
    fn test_filetype_support() {
        let err = check_filetype_support("", "mp4").unwrap_err();
        assert_eq!(err.to_string(), "Empty filepath specified");

        let err = check_filetype_support(".mp4", "mp4").unwrap_err();
        assert_eq!(err.to_string(), "Filepath not long enough to deduce output format");

        let err = check_filetype_support("out.avi", "mp4").unwrap_err();
        assert_eq!(err.to_string(), "Filetype of out.avi not supported, use *.mp4 instead");

        check_filetype_support("a.mp4", "mp4").unwrap();
    }
}
