//! Frame producers and their attachment sets
//!
//! A source fills caller-supplied frames on demand and keeps the set of
//! targets that want its frames. Delivering to that set is done by whoever
//! drives the source, normally the [`BroadcastDaemon`](crate::broadcast::BroadcastDaemon).

pub mod file_reader;
pub mod pattern;
#[cfg(feature = "v4l2")]
pub mod v4l2;

pub use file_reader::RawFileReader;
pub use pattern::TestPatternSource;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Source;

use std::cell::Cell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, trace};

use crate::error::{PullError, TargetError};
use crate::frame::{ColourSpace, VideoFrame};
use crate::target::{TargetState, VideoTarget};
use crate::utils::{lock, panic_message};

/// Handle through which a target is attached.
///
/// The attachment set clones the handle but never initializes or finalizes
/// the target behind it.
pub type SharedTarget = Arc<Mutex<dyn VideoTarget>>;

/// Wrap a target so it can be attached
pub fn shared<T: VideoTarget + 'static>(target: T) -> Arc<Mutex<T>> {
    Arc::new(Mutex::new(target))
}

pub trait VideoSource: Send {
    /// Fill `frame` with the next frame.
    ///
    /// An aliasing frame borrows the source until the frame is dropped, so it
    /// cannot be read after the next pull. Failures are expected and
    /// recoverable.
    fn pull_frame<'s>(&'s mut self, frame: &mut VideoFrame<'s>) -> Result<(), PullError>;

    /// Native frames per second
    fn frame_rate(&self) -> f64;

    /// Width and height of emitted frames
    fn frame_dimensions(&self) -> (u32, u32);

    fn colour(&self) -> ColourSpace;

    fn attachments(&self) -> &Attachments;

    fn attach(&self, target: SharedTarget) -> TargetId {
        self.attachments().attach(target)
    }

    fn detach(&self, id: TargetId) -> bool {
        self.attachments().detach(id)
    }
}

impl<S: VideoSource + ?Sized> VideoSource for Box<S> {
    fn pull_frame<'s>(&'s mut self, frame: &mut VideoFrame<'s>) -> Result<(), PullError> {
        (**self).pull_frame(frame)
    }

    fn frame_rate(&self) -> f64 {
        (**self).frame_rate()
    }

    fn frame_dimensions(&self) -> (u32, u32) {
        (**self).frame_dimensions()
    }

    fn colour(&self) -> ColourSpace {
        (**self).colour()
    }

    fn attachments(&self) -> &Attachments {
        (**self).attachments()
    }
}

/// Reject a pull whose requested colour space the source does not emit
pub fn check_pull_colour(emitted: ColourSpace, frame: &VideoFrame<'_>) -> Result<(), PullError> {
    if frame.colour() == emitted {
        Ok(())
    } else {
        Err(PullError::ColourMismatch {
            requested: frame.colour(),
            emitted,
        })
    }
}

thread_local! {
    /// Registry and target whose `on_frame` is running on this thread
    static DELIVERING: Cell<Option<(usize, TargetId)>> = const { Cell::new(None) };
}

/// Stable identity of an attached target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(u64);

impl fmt::Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "target#{}", self.0)
    }
}

/// A target failure caught at the delivery boundary
#[derive(Debug)]
pub struct DeliveryFailure {
    pub target: TargetId,
    pub sequence: u64,
    pub error: TargetError,
}

/// Result of delivering one frame to the attachment set
#[derive(Debug, Default)]
pub struct NotifyOutcome {
    pub delivered: usize,
    /// Targets attached but not in the `Ready` state
    pub skipped: usize,
    pub failures: Vec<DeliveryFailure>,
}

struct Attached {
    id: TargetId,
    target: SharedTarget,
    live: AtomicBool,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Arc<Attached>>,
}

/// The ordered, thread-safe set of targets attached to one source.
///
/// Cloning yields another handle to the same set. The registry lock is held
/// only to mutate or snapshot the set, never while a target runs.
#[derive(Clone, Default)]
pub struct Attachments {
    inner: Arc<Mutex<Registry>>,
}

impl Attachments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `target` at the end of the delivery order.
    ///
    /// Attaching a handle that is already attached is a no-op returning the
    /// existing id.
    pub fn attach(&self, target: SharedTarget) -> TargetId {
        let mut registry = lock(&self.inner);
        if let Some(existing) = registry.entries.iter().find(|e| same_target(&e.target, &target)) {
            trace!(target_id = %existing.id, "Target already attached");
            return existing.id;
        }

        let id = TargetId(registry.next_id);
        registry.next_id += 1;
        registry.entries.push(Arc::new(Attached {
            id,
            target,
            live: AtomicBool::new(true),
        }));
        debug!(target_id = %id, attached = registry.entries.len(), "Target attached");
        id
    }

    /// Remove a target.
    ///
    /// Waits for a delivery to that target that is already running; once this
    /// returns the target receives no further frames. A target may detach
    /// itself from inside its own `on_frame`.
    pub fn detach(&self, id: TargetId) -> bool {
        let removed = {
            let mut registry = lock(&self.inner);
            let position = registry.entries.iter().position(|e| e.id == id);
            position.map(|i| registry.entries.remove(i))
        };

        match removed {
            Some(entry) => {
                if DELIVERING.with(Cell::get) == Some((self.key(), id)) {
                    // This thread is inside the target's own on_frame and holds its lock
                    entry.live.store(false, Ordering::Release);
                } else {
                    let _in_flight = lock(&entry.target);
                    entry.live.store(false, Ordering::Release);
                }
                debug!(target_id = %id, "Target detached");
                true
            }
            None => false,
        }
    }

    /// Detach by handle instead of id
    pub fn detach_target(&self, target: &SharedTarget) -> bool {
        let id = lock(&self.inner)
            .entries
            .iter()
            .find(|e| same_target(&e.target, target))
            .map(|e| e.id);
        id.is_some_and(|id| self.detach(id))
    }

    pub fn contains(&self, id: TargetId) -> bool {
        lock(&self.inner).entries.iter().any(|e| e.id == id)
    }

    /// Ids in delivery order
    pub fn ids(&self) -> Vec<TargetId> {
        lock(&self.inner).entries.iter().map(|e| e.id).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `frame` to every attached target, one at a time, in attachment
    /// order.
    ///
    /// Errors and panics from one target are collected and do not stop
    /// delivery to the rest.
    pub fn notify(&self, frame: &VideoFrame<'_>) -> NotifyOutcome {
        let snapshot: Vec<Arc<Attached>> = lock(&self.inner).entries.clone();
        let mut outcome = NotifyOutcome::default();

        for entry in snapshot {
            let mut target = lock(&entry.target);
            if !entry.live.load(Ordering::Acquire) {
                continue;
            }
            if target.state() != TargetState::Ready {
                trace!(target_id = %entry.id, state = ?target.state(), "Skipping target that is not ready");
                outcome.skipped += 1;
                continue;
            }

            let previous = DELIVERING.with(|d| d.replace(Some((self.key(), entry.id))));
            let result = panic::catch_unwind(AssertUnwindSafe(|| target.on_frame(frame)));
            DELIVERING.with(|d| d.set(previous));

            let error = match result {
                Ok(Ok(())) => {
                    outcome.delivered += 1;
                    continue;
                }
                Ok(Err(error)) => error,
                Err(payload) => TargetError::Panicked(panic_message(payload.as_ref())),
            };
            outcome.failures.push(DeliveryFailure {
                target: entry.id,
                sequence: frame.sequence(),
                error,
            });
        }

        outcome
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl fmt::Debug for Attachments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachments").field("ids", &self.ids()).finish()
    }
}

fn same_target(a: &SharedTarget, b: &SharedTarget) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}
