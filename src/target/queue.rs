//! In-memory frame retention for consumers that process frames off the
//! broadcast thread

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;
use tracing::debug;

use crate::error::TargetError;
use crate::frame::{ColourSpace, SharedFrame, VideoFrame};
use crate::target::{check_colour, Lifecycle, TargetState, VideoTarget};

/// Bounded queue of owned frame copies.
///
/// Each accepted frame is copied out of the broadcast buffer. When full the
/// oldest frame is dropped. With [`keep_every`](Self::keep_every) set, only
/// every n-th delivered frame is kept.
pub struct FrameQueue {
    colour: ColourSpace,
    lifecycle: Lifecycle,
    label: String,
    ring: HeapRb<SharedFrame>,
    keep_every: u64,
    delivered: u64,
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    frames_written: AtomicUsize,
    frames_read: AtomicUsize,
    frames_dropped: AtomicUsize,
    frames_skipped: AtomicUsize,
}

/// Queue counters: written, read, dropped on overflow, skipped by decimation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub written: usize,
    pub read: usize,
    pub dropped: usize,
    pub skipped: usize,
}

impl FrameQueue {
    pub fn new(colour: ColourSpace, capacity: usize) -> Self {
        Self {
            colour,
            lifecycle: Lifecycle::default(),
            label: String::new(),
            ring: HeapRb::new(capacity.max(1)),
            keep_every: 1,
            delivered: 0,
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Keep only every `n`-th delivered frame
    pub fn keep_every(mut self, n: u64) -> Self {
        self.keep_every = n.max(1);
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pop(&mut self) -> Option<SharedFrame> {
        let frame = self.ring.try_pop()?;
        self.stats.frames_read.fetch_add(1, Ordering::Relaxed);
        Some(frame)
    }

    pub fn drain(&mut self) -> Vec<SharedFrame> {
        let mut frames = Vec::with_capacity(self.ring.occupied_len());
        while let Some(frame) = self.pop() {
            frames.push(frame);
        }
        frames
    }

    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            written: self.stats.frames_written.load(Ordering::Relaxed),
            read: self.stats.frames_read.load(Ordering::Relaxed),
            dropped: self.stats.frames_dropped.load(Ordering::Relaxed),
            skipped: self.stats.frames_skipped.load(Ordering::Relaxed),
        }
    }
}

impl VideoTarget for FrameQueue {
    /// `destination` is only kept as a label
    fn initialize(&mut self, destination: &str, frame_rate: f32) -> Result<(), TargetError> {
        self.lifecycle.begin()?;
        self.label = destination.to_owned();
        debug!(label = destination, frame_rate, "Frame queue initialized");
        Ok(())
    }

    fn accept(&mut self, frame: &VideoFrame<'_>) -> Result<(), TargetError> {
        self.lifecycle.ensure_ready()?;
        check_colour(self.colour, frame)?;

        if self.ring.push_overwrite(frame.freeze()).is_some() {
            self.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.stats.frames_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn finalize(&mut self) -> Result<(), TargetError> {
        self.lifecycle.end()
    }

    fn state(&self) -> TargetState {
        self.lifecycle.state()
    }

    fn on_frame(&mut self, frame: &VideoFrame<'_>) -> Result<(), TargetError> {
        let index = self.delivered;
        self.delivered += 1;
        if index % self.keep_every != 0 {
            self.stats.frames_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        self.accept(frame)
    }
}
