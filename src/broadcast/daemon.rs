//! Broadcast daemon: one thread pulling from a source and fanning out frames

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use flume::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use crate::broadcast::stats::{self, DaemonStats, StatsSnapshot};
use crate::error::DaemonError;
use crate::frame::{Ownership, VideoFrame};
use crate::source::{Attachments, DeliveryFailure, NotifyOutcome, SharedTarget, TargetId, VideoSource};
use crate::utils::{frame_period, lock};

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Whether the reused frame copies or aliases source storage
    pub ownership: Ownership,
    /// Capacity of the failure side channel; extra failures are counted and dropped
    pub failure_queue: usize,
    pub thread_name: String,
    /// Pin the broadcast thread to this CPU core
    pub pin_core: Option<usize>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            ownership: Ownership::Borrowed,
            failure_queue: 64,
            thread_name: "framecast-broadcast".into(),
            pin_core: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Running,
}

/// Rate the loop runs at for a `requested` rate: capped by the source's
/// `native` rate when the source reports one
pub fn effective_rate(requested: f64, native: f64) -> Result<f64, DaemonError> {
    frame_period(requested).ok_or(DaemonError::InvalidFrameRate(requested))?;
    if native.is_finite() && native > 0.0 {
        Ok(requested.min(native))
    } else {
        Ok(requested)
    }
}

struct Worker {
    handle: JoinHandle<()>,
    running: Arc<AtomicBool>,
    wake: Sender<()>,
    period: Duration,
}

/// Pulls frames from a source at a fixed cadence and delivers each one to
/// every attached target.
///
/// All pulls and deliveries run sequentially on one dedicated thread, so a
/// slow target delays the targets after it and the next pull. Target
/// failures are isolated per target and reported through
/// [`failures`](Self::failures); pull failures are counted and retried on the
/// next period.
pub struct BroadcastDaemon<S: VideoSource + 'static> {
    source: Arc<Mutex<S>>,
    attachments: Attachments,
    config: DaemonConfig,
    stats: Arc<DaemonStats>,
    failures_tx: Sender<DeliveryFailure>,
    failures_rx: Receiver<DeliveryFailure>,
    worker: Mutex<Option<Worker>>,
}

impl<S: VideoSource + 'static> BroadcastDaemon<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, DaemonConfig::default())
    }

    pub fn with_config(source: S, config: DaemonConfig) -> Self {
        let attachments = source.attachments().clone();
        let (failures_tx, failures_rx) = flume::bounded(config.failure_queue.max(1));

        Self {
            source: Arc::new(Mutex::new(source)),
            attachments,
            config,
            stats: Arc::new(DaemonStats::default()),
            failures_tx,
            failures_rx,
            worker: Mutex::new(None),
        }
    }

    /// Start broadcasting at `frame_rate`, capped by the source's native rate.
    ///
    /// Does nothing if already running.
    pub fn start(&self, frame_rate: f64) -> Result<(), DaemonError> {
        let mut worker = lock(&self.worker);
        if worker.is_some() {
            debug!("Broadcast daemon already running");
            return Ok(());
        }

        let (native, colour) = {
            let source = lock(&self.source);
            (source.frame_rate(), source.colour())
        };
        let rate = effective_rate(frame_rate, native)?;
        let period = frame_period(rate).ok_or(DaemonError::InvalidFrameRate(rate))?;

        let running = Arc::new(AtomicBool::new(true));
        let (wake_tx, wake_rx) = flume::bounded(1);
        let broadcast_loop = BroadcastLoop {
            source: Arc::clone(&self.source),
            attachments: self.attachments.clone(),
            stats: Arc::clone(&self.stats),
            failures: self.failures_tx.clone(),
            running: Arc::clone(&running),
            wake: wake_rx,
            period,
            scratch: VideoFrame::new(colour, self.config.ownership),
            pin_core: self.config.pin_core,
        };

        let handle = thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || broadcast_loop.run())
            .map_err(DaemonError::Spawn)?;

        info!(
            requested = frame_rate,
            native,
            period_ms = period.as_secs_f64() * 1000.0,
            targets = self.attachments.len(),
            "Broadcast daemon started"
        );

        *worker = Some(Worker {
            handle,
            running,
            wake: wake_tx,
            period,
        });
        Ok(())
    }

    /// Stop broadcasting and wait for the loop thread to exit.
    ///
    /// The loop finishes the delivery in progress first. Once this returns no
    /// target receives further frames from this daemon. Does nothing if
    /// already stopped. The daemon reports [`DaemonState::Stopped`] as soon as
    /// stopping begins, so targets may query it while the loop drains.
    pub fn stop(&self) {
        let Some(worker) = lock(&self.worker).take() else {
            return;
        };

        worker.running.store(false, Ordering::Release);
        let _ = worker.wake.try_send(());

        if worker.handle.thread().id() == thread::current().id() {
            // Called from a target on the loop thread; it exits after this cycle
            warn!("Broadcast daemon stopped from its own thread, not joining");
            return;
        }
        if worker.handle.join().is_err() {
            error!("Broadcast thread panicked");
        }

        info!(stats = ?self.stats.snapshot(), "Broadcast daemon stopped");
    }

    pub fn state(&self) -> DaemonState {
        if lock(&self.worker).is_some() {
            DaemonState::Running
        } else {
            DaemonState::Stopped
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == DaemonState::Running
    }

    /// Period of the running loop
    pub fn period(&self) -> Option<Duration> {
        lock(&self.worker).as_ref().map(|w| w.period)
    }

    pub fn attach(&self, target: SharedTarget) -> TargetId {
        self.attachments.attach(target)
    }

    pub fn detach(&self, id: TargetId) -> bool {
        self.attachments.detach(id)
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    /// Receiver of target failures caught by the loop
    pub fn failures(&self) -> Receiver<DeliveryFailure> {
        self.failures_rx.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run `f` against the source. Blocks while a cycle is in progress.
    pub fn with_source<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        f(&mut lock(&self.source))
    }
}

impl<S: VideoSource + 'static> Drop for BroadcastDaemon<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct BroadcastLoop<S> {
    source: Arc<Mutex<S>>,
    attachments: Attachments,
    stats: Arc<DaemonStats>,
    failures: Sender<DeliveryFailure>,
    running: Arc<AtomicBool>,
    wake: Receiver<()>,
    period: Duration,
    scratch: VideoFrame<'static>,
    pin_core: Option<usize>,
}

impl<S: VideoSource> BroadcastLoop<S> {
    fn run(mut self) {
        if let Some(id) = self.pin_core {
            if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                warn!(core = id, "Cannot pin broadcast thread");
            }
        }

        while self.running.load(Ordering::Acquire) {
            let cycle_start = Instant::now();
            self.cycle();
            self.stats.cycle();

            let elapsed = cycle_start.elapsed();
            metrics::histogram!(stats::CYCLE_TIME_US).record(elapsed.as_micros() as f64);

            match self.period.checked_sub(elapsed) {
                Some(remaining) if !remaining.is_zero() => match self.wake.recv_timeout(remaining) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                // Late: pull again right away, no catch-up burst
                _ => self.stats.overrun(),
            }
        }

        debug!("Broadcast loop exited");
    }

    fn cycle(&mut self) {
        let mut source = lock(&self.source);
        let mut frame: VideoFrame<'_> = self.scratch.take();

        match source.pull_frame(&mut frame) {
            Ok(()) => {
                self.stats.frame_pulled();
                let outcome = self.attachments.notify(&frame);
                self.record(outcome);
            }
            Err(e) => {
                self.stats.pull_failed();
                debug!(error = %e, "Pull failed, retrying next period");
            }
        }

        self.scratch = frame.into_scratch();
    }

    fn record(&self, outcome: NotifyOutcome) {
        self.stats.delivered(outcome.delivered);
        if outcome.skipped > 0 {
            trace!(skipped = outcome.skipped, "Targets not ready");
        }

        for failure in outcome.failures {
            self.stats.delivery_failed();
            warn!(
                target_id = %failure.target,
                sequence = failure.sequence,
                error = %failure.error,
                "Target failed to take frame"
            );
            if let Err(TrySendError::Full(_)) = self.failures.try_send(failure) {
                self.stats.failure_dropped();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::{OnceLock, Weak};

    use super::*;
    use crate::error::{PullError, TargetError};
    use crate::frame::ColourSpace;
    use crate::source::{shared, TestPatternSource};
    use crate::target::{TargetState, VideoTarget};

    /// Records the sequence numbers it receives
    struct Recorder {
        seen: Arc<Mutex<Vec<u64>>>,
        fail: bool,
    }

    impl Recorder {
        fn new() -> (Self, Arc<Mutex<Vec<u64>>>) {
            let seen = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    seen: seen.clone(),
                    fail: false,
                },
                seen,
            )
        }

        fn failing() -> (Self, Arc<Mutex<Vec<u64>>>) {
            let (mut recorder, seen) = Self::new();
            recorder.fail = true;
            (recorder, seen)
        }
    }

    impl VideoTarget for Recorder {
        fn initialize(&mut self, _: &str, _: f32) -> Result<(), TargetError> {
            Ok(())
        }

        fn accept(&mut self, frame: &VideoFrame<'_>) -> Result<(), TargetError> {
            self.seen.lock().unwrap().push(frame.sequence());
            if self.fail {
                Err(TargetError::Io(std::io::Error::other("disk full")))
            } else {
                Ok(())
            }
        }

        fn finalize(&mut self) -> Result<(), TargetError> {
            Ok(())
        }

        fn state(&self) -> TargetState {
            TargetState::Ready
        }
    }

    fn pattern(frame_rate: f64) -> TestPatternSource {
        TestPatternSource::new(ColourSpace::Rgb24, 8, 4, frame_rate).unwrap()
    }

    fn wait_for(seen: &Arc<Mutex<Vec<u64>>>, count: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while seen.lock().unwrap().len() < count && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_rate_is_held() {
        let daemon = BroadcastDaemon::new(pattern(100.0));
        let (recorder, seen) = Recorder::new();
        daemon.attach(shared(recorder));

        daemon.start(10.0).unwrap();
        assert_eq!(daemon.period(), Some(Duration::from_millis(100)));
        thread::sleep(Duration::from_millis(1000));
        daemon.stop();

        let delivered = seen.lock().unwrap().len();
        assert!((8..=12).contains(&delivered), "delivered {} frames", delivered);
    }

    #[test]
    fn test_native_rate_caps_cadence() {
        let daemon = BroadcastDaemon::new(pattern(5.0));
        let (recorder, seen) = Recorder::new();
        daemon.attach(shared(recorder));

        daemon.start(100.0).unwrap();
        assert_eq!(daemon.period(), Some(Duration::from_millis(200)));
        thread::sleep(Duration::from_millis(1000));
        daemon.stop();

        let delivered = seen.lock().unwrap().len();
        assert!(delivered <= 7, "delivered {} frames", delivered);
    }

    #[test]
    fn test_no_delivery_after_stop() {
        let daemon = BroadcastDaemon::new(pattern(200.0));
        let (recorder, seen) = Recorder::new();
        daemon.attach(shared(recorder));

        daemon.start(200.0).unwrap();
        wait_for(&seen, 3, Duration::from_secs(2));
        daemon.stop();
        assert_eq!(daemon.state(), DaemonState::Stopped);

        let after_stop = seen.lock().unwrap().len();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(seen.lock().unwrap().len(), after_stop);
        assert!(after_stop >= 3);
    }

    #[test]
    fn test_start_and_stop_are_idempotent() {
        let daemon = BroadcastDaemon::new(pattern(50.0));
        daemon.stop();
        assert!(!daemon.is_running());

        daemon.start(50.0).unwrap();
        daemon.start(10.0).unwrap();
        assert_eq!(daemon.period(), Some(Duration::from_millis(20)));

        daemon.stop();
        daemon.stop();
        assert!(!daemon.is_running());

        daemon.start(25.0).unwrap();
        assert!(daemon.is_running());
    }

    #[test]
    fn test_effective_rate() {
        assert_eq!(effective_rate(100.0, 25.0).unwrap(), 25.0);
        assert_eq!(effective_rate(10.0, 25.0).unwrap(), 10.0);
        // Sources without a known rate do not cap
        assert_eq!(effective_rate(30.0, 0.0).unwrap(), 30.0);
        assert!(matches!(
            effective_rate(0.0, 0.0),
            Err(DaemonError::InvalidFrameRate(_))
        ));
    }

    #[test]
    fn test_rejects_bad_rate() {
        let daemon = BroadcastDaemon::new(pattern(30.0));
        assert!(matches!(daemon.start(0.0), Err(DaemonError::InvalidFrameRate(_))));
        assert!(matches!(
            daemon.start(f64::NAN),
            Err(DaemonError::InvalidFrameRate(_))
        ));
        assert!(!daemon.is_running());
    }

    #[test]
    fn test_failing_target_is_reported_and_isolated() {
        let daemon = BroadcastDaemon::new(pattern(100.0).with_limit(3));
        let (first, first_seen) = Recorder::new();
        let (second, second_seen) = Recorder::failing();
        let (third, third_seen) = Recorder::new();
        daemon.attach(shared(first));
        let failing = daemon.attach(shared(second));
        daemon.attach(shared(third));

        daemon.start(100.0).unwrap();
        wait_for(&third_seen, 3, Duration::from_secs(2));
        daemon.stop();

        assert_eq!(*first_seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(*second_seen.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(*third_seen.lock().unwrap(), vec![0, 1, 2]);

        let failures: Vec<DeliveryFailure> = daemon.failures().drain().collect();
        assert_eq!(failures.len(), 3);
        assert!(failures.iter().all(|f| f.target == failing));
        assert!(matches!(failures[0].error, TargetError::Io(_)));

        let stats = daemon.stats();
        assert_eq!(stats.frames_pulled, 3);
        assert_eq!(stats.deliveries, 6);
        assert_eq!(stats.delivery_failures, 3);
    }

    #[test]
    fn test_pull_failures_are_retried() {
        let daemon = BroadcastDaemon::new(pattern(200.0).with_limit(2));
        let (recorder, seen) = Recorder::new();
        daemon.attach(shared(recorder));

        daemon.start(200.0).unwrap();
        wait_for(&seen, 2, Duration::from_secs(2));
        thread::sleep(Duration::from_millis(50));
        assert!(daemon.is_running());
        daemon.stop();

        let stats = daemon.stats();
        assert_eq!(stats.frames_pulled, 2);
        assert!(stats.pull_failures > 0);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_owned_frames_are_delivered() {
        let config = DaemonConfig {
            ownership: Ownership::Owned,
            ..DaemonConfig::default()
        };
        let daemon = BroadcastDaemon::with_config(pattern(100.0).with_limit(4), config);
        let (recorder, seen) = Recorder::new();
        daemon.attach(shared(recorder));

        daemon.start(100.0).unwrap();
        wait_for(&seen, 4, Duration::from_secs(2));
        daemon.stop();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    /// Attaches `late` while pulling the frame with sequence `join_at`
    struct LateJoin {
        inner: TestPatternSource,
        attachments: Attachments,
        late: Option<SharedTarget>,
        join_at: u64,
    }

    impl VideoSource for LateJoin {
        fn pull_frame<'s>(&'s mut self, frame: &mut VideoFrame<'s>) -> Result<(), PullError> {
            let Self {
                inner,
                attachments,
                late,
                join_at,
            } = self;
            inner.pull_frame(frame)?;
            if frame.sequence() == *join_at {
                if let Some(target) = late.take() {
                    attachments.attach(target);
                }
            }
            Ok(())
        }

        fn frame_rate(&self) -> f64 {
            self.inner.frame_rate()
        }

        fn frame_dimensions(&self) -> (u32, u32) {
            self.inner.frame_dimensions()
        }

        fn colour(&self) -> ColourSpace {
            self.inner.colour()
        }

        fn attachments(&self) -> &Attachments {
            self.inner.attachments()
        }
    }

    #[test]
    fn test_late_attach_takes_effect_next_delivery() {
        let inner = TestPatternSource::new(ColourSpace::Rgb24, 4, 4, 5.0)
            .unwrap()
            .with_limit(5);
        let (early, early_seen) = Recorder::new();
        let (late, late_seen) = Recorder::new();
        let source = LateJoin {
            attachments: inner.attachments().clone(),
            inner,
            late: Some(shared(late)),
            join_at: 2,
        };

        let daemon = BroadcastDaemon::new(source);
        daemon.attach(shared(early));
        daemon.start(5.0).unwrap();
        wait_for(&early_seen, 5, Duration::from_secs(3));
        daemon.stop();

        assert_eq!(*early_seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert_eq!(*late_seen.lock().unwrap(), vec![2, 3, 4]);
    }

    struct Panicky {
        calls: Arc<AtomicU64>,
    }

    impl VideoTarget for Panicky {
        fn initialize(&mut self, _: &str, _: f32) -> Result<(), TargetError> {
            Ok(())
        }

        fn accept(&mut self, _: &VideoFrame<'_>) -> Result<(), TargetError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            panic!("renderer lost its window");
        }

        fn finalize(&mut self) -> Result<(), TargetError> {
            Ok(())
        }

        fn state(&self) -> TargetState {
            TargetState::Ready
        }
    }

    #[test]
    fn test_panicking_target_does_not_stop_loop() {
        let daemon = BroadcastDaemon::new(pattern(200.0).with_limit(4));
        let calls = Arc::new(AtomicU64::new(0));
        daemon.attach(shared(Panicky {
            calls: calls.clone(),
        }));
        let (recorder, seen) = Recorder::new();
        daemon.attach(shared(recorder));

        daemon.start(200.0).unwrap();
        wait_for(&seen, 4, Duration::from_secs(2));
        assert!(daemon.is_running());
        daemon.stop();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(daemon.stats().delivery_failures, 4);
    }

    fn stops_within<S: VideoSource + 'static>(daemon: &Arc<BroadcastDaemon<S>>, timeout: Duration) -> bool {
        let (done_tx, done_rx) = flume::bounded(1);
        let stopping = Arc::clone(daemon);
        thread::spawn(move || {
            stopping.stop();
            let _ = done_tx.send(());
        });
        done_rx.recv_timeout(timeout).is_ok()
    }

    fn wait_for_pulls<S: VideoSource + 'static>(daemon: &BroadcastDaemon<S>, frames: u64) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while daemon.stats().frames_pulled < frames && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Detaches itself while taking its second frame
    struct SelfDetaching {
        attachments: Attachments,
        id: Arc<Mutex<Option<TargetId>>>,
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl VideoTarget for SelfDetaching {
        fn initialize(&mut self, _: &str, _: f32) -> Result<(), TargetError> {
            Ok(())
        }

        fn accept(&mut self, frame: &VideoFrame<'_>) -> Result<(), TargetError> {
            let mut seen = self.seen.lock().unwrap();
            seen.push(frame.sequence());
            if seen.len() == 2 {
                if let Some(id) = *self.id.lock().unwrap() {
                    self.attachments.detach(id);
                }
            }
            Ok(())
        }

        fn finalize(&mut self) -> Result<(), TargetError> {
            Ok(())
        }

        fn state(&self) -> TargetState {
            TargetState::Ready
        }
    }

    #[test]
    fn test_target_detaching_itself_mid_stream() {
        let daemon = Arc::new(BroadcastDaemon::new(pattern(100.0)));
        let id = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let target = shared(SelfDetaching {
            attachments: daemon.attachments().clone(),
            id: id.clone(),
            seen: seen.clone(),
        });
        let attached = daemon.attach(target);
        *id.lock().unwrap() = Some(attached);
        let (recorder, recorded) = Recorder::new();
        daemon.attach(shared(recorder));

        daemon.start(100.0).unwrap();
        wait_for(&recorded, 5, Duration::from_secs(3));
        assert!(stops_within(&daemon, Duration::from_secs(3)));

        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
        assert!(!daemon.attachments().contains(attached));
        assert!(recorded.lock().unwrap().len() >= 5);
    }

    /// Queries the daemon it is attached to on every frame
    struct Inspector {
        daemon: Arc<OnceLock<Weak<BroadcastDaemon<TestPatternSource>>>>,
        queries: Arc<AtomicU64>,
    }

    impl VideoTarget for Inspector {
        fn initialize(&mut self, _: &str, _: f32) -> Result<(), TargetError> {
            Ok(())
        }

        fn accept(&mut self, _: &VideoFrame<'_>) -> Result<(), TargetError> {
            thread::sleep(Duration::from_millis(50));
            if let Some(daemon) = self.daemon.get().and_then(Weak::upgrade) {
                let _ = daemon.is_running();
                let _ = daemon.state();
                let _ = daemon.period();
                self.queries.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn finalize(&mut self) -> Result<(), TargetError> {
            Ok(())
        }

        fn state(&self) -> TargetState {
            TargetState::Ready
        }
    }

    #[test]
    fn test_stop_while_target_queries_daemon() {
        let handle = Arc::new(OnceLock::new());
        let queries = Arc::new(AtomicU64::new(0));
        let daemon = Arc::new(BroadcastDaemon::new(pattern(100.0)));
        handle.set(Arc::downgrade(&daemon)).unwrap();
        daemon.attach(shared(Inspector {
            daemon: handle,
            queries: queries.clone(),
        }));

        daemon.start(100.0).unwrap();
        wait_for_pulls(&daemon, 2);
        assert!(stops_within(&daemon, Duration::from_secs(3)));
        assert!(!daemon.is_running());
        assert!(queries.load(Ordering::SeqCst) >= 1);
    }
}
