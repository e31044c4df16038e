//! Paced pull-and-deliver loop
//!
//! ```text
//!   BroadcastDaemon thread, once per period
//!   ┌──────────────────────────────────────────────┐
//!   │ source.pull_frame(&mut frame)                │
//!   │   └─ ok ──► attachments.notify(&frame)       │
//!   │               target#0.on_frame(&frame)      │
//!   │               target#1.on_frame(&frame)  ✗ ──┼──► failures channel
//!   │               target#2.on_frame(&frame)      │
//!   │ sleep(period - elapsed)  (woken by stop)     │
//!   └──────────────────────────────────────────────┘
//! ```
//!
//! The frame is a single slot reused across cycles. Targets see it only for
//! the duration of their `on_frame` call.

pub mod daemon;
pub mod stats;

pub use daemon::{effective_rate, BroadcastDaemon, DaemonConfig, DaemonState};
pub use stats::{DaemonStats, StatsSnapshot};

pub use crate::source::DeliveryFailure;
