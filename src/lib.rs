pub mod broadcast;
pub mod error;
pub mod frame;
pub mod rawfile;
pub mod source;
pub mod target;
pub mod utils;

use std::path::{Path, PathBuf};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

pub use broadcast::{BroadcastDaemon, DaemonConfig, DaemonState, StatsSnapshot};
pub use error::{DaemonError, FrameError, PullError, SourceError, TargetError};
pub use frame::{ColourSpace, Ownership, SharedFrame, VideoFrame};
pub use source::{Attachments, DeliveryFailure, SharedTarget, TargetId, VideoSource};
pub use target::{TargetState, VideoTarget};

/// Global configuration that can be atomically swapped at runtime
pub static CONFIG: once_cell::sync::Lazy<ArcSwap<Config>> =
    once_cell::sync::Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Environment variables override file settings, e.g.
/// `FRAMECAST__SOURCE__FPS=15`
pub const ENV_PREFIX: &str = "FRAMECAST";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub broadcast: BroadcastConfig,
    pub target: TargetConfig,
    pub run: RunConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    TestPattern,
    RawFile,
    V4l2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Recording to play back, or capture device; empty means auto-detect
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub colour: ColourSpace,
    /// Test pattern only: end of stream after this many frames
    pub frame_limit: Option<u64>,
    /// Raw file only: restart at the first frame
    pub looping: bool,
    /// V4L2 only
    pub buffer_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Broadcast rate; the source's native rate when unset
    pub frame_rate: Option<f64>,
    pub ownership: Ownership,
    pub failure_queue: usize,
    pub thread_name: String,
    pub pin_core: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Recording written by the bundled writer, must end in `.fcraw`
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Stop after this long; run until interrupted when unset
    pub duration_secs: Option<u64>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::TestPattern,
            path: String::new(),
            width: 640,
            height: 480,
            fps: 30.0,
            colour: ColourSpace::Rgb24,
            frame_limit: None,
            looping: false,
            buffer_count: 4,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        let daemon = DaemonConfig::default();
        Self {
            frame_rate: None,
            ownership: daemon.ownership,
            failure_queue: daemon.failure_queue,
            thread_name: daemon.thread_name,
            pin_core: daemon.pin_core,
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            path: format!("capture.{}", rawfile::EXTENSION),
        }
    }
}

impl From<&BroadcastConfig> for DaemonConfig {
    fn from(config: &BroadcastConfig) -> Self {
        Self {
            ownership: config.ownership,
            failure_queue: config.failure_queue,
            thread_name: config.thread_name.clone(),
            pin_core: config.pin_core,
        }
    }
}

impl Config {
    /// Defaults, overlaid by `path` (TOML) when given, overlaid by
    /// `FRAMECAST__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path.to_path_buf()).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        settings.try_deserialize()
    }

    /// Make this the active configuration
    pub fn publish(&self) {
        CONFIG.store(std::sync::Arc::new(self.clone()));
    }
}

impl SourceConfig {
    /// Construct the configured source
    pub fn open(&self) -> Result<Box<dyn VideoSource>, SourceError> {
        info!(kind = ?self.kind, path = %self.path, "Opening source");
        match self.kind {
            SourceKind::TestPattern => {
                let mut pattern =
                    source::TestPatternSource::new(self.colour, self.width, self.height, self.fps)?;
                if let Some(limit) = self.frame_limit {
                    pattern = pattern.with_limit(limit);
                }
                Ok(Box::new(pattern))
            }
            SourceKind::RawFile => {
                let reader = source::RawFileReader::open(PathBuf::from(&self.path))?.looping(self.looping);
                Ok(Box::new(reader))
            }
            SourceKind::V4l2 => self.open_v4l2(),
        }
    }

    #[cfg(feature = "v4l2")]
    fn open_v4l2(&self) -> Result<Box<dyn VideoSource>, SourceError> {
        let path = if self.path.is_empty() {
            source::v4l2::auto_detect_device(self.colour)?
        } else {
            self.path.clone()
        };
        let camera = source::V4l2Source::open(source::v4l2::V4l2Settings {
            path,
            width: self.width,
            height: self.height,
            fps: self.fps.round() as u32,
            colour: self.colour,
            buffer_count: self.buffer_count,
        })?;
        Ok(Box::new(camera))
    }

    #[cfg(not(feature = "v4l2"))]
    fn open_v4l2(&self) -> Result<Box<dyn VideoSource>, SourceError> {
        Err(SourceError::Unsupported(
            "built without the `v4l2` feature".into(),
        ))
    }
}
