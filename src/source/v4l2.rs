//! V4L2 camera source with memory-mapped buffers

use std::path::Path;
use std::time::Instant;

use tracing::{info, instrument};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::error::{PullError, SourceError};
use crate::frame::{ColourSpace, VideoFrame};
use crate::source::{check_pull_colour, Attachments, VideoSource};

/// Capture settings for [`V4l2Source::open`]
#[derive(Debug, Clone)]
pub struct V4l2Settings {
    pub path: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub colour: ColourSpace,
    pub buffer_count: u32,
}

/// V4L2 capture device.
///
/// Borrowing frames alias the dequeued mmap buffer, which the driver reuses
/// once the next frame is pulled.
pub struct V4l2Source {
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    colour: ColourSpace,
    cols: u32,
    rows: u32,
    frame_rate: f64,
    sequence: u64,
    attachments: Attachments,
}

pub fn fourcc(colour: ColourSpace) -> Option<FourCC> {
    let code = match colour {
        ColourSpace::Mjpeg => b"MJPG",
        ColourSpace::Yuyv => b"YUYV",
        ColourSpace::Uyvy => b"UYVY",
        ColourSpace::Rgb24 => b"RGB3",
        ColourSpace::Bgr24 => b"BGR3",
        ColourSpace::Bgra => b"AR24",
        ColourSpace::Mono8 => b"GREY",
        ColourSpace::Mono16 => b"Y16 ",
        ColourSpace::I420 => b"YU12",
        ColourSpace::Nv12 => b"NV12",
        ColourSpace::BayerRggb8 => b"RGGB",
        ColourSpace::BayerBggr8 => b"BA81",
        ColourSpace::BayerGrbg8 => b"GRBG",
        ColourSpace::BayerGbrg8 => b"GBRG",
        ColourSpace::Bayer16 => return None,
    };
    Some(FourCC::new(code))
}

impl V4l2Source {
    #[instrument]
    pub fn open(settings: V4l2Settings) -> Result<Self, SourceError> {
        let device = Device::with_path(&settings.path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(SourceError::Unsupported("device doesn't support video capture".into()));
        }

        let mut fmt = device.format()?;
        fmt.width = settings.width;
        fmt.height = settings.height;
        fmt.fourcc = fourcc(settings.colour)
            .ok_or_else(|| SourceError::Unsupported(format!("pixel format {}", settings.colour)))?;
        let fmt = device.set_format(&fmt)?;
        if fmt.fourcc != fourcc(settings.colour).unwrap_or(fmt.fourcc) {
            return Err(SourceError::Unsupported(format!(
                "device refused {}, offers {}",
                settings.colour, fmt.fourcc
            )));
        }

        let params = device.set_params(&Parameters::with_fps(settings.fps))?;
        let frame_rate = if params.interval.numerator == 0 {
            f64::from(settings.fps)
        } else {
            f64::from(params.interval.denominator) / f64::from(params.interval.numerator)
        };

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, settings.buffer_count)?;
        info!(
            width = fmt.width,
            height = fmt.height,
            frame_rate,
            buffers = settings.buffer_count,
            "Capture stream started"
        );

        Ok(Self {
            device: Box::new(device),
            stream: Some(stream),
            colour: settings.colour,
            cols: fmt.width,
            rows: fmt.height,
            frame_rate,
            sequence: 0,
            attachments: Attachments::new(),
        })
    }

    /// Stop streaming; later pulls fail with [`PullError::NotStreaming`]
    pub fn stop_stream(&mut self) {
        self.stream = None;
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl VideoSource for V4l2Source {
    fn pull_frame<'s>(&'s mut self, frame: &mut VideoFrame<'s>) -> Result<(), PullError> {
        check_pull_colour(self.colour, frame)?;
        let Self {
            stream,
            cols,
            rows,
            sequence,
            ..
        } = self;

        let stream = stream.as_mut().ok_or(PullError::NotStreaming)?;
        let (buf, meta) = stream.next().map_err(|e| PullError::Capture(e.to_string()))?;
        let used = match meta.bytesused as usize {
            0 => buf.len(),
            n => n.min(buf.len()),
        };

        frame.init_from_slice(&buf[..used], *cols, *rows)?;
        frame.stamp(*sequence, Instant::now());
        *sequence += 1;
        Ok(())
    }

    fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    fn frame_dimensions(&self) -> (u32, u32) {
        (self.cols, self.rows)
    }

    fn colour(&self) -> ColourSpace {
        self.colour
    }

    fn attachments(&self) -> &Attachments {
        &self.attachments
    }
}

/// Find the first capture device offering `colour`
pub fn auto_detect_device(colour: ColourSpace) -> Result<String, SourceError> {
    let wanted = fourcc(colour)
        .ok_or_else(|| SourceError::Unsupported(format!("pixel format {}", colour)))?;

    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }
        if let Ok(formats) = dev.enum_formats() {
            if formats.iter().any(|fmt| fmt.fourcc == wanted) {
                info!("Found {} device: {} - {}", colour, path, caps.card);
                return Ok(path);
            }
        }
    }

    Err(SourceError::Unsupported(format!("no capture device offers {}", colour)))
}
