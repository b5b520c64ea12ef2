use std::path::PathBuf;

use camconfig::{PipelineConfig, RecordingConfig, VideoCodec};
use scheduler::PacingPolicy;

/// Pixel dimensions of a surface, texture or framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Dimensions with 90 degree rotations applied.
    pub fn transposed(&self) -> Self {
        Self::new(self.height, self.width)
    }

    pub fn rgba_len(&self) -> usize {
        self.width as usize * self.height as usize * 4
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Viewport rectangle in pixels, origin top-left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn full(size: Size) -> Self {
        Self {
            x: 0,
            y: 0,
            width: size.width,
            height: size.height,
        }
    }
}

/// Rectangle expressed as `(left, top, right, bottom)` edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl TargetRect {
    pub fn width(&self) -> u32 {
        self.right - self.left
    }

    pub fn height(&self) -> u32 {
        self.bottom - self.top
    }

    pub fn viewport(&self) -> Viewport {
        Viewport {
            x: self.left,
            y: self.top,
            width: self.width(),
            height: self.height(),
        }
    }
}

/// Adapter power preference forwarded to wgpu.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuPowerPreference {
    #[default]
    Low,
    High,
}

/// Fixed output parameters of a recording session.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSettings {
    pub output: PathBuf,
    pub size: Size,
    pub bitrate: u32,
    pub frame_rate: u32,
    pub codec: VideoCodec,
}

impl RecordingSettings {
    pub fn from_config(config: &RecordingConfig) -> Self {
        Self {
            output: config.output.clone(),
            size: Size::new(config.width, config.height),
            bitrate: config.bitrate,
            frame_rate: config.frame_rate,
            codec: config.codec,
        }
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self::from_config(&RecordingConfig::default())
    }
}

/// Everything the render thread needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub pacing: PacingPolicy,
    pub recording: RecordingSettings,
    pub background: [f32; 4],
}

impl PipelineOptions {
    pub fn from_config(config: &PipelineConfig) -> Result<Self, scheduler::SchedulerError> {
        Ok(Self {
            pacing: PacingPolicy::from_display(&config.display)?,
            recording: RecordingSettings::from_config(&config.recording),
            ..Self::default()
        })
    }
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            pacing: PacingPolicy::default(),
            recording: RecordingSettings::default(),
            background: [0.0, 0.0, 0.0, 1.0],
        }
    }
}
