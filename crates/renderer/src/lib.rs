//! Camera filter pipeline: live camera frames through a chain of GPU filters
//! to a display surface, with optional real-time recording of the same
//! filtered stream.
//!
//! ```text
//!   camera thread ──frame_available()──┐
//!   window / UI ──surface + control────┤  CommandSender (FIFO, never blocks)
//!                                      ▼
//!                              render thread ── FrameScheduler: render or drop?
//!                                      │
//!                                      ├─ apply deferred filter/recording changes
//!                                      ├─ FilterChain: camera ▸ user filters ▸ record
//!                                      │                                     ├─▶ encoder surface ─▶ ffmpeg
//!                                      │                                     └─▶ display surface
//!                                      └─ swap display, update telemetry
//! ```
//!
//! Exactly one thread, the render thread, touches the graphics device. It is
//! reached only through [`Command`]s, and the display surface is always the
//! current one again when a frame routine finishes.

pub mod camera;
pub mod command;
mod compile;
pub mod context;
pub mod encoder;
pub mod error;
pub mod event;
pub mod filter;
pub mod gpu;
pub mod pipeline;
pub mod preview;
pub mod recorder;
pub mod thread;
pub mod types;

pub use camera::{
    CameraBridge, CameraFeed, CameraFrame, CameraOrientation, FrameSlot, Rotation, SlotFeed,
};
pub use command::{Command, CommandSender};
pub use encoder::{
    EncoderError, EncoderFactory, FfmpegEncoderFactory, Finalizer, FrameSink, VideoEncoder,
    VideoFrame,
};
pub use error::{FilterBuildError, GpuError, PipelineError, PresentError, RecordingError};
pub use event::PipelineEvent;
pub use filter::{
    build_filter, build_group, CameraInputStage, DrawContext, FilterChain, FilterGroup,
    FilterStage, LookupStage, ShaderStage,
};
pub use gpu::{DeviceFactory, DisplayTarget, GpuDevice, HeadlessDevice, WgpuDevice, WgpuOptions};
pub use pipeline::{Pipeline, PipelineHandle};
pub use preview::{run_preview, PreviewOptions};
pub use recorder::{aspect_fit, RecordStage, RecordingSession, RecordingState};
pub use thread::ThreadState;
pub use types::{GpuPowerPreference, PipelineOptions, RecordingSettings, Size, TargetRect, Viewport};
