//! Filter stages and their composition.
//!
//! A [`FilterStage`] draws its input texture into whatever the render
//! context currently targets. [`FilterGroup`] runs stages back to back
//! through intermediate framebuffers and is itself a stage, so groups nest.
//! [`FilterChain`] is the fixed frame layout: camera input, the user's
//! filter group, then the recording stage that fans out to the encoder.

mod camera_input;
mod chain;
mod group;
mod stages;

use scheduler::FrameTiming;

use crate::context::RenderContext;
use crate::error::GpuError;
use crate::gpu::{GpuDevice, TextureId};
use crate::recorder::RecordingSession;
use crate::types::Size;

pub use camera_input::CameraInputStage;
pub use chain::FilterChain;
pub use group::FilterGroup;
pub use stages::{build_filter, build_group, LookupStage, ShaderStage};
pub(crate) use stages::{ProgramSlot, PASSTHROUGH_BODY};

/// Everything a stage may touch while drawing one frame.
pub struct DrawContext<'a> {
    pub render: &'a mut RenderContext,
    pub timing: FrameTiming,
    /// Active recording session, if any.
    pub recording: Option<&'a mut RecordingSession>,
}

/// One GPU processing step.
///
/// Stages are built on any thread and handed to the render thread, which
/// calls every other method with the device current.
pub trait FilterStage: Send {
    fn name(&self) -> &str;

    /// Allocates programs and textures.
    fn init(&mut self, device: &mut dyn GpuDevice) -> Result<(), GpuError>;

    fn on_output_size_changed(
        &mut self,
        device: &mut dyn GpuDevice,
        size: Size,
    ) -> Result<(), GpuError>;

    /// Draws `input` into the current target with the current viewport.
    /// Stages that are not initialized draw nothing.
    fn on_draw(&mut self, ctx: &mut DrawContext<'_>, input: TextureId) -> Result<(), GpuError>;

    fn destroy(&mut self, device: &mut dyn GpuDevice);

    fn is_initialized(&self) -> bool;
}
