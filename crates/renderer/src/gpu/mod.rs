//! Graphics device seam used by the render thread.
//!
//! The pipeline talks to the GPU through [`GpuDevice`], a small immediate
//! style API over opaque handles:
//! - `context` builds the wgpu instance, adapter and device, owns window and
//!   encoder surfaces, and implements [`GpuDevice`] as [`WgpuDevice`].
//! - `pipeline` turns a [`ProgramDesc`] into shader modules and caches one
//!   render pipeline per target format.
//! - `uniforms` mirrors the GLSL parameter block shared by every program.
//! - `headless` implements the same trait without a GPU and records every
//!   call, which is what the tests and the `--headless` dry run use.
//!
//! Exactly one surface is current at a time. Draws and clears land on the
//! bound framebuffer texture when one is bound, otherwise on the current
//! surface.

mod context;
mod headless;
mod pipeline;
mod readback;
mod uniforms;

use std::fmt;
use std::sync::Arc;

use camconfig::PixelFormat;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::encoder::FrameSink;
use crate::error::{GpuError, PresentError};
use crate::types::{Size, Viewport};

pub use context::{WgpuDevice, WgpuOptions};
pub use headless::{GpuOp, HeadlessDevice, HeadlessProbe, SurfaceKind};
pub use uniforms::FilterUniforms;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u32);

        impl $name {
            pub(crate) fn from_raw(raw: u32) -> Self {
                Self(raw)
            }

            pub fn raw(&self) -> u32 {
                self.0
            }
        }
    };
}

handle!(
    /// Presentation target: a window surface or an encoder input surface.
    SurfaceId
);
handle!(
    /// Compiled filter program.
    ProgramId
);
handle!(
    /// Texture: camera input, intermediate framebuffer or sampled image.
    TextureId
);

/// Anything wgpu can create a window surface from.
pub trait WindowTarget: HasWindowHandle + HasDisplayHandle + Send + Sync {}

impl<T> WindowTarget for T where T: HasWindowHandle + HasDisplayHandle + Send + Sync {}

/// Drawable handed over by the display collaborator.
#[derive(Clone)]
pub enum DisplayTarget {
    Window(Arc<dyn WindowTarget>),
    /// No window; devices render into an offscreen texture of the surface size.
    Offscreen,
}

impl fmt::Debug for DisplayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Window(_) => f.write_str("DisplayTarget::Window"),
            Self::Offscreen => f.write_str("DisplayTarget::Offscreen"),
        }
    }
}

/// How a program samples one of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputKind {
    Texture2d,
    /// Camera image in its native layout.
    External(PixelFormat),
}

impl InputKind {
    /// Number of texture planes bound for this input.
    pub fn planes(&self) -> u32 {
        match self {
            Self::External(PixelFormat::Nv12) => 2,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramDesc {
    pub label: String,
    /// GLSL defining `vec4 apply_filter(vec2 uv)`.
    pub fragment: String,
    pub inputs: Vec<InputKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureUsage {
    /// Uploaded once and sampled, e.g. a lookup table.
    Sampled,
    /// Intermediate framebuffer between two stages.
    RenderTarget,
    /// Camera input refreshed every frame.
    External(PixelFormat),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureDesc {
    pub label: String,
    pub size: Size,
    pub usage: TextureUsage,
}

/// Expected byte length of a full upload for `usage` at `size`.
pub fn upload_len(usage: TextureUsage, size: Size) -> usize {
    let pixels = size.width as usize * size.height as usize;
    match usage {
        TextureUsage::External(PixelFormat::Nv12) => pixels + pixels / 2,
        _ => pixels * 4,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub program: ProgramId,
    pub inputs: &'a [TextureId],
    pub uniforms: FilterUniforms,
}

/// Immediate-mode graphics device owned by the render thread.
pub trait GpuDevice {
    fn backend_name(&self) -> &str;

    fn create_window_surface(
        &mut self,
        target: &DisplayTarget,
        size: Size,
    ) -> Result<SurfaceId, GpuError>;
    /// Surface whose presented frames are read back and handed to `sink`.
    fn create_encoder_surface(
        &mut self,
        size: Size,
        sink: Box<dyn FrameSink>,
    ) -> Result<SurfaceId, GpuError>;
    fn resize_surface(&mut self, surface: SurfaceId, size: Size) -> Result<(), GpuError>;
    fn release_surface(&mut self, surface: SurfaceId);
    fn make_current(&mut self, surface: Option<SurfaceId>) -> Result<(), GpuError>;

    /// `None` renders to the current surface.
    fn bind_framebuffer(&mut self, target: Option<TextureId>) -> Result<(), GpuError>;
    fn set_viewport(&mut self, viewport: Viewport);
    fn clear(&mut self, color: [f32; 4]) -> Result<(), GpuError>;

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, GpuError>;
    fn destroy_program(&mut self, program: ProgramId);

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, GpuError>;
    /// Replaces the texture contents. NV12 data is the luma plane followed by
    /// the interleaved chroma plane.
    fn upload_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), GpuError>;
    fn destroy_texture(&mut self, texture: TextureId);

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError>;

    fn set_presentation_time(&mut self, surface: SurfaceId, nanos: u64);
    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<(), PresentError>;
}

/// Builds the device on the render thread.
pub type DeviceFactory = Box<dyn FnOnce() -> anyhow::Result<Box<dyn GpuDevice>> + Send>;
