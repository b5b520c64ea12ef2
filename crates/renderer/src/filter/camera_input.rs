use camconfig::PixelFormat;

use crate::camera::{camera_tex_coords, CameraOrientation};
use crate::error::GpuError;
use crate::gpu::{DrawCall, FilterUniforms, GpuDevice, InputKind, TextureId};
use crate::types::Size;

use super::{DrawContext, FilterStage, ProgramSlot, PASSTHROUGH_BODY};

/// First stage of every chain: samples the camera texture in its native
/// layout, applies sensor rotation and mirroring, and crops it to the
/// output aspect.
pub struct CameraInputStage {
    program: ProgramSlot,
    format: PixelFormat,
    image: Size,
    orientation: CameraOrientation,
    output: Size,
}

impl CameraInputStage {
    pub fn new() -> Self {
        let format = PixelFormat::default();
        Self {
            program: ProgramSlot::new(
                "camera input",
                PASSTHROUGH_BODY,
                vec![InputKind::External(format)],
            ),
            format,
            image: Size::default(),
            orientation: CameraOrientation::default(),
            output: Size::default(),
        }
    }

    /// Adopts a new camera source, recompiling when the pixel layout changes.
    pub fn set_source(
        &mut self,
        device: &mut dyn GpuDevice,
        format: PixelFormat,
        image: Size,
        orientation: CameraOrientation,
    ) -> Result<(), GpuError> {
        if format != self.format {
            tracing::debug!(from = ?self.format, to = ?format, "camera format changed");
        }
        self.program
            .set_inputs(device, vec![InputKind::External(format)])?;
        self.format = format;
        self.image = image;
        self.orientation = orientation;
        Ok(())
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn output_size(&self) -> Size {
        self.output
    }
}

impl Default for CameraInputStage {
    fn default() -> Self {
        Self::new()
    }
}

impl FilterStage for CameraInputStage {
    fn name(&self) -> &str {
        self.program.label()
    }

    fn init(&mut self, device: &mut dyn GpuDevice) -> Result<(), GpuError> {
        self.program.init(device).map(|_| ())
    }

    fn on_output_size_changed(
        &mut self,
        _device: &mut dyn GpuDevice,
        size: Size,
    ) -> Result<(), GpuError> {
        self.output = size;
        Ok(())
    }

    fn on_draw(&mut self, ctx: &mut DrawContext<'_>, input: TextureId) -> Result<(), GpuError> {
        let Some(program) = self.program.id() else {
            return Ok(());
        };
        let mut uniforms = FilterUniforms::new(self.output, self.image);
        uniforms.set_tex_coords(&camera_tex_coords(self.orientation, self.image, self.output));
        uniforms.set_timing(&ctx.timing);
        ctx.render.draw(&DrawCall {
            program,
            inputs: &[input],
            uniforms,
        })
    }

    fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.program.destroy(device);
    }

    fn is_initialized(&self) -> bool {
        self.program.id().is_some()
    }
}
