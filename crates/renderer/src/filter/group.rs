use crate::error::GpuError;
use crate::gpu::{GpuDevice, TextureDesc, TextureId, TextureUsage};
use crate::types::{Size, Viewport};

use super::{DrawContext, FilterStage};

const TRANSPARENT: [f32; 4] = [0.0, 0.0, 0.0, 0.0];

/// Ordered list of stages run back to back.
///
/// Every stage but the last renders into its own framebuffer sized to the
/// group output; the last one renders into whatever target was bound when
/// the group was drawn.
pub struct FilterGroup {
    name: String,
    stages: Vec<Box<dyn FilterStage>>,
    framebuffers: Vec<TextureId>,
    output: Size,
    initialized: bool,
}

impl FilterGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_stages(name, Vec::new())
    }

    pub fn with_stages(name: impl Into<String>, stages: Vec<Box<dyn FilterStage>>) -> Self {
        Self {
            name: name.into(),
            stages,
            framebuffers: Vec::new(),
            output: Size::default(),
            initialized: false,
        }
    }

    /// Appends a stage before the group is handed to the render thread.
    pub fn push(&mut self, stage: Box<dyn FilterStage>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Inserts `stage` at `index`, clamped to the current length. On an
    /// initialized group the stage is initialized and sized first.
    pub fn insert(
        &mut self,
        device: &mut dyn GpuDevice,
        index: usize,
        mut stage: Box<dyn FilterStage>,
    ) -> Result<(), GpuError> {
        let index = index.min(self.stages.len());
        if self.initialized {
            if let Err(err) = prepare(device, stage.as_mut(), self.output) {
                stage.destroy(device);
                return Err(err);
            }
        }
        tracing::debug!(group = %self.name, stage = stage.name(), index, "inserting filter");
        self.stages.insert(index, stage);
        self.rebuild_framebuffers(device)
    }

    /// Removes and destroys the stage at `index`. Out of range indices are
    /// ignored.
    pub fn remove(&mut self, device: &mut dyn GpuDevice, index: usize) -> Result<(), GpuError> {
        if index >= self.stages.len() {
            tracing::warn!(
                group = %self.name,
                index,
                len = self.stages.len(),
                "filter index out of range; ignoring removal"
            );
            return Ok(());
        }
        let mut stage = self.stages.remove(index);
        tracing::debug!(group = %self.name, stage = stage.name(), index, "removing filter");
        stage.destroy(device);
        self.rebuild_framebuffers(device)
    }

    fn release_framebuffers(&mut self, device: &mut dyn GpuDevice) {
        for texture in self.framebuffers.drain(..) {
            device.destroy_texture(texture);
        }
    }

    fn rebuild_framebuffers(&mut self, device: &mut dyn GpuDevice) -> Result<(), GpuError> {
        self.release_framebuffers(device);
        if !self.initialized || self.output.is_empty() {
            return Ok(());
        }
        for index in 0..self.stages.len().saturating_sub(1) {
            let texture = device.create_texture(&TextureDesc {
                label: format!("{} framebuffer {index}", self.name),
                size: self.output,
                usage: TextureUsage::RenderTarget,
            })?;
            self.framebuffers.push(texture);
        }
        Ok(())
    }

    fn draw_stages(
        &mut self,
        ctx: &mut DrawContext<'_>,
        input: TextureId,
        outer_framebuffer: Option<TextureId>,
        outer_viewport: Viewport,
    ) -> Result<(), GpuError> {
        let last = self.stages.len() - 1;
        let mut source = input;
        for (index, stage) in self.stages.iter_mut().enumerate() {
            if index == last {
                ctx.render.bind_framebuffer(outer_framebuffer)?;
                ctx.render.set_viewport(outer_viewport);
                stage.on_draw(ctx, source)?;
            } else {
                let target = self.framebuffers[index];
                ctx.render.bind_framebuffer(Some(target))?;
                ctx.render.set_viewport(Viewport::full(self.output));
                ctx.render.clear(TRANSPARENT)?;
                stage.on_draw(ctx, source)?;
                source = target;
            }
        }
        Ok(())
    }
}

fn prepare(device: &mut dyn GpuDevice, stage: &mut dyn FilterStage, size: Size) -> Result<(), GpuError> {
    stage.init(device)?;
    stage.on_output_size_changed(device, size)
}

impl FilterStage for FilterGroup {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, device: &mut dyn GpuDevice) -> Result<(), GpuError> {
        for stage in &mut self.stages {
            stage.init(device)?;
        }
        self.initialized = true;
        self.rebuild_framebuffers(device)
    }

    fn on_output_size_changed(
        &mut self,
        device: &mut dyn GpuDevice,
        size: Size,
    ) -> Result<(), GpuError> {
        self.output = size;
        for stage in &mut self.stages {
            stage.on_output_size_changed(device, size)?;
        }
        self.rebuild_framebuffers(device)
    }

    fn on_draw(&mut self, ctx: &mut DrawContext<'_>, input: TextureId) -> Result<(), GpuError> {
        if !self.initialized
            || self.stages.is_empty()
            || self.framebuffers.len() + 1 != self.stages.len()
        {
            return Ok(());
        }
        let outer_framebuffer = ctx.render.framebuffer();
        let outer_viewport = ctx.render.viewport();
        let result = self.draw_stages(ctx, input, outer_framebuffer, outer_viewport);
        let restored = ctx.render.bind_framebuffer(outer_framebuffer);
        ctx.render.set_viewport(outer_viewport);
        result.and(restored)
    }

    fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.release_framebuffers(device);
        for stage in &mut self.stages {
            stage.destroy(device);
        }
        self.initialized = false;
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }
}

#[cfg(test)]
mod tests {
    use scheduler::FrameTiming;

    use super::*;
    use crate::context::RenderContext;
    use crate::filter::ShaderStage;
    use crate::gpu::{DisplayTarget, GpuOp, HeadlessDevice, HeadlessProbe};

    fn context() -> (RenderContext, HeadlessProbe) {
        let (device, probe) = HeadlessDevice::new();
        let mut ctx = RenderContext::new(Box::new(device));
        ctx.attach_display(&DisplayTarget::Offscreen, Size::new(32, 16))
            .unwrap();
        (ctx, probe)
    }

    fn three_stage_group() -> FilterGroup {
        FilterGroup::with_stages(
            "look",
            vec![
                Box::new(ShaderStage::grayscale()),
                Box::new(ShaderStage::sepia()),
                Box::new(ShaderStage::invert()),
            ],
        )
    }

    fn draw_labels(probe: &HeadlessProbe) -> Vec<(String, Option<TextureId>)> {
        probe
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                GpuOp::Draw {
                    label, framebuffer, ..
                } => Some((label, framebuffer)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn stages_chain_through_intermediate_framebuffers() {
        let (mut ctx, probe) = context();
        let mut group = three_stage_group();
        group.init(ctx.device()).unwrap();
        group
            .on_output_size_changed(ctx.device(), Size::new(32, 16))
            .unwrap();
        assert_eq!(group.framebuffers.len(), 2);

        let input = ctx
            .device()
            .create_texture(&TextureDesc {
                label: "input".into(),
                size: Size::new(32, 16),
                usage: TextureUsage::RenderTarget,
            })
            .unwrap();
        probe.clear_ops();
        let mut draw = DrawContext {
            render: &mut ctx,
            timing: FrameTiming::default(),
            recording: None,
        };
        group.on_draw(&mut draw, input).unwrap();

        let draws = draw_labels(&probe);
        assert_eq!(
            draws,
            vec![
                ("grayscale".to_string(), Some(group.framebuffers[0])),
                ("sepia".to_string(), Some(group.framebuffers[1])),
                ("invert".to_string(), None),
            ]
        );
        assert_eq!(ctx.framebuffer(), None);
        assert_eq!(ctx.viewport(), Viewport::full(Size::new(32, 16)));
    }

    #[test]
    fn insert_and_remove_keep_framebuffers_in_step() {
        let (mut ctx, _probe) = context();
        let mut group = FilterGroup::new("user");
        group.init(ctx.device()).unwrap();
        group
            .on_output_size_changed(ctx.device(), Size::new(8, 8))
            .unwrap();
        assert!(group.framebuffers.is_empty());

        group
            .insert(ctx.device(), 0, Box::new(ShaderStage::sepia()))
            .unwrap();
        group
            .insert(ctx.device(), 99, Box::new(ShaderStage::invert()))
            .unwrap();
        group
            .insert(ctx.device(), 0, Box::new(ShaderStage::grayscale()))
            .unwrap();
        assert_eq!(group.stage_names(), ["grayscale", "sepia", "invert"]);
        assert_eq!(group.framebuffers.len(), 2);
        assert!(group.stages.iter().all(|stage| stage.is_initialized()));

        group.remove(ctx.device(), 1).unwrap();
        group.remove(ctx.device(), 7).unwrap();
        assert_eq!(group.stage_names(), ["grayscale", "invert"]);
        assert_eq!(group.framebuffers.len(), 1);
    }

    #[test]
    fn destroy_releases_everything() {
        let (mut ctx, probe) = context();
        let mut group = three_stage_group();
        group.init(ctx.device()).unwrap();
        group
            .on_output_size_changed(ctx.device(), Size::new(8, 8))
            .unwrap();
        group.destroy(ctx.device());

        let ops = probe.ops();
        let destroyed_programs = ops
            .iter()
            .filter(|op| matches!(op, GpuOp::DestroyProgram(_)))
            .count();
        let destroyed_textures = ops
            .iter()
            .filter(|op| matches!(op, GpuOp::DestroyTexture(_)))
            .count();
        assert_eq!(destroyed_programs, 3);
        assert_eq!(destroyed_textures, 2);
        assert!(!group.is_initialized());
    }
}
