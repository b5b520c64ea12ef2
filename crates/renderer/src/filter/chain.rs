use std::sync::Arc;

use crate::camera::CameraFeed;
use crate::error::GpuError;
use crate::gpu::{GpuDevice, TextureDesc, TextureId, TextureUsage};
use crate::recorder::RecordStage;
use crate::types::{Size, Viewport};

use super::{CameraInputStage, DrawContext, FilterGroup, FilterStage};

const TRANSPARENT: [f32; 4] = [0.0, 0.0, 0.0, 0.0];

struct BoundCamera {
    feed: Arc<dyn CameraFeed>,
    texture: TextureId,
    uploaded: Option<u64>,
    warned: bool,
}

impl BoundCamera {
    /// Uploads the newest camera frame if it has not been seen yet.
    fn refresh(&mut self, device: &mut dyn GpuDevice) -> Result<(), GpuError> {
        let Some(frame) = self.feed.latest_frame() else {
            return Ok(());
        };
        if self.uploaded.is_some_and(|seen| frame.timestamp <= seen) {
            return Ok(());
        }
        self.uploaded = Some(frame.timestamp);
        if frame.size != self.feed.dimensions()
            || frame.format != self.feed.format()
            || !frame.is_complete()
        {
            if !self.warned {
                tracing::warn!(
                    ?frame,
                    expected_size = %self.feed.dimensions(),
                    expected_format = ?self.feed.format(),
                    "camera frame does not match the bound source; skipping"
                );
                self.warned = true;
            }
            return Ok(());
        }
        device.upload_texture(self.texture, &frame.data)
    }
}

/// Fixed frame layout: camera input, then the user's filters, then the
/// recording stage drawing to the display.
pub struct FilterChain {
    camera: CameraInputStage,
    user: FilterGroup,
    record: RecordStage,
    source: Option<BoundCamera>,
    camera_output: Option<TextureId>,
    user_output: Option<TextureId>,
    output: Size,
    initialized: bool,
}

impl FilterChain {
    pub fn new() -> Self {
        Self {
            camera: CameraInputStage::new(),
            user: FilterGroup::new("filters"),
            record: RecordStage::new(),
            source: None,
            camera_output: None,
            user_output: None,
            output: Size::default(),
            initialized: false,
        }
    }

    pub fn init(&mut self, device: &mut dyn GpuDevice) -> Result<(), GpuError> {
        self.camera.init(device)?;
        self.user.init(device)?;
        self.record.init(device)?;
        self.initialized = true;
        self.rebuild_framebuffers(device)
    }

    pub fn output_size(&self) -> Size {
        self.output
    }

    pub fn user(&self) -> &FilterGroup {
        &self.user
    }

    pub fn has_camera(&self) -> bool {
        self.source.is_some()
    }

    pub fn set_output_size(&mut self, device: &mut dyn GpuDevice, size: Size) -> Result<(), GpuError> {
        if size == self.output {
            return Ok(());
        }
        tracing::debug!(%size, "chain output size changed");
        self.output = size;
        self.broadcast_output_size(device)?;
        self.rebuild_framebuffers(device)
    }

    /// Pushes the chain's output size to every stage.
    fn broadcast_output_size(&mut self, device: &mut dyn GpuDevice) -> Result<(), GpuError> {
        let size = self.output;
        self.camera.on_output_size_changed(device, size)?;
        self.user.on_output_size_changed(device, size)?;
        self.record.on_output_size_changed(device, size)
    }

    /// Swaps the user filters. The new group is initialized before the old
    /// one is destroyed, and only then sized along with the rest of the chain.
    pub fn replace_user(&mut self, device: &mut dyn GpuDevice, mut group: FilterGroup) -> Result<(), GpuError> {
        if self.initialized {
            if let Err(err) = group.init(device) {
                group.destroy(device);
                return Err(err);
            }
        }
        let mut old = std::mem::replace(&mut self.user, group);
        tracing::info!(
            from = old.name(),
            to = self.user.name(),
            filters = ?self.user.stage_names(),
            "filter chain replaced"
        );
        old.destroy(device);
        self.broadcast_output_size(device)
    }

    pub fn insert_filter(
        &mut self,
        device: &mut dyn GpuDevice,
        index: usize,
        stage: Box<dyn FilterStage>,
    ) -> Result<(), GpuError> {
        self.user.insert(device, index, stage)
    }

    pub fn remove_filter(&mut self, device: &mut dyn GpuDevice, index: usize) -> Result<(), GpuError> {
        self.user.remove(device, index)
    }

    /// Binds a camera source, replacing the external texture.
    pub fn bind_camera(&mut self, device: &mut dyn GpuDevice, feed: Arc<dyn CameraFeed>) -> Result<(), GpuError> {
        if let Some(previous) = self.source.take() {
            device.destroy_texture(previous.texture);
        }
        let format = feed.format();
        let size = feed.dimensions();
        let texture = device.create_texture(&TextureDesc {
            label: "camera".to_string(),
            size,
            usage: TextureUsage::External(format),
        })?;
        if let Err(err) = self
            .camera
            .set_source(device, format, size, feed.orientation())
        {
            device.destroy_texture(texture);
            return Err(err);
        }
        tracing::info!(%size, ?format, orientation = ?feed.orientation(), "camera bound");
        self.source = Some(BoundCamera {
            feed,
            texture,
            uploaded: None,
            warned: false,
        });
        Ok(())
    }

    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        self.release_framebuffers(device);
        if let Some(source) = self.source.take() {
            device.destroy_texture(source.texture);
        }
        self.camera.destroy(device);
        self.user.destroy(device);
        self.record.destroy(device);
        self.initialized = false;
    }

    /// Runs every stage for one frame. The record stage draws into the
    /// binding that was current on entry; it is restored even on failure.
    pub fn draw(&mut self, ctx: &mut DrawContext<'_>) -> Result<(), GpuError> {
        let Some(source) = self.source.as_mut() else {
            return Ok(());
        };
        source.refresh(ctx.render.device())?;
        let camera_texture = source.texture;

        let outer_framebuffer = ctx.render.framebuffer();
        let outer_viewport = ctx.render.viewport();
        let result = self.draw_stages(ctx, camera_texture, outer_framebuffer, outer_viewport);
        let restored = ctx.render.bind_framebuffer(outer_framebuffer);
        ctx.render.set_viewport(outer_viewport);
        result.and(restored)
    }

    fn draw_stages(
        &mut self,
        ctx: &mut DrawContext<'_>,
        camera_texture: TextureId,
        outer_framebuffer: Option<TextureId>,
        outer_viewport: Viewport,
    ) -> Result<(), GpuError> {
        let Some(camera_output) = self.camera_output else {
            return Ok(());
        };
        let full = Viewport::full(self.output);

        ctx.render.bind_framebuffer(Some(camera_output))?;
        ctx.render.set_viewport(full);
        ctx.render.clear(TRANSPARENT)?;
        self.camera.on_draw(ctx, camera_texture)?;
        let mut last = camera_output;

        if let (false, Some(user_output)) = (self.user.is_empty(), self.user_output) {
            ctx.render.bind_framebuffer(Some(user_output))?;
            ctx.render.set_viewport(full);
            ctx.render.clear(TRANSPARENT)?;
            self.user.on_draw(ctx, last)?;
            last = user_output;
        }

        ctx.render.bind_framebuffer(outer_framebuffer)?;
        ctx.render.set_viewport(outer_viewport);
        self.record.on_draw(ctx, last)
    }

    fn release_framebuffers(&mut self, device: &mut dyn GpuDevice) {
        for texture in [self.camera_output.take(), self.user_output.take()]
            .into_iter()
            .flatten()
        {
            device.destroy_texture(texture);
        }
    }

    fn rebuild_framebuffers(&mut self, device: &mut dyn GpuDevice) -> Result<(), GpuError> {
        self.release_framebuffers(device);
        if !self.initialized || self.output.is_empty() {
            return Ok(());
        }
        let mut allocate = |label: &str| {
            device.create_texture(&TextureDesc {
                label: label.to_string(),
                size: self.output,
                usage: TextureUsage::RenderTarget,
            })
        };
        self.camera_output = Some(allocate("camera output")?);
        self.user_output = Some(allocate("filter output")?);
        Ok(())
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use camconfig::PixelFormat;
    use scheduler::FrameTiming;

    use super::*;
    use crate::camera::{CameraFrame, CameraOrientation, SlotFeed};
    use crate::context::RenderContext;
    use crate::filter::ShaderStage;
    use crate::gpu::{DisplayTarget, GpuOp, HeadlessDevice, HeadlessProbe};

    const SIZE: Size = Size::new(16, 8);

    fn setup() -> (FilterChain, RenderContext, HeadlessProbe, Arc<SlotFeed>) {
        let (device, probe) = HeadlessDevice::new();
        let mut render = RenderContext::new(Box::new(device));
        render
            .attach_display(&DisplayTarget::Offscreen, SIZE)
            .unwrap();
        let mut chain = FilterChain::new();
        chain.init(render.device()).unwrap();
        chain.set_output_size(render.device(), SIZE).unwrap();
        let feed = Arc::new(SlotFeed::new(
            PixelFormat::Rgba,
            Size::new(4, 4),
            CameraOrientation::default(),
        ));
        chain.bind_camera(render.device(), feed.clone()).unwrap();
        (chain, render, probe, feed)
    }

    fn draw(chain: &mut FilterChain, render: &mut RenderContext) {
        let mut ctx = DrawContext {
            render,
            timing: FrameTiming::default(),
            recording: None,
        };
        chain.draw(&mut ctx).unwrap();
    }

    fn drawn_labels(probe: &HeadlessProbe) -> Vec<String> {
        probe
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                GpuOp::Draw { label, .. } => Some(label),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn empty_user_group_skips_straight_to_record() {
        let (mut chain, mut render, probe, _feed) = setup();
        probe.clear_ops();
        draw(&mut chain, &mut render);
        assert_eq!(drawn_labels(&probe), ["camera input", "record"]);
        assert_eq!(render.framebuffer(), None);
    }

    #[test]
    fn user_filters_run_between_camera_and_record() {
        let (mut chain, mut render, probe, _feed) = setup();
        let group = FilterGroup::with_stages(
            "look",
            vec![Box::new(ShaderStage::sepia()), Box::new(ShaderStage::invert())],
        );
        chain.replace_user(render.device(), group).unwrap();
        probe.clear_ops();
        draw(&mut chain, &mut render);
        assert_eq!(
            drawn_labels(&probe),
            ["camera input", "sepia", "invert", "record"]
        );
    }

    #[test]
    fn replacement_initializes_new_before_destroying_old() {
        let (mut chain, mut render, probe, _feed) = setup();
        chain
            .replace_user(
                render.device(),
                FilterGroup::with_stages("old", vec![Box::new(ShaderStage::grayscale())]),
            )
            .unwrap();
        probe.clear_ops();
        chain
            .replace_user(
                render.device(),
                FilterGroup::with_stages("new", vec![Box::new(ShaderStage::sepia())]),
            )
            .unwrap();

        let ops = probe.ops();
        let created = ops
            .iter()
            .position(|op| matches!(op, GpuOp::CreateProgram { label, .. } if label == "sepia"))
            .unwrap();
        let destroyed = ops
            .iter()
            .position(|op| matches!(op, GpuOp::DestroyProgram(_)))
            .unwrap();
        assert!(created < destroyed);
        assert_eq!(chain.user().stage_names(), ["sepia"]);
    }

    #[test]
    fn replacement_keeps_every_stage_at_the_output_size() {
        let (mut chain, mut render, _ops, _feed) = setup();
        let stale = Size::new(2, 2);
        chain.camera.on_output_size_changed(render.device(), stale).unwrap();
        chain.record.on_output_size_changed(render.device(), stale).unwrap();
        chain
            .replace_user(
                render.device(),
                FilterGroup::with_stages("look", vec![Box::new(ShaderStage::sepia())]),
            )
            .unwrap();
        assert_eq!(chain.camera.output_size(), SIZE);
        assert_eq!(chain.record.output_size(), SIZE);
        assert_eq!(chain.output_size(), SIZE);
    }

    #[test]
    fn uploads_each_camera_frame_once() {
        let (mut chain, mut render, probe, feed) = setup();
        feed.slot().publish(CameraFrame::new(
            Size::new(4, 4),
            PixelFormat::Rgba,
            vec![0u8; 64],
            7,
        ));
        probe.clear_ops();
        draw(&mut chain, &mut render);
        draw(&mut chain, &mut render);
        let uploads = probe
            .ops()
            .iter()
            .filter(|op| matches!(op, GpuOp::UploadTexture { bytes: 64, .. }))
            .count();
        assert_eq!(uploads, 1);
    }

    #[test]
    fn mismatched_frames_are_skipped() {
        let (mut chain, mut render, probe, feed) = setup();
        feed.slot().publish(CameraFrame::new(
            Size::new(4, 4),
            PixelFormat::Rgba,
            vec![0u8; 10],
            1,
        ));
        probe.clear_ops();
        draw(&mut chain, &mut render);
        assert!(!probe
            .ops()
            .iter()
            .any(|op| matches!(op, GpuOp::UploadTexture { .. })));
        assert_eq!(drawn_labels(&probe), ["camera input", "record"]);
    }

    #[test]
    fn destroy_releases_camera_texture_and_framebuffers() {
        let (mut chain, mut render, probe, _feed) = setup();
        probe.clear_ops();
        chain.destroy(render.device());
        let destroyed = probe
            .ops()
            .iter()
            .filter(|op| matches!(op, GpuOp::DestroyTexture(_)))
            .count();
        assert_eq!(destroyed, 3);
        assert!(!chain.has_camera());
    }
}
