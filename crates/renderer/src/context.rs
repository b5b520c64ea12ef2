use std::collections::VecDeque;
use std::sync::Arc;

use crate::camera::CameraFeed;
use crate::error::{GpuError, PresentError};
use crate::filter::{FilterGroup, FilterStage};
use crate::gpu::{DisplayTarget, DrawCall, GpuDevice, SurfaceId, TextureId};
use crate::types::{Size, Viewport};

/// Mutation that must run on the render thread with the device current.
pub enum DeferredAction {
    ReplaceFilters(FilterGroup),
    InsertFilter {
        index: usize,
        stage: Box<dyn FilterStage>,
    },
    RemoveFilter {
        index: usize,
    },
    SetRecording(bool),
    BindCamera(Arc<dyn CameraFeed>),
}

impl DeferredAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReplaceFilters(_) => "replace-filters",
            Self::InsertFilter { .. } => "insert-filter",
            Self::RemoveFilter { .. } => "remove-filter",
            Self::SetRecording(_) => "set-recording",
            Self::BindCamera(_) => "bind-camera",
        }
    }
}

/// FIFO of mutations applied at the start of the next accepted frame.
#[derive(Default)]
pub struct DeferredQueue {
    actions: VecDeque<DeferredAction>,
}

impl DeferredQueue {
    pub fn push(&mut self, action: DeferredAction) {
        self.actions.push_back(action);
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn take_all(&mut self) -> VecDeque<DeferredAction> {
        std::mem::take(&mut self.actions)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplaySurface {
    pub id: SurfaceId,
    pub size: Size,
}

/// Owns the graphics device and mirrors its binding state so stages can
/// save and restore it around nested draws.
pub struct RenderContext {
    device: Box<dyn GpuDevice>,
    display: Option<DisplaySurface>,
    current: Option<SurfaceId>,
    framebuffer: Option<TextureId>,
    viewport: Viewport,
    deferred: DeferredQueue,
}

impl RenderContext {
    pub fn new(device: Box<dyn GpuDevice>) -> Self {
        Self {
            device,
            display: None,
            current: None,
            framebuffer: None,
            viewport: Viewport::default(),
            deferred: DeferredQueue::default(),
        }
    }

    pub fn device(&mut self) -> &mut dyn GpuDevice {
        self.device.as_mut()
    }

    pub fn display(&self) -> Option<DisplaySurface> {
        self.display
    }

    pub fn deferred(&mut self) -> &mut DeferredQueue {
        &mut self.deferred
    }

    /// Creates the display surface and makes it current. Any previous
    /// display surface is released first.
    pub fn attach_display(
        &mut self,
        target: &DisplayTarget,
        size: Size,
    ) -> Result<DisplaySurface, GpuError> {
        self.detach_display();
        let id = self.device.create_window_surface(target, size)?;
        let display = DisplaySurface { id, size };
        self.display = Some(display);
        self.make_current(Some(id))?;
        self.bind_framebuffer(None)?;
        self.set_viewport(Viewport::full(size));
        Ok(display)
    }

    pub fn resize_display(&mut self, size: Size) -> Result<(), GpuError> {
        let Some(display) = self.display.as_mut() else {
            return Ok(());
        };
        self.device.resize_surface(display.id, size)?;
        display.size = size;
        if self.framebuffer.is_none() && self.current == Some(display.id) {
            self.set_viewport(Viewport::full(size));
        }
        Ok(())
    }

    pub fn detach_display(&mut self) {
        if let Some(display) = self.display.take() {
            if self.current == Some(display.id) {
                self.current = None;
            }
            self.device.release_surface(display.id);
        }
    }

    pub fn current_surface(&self) -> Option<SurfaceId> {
        self.current
    }

    pub fn make_current(&mut self, surface: Option<SurfaceId>) -> Result<(), GpuError> {
        self.device.make_current(surface)?;
        self.current = surface;
        Ok(())
    }

    /// Makes the display surface current again, reporting whether it had
    /// to be repaired.
    pub fn ensure_display_current(&mut self) -> Result<bool, GpuError> {
        let Some(surface) = self.display.map(|display| display.id) else {
            return Ok(false);
        };
        if self.current == Some(surface) {
            return Ok(false);
        }
        tracing::error!(
            expected = surface.raw(),
            current = ?self.current.map(|id| id.raw()),
            "display surface was not current after the frame; restoring"
        );
        self.make_current(Some(surface))?;
        Ok(true)
    }

    pub fn framebuffer(&self) -> Option<TextureId> {
        self.framebuffer
    }

    pub fn bind_framebuffer(&mut self, target: Option<TextureId>) -> Result<(), GpuError> {
        self.device.bind_framebuffer(target)?;
        self.framebuffer = target;
        Ok(())
    }

    pub fn viewport(&self) -> Viewport {
        self.viewport
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.device.set_viewport(viewport);
        self.viewport = viewport;
    }

    pub fn clear(&mut self, color: [f32; 4]) -> Result<(), GpuError> {
        self.device.clear(color)
    }

    pub fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError> {
        self.device.draw(call)
    }

    pub fn set_presentation_time(&mut self, surface: SurfaceId, nanos: u64) {
        self.device.set_presentation_time(surface, nanos);
    }

    pub fn swap_buffers(&mut self, surface: SurfaceId) -> Result<(), PresentError> {
        self.device.swap_buffers(surface)
    }

    pub fn release_surface(&mut self, surface: SurfaceId) {
        if self.current == Some(surface) {
            self.current = None;
        }
        self.device.release_surface(surface);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuOp, HeadlessDevice};

    #[test]
    fn attach_makes_display_current_with_full_viewport() {
        let (device, probe) = HeadlessDevice::new();
        let mut ctx = RenderContext::new(Box::new(device));
        let display = ctx
            .attach_display(&DisplayTarget::Offscreen, Size::new(64, 32))
            .unwrap();
        assert_eq!(ctx.current_surface(), Some(display.id));
        assert_eq!(ctx.viewport(), Viewport::full(Size::new(64, 32)));
        assert!(probe
            .ops()
            .contains(&GpuOp::MakeCurrent(Some(display.id))));
    }

    #[test]
    fn ensure_display_current_repairs_binding() {
        let (device, _probe) = HeadlessDevice::new();
        let mut ctx = RenderContext::new(Box::new(device));
        let display = ctx
            .attach_display(&DisplayTarget::Offscreen, Size::new(8, 8))
            .unwrap();
        assert!(!ctx.ensure_display_current().unwrap());
        ctx.make_current(None).unwrap();
        assert!(ctx.ensure_display_current().unwrap());
        assert_eq!(ctx.current_surface(), Some(display.id));
    }

    #[test]
    fn deferred_queue_preserves_order() {
        let mut queue = DeferredQueue::default();
        queue.push(DeferredAction::SetRecording(true));
        queue.push(DeferredAction::RemoveFilter { index: 0 });
        queue.push(DeferredAction::SetRecording(false));
        let names: Vec<_> = queue.take_all().iter().map(DeferredAction::name).collect();
        assert_eq!(names, ["set-recording", "remove-filter", "set-recording"]);
        assert!(queue.is_empty());
    }
}
