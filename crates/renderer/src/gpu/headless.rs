use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::encoder::{FrameSink, VideoFrame};
use crate::error::{GpuError, PresentError};
use crate::types::{Size, Viewport};

use super::{
    upload_len, DisplayTarget, DrawCall, GpuDevice, ProgramDesc, ProgramId, SurfaceId,
    TextureDesc, TextureId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceKind {
    Window,
    Offscreen,
    Encoder,
}

/// One call made against a [`HeadlessDevice`].
#[derive(Debug, Clone, PartialEq)]
pub enum GpuOp {
    CreateSurface {
        surface: SurfaceId,
        kind: SurfaceKind,
        size: Size,
    },
    ResizeSurface {
        surface: SurfaceId,
        size: Size,
    },
    ReleaseSurface(SurfaceId),
    MakeCurrent(Option<SurfaceId>),
    BindFramebuffer(Option<TextureId>),
    SetViewport(Viewport),
    Clear {
        surface: Option<SurfaceId>,
        framebuffer: Option<TextureId>,
    },
    CreateProgram {
        program: ProgramId,
        label: String,
    },
    DestroyProgram(ProgramId),
    CreateTexture {
        texture: TextureId,
        desc: TextureDesc,
    },
    UploadTexture {
        texture: TextureId,
        bytes: usize,
    },
    DestroyTexture(TextureId),
    Draw {
        program: ProgramId,
        label: String,
        inputs: Vec<TextureId>,
        surface: Option<SurfaceId>,
        framebuffer: Option<TextureId>,
        viewport: Viewport,
        frame: i32,
    },
    SetPresentationTime {
        surface: SurfaceId,
        nanos: u64,
    },
    Swap {
        surface: SurfaceId,
    },
}

#[derive(Debug, Default)]
struct Faults {
    reject_encoder_surfaces: bool,
    lose_next_swap: Option<SurfaceKind>,
}

#[derive(Debug)]
struct Shared {
    ops: Vec<GpuOp>,
    limit: usize,
    faults: Faults,
}

/// Test-side handle onto a [`HeadlessDevice`] living on the render thread.
#[derive(Debug, Clone)]
pub struct HeadlessProbe {
    shared: Arc<Mutex<Shared>>,
}

impl HeadlessProbe {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ops(&self) -> Vec<GpuOp> {
        self.lock().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.clear();
    }

    /// Makes every later encoder surface allocation fail.
    pub fn reject_encoder_surfaces(&self, reject: bool) {
        self.lock().faults.reject_encoder_surfaces = reject;
    }

    /// Reports the next swap of a surface of `kind` as lost.
    pub fn lose_next_swap(&self, kind: SurfaceKind) {
        self.lock().faults.lose_next_swap = Some(kind);
    }
}

struct HeadlessSurface {
    kind: SurfaceKind,
    size: Size,
    sink: Option<Box<dyn FrameSink>>,
    presentation_time: u64,
}

/// [`GpuDevice`] that validates handles and records calls without a GPU.
pub struct HeadlessDevice {
    next_id: u32,
    surfaces: HashMap<SurfaceId, HeadlessSurface>,
    programs: HashMap<ProgramId, String>,
    textures: HashMap<TextureId, TextureDesc>,
    current: Option<SurfaceId>,
    framebuffer: Option<TextureId>,
    viewport: Viewport,
    shared: Arc<Mutex<Shared>>,
}

impl HeadlessDevice {
    pub fn new() -> (Self, HeadlessProbe) {
        Self::with_log_limit(usize::MAX)
    }

    /// Keeps roughly the most recent `limit` operations.
    pub fn with_log_limit(limit: usize) -> (Self, HeadlessProbe) {
        let shared = Arc::new(Mutex::new(Shared {
            ops: Vec::new(),
            limit: limit.max(2),
            faults: Faults::default(),
        }));
        let device = Self {
            next_id: 1,
            surfaces: HashMap::new(),
            programs: HashMap::new(),
            textures: HashMap::new(),
            current: None,
            framebuffer: None,
            viewport: Viewport::default(),
            shared: Arc::clone(&shared),
        };
        (device, HeadlessProbe { shared })
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, op: GpuOp) {
        let mut shared = self.lock();
        if shared.ops.len() >= shared.limit {
            let half = shared.limit / 2;
            shared.ops.drain(..half);
        }
        shared.ops.push(op);
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn ensure_surface(&self, surface: SurfaceId) -> Result<(), GpuError> {
        if self.surfaces.contains_key(&surface) {
            Ok(())
        } else {
            Err(GpuError::UnknownHandle {
                kind: "surface",
                id: surface.raw(),
            })
        }
    }

    fn ensure_texture(&self, texture: TextureId) -> Result<&TextureDesc, GpuError> {
        self.textures.get(&texture).ok_or(GpuError::UnknownHandle {
            kind: "texture",
            id: texture.raw(),
        })
    }

    fn ensure_target(&self) -> Result<(), GpuError> {
        if self.framebuffer.is_none() && self.current.is_none() {
            return Err(GpuError::NoCurrentSurface);
        }
        Ok(())
    }

    fn insert_surface(
        &mut self,
        kind: SurfaceKind,
        size: Size,
        sink: Option<Box<dyn FrameSink>>,
    ) -> SurfaceId {
        let surface = SurfaceId::from_raw(self.allocate_id());
        self.surfaces.insert(
            surface,
            HeadlessSurface {
                kind,
                size,
                sink,
                presentation_time: 0,
            },
        );
        self.record(GpuOp::CreateSurface {
            surface,
            kind,
            size,
        });
        surface
    }
}

impl GpuDevice for HeadlessDevice {
    fn backend_name(&self) -> &str {
        "headless"
    }

    fn create_window_surface(
        &mut self,
        target: &DisplayTarget,
        size: Size,
    ) -> Result<SurfaceId, GpuError> {
        let kind = match target {
            DisplayTarget::Window(_) => SurfaceKind::Window,
            DisplayTarget::Offscreen => SurfaceKind::Offscreen,
        };
        Ok(self.insert_surface(kind, size, None))
    }

    fn create_encoder_surface(
        &mut self,
        size: Size,
        sink: Box<dyn FrameSink>,
    ) -> Result<SurfaceId, GpuError> {
        if self.lock().faults.reject_encoder_surfaces {
            return Err(GpuError::Allocation(format!(
                "encoder surface {size} rejected"
            )));
        }
        Ok(self.insert_surface(SurfaceKind::Encoder, size, Some(sink)))
    }

    fn resize_surface(&mut self, surface: SurfaceId, size: Size) -> Result<(), GpuError> {
        let entry = self.surfaces.get_mut(&surface).ok_or(GpuError::UnknownHandle {
            kind: "surface",
            id: surface.raw(),
        })?;
        entry.size = size;
        self.record(GpuOp::ResizeSurface { surface, size });
        Ok(())
    }

    fn release_surface(&mut self, surface: SurfaceId) {
        if self.surfaces.remove(&surface).is_some() {
            if self.current == Some(surface) {
                self.current = None;
            }
            self.record(GpuOp::ReleaseSurface(surface));
        }
    }

    fn make_current(&mut self, surface: Option<SurfaceId>) -> Result<(), GpuError> {
        if let Some(surface) = surface {
            self.ensure_surface(surface)?;
        }
        self.current = surface;
        self.record(GpuOp::MakeCurrent(surface));
        Ok(())
    }

    fn bind_framebuffer(&mut self, target: Option<TextureId>) -> Result<(), GpuError> {
        if let Some(texture) = target {
            self.ensure_texture(texture)?;
        }
        self.framebuffer = target;
        self.record(GpuOp::BindFramebuffer(target));
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
        self.record(GpuOp::SetViewport(viewport));
    }

    fn clear(&mut self, _color: [f32; 4]) -> Result<(), GpuError> {
        self.ensure_target()?;
        self.record(GpuOp::Clear {
            surface: self.current,
            framebuffer: self.framebuffer,
        });
        Ok(())
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, GpuError> {
        if !desc.fragment.contains("apply_filter") {
            return Err(GpuError::Program {
                label: desc.label.clone(),
                reason: "fragment does not define apply_filter".into(),
            });
        }
        let program = ProgramId::from_raw(self.allocate_id());
        self.programs.insert(program, desc.label.clone());
        self.record(GpuOp::CreateProgram {
            program,
            label: desc.label.clone(),
        });
        Ok(program)
    }

    fn destroy_program(&mut self, program: ProgramId) {
        if self.programs.remove(&program).is_some() {
            self.record(GpuOp::DestroyProgram(program));
        }
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, GpuError> {
        if desc.size.is_empty() {
            return Err(GpuError::Allocation(format!(
                "texture '{}' has empty size {}",
                desc.label, desc.size
            )));
        }
        let texture = TextureId::from_raw(self.allocate_id());
        self.textures.insert(texture, desc.clone());
        self.record(GpuOp::CreateTexture {
            texture,
            desc: desc.clone(),
        });
        Ok(texture)
    }

    fn upload_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), GpuError> {
        let desc = self.ensure_texture(texture)?;
        let expected = upload_len(desc.usage, desc.size);
        if data.len() != expected {
            return Err(GpuError::UploadSize {
                expected,
                actual: data.len(),
            });
        }
        self.record(GpuOp::UploadTexture {
            texture,
            bytes: data.len(),
        });
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.textures.remove(&texture).is_some() {
            if self.framebuffer == Some(texture) {
                self.framebuffer = None;
            }
            self.record(GpuOp::DestroyTexture(texture));
        }
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError> {
        self.ensure_target()?;
        let label = self
            .programs
            .get(&call.program)
            .cloned()
            .ok_or(GpuError::UnknownHandle {
                kind: "program",
                id: call.program.raw(),
            })?;
        for input in call.inputs {
            self.ensure_texture(*input)?;
        }
        self.record(GpuOp::Draw {
            program: call.program,
            label,
            inputs: call.inputs.to_vec(),
            surface: self.current,
            framebuffer: self.framebuffer,
            viewport: self.viewport,
            frame: call.uniforms.frame,
        });
        Ok(())
    }

    fn set_presentation_time(&mut self, surface: SurfaceId, nanos: u64) {
        if let Some(entry) = self.surfaces.get_mut(&surface) {
            entry.presentation_time = nanos;
            self.record(GpuOp::SetPresentationTime { surface, nanos });
        }
    }

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<(), PresentError> {
        let lost = {
            let kind = self
                .surfaces
                .get(&surface)
                .map(|entry| entry.kind)
                .ok_or(GpuError::UnknownHandle {
                    kind: "surface",
                    id: surface.raw(),
                })?;
            let mut shared = self.lock();
            if shared.faults.lose_next_swap == Some(kind) {
                shared.faults.lose_next_swap = None;
                true
            } else {
                false
            }
        };
        if lost {
            return Err(PresentError::Lost);
        }

        self.record(GpuOp::Swap { surface });
        if let Some(entry) = self.surfaces.get_mut(&surface) {
            if let Some(sink) = entry.sink.as_mut() {
                sink.submit(VideoFrame {
                    size: entry.size,
                    pts_nanos: entry.presentation_time,
                    rgba: vec![0; entry.size.rgba_len()],
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{FilterUniforms, InputKind, TextureUsage};

    fn program(device: &mut HeadlessDevice) -> ProgramId {
        device
            .create_program(&ProgramDesc {
                label: "copy".into(),
                fragment: "vec4 apply_filter(vec2 uv) { return sample_input0(uv); }".into(),
                inputs: vec![InputKind::Texture2d],
            })
            .unwrap()
    }

    #[test]
    fn draw_requires_a_target() {
        let (mut device, _probe) = HeadlessDevice::new();
        let program = program(&mut device);
        let err = device
            .draw(&DrawCall {
                program,
                inputs: &[],
                uniforms: FilterUniforms::new(Size::new(1, 1), Size::new(1, 1)),
            })
            .unwrap_err();
        assert!(matches!(err, GpuError::NoCurrentSurface));
    }

    #[test]
    fn upload_checks_length() {
        let (mut device, _probe) = HeadlessDevice::new();
        let texture = device
            .create_texture(&TextureDesc {
                label: "lut".into(),
                size: Size::new(2, 2),
                usage: TextureUsage::Sampled,
            })
            .unwrap();
        assert!(device.upload_texture(texture, &[0; 16]).is_ok());
        assert!(matches!(
            device.upload_texture(texture, &[0; 15]),
            Err(GpuError::UploadSize {
                expected: 16,
                actual: 15
            })
        ));
    }

    #[test]
    fn log_limit_discards_oldest_half() {
        let (mut device, probe) = HeadlessDevice::with_log_limit(4);
        for x in 0..5 {
            device.set_viewport(Viewport {
                x,
                ..Viewport::default()
            });
        }
        let ops = probe.ops();
        assert_eq!(ops.len(), 3);
        assert_eq!(
            ops[0],
            GpuOp::SetViewport(Viewport {
                x: 2,
                ..Viewport::default()
            })
        );
    }

    #[test]
    fn injected_loss_hits_only_matching_surface() {
        let (mut device, probe) = HeadlessDevice::new();
        let window = device
            .create_window_surface(&DisplayTarget::Offscreen, Size::new(8, 8))
            .unwrap();
        probe.lose_next_swap(SurfaceKind::Window);
        assert!(device.swap_buffers(window).is_ok());
        probe.lose_next_swap(SurfaceKind::Offscreen);
        assert!(matches!(device.swap_buffers(window), Err(PresentError::Lost)));
        assert!(device.swap_buffers(window).is_ok());
    }
}
