use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use camconfig::PixelFormat;

use crate::encoder::{FrameSink, VideoFrame};
use crate::error::{GpuError, PresentError};
use crate::types::{GpuPowerPreference, Size, Viewport};

use super::pipeline::{input_entries, FilterProgram, PipelineLayouts, UniformRing};
use super::readback;
use super::{
    DisplayTarget, DrawCall, GpuDevice, ProgramDesc, ProgramId, SurfaceId, TextureDesc,
    TextureId, TextureUsage,
};

/// Draw slots available between two submissions.
const UNIFORM_RING_CAPACITY: u64 = 256;

const OFFSCREEN_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WgpuOptions {
    pub power: GpuPowerPreference,
    /// Present with FIFO when true, otherwise prefer mailbox or immediate.
    pub vsync: bool,
}

impl Default for WgpuOptions {
    fn default() -> Self {
        Self {
            power: GpuPowerPreference::Low,
            vsync: true,
        }
    }
}

enum Backing {
    Window {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        frame: Option<wgpu::SurfaceTexture>,
        /// Acquisition failure reported by the next swap.
        pending: Option<PresentError>,
    },
    Offscreen {
        texture: wgpu::Texture,
    },
    Encoder {
        texture: wgpu::Texture,
        staging: wgpu::Buffer,
        sink: Box<dyn FrameSink>,
    },
}

struct SurfaceEntry {
    backing: Backing,
    size: Size,
    format: wgpu::TextureFormat,
    presentation_time: u64,
}

struct TextureEntry {
    desc: TextureDesc,
    planes: Vec<Plane>,
}

struct Plane {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    size: Size,
}

struct Target {
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
    size: Size,
}

/// [`GpuDevice`] backed by wgpu. One command encoder collects every clear
/// and draw until a swap submits it.
pub struct WgpuDevice {
    instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    options: WgpuOptions,
    backend: String,
    layouts: PipelineLayouts,
    uniforms: UniformRing,
    encoder: Option<wgpu::CommandEncoder>,
    surfaces: HashMap<SurfaceId, SurfaceEntry>,
    programs: HashMap<ProgramId, FilterProgram>,
    textures: HashMap<TextureId, TextureEntry>,
    next_id: u32,
    current: Option<SurfaceId>,
    framebuffer: Option<TextureId>,
    viewport: Viewport,
}

impl WgpuDevice {
    pub fn new(options: WgpuOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let power_preference = match options.power {
            GpuPowerPreference::Low => wgpu::PowerPreference::LowPower,
            GpuPowerPreference::High => wgpu::PowerPreference::HighPerformance,
        };
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .context("failed to find a suitable GPU adapter")?;

        let info = adapter.get_info();
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "selected GPU adapter"
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("camfx device"),
            required_features: wgpu::Features::empty(),
            required_limits: adapter.limits(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .context("failed to create GPU device")?;
        device.on_uncaptured_error(Box::new(|err| {
            tracing::error!(%err, "uncaptured GPU error");
        }));

        let layouts = PipelineLayouts::new(&device).context("failed to build filter layouts")?;
        let uniforms = UniformRing::new(&device, &layouts, UNIFORM_RING_CAPACITY);

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            options,
            backend: format!("wgpu/{:?}", info.backend),
            layouts,
            uniforms,
            encoder: None,
            surfaces: HashMap::new(),
            programs: HashMap::new(),
            textures: HashMap::new(),
            next_id: 1,
            current: None,
            framebuffer: None,
            viewport: Viewport::default(),
        })
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn check_size(&self, size: Size) -> Result<(), GpuError> {
        let max = self.device.limits().max_texture_dimension_2d;
        if size.is_empty() || size.width > max || size.height > max {
            return Err(GpuError::Allocation(format!(
                "size {size} outside 1..={max} per side"
            )));
        }
        Ok(())
    }

    fn create_target_texture(
        &self,
        label: &str,
        size: Size,
        usage: wgpu::TextureUsages,
    ) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: extent(size),
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: OFFSCREEN_FORMAT,
            usage,
            view_formats: &[],
        })
    }

    fn present_mode(&self, caps: &wgpu::SurfaceCapabilities) -> wgpu::PresentMode {
        let find = |wanted: wgpu::PresentMode| {
            caps.present_modes
                .iter()
                .copied()
                .find(|mode| *mode == wanted)
        };
        let fifo = find(wgpu::PresentMode::Fifo).unwrap_or(wgpu::PresentMode::AutoVsync);
        if self.options.vsync {
            fifo
        } else {
            find(wgpu::PresentMode::Mailbox)
                .or_else(|| find(wgpu::PresentMode::Immediate))
                .unwrap_or(fifo)
        }
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        let device = &self.device;
        self.encoder.get_or_insert_with(|| {
            device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("camfx frame encoder"),
            })
        })
    }

    /// Submits everything recorded so far.
    fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        self.uniforms.rewind();
    }

    /// Resolves where the next clear or draw lands. `None` means the
    /// current window could not hand out an image this frame.
    fn target(&mut self) -> Result<Option<Target>, GpuError> {
        if let Some(texture) = self.framebuffer {
            let entry = self.textures.get(&texture).ok_or(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.raw(),
            })?;
            let plane = entry.planes.first().ok_or(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.raw(),
            })?;
            return Ok(Some(Target {
                view: plane.view.clone(),
                format: plane.format,
                size: plane.size,
            }));
        }

        let surface = self.current.ok_or(GpuError::NoCurrentSurface)?;
        let entry = self
            .surfaces
            .get_mut(&surface)
            .ok_or(GpuError::NoCurrentSurface)?;
        let (size, format) = (entry.size, entry.format);
        let view = match &mut entry.backing {
            Backing::Window {
                surface,
                config,
                frame,
                pending,
            } => {
                if pending.is_some() {
                    return Ok(None);
                }
                if frame.is_none() {
                    match surface.get_current_texture() {
                        Ok(acquired) => *frame = Some(acquired),
                        Err(err) => {
                            tracing::debug!(%err, "failed to acquire surface image");
                            if matches!(err, wgpu::SurfaceError::Outdated) {
                                surface.configure(&self.device, config);
                            }
                            *pending = Some(map_surface_error(err));
                            return Ok(None);
                        }
                    }
                }
                match frame.as_ref() {
                    Some(frame) => frame
                        .texture
                        .create_view(&wgpu::TextureViewDescriptor::default()),
                    None => return Ok(None),
                }
            }
            Backing::Offscreen { texture } | Backing::Encoder { texture, .. } => {
                texture.create_view(&wgpu::TextureViewDescriptor::default())
            }
        };
        Ok(Some(Target { view, format, size }))
    }

    fn clamped_viewport(&self, size: Size) -> Viewport {
        let x = self.viewport.x.min(size.width);
        let y = self.viewport.y.min(size.height);
        Viewport {
            x,
            y,
            width: self.viewport.width.min(size.width - x),
            height: self.viewport.height.min(size.height - y),
        }
    }
}

fn map_surface_error(err: wgpu::SurfaceError) -> PresentError {
    match err {
        wgpu::SurfaceError::Outdated => PresentError::Outdated,
        wgpu::SurfaceError::Timeout => PresentError::Timeout,
        wgpu::SurfaceError::Lost | wgpu::SurfaceError::OutOfMemory => PresentError::Lost,
        other => {
            tracing::warn!(%other, "unexpected surface error");
            PresentError::Lost
        }
    }
}

fn extent(size: Size) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: 1,
    }
}

/// Per-plane format, size and bytes per pixel for a texture usage.
fn plane_layout(usage: TextureUsage, size: Size) -> Vec<(wgpu::TextureFormat, Size, u32)> {
    match usage {
        TextureUsage::External(PixelFormat::Nv12) => vec![
            (wgpu::TextureFormat::R8Unorm, size, 1),
            (
                wgpu::TextureFormat::Rg8Unorm,
                Size::new(size.width / 2, size.height / 2),
                2,
            ),
        ],
        TextureUsage::External(PixelFormat::Bgra) => {
            vec![(wgpu::TextureFormat::Bgra8Unorm, size, 4)]
        }
        TextureUsage::External(PixelFormat::Rgba)
        | TextureUsage::Sampled
        | TextureUsage::RenderTarget => vec![(OFFSCREEN_FORMAT, size, 4)],
    }
}

impl GpuDevice for WgpuDevice {
    fn backend_name(&self) -> &str {
        &self.backend
    }

    fn create_window_surface(
        &mut self,
        target: &DisplayTarget,
        size: Size,
    ) -> Result<SurfaceId, GpuError> {
        self.check_size(size)?;
        let id = SurfaceId::from_raw(self.allocate_id());
        let entry = match target {
            DisplayTarget::Window(window) => {
                let surface = self
                    .instance
                    .create_surface(Arc::clone(window))
                    .map_err(|err| GpuError::SurfaceCreation(err.to_string()))?;
                let caps = surface.get_capabilities(&self.adapter);
                let format = caps
                    .formats
                    .iter()
                    .copied()
                    .find(|format| !format.is_srgb())
                    .or_else(|| caps.formats.first().copied())
                    .ok_or_else(|| {
                        GpuError::SurfaceCreation("adapter cannot present to this window".into())
                    })?;
                let config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                    format,
                    width: size.width,
                    height: size.height,
                    present_mode: self.present_mode(&caps),
                    alpha_mode: caps
                        .alpha_modes
                        .first()
                        .copied()
                        .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                    view_formats: vec![],
                    desired_maximum_frame_latency: 2,
                };
                surface.configure(&self.device, &config);
                tracing::debug!(
                    ?format,
                    present_mode = ?config.present_mode,
                    %size,
                    "configured window surface"
                );
                SurfaceEntry {
                    backing: Backing::Window {
                        surface,
                        config,
                        frame: None,
                        pending: None,
                    },
                    size,
                    format,
                    presentation_time: 0,
                }
            }
            DisplayTarget::Offscreen => SurfaceEntry {
                backing: Backing::Offscreen {
                    texture: self.create_target_texture(
                        "offscreen display",
                        size,
                        wgpu::TextureUsages::RENDER_ATTACHMENT,
                    ),
                },
                size,
                format: OFFSCREEN_FORMAT,
                presentation_time: 0,
            },
        };
        self.surfaces.insert(id, entry);
        Ok(id)
    }

    fn create_encoder_surface(
        &mut self,
        size: Size,
        sink: Box<dyn FrameSink>,
    ) -> Result<SurfaceId, GpuError> {
        self.check_size(size)?;
        let texture = self.create_target_texture(
            "encoder surface",
            size,
            wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
        );
        let staging = readback::create_staging_buffer(&self.device, size);
        let id = SurfaceId::from_raw(self.allocate_id());
        self.surfaces.insert(
            id,
            SurfaceEntry {
                backing: Backing::Encoder {
                    texture,
                    staging,
                    sink,
                },
                size,
                format: OFFSCREEN_FORMAT,
                presentation_time: 0,
            },
        );
        Ok(id)
    }

    fn resize_surface(&mut self, surface: SurfaceId, size: Size) -> Result<(), GpuError> {
        self.check_size(size)?;
        let offscreen = self
            .surfaces
            .get(&surface)
            .is_some_and(|entry| !matches!(entry.backing, Backing::Window { .. }));
        let replacement = offscreen.then(|| {
            self.create_target_texture(
                "resized surface",
                size,
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            )
        });
        let entry = self.surfaces.get_mut(&surface).ok_or(GpuError::UnknownHandle {
            kind: "surface",
            id: surface.raw(),
        })?;
        entry.size = size;
        match &mut entry.backing {
            Backing::Window {
                surface,
                config,
                frame,
                pending,
            } => {
                // Dropping an unpresented image returns it to the swapchain.
                *frame = None;
                *pending = None;
                config.width = size.width;
                config.height = size.height;
                surface.configure(&self.device, config);
            }
            Backing::Offscreen { texture } => {
                if let Some(replacement) = replacement {
                    *texture = replacement;
                }
            }
            Backing::Encoder {
                texture, staging, ..
            } => {
                if let Some(replacement) = replacement {
                    *texture = replacement;
                }
                *staging = readback::create_staging_buffer(&self.device, size);
            }
        }
        Ok(())
    }

    fn release_surface(&mut self, surface: SurfaceId) {
        // Pending work may still target the surface.
        self.flush();
        if self.surfaces.remove(&surface).is_some() && self.current == Some(surface) {
            self.current = None;
        }
    }

    fn make_current(&mut self, surface: Option<SurfaceId>) -> Result<(), GpuError> {
        if let Some(id) = surface {
            if !self.surfaces.contains_key(&id) {
                return Err(GpuError::UnknownHandle {
                    kind: "surface",
                    id: id.raw(),
                });
            }
        }
        self.current = surface;
        Ok(())
    }

    fn bind_framebuffer(&mut self, target: Option<TextureId>) -> Result<(), GpuError> {
        if let Some(texture) = target {
            let entry = self.textures.get(&texture).ok_or(GpuError::UnknownHandle {
                kind: "texture",
                id: texture.raw(),
            })?;
            if entry.desc.usage != TextureUsage::RenderTarget {
                return Err(GpuError::Device(format!(
                    "texture '{}' is not a render target",
                    entry.desc.label
                )));
            }
        }
        self.framebuffer = target;
        Ok(())
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    fn clear(&mut self, color: [f32; 4]) -> Result<(), GpuError> {
        let Some(target) = self.target()? else {
            return Ok(());
        };
        let encoder = self.encoder();
        let _pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("clear pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(wgpu::Color {
                        r: f64::from(color[0]),
                        g: f64::from(color[1]),
                        b: f64::from(color[2]),
                        a: f64::from(color[3]),
                    }),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        Ok(())
    }

    fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramId, GpuError> {
        let program = FilterProgram::new(&self.device, &self.layouts, desc)?;
        let id = ProgramId::from_raw(self.allocate_id());
        tracing::debug!(label = %desc.label, id = id.raw(), "compiled filter program");
        self.programs.insert(id, program);
        Ok(id)
    }

    fn destroy_program(&mut self, program: ProgramId) {
        self.programs.remove(&program);
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> Result<TextureId, GpuError> {
        self.check_size(desc.size)?;
        if desc.usage == TextureUsage::External(PixelFormat::Nv12)
            && (desc.size.width % 2 != 0 || desc.size.height % 2 != 0)
        {
            return Err(GpuError::Allocation(format!(
                "NV12 texture '{}' needs even dimensions, got {}",
                desc.label, desc.size
            )));
        }
        let usage = match desc.usage {
            TextureUsage::RenderTarget => {
                wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::TEXTURE_BINDING
            }
            TextureUsage::Sampled | TextureUsage::External(_) => {
                wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST
            }
        };
        let planes = plane_layout(desc.usage, desc.size)
            .into_iter()
            .map(|(format, size, _)| {
                let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&desc.label),
                    size: extent(size),
                    mip_level_count: 1,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format,
                    usage,
                    view_formats: &[],
                });
                let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
                Plane {
                    texture,
                    view,
                    format,
                    size,
                }
            })
            .collect();
        let id = TextureId::from_raw(self.allocate_id());
        self.textures.insert(
            id,
            TextureEntry {
                desc: desc.clone(),
                planes,
            },
        );
        Ok(id)
    }

    fn upload_texture(&mut self, texture: TextureId, data: &[u8]) -> Result<(), GpuError> {
        let entry = self.textures.get(&texture).ok_or(GpuError::UnknownHandle {
            kind: "texture",
            id: texture.raw(),
        })?;
        let expected = super::upload_len(entry.desc.usage, entry.desc.size);
        if data.len() != expected {
            return Err(GpuError::UploadSize {
                expected,
                actual: data.len(),
            });
        }
        let mut offset = 0usize;
        for (plane, (_, size, bytes_per_pixel)) in entry
            .planes
            .iter()
            .zip(plane_layout(entry.desc.usage, entry.desc.size))
        {
            let len = size.width as usize * size.height as usize * bytes_per_pixel as usize;
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture: &plane.texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                },
                &data[offset..offset + len],
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(size.width * bytes_per_pixel),
                    rows_per_image: Some(size.height),
                },
                extent(size),
            );
            offset += len;
        }
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureId) {
        if self.framebuffer == Some(texture) {
            self.framebuffer = None;
        }
        self.textures.remove(&texture);
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> Result<(), GpuError> {
        let Some(target) = self.target()? else {
            return Ok(());
        };

        let mut views = Vec::new();
        {
            let program = self.programs.get(&call.program).ok_or(GpuError::UnknownHandle {
                kind: "program",
                id: call.program.raw(),
            })?;
            if call.inputs.len() != program.inputs.len() {
                return Err(GpuError::Program {
                    label: program.label.clone(),
                    reason: format!(
                        "expects {} inputs, got {}",
                        program.inputs.len(),
                        call.inputs.len()
                    ),
                });
            }
            for texture in call.inputs {
                let entry = self.textures.get(texture).ok_or(GpuError::UnknownHandle {
                    kind: "texture",
                    id: texture.raw(),
                })?;
                views.extend(entry.planes.iter().map(|plane| plane.view.clone()));
            }
            if views.len() as u32 != program.plane_count() {
                return Err(GpuError::Program {
                    label: program.label.clone(),
                    reason: "input texture layout does not match the program".into(),
                });
            }
        }

        if self.uniforms.is_full() {
            self.flush();
        }
        let offset = self
            .uniforms
            .push(&self.queue, &call.uniforms)
            .ok_or_else(|| GpuError::Device("uniform ring exhausted".into()))?;

        let program = self
            .programs
            .get_mut(&call.program)
            .ok_or(GpuError::UnknownHandle {
                kind: "program",
                id: call.program.raw(),
            })?;
        let pipeline = program.pipeline_for(&self.device, &self.layouts, target.format);
        let input_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("filter inputs"),
            layout: program.input_layout(),
            entries: &input_entries(&self.layouts.sampler, &views),
        });

        let viewport = self.clamped_viewport(target.size);
        let uniform_group = self.uniforms.bind_group().clone();
        let encoder = self.encoder();
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("filter pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &target.view,
                depth_slice: None,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            occlusion_query_set: None,
            timestamp_writes: None,
        });
        pass.set_viewport(
            viewport.x as f32,
            viewport.y as f32,
            viewport.width as f32,
            viewport.height as f32,
            0.0,
            1.0,
        );
        pass.set_pipeline(&pipeline);
        pass.set_bind_group(0, &uniform_group, &[offset]);
        pass.set_bind_group(1, &input_group, &[]);
        pass.draw(0..4, 0..1);
        Ok(())
    }

    fn set_presentation_time(&mut self, surface: SurfaceId, nanos: u64) {
        if let Some(entry) = self.surfaces.get_mut(&surface) {
            entry.presentation_time = nanos;
        }
    }

    fn swap_buffers(&mut self, surface: SurfaceId) -> Result<(), PresentError> {
        if !self.surfaces.contains_key(&surface) {
            return Err(GpuError::UnknownHandle {
                kind: "surface",
                id: surface.raw(),
            }
            .into());
        }

        if let Some(Backing::Encoder {
            texture, staging, ..
        }) = self.surfaces.get(&surface).map(|entry| &entry.backing)
        {
            let size = self.surfaces[&surface].size;
            let (texture, staging) = (texture.clone(), staging.clone());
            readback::encode_copy(self.encoder(), &texture, &staging, size);
        }
        self.flush();

        let Some(entry) = self.surfaces.get_mut(&surface) else {
            return Ok(());
        };
        match &mut entry.backing {
            Backing::Window {
                surface: window,
                config,
                frame,
                pending,
            } => {
                if let Some(err) = pending.take() {
                    return Err(err);
                }
                let image = match frame.take() {
                    Some(image) => image,
                    // Nothing was drawn this frame; present whatever the
                    // swapchain hands out to keep the cadence.
                    None => match window.get_current_texture() {
                        Ok(image) => image,
                        Err(err) => {
                            if matches!(err, wgpu::SurfaceError::Outdated) {
                                window.configure(&self.device, config);
                            }
                            return Err(map_surface_error(err));
                        }
                    },
                };
                image.present();
                Ok(())
            }
            Backing::Offscreen { .. } => Ok(()),
            Backing::Encoder { staging, sink, .. } => {
                let rgba = readback::read_rgba(&self.device, staging, entry.size)?;
                sink.submit(VideoFrame {
                    size: entry.size,
                    pts_nanos: entry.presentation_time,
                    rgba,
                })?;
                Ok(())
            }
        }
    }
}
