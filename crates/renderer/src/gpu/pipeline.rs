use std::collections::HashMap;
use std::num::NonZeroU64;

use crate::compile::{compile_fragment_shader, compile_vertex_shader};
use crate::error::GpuError;

use super::uniforms::FilterUniforms;
use super::{InputKind, ProgramDesc};

/// Objects shared by every filter program.
pub(crate) struct PipelineLayouts {
    pub uniform_layout: wgpu::BindGroupLayout,
    pub vertex_module: wgpu::ShaderModule,
    pub sampler: wgpu::Sampler,
}

impl PipelineLayouts {
    pub fn new(device: &wgpu::Device) -> Result<Self, GpuError> {
        let uniform_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("filter uniform layout"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX_FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: true,
                    min_binding_size: NonZeroU64::new(uniform_block_size()),
                },
                count: None,
            }],
        });

        let vertex_module = with_validation(device, "filter quad vertex", || {
            compile_vertex_shader(device)
        })?;

        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("filter sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });

        Ok(Self {
            uniform_layout,
            vertex_module,
            sampler,
        })
    }
}

pub(crate) fn uniform_block_size() -> u64 {
    std::mem::size_of::<FilterUniforms>() as u64
}

/// A compiled filter: its fragment module plus one render pipeline per
/// target format it has been drawn into.
pub(crate) struct FilterProgram {
    pub label: String,
    pub inputs: Vec<InputKind>,
    fragment_module: wgpu::ShaderModule,
    input_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    pipelines: HashMap<wgpu::TextureFormat, wgpu::RenderPipeline>,
}

impl FilterProgram {
    pub fn new(
        device: &wgpu::Device,
        layouts: &PipelineLayouts,
        desc: &ProgramDesc,
    ) -> Result<Self, GpuError> {
        let fragment_module = with_validation(device, &desc.label, || {
            compile_fragment_shader(device, &desc.label, &desc.fragment, &desc.inputs)
        })?;

        let input_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("filter input layout"),
            entries: &input_layout_entries(&desc.inputs),
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("filter pipeline layout"),
            bind_group_layouts: &[&layouts.uniform_layout, &input_layout],
            push_constant_ranges: &[],
        });

        Ok(Self {
            label: desc.label.clone(),
            inputs: desc.inputs.clone(),
            fragment_module,
            input_layout,
            pipeline_layout,
            pipelines: HashMap::new(),
        })
    }

    pub fn input_layout(&self) -> &wgpu::BindGroupLayout {
        &self.input_layout
    }

    pub fn plane_count(&self) -> u32 {
        self.inputs.iter().map(InputKind::planes).sum()
    }

    pub fn pipeline_for(
        &mut self,
        device: &wgpu::Device,
        layouts: &PipelineLayouts,
        format: wgpu::TextureFormat,
    ) -> wgpu::RenderPipeline {
        if let Some(pipeline) = self.pipelines.get(&format) {
            return pipeline.clone();
        }
        tracing::debug!(label = %self.label, ?format, "building filter pipeline");
        let pipeline = device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(&self.label),
            layout: Some(&self.pipeline_layout),
            vertex: wgpu::VertexState {
                module: &layouts.vertex_module,
                entry_point: Some("main"),
                buffers: &[],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleStrip,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: None,
                polygon_mode: wgpu::PolygonMode::Fill,
                unclipped_depth: false,
                conservative: false,
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            fragment: Some(wgpu::FragmentState {
                module: &self.fragment_module,
                entry_point: Some("main"),
                targets: &[Some(wgpu::ColorTargetState {
                    format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }),
            multiview: None,
            cache: None,
        });
        self.pipelines.insert(format, pipeline.clone());
        pipeline
    }
}

/// Sampler first, then one texture binding per plane of each input.
fn input_layout_entries(inputs: &[InputKind]) -> Vec<wgpu::BindGroupLayoutEntry> {
    let mut entries = vec![wgpu::BindGroupLayoutEntry {
        binding: 0,
        visibility: wgpu::ShaderStages::FRAGMENT,
        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        count: None,
    }];
    let planes: u32 = inputs.iter().map(InputKind::planes).sum();
    for binding in 1..=planes {
        entries.push(wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            count: None,
        });
    }
    entries
}

pub(crate) fn input_entries<'a>(
    sampler: &'a wgpu::Sampler,
    views: &'a [wgpu::TextureView],
) -> Vec<wgpu::BindGroupEntry<'a>> {
    let mut entries = Vec::with_capacity(views.len() + 1);
    entries.push(wgpu::BindGroupEntry {
        binding: 0,
        resource: wgpu::BindingResource::Sampler(sampler),
    });
    for (index, view) in views.iter().enumerate() {
        entries.push(wgpu::BindGroupEntry {
            binding: index as u32 + 1,
            resource: wgpu::BindingResource::TextureView(view),
        });
    }
    entries
}

/// Runs `build` inside a validation error scope so a broken shader comes
/// back as an error instead of tripping the uncaptured error handler.
fn with_validation<T>(
    device: &wgpu::Device,
    label: &str,
    build: impl FnOnce() -> T,
) -> Result<T, GpuError> {
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = build();
    match pollster::block_on(device.pop_error_scope()) {
        None => Ok(value),
        Some(err) => Err(GpuError::Program {
            label: label.to_string(),
            reason: err.to_string(),
        }),
    }
}

/// Ring of uniform blocks addressed with dynamic offsets. Every draw in a
/// submission gets its own slot; the ring rewinds after each submit.
pub(crate) struct UniformRing {
    buffer: wgpu::Buffer,
    bind_group: wgpu::BindGroup,
    stride: u64,
    capacity: u64,
    cursor: u64,
}

impl UniformRing {
    pub fn new(
        device: &wgpu::Device,
        layouts: &PipelineLayouts,
        capacity: u64,
    ) -> Self {
        let align = u64::from(device.limits().min_uniform_buffer_offset_alignment);
        let stride = uniform_block_size().div_ceil(align) * align;
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("filter uniform ring"),
            size: stride * capacity,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("filter uniform bind group"),
            layout: &layouts.uniform_layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                    buffer: &buffer,
                    offset: 0,
                    size: NonZeroU64::new(uniform_block_size()),
                }),
            }],
        });
        Self {
            buffer,
            bind_group,
            stride,
            capacity,
            cursor: 0,
        }
    }

    pub fn is_full(&self) -> bool {
        self.cursor >= self.capacity
    }

    /// Writes `uniforms` into the next slot and returns its dynamic offset.
    pub fn push(&mut self, queue: &wgpu::Queue, uniforms: &FilterUniforms) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        let offset = self.cursor * self.stride;
        queue.write_buffer(&self.buffer, offset, uniforms.as_bytes());
        self.cursor += 1;
        u32::try_from(offset).ok()
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use camconfig::PixelFormat;

    use super::*;

    #[test]
    fn layout_reserves_a_binding_per_plane() {
        let entries =
            input_layout_entries(&[InputKind::External(PixelFormat::Nv12), InputKind::Texture2d]);
        let bindings: Vec<u32> = entries.iter().map(|entry| entry.binding).collect();
        assert_eq!(bindings, vec![0, 1, 2, 3]);
        assert!(matches!(entries[0].ty, wgpu::BindingType::Sampler(_)));
    }
}
