use bytemuck::{Pod, Zeroable};

use crate::types::Size;

/// Texture coordinates for the four quad corners in strip order
/// (bottom-left, bottom-right, top-left, top-right). `v` grows downwards, so
/// the identity mapping samples row 0 at the top of the target.
pub const IDENTITY_TEX_COORDS: [f32; 8] = [0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0];

pub const IDENTITY_TRANSFORM: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Parameter block shared by the vertex and fragment stage of every filter
/// program. The layout must match `FilterParams` in `compile.rs`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct FilterUniforms {
    /// Output width/height followed by input width/height.
    pub resolution: [f32; 4],
    pub tex_coords: [[f32; 4]; 2],
    pub transform: [[f32; 4]; 4],
    pub time: f32,
    pub time_delta: f32,
    pub frame: i32,
    pub intensity: f32,
}

impl FilterUniforms {
    pub fn new(output: Size, input: Size) -> Self {
        let mut uniforms = Self {
            resolution: [0.0; 4],
            tex_coords: [[0.0; 4]; 2],
            transform: IDENTITY_TRANSFORM,
            time: 0.0,
            time_delta: 0.0,
            frame: 0,
            intensity: 1.0,
        };
        uniforms.set_sizes(output, input);
        uniforms.set_tex_coords(&IDENTITY_TEX_COORDS);
        uniforms
    }

    pub fn set_sizes(&mut self, output: Size, input: Size) {
        self.resolution = [
            output.width as f32,
            output.height as f32,
            input.width as f32,
            input.height as f32,
        ];
    }

    pub fn set_tex_coords(&mut self, coords: &[f32; 8]) {
        self.tex_coords = [
            [coords[0], coords[1], coords[2], coords[3]],
            [coords[4], coords[5], coords[6], coords[7]],
        ];
    }

    pub fn set_timing(&mut self, timing: &scheduler::FrameTiming) {
        self.time = timing.elapsed_secs;
        self.time_delta = timing.interval_secs();
        self.frame = i32::try_from(timing.frame_index).unwrap_or(i32::MAX);
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}
