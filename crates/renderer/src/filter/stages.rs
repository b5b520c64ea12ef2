use std::path::{Path, PathBuf};

use camconfig::{FilterPreset, FilterSpec};

use crate::error::{FilterBuildError, GpuError};
use crate::gpu::{
    DrawCall, FilterUniforms, GpuDevice, InputKind, ProgramDesc, ProgramId, TextureDesc,
    TextureId, TextureUsage,
};
use crate::types::Size;

use super::{DrawContext, FilterGroup, FilterStage};

pub(crate) const PASSTHROUGH_BODY: &str = r"
vec4 apply_filter(vec2 uv) {
    return sample_input0(uv);
}
";

const GRAYSCALE_BODY: &str = r"
const vec3 LUMA = vec3(0.2125, 0.7154, 0.0721);

vec4 apply_filter(vec2 uv) {
    vec4 color = sample_input0(uv);
    vec3 gray = vec3(dot(color.rgb, LUMA));
    return vec4(mix(color.rgb, gray, filter_intensity), color.a);
}
";

const SEPIA_BODY: &str = r"
vec4 apply_filter(vec2 uv) {
    vec4 color = sample_input0(uv);
    vec3 sepia = vec3(
        dot(color.rgb, vec3(0.3588, 0.7044, 0.1368)),
        dot(color.rgb, vec3(0.2990, 0.5870, 0.1140)),
        dot(color.rgb, vec3(0.2392, 0.4696, 0.0912))
    );
    return vec4(mix(color.rgb, sepia, filter_intensity), color.a);
}
";

const INVERT_BODY: &str = r"
vec4 apply_filter(vec2 uv) {
    vec4 color = sample_input0(uv);
    return vec4(mix(color.rgb, 1.0 - color.rgb, filter_intensity), color.a);
}
";

/// Skin smoothing: a sparse blur of the blue channel drives a high-pass
/// mask that is sharpened, then blended back by luminance.
const SMOOTH_BODY: &str = r"
const vec2 OFFSETS[12] = vec2[12](
    vec2(5.0, -8.0), vec2(8.0, -5.0), vec2(8.0, 5.0), vec2(5.0, 8.0),
    vec2(-5.0, 8.0), vec2(-8.0, 5.0), vec2(-8.0, -5.0), vec2(-5.0, -8.0),
    vec2(0.0, -6.0), vec2(-6.0, 0.0), vec2(0.0, 6.0), vec2(4.0, -4.0)
);

float hard_light(float value) {
    return value <= 0.5 ? value * value * 2.0 : 1.0 - (1.0 - value) * (1.0 - value) * 2.0;
}

vec4 apply_filter(vec2 uv) {
    vec2 texel = 1.5 / max(filter_output_size, vec2(1.0));
    vec3 central = sample_input0(uv).rgb;

    float blurred = central.b * 20.0;
    for (int i = 0; i < 12; i++) {
        blurred += sample_input0(uv + OFFSETS[i] * texel).b;
    }
    blurred /= 32.0;

    float mask = central.b - blurred + 0.5;
    for (int i = 0; i < 5; i++) {
        mask = hard_light(mask);
    }

    const float gain = 1.065;
    vec3 smoothed = central * gain - vec3(mask) * (gain - 1.0);
    float luma = clamp(dot(smoothed, vec3(0.299, 0.587, 0.114)) - 0.3, 0.0, 1.0);
    smoothed = mix(central, smoothed, pow(luma, 0.3));
    smoothed = (smoothed - vec3(0.8)) * 1.06 + vec3(0.8);
    return vec4(mix(central, smoothed, filter_intensity), 1.0);
}
";

/// Colour lookup through a 4x4 grid of 64x64 tiles, blue selecting the tile.
const LOOKUP_BODY: &str = r"
vec4 apply_filter(vec2 uv) {
    vec4 color = sample_input0(uv);
    float blue = color.b * 15.0;

    vec2 quad1;
    quad1.y = floor(floor(blue) / 4.0);
    quad1.x = floor(blue) - quad1.y * 4.0;
    vec2 quad2;
    quad2.y = floor(ceil(blue) / 4.0);
    quad2.x = ceil(blue) - quad2.y * 4.0;

    vec2 span = vec2(0.25 - 1.0 / 64.0) * color.rg;
    vec2 pos1 = quad1 * 0.25 + 0.5 / 64.0 + span;
    vec2 pos2 = quad2 * 0.25 + 0.5 / 64.0 + span;

    vec4 mapped = mix(sample_input1(pos1), sample_input1(pos2), fract(blue));
    return mix(color, vec4(mapped.rgb, color.a), filter_intensity);
}
";

/// A program owned by a stage, compiled on `init`.
pub(crate) struct ProgramSlot {
    desc: ProgramDesc,
    program: Option<ProgramId>,
}

impl ProgramSlot {
    pub fn new(label: impl Into<String>, fragment: impl Into<String>, inputs: Vec<InputKind>) -> Self {
        Self {
            desc: ProgramDesc {
                label: label.into(),
                fragment: fragment.into(),
                inputs,
            },
            program: None,
        }
    }

    pub fn label(&self) -> &str {
        &self.desc.label
    }

    pub fn id(&self) -> Option<ProgramId> {
        self.program
    }

    pub fn init(&mut self, device: &mut dyn GpuDevice) -> Result<ProgramId, GpuError> {
        if let Some(program) = self.program {
            return Ok(program);
        }
        let program = device.create_program(&self.desc)?;
        self.program = Some(program);
        Ok(program)
    }

    /// Swaps the program inputs, recompiling if it was already built.
    pub fn set_inputs(
        &mut self,
        device: &mut dyn GpuDevice,
        inputs: Vec<InputKind>,
    ) -> Result<(), GpuError> {
        if self.desc.inputs == inputs {
            return Ok(());
        }
        self.desc.inputs = inputs;
        if self.program.is_some() {
            self.destroy(device);
            self.init(device)?;
        }
        Ok(())
    }

    pub fn destroy(&mut self, device: &mut dyn GpuDevice) {
        if let Some(program) = self.program.take() {
            device.destroy_program(program);
        }
    }
}

/// Single input GLSL filter.
pub struct ShaderStage {
    name: String,
    program: ProgramSlot,
    output: Size,
    intensity: f32,
}

impl ShaderStage {
    /// `body` must define `vec4 apply_filter(vec2 uv)` and may call
    /// `sample_input0(uv)`.
    pub fn new(name: impl Into<String>, body: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            program: ProgramSlot::new(name.clone(), body, vec![InputKind::Texture2d]),
            name,
            output: Size::default(),
            intensity: 1.0,
        }
    }

    pub fn passthrough() -> Self {
        Self::new("passthrough", PASSTHROUGH_BODY)
    }

    pub fn grayscale() -> Self {
        Self::new("grayscale", GRAYSCALE_BODY)
    }

    pub fn sepia() -> Self {
        Self::new("sepia", SEPIA_BODY)
    }

    pub fn invert() -> Self {
        Self::new("invert", INVERT_BODY)
    }

    pub fn smooth(strength: f32) -> Self {
        Self::new("smooth", SMOOTH_BODY).with_intensity(strength)
    }

    /// Reads a filter body from disk.
    pub fn from_file(path: &Path) -> Result<Self, FilterBuildError> {
        let body = std::fs::read_to_string(path).map_err(|source| FilterBuildError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shader".to_string());
        Ok(Self::new(name, body))
    }

    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = intensity.clamp(0.0, 1.0);
        self
    }

    pub fn intensity(&self) -> f32 {
        self.intensity
    }
}

impl FilterStage for ShaderStage {
    fn name(&self) -> &str {
        &self.name
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
        let mut uniforms = FilterUniforms::new(self.output, self.output);
        uniforms.set_timing(&ctx.timing);
        uniforms.intensity = self.intensity;
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

/// Two-input filter mapping colours through a lookup table image.
pub struct LookupStage {
    name: String,
    program: ProgramSlot,
    table_size: Size,
    table_rgba: Vec<u8>,
    table: Option<TextureId>,
    output: Size,
    intensity: f32,
}

impl LookupStage {
    pub fn new(table_size: Size, table_rgba: Vec<u8>, intensity: f32) -> Self {
        Self {
            name: "lookup".to_string(),
            program: ProgramSlot::new(
                "lookup",
                LOOKUP_BODY,
                vec![InputKind::Texture2d, InputKind::Texture2d],
            ),
            table_size,
            table_rgba,
            table: None,
            output: Size::default(),
            intensity: intensity.clamp(0.0, 1.0),
        }
    }

    /// Decodes the lookup table image. Done off the render thread.
    pub fn from_image(path: &Path, intensity: f32) -> Result<Self, FilterBuildError> {
        let image = image::open(path)
            .map_err(|source| FilterBuildError::Image {
                path: path.to_path_buf(),
                source,
            })?
            .to_rgba8();
        let size = Size::new(image.width(), image.height());
        let mut stage = Self::new(size, image.into_raw(), intensity);
        if let Some(stem) = path.file_stem() {
            stage.name = format!("lookup:{}", stem.to_string_lossy());
        }
        Ok(stage)
    }
}

impl FilterStage for LookupStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, device: &mut dyn GpuDevice) -> Result<(), GpuError> {
        if self.table.is_none() {
            let texture = device.create_texture(&TextureDesc {
                label: format!("{} table", self.name),
                size: self.table_size,
                usage: TextureUsage::Sampled,
            })?;
            if let Err(err) = device.upload_texture(texture, &self.table_rgba) {
                device.destroy_texture(texture);
                return Err(err);
            }
            self.table = Some(texture);
        }
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
        let (Some(program), Some(table)) = (self.program.id(), self.table) else {
            return Ok(());
        };
        let mut uniforms = FilterUniforms::new(self.output, self.output);
        uniforms.set_timing(&ctx.timing);
        uniforms.intensity = self.intensity;
        ctx.render.draw(&DrawCall {
            program,
            inputs: &[input, table],
            uniforms,
        })
    }

    fn destroy(&mut self, device: &mut dyn GpuDevice) {
        if let Some(table) = self.table.take() {
            device.destroy_texture(table);
        }
        self.program.destroy(device);
    }

    fn is_initialized(&self) -> bool {
        self.program.id().is_some() && self.table.is_some()
    }
}

/// Builds a stage from its configuration. Relative paths resolve against
/// `base_dir`.
pub fn build_filter(spec: &FilterSpec, base_dir: &Path) -> Result<Box<dyn FilterStage>, FilterBuildError> {
    let resolve = |path: &PathBuf| {
        if path.is_absolute() {
            path.clone()
        } else {
            base_dir.join(path)
        }
    };
    let stage: Box<dyn FilterStage> = match spec {
        FilterSpec::Passthrough => Box::new(ShaderStage::passthrough()),
        FilterSpec::Grayscale => Box::new(ShaderStage::grayscale()),
        FilterSpec::Sepia => Box::new(ShaderStage::sepia()),
        FilterSpec::Invert => Box::new(ShaderStage::invert()),
        FilterSpec::Smooth { strength } => Box::new(ShaderStage::smooth(*strength)),
        FilterSpec::Lookup { table, intensity } => {
            Box::new(LookupStage::from_image(&resolve(table), *intensity)?)
        }
        FilterSpec::Shader { path } => Box::new(ShaderStage::from_file(&resolve(path))?),
    };
    Ok(stage)
}

/// Builds the user filter group for a preset.
pub fn build_group(preset: &FilterPreset, base_dir: &Path) -> Result<FilterGroup, FilterBuildError> {
    let stages = preset
        .filters
        .iter()
        .map(|spec| build_filter(spec, base_dir))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FilterGroup::with_stages(preset.name.clone(), stages))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{GpuOp, HeadlessDevice};

    #[test]
    fn program_slot_recompiles_on_input_change() {
        let (mut device, probe) = HeadlessDevice::new();
        let mut slot = ProgramSlot::new("camera", PASSTHROUGH_BODY, vec![InputKind::Texture2d]);
        let first = slot.init(&mut device).unwrap();
        slot.set_inputs(
            &mut device,
            vec![InputKind::External(camconfig::PixelFormat::Nv12)],
        )
        .unwrap();
        let second = slot.id().unwrap();
        assert_ne!(first, second);
        assert!(probe.ops().contains(&GpuOp::DestroyProgram(first)));
    }

    #[test]
    fn lookup_uploads_its_table_on_init() {
        let (mut device, probe) = HeadlessDevice::new();
        let mut stage = LookupStage::new(Size::new(2, 2), vec![255; 16], 0.5);
        assert!(!stage.is_initialized());
        stage.init(&mut device).unwrap();
        assert!(stage.is_initialized());
        assert!(probe
            .ops()
            .iter()
            .any(|op| matches!(op, GpuOp::UploadTexture { bytes: 16, .. })));
        stage.destroy(&mut device);
        assert!(!stage.is_initialized());
    }

    #[test]
    fn shader_file_names_the_stage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warm.glsl");
        std::fs::write(&path, PASSTHROUGH_BODY).unwrap();
        let stage = build_filter(
            &FilterSpec::Shader {
                path: PathBuf::from("warm.glsl"),
            },
            dir.path(),
        )
        .unwrap();
        assert_eq!(stage.name(), "warm");
    }

    #[test]
    fn missing_lookup_table_is_reported() {
        let err = build_filter(
            &FilterSpec::Lookup {
                table: PathBuf::from("/nonexistent/table.png"),
                intensity: 1.0,
            },
            Path::new("."),
        )
        .err()
        .unwrap();
        assert!(matches!(err, FilterBuildError::Image { .. }));
    }
}
