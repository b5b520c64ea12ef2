use std::borrow::Cow;
use std::fmt::Write as _;

use camconfig::PixelFormat;
use wgpu::naga::ShaderStage;

use crate::gpu::InputKind;

/// Compiles the shared full-screen quad vertex shader.
pub(crate) fn compile_vertex_shader(device: &wgpu::Device) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some("filter quad vertex"),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Borrowed(VERTEX_SHADER_GLSL),
            stage: ShaderStage::Vertex,
            defines: &[],
        },
    })
}

/// Wraps a filter body with the parameter block and input samplers and
/// compiles it as GLSL.
pub(crate) fn compile_fragment_shader(
    device: &wgpu::Device,
    label: &str,
    body: &str,
    inputs: &[InputKind],
) -> wgpu::ShaderModule {
    let wrapped = wrap_filter_fragment(body, inputs);
    tracing::trace!(label, source = %wrapped, "compiling filter fragment");
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Glsl {
            shader: Cow::Owned(wrapped),
            stage: ShaderStage::Fragment,
            defines: &[],
        },
    })
}

/// Produces a self-contained fragment shader from a filter body.
///
/// The body must define `vec4 apply_filter(vec2 uv)`. It can read its inputs
/// through `sample_input0(uv)`, `sample_input1(uv)` and so on, whatever the
/// native layout of the texture behind them. `#version` lines in the body
/// are dropped because the prelude supplies its own.
pub(crate) fn wrap_filter_fragment(body: &str, inputs: &[InputKind]) -> String {
    let mut source = String::with_capacity(HEADER.len() + body.len() + 512);
    source.push_str(HEADER);

    source.push_str("layout(set = 1, binding = 0) uniform sampler filter_sampler;\n");
    let mut binding = 1;
    for (index, input) in inputs.iter().enumerate() {
        for plane in 0..input.planes() {
            let _ = writeln!(
                source,
                "layout(set = 1, binding = {binding}) uniform texture2D input{index}_plane{plane};"
            );
            binding += 1;
        }
    }
    for (index, input) in inputs.iter().enumerate() {
        source.push_str(&sampler_function(index, *input));
    }

    source.push_str("\n#line 1\n");
    for line in body.lines() {
        if line.trim_start().starts_with("#version") {
            continue;
        }
        source.push_str(line);
        source.push('\n');
    }
    source.push_str(FOOTER);
    source
}

fn sampler_function(index: usize, input: InputKind) -> String {
    match input {
        InputKind::External(PixelFormat::Nv12) => format!(
            r"
vec4 sample_input{index}(vec2 uv) {{
    float luma = texture(sampler2D(input{index}_plane0, filter_sampler), uv).r;
    vec2 chroma = texture(sampler2D(input{index}_plane1, filter_sampler), uv).rg - vec2(0.5);
    vec3 rgb = vec3(
        luma + 1.402 * chroma.y,
        luma - 0.344136 * chroma.x - 0.714136 * chroma.y,
        luma + 1.772 * chroma.x
    );
    return vec4(clamp(rgb, 0.0, 1.0), 1.0);
}}
"
        ),
        InputKind::External(_) | InputKind::Texture2d => format!(
            r"
vec4 sample_input{index}(vec2 uv) {{
    return texture(sampler2D(input{index}_plane0, filter_sampler), uv);
}}
"
        ),
    }
}

/// Parameter block shared by both stages. Must match [`FilterUniforms`].
///
/// [`FilterUniforms`]: crate::gpu::FilterUniforms
macro_rules! params_block {
    () => {
        r"layout(std140, set = 0, binding = 0) uniform FilterParams {
    vec4 resolution;
    vec4 tex_coords[2];
    mat4 transform;
    float time;
    float time_delta;
    int frame;
    float intensity;
} params;
"
    };
}

const HEADER: &str = concat!(
    r"#version 450
layout(location = 0) in vec2 v_uv;
layout(location = 0) out vec4 outColor;

",
    params_block!(),
    r"
#define filter_output_size params.resolution.xy
#define filter_input_size params.resolution.zw
#define filter_time params.time
#define filter_intensity params.intensity

"
);

const FOOTER: &str = r"
void main() {
    outColor = apply_filter(v_uv);
}
";

/// Full-screen quad drawn as a four vertex strip. Texture coordinates come
/// from the parameter block so rotation and cropping need no vertex buffers.
const VERTEX_SHADER_GLSL: &str = concat!(
    r"#version 450
layout(location = 0) out vec2 v_uv;

",
    params_block!(),
    r"
const vec2 positions[4] = vec2[4](
    vec2(-1.0, -1.0),
    vec2(1.0, -1.0),
    vec2(-1.0, 1.0),
    vec2(1.0, 1.0)
);

void main() {
    int vertex_index = gl_VertexIndex;
    vec4 pair = params.tex_coords[vertex_index / 2];
    vec2 uv = (vertex_index % 2 == 0) ? pair.xy : pair.zw;
    v_uv = (params.transform * vec4(uv, 0.0, 1.0)).xy;
    gl_Position = vec4(positions[vertex_index], 0.0, 1.0);
}
"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_declares_one_binding_per_plane() {
        let wrapped = wrap_filter_fragment(
            "vec4 apply_filter(vec2 uv) { return sample_input0(uv) * sample_input1(uv); }",
            &[InputKind::External(PixelFormat::Nv12), InputKind::Texture2d],
        );
        assert!(wrapped.contains("binding = 1) uniform texture2D input0_plane0"));
        assert!(wrapped.contains("binding = 2) uniform texture2D input0_plane1"));
        assert!(wrapped.contains("binding = 3) uniform texture2D input1_plane0"));
        assert!(wrapped.contains("vec4 sample_input0"));
        assert!(wrapped.contains("vec4 sample_input1"));
        assert!(wrapped.ends_with(FOOTER));
    }

    #[test]
    fn wrap_strips_version_directive() {
        let wrapped = wrap_filter_fragment(
            "#version 300 es\nvec4 apply_filter(vec2 uv) { return vec4(uv, 0.0, 1.0); }",
            &[InputKind::Texture2d],
        );
        assert_eq!(wrapped.matches("#version").count(), 1);
        assert!(wrapped.starts_with("#version 450"));
    }

    #[test]
    fn both_stages_declare_the_parameter_block() {
        assert!(HEADER.contains(params_block!()));
        assert!(VERTEX_SHADER_GLSL.contains(params_block!()));
    }
}
