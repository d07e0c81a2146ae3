//! Final combination into the HDR target

use bytemuck::{Pod, Zeroable};
use glam::{UVec4, Vec4};

use super::targets::{FrameTargets, AMBIENT, GBUFFER_ALBEDO, GBUFFER_POSITION, HDR, LIGHT, REFLECTION};
use super::{draw_fullscreen, fullscreen_program};
use crate::backend::{ColorTargetState, GraphicsBackend, SamplerDescriptor, SamplerHandle, TextureFormat};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::frame::RenderState;
use crate::profiling::profile_scope;
use crate::program::Program;
use crate::RenderConfig;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct CombineParams {
    sky_color: Vec4,
    /// x = albedo only
    options: UVec4,
}

pub struct CombinePass {
    program: Program,
    sampler: SamplerHandle,
}

impl CombinePass {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B) -> RenderResult<Self> {
        let program = fullscreen_program(
            backend,
            "combine",
            COMBINE_SHADER,
            vec![ColorTargetState::replace(TextureFormat::Rgba16Float)],
            None,
        )?;
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("combine_sampler".into()),
            ..Default::default()
        })?;
        Ok(Self { program, sampler })
    }

    pub fn begin_frame(&mut self) {
        self.program.begin_frame();
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.program.destroy(backend);
    }

    pub fn execute<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        targets: &FrameTargets,
        state: &RenderState,
        config: &RenderConfig,
    ) -> RenderResult<()> {
        profile_scope!("combine_pass");
        self.program.set_uniform_block(&CombineParams {
            sky_color: state.sky_color.extend(1.0),
            options: UVec4::new(config.use_direct_texture_output as u32, 0, 0, 0),
        })?;
        self.program
            .bind_texture(1, targets.gbuffer.view(GBUFFER_POSITION)?);
        self.program.bind_texture(2, targets.gbuffer.view(GBUFFER_ALBEDO)?);
        self.program.bind_texture(3, targets.light.view(LIGHT)?);
        self.program.bind_texture(4, targets.reflection.view(REFLECTION)?);
        self.program.bind_texture(5, targets.ambient.view(AMBIENT)?);
        self.program.bind_sampler(6, self.sampler);

        ctx.use_target(targets.hdr.pass_descriptor("Combine", Some([0.0, 0.0, 0.0, 1.0])));
        let result = draw_fullscreen(ctx.backend_mut(), &mut self.program);
        ctx.unuse_target()?;
        result?;

        ctx.backend_mut().generate_mipmaps(targets.hdr.texture(HDR)?);
        Ok(())
    }
}

pub const COMBINE_SHADER: &str = r#"
struct CombineParams {
    sky_color: vec4<f32>,
    options: vec4<u32>,
}

@group(0) @binding(0) var<uniform> params: CombineParams;
@group(0) @binding(1) var gbuffer_position: texture_2d<f32>;
@group(0) @binding(2) var gbuffer_albedo: texture_2d<f32>;
@group(0) @binding(3) var light_buffer: texture_2d<f32>;
@group(0) @binding(4) var reflection_buffer: texture_2d<f32>;
@group(0) @binding(5) var ambient_buffer: texture_2d<f32>;
@group(0) @binding(6) var linear_sampler: sampler;

const AMBIENT_LIGHT: f32 = 0.05;

@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(input.position.xy);
    let position = textureLoad(gbuffer_position, pixel, 0);
    let albedo = textureLoad(gbuffer_albedo, pixel, 0).rgb;
    let ambient = textureSampleLevel(ambient_buffer, linear_sampler, input.uv, 0.0).xy;

    if params.options.x != 0u {
        return vec4<f32>(albedo, 1.0);
    }
    let scatter = params.sky_color.rgb * ambient.y;
    if position.w == 0.0 {
        return vec4<f32>(albedo + scatter, 1.0);
    }

    let light = textureLoad(light_buffer, pixel, 0).rgb;
    let reflection = textureLoad(reflection_buffer, pixel, 0).rgb;
    let indirect = params.sky_color.rgb * AMBIENT_LIGHT * ambient.x;
    let color = albedo * (light + indirect) + reflection * albedo + scatter;
    return vec4<f32>(color, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordedCommand;
    use crate::backend::RecordingBackend;
    use crate::pipeline::FULLSCREEN_VERTEX_SHADER;
    use crate::program::reflect;

    #[test]
    fn test_shader_validates() {
        let reflection = reflect("combine", &[FULLSCREEN_VERTEX_SHADER, COMBINE_SHADER].concat()).unwrap();
        assert_eq!(reflection.uniform_size, std::mem::size_of::<CombineParams>());
    }

    #[test]
    fn test_mipmaps_follow_the_pass() {
        let mut ctx = RenderContext::new(RecordingBackend::new(32, 32), RenderConfig::default());
        let targets = FrameTargets::new(ctx.backend_mut(), 32, 32).unwrap();
        let mut pass = CombinePass::new(ctx.backend_mut()).unwrap();
        pass.execute(&mut ctx, &targets, &RenderState::default(), &RenderConfig::default())
            .unwrap();

        let backend = ctx.backend();
        assert_eq!(backend.render_pass_labels(), ["Combine"]);
        assert_eq!(backend.draws_in_passes("Combine"), 1);
        let hdr = targets.hdr.texture(HDR).unwrap();
        assert_eq!(
            backend.commands().last(),
            Some(&RecordedCommand::GenerateMipmaps(hdr))
        );
        assert!(backend.texture_descriptor(hdr).unwrap().mip_levels > 1);
    }
}
