//! Half resolution ambient occlusion and directional light scattering
//!
//! Writes (occlusion, scattering) into the ambient target. With both effects
//! disabled the target is cleared to (1, 0) so the combine pass reads no
//! occlusion and no scattering.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec4, Vec4};

use super::shadow_pass::ShadowPass;
use super::targets::{FrameTargets, GBUFFER_NORMAL, GBUFFER_POSITION};
use super::{draw_fullscreen, fullscreen_program};
use crate::backend::{ColorTargetState, GraphicsBackend, TextureFormat};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::frame::RenderState;
use crate::profiling::profile_scope;
use crate::program::Program;
use crate::RenderConfig;

const NEUTRAL: [f32; 4] = [1.0, 0.0, 0.0, 0.0];

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct AmbientParams {
    shadow_view_projection: Mat4,
    camera_position: Vec4,
    direction_scatter: Vec4,
    options: UVec4,
}

pub struct AmbientPass {
    program: Program,
}

impl AmbientPass {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B) -> RenderResult<Self> {
        Ok(Self {
            program: fullscreen_program(
                backend,
                "ambient",
                AMBIENT_SHADER,
                vec![ColorTargetState::replace(TextureFormat::Rg16Float)],
                None,
            )?,
        })
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
        shadows: &ShadowPass,
        state: &RenderState,
        config: &RenderConfig,
    ) -> RenderResult<()> {
        profile_scope!("ambient_pass");
        let directional = state.lights.directional.as_ref();
        let scattering = config.scattering && directional.is_some();
        if !config.use_ambient_occlusion && !scattering {
            log::trace!("Ambient occlusion and scattering off, clearing");
            ctx.use_target(targets.ambient.pass_descriptor("Ambient Clear", Some(NEUTRAL)));
            return ctx.unuse_target();
        }

        let (shadow_view_projection, direction_scatter, casts_shadow) =
            directional.map_or((Mat4::IDENTITY, Vec4::ZERO, false), |light| {
                (light.gpu.view_projection, light.gpu.direction_scatter, light.casts_shadow)
            });
        self.program.set_uniform_block(&AmbientParams {
            shadow_view_projection,
            camera_position: state.camera.position.extend(1.0),
            direction_scatter,
            options: UVec4::new(
                config.use_ambient_occlusion as u32,
                scattering as u32,
                casts_shadow as u32,
                0,
            ),
        })?;
        self.program
            .bind_texture(1, targets.gbuffer.view(GBUFFER_POSITION)?);
        self.program.bind_texture(2, targets.gbuffer.view(GBUFFER_NORMAL)?);
        self.program.bind_texture(3, shadows.directional_view());
        self.program.bind_sampler(4, shadows.sampler());

        ctx.use_target(targets.ambient.pass_descriptor("Ambient", Some(NEUTRAL)));
        let result = draw_fullscreen(ctx.backend_mut(), &mut self.program);
        ctx.unuse_target()?;
        result
    }
}

pub const AMBIENT_SHADER: &str = r#"
struct AmbientParams {
    shadow_view_projection: mat4x4<f32>,
    camera_position: vec4<f32>,
    direction_scatter: vec4<f32>,
    // x = occlusion, y = scattering, z = shadow map valid
    options: vec4<u32>,
}

@group(0) @binding(0) var<uniform> params: AmbientParams;
@group(0) @binding(1) var gbuffer_position: texture_2d<f32>;
@group(0) @binding(2) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(3) var shadow_map: texture_depth_2d_array;
@group(0) @binding(4) var shadow_sampler: sampler_comparison;

const SCATTER_STEPS: u32 = 16u;
const OCCLUSION_RADIUS: f32 = 1.0;

var<private> KERNEL: array<vec2<i32>, 8> = array<vec2<i32>, 8>(
    vec2<i32>(-3, -3), vec2<i32>(0, -4), vec2<i32>(3, -3), vec2<i32>(4, 0),
    vec2<i32>(3, 3), vec2<i32>(0, 4), vec2<i32>(-3, 3), vec2<i32>(-4, 0),
);

fn load_position(pixel: vec2<i32>) -> vec4<f32> {
    let size = vec2<i32>(textureDimensions(gbuffer_position));
    return textureLoad(gbuffer_position, clamp(pixel, vec2<i32>(0), size - 1), 0);
}

fn lit_by_sun(world: vec3<f32>) -> f32 {
    if params.options.z == 0u {
        return 1.0;
    }
    let clip = params.shadow_view_projection * vec4<f32>(world, 1.0);
    let ndc = clip.xyz / clip.w;
    let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    if any(uv < vec2<f32>(0.0)) || any(uv > vec2<f32>(1.0)) {
        return 1.0;
    }
    return textureSampleCompareLevel(shadow_map, shadow_sampler, uv, 0, ndc.z - 0.001);
}

fn occlusion(pixel: vec2<i32>, position: vec3<f32>, normal: vec3<f32>) -> f32 {
    var occluded = 0.0;
    for (var i = 0u; i < 8u; i++) {
        let neighbour = load_position(pixel + KERNEL[i]);
        if neighbour.w == 0.0 {
            continue;
        }
        let offset = neighbour.xyz - position;
        let distance = length(offset);
        if distance < 0.0001 || distance > OCCLUSION_RADIUS {
            continue;
        }
        occluded += max(dot(normal, offset / distance), 0.0) * (1.0 - distance / OCCLUSION_RADIUS);
    }
    return clamp(1.0 - occluded / 8.0, 0.0, 1.0);
}

// Fraction of the view ray lit by the sun, scaled by the scatter factor
fn scattering(position: vec3<f32>) -> f32 {
    let start = params.camera_position.xyz;
    var lit = 0.0;
    for (var i = 0u; i < SCATTER_STEPS; i++) {
        let t = (f32(i) + 0.5) / f32(SCATTER_STEPS);
        lit += lit_by_sun(mix(start, position, t));
    }
    return params.direction_scatter.w * lit / f32(SCATTER_STEPS);
}

@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(input.position.xy) * 2;
    let position = load_position(pixel);
    if position.w == 0.0 {
        return vec4<f32>(1.0, 0.0, 0.0, 0.0);
    }
    let normal = normalize(textureLoad(gbuffer_normal, pixel, 0).xyz);

    var ambient = 1.0;
    if params.options.x != 0u {
        ambient = occlusion(pixel, position.xyz, normal);
    }
    var scatter = 0.0;
    if params.options.y != 0u {
        scatter = scattering(position.xyz);
    }
    return vec4<f32>(ambient, scatter, 0.0, 0.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordedCommand;
    use crate::backend::RecordingBackend;
    use crate::light::{DirectionalLight, LightManager};
    use crate::pipeline::FULLSCREEN_VERTEX_SHADER;
    use crate::program::reflect;
    use crate::resources::ChannelLayout;
    use crate::scene::{Scene, Transform};

    fn run(config: RenderConfig, with_sun: bool) -> RenderContext<RecordingBackend> {
        let mut ctx = RenderContext::new(RecordingBackend::new(16, 16), config.clone());
        let backend = ctx.backend_mut();
        let targets = FrameTargets::new(backend, 16, 16).unwrap();
        let shadows =
            ShadowPass::new(backend, &config, ChannelLayout::standard().vertex_buffer_layout()).unwrap();
        let mut pass = AmbientPass::new(backend).unwrap();

        let mut scene = Scene::new();
        if with_sun {
            scene.spawn_directional_light(Transform::default(), DirectionalLight::default());
        }
        let state = RenderState::extract(&mut scene, &mut LightManager::default(), 1);
        pass.execute(&mut ctx, &targets, &shadows, &state, &config)
            .unwrap();
        ctx
    }

    #[test]
    fn test_shader_validates() {
        let reflection = reflect("ambient", &[FULLSCREEN_VERTEX_SHADER, AMBIENT_SHADER].concat()).unwrap();
        assert_eq!(reflection.uniform_size, std::mem::size_of::<AmbientParams>());
    }

    #[test]
    fn test_disabled_effects_clear_to_neutral() {
        let config = RenderConfig {
            use_ambient_occlusion: false,
            scattering: false,
            ..Default::default()
        };
        let ctx = run(config, true);
        let backend = ctx.backend();
        assert_eq!(backend.render_pass_labels(), ["Ambient Clear"]);
        assert_eq!(backend.draw_call_count(), 0);
        assert!(backend.commands().contains(&RecordedCommand::BeginRenderPass {
            label: "Ambient Clear".into(),
            color_attachments: 1,
            clears: true,
        }));
    }

    #[test]
    fn test_scattering_needs_a_sun() {
        let config = RenderConfig {
            use_ambient_occlusion: false,
            scattering: true,
            ..Default::default()
        };
        assert_eq!(run(config.clone(), false).backend().render_pass_labels(), ["Ambient Clear"]);

        let ctx = run(config, true);
        let backend = ctx.backend();
        assert_eq!(backend.render_pass_labels(), ["Ambient"]);
        assert_eq!(backend.draws_in_passes("Ambient"), 1);
    }
}
