//! Screen-space reflections
//!
//! The reflection target of the previous frame is first copied into a
//! snapshot, then each surface marches its reflected view ray across the
//! screen. A hit picks up the lit color plus a share of the snapshot (one more
//! bounce per frame); a miss falls back to the sky color.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

use super::targets::{
    FrameTargets, GBUFFER_ALBEDO, GBUFFER_NORMAL, GBUFFER_POSITION, LIGHT, REFLECTION,
};
use super::{draw_fullscreen, fullscreen_program};
use crate::backend::{ColorTargetState, GraphicsBackend, TextureFormat};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::frame::RenderState;
use crate::profiling::profile_scope;
use crate::program::Program;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ReflectionParams {
    view_projection: Mat4,
    camera_position: Vec4,
    sky_color: Vec4,
}

pub struct ReflectionPass {
    program: Program,
}

impl ReflectionPass {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B) -> RenderResult<Self> {
        Ok(Self {
            program: fullscreen_program(
                backend,
                "reflection",
                REFLECTION_SHADER,
                vec![ColorTargetState::replace(TextureFormat::Rgba16Float)],
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
        state: &RenderState,
        use_gi: bool,
    ) -> RenderResult<()> {
        profile_scope!("reflection_pass");
        if !use_gi {
            ctx.use_target(targets.reflection.pass_descriptor("Reflection Clear", Some([0.0; 4])));
            return ctx.unuse_target();
        }

        ctx.backend_mut().copy_texture_to_texture(
            targets.reflection.texture(REFLECTION)?,
            targets.reflection_snapshot.texture(REFLECTION)?,
        );

        self.program.set_uniform_block(&ReflectionParams {
            view_projection: state.camera.view_projection,
            camera_position: state.camera.position.extend(1.0),
            sky_color: state.sky_color.extend(1.0),
        })?;
        self.program
            .bind_texture(1, targets.gbuffer.view(GBUFFER_POSITION)?);
        self.program.bind_texture(2, targets.gbuffer.view(GBUFFER_NORMAL)?);
        self.program.bind_texture(3, targets.gbuffer.view(GBUFFER_ALBEDO)?);
        self.program.bind_texture(4, targets.light.view(LIGHT)?);
        self.program
            .bind_texture(5, targets.reflection_snapshot.view(REFLECTION)?);

        ctx.use_target(targets.reflection.pass_descriptor("Reflections", Some([0.0; 4])));
        let result = draw_fullscreen(ctx.backend_mut(), &mut self.program);
        ctx.unuse_target()?;
        result
    }
}

pub const REFLECTION_SHADER: &str = r#"
struct ReflectionParams {
    view_projection: mat4x4<f32>,
    camera_position: vec4<f32>,
    sky_color: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: ReflectionParams;
@group(0) @binding(1) var gbuffer_position: texture_2d<f32>;
@group(0) @binding(2) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(3) var gbuffer_albedo: texture_2d<f32>;
@group(0) @binding(4) var light_buffer: texture_2d<f32>;
@group(0) @binding(5) var reflection_snapshot: texture_2d<f32>;

const MARCH_STEPS: u32 = 32u;
const MARCH_DISTANCE: f32 = 20.0;
const THICKNESS: f32 = 0.25;

fn to_pixel(world: vec3<f32>, size: vec2<f32>) -> vec3<f32> {
    let clip = params.view_projection * vec4<f32>(world, 1.0);
    if clip.w <= 0.0 {
        return vec3<f32>(-1.0);
    }
    let ndc = clip.xy / clip.w;
    return vec3<f32>((ndc.x * 0.5 + 0.5) * size.x, (0.5 - ndc.y * 0.5) * size.y, clip.w);
}

@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(input.position.xy);
    let position = textureLoad(gbuffer_position, pixel, 0);
    if position.w == 0.0 {
        return vec4<f32>(0.0);
    }
    let size = vec2<f32>(textureDimensions(gbuffer_position));
    let normal = normalize(textureLoad(gbuffer_normal, pixel, 0).xyz);
    let view = normalize(position.xyz - params.camera_position.xyz);
    let ray = reflect(view, normal);
    let fresnel = pow(1.0 - max(dot(-view, normal), 0.0), 5.0);

    for (var i = 1u; i <= MARCH_STEPS; i++) {
        let world = position.xyz + ray * (MARCH_DISTANCE * f32(i) / f32(MARCH_STEPS));
        let projected = to_pixel(world, size);
        if projected.z <= 0.0 || any(projected.xy < vec2<f32>(0.0)) || any(projected.xy >= size) {
            break;
        }
        let hit_pixel = vec2<i32>(projected.xy);
        let surface = textureLoad(gbuffer_position, hit_pixel, 0);
        if surface.w == 0.0 {
            continue;
        }
        let surface_depth = distance(surface.xyz, params.camera_position.xyz);
        let ray_depth = distance(world, params.camera_position.xyz);
        if ray_depth > surface_depth && ray_depth - surface_depth < THICKNESS {
            let lit = textureLoad(light_buffer, hit_pixel, 0).rgb;
            let bounce = textureLoad(reflection_snapshot, hit_pixel, 0).rgb
                * textureLoad(gbuffer_albedo, hit_pixel, 0).rgb;
            return vec4<f32>((lit + bounce * 0.5) * fresnel, 1.0);
        }
    }
    return vec4<f32>(params.sky_color.rgb * fresnel, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordedCommand;
    use crate::backend::RecordingBackend;
    use crate::pipeline::FULLSCREEN_VERTEX_SHADER;
    use crate::program::reflect;
    use crate::RenderConfig;

    fn run(use_gi: bool) -> (RenderContext<RecordingBackend>, FrameTargets) {
        let mut ctx = RenderContext::new(RecordingBackend::new(16, 16), RenderConfig::default());
        let targets = FrameTargets::new(ctx.backend_mut(), 16, 16).unwrap();
        let mut pass = ReflectionPass::new(ctx.backend_mut()).unwrap();
        pass.execute(&mut ctx, &targets, &RenderState::default(), use_gi)
            .unwrap();
        (ctx, targets)
    }

    #[test]
    fn test_shader_validates() {
        let reflection =
            reflect("reflection", &[FULLSCREEN_VERTEX_SHADER, REFLECTION_SHADER].concat()).unwrap();
        assert_eq!(reflection.uniform_size, std::mem::size_of::<ReflectionParams>());
    }

    #[test]
    fn test_snapshot_is_taken_before_the_pass() {
        let (ctx, targets) = run(true);
        let commands = ctx.backend().commands();
        let copy = RecordedCommand::CopyTexture {
            src: targets.reflection.texture(REFLECTION).unwrap(),
            dst: targets.reflection_snapshot.texture(REFLECTION).unwrap(),
        };
        let copy_at = commands.iter().position(|c| *c == copy).unwrap();
        let pass_at = commands
            .iter()
            .position(|c| matches!(c, RecordedCommand::BeginRenderPass { label, .. } if label == "Reflections"))
            .unwrap();
        assert!(copy_at < pass_at);
        assert_eq!(ctx.backend().draws_in_passes("Reflections"), 1);
    }

    #[test]
    fn test_disabled_gi_clears_to_black() {
        let (ctx, _) = run(false);
        assert_eq!(ctx.backend().render_pass_labels(), ["Reflection Clear"]);
        assert_eq!(ctx.backend().draw_call_count(), 0);
        assert!(!ctx
            .backend()
            .commands()
            .iter()
            .any(|c| matches!(c, RecordedCommand::CopyTexture { .. })));
    }
}
