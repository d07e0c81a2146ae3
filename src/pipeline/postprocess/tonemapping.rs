//! Motion blur, sun glare and tone mapping into the output image

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use bytemuck::{Pod, Zeroable};
use glam::{UVec4, Vec4};

use crate::backend::{
    BufferHandle, ColorAttachment, ColorTargetState, GraphicsBackend, LoadOp, RenderPassDescriptor,
    SamplerDescriptor, SamplerHandle, StoreOp, TextureFormat, TextureViewHandle,
};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::frame::RenderState;
use crate::pipeline::targets::{FrameTargets, GBUFFER_MOTION, HDR};
use crate::pipeline::{draw_fullscreen, fullscreen_program};
use crate::profiling::profile_scope;
use crate::program::Program;
use crate::RenderConfig;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TonemapParams {
    camera_forward: Vec4,
    /// xyz = direction towards the sun, w = glare strength
    sun: Vec4,
    sun_color: Vec4,
    /// x = motion blur, y = auto exposure
    options: UVec4,
}

impl Default for TonemapParams {
    fn default() -> Self {
        Self {
            camera_forward: Vec4::new(0.0, 0.0, -1.0, 0.0),
            sun: Vec4::ZERO,
            sun_color: Vec4::ZERO,
            options: UVec4::ZERO,
        }
    }
}

pub struct Tonemapping {
    /// One pipeline per output format
    programs: HashMap<TextureFormat, Program>,
    params: TonemapParams,
    sampler: SamplerHandle,
}

impl Tonemapping {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B) -> RenderResult<Self> {
        let sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("tonemap_sampler".into()),
            ..Default::default()
        })?;
        let mut tonemapping = Self {
            programs: HashMap::new(),
            params: TonemapParams::default(),
            sampler,
        };
        let format = backend.swapchain_format();
        tonemapping.program(backend, format)?;
        Ok(tonemapping)
    }

    fn program<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        format: TextureFormat,
    ) -> RenderResult<&mut Program> {
        Ok(match self.programs.entry(format) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                log::debug!("Building tone mapping program for {format:?}");
                entry.insert(fullscreen_program(
                    backend,
                    &format!("tonemap_{format:?}").to_lowercase(),
                    TONEMAP_SHADER,
                    vec![ColorTargetState::replace(format)],
                    None,
                )?)
            }
        })
    }

    pub fn begin_frame(&mut self) {
        for program in self.programs.values_mut() {
            program.begin_frame();
        }
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        for program in self.programs.into_values() {
            program.destroy(backend);
        }
    }

    /// Refresh the uniform block from the frame, keeping the previous values when
    /// the camera has no usable direction
    fn update_params(&mut self, state: &RenderState, config: &RenderConfig) {
        let Some(forward) = state.camera.forward.try_normalize() else {
            log::warn!("Camera direction has zero length, keeping last post-process parameters");
            return;
        };
        let (sun, sun_color) = match &state.lights.directional {
            Some(light) => (
                (-light.gpu.direction_scatter.truncate()).normalize_or_zero().extend(0.5),
                light.gpu.color_intensity,
            ),
            None => (Vec4::ZERO, Vec4::ZERO),
        };
        self.params = TonemapParams {
            camera_forward: forward.extend(0.0),
            sun,
            sun_color,
            options: UVec4::new(config.motion_blur as u32, config.auto_exposure as u32, 0, 0),
        };
    }

    pub fn execute<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        targets: &FrameTargets,
        (view, format): (TextureViewHandle, TextureFormat),
        exposure: BufferHandle,
        state: &RenderState,
        config: &RenderConfig,
    ) -> RenderResult<()> {
        profile_scope!("tonemapping");
        self.update_params(state, config);
        let params = self.params;
        let sampler = self.sampler;
        let program = self.program(ctx.backend_mut(), format)?;
        program.set_uniform_block(&params)?;
        program.bind_texture(1, targets.hdr.view(HDR)?);
        program.bind_texture(2, targets.gbuffer.view(GBUFFER_MOTION)?);
        program.bind_sampler(3, sampler);
        program.bind_storage_buffer(4, exposure);

        ctx.use_target(RenderPassDescriptor {
            label: Some("Post Process".into()),
            color_attachments: vec![ColorAttachment {
                view,
                load_op: LoadOp::Clear([0.0, 0.0, 0.0, 1.0]),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: None,
        });
        let result = draw_fullscreen(ctx.backend_mut(), program);
        ctx.unuse_target()?;
        result
    }
}

pub const TONEMAP_SHADER: &str = r#"
struct TonemapParams {
    camera_forward: vec4<f32>,
    sun: vec4<f32>,
    sun_color: vec4<f32>,
    options: vec4<u32>,
}

@group(0) @binding(0) var<uniform> params: TonemapParams;
@group(0) @binding(1) var hdr: texture_2d<f32>;
@group(0) @binding(2) var motion: texture_2d<f32>;
@group(0) @binding(3) var hdr_sampler: sampler;
@group(0) @binding(4) var<storage, read> exposure: array<f32>;

const BLUR_SAMPLES: u32 = 8u;

fn aces(color: vec3<f32>) -> vec3<f32> {
    let a = 2.51;
    let b = 0.03;
    let c = 2.43;
    let d = 0.59;
    let e = 0.14;
    return saturate((color * (a * color + b)) / (color * (c * color + d) + e));
}

@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    var color = textureSampleLevel(hdr, hdr_sampler, input.uv, 0.0).rgb;

    if params.options.x != 0u {
        let velocity = textureLoad(motion, vec2<i32>(input.position.xy), 0).xy * vec2<f32>(1.0, -1.0);
        for (var i = 1u; i < BLUR_SAMPLES; i++) {
            let offset = velocity * (f32(i) / f32(BLUR_SAMPLES - 1u) - 0.5);
            color += textureSampleLevel(hdr, hdr_sampler, input.uv + offset, 0.0).rgb;
        }
        color /= f32(BLUR_SAMPLES);
    }

    let facing = max(dot(params.camera_forward.xyz, params.sun.xyz), 0.0);
    color += params.sun_color.rgb * params.sun_color.w * pow(facing, 64.0) * params.sun.w;

    var scale = 1.0;
    if params.options.y != 0u {
        scale = exposure[0];
    }
    let mapped = aces(color * scale);
    return vec4<f32>(pow(mapped, vec3<f32>(1.0 / 2.2)), 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::light::{DirectionalLight, LightManager};
    use crate::pipeline::FULLSCREEN_VERTEX_SHADER;
    use crate::program::reflect;
    use crate::scene::{Scene, Transform};
    use glam::Vec3;

    #[test]
    fn test_shader_validates() {
        let reflection = reflect("tonemap", &[FULLSCREEN_VERTEX_SHADER, TONEMAP_SHADER].concat()).unwrap();
        assert_eq!(reflection.uniform_size, std::mem::size_of::<TonemapParams>());
    }

    #[test]
    fn test_zero_direction_keeps_previous_params() {
        let mut backend = RecordingBackend::new(8, 8);
        let mut tonemapping = Tonemapping::new(&mut backend).unwrap();
        let config = RenderConfig {
            motion_blur: true,
            ..Default::default()
        };

        let mut scene = Scene::new();
        scene.spawn_directional_light(Transform::default(), DirectionalLight::default());
        let mut state = RenderState::extract(&mut scene, &mut LightManager::default(), 1);
        tonemapping.update_params(&state, &config);
        let before = tonemapping.params;
        assert_eq!(before.options.x, 1);
        assert_ne!(before.sun, Vec4::ZERO);

        state.camera.forward = Vec3::ZERO;
        tonemapping.update_params(&state, &RenderConfig::default());
        assert_eq!(tonemapping.params.options, before.options);
        assert_eq!(tonemapping.params.camera_forward, before.camera_forward);
    }

    #[test]
    fn test_programs_are_cached_per_format() {
        let mut ctx = RenderContext::new(RecordingBackend::new(8, 8), RenderConfig::default());
        let targets = FrameTargets::new(ctx.backend_mut(), 8, 8).unwrap();
        let mut tonemapping = Tonemapping::new(ctx.backend_mut()).unwrap();
        let exposure = ctx
            .backend_mut()
            .create_buffer(&crate::backend::BufferDescriptor::new(
                "exposure",
                4,
                crate::backend::BufferUsage::STORAGE,
            ))
            .unwrap();
        let state = RenderState::default();
        let config = RenderConfig::default();

        let frame = ctx.backend_mut().begin_frame().unwrap();
        let swapchain = (frame.swapchain_view, ctx.backend().swapchain_format());
        tonemapping
            .execute(&mut ctx, &targets, swapchain, exposure, &state, &config)
            .unwrap();
        assert_eq!(tonemapping.programs.len(), 1);

        let view = targets.reflection.view(crate::pipeline::targets::REFLECTION).unwrap();
        for _ in 0..2 {
            tonemapping
                .execute(
                    &mut ctx,
                    &targets,
                    (view, TextureFormat::Rgba16Float),
                    exposure,
                    &state,
                    &config,
                )
                .unwrap();
        }
        assert_eq!(tonemapping.programs.len(), 2);
        assert_eq!(
            ctx.backend().render_pass_labels(),
            ["Post Process", "Post Process", "Post Process"]
        );
        assert_eq!(ctx.backend().draw_call_count(), 3);
    }
}
