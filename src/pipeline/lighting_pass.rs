//! Lighting (second) pass
//!
//! Accumulates every light additively into the light target while testing
//! against the G-Buffer depth:
//! - Directional light as a fullscreen triangle
//! - Point lights from the tiled compute result
//! - Area and tube lights as volume boxes; when the camera sits inside a box
//!   its back faces are drawn with an inverted depth test so the volume is not
//!   clipped away by the near plane

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec4, Vec4};

use super::light_culling::TiledPointLights;
use super::shadow_pass::ShadowPass;
use super::targets::{FrameTargets, GBUFFER_ALBEDO, GBUFFER_NORMAL, GBUFFER_POSITION};
use super::{depth_read_only, draw_fullscreen, fullscreen_program};
use crate::backend::{
    ColorTargetState, CompareFunction, CullMode, DepthStencilAttachment, FrontFace,
    GraphicsBackend, LoadOp, PrimitiveTopology, RenderPipelineDescriptor, StoreOp, TextureFormat,
};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::frame::RenderState;
use crate::light::LightBuffers;
use crate::profiling::profile_scope;
use crate::program::Program;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DirectionalParams {
    view_projection: Mat4,
    direction_scatter: Vec4,
    color_intensity: Vec4,
    options: UVec4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct VolumeParams {
    view_projection: Mat4,
    light_index: UVec4,
}

/// The two pipelines of one volume light type
struct VolumePrograms {
    outside: Program,
    inside: Program,
}

impl VolumePrograms {
    fn new<B: GraphicsBackend + ?Sized>(backend: &mut B, label: &str, source: &str) -> RenderResult<Self> {
        let shader = [VOLUME_VERTEX_SHADER, source].concat();
        Ok(Self {
            outside: Program::render(
                backend,
                volume_pipeline(&format!("{label}_outside"), &shader, CullMode::Back, CompareFunction::LessEqual),
            )?,
            inside: Program::render(
                backend,
                volume_pipeline(&format!("{label}_inside"), &shader, CullMode::Front, CompareFunction::GreaterEqual),
            )?,
        })
    }

    fn select(&mut self, camera_inside: bool) -> &mut Program {
        if camera_inside {
            &mut self.inside
        } else {
            &mut self.outside
        }
    }

    fn begin_frame(&mut self) {
        self.outside.begin_frame();
        self.inside.begin_frame();
    }

    fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.outside.destroy(backend);
        self.inside.destroy(backend);
    }

    fn each(&mut self) -> [&mut Program; 2] {
        [&mut self.outside, &mut self.inside]
    }
}

fn volume_pipeline(
    label: &str,
    shader: &str,
    cull_mode: CullMode,
    depth_compare: CompareFunction,
) -> RenderPipelineDescriptor {
    RenderPipelineDescriptor {
        label: Some(label.into()),
        shader: shader.into(),
        vertex_entry: "vs_volume".into(),
        fragment_entry: Some("fs_main".into()),
        vertex_layouts: vec![],
        bind_group_layouts: vec![],
        primitive_topology: PrimitiveTopology::TriangleList,
        front_face: FrontFace::Ccw,
        cull_mode,
        depth_stencil: Some(depth_read_only(depth_compare)),
        color_targets: vec![ColorTargetState::additive(TextureFormat::Rgba16Float)],
    }
}

pub struct LightingPass {
    directional: Program,
    area: VolumePrograms,
    tube: VolumePrograms,
}

impl LightingPass {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B) -> RenderResult<Self> {
        Ok(Self {
            directional: fullscreen_program(
                backend,
                "directional_light",
                DIRECTIONAL_LIGHT_SHADER,
                vec![ColorTargetState::additive(TextureFormat::Rgba16Float)],
                Some(depth_read_only(CompareFunction::Always)),
            )?,
            area: VolumePrograms::new(backend, "area_light", AREA_LIGHT_SHADER)?,
            tube: VolumePrograms::new(backend, "tube_light", TUBE_LIGHT_SHADER)?,
        })
    }

    pub fn begin_frame(&mut self) {
        self.directional.begin_frame();
        self.area.begin_frame();
        self.tube.begin_frame();
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.directional.destroy(backend);
        self.area.destroy(backend);
        self.tube.destroy(backend);
    }

    pub fn execute<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        targets: &FrameTargets,
        shadows: &ShadowPass,
        lights: &LightBuffers,
        tiled: &mut TiledPointLights,
        state: &RenderState,
    ) -> RenderResult<()> {
        profile_scope!("lighting_pass");
        let position = targets.gbuffer.view(GBUFFER_POSITION)?;
        let normal = targets.gbuffer.view(GBUFFER_NORMAL)?;
        let albedo = targets.gbuffer.view(GBUFFER_ALBEDO)?;

        for program in [&mut self.directional]
            .into_iter()
            .chain(self.area.each())
            .chain(self.tube.each())
        {
            program.bind_texture(1, position);
            program.bind_texture(2, normal);
            program.bind_texture(3, albedo);
        }
        self.directional.bind_texture(4, shadows.directional_view());
        self.directional.bind_sampler(5, shadows.sampler());
        for program in self.area.each() {
            program.bind_storage_buffer(4, lights.area_buffer());
            program.bind_texture(5, shadows.area_view());
            program.bind_sampler(6, shadows.sampler());
        }
        for program in self.tube.each() {
            program.bind_storage_buffer(4, lights.tube_buffer());
        }

        let mut pass = targets.light.pass_descriptor("Lighting", Some([0.0; 4]));
        pass.depth_stencil_attachment = Some(DepthStencilAttachment {
            view: targets.gbuffer.depth_view()?,
            depth_load_op: LoadOp::Load,
            depth_store_op: StoreOp::Store,
            depth_clear_value: 1.0,
        });
        ctx.use_target(pass);
        let result = self.draw_lights(ctx.backend_mut(), targets, tiled, state);
        ctx.unuse_target()?;
        result
    }

    fn draw_lights<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        targets: &FrameTargets,
        tiled: &mut TiledPointLights,
        state: &RenderState,
    ) -> RenderResult<()> {
        if let Some(light) = &state.lights.directional {
            self.directional.set_uniform_block(&DirectionalParams {
                view_projection: light.gpu.view_projection,
                direction_scatter: light.gpu.direction_scatter,
                color_intensity: light.gpu.color_intensity,
                options: UVec4::new(light.casts_shadow as u32, 0, 0, 0),
            })?;
            draw_fullscreen(backend, &mut self.directional)?;
        }

        tiled.composite(backend, targets)?;

        let camera = &state.camera;
        let mut volumes = 0;
        for (index, light) in state.lights.area.iter().enumerate() {
            if !light.visible {
                continue;
            }
            let program = self.area.select(light.world_aabb.contains_point(camera.position));
            draw_volume(backend, program, camera.view_projection, index as u32)?;
            volumes += 1;
        }
        for (index, light) in state.lights.tube.iter().enumerate() {
            if !light.visible {
                continue;
            }
            let program = self.tube.select(light.world_aabb.contains_point(camera.position));
            draw_volume(backend, program, camera.view_projection, index as u32)?;
            volumes += 1;
        }
        log::trace!("Lighting pass drew {volumes} light volumes");
        Ok(())
    }

    /// Per-light forward drawing of point lights
    ///
    /// Point lights are only lit by [`TiledPointLights`].
    pub fn draw_forward_point_lights(&mut self) {
        unimplemented!("point lights are lit by the tiled pass");
    }
}

fn draw_volume<B: GraphicsBackend + ?Sized>(
    backend: &mut B,
    program: &mut Program,
    view_projection: Mat4,
    index: u32,
) -> RenderResult<()> {
    program.set_uniform_block(&VolumeParams {
        view_projection,
        light_index: UVec4::new(index, 0, 0, 0),
    })?;
    program.use_program(backend)?;
    backend.draw(0..36, 0..1);
    Ok(())
}

/// Unit cube (corners at ±0.5) built from the vertex index, 36 vertices
const VOLUME_VERTEX_SHADER: &str = r#"
// corner = x + 2y + 4z, two counter-clockwise triangles per face
var<private> CUBE_INDICES: array<u32, 36> = array<u32, 36>(
    4u, 5u, 7u, 4u, 7u, 6u,
    1u, 0u, 2u, 1u, 2u, 3u,
    5u, 1u, 3u, 5u, 3u, 7u,
    0u, 4u, 6u, 0u, 6u, 2u,
    6u, 7u, 3u, 6u, 3u, 2u,
    0u, 1u, 5u, 0u, 5u, 4u,
);

struct VolumeParams {
    view_projection: mat4x4<f32>,
    // x = index into the light array
    light_index: vec4<u32>,
}

@group(0) @binding(0) var<uniform> params: VolumeParams;
@group(0) @binding(1) var gbuffer_position: texture_2d<f32>;
@group(0) @binding(2) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(3) var gbuffer_albedo: texture_2d<f32>;

fn cube_corner(vertex_index: u32) -> vec4<f32> {
    let corner = CUBE_INDICES[vertex_index];
    return vec4<f32>(
        f32(corner & 1u) - 0.5,
        f32((corner >> 1u) & 1u) - 0.5,
        f32((corner >> 2u) & 1u) - 0.5,
        1.0,
    );
}
"#;

pub const DIRECTIONAL_LIGHT_SHADER: &str = r#"
struct DirectionalParams {
    view_projection: mat4x4<f32>,
    // xyz = direction the light travels, w = scatter
    direction_scatter: vec4<f32>,
    color_intensity: vec4<f32>,
    // x = 1 when the shadow map is valid
    options: vec4<u32>,
}

@group(0) @binding(0) var<uniform> light: DirectionalParams;
@group(0) @binding(1) var gbuffer_position: texture_2d<f32>;
@group(0) @binding(2) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(3) var gbuffer_albedo: texture_2d<f32>;
@group(0) @binding(4) var shadow_map: texture_depth_2d_array;
@group(0) @binding(5) var shadow_sampler: sampler_comparison;

fn directional_shadow(world: vec3<f32>) -> f32 {
    if light.options.x == 0u {
        return 1.0;
    }
    let clip = light.view_projection * vec4<f32>(world, 1.0);
    let ndc = clip.xyz / clip.w;
    let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    if any(uv < vec2<f32>(0.0)) || any(uv > vec2<f32>(1.0)) || ndc.z > 1.0 {
        return 1.0;
    }
    return textureSampleCompareLevel(shadow_map, shadow_sampler, uv, 0, ndc.z - 0.001);
}

@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(input.position.xy);
    let position = textureLoad(gbuffer_position, pixel, 0);
    if position.w == 0.0 {
        return vec4<f32>(0.0);
    }
    let normal = normalize(textureLoad(gbuffer_normal, pixel, 0).xyz);
    let albedo = textureLoad(gbuffer_albedo, pixel, 0).rgb;
    let lambert = max(dot(normal, -light.direction_scatter.xyz), 0.0);
    let shadow = directional_shadow(position.xyz);
    let radiance = light.color_intensity.rgb * light.color_intensity.w * lambert * shadow;
    return vec4<f32>(albedo * radiance, 1.0);
}
"#;

pub const AREA_LIGHT_SHADER: &str = r#"
struct AreaLight {
    volume: mat4x4<f32>,
    view_projection: mat4x4<f32>,
    position_range: vec4<f32>,
    // xyz = emission direction
    forward_width: vec4<f32>,
    right_height: vec4<f32>,
    color_intensity: vec4<f32>,
    shadow_index: i32,
    scatter: f32,
    _padding: vec2<f32>,
}

@group(0) @binding(4) var<storage, read> lights: array<AreaLight>;
@group(0) @binding(5) var shadow_maps: texture_depth_2d_array;
@group(0) @binding(6) var shadow_sampler: sampler_comparison;

@vertex
fn vs_volume(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4<f32> {
    let light = lights[params.light_index.x];
    return params.view_projection * (light.volume * cube_corner(vertex_index));
}

fn area_shadow(light: AreaLight, world: vec3<f32>) -> f32 {
    if light.shadow_index < 0 {
        return 1.0;
    }
    let clip = light.view_projection * vec4<f32>(world, 1.0);
    let ndc = clip.xyz / clip.w;
    let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    if clip.w <= 0.0 || any(uv < vec2<f32>(0.0)) || any(uv > vec2<f32>(1.0)) {
        return 1.0;
    }
    return textureSampleCompareLevel(shadow_maps, shadow_sampler, uv, light.shadow_index, ndc.z - 0.0005);
}

@fragment
fn fs_main(@builtin(position) frag: vec4<f32>) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(frag.xy);
    let position = textureLoad(gbuffer_position, pixel, 0);
    if position.w == 0.0 {
        return vec4<f32>(0.0);
    }
    let light = lights[params.light_index.x];
    let forward = light.forward_width.xyz;
    let right = light.right_height.xyz;
    let up = cross(right, forward);
    let to_surface = position.xyz - light.position_range.xyz;
    let depth = dot(to_surface, forward);
    if depth <= 0.0 || depth > light.position_range.w {
        return vec4<f32>(0.0);
    }

    // Nearest point of the emitting rectangle
    let half_width = light.forward_width.w * 0.5;
    let half_height = light.right_height.w * 0.5;
    let nearest = light.position_range.xyz
        + right * clamp(dot(to_surface, right), -half_width, half_width)
        + up * clamp(dot(to_surface, up), -half_height, half_height);
    let to_light = nearest - position.xyz;
    let direction = to_light / max(length(to_light), 0.0001);

    let normal = normalize(textureLoad(gbuffer_normal, pixel, 0).xyz);
    let albedo = textureLoad(gbuffer_albedo, pixel, 0).rgb;
    let falloff = 1.0 - depth / light.position_range.w;
    let lambert = max(dot(normal, direction), 0.0);
    let shadow = area_shadow(light, position.xyz);
    let radiance = light.color_intensity.rgb * light.color_intensity.w * lambert * falloff * falloff * shadow;
    return vec4<f32>(albedo * radiance, 1.0);
}
"#;

pub const TUBE_LIGHT_SHADER: &str = r#"
struct TubeLight {
    volume: mat4x4<f32>,
    start_radius: vec4<f32>,
    end_length: vec4<f32>,
    color_intensity: vec4<f32>,
    scatter: f32,
    _padding0: f32,
    _padding1: f32,
    _padding2: f32,
}

@group(0) @binding(4) var<storage, read> lights: array<TubeLight>;

@vertex
fn vs_volume(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4<f32> {
    let light = lights[params.light_index.x];
    return params.view_projection * (light.volume * cube_corner(vertex_index));
}

@fragment
fn fs_main(@builtin(position) frag: vec4<f32>) -> @location(0) vec4<f32> {
    let pixel = vec2<i32>(frag.xy);
    let position = textureLoad(gbuffer_position, pixel, 0);
    if position.w == 0.0 {
        return vec4<f32>(0.0);
    }
    let light = lights[params.light_index.x];
    let start = light.start_radius.xyz;
    let axis = light.end_length.xyz - start;
    let along = clamp(dot(position.xyz - start, axis) / max(dot(axis, axis), 0.0001), 0.0, 1.0);
    let to_light = start + axis * along - position.xyz;
    let reach = length(to_light);
    let radius = light.start_radius.w;
    if reach >= radius {
        return vec4<f32>(0.0);
    }

    let normal = normalize(textureLoad(gbuffer_normal, pixel, 0).xyz);
    let albedo = textureLoad(gbuffer_albedo, pixel, 0).rgb;
    let falloff = 1.0 - reach / radius;
    let lambert = max(dot(normal, to_light / max(reach, 0.0001)), 0.0);
    let radiance = light.color_intensity.rgb * light.color_intensity.w * lambert * falloff * falloff;
    return vec4<f32>(albedo * radiance, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordedCommand;
    use crate::backend::RecordingBackend;
    use crate::light::{AreaLight, DirectionalLight, LightManager, TubeLight};
    use crate::program::reflect;
    use crate::resources::ChannelLayout;
    use crate::scene::{Scene, Transform};
    use crate::RenderConfig;
    use glam::Vec3;

    struct Fixture {
        ctx: RenderContext<RecordingBackend>,
        targets: FrameTargets,
        shadows: ShadowPass,
        buffers: LightBuffers,
        tiled: TiledPointLights,
        pass: LightingPass,
    }

    impl Fixture {
        fn new() -> Self {
            let config = RenderConfig {
                width: 32,
                height: 32,
                directional_shadow_resolution: 16,
                point_shadow_resolution: 16,
                ..Default::default()
            };
            let mut ctx = RenderContext::new(RecordingBackend::new(32, 32), config.clone());
            let backend = ctx.backend_mut();
            Self {
                targets: FrameTargets::new(backend, 32, 32).unwrap(),
                shadows: ShadowPass::new(backend, &config, ChannelLayout::standard().vertex_buffer_layout())
                    .unwrap(),
                buffers: LightBuffers::new(backend, 4).unwrap(),
                tiled: TiledPointLights::new(backend, &config).unwrap(),
                pass: LightingPass::new(backend).unwrap(),
                ctx,
            }
        }

        fn draw(&mut self, scene: &mut Scene) {
            let state = RenderState::extract(scene, &mut LightManager::default(), 1);
            self.buffers.flush(self.ctx.backend_mut(), &state.lights).unwrap();
            self.ctx.backend_mut().clear_commands();
            self.pass
                .execute(
                    &mut self.ctx,
                    &self.targets,
                    &self.shadows,
                    &self.buffers,
                    &mut self.tiled,
                    &state,
                )
                .unwrap();
        }

        fn pipelines(&self) -> Vec<(String, CullMode, Option<CompareFunction>)> {
            self.ctx
                .backend()
                .commands()
                .iter()
                .filter_map(|command| match command {
                    RecordedCommand::SetRenderPipeline {
                        label,
                        cull_mode,
                        depth_compare,
                    } => Some((label.clone(), *cull_mode, *depth_compare)),
                    _ => None,
                })
                .collect()
        }
    }

    #[test]
    fn test_shaders_validate() {
        reflect("directional", &[crate::pipeline::FULLSCREEN_VERTEX_SHADER, DIRECTIONAL_LIGHT_SHADER].concat())
            .unwrap();
        let area = reflect("area", &[VOLUME_VERTEX_SHADER, AREA_LIGHT_SHADER].concat()).unwrap();
        assert_eq!(area.uniform_size, std::mem::size_of::<VolumeParams>());
        reflect("tube", &[VOLUME_VERTEX_SHADER, TUBE_LIGHT_SHADER].concat()).unwrap();
    }

    #[test]
    fn test_volume_pipeline_follows_camera_position() {
        let mut fixture = Fixture::new();
        let mut scene = Scene::new();
        // Box spans z in [-19, 1] and holds the camera at the origin
        scene.spawn_area_light(
            Transform::from_position(Vec3::new(0.0, 0.0, 1.0)),
            AreaLight::default(),
        );
        scene.spawn_tube_light(
            Transform::from_position(Vec3::new(0.0, 0.0, -30.0)),
            TubeLight::new(Vec3::ONE, 1.0, 4.0, 1.0),
        );
        fixture.draw(&mut scene);

        let pipelines = fixture.pipelines();
        assert!(pipelines.contains(&(
            "area_light_inside".to_string(),
            CullMode::Front,
            Some(CompareFunction::GreaterEqual)
        )));
        assert!(pipelines.contains(&(
            "tube_light_outside".to_string(),
            CullMode::Back,
            Some(CompareFunction::LessEqual)
        )));
        assert_eq!(fixture.ctx.backend().render_pass_labels(), ["Lighting"]);
        assert_eq!(fixture.ctx.backend().draws_in_passes("Lighting"), 2);
    }

    #[test]
    fn test_lights_behind_camera_are_skipped() {
        let mut fixture = Fixture::new();
        let mut scene = Scene::new();
        scene.spawn_tube_light(
            Transform::from_position(Vec3::new(0.0, 0.0, 50.0)),
            TubeLight::new(Vec3::ONE, 1.0, 4.0, 1.0),
        );
        scene.spawn_directional_light(Transform::default(), DirectionalLight::default());
        fixture.draw(&mut scene);

        // Only the directional fullscreen triangle
        assert_eq!(fixture.ctx.backend().draws_in_passes("Lighting"), 1);
    }

    #[test]
    #[should_panic(expected = "tiled pass")]
    fn test_forward_point_lights_are_gone() {
        let mut backend = RecordingBackend::new(8, 8);
        LightingPass::new(&mut backend)
            .unwrap()
            .draw_forward_point_lights();
    }
}
