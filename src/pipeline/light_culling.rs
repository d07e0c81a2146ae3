//! Tiled point lighting
//!
//! A compute pass splits the screen into square tiles. Each workgroup first
//! gathers the point lights whose projected bounds touch its tile into
//! workgroup memory, then lights its pixels from that short list. The result
//! lands in a storage texture that the lighting pass adds onto the light
//! buffer.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec4, Vec4};

use super::targets::{FrameTargets, GBUFFER_ALBEDO, GBUFFER_NORMAL, GBUFFER_POSITION, TILED};
use super::{depth_read_only, draw_fullscreen, fullscreen_program};
use crate::backend::{ColorTargetState, CompareFunction, GraphicsBackend, TextureFormat};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::frame::RenderState;
use crate::light::LightBuffers;
use crate::profiling::profile_scope;
use crate::program::Program;
use crate::{PointLightShadowTechnique, RenderConfig};

use super::shadow_pass::ShadowPass;

/// Largest tile edge; a 16x16 tile is already 256 invocations
const MAX_TILE_SIZE: u32 = 16;
/// Lights remembered per tile, further ones are dropped
const MAX_TILE_LIGHTS: u32 = 256;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct TiledParams {
    view_projection: Mat4,
    camera_position: Vec4,
    screen: Vec4,
    counts: UVec4,
}

pub struct TiledPointLights {
    culling: Program,
    composite: Program,
    tile_size: u32,
    active: bool,
}

impl TiledPointLights {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B, config: &RenderConfig) -> RenderResult<Self> {
        let tile_size = config.tile_size.clamp(1, MAX_TILE_SIZE);
        if tile_size != config.tile_size {
            log::warn!(
                "Tile size {} out of range, using {}",
                config.tile_size,
                tile_size
            );
        }
        let source = tiled_shader_source(tile_size, config.point_light_shadow_technique);
        let culling = Program::compute(backend, "tiled_point_lights", &source, "cs_main")?;
        let composite = fullscreen_program(
            backend,
            "tiled_composite",
            TILED_COMPOSITE_SHADER,
            vec![ColorTargetState::additive(TextureFormat::Rgba16Float)],
            Some(depth_read_only(CompareFunction::Always)),
        )?;
        Ok(Self {
            culling,
            composite,
            tile_size,
            active: false,
        })
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn begin_frame(&mut self) {
        self.culling.begin_frame();
        self.composite.begin_frame();
        self.active = false;
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.culling.destroy(backend);
        self.composite.destroy(backend);
    }

    /// Light every pixel from the point lights touching its tile
    pub fn dispatch<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        targets: &FrameTargets,
        shadows: &ShadowPass,
        lights: &LightBuffers,
        state: &RenderState,
    ) -> RenderResult<()> {
        profile_scope!("tiled_point_lights");
        let count = lights.point_count();
        if count == 0 {
            log::trace!("No point lights, skipping the tiled pass");
            return Ok(());
        }

        let (width, height) = targets.size();
        let camera = &state.camera;
        self.culling.set_uniform_block(&TiledParams {
            view_projection: camera.view_projection,
            camera_position: camera.position.extend(1.0),
            screen: Vec4::new(width as f32, height as f32, 0.0, 0.0),
            counts: UVec4::new(count, 0, 0, 0),
        })?;
        self.culling.bind_storage_buffer(1, lights.point_buffer());
        self.culling
            .bind_texture(2, targets.gbuffer.view(GBUFFER_POSITION)?);
        self.culling.bind_texture(3, targets.gbuffer.view(GBUFFER_NORMAL)?);
        self.culling.bind_texture(4, targets.gbuffer.view(GBUFFER_ALBEDO)?);
        self.culling
            .bind_storage_texture(5, targets.tiled.attachment(TILED)?.view);
        self.culling.bind_texture(6, shadows.point_view());
        self.culling.bind_sampler(7, shadows.sampler());

        let backend = ctx.backend_mut();
        backend.begin_compute_pass(Some("Tiled Point Lights"));
        let result = self
            .culling
            .use_program(backend)
            .and_then(|_| self.culling.dispatch_compute(backend, width, height, 1));
        backend.end_compute_pass();
        result?;

        self.active = true;
        Ok(())
    }

    /// Add the tiled result onto the bound light target
    ///
    /// Does nothing when no dispatch happened this frame.
    pub fn composite<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        targets: &FrameTargets,
    ) -> RenderResult<()> {
        if !self.active {
            return Ok(());
        }
        self.composite.bind_texture(0, targets.tiled.view(TILED)?);
        draw_fullscreen(backend, &mut self.composite)
    }
}

/// Tiled lighting compute source for the given tile edge and point shadow layout
pub fn tiled_shader_source(tile_size: u32, technique: PointLightShadowTechnique) -> String {
    let lookup = match technique {
        PointLightShadowTechnique::CubeMapArray => CUBE_SHADOW_LOOKUP,
        PointLightShadowTechnique::DualParaboloid => PARABOLOID_SHADOW_LOOKUP,
    };
    let header = format!(
        "const TILE_SIZE: u32 = {}u;\nconst MAX_TILE_LIGHTS: u32 = {}u;\n",
        tile_size.clamp(1, MAX_TILE_SIZE),
        MAX_TILE_LIGHTS
    );
    [header.as_str(), POINT_LIGHT_STRUCT, lookup, TILED_LIGHTING_SHADER].concat()
}

const POINT_LIGHT_STRUCT: &str = r#"
struct PointLight {
    position_radius: vec4<f32>,
    color_intensity: vec4<f32>,
    shadow_index: i32,
    scatter: f32,
    _padding: vec2<f32>,
}
"#;

const CUBE_SHADOW_LOOKUP: &str = r#"
@group(0) @binding(6) var point_shadows: texture_depth_cube_array;
@group(0) @binding(7) var shadow_sampler: sampler_comparison;

fn point_shadow(light: PointLight, world: vec3<f32>) -> f32 {
    if light.shadow_index < 0 {
        return 1.0;
    }
    let offset = world - light.position_radius.xyz;
    let reference = length(offset) / light.position_radius.w - 0.005;
    return textureSampleCompareLevel(point_shadows, shadow_sampler, offset, light.shadow_index, reference);
}
"#;

const PARABOLOID_SHADOW_LOOKUP: &str = r#"
@group(0) @binding(6) var point_shadows: texture_depth_2d_array;
@group(0) @binding(7) var shadow_sampler: sampler_comparison;

fn point_shadow(light: PointLight, world: vec3<f32>) -> f32 {
    if light.shadow_index < 0 {
        return 1.0;
    }
    let offset = world - light.position_radius.xyz;
    let distance = length(offset);
    let direction = offset / max(distance, 0.0001);
    // Layer 0 looks down -Z, layer 1 down +Z (mirrored in x)
    var layer = light.shadow_index * 2;
    var ndc = direction.xy / (1.0 - direction.z);
    if direction.z > 0.0 {
        layer += 1;
        ndc = vec2<f32>(-direction.x, direction.y) / (1.0 + direction.z);
    }
    let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
    let reference = distance / light.position_radius.w - 0.005;
    return textureSampleCompareLevel(point_shadows, shadow_sampler, uv, layer, reference);
}
"#;

const TILED_LIGHTING_SHADER: &str = r#"
struct TiledParams {
    view_projection: mat4x4<f32>,
    camera_position: vec4<f32>,
    // xy = target size in pixels
    screen: vec4<f32>,
    // x = point light count
    counts: vec4<u32>,
}

@group(0) @binding(0) var<uniform> params: TiledParams;
@group(0) @binding(1) var<storage, read> lights: array<PointLight>;
@group(0) @binding(2) var gbuffer_position: texture_2d<f32>;
@group(0) @binding(3) var gbuffer_normal: texture_2d<f32>;
@group(0) @binding(4) var gbuffer_albedo: texture_2d<f32>;
@group(0) @binding(5) var output: texture_storage_2d<rgba16float, write>;

var<workgroup> tile_lights: array<u32, MAX_TILE_LIGHTS>;
var<workgroup> tile_count: atomic<u32>;

// Screen-space bounds of the light's box against the tile, in [0, 1] uv
fn touches_tile(light: PointLight, tile_min: vec2<f32>, tile_max: vec2<f32>) -> bool {
    let center = light.position_radius.xyz;
    let radius = light.position_radius.w;
    if distance(center, params.camera_position.xyz) <= radius {
        return true;
    }
    var lo = vec2<f32>(1.0e9);
    var hi = vec2<f32>(-1.0e9);
    for (var corner = 0u; corner < 8u; corner++) {
        let side = vec3<f32>(
            select(-1.0, 1.0, (corner & 1u) != 0u),
            select(-1.0, 1.0, (corner & 2u) != 0u),
            select(-1.0, 1.0, (corner & 4u) != 0u),
        );
        let clip = params.view_projection * vec4<f32>(center + side * radius, 1.0);
        if clip.w <= 0.0 {
            return true;
        }
        let ndc = clip.xy / clip.w;
        let uv = vec2<f32>(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
        lo = min(lo, uv);
        hi = max(hi, uv);
    }
    return all(lo <= tile_max) && all(hi >= tile_min);
}

@compute @workgroup_size(TILE_SIZE, TILE_SIZE, 1)
fn cs_main(
    @builtin(global_invocation_id) global_id: vec3<u32>,
    @builtin(workgroup_id) group_id: vec3<u32>,
    @builtin(local_invocation_index) local_index: u32,
) {
    if local_index == 0u {
        atomicStore(&tile_count, 0u);
    }
    workgroupBarrier();

    let tile_min = vec2<f32>(group_id.xy * TILE_SIZE) / params.screen.xy;
    let tile_max = vec2<f32>((group_id.xy + 1u) * TILE_SIZE) / params.screen.xy;
    for (var i = local_index; i < params.counts.x; i += TILE_SIZE * TILE_SIZE) {
        if touches_tile(lights[i], tile_min, tile_max) {
            let slot = atomicAdd(&tile_count, 1u);
            if slot < MAX_TILE_LIGHTS {
                tile_lights[slot] = i;
            }
        }
    }
    workgroupBarrier();

    let pixel = global_id.xy;
    if pixel.x >= u32(params.screen.x) || pixel.y >= u32(params.screen.y) {
        return;
    }
    let coords = vec2<i32>(pixel);
    let position = textureLoad(gbuffer_position, coords, 0);
    if position.w == 0.0 {
        textureStore(output, coords, vec4<f32>(0.0));
        return;
    }
    let normal = normalize(textureLoad(gbuffer_normal, coords, 0).xyz);
    let albedo = textureLoad(gbuffer_albedo, coords, 0).rgb;

    var radiance = vec3<f32>(0.0);
    let count = min(atomicLoad(&tile_count), MAX_TILE_LIGHTS);
    for (var i = 0u; i < count; i++) {
        let light = lights[tile_lights[i]];
        let to_light = light.position_radius.xyz - position.xyz;
        let distance = length(to_light);
        if distance >= light.position_radius.w {
            continue;
        }
        let falloff = 1.0 - (distance * distance) / (light.position_radius.w * light.position_radius.w);
        let lambert = max(dot(normal, to_light / max(distance, 0.0001)), 0.0);
        let shadow = point_shadow(light, position.xyz);
        radiance += light.color_intensity.rgb * light.color_intensity.w * lambert * falloff * falloff * shadow;
    }
    textureStore(output, coords, vec4<f32>(albedo * radiance, 1.0));
}
"#;

pub const TILED_COMPOSITE_SHADER: &str = r#"
@group(0) @binding(0) var tiled_light: texture_2d<f32>;

@fragment
fn fs_main(input: FullscreenOutput) -> @location(0) vec4<f32> {
    return vec4<f32>(textureLoad(tiled_light, vec2<i32>(input.position.xy), 0).rgb, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordedCommand;
    use crate::backend::RecordingBackend;
    use crate::light::{LightManager, PointLight};
    use crate::program::reflect;
    use crate::resources::ChannelLayout;
    use crate::scene::{Scene, Transform};
    use glam::Vec3;

    #[test]
    fn test_both_shadow_layouts_validate() {
        for technique in [
            PointLightShadowTechnique::CubeMapArray,
            PointLightShadowTechnique::DualParaboloid,
        ] {
            let reflection = reflect("tiled", &tiled_shader_source(8, technique)).unwrap();
            assert_eq!(reflection.workgroup_size, Some([8, 8, 1]));
            assert_eq!(reflection.uniform_size, std::mem::size_of::<TiledParams>());
        }
    }

    #[test]
    fn test_tile_size_is_clamped() {
        let mut backend = RecordingBackend::new(32, 32);
        let config = RenderConfig {
            tile_size: 64,
            ..Default::default()
        };
        let tiled = TiledPointLights::new(&mut backend, &config).unwrap();
        assert_eq!(tiled.tile_size(), MAX_TILE_SIZE);
    }

    #[test]
    fn test_dispatch_covers_every_tile() {
        let config = RenderConfig {
            width: 40,
            height: 20,
            tile_size: 16,
            ..Default::default()
        };
        let mut ctx = RenderContext::new(RecordingBackend::new(40, 20), config.clone());
        let backend = ctx.backend_mut();
        let targets = FrameTargets::new(backend, 40, 20).unwrap();
        let shadows = ShadowPass::new(backend, &config, ChannelLayout::standard().vertex_buffer_layout()).unwrap();
        let mut buffers = LightBuffers::new(backend, 4).unwrap();
        let mut tiled = TiledPointLights::new(backend, &config).unwrap();

        // Without point lights nothing is dispatched or composited
        let state = RenderState::default();
        tiled
            .dispatch(&mut ctx, &targets, &shadows, &buffers, &state)
            .unwrap();
        assert!(ctx.backend().compute_pass_labels().is_empty());

        let mut scene = Scene::new();
        scene.spawn_point_light(
            Transform::from_position(Vec3::new(0.0, 0.0, -4.0)),
            PointLight::new(Vec3::ONE, 2.0, 5.0),
        );
        let state = RenderState::extract(&mut scene, &mut LightManager::default(), 1);
        buffers.flush(ctx.backend_mut(), &state.lights).unwrap();
        tiled
            .dispatch(&mut ctx, &targets, &shadows, &buffers, &state)
            .unwrap();

        let backend = ctx.backend();
        assert_eq!(backend.compute_pass_labels(), ["Tiled Point Lights"]);
        assert!(backend
            .commands()
            .contains(&RecordedCommand::Dispatch { x: 3, y: 2, z: 1 }));
    }
}
