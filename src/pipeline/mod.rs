//! Deferred frame pipeline
//!
//! [`DrawStrategy::draw`] runs the stages of one frame in order:
//! 1. G-Buffer pass - sky plus every visible batch into position, normal, albedo and motion
//! 2. Shadow passes - directional, area and point shadow maps, redrawn only when stale
//! 3. Lighting pass - directional, tiled point, area and tube lights into the light buffer
//! 4. Ambient pass - half resolution ambient occlusion and directional scattering
//! 5. Reflection pass - screen-space reflections over last frame's snapshot
//! 6. Combine pass - everything merged into the mipmapped HDR target
//! 7. Post-processing - auto exposure, motion blur and tone mapping to the output

mod ambient_pass;
mod combine_pass;
mod gbuffer_pass;
mod light_culling;
mod lighting_pass;
pub mod postprocess;
mod reflection_pass;
mod shadow_pass;
mod targets;

pub use ambient_pass::{AmbientPass, AMBIENT_SHADER};
pub use combine_pass::{CombinePass, COMBINE_SHADER};
pub use gbuffer_pass::{GBufferPass, GBUFFER_SHADER, SKY_SHADER};
pub use light_culling::{TiledPointLights, TILED_COMPOSITE_SHADER};
pub use lighting_pass::{
    LightingPass, AREA_LIGHT_SHADER, DIRECTIONAL_LIGHT_SHADER, TUBE_LIGHT_SHADER,
};
pub use postprocess::PostProcess;
pub use reflection_pass::{ReflectionPass, REFLECTION_SHADER};
pub use shadow_pass::{ShadowPass, SHADOW_SHADER};
pub use targets::FrameTargets;

use glam::Vec4;

use crate::backend::{
    BufferUsage, ColorTargetState, CompareFunction, CullMode, DepthStencilState, FrontFace, GraphicsBackend,
    PrimitiveTopology, RenderPipelineDescriptor, TextureFormat, TextureViewHandle,
};
use crate::context::RenderContext;
use crate::error::{RenderError, RenderResult};
use crate::frame::RenderState;
use crate::light::LightBuffers;
use crate::profiling::{profile_scope, FrameProfiler};
use crate::program::Program;
use crate::resources::{GeometryBuffers, GeometryRange, Mesh, PersistentBuffer, RenderTarget};
use crate::scene::EntityRecord;
use crate::{frame_mark, RenderConfig};

/// Fullscreen triangle shared by every screen-space pass
pub const FULLSCREEN_VERTEX_SHADER: &str = r#"
struct FullscreenOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_fullscreen(@builtin(vertex_index) vertex_index: u32) -> FullscreenOutput {
    var output: FullscreenOutput;
    let x = f32((vertex_index << 1u) & 2u);
    let y = f32(vertex_index & 2u);
    output.position = vec4<f32>(x * 2.0 - 1.0, y * 2.0 - 1.0, 0.0, 1.0);
    output.uv = vec2<f32>(x, 1.0 - y);
    return output;
}
"#;

/// Entity record layout as stored in the entity buffer
pub const ENTITY_RECORD_STRUCT: &str = r#"
struct EntityRecord {
    model: mat4x4<f32>,
    previous_model: mat4x4<f32>,
    material_index: u32,
    flags: u32,
    _padding: vec2<u32>,
}
"#;

/// Totals of the G-Buffer pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirstPassResult {
    pub vertices_drawn: u64,
    pub entities_drawn: u32,
}

/// Statistics of one drawn frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrawResult {
    pub vertices_drawn: u64,
    pub entities_drawn: u32,
    pub shadow_maps_rendered: u32,
    /// Per-stage CPU timings when profiling is enabled
    pub profiling: Option<String>,
}

/// Build a program drawing one fullscreen triangle with `fragment` as its fragment stage
pub(crate) fn fullscreen_program<B: GraphicsBackend + ?Sized>(
    backend: &mut B,
    label: &str,
    fragment: &str,
    color_targets: Vec<ColorTargetState>,
    depth_stencil: Option<DepthStencilState>,
) -> RenderResult<Program> {
    Program::render(
        backend,
        RenderPipelineDescriptor {
            label: Some(label.to_string()),
            shader: [FULLSCREEN_VERTEX_SHADER, fragment].concat(),
            vertex_entry: "vs_fullscreen".into(),
            fragment_entry: Some("fs_main".into()),
            vertex_layouts: vec![],
            bind_group_layouts: vec![],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::None,
            depth_stencil,
            color_targets,
        },
    )
}

/// Depth state for passes that test against the G-Buffer depth without writing it
pub(crate) fn depth_read_only(depth_compare: CompareFunction) -> DepthStencilState {
    DepthStencilState {
        format: TextureFormat::Depth32Float,
        depth_write_enabled: false,
        depth_compare,
    }
}

pub(crate) fn draw_fullscreen<B: GraphicsBackend + ?Sized>(
    backend: &mut B,
    program: &mut Program,
) -> RenderResult<()> {
    program.use_program(backend)?;
    backend.draw(0..3, 0..1);
    Ok(())
}

/// Owns every pass, target and GPU buffer of the frame pipeline
pub struct DrawStrategy {
    targets: FrameTargets,
    geometry: GeometryBuffers,
    entity_records: PersistentBuffer<EntityRecord>,
    lights: LightBuffers,
    gbuffer: GBufferPass,
    shadows: ShadowPass,
    tiled: TiledPointLights,
    lighting: LightingPass,
    ambient: AmbientPass,
    reflections: ReflectionPass,
    combine: CombinePass,
    postprocess: PostProcess,
    profiler: FrameProfiler,
}

impl DrawStrategy {
    pub fn new<B: GraphicsBackend + 'static>(ctx: &mut RenderContext<B>) -> RenderResult<Self> {
        let config = ctx.config().clone();
        let backend = ctx.backend_mut();

        let targets = FrameTargets::new(backend, config.width, config.height)?;
        let geometry = GeometryBuffers::new(backend, 4096, 4096 * 3)?;
        let vertex_layout = geometry.vertex_layout();
        let entity_records =
            PersistentBuffer::new(backend, "entity_records", 256, BufferUsage::STORAGE)?;
        let lights = LightBuffers::new(backend, config.max_point_lights as usize)?;

        let strategy = Self {
            gbuffer: GBufferPass::new(backend, vertex_layout.clone())?,
            shadows: ShadowPass::new(backend, &config, vertex_layout)?,
            tiled: TiledPointLights::new(backend, &config)?,
            lighting: LightingPass::new(backend)?,
            ambient: AmbientPass::new(backend)?,
            reflections: ReflectionPass::new(backend)?,
            combine: CombinePass::new(backend)?,
            postprocess: PostProcess::new(backend)?,
            profiler: FrameProfiler::new(config.profiling),
            targets,
            geometry,
            entity_records,
            lights,
        };
        log::info!(
            "Draw strategy ready at {}x{} ({:?} point shadows)",
            config.width,
            config.height,
            config.point_light_shadow_technique
        );
        Ok(strategy)
    }

    pub fn targets(&self) -> &FrameTargets {
        &self.targets
    }

    pub fn geometry(&self) -> &GeometryBuffers {
        &self.geometry
    }

    pub fn shadows(&self) -> &ShadowPass {
        &self.shadows
    }

    pub fn light_buffers(&self) -> &LightBuffers {
        &self.lights
    }

    /// Upload a mesh into the shared geometry buffers
    pub fn upload_mesh<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        mesh: &Mesh,
    ) -> RenderResult<GeometryRange> {
        self.geometry.append_mesh(ctx.backend_mut(), mesh)
    }

    /// Replace the material color table indexed by `material_index`
    pub fn set_materials<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        colors: &[Vec4],
    ) -> RenderResult<()> {
        self.gbuffer.set_materials(ctx.backend_mut(), colors)
    }

    /// Force the light buffers to upload on the next draw
    pub fn mark_lights_dirty(&mut self) {
        self.lights.mark_dirty();
    }

    /// Draw one frame of `state` into `target`, or into the swapchain when `None`
    pub fn draw<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        target: Option<&RenderTarget>,
        state: &RenderState,
    ) -> RenderResult<DrawResult> {
        profile_scope!("draw");
        ctx.run_gpu_tasks();
        let config = ctx.config().clone();
        let frame = ctx.backend_mut().begin_frame()?;
        self.prepare(ctx, &config, state)?;

        self.profiler.begin("first pass");
        let first = self.gbuffer.execute(
            ctx,
            &self.targets,
            &self.geometry,
            &self.entity_records,
            state,
            config.multi_draw_indirect,
        )?;

        self.profiler.begin("shadows");
        let shadow_maps_rendered = if config.use_direct_texture_output {
            log::debug!("Direct texture output, skipping shadow passes");
            0
        } else {
            self.shadows
                .execute(ctx, &self.geometry, &self.entity_records, state)?
        };

        self.profiler.begin("lighting");
        self.tiled
            .dispatch(ctx, &self.targets, &self.shadows, &self.lights, state)?;
        self.lighting.execute(
            ctx,
            &self.targets,
            &self.shadows,
            &self.lights,
            &mut self.tiled,
            state,
        )?;

        self.profiler.begin("ambient");
        self.ambient
            .execute(ctx, &self.targets, &self.shadows, state, &config)?;

        self.profiler.begin("reflections");
        self.reflections
            .execute(ctx, &self.targets, state, config.use_gi)?;

        self.profiler.begin("combine");
        self.combine.execute(ctx, &self.targets, state, &config)?;

        self.profiler.begin("post process");
        let output = match target {
            Some(target) => output_view(target)?,
            None => (frame.swapchain_view, ctx.backend().swapchain_format()),
        };
        self.postprocess
            .execute(ctx, &self.targets, output, state, &config)?;
        self.profiler.end();

        ctx.backend_mut().end_frame()?;
        ctx.end_frame();
        frame_mark!();

        let result = DrawResult {
            vertices_drawn: first.vertices_drawn,
            entities_drawn: first.entities_drawn,
            shadow_maps_rendered,
            profiling: self.profiler.summary(),
        };
        log::trace!(
            "Frame {} drawn: {} vertices, {} entities, {} shadow maps",
            state.cycle,
            result.vertices_drawn,
            result.entities_drawn,
            result.shadow_maps_rendered
        );
        Ok(result)
    }

    /// Resize targets, recycle uniform rings and upload per-frame buffers
    fn prepare<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        config: &RenderConfig,
        state: &RenderState,
    ) -> RenderResult<()> {
        let backend = ctx.backend_mut();
        if self.targets.size() != (config.width, config.height) {
            self.targets.resize(backend, config.width, config.height)?;
        }

        self.profiler.reset();
        self.gbuffer.begin_frame();
        self.shadows.begin_frame();
        self.tiled.begin_frame();
        self.lighting.begin_frame();
        self.ambient.begin_frame();
        self.reflections.begin_frame();
        self.combine.begin_frame();
        self.postprocess.begin_frame();

        self.entity_records.clear();
        self.entity_records.put(backend, 0, &state.entity_records)?;
        if self.lights.flush(backend, &state.lights)? {
            log::debug!("Light buffers grew, bind groups will be rebuilt");
        }
        Ok(())
    }

    pub fn destroy<B: GraphicsBackend + 'static>(self, ctx: &mut RenderContext<B>) {
        let backend = ctx.backend_mut();
        self.targets.destroy(backend);
        self.geometry.destroy(backend);
        self.entity_records.destroy(backend);
        self.lights.destroy(backend);
        self.gbuffer.destroy(backend);
        self.shadows.destroy(backend);
        self.tiled.destroy(backend);
        self.lighting.destroy(backend);
        self.ambient.destroy(backend);
        self.reflections.destroy(backend);
        self.combine.destroy(backend);
        self.postprocess.destroy(backend);
    }
}

/// First color attachment of `target`, which receives the tone-mapped image
fn output_view(target: &RenderTarget) -> RenderResult<(TextureViewHandle, TextureFormat)> {
    target
        .color_attachments()
        .first()
        .map(|attachment| (attachment.view, attachment.desc.format))
        .ok_or_else(|| RenderError::MissingAttachment(target.label().to_string(), "color".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FilterMode, RecordingBackend};
    use crate::light::{DirectionalLight, LightManager, PointLight};
    use crate::scene::{Model, Scene, Transform};
    use glam::Vec3;

    struct Fixture {
        ctx: RenderContext<RecordingBackend>,
        strategy: DrawStrategy,
        scene: Scene,
        lights: LightManager,
    }

    impl Fixture {
        fn new(config: RenderConfig) -> Self {
            let mut ctx = RenderContext::new(RecordingBackend::new(32, 32), config.clone());
            let mut strategy = DrawStrategy::new(&mut ctx).unwrap();
            let mesh = Mesh::cube();
            let range = strategy.upload_mesh(&mut ctx, &mesh).unwrap();

            let mut scene = Scene::new();
            scene.spawn_model(
                Transform::from_position(Vec3::new(0.0, 0.0, -5.0)),
                Model {
                    geometry: range,
                    material_index: 0,
                    local_bounds: mesh.bounds().unwrap_or_default(),
                },
            );
            scene.spawn_directional_light(Transform::default(), DirectionalLight::default());
            Self {
                ctx,
                strategy,
                scene,
                lights: LightManager::new(config.point_light_shadow_technique),
            }
        }

        fn frame(&mut self, cycle: u64) -> DrawResult {
            let state = RenderState::extract(&mut self.scene, &mut self.lights, cycle);
            self.ctx.backend_mut().clear_commands();
            self.strategy.draw(&mut self.ctx, None, &state).unwrap()
        }
    }

    fn small_config() -> RenderConfig {
        RenderConfig {
            width: 32,
            height: 32,
            directional_shadow_resolution: 64,
            point_shadow_resolution: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_stages_run_in_order() {
        let mut fixture = Fixture::new(small_config());
        let result = fixture.frame(1);
        assert_eq!(result.entities_drawn, 1);
        assert_eq!(result.vertices_drawn, 36);
        assert_eq!(result.shadow_maps_rendered, 1);
        assert!(result.profiling.is_none());

        let backend = fixture.ctx.backend();
        assert_eq!(
            backend.render_pass_labels(),
            [
                "G-Buffer",
                "Shadow Directional",
                "Lighting",
                "Ambient",
                "Reflections",
                "Combine",
                "Post Process"
            ]
        );
        assert_eq!(backend.compute_pass_labels(), ["Auto Exposure"]);
        assert_eq!(backend.frames_presented(), 1);
    }

    #[test]
    fn test_unchanged_scene_skips_shadow_maps() {
        let mut fixture = Fixture::new(small_config());
        assert_eq!(fixture.frame(1).shadow_maps_rendered, 1);

        let result = fixture.frame(2);
        assert_eq!(result.shadow_maps_rendered, 0);
        assert_eq!(fixture.ctx.backend().draws_in_passes("Shadow"), 0);
        assert_eq!(result.entities_drawn, 1);
    }

    #[test]
    fn test_direct_texture_output_skips_shadows() {
        let mut fixture = Fixture::new(RenderConfig {
            use_direct_texture_output: true,
            ..small_config()
        });
        let result = fixture.frame(1);
        assert_eq!(result.shadow_maps_rendered, 0);
        assert!(!fixture
            .ctx
            .backend()
            .render_pass_labels()
            .iter()
            .any(|label| label.starts_with("Shadow")));
    }

    #[test]
    fn test_point_lights_use_the_tiled_pass() {
        let mut fixture = Fixture::new(small_config());
        fixture.scene.spawn_point_light(
            Transform::from_position(Vec3::new(0.0, 2.0, -5.0)),
            PointLight::new(Vec3::ONE, 4.0, 10.0),
        );
        fixture.frame(1);
        let backend = fixture.ctx.backend();
        assert_eq!(
            backend.compute_pass_labels(),
            ["Tiled Point Lights", "Auto Exposure"]
        );
        // Directional light plus the tiled composite
        assert_eq!(backend.draws_in_passes("Lighting"), 2);
    }

    #[test]
    fn test_draw_into_caller_target() {
        let mut fixture = Fixture::new(RenderConfig {
            profiling: true,
            ..small_config()
        });
        let target = RenderTarget::builder("output", 32, 32)
            .color("color", TextureFormat::Rgba8Unorm, FilterMode::Linear)
            .build(fixture.ctx.backend_mut())
            .unwrap();

        let state = RenderState::extract(&mut fixture.scene, &mut fixture.lights, 1);
        let result = fixture
            .strategy
            .draw(&mut fixture.ctx, Some(&target), &state)
            .unwrap();
        assert!(result.profiling.unwrap().contains("first pass"));
        assert_eq!(fixture.ctx.backend().draws_in_passes("Post Process"), 1);
    }

    #[test]
    fn test_destroy_releases_every_buffer() {
        let mut fixture = Fixture::new(small_config());
        fixture.scene.spawn_point_light(
            Transform::from_position(Vec3::new(0.0, 2.0, -5.0)),
            PointLight::new(Vec3::ONE, 4.0, 10.0),
        );
        fixture.frame(1);
        assert!(fixture.ctx.backend().live_buffers() > 0);

        let Fixture { mut ctx, strategy, .. } = fixture;
        strategy.destroy(&mut ctx);
        assert_eq!(ctx.backend().live_buffers(), 0);
    }

    #[test]
    fn test_target_without_color_is_rejected() {
        let mut fixture = Fixture::new(small_config());
        let target = RenderTarget::builder("depth_only", 32, 32)
            .depth(TextureFormat::Depth32Float)
            .build(fixture.ctx.backend_mut())
            .unwrap();
        let state = RenderState::extract(&mut fixture.scene, &mut fixture.lights, 1);
        let err = fixture
            .strategy
            .draw(&mut fixture.ctx, Some(&target), &state)
            .unwrap_err();
        assert!(matches!(err, RenderError::MissingAttachment(..)));
    }
}
