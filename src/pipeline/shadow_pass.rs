//! Shadow map passes
//!
//! Every shadow map remembers the cycle it was last rendered in and is only
//! redrawn when the geometry or its light moved after that. Directional and
//! area maps hold plain depth; point maps hold the distance to the light
//! divided by its radius, either as cube map faces or as two paraboloids.

use std::collections::HashMap;

use bevy_ecs::entity::Entity;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3, Vec4};

use super::ENTITY_RECORD_STRUCT;
use crate::backend::{
    CompareFunction, CullMode, DepthStencilAttachment, DepthStencilState, FrontFace,
    GraphicsBackend, LoadOp, PrimitiveTopology, RenderPassDescriptor, RenderPipelineDescriptor,
    SamplerDescriptor, SamplerHandle, StoreOp, TextureFormat, TextureViewHandle,
    VertexBufferLayout,
};
use crate::batch::{self, Culling, RenderBatch};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::frame::RenderState;
use crate::frustum::Frustum;
use crate::light::ShadowTracker;
use crate::profiling::profile_scope;
use crate::program::Program;
use crate::resources::{ArrayKind, GeometryBuffers, PersistentBuffer, TextureArray};
use crate::scene::EntityRecord;
use crate::{
    PointLightShadowTechnique, RenderConfig, AREALIGHT_SHADOWMAP_RESOLUTION,
    MAX_AREALIGHT_SHADOWMAPS, MAX_POINTLIGHT_SHADOWMAPS,
};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct ShadowParams {
    view_projection: Mat4,
    light: Vec4,
}

/// Shadow state of a light holding a slot in a shadow array
#[derive(Debug, Clone, Copy)]
struct SlotTracker {
    slot: usize,
    tracker: ShadowTracker,
}

impl SlotTracker {
    /// Tracker for `slot`, reset when the light was moved to another slot
    fn for_slot(&mut self, slot: usize) -> &mut ShadowTracker {
        if self.slot != slot {
            self.slot = slot;
            self.tracker.invalidate();
        }
        &mut self.tracker
    }
}

pub struct ShadowPass {
    technique: PointLightShadowTechnique,
    directional_map: TextureArray,
    area_maps: TextureArray,
    point_maps: TextureArray,
    sampler: SamplerHandle,
    depth: Program,
    point: Program,
    directional: Option<(Entity, ShadowTracker)>,
    areas: HashMap<Entity, SlotTracker>,
    points: HashMap<Entity, SlotTracker>,
}

impl ShadowPass {
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        config: &RenderConfig,
        vertex_layout: VertexBufferLayout,
    ) -> RenderResult<Self> {
        let technique = config.point_light_shadow_technique;
        let point_kind = match technique {
            PointLightShadowTechnique::CubeMapArray => ArrayKind::CubeMaps,
            PointLightShadowTechnique::DualParaboloid => ArrayKind::Paraboloids,
        };
        let shader = [ENTITY_RECORD_STRUCT, SHADOW_SHADER].concat();

        let depth = Program::render(
            backend,
            shadow_pipeline("shadow_depth", &shader, "vs_main", None, CullMode::Back, vertex_layout.clone()),
        )?;
        let point_entry = match technique {
            PointLightShadowTechnique::CubeMapArray => "vs_cube",
            PointLightShadowTechnique::DualParaboloid => "vs_paraboloid",
        };
        let point = Program::render(
            backend,
            shadow_pipeline(
                "shadow_point",
                &shader,
                point_entry,
                Some("fs_distance"),
                CullMode::None,
                vertex_layout,
            ),
        )?;

        Ok(Self {
            technique,
            directional_map: TextureArray::new(
                backend,
                "directional_shadow",
                ArrayKind::Layers2D,
                1,
                config.directional_shadow_resolution.max(1),
                TextureFormat::Depth32Float,
            )?,
            area_maps: TextureArray::new(
                backend,
                "area_shadows",
                ArrayKind::Layers2D,
                MAX_AREALIGHT_SHADOWMAPS as u32,
                AREALIGHT_SHADOWMAP_RESOLUTION,
                TextureFormat::Depth32Float,
            )?,
            point_maps: TextureArray::new(
                backend,
                "point_shadows",
                point_kind,
                MAX_POINTLIGHT_SHADOWMAPS as u32,
                config.point_shadow_resolution.max(1),
                TextureFormat::Depth32Float,
            )?,
            sampler: backend.create_sampler(&SamplerDescriptor::shadow())?,
            depth,
            point,
            directional: None,
            areas: HashMap::new(),
            points: HashMap::new(),
        })
    }

    pub fn technique(&self) -> PointLightShadowTechnique {
        self.technique
    }

    pub fn directional_view(&self) -> TextureViewHandle {
        self.directional_map.array_view()
    }

    pub fn area_view(&self) -> TextureViewHandle {
        self.area_maps.array_view()
    }

    /// Cube array or paraboloid 2D array, depending on the technique
    pub fn point_view(&self) -> TextureViewHandle {
        self.point_maps.array_view()
    }

    /// Comparison sampler for every shadow array
    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    pub fn begin_frame(&mut self) {
        self.depth.begin_frame();
        self.point.begin_frame();
    }

    /// Redraw the stale shadow maps of `state` and return how many were drawn
    pub fn execute<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        geometry: &GeometryBuffers,
        records: &PersistentBuffer<EntityRecord>,
        state: &RenderState,
    ) -> RenderResult<u32> {
        profile_scope!("shadow_pass");
        self.depth.bind_storage_buffer(1, records.buffer());
        self.point.bind_storage_buffer(1, records.buffer());
        let entity_moved = state.entity_moved_in_cycle;
        let mut rendered = 0;

        match &state.lights.directional {
            Some(light) if light.casts_shadow => {
                if self.directional.map(|(entity, _)| entity) != Some(light.entity) {
                    self.directional = Some((light.entity, ShadowTracker::new()));
                }
                if let Some((_, tracker)) = &mut self.directional {
                    if tracker.needs_redraw(entity_moved, light.moved_in_cycle) {
                        let view_projection = light.gpu.view_projection;
                        let frustum = Frustum::from_matrix(&view_projection);
                        let view = self.directional_map.layer_view(0, 0);
                        render_layer(
                            ctx,
                            &mut self.depth,
                            geometry,
                            &state.batches,
                            "Shadow Directional".into(),
                            view,
                            ShadowParams {
                                view_projection,
                                light: Vec4::ZERO,
                            },
                            |batch| frustum.aabb_in_frustum(&batch.world_aabb),
                        )?;
                        tracker.mark_rendered(state.cycle);
                        rendered += 1;
                    } else {
                        log::trace!("Directional shadow current, skipping");
                    }
                }
            }
            _ => self.directional = None,
        }

        self.areas.retain(|entity, _| {
            state
                .lights
                .area
                .iter()
                .any(|light| light.entity == *entity && light.shadow_slot.is_some())
        });
        for light in &state.lights.area {
            let (Some(slot), Some(&view_projection)) =
                (light.shadow_slot, light.shadow_matrices.first())
            else {
                continue;
            };
            let tracker = self
                .areas
                .entry(light.entity)
                .or_insert(SlotTracker {
                    slot,
                    tracker: ShadowTracker::new(),
                })
                .for_slot(slot);
            if !tracker.needs_redraw(entity_moved, light.moved_in_cycle) {
                continue;
            }
            let frustum = Frustum::from_matrix(&view_projection);
            render_layer(
                ctx,
                &mut self.depth,
                geometry,
                &state.batches,
                format!("Shadow Area {slot}"),
                self.area_maps.layer_view(slot as u32, 0),
                ShadowParams {
                    view_projection,
                    light: Vec4::ZERO,
                },
                |batch| frustum.aabb_in_frustum(&batch.world_aabb),
            )?;
            tracker.mark_rendered(state.cycle);
            rendered += 1;
        }

        self.points.retain(|entity, _| {
            state
                .lights
                .point
                .iter()
                .any(|light| light.entity == *entity && light.shadow_slot.is_some())
        });
        for light in &state.lights.point {
            let Some(slot) = light.shadow_slot else {
                continue;
            };
            let tracker = self
                .points
                .entry(light.entity)
                .or_insert(SlotTracker {
                    slot,
                    tracker: ShadowTracker::new(),
                })
                .for_slot(slot);
            if !tracker.needs_redraw(entity_moved, light.moved_in_cycle) {
                continue;
            }

            let position_radius = light.gpu.position_radius;
            let (position, radius) = (position_radius.truncate(), position_radius.w.max(1e-4));
            for (layer, &matrix) in light.shadow_matrices.iter().enumerate() {
                let label = format!("Shadow Point {slot} Layer {layer}");
                let view = self.point_maps.layer_view(slot as u32, layer as u32);
                let params = ShadowParams {
                    view_projection: matrix,
                    light: position.extend(radius),
                };
                match self.technique {
                    PointLightShadowTechnique::CubeMapArray => {
                        let frustum = Frustum::from_matrix(&matrix);
                        render_layer(ctx, &mut self.point, geometry, &state.batches, label, view, params, |batch| {
                            frustum.aabb_in_frustum(&batch.world_aabb)
                        })?;
                    }
                    PointLightShadowTechnique::DualParaboloid => {
                        render_layer(ctx, &mut self.point, geometry, &state.batches, label, view, params, |batch| {
                            within_reach(batch, position, radius)
                        })?;
                    }
                }
            }
            tracker.mark_rendered(state.cycle);
            rendered += 1;
        }

        if rendered > 0 {
            log::debug!("Rendered {rendered} shadow maps in cycle {}", state.cycle);
        }
        Ok(rendered)
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.directional_map.destroy(backend);
        self.area_maps.destroy(backend);
        self.point_maps.destroy(backend);
        self.depth.destroy(backend);
        self.point.destroy(backend);
    }
}

fn shadow_pipeline(
    label: &str,
    shader: &str,
    vertex_entry: &str,
    fragment_entry: Option<&str>,
    cull_mode: CullMode,
    vertex_layout: VertexBufferLayout,
) -> RenderPipelineDescriptor {
    RenderPipelineDescriptor {
        label: Some(label.into()),
        shader: shader.into(),
        vertex_entry: vertex_entry.into(),
        fragment_entry: fragment_entry.map(Into::into),
        vertex_layouts: vec![vertex_layout],
        bind_group_layouts: vec![],
        primitive_topology: PrimitiveTopology::TriangleList,
        front_face: FrontFace::Ccw,
        cull_mode,
        depth_stencil: Some(DepthStencilState {
            format: TextureFormat::Depth32Float,
            depth_write_enabled: true,
            depth_compare: CompareFunction::Less,
        }),
        color_targets: vec![],
    }
}

fn within_reach(batch: &RenderBatch, position: Vec3, radius: f32) -> bool {
    batch.sphere_center.distance(position) <= radius + batch.sphere_radius
}

/// Clear one shadow layer and draw every batch `reaches` accepts into it
#[allow(clippy::too_many_arguments)]
fn render_layer<B: GraphicsBackend + 'static>(
    ctx: &mut RenderContext<B>,
    program: &mut Program,
    geometry: &GeometryBuffers,
    batches: &[RenderBatch],
    label: String,
    view: Option<TextureViewHandle>,
    params: ShadowParams,
    reaches: impl Fn(&RenderBatch) -> bool,
) -> RenderResult<()> {
    let Some(view) = view else {
        log::warn!("{label}: no such shadow layer");
        return Ok(());
    };
    program.set_uniform_block(&params)?;

    ctx.use_target(RenderPassDescriptor {
        label: Some(label),
        color_attachments: vec![],
        depth_stencil_attachment: Some(DepthStencilAttachment {
            view,
            depth_load_op: LoadOp::Clear([1.0; 4]),
            depth_store_op: StoreOp::Store,
            depth_clear_value: 1.0,
        }),
    });
    let backend = ctx.backend_mut();
    for batch in batches.iter().filter(|batch| reaches(batch)) {
        batch::draw_batch(backend, geometry, batch, Some(&mut *program), Culling::IgnoreCamera);
    }
    ctx.unuse_target()
}

pub const SHADOW_SHADER: &str = r#"
struct ShadowParams {
    view_projection: mat4x4<f32>,
    // xyz = light position, w = radius; point lights only
    light: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: ShadowParams;
@group(0) @binding(1) var<storage, read> records: array<EntityRecord>;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @builtin(instance_index) instance: u32,
}

struct DistanceOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    // Negative behind a paraboloid
    @location(1) hemisphere: f32,
}

fn world_position(input: VertexInput) -> vec4<f32> {
    return records[input.instance].model * vec4<f32>(input.position, 1.0);
}

@vertex
fn vs_main(input: VertexInput) -> @builtin(position) vec4<f32> {
    return params.view_projection * world_position(input);
}

@vertex
fn vs_cube(input: VertexInput) -> DistanceOutput {
    let world = world_position(input);
    var output: DistanceOutput;
    output.clip = params.view_projection * world;
    output.world_position = world.xyz;
    output.hemisphere = 1.0;
    return output;
}

// params.view_projection holds the paraboloid view only
@vertex
fn vs_paraboloid(input: VertexInput) -> DistanceOutput {
    let world = world_position(input);
    let view = (params.view_projection * world).xyz;
    let distance = length(view);
    let direction = view / max(distance, 0.0001);
    let facing = -direction.z;

    var output: DistanceOutput;
    output.clip = vec4<f32>(direction.xy / (1.0 + facing), distance / params.light.w, 1.0);
    output.world_position = world.xyz;
    output.hemisphere = facing;
    return output;
}

@fragment
fn fs_distance(input: DistanceOutput) -> @builtin(frag_depth) f32 {
    if input.hemisphere < 0.0 {
        discard;
    }
    return clamp(distance(input.world_position, params.light.xyz) / params.light.w, 0.0, 1.0);
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferUsage, RecordingBackend};
    use crate::light::{AreaLight, DirectionalLight, LightManager, PointLight};
    use crate::program::reflect;
    use crate::resources::Mesh;
    use crate::scene::{Model, Scene, Transform};

    struct Fixture {
        ctx: RenderContext<RecordingBackend>,
        geometry: GeometryBuffers,
        records: PersistentBuffer<EntityRecord>,
        pass: ShadowPass,
        scene: Scene,
        lights: LightManager,
        cube: Entity,
    }

    impl Fixture {
        fn new(technique: PointLightShadowTechnique) -> Self {
            let config = RenderConfig {
                width: 32,
                height: 32,
                point_light_shadow_technique: technique,
                directional_shadow_resolution: 64,
                point_shadow_resolution: 16,
                ..Default::default()
            };
            let mut ctx = RenderContext::new(RecordingBackend::new(32, 32), config.clone());
            let backend = ctx.backend_mut();
            let mut geometry = GeometryBuffers::new(backend, 64, 64).unwrap();
            let mesh = Mesh::cube();
            let range = geometry.append_mesh(backend, &mesh).unwrap();
            let records = PersistentBuffer::new(backend, "records", 4, BufferUsage::STORAGE).unwrap();
            let pass = ShadowPass::new(backend, &config, geometry.vertex_layout()).unwrap();

            let mut scene = Scene::new();
            let cube = scene.spawn_model(
                Transform::from_position(Vec3::new(0.0, 0.0, -5.0)),
                Model {
                    geometry: range,
                    material_index: 0,
                    local_bounds: mesh.bounds().unwrap_or_default(),
                },
            );
            Self {
                ctx,
                geometry,
                records,
                pass,
                scene,
                lights: LightManager::new(technique),
                cube,
            }
        }

        fn frame(&mut self, cycle: u64) -> u32 {
            let state = RenderState::extract(&mut self.scene, &mut self.lights, cycle);
            self.ctx.backend_mut().clear_commands();
            self.records
                .put(self.ctx.backend_mut(), 0, &state.entity_records)
                .unwrap();
            self.pass
                .execute(&mut self.ctx, &self.geometry, &self.records, &state)
                .unwrap()
        }
    }

    #[test]
    fn test_shader_validates() {
        let reflection = reflect("shadow", &[ENTITY_RECORD_STRUCT, SHADOW_SHADER].concat()).unwrap();
        assert_eq!(reflection.uniform_size, std::mem::size_of::<ShadowParams>());
    }

    #[test]
    fn test_current_shadow_map_is_skipped() {
        let mut fixture = Fixture::new(PointLightShadowTechnique::CubeMapArray);
        fixture
            .scene
            .spawn_directional_light(Transform::default(), DirectionalLight::default());

        assert_eq!(fixture.frame(1), 1);
        assert_eq!(fixture.ctx.backend().render_pass_labels(), ["Shadow Directional"]);
        assert_eq!(fixture.ctx.backend().draws_in_passes("Shadow"), 1);

        // Nothing moved: the skip path issues no pass and no draw
        assert_eq!(fixture.frame(2), 0);
        assert!(fixture.ctx.backend().render_pass_labels().is_empty());
        assert_eq!(fixture.ctx.backend().draw_call_count(), 0);

        let cube = fixture.cube;
        fixture
            .scene
            .set_transform(cube, Transform::from_position(Vec3::new(1.0, 0.0, -5.0)));
        assert_eq!(fixture.frame(3), 1);
        assert_eq!(fixture.ctx.backend().draws_in_passes("Shadow"), 1);
    }

    #[test]
    fn test_hidden_or_removed_caster_redraws_shadow_map() {
        let mut fixture = Fixture::new(PointLightShadowTechnique::CubeMapArray);
        fixture
            .scene
            .spawn_directional_light(Transform::default(), DirectionalLight::default());
        assert_eq!(fixture.frame(1), 1);
        assert_eq!(fixture.frame(2), 0);

        let cube = fixture.cube;
        fixture.scene.set_visible(cube, false);
        assert_eq!(fixture.frame(3), 1);
        assert_eq!(fixture.ctx.backend().draws_in_passes("Shadow"), 0);

        // Same visibility again changes nothing
        fixture.scene.set_visible(cube, false);
        assert_eq!(fixture.frame(4), 0);

        fixture.scene.set_visible(cube, true);
        assert_eq!(fixture.frame(5), 1);
        assert_eq!(fixture.ctx.backend().draws_in_passes("Shadow"), 1);

        fixture.scene.despawn(cube);
        assert_eq!(fixture.frame(6), 1);
        assert_eq!(fixture.ctx.backend().draws_in_passes("Shadow"), 0);
        assert_eq!(fixture.frame(7), 0);
    }

    #[test]
    fn test_cube_point_light_renders_six_layers() {
        let mut fixture = Fixture::new(PointLightShadowTechnique::CubeMapArray);
        fixture.scene.spawn_point_light(
            Transform::from_position(Vec3::new(0.0, 0.0, -2.0)),
            PointLight::new(Vec3::ONE, 1.0, 10.0),
        );

        assert_eq!(fixture.frame(1), 1);
        let labels = fixture.ctx.backend().render_pass_labels();
        assert_eq!(labels.len(), 6);
        assert_eq!(labels[0], "Shadow Point 0 Layer 0");
        assert_eq!(labels[5], "Shadow Point 0 Layer 5");
        // The cube sits behind the light along -Z, so exactly one face sees it
        assert_eq!(fixture.ctx.backend().draws_in_passes("Shadow Point"), 1);

        assert_eq!(fixture.frame(2), 0);
    }

    #[test]
    fn test_paraboloid_point_light_renders_two_layers() {
        let mut fixture = Fixture::new(PointLightShadowTechnique::DualParaboloid);
        fixture.scene.spawn_point_light(
            Transform::from_position(Vec3::new(0.0, 0.0, -2.0)),
            PointLight::new(Vec3::ONE, 1.0, 10.0),
        );

        assert_eq!(fixture.frame(1), 1);
        assert_eq!(fixture.ctx.backend().render_pass_labels().len(), 2);
        assert_eq!(fixture.ctx.backend().draws_in_passes("Shadow Point"), 2);
    }

    #[test]
    fn test_only_capped_area_lights_get_maps() {
        let mut fixture = Fixture::new(PointLightShadowTechnique::CubeMapArray);
        for i in 0..MAX_AREALIGHT_SHADOWMAPS + 3 {
            fixture.scene.spawn_area_light(
                Transform::from_position(Vec3::new(i as f32, 0.0, 0.0)),
                AreaLight::default(),
            );
        }
        assert_eq!(fixture.frame(1), MAX_AREALIGHT_SHADOWMAPS as u32);
        assert_eq!(fixture.frame(2), 0);
    }
}
