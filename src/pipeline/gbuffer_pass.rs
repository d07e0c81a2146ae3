//! G-Buffer (first) pass
//!
//! Renders the sky and then every visible batch to multiple render targets:
//! - World position (w = 1 for geometry, 0 for sky)
//! - World normal
//! - Albedo from the material table
//! - Screen-space motion against the previous frame
//! - Depth

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, UVec4, Vec4};

use super::targets::FrameTargets;
use super::{FirstPassResult, ENTITY_RECORD_STRUCT};
use crate::backend::{
    BufferUsage, ColorTargetState, CompareFunction, CullMode, DepthStencilState, FrontFace,
    GraphicsBackend, PrimitiveTopology, RenderPipelineDescriptor, TextureFormat,
    VertexBufferLayout,
};
use crate::batch::{self, Culling, IndirectDrawList};
use crate::context::RenderContext;
use crate::error::RenderResult;
use crate::frame::RenderState;
use crate::profiling::profile_scope;
use crate::program::Program;
use crate::resources::{GeometryBuffers, PersistentBuffer};
use crate::scene::EntityRecord;

const GBUFFER_FORMATS: [TextureFormat; 4] = [
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba16Float,
    TextureFormat::Rgba8Unorm,
    TextureFormat::Rgba16Float,
];

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct GeometryParams {
    view_projection: Mat4,
    previous_view_projection: Mat4,
    camera_position: Vec4,
    options: UVec4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SkyParams {
    color: Vec4,
}

pub struct GBufferPass {
    sky: Program,
    geometry: Program,
    indirect: IndirectDrawList,
    materials: PersistentBuffer<Vec4>,
}

impl GBufferPass {
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        vertex_layout: VertexBufferLayout,
    ) -> RenderResult<Self> {
        let color_targets: Vec<_> = GBUFFER_FORMATS
            .iter()
            .map(|format| ColorTargetState::replace(*format))
            .collect();

        let sky = Program::render(
            backend,
            RenderPipelineDescriptor {
                label: Some("sky".into()),
                shader: SKY_SHADER.into(),
                vertex_entry: "vs_sky".into(),
                fragment_entry: Some("fs_sky".into()),
                vertex_layouts: vec![],
                bind_group_layouts: vec![],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::None,
                depth_stencil: Some(DepthStencilState {
                    format: TextureFormat::Depth32Float,
                    depth_write_enabled: false,
                    depth_compare: CompareFunction::LessEqual,
                }),
                color_targets: color_targets.clone(),
            },
        )?;

        let geometry = Program::render(
            backend,
            RenderPipelineDescriptor {
                label: Some("gbuffer".into()),
                shader: [ENTITY_RECORD_STRUCT, GBUFFER_SHADER].concat(),
                vertex_entry: "vs_main".into(),
                fragment_entry: Some("fs_main".into()),
                vertex_layouts: vec![vertex_layout],
                bind_group_layouts: vec![],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::Back,
                depth_stencil: Some(DepthStencilState {
                    format: TextureFormat::Depth32Float,
                    depth_write_enabled: true,
                    depth_compare: CompareFunction::Less,
                }),
                color_targets,
            },
        )?;

        let mut materials = PersistentBuffer::new(backend, "materials", 16, BufferUsage::STORAGE)?;
        materials.put(backend, 0, &[Vec4::ONE])?;

        Ok(Self {
            sky,
            geometry,
            indirect: IndirectDrawList::new(backend, 256)?,
            materials,
        })
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.sky.destroy(backend);
        self.geometry.destroy(backend);
        self.indirect.destroy(backend);
        self.materials.destroy(backend);
    }

    /// Replace the material table; an empty table falls back to plain white
    pub fn set_materials<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        colors: &[Vec4],
    ) -> RenderResult<()> {
        self.materials.clear();
        if colors.is_empty() {
            self.materials.put(backend, 0, &[Vec4::ONE])?;
        } else {
            self.materials.put(backend, 0, colors)?;
        }
        Ok(())
    }

    pub fn begin_frame(&mut self) {
        self.sky.begin_frame();
        self.geometry.begin_frame();
    }

    pub fn execute<B: GraphicsBackend + 'static>(
        &mut self,
        ctx: &mut RenderContext<B>,
        targets: &FrameTargets,
        geometry: &GeometryBuffers,
        records: &PersistentBuffer<EntityRecord>,
        state: &RenderState,
        multi_draw_indirect: bool,
    ) -> RenderResult<FirstPassResult> {
        profile_scope!("gbuffer_pass");
        let camera = state.camera.uniform_data();

        if multi_draw_indirect {
            self.indirect
                .build(ctx.backend_mut(), &state.batches, Culling::MainCamera)?;
        }

        self.sky.set_uniform_block(&SkyParams {
            color: state.sky_color.extend(1.0),
        })?;
        self.geometry.set_uniform_block(&GeometryParams {
            view_projection: camera.view_proj,
            previous_view_projection: camera.prev_view_proj,
            camera_position: camera.position,
            options: UVec4::new(multi_draw_indirect as u32, 0, 0, 0),
        })?;
        self.geometry.bind_storage_buffer(1, records.buffer());
        self.geometry
            .bind_storage_buffer(2, self.indirect.entity_indices().buffer());
        self.geometry.bind_storage_buffer(3, self.materials.buffer());

        ctx.use_target(targets.gbuffer.pass_descriptor("G-Buffer", Some([0.0; 4])));
        let backend = ctx.backend_mut();
        self.sky.use_program(backend)?;
        backend.draw(0..3, 0..1);

        let mut result = FirstPassResult::default();
        if multi_draw_indirect {
            if !self.indirect.is_empty() {
                self.geometry.use_program(backend)?;
                geometry.bind(backend);
                self.indirect.submit(backend, true);
                result.vertices_drawn = self.indirect.vertex_count() as u64;
                result.entities_drawn = self.indirect.len();
            }
        } else {
            let mut batches = state.batches.clone();
            batch::sort_front_to_back(&mut batches);
            for batch in &batches {
                let vertices =
                    batch::draw_batch(backend, geometry, batch, Some(&mut self.geometry), Culling::MainCamera);
                if vertices > 0 {
                    result.vertices_drawn += vertices as u64;
                    result.entities_drawn += 1;
                }
            }
        }
        ctx.unuse_target()?;

        log::trace!(
            "G-Buffer: {} entities, {} vertices",
            result.entities_drawn,
            result.vertices_drawn
        );
        Ok(result)
    }
}

pub const SKY_SHADER: &str = r#"
struct SkyParams {
    color: vec4<f32>,
}

struct GBufferOutput {
    @location(0) position: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) albedo: vec4<f32>,
    @location(3) motion: vec4<f32>,
}

@group(0) @binding(0) var<uniform> sky: SkyParams;

// Fullscreen triangle on the far plane
@vertex
fn vs_sky(@builtin(vertex_index) vertex_index: u32) -> @builtin(position) vec4<f32> {
    let x = f32((vertex_index << 1u) & 2u);
    let y = f32(vertex_index & 2u);
    return vec4<f32>(x * 2.0 - 1.0, y * 2.0 - 1.0, 1.0, 1.0);
}

@fragment
fn fs_sky() -> GBufferOutput {
    var output: GBufferOutput;
    output.position = vec4<f32>(0.0);
    output.normal = vec4<f32>(0.0);
    output.albedo = vec4<f32>(sky.color.rgb, 1.0);
    output.motion = vec4<f32>(0.0);
    return output;
}
"#;

pub const GBUFFER_SHADER: &str = r#"
struct GeometryParams {
    view_projection: mat4x4<f32>,
    previous_view_projection: mat4x4<f32>,
    camera_position: vec4<f32>,
    // x = 1 when instances index the indirect entity table
    options: vec4<u32>,
}

@group(0) @binding(0) var<uniform> params: GeometryParams;
@group(0) @binding(1) var<storage, read> records: array<EntityRecord>;
@group(0) @binding(2) var<storage, read> indirect_indices: array<u32>;
@group(0) @binding(3) var<storage, read> materials: array<vec4<f32>>;

struct VertexInput {
    @location(0) position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) uv: vec2<f32>,
    @builtin(instance_index) instance: u32,
}

struct VertexOutput {
    @builtin(position) clip: vec4<f32>,
    @location(0) world_position: vec3<f32>,
    @location(1) normal: vec3<f32>,
    @location(2) current: vec4<f32>,
    @location(3) previous: vec4<f32>,
    @location(4) @interpolate(flat) material: u32,
    @location(5) @interpolate(flat) flags: u32,
}

struct GBufferOutput {
    @location(0) position: vec4<f32>,
    @location(1) normal: vec4<f32>,
    @location(2) albedo: vec4<f32>,
    @location(3) motion: vec4<f32>,
}

@vertex
fn vs_main(input: VertexInput) -> VertexOutput {
    var record_index = input.instance;
    if params.options.x == 1u {
        record_index = indirect_indices[input.instance];
    }
    let record = records[record_index];
    let world = record.model * vec4<f32>(input.position, 1.0);
    let previous_world = record.previous_model * vec4<f32>(input.position, 1.0);

    var output: VertexOutput;
    output.clip = params.view_projection * world;
    output.world_position = world.xyz;
    output.normal = (record.model * vec4<f32>(input.normal, 0.0)).xyz;
    output.current = output.clip;
    output.previous = params.previous_view_projection * previous_world;
    output.material = record.material_index;
    output.flags = record.flags;
    return output;
}

@fragment
fn fs_main(input: VertexOutput) -> GBufferOutput {
    let last_material = arrayLength(&materials) - 1u;
    var albedo = materials[min(input.material, last_material)].rgb;
    // Selected entities get a highlight tint
    if (input.flags & 1u) != 0u {
        albedo = mix(albedo, vec3<f32>(1.0, 0.6, 0.1), 0.35);
    }

    let current = input.current.xy / input.current.w;
    let previous = input.previous.xy / input.previous.w;

    var output: GBufferOutput;
    output.position = vec4<f32>(input.world_position, 1.0);
    output.normal = vec4<f32>(normalize(input.normal), 0.0);
    output.albedo = vec4<f32>(albedo, 1.0);
    output.motion = vec4<f32>((current - previous) * 0.5, 0.0, 0.0);
    return output;
}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::batch::RenderBatch;
    use crate::program::reflect;
    use crate::resources::Mesh;
    use crate::RenderConfig;

    fn setup(config: RenderConfig) -> (RenderContext<RecordingBackend>, FrameTargets, GeometryBuffers, PersistentBuffer<EntityRecord>, GBufferPass, RenderBatch) {
        let mut ctx = RenderContext::new(RecordingBackend::new(32, 32), config);
        let backend = ctx.backend_mut();
        let targets = FrameTargets::new(backend, 32, 32).unwrap();
        let mut geometry = GeometryBuffers::new(backend, 64, 64).unwrap();
        let range = geometry.append_mesh(backend, &Mesh::cube()).unwrap();
        let records = PersistentBuffer::new(backend, "records", 4, BufferUsage::STORAGE).unwrap();
        let pass = GBufferPass::new(backend, geometry.vertex_layout()).unwrap();
        let batch = RenderBatch {
            index_count: range.index_count,
            first_index: range.first_index,
            base_vertex: range.base_vertex,
            ..Default::default()
        };
        (ctx, targets, geometry, records, pass, batch)
    }

    #[test]
    fn test_shaders_validate() {
        reflect("sky", SKY_SHADER).unwrap();
        let reflection = reflect("gbuffer", &[ENTITY_RECORD_STRUCT, GBUFFER_SHADER].concat()).unwrap();
        assert_eq!(reflection.uniform_size, std::mem::size_of::<GeometryParams>());
    }

    #[test]
    fn test_invisible_batches_draw_nothing() {
        let (mut ctx, targets, geometry, records, mut pass, batch) = setup(RenderConfig::default());
        let state = RenderState {
            batches: vec![
                batch.clone(),
                RenderBatch {
                    visible_for_camera: false,
                    ..batch.clone()
                },
                RenderBatch {
                    visible: false,
                    ..batch
                },
            ],
            ..Default::default()
        };

        let result = pass
            .execute(&mut ctx, &targets, &geometry, &records, &state, false)
            .unwrap();
        assert_eq!(result.entities_drawn, 1);
        assert_eq!(result.vertices_drawn, 36);
        // Sky plus one batch
        assert_eq!(ctx.backend().draws_in_passes("G-Buffer"), 2);
    }

    #[test]
    fn test_indirect_path_counts_the_same() {
        let (mut ctx, targets, geometry, records, mut pass, batch) = setup(RenderConfig::default());
        let state = RenderState {
            batches: vec![
                batch.clone(),
                RenderBatch {
                    instance_count: 2,
                    ..batch.clone()
                },
                RenderBatch {
                    visible: false,
                    ..batch
                },
            ],
            ..Default::default()
        };
        let result = pass
            .execute(&mut ctx, &targets, &geometry, &records, &state, true)
            .unwrap();
        assert_eq!(result.entities_drawn, 2);
        assert_eq!(result.vertices_drawn, 36 * 3);
    }
}
