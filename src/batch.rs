//! Per-frame draw records and their submission
//!
//! A [`RenderBatch`] describes one instanced indexed draw. Batches are built
//! fresh during extraction and thrown away once the frame is drawn.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::backend::{BufferUsage, GraphicsBackend};
use crate::error::RenderResult;
use crate::frustum::Aabb;
use crate::program::Program;
use crate::resources::{GeometryBuffers, PersistentBuffer};

/// One instanced draw of a model
#[derive(Debug, Clone, PartialEq)]
pub struct RenderBatch {
    /// Index into the material table
    pub material_index: u32,
    /// First record of this batch in the entity buffer; instances follow it
    pub entity_buffer_index: u32,
    pub visible: bool,
    pub visible_for_camera: bool,
    pub selected: bool,
    pub draw_lines: bool,
    /// World position relative to the camera, used for sorting
    pub camera_relative_position: Vec3,
    pub instance_count: u32,
    pub index_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub world_aabb: Aabb,
    pub sphere_center: Vec3,
    pub sphere_radius: f32,
}

impl Default for RenderBatch {
    fn default() -> Self {
        Self {
            material_index: 0,
            entity_buffer_index: 0,
            visible: true,
            visible_for_camera: true,
            selected: false,
            draw_lines: false,
            camera_relative_position: Vec3::ZERO,
            instance_count: 1,
            index_count: 0,
            first_index: 0,
            base_vertex: 0,
            world_aabb: Aabb::new(Vec3::ZERO, Vec3::ZERO),
            sphere_center: Vec3::ZERO,
            sphere_radius: 0.0,
        }
    }
}

impl RenderBatch {
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn is_visible_for_camera(&self) -> bool {
        self.visible_for_camera
    }

    /// Vertices this batch submits when drawn
    pub fn vertex_count(&self) -> u32 {
        self.index_count * self.instance_count
    }

    pub fn indirect_command(&self) -> DrawElementsIndirectCommand {
        DrawElementsIndirectCommand {
            count: self.index_count,
            instance_count: self.instance_count,
            first_index: self.first_index,
            base_vertex: self.base_vertex,
            base_instance: self.entity_buffer_index,
        }
    }
}

/// Which visibility gates a draw honours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Culling {
    /// Skip batches outside the main camera
    MainCamera,
    /// Only the visibility flag counts; used by shadow passes
    IgnoreCamera,
}

/// Whether a batch passes the gates for the given culling mode
pub fn should_draw(batch: &RenderBatch, culling: Culling) -> bool {
    batch.is_visible() && (culling == Culling::IgnoreCamera || batch.is_visible_for_camera())
}

/// Submit one batch and return the number of vertices drawn.
///
/// Nothing is submitted, and 0 returned, when the batch fails its visibility
/// gates, when there is no program, or when the program cannot be bound.
pub fn draw_batch<B: GraphicsBackend + ?Sized>(
    backend: &mut B,
    geometry: &GeometryBuffers,
    batch: &RenderBatch,
    program: Option<&mut Program>,
    culling: Culling,
) -> u32 {
    if !should_draw(batch, culling) {
        return 0;
    }
    let Some(program) = program else {
        return 0;
    };
    if let Err(e) = program.use_program(backend) {
        log::warn!("Skipping batch, program '{}' unusable: {}", program.label(), e);
        return 0;
    }
    geometry.bind(backend);
    let first_instance = batch.entity_buffer_index;
    backend.draw_indexed(
        batch.first_index..batch.first_index + batch.index_count,
        batch.base_vertex,
        first_instance..first_instance + batch.instance_count,
    );
    batch.vertex_count()
}

/// Sort opaque batches nearest first
pub fn sort_front_to_back(batches: &mut [RenderBatch]) {
    batches.sort_by(|a, b| {
        a.camera_relative_position
            .length_squared()
            .total_cmp(&b.camera_relative_position.length_squared())
    });
}

/// Arguments of one indexed indirect draw, laid out as the GPU reads them
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawElementsIndirectCommand {
    pub count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub base_vertex: i32,
    pub base_instance: u32,
}

impl DrawElementsIndirectCommand {
    pub const SIZE: u64 = std::mem::size_of::<Self>() as u64;
}

/// Indirect commands for a set of batches plus the entity index table their
/// `base_instance` values point into
pub struct IndirectDrawList {
    commands: PersistentBuffer<DrawElementsIndirectCommand>,
    entity_indices: PersistentBuffer<u32>,
    count: u32,
    vertices: u32,
}

impl IndirectDrawList {
    pub fn new<B: GraphicsBackend + ?Sized>(backend: &mut B, capacity: usize) -> RenderResult<Self> {
        Ok(Self {
            commands: PersistentBuffer::new(
                backend,
                "indirect_commands",
                capacity,
                BufferUsage::INDIRECT | BufferUsage::STORAGE,
            )?,
            entity_indices: PersistentBuffer::new(
                backend,
                "indirect_entity_indices",
                capacity,
                BufferUsage::STORAGE,
            )?,
            count: 0,
            vertices: 0,
        })
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.commands.destroy(backend);
        self.entity_indices.destroy(backend);
    }

    /// Rebuild the commands from the batches that pass `culling`
    ///
    /// Each command's `base_instance` indexes the side table, which maps every
    /// instance back to its record in the entity buffer.
    pub fn build<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        batches: &[RenderBatch],
        culling: Culling,
    ) -> RenderResult<()> {
        let mut commands = Vec::new();
        let mut entity_indices = Vec::new();
        let mut vertices = 0;
        for batch in batches.iter().filter(|b| should_draw(b, culling)) {
            let mut command = batch.indirect_command();
            command.base_instance = entity_indices.len() as u32;
            entity_indices
                .extend((0..batch.instance_count).map(|i| batch.entity_buffer_index + i));
            commands.push(command);
            vertices += batch.vertex_count();
        }

        self.commands.clear();
        self.entity_indices.clear();
        self.commands.put(backend, 0, &commands)?;
        self.entity_indices.put(backend, 0, &entity_indices)?;
        self.count = commands.len() as u32;
        self.vertices = vertices;
        Ok(())
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Vertices covered by the current commands
    pub fn vertex_count(&self) -> u32 {
        self.vertices
    }

    pub fn entity_indices(&self) -> &PersistentBuffer<u32> {
        &self.entity_indices
    }

    pub fn commands(&self) -> &PersistentBuffer<DrawElementsIndirectCommand> {
        &self.commands
    }

    /// Submit every command: one multi-draw when allowed and supported,
    /// otherwise one indirect draw per command
    pub fn submit<B: GraphicsBackend + ?Sized>(&self, backend: &mut B, allow_multi_draw: bool) {
        if self.count == 0 {
            return;
        }
        if allow_multi_draw && backend.supports_multi_draw_indirect() {
            backend.multi_draw_indexed_indirect(self.commands.buffer(), 0, self.count);
        } else {
            for i in 0..self.count as u64 {
                backend
                    .draw_indexed_indirect(self.commands.buffer(), i * DrawElementsIndirectCommand::SIZE);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordedCommand;
    use crate::backend::{
        ColorTargetState, CullMode, FrontFace, PrimitiveTopology, RecordingBackend,
        RenderPassDescriptor, RenderPipelineDescriptor, TextureFormat,
    };
    use crate::resources::Mesh;

    const SHADER: &str = r#"
@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return vec4<f32>(1.0);
}
"#;

    fn setup() -> (RecordingBackend, GeometryBuffers, Program, RenderBatch) {
        let mut backend = RecordingBackend::new(4, 4);
        let mut geometry = GeometryBuffers::new(&mut backend, 64, 64).unwrap();
        let range = geometry.append_mesh(&mut backend, &Mesh::cube()).unwrap();
        let program = Program::render(
            &mut backend,
            RenderPipelineDescriptor {
                label: Some("flat".into()),
                shader: SHADER.into(),
                vertex_entry: "vs_main".into(),
                fragment_entry: Some("fs_main".into()),
                vertex_layouts: vec![geometry.vertex_layout()],
                bind_group_layouts: vec![],
                primitive_topology: PrimitiveTopology::TriangleList,
                front_face: FrontFace::Ccw,
                cull_mode: CullMode::Back,
                depth_stencil: None,
                color_targets: vec![ColorTargetState::replace(TextureFormat::Rgba8Unorm)],
            },
        )
        .unwrap();
        let batch = RenderBatch {
            entity_buffer_index: 5,
            instance_count: 3,
            index_count: range.index_count,
            first_index: range.first_index,
            base_vertex: range.base_vertex,
            ..Default::default()
        };
        (backend, geometry, program, batch)
    }

    fn begin(backend: &mut RecordingBackend) {
        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("test".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
    }

    #[test]
    fn test_visible_batch_draws_all_instances() {
        let (mut backend, geometry, mut program, batch) = setup();
        begin(&mut backend);
        let drawn = draw_batch(&mut backend, &geometry, &batch, Some(&mut program), Culling::MainCamera);
        assert_eq!(drawn, 36 * 3);
        assert!(backend.commands().contains(&RecordedCommand::DrawIndexed {
            indices: 0..36,
            base_vertex: 0,
            instances: 5..8,
        }));
    }

    #[test]
    fn test_hidden_batches_draw_nothing() {
        let (mut backend, geometry, mut program, batch) = setup();
        begin(&mut backend);

        let hidden = RenderBatch {
            visible: false,
            ..batch.clone()
        };
        let outside = RenderBatch {
            visible_for_camera: false,
            ..batch.clone()
        };
        assert_eq!(
            draw_batch(&mut backend, &geometry, &hidden, Some(&mut program), Culling::IgnoreCamera),
            0
        );
        assert_eq!(
            draw_batch(&mut backend, &geometry, &outside, Some(&mut program), Culling::MainCamera),
            0
        );
        assert_eq!(draw_batch(&mut backend, &geometry, &batch, None, Culling::MainCamera), 0);
        assert_eq!(backend.draw_call_count(), 0);

        // Shadow passes ignore the camera gate
        assert_eq!(
            draw_batch(&mut backend, &geometry, &outside, Some(&mut program), Culling::IgnoreCamera),
            108
        );
    }

    #[test]
    fn test_indirect_list_maps_instances_to_entities() {
        let (mut backend, _, _, batch) = setup();
        let second = RenderBatch {
            entity_buffer_index: 20,
            instance_count: 2,
            ..batch.clone()
        };
        let hidden = RenderBatch {
            visible: false,
            ..batch.clone()
        };
        let mut list = IndirectDrawList::new(&mut backend, 1).unwrap();
        list.build(&mut backend, &[batch, hidden, second], Culling::MainCamera)
            .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.vertex_count(), 36 * 5);

        let commands = list.commands().get_values(&mut backend, 0..2).unwrap();
        assert_eq!(commands[0].base_instance, 0);
        assert_eq!(commands[1].base_instance, 3);
        let indices = list.entity_indices().get_values(&mut backend, 0..5).unwrap();
        assert_eq!(indices, vec![5, 6, 7, 20, 21]);
    }

    #[test]
    fn test_indirect_submit_falls_back_to_single_draws() {
        let (_, _, _, batch) = setup();
        let mut backend = RecordingBackend::new(4, 4).without_multi_draw_indirect();
        let mut list = IndirectDrawList::new(&mut backend, 4).unwrap();
        list.build(&mut backend, &[batch.clone(), batch], Culling::MainCamera)
            .unwrap();

        begin(&mut backend);
        list.submit(&mut backend, true);
        backend.end_render_pass();
        let singles = backend
            .commands()
            .iter()
            .filter(|c| matches!(c, RecordedCommand::DrawIndexedIndirect { .. }))
            .count();
        assert_eq!(singles, 2);
    }

    #[test]
    fn test_front_to_back_sort() {
        let mut batches: Vec<RenderBatch> = [5.0, -1.0, 3.0]
            .iter()
            .map(|z| RenderBatch {
                camera_relative_position: Vec3::new(0.0, 0.0, *z),
                ..Default::default()
            })
            .collect();
        sort_front_to_back(&mut batches);
        let order: Vec<f32> = batches.iter().map(|b| b.camera_relative_position.z).collect();
        assert_eq!(order, vec![-1.0, 3.0, 5.0]);
    }
}
