//! Vertex, index and shared geometry buffers

use super::gpu_buffer::PersistentBuffer;
use super::mesh::Mesh;
use crate::backend::{
    BufferHandle, BufferUsage, GraphicsBackend, IndexFormat, VertexAttribute, VertexBufferLayout,
    VertexFormat, VertexStepMode,
};
use crate::error::RenderResult;

/// One attribute stream inside an interleaved vertex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexChannel {
    Position,
    Normal,
    TexCoord,
    Color,
    Tangent,
}

impl VertexChannel {
    pub fn format(&self) -> VertexFormat {
        match self {
            VertexChannel::Position | VertexChannel::Normal => VertexFormat::Float32x3,
            VertexChannel::TexCoord => VertexFormat::Float32x2,
            VertexChannel::Color | VertexChannel::Tangent => VertexFormat::Float32x4,
        }
    }
}

/// Ordered set of channels making up one vertex
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelLayout {
    channels: Vec<VertexChannel>,
}

impl ChannelLayout {
    pub fn new(channels: Vec<VertexChannel>) -> Self {
        Self { channels }
    }

    /// Position, normal and texture coordinate, matching [`MeshVertex`](super::MeshVertex)
    pub fn standard() -> Self {
        Self::new(vec![
            VertexChannel::Position,
            VertexChannel::Normal,
            VertexChannel::TexCoord,
        ])
    }

    pub fn channels(&self) -> &[VertexChannel] {
        &self.channels
    }

    /// Bytes per vertex
    pub fn stride(&self) -> u64 {
        self.channels.iter().map(|c| c.format().size()).sum()
    }

    pub fn floats_per_vertex(&self) -> usize {
        (self.stride() / 4) as usize
    }

    pub fn vertex_buffer_layout(&self) -> VertexBufferLayout {
        let mut offset = 0;
        let attributes = self
            .channels
            .iter()
            .enumerate()
            .map(|(location, channel)| {
                let attribute = VertexAttribute {
                    location: location as u32,
                    format: channel.format(),
                    offset,
                };
                offset += channel.format().size();
                attribute
            })
            .collect();
        VertexBufferLayout {
            array_stride: self.stride(),
            step_mode: VertexStepMode::Vertex,
            attributes,
        }
    }
}

/// Interleaved vertex storage
pub struct VertexBuffer {
    layout: ChannelLayout,
    data: PersistentBuffer<f32>,
    vertices_count: usize,
    triangle_count: usize,
}

impl VertexBuffer {
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        label: &str,
        layout: ChannelLayout,
        capacity_vertices: usize,
    ) -> RenderResult<Self> {
        let data = PersistentBuffer::new(
            backend,
            label,
            capacity_vertices.max(1) * layout.floats_per_vertex(),
            BufferUsage::VERTEX,
        )?;
        let mut buffer = Self {
            layout,
            data,
            vertices_count: 0,
            triangle_count: 0,
        };
        buffer.recount();
        Ok(buffer)
    }

    fn recount(&mut self) {
        self.vertices_count = (self.data.size_bytes() / self.layout.stride()) as usize;
        self.triangle_count = self.vertices_count / 3;
    }

    /// Write interleaved floats starting at vertex `first_vertex`
    pub fn put<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        first_vertex: usize,
        floats: &[f32],
    ) -> RenderResult<()> {
        let per_vertex = self.layout.floats_per_vertex();
        debug_assert_eq!(floats.len() % per_vertex, 0);
        if self.data.put(backend, first_vertex * per_vertex, floats)? {
            self.recount();
        }
        Ok(())
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    pub fn buffer(&self) -> BufferHandle {
        self.data.buffer()
    }

    /// Vertices the current allocation can hold
    pub fn vertices_count(&self) -> usize {
        self.vertices_count
    }

    /// Triangles the current allocation can hold when drawn unindexed
    pub fn triangle_count(&self) -> usize {
        self.triangle_count
    }

    pub fn reallocation_count(&self) -> usize {
        self.data.reallocation_count()
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.data.destroy(backend);
    }
}

/// 32-bit index storage
pub struct IndexBuffer {
    data: PersistentBuffer<u32>,
}

impl IndexBuffer {
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        label: &str,
        capacity: usize,
    ) -> RenderResult<Self> {
        Ok(Self {
            data: PersistentBuffer::new(backend, label, capacity, BufferUsage::INDEX)?,
        })
    }

    pub fn put<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        offset: usize,
        indices: &[u32],
    ) -> RenderResult<()> {
        self.data.put(backend, offset, indices)?;
        Ok(())
    }

    pub fn buffer(&self) -> BufferHandle {
        self.data.buffer()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn triangle_count(&self) -> usize {
        self.data.len() / 3
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.data.destroy(backend);
    }
}

/// Where a mesh landed inside [`GeometryBuffers`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GeometryRange {
    pub first_index: u32,
    pub index_count: u32,
    pub base_vertex: i32,
}

/// One vertex and one index buffer shared by every mesh
pub struct GeometryBuffers {
    vertices: VertexBuffer,
    indices: IndexBuffer,
    next_vertex: usize,
    next_index: usize,
}

impl GeometryBuffers {
    pub fn new<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        capacity_vertices: usize,
        capacity_indices: usize,
    ) -> RenderResult<Self> {
        Ok(Self {
            vertices: VertexBuffer::new(
                backend,
                "geometry_vertices",
                ChannelLayout::standard(),
                capacity_vertices,
            )?,
            indices: IndexBuffer::new(backend, "geometry_indices", capacity_indices)?,
            next_vertex: 0,
            next_index: 0,
        })
    }

    /// Append a mesh, growing the buffers as needed
    pub fn append_mesh<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        mesh: &Mesh,
    ) -> RenderResult<GeometryRange> {
        let range = GeometryRange {
            first_index: self.next_index as u32,
            index_count: mesh.index_count() as u32,
            base_vertex: self.next_vertex as i32,
        };
        self.vertices
            .put(backend, self.next_vertex, mesh.vertex_floats())?;
        self.indices.put(backend, self.next_index, &mesh.indices)?;
        self.next_vertex += mesh.vertex_count();
        self.next_index += mesh.index_count();
        Ok(range)
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        self.vertices.destroy(backend);
        self.indices.destroy(backend);
    }

    /// Bind both buffers for indexed drawing; call inside a render pass
    pub fn bind<B: GraphicsBackend + ?Sized>(&self, backend: &mut B) {
        backend.set_vertex_buffer(0, self.vertices.buffer(), 0);
        backend.set_index_buffer(self.indices.buffer(), 0, IndexFormat::Uint32);
    }

    pub fn vertex_layout(&self) -> VertexBufferLayout {
        self.vertices.layout().vertex_buffer_layout()
    }

    pub fn vertices(&self) -> &VertexBuffer {
        &self.vertices
    }

    pub fn indices(&self) -> &IndexBuffer {
        &self.indices
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;

    #[test]
    fn test_standard_layout() {
        let layout = ChannelLayout::standard();
        assert_eq!(layout.stride(), 32);
        let vbl = layout.vertex_buffer_layout();
        assert_eq!(vbl.attributes[1].offset, 12);
        assert_eq!(vbl.attributes[2].offset, 24);
        assert_eq!(vbl.attributes[2].location, 2);
    }

    #[test]
    fn test_counts_follow_capacity() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut vb =
            VertexBuffer::new(&mut backend, "vb", ChannelLayout::standard(), 6).unwrap();
        assert_eq!(vb.vertices_count(), 6);
        assert_eq!(vb.triangle_count(), 2);

        let floats = vec![0.0f32; 8 * 10];
        vb.put(&mut backend, 0, &floats).unwrap();
        assert_eq!(vb.vertices_count(), 12);
        assert_eq!(vb.triangle_count(), 4);
        assert_eq!(vb.reallocation_count(), 1);
    }

    #[test]
    fn test_append_mesh_ranges() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut geometry = GeometryBuffers::new(&mut backend, 16, 16).unwrap();
        let first = geometry.append_mesh(&mut backend, &Mesh::cube()).unwrap();
        let second = geometry.append_mesh(&mut backend, &Mesh::cube()).unwrap();
        assert_eq!(first.index_count, 36);
        assert_eq!(second.first_index, 36);
        assert_eq!(second.base_vertex, 24);
        assert_eq!(geometry.indices().triangle_count(), 24);
    }
}
