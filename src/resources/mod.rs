//! GPU resources: buffers, geometry, render targets and textures

pub mod gpu_buffer;
pub mod mesh;
pub mod render_target;
pub mod ring_buffer;
pub mod texture;
pub mod vertex_buffer;

pub use gpu_buffer::PersistentBuffer;
pub use mesh::{Mesh, MeshVertex};
pub use render_target::{Attachment, AttachmentDesc, RenderTarget, RenderTargetBuilder, TargetStack};
pub use ring_buffer::{RingAllocation, RingBuffer};
pub use texture::{ArrayKind, TextureArray, TextureData, TextureId, TextureManager};
pub use vertex_buffer::{
    ChannelLayout, GeometryBuffers, GeometryRange, IndexBuffer, VertexBuffer, VertexChannel,
};
