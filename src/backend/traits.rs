//! The seam between the renderer and a GPU API
//!
//! Every GPU call the renderer makes goes through [`GraphicsBackend`]. The wgpu backend
//! talks to a real device, the recording backend keeps everything in host memory.

use crate::backend::types::*;
use std::ops::Range;
use thiserror::Error;

/// Failures reported by a [`GraphicsBackend`]
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("backend initialisation: {0}")]
    InitializationFailed(String),
    #[error("surface setup: {0}")]
    SurfaceCreationFailed(String),
    #[error("no usable device: {0}")]
    DeviceCreationFailed(String),
    #[error("swapchain acquire: {0}")]
    AcquireImageFailed(String),
    #[error("buffer allocation: {0}")]
    BufferCreationFailed(String),
    #[error("texture allocation: {0}")]
    TextureCreationFailed(String),
    #[error("pipeline compilation: {0}")]
    PipelineCreationFailed(String),
    #[error("buffer readback: {0}")]
    ReadbackFailed(String),
    #[error("Unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("surface was lost")]
    SurfaceLost,
    #[error("device ran out of memory")]
    OutOfMemory,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Opaque id of a buffer owned by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u64);

/// A view the passes bind or render into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureViewHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPipelineHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComputePipelineHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupHandle(pub(crate) u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupLayoutHandle(pub(crate) u64);

/// What sits at one binding slot of a bind group
#[derive(Debug, Clone)]
pub enum BindGroupEntry {
    Buffer {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    Texture(TextureViewHandle),
    Sampler(SamplerHandle),
    StorageTexture(TextureViewHandle),
}

#[derive(Debug, Clone)]
pub struct BindGroupLayoutEntry {
    pub binding: u32,
    pub visibility: ShaderStageFlags,
    pub ty: BindingType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderStageFlags(u32);

impl ShaderStageFlags {
    pub const VERTEX: Self = Self(1 << 0);
    pub const FRAGMENT: Self = Self(1 << 1);
    pub const COMPUTE: Self = Self(1 << 2);
    pub const VERTEX_FRAGMENT: Self = Self((1 << 0) | (1 << 1));
    pub const ALL: Self = Self((1 << 0) | (1 << 1) | (1 << 2));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for ShaderStageFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub enum BindingType {
    UniformBuffer {
        dynamic_offset: bool,
    },
    StorageBuffer {
        read_only: bool,
    },
    Texture {
        sample_type: TextureSampleType,
        view_dimension: TextureViewDimension,
    },
    StorageTexture {
        format: TextureFormat,
    },
    Sampler {
        comparison: bool,
    },
}

impl BindingType {
    /// A plain float 2D texture, filterable or not depending on its format
    pub fn texture_2d(format: TextureFormat) -> Self {
        let sample_type = if format.is_depth() {
            TextureSampleType::Depth
        } else {
            TextureSampleType::Float {
                filterable: format.is_filterable(),
            }
        };
        BindingType::Texture {
            sample_type,
            view_dimension: TextureViewDimension::D2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureSampleType {
    Float { filterable: bool },
    Depth,
    Sint,
    Uint,
}

/// Everything needed to compile a raster pipeline
#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub label: Option<String>,
    /// WGSL source holding both entry points
    pub shader: String,
    pub vertex_entry: String,
    /// `None` for depth-only pipelines
    pub fragment_entry: Option<String>,
    pub vertex_layouts: Vec<VertexBufferLayout>,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
    pub primitive_topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub depth_stencil: Option<DepthStencilState>,
    pub color_targets: Vec<ColorTargetState>,
}

#[derive(Debug, Clone)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
}

#[derive(Debug, Clone)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub blend: Option<BlendState>,
    pub write_mask: ColorWrites,
}

impl ColorTargetState {
    pub fn replace(format: TextureFormat) -> Self {
        Self {
            format,
            blend: None,
            write_mask: ColorWrites::ALL,
        }
    }

    pub fn additive(format: TextureFormat) -> Self {
        Self {
            format,
            blend: Some(BlendState::additive()),
            write_mask: ColorWrites::ALL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorWrites(pub u32);

impl ColorWrites {
    pub const RED: Self = Self(1 << 0);
    pub const GREEN: Self = Self(1 << 1);
    pub const BLUE: Self = Self(1 << 2);
    pub const ALPHA: Self = Self(1 << 3);
    pub const ALL: Self = Self(0xF);

    pub fn bits(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub label: Option<String>,
    pub shader: String,
    pub entry_point: String,
    pub bind_group_layouts: Vec<BindGroupLayoutHandle>,
}

#[derive(Debug, Clone)]
pub struct ColorAttachment {
    pub view: TextureViewHandle,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOp {
    Clear([f32; 4]),
    Load,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    Discard,
}

#[derive(Debug, Clone)]
pub struct DepthStencilAttachment {
    pub view: TextureViewHandle,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub depth_clear_value: f32,
}

/// Attachments of one render pass
#[derive(Debug, Clone)]
pub struct RenderPassDescriptor {
    pub label: Option<String>,
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
}

/// Output of [`GraphicsBackend::begin_frame`]
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    pub swapchain_view: TextureViewHandle,
    pub width: u32,
    pub height: u32,
}

/// GPU device abstraction used by every pass
///
/// Copies, readbacks and mip generation must be issued outside of an open render or
/// compute pass. Draw and dispatch calls outside of a matching pass are ignored.
pub trait GraphicsBackend {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Resize the swapchain (or the offscreen frame target)
    fn resize(&mut self, width: u32, height: u32);

    /// Acquire the output image and open the frame encoder
    fn begin_frame(&mut self) -> BackendResult<FrameContext>;

    /// Submit recorded work and present
    fn end_frame(&mut self) -> BackendResult<()>;

    fn swapchain_format(&self) -> TextureFormat;

    /// Whether `multi_draw_indexed_indirect` is executed natively
    fn supports_multi_draw_indirect(&self) -> bool;

    // Resources

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Queue a write of `data` at `offset`
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]);

    /// Read bytes back from a buffer, waiting for all submitted work first
    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64)
        -> BackendResult<Vec<u8>>;

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    );

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle>;

    /// Write tightly packed pixel data into one layer of mip 0
    fn write_texture(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        data: &[u8],
        width: u32,
        height: u32,
    );

    /// Copy mip 0 of every layer from `src` into `dst`; both must have the same size and format
    fn copy_texture_to_texture(&mut self, src: TextureHandle, dst: TextureHandle);

    /// Fill mips 1.. of a texture by successive downsampling of mip 0
    fn generate_mipmaps(&mut self, texture: TextureHandle);

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    // Pipelines

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle>;

    /// Entries are `(binding, resource)` pairs
    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle>;

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle>;

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle>;

    // Commands

    /// Opens a render pass; it stays current until `end_render_pass`
    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor);

    fn end_render_pass(&mut self);

    fn begin_compute_pass(&mut self, label: Option<&str>);

    fn end_compute_pass(&mut self);

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle);

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle);

    /// Set a bind group, with one offset per dynamic uniform binding
    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle, dynamic_offsets: &[u32]);

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64);

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat);

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>);

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>);

    /// One [`crate::batch::DrawElementsIndirectCommand`] record read from `buffer` at `offset`
    fn draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64);

    /// Draw `count` consecutive indirect commands
    fn multi_draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64, count: u32);

    /// Dispatch `x * y * z` workgroups
    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32);

    // Cleanup

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn destroy_texture(&mut self, texture: TextureHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}
