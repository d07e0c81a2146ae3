//! Recording backend for tests and tools.
//!
//! This backend doesn't talk to a GPU. Buffer and texture contents live in host
//! memory, so writes, copies and readbacks behave like the real thing, and every
//! pass, pipeline bind, draw and dispatch is appended to a command log that tests
//! can inspect.

use std::collections::HashMap;
use std::ops::Range;

use crate::backend::traits::*;
use crate::backend::types::*;

/// One entry in the command log
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BeginRenderPass {
        label: String,
        color_attachments: usize,
        clears: bool,
    },
    EndRenderPass,
    BeginComputePass {
        label: String,
    },
    EndComputePass,
    SetRenderPipeline {
        label: String,
        cull_mode: CullMode,
        depth_compare: Option<CompareFunction>,
    },
    SetComputePipeline {
        label: String,
    },
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        base_vertex: i32,
        instances: Range<u32>,
    },
    DrawIndexedIndirect {
        buffer: BufferHandle,
        offset: u64,
    },
    MultiDrawIndexedIndirect {
        buffer: BufferHandle,
        offset: u64,
        count: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
    WriteBuffer {
        buffer: BufferHandle,
        offset: u64,
        len: usize,
    },
    CopyBuffer {
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    },
    CopyTexture {
        src: TextureHandle,
        dst: TextureHandle,
    },
    GenerateMipmaps(TextureHandle),
}

impl RecordedCommand {
    /// Whether this command rasterizes anything
    pub fn is_draw(&self) -> bool {
        matches!(
            self,
            RecordedCommand::Draw { .. }
                | RecordedCommand::DrawIndexed { .. }
                | RecordedCommand::DrawIndexedIndirect { .. }
                | RecordedCommand::MultiDrawIndexedIndirect { .. }
        )
    }
}

struct RecordedBuffer {
    data: Vec<u8>,
    label: Option<String>,
}

struct RecordedTexture {
    desc: TextureDescriptor,
    data: Vec<u8>,
}

/// CPU-only backend that records commands
pub struct RecordingBackend {
    width: u32,
    height: u32,
    multi_draw_indirect: bool,

    buffers: HashMap<u64, RecordedBuffer>,
    textures: HashMap<u64, RecordedTexture>,
    texture_views: HashMap<u64, u64>,
    render_pipelines: HashMap<u64, RenderPipelineDescriptor>,
    compute_pipelines: HashMap<u64, ComputePipelineDescriptor>,

    next_id: u64,
    buffers_created: usize,
    frames_presented: u64,
    swapchain_view: Option<TextureViewHandle>,

    in_render_pass: bool,
    in_compute_pass: bool,
    commands: Vec<RecordedCommand>,
}

impl RecordingBackend {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            multi_draw_indirect: true,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            texture_views: HashMap::new(),
            render_pipelines: HashMap::new(),
            compute_pipelines: HashMap::new(),
            next_id: 1,
            buffers_created: 0,
            frames_presented: 0,
            swapchain_view: None,
            in_render_pass: false,
            in_compute_pass: false,
            commands: Vec::new(),
        }
    }

    /// Pretend the device lacks native multi-draw indirect support
    pub fn without_multi_draw_indirect(mut self) -> Self {
        self.multi_draw_indirect = false;
        self
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn push(&mut self, command: RecordedCommand) {
        log::trace!("RecordingBackend: {:?}", command);
        self.commands.push(command);
    }

    /// Every command recorded since the last [`clear_commands`](Self::clear_commands)
    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    /// Number of draw commands recorded
    pub fn draw_call_count(&self) -> usize {
        self.commands.iter().filter(|c| c.is_draw()).count()
    }

    /// Labels of the render passes in recording order
    pub fn render_pass_labels(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginRenderPass { label, .. } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Labels of the compute passes in recording order
    pub fn compute_pass_labels(&self) -> Vec<&str> {
        self.commands
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::BeginComputePass { label } => Some(label.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Number of draws recorded inside render passes whose label starts with `prefix`
    pub fn draws_in_passes(&self, prefix: &str) -> usize {
        let mut inside = false;
        let mut count = 0;
        for command in &self.commands {
            match command {
                RecordedCommand::BeginRenderPass { label, .. } => {
                    inside = label.starts_with(prefix);
                }
                RecordedCommand::EndRenderPass => inside = false,
                c if inside && c.is_draw() => count += 1,
                _ => {}
            }
        }
        count
    }

    /// Total number of buffers ever created
    pub fn buffers_created(&self) -> usize {
        self.buffers_created
    }

    /// Number of live buffers
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn buffer_label(&self, buffer: BufferHandle) -> Option<&str> {
        self.buffers.get(&buffer.0).and_then(|b| b.label.as_deref())
    }

    /// Host copy of mip 0 for every layer of a texture
    pub fn texture_data(&self, texture: TextureHandle) -> Option<&[u8]> {
        self.textures.get(&texture.0).map(|t| t.data.as_slice())
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Option<&TextureDescriptor> {
        self.textures.get(&texture.0).map(|t| &t.desc)
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }
}

impl GraphicsBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "Recording Backend"
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.width = width;
            self.height = height;
        }
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        let view = match self.swapchain_view {
            Some(view) => view,
            None => {
                let texture = self.create_texture(&TextureDescriptor {
                    label: Some("swapchain".into()),
                    width: self.width,
                    height: self.height,
                    format: TextureFormat::Bgra8UnormSrgb,
                    usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::COPY_SRC,
                    ..Default::default()
                })?;
                let view = self.create_texture_view(texture, &TextureViewDescriptor::default())?;
                self.swapchain_view = Some(view);
                view
            }
        };
        Ok(FrameContext {
            swapchain_view: view,
            width: self.width,
            height: self.height,
        })
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        debug_assert!(!self.in_render_pass, "frame ended inside a render pass");
        self.frames_presented += 1;
        Ok(())
    }

    fn swapchain_format(&self) -> TextureFormat {
        TextureFormat::Bgra8UnormSrgb
    }

    fn supports_multi_draw_indirect(&self) -> bool {
        self.multi_draw_indirect
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        log::trace!(
            "RecordingBackend: creating buffer {:?} (size: {})",
            desc.label,
            desc.size
        );
        let id = self.next_id();
        self.buffers.insert(
            id,
            RecordedBuffer {
                data: vec![0; desc.size as usize],
                label: desc.label.clone(),
            },
        );
        self.buffers_created += 1;
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        let Some(buf) = self.buffers.get_mut(&buffer.0) else {
            log::warn!("RecordingBackend: write to unknown buffer {:?}", buffer);
            return;
        };
        let start = offset as usize;
        let end = start + data.len();
        if end > buf.data.len() {
            log::warn!(
                "RecordingBackend: write of {} bytes at {} overruns buffer of {} bytes",
                data.len(),
                offset,
                buf.data.len()
            );
            return;
        }
        buf.data[start..end].copy_from_slice(data);
        self.push(RecordedCommand::WriteBuffer {
            buffer,
            offset,
            len: data.len(),
        });
    }

    fn read_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        size: u64,
    ) -> BackendResult<Vec<u8>> {
        let buf = self.buffers.get(&buffer.0).ok_or(BackendError::UnknownHandle {
            kind: "buffer",
            id: buffer.0,
        })?;
        let start = offset as usize;
        let end = start + size as usize;
        if end > buf.data.len() {
            return Err(BackendError::ReadbackFailed(format!(
                "range {}..{} exceeds buffer size {}",
                start,
                end,
                buf.data.len()
            )));
        }
        Ok(buf.data[start..end].to_vec())
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        let Some(bytes) = self.buffers.get(&src.0).and_then(|b| {
            b.data
                .get(src_offset as usize..(src_offset + size) as usize)
                .map(|s| s.to_vec())
        }) else {
            log::warn!("RecordingBackend: invalid copy source {:?}", src);
            return;
        };
        let Some(target) = self.buffers.get_mut(&dst.0).and_then(|b| {
            b.data
                .get_mut(dst_offset as usize..(dst_offset + size) as usize)
        }) else {
            log::warn!("RecordingBackend: invalid copy destination {:?}", dst);
            return;
        };
        target.copy_from_slice(&bytes);
        self.push(RecordedCommand::CopyBuffer { src, dst, size });
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        log::trace!(
            "RecordingBackend: creating texture {:?} ({}x{}x{})",
            desc.label,
            desc.width,
            desc.height,
            desc.array_layers
        );
        if desc.width == 0 || desc.height == 0 || desc.array_layers == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "zero sized texture {:?}",
                desc.label
            )));
        }
        let size = desc.width as usize
            * desc.height as usize
            * desc.array_layers as usize
            * desc.format.bytes_per_pixel() as usize;
        let id = self.next_id();
        self.textures.insert(
            id,
            RecordedTexture {
                desc: desc.clone(),
                data: vec![0; size],
            },
        );
        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        let tex = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::TextureCreationFailed("Texture not found".into()))?;
        let layers = desc.array_layer_count.unwrap_or(tex.desc.array_layers);
        if desc.base_array_layer + layers > tex.desc.array_layers {
            return Err(BackendError::TextureCreationFailed(format!(
                "view layers {}..{} out of range for {:?}",
                desc.base_array_layer,
                desc.base_array_layer + layers,
                tex.desc.label
            )));
        }
        let id = self.next_id();
        self.texture_views.insert(id, texture.0);
        Ok(TextureViewHandle(id))
    }

    fn write_texture(
        &mut self,
        texture: TextureHandle,
        layer: u32,
        data: &[u8],
        width: u32,
        height: u32,
    ) {
        let Some(tex) = self.textures.get_mut(&texture.0) else {
            return;
        };
        let layer_size = (tex.desc.width * tex.desc.height * tex.desc.format.bytes_per_pixel()) as usize;
        let expected = (width * height * tex.desc.format.bytes_per_pixel()) as usize;
        if width != tex.desc.width || height != tex.desc.height || data.len() < expected {
            log::warn!("RecordingBackend: partial texture writes are not recorded");
            return;
        }
        let start = layer as usize * layer_size;
        if let Some(target) = tex.data.get_mut(start..start + layer_size) {
            target.copy_from_slice(&data[..layer_size]);
        }
    }

    fn copy_texture_to_texture(&mut self, src: TextureHandle, dst: TextureHandle) {
        let Some(bytes) = self.textures.get(&src.0).map(|t| t.data.clone()) else {
            return;
        };
        if let Some(target) = self.textures.get_mut(&dst.0) {
            if target.data.len() == bytes.len() {
                target.data.copy_from_slice(&bytes);
            }
        }
        self.push(RecordedCommand::CopyTexture { src, dst });
    }

    fn generate_mipmaps(&mut self, texture: TextureHandle) {
        self.push(RecordedCommand::GenerateMipmaps(texture));
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        log::trace!("RecordingBackend: creating sampler {:?}", desc.label);
        Ok(SamplerHandle(self.next_id()))
    }

    fn create_bind_group_layout(
        &mut self,
        _entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        Ok(BindGroupLayoutHandle(self.next_id()))
    }

    fn create_bind_group(
        &mut self,
        _layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        for (binding, entry) in entries {
            let known = match entry {
                BindGroupEntry::Buffer { buffer, .. } => self.buffers.contains_key(&buffer.0),
                BindGroupEntry::Texture(view) | BindGroupEntry::StorageTexture(view) => {
                    self.texture_views.contains_key(&view.0)
                }
                BindGroupEntry::Sampler(_) => true,
            };
            if !known {
                return Err(BackendError::PipelineCreationFailed(format!(
                    "binding {} refers to a destroyed resource",
                    binding
                )));
            }
        }
        Ok(BindGroupHandle(self.next_id()))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let id = self.next_id();
        self.render_pipelines.insert(id, desc.clone());
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        let id = self.next_id();
        self.compute_pipelines.insert(id, desc.clone());
        Ok(ComputePipelineHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        debug_assert!(!self.in_render_pass, "nested render pass");
        self.in_render_pass = true;
        let clears = desc
            .color_attachments
            .iter()
            .any(|a| matches!(a.load_op, LoadOp::Clear(_)));
        self.push(RecordedCommand::BeginRenderPass {
            label: desc.label.clone().unwrap_or_default(),
            color_attachments: desc.color_attachments.len(),
            clears,
        });
    }

    fn end_render_pass(&mut self) {
        if self.in_render_pass {
            self.in_render_pass = false;
            self.push(RecordedCommand::EndRenderPass);
        }
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.in_compute_pass = true;
        self.push(RecordedCommand::BeginComputePass {
            label: label.unwrap_or_default().to_string(),
        });
    }

    fn end_compute_pass(&mut self) {
        if self.in_compute_pass {
            self.in_compute_pass = false;
            self.push(RecordedCommand::EndComputePass);
        }
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        let Some(desc) = self.render_pipelines.get(&pipeline.0) else {
            return;
        };
        let command = RecordedCommand::SetRenderPipeline {
            label: desc.label.clone().unwrap_or_default(),
            cull_mode: desc.cull_mode,
            depth_compare: desc.depth_stencil.as_ref().map(|d| d.depth_compare),
        };
        self.push(command);
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        let Some(desc) = self.compute_pipelines.get(&pipeline.0) else {
            return;
        };
        let command = RecordedCommand::SetComputePipeline {
            label: desc.label.clone().unwrap_or_default(),
        };
        self.push(command);
    }

    fn set_bind_group(&mut self, _index: u32, _bind_group: BindGroupHandle, _dynamic_offsets: &[u32]) {}

    fn set_vertex_buffer(&mut self, _slot: u32, _buffer: BufferHandle, _offset: u64) {}

    fn set_index_buffer(&mut self, _buffer: BufferHandle, _offset: u64, _format: IndexFormat) {}

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        if self.in_render_pass {
            self.push(RecordedCommand::Draw { vertices, instances });
        }
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        if self.in_render_pass {
            self.push(RecordedCommand::DrawIndexed {
                indices,
                base_vertex,
                instances,
            });
        }
    }

    fn draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64) {
        if self.in_render_pass {
            self.push(RecordedCommand::DrawIndexedIndirect { buffer, offset });
        }
    }

    fn multi_draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64, count: u32) {
        if self.in_render_pass {
            self.push(RecordedCommand::MultiDrawIndexedIndirect {
                buffer,
                offset,
                count,
            });
        }
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        if self.in_compute_pass {
            self.push(RecordedCommand::Dispatch { x, y, z });
        }
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(&buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(&texture.0);
        self.texture_views.retain(|_, t| *t != texture.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_write_copy_read() {
        let mut backend = RecordingBackend::new(64, 64);
        let usage = BufferUsage::STORAGE | BufferUsage::COPY_SRC | BufferUsage::COPY_DST;
        let a = backend
            .create_buffer(&BufferDescriptor::new("a", 16, usage))
            .unwrap();
        let b = backend
            .create_buffer(&BufferDescriptor::new("b", 32, usage))
            .unwrap();

        backend.write_buffer(a, 4, &[1, 2, 3, 4]);
        backend.copy_buffer_to_buffer(a, 0, b, 8, 16);

        assert_eq!(backend.read_buffer(b, 12, 4).unwrap(), vec![1, 2, 3, 4]);
        assert!(backend.read_buffer(b, 30, 4).is_err());
        assert_eq!(backend.buffers_created(), 2);
    }

    #[test]
    fn test_draws_outside_pass_are_dropped() {
        let mut backend = RecordingBackend::new(64, 64);
        backend.draw(0..3, 0..1);
        assert_eq!(backend.draw_call_count(), 0);

        backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("Shadow Pass".into()),
            color_attachments: vec![],
            depth_stencil_attachment: None,
        });
        backend.draw(0..3, 0..1);
        backend.end_render_pass();
        backend.draw(0..3, 0..1);

        assert_eq!(backend.draw_call_count(), 1);
        assert_eq!(backend.draws_in_passes("Shadow"), 1);
        assert_eq!(backend.render_pass_labels(), vec!["Shadow Pass"]);
    }

    #[test]
    fn test_view_layer_range_checked() {
        let mut backend = RecordingBackend::new(64, 64);
        let texture = backend
            .create_texture(&TextureDescriptor {
                width: 4,
                height: 4,
                array_layers: 6,
                ..Default::default()
            })
            .unwrap();
        assert!(backend
            .create_texture_view(texture, &TextureViewDescriptor::layer(5))
            .is_ok());
        assert!(backend
            .create_texture_view(texture, &TextureViewDescriptor::layer(6))
            .is_err());
    }
}
