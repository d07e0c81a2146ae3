//! [`GraphicsBackend`] on top of wgpu
//!
//! Passes are recorded into a [`OpenPass`] and replayed into the frame encoder
//! once they end. Handles are plain ids resolved through one [`Table`] per
//! resource kind.

mod convert;
mod mipmaps;

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use convert::*;
use mipmaps::MipmapGenerator;

/// Byte stride between consecutive indexed indirect records
const INDEXED_INDIRECT_STRIDE: u64 = 20;

/// Format of the offscreen image used when there is no window
const OFFSCREEN_FORMAT: TextureFormat = TextureFormat::Rgba8UnormSrgb;

#[derive(Clone)]
enum RenderCommand {
    Pipeline(RenderPipelineHandle),
    BindGroup(u32, BindGroupHandle, Vec<u32>),
    VertexBuffer(u32, BufferHandle, u64),
    IndexBuffer(BufferHandle, u64, IndexFormat),
    Draw(Range<u32>, Range<u32>),
    DrawIndexed(Range<u32>, i32, Range<u32>),
    DrawIndirect(BufferHandle, u64),
    MultiDrawIndirect(BufferHandle, u64, u32),
}

#[derive(Clone)]
enum ComputeCommand {
    Pipeline(ComputePipelineHandle),
    BindGroup(u32, BindGroupHandle, Vec<u32>),
    Dispatch([u32; 3]),
}

/// The pass between a `begin_*_pass` and its `end_*_pass`
enum OpenPass {
    Render(RenderPassDescriptor, Vec<RenderCommand>),
    Compute(Option<String>, Vec<ComputeCommand>),
}

/// Live wgpu objects of one kind, keyed by handle id
struct Table<T> {
    kind: &'static str,
    items: HashMap<u64, T>,
}

impl<T> Table<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: HashMap::new(),
        }
    }

    fn get(&self, id: u64) -> BackendResult<&T> {
        self.items
            .get(&id)
            .ok_or(BackendError::UnknownHandle { kind: self.kind, id })
    }

    fn find(&self, id: u64) -> Option<&T> {
        self.items.get(&id)
    }

    fn insert(&mut self, id: u64, item: T) {
        self.items.insert(id, item);
    }

    fn remove(&mut self, id: u64) {
        self.items.remove(&id);
    }
}

/// Where frames end up
enum FrameOutput {
    Window {
        surface: wgpu::Surface<'static>,
        config: wgpu::SurfaceConfiguration,
        /// Image acquired by `begin_frame`, presented by `end_frame`
        acquired: Option<(wgpu::SurfaceTexture, u64)>,
    },
    Offscreen {
        texture: TextureHandle,
        view: TextureViewHandle,
        size: (u32, u32),
    },
}

/// Adapter, device and the optional features this renderer uses
struct OpenedDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    multi_draw_indirect: bool,
}

impl OpenedDevice {
    async fn open(
        instance: &wgpu::Instance,
        surface: Option<&wgpu::Surface<'static>>,
    ) -> BackendResult<(Self, wgpu::Adapter)> {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: surface,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::InitializationFailed("no GPU adapter".into()))?;
        let info = adapter.get_info();
        log::info!("Rendering on {} through {:?}", info.name, info.backend);

        let multi_draw_indirect = adapter
            .features()
            .contains(wgpu::Features::MULTI_DRAW_INDIRECT);
        let mut required_features = wgpu::Features::empty();
        required_features.set(wgpu::Features::MULTI_DRAW_INDIRECT, multi_draw_indirect);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("deferred renderer"),
                    required_features,
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;
        if !multi_draw_indirect {
            log::info!("Multi draw indirect unavailable, indirect lists are drawn one by one");
        }
        Ok((
            Self {
                device,
                queue,
                multi_draw_indirect,
            },
            adapter,
        ))
    }
}

/// Largest size with the same aspect ratio that fits in `max` on both axes
fn fit_to_limit(width: u32, height: u32, max: u32) -> (u32, u32) {
    let largest = width.max(height);
    if largest <= max {
        return (width.max(1), height.max(1));
    }
    let scale = max as f64 / largest as f64;
    (
        ((width as f64 * scale) as u32).max(1),
        ((height as f64 * scale) as u32).max(1),
    )
}

/// Owns the wgpu device and maps handles onto wgpu resources
pub struct WgpuBackend {
    device: wgpu::Device,
    queue: wgpu::Queue,
    multi_draw_indirect: bool,
    output: FrameOutput,
    mipmaps: MipmapGenerator,

    next_id: u64,
    buffers: Table<wgpu::Buffer>,
    textures: Table<(wgpu::Texture, TextureDescriptor)>,
    views: Table<wgpu::TextureView>,
    samplers: Table<wgpu::Sampler>,
    layouts: Table<wgpu::BindGroupLayout>,
    bind_groups: Table<wgpu::BindGroup>,
    render_pipelines: Table<wgpu::RenderPipeline>,
    compute_pipelines: Table<wgpu::ComputePipeline>,

    /// Present between `begin_frame` and `end_frame`
    encoder: Option<wgpu::CommandEncoder>,
    pass: Option<OpenPass>,
}

impl WgpuBackend {
    /// Present into `window`
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(window, vsync))
    }

    /// Render into an offscreen image of the given size
    pub fn new_headless(width: u32, height: u32) -> BackendResult<Self> {
        pollster::block_on(Self::new_headless_async(width, height))
    }

    pub async fn new_async(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        let instance = wgpu::Instance::default();
        let surface = instance
            .create_surface(window.clone())
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;
        let (opened, adapter) = OpenedDevice::open(&instance, Some(&surface)).await?;

        let caps = surface.get_capabilities(&adapter);
        let format = caps
            .formats
            .iter()
            .find(|format| format.is_srgb())
            .or(caps.formats.first())
            .copied()
            .ok_or_else(|| BackendError::SurfaceCreationFailed("no supported formats".into()))?;
        let size = window.inner_size();
        let (width, height) = fit_to_limit(
            size.width,
            size.height,
            opened.device.limits().max_texture_dimension_2d,
        );
        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width,
            height,
            present_mode: if vsync {
                wgpu::PresentMode::AutoVsync
            } else {
                wgpu::PresentMode::AutoNoVsync
            },
            alpha_mode: caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: Vec::new(),
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&opened.device, &config);
        log::info!("Presenting {width}x{height} {format:?}");

        Ok(Self::with_output(
            opened,
            FrameOutput::Window {
                surface,
                config,
                acquired: None,
            },
        ))
    }

    pub async fn new_headless_async(width: u32, height: u32) -> BackendResult<Self> {
        let instance = wgpu::Instance::default();
        let (opened, _) = OpenedDevice::open(&instance, None).await?;
        let mut backend = Self::with_output(
            opened,
            FrameOutput::Offscreen {
                texture: TextureHandle(0),
                view: TextureViewHandle(0),
                size: (0, 0),
            },
        );
        backend.replace_offscreen_image(width.max(1), height.max(1))?;
        Ok(backend)
    }

    fn with_output(opened: OpenedDevice, output: FrameOutput) -> Self {
        Self {
            mipmaps: MipmapGenerator::new(&opened.device),
            device: opened.device,
            queue: opened.queue,
            multi_draw_indirect: opened.multi_draw_indirect,
            output,
            next_id: 1,
            buffers: Table::new("buffer"),
            textures: Table::new("texture"),
            views: Table::new("texture view"),
            samplers: Table::new("sampler"),
            layouts: Table::new("bind group layout"),
            bind_groups: Table::new("bind group"),
            render_pipelines: Table::new("render pipeline"),
            compute_pipelines: Table::new("compute pipeline"),
            encoder: None,
            pass: None,
        }
    }

    fn replace_offscreen_image(&mut self, width: u32, height: u32) -> BackendResult<()> {
        if let FrameOutput::Offscreen { texture, view, .. } = self.output {
            self.views.remove(view.0);
            self.textures.remove(texture.0);
        }
        let texture = self.create_texture(&TextureDescriptor {
            label: Some("offscreen_output".into()),
            width,
            height,
            format: OFFSCREEN_FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT
                | TextureUsage::TEXTURE_BINDING
                | TextureUsage::COPY_SRC,
            ..Default::default()
        })?;
        let view = self.create_texture_view(texture, &TextureViewDescriptor::default())?;
        self.output = FrameOutput::Offscreen {
            texture,
            view,
            size: (width, height),
        };
        Ok(())
    }

    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id - 1
    }

    fn frame_encoder(&self) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame"),
            })
    }

    /// Record into the frame encoder, or into a one-off submission between frames
    fn encode(&mut self, record: impl FnOnce(&Self, &mut wgpu::CommandEncoder)) {
        let (mut encoder, in_frame) = match self.encoder.take() {
            Some(encoder) => (encoder, true),
            None => (self.frame_encoder(), false),
        };
        record(self, &mut encoder);
        if in_frame {
            self.encoder = Some(encoder);
        } else {
            self.queue.submit([encoder.finish()]);
        }
    }

    /// Submit what the frame recorded so far and keep recording into a new encoder
    fn submit_partial_frame(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit([encoder.finish()]);
            self.encoder = Some(self.frame_encoder());
        }
    }

    fn pipeline_layout(&self, label: Option<&str>, layouts: &[BindGroupLayoutHandle]) -> wgpu::PipelineLayout {
        let layouts: Vec<&wgpu::BindGroupLayout> = layouts
            .iter()
            .filter_map(|handle| self.layouts.find(handle.0))
            .collect();
        self.device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label,
                bind_group_layouts: &layouts,
                push_constant_ranges: &[],
            })
    }

    fn shader_module(&self, label: Option<&str>, source: &str) -> wgpu::ShaderModule {
        self.device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label,
                source: wgpu::ShaderSource::Wgsl(source.into()),
            })
    }

    fn record_render(&mut self, command: RenderCommand) {
        if let Some(OpenPass::Render(_, commands)) = &mut self.pass {
            commands.push(command);
        }
    }

    fn record_compute(&mut self, command: ComputeCommand) {
        if let Some(OpenPass::Compute(_, commands)) = &mut self.pass {
            commands.push(command);
        }
    }

    fn replay_render<'a>(&'a self, pass: &mut wgpu::RenderPass<'a>, command: &RenderCommand) {
        match command {
            RenderCommand::Pipeline(handle) => {
                if let Some(pipeline) = self.render_pipelines.find(handle.0) {
                    pass.set_pipeline(pipeline);
                }
            }
            RenderCommand::BindGroup(index, handle, offsets) => {
                if let Some(group) = self.bind_groups.find(handle.0) {
                    pass.set_bind_group(*index, group, offsets);
                }
            }
            RenderCommand::VertexBuffer(slot, handle, offset) => {
                if let Some(buffer) = self.buffers.find(handle.0) {
                    pass.set_vertex_buffer(*slot, buffer.slice(*offset..));
                }
            }
            RenderCommand::IndexBuffer(handle, offset, format) => {
                if let Some(buffer) = self.buffers.find(handle.0) {
                    pass.set_index_buffer(buffer.slice(*offset..), convert_index_format(*format));
                }
            }
            RenderCommand::Draw(vertices, instances) => pass.draw(vertices.clone(), instances.clone()),
            RenderCommand::DrawIndexed(indices, base_vertex, instances) => {
                pass.draw_indexed(indices.clone(), *base_vertex, instances.clone())
            }
            RenderCommand::DrawIndirect(handle, offset) => {
                if let Some(buffer) = self.buffers.find(handle.0) {
                    pass.draw_indexed_indirect(buffer, *offset);
                }
            }
            RenderCommand::MultiDrawIndirect(handle, offset, count) => {
                let Some(buffer) = self.buffers.find(handle.0) else {
                    return;
                };
                if self.multi_draw_indirect {
                    pass.multi_draw_indexed_indirect(buffer, *offset, *count);
                } else {
                    for record in 0..u64::from(*count) {
                        pass.draw_indexed_indirect(buffer, offset + record * INDEXED_INDIRECT_STRIDE);
                    }
                }
            }
        }
    }

    fn replay_compute<'a>(&'a self, pass: &mut wgpu::ComputePass<'a>, command: &ComputeCommand) {
        match command {
            ComputeCommand::Pipeline(handle) => {
                if let Some(pipeline) = self.compute_pipelines.find(handle.0) {
                    pass.set_pipeline(pipeline);
                }
            }
            ComputeCommand::BindGroup(index, handle, offsets) => {
                if let Some(group) = self.bind_groups.find(handle.0) {
                    pass.set_bind_group(*index, group, offsets);
                }
            }
            ComputeCommand::Dispatch([x, y, z]) => pass.dispatch_workgroups(*x, *y, *z),
        }
    }

    fn encode_render_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        desc: &RenderPassDescriptor,
        commands: &[RenderCommand],
    ) {
        // The acquired swapchain image only gets a view when a pass draws into it
        let window_view = match &self.output {
            FrameOutput::Window {
                acquired: Some((image, id)),
                ..
            } => Some((*id, image.texture.create_view(&Default::default()))),
            _ => None,
        };
        let view = |handle: TextureViewHandle| match &window_view {
            Some((id, view)) if *id == handle.0 => Some(view),
            _ => self.views.find(handle.0),
        };

        let color_attachments: Vec<_> = desc
            .color_attachments
            .iter()
            .filter_map(|attachment| {
                Some(Some(wgpu::RenderPassColorAttachment {
                    view: view(attachment.view)?,
                    resolve_target: None,
                    ops: color_ops(attachment),
                }))
            })
            .collect();
        let depth_stencil_attachment = desc.depth_stencil_attachment.as_ref().and_then(|attachment| {
            Some(wgpu::RenderPassDepthStencilAttachment {
                view: view(attachment.view)?,
                depth_ops: Some(depth_ops(attachment)),
                stencil_ops: None,
            })
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: desc.label.as_deref(),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        for command in commands {
            self.replay_render(&mut pass, command);
        }
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let (width, height) = fit_to_limit(width, height, self.device.limits().max_texture_dimension_2d);
        match &mut self.output {
            FrameOutput::Window { surface, config, .. } => {
                config.width = width;
                config.height = height;
                surface.configure(&self.device, config);
            }
            FrameOutput::Offscreen { .. } => {
                if let Err(e) = self.replace_offscreen_image(width, height) {
                    log::warn!("Offscreen output kept its old size: {e}");
                }
            }
        }
    }

    fn begin_frame(&mut self) -> BackendResult<FrameContext> {
        let id = self.allocate_id();
        let frame = match &mut self.output {
            FrameOutput::Window {
                surface,
                config,
                acquired,
            } => {
                let image = surface.get_current_texture().map_err(|e| match e {
                    wgpu::SurfaceError::Lost => BackendError::SurfaceLost,
                    wgpu::SurfaceError::OutOfMemory => BackendError::OutOfMemory,
                    other => BackendError::AcquireImageFailed(other.to_string()),
                })?;
                *acquired = Some((image, id));
                FrameContext {
                    swapchain_view: TextureViewHandle(id),
                    width: config.width,
                    height: config.height,
                }
            }
            FrameOutput::Offscreen { view, size, .. } => FrameContext {
                swapchain_view: *view,
                width: size.0,
                height: size.1,
            },
        };
        self.encoder = Some(self.frame_encoder());
        Ok(frame)
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit([encoder.finish()]);
        }
        if let FrameOutput::Window { acquired, .. } = &mut self.output {
            if let Some((image, _)) = acquired.take() {
                image.present();
            }
        }
        Ok(())
    }

    fn swapchain_format(&self) -> TextureFormat {
        match &self.output {
            FrameOutput::Window { config, .. } => convert_texture_format_back(config.format),
            FrameOutput::Offscreen { .. } => OFFSCREEN_FORMAT,
        }
    }

    fn supports_multi_draw_indirect(&self) -> bool {
        self.multi_draw_indirect
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label.as_deref(),
            size: align_to_copy(desc.size),
            usage: convert_buffer_usage(desc.usage),
            mapped_at_creation: desc.mapped_at_creation,
        });
        let id = self.allocate_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) {
        match self.buffers.get(buffer.0) {
            Ok(target) => self.queue.write_buffer(target, offset, data),
            Err(e) => log::warn!("Dropped buffer write: {e}"),
        }
    }

    fn read_buffer(&mut self, buffer: BufferHandle, offset: u64, size: u64) -> BackendResult<Vec<u8>> {
        if size == 0 {
            return Ok(Vec::new());
        }
        self.submit_partial_frame();

        let source = self.buffers.get(buffer.0)?;
        // Copies start and end on COPY_BUFFER_ALIGNMENT boundaries
        let start = offset - offset % wgpu::COPY_BUFFER_ALIGNMENT;
        let skip = offset - start;
        let length = align_to_copy(skip + size).min(source.size().saturating_sub(start));
        if skip + size > length {
            return Err(BackendError::ReadbackFailed(format!(
                "{}..{} is outside a {} byte buffer",
                offset,
                offset + size,
                source.size()
            )));
        }

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: length,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = self.frame_encoder();
        encoder.copy_buffer_to_buffer(source, start, &staging, 0, length);
        self.queue.submit([encoder.finish()]);

        let (sender, receiver) = std::sync::mpsc::channel();
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                let _ = sender.send(result);
            });
        self.device.poll(wgpu::Maintain::Wait);
        match receiver.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BackendError::ReadbackFailed(e.to_string())),
            Err(e) => return Err(BackendError::ReadbackFailed(e.to_string())),
        }

        let bytes = staging.slice(..).get_mapped_range()[skip as usize..(skip + size) as usize].to_vec();
        staging.unmap();
        Ok(bytes)
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferHandle,
        src_offset: u64,
        dst: BufferHandle,
        dst_offset: u64,
        size: u64,
    ) {
        self.encode(|backend, encoder| {
            match (backend.buffers.get(src.0), backend.buffers.get(dst.0)) {
                (Ok(src), Ok(dst)) => {
                    encoder.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, align_to_copy(size))
                }
                (Err(e), _) | (_, Err(e)) => log::warn!("Skipped buffer copy: {e}"),
            }
        });
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.array_layers == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?} has a zero extent",
                desc.label
            )));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.array_layers,
            },
            mip_level_count: desc.mip_levels,
            sample_count: 1,
            dimension: match desc.dimension {
                TextureDimension::D2 => wgpu::TextureDimension::D2,
                TextureDimension::D3 => wgpu::TextureDimension::D3,
            },
            format: convert_texture_format(desc.format),
            usage: convert_texture_usage(desc.usage),
            view_formats: &[],
        });
        let id = self.allocate_id();
        self.textures.insert(id, (texture, desc.clone()));
        Ok(TextureHandle(id))
    }

    fn create_texture_view(
        &mut self,
        texture: TextureHandle,
        desc: &TextureViewDescriptor,
    ) -> BackendResult<TextureViewHandle> {
        let (texture, _) = self.textures.get(texture.0)?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: desc.label.as_deref(),
            dimension: Some(convert_view_dimension(desc.dimension)),
            base_mip_level: desc.base_mip_level,
            mip_level_count: desc.mip_level_count,
            base_array_layer: desc.base_array_layer,
            array_layer_count: desc.array_layer_count,
            ..Default::default()
        });
        let id = self.allocate_id();
        self.views.insert(id, view);
        Ok(TextureViewHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, layer: u32, data: &[u8], width: u32, height: u32) {
        let Ok((target, desc)) = self.textures.get(texture.0) else {
            log::warn!("Dropped pixel upload to unknown texture {}", texture.0);
            return;
        };
        let destination = wgpu::ImageCopyTexture {
            texture: target,
            mip_level: 0,
            origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
            aspect: wgpu::TextureAspect::All,
        };
        let layout = wgpu::ImageDataLayout {
            offset: 0,
            bytes_per_row: Some(width * desc.format.bytes_per_pixel()),
            rows_per_image: Some(height),
        };
        let extent = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        self.queue.write_texture(destination, data, layout, extent);
    }

    fn copy_texture_to_texture(&mut self, src: TextureHandle, dst: TextureHandle) {
        self.encode(|backend, encoder| {
            let (Ok((source, desc)), Ok((destination, _))) =
                (backend.textures.get(src.0), backend.textures.get(dst.0))
            else {
                log::warn!("Skipped texture copy {} -> {}", src.0, dst.0);
                return;
            };
            fn whole(texture: &wgpu::Texture) -> wgpu::ImageCopyTexture<'_> {
                wgpu::ImageCopyTexture {
                    texture,
                    mip_level: 0,
                    origin: wgpu::Origin3d::ZERO,
                    aspect: wgpu::TextureAspect::All,
                }
            }
            encoder.copy_texture_to_texture(
                whole(source),
                whole(destination),
                wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: desc.array_layers,
                },
            );
        });
    }

    fn generate_mipmaps(&mut self, texture: TextureHandle) {
        self.encode(|backend, encoder| {
            if let Some((target, desc)) = backend.textures.find(texture.0) {
                backend.mipmaps.generate(&backend.device, encoder, target, desc);
            }
        });
    }

    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let sampler = self.device.create_sampler(&wgpu::SamplerDescriptor {
            label: desc.label.as_deref(),
            address_mode_u: convert_address_mode(desc.address_mode_u),
            address_mode_v: convert_address_mode(desc.address_mode_v),
            address_mode_w: convert_address_mode(desc.address_mode_w),
            mag_filter: convert_filter_mode(desc.mag_filter),
            min_filter: convert_filter_mode(desc.min_filter),
            mipmap_filter: convert_filter_mode(desc.mipmap_filter),
            compare: desc.compare.map(convert_compare_function),
            ..Default::default()
        });
        let id = self.allocate_id();
        self.samplers.insert(id, sampler);
        Ok(SamplerHandle(id))
    }

    fn create_bind_group_layout(
        &mut self,
        entries: &[BindGroupLayoutEntry],
    ) -> BackendResult<BindGroupLayoutHandle> {
        let entries: Vec<_> = entries
            .iter()
            .map(|entry| wgpu::BindGroupLayoutEntry {
                binding: entry.binding,
                visibility: convert_shader_stages(entry.visibility),
                ty: convert_binding_type(&entry.ty),
                count: None,
            })
            .collect();
        let layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: None,
                entries: &entries,
            });
        let id = self.allocate_id();
        self.layouts.insert(id, layout);
        Ok(BindGroupLayoutHandle(id))
    }

    fn create_bind_group(
        &mut self,
        layout: BindGroupLayoutHandle,
        entries: &[(u32, BindGroupEntry)],
    ) -> BackendResult<BindGroupHandle> {
        let entries = entries
            .iter()
            .map(|(binding, entry)| {
                let resource = match entry {
                    BindGroupEntry::Buffer { buffer, offset, size } => {
                        wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                            buffer: self.buffers.get(buffer.0)?,
                            offset: *offset,
                            size: size.and_then(wgpu::BufferSize::new),
                        })
                    }
                    BindGroupEntry::Texture(view) | BindGroupEntry::StorageTexture(view) => {
                        wgpu::BindingResource::TextureView(self.views.get(view.0)?)
                    }
                    BindGroupEntry::Sampler(sampler) => {
                        wgpu::BindingResource::Sampler(self.samplers.get(sampler.0)?)
                    }
                };
                Ok::<_, BackendError>(wgpu::BindGroupEntry {
                    binding: *binding,
                    resource,
                })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: None,
            layout: self.layouts.get(layout.0)?,
            entries: &entries,
        });
        let id = self.allocate_id();
        self.bind_groups.insert(id, group);
        Ok(BindGroupHandle(id))
    }

    fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> BackendResult<RenderPipelineHandle> {
        let label = desc.label.as_deref();
        let module = self.shader_module(label, &desc.shader);
        let layout = self.pipeline_layout(label, &desc.bind_group_layouts);

        let attributes: Vec<_> = desc.vertex_layouts.iter().map(vertex_attributes).collect();
        let buffers: Vec<_> = desc
            .vertex_layouts
            .iter()
            .zip(&attributes)
            .map(|(layout, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: convert_step_mode(layout.step_mode),
                attributes,
            })
            .collect();
        let targets: Vec<_> = desc.color_targets.iter().map(convert_color_target).collect();

        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label,
                layout: Some(&layout),
                vertex: wgpu::VertexState {
                    module: &module,
                    entry_point: &desc.vertex_entry,
                    buffers: &buffers,
                    compilation_options: Default::default(),
                },
                fragment: desc.fragment_entry.as_deref().map(|entry_point| wgpu::FragmentState {
                    module: &module,
                    entry_point,
                    targets: &targets,
                    compilation_options: Default::default(),
                }),
                primitive: convert_primitive(desc),
                depth_stencil: desc.depth_stencil.as_ref().map(convert_depth_state),
                multisample: Default::default(),
                multiview: None,
            });
        let id = self.allocate_id();
        self.render_pipelines.insert(id, pipeline);
        Ok(RenderPipelineHandle(id))
    }

    fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> BackendResult<ComputePipelineHandle> {
        let label = desc.label.as_deref();
        let module = self.shader_module(label, &desc.shader);
        let layout = self.pipeline_layout(label, &desc.bind_group_layouts);
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label,
                layout: Some(&layout),
                module: &module,
                entry_point: &desc.entry_point,
                compilation_options: Default::default(),
            });
        let id = self.allocate_id();
        self.compute_pipelines.insert(id, pipeline);
        Ok(ComputePipelineHandle(id))
    }

    fn begin_render_pass(&mut self, desc: &RenderPassDescriptor) {
        self.pass = Some(OpenPass::Render(desc.clone(), Vec::new()));
    }

    fn end_render_pass(&mut self) {
        let Some(OpenPass::Render(desc, commands)) = self.pass.take() else {
            return;
        };
        let Some(mut encoder) = self.encoder.take() else {
            log::warn!("Render pass {:?} ended outside a frame", desc.label);
            return;
        };
        self.encode_render_pass(&mut encoder, &desc, &commands);
        self.encoder = Some(encoder);
    }

    fn begin_compute_pass(&mut self, label: Option<&str>) {
        self.pass = Some(OpenPass::Compute(label.map(str::to_owned), Vec::new()));
    }

    fn end_compute_pass(&mut self) {
        let Some(OpenPass::Compute(label, commands)) = self.pass.take() else {
            return;
        };
        let Some(mut encoder) = self.encoder.take() else {
            log::warn!("Compute pass {label:?} ended outside a frame");
            return;
        };
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: label.as_deref(),
                timestamp_writes: None,
            });
            for command in &commands {
                self.replay_compute(&mut pass, command);
            }
        }
        self.encoder = Some(encoder);
    }

    fn set_render_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.record_render(RenderCommand::Pipeline(pipeline));
    }

    fn set_compute_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.record_compute(ComputeCommand::Pipeline(pipeline));
    }

    fn set_bind_group(&mut self, index: u32, bind_group: BindGroupHandle, dynamic_offsets: &[u32]) {
        let offsets = dynamic_offsets.to_vec();
        match &mut self.pass {
            Some(OpenPass::Render(_, commands)) => {
                commands.push(RenderCommand::BindGroup(index, bind_group, offsets))
            }
            Some(OpenPass::Compute(_, commands)) => {
                commands.push(ComputeCommand::BindGroup(index, bind_group, offsets))
            }
            None => {}
        }
    }

    fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferHandle, offset: u64) {
        self.record_render(RenderCommand::VertexBuffer(slot, buffer, offset));
    }

    fn set_index_buffer(&mut self, buffer: BufferHandle, offset: u64, format: IndexFormat) {
        self.record_render(RenderCommand::IndexBuffer(buffer, offset, format));
    }

    fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.record_render(RenderCommand::Draw(vertices, instances));
    }

    fn draw_indexed(&mut self, indices: Range<u32>, base_vertex: i32, instances: Range<u32>) {
        self.record_render(RenderCommand::DrawIndexed(indices, base_vertex, instances));
    }

    fn draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64) {
        self.record_render(RenderCommand::DrawIndirect(buffer, offset));
    }

    fn multi_draw_indexed_indirect(&mut self, buffer: BufferHandle, offset: u64, count: u32) {
        self.record_render(RenderCommand::MultiDrawIndirect(buffer, offset, count));
    }

    fn dispatch_compute(&mut self, x: u32, y: u32, z: u32) {
        self.record_compute(ComputeCommand::Dispatch([x, y, z]));
    }

    // wgpu keeps dropped resources alive until recorded commands using them finish
    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        self.buffers.remove(buffer.0);
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        self.textures.remove(texture.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_to_limit_keeps_aspect() {
        assert_eq!(fit_to_limit(800, 600, 4096), (800, 600));
        assert_eq!(fit_to_limit(8192, 4096, 4096), (4096, 2048));
        assert_eq!(fit_to_limit(0, 10, 4096), (1, 10));
    }
}
