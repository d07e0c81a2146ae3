//! Multi-attachment render targets and the binding stack

use crate::backend::{
    full_mip_chain, ColorAttachment, DepthStencilAttachment, FilterMode, GraphicsBackend, LoadOp,
    RenderPassDescriptor, SamplerDescriptor, SamplerHandle, StoreOp, TextureDescriptor,
    TextureFormat, TextureHandle, TextureUsage, TextureViewDescriptor, TextureViewHandle,
};
use crate::error::{RenderError, RenderResult};

/// Description of one color attachment
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentDesc {
    pub name: String,
    pub format: TextureFormat,
    pub filter: FilterMode,
    /// Also bindable as a storage texture from compute passes
    pub storage: bool,
}

/// A live attachment texture
#[derive(Debug, Clone)]
pub struct Attachment {
    pub desc: AttachmentDesc,
    pub texture: TextureHandle,
    /// Mip 0, used as the render pass attachment
    pub view: TextureViewHandle,
    /// Every mip, used for sampling
    pub sampled_view: TextureViewHandle,
    pub sampler: SamplerHandle,
}

/// Builder for [`RenderTarget`]
#[derive(Debug, Clone)]
pub struct RenderTargetBuilder {
    label: String,
    width: u32,
    height: u32,
    colors: Vec<AttachmentDesc>,
    depth: Option<TextureFormat>,
    mipmapped: bool,
}

impl RenderTargetBuilder {
    pub fn color(mut self, name: &str, format: TextureFormat, filter: FilterMode) -> Self {
        self.colors.push(AttachmentDesc {
            name: name.to_string(),
            format,
            filter,
            storage: false,
        });
        self
    }

    /// Color attachment that compute passes can also write
    pub fn storage_color(mut self, name: &str, format: TextureFormat) -> Self {
        self.colors.push(AttachmentDesc {
            name: name.to_string(),
            format,
            filter: FilterMode::Nearest,
            storage: true,
        });
        self
    }

    pub fn depth(mut self, format: TextureFormat) -> Self {
        self.depth = Some(format);
        self
    }

    /// Allocate a full mip chain for the color attachments
    pub fn mipmapped(mut self) -> Self {
        self.mipmapped = true;
        self
    }

    pub fn build<B: GraphicsBackend + ?Sized>(self, backend: &mut B) -> RenderResult<RenderTarget> {
        let mut target = RenderTarget {
            label: self.label,
            width: self.width.max(1),
            height: self.height.max(1),
            mipmapped: self.mipmapped,
            color_descs: self.colors,
            depth_format: self.depth,
            colors: Vec::new(),
            depth: None,
        };
        target.allocate(backend)?;
        Ok(target)
    }
}

/// A set of textures rendered together in one pass
///
/// Attachment count and formats are fixed at construction; only the size can
/// change afterwards.
pub struct RenderTarget {
    label: String,
    width: u32,
    height: u32,
    mipmapped: bool,
    color_descs: Vec<AttachmentDesc>,
    depth_format: Option<TextureFormat>,
    colors: Vec<Attachment>,
    depth: Option<(TextureHandle, TextureViewHandle)>,
}

impl RenderTarget {
    pub fn builder(label: &str, width: u32, height: u32) -> RenderTargetBuilder {
        RenderTargetBuilder {
            label: label.to_string(),
            width,
            height,
            colors: Vec::new(),
            depth: None,
            mipmapped: false,
        }
    }

    fn allocate<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> RenderResult<()> {
        let mip_levels = if self.mipmapped {
            full_mip_chain(self.width, self.height)
        } else {
            1
        };

        for desc in &self.color_descs {
            let mut usage = TextureUsage::RENDER_ATTACHMENT
                | TextureUsage::TEXTURE_BINDING
                | TextureUsage::COPY_SRC
                | TextureUsage::COPY_DST;
            if desc.storage {
                usage = usage | TextureUsage::STORAGE_BINDING;
            }
            let texture = backend.create_texture(&TextureDescriptor {
                label: Some(format!("{}_{}", self.label, desc.name)),
                width: self.width,
                height: self.height,
                mip_levels,
                format: desc.format,
                usage,
                ..Default::default()
            })?;
            let view = backend.create_texture_view(
                texture,
                &TextureViewDescriptor {
                    mip_level_count: Some(1),
                    ..Default::default()
                },
            )?;
            let sampled_view = if mip_levels > 1 {
                backend.create_texture_view(texture, &TextureViewDescriptor::default())?
            } else {
                view
            };
            let sampler = backend.create_sampler(&SamplerDescriptor {
                label: Some(format!("{}_{}_sampler", self.label, desc.name)),
                mag_filter: desc.filter,
                min_filter: desc.filter,
                mipmap_filter: desc.filter,
                ..Default::default()
            })?;
            self.colors.push(Attachment {
                desc: desc.clone(),
                texture,
                view,
                sampled_view,
                sampler,
            });
        }

        if let Some(format) = self.depth_format {
            let texture = backend.create_texture(&TextureDescriptor {
                label: Some(format!("{}_depth", self.label)),
                width: self.width,
                height: self.height,
                format,
                usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
                ..Default::default()
            })?;
            let view = backend.create_texture_view(texture, &TextureViewDescriptor::default())?;
            self.depth = Some((texture, view));
        }

        log::info!(
            "Created render target '{}' ({}x{}, {} color attachments{})",
            self.label,
            self.width,
            self.height,
            self.colors.len(),
            if self.depth.is_some() { " + depth" } else { "" }
        );
        Ok(())
    }

    fn release<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) {
        for attachment in self.colors.drain(..) {
            backend.destroy_texture(attachment.texture);
        }
        if let Some((texture, _)) = self.depth.take() {
            backend.destroy_texture(texture);
        }
    }

    /// Reallocate every attachment at a new size
    pub fn resize<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        width: u32,
        height: u32,
    ) -> RenderResult<()> {
        let (width, height) = (width.max(1), height.max(1));
        if width == self.width && height == self.height {
            return Ok(());
        }
        self.release(backend);
        self.width = width;
        self.height = height;
        self.allocate(backend)
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(mut self, backend: &mut B) {
        self.release(backend);
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn color_attachments(&self) -> &[Attachment] {
        &self.colors
    }

    pub fn color_formats(&self) -> Vec<TextureFormat> {
        self.colors.iter().map(|a| a.desc.format).collect()
    }

    pub fn depth_format(&self) -> Option<TextureFormat> {
        self.depth_format
    }

    /// Look up an attachment by name
    pub fn attachment(&self, name: &str) -> RenderResult<&Attachment> {
        self.colors
            .iter()
            .find(|a| a.desc.name == name)
            .ok_or_else(|| RenderError::MissingAttachment(self.label.clone(), name.to_string()))
    }

    pub fn view(&self, name: &str) -> RenderResult<TextureViewHandle> {
        self.attachment(name).map(|a| a.sampled_view)
    }

    pub fn texture(&self, name: &str) -> RenderResult<TextureHandle> {
        self.attachment(name).map(|a| a.texture)
    }

    pub fn depth_view(&self) -> RenderResult<TextureViewHandle> {
        self.depth
            .map(|(_, view)| view)
            .ok_or_else(|| RenderError::MissingAttachment(self.label.clone(), "depth".into()))
    }

    /// Pass descriptor writing every attachment, optionally clearing it first
    pub fn pass_descriptor(&self, label: &str, clear: Option<[f32; 4]>) -> RenderPassDescriptor {
        let load_op = match clear {
            Some(color) => LoadOp::Clear(color),
            None => LoadOp::Load,
        };
        RenderPassDescriptor {
            label: Some(label.to_string()),
            color_attachments: self
                .colors
                .iter()
                .map(|a| ColorAttachment {
                    view: a.view,
                    load_op: load_op.clone(),
                    store_op: StoreOp::Store,
                })
                .collect(),
            depth_stencil_attachment: self.depth.map(|(_, view)| DepthStencilAttachment {
                view,
                depth_load_op: if clear.is_some() {
                    LoadOp::Clear([1.0; 4])
                } else {
                    LoadOp::Load
                },
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
            }),
        }
    }
}

/// Stack of bound targets; each binding is one open render pass
///
/// Binding a target ends the pass of the one below it. Unbinding reopens the
/// previous target with its contents loaded.
#[derive(Debug, Default)]
pub struct TargetStack {
    stack: Vec<RenderPassDescriptor>,
}

impl TargetStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Label of the pass currently open
    pub fn current(&self) -> Option<&str> {
        self.stack.last().and_then(|d| d.label.as_deref())
    }

    pub fn push<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B, desc: RenderPassDescriptor) {
        if !self.stack.is_empty() {
            backend.end_render_pass();
        }
        backend.begin_render_pass(&desc);
        self.stack.push(into_load(desc));
    }

    pub fn pop<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> RenderResult<()> {
        self.stack.pop().ok_or(RenderError::NoBoundTarget)?;
        backend.end_render_pass();
        if let Some(previous) = self.stack.last() {
            backend.begin_render_pass(previous);
        }
        Ok(())
    }
}

/// The same pass with every clear turned into a load
fn into_load(mut desc: RenderPassDescriptor) -> RenderPassDescriptor {
    for attachment in &mut desc.color_attachments {
        attachment.load_op = LoadOp::Load;
    }
    if let Some(depth) = &mut desc.depth_stencil_attachment {
        depth.depth_load_op = LoadOp::Load;
    }
    desc
}
