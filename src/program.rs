//! Shader programs with reflected resource bindings
//!
//! A [`Program`] wraps one render or compute pipeline. Its WGSL source is parsed
//! and validated with naga, and bind group 0 is built from what the shader
//! declares there:
//! - at most one `var<uniform>` block, fed from a per-program ring buffer with a
//!   dynamic offset so every `use_program` call can carry its own values
//! - storage buffers, textures, samplers and storage textures, bound by slot
//!
//! Uniform fields are addressed by name and checked against the reflected size.

use std::collections::HashMap;

use bytemuck::Pod;
use naga::valid::{Capabilities, ValidationFlags, Validator};
use naga::{AddressSpace, ImageClass, ImageDimension, ScalarKind, ShaderStage, StorageFormat, TypeInner};

use crate::backend::{
    BindGroupEntry, BindGroupHandle, BindGroupLayoutEntry, BindGroupLayoutHandle, BindingType,
    BufferHandle, BufferUsage, ComputePipelineDescriptor, ComputePipelineHandle, GraphicsBackend,
    RenderPipelineDescriptor, RenderPipelineHandle, SamplerHandle, ShaderStageFlags,
    TextureFormat, TextureSampleType, TextureViewDimension, TextureViewHandle,
};
use crate::error::{RenderError, RenderResult};
use crate::resources::RingBuffer;

/// Uniform slots reserved per program and frame before the ring wraps
pub const UNIFORM_SLOTS_PER_FRAME: u64 = 256;

/// Byte range of one named field inside the uniform block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformField {
    pub offset: usize,
    pub size: usize,
}

/// One resource declared in bind group 0
#[derive(Debug, Clone)]
pub struct ReflectedBinding {
    pub binding: u32,
    pub name: String,
    pub ty: BindingType,
}

/// Everything a program needs to know about its shader
#[derive(Debug, Clone, Default)]
pub struct Reflection {
    pub bindings: Vec<ReflectedBinding>,
    pub uniform_binding: Option<u32>,
    pub uniform_size: usize,
    pub uniform_fields: HashMap<String, UniformField>,
    pub entry_points: Vec<(String, ShaderStage)>,
    /// Workgroup size of the first compute entry point
    pub workgroup_size: Option<[u32; 3]>,
}

impl Reflection {
    pub fn binding(&self, slot: u32) -> Option<&ReflectedBinding> {
        self.bindings.iter().find(|b| b.binding == slot)
    }

    pub fn has_entry_point(&self, name: &str, stage: ShaderStage) -> bool {
        self.entry_points
            .iter()
            .any(|(n, s)| n == name && *s == stage)
    }
}

/// Parse, validate and reflect a WGSL source
pub fn reflect(label: &str, source: &str) -> RenderResult<Reflection> {
    let compile_error = |message: String| RenderError::ShaderCompilation {
        label: label.to_string(),
        message,
    };

    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| compile_error(e.emit_to_string(source)))?;
    Validator::new(ValidationFlags::all(), Capabilities::all())
        .validate(&module)
        .map_err(|e| compile_error(e.into_inner().to_string()))?;

    let mut reflection = Reflection {
        entry_points: module
            .entry_points
            .iter()
            .map(|ep| (ep.name.clone(), ep.stage))
            .collect(),
        workgroup_size: module
            .entry_points
            .iter()
            .find(|ep| ep.stage == ShaderStage::Compute)
            .map(|ep| ep.workgroup_size),
        ..Default::default()
    };

    for (_, var) in module.global_variables.iter() {
        let Some(binding) = &var.binding else {
            continue;
        };
        let name = var.name.clone().unwrap_or_default();
        if binding.group != 0 {
            return Err(compile_error(format!(
                "'{}' uses bind group {}; programs only manage group 0",
                name, binding.group
            )));
        }

        let inner = &module.types[var.ty].inner;
        let ty = match var.space {
            AddressSpace::Uniform => {
                if reflection.uniform_binding.is_some() {
                    return Err(compile_error("more than one uniform block".into()));
                }
                reflection.uniform_binding = Some(binding.binding);
                reflection.uniform_size = inner.size(module.to_ctx()) as usize;
                match inner {
                    TypeInner::Struct { members, .. } => {
                        for member in members {
                            let Some(member_name) = &member.name else {
                                continue;
                            };
                            let size = module.types[member.ty].inner.size(module.to_ctx());
                            reflection.uniform_fields.insert(
                                member_name.clone(),
                                UniformField {
                                    offset: member.offset as usize,
                                    size: size as usize,
                                },
                            );
                        }
                    }
                    _ => {
                        reflection.uniform_fields.insert(
                            name.clone(),
                            UniformField {
                                offset: 0,
                                size: reflection.uniform_size,
                            },
                        );
                    }
                }
                BindingType::UniformBuffer {
                    dynamic_offset: true,
                }
            }
            AddressSpace::Storage { access } => BindingType::StorageBuffer {
                read_only: !access.contains(naga::StorageAccess::STORE),
            },
            AddressSpace::Handle => match inner {
                TypeInner::Sampler { comparison } => BindingType::Sampler {
                    comparison: *comparison,
                },
                TypeInner::Image {
                    dim,
                    arrayed,
                    class,
                } => {
                    let view_dimension = view_dimension(*dim, *arrayed);
                    match class {
                        ImageClass::Sampled { kind, .. } => BindingType::Texture {
                            sample_type: match kind {
                                ScalarKind::Sint => TextureSampleType::Sint,
                                ScalarKind::Uint => TextureSampleType::Uint,
                                _ => TextureSampleType::Float { filterable: true },
                            },
                            view_dimension,
                        },
                        ImageClass::Depth { .. } => BindingType::Texture {
                            sample_type: TextureSampleType::Depth,
                            view_dimension,
                        },
                        ImageClass::Storage { format, .. } => BindingType::StorageTexture {
                            format: storage_format(*format).ok_or_else(|| {
                                compile_error(format!(
                                    "unsupported storage format {:?} on '{}'",
                                    format, name
                                ))
                            })?,
                        },
                    }
                }
                other => {
                    return Err(compile_error(format!(
                        "unsupported handle type {:?} on '{}'",
                        other, name
                    )))
                }
            },
            other => {
                return Err(compile_error(format!(
                    "unsupported address space {:?} on '{}'",
                    other, name
                )))
            }
        };

        reflection.bindings.push(ReflectedBinding {
            binding: binding.binding,
            name,
            ty,
        });
    }

    reflection.bindings.sort_by_key(|b| b.binding);
    Ok(reflection)
}

fn view_dimension(dim: ImageDimension, arrayed: bool) -> TextureViewDimension {
    match (dim, arrayed) {
        (ImageDimension::Cube, true) => TextureViewDimension::CubeArray,
        (ImageDimension::Cube, false) => TextureViewDimension::Cube,
        (ImageDimension::D3, _) => TextureViewDimension::D3,
        (_, true) => TextureViewDimension::D2Array,
        (_, false) => TextureViewDimension::D2,
    }
}

fn storage_format(format: StorageFormat) -> Option<TextureFormat> {
    match format {
        StorageFormat::Rgba8Unorm => Some(TextureFormat::Rgba8Unorm),
        StorageFormat::Rgba16Float => Some(TextureFormat::Rgba16Float),
        StorageFormat::Rgba32Float => Some(TextureFormat::Rgba32Float),
        StorageFormat::R32Float => Some(TextureFormat::R32Float),
        StorageFormat::Rg16Float => Some(TextureFormat::Rg16Float),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy)]
enum PipelineKind {
    Render(RenderPipelineHandle),
    Compute(ComputePipelineHandle),
}

/// A compiled pipeline plus its bind group 0 state
pub struct Program {
    label: String,
    pipeline: PipelineKind,
    reflection: Reflection,
    layout: Option<BindGroupLayoutHandle>,
    uniform_data: Vec<u8>,
    uniform_ring: Option<RingBuffer>,
    /// Ring offset holding the current uniform values, if uploaded this frame
    uploaded_offset: Option<u32>,
    resources: HashMap<u32, BindGroupEntry>,
    bind_group: Option<BindGroupHandle>,
}

impl Program {
    /// Build a render program; `desc.bind_group_layouts` is filled from reflection
    pub fn render<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        mut desc: RenderPipelineDescriptor,
    ) -> RenderResult<Self> {
        let label = desc.label.clone().unwrap_or_else(|| "program".into());
        let reflection = reflect(&label, &desc.shader)?;

        let missing_entry = |entry: &str| RenderError::ShaderCompilation {
            label: label.clone(),
            message: format!("missing entry point '{}'", entry),
        };
        if !reflection.has_entry_point(&desc.vertex_entry, ShaderStage::Vertex) {
            return Err(missing_entry(&desc.vertex_entry));
        }
        if let Some(fragment) = &desc.fragment_entry {
            if !reflection.has_entry_point(fragment, ShaderStage::Fragment) {
                return Err(missing_entry(fragment));
            }
        }

        let layout = create_layout(backend, &reflection, false)?;
        desc.bind_group_layouts = layout.into_iter().collect();
        let pipeline = backend.create_render_pipeline(&desc)?;
        Self::finish(backend, label, PipelineKind::Render(pipeline), reflection, layout)
    }

    pub fn compute<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        label: &str,
        source: &str,
        entry_point: &str,
    ) -> RenderResult<Self> {
        let reflection = reflect(label, source)?;
        if !reflection.has_entry_point(entry_point, ShaderStage::Compute) {
            return Err(RenderError::ShaderCompilation {
                label: label.to_string(),
                message: format!("missing compute entry point '{}'", entry_point),
            });
        }
        let layout = create_layout(backend, &reflection, true)?;
        let pipeline = backend.create_compute_pipeline(&ComputePipelineDescriptor {
            label: Some(label.to_string()),
            shader: source.to_string(),
            entry_point: entry_point.to_string(),
            bind_group_layouts: layout.into_iter().collect(),
        })?;
        Self::finish(
            backend,
            label.to_string(),
            PipelineKind::Compute(pipeline),
            reflection,
            layout,
        )
    }

    fn finish<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        label: String,
        pipeline: PipelineKind,
        reflection: Reflection,
        layout: Option<BindGroupLayoutHandle>,
    ) -> RenderResult<Self> {
        let mut resources = HashMap::new();
        let uniform_ring = match reflection.uniform_binding {
            Some(slot) => {
                let slot_size = (reflection.uniform_size as u64)
                    .max(1)
                    .next_multiple_of(RingBuffer::DEFAULT_ALIGNMENT);
                let ring = RingBuffer::new(
                    backend,
                    &format!("{}_uniforms", label),
                    slot_size * UNIFORM_SLOTS_PER_FRAME,
                    BufferUsage::UNIFORM,
                )?;
                resources.insert(
                    slot,
                    BindGroupEntry::Buffer {
                        buffer: ring.buffer(),
                        offset: 0,
                        size: Some(reflection.uniform_size as u64),
                    },
                );
                Some(ring)
            }
            None => None,
        };

        log::debug!(
            "Created program '{}' with {} bindings, {} byte uniform block",
            label,
            reflection.bindings.len(),
            reflection.uniform_size
        );
        Ok(Self {
            label,
            pipeline,
            uniform_data: vec![0; reflection.uniform_size],
            reflection,
            layout,
            uniform_ring,
            uploaded_offset: None,
            resources,
            bind_group: None,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn reflection(&self) -> &Reflection {
        &self.reflection
    }

    pub fn is_compute(&self) -> bool {
        matches!(self.pipeline, PipelineKind::Compute(_))
    }

    pub fn has_uniform(&self, name: &str) -> bool {
        self.reflection.uniform_fields.contains_key(name)
    }

    /// Slot of a named binding
    pub fn binding_slot(&self, name: &str) -> Option<u32> {
        self.reflection
            .bindings
            .iter()
            .find(|b| b.name == name)
            .map(|b| b.binding)
    }

    /// Write raw bytes into a named uniform field
    pub fn set_uniform(&mut self, name: &str, bytes: &[u8]) -> RenderResult<()> {
        let field = self
            .reflection
            .uniform_fields
            .get(name)
            .copied()
            .ok_or_else(|| RenderError::UnknownUniform {
                program: self.label.clone(),
                name: name.to_string(),
            })?;
        if bytes.len() != field.size {
            return Err(RenderError::UniformSizeMismatch {
                name: name.to_string(),
                expected: field.size,
                actual: bytes.len(),
            });
        }
        self.uniform_data[field.offset..field.offset + field.size].copy_from_slice(bytes);
        self.uploaded_offset = None;
        Ok(())
    }

    pub fn set_uniform_value<T: Pod>(&mut self, name: &str, value: &T) -> RenderResult<()> {
        self.set_uniform(name, bytemuck::bytes_of(value))
    }

    /// Replace the whole uniform block with a struct mirroring it
    pub fn set_uniform_block<T: Pod>(&mut self, block: &T) -> RenderResult<()> {
        let bytes = bytemuck::bytes_of(block);
        if bytes.len() != self.uniform_data.len() {
            return Err(RenderError::UniformSizeMismatch {
                name: format!("{} block", self.label),
                expected: self.uniform_data.len(),
                actual: bytes.len(),
            });
        }
        self.uniform_data.copy_from_slice(bytes);
        self.uploaded_offset = None;
        Ok(())
    }

    fn bind(&mut self, slot: u32, entry: BindGroupEntry) {
        if self.reflection.binding(slot).is_none() {
            log::debug!("Program '{}' has no binding {}, ignoring", self.label, slot);
            return;
        }
        let changed = self
            .resources
            .get(&slot)
            .map_or(true, |current| entry_key(current) != entry_key(&entry));
        if changed {
            self.resources.insert(slot, entry);
            self.bind_group = None;
        }
    }

    pub fn bind_storage_buffer(&mut self, slot: u32, buffer: BufferHandle) {
        self.bind(
            slot,
            BindGroupEntry::Buffer {
                buffer,
                offset: 0,
                size: None,
            },
        );
    }

    pub fn bind_texture(&mut self, slot: u32, view: TextureViewHandle) {
        self.bind(slot, BindGroupEntry::Texture(view));
    }

    pub fn bind_storage_texture(&mut self, slot: u32, view: TextureViewHandle) {
        self.bind(slot, BindGroupEntry::StorageTexture(view));
    }

    pub fn bind_sampler(&mut self, slot: u32, sampler: SamplerHandle) {
        self.bind(slot, BindGroupEntry::Sampler(sampler));
    }

    fn ensure_bind_group<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> RenderResult<Option<BindGroupHandle>> {
        let Some(layout) = self.layout else {
            return Ok(None);
        };
        if let Some(bind_group) = self.bind_group {
            return Ok(Some(bind_group));
        }
        let entries = self
            .reflection
            .bindings
            .iter()
            .map(|b| {
                self.resources
                    .get(&b.binding)
                    .map(|entry| (b.binding, entry.clone()))
                    .ok_or_else(|| RenderError::UnboundResource {
                        program: self.label.clone(),
                        binding: b.binding,
                    })
            })
            .collect::<RenderResult<Vec<_>>>()?;
        let bind_group = backend.create_bind_group(layout, &entries)?;
        self.bind_group = Some(bind_group);
        Ok(Some(bind_group))
    }

    /// Bind the pipeline and bind group 0, uploading the uniform values if they
    /// changed since the last use this frame
    pub fn use_program<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> RenderResult<()> {
        let bind_group = self.ensure_bind_group(backend)?;
        match self.pipeline {
            PipelineKind::Render(pipeline) => backend.set_render_pipeline(pipeline),
            PipelineKind::Compute(pipeline) => backend.set_compute_pipeline(pipeline),
        }
        let Some(bind_group) = bind_group else {
            return Ok(());
        };
        let offsets = match (&mut self.uniform_ring, self.uploaded_offset) {
            (Some(_), Some(offset)) => vec![offset],
            (Some(ring), None) => {
                let offset = ring
                    .push(backend, &self.uniform_data)
                    .map_or(0, |allocation| allocation.offset as u32);
                self.uploaded_offset = Some(offset);
                vec![offset]
            }
            (None, _) => Vec::new(),
        };
        backend.set_bind_group(0, bind_group, &offsets);
        Ok(())
    }

    /// Dispatch enough workgroups to cover `x * y * z` invocations
    pub fn dispatch_compute<B: GraphicsBackend + ?Sized>(
        &self,
        backend: &mut B,
        x: u32,
        y: u32,
        z: u32,
    ) -> RenderResult<()> {
        if !self.is_compute() {
            return Err(RenderError::NotAComputeProgram(self.label.clone()));
        }
        let [wx, wy, wz] = self.reflection.workgroup_size.unwrap_or([1, 1, 1]);
        backend.dispatch_compute(
            x.div_ceil(wx.max(1)),
            y.div_ceil(wy.max(1)),
            z.div_ceil(wz.max(1)),
        );
        Ok(())
    }

    /// Recycle the uniform ring for a new frame
    pub fn begin_frame(&mut self) {
        if let Some(ring) = &mut self.uniform_ring {
            ring.reset();
        }
        self.uploaded_offset = None;
    }

    /// Release the uniform ring; the pipeline itself is dropped with the backend
    pub fn destroy<B: GraphicsBackend + ?Sized>(self, backend: &mut B) {
        if let Some(ring) = self.uniform_ring {
            ring.destroy(backend);
        }
    }
}

impl std::fmt::Debug for Program {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Program")
            .field("label", &self.label)
            .field("pipeline", &self.pipeline)
            .field("bindings", &self.reflection.bindings.len())
            .finish()
    }
}

fn create_layout<B: GraphicsBackend + ?Sized>(
    backend: &mut B,
    reflection: &Reflection,
    compute: bool,
) -> RenderResult<Option<BindGroupLayoutHandle>> {
    if reflection.bindings.is_empty() {
        return Ok(None);
    }
    let entries: Vec<BindGroupLayoutEntry> = reflection
        .bindings
        .iter()
        .map(|b| BindGroupLayoutEntry {
            binding: b.binding,
            visibility: if compute {
                ShaderStageFlags::COMPUTE
            } else {
                match b.ty {
                    // Writable resources are not allowed in the vertex stage
                    BindingType::StorageBuffer { read_only: false }
                    | BindingType::StorageTexture { .. } => ShaderStageFlags::FRAGMENT,
                    _ => ShaderStageFlags::VERTEX_FRAGMENT,
                }
            },
            ty: b.ty.clone(),
        })
        .collect();
    Ok(Some(backend.create_bind_group_layout(&entries)?))
}

fn entry_key(entry: &BindGroupEntry) -> (u8, u64, u64, u64) {
    match entry {
        BindGroupEntry::Buffer {
            buffer,
            offset,
            size,
        } => (0, buffer.0, *offset, size.unwrap_or(u64::MAX)),
        BindGroupEntry::Texture(view) => (1, view.0, 0, 0),
        BindGroupEntry::Sampler(sampler) => (2, sampler.0, 0, 0),
        BindGroupEntry::StorageTexture(view) => (3, view.0, 0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordedCommand;
    use crate::backend::{
        BufferDescriptor, ColorTargetState, CullMode, FrontFace, PrimitiveTopology,
        SamplerDescriptor, TextureDescriptor, TextureViewDescriptor,
    };
    use crate::backend::RecordingBackend;

    const RENDER_SHADER: &str = r#"
struct Params {
    color: vec4<f32>,
    scale: f32,
    offset: vec2<f32>,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> transforms: array<mat4x4<f32>>;
@group(0) @binding(2) var albedo: texture_2d<f32>;
@group(0) @binding(3) var albedo_sampler: sampler;

@vertex
fn vs_main(@location(0) position: vec3<f32>, @builtin(instance_index) instance: u32) -> @builtin(position) vec4<f32> {
    let local = position * params.scale + vec3<f32>(params.offset, 0.0);
    return transforms[instance] * vec4<f32>(local, 1.0);
}

@fragment
fn fs_main(@builtin(position) frag: vec4<f32>) -> @location(0) vec4<f32> {
    return params.color * textureSample(albedo, albedo_sampler, frag.xy);
}
"#;

    const COMPUTE_SHADER: &str = r#"
struct Params {
    count: u32,
}

@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read_write> values: array<f32>;

@compute @workgroup_size(8, 8, 1)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < params.count) {
        values[id.x] = 1.0;
    }
}
"#;

    fn render_desc() -> RenderPipelineDescriptor {
        RenderPipelineDescriptor {
            label: Some("test_program".into()),
            shader: RENDER_SHADER.into(),
            vertex_entry: "vs_main".into(),
            fragment_entry: Some("fs_main".into()),
            vertex_layouts: vec![],
            bind_group_layouts: vec![],
            primitive_topology: PrimitiveTopology::TriangleList,
            front_face: FrontFace::Ccw,
            cull_mode: CullMode::Back,
            depth_stencil: None,
            color_targets: vec![ColorTargetState::replace(TextureFormat::Rgba8Unorm)],
        }
    }

    fn bind_all(backend: &mut RecordingBackend, program: &mut Program) {
        let buffer = backend
            .create_buffer(&BufferDescriptor::new("transforms", 64, BufferUsage::STORAGE))
            .unwrap();
        let texture = backend.create_texture(&TextureDescriptor::default()).unwrap();
        let view = backend
            .create_texture_view(texture, &TextureViewDescriptor::default())
            .unwrap();
        let sampler = backend.create_sampler(&SamplerDescriptor::default()).unwrap();
        program.bind_storage_buffer(1, buffer);
        program.bind_texture(2, view);
        program.bind_sampler(3, sampler);
    }

    #[test]
    fn test_reflects_uniform_layout() {
        let reflection = reflect("test", RENDER_SHADER).unwrap();
        assert_eq!(reflection.uniform_binding, Some(0));
        assert_eq!(reflection.uniform_size, 32);
        assert_eq!(
            reflection.uniform_fields["offset"],
            UniformField { offset: 24, size: 8 }
        );
        assert_eq!(reflection.bindings.len(), 4);
        assert!(matches!(
            reflection.binding(1).unwrap().ty,
            BindingType::StorageBuffer { read_only: true }
        ));
        assert!(matches!(
            reflection.binding(3).unwrap().ty,
            BindingType::Sampler { comparison: false }
        ));
    }

    #[test]
    fn test_invalid_source_is_a_compile_error() {
        let err = reflect("broken", "fn main( {").unwrap_err();
        assert!(matches!(err, RenderError::ShaderCompilation { label, .. } if label == "broken"));
    }

    #[test]
    fn test_set_uniform_checks_name_and_size() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut program = Program::render(&mut backend, render_desc()).unwrap();

        program.set_uniform_value("scale", &2.0f32).unwrap();
        program.set_uniform_value("color", &[1.0f32, 0.5, 0.25, 1.0]).unwrap();

        let err = program.set_uniform_value("exposure", &1.0f32).unwrap_err();
        assert!(matches!(err, RenderError::UnknownUniform { .. }));

        let err = program.set_uniform_value("scale", &[1.0f32, 2.0]).unwrap_err();
        assert!(matches!(
            err,
            RenderError::UniformSizeMismatch { expected: 4, actual: 8, .. }
        ));
    }

    #[test]
    fn test_use_requires_every_binding() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut program = Program::render(&mut backend, render_desc()).unwrap();
        let err = program.use_program(&mut backend).unwrap_err();
        assert!(matches!(err, RenderError::UnboundResource { binding: 1, .. }));

        bind_all(&mut backend, &mut program);
        program.use_program(&mut backend).unwrap();
        assert!(backend.commands().iter().any(|c| matches!(
            c,
            RecordedCommand::SetRenderPipeline { label, cull_mode: CullMode::Back, .. }
                if label == "test_program"
        )));
    }

    #[test]
    fn test_changed_uniforms_get_a_new_slot() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut program = Program::render(&mut backend, render_desc()).unwrap();
        bind_all(&mut backend, &mut program);

        program.set_uniform_value("scale", &1.0f32).unwrap();
        program.use_program(&mut backend).unwrap();
        program.use_program(&mut backend).unwrap();
        program.set_uniform_value("scale", &3.0f32).unwrap();
        program.use_program(&mut backend).unwrap();

        let writes: Vec<u64> = backend
            .commands()
            .iter()
            .filter_map(|c| match c {
                RecordedCommand::WriteBuffer { offset, len: 32, .. } => Some(*offset),
                _ => None,
            })
            .collect();
        assert_eq!(writes, vec![0, 256]);
    }

    #[test]
    fn test_compute_dispatch_rounds_up_to_workgroups() {
        let mut backend = RecordingBackend::new(4, 4);
        let mut program = Program::compute(&mut backend, "fill", COMPUTE_SHADER, "main").unwrap();
        let buffer = backend
            .create_buffer(&BufferDescriptor::new("values", 64, BufferUsage::STORAGE))
            .unwrap();
        program.bind_storage_buffer(1, buffer);

        backend.begin_compute_pass(Some("fill"));
        program.use_program(&mut backend).unwrap();
        program.dispatch_compute(&mut backend, 20, 9, 1).unwrap();
        backend.end_compute_pass();

        assert!(backend
            .commands()
            .contains(&RecordedCommand::Dispatch { x: 3, y: 2, z: 1 }));
    }

    #[test]
    fn test_dispatch_on_render_program_fails() {
        let mut backend = RecordingBackend::new(4, 4);
        let program = Program::render(&mut backend, render_desc()).unwrap();
        let err = program.dispatch_compute(&mut backend, 1, 1, 1).unwrap_err();
        assert!(matches!(err, RenderError::NotAComputeProgram(_)));
    }
}
