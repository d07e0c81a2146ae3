//! Conversions from backend-neutral types to wgpu types

use crate::backend::traits::*;
use crate::backend::types::*;

/// Round a byte count up to the copy alignment wgpu requires
pub(super) fn align_to_copy(size: u64) -> u64 {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    (size + align - 1) & !(align - 1)
}

pub(super) fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
    }
}

pub(super) fn convert_texture_format_back(format: wgpu::TextureFormat) -> TextureFormat {
    match format {
        wgpu::TextureFormat::Rgba8Unorm => TextureFormat::Rgba8Unorm,
        wgpu::TextureFormat::Rgba8UnormSrgb => TextureFormat::Rgba8UnormSrgb,
        wgpu::TextureFormat::Bgra8Unorm => TextureFormat::Bgra8Unorm,
        wgpu::TextureFormat::Bgra8UnormSrgb => TextureFormat::Bgra8UnormSrgb,
        wgpu::TextureFormat::Rgba16Float => TextureFormat::Rgba16Float,
        wgpu::TextureFormat::Rgba32Float => TextureFormat::Rgba32Float,
        other => {
            log::warn!("Unmapped surface format {:?}, assuming Bgra8UnormSrgb", other);
            TextureFormat::Bgra8UnormSrgb
        }
    }
}

pub(super) fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    const TABLE: [(BufferUsage, wgpu::BufferUsages); 9] = [
        (BufferUsage::MAP_READ, wgpu::BufferUsages::MAP_READ),
        (BufferUsage::MAP_WRITE, wgpu::BufferUsages::MAP_WRITE),
        (BufferUsage::COPY_SRC, wgpu::BufferUsages::COPY_SRC),
        (BufferUsage::COPY_DST, wgpu::BufferUsages::COPY_DST),
        (BufferUsage::INDEX, wgpu::BufferUsages::INDEX),
        (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::INDIRECT, wgpu::BufferUsages::INDIRECT),
    ];
    TABLE
        .iter()
        .filter(|(ours, _)| usage.contains(*ours))
        .fold(wgpu::BufferUsages::empty(), |acc, (_, theirs)| acc | *theirs)
}

pub(super) fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
    const TABLE: [(TextureUsage, wgpu::TextureUsages); 5] = [
        (TextureUsage::COPY_SRC, wgpu::TextureUsages::COPY_SRC),
        (TextureUsage::COPY_DST, wgpu::TextureUsages::COPY_DST),
        (TextureUsage::TEXTURE_BINDING, wgpu::TextureUsages::TEXTURE_BINDING),
        (TextureUsage::STORAGE_BINDING, wgpu::TextureUsages::STORAGE_BINDING),
        (TextureUsage::RENDER_ATTACHMENT, wgpu::TextureUsages::RENDER_ATTACHMENT),
    ];
    TABLE
        .iter()
        .filter(|(ours, _)| usage.contains(*ours))
        .fold(wgpu::TextureUsages::empty(), |acc, (_, theirs)| acc | *theirs)
}

pub(super) fn convert_view_dimension(dimension: TextureViewDimension) -> wgpu::TextureViewDimension {
    match dimension {
        TextureViewDimension::D2 => wgpu::TextureViewDimension::D2,
        TextureViewDimension::D2Array => wgpu::TextureViewDimension::D2Array,
        TextureViewDimension::Cube => wgpu::TextureViewDimension::Cube,
        TextureViewDimension::CubeArray => wgpu::TextureViewDimension::CubeArray,
        TextureViewDimension::D3 => wgpu::TextureViewDimension::D3,
    }
}

pub(super) fn convert_shader_stages(stages: ShaderStageFlags) -> wgpu::ShaderStages {
    let mut result = wgpu::ShaderStages::empty();
    if stages.contains(ShaderStageFlags::VERTEX) {
        result |= wgpu::ShaderStages::VERTEX;
    }
    if stages.contains(ShaderStageFlags::FRAGMENT) {
        result |= wgpu::ShaderStages::FRAGMENT;
    }
    if stages.contains(ShaderStageFlags::COMPUTE) {
        result |= wgpu::ShaderStages::COMPUTE;
    }
    result
}

pub(super) fn convert_binding_type(ty: &BindingType) -> wgpu::BindingType {
    match ty {
        BindingType::UniformBuffer { dynamic_offset } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: *dynamic_offset,
            min_binding_size: None,
        },
        BindingType::StorageBuffer { read_only } => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: *read_only,
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        BindingType::Texture {
            sample_type,
            view_dimension,
        } => wgpu::BindingType::Texture {
            sample_type: match sample_type {
                TextureSampleType::Float { filterable } => wgpu::TextureSampleType::Float {
                    filterable: *filterable,
                },
                TextureSampleType::Depth => wgpu::TextureSampleType::Depth,
                TextureSampleType::Sint => wgpu::TextureSampleType::Sint,
                TextureSampleType::Uint => wgpu::TextureSampleType::Uint,
            },
            view_dimension: convert_view_dimension(*view_dimension),
            multisampled: false,
        },
        BindingType::StorageTexture { format } => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: convert_texture_format(*format),
            view_dimension: wgpu::TextureViewDimension::D2,
        },
        BindingType::Sampler { comparison } => wgpu::BindingType::Sampler(if *comparison {
            wgpu::SamplerBindingType::Comparison
        } else {
            wgpu::SamplerBindingType::Filtering
        }),
    }
}

pub(super) fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32 => wgpu::VertexFormat::Float32,
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        VertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
    }
}

pub(super) fn convert_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
        PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
        PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

pub(super) fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
    match func {
        CompareFunction::Never => wgpu::CompareFunction::Never,
        CompareFunction::Less => wgpu::CompareFunction::Less,
        CompareFunction::Equal => wgpu::CompareFunction::Equal,
        CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunction::Greater => wgpu::CompareFunction::Greater,
        CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunction::Always => wgpu::CompareFunction::Always,
    }
}

fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::Src => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::Dst => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
    }
}

fn convert_blend_component(component: &BlendComponent) -> wgpu::BlendComponent {
    wgpu::BlendComponent {
        src_factor: convert_blend_factor(component.src_factor),
        dst_factor: convert_blend_factor(component.dst_factor),
        operation: match component.operation {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
            BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOperation::Min => wgpu::BlendOperation::Min,
            BlendOperation::Max => wgpu::BlendOperation::Max,
        },
    }
}

pub(super) fn convert_blend_state(blend: &BlendState) -> wgpu::BlendState {
    wgpu::BlendState {
        color: convert_blend_component(&blend.color),
        alpha: convert_blend_component(&blend.alpha),
    }
}

pub(super) fn convert_filter_mode(mode: FilterMode) -> wgpu::FilterMode {
    match mode {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

pub(super) fn convert_address_mode(mode: AddressMode) -> wgpu::AddressMode {
    match mode {
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

pub(super) fn convert_store_op(op: StoreOp) -> wgpu::StoreOp {
    match op {
        StoreOp::Store => wgpu::StoreOp::Store,
        StoreOp::Discard => wgpu::StoreOp::Discard,
    }
}

pub(super) fn convert_index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
        IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
    }
}

pub(super) fn color_ops(attachment: &ColorAttachment) -> wgpu::Operations<wgpu::Color> {
    let load = match attachment.load_op {
        LoadOp::Clear([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color {
            r: r.into(),
            g: g.into(),
            b: b.into(),
            a: a.into(),
        }),
        LoadOp::Load => wgpu::LoadOp::Load,
    };
    wgpu::Operations {
        load,
        store: convert_store_op(attachment.store_op),
    }
}

/// Depth clears use `depth_clear_value`; the color in the load op is ignored
pub(super) fn depth_ops(attachment: &DepthStencilAttachment) -> wgpu::Operations<f32> {
    let load = match attachment.depth_load_op {
        LoadOp::Clear(_) => wgpu::LoadOp::Clear(attachment.depth_clear_value),
        LoadOp::Load => wgpu::LoadOp::Load,
    };
    wgpu::Operations {
        load,
        store: convert_store_op(attachment.depth_store_op),
    }
}

pub(super) fn vertex_attributes(layout: &VertexBufferLayout) -> Vec<wgpu::VertexAttribute> {
    layout
        .attributes
        .iter()
        .map(|attribute| wgpu::VertexAttribute {
            format: convert_vertex_format(attribute.format),
            offset: attribute.offset,
            shader_location: attribute.location,
        })
        .collect()
}

pub(super) fn convert_step_mode(mode: VertexStepMode) -> wgpu::VertexStepMode {
    match mode {
        VertexStepMode::Vertex => wgpu::VertexStepMode::Vertex,
        VertexStepMode::Instance => wgpu::VertexStepMode::Instance,
    }
}

pub(super) fn convert_primitive(desc: &RenderPipelineDescriptor) -> wgpu::PrimitiveState {
    wgpu::PrimitiveState {
        topology: convert_topology(desc.primitive_topology),
        front_face: match desc.front_face {
            FrontFace::Ccw => wgpu::FrontFace::Ccw,
            FrontFace::Cw => wgpu::FrontFace::Cw,
        },
        cull_mode: match desc.cull_mode {
            CullMode::None => None,
            CullMode::Front => Some(wgpu::Face::Front),
            CullMode::Back => Some(wgpu::Face::Back),
        },
        ..Default::default()
    }
}

pub(super) fn convert_depth_state(state: &DepthStencilState) -> wgpu::DepthStencilState {
    wgpu::DepthStencilState {
        format: convert_texture_format(state.format),
        depth_write_enabled: state.depth_write_enabled,
        depth_compare: convert_compare_function(state.depth_compare),
        stencil: Default::default(),
        bias: Default::default(),
    }
}

pub(super) fn convert_color_target(target: &ColorTargetState) -> Option<wgpu::ColorTargetState> {
    Some(wgpu::ColorTargetState {
        format: convert_texture_format(target.format),
        blend: target.blend.as_ref().map(convert_blend_state),
        write_mask: wgpu::ColorWrites::from_bits_truncate(target.write_mask.bits()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to_copy() {
        assert_eq!(align_to_copy(0), 0);
        assert_eq!(align_to_copy(1), 4);
        assert_eq!(align_to_copy(20), 20);
        assert_eq!(align_to_copy(21), 24);
    }

    #[test]
    fn test_depth_clear_uses_clear_value() {
        let attachment = DepthStencilAttachment {
            view: TextureViewHandle(1),
            depth_load_op: LoadOp::Clear([0.0; 4]),
            depth_store_op: StoreOp::Store,
            depth_clear_value: 1.0,
        };
        assert_eq!(depth_ops(&attachment).load, wgpu::LoadOp::Clear(1.0));
    }

    #[test]
    fn test_usage_conversion() {
        let usage = convert_buffer_usage(BufferUsage::STORAGE | BufferUsage::INDIRECT);
        assert!(usage.contains(wgpu::BufferUsages::STORAGE));
        assert!(usage.contains(wgpu::BufferUsages::INDIRECT));
        assert!(!usage.contains(wgpu::BufferUsages::VERTEX));
    }
}
