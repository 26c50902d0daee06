// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Descriptor conversions into wgpu types.

use crate::format::{ChannelType, IndexFormat, TextureFormat, VertexFormat};
use crate::pipeline::{
    BlendComponent, BlendFactor, BlendOperation, BlendState, ColorWrites, CullMode, FrontFace,
    MegaStateDescriptor, PrimitiveTopology, StencilFaceState, StencilOperation, VertexStepMode,
};
use crate::resources::{
    AddressMode, BufferUsage, CompareFunction, FilterMode, SamplerDescriptor, TextureDescriptor,
    TextureDimension, TextureUsage,
};

pub(super) const fn texture_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        TextureFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        TextureFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
        TextureFormat::R16Float => wgpu::TextureFormat::R16Float,
        TextureFormat::Rg16Float => wgpu::TextureFormat::Rg16Float,
        TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        TextureFormat::R32Float => wgpu::TextureFormat::R32Float,
        TextureFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
        TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        TextureFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        TextureFormat::R32Sint => wgpu::TextureFormat::R32Sint,
        TextureFormat::Rgba32Uint => wgpu::TextureFormat::Rgba32Uint,
        TextureFormat::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
        TextureFormat::Depth24Plus => wgpu::TextureFormat::Depth24Plus,
        TextureFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
    }
}

/// The inverse of [`texture_format`], for the formats a surface may offer.
pub(super) fn surface_format(format: wgpu::TextureFormat) -> Option<TextureFormat> {
    match format {
        wgpu::TextureFormat::Bgra8Unorm => Some(TextureFormat::Bgra8Unorm),
        wgpu::TextureFormat::Bgra8UnormSrgb => Some(TextureFormat::Bgra8UnormSrgb),
        wgpu::TextureFormat::Rgba8Unorm => Some(TextureFormat::Rgba8Unorm),
        wgpu::TextureFormat::Rgba8UnormSrgb => Some(TextureFormat::Rgba8UnormSrgb),
        wgpu::TextureFormat::Rgba16Float => Some(TextureFormat::Rgba16Float),
        _ => None,
    }
}

/// Depth24 formats have no defined memory layout, so they can never be copied.
pub(super) fn copyable(desc: &TextureDescriptor) -> bool {
    desc.sample_count == 1
        && !matches!(
            desc.format,
            TextureFormat::Depth24Plus | TextureFormat::Depth24PlusStencil8
        )
}

pub(super) fn texture_usage(desc: &TextureDescriptor) -> wgpu::TextureUsages {
    let mut usage = wgpu::TextureUsages::empty();
    if desc.usage.contains(TextureUsage::SAMPLED) {
        usage |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if desc.usage.contains(TextureUsage::RENDER_TARGET) || desc.format.is_depth() {
        usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if desc.usage.contains(TextureUsage::STORAGE) {
        usage |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    if copyable(desc) {
        usage |= wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
    }
    usage
}

pub(super) fn view_dimension(dimension: TextureDimension) -> wgpu::TextureViewDimension {
    match dimension {
        TextureDimension::D2 => wgpu::TextureViewDimension::D2,
        TextureDimension::D2Array => wgpu::TextureViewDimension::D2Array,
        TextureDimension::Cube => wgpu::TextureViewDimension::Cube,
    }
}

pub(super) fn buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    // every buffer can be written and read back
    let mut out = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
    if usage.contains(BufferUsage::VERTEX) {
        out |= wgpu::BufferUsages::VERTEX;
    }
    if usage.contains(BufferUsage::INDEX) {
        out |= wgpu::BufferUsages::INDEX;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        out |= wgpu::BufferUsages::UNIFORM;
    }
    if usage.contains(BufferUsage::STORAGE) {
        out |= wgpu::BufferUsages::STORAGE;
    }
    out
}

pub(super) const fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    match format {
        VertexFormat::Float32 => wgpu::VertexFormat::Float32,
        VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
        VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
        VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        VertexFormat::Float16x2 => wgpu::VertexFormat::Float16x2,
        VertexFormat::Float16x4 => wgpu::VertexFormat::Float16x4,
        VertexFormat::Unorm8x4 => wgpu::VertexFormat::Unorm8x4,
        VertexFormat::Uint8x4 => wgpu::VertexFormat::Uint8x4,
        VertexFormat::Uint32 => wgpu::VertexFormat::Uint32,
        VertexFormat::Uint32x2 => wgpu::VertexFormat::Uint32x2,
        VertexFormat::Uint32x3 => wgpu::VertexFormat::Uint32x3,
        VertexFormat::Uint32x4 => wgpu::VertexFormat::Uint32x4,
        VertexFormat::Sint32 => wgpu::VertexFormat::Sint32,
        VertexFormat::Sint32x2 => wgpu::VertexFormat::Sint32x2,
        VertexFormat::Sint32x3 => wgpu::VertexFormat::Sint32x3,
        VertexFormat::Sint32x4 => wgpu::VertexFormat::Sint32x4,
    }
}

pub(super) const fn step_mode(mode: VertexStepMode) -> wgpu::VertexStepMode {
    match mode {
        VertexStepMode::Vertex => wgpu::VertexStepMode::Vertex,
        VertexStepMode::Instance => wgpu::VertexStepMode::Instance,
    }
}

pub(super) const fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
        IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
    }
}

const fn filter(mode: FilterMode) -> wgpu::FilterMode {
    match mode {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

const fn address(mode: AddressMode) -> wgpu::AddressMode {
    match mode {
        AddressMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        AddressMode::Repeat => wgpu::AddressMode::Repeat,
        AddressMode::MirrorRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

pub(super) const fn compare(f: CompareFunction) -> wgpu::CompareFunction {
    match f {
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

pub(super) fn sampler<'a>(desc: &SamplerDescriptor) -> wgpu::SamplerDescriptor<'a> {
    wgpu::SamplerDescriptor {
        label: None,
        address_mode_u: address(desc.address_u),
        address_mode_v: address(desc.address_v),
        address_mode_w: address(desc.address_w),
        mag_filter: filter(desc.mag_filter),
        min_filter: filter(desc.min_filter),
        mipmap_filter: filter(desc.mipmap_filter),
        lod_min_clamp: desc.lod_min,
        lod_max_clamp: desc.lod_max,
        compare: desc.compare.map(compare),
        anisotropy_clamp: 1,
        border_color: None,
    }
}

const fn blend_factor(f: BlendFactor) -> wgpu::BlendFactor {
    match f {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::Src => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::Dst => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
    }
}

const fn blend_component(c: BlendComponent) -> wgpu::BlendComponent {
    wgpu::BlendComponent {
        src_factor: blend_factor(c.src_factor),
        dst_factor: blend_factor(c.dst_factor),
        operation: match c.operation {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
            BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOperation::Min => wgpu::BlendOperation::Min,
            BlendOperation::Max => wgpu::BlendOperation::Max,
        },
    }
}

const fn blend(state: BlendState) -> wgpu::BlendState {
    wgpu::BlendState {
        color: blend_component(state.color),
        alpha: blend_component(state.alpha),
    }
}

fn color_writes(mask: ColorWrites) -> wgpu::ColorWrites {
    let mut out = wgpu::ColorWrites::empty();
    for (ours, theirs) in [
        (ColorWrites::RED, wgpu::ColorWrites::RED),
        (ColorWrites::GREEN, wgpu::ColorWrites::GREEN),
        (ColorWrites::BLUE, wgpu::ColorWrites::BLUE),
        (ColorWrites::ALPHA, wgpu::ColorWrites::ALPHA),
    ] {
        if mask.contains(ours) {
            out |= theirs;
        }
    }
    out
}

/// The color target for one attachment.  Integer formats cannot blend.
pub(super) fn color_target(
    format: TextureFormat,
    state: &MegaStateDescriptor,
) -> wgpu::ColorTargetState {
    let integer = matches!(
        format.channel_type(),
        ChannelType::Uint32 | ChannelType::Sint32
    );
    wgpu::ColorTargetState {
        format: texture_format(format),
        blend: if integer { None } else { state.blend.map(blend) },
        write_mask: color_writes(state.color_write_mask),
    }
}

const fn stencil_operation(op: StencilOperation) -> wgpu::StencilOperation {
    match op {
        StencilOperation::Keep => wgpu::StencilOperation::Keep,
        StencilOperation::Zero => wgpu::StencilOperation::Zero,
        StencilOperation::Replace => wgpu::StencilOperation::Replace,
        StencilOperation::Invert => wgpu::StencilOperation::Invert,
        StencilOperation::IncrementClamp => wgpu::StencilOperation::IncrementClamp,
        StencilOperation::DecrementClamp => wgpu::StencilOperation::DecrementClamp,
        StencilOperation::IncrementWrap => wgpu::StencilOperation::IncrementWrap,
        StencilOperation::DecrementWrap => wgpu::StencilOperation::DecrementWrap,
    }
}

const fn stencil_face(face: StencilFaceState) -> wgpu::StencilFaceState {
    wgpu::StencilFaceState {
        compare: compare(face.compare),
        fail_op: stencil_operation(face.fail_op),
        depth_fail_op: stencil_operation(face.depth_fail_op),
        pass_op: stencil_operation(face.pass_op),
    }
}

pub(super) fn depth_stencil(
    format: TextureFormat,
    state: &MegaStateDescriptor,
) -> wgpu::DepthStencilState {
    let stencil = match state.stencil {
        Some(s) => wgpu::StencilState {
            front: stencil_face(s.front),
            back: stencil_face(s.back),
            read_mask: s.read_mask,
            write_mask: s.write_mask,
        },
        None => wgpu::StencilState::default(),
    };
    wgpu::DepthStencilState {
        format: texture_format(format),
        depth_write_enabled: state.depth_write,
        depth_compare: compare(state.depth_compare),
        stencil,
        bias: wgpu::DepthBiasState::default(),
    }
}

pub(super) fn primitive(
    topology: PrimitiveTopology,
    index: Option<IndexFormat>,
    state: &MegaStateDescriptor,
) -> wgpu::PrimitiveState {
    let (topology, strip) = match topology {
        PrimitiveTopology::PointList => (wgpu::PrimitiveTopology::PointList, false),
        PrimitiveTopology::LineList => (wgpu::PrimitiveTopology::LineList, false),
        PrimitiveTopology::LineStrip => (wgpu::PrimitiveTopology::LineStrip, true),
        PrimitiveTopology::TriangleList => (wgpu::PrimitiveTopology::TriangleList, false),
        PrimitiveTopology::TriangleStrip => (wgpu::PrimitiveTopology::TriangleStrip, true),
    };
    wgpu::PrimitiveState {
        topology,
        strip_index_format: if strip { index.map(index_format) } else { None },
        front_face: match state.front_face {
            FrontFace::Ccw => wgpu::FrontFace::Ccw,
            FrontFace::Cw => wgpu::FrontFace::Cw,
        },
        cull_mode: match state.cull_mode {
            CullMode::None => None,
            CullMode::Front => Some(wgpu::Face::Front),
            CullMode::Back => Some(wgpu::Face::Back),
        },
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_targets_never_blend() {
        let state = MegaStateDescriptor {
            blend: Some(BlendState::ALPHA_BLENDING),
            ..Default::default()
        };
        assert!(color_target(TextureFormat::R32Uint, &state).blend.is_none());
        assert!(color_target(TextureFormat::Rgba8Unorm, &state).blend.is_some());
    }

    #[test]
    fn depth24_is_not_copyable() {
        let desc = TextureDescriptor::new_2d(
            TextureFormat::Depth24Plus,
            4,
            4,
            TextureUsage::RENDER_TARGET,
        );
        assert!(!texture_usage(&desc).contains(wgpu::TextureUsages::COPY_SRC));
        assert!(texture_usage(&desc).contains(wgpu::TextureUsages::RENDER_ATTACHMENT));
    }
}
