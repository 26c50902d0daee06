// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Pipeline builder.
//!
//! A pipeline combines a program with its input layout and fixed-function state.  Pipelines
//! are immutable: changing any state means creating a new pipeline.  Every check that can be
//! made at creation time is made here, so a draw never discovers a mismatch.

mod mega_state;

pub use mega_state::{
    BlendComponent, BlendFactor, BlendOperation, BlendState, ColorWrites, CullMode, FrontFace,
    MegaStateDescriptor, StencilFaceState, StencilOperation, StencilState,
};

use crate::error::{Error, ResourceMismatchError};
use crate::format::{ChannelType, IndexFormat, TextureFormat, VertexFormat};
use crate::handles::{InputLayoutHandle, ProgramHandle, ResourceKey};
use crate::imp::Backend;
use crate::program::{BindingSignature, ProgramInfo, ScalarClass};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VertexStepMode {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub stride: u64,
    pub step_mode: VertexStepMode,
    pub attributes: Vec<VertexAttribute>,
}

/// Vertex attribute and stride description, plus the index format if the pipeline draws indexed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct InputLayoutDescriptor {
    pub vertex_buffers: Vec<VertexBufferLayout>,
    pub index_format: Option<IndexFormat>,
}

impl InputLayoutDescriptor {
    pub(crate) fn validate(&self, backend: &dyn Backend) -> Result<(), Error> {
        let mut seen = Vec::new();
        let max_attributes = backend.limits().max_vertex_attributes;
        for (b, layout) in self.vertex_buffers.iter().enumerate() {
            if layout.stride % 4 != 0 {
                return Err(Error::invalid_descriptor(
                    "input layout",
                    format!("buffer {b} stride {} is not a multiple of 4", layout.stride),
                ));
            }
            for attribute in &layout.attributes {
                if !backend.supports_vertex_format(attribute.format) {
                    return Err(Error::unsupported(
                        backend.kind(),
                        format!("vertex format {:?}", attribute.format),
                    ));
                }
                if attribute
                    .offset
                    .checked_add(attribute.format.size())
                    .is_none_or(|end| end > layout.stride)
                {
                    return Err(Error::invalid_descriptor(
                        "input layout",
                        format!(
                            "attribute at location {} ends past buffer {b}'s stride",
                            attribute.location
                        ),
                    ));
                }
                if attribute.location >= max_attributes {
                    return Err(Error::invalid_descriptor(
                        "input layout",
                        format!(
                            "location {} exceeds the {max_attributes} vertex attributes available",
                            attribute.location
                        ),
                    ));
                }
                if seen.contains(&attribute.location) {
                    return Err(Error::invalid_descriptor(
                        "input layout",
                        format!("location {} is used twice", attribute.location),
                    ));
                }
                seen.push(attribute.location);
            }
        }
        Ok(())
    }

    pub(crate) fn attribute(&self, location: u32) -> Option<(usize, &VertexAttribute)> {
        self.vertex_buffers.iter().enumerate().find_map(|(b, layout)| {
            layout
                .attributes
                .iter()
                .find(|a| a.location == location)
                .map(|a| (b, a))
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

#[derive(Debug, Clone)]
pub struct RenderPipelineDescriptor {
    pub program: ProgramHandle,
    pub input_layout: Option<InputLayoutHandle>,
    pub mega_state: MegaStateDescriptor,
    pub topology: PrimitiveTopology,
    pub color_attachment_formats: Vec<TextureFormat>,
    pub depth_stencil_attachment_format: Option<TextureFormat>,
    pub sample_count: u32,
}

impl RenderPipelineDescriptor {
    /// Single color target of `format`, default state, triangle list.
    pub fn new(program: ProgramHandle, format: TextureFormat) -> Self {
        RenderPipelineDescriptor {
            program,
            input_layout: None,
            mega_state: MegaStateDescriptor::default(),
            topology: PrimitiveTopology::TriangleList,
            color_attachment_formats: vec![format],
            depth_stencil_attachment_format: None,
            sample_count: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ComputePipelineDescriptor {
    pub program: ProgramHandle,
    /// Compute programs take no vertex input; a layout given here is resolved but unused.
    pub input_layout: Option<InputLayoutHandle>,
}

/// What the registry keeps about a live render pipeline.
#[derive(Debug, Clone)]
pub(crate) struct RenderPipelineInfo {
    pub program: ResourceKey,
    pub signature: BindingSignature,
    pub input_layout: InputLayoutDescriptor,
    pub mega_state: MegaStateDescriptor,
    pub topology: PrimitiveTopology,
    pub color_formats: Vec<TextureFormat>,
    pub depth_stencil_format: Option<TextureFormat>,
    pub sample_count: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct ComputePipelineInfo {
    pub program: ResourceKey,
    pub signature: BindingSignature,
    pub workgroup_size: [u32; 3],
}

fn format_class(format: TextureFormat) -> Option<ScalarClass> {
    match format.channel_type() {
        ChannelType::Unorm8 | ChannelType::Float16 | ChannelType::Float32 => {
            Some(ScalarClass::Float)
        }
        ChannelType::Uint32 => Some(ScalarClass::Uint),
        ChannelType::Sint32 => Some(ScalarClass::Sint),
        ChannelType::Depth => None,
    }
}

fn vertex_format_class(format: VertexFormat) -> ScalarClass {
    match format {
        VertexFormat::Uint8x4
        | VertexFormat::Uint32
        | VertexFormat::Uint32x2
        | VertexFormat::Uint32x3
        | VertexFormat::Uint32x4 => ScalarClass::Uint,
        VertexFormat::Sint32
        | VertexFormat::Sint32x2
        | VertexFormat::Sint32x3
        | VertexFormat::Sint32x4 => ScalarClass::Sint,
        _ => ScalarClass::Float,
    }
}

pub(crate) fn validate_render_pipeline(
    desc: &RenderPipelineDescriptor,
    program: &ProgramInfo,
    layout: &InputLayoutDescriptor,
    backend: &dyn Backend,
) -> Result<(), Error> {
    if program.compute {
        return Err(ResourceMismatchError::general(
            "a render pipeline needs a vertex/fragment program, got a compute program",
        )
        .into());
    }
    let limits = backend.limits();

    for input in &program.reflection.vertex_inputs {
        let Some((_, attribute)) = layout.attribute(input.location) else {
            return Err(ResourceMismatchError::general(format!(
                "vertex input `{}` at location {} has no attribute in the input layout",
                input.name, input.location
            ))
            .into());
        };
        let class = vertex_format_class(attribute.format);
        if class != input.class {
            return Err(ResourceMismatchError::general(format!(
                "vertex input `{}` is {:?} but location {} is fed {:?}",
                input.name, input.class, input.location, attribute.format
            ))
            .into());
        }
    }

    if desc.color_attachment_formats.len() as u32 > limits.max_color_attachments {
        return Err(Error::invalid_descriptor(
            "render pipeline",
            format!(
                "{} color attachments exceed the limit of {}",
                desc.color_attachment_formats.len(),
                limits.max_color_attachments
            ),
        ));
    }
    for format in &desc.color_attachment_formats {
        if format.is_depth() {
            return Err(Error::invalid_descriptor(
                "render pipeline",
                format!("{format} is not a color format"),
            ));
        }
        if !backend.supports_texture_format(*format) {
            return Err(Error::unsupported(backend.kind(), format!("render target {format}")));
        }
    }
    for output in &program.reflection.fragment_outputs {
        let Some(format) = desc.color_attachment_formats.get(output.location as usize) else {
            return Err(ResourceMismatchError::general(format!(
                "fragment output {} has no color attachment format",
                output.location
            ))
            .into());
        };
        if format_class(*format) != Some(output.class) {
            return Err(ResourceMismatchError::general(format!(
                "fragment output {} writes {:?} but attachment {} is {format}",
                output.location, output.class, output.location
            ))
            .into());
        }
    }

    match desc.depth_stencil_attachment_format {
        Some(format) if !format.is_depth() => {
            return Err(Error::invalid_descriptor(
                "render pipeline",
                format!("{format} is not a depth format"),
            ));
        }
        Some(format) if !backend.supports_texture_format(format) => {
            return Err(Error::unsupported(backend.kind(), format!("depth target {format}")));
        }
        None if desc.mega_state.uses_depth() => {
            return Err(Error::invalid_descriptor(
                "render pipeline",
                "depth testing or writes need a depth attachment format",
            ));
        }
        _ => {}
    }
    if desc.mega_state.stencil.is_some()
        && !desc
            .depth_stencil_attachment_format
            .is_some_and(|f| f.has_stencil())
    {
        return Err(Error::invalid_descriptor(
            "render pipeline",
            "stencil state needs a depth/stencil format with a stencil aspect",
        ));
    }

    match desc.sample_count {
        1 => {}
        n if n == 4 && n <= limits.max_samples => {}
        n => {
            return Err(Error::unsupported(
                backend.kind(),
                format!("sample count {n}"),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_layout_rejects_reused_location() {
        let layout = InputLayoutDescriptor {
            vertex_buffers: vec![VertexBufferLayout {
                stride: 16,
                step_mode: VertexStepMode::Vertex,
                attributes: vec![
                    VertexAttribute {
                        location: 0,
                        format: VertexFormat::Float32x2,
                        offset: 0,
                    },
                    VertexAttribute {
                        location: 0,
                        format: VertexFormat::Float32x2,
                        offset: 8,
                    },
                ],
            }],
            index_format: None,
        };
        let backend = crate::imp::software::SoftwareBackend::new(64, 64);
        assert!(matches!(
            layout.validate(&backend),
            Err(Error::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn attribute_lookup_reports_buffer() {
        let layout = InputLayoutDescriptor {
            vertex_buffers: vec![
                VertexBufferLayout {
                    stride: 8,
                    step_mode: VertexStepMode::Vertex,
                    attributes: vec![VertexAttribute {
                        location: 0,
                        format: VertexFormat::Float32x2,
                        offset: 0,
                    }],
                },
                VertexBufferLayout {
                    stride: 16,
                    step_mode: VertexStepMode::Instance,
                    attributes: vec![VertexAttribute {
                        location: 3,
                        format: VertexFormat::Float32x4,
                        offset: 0,
                    }],
                },
            ],
            index_format: None,
        };
        assert_eq!(layout.attribute(3).map(|(b, _)| b), Some(1));
        assert!(layout.attribute(1).is_none());
    }
}
