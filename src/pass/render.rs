// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::PassToken;
use crate::bindings::{BindingsInfo, PipelineKey};
use crate::device::DeviceLimits;
use crate::error::Error;
use crate::handles::{BindingsHandle, BufferHandle, RenderPipelineHandle, ResourceKey, TextureHandle};
use crate::pipeline::{RenderPipelineInfo, VertexStepMode};
use crate::registry::Registry;
use crate::resources::{BufferUsage, TextureDescriptor, TextureUsage};
use std::ops::Range;

/// A color target.  `clear: None` keeps the existing contents.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub texture: TextureHandle,
    pub level: u32,
    pub layer: u32,
    pub clear: Option<[f64; 4]>,
    /// Single-sample texture the multisampled `texture` resolves into at the end of the pass.
    pub resolve_to: Option<TextureHandle>,
}

impl ColorAttachment {
    pub fn new(texture: TextureHandle) -> Self {
        ColorAttachment {
            texture,
            level: 0,
            layer: 0,
            clear: None,
            resolve_to: None,
        }
    }

    pub fn clear(mut self, rgba: [f64; 4]) -> Self {
        self.clear = Some(rgba);
        self
    }

    pub fn resolve_to(mut self, texture: TextureHandle) -> Self {
        self.resolve_to = Some(texture);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthStencilAttachment {
    pub texture: TextureHandle,
    pub depth_clear: Option<f32>,
    pub stencil_clear: Option<u32>,
}

/// Attachments and clear values, fixed when the pass is created.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RenderPassDescriptor {
    pub color_attachments: Vec<ColorAttachment>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBufferBinding {
    pub buffer: BufferHandle,
    pub offset: u64,
}

impl From<BufferHandle> for VertexBufferBinding {
    fn from(buffer: BufferHandle) -> Self {
        VertexBufferBinding { buffer, offset: 0 }
    }
}

/// Index data.  The element format comes from the pipeline's input layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBufferBinding {
    pub buffer: BufferHandle,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Viewport {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone)]
enum Recorded {
    SetPipeline(RenderPipelineHandle),
    SetBindings(BindingsHandle),
    SetVertexInput {
        vertex_buffers: Vec<VertexBufferBinding>,
        index_buffer: Option<IndexBufferBinding>,
    },
    SetViewport(Viewport),
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        instances: Range<u32>,
    },
}

/// Records draw commands into a set of attachments.
#[derive(Debug)]
pub struct RenderPass {
    pub(crate) desc: RenderPassDescriptor,
    commands: Vec<Recorded>,
    pub(crate) token: PassToken,
}

impl RenderPass {
    pub(crate) fn new(desc: RenderPassDescriptor, token: PassToken) -> Self {
        RenderPass {
            desc,
            commands: Vec::new(),
            token,
        }
    }

    pub fn set_pipeline(&mut self, pipeline: RenderPipelineHandle) {
        self.commands.push(Recorded::SetPipeline(pipeline));
    }

    pub fn set_bindings(&mut self, bindings: BindingsHandle) {
        self.commands.push(Recorded::SetBindings(bindings));
    }

    /// Vertex buffers in input layout order, and the index buffer for indexed draws.
    pub fn set_vertex_input(
        &mut self,
        vertex_buffers: &[VertexBufferBinding],
        index_buffer: Option<IndexBufferBinding>,
    ) {
        self.commands.push(Recorded::SetVertexInput {
            vertex_buffers: vertex_buffers.to_vec(),
            index_buffer,
        });
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(Recorded::SetViewport(viewport));
    }

    pub fn draw(&mut self, vertices: Range<u32>, instances: Range<u32>) {
        self.commands.push(Recorded::Draw {
            vertices,
            instances,
        });
    }

    pub fn draw_indexed(&mut self, indices: Range<u32>, instances: Range<u32>) {
        self.commands.push(Recorded::DrawIndexed { indices, instances });
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }
}

/// A command with every handle resolved to a registry key.
#[derive(Debug, Clone)]
pub(crate) enum RenderCommand {
    SetPipeline(ResourceKey),
    SetBindings(ResourceKey),
    SetVertexInput {
        vertex_buffers: Vec<(ResourceKey, u64)>,
        index_buffer: Option<(ResourceKey, u64)>,
    },
    SetViewport(Viewport),
    Draw {
        vertices: Range<u32>,
        instances: Range<u32>,
    },
    DrawIndexed {
        indices: Range<u32>,
        instances: Range<u32>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedAttachment {
    pub key: ResourceKey,
    pub desc: TextureDescriptor,
    pub onscreen: bool,
    pub level: u32,
    pub layer: u32,
    pub clear: Option<[f64; 4]>,
    /// Key and onscreen flag of the resolve target.
    pub resolve_to: Option<(ResourceKey, bool)>,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedDepthStencil {
    pub key: ResourceKey,
    pub desc: TextureDescriptor,
    pub depth_clear: Option<f32>,
    pub stencil_clear: Option<u32>,
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedRenderPass {
    pub colors: Vec<ResolvedAttachment>,
    pub depth_stencil: Option<ResolvedDepthStencil>,
    /// Attachment extent at the selected level.
    pub size: (u32, u32),
    pub commands: Vec<RenderCommand>,
}

fn bad_attachment(reason: impl Into<String>) -> Error {
    Error::invalid_descriptor("render pass", reason)
}

/// Resolves and checks the attachments.  Used at pass creation and again at submission.
pub(crate) fn resolve_attachments(
    desc: &RenderPassDescriptor,
    registry: &Registry,
    limits: &DeviceLimits,
) -> Result<ResolvedRenderPass, Error> {
    if desc.color_attachments.is_empty() && desc.depth_stencil_attachment.is_none() {
        return Err(bad_attachment("a render pass needs at least one attachment"));
    }
    if desc.color_attachments.len() as u32 > limits.max_color_attachments {
        return Err(bad_attachment(format!(
            "{} color attachments exceed the limit of {}",
            desc.color_attachments.len(),
            limits.max_color_attachments
        )));
    }
    let mut size: Option<(u32, u32)> = None;
    let mut samples: Option<u32> = None;
    let mut agree = |s: (u32, u32), n: u32, what: &str| -> Result<(), Error> {
        if *size.get_or_insert(s) != s || *samples.get_or_insert(n) != n {
            return Err(bad_attachment(format!(
                "{what} does not match the size or sample count of the other attachments"
            )));
        }
        Ok(())
    };

    let mut colors = Vec::with_capacity(desc.color_attachments.len());
    for (i, attachment) in desc.color_attachments.iter().enumerate() {
        let info = registry.texture(attachment.texture)?;
        let tdesc = info.desc;
        if !tdesc.usage.contains(TextureUsage::RENDER_TARGET) || tdesc.format.is_depth() {
            return Err(bad_attachment(format!(
                "color attachment {i} is not a color render target"
            )));
        }
        if attachment.level >= tdesc.mip_levels || attachment.layer >= tdesc.depth {
            return Err(bad_attachment(format!(
                "color attachment {i} selects a level or layer that does not exist"
            )));
        }
        agree(
            tdesc.level_size(attachment.level),
            tdesc.sample_count,
            &format!("color attachment {i}"),
        )?;
        let resolve_to = match attachment.resolve_to {
            None => None,
            Some(target) => {
                let target_info = registry.texture(target)?;
                let t = target_info.desc;
                if tdesc.sample_count == 1
                    || t.sample_count != 1
                    || t.format != tdesc.format
                    || t.level_size(0) != tdesc.level_size(attachment.level)
                    || !t.usage.contains(TextureUsage::RENDER_TARGET)
                {
                    return Err(bad_attachment(format!(
                        "color attachment {i} cannot resolve into the given texture"
                    )));
                }
                if target == attachment.texture {
                    return Err(bad_attachment("a texture cannot resolve into itself"));
                }
                Some((target.key(), target_info.onscreen))
            }
        };
        colors.push(ResolvedAttachment {
            key: attachment.texture.key(),
            desc: tdesc,
            onscreen: info.onscreen,
            level: attachment.level,
            layer: attachment.layer,
            clear: attachment.clear,
            resolve_to,
        });
    }

    let depth_stencil = match &desc.depth_stencil_attachment {
        None => None,
        Some(attachment) => {
            let tdesc = registry.texture(attachment.texture)?.desc;
            if !tdesc.format.is_depth() || !tdesc.usage.contains(TextureUsage::RENDER_TARGET) {
                return Err(bad_attachment("depth attachment is not a depth render target"));
            }
            if attachment.stencil_clear.is_some() && !tdesc.format.has_stencil() {
                return Err(bad_attachment(format!(
                    "{} has no stencil aspect to clear",
                    tdesc.format
                )));
            }
            agree(tdesc.level_size(0), tdesc.sample_count, "depth attachment")?;
            Some(ResolvedDepthStencil {
                key: attachment.texture.key(),
                desc: tdesc,
                depth_clear: attachment.depth_clear,
                stencil_clear: attachment.stencil_clear,
            })
        }
    };

    Ok(ResolvedRenderPass {
        colors,
        depth_stencil,
        size: size.unwrap_or((1, 1)),
        commands: Vec::new(),
    })
}

fn check_pipeline(
    index: usize,
    pipeline: &RenderPipelineInfo,
    pass: &ResolvedRenderPass,
) -> Result<(), Error> {
    let formats: Vec<_> = pass.colors.iter().map(|c| c.desc.format).collect();
    if formats != pipeline.color_formats {
        return Err(Error::invalid_pass(
            index,
            format!(
                "pipeline targets {:?} but the pass renders to {formats:?}",
                pipeline.color_formats
            ),
        ));
    }
    let depth = pass.depth_stencil.as_ref().map(|d| d.desc.format);
    if depth != pipeline.depth_stencil_format {
        return Err(Error::invalid_pass(
            index,
            format!(
                "pipeline depth format {:?} does not match the pass's {depth:?}",
                pipeline.depth_stencil_format
            ),
        ));
    }
    let samples = pass
        .colors
        .first()
        .map(|c| c.desc.sample_count)
        .or_else(|| pass.depth_stencil.as_ref().map(|d| d.desc.sample_count))
        .unwrap_or(1);
    if samples != pipeline.sample_count {
        return Err(Error::invalid_pass(
            index,
            format!(
                "pipeline sample count {} does not match the pass's {samples}",
                pipeline.sample_count
            ),
        ));
    }
    Ok(())
}

fn check_bindings_alive(index: usize, bindings: &BindingsInfo, registry: &Registry) -> Result<(), Error> {
    for key in bindings.referenced() {
        if registry.record(key).is_none() {
            return Err(Error::invalid_pass(
                index,
                "bindings refer to a resource that has been destroyed",
            ));
        }
    }
    Ok(())
}

impl RenderPass {
    /// Validates every recorded command.  Nothing is executed if any command is invalid.
    pub(crate) fn resolve(
        &self,
        registry: &Registry,
        limits: &DeviceLimits,
    ) -> Result<ResolvedRenderPass, Error> {
        let mut resolved = resolve_attachments(&self.desc, registry, limits)?;
        let written: Vec<ResourceKey> = resolved
            .colors
            .iter()
            .flat_map(|c| std::iter::once(c.key).chain(c.resolve_to.map(|(k, _)| k)))
            .chain(resolved.depth_stencil.as_ref().map(|d| d.key))
            .collect();

        let mut pipeline: Option<&RenderPipelineInfo> = None;
        let mut bindings: Option<&BindingsInfo> = None;
        let mut vertex_buffers: Vec<(ResourceKey, u64, u64)> = Vec::new();
        let mut index_buffer: Option<(u64, u64)> = None;

        for (index, command) in self.commands.iter().enumerate() {
            let out = match command {
                Recorded::SetPipeline(handle) => {
                    let info = registry.render_pipeline(*handle)?;
                    if registry.record(info.program).is_none() {
                        return Err(Error::invalid_pass(
                            index,
                            "pipeline's program has been destroyed",
                        ));
                    }
                    check_pipeline(index, info, &resolved)?;
                    pipeline = Some(info);
                    RenderCommand::SetPipeline(handle.key())
                }
                Recorded::SetBindings(handle) => {
                    let info = registry.bindings(*handle)?;
                    if !matches!(info.pipeline, PipelineKey::Render(_)) {
                        return Err(Error::invalid_pass(
                            index,
                            "bindings were created for a compute pipeline",
                        ));
                    }
                    check_bindings_alive(index, info, registry)?;
                    if let Some(texture) = info.sampled_textures().find(|t| written.contains(t)) {
                        let name = registry.name(texture).unwrap_or("texture");
                        return Err(Error::invalid_pass(
                            index,
                            format!("{name} is sampled while this pass renders to it"),
                        ));
                    }
                    bindings = Some(info);
                    RenderCommand::SetBindings(handle.key())
                }
                Recorded::SetVertexInput {
                    vertex_buffers: vbs,
                    index_buffer: ib,
                } => {
                    vertex_buffers.clear();
                    for vb in vbs {
                        let info = registry.buffer(vb.buffer)?;
                        if !info.usage.contains(BufferUsage::VERTEX) || vb.offset > info.size {
                            return Err(Error::invalid_pass(
                                index,
                                "vertex buffer lacks VERTEX usage or the offset is out of range",
                            ));
                        }
                        vertex_buffers.push((vb.buffer.key(), vb.offset, info.size));
                    }
                    index_buffer = match ib {
                        None => None,
                        Some(ib) => {
                            let info = registry.buffer(ib.buffer)?;
                            if !info.usage.contains(BufferUsage::INDEX) || ib.offset > info.size {
                                return Err(Error::invalid_pass(
                                    index,
                                    "index buffer lacks INDEX usage or the offset is out of range",
                                ));
                            }
                            Some((ib.offset, info.size))
                        }
                    };
                    RenderCommand::SetVertexInput {
                        vertex_buffers: vbs.iter().map(|vb| (vb.buffer.key(), vb.offset)).collect(),
                        index_buffer: ib.map(|ib| (ib.buffer.key(), ib.offset)),
                    }
                }
                Recorded::SetViewport(viewport) => {
                    if !(viewport.width > 0.0 && viewport.height > 0.0)
                        || !(0.0..=1.0).contains(&viewport.min_depth)
                        || !(0.0..=1.0).contains(&viewport.max_depth)
                    {
                        return Err(Error::invalid_pass(index, "viewport is empty or out of depth range"));
                    }
                    RenderCommand::SetViewport(*viewport)
                }
                Recorded::Draw {
                    vertices,
                    instances,
                } => {
                    let p = check_draw(index, pipeline, bindings, &vertex_buffers)?;
                    check_vertex_ranges(index, p, &vertex_buffers, vertices, instances)?;
                    RenderCommand::Draw {
                        vertices: vertices.clone(),
                        instances: instances.clone(),
                    }
                }
                Recorded::DrawIndexed { indices, instances } => {
                    let p = check_draw(index, pipeline, bindings, &vertex_buffers)?;
                    let Some(format) = p.input_layout.index_format else {
                        return Err(Error::invalid_pass(
                            index,
                            "indexed draw with a pipeline that has no index format",
                        ));
                    };
                    let Some((offset, size)) = index_buffer else {
                        return Err(Error::invalid_pass(index, "indexed draw without an index buffer"));
                    };
                    if offset.saturating_add(indices.end as u64 * format.size()) > size {
                        return Err(Error::invalid_pass(index, "index range runs past the index buffer"));
                    }
                    check_vertex_ranges(index, p, &vertex_buffers, &(0..0), instances)?;
                    RenderCommand::DrawIndexed {
                        indices: indices.clone(),
                        instances: instances.clone(),
                    }
                }
            };
            resolved.commands.push(out);
        }
        Ok(resolved)
    }
}

fn check_draw<'a>(
    index: usize,
    pipeline: Option<&'a RenderPipelineInfo>,
    bindings: Option<&BindingsInfo>,
    vertex_buffers: &[(ResourceKey, u64, u64)],
) -> Result<&'a RenderPipelineInfo, Error> {
    let Some(pipeline) = pipeline else {
        return Err(Error::invalid_pass(index, "draw before set_pipeline"));
    };
    if !pipeline.signature.is_empty() {
        match bindings {
            None => return Err(Error::invalid_pass(index, "draw before set_bindings")),
            Some(b) if b.signature != pipeline.signature => {
                return Err(Error::invalid_pass(
                    index,
                    "bindings do not match the current pipeline's signature",
                ));
            }
            Some(_) => {}
        }
    }
    if vertex_buffers.len() < pipeline.input_layout.vertex_buffers.len() {
        return Err(Error::invalid_pass(
            index,
            format!(
                "pipeline reads {} vertex buffers, {} are set",
                pipeline.input_layout.vertex_buffers.len(),
                vertex_buffers.len()
            ),
        ));
    }
    Ok(pipeline)
}

fn check_vertex_ranges(
    index: usize,
    pipeline: &RenderPipelineInfo,
    vertex_buffers: &[(ResourceKey, u64, u64)],
    vertices: &Range<u32>,
    instances: &Range<u32>,
) -> Result<(), Error> {
    for (layout, (_, offset, size)) in pipeline
        .input_layout
        .vertex_buffers
        .iter()
        .zip(vertex_buffers)
    {
        let range = match layout.step_mode {
            VertexStepMode::Vertex => vertices,
            VertexStepMode::Instance => instances,
        };
        if range.is_empty() {
            continue;
        }
        let attribute_end = layout
            .attributes
            .iter()
            .map(|a| a.offset + a.format.size())
            .max()
            .unwrap_or(0);
        let needed = (range.end as u64 - 1)
            .saturating_mul(layout.stride)
            .saturating_add(*offset)
            .saturating_add(attribute_end);
        if needed > *size {
            return Err(Error::invalid_pass(
                index,
                format!("draw reads {needed} bytes of a {size}-byte vertex buffer"),
            ));
        }
    }
    Ok(())
}
