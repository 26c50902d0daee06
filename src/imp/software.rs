// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The CPU backend.
//!
//! Every object is plain memory.  Programs are [`HostShader`]s; a dispatch or draw calls the
//! shader's Rust closure with copies of its bound resources and writes the writable ones back.
//! Work executes at submission, so readbacks resolve on first poll.
//!
//! Fixed-function state (blending, depth test, topology) is not emulated: a host fragment stage
//! produces final texel values itself.

use super::{Backend, ContextStatus, ReadFuture};
use crate::bindings::{BindingsInfo, BoundResource};
use crate::device::DeviceLimits;
use crate::error::{Error, ShaderCompileError, StageKind};
use crate::format::{IndexFormat, TextureFormat, VertexFormat};
use crate::handles::{ResourceKey, ResourceKind};
use crate::pass::{ComputeCommand, RenderCommand, ResolvedComputePass, ResolvedRenderPass};
use crate::pipeline::{ComputePipelineInfo, RenderPipelineInfo};
use crate::program::{
    BindingSignature, HostComputeContext, HostDraw, HostEntry, HostRasterContext, HostResource,
    HostResources, HostShader, HostTarget, ProgramDescriptor, ProgramReflection, ShaderSource,
};
use crate::resources::{BufferInfo, SamplerDescriptor, TextureDescriptor};
use crate::swap_chain::BackendKind;
use slotmap::SecondaryMap;

const LIMITS: DeviceLimits = DeviceLimits {
    max_texture_dimension_2d: 8192,
    max_bind_groups: 4,
    max_uniform_buffer_binding_size: 64 << 10,
    max_storage_buffer_binding_size: 128 << 20,
    min_uniform_buffer_offset_alignment: 4,
    min_storage_buffer_offset_alignment: 4,
    max_color_attachments: 8,
    max_vertex_attributes: 16,
    max_compute_workgroup_size: [256, 256, 64],
    max_compute_workgroups_per_dimension: 65535,
    max_samples: 4,
};

#[derive(Debug)]
struct SoftTexture {
    desc: TextureDescriptor,
    /// One tightly packed allocation per mip level, layers consecutive.
    levels: Vec<Vec<u8>>,
}

impl SoftTexture {
    fn new(desc: TextureDescriptor) -> Self {
        let levels = (0..desc.mip_levels)
            .map(|level| vec![0; desc.level_byte_len(level)])
            .collect();
        SoftTexture { desc, levels }
    }

    fn layer_range(&self, level: u32, layer: u32) -> std::ops::Range<usize> {
        let layer_len = self.desc.level_byte_len(level) / self.desc.depth as usize;
        let start = layer as usize * layer_len;
        start..start + layer_len
    }
}

#[derive(Debug)]
struct SoftProgram {
    stages: Vec<HostShader>,
}

impl SoftProgram {
    fn compute(&self) -> Option<&HostShader> {
        self.stages
            .iter()
            .find(|s| matches!(s.entry, HostEntry::Compute(_)))
    }

    fn fragment(&self) -> Option<&HostShader> {
        self.stages
            .iter()
            .find(|s| matches!(s.entry, HostEntry::Fragment(_)))
    }
}

pub(crate) struct SoftwareBackend {
    front: Vec<u8>,
    front_size: (u32, u32),
    presented: u64,
    onscreen: Option<ResourceKey>,
    buffers: SecondaryMap<ResourceKey, Vec<u8>>,
    textures: SecondaryMap<ResourceKey, SoftTexture>,
    samplers: SecondaryMap<ResourceKey, SamplerDescriptor>,
    programs: SecondaryMap<ResourceKey, SoftProgram>,
    render_pipelines: SecondaryMap<ResourceKey, RenderPipelineInfo>,
    compute_pipelines: SecondaryMap<ResourceKey, ComputePipelineInfo>,
    bindings: SecondaryMap<ResourceKey, BindingsInfo>,
}

impl std::fmt::Debug for SoftwareBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SoftwareBackend")
            .field("front_size", &self.front_size)
            .field("presented", &self.presented)
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .finish_non_exhaustive()
    }
}

fn missing(what: &str) -> Error {
    Error::Backend {
        backend: BackendKind::Software,
        message: format!("no native {what} for key"),
    }
}

fn ready(bytes: Vec<u8>) -> ReadFuture {
    Box::pin(std::future::ready(Ok(bytes)))
}

fn depth_texel(format: TextureFormat, depth: f32) -> Vec<u8> {
    match format {
        TextureFormat::Depth16Unorm => {
            ((depth.clamp(0.0, 1.0) * 65535.0).round() as u16)
                .to_le_bytes()
                .to_vec()
        }
        _ => depth.to_le_bytes().to_vec(),
    }
}

fn fill(bytes: &mut [u8], texel: &[u8]) {
    for chunk in bytes.chunks_exact_mut(texel.len()) {
        chunk.copy_from_slice(texel);
    }
}

impl SoftwareBackend {
    /// `width` x `height` is the size of the presented front buffer.
    pub(crate) fn new(width: u32, height: u32) -> Self {
        SoftwareBackend {
            front: Vec::new(),
            front_size: (width, height),
            presented: 0,
            onscreen: None,
            buffers: SecondaryMap::new(),
            textures: SecondaryMap::new(),
            samplers: SecondaryMap::new(),
            programs: SecondaryMap::new(),
            render_pipelines: SecondaryMap::new(),
            compute_pipelines: SecondaryMap::new(),
            bindings: SecondaryMap::new(),
        }
    }

    /// Copies the bound resources out for a host shader.
    fn gather(&self, info: &BindingsInfo) -> Result<HostResources, Error> {
        let mut resources = HostResources::default();
        for entry in &info.entries {
            let (bytes, texture) = match entry.resource {
                BoundResource::Buffer { key, offset, size } => {
                    let buffer = self.buffers.get(key).ok_or_else(|| missing("buffer"))?;
                    (
                        buffer[offset as usize..(offset + size) as usize].to_vec(),
                        None,
                    )
                }
                BoundResource::Texture(key) | BoundResource::Combined { texture: key, .. } => {
                    let t = self.textures.get(key).ok_or_else(|| missing("texture"))?;
                    (
                        t.levels[0].clone(),
                        Some((t.desc.width, t.desc.height, t.desc.format)),
                    )
                }
                BoundResource::StorageTexture { key, level } => {
                    let t = self.textures.get(key).ok_or_else(|| missing("texture"))?;
                    let (w, h) = t.desc.level_size(level);
                    (t.levels[level as usize].clone(), Some((w, h, t.desc.format)))
                }
                BoundResource::Sampler(_) => (Vec::new(), None),
            };
            resources.entries.push(HostResource {
                slot: entry.slot,
                kind: entry.kind,
                bytes,
                texture,
            });
        }
        Ok(resources)
    }

    /// Writes back what a host shader was allowed to modify.
    fn scatter(&mut self, info: &BindingsInfo, resources: HostResources) {
        for (entry, resource) in info.entries.iter().zip(resources.entries) {
            if !resource.writable() {
                continue;
            }
            match entry.resource {
                BoundResource::Buffer { key, offset, size } => {
                    if let Some(buffer) = self.buffers.get_mut(key) {
                        buffer[offset as usize..(offset + size) as usize]
                            .copy_from_slice(&resource.bytes);
                    }
                }
                BoundResource::StorageTexture { key, level } => {
                    if let Some(t) = self.textures.get_mut(key) {
                        t.levels[level as usize].copy_from_slice(&resource.bytes);
                    }
                }
                _ => {}
            }
        }
    }

    fn read_indices(
        &self,
        index_buffer: Option<(ResourceKey, u64)>,
        format: Option<IndexFormat>,
        range: std::ops::Range<u32>,
    ) -> Result<Vec<u32>, Error> {
        let (Some((key, offset)), Some(format)) = (index_buffer, format) else {
            return Err(missing("index buffer"));
        };
        let buffer = self.buffers.get(key).ok_or_else(|| missing("buffer"))?;
        let size = format.size() as usize;
        let start = offset as usize + range.start as usize * size;
        let end = offset as usize + range.end as usize * size;
        let bytes = &buffer[start..end];
        Ok(match format {
            IndexFormat::Uint16 => bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]) as u32)
                .collect(),
            IndexFormat::Uint32 => bytemuck::pod_collect_to_vec(bytes),
        })
    }
}

impl Backend for SoftwareBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Software
    }

    fn limits(&self) -> DeviceLimits {
        LIMITS
    }

    fn supports_texture_format(&self, _format: TextureFormat) -> bool {
        true
    }

    fn supports_vertex_format(&self, _format: VertexFormat) -> bool {
        true
    }

    fn context_status(&mut self) -> ContextStatus {
        ContextStatus::Live
    }

    fn reset(&mut self) {
        self.onscreen = None;
        self.buffers.clear();
        self.textures.clear();
        self.samplers.clear();
        self.programs.clear();
        self.render_pipelines.clear();
        self.compute_pipelines.clear();
        self.bindings.clear();
    }

    fn create_buffer(
        &mut self,
        key: ResourceKey,
        info: &BufferInfo,
        data: Option<&[u8]>,
    ) -> Result<(), Error> {
        let bytes = match data {
            Some(data) => data.to_vec(),
            None => vec![0; info.size as usize],
        };
        self.buffers.insert(key, bytes);
        Ok(())
    }

    fn write_buffer(&mut self, key: ResourceKey, offset: u64, data: &[u8]) -> Result<(), Error> {
        let buffer = self.buffers.get_mut(key).ok_or_else(|| missing("buffer"))?;
        buffer[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&mut self, key: ResourceKey, desc: &TextureDescriptor) -> Result<(), Error> {
        self.textures.insert(key, SoftTexture::new(*desc));
        Ok(())
    }

    fn create_onscreen_texture(
        &mut self,
        key: ResourceKey,
        desc: &TextureDescriptor,
    ) -> Result<(), Error> {
        self.onscreen = Some(key);
        self.create_texture(key, desc)
    }

    fn write_texture(&mut self, key: ResourceKey, level: u32, data: &[u8]) -> Result<(), Error> {
        let texture = self.textures.get_mut(key).ok_or_else(|| missing("texture"))?;
        texture.levels[level as usize].copy_from_slice(data);
        Ok(())
    }

    fn create_sampler(&mut self, key: ResourceKey, desc: &SamplerDescriptor) -> Result<(), Error> {
        self.samplers.insert(key, *desc);
        Ok(())
    }

    fn create_program(
        &mut self,
        key: ResourceKey,
        desc: &ProgramDescriptor,
    ) -> Result<ProgramReflection, Error> {
        let mut stages = Vec::new();
        let mut reflection = ProgramReflection::default();
        let mut bindings = Vec::new();
        for (stage, source) in desc.resolve(BackendKind::Software)? {
            let ShaderSource::Host(shader) = source else {
                unreachable!("software programs resolve to host sources")
            };
            if shader.stage() != stage {
                return Err(ShaderCompileError {
                    backend: BackendKind::Software,
                    stage,
                    diagnostics: format!("a {} host shader was given", shader.stage()),
                }
                .into());
            }
            bindings.extend(shader.bindings.iter().cloned());
            match stage {
                StageKind::Vertex => reflection.vertex_inputs = shader.vertex_inputs.clone(),
                StageKind::Fragment => {
                    reflection.fragment_outputs = shader.fragment_outputs.clone()
                }
                StageKind::Compute => reflection.workgroup_size = Some(shader.workgroup_size),
                StageKind::Link => {}
            }
            stages.push(shader.clone());
        }
        reflection.signature =
            BindingSignature::new(bindings).map_err(|diagnostics| ShaderCompileError {
                backend: BackendKind::Software,
                stage: StageKind::Link,
                diagnostics,
            })?;
        self.programs.insert(key, SoftProgram { stages });
        Ok(reflection)
    }

    fn create_render_pipeline(
        &mut self,
        key: ResourceKey,
        info: &RenderPipelineInfo,
    ) -> Result<(), Error> {
        self.render_pipelines.insert(key, info.clone());
        Ok(())
    }

    fn create_compute_pipeline(
        &mut self,
        key: ResourceKey,
        info: &ComputePipelineInfo,
    ) -> Result<(), Error> {
        self.compute_pipelines.insert(key, info.clone());
        Ok(())
    }

    fn create_bindings(&mut self, key: ResourceKey, info: &BindingsInfo) -> Result<(), Error> {
        self.bindings.insert(key, info.clone());
        Ok(())
    }

    fn destroy(&mut self, key: ResourceKey, kind: ResourceKind) {
        match kind {
            ResourceKind::Buffer => {
                self.buffers.remove(key);
            }
            ResourceKind::Texture => {
                self.textures.remove(key);
            }
            ResourceKind::Sampler => {
                self.samplers.remove(key);
            }
            ResourceKind::Program => {
                self.programs.remove(key);
            }
            ResourceKind::InputLayout => {}
            ResourceKind::RenderPipeline => {
                self.render_pipelines.remove(key);
            }
            ResourceKind::ComputePipeline => {
                self.compute_pipelines.remove(key);
            }
            ResourceKind::Bindings => {
                self.bindings.remove(key);
            }
        }
    }

    fn submit_render_pass(&mut self, pass: &ResolvedRenderPass) -> Result<(), Error> {
        for color in &pass.colors {
            if let Some(rgba) = color.clear {
                let texture = self
                    .textures
                    .get_mut(color.key)
                    .ok_or_else(|| missing("texture"))?;
                let range = texture.layer_range(color.level, color.layer);
                let texel = texture.desc.format.encode_color(rgba);
                fill(&mut texture.levels[color.level as usize][range], &texel);
            }
        }
        if let Some(ds) = &pass.depth_stencil {
            if let Some(depth) = ds.depth_clear {
                let texture = self
                    .textures
                    .get_mut(ds.key)
                    .ok_or_else(|| missing("texture"))?;
                let texel = depth_texel(texture.desc.format, depth);
                fill(&mut texture.levels[0], &texel);
            }
        }

        let (width, height) = pass.size;
        let mut pipeline: Option<RenderPipelineInfo> = None;
        let mut bindings: Option<ResourceKey> = None;
        let mut vertex_buffers: Vec<(ResourceKey, u64)> = Vec::new();
        let mut index_buffer = None;
        let mut viewport = [0.0, 0.0, width as f32, height as f32];

        for command in &pass.commands {
            let (vertices, instances, indices) = match command {
                RenderCommand::SetPipeline(key) => {
                    pipeline = Some(
                        self.render_pipelines
                            .get(*key)
                            .cloned()
                            .ok_or_else(|| missing("pipeline"))?,
                    );
                    continue;
                }
                RenderCommand::SetBindings(key) => {
                    bindings = Some(*key);
                    continue;
                }
                RenderCommand::SetVertexInput {
                    vertex_buffers: vb,
                    index_buffer: ib,
                } => {
                    vertex_buffers = vb.clone();
                    index_buffer = *ib;
                    continue;
                }
                RenderCommand::SetViewport(v) => {
                    viewport = [v.x, v.y, v.width, v.height];
                    continue;
                }
                RenderCommand::Draw {
                    vertices,
                    instances,
                } => (vertices.clone(), instances.clone(), None),
                RenderCommand::DrawIndexed { indices, instances } => {
                    let format = pipeline.as_ref().and_then(|p| p.input_layout.index_format);
                    let widened = self.read_indices(index_buffer, format, indices.clone())?;
                    (indices.clone(), instances.clone(), Some(widened))
                }
            };
            let Some(p) = &pipeline else {
                return Err(missing("pipeline"));
            };
            let program = self.programs.get(p.program).ok_or_else(|| missing("program"))?;
            let Some(HostEntry::Fragment(f)) = program.fragment().map(|s| s.entry.clone()) else {
                return Err(missing("fragment stage"));
            };
            let info = match bindings {
                Some(key) => self.bindings.get(key).cloned(),
                None => None,
            };
            let mut resources = match &info {
                Some(info) => self.gather(info)?,
                None => HostResources::default(),
            };
            let draw = HostDraw {
                vertices,
                instances,
                indices,
                vertex_buffers: vertex_buffers
                    .iter()
                    .map(|(key, offset)| {
                        self.buffers
                            .get(*key)
                            .map(|b| b[*offset as usize..].to_vec())
                            .ok_or_else(|| missing("buffer"))
                    })
                    .collect::<Result<_, _>>()?,
                viewport,
            };
            let mut targets = Vec::with_capacity(pass.colors.len());
            for color in &pass.colors {
                let texture = self.textures.get(color.key).ok_or_else(|| missing("texture"))?;
                let (w, h) = texture.desc.level_size(color.level);
                let range = texture.layer_range(color.level, color.layer);
                targets.push(HostTarget {
                    width: w,
                    height: h,
                    format: texture.desc.format,
                    bytes: texture.levels[color.level as usize][range].to_vec(),
                });
            }
            f(&mut HostRasterContext {
                draw: &draw,
                resources: &mut resources,
                targets: &mut targets,
            });
            for (color, target) in pass.colors.iter().zip(targets) {
                if let Some(texture) = self.textures.get_mut(color.key) {
                    let range = texture.layer_range(color.level, color.layer);
                    texture.levels[color.level as usize][range].copy_from_slice(&target.bytes);
                }
            }
            if let Some(info) = &info {
                self.scatter(info, resources);
            }
        }

        // multisampled textures are stored single-sample, so a resolve is a copy
        for color in &pass.colors {
            if let Some((target, _)) = color.resolve_to {
                let source = self.textures.get(color.key).ok_or_else(|| missing("texture"))?;
                let bytes =
                    source.levels[color.level as usize][source.layer_range(color.level, color.layer)]
                        .to_vec();
                let dest = self.textures.get_mut(target).ok_or_else(|| missing("texture"))?;
                dest.levels[0].copy_from_slice(&bytes);
            }
        }
        Ok(())
    }

    fn submit_compute_pass(&mut self, pass: &ResolvedComputePass) -> Result<(), Error> {
        let mut pipeline: Option<ResourceKey> = None;
        let mut bindings: Option<ResourceKey> = None;
        for command in &pass.commands {
            match command {
                ComputeCommand::SetPipeline(key) => pipeline = Some(*key),
                ComputeCommand::SetBindings(key) => bindings = Some(*key),
                ComputeCommand::Dispatch(groups) => {
                    let info = pipeline
                        .and_then(|k| self.compute_pipelines.get(k))
                        .ok_or_else(|| missing("compute pipeline"))?;
                    let workgroup_size = info.workgroup_size;
                    let program = self
                        .programs
                        .get(info.program)
                        .ok_or_else(|| missing("program"))?;
                    let Some(HostEntry::Compute(f)) = program.compute().map(|s| s.entry.clone())
                    else {
                        return Err(missing("compute stage"));
                    };
                    let bound = bindings.and_then(|k| self.bindings.get(k)).cloned();
                    let mut resources = match &bound {
                        Some(info) => self.gather(info)?,
                        None => HostResources::default(),
                    };
                    f(&mut HostComputeContext {
                        workgroups: *groups,
                        workgroup_size,
                        resources: &mut resources,
                    });
                    if let Some(info) = &bound {
                        self.scatter(info, resources);
                    }
                }
            }
        }
        Ok(())
    }

    fn read_buffer(
        &mut self,
        key: ResourceKey,
        offset: u64,
        size: u64,
    ) -> Result<ReadFuture, Error> {
        let buffer = self.buffers.get(key).ok_or_else(|| missing("buffer"))?;
        Ok(ready(
            buffer[offset as usize..(offset + size) as usize].to_vec(),
        ))
    }

    fn read_texture(&mut self, key: ResourceKey, level: u32) -> Result<ReadFuture, Error> {
        let texture = self.textures.get(key).ok_or_else(|| missing("texture"))?;
        Ok(ready(texture.levels[level as usize].clone()))
    }

    fn configure(&mut self, onscreen: ResourceKey, width: u32, height: u32) -> Result<(), Error> {
        let texture = self
            .textures
            .get_mut(onscreen)
            .ok_or_else(|| missing("texture"))?;
        let mut desc = texture.desc;
        desc.width = width;
        desc.height = height;
        *texture = SoftTexture::new(desc);
        self.front_size = (width, height);
        Ok(())
    }

    fn present(&mut self) -> Result<(), Error> {
        let key = self.onscreen.ok_or_else(|| missing("onscreen texture"))?;
        let texture = self.textures.get(key).ok_or_else(|| missing("texture"))?;
        self.front.clone_from(&texture.levels[0]);
        self.presented += 1;
        logwise::trace_sync!(
            "software present #{frame}",
            frame = self.presented
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ShaderStage;
    use crate::resources::{BufferUsage, FrequencyHint};

    #[test]
    fn program_stage_mismatch_is_a_compile_error() {
        let mut backend = SoftwareBackend::new(4, 4);
        let mut keys: slotmap::SlotMap<ResourceKey, ()> = slotmap::SlotMap::with_key();
        let desc = ProgramDescriptor::render(
            ShaderStage::new().host(HostShader::fragment(|_| {})),
            ShaderStage::new().host(HostShader::fragment(|_| {})),
        );
        let err = backend.create_program(keys.insert(()), &desc).unwrap_err();
        assert!(matches!(err, Error::ShaderCompile(e) if e.stage == StageKind::Vertex));
    }

    #[test_executors::async_test]
    async fn buffers_round_trip() {
        let mut backend = SoftwareBackend::new(4, 4);
        let mut keys: slotmap::SlotMap<ResourceKey, ()> = slotmap::SlotMap::with_key();
        let key = keys.insert(());
        let info = BufferInfo {
            size: 8,
            usage: BufferUsage::STORAGE,
            hint: FrequencyHint::Static,
        };
        backend.create_buffer(key, &info, None).unwrap();
        backend.write_buffer(key, 4, &[1, 2, 3, 4]).unwrap();
        let bytes = backend.read_buffer(key, 2, 6).unwrap().await.unwrap();
        assert_eq!(bytes, vec![0, 0, 1, 2, 3, 4]);
    }
}
