// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The WebGL1 and WebGL2 backends.

Both are one [`WebGlBackend`] written against the [`GlContext`] call surface; the version decides
which features exist.  In a browser the context is a `WebGlRenderingContext` or
`WebGl2RenderingContext`; everywhere else it is a [`HeadlessGl`].

Binding slots are flattened: uniform blocks get consecutive binding points and combined samplers
get consecutive texture units, both in slot order.  On WebGL1 uniform buffers live in CPU memory
and are uploaded as loose uniforms at draw time.
*/

mod context;
mod glsl;
mod headless;
mod uniforms;
#[cfg(target_arch = "wasm32")]
pub(crate) mod web_sys_context;

pub use context::{
    ActiveUniform, BufferTarget, GlAttachment, GlContext, GlVersion, GlVertexAttrib, types,
};
pub use headless::HeadlessGl;

use super::{Backend, BoxFuture, ContextStatus, ReadFuture};
use crate::bindings::{BindingsInfo, BoundResource};
use crate::device::DeviceLimits;
use crate::error::{Error, ShaderCompileError, StageKind};
use crate::format::{TextureFormat, VertexFormat};
use crate::handles::{ResourceKey, ResourceKind};
use crate::pass::{RenderCommand, ResolvedComputePass, ResolvedRenderPass};
use crate::pipeline::{ComputePipelineInfo, RenderPipelineInfo, VertexStepMode};
use crate::program::{
    BindingKind, BindingLayoutEntry, BindingSignature, BindingSlot, FragmentOutput,
    ProgramDescriptor, ProgramReflection, ShaderSource, VertexInput,
};
use crate::resources::{BufferInfo, BufferUsage, SamplerDescriptor, TextureDescriptor, TextureUsage};
use crate::swap_chain::BackendKind;
use glsl::{ScannedStage, UniformBlock};
use slotmap::SecondaryMap;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use uniforms::ProgramUniforms;

#[derive(Debug)]
struct GlBuffer {
    /// `None` for WebGL1 uniform buffers, which exist only in `shadow`.
    id: Option<u32>,
    /// CPU copy, kept on WebGL1 for readback and uniform lowering.
    shadow: Option<Vec<u8>>,
}

#[derive(Debug)]
struct GlTexture {
    /// 0 for the onscreen texture, which is the default framebuffer.
    id: u32,
    desc: TextureDescriptor,
    /// WebGL1 stores sampling state on the texture.
    applied_sampler: Option<SamplerDescriptor>,
}

#[derive(Debug)]
struct GlSampler {
    id: Option<u32>,
    desc: SamplerDescriptor,
}

#[derive(Debug)]
struct GlProgram {
    id: u32,
    blocks: BTreeMap<BindingSlot, UniformBlock>,
    /// Uniform block binding point or texture unit of each slot.
    points: BTreeMap<BindingSlot, u32>,
    uniforms: ProgramUniforms,
}

#[derive(Debug, Clone)]
struct GlPipeline {
    program: ResourceKey,
    info: RenderPipelineInfo,
}

/// Resolves once the fence is signaled.  Polls `clientWaitSync` with a zero timeout and wakes
/// itself until then.
struct FenceWait {
    gl: Rc<dyn GlContext>,
    sync: u32,
}

impl Future for FenceWait {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.gl.is_context_lost() {
            return Poll::Ready(Err(Error::ContextLost));
        }
        if self.gl.sync_signaled(self.sync) {
            self.gl.delete_sync(self.sync);
            Poll::Ready(Ok(()))
        } else {
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

pub(crate) struct WebGlBackend {
    gl: Rc<dyn GlContext>,
    version: GlVersion,
    limits: DeviceLimits,
    onscreen: Option<ResourceKey>,
    buffers: SecondaryMap<ResourceKey, GlBuffer>,
    textures: SecondaryMap<ResourceKey, GlTexture>,
    samplers: SecondaryMap<ResourceKey, GlSampler>,
    programs: SecondaryMap<ResourceKey, GlProgram>,
    pipelines: SecondaryMap<ResourceKey, GlPipeline>,
    bindings: SecondaryMap<ResourceKey, BindingsInfo>,
    framebuffer: Option<u32>,
    resolve_framebuffer: Option<u32>,
}

impl std::fmt::Debug for WebGlBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebGlBackend")
            .field("version", &self.version)
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .field("programs", &self.programs.len())
            .finish_non_exhaustive()
    }
}

fn stage_error(backend: BackendKind, stage: StageKind, diagnostics: String) -> Error {
    ShaderCompileError {
        backend,
        stage,
        diagnostics,
    }
    .into()
}

impl WebGlBackend {
    pub(crate) fn new(gl: Rc<dyn GlContext>, version: GlVersion) -> Result<Self, Error> {
        let backend = match version {
            GlVersion::WebGl1 => BackendKind::WebGL1,
            GlVersion::WebGl2 => BackendKind::WebGL2,
        };
        if gl.version() != version {
            return Err(Error::ContextCreation {
                backend,
                reason: format!("asked for {version:?}, the context is {:?}", gl.version()),
            });
        }
        if gl.is_context_lost() {
            return Err(Error::ContextCreation {
                backend,
                reason: "the context was lost during creation".to_string(),
            });
        }
        let webgl2 = version == GlVersion::WebGl2;
        let limits = DeviceLimits {
            max_texture_dimension_2d: gl.max_texture_size(),
            max_bind_groups: 4,
            max_uniform_buffer_binding_size: if webgl2 {
                gl.max_uniform_block_size()
            } else {
                16 << 10
            },
            max_storage_buffer_binding_size: 0,
            min_uniform_buffer_offset_alignment: if webgl2 {
                gl.uniform_buffer_offset_alignment()
            } else {
                4
            },
            min_storage_buffer_offset_alignment: 256,
            max_color_attachments: if webgl2 { gl.max_draw_buffers() } else { 1 },
            max_vertex_attributes: gl.max_vertex_attribs(),
            max_compute_workgroup_size: [0, 0, 0],
            max_compute_workgroups_per_dimension: 0,
            max_samples: if webgl2 { gl.max_samples().max(1) } else { 1 },
        };
        logwise::info_sync!(
            "{backend} context ready, max texture {size}",
            backend = logwise::privacy::LogIt(&backend),
            size = limits.max_texture_dimension_2d
        );
        Ok(WebGlBackend {
            gl,
            version,
            limits,
            onscreen: None,
            buffers: SecondaryMap::new(),
            textures: SecondaryMap::new(),
            samplers: SecondaryMap::new(),
            programs: SecondaryMap::new(),
            pipelines: SecondaryMap::new(),
            bindings: SecondaryMap::new(),
            framebuffer: None,
            resolve_framebuffer: None,
        })
    }

    fn webgl2(&self) -> bool {
        self.version == GlVersion::WebGl2
    }

    fn missing(&self, what: &str) -> Error {
        Error::Backend {
            backend: self.kind(),
            message: format!("no native {what} for key"),
        }
    }

    fn lost_or(&self, what: &str) -> Error {
        if self.gl.is_context_lost() {
            Error::ContextLost
        } else {
            Error::Backend {
                backend: self.kind(),
                message: format!("could not create a {what}"),
            }
        }
    }

    fn scratch_framebuffer(&mut self, resolve: bool) -> Result<u32, Error> {
        let slot = if resolve {
            &mut self.resolve_framebuffer
        } else {
            &mut self.framebuffer
        };
        if let Some(fb) = *slot {
            return Ok(fb);
        }
        let fb = self.gl.create_framebuffer();
        *slot = fb;
        fb.ok_or_else(|| self.lost_or("framebuffer"))
    }

    fn compile_stage(&self, stage: StageKind, source: &ShaderSource) -> Result<(ScannedStage, u32), Error> {
        let kind = self.kind();
        let ShaderSource::Glsl450(code) = source else {
            unreachable!("WebGL programs resolve to GLSL sources")
        };
        let scanned = glsl::scan(stage, code).map_err(|d| stage_error(kind, stage, d))?;
        let lowered = scanned
            .lower(self.version)
            .map_err(|d| stage_error(kind, stage, d))?;
        let shader = self.gl.compile_shader(stage, &lowered).map_err(|log| {
            if self.gl.is_context_lost() {
                Error::ContextLost
            } else {
                stage_error(kind, stage, log)
            }
        })?;
        Ok((scanned, shader))
    }

    /// Binds the resources of `bindings` for the program of `pipeline`.
    fn apply_bindings(&mut self, pipeline: &GlPipeline, bindings: ResourceKey) -> Result<(), Error> {
        let gl = self.gl.clone();
        let webgl2 = self.webgl2();
        let missing_program = self.missing("program");
        let info = self.bindings.get(bindings).ok_or_else(|| self.missing("bindings"))?;
        let program = self
            .programs
            .get_mut(pipeline.program)
            .ok_or(missing_program)?;
        for entry in &info.entries {
            let Some(point) = program.points.get(&entry.slot).copied() else {
                continue;
            };
            match entry.resource {
                BoundResource::Buffer { key, offset, size } => {
                    let Some(buffer) = self.buffers.get(key) else {
                        continue;
                    };
                    match (webgl2, buffer.id, &buffer.shadow) {
                        (true, Some(id), _) => gl.bind_buffer_range(point, id, offset, size),
                        (false, _, Some(shadow)) => {
                            if let Some(block) = program.blocks.get(&entry.slot) {
                                let bytes = &shadow[offset as usize..(offset + size) as usize];
                                program.uniforms.upload_block(gl.as_ref(), block, bytes);
                            }
                        }
                        _ => {}
                    }
                }
                BoundResource::Combined { texture, sampler } => {
                    let sampler = sampler.and_then(|s| self.samplers.get(s));
                    let Some(texture) = self.textures.get_mut(texture) else {
                        continue;
                    };
                    if webgl2 {
                        gl.bind_texture_unit(point, texture.id, sampler.and_then(|s| s.id));
                    } else {
                        gl.bind_texture_unit(point, texture.id, None);
                        let desc = sampler.map(|s| s.desc).unwrap_or_default();
                        if texture.applied_sampler != Some(desc) {
                            gl.tex_parameters(texture.id, &desc);
                            texture.applied_sampler = Some(desc);
                        }
                    }
                }
                // GLSL programs only reflect blocks and combined samplers
                _ => {}
            }
        }
        Ok(())
    }

    /// Binds the framebuffer for `pass` and returns it.
    fn bind_attachments(&mut self, pass: &ResolvedRenderPass) -> Result<u32, Error> {
        let onscreen = pass.colors.iter().any(|c| c.onscreen);
        if onscreen {
            if pass.colors.len() != 1 || pass.depth_stencil.is_some() {
                return Err(Error::unsupported(
                    self.kind(),
                    "the onscreen texture together with other attachments",
                ));
            }
            self.gl.bind_framebuffer(0, &[], None);
            return Ok(0);
        }
        let mut colors = Vec::with_capacity(pass.colors.len());
        for color in &pass.colors {
            let texture = self
                .textures
                .get(color.key)
                .ok_or_else(|| self.missing("texture"))?;
            colors.push(GlAttachment {
                texture: texture.id,
                level: color.level,
                layer: color.layer,
            });
        }
        let depth_stencil = match &pass.depth_stencil {
            Some(ds) => Some(
                self.textures
                    .get(ds.key)
                    .ok_or_else(|| self.missing("texture"))?
                    .id,
            ),
            None => None,
        };
        let fb = self.scratch_framebuffer(false)?;
        self.gl.bind_framebuffer(fb, &colors, depth_stencil);
        Ok(fb)
    }

    fn resolve(&mut self, pass: &ResolvedRenderPass, from: u32) -> Result<(), Error> {
        let (width, height) = pass.size;
        for color in &pass.colors {
            let Some((target, onscreen)) = color.resolve_to else {
                continue;
            };
            let to = if onscreen {
                0
            } else {
                let id = self
                    .textures
                    .get(target)
                    .ok_or_else(|| self.missing("texture"))?
                    .id;
                let fb = self.scratch_framebuffer(true)?;
                let attachment = GlAttachment {
                    texture: id,
                    level: 0,
                    layer: 0,
                };
                self.gl.bind_framebuffer(fb, &[attachment], None);
                fb
            };
            self.gl.blit_framebuffer(from, to, width, height);
        }
        Ok(())
    }

    fn attributes_for(
        &self,
        pipeline: &GlPipeline,
        vertex_buffers: &[(ResourceKey, u64)],
    ) -> Vec<GlVertexAttrib> {
        let mut attribs = Vec::new();
        for (layout, (key, base)) in pipeline
            .info
            .input_layout
            .vertex_buffers
            .iter()
            .zip(vertex_buffers)
        {
            let Some(buffer) = self.buffers.get(*key).and_then(|b| b.id) else {
                continue;
            };
            for attribute in &layout.attributes {
                attribs.push(GlVertexAttrib {
                    location: attribute.location,
                    buffer,
                    format: attribute.format,
                    stride: layout.stride,
                    offset: base + attribute.offset,
                    divisor: match layout.step_mode {
                        VertexStepMode::Vertex => 0,
                        VertexStepMode::Instance => 1,
                    },
                });
            }
        }
        attribs
    }
}

impl Backend for WebGlBackend {
    fn kind(&self) -> BackendKind {
        match self.version {
            GlVersion::WebGl1 => BackendKind::WebGL1,
            GlVersion::WebGl2 => BackendKind::WebGL2,
        }
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn supports_texture_format(&self, format: TextureFormat) -> bool {
        match self.version {
            GlVersion::WebGl1 => matches!(
                format,
                TextureFormat::Rgba8Unorm
                    | TextureFormat::Depth16Unorm
                    | TextureFormat::Depth24PlusStencil8
            ),
            GlVersion::WebGl2 => !matches!(
                format,
                TextureFormat::Bgra8Unorm | TextureFormat::Bgra8UnormSrgb
            ),
        }
    }

    fn supports_vertex_format(&self, format: VertexFormat) -> bool {
        match self.version {
            GlVersion::WebGl1 => matches!(
                format,
                VertexFormat::Float32
                    | VertexFormat::Float32x2
                    | VertexFormat::Float32x3
                    | VertexFormat::Float32x4
                    | VertexFormat::Unorm8x4
            ),
            GlVersion::WebGl2 => true,
        }
    }

    fn context_status(&mut self) -> ContextStatus {
        if self.gl.is_context_lost() {
            ContextStatus::Lost
        } else {
            ContextStatus::Live
        }
    }

    fn reset(&mut self) {
        self.onscreen = None;
        self.buffers.clear();
        self.textures.clear();
        self.samplers.clear();
        self.programs.clear();
        self.pipelines.clear();
        self.bindings.clear();
        self.framebuffer = None;
        self.resolve_framebuffer = None;
    }

    fn create_buffer(
        &mut self,
        key: ResourceKey,
        info: &BufferInfo,
        data: Option<&[u8]>,
    ) -> Result<(), Error> {
        if info.usage.contains(BufferUsage::STORAGE) {
            return Err(Error::unsupported(self.kind(), "storage buffers"));
        }
        let webgl2 = self.webgl2();
        let needs_gl = webgl2 || info.usage.intersects(BufferUsage::VERTEX | BufferUsage::INDEX);
        let id = if needs_gl {
            let target = if info.usage.contains(BufferUsage::INDEX) {
                BufferTarget::ElementArray
            } else if info.usage.contains(BufferUsage::UNIFORM) {
                BufferTarget::Uniform
            } else {
                BufferTarget::Array
            };
            let id = self
                .gl
                .create_buffer(target)
                .ok_or_else(|| self.lost_or("buffer"))?;
            let dynamic = info.hint == crate::resources::FrequencyHint::Dynamic;
            self.gl.buffer_data(id, info.size as usize, data, dynamic);
            Some(id)
        } else {
            None
        };
        let shadow = (!webgl2).then(|| {
            let mut bytes = vec![0; info.size as usize];
            if let Some(data) = data {
                bytes[..data.len()].copy_from_slice(data);
            }
            bytes
        });
        self.buffers.insert(key, GlBuffer { id, shadow });
        Ok(())
    }

    fn write_buffer(&mut self, key: ResourceKey, offset: u64, data: &[u8]) -> Result<(), Error> {
        let gl = self.gl.clone();
        let missing = self.missing("buffer");
        let buffer = self.buffers.get_mut(key).ok_or(missing)?;
        if let Some(id) = buffer.id {
            gl.buffer_sub_data(id, offset as usize, data);
        }
        if let Some(shadow) = &mut buffer.shadow {
            shadow[offset as usize..offset as usize + data.len()].copy_from_slice(data);
        }
        Ok(())
    }

    fn create_texture(&mut self, key: ResourceKey, desc: &TextureDescriptor) -> Result<(), Error> {
        if desc.usage.contains(TextureUsage::STORAGE) {
            return Err(Error::unsupported(self.kind(), "storage textures"));
        }
        let id = self
            .gl
            .create_texture()
            .ok_or_else(|| self.lost_or("texture"))?;
        self.gl.tex_storage(id, desc);
        self.textures.insert(
            key,
            GlTexture {
                id,
                desc: *desc,
                applied_sampler: None,
            },
        );
        Ok(())
    }

    fn create_onscreen_texture(
        &mut self,
        key: ResourceKey,
        desc: &TextureDescriptor,
    ) -> Result<(), Error> {
        self.onscreen = Some(key);
        self.gl.resize_drawing_buffer(desc.width, desc.height);
        self.textures.insert(
            key,
            GlTexture {
                id: 0,
                desc: *desc,
                applied_sampler: None,
            },
        );
        Ok(())
    }

    fn write_texture(&mut self, key: ResourceKey, level: u32, data: &[u8]) -> Result<(), Error> {
        let texture = self.textures.get(key).ok_or_else(|| self.missing("texture"))?;
        self.gl.tex_sub_image(texture.id, level, data);
        Ok(())
    }

    fn create_sampler(&mut self, key: ResourceKey, desc: &SamplerDescriptor) -> Result<(), Error> {
        let id = if self.webgl2() {
            let id = self
                .gl
                .create_sampler()
                .ok_or_else(|| self.lost_or("sampler"))?;
            self.gl.sampler_parameters(id, desc);
            Some(id)
        } else {
            None
        };
        self.samplers.insert(key, GlSampler { id, desc: *desc });
        Ok(())
    }

    fn create_program(
        &mut self,
        key: ResourceKey,
        desc: &ProgramDescriptor,
    ) -> Result<ProgramReflection, Error> {
        let kind = self.kind();
        if desc.is_compute() {
            return Err(Error::unsupported(kind, "compute shaders"));
        }
        let stages = desc.resolve(kind)?;
        let mut scanned = Vec::with_capacity(2);
        let mut shaders = Vec::with_capacity(2);
        for (stage, source) in stages {
            match self.compile_stage(stage, source) {
                Ok((s, shader)) => {
                    scanned.push(s);
                    shaders.push(shader);
                }
                Err(e) => {
                    for shader in shaders {
                        self.gl.delete_shader(shader);
                    }
                    return Err(e);
                }
            }
        }
        let (vertex, fragment) = (&scanned[0], &scanned[1]);
        let linked = self
            .gl
            .link_program(shaders[0], shaders[1], &vertex.attribute_locations());
        for shader in shaders {
            self.gl.delete_shader(shader);
        }
        let id = linked.map_err(|log| {
            if self.gl.is_context_lost() {
                Error::ContextLost
            } else {
                stage_error(kind, StageKind::Link, log)
            }
        })?;

        let mut entries = Vec::new();
        let mut blocks = BTreeMap::new();
        for stage in &scanned {
            for block in &stage.blocks {
                entries.push(BindingLayoutEntry {
                    slot: block.slot,
                    kind: BindingKind::UniformBuffer,
                    min_size: block.size as u64,
                    name: block.block_name.clone(),
                });
                blocks.entry(block.slot).or_insert_with(|| block.clone());
            }
            for sampler in &stage.samplers {
                entries.push(BindingLayoutEntry {
                    slot: sampler.slot,
                    kind: BindingKind::CombinedTextureSampler,
                    min_size: 0,
                    name: sampler.name.clone(),
                });
            }
        }
        let signature = match BindingSignature::new(entries) {
            Ok(signature) => signature,
            Err(diagnostics) => {
                self.gl.delete_program(id);
                return Err(stage_error(kind, StageKind::Link, diagnostics));
            }
        };

        let mut uniforms = ProgramUniforms::new(self.gl.as_ref(), id);
        logwise::trace_sync!(
            "linked program {id} with {count} active uniforms",
            id = id,
            count = uniforms.len()
        );
        let mut points = BTreeMap::new();
        let (mut next_block, mut next_unit) = (0, 0);
        self.gl.use_program(id);
        for entry in signature.entries() {
            match entry.kind {
                BindingKind::UniformBuffer => {
                    points.insert(entry.slot, next_block);
                    if self.webgl2() && !self.gl.uniform_block_binding(id, &entry.name, next_block) {
                        logwise::trace_sync!(
                            "uniform block {name} is unused",
                            name = logwise::privacy::LogIt(&entry.name)
                        );
                    }
                    next_block += 1;
                }
                _ => {
                    points.insert(entry.slot, next_unit);
                    uniforms.set_texture_unit(self.gl.as_ref(), &entry.name, next_unit);
                    next_unit += 1;
                }
            }
        }

        let reflection = ProgramReflection {
            signature,
            vertex_inputs: vertex
                .inputs
                .iter()
                .filter_map(|v| {
                    Some(VertexInput {
                        location: v.location?,
                        components: v.ty.components(),
                        class: v.ty.scalar_class(),
                        name: v.name.clone(),
                    })
                })
                .collect(),
            fragment_outputs: fragment
                .outputs
                .iter()
                .filter_map(|v| {
                    Some(FragmentOutput {
                        location: v.location?,
                        class: v.ty.scalar_class(),
                    })
                })
                .collect(),
            workgroup_size: None,
        };
        self.programs.insert(
            key,
            GlProgram {
                id,
                blocks,
                points,
                uniforms,
            },
        );
        Ok(reflection)
    }

    fn create_render_pipeline(
        &mut self,
        key: ResourceKey,
        info: &RenderPipelineInfo,
    ) -> Result<(), Error> {
        if !self.programs.contains_key(info.program) {
            return Err(self.missing("program"));
        }
        self.pipelines.insert(
            key,
            GlPipeline {
                program: info.program,
                info: info.clone(),
            },
        );
        Ok(())
    }

    fn create_compute_pipeline(
        &mut self,
        _key: ResourceKey,
        _info: &ComputePipelineInfo,
    ) -> Result<(), Error> {
        Err(Error::unsupported(self.kind(), "compute shaders"))
    }

    fn create_bindings(&mut self, key: ResourceKey, info: &BindingsInfo) -> Result<(), Error> {
        self.bindings.insert(key, info.clone());
        Ok(())
    }

    fn destroy(&mut self, key: ResourceKey, kind: ResourceKind) {
        match kind {
            ResourceKind::Buffer => {
                if let Some(GlBuffer { id: Some(id), .. }) = self.buffers.remove(key) {
                    self.gl.delete_buffer(id);
                }
            }
            ResourceKind::Texture => {
                if let Some(texture) = self.textures.remove(key) {
                    if texture.id != 0 {
                        self.gl.delete_texture(texture.id);
                    }
                }
            }
            ResourceKind::Sampler => {
                if let Some(GlSampler { id: Some(id), .. }) = self.samplers.remove(key) {
                    self.gl.delete_sampler(id);
                }
            }
            ResourceKind::Program => {
                if let Some(program) = self.programs.remove(key) {
                    self.gl.delete_program(program.id);
                }
            }
            ResourceKind::InputLayout => {}
            ResourceKind::RenderPipeline => {
                self.pipelines.remove(key);
            }
            ResourceKind::ComputePipeline => {}
            ResourceKind::Bindings => {
                self.bindings.remove(key);
            }
        }
    }

    fn submit_render_pass(&mut self, pass: &ResolvedRenderPass) -> Result<(), Error> {
        let gl = self.gl.clone();
        let framebuffer = self.bind_attachments(pass)?;
        let (width, height) = pass.size;
        gl.viewport(0.0, 0.0, width as f32, height as f32, 0.0, 1.0);
        for (index, color) in pass.colors.iter().enumerate() {
            if let Some(rgba) = color.clear {
                gl.clear_color(index as u32, rgba);
            }
        }
        if let Some(ds) = &pass.depth_stencil {
            if ds.depth_clear.is_some() || ds.stencil_clear.is_some() {
                gl.clear_depth_stencil(ds.depth_clear, ds.stencil_clear);
            }
        }

        let mut pipeline: Option<GlPipeline> = None;
        let mut bindings: Option<ResourceKey> = None;
        let mut bindings_applied = false;
        let mut vertex_buffers: Vec<(ResourceKey, u64)> = Vec::new();
        let mut index_buffer: Option<(ResourceKey, u64)> = None;

        for command in &pass.commands {
            let (draw_range, instances, indexed) = match command {
                RenderCommand::SetPipeline(key) => {
                    let p = self
                        .pipelines
                        .get(*key)
                        .cloned()
                        .ok_or_else(|| self.missing("pipeline"))?;
                    let program = self
                        .programs
                        .get(p.program)
                        .ok_or_else(|| self.missing("program"))?;
                    gl.use_program(program.id);
                    gl.apply_state(&p.info.mega_state);
                    pipeline = Some(p);
                    bindings_applied = false;
                    continue;
                }
                RenderCommand::SetBindings(key) => {
                    bindings = Some(*key);
                    bindings_applied = false;
                    continue;
                }
                RenderCommand::SetVertexInput {
                    vertex_buffers: vb,
                    index_buffer: ib,
                } => {
                    vertex_buffers.clone_from(vb);
                    index_buffer = *ib;
                    continue;
                }
                RenderCommand::SetViewport(v) => {
                    gl.viewport(v.x, v.y, v.width, v.height, v.min_depth, v.max_depth);
                    continue;
                }
                RenderCommand::Draw {
                    vertices,
                    instances,
                } => (vertices, instances, false),
                RenderCommand::DrawIndexed { indices, instances } => (indices, instances, true),
            };
            let Some(p) = &pipeline else {
                return Err(self.missing("pipeline"));
            };
            if instances.start != 0 {
                return Err(Error::unsupported(self.kind(), "a non-zero first instance"));
            }
            if !bindings_applied {
                if let Some(key) = bindings {
                    self.apply_bindings(p, key)?;
                }
                bindings_applied = true;
            }
            gl.vertex_attribs(&self.attributes_for(p, &vertex_buffers));
            let count = draw_range.end - draw_range.start;
            let instance_count = instances.end - instances.start;
            if indexed {
                let (Some((key, offset)), Some(format)) =
                    (index_buffer, p.info.input_layout.index_format)
                else {
                    return Err(self.missing("index buffer"));
                };
                let id = self
                    .buffers
                    .get(key)
                    .and_then(|b| b.id)
                    .ok_or_else(|| self.missing("buffer"))?;
                let byte_offset = offset + draw_range.start as u64 * format.size();
                gl.draw_elements(p.info.topology, id, format, byte_offset, count, instance_count);
            } else {
                gl.draw_arrays(p.info.topology, draw_range.start, count, instance_count);
            }
        }
        self.resolve(pass, framebuffer)
    }

    fn submit_compute_pass(&mut self, _pass: &ResolvedComputePass) -> Result<(), Error> {
        Err(Error::unsupported(self.kind(), "compute shaders"))
    }

    fn read_buffer(
        &mut self,
        key: ResourceKey,
        offset: u64,
        size: u64,
    ) -> Result<ReadFuture, Error> {
        let buffer = self.buffers.get(key).ok_or_else(|| self.missing("buffer"))?;
        if let Some(shadow) = &buffer.shadow {
            let bytes = shadow[offset as usize..(offset + size) as usize].to_vec();
            return Ok(Box::pin(std::future::ready(Ok(bytes))));
        }
        let id = buffer.id.ok_or_else(|| self.missing("buffer"))?;
        let gl = self.gl.clone();
        let sync = gl.fence_sync();
        gl.flush();
        let future: BoxFuture<Result<Vec<u8>, Error>> = Box::pin(async move {
            FenceWait {
                gl: gl.clone(),
                sync,
            }
            .await?;
            let mut bytes = vec![0; size as usize];
            gl.get_buffer_sub_data(id, offset as usize, &mut bytes);
            Ok(bytes)
        });
        Ok(future)
    }

    fn read_texture(&mut self, key: ResourceKey, level: u32) -> Result<ReadFuture, Error> {
        let texture = self.textures.get(key).ok_or_else(|| self.missing("texture"))?;
        let desc = texture.desc;
        let id = texture.id;
        if desc.format.is_depth() {
            return Err(Error::unsupported(self.kind(), "reading depth textures"));
        }
        let (width, height) = desc.level_size(level);
        let mut bytes = vec![0; desc.level_byte_len(level)];
        if id == 0 {
            self.gl
                .read_pixels(0, width, height, desc.format, &mut bytes);
        } else {
            let fb = self.scratch_framebuffer(false)?;
            let layer_len = bytes.len() / desc.depth.max(1) as usize;
            for (layer, chunk) in bytes.chunks_exact_mut(layer_len).enumerate() {
                let attachment = GlAttachment {
                    texture: id,
                    level,
                    layer: layer as u32,
                };
                self.gl.bind_framebuffer(fb, &[attachment], None);
                self.gl.read_pixels(fb, width, height, desc.format, chunk);
            }
        }
        Ok(Box::pin(std::future::ready(Ok(bytes))))
    }

    fn configure(&mut self, onscreen: ResourceKey, width: u32, height: u32) -> Result<(), Error> {
        let missing = self.missing("onscreen texture");
        let texture = self.textures.get_mut(onscreen).ok_or(missing)?;
        texture.desc.width = width;
        texture.desc.height = height;
        self.gl.resize_drawing_buffer(width, height);
        Ok(())
    }

    /// The browser composites the drawing buffer itself; presenting only flushes.
    fn present(&mut self) -> Result<(), Error> {
        if self.onscreen.is_none() {
            return Err(self.missing("onscreen texture"));
        }
        self.gl.flush();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::ShaderStage;
    use crate::resources::FrequencyHint;

    fn keys() -> slotmap::SlotMap<ResourceKey, ()> {
        slotmap::SlotMap::with_key()
    }

    #[test]
    fn webgl1_has_no_compute() {
        let gl = Rc::new(HeadlessGl::new(GlVersion::WebGl1, 4, 4));
        let mut backend = WebGlBackend::new(gl, GlVersion::WebGl1).unwrap();
        let desc = ProgramDescriptor::compute(
            ShaderStage::new().glsl("#version 450\nlayout(local_size_x = 1) in;\nvoid main() {}\n"),
        );
        let err = backend.create_program(keys().insert(()), &desc).unwrap_err();
        assert!(matches!(err, Error::Unsupported { backend: BackendKind::WebGL1, .. }));
        assert_eq!(backend.limits().max_compute_workgroups_per_dimension, 0);
    }

    #[test]
    fn version_mismatch_fails_creation() {
        let gl = Rc::new(HeadlessGl::new(GlVersion::WebGl1, 4, 4));
        assert!(matches!(
            WebGlBackend::new(gl, GlVersion::WebGl2),
            Err(Error::ContextCreation { .. })
        ));
    }

    #[test_executors::async_test]
    async fn webgl2_buffer_readback_waits_for_the_fence() {
        let gl = HeadlessGl::new(GlVersion::WebGl2, 4, 4);
        let mut backend = WebGlBackend::new(Rc::new(gl.clone()), GlVersion::WebGl2).unwrap();
        let key = keys().insert(());
        let info = BufferInfo {
            size: 8,
            usage: BufferUsage::VERTEX | BufferUsage::COPY_SRC,
            hint: FrequencyHint::Static,
        };
        backend
            .create_buffer(key, &info, Some(&[1, 2, 3, 4, 5, 6, 7, 8]))
            .unwrap();
        let bytes = backend.read_buffer(key, 2, 4).unwrap().await.unwrap();
        assert_eq!(bytes, vec![3, 4, 5, 6]);
        assert_eq!(gl.calls("fence_sync"), 1);
        assert_eq!(gl.calls("sync_signaled"), 2);
        assert_eq!(gl.calls("delete_sync"), 1);
    }
}
