// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The device: factory for every GPU object and the only place passes are submitted.
//!
//! A device is obtained from a [`crate::SwapChain`].  It exclusively owns every object it
//! creates; callers hold handles.  All methods take `&mut self`, which is also what makes
//! pass recording exclusive: a pass holds the device's pass cursor until it is submitted or
//! dropped.
//!
//! # Context loss
//!
//! Each call first asks the backend whether its context is still alive.  The first call that
//! observes a loss forgets every object, invokes the `on_context_lost` callback and returns
//! [`Error::ContextLost`].  The first call after the backend recovers invokes
//! `on_context_restored`; callers then recreate their resources.  Handles from before the loss
//! keep returning [`Error::ContextLost`] forever.

use crate::bindings::{self, BindingsDescriptor, BindingsInfo, BindingsPipeline, PipelineKey};
use crate::error::{Error, LeakWarning, ResourceMismatchError};
use crate::format::{TextureFormat, VertexFormat};
use crate::handles::{
    BindingsHandle, BufferHandle, ComputePipelineHandle, DeviceId, InputLayoutHandle,
    ProgramHandle, RawHandle, RenderPipelineHandle, ResourceHandle, ResourceKey, SamplerHandle, TextureHandle,
};
use crate::imp::{Backend, ContextStatus, ReadFuture};
use crate::pass::{ComputePass, Pass, PassCursor, RenderPass, RenderPassDescriptor};
use crate::pipeline::{
    self, ComputePipelineDescriptor, ComputePipelineInfo, InputLayoutDescriptor,
    RenderPipelineDescriptor, RenderPipelineInfo,
};
use crate::program::{ProgramDescriptor, ProgramInfo, ProgramReflection};
use crate::readback::Readback;
use crate::registry::{InFlightGuard, Record, Registry, TextureInfo};
use crate::resources::{BufferDescriptor, BufferInfo, SamplerDescriptor, TextureDescriptor};
use crate::swap_chain::{BackendKind, ContextCallbacks, LeakPolicy};

/// Limits of the active backend.  Descriptors are checked against these at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub max_texture_dimension_2d: u32,
    pub max_bind_groups: u32,
    pub max_uniform_buffer_binding_size: u64,
    pub max_storage_buffer_binding_size: u64,
    pub min_uniform_buffer_offset_alignment: u64,
    pub min_storage_buffer_offset_alignment: u64,
    pub max_color_attachments: u32,
    pub max_vertex_attributes: u32,
    pub max_compute_workgroup_size: [u32; 3],
    pub max_compute_workgroups_per_dimension: u32,
    pub max_samples: u32,
}

impl DeviceLimits {
    /// Whether compute pipelines can be created at all.
    pub fn supports_compute(&self) -> bool {
        self.max_compute_workgroups_per_dimension > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Live,
    Lost,
}

pub struct Device {
    registry: Registry,
    backend: Box<dyn Backend>,
    cursor: PassCursor,
    state: ContextState,
    callbacks: ContextCallbacks,
    leak_policy: LeakPolicy,
    onscreen: Option<TextureHandle>,
    onscreen_desc: TextureDescriptor,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("backend", &self.backend.kind())
            .field("state", &self.state)
            .field("live_objects", &self.registry.len())
            .finish()
    }
}

impl Device {
    pub(crate) fn new(
        backend: Box<dyn Backend>,
        callbacks: ContextCallbacks,
        leak_policy: LeakPolicy,
        onscreen_desc: TextureDescriptor,
    ) -> Result<Self, Error> {
        let mut device = Device {
            registry: Registry::new(DeviceId::next()),
            backend,
            cursor: PassCursor::default(),
            state: ContextState::Live,
            callbacks,
            leak_policy,
            onscreen: None,
            onscreen_desc,
        };
        device.create_onscreen()?;
        Ok(device)
    }

    fn check_onscreen_size(&self, width: u32, height: u32) -> Result<(), Error> {
        let max = self.backend.limits().max_texture_dimension_2d;
        if width > max || height > max {
            return Err(Error::invalid_descriptor(
                "swap chain",
                format!("{width}x{height} exceeds the {max}-texel texture limit"),
            ));
        }
        Ok(())
    }

    fn create_onscreen(&mut self) -> Result<(), Error> {
        let desc = self.onscreen_desc;
        self.check_onscreen_size(desc.width, desc.height)?;
        let raw = self.registry.insert(Record::Texture(TextureInfo {
            desc,
            onscreen: true,
        }));
        if let Err(e) = self.backend.create_onscreen_texture(raw.key, &desc) {
            self.registry.discard(raw);
            return Err(e);
        }
        self.onscreen = Some(TextureHandle(raw));
        Ok(())
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn limits(&self) -> DeviceLimits {
        self.backend.limits()
    }

    pub fn supports_texture_format(&self, format: TextureFormat) -> bool {
        self.backend.supports_texture_format(format)
    }

    pub fn supports_vertex_format(&self, format: VertexFormat) -> bool {
        self.backend.supports_vertex_format(format)
    }

    /// Polls the backend and runs the loss/restore transitions if the context changed.
    pub fn context_state(&mut self) -> ContextState {
        let _ = self.ensure_live();
        self.state
    }

    fn ensure_live(&mut self) -> Result<(), Error> {
        match (self.state, self.backend.context_status()) {
            (ContextState::Live, ContextStatus::Live) => Ok(()),
            (ContextState::Live, ContextStatus::Lost) => {
                logwise::warn_sync!(
                    "{backend} context lost; dropping {count} objects",
                    backend = logwise::privacy::LogIt(&self.backend.kind()),
                    count = self.registry.len()
                );
                self.registry.lose_context();
                self.backend.reset();
                self.onscreen = None;
                self.state = ContextState::Lost;
                self.callbacks.context_lost();
                Err(Error::ContextLost)
            }
            (ContextState::Lost, ContextStatus::Lost) => Err(Error::ContextLost),
            (ContextState::Lost, ContextStatus::Live) => {
                logwise::info_sync!(
                    "{backend} context restored at epoch {epoch}",
                    backend = logwise::privacy::LogIt(&self.backend.kind()),
                    epoch = self.registry.epoch()
                );
                self.state = ContextState::Live;
                self.create_onscreen()?;
                self.callbacks.context_restored();
                Ok(())
            }
        }
    }

    /// Registers `record`, then lets the backend build its native object.  A backend failure
    /// removes the registry entry again.
    fn install(
        &mut self,
        record: Record,
        build: impl FnOnce(&mut dyn Backend, ResourceKey) -> Result<(), Error>,
    ) -> Result<RawHandle, Error> {
        let raw = self.registry.insert(record);
        match build(self.backend.as_mut(), raw.key) {
            Ok(()) => Ok(raw),
            Err(e) => {
                self.registry.discard(raw);
                Err(e)
            }
        }
    }

    pub fn create_buffer(&mut self, desc: &BufferDescriptor<'_>) -> Result<BufferHandle, Error> {
        self.ensure_live()?;
        desc.validate()?;
        let info = BufferInfo {
            size: desc.byte_len(),
            usage: desc.usage,
            hint: desc.hint,
        };
        let data = desc.initial_data();
        let raw = self.install(Record::Buffer(info), |backend, key| {
            backend.create_buffer(key, &info, data)
        })?;
        Ok(BufferHandle(raw))
    }

    /// Overwrites `data.len()` bytes at `offset`.  Ordered with respect to submitted passes.
    pub fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), Error> {
        self.ensure_live()?;
        let info = self.registry.buffer(buffer)?;
        let end = offset.checked_add(data.len() as u64);
        if end.is_none_or(|end| end > info.size) {
            return Err(Error::invalid_descriptor(
                "buffer write",
                format!(
                    "{} bytes at offset {offset} overrun the {}-byte buffer",
                    data.len(),
                    info.size
                ),
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        self.backend.write_buffer(buffer.key(), offset, data)
    }

    pub fn create_texture(&mut self, desc: &TextureDescriptor) -> Result<TextureHandle, Error> {
        self.ensure_live()?;
        desc.validate()?;
        let limits = self.backend.limits();
        if desc.width > limits.max_texture_dimension_2d
            || desc.height > limits.max_texture_dimension_2d
        {
            return Err(Error::invalid_descriptor(
                "texture",
                format!(
                    "{}x{} exceeds the {} texel limit",
                    desc.width, desc.height, limits.max_texture_dimension_2d
                ),
            ));
        }
        if !self.backend.supports_texture_format(desc.format) {
            return Err(Error::unsupported(
                self.backend.kind(),
                format!("texture format {}", desc.format),
            ));
        }
        if desc.sample_count > limits.max_samples {
            return Err(Error::unsupported(
                self.backend.kind(),
                format!("sample count {}", desc.sample_count),
            ));
        }
        let desc = *desc;
        let raw = self.install(
            Record::Texture(TextureInfo {
                desc,
                onscreen: false,
            }),
            |backend, key| backend.create_texture(key, &desc),
        )?;
        Ok(TextureHandle(raw))
    }

    /// Uploads one mip level (every layer), tightly packed.
    pub fn write_texture(
        &mut self,
        texture: TextureHandle,
        level: u32,
        data: &[u8],
    ) -> Result<(), Error> {
        self.ensure_live()?;
        let info = self.registry.texture(texture)?;
        let desc = info.desc;
        if info.onscreen || desc.sample_count != 1 || desc.format.is_depth() {
            return Err(Error::invalid_descriptor(
                "texture write",
                "only single-sample color textures owned by the caller can be written",
            ));
        }
        if level >= desc.mip_levels || data.len() != desc.level_byte_len(level) {
            return Err(Error::invalid_descriptor(
                "texture write",
                format!(
                    "level {level} expects {} bytes, got {}",
                    desc.level_byte_len(level.min(desc.mip_levels - 1)),
                    data.len()
                ),
            ));
        }
        self.backend.write_texture(texture.key(), level, data)
    }

    pub fn create_sampler(&mut self, desc: &SamplerDescriptor) -> Result<SamplerHandle, Error> {
        self.ensure_live()?;
        desc.validate()?;
        let desc = *desc;
        let raw = self.install(Record::Sampler(desc), |backend, key| {
            backend.create_sampler(key, &desc)
        })?;
        Ok(SamplerHandle(raw))
    }

    /// Compiles the source matching the active backend and reflects its binding signature.
    pub fn create_program(&mut self, desc: &ProgramDescriptor) -> Result<ProgramHandle, Error> {
        self.ensure_live()?;
        let compute = desc.is_compute();
        let mut reflection = None;
        let raw = self.install(
            Record::Program(ProgramInfo {
                reflection: ProgramReflection::default(),
                compute,
            }),
            |backend, key| {
                reflection = Some(backend.create_program(key, desc)?);
                Ok(())
            },
        )?;
        if let (Some(Record::Program(info)), Some(reflection)) =
            (self.registry.record_mut(raw.key), reflection)
        {
            info.reflection = reflection;
        }
        Ok(ProgramHandle(raw))
    }

    pub fn program_reflection(&self, program: ProgramHandle) -> Result<&ProgramReflection, Error> {
        Ok(&self.registry.program(program)?.reflection)
    }

    pub fn create_input_layout(
        &mut self,
        desc: &InputLayoutDescriptor,
    ) -> Result<InputLayoutHandle, Error> {
        self.ensure_live()?;
        desc.validate(self.backend.as_ref())?;
        let raw = self.install(Record::InputLayout(desc.clone()), |_, _| Ok(()))?;
        Ok(InputLayoutHandle(raw))
    }

    pub fn create_render_pipeline(
        &mut self,
        desc: &RenderPipelineDescriptor,
    ) -> Result<RenderPipelineHandle, Error> {
        self.ensure_live()?;
        let program = self.registry.program(desc.program)?;
        let layout = match desc.input_layout {
            Some(handle) => self.registry.input_layout(handle)?.clone(),
            None => InputLayoutDescriptor::default(),
        };
        pipeline::validate_render_pipeline(desc, program, &layout, self.backend.as_ref())?;
        let info = RenderPipelineInfo {
            program: desc.program.key(),
            signature: program.reflection.signature.clone(),
            input_layout: layout,
            mega_state: desc.mega_state,
            topology: desc.topology,
            color_formats: desc.color_attachment_formats.clone(),
            depth_stencil_format: desc.depth_stencil_attachment_format,
            sample_count: desc.sample_count,
        };
        let for_backend = info.clone();
        let raw = self.install(Record::RenderPipeline(info), |backend, key| {
            backend.create_render_pipeline(key, &for_backend)
        })?;
        Ok(RenderPipelineHandle(raw))
    }

    pub fn create_compute_pipeline(
        &mut self,
        desc: &ComputePipelineDescriptor,
    ) -> Result<ComputePipelineHandle, Error> {
        self.ensure_live()?;
        let program = self.registry.program(desc.program)?;
        if !program.compute {
            return Err(ResourceMismatchError::general(
                "a compute pipeline needs a compute program",
            )
            .into());
        }
        if let Some(layout) = desc.input_layout {
            self.registry.input_layout(layout)?;
        }
        let workgroup_size = program.reflection.workgroup_size.unwrap_or([1, 1, 1]);
        let limits = self.backend.limits();
        if workgroup_size
            .iter()
            .zip(limits.max_compute_workgroup_size)
            .any(|(size, max)| *size == 0 || *size > max)
        {
            return Err(Error::unsupported(
                self.backend.kind(),
                format!("workgroup size {workgroup_size:?}"),
            ));
        }
        let info = ComputePipelineInfo {
            program: desc.program.key(),
            signature: program.reflection.signature.clone(),
            workgroup_size,
        };
        let for_backend = info.clone();
        let raw = self.install(Record::ComputePipeline(info), |backend, key| {
            backend.create_compute_pipeline(key, &for_backend)
        })?;
        Ok(ComputePipelineHandle(raw))
    }

    /// Validates `desc` against the pipeline's signature.  See [`crate::bindings`].
    pub fn create_bindings(&mut self, desc: &BindingsDescriptor) -> Result<BindingsHandle, Error> {
        self.ensure_live()?;
        let (pipeline, signature) = match desc.pipeline {
            BindingsPipeline::Render(handle) => (
                PipelineKey::Render(handle.key()),
                self.registry.render_pipeline(handle)?.signature.clone(),
            ),
            BindingsPipeline::Compute(handle) => (
                PipelineKey::Compute(handle.key()),
                self.registry.compute_pipeline(handle)?.signature.clone(),
            ),
        };
        let limits = self.backend.limits();
        let entries = bindings::validate(desc, &signature, &self.registry, &limits)?;
        let info = BindingsInfo {
            pipeline,
            signature,
            entries,
        };
        let for_backend = info.clone();
        let raw = self.install(Record::Bindings(info), |backend, key| {
            backend.create_bindings(key, &for_backend)
        })?;
        Ok(BindingsHandle(raw))
    }

    /// Opens a render pass.  Attachments are checked now and again at submission.
    pub fn create_render_pass(&mut self, desc: RenderPassDescriptor) -> Result<RenderPass, Error> {
        self.ensure_live()?;
        let token = self.cursor.open(self.registry.device())?;
        crate::pass::resolve_attachments(&desc, &self.registry, &self.backend.limits())?;
        Ok(RenderPass::new(desc, token))
    }

    pub fn create_compute_pass(&mut self) -> Result<ComputePass, Error> {
        self.ensure_live()?;
        let token = self.cursor.open(self.registry.device())?;
        Ok(ComputePass::new(token))
    }

    pub fn create_readback(&self) -> Readback {
        Readback::new(self.registry.device())
    }

    /// Validates and executes a recorded pass.
    ///
    /// This is the only ordering point: passes run in submission order, and a readback started
    /// after this call observes the pass's writes.
    ///
    /// # Panics
    /// If the pass was recorded on a different device.
    pub fn submit_pass(&mut self, pass: impl Into<Pass>) -> Result<(), Error> {
        let pass = pass.into();
        self.ensure_live()?;
        let limits = self.backend.limits();
        match &pass {
            Pass::Render(render) => {
                assert_eq!(
                    render.token.device,
                    self.registry.device(),
                    "render pass submitted to a device that did not create it"
                );
                let resolved = render.resolve(&self.registry, &limits)?;
                logwise::trace_sync!(
                    "submit render pass: {count} commands",
                    count = resolved.commands.len()
                );
                self.backend.submit_render_pass(&resolved)
            }
            Pass::Compute(compute) => {
                assert_eq!(
                    compute.token.device,
                    self.registry.device(),
                    "compute pass submitted to a device that did not create it"
                );
                let resolved = compute.resolve(&self.registry, &limits)?;
                logwise::trace_sync!(
                    "submit compute pass: {count} commands",
                    count = resolved.commands.len()
                );
                self.backend.submit_compute_pass(&resolved)
            }
        }
    }

    /// Attaches a label used only in diagnostics.
    pub fn set_resource_name(
        &mut self,
        handle: impl Into<ResourceHandle>,
        name: impl Into<String>,
    ) -> Result<(), Error> {
        self.registry.set_name(handle.into(), name.into())
    }

    /// Every object created through this device and not destroyed yet.
    ///
    /// The swap chain's onscreen texture is not reported.
    pub fn check_for_leaks(&self) -> Vec<LeakWarning> {
        let leaks = self.registry.check_for_leaks();
        for leak in &leaks {
            logwise::warn_sync!("{leak}", leak = logwise::privacy::LogIt(leak));
        }
        leaks
    }

    /// Releases the object.  The handle is retired and never resolves again.
    ///
    /// # Panics
    /// If the handle was already destroyed.
    pub fn destroy(&mut self, handle: impl Into<ResourceHandle>) -> Result<(), Error> {
        let handle = handle.into();
        self.ensure_live()?;
        if let ResourceHandle::Texture(texture) = handle {
            if Some(texture) == self.onscreen {
                return Err(Error::invalid_descriptor(
                    "destroy",
                    "the onscreen texture belongs to the swap chain",
                ));
            }
        }
        let record = self.registry.remove(handle)?;
        self.backend.destroy(handle.raw().key, record.kind());
        Ok(())
    }

    pub fn buffer_size(&self, buffer: BufferHandle) -> Result<u64, Error> {
        Ok(self.registry.buffer(buffer)?.size)
    }

    pub fn texture_descriptor(&self, texture: TextureHandle) -> Result<TextureDescriptor, Error> {
        Ok(self.registry.texture(texture)?.desc)
    }

    /// Number of objects in the registry, onscreen texture included.
    pub fn live_object_count(&self) -> usize {
        self.registry.len()
    }

    pub(crate) fn device_id(&self) -> DeviceId {
        self.registry.device()
    }

    pub(crate) fn onscreen_texture(&mut self) -> Result<TextureHandle, Error> {
        self.ensure_live()?;
        self.onscreen.ok_or(Error::ContextLost)
    }

    pub(crate) fn configure(&mut self, width: u32, height: u32) -> Result<(), Error> {
        self.ensure_live()?;
        if width == 0 || height == 0 {
            return Err(Error::invalid_descriptor(
                "swap chain",
                "width and height must be non-zero",
            ));
        }
        self.check_onscreen_size(width, height)?;
        let onscreen = self.onscreen.ok_or(Error::ContextLost)?;
        self.backend.configure(onscreen.key(), width, height)?;
        let info = self.registry.texture_mut(onscreen)?;
        info.desc.width = width;
        info.desc.height = height;
        self.onscreen_desc = info.desc;
        Ok(())
    }

    pub(crate) fn present(&mut self) -> Result<(), Error> {
        self.ensure_live()?;
        self.backend.present()
    }

    pub(crate) fn begin_buffer_readback(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    ) -> Result<(InFlightGuard, ReadFuture), Error> {
        self.ensure_live()?;
        let info = self.registry.buffer(buffer)?;
        let size = size.unwrap_or(info.size.saturating_sub(offset));
        let end = offset.checked_add(size);
        if size == 0 || end.is_none_or(|end| end > info.size) {
            return Err(Error::invalid_descriptor(
                "readback",
                format!(
                    "{size} bytes at offset {offset} do not fit the {}-byte buffer",
                    info.size
                ),
            ));
        }
        let guard = self.registry.begin_readback(buffer.into())?;
        let future = self.backend.read_buffer(buffer.key(), offset, size)?;
        Ok((guard, future))
    }

    pub(crate) fn begin_texture_readback(
        &mut self,
        texture: TextureHandle,
        level: u32,
    ) -> Result<(InFlightGuard, ReadFuture, TextureDescriptor), Error> {
        self.ensure_live()?;
        let desc = self.registry.texture(texture)?.desc;
        if level >= desc.mip_levels || desc.sample_count != 1 {
            return Err(Error::invalid_descriptor(
                "readback",
                "only existing levels of single-sample textures can be read",
            ));
        }
        let guard = self.registry.begin_readback(texture.into())?;
        let future = self.backend.read_texture(texture.key(), level)?;
        Ok((guard, future, desc))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.cursor.is_open() {
            logwise::warn_sync!("device dropped while a pass is recording");
        }
        match self.leak_policy {
            LeakPolicy::Ignore => {}
            LeakPolicy::Warn => {
                self.check_for_leaks();
            }
            LeakPolicy::Panic => {
                let leaks = self.registry.check_for_leaks();
                if !leaks.is_empty() && !std::thread::panicking() {
                    let list: Vec<String> = leaks.iter().map(|l| l.to_string()).collect();
                    panic!("device dropped with live objects: {}", list.join(", "));
                }
            }
        }
    }
}
