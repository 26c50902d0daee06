// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Backend implementations.
//!
//! The public API is backend-agnostic.  Exactly one [`Backend`] is chosen when the swap chain is
//! created and the [`crate::Device`] talks to it through this trait for its whole life; no call
//! site branches on the backend kind.
//!
//! Backends never decide whether a handle is valid.  The device resolves handles through the
//! registry first and passes the backend plain [`ResourceKey`]s, which the backend uses to look
//! up its native objects.

pub(crate) mod software;
pub mod webgl;
#[cfg(feature = "backend_wgpu")]
pub(crate) mod wgpu;

use crate::bindings::BindingsInfo;
use crate::device::DeviceLimits;
use crate::error::Error;
use crate::format::{TextureFormat, VertexFormat};
use crate::handles::{ResourceKey, ResourceKind};
use crate::pass::{ResolvedComputePass, ResolvedRenderPass};
use crate::pipeline::{ComputePipelineInfo, RenderPipelineInfo};
use crate::program::{ProgramDescriptor, ProgramReflection};
use crate::resources::{BufferInfo, SamplerDescriptor, TextureDescriptor};
use crate::swap_chain::BackendKind;
use std::future::Future;
use std::pin::Pin;

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T>>>;
pub(crate) type ReadFuture = BoxFuture<Result<Vec<u8>, Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContextStatus {
    Live,
    Lost,
}

pub(crate) trait Backend {
    fn kind(&self) -> BackendKind;
    fn limits(&self) -> DeviceLimits;
    fn supports_texture_format(&self, format: TextureFormat) -> bool;
    fn supports_vertex_format(&self, format: VertexFormat) -> bool;

    /// Polled by the device before each call.
    fn context_status(&mut self) -> ContextStatus;
    /// Forgets every native object.  Called once when a loss is observed.
    fn reset(&mut self);

    fn create_buffer(
        &mut self,
        key: ResourceKey,
        info: &BufferInfo,
        data: Option<&[u8]>,
    ) -> Result<(), Error>;
    fn write_buffer(&mut self, key: ResourceKey, offset: u64, data: &[u8]) -> Result<(), Error>;
    fn create_texture(&mut self, key: ResourceKey, desc: &TextureDescriptor) -> Result<(), Error>;
    /// Registers the swap chain's presentable texture under `key`.
    fn create_onscreen_texture(
        &mut self,
        key: ResourceKey,
        desc: &TextureDescriptor,
    ) -> Result<(), Error>;
    fn write_texture(&mut self, key: ResourceKey, level: u32, data: &[u8]) -> Result<(), Error>;
    fn create_sampler(&mut self, key: ResourceKey, desc: &SamplerDescriptor) -> Result<(), Error>;
    fn create_program(
        &mut self,
        key: ResourceKey,
        desc: &ProgramDescriptor,
    ) -> Result<ProgramReflection, Error>;
    fn create_render_pipeline(
        &mut self,
        key: ResourceKey,
        info: &RenderPipelineInfo,
    ) -> Result<(), Error>;
    fn create_compute_pipeline(
        &mut self,
        key: ResourceKey,
        info: &ComputePipelineInfo,
    ) -> Result<(), Error>;
    fn create_bindings(&mut self, key: ResourceKey, info: &BindingsInfo) -> Result<(), Error>;
    fn destroy(&mut self, key: ResourceKey, kind: ResourceKind);

    fn submit_render_pass(&mut self, pass: &ResolvedRenderPass) -> Result<(), Error>;
    fn submit_compute_pass(&mut self, pass: &ResolvedComputePass) -> Result<(), Error>;

    /// Starts a readback.  Work submitted before this call is visible in the result.
    fn read_buffer(&mut self, key: ResourceKey, offset: u64, size: u64)
    -> Result<ReadFuture, Error>;
    /// Reads one mip level, tightly packed.
    fn read_texture(&mut self, key: ResourceKey, level: u32) -> Result<ReadFuture, Error>;

    fn configure(&mut self, onscreen: ResourceKey, width: u32, height: u32) -> Result<(), Error>;
    fn present(&mut self) -> Result<(), Error>;
}
