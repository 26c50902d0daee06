// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
passes_and_kernels is a GPU device abstraction and compute-kernel dispatch layer.

One resource, pipeline and pass API runs on four backends:

| Backend  | Native API                               | Shader source used            | Compute |
|----------|------------------------------------------|-------------------------------|---------|
| WebGL1   | `WebGLRenderingContext` or [`gl::HeadlessGl`]  | [`ShaderSource::Glsl450`] | No      |
| WebGL2   | `WebGL2RenderingContext` or [`gl::HeadlessGl`] | [`ShaderSource::Glsl450`] | No      |
| WebGPU   | [wgpu](https://wgpu.rs)                  | [`ShaderSource::Wgsl`]        | Yes     |
| Software | the CPU                                  | [`ShaderSource::Host`]        | Yes     |

The backend is chosen once, by [`create_swap_chain`], from an ordered list of preferences.
Nothing after that branches on it: a [`Device`] behaves the same whichever backend sits below,
and a program carries its sources for every language side by side so the same call site
works everywhere.

# Objects

Everything the device creates is named by a small `Copy` handle ([`BufferHandle`],
[`TextureHandle`], ...).  Handles own nothing.  An object lives until
[`Device::destroy`] is called on it, and [`Device::check_for_leaks`] lists what is still alive.

A program's binding signature is reflected when it is compiled and never changes.
[`Device::create_bindings`] checks a [`BindingsDescriptor`] against it, so a draw or dispatch
never discovers a mismatched resource.

# Passes

Work is recorded into a [`RenderPass`] or [`ComputePass`] and handed to
[`Device::submit_pass`], which validates the whole pass before running any of it.  One pass
may be open per device.  Submission order is the only ordering guarantee.

# Kernels

[`Kernel`] wraps one compute pipeline and its bindings for iterative algorithms: set
resources by slot, dispatch a grid, read a result back.

```
# use passes_and_kernels::*;
# use passes_and_kernels::algorithms::{Graph, PageRankOptions, page_rank};
# test_executors::spin_on(async {
let surface = HeadlessSurface::new(1, 1);
let config = SwapChainConfig::default().with_targets(vec![BackendKind::Software]);
let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
let graph = Graph::new(3, &[(0, 1), (1, 2), (2, 0), (0, 2)]);
let result = page_rank(swap_chain.get_device(), &graph, &PageRankOptions::default())
    .await
    .unwrap();
assert!(result.converged);
assert_eq!(result.ranks.len(), 3);
# });
```

# Context loss

WebGL contexts can be lost at any time.  The device notices on its next call, drops every
object, and reports [`Error::ContextLost`] for handles made before the loss.  Once the context
comes back, new objects can be created; old handles stay dead.
*/

mod bindings;
mod device;
mod error;
mod format;
mod handles;
mod imp;
mod kernel;
mod pass;
mod pipeline;
mod program;
mod readback;
mod registry;
mod resources;
mod swap_chain;
mod sys;

pub mod algorithms;

/// The GL call surface under the WebGL backends, and a headless implementation of it.
pub mod gl {
    pub use crate::imp::webgl::{
        ActiveUniform, BufferTarget, GlAttachment, GlContext, GlVersion, GlVertexAttrib,
        HeadlessGl, types,
    };
}

pub use bindings::{
    BindingsDescriptor, BindingsPipeline, BufferBinding, SamplerBinding, StorageTextureBinding,
};
pub use device::{ContextState, Device, DeviceLimits};
pub use error::{
    Error, LeakWarning, ResourceBusyError, ResourceMismatchError, ShaderCompileError, StageKind,
};
pub use format::{ChannelType, IndexFormat, TextureFormat, VertexFormat};
pub use handles::{
    BindingsHandle, BufferHandle, ComputePipelineHandle, InputLayoutHandle, ProgramHandle,
    RenderPipelineHandle, ResourceHandle, ResourceKind, SamplerHandle, TextureHandle,
};
pub use kernel::{Kernel, KernelResource, dispatch_grid};
pub use pass::{
    ColorAttachment, ComputePass, DepthStencilAttachment, IndexBufferBinding, Pass, RenderPass,
    RenderPassDescriptor, VertexBufferBinding, Viewport,
};
pub use pipeline::{
    BlendComponent, BlendFactor, BlendOperation, BlendState, ColorWrites,
    ComputePipelineDescriptor, CullMode, FrontFace, InputLayoutDescriptor, MegaStateDescriptor,
    PrimitiveTopology, RenderPipelineDescriptor, StencilFaceState, StencilOperation,
    StencilState, VertexAttribute, VertexBufferLayout, VertexStepMode,
};
pub use program::{
    BindingKind, BindingLayoutEntry, BindingSignature, BindingSlot, FragmentOutput,
    HostComputeContext, HostRasterContext, HostShader, HostTarget, ProgramDescriptor,
    ProgramReflection, ScalarClass, ShaderSource, ShaderStage, VertexInput,
};
pub use readback::{Readback, ReadbackData, ReadbackFuture};
pub use resources::{
    AddressMode, BufferContents, BufferDescriptor, BufferUsage, CompareFunction, FilterMode,
    FrequencyHint, SamplerDescriptor, TextureDescriptor, TextureDimension, TextureUsage,
};
#[cfg(target_arch = "wasm32")]
pub use swap_chain::CanvasSurface;
pub use swap_chain::{
    BACKENDS_ENV, BackendKind, HeadlessSurface, LeakPolicy, PowerPreference, Surface, SwapChain,
    SwapChainConfig, create_swap_chain,
};
