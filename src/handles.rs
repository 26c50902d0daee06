// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Opaque handles to device-owned objects.
//!
//! Every object the [`crate::Device`] creates is referred to by a small `Copy` handle.  A handle
//! carries three things:
//!
//! * the registry slot (a generational key, so a reused slot never aliases an old handle),
//! * the context epoch it was created in, so handles from before a context loss are detected,
//! * the id of the device that created it.
//!
//! Handles do not own anything.  Dropping a handle leaks the object until
//! [`crate::Device::destroy`] is called, which is what [`crate::Device::check_for_leaks`] reports.

use std::fmt::{Debug, Display};
use std::sync::atomic::{AtomicU64, Ordering};

slotmap::new_key_type! {
    /// Registry slot shared by every object kind.
    pub(crate) struct ResourceKey;
}

/// Identifies one device.  Handles remember it so cross-device use is caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DeviceId(u64);

impl DeviceId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        DeviceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The kinds of objects tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Sampler,
    Program,
    InputLayout,
    RenderPipeline,
    ComputePipeline,
    Bindings,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceKind::Buffer => "buffer",
            ResourceKind::Texture => "texture",
            ResourceKind::Sampler => "sampler",
            ResourceKind::Program => "program",
            ResourceKind::InputLayout => "input layout",
            ResourceKind::RenderPipeline => "render pipeline",
            ResourceKind::ComputePipeline => "compute pipeline",
            ResourceKind::Bindings => "bindings",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RawHandle {
    pub(crate) key: ResourceKey,
    pub(crate) epoch: u32,
    pub(crate) device: DeviceId,
}

impl Debug for RawHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use slotmap::Key;
        write!(
            f,
            "{:?}@e{}/d{}",
            self.key.data(),
            self.epoch,
            self.device.0
        )
    }
}

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $kind:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(pub(crate) RawHandle);

        impl $name {
            pub(crate) const KIND: ResourceKind = ResourceKind::$kind;
            pub(crate) fn key(self) -> ResourceKey {
                self.0.key
            }
        }

        impl Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }

        impl From<$name> for ResourceHandle {
            fn from(value: $name) -> Self {
                ResourceHandle::$kind(value)
            }
        }
    };
}

handle_type!(
    /// A GPU buffer.
    BufferHandle,
    Buffer
);
handle_type!(
    /// A texture, including the swap chain's onscreen texture.
    TextureHandle,
    Texture
);
handle_type!(SamplerHandle, Sampler);
handle_type!(
    /// A compiled and linked program with its reflected binding signature.
    ProgramHandle,
    Program
);
handle_type!(InputLayoutHandle, InputLayout);
handle_type!(RenderPipelineHandle, RenderPipeline);
handle_type!(ComputePipelineHandle, ComputePipeline);
handle_type!(
    /// A validated slot to resource mapping for one pipeline.
    BindingsHandle,
    Bindings
);

/// Any handle, for the operations that accept every kind of object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceHandle {
    Buffer(BufferHandle),
    Texture(TextureHandle),
    Sampler(SamplerHandle),
    Program(ProgramHandle),
    InputLayout(InputLayoutHandle),
    RenderPipeline(RenderPipelineHandle),
    ComputePipeline(ComputePipelineHandle),
    Bindings(BindingsHandle),
}

impl ResourceHandle {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceHandle::Buffer(_) => ResourceKind::Buffer,
            ResourceHandle::Texture(_) => ResourceKind::Texture,
            ResourceHandle::Sampler(_) => ResourceKind::Sampler,
            ResourceHandle::Program(_) => ResourceKind::Program,
            ResourceHandle::InputLayout(_) => ResourceKind::InputLayout,
            ResourceHandle::RenderPipeline(_) => ResourceKind::RenderPipeline,
            ResourceHandle::ComputePipeline(_) => ResourceKind::ComputePipeline,
            ResourceHandle::Bindings(_) => ResourceKind::Bindings,
        }
    }

    pub(crate) fn raw(&self) -> RawHandle {
        match self {
            ResourceHandle::Buffer(h) => h.0,
            ResourceHandle::Texture(h) => h.0,
            ResourceHandle::Sampler(h) => h.0,
            ResourceHandle::Program(h) => h.0,
            ResourceHandle::InputLayout(h) => h.0,
            ResourceHandle::RenderPipeline(h) => h.0,
            ResourceHandle::ComputePipeline(h) => h.0,
            ResourceHandle::Bindings(h) => h.0,
        }
    }

    pub(crate) fn from_raw(kind: ResourceKind, raw: RawHandle) -> Self {
        match kind {
            ResourceKind::Buffer => ResourceHandle::Buffer(BufferHandle(raw)),
            ResourceKind::Texture => ResourceHandle::Texture(TextureHandle(raw)),
            ResourceKind::Sampler => ResourceHandle::Sampler(SamplerHandle(raw)),
            ResourceKind::Program => ResourceHandle::Program(ProgramHandle(raw)),
            ResourceKind::InputLayout => ResourceHandle::InputLayout(InputLayoutHandle(raw)),
            ResourceKind::RenderPipeline => {
                ResourceHandle::RenderPipeline(RenderPipelineHandle(raw))
            }
            ResourceKind::ComputePipeline => {
                ResourceHandle::ComputePipeline(ComputePipelineHandle(raw))
            }
            ResourceKind::Bindings => ResourceHandle::Bindings(BindingsHandle(raw)),
        }
    }
}
