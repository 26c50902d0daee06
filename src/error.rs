// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Error taxonomy for the device layer.
//!
//! Creation-time failures are returned synchronously from the call that caused them and never
//! leave a partial handle in the registry.  Context loss is expected and recoverable, so it is
//! reported both through [`crate::swap_chain::SwapChainConfig`] callbacks and as
//! [`Error::ContextLost`] from calls made while the context is gone.
//!
//! Misuse of the API that cannot be a runtime condition (touching a destroyed handle,
//! submitting a pass to a device that did not create it) panics instead.

use crate::handles::ResourceKind;
use crate::program::BindingSlot;
use crate::swap_chain::BackendKind;
use std::fmt::Display;

/// The error type for every fallible device operation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A native context could not be created for the attempted backend.
    ///
    /// This is fatal for that backend only; swap chain creation moves on to the next target.
    #[error("could not create a {backend} context: {reason}")]
    ContextCreation { backend: BackendKind, reason: String },
    /// Every backend in the target list failed.
    #[error("no backend could be initialized (tried {tried:?})")]
    NoBackendAvailable { tried: Vec<BackendKind> },
    /// The context was lost.  Every resource created before the loss is invalid.
    #[error("the device context was lost; resources must be recreated after restoration")]
    ContextLost,
    #[error(transparent)]
    ShaderCompile(#[from] ShaderCompileError),
    #[error(transparent)]
    ResourceMismatch(#[from] ResourceMismatchError),
    #[error(transparent)]
    ResourceBusy(#[from] ResourceBusyError),
    /// A descriptor violates its own constraints (zero size, bad stride, ...).
    #[error("invalid {what} descriptor: {reason}")]
    InvalidDescriptor { what: &'static str, reason: String },
    /// The active backend cannot provide the requested feature or format.
    #[error("{feature} is not supported by the {backend} backend")]
    Unsupported { backend: BackendKind, feature: String },
    /// A pass is already open on this device.
    #[error("a pass is already being recorded on this device")]
    PassInProgress,
    /// A recorded pass failed validation at submission.  Nothing was executed.
    #[error("pass command #{index} is invalid: {reason}")]
    InvalidPass { index: usize, reason: String },
    /// The backend failed to complete a readback.
    #[error("readback failed: {0}")]
    Readback(String),
    /// The backend reported an error it could not classify further.
    #[error("{backend} backend error: {message}")]
    Backend { backend: BackendKind, message: String },
}

impl Error {
    pub(crate) fn invalid_descriptor(what: &'static str, reason: impl Into<String>) -> Self {
        Error::InvalidDescriptor {
            what,
            reason: reason.into(),
        }
    }
    pub(crate) fn unsupported(backend: BackendKind, feature: impl Into<String>) -> Self {
        Error::Unsupported {
            backend,
            feature: feature.into(),
        }
    }
    pub(crate) fn invalid_pass(index: usize, reason: impl Into<String>) -> Self {
        Error::InvalidPass {
            index,
            reason: reason.into(),
        }
    }
}

/// Which program stage a diagnostic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Vertex,
    Fragment,
    Compute,
    /// Linking vertex and fragment stages together.
    Link,
}

impl Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::Vertex => write!(f, "vertex"),
            StageKind::Fragment => write!(f, "fragment"),
            StageKind::Compute => write!(f, "compute"),
            StageKind::Link => write!(f, "link"),
        }
    }
}

/// A shader failed to compile or link.  `diagnostics` is the backend compiler output verbatim.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{backend} {stage} shader failed to compile:\n{diagnostics}")]
pub struct ShaderCompileError {
    pub backend: BackendKind,
    pub stage: StageKind,
    pub diagnostics: String,
}

/// A binding or pipeline disagrees with the program's reflected signature.
#[derive(Debug, Clone, thiserror::Error)]
pub struct ResourceMismatchError {
    pub slot: Option<BindingSlot>,
    pub reason: String,
}

impl ResourceMismatchError {
    pub(crate) fn at(slot: BindingSlot, reason: impl Into<String>) -> Self {
        ResourceMismatchError {
            slot: Some(slot),
            reason: reason.into(),
        }
    }
    pub(crate) fn general(reason: impl Into<String>) -> Self {
        ResourceMismatchError {
            slot: None,
            reason: reason.into(),
        }
    }
}

impl Display for ResourceMismatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.slot {
            Some(slot) => write!(f, "resource mismatch at {slot}: {}", self.reason),
            None => write!(f, "resource mismatch: {}", self.reason),
        }
    }
}

/// A readback was requested on a resource that already has one in flight.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind} {label} already has a readback in flight")]
pub struct ResourceBusyError {
    pub kind: ResourceKind,
    pub label: String,
}

/// A resource that was still alive when [`crate::Device::check_for_leaks`] ran.
///
/// This is diagnostic only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakWarning {
    pub kind: ResourceKind,
    /// Name attached with [`crate::Device::set_resource_name`], if any.
    pub name: Option<String>,
    /// Debug rendering of the handle.
    pub handle: String,
}

impl Display for LeakWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "leaked {} {:?} ({})", self.kind, name, self.handle),
            None => write!(f, "leaked {} {}", self.kind, self.handle),
        }
    }
}
