// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Pass encoders.
//!
//! A pass is a single-use command recorder.  Its life is:
//!
//! ```text
//! Device::create_*_pass ──► Recording ──► Device::submit_pass ──► Submitted (consumed)
//! ```
//!
//! Recording never touches the backend; it only appends to a command list.  Submission
//! validates the whole list and then hands it to the backend in one go, so a pass either runs
//! completely or not at all.  Whether the backend executes immediately (WebGL) or defers to a
//! queue (WebGPU) is not observable; submission order is the only ordering guarantee.
//!
//! At most one pass may be recording per device.  Dropping a pass without submitting it
//! abandons it and lets the next pass open.

mod compute;
mod render;

pub use compute::ComputePass;
pub(crate) use compute::{ComputeCommand, ResolvedComputePass};
pub use render::{
    ColorAttachment, DepthStencilAttachment, IndexBufferBinding, RenderPass,
    RenderPassDescriptor, VertexBufferBinding, Viewport,
};
pub(crate) use render::{
    RenderCommand, ResolvedAttachment, ResolvedDepthStencil, ResolvedRenderPass,
    resolve_attachments,
};

use crate::error::Error;
use crate::handles::DeviceId;
use std::cell::Cell;
use std::rc::Rc;

/// Either kind of pass, for [`crate::Device::submit_pass`].
#[derive(Debug)]
pub enum Pass {
    Render(RenderPass),
    Compute(ComputePass),
}

impl From<RenderPass> for Pass {
    fn from(value: RenderPass) -> Self {
        Pass::Render(value)
    }
}

impl From<ComputePass> for Pass {
    fn from(value: ComputePass) -> Self {
        Pass::Compute(value)
    }
}

#[derive(Debug, Default)]
struct CursorState {
    open: Cell<Option<u64>>,
    next: Cell<u64>,
}

/// The device's "a pass is recording" flag.
#[derive(Debug, Clone, Default)]
pub(crate) struct PassCursor(Rc<CursorState>);

impl PassCursor {
    pub(crate) fn open(&self, device: DeviceId) -> Result<PassToken, Error> {
        if self.0.open.get().is_some() {
            return Err(Error::PassInProgress);
        }
        let id = self.0.next.get();
        self.0.next.set(id + 1);
        self.0.open.set(Some(id));
        Ok(PassToken {
            cursor: self.0.clone(),
            id,
            device,
        })
    }

    pub(crate) fn is_open(&self) -> bool {
        self.0.open.get().is_some()
    }
}

/// Held by a recording pass.  Releases the cursor on drop.
#[derive(Debug)]
pub(crate) struct PassToken {
    cursor: Rc<CursorState>,
    id: u64,
    pub(crate) device: DeviceId,
}

impl Drop for PassToken {
    fn drop(&mut self) {
        if self.cursor.open.get() == Some(self.id) {
            self.cursor.open.set(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_is_exclusive() {
        let cursor = PassCursor::default();
        let device = DeviceId::next();
        let first = cursor.open(device).unwrap();
        assert!(matches!(cursor.open(device), Err(Error::PassInProgress)));
        drop(first);
        assert!(!cursor.is_open());
        let _second = cursor.open(device).unwrap();
        assert!(cursor.is_open());
    }
}
