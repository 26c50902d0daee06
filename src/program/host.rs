// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! CPU implementations of shader stages, run by the software backend.
//!
//! A host shader cannot be reflected, so it declares its interface (bindings, vertex inputs,
//! fragment outputs) when it is built.  The declared interface becomes the program's
//! [`super::BindingSignature`] exactly like a reflected one would.

use super::{BindingKind, BindingLayoutEntry, BindingSlot, FragmentOutput, ScalarClass, VertexInput};
use crate::error::StageKind;
use crate::format::TextureFormat;
use std::ops::Range;
use std::rc::Rc;

type ComputeFn = dyn Fn(&mut HostComputeContext<'_>);
type RasterFn = dyn Fn(&mut HostRasterContext<'_>);

#[derive(Clone)]
pub(crate) enum HostEntry {
    Compute(Rc<ComputeFn>),
    Vertex,
    Fragment(Rc<RasterFn>),
}

/// A shader stage implemented in Rust.
#[derive(Clone)]
pub struct HostShader {
    pub(crate) entry: HostEntry,
    pub(crate) bindings: Vec<BindingLayoutEntry>,
    pub(crate) vertex_inputs: Vec<VertexInput>,
    pub(crate) fragment_outputs: Vec<FragmentOutput>,
    pub(crate) workgroup_size: [u32; 3],
}

impl std::fmt::Debug for HostShader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostShader")
            .field("stage", &self.stage())
            .field("bindings", &self.bindings.len())
            .field("workgroup_size", &self.workgroup_size)
            .finish()
    }
}

impl HostShader {
    fn with_entry(entry: HostEntry) -> Self {
        HostShader {
            entry,
            bindings: Vec::new(),
            vertex_inputs: Vec::new(),
            fragment_outputs: Vec::new(),
            workgroup_size: [1, 1, 1],
        }
    }

    /// A compute stage.  `f` runs once per dispatch and walks
    /// [`HostComputeContext::invocations`] itself.
    pub fn compute(
        workgroup_size: [u32; 3],
        f: impl Fn(&mut HostComputeContext<'_>) + 'static,
    ) -> Self {
        let mut shader = HostShader::with_entry(HostEntry::Compute(Rc::new(f)));
        shader.workgroup_size = workgroup_size;
        shader
    }

    /// A vertex stage.  It only declares inputs; the fragment callback sees the raw vertex data.
    pub fn vertex() -> Self {
        HostShader::with_entry(HostEntry::Vertex)
    }

    /// A fragment stage.  `f` runs once per draw with the pass's color targets.
    pub fn fragment(f: impl Fn(&mut HostRasterContext<'_>) + 'static) -> Self {
        HostShader::with_entry(HostEntry::Fragment(Rc::new(f)))
    }

    pub fn binding(
        mut self,
        slot: BindingSlot,
        kind: BindingKind,
        min_size: u64,
        name: impl Into<String>,
    ) -> Self {
        self.bindings.push(BindingLayoutEntry {
            slot,
            kind,
            min_size,
            name: name.into(),
        });
        self
    }

    pub fn uniform(self, slot: BindingSlot, min_size: u64, name: impl Into<String>) -> Self {
        self.binding(slot, BindingKind::UniformBuffer, min_size, name)
    }

    pub fn storage(
        self,
        slot: BindingSlot,
        read_only: bool,
        min_size: u64,
        name: impl Into<String>,
    ) -> Self {
        self.binding(slot, BindingKind::StorageBuffer { read_only }, min_size, name)
    }

    pub fn input(
        mut self,
        location: u32,
        components: u32,
        class: ScalarClass,
        name: impl Into<String>,
    ) -> Self {
        self.vertex_inputs.push(VertexInput {
            location,
            components,
            class,
            name: name.into(),
        });
        self
    }

    pub fn output(mut self, location: u32, class: ScalarClass) -> Self {
        self.fragment_outputs.push(FragmentOutput { location, class });
        self
    }

    pub(crate) fn stage(&self) -> StageKind {
        match self.entry {
            HostEntry::Compute(_) => StageKind::Compute,
            HostEntry::Vertex => StageKind::Vertex,
            HostEntry::Fragment(_) => StageKind::Fragment,
        }
    }
}

/// A bound resource as the host shader sees it: a private copy of its bytes.
#[derive(Debug)]
pub(crate) struct HostResource {
    pub slot: BindingSlot,
    pub kind: BindingKind,
    pub bytes: Vec<u8>,
    pub texture: Option<(u32, u32, TextureFormat)>,
}

impl HostResource {
    pub(crate) fn writable(&self) -> bool {
        matches!(
            self.kind,
            BindingKind::StorageBuffer { read_only: false } | BindingKind::StorageTexture
        )
    }
}

#[derive(Debug, Default)]
pub(crate) struct HostResources {
    pub entries: Vec<HostResource>,
}

impl HostResources {
    fn get(&self, slot: BindingSlot) -> &HostResource {
        self.entries
            .iter()
            .find(|e| e.slot == slot)
            .unwrap_or_else(|| panic!("host shader read unbound slot {slot}"))
    }

    fn get_mut(&mut self, slot: BindingSlot) -> &mut HostResource {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.slot == slot)
            .unwrap_or_else(|| panic!("host shader wrote unbound slot {slot}"));
        assert!(entry.writable(), "host shader wrote read-only slot {slot}");
        entry
    }

    fn read<T: bytemuck::Pod>(&self, slot: BindingSlot) -> Vec<T> {
        bytemuck::pod_collect_to_vec(&self.get(slot).bytes)
    }

    fn write<T: bytemuck::Pod>(&mut self, slot: BindingSlot, first: usize, values: &[T]) {
        let bytes: &[u8] = bytemuck::cast_slice(values);
        let start = first * std::mem::size_of::<T>();
        let entry = self.get_mut(slot);
        entry.bytes[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

/// What a host compute stage sees during one dispatch.
pub struct HostComputeContext<'a> {
    pub(crate) workgroups: [u32; 3],
    pub(crate) workgroup_size: [u32; 3],
    pub(crate) resources: &'a mut HostResources,
}

impl HostComputeContext<'_> {
    pub fn workgroups(&self) -> [u32; 3] {
        self.workgroups
    }

    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    /// Every global invocation id of the dispatch, x fastest.
    pub fn invocations(&self) -> impl Iterator<Item = [u32; 3]> + 'static {
        let extent = [
            self.workgroups[0] * self.workgroup_size[0],
            self.workgroups[1] * self.workgroup_size[1],
            self.workgroups[2] * self.workgroup_size[2],
        ];
        (0..extent[2]).flat_map(move |z| {
            (0..extent[1]).flat_map(move |y| (0..extent[0]).map(move |x| [x, y, z]))
        })
    }

    /// A copy of the bound buffer's contents as `T`s.
    pub fn read<T: bytemuck::Pod>(&self, slot: BindingSlot) -> Vec<T> {
        self.resources.read(slot)
    }

    /// Overwrites `values.len()` elements starting at element `first`.
    ///
    /// # Panics
    /// If the slot is not a writable storage binding or the range is out of bounds.
    pub fn write<T: bytemuck::Pod>(&mut self, slot: BindingSlot, first: usize, values: &[T]) {
        self.resources.write(slot, first, values)
    }

    pub fn bytes(&self, slot: BindingSlot) -> &[u8] {
        &self.resources.get(slot).bytes
    }

    pub fn bytes_mut(&mut self, slot: BindingSlot) -> &mut [u8] {
        &mut self.resources.get_mut(slot).bytes
    }

    pub fn texture_size(&self, slot: BindingSlot) -> Option<(u32, u32)> {
        self.resources.get(slot).texture.map(|(w, h, _)| (w, h))
    }
}

/// One draw call as a host fragment stage sees it.
#[derive(Debug, Clone)]
pub(crate) struct HostDraw {
    pub vertices: Range<u32>,
    pub instances: Range<u32>,
    pub indices: Option<Vec<u32>>,
    pub vertex_buffers: Vec<Vec<u8>>,
    pub viewport: [f32; 4],
}

/// A color attachment during a host draw.
#[derive(Debug)]
pub struct HostTarget {
    pub(crate) width: u32,
    pub(crate) height: u32,
    pub(crate) format: TextureFormat,
    pub(crate) bytes: Vec<u8>,
}

impl HostTarget {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// Writes one texel.  Out of range coordinates are ignored.
    pub fn put_pixel(&mut self, x: u32, y: u32, rgba: [f64; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let texel = self.format.encode_color(rgba);
        let start = (y as usize * self.width as usize + x as usize) * texel.len();
        self.bytes[start..start + texel.len()].copy_from_slice(&texel);
    }
}

/// What a host fragment stage sees during one draw.
pub struct HostRasterContext<'a> {
    pub(crate) draw: &'a HostDraw,
    pub(crate) resources: &'a mut HostResources,
    pub(crate) targets: &'a mut [HostTarget],
}

impl HostRasterContext<'_> {
    pub fn vertices(&self) -> Range<u32> {
        self.draw.vertices.clone()
    }

    pub fn instances(&self) -> Range<u32> {
        self.draw.instances.clone()
    }

    /// Index data for indexed draws, already widened to `u32`.
    pub fn indices(&self) -> Option<&[u32]> {
        self.draw.indices.as_deref()
    }

    pub fn vertex_buffer(&self, index: usize) -> &[u8] {
        &self.draw.vertex_buffers[index]
    }

    /// `[x, y, width, height]`.
    pub fn viewport(&self) -> [f32; 4] {
        self.draw.viewport
    }

    pub fn read<T: bytemuck::Pod>(&self, slot: BindingSlot) -> Vec<T> {
        self.resources.read(slot)
    }

    pub fn target(&mut self, index: usize) -> &mut HostTarget {
        &mut self.targets[index]
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocations_cover_grid() {
        let mut resources = HostResources::default();
        let ctx = HostComputeContext {
            workgroups: [2, 1, 1],
            workgroup_size: [4, 2, 1],
            resources: &mut resources,
        };
        let ids: Vec<_> = ctx.invocations().collect();
        assert_eq!(ids.len(), 16);
        assert_eq!(ids[0], [0, 0, 0]);
        assert_eq!(ids[8], [0, 1, 0]);
        assert_eq!(*ids.last().unwrap(), [7, 1, 0]);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn read_only_slots_reject_writes() {
        let slot = BindingSlot::new(0, 0);
        let mut resources = HostResources {
            entries: vec![HostResource {
                slot,
                kind: BindingKind::StorageBuffer { read_only: true },
                bytes: vec![0; 8],
                texture: None,
            }],
        };
        let mut ctx = HostComputeContext {
            workgroups: [1, 1, 1],
            workgroup_size: [1, 1, 1],
            resources: &mut resources,
        };
        ctx.write(slot, 0, &[1.0f32]);
    }
}
