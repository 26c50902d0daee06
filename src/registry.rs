// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The resource registry.
//!
//! The registry is the device's single source of truth about which objects exist.  Backends
//! keep their native objects in maps keyed by the same [`ResourceKey`], but whether a handle
//! is valid is decided here, and only here:
//!
//! * a handle whose slot was destroyed is a programmer error and panics,
//! * a handle from an earlier context epoch reports [`Error::ContextLost`],
//! * a handle from a different device panics.
//!
//! The registry also carries the per-resource diagnostic name, the "readback in flight" flag
//! and the leak check.

use crate::bindings::BindingsInfo;
use crate::error::{Error, LeakWarning, ResourceBusyError};
use crate::handles::{
    BindingsHandle, BufferHandle, ComputePipelineHandle, DeviceId, InputLayoutHandle,
    ProgramHandle, RawHandle, RenderPipelineHandle, ResourceHandle, ResourceKey, ResourceKind,
    SamplerHandle, TextureHandle,
};
use crate::pipeline::{ComputePipelineInfo, InputLayoutDescriptor, RenderPipelineInfo};
use crate::program::ProgramInfo;
use crate::resources::{BufferInfo, SamplerDescriptor, TextureDescriptor};
use slotmap::SlotMap;
use std::cell::Cell;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub(crate) struct TextureInfo {
    pub desc: TextureDescriptor,
    /// Owned by the swap chain rather than the caller.
    pub onscreen: bool,
}

#[derive(Debug)]
pub(crate) enum Record {
    Buffer(BufferInfo),
    Texture(TextureInfo),
    Sampler(SamplerDescriptor),
    Program(ProgramInfo),
    InputLayout(InputLayoutDescriptor),
    RenderPipeline(RenderPipelineInfo),
    ComputePipeline(ComputePipelineInfo),
    Bindings(BindingsInfo),
}

impl Record {
    pub(crate) fn kind(&self) -> ResourceKind {
        match self {
            Record::Buffer(_) => ResourceKind::Buffer,
            Record::Texture(_) => ResourceKind::Texture,
            Record::Sampler(_) => ResourceKind::Sampler,
            Record::Program(_) => ResourceKind::Program,
            Record::InputLayout(_) => ResourceKind::InputLayout,
            Record::RenderPipeline(_) => ResourceKind::RenderPipeline,
            Record::ComputePipeline(_) => ResourceKind::ComputePipeline,
            Record::Bindings(_) => ResourceKind::Bindings,
        }
    }
}

#[derive(Debug)]
struct Entry {
    record: Record,
    name: Option<String>,
    in_flight: Rc<Cell<bool>>,
}

/// Clears a resource's in-flight flag when dropped.
///
/// Readback futures own one, so the flag is released when the future completes or is
/// abandoned, whichever comes first.
#[derive(Debug)]
pub(crate) struct InFlightGuard(Rc<Cell<bool>>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

#[derive(Debug)]
pub(crate) struct Registry {
    device: DeviceId,
    epoch: u32,
    entries: SlotMap<ResourceKey, Entry>,
}

macro_rules! typed_getter {
    ($fn_name:ident, $handle:ty, $variant:ident, $info:ty) => {
        pub(crate) fn $fn_name(&self, handle: $handle) -> Result<&$info, Error> {
            match &self.entry(handle.0, <$handle>::KIND)?.record {
                Record::$variant(info) => Ok(info),
                other => unreachable!("{:?} slot holds a {}", handle, other.kind()),
            }
        }
    };
}

impl Registry {
    pub(crate) fn new(device: DeviceId) -> Self {
        Registry {
            device,
            epoch: 0,
            entries: SlotMap::with_key(),
        }
    }

    pub(crate) fn device(&self) -> DeviceId {
        self.device
    }

    pub(crate) fn epoch(&self) -> u32 {
        self.epoch
    }

    pub(crate) fn insert(&mut self, record: Record) -> RawHandle {
        let key = self.entries.insert(Entry {
            record,
            name: None,
            in_flight: Rc::new(Cell::new(false)),
        });
        RawHandle {
            key,
            epoch: self.epoch,
            device: self.device,
        }
    }

    /// Undoes an [`Registry::insert`] whose backend creation failed.
    pub(crate) fn discard(&mut self, raw: RawHandle) {
        self.entries.remove(raw.key);
    }

    fn check(&self, raw: RawHandle, kind: ResourceKind) -> Result<(), Error> {
        assert_eq!(
            raw.device, self.device,
            "{kind} {raw:?} was created by a different device"
        );
        if raw.epoch != self.epoch {
            return Err(Error::ContextLost);
        }
        Ok(())
    }

    fn entry(&self, raw: RawHandle, kind: ResourceKind) -> Result<&Entry, Error> {
        self.check(raw, kind)?;
        match self.entries.get(raw.key) {
            Some(entry) => Ok(entry),
            None => panic!("use of destroyed {kind} {raw:?}"),
        }
    }

    fn entry_mut(&mut self, raw: RawHandle, kind: ResourceKind) -> Result<&mut Entry, Error> {
        self.check(raw, kind)?;
        match self.entries.get_mut(raw.key) {
            Some(entry) => Ok(entry),
            None => panic!("use of destroyed {kind} {raw:?}"),
        }
    }

    typed_getter!(buffer, BufferHandle, Buffer, BufferInfo);
    typed_getter!(texture, TextureHandle, Texture, TextureInfo);
    typed_getter!(sampler, SamplerHandle, Sampler, SamplerDescriptor);
    typed_getter!(program, ProgramHandle, Program, ProgramInfo);
    typed_getter!(input_layout, InputLayoutHandle, InputLayout, InputLayoutDescriptor);
    typed_getter!(
        render_pipeline,
        RenderPipelineHandle,
        RenderPipeline,
        RenderPipelineInfo
    );
    typed_getter!(
        compute_pipeline,
        ComputePipelineHandle,
        ComputePipeline,
        ComputePipelineInfo
    );
    typed_getter!(bindings, BindingsHandle, Bindings, BindingsInfo);

    /// Looks up a key captured earlier (by a bindings snapshot) without a handle.
    pub(crate) fn record(&self, key: ResourceKey) -> Option<&Record> {
        self.entries.get(key).map(|e| &e.record)
    }

    pub(crate) fn record_mut(&mut self, key: ResourceKey) -> Option<&mut Record> {
        self.entries.get_mut(key).map(|e| &mut e.record)
    }

    pub(crate) fn texture_mut(&mut self, handle: TextureHandle) -> Result<&mut TextureInfo, Error> {
        match &mut self.entry_mut(handle.0, ResourceKind::Texture)?.record {
            Record::Texture(info) => Ok(info),
            other => unreachable!("{handle:?} slot holds a {}", other.kind()),
        }
    }

    /// Retires the handle.  The slot's generation changes, so the handle never resolves again.
    pub(crate) fn remove(&mut self, handle: ResourceHandle) -> Result<Record, Error> {
        let raw = handle.raw();
        self.entry(raw, handle.kind())?;
        let entry = self
            .entries
            .remove(raw.key)
            .unwrap_or_else(|| unreachable!("entry checked above"));
        Ok(entry.record)
    }

    pub(crate) fn set_name(&mut self, handle: ResourceHandle, name: String) -> Result<(), Error> {
        self.entry_mut(handle.raw(), handle.kind())?.name = Some(name);
        Ok(())
    }

    pub(crate) fn name(&self, key: ResourceKey) -> Option<&str> {
        self.entries.get(key).and_then(|e| e.name.as_deref())
    }

    /// Marks `handle` as having a readback in flight.
    pub(crate) fn begin_readback(&self, handle: ResourceHandle) -> Result<InFlightGuard, Error> {
        let raw = handle.raw();
        let entry = self.entry(raw, handle.kind())?;
        if entry.in_flight.replace(true) {
            return Err(ResourceBusyError {
                kind: handle.kind(),
                label: match &entry.name {
                    Some(name) => format!("{name:?}"),
                    None => format!("{raw:?}"),
                },
            }
            .into());
        }
        Ok(InFlightGuard(entry.in_flight.clone()))
    }

    /// Live objects the caller created and has not destroyed.
    pub(crate) fn check_for_leaks(&self) -> Vec<LeakWarning> {
        self.entries
            .iter()
            .filter(|(_, e)| !matches!(&e.record, Record::Texture(t) if t.onscreen))
            .map(|(key, e)| {
                let kind = e.record.kind();
                let handle = ResourceHandle::from_raw(
                    kind,
                    RawHandle {
                        key,
                        epoch: self.epoch,
                        device: self.device,
                    },
                );
                LeakWarning {
                    kind,
                    name: e.name.clone(),
                    handle: format!("{handle:?}"),
                }
            })
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Forgets every object and starts a new epoch.  Existing handles report context loss.
    pub(crate) fn lose_context(&mut self) {
        self.entries.clear();
        self.epoch += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{BufferUsage, FrequencyHint};

    fn buffer_record() -> Record {
        Record::Buffer(BufferInfo {
            size: 16,
            usage: BufferUsage::STORAGE,
            hint: FrequencyHint::Static,
        })
    }

    #[test]
    fn leaks_until_destroyed() {
        let mut registry = Registry::new(DeviceId::next());
        let a = BufferHandle(registry.insert(buffer_record()));
        let b = BufferHandle(registry.insert(buffer_record()));
        registry.set_name(a.into(), "a".to_string()).unwrap();
        assert_eq!(registry.check_for_leaks().len(), 2);
        registry.remove(a.into()).unwrap();
        let leaks = registry.check_for_leaks();
        assert_eq!(leaks.len(), 1);
        assert_eq!(leaks[0].kind, ResourceKind::Buffer);
        registry.remove(b.into()).unwrap();
        assert!(registry.check_for_leaks().is_empty());
    }

    #[test]
    #[should_panic(expected = "use of destroyed buffer")]
    fn destroyed_handles_are_not_resurrected() {
        let mut registry = Registry::new(DeviceId::next());
        let a = BufferHandle(registry.insert(buffer_record()));
        registry.remove(a.into()).unwrap();
        // the slot is reused with a new generation
        let _b = registry.insert(buffer_record());
        let _ = registry.buffer(a);
    }

    #[test]
    fn old_epoch_reports_context_lost() {
        let mut registry = Registry::new(DeviceId::next());
        let a = BufferHandle(registry.insert(buffer_record()));
        registry.lose_context();
        assert!(matches!(registry.buffer(a), Err(Error::ContextLost)));
        assert!(registry.check_for_leaks().is_empty());
    }

    #[test]
    fn one_readback_in_flight() {
        let mut registry = Registry::new(DeviceId::next());
        let a = BufferHandle(registry.insert(buffer_record()));
        let guard = registry.begin_readback(a.into()).unwrap();
        assert!(matches!(
            registry.begin_readback(a.into()),
            Err(Error::ResourceBusy(_))
        ));
        drop(guard);
        assert!(registry.begin_readback(a.into()).is_ok());
    }
}
