// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Bindings: a validated mapping from a pipeline's binding slots to concrete resources.
//!
//! Validation happens once, in [`crate::Device::create_bindings`].  Every slot in the
//! pipeline's signature must be covered exactly once, by a resource of the right kind, usage
//! and size.  Any disagreement is a [`ResourceMismatchError`] at creation time, so a draw or
//! dispatch never silently skips a binding.

use crate::device::DeviceLimits;
use crate::error::{Error, ResourceMismatchError};
use crate::handles::{
    BufferHandle, ComputePipelineHandle, RenderPipelineHandle, ResourceKey, SamplerHandle,
    TextureHandle,
};
use crate::program::{BindingKind, BindingSignature, BindingSlot};
use crate::registry::Registry;
use crate::resources::{BufferUsage, TextureUsage};

/// A buffer (or a sub-range of one) bound to a uniform or storage slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBinding {
    pub slot: BindingSlot,
    pub buffer: BufferHandle,
    pub offset: u64,
    /// `None` binds from `offset` to the end of the buffer.
    pub size: Option<u64>,
}

/// A texture and/or sampler.  Which halves are required depends on the slot's kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerBinding {
    pub slot: BindingSlot,
    pub texture: Option<TextureHandle>,
    pub sampler: Option<SamplerHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageTextureBinding {
    pub slot: BindingSlot,
    pub texture: TextureHandle,
    pub mip_level: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingsPipeline {
    Render(RenderPipelineHandle),
    Compute(ComputePipelineHandle),
}

impl From<RenderPipelineHandle> for BindingsPipeline {
    fn from(value: RenderPipelineHandle) -> Self {
        BindingsPipeline::Render(value)
    }
}

impl From<ComputePipelineHandle> for BindingsPipeline {
    fn from(value: ComputePipelineHandle) -> Self {
        BindingsPipeline::Compute(value)
    }
}

#[derive(Debug, Clone)]
pub struct BindingsDescriptor {
    pub pipeline: BindingsPipeline,
    pub uniform_buffer_bindings: Vec<BufferBinding>,
    pub storage_buffer_bindings: Vec<BufferBinding>,
    pub sampler_bindings: Vec<SamplerBinding>,
    pub storage_texture_bindings: Vec<StorageTextureBinding>,
}

impl BindingsDescriptor {
    pub fn new(pipeline: impl Into<BindingsPipeline>) -> Self {
        BindingsDescriptor {
            pipeline: pipeline.into(),
            uniform_buffer_bindings: Vec::new(),
            storage_buffer_bindings: Vec::new(),
            sampler_bindings: Vec::new(),
            storage_texture_bindings: Vec::new(),
        }
    }

    pub fn uniform(self, slot: BindingSlot, buffer: BufferHandle) -> Self {
        self.uniform_range(slot, buffer, 0, None)
    }

    pub fn uniform_range(
        mut self,
        slot: BindingSlot,
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    ) -> Self {
        self.uniform_buffer_bindings.push(BufferBinding {
            slot,
            buffer,
            offset,
            size,
        });
        self
    }

    pub fn storage(self, slot: BindingSlot, buffer: BufferHandle) -> Self {
        self.storage_range(slot, buffer, 0, None)
    }

    pub fn storage_range(
        mut self,
        slot: BindingSlot,
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    ) -> Self {
        self.storage_buffer_bindings.push(BufferBinding {
            slot,
            buffer,
            offset,
            size,
        });
        self
    }

    pub fn texture(mut self, slot: BindingSlot, texture: TextureHandle) -> Self {
        self.sampler_bindings.push(SamplerBinding {
            slot,
            texture: Some(texture),
            sampler: None,
        });
        self
    }

    pub fn sampler(mut self, slot: BindingSlot, sampler: SamplerHandle) -> Self {
        self.sampler_bindings.push(SamplerBinding {
            slot,
            texture: None,
            sampler: Some(sampler),
        });
        self
    }

    /// For `sampler2D`-style slots.  Without a sampler, nearest/clamp is used.
    pub fn combined(
        mut self,
        slot: BindingSlot,
        texture: TextureHandle,
        sampler: Option<SamplerHandle>,
    ) -> Self {
        self.sampler_bindings.push(SamplerBinding {
            slot,
            texture: Some(texture),
            sampler,
        });
        self
    }

    pub fn storage_texture(mut self, slot: BindingSlot, texture: TextureHandle) -> Self {
        self.storage_texture_bindings.push(StorageTextureBinding {
            slot,
            texture,
            mip_level: 0,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipelineKey {
    Render(ResourceKey),
    Compute(ResourceKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BoundResource {
    Buffer {
        key: ResourceKey,
        offset: u64,
        size: u64,
    },
    Texture(ResourceKey),
    Sampler(ResourceKey),
    Combined {
        texture: ResourceKey,
        sampler: Option<ResourceKey>,
    },
    StorageTexture {
        key: ResourceKey,
        level: u32,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedBinding {
    pub slot: BindingSlot,
    pub kind: BindingKind,
    pub name: String,
    pub resource: BoundResource,
}

/// What the registry keeps about live bindings.
#[derive(Debug, Clone)]
pub(crate) struct BindingsInfo {
    pub pipeline: PipelineKey,
    pub signature: BindingSignature,
    pub entries: Vec<ResolvedBinding>,
}

impl BindingsInfo {
    pub(crate) fn sampled_textures(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.entries.iter().filter_map(|e| match e.resource {
            BoundResource::Texture(key) => Some(key),
            BoundResource::Combined { texture, .. } => Some(texture),
            _ => None,
        })
    }

    pub(crate) fn storage_textures(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.entries.iter().filter_map(|e| match e.resource {
            BoundResource::StorageTexture { key, .. } => Some(key),
            _ => None,
        })
    }

    /// Every object the snapshot refers to.
    pub(crate) fn referenced(&self) -> impl Iterator<Item = ResourceKey> + '_ {
        self.entries.iter().flat_map(|e| {
            let (a, b) = match e.resource {
                BoundResource::Buffer { key, .. } => (key, None),
                BoundResource::Texture(key) => (key, None),
                BoundResource::Sampler(key) => (key, None),
                BoundResource::Combined { texture, sampler } => (texture, sampler),
                BoundResource::StorageTexture { key, .. } => (key, None),
            };
            std::iter::once(a).chain(b)
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Provided {
    Uniform(BufferBinding),
    Storage(BufferBinding),
    Sampler(SamplerBinding),
    StorageTexture(StorageTextureBinding),
}

impl Provided {
    fn slot(&self) -> BindingSlot {
        match self {
            Provided::Uniform(b) | Provided::Storage(b) => b.slot,
            Provided::Sampler(b) => b.slot,
            Provided::StorageTexture(b) => b.slot,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Provided::Uniform(_) => "a uniform buffer",
            Provided::Storage(_) => "a storage buffer",
            Provided::Sampler(b) => match (b.texture, b.sampler) {
                (Some(_), Some(_)) => "a texture and sampler",
                (Some(_), None) => "a texture",
                (None, Some(_)) => "a sampler",
                (None, None) => "an empty sampler binding",
            },
            Provided::StorageTexture(_) => "a storage texture",
        }
    }
}

fn buffer_range(
    registry: &Registry,
    binding: &BufferBinding,
    required: BufferUsage,
    min_size: u64,
    alignment: u64,
    max_size: u64,
) -> Result<BoundResource, Error> {
    let slot = binding.slot;
    let info = registry.buffer(binding.buffer)?;
    if !info.usage.contains(required) {
        return Err(ResourceMismatchError::at(
            slot,
            format!("buffer usage {:?} lacks {required:?}", info.usage),
        )
        .into());
    }
    if alignment > 1 && binding.offset % alignment != 0 {
        return Err(ResourceMismatchError::at(
            slot,
            format!("offset {} is not aligned to {alignment}", binding.offset),
        )
        .into());
    }
    if binding.offset >= info.size {
        return Err(ResourceMismatchError::at(
            slot,
            format!("offset {} is past the {}-byte buffer", binding.offset, info.size),
        )
        .into());
    }
    let size = binding.size.unwrap_or(info.size - binding.offset);
    let end = binding.offset.checked_add(size);
    if size == 0 || end.is_none_or(|end| end > info.size) {
        return Err(ResourceMismatchError::at(
            slot,
            format!(
                "{size} bytes at offset {} do not fit the {}-byte buffer",
                binding.offset, info.size
            ),
        )
        .into());
    }
    if size < min_size {
        return Err(ResourceMismatchError::at(
            slot,
            format!("bound {size} bytes but the program reads {min_size}"),
        )
        .into());
    }
    if size > max_size {
        return Err(ResourceMismatchError::at(
            slot,
            format!("bound {size} bytes, more than the {max_size}-byte binding limit"),
        )
        .into());
    }
    Ok(BoundResource::Buffer {
        key: binding.buffer.key(),
        offset: binding.offset,
        size,
    })
}

fn sampled_texture(
    registry: &Registry,
    slot: BindingSlot,
    texture: TextureHandle,
) -> Result<ResourceKey, Error> {
    let info = registry.texture(texture)?;
    if !info.desc.usage.contains(TextureUsage::SAMPLED) {
        return Err(ResourceMismatchError::at(slot, "texture was not created SAMPLED").into());
    }
    Ok(texture.key())
}

/// Checks `desc` against `signature` and resolves every handle.
pub(crate) fn validate(
    desc: &BindingsDescriptor,
    signature: &BindingSignature,
    registry: &Registry,
    limits: &DeviceLimits,
) -> Result<Vec<ResolvedBinding>, Error> {
    let provided: Vec<Provided> = desc
        .uniform_buffer_bindings
        .iter()
        .map(|b| Provided::Uniform(*b))
        .chain(desc.storage_buffer_bindings.iter().map(|b| Provided::Storage(*b)))
        .chain(desc.sampler_bindings.iter().map(|b| Provided::Sampler(*b)))
        .chain(
            desc.storage_texture_bindings
                .iter()
                .map(|b| Provided::StorageTexture(*b)),
        )
        .collect();

    let mut resolved = Vec::with_capacity(provided.len());
    for (i, p) in provided.iter().enumerate() {
        let slot = p.slot();
        if provided[..i].iter().any(|q| q.slot() == slot) {
            return Err(ResourceMismatchError::at(slot, "slot is bound more than once").into());
        }
        let Some(entry) = signature.get(slot) else {
            return Err(ResourceMismatchError::at(
                slot,
                format!("the program has no binding here, got {}", p.describe()),
            )
            .into());
        };
        let wrong_kind = || -> Error {
            ResourceMismatchError::at(
                slot,
                format!("`{}` expects a {}, got {}", entry.name, entry.kind, p.describe()),
            )
            .into()
        };
        let resource = match (entry.kind, p) {
            (BindingKind::UniformBuffer, Provided::Uniform(b)) => buffer_range(
                registry,
                b,
                BufferUsage::UNIFORM,
                entry.min_size,
                limits.min_uniform_buffer_offset_alignment,
                limits.max_uniform_buffer_binding_size,
            )?,
            (BindingKind::StorageBuffer { .. }, Provided::Storage(b)) => buffer_range(
                registry,
                b,
                BufferUsage::STORAGE,
                entry.min_size,
                limits.min_storage_buffer_offset_alignment,
                limits.max_storage_buffer_binding_size,
            )?,
            (
                BindingKind::Texture,
                Provided::Sampler(SamplerBinding {
                    texture: Some(texture),
                    sampler: None,
                    ..
                }),
            ) => BoundResource::Texture(sampled_texture(registry, slot, *texture)?),
            (
                BindingKind::Sampler,
                Provided::Sampler(SamplerBinding {
                    texture: None,
                    sampler: Some(sampler),
                    ..
                }),
            ) => {
                registry.sampler(*sampler)?;
                BoundResource::Sampler(sampler.key())
            }
            (
                BindingKind::CombinedTextureSampler,
                Provided::Sampler(SamplerBinding {
                    texture: Some(texture),
                    sampler,
                    ..
                }),
            ) => {
                let texture = sampled_texture(registry, slot, *texture)?;
                let sampler = match sampler {
                    Some(s) => {
                        registry.sampler(*s)?;
                        Some(s.key())
                    }
                    None => None,
                };
                BoundResource::Combined { texture, sampler }
            }
            (BindingKind::StorageTexture, Provided::StorageTexture(b)) => {
                let info = registry.texture(b.texture)?;
                if !info.desc.usage.contains(TextureUsage::STORAGE) {
                    return Err(
                        ResourceMismatchError::at(slot, "texture was not created STORAGE").into(),
                    );
                }
                if b.mip_level >= info.desc.mip_levels {
                    return Err(ResourceMismatchError::at(
                        slot,
                        format!("mip level {} does not exist", b.mip_level),
                    )
                    .into());
                }
                BoundResource::StorageTexture {
                    key: b.texture.key(),
                    level: b.mip_level,
                }
            }
            _ => return Err(wrong_kind()),
        };
        resolved.push(ResolvedBinding {
            slot,
            kind: entry.kind,
            name: entry.name.clone(),
            resource,
        });
    }

    for entry in signature.entries() {
        if !resolved.iter().any(|r| r.slot == entry.slot) {
            return Err(ResourceMismatchError::at(
                entry.slot,
                format!("no resource bound for {} `{}`", entry.kind, entry.name),
            )
            .into());
        }
    }
    resolved.sort_by_key(|r| r.slot);
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handles::DeviceId;
    use crate::pipeline::ComputePipelineInfo;
    use crate::program::BindingLayoutEntry;
    use crate::registry::Record;
    use crate::resources::{BufferInfo, FrequencyHint};

    const LIMITS: DeviceLimits = DeviceLimits {
        max_texture_dimension_2d: 4096,
        max_bind_groups: 4,
        max_uniform_buffer_binding_size: 1 << 16,
        max_storage_buffer_binding_size: 1 << 27,
        min_uniform_buffer_offset_alignment: 256,
        min_storage_buffer_offset_alignment: 256,
        max_color_attachments: 8,
        max_vertex_attributes: 16,
        max_compute_workgroup_size: [256, 256, 64],
        max_compute_workgroups_per_dimension: 65535,
        max_samples: 4,
    };

    fn signature() -> BindingSignature {
        BindingSignature::new(vec![
            BindingLayoutEntry {
                slot: BindingSlot::new(0, 1),
                kind: BindingKind::StorageBuffer { read_only: false },
                min_size: 64,
                name: "values".to_string(),
            },
            BindingLayoutEntry {
                slot: BindingSlot::new(0, 0),
                kind: BindingKind::UniformBuffer,
                min_size: 16,
                name: "params".to_string(),
            },
        ])
        .unwrap()
    }

    struct Fixture {
        registry: Registry,
        pipeline: ComputePipelineHandle,
        uniform: BufferHandle,
        storage: BufferHandle,
    }

    fn buffer(registry: &mut Registry, size: u64, usage: BufferUsage) -> BufferHandle {
        BufferHandle(registry.insert(Record::Buffer(BufferInfo {
            size,
            usage,
            hint: FrequencyHint::Static,
        })))
    }

    fn fixture() -> Fixture {
        let mut registry = Registry::new(DeviceId::next());
        let uniform = buffer(&mut registry, 16, BufferUsage::UNIFORM);
        let storage = buffer(&mut registry, 512, BufferUsage::STORAGE);
        // validation never looks at the pipeline's program
        let pipeline = ComputePipelineHandle(registry.insert(Record::ComputePipeline(
            ComputePipelineInfo {
                program: uniform.key(),
                signature: signature(),
                workgroup_size: [64, 1, 1],
            },
        )));
        Fixture {
            registry,
            pipeline,
            uniform,
            storage,
        }
    }

    fn mismatch_slot(result: Result<Vec<ResolvedBinding>, Error>) -> Option<BindingSlot> {
        match result {
            Err(Error::ResourceMismatch(e)) => e.slot,
            other => panic!("expected a mismatch, got {other:?}"),
        }
    }

    #[test]
    fn complete_bindings_resolve_in_slot_order() {
        let f = fixture();
        let desc = BindingsDescriptor::new(f.pipeline)
            .storage(BindingSlot::new(0, 1), f.storage)
            .uniform(BindingSlot::new(0, 0), f.uniform);
        let resolved = validate(&desc, &signature(), &f.registry, &LIMITS).unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].slot, BindingSlot::new(0, 0));
        assert_eq!(resolved[1].name, "values");
        assert_eq!(
            resolved[1].resource,
            BoundResource::Buffer {
                key: f.storage.key(),
                offset: 0,
                size: 512
            }
        );
    }

    #[test]
    fn missing_slot_is_named() {
        let f = fixture();
        let desc = BindingsDescriptor::new(f.pipeline).uniform(BindingSlot::new(0, 0), f.uniform);
        let slot = mismatch_slot(validate(&desc, &signature(), &f.registry, &LIMITS));
        assert_eq!(slot, Some(BindingSlot::new(0, 1)));
    }

    #[test]
    fn usage_must_fit_the_kind() {
        let f = fixture();
        // a storage-only buffer in a uniform slot
        let desc = BindingsDescriptor::new(f.pipeline)
            .uniform(BindingSlot::new(0, 0), f.storage)
            .storage(BindingSlot::new(0, 1), f.storage);
        let slot = mismatch_slot(validate(&desc, &signature(), &f.registry, &LIMITS));
        assert_eq!(slot, Some(BindingSlot::new(0, 0)));
    }

    #[test]
    fn ranges_are_checked() {
        let f = fixture();
        let too_small = BindingsDescriptor::new(f.pipeline)
            .uniform(BindingSlot::new(0, 0), f.uniform)
            .storage_range(BindingSlot::new(0, 1), f.storage, 0, Some(32));
        assert_eq!(
            mismatch_slot(validate(&too_small, &signature(), &f.registry, &LIMITS)),
            Some(BindingSlot::new(0, 1))
        );
        let misaligned = BindingsDescriptor::new(f.pipeline)
            .uniform(BindingSlot::new(0, 0), f.uniform)
            .storage_range(BindingSlot::new(0, 1), f.storage, 4, Some(64));
        assert_eq!(
            mismatch_slot(validate(&misaligned, &signature(), &f.registry, &LIMITS)),
            Some(BindingSlot::new(0, 1))
        );
    }

    #[test]
    fn slots_bind_once() {
        let f = fixture();
        let desc = BindingsDescriptor::new(f.pipeline)
            .uniform(BindingSlot::new(0, 0), f.uniform)
            .uniform(BindingSlot::new(0, 0), f.uniform)
            .storage(BindingSlot::new(0, 1), f.storage);
        let slot = mismatch_slot(validate(&desc, &signature(), &f.registry, &LIMITS));
        assert_eq!(slot, Some(BindingSlot::new(0, 0)));
    }
}
