// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
A narrow façade over one compute pipeline and its bindings.

Algorithm code sets resources by slot and dispatches grids; the kernel recreates its bindings
object when a slot changed since the last dispatch, records one compute pass and submits it.

The grid is never resized for you.  Use [`dispatch_grid`] to cover an element count:

```
# use passes_and_kernels::dispatch_grid;
assert_eq!(dispatch_grid(1024, 256), 4);
assert_eq!(dispatch_grid(1025, 256), 5);
```
*/

use crate::device::Device;
use crate::error::{Error, ResourceMismatchError};
use crate::handles::{
    BindingsHandle, BufferHandle, ComputePipelineHandle, ProgramHandle, SamplerHandle,
    TextureHandle,
};
use crate::bindings::BindingsDescriptor;
use crate::pipeline::ComputePipelineDescriptor;
use crate::program::{BindingKind, BindingSignature, BindingSlot, ProgramDescriptor};
use std::collections::BTreeMap;

/// Number of workgroups needed to cover `element_count` elements.
///
/// # Panics
/// If `workgroup_size` is zero.
pub fn dispatch_grid(element_count: u32, workgroup_size: u32) -> u32 {
    element_count.div_ceil(workgroup_size)
}

/// What can be attached to a kernel slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelResource {
    Buffer(BufferHandle),
    BufferRange {
        buffer: BufferHandle,
        offset: u64,
        size: Option<u64>,
    },
    Texture(TextureHandle),
    Sampler(SamplerHandle),
    Combined(TextureHandle, Option<SamplerHandle>),
    StorageTexture(TextureHandle),
}

impl From<BufferHandle> for KernelResource {
    fn from(value: BufferHandle) -> Self {
        KernelResource::Buffer(value)
    }
}

impl From<TextureHandle> for KernelResource {
    fn from(value: TextureHandle) -> Self {
        KernelResource::Texture(value)
    }
}

impl From<SamplerHandle> for KernelResource {
    fn from(value: SamplerHandle) -> Self {
        KernelResource::Sampler(value)
    }
}

impl KernelResource {
    fn fits(&self, kind: BindingKind) -> bool {
        match self {
            KernelResource::Buffer(_) | KernelResource::BufferRange { .. } => kind.is_buffer(),
            KernelResource::Texture(_) => kind == BindingKind::Texture,
            KernelResource::Sampler(_) => kind == BindingKind::Sampler,
            KernelResource::Combined(..) => kind == BindingKind::CombinedTextureSampler,
            KernelResource::StorageTexture(_) => kind == BindingKind::StorageTexture,
        }
    }
}

#[derive(Debug)]
pub struct Kernel {
    pipeline: ComputePipelineHandle,
    /// Set when the kernel compiled the program itself and must destroy it.
    owned_program: Option<ProgramHandle>,
    signature: BindingSignature,
    workgroup_size: [u32; 3],
    resources: BTreeMap<BindingSlot, KernelResource>,
    bindings: Option<BindingsHandle>,
    dirty: bool,
}

impl Kernel {
    /// Builds a compute pipeline for `program`.  The caller keeps ownership of the program.
    pub fn new(device: &mut Device, program: ProgramHandle) -> Result<Self, Error> {
        let reflection = device.program_reflection(program)?;
        let signature = reflection.signature.clone();
        let workgroup_size = reflection.workgroup_size.unwrap_or([1, 1, 1]);
        let pipeline = device.create_compute_pipeline(&ComputePipelineDescriptor {
            program,
            input_layout: None,
        })?;
        Ok(Kernel {
            pipeline,
            owned_program: None,
            signature,
            workgroup_size,
            resources: BTreeMap::new(),
            bindings: None,
            dirty: true,
        })
    }

    /// Compiles `desc` and builds a kernel that owns the resulting program.
    pub fn compile(device: &mut Device, desc: &ProgramDescriptor) -> Result<Self, Error> {
        let program = device.create_program(desc)?;
        match Kernel::new(device, program) {
            Ok(mut kernel) => {
                kernel.owned_program = Some(program);
                Ok(kernel)
            }
            Err(e) => {
                // a context loss already dropped the program
                let _ = device.destroy(program);
                Err(e)
            }
        }
    }

    pub fn workgroup_size(&self) -> [u32; 3] {
        self.workgroup_size
    }

    pub fn signature(&self) -> &BindingSignature {
        &self.signature
    }

    /// Attaches `resource` to `slot` for subsequent dispatches.
    ///
    /// The slot and the resource's kind are checked now; usage and size are checked at the
    /// next dispatch, when the bindings are rebuilt.
    pub fn set_binding(
        &mut self,
        slot: BindingSlot,
        resource: impl Into<KernelResource>,
    ) -> Result<(), Error> {
        let resource = resource.into();
        let Some(entry) = self.signature.get(slot) else {
            return Err(ResourceMismatchError::at(slot, "the kernel has no such slot").into());
        };
        if !resource.fits(entry.kind) {
            return Err(ResourceMismatchError::at(
                slot,
                format!("a {} slot cannot hold {resource:?}", entry.kind),
            )
            .into());
        }
        if self.resources.insert(slot, resource) != Some(resource) {
            self.dirty = true;
        }
        Ok(())
    }

    fn descriptor(&self) -> BindingsDescriptor {
        let mut desc = BindingsDescriptor::new(self.pipeline);
        for (slot, resource) in &self.resources {
            let storage = self
                .signature
                .get(*slot)
                .is_some_and(|e| matches!(e.kind, BindingKind::StorageBuffer { .. }));
            desc = match *resource {
                KernelResource::Buffer(buffer) if storage => desc.storage(*slot, buffer),
                KernelResource::Buffer(buffer) => desc.uniform(*slot, buffer),
                KernelResource::BufferRange {
                    buffer,
                    offset,
                    size,
                } if storage => desc.storage_range(*slot, buffer, offset, size),
                KernelResource::BufferRange {
                    buffer,
                    offset,
                    size,
                } => desc.uniform_range(*slot, buffer, offset, size),
                KernelResource::Texture(texture) => desc.texture(*slot, texture),
                KernelResource::Sampler(sampler) => desc.sampler(*slot, sampler),
                KernelResource::Combined(texture, sampler) => {
                    desc.combined(*slot, texture, sampler)
                }
                KernelResource::StorageTexture(texture) => desc.storage_texture(*slot, texture),
            };
        }
        desc
    }

    fn refresh_bindings(&mut self, device: &mut Device) -> Result<(), Error> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(old) = self.bindings.take() {
            device.destroy(old)?;
        }
        if !self.signature.is_empty() {
            self.bindings = Some(device.create_bindings(&self.descriptor())?);
        }
        self.dirty = false;
        Ok(())
    }

    /// Records and submits one dispatch of `grid_x * grid_y` workgroups.
    pub fn dispatch(&mut self, device: &mut Device, grid_x: u32, grid_y: u32) -> Result<(), Error> {
        self.refresh_bindings(device)?;
        let mut pass = device.create_compute_pass()?;
        pass.set_pipeline(self.pipeline);
        if let Some(bindings) = self.bindings {
            pass.set_bindings(bindings);
        }
        pass.dispatch_workgroups(grid_x, grid_y, 1);
        device.submit_pass(pass)
    }

    /// Releases the pipeline, the bindings and an owned program.  Attached resources are
    /// left alone.  Every object is destroyed even if an earlier one fails; the first error
    /// is returned.
    pub fn destroy(self, device: &mut Device) -> Result<(), Error> {
        let bindings = self.bindings.map(|b| device.destroy(b)).unwrap_or(Ok(()));
        let pipeline = device.destroy(self.pipeline);
        let program = self.owned_program.map(|p| device.destroy(p)).unwrap_or(Ok(()));
        bindings.and(pipeline).and(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{HostShader, ShaderStage};
    use crate::resources::{BufferDescriptor, BufferUsage};
    use crate::swap_chain::{BackendKind, HeadlessSurface, SwapChainConfig, create_swap_chain};

    #[test]
    fn grid_rounds_up() {
        assert_eq!(dispatch_grid(1024, 256), 4);
        assert_eq!(dispatch_grid(1, 256), 1);
        assert_eq!(dispatch_grid(0, 64), 0);
        assert_eq!(dispatch_grid(257, 256), 2);
    }

    fn doubler() -> ProgramDescriptor {
        let slot = BindingSlot::new(0, 0);
        ProgramDescriptor::compute(ShaderStage::new().host(
            HostShader::compute([64, 1, 1], move |ctx| {
                let mut values: Vec<u32> = ctx.read(slot);
                let len = values.len();
                for [x, _, _] in ctx.invocations() {
                    if let Some(v) = values.get_mut(x as usize) {
                        *v *= 2;
                    }
                }
                ctx.write(slot, 0, &values[..len]);
            })
            .storage(slot, false, 4, "values"),
        ))
    }

    #[test_executors::async_test]
    async fn a_destroyed_program_stops_the_dispatch() {
        let surface = HeadlessSurface::new(4, 4);
        let config = SwapChainConfig::default().with_targets(vec![BackendKind::Software]);
        let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
        let device = swap_chain.get_device();
        let program = device.create_program(&doubler()).unwrap();
        let mut kernel = Kernel::new(device, program).unwrap();
        let buffer = device
            .create_buffer(&BufferDescriptor::with_data(
                bytemuck::cast_slice(&[1u32, 2, 3, 4]),
                BufferUsage::STORAGE | BufferUsage::COPY_SRC,
            ))
            .unwrap();
        kernel.set_binding(BindingSlot::new(0, 0), buffer).unwrap();
        device.destroy(program).unwrap();

        assert!(matches!(
            kernel.dispatch(device, 1, 1),
            Err(Error::InvalidPass { index: 0, .. })
        ));
        let out = device
            .create_readback()
            .read_buffer(device, buffer)
            .unwrap()
            .await
            .unwrap();
        assert_eq!(out.to_vec::<u32>(), vec![1, 2, 3, 4]);
        kernel.destroy(device).unwrap();
        device.destroy(buffer).unwrap();
        assert!(device.check_for_leaks().is_empty());
    }

    #[test_executors::async_test]
    async fn dispatch_rebinds_on_change() {
        let surface = HeadlessSurface::new(4, 4);
        let config = SwapChainConfig::default().with_targets(vec![BackendKind::Software]);
        let mut swap_chain = create_swap_chain(&surface, config).await.unwrap();
        let device = swap_chain.get_device();
        let mut kernel = Kernel::compile(device, &doubler()).unwrap();
        assert_eq!(kernel.workgroup_size(), [64, 1, 1]);

        let data: Vec<u32> = (0..100).collect();
        let usage = BufferUsage::STORAGE | BufferUsage::COPY_SRC;
        let a = device
            .create_buffer(&BufferDescriptor::with_data(bytemuck::cast_slice(&data), usage))
            .unwrap();
        let b = device
            .create_buffer(&BufferDescriptor::with_data(bytemuck::cast_slice(&data), usage))
            .unwrap();
        let slot = BindingSlot::new(0, 0);
        let grid = dispatch_grid(100, kernel.workgroup_size()[0]);

        kernel.set_binding(slot, a).unwrap();
        kernel.dispatch(device, grid, 1).unwrap();
        kernel.dispatch(device, grid, 1).unwrap();
        kernel.set_binding(slot, b).unwrap();
        kernel.dispatch(device, grid, 1).unwrap();

        let readback = device.create_readback();
        let a_out = readback.read_buffer(device, a).unwrap().await.unwrap();
        let b_out = readback.read_buffer(device, b).unwrap().await.unwrap();
        assert_eq!(a_out.to_vec::<u32>()[3], 12);
        assert_eq!(b_out.to_vec::<u32>()[3], 6);

        assert!(matches!(
            kernel.set_binding(BindingSlot::new(0, 7), a),
            Err(Error::ResourceMismatch(_))
        ));
        kernel.destroy(device).unwrap();
        device.destroy(a).unwrap();
        device.destroy(b).unwrap();
        assert!(device.check_for_leaks().is_empty());
    }
}
