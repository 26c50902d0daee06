// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
use super::PassToken;
use crate::bindings::PipelineKey;
use crate::device::DeviceLimits;
use crate::error::Error;
use crate::handles::{BindingsHandle, ComputePipelineHandle, ResourceKey};
use crate::pipeline::ComputePipelineInfo;
use crate::registry::Registry;

#[derive(Debug, Clone)]
enum Recorded {
    SetPipeline(ComputePipelineHandle),
    SetBindings(BindingsHandle),
    Dispatch([u32; 3]),
}

/// Records dispatches.
#[derive(Debug)]
pub struct ComputePass {
    commands: Vec<Recorded>,
    pub(crate) token: PassToken,
}

#[derive(Debug, Clone)]
pub(crate) enum ComputeCommand {
    SetPipeline(ResourceKey),
    SetBindings(ResourceKey),
    Dispatch([u32; 3]),
}

#[derive(Debug, Clone)]
pub(crate) struct ResolvedComputePass {
    pub commands: Vec<ComputeCommand>,
}

impl ComputePass {
    pub(crate) fn new(token: PassToken) -> Self {
        ComputePass {
            commands: Vec::new(),
            token,
        }
    }

    pub fn set_pipeline(&mut self, pipeline: ComputePipelineHandle) {
        self.commands.push(Recorded::SetPipeline(pipeline));
    }

    pub fn set_bindings(&mut self, bindings: BindingsHandle) {
        self.commands.push(Recorded::SetBindings(bindings));
    }

    /// Launches `x * y * z` workgroups.  The grid is not resized to fit any element count.
    pub fn dispatch_workgroups(&mut self, x: u32, y: u32, z: u32) {
        self.commands.push(Recorded::Dispatch([x, y, z]));
    }

    pub fn command_count(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn resolve(
        &self,
        registry: &Registry,
        limits: &DeviceLimits,
    ) -> Result<ResolvedComputePass, Error> {
        let mut pipeline: Option<&ComputePipelineInfo> = None;
        let mut bound = None;
        let mut sampled: Vec<ResourceKey> = Vec::new();
        let mut written: Vec<ResourceKey> = Vec::new();
        let mut commands = Vec::with_capacity(self.commands.len());

        for (index, command) in self.commands.iter().enumerate() {
            let out = match command {
                Recorded::SetPipeline(handle) => {
                    let info = registry.compute_pipeline(*handle)?;
                    if registry.record(info.program).is_none() {
                        return Err(Error::invalid_pass(
                            index,
                            "pipeline's program has been destroyed",
                        ));
                    }
                    pipeline = Some(info);
                    ComputeCommand::SetPipeline(handle.key())
                }
                Recorded::SetBindings(handle) => {
                    let info = registry.bindings(*handle)?;
                    if !matches!(info.pipeline, PipelineKey::Compute(_)) {
                        return Err(Error::invalid_pass(
                            index,
                            "bindings were created for a render pipeline",
                        ));
                    }
                    if info.referenced().any(|k| registry.record(k).is_none()) {
                        return Err(Error::invalid_pass(
                            index,
                            "bindings refer to a resource that has been destroyed",
                        ));
                    }
                    sampled.extend(info.sampled_textures());
                    written.extend(info.storage_textures());
                    if let Some(key) = sampled.iter().find(|k| written.contains(k)) {
                        let name = registry.name(*key).unwrap_or("texture");
                        return Err(Error::invalid_pass(
                            index,
                            format!("{name} is sampled and written as storage in one pass"),
                        ));
                    }
                    bound = Some(info);
                    ComputeCommand::SetBindings(handle.key())
                }
                Recorded::Dispatch(groups) => {
                    let Some(p) = pipeline else {
                        return Err(Error::invalid_pass(index, "dispatch before set_pipeline"));
                    };
                    if !p.signature.is_empty() {
                        match bound {
                            None => {
                                return Err(Error::invalid_pass(
                                    index,
                                    "dispatch before set_bindings",
                                ));
                            }
                            Some(b) if b.signature != p.signature => {
                                return Err(Error::invalid_pass(
                                    index,
                                    "bindings do not match the current pipeline's signature",
                                ));
                            }
                            Some(_) => {}
                        }
                    }
                    if groups
                        .iter()
                        .any(|g| *g > limits.max_compute_workgroups_per_dimension)
                    {
                        return Err(Error::invalid_pass(
                            index,
                            format!(
                                "dispatch {groups:?} exceeds {} workgroups per dimension",
                                limits.max_compute_workgroups_per_dimension
                            ),
                        ));
                    }
                    ComputeCommand::Dispatch(*groups)
                }
            };
            commands.push(out);
        }
        Ok(ResolvedComputePass { commands })
    }
}
