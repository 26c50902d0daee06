// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The WebGPU backend, over wgpu.

Every call encodes and submits immediately; wgpu's queue keeps submission order, which is the
only ordering the device promises.  Readbacks copy into a staging buffer and map it, with
[`poll::Poller`] driving the mapping callback on native targets.

The onscreen texture is an ordinary render target.  [`Backend::present`] copies it into the
surface's current frame, so passes never need to know which texture is presentable.

Device loss is reported once and is permanent: wgpu cannot restore a lost device, so a
swap chain on this backend stays [`ContextStatus::Lost`].
*/

mod convert;
mod poll;
mod reflect;

use super::{Backend, ContextStatus, ReadFuture};
use crate::bindings::{BindingsInfo, BoundResource, PipelineKey};
use crate::device::DeviceLimits;
use crate::error::{Error, ShaderCompileError, StageKind};
use crate::format::{IndexFormat, TextureFormat, VertexFormat};
use crate::handles::{ResourceKey, ResourceKind};
use crate::pass::{ComputeCommand, RenderCommand, ResolvedComputePass, ResolvedRenderPass};
use crate::pipeline::{ComputePipelineInfo, RenderPipelineInfo};
use crate::program::{
    BindingSignature, BindingSlot, ProgramDescriptor, ProgramReflection, ShaderSource,
};
use crate::resources::{BufferInfo, SamplerDescriptor, TextureDescriptor};
use crate::swap_chain::{BackendKind, PowerPreference, Surface, SwapChainConfig};
use poll::Poller;
use slotmap::SecondaryMap;
use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wgpu::util::DeviceExt;

const KIND: BackendKind = BackendKind::WebGPU;

fn missing(what: &str) -> Error {
    Error::Backend {
        backend: KIND,
        message: format!("no native {what} for key"),
    }
}

fn creation(reason: impl Into<String>) -> Error {
    Error::ContextCreation {
        backend: KIND,
        reason: reason.into(),
    }
}

#[derive(Debug)]
struct WgpuBuffer {
    buffer: wgpu::Buffer,
    /// Requested size.  The allocation is rounded up to a multiple of 4.
    size: u64,
}

#[derive(Debug)]
struct WgpuTexture {
    texture: wgpu::Texture,
    /// View of every level and layer, used for sampling.
    view: wgpu::TextureView,
    desc: TextureDescriptor,
}

impl WgpuTexture {
    fn new(device: &wgpu::Device, desc: &TextureDescriptor) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: None,
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.depth,
            },
            mip_level_count: desc.mip_levels,
            sample_count: desc.sample_count,
            dimension: wgpu::TextureDimension::D2,
            format: convert::texture_format(desc.format),
            usage: convert::texture_usage(desc),
            view_formats: &[],
        });
        let aspect = if desc.format.has_stencil() {
            wgpu::TextureAspect::DepthOnly
        } else {
            wgpu::TextureAspect::All
        };
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(convert::view_dimension(desc.dimension)),
            aspect,
            ..Default::default()
        });
        WgpuTexture {
            texture,
            view,
            desc: *desc,
        }
    }

    /// A single level and layer, as a render attachment or storage binding.
    fn subresource(&self, level: u32, layer: u32) -> wgpu::TextureView {
        self.texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(wgpu::TextureViewDimension::D2),
            base_mip_level: level,
            mip_level_count: Some(1),
            base_array_layer: layer,
            array_layer_count: Some(1),
            ..Default::default()
        })
    }
}

#[derive(Debug)]
struct CompiledStage {
    stage: StageKind,
    module: wgpu::ShaderModule,
    entry_point: String,
}

#[derive(Debug)]
struct WgpuProgram {
    stages: Vec<CompiledStage>,
    group_layouts: Vec<wgpu::BindGroupLayout>,
    layout: wgpu::PipelineLayout,
}

impl WgpuProgram {
    fn stage(&self, stage: StageKind) -> Option<&CompiledStage> {
        self.stages.iter().find(|s| s.stage == stage)
    }
}

#[derive(Debug)]
struct WgpuRenderPipeline {
    pipeline: wgpu::RenderPipeline,
    group_layouts: Vec<wgpu::BindGroupLayout>,
    index_format: Option<IndexFormat>,
    stencil_reference: u32,
}

#[derive(Debug)]
struct WgpuComputePipeline {
    pipeline: wgpu::ComputePipeline,
    group_layouts: Vec<wgpu::BindGroupLayout>,
}

#[derive(Debug)]
struct Presentation {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

pub(crate) struct WgpuBackend {
    // dropped before the device
    presentation: Option<Presentation>,
    poller: Poller,
    device: wgpu::Device,
    queue: wgpu::Queue,
    lost: Arc<AtomicBool>,
    limits: DeviceLimits,
    onscreen_format: TextureFormat,
    onscreen: Option<ResourceKey>,
    presented: u64,
    buffers: SecondaryMap<ResourceKey, WgpuBuffer>,
    textures: SecondaryMap<ResourceKey, WgpuTexture>,
    samplers: SecondaryMap<ResourceKey, wgpu::Sampler>,
    programs: SecondaryMap<ResourceKey, WgpuProgram>,
    render_pipelines: SecondaryMap<ResourceKey, WgpuRenderPipeline>,
    compute_pipelines: SecondaryMap<ResourceKey, WgpuComputePipeline>,
    bindings: SecondaryMap<ResourceKey, Vec<(u32, wgpu::BindGroup)>>,
    default_sampler: wgpu::Sampler,
}

impl std::fmt::Debug for WgpuBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgpuBackend")
            .field("onscreen_format", &self.onscreen_format)
            .field("presenting", &self.presentation.is_some())
            .field("lost", &self.lost.load(Ordering::Relaxed))
            .field("buffers", &self.buffers.len())
            .field("textures", &self.textures.len())
            .finish_non_exhaustive()
    }
}

fn device_limits(limits: &wgpu::Limits) -> DeviceLimits {
    DeviceLimits {
        max_texture_dimension_2d: limits.max_texture_dimension_2d,
        max_bind_groups: limits.max_bind_groups,
        max_uniform_buffer_binding_size: limits.max_uniform_buffer_binding_size as u64,
        max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size as u64,
        min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment as u64,
        min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment as u64,
        max_color_attachments: limits.max_color_attachments,
        max_vertex_attributes: limits.max_vertex_attributes,
        max_compute_workgroup_size: [
            limits.max_compute_workgroup_size_x,
            limits.max_compute_workgroup_size_y,
            limits.max_compute_workgroup_size_z,
        ],
        max_compute_workgroups_per_dimension: limits.max_compute_workgroups_per_dimension,
        // 1 and 4 are the only counts WebGPU guarantees
        max_samples: 4,
    }
}

impl WgpuBackend {
    /// Picks an adapter compatible with `surface` and opens a device on it.
    pub(crate) async fn new(
        surface: &dyn Surface,
        config: &SwapChainConfig,
    ) -> Result<Self, Error> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::from_env_or_default());
        let wgpu_surface = match surface.window_handles() {
            Some((raw_window_handle, raw_display_handle)) => {
                // SAFETY: the Surface contract keeps both handles valid for the swap chain's life
                let created = unsafe {
                    instance.create_surface_unsafe(wgpu::SurfaceTargetUnsafe::RawHandle {
                        raw_display_handle,
                        raw_window_handle,
                    })
                };
                Some(created.map_err(|e| creation(e.to_string()))?)
            }
            None => None,
        };
        let power_preference = match config.power_preference {
            PowerPreference::Default => wgpu::PowerPreference::default(),
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
        };
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference,
                force_fallback_adapter: false,
                compatible_surface: wgpu_surface.as_ref(),
            })
            .await
            .map_err(|e| creation(e.to_string()))?;
        let info = adapter.get_info();
        logwise::info_sync!(
            "wgpu adapter {name} on {backend}",
            name = logwise::privacy::LogIt(&info.name),
            backend = logwise::privacy::LogIt(&info.backend)
        );

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("passes_and_kernels device"),
                required_features: wgpu::Features::empty(),
                required_limits: adapter.limits(),
                memory_hints: Default::default(),
                trace: wgpu::Trace::Off,
            })
            .await
            .map_err(|e| creation(e.to_string()))?;

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = lost.clone();
        device.set_device_lost_callback(move |reason, message| {
            logwise::warn_sync!(
                "wgpu device lost ({reason}): {message}",
                reason = logwise::privacy::LogIt(&reason),
                message = logwise::privacy::LogIt(&message)
            );
            lost_flag.store(true, Ordering::Release);
        });
        device.on_uncaptured_error(Box::new(|e: wgpu::Error| {
            logwise::error_sync!("wgpu: {e}", e = logwise::privacy::LogIt(&e));
        }));

        let (width, height) = surface.size();
        let (presentation, onscreen_format) = match wgpu_surface {
            Some(wgpu_surface) => {
                let caps = wgpu_surface.get_capabilities(&adapter);
                if !caps.usages.contains(wgpu::TextureUsages::COPY_DST) {
                    return Err(creation("the surface cannot be a copy destination"));
                }
                let (native, format) = caps
                    .formats
                    .iter()
                    .filter_map(|f| convert::surface_format(*f).map(|ours| (*f, ours)))
                    .min_by_key(|(_, ours)| ours.is_srgb())
                    .ok_or_else(|| creation("the surface offers no supported format"))?;
                let config = wgpu::SurfaceConfiguration {
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_DST,
                    format: native,
                    width,
                    height,
                    present_mode: wgpu::PresentMode::AutoVsync,
                    desired_maximum_frame_latency: 2,
                    alpha_mode: caps
                        .alpha_modes
                        .first()
                        .copied()
                        .unwrap_or(wgpu::CompositeAlphaMode::Auto),
                    view_formats: Vec::new(),
                };
                wgpu_surface.configure(&device, &config);
                (
                    Some(Presentation {
                        surface: wgpu_surface,
                        config,
                    }),
                    format,
                )
            }
            None => (None, TextureFormat::Rgba8Unorm),
        };

        let poller = Poller::new(device.clone()).map_err(creation)?;
        let default_sampler = device.create_sampler(&convert::sampler(&SamplerDescriptor::default()));
        Ok(WgpuBackend {
            presentation,
            poller,
            limits: device_limits(&device.limits()),
            device,
            queue,
            lost,
            onscreen_format,
            onscreen: None,
            presented: 0,
            buffers: SecondaryMap::new(),
            textures: SecondaryMap::new(),
            samplers: SecondaryMap::new(),
            programs: SecondaryMap::new(),
            render_pipelines: SecondaryMap::new(),
            compute_pipelines: SecondaryMap::new(),
            bindings: SecondaryMap::new(),
            default_sampler,
        })
    }

    /// Format of the onscreen texture: whatever the surface prefers, or RGBA8 offscreen.
    pub(crate) fn onscreen_format(&self) -> TextureFormat {
        self.onscreen_format
    }

    /// Maps `staging` once the queue reaches it, then hands the mapped bytes to `finish`.
    fn map_read(
        &self,
        staging: wgpu::Buffer,
        finish: impl FnOnce(&[u8]) -> Vec<u8> + 'static,
    ) -> ReadFuture {
        let (s, r) = r#continue::continuation();
        staging.map_async(wgpu::MapMode::Read, .., move |result| {
            s.send(result);
        });
        self.poller.trigger();
        Box::pin(async move {
            let wait = logwise::perfwarn_begin!("wgpu readback");
            let result = r.await;
            drop(wait);
            result.map_err(|e| Error::Readback(e.to_string()))?;
            let bytes = {
                let view = staging.slice(..).get_mapped_range();
                finish(&view)
            };
            staging.unmap();
            Ok(bytes)
        })
    }

    fn staging(&self, size: u64) -> wgpu::Buffer {
        self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    fn encoder(&self, label: &str) -> wgpu::CommandEncoder {
        self.device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) })
    }

    fn bind_groups(&self, key: ResourceKey) -> Result<&[(u32, wgpu::BindGroup)], Error> {
        self.bindings
            .get(key)
            .map(Vec::as_slice)
            .ok_or_else(|| missing("bindings"))
    }
}

impl Backend for WgpuBackend {
    fn kind(&self) -> BackendKind {
        KIND
    }

    fn limits(&self) -> DeviceLimits {
        self.limits
    }

    fn supports_texture_format(&self, _format: TextureFormat) -> bool {
        true
    }

    fn supports_vertex_format(&self, _format: VertexFormat) -> bool {
        true
    }

    fn context_status(&mut self) -> ContextStatus {
        if self.lost.load(Ordering::Acquire) {
            ContextStatus::Lost
        } else {
            ContextStatus::Live
        }
    }

    fn reset(&mut self) {
        self.onscreen = None;
        self.bindings.clear();
        self.render_pipelines.clear();
        self.compute_pipelines.clear();
        self.programs.clear();
        self.samplers.clear();
        self.textures.clear();
        self.buffers.clear();
    }

    fn create_buffer(
        &mut self,
        key: ResourceKey,
        info: &BufferInfo,
        data: Option<&[u8]>,
    ) -> Result<(), Error> {
        let usage = convert::buffer_usage(info.usage);
        let buffer = match data {
            Some(contents) => self
                .device
                .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                    label: None,
                    contents,
                    usage,
                }),
            None => self.device.create_buffer(&wgpu::BufferDescriptor {
                label: None,
                size: info.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT),
                usage,
                mapped_at_creation: false,
            }),
        };
        self.buffers.insert(
            key,
            WgpuBuffer {
                buffer,
                size: info.size,
            },
        );
        Ok(())
    }

    fn write_buffer(&mut self, key: ResourceKey, offset: u64, data: &[u8]) -> Result<(), Error> {
        let b = self.buffers.get(key).ok_or_else(|| missing("buffer"))?;
        let len = data.len() as u64;
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(Error::unsupported(
                KIND,
                "buffer writes at offsets that are not a multiple of 4",
            ));
        }
        if len % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(&b.buffer, offset, data);
        } else if offset + len == b.size {
            // the tail lands in the allocation's padding, which nothing can observe
            let mut padded = data.to_vec();
            padded.resize(len.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT) as usize, 0);
            self.queue.write_buffer(&b.buffer, offset, &padded);
        } else {
            return Err(Error::unsupported(
                KIND,
                "buffer writes whose length is not a multiple of 4, except at the end",
            ));
        }
        Ok(())
    }

    fn create_texture(&mut self, key: ResourceKey, desc: &TextureDescriptor) -> Result<(), Error> {
        self.textures.insert(key, WgpuTexture::new(&self.device, desc));
        Ok(())
    }

    fn create_onscreen_texture(
        &mut self,
        key: ResourceKey,
        desc: &TextureDescriptor,
    ) -> Result<(), Error> {
        self.onscreen = Some(key);
        self.create_texture(key, desc)
    }

    fn write_texture(&mut self, key: ResourceKey, level: u32, data: &[u8]) -> Result<(), Error> {
        let t = self.textures.get(key).ok_or_else(|| missing("texture"))?;
        let (width, height) = t.desc.level_size(level);
        self.queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &t.texture,
                mip_level: level,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(width * t.desc.format.bytes_per_texel()),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: t.desc.depth,
            },
        );
        Ok(())
    }

    fn create_sampler(&mut self, key: ResourceKey, desc: &SamplerDescriptor) -> Result<(), Error> {
        let sampler = self.device.create_sampler(&convert::sampler(desc));
        self.samplers.insert(key, sampler);
        Ok(())
    }

    fn create_program(
        &mut self,
        key: ResourceKey,
        desc: &ProgramDescriptor,
    ) -> Result<ProgramReflection, Error> {
        let mut reflection = ProgramReflection::default();
        let mut entries = Vec::new();
        let mut layout_types: BTreeMap<BindingSlot, (wgpu::BindingType, wgpu::ShaderStages)> =
            BTreeMap::new();
        let mut stages = Vec::new();
        for (stage, source) in desc.resolve(KIND)? {
            let ShaderSource::Wgsl { code, entry_point } = source else {
                return Err(ShaderCompileError {
                    backend: KIND,
                    stage,
                    diagnostics: "WebGPU programs need WGSL sources".to_string(),
                }
                .into());
            };
            let reflected = reflect::reflect(stage, code, entry_point.as_deref())?;
            let visibility = reflect::shader_stages(stage);
            for b in reflected.bindings {
                layout_types
                    .entry(b.entry.slot)
                    .and_modify(|(_, v)| *v |= visibility)
                    .or_insert((b.ty, visibility));
                entries.push(b.entry);
            }
            match stage {
                StageKind::Vertex => reflection.vertex_inputs = reflected.vertex_inputs,
                StageKind::Fragment => reflection.fragment_outputs = reflected.fragment_outputs,
                StageKind::Compute => reflection.workgroup_size = Some(reflected.workgroup_size),
                StageKind::Link => {}
            }
            let label = format!("{stage} stage");
            let module = self
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(&label),
                    source: wgpu::ShaderSource::Wgsl(code.as_str().into()),
                });
            stages.push(CompiledStage {
                stage,
                module,
                entry_point: reflected.entry_point,
            });
        }
        let link_error = |diagnostics: String| ShaderCompileError {
            backend: KIND,
            stage: StageKind::Link,
            diagnostics,
        };
        reflection.signature = BindingSignature::new(entries).map_err(link_error)?;
        let groups = reflection.signature.group_count();
        if groups > self.limits.max_bind_groups {
            return Err(link_error(format!(
                "the program uses {groups} bind groups; the device allows {}",
                self.limits.max_bind_groups
            ))
            .into());
        }
        let group_layouts: Vec<wgpu::BindGroupLayout> = (0..groups)
            .map(|group| {
                let entries: Vec<wgpu::BindGroupLayoutEntry> = layout_types
                    .iter()
                    .filter(|(slot, _)| slot.group == group)
                    .map(|(slot, (ty, visibility))| wgpu::BindGroupLayoutEntry {
                        binding: slot.binding,
                        visibility: *visibility,
                        ty: *ty,
                        count: None,
                    })
                    .collect();
                self.device
                    .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                        label: None,
                        entries: &entries,
                    })
            })
            .collect();
        let layout_refs: Vec<&wgpu::BindGroupLayout> = group_layouts.iter().collect();
        let layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: None,
                bind_group_layouts: &layout_refs,
                push_constant_ranges: &[],
            });
        logwise::trace_sync!(
            "compiled a WGSL program with {count} bindings in {groups} groups",
            count = reflection.signature.len(),
            groups = groups
        );
        self.programs.insert(
            key,
            WgpuProgram {
                stages,
                group_layouts,
                layout,
            },
        );
        Ok(reflection)
    }

    fn create_render_pipeline(
        &mut self,
        key: ResourceKey,
        info: &RenderPipelineInfo,
    ) -> Result<(), Error> {
        let program = self
            .programs
            .get(info.program)
            .ok_or_else(|| missing("program"))?;
        let vertex = program
            .stage(StageKind::Vertex)
            .ok_or_else(|| missing("vertex stage"))?;
        let fragment = program
            .stage(StageKind::Fragment)
            .ok_or_else(|| missing("fragment stage"))?;
        let attributes: Vec<Vec<wgpu::VertexAttribute>> = info
            .input_layout
            .vertex_buffers
            .iter()
            .map(|layout| {
                layout
                    .attributes
                    .iter()
                    .map(|a| wgpu::VertexAttribute {
                        format: convert::vertex_format(a.format),
                        offset: a.offset,
                        shader_location: a.location,
                    })
                    .collect()
            })
            .collect();
        let buffers: Vec<wgpu::VertexBufferLayout> = info
            .input_layout
            .vertex_buffers
            .iter()
            .zip(&attributes)
            .map(|(layout, attributes)| wgpu::VertexBufferLayout {
                array_stride: layout.stride,
                step_mode: convert::step_mode(layout.step_mode),
                attributes,
            })
            .collect();
        let targets: Vec<Option<wgpu::ColorTargetState>> = info
            .color_formats
            .iter()
            .map(|f| Some(convert::color_target(*f, &info.mega_state)))
            .collect();
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: None,
                layout: Some(&program.layout),
                vertex: wgpu::VertexState {
                    module: &vertex.module,
                    entry_point: Some(&vertex.entry_point),
                    compilation_options: Default::default(),
                    buffers: &buffers,
                },
                primitive: convert::primitive(
                    info.topology,
                    info.input_layout.index_format,
                    &info.mega_state,
                ),
                depth_stencil: info
                    .depth_stencil_format
                    .map(|f| convert::depth_stencil(f, &info.mega_state)),
                multisample: wgpu::MultisampleState {
                    count: info.sample_count,
                    ..Default::default()
                },
                fragment: Some(wgpu::FragmentState {
                    module: &fragment.module,
                    entry_point: Some(&fragment.entry_point),
                    compilation_options: Default::default(),
                    targets: &targets,
                }),
                multiview: None,
                cache: None,
            });
        let pipeline = WgpuRenderPipeline {
            pipeline,
            group_layouts: program.group_layouts.clone(),
            index_format: info.input_layout.index_format,
            stencil_reference: info.mega_state.stencil.map_or(0, |s| s.reference),
        };
        self.render_pipelines.insert(key, pipeline);
        Ok(())
    }

    fn create_compute_pipeline(
        &mut self,
        key: ResourceKey,
        info: &ComputePipelineInfo,
    ) -> Result<(), Error> {
        let program = self
            .programs
            .get(info.program)
            .ok_or_else(|| missing("program"))?;
        let compute = program
            .stage(StageKind::Compute)
            .ok_or_else(|| missing("compute stage"))?;
        let pipeline = self
            .device
            .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: None,
                layout: Some(&program.layout),
                module: &compute.module,
                entry_point: Some(&compute.entry_point),
                compilation_options: Default::default(),
                cache: None,
            });
        let pipeline = WgpuComputePipeline {
            pipeline,
            group_layouts: program.group_layouts.clone(),
        };
        self.compute_pipelines.insert(key, pipeline);
        Ok(())
    }

    fn create_bindings(&mut self, key: ResourceKey, info: &BindingsInfo) -> Result<(), Error> {
        let group_layouts = match info.pipeline {
            PipelineKey::Render(k) => self.render_pipelines.get(k).map(|p| &p.group_layouts),
            PipelineKey::Compute(k) => self.compute_pipelines.get(k).map(|p| &p.group_layouts),
        }
        .ok_or_else(|| missing("pipeline"))?;

        // views must outlive the entries that borrow them
        let views = info
            .entries
            .iter()
            .map(|entry| -> Result<Option<wgpu::TextureView>, Error> {
                Ok(match entry.resource {
                    BoundResource::Texture(key) | BoundResource::Combined { texture: key, .. } => {
                        let t = self.textures.get(key).ok_or_else(|| missing("texture"))?;
                        Some(t.view.clone())
                    }
                    BoundResource::StorageTexture { key, level } => {
                        let t = self.textures.get(key).ok_or_else(|| missing("texture"))?;
                        Some(t.texture.create_view(&wgpu::TextureViewDescriptor {
                            dimension: Some(convert::view_dimension(t.desc.dimension)),
                            base_mip_level: level,
                            mip_level_count: Some(1),
                            ..Default::default()
                        }))
                    }
                    _ => None,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let mut groups = Vec::with_capacity(group_layouts.len());
        for (group, layout) in group_layouts.iter().enumerate() {
            let group = group as u32;
            let entries = info
                .entries
                .iter()
                .zip(&views)
                .filter(|(entry, _)| entry.slot.group == group)
                .map(|(entry, view)| -> Result<wgpu::BindGroupEntry, Error> {
                    let resource = match (entry.resource, view) {
                        (_, Some(view)) => wgpu::BindingResource::TextureView(view),
                        (BoundResource::Buffer { key, offset, size }, None) => {
                            let b = self.buffers.get(key).ok_or_else(|| missing("buffer"))?;
                            wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                                buffer: &b.buffer,
                                offset,
                                size: NonZeroU64::new(size),
                            })
                        }
                        (BoundResource::Sampler(key), None) => wgpu::BindingResource::Sampler(
                            self.samplers.get(key).ok_or_else(|| missing("sampler"))?,
                        ),
                        _ => wgpu::BindingResource::Sampler(&self.default_sampler),
                    };
                    Ok(wgpu::BindGroupEntry {
                        binding: entry.slot.binding,
                        resource,
                    })
                })
                .collect::<Result<Vec<_>, Error>>()?;
            let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: None,
                layout,
                entries: &entries,
            });
            groups.push((group, bind_group));
        }
        self.bindings.insert(key, groups);
        Ok(())
    }

    fn destroy(&mut self, key: ResourceKey, kind: ResourceKind) {
        match kind {
            ResourceKind::Buffer => {
                self.buffers.remove(key);
            }
            ResourceKind::Texture => {
                self.textures.remove(key);
            }
            ResourceKind::Sampler => {
                self.samplers.remove(key);
            }
            ResourceKind::Program => {
                self.programs.remove(key);
            }
            ResourceKind::InputLayout => {}
            ResourceKind::RenderPipeline => {
                self.render_pipelines.remove(key);
            }
            ResourceKind::ComputePipeline => {
                self.compute_pipelines.remove(key);
            }
            ResourceKind::Bindings => {
                self.bindings.remove(key);
            }
        }
    }

    fn submit_render_pass(&mut self, pass: &ResolvedRenderPass) -> Result<(), Error> {
        let views = pass
            .colors
            .iter()
            .map(|color| -> Result<(wgpu::TextureView, Option<wgpu::TextureView>), Error> {
                let t = self.textures.get(color.key).ok_or_else(|| missing("texture"))?;
                let resolve = match color.resolve_to {
                    Some((key, _)) => Some(
                        self.textures
                            .get(key)
                            .ok_or_else(|| missing("texture"))?
                            .subresource(0, 0),
                    ),
                    None => None,
                };
                Ok((t.subresource(color.level, color.layer), resolve))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = pass
            .colors
            .iter()
            .zip(&views)
            .map(|(color, (view, resolve))| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    depth_slice: None,
                    resolve_target: resolve.as_ref(),
                    ops: wgpu::Operations {
                        load: match color.clear {
                            Some([r, g, b, a]) => wgpu::LoadOp::Clear(wgpu::Color { r, g, b, a }),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let depth_view = match &pass.depth_stencil {
            Some(ds) => Some(
                self.textures
                    .get(ds.key)
                    .ok_or_else(|| missing("texture"))?
                    .subresource(0, 0),
            ),
            None => None,
        };
        let depth_stencil_attachment = pass.depth_stencil.as_ref().zip(depth_view.as_ref()).map(
            |(ds, view)| wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: ds.depth_clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: ds.desc.format.has_stencil().then(|| wgpu::Operations {
                    load: ds.stencil_clear.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                    store: wgpu::StoreOp::Store,
                }),
            },
        );

        let mut encoder = self.encoder("render pass");
        {
            let mut render = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: None,
                color_attachments: &color_attachments,
                depth_stencil_attachment,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            let mut index_format = None;
            let mut index_buffer = None;
            for command in &pass.commands {
                match command {
                    RenderCommand::SetPipeline(key) => {
                        let p = self
                            .render_pipelines
                            .get(*key)
                            .ok_or_else(|| missing("pipeline"))?;
                        render.set_pipeline(&p.pipeline);
                        render.set_stencil_reference(p.stencil_reference);
                        index_format = p.index_format;
                    }
                    RenderCommand::SetBindings(key) => {
                        for (group, bind_group) in self.bind_groups(*key)? {
                            render.set_bind_group(*group, bind_group, &[]);
                        }
                    }
                    RenderCommand::SetVertexInput {
                        vertex_buffers,
                        index_buffer: ib,
                    } => {
                        for (slot, (key, offset)) in vertex_buffers.iter().enumerate() {
                            let b = self.buffers.get(*key).ok_or_else(|| missing("buffer"))?;
                            render.set_vertex_buffer(slot as u32, b.buffer.slice(*offset..));
                        }
                        index_buffer = *ib;
                    }
                    RenderCommand::SetViewport(v) => {
                        render.set_viewport(v.x, v.y, v.width, v.height, v.min_depth, v.max_depth);
                    }
                    RenderCommand::Draw {
                        vertices,
                        instances,
                    } => render.draw(vertices.clone(), instances.clone()),
                    RenderCommand::DrawIndexed { indices, instances } => {
                        let (Some((key, offset)), Some(format)) = (index_buffer, index_format)
                        else {
                            return Err(missing("index buffer"));
                        };
                        let b = self.buffers.get(key).ok_or_else(|| missing("buffer"))?;
                        render.set_index_buffer(b.buffer.slice(offset..), convert::index_format(format));
                        render.draw_indexed(indices.clone(), 0, instances.clone());
                    }
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn submit_compute_pass(&mut self, pass: &ResolvedComputePass) -> Result<(), Error> {
        let mut encoder = self.encoder("compute pass");
        {
            let mut compute = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: None,
                timestamp_writes: None,
            });
            for command in &pass.commands {
                match command {
                    ComputeCommand::SetPipeline(key) => {
                        let p = self
                            .compute_pipelines
                            .get(*key)
                            .ok_or_else(|| missing("compute pipeline"))?;
                        compute.set_pipeline(&p.pipeline);
                    }
                    ComputeCommand::SetBindings(key) => {
                        for (group, bind_group) in self.bind_groups(*key)? {
                            compute.set_bind_group(*group, bind_group, &[]);
                        }
                    }
                    ComputeCommand::Dispatch([x, y, z]) => compute.dispatch_workgroups(*x, *y, *z),
                }
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_buffer(
        &mut self,
        key: ResourceKey,
        offset: u64,
        size: u64,
    ) -> Result<ReadFuture, Error> {
        let b = self.buffers.get(key).ok_or_else(|| missing("buffer"))?;
        // copies must start and end on 4-byte boundaries
        let start = offset - offset % wgpu::COPY_BUFFER_ALIGNMENT;
        let end = (offset + size).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        let staging = self.staging(end - start);
        let mut encoder = self.encoder("buffer readback");
        encoder.copy_buffer_to_buffer(&b.buffer, start, &staging, 0, end - start);
        self.queue.submit(Some(encoder.finish()));
        let skip = (offset - start) as usize;
        Ok(self.map_read(staging, move |bytes| {
            bytes[skip..skip + size as usize].to_vec()
        }))
    }

    fn read_texture(&mut self, key: ResourceKey, level: u32) -> Result<ReadFuture, Error> {
        let t = self.textures.get(key).ok_or_else(|| missing("texture"))?;
        let desc = t.desc;
        if !convert::copyable(&desc) {
            return Err(Error::unsupported(
                KIND,
                format!("reading back {} textures", desc.format),
            ));
        }
        let (width, height) = desc.level_size(level);
        let row = width * desc.format.bytes_per_texel();
        let padded_row = row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        let layers = desc.depth;
        let staging = self.staging(padded_row as u64 * height as u64 * layers as u64);
        let mut encoder = self.encoder("texture readback");
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &t.texture,
                mip_level: level,
                origin: wgpu::Origin3d::ZERO,
                aspect: if desc.format.is_depth() {
                    wgpu::TextureAspect::DepthOnly
                } else {
                    wgpu::TextureAspect::All
                },
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_row),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: layers,
            },
        );
        self.queue.submit(Some(encoder.finish()));
        let (row, padded_row) = (row as usize, padded_row as usize);
        Ok(self.map_read(staging, move |bytes| {
            let mut packed = Vec::with_capacity(row * height as usize * layers as usize);
            for padded in bytes.chunks_exact(padded_row) {
                packed.extend_from_slice(&padded[..row]);
            }
            packed
        }))
    }

    fn configure(&mut self, onscreen: ResourceKey, width: u32, height: u32) -> Result<(), Error> {
        let t = self
            .textures
            .get_mut(onscreen)
            .ok_or_else(|| missing("texture"))?;
        let mut desc = t.desc;
        desc.width = width;
        desc.height = height;
        *t = WgpuTexture::new(&self.device, &desc);
        if let Some(p) = &mut self.presentation {
            p.config.width = width;
            p.config.height = height;
            p.surface.configure(&self.device, &p.config);
        }
        Ok(())
    }

    fn present(&mut self) -> Result<(), Error> {
        let key = self.onscreen.ok_or_else(|| missing("onscreen texture"))?;
        let source = self.textures.get(key).ok_or_else(|| missing("texture"))?;
        self.presented += 1;
        let Some(p) = &self.presentation else {
            logwise::trace_sync!("offscreen present #{frame}", frame = self.presented);
            return Ok(());
        };
        let frame = match p.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(wgpu::SurfaceError::Outdated | wgpu::SurfaceError::Lost) => {
                logwise::warn_sync!("surface out of date; frame {frame} skipped", frame = self.presented);
                p.surface.configure(&self.device, &p.config);
                return Ok(());
            }
            Err(wgpu::SurfaceError::Timeout) => {
                logwise::warn_sync!("surface timed out; frame {frame} skipped", frame = self.presented);
                return Ok(());
            }
            Err(e) => {
                return Err(Error::Backend {
                    backend: KIND,
                    message: e.to_string(),
                });
            }
        };
        let mut encoder = self.encoder("present");
        encoder.copy_texture_to_texture(
            source.texture.as_image_copy(),
            frame.texture.as_image_copy(),
            wgpu::Extent3d {
                width: source.desc.width.min(p.config.width),
                height: source.desc.height.min(p.config.height),
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));
        frame.present();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bindings::ResolvedBinding;
    use crate::program::{BindingKind, ShaderStage};
    use crate::resources::{BufferUsage, FrequencyHint};
    use crate::swap_chain::HeadlessSurface;

    async fn backend() -> Option<WgpuBackend> {
        match WgpuBackend::new(&HeadlessSurface::new(8, 8), &SwapChainConfig::default()).await {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("skipping: no wgpu adapter ({e})");
                None
            }
        }
    }

    fn storage(size: u64) -> BufferInfo {
        BufferInfo {
            size,
            usage: BufferUsage::STORAGE,
            hint: FrequencyHint::Static,
        }
    }

    #[test_executors::async_test]
    async fn unaligned_readback_is_trimmed() {
        let Some(mut backend) = backend().await else {
            return;
        };
        let mut keys: slotmap::SlotMap<ResourceKey, ()> = slotmap::SlotMap::with_key();
        let key = keys.insert(());
        let data: Vec<u8> = (0..10).collect();
        backend.create_buffer(key, &storage(10), Some(&data)).unwrap();
        let bytes = backend.read_buffer(key, 3, 6).unwrap().await.unwrap();
        assert_eq!(bytes, vec![3, 4, 5, 6, 7, 8]);
        assert!(matches!(
            backend.write_buffer(key, 1, &[0; 4]),
            Err(Error::Unsupported { .. })
        ));
        backend.write_buffer(key, 8, &[42, 43]).unwrap();
        let tail = backend.read_buffer(key, 8, 2).unwrap().await.unwrap();
        assert_eq!(tail, vec![42, 43]);
    }

    #[test_executors::async_test]
    async fn dispatch_doubles_a_buffer() {
        let Some(mut backend) = backend().await else {
            return;
        };
        let mut keys: slotmap::SlotMap<ResourceKey, ()> = slotmap::SlotMap::with_key();
        let (buffer, program, pipeline, bindings) =
            (keys.insert(()), keys.insert(()), keys.insert(()), keys.insert(()));
        let values: Vec<f32> = (0..64).map(|i| i as f32).collect();
        backend
            .create_buffer(buffer, &storage(256), Some(bytemuck::cast_slice(&values)))
            .unwrap();
        let desc = ProgramDescriptor::compute(ShaderStage::new().wgsl(
            "@group(0) @binding(0) var<storage, read_write> v: array<f32>;
             @compute @workgroup_size(64)
             fn main(@builtin(global_invocation_id) id: vec3<u32>) { v[id.x] = v[id.x] * 2.0; }",
        ));
        let reflection = backend.create_program(program, &desc).unwrap();
        assert_eq!(reflection.workgroup_size, Some([64, 1, 1]));
        let signature = reflection.signature.clone();
        backend
            .create_compute_pipeline(
                pipeline,
                &ComputePipelineInfo {
                    program,
                    signature: signature.clone(),
                    workgroup_size: [64, 1, 1],
                },
            )
            .unwrap();
        backend
            .create_bindings(
                bindings,
                &BindingsInfo {
                    pipeline: PipelineKey::Compute(pipeline),
                    signature,
                    entries: vec![ResolvedBinding {
                        slot: BindingSlot::new(0, 0),
                        kind: BindingKind::StorageBuffer { read_only: false },
                        name: "v".to_string(),
                        resource: BoundResource::Buffer {
                            key: buffer,
                            offset: 0,
                            size: 256,
                        },
                    }],
                },
            )
            .unwrap();
        backend
            .submit_compute_pass(&ResolvedComputePass {
                commands: vec![
                    ComputeCommand::SetPipeline(pipeline),
                    ComputeCommand::SetBindings(bindings),
                    ComputeCommand::Dispatch([1, 1, 1]),
                ],
            })
            .unwrap();
        let bytes = backend.read_buffer(buffer, 0, 256).unwrap().await.unwrap();
        let doubled: Vec<f32> = bytemuck::pod_collect_to_vec(&bytes);
        assert_eq!(doubled[5], 10.0);
        assert_eq!(doubled[63], 126.0);
    }
}
