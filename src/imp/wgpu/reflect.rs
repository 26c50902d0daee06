// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
WGSL reflection.

Each stage's source is parsed and validated with naga before wgpu sees it, so a bad shader is a
[`ShaderCompileError`] carrying naga's rendered diagnostics instead of an uncaptured device
error.  The parsed module is then walked for its resource bindings, vertex inputs, fragment
outputs and workgroup size.
*/

use crate::error::{ShaderCompileError, StageKind};
use crate::program::{
    BindingKind, BindingLayoutEntry, BindingSlot, FragmentOutput, ScalarClass, VertexInput,
};
use crate::swap_chain::BackendKind;
use std::num::NonZeroU64;

/// One resource binding and the wgpu layout type it needs.
#[derive(Debug, Clone)]
pub(super) struct ReflectedBinding {
    pub entry: BindingLayoutEntry,
    pub ty: wgpu::BindingType,
}

#[derive(Debug)]
pub(super) struct ReflectedStage {
    pub entry_point: String,
    pub bindings: Vec<ReflectedBinding>,
    pub vertex_inputs: Vec<VertexInput>,
    pub fragment_outputs: Vec<FragmentOutput>,
    pub workgroup_size: [u32; 3],
}

fn compile_error(stage: StageKind, diagnostics: String) -> ShaderCompileError {
    ShaderCompileError {
        backend: BackendKind::WebGPU,
        stage,
        diagnostics,
    }
}

fn naga_stage(stage: StageKind) -> Option<naga::ShaderStage> {
    match stage {
        StageKind::Vertex => Some(naga::ShaderStage::Vertex),
        StageKind::Fragment => Some(naga::ShaderStage::Fragment),
        StageKind::Compute => Some(naga::ShaderStage::Compute),
        StageKind::Link => None,
    }
}

pub(super) fn shader_stages(stage: StageKind) -> wgpu::ShaderStages {
    match stage {
        StageKind::Vertex => wgpu::ShaderStages::VERTEX,
        StageKind::Fragment => wgpu::ShaderStages::FRAGMENT,
        StageKind::Compute => wgpu::ShaderStages::COMPUTE,
        StageKind::Link => wgpu::ShaderStages::NONE,
    }
}

/// Parses, validates and reflects one stage.
pub(super) fn reflect(
    stage: StageKind,
    code: &str,
    entry_point: Option<&str>,
) -> Result<ReflectedStage, ShaderCompileError> {
    let module = naga::front::wgsl::parse_str(code)
        .map_err(|e| compile_error(stage, e.emit_to_string(code)))?;
    naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .map_err(|e| compile_error(stage, e.emit_to_string(code)))?;

    let wanted = naga_stage(stage);
    let candidates: Vec<&naga::EntryPoint> = module
        .entry_points
        .iter()
        .filter(|ep| Some(ep.stage) == wanted)
        .filter(|ep| entry_point.is_none_or(|name| ep.name == name))
        .collect();
    let ep = match (candidates.as_slice(), entry_point) {
        ([ep], _) => *ep,
        ([], Some(name)) => {
            return Err(compile_error(
                stage,
                format!("no {stage} entry point named {name:?}"),
            ));
        }
        ([], None) => {
            return Err(compile_error(stage, format!("no {stage} entry point")));
        }
        (many, _) => {
            return Err(compile_error(
                stage,
                format!(
                    "{} {stage} entry points; name the one to use",
                    many.len()
                ),
            ));
        }
    };

    let bindings = module
        .global_variables
        .iter()
        .filter_map(|(_, var)| var.binding.as_ref().map(|b| (var, b)))
        .map(|(var, b)| {
            let slot = BindingSlot::new(b.group, b.binding);
            let name = var.name.clone().unwrap_or_else(|| slot.to_string());
            binding(&module, var, slot, name).map_err(|reason| compile_error(stage, reason))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut vertex_inputs = Vec::new();
    let mut fragment_outputs = Vec::new();
    match stage {
        StageKind::Vertex => {
            for arg in &ep.function.arguments {
                let mut found = Vec::new();
                locations(&module, arg.ty, arg.binding.as_ref(), arg.name.as_deref(), &mut found);
                vertex_inputs.extend(found.into_iter().map(|l| VertexInput {
                    location: l.location,
                    components: l.components,
                    class: l.class,
                    name: l.name,
                }));
            }
        }
        StageKind::Fragment => {
            if let Some(result) = &ep.function.result {
                let mut found = Vec::new();
                locations(&module, result.ty, result.binding.as_ref(), None, &mut found);
                fragment_outputs.extend(found.into_iter().map(|l| FragmentOutput {
                    location: l.location,
                    class: l.class,
                }));
            }
        }
        _ => {}
    }
    vertex_inputs.sort_by_key(|v| v.location);
    fragment_outputs.sort_by_key(|f| f.location);

    Ok(ReflectedStage {
        entry_point: ep.name.clone(),
        bindings,
        vertex_inputs,
        fragment_outputs,
        workgroup_size: ep.workgroup_size,
    })
}

fn binding(
    module: &naga::Module,
    var: &naga::GlobalVariable,
    slot: BindingSlot,
    name: String,
) -> Result<ReflectedBinding, String> {
    let inner = &module.types[var.ty].inner;
    let size = inner.size(module.to_ctx()) as u64;
    let (kind, min_size, ty) = match (var.space, inner) {
        (naga::AddressSpace::Uniform, _) => (
            BindingKind::UniformBuffer,
            size,
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: NonZeroU64::new(size),
            },
        ),
        (naga::AddressSpace::Storage { access }, _) => {
            let read_only = !access.contains(naga::StorageAccess::STORE);
            (
                BindingKind::StorageBuffer { read_only },
                size,
                wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only },
                    has_dynamic_offset: false,
                    min_binding_size: NonZeroU64::new(size),
                },
            )
        }
        (naga::AddressSpace::Handle, naga::TypeInner::Sampler { comparison }) => (
            BindingKind::Sampler,
            0,
            wgpu::BindingType::Sampler(if *comparison {
                wgpu::SamplerBindingType::Comparison
            } else {
                wgpu::SamplerBindingType::Filtering
            }),
        ),
        (
            naga::AddressSpace::Handle,
            naga::TypeInner::Image {
                dim,
                arrayed,
                class,
            },
        ) => {
            let view_dimension = match (dim, arrayed) {
                (naga::ImageDimension::D1, _) => wgpu::TextureViewDimension::D1,
                (naga::ImageDimension::D2, false) => wgpu::TextureViewDimension::D2,
                (naga::ImageDimension::D2, true) => wgpu::TextureViewDimension::D2Array,
                (naga::ImageDimension::D3, _) => wgpu::TextureViewDimension::D3,
                (naga::ImageDimension::Cube, false) => wgpu::TextureViewDimension::Cube,
                (naga::ImageDimension::Cube, true) => wgpu::TextureViewDimension::CubeArray,
            };
            match class {
                naga::ImageClass::Sampled { kind, multi } => {
                    let sample_type = match kind {
                        naga::ScalarKind::Sint => wgpu::TextureSampleType::Sint,
                        naga::ScalarKind::Uint => wgpu::TextureSampleType::Uint,
                        _ => wgpu::TextureSampleType::Float { filterable: true },
                    };
                    (
                        BindingKind::Texture,
                        0,
                        wgpu::BindingType::Texture {
                            sample_type,
                            view_dimension,
                            multisampled: *multi,
                        },
                    )
                }
                naga::ImageClass::Depth { multi } => (
                    BindingKind::Texture,
                    0,
                    wgpu::BindingType::Texture {
                        sample_type: wgpu::TextureSampleType::Depth,
                        view_dimension,
                        multisampled: *multi,
                    },
                ),
                naga::ImageClass::Storage { format, access } => {
                    let access = match (
                        access.contains(naga::StorageAccess::LOAD),
                        access.contains(naga::StorageAccess::STORE),
                    ) {
                        (true, true) => wgpu::StorageTextureAccess::ReadWrite,
                        (true, false) => wgpu::StorageTextureAccess::ReadOnly,
                        _ => wgpu::StorageTextureAccess::WriteOnly,
                    };
                    (
                        BindingKind::StorageTexture,
                        0,
                        wgpu::BindingType::StorageTexture {
                            access,
                            format: storage_format(*format)
                                .ok_or_else(|| format!("{name}: storage format {format:?}"))?,
                            view_dimension,
                        },
                    )
                }
                #[allow(unreachable_patterns)]
                other => return Err(format!("{name}: unsupported image class {other:?}")),
            }
        }
        (space, _) => return Err(format!("{name}: unsupported binding in {space:?} space")),
    };
    Ok(ReflectedBinding {
        entry: BindingLayoutEntry {
            slot,
            kind,
            min_size,
            name,
        },
        ty,
    })
}

fn storage_format(format: naga::StorageFormat) -> Option<wgpu::TextureFormat> {
    Some(match format {
        naga::StorageFormat::R32Float => wgpu::TextureFormat::R32Float,
        naga::StorageFormat::R32Uint => wgpu::TextureFormat::R32Uint,
        naga::StorageFormat::R32Sint => wgpu::TextureFormat::R32Sint,
        naga::StorageFormat::Rg32Float => wgpu::TextureFormat::Rg32Float,
        naga::StorageFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        naga::StorageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        naga::StorageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        naga::StorageFormat::Rgba32Uint => wgpu::TextureFormat::Rgba32Uint,
        _ => return None,
    })
}

struct Location {
    location: u32,
    components: u32,
    class: ScalarClass,
    name: String,
}

/// Collects `@location` bindings from an argument or result, descending into structs.
fn locations(
    module: &naga::Module,
    ty: naga::Handle<naga::Type>,
    binding: Option<&naga::Binding>,
    name: Option<&str>,
    out: &mut Vec<Location>,
) {
    let inner = &module.types[ty].inner;
    match binding {
        Some(naga::Binding::Location { location, .. }) => {
            let (components, scalar) = match inner {
                naga::TypeInner::Scalar(s) => (1, Some(*s)),
                naga::TypeInner::Vector { size, scalar } => (*size as u32, Some(*scalar)),
                _ => (1, None),
            };
            let class = match scalar.map(|s| s.kind) {
                Some(naga::ScalarKind::Sint) => ScalarClass::Sint,
                Some(naga::ScalarKind::Uint) => ScalarClass::Uint,
                _ => ScalarClass::Float,
            };
            out.push(Location {
                location: *location,
                components,
                class,
                name: name.unwrap_or_default().to_string(),
            });
        }
        Some(_) => {}
        None => {
            if let naga::TypeInner::Struct { members, .. } = inner {
                for member in members {
                    locations(
                        module,
                        member.ty,
                        member.binding.as_ref(),
                        member.name.as_deref(),
                        out,
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAXPY: &str = r#"
struct Params { a: f32, n: u32 }
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var<storage, read> x: array<f32>;
@group(0) @binding(2) var<storage, read_write> y: array<f32>;

@compute @workgroup_size(64)
fn main(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < params.n) {
        y[id.x] = params.a * x[id.x] + y[id.x];
    }
}
"#;

    #[test]
    fn compute_bindings_and_workgroup_size() {
        let stage = reflect(StageKind::Compute, SAXPY, None).unwrap();
        assert_eq!(stage.workgroup_size, [64, 1, 1]);
        assert_eq!(stage.entry_point, "main");
        let kinds: Vec<_> = stage.bindings.iter().map(|b| b.entry.kind).collect();
        assert_eq!(
            kinds,
            vec![
                BindingKind::UniformBuffer,
                BindingKind::StorageBuffer { read_only: true },
                BindingKind::StorageBuffer { read_only: false },
            ]
        );
        assert_eq!(stage.bindings[0].entry.min_size, 8);
        assert_eq!(stage.bindings[1].entry.name, "x");
    }

    #[test]
    fn vertex_inputs_come_from_struct_members() {
        let code = r#"
struct In { @location(1) uv: vec2<f32>, @location(0) pos: vec3<f32>, @builtin(vertex_index) i: u32 }
@vertex fn vs(v: In) -> @builtin(position) vec4<f32> { return vec4<f32>(v.pos, 1.0); }
@fragment fn fs() -> @location(0) vec4<u32> { return vec4<u32>(1u); }
"#;
        let vs = reflect(StageKind::Vertex, code, None).unwrap();
        assert_eq!(vs.vertex_inputs.len(), 2);
        assert_eq!(vs.vertex_inputs[0].name, "pos");
        assert_eq!(vs.vertex_inputs[0].components, 3);
        let fs = reflect(StageKind::Fragment, code, Some("fs")).unwrap();
        assert_eq!(fs.fragment_outputs[0].class, ScalarClass::Uint);
    }

    #[test]
    fn syntax_errors_carry_diagnostics() {
        let err = reflect(StageKind::Compute, "@compute fn main( {", None).unwrap_err();
        assert_eq!(err.stage, StageKind::Compute);
        assert!(!err.diagnostics.is_empty());
        let err = reflect(StageKind::Vertex, SAXPY, None).unwrap_err();
        assert!(err.diagnostics.contains("no vertex entry point"));
    }
}
