// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Programs, shader sources and reflected binding signatures.
//!
//! A program is described once with every shader language it is available in.  The device
//! picks the source matching its backend exactly once, at [`crate::Device::create_program`]:
//!
//! | Backend          | Source used                 |
//! |------------------|-----------------------------|
//! | WebGL1 / WebGL2  | [`ShaderSource::Glsl450`]   |
//! | WebGPU           | [`ShaderSource::Wgsl`]      |
//! | Software         | [`ShaderSource::Host`]      |
//!
//! The compiled program carries a [`BindingSignature`] reflected from the source.  It is fixed
//! at creation and is what [`crate::Device::create_bindings`] validates against.

mod host;

pub use host::{HostComputeContext, HostRasterContext, HostShader, HostTarget};
pub(crate) use host::{HostDraw, HostEntry, HostResource, HostResources};

use crate::error::{ShaderCompileError, StageKind};
use crate::swap_chain::BackendKind;
use std::fmt::Display;

/// One shader stage's source in one language.
#[derive(Clone)]
pub enum ShaderSource {
    /// Vulkan-flavoured GLSL 4.50 with explicit `layout(set=, binding=)` and
    /// `layout(location=)` qualifiers.  Lowered to GLSL ES for WebGL.
    Glsl450(String),
    /// WGSL.  `entry_point` may be omitted when the module has a single entry point for the stage.
    Wgsl {
        code: String,
        entry_point: Option<String>,
    },
    /// A CPU implementation, run by the software backend.
    Host(HostShader),
}

impl std::fmt::Debug for ShaderSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShaderSource::Glsl450(code) => write!(f, "Glsl450({} bytes)", code.len()),
            ShaderSource::Wgsl { code, entry_point } => {
                write!(f, "Wgsl({} bytes, entry {:?})", code.len(), entry_point)
            }
            ShaderSource::Host(h) => write!(f, "Host({h:?})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ShaderLanguage {
    Glsl450,
    Wgsl,
    Host,
}

impl ShaderLanguage {
    pub(crate) fn for_backend(backend: BackendKind) -> Self {
        match backend {
            BackendKind::WebGL1 | BackendKind::WebGL2 => ShaderLanguage::Glsl450,
            BackendKind::WebGPU => ShaderLanguage::Wgsl,
            BackendKind::Software => ShaderLanguage::Host,
        }
    }
}

/// The sources for one stage, side by side.
#[derive(Debug, Clone, Default)]
pub struct ShaderStage {
    sources: Vec<ShaderSource>,
}

impl ShaderStage {
    pub fn new() -> Self {
        ShaderStage::default()
    }

    pub fn glsl(mut self, code: impl Into<String>) -> Self {
        self.sources.push(ShaderSource::Glsl450(code.into()));
        self
    }

    pub fn wgsl(mut self, code: impl Into<String>) -> Self {
        self.sources.push(ShaderSource::Wgsl {
            code: code.into(),
            entry_point: None,
        });
        self
    }

    pub fn wgsl_entry(mut self, code: impl Into<String>, entry_point: impl Into<String>) -> Self {
        self.sources.push(ShaderSource::Wgsl {
            code: code.into(),
            entry_point: Some(entry_point.into()),
        });
        self
    }

    pub fn host(mut self, shader: HostShader) -> Self {
        self.sources.push(ShaderSource::Host(shader));
        self
    }

    pub fn source(mut self, source: ShaderSource) -> Self {
        self.sources.push(source);
        self
    }

    pub(crate) fn resolve(&self, language: ShaderLanguage) -> Option<&ShaderSource> {
        self.sources.iter().find(|s| {
            matches!(
                (s, language),
                (ShaderSource::Glsl450(_), ShaderLanguage::Glsl450)
                    | (ShaderSource::Wgsl { .. }, ShaderLanguage::Wgsl)
                    | (ShaderSource::Host(_), ShaderLanguage::Host)
            )
        })
    }
}

#[derive(Debug, Clone)]
pub enum ProgramDescriptor {
    Render {
        vertex: ShaderStage,
        fragment: ShaderStage,
    },
    Compute {
        compute: ShaderStage,
    },
}

impl ProgramDescriptor {
    pub fn render(vertex: ShaderStage, fragment: ShaderStage) -> Self {
        ProgramDescriptor::Render { vertex, fragment }
    }

    pub fn compute(compute: ShaderStage) -> Self {
        ProgramDescriptor::Compute { compute }
    }

    pub fn is_compute(&self) -> bool {
        matches!(self, ProgramDescriptor::Compute { .. })
    }

    /// The source of each stage for `backend`, or a compile error naming the missing stage.
    pub(crate) fn resolve(
        &self,
        backend: BackendKind,
    ) -> Result<Vec<(StageKind, &ShaderSource)>, ShaderCompileError> {
        let language = ShaderLanguage::for_backend(backend);
        let stages: Vec<(StageKind, &ShaderStage)> = match self {
            ProgramDescriptor::Render { vertex, fragment } => {
                vec![(StageKind::Vertex, vertex), (StageKind::Fragment, fragment)]
            }
            ProgramDescriptor::Compute { compute } => vec![(StageKind::Compute, compute)],
        };
        stages
            .into_iter()
            .map(|(kind, stage)| {
                stage
                    .resolve(language)
                    .map(|source| (kind, source))
                    .ok_or_else(|| ShaderCompileError {
                        backend,
                        stage: kind,
                        diagnostics: format!("no {language:?} source was provided for this stage"),
                    })
            })
            .collect()
    }
}

/// A `(group, binding)` pair.  WebGL backends flatten it to a single binding point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingSlot {
    pub group: u32,
    pub binding: u32,
}

impl BindingSlot {
    pub const fn new(group: u32, binding: u32) -> Self {
        BindingSlot { group, binding }
    }
}

impl Display for BindingSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@group({}) @binding({})", self.group, self.binding)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingKind {
    UniformBuffer,
    StorageBuffer { read_only: bool },
    Texture,
    Sampler,
    /// A GLSL `sampler2D`-style uniform: texture and sampler bound together.
    CombinedTextureSampler,
    StorageTexture,
}

impl BindingKind {
    pub fn is_buffer(&self) -> bool {
        matches!(
            self,
            BindingKind::UniformBuffer | BindingKind::StorageBuffer { .. }
        )
    }
}

impl Display for BindingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindingKind::UniformBuffer => write!(f, "uniform buffer"),
            BindingKind::StorageBuffer { read_only: true } => write!(f, "read-only storage buffer"),
            BindingKind::StorageBuffer { read_only: false } => write!(f, "storage buffer"),
            BindingKind::Texture => write!(f, "texture"),
            BindingKind::Sampler => write!(f, "sampler"),
            BindingKind::CombinedTextureSampler => write!(f, "combined texture sampler"),
            BindingKind::StorageTexture => write!(f, "storage texture"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingLayoutEntry {
    pub slot: BindingSlot,
    pub kind: BindingKind,
    /// Minimum bound size in bytes for buffers, 0 otherwise.
    pub min_size: u64,
    /// Name in the shader source, for diagnostics and the WebGL uniform lookup.
    pub name: String,
}

/// The ordered list of slots a program expects.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BindingSignature {
    entries: Vec<BindingLayoutEntry>,
}

impl BindingSignature {
    /// Sorts by slot.  Duplicate slots must agree on their kind.
    pub fn new(mut entries: Vec<BindingLayoutEntry>) -> Result<Self, String> {
        entries.sort_by_key(|e| e.slot);
        let mut merged: Vec<BindingLayoutEntry> = Vec::with_capacity(entries.len());
        for entry in entries {
            match merged.last_mut() {
                Some(last) if last.slot == entry.slot => {
                    if last.kind != entry.kind {
                        return Err(format!(
                            "{} is declared as both {} ({}) and {} ({})",
                            entry.slot, last.kind, last.name, entry.kind, entry.name
                        ));
                    }
                    last.min_size = last.min_size.max(entry.min_size);
                }
                _ => merged.push(entry),
            }
        }
        Ok(BindingSignature { entries: merged })
    }

    pub fn entries(&self) -> &[BindingLayoutEntry] {
        &self.entries
    }

    pub fn get(&self, slot: BindingSlot) -> Option<&BindingLayoutEntry> {
        self.entries
            .binary_search_by_key(&slot, |e| e.slot)
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Highest group index used, plus one.
    pub fn group_count(&self) -> u32 {
        self.entries.iter().map(|e| e.slot.group + 1).max().unwrap_or(0)
    }
}

/// Numeric class of a shader input or output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarClass {
    Float,
    Uint,
    Sint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInput {
    pub location: u32,
    pub components: u32,
    pub class: ScalarClass,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentOutput {
    pub location: u32,
    pub class: ScalarClass,
}

/// Everything reflected from a program at creation.
#[derive(Debug, Clone, Default)]
pub struct ProgramReflection {
    pub signature: BindingSignature,
    pub vertex_inputs: Vec<VertexInput>,
    pub fragment_outputs: Vec<FragmentOutput>,
    /// Compute programs only.
    pub workgroup_size: Option<[u32; 3]>,
}

/// What the registry keeps about a live program.
#[derive(Debug, Clone)]
pub(crate) struct ProgramInfo {
    pub reflection: ProgramReflection,
    pub compute: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(group: u32, binding: u32, kind: BindingKind, min_size: u64) -> BindingLayoutEntry {
        BindingLayoutEntry {
            slot: BindingSlot::new(group, binding),
            kind,
            min_size,
            name: format!("b{group}_{binding}"),
        }
    }

    #[test]
    fn signature_is_ordered_and_merged() {
        let sig = BindingSignature::new(vec![
            entry(1, 0, BindingKind::Sampler, 0),
            entry(0, 1, BindingKind::UniformBuffer, 16),
            entry(0, 1, BindingKind::UniformBuffer, 64),
        ])
        .unwrap();
        assert_eq!(sig.len(), 2);
        assert_eq!(sig.entries()[0].slot, BindingSlot::new(0, 1));
        assert_eq!(sig.entries()[0].min_size, 64);
        assert_eq!(sig.group_count(), 2);
    }

    #[test]
    fn conflicting_kinds_are_rejected() {
        let r = BindingSignature::new(vec![
            entry(0, 0, BindingKind::UniformBuffer, 16),
            entry(0, 0, BindingKind::StorageBuffer { read_only: true }, 16),
        ]);
        assert!(r.is_err());
    }

    #[test]
    fn resolve_picks_backend_language() {
        let desc = ProgramDescriptor::compute(
            ShaderStage::new()
                .glsl("#version 450\nvoid main(){}")
                .wgsl("@compute @workgroup_size(1) fn main() {}"),
        );
        let resolved = desc.resolve(BackendKind::WebGPU).unwrap();
        assert!(matches!(resolved[0].1, ShaderSource::Wgsl { .. }));
        let missing = desc.resolve(BackendKind::Software).unwrap_err();
        assert_eq!(missing.stage, StageKind::Compute);
    }
}
