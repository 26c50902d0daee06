// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Dirty-checked uniform setters.
//!
//! Every active uniform of a linked program gets a setter that remembers the last value it sent.
//! Setting the same value again issues no GL call.  On WebGL1, where uniform blocks do not exist,
//! a block's std140 bytes are decoded member by member into these setters.

use super::context::{GlContext, types};
use super::glsl::{GlslClass, GlslType, UniformBlock};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetterKind {
    Float(u32),
    Int(u32),
    Uint(u32),
    Bool(u32),
    Matrix { columns: u32, rows: u32 },
    Sampler,
}

impl SetterKind {
    pub(crate) fn from_gl_type(gl_type: u32) -> Option<SetterKind> {
        if let Some(kind) = sampler_kind(gl_type) {
            return Some(kind);
        }
        let ty = glsl_type_for(gl_type)?;
        Some(if ty.is_matrix() {
            SetterKind::Matrix {
                columns: ty.columns,
                rows: ty.rows,
            }
        } else {
            match ty.class {
                GlslClass::Float => SetterKind::Float(ty.rows),
                GlslClass::Int => SetterKind::Int(ty.rows),
                GlslClass::Uint => SetterKind::Uint(ty.rows),
                GlslClass::Bool => SetterKind::Bool(ty.rows),
            }
        })
    }

    fn components(&self) -> u32 {
        match *self {
            SetterKind::Float(n) | SetterKind::Int(n) | SetterKind::Uint(n) | SetterKind::Bool(n) => {
                n
            }
            SetterKind::Matrix { columns, rows } => columns * rows,
            SetterKind::Sampler => 1,
        }
    }
}

fn sampler_kind(gl_type: u32) -> Option<SetterKind> {
    matches!(
        gl_type,
        types::SAMPLER_2D
            | types::SAMPLER_3D
            | types::SAMPLER_CUBE
            | types::SAMPLER_2D_SHADOW
            | types::SAMPLER_2D_ARRAY
            | types::SAMPLER_CUBE_SHADOW
            | types::INT_SAMPLER_2D
            | types::UNSIGNED_INT_SAMPLER_2D
    )
    .then_some(SetterKind::Sampler)
}

fn glsl_type_for(gl_type: u32) -> Option<GlslType> {
    const NAMES: [&str; 25] = [
        "float", "vec2", "vec3", "vec4", "int", "ivec2", "ivec3", "ivec4", "uint", "uvec2",
        "uvec3", "uvec4", "bool", "bvec2", "bvec3", "bvec4", "mat2", "mat3", "mat4", "mat2x3",
        "mat2x4", "mat3x2", "mat3x4", "mat4x2", "mat4x3",
    ];
    NAMES
        .iter()
        .filter_map(|n| GlslType::parse(n))
        .find(|t| t.gl_type == gl_type)
}

#[derive(Debug, Clone, PartialEq)]
enum Cached {
    Unset,
    Floats(Vec<f32>),
    Ints(Vec<i32>),
    Uints(Vec<u32>),
}

#[derive(Debug)]
pub(crate) struct UniformSetter {
    location: u32,
    kind: SetterKind,
    /// Array length as reported by GL.
    count: u32,
    cached: Cached,
}

impl UniformSetter {
    /// Number of scalars one full upload carries.
    fn len(&self) -> usize {
        (self.kind.components() * self.count) as usize
    }

    /// Returns whether a GL call was issued.
    pub(crate) fn set_floats(&mut self, gl: &dyn GlContext, values: &[f32]) -> bool {
        if matches!(&self.cached, Cached::Floats(old) if old == values) {
            return false;
        }
        match self.kind {
            SetterKind::Float(n) => gl.uniform_fv(self.location, n, values),
            SetterKind::Matrix { columns, rows } => {
                gl.uniform_matrix_fv(self.location, columns, rows, values)
            }
            _ => {
                logwise::warn_sync!(
                    "float values for a {kind} uniform were ignored",
                    kind = logwise::privacy::LogIt(&self.kind)
                );
                return false;
            }
        }
        let len = self.len();
        match &mut self.cached {
            Cached::Floats(old) => refill(old, values),
            cached => *cached = Cached::Floats(backing(len, values)),
        }
        true
    }

    /// Integers, booleans and sampler units.
    pub(crate) fn set_ints(&mut self, gl: &dyn GlContext, values: &[i32]) -> bool {
        if matches!(&self.cached, Cached::Ints(old) if old == values) {
            return false;
        }
        match self.kind {
            SetterKind::Int(n) | SetterKind::Bool(n) => gl.uniform_iv(self.location, n, values),
            SetterKind::Sampler => gl.uniform_iv(self.location, 1, values),
            _ => {
                logwise::warn_sync!(
                    "integer values for a {kind} uniform were ignored",
                    kind = logwise::privacy::LogIt(&self.kind)
                );
                return false;
            }
        }
        let len = self.len();
        match &mut self.cached {
            Cached::Ints(old) => refill(old, values),
            cached => *cached = Cached::Ints(backing(len, values)),
        }
        true
    }

    pub(crate) fn set_uints(&mut self, gl: &dyn GlContext, values: &[u32]) -> bool {
        if matches!(&self.cached, Cached::Uints(old) if old == values) {
            return false;
        }
        let SetterKind::Uint(n) = self.kind else {
            logwise::warn_sync!(
                "unsigned values for a {kind} uniform were ignored",
                kind = logwise::privacy::LogIt(&self.kind)
            );
            return false;
        };
        gl.uniform_uiv(self.location, n, values);
        let len = self.len();
        match &mut self.cached {
            Cached::Uints(old) => refill(old, values),
            cached => *cached = Cached::Uints(backing(len, values)),
        }
        true
    }
}

/// The one array a setter keeps its last upload in, sized for a full upload.
fn backing<T: Copy>(len: usize, values: &[T]) -> Vec<T> {
    let mut out = Vec::with_capacity(len.max(values.len()));
    out.extend_from_slice(values);
    out
}

fn refill<T: Copy>(cached: &mut Vec<T>, values: &[T]) {
    cached.clear();
    cached.extend_from_slice(values);
}

fn word(bytes: &[u8], at: usize) -> [u8; 4] {
    bytes
        .get(at..at + 4)
        .and_then(|w| w.try_into().ok())
        .unwrap_or_default()
}

/// The setters of one linked program.
#[derive(Debug, Default)]
pub(crate) struct ProgramUniforms {
    setters: HashMap<String, UniformSetter>,
    scratch_floats: Vec<f32>,
    scratch_ints: Vec<i32>,
    scratch_uints: Vec<u32>,
}

impl ProgramUniforms {
    /// Queries the active uniforms of `program`.  Uniforms GL optimized away have no setter.
    pub(crate) fn new(gl: &dyn GlContext, program: u32) -> Self {
        let mut setters = HashMap::new();
        for active in gl.active_uniforms(program) {
            let name = active
                .name
                .strip_suffix("[0]")
                .unwrap_or(&active.name)
                .to_string();
            let Some(kind) = SetterKind::from_gl_type(active.gl_type) else {
                logwise::warn_sync!(
                    "uniform {name} has unknown type {gl_type}",
                    name = logwise::privacy::LogIt(&name),
                    gl_type = active.gl_type
                );
                continue;
            };
            let Some(location) = gl.uniform_location(program, &name) else {
                continue;
            };
            setters.insert(
                name,
                UniformSetter {
                    location,
                    kind,
                    count: active.size.max(1),
                    cached: Cached::Unset,
                },
            );
        }
        ProgramUniforms {
            setters,
            ..Default::default()
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.setters.len()
    }

    /// Points a sampler uniform at texture unit `unit`.
    pub(crate) fn set_texture_unit(&mut self, gl: &dyn GlContext, name: &str, unit: u32) -> bool {
        match self.setters.get_mut(name) {
            Some(setter) => setter.set_ints(gl, &[unit as i32]),
            None => false,
        }
    }

    /// Decodes std140 `bytes` of `block` into the loose uniforms it was lowered to.
    /// Returns the number of GL calls issued.
    pub(crate) fn upload_block(
        &mut self,
        gl: &dyn GlContext,
        block: &UniformBlock,
        bytes: &[u8],
    ) -> usize {
        let mut calls = 0;
        for member in &block.members {
            let name = block.lowered_name(member);
            let Some(setter) = self.setters.get_mut(&name) else {
                continue;
            };
            let ty = member.ty;
            let count = member.count().min(setter.count);
            let column_stride = if ty.is_matrix() { 16 } else { 0 };
            self.scratch_floats.clear();
            self.scratch_ints.clear();
            self.scratch_uints.clear();
            for element in 0..count {
                let base = (member.offset + element * member.stride()) as usize;
                for column in 0..ty.columns as usize {
                    for row in 0..ty.rows as usize {
                        let w = word(bytes, base + column * column_stride + row * 4);
                        match ty.class {
                            GlslClass::Float => self.scratch_floats.push(f32::from_le_bytes(w)),
                            GlslClass::Int => self.scratch_ints.push(i32::from_le_bytes(w)),
                            GlslClass::Bool => {
                                self.scratch_ints.push((u32::from_le_bytes(w) != 0) as i32)
                            }
                            GlslClass::Uint => self.scratch_uints.push(u32::from_le_bytes(w)),
                        }
                    }
                }
            }
            debug_assert!(
                self.scratch_floats.len() + self.scratch_ints.len() + self.scratch_uints.len()
                    <= setter.len()
            );
            let issued = match ty.class {
                GlslClass::Float => setter.set_floats(gl, &self.scratch_floats),
                GlslClass::Int | GlslClass::Bool => setter.set_ints(gl, &self.scratch_ints),
                GlslClass::Uint => setter.set_uints(gl, &self.scratch_uints),
            };
            calls += issued as usize;
        }
        calls
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageKind;
    use crate::imp::webgl::{GlVersion, HeadlessGl, glsl};

    const VERTEX: &str = "#version 450
layout(set = 0, binding = 0) uniform Params {
    mat3 basis;
    vec2 offset;
    int mode;
    bool flip;
} params;
layout(location = 0) in vec2 position;
void main() {
    vec3 p = params.basis * vec3(position + params.offset, 1.0);
    if (params.flip && params.mode > 0) { p = -p; }
    gl_Position = vec4(p, 1.0);
}
";
    const FRAGMENT: &str = "#version 450
layout(location = 0) out vec4 color;
void main() { color = vec4(1.0); }
";

    fn link(gl: &HeadlessGl) -> (u32, UniformBlock) {
        let vertex = glsl::scan(StageKind::Vertex, VERTEX).unwrap();
        let fragment = glsl::scan(StageKind::Fragment, FRAGMENT).unwrap();
        let vs = gl
            .compile_shader(StageKind::Vertex, &vertex.lower(GlVersion::WebGl1).unwrap())
            .unwrap();
        let fs = gl
            .compile_shader(StageKind::Fragment, &fragment.lower(GlVersion::WebGl1).unwrap())
            .unwrap();
        let program = gl.link_program(vs, fs, &vertex.attribute_locations()).unwrap();
        (program, vertex.blocks[0].clone())
    }

    fn params(offset: [f32; 2], mode: i32) -> Vec<u8> {
        let mut bytes = vec![0u8; 80];
        for column in 0..3 {
            for row in 0..3 {
                let v: f32 = if row == column { 1.0 } else { 0.0 };
                let at = column * 16 + row * 4;
                bytes[at..at + 4].copy_from_slice(&v.to_le_bytes());
            }
        }
        bytes[48..52].copy_from_slice(&offset[0].to_le_bytes());
        bytes[52..56].copy_from_slice(&offset[1].to_le_bytes());
        bytes[56..60].copy_from_slice(&mode.to_le_bytes());
        bytes[60..64].copy_from_slice(&1u32.to_le_bytes());
        bytes
    }

    #[test]
    fn block_upload_is_idempotent() {
        let gl = HeadlessGl::new(GlVersion::WebGl1, 4, 4);
        let (program, block) = link(&gl);
        let mut uniforms = ProgramUniforms::new(&gl, program);
        assert_eq!(uniforms.len(), 4);

        assert_eq!(uniforms.upload_block(&gl, &block, &params([0.5, 0.25], 2)), 4);
        assert_eq!(uniforms.upload_block(&gl, &block, &params([0.5, 0.25], 2)), 0);
        // only the changed member is re-sent
        assert_eq!(uniforms.upload_block(&gl, &block, &params([0.5, 0.25], 3)), 1);

        assert_eq!(gl.uniform_floats("params_offset"), Some(vec![0.5, 0.25]));
        assert_eq!(gl.uniform_ints("params_mode"), Some(vec![3]));
        assert_eq!(gl.uniform_ints("params_flip"), Some(vec![1]));
        assert_eq!(
            gl.uniform_floats("params_basis"),
            Some(vec![1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0])
        );
    }

    #[test]
    fn changed_values_reuse_the_cached_array() {
        let gl = HeadlessGl::new(GlVersion::WebGl1, 4, 4);
        let (program, block) = link(&gl);
        let mut uniforms = ProgramUniforms::new(&gl, program);
        uniforms.upload_block(&gl, &block, &params([0.0, 0.0], 0));
        let array = |uniforms: &ProgramUniforms| match &uniforms.setters["params_basis"].cached {
            Cached::Floats(values) => (values.as_ptr(), values.capacity()),
            other => panic!("basis cached as {other:?}"),
        };
        let first = array(&uniforms);
        assert!(first.1 >= 9);
        for frame in 1..20 {
            let mut bytes = params([frame as f32, 0.0], frame);
            bytes[0..4].copy_from_slice(&(frame as f32 + 1.0).to_le_bytes());
            assert_eq!(uniforms.upload_block(&gl, &block, &bytes), 3);
            assert_eq!(array(&uniforms), first);
        }
        assert_eq!(gl.uniform_ints("params_mode"), Some(vec![19]));
    }

    #[test]
    fn setter_kinds() {
        assert_eq!(SetterKind::from_gl_type(types::FLOAT_VEC3), Some(SetterKind::Float(3)));
        assert_eq!(
            SetterKind::from_gl_type(types::FLOAT_MAT2X3),
            Some(SetterKind::Matrix { columns: 2, rows: 3 })
        );
        assert_eq!(SetterKind::from_gl_type(types::SAMPLER_CUBE), Some(SetterKind::Sampler));
        assert_eq!(SetterKind::from_gl_type(0), None);
    }
}
