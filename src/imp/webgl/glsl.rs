// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
GLSL 4.50 to GLSL ES lowering.

Programs are written once in Vulkan-flavoured GLSL (`layout(set=, binding=)` on every resource,
`layout(location=)` on stage inputs and outputs).  This module scans the global declarations of
such a stage, reflects its interface, and re-emits it for WebGL:

* WebGL2 gets `#version 300 es`.  Uniform blocks become `layout(std140)` blocks whose binding
  points are assigned at link time; varyings lose their locations and match by name.
* WebGL1 gets `#version 100`.  Uniform blocks are lowered to loose uniforms (`block.member` becomes
  `block_member`), stage inputs become `attribute`/`varying`, the single fragment output becomes
  `gl_FragColor`, and `texture()` becomes `texture2D()`/`textureCube()`.

Only declarations are understood.  Function bodies are copied through with identifier-level
substitutions; they are otherwise opaque.
*/

use super::context::{GlVersion, types};
use crate::error::StageKind;
use crate::program::{BindingSlot, ScalarClass};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GlslClass {
    Float,
    Int,
    Uint,
    Bool,
}

/// A non-opaque GLSL type.  Scalars and vectors have one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct GlslType {
    pub gl_type: u32,
    pub class: GlslClass,
    pub columns: u32,
    pub rows: u32,
}

impl GlslType {
    const fn new(gl_type: u32, class: GlslClass, columns: u32, rows: u32) -> Self {
        GlslType {
            gl_type,
            class,
            columns,
            rows,
        }
    }

    pub(crate) fn parse(name: &str) -> Option<GlslType> {
        use GlslClass::*;
        use types::*;
        Some(match name {
            "float" => GlslType::new(FLOAT, Float, 1, 1),
            "vec2" => GlslType::new(FLOAT_VEC2, Float, 1, 2),
            "vec3" => GlslType::new(FLOAT_VEC3, Float, 1, 3),
            "vec4" => GlslType::new(FLOAT_VEC4, Float, 1, 4),
            "int" => GlslType::new(INT, Int, 1, 1),
            "ivec2" => GlslType::new(INT_VEC2, Int, 1, 2),
            "ivec3" => GlslType::new(INT_VEC3, Int, 1, 3),
            "ivec4" => GlslType::new(INT_VEC4, Int, 1, 4),
            "uint" => GlslType::new(UNSIGNED_INT, Uint, 1, 1),
            "uvec2" => GlslType::new(UNSIGNED_INT_VEC2, Uint, 1, 2),
            "uvec3" => GlslType::new(UNSIGNED_INT_VEC3, Uint, 1, 3),
            "uvec4" => GlslType::new(UNSIGNED_INT_VEC4, Uint, 1, 4),
            "bool" => GlslType::new(BOOL, Bool, 1, 1),
            "bvec2" => GlslType::new(BOOL_VEC2, Bool, 1, 2),
            "bvec3" => GlslType::new(BOOL_VEC3, Bool, 1, 3),
            "bvec4" => GlslType::new(BOOL_VEC4, Bool, 1, 4),
            "mat2" | "mat2x2" => GlslType::new(FLOAT_MAT2, Float, 2, 2),
            "mat3" | "mat3x3" => GlslType::new(FLOAT_MAT3, Float, 3, 3),
            "mat4" | "mat4x4" => GlslType::new(FLOAT_MAT4, Float, 4, 4),
            "mat2x3" => GlslType::new(FLOAT_MAT2X3, Float, 2, 3),
            "mat2x4" => GlslType::new(FLOAT_MAT2X4, Float, 2, 4),
            "mat3x2" => GlslType::new(FLOAT_MAT3X2, Float, 3, 2),
            "mat3x4" => GlslType::new(FLOAT_MAT3X4, Float, 3, 4),
            "mat4x2" => GlslType::new(FLOAT_MAT4X2, Float, 4, 2),
            "mat4x3" => GlslType::new(FLOAT_MAT4X3, Float, 4, 3),
            _ => return None,
        })
    }

    pub(crate) fn is_matrix(&self) -> bool {
        self.columns > 1
    }

    pub(crate) fn components(&self) -> u32 {
        self.columns * self.rows
    }

    /// Types that only exist in GLSL ES 3.00.
    fn needs_webgl2(&self) -> bool {
        self.class == GlslClass::Uint || (self.is_matrix() && self.columns != self.rows)
    }

    fn std140_align(&self) -> u32 {
        if self.is_matrix() {
            16
        } else {
            match self.rows {
                1 => 4,
                2 => 8,
                _ => 16,
            }
        }
    }

    fn std140_size(&self) -> u32 {
        if self.is_matrix() {
            self.columns * 16
        } else {
            self.rows * 4
        }
    }

    pub(crate) fn scalar_class(&self) -> ScalarClass {
        match self.class {
            GlslClass::Float => ScalarClass::Float,
            GlslClass::Uint => ScalarClass::Uint,
            GlslClass::Int | GlslClass::Bool => ScalarClass::Sint,
        }
    }
}

pub(crate) fn sampler_gl_type(name: &str) -> Option<u32> {
    Some(match name {
        "sampler2D" => types::SAMPLER_2D,
        "samplerCube" => types::SAMPLER_CUBE,
        "sampler3D" => types::SAMPLER_3D,
        "sampler2DArray" => types::SAMPLER_2D_ARRAY,
        "sampler2DShadow" => types::SAMPLER_2D_SHADOW,
        "samplerCubeShadow" => types::SAMPLER_CUBE_SHADOW,
        "isampler2D" => types::INT_SAMPLER_2D,
        "usampler2D" => types::UNSIGNED_INT_SAMPLER_2D,
        _ => return None,
    })
}

const fn round_up(value: u32, align: u32) -> u32 {
    value.div_ceil(align) * align
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BlockMember {
    pub name: String,
    type_name: String,
    pub ty: GlslType,
    pub array_len: Option<u32>,
    /// std140 byte offset within the block.
    pub offset: u32,
}

impl BlockMember {
    /// Distance between array elements; the element size for non-arrays.
    pub(crate) fn stride(&self) -> u32 {
        match self.array_len {
            Some(_) => round_up(self.ty.std140_size(), 16),
            None => self.ty.std140_size(),
        }
    }

    pub(crate) fn count(&self) -> u32 {
        self.array_len.unwrap_or(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct UniformBlock {
    pub slot: BindingSlot,
    pub block_name: String,
    pub instance: Option<String>,
    pub members: Vec<BlockMember>,
    /// std140 size, a multiple of 16.
    pub size: u32,
}

impl UniformBlock {
    /// The loose uniform a member becomes on WebGL1.
    pub(crate) fn lowered_name(&self, member: &BlockMember) -> String {
        match &self.instance {
            Some(instance) => format!("{instance}_{}", member.name),
            None => member.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SamplerUniform {
    pub slot: BindingSlot,
    pub name: String,
    type_name: String,
    pub gl_type: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StageVariable {
    pub location: Option<u32>,
    pub name: String,
    type_name: String,
    pub ty: GlslType,
    interpolation: Option<String>,
    array: Option<String>,
}

#[derive(Debug, Clone)]
enum Item {
    Directive(String),
    Block(usize),
    Sampler(usize),
    Input(usize),
    Output(usize),
    Verbatim(String),
}

/// The reflected global interface of one stage.
#[derive(Debug, Clone)]
pub(crate) struct ScannedStage {
    pub stage: StageKind,
    pub blocks: Vec<UniformBlock>,
    pub samplers: Vec<SamplerUniform>,
    pub inputs: Vec<StageVariable>,
    pub outputs: Vec<StageVariable>,
    items: Vec<Item>,
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, chars.peek()) {
            ('/', Some('/')) => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    out
}

enum Raw {
    Directive(String),
    Statement(String),
}

/// Splits the source into preprocessor lines and top-level statements.
fn split(source: &str) -> Result<Vec<Raw>, String> {
    let mut out = Vec::new();
    let mut buffer = String::new();
    let mut depth = 0u32;
    let mut header_end = 0usize;
    for line in source.lines() {
        if depth == 0 && buffer.trim().is_empty() && line.trim_start().starts_with('#') {
            out.push(Raw::Directive(line.trim().to_string()));
            buffer.clear();
            continue;
        }
        for c in line.chars().chain(std::iter::once('\n')) {
            buffer.push(c);
            match c {
                ';' if depth == 0 => {
                    out.push(Raw::Statement(std::mem::take(&mut buffer)));
                }
                '{' => {
                    if depth == 0 {
                        header_end = buffer.len() - 1;
                    }
                    depth += 1;
                }
                '}' => {
                    if depth == 0 {
                        return Err("unbalanced '}'".to_string());
                    }
                    depth -= 1;
                    if depth == 0 && buffer[..header_end].trim_end().ends_with(')') {
                        out.push(Raw::Statement(std::mem::take(&mut buffer)));
                    }
                }
                _ => {}
            }
        }
    }
    if depth != 0 || !buffer.trim().is_empty() {
        return Err("unexpected end of source".to_string());
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Number(String),
    Punct(char),
}

fn tokenize(text: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        if c.is_whitespace() {
            continue;
        }
        if c.is_ascii_alphanumeric() || c == '_' {
            let mut end = start + c.len_utf8();
            while let Some((i, n)) = chars.peek() {
                if n.is_ascii_alphanumeric() || *n == '_' || (c.is_ascii_digit() && *n == '.') {
                    end = i + n.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let word = text[start..end].to_string();
            tokens.push(if c.is_ascii_digit() {
                Token::Number(word)
            } else {
                Token::Ident(word)
            });
        } else {
            tokens.push(Token::Punct(c));
        }
    }
    tokens
}

/// `layout(...)` qualifiers.  Bare words map to `None`.
fn take_layout(tokens: &[Token]) -> Result<(HashMap<String, Option<u32>>, &[Token]), String> {
    let mut layout = HashMap::new();
    if tokens.first() != Some(&Token::Ident("layout".to_string())) {
        return Ok((layout, tokens));
    }
    let close = tokens
        .iter()
        .position(|t| *t == Token::Punct(')'))
        .ok_or("unterminated layout qualifier")?;
    let inner = tokens.get(2..close).ok_or("malformed layout qualifier")?;
    for part in inner.split(|t| *t == Token::Punct(',')) {
        match part {
            [Token::Ident(key)] => {
                layout.insert(key.clone(), None);
            }
            [Token::Ident(key), Token::Punct('='), Token::Number(value)] => {
                let value = value
                    .parse()
                    .map_err(|_| format!("layout {key} = {value} is not an integer"))?;
                layout.insert(key.clone(), Some(value));
            }
            [] => {}
            _ => return Err("malformed layout qualifier".to_string()),
        }
    }
    Ok((layout, &tokens[close + 1..]))
}

fn ident(token: Option<&Token>) -> Option<&str> {
    match token {
        Some(Token::Ident(s)) => Some(s),
        _ => None,
    }
}

/// Parses `[N]` at the front of `tokens`.
fn array_suffix(tokens: &[Token]) -> Result<(Option<u32>, &[Token]), String> {
    match tokens {
        [Token::Punct('['), Token::Number(n), Token::Punct(']'), rest @ ..] => {
            let n = n.parse().map_err(|_| format!("array size {n} is not a constant"))?;
            Ok((Some(n), rest))
        }
        [Token::Punct('['), ..] => Err("array sizes must be integer literals".to_string()),
        _ => Ok((None, tokens)),
    }
}

const PRECISION: [&str; 3] = ["highp", "mediump", "lowp"];
const INTERPOLATION: [&str; 4] = ["flat", "smooth", "noperspective", "centroid"];

fn slot_of(layout: &HashMap<String, Option<u32>>, what: &str) -> Result<BindingSlot, String> {
    let group = layout.get("set").copied().flatten().unwrap_or(0);
    let binding = layout
        .get("binding")
        .copied()
        .flatten()
        .ok_or_else(|| format!("{what} needs a layout(binding = N) qualifier"))?;
    Ok(BindingSlot::new(group, binding))
}

fn parse_members(tokens: &[Token]) -> Result<Vec<BlockMember>, String> {
    let mut members = Vec::new();
    let mut offset = 0;
    for decl in tokens.split(|t| *t == Token::Punct(';')) {
        if decl.is_empty() {
            continue;
        }
        let (layout, mut rest) = take_layout(decl)?;
        if layout.contains_key("row_major") {
            return Err("row_major block members are not supported".to_string());
        }
        while ident(rest.first()).is_some_and(|w| PRECISION.contains(&w)) {
            rest = &rest[1..];
        }
        let type_name = ident(rest.first()).ok_or("expected a member type")?;
        let ty = GlslType::parse(type_name)
            .ok_or_else(|| format!("unsupported uniform block member type {type_name}"))?;
        let name = ident(rest.get(1)).ok_or("expected a member name")?;
        let (array_len, rest) = array_suffix(&rest[2..])?;
        if !rest.is_empty() {
            return Err(format!("unexpected tokens after member {name}"));
        }
        let mut member = BlockMember {
            name: name.to_string(),
            type_name: type_name.to_string(),
            ty,
            array_len,
            offset: 0,
        };
        let align = if array_len.is_some() {
            16
        } else {
            ty.std140_align()
        };
        offset = round_up(offset, align);
        member.offset = offset;
        offset += member.stride() * member.count();
        members.push(member);
    }
    Ok(members)
}

fn parse_variable(
    tokens: &[Token],
    location: Option<u32>,
) -> Result<StageVariable, String> {
    let mut rest = tokens;
    let mut interpolation = None;
    loop {
        match ident(rest.first()) {
            Some(w) if INTERPOLATION.contains(&w) => {
                interpolation = Some(w.to_string());
                rest = &rest[1..];
            }
            Some(w) if PRECISION.contains(&w) => rest = &rest[1..],
            _ => break,
        }
    }
    let type_name = ident(rest.first()).ok_or("expected a type")?;
    let ty = GlslType::parse(type_name)
        .ok_or_else(|| format!("unsupported stage variable type {type_name}"))?;
    let name = ident(rest.get(1)).ok_or("expected a variable name")?;
    let (array, rest) = array_suffix(&rest[2..])?;
    if rest != [Token::Punct(';')] {
        return Err(format!("unexpected tokens after {name}"));
    }
    Ok(StageVariable {
        location,
        name: name.to_string(),
        type_name: type_name.to_string(),
        ty,
        interpolation,
        array: array.map(|n| format!("[{n}]")),
    })
}

/// Scans the global declarations of one GLSL 4.50 stage.
pub(crate) fn scan(stage: StageKind, source: &str) -> Result<ScannedStage, String> {
    let mut scanned = ScannedStage {
        stage,
        blocks: Vec::new(),
        samplers: Vec::new(),
        inputs: Vec::new(),
        outputs: Vec::new(),
        items: Vec::new(),
    };
    for raw in split(&strip_comments(source))? {
        let text = match raw {
            Raw::Directive(line) => {
                if !line.starts_with("#version") {
                    scanned.items.push(Item::Directive(line));
                }
                continue;
            }
            Raw::Statement(text) => text,
        };
        let tokens = tokenize(&text);
        let (layout, rest) = take_layout(&tokens)?;
        let storage_at = rest.iter().position(|t| {
            matches!(t, Token::Ident(w) if ["uniform", "buffer", "in", "out"].contains(&w.as_str()))
        });
        // function bodies and other globals pass through
        let Some(storage_at) = storage_at.filter(|at| {
            rest[..*at].iter().all(|t| {
                matches!(t, Token::Ident(w) if INTERPOLATION.contains(&w.as_str()))
            })
        }) else {
            scanned.items.push(Item::Verbatim(text));
            continue;
        };
        let qualifiers = &rest[..storage_at];
        let storage = ident(rest.get(storage_at)).unwrap_or_default();
        let body = &rest[storage_at + 1..];
        match storage {
            "buffer" => return Err("storage buffers are not available on WebGL".to_string()),
            "uniform" if body.contains(&Token::Punct('{')) => {
                let open = body.iter().position(|t| *t == Token::Punct('{')).unwrap_or(0);
                let close = body
                    .iter()
                    .rposition(|t| *t == Token::Punct('}'))
                    .ok_or("unterminated uniform block")?;
                let block_name = ident(body.first())
                    .filter(|_| open == 1)
                    .ok_or("expected a uniform block name")?;
                let members = parse_members(&body[open + 1..close])?;
                let instance = match &body[close + 1..] {
                    [Token::Punct(';')] => None,
                    [Token::Ident(name), Token::Punct(';')] => Some(name.clone()),
                    _ => return Err(format!("arrays of uniform block {block_name} are not supported")),
                };
                let end = members
                    .last()
                    .map(|m| m.offset + m.stride() * m.count())
                    .unwrap_or(0);
                scanned.blocks.push(UniformBlock {
                    slot: slot_of(&layout, block_name)?,
                    block_name: block_name.to_string(),
                    instance,
                    members,
                    size: round_up(end.max(16), 16),
                });
                scanned.items.push(Item::Block(scanned.blocks.len() - 1));
            }
            "uniform" => {
                let mut body = body;
                while ident(body.first()).is_some_and(|w| PRECISION.contains(&w)) {
                    body = &body[1..];
                }
                let type_name = ident(body.first()).ok_or("expected a uniform type")?;
                let name = ident(body.get(1)).ok_or("expected a uniform name")?;
                let Some(gl_type) = sampler_gl_type(type_name) else {
                    return Err(if GlslType::parse(type_name).is_some() {
                        format!("uniform {name} must be declared inside a uniform block")
                    } else {
                        format!("{type_name} uniforms are not available on WebGL")
                    });
                };
                scanned.samplers.push(SamplerUniform {
                    slot: slot_of(&layout, name)?,
                    name: name.to_string(),
                    type_name: type_name.to_string(),
                    gl_type,
                });
                scanned.items.push(Item::Sampler(scanned.samplers.len() - 1));
            }
            "in" if body == [Token::Punct(';')] => {
                if layout.keys().any(|k| k.starts_with("local_size")) {
                    return Err("compute shaders are not available on WebGL".to_string());
                }
                return Err("empty input declaration".to_string());
            }
            "in" | "out" => {
                let mut tokens = qualifiers.to_vec();
                tokens.extend_from_slice(body);
                let variable = parse_variable(&tokens, layout.get("location").copied().flatten())?;
                if storage == "in" {
                    scanned.inputs.push(variable);
                    scanned.items.push(Item::Input(scanned.inputs.len() - 1));
                } else {
                    scanned.outputs.push(variable);
                    scanned.items.push(Item::Output(scanned.outputs.len() - 1));
                }
            }
            _ => scanned.items.push(Item::Verbatim(text)),
        }
    }
    if stage == StageKind::Vertex {
        if let Some(v) = scanned.inputs.iter().find(|v| v.location.is_none()) {
            return Err(format!("vertex input {} needs a layout(location = N) qualifier", v.name));
        }
    }
    if stage == StageKind::Fragment {
        if let Some(v) = scanned.outputs.iter().find(|v| v.location.is_none()) {
            return Err(format!("fragment output {} needs a layout(location = N) qualifier", v.name));
        }
    }
    Ok(scanned)
}

/// Copies `text`, letting `map` replace identifiers.  `map` sees the identifier and the text
/// after it, and returns the replacement plus how many following bytes it consumed.
fn rewrite_idents(text: &str, mut map: impl FnMut(&str, &str) -> Option<(String, usize)>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    let bytes = text.as_bytes();
    let mut after_dot = false;
    while i < text.len() {
        let c = bytes[i] as char;
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < text.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            let word = &text[start..i];
            match (!after_dot).then(|| map(word, &text[i..])).flatten() {
                Some((replacement, consumed)) => {
                    out.push_str(&replacement);
                    i += consumed;
                }
                None => out.push_str(word),
            }
            after_dot = false;
        } else if c.is_ascii_digit() {
            while i < text.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                out.push(bytes[i] as char);
                i += 1;
            }
            after_dot = false;
        } else {
            let ch = text[i..].chars().next().unwrap_or(' ');
            if !ch.is_whitespace() {
                after_dot = ch == '.';
            }
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    out
}

/// `inst . member` at the front of `rest`: the member name and the bytes consumed.
fn member_access(rest: &str) -> Option<(&str, usize)> {
    let trimmed = rest.trim_start();
    let after_dot = trimmed.strip_prefix('.')?.trim_start();
    let len = after_dot
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count();
    (len > 0).then(|| (&after_dot[..len], rest.len() - after_dot.len() + len))
}

/// The first identifier after `(` at the front of `rest`.
fn call_argument(rest: &str) -> Option<&str> {
    let after = rest.trim_start().strip_prefix('(')?.trim_start();
    let len = after
        .bytes()
        .take_while(|b| b.is_ascii_alphanumeric() || *b == b'_')
        .count();
    (len > 0).then(|| &after[..len])
}

const ES3_HEADER: &str = "#version 300 es
precision highp float;
precision highp int;
precision highp sampler2DArray;
precision highp sampler3D;
precision highp sampler2DShadow;
precision highp samplerCubeShadow;
precision highp isampler2D;
precision highp usampler2D;
";

const ES1_HEADER: &str = "#version 100
precision highp float;
";

impl ScannedStage {
    /// Emits GLSL ES for `version`.
    pub(crate) fn lower(&self, version: GlVersion) -> Result<String, String> {
        match version {
            GlVersion::WebGl2 => Ok(self.lower_es3()),
            GlVersion::WebGl1 => self.lower_es1(),
        }
    }

    fn lower_es3(&self) -> String {
        let mut out = String::from(ES3_HEADER);
        for item in &self.items {
            match item {
                Item::Directive(line) => {
                    out.push_str(line);
                    out.push('\n');
                }
                Item::Block(i) => {
                    let block = &self.blocks[*i];
                    out.push_str(&format!("layout(std140) uniform {} {{\n", block.block_name));
                    for m in &block.members {
                        let array = m.array_len.map(|n| format!("[{n}]")).unwrap_or_default();
                        out.push_str(&format!("    {} {}{};\n", m.type_name, m.name, array));
                    }
                    match &block.instance {
                        Some(instance) => out.push_str(&format!("}} {instance};\n")),
                        None => out.push_str("};\n"),
                    }
                }
                Item::Sampler(i) => {
                    let s = &self.samplers[*i];
                    out.push_str(&format!("uniform {} {};\n", s.type_name, s.name));
                }
                Item::Input(i) => {
                    out.push_str(&self.es3_variable(&self.inputs[*i], "in"));
                }
                Item::Output(i) => {
                    out.push_str(&self.es3_variable(&self.outputs[*i], "out"));
                }
                Item::Verbatim(text) => {
                    out.push_str(&rewrite_idents(text, |word, _| match word {
                        "gl_VertexIndex" => Some(("gl_VertexID".to_string(), 0)),
                        "gl_InstanceIndex" => Some(("gl_InstanceID".to_string(), 0)),
                        _ => None,
                    }));
                }
            }
        }
        out
    }

    fn es3_variable(&self, v: &StageVariable, storage: &str) -> String {
        // locations survive only on vertex inputs and fragment outputs
        let keeps_location = matches!(
            (self.stage, storage),
            (StageKind::Vertex, "in") | (StageKind::Fragment, "out")
        );
        let mut line = String::new();
        if let (true, Some(location)) = (keeps_location, v.location) {
            line.push_str(&format!("layout(location = {location}) "));
        }
        if let Some(interpolation) = &v.interpolation {
            line.push_str(interpolation);
            line.push(' ');
        }
        line.push_str(&format!(
            "{storage} {} {}{};\n",
            v.type_name,
            v.name,
            v.array.as_deref().unwrap_or_default()
        ));
        line
    }

    fn lower_es1(&self) -> Result<String, String> {
        let mut out = String::from(ES1_HEADER);
        if self.stage == StageKind::Fragment && self.outputs.len() > 1 {
            return Err("WebGL1 fragment shaders have a single output".to_string());
        }
        let frag_output = match self.stage {
            StageKind::Fragment => self.outputs.first().map(|v| v.name.as_str()),
            _ => None,
        };
        let instances: HashMap<&str, &UniformBlock> = self
            .blocks
            .iter()
            .filter_map(|b| b.instance.as_deref().map(|i| (i, b)))
            .collect();
        let samplers: HashMap<&str, &SamplerUniform> =
            self.samplers.iter().map(|s| (s.name.as_str(), s)).collect();

        for item in &self.items {
            match item {
                Item::Directive(line) => {
                    out.push_str(line);
                    out.push('\n');
                }
                Item::Block(i) => {
                    let block = &self.blocks[*i];
                    for m in &block.members {
                        if m.ty.needs_webgl2() {
                            return Err(format!(
                                "{} {} is not available in GLSL ES 1.00",
                                m.type_name, m.name
                            ));
                        }
                        let array = m.array_len.map(|n| format!("[{n}]")).unwrap_or_default();
                        out.push_str(&format!(
                            "uniform {} {}{};\n",
                            m.type_name,
                            block.lowered_name(m),
                            array
                        ));
                    }
                }
                Item::Sampler(i) => {
                    let s = &self.samplers[*i];
                    if s.gl_type != types::SAMPLER_2D && s.gl_type != types::SAMPLER_CUBE {
                        return Err(format!("{} is not available in GLSL ES 1.00", s.type_name));
                    }
                    out.push_str(&format!("uniform {} {};\n", s.type_name, s.name));
                }
                Item::Input(i) => {
                    let v = &self.inputs[*i];
                    if v.ty.class == GlslClass::Uint || v.ty.class == GlslClass::Int {
                        return Err(format!("integer input {} is not available in GLSL ES 1.00", v.name));
                    }
                    let storage = match self.stage {
                        StageKind::Vertex => "attribute",
                        _ => "varying",
                    };
                    out.push_str(&format!(
                        "{storage} {} {}{};\n",
                        v.type_name,
                        v.name,
                        v.array.as_deref().unwrap_or_default()
                    ));
                }
                Item::Output(i) => {
                    let v = &self.outputs[*i];
                    if self.stage == StageKind::Vertex {
                        out.push_str(&format!(
                            "varying {} {}{};\n",
                            v.type_name,
                            v.name,
                            v.array.as_deref().unwrap_or_default()
                        ));
                    }
                }
                Item::Verbatim(text) => {
                    let mut failure = None;
                    let lowered = rewrite_idents(text, |word, rest| {
                        if Some(word) == frag_output {
                            return Some(("gl_FragColor".to_string(), 0));
                        }
                        if let Some(block) = instances.get(word) {
                            let (member, consumed) = member_access(rest)?;
                            let m = block.members.iter().find(|m| m.name == member)?;
                            return Some((block.lowered_name(m), consumed));
                        }
                        match word {
                            "texture" => {
                                let sampler = samplers.get(call_argument(rest)?)?;
                                let f = if sampler.gl_type == types::SAMPLER_CUBE {
                                    "textureCube"
                                } else {
                                    "texture2D"
                                };
                                Some((f.to_string(), 0))
                            }
                            "gl_VertexIndex" | "gl_InstanceIndex" | "uint" | "uvec2" | "uvec3"
                            | "uvec4" => {
                                failure = Some(format!("{word} is not available in GLSL ES 1.00"));
                                None
                            }
                            _ => None,
                        }
                    });
                    if let Some(failure) = failure {
                        return Err(failure);
                    }
                    out.push_str(&lowered);
                }
            }
        }
        Ok(out)
    }

    /// Attribute locations to bind before linking.
    pub(crate) fn attribute_locations(&self) -> Vec<(u32, String)> {
        self.inputs
            .iter()
            .filter_map(|v| v.location.map(|l| (l, v.name.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTEX: &str = "#version 450
// transforms
layout(set = 0, binding = 0) uniform Globals {
    mat4 transform;
    vec3 tint;
    float scale;
    vec2 offsets[3];
} globals;
layout(location = 0) in vec2 position;
layout(location = 1) in vec4 color;
layout(location = 0) out vec4 v_color;

void main() {
    v_color = color * vec4(globals.tint, 1.0);
    gl_Position = globals.transform * vec4(position * globals.scale, 0.0, 1.0);
}
";

    const FRAGMENT: &str = "#version 450
layout(set = 0, binding = 1) uniform sampler2D image;
layout(location = 0) in vec4 v_color;
layout(location = 0) out vec4 frag;
void main() {
    frag = texture(image, vec2(0.5)) * v_color;
}
";

    #[test]
    fn std140_offsets() {
        let scanned = scan(StageKind::Vertex, VERTEX).unwrap();
        let block = &scanned.blocks[0];
        let offsets: Vec<u32> = block.members.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![0, 64, 76, 80]);
        assert_eq!(block.members[3].stride(), 16);
        assert_eq!(block.size, 128);
        assert_eq!(block.slot, BindingSlot::new(0, 0));
        assert_eq!(
            scanned.attribute_locations(),
            vec![(0, "position".to_string()), (1, "color".to_string())]
        );
    }

    #[test]
    fn lowers_to_es3() {
        let scanned = scan(StageKind::Vertex, VERTEX).unwrap();
        let es3 = scanned.lower(GlVersion::WebGl2).unwrap();
        assert!(es3.starts_with("#version 300 es"));
        assert!(es3.contains("layout(std140) uniform Globals {"));
        assert!(es3.contains("} globals;"));
        assert!(es3.contains("layout(location = 0) in vec2 position;"));
        assert!(es3.contains("out vec4 v_color;"));
        assert!(!es3.contains("binding"));
    }

    #[test]
    fn lowers_to_es1() {
        let vertex = scan(StageKind::Vertex, VERTEX).unwrap().lower(GlVersion::WebGl1).unwrap();
        assert!(vertex.starts_with("#version 100"));
        assert!(vertex.contains("uniform mat4 globals_transform;"));
        assert!(vertex.contains("uniform vec2 globals_offsets[3];"));
        assert!(vertex.contains("attribute vec2 position;"));
        assert!(vertex.contains("varying vec4 v_color;"));
        assert!(vertex.contains("vec4(globals_tint, 1.0)"));
        assert!(!vertex.contains("globals."));

        let fragment = scan(StageKind::Fragment, FRAGMENT)
            .unwrap()
            .lower(GlVersion::WebGl1)
            .unwrap();
        assert!(fragment.contains("gl_FragColor = texture2D(image, vec2(0.5)) * v_color;"));
        assert!(fragment.contains("varying vec4 v_color;"));
    }

    #[test]
    fn rejects_what_webgl_lacks() {
        let loose = "#version 450\nlayout(binding = 0) uniform float x;\nvoid main() {}\n";
        assert!(scan(StageKind::Fragment, loose).unwrap_err().contains("uniform block"));
        let storage = "#version 450\nlayout(binding = 0) buffer B { float v[]; };\nvoid main() {}\n";
        assert!(scan(StageKind::Compute, storage).is_err());
        let compute = "#version 450\nlayout(local_size_x = 64) in;\nvoid main() {}\n";
        assert!(scan(StageKind::Compute, compute).unwrap_err().contains("compute"));
        let uint_block = "#version 450\nlayout(binding = 0) uniform P { uint n; } p;\nvoid main() {}\n";
        let scanned = scan(StageKind::Fragment, uint_block).unwrap();
        assert!(scanned.lower(GlVersion::WebGl1).is_err());
        assert!(scanned.lower(GlVersion::WebGl2).is_ok());
    }

    #[test]
    fn swizzles_are_not_rewritten() {
        let text = "void main() { frag.x = color.frag; }";
        let out = rewrite_idents(text, |w, _| (w == "frag").then(|| ("gl_FragColor".to_string(), 0)));
        assert_eq!(out, "void main() { gl_FragColor.x = color.frag; }");
    }
}
