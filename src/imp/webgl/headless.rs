// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
An in-memory [`GlContext`].

`HeadlessGl` keeps enough state to run the WebGL backend without a browser: buffer and texture
memory, framebuffer attachments (clears and blits write real texels), programs and their
uniform values.  It does not rasterize; draws are only counted.

Every native call is counted by name, which is how tests check that redundant uniform uploads
are skipped.  The context can be lost and restored on demand.
*/

use super::context::{
    ActiveUniform, BufferTarget, GlAttachment, GlContext, GlVersion, GlVertexAttrib,
};
use super::glsl::{self, GlslType};
use crate::error::StageKind;
use crate::format::{IndexFormat, TextureFormat};
use crate::pipeline::{MegaStateDescriptor, PrimitiveTopology};
use crate::resources::{SamplerDescriptor, TextureDescriptor};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
enum UniformValue {
    Floats(Vec<f32>),
    Ints(Vec<i32>),
    Uints(Vec<u32>),
}

#[derive(Debug, Default)]
struct HeadlessTexture {
    desc: Option<TextureDescriptor>,
    levels: Vec<Vec<u8>>,
}

#[derive(Debug, Default, Clone)]
struct Framebuffer {
    colors: Vec<GlAttachment>,
    depth_stencil: Option<u32>,
}

#[derive(Debug)]
struct HeadlessProgram {
    uniforms: Vec<ActiveUniform>,
    locations: HashMap<String, u32>,
    blocks: Vec<String>,
    block_bindings: HashMap<String, u32>,
}

#[derive(Debug)]
struct State {
    version: GlVersion,
    lost: bool,
    next_id: u32,
    width: u32,
    height: u32,
    /// Rgba8 pixels of framebuffer 0.
    drawing_buffer: Vec<u8>,
    buffers: HashMap<u32, Vec<u8>>,
    textures: HashMap<u32, HeadlessTexture>,
    samplers: HashMap<u32, SamplerDescriptor>,
    framebuffers: HashMap<u32, Framebuffer>,
    bound_framebuffer: u32,
    shaders: HashMap<u32, String>,
    programs: HashMap<u32, HeadlessProgram>,
    current_program: u32,
    uniform_values: HashMap<u32, UniformValue>,
    /// Polls seen by each fence.
    syncs: HashMap<u32, u32>,
    calls: HashMap<&'static str, usize>,
}

impl State {
    fn new(version: GlVersion, width: u32, height: u32) -> Self {
        State {
            version,
            lost: false,
            next_id: 1,
            width,
            height,
            drawing_buffer: vec![0; width as usize * height as usize * 4],
            buffers: HashMap::new(),
            textures: HashMap::new(),
            samplers: HashMap::new(),
            framebuffers: HashMap::new(),
            bound_framebuffer: 0,
            shaders: HashMap::new(),
            programs: HashMap::new(),
            current_program: 0,
            uniform_values: HashMap::new(),
            syncs: HashMap::new(),
            calls: HashMap::new(),
        }
    }

    fn id(&mut self) -> Option<u32> {
        if self.lost {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(id)
    }

    /// Bytes of attachment `index` of `framebuffer`, and its format.
    fn attachment_mut(&mut self, framebuffer: u32, index: usize) -> Option<(&mut [u8], TextureFormat)> {
        if framebuffer == 0 {
            return (index == 0).then_some((&mut self.drawing_buffer[..], TextureFormat::Rgba8Unorm));
        }
        let attachment = *self.framebuffers.get(&framebuffer)?.colors.get(index)?;
        let texture = self.textures.get_mut(&attachment.texture)?;
        let desc = texture.desc?;
        let level = texture.levels.get_mut(attachment.level as usize)?;
        let layer_len = level.len() / desc.depth.max(1) as usize;
        let start = attachment.layer as usize * layer_len;
        Some((level.get_mut(start..start + layer_len)?, desc.format))
    }
}

/// A cloneable handle to one emulated context.  Clones share state.
#[derive(Debug, Clone)]
pub struct HeadlessGl {
    state: Rc<RefCell<State>>,
}

/// Active uniforms and block names declared by lowered GLSL ES, one declaration per line.
fn reflect(source: &str, uniforms: &mut Vec<ActiveUniform>, blocks: &mut Vec<String>) {
    for line in source.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("layout(std140) uniform ") {
            if let Some(name) = rest.split_whitespace().next() {
                blocks.push(name.to_string());
            }
            continue;
        }
        let Some(rest) = line.strip_prefix("uniform ").and_then(|r| r.strip_suffix(';')) else {
            continue;
        };
        let mut words = rest.split_whitespace();
        let (Some(type_name), Some(declarator)) = (words.next(), words.next()) else {
            continue;
        };
        let (name, size) = match declarator.split_once('[') {
            Some((name, n)) => (
                format!("{name}[0]"),
                n.trim_end_matches(']').parse().unwrap_or(1),
            ),
            None => (declarator.to_string(), 1),
        };
        let gl_type = glsl::sampler_gl_type(type_name)
            .or_else(|| GlslType::parse(type_name).map(|t| t.gl_type));
        if let Some(gl_type) = gl_type {
            if !uniforms.iter().any(|u| u.name == name) {
                uniforms.push(ActiveUniform {
                    name,
                    gl_type,
                    size,
                });
            }
        }
    }
}

fn balanced(source: &str) -> bool {
    let mut depth = 0i64;
    for c in source.chars() {
        match c {
            '{' | '(' => depth += 1,
            '}' | ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            return false;
        }
    }
    depth == 0
}

impl HeadlessGl {
    /// A live context with a `width` x `height` drawing buffer.
    pub fn new(version: GlVersion, width: u32, height: u32) -> Self {
        HeadlessGl {
            state: Rc::new(RefCell::new(State::new(version, width, height))),
        }
    }

    fn count(&self, name: &'static str) -> std::cell::RefMut<'_, State> {
        let mut state = self.state.borrow_mut();
        *state.calls.entry(name).or_default() += 1;
        state
    }

    /// How many times the native call `name` (for example `"uniform_fv"`) was made.
    pub fn calls(&self, name: &str) -> usize {
        self.state.borrow().calls.get(name).copied().unwrap_or(0)
    }

    pub fn reset_counts(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Simulates `WEBGL_lose_context.loseContext()`.  Every object is gone.
    pub fn lose_context(&self) {
        let mut state = self.state.borrow_mut();
        let (version, width, height) = (state.version, state.width, state.height);
        let calls = std::mem::take(&mut state.calls);
        *state = State::new(version, width, height);
        state.lost = true;
        state.calls = calls;
    }

    /// Simulates `restoreContext()`.  The context is live and empty.
    pub fn restore_context(&self) {
        self.state.borrow_mut().lost = false;
    }

    fn uniform_value(&self, name: &str) -> Option<UniformValue> {
        let state = self.state.borrow();
        let mut programs: Vec<&u32> = state.programs.keys().collect();
        // the current program wins, then the newest
        programs.sort_by_key(|id| (**id != state.current_program, std::cmp::Reverse(**id)));
        programs.into_iter().find_map(|id| {
            let location = state.programs[id].locations.get(name)?;
            state.uniform_values.get(location).cloned()
        })
    }

    /// Last value set on the float or matrix uniform `name`.
    pub fn uniform_floats(&self, name: &str) -> Option<Vec<f32>> {
        match self.uniform_value(name)? {
            UniformValue::Floats(v) => Some(v),
            _ => None,
        }
    }

    /// Last value set on the int, bool or sampler uniform `name`.
    pub fn uniform_ints(&self, name: &str) -> Option<Vec<i32>> {
        match self.uniform_value(name)? {
            UniformValue::Ints(v) => Some(v),
            _ => None,
        }
    }

    pub fn uniform_uints(&self, name: &str) -> Option<Vec<u32>> {
        match self.uniform_value(name)? {
            UniformValue::Uints(v) => Some(v),
            _ => None,
        }
    }

    /// Rgba8 contents of the default framebuffer.
    pub fn drawing_buffer(&self) -> Vec<u8> {
        self.state.borrow().drawing_buffer.clone()
    }

    /// Binding point assigned to uniform block `block` of the current program.
    pub fn block_binding(&self, block: &str) -> Option<u32> {
        let state = self.state.borrow();
        state
            .programs
            .get(&state.current_program)?
            .block_bindings
            .get(block)
            .copied()
    }

    /// Number of live native objects of every kind.
    pub fn live_objects(&self) -> usize {
        let state = self.state.borrow();
        state.buffers.len()
            + state.textures.len()
            + state.samplers.len()
            + state.framebuffers.len()
            + state.shaders.len()
            + state.programs.len()
    }

    fn set_uniform(&self, name: &'static str, location: u32, value: UniformValue) {
        let mut state = self.count(name);
        if !state.lost {
            state.uniform_values.insert(location, value);
        }
    }
}

impl GlContext for HeadlessGl {
    fn version(&self) -> GlVersion {
        self.state.borrow().version
    }

    fn is_context_lost(&self) -> bool {
        self.state.borrow().lost
    }

    fn max_texture_size(&self) -> u32 {
        4096
    }

    fn max_vertex_attribs(&self) -> u32 {
        16
    }

    fn max_draw_buffers(&self) -> u32 {
        match self.version() {
            GlVersion::WebGl1 => 1,
            GlVersion::WebGl2 => 4,
        }
    }

    fn max_samples(&self) -> u32 {
        match self.version() {
            GlVersion::WebGl1 => 1,
            GlVersion::WebGl2 => 4,
        }
    }

    fn max_uniform_block_size(&self) -> u64 {
        16384
    }

    fn uniform_buffer_offset_alignment(&self) -> u64 {
        256
    }

    fn create_buffer(&self, _target: BufferTarget) -> Option<u32> {
        let mut state = self.count("create_buffer");
        let id = state.id()?;
        state.buffers.insert(id, Vec::new());
        Some(id)
    }

    fn delete_buffer(&self, buffer: u32) {
        self.count("delete_buffer").buffers.remove(&buffer);
    }

    fn buffer_data(&self, buffer: u32, size: usize, data: Option<&[u8]>, _dynamic: bool) {
        let mut state = self.count("buffer_data");
        if let Some(b) = state.buffers.get_mut(&buffer) {
            *b = vec![0; size];
            if let Some(data) = data {
                let n = data.len().min(size);
                b[..n].copy_from_slice(&data[..n]);
            }
        }
    }

    fn buffer_sub_data(&self, buffer: u32, offset: usize, data: &[u8]) {
        let mut state = self.count("buffer_sub_data");
        if let Some(dst) = state
            .buffers
            .get_mut(&buffer)
            .and_then(|b| b.get_mut(offset..offset + data.len()))
        {
            dst.copy_from_slice(data);
        }
    }

    fn get_buffer_sub_data(&self, buffer: u32, offset: usize, dst: &mut [u8]) {
        let state = self.count("get_buffer_sub_data");
        if let Some(src) = state
            .buffers
            .get(&buffer)
            .and_then(|b| b.get(offset..offset + dst.len()))
        {
            dst.copy_from_slice(src);
        }
    }

    fn fence_sync(&self) -> u32 {
        let mut state = self.count("fence_sync");
        let Some(id) = state.id() else {
            return 0;
        };
        state.syncs.insert(id, 0);
        id
    }

    /// Signals on the second query, so readbacks exercise their pending path once.
    fn sync_signaled(&self, sync: u32) -> bool {
        let mut state = self.count("sync_signaled");
        match state.syncs.get_mut(&sync) {
            Some(polls) => {
                *polls += 1;
                *polls >= 2
            }
            None => false,
        }
    }

    fn delete_sync(&self, sync: u32) {
        self.count("delete_sync").syncs.remove(&sync);
    }

    fn create_texture(&self) -> Option<u32> {
        let mut state = self.count("create_texture");
        let id = state.id()?;
        state.textures.insert(id, HeadlessTexture::default());
        Some(id)
    }

    fn delete_texture(&self, texture: u32) {
        self.count("delete_texture").textures.remove(&texture);
    }

    fn tex_storage(&self, texture: u32, desc: &TextureDescriptor) {
        let mut state = self.count("tex_storage");
        if let Some(t) = state.textures.get_mut(&texture) {
            t.desc = Some(*desc);
            t.levels = (0..desc.mip_levels)
                .map(|level| vec![0; desc.level_byte_len(level)])
                .collect();
        }
    }

    fn tex_sub_image(&self, texture: u32, level: u32, data: &[u8]) {
        let mut state = self.count("tex_sub_image");
        if let Some(dst) = state
            .textures
            .get_mut(&texture)
            .and_then(|t| t.levels.get_mut(level as usize))
            .filter(|l| l.len() == data.len())
        {
            dst.copy_from_slice(data);
        }
    }

    fn tex_parameters(&self, _texture: u32, _sampler: &SamplerDescriptor) {
        self.count("tex_parameters");
    }

    fn create_sampler(&self) -> Option<u32> {
        let mut state = self.count("create_sampler");
        let id = state.id()?;
        state.samplers.insert(id, SamplerDescriptor::default());
        Some(id)
    }

    fn delete_sampler(&self, sampler: u32) {
        self.count("delete_sampler").samplers.remove(&sampler);
    }

    fn sampler_parameters(&self, sampler: u32, desc: &SamplerDescriptor) {
        let mut state = self.count("sampler_parameters");
        if let Some(s) = state.samplers.get_mut(&sampler) {
            *s = *desc;
        }
    }

    fn create_framebuffer(&self) -> Option<u32> {
        let mut state = self.count("create_framebuffer");
        let id = state.id()?;
        state.framebuffers.insert(id, Framebuffer::default());
        Some(id)
    }

    fn delete_framebuffer(&self, framebuffer: u32) {
        self.count("delete_framebuffer").framebuffers.remove(&framebuffer);
    }

    fn bind_framebuffer(&self, framebuffer: u32, colors: &[GlAttachment], depth_stencil: Option<u32>) {
        let mut state = self.count("bind_framebuffer");
        state.bound_framebuffer = framebuffer;
        if let Some(fb) = state.framebuffers.get_mut(&framebuffer) {
            fb.colors = colors.to_vec();
            fb.depth_stencil = depth_stencil;
        }
    }

    fn clear_color(&self, index: u32, rgba: [f64; 4]) {
        let mut state = self.count("clear_color");
        let framebuffer = state.bound_framebuffer;
        if let Some((bytes, format)) = state.attachment_mut(framebuffer, index as usize) {
            let texel = format.encode_color(rgba);
            for chunk in bytes.chunks_exact_mut(texel.len()) {
                chunk.copy_from_slice(&texel);
            }
        }
    }

    fn clear_depth_stencil(&self, _depth: Option<f32>, _stencil: Option<u32>) {
        self.count("clear_depth_stencil");
    }

    fn blit_framebuffer(&self, from: u32, to: u32, _width: u32, _height: u32) {
        let mut state = self.count("blit_framebuffer");
        let Some((src, _)) = state.attachment_mut(from, 0) else {
            return;
        };
        let src = src.to_vec();
        if let Some((dst, _)) = state.attachment_mut(to, 0) {
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
    }

    fn read_pixels(&self, framebuffer: u32, _width: u32, _height: u32, _format: TextureFormat, dst: &mut [u8]) {
        let mut state = self.count("read_pixels");
        if let Some((src, _)) = state.attachment_mut(framebuffer, 0) {
            let n = dst.len().min(src.len());
            dst[..n].copy_from_slice(&src[..n]);
        }
    }

    fn resize_drawing_buffer(&self, width: u32, height: u32) {
        let mut state = self.count("resize_drawing_buffer");
        state.width = width;
        state.height = height;
        state.drawing_buffer = vec![0; width as usize * height as usize * 4];
    }

    fn compile_shader(&self, stage: StageKind, source: &str) -> Result<u32, String> {
        let mut state = self.count("compile_shader");
        if state.lost {
            return Err("context lost".to_string());
        }
        let expected = match state.version {
            GlVersion::WebGl1 => "#version 100",
            GlVersion::WebGl2 => "#version 300 es",
        };
        if !source.starts_with(expected) {
            return Err(format!("ERROR: 0:1: '{stage}' : expected {expected}"));
        }
        if let Some(line) = source.lines().find(|l| l.trim_start().starts_with("#error")) {
            return Err(format!("ERROR: 0:0: {}", line.trim()));
        }
        if !source.contains("void main") {
            return Err("ERROR: 0:0: missing main()".to_string());
        }
        if !balanced(source) {
            return Err("ERROR: 0:0: syntax error, unbalanced brackets".to_string());
        }
        let id = state.id().ok_or("context lost")?;
        state.shaders.insert(id, source.to_string());
        Ok(id)
    }

    fn delete_shader(&self, shader: u32) {
        self.count("delete_shader").shaders.remove(&shader);
    }

    fn link_program(&self, vertex: u32, fragment: u32, _attributes: &[(u32, String)]) -> Result<u32, String> {
        let mut state = self.count("link_program");
        let (Some(vs), Some(fs)) = (state.shaders.get(&vertex), state.shaders.get(&fragment)) else {
            return Err("invalid shader".to_string());
        };
        let mut uniforms = Vec::new();
        let mut blocks = Vec::new();
        reflect(vs, &mut uniforms, &mut blocks);
        reflect(fs, &mut uniforms, &mut blocks);
        blocks.dedup();
        let mut locations = HashMap::new();
        for uniform in &uniforms {
            let location = state.id().ok_or("context lost")?;
            let base = uniform.name.trim_end_matches("[0]").to_string();
            locations.insert(base, location);
            locations.insert(uniform.name.clone(), location);
        }
        let id = state.id().ok_or("context lost")?;
        state.programs.insert(
            id,
            HeadlessProgram {
                uniforms,
                locations,
                blocks,
                block_bindings: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn delete_program(&self, program: u32) {
        let mut state = self.count("delete_program");
        if let Some(p) = state.programs.remove(&program) {
            for location in p.locations.values() {
                state.uniform_values.remove(location);
            }
        }
    }

    fn use_program(&self, program: u32) {
        self.count("use_program").current_program = program;
    }

    fn active_uniforms(&self, program: u32) -> Vec<ActiveUniform> {
        self.count("active_uniforms")
            .programs
            .get(&program)
            .map(|p| p.uniforms.clone())
            .unwrap_or_default()
    }

    fn uniform_location(&self, program: u32, name: &str) -> Option<u32> {
        self.count("uniform_location")
            .programs
            .get(&program)?
            .locations
            .get(name)
            .copied()
    }

    fn uniform_block_binding(&self, program: u32, block: &str, binding: u32) -> bool {
        let mut state = self.count("uniform_block_binding");
        match state.programs.get_mut(&program) {
            Some(p) if p.blocks.iter().any(|b| b == block) => {
                p.block_bindings.insert(block.to_string(), binding);
                true
            }
            _ => false,
        }
    }

    fn uniform_fv(&self, location: u32, _components: u32, values: &[f32]) {
        self.set_uniform("uniform_fv", location, UniformValue::Floats(values.to_vec()));
    }

    fn uniform_iv(&self, location: u32, _components: u32, values: &[i32]) {
        self.set_uniform("uniform_iv", location, UniformValue::Ints(values.to_vec()));
    }

    fn uniform_uiv(&self, location: u32, _components: u32, values: &[u32]) {
        self.set_uniform("uniform_uiv", location, UniformValue::Uints(values.to_vec()));
    }

    fn uniform_matrix_fv(&self, location: u32, _columns: u32, _rows: u32, values: &[f32]) {
        self.set_uniform("uniform_matrix_fv", location, UniformValue::Floats(values.to_vec()));
    }

    fn bind_buffer_range(&self, _index: u32, _buffer: u32, _offset: u64, _size: u64) {
        self.count("bind_buffer_range");
    }

    fn bind_texture_unit(&self, _unit: u32, _texture: u32, _sampler: Option<u32>) {
        self.count("bind_texture_unit");
    }

    fn apply_state(&self, _state: &MegaStateDescriptor) {
        self.count("apply_state");
    }

    fn vertex_attribs(&self, _attributes: &[GlVertexAttrib]) {
        self.count("vertex_attribs");
    }

    fn viewport(&self, _x: f32, _y: f32, _width: f32, _height: f32, _min_depth: f32, _max_depth: f32) {
        self.count("viewport");
    }

    fn draw_arrays(&self, _topology: PrimitiveTopology, _first: u32, _count: u32, _instances: u32) {
        self.count("draw_arrays");
    }

    fn draw_elements(
        &self,
        _topology: PrimitiveTopology,
        _index_buffer: u32,
        _format: IndexFormat,
        _byte_offset: u64,
        _count: u32,
        _instances: u32,
    ) {
        self.count("draw_elements");
    }

    fn flush(&self) {
        self.count("flush");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::TextureUsage;

    #[test]
    fn clears_write_texels() {
        let gl = HeadlessGl::new(GlVersion::WebGl2, 2, 2);
        let texture = gl.create_texture().unwrap();
        let desc = TextureDescriptor::new_2d(
            TextureFormat::Rgba8Unorm,
            2,
            2,
            TextureUsage::RENDER_TARGET,
        );
        gl.tex_storage(texture, &desc);
        let fb = gl.create_framebuffer().unwrap();
        let attachment = GlAttachment {
            texture,
            level: 0,
            layer: 0,
        };
        gl.bind_framebuffer(fb, &[attachment], None);
        gl.clear_color(0, [1.0, 0.0, 0.0, 1.0]);
        let mut out = vec![0; 16];
        gl.read_pixels(fb, 2, 2, TextureFormat::Rgba8Unorm, &mut out);
        assert_eq!(&out[..4], &[255, 0, 0, 255]);
        assert_eq!(gl.calls("clear_color"), 1);
    }

    #[test]
    fn loss_drops_everything() {
        let gl = HeadlessGl::new(GlVersion::WebGl1, 2, 2);
        gl.create_buffer(BufferTarget::Array).unwrap();
        assert_eq!(gl.live_objects(), 1);
        gl.lose_context();
        assert!(gl.is_context_lost());
        assert_eq!(gl.live_objects(), 0);
        assert!(gl.create_buffer(BufferTarget::Array).is_none());
        gl.restore_context();
        assert!(gl.create_buffer(BufferTarget::Array).is_some());
    }

    #[test]
    fn fences_signal_on_second_poll() {
        let gl = HeadlessGl::new(GlVersion::WebGl2, 1, 1);
        let sync = gl.fence_sync();
        assert!(!gl.sync_signaled(sync));
        assert!(gl.sync_signaled(sync));
    }
}
