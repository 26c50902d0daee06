// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! [`GlContext`] over a browser `WebGLRenderingContext` or `WebGL2RenderingContext`.

use super::context::{
    ActiveUniform, BufferTarget, GlAttachment, GlContext, GlVersion, GlVertexAttrib,
};
use crate::error::StageKind;
use crate::format::{IndexFormat, TextureFormat, VertexFormat};
use crate::pipeline::{
    BlendFactor, BlendOperation, CullMode, FrontFace, MegaStateDescriptor, PrimitiveTopology,
    StencilFaceState, StencilOperation,
};
use crate::resources::{
    AddressMode, CompareFunction, FilterMode, SamplerDescriptor, TextureDescriptor,
    TextureDimension,
};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::{
    HtmlCanvasElement, WebGl2RenderingContext as Gl2, WebGlBuffer, WebGlFramebuffer, WebGlProgram,
    WebGlRenderbuffer, WebGlRenderingContext as Gl1, WebGlSampler, WebGlShader, WebGlSync,
    WebGlTexture, WebGlUniformLocation,
};

enum Gl {
    One(Gl1),
    Two(Gl2),
}

/// Calls a method both context types share.
macro_rules! both {
    ($gl:expr, $g:ident => $call:expr) => {
        match $gl {
            Gl::One($g) => $call,
            Gl::Two($g) => $call,
        }
    };
}

enum Storage {
    Texture { texture: WebGlTexture, target: u32 },
    Renderbuffer(WebGlRenderbuffer),
}

struct NativeTexture {
    storage: Option<Storage>,
    desc: Option<TextureDescriptor>,
}

#[derive(Default)]
struct Objects {
    next: u32,
    buffers: HashMap<u32, (WebGlBuffer, u32)>,
    textures: HashMap<u32, NativeTexture>,
    samplers: HashMap<u32, WebGlSampler>,
    framebuffers: HashMap<u32, WebGlFramebuffer>,
    shaders: HashMap<u32, WebGlShader>,
    programs: HashMap<u32, WebGlProgram>,
    locations: HashMap<u32, WebGlUniformLocation>,
    syncs: HashMap<u32, WebGlSync>,
    enabled_attribs: HashSet<u32>,
}

impl Objects {
    fn id(&mut self) -> u32 {
        self.next += 1;
        self.next
    }
}

struct WebSysContext {
    gl: Gl,
    canvas: HtmlCanvasElement,
    objects: RefCell<Objects>,
}

/// Creates a context of `version` on `canvas`.
pub(crate) fn create(
    canvas: &HtmlCanvasElement,
    version: GlVersion,
    antialias: bool,
) -> Result<Rc<dyn GlContext>, String> {
    let options = js_sys::Object::new();
    js_sys::Reflect::set(&options, &"antialias".into(), &antialias.into())
        .map_err(|e| format!("{e:?}"))?;
    js_sys::Reflect::set(&options, &"preserveDrawingBuffer".into(), &true.into())
        .map_err(|e| format!("{e:?}"))?;
    let name = match version {
        GlVersion::WebGl1 => "webgl",
        GlVersion::WebGl2 => "webgl2",
    };
    let context = canvas
        .get_context_with_context_options(name, &options)
        .map_err(|e| format!("{e:?}"))?
        .ok_or_else(|| format!("the browser has no {name} context"))?;
    let gl = match version {
        GlVersion::WebGl1 => Gl::One(context.dyn_into::<Gl1>().map_err(|e| format!("{e:?}"))?),
        GlVersion::WebGl2 => Gl::Two(context.dyn_into::<Gl2>().map_err(|e| format!("{e:?}"))?),
    };
    Ok(Rc::new(WebSysContext {
        gl,
        canvas: canvas.clone(),
        objects: RefCell::new(Objects::default()),
    }))
}

/// `(internal format, format, type)` for a texture upload.
fn texel_layout(format: TextureFormat, webgl2: bool) -> (u32, u32, u32) {
    use TextureFormat::*;
    match format {
        Rgba8Unorm | Bgra8Unorm if !webgl2 => (Gl1::RGBA, Gl1::RGBA, Gl1::UNSIGNED_BYTE),
        R8Unorm => (Gl2::R8, Gl2::RED, Gl2::UNSIGNED_BYTE),
        Rg8Unorm => (Gl2::RG8, Gl2::RG, Gl2::UNSIGNED_BYTE),
        Rgba8UnormSrgb | Bgra8UnormSrgb => (Gl2::SRGB8_ALPHA8, Gl2::RGBA, Gl2::UNSIGNED_BYTE),
        R16Float => (Gl2::R16F, Gl2::RED, Gl2::HALF_FLOAT),
        Rg16Float => (Gl2::RG16F, Gl2::RG, Gl2::HALF_FLOAT),
        Rgba16Float => (Gl2::RGBA16F, Gl2::RGBA, Gl2::HALF_FLOAT),
        R32Float => (Gl2::R32F, Gl2::RED, Gl2::FLOAT),
        Rg32Float => (Gl2::RG32F, Gl2::RG, Gl2::FLOAT),
        Rgba32Float => (Gl2::RGBA32F, Gl2::RGBA, Gl2::FLOAT),
        R32Uint => (Gl2::R32UI, Gl2::RED_INTEGER, Gl2::UNSIGNED_INT),
        R32Sint => (Gl2::R32I, Gl2::RED_INTEGER, Gl2::INT),
        Rgba32Uint => (Gl2::RGBA32UI, Gl2::RGBA_INTEGER, Gl2::UNSIGNED_INT),
        Depth16Unorm => (Gl2::DEPTH_COMPONENT16, Gl2::DEPTH_COMPONENT, Gl2::UNSIGNED_SHORT),
        Depth24Plus => (Gl2::DEPTH_COMPONENT24, Gl2::DEPTH_COMPONENT, Gl2::UNSIGNED_INT),
        Depth24PlusStencil8 => (
            Gl2::DEPTH24_STENCIL8,
            Gl2::DEPTH_STENCIL,
            Gl2::UNSIGNED_INT_24_8,
        ),
        Depth32Float => (Gl2::DEPTH_COMPONENT32F, Gl2::DEPTH_COMPONENT, Gl2::FLOAT),
        _ => (Gl2::RGBA8, Gl2::RGBA, Gl2::UNSIGNED_BYTE),
    }
}

fn compare(f: CompareFunction) -> u32 {
    match f {
        CompareFunction::Never => Gl1::NEVER,
        CompareFunction::Less => Gl1::LESS,
        CompareFunction::Equal => Gl1::EQUAL,
        CompareFunction::LessEqual => Gl1::LEQUAL,
        CompareFunction::Greater => Gl1::GREATER,
        CompareFunction::NotEqual => Gl1::NOTEQUAL,
        CompareFunction::GreaterEqual => Gl1::GEQUAL,
        CompareFunction::Always => Gl1::ALWAYS,
    }
}

fn blend_factor(f: BlendFactor) -> u32 {
    match f {
        BlendFactor::Zero => Gl1::ZERO,
        BlendFactor::One => Gl1::ONE,
        BlendFactor::Src => Gl1::SRC_COLOR,
        BlendFactor::OneMinusSrc => Gl1::ONE_MINUS_SRC_COLOR,
        BlendFactor::SrcAlpha => Gl1::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => Gl1::ONE_MINUS_SRC_ALPHA,
        BlendFactor::Dst => Gl1::DST_COLOR,
        BlendFactor::OneMinusDst => Gl1::ONE_MINUS_DST_COLOR,
        BlendFactor::DstAlpha => Gl1::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => Gl1::ONE_MINUS_DST_ALPHA,
    }
}

fn blend_operation(op: BlendOperation) -> u32 {
    match op {
        BlendOperation::Add => Gl1::FUNC_ADD,
        BlendOperation::Subtract => Gl1::FUNC_SUBTRACT,
        BlendOperation::ReverseSubtract => Gl1::FUNC_REVERSE_SUBTRACT,
        BlendOperation::Min => Gl2::MIN,
        BlendOperation::Max => Gl2::MAX,
    }
}

fn stencil_op(op: StencilOperation) -> u32 {
    match op {
        StencilOperation::Keep => Gl1::KEEP,
        StencilOperation::Zero => Gl1::ZERO,
        StencilOperation::Replace => Gl1::REPLACE,
        StencilOperation::Invert => Gl1::INVERT,
        StencilOperation::IncrementClamp => Gl1::INCR,
        StencilOperation::DecrementClamp => Gl1::DECR,
        StencilOperation::IncrementWrap => Gl1::INCR_WRAP,
        StencilOperation::DecrementWrap => Gl1::DECR_WRAP,
    }
}

fn topology(t: PrimitiveTopology) -> u32 {
    match t {
        PrimitiveTopology::PointList => Gl1::POINTS,
        PrimitiveTopology::LineList => Gl1::LINES,
        PrimitiveTopology::LineStrip => Gl1::LINE_STRIP,
        PrimitiveTopology::TriangleList => Gl1::TRIANGLES,
        PrimitiveTopology::TriangleStrip => Gl1::TRIANGLE_STRIP,
    }
}

fn address(mode: AddressMode) -> i32 {
    (match mode {
        AddressMode::ClampToEdge => Gl1::CLAMP_TO_EDGE,
        AddressMode::Repeat => Gl1::REPEAT,
        AddressMode::MirrorRepeat => Gl1::MIRRORED_REPEAT,
    }) as i32
}

/// `(mag, min)` filter enums.
fn filters(desc: &SamplerDescriptor, mipmapped: bool) -> (i32, i32) {
    let mag = match desc.mag_filter {
        FilterMode::Nearest => Gl1::NEAREST,
        FilterMode::Linear => Gl1::LINEAR,
    };
    let min = match (desc.min_filter, desc.mipmap_filter, mipmapped) {
        (FilterMode::Nearest, _, false) => Gl1::NEAREST,
        (FilterMode::Linear, _, false) => Gl1::LINEAR,
        (FilterMode::Nearest, FilterMode::Nearest, true) => Gl1::NEAREST_MIPMAP_NEAREST,
        (FilterMode::Nearest, FilterMode::Linear, true) => Gl1::NEAREST_MIPMAP_LINEAR,
        (FilterMode::Linear, FilterMode::Nearest, true) => Gl1::LINEAR_MIPMAP_NEAREST,
        (FilterMode::Linear, FilterMode::Linear, true) => Gl1::LINEAR_MIPMAP_LINEAR,
    };
    (mag as i32, min as i32)
}

/// `(size, type, normalized, integer)` of a vertex attribute.
fn attrib_layout(format: VertexFormat) -> (i32, u32, bool, bool) {
    let components = format.components() as i32;
    match format {
        VertexFormat::Float16x2 | VertexFormat::Float16x4 => {
            (components, Gl2::HALF_FLOAT, false, false)
        }
        VertexFormat::Unorm8x4 => (4, Gl1::UNSIGNED_BYTE, true, false),
        VertexFormat::Uint8x4 => (4, Gl1::UNSIGNED_BYTE, false, true),
        VertexFormat::Uint32
        | VertexFormat::Uint32x2
        | VertexFormat::Uint32x3
        | VertexFormat::Uint32x4 => (components, Gl1::UNSIGNED_INT, false, true),
        VertexFormat::Sint32
        | VertexFormat::Sint32x2
        | VertexFormat::Sint32x3
        | VertexFormat::Sint32x4 => (components, Gl1::INT, false, true),
        _ => (components, Gl1::FLOAT, false, false),
    }
}

impl WebSysContext {
    fn parameter(&self, pname: u32) -> u32 {
        both!(&self.gl, g => g.get_parameter(pname))
            .ok()
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0) as u32
    }

    fn gl2(&self) -> Option<&Gl2> {
        match &self.gl {
            Gl::Two(g) => Some(g),
            Gl::One(_) => None,
        }
    }

    fn bind_texture(&self, id: u32) -> Option<u32> {
        let objects = self.objects.borrow();
        match objects.textures.get(&id)?.storage.as_ref()? {
            Storage::Texture { texture, target } => {
                both!(&self.gl, g => g.bind_texture(*target, Some(texture)));
                Some(*target)
            }
            Storage::Renderbuffer(_) => None,
        }
    }

    fn attach(&self, attachment: u32, id: u32, level: u32, layer: u32) {
        let objects = self.objects.borrow();
        let Some(storage) = objects.textures.get(&id).and_then(|t| t.storage.as_ref()) else {
            return;
        };
        match storage {
            Storage::Renderbuffer(rb) => both!(&self.gl, g => g.framebuffer_renderbuffer(
                Gl1::FRAMEBUFFER,
                attachment,
                Gl1::RENDERBUFFER,
                Some(rb)
            )),
            Storage::Texture { texture, target } => match (*target, &self.gl) {
                (Gl1::TEXTURE_2D, gl) => both!(gl, g => g.framebuffer_texture_2d(
                    Gl1::FRAMEBUFFER,
                    attachment,
                    Gl1::TEXTURE_2D,
                    Some(texture),
                    level as i32
                )),
                (Gl1::TEXTURE_CUBE_MAP, gl) => both!(gl, g => g.framebuffer_texture_2d(
                    Gl1::FRAMEBUFFER,
                    attachment,
                    Gl1::TEXTURE_CUBE_MAP_POSITIVE_X + layer,
                    Some(texture),
                    level as i32
                )),
                (_, Gl::Two(g)) => g.framebuffer_texture_layer(
                    Gl2::FRAMEBUFFER,
                    attachment,
                    Some(texture),
                    level as i32,
                    layer as i32,
                ),
                (_, Gl::One(_)) => {}
            },
        }
    }
}

impl GlContext for WebSysContext {
    fn version(&self) -> GlVersion {
        match self.gl {
            Gl::One(_) => GlVersion::WebGl1,
            Gl::Two(_) => GlVersion::WebGl2,
        }
    }

    fn is_context_lost(&self) -> bool {
        both!(&self.gl, g => g.is_context_lost())
    }

    fn max_texture_size(&self) -> u32 {
        self.parameter(Gl1::MAX_TEXTURE_SIZE)
    }

    fn max_vertex_attribs(&self) -> u32 {
        self.parameter(Gl1::MAX_VERTEX_ATTRIBS)
    }

    fn max_draw_buffers(&self) -> u32 {
        match self.gl {
            Gl::One(_) => 1,
            Gl::Two(_) => self.parameter(Gl2::MAX_DRAW_BUFFERS),
        }
    }

    fn max_samples(&self) -> u32 {
        match self.gl {
            Gl::One(_) => 1,
            Gl::Two(_) => self.parameter(Gl2::MAX_SAMPLES),
        }
    }

    fn max_uniform_block_size(&self) -> u64 {
        match self.gl {
            Gl::One(_) => 0,
            Gl::Two(_) => self.parameter(Gl2::MAX_UNIFORM_BLOCK_SIZE) as u64,
        }
    }

    fn uniform_buffer_offset_alignment(&self) -> u64 {
        match self.gl {
            Gl::One(_) => 4,
            Gl::Two(_) => self.parameter(Gl2::UNIFORM_BUFFER_OFFSET_ALIGNMENT) as u64,
        }
    }

    fn create_buffer(&self, target: BufferTarget) -> Option<u32> {
        let buffer = both!(&self.gl, g => g.create_buffer())?;
        let target = match target {
            BufferTarget::Array => Gl1::ARRAY_BUFFER,
            BufferTarget::ElementArray => Gl1::ELEMENT_ARRAY_BUFFER,
            BufferTarget::Uniform => Gl2::UNIFORM_BUFFER,
        };
        let mut objects = self.objects.borrow_mut();
        let id = objects.id();
        objects.buffers.insert(id, (buffer, target));
        Some(id)
    }

    fn delete_buffer(&self, buffer: u32) {
        if let Some((b, _)) = self.objects.borrow_mut().buffers.remove(&buffer) {
            both!(&self.gl, g => g.delete_buffer(Some(&b)));
        }
    }

    fn buffer_data(&self, buffer: u32, size: usize, data: Option<&[u8]>, dynamic: bool) {
        let objects = self.objects.borrow();
        let Some((b, target)) = objects.buffers.get(&buffer) else {
            return;
        };
        let usage = if dynamic {
            Gl1::DYNAMIC_DRAW
        } else {
            Gl1::STATIC_DRAW
        };
        both!(&self.gl, g => {
            g.bind_buffer(*target, Some(b));
            g.buffer_data_with_i32(*target, size as i32, usage);
            if let Some(data) = data {
                g.buffer_sub_data_with_i32_and_u8_array(*target, 0, data);
            }
        });
    }

    fn buffer_sub_data(&self, buffer: u32, offset: usize, data: &[u8]) {
        let objects = self.objects.borrow();
        let Some((b, target)) = objects.buffers.get(&buffer) else {
            return;
        };
        both!(&self.gl, g => {
            g.bind_buffer(*target, Some(b));
            g.buffer_sub_data_with_i32_and_u8_array(*target, offset as i32, data);
        });
    }

    fn get_buffer_sub_data(&self, buffer: u32, offset: usize, dst: &mut [u8]) {
        let (Some(g), Some((b, _))) = (self.gl2(), self.objects.borrow().buffers.get(&buffer).cloned())
        else {
            return;
        };
        g.bind_buffer(Gl2::COPY_READ_BUFFER, Some(&b));
        g.get_buffer_sub_data_with_i32_and_u8_array(Gl2::COPY_READ_BUFFER, offset as i32, dst);
    }

    fn fence_sync(&self) -> u32 {
        let Some(sync) = self
            .gl2()
            .and_then(|g| g.fence_sync(Gl2::SYNC_GPU_COMMANDS_COMPLETE, 0))
        else {
            return 0;
        };
        let mut objects = self.objects.borrow_mut();
        let id = objects.id();
        objects.syncs.insert(id, sync);
        id
    }

    fn sync_signaled(&self, sync: u32) -> bool {
        let objects = self.objects.borrow();
        let (Some(g), Some(s)) = (self.gl2(), objects.syncs.get(&sync)) else {
            return true;
        };
        let status = g.client_wait_sync_with_u32(s, 0, 0);
        status == Gl2::ALREADY_SIGNALED || status == Gl2::CONDITION_SATISFIED
    }

    fn delete_sync(&self, sync: u32) {
        if let (Some(g), Some(s)) = (self.gl2(), self.objects.borrow_mut().syncs.remove(&sync)) {
            g.delete_sync(Some(&s));
        }
    }

    fn create_texture(&self) -> Option<u32> {
        if self.is_context_lost() {
            return None;
        }
        let mut objects = self.objects.borrow_mut();
        let id = objects.id();
        objects.textures.insert(
            id,
            NativeTexture {
                storage: None,
                desc: None,
            },
        );
        Some(id)
    }

    fn delete_texture(&self, texture: u32) {
        let Some(t) = self.objects.borrow_mut().textures.remove(&texture) else {
            return;
        };
        match t.storage {
            Some(Storage::Texture { texture, .. }) => {
                both!(&self.gl, g => g.delete_texture(Some(&texture)))
            }
            Some(Storage::Renderbuffer(rb)) => {
                both!(&self.gl, g => g.delete_renderbuffer(Some(&rb)))
            }
            None => {}
        }
    }

    fn tex_storage(&self, texture: u32, desc: &TextureDescriptor) {
        let webgl2 = self.gl2().is_some();
        let (internal, format, ty) = texel_layout(desc.format, webgl2);
        let renderbuffer = desc.sample_count > 1 || (!webgl2 && desc.format.is_depth());
        let storage = if renderbuffer {
            let Some(rb) = both!(&self.gl, g => g.create_renderbuffer()) else {
                return;
            };
            match &self.gl {
                Gl::Two(g) => {
                    g.bind_renderbuffer(Gl2::RENDERBUFFER, Some(&rb));
                    g.renderbuffer_storage_multisample(
                        Gl2::RENDERBUFFER,
                        desc.sample_count as i32,
                        internal,
                        desc.width as i32,
                        desc.height as i32,
                    );
                }
                Gl::One(g) => {
                    let internal = if desc.format.has_stencil() {
                        Gl1::DEPTH_STENCIL
                    } else {
                        Gl1::DEPTH_COMPONENT16
                    };
                    g.bind_renderbuffer(Gl1::RENDERBUFFER, Some(&rb));
                    g.renderbuffer_storage(
                        Gl1::RENDERBUFFER,
                        internal,
                        desc.width as i32,
                        desc.height as i32,
                    );
                }
            }
            Storage::Renderbuffer(rb)
        } else {
            let Some(t) = both!(&self.gl, g => g.create_texture()) else {
                return;
            };
            let target = match desc.dimension {
                TextureDimension::D2 => Gl1::TEXTURE_2D,
                TextureDimension::D2Array => Gl2::TEXTURE_2D_ARRAY,
                TextureDimension::Cube => Gl1::TEXTURE_CUBE_MAP,
            };
            match &self.gl {
                Gl::Two(g) => {
                    g.bind_texture(target, Some(&t));
                    if target == Gl2::TEXTURE_2D_ARRAY {
                        g.tex_storage_3d(
                            target,
                            desc.mip_levels as i32,
                            internal,
                            desc.width as i32,
                            desc.height as i32,
                            desc.depth as i32,
                        );
                    } else {
                        g.tex_storage_2d(
                            target,
                            desc.mip_levels as i32,
                            internal,
                            desc.width as i32,
                            desc.height as i32,
                        );
                    }
                }
                Gl::One(g) => {
                    g.bind_texture(target, Some(&t));
                    let faces: Vec<u32> = if target == Gl1::TEXTURE_CUBE_MAP {
                        (0..6).map(|f| Gl1::TEXTURE_CUBE_MAP_POSITIVE_X + f).collect()
                    } else {
                        vec![Gl1::TEXTURE_2D]
                    };
                    for level in 0..desc.mip_levels {
                        let (w, h) = desc.level_size(level);
                        for face in &faces {
                            let _ = g.tex_image_2d_with_i32_and_i32_and_i32_and_format_and_type_and_opt_u8_array(
                                *face,
                                level as i32,
                                internal as i32,
                                w as i32,
                                h as i32,
                                0,
                                format,
                                ty,
                                None,
                            );
                        }
                    }
                }
            }
            Storage::Texture { texture: t, target }
        };
        if let Some(t) = self.objects.borrow_mut().textures.get_mut(&texture) {
            t.storage = Some(storage);
            t.desc = Some(*desc);
        }
    }

    fn tex_sub_image(&self, texture: u32, level: u32, data: &[u8]) {
        let desc = match self.objects.borrow().textures.get(&texture).and_then(|t| t.desc) {
            Some(desc) => desc,
            None => return,
        };
        let Some(target) = self.bind_texture(texture) else {
            return;
        };
        let (_, format, ty) = texel_layout(desc.format, self.gl2().is_some());
        let (w, h) = desc.level_size(level);
        let layer_len = data.len() / desc.depth.max(1) as usize;
        both!(&self.gl, g => g.pixel_storei(Gl1::UNPACK_ALIGNMENT, 1));
        if let (Gl::Two(g), Gl2::TEXTURE_2D_ARRAY) = (&self.gl, target) {
            let _ = g.tex_sub_image_3d_with_opt_u8_array(
                target,
                level as i32,
                0,
                0,
                0,
                w as i32,
                h as i32,
                desc.depth as i32,
                format,
                ty,
                Some(data),
            );
            return;
        }
        for (layer, chunk) in data.chunks_exact(layer_len.max(1)).enumerate() {
            let face = if target == Gl1::TEXTURE_CUBE_MAP {
                Gl1::TEXTURE_CUBE_MAP_POSITIVE_X + layer as u32
            } else {
                target
            };
            let _ = both!(&self.gl, g => g
                .tex_sub_image_2d_with_i32_and_i32_and_u32_and_type_and_opt_u8_array(
                    face,
                    level as i32,
                    0,
                    0,
                    w as i32,
                    h as i32,
                    format,
                    ty,
                    Some(chunk),
                ));
        }
    }

    fn tex_parameters(&self, texture: u32, sampler: &SamplerDescriptor) {
        let mipmapped = self
            .objects
            .borrow()
            .textures
            .get(&texture)
            .and_then(|t| t.desc)
            .is_some_and(|d| d.mip_levels > 1);
        let Some(target) = self.bind_texture(texture) else {
            return;
        };
        let (mag, min) = filters(sampler, mipmapped);
        both!(&self.gl, g => {
            g.tex_parameteri(target, Gl1::TEXTURE_MAG_FILTER, mag);
            g.tex_parameteri(target, Gl1::TEXTURE_MIN_FILTER, min);
            g.tex_parameteri(target, Gl1::TEXTURE_WRAP_S, address(sampler.address_u));
            g.tex_parameteri(target, Gl1::TEXTURE_WRAP_T, address(sampler.address_v));
        });
    }

    fn create_sampler(&self) -> Option<u32> {
        let sampler = self.gl2()?.create_sampler()?;
        let mut objects = self.objects.borrow_mut();
        let id = objects.id();
        objects.samplers.insert(id, sampler);
        Some(id)
    }

    fn delete_sampler(&self, sampler: u32) {
        if let (Some(g), Some(s)) = (self.gl2(), self.objects.borrow_mut().samplers.remove(&sampler)) {
            g.delete_sampler(Some(&s));
        }
    }

    fn sampler_parameters(&self, sampler: u32, desc: &SamplerDescriptor) {
        let objects = self.objects.borrow();
        let (Some(g), Some(s)) = (self.gl2(), objects.samplers.get(&sampler)) else {
            return;
        };
        let (mag, min) = filters(desc, true);
        g.sampler_parameteri(s, Gl2::TEXTURE_MAG_FILTER, mag);
        g.sampler_parameteri(s, Gl2::TEXTURE_MIN_FILTER, min);
        g.sampler_parameteri(s, Gl2::TEXTURE_WRAP_S, address(desc.address_u));
        g.sampler_parameteri(s, Gl2::TEXTURE_WRAP_T, address(desc.address_v));
        g.sampler_parameteri(s, Gl2::TEXTURE_WRAP_R, address(desc.address_w));
        g.sampler_parameterf(s, Gl2::TEXTURE_MIN_LOD, desc.lod_min);
        g.sampler_parameterf(s, Gl2::TEXTURE_MAX_LOD, desc.lod_max);
        if let Some(f) = desc.compare {
            g.sampler_parameteri(
                s,
                Gl2::TEXTURE_COMPARE_MODE,
                Gl2::COMPARE_REF_TO_TEXTURE as i32,
            );
            g.sampler_parameteri(s, Gl2::TEXTURE_COMPARE_FUNC, compare(f) as i32);
        }
    }

    fn create_framebuffer(&self) -> Option<u32> {
        let fb = both!(&self.gl, g => g.create_framebuffer())?;
        let mut objects = self.objects.borrow_mut();
        let id = objects.id();
        objects.framebuffers.insert(id, fb);
        Some(id)
    }

    fn delete_framebuffer(&self, framebuffer: u32) {
        if let Some(fb) = self.objects.borrow_mut().framebuffers.remove(&framebuffer) {
            both!(&self.gl, g => g.delete_framebuffer(Some(&fb)));
        }
    }

    fn bind_framebuffer(&self, framebuffer: u32, colors: &[GlAttachment], depth_stencil: Option<u32>) {
        if framebuffer == 0 {
            both!(&self.gl, g => g.bind_framebuffer(Gl1::FRAMEBUFFER, None));
            return;
        }
        let fb = self.objects.borrow().framebuffers.get(&framebuffer).cloned();
        both!(&self.gl, g => g.bind_framebuffer(Gl1::FRAMEBUFFER, fb.as_ref()));
        for (i, color) in colors.iter().enumerate() {
            self.attach(
                Gl1::COLOR_ATTACHMENT0 + i as u32,
                color.texture,
                color.level,
                color.layer,
            );
        }
        if let Some(ds) = depth_stencil {
            let stencil = self
                .objects
                .borrow()
                .textures
                .get(&ds)
                .and_then(|t| t.desc)
                .is_some_and(|d| d.format.has_stencil());
            let attachment = if stencil {
                Gl1::DEPTH_STENCIL_ATTACHMENT
            } else {
                Gl1::DEPTH_ATTACHMENT
            };
            self.attach(attachment, ds, 0, 0);
        }
        if let Some(g) = self.gl2() {
            let buffers = js_sys::Array::new();
            for i in 0..colors.len() as u32 {
                buffers.push(&JsValue::from(Gl2::COLOR_ATTACHMENT0 + i));
            }
            g.draw_buffers(&buffers);
        }
    }

    fn clear_color(&self, index: u32, rgba: [f64; 4]) {
        let values = rgba.map(|c| c as f32);
        match &self.gl {
            Gl::Two(g) => g.clear_bufferfv_with_f32_array(Gl2::COLOR, index as i32, &values),
            Gl::One(g) => {
                g.color_mask(true, true, true, true);
                g.clear_color(values[0], values[1], values[2], values[3]);
                g.clear(Gl1::COLOR_BUFFER_BIT);
            }
        }
    }

    fn clear_depth_stencil(&self, depth: Option<f32>, stencil: Option<u32>) {
        let mut mask = 0;
        both!(&self.gl, g => {
            if let Some(depth) = depth {
                g.depth_mask(true);
                g.clear_depth(depth);
                mask |= Gl1::DEPTH_BUFFER_BIT;
            }
            if let Some(stencil) = stencil {
                g.stencil_mask(0xff);
                g.clear_stencil(stencil as i32);
                mask |= Gl1::STENCIL_BUFFER_BIT;
            }
            g.clear(mask);
        });
    }

    fn blit_framebuffer(&self, from: u32, to: u32, width: u32, height: u32) {
        let Some(g) = self.gl2() else {
            return;
        };
        let objects = self.objects.borrow();
        let (w, h) = (width as i32, height as i32);
        g.bind_framebuffer(Gl2::READ_FRAMEBUFFER, objects.framebuffers.get(&from));
        g.bind_framebuffer(Gl2::DRAW_FRAMEBUFFER, objects.framebuffers.get(&to));
        g.blit_framebuffer(0, 0, w, h, 0, 0, w, h, Gl2::COLOR_BUFFER_BIT, Gl2::NEAREST);
    }

    fn read_pixels(
        &self,
        framebuffer: u32,
        width: u32,
        height: u32,
        format: TextureFormat,
        dst: &mut [u8],
    ) {
        let fb = self.objects.borrow().framebuffers.get(&framebuffer).cloned();
        let (_, format, ty) = texel_layout(format, self.gl2().is_some());
        both!(&self.gl, g => {
            g.bind_framebuffer(Gl1::FRAMEBUFFER, fb.as_ref());
            g.pixel_storei(Gl1::PACK_ALIGNMENT, 1);
            let _ = g.read_pixels_with_opt_u8_array(
                0,
                0,
                width as i32,
                height as i32,
                format,
                ty,
                Some(dst),
            );
        });
    }

    fn resize_drawing_buffer(&self, width: u32, height: u32) {
        self.canvas.set_width(width);
        self.canvas.set_height(height);
    }

    fn compile_shader(&self, stage: StageKind, source: &str) -> Result<u32, String> {
        let ty = match stage {
            StageKind::Vertex => Gl1::VERTEX_SHADER,
            _ => Gl1::FRAGMENT_SHADER,
        };
        let shader = both!(&self.gl, g => g.create_shader(ty)).ok_or("context lost")?;
        let ok = both!(&self.gl, g => {
            g.shader_source(&shader, source);
            g.compile_shader(&shader);
            g.get_shader_parameter(&shader, Gl1::COMPILE_STATUS)
                .as_bool()
                .unwrap_or(false)
        });
        if !ok {
            let log = both!(&self.gl, g => g.get_shader_info_log(&shader)).unwrap_or_default();
            both!(&self.gl, g => g.delete_shader(Some(&shader)));
            return Err(log);
        }
        let mut objects = self.objects.borrow_mut();
        let id = objects.id();
        objects.shaders.insert(id, shader);
        Ok(id)
    }

    fn delete_shader(&self, shader: u32) {
        if let Some(s) = self.objects.borrow_mut().shaders.remove(&shader) {
            both!(&self.gl, g => g.delete_shader(Some(&s)));
        }
    }

    fn link_program(&self, vertex: u32, fragment: u32, attributes: &[(u32, String)]) -> Result<u32, String> {
        let (vs, fs) = {
            let objects = self.objects.borrow();
            match (objects.shaders.get(&vertex), objects.shaders.get(&fragment)) {
                (Some(vs), Some(fs)) => (vs.clone(), fs.clone()),
                _ => return Err("invalid shader".to_string()),
            }
        };
        let program = both!(&self.gl, g => g.create_program()).ok_or("context lost")?;
        let ok = both!(&self.gl, g => {
            g.attach_shader(&program, &vs);
            g.attach_shader(&program, &fs);
            for (location, name) in attributes {
                g.bind_attrib_location(&program, *location, name);
            }
            g.link_program(&program);
            g.get_program_parameter(&program, Gl1::LINK_STATUS)
                .as_bool()
                .unwrap_or(false)
        });
        if !ok {
            let log = both!(&self.gl, g => g.get_program_info_log(&program)).unwrap_or_default();
            both!(&self.gl, g => g.delete_program(Some(&program)));
            return Err(log);
        }
        let mut objects = self.objects.borrow_mut();
        let id = objects.id();
        objects.programs.insert(id, program);
        Ok(id)
    }

    fn delete_program(&self, program: u32) {
        if let Some(p) = self.objects.borrow_mut().programs.remove(&program) {
            both!(&self.gl, g => g.delete_program(Some(&p)));
        }
    }

    fn use_program(&self, program: u32) {
        let p = self.objects.borrow().programs.get(&program).cloned();
        both!(&self.gl, g => g.use_program(p.as_ref()));
    }

    fn active_uniforms(&self, program: u32) -> Vec<ActiveUniform> {
        let Some(p) = self.objects.borrow().programs.get(&program).cloned() else {
            return Vec::new();
        };
        let count = both!(&self.gl, g => g.get_program_parameter(&p, Gl1::ACTIVE_UNIFORMS))
            .as_f64()
            .unwrap_or(0.0) as u32;
        (0..count)
            .filter_map(|i| both!(&self.gl, g => g.get_active_uniform(&p, i)))
            .map(|info| ActiveUniform {
                name: info.name(),
                gl_type: info.type_(),
                size: info.size() as u32,
            })
            .collect()
    }

    fn uniform_location(&self, program: u32, name: &str) -> Option<u32> {
        let p = self.objects.borrow().programs.get(&program).cloned()?;
        let location = both!(&self.gl, g => g.get_uniform_location(&p, name))?;
        let mut objects = self.objects.borrow_mut();
        let id = objects.id();
        objects.locations.insert(id, location);
        Some(id)
    }

    fn uniform_block_binding(&self, program: u32, block: &str, binding: u32) -> bool {
        let objects = self.objects.borrow();
        let (Some(g), Some(p)) = (self.gl2(), objects.programs.get(&program)) else {
            return false;
        };
        let index = g.get_uniform_block_index(p, block);
        if index == Gl2::INVALID_INDEX {
            return false;
        }
        g.uniform_block_binding(p, index, binding);
        true
    }

    fn uniform_fv(&self, location: u32, components: u32, values: &[f32]) {
        let objects = self.objects.borrow();
        let l = objects.locations.get(&location);
        both!(&self.gl, g => match components {
            1 => g.uniform1fv_with_f32_array(l, values),
            2 => g.uniform2fv_with_f32_array(l, values),
            3 => g.uniform3fv_with_f32_array(l, values),
            _ => g.uniform4fv_with_f32_array(l, values),
        });
    }

    fn uniform_iv(&self, location: u32, components: u32, values: &[i32]) {
        let objects = self.objects.borrow();
        let l = objects.locations.get(&location);
        both!(&self.gl, g => match components {
            1 => g.uniform1iv_with_i32_array(l, values),
            2 => g.uniform2iv_with_i32_array(l, values),
            3 => g.uniform3iv_with_i32_array(l, values),
            _ => g.uniform4iv_with_i32_array(l, values),
        });
    }

    fn uniform_uiv(&self, location: u32, components: u32, values: &[u32]) {
        let objects = self.objects.borrow();
        let (Some(g), l) = (self.gl2(), objects.locations.get(&location)) else {
            return;
        };
        match components {
            1 => g.uniform1uiv_with_u32_array(l, values),
            2 => g.uniform2uiv_with_u32_array(l, values),
            3 => g.uniform3uiv_with_u32_array(l, values),
            _ => g.uniform4uiv_with_u32_array(l, values),
        }
    }

    fn uniform_matrix_fv(&self, location: u32, columns: u32, rows: u32, values: &[f32]) {
        let objects = self.objects.borrow();
        let l = objects.locations.get(&location);
        match (&self.gl, columns, rows) {
            (gl, 2, 2) => both!(gl, g => g.uniform_matrix2fv_with_f32_array(l, false, values)),
            (gl, 3, 3) => both!(gl, g => g.uniform_matrix3fv_with_f32_array(l, false, values)),
            (gl, 4, 4) => both!(gl, g => g.uniform_matrix4fv_with_f32_array(l, false, values)),
            (Gl::Two(g), 2, 3) => g.uniform_matrix2x3fv_with_f32_array(l, false, values),
            (Gl::Two(g), 2, 4) => g.uniform_matrix2x4fv_with_f32_array(l, false, values),
            (Gl::Two(g), 3, 2) => g.uniform_matrix3x2fv_with_f32_array(l, false, values),
            (Gl::Two(g), 3, 4) => g.uniform_matrix3x4fv_with_f32_array(l, false, values),
            (Gl::Two(g), 4, 2) => g.uniform_matrix4x2fv_with_f32_array(l, false, values),
            (Gl::Two(g), 4, 3) => g.uniform_matrix4x3fv_with_f32_array(l, false, values),
            _ => {}
        }
    }

    fn bind_buffer_range(&self, index: u32, buffer: u32, offset: u64, size: u64) {
        let objects = self.objects.borrow();
        let (Some(g), Some((b, _))) = (self.gl2(), objects.buffers.get(&buffer)) else {
            return;
        };
        g.bind_buffer_range_with_i32_and_i32(
            Gl2::UNIFORM_BUFFER,
            index,
            Some(b),
            offset as i32,
            size as i32,
        );
    }

    fn bind_texture_unit(&self, unit: u32, texture: u32, sampler: Option<u32>) {
        both!(&self.gl, g => g.active_texture(Gl1::TEXTURE0 + unit));
        self.bind_texture(texture);
        if let Some(g) = self.gl2() {
            let objects = self.objects.borrow();
            g.bind_sampler(unit, sampler.and_then(|s| objects.samplers.get(&s)));
        }
    }

    fn apply_state(&self, state: &MegaStateDescriptor) {
        let toggle = |cap: u32, on: bool| {
            both!(&self.gl, g => if on { g.enable(cap) } else { g.disable(cap) })
        };
        toggle(Gl1::BLEND, state.blend.is_some());
        if let Some(blend) = state.blend {
            both!(&self.gl, g => {
                g.blend_func_separate(
                    blend_factor(blend.color.src_factor),
                    blend_factor(blend.color.dst_factor),
                    blend_factor(blend.alpha.src_factor),
                    blend_factor(blend.alpha.dst_factor),
                );
                g.blend_equation_separate(
                    blend_operation(blend.color.operation),
                    blend_operation(blend.alpha.operation),
                );
            });
        }
        let mask = state.color_write_mask;
        let depth_test = state.uses_depth();
        toggle(Gl1::DEPTH_TEST, depth_test);
        both!(&self.gl, g => {
            g.color_mask(
                mask.contains(crate::pipeline::ColorWrites::RED),
                mask.contains(crate::pipeline::ColorWrites::GREEN),
                mask.contains(crate::pipeline::ColorWrites::BLUE),
                mask.contains(crate::pipeline::ColorWrites::ALPHA),
            );
            g.depth_mask(state.depth_write);
            g.depth_func(compare(state.depth_compare));
        });
        toggle(Gl1::STENCIL_TEST, state.stencil.is_some());
        if let Some(stencil) = state.stencil {
            let face = |face: u32, s: &StencilFaceState| {
                both!(&self.gl, g => {
                    g.stencil_func_separate(
                        face,
                        compare(s.compare),
                        stencil.reference as i32,
                        stencil.read_mask,
                    );
                    g.stencil_op_separate(
                        face,
                        stencil_op(s.fail_op),
                        stencil_op(s.depth_fail_op),
                        stencil_op(s.pass_op),
                    );
                })
            };
            face(Gl1::FRONT, &stencil.front);
            face(Gl1::BACK, &stencil.back);
            both!(&self.gl, g => g.stencil_mask(stencil.write_mask));
        }
        toggle(Gl1::CULL_FACE, state.cull_mode != CullMode::None);
        both!(&self.gl, g => {
            match state.cull_mode {
                CullMode::Front => g.cull_face(Gl1::FRONT),
                CullMode::Back => g.cull_face(Gl1::BACK),
                CullMode::None => {}
            }
            g.front_face(match state.front_face {
                FrontFace::Ccw => Gl1::CCW,
                FrontFace::Cw => Gl1::CW,
            });
        });
    }

    fn vertex_attribs(&self, attributes: &[GlVertexAttrib]) {
        let mut objects = self.objects.borrow_mut();
        let wanted: HashSet<u32> = attributes.iter().map(|a| a.location).collect();
        for stale in objects.enabled_attribs.difference(&wanted) {
            both!(&self.gl, g => g.disable_vertex_attrib_array(*stale));
        }
        for a in attributes {
            let Some((buffer, _)) = objects.buffers.get(&a.buffer) else {
                continue;
            };
            let (size, ty, normalized, integer) = attrib_layout(a.format);
            both!(&self.gl, g => {
                g.bind_buffer(Gl1::ARRAY_BUFFER, Some(buffer));
                g.enable_vertex_attrib_array(a.location);
            });
            match &self.gl {
                Gl::Two(g) => {
                    if integer {
                        g.vertex_attrib_i_pointer_with_i32(
                            a.location,
                            size,
                            ty,
                            a.stride as i32,
                            a.offset as i32,
                        );
                    } else {
                        g.vertex_attrib_pointer_with_i32(
                            a.location,
                            size,
                            ty,
                            normalized,
                            a.stride as i32,
                            a.offset as i32,
                        );
                    }
                    g.vertex_attrib_divisor(a.location, a.divisor);
                }
                Gl::One(g) => {
                    g.vertex_attrib_pointer_with_i32(
                        a.location,
                        size,
                        ty,
                        normalized,
                        a.stride as i32,
                        a.offset as i32,
                    );
                    if a.divisor != 0 {
                        logwise::warn_sync!(
                            "per-instance attribute {location} ignored on WebGL1",
                            location = a.location
                        );
                    }
                }
            }
        }
        objects.enabled_attribs = wanted;
    }

    fn viewport(&self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32) {
        both!(&self.gl, g => {
            g.viewport(x as i32, y as i32, width as i32, height as i32);
            g.depth_range(min_depth, max_depth);
        });
    }

    fn draw_arrays(&self, t: PrimitiveTopology, first: u32, count: u32, instances: u32) {
        match &self.gl {
            Gl::Two(g) if instances != 1 => {
                g.draw_arrays_instanced(topology(t), first as i32, count as i32, instances as i32)
            }
            gl => both!(gl, g => g.draw_arrays(topology(t), first as i32, count as i32)),
        }
    }

    fn draw_elements(
        &self,
        t: PrimitiveTopology,
        index_buffer: u32,
        format: IndexFormat,
        byte_offset: u64,
        count: u32,
        instances: u32,
    ) {
        let objects = self.objects.borrow();
        let Some((buffer, _)) = objects.buffers.get(&index_buffer) else {
            return;
        };
        let ty = match format {
            IndexFormat::Uint16 => Gl1::UNSIGNED_SHORT,
            IndexFormat::Uint32 => Gl1::UNSIGNED_INT,
        };
        both!(&self.gl, g => g.bind_buffer(Gl1::ELEMENT_ARRAY_BUFFER, Some(buffer)));
        match &self.gl {
            Gl::Two(g) if instances != 1 => g.draw_elements_instanced_with_i32(
                topology(t),
                count as i32,
                ty,
                byte_offset as i32,
                instances as i32,
            ),
            gl => both!(gl, g => g.draw_elements_with_i32(
                topology(t),
                count as i32,
                ty,
                byte_offset as i32
            )),
        }
    }

    fn flush(&self) {
        both!(&self.gl, g => g.flush());
    }
}
