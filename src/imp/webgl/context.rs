// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The native call surface the WebGL backend is written against.

use crate::error::StageKind;
use crate::format::{IndexFormat, TextureFormat, VertexFormat};
use crate::pipeline::{MegaStateDescriptor, PrimitiveTopology};
use crate::resources::{SamplerDescriptor, TextureDescriptor};

/// GL enums for active uniform types.
pub mod types {
    pub const FLOAT: u32 = 0x1406;
    pub const FLOAT_VEC2: u32 = 0x8B50;
    pub const FLOAT_VEC3: u32 = 0x8B51;
    pub const FLOAT_VEC4: u32 = 0x8B52;
    pub const INT: u32 = 0x1404;
    pub const INT_VEC2: u32 = 0x8B53;
    pub const INT_VEC3: u32 = 0x8B54;
    pub const INT_VEC4: u32 = 0x8B55;
    pub const BOOL: u32 = 0x8B56;
    pub const BOOL_VEC2: u32 = 0x8B57;
    pub const BOOL_VEC3: u32 = 0x8B58;
    pub const BOOL_VEC4: u32 = 0x8B59;
    pub const FLOAT_MAT2: u32 = 0x8B5A;
    pub const FLOAT_MAT3: u32 = 0x8B5B;
    pub const FLOAT_MAT4: u32 = 0x8B5C;
    pub const SAMPLER_2D: u32 = 0x8B5E;
    pub const SAMPLER_3D: u32 = 0x8B5F;
    pub const SAMPLER_CUBE: u32 = 0x8B60;
    pub const SAMPLER_2D_SHADOW: u32 = 0x8B62;
    // WebGL2 only from here on
    pub const UNSIGNED_INT: u32 = 0x1405;
    pub const UNSIGNED_INT_VEC2: u32 = 0x8DC6;
    pub const UNSIGNED_INT_VEC3: u32 = 0x8DC7;
    pub const UNSIGNED_INT_VEC4: u32 = 0x8DC8;
    pub const FLOAT_MAT2X3: u32 = 0x8B65;
    pub const FLOAT_MAT2X4: u32 = 0x8B66;
    pub const FLOAT_MAT3X2: u32 = 0x8B67;
    pub const FLOAT_MAT3X4: u32 = 0x8B68;
    pub const FLOAT_MAT4X2: u32 = 0x8B69;
    pub const FLOAT_MAT4X3: u32 = 0x8B6A;
    pub const SAMPLER_2D_ARRAY: u32 = 0x8DC1;
    pub const SAMPLER_CUBE_SHADOW: u32 = 0x8DC5;
    pub const INT_SAMPLER_2D: u32 = 0x8DCA;
    pub const UNSIGNED_INT_SAMPLER_2D: u32 = 0x8DD2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GlVersion {
    WebGl1,
    WebGl2,
}

/// One entry of `getActiveUniform`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveUniform {
    /// Array uniforms carry their `[0]` suffix, as GL reports them.
    pub name: String,
    pub gl_type: u32,
    pub size: u32,
}

/// The binding target a buffer is created for.  WebGL never lets an element array buffer
/// be bound to another target, so this is fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferTarget {
    Array,
    ElementArray,
    Uniform,
}

/// A color attachment of a framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlAttachment {
    pub texture: u32,
    pub level: u32,
    pub layer: u32,
}

/// One vertex attribute, as `vertexAttribPointer` / `vertexAttribIPointer` take it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlVertexAttrib {
    pub location: u32,
    pub buffer: u32,
    pub format: VertexFormat,
    pub stride: u64,
    pub offset: u64,
    /// 0 for per-vertex data.
    pub divisor: u32,
}

/**
A WebGL rendering context.

Object ids are plain integers; `0` is never a valid object except for framebuffer `0`, the
default framebuffer.  Methods taking a WebGL2-only feature are never called on a WebGL1
context.

Implementations are expected to be cheap to call: the backend issues one method call per native
GL call, and tests count them.
*/
pub trait GlContext {
    fn version(&self) -> GlVersion;
    fn is_context_lost(&self) -> bool;

    fn max_texture_size(&self) -> u32;
    fn max_vertex_attribs(&self) -> u32;
    fn max_draw_buffers(&self) -> u32;
    /// 1 on WebGL1.
    fn max_samples(&self) -> u32;
    fn max_uniform_block_size(&self) -> u64;
    fn uniform_buffer_offset_alignment(&self) -> u64;

    /// `None` once the context is lost.
    fn create_buffer(&self, target: BufferTarget) -> Option<u32>;
    fn delete_buffer(&self, buffer: u32);
    /// Allocates `size` bytes, initialized from `data` when given.
    fn buffer_data(&self, buffer: u32, size: usize, data: Option<&[u8]>, dynamic: bool);
    fn buffer_sub_data(&self, buffer: u32, offset: usize, data: &[u8]);
    /// WebGL2.
    fn get_buffer_sub_data(&self, buffer: u32, offset: usize, dst: &mut [u8]);

    /// WebGL2.  Inserts a fence after all prior commands.
    fn fence_sync(&self) -> u32;
    /// WebGL2.  `clientWaitSync` with a zero timeout.
    fn sync_signaled(&self, sync: u32) -> bool;
    fn delete_sync(&self, sync: u32);

    fn create_texture(&self) -> Option<u32>;
    fn delete_texture(&self, texture: u32);
    /// Allocates every level and layer (a multisampled renderbuffer for `sample_count > 1`).
    fn tex_storage(&self, texture: u32, desc: &TextureDescriptor);
    /// Uploads one mip level, every layer, tightly packed.
    fn tex_sub_image(&self, texture: u32, level: u32, data: &[u8]);
    /// Sampling state stored on the texture itself (WebGL1 has no sampler objects).
    fn tex_parameters(&self, texture: u32, sampler: &SamplerDescriptor);
    /// WebGL2.
    fn create_sampler(&self) -> Option<u32>;
    fn delete_sampler(&self, sampler: u32);
    fn sampler_parameters(&self, sampler: u32, desc: &SamplerDescriptor);

    fn create_framebuffer(&self) -> Option<u32>;
    fn delete_framebuffer(&self, framebuffer: u32);
    /// Binds `framebuffer` and attaches the given textures.  Framebuffer `0` takes no
    /// attachments.
    fn bind_framebuffer(
        &self,
        framebuffer: u32,
        colors: &[GlAttachment],
        depth_stencil: Option<u32>,
    );
    /// Clears color attachment `index` of the bound framebuffer.
    fn clear_color(&self, index: u32, rgba: [f64; 4]);
    fn clear_depth_stencil(&self, depth: Option<f32>, stencil: Option<u32>);
    /// WebGL2.  Resolves color attachment 0 of `from` into `to`.
    fn blit_framebuffer(&self, from: u32, to: u32, width: u32, height: u32);
    /// Reads color attachment 0 of `framebuffer`.
    fn read_pixels(
        &self,
        framebuffer: u32,
        width: u32,
        height: u32,
        format: TextureFormat,
        dst: &mut [u8],
    );
    /// Resizes the default framebuffer.
    fn resize_drawing_buffer(&self, width: u32, height: u32);

    /// Returns the shader or the info log.
    fn compile_shader(&self, stage: StageKind, source: &str) -> Result<u32, String>;
    fn delete_shader(&self, shader: u32);
    /// Binds attribute locations, then links.  Returns the program or the info log.
    fn link_program(
        &self,
        vertex: u32,
        fragment: u32,
        attributes: &[(u32, String)],
    ) -> Result<u32, String>;
    fn delete_program(&self, program: u32);
    fn use_program(&self, program: u32);
    fn active_uniforms(&self, program: u32) -> Vec<ActiveUniform>;
    fn uniform_location(&self, program: u32, name: &str) -> Option<u32>;
    /// WebGL2.  Returns false if the program has no such block.
    fn uniform_block_binding(&self, program: u32, block: &str, binding: u32) -> bool;

    /// `uniform{components}fv`.
    fn uniform_fv(&self, location: u32, components: u32, values: &[f32]);
    /// `uniform{components}iv`.  Also used for booleans and sampler units.
    fn uniform_iv(&self, location: u32, components: u32, values: &[i32]);
    /// WebGL2.  `uniform{components}uiv`.
    fn uniform_uiv(&self, location: u32, components: u32, values: &[u32]);
    /// `uniformMatrix{columns}x{rows}fv`, column major.
    fn uniform_matrix_fv(&self, location: u32, columns: u32, rows: u32, values: &[f32]);

    /// WebGL2.  Binds a range of `buffer` to uniform block binding point `index`.
    fn bind_buffer_range(&self, index: u32, buffer: u32, offset: u64, size: u64);
    /// Binds `texture` (and on WebGL2 `sampler`) to texture unit `unit`.
    fn bind_texture_unit(&self, unit: u32, texture: u32, sampler: Option<u32>);

    /// Applies blend, depth, stencil and rasterizer state.
    fn apply_state(&self, state: &MegaStateDescriptor);
    /// Enables exactly the given attributes.
    fn vertex_attribs(&self, attributes: &[GlVertexAttrib]);
    fn viewport(&self, x: f32, y: f32, width: f32, height: f32, min_depth: f32, max_depth: f32);
    fn draw_arrays(&self, topology: PrimitiveTopology, first: u32, count: u32, instances: u32);
    fn draw_elements(
        &self,
        topology: PrimitiveTopology,
        index_buffer: u32,
        format: IndexFormat,
        byte_offset: u64,
        count: u32,
        instances: u32,
    );
    fn flush(&self);
}
