// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Buffer, texture and sampler descriptors.
//!
//! Descriptors are validated by [`crate::Device`] before any backend object is created; the
//! checks that do not depend on the backend live here.

use crate::error::Error;
use crate::format::TextureFormat;

bitflags::bitflags! {
    /// How a buffer may be used.  A buffer bound as a resource must carry the matching flag.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const COPY_SRC = 1 << 4;
        const COPY_DST = 1 << 5;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const SAMPLED = 1 << 0;
        const RENDER_TARGET = 1 << 1;
        const STORAGE = 1 << 2;
    }
}

/// How often the contents of a buffer are expected to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrequencyHint {
    #[default]
    Static,
    Dynamic,
}

/// Initial contents of a buffer: either a size (zero-filled) or the bytes themselves.
#[derive(Debug, Clone, Copy)]
pub enum BufferContents<'a> {
    Size(u64),
    Data(&'a [u8]),
}

#[derive(Debug, Clone, Copy)]
pub struct BufferDescriptor<'a> {
    pub usage: BufferUsage,
    pub contents: BufferContents<'a>,
    pub hint: FrequencyHint,
}

impl<'a> BufferDescriptor<'a> {
    /// A zero-filled buffer of `size` bytes.
    pub fn with_size(size: u64, usage: BufferUsage) -> Self {
        BufferDescriptor {
            usage,
            contents: BufferContents::Size(size),
            hint: FrequencyHint::Static,
        }
    }

    /// A buffer initialized from `data`.  Use [`bytemuck::cast_slice`] for typed arrays.
    pub fn with_data(data: &'a [u8], usage: BufferUsage) -> Self {
        BufferDescriptor {
            usage,
            contents: BufferContents::Data(data),
            hint: FrequencyHint::Static,
        }
    }

    pub fn hint(mut self, hint: FrequencyHint) -> Self {
        self.hint = hint;
        self
    }

    pub fn byte_len(&self) -> u64 {
        match self.contents {
            BufferContents::Size(size) => size,
            BufferContents::Data(data) => data.len() as u64,
        }
    }

    pub(crate) fn initial_data(&self) -> Option<&'a [u8]> {
        match self.contents {
            BufferContents::Size(_) => None,
            BufferContents::Data(data) => Some(data),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.byte_len() == 0 {
            return Err(Error::invalid_descriptor("buffer", "size must be non-zero"));
        }
        if self.usage.is_empty() {
            return Err(Error::invalid_descriptor("buffer", "usage must not be empty"));
        }
        Ok(())
    }
}

/// What a registry keeps about a live buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BufferInfo {
    pub size: u64,
    pub usage: BufferUsage,
    pub hint: FrequencyHint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureDimension {
    #[default]
    D2,
    D2Array,
    Cube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureDescriptor {
    pub format: TextureFormat,
    pub width: u32,
    pub height: u32,
    /// Array layers.  Must be 1 for [`TextureDimension::D2`] and 6 for [`TextureDimension::Cube`].
    pub depth: u32,
    pub dimension: TextureDimension,
    pub usage: TextureUsage,
    pub mip_levels: u32,
    pub sample_count: u32,
}

impl TextureDescriptor {
    /// A single-level 2D texture.
    pub fn new_2d(format: TextureFormat, width: u32, height: u32, usage: TextureUsage) -> Self {
        TextureDescriptor {
            format,
            width,
            height,
            depth: 1,
            dimension: TextureDimension::D2,
            usage,
            mip_levels: 1,
            sample_count: 1,
        }
    }

    pub fn with_mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn with_sample_count(mut self, sample_count: u32) -> Self {
        self.sample_count = sample_count;
        self
    }

    pub fn level_size(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }

    /// Tightly packed size of one mip level across every layer.
    pub fn level_byte_len(&self, level: u32) -> usize {
        let (w, h) = self.level_size(level);
        w as usize * h as usize * self.depth as usize * self.format.bytes_per_texel() as usize
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.width == 0 || self.height == 0 || self.depth == 0 {
            return Err(Error::invalid_descriptor(
                "texture",
                format!(
                    "extent {}x{}x{} must be non-zero",
                    self.width, self.height, self.depth
                ),
            ));
        }
        match self.dimension {
            TextureDimension::D2 if self.depth != 1 => {
                return Err(Error::invalid_descriptor(
                    "texture",
                    "2D textures have exactly one layer",
                ));
            }
            TextureDimension::Cube if self.depth != 6 || self.width != self.height => {
                return Err(Error::invalid_descriptor(
                    "texture",
                    "cube textures are square with 6 layers",
                ));
            }
            _ => {}
        }
        if self.usage.is_empty() {
            return Err(Error::invalid_descriptor("texture", "usage must not be empty"));
        }
        let max_levels = 32 - self.width.max(self.height).leading_zeros();
        if self.mip_levels == 0 || self.mip_levels > max_levels {
            return Err(Error::invalid_descriptor(
                "texture",
                format!(
                    "{} mip levels requested, between 1 and {max_levels} allowed",
                    self.mip_levels
                ),
            ));
        }
        match self.sample_count {
            1 => {}
            4 => {
                if self.mip_levels != 1
                    || self.dimension != TextureDimension::D2
                    || !self.usage.contains(TextureUsage::RENDER_TARGET)
                    || self.usage.contains(TextureUsage::STORAGE)
                {
                    return Err(Error::invalid_descriptor(
                        "texture",
                        "multisampled textures must be single-level 2D render targets",
                    ));
                }
            }
            other => {
                return Err(Error::invalid_descriptor(
                    "texture",
                    format!("sample count {other} is not 1 or 4"),
                ));
            }
        }
        if self.format.is_depth() && self.usage.contains(TextureUsage::STORAGE) {
            return Err(Error::invalid_descriptor(
                "texture",
                "depth formats cannot be storage textures",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AddressMode {
    #[default]
    ClampToEdge,
    Repeat,
    MirrorRepeat,
}

/// Comparison used by depth/stencil tests and comparison samplers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    #[default]
    Always,
}

/// Sampler state.  Samplers are immutable once created.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDescriptor {
    pub mag_filter: FilterMode,
    pub min_filter: FilterMode,
    pub mipmap_filter: FilterMode,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    pub lod_min: f32,
    pub lod_max: f32,
    pub compare: Option<CompareFunction>,
}

impl Default for SamplerDescriptor {
    fn default() -> Self {
        SamplerDescriptor {
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            mipmap_filter: FilterMode::Nearest,
            address_u: AddressMode::ClampToEdge,
            address_v: AddressMode::ClampToEdge,
            address_w: AddressMode::ClampToEdge,
            lod_min: 0.0,
            lod_max: 32.0,
            compare: None,
        }
    }
}

impl SamplerDescriptor {
    pub fn linear() -> Self {
        SamplerDescriptor {
            mag_filter: FilterMode::Linear,
            min_filter: FilterMode::Linear,
            mipmap_filter: FilterMode::Linear,
            ..Default::default()
        }
    }

    pub(crate) fn validate(&self) -> Result<(), Error> {
        if !(self.lod_min >= 0.0 && self.lod_max >= self.lod_min) {
            return Err(Error::invalid_descriptor(
                "sampler",
                format!("lod range {}..{} is invalid", self.lod_min, self.lod_max),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sized_buffer_is_rejected() {
        let desc = BufferDescriptor::with_size(0, BufferUsage::STORAGE);
        assert!(matches!(
            desc.validate(),
            Err(Error::InvalidDescriptor { what: "buffer", .. })
        ));
    }

    #[test]
    fn texture_level_math() {
        let desc = TextureDescriptor::new_2d(
            TextureFormat::Rgba8Unorm,
            16,
            4,
            TextureUsage::SAMPLED,
        )
        .with_mip_levels(5);
        desc.validate().unwrap();
        assert_eq!(desc.level_size(3), (2, 1));
        assert_eq!(desc.level_byte_len(4), 4);
        assert!(desc.with_mip_levels(6).validate().is_err());
    }

    #[test]
    fn multisample_needs_render_target() {
        let desc = TextureDescriptor::new_2d(
            TextureFormat::Rgba8Unorm,
            8,
            8,
            TextureUsage::SAMPLED,
        )
        .with_sample_count(4);
        assert!(desc.validate().is_err());
    }
}
