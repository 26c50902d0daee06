// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Pixel, vertex and index formats.
//!
//! Formats are plain enums here rather than marker types: descriptors are validated at
//! runtime against whichever backend the swap chain picked, so the format has to be a value
//! the backend can inspect.

use std::fmt::Display;

/// Texel formats understood by every backend (subject to [`crate::Device::supports_texture_format`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    R32Sint,
    Rgba32Uint,
    Depth16Unorm,
    Depth24Plus,
    Depth24PlusStencil8,
    Depth32Float,
}

/// How a channel is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Unorm8,
    Float16,
    Float32,
    Uint32,
    Sint32,
    /// Depth and stencil formats.  Their memory layout is backend defined.
    Depth,
}

impl TextureFormat {
    /// Bytes per texel in tightly packed CPU memory.
    pub const fn bytes_per_texel(self) -> u32 {
        match self {
            TextureFormat::R8Unorm => 1,
            TextureFormat::Rg8Unorm | TextureFormat::R16Float | TextureFormat::Depth16Unorm => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Rg16Float
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
            | TextureFormat::R32Sint
            | TextureFormat::Depth24Plus
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float | TextureFormat::Rg32Float => 8,
            TextureFormat::Rgba32Float | TextureFormat::Rgba32Uint => 16,
        }
    }

    pub const fn channel_count(self) -> u32 {
        match self {
            TextureFormat::R8Unorm
            | TextureFormat::R16Float
            | TextureFormat::R32Float
            | TextureFormat::R32Uint
            | TextureFormat::R32Sint
            | TextureFormat::Depth16Unorm
            | TextureFormat::Depth24Plus
            | TextureFormat::Depth32Float => 1,
            TextureFormat::Rg8Unorm
            | TextureFormat::Rg16Float
            | TextureFormat::Rg32Float
            | TextureFormat::Depth24PlusStencil8 => 2,
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb
            | TextureFormat::Rgba16Float
            | TextureFormat::Rgba32Float
            | TextureFormat::Rgba32Uint => 4,
        }
    }

    pub const fn channel_type(self) -> ChannelType {
        match self {
            TextureFormat::R8Unorm
            | TextureFormat::Rg8Unorm
            | TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Bgra8Unorm
            | TextureFormat::Bgra8UnormSrgb => ChannelType::Unorm8,
            TextureFormat::R16Float | TextureFormat::Rg16Float | TextureFormat::Rgba16Float => {
                ChannelType::Float16
            }
            TextureFormat::R32Float | TextureFormat::Rg32Float | TextureFormat::Rgba32Float => {
                ChannelType::Float32
            }
            TextureFormat::R32Uint | TextureFormat::Rgba32Uint => ChannelType::Uint32,
            TextureFormat::R32Sint => ChannelType::Sint32,
            TextureFormat::Depth16Unorm
            | TextureFormat::Depth24Plus
            | TextureFormat::Depth24PlusStencil8
            | TextureFormat::Depth32Float => ChannelType::Depth,
        }
    }

    pub const fn is_depth(self) -> bool {
        matches!(self.channel_type(), ChannelType::Depth)
    }

    pub const fn has_stencil(self) -> bool {
        matches!(self, TextureFormat::Depth24PlusStencil8)
    }

    pub const fn is_srgb(self) -> bool {
        matches!(
            self,
            TextureFormat::Rgba8UnormSrgb | TextureFormat::Bgra8UnormSrgb
        )
    }

    /// Encodes one normalized RGBA color into a texel of this format.
    ///
    /// Missing channels are dropped; integer formats truncate.  Depth formats encode the red
    /// channel as a 32-bit float, which is how the CPU backend stores depth.
    pub fn encode_color(self, rgba: [f64; 4]) -> Vec<u8> {
        let channels = self.channel_count() as usize;
        let ordered = match self {
            TextureFormat::Bgra8Unorm | TextureFormat::Bgra8UnormSrgb => {
                [rgba[2], rgba[1], rgba[0], rgba[3]]
            }
            _ => rgba,
        };
        let mut out = Vec::with_capacity(self.bytes_per_texel() as usize);
        match self.channel_type() {
            ChannelType::Unorm8 => {
                for c in &ordered[..channels] {
                    out.push((c.clamp(0.0, 1.0) * 255.0).round() as u8);
                }
            }
            ChannelType::Float16 => {
                for c in &ordered[..channels] {
                    out.extend_from_slice(&half::f16::from_f64(*c).to_le_bytes());
                }
            }
            ChannelType::Float32 => {
                for c in &ordered[..channels] {
                    out.extend_from_slice(&(*c as f32).to_le_bytes());
                }
            }
            ChannelType::Uint32 => {
                for c in &ordered[..channels] {
                    out.extend_from_slice(&(*c as u32).to_le_bytes());
                }
            }
            ChannelType::Sint32 => {
                for c in &ordered[..channels] {
                    out.extend_from_slice(&(*c as i32).to_le_bytes());
                }
            }
            ChannelType::Depth => {
                out.extend_from_slice(&(ordered[0] as f32).to_le_bytes());
            }
        }
        out
    }
}

impl Display for TextureFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Formats of a single vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Float16x2,
    Float16x4,
    Unorm8x4,
    Uint8x4,
    Uint32,
    Uint32x2,
    Uint32x3,
    Uint32x4,
    Sint32,
    Sint32x2,
    Sint32x3,
    Sint32x4,
}

impl VertexFormat {
    pub const fn size(self) -> u64 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Sint32 => 4,
            VertexFormat::Unorm8x4 | VertexFormat::Uint8x4 | VertexFormat::Float16x2 => 4,
            VertexFormat::Float32x2
            | VertexFormat::Uint32x2
            | VertexFormat::Sint32x2
            | VertexFormat::Float16x4 => 8,
            VertexFormat::Float32x3 | VertexFormat::Uint32x3 | VertexFormat::Sint32x3 => 12,
            VertexFormat::Float32x4 | VertexFormat::Uint32x4 | VertexFormat::Sint32x4 => 16,
        }
    }

    pub const fn components(self) -> u32 {
        match self {
            VertexFormat::Float32 | VertexFormat::Uint32 | VertexFormat::Sint32 => 1,
            VertexFormat::Float32x2
            | VertexFormat::Float16x2
            | VertexFormat::Uint32x2
            | VertexFormat::Sint32x2 => 2,
            VertexFormat::Float32x3 | VertexFormat::Uint32x3 | VertexFormat::Sint32x3 => 3,
            VertexFormat::Float32x4
            | VertexFormat::Float16x4
            | VertexFormat::Unorm8x4
            | VertexFormat::Uint8x4
            | VertexFormat::Uint32x4
            | VertexFormat::Sint32x4 => 4,
        }
    }

    /// Whether the attribute is read as an integer in the shader (as opposed to float or normalized).
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            VertexFormat::Uint8x4
                | VertexFormat::Uint32
                | VertexFormat::Uint32x2
                | VertexFormat::Uint32x3
                | VertexFormat::Uint32x4
                | VertexFormat::Sint32
                | VertexFormat::Sint32x2
                | VertexFormat::Sint32x3
                | VertexFormat::Sint32x4
        )
    }
}

/// Index buffer element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

impl IndexFormat {
    pub const fn size(self) -> u64 {
        match self {
            IndexFormat::Uint16 => 2,
            IndexFormat::Uint32 => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_rgba8() {
        let red = TextureFormat::Rgba8Unorm.encode_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(red, vec![255, 0, 0, 255]);
        let swizzled = TextureFormat::Bgra8Unorm.encode_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(swizzled, vec![0, 0, 255, 255]);
    }

    #[test]
    fn encode_matches_texel_size() {
        for format in [
            TextureFormat::R8Unorm,
            TextureFormat::Rg16Float,
            TextureFormat::Rgba32Float,
            TextureFormat::R32Uint,
            TextureFormat::Depth32Float,
        ] {
            assert_eq!(
                format.encode_color([0.5, 0.25, 0.0, 1.0]).len() as u32,
                format.bytes_per_texel(),
                "{format}"
            );
        }
    }
}
