//! Texture and vertex formats understood by the runtime.
//!
//! Backends map these onto their native format enums; the tables here only
//! carry what the portable layer needs (texel size and compression block
//! dimensions for copy alignment).

/// Format of a texture or swapchain image.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum Format {
    Undefined,

    // 8-bit channels
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Bgra8Unorm,

    // packed
    Bgr10A2Unorm,

    // 16-bit channels
    R16Float,
    Rg16Float,
    Rgba16Float,
    R16Snorm,
    Rg16Snorm,
    Rgba16Snorm,

    // 32-bit channels
    R32Float,
    Rg32Float,
    Rgb32Float,
    Rgba32Float,
    R32Uint,
    Rgba32Uint,

    // depth / stencil
    D16Unorm,
    D32Float,
    D24UnormS8Uint,

    // block compressed
    Bc1Unorm,
    Bc3Unorm,
    Bc4Unorm,
    Bc5Unorm,
    Bc6Hf,
    Bc7Unorm,
}

/// Texel (or block) footprint of a format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FormatDesc {
    /// Bytes per texel, or per block for compressed formats.
    pub bytes: u32,
    /// Block width in texels (1 for uncompressed formats).
    pub block_width: u32,
    /// Block height in texels (1 for uncompressed formats).
    pub block_height: u32,
    /// Whether this is a depth and/or stencil format.
    pub is_depth_stencil: bool,
}

impl Format {
    /// Footprint table used for staging-copy alignment.
    pub fn desc(self) -> FormatDesc {
        let (bytes, bw, bh, ds) = match self {
            Format::Undefined => (0, 1, 1, false),
            Format::R8Unorm => (1, 1, 1, false),
            Format::Rg8Unorm => (2, 1, 1, false),
            Format::Rgba8Unorm | Format::Bgra8Unorm | Format::Bgr10A2Unorm => (4, 1, 1, false),
            Format::R16Float | Format::R16Snorm => (2, 1, 1, false),
            Format::Rg16Float | Format::Rg16Snorm => (4, 1, 1, false),
            Format::Rgba16Float | Format::Rgba16Snorm => (8, 1, 1, false),
            Format::R32Float | Format::R32Uint => (4, 1, 1, false),
            Format::Rg32Float => (8, 1, 1, false),
            Format::Rgb32Float => (12, 1, 1, false),
            Format::Rgba32Float | Format::Rgba32Uint => (16, 1, 1, false),
            Format::D16Unorm => (2, 1, 1, true),
            Format::D32Float => (4, 1, 1, true),
            Format::D24UnormS8Uint => (4, 1, 1, true),
            Format::Bc1Unorm | Format::Bc4Unorm => (8, 4, 4, false),
            Format::Bc3Unorm | Format::Bc5Unorm | Format::Bc6Hf | Format::Bc7Unorm => {
                (16, 4, 4, false)
            }
        };
        FormatDesc {
            bytes,
            block_width: bw,
            block_height: bh,
            is_depth_stencil: ds,
        }
    }

    /// Byte size of `width * height * depth` texels of this format, rounding
    /// each compressed dimension up to whole blocks.
    pub fn layer_size(self, width: u32, height: u32, depth: u32) -> u64 {
        let d = self.desc();
        let bx = ((width + d.block_width - 1) / d.block_width) as u64;
        let by = ((height + d.block_height - 1) / d.block_height) as u64;
        bx * by * depth as u64 * d.bytes as u64
    }
}

/// Formats a window may request for its swapchain.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum WindowFormat {
    Bgra8,
    Rgba8,
    Bgr10A2,
    Rgba16f,
    Rgba32f,
}

impl WindowFormat {
    /// Preference list tried against surface support, best first.
    pub fn preference_list(self) -> &'static [Format] {
        match self {
            WindowFormat::Bgra8 => &[Format::Bgra8Unorm, Format::Rgba8Unorm],
            WindowFormat::Rgba8 => &[Format::Rgba8Unorm, Format::Bgra8Unorm],
            WindowFormat::Bgr10A2 => &[Format::Bgr10A2Unorm, Format::Rgba16Float],
            WindowFormat::Rgba16f => &[Format::Rgba16Float],
            WindowFormat::Rgba32f => &[Format::Rgba32Float],
        }
    }
}

/// A type of each index value in an index buffer.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u8)]
pub enum IndexFormat {
    U16,
    U32,
}

impl IndexFormat {
    /// Size of one index in bytes.
    pub fn size(self) -> u64 {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_rounding() {
        // 5x5 BC1 occupies 2x2 blocks of 8 bytes.
        assert_eq!(Format::Bc1Unorm.layer_size(5, 5, 1), 4 * 8);
        assert_eq!(Format::Rgba8Unorm.layer_size(7, 3, 2), 7 * 3 * 2 * 4);
    }

    #[test]
    fn window_preferences_are_nonempty() {
        for wf in [
            WindowFormat::Bgra8,
            WindowFormat::Rgba8,
            WindowFormat::Bgr10A2,
            WindowFormat::Rgba16f,
            WindowFormat::Rgba32f,
        ]
        .iter()
        {
            assert!(!wf.preference_list().is_empty());
        }
    }
}
