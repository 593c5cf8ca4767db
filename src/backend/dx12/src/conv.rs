//! Conversions from portable types into D3D12/DXGI enums.
#![cfg(windows)]

use winapi::shared::dxgiformat;
use winapi::um::d3d12;

use grx::{
    barrier::{Access, ImageLayout},
    format::{Format, IndexFormat},
    pipeline::{BlendPreset, CullMode, Topology},
    sampler::{AddressMode, BorderColor, CompareOp, Filter, MipMode},
};

pub(crate) fn map_format(format: Format) -> dxgiformat::DXGI_FORMAT {
    use dxgiformat::*;
    match format {
        Format::Undefined => DXGI_FORMAT_UNKNOWN,
        Format::R8Unorm => DXGI_FORMAT_R8_UNORM,
        Format::Rg8Unorm => DXGI_FORMAT_R8G8_UNORM,
        Format::Rgba8Unorm => DXGI_FORMAT_R8G8B8A8_UNORM,
        Format::Bgra8Unorm => DXGI_FORMAT_B8G8R8A8_UNORM,
        Format::Bgr10A2Unorm => DXGI_FORMAT_R10G10B10A2_UNORM,
        Format::R16Float => DXGI_FORMAT_R16_FLOAT,
        Format::Rg16Float => DXGI_FORMAT_R16G16_FLOAT,
        Format::Rgba16Float => DXGI_FORMAT_R16G16B16A16_FLOAT,
        Format::R16Snorm => DXGI_FORMAT_R16_SNORM,
        Format::Rg16Snorm => DXGI_FORMAT_R16G16_SNORM,
        Format::Rgba16Snorm => DXGI_FORMAT_R16G16B16A16_SNORM,
        Format::R32Float => DXGI_FORMAT_R32_FLOAT,
        Format::Rg32Float => DXGI_FORMAT_R32G32_FLOAT,
        Format::Rgb32Float => DXGI_FORMAT_R32G32B32_FLOAT,
        Format::Rgba32Float => DXGI_FORMAT_R32G32B32A32_FLOAT,
        Format::R32Uint => DXGI_FORMAT_R32_UINT,
        Format::Rgba32Uint => DXGI_FORMAT_R32G32B32A32_UINT,
        Format::D16Unorm => DXGI_FORMAT_D16_UNORM,
        Format::D32Float => DXGI_FORMAT_D32_FLOAT,
        Format::D24UnormS8Uint => DXGI_FORMAT_D24_UNORM_S8_UINT,
        Format::Bc1Unorm => DXGI_FORMAT_BC1_UNORM,
        Format::Bc3Unorm => DXGI_FORMAT_BC3_UNORM,
        Format::Bc4Unorm => DXGI_FORMAT_BC4_UNORM,
        Format::Bc5Unorm => DXGI_FORMAT_BC5_UNORM,
        Format::Bc6Hf => DXGI_FORMAT_BC6H_SF16,
        Format::Bc7Unorm => DXGI_FORMAT_BC7_UNORM,
    }
}

pub(crate) fn map_index_format(format: IndexFormat) -> dxgiformat::DXGI_FORMAT {
    match format {
        IndexFormat::U16 => dxgiformat::DXGI_FORMAT_R16_UINT,
        IndexFormat::U32 => dxgiformat::DXGI_FORMAT_R32_UINT,
    }
}

/// Resolve a portable `(access, layout)` pair into a D3D12 resource state.
/// D3D12 has no separate stage dimension; access dominates.
pub(crate) fn map_state(access: Access, layout: ImageLayout) -> d3d12::D3D12_RESOURCE_STATES {
    match layout {
        ImageLayout::Present => return d3d12::D3D12_RESOURCE_STATE_PRESENT,
        ImageLayout::ColorAttachment => return d3d12::D3D12_RESOURCE_STATE_RENDER_TARGET,
        ImageLayout::DepthStencilAttachment => return d3d12::D3D12_RESOURCE_STATE_DEPTH_WRITE,
        ImageLayout::DepthStencilRead => return d3d12::D3D12_RESOURCE_STATE_DEPTH_READ,
        ImageLayout::CopySrc => return d3d12::D3D12_RESOURCE_STATE_COPY_SOURCE,
        ImageLayout::CopyDst => return d3d12::D3D12_RESOURCE_STATE_COPY_DEST,
        ImageLayout::ShaderRead => {
            return d3d12::D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE
                | d3d12::D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE
        }
        ImageLayout::General | ImageLayout::Undefined => {}
    }

    let mut state = 0;
    if access.contains(Access::INDIRECT_READ) {
        state |= d3d12::D3D12_RESOURCE_STATE_INDIRECT_ARGUMENT;
    }
    if access.contains(Access::INDEX_READ) {
        state |= d3d12::D3D12_RESOURCE_STATE_INDEX_BUFFER;
    }
    if access.contains(Access::VERTEX_READ) || access.contains(Access::UNIFORM_READ) {
        state |= d3d12::D3D12_RESOURCE_STATE_VERTEX_AND_CONSTANT_BUFFER;
    }
    if access.intersects(Access::SHADER_WRITE) {
        state |= d3d12::D3D12_RESOURCE_STATE_UNORDERED_ACCESS;
    } else if access.contains(Access::SHADER_READ) {
        state |= d3d12::D3D12_RESOURCE_STATE_PIXEL_SHADER_RESOURCE
            | d3d12::D3D12_RESOURCE_STATE_NON_PIXEL_SHADER_RESOURCE;
    }
    if access.contains(Access::COPY_READ) {
        state |= d3d12::D3D12_RESOURCE_STATE_COPY_SOURCE;
    }
    if access.contains(Access::COPY_WRITE) {
        state |= d3d12::D3D12_RESOURCE_STATE_COPY_DEST;
    }
    state
}

pub(crate) fn map_topology(topology: Topology) -> u32 {
    use winapi::um::d3dcommon::*;
    match topology {
        Topology::PointList => D3D_PRIMITIVE_TOPOLOGY_POINTLIST,
        Topology::LineList => D3D_PRIMITIVE_TOPOLOGY_LINELIST,
        Topology::TriangleList => D3D_PRIMITIVE_TOPOLOGY_TRIANGLELIST,
        Topology::TriangleStrip => D3D_PRIMITIVE_TOPOLOGY_TRIANGLESTRIP,
    }
}

pub(crate) fn map_topology_type(topology: Topology) -> d3d12::D3D12_PRIMITIVE_TOPOLOGY_TYPE {
    match topology {
        Topology::PointList => d3d12::D3D12_PRIMITIVE_TOPOLOGY_TYPE_POINT,
        Topology::LineList => d3d12::D3D12_PRIMITIVE_TOPOLOGY_TYPE_LINE,
        Topology::TriangleList | Topology::TriangleStrip => {
            d3d12::D3D12_PRIMITIVE_TOPOLOGY_TYPE_TRIANGLE
        }
    }
}

pub(crate) fn map_cull_mode(cull: CullMode) -> d3d12::D3D12_CULL_MODE {
    match cull {
        CullMode::None => d3d12::D3D12_CULL_MODE_NONE,
        CullMode::Front => d3d12::D3D12_CULL_MODE_FRONT,
        CullMode::Back => d3d12::D3D12_CULL_MODE_BACK,
    }
}

pub(crate) fn map_blend(preset: BlendPreset) -> d3d12::D3D12_RENDER_TARGET_BLEND_DESC {
    let (enable, src, dst) = match preset {
        BlendPreset::Opaque => (0, d3d12::D3D12_BLEND_ONE, d3d12::D3D12_BLEND_ZERO),
        BlendPreset::AlphaBlend => (
            1,
            d3d12::D3D12_BLEND_SRC_ALPHA,
            d3d12::D3D12_BLEND_INV_SRC_ALPHA,
        ),
        BlendPreset::Additive => (1, d3d12::D3D12_BLEND_ONE, d3d12::D3D12_BLEND_ONE),
        BlendPreset::PremultipliedAlpha => {
            (1, d3d12::D3D12_BLEND_ONE, d3d12::D3D12_BLEND_INV_SRC_ALPHA)
        }
    };
    d3d12::D3D12_RENDER_TARGET_BLEND_DESC {
        BlendEnable: enable,
        LogicOpEnable: 0,
        SrcBlend: src,
        DestBlend: dst,
        BlendOp: d3d12::D3D12_BLEND_OP_ADD,
        SrcBlendAlpha: src,
        DestBlendAlpha: dst,
        BlendOpAlpha: d3d12::D3D12_BLEND_OP_ADD,
        LogicOp: d3d12::D3D12_LOGIC_OP_NOOP,
        RenderTargetWriteMask: 0xF,
    }
}

pub(crate) fn map_filter(
    min: Filter,
    mag: Filter,
    mip: MipMode,
    anisotropic: bool,
    comparison: bool,
) -> d3d12::D3D12_FILTER {
    if anisotropic {
        return if comparison {
            d3d12::D3D12_FILTER_COMPARISON_ANISOTROPIC
        } else {
            d3d12::D3D12_FILTER_ANISOTROPIC
        };
    }
    let mut filter = 0;
    if mag == Filter::Linear {
        filter |= 0x4;
    }
    if min == Filter::Linear {
        filter |= 0x10;
    }
    if mip == MipMode::Linear {
        filter |= 0x1;
    }
    if comparison {
        filter |= 0x80;
    }
    filter
}

pub(crate) fn map_address_mode(mode: AddressMode) -> d3d12::D3D12_TEXTURE_ADDRESS_MODE {
    match mode {
        AddressMode::Repeat => d3d12::D3D12_TEXTURE_ADDRESS_MODE_WRAP,
        AddressMode::MirrorRepeat => d3d12::D3D12_TEXTURE_ADDRESS_MODE_MIRROR,
        AddressMode::ClampToEdge => d3d12::D3D12_TEXTURE_ADDRESS_MODE_CLAMP,
        AddressMode::ClampToBorder => d3d12::D3D12_TEXTURE_ADDRESS_MODE_BORDER,
    }
}

pub(crate) fn map_border_color(color: BorderColor) -> [f32; 4] {
    match color {
        BorderColor::TransparentBlack => [0.0, 0.0, 0.0, 0.0],
        BorderColor::OpaqueBlack => [0.0, 0.0, 0.0, 1.0],
        BorderColor::OpaqueWhite => [1.0, 1.0, 1.0, 1.0],
    }
}

pub(crate) fn map_compare_op(op: CompareOp) -> d3d12::D3D12_COMPARISON_FUNC {
    match op {
        CompareOp::Never => d3d12::D3D12_COMPARISON_FUNC_NEVER,
        CompareOp::Less => d3d12::D3D12_COMPARISON_FUNC_LESS,
        CompareOp::Equal => d3d12::D3D12_COMPARISON_FUNC_EQUAL,
        CompareOp::LessEqual => d3d12::D3D12_COMPARISON_FUNC_LESS_EQUAL,
        CompareOp::Greater => d3d12::D3D12_COMPARISON_FUNC_GREATER,
        CompareOp::NotEqual => d3d12::D3D12_COMPARISON_FUNC_NOT_EQUAL,
        CompareOp::GreaterEqual => d3d12::D3D12_COMPARISON_FUNC_GREATER_EQUAL,
        CompareOp::Always => d3d12::D3D12_COMPARISON_FUNC_ALWAYS,
    }
}
