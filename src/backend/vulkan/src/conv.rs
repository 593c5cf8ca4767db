//! Conversions from portable types into Vulkan enums and flags.

use ash::vk;

use grx::{
    barrier::{Access, ImageLayout, PipelineStages, SubresourceRange},
    buffer::BufferUsage,
    format::{Format, IndexFormat},
    pipeline::{BlendPreset, CullMode, PipelineKind, Topology},
    resource::ResourceFlags,
    rtas::RtasBuildFlags,
    sampler::{AddressMode, BorderColor, CompareOp, Filter, MipMode},
    swapchain::PresentMode,
    texture::{TextureType, TextureUsage},
    ClearValue, LoadOp, StoreOp,
};

pub(crate) fn map_format(format: Format) -> vk::Format {
    match format {
        Format::Undefined => vk::Format::UNDEFINED,
        Format::R8Unorm => vk::Format::R8_UNORM,
        Format::Rg8Unorm => vk::Format::R8G8_UNORM,
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgr10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        Format::R16Float => vk::Format::R16_SFLOAT,
        Format::Rg16Float => vk::Format::R16G16_SFLOAT,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::R16Snorm => vk::Format::R16_SNORM,
        Format::Rg16Snorm => vk::Format::R16G16_SNORM,
        Format::Rgba16Snorm => vk::Format::R16G16B16A16_SNORM,
        Format::R32Float => vk::Format::R32_SFLOAT,
        Format::Rg32Float => vk::Format::R32G32_SFLOAT,
        Format::Rgb32Float => vk::Format::R32G32B32_SFLOAT,
        Format::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        Format::R32Uint => vk::Format::R32_UINT,
        Format::Rgba32Uint => vk::Format::R32G32B32A32_UINT,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        Format::Bc1Unorm => vk::Format::BC1_RGBA_UNORM_BLOCK,
        Format::Bc3Unorm => vk::Format::BC3_UNORM_BLOCK,
        Format::Bc4Unorm => vk::Format::BC4_UNORM_BLOCK,
        Format::Bc5Unorm => vk::Format::BC5_UNORM_BLOCK,
        Format::Bc6Hf => vk::Format::BC6H_SFLOAT_BLOCK,
        Format::Bc7Unorm => vk::Format::BC7_UNORM_BLOCK,
    }
}

pub(crate) fn unmap_format(format: vk::Format) -> Option<Format> {
    Some(match format {
        vk::Format::R8G8B8A8_UNORM => Format::Rgba8Unorm,
        vk::Format::B8G8R8A8_UNORM => Format::Bgra8Unorm,
        vk::Format::A2B10G10R10_UNORM_PACK32 => Format::Bgr10A2Unorm,
        vk::Format::R16G16B16A16_SFLOAT => Format::Rgba16Float,
        vk::Format::R32G32B32A32_SFLOAT => Format::Rgba32Float,
        _ => return None,
    })
}

pub(crate) fn map_index_format(format: IndexFormat) -> vk::IndexType {
    match format {
        IndexFormat::U16 => vk::IndexType::UINT16,
        IndexFormat::U32 => vk::IndexType::UINT32,
    }
}

pub(crate) fn map_stages(stages: PipelineStages) -> vk::PipelineStageFlags {
    let mut out = vk::PipelineStageFlags::empty();
    if stages.contains(PipelineStages::TOP) {
        out |= vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    if stages.contains(PipelineStages::DRAW_INDIRECT) {
        out |= vk::PipelineStageFlags::DRAW_INDIRECT;
    }
    if stages.contains(PipelineStages::VERTEX_INPUT) {
        out |= vk::PipelineStageFlags::VERTEX_INPUT;
    }
    if stages.contains(PipelineStages::VERTEX_SHADER) {
        out |= vk::PipelineStageFlags::VERTEX_SHADER;
    }
    if stages.contains(PipelineStages::FRAGMENT_SHADER) {
        out |= vk::PipelineStageFlags::FRAGMENT_SHADER;
    }
    if stages.contains(PipelineStages::DEPTH_STENCIL) {
        out |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    }
    if stages.contains(PipelineStages::COLOR_OUTPUT) {
        out |= vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    }
    if stages.contains(PipelineStages::COMPUTE_SHADER) {
        out |= vk::PipelineStageFlags::COMPUTE_SHADER;
    }
    if stages.contains(PipelineStages::COPY) {
        out |= vk::PipelineStageFlags::TRANSFER;
    }
    if stages.contains(PipelineStages::AS_BUILD) {
        out |= vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR;
    }
    if stages.contains(PipelineStages::RAY_TRACING) {
        out |= vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR;
    }
    if stages.contains(PipelineStages::BOTTOM) {
        out |= vk::PipelineStageFlags::BOTTOM_OF_PIPE;
    }
    if out.is_empty() {
        out = vk::PipelineStageFlags::TOP_OF_PIPE;
    }
    out
}

pub(crate) fn map_access(access: Access) -> vk::AccessFlags {
    let mut out = vk::AccessFlags::empty();
    if access.contains(Access::INDIRECT_READ) {
        out |= vk::AccessFlags::INDIRECT_COMMAND_READ;
    }
    if access.contains(Access::INDEX_READ) {
        out |= vk::AccessFlags::INDEX_READ;
    }
    if access.contains(Access::VERTEX_READ) {
        out |= vk::AccessFlags::VERTEX_ATTRIBUTE_READ;
    }
    if access.contains(Access::UNIFORM_READ) {
        out |= vk::AccessFlags::UNIFORM_READ;
    }
    if access.contains(Access::SHADER_READ) {
        out |= vk::AccessFlags::SHADER_READ;
    }
    if access.contains(Access::SHADER_WRITE) {
        out |= vk::AccessFlags::SHADER_WRITE;
    }
    if access.contains(Access::COLOR_READ) {
        out |= vk::AccessFlags::COLOR_ATTACHMENT_READ;
    }
    if access.contains(Access::COLOR_WRITE) {
        out |= vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
    }
    if access.contains(Access::DEPTH_READ) {
        out |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ;
    }
    if access.contains(Access::DEPTH_WRITE) {
        out |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }
    if access.contains(Access::COPY_READ) {
        out |= vk::AccessFlags::TRANSFER_READ;
    }
    if access.contains(Access::COPY_WRITE) {
        out |= vk::AccessFlags::TRANSFER_WRITE;
    }
    if access.contains(Access::AS_READ) {
        out |= vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR;
    }
    if access.contains(Access::AS_WRITE) {
        out |= vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR;
    }
    out
}

pub(crate) fn map_layout(layout: ImageLayout) -> vk::ImageLayout {
    match layout {
        ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
        ImageLayout::General => vk::ImageLayout::GENERAL,
        ImageLayout::ColorAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        ImageLayout::DepthStencilAttachment => {
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        }
        ImageLayout::DepthStencilRead => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ImageLayout::ShaderRead => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        ImageLayout::CopySrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        ImageLayout::CopyDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        ImageLayout::Present => vk::ImageLayout::PRESENT_SRC_KHR,
    }
}

pub(crate) fn map_subresource(
    range: &SubresourceRange,
    depth_stencil: bool,
) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: if depth_stencil || range.depth_stencil {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        },
        base_mip_level: range.base_mip,
        level_count: if range.mip_count == !0 {
            vk::REMAINING_MIP_LEVELS
        } else {
            range.mip_count
        },
        base_array_layer: range.base_layer,
        layer_count: if range.layer_count == !0 {
            vk::REMAINING_ARRAY_LAYERS
        } else {
            range.layer_count
        },
    }
}

pub(crate) fn map_buffer_usage(
    usage: BufferUsage,
    flags: ResourceFlags,
    device_address: bool,
) -> vk::BufferUsageFlags {
    let mut out = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
    if flags.intersects(ResourceFlags::SHADER_RW) {
        out |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::VERTEX) {
        out |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        out |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        out |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if usage.contains(BufferUsage::SCRATCH) {
        out |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::AS) {
        out |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR;
    }
    if usage.contains(BufferUsage::AS_READ) {
        out |= vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR;
    }
    if usage.contains(BufferUsage::SBT) {
        out |= vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR;
    }
    if flags.contains(ResourceFlags::CPU_ALLOCATED) {
        out |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if device_address {
        out |= vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
    }
    out
}

pub(crate) fn map_texture_usage(usage: TextureUsage, depth: bool) -> vk::ImageUsageFlags {
    let mut out = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::SAMPLED) {
        out |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.contains(TextureUsage::STORAGE) {
        out |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::COLOR_ATTACHMENT) && !depth {
        out |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
    }
    if usage.contains(TextureUsage::DEPTH_ATTACHMENT) || depth {
        out |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(TextureUsage::COPY_SRC) {
        out |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        out |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    out
}

pub(crate) fn map_texture_type(ty: TextureType) -> vk::ImageType {
    match ty {
        TextureType::D2 | TextureType::Cube => vk::ImageType::TYPE_2D,
        TextureType::D3 => vk::ImageType::TYPE_3D,
    }
}

pub(crate) fn map_view_type(ty: TextureType) -> vk::ImageViewType {
    match ty {
        TextureType::D2 => vk::ImageViewType::TYPE_2D,
        TextureType::D3 => vk::ImageViewType::TYPE_3D,
        TextureType::Cube => vk::ImageViewType::CUBE,
    }
}

pub(crate) fn map_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

pub(crate) fn unmap_present_mode(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    Some(match mode {
        vk::PresentModeKHR::IMMEDIATE => PresentMode::Immediate,
        vk::PresentModeKHR::MAILBOX => PresentMode::Mailbox,
        vk::PresentModeKHR::FIFO => PresentMode::Fifo,
        vk::PresentModeKHR::FIFO_RELAXED => PresentMode::FifoRelaxed,
        _ => return None,
    })
}

pub(crate) fn map_filter(filter: Filter) -> vk::Filter {
    match filter {
        Filter::Nearest => vk::Filter::NEAREST,
        Filter::Linear => vk::Filter::LINEAR,
    }
}

pub(crate) fn map_mip_mode(mode: MipMode) -> vk::SamplerMipmapMode {
    match mode {
        MipMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        MipMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

pub(crate) fn map_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub(crate) fn map_border_color(color: BorderColor) -> vk::BorderColor {
    match color {
        BorderColor::TransparentBlack => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        BorderColor::OpaqueBlack => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        BorderColor::OpaqueWhite => vk::BorderColor::FLOAT_OPAQUE_WHITE,
    }
}

pub(crate) fn map_compare_op(op: CompareOp) -> vk::CompareOp {
    match op {
        CompareOp::Never => vk::CompareOp::NEVER,
        CompareOp::Less => vk::CompareOp::LESS,
        CompareOp::Equal => vk::CompareOp::EQUAL,
        CompareOp::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareOp::Greater => vk::CompareOp::GREATER,
        CompareOp::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareOp::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareOp::Always => vk::CompareOp::ALWAYS,
    }
}

pub(crate) fn map_topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::PointList => vk::PrimitiveTopology::POINT_LIST,
        Topology::LineList => vk::PrimitiveTopology::LINE_LIST,
        Topology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
    }
}

pub(crate) fn map_cull_mode(cull: CullMode) -> vk::CullModeFlags {
    match cull {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

pub(crate) fn map_blend(preset: BlendPreset) -> vk::PipelineColorBlendAttachmentState {
    let (enable, src, dst) = match preset {
        BlendPreset::Opaque => (false, vk::BlendFactor::ONE, vk::BlendFactor::ZERO),
        BlendPreset::AlphaBlend => (
            true,
            vk::BlendFactor::SRC_ALPHA,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        ),
        BlendPreset::Additive => (true, vk::BlendFactor::ONE, vk::BlendFactor::ONE),
        BlendPreset::PremultipliedAlpha => (
            true,
            vk::BlendFactor::ONE,
            vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        ),
    };
    vk::PipelineColorBlendAttachmentState {
        blend_enable: enable as _,
        src_color_blend_factor: src,
        dst_color_blend_factor: dst,
        color_blend_op: vk::BlendOp::ADD,
        src_alpha_blend_factor: src,
        dst_alpha_blend_factor: dst,
        alpha_blend_op: vk::BlendOp::ADD,
        color_write_mask: vk::ColorComponentFlags::RGBA,
    }
}

pub(crate) fn map_bind_point(kind: PipelineKind) -> vk::PipelineBindPoint {
    match kind {
        PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        PipelineKind::Graphics => vk::PipelineBindPoint::GRAPHICS,
        PipelineKind::RayTracing => vk::PipelineBindPoint::RAY_TRACING_KHR,
    }
}

pub(crate) fn map_build_flags(flags: RtasBuildFlags) -> vk::BuildAccelerationStructureFlagsKHR {
    let mut out = vk::BuildAccelerationStructureFlagsKHR::empty();
    if flags.contains(RtasBuildFlags::ALLOW_UPDATE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE;
    }
    if flags.contains(RtasBuildFlags::ALLOW_COMPACTION) {
        out |= vk::BuildAccelerationStructureFlagsKHR::ALLOW_COMPACTION;
    }
    if flags.contains(RtasBuildFlags::FAST_TRACE) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE;
    }
    if flags.contains(RtasBuildFlags::FAST_BUILD) {
        out |= vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_BUILD;
    }
    if flags.contains(RtasBuildFlags::MINIMIZE_MEMORY) {
        out |= vk::BuildAccelerationStructureFlagsKHR::LOW_MEMORY;
    }
    out
}

pub(crate) fn map_load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
        LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
    }
}

pub(crate) fn map_store_op(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

pub(crate) fn map_clear_value(value: ClearValue) -> vk::ClearValue {
    match value {
        ClearValue::Color(color) => vk::ClearValue {
            color: vk::ClearColorValue { float32: color },
        },
        ClearValue::ColorU(color) => vk::ClearValue {
            color: vk::ClearColorValue { uint32: color },
        },
        ClearValue::DepthStencil(depth, stencil) => vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        },
    }
}
