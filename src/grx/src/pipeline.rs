//! Pipelines: compute, graphics and raytracing.
//!
//! Shader binaries are opaque blobs compiled elsewhere; the runtime only
//! owns pipeline state objects and, for raytracing, the shader binding
//! table laid out from the backend's group handles.

use std::sync::Arc;

use crate::{
    backend::{BackendDevice, SbtRegion, SbtRegions},
    buffer::BufferInner,
    format::Format,
    resource::{DeviceRef, ResourceInfo},
    Backend,
};

/// Bind point of a pipeline.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PipelineKind {
    Compute,
    Graphics,
    RayTracing,
}

/// Record stride inside the shader binding table.
pub const SHADER_GROUP_STRIDE: u64 = 32;
/// Alignment of each SBT region start.
pub const SHADER_GROUP_BASE_ALIGNMENT: u64 = 64;

/// One shader stage blob plus its entry point.
#[derive(Clone, Copy, Debug)]
pub struct ShaderStage<'a> {
    /// SPIR-V or DXIL, depending on the backend.
    pub binary: &'a [u8],
    /// Entry point name.
    pub entry: &'a str,
}

/// Compute pipeline description.
#[derive(Clone, Copy, Debug)]
pub struct ComputePipelineDesc<'a> {
    /// The compute shader.
    pub shader: ShaderStage<'a>,
}

/// Primitive assembly topology.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Topology {
    PointList,
    LineList,
    TriangleList,
    TriangleStrip,
}

/// Triangle culling.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Per-attachment blending, reduced to the common presets.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BlendPreset {
    Opaque,
    AlphaBlend,
    Additive,
    PremultipliedAlpha,
}

/// Depth/stencil state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthState {
    /// Enable the depth test.
    pub test: bool,
    /// Enable depth writes.
    pub write: bool,
    /// Comparison used by the test.
    pub compare: crate::sampler::CompareOp,
}

impl Default for DepthState {
    fn default() -> Self {
        DepthState {
            test: false,
            write: false,
            compare: crate::sampler::CompareOp::Greater,
        }
    }
}

/// One vertex attribute.
#[derive(Clone, Copy, Debug)]
pub struct VertexAttribute {
    /// Binding slot the attribute reads from.
    pub binding: u32,
    /// Shader location.
    pub location: u32,
    /// Attribute format.
    pub format: Format,
    /// Byte offset inside the vertex.
    pub offset: u32,
}

/// One vertex buffer binding.
#[derive(Clone, Copy, Debug)]
pub struct VertexBinding {
    /// Binding slot.
    pub binding: u32,
    /// Byte stride between vertices.
    pub stride: u32,
    /// Step per instance instead of per vertex.
    pub per_instance: bool,
}

/// Graphics pipeline description.
#[derive(Clone, Copy, Debug)]
pub struct GraphicsPipelineDesc<'a> {
    /// Vertex shader.
    pub vertex: ShaderStage<'a>,
    /// Fragment shader; rasterizer-discard when absent.
    pub fragment: Option<ShaderStage<'a>>,
    /// Vertex attributes.
    pub attributes: &'a [VertexAttribute],
    /// Vertex buffer bindings.
    pub bindings: &'a [VertexBinding],
    /// Assembly topology.
    pub topology: Topology,
    /// Culling mode.
    pub cull: CullMode,
    /// Blending for every color attachment.
    pub blend: BlendPreset,
    /// Depth state; attachment format must be set when enabled.
    pub depth: DepthState,
    /// Color attachment formats.
    pub color_formats: &'a [Format],
    /// Depth/stencil attachment format.
    pub depth_format: Option<Format>,
    /// MSAA sample count.
    pub samples: u8,
}

/// Raytracing pipeline description.
#[derive(Clone, Copy, Debug)]
pub struct RaytracingPipelineDesc<'a> {
    /// All shader binaries: raygen, miss, hit and callable stages.
    pub stages: &'a [ShaderStage<'a>],
    /// Stage indices of raygen shaders.
    pub raygen: &'a [u32],
    /// Stage indices of miss shaders.
    pub miss: &'a [u32],
    /// Hit groups as (closest-hit, any-hit, intersection) stage indices.
    pub hit_groups: &'a [(Option<u32>, Option<u32>, Option<u32>)],
    /// Stage indices of callable shaders.
    pub callable: &'a [u32],
    /// Maximum ray payload size in bytes.
    pub max_payload_size: u8,
    /// Maximum hit attribute size in bytes.
    pub max_attribute_size: u8,
    /// Maximum recursion depth.
    pub max_recursion: u8,
}

impl<'a> RaytracingPipelineDesc<'a> {
    /// Total shader group count, in SBT order.
    pub fn group_count(&self) -> u32 {
        (self.raygen.len() + self.miss.len() + self.hit_groups.len() + self.callable.len()) as u32
    }
}

/// Group counts retained from creation for SBT range computation.
#[derive(Clone, Copy, Debug, Default)]
pub struct SbtLayout {
    /// Ray generation shader count.
    pub raygen_count: u32,
    /// Miss shader count.
    pub miss_count: u32,
    /// Hit group count.
    pub hit_count: u32,
    /// Callable shader count.
    pub callable_count: u32,
}

impl SbtLayout {
    pub(crate) fn region_size(count: u32) -> u64 {
        let bytes = count as u64 * SHADER_GROUP_STRIDE;
        (bytes + SHADER_GROUP_BASE_ALIGNMENT - 1) / SHADER_GROUP_BASE_ALIGNMENT
            * SHADER_GROUP_BASE_ALIGNMENT
    }

    /// Bytes the SBT buffer needs for all four regions.
    pub fn table_size(&self) -> u64 {
        Self::region_size(self.raygen_count)
            + Self::region_size(self.miss_count)
            + Self::region_size(self.hit_count)
            + Self::region_size(self.callable_count)
    }

    /// Compute the four regions from the table's base device address,
    /// offsetting the raygen record by `raygen_id`.
    pub fn regions(&self, base_address: u64, raygen_id: u32) -> SbtRegions {
        let mut cursor = base_address;
        let mut take = |count: u32| {
            let region = SbtRegion {
                address: cursor,
                stride: SHADER_GROUP_STRIDE,
                size: count as u64 * SHADER_GROUP_STRIDE,
            };
            cursor += Self::region_size(count);
            region
        };
        let mut raygen = take(self.raygen_count);
        let miss = take(self.miss_count);
        let hit = take(self.hit_count);
        let callable = take(self.callable_count);
        // The raygen region is a single record at the selected id.
        raygen.address += raygen_id as u64 * SHADER_GROUP_STRIDE;
        raygen.size = SHADER_GROUP_STRIDE;
        raygen.stride = SHADER_GROUP_STRIDE;
        SbtRegions {
            raygen,
            miss,
            hit,
            callable,
        }
    }
}

pub(crate) struct PipelineInner<B: Backend> {
    pub(crate) info: ResourceInfo,
    pub(crate) raw: Option<B::Pipeline>,
    pub(crate) kind: PipelineKind,
    pub(crate) sbt_layout: SbtLayout,
    pub(crate) sbt: Option<Arc<BufferInner<B>>>,
    pub(crate) device: DeviceRef<B>,
}

impl<B: Backend> PipelineInner<B> {
    pub(crate) fn raw(&self) -> &B::Pipeline {
        self.raw.as_ref().expect("pipeline already destroyed")
    }
}

impl<B: Backend> Drop for PipelineInner<B> {
    fn drop(&mut self) {
        let device = match self.device.upgrade() {
            Some(device) if !device.is_torn_down() => device,
            _ => return,
        };
        if let Some(raw) = self.raw.take() {
            unsafe { device.raw().destroy_pipeline(raw) };
        }
    }
}

/// A reference-counted pipeline state object.
pub struct Pipeline<B: Backend> {
    pub(crate) inner: Arc<PipelineInner<B>>,
}

impl<B: Backend> Clone for Pipeline<B> {
    fn clone(&self) -> Self {
        Pipeline {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Pipeline<B> {
    /// Bind point this pipeline targets.
    pub fn kind(&self) -> PipelineKind {
        self.inner.kind
    }

    /// SBT group counts; zero for non-raytracing pipelines.
    pub fn sbt_layout(&self) -> SbtLayout {
        self.inner.sbt_layout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sbt_regions_are_aligned_and_ordered() {
        let layout = SbtLayout {
            raygen_count: 3,
            miss_count: 2,
            hit_count: 5,
            callable_count: 0,
        };
        let regions = layout.regions(1 << 16, 1);
        assert_eq!(regions.raygen.address, (1 << 16) + SHADER_GROUP_STRIDE);
        assert_eq!(regions.raygen.size, SHADER_GROUP_STRIDE);
        // raygen region rounds up to 128, so miss starts there
        assert_eq!(regions.miss.address, (1 << 16) + 128);
        assert_eq!(regions.miss.size, 2 * SHADER_GROUP_STRIDE);
        assert_eq!(regions.hit.address % SHADER_GROUP_BASE_ALIGNMENT, 0);
        assert_eq!(regions.callable.size, 0);
        assert_eq!(
            layout.table_size(),
            128 + 64 + (5 * 32 + 63) / 64 * 64
        );
    }
}
