//! Resource-state tracking and barrier batching.
//!
//! Every resource carries the `(stages, access, layout)` it was left in by
//! the last barrier submitted for it. A transition request compares against
//! that memo: identical read-after-read is elided, everything else emits a
//! typed record into the current [`BarrierBatch`], which is flushed as one
//! grouped dependency at scope boundaries and forced flushes.

use std::ops::Range;

use smallvec::SmallVec;

use crate::Backend;

bitflags! {
    /// Pipeline stages a barrier can wait on or unblock.
    pub struct PipelineStages: u32 {
        /// Start of the pipe.
        const TOP = 0x1;
        /// Indirect argument consumption.
        const DRAW_INDIRECT = 0x2;
        /// Vertex/index fetch.
        const VERTEX_INPUT = 0x4;
        /// Vertex shading.
        const VERTEX_SHADER = 0x8;
        /// Fragment shading.
        const FRAGMENT_SHADER = 0x10;
        /// Depth/stencil tests.
        const DEPTH_STENCIL = 0x20;
        /// Color attachment output.
        const COLOR_OUTPUT = 0x40;
        /// Compute shading.
        const COMPUTE_SHADER = 0x80;
        /// Transfer/copy operations.
        const COPY = 0x100;
        /// Acceleration structure builds.
        const AS_BUILD = 0x200;
        /// Ray traversal and raytracing shader stages.
        const RAY_TRACING = 0x400;
        /// End of the pipe.
        const BOTTOM = 0x800;
    }
}

bitflags! {
    /// Memory access kinds.
    pub struct Access: u32 {
        /// Indirect command read.
        const INDIRECT_READ = 0x1;
        /// Index buffer read.
        const INDEX_READ = 0x2;
        /// Vertex attribute read.
        const VERTEX_READ = 0x4;
        /// Uniform buffer read.
        const UNIFORM_READ = 0x8;
        /// Sampled / storage read from any shader.
        const SHADER_READ = 0x10;
        /// Storage write from any shader.
        const SHADER_WRITE = 0x20;
        /// Color attachment read (blending).
        const COLOR_READ = 0x40;
        /// Color attachment write.
        const COLOR_WRITE = 0x80;
        /// Depth/stencil read.
        const DEPTH_READ = 0x100;
        /// Depth/stencil write.
        const DEPTH_WRITE = 0x200;
        /// Transfer read.
        const COPY_READ = 0x400;
        /// Transfer write.
        const COPY_WRITE = 0x800;
        /// Acceleration structure read (build input or traversal).
        const AS_READ = 0x1000;
        /// Acceleration structure write (build output).
        const AS_WRITE = 0x2000;
    }
}

impl Access {
    /// All writing access bits.
    pub const WRITES: Access = Access::from_bits_truncate(
        Access::SHADER_WRITE.bits()
            | Access::COLOR_WRITE.bits()
            | Access::DEPTH_WRITE.bits()
            | Access::COPY_WRITE.bits()
            | Access::AS_WRITE.bits(),
    );

    /// Whether this mask only reads.
    pub fn is_read_only(self) -> bool {
        !self.intersects(Access::WRITES)
    }
}

/// Image memory layout.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ImageLayout {
    Undefined,
    General,
    ColorAttachment,
    DepthStencilAttachment,
    DepthStencilRead,
    ShaderRead,
    CopySrc,
    CopyDst,
    Present,
}

/// Subresource window an image barrier applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubresourceRange {
    /// First mip level.
    pub base_mip: u32,
    /// Number of mip levels.
    pub mip_count: u32,
    /// First array layer.
    pub base_layer: u32,
    /// Number of array layers.
    pub layer_count: u32,
    /// Whether the depth/stencil aspect is targeted instead of color.
    pub depth_stencil: bool,
}

impl SubresourceRange {
    /// The whole color image, single plane.
    pub const COLOR: SubresourceRange = SubresourceRange {
        base_mip: 0,
        mip_count: !0,
        base_layer: 0,
        layer_count: !0,
        depth_stencil: false,
    };
}

/// State a resource was last left in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceState {
    /// Stages of the last access.
    pub stages: PipelineStages,
    /// Access mask of the last access.
    pub access: Access,
    /// Layout after the last transition (images only, `Undefined` for buffers).
    pub layout: ImageLayout,
}

impl Default for ResourceState {
    fn default() -> Self {
        ResourceState {
            stages: PipelineStages::TOP,
            access: Access::empty(),
            layout: ImageLayout::Undefined,
        }
    }
}

impl ResourceState {
    /// Whether moving to `new` requires a barrier.
    ///
    /// Identical read-to-read transitions are elided; any transition whose
    /// destination writes is always ordered, even against an identical
    /// previous write.
    pub fn needs_barrier(&self, new: &ResourceState) -> bool {
        !(self.stages == new.stages
            && self.access == new.access
            && self.layout == new.layout
            && new.access.is_read_only())
    }
}

/// A buffer barrier record referencing backend objects.
#[derive(Debug)]
pub struct BufferBarrier<'a, B: Backend> {
    /// Source stage/access.
    pub src: (PipelineStages, Access),
    /// Destination stage/access.
    pub dst: (PipelineStages, Access),
    /// Target buffer.
    pub buffer: &'a B::Buffer,
    /// Affected byte range.
    pub range: Range<u64>,
}

/// An image barrier record referencing backend objects.
#[derive(Debug)]
pub struct ImageBarrier<'a, B: Backend> {
    /// Source stage/access.
    pub src: (PipelineStages, Access),
    /// Destination stage/access.
    pub dst: (PipelineStages, Access),
    /// Source and destination layouts.
    pub layouts: (ImageLayout, ImageLayout),
    /// Target image.
    pub image: &'a B::Image,
    /// Affected subresources.
    pub range: SubresourceRange,
}

/// Typed barrier records accumulated for one grouped dependency.
pub struct BarrierBatch<'a, B: Backend> {
    /// Pending buffer barriers.
    pub buffers: SmallVec<[BufferBarrier<'a, B>; 8]>,
    /// Pending image barriers.
    pub images: SmallVec<[ImageBarrier<'a, B>; 8]>,
}

impl<'a, B: Backend> Default for BarrierBatch<'a, B> {
    fn default() -> Self {
        BarrierBatch {
            buffers: SmallVec::new(),
            images: SmallVec::new(),
        }
    }
}

impl<'a, B: Backend> BarrierBatch<'a, B> {
    /// Fresh empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    /// Request a buffer transition; `state` is the resource's memo.
    /// A record is pushed only when the memo demands one.
    pub fn transition_buffer(
        &mut self,
        state: &mut ResourceState,
        buffer: &'a B::Buffer,
        range: Range<u64>,
        stages: PipelineStages,
        access: Access,
    ) {
        let new = ResourceState {
            stages,
            access,
            layout: ImageLayout::Undefined,
        };
        if !state.needs_barrier(&new) {
            return;
        }
        self.buffers.push(BufferBarrier {
            src: (state.stages, state.access),
            dst: (stages, access),
            buffer,
            range,
        });
        *state = new;
    }

    /// Request an image transition; `state` is the resource's memo.
    pub fn transition_image(
        &mut self,
        state: &mut ResourceState,
        image: &'a B::Image,
        range: SubresourceRange,
        stages: PipelineStages,
        access: Access,
        layout: ImageLayout,
    ) {
        let new = ResourceState {
            stages,
            access,
            layout,
        };
        if !state.needs_barrier(&new) {
            return;
        }
        self.images.push(ImageBarrier {
            src: (state.stages, state.access),
            dst: (stages, access),
            layouts: (state.layout, layout),
            image,
            range,
        });
        *state = new;
    }
}

/// How a scope intends to use a resource.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TransitionType {
    ShaderRead,
    ShaderWrite,
    ShaderReadWrite,
    RenderTarget,
    DepthStencilTarget,
    CopyRead,
    CopyWrite,
    IndirectArgs,
    VertexBuffer,
    IndexBuffer,
    RtasRead,
}

/// Shader stage hint attached to a scope transition.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StageHint {
    Vertex,
    Fragment,
    Compute,
    RayTracing,
}

impl StageHint {
    fn stages(self) -> PipelineStages {
        match self {
            StageHint::Vertex => PipelineStages::VERTEX_SHADER,
            StageHint::Fragment => PipelineStages::FRAGMENT_SHADER,
            StageHint::Compute => PipelineStages::COMPUTE_SHADER,
            StageHint::RayTracing => PipelineStages::RAY_TRACING,
        }
    }
}

/// Compute the concrete `(stages, access, layout)` for a scope transition.
///
/// `is_image` selects the image layout; buffers always report `Undefined`.
pub fn resolve_transition(
    ty: TransitionType,
    hint: StageHint,
    is_image: bool,
) -> (PipelineStages, Access, ImageLayout) {
    let layout = |l| if is_image { l } else { ImageLayout::Undefined };
    match ty {
        TransitionType::ShaderRead => (
            hint.stages(),
            Access::SHADER_READ,
            layout(ImageLayout::ShaderRead),
        ),
        TransitionType::ShaderWrite | TransitionType::ShaderReadWrite => {
            let access = if ty == TransitionType::ShaderWrite {
                Access::SHADER_WRITE
            } else {
                Access::SHADER_READ | Access::SHADER_WRITE
            };
            (hint.stages(), access, layout(ImageLayout::General))
        }
        TransitionType::RenderTarget => (
            PipelineStages::COLOR_OUTPUT,
            Access::COLOR_READ | Access::COLOR_WRITE,
            layout(ImageLayout::ColorAttachment),
        ),
        TransitionType::DepthStencilTarget => (
            PipelineStages::DEPTH_STENCIL,
            Access::DEPTH_READ | Access::DEPTH_WRITE,
            layout(ImageLayout::DepthStencilAttachment),
        ),
        TransitionType::CopyRead => (
            PipelineStages::COPY,
            Access::COPY_READ,
            layout(ImageLayout::CopySrc),
        ),
        TransitionType::CopyWrite => (
            PipelineStages::COPY,
            Access::COPY_WRITE,
            layout(ImageLayout::CopyDst),
        ),
        TransitionType::IndirectArgs => (
            PipelineStages::DRAW_INDIRECT,
            Access::INDIRECT_READ,
            ImageLayout::Undefined,
        ),
        TransitionType::VertexBuffer => (
            PipelineStages::VERTEX_INPUT,
            Access::VERTEX_READ,
            ImageLayout::Undefined,
        ),
        TransitionType::IndexBuffer => (
            PipelineStages::VERTEX_INPUT,
            Access::INDEX_READ,
            ImageLayout::Undefined,
        ),
        TransitionType::RtasRead => (
            hint.stages() | PipelineStages::RAY_TRACING,
            Access::AS_READ,
            ImageLayout::Undefined,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Barriers don't touch backend objects in these tests; the uninhabited
    // test backend keeps them self-contained.
    use crate::test_stubs::NullBackend as Null;

    fn read_state() -> ResourceState {
        ResourceState {
            stages: PipelineStages::COMPUTE_SHADER,
            access: Access::SHADER_READ,
            layout: ImageLayout::Undefined,
        }
    }

    #[test]
    fn identical_read_read_is_elided() {
        let buffer = ();
        let mut batch = BarrierBatch::<Null>::new();
        let mut state = ResourceState::default();
        batch.transition_buffer(
            &mut state,
            &buffer,
            0..64,
            PipelineStages::COMPUTE_SHADER,
            Access::SHADER_READ,
        );
        assert_eq!(batch.buffers.len(), 1);
        batch.transition_buffer(
            &mut state,
            &buffer,
            0..64,
            PipelineStages::COMPUTE_SHADER,
            Access::SHADER_READ,
        );
        assert_eq!(batch.buffers.len(), 1, "second read must be elided");
        assert_eq!(state, read_state());
    }

    #[test]
    fn write_write_always_emits() {
        let buffer = ();
        let mut batch = BarrierBatch::<Null>::new();
        let mut state = ResourceState::default();
        for _ in 0..3 {
            batch.transition_buffer(
                &mut state,
                &buffer,
                0..64,
                PipelineStages::COPY,
                Access::COPY_WRITE,
            );
        }
        assert_eq!(batch.buffers.len(), 3);
    }

    #[test]
    fn barriers_chain_src_to_previous_dst() {
        let buffer = ();
        let mut batch = BarrierBatch::<Null>::new();
        let mut state = ResourceState::default();
        batch.transition_buffer(
            &mut state,
            &buffer,
            0..64,
            PipelineStages::COPY,
            Access::COPY_WRITE,
        );
        batch.transition_buffer(
            &mut state,
            &buffer,
            0..64,
            PipelineStages::VERTEX_SHADER,
            Access::SHADER_READ,
        );
        let (first, second) = (&batch.buffers[0], &batch.buffers[1]);
        assert_eq!(second.src, first.dst);
    }

    #[test]
    fn image_layout_change_emits_even_for_reads() {
        let image = ();
        let mut batch = BarrierBatch::<Null>::new();
        let mut state = ResourceState {
            stages: PipelineStages::FRAGMENT_SHADER,
            access: Access::SHADER_READ,
            layout: ImageLayout::ShaderRead,
        };
        batch.transition_image(
            &mut state,
            &image,
            SubresourceRange::COLOR,
            PipelineStages::FRAGMENT_SHADER,
            Access::SHADER_READ,
            ImageLayout::General,
        );
        assert_eq!(batch.images.len(), 1);
        assert_eq!(
            batch.images[0].layouts,
            (ImageLayout::ShaderRead, ImageLayout::General)
        );
    }

    #[test]
    fn transition_tables() {
        let (stages, access, layout) =
            resolve_transition(TransitionType::ShaderRead, StageHint::Compute, true);
        assert_eq!(stages, PipelineStages::COMPUTE_SHADER);
        assert_eq!(access, Access::SHADER_READ);
        assert_eq!(layout, ImageLayout::ShaderRead);

        let (_, access, layout) =
            resolve_transition(TransitionType::ShaderRead, StageHint::Compute, false);
        assert!(access.is_read_only());
        assert_eq!(layout, ImageLayout::Undefined);

        let (stages, access, _) =
            resolve_transition(TransitionType::RtasRead, StageHint::RayTracing, false);
        assert!(stages.contains(PipelineStages::RAY_TRACING));
        assert_eq!(access, Access::AS_READ);
    }
}
