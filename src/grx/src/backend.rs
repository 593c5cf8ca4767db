//! Backend indirection.
//!
//! Every GPU-touching operation routes through exactly one of these traits.
//! The portable layer never branches on the concrete API inside hot paths;
//! it is generic over [`Backend`] and calls through a single indirection per
//! device. The trait surface mirrors the runtime's internal dispatch table:
//! resource creation/destruction, memory, swapchain, queue, acceleration
//! structures, and the command-recording primitives the command-list
//! processor lowers to.

use std::{fmt, ops::Range};

use crate::{
    adapter::DeviceInfo,
    barrier::{BufferBarrier, ImageBarrier, SubresourceRange},
    buffer::BufferUsage,
    error::Result,
    format::IndexFormat,
    memory::Requirements,
    pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, PipelineKind, RaytracingPipelineDesc},
    resource::ResourceFlags,
    rtas::{RtasBuildCmd, RtasBuildInputs, RtasSizes},
    sampler::SamplerDesc,
    swapchain::{SurfaceCapabilities, SwapchainConfig},
    texture::TextureDesc,
    descriptor::ResourceHandle,
};

bitflags! {
    /// Options controlling instance and device bring-up.
    pub struct DeviceFlags: u32 {
        /// Enable validation, object names and leak reporting.
        const DEBUG = 0x1;
        /// Trace enabled/disabled features at init.
        const VERBOSE = 0x2;
    }
}

/// Native window handle plus the data the swapchain needs from the window
/// system collaborator.
#[derive(Clone, Copy, Debug)]
pub struct WindowHandle {
    /// Platform handle (Win32 / Wayland / Xlib).
    pub raw: raw_window_handle::RawWindowHandle,
    /// Current framebuffer size in pixels.
    pub size: (u32, u32),
}

/// A region copied between two buffers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferCopy {
    /// Byte offset in the source.
    pub src_offset: u64,
    /// Byte offset in the destination.
    pub dst_offset: u64,
    /// Length in bytes.
    pub size: u64,
}

/// A region copied from a buffer into an image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferImageCopy {
    /// Byte offset into the buffer.
    pub buffer_offset: u64,
    /// Row pitch inside the buffer, in bytes; rows are tightly packed when
    /// equal to the image row size.
    pub buffer_row_pitch: u64,
    /// Destination texel origin.
    pub origin: [u32; 3],
    /// Copied extent in texels.
    pub extent: [u32; 3],
    /// Destination mip level.
    pub mip: u32,
    /// Destination array layer.
    pub layer: u32,
}

/// A region copied between two images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageCopy {
    /// Source origin.
    pub src_origin: [u32; 3],
    /// Destination origin.
    pub dst_origin: [u32; 3],
    /// Copied extent.
    pub extent: [u32; 3],
    /// Source mip level.
    pub src_mip: u32,
    /// Destination mip level.
    pub dst_mip: u32,
}

/// Clear payload for images and attachments.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClearValue {
    /// Float color.
    Color([f32; 4]),
    /// Unsigned integer color.
    ColorU([u32; 4]),
    /// Depth and stencil.
    DepthStencil(f32, u32),
}

/// Viewport state.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Viewport {
    /// Left edge.
    pub x: f32,
    /// Top edge.
    pub y: f32,
    /// Width.
    pub width: f32,
    /// Height.
    pub height: f32,
    /// Minimum depth.
    pub min_depth: f32,
    /// Maximum depth.
    pub max_depth: f32,
}

/// Scissor / render-area rectangle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Rect {
    /// Left edge.
    pub x: i32,
    /// Top edge.
    pub y: i32,
    /// Width.
    pub width: u32,
    /// Height.
    pub height: u32,
}

/// Attachment load behavior at `StartRendering`.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOp {
    Load,
    Clear,
    DontCare,
}

/// Attachment store behavior at `EndRendering`.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Store,
    DontCare,
}

/// One attachment of a dynamic rendering scope.
pub struct RenderingAttachment<'a, B: Backend> {
    /// Target image.
    pub image: &'a B::Image,
    /// Load behavior.
    pub load: LoadOp,
    /// Store behavior.
    pub store: StoreOp,
    /// Clear payload when `load == Clear`.
    pub clear: ClearValue,
    /// MSAA resolve target.
    pub resolve: Option<&'a B::Image>,
}

/// Full description of a dynamic rendering scope.
pub struct RenderingDesc<'a, B: Backend> {
    /// Color attachments.
    pub colors: &'a [RenderingAttachment<'a, B>],
    /// Depth attachment.
    pub depth: Option<RenderingAttachment<'a, B>>,
    /// Stencil attachment.
    pub stencil: Option<RenderingAttachment<'a, B>>,
    /// Rendered area.
    pub area: Rect,
}

/// One shader-binding-table sub-range.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtRegion {
    /// Device address of the start of the region.
    pub address: u64,
    /// Record stride.
    pub stride: u64,
    /// Region size in bytes.
    pub size: u64,
}

/// The four shader-binding-table regions of a `DispatchRays`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SbtRegions {
    /// Ray generation; `size == stride`.
    pub raygen: SbtRegion,
    /// Miss shaders.
    pub miss: SbtRegion,
    /// Hit groups.
    pub hit: SbtRegion,
    /// Callable shaders.
    pub callable: SbtRegion,
}

/// Vertex-count form of a draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrawArgs {
    /// Vertices (or indices when indexed) per instance.
    pub count: u32,
    /// Instance count.
    pub instance_count: u32,
    /// First vertex (or first index).
    pub first: u32,
    /// Base vertex offset for indexed draws.
    pub vertex_offset: i32,
    /// First instance.
    pub first_instance: u32,
    /// Whether an index buffer is consumed.
    pub indexed: bool,
}

/// Arguments for one queue submission.
pub struct SubmitDesc<'a, B: Backend> {
    /// Timeline value to wait for before execution, if any.
    pub wait_value: Option<u64>,
    /// Timeline value signaled at completion, if any.
    pub signal_value: Option<u64>,
    /// Swapchains whose acquire semaphores gate execution.
    pub wait_swapchains: &'a [&'a B::Swapchain],
    /// Frame slot, `(submit_id - 1) % 3`.
    pub frame_slot: usize,
    /// Signal the per-frame binary semaphore consumed by the following
    /// present.
    pub signal_present: bool,
}

/// The types a concrete graphics API plugs into the portable layer.
#[allow(missing_docs)]
pub trait Backend: 'static + Sized + fmt::Debug {
    type Instance: BackendInstance<Self>;
    type Surface: fmt::Debug + Send + Sync;
    type Device: BackendDevice<Self>;

    type Memory: fmt::Debug + Send + Sync;
    type Buffer: fmt::Debug + Send + Sync;
    type Image: fmt::Debug + Send + Sync;
    type Sampler: fmt::Debug + Send + Sync;
    type Swapchain: fmt::Debug + Send + Sync;
    type Pipeline: fmt::Debug + Send + Sync;
    type AccelerationStructure: fmt::Debug + Send + Sync;

    type CommandPool: fmt::Debug + Send;
    type CommandBuffer: BackendCommandBuffer<Self>;
}

/// Root object of a backend.
pub trait BackendInstance<B: Backend>: Sized + Send + Sync {
    /// Bring up the API, optionally with validation.
    fn create(app_name: &str, app_version: u32, flags: DeviceFlags) -> Result<Self>;

    /// Enumerate physical devices.
    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Create a presentation surface for a native window.
    fn create_surface(&self, window: &WindowHandle) -> Result<B::Surface>;

    /// Destroy a surface. All swapchains on it must be gone.
    unsafe fn destroy_surface(&self, surface: B::Surface);

    /// Open a logical device on the given physical device.
    fn open_device(&self, info: &DeviceInfo, flags: DeviceFlags) -> Result<B::Device>;
}

/// Logical device entry points. All `unsafe fn`s require externally
/// synchronized, valid handles; the portable layer's locks provide that.
pub trait BackendDevice<B: Backend>: Send + Sync {
    // Memory

    /// Allocate a memory block from `type_id`.
    unsafe fn allocate_memory(&self, type_id: u32, size: u64, name: &str) -> Result<B::Memory>;
    /// Release a memory block.
    unsafe fn free_memory(&self, memory: B::Memory);
    /// Persistently map a host-visible block.
    unsafe fn map_memory(&self, memory: &B::Memory) -> Result<*mut u8>;
    /// Flush written ranges of a non-coherent mapping.
    unsafe fn flush_mapped(&self, memory: &B::Memory, ranges: &[Range<u64>]) -> Result<()>;
    /// Bytes currently allocated from the chosen heap class, when the
    /// backend can report it.
    fn memory_budget(&self, device_local: bool) -> Option<u64>;

    // Buffers

    /// Create an unbound buffer.
    unsafe fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        flags: ResourceFlags,
        name: &str,
    ) -> Result<B::Buffer>;
    /// Query placement requirements.
    unsafe fn buffer_requirements(&self, buffer: &B::Buffer) -> Requirements;
    /// Bind buffer storage.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: &B::Buffer,
        memory: &B::Memory,
        offset: u64,
    ) -> Result<()>;
    /// GPU virtual address of a bound buffer.
    unsafe fn buffer_address(&self, buffer: &B::Buffer) -> u64;
    /// Destroy a buffer.
    unsafe fn destroy_buffer(&self, buffer: B::Buffer);

    // Images

    /// Create an unbound image.
    unsafe fn create_image(&self, desc: &TextureDesc, name: &str) -> Result<B::Image>;
    /// Query placement requirements.
    unsafe fn image_requirements(&self, image: &B::Image) -> Requirements;
    /// Bind image storage and create its default views.
    unsafe fn bind_image_memory(
        &self,
        image: &B::Image,
        desc: &TextureDesc,
        memory: &B::Memory,
        offset: u64,
    ) -> Result<()>;
    /// Destroy an image and its views.
    unsafe fn destroy_image(&self, image: B::Image);

    // Samplers

    /// Create a sampler.
    unsafe fn create_sampler(&self, desc: &SamplerDesc, name: &str) -> Result<B::Sampler>;
    /// Destroy a sampler.
    unsafe fn destroy_sampler(&self, sampler: B::Sampler);

    // Bindless heap

    /// Point a heap slot at a buffer range.
    unsafe fn write_buffer_descriptor(
        &self,
        handle: ResourceHandle,
        buffer: &B::Buffer,
        offset: u64,
        size: u64,
    );
    /// Point a heap slot at an image view; the handle's type selects the
    /// read or read-write binding.
    unsafe fn write_image_descriptor(&self, handle: ResourceHandle, image: &B::Image);
    /// Point a heap slot at a sampler.
    unsafe fn write_sampler_descriptor(&self, handle: ResourceHandle, sampler: &B::Sampler);
    /// Point a heap slot at a top-level acceleration structure.
    unsafe fn write_tlas_descriptor(
        &self,
        handle: ResourceHandle,
        tlas: &B::AccelerationStructure,
    );
    /// Wire the three per-frame constant buffers into their versioned
    /// uniform sets. Called once at device bring-up.
    unsafe fn init_frame_uniforms(&self, buffers: [&B::Buffer; 3], size: u64) -> Result<()>;

    // Swapchain

    /// Query surface formats, present modes and usage support.
    fn surface_capabilities(&self, surface: &B::Surface) -> Result<SurfaceCapabilities>;
    /// Create (or re-create, handing off `old`) a swapchain and return its
    /// images.
    unsafe fn create_swapchain(
        &self,
        surface: &B::Surface,
        config: &SwapchainConfig,
        old: Option<B::Swapchain>,
    ) -> Result<(B::Swapchain, Vec<B::Image>)>;
    /// Destroy a swapchain (not its images; they die with it).
    unsafe fn destroy_swapchain(&self, swapchain: B::Swapchain);
    /// Acquire the next image, signaling the swapchain's internal acquire
    /// semaphore for `frame_slot`. Blocks until an image is available.
    unsafe fn acquire_image(&self, swapchain: &B::Swapchain, frame_slot: usize) -> Result<u32>;
    /// Present acquired images, waiting on the per-frame binary semaphore.
    /// `tearing` requests immediate presentation without vsync.
    unsafe fn present(
        &self,
        swapchains: &[(&B::Swapchain, u32)],
        frame_slot: usize,
        tearing: bool,
    ) -> Result<()>;

    // Command pools and submission

    /// Create a transient command pool on the graphics queue.
    unsafe fn create_command_pool(&self, name: &str) -> Result<B::CommandPool>;
    /// Destroy a pool and its buffers.
    unsafe fn destroy_command_pool(&self, pool: B::CommandPool);
    /// Reset a pool, releasing buffer memory back to it.
    unsafe fn reset_command_pool(&self, pool: &mut B::CommandPool) -> Result<()>;
    /// Allocate a primary command buffer.
    unsafe fn allocate_command_buffer(&self, pool: &mut B::CommandPool)
        -> Result<B::CommandBuffer>;
    /// Begin recording.
    unsafe fn begin_command_buffer(&self, cmd: &mut B::CommandBuffer) -> Result<()>;
    /// End recording.
    unsafe fn end_command_buffer(&self, cmd: &mut B::CommandBuffer) -> Result<()>;
    /// Submit to the graphics queue with timeline fencing.
    unsafe fn submit(&self, cmd: Option<&B::CommandBuffer>, desc: &SubmitDesc<B>) -> Result<()>;
    /// Block until the timeline reaches `value`.
    unsafe fn wait_timeline(&self, value: u64) -> Result<()>;
    /// Block until the device is idle.
    unsafe fn wait_idle(&self) -> Result<()>;

    // Pipelines

    /// Create a compute pipeline from an opaque shader blob.
    unsafe fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        name: &str,
    ) -> Result<B::Pipeline>;
    /// Create a graphics pipeline.
    unsafe fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        name: &str,
    ) -> Result<B::Pipeline>;
    /// Create a raytracing pipeline.
    unsafe fn create_raytracing_pipeline(
        &self,
        desc: &RaytracingPipelineDesc,
        name: &str,
    ) -> Result<B::Pipeline>;
    /// Opaque shader-group handle blob for SBT construction.
    unsafe fn sbt_group_handles(&self, pipeline: &B::Pipeline, group_count: u32)
        -> Result<Vec<u8>>;
    /// Destroy a pipeline.
    unsafe fn destroy_pipeline(&self, pipeline: B::Pipeline);

    // Acceleration structures

    /// Query buffer sizes for a build.
    unsafe fn rtas_build_sizes(&self, inputs: &RtasBuildInputs<B>) -> Result<RtasSizes>;
    /// Create an acceleration structure inside `buffer`.
    unsafe fn create_rtas(
        &self,
        buffer: &B::Buffer,
        offset: u64,
        size: u64,
        top_level: bool,
    ) -> Result<B::AccelerationStructure>;
    /// Device address used by TLAS instance records and descriptors.
    unsafe fn rtas_address(&self, rtas: &B::AccelerationStructure) -> u64;
    /// Destroy an acceleration structure (not its backing buffer).
    unsafe fn destroy_rtas(&self, rtas: B::AccelerationStructure);
}

/// Recording primitives the command-list processor lowers portable ops to.
pub trait BackendCommandBuffer<B: Backend>: fmt::Debug + Send {
    /// Emit one grouped dependency.
    unsafe fn pipeline_barrier(&mut self, buffers: &[BufferBarrier<B>], images: &[ImageBarrier<B>]);
    /// Copy between buffers.
    unsafe fn copy_buffer(&mut self, src: &B::Buffer, dst: &B::Buffer, regions: &[BufferCopy]);
    /// Copy buffer contents into an image.
    unsafe fn copy_buffer_to_image(
        &mut self,
        src: &B::Buffer,
        dst: &B::Image,
        desc: &TextureDesc,
        regions: &[BufferImageCopy],
    );
    /// Copy between images.
    unsafe fn copy_image(&mut self, src: &B::Image, dst: &B::Image, regions: &[ImageCopy]);
    /// Clear an image outside a rendering scope.
    unsafe fn clear_image(&mut self, image: &B::Image, value: ClearValue, range: SubresourceRange);

    /// Open a dynamic rendering scope.
    unsafe fn begin_rendering(&mut self, desc: &RenderingDesc<B>);
    /// Close the current dynamic rendering scope.
    unsafe fn end_rendering(&mut self);

    /// Bind a pipeline at the given bind point.
    unsafe fn bind_pipeline(&mut self, kind: PipelineKind, pipeline: &B::Pipeline);
    /// Bind the global resource/sampler sets plus the per-frame uniform set.
    unsafe fn bind_frame_descriptors(&mut self, device: &B::Device, frame_slot: usize);

    /// Latch viewport state.
    unsafe fn set_viewport(&mut self, viewport: &Viewport);
    /// Latch scissor state.
    unsafe fn set_scissor(&mut self, rect: &Rect);
    /// Latch the stencil reference.
    unsafe fn set_stencil_reference(&mut self, reference: u32);
    /// Latch blend constants.
    unsafe fn set_blend_constants(&mut self, constants: [f32; 4]);
    /// Bind the index buffer.
    unsafe fn bind_index_buffer(&mut self, buffer: &B::Buffer, offset: u64, format: IndexFormat);
    /// Bind vertex buffers starting at `first_binding`.
    unsafe fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[(&B::Buffer, u64)]);

    /// Direct draw.
    unsafe fn draw(&mut self, args: &DrawArgs);
    /// Indirect draw; `indexed` selects the argument layout.
    unsafe fn draw_indirect(
        &mut self,
        buffer: &B::Buffer,
        offset: u64,
        draw_count: u32,
        stride: u32,
        indexed: bool,
    );
    /// Indirect draw with a GPU-provided count.
    unsafe fn draw_indirect_count(
        &mut self,
        buffer: &B::Buffer,
        offset: u64,
        count_buffer: &B::Buffer,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
        indexed: bool,
    );
    /// Direct dispatch.
    unsafe fn dispatch(&mut self, groups: [u32; 3]);
    /// Indirect dispatch.
    unsafe fn dispatch_indirect(&mut self, buffer: &B::Buffer, offset: u64);
    /// Trace rays over the SBT regions.
    unsafe fn trace_rays(&mut self, sbt: &SbtRegions, extent: [u32; 3]);
    /// Trace rays with GPU-provided dimensions.
    unsafe fn trace_rays_indirect(&mut self, sbt: &SbtRegions, args_address: u64);

    /// Record an acceleration structure build.
    unsafe fn build_rtas(&mut self, cmd: &RtasBuildCmd<B>);

    /// Open a named debug region.
    unsafe fn begin_debug_region(&mut self, name: &str, color: [f32; 4]);
    /// Close the innermost debug region.
    unsafe fn end_debug_region(&mut self);
    /// Drop a point marker.
    unsafe fn insert_debug_marker(&mut self, name: &str);
}
