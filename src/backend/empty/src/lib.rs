//! Headless mock backend.
//!
//! Memory blocks are plain host allocations, buffer copies execute eagerly
//! on the CPU, and every recorded command lands in a journal the core's
//! integration tests inspect. Timeline signals complete instantly, which
//! makes the scheduler's fencing observable without a GPU.

use std::{
    ops::Range,
    sync::{
        atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use grx::{
    adapter::{Capabilities, DeviceInfo, DeviceType, Limits},
    backend as gb,
    barrier::{BufferBarrier, ImageBarrier, SubresourceRange},
    descriptor::ResourceHandle,
    error::{Error, Result},
    memory::{MemoryFlags, MemoryProperties, MemoryType, Requirements},
    rtas::{RtasBuildCmd, RtasBuildInputs, RtasSizes},
    swapchain::{PresentMode, SurfaceCapabilities, SwapchainConfig},
    texture::TextureDesc,
};

/// The mock backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {}

impl grx::Backend for Backend {
    type Instance = Instance;
    type Surface = Surface;
    type Device = Device;
    type Memory = Memory;
    type Buffer = Buffer;
    type Image = Image;
    type Sampler = Sampler;
    type Swapchain = Swapchain;
    type Pipeline = Pipeline;
    type AccelerationStructure = AccelerationStructure;
    type CommandPool = CommandPool;
    type CommandBuffer = CommandBuffer;
}

/// One entry of the recorded command journal.
#[derive(Clone, Debug, PartialEq)]
pub enum JournalOp {
    /// A grouped dependency with its barrier counts.
    Barrier {
        buffers: usize,
        images: usize,
    },
    /// A buffer-to-buffer copy (region count, total bytes).
    CopyBuffer {
        regions: usize,
        bytes: u64,
    },
    /// A buffer-to-image copy.
    CopyBufferToImage {
        regions: usize,
    },
    CopyImage {
        regions: usize,
    },
    ClearImage,
    BeginRendering {
        colors: usize,
        has_depth: bool,
    },
    EndRendering,
    BindPipeline,
    BindFrameDescriptors {
        slot: usize,
    },
    Draw,
    DrawIndirect,
    Dispatch,
    TraceRays,
    /// An acceleration structure build.
    BuildRtas {
        top_level: bool,
        refit: bool,
        dst: u64,
        scratch_size: u64,
    },
    DebugRegion(String),
    Submit {
        signal: Option<u64>,
    },
    Present {
        count: usize,
    },
}

#[derive(Default)]
struct DeviceState {
    journal: Mutex<Vec<JournalOp>>,
    timeline: AtomicU64,
    next_address: AtomicU64,
    next_rtas: AtomicU64,
    live_memory: AtomicUsize,
}

/// Mock instance.
pub struct Instance {
    /// Flags the instance was created with.
    pub flags: gb::DeviceFlags,
}

/// Mock surface.
#[derive(Debug)]
pub struct Surface;

/// Mock logical device; owns the journal.
pub struct Device {
    state: Arc<DeviceState>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "EmptyDevice")
    }
}

impl Device {
    /// Snapshot of everything recorded so far.
    pub fn journal(&self) -> Vec<JournalOp> {
        self.state.journal.lock().clone()
    }

    /// Drop all journal entries.
    pub fn clear_journal(&self) {
        self.state.journal.lock().clear();
    }

    /// Number of live memory blocks.
    pub fn live_memory_blocks(&self) -> usize {
        self.state.live_memory.load(Ordering::Acquire)
    }

    fn record(&self, op: JournalOp) {
        self.state.journal.lock().push(op);
    }
}

/// A host allocation standing in for device memory.
pub struct Memory {
    data: *mut u8,
    len: usize,
    state: Arc<DeviceState>,
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Memory({} bytes)", self.len)
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        unsafe {
            drop(Vec::from_raw_parts(self.data, self.len, self.len));
        }
        self.state.live_memory.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Mock buffer; remembers where it was bound so copies can execute.
pub struct Buffer {
    size: u64,
    bound: AtomicU64,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Buffer({} bytes)", self.size)
    }
}

impl Buffer {
    fn ptr(&self) -> *mut u8 {
        self.bound.load(Ordering::Acquire) as *mut u8
    }
}

/// Mock image.
#[derive(Debug)]
pub struct Image {
    width: u32,
    height: u32,
}

/// Mock sampler.
#[derive(Debug)]
pub struct Sampler;

/// Mock swapchain with a round-robin image counter.
#[derive(Debug)]
pub struct Swapchain {
    image_count: u32,
    next: AtomicU32,
}

/// Mock pipeline.
#[derive(Debug)]
pub struct Pipeline;

/// Mock acceleration structure.
#[derive(Debug)]
pub struct AccelerationStructure {
    id: u64,
    top_level: bool,
}

/// Mock command pool.
#[derive(Debug, Default)]
pub struct CommandPool;

/// Mock command buffer writing into the device journal.
pub struct CommandBuffer {
    state: Arc<DeviceState>,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "EmptyCommandBuffer")
    }
}

impl CommandBuffer {
    fn record(&self, op: JournalOp) {
        self.state.journal.lock().push(op);
    }
}

impl gb::BackendInstance<Backend> for Instance {
    fn create(_app_name: &str, _app_version: u32, flags: gb::DeviceFlags) -> Result<Self> {
        Ok(Instance { flags })
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(vec![DeviceInfo {
            name: "empty".to_owned(),
            vendor: 0,
            device: 0,
            device_type: DeviceType::DiscreteGpu,
            capabilities: Capabilities::all(),
            limits: Limits {
                max_allocation_size: 256 << 20,
                dedicated_memory: 4 << 30,
                shared_memory: 4 << 30,
                non_coherent_atom_size: 1,
                buffer_copy_offset_alignment: 4,
                buffer_copy_pitch_alignment: 1,
                uniform_buffer_offset_alignment: 256,
                buffer_image_granularity: 1,
                max_texture_size: 16384,
            },
            memory: MemoryProperties {
                heaps: vec![4 << 30, 4 << 30],
                types: vec![
                    MemoryType {
                        flags: MemoryFlags::DEVICE_LOCAL,
                        heap_index: 0,
                    },
                    MemoryType {
                        flags: MemoryFlags::HOST_VISIBLE | MemoryFlags::COHERENT,
                        heap_index: 1,
                    },
                ],
            },
            physical_index: 0,
        }])
    }

    fn create_surface(&self, _window: &gb::WindowHandle) -> Result<Surface> {
        Ok(Surface)
    }

    unsafe fn destroy_surface(&self, _surface: Surface) {}

    fn open_device(&self, _info: &DeviceInfo, _flags: gb::DeviceFlags) -> Result<Device> {
        Ok(Device {
            state: Arc::new(DeviceState::default()),
        })
    }
}

impl gb::BackendDevice<Backend> for Device {
    unsafe fn allocate_memory(&self, _type_id: u32, size: u64, _name: &str) -> Result<Memory> {
        let mut data = vec![0u8; size as usize];
        let ptr = data.as_mut_ptr();
        std::mem::forget(data);
        self.state.live_memory.fetch_add(1, Ordering::AcqRel);
        Ok(Memory {
            data: ptr,
            len: size as usize,
            state: Arc::clone(&self.state),
        })
    }

    unsafe fn free_memory(&self, memory: Memory) {
        drop(memory);
    }

    unsafe fn map_memory(&self, memory: &Memory) -> Result<*mut u8> {
        Ok(memory.data)
    }

    unsafe fn flush_mapped(&self, _memory: &Memory, _ranges: &[Range<u64>]) -> Result<()> {
        Ok(())
    }

    fn memory_budget(&self, _device_local: bool) -> Option<u64> {
        None
    }

    unsafe fn create_buffer(
        &self,
        size: u64,
        _usage: grx::BufferUsage,
        _flags: grx::ResourceFlags,
        _name: &str,
    ) -> Result<Buffer> {
        Ok(Buffer {
            size,
            bound: AtomicU64::new(0),
        })
    }

    unsafe fn buffer_requirements(&self, buffer: &Buffer) -> Requirements {
        Requirements {
            size: buffer.size,
            alignment: 16,
            type_mask: 0b11,
            prefers_dedicated: false,
            requires_dedicated: false,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: &Buffer,
        memory: &Memory,
        offset: u64,
    ) -> Result<()> {
        buffer
            .bound
            .store(memory.data.add(offset as usize) as u64, Ordering::Release);
        Ok(())
    }

    unsafe fn buffer_address(&self, _buffer: &Buffer) -> u64 {
        (self.state.next_address.fetch_add(1, Ordering::AcqRel) + 1) << 16
    }

    unsafe fn destroy_buffer(&self, _buffer: Buffer) {}

    unsafe fn create_image(&self, desc: &TextureDesc, _name: &str) -> Result<Image> {
        Ok(Image {
            width: desc.width,
            height: desc.height,
        })
    }

    unsafe fn image_requirements(&self, image: &Image) -> Requirements {
        Requirements {
            size: (image.width as u64 * image.height as u64 * 4).max(16),
            alignment: 256,
            type_mask: 0b11,
            prefers_dedicated: false,
            requires_dedicated: false,
        }
    }

    unsafe fn bind_image_memory(
        &self,
        _image: &Image,
        _desc: &TextureDesc,
        _memory: &Memory,
        _offset: u64,
    ) -> Result<()> {
        Ok(())
    }

    unsafe fn destroy_image(&self, _image: Image) {}

    unsafe fn create_sampler(&self, _desc: &grx::SamplerDesc, _name: &str) -> Result<Sampler> {
        Ok(Sampler)
    }

    unsafe fn destroy_sampler(&self, _sampler: Sampler) {}

    unsafe fn write_buffer_descriptor(
        &self,
        _handle: ResourceHandle,
        _buffer: &Buffer,
        _offset: u64,
        _size: u64,
    ) {
    }

    unsafe fn write_image_descriptor(&self, _handle: ResourceHandle, _image: &Image) {}

    unsafe fn write_sampler_descriptor(&self, _handle: ResourceHandle, _sampler: &Sampler) {}

    unsafe fn write_tlas_descriptor(
        &self,
        _handle: ResourceHandle,
        _tlas: &AccelerationStructure,
    ) {
    }

    unsafe fn init_frame_uniforms(&self, _buffers: [&Buffer; 3], _size: u64) -> Result<()> {
        Ok(())
    }

    fn surface_capabilities(&self, _surface: &Surface) -> Result<SurfaceCapabilities> {
        Ok(SurfaceCapabilities {
            formats: vec![
                grx::Format::Bgra8Unorm,
                grx::Format::Rgba8Unorm,
                grx::Format::Rgba16Float,
            ],
            present_modes: vec![PresentMode::Immediate, PresentMode::Mailbox, PresentMode::Fifo],
            supports_storage: true,
            current_extent: None,
        })
    }

    unsafe fn create_swapchain(
        &self,
        _surface: &Surface,
        config: &SwapchainConfig,
        old: Option<Swapchain>,
    ) -> Result<(Swapchain, Vec<Image>)> {
        drop(old);
        let images = (0..config.image_count)
            .map(|_| Image {
                width: config.extent.0,
                height: config.extent.1,
            })
            .collect();
        Ok((
            Swapchain {
                image_count: config.image_count,
                next: AtomicU32::new(0),
            },
            images,
        ))
    }

    unsafe fn destroy_swapchain(&self, _swapchain: Swapchain) {}

    unsafe fn acquire_image(&self, swapchain: &Swapchain, _frame_slot: usize) -> Result<u32> {
        let next = swapchain.next.fetch_add(1, Ordering::AcqRel);
        Ok(next % swapchain.image_count)
    }

    unsafe fn present(
        &self,
        swapchains: &[(&Swapchain, u32)],
        _frame_slot: usize,
        _tearing: bool,
    ) -> Result<()> {
        self.record(JournalOp::Present {
            count: swapchains.len(),
        });
        Ok(())
    }

    unsafe fn create_command_pool(&self, _name: &str) -> Result<CommandPool> {
        Ok(CommandPool)
    }

    unsafe fn destroy_command_pool(&self, _pool: CommandPool) {}

    unsafe fn reset_command_pool(&self, _pool: &mut CommandPool) -> Result<()> {
        Ok(())
    }

    unsafe fn allocate_command_buffer(&self, _pool: &mut CommandPool) -> Result<CommandBuffer> {
        Ok(CommandBuffer {
            state: Arc::clone(&self.state),
        })
    }

    unsafe fn begin_command_buffer(&self, _cmd: &mut CommandBuffer) -> Result<()> {
        Ok(())
    }

    unsafe fn end_command_buffer(&self, _cmd: &mut CommandBuffer) -> Result<()> {
        Ok(())
    }

    unsafe fn submit(
        &self,
        _cmd: Option<&CommandBuffer>,
        desc: &gb::SubmitDesc<Backend>,
    ) -> Result<()> {
        if let Some(value) = desc.signal_value {
            self.state.timeline.store(value, Ordering::Release);
        }
        self.record(JournalOp::Submit {
            signal: desc.signal_value,
        });
        Ok(())
    }

    unsafe fn wait_timeline(&self, value: u64) -> Result<()> {
        // Work completes at submission; a wait on a value that was never
        // signaled would spin forever on real hardware.
        if value > self.state.timeline.load(Ordering::Acquire) {
            return Err(Error::TimedOut("timeline value was never signaled"));
        }
        Ok(())
    }

    unsafe fn wait_idle(&self) -> Result<()> {
        Ok(())
    }

    unsafe fn create_compute_pipeline(
        &self,
        _desc: &grx::ComputePipelineDesc,
        _name: &str,
    ) -> Result<Pipeline> {
        Ok(Pipeline)
    }

    unsafe fn create_graphics_pipeline(
        &self,
        _desc: &grx::GraphicsPipelineDesc,
        _name: &str,
    ) -> Result<Pipeline> {
        Ok(Pipeline)
    }

    unsafe fn create_raytracing_pipeline(
        &self,
        _desc: &grx::RaytracingPipelineDesc,
        _name: &str,
    ) -> Result<Pipeline> {
        Ok(Pipeline)
    }

    unsafe fn sbt_group_handles(&self, _pipeline: &Pipeline, group_count: u32) -> Result<Vec<u8>> {
        Ok(vec![0xAB; group_count as usize * 32])
    }

    unsafe fn destroy_pipeline(&self, _pipeline: Pipeline) {}

    unsafe fn rtas_build_sizes(&self, inputs: &RtasBuildInputs<Backend>) -> Result<RtasSizes> {
        let count = inputs.primitive_count as u64;
        Ok(RtasSizes {
            structure: count * 128 + 256,
            build_scratch: count * 64 + 64,
            update_scratch: count * 32 + 64,
        })
    }

    unsafe fn create_rtas(
        &self,
        _buffer: &Buffer,
        _offset: u64,
        _size: u64,
        top_level: bool,
    ) -> Result<AccelerationStructure> {
        Ok(AccelerationStructure {
            id: self.state.next_rtas.fetch_add(1, Ordering::AcqRel) + 1,
            top_level,
        })
    }

    unsafe fn rtas_address(&self, rtas: &AccelerationStructure) -> u64 {
        rtas.id << 24
    }

    unsafe fn destroy_rtas(&self, _rtas: AccelerationStructure) {}
}

impl gb::BackendCommandBuffer<Backend> for CommandBuffer {
    unsafe fn pipeline_barrier(
        &mut self,
        buffers: &[BufferBarrier<Backend>],
        images: &[ImageBarrier<Backend>],
    ) {
        self.record(JournalOp::Barrier {
            buffers: buffers.len(),
            images: images.len(),
        });
    }

    unsafe fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, regions: &[gb::BufferCopy]) {
        let mut bytes = 0;
        for region in regions {
            std::ptr::copy_nonoverlapping(
                src.ptr().add(region.src_offset as usize),
                dst.ptr().add(region.dst_offset as usize),
                region.size as usize,
            );
            bytes += region.size;
        }
        self.record(JournalOp::CopyBuffer {
            regions: regions.len(),
            bytes,
        });
    }

    unsafe fn copy_buffer_to_image(
        &mut self,
        _src: &Buffer,
        _dst: &Image,
        _desc: &TextureDesc,
        regions: &[gb::BufferImageCopy],
    ) {
        self.record(JournalOp::CopyBufferToImage {
            regions: regions.len(),
        });
    }

    unsafe fn copy_image(&mut self, _src: &Image, _dst: &Image, regions: &[gb::ImageCopy]) {
        self.record(JournalOp::CopyImage {
            regions: regions.len(),
        });
    }

    unsafe fn clear_image(&mut self, _image: &Image, _value: gb::ClearValue, _range: SubresourceRange) {
        self.record(JournalOp::ClearImage);
    }

    unsafe fn begin_rendering(&mut self, desc: &gb::RenderingDesc<Backend>) {
        self.record(JournalOp::BeginRendering {
            colors: desc.colors.len(),
            has_depth: desc.depth.is_some(),
        });
    }

    unsafe fn end_rendering(&mut self) {
        self.record(JournalOp::EndRendering);
    }

    unsafe fn bind_pipeline(&mut self, _kind: grx::PipelineKind, _pipeline: &Pipeline) {
        self.record(JournalOp::BindPipeline);
    }

    unsafe fn bind_frame_descriptors(&mut self, _device: &Device, slot: usize) {
        self.record(JournalOp::BindFrameDescriptors { slot });
    }

    unsafe fn set_viewport(&mut self, _viewport: &gb::Viewport) {}

    unsafe fn set_scissor(&mut self, _rect: &gb::Rect) {}

    unsafe fn set_stencil_reference(&mut self, _reference: u32) {}

    unsafe fn set_blend_constants(&mut self, _constants: [f32; 4]) {}

    unsafe fn bind_index_buffer(&mut self, _buffer: &Buffer, _offset: u64, _format: grx::IndexFormat) {
    }

    unsafe fn bind_vertex_buffers(&mut self, _first_binding: u32, _buffers: &[(&Buffer, u64)]) {}

    unsafe fn draw(&mut self, _args: &gb::DrawArgs) {
        self.record(JournalOp::Draw);
    }

    unsafe fn draw_indirect(
        &mut self,
        _buffer: &Buffer,
        _offset: u64,
        _draw_count: u32,
        _stride: u32,
        _indexed: bool,
    ) {
        self.record(JournalOp::DrawIndirect);
    }

    unsafe fn draw_indirect_count(
        &mut self,
        _buffer: &Buffer,
        _offset: u64,
        _count_buffer: &Buffer,
        _count_offset: u64,
        _max_draw_count: u32,
        _stride: u32,
        _indexed: bool,
    ) {
        self.record(JournalOp::DrawIndirect);
    }

    unsafe fn dispatch(&mut self, _groups: [u32; 3]) {
        self.record(JournalOp::Dispatch);
    }

    unsafe fn dispatch_indirect(&mut self, _buffer: &Buffer, _offset: u64) {
        self.record(JournalOp::Dispatch);
    }

    unsafe fn trace_rays(&mut self, _sbt: &gb::SbtRegions, _extent: [u32; 3]) {
        self.record(JournalOp::TraceRays);
    }

    unsafe fn trace_rays_indirect(&mut self, _sbt: &gb::SbtRegions, _args_address: u64) {
        self.record(JournalOp::TraceRays);
    }

    unsafe fn build_rtas(&mut self, cmd: &RtasBuildCmd<Backend>) {
        self.record(JournalOp::BuildRtas {
            top_level: cmd.inputs.top_level,
            refit: cmd.src.is_some(),
            dst: cmd.dst.id,
            scratch_size: cmd.scratch.size,
        });
    }

    unsafe fn begin_debug_region(&mut self, name: &str, _color: [f32; 4]) {
        self.record(JournalOp::DebugRegion(name.to_owned()));
    }

    unsafe fn end_debug_region(&mut self) {}

    unsafe fn insert_debug_marker(&mut self, name: &str) {
        self.record(JournalOp::DebugRegion(name.to_owned()));
    }
}
