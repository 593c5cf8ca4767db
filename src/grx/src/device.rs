//! The logical device.
//!
//! A device owns the memory allocator, the bindless descriptor allocator,
//! the staging ring, the per-frame constant buffers, the timeline fence and
//! the per-frame retention lists. Creation calls hand out reference-counted
//! resources; destruction is deferred until the GPU has caught up with the
//! frame that last touched the resource.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use std::time::Instant;

use parking_lot::Mutex;

use crate::{
    adapter::{Capabilities, DeviceInfo},
    backend::{BackendDevice, BackendInstance, DeviceFlags, WindowHandle},
    barrier::ResourceState,
    buffer::{BufferInner, BufferState, BufferUsage, DeviceBuffer},
    cmd::{CommandList, CommandListInner, CommandListState, RecordState},
    descriptor::{DescriptorAllocator, DescriptorType, ResourceHandle},
    error::{Error, Result},
    instance::Instance,
    memory::{AllocationBuffer, MemoryAllocator, ResourceKind},
    pipeline::{
        ComputePipelineDesc, GraphicsPipelineDesc, Pipeline, PipelineInner, PipelineKind,
        RaytracingPipelineDesc, SbtLayout, SHADER_GROUP_STRIDE,
    },
    resource::{AnyResource, DeviceRef, ResourceFlags, ResourceInfo},
    rtas::{
        Blas, BlasGeometry, BlasInner, RtasBuildFlags, RtasBuildInputs, RtasGeometryRef, Tlas,
        TlasInner, TlasInstances,
    },
    sampler::{Sampler, SamplerDesc, SamplerInner},
    swapchain::{
        choose_format, choose_present_mode, SwapImage, Swapchain, SwapchainConfig, SwapchainDesc,
        SwapchainInner, SwapchainState, SWAPCHAIN_IMAGES,
    },
    texture::{DeviceTexture, TextureDesc, TextureInner, TextureState, TextureUsage},
    Backend,
};

/// Frames in flight; pools, retention lists and the staging ring are all
/// shaped by this.
pub const FRAMES_IN_FLIGHT: usize = 3;

/// Initial staging buffer size; grows on ring exhaustion.
pub const DEFAULT_STAGING_SIZE: u64 = 64 << 20;

/// Maximum swapchains per submit.
pub const MAX_SWAPCHAINS: usize = 16;

/// User data bytes in the per-frame constant buffer.
pub const APP_DATA_SIZE: usize = 368;

/// Primitive budget before acceleration structure builds force a mid-frame
/// flush.
pub const FLUSH_THRESHOLD_PRIMITIVES: u64 = 1 << 22;

/// Per-frame constant buffer layout, indexed by the bindless uniform set of
/// the current frame slot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FrameConstants {
    /// Monotonic frame number.
    pub frame_id: u32,
    /// Seconds since the first submit.
    pub time: f32,
    /// Seconds since the previous submit.
    pub delta_time: f32,
    /// Number of swapchains bound this frame.
    pub swapchain_count: u32,
    /// Interleaved read/write bindless handles, two per swapchain.
    pub swapchains: [u32; MAX_SWAPCHAINS * 2],
    /// Application-provided bytes.
    pub app_data: [u8; APP_DATA_SIZE],
}

impl Default for FrameConstants {
    fn default() -> Self {
        FrameConstants {
            frame_id: 0,
            time: 0.0,
            delta_time: 0.0,
            swapchain_count: 0,
            swapchains: [0; MAX_SWAPCHAINS * 2],
            app_data: [0; APP_DATA_SIZE],
        }
    }
}

pub(crate) struct CommandSlot<B: Backend> {
    pub pool: Option<B::CommandPool>,
    pub cmd: Option<B::CommandBuffer>,
}

/// Everything addressed by `(submit_id - 1) % 3`, behind the device lock.
pub(crate) struct FrameState<B: Backend> {
    pub submit_id: u64,
    pub first_submit: Option<Instant>,
    pub last_submit: Option<Instant>,
    pub in_flight: [Vec<AnyResource<B>>; FRAMES_IN_FLIGHT],
    pub staging_allocs: [AllocationBuffer; FRAMES_IN_FLIGHT],
    pub staging: Option<Arc<BufferInner<B>>>,
    pub frame_data: Vec<Arc<BufferInner<B>>>,
    /// Command slots shaped `[queue][thread][frame]`; a single graphics
    /// queue and recording thread today.
    pub pools: Vec<CommandSlot<B>>,
    pub pending_buffers: Vec<Weak<BufferInner<B>>>,
    pub pending_textures: Vec<Weak<TextureInner<B>>>,
    pub pending_blas: Vec<Weak<BlasInner<B>>>,
    pub pending_tlas: Vec<Weak<TlasInner<B>>>,
    pub pending_bytes: u64,
    pub pending_primitives: u64,
    pub flush_threshold: u64,
}

impl<B: Backend> FrameState<B> {
    pub(crate) fn slot(&self) -> usize {
        ((self.submit_id - 1) % FRAMES_IN_FLIGHT as u64) as usize
    }
}

/// Device state shared between the public handle and every resource.
pub struct DeviceShared<B: Backend> {
    pub(crate) raw: B::Device,
    pub(crate) instance: Arc<B::Instance>,
    pub(crate) info: DeviceInfo,
    pub(crate) flags: DeviceFlags,
    pub(crate) allocator: Mutex<MemoryAllocator<B>>,
    pub(crate) descriptors: Mutex<DescriptorAllocator>,
    pub(crate) frame: Mutex<FrameState<B>>,
    pub(crate) torn_down: AtomicBool,
    pub(crate) lost: AtomicBool,
}

impl<B: Backend> DeviceShared<B> {
    pub(crate) fn raw(&self) -> &B::Device {
        &self.raw
    }

    pub(crate) fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    pub(crate) fn check_not_lost(&self) -> Result<()> {
        if self.lost.load(Ordering::Acquire) {
            Err(Error::InvalidState("device lost"))
        } else {
            Ok(())
        }
    }

    pub(crate) fn free_handles(&self, handles: &[ResourceHandle]) {
        self.descriptors.lock().free(handles);
    }

    pub(crate) fn free_allocation(&self, block_id: u32, block_offset: u64) {
        self.allocator.lock().free(&self.raw, block_id, block_offset);
    }

    pub(crate) fn destroy_surface(&self, surface: B::Surface) {
        unsafe { self.instance.destroy_surface(surface) };
    }

    pub(crate) fn push_pending_buffer(&self, inner: &Arc<BufferInner<B>>) {
        let mut frame = self.frame.lock();
        let exists = frame
            .pending_buffers
            .iter()
            .any(|w| w.as_ptr() == Arc::as_ptr(inner));
        if !exists {
            frame.pending_buffers.push(Arc::downgrade(inner));
        }
    }

    pub(crate) fn push_pending_texture(&self, inner: &Arc<TextureInner<B>>) {
        let mut frame = self.frame.lock();
        let exists = frame
            .pending_textures
            .iter()
            .any(|w| w.as_ptr() == Arc::as_ptr(inner));
        if !exists {
            frame.pending_textures.push(Arc::downgrade(inner));
        }
    }

    fn allocate_handle(&self, ty: DescriptorType) -> Result<ResourceHandle> {
        self.descriptors.lock().allocate(ty)
    }

    /// Create a buffer with optional initial CPU data. Internal entry point
    /// shared by the public creation calls, the staging pipeline and the
    /// RTAS build path.
    pub(crate) fn create_buffer_inner(
        self: &Arc<Self>,
        usage: BufferUsage,
        flags: ResourceFlags,
        name: &str,
        size: u64,
        data: Option<Vec<u8>>,
    ) -> Result<Arc<BufferInner<B>>> {
        if size == 0 {
            return Err(Error::InvalidParameter("buffer size must be non-zero"));
        }
        if let Some(data) = &data {
            if data.len() as u64 != size {
                return Err(Error::InvalidParameter(
                    "initial data length differs from buffer size",
                ));
            }
        }

        let raw_buffer = unsafe { self.raw.create_buffer(size, usage, flags, name)? };

        let mut requirements = unsafe { self.raw.buffer_requirements(&raw_buffer) };
        if usage.contains(BufferUsage::SCRATCH) {
            // Some drivers under-report scratch alignment.
            requirements.alignment = requirements.alignment.max(256);
        }

        let cpu_sided = flags.contains(ResourceFlags::CPU_ALLOCATED);
        let allocation = {
            let mut allocator = self.allocator.lock();
            let (block_id, block_offset) = match allocator.allocate(
                &self.raw,
                &requirements,
                cpu_sided,
                ResourceKind::Buffer,
                name,
            ) {
                Ok(placed) => placed,
                Err(e) => {
                    drop(allocator);
                    unsafe { self.raw.destroy_buffer(raw_buffer) };
                    return Err(e);
                }
            };
            let block = allocator.block(block_id);
            let mapped = block
                .mapped
                .map(|m| crate::memory::MappedPtr(unsafe { m.0.add(block_offset as usize) }));
            let bind = unsafe {
                self.raw
                    .bind_buffer_memory(&raw_buffer, block.raw(), block_offset)
            };
            if let Err(e) = bind {
                allocator.free(&self.raw, block_id, block_offset);
                drop(allocator);
                unsafe { self.raw.destroy_buffer(raw_buffer) };
                return Err(e);
            }
            (block_id, block_offset, mapped)
        };
        let (block_id, block_offset, mapped) = allocation;

        let device_address = if self.info.capabilities.contains(Capabilities::DEVICE_ADDRESS) {
            unsafe { self.raw.buffer_address(&raw_buffer) }
        } else {
            0
        };

        let mut info = ResourceInfo::new(flags, size, name);
        info.block_id = block_id;
        info.block_offset = block_offset;
        info.allocated = true;
        info.device_address = device_address;
        info.mapped = mapped;

        let mut claimed = smallvec::SmallVec::<[ResourceHandle; 2]>::new();
        let rollback = |this: &Arc<Self>, claimed: &[ResourceHandle]| {
            this.free_handles(claimed);
            this.free_allocation(block_id, block_offset);
        };

        if flags.contains(ResourceFlags::SHADER_READ) {
            match self.allocate_handle(DescriptorType::Buffer) {
                Ok(handle) => {
                    info.read_handle = handle;
                    claimed.push(handle);
                    unsafe {
                        self.raw.write_buffer_descriptor(handle, &raw_buffer, 0, size);
                    }
                }
                Err(e) => {
                    rollback(self, &claimed);
                    unsafe { self.raw.destroy_buffer(raw_buffer) };
                    return Err(e);
                }
            }
        }
        if flags.contains(ResourceFlags::SHADER_WRITE) {
            match self.allocate_handle(DescriptorType::RWBuffer) {
                Ok(handle) => {
                    info.write_handle = handle;
                    claimed.push(handle);
                    unsafe {
                        self.raw.write_buffer_descriptor(handle, &raw_buffer, 0, size);
                    }
                }
                Err(e) => {
                    rollback(self, &claimed);
                    unsafe { self.raw.destroy_buffer(raw_buffer) };
                    return Err(e);
                }
            }
        }

        let has_data = data.is_some();
        let cpu_data = match data {
            Some(data) => Some(data),
            None if flags.contains(ResourceFlags::CPU_BACKED) => Some(vec![0; size as usize]),
            None => None,
        };

        let inner = Arc::new(BufferInner {
            info,
            usage,
            raw: Some(raw_buffer),
            state: Mutex::new(BufferState {
                cpu_data,
                pending: Vec::new(),
                first_frame: true,
            }),
            track: Mutex::new(ResourceState::default()),
            device: DeviceRef::new(self, flags),
        });

        if has_data {
            inner.mark_dirty(0, size)?;
            self.push_pending_buffer(&inner);
        }

        Ok(inner)
    }

    /// Re-create the staging buffer and its three per-frame ring slices.
    pub(crate) fn resize_staging(
        self: &Arc<Self>,
        frame: &mut FrameState<B>,
        new_size: u64,
    ) -> Result<()> {
        // Align so every slice keeps a compatible alignment.
        let new_size = (((new_size + 2) / 3 + 511) & !511) * 3;

        // The old buffer stays alive through any in-flight list that holds
        // it; dropping our reference is enough.
        frame.staging = None;
        for alloc in frame.staging_allocs.iter_mut() {
            *alloc = AllocationBuffer::new(new_size / 3);
        }

        let staging = self.create_buffer_inner(
            BufferUsage::empty(),
            ResourceFlags::INTERNAL_WEAK_DEVICE_REF | ResourceFlags::CPU_ALLOCATED,
            "staging buffer",
            new_size,
            None,
        )?;
        frame.staging = Some(staging);
        Ok(())
    }

    pub(crate) fn resize_swapchain(
        self: &Arc<Self>,
        inner: &SwapchainInner<B>,
        size: (u32, u32),
    ) -> Result<()> {
        let mut state = inner.state.lock();
        let caps = self.raw.surface_capabilities(inner.surface())?;
        let config = self.resolve_swapchain_config(&inner.desc, &caps, size)?;

        let old = state.raw.take();
        let (raw, images) =
            unsafe { self.raw.create_swapchain(inner.surface(), &config, old)? };

        let same_count = state.images.len() == images.len();
        let mut old_images = std::mem::take(&mut state.images);
        let wants_write = inner.desc.flags.contains(ResourceFlags::SHADER_WRITE);

        let mut new_images = Vec::with_capacity(images.len());
        for image in images {
            let (read_handle, write_handle) = if same_count {
                let old = old_images.remove(0);
                let handles = (old.read_handle, old.write_handle);
                unsafe { self.raw.destroy_image(old.raw) };
                handles
            } else {
                let read = self.allocate_handle(DescriptorType::Texture2D)?;
                let write = if wants_write {
                    self.allocate_handle(DescriptorType::RWTexture2D)?
                } else {
                    ResourceHandle::NONE
                };
                (read, write)
            };
            unsafe {
                self.raw.write_image_descriptor(read_handle, &image);
                if write_handle.is_some() {
                    self.raw.write_image_descriptor(write_handle, &image);
                }
            }
            new_images.push(SwapImage {
                raw: image,
                read_handle,
                write_handle,
                track: Mutex::new(ResourceState::default()),
            });
        }
        // Image count changed: retire the old slots entirely.
        for old in old_images {
            self.free_handles(&[old.read_handle, old.write_handle]);
            unsafe { self.raw.destroy_image(old.raw) };
        }

        state.images = new_images;
        state.extent = config.extent;
        state.format = config.format;
        state.present_mode = config.present_mode;
        state.current_image = 0;
        state.raw = Some(raw);
        state.version += 1;
        Ok(())
    }

    pub(crate) fn resolve_swapchain_config(
        &self,
        desc: &SwapchainDesc,
        caps: &crate::swapchain::SurfaceCapabilities,
        size: (u32, u32),
    ) -> Result<SwapchainConfig> {
        let format = choose_format(desc.format, &caps.formats)
            .ok_or(Error::UnsupportedOperation("no supported swapchain format"))?;
        let present_mode = choose_present_mode(&desc.present_mode_priorities, &caps.present_modes);

        let mut usage = TextureUsage::COLOR_ATTACHMENT
            | TextureUsage::COPY_SRC
            | TextureUsage::COPY_DST
            | TextureUsage::SAMPLED;
        if desc.flags.contains(ResourceFlags::SHADER_WRITE) {
            if !caps.supports_storage {
                return Err(Error::UnsupportedOperation(
                    "surface does not support writable swapchain images",
                ));
            }
            usage |= TextureUsage::STORAGE;
        }

        Ok(SwapchainConfig {
            format,
            extent: caps.current_extent.unwrap_or(size),
            image_count: SWAPCHAIN_IMAGES,
            present_mode,
            usage,
        })
    }

    /// Orderly teardown: wait for all frames, drain retention lists, release
    /// internal resources, report leaks.
    pub(crate) fn teardown(self: &Arc<Self>) {
        let mut frame = self.frame.lock();
        unsafe {
            let _ = self.raw.wait_idle();
        }

        for slot in frame.in_flight.iter_mut() {
            slot.clear();
        }
        for alloc in frame.staging_allocs.iter_mut() {
            alloc.free_all();
        }
        frame.pending_buffers.clear();
        frame.pending_textures.clear();
        frame.pending_blas.clear();
        frame.pending_tlas.clear();

        // Internal weak-ref resources free their backing now, while the
        // device is still reachable.
        frame.staging = None;
        frame.frame_data.clear();

        for slot in frame.pools.iter_mut() {
            // Command buffers die with their pool.
            slot.cmd = None;
            if let Some(pool) = slot.pool.take() {
                unsafe { self.raw.destroy_command_pool(pool) };
            }
        }
        drop(frame);

        {
            let allocator = self.allocator.lock();
            allocator.report_leaks();
        }
        self.descriptors.lock().report_leaks();

        self.torn_down.store(true, Ordering::Release);
    }
}

impl<B: Backend> Drop for DeviceShared<B> {
    fn drop(&mut self) {
        // Leaked user resources skip their backend frees once torn down;
        // remaining blocks go with the device.
        self.allocator.get_mut().clear(&self.raw);
    }
}

/// The logical device handle. Dropping it tears the device down after the
/// GPU finishes outstanding frames; resources that outlive it are reported
/// as leaks.
pub struct Device<B: Backend> {
    pub(crate) shared: Arc<DeviceShared<B>>,
}

impl<B: Backend> Drop for Device<B> {
    fn drop(&mut self) {
        self.shared.teardown();
    }
}

impl<B: Backend> Device<B> {
    /// Open a logical device on `info`.
    pub fn create(instance: &Instance<B>, info: &DeviceInfo, flags: DeviceFlags) -> Result<Self> {
        if flags.contains(DeviceFlags::VERBOSE) {
            debug!(
                "opening device '{}' (vendor {:#06x}, caps {:?})",
                info.name, info.vendor, info.capabilities
            );
        }
        let raw = instance.raw.open_device(info, flags)?;

        let shared = Arc::new(DeviceShared {
            raw,
            instance: Arc::clone(&instance.raw),
            info: info.clone(),
            flags,
            allocator: Mutex::new(MemoryAllocator::new(info, flags.contains(DeviceFlags::DEBUG))),
            descriptors: Mutex::new(DescriptorAllocator::new()),
            frame: Mutex::new(FrameState {
                submit_id: 1,
                first_submit: None,
                last_submit: None,
                in_flight: Default::default(),
                staging_allocs: Default::default(),
                staging: None,
                frame_data: Vec::new(),
                pools: (0..FRAMES_IN_FLIGHT)
                    .map(|_| CommandSlot {
                        pool: None,
                        cmd: None,
                    })
                    .collect(),
                pending_buffers: Vec::new(),
                pending_textures: Vec::new(),
                pending_blas: Vec::new(),
                pending_tlas: Vec::new(),
                pending_bytes: 0,
                pending_primitives: 0,
                // 20% of reported device memory, capped below 4 GiB.
                flush_threshold: (info.limits.dedicated_memory / 5)
                    .max(256 << 20)
                    .min((4 << 30) - 1),
            }),
            torn_down: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        });

        // Staging ring.
        {
            let mut frame = shared.frame.lock();
            shared.resize_staging(&mut frame, DEFAULT_STAGING_SIZE)?;

            // One constant buffer per in-flight frame.
            let stride = std::mem::size_of::<FrameConstants>() as u64;
            let mut ubos = Vec::with_capacity(FRAMES_IN_FLIGHT);
            for i in 0..FRAMES_IN_FLIGHT {
                let name = format!("frame constants {}", i);
                ubos.push(shared.create_buffer_inner(
                    BufferUsage::empty(),
                    ResourceFlags::INTERNAL_WEAK_DEVICE_REF | ResourceFlags::CPU_ALLOCATED,
                    &name,
                    stride,
                    None,
                )?);
            }
            unsafe {
                <B::Device as crate::backend::BackendDevice<B>>::init_frame_uniforms(
                    &shared.raw,
                    [ubos[0].raw(), ubos[1].raw(), ubos[2].raw()],
                    stride,
                )?;
            }
            frame.frame_data = ubos;
        }

        Ok(Device { shared })
    }

    /// Device info this device was opened with.
    pub fn info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    /// The backend device, for backend-specific hooks and tests.
    pub fn raw(&self) -> &B::Device {
        &self.shared.raw
    }

    /// Current staging buffer size.
    pub fn staging_size(&self) -> u64 {
        self.shared
            .frame
            .lock()
            .staging
            .as_ref()
            .map(|s| s.info.size)
            .unwrap_or(0)
    }

    /// Re-create the staging buffer with at least `size` bytes. The old
    /// buffer stays alive until every frame that used it completes.
    pub fn resize_staging_buffer(&self, size: u64) -> Result<()> {
        let mut frame = self.shared.frame.lock();
        self.shared.resize_staging(&mut frame, size)
    }

    /// Create an uninitialized buffer.
    pub fn create_buffer(
        &self,
        usage: BufferUsage,
        flags: ResourceFlags,
        name: &str,
        size: u64,
    ) -> Result<DeviceBuffer<B>> {
        self.shared.check_not_lost()?;
        let inner = self
            .shared
            .create_buffer_inner(usage, flags, name, size, None)?;
        Ok(DeviceBuffer { inner })
    }

    /// Create a buffer initialized with `data`; the vec is moved in as the
    /// CPU shadow and uploaded at the next submit.
    pub fn create_buffer_data(
        &self,
        usage: BufferUsage,
        flags: ResourceFlags,
        name: &str,
        data: Vec<u8>,
    ) -> Result<DeviceBuffer<B>> {
        self.shared.check_not_lost()?;
        let size = data.len() as u64;
        let inner = self
            .shared
            .create_buffer_inner(usage, flags, name, size, Some(data))?;
        Ok(DeviceBuffer { inner })
    }

    /// Create a texture, optionally initialized with tightly packed texel
    /// data for mip 0.
    pub fn create_texture(
        &self,
        desc: TextureDesc,
        flags: ResourceFlags,
        name: &str,
        data: Option<Vec<u8>>,
    ) -> Result<DeviceTexture<B>> {
        self.shared.check_not_lost()?;
        let limits = &self.shared.info.limits;
        if desc.width == 0 || desc.height == 0 || desc.depth_or_layers == 0 {
            return Err(Error::InvalidParameter("texture extent must be non-zero"));
        }
        if desc.width > limits.max_texture_size || desc.height > limits.max_texture_size {
            return Err(Error::OutOfBounds("texture exceeds device limits"));
        }
        let data_size = desc.data_size();
        if let Some(data) = &data {
            if data.len() as u64 != data_size {
                return Err(Error::InvalidParameter(
                    "initial data length differs from texture size",
                ));
            }
        }

        let raw_image = unsafe { self.shared.raw.create_image(&desc, name)? };
        let requirements = unsafe { self.shared.raw.image_requirements(&raw_image) };

        let shared = &self.shared;
        let allocation = {
            let mut allocator = shared.allocator.lock();
            let placed = allocator.allocate(
                &shared.raw,
                &requirements,
                flags.contains(ResourceFlags::CPU_ALLOCATED),
                ResourceKind::Texture,
                name,
            );
            let (block_id, block_offset) = match placed {
                Ok(placed) => placed,
                Err(e) => {
                    drop(allocator);
                    unsafe { shared.raw.destroy_image(raw_image) };
                    return Err(e);
                }
            };
            let bind = unsafe {
                shared.raw.bind_image_memory(
                    &raw_image,
                    &desc,
                    allocator.block(block_id).raw(),
                    block_offset,
                )
            };
            if let Err(e) = bind {
                allocator.free(&shared.raw, block_id, block_offset);
                drop(allocator);
                unsafe { shared.raw.destroy_image(raw_image) };
                return Err(e);
            }
            (block_id, block_offset)
        };

        let mut info = ResourceInfo::new(flags, data_size, name);
        info.block_id = allocation.0;
        info.block_offset = allocation.1;
        info.allocated = true;

        let read_type = match desc.ty {
            crate::texture::TextureType::D2 => DescriptorType::Texture2D,
            crate::texture::TextureType::D3 => DescriptorType::Texture3D,
            crate::texture::TextureType::Cube => DescriptorType::TextureCube,
        };
        let write_type = match desc.ty {
            crate::texture::TextureType::D3 => DescriptorType::RWTexture3D,
            _ => DescriptorType::RWTexture2D,
        };

        let mut claimed = smallvec::SmallVec::<[ResourceHandle; 2]>::new();
        if flags.contains(ResourceFlags::SHADER_READ) {
            let handle = match shared.allocate_handle(read_type) {
                Ok(h) => h,
                Err(e) => {
                    shared.free_allocation(info.block_id, info.block_offset);
                    unsafe { shared.raw.destroy_image(raw_image) };
                    return Err(e);
                }
            };
            info.read_handle = handle;
            claimed.push(handle);
            unsafe { shared.raw.write_image_descriptor(handle, &raw_image) };
        }
        if flags.contains(ResourceFlags::SHADER_WRITE) {
            let handle = match shared.allocate_handle(write_type) {
                Ok(h) => h,
                Err(e) => {
                    shared.free_handles(&claimed);
                    shared.free_allocation(info.block_id, info.block_offset);
                    unsafe { shared.raw.destroy_image(raw_image) };
                    return Err(e);
                }
            };
            info.write_handle = handle;
            unsafe { shared.raw.write_image_descriptor(handle, &raw_image) };
        }

        let has_data = data.is_some();
        let cpu_data = match data {
            Some(data) => Some(data),
            None if flags.contains(ResourceFlags::CPU_BACKED) => {
                Some(vec![0; data_size as usize])
            }
            None => None,
        };

        let inner = Arc::new(TextureInner {
            info,
            desc,
            raw: Some(raw_image),
            state: Mutex::new(TextureState {
                cpu_data,
                pending: Vec::new(),
                first_frame: true,
            }),
            track: Mutex::new(ResourceState::default()),
            device: DeviceRef::new(shared, flags),
        });

        if has_data {
            inner.mark_dirty(0, 0, 0, 0, 0, 0)?;
            shared.push_pending_texture(&inner);
        }

        Ok(DeviceTexture { inner })
    }

    /// Create a sampler with a bindless slot.
    pub fn create_sampler(&self, desc: &SamplerDesc, name: &str) -> Result<Sampler<B>> {
        self.shared.check_not_lost()?;
        let raw = unsafe { self.shared.raw.create_sampler(desc, name)? };
        let handle = match self.shared.allocate_handle(DescriptorType::Sampler) {
            Ok(h) => h,
            Err(e) => {
                unsafe { self.shared.raw.destroy_sampler(raw) };
                return Err(e);
            }
        };
        unsafe { self.shared.raw.write_sampler_descriptor(handle, &raw) };

        let mut info = ResourceInfo::new(ResourceFlags::SHADER_READ, 0, name);
        info.read_handle = handle;

        Ok(Sampler {
            inner: Arc::new(SamplerInner {
                info,
                raw: Some(raw),
                device: DeviceRef::new(&self.shared, ResourceFlags::empty()),
            }),
        })
    }

    /// Create a swapchain on a native window.
    pub fn create_swapchain(
        &self,
        window: &WindowHandle,
        desc: SwapchainDesc,
    ) -> Result<Swapchain<B>> {
        self.shared.check_not_lost()?;
        let surface = self.shared.instance.create_surface(window)?;

        let inner = Arc::new(SwapchainInner {
            surface: Some(surface),
            desc,
            state: Mutex::new(SwapchainState {
                raw: None,
                images: Vec::new(),
                version: 0,
                extent: window.size,
                format: crate::format::Format::Undefined,
                present_mode: crate::swapchain::PresentMode::Fifo,
                current_image: 0,
            }),
            device: DeviceRef::new(&self.shared, ResourceFlags::empty()),
        });

        self.shared.resize_swapchain(&inner, window.size)?;
        Ok(Swapchain { inner })
    }

    /// Create a compute pipeline.
    pub fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        name: &str,
    ) -> Result<Pipeline<B>> {
        self.shared.check_not_lost()?;
        let raw = unsafe { self.shared.raw.create_compute_pipeline(desc, name)? };
        Ok(self.wrap_pipeline(raw, PipelineKind::Compute, SbtLayout::default(), None, name))
    }

    /// Create a graphics pipeline.
    pub fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        name: &str,
    ) -> Result<Pipeline<B>> {
        self.shared.check_not_lost()?;
        let raw = unsafe { self.shared.raw.create_graphics_pipeline(desc, name)? };
        Ok(self.wrap_pipeline(raw, PipelineKind::Graphics, SbtLayout::default(), None, name))
    }

    /// Create a raytracing pipeline and lay out its shader binding table.
    pub fn create_raytracing_pipeline(
        &self,
        desc: &RaytracingPipelineDesc,
        name: &str,
    ) -> Result<Pipeline<B>> {
        self.shared.check_not_lost()?;
        if !self
            .shared
            .info
            .capabilities
            .contains(Capabilities::RAY_PIPELINE)
        {
            return Err(Error::UnsupportedOperation(
                "device does not support raytracing pipelines",
            ));
        }
        let layout = SbtLayout {
            raygen_count: desc.raygen.len() as u32,
            miss_count: desc.miss.len() as u32,
            hit_count: desc.hit_groups.len() as u32,
            callable_count: desc.callable.len() as u32,
        };
        let raw = unsafe { self.shared.raw.create_raytracing_pipeline(desc, name)? };

        let handles = unsafe {
            match self.shared.raw.sbt_group_handles(&raw, desc.group_count()) {
                Ok(h) => h,
                Err(e) => {
                    self.shared.raw.destroy_pipeline(raw);
                    return Err(e);
                }
            }
        };

        // Re-stride the group handles into the table layout.
        let handle_size = handles.len() as u64 / desc.group_count().max(1) as u64;
        let mut table = vec![0u8; layout.table_size() as usize];
        let counts = [
            layout.raygen_count,
            layout.miss_count,
            layout.hit_count,
            layout.callable_count,
        ];
        let mut group = 0usize;
        let mut region_base = 0u64;
        for count in counts.iter() {
            for i in 0..*count {
                let src = group as u64 * handle_size;
                let dst = region_base + i as u64 * SHADER_GROUP_STRIDE;
                let len = handle_size.min(SHADER_GROUP_STRIDE) as usize;
                table[dst as usize..dst as usize + len]
                    .copy_from_slice(&handles[src as usize..src as usize + len]);
                group += 1;
            }
            region_base += SbtLayout::region_size(*count);
        }

        let sbt_name = format!("{} shader binding table", name);
        let sbt = self.shared.create_buffer_inner(
            BufferUsage::SBT,
            ResourceFlags::INTERNAL_WEAK_DEVICE_REF | ResourceFlags::CPU_ALLOCATED,
            &sbt_name,
            table.len() as u64,
            Some(table),
        )?;

        Ok(self.wrap_pipeline(raw, PipelineKind::RayTracing, layout, Some(sbt), name))
    }

    fn wrap_pipeline(
        &self,
        raw: B::Pipeline,
        kind: PipelineKind,
        sbt_layout: SbtLayout,
        sbt: Option<Arc<BufferInner<B>>>,
        name: &str,
    ) -> Pipeline<B> {
        Pipeline {
            inner: Arc::new(PipelineInner {
                info: ResourceInfo::new(ResourceFlags::empty(), 0, name),
                raw: Some(raw),
                kind,
                sbt_layout,
                sbt,
                device: DeviceRef::new(&self.shared, ResourceFlags::empty()),
            }),
        }
    }

    /// Create a bottom-level acceleration structure; the build itself runs
    /// at the next submit.
    pub fn create_blas(
        &self,
        geometry: BlasGeometry<B>,
        flags: RtasBuildFlags,
        parent: Option<&Blas<B>>,
        name: &str,
    ) -> Result<Blas<B>> {
        self.shared.check_not_lost()?;
        if flags.contains(RtasBuildFlags::IS_UPDATE) && parent.is_none() {
            return Err(Error::InvalidParameter("refit build requires a parent"));
        }
        let primitives = geometry.primitive_count()?;

        let sizes = {
            let inputs = RtasBuildInputs {
                top_level: false,
                flags,
                geometry: geometry_ref(&geometry),
                primitive_count: primitives,
            };
            unsafe { self.shared.raw.rtas_build_sizes(&inputs)? }
        };

        let backing_name = format!("{} backing", name);
        let backing = self.shared.create_buffer_inner(
            BufferUsage::AS,
            ResourceFlags::empty(),
            &backing_name,
            sizes.structure,
            None,
        )?;
        let scratch_size = if flags.contains(RtasBuildFlags::IS_UPDATE) {
            sizes.update_scratch
        } else {
            sizes.build_scratch
        };
        let scratch_name = format!("{} scratch", name);
        let scratch = self.shared.create_buffer_inner(
            BufferUsage::SCRATCH,
            ResourceFlags::empty(),
            &scratch_name,
            scratch_size.max(1),
            None,
        )?;

        let raw =
            unsafe { self.shared.raw.create_rtas(backing.raw(), 0, sizes.structure, false)? };
        let device_address = unsafe { self.shared.raw.rtas_address(&raw) };

        let inner = Arc::new(BlasInner {
            info: ResourceInfo::new(ResourceFlags::empty(), sizes.structure, name),
            flags,
            geometry,
            parent: parent.map(|p| Arc::clone(&p.inner)),
            primitives,
            backing,
            scratch: Mutex::new(Some(scratch)),
            sizes,
            raw: Some(raw),
            device_address,
            completed: AtomicBool::new(false),
            device: DeviceRef::new(&self.shared, ResourceFlags::empty()),
        });

        self.shared.frame.lock().pending_blas.push(Arc::downgrade(&inner));
        Ok(Blas { inner })
    }

    /// Create a top-level acceleration structure; instance marshalling and
    /// the build run at the next submit.
    pub fn create_tlas(
        &self,
        instances: TlasInstances<B>,
        flags: RtasBuildFlags,
        parent: Option<&Tlas<B>>,
        name: &str,
    ) -> Result<Tlas<B>> {
        self.shared.check_not_lost()?;
        if flags.contains(RtasBuildFlags::IS_UPDATE) && parent.is_none() {
            return Err(Error::InvalidParameter("refit build requires a parent"));
        }
        let count = instances.count();
        if count >= 1 << 24 {
            return Err(Error::OutOfBounds("TLAS instance count exceeds 2^24 - 1"));
        }
        if instances.is_motion()
            && !self
                .shared
                .info
                .capabilities
                .contains(Capabilities::RAY_MOTION_BLUR)
        {
            return Err(Error::UnsupportedOperation(
                "device does not support motion-blur acceleration structures",
            ));
        }

        // Sizing may run before CPU instances have a device buffer; the
        // backend sizes from the count alone, so the staging buffer stands
        // in as the record address.
        let placeholder = match &instances {
            TlasInstances::Device { .. } => None,
            _ => {
                let frame = self.shared.frame.lock();
                Some(Arc::clone(frame.staging.as_ref().expect("staging buffer missing")))
            }
        };
        let sizes = {
            let (buffer, offset, motion) = match (&instances, &placeholder) {
                (
                    TlasInstances::Device {
                        buffer,
                        offset,
                        motion,
                        ..
                    },
                    _,
                ) => (buffer.inner.raw(), *offset, *motion),
                (_, Some(staging)) => (staging.raw(), 0, instances.is_motion()),
                _ => unreachable!(),
            };
            let inputs = RtasBuildInputs {
                top_level: true,
                flags,
                geometry: RtasGeometryRef::Instances {
                    buffer,
                    offset,
                    motion,
                },
                primitive_count: count as u32,
            };
            unsafe { self.shared.raw.rtas_build_sizes(&inputs)? }
        };
        drop(placeholder);

        let backing_name = format!("{} backing", name);
        let backing = self.shared.create_buffer_inner(
            BufferUsage::AS,
            ResourceFlags::empty(),
            &backing_name,
            sizes.structure,
            None,
        )?;
        let scratch_size = if flags.contains(RtasBuildFlags::IS_UPDATE) {
            sizes.update_scratch
        } else {
            sizes.build_scratch
        };
        let scratch_name = format!("{} scratch", name);
        let scratch = self.shared.create_buffer_inner(
            BufferUsage::SCRATCH,
            ResourceFlags::empty(),
            &scratch_name,
            scratch_size.max(1),
            None,
        )?;

        let raw =
            unsafe { self.shared.raw.create_rtas(backing.raw(), 0, sizes.structure, true)? };

        let handle = match self.shared.allocate_handle(DescriptorType::Tlas) {
            Ok(h) => h,
            Err(e) => {
                unsafe { self.shared.raw.destroy_rtas(raw) };
                return Err(e);
            }
        };
        unsafe { self.shared.raw.write_tlas_descriptor(handle, &raw) };

        let mut info = ResourceInfo::new(ResourceFlags::SHADER_READ, sizes.structure, name);
        info.read_handle = handle;

        let inner = Arc::new(TlasInner {
            info,
            flags,
            instances,
            parent: parent.map(|p| Arc::clone(&p.inner)),
            backing,
            scratch: Mutex::new(Some(scratch)),
            sizes,
            raw: Some(raw),
            completed: AtomicBool::new(false),
            device: DeviceRef::new(&self.shared, ResourceFlags::empty()),
        });

        self.shared.frame.lock().pending_tlas.push(Arc::downgrade(&inner));
        Ok(Tlas { inner })
    }

    /// Create an empty portable command list for recording.
    pub fn create_command_list(&self) -> CommandList<B> {
        CommandList {
            inner: Arc::new(CommandListInner {
                device: Arc::clone(&self.shared),
                state: Mutex::new(CommandListState {
                    ops: Vec::new(),
                    record: RecordState::New,
                    resources: Vec::new(),
                    active_swapchains: Vec::new(),
                    in_scope: false,
                    in_rendering: false,
                    debug_depth: 0,
                    bound_kind: None,
                }),
                submit_lock: Mutex::new(()),
            }),
        }
    }
}

pub(crate) fn geometry_ref<B: Backend>(geometry: &BlasGeometry<B>) -> RtasGeometryRef<'_, B> {
    match geometry {
        BlasGeometry::Triangles {
            positions,
            position_format,
            position_offset,
            position_stride,
            position_count,
            indices,
        } => RtasGeometryRef::Triangles {
            positions: positions.inner.raw(),
            offset: *position_offset,
            format: *position_format,
            stride: *position_stride,
            vertex_count: *position_count,
            indices: indices
                .as_ref()
                .map(|(buffer, format, _)| (buffer.inner.raw(), 0, *format)),
        },
        BlasGeometry::Aabbs {
            buffer,
            offset,
            stride,
            ..
        } => RtasGeometryRef::Aabbs {
            buffer: buffer.inner.raw(),
            offset: *offset,
            stride: *stride,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_constants_layout() {
        // The uniform set indexes this struct with a fixed 512-byte stride.
        assert_eq!(std::mem::size_of::<FrameConstants>(), 512);
        assert_eq!(APP_DATA_SIZE, 368);
    }

    #[test]
    fn frame_slot_addressing() {
        // Slot rotates with the pre-increment submit id.
        for (submit_id, slot) in [(1u64, 0usize), (2, 1), (3, 2), (4, 0), (7, 0)].iter() {
            assert_eq!(
                ((submit_id - 1) % FRAMES_IN_FLIGHT as u64) as usize,
                *slot
            );
        }
    }
}
