//! The unified resource model.
//!
//! Every GPU-visible object shares one header: flags, size, optional memory
//! backing, optional bindless handles, and a reference back to its device.
//! Ownership edges are strong references; lookup edges (internal resources
//! like the staging buffer and per-frame uniform buffers) are weak so they
//! never prolong the device's lifetime.

use std::sync::{Arc, Weak};

use crate::{
    buffer::BufferInner,
    descriptor::ResourceHandle,
    device::DeviceShared,
    memory::MappedPtr,
    pipeline::PipelineInner,
    rtas::{BlasInner, TlasInner},
    sampler::SamplerInner,
    swapchain::SwapchainInner,
    texture::TextureInner,
    Backend,
};

bitflags! {
    /// Creation options common to all resources.
    pub struct ResourceFlags: u32 {
        /// Allocate a read bindless slot.
        const SHADER_READ = 0x1;
        /// Allocate a write bindless slot.
        const SHADER_WRITE = 0x2;
        /// Keep the CPU shadow copy for the resource's lifetime.
        const CPU_BACKED = 0x4;
        /// Place the resource in host-visible memory.
        const CPU_ALLOCATED = 0x8;
        /// The resource must not keep the device alive (internal use).
        const INTERNAL_WEAK_DEVICE_REF = 0x10;

        /// Readable and writable from shaders.
        const SHADER_RW = Self::SHADER_READ.bits | Self::SHADER_WRITE.bits;
        /// Touches the CPU in some way.
        const CPU_SIDED = Self::CPU_BACKED.bits | Self::CPU_ALLOCATED.bits;
    }
}

/// Strong or weak edge back to the owning device.
pub(crate) enum DeviceRef<B: Backend> {
    Strong(Arc<DeviceShared<B>>),
    Weak(Weak<DeviceShared<B>>),
}

impl<B: Backend> DeviceRef<B> {
    pub(crate) fn new(device: &Arc<DeviceShared<B>>, flags: ResourceFlags) -> Self {
        if flags.contains(ResourceFlags::INTERNAL_WEAK_DEVICE_REF) {
            DeviceRef::Weak(Arc::downgrade(device))
        } else {
            DeviceRef::Strong(Arc::clone(device))
        }
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<DeviceShared<B>>> {
        match self {
            DeviceRef::Strong(device) => Some(Arc::clone(device)),
            DeviceRef::Weak(device) => device.upgrade(),
        }
    }
}

/// Header shared by every resource variant.
pub struct ResourceInfo {
    /// Creation flags.
    pub flags: ResourceFlags,
    /// Byte size (buffers) or total data size (textures).
    pub size: u64,
    /// Memory block index, when sub-allocated.
    pub block_id: u32,
    /// Offset inside the memory block.
    pub block_offset: u64,
    /// Whether block_id/block_offset refer to a live allocation.
    pub allocated: bool,
    /// GPU virtual address, when the backend exposes one.
    pub device_address: u64,
    /// Bindless read slot, or null.
    pub read_handle: ResourceHandle,
    /// Bindless write slot, or null.
    pub write_handle: ResourceHandle,
    /// Host pointer into the mapped block, when host-visible.
    pub mapped: Option<MappedPtr>,
    /// Debug name forwarded to the backend.
    pub name: String,
}

impl ResourceInfo {
    pub(crate) fn new(flags: ResourceFlags, size: u64, name: &str) -> Self {
        ResourceInfo {
            flags,
            size,
            block_id: 0,
            block_offset: 0,
            allocated: false,
            device_address: 0,
            read_handle: ResourceHandle::NONE,
            write_handle: ResourceHandle::NONE,
            mapped: None,
            name: name.to_owned(),
        }
    }

    /// Both bindless handles, for bulk free.
    pub(crate) fn handles(&self) -> [ResourceHandle; 2] {
        [self.read_handle, self.write_handle]
    }
}

/// Type-erased strong reference used by in-flight retention lists and
/// command-list resource tables.
pub(crate) enum AnyResource<B: Backend> {
    Buffer(Arc<BufferInner<B>>),
    Texture(Arc<TextureInner<B>>),
    Swapchain(Arc<SwapchainInner<B>>),
    Sampler(Arc<SamplerInner<B>>),
    Pipeline(Arc<PipelineInner<B>>),
    Blas(Arc<BlasInner<B>>),
    Tlas(Arc<TlasInner<B>>),
}

impl<B: Backend> Clone for AnyResource<B> {
    fn clone(&self) -> Self {
        match self {
            AnyResource::Buffer(r) => AnyResource::Buffer(Arc::clone(r)),
            AnyResource::Texture(r) => AnyResource::Texture(Arc::clone(r)),
            AnyResource::Swapchain(r) => AnyResource::Swapchain(Arc::clone(r)),
            AnyResource::Sampler(r) => AnyResource::Sampler(Arc::clone(r)),
            AnyResource::Pipeline(r) => AnyResource::Pipeline(Arc::clone(r)),
            AnyResource::Blas(r) => AnyResource::Blas(Arc::clone(r)),
            AnyResource::Tlas(r) => AnyResource::Tlas(Arc::clone(r)),
        }
    }
}

impl<B: Backend> AnyResource<B> {
    /// Stable identity for dedup inside retention lists.
    pub(crate) fn id(&self) -> usize {
        match self {
            AnyResource::Buffer(r) => Arc::as_ptr(r) as usize,
            AnyResource::Texture(r) => Arc::as_ptr(r) as usize,
            AnyResource::Swapchain(r) => Arc::as_ptr(r) as usize,
            AnyResource::Sampler(r) => Arc::as_ptr(r) as usize,
            AnyResource::Pipeline(r) => Arc::as_ptr(r) as usize,
            AnyResource::Blas(r) => Arc::as_ptr(r) as usize,
            AnyResource::Tlas(r) => Arc::as_ptr(r) as usize,
        }
    }
}
