//! Raw Direct3D 12 object wrappers plugged into the backend's associated
//! types.
#![cfg(windows)]

use std::sync::atomic::{AtomicU32, AtomicU64};

use parking_lot::Mutex;
use winapi::{
    shared::windef::HWND,
    um::d3d12,
};
use wio::com::ComPtr;

use grx::texture::TextureDesc;

#[derive(Debug)]
pub struct Surface {
    pub hwnd: HWND,
}

unsafe impl Send for Surface {}
unsafe impl Sync for Surface {}

/// A memory block: a placed-resource heap for device-local memory, or one
/// big persistently mapped upload buffer for host-visible memory.
pub enum Memory {
    Heap {
        raw: ComPtr<d3d12::ID3D12Heap>,
        size: u64,
    },
    Upload {
        resource: ComPtr<d3d12::ID3D12Resource>,
        size: u64,
    },
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Memory::Heap { size, .. } => write!(f, "Heap({} bytes)", size),
            Memory::Upload { size, .. } => write!(f, "Upload({} bytes)", size),
        }
    }
}

/// A buffer: either a placed resource of its own, or a slice of a shared
/// upload block addressed by offset.
pub struct Buffer {
    pub size: u64,
    pub bound: Mutex<Option<BoundBuffer>>,
    /// Heap slot the SRV/UAV of this buffer occupies, for copies that need
    /// the GPU virtual address.
    pub va: AtomicU64,
}

pub struct BoundBuffer {
    pub resource: ComPtr<d3d12::ID3D12Resource>,
    pub offset: u64,
    pub upload: bool,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Buffer({} bytes)", self.size)
    }
}

impl Buffer {
    pub(crate) fn resource(&self) -> ComPtr<d3d12::ID3D12Resource> {
        self.bound
            .lock()
            .as_ref()
            .expect("buffer not bound")
            .resource
            .clone()
    }

    pub(crate) fn offset(&self) -> u64 {
        self.bound.lock().as_ref().map(|b| b.offset).unwrap_or(0)
    }

    pub(crate) fn is_upload(&self) -> bool {
        self.bound.lock().as_ref().map(|b| b.upload).unwrap_or(false)
    }
}

/// An image; `rtv`/`dsv` carry the attachment descriptor slots when the
/// usage asks for them.
pub struct Image {
    pub resource: Mutex<Option<ComPtr<d3d12::ID3D12Resource>>>,
    pub desc: Option<TextureDesc>,
    pub rtv: AtomicU64,
    pub dsv: AtomicU64,
}

unsafe impl Send for Image {}
unsafe impl Sync for Image {}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Image")
    }
}

impl Image {
    pub(crate) fn resource(&self) -> ComPtr<d3d12::ID3D12Resource> {
        self.resource
            .lock()
            .as_ref()
            .expect("image not bound")
            .clone()
    }
}

/// Samplers live entirely in the sampler heap; the wrapper carries the
/// description until the heap write happens.
pub struct Sampler {
    pub desc: d3d12::D3D12_SAMPLER_DESC,
}

unsafe impl Send for Sampler {}
unsafe impl Sync for Sampler {}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Sampler")
    }
}

#[derive(Debug)]
pub struct Swapchain {
    pub raw: SwapchainPtr,
    pub image_count: u32,
    pub flags: u32,
    pub current: AtomicU32,
}

pub struct SwapchainPtr(pub ComPtr<winapi::shared::dxgi1_4::IDXGISwapChain3>);

unsafe impl Send for Swapchain {}
unsafe impl Sync for Swapchain {}

impl std::fmt::Debug for SwapchainPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SwapchainPtr")
    }
}

pub struct Pipeline {
    pub raw: ComPtr<d3d12::ID3D12PipelineState>,
    pub topology: u32,
    /// Vertex buffer strides per binding; D3D12 reads them from the view,
    /// not the pipeline.
    pub vertex_strides: [u32; 8],
}

unsafe impl Send for Pipeline {}
unsafe impl Sync for Pipeline {}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Pipeline")
    }
}

/// Placeholder; acceleration structures are not carried by this backend.
#[derive(Debug)]
pub enum AccelerationStructure {}

pub struct CommandPool {
    pub raw: ComPtr<d3d12::ID3D12CommandAllocator>,
}

unsafe impl Send for CommandPool {}

impl std::fmt::Debug for CommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "CommandPool")
    }
}
