//! Raw Vulkan object wrappers plugged into the backend's associated types.

use std::sync::atomic::{AtomicU32, AtomicU64};

use ash::vk;

use grx::texture::TextureDesc;

#[derive(Debug)]
pub struct Surface {
    pub raw: vk::SurfaceKHR,
}

unsafe impl Send for Surface {}
unsafe impl Sync for Surface {}

#[derive(Debug)]
pub struct Memory {
    pub raw: vk::DeviceMemory,
    pub size: u64,
    pub mapped: Option<*mut u8>,
}

unsafe impl Send for Memory {}
unsafe impl Sync for Memory {}

#[derive(Debug)]
pub struct Buffer {
    pub raw: vk::Buffer,
    pub size: u64,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

/// Image plus the default view the bindless heap binds. Swapchain images
/// do not own their `vk::Image` and only tear down the view. The view is
/// created when memory is bound, so it lives behind an atomic handle.
#[derive(Debug)]
pub struct Image {
    pub raw: vk::Image,
    pub view: AtomicU64,
    pub desc: Option<TextureDesc>,
    pub owned: bool,
}

impl Image {
    pub(crate) fn view(&self) -> vk::ImageView {
        use ash::vk::Handle;
        vk::ImageView::from_raw(self.view.load(std::sync::atomic::Ordering::Acquire))
    }

    pub(crate) fn set_view(&self, view: vk::ImageView) {
        use ash::vk::Handle;
        self.view
            .store(view.as_raw(), std::sync::atomic::Ordering::Release);
    }
}

unsafe impl Send for Image {}
unsafe impl Sync for Image {}

#[derive(Debug)]
pub struct Sampler {
    pub raw: vk::Sampler,
}

unsafe impl Send for Sampler {}
unsafe impl Sync for Sampler {}

/// Swapchain with its per-image acquire semaphores. The semaphore used by
/// the latest acquire is remembered so the next submit can wait on it.
#[derive(Debug)]
pub struct Swapchain {
    pub raw: vk::SwapchainKHR,
    pub acquire_semaphores: Vec<vk::Semaphore>,
    pub last_acquire: AtomicU32,
}

unsafe impl Send for Swapchain {}
unsafe impl Sync for Swapchain {}

#[derive(Debug)]
pub struct Pipeline {
    pub raw: vk::Pipeline,
}

unsafe impl Send for Pipeline {}
unsafe impl Sync for Pipeline {}

#[derive(Debug)]
pub struct AccelerationStructure {
    pub raw: vk::AccelerationStructureKHR,
    pub address: AtomicU64,
}

unsafe impl Send for AccelerationStructure {}
unsafe impl Sync for AccelerationStructure {}

#[derive(Debug)]
pub struct CommandPool {
    pub raw: vk::CommandPool,
}

unsafe impl Send for CommandPool {}
