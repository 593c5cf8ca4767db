//! Versioned swapchains.
//!
//! A swapchain carries a monotonically increasing `version`; command lists
//! capture the version of every swapchain they reference and submission
//! rejects stale captures after a resize.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    backend::{BackendDevice, WindowHandle},
    barrier::ResourceState,
    descriptor::ResourceHandle,
    error::Result,
    format::{Format, WindowFormat},
    resource::{DeviceRef, ResourceFlags},
    texture::TextureUsage,
    Backend,
};

/// Presentation engine mode.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

/// User-facing swapchain creation options.
#[derive(Clone, Debug)]
pub struct SwapchainDesc {
    /// Format requested by the window.
    pub format: WindowFormat,
    /// First supported mode wins; defaults to `[Mailbox, Fifo]`.
    pub present_mode_priorities: Vec<PresentMode>,
    /// `SHADER_WRITE` requests storage usage on the images.
    pub flags: ResourceFlags,
}

impl Default for SwapchainDesc {
    fn default() -> Self {
        SwapchainDesc {
            format: WindowFormat::Bgra8,
            present_mode_priorities: vec![PresentMode::Mailbox, PresentMode::Fifo],
            flags: ResourceFlags::empty(),
        }
    }
}

/// What the surface reports it can do.
#[derive(Clone, Debug)]
pub struct SurfaceCapabilities {
    /// Supported image formats.
    pub formats: Vec<Format>,
    /// Supported present modes.
    pub present_modes: Vec<PresentMode>,
    /// Whether storage usage is available on swapchain images.
    pub supports_storage: bool,
    /// Current surface extent, when the platform pins one.
    pub current_extent: Option<(u32, u32)>,
}

/// Resolved configuration handed to the backend.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainConfig {
    /// Chosen image format.
    pub format: Format,
    /// Image extent.
    pub extent: (u32, u32),
    /// Back buffer count; always triple buffered.
    pub image_count: u32,
    /// Chosen present mode.
    pub present_mode: PresentMode,
    /// Image usage.
    pub usage: TextureUsage,
}

/// Back-buffer image count; matches the in-flight depth.
pub const SWAPCHAIN_IMAGES: u32 = 3;

pub(crate) struct SwapImage<B: Backend> {
    pub raw: B::Image,
    pub read_handle: ResourceHandle,
    pub write_handle: ResourceHandle,
    pub track: Mutex<ResourceState>,
}

pub(crate) struct SwapchainState<B: Backend> {
    pub raw: Option<B::Swapchain>,
    pub images: Vec<SwapImage<B>>,
    pub version: u64,
    pub extent: (u32, u32),
    pub format: Format,
    pub present_mode: PresentMode,
    pub current_image: u32,
}

pub(crate) struct SwapchainInner<B: Backend> {
    pub(crate) surface: Option<B::Surface>,
    pub(crate) desc: SwapchainDesc,
    pub(crate) state: Mutex<SwapchainState<B>>,
    pub(crate) device: DeviceRef<B>,
}

impl<B: Backend> SwapchainInner<B> {
    pub(crate) fn surface(&self) -> &B::Surface {
        self.surface.as_ref().expect("surface already destroyed")
    }
}

impl<B: Backend> Drop for SwapchainInner<B> {
    fn drop(&mut self) {
        let device = match self.device.upgrade() {
            Some(device) if !device.is_torn_down() => device,
            _ => return,
        };
        let mut state = self.state.lock();
        for image in state.images.drain(..) {
            device.free_handles(&[image.read_handle, image.write_handle]);
            unsafe { device.raw().destroy_image(image.raw) };
        }
        if let Some(raw) = state.raw.take() {
            unsafe { device.raw().destroy_swapchain(raw) };
        }
        drop(state);
        if let Some(surface) = self.surface.take() {
            unsafe { device.destroy_surface(surface) };
        }
    }
}

/// A presentable, versioned swapchain.
pub struct Swapchain<B: Backend> {
    pub(crate) inner: Arc<SwapchainInner<B>>,
}

impl<B: Backend> Clone for Swapchain<B> {
    fn clone(&self) -> Self {
        Swapchain {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Swapchain<B> {
    /// Current version; bumped by every (re)creation.
    pub fn version(&self) -> u64 {
        self.inner.state.lock().version
    }

    /// Current image extent.
    pub fn extent(&self) -> (u32, u32) {
        self.inner.state.lock().extent
    }

    /// Chosen image format.
    pub fn format(&self) -> Format {
        self.inner.state.lock().format
    }

    /// Chosen present mode.
    pub fn present_mode(&self) -> PresentMode {
        self.inner.state.lock().present_mode
    }

    /// Bindless read handle of the image acquired this frame.
    pub fn current_read_handle(&self) -> ResourceHandle {
        let state = self.inner.state.lock();
        state.images[state.current_image as usize].read_handle
    }

    /// Bindless write handle of the image acquired this frame, null unless
    /// the swapchain was created with `SHADER_WRITE`.
    pub fn current_write_handle(&self) -> ResourceHandle {
        let state = self.inner.state.lock();
        state.images[state.current_image as usize].write_handle
    }

    /// Re-create the swapchain for a new window size. Strictly increments
    /// the version; command lists recorded against the old version are
    /// rejected at submit.
    pub fn resize(&self, window: &WindowHandle) -> Result<()> {
        let device = self
            .inner
            .device
            .upgrade()
            .ok_or(crate::error::Error::InvalidState("device lost"))?;
        device.resize_swapchain(&self.inner, window.size)
    }
}

/// Pick the first caller priority the surface supports, falling back to
/// Fifo which is always available.
pub(crate) fn choose_present_mode(
    priorities: &[PresentMode],
    supported: &[PresentMode],
) -> PresentMode {
    priorities
        .iter()
        .copied()
        .find(|mode| supported.contains(mode))
        .unwrap_or(PresentMode::Fifo)
}

/// Pick the first preferred format the surface supports.
pub(crate) fn choose_format(requested: WindowFormat, supported: &[Format]) -> Option<Format> {
    requested
        .preference_list()
        .iter()
        .copied()
        .find(|format| supported.contains(format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn present_mode_priority_order() {
        let supported = [PresentMode::Fifo, PresentMode::Mailbox];
        assert_eq!(
            choose_present_mode(
                &[PresentMode::Immediate, PresentMode::Mailbox, PresentMode::Fifo],
                &supported
            ),
            PresentMode::Mailbox
        );
        assert_eq!(
            choose_present_mode(&[PresentMode::Immediate], &supported),
            PresentMode::Fifo
        );
    }

    #[test]
    fn format_preference_fallback() {
        let supported = [Format::Rgba8Unorm];
        assert_eq!(
            choose_format(WindowFormat::Bgra8, &supported),
            Some(Format::Rgba8Unorm)
        );
        assert_eq!(choose_format(WindowFormat::Rgba32f, &supported), None);
    }
}
