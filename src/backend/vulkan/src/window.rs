//! Platform surface creation.

use ash::{extensions::khr, vk};
use raw_window_handle::RawWindowHandle;

use grx::{
    backend::WindowHandle,
    error::{Error, Result},
};

use crate::{native::Surface, result::map_err, RawInstance};

pub(crate) fn create_surface(instance: &RawInstance, window: &WindowHandle) -> Result<Surface> {
    let raw = match window.raw {
        #[cfg(all(unix, not(target_os = "android"), not(target_os = "macos")))]
        RawWindowHandle::Xlib(handle) => {
            let ext = khr::XlibSurface::new(&instance.entry, &instance.raw);
            let info = vk::XlibSurfaceCreateInfoKHR {
                dpy: handle.display as *mut _,
                window: handle.window,
                ..Default::default()
            };
            unsafe { ext.create_xlib_surface(&info, None) }.map_err(map_err)?
        }
        #[cfg(all(unix, not(target_os = "android"), not(target_os = "macos")))]
        RawWindowHandle::Wayland(handle) => {
            let ext = khr::WaylandSurface::new(&instance.entry, &instance.raw);
            let info = vk::WaylandSurfaceCreateInfoKHR {
                display: handle.display,
                surface: handle.surface,
                ..Default::default()
            };
            unsafe { ext.create_wayland_surface(&info, None) }.map_err(map_err)?
        }
        #[cfg(windows)]
        RawWindowHandle::Windows(handle) => {
            let ext = khr::Win32Surface::new(&instance.entry, &instance.raw);
            let info = vk::Win32SurfaceCreateInfoKHR {
                hinstance: handle.hinstance,
                hwnd: handle.hwnd,
                ..Default::default()
            };
            unsafe { ext.create_win32_surface(&info, None) }.map_err(map_err)?
        }
        _ => {
            return Err(Error::UnsupportedOperation(
                "window system is not supported by this backend",
            ))
        }
    };
    Ok(Surface { raw })
}
