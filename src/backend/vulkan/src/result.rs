//! Vulkan result code conversion.

use ash::vk;
use grx::Error;

/// Map a Vulkan result to the portable error taxonomy.
pub(crate) fn map_err(result: vk::Result) -> Error {
    match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY => Error::OutOfMemory("out of host memory"),
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => Error::OutOfMemory("out of device memory"),
        vk::Result::ERROR_MEMORY_MAP_FAILED => Error::OutOfMemory("memory map failed"),
        vk::Result::ERROR_DEVICE_LOST => Error::InvalidState("device lost"),
        vk::Result::ERROR_SURFACE_LOST_KHR => Error::InvalidState("surface lost"),
        vk::Result::ERROR_OUT_OF_DATE_KHR => Error::InvalidState("swapchain out of date"),
        vk::Result::ERROR_NATIVE_WINDOW_IN_USE_KHR => {
            Error::InvalidOperation("native window already in use")
        }
        vk::Result::ERROR_INITIALIZATION_FAILED => {
            Error::InvalidState("vulkan initialization failed")
        }
        vk::Result::ERROR_EXTENSION_NOT_PRESENT | vk::Result::ERROR_FEATURE_NOT_PRESENT => {
            Error::UnsupportedOperation("missing vulkan extension or feature")
        }
        vk::Result::ERROR_INCOMPATIBLE_DRIVER => {
            Error::UnsupportedOperation("incompatible vulkan driver")
        }
        vk::Result::ERROR_TOO_MANY_OBJECTS => Error::OutOfBounds("too many vulkan objects"),
        vk::Result::ERROR_FORMAT_NOT_SUPPORTED => {
            Error::UnsupportedOperation("format not supported")
        }
        vk::Result::TIMEOUT => Error::TimedOut("vulkan wait timed out"),
        _ => Error::InvalidState("unexpected vulkan error"),
    }
}

/// Shorthand for `VkResult`-returning calls.
pub(crate) fn check(result: std::result::Result<(), vk::Result>) -> Result<(), Error> {
    result.map_err(map_err)
}
