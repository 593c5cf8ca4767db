//! Vulkan backend for the grx runtime.
//!
//! One graphics+compute queue, timeline-semaphore frame fencing, a single
//! update-after-bind descriptor heap for the bindless model, and dynamic
//! rendering for render scopes.

#[macro_use]
extern crate log;

use std::{
    borrow::Cow,
    ffi::{CStr, CString},
    os::raw::c_void,
    sync::Arc,
};

use ash::{
    extensions::{ext, khr},
    vk, Entry,
};

use grx::{
    adapter::{
        Capabilities, DeviceInfo, DeviceType, Limits, MIN_GS_INVOCATIONS, MIN_TESS_PATCH_SIZE,
    },
    backend::{BackendInstance, DeviceFlags, WindowHandle},
    descriptor::DescriptorType,
    error::{Error, Result},
    memory::{MemoryFlags, MemoryProperties, MemoryType},
};

mod command;
mod conv;
mod device;
mod native;
mod result;
mod window;

pub use crate::command::CommandBuffer;
pub use crate::native::{
    AccelerationStructure, Buffer, CommandPool, Image, Memory, Pipeline, Sampler, Surface,
    Swapchain,
};

use crate::result::map_err;

const VALIDATION_LAYER: &[u8] = b"VK_LAYER_KHRONOS_validation\0";

/// The Vulkan backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {}

impl grx::Backend for Backend {
    type Instance = Instance;
    type Surface = native::Surface;
    type Device = device::Device;
    type Memory = native::Memory;
    type Buffer = native::Buffer;
    type Image = native::Image;
    type Sampler = native::Sampler;
    type Swapchain = native::Swapchain;
    type Pipeline = native::Pipeline;
    type AccelerationStructure = native::AccelerationStructure;
    type CommandPool = native::CommandPool;
    type CommandBuffer = command::CommandBuffer;
}

pub(crate) struct RawInstance {
    pub entry: Entry,
    pub raw: ash::Instance,
    pub surface_ext: khr::Surface,
    pub debug: Option<(ext::DebugUtils, vk::DebugUtilsMessengerEXT)>,
    pub flags: DeviceFlags,
}

impl Drop for RawInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((ref utils, messenger)) = self.debug {
                utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

/// Vulkan instance.
pub struct Instance {
    pub(crate) raw: Arc<RawInstance>,
}

unsafe extern "system" fn debug_messenger_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    ty: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let data = *callback_data;
    let message = if data.p_message.is_null() {
        Cow::from("")
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy()
    };
    let level = match severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::Level::Error,
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::Level::Warn,
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => log::Level::Info,
        _ => log::Level::Trace,
    };
    log!(level, "[{:?}] {}", ty, message);
    vk::FALSE
}

fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available.iter().any(|e| {
        (unsafe { CStr::from_ptr(e.extension_name.as_ptr()) }) == name
    })
}

impl BackendInstance<Backend> for Instance {
    fn create(app_name: &str, app_version: u32, flags: DeviceFlags) -> Result<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|_| Error::NotFound("unable to load the Vulkan loader"))?;

        let app_name = CString::new(app_name)
            .map_err(|_| Error::InvalidParameter("application name contains NUL"))?;
        let app_info = vk::ApplicationInfo {
            p_application_name: app_name.as_ptr(),
            application_version: app_version,
            p_engine_name: b"grx\0".as_ptr() as *const _,
            engine_version: 1,
            api_version: vk::API_VERSION_1_2,
            ..Default::default()
        };

        let available = entry
            .enumerate_instance_extension_properties(None)
            .map_err(map_err)?;
        let mut extensions: Vec<*const std::os::raw::c_char> = vec![khr::Surface::name().as_ptr()];
        #[cfg(all(unix, not(target_os = "android"), not(target_os = "macos")))]
        {
            for name in [
                khr::XlibSurface::name(),
                khr::WaylandSurface::name(),
                khr::XcbSurface::name(),
            ]
            .iter()
            {
                if has_extension(&available, name) {
                    extensions.push(name.as_ptr());
                }
            }
        }
        #[cfg(windows)]
        extensions.push(khr::Win32Surface::name().as_ptr());

        let debug_requested = flags.contains(DeviceFlags::DEBUG)
            && has_extension(&available, ext::DebugUtils::name());
        if debug_requested {
            extensions.push(ext::DebugUtils::name().as_ptr());
        }

        let layers = entry
            .enumerate_instance_layer_properties()
            .map_err(map_err)?;
        let validation = CStr::from_bytes_with_nul(VALIDATION_LAYER).unwrap();
        let enable_validation = flags.contains(DeviceFlags::DEBUG)
            && layers.iter().any(|l| {
                (unsafe { CStr::from_ptr(l.layer_name.as_ptr()) }) == validation
            });
        if flags.contains(DeviceFlags::DEBUG) && !enable_validation {
            warn!("validation layer requested but not available");
        }
        let layer_ptrs: Vec<*const std::os::raw::c_char> = if enable_validation {
            vec![validation.as_ptr()]
        } else {
            Vec::new()
        };

        if flags.contains(DeviceFlags::VERBOSE) {
            debug!(
                "vulkan instance: validation {}, {} extensions",
                enable_validation,
                extensions.len()
            );
        }

        let create_info = vk::InstanceCreateInfo {
            p_application_info: &app_info,
            enabled_layer_count: layer_ptrs.len() as u32,
            pp_enabled_layer_names: layer_ptrs.as_ptr(),
            enabled_extension_count: extensions.len() as u32,
            pp_enabled_extension_names: extensions.as_ptr(),
            ..Default::default()
        };
        let raw = unsafe { entry.create_instance(&create_info, None) }.map_err(map_err)?;

        let debug = if debug_requested {
            let utils = ext::DebugUtils::new(&entry, &raw);
            let info = vk::DebugUtilsMessengerCreateInfoEXT {
                message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
                message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                pfn_user_callback: Some(debug_messenger_callback),
                ..Default::default()
            };
            let messenger =
                unsafe { utils.create_debug_utils_messenger(&info, None) }.map_err(map_err)?;
            Some((utils, messenger))
        } else {
            None
        };

        let surface_ext = khr::Surface::new(&entry, &raw);
        Ok(Instance {
            raw: Arc::new(RawInstance {
                entry,
                raw,
                surface_ext,
                debug,
                flags,
            }),
        })
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        let physicals =
            unsafe { self.raw.raw.enumerate_physical_devices() }.map_err(map_err)?;
        let mut infos = Vec::with_capacity(physicals.len());
        for (index, physical) in physicals.into_iter().enumerate() {
            infos.push(self.describe(physical, index)?);
        }
        Ok(infos)
    }

    fn create_surface(&self, window: &WindowHandle) -> Result<native::Surface> {
        window::create_surface(&self.raw, window)
    }

    unsafe fn destroy_surface(&self, surface: native::Surface) {
        self.raw.surface_ext.destroy_surface(surface.raw, None);
    }

    fn open_device(&self, info: &DeviceInfo, flags: DeviceFlags) -> Result<device::Device> {
        device::Device::open(&self.raw, info, flags)
    }
}

impl Instance {
    fn describe(&self, physical: vk::PhysicalDevice, index: usize) -> Result<DeviceInfo> {
        let instance = &self.raw.raw;

        let mut maintenance3 = vk::PhysicalDeviceMaintenance3Properties::default();
        let mut props2 = vk::PhysicalDeviceProperties2::builder()
            .push_next(&mut maintenance3)
            .build();
        unsafe { instance.get_physical_device_properties2(physical, &mut props2) };
        let properties = props2.properties;
        let limits = properties.limits;

        let extensions = unsafe {
            instance
                .enumerate_device_extension_properties(physical)
                .map_err(map_err)?
        };

        let mut vk12 = vk::PhysicalDeviceVulkan12Features::default();
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut rq_features = vk::PhysicalDeviceRayQueryFeaturesKHR::default();
        let mut dynren = vk::PhysicalDeviceDynamicRenderingFeaturesKHR::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder()
            .push_next(&mut vk12)
            .push_next(&mut as_features)
            .push_next(&mut rt_features)
            .push_next(&mut rq_features)
            .push_next(&mut dynren)
            .build();
        unsafe { instance.get_physical_device_features2(physical, &mut features2) };
        let features = features2.features;

        let mut capabilities = Capabilities::empty();
        if vk12.buffer_device_address != 0 {
            capabilities |= Capabilities::DEVICE_ADDRESS;
        }
        if as_features.acceleration_structure != 0
            && rt_features.ray_tracing_pipeline != 0
            && has_extension(&extensions, khr::AccelerationStructure::name())
            && has_extension(&extensions, khr::RayTracingPipeline::name())
        {
            capabilities |= Capabilities::RAY_PIPELINE;
        }
        if rq_features.ray_query != 0 {
            capabilities |= Capabilities::RAY_QUERY;
        }
        if features.tessellation_shader != 0
            && limits.max_tessellation_patch_size >= MIN_TESS_PATCH_SIZE
        {
            capabilities |= Capabilities::TESSELLATION;
        }
        if features.geometry_shader != 0
            && limits.max_geometry_shader_invocations >= MIN_GS_INVOCATIONS
        {
            capabilities |= Capabilities::GEOMETRY_SHADER;
        }
        if vk12.draw_indirect_count != 0 {
            capabilities |= Capabilities::INDIRECT_COUNT;
        }
        capabilities |= Capabilities::SWAPCHAIN_COMPUTE;

        let memory =
            unsafe { instance.get_physical_device_memory_properties(physical) };
        let mut dedicated_memory = 0;
        let mut shared_memory = 0;
        let heaps: Vec<u64> = memory.memory_heaps[..memory.memory_heap_count as usize]
            .iter()
            .map(|heap| {
                if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                    dedicated_memory += heap.size;
                } else {
                    shared_memory += heap.size;
                }
                heap.size
            })
            .collect();
        let types: Vec<MemoryType> = memory.memory_types[..memory.memory_type_count as usize]
            .iter()
            .map(|ty| {
                let mut flags = MemoryFlags::empty();
                if ty.property_flags.contains(vk::MemoryPropertyFlags::DEVICE_LOCAL) {
                    flags |= MemoryFlags::DEVICE_LOCAL;
                }
                if ty.property_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
                    flags |= MemoryFlags::HOST_VISIBLE;
                }
                if ty.property_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT) {
                    flags |= MemoryFlags::COHERENT;
                }
                if ty.property_flags.contains(vk::MemoryPropertyFlags::HOST_CACHED) {
                    flags |= MemoryFlags::CPU_CACHED;
                }
                MemoryType {
                    flags,
                    heap_index: ty.heap_index as usize,
                }
            })
            .collect();

        let device_type = match properties.device_type {
            vk::PhysicalDeviceType::INTEGRATED_GPU => DeviceType::IntegratedGpu,
            vk::PhysicalDeviceType::DISCRETE_GPU => DeviceType::DiscreteGpu,
            vk::PhysicalDeviceType::VIRTUAL_GPU => DeviceType::VirtualGpu,
            vk::PhysicalDeviceType::CPU => DeviceType::Cpu,
            _ => DeviceType::Other,
        };
        // Unified-memory devices place everything in shared space.
        if device_type != DeviceType::DiscreteGpu {
            shared_memory += dedicated_memory;
        }

        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        Ok(DeviceInfo {
            name,
            vendor: properties.vendor_id,
            device: properties.device_id,
            device_type,
            capabilities,
            limits: Limits {
                max_allocation_size: maintenance3.max_memory_allocation_size,
                dedicated_memory,
                shared_memory,
                non_coherent_atom_size: limits.non_coherent_atom_size.max(1),
                buffer_copy_offset_alignment: limits.optimal_buffer_copy_offset_alignment.max(1),
                buffer_copy_pitch_alignment: limits
                    .optimal_buffer_copy_row_pitch_alignment
                    .max(1),
                uniform_buffer_offset_alignment: limits
                    .min_uniform_buffer_offset_alignment
                    .max(1),
                buffer_image_granularity: limits.buffer_image_granularity.max(1),
                max_texture_size: limits.max_image_dimension2_d,
            },
            memory: MemoryProperties { heaps, types },
            physical_index: index,
        })
    }
}
