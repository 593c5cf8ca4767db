//! Logical device and the backend entry points.

use std::{
    ffi::CString,
    ops::Range,
    sync::{atomic::AtomicU64, Arc},
};

use ash::{extensions::khr, vk};
use smallvec::SmallVec;

use grx::{
    adapter::{Capabilities, DeviceInfo},
    backend::{BackendDevice, DeviceFlags, SubmitDesc},
    buffer::BufferUsage,
    descriptor::{DescriptorType, ResourceHandle},
    error::{Error, Result},
    memory::Requirements,
    pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, RaytracingPipelineDesc, ShaderStage},
    resource::ResourceFlags,
    rtas::{RtasBuildInputs, RtasGeometryRef, RtasSizes},
    sampler::SamplerDesc,
    swapchain::{SurfaceCapabilities, SwapchainConfig},
    texture::{TextureDesc, TextureType},
};

use crate::{
    command::CommandBuffer,
    conv,
    native::{
        AccelerationStructure, Buffer, CommandPool, Image, Memory, Pipeline, Sampler, Surface,
        Swapchain,
    },
    result::map_err,
    Backend, RawInstance,
};

const FRAMES: usize = 3;

pub(crate) struct DescriptorHeap {
    pub pool: vk::DescriptorPool,
    pub resources_layout: vk::DescriptorSetLayout,
    pub samplers_layout: vk::DescriptorSetLayout,
    pub frame_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
    pub resources_set: vk::DescriptorSet,
    pub samplers_set: vk::DescriptorSet,
    pub frame_sets: [vk::DescriptorSet; FRAMES],
}

fn vk_descriptor_type(ty: DescriptorType) -> vk::DescriptorType {
    match ty {
        DescriptorType::Sampler => vk::DescriptorType::SAMPLER,
        DescriptorType::Texture2D | DescriptorType::TextureCube | DescriptorType::Texture3D => {
            vk::DescriptorType::SAMPLED_IMAGE
        }
        DescriptorType::Buffer | DescriptorType::RWBuffer => vk::DescriptorType::STORAGE_BUFFER,
        DescriptorType::Tlas => vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
        _ => vk::DescriptorType::STORAGE_IMAGE,
    }
}

const RESOURCE_TYPES: [DescriptorType; 12] = [
    DescriptorType::Texture2D,
    DescriptorType::TextureCube,
    DescriptorType::Texture3D,
    DescriptorType::Buffer,
    DescriptorType::RWBuffer,
    DescriptorType::RWTexture2D,
    DescriptorType::RWTexture3D,
    DescriptorType::RWTexture2Df,
    DescriptorType::RWTexture2Di,
    DescriptorType::RWTexture2Du,
    DescriptorType::RWTexture3Df,
    DescriptorType::Tlas,
];

pub(crate) struct RawDevice {
    pub raw: ash::Device,
    pub instance: Arc<RawInstance>,
    pub physical: vk::PhysicalDevice,
    pub queue: vk::Queue,
    pub queue_family: u32,
    pub swapchain_ext: khr::Swapchain,
    pub dynren_ext: khr::DynamicRendering,
    pub as_ext: Option<khr::AccelerationStructure>,
    pub rt_ext: Option<khr::RayTracingPipeline>,
    pub timeline: vk::Semaphore,
    pub submit_semaphores: [vk::Semaphore; FRAMES],
    pub heap: DescriptorHeap,
    pub has_device_address: bool,
    pub has_ray: bool,
    pub sbt_handle_size: u32,
    pub non_coherent_atom: u64,
    pub debug: bool,
}

impl Drop for RawDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();
            self.raw.destroy_semaphore(self.timeline, None);
            for semaphore in self.submit_semaphores.iter() {
                self.raw.destroy_semaphore(*semaphore, None);
            }
            self.raw.destroy_pipeline_layout(self.heap.pipeline_layout, None);
            self.raw.destroy_descriptor_pool(self.heap.pool, None);
            self.raw
                .destroy_descriptor_set_layout(self.heap.resources_layout, None);
            self.raw
                .destroy_descriptor_set_layout(self.heap.samplers_layout, None);
            self.raw
                .destroy_descriptor_set_layout(self.heap.frame_layout, None);
            self.raw.destroy_device(None);
        }
    }
}

impl RawDevice {
    pub(crate) fn set_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        if !self.debug || name.is_empty() {
            return;
        }
        if let Some((utils, _)) = &self.instance.debug {
            if let Ok(name) = CString::new(name) {
                let info = vk::DebugUtilsObjectNameInfoEXT {
                    object_type,
                    object_handle: handle,
                    p_object_name: name.as_ptr(),
                    ..Default::default()
                };
                let _ = unsafe { utils.set_debug_utils_object_name(self.raw.handle(), &info) };
            }
        }
    }
}

/// Vulkan logical device.
pub struct Device {
    pub(crate) shared: Arc<RawDevice>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "VulkanDevice")
    }
}

impl Device {
    pub(crate) fn open(
        instance: &Arc<RawInstance>,
        info: &DeviceInfo,
        flags: DeviceFlags,
    ) -> Result<Device> {
        let physicals =
            unsafe { instance.raw.enumerate_physical_devices() }.map_err(map_err)?;
        let physical = *physicals
            .get(info.physical_index)
            .ok_or(Error::NotFound("physical device index out of date"))?;

        let queue_families = unsafe {
            instance
                .raw
                .get_physical_device_queue_family_properties(physical)
        };
        let queue_family = queue_families
            .iter()
            .position(|family| {
                family
                    .queue_flags
                    .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
            })
            .ok_or(Error::NotFound("no graphics+compute queue family"))?
            as u32;

        let has_ray = info.capabilities.contains(Capabilities::RAY_PIPELINE);
        let has_device_address = info.capabilities.contains(Capabilities::DEVICE_ADDRESS);
        if has_ray && !has_device_address {
            return Err(Error::UnsupportedOperation(
                "raytracing requires buffer device addresses",
            ));
        }

        let mut extensions: Vec<*const std::os::raw::c_char> = vec![
            khr::Swapchain::name().as_ptr(),
            khr::DynamicRendering::name().as_ptr(),
        ];
        if has_ray {
            extensions.push(khr::AccelerationStructure::name().as_ptr());
            extensions.push(khr::RayTracingPipeline::name().as_ptr());
            extensions.push(khr::DeferredHostOperations::name().as_ptr());
        }

        let priorities = [1.0f32];
        let queue_info = vk::DeviceQueueCreateInfo {
            queue_family_index: queue_family,
            queue_count: 1,
            p_queue_priorities: priorities.as_ptr(),
            ..Default::default()
        };

        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: vk::TRUE,
            ..Default::default()
        };
        let mut vk12 = vk::PhysicalDeviceVulkan12Features {
            timeline_semaphore: vk::TRUE,
            descriptor_indexing: vk::TRUE,
            runtime_descriptor_array: vk::TRUE,
            descriptor_binding_partially_bound: vk::TRUE,
            descriptor_binding_sampled_image_update_after_bind: vk::TRUE,
            descriptor_binding_storage_image_update_after_bind: vk::TRUE,
            descriptor_binding_storage_buffer_update_after_bind: vk::TRUE,
            descriptor_binding_update_unused_while_pending: vk::TRUE,
            shader_sampled_image_array_non_uniform_indexing: vk::TRUE,
            shader_storage_buffer_array_non_uniform_indexing: vk::TRUE,
            buffer_device_address: if has_device_address { vk::TRUE } else { vk::FALSE },
            draw_indirect_count: if info.capabilities.contains(Capabilities::INDIRECT_COUNT) {
                vk::TRUE
            } else {
                vk::FALSE
            },
            ..Default::default()
        };
        let mut dynren = vk::PhysicalDeviceDynamicRenderingFeaturesKHR {
            dynamic_rendering: vk::TRUE,
            ..Default::default()
        };
        let mut as_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR {
            acceleration_structure: vk::TRUE,
            descriptor_binding_acceleration_structure_update_after_bind: vk::TRUE,
            ..Default::default()
        };
        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR {
            ray_tracing_pipeline: vk::TRUE,
            ..Default::default()
        };

        let mut create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(std::slice::from_ref(&queue_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features)
            .push_next(&mut vk12)
            .push_next(&mut dynren);
        if has_ray {
            create_info = create_info
                .push_next(&mut as_features)
                .push_next(&mut rt_features);
        }

        let raw = unsafe { instance.raw.create_device(physical, &create_info, None) }
            .map_err(map_err)?;
        let queue = unsafe { raw.get_device_queue(queue_family, 0) };

        let swapchain_ext = khr::Swapchain::new(&instance.raw, &raw);
        let dynren_ext = khr::DynamicRendering::new(&instance.raw, &raw);
        let (as_ext, rt_ext) = if has_ray {
            (
                Some(khr::AccelerationStructure::new(&instance.raw, &raw)),
                Some(khr::RayTracingPipeline::new(&instance.raw, &raw)),
            )
        } else {
            (None, None)
        };

        let sbt_handle_size = if has_ray {
            let mut rt_props = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
            let mut props2 = vk::PhysicalDeviceProperties2::builder()
                .push_next(&mut rt_props)
                .build();
            unsafe {
                instance
                    .raw
                    .get_physical_device_properties2(physical, &mut props2)
            };
            rt_props.shader_group_handle_size
        } else {
            0
        };

        // Timeline fence plus the per-frame binary present semaphores.
        let mut timeline_type = vk::SemaphoreTypeCreateInfo {
            semaphore_type: vk::SemaphoreType::TIMELINE,
            initial_value: 0,
            ..Default::default()
        };
        let timeline_info = vk::SemaphoreCreateInfo::builder().push_next(&mut timeline_type);
        let timeline =
            unsafe { raw.create_semaphore(&timeline_info, None) }.map_err(map_err)?;
        let mut submit_semaphores = [vk::Semaphore::null(); FRAMES];
        for semaphore in submit_semaphores.iter_mut() {
            *semaphore =
                unsafe { raw.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
                    .map_err(map_err)?;
        }

        let heap = Self::create_heap(&raw, has_ray)?;

        Ok(Device {
            shared: Arc::new(RawDevice {
                raw,
                instance: Arc::clone(instance),
                physical,
                queue,
                queue_family,
                swapchain_ext,
                dynren_ext,
                as_ext,
                rt_ext,
                timeline,
                submit_semaphores,
                heap,
                has_device_address,
                has_ray,
                sbt_handle_size,
                non_coherent_atom: info.limits.non_coherent_atom_size,
                debug: flags.contains(DeviceFlags::DEBUG),
            }),
        })
    }

    /// One process-wide descriptor heap: a resources set with a fixed array
    /// binding per descriptor type, a sampler set, and three versioned
    /// uniform sets for the per-frame constants.
    fn create_heap(raw: &ash::Device, has_ray: bool) -> Result<DescriptorHeap> {
        let bind_flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND
            | vk::DescriptorBindingFlags::UPDATE_UNUSED_WHILE_PENDING;

        let mut bindings = Vec::new();
        let mut flags = Vec::new();
        for ty in RESOURCE_TYPES.iter() {
            if *ty == DescriptorType::Tlas && !has_ray {
                continue;
            }
            bindings.push(vk::DescriptorSetLayoutBinding {
                binding: *ty as u32,
                descriptor_type: vk_descriptor_type(*ty),
                descriptor_count: ty.capacity(),
                stage_flags: vk::ShaderStageFlags::ALL,
                ..Default::default()
            });
            flags.push(bind_flags);
        }
        let mut binding_flags = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&flags);
        let resources_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut binding_flags);
        let resources_layout = unsafe { raw.create_descriptor_set_layout(&resources_info, None) }
            .map_err(map_err)?;

        let sampler_binding = [vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::SAMPLER,
            descriptor_count: DescriptorType::Sampler.capacity(),
            stage_flags: vk::ShaderStageFlags::ALL,
            ..Default::default()
        }];
        let sampler_flags = [bind_flags];
        let mut sampler_binding_flags = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&sampler_flags);
        let samplers_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&sampler_binding)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut sampler_binding_flags);
        let samplers_layout = unsafe { raw.create_descriptor_set_layout(&samplers_info, None) }
            .map_err(map_err)?;

        let frame_binding = [vk::DescriptorSetLayoutBinding {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
            stage_flags: vk::ShaderStageFlags::ALL,
            ..Default::default()
        }];
        let frame_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&frame_binding);
        let frame_layout = unsafe { raw.create_descriptor_set_layout(&frame_info, None) }
            .map_err(map_err)?;

        let mut pool_sizes = vec![
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: DescriptorType::Sampler.capacity(),
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: FRAMES as u32,
            },
        ];
        for ty in RESOURCE_TYPES.iter() {
            if *ty == DescriptorType::Tlas && !has_ray {
                continue;
            }
            pool_sizes.push(vk::DescriptorPoolSize {
                ty: vk_descriptor_type(*ty),
                descriptor_count: ty.capacity(),
            });
        }
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(2 + FRAMES as u32)
            .pool_sizes(&pool_sizes);
        let pool =
            unsafe { raw.create_descriptor_pool(&pool_info, None) }.map_err(map_err)?;

        let layouts = [
            resources_layout,
            samplers_layout,
            frame_layout,
            frame_layout,
            frame_layout,
        ];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets =
            unsafe { raw.allocate_descriptor_sets(&alloc_info) }.map_err(map_err)?;

        let set_layouts = [resources_layout, samplers_layout, frame_layout];
        let layout_info =
            vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let pipeline_layout = unsafe { raw.create_pipeline_layout(&layout_info, None) }
            .map_err(map_err)?;

        Ok(DescriptorHeap {
            pool,
            resources_layout,
            samplers_layout,
            frame_layout,
            pipeline_layout,
            resources_set: sets[0],
            samplers_set: sets[1],
            frame_sets: [sets[2], sets[3], sets[4]],
        })
    }

    fn create_shader_module(&self, stage: &ShaderStage) -> Result<vk::ShaderModule> {
        if stage.binary.len() % 4 != 0 {
            return Err(Error::InvalidParameter("shader binary is not SPIR-V"));
        }
        let words: Vec<u32> = stage
            .binary
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let info = vk::ShaderModuleCreateInfo::builder().code(&words);
        unsafe { self.shared.raw.create_shader_module(&info, None) }.map_err(map_err)
    }

    pub(crate) fn build_geometry(
        &self,
        inputs: &RtasBuildInputs<Backend>,
    ) -> (vk::AccelerationStructureGeometryKHR, u32) {
        let geometry = match &inputs.geometry {
            RtasGeometryRef::Triangles {
                positions,
                offset,
                format,
                stride,
                vertex_count,
                indices,
            } => {
                let vertex_address = unsafe { self.buffer_device_address(positions) } + offset;
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR {
                    vertex_format: conv::map_format(*format),
                    vertex_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: vertex_address,
                    },
                    vertex_stride: *stride,
                    max_vertex: vertex_count.saturating_sub(1),
                    index_type: match indices {
                        Some((_, _, format)) => conv::map_index_format(*format),
                        None => vk::IndexType::NONE_KHR,
                    },
                    index_data: vk::DeviceOrHostAddressConstKHR {
                        device_address: indices
                            .as_ref()
                            .map(|(buffer, offset, _)| {
                                (unsafe { self.buffer_device_address(buffer) }) + offset
                            })
                            .unwrap_or(0),
                    },
                    ..Default::default()
                };
                vk::AccelerationStructureGeometryKHR {
                    geometry_type: vk::GeometryTypeKHR::TRIANGLES,
                    geometry: vk::AccelerationStructureGeometryDataKHR { triangles },
                    flags: vk::GeometryFlagsKHR::OPAQUE,
                    ..Default::default()
                }
            }
            RtasGeometryRef::Aabbs {
                buffer,
                offset,
                stride,
            } => {
                let aabbs = vk::AccelerationStructureGeometryAabbsDataKHR {
                    data: vk::DeviceOrHostAddressConstKHR {
                        device_address: unsafe { self.buffer_device_address(buffer) } + offset,
                    },
                    stride: *stride,
                    ..Default::default()
                };
                vk::AccelerationStructureGeometryKHR {
                    geometry_type: vk::GeometryTypeKHR::AABBS,
                    geometry: vk::AccelerationStructureGeometryDataKHR { aabbs },
                    ..Default::default()
                }
            }
            RtasGeometryRef::Instances { buffer, offset, .. } => {
                let instances = vk::AccelerationStructureGeometryInstancesDataKHR {
                    array_of_pointers: vk::FALSE,
                    data: vk::DeviceOrHostAddressConstKHR {
                        device_address: unsafe { self.buffer_device_address(buffer) } + offset,
                    },
                    ..Default::default()
                };
                vk::AccelerationStructureGeometryKHR {
                    geometry_type: vk::GeometryTypeKHR::INSTANCES,
                    geometry: vk::AccelerationStructureGeometryDataKHR { instances },
                    ..Default::default()
                }
            }
        };
        (geometry, inputs.primitive_count)
    }

    pub(crate) unsafe fn buffer_device_address(&self, buffer: &Buffer) -> u64 {
        let info = vk::BufferDeviceAddressInfo {
            buffer: buffer.raw,
            ..Default::default()
        };
        self.shared.raw.get_buffer_device_address(&info)
    }

    pub(crate) fn build_info<'a>(
        &self,
        inputs: &RtasBuildInputs<Backend>,
        geometry: &'a vk::AccelerationStructureGeometryKHR,
    ) -> vk::AccelerationStructureBuildGeometryInfoKHR {
        vk::AccelerationStructureBuildGeometryInfoKHR {
            ty: if inputs.top_level {
                vk::AccelerationStructureTypeKHR::TOP_LEVEL
            } else {
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
            },
            flags: conv::map_build_flags(inputs.flags),
            mode: if inputs.flags.contains(grx::RtasBuildFlags::IS_UPDATE) {
                vk::BuildAccelerationStructureModeKHR::UPDATE
            } else {
                vk::BuildAccelerationStructureModeKHR::BUILD
            },
            geometry_count: 1,
            p_geometries: geometry,
            ..Default::default()
        }
    }
}

impl BackendDevice<Backend> for Device {
    unsafe fn allocate_memory(&self, type_id: u32, size: u64, name: &str) -> Result<Memory> {
        let mut flags_info = vk::MemoryAllocateFlagsInfo {
            flags: vk::MemoryAllocateFlags::DEVICE_ADDRESS,
            ..Default::default()
        };
        let mut info = vk::MemoryAllocateInfo::builder()
            .allocation_size(size)
            .memory_type_index(type_id);
        if self.shared.has_device_address {
            info = info.push_next(&mut flags_info);
        }
        let raw = self.shared.raw.allocate_memory(&info, None).map_err(map_err)?;
        self.shared
            .set_name(vk::ObjectType::DEVICE_MEMORY, vk::Handle::as_raw(raw), name);
        Ok(Memory {
            raw,
            size,
            mapped: None,
        })
    }

    unsafe fn free_memory(&self, memory: Memory) {
        self.shared.raw.free_memory(memory.raw, None);
    }

    unsafe fn map_memory(&self, memory: &Memory) -> Result<*mut u8> {
        self.shared
            .raw
            .map_memory(memory.raw, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
            .map(|ptr| ptr as *mut u8)
            .map_err(map_err)
    }

    unsafe fn flush_mapped(&self, memory: &Memory, ranges: &[Range<u64>]) -> Result<()> {
        let atom = self.shared.non_coherent_atom;
        let mapped: Vec<vk::MappedMemoryRange> = ranges
            .iter()
            .map(|range| {
                let start = range.start / atom * atom;
                let end = ((range.end + atom - 1) / atom * atom).min(memory.size);
                vk::MappedMemoryRange {
                    memory: memory.raw,
                    offset: start,
                    size: if end == memory.size {
                        vk::WHOLE_SIZE
                    } else {
                        end - start
                    },
                    ..Default::default()
                }
            })
            .collect();
        self.shared
            .raw
            .flush_mapped_memory_ranges(&mapped)
            .map_err(map_err)
    }

    fn memory_budget(&self, _device_local: bool) -> Option<u64> {
        None
    }

    unsafe fn create_buffer(
        &self,
        size: u64,
        usage: BufferUsage,
        flags: ResourceFlags,
        name: &str,
    ) -> Result<Buffer> {
        let info = vk::BufferCreateInfo {
            size,
            usage: conv::map_buffer_usage(usage, flags, self.shared.has_device_address),
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            ..Default::default()
        };
        let raw = self.shared.raw.create_buffer(&info, None).map_err(map_err)?;
        self.shared
            .set_name(vk::ObjectType::BUFFER, vk::Handle::as_raw(raw), name);
        Ok(Buffer { raw, size })
    }

    unsafe fn buffer_requirements(&self, buffer: &Buffer) -> Requirements {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::builder()
            .push_next(&mut dedicated)
            .build();
        let info = vk::BufferMemoryRequirementsInfo2 {
            buffer: buffer.raw,
            ..Default::default()
        };
        self.shared
            .raw
            .get_buffer_memory_requirements2(&info, &mut requirements);
        Requirements {
            size: requirements.memory_requirements.size,
            alignment: requirements.memory_requirements.alignment,
            type_mask: requirements.memory_requirements.memory_type_bits,
            prefers_dedicated: dedicated.prefers_dedicated_allocation != 0,
            requires_dedicated: dedicated.requires_dedicated_allocation != 0,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: &Buffer,
        memory: &Memory,
        offset: u64,
    ) -> Result<()> {
        self.shared
            .raw
            .bind_buffer_memory(buffer.raw, memory.raw, offset)
            .map_err(map_err)
    }

    unsafe fn buffer_address(&self, buffer: &Buffer) -> u64 {
        if !self.shared.has_device_address {
            return 0;
        }
        self.buffer_device_address(buffer)
    }

    unsafe fn destroy_buffer(&self, buffer: Buffer) {
        self.shared.raw.destroy_buffer(buffer.raw, None);
    }

    unsafe fn create_image(&self, desc: &TextureDesc, name: &str) -> Result<Image> {
        let depth_format = desc.format.desc().is_depth_stencil;
        let (depth, layers) = match desc.ty {
            TextureType::D3 => (desc.depth_or_layers, 1),
            TextureType::Cube => (1, desc.depth_or_layers.max(6)),
            TextureType::D2 => (1, desc.depth_or_layers),
        };
        let info = vk::ImageCreateInfo {
            flags: if desc.ty == TextureType::Cube {
                vk::ImageCreateFlags::CUBE_COMPATIBLE
            } else {
                vk::ImageCreateFlags::empty()
            },
            image_type: conv::map_texture_type(desc.ty),
            format: conv::map_format(desc.format),
            extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth,
            },
            mip_levels: desc.mips.max(1),
            array_layers: layers,
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: conv::map_texture_usage(desc.usage, depth_format),
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let raw = self.shared.raw.create_image(&info, None).map_err(map_err)?;
        self.shared
            .set_name(vk::ObjectType::IMAGE, vk::Handle::as_raw(raw), name);
        Ok(Image {
            raw,
            view: AtomicU64::new(0),
            desc: Some(*desc),
            owned: true,
        })
    }

    unsafe fn image_requirements(&self, image: &Image) -> Requirements {
        let mut dedicated = vk::MemoryDedicatedRequirements::default();
        let mut requirements = vk::MemoryRequirements2::builder()
            .push_next(&mut dedicated)
            .build();
        let info = vk::ImageMemoryRequirementsInfo2 {
            image: image.raw,
            ..Default::default()
        };
        self.shared
            .raw
            .get_image_memory_requirements2(&info, &mut requirements);
        Requirements {
            size: requirements.memory_requirements.size,
            alignment: requirements.memory_requirements.alignment,
            type_mask: requirements.memory_requirements.memory_type_bits,
            prefers_dedicated: dedicated.prefers_dedicated_allocation != 0,
            requires_dedicated: dedicated.requires_dedicated_allocation != 0,
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: &Image,
        desc: &TextureDesc,
        memory: &Memory,
        offset: u64,
    ) -> Result<()> {
        self.shared
            .raw
            .bind_image_memory(image.raw, memory.raw, offset)
            .map_err(map_err)?;
        let aspect = if desc.format.desc().is_depth_stencil {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let view_info = vk::ImageViewCreateInfo {
            image: image.raw,
            view_type: conv::map_view_type(desc.ty),
            format: conv::map_format(desc.format),
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: vk::REMAINING_MIP_LEVELS,
                base_array_layer: 0,
                layer_count: vk::REMAINING_ARRAY_LAYERS,
            },
            ..Default::default()
        };
        let view = self
            .shared
            .raw
            .create_image_view(&view_info, None)
            .map_err(map_err)?;
        image.set_view(view);
        Ok(())
    }

    unsafe fn destroy_image(&self, image: Image) {
        let view = image.view();
        if view != vk::ImageView::null() {
            self.shared.raw.destroy_image_view(view, None);
        }
        if image.owned {
            self.shared.raw.destroy_image(image.raw, None);
        }
    }

    unsafe fn create_sampler(&self, desc: &SamplerDesc, name: &str) -> Result<Sampler> {
        let info = vk::SamplerCreateInfo {
            mag_filter: conv::map_filter(desc.mag),
            min_filter: conv::map_filter(desc.min),
            mipmap_mode: conv::map_mip_mode(desc.mip),
            address_mode_u: conv::map_address_mode(desc.address_u),
            address_mode_v: conv::map_address_mode(desc.address_v),
            address_mode_w: conv::map_address_mode(desc.address_w),
            anisotropy_enable: (desc.max_anisotropy > 0) as u32,
            max_anisotropy: desc.max_anisotropy as f32,
            compare_enable: desc.compare.is_some() as u32,
            compare_op: desc
                .compare
                .map(conv::map_compare_op)
                .unwrap_or(vk::CompareOp::ALWAYS),
            border_color: conv::map_border_color(desc.border),
            min_lod: desc.min_lod,
            max_lod: desc.max_lod,
            ..Default::default()
        };
        let raw = self.shared.raw.create_sampler(&info, None).map_err(map_err)?;
        self.shared
            .set_name(vk::ObjectType::SAMPLER, vk::Handle::as_raw(raw), name);
        Ok(Sampler { raw })
    }

    unsafe fn destroy_sampler(&self, sampler: Sampler) {
        self.shared.raw.destroy_sampler(sampler.raw, None);
    }

    unsafe fn write_buffer_descriptor(
        &self,
        handle: ResourceHandle,
        buffer: &Buffer,
        offset: u64,
        size: u64,
    ) {
        let ty = match handle.ty() {
            Some(ty) => ty,
            None => return,
        };
        let buffer_info = vk::DescriptorBufferInfo {
            buffer: buffer.raw,
            offset,
            range: size,
        };
        let write = vk::WriteDescriptorSet {
            dst_set: self.shared.heap.resources_set,
            dst_binding: ty as u32,
            dst_array_element: handle.index(),
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
            p_buffer_info: &buffer_info,
            ..Default::default()
        };
        self.shared.raw.update_descriptor_sets(&[write], &[]);
    }

    unsafe fn write_image_descriptor(&self, handle: ResourceHandle, image: &Image) {
        let ty = match handle.ty() {
            Some(ty) => ty,
            None => return,
        };
        let storage = vk_descriptor_type(ty) == vk::DescriptorType::STORAGE_IMAGE;
        let image_info = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: image.view(),
            image_layout: if storage {
                vk::ImageLayout::GENERAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            },
        };
        let write = vk::WriteDescriptorSet {
            dst_set: self.shared.heap.resources_set,
            dst_binding: ty as u32,
            dst_array_element: handle.index(),
            descriptor_count: 1,
            descriptor_type: vk_descriptor_type(ty),
            p_image_info: &image_info,
            ..Default::default()
        };
        self.shared.raw.update_descriptor_sets(&[write], &[]);
    }

    unsafe fn write_sampler_descriptor(&self, handle: ResourceHandle, sampler: &Sampler) {
        let image_info = vk::DescriptorImageInfo {
            sampler: sampler.raw,
            image_view: vk::ImageView::null(),
            image_layout: vk::ImageLayout::UNDEFINED,
        };
        let write = vk::WriteDescriptorSet {
            dst_set: self.shared.heap.samplers_set,
            dst_binding: 0,
            dst_array_element: handle.index(),
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::SAMPLER,
            p_image_info: &image_info,
            ..Default::default()
        };
        self.shared.raw.update_descriptor_sets(&[write], &[]);
    }

    unsafe fn write_tlas_descriptor(&self, handle: ResourceHandle, tlas: &AccelerationStructure) {
        let structures = [tlas.raw];
        let mut as_info = vk::WriteDescriptorSetAccelerationStructureKHR::builder()
            .acceleration_structures(&structures);
        let mut write = vk::WriteDescriptorSet::builder()
            .dst_set(self.shared.heap.resources_set)
            .dst_binding(DescriptorType::Tlas as u32)
            .dst_array_element(handle.index())
            .descriptor_type(vk::DescriptorType::ACCELERATION_STRUCTURE_KHR)
            .push_next(&mut as_info)
            .build();
        write.descriptor_count = 1;
        self.shared.raw.update_descriptor_sets(&[write], &[]);
    }

    unsafe fn init_frame_uniforms(&self, buffers: [&Buffer; 3], size: u64) -> Result<()> {
        let infos: Vec<vk::DescriptorBufferInfo> = buffers
            .iter()
            .map(|buffer| vk::DescriptorBufferInfo {
                buffer: buffer.raw,
                offset: 0,
                range: size,
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = infos
            .iter()
            .enumerate()
            .map(|(i, info)| vk::WriteDescriptorSet {
                dst_set: self.shared.heap.frame_sets[i],
                dst_binding: 0,
                descriptor_count: 1,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                p_buffer_info: info,
                ..Default::default()
            })
            .collect();
        self.shared.raw.update_descriptor_sets(&writes, &[]);
        Ok(())
    }

    fn surface_capabilities(&self, surface: &Surface) -> Result<SurfaceCapabilities> {
        let ext = &self.shared.instance.surface_ext;
        let caps = unsafe {
            ext.get_physical_device_surface_capabilities(self.shared.physical, surface.raw)
        }
        .map_err(map_err)?;
        let formats = unsafe {
            ext.get_physical_device_surface_formats(self.shared.physical, surface.raw)
        }
        .map_err(map_err)?;
        let modes = unsafe {
            ext.get_physical_device_surface_present_modes(self.shared.physical, surface.raw)
        }
        .map_err(map_err)?;

        Ok(SurfaceCapabilities {
            formats: formats
                .iter()
                .filter_map(|f| conv::unmap_format(f.format))
                .collect(),
            present_modes: modes
                .iter()
                .filter_map(|m| conv::unmap_present_mode(*m))
                .collect(),
            supports_storage: caps
                .supported_usage_flags
                .contains(vk::ImageUsageFlags::STORAGE),
            current_extent: if caps.current_extent.width == u32::MAX {
                None
            } else {
                Some((caps.current_extent.width, caps.current_extent.height))
            },
        })
    }

    unsafe fn create_swapchain(
        &self,
        surface: &Surface,
        config: &SwapchainConfig,
        old: Option<Swapchain>,
    ) -> Result<(Swapchain, Vec<Image>)> {
        let info = vk::SwapchainCreateInfoKHR {
            surface: surface.raw,
            min_image_count: config.image_count,
            image_format: conv::map_format(config.format),
            image_color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            image_extent: vk::Extent2D {
                width: config.extent.0,
                height: config.extent.1,
            },
            image_array_layers: 1,
            image_usage: conv::map_texture_usage(config.usage, false),
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode: conv::map_present_mode(config.present_mode),
            clipped: vk::TRUE,
            old_swapchain: old
                .as_ref()
                .map(|s| s.raw)
                .unwrap_or(vk::SwapchainKHR::null()),
            ..Default::default()
        };
        let raw = self
            .shared
            .swapchain_ext
            .create_swapchain(&info, None)
            .map_err(map_err)?;

        let raw_images = self
            .shared
            .swapchain_ext
            .get_swapchain_images(raw)
            .map_err(map_err)?;
        let mut images = Vec::with_capacity(raw_images.len());
        for image in raw_images.iter() {
            let view_info = vk::ImageViewCreateInfo {
                image: *image,
                view_type: vk::ImageViewType::TYPE_2D,
                format: conv::map_format(config.format),
                subresource_range: vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                ..Default::default()
            };
            let view = self
                .shared
                .raw
                .create_image_view(&view_info, None)
                .map_err(map_err)?;
            images.push(Image {
                raw: *image,
                view: AtomicU64::new(vk::Handle::as_raw(view)),
                desc: None,
                owned: false,
            });
        }

        // Acquire semaphores follow the image count; they are carried over
        // from the old swapchain when it matches.
        let acquire_semaphores = match old {
            Some(old_swapchain) => {
                let reuse = old_swapchain.acquire_semaphores.len() == raw_images.len();
                let mut semaphores = Vec::new();
                if reuse {
                    semaphores = old_swapchain.acquire_semaphores.clone();
                } else {
                    for semaphore in old_swapchain.acquire_semaphores.iter() {
                        self.shared.raw.destroy_semaphore(*semaphore, None);
                    }
                }
                self.shared
                    .swapchain_ext
                    .destroy_swapchain(old_swapchain.raw, None);
                if !reuse {
                    for _ in 0..raw_images.len() {
                        semaphores.push(
                            self.shared
                                .raw
                                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                                .map_err(map_err)?,
                        );
                    }
                }
                semaphores
            }
            None => {
                let mut semaphores = Vec::with_capacity(raw_images.len());
                for _ in 0..raw_images.len() {
                    semaphores.push(
                        self.shared
                            .raw
                            .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                            .map_err(map_err)?,
                    );
                }
                semaphores
            }
        };

        Ok((
            Swapchain {
                raw,
                acquire_semaphores,
                last_acquire: std::sync::atomic::AtomicU32::new(0),
            },
            images,
        ))
    }

    unsafe fn destroy_swapchain(&self, swapchain: Swapchain) {
        for semaphore in swapchain.acquire_semaphores.iter() {
            self.shared.raw.destroy_semaphore(*semaphore, None);
        }
        self.shared
            .swapchain_ext
            .destroy_swapchain(swapchain.raw, None);
    }

    unsafe fn acquire_image(&self, swapchain: &Swapchain, frame_slot: usize) -> Result<u32> {
        let semaphore_index = frame_slot % swapchain.acquire_semaphores.len();
        let semaphore = swapchain.acquire_semaphores[semaphore_index];
        let (index, _suboptimal) = self
            .shared
            .swapchain_ext
            .acquire_next_image(swapchain.raw, u64::MAX, semaphore, vk::Fence::null())
            .map_err(map_err)?;
        swapchain
            .last_acquire
            .store(semaphore_index as u32, std::sync::atomic::Ordering::Release);
        Ok(index)
    }

    unsafe fn present(
        &self,
        swapchains: &[(&Swapchain, u32)],
        frame_slot: usize,
        _tearing: bool,
    ) -> Result<()> {
        let wait = [self.shared.submit_semaphores[frame_slot]];
        let raws: Vec<vk::SwapchainKHR> = swapchains.iter().map(|(s, _)| s.raw).collect();
        let indices: Vec<u32> = swapchains.iter().map(|(_, i)| *i).collect();
        let mut results = vec![vk::Result::SUCCESS; swapchains.len()];
        let info = vk::PresentInfoKHR {
            wait_semaphore_count: 1,
            p_wait_semaphores: wait.as_ptr(),
            swapchain_count: raws.len() as u32,
            p_swapchains: raws.as_ptr(),
            p_image_indices: indices.as_ptr(),
            p_results: results.as_mut_ptr(),
            ..Default::default()
        };
        self.shared
            .swapchain_ext
            .queue_present(self.shared.queue, &info)
            .map_err(map_err)?;
        for result in results {
            if result != vk::Result::SUCCESS && result != vk::Result::SUBOPTIMAL_KHR {
                return Err(map_err(result));
            }
        }
        Ok(())
    }

    unsafe fn create_command_pool(&self, name: &str) -> Result<CommandPool> {
        let info = vk::CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            queue_family_index: self.shared.queue_family,
            ..Default::default()
        };
        let raw = self
            .shared
            .raw
            .create_command_pool(&info, None)
            .map_err(map_err)?;
        self.shared
            .set_name(vk::ObjectType::COMMAND_POOL, vk::Handle::as_raw(raw), name);
        Ok(CommandPool { raw })
    }

    unsafe fn destroy_command_pool(&self, pool: CommandPool) {
        self.shared.raw.destroy_command_pool(pool.raw, None);
    }

    unsafe fn reset_command_pool(&self, pool: &mut CommandPool) -> Result<()> {
        self.shared
            .raw
            .reset_command_pool(pool.raw, vk::CommandPoolResetFlags::RELEASE_RESOURCES)
            .map_err(map_err)
    }

    unsafe fn allocate_command_buffer(&self, pool: &mut CommandPool) -> Result<CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo {
            command_pool: pool.raw,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let raw = self
            .shared
            .raw
            .allocate_command_buffers(&info)
            .map_err(map_err)?
            .remove(0);
        Ok(CommandBuffer {
            raw,
            shared: Arc::clone(&self.shared),
        })
    }

    unsafe fn begin_command_buffer(&self, cmd: &mut CommandBuffer) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::default();
        self.shared
            .raw
            .begin_command_buffer(cmd.raw, &info)
            .map_err(map_err)
    }

    unsafe fn end_command_buffer(&self, cmd: &mut CommandBuffer) -> Result<()> {
        self.shared.raw.end_command_buffer(cmd.raw).map_err(map_err)
    }

    unsafe fn submit(&self, cmd: Option<&CommandBuffer>, desc: &SubmitDesc<Backend>) -> Result<()> {
        let mut wait_semaphores = SmallVec::<[vk::Semaphore; 4]>::new();
        let mut wait_stages = SmallVec::<[vk::PipelineStageFlags; 4]>::new();
        let mut wait_values = SmallVec::<[u64; 4]>::new();

        if let Some(value) = desc.wait_value {
            wait_semaphores.push(self.shared.timeline);
            wait_stages.push(vk::PipelineStageFlags::TOP_OF_PIPE);
            wait_values.push(value);
        }
        for swapchain in desc.wait_swapchains.iter() {
            let index = swapchain
                .last_acquire
                .load(std::sync::atomic::Ordering::Acquire) as usize;
            wait_semaphores.push(swapchain.acquire_semaphores[index]);
            wait_stages.push(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::COMPUTE_SHADER
                    | vk::PipelineStageFlags::FRAGMENT_SHADER
                    | vk::PipelineStageFlags::TRANSFER,
            );
            wait_values.push(0);
        }

        let mut signal_semaphores = SmallVec::<[vk::Semaphore; 2]>::new();
        let mut signal_values = SmallVec::<[u64; 2]>::new();
        if let Some(value) = desc.signal_value {
            signal_semaphores.push(self.shared.timeline);
            signal_values.push(value);
        }
        if desc.signal_present {
            signal_semaphores.push(self.shared.submit_semaphores[desc.frame_slot]);
            signal_values.push(0);
        }

        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo {
            wait_semaphore_value_count: wait_values.len() as u32,
            p_wait_semaphore_values: wait_values.as_ptr(),
            signal_semaphore_value_count: signal_values.len() as u32,
            p_signal_semaphore_values: signal_values.as_ptr(),
            ..Default::default()
        };

        let buffers = cmd.map(|c| [c.raw]);
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(buffers.as_ref().map(|b| &b[..]).unwrap_or(&[]))
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        self.shared
            .raw
            .queue_submit(self.shared.queue, &[submit], vk::Fence::null())
            .map_err(map_err)
    }

    unsafe fn wait_timeline(&self, value: u64) -> Result<()> {
        let semaphores = [self.shared.timeline];
        let values = [value];
        let info = vk::SemaphoreWaitInfo::builder()
            .semaphores(&semaphores)
            .values(&values);
        self.shared
            .raw
            .wait_semaphores(&info, u64::MAX)
            .map_err(map_err)
    }

    unsafe fn wait_idle(&self) -> Result<()> {
        self.shared.raw.device_wait_idle().map_err(map_err)
    }

    unsafe fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        name: &str,
    ) -> Result<Pipeline> {
        let module = self.create_shader_module(&desc.shader)?;
        let entry = CString::new(desc.shader.entry)
            .map_err(|_| Error::InvalidParameter("entry point contains NUL"))?;
        let info = vk::ComputePipelineCreateInfo {
            stage: vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::COMPUTE,
                module,
                p_name: entry.as_ptr(),
                ..Default::default()
            },
            layout: self.shared.heap.pipeline_layout,
            ..Default::default()
        };
        let result = self.shared.raw.create_compute_pipelines(
            vk::PipelineCache::null(),
            &[info],
            None,
        );
        self.shared.raw.destroy_shader_module(module, None);
        let raw = result.map_err(|(_, e)| map_err(e))?.remove(0);
        self.shared
            .set_name(vk::ObjectType::PIPELINE, vk::Handle::as_raw(raw), name);
        Ok(Pipeline { raw })
    }

    unsafe fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        name: &str,
    ) -> Result<Pipeline> {
        let vertex_module = self.create_shader_module(&desc.vertex)?;
        let fragment_module = match &desc.fragment {
            Some(stage) => match self.create_shader_module(stage) {
                Ok(module) => Some(module),
                Err(e) => {
                    self.shared.raw.destroy_shader_module(vertex_module, None);
                    return Err(e);
                }
            },
            None => None,
        };
        let destroy_modules = |this: &Self| {
            this.shared.raw.destroy_shader_module(vertex_module, None);
            if let Some(module) = fragment_module {
                this.shared.raw.destroy_shader_module(module, None);
            }
        };

        let vertex_entry = CString::new(desc.vertex.entry).unwrap_or_default();
        let fragment_entry = desc
            .fragment
            .map(|s| CString::new(s.entry).unwrap_or_default())
            .unwrap_or_default();
        let mut stages = SmallVec::<[vk::PipelineShaderStageCreateInfo; 2]>::new();
        stages.push(vk::PipelineShaderStageCreateInfo {
            stage: vk::ShaderStageFlags::VERTEX,
            module: vertex_module,
            p_name: vertex_entry.as_ptr(),
            ..Default::default()
        });
        if let Some(module) = fragment_module {
            stages.push(vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::FRAGMENT,
                module,
                p_name: fragment_entry.as_ptr(),
                ..Default::default()
            });
        }

        let bindings: Vec<vk::VertexInputBindingDescription> = desc
            .bindings
            .iter()
            .map(|binding| vk::VertexInputBindingDescription {
                binding: binding.binding,
                stride: binding.stride,
                input_rate: if binding.per_instance {
                    vk::VertexInputRate::INSTANCE
                } else {
                    vk::VertexInputRate::VERTEX
                },
            })
            .collect();
        let attributes: Vec<vk::VertexInputAttributeDescription> = desc
            .attributes
            .iter()
            .map(|attribute| vk::VertexInputAttributeDescription {
                location: attribute.location,
                binding: attribute.binding,
                format: conv::map_format(attribute.format),
                offset: attribute.offset,
            })
            .collect();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: conv::map_topology(desc.topology),
            ..Default::default()
        };
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };
        let raster = vk::PipelineRasterizationStateCreateInfo {
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: conv::map_cull_mode(desc.cull),
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            ..Default::default()
        };
        let multisample = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk::SampleCountFlags::from_raw(desc.samples.max(1) as u32),
            ..Default::default()
        };
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo {
            depth_test_enable: desc.depth.test as u32,
            depth_write_enable: desc.depth.write as u32,
            depth_compare_op: conv::map_compare_op(desc.depth.compare),
            ..Default::default()
        };
        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_formats
            .iter()
            .map(|_| conv::map_blend(desc.blend))
            .collect();
        let blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .attachments(&blend_attachments);
        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::BLEND_CONSTANTS,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        let dynamic =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let color_formats: Vec<vk::Format> = desc
            .color_formats
            .iter()
            .map(|f| conv::map_format(*f))
            .collect();
        let mut rendering = vk::PipelineRenderingCreateInfoKHR::builder()
            .color_attachment_formats(&color_formats)
            .depth_attachment_format(
                desc.depth_format
                    .map(conv::map_format)
                    .unwrap_or(vk::Format::UNDEFINED),
            );

        let info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&raster)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&blend)
            .dynamic_state(&dynamic)
            .layout(self.shared.heap.pipeline_layout)
            .push_next(&mut rendering)
            .build();

        let result = self.shared.raw.create_graphics_pipelines(
            vk::PipelineCache::null(),
            &[info],
            None,
        );
        destroy_modules(self);
        let raw = result.map_err(|(_, e)| map_err(e))?.remove(0);
        self.shared
            .set_name(vk::ObjectType::PIPELINE, vk::Handle::as_raw(raw), name);
        Ok(Pipeline { raw })
    }

    unsafe fn create_raytracing_pipeline(
        &self,
        desc: &RaytracingPipelineDesc,
        name: &str,
    ) -> Result<Pipeline> {
        let rt_ext = self
            .shared
            .rt_ext
            .as_ref()
            .ok_or(Error::UnsupportedOperation("raytracing is not enabled"))?;

        let mut modules = Vec::with_capacity(desc.stages.len());
        let mut entries = Vec::with_capacity(desc.stages.len());
        for stage in desc.stages.iter() {
            modules.push(self.create_shader_module(stage)?);
            entries.push(CString::new(stage.entry).unwrap_or_default());
        }

        // Stage array mirrors `desc.stages`; group records index into it.
        let stage_infos: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .stages
            .iter()
            .enumerate()
            .map(|(i, _)| {
                let stage = if desc.raygen.contains(&(i as u32)) {
                    vk::ShaderStageFlags::RAYGEN_KHR
                } else if desc.miss.contains(&(i as u32)) {
                    vk::ShaderStageFlags::MISS_KHR
                } else if desc.callable.contains(&(i as u32)) {
                    vk::ShaderStageFlags::CALLABLE_KHR
                } else {
                    vk::ShaderStageFlags::CLOSEST_HIT_KHR
                };
                vk::PipelineShaderStageCreateInfo {
                    stage,
                    module: modules[i],
                    p_name: entries[i].as_ptr(),
                    ..Default::default()
                }
            })
            .collect();

        let general =
            |index: u32| vk::RayTracingShaderGroupCreateInfoKHR {
                ty: vk::RayTracingShaderGroupTypeKHR::GENERAL,
                general_shader: index,
                closest_hit_shader: vk::SHADER_UNUSED_KHR,
                any_hit_shader: vk::SHADER_UNUSED_KHR,
                intersection_shader: vk::SHADER_UNUSED_KHR,
                ..Default::default()
            };
        let mut groups = Vec::new();
        for index in desc.raygen.iter().chain(desc.miss.iter()) {
            groups.push(general(*index));
        }
        for (closest, any, intersection) in desc.hit_groups.iter() {
            groups.push(vk::RayTracingShaderGroupCreateInfoKHR {
                ty: if intersection.is_some() {
                    vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
                } else {
                    vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
                },
                general_shader: vk::SHADER_UNUSED_KHR,
                closest_hit_shader: closest.unwrap_or(vk::SHADER_UNUSED_KHR),
                any_hit_shader: any.unwrap_or(vk::SHADER_UNUSED_KHR),
                intersection_shader: intersection.unwrap_or(vk::SHADER_UNUSED_KHR),
                ..Default::default()
            });
        }
        for index in desc.callable.iter() {
            groups.push(general(*index));
        }

        let info = vk::RayTracingPipelineCreateInfoKHR::builder()
            .stages(&stage_infos)
            .groups(&groups)
            .max_pipeline_ray_recursion_depth(desc.max_recursion.max(1) as u32)
            .layout(self.shared.heap.pipeline_layout)
            .build();

        let result = rt_ext.create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[info],
            None,
        );
        for module in modules {
            self.shared.raw.destroy_shader_module(module, None);
        }
        let raw = result.map_err(map_err)?.remove(0);
        self.shared
            .set_name(vk::ObjectType::PIPELINE, vk::Handle::as_raw(raw), name);
        Ok(Pipeline { raw })
    }

    unsafe fn sbt_group_handles(&self, pipeline: &Pipeline, group_count: u32) -> Result<Vec<u8>> {
        let rt_ext = self
            .shared
            .rt_ext
            .as_ref()
            .ok_or(Error::UnsupportedOperation("raytracing is not enabled"))?;
        let size = group_count as usize * self.shared.sbt_handle_size as usize;
        rt_ext
            .get_ray_tracing_shader_group_handles(pipeline.raw, 0, group_count, size)
            .map_err(map_err)
    }

    unsafe fn destroy_pipeline(&self, pipeline: Pipeline) {
        self.shared.raw.destroy_pipeline(pipeline.raw, None);
    }

    unsafe fn rtas_build_sizes(&self, inputs: &RtasBuildInputs<Backend>) -> Result<RtasSizes> {
        let as_ext = self
            .shared
            .as_ext
            .as_ref()
            .ok_or(Error::UnsupportedOperation("raytracing is not enabled"))?;
        let (geometry, primitive_count) = self.build_geometry(inputs);
        let info = self.build_info(inputs, &geometry);
        let sizes = as_ext.get_acceleration_structure_build_sizes(
            vk::AccelerationStructureBuildTypeKHR::DEVICE,
            &info,
            &[primitive_count],
        );
        Ok(RtasSizes {
            structure: sizes.acceleration_structure_size,
            build_scratch: sizes.build_scratch_size,
            update_scratch: sizes.update_scratch_size,
        })
    }

    unsafe fn create_rtas(
        &self,
        buffer: &Buffer,
        offset: u64,
        size: u64,
        top_level: bool,
    ) -> Result<AccelerationStructure> {
        let as_ext = self
            .shared
            .as_ext
            .as_ref()
            .ok_or(Error::UnsupportedOperation("raytracing is not enabled"))?;
        let info = vk::AccelerationStructureCreateInfoKHR {
            buffer: buffer.raw,
            offset,
            size,
            ty: if top_level {
                vk::AccelerationStructureTypeKHR::TOP_LEVEL
            } else {
                vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL
            },
            ..Default::default()
        };
        let raw = as_ext
            .create_acceleration_structure(&info, None)
            .map_err(map_err)?;
        let address_info = vk::AccelerationStructureDeviceAddressInfoKHR {
            acceleration_structure: raw,
            ..Default::default()
        };
        let address = as_ext.get_acceleration_structure_device_address(&address_info);
        Ok(AccelerationStructure {
            raw,
            address: AtomicU64::new(address),
        })
    }

    unsafe fn rtas_address(&self, rtas: &AccelerationStructure) -> u64 {
        rtas.address.load(std::sync::atomic::Ordering::Acquire)
    }

    unsafe fn destroy_rtas(&self, rtas: AccelerationStructure) {
        if let Some(as_ext) = self.shared.as_ext.as_ref() {
            as_ext.destroy_acceleration_structure(rtas.raw, None);
        }
    }
}
