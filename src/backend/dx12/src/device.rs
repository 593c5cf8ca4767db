//! Logical device and the backend entry points.
//!
//! The memory-free path and the forced-flush descriptor rebind follow the
//! Vulkan backend's behavior rather than historic D3D sketches: frees are
//! unconditional and the shader-visible heaps are re-set on every command
//! buffer begin.
#![cfg(windows)]

use std::{
    mem,
    ops::Range,
    ptr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use winapi::{
    shared::{
        dxgi1_2, dxgi1_4, dxgi1_5, dxgiformat, dxgitype,
        minwindef::UINT,
        winerror::SUCCEEDED,
    },
    um::{d3d12, handleapi, synchapi, unknwnbase::IUnknown, winbase, winnt},
    Interface,
};
use wio::com::ComPtr;

use grx::{
    adapter::DeviceInfo,
    backend::{BackendDevice, DeviceFlags, SubmitDesc},
    buffer::BufferUsage,
    descriptor::{DescriptorType, ResourceHandle},
    error::{Error, Result},
    memory::Requirements,
    pipeline::{ComputePipelineDesc, GraphicsPipelineDesc, RaytracingPipelineDesc},
    resource::ResourceFlags,
    rtas::{RtasBuildInputs, RtasSizes},
    sampler::SamplerDesc,
    swapchain::{PresentMode, SurfaceCapabilities, SwapchainConfig},
    texture::{TextureDesc, TextureType, TextureUsage},
};

use grx::format::Format;

use crate::{
    check, command::CommandBuffer, conv, descriptors::DescriptorHeaps, hr_to_err,
    native::{
        AccelerationStructure, BoundBuffer, Buffer, CommandPool, Image, Memory, Pipeline, Sampler,
        Surface, Swapchain, SwapchainPtr,
    },
    Backend, RawInstance,
};

const PLACED_ALIGNMENT: u64 = d3d12::D3D12_DEFAULT_RESOURCE_PLACEMENT_ALIGNMENT as u64;

pub(crate) struct RawDevice {
    pub device: ComPtr<d3d12::ID3D12Device>,
    pub instance: Arc<RawInstance>,
    pub queue: ComPtr<d3d12::ID3D12CommandQueue>,
    pub fence: ComPtr<d3d12::ID3D12Fence>,
    pub idle_fence: ComPtr<d3d12::ID3D12Fence>,
    pub idle_value: AtomicU64,
    pub fence_event: winnt::HANDLE,
    pub heaps: DescriptorHeaps,
    pub root_signature: ComPtr<d3d12::ID3D12RootSignature>,
    pub draw_signature: ComPtr<d3d12::ID3D12CommandSignature>,
    pub draw_indexed_signature: ComPtr<d3d12::ID3D12CommandSignature>,
    pub dispatch_signature: ComPtr<d3d12::ID3D12CommandSignature>,
    pub frame_cbv: Mutex<[u64; 3]>,
    pub allow_tearing: bool,
}

unsafe impl Send for RawDevice {}
unsafe impl Sync for RawDevice {}

impl Drop for RawDevice {
    fn drop(&mut self) {
        unsafe {
            handleapi::CloseHandle(self.fence_event);
        }
    }
}

/// Direct3D 12 logical device.
pub struct Device {
    pub(crate) shared: Arc<RawDevice>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "D3D12Device")
    }
}

fn buffer_desc(size: u64, uav: bool) -> d3d12::D3D12_RESOURCE_DESC {
    d3d12::D3D12_RESOURCE_DESC {
        Dimension: d3d12::D3D12_RESOURCE_DIMENSION_BUFFER,
        Alignment: 0,
        Width: size,
        Height: 1,
        DepthOrArraySize: 1,
        MipLevels: 1,
        Format: dxgiformat::DXGI_FORMAT_UNKNOWN,
        SampleDesc: dxgitype::DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Layout: d3d12::D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
        Flags: if uav {
            d3d12::D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS
        } else {
            d3d12::D3D12_RESOURCE_FLAG_NONE
        },
    }
}

fn image_desc(desc: &TextureDesc) -> d3d12::D3D12_RESOURCE_DESC {
    let mut flags = d3d12::D3D12_RESOURCE_FLAG_NONE;
    if desc.usage.contains(TextureUsage::STORAGE) {
        flags |= d3d12::D3D12_RESOURCE_FLAG_ALLOW_UNORDERED_ACCESS;
    }
    if desc.usage.contains(TextureUsage::COLOR_ATTACHMENT) {
        flags |= d3d12::D3D12_RESOURCE_FLAG_ALLOW_RENDER_TARGET;
    }
    if desc.usage.contains(TextureUsage::DEPTH_ATTACHMENT) {
        flags |= d3d12::D3D12_RESOURCE_FLAG_ALLOW_DEPTH_STENCIL;
    }
    d3d12::D3D12_RESOURCE_DESC {
        Dimension: match desc.ty {
            TextureType::D3 => d3d12::D3D12_RESOURCE_DIMENSION_TEXTURE3D,
            _ => d3d12::D3D12_RESOURCE_DIMENSION_TEXTURE2D,
        },
        Alignment: 0,
        Width: desc.width as u64,
        Height: desc.height,
        DepthOrArraySize: desc.depth_or_layers as u16,
        MipLevels: desc.mips.max(1) as u16,
        Format: conv::map_format(desc.format),
        SampleDesc: dxgitype::DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Layout: d3d12::D3D12_TEXTURE_LAYOUT_UNKNOWN,
        Flags: flags,
    }
}

impl Device {
    pub(crate) fn open(
        instance: &Arc<RawInstance>,
        info: &DeviceInfo,
        _flags: DeviceFlags,
    ) -> Result<Device> {
        unsafe {
            let mut adapter: *mut winapi::shared::dxgi::IDXGIAdapter1 = ptr::null_mut();
            check(
                instance
                    .factory
                    .EnumAdapters1(info.physical_index as u32, &mut adapter),
            )?;
            let adapter = ComPtr::from_raw(adapter);

            let mut device: *mut d3d12::ID3D12Device = ptr::null_mut();
            check(d3d12::D3D12CreateDevice(
                adapter.as_raw() as *mut IUnknown,
                winapi::um::d3dcommon::D3D_FEATURE_LEVEL_12_0,
                &d3d12::ID3D12Device::uuidof(),
                &mut device as *mut _ as *mut _,
            ))?;
            let device = ComPtr::from_raw(device);

            let queue_desc = d3d12::D3D12_COMMAND_QUEUE_DESC {
                Type: d3d12::D3D12_COMMAND_LIST_TYPE_DIRECT,
                Priority: d3d12::D3D12_COMMAND_QUEUE_PRIORITY_NORMAL as i32,
                Flags: d3d12::D3D12_COMMAND_QUEUE_FLAG_NONE,
                NodeMask: 0,
            };
            let mut queue: *mut d3d12::ID3D12CommandQueue = ptr::null_mut();
            check(device.CreateCommandQueue(
                &queue_desc,
                &d3d12::ID3D12CommandQueue::uuidof(),
                &mut queue as *mut _ as *mut _,
            ))?;
            let queue = ComPtr::from_raw(queue);

            let mut fence: *mut d3d12::ID3D12Fence = ptr::null_mut();
            check(device.CreateFence(
                0,
                d3d12::D3D12_FENCE_FLAG_NONE,
                &d3d12::ID3D12Fence::uuidof(),
                &mut fence as *mut _ as *mut _,
            ))?;
            let fence = ComPtr::from_raw(fence);
            let mut idle_fence: *mut d3d12::ID3D12Fence = ptr::null_mut();
            check(device.CreateFence(
                0,
                d3d12::D3D12_FENCE_FLAG_NONE,
                &d3d12::ID3D12Fence::uuidof(),
                &mut idle_fence as *mut _ as *mut _,
            ))?;
            let idle_fence = ComPtr::from_raw(idle_fence);

            let fence_event =
                synchapi::CreateEventW(ptr::null_mut(), 0, 0, ptr::null());
            if fence_event.is_null() {
                return Err(Error::InvalidState("unable to create fence event"));
            }

            let heaps = DescriptorHeaps::new(&device)?;
            let root_signature = Self::create_root_signature(&device)?;

            let command_signature = |stride: u32,
                                     kind: u32|
             -> Result<ComPtr<d3d12::ID3D12CommandSignature>> {
                let argument = d3d12::D3D12_INDIRECT_ARGUMENT_DESC {
                    Type: kind,
                    ..mem::zeroed()
                };
                let desc = d3d12::D3D12_COMMAND_SIGNATURE_DESC {
                    ByteStride: stride,
                    NumArgumentDescs: 1,
                    pArgumentDescs: &argument,
                    NodeMask: 0,
                };
                let mut signature: *mut d3d12::ID3D12CommandSignature = ptr::null_mut();
                check(device.CreateCommandSignature(
                    &desc,
                    ptr::null_mut(),
                    &d3d12::ID3D12CommandSignature::uuidof(),
                    &mut signature as *mut _ as *mut _,
                ))?;
                Ok(ComPtr::from_raw(signature))
            };
            let draw_signature =
                command_signature(16, d3d12::D3D12_INDIRECT_ARGUMENT_TYPE_DRAW)?;
            let draw_indexed_signature =
                command_signature(20, d3d12::D3D12_INDIRECT_ARGUMENT_TYPE_DRAW_INDEXED)?;
            let dispatch_signature =
                command_signature(12, d3d12::D3D12_INDIRECT_ARGUMENT_TYPE_DISPATCH)?;

            Ok(Device {
                shared: Arc::new(RawDevice {
                    device,
                    instance: Arc::clone(instance),
                    queue,
                    fence,
                    idle_fence,
                    idle_value: AtomicU64::new(0),
                    fence_event,
                    heaps,
                    root_signature,
                    draw_signature,
                    draw_indexed_signature,
                    dispatch_signature,
                    frame_cbv: Mutex::new([0; 3]),
                    allow_tearing: instance.allow_tearing,
                }),
            })
        }
    }

    /// Root layout: one table over the resource heap with a range per
    /// descriptor type (register space = type tag), one sampler table, and
    /// a root CBV for the per-frame constants.
    fn create_root_signature(
        device: &ComPtr<d3d12::ID3D12Device>,
    ) -> Result<ComPtr<d3d12::ID3D12RootSignature>> {
        unsafe {
            let mut ranges = Vec::new();
            for ty in crate::descriptors::HEAP_TYPES.iter() {
                let is_uav = matches!(
                    ty,
                    DescriptorType::RWBuffer
                        | DescriptorType::RWTexture2D
                        | DescriptorType::RWTexture3D
                        | DescriptorType::RWTexture2Df
                        | DescriptorType::RWTexture2Di
                        | DescriptorType::RWTexture2Du
                        | DescriptorType::RWTexture3Df
                );
                ranges.push(d3d12::D3D12_DESCRIPTOR_RANGE {
                    RangeType: if is_uav {
                        d3d12::D3D12_DESCRIPTOR_RANGE_TYPE_UAV
                    } else {
                        d3d12::D3D12_DESCRIPTOR_RANGE_TYPE_SRV
                    },
                    NumDescriptors: ty.capacity(),
                    BaseShaderRegister: 0,
                    RegisterSpace: *ty as u32,
                    OffsetInDescriptorsFromTableStart:
                        d3d12::D3D12_DESCRIPTOR_RANGE_OFFSET_APPEND,
                });
            }
            let sampler_range = d3d12::D3D12_DESCRIPTOR_RANGE {
                RangeType: d3d12::D3D12_DESCRIPTOR_RANGE_TYPE_SAMPLER,
                NumDescriptors: DescriptorType::Sampler.capacity(),
                BaseShaderRegister: 0,
                RegisterSpace: 0,
                OffsetInDescriptorsFromTableStart: 0,
            };

            let mut params: [d3d12::D3D12_ROOT_PARAMETER; 3] = mem::zeroed();
            params[0].ParameterType = d3d12::D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE;
            params[0].ShaderVisibility = d3d12::D3D12_SHADER_VISIBILITY_ALL;
            *params[0].u.DescriptorTable_mut() = d3d12::D3D12_ROOT_DESCRIPTOR_TABLE {
                NumDescriptorRanges: ranges.len() as u32,
                pDescriptorRanges: ranges.as_ptr(),
            };
            params[1].ParameterType = d3d12::D3D12_ROOT_PARAMETER_TYPE_DESCRIPTOR_TABLE;
            params[1].ShaderVisibility = d3d12::D3D12_SHADER_VISIBILITY_ALL;
            *params[1].u.DescriptorTable_mut() = d3d12::D3D12_ROOT_DESCRIPTOR_TABLE {
                NumDescriptorRanges: 1,
                pDescriptorRanges: &sampler_range,
            };
            params[2].ParameterType = d3d12::D3D12_ROOT_PARAMETER_TYPE_CBV;
            params[2].ShaderVisibility = d3d12::D3D12_SHADER_VISIBILITY_ALL;
            *params[2].u.Descriptor_mut() = d3d12::D3D12_ROOT_DESCRIPTOR {
                ShaderRegister: 0,
                RegisterSpace: 0,
            };

            let desc = d3d12::D3D12_ROOT_SIGNATURE_DESC {
                NumParameters: params.len() as u32,
                pParameters: params.as_ptr(),
                NumStaticSamplers: 0,
                pStaticSamplers: ptr::null(),
                Flags: d3d12::D3D12_ROOT_SIGNATURE_FLAG_ALLOW_INPUT_ASSEMBLER_INPUT_LAYOUT,
            };

            let mut blob: *mut winapi::um::d3dcommon::ID3DBlob = ptr::null_mut();
            let mut error: *mut winapi::um::d3dcommon::ID3DBlob = ptr::null_mut();
            let hr = d3d12::D3D12SerializeRootSignature(
                &desc,
                d3d12::D3D_ROOT_SIGNATURE_VERSION_1,
                &mut blob,
                &mut error,
            );
            if !SUCCEEDED(hr) {
                if !error.is_null() {
                    (*error).Release();
                }
                return Err(hr_to_err(hr));
            }
            let blob = ComPtr::from_raw(blob);
            if !error.is_null() {
                (*error).Release();
            }

            let mut signature: *mut d3d12::ID3D12RootSignature = ptr::null_mut();
            check(device.CreateRootSignature(
                0,
                blob.GetBufferPointer(),
                blob.GetBufferSize(),
                &d3d12::ID3D12RootSignature::uuidof(),
                &mut signature as *mut _ as *mut _,
            ))?;
            Ok(ComPtr::from_raw(signature))
        }
    }

    fn wait_fence(&self, fence: &ComPtr<d3d12::ID3D12Fence>, value: u64) -> Result<()> {
        unsafe {
            if fence.GetCompletedValue() < value {
                check(fence.SetEventOnCompletion(value, self.shared.fence_event))?;
                synchapi::WaitForSingleObject(self.shared.fence_event, winbase::INFINITE);
            }
        }
        Ok(())
    }
}

impl BackendDevice<Backend> for Device {
    unsafe fn allocate_memory(&self, type_id: u32, size: u64, _name: &str) -> Result<Memory> {
        if type_id == 0 {
            let desc = d3d12::D3D12_HEAP_DESC {
                SizeInBytes: (size + PLACED_ALIGNMENT - 1) / PLACED_ALIGNMENT * PLACED_ALIGNMENT,
                Properties: d3d12::D3D12_HEAP_PROPERTIES {
                    Type: d3d12::D3D12_HEAP_TYPE_DEFAULT,
                    CPUPageProperty: d3d12::D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
                    MemoryPoolPreference: d3d12::D3D12_MEMORY_POOL_UNKNOWN,
                    CreationNodeMask: 0,
                    VisibleNodeMask: 0,
                },
                Alignment: PLACED_ALIGNMENT,
                Flags: d3d12::D3D12_HEAP_FLAG_ALLOW_ALL_BUFFERS_AND_TEXTURES,
            };
            let mut heap: *mut d3d12::ID3D12Heap = ptr::null_mut();
            check(self.shared.device.CreateHeap(
                &desc,
                &d3d12::ID3D12Heap::uuidof(),
                &mut heap as *mut _ as *mut _,
            ))?;
            Ok(Memory::Heap {
                raw: ComPtr::from_raw(heap),
                size,
            })
        } else {
            // Host-visible blocks are one big persistently mapped upload
            // buffer; buffers bound to them become address slices.
            let heap_type = if type_id == 2 {
                d3d12::D3D12_HEAP_TYPE_READBACK
            } else {
                d3d12::D3D12_HEAP_TYPE_UPLOAD
            };
            let properties = d3d12::D3D12_HEAP_PROPERTIES {
                Type: heap_type,
                CPUPageProperty: d3d12::D3D12_CPU_PAGE_PROPERTY_UNKNOWN,
                MemoryPoolPreference: d3d12::D3D12_MEMORY_POOL_UNKNOWN,
                CreationNodeMask: 0,
                VisibleNodeMask: 0,
            };
            let desc = buffer_desc(size, false);
            let state = if type_id == 2 {
                d3d12::D3D12_RESOURCE_STATE_COPY_DEST
            } else {
                d3d12::D3D12_RESOURCE_STATE_GENERIC_READ
            };
            let mut resource: *mut d3d12::ID3D12Resource = ptr::null_mut();
            check(self.shared.device.CreateCommittedResource(
                &properties,
                d3d12::D3D12_HEAP_FLAG_NONE,
                &desc,
                state,
                ptr::null(),
                &d3d12::ID3D12Resource::uuidof(),
                &mut resource as *mut _ as *mut _,
            ))?;
            Ok(Memory::Upload {
                resource: ComPtr::from_raw(resource),
                size,
            })
        }
    }

    unsafe fn free_memory(&self, memory: Memory) {
        drop(memory);
    }

    unsafe fn map_memory(&self, memory: &Memory) -> Result<*mut u8> {
        match memory {
            Memory::Upload { resource, .. } => {
                let mut ptr_out: *mut std::ffi::c_void = ptr::null_mut();
                check(resource.Map(0, ptr::null(), &mut ptr_out))?;
                Ok(ptr_out as *mut u8)
            }
            Memory::Heap { .. } => Err(Error::InvalidOperation(
                "device-local heaps are not mappable",
            )),
        }
    }

    unsafe fn flush_mapped(&self, _memory: &Memory, _ranges: &[Range<u64>]) -> Result<()> {
        // Upload heaps are write-combined and coherent.
        Ok(())
    }

    fn memory_budget(&self, _device_local: bool) -> Option<u64> {
        None
    }

    unsafe fn create_buffer(
        &self,
        size: u64,
        _usage: BufferUsage,
        _flags: ResourceFlags,
        _name: &str,
    ) -> Result<Buffer> {
        Ok(Buffer {
            size,
            bound: Mutex::new(None),
            va: AtomicU64::new(0),
        })
    }

    unsafe fn buffer_requirements(&self, buffer: &Buffer) -> Requirements {
        Requirements {
            size: buffer.size,
            alignment: PLACED_ALIGNMENT,
            type_mask: 0b111,
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
        match memory {
            Memory::Heap { raw, .. } => {
                let desc = buffer_desc(buffer.size, true);
                let mut resource: *mut d3d12::ID3D12Resource = ptr::null_mut();
                check(self.shared.device.CreatePlacedResource(
                    raw.as_raw(),
                    offset,
                    &desc,
                    d3d12::D3D12_RESOURCE_STATE_COMMON,
                    ptr::null(),
                    &d3d12::ID3D12Resource::uuidof(),
                    &mut resource as *mut _ as *mut _,
                ))?;
                let resource = ComPtr::from_raw(resource);
                buffer
                    .va
                    .store(resource.GetGPUVirtualAddress(), Ordering::Release);
                *buffer.bound.lock() = Some(BoundBuffer {
                    resource,
                    offset: 0,
                    upload: false,
                });
            }
            Memory::Upload { resource, .. } => {
                buffer.va.store(
                    resource.GetGPUVirtualAddress() + offset,
                    Ordering::Release,
                );
                *buffer.bound.lock() = Some(BoundBuffer {
                    resource: resource.clone(),
                    offset,
                    upload: true,
                });
            }
        }
        Ok(())
    }

    unsafe fn buffer_address(&self, buffer: &Buffer) -> u64 {
        buffer.va.load(Ordering::Acquire)
    }

    unsafe fn destroy_buffer(&self, buffer: Buffer) {
        drop(buffer);
    }

    unsafe fn create_image(&self, desc: &TextureDesc, _name: &str) -> Result<Image> {
        Ok(Image {
            resource: Mutex::new(None),
            desc: Some(*desc),
            rtv: AtomicU64::new(0),
            dsv: AtomicU64::new(0),
        })
    }

    unsafe fn image_requirements(&self, image: &Image) -> Requirements {
        let desc = image_desc(image.desc.as_ref().expect("image without desc"));
        let info = self
            .shared
            .device
            .GetResourceAllocationInfo(0, 1, &desc);
        Requirements {
            size: info.SizeInBytes,
            alignment: info.Alignment.max(PLACED_ALIGNMENT),
            type_mask: 0b001,
            prefers_dedicated: false,
            requires_dedicated: false,
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: &Image,
        desc: &TextureDesc,
        memory: &Memory,
        offset: u64,
    ) -> Result<()> {
        let heap = match memory {
            Memory::Heap { raw, .. } => raw,
            Memory::Upload { .. } => {
                return Err(Error::InvalidOperation(
                    "images require device-local memory",
                ))
            }
        };
        let resource_desc = image_desc(desc);
        let mut resource: *mut d3d12::ID3D12Resource = ptr::null_mut();
        check(self.shared.device.CreatePlacedResource(
            heap.as_raw(),
            offset,
            &resource_desc,
            d3d12::D3D12_RESOURCE_STATE_COMMON,
            ptr::null(),
            &d3d12::ID3D12Resource::uuidof(),
            &mut resource as *mut _ as *mut _,
        ))?;
        let resource = ComPtr::from_raw(resource);

        if desc.usage.contains(TextureUsage::COLOR_ATTACHMENT) {
            let rtv = self.shared.heaps.allocate_rtv();
            self.shared
                .device
                .CreateRenderTargetView(resource.as_raw(), ptr::null(), rtv);
            image.rtv.store(rtv.ptr as u64, Ordering::Release);
        }
        if desc.usage.contains(TextureUsage::DEPTH_ATTACHMENT) {
            let dsv = self.shared.heaps.allocate_dsv();
            self.shared
                .device
                .CreateDepthStencilView(resource.as_raw(), ptr::null(), dsv);
            image.dsv.store(dsv.ptr as u64, Ordering::Release);
        }

        *image.resource.lock() = Some(resource);
        Ok(())
    }

    unsafe fn destroy_image(&self, image: Image) {
        drop(image);
    }

    unsafe fn create_sampler(&self, desc: &SamplerDesc, _name: &str) -> Result<Sampler> {
        let raw = d3d12::D3D12_SAMPLER_DESC {
            Filter: conv::map_filter(
                desc.min,
                desc.mag,
                desc.mip,
                desc.max_anisotropy > 0,
                desc.compare.is_some(),
            ),
            AddressU: conv::map_address_mode(desc.address_u),
            AddressV: conv::map_address_mode(desc.address_v),
            AddressW: conv::map_address_mode(desc.address_w),
            MipLODBias: 0.0,
            MaxAnisotropy: desc.max_anisotropy.max(1) as UINT,
            ComparisonFunc: desc
                .compare
                .map(conv::map_compare_op)
                .unwrap_or(d3d12::D3D12_COMPARISON_FUNC_ALWAYS),
            BorderColor: conv::map_border_color(desc.border),
            MinLOD: desc.min_lod,
            MaxLOD: desc.max_lod,
        };
        Ok(Sampler { desc: raw })
    }

    unsafe fn destroy_sampler(&self, _sampler: Sampler) {}

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
        let resource = buffer.resource();
        let base = buffer.offset() + offset;
        let cpu = self.shared.heaps.resource_cpu(handle);
        if ty == DescriptorType::RWBuffer {
            let mut desc: d3d12::D3D12_UNORDERED_ACCESS_VIEW_DESC = mem::zeroed();
            desc.Format = dxgiformat::DXGI_FORMAT_R32_TYPELESS;
            desc.ViewDimension = d3d12::D3D12_UAV_DIMENSION_BUFFER;
            *desc.u.Buffer_mut() = d3d12::D3D12_BUFFER_UAV {
                FirstElement: base / 4,
                NumElements: (size / 4) as u32,
                StructureByteStride: 0,
                CounterOffsetInBytes: 0,
                Flags: d3d12::D3D12_BUFFER_UAV_FLAG_RAW,
            };
            self.shared.device.CreateUnorderedAccessView(
                resource.as_raw(),
                ptr::null_mut(),
                &desc,
                cpu,
            );
        } else {
            let mut desc: d3d12::D3D12_SHADER_RESOURCE_VIEW_DESC = mem::zeroed();
            desc.Format = dxgiformat::DXGI_FORMAT_R32_TYPELESS;
            desc.ViewDimension = d3d12::D3D12_SRV_DIMENSION_BUFFER;
            desc.Shader4ComponentMapping = d3d12::D3D12_DEFAULT_SHADER_4_COMPONENT_MAPPING;
            *desc.u.Buffer_mut() = d3d12::D3D12_BUFFER_SRV {
                FirstElement: base / 4,
                NumElements: (size / 4) as u32,
                StructureByteStride: 0,
                Flags: d3d12::D3D12_BUFFER_SRV_FLAG_RAW,
            };
            self.shared
                .device
                .CreateShaderResourceView(resource.as_raw(), &desc, cpu);
        }
    }

    unsafe fn write_image_descriptor(&self, handle: ResourceHandle, image: &Image) {
        let ty = match handle.ty() {
            Some(ty) => ty,
            None => return,
        };
        let resource = image.resource();
        let cpu = self.shared.heaps.resource_cpu(handle);
        let storage = !matches!(
            ty,
            DescriptorType::Texture2D | DescriptorType::TextureCube | DescriptorType::Texture3D
        );
        if storage {
            self.shared.device.CreateUnorderedAccessView(
                resource.as_raw(),
                ptr::null_mut(),
                ptr::null(),
                cpu,
            );
        } else {
            self.shared
                .device
                .CreateShaderResourceView(resource.as_raw(), ptr::null(), cpu);
        }
    }

    unsafe fn write_sampler_descriptor(&self, handle: ResourceHandle, sampler: &Sampler) {
        let cpu = self.shared.heaps.sampler_cpu(handle);
        self.shared.device.CreateSampler(&sampler.desc, cpu);
    }

    unsafe fn write_tlas_descriptor(
        &self,
        _handle: ResourceHandle,
        tlas: &AccelerationStructure,
    ) {
        match *tlas {}
    }

    unsafe fn init_frame_uniforms(&self, buffers: [&Buffer; 3], _size: u64) -> Result<()> {
        let mut cbv = self.shared.frame_cbv.lock();
        for (slot, buffer) in buffers.iter().enumerate() {
            cbv[slot] = buffer.va.load(Ordering::Acquire);
        }
        Ok(())
    }

    fn surface_capabilities(&self, _surface: &Surface) -> Result<SurfaceCapabilities> {
        let mut present_modes = vec![PresentMode::Fifo, PresentMode::Mailbox];
        if self.shared.allow_tearing {
            present_modes.push(PresentMode::Immediate);
        }
        Ok(SurfaceCapabilities {
            formats: vec![
                Format::Bgra8Unorm,
                Format::Rgba8Unorm,
                Format::Bgr10A2Unorm,
                Format::Rgba16Float,
            ],
            present_modes,
            // Writable swapchain images are rejected on this backend.
            supports_storage: false,
            current_extent: None,
        })
    }

    unsafe fn create_swapchain(
        &self,
        surface: &Surface,
        config: &SwapchainConfig,
        old: Option<Swapchain>,
    ) -> Result<(Swapchain, Vec<Image>)> {
        let tearing = self.shared.allow_tearing;
        let flags = if tearing {
            dxgi1_5::DXGI_SWAP_CHAIN_FLAG_ALLOW_TEARING
        } else {
            0
        };

        let swapchain = match old {
            Some(old) => {
                // Hand the existing swapchain over to the new size.
                check(old.raw.0.ResizeBuffers(
                    config.image_count,
                    config.extent.0,
                    config.extent.1,
                    conv::map_format(config.format),
                    flags,
                ))?;
                old
            }
            None => {
                let desc = dxgi1_2::DXGI_SWAP_CHAIN_DESC1 {
                    Width: config.extent.0,
                    Height: config.extent.1,
                    Format: conv::map_format(config.format),
                    Stereo: 0,
                    SampleDesc: dxgitype::DXGI_SAMPLE_DESC {
                        Count: 1,
                        Quality: 0,
                    },
                    BufferUsage: dxgitype::DXGI_USAGE_RENDER_TARGET_OUTPUT
                        | dxgitype::DXGI_USAGE_SHADER_INPUT,
                    BufferCount: config.image_count,
                    Scaling: dxgi1_2::DXGI_SCALING_STRETCH,
                    SwapEffect: dxgi1_2::DXGI_SWAP_EFFECT_FLIP_DISCARD,
                    AlphaMode: dxgi1_2::DXGI_ALPHA_MODE_IGNORE,
                    Flags: flags,
                };
                let mut swapchain1: *mut dxgi1_2::IDXGISwapChain1 = ptr::null_mut();
                check(self.shared.instance.factory.CreateSwapChainForHwnd(
                    self.shared.queue.as_raw() as *mut IUnknown,
                    surface.hwnd,
                    &desc,
                    ptr::null(),
                    ptr::null_mut(),
                    &mut swapchain1,
                ))?;
                let swapchain1 = ComPtr::from_raw(swapchain1);
                let swapchain3 = swapchain1
                    .cast::<dxgi1_4::IDXGISwapChain3>()
                    .map_err(hr_to_err)?;
                Swapchain {
                    raw: SwapchainPtr(swapchain3),
                    image_count: config.image_count,
                    flags,
                    current: std::sync::atomic::AtomicU32::new(0),
                }
            }
        };

        let mut images = Vec::with_capacity(config.image_count as usize);
        for i in 0..config.image_count {
            let mut resource: *mut d3d12::ID3D12Resource = ptr::null_mut();
            check(swapchain.raw.0.GetBuffer(
                i,
                &d3d12::ID3D12Resource::uuidof(),
                &mut resource as *mut _ as *mut _,
            ))?;
            let resource = ComPtr::from_raw(resource);
            let rtv = self.shared.heaps.allocate_rtv();
            self.shared
                .device
                .CreateRenderTargetView(resource.as_raw(), ptr::null(), rtv);
            let image = Image {
                resource: Mutex::new(Some(resource)),
                desc: None,
                rtv: AtomicU64::new(rtv.ptr as u64),
                dsv: AtomicU64::new(0),
            };
            images.push(image);
        }

        Ok((swapchain, images))
    }

    unsafe fn destroy_swapchain(&self, swapchain: Swapchain) {
        drop(swapchain);
    }

    unsafe fn acquire_image(&self, swapchain: &Swapchain, _frame_slot: usize) -> Result<u32> {
        let index = swapchain.raw.0.GetCurrentBackBufferIndex();
        swapchain.current.store(index, Ordering::Release);
        Ok(index)
    }

    unsafe fn present(
        &self,
        swapchains: &[(&Swapchain, u32)],
        _frame_slot: usize,
        tearing: bool,
    ) -> Result<()> {
        for (swapchain, _) in swapchains {
            let (interval, flags) = if tearing && self.shared.allow_tearing {
                (0, dxgitype::DXGI_PRESENT_ALLOW_TEARING)
            } else {
                (1, 0)
            };
            check(swapchain.raw.0.Present(interval, flags))?;
        }
        Ok(())
    }

    unsafe fn create_command_pool(&self, _name: &str) -> Result<CommandPool> {
        let mut allocator: *mut d3d12::ID3D12CommandAllocator = ptr::null_mut();
        check(self.shared.device.CreateCommandAllocator(
            d3d12::D3D12_COMMAND_LIST_TYPE_DIRECT,
            &d3d12::ID3D12CommandAllocator::uuidof(),
            &mut allocator as *mut _ as *mut _,
        ))?;
        Ok(CommandPool {
            raw: ComPtr::from_raw(allocator),
        })
    }

    unsafe fn destroy_command_pool(&self, pool: CommandPool) {
        drop(pool);
    }

    unsafe fn reset_command_pool(&self, pool: &mut CommandPool) -> Result<()> {
        check(pool.raw.Reset())
    }

    unsafe fn allocate_command_buffer(&self, pool: &mut CommandPool) -> Result<CommandBuffer> {
        let mut list: *mut d3d12::ID3D12GraphicsCommandList = ptr::null_mut();
        check(self.shared.device.CreateCommandList(
            0,
            d3d12::D3D12_COMMAND_LIST_TYPE_DIRECT,
            pool.raw.as_raw(),
            ptr::null_mut(),
            &d3d12::ID3D12GraphicsCommandList::uuidof(),
            &mut list as *mut _ as *mut _,
        ))?;
        let list = ComPtr::from_raw(list);
        // Lists are created open; begin() re-opens against the allocator.
        check(list.Close())?;
        Ok(CommandBuffer {
            list,
            allocator: pool.raw.clone(),
            shared: Arc::clone(&self.shared),
            strides: parking_lot::Mutex::new([0; 8]),
        })
    }

    unsafe fn begin_command_buffer(&self, cmd: &mut CommandBuffer) -> Result<()> {
        check(cmd.list.Reset(cmd.allocator.as_raw(), ptr::null_mut()))?;
        cmd.set_heaps_and_roots();
        Ok(())
    }

    unsafe fn end_command_buffer(&self, cmd: &mut CommandBuffer) -> Result<()> {
        check(cmd.list.Close())
    }

    unsafe fn submit(&self, cmd: Option<&CommandBuffer>, desc: &SubmitDesc<Backend>) -> Result<()> {
        if let Some(value) = desc.wait_value {
            check(self.shared.queue.Wait(self.shared.fence.as_raw(), value))?;
        }
        if let Some(cmd) = cmd {
            let lists = [cmd.list.as_raw() as *mut d3d12::ID3D12CommandList];
            self.shared.queue.ExecuteCommandLists(1, lists.as_ptr());
        }
        if let Some(value) = desc.signal_value {
            check(self.shared.queue.Signal(self.shared.fence.as_raw(), value))?;
        }
        Ok(())
    }

    unsafe fn wait_timeline(&self, value: u64) -> Result<()> {
        self.wait_fence(&self.shared.fence, value)
    }

    unsafe fn wait_idle(&self) -> Result<()> {
        let value = self.shared.idle_value.fetch_add(1, Ordering::AcqRel) + 1;
        check(
            self.shared
                .queue
                .Signal(self.shared.idle_fence.as_raw(), value),
        )?;
        self.wait_fence(&self.shared.idle_fence, value)
    }

    unsafe fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
        _name: &str,
    ) -> Result<Pipeline> {
        let pso_desc = d3d12::D3D12_COMPUTE_PIPELINE_STATE_DESC {
            pRootSignature: self.shared.root_signature.as_raw(),
            CS: d3d12::D3D12_SHADER_BYTECODE {
                pShaderBytecode: desc.shader.binary.as_ptr() as *const _,
                BytecodeLength: desc.shader.binary.len(),
            },
            NodeMask: 0,
            CachedPSO: mem::zeroed(),
            Flags: d3d12::D3D12_PIPELINE_STATE_FLAG_NONE,
        };
        let mut pso: *mut d3d12::ID3D12PipelineState = ptr::null_mut();
        check(self.shared.device.CreateComputePipelineState(
            &pso_desc,
            &d3d12::ID3D12PipelineState::uuidof(),
            &mut pso as *mut _ as *mut _,
        ))?;
        Ok(Pipeline {
            raw: ComPtr::from_raw(pso),
            topology: 0,
            vertex_strides: [0; 8],
        })
    }

    unsafe fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        _name: &str,
    ) -> Result<Pipeline> {
        const SEMANTIC: &[u8] = b"ATTRIBUTE\0";
        let elements: Vec<d3d12::D3D12_INPUT_ELEMENT_DESC> = desc
            .attributes
            .iter()
            .map(|attribute| d3d12::D3D12_INPUT_ELEMENT_DESC {
                SemanticName: SEMANTIC.as_ptr() as *const i8,
                SemanticIndex: attribute.location,
                Format: conv::map_format(attribute.format),
                InputSlot: attribute.binding,
                AlignedByteOffset: attribute.offset,
                InputSlotClass: if desc
                    .bindings
                    .iter()
                    .find(|b| b.binding == attribute.binding)
                    .map(|b| b.per_instance)
                    .unwrap_or(false)
                {
                    d3d12::D3D12_INPUT_CLASSIFICATION_PER_INSTANCE_DATA
                } else {
                    d3d12::D3D12_INPUT_CLASSIFICATION_PER_VERTEX_DATA
                },
                InstanceDataStepRate: 0,
            })
            .collect();

        let mut blend: d3d12::D3D12_BLEND_DESC = mem::zeroed();
        for target in blend.RenderTarget.iter_mut() {
            *target = conv::map_blend(desc.blend);
        }

        let mut pso_desc: d3d12::D3D12_GRAPHICS_PIPELINE_STATE_DESC = mem::zeroed();
        pso_desc.pRootSignature = self.shared.root_signature.as_raw();
        pso_desc.VS = d3d12::D3D12_SHADER_BYTECODE {
            pShaderBytecode: desc.vertex.binary.as_ptr() as *const _,
            BytecodeLength: desc.vertex.binary.len(),
        };
        if let Some(fragment) = &desc.fragment {
            pso_desc.PS = d3d12::D3D12_SHADER_BYTECODE {
                pShaderBytecode: fragment.binary.as_ptr() as *const _,
                BytecodeLength: fragment.binary.len(),
            };
        }
        pso_desc.BlendState = blend;
        pso_desc.SampleMask = !0;
        pso_desc.RasterizerState = d3d12::D3D12_RASTERIZER_DESC {
            FillMode: d3d12::D3D12_FILL_MODE_SOLID,
            CullMode: conv::map_cull_mode(desc.cull),
            FrontCounterClockwise: 1,
            DepthBias: 0,
            DepthBiasClamp: 0.0,
            SlopeScaledDepthBias: 0.0,
            DepthClipEnable: 1,
            MultisampleEnable: (desc.samples > 1) as i32,
            AntialiasedLineEnable: 0,
            ForcedSampleCount: 0,
            ConservativeRaster: d3d12::D3D12_CONSERVATIVE_RASTERIZATION_MODE_OFF,
        };
        pso_desc.DepthStencilState = d3d12::D3D12_DEPTH_STENCIL_DESC {
            DepthEnable: desc.depth.test as i32,
            DepthWriteMask: if desc.depth.write {
                d3d12::D3D12_DEPTH_WRITE_MASK_ALL
            } else {
                d3d12::D3D12_DEPTH_WRITE_MASK_ZERO
            },
            DepthFunc: conv::map_compare_op(desc.depth.compare),
            ..mem::zeroed()
        };
        pso_desc.InputLayout = d3d12::D3D12_INPUT_LAYOUT_DESC {
            pInputElementDescs: elements.as_ptr(),
            NumElements: elements.len() as u32,
        };
        pso_desc.PrimitiveTopologyType = conv::map_topology_type(desc.topology);
        pso_desc.NumRenderTargets = desc.color_formats.len() as u32;
        for (i, format) in desc.color_formats.iter().enumerate() {
            pso_desc.RTVFormats[i] = conv::map_format(*format);
        }
        pso_desc.DSVFormat = desc
            .depth_format
            .map(conv::map_format)
            .unwrap_or(dxgiformat::DXGI_FORMAT_UNKNOWN);
        pso_desc.SampleDesc = dxgitype::DXGI_SAMPLE_DESC {
            Count: desc.samples.max(1) as u32,
            Quality: 0,
        };

        let mut pso: *mut d3d12::ID3D12PipelineState = ptr::null_mut();
        check(self.shared.device.CreateGraphicsPipelineState(
            &pso_desc,
            &d3d12::ID3D12PipelineState::uuidof(),
            &mut pso as *mut _ as *mut _,
        ))?;

        let mut vertex_strides = [0u32; 8];
        for binding in desc.bindings.iter() {
            if (binding.binding as usize) < vertex_strides.len() {
                vertex_strides[binding.binding as usize] = binding.stride;
            }
        }

        Ok(Pipeline {
            raw: ComPtr::from_raw(pso),
            topology: conv::map_topology(desc.topology),
            vertex_strides,
        })
    }

    unsafe fn create_raytracing_pipeline(
        &self,
        _desc: &RaytracingPipelineDesc,
        _name: &str,
    ) -> Result<Pipeline> {
        Err(Error::UnsupportedOperation(
            "raytracing pipelines are not supported by the d3d12 backend",
        ))
    }

    unsafe fn sbt_group_handles(&self, _pipeline: &Pipeline, _group_count: u32) -> Result<Vec<u8>> {
        Err(Error::UnsupportedOperation(
            "shader binding tables are not supported by the d3d12 backend",
        ))
    }

    unsafe fn destroy_pipeline(&self, pipeline: Pipeline) {
        drop(pipeline);
    }

    unsafe fn rtas_build_sizes(&self, _inputs: &RtasBuildInputs<Backend>) -> Result<RtasSizes> {
        Err(Error::UnsupportedOperation(
            "acceleration structures are not supported by the d3d12 backend",
        ))
    }

    unsafe fn create_rtas(
        &self,
        _buffer: &Buffer,
        _offset: u64,
        _size: u64,
        _top_level: bool,
    ) -> Result<AccelerationStructure> {
        Err(Error::UnsupportedOperation(
            "acceleration structures are not supported by the d3d12 backend",
        ))
    }

    unsafe fn rtas_address(&self, rtas: &AccelerationStructure) -> u64 {
        match *rtas {}
    }

    unsafe fn destroy_rtas(&self, rtas: AccelerationStructure) {
        match rtas {}
    }
}
