//! Direct3D 12 backend for the grx runtime.
//!
//! One direct queue, an `ID3D12Fence` as the frame timeline, and a single
//! shader-visible descriptor heap carved into fixed per-type ranges for the
//! bindless model. Windows only; on other targets the crate compiles to
//! nothing.
#![cfg(windows)]

#[macro_use]
extern crate log;

use std::{mem, ptr, sync::Arc};

use winapi::{
    shared::{
        dxgi, dxgi1_2, dxgi1_3, dxgi1_4, dxgi1_5,
        guiddef::GUID,
        minwindef::TRUE,
        winerror::{self, SUCCEEDED},
    },
    um::{d3d12, d3d12sdklayers, d3dcommon, unknwnbase::IUnknown},
    Interface,
};
use wio::com::ComPtr;

use grx::{
    adapter::{Capabilities, DeviceInfo, DeviceType, Limits},
    backend::{BackendInstance, DeviceFlags, WindowHandle},
    error::{Error, Result},
    memory::{MemoryFlags, MemoryProperties, MemoryType},
};

mod command;
mod conv;
mod descriptors;
mod device;
mod native;

pub use crate::command::CommandBuffer;
pub use crate::device::Device;
pub use crate::native::{
    AccelerationStructure, Buffer, CommandPool, Image, Memory, Pipeline, Sampler, Surface,
    Swapchain,
};

/// The Direct3D 12 backend selector.
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

pub(crate) fn hr_to_err(hr: winapi::um::winnt::HRESULT) -> Error {
    match hr {
        winerror::E_OUTOFMEMORY => Error::OutOfMemory("out of memory"),
        winerror::DXGI_ERROR_DEVICE_REMOVED | winerror::DXGI_ERROR_DEVICE_RESET => {
            Error::InvalidState("device lost")
        }
        winerror::E_INVALIDARG => Error::InvalidParameter("invalid argument"),
        winerror::DXGI_ERROR_UNSUPPORTED => Error::UnsupportedOperation("unsupported"),
        _ => Error::InvalidState("unexpected d3d12 error"),
    }
}

pub(crate) fn check(hr: winapi::um::winnt::HRESULT) -> Result<()> {
    if SUCCEEDED(hr) {
        Ok(())
    } else {
        Err(hr_to_err(hr))
    }
}

pub(crate) struct RawInstance {
    pub factory: ComPtr<dxgi1_4::IDXGIFactory4>,
    pub allow_tearing: bool,
    pub flags: DeviceFlags,
}

unsafe impl Send for RawInstance {}
unsafe impl Sync for RawInstance {}

/// DXGI factory plus the debug layer state.
pub struct Instance {
    pub(crate) raw: Arc<RawInstance>,
}

impl BackendInstance<Backend> for Instance {
    fn create(_app_name: &str, _app_version: u32, flags: DeviceFlags) -> Result<Self> {
        unsafe {
            if flags.contains(DeviceFlags::DEBUG) {
                let mut debug: *mut d3d12sdklayers::ID3D12Debug = ptr::null_mut();
                let hr = d3d12::D3D12GetDebugInterface(
                    &d3d12sdklayers::ID3D12Debug::uuidof(),
                    &mut debug as *mut _ as *mut _,
                );
                if SUCCEEDED(hr) {
                    (*debug).EnableDebugLayer();
                    (*debug).Release();
                } else {
                    warn!("d3d12 debug layer requested but unavailable");
                }
            }

            let factory_flags = if flags.contains(DeviceFlags::DEBUG) {
                dxgi1_3::DXGI_CREATE_FACTORY_DEBUG
            } else {
                0
            };
            let mut factory: *mut dxgi1_4::IDXGIFactory4 = ptr::null_mut();
            check(dxgi1_3::CreateDXGIFactory2(
                factory_flags,
                &dxgi1_4::IDXGIFactory4::uuidof(),
                &mut factory as *mut _ as *mut _,
            ))?;
            let factory = ComPtr::from_raw(factory);

            // Tearing support gates the Immediate present path.
            let mut allow_tearing = 0i32;
            if let Ok(factory5) = factory.cast::<dxgi1_5::IDXGIFactory5>() {
                let hr = factory5.CheckFeatureSupport(
                    dxgi1_5::DXGI_FEATURE_PRESENT_ALLOW_TEARING,
                    &mut allow_tearing as *mut _ as *mut _,
                    mem::size_of::<i32>() as u32,
                );
                if !SUCCEEDED(hr) {
                    allow_tearing = 0;
                }
            }

            Ok(Instance {
                raw: Arc::new(RawInstance {
                    factory,
                    allow_tearing: allow_tearing == TRUE,
                    flags,
                }),
            })
        }
    }

    fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        let mut infos = Vec::new();
        unsafe {
            let mut index = 0;
            loop {
                let mut adapter: *mut dxgi::IDXGIAdapter1 = ptr::null_mut();
                if self.raw.factory.EnumAdapters1(index, &mut adapter)
                    == winerror::DXGI_ERROR_NOT_FOUND
                {
                    break;
                }
                let adapter = ComPtr::from_raw(adapter);
                let mut desc: dxgi::DXGI_ADAPTER_DESC1 = mem::zeroed();
                adapter.GetDesc1(&mut desc);

                // Probe for feature level 12 support without keeping the
                // device around.
                let mut probe: *mut d3d12::ID3D12Device = ptr::null_mut();
                let hr = d3d12::D3D12CreateDevice(
                    adapter.as_raw() as *mut IUnknown,
                    d3dcommon::D3D_FEATURE_LEVEL_12_0,
                    &d3d12::ID3D12Device::uuidof(),
                    &mut probe as *mut _ as *mut _,
                );
                if !SUCCEEDED(hr) {
                    index += 1;
                    continue;
                }
                (*probe).Release();

                let software = desc.Flags & dxgi::DXGI_ADAPTER_FLAG_SOFTWARE != 0;
                let name_len = desc
                    .Description
                    .iter()
                    .position(|&c| c == 0)
                    .unwrap_or(desc.Description.len());
                let name = String::from_utf16_lossy(&desc.Description[..name_len]);

                let dedicated = desc.DedicatedVideoMemory as u64;
                let shared = desc.SharedSystemMemory as u64;

                infos.push(DeviceInfo {
                    name,
                    vendor: desc.VendorId,
                    device: desc.DeviceId,
                    device_type: if software {
                        DeviceType::Cpu
                    } else if dedicated > 512 << 20 {
                        DeviceType::DiscreteGpu
                    } else {
                        DeviceType::IntegratedGpu
                    },
                    // Raytracing needs interfaces this backend does not
                    // carry; the Vulkan backend is the RT reference.
                    capabilities: Capabilities::DEVICE_ADDRESS
                        | Capabilities::INDIRECT_COUNT
                        | Capabilities::TESSELLATION
                        | Capabilities::GEOMETRY_SHADER,
                    limits: Limits {
                        max_allocation_size: 256 << 20,
                        dedicated_memory: dedicated,
                        shared_memory: shared,
                        non_coherent_atom_size: 1,
                        buffer_copy_offset_alignment: 512,
                        buffer_copy_pitch_alignment: 256,
                        uniform_buffer_offset_alignment: 256,
                        buffer_image_granularity: 65536,
                        max_texture_size: 16384,
                    },
                    memory: MemoryProperties {
                        heaps: vec![dedicated.max(1), shared.max(1)],
                        types: vec![
                            MemoryType {
                                flags: MemoryFlags::DEVICE_LOCAL,
                                heap_index: 0,
                            },
                            MemoryType {
                                flags: MemoryFlags::HOST_VISIBLE | MemoryFlags::COHERENT,
                                heap_index: 1,
                            },
                            MemoryType {
                                flags: MemoryFlags::HOST_VISIBLE
                                    | MemoryFlags::COHERENT
                                    | MemoryFlags::CPU_CACHED,
                                heap_index: 1,
                            },
                        ],
                    },
                    physical_index: index as usize,
                });
                index += 1;
            }
        }
        if infos.is_empty() {
            return Err(Error::NotFound("no compatible d3d12 adapter"));
        }
        Ok(infos)
    }

    fn create_surface(&self, window: &WindowHandle) -> Result<native::Surface> {
        match window.raw {
            raw_window_handle::RawWindowHandle::Windows(handle) => Ok(native::Surface {
                hwnd: handle.hwnd,
            }),
            _ => Err(Error::UnsupportedOperation(
                "d3d12 requires a Win32 window handle",
            )),
        }
    }

    unsafe fn destroy_surface(&self, _surface: native::Surface) {}

    fn open_device(&self, info: &DeviceInfo, flags: DeviceFlags) -> Result<device::Device> {
        device::Device::open(&self.raw, info, flags)
    }
}

#[allow(dead_code)]
pub(crate) fn uuid_of<T: Interface>() -> GUID {
    T::uuidof()
}
