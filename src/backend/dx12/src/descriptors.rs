//! Descriptor heap layout for the bindless model.
//!
//! One shader-visible CBV/SRV/UAV heap carved into fixed ranges, one base
//! offset per portable descriptor type; a sampler heap; small CPU-only
//! RTV/DSV heaps handed out by a bump counter per attachment view.
#![cfg(windows)]

use std::{ptr, sync::atomic::AtomicU32};

use winapi::um::d3d12;
use wio::com::ComPtr;

use grx::{
    descriptor::{DescriptorType, ResourceHandle},
    error::Result,
};

use crate::check;

/// Descriptor types that live in the CBV/SRV/UAV heap, in range order.
pub(crate) const HEAP_TYPES: [DescriptorType; 11] = [
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
];

pub(crate) struct DescriptorHeaps {
    pub resource_heap: ComPtr<d3d12::ID3D12DescriptorHeap>,
    pub sampler_heap: ComPtr<d3d12::ID3D12DescriptorHeap>,
    pub rtv_heap: ComPtr<d3d12::ID3D12DescriptorHeap>,
    pub dsv_heap: ComPtr<d3d12::ID3D12DescriptorHeap>,
    pub resource_stride: u32,
    pub sampler_stride: u32,
    pub rtv_stride: u32,
    pub dsv_stride: u32,
    pub rtv_next: AtomicU32,
    pub dsv_next: AtomicU32,
    bases: [u32; DescriptorType::COUNT],
}

unsafe impl Send for DescriptorHeaps {}
unsafe impl Sync for DescriptorHeaps {}

const RTV_CAPACITY: u32 = 1024;
const DSV_CAPACITY: u32 = 256;

impl DescriptorHeaps {
    pub(crate) fn new(device: &ComPtr<d3d12::ID3D12Device>) -> Result<Self> {
        let mut bases = [0u32; DescriptorType::COUNT];
        let mut total = 0u32;
        for ty in HEAP_TYPES.iter() {
            bases[*ty as usize] = total;
            total += ty.capacity();
        }

        let resource_heap = Self::create_heap(
            device,
            d3d12::D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
            total,
            true,
        )?;
        let sampler_heap = Self::create_heap(
            device,
            d3d12::D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER,
            DescriptorType::Sampler.capacity(),
            true,
        )?;
        let rtv_heap = Self::create_heap(
            device,
            d3d12::D3D12_DESCRIPTOR_HEAP_TYPE_RTV,
            RTV_CAPACITY,
            false,
        )?;
        let dsv_heap = Self::create_heap(
            device,
            d3d12::D3D12_DESCRIPTOR_HEAP_TYPE_DSV,
            DSV_CAPACITY,
            false,
        )?;

        unsafe {
            Ok(DescriptorHeaps {
                resource_stride: device.GetDescriptorHandleIncrementSize(
                    d3d12::D3D12_DESCRIPTOR_HEAP_TYPE_CBV_SRV_UAV,
                ),
                sampler_stride: device
                    .GetDescriptorHandleIncrementSize(d3d12::D3D12_DESCRIPTOR_HEAP_TYPE_SAMPLER),
                rtv_stride: device
                    .GetDescriptorHandleIncrementSize(d3d12::D3D12_DESCRIPTOR_HEAP_TYPE_RTV),
                dsv_stride: device
                    .GetDescriptorHandleIncrementSize(d3d12::D3D12_DESCRIPTOR_HEAP_TYPE_DSV),
                resource_heap,
                sampler_heap,
                rtv_heap,
                dsv_heap,
                rtv_next: AtomicU32::new(0),
                dsv_next: AtomicU32::new(0),
                bases,
            })
        }
    }

    fn create_heap(
        device: &ComPtr<d3d12::ID3D12Device>,
        ty: d3d12::D3D12_DESCRIPTOR_HEAP_TYPE,
        count: u32,
        shader_visible: bool,
    ) -> Result<ComPtr<d3d12::ID3D12DescriptorHeap>> {
        use winapi::Interface;
        let desc = d3d12::D3D12_DESCRIPTOR_HEAP_DESC {
            Type: ty,
            NumDescriptors: count,
            Flags: if shader_visible {
                d3d12::D3D12_DESCRIPTOR_HEAP_FLAG_SHADER_VISIBLE
            } else {
                d3d12::D3D12_DESCRIPTOR_HEAP_FLAG_NONE
            },
            NodeMask: 0,
        };
        let mut heap: *mut d3d12::ID3D12DescriptorHeap = ptr::null_mut();
        unsafe {
            check(device.CreateDescriptorHeap(
                &desc,
                &d3d12::ID3D12DescriptorHeap::uuidof(),
                &mut heap as *mut _ as *mut _,
            ))?;
            Ok(ComPtr::from_raw(heap))
        }
    }

    /// Global heap index of a bindless handle.
    pub(crate) fn heap_index(&self, handle: ResourceHandle) -> u32 {
        let ty = handle.ty().unwrap_or(DescriptorType::Texture2D);
        self.bases[ty as usize] + handle.index()
    }

    /// CPU descriptor for writing a resource view into a heap slot.
    pub(crate) fn resource_cpu(&self, handle: ResourceHandle) -> d3d12::D3D12_CPU_DESCRIPTOR_HANDLE {
        let base = unsafe { self.resource_heap.GetCPUDescriptorHandleForHeapStart() };
        d3d12::D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: base.ptr + (self.heap_index(handle) * self.resource_stride) as usize,
        }
    }

    /// CPU descriptor for writing a sampler into a heap slot.
    pub(crate) fn sampler_cpu(&self, handle: ResourceHandle) -> d3d12::D3D12_CPU_DESCRIPTOR_HANDLE {
        let base = unsafe { self.sampler_heap.GetCPUDescriptorHandleForHeapStart() };
        d3d12::D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: base.ptr + (handle.index() * self.sampler_stride) as usize,
        }
    }

    /// Claim the next RTV slot.
    pub(crate) fn allocate_rtv(&self) -> d3d12::D3D12_CPU_DESCRIPTOR_HANDLE {
        let index = self
            .rtv_next
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel)
            % RTV_CAPACITY;
        let base = unsafe { self.rtv_heap.GetCPUDescriptorHandleForHeapStart() };
        d3d12::D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: base.ptr + (index * self.rtv_stride) as usize,
        }
    }

    /// Claim the next DSV slot.
    pub(crate) fn allocate_dsv(&self) -> d3d12::D3D12_CPU_DESCRIPTOR_HANDLE {
        let index = self
            .dsv_next
            .fetch_add(1, std::sync::atomic::Ordering::AcqRel)
            % DSV_CAPACITY;
        let base = unsafe { self.dsv_heap.GetCPUDescriptorHandleForHeapStart() };
        d3d12::D3D12_CPU_DESCRIPTOR_HANDLE {
            ptr: base.ptr + (index * self.dsv_stride) as usize,
        }
    }
}
