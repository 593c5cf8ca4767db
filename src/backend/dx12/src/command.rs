//! Command recording.
#![cfg(windows)]

use std::{ptr, sync::Arc};

use parking_lot::Mutex;
use smallvec::SmallVec;
use winapi::um::d3d12;
use wio::com::ComPtr;

use grx::{
    backend::{
        BackendCommandBuffer, BufferCopy, BufferImageCopy, ClearValue, DrawArgs, ImageCopy, Rect,
        RenderingDesc, SbtRegions, Viewport,
    },
    barrier::{BufferBarrier, ImageBarrier, SubresourceRange},
    format::IndexFormat,
    pipeline::PipelineKind,
    rtas::RtasBuildCmd,
    LoadOp,
};

use crate::{
    conv,
    device::RawDevice,
    native::{Buffer, Image, Pipeline},
    Backend,
};

/// A direct command list plus the allocator it records against.
pub struct CommandBuffer {
    pub(crate) list: ComPtr<d3d12::ID3D12GraphicsCommandList>,
    pub(crate) allocator: ComPtr<d3d12::ID3D12CommandAllocator>,
    pub(crate) shared: Arc<RawDevice>,
    /// Vertex strides of the bound graphics pipeline; D3D12 carries strides
    /// in the vertex buffer view.
    pub(crate) strides: Mutex<[u32; 8]>,
}

unsafe impl Send for CommandBuffer {}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "D3D12CommandBuffer")
    }
}

impl CommandBuffer {
    /// Descriptor heaps and root signatures must be re-set after every
    /// reset, including the mid-frame flush reopen.
    pub(crate) unsafe fn set_heaps_and_roots(&self) {
        let heaps = [
            self.shared.heaps.resource_heap.as_raw(),
            self.shared.heaps.sampler_heap.as_raw(),
        ];
        self.list.SetDescriptorHeaps(2, heaps.as_ptr() as *mut _);
        self.list
            .SetGraphicsRootSignature(self.shared.root_signature.as_raw());
        self.list
            .SetComputeRootSignature(self.shared.root_signature.as_raw());
    }

    unsafe fn bind_tables(&self, frame_slot: usize) {
        let resource_gpu = self
            .shared
            .heaps
            .resource_heap
            .GetGPUDescriptorHandleForHeapStart();
        let sampler_gpu = self
            .shared
            .heaps
            .sampler_heap
            .GetGPUDescriptorHandleForHeapStart();
        let frame_va = self.shared.frame_cbv.lock()[frame_slot];

        self.list.SetGraphicsRootDescriptorTable(0, resource_gpu);
        self.list.SetGraphicsRootDescriptorTable(1, sampler_gpu);
        self.list.SetGraphicsRootConstantBufferView(2, frame_va);
        self.list.SetComputeRootDescriptorTable(0, resource_gpu);
        self.list.SetComputeRootDescriptorTable(1, sampler_gpu);
        self.list.SetComputeRootConstantBufferView(2, frame_va);
    }
}

impl BackendCommandBuffer<Backend> for CommandBuffer {
    unsafe fn pipeline_barrier(
        &mut self,
        buffers: &[BufferBarrier<Backend>],
        images: &[ImageBarrier<Backend>],
    ) {
        let mut barriers = SmallVec::<[d3d12::D3D12_RESOURCE_BARRIER; 8]>::new();

        for barrier in buffers {
            // Upload-heap slices stay in GENERIC_READ for their lifetime.
            if barrier.buffer.is_upload() {
                continue;
            }
            let before = conv::map_state(barrier.src.1, grx::barrier::ImageLayout::Undefined);
            let after = conv::map_state(barrier.dst.1, grx::barrier::ImageLayout::Undefined);
            let resource = barrier.buffer.resource();
            let mut out: d3d12::D3D12_RESOURCE_BARRIER = std::mem::zeroed();
            if before == after {
                if after & d3d12::D3D12_RESOURCE_STATE_UNORDERED_ACCESS == 0 {
                    continue;
                }
                out.Type = d3d12::D3D12_RESOURCE_BARRIER_TYPE_UAV;
                out.u.UAV_mut().pResource = resource.as_raw();
            } else {
                out.Type = d3d12::D3D12_RESOURCE_BARRIER_TYPE_TRANSITION;
                *out.u.Transition_mut() = d3d12::D3D12_RESOURCE_TRANSITION_BARRIER {
                    pResource: resource.as_raw(),
                    Subresource: d3d12::D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                    StateBefore: before,
                    StateAfter: after,
                };
            }
            // The owning Buffer keeps the resource alive past this call.
            drop(resource);
            barriers.push(out);
        }

        for barrier in images {
            let before = conv::map_state(barrier.src.1, barrier.layouts.0);
            let after = conv::map_state(barrier.dst.1, barrier.layouts.1);
            if before == after {
                continue;
            }
            let resource = barrier.image.resource();
            let mut out: d3d12::D3D12_RESOURCE_BARRIER = std::mem::zeroed();
            out.Type = d3d12::D3D12_RESOURCE_BARRIER_TYPE_TRANSITION;
            *out.u.Transition_mut() = d3d12::D3D12_RESOURCE_TRANSITION_BARRIER {
                pResource: resource.as_raw(),
                Subresource: d3d12::D3D12_RESOURCE_BARRIER_ALL_SUBRESOURCES,
                StateBefore: before,
                StateAfter: after,
            };
            drop(resource);
            barriers.push(out);
        }

        if !barriers.is_empty() {
            self.list
                .ResourceBarrier(barriers.len() as u32, barriers.as_ptr());
        }
    }

    unsafe fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, regions: &[BufferCopy]) {
        let src_resource = src.resource();
        let dst_resource = dst.resource();
        for region in regions {
            self.list.CopyBufferRegion(
                dst_resource.as_raw(),
                dst.offset() + region.dst_offset,
                src_resource.as_raw(),
                src.offset() + region.src_offset,
                region.size,
            );
        }
    }

    unsafe fn copy_buffer_to_image(
        &mut self,
        src: &Buffer,
        dst: &Image,
        desc: &grx::TextureDesc,
        regions: &[BufferImageCopy],
    ) {
        let src_resource = src.resource();
        let dst_resource = dst.resource();
        for region in regions {
            let mut src_loc: d3d12::D3D12_TEXTURE_COPY_LOCATION = std::mem::zeroed();
            src_loc.pResource = src_resource.as_raw();
            src_loc.Type = d3d12::D3D12_TEXTURE_COPY_TYPE_PLACED_FOOTPRINT;
            *src_loc.u.PlacedFootprint_mut() = d3d12::D3D12_PLACED_SUBRESOURCE_FOOTPRINT {
                Offset: src.offset() + region.buffer_offset,
                Footprint: d3d12::D3D12_SUBRESOURCE_FOOTPRINT {
                    Format: conv::map_format(desc.format),
                    Width: region.extent[0],
                    Height: region.extent[1],
                    Depth: region.extent[2],
                    RowPitch: region.buffer_row_pitch as u32,
                },
            };

            let mut dst_loc: d3d12::D3D12_TEXTURE_COPY_LOCATION = std::mem::zeroed();
            dst_loc.pResource = dst_resource.as_raw();
            dst_loc.Type = d3d12::D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX;
            *dst_loc.u.SubresourceIndex_mut() =
                region.mip + region.layer * desc.mips.max(1);

            self.list.CopyTextureRegion(
                &dst_loc,
                region.origin[0],
                region.origin[1],
                region.origin[2],
                &src_loc,
                ptr::null(),
            );
        }
    }

    unsafe fn copy_image(&mut self, src: &Image, dst: &Image, regions: &[ImageCopy]) {
        let src_resource = src.resource();
        let dst_resource = dst.resource();
        for region in regions {
            let mut src_loc: d3d12::D3D12_TEXTURE_COPY_LOCATION = std::mem::zeroed();
            src_loc.pResource = src_resource.as_raw();
            src_loc.Type = d3d12::D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX;
            *src_loc.u.SubresourceIndex_mut() = region.src_mip;
            let mut dst_loc: d3d12::D3D12_TEXTURE_COPY_LOCATION = std::mem::zeroed();
            dst_loc.pResource = dst_resource.as_raw();
            dst_loc.Type = d3d12::D3D12_TEXTURE_COPY_TYPE_SUBRESOURCE_INDEX;
            *dst_loc.u.SubresourceIndex_mut() = region.dst_mip;

            let src_box = d3d12::D3D12_BOX {
                left: region.src_origin[0],
                top: region.src_origin[1],
                front: region.src_origin[2],
                right: region.src_origin[0] + region.extent[0],
                bottom: region.src_origin[1] + region.extent[1],
                back: region.src_origin[2] + region.extent[2],
            };
            self.list.CopyTextureRegion(
                &dst_loc,
                region.dst_origin[0],
                region.dst_origin[1],
                region.dst_origin[2],
                &src_loc,
                &src_box,
            );
        }
    }

    unsafe fn clear_image(&mut self, image: &Image, value: ClearValue, _range: SubresourceRange) {
        let rtv = image.rtv.load(std::sync::atomic::Ordering::Acquire);
        let dsv = image.dsv.load(std::sync::atomic::Ordering::Acquire);
        match value {
            ClearValue::Color(color) if rtv != 0 => {
                self.list.ClearRenderTargetView(
                    d3d12::D3D12_CPU_DESCRIPTOR_HANDLE { ptr: rtv as usize },
                    &color,
                    0,
                    ptr::null(),
                );
            }
            ClearValue::DepthStencil(depth, stencil) if dsv != 0 => {
                self.list.ClearDepthStencilView(
                    d3d12::D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dsv as usize },
                    d3d12::D3D12_CLEAR_FLAG_DEPTH | d3d12::D3D12_CLEAR_FLAG_STENCIL,
                    depth,
                    stencil as u8,
                    0,
                    ptr::null(),
                );
            }
            _ => warn!("clear_image without an attachment view is a no-op on d3d12"),
        }
    }

    unsafe fn begin_rendering(&mut self, desc: &RenderingDesc<Backend>) {
        let mut rtvs = SmallVec::<[d3d12::D3D12_CPU_DESCRIPTOR_HANDLE; 4]>::new();
        for attachment in desc.colors.iter() {
            let rtv = attachment
                .image
                .rtv
                .load(std::sync::atomic::Ordering::Acquire);
            let handle = d3d12::D3D12_CPU_DESCRIPTOR_HANDLE { ptr: rtv as usize };
            if let (LoadOp::Clear, ClearValue::Color(color)) = (attachment.load, attachment.clear)
            {
                self.list
                    .ClearRenderTargetView(handle, &color, 0, ptr::null());
            }
            rtvs.push(handle);
        }
        let dsv = desc.depth.as_ref().map(|attachment| {
            let dsv = attachment
                .image
                .dsv
                .load(std::sync::atomic::Ordering::Acquire);
            let handle = d3d12::D3D12_CPU_DESCRIPTOR_HANDLE { ptr: dsv as usize };
            if let (LoadOp::Clear, ClearValue::DepthStencil(depth, stencil)) =
                (attachment.load, attachment.clear)
            {
                self.list.ClearDepthStencilView(
                    handle,
                    d3d12::D3D12_CLEAR_FLAG_DEPTH,
                    depth,
                    stencil as u8,
                    0,
                    ptr::null(),
                );
            }
            handle
        });

        self.list.OMSetRenderTargets(
            rtvs.len() as u32,
            rtvs.as_ptr(),
            0,
            dsv.as_ref().map(|d| d as *const _).unwrap_or(ptr::null()),
        );
    }

    unsafe fn end_rendering(&mut self) {
        // No explicit scope on this API.
    }

    unsafe fn bind_pipeline(&mut self, kind: PipelineKind, pipeline: &Pipeline) {
        self.list.SetPipelineState(pipeline.raw.as_raw());
        if kind == PipelineKind::Graphics {
            self.list.IASetPrimitiveTopology(pipeline.topology);
            *self.strides.lock() = pipeline.vertex_strides;
        }
    }

    unsafe fn bind_frame_descriptors(&mut self, _device: &crate::device::Device, frame_slot: usize) {
        self.set_heaps_and_roots();
        self.bind_tables(frame_slot);
    }

    unsafe fn set_viewport(&mut self, viewport: &Viewport) {
        let vp = d3d12::D3D12_VIEWPORT {
            TopLeftX: viewport.x,
            TopLeftY: viewport.y,
            Width: viewport.width,
            Height: viewport.height,
            MinDepth: viewport.min_depth,
            MaxDepth: viewport.max_depth,
        };
        self.list.RSSetViewports(1, &vp);
    }

    unsafe fn set_scissor(&mut self, rect: &Rect) {
        let scissor = d3d12::D3D12_RECT {
            left: rect.x,
            top: rect.y,
            right: rect.x + rect.width as i32,
            bottom: rect.y + rect.height as i32,
        };
        self.list.RSSetScissorRects(1, &scissor);
    }

    unsafe fn set_stencil_reference(&mut self, reference: u32) {
        self.list.OMSetStencilRef(reference);
    }

    unsafe fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.list.OMSetBlendFactor(&constants);
    }

    unsafe fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, format: IndexFormat) {
        let view = d3d12::D3D12_INDEX_BUFFER_VIEW {
            BufferLocation: buffer.va.load(std::sync::atomic::Ordering::Acquire) + offset,
            SizeInBytes: (buffer.size - offset) as u32,
            Format: conv::map_index_format(format),
        };
        self.list.IASetIndexBuffer(&view);
    }

    unsafe fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[(&Buffer, u64)]) {
        let strides = *self.strides.lock();
        let views: SmallVec<[d3d12::D3D12_VERTEX_BUFFER_VIEW; 4]> = buffers
            .iter()
            .enumerate()
            .map(|(i, (buffer, offset))| d3d12::D3D12_VERTEX_BUFFER_VIEW {
                BufferLocation: buffer.va.load(std::sync::atomic::Ordering::Acquire) + offset,
                SizeInBytes: (buffer.size - offset) as u32,
                StrideInBytes: strides
                    .get(first_binding as usize + i)
                    .copied()
                    .unwrap_or(0),
            })
            .collect();
        self.list
            .IASetVertexBuffers(first_binding, views.len() as u32, views.as_ptr());
    }

    unsafe fn draw(&mut self, args: &DrawArgs) {
        if args.indexed {
            self.list.DrawIndexedInstanced(
                args.count,
                args.instance_count.max(1),
                args.first,
                args.vertex_offset,
                args.first_instance,
            );
        } else {
            self.list.DrawInstanced(
                args.count,
                args.instance_count.max(1),
                args.first,
                args.first_instance,
            );
        }
    }

    unsafe fn draw_indirect(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        draw_count: u32,
        _stride: u32,
        indexed: bool,
    ) {
        let resource = buffer.resource();
        let signature = if indexed {
            &self.shared.draw_indexed_signature
        } else {
            &self.shared.draw_signature
        };
        self.list.ExecuteIndirect(
            signature.as_raw(),
            draw_count,
            resource.as_raw(),
            buffer.offset() + offset,
            ptr::null_mut(),
            0,
        );
    }

    unsafe fn draw_indirect_count(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        count_buffer: &Buffer,
        count_offset: u64,
        max_draw_count: u32,
        _stride: u32,
        indexed: bool,
    ) {
        let resource = buffer.resource();
        let count_resource = count_buffer.resource();
        let signature = if indexed {
            &self.shared.draw_indexed_signature
        } else {
            &self.shared.draw_signature
        };
        self.list.ExecuteIndirect(
            signature.as_raw(),
            max_draw_count,
            resource.as_raw(),
            buffer.offset() + offset,
            count_resource.as_raw(),
            count_buffer.offset() + count_offset,
        );
    }

    unsafe fn dispatch(&mut self, groups: [u32; 3]) {
        self.list.Dispatch(groups[0], groups[1], groups[2]);
    }

    unsafe fn dispatch_indirect(&mut self, buffer: &Buffer, offset: u64) {
        let resource = buffer.resource();
        self.list.ExecuteIndirect(
            self.shared.dispatch_signature.as_raw(),
            1,
            resource.as_raw(),
            buffer.offset() + offset,
            ptr::null_mut(),
            0,
        );
    }

    unsafe fn trace_rays(&mut self, _sbt: &SbtRegions, _extent: [u32; 3]) {
        warn!("trace_rays is not supported by the d3d12 backend");
    }

    unsafe fn trace_rays_indirect(&mut self, _sbt: &SbtRegions, _args_address: u64) {
        warn!("trace_rays is not supported by the d3d12 backend");
    }

    unsafe fn build_rtas(&mut self, cmd: &RtasBuildCmd<Backend>) {
        match *cmd.dst {}
    }

    unsafe fn begin_debug_region(&mut self, name: &str, _color: [f32; 4]) {
        // PIX unicode event: metadata 2, UTF-16 payload.
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        self.list.BeginEvent(
            2,
            wide.as_ptr() as *const _,
            (wide.len() * 2) as u32,
        );
    }

    unsafe fn end_debug_region(&mut self) {
        self.list.EndEvent();
    }

    unsafe fn insert_debug_marker(&mut self, name: &str) {
        let wide: Vec<u16> = name.encode_utf16().chain(std::iter::once(0)).collect();
        self.list.SetMarker(
            2,
            wide.as_ptr() as *const _,
            (wide.len() * 2) as u32,
        );
    }
}
