//! Command recording.

use std::{ffi::CString, sync::Arc};

use ash::vk;
use smallvec::SmallVec;

use grx::{
    backend::{
        BackendCommandBuffer, BufferCopy, BufferImageCopy, ClearValue, DrawArgs, ImageCopy, Rect,
        RenderingAttachment, RenderingDesc, SbtRegion, SbtRegions, Viewport,
    },
    barrier::{BufferBarrier, ImageBarrier, SubresourceRange},
    format::IndexFormat,
    pipeline::PipelineKind,
    rtas::RtasBuildCmd,
};

use crate::{
    conv,
    device::RawDevice,
    native::{Buffer, Image, Pipeline},
    Backend,
};

/// A primary command buffer plus the device function tables it records with.
pub struct CommandBuffer {
    pub(crate) raw: vk::CommandBuffer,
    pub(crate) shared: Arc<RawDevice>,
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "VulkanCommandBuffer")
    }
}

unsafe impl Send for CommandBuffer {}

fn sbt_region(region: &SbtRegion) -> vk::StridedDeviceAddressRegionKHR {
    vk::StridedDeviceAddressRegionKHR {
        device_address: region.address,
        stride: region.stride,
        size: region.size,
    }
}

fn attachment_info(
    attachment: &RenderingAttachment<Backend>,
    depth: bool,
) -> vk::RenderingAttachmentInfoKHR {
    let layout = if depth {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    };
    let mut info = vk::RenderingAttachmentInfoKHR {
        image_view: attachment.image.view(),
        image_layout: layout,
        load_op: conv::map_load_op(attachment.load),
        store_op: conv::map_store_op(attachment.store),
        clear_value: conv::map_clear_value(attachment.clear),
        ..Default::default()
    };
    if let Some(resolve) = attachment.resolve {
        info.resolve_mode = vk::ResolveModeFlags::AVERAGE;
        info.resolve_image_view = resolve.view();
        info.resolve_image_layout = layout;
    }
    info
}

impl BackendCommandBuffer<Backend> for CommandBuffer {
    unsafe fn pipeline_barrier(
        &mut self,
        buffers: &[BufferBarrier<Backend>],
        images: &[ImageBarrier<Backend>],
    ) {
        let mut src_stages = vk::PipelineStageFlags::empty();
        let mut dst_stages = vk::PipelineStageFlags::empty();

        let buffer_barriers: SmallVec<[vk::BufferMemoryBarrier; 8]> = buffers
            .iter()
            .map(|barrier| {
                src_stages |= conv::map_stages(barrier.src.0);
                dst_stages |= conv::map_stages(barrier.dst.0);
                vk::BufferMemoryBarrier {
                    src_access_mask: conv::map_access(barrier.src.1),
                    dst_access_mask: conv::map_access(barrier.dst.1),
                    src_queue_family_index: self.shared.queue_family,
                    dst_queue_family_index: self.shared.queue_family,
                    buffer: barrier.buffer.raw,
                    offset: barrier.range.start,
                    size: if barrier.range.end == barrier.range.start {
                        vk::WHOLE_SIZE
                    } else {
                        barrier.range.end - barrier.range.start
                    },
                    ..Default::default()
                }
            })
            .collect();

        let image_barriers: SmallVec<[vk::ImageMemoryBarrier; 8]> = images
            .iter()
            .map(|barrier| {
                src_stages |= conv::map_stages(barrier.src.0);
                dst_stages |= conv::map_stages(barrier.dst.0);
                let depth = barrier
                    .image
                    .desc
                    .map(|d| d.format.desc().is_depth_stencil)
                    .unwrap_or(false);
                vk::ImageMemoryBarrier {
                    src_access_mask: conv::map_access(barrier.src.1),
                    dst_access_mask: conv::map_access(barrier.dst.1),
                    old_layout: conv::map_layout(barrier.layouts.0),
                    new_layout: conv::map_layout(barrier.layouts.1),
                    src_queue_family_index: self.shared.queue_family,
                    dst_queue_family_index: self.shared.queue_family,
                    image: barrier.image.raw,
                    subresource_range: conv::map_subresource(&barrier.range, depth),
                    ..Default::default()
                }
            })
            .collect();

        if src_stages.is_empty() {
            src_stages = vk::PipelineStageFlags::TOP_OF_PIPE;
        }
        if dst_stages.is_empty() {
            dst_stages = vk::PipelineStageFlags::BOTTOM_OF_PIPE;
        }

        self.shared.raw.cmd_pipeline_barrier(
            self.raw,
            src_stages,
            dst_stages,
            vk::DependencyFlags::empty(),
            &[],
            &buffer_barriers,
            &image_barriers,
        );
    }

    unsafe fn copy_buffer(&mut self, src: &Buffer, dst: &Buffer, regions: &[BufferCopy]) {
        let copies: SmallVec<[vk::BufferCopy; 8]> = regions
            .iter()
            .map(|region| vk::BufferCopy {
                src_offset: region.src_offset,
                dst_offset: region.dst_offset,
                size: region.size,
            })
            .collect();
        self.shared
            .raw
            .cmd_copy_buffer(self.raw, src.raw, dst.raw, &copies);
    }

    unsafe fn copy_buffer_to_image(
        &mut self,
        src: &Buffer,
        dst: &Image,
        desc: &grx::TextureDesc,
        regions: &[BufferImageCopy],
    ) {
        let fmt = desc.format.desc();
        let copies: SmallVec<[vk::BufferImageCopy; 4]> = regions
            .iter()
            .map(|region| {
                // Vulkan wants the pitch back in texels.
                let row_texels = (region.buffer_row_pitch / fmt.bytes as u64) as u32
                    * fmt.block_width;
                vk::BufferImageCopy {
                    buffer_offset: region.buffer_offset,
                    buffer_row_length: row_texels,
                    buffer_image_height: 0,
                    image_subresource: vk::ImageSubresourceLayers {
                        aspect_mask: if fmt.is_depth_stencil {
                            vk::ImageAspectFlags::DEPTH
                        } else {
                            vk::ImageAspectFlags::COLOR
                        },
                        mip_level: region.mip,
                        base_array_layer: region.layer,
                        layer_count: 1,
                    },
                    image_offset: vk::Offset3D {
                        x: region.origin[0] as i32,
                        y: region.origin[1] as i32,
                        z: region.origin[2] as i32,
                    },
                    image_extent: vk::Extent3D {
                        width: region.extent[0],
                        height: region.extent[1],
                        depth: region.extent[2],
                    },
                }
            })
            .collect();
        self.shared.raw.cmd_copy_buffer_to_image(
            self.raw,
            src.raw,
            dst.raw,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &copies,
        );
    }

    unsafe fn copy_image(&mut self, src: &Image, dst: &Image, regions: &[ImageCopy]) {
        let copies: SmallVec<[vk::ImageCopy; 4]> = regions
            .iter()
            .map(|region| vk::ImageCopy {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: region.src_mip,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                src_offset: vk::Offset3D {
                    x: region.src_origin[0] as i32,
                    y: region.src_origin[1] as i32,
                    z: region.src_origin[2] as i32,
                },
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: region.dst_mip,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offset: vk::Offset3D {
                    x: region.dst_origin[0] as i32,
                    y: region.dst_origin[1] as i32,
                    z: region.dst_origin[2] as i32,
                },
                extent: vk::Extent3D {
                    width: region.extent[0],
                    height: region.extent[1],
                    depth: region.extent[2],
                },
            })
            .collect();
        self.shared.raw.cmd_copy_image(
            self.raw,
            src.raw,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.raw,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &copies,
        );
    }

    unsafe fn clear_image(&mut self, image: &Image, value: ClearValue, range: SubresourceRange) {
        match value {
            ClearValue::Color(_) | ClearValue::ColorU(_) => {
                let color = match value {
                    ClearValue::Color(float32) => vk::ClearColorValue { float32 },
                    ClearValue::ColorU(uint32) => vk::ClearColorValue { uint32 },
                    _ => unreachable!(),
                };
                self.shared.raw.cmd_clear_color_image(
                    self.raw,
                    image.raw,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &color,
                    &[conv::map_subresource(&range, false)],
                );
            }
            ClearValue::DepthStencil(depth, stencil) => {
                self.shared.raw.cmd_clear_depth_stencil_image(
                    self.raw,
                    image.raw,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &vk::ClearDepthStencilValue { depth, stencil },
                    &[conv::map_subresource(&range, true)],
                );
            }
        }
    }

    unsafe fn begin_rendering(&mut self, desc: &RenderingDesc<Backend>) {
        let colors: SmallVec<[vk::RenderingAttachmentInfoKHR; 4]> = desc
            .colors
            .iter()
            .map(|attachment| attachment_info(attachment, false))
            .collect();
        let depth = desc.depth.as_ref().map(|a| attachment_info(a, true));
        let stencil = desc.stencil.as_ref().map(|a| attachment_info(a, true));

        let mut info = vk::RenderingInfoKHR {
            render_area: vk::Rect2D {
                offset: vk::Offset2D {
                    x: desc.area.x,
                    y: desc.area.y,
                },
                extent: vk::Extent2D {
                    width: desc.area.width,
                    height: desc.area.height,
                },
            },
            layer_count: 1,
            color_attachment_count: colors.len() as u32,
            p_color_attachments: colors.as_ptr(),
            ..Default::default()
        };
        if let Some(depth) = &depth {
            info.p_depth_attachment = depth;
        }
        if let Some(stencil) = &stencil {
            info.p_stencil_attachment = stencil;
        }
        self.shared.dynren_ext.cmd_begin_rendering(self.raw, &info);
    }

    unsafe fn end_rendering(&mut self) {
        self.shared.dynren_ext.cmd_end_rendering(self.raw);
    }

    unsafe fn bind_pipeline(&mut self, kind: PipelineKind, pipeline: &Pipeline) {
        self.shared
            .raw
            .cmd_bind_pipeline(self.raw, conv::map_bind_point(kind), pipeline.raw);
    }

    unsafe fn bind_frame_descriptors(&mut self, device: &crate::device::Device, frame_slot: usize) {
        let heap = &device.shared.heap;
        let sets = [
            heap.resources_set,
            heap.samplers_set,
            heap.frame_sets[frame_slot],
        ];
        let mut bind_points = vec![
            vk::PipelineBindPoint::COMPUTE,
            vk::PipelineBindPoint::GRAPHICS,
        ];
        if self.shared.has_ray {
            bind_points.push(vk::PipelineBindPoint::RAY_TRACING_KHR);
        }
        for bind_point in bind_points {
            self.shared.raw.cmd_bind_descriptor_sets(
                self.raw,
                bind_point,
                heap.pipeline_layout,
                0,
                &sets,
                &[],
            );
        }
    }

    unsafe fn set_viewport(&mut self, viewport: &Viewport) {
        let vp = vk::Viewport {
            x: viewport.x,
            y: viewport.y,
            width: viewport.width,
            height: viewport.height,
            min_depth: viewport.min_depth,
            max_depth: viewport.max_depth,
        };
        self.shared.raw.cmd_set_viewport(self.raw, 0, &[vp]);
    }

    unsafe fn set_scissor(&mut self, rect: &Rect) {
        let scissor = vk::Rect2D {
            offset: vk::Offset2D {
                x: rect.x,
                y: rect.y,
            },
            extent: vk::Extent2D {
                width: rect.width,
                height: rect.height,
            },
        };
        self.shared.raw.cmd_set_scissor(self.raw, 0, &[scissor]);
    }

    unsafe fn set_stencil_reference(&mut self, reference: u32) {
        self.shared.raw.cmd_set_stencil_reference(
            self.raw,
            vk::StencilFaceFlags::FRONT_AND_BACK,
            reference,
        );
    }

    unsafe fn set_blend_constants(&mut self, constants: [f32; 4]) {
        self.shared.raw.cmd_set_blend_constants(self.raw, &constants);
    }

    unsafe fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, format: IndexFormat) {
        self.shared.raw.cmd_bind_index_buffer(
            self.raw,
            buffer.raw,
            offset,
            conv::map_index_format(format),
        );
    }

    unsafe fn bind_vertex_buffers(&mut self, first_binding: u32, buffers: &[(&Buffer, u64)]) {
        let raws: SmallVec<[vk::Buffer; 4]> = buffers.iter().map(|(b, _)| b.raw).collect();
        let offsets: SmallVec<[u64; 4]> = buffers.iter().map(|(_, o)| *o).collect();
        self.shared
            .raw
            .cmd_bind_vertex_buffers(self.raw, first_binding, &raws, &offsets);
    }

    unsafe fn draw(&mut self, args: &DrawArgs) {
        if args.indexed {
            self.shared.raw.cmd_draw_indexed(
                self.raw,
                args.count,
                args.instance_count.max(1),
                args.first,
                args.vertex_offset,
                args.first_instance,
            );
        } else {
            self.shared.raw.cmd_draw(
                self.raw,
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
        stride: u32,
        indexed: bool,
    ) {
        if indexed {
            self.shared
                .raw
                .cmd_draw_indexed_indirect(self.raw, buffer.raw, offset, draw_count, stride);
        } else {
            self.shared
                .raw
                .cmd_draw_indirect(self.raw, buffer.raw, offset, draw_count, stride);
        }
    }

    unsafe fn draw_indirect_count(
        &mut self,
        buffer: &Buffer,
        offset: u64,
        count_buffer: &Buffer,
        count_offset: u64,
        max_draw_count: u32,
        stride: u32,
        indexed: bool,
    ) {
        if indexed {
            self.shared.raw.cmd_draw_indexed_indirect_count(
                self.raw,
                buffer.raw,
                offset,
                count_buffer.raw,
                count_offset,
                max_draw_count,
                stride,
            );
        } else {
            self.shared.raw.cmd_draw_indirect_count(
                self.raw,
                buffer.raw,
                offset,
                count_buffer.raw,
                count_offset,
                max_draw_count,
                stride,
            );
        }
    }

    unsafe fn dispatch(&mut self, groups: [u32; 3]) {
        self.shared
            .raw
            .cmd_dispatch(self.raw, groups[0], groups[1], groups[2]);
    }

    unsafe fn dispatch_indirect(&mut self, buffer: &Buffer, offset: u64) {
        self.shared
            .raw
            .cmd_dispatch_indirect(self.raw, buffer.raw, offset);
    }

    unsafe fn trace_rays(&mut self, sbt: &SbtRegions, extent: [u32; 3]) {
        if let Some(rt_ext) = self.shared.rt_ext.as_ref() {
            rt_ext.cmd_trace_rays(
                self.raw,
                &sbt_region(&sbt.raygen),
                &sbt_region(&sbt.miss),
                &sbt_region(&sbt.hit),
                &sbt_region(&sbt.callable),
                extent[0],
                extent[1],
                extent[2],
            );
        }
    }

    unsafe fn trace_rays_indirect(&mut self, sbt: &SbtRegions, args_address: u64) {
        if let Some(rt_ext) = self.shared.rt_ext.as_ref() {
            rt_ext.cmd_trace_rays_indirect(
                self.raw,
                &[sbt_region(&sbt.raygen)],
                &[sbt_region(&sbt.miss)],
                &[sbt_region(&sbt.hit)],
                &[sbt_region(&sbt.callable)],
                args_address,
            );
        }
    }

    unsafe fn build_rtas(&mut self, cmd: &RtasBuildCmd<Backend>) {
        let as_ext = match self.shared.as_ext.as_ref() {
            Some(ext) => ext,
            None => return,
        };
        let device = crate::device::Device {
            shared: Arc::clone(&self.shared),
        };
        let (geometry, primitive_count) = device.build_geometry(&cmd.inputs);
        let mut info = device.build_info(&cmd.inputs, &geometry);
        info.src_acceleration_structure = cmd
            .src
            .map(|s| s.raw)
            .unwrap_or(vk::AccelerationStructureKHR::null());
        if info.src_acceleration_structure != vk::AccelerationStructureKHR::null() {
            info.mode = vk::BuildAccelerationStructureModeKHR::UPDATE;
        }
        info.dst_acceleration_structure = cmd.dst.raw;
        info.scratch_data = vk::DeviceOrHostAddressKHR {
            device_address: device.buffer_device_address(cmd.scratch) + cmd.scratch_offset,
        };

        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };
        as_ext.cmd_build_acceleration_structures(self.raw, &[info], &[&[range]]);
    }

    unsafe fn begin_debug_region(&mut self, name: &str, color: [f32; 4]) {
        if let Some((utils, _)) = &self.shared.instance.debug {
            if let Ok(name) = CString::new(name) {
                let label = vk::DebugUtilsLabelEXT {
                    p_label_name: name.as_ptr(),
                    color,
                    ..Default::default()
                };
                utils.cmd_begin_debug_utils_label(self.raw, &label);
            }
        }
    }

    unsafe fn end_debug_region(&mut self) {
        if let Some((utils, _)) = &self.shared.instance.debug {
            utils.cmd_end_debug_utils_label(self.raw);
        }
    }

    unsafe fn insert_debug_marker(&mut self, name: &str) {
        if let Some((utils, _)) = &self.shared.instance.debug {
            if let Ok(name) = CString::new(name) {
                let label = vk::DebugUtilsLabelEXT {
                    p_label_name: name.as_ptr(),
                    color: [0.0; 4],
                    ..Default::default()
                };
                utils.cmd_insert_debug_utils_label(self.raw, &label);
            }
        }
    }
}
