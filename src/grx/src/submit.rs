//! Frame scheduling and submission.
//!
//! One frame is a pipeline of stages over a [`FrameContext`]:
//! `begin_frame → acquire_swapchains → write_frame_constants → open →
//! handle_next_frame → translate_lists → present_layouts → close_and_submit
//! → present`. A staging-budget overrun in the middle of the frame forces a
//! mid-frame flush which submits the work recorded so far, waits for it,
//! and re-enters the open state.

use std::{ops::Range, sync::Arc, time::Instant};

use arrayvec::ArrayVec;
use fnv::FnvHashSet;
use smallvec::SmallVec;

use crate::{
    backend::{
        BackendCommandBuffer, BackendDevice, BufferCopy, BufferImageCopy, Rect,
        RenderingAttachment, RenderingDesc, SubmitDesc, Viewport,
    },
    barrier::{
        resolve_transition, Access, BarrierBatch, ImageLayout, PipelineStages, SubresourceRange,
        TransitionType,
    },
    buffer::{merge_ranges, BufferInner, BufferUsage},
    cmd::{
        CommandList, CommandOp, RecordState, RenderTargetRef, ScopeTransition, TransitionResource,
    },
    device::{
        geometry_ref, Device, DeviceShared, FrameConstants, FrameState, APP_DATA_SIZE,
        FLUSH_THRESHOLD_PRIMITIVES, FRAMES_IN_FLIGHT, MAX_SWAPCHAINS,
    },
    error::{Error, Result},
    format::IndexFormat,
    pipeline::{PipelineInner, PipelineKind},
    resource::{AnyResource, ResourceFlags, ResourceInfo},
    rtas::{
        pack_motion_instance, pack_static_instance, BlasInner, RtasBuildCmd, RtasBuildFlags,
        RtasBuildInputs, RtasGeometryRef, TlasInner, TlasInstances, INSTANCE_RECORD_SIZE,
        MOTION_INSTANCE_RECORD_SIZE,
    },
    swapchain::Swapchain,
    texture::TextureInner,
    Backend,
};

/// Latched-versus-committed state of the translator; zeroed after a forced
/// mid-frame flush because the fresh command buffer lost all of it.
struct TranslateCache<B: Backend> {
    viewport: Option<Viewport>,
    scissor: Option<Rect>,
    stencil: u32,
    blend: [f32; 4],
    pipeline: Option<Arc<PipelineInner<B>>>,
    vertex: Option<(Arc<BufferInner<B>>, Range<u64>)>,
    index: Option<(Arc<BufferInner<B>>, u64, IndexFormat)>,

    committed_viewport: Option<Viewport>,
    committed_scissor: Option<Rect>,
    committed_stencil: Option<u32>,
    committed_blend: Option<[f32; 4]>,
    committed_pipeline: [Option<usize>; 3],
    committed_vertex: Option<(usize, u64, u64)>,
    committed_index: Option<(usize, u64, IndexFormat)>,
}

impl<B: Backend> Default for TranslateCache<B> {
    fn default() -> Self {
        TranslateCache {
            viewport: None,
            scissor: None,
            stencil: 0,
            blend: [0.0; 4],
            pipeline: None,
            vertex: None,
            index: None,
            committed_viewport: None,
            committed_scissor: None,
            committed_stencil: None,
            committed_blend: None,
            committed_pipeline: [None; 3],
            committed_vertex: None,
            committed_index: None,
        }
    }
}

fn kind_index(kind: PipelineKind) -> usize {
    match kind {
        PipelineKind::Compute => 0,
        PipelineKind::Graphics => 1,
        PipelineKind::RayTracing => 2,
    }
}

pub(crate) struct FrameContext<'a, B: Backend> {
    shared: &'a Arc<DeviceShared<B>>,
    frame: &'a mut FrameState<B>,
    slot: usize,
    cmd: Option<B::CommandBuffer>,
    cache: TranslateCache<B>,
    /// Identities already retained in this frame's in-flight list.
    retained: FnvHashSet<usize>,
    in_rendering: bool,
}

impl<'a, B: Backend> FrameContext<'a, B> {
    fn cmd(&mut self) -> &mut B::CommandBuffer {
        self.cmd.as_mut().expect("no open command buffer")
    }

    fn push_in_flight(&mut self, resource: AnyResource<B>) {
        if self.retained.insert(resource.id()) {
            self.frame.in_flight[self.slot].push(resource);
        }
    }

    fn is_in_flight(&self, id: usize) -> bool {
        self.frame
            .in_flight
            .iter()
            .any(|list| list.iter().any(|r| r.id() == id))
    }

    /// Stage 1: wait for frame `submit_id - 3` before reusing its slot.
    fn begin_frame(&mut self) -> Result<()> {
        if self.frame.submit_id > FRAMES_IN_FLIGHT as u64 {
            unsafe {
                self.shared
                    .raw
                    .wait_timeline(self.frame.submit_id - FRAMES_IN_FLIGHT as u64)?;
            }
        }
        Ok(())
    }

    /// Stage 2: acquire one image per swapchain.
    fn acquire_swapchains(&mut self, swapchains: &[&Swapchain<B>]) -> Result<()> {
        for swapchain in swapchains {
            let inner = &swapchain.inner;
            let mut state = inner.state.lock();
            let raw = state.raw.as_ref().expect("swapchain destroyed");
            let image = unsafe { self.shared.raw.acquire_image(raw, self.slot)? };
            state.current_image = image;
        }
        Ok(())
    }

    /// Stage 3: populate this frame's constant buffer.
    fn write_frame_constants(
        &mut self,
        swapchains: &[&Swapchain<B>],
        app_data: &[u8],
        delta_time: f32,
        time: f32,
    ) -> Result<()> {
        let now = Instant::now();
        let mut constants = FrameConstants::default();
        constants.frame_id = self.frame.submit_id as u32;
        constants.swapchain_count = swapchains.len() as u32;
        if let Some(first) = self.frame.first_submit {
            constants.time = now.duration_since(first).as_secs_f32();
        }
        if let Some(last) = self.frame.last_submit {
            constants.delta_time = now.duration_since(last).as_secs_f32();
        }
        if delta_time >= 0.0 {
            constants.delta_time = delta_time;
            constants.time = time;
        }
        for (i, swapchain) in swapchains.iter().enumerate() {
            let state = swapchain.inner.state.lock();
            let image = &state.images[state.current_image as usize];
            constants.swapchains[i * 2] = image.read_handle.0;
            constants.swapchains[i * 2 + 1] = image.write_handle.0;
        }
        constants.app_data[..app_data.len()].copy_from_slice(app_data);

        let ubo = Arc::clone(&self.frame.frame_data[self.slot]);
        let mapped = ubo.info.mapped.expect("frame constants not host-visible");
        unsafe {
            std::ptr::copy_nonoverlapping(
                &constants as *const FrameConstants as *const u8,
                mapped.0,
                std::mem::size_of::<FrameConstants>(),
            );
        }
        self.shared.flush_resource_ranges(
            &ubo.info,
            &[0..std::mem::size_of::<FrameConstants>() as u64],
        )?;
        Ok(())
    }

    /// Stage 4: lazily create (or reset) this slot's pool and open its
    /// command buffer, then bring the frame UBO into uniform-read state and
    /// bind the global descriptor sets.
    fn open(&mut self) -> Result<()> {
        let slot = self.slot;
        {
            let pool_slot = &mut self.frame.pools[slot];
            if pool_slot.pool.is_none() {
                let name = format!("graphics command pool (thread: 0, frame id: {})", slot);
                pool_slot.pool = Some(unsafe { self.shared.raw.create_command_pool(&name)? });
            } else {
                unsafe {
                    self.shared
                        .raw
                        .reset_command_pool(pool_slot.pool.as_mut().unwrap())?;
                }
            }
            if pool_slot.cmd.is_none() {
                pool_slot.cmd = Some(unsafe {
                    self.shared
                        .raw
                        .allocate_command_buffer(pool_slot.pool.as_mut().unwrap())?
                });
            }
        }
        let mut cmd = self.frame.pools[slot].cmd.take().expect("command buffer");
        unsafe { self.shared.raw.begin_command_buffer(&mut cmd)? };
        self.cmd = Some(cmd);
        self.bind_frame_state()?;
        Ok(())
    }

    fn bind_frame_state(&mut self) -> Result<()> {
        let shared = self.shared;
        let slot = self.slot;
        let ubo = Arc::clone(&self.frame.frame_data[slot]);
        let mut batch = BarrierBatch::new();
        {
            let mut track = ubo.track.lock();
            batch.transition_buffer(
                &mut track,
                ubo.raw(),
                0..ubo.info.size,
                PipelineStages::VERTEX_SHADER,
                Access::UNIFORM_READ,
            );
        }
        let cmd = self.cmd();
        if !batch.is_empty() {
            unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
        }
        drop(batch);
        let cmd = self.cmd.as_mut().expect("no open command buffer");
        unsafe { cmd.bind_frame_descriptors(&shared.raw, slot) };
        Ok(())
    }

    /// Mid-frame forced flush: submit what has been recorded, wait for it,
    /// reset the pool, re-open and re-bind. Cached translation state is
    /// zeroed because the fresh command buffer lost it.
    fn forced_flush(&mut self) -> Result<()> {
        if self.in_rendering {
            return Err(Error::InvalidOperation(
                "staging budget exhausted inside a rendering scope",
            ));
        }
        warn!(target: "grx::perf", "forced mid-frame flush (pending bytes {} / threshold {})",
            self.frame.pending_bytes, self.frame.flush_threshold);

        let mut cmd = self.cmd.take().expect("no open command buffer");
        unsafe {
            self.shared.raw.end_command_buffer(&mut cmd)?;
            let desc = SubmitDesc {
                wait_value: (self.frame.submit_id > 1).then(|| self.frame.submit_id - 1),
                signal_value: None,
                wait_swapchains: &[],
                frame_slot: self.slot,
                signal_present: false,
            };
            self.shared.raw.submit(Some(&cmd), &desc)?;
            self.shared.raw.wait_idle()?;
        }
        // The GPU consumed everything up to here; the ring slice and the
        // byte budget start over.
        self.frame.pending_bytes = 0;
        self.frame.pending_primitives = 0;
        self.frame.staging_allocs[self.slot].free_all();

        unsafe {
            self.shared
                .raw
                .reset_command_pool(self.frame.pools[self.slot].pool.as_mut().unwrap())?;
            self.shared.raw.begin_command_buffer(&mut cmd)?;
        }
        self.cmd = Some(cmd);
        self.cache = TranslateCache::default();
        self.bind_frame_state()?;
        Ok(())
    }

    fn check_budget(&mut self) -> Result<()> {
        if self.frame.pending_bytes >= self.frame.flush_threshold
            || self.frame.pending_primitives >= FLUSH_THRESHOLD_PRIMITIVES
        {
            self.forced_flush()?;
        }
        Ok(())
    }

    /// Stage 5: drain the slot's retention list and staging slice, then
    /// flush every pending upload and acceleration structure build.
    fn handle_next_frame(&mut self) -> Result<()> {
        self.frame.in_flight[self.slot].clear();
        self.retained.clear();
        self.frame.staging_allocs[self.slot].free_all();

        let buffers = std::mem::take(&mut self.frame.pending_buffers);
        for weak in buffers {
            if let Some(inner) = weak.upgrade() {
                self.flush_buffer(&inner)?;
            }
        }
        let textures = std::mem::take(&mut self.frame.pending_textures);
        for weak in textures {
            if let Some(inner) = weak.upgrade() {
                self.flush_texture(&inner)?;
            }
        }
        let blases = std::mem::take(&mut self.frame.pending_blas);
        for weak in blases {
            if let Some(inner) = weak.upgrade() {
                self.flush_blas(&inner)?;
            }
        }
        let tlases = std::mem::take(&mut self.frame.pending_tlas);
        for weak in tlases {
            if let Some(inner) = weak.upgrade() {
                self.flush_tlas(&inner)?;
            }
        }
        Ok(())
    }

    /// Allocate staging space for `size` bytes, growing the staging buffer
    /// once on ring exhaustion. Returns the byte offset inside the whole
    /// staging buffer.
    fn allocate_staging(&mut self, size: u64) -> Result<u64> {
        let slot = self.slot;
        if let Some(offset) = self.frame.staging_allocs[slot].allocate(size, 4, false) {
            return Ok(offset + slot as u64 * self.frame.staging_allocs[slot].len());
        }
        let old_size = self
            .frame
            .staging
            .as_ref()
            .map(|s| s.info.size)
            .unwrap_or(0);
        let new_size = old_size * 2 + size * 3;
        debug!("staging ring exhausted, growing {} -> {}", old_size, new_size);
        self.shared.resize_staging(self.frame, new_size)?;
        self.frame.staging_allocs[slot]
            .allocate(size, 4, false)
            .map(|offset| offset + slot as u64 * self.frame.staging_allocs[slot].len())
            .ok_or(Error::OutOfMemory("staging allocation after growth failed"))
    }

    /// Make sure the frame's staging slice is readable by copies and the
    /// buffer is retained for this frame.
    fn retain_staging(&mut self, batch_into_cmd: bool) -> Result<()> {
        let staging = Arc::clone(self.frame.staging.as_ref().expect("staging missing"));
        if !self.is_in_flight(Arc::as_ptr(&staging) as usize) {
            let slice = staging.info.size / FRAMES_IN_FLIGHT as u64;
            let mut batch = BarrierBatch::new();
            {
                let mut track = staging.track.lock();
                batch.transition_buffer(
                    &mut track,
                    staging.raw(),
                    self.slot as u64 * slice..(self.slot as u64 + 1) * slice,
                    PipelineStages::COPY,
                    Access::COPY_READ,
                );
            }
            if batch_into_cmd && !batch.is_empty() {
                let cmd = self.cmd();
                unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
            }
            drop(batch);
            self.push_in_flight(AnyResource::Buffer(Arc::clone(&staging)));
        }
        Ok(())
    }

    /// Flush one buffer's dirty ranges through the upload pipeline.
    fn flush_buffer(&mut self, inner: &Arc<BufferInner<B>>) -> Result<()> {
        let ranges;
        {
            let mut state = inner.state.lock();
            if state.pending.is_empty() {
                return Ok(());
            }
            merge_ranges(&mut state.pending);
            ranges = std::mem::take(&mut state.pending);
        }
        let in_flight = self.is_in_flight(Arc::as_ptr(inner) as usize);

        if !in_flight && inner.info.mapped.is_some() {
            // Host-visible and never seen by the GPU: write through the
            // mapping directly.
            let mapped = inner.info.mapped.unwrap();
            let state = inner.state.lock();
            let shadow = state.cpu_data.as_ref().expect("dirty without CPU data");
            for range in ranges.iter() {
                let len = (range.end - range.start) as usize;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        shadow.as_ptr().add(range.start as usize),
                        mapped.0.add(range.start as usize),
                        len,
                    );
                }
            }
            drop(state);
            self.shared.flush_resource_ranges(&inner.info, &ranges)?;
        } else {
            let total: u64 = ranges.iter().map(|r| r.end - r.start).sum();
            self.frame.pending_bytes += total;
            let staging_size = self
                .frame
                .staging
                .as_ref()
                .map(|s| s.info.size)
                .unwrap_or(0);

            if total >= staging_size / 4 {
                self.flush_buffer_dedicated(inner, &ranges, total)?;
            } else {
                self.flush_buffer_ring(inner, &ranges, total)?;
            }
        }

        let mut state = inner.state.lock();
        state.first_frame = false;
        if !inner.info.flags.contains(ResourceFlags::CPU_BACKED) {
            state.cpu_data = None;
        }
        drop(state);

        self.push_in_flight(AnyResource::Buffer(Arc::clone(inner)));
        self.check_budget()
    }

    /// Oversize path: one transient CPU-visible staging buffer, destroyed
    /// with the frame.
    fn flush_buffer_dedicated(
        &mut self,
        inner: &Arc<BufferInner<B>>,
        ranges: &[Range<u64>],
        total: u64,
    ) -> Result<()> {
        let staging = self.shared.create_buffer_inner(
            BufferUsage::empty(),
            ResourceFlags::INTERNAL_WEAK_DEVICE_REF | ResourceFlags::CPU_ALLOCATED,
            "dedicated staging buffer",
            total,
            None,
        )?;
        let mapped = staging.info.mapped.expect("staging not host-visible");

        let mut copies = SmallVec::<[BufferCopy; 8]>::new();
        let mut batch = BarrierBatch::new();
        {
            let state = inner.state.lock();
            let shadow = state.cpu_data.as_ref().expect("dirty without CPU data");
            let mut cursor = 0u64;
            for range in ranges {
                let len = range.end - range.start;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        shadow.as_ptr().add(range.start as usize),
                        mapped.0.add(cursor as usize),
                        len as usize,
                    );
                }
                copies.push(BufferCopy {
                    src_offset: cursor,
                    dst_offset: range.start,
                    size: len,
                });
                cursor += len;
            }
        }
        self.shared.flush_resource_ranges(&staging.info, &[0..total])?;

        {
            let mut track = inner.track.lock();
            for range in ranges {
                batch.transition_buffer(
                    &mut track,
                    inner.raw(),
                    range.clone(),
                    PipelineStages::COPY,
                    Access::COPY_WRITE,
                );
            }
        }
        {
            let mut track = staging.track.lock();
            batch.transition_buffer(
                &mut track,
                staging.raw(),
                0..total,
                PipelineStages::COPY,
                Access::COPY_READ,
            );
        }
        let cmd = self.cmd();
        if !batch.is_empty() {
            unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
        }
        unsafe { cmd.copy_buffer(staging.raw(), inner.raw(), &copies) };
        drop(batch);

        self.push_in_flight(AnyResource::Buffer(staging));
        Ok(())
    }

    /// Common path: pack the ranges into this frame's staging-ring slice.
    fn flush_buffer_ring(
        &mut self,
        inner: &Arc<BufferInner<B>>,
        ranges: &[Range<u64>],
        total: u64,
    ) -> Result<()> {
        let base = self.allocate_staging(total)?;
        let staging = Arc::clone(self.frame.staging.as_ref().expect("staging missing"));
        let mapped = staging.info.mapped.expect("staging not host-visible");

        let mut copies = SmallVec::<[BufferCopy; 8]>::new();
        {
            let state = inner.state.lock();
            let shadow = state.cpu_data.as_ref().expect("dirty without CPU data");
            let mut cursor = 0u64;
            for range in ranges {
                let len = range.end - range.start;
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        shadow.as_ptr().add(range.start as usize),
                        mapped.0.add((base + cursor) as usize),
                        len as usize,
                    );
                }
                copies.push(BufferCopy {
                    src_offset: base + cursor,
                    dst_offset: range.start,
                    size: len,
                });
                cursor += len;
            }
        }
        self.shared
            .flush_resource_ranges(&staging.info, &[base..base + total])?;

        let mut batch = BarrierBatch::new();
        {
            let mut track = inner.track.lock();
            for range in ranges {
                batch.transition_buffer(
                    &mut track,
                    inner.raw(),
                    range.clone(),
                    PipelineStages::COPY,
                    Access::COPY_WRITE,
                );
            }
        }
        let cmd = self.cmd();
        if !batch.is_empty() {
            unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
        }
        drop(batch);
        self.retain_staging(true)?;
        let cmd = self.cmd();
        unsafe { cmd.copy_buffer(staging.raw(), inner.raw(), &copies) };
        Ok(())
    }

    /// Flush one texture's dirty boxes through the staging ring, honoring
    /// the backend's row pitch alignment.
    fn flush_texture(&mut self, inner: &Arc<TextureInner<B>>) -> Result<()> {
        let boxes;
        {
            let mut state = inner.state.lock();
            if state.pending.is_empty() {
                return Ok(());
            }
            boxes = std::mem::take(&mut state.pending);
        }

        let desc = inner.desc;
        let fmt = desc.format.desc();
        let pitch_align = self
            .shared
            .info
            .limits
            .buffer_copy_pitch_alignment
            .max(1);

        // Staged size with padded rows.
        let mut regions = SmallVec::<[(crate::texture::TextureRange, u64, u64); 4]>::new();
        let mut total = 0u64;
        for b in boxes.iter() {
            let row_bytes = desc.format.layer_size(b.extent[0], 1, 1);
            let padded = (row_bytes + pitch_align - 1) / pitch_align * pitch_align;
            let rows = ((b.extent[1] + fmt.block_height - 1) / fmt.block_height) as u64;
            let size = padded * rows * b.extent[2] as u64;
            regions.push((*b, padded, total));
            total += (size + 3) & !3;
        }
        self.frame.pending_bytes += total;

        let staging_size = self
            .frame
            .staging
            .as_ref()
            .map(|s| s.info.size)
            .unwrap_or(0);
        let dedicated = total >= staging_size / 4;

        let (staging, base) = if dedicated {
            let staging = self.shared.create_buffer_inner(
                BufferUsage::empty(),
                ResourceFlags::INTERNAL_WEAK_DEVICE_REF | ResourceFlags::CPU_ALLOCATED,
                "dedicated staging buffer",
                total,
                None,
            )?;
            (staging, 0u64)
        } else {
            let base = self.allocate_staging(total)?;
            let staging = Arc::clone(self.frame.staging.as_ref().expect("staging missing"));
            (staging, base)
        };
        let mapped = staging.info.mapped.expect("staging not host-visible");

        // Copy rows with padding out of the tightly packed shadow.
        let mut copies = SmallVec::<[BufferImageCopy; 4]>::new();
        {
            let state = inner.state.lock();
            let shadow = state.cpu_data.as_ref().expect("dirty without CPU data");
            let image_row = desc.row_size();
            let image_slice = desc.format.layer_size(desc.width, desc.height, 1);
            for (b, padded, offset) in regions.iter() {
                let row_bytes = desc.format.layer_size(b.extent[0], 1, 1);
                let rows = (b.extent[1] + fmt.block_height - 1) / fmt.block_height;
                let x_bytes = (b.origin[0] / fmt.block_width) as u64 * fmt.bytes as u64;
                for z in 0..b.extent[2] {
                    for row in 0..rows {
                        let src_row = (b.origin[1] / fmt.block_height + row) as u64;
                        let src = (b.origin[2] as u64 + z as u64) * image_slice
                            + src_row * image_row
                            + x_bytes;
                        let dst = base
                            + offset
                            + (z as u64 * rows as u64 + row as u64) * padded;
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                shadow.as_ptr().add(src as usize),
                                mapped.0.add(dst as usize),
                                row_bytes as usize,
                            );
                        }
                    }
                }
                copies.push(BufferImageCopy {
                    buffer_offset: base + offset,
                    buffer_row_pitch: *padded,
                    origin: b.origin,
                    extent: b.extent,
                    mip: 0,
                    layer: 0,
                });
            }
        }
        self.shared
            .flush_resource_ranges(&staging.info, &[base..base + total])?;

        // Destination must be in copy-dst layout before the transfer.
        let mut batch = BarrierBatch::new();
        {
            let mut track = inner.track.lock();
            batch.transition_image(
                &mut track,
                inner.raw(),
                SubresourceRange::COLOR,
                PipelineStages::COPY,
                Access::COPY_WRITE,
                ImageLayout::CopyDst,
            );
        }
        if dedicated {
            let mut track = staging.track.lock();
            batch.transition_buffer(
                &mut track,
                staging.raw(),
                0..total,
                PipelineStages::COPY,
                Access::COPY_READ,
            );
        }
        let cmd = self.cmd();
        if !batch.is_empty() {
            unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
        }
        drop(batch);
        if !dedicated {
            self.retain_staging(true)?;
        }
        let cmd = self.cmd();
        unsafe { cmd.copy_buffer_to_image(staging.raw(), inner.raw(), &desc, &copies) };

        if dedicated {
            self.push_in_flight(AnyResource::Buffer(staging));
        }

        let mut state = inner.state.lock();
        state.first_frame = false;
        if !inner.info.flags.contains(ResourceFlags::CPU_BACKED) {
            state.cpu_data = None;
        }
        drop(state);

        self.push_in_flight(AnyResource::Texture(Arc::clone(inner)));
        self.check_budget()
    }

    /// Record one BLAS build.
    fn flush_blas(&mut self, inner: &Arc<BlasInner<B>>) -> Result<()> {
        let completed = inner.completed.load(std::sync::atomic::Ordering::Acquire);
        if completed && !inner.flags.contains(RtasBuildFlags::ALLOW_UPDATE) {
            return Ok(());
        }
        let scratch = inner
            .scratch
            .lock()
            .clone()
            .ok_or(Error::InvalidState("BLAS scratch buffer already released"))?;

        // A refit sources either the named parent or, once built, the
        // structure itself.
        let refit = inner.flags.contains(RtasBuildFlags::IS_UPDATE) || completed;
        let input_buffers = blas_input_buffers(inner);
        let mut batch = BarrierBatch::new();
        {
            let mut track = scratch.track.lock();
            batch.transition_buffer(
                &mut track,
                scratch.raw(),
                0..scratch.info.size,
                PipelineStages::AS_BUILD,
                Access::AS_WRITE,
            );
        }
        {
            let mut track = inner.backing.track.lock();
            batch.transition_buffer(
                &mut track,
                inner.backing.raw(),
                0..inner.backing.info.size,
                PipelineStages::AS_BUILD,
                Access::AS_WRITE,
            );
        }
        if let Some(parent) = &inner.parent {
            if !Arc::ptr_eq(parent, inner) {
                let mut track = parent.backing.track.lock();
                batch.transition_buffer(
                    &mut track,
                    parent.backing.raw(),
                    0..parent.backing.info.size,
                    PipelineStages::AS_BUILD,
                    Access::AS_READ,
                );
            }
        }
        // Geometry inputs are read by the build.
        for buffer in input_buffers.iter() {
            let mut track = buffer.track.lock();
            batch.transition_buffer(
                &mut track,
                buffer.raw(),
                0..buffer.info.size,
                PipelineStages::AS_BUILD,
                Access::AS_READ,
            );
        }

        let cmd = self.cmd();
        if !batch.is_empty() {
            unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
        }
        drop(batch);

        let src = if refit {
            Some(
                inner
                    .parent
                    .as_ref()
                    .map(|p| p.raw())
                    .unwrap_or_else(|| inner.raw()),
            )
        } else {
            None
        };
        let build = RtasBuildCmd {
            inputs: RtasBuildInputs {
                top_level: false,
                flags: inner.flags,
                geometry: geometry_ref(&inner.geometry),
                primitive_count: inner.primitives,
            },
            src,
            dst: inner.raw(),
            scratch: scratch.raw(),
            scratch_offset: 0,
        };
        let cmd = self.cmd();
        unsafe { cmd.build_rtas(&build) };
        drop(build);

        inner
            .completed
            .store(true, std::sync::atomic::Ordering::Release);
        self.frame.pending_primitives += inner.primitives as u64;

        self.push_in_flight(AnyResource::Buffer(Arc::clone(&inner.backing)));
        self.push_in_flight(AnyResource::Buffer(Arc::clone(&scratch)));
        self.push_in_flight(AnyResource::Blas(Arc::clone(inner)));
        if !inner.flags.contains(RtasBuildFlags::ALLOW_UPDATE) {
            *inner.scratch.lock() = None;
        }
        self.check_budget()
    }

    /// Record one TLAS build, marshalling CPU instances into a transient
    /// device buffer with BLAS references resolved to GPU addresses.
    fn flush_tlas(&mut self, inner: &Arc<TlasInner<B>>) -> Result<()> {
        let completed = inner.completed.load(std::sync::atomic::Ordering::Acquire);
        if completed && !inner.flags.contains(RtasBuildFlags::ALLOW_UPDATE) {
            return Ok(());
        }
        let scratch = inner
            .scratch
            .lock()
            .clone()
            .ok_or(Error::InvalidState("TLAS scratch buffer already released"))?;

        // Resolve the instance source.
        let (instance_buffer, instance_offset, motion) = match &inner.instances {
            TlasInstances::Device {
                buffer,
                offset,
                motion,
                ..
            } => (Arc::clone(&buffer.inner), *offset, *motion),
            TlasInstances::Static(instances) => {
                let mut records = Vec::with_capacity(instances.len() * 64);
                for instance in instances {
                    let record =
                        pack_static_instance(instance, instance.header.blas.device_address())?;
                    records.extend_from_slice(&record);
                }
                let size = (records.len() as u64).max(INSTANCE_RECORD_SIZE);
                records.resize(size as usize, 0);
                let buffer = self.shared.create_buffer_inner(
                    BufferUsage::AS_READ,
                    ResourceFlags::INTERNAL_WEAK_DEVICE_REF | ResourceFlags::CPU_ALLOCATED,
                    "TLAS instance buffer",
                    size,
                    None,
                )?;
                let mapped = buffer.info.mapped.expect("instance buffer not mapped");
                unsafe {
                    std::ptr::copy_nonoverlapping(records.as_ptr(), mapped.0, records.len());
                }
                self.shared.flush_resource_ranges(&buffer.info, &[0..size])?;
                (buffer, 0, false)
            }
            TlasInstances::Motion(instances) => {
                let mut records = Vec::with_capacity(instances.len() * 160);
                for instance in instances {
                    let record =
                        pack_motion_instance(instance, instance.header.blas.device_address())?;
                    records.extend_from_slice(&record);
                }
                let size = (records.len() as u64).max(MOTION_INSTANCE_RECORD_SIZE);
                records.resize(size as usize, 0);
                let buffer = self.shared.create_buffer_inner(
                    BufferUsage::AS_READ,
                    ResourceFlags::INTERNAL_WEAK_DEVICE_REF | ResourceFlags::CPU_ALLOCATED,
                    "TLAS motion instance buffer",
                    size,
                    None,
                )?;
                let mapped = buffer.info.mapped.expect("instance buffer not mapped");
                unsafe {
                    std::ptr::copy_nonoverlapping(records.as_ptr(), mapped.0, records.len());
                }
                self.shared.flush_resource_ranges(&buffer.info, &[0..size])?;
                (buffer, 0, true)
            }
        };

        let refit = inner.flags.contains(RtasBuildFlags::IS_UPDATE) || completed;
        let mut batch = BarrierBatch::new();
        {
            let mut track = instance_buffer.track.lock();
            batch.transition_buffer(
                &mut track,
                instance_buffer.raw(),
                0..instance_buffer.info.size,
                PipelineStages::AS_BUILD,
                Access::AS_READ,
            );
        }
        {
            let mut track = scratch.track.lock();
            batch.transition_buffer(
                &mut track,
                scratch.raw(),
                0..scratch.info.size,
                PipelineStages::AS_BUILD,
                Access::AS_WRITE,
            );
        }
        {
            let mut track = inner.backing.track.lock();
            batch.transition_buffer(
                &mut track,
                inner.backing.raw(),
                0..inner.backing.info.size,
                PipelineStages::AS_BUILD,
                Access::AS_WRITE,
            );
        }
        if let Some(parent) = &inner.parent {
            if !Arc::ptr_eq(parent, inner) {
                let mut track = parent.backing.track.lock();
                batch.transition_buffer(
                    &mut track,
                    parent.backing.raw(),
                    0..parent.backing.info.size,
                    PipelineStages::AS_BUILD,
                    Access::AS_READ,
                );
            }
        }
        let cmd = self.cmd();
        if !batch.is_empty() {
            unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
        }
        drop(batch);

        let src = if refit {
            Some(
                inner
                    .parent
                    .as_ref()
                    .map(|p| p.raw())
                    .unwrap_or_else(|| inner.raw()),
            )
        } else {
            None
        };
        let build = RtasBuildCmd {
            inputs: RtasBuildInputs {
                top_level: true,
                flags: inner.flags,
                geometry: RtasGeometryRef::Instances {
                    buffer: instance_buffer.raw(),
                    offset: instance_offset,
                    motion,
                },
                primitive_count: inner.instances.count() as u32,
            },
            src,
            dst: inner.raw(),
            scratch: scratch.raw(),
            scratch_offset: 0,
        };
        let cmd = self.cmd();
        unsafe { cmd.build_rtas(&build) };
        drop(build);

        inner
            .completed
            .store(true, std::sync::atomic::Ordering::Release);
        self.frame.pending_primitives += inner.instances.count() as u64;

        self.push_in_flight(AnyResource::Buffer(instance_buffer));
        self.push_in_flight(AnyResource::Buffer(Arc::clone(&inner.backing)));
        self.push_in_flight(AnyResource::Buffer(Arc::clone(&scratch)));
        self.push_in_flight(AnyResource::Tlas(Arc::clone(inner)));
        if !inner.flags.contains(RtasBuildFlags::ALLOW_UPDATE) {
            *inner.scratch.lock() = None;
        }
        self.check_budget()
    }

    /// Stage 6: lower every portable op into backend calls.
    fn translate_lists(&mut self, lists: &[&CommandList<B>]) -> Result<()> {
        for list in lists {
            // Per-list state reset.
            self.cache = TranslateCache::default();
            let state = list.inner.state.lock();
            for op in state.ops.iter() {
                self.translate_op(op)?;
            }
        }
        Ok(())
    }

    fn commit_graphics(&mut self) -> Result<()> {
        let pipeline = self
            .cache
            .pipeline
            .clone()
            .ok_or(Error::InvalidOperation("draw without a pipeline"))?;
        if pipeline.kind != PipelineKind::Graphics {
            return Err(Error::InvalidOperation("bound pipeline is not graphics"));
        }
        let id = Arc::as_ptr(&pipeline) as usize;
        if self.cache.committed_pipeline[kind_index(PipelineKind::Graphics)] != Some(id) {
            let cmd = self.cmd();
            unsafe { cmd.bind_pipeline(PipelineKind::Graphics, pipeline.raw()) };
            self.cache.committed_pipeline[kind_index(PipelineKind::Graphics)] = Some(id);
        }
        if let Some(viewport) = self.cache.viewport {
            if self.cache.committed_viewport != Some(viewport) {
                let cmd = self.cmd();
                unsafe { cmd.set_viewport(&viewport) };
                self.cache.committed_viewport = Some(viewport);
            }
        }
        if let Some(scissor) = self.cache.scissor {
            if self.cache.committed_scissor != Some(scissor) {
                let cmd = self.cmd();
                unsafe { cmd.set_scissor(&scissor) };
                self.cache.committed_scissor = Some(scissor);
            }
        }
        if self.cache.committed_stencil != Some(self.cache.stencil) {
            let stencil = self.cache.stencil;
            let cmd = self.cmd();
            unsafe { cmd.set_stencil_reference(stencil) };
            self.cache.committed_stencil = Some(stencil);
        }
        if self.cache.committed_blend != Some(self.cache.blend) {
            let blend = self.cache.blend;
            let cmd = self.cmd();
            unsafe { cmd.set_blend_constants(blend) };
            self.cache.committed_blend = Some(blend);
        }
        if let Some((buffer, offset, format)) = self.cache.index.clone() {
            let id = Arc::as_ptr(&buffer) as usize;
            if self.cache.committed_index != Some((id, offset, format)) {
                let cmd = self.cmd();
                unsafe { cmd.bind_index_buffer(buffer.raw(), offset, format) };
                self.cache.committed_index = Some((id, offset, format));
            }
        }
        if let Some((buffer, range)) = self.cache.vertex.clone() {
            let id = Arc::as_ptr(&buffer) as usize;
            if self.cache.committed_vertex != Some((id, range.start, range.end)) {
                let cmd = self.cmd();
                unsafe { cmd.bind_vertex_buffers(0, &[(buffer.raw(), range.start)]) };
                self.cache.committed_vertex = Some((id, range.start, range.end));
            }
        }
        Ok(())
    }

    fn commit_pipeline(&mut self, kind: PipelineKind) -> Result<Arc<PipelineInner<B>>> {
        let pipeline = self
            .cache
            .pipeline
            .clone()
            .ok_or(Error::InvalidOperation("dispatch without a pipeline"))?;
        if pipeline.kind != kind {
            return Err(Error::InvalidOperation(
                "bound pipeline does not match the dispatch kind",
            ));
        }
        let id = Arc::as_ptr(&pipeline) as usize;
        if self.cache.committed_pipeline[kind_index(kind)] != Some(id) {
            let cmd = self.cmd();
            unsafe { cmd.bind_pipeline(kind, pipeline.raw()) };
            self.cache.committed_pipeline[kind_index(kind)] = Some(id);
        }
        Ok(pipeline)
    }

    fn sbt_regions(
        &mut self,
        pipeline: &Arc<PipelineInner<B>>,
        raygen_id: u32,
    ) -> Result<crate::backend::SbtRegions> {
        let sbt = pipeline
            .sbt
            .as_ref()
            .ok_or(Error::InvalidState("raytracing pipeline without an SBT"))?;
        if raygen_id >= pipeline.sbt_layout.raygen_count {
            return Err(Error::OutOfBounds("raygen id exceeds group count"));
        }
        Ok(pipeline
            .sbt_layout
            .regions(sbt.info.device_address, raygen_id))
    }

    fn translate_op(&mut self, op: &CommandOp<B>) -> Result<()> {
        match op {
            CommandOp::SetViewport(viewport) => self.cache.viewport = Some(*viewport),
            CommandOp::SetScissor(rect) => self.cache.scissor = Some(*rect),
            CommandOp::SetStencilRef(value) => self.cache.stencil = *value,
            CommandOp::SetBlendConstants(constants) => self.cache.blend = *constants,
            CommandOp::SetPipeline(pipeline) => self.cache.pipeline = Some(Arc::clone(pipeline)),
            CommandOp::SetPrimitiveBuffers { vertex, index } => {
                self.cache.vertex = vertex
                    .as_ref()
                    .map(|(b, r)| (Arc::clone(b), r.clone()));
                self.cache.index = index
                    .as_ref()
                    .map(|(b, o, f)| (Arc::clone(b), *o, *f));
            }

            CommandOp::StartScope(transitions) => self.translate_scope(transitions)?,
            CommandOp::EndScope => {}

            CommandOp::ClearImage(texture, value) => {
                let mut batch = BarrierBatch::new();
                {
                    let mut track = texture.track.lock();
                    batch.transition_image(
                        &mut track,
                        texture.raw(),
                        SubresourceRange::COLOR,
                        PipelineStages::COPY,
                        Access::COPY_WRITE,
                        ImageLayout::CopyDst,
                    );
                }
                let cmd = self.cmd();
                if !batch.is_empty() {
                    unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
                }
                unsafe { cmd.clear_image(texture.raw(), *value, SubresourceRange::COLOR) };
            }
            CommandOp::CopyImage { src, dst, regions } => {
                let mut batch = BarrierBatch::new();
                {
                    let mut track = src.track.lock();
                    batch.transition_image(
                        &mut track,
                        src.raw(),
                        SubresourceRange::COLOR,
                        PipelineStages::COPY,
                        Access::COPY_READ,
                        ImageLayout::CopySrc,
                    );
                }
                {
                    let mut track = dst.track.lock();
                    batch.transition_image(
                        &mut track,
                        dst.raw(),
                        SubresourceRange::COLOR,
                        PipelineStages::COPY,
                        Access::COPY_WRITE,
                        ImageLayout::CopyDst,
                    );
                }
                let cmd = self.cmd();
                if !batch.is_empty() {
                    unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
                }
                unsafe { cmd.copy_image(src.raw(), dst.raw(), regions) };
            }

            CommandOp::StartRendering(info) => {
                self.in_rendering = true;
                let mut colors = SmallVec::<[RenderingAttachment<B>; 4]>::new();
                for target in info.colors.iter() {
                    colors.push(rendering_attachment(target));
                }
                let depth = info.depth.as_ref().map(rendering_attachment);
                let stencil = info.stencil.as_ref().map(rendering_attachment);
                let desc = RenderingDesc {
                    colors: &colors,
                    depth,
                    stencil,
                    area: info.area,
                };
                let cmd = self.cmd();
                unsafe { cmd.begin_rendering(&desc) };
            }
            CommandOp::EndRendering => {
                self.in_rendering = false;
                let cmd = self.cmd();
                unsafe { cmd.end_rendering() };
            }

            CommandOp::Draw(args) => {
                self.commit_graphics()?;
                let cmd = self.cmd();
                unsafe { cmd.draw(args) };
            }
            CommandOp::DrawIndirect {
                buffer,
                offset,
                draw_count,
                stride,
                indexed,
            } => {
                self.commit_graphics()?;
                let cmd = self.cmd();
                unsafe { cmd.draw_indirect(buffer.raw(), *offset, *draw_count, *stride, *indexed) };
            }
            CommandOp::DrawIndirectCount {
                buffer,
                offset,
                count_buffer,
                count_offset,
                max_draw_count,
                stride,
                indexed,
            } => {
                self.commit_graphics()?;
                let cmd = self.cmd();
                unsafe {
                    cmd.draw_indirect_count(
                        buffer.raw(),
                        *offset,
                        count_buffer.raw(),
                        *count_offset,
                        *max_draw_count,
                        *stride,
                        *indexed,
                    )
                };
            }
            CommandOp::Dispatch(groups) => {
                self.commit_pipeline(PipelineKind::Compute)?;
                let cmd = self.cmd();
                unsafe { cmd.dispatch(*groups) };
            }
            CommandOp::DispatchIndirect { buffer, offset } => {
                self.commit_pipeline(PipelineKind::Compute)?;
                let cmd = self.cmd();
                unsafe { cmd.dispatch_indirect(buffer.raw(), *offset) };
            }
            CommandOp::DispatchRays { extent, raygen_id } => {
                let pipeline = self.commit_pipeline(PipelineKind::RayTracing)?;
                let regions = self.sbt_regions(&pipeline, *raygen_id)?;
                let cmd = self.cmd();
                unsafe { cmd.trace_rays(&regions, *extent) };
            }
            CommandOp::DispatchRaysIndirect {
                buffer,
                offset,
                raygen_id,
            } => {
                let pipeline = self.commit_pipeline(PipelineKind::RayTracing)?;
                let regions = self.sbt_regions(&pipeline, *raygen_id)?;
                let address = buffer.info.device_address + offset;
                let cmd = self.cmd();
                unsafe { cmd.trace_rays_indirect(&regions, address) };
            }

            CommandOp::UpdateBlas(blas) => self.flush_blas(blas)?,
            CommandOp::UpdateTlas(tlas) => self.flush_tlas(tlas)?,

            CommandOp::StartDebugRegion(name, color) => {
                let cmd = self.cmd();
                unsafe { cmd.begin_debug_region(name, *color) };
            }
            CommandOp::EndDebugRegion => {
                let cmd = self.cmd();
                unsafe { cmd.end_debug_region() };
            }
            CommandOp::AddDebugMarker(name) => {
                let cmd = self.cmd();
                unsafe { cmd.insert_debug_marker(name) };
            }
        }
        Ok(())
    }

    /// Lower one scope's transition list into a single grouped dependency.
    fn translate_scope(&mut self, transitions: &[ScopeTransition<B>]) -> Result<()> {
        // CPU-built TLAS instance lists also expose every referenced BLAS
        // to traversal; collect them first so the barrier records can
        // borrow their backing buffers.
        let mut held_blases: SmallVec<[(Arc<BlasInner<B>>, crate::barrier::StageHint); 8]> =
            SmallVec::new();
        for transition in transitions {
            if let TransitionResource::Tlas(tlas) = &transition.resource {
                for blas in tlas_cpu_blases(tlas) {
                    held_blases.push((blas, transition.stage));
                }
            }
        }

        let mut batch = BarrierBatch::new();
        for transition in transitions {
            match &transition.resource {
                TransitionResource::Buffer(buffer, range) => {
                    let (stages, access, _) =
                        resolve_transition(transition.ty, transition.stage, false);
                    let mut track = buffer.track.lock();
                    batch.transition_buffer(
                        &mut track,
                        buffer.raw(),
                        range.clone(),
                        stages,
                        access,
                    );
                }
                TransitionResource::Texture(texture) => {
                    let (stages, access, layout) =
                        resolve_transition(transition.ty, transition.stage, true);
                    let mut track = texture.track.lock();
                    batch.transition_image(
                        &mut track,
                        texture.raw(),
                        SubresourceRange::COLOR,
                        stages,
                        access,
                        layout,
                    );
                }
                TransitionResource::Swapchain(swapchain) => {
                    let (stages, access, layout) =
                        resolve_transition(transition.ty, transition.stage, true);
                    let state = swapchain.state.lock();
                    let index = state.current_image as usize;
                    let image: *const B::Image = &state.images[index].raw;
                    let mut track = state.images[index].track.lock();
                    batch.transition_image(
                        &mut track,
                        unsafe { &*image },
                        SubresourceRange::COLOR,
                        stages,
                        access,
                        layout,
                    );
                    drop(track);
                    drop(state);
                }
                TransitionResource::Tlas(tlas) => {
                    let (stages, access, _) =
                        resolve_transition(TransitionType::RtasRead, transition.stage, false);
                    {
                        let mut track = tlas.backing.track.lock();
                        batch.transition_buffer(
                            &mut track,
                            tlas.backing.raw(),
                            0..tlas.backing.info.size,
                            stages,
                            access,
                        );
                    }
                }
            }
        }
        for (blas, stage) in held_blases.iter() {
            let (stages, access, _) = resolve_transition(TransitionType::RtasRead, *stage, false);
            let mut track = blas.backing.track.lock();
            batch.transition_buffer(
                &mut track,
                blas.backing.raw(),
                0..blas.backing.info.size,
                stages,
                access,
            );
        }
        let cmd = self.cmd();
        if !batch.is_empty() {
            unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
        }
        Ok(())
    }

    /// Stage 7: transition every bound swapchain image to the present
    /// layout and retain the swapchains for this frame.
    fn present_layouts(&mut self, swapchains: &[&Swapchain<B>]) -> Result<()> {
        let mut batch = BarrierBatch::new();
        for swapchain in swapchains {
            let state = swapchain.inner.state.lock();
            let index = state.current_image as usize;
            let image: *const B::Image = &state.images[index].raw;
            let mut track = state.images[index].track.lock();
            batch.transition_image(
                &mut track,
                unsafe { &*image },
                SubresourceRange::COLOR,
                PipelineStages::BOTTOM,
                Access::empty(),
                ImageLayout::Present,
            );
        }
        let cmd = self.cmd();
        if !batch.is_empty() {
            unsafe { cmd.pipeline_barrier(&batch.buffers, &batch.images) };
        }
        drop(batch);
        for swapchain in swapchains {
            self.push_in_flight(AnyResource::Swapchain(Arc::clone(&swapchain.inner)));
        }
        Ok(())
    }

    /// Stages 8-10: close, submit with timeline fencing, present.
    fn close_and_submit(&mut self, swapchains: &[&Swapchain<B>]) -> Result<()> {
        let mut cmd = self.cmd.take().expect("no open command buffer");
        unsafe { self.shared.raw.end_command_buffer(&mut cmd)? };

        let states: Vec<_> = swapchains.iter().map(|s| s.inner.state.lock()).collect();
        let raws: ArrayVec<[&B::Swapchain; crate::device::MAX_SWAPCHAINS]> = states
            .iter()
            .map(|s| s.raw.as_ref().expect("swapchain destroyed"))
            .collect();

        let desc = SubmitDesc {
            wait_value: (self.frame.submit_id > FRAMES_IN_FLIGHT as u64)
                .then(|| self.frame.submit_id - FRAMES_IN_FLIGHT as u64),
            signal_value: Some(self.frame.submit_id),
            wait_swapchains: &raws,
            frame_slot: self.slot,
            signal_present: !swapchains.is_empty(),
        };
        let submitted = unsafe { self.shared.raw.submit(Some(&cmd), &desc) };
        if let Err(e) = submitted {
            self.shared.mark_lost();
            return Err(e);
        }

        if !swapchains.is_empty() {
            let tearing = states
                .iter()
                .any(|s| s.present_mode == crate::swapchain::PresentMode::Immediate);
            let present: ArrayVec<[(&B::Swapchain, u32); crate::device::MAX_SWAPCHAINS]> = states
                .iter()
                .map(|s| (s.raw.as_ref().unwrap(), s.current_image))
                .collect();
            unsafe { self.shared.raw.present(&present, self.slot, tearing)? };
        }

        // Return the command buffer to its slot for reuse.
        self.frame.pools[self.slot].cmd = Some(cmd);
        Ok(())
    }
}

fn rendering_attachment<'t, B: Backend>(
    target: &'t crate::cmd::RenderTarget<B>,
) -> RenderingAttachment<'t, B> {
    let image: &'t B::Image = match &target.target {
        RenderTargetRef::Texture(texture) => texture.raw(),
        RenderTargetRef::Swapchain(swapchain) => {
            let state = swapchain.state.lock();
            let index = state.current_image as usize;
            // The image outlives the state guard; the lock only protects
            // the acquired-image index.
            let raw: *const B::Image = &state.images[index].raw;
            unsafe { &*raw }
        }
    };
    RenderingAttachment {
        image,
        load: target.load,
        store: target.store,
        clear: target.clear,
        resolve: target.resolve.as_deref().map(|t| t.raw()),
    }
}

fn blas_input_buffers<B: Backend>(inner: &BlasInner<B>) -> SmallVec<[Arc<BufferInner<B>>; 2]> {
    let mut buffers = SmallVec::new();
    match &inner.geometry {
        crate::rtas::BlasGeometry::Triangles {
            positions, indices, ..
        } => {
            buffers.push(Arc::clone(&positions.inner));
            if let Some((index_buffer, _, _)) = indices {
                buffers.push(Arc::clone(&index_buffer.inner));
            }
        }
        crate::rtas::BlasGeometry::Aabbs { buffer, .. } => {
            buffers.push(Arc::clone(&buffer.inner));
        }
    }
    buffers
}

fn tlas_cpu_blases<B: Backend>(inner: &TlasInner<B>) -> SmallVec<[Arc<BlasInner<B>>; 8]> {
    let mut blases = SmallVec::new();
    match &inner.instances {
        TlasInstances::Static(instances) => {
            for instance in instances {
                blases.push(Arc::clone(&instance.header.blas.inner));
            }
        }
        TlasInstances::Motion(instances) => {
            for instance in instances {
                blases.push(Arc::clone(&instance.header.blas.inner));
            }
        }
        TlasInstances::Device { .. } => {}
    }
    blases
}

impl<B: Backend> DeviceShared<B> {
    /// Flush written ranges of a host-visible, possibly non-coherent
    /// resource.
    pub(crate) fn flush_resource_ranges(
        &self,
        info: &ResourceInfo,
        ranges: &[Range<u64>],
    ) -> Result<()> {
        let allocator = self.allocator.lock();
        let block = allocator.block(info.block_id);
        if block.flags.contains(crate::memory::MemoryFlags::HOST_VISIBLE)
            && !block.flags.contains(crate::memory::MemoryFlags::COHERENT)
        {
            let shifted: Vec<Range<u64>> = ranges
                .iter()
                .map(|r| info.block_offset + r.start..info.block_offset + r.end)
                .collect();
            unsafe { self.raw.flush_mapped(block.raw(), &shifted)? };
        }
        Ok(())
    }
}

impl<B: Backend> Device<B> {
    /// Submit recorded command lists and present the given swapchains.
    ///
    /// Drives one full frame of the scheduler: waits for frame
    /// `submit_id - 3`, drains that slot's retention list, flushes pending
    /// uploads and builds, translates the lists, presents and advances the
    /// timeline.
    pub fn submit(
        &self,
        lists: &[&CommandList<B>],
        swapchains: &[&Swapchain<B>],
        app_data: &[u8],
        delta_time: f32,
        time: f32,
    ) -> Result<()> {
        self.shared.check_not_lost()?;
        if lists.is_empty() && swapchains.is_empty() {
            return Err(Error::InvalidOperation(
                "submit requires command lists or swapchains",
            ));
        }
        if swapchains.len() > MAX_SWAPCHAINS {
            return Err(Error::InvalidParameter("swapchain count is limited to 16"));
        }
        if app_data.len() > APP_DATA_SIZE {
            return Err(Error::InvalidParameter("app data is limited to 368 bytes"));
        }
        for (i, swapchain) in swapchains.iter().enumerate() {
            for other in swapchains.iter().skip(i + 1) {
                if Arc::ptr_eq(&swapchain.inner, &other.inner) {
                    return Err(Error::InvalidParameter("swapchain is duplicated"));
                }
            }
        }
        for (i, list) in lists.iter().enumerate() {
            if !Arc::ptr_eq(&list.inner.device, &self.shared) {
                return Err(Error::UnsupportedOperation(
                    "command list belongs to a different device",
                ));
            }
            for other in lists.iter().skip(i + 1) {
                if Arc::ptr_eq(&list.inner, &other.inner) {
                    return Err(Error::InvalidParameter("command list is duplicated"));
                }
            }
        }

        let mut frame = self.shared.frame.lock();

        // Keep every list locked across the submission.
        let _list_guards: Vec<_> = lists
            .iter()
            .map(|list| list.inner.submit_lock.lock())
            .collect();

        for list in lists {
            let state = list.inner.state.lock();
            if state.record != RecordState::Closed {
                return Err(Error::InvalidParameter(
                    "command list was not closed before submit",
                ));
            }
            // A swapchain resized after recording leaves stale captures.
            for swapchain in swapchains {
                for (captured, version) in state.active_swapchains.iter() {
                    if Arc::ptr_eq(captured, &swapchain.inner)
                        && *version != swapchain.inner.state.lock().version
                    {
                        return Err(Error::InvalidState(
                            "submitted command list captured an outdated swapchain version",
                        ));
                    }
                }
            }
        }

        let slot = frame.slot();
        let mut ctx = FrameContext {
            shared: &self.shared,
            frame: &mut frame,
            slot,
            cmd: None,
            cache: TranslateCache::default(),
            retained: FnvHashSet::default(),
            in_rendering: false,
        };

        ctx.begin_frame()?;
        ctx.acquire_swapchains(swapchains)?;
        ctx.write_frame_constants(swapchains, app_data, delta_time, time)?;
        ctx.open()?;
        ctx.handle_next_frame()?;
        ctx.translate_lists(lists)?;
        ctx.present_layouts(swapchains)?;
        ctx.close_and_submit(swapchains)?;

        // Retain every resource the lists referenced.
        for list in lists {
            let state = list.inner.state.lock();
            for resource in state.resources.iter() {
                ctx.push_in_flight(resource.clone());
            }
        }
        drop(ctx);

        let now = Instant::now();
        frame.submit_id += 1;
        frame.last_submit = Some(now);
        if frame.first_submit.is_none() {
            frame.first_submit = Some(now);
        }
        frame.pending_bytes = 0;
        frame.pending_primitives = 0;
        Ok(())
    }

    /// Wait for every in-flight frame, then drain all three retention
    /// lists and staging slices.
    pub fn wait(&self) -> Result<()> {
        let mut frame = self.shared.frame.lock();
        unsafe {
            if frame.submit_id > 1 {
                self.shared.raw.wait_timeline(frame.submit_id - 1)?;
            }
            self.shared.raw.wait_idle()?;
        }
        for slot in frame.in_flight.iter_mut() {
            slot.clear();
        }
        for alloc in frame.staging_allocs.iter_mut() {
            alloc.free_all();
        }
        Ok(())
    }
}
