//! Device buffers.
//!
//! A buffer optionally keeps a CPU shadow copy; writes go into the shadow
//! and are tracked as dirty ranges. At the next submit the pending ranges
//! are either memcpy'd straight into mapped memory (host-visible resources
//! that never entered a frame) or staged through the upload pipeline.

use std::{ops::Range, sync::Arc};

use parking_lot::Mutex;

use crate::{
    backend::BackendDevice,
    barrier::ResourceState,
    error::{Error, Result},
    resource::{DeviceRef, ResourceInfo},
    Backend,
};

bitflags! {
    /// Buffer usage selected at creation.
    pub struct BufferUsage: u32 {
        /// Vertex fetch.
        const VERTEX = 0x1;
        /// Index fetch.
        const INDEX = 0x2;
        /// Indirect argument source.
        const INDIRECT = 0x4;
        /// Acceleration structure scratch space.
        const SCRATCH = 0x8;
        /// Acceleration structure storage.
        const AS = 0x10;
        /// Acceleration structure build input.
        const AS_READ = 0x20;
        /// Shader binding table.
        const SBT = 0x40;
    }
}

pub(crate) struct BufferState {
    /// CPU shadow; dropped after first upload unless `CPU_BACKED`.
    pub cpu_data: Option<Vec<u8>>,
    /// Dirty ranges accumulated since the last flush.
    pub pending: Vec<Range<u64>>,
    /// The buffer has not been submitted yet; enables the direct
    /// mapped-memory fast path.
    pub first_frame: bool,
}

pub(crate) struct BufferInner<B: Backend> {
    pub(crate) info: ResourceInfo,
    pub(crate) usage: BufferUsage,
    pub(crate) raw: Option<B::Buffer>,
    pub(crate) state: Mutex<BufferState>,
    pub(crate) track: Mutex<ResourceState>,
    pub(crate) device: DeviceRef<B>,
}

impl<B: Backend> BufferInner<B> {
    pub(crate) fn raw(&self) -> &B::Buffer {
        self.raw.as_ref().expect("buffer already destroyed")
    }

    /// Record a dirty range, merging overlaps as they accumulate.
    pub(crate) fn mark_dirty(&self, offset: u64, mut len: u64) -> Result<()> {
        if len == 0 {
            len = self.info.size.saturating_sub(offset);
        }
        if offset + len > self.info.size {
            return Err(Error::OutOfBounds("dirty range exceeds buffer size"));
        }
        let mut state = self.state.lock();
        if state.cpu_data.is_none() {
            return Err(Error::InvalidOperation(
                "buffer has no CPU data to mark dirty",
            ));
        }
        state.pending.push(offset..offset + len);
        merge_ranges(&mut state.pending);
        Ok(())
    }
}

impl<B: Backend> Drop for BufferInner<B> {
    fn drop(&mut self) {
        let device = match self.device.upgrade() {
            Some(device) if !device.is_torn_down() => device,
            _ => return,
        };
        device.free_handles(&self.info.handles());
        if let Some(raw) = self.raw.take() {
            unsafe { device.raw().destroy_buffer(raw) };
        }
        if self.info.allocated {
            device.free_allocation(self.info.block_id, self.info.block_offset);
        }
    }
}

/// Sort and coalesce overlapping or adjacent ranges in place.
pub(crate) fn merge_ranges(ranges: &mut Vec<Range<u64>>) {
    if ranges.len() < 2 {
        return;
    }
    ranges.sort_by_key(|r| r.start);
    let mut merged: Vec<Range<u64>> = Vec::with_capacity(ranges.len());
    for range in ranges.drain(..) {
        match merged.last_mut() {
            Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    *ranges = merged;
}

/// A reference-counted device buffer.
pub struct DeviceBuffer<B: Backend> {
    pub(crate) inner: Arc<BufferInner<B>>,
}

impl<B: Backend> Clone for DeviceBuffer<B> {
    fn clone(&self) -> Self {
        DeviceBuffer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> DeviceBuffer<B> {
    /// Byte size.
    pub fn size(&self) -> u64 {
        self.inner.info.size
    }

    /// Bindless read slot, or null.
    pub fn read_handle(&self) -> crate::descriptor::ResourceHandle {
        self.inner.info.read_handle
    }

    /// Bindless write slot, or null.
    pub fn write_handle(&self) -> crate::descriptor::ResourceHandle {
        self.inner.info.write_handle
    }

    /// GPU virtual address, when the backend exposes one.
    pub fn device_address(&self) -> u64 {
        self.inner.info.device_address
    }

    /// Mark `[offset, offset + len)` as modified in the CPU shadow. A zero
    /// `len` marks through the end of the buffer.
    pub fn mark_dirty(&self, offset: u64, len: u64) -> Result<()> {
        self.inner.mark_dirty(offset, len)?;
        if let Some(device) = self.inner.device.upgrade() {
            device.push_pending_buffer(&self.inner);
        }
        Ok(())
    }

    /// Copy `data` into the CPU shadow at `offset` and mark it dirty.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            let shadow = state.cpu_data.as_mut().ok_or(Error::InvalidOperation(
                "buffer was created without CPU data",
            ))?;
            let end = offset as usize + data.len();
            if end > shadow.len() {
                return Err(Error::OutOfBounds("write exceeds buffer size"));
            }
            shadow[offset as usize..end].copy_from_slice(data);
        }
        self.mark_dirty(offset, data.len() as u64)
    }

    /// Read back from the persistently mapped memory of a host-visible
    /// buffer. Returns `None` for device-local buffers.
    pub fn read_mapped(&self, offset: u64, len: usize) -> Option<Vec<u8>> {
        let mapped = self.inner.info.mapped?;
        if offset + len as u64 > self.inner.info.size {
            return None;
        }
        let mut out = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(
                mapped.0.add(offset as usize),
                out.as_mut_ptr(),
                len,
            );
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overlapping_and_adjacent() {
        let mut ranges = vec![10..20, 0..5, 18..30, 5..6, 40..50];
        merge_ranges(&mut ranges);
        assert_eq!(ranges, vec![0..6, 10..30, 40..50]);
    }

    #[test]
    fn merge_keeps_disjoint() {
        let mut ranges = vec![0..1, 2..3];
        merge_ranges(&mut ranges);
        assert_eq!(ranges, vec![0..1, 2..3]);
    }

    #[test]
    fn merged_ranges_cover_union() {
        let inputs = vec![3..9, 0..4, 8..12, 20..24, 22..30];
        let mut merged = inputs.clone();
        merge_ranges(&mut merged);
        for byte in 0..32u64 {
            let in_input = inputs.iter().any(|r| r.contains(&byte));
            let in_merged = merged.iter().any(|r| r.contains(&byte));
            assert_eq!(in_input, in_merged, "byte {}", byte);
        }
        // Non-overlapping after the merge.
        for pair in merged.windows(2) {
            assert!(pair[0].end < pair[1].start || pair[0].end == pair[1].start.min(pair[0].end));
            assert!(pair[0].end <= pair[1].start);
        }
    }
}
