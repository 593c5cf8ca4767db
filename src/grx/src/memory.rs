//! Device memory: sub-allocating block manager with a dedicated-allocation
//! escape hatch.
//!
//! Memory is carved out of large backend allocations ("blocks"). Each block
//! embeds an [`AllocationBuffer`], a first-fit interval allocator; buffers
//! are placed from the front and images from the back so linear and
//! non-linear resources never straddle the granularity boundary.

use std::{fmt, ops::Range};

use crate::{
    adapter::DeviceType,
    backend::BackendDevice,
    error::{Error, Result},
    Backend,
};

bitflags! {
    /// Memory property flags.
    pub struct MemoryFlags: u16 {
        /// Device local memory on the GPU.
        const DEVICE_LOCAL = 0x1;
        /// Host visible memory can be accessed by the CPU.
        const HOST_VISIBLE = 0x2;
        /// CPU-GPU coherent; non-coherent memory requires explicit flushing.
        const COHERENT = 0x4;
        /// Cached on the CPU side.
        const CPU_CACHED = 0x8;
    }
}

/// One memory type exposed by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    /// Property flags of allocations made from this type.
    pub flags: MemoryFlags,
    /// Index of the heap this type allocates from.
    pub heap_index: usize,
}

/// Memory heaps and types of a physical device.
#[derive(Clone, Debug, Default)]
pub struct MemoryProperties {
    /// Heap sizes in bytes.
    pub heaps: Vec<u64>,
    /// Available memory types.
    pub types: Vec<MemoryType>,
}

/// Memory requirements for a buffer or image.
#[derive(Clone, Copy, Debug)]
pub struct Requirements {
    /// Size in the memory.
    pub size: u64,
    /// Required placement alignment.
    pub alignment: u64,
    /// Bitmask of acceptable memory types.
    pub type_mask: u32,
    /// The driver would rather see this in its own allocation.
    pub prefers_dedicated: bool,
    /// The driver demands a dedicated allocation.
    pub requires_dedicated: bool,
}

/// Which end of a block an allocation is placed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    /// Linear resources, placed front-to-back.
    Buffer,
    /// Non-linear resources, placed back-to-front.
    Texture,
}

/// First-fit interval allocator over a linear byte range.
///
/// Tracks used intervals sorted by offset; gaps between them are candidates
/// for new allocations.
#[derive(Default)]
pub struct AllocationBuffer {
    len: u64,
    used: Vec<Range<u64>>,
}

impl AllocationBuffer {
    /// Create an allocator covering `0..len`.
    pub fn new(len: u64) -> Self {
        AllocationBuffer {
            len,
            used: Vec::new(),
        }
    }

    /// Total managed length.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Whether nothing is currently allocated.
    pub fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Sum of allocated bytes.
    pub fn used_bytes(&self) -> u64 {
        self.used.iter().map(|r| r.end - r.start).sum()
    }

    /// Allocate `size` bytes aligned to `alignment`. `from_end` places the
    /// allocation in the last fitting gap instead of the first.
    pub fn allocate(&mut self, size: u64, alignment: u64, from_end: bool) -> Option<u64> {
        if size == 0 || size > self.len {
            return None;
        }
        let alignment = alignment.max(1);

        let mut candidates = Vec::new();
        let mut cursor = 0;
        for (i, r) in self.used.iter().enumerate() {
            candidates.push((i, cursor..r.start));
            cursor = r.end;
        }
        candidates.push((self.used.len(), cursor..self.len));

        let pick = |gap: &Range<u64>| -> Option<u64> {
            if from_end {
                let end = gap.end.checked_sub(size)?;
                let offset = end / alignment * alignment;
                (offset >= gap.start).then(|| offset)
            } else {
                let offset = (gap.start + alignment - 1) / alignment * alignment;
                (offset + size <= gap.end).then(|| offset)
            }
        };

        let found = if from_end {
            candidates
                .iter()
                .rev()
                .find_map(|(i, gap)| pick(gap).map(|o| (*i, o)))
        } else {
            candidates
                .iter()
                .find_map(|(i, gap)| pick(gap).map(|o| (*i, o)))
        };

        let (index, offset) = found?;
        self.used.insert(index, offset..offset + size);
        Some(offset)
    }

    /// Release the allocation starting at `offset`. Returns false if no such
    /// allocation exists.
    pub fn free(&mut self, offset: u64) -> bool {
        match self.used.iter().position(|r| r.start == offset) {
            Some(i) => {
                self.used.remove(i);
                true
            }
            None => false,
        }
    }

    /// Release every allocation at once.
    pub fn free_all(&mut self) {
        self.used.clear();
    }
}

impl fmt::Debug for AllocationBuffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AllocationBuffer")
            .field("len", &self.len)
            .field("used", &self.used.len())
            .finish()
    }
}

/// Pointer into persistently mapped block memory.
#[derive(Clone, Copy, Debug)]
pub struct MappedPtr(pub *mut u8);

// The pointee is plain bytes inside a driver mapping; aliasing is guarded by
// the per-resource locks above this layer.
unsafe impl Send for MappedPtr {}
unsafe impl Sync for MappedPtr {}

/// One physical backend allocation.
pub struct MemoryBlock<B: Backend> {
    raw: Option<B::Memory>,
    /// Memory type index this block was allocated from.
    pub type_id: u32,
    /// Property flags of the memory type.
    pub flags: MemoryFlags,
    /// Block holds exactly one resource and is never sub-allocated.
    pub dedicated: bool,
    /// Host mapping of the whole block, when host-visible.
    pub mapped: Option<MappedPtr>,
    /// Embedded sub-allocator.
    pub allocations: AllocationBuffer,
    #[cfg(feature = "track-leaks")]
    trace: backtrace::Backtrace,
}

impl<B: Backend> MemoryBlock<B> {
    /// Backend memory handle.
    pub fn raw(&self) -> &B::Memory {
        self.raw.as_ref().expect("memory block already destroyed")
    }
}

impl<B: Backend> fmt::Debug for MemoryBlock<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("type_id", &self.type_id)
            .field("flags", &self.flags)
            .field("dedicated", &self.dedicated)
            .field("allocations", &self.allocations)
            .finish()
    }
}

/// Block size for GPU-sided pools.
pub const BLOCK_SIZE_GPU: u64 = 64 << 20;
/// Block size for CPU-sided pools.
pub const BLOCK_SIZE_CPU: u64 = 16 << 20;

/// After this many live blocks the allocator stops honoring
/// `prefers_dedicated` hints; most drivers cap total allocations at 4096.
const DEDICATED_HINT_BLOCK_LIMIT: usize = 2000;

/// Sub-allocating device memory manager. One per device, behind the device's
/// allocator lock.
pub struct MemoryAllocator<B: Backend> {
    blocks: Vec<Option<MemoryBlock<B>>>,
    memory: MemoryProperties,
    device_type: DeviceType,
    max_allocation_size: u64,
    non_coherent_atom_size: u64,
    shared_budget: u64,
    dedicated_budget: u64,
    debug: bool,
}

impl<B: Backend> MemoryAllocator<B> {
    pub(crate) fn new(info: &crate::adapter::DeviceInfo, debug: bool) -> Self {
        MemoryAllocator {
            blocks: Vec::with_capacity(16),
            memory: info.memory.clone(),
            device_type: info.device_type,
            max_allocation_size: info.limits.max_allocation_size,
            non_coherent_atom_size: info.limits.non_coherent_atom_size,
            shared_budget: info.limits.shared_memory,
            dedicated_budget: info.limits.dedicated_memory,
            debug,
        }
    }

    /// Access a live block by id.
    pub fn block(&self, id: u32) -> &MemoryBlock<B> {
        self.blocks[id as usize]
            .as_ref()
            .expect("stale memory block id")
    }

    /// Find a memory type matching `type_mask` and the requested sidedness.
    ///
    /// Preference order: device-local (unless cpu sided) combined with
    /// host-visible+coherent, then host-visible, then plain.
    fn find_memory_type(&self, cpu_sided: bool, type_mask: u32) -> Result<(u32, MemoryFlags)> {
        let local = if cpu_sided {
            MemoryFlags::empty()
        } else {
            MemoryFlags::DEVICE_LOCAL
        };
        let priorities = [
            local | MemoryFlags::HOST_VISIBLE | MemoryFlags::COHERENT,
            local | MemoryFlags::HOST_VISIBLE,
            local,
        ];

        let mut best: Option<(usize, u32, MemoryFlags)> = None;
        for (i, ty) in self.memory.types.iter().enumerate() {
            if type_mask & (1 << i) == 0 {
                continue;
            }
            let masked = ty.flags
                & (MemoryFlags::DEVICE_LOCAL | MemoryFlags::HOST_VISIBLE | MemoryFlags::COHERENT);
            for (rank, wanted) in priorities.iter().enumerate() {
                if masked == *wanted && best.map_or(true, |(r, ..)| rank < r) {
                    best = Some((rank, i as u32, *wanted));
                }
            }
        }

        // CPU-sided requests may still land in a purely device-local type on
        // unified-memory devices where every type is host-visible anyway.
        if best.is_none() && cpu_sided {
            for (i, ty) in self.memory.types.iter().enumerate() {
                if type_mask & (1 << i) != 0 && ty.flags.contains(MemoryFlags::HOST_VISIBLE) {
                    best = Some((3, i as u32, ty.flags));
                    break;
                }
            }
        }

        best.map(|(_, id, flags)| (id, flags))
            .ok_or(Error::NotFound("no memory type matches mask and sidedness"))
    }

    fn used_budget(&self, cpu_sided: bool) -> u64 {
        self.blocks
            .iter()
            .flatten()
            .filter(|b| b.flags.contains(MemoryFlags::DEVICE_LOCAL) != cpu_sided)
            .map(|b| b.allocations.len())
            .sum()
    }

    /// Allocate `requirements` into a (possibly new) block.
    ///
    /// Returns `(block_id, offset)`. Ids are stable; freed entries are marked
    /// inactive and their slots reused.
    pub fn allocate(
        &mut self,
        raw: &B::Device,
        requirements: &Requirements,
        mut cpu_sided: bool,
        kind: ResourceKind,
        name: &str,
    ) -> Result<(u32, u64)> {
        if requirements.size > self.max_allocation_size {
            return Err(Error::OutOfBounds(
                "allocation length exceeds max allocation size",
            ));
        }

        // Everything lands in shared memory on non-dedicated devices.
        if self.device_type != DeviceType::DiscreteGpu {
            cpu_sided = true;
        }

        let dedicated = requirements.requires_dedicated
            || (requirements.prefers_dedicated && self.blocks.len() < DEDICATED_HINT_BLOCK_LIMIT);

        let (type_id, flags) = self.find_memory_type(cpu_sided, requirements.type_mask)?;

        if !dedicated {
            for (i, slot) in self.blocks.iter_mut().enumerate() {
                let block = match slot {
                    Some(b) => b,
                    None => continue,
                };
                if block.dedicated
                    || block.type_id != type_id
                    || block.flags.contains(MemoryFlags::DEVICE_LOCAL) == cpu_sided
                {
                    continue;
                }

                let mut alignment = requirements.alignment;
                if block.flags.contains(MemoryFlags::HOST_VISIBLE)
                    && !block.flags.contains(MemoryFlags::COHERENT)
                {
                    alignment = alignment.max(self.non_coherent_atom_size);
                }

                if let Some(offset) = block.allocations.allocate(
                    requirements.size,
                    alignment,
                    kind != ResourceKind::Buffer,
                ) {
                    if self.debug {
                        debug!(
                            "allocating {} bytes into existing memory block {} at {:#x}",
                            requirements.size, i, offset
                        );
                    }
                    return Ok((i as u32, offset));
                }
            }
        }

        // No block accepted the request; bring up a new one.

        let block_size = if cpu_sided {
            BLOCK_SIZE_CPU
        } else {
            BLOCK_SIZE_GPU
        };
        let alloc_size = if dedicated {
            requirements.size
        } else {
            ((block_size.max(requirements.size * 2) + block_size - 1) / block_size * block_size)
                .min(self.max_allocation_size)
        };

        let budget = if cpu_sided {
            self.shared_budget
        } else {
            self.dedicated_budget
        };
        let used = raw
            .memory_budget(!cpu_sided)
            .unwrap_or_else(|| self.used_budget(cpu_sided));
        if budget != 0 && used.saturating_add(alloc_size) > budget {
            return Err(Error::OutOfMemory(
                "memory block allocation would exceed available memory",
            ));
        }

        if self.debug {
            debug!(
                "allocating new {} memory block {} ({} bytes for a {} byte request)",
                if cpu_sided { "cpu" } else { "gpu" },
                self.blocks.len(),
                alloc_size,
                requirements.size,
            );
        }

        let memory = unsafe { raw.allocate_memory(type_id, alloc_size, name)? };
        let mapped = if flags.contains(MemoryFlags::HOST_VISIBLE) {
            match unsafe { raw.map_memory(&memory) } {
                Ok(ptr) => Some(MappedPtr(ptr)),
                Err(e) => {
                    unsafe { raw.free_memory(memory) };
                    return Err(e);
                }
            }
        } else {
            None
        };

        // Integrated devices report device-local on everything; strip it so
        // sidedness filtering stays meaningful.
        let flags = if self.device_type != DeviceType::DiscreteGpu {
            flags - MemoryFlags::DEVICE_LOCAL
        } else {
            flags
        };

        let mut block = MemoryBlock {
            raw: Some(memory),
            type_id,
            flags,
            dedicated,
            mapped,
            allocations: AllocationBuffer::new(alloc_size),
            #[cfg(feature = "track-leaks")]
            trace: backtrace::Backtrace::new_unresolved(),
        };

        let offset = block
            .allocations
            .allocate(
                requirements.size,
                requirements.alignment,
                kind != ResourceKind::Buffer,
            )
            .ok_or(Error::OutOfMemory("fresh memory block rejected allocation"))?;

        let id = match self.blocks.iter().position(|slot| slot.is_none()) {
            Some(i) => {
                self.blocks[i] = Some(block);
                i
            }
            None => {
                self.blocks.push(Some(block));
                self.blocks.len() - 1
            }
        };

        Ok((id as u32, offset))
    }

    /// Release a sub-allocation; destroys the block once it is empty.
    pub fn free(&mut self, raw: &B::Device, block_id: u32, offset: u64) {
        let slot = match self.blocks.get_mut(block_id as usize) {
            Some(s) => s,
            None => return,
        };
        let destroy = match slot {
            Some(block) => {
                block.allocations.free(offset);
                block.allocations.is_empty()
            }
            None => false,
        };
        if destroy {
            let mut block = slot.take().unwrap();
            if let Some(memory) = block.raw.take() {
                unsafe { raw.free_memory(memory) };
            }
        }
    }

    /// Walk the block table and report still-occupied sub-allocations.
    /// Returns the number of leaked blocks.
    pub fn report_leaks(&self) -> usize {
        let leaked: Vec<_> = self
            .blocks
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|b| (i, b)))
            .filter(|(_, b)| !b.allocations.is_empty())
            .collect();
        if leaked.is_empty() {
            return 0;
        }
        warn!(
            "leaked graphics device memory (showing up to 16/{} entries):",
            leaked.len()
        );
        for (i, block) in leaked.iter().take(16) {
            warn!("  block {}: {} bytes", i, block.allocations.used_bytes());
            #[cfg(feature = "track-leaks")]
            {
                let mut trace = block.trace.clone();
                trace.resolve();
                warn!("  allocated at:\n{:?}", trace);
            }
        }
        leaked.len()
    }

    /// Destroy every remaining block. Called from device teardown after the
    /// leak report.
    pub fn clear(&mut self, raw: &B::Device) {
        for slot in self.blocks.iter_mut() {
            if let Some(mut block) = slot.take() {
                if let Some(memory) = block.raw.take() {
                    unsafe { raw.free_memory(memory) };
                }
            }
        }
    }

    /// Number of slots in the block table (live or inactive).
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Whether every block is gone or marked inactive.
    pub fn is_drained(&self) -> bool {
        self.blocks.iter().all(|slot| slot.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_and_free() {
        let mut ab = AllocationBuffer::new(1024);
        let a = ab.allocate(100, 1, false).unwrap();
        let b = ab.allocate(100, 1, false).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 100);
        assert!(ab.free(a));
        // Freed gap is reused first.
        assert_eq!(ab.allocate(50, 1, false).unwrap(), 0);
        assert!(!ab.free(999));
    }

    #[test]
    fn alignment_is_respected() {
        let mut ab = AllocationBuffer::new(1024);
        ab.allocate(10, 1, false).unwrap();
        let b = ab.allocate(16, 256, false).unwrap();
        assert_eq!(b % 256, 0);
    }

    #[test]
    fn from_end_packs_backwards() {
        let mut ab = AllocationBuffer::new(1024);
        let a = ab.allocate(100, 1, true).unwrap();
        assert_eq!(a, 924);
        let b = ab.allocate(100, 4, true).unwrap();
        assert!(b + 100 <= a);
        assert_eq!(b % 4, 0);
    }

    #[test]
    fn exhaustion() {
        let mut ab = AllocationBuffer::new(256);
        assert!(ab.allocate(257, 1, false).is_none());
        ab.allocate(256, 1, false).unwrap();
        assert!(ab.allocate(1, 1, false).is_none());
        ab.free_all();
        assert!(ab.is_empty());
        assert!(ab.allocate(256, 1, false).is_some());
    }

    #[test]
    fn round_trip_leaves_no_bytes() {
        let mut ab = AllocationBuffer::new(4096);
        let offsets: Vec<_> = (0..8)
            .map(|i| ab.allocate(128, 64, i % 2 == 0).unwrap())
            .collect();
        // Free in arbitrary order.
        for &o in offsets.iter().rev().step_by(2).chain(offsets.iter().step_by(2)) {
            assert!(ab.free(o));
        }
        assert!(ab.is_empty());
        assert_eq!(ab.used_bytes(), 0);
    }
}
