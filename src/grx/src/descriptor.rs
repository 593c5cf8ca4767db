//! Bindless descriptor management.
//!
//! A single process-wide descriptor heap per device; every shader-visible
//! resource receives a stable slot in it at creation. Slots are handed out
//! from per-type free bitsets and encoded into opaque 32-bit
//! [`ResourceHandle`]s that shaders index the heap with.

use crate::error::{Error, Result};

/// Descriptor categories with their own bindless ranges.
///
/// Types at or past [`DescriptorType::EXTENDED_TAG`] share one tag in the
/// handle encoding and carry a 4-bit sub-tag instead, trading index range
/// (13 bits instead of 17) for tag space.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[repr(u32)]
pub enum DescriptorType {
    Sampler = 0,
    Texture2D,
    TextureCube,
    Texture3D,
    Buffer,
    RWBuffer,
    RWTexture2D,
    RWTexture3D,
    // Extended types below this point.
    RWTexture2Df,
    RWTexture2Di,
    RWTexture2Du,
    RWTexture3Df,
    Tlas,
}

impl DescriptorType {
    /// First extended type; its value is the shared tag in handle encoding.
    pub const EXTENDED_TAG: u32 = DescriptorType::RWTexture2Df as u32;
    /// Number of descriptor types.
    pub const COUNT: usize = DescriptorType::Tlas as usize + 1;

    const ALL: [DescriptorType; Self::COUNT] = [
        DescriptorType::Sampler,
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

    fn from_u32(v: u32) -> Option<DescriptorType> {
        Self::ALL.get(v as usize).copied()
    }

    /// Heap capacity per type. Slot 0 of every type is the permanent null
    /// descriptor and never handed out.
    pub fn capacity(self) -> u32 {
        match self {
            DescriptorType::Sampler => 2048,
            DescriptorType::Texture2D => 65536,
            DescriptorType::TextureCube => 8192,
            DescriptorType::Texture3D => 8192,
            DescriptorType::Buffer => 65536,
            DescriptorType::RWBuffer => 65536,
            DescriptorType::RWTexture2D => 16384,
            DescriptorType::RWTexture3D => 4096,
            DescriptorType::RWTexture2Df
            | DescriptorType::RWTexture2Di
            | DescriptorType::RWTexture2Du => 8192,
            DescriptorType::RWTexture3Df => 4096,
            DescriptorType::Tlas => 4096,
        }
    }
}

/// Opaque 32-bit bindless handle: descriptor type plus heap slot.
///
/// Encoding: bits 17..32 carry the type tag. For extended types the tag is
/// [`DescriptorType::EXTENDED_TAG`], bits 13..17 carry the sub-tag and bits
/// 0..13 the slot; otherwise bits 0..17 carry the slot directly.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
#[repr(transparent)]
pub struct ResourceHandle(pub u32);

impl ResourceHandle {
    /// The permanent null descriptor.
    pub const NONE: ResourceHandle = ResourceHandle(0);

    /// Pack a type and slot index.
    pub fn encode(ty: DescriptorType, index: u32) -> ResourceHandle {
        let ty = ty as u32;
        if ty >= DescriptorType::EXTENDED_TAG {
            debug_assert!(index < 1 << 13);
            let sub = ty - DescriptorType::EXTENDED_TAG;
            ResourceHandle(index | (sub << 13) | (DescriptorType::EXTENDED_TAG << 17))
        } else {
            debug_assert!(index < 1 << 17);
            ResourceHandle(index | (ty << 17))
        }
    }

    /// Descriptor type encoded in this handle.
    pub fn ty(self) -> Option<DescriptorType> {
        let mut ty = self.0 >> 17;
        if ty == DescriptorType::EXTENDED_TAG {
            ty += (self.0 >> 13) & 0xF;
        }
        DescriptorType::from_u32(ty)
    }

    /// Heap slot encoded in this handle.
    pub fn index(self) -> u32 {
        if self.0 >> 17 == DescriptorType::EXTENDED_TAG {
            self.0 & ((1 << 13) - 1)
        } else {
            self.0 & ((1 << 17) - 1)
        }
    }

    /// Whether the handle refers to a real slot.
    pub fn is_some(self) -> bool {
        self.0 != 0 && self.0 != u32::MAX
    }
}

#[cfg(feature = "track-leaks")]
struct HandleTrace {
    handle: ResourceHandle,
    trace: backtrace::Backtrace,
}

/// Per-type free bitsets plus leak tracking, behind the device's descriptor
/// lock.
pub struct DescriptorAllocator {
    free: [Vec<u64>; DescriptorType::COUNT],
    live: usize,
    #[cfg(feature = "track-leaks")]
    traces: Vec<HandleTrace>,
}

impl DescriptorAllocator {
    /// Create the allocator with slot 0 of every type pre-reserved as the
    /// null descriptor.
    pub fn new() -> Self {
        let mut alloc = DescriptorAllocator {
            free: Default::default(),
            live: 0,
            #[cfg(feature = "track-leaks")]
            traces: Vec::new(),
        };
        for ty in DescriptorType::ALL.iter() {
            let words = (ty.capacity() as usize + 63) / 64;
            let bits = &mut alloc.free[*ty as usize];
            bits.resize(words, 0);
            bits[0] |= 1; // null descriptor
        }
        alloc
    }

    /// Claim the lowest free slot of `ty`.
    pub fn allocate(&mut self, ty: DescriptorType) -> Result<ResourceHandle> {
        let capacity = ty.capacity();
        let bits = &mut self.free[ty as usize];
        for (w, word) in bits.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros();
            let index = w as u32 * 64 + bit;
            if index >= capacity {
                break;
            }
            *word |= 1 << bit;
            self.live += 1;
            let handle = ResourceHandle::encode(ty, index);
            #[cfg(feature = "track-leaks")]
            self.traces.push(HandleTrace {
                handle,
                trace: backtrace::Backtrace::new_unresolved(),
            });
            return Ok(handle);
        }
        Err(Error::OutOfBounds("bindless slot range exhausted"))
    }

    /// Return handles to their bitsets. Null and invalid handles are skipped;
    /// slot 0 is never reclaimed.
    pub fn free(&mut self, handles: &[ResourceHandle]) {
        for &handle in handles {
            if !handle.is_some() {
                continue;
            }
            let ty = match handle.ty() {
                Some(ty) => ty,
                None => continue,
            };
            let index = handle.index();
            if index == 0 || index >= ty.capacity() {
                continue;
            }
            let word = &mut self.free[ty as usize][index as usize / 64];
            let mask = 1u64 << (index % 64);
            if *word & mask != 0 {
                *word &= !mask;
                self.live -= 1;
                #[cfg(feature = "track-leaks")]
                self.traces.retain(|t| t.handle != handle);
            }
        }
    }

    /// Number of live handles, excluding the reserved null slots.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Log remaining handles on device teardown, up to 16 entries.
    pub fn report_leaks(&self) {
        if self.live == 0 {
            return;
        }
        warn!("leaked {} descriptors, displaying up to 16:", self.live);
        let mut shown = 0;
        'outer: for ty in DescriptorType::ALL.iter() {
            let bits = &self.free[*ty as usize];
            for index in 1..ty.capacity() {
                if bits[index as usize / 64] & (1 << (index % 64)) != 0 {
                    warn!("  {:?} slot {}", ty, index);
                    shown += 1;
                    if shown == 16 {
                        break 'outer;
                    }
                }
            }
        }
        #[cfg(feature = "track-leaks")]
        for t in self.traces.iter().take(16) {
            let mut trace = t.trace.clone();
            trace.resolve();
            warn!("  {:?} allocated at:\n{:?}", t.handle, trace);
        }
    }
}

impl Default for DescriptorAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        for ty in DescriptorType::ALL.iter() {
            let max = if (*ty as u32) >= DescriptorType::EXTENDED_TAG {
                (1 << 13) - 1
            } else {
                (1 << 17) - 1
            };
            for &index in &[0u32, 1, 2, 13, 255, max.min(ty.capacity() - 1)] {
                let handle = ResourceHandle::encode(*ty, index);
                assert_eq!(handle.ty(), Some(*ty), "type mismatch for {:?}", ty);
                assert_eq!(handle.index(), index, "index mismatch for {:?}", ty);
            }
        }
    }

    #[test]
    fn null_handle_is_texture_slot_zero_free() {
        // Handle 0 decodes as type 0 slot 0, the null descriptor.
        assert_eq!(ResourceHandle::NONE.index(), 0);
        assert!(!ResourceHandle::NONE.is_some());
    }

    #[test]
    fn allocate_skips_null_slot() {
        let mut alloc = DescriptorAllocator::new();
        let first = alloc.allocate(DescriptorType::Texture2D).unwrap();
        assert_eq!(first.index(), 1);
    }

    #[test]
    fn free_restores_initial_bitsets() {
        let mut alloc = DescriptorAllocator::new();
        let baseline: Vec<Vec<u64>> = alloc.free.to_vec();
        let mut handles = Vec::new();
        for _ in 0..10 {
            handles.push(alloc.allocate(DescriptorType::Buffer).unwrap());
            handles.push(alloc.allocate(DescriptorType::Tlas).unwrap());
        }
        // Free in interleaved, non-allocation order.
        handles.reverse();
        handles.swap(0, 7);
        alloc.free(&handles);
        assert_eq!(alloc.live(), 0);
        for (a, b) in alloc.free.iter().zip(baseline.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn lowest_freed_slot_is_reused() {
        let mut alloc = DescriptorAllocator::new();
        let handles: Vec<_> = (0..10)
            .map(|_| alloc.allocate(DescriptorType::Texture2D).unwrap())
            .collect();
        alloc.free(&[handles[3], handles[7]]);
        let next = alloc.allocate(DescriptorType::Texture2D).unwrap();
        assert_eq!(next.index(), handles[3].index());
    }

    #[test]
    fn exhaustion_reports_out_of_bounds() {
        let mut alloc = DescriptorAllocator::new();
        for _ in 1..DescriptorType::Tlas.capacity() {
            alloc.allocate(DescriptorType::Tlas).unwrap();
        }
        assert!(matches!(
            alloc.allocate(DescriptorType::Tlas),
            Err(Error::OutOfBounds(_))
        ));
    }

    #[test]
    fn freeing_null_is_a_no_op() {
        let mut alloc = DescriptorAllocator::new();
        alloc.free(&[ResourceHandle::NONE, ResourceHandle(u32::MAX)]);
        assert_eq!(alloc.live(), 0);
        // Slot 0 remains reserved.
        let h = alloc.allocate(DescriptorType::Sampler).unwrap();
        assert_eq!(h.index(), 1);
    }
}
