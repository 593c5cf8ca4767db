//! Raytracing acceleration structures.
//!
//! BLAS hold geometry, TLAS hold instances referencing BLASes. Builds are
//! deferred: creation sizes and allocates the backing and scratch buffers,
//! the actual build command is recorded at the next submit. A structure
//! created with `ALLOW_UPDATE` keeps its scratch buffer for refits;
//! otherwise the scratch is released into the frame's in-flight list after
//! the first build.

use std::sync::{atomic::AtomicBool, Arc};

use parking_lot::Mutex;

use crate::{
    backend::BackendDevice,
    buffer::{BufferInner, DeviceBuffer},
    error::{Error, Result},
    format::{Format, IndexFormat},
    resource::{DeviceRef, ResourceInfo},
    Backend,
};

bitflags! {
    /// Build options, mapped 1:1 to backend build-flag bits.
    pub struct RtasBuildFlags: u32 {
        /// The structure can be refit after the initial build.
        const ALLOW_UPDATE = 0x1;
        /// The structure may be compacted on copy.
        const ALLOW_COMPACTION = 0x2;
        /// Prioritize trace performance.
        const FAST_TRACE = 0x4;
        /// Prioritize build time.
        const FAST_BUILD = 0x8;
        /// Minimize scratch and result memory.
        const MINIMIZE_MEMORY = 0x10;
        /// This build is a refit of `parent`.
        const IS_UPDATE = 0x20;
    }
}

bitflags! {
    /// Per-instance options inside a TLAS.
    pub struct TlasInstanceFlags: u8 {
        /// Disable face culling for this instance.
        const TRIANGLE_CULL_DISABLE = 0x1;
        /// Treat counterclockwise triangles as front facing.
        const COUNTERCLOCKWISE = 0x2;
        /// Force all geometry opaque.
        const FORCE_OPAQUE = 0x4;
        /// Force all geometry non-opaque.
        const FORCE_NO_OPAQUE = 0x8;
    }
}

/// Sizes the backend reports for a pending build.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RtasSizes {
    /// Backing buffer size for the structure itself.
    pub structure: u64,
    /// Scratch size for a full build.
    pub build_scratch: u64,
    /// Scratch size for a refit.
    pub update_scratch: u64,
}

/// Geometry description of a BLAS, owning its input buffers.
pub enum BlasGeometry<B: Backend> {
    /// Triangle geometry.
    Triangles {
        /// Vertex position buffer.
        positions: DeviceBuffer<B>,
        /// Position format; one of the RT-capable vertex formats.
        position_format: Format,
        /// Byte offset of the first position.
        position_offset: u64,
        /// Stride between positions.
        position_stride: u64,
        /// Number of positions addressed by the build.
        position_count: u32,
        /// Index buffer; positions are consumed linearly when absent.
        indices: Option<(DeviceBuffer<B>, IndexFormat, u32)>,
    },
    /// Procedural axis-aligned bounding boxes.
    Aabbs {
        /// Buffer of `[min3, max3]` f32 pairs.
        buffer: DeviceBuffer<B>,
        /// Byte offset of the first box.
        offset: u64,
        /// Stride between boxes, at least 24 and a multiple of 8.
        stride: u64,
        /// Box count.
        count: u32,
    },
}

impl<B: Backend> BlasGeometry<B> {
    /// Number of primitives this geometry builds.
    ///
    /// A triangle list without indices floors to whole triangles.
    pub fn primitive_count(&self) -> Result<u32> {
        let count = match self {
            BlasGeometry::Triangles {
                position_count,
                indices,
                ..
            } => match indices {
                Some((_, _, index_count)) => *index_count as u64 / 3,
                None => *position_count as u64 / 3,
            },
            BlasGeometry::Aabbs { count, .. } => *count as u64,
        };
        if count > u32::MAX as u64 {
            return Err(Error::OutOfBounds("primitive count exceeds 2^32 - 1"));
        }
        Ok(count as u32)
    }
}

/// Shared fields of static and motion TLAS instances.
pub struct TlasInstanceHeader<B: Backend> {
    /// 24-bit user index surfaced to shaders.
    pub custom_index: u32,
    /// 8-bit visibility mask.
    pub mask: u8,
    /// 24-bit SBT record offset.
    pub sbt_offset: u32,
    /// Instance flags.
    pub flags: TlasInstanceFlags,
    /// The BLAS this instance points at.
    pub blas: crate::rtas::Blas<B>,
}

impl<B: Backend> TlasInstanceHeader<B> {
    fn packed_words(&self) -> Result<(u32, u32)> {
        if self.custom_index >= 1 << 24 {
            return Err(Error::OutOfBounds("instance custom index exceeds 24 bits"));
        }
        if self.sbt_offset >= 1 << 24 {
            return Err(Error::OutOfBounds("instance SBT offset exceeds 24 bits"));
        }
        Ok((
            (self.custom_index << 8) | self.mask as u32,
            (self.sbt_offset << 8) | self.flags.bits() as u32,
        ))
    }
}

/// A static TLAS instance authored on the CPU.
pub struct TlasInstanceStatic<B: Backend> {
    /// Shared instance fields.
    pub header: TlasInstanceHeader<B>,
    /// Row-major 3x4 object-to-world transform.
    pub transform: [[f32; 4]; 3],
}

impl<B: Backend> TlasInstanceStatic<B> {
    /// Shared fields, regardless of record layout.
    pub fn header(&self) -> &TlasInstanceHeader<B> {
        &self.header
    }
}

/// A motion-blur TLAS instance authored on the CPU.
pub struct TlasInstanceMotion<B: Backend> {
    /// Shared instance fields.
    pub header: TlasInstanceHeader<B>,
    /// Transform at t = 0.
    pub transform_t0: [[f32; 4]; 3],
    /// Transform at t = 1.
    pub transform_t1: [[f32; 4]; 3],
}

impl<B: Backend> TlasInstanceMotion<B> {
    /// Shared fields, regardless of record layout.
    pub fn header(&self) -> &TlasInstanceHeader<B> {
        &self.header
    }
}

/// Byte size of one packed static instance record.
pub const INSTANCE_RECORD_SIZE: u64 = 64;
/// Byte size of one packed motion instance record.
pub const MOTION_INSTANCE_RECORD_SIZE: u64 = 160;

/// Pack one static instance into its GPU record layout, resolving the BLAS
/// reference to `blas_address`.
pub(crate) fn pack_static_instance<B: Backend>(
    instance: &TlasInstanceStatic<B>,
    blas_address: u64,
) -> Result<[u8; INSTANCE_RECORD_SIZE as usize]> {
    let (word0, word1) = instance.header.packed_words()?;
    let mut out = [0u8; INSTANCE_RECORD_SIZE as usize];
    let mut cursor = 0;
    for row in instance.transform.iter() {
        for value in row.iter() {
            out[cursor..cursor + 4].copy_from_slice(&value.to_le_bytes());
            cursor += 4;
        }
    }
    out[48..52].copy_from_slice(&word0.to_le_bytes());
    out[52..56].copy_from_slice(&word1.to_le_bytes());
    out[56..64].copy_from_slice(&blas_address.to_le_bytes());
    Ok(out)
}

/// Pack one motion instance into its GPU record layout.
pub(crate) fn pack_motion_instance<B: Backend>(
    instance: &TlasInstanceMotion<B>,
    blas_address: u64,
) -> Result<[u8; MOTION_INSTANCE_RECORD_SIZE as usize]> {
    let (word0, word1) = instance.header.packed_words()?;
    let mut out = [0u8; MOTION_INSTANCE_RECORD_SIZE as usize];
    let mut cursor = 0;
    for transform in [&instance.transform_t0, &instance.transform_t1].iter() {
        for row in transform.iter() {
            for value in row.iter() {
                out[cursor..cursor + 4].copy_from_slice(&value.to_le_bytes());
                cursor += 4;
            }
        }
    }
    out[96..100].copy_from_slice(&word0.to_le_bytes());
    out[100..104].copy_from_slice(&word1.to_le_bytes());
    out[104..112].copy_from_slice(&blas_address.to_le_bytes());
    Ok(out)
}

/// Instance source of a TLAS.
pub enum TlasInstances<B: Backend> {
    /// CPU-authored static instances, marshalled at submit.
    Static(Vec<TlasInstanceStatic<B>>),
    /// CPU-authored motion instances, marshalled at submit.
    Motion(Vec<TlasInstanceMotion<B>>),
    /// Instances already resident in a device buffer.
    Device {
        /// Buffer of packed instance records.
        buffer: DeviceBuffer<B>,
        /// Byte offset of the first record.
        offset: u64,
        /// Record count.
        count: u32,
        /// Records use the motion layout.
        motion: bool,
    },
}

impl<B: Backend> TlasInstances<B> {
    /// Instance count.
    pub fn count(&self) -> usize {
        match self {
            TlasInstances::Static(v) => v.len(),
            TlasInstances::Motion(v) => v.len(),
            TlasInstances::Device { count, .. } => *count as usize,
        }
    }

    /// Whether the motion record layout is used.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            TlasInstances::Motion(_) | TlasInstances::Device { motion: true, .. }
        )
    }
}

// Borrowed forms handed to the backend.

/// Geometry inputs for a size query or build, borrowing backend buffers.
pub enum RtasGeometryRef<'a, B: Backend> {
    /// Triangle geometry.
    Triangles {
        /// Position buffer.
        positions: &'a B::Buffer,
        /// Byte offset of the first position.
        offset: u64,
        /// Position format.
        format: Format,
        /// Stride between positions.
        stride: u64,
        /// Number of addressable vertices.
        vertex_count: u32,
        /// Index buffer, offset and format.
        indices: Option<(&'a B::Buffer, u64, IndexFormat)>,
    },
    /// Procedural boxes.
    Aabbs {
        /// AABB buffer.
        buffer: &'a B::Buffer,
        /// Byte offset of the first box.
        offset: u64,
        /// Stride between boxes.
        stride: u64,
    },
    /// TLAS instances.
    Instances {
        /// Packed instance record buffer.
        buffer: &'a B::Buffer,
        /// Byte offset of the first record.
        offset: u64,
        /// Records use the motion layout.
        motion: bool,
    },
}

/// Everything a backend needs to size a build.
pub struct RtasBuildInputs<'a, B: Backend> {
    /// Top or bottom level.
    pub top_level: bool,
    /// Build flags.
    pub flags: RtasBuildFlags,
    /// Geometry inputs.
    pub geometry: RtasGeometryRef<'a, B>,
    /// Primitive (or instance) count.
    pub primitive_count: u32,
}

/// A build command recorded into a command buffer.
pub struct RtasBuildCmd<'a, B: Backend> {
    /// Geometry and flags.
    pub inputs: RtasBuildInputs<'a, B>,
    /// Source structure for refits.
    pub src: Option<&'a B::AccelerationStructure>,
    /// Destination structure.
    pub dst: &'a B::AccelerationStructure,
    /// Scratch buffer.
    pub scratch: &'a B::Buffer,
    /// Offset inside the scratch buffer.
    pub scratch_offset: u64,
}

pub(crate) struct BlasInner<B: Backend> {
    pub(crate) info: ResourceInfo,
    pub(crate) flags: RtasBuildFlags,
    pub(crate) geometry: BlasGeometry<B>,
    pub(crate) parent: Option<Arc<BlasInner<B>>>,
    pub(crate) primitives: u32,
    pub(crate) backing: Arc<BufferInner<B>>,
    pub(crate) scratch: Mutex<Option<Arc<BufferInner<B>>>>,
    pub(crate) sizes: RtasSizes,
    pub(crate) raw: Option<B::AccelerationStructure>,
    pub(crate) device_address: u64,
    pub(crate) completed: AtomicBool,
    pub(crate) device: DeviceRef<B>,
}

impl<B: Backend> BlasInner<B> {
    pub(crate) fn raw(&self) -> &B::AccelerationStructure {
        self.raw.as_ref().expect("BLAS already destroyed")
    }
}

impl<B: Backend> Drop for BlasInner<B> {
    fn drop(&mut self) {
        let device = match self.device.upgrade() {
            Some(device) if !device.is_torn_down() => device,
            _ => return,
        };
        device.free_handles(&self.info.handles());
        if let Some(raw) = self.raw.take() {
            unsafe { device.raw().destroy_rtas(raw) };
        }
    }
}

pub(crate) struct TlasInner<B: Backend> {
    pub(crate) info: ResourceInfo,
    pub(crate) flags: RtasBuildFlags,
    pub(crate) instances: TlasInstances<B>,
    pub(crate) parent: Option<Arc<TlasInner<B>>>,
    pub(crate) backing: Arc<BufferInner<B>>,
    pub(crate) scratch: Mutex<Option<Arc<BufferInner<B>>>>,
    pub(crate) sizes: RtasSizes,
    pub(crate) raw: Option<B::AccelerationStructure>,
    pub(crate) completed: AtomicBool,
    pub(crate) device: DeviceRef<B>,
}

impl<B: Backend> TlasInner<B> {
    pub(crate) fn raw(&self) -> &B::AccelerationStructure {
        self.raw.as_ref().expect("TLAS already destroyed")
    }
}

impl<B: Backend> Drop for TlasInner<B> {
    fn drop(&mut self) {
        let device = match self.device.upgrade() {
            Some(device) if !device.is_torn_down() => device,
            _ => return,
        };
        device.free_handles(&self.info.handles());
        if let Some(raw) = self.raw.take() {
            unsafe { device.raw().destroy_rtas(raw) };
        }
    }
}

/// A reference-counted bottom-level acceleration structure.
pub struct Blas<B: Backend> {
    pub(crate) inner: Arc<BlasInner<B>>,
}

impl<B: Backend> Clone for Blas<B> {
    fn clone(&self) -> Self {
        Blas {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Blas<B> {
    /// Primitive count of the geometry.
    pub fn primitive_count(&self) -> u32 {
        self.inner.primitives
    }

    /// Device address of the structure.
    pub fn device_address(&self) -> u64 {
        self.inner.device_address
    }

    /// Whether the initial build has been submitted.
    pub fn is_completed(&self) -> bool {
        self.inner
            .completed
            .load(std::sync::atomic::Ordering::Acquire)
    }
}

/// A reference-counted top-level acceleration structure.
pub struct Tlas<B: Backend> {
    pub(crate) inner: Arc<TlasInner<B>>,
}

impl<B: Backend> Clone for Tlas<B> {
    fn clone(&self) -> Self {
        Tlas {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Tlas<B> {
    /// Bindless slot shaders traverse through.
    pub fn handle(&self) -> crate::descriptor::ResourceHandle {
        self.inner.info.read_handle
    }

    /// Whether the initial build has been submitted.
    pub fn is_completed(&self) -> bool {
        self.inner
            .completed
            .load(std::sync::atomic::Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_record_layout() {
        // Packing is position-exact; a synthetic record checks the offsets.
        let transform = [
            [1.0f32, 0.0, 0.0, 10.0],
            [0.0, 1.0, 0.0, 20.0],
            [0.0, 0.0, 1.0, 30.0],
        ];
        let mut out = [0u8; 64];
        let mut cursor = 0;
        for row in transform.iter() {
            for value in row.iter() {
                out[cursor..cursor + 4].copy_from_slice(&value.to_le_bytes());
                cursor += 4;
            }
        }
        let word0 = (7u32 << 8) | 0xFF;
        let word1 = (3u32 << 8) | TlasInstanceFlags::FORCE_OPAQUE.bits() as u32;
        out[48..52].copy_from_slice(&word0.to_le_bytes());
        out[52..56].copy_from_slice(&word1.to_le_bytes());
        out[56..64].copy_from_slice(&0xDEAD_BEEFu64.to_le_bytes());

        assert_eq!(&out[48..52], &[0xFF, 0x07, 0x00, 0x00]);
        assert_eq!(out[52], TlasInstanceFlags::FORCE_OPAQUE.bits());
        assert_eq!(&out[56..64], &0xDEAD_BEEFu64.to_le_bytes());
    }

    #[test]
    fn record_sizes() {
        assert_eq!(INSTANCE_RECORD_SIZE, 64);
        assert_eq!(MOTION_INSTANCE_RECORD_SIZE, 160);
    }
}
