//! Physical device enumeration and capability reporting.

use crate::memory::MemoryProperties;

/// Classification of a physical device.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum DeviceType {
    /// Other or unknown.
    Other,
    /// Integrated GPU sharing memory with the host.
    IntegratedGpu,
    /// Discrete GPU with dedicated memory.
    DiscreteGpu,
    /// Virtualized GPU.
    VirtualGpu,
    /// Software rasterizer.
    Cpu,
}

bitflags! {
    /// Optional capabilities a device may expose beyond the baseline.
    pub struct Capabilities: u32 {
        /// `DispatchRays` and raytracing pipelines.
        const RAY_PIPELINE = 0x1;
        /// Inline ray queries from any shader stage.
        const RAY_QUERY = 0x2;
        /// Motion-blur acceleration structures.
        const RAY_MOTION_BLUR = 0x4;
        /// Tessellation shaders meeting [`MIN_TESS_PATCH_SIZE`].
        const TESSELLATION = 0x8;
        /// Geometry shaders meeting [`MIN_GS_INVOCATIONS`].
        const GEOMETRY_SHADER = 0x10;
        /// `DrawIndirectCount` / `DispatchRaysIndirect`.
        const INDIRECT_COUNT = 0x20;
        /// Buffer device addresses (required for raytracing).
        const DEVICE_ADDRESS = 0x40;
        /// Writable swapchain images.
        const SWAPCHAIN_COMPUTE = 0x80;
    }
}

/// Minimum tessellation patch size a device must report before
/// [`Capabilities::TESSELLATION`] is advertised.
pub const MIN_TESS_PATCH_SIZE: u32 = 32;

/// Minimum geometry shader invocation count a device must report before
/// [`Capabilities::GEOMETRY_SHADER`] is advertised.
pub const MIN_GS_INVOCATIONS: u32 = 32;

/// Limits of the device relevant to the portable layer.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Limits {
    /// Largest single memory allocation the device accepts.
    pub max_allocation_size: u64,
    /// Total device-local memory budget, in bytes.
    pub dedicated_memory: u64,
    /// Total host-visible memory budget, in bytes.
    pub shared_memory: u64,
    /// Non-coherent host memory flush granularity, non-zero.
    pub non_coherent_atom_size: u64,
    /// Alignment of the start of a buffer used as a GPU copy source.
    pub buffer_copy_offset_alignment: u64,
    /// Row pitch alignment for buffer-image copies (256 on D3D12, 1 on Vulkan).
    pub buffer_copy_pitch_alignment: u64,
    /// Alignment for uniform buffer binding offsets.
    pub uniform_buffer_offset_alignment: u64,
    /// Required alignment between linear and non-linear sub-allocations
    /// inside the same memory block.
    pub buffer_image_granularity: u64,
    /// Maximum 2D texture dimension.
    pub max_texture_size: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_allocation_size: 256 << 20,
            dedicated_memory: 0,
            shared_memory: 0,
            non_coherent_atom_size: 256,
            buffer_copy_offset_alignment: 4,
            buffer_copy_pitch_alignment: 1,
            uniform_buffer_offset_alignment: 256,
            buffer_image_granularity: 1024,
            max_texture_size: 16384,
        }
    }
}

/// Information about one enumerated physical device.
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    /// Device name reported by the driver.
    pub name: String,
    /// PCI vendor id.
    pub vendor: u32,
    /// PCI device id.
    pub device: u32,
    /// Device classification.
    pub device_type: DeviceType,
    /// Optional capabilities.
    pub capabilities: Capabilities,
    /// Device limits.
    pub limits: Limits,
    /// Memory heaps and types.
    pub memory: MemoryProperties,
    /// Backend-side index used to re-open this device.
    pub physical_index: usize,
}

bitflags! {
    /// Vendor filter for [`preferred_device`](crate::Instance::preferred_device).
    pub struct VendorMask: u32 {
        /// NVIDIA.
        const NV = 0x1;
        /// AMD.
        const AMD = 0x2;
        /// Intel.
        const INTEL = 0x4;
        /// Apple.
        const APPLE = 0x8;
        /// Qualcomm.
        const QCOM = 0x10;
        /// ARM.
        const ARM = 0x20;
        /// Anything else.
        const OTHER = 0x8000_0000;
    }
}

bitflags! {
    /// Device-type filter for [`preferred_device`](crate::Instance::preferred_device).
    pub struct TypeMask: u32 {
        /// Discrete GPUs.
        const DISCRETE = 0x1;
        /// Integrated GPUs.
        const INTEGRATED = 0x2;
        /// Virtual GPUs.
        const VIRTUAL = 0x4;
        /// Software devices.
        const CPU = 0x8;
        /// Unclassified devices.
        const OTHER = 0x10;
    }
}

impl DeviceInfo {
    /// Vendor bit for mask filtering.
    pub fn vendor_bit(&self) -> VendorMask {
        match self.vendor {
            0x10DE => VendorMask::NV,
            0x1002 => VendorMask::AMD,
            0x8086 => VendorMask::INTEL,
            0x106B => VendorMask::APPLE,
            0x5143 => VendorMask::QCOM,
            0x13B5 => VendorMask::ARM,
            _ => VendorMask::OTHER,
        }
    }

    /// Type bit for mask filtering.
    pub fn type_bit(&self) -> TypeMask {
        match self.device_type {
            DeviceType::DiscreteGpu => TypeMask::DISCRETE,
            DeviceType::IntegratedGpu => TypeMask::INTEGRATED,
            DeviceType::VirtualGpu => TypeMask::VIRTUAL,
            DeviceType::Cpu => TypeMask::CPU,
            DeviceType::Other => TypeMask::OTHER,
        }
    }

    /// Ranking used when the application has no stronger preference.
    pub(crate) fn score(&self) -> u32 {
        let ty = match self.device_type {
            DeviceType::DiscreteGpu => 4,
            DeviceType::IntegratedGpu => 3,
            DeviceType::VirtualGpu => 2,
            DeviceType::Cpu => 1,
            DeviceType::Other => 0,
        };
        (ty << 8) | self.capabilities.bits().count_ones()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryProperties;

    fn info(ty: DeviceType, caps: Capabilities) -> DeviceInfo {
        DeviceInfo {
            name: String::new(),
            vendor: 0x10DE,
            device: 0,
            device_type: ty,
            capabilities: caps,
            limits: Limits::default(),
            memory: MemoryProperties::default(),
            physical_index: 0,
        }
    }

    #[test]
    fn discrete_beats_integrated() {
        let discrete = info(DeviceType::DiscreteGpu, Capabilities::empty());
        let integrated = info(
            DeviceType::IntegratedGpu,
            Capabilities::RAY_PIPELINE | Capabilities::RAY_QUERY,
        );
        assert!(discrete.score() > integrated.score());
    }

    #[test]
    fn vendor_bits() {
        assert_eq!(
            info(DeviceType::DiscreteGpu, Capabilities::empty()).vendor_bit(),
            VendorMask::NV
        );
    }
}
