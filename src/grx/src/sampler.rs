//! Samplers.

use std::sync::Arc;

use crate::{
    backend::BackendDevice,
    resource::{DeviceRef, ResourceInfo},
    Backend,
};

/// Texel filtering mode.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Filter {
    Nearest,
    Linear,
}

/// Mip level selection mode.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum MipMode {
    Nearest,
    Linear,
}

/// Coordinate wrapping outside `[0, 1)`.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum AddressMode {
    Repeat,
    MirrorRepeat,
    ClampToEdge,
    ClampToBorder,
}

/// Border color for [`AddressMode::ClampToBorder`].
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum BorderColor {
    TransparentBlack,
    OpaqueBlack,
    OpaqueWhite,
}

/// Depth comparison for shadow samplers.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum CompareOp {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

/// Full sampler description.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplerDesc {
    /// Magnification filter.
    pub mag: Filter,
    /// Minification filter.
    pub min: Filter,
    /// Mip selection.
    pub mip: MipMode,
    /// U axis wrapping.
    pub address_u: AddressMode,
    /// V axis wrapping.
    pub address_v: AddressMode,
    /// W axis wrapping.
    pub address_w: AddressMode,
    /// Anisotropy; 0 disables.
    pub max_anisotropy: u8,
    /// Depth comparison, for shadow sampling.
    pub compare: Option<CompareOp>,
    /// Border color for clamp-to-border axes.
    pub border: BorderColor,
    /// Minimum mip level.
    pub min_lod: f32,
    /// Maximum mip level.
    pub max_lod: f32,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        SamplerDesc {
            mag: Filter::Linear,
            min: Filter::Linear,
            mip: MipMode::Linear,
            address_u: AddressMode::Repeat,
            address_v: AddressMode::Repeat,
            address_w: AddressMode::Repeat,
            max_anisotropy: 0,
            compare: None,
            border: BorderColor::OpaqueBlack,
            min_lod: 0.0,
            max_lod: f32::MAX,
        }
    }
}

pub(crate) struct SamplerInner<B: Backend> {
    pub(crate) info: ResourceInfo,
    pub(crate) raw: Option<B::Sampler>,
    pub(crate) device: DeviceRef<B>,
}

impl<B: Backend> SamplerInner<B> {
    pub(crate) fn raw(&self) -> &B::Sampler {
        self.raw.as_ref().expect("sampler already destroyed")
    }
}

impl<B: Backend> Drop for SamplerInner<B> {
    fn drop(&mut self) {
        let device = match self.device.upgrade() {
            Some(device) if !device.is_torn_down() => device,
            _ => return,
        };
        device.free_handles(&self.info.handles());
        if let Some(raw) = self.raw.take() {
            unsafe { device.raw().destroy_sampler(raw) };
        }
    }
}

/// A reference-counted sampler with a bindless slot.
pub struct Sampler<B: Backend> {
    pub(crate) inner: Arc<SamplerInner<B>>,
}

impl<B: Backend> Clone for Sampler<B> {
    fn clone(&self) -> Self {
        Sampler {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> Sampler<B> {
    /// Bindless slot shaders sample through.
    pub fn handle(&self) -> crate::descriptor::ResourceHandle {
        self.inner.info.read_handle
    }
}
