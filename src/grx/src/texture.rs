//! Device textures.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::{
    backend::BackendDevice,
    barrier::ResourceState,
    error::{Error, Result},
    format::Format,
    resource::{DeviceRef, ResourceFlags, ResourceInfo},
    Backend,
};

/// Dimensionality of a texture.
#[allow(missing_docs)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum TextureType {
    D2,
    D3,
    Cube,
}

bitflags! {
    /// How a texture's image may be used.
    pub struct TextureUsage: u32 {
        /// Sampled in shaders.
        const SAMPLED = 0x1;
        /// Written as a storage image.
        const STORAGE = 0x2;
        /// Color attachment.
        const COLOR_ATTACHMENT = 0x4;
        /// Depth/stencil attachment.
        const DEPTH_ATTACHMENT = 0x8;
        /// Copy source.
        const COPY_SRC = 0x10;
        /// Copy destination.
        const COPY_DST = 0x20;
    }
}

/// Texture creation description, also consumed by the backend for view
/// creation and copy footprints.
#[derive(Clone, Copy, Debug)]
pub struct TextureDesc {
    /// Dimensionality.
    pub ty: TextureType,
    /// Texel format.
    pub format: Format,
    /// Width in texels.
    pub width: u32,
    /// Height in texels.
    pub height: u32,
    /// Depth (3D) or array layers (2D/cube).
    pub depth_or_layers: u32,
    /// Mip level count.
    pub mips: u32,
    /// Usage bits.
    pub usage: TextureUsage,
}

impl TextureDesc {
    /// Total byte size of mip 0 across layers.
    pub fn data_size(&self) -> u64 {
        self.format
            .layer_size(self.width, self.height, self.depth_or_layers)
    }

    /// Bytes in one tightly packed row of texel blocks.
    pub fn row_size(&self) -> u64 {
        self.format.layer_size(self.width, 1, 1)
    }
}

/// A dirty texel box, `origin .. origin + extent` on mip 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureRange {
    /// Texel origin.
    pub origin: [u32; 3],
    /// Texel extent.
    pub extent: [u32; 3],
}

impl TextureRange {
    fn end(&self) -> [u32; 3] {
        [
            self.origin[0] + self.extent[0],
            self.origin[1] + self.extent[1],
            self.origin[2] + self.extent[2],
        ]
    }

    fn intersects(&self, other: &TextureRange) -> bool {
        let (ae, be) = (self.end(), other.end());
        (0..3).all(|i| self.origin[i] <= be[i] && other.origin[i] <= ae[i])
    }

    fn union(&self, other: &TextureRange) -> TextureRange {
        let (ae, be) = (self.end(), other.end());
        let origin = [
            self.origin[0].min(other.origin[0]),
            self.origin[1].min(other.origin[1]),
            self.origin[2].min(other.origin[2]),
        ];
        TextureRange {
            origin,
            extent: [
                ae[0].max(be[0]) - origin[0],
                ae[1].max(be[1]) - origin[1],
                ae[2].max(be[2]) - origin[2],
            ],
        }
    }
}

/// Merge touching boxes until no pair intersects.
pub(crate) fn merge_boxes(boxes: &mut Vec<TextureRange>) {
    let mut merged = true;
    while merged {
        merged = false;
        'outer: for i in 0..boxes.len() {
            for j in i + 1..boxes.len() {
                if boxes[i].intersects(&boxes[j]) {
                    let union = boxes[i].union(&boxes[j]);
                    boxes[i] = union;
                    boxes.swap_remove(j);
                    merged = true;
                    break 'outer;
                }
            }
        }
    }
}

pub(crate) struct TextureState {
    pub cpu_data: Option<Vec<u8>>,
    pub pending: Vec<TextureRange>,
    pub first_frame: bool,
}

pub(crate) struct TextureInner<B: Backend> {
    pub(crate) info: ResourceInfo,
    pub(crate) desc: TextureDesc,
    pub(crate) raw: Option<B::Image>,
    pub(crate) state: Mutex<TextureState>,
    pub(crate) track: Mutex<ResourceState>,
    pub(crate) device: DeviceRef<B>,
}

impl<B: Backend> TextureInner<B> {
    pub(crate) fn raw(&self) -> &B::Image {
        self.raw.as_ref().expect("texture already destroyed")
    }

    pub(crate) fn mark_dirty(
        &self,
        x: u32,
        y: u32,
        z: u32,
        mut w: u32,
        mut h: u32,
        mut d: u32,
    ) -> Result<()> {
        let desc = &self.desc;
        if w == 0 {
            w = desc.width.saturating_sub(x);
        }
        if h == 0 {
            h = desc.height.saturating_sub(y);
        }
        if d == 0 {
            d = desc.depth_or_layers.saturating_sub(z);
        }
        if x + w > desc.width || y + h > desc.height || z + d > desc.depth_or_layers {
            return Err(Error::OutOfBounds("dirty region exceeds texture extent"));
        }
        let fmt = desc.format.desc();
        if x % fmt.block_width != 0
            || y % fmt.block_height != 0
            || (w % fmt.block_width != 0 && x + w != desc.width)
            || (h % fmt.block_height != 0 && y + h != desc.height)
        {
            return Err(Error::InvalidParameter(
                "dirty region not aligned to the format's block size",
            ));
        }
        let mut state = self.state.lock();
        if state.cpu_data.is_none() {
            return Err(Error::InvalidOperation(
                "texture has no CPU data to mark dirty",
            ));
        }
        state.pending.push(TextureRange {
            origin: [x, y, z],
            extent: [w, h, d],
        });
        merge_boxes(&mut state.pending);
        Ok(())
    }
}

impl<B: Backend> Drop for TextureInner<B> {
    fn drop(&mut self) {
        let device = match self.device.upgrade() {
            Some(device) if !device.is_torn_down() => device,
            _ => return,
        };
        device.free_handles(&self.info.handles());
        if let Some(raw) = self.raw.take() {
            unsafe { device.raw().destroy_image(raw) };
        }
        if self.info.allocated {
            device.free_allocation(self.info.block_id, self.info.block_offset);
        }
    }
}

/// A reference-counted device texture.
pub struct DeviceTexture<B: Backend> {
    pub(crate) inner: Arc<TextureInner<B>>,
}

impl<B: Backend> Clone for DeviceTexture<B> {
    fn clone(&self) -> Self {
        DeviceTexture {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> DeviceTexture<B> {
    /// Creation description.
    pub fn desc(&self) -> &TextureDesc {
        &self.inner.desc
    }

    /// Bindless read slot, or null.
    pub fn read_handle(&self) -> crate::descriptor::ResourceHandle {
        self.inner.info.read_handle
    }

    /// Bindless write slot, or null.
    pub fn write_handle(&self) -> crate::descriptor::ResourceHandle {
        self.inner.info.write_handle
    }

    /// Mark the texel box at `(x, y, z)` with extent `(w, h, d)` as modified
    /// in the CPU shadow. Zero extents run to the edge of the texture.
    pub fn mark_dirty(&self, x: u32, y: u32, z: u32, w: u32, h: u32, d: u32) -> Result<()> {
        self.inner.mark_dirty(x, y, z, w, h, d)?;
        if let Some(device) = self.inner.device.upgrade() {
            device.push_pending_texture(&self.inner);
        }
        Ok(())
    }

    /// Whether the texture keeps its CPU shadow alive.
    pub fn is_cpu_backed(&self) -> bool {
        self.inner.info.flags.contains(ResourceFlags::CPU_BACKED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disjoint_boxes_stay_apart() {
        let mut boxes = vec![
            TextureRange {
                origin: [0, 0, 0],
                extent: [4, 4, 1],
            },
            TextureRange {
                origin: [16, 16, 0],
                extent: [4, 4, 1],
            },
        ];
        merge_boxes(&mut boxes);
        assert_eq!(boxes.len(), 2);
    }

    #[test]
    fn overlapping_boxes_merge_to_bounds() {
        let mut boxes = vec![
            TextureRange {
                origin: [0, 0, 0],
                extent: [8, 8, 1],
            },
            TextureRange {
                origin: [4, 4, 0],
                extent: [8, 8, 1],
            },
        ];
        merge_boxes(&mut boxes);
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].origin, [0, 0, 0]);
        assert_eq!(boxes[0].extent, [12, 12, 1]);
    }
}
