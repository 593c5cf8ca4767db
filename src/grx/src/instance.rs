//! The backend instance and device selection.

use std::sync::Arc;

use crate::{
    adapter::{Capabilities, DeviceInfo, TypeMask, VendorMask},
    backend::{BackendInstance, DeviceFlags},
    error::{Error, Result},
    Backend,
};

/// Root object: brings up the selected backend and enumerates devices.
pub struct Instance<B: Backend> {
    pub(crate) raw: Arc<B::Instance>,
    flags: DeviceFlags,
}

impl<B: Backend> Clone for Instance<B> {
    fn clone(&self) -> Self {
        Instance {
            raw: Arc::clone(&self.raw),
            flags: self.flags,
        }
    }
}

impl<B: Backend> Instance<B> {
    /// Bring up the backend. `DEBUG` enables validation and leak tracking,
    /// `VERBOSE` traces what was enabled.
    pub fn create(app_name: &str, app_version: u32, flags: DeviceFlags) -> Result<Self> {
        let raw = B::Instance::create(app_name, app_version, flags)?;
        if flags.contains(DeviceFlags::VERBOSE) {
            debug!("instance created for '{}' v{}", app_name, app_version);
        }
        Ok(Instance {
            raw: Arc::new(raw),
            flags,
        })
    }

    /// Flags the instance was created with.
    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    /// Enumerate all physical devices.
    pub fn device_infos(&self) -> Result<Vec<DeviceInfo>> {
        self.raw.enumerate_devices()
    }

    /// Pick the best device matching the filters.
    ///
    /// Devices missing `required` capabilities or filtered out by the
    /// vendor/type masks are skipped; among the rest, discrete beats
    /// integrated and capability count breaks ties.
    pub fn preferred_device(
        &self,
        required: Capabilities,
        vendors: VendorMask,
        types: TypeMask,
        verbose: bool,
    ) -> Result<DeviceInfo> {
        let infos = self.device_infos()?;
        let mut best: Option<DeviceInfo> = None;
        for info in infos {
            if !info.capabilities.contains(required) {
                if verbose {
                    debug!(
                        "skipping '{}': missing capabilities {:?}",
                        info.name,
                        required - info.capabilities
                    );
                }
                continue;
            }
            if !vendors.contains(info.vendor_bit()) || !types.contains(info.type_bit()) {
                if verbose {
                    debug!("skipping '{}': filtered by vendor/type mask", info.name);
                }
                continue;
            }
            if best.as_ref().map_or(true, |b| info.score() > b.score()) {
                best = Some(info);
            }
        }
        match best {
            Some(info) => {
                if verbose {
                    debug!("preferred device: '{}'", info.name);
                }
                Ok(info)
            }
            None => Err(Error::NotFound("no compatible graphics device")),
        }
    }
}
