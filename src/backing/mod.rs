//! Block-device backings for encrypted containers.

mod logical_volume;
mod loopback;
mod ramdisk;

use std::path::PathBuf;

use anyhow::Error;

use osutils::platform::Platform;
use storage_api::config::BackingDeviceConfig;

pub use logical_volume::LogicalVolumeDevice;
pub use loopback::LoopbackDevice;
pub use ramdisk::RamdiskDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackingDeviceType {
    Loopback,
    Ramdisk,
    LogicalVolume,
}

/// A block device that can back an encrypted container.
///
/// `setup` is idempotent with respect to this device's own state: a backing
/// that is already attached stays attached, but a device is never attached a
/// second time under a different identity.
pub trait BackingDevice {
    /// Creates the persistent state of the device.
    fn create(&self) -> Result<(), Error>;

    /// Attaches the device and makes a block device node available.
    fn setup(&self) -> Result<(), Error>;

    /// Detaches the device.
    fn teardown(&self) -> Result<(), Error>;

    /// Releases the underlying storage.
    fn purge(&self) -> Result<(), Error>;

    /// True iff the persistent state of the device exists.
    fn exists(&self) -> bool;

    /// Path of the attached block device, if available.
    fn get_path(&self) -> Option<PathBuf>;

    fn get_type(&self) -> BackingDeviceType;
}

/// Builds the backing device described by `config`.
pub fn from_config<'a>(
    config: &BackingDeviceConfig,
    platform: &'a dyn Platform,
) -> Box<dyn BackingDevice + 'a> {
    match config {
        BackingDeviceConfig::Loopback { file, size } => {
            Box::new(LoopbackDevice::new(file.clone(), *size, platform))
        }
        BackingDeviceConfig::Ramdisk { file } => {
            Box::new(RamdiskDevice::new(file.clone(), platform))
        }
        BackingDeviceConfig::LogicalVolume {
            name,
            size,
            vg,
            thinpool,
        } => Box::new(LogicalVolumeDevice::new(
            name.clone(),
            *size,
            vg.clone(),
            thinpool.clone(),
            platform,
        )),
    }
}
