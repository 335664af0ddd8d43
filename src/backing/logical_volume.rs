use std::path::PathBuf;

use anyhow::Error;

use osutils::{lvm::Thinpool, platform::Platform};

use super::{BackingDevice, BackingDeviceType};

/// Thin logical volume in a preconfigured volume group.
pub struct LogicalVolumeDevice<'a> {
    name: String,
    /// Size in MiB.
    size: u64,
    pool: Thinpool,
    platform: &'a dyn Platform,
}

impl<'a> LogicalVolumeDevice<'a> {
    pub fn new(
        name: String,
        size: u64,
        volume_group: String,
        thinpool: String,
        platform: &'a dyn Platform,
    ) -> Self {
        Self {
            name,
            size,
            pool: Thinpool {
                volume_group,
                thinpool,
            },
            platform,
        }
    }
}

impl BackingDevice for LogicalVolumeDevice<'_> {
    fn create(&self) -> Result<(), Error> {
        self.platform
            .lv_create_thin(&self.pool, &self.name, self.size)
    }

    fn setup(&self) -> Result<(), Error> {
        self.platform
            .lv_activate(&self.pool.volume_group, &self.name)?;
        Ok(())
    }

    fn teardown(&self) -> Result<(), Error> {
        self.platform
            .lv_deactivate(&self.pool.volume_group, &self.name)
    }

    fn purge(&self) -> Result<(), Error> {
        self.platform
            .lv_remove(&self.pool.volume_group, &self.name)
    }

    fn exists(&self) -> bool {
        self.platform
            .lv_exists(&self.pool.volume_group, &self.name)
            .unwrap_or(false)
    }

    fn get_path(&self) -> Option<PathBuf> {
        self.exists()
            .then(|| osutils::lvm::device_path(&self.pool.volume_group, &self.name))
    }

    fn get_type(&self) -> BackingDeviceType {
        BackingDeviceType::LogicalVolume
    }
}
