use std::path::PathBuf;

use anyhow::{bail, Error};
use log::warn;

use osutils::platform::Platform;

use super::{BackingDevice, BackingDeviceType};

/// Loopback over a tmpfs-backed file. The backing file holds no durable
/// data, so teardown releases it as well.
pub struct RamdiskDevice<'a> {
    backing_file: PathBuf,
    platform: &'a dyn Platform,
}

impl<'a> RamdiskDevice<'a> {
    pub fn new(backing_file: PathBuf, platform: &'a dyn Platform) -> Self {
        Self {
            backing_file,
            platform,
        }
    }

    /// The ramdisk is sized by the caller at creation time, from the free
    /// space of the tmpfs it lives on.
    pub fn create_sized(&self, size: u64) -> Result<(), Error> {
        if size == 0 {
            bail!(
                "Refusing to create zero-sized ramdisk '{}'",
                self.backing_file.display()
            );
        }
        self.platform
            .create_sparse_file(&self.backing_file, size)
    }
}

impl BackingDevice for RamdiskDevice<'_> {
    fn create(&self) -> Result<(), Error> {
        // Size the backing to the tmpfs that holds it.
        let size = self.platform.statvfs_size(
            self.backing_file
                .parent()
                .unwrap_or(&self.backing_file),
        )?;
        self.create_sized(size)
    }

    fn setup(&self) -> Result<(), Error> {
        if self.platform.loop_device_for(&self.backing_file)?.is_some() {
            return Ok(());
        }
        self.platform.attach_loop(&self.backing_file)?;
        Ok(())
    }

    fn teardown(&self) -> Result<(), Error> {
        match self.platform.loop_device_for(&self.backing_file)? {
            Some(device) => self.platform.detach_loop(&device)?,
            None => warn!(
                "No loop device attached to ramdisk '{}'",
                self.backing_file.display()
            ),
        }
        // Nothing in the file outlives the session.
        self.purge()
    }

    fn purge(&self) -> Result<(), Error> {
        if self.platform.file_exists(&self.backing_file) {
            self.platform.delete_file(&self.backing_file)?;
        }
        Ok(())
    }

    /// Ramdisks are rebuilt from scratch on every setup.
    fn exists(&self) -> bool {
        false
    }

    fn get_path(&self) -> Option<PathBuf> {
        self.platform
            .loop_device_for(&self.backing_file)
            .ok()
            .flatten()
    }

    fn get_type(&self) -> BackingDeviceType {
        BackingDeviceType::Ramdisk
    }
}
