use std::path::PathBuf;

use anyhow::{bail, Error};
use log::error;

use osutils::platform::Platform;

use super::{BackingDevice, BackingDeviceType};

/// Sparse file attached through a loop device.
pub struct LoopbackDevice<'a> {
    backing_file: PathBuf,
    size: u64,
    platform: &'a dyn Platform,
}

impl<'a> LoopbackDevice<'a> {
    pub fn new(backing_file: PathBuf, size: u64, platform: &'a dyn Platform) -> Self {
        Self {
            backing_file,
            size,
            platform,
        }
    }
}

impl BackingDevice for LoopbackDevice<'_> {
    fn create(&self) -> Result<(), Error> {
        if self.size == 0 {
            bail!(
                "Refusing to create zero-sized backing file '{}'",
                self.backing_file.display()
            );
        }
        self.platform
            .create_sparse_file(&self.backing_file, self.size)
    }

    fn setup(&self) -> Result<(), Error> {
        // Re-attaching an already attached file would produce a second
        // device over the same backing.
        if self.platform.loop_device_for(&self.backing_file)?.is_some() {
            return Ok(());
        }
        self.platform.attach_loop(&self.backing_file)?;
        Ok(())
    }

    fn teardown(&self) -> Result<(), Error> {
        match self.platform.loop_device_for(&self.backing_file)? {
            Some(device) => self.platform.detach_loop(&device),
            None => bail!(
                "No loop device attached to '{}'",
                self.backing_file.display()
            ),
        }
    }

    fn purge(&self) -> Result<(), Error> {
        self.platform.delete_file(&self.backing_file)
    }

    fn exists(&self) -> bool {
        self.platform.file_exists(&self.backing_file)
    }

    fn get_path(&self) -> Option<PathBuf> {
        match self.platform.loop_device_for(&self.backing_file) {
            Ok(device) => device,
            Err(e) => {
                error!(
                    "Failed to look up loop device for '{}': {e:#}",
                    self.backing_file.display()
                );
                None
            }
        }
    }

    fn get_type(&self) -> BackingDeviceType {
        BackingDeviceType::Loopback
    }
}
