use std::path::{Path, PathBuf};

use anyhow::{Context, Error};
use log::error;

use osutils::platform::Platform;
use storage_api::config::StorageContainerType;
use storage_api::keys::FileSystemKey;
use storage_api::layout;
use storage_api::users::ObfuscatedUsername;

use crate::backing::{BackingDevice, RamdiskDevice};

use super::StorageContainer;

// Ephemeral homes live in RAM; skip the journal and reserved blocks.
fn ephemeral_mkfs_opts() -> Vec<String> {
    ["-T", "default", "-m", "0", "-O", "^huge_file,^flex_bg,^has_journal"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Ramdisk-backed ext4 container, formatted afresh on every setup.
pub struct EphemeralContainer<'a> {
    sparse_file: PathBuf,
    backing: RamdiskDevice<'a>,
    platform: &'a dyn Platform,
}

impl<'a> EphemeralContainer<'a> {
    pub fn new(user: &ObfuscatedUsername, platform: &'a dyn Platform) -> Self {
        let sparse_file = layout::ephemeral_sparse_file(user);
        Self {
            sparse_file: sparse_file.clone(),
            backing: RamdiskDevice::new(sparse_file, platform),
            platform,
        }
    }

    fn device_path(&self) -> Result<PathBuf, Error> {
        self.backing
            .get_path()
            .context("Ephemeral backing device is not attached")
    }
}

impl StorageContainer for EphemeralContainer<'_> {
    /// Ephemeral state never survives; there is nothing to find on disk.
    fn exists(&self) -> bool {
        false
    }

    fn setup(&mut self, _key: &FileSystemKey) -> Result<(), Error> {
        // Sized to the tmpfs under the ephemeral root, which init mounts.
        let size = self
            .platform
            .statvfs_size(Path::new(layout::EPHEMERAL_CRYPTOHOME_DIR))
            .context("Can't determine ephemeral cryptohome size")?;
        self.backing
            .create_sized(size)
            .context("Failed to create ephemeral backing file")?;

        if let Err(e) = self.backing.setup() {
            if let Err(purge_err) = self.backing.purge() {
                error!("Failed to purge ephemeral backing: {purge_err:#}");
            }
            return Err(e.context("Failed to attach ephemeral backing device"));
        }

        let device = match self.device_path() {
            Ok(device) => device,
            Err(e) => {
                if let Err(teardown_err) = self.backing.teardown() {
                    error!("Failed to tear down ephemeral backing: {teardown_err:#}");
                }
                return Err(e);
            }
        };

        if let Err(e) = self
            .platform
            .format_ext4(&device, &ephemeral_mkfs_opts())
        {
            if let Err(teardown_err) = self.backing.teardown() {
                error!("Failed to tear down ephemeral backing: {teardown_err:#}");
            }
            return Err(e.context("Failed to format ephemeral filesystem"));
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), Error> {
        self.backing.teardown()
    }

    fn reset(&mut self) -> Result<(), Error> {
        let device = self.device_path()?;
        self.platform
            .format_ext4(&device, &ephemeral_mkfs_opts())
            .context("Failed to reformat ephemeral filesystem")
    }

    fn purge(&mut self) -> Result<(), Error> {
        self.backing.purge()
    }

    fn get_type(&self) -> StorageContainerType {
        StorageContainerType::Ephemeral
    }

    fn get_backing_location(&self) -> PathBuf {
        self.backing
            .get_path()
            .unwrap_or_else(|| self.sparse_file.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use osutils::testutils::FakePlatform;

    fn user() -> ObfuscatedUsername {
        ObfuscatedUsername::from_sanitized("0123456789abcdef").unwrap()
    }

    #[test]
    fn setup_attaches_and_formats_every_time() {
        let platform = FakePlatform::new();
        let mut container = EphemeralContainer::new(&user(), &platform);

        assert!(!container.exists());
        container.setup(&FileSystemKey::default()).unwrap();
        assert!(!container.exists());

        let device = container.get_backing_location();
        assert!(platform.was_formatted(&device));

        container.reset().unwrap();

        container.teardown().unwrap();
        assert!(!platform.file_exists(Path::new(
            "/run/cryptohome/ephemeral_data/0123456789abcdef"
        )));
    }

    #[test]
    fn zero_sized_tmpfs_refuses_setup() {
        let platform = FakePlatform::new();
        platform.set_statvfs_size(0);
        let mut container = EphemeralContainer::new(&user(), &platform);
        container.setup(&FileSystemKey::default()).unwrap_err();
    }
}
