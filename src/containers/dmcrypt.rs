use std::path::PathBuf;

use anyhow::{bail, Context, Error};
use log::{error, info, warn};

use osutils::devmapper::TargetVersion;
use osutils::platform::Platform;
use storage_api::config::{DmcryptConfig, StorageContainerType};
use storage_api::keys::{FileSystemKey, FileSystemKeyReference};

use crate::backing::{self, BackingDevice, BackingDeviceType};
use crate::keyring::{self, remove_key_logged, KeyType, Keyring};

use super::StorageContainer;

const SECTOR_SIZE: u64 = 512;
const EXT4_BLOCK_SIZE: u64 = 4096;

// Kernel-keyring key provisioning needs the crypt target at 1.15.0 or
// later; older targets only accept the key inline in the table.
const KEYRING_CRYPT_VERSION: TargetVersion = TargetVersion(1, 15, 0);

/// Raw dm-crypt device over a block-device backing.
pub struct DmcryptContainer<'a> {
    device_name: String,
    cipher: String,
    iv_offset: u64,
    allow_discards: bool,
    backing: Box<dyn BackingDevice + 'a>,
    key_reference: FileSystemKeyReference,
    platform: &'a dyn Platform,
    keyring: &'a dyn Keyring,
}

impl<'a> DmcryptContainer<'a> {
    pub fn new(
        config: &DmcryptConfig,
        key_reference: FileSystemKeyReference,
        platform: &'a dyn Platform,
        keyring: &'a dyn Keyring,
    ) -> Self {
        Self {
            device_name: config.device_name.clone(),
            cipher: config.cipher.clone(),
            iv_offset: config.iv_offset,
            allow_discards: config.allow_discards,
            backing: backing::from_config(&config.backing_device_config, platform),
            key_reference,
            platform,
            keyring,
        }
    }

    fn keyring_supported(&self) -> bool {
        match self.platform.dm_target_version("crypt") {
            Ok(Some(version)) => version >= KEYRING_CRYPT_VERSION,
            Ok(None) => false,
            Err(e) => {
                warn!("Failed to query crypt target version: {e:#}");
                false
            }
        }
    }

    fn crypt_table(&self, sectors: u64, key_descriptor: &str, backing_path: &PathBuf) -> String {
        let mut table = format!(
            "0 {sectors} crypt {} {key_descriptor} {} {} 0",
            self.cipher,
            self.iv_offset,
            backing_path.display()
        );
        if self.allow_discards {
            table.push_str(" allow_discards");
        }
        table
    }

    fn setup_inner(&mut self, key: &FileSystemKey) -> Result<(), Error> {
        self.backing
            .setup()
            .context("Failed to set up backing device")?;

        let backing_path = self
            .backing
            .get_path()
            .context("Backing device has no path")?;

        let blkdev_size = self
            .platform
            .get_blk_size(&backing_path)
            .context("Failed to get block device size")?;
        if blkdev_size < EXT4_BLOCK_SIZE {
            bail!(
                "Backing device '{}' is smaller than a filesystem block",
                backing_path.display()
            );
        }

        let keyring_support = self.keyring_supported();
        let key_descriptor = if keyring_support {
            info!("Using kernel keyring to provision key to dm-crypt");
            self.keyring
                .add_key(KeyType::Dmcrypt, key, &mut self.key_reference)
                .context("Failed to insert dm-crypt logon key")?;
            keyring::dmcrypt_key_descriptor(key.fek.len(), &self.key_reference)
        } else {
            key.fek.to_hex()
        };

        let sectors = blkdev_size / SECTOR_SIZE;
        let table = self.crypt_table(sectors, &key_descriptor, &backing_path);
        if let Err(e) = self.platform.dm_create(&self.device_name, &table) {
            if keyring_support {
                remove_key_logged(self.keyring, KeyType::Dmcrypt, &self.key_reference);
            }
            return Err(e.context("dm_setup failed"));
        }

        // The dm-crypt driver holds its own copy now; the provisioned key
        // must not stay findable in the keyring.
        if keyring_support {
            self.keyring
                .remove_key(KeyType::Dmcrypt, &self.key_reference)
                .context("Failed to invalidate provisioned dm-crypt key")?;
        }

        let device_path = self.platform.dm_device_path(&self.device_name);
        self.platform
            .udev_settle(&device_path)
            .context("udevadm settle failed")?;

        Ok(())
    }
}

impl StorageContainer for DmcryptContainer<'_> {
    fn exists(&self) -> bool {
        self.backing.exists()
    }

    fn setup(&mut self, key: &FileSystemKey) -> Result<(), Error> {
        let created = if self.backing.exists() {
            false
        } else {
            self.backing
                .create()
                .context("Failed to create backing device")?;
            true
        };

        match self.setup_inner(key) {
            Ok(()) => Ok(()),
            Err(e) => {
                // A freshly created backing is purged outright; an existing
                // one is only detached.
                if created {
                    if let Err(purge_err) = self.purge() {
                        error!("Failed to purge after setup failure: {purge_err:#}");
                    }
                } else if let Err(teardown_err) = self.teardown() {
                    error!("Failed to tear down after setup failure: {teardown_err:#}");
                }
                Err(e)
            }
        }
    }

    fn teardown(&mut self) -> Result<(), Error> {
        self.platform
            .dm_remove(&self.device_name, false)
            .context("Failed to remove device-mapper device")?;
        self.backing
            .teardown()
            .context("Failed to tear down backing device")
    }

    fn evict_key(&mut self) -> Result<(), Error> {
        self.platform
            .dm_message(&self.device_name, "key wipe")
            .context("Failed to wipe dm-crypt key")
    }

    fn restore_key(&mut self, key: &FileSystemKey) -> Result<(), Error> {
        let keyring_support = self.keyring_supported();
        let key_descriptor = if keyring_support {
            self.keyring
                .add_key(KeyType::Dmcrypt, key, &mut self.key_reference)
                .context("Failed to re-insert dm-crypt logon key")?;
            keyring::dmcrypt_key_descriptor(key.fek.len(), &self.key_reference)
        } else {
            key.fek.to_hex()
        };

        let result = self
            .platform
            .dm_message(&self.device_name, &format!("key set {key_descriptor}"))
            .context("Failed to rebind dm-crypt key");

        if keyring_support {
            remove_key_logged(self.keyring, KeyType::Dmcrypt, &self.key_reference);
        }
        result
    }

    fn purge(&mut self) -> Result<(), Error> {
        // Stale dm-crypt devices may need an extra teardown before the
        // backing storage can be released.
        if let Err(e) = self.teardown() {
            warn!("Teardown before purge reported: {e:#}");
        }
        self.backing.purge()
    }

    fn set_lazy_teardown_when_unused(&mut self) -> Result<(), Error> {
        self.platform
            .dm_remove(&self.device_name, true)
            .context("Failed to mark device-mapper device for deferred removal")?;

        if self.backing.get_type() != BackingDeviceType::Loopback {
            bail!("Backing device does not support lazy teardown");
        }
        self.backing
            .teardown()
            .context("Failed to lazily tear down backing device")
    }

    fn get_type(&self) -> StorageContainerType {
        StorageContainerType::Dmcrypt
    }

    fn get_backing_location(&self) -> PathBuf {
        self.platform.dm_device_path(&self.device_name)
    }
}
