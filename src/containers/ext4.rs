use std::path::PathBuf;

use anyhow::{Context, Error};
use log::{error, info, warn};

use osutils::e2fsck::{FsckOption, FSCK_ERRORS_CORRECTED, FSCK_ERRORS_LEFT_UNCORRECTED, FSCK_SUCCESS};
use osutils::platform::Platform;
use storage_api::config::{FilesystemConfig, RecoveryType, StorageContainerType};
use storage_api::keys::FileSystemKey;

use super::StorageContainer;

/// Ext4 filesystem layered over a block container, typically dm-crypt.
pub struct Ext4Container<'a> {
    mkfs_opts: Vec<String>,
    tune2fs_opts: Vec<String>,
    recovery: RecoveryType,
    backing: Box<dyn StorageContainer + 'a>,
    platform: &'a dyn Platform,
}

impl<'a> Ext4Container<'a> {
    pub fn new(
        config: &FilesystemConfig,
        backing: Box<dyn StorageContainer + 'a>,
        platform: &'a dyn Platform,
    ) -> Self {
        Self {
            mkfs_opts: config.mkfs_opts.clone(),
            tune2fs_opts: config.tune2fs_opts.clone(),
            recovery: config.recovery,
            backing,
            platform,
        }
    }

    fn rollback(&mut self, created: bool) {
        let result = if created {
            self.backing.purge()
        } else {
            self.backing.teardown()
        };
        if let Err(e) = result {
            error!("Failed to roll back filesystem container: {e:#}");
        }
    }

    fn setup_inner(&mut self, key: &FileSystemKey, mut created: bool) -> Result<(), Error> {
        let backing_location = self.backing.get_backing_location();

        let mut fsck_err = FSCK_SUCCESS;
        let mut deep_fsck_ran = false;
        if !created {
            // Preen-mode check first; a deep check only runs when errors
            // are known to remain.
            fsck_err = self
                .platform
                .fsck(&backing_location, FsckOption::Preen)
                .context("Failed to run fsck")?;

            if fsck_err & FSCK_ERRORS_LEFT_UNCORRECTED != 0 {
                warn!(
                    "'{}' needs more filesystem cleanup: fsck returned {fsck_err}",
                    backing_location.display()
                );
                match self.recovery {
                    RecoveryType::EnforceCleaning => {
                        fsck_err = self
                            .platform
                            .fsck(&backing_location, FsckOption::Full)
                            .context("Failed to run full fsck")?;
                        deep_fsck_ran = true;
                    }
                    RecoveryType::Purge => {
                        warn!("'{}' is being recreated", backing_location.display());
                        self.backing.purge().context("Failed to purge filesystem")?;
                        self.backing
                            .setup(key)
                            .context("Failed to recreate backing container")?;
                        created = true;
                        fsck_err = FSCK_SUCCESS;
                    }
                    RecoveryType::DoNothing => {}
                }
            }
            if fsck_err & !FSCK_ERRORS_CORRECTED != FSCK_SUCCESS {
                error!(
                    "'{}': fsck found uncorrected errors: {fsck_err}",
                    backing_location.display()
                );
            }
        }

        if created {
            info!("Formatting '{}' as ext4", backing_location.display());
            self.platform
                .format_ext4(&backing_location, &self.mkfs_opts)
                .context("Failed to format ext4 filesystem")?;
        }

        if !self.tune2fs_opts.is_empty() {
            if let Err(e) = self.platform.tune2fs(&backing_location, &self.tune2fs_opts) {
                if created {
                    return Err(e.context("Failed to tune a newly created filesystem"));
                }
                if deep_fsck_ran {
                    return Err(e.context("Failed to tune after a deep fsck"));
                }
                warn!(
                    "Failed to tune ext4 filesystem on '{}', continuing: {e:#}",
                    backing_location.display()
                );
            }
        }

        Ok(())
    }
}

impl StorageContainer for Ext4Container<'_> {
    fn exists(&self) -> bool {
        self.backing.exists()
    }

    fn setup(&mut self, key: &FileSystemKey) -> Result<(), Error> {
        let created = !self.backing.exists();
        if created {
            info!("Creating backing container for filesystem");
        }
        self.backing
            .setup(key)
            .context("Failed to set up backing container")?;

        match self.setup_inner(key, created) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.rollback(created);
                Err(e)
            }
        }
    }

    fn teardown(&mut self) -> Result<(), Error> {
        self.backing.teardown()
    }

    fn evict_key(&mut self) -> Result<(), Error> {
        self.backing.evict_key()
    }

    fn restore_key(&mut self, key: &FileSystemKey) -> Result<(), Error> {
        self.backing.restore_key(key)
    }

    fn reset(&mut self) -> Result<(), Error> {
        self.platform
            .format_ext4(&self.backing.get_backing_location(), &self.mkfs_opts)
            .context("Failed to reformat filesystem")
    }

    fn purge(&mut self) -> Result<(), Error> {
        self.backing.purge()
    }

    fn set_lazy_teardown_when_unused(&mut self) -> Result<(), Error> {
        self.backing.set_lazy_teardown_when_unused()
    }

    fn get_type(&self) -> StorageContainerType {
        StorageContainerType::Ext4
    }

    fn get_backing_location(&self) -> PathBuf {
        self.backing.get_backing_location()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use osutils::testutils::FakePlatform;
    use storage_api::config::{BackingDeviceConfig, DmcryptConfig};
    use storage_api::keys::{FileSystemKeyReference, SecureBytes};

    use crate::containers::DmcryptContainer;
    use crate::keyring::testing::FakeKeyring;

    const DEVICE: &str = "/dev/mapper/dmcrypt-u-data";

    fn key() -> FileSystemKey {
        FileSystemKey {
            fek: SecureBytes::new(vec![0x5a; 64]),
            ..Default::default()
        }
    }

    fn container<'a>(
        platform: &'a FakePlatform,
        keyring: &'a FakeKeyring,
        recovery: RecoveryType,
    ) -> Ext4Container<'a> {
        let dmcrypt = DmcryptContainer::new(
            &DmcryptConfig {
                backing_device_config: BackingDeviceConfig::Loopback {
                    file: "/home/.shadow/u/backing".into(),
                    size: 1 << 20,
                },
                device_name: "dmcrypt-u-data".into(),
                cipher: "aes-xts-plain64".into(),
                iv_offset: 0,
                allow_discards: true,
            },
            FileSystemKeyReference {
                fek_sig: vec![0xaa, 0xbb],
                fnek_sig: vec![],
            },
            platform,
            keyring,
        );
        Ext4Container::new(
            &FilesystemConfig {
                mkfs_opts: vec!["-O".into(), "^huge_file,^flex_bg".into()],
                tune2fs_opts: vec!["-O".into(), "verity,quota,project".into()],
                recovery,
            },
            Box::new(dmcrypt),
            platform,
        )
    }

    #[test]
    fn fresh_setup_formats_and_tunes() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        let mut ext4 = container(&platform, &keyring, RecoveryType::DoNothing);

        ext4.setup(&key()).unwrap();
        assert!(platform.was_formatted(Path::new(DEVICE)));
        assert_eq!(platform.tune2fs_applied(Path::new(DEVICE)).len(), 1);
    }

    #[test]
    fn existing_filesystem_is_checked_not_formatted() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        {
            let mut ext4 = container(&platform, &keyring, RecoveryType::DoNothing);
            ext4.setup(&key()).unwrap();
            ext4.teardown().unwrap();
        }

        // Second setup sees existing state: fsck runs, mkfs does not.
        let platform2 = platform;
        let mut ext4 = container(&platform2, &keyring, RecoveryType::DoNothing);
        assert!(ext4.exists());
        ext4.setup(&key()).unwrap();
    }

    #[test]
    fn tune2fs_failure_is_fatal_on_fresh_filesystem() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        platform.fail_tune2fs(Path::new(DEVICE));
        let mut ext4 = container(&platform, &keyring, RecoveryType::DoNothing);

        ext4.setup(&key()).unwrap_err();
        // Rollback purged the fresh backing.
        assert!(!platform.file_exists(Path::new("/home/.shadow/u/backing")));
    }

    #[test]
    fn tune2fs_failure_is_downgraded_on_existing_filesystem() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        {
            let mut ext4 = container(&platform, &keyring, RecoveryType::DoNothing);
            ext4.setup(&key()).unwrap();
            ext4.teardown().unwrap();
        }

        platform.fail_tune2fs(Path::new(DEVICE));
        let mut ext4 = container(&platform, &keyring, RecoveryType::DoNothing);
        ext4.setup(&key()).unwrap();
    }

    #[test]
    fn uncorrected_errors_trigger_recovery_policy() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        {
            let mut ext4 = container(&platform, &keyring, RecoveryType::Purge);
            ext4.setup(&key()).unwrap();
            ext4.teardown().unwrap();
        }

        platform.set_fsck_result(Path::new(DEVICE), FSCK_ERRORS_LEFT_UNCORRECTED);
        let mut ext4 = container(&platform, &keyring, RecoveryType::Purge);
        ext4.setup(&key()).unwrap();
        // Purge recovery recreated the filesystem from scratch.
        assert!(platform.was_formatted(Path::new(DEVICE)));
    }

    #[test]
    fn reset_reformats_in_place() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        let mut ext4 = container(&platform, &keyring, RecoveryType::DoNothing);

        ext4.setup(&key()).unwrap();
        ext4.reset().unwrap();
        assert!(platform.was_formatted(Path::new(DEVICE)));
    }
}
