//! Builds [`CryptohomeVault`]s with the correct container stack per type.

use std::collections::HashMap;

use anyhow::{bail, Context, Error};
use log::error;

use osutils::lvm::Thinpool;
use osutils::platform::Platform;
use storage_api::config::{
    BackingDeviceConfig, DmcryptConfig, FilesystemConfig, RecoveryType, StorageContainerType,
};
use storage_api::error::{MountError, StorageError, StorageResult};
use storage_api::keys::FileSystemKeyReference;
use storage_api::layout;
use storage_api::users::ObfuscatedUsername;

use crate::containers::{
    DmcryptContainer, EcryptfsContainer, EphemeralContainer, Ext4Container, FscryptContainer,
    MigratingContainer, StorageContainer,
};
use crate::keyring::Keyring;
use crate::vault::CryptohomeVault;

// Thin logical volumes get 90% of the stateful device.
const LOGICAL_VOLUME_SIZE_PERCENT: u64 = 90;

const DMCRYPT_CIPHER: &str = "aes-xts-plain64";

// Fixed IV offset for the arcvm container, bounded so 32-bit IVs cannot
// wrap on 128 GiB devices.
const ARC_CONTAINER_IV_OFFSET: u64 = 2823358739;

const APPLICATION_CONTAINERS: &[&str] = &["arcvm"];

// Keep ext4 metadata below ~1% of the filesystem: scale the inode count
// with the device, capped at 4x the base.
fn calculate_inode_count(filesystem_size: u64) -> u64 {
    const GIB: u64 = 1024 * 1024 * 1024;
    const BASE_INODE_COUNT: u64 = 256 * 1024;

    if filesystem_size <= 16 * GIB {
        return BASE_INODE_COUNT;
    }
    if filesystem_size <= 32 * GIB {
        return 2 * BASE_INODE_COUNT;
    }
    4 * BASE_INODE_COUNT
}

fn container_iv_offset(container_name: &str) -> u64 {
    if container_name == "arcvm" {
        return ARC_CONTAINER_IV_OFFSET;
    }
    0
}

#[derive(Debug, Clone, Copy, Default)]
struct DmOptions {
    is_cache_device: bool,
    is_raw_device: bool,
    iv_offset: u64,
}

/// Builds vaults over a shared platform, keyring and (optional) thin pool.
pub struct CryptohomeVaultFactory<'a> {
    platform: &'a dyn Platform,
    keyring: &'a dyn Keyring,
    thinpool: Option<Thinpool>,
    use_fscrypt_v2: bool,
    enable_application_containers: bool,
}

impl<'a> CryptohomeVaultFactory<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        keyring: &'a dyn Keyring,
        thinpool: Option<Thinpool>,
        use_fscrypt_v2: bool,
        enable_application_containers: bool,
    ) -> Self {
        Self {
            platform,
            keyring,
            thinpool,
            use_fscrypt_v2,
            enable_application_containers,
        }
    }

    /// True when logical-volume backed vaults can be created at all.
    pub fn lvm_supported(&self) -> bool {
        self.thinpool.is_some()
    }

    /// True if the user's dm-crypt container with the given suffix exists.
    pub fn container_exists(&self, user: &ObfuscatedUsername, suffix: &str) -> bool {
        let Some(pool) = &self.thinpool else {
            return false;
        };
        let name = format!("{}{suffix}", layout::logical_volume_prefix(user));
        match self.platform.lv_exists(&pool.volume_group, &name) {
            Ok(exists) => exists,
            Err(e) => {
                error!("Failed to probe logical volume '{name}': {e:#}");
                false
            }
        }
    }

    /// Removes every logical volume belonging to the user.
    pub fn purge_logical_volumes(&self, user: &ObfuscatedUsername) -> Result<(), Error> {
        let Some(pool) = &self.thinpool else {
            return Ok(());
        };
        for suffix in [
            layout::DMCRYPT_DATA_CONTAINER_SUFFIX,
            layout::DMCRYPT_CACHE_CONTAINER_SUFFIX,
        ]
        .iter()
        .chain(APPLICATION_CONTAINERS)
        {
            let name = format!("{}{suffix}", layout::logical_volume_prefix(user));
            if self.platform.lv_exists(&pool.volume_group, &name)? {
                self.platform.lv_remove(&pool.volume_group, &name)?;
            }
        }
        Ok(())
    }

    fn generate_container(
        &self,
        container_type: StorageContainerType,
        user: &ObfuscatedUsername,
        key_reference: &FileSystemKeyReference,
        container_identifier: &str,
        dm_options: DmOptions,
    ) -> Result<Box<dyn StorageContainer + 'a>, Error> {
        match container_type {
            StorageContainerType::Ecryptfs => Ok(Box::new(EcryptfsContainer::new(
                layout::ecryptfs_vault_path(user),
                key_reference.clone(),
                self.platform,
                self.keyring,
            ))),
            StorageContainerType::Fscrypt => Ok(Box::new(FscryptContainer::new(
                layout::user_mount_directory(user),
                key_reference.clone(),
                self.use_fscrypt_v2,
                self.platform,
                self.keyring,
            ))),
            StorageContainerType::Dmcrypt => {
                let Some(pool) = &self.thinpool else {
                    bail!("Logical volumes are not configured on this device");
                };
                let stateful_size = self
                    .platform
                    .stateful_device_size()
                    .context("Failed to get stateful device size")?;

                let dmcrypt_config = DmcryptConfig {
                    backing_device_config: BackingDeviceConfig::LogicalVolume {
                        name: format!(
                            "{}{container_identifier}",
                            layout::logical_volume_prefix(user)
                        ),
                        size: (stateful_size * LOGICAL_VOLUME_SIZE_PERCENT) / (100 * 1024 * 1024),
                        vg: pool.volume_group.clone(),
                        thinpool: pool.thinpool.clone(),
                    },
                    device_name: format!(
                        "{}{container_identifier}",
                        layout::dmcrypt_volume_prefix(user)
                    ),
                    cipher: DMCRYPT_CIPHER.into(),
                    iv_offset: dm_options.iv_offset,
                    allow_discards: true,
                };
                let raw = DmcryptContainer::new(
                    &dmcrypt_config,
                    key_reference.clone(),
                    self.platform,
                    self.keyring,
                );
                if dm_options.is_raw_device {
                    return Ok(Box::new(raw));
                }

                let filesystem_config = FilesystemConfig {
                    mkfs_opts: vec![
                        "-O".into(),
                        "^huge_file,^flex_bg".into(),
                        "-N".into(),
                        calculate_inode_count(stateful_size).to_string(),
                        "-E".into(),
                        "discard".into(),
                    ],
                    tune2fs_opts: vec![
                        "-O".into(),
                        "verity,quota,project".into(),
                        "-Q".into(),
                        "usrquota,grpquota,prjquota".into(),
                    ],
                    recovery: if dm_options.is_cache_device {
                        RecoveryType::Purge
                    } else {
                        RecoveryType::DoNothing
                    },
                };
                Ok(Box::new(Ext4Container::new(
                    &filesystem_config,
                    Box::new(raw),
                    self.platform,
                )))
            }
            StorageContainerType::Ephemeral => {
                Ok(Box::new(EphemeralContainer::new(user, self.platform)))
            }
            _ => bail!("Cannot generate container of type {container_type:?}"),
        }
    }

    /// Builds the vault for `vault_type`: the primary container (a
    /// source/destination composite for migrating types), the cache
    /// container for dm-crypt vaults, and application containers.
    pub fn generate(
        &self,
        user: &ObfuscatedUsername,
        key_reference: &FileSystemKeyReference,
        vault_type: StorageContainerType,
    ) -> StorageResult<CryptohomeVault<'a>> {
        let vault_dm_options = DmOptions::default();
        let cache_dm_options = DmOptions {
            is_cache_device: true,
            ..Default::default()
        };

        let (container_type, migrating_container_type) = match vault_type.migration_pair() {
            Some((src, dst)) => (src, Some(dst)),
            None => (vault_type, None),
        };

        let make_error = |e: Error, what: &str| {
            StorageError::with_source(
                MountError::CreateCryptohomeFailed,
                format!("Could not create {what} container for {user}"),
                e,
            )
        };

        let primary: Box<dyn StorageContainer + 'a> = match migrating_container_type {
            None => self
                .generate_container(
                    container_type,
                    user,
                    key_reference,
                    layout::DMCRYPT_DATA_CONTAINER_SUFFIX,
                    vault_dm_options,
                )
                .map_err(|e| make_error(e, "vault"))?,
            Some(migrating_type) => {
                let src = self
                    .generate_container(
                        container_type,
                        user,
                        key_reference,
                        layout::DMCRYPT_DATA_CONTAINER_SUFFIX,
                        vault_dm_options,
                    )
                    .map_err(|e| make_error(e, "vault"))?;
                let dst = self
                    .generate_container(
                        migrating_type,
                        user,
                        key_reference,
                        layout::DMCRYPT_DATA_CONTAINER_SUFFIX,
                        vault_dm_options,
                    )
                    .map_err(|e| make_error(e, "migrating"))?;
                Box::new(
                    MigratingContainer::new(vault_type, src, dst)
                        .map_err(|e| make_error(e, "migrating"))?,
                )
            }
        };

        let dmcrypt_vault = container_type == StorageContainerType::Dmcrypt
            || migrating_container_type == Some(StorageContainerType::Dmcrypt);

        let mut cache = None;
        let mut apps: HashMap<String, Box<dyn StorageContainer + 'a>> = HashMap::new();
        if dmcrypt_vault {
            cache = Some(
                self.generate_container(
                    StorageContainerType::Dmcrypt,
                    user,
                    key_reference,
                    layout::DMCRYPT_CACHE_CONTAINER_SUFFIX,
                    cache_dm_options,
                )
                .map_err(|e| make_error(e, "cache"))?,
            );

            if self.enable_application_containers {
                for &app in APPLICATION_CONTAINERS {
                    let app_dm_options = DmOptions {
                        is_raw_device: true,
                        iv_offset: container_iv_offset(app),
                        ..Default::default()
                    };
                    let container = self
                        .generate_container(
                            StorageContainerType::Dmcrypt,
                            user,
                            key_reference,
                            app,
                            app_dm_options,
                        )
                        .map_err(|e| make_error(e, "app"))?;
                    apps.insert(app.to_string(), container);
                }
            }
        }

        Ok(CryptohomeVault::new(user.clone(), primary, cache, apps))
    }
}
