//! Per-user home enumeration, vault-type election and policy removal.

use std::path::PathBuf;

use anyhow::Error;
use log::{error, warn};

use osutils::fscrypt::KeyState;
use osutils::platform::Platform;
use storage_api::config::{StorageContainerType, VaultOptions};
use storage_api::error::{MountError, StorageError, StorageResult};
use storage_api::layout;
use storage_api::users::{self, ObfuscatedUsername};

use crate::vault_factory::CryptohomeVaultFactory;

/// Policy inputs for home-directory removal, read from an opaque source.
pub trait PolicyReader {
    fn is_enterprise_owned(&self) -> bool;
    fn owner(&self) -> Option<ObfuscatedUsername>;
    /// True if the policy marks this user's home as ephemeral.
    fn should_remove_based_on_policy(&self, user: &ObfuscatedUsername) -> bool;
}

/// Outcome of a policy-driven removal sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptohomesRemovedStatus {
    Error,
    None,
    Some,
    All,
}

/// One entry in the shadow root.
#[derive(Debug, Clone)]
pub struct HomeDir {
    pub obfuscated: ObfuscatedUsername,
    pub is_mounted: bool,
}

pub struct HomeDirs<'a> {
    platform: &'a dyn Platform,
    vault_factory: &'a CryptohomeVaultFactory<'a>,
    policy: &'a dyn PolicyReader,
    lvm_migration_enabled: bool,
}

impl<'a> HomeDirs<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        vault_factory: &'a CryptohomeVaultFactory<'a>,
        policy: &'a dyn PolicyReader,
        lvm_migration_enabled: bool,
    ) -> Self {
        Self {
            platform,
            vault_factory,
            policy,
            lvm_migration_enabled,
        }
    }

    pub fn exists(&self, user: &ObfuscatedUsername) -> bool {
        self.platform.directory_exists(&layout::user_path(user))
    }

    pub fn cryptohome_exists(&self, user: &ObfuscatedUsername) -> StorageResult<bool> {
        Ok(self.ecryptfs_cryptohome_exists(user)
            || self.dircrypto_cryptohome_exists(user)?
            || self.dmcrypt_cryptohome_exists(user))
    }

    fn ecryptfs_cryptohome_exists(&self, user: &ObfuscatedUsername) -> bool {
        self.platform
            .directory_exists(&layout::ecryptfs_vault_path(user))
    }

    fn dircrypto_cryptohome_exists(&self, user: &ObfuscatedUsername) -> StorageResult<bool> {
        let mount_path = layout::user_mount_directory(user);
        if !self.platform.directory_exists(&mount_path) {
            return Ok(false);
        }

        match self.platform.get_dir_crypto_key_state(&mount_path) {
            KeyState::NoKey | KeyState::NotSupported => Ok(false),
            KeyState::Encrypted => Ok(true),
            // A directory that names itself encrypted but has no readable
            // key state cannot be classified safely.
            KeyState::Unknown => Err(StorageError::new(
                MountError::Fatal,
                format!(
                    "Directory has inconsistent fscrypt state: {}",
                    mount_path.display()
                ),
            )),
        }
    }

    fn dmcrypt_cryptohome_exists(&self, user: &ObfuscatedUsername) -> bool {
        self.vault_factory
            .container_exists(user, layout::DMCRYPT_DATA_CONTAINER_SUFFIX)
    }

    /// Observed on-disk vault type, `Unknown` for a new user.
    pub fn get_vault_type(&self, user: &ObfuscatedUsername) -> StorageResult<StorageContainerType> {
        let dircrypto = self.dircrypto_cryptohome_exists(user)?;

        if self.ecryptfs_cryptohome_exists(user) {
            if dircrypto {
                return Ok(StorageContainerType::EcryptfsToFscrypt);
            }
            if self.dmcrypt_cryptohome_exists(user) {
                return Ok(StorageContainerType::EcryptfsToDmcrypt);
            }
            return Ok(StorageContainerType::Ecryptfs);
        }
        if dircrypto {
            if self.dmcrypt_cryptohome_exists(user) {
                return Ok(StorageContainerType::FscryptToDmcrypt);
            }
            return Ok(StorageContainerType::Fscrypt);
        }
        if self.dmcrypt_cryptohome_exists(user) {
            return Ok(StorageContainerType::Dmcrypt);
        }
        Ok(StorageContainerType::Unknown)
    }

    /// Best container type for a brand-new vault on this device.
    fn choose_vault_type(&self) -> StorageResult<StorageContainerType> {
        if self.vault_factory.lvm_supported() {
            return Ok(StorageContainerType::Dmcrypt);
        }

        match self.platform.get_dir_crypto_key_state(&layout::shadow_root()) {
            KeyState::NotSupported => Ok(StorageContainerType::Ecryptfs),
            KeyState::NoKey => Ok(StorageContainerType::Fscrypt),
            state @ (KeyState::Unknown | KeyState::Encrypted) => Err(StorageError::new(
                MountError::Fatal,
                format!("Unexpected fscrypt state {state:?} on the shadow root"),
            )),
        }
    }

    /// Elects the vault type for a mount, applying migration promotions and
    /// rejecting incompatible option combinations.
    pub fn pick_vault_type(
        &self,
        user: &ObfuscatedUsername,
        options: &VaultOptions,
    ) -> StorageResult<StorageContainerType> {
        let mut vault_type = self.get_vault_type(user)?;

        if vault_type == StorageContainerType::Ecryptfs && options.migrate {
            vault_type = if self.lvm_migration_enabled {
                StorageContainerType::EcryptfsToDmcrypt
            } else {
                StorageContainerType::EcryptfsToFscrypt
            };
        }
        if vault_type == StorageContainerType::Fscrypt && options.migrate {
            vault_type = StorageContainerType::FscryptToDmcrypt;
        }

        if vault_type == StorageContainerType::Ecryptfs && options.block_ecryptfs {
            return Err(StorageError::new(
                MountError::OldEncryption,
                "Mount attempt with block_ecryptfs on eCryptfs",
            ));
        }

        if vault_type.is_migrating() && !options.migrate {
            return Err(StorageError::new(
                MountError::PreviousMigrationIncomplete,
                "Both legacy and target home directories were found; \
                 the previous migration must be resumed and finished first",
            ));
        }

        if !vault_type.is_migrating() && options.migrate {
            if vault_type == StorageContainerType::Unknown {
                return Err(StorageError::new(
                    MountError::UnexpectedMountType,
                    "Cannot set up migration for a non-existing vault",
                ));
            }
            return Err(StorageError::new(
                MountError::UnexpectedMountType,
                "Mount attempt with migration on a non-migrating vault",
            ));
        }

        if vault_type != StorageContainerType::Unknown {
            return Ok(vault_type);
        }

        if options.block_ecryptfs {
            warn!("The eCryptfs mount block flag has no effect for new vaults");
        }

        match options.force_type {
            Some(forced) => Ok(forced),
            None => self.choose_vault_type(),
        }
    }

    /// All vault directories in the shadow root, with mount status.
    pub fn get_home_dirs(&self) -> Vec<HomeDir> {
        let entries = match self.platform.list_directory(&layout::shadow_root()) {
            Ok(entries) => entries,
            Err(e) => {
                error!("Failed to enumerate the shadow root: {e:#}");
                return Vec::new();
            }
        };

        let mut dirs: Vec<HomeDir> = entries
            .iter()
            .filter_map(|entry| entry.file_name())
            .filter_map(|name| users::ObfuscatedUsername::from_sanitized(name.to_string_lossy()))
            .map(|obfuscated| HomeDir {
                obfuscated,
                is_mounted: false,
            })
            .collect();

        let user_paths: Vec<PathBuf> = dirs
            .iter()
            .map(|dir| layout::user_multi_home(&dir.obfuscated))
            .collect();
        match self.platform.are_directories_mounted(&user_paths) {
            Ok(mounted) => {
                for (dir, is_mounted) in dirs.iter_mut().zip(mounted) {
                    dir.is_mounted = is_mounted;
                }
            }
            Err(e) => warn!("Failed to probe mounted home directories: {e:#}"),
        }

        dirs
    }

    /// Removes a user's entire persistent state.
    pub fn remove(&self, user: &ObfuscatedUsername) -> Result<(), Error> {
        self.vault_factory.purge_logical_volumes(user)?;
        self.platform
            .delete_path_recursively(&layout::user_path(user))
    }

    /// Removes every unmounted cryptohome the policy marks as ephemeral.
    /// The owner's vault is never removed on consumer devices.
    pub fn remove_cryptohomes_based_on_policy(&self) -> CryptohomesRemovedStatus {
        let enterprise_owned = self.policy.is_enterprise_owned();
        let owner = self.policy.owner();
        if !enterprise_owned && owner.is_none() {
            return CryptohomesRemovedStatus::Error;
        }

        let homedirs: Vec<HomeDir> = self
            .get_home_dirs()
            .into_iter()
            .filter(|dir| !dir.is_mounted)
            .collect();

        let mut removed = 0usize;
        for dir in &homedirs {
            if !enterprise_owned && owner.as_ref() == Some(&dir.obfuscated) {
                continue;
            }
            if !self.policy.should_remove_based_on_policy(&dir.obfuscated) {
                continue;
            }
            match self.remove(&dir.obfuscated) {
                Ok(()) => removed += 1,
                Err(e) => warn!(
                    "Failed to remove ephemeral cryptohome {}: {e:#}",
                    dir.obfuscated
                ),
            }
        }

        if removed == 0 {
            CryptohomesRemovedStatus::None
        } else if removed == homedirs.len() {
            CryptohomesRemovedStatus::All
        } else {
            CryptohomesRemovedStatus::Some
        }
    }

    /// Locates a tracked directory inside the user's vault. On eCryptfs the
    /// pass-through name is used directly; on fscrypt the name xattr is
    /// searched component by component, so the lookup works without the
    /// encryption key.
    pub fn get_tracked_directory(
        &self,
        user: &ObfuscatedUsername,
        tracked_dir_name: &std::path::Path,
    ) -> Result<PathBuf, Error> {
        let vault_path = layout::ecryptfs_vault_path(user);
        if self.platform.directory_exists(&vault_path) {
            return Ok(vault_path.join(tracked_dir_name));
        }
        self.get_tracked_directory_for_dir_crypto(
            &layout::user_mount_directory(user),
            tracked_dir_name,
        )
    }

    fn get_tracked_directory_for_dir_crypto(
        &self,
        mount_dir: &std::path::Path,
        tracked_dir_name: &std::path::Path,
    ) -> Result<PathBuf, Error> {
        let mut current_path = mount_dir.to_path_buf();

        for component in tracked_dir_name.components() {
            let wanted = component.as_os_str().to_string_lossy().into_owned();
            let mut next_path = None;
            for candidate in self.platform.list_directory(&current_path)? {
                if !self.platform.directory_exists(&candidate) {
                    continue;
                }
                let Some(name) = self
                    .platform
                    .get_xattr(&candidate, layout::TRACKED_DIRECTORY_NAME_XATTR)?
                else {
                    continue;
                };
                if name.as_slice() == wanted.as_bytes() {
                    next_path = Some(candidate);
                    break;
                }
            }
            current_path = next_path.ok_or_else(|| {
                anyhow::anyhow!("Tracked directory '{}' not found", tracked_dir_name.display())
            })?;
        }
        Ok(current_path)
    }
}
