use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, IntoStaticStr};

/// Kinds of storage containers backing a user's encrypted home.
///
/// The three `*To*` variants are migrating types that name a source and a
/// destination container at the same time.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "snake_case")]
pub enum StorageContainerType {
    Ecryptfs,
    Fscrypt,
    Dmcrypt,
    Ext4,
    Ephemeral,
    EcryptfsToFscrypt,
    EcryptfsToDmcrypt,
    FscryptToDmcrypt,
    #[default]
    Unknown,
}

impl StorageContainerType {
    /// True for the composite types used while copying data between
    /// encryption schemes.
    pub fn is_migrating(self) -> bool {
        matches!(
            self,
            Self::EcryptfsToFscrypt | Self::EcryptfsToDmcrypt | Self::FscryptToDmcrypt
        )
    }

    /// Source and destination of a migrating type, if any.
    pub fn migration_pair(self) -> Option<(StorageContainerType, StorageContainerType)> {
        match self {
            Self::EcryptfsToFscrypt => Some((Self::Ecryptfs, Self::Fscrypt)),
            Self::EcryptfsToDmcrypt => Some((Self::Ecryptfs, Self::Dmcrypt)),
            Self::FscryptToDmcrypt => Some((Self::Fscrypt, Self::Dmcrypt)),
            _ => None,
        }
    }
}

/// Backing block-device flavors for dm-crypt and ephemeral containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackingDeviceConfig {
    /// Sparse file attached through a loop device.
    Loopback { file: PathBuf, size: u64 },
    /// Tmpfs-backed file attached through a loop device; purged on teardown.
    Ramdisk { file: PathBuf },
    /// Thin logical volume inside a preconfigured volume group.
    LogicalVolume {
        name: String,
        /// Size in MiB.
        size: u64,
        vg: String,
        thinpool: String,
    },
}

impl BackingDeviceConfig {
    pub fn name(&self) -> String {
        match self {
            Self::Loopback { file, .. } | Self::Ramdisk { file } => {
                file.to_string_lossy().into_owned()
            }
            Self::LogicalVolume { name, .. } => name.clone(),
        }
    }
}

/// Configuration of a raw dm-crypt device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmcryptConfig {
    pub backing_device_config: BackingDeviceConfig,
    /// Device-mapper device name, e.g. `dmcrypt-<u>-data`.
    pub device_name: String,
    pub cipher: String,
    pub iv_offset: u64,
    pub allow_discards: bool,
}

/// What to do when fsck leaves uncorrected errors on an existing filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryType {
    #[default]
    DoNothing,
    EnforceCleaning,
    Purge,
}

/// Configuration of an ext4 filesystem layered over a block container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemConfig {
    pub mkfs_opts: Vec<String>,
    pub tune2fs_opts: Vec<String>,
    pub recovery: RecoveryType,
}

/// Caller options influencing vault-type election.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VaultOptions {
    /// Forces the type of a newly created vault.
    pub force_type: Option<StorageContainerType>,
    /// The mount is part of an encryption migration.
    pub migrate: bool,
    /// Refuse to mount an eCryptfs vault unless it is being migrated.
    pub block_ecryptfs: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrating_types_decompose() {
        assert!(StorageContainerType::EcryptfsToDmcrypt.is_migrating());
        assert_eq!(
            StorageContainerType::EcryptfsToDmcrypt.migration_pair(),
            Some((StorageContainerType::Ecryptfs, StorageContainerType::Dmcrypt))
        );
        assert!(!StorageContainerType::Dmcrypt.is_migrating());
        assert_eq!(StorageContainerType::Fscrypt.migration_pair(), None);
    }

    #[test]
    fn backing_device_names() {
        let lv = BackingDeviceConfig::LogicalVolume {
            name: "cryptohome-0123-data".into(),
            size: 1024,
            vg: "stateful".into(),
            thinpool: "thinpool".into(),
        };
        assert_eq!(lv.name(), "cryptohome-0123-data");

        let loopback = BackingDeviceConfig::Loopback {
            file: "/run/cryptohome/ephemeral_data/0123".into(),
            size: 1 << 30,
        };
        assert_eq!(loopback.name(), "/run/cryptohome/ephemeral_data/0123");
    }
}
