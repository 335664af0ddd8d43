//! Canonical filesystem layout for per-user encrypted homes.
//!
//! Every path that the storage core touches is derived here from the
//! obfuscated username, so the layout stays in one place.

use std::path::{Path, PathBuf};

use crate::users::ObfuscatedUsername;

/// Root of all per-user vault state.
pub const SHADOW_ROOT: &str = "/home/.shadow";

/// Root of ephemeral cryptohome state (tmpfs).
pub const EPHEMERAL_CRYPTOHOME_DIR: &str = "/run/cryptohome";
/// Sparse backing files for ephemeral mounts, under the ephemeral root.
pub const EPHEMERAL_DATA_DIR: &str = "ephemeral_data";
/// Ephemeral mount points, under the ephemeral root.
pub const EPHEMERAL_MOUNT_DIR: &str = "ephemeral_mount";

/// Legacy single-user bind target.
pub const LEGACY_HOME_DIR: &str = "/home/chronos/user";
/// Account under which the UI session runs.
pub const DEFAULT_SHARED_USER: &str = "chronos";

/// Daemon-store templates on rootfs.
pub const ETC_DAEMON_STORE_BASE_DIR: &str = "/etc/daemon-store";
/// Per-user daemon-store binds.
pub const RUN_DAEMON_STORE_BASE_DIR: &str = "/run/daemon-store";
/// Per-user daemon-store-cache binds.
pub const RUN_DAEMON_STORE_CACHE_BASE_DIR: &str = "/run/daemon-store-cache";

/// Skeleton copied into fresh user homes.
pub const SKEL_DIR: &str = "/etc/skel";

/// Subdirectory names inside a vault.
pub const ECRYPTFS_VAULT_DIR: &str = "vault";
pub const MOUNT_DIR: &str = "mount";
pub const TEMPORARY_MOUNT_DIR: &str = "temporary_mount";
pub const DMCRYPT_CACHE_DIR: &str = "dmcrypt-cache";

/// Suffixes inside a mounted vault.
pub const USER_HOME_SUFFIX: &str = "user";
pub const ROOT_HOME_SUFFIX: &str = "root";

/// Well-known user-home subdirectories.
pub const DOWNLOADS_DIR: &str = "Downloads";
pub const DOWNLOADS_BACKUP_DIR: &str = "Downloads-backup";
pub const MY_FILES_DIR: &str = "MyFiles";
pub const CACHE_DIR: &str = "Cache";
pub const GCACHE_DIR: &str = "GCache";
pub const GCACHE_VERSION2_DIR: &str = "v2";
pub const DAEMON_STORE_CACHE_DIR: &str = ".cache";

/// Extended attribute carrying a tracked directory's plaintext name.
pub const TRACKED_DIRECTORY_NAME_XATTR: &str = "user.TrackedDirectoryName";
/// Extended attribute recording the Downloads bind-mount migration stage.
pub const BIND_MOUNT_MIGRATION_XATTR: &str = "user.BindMountMigration";

/// Logical-volume and device-mapper container suffixes.
pub const DMCRYPT_DATA_CONTAINER_SUFFIX: &str = "data";
pub const DMCRYPT_CACHE_CONTAINER_SUFFIX: &str = "cache";

pub fn shadow_root() -> PathBuf {
    PathBuf::from(SHADOW_ROOT)
}

/// `<shadow>/<u>` — the per-user shadow directory.
pub fn user_path(user: &ObfuscatedUsername) -> PathBuf {
    shadow_root().join(user.as_str())
}

/// `<shadow>/<u>/vault` — the eCryptfs lower directory.
pub fn ecryptfs_vault_path(user: &ObfuscatedUsername) -> PathBuf {
    user_path(user).join(ECRYPTFS_VAULT_DIR)
}

/// `<shadow>/<u>/mount` — the active data mount point.
pub fn user_mount_directory(user: &ObfuscatedUsername) -> PathBuf {
    user_path(user).join(MOUNT_DIR)
}

/// `<shadow>/<u>/temporary_mount` — the migration source mount point.
pub fn user_temporary_mount_directory(user: &ObfuscatedUsername) -> PathBuf {
    user_path(user).join(TEMPORARY_MOUNT_DIR)
}

/// `<shadow>/<u>/dmcrypt-cache` — the cache volume mount point.
pub fn dmcrypt_user_cache_directory(user: &ObfuscatedUsername) -> PathBuf {
    user_path(user).join(DMCRYPT_CACHE_DIR)
}

/// Prefix for the user's thin logical volumes, e.g. `cryptohome-<u>-data`.
pub fn logical_volume_prefix(user: &ObfuscatedUsername) -> String {
    format!("cryptohome-{}-", short_hash(user))
}

/// Prefix for the user's device-mapper devices, e.g. `dmcrypt-<u>-data`.
pub fn dmcrypt_volume_prefix(user: &ObfuscatedUsername) -> String {
    format!("dmcrypt-{}-", short_hash(user))
}

/// `/dev/mapper/dmcrypt-<u>-data`.
pub fn dmcrypt_data_volume(user: &ObfuscatedUsername) -> PathBuf {
    Path::new("/dev/mapper").join(format!(
        "{}{}",
        dmcrypt_volume_prefix(user),
        DMCRYPT_DATA_CONTAINER_SUFFIX
    ))
}

/// `/dev/mapper/dmcrypt-<u>-cache`.
pub fn dmcrypt_cache_volume(user: &ObfuscatedUsername) -> PathBuf {
    Path::new("/dev/mapper").join(format!(
        "{}{}",
        dmcrypt_volume_prefix(user),
        DMCRYPT_CACHE_CONTAINER_SUFFIX
    ))
}

/// `/home/user/<u>`.
pub fn user_multi_home(user: &ObfuscatedUsername) -> PathBuf {
    Path::new("/home/user").join(user.as_str())
}

/// `/home/root/<u>`.
pub fn root_multi_home(user: &ObfuscatedUsername) -> PathBuf {
    Path::new("/home/root").join(user.as_str())
}

/// `/home/chronos/u-<u>`.
pub fn new_user_path(user: &ObfuscatedUsername) -> PathBuf {
    Path::new("/home")
        .join(DEFAULT_SHARED_USER)
        .join(format!("u-{}", user.as_str()))
}

/// `<ephemeral-root>/ephemeral_data/<u>` — the ephemeral sparse file.
pub fn ephemeral_sparse_file(user: &ObfuscatedUsername) -> PathBuf {
    Path::new(EPHEMERAL_CRYPTOHOME_DIR)
        .join(EPHEMERAL_DATA_DIR)
        .join(user.as_str())
}

/// `<ephemeral-root>/ephemeral_mount/<u>` — the ephemeral mount point.
pub fn ephemeral_mount_directory(user: &ObfuscatedUsername) -> PathBuf {
    Path::new(EPHEMERAL_CRYPTOHOME_DIR)
        .join(EPHEMERAL_MOUNT_DIR)
        .join(user.as_str())
}

// LV names must stay short, so only the leading 8 bytes of the obfuscated
// username go into device names.
fn short_hash(user: &ObfuscatedUsername) -> &str {
    let name = user.as_str();
    &name[..name.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> ObfuscatedUsername {
        ObfuscatedUsername::from_sanitized("0123456789abcdef").unwrap()
    }

    #[test]
    fn shadow_paths_are_derived_from_the_user() {
        let u = user();
        assert_eq!(
            ecryptfs_vault_path(&u),
            Path::new("/home/.shadow/0123456789abcdef/vault")
        );
        assert_eq!(
            user_mount_directory(&u),
            Path::new("/home/.shadow/0123456789abcdef/mount")
        );
        assert_eq!(
            user_temporary_mount_directory(&u),
            Path::new("/home/.shadow/0123456789abcdef/temporary_mount")
        );
        assert_eq!(
            dmcrypt_user_cache_directory(&u),
            Path::new("/home/.shadow/0123456789abcdef/dmcrypt-cache")
        );
    }

    #[test]
    fn user_visible_paths() {
        let u = user();
        assert_eq!(
            user_multi_home(&u),
            Path::new("/home/user/0123456789abcdef")
        );
        assert_eq!(
            root_multi_home(&u),
            Path::new("/home/root/0123456789abcdef")
        );
        assert_eq!(
            new_user_path(&u),
            Path::new("/home/chronos/u-0123456789abcdef")
        );
    }

    #[test]
    fn device_names_use_the_short_hash() {
        let u = user();
        assert_eq!(logical_volume_prefix(&u), "cryptohome-01234567-");
        assert_eq!(
            dmcrypt_data_volume(&u),
            Path::new("/dev/mapper/dmcrypt-01234567-data")
        );
        assert_eq!(
            dmcrypt_cache_volume(&u),
            Path::new("/dev/mapper/dmcrypt-01234567-cache")
        );
    }

    #[test]
    fn ephemeral_paths() {
        let u = user();
        assert_eq!(
            ephemeral_sparse_file(&u),
            Path::new("/run/cryptohome/ephemeral_data/0123456789abcdef")
        );
        assert_eq!(
            ephemeral_mount_directory(&u),
            Path::new("/run/cryptohome/ephemeral_mount/0123456789abcdef")
        );
    }
}
