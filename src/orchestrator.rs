//! Top-level mount lifecycle: sign-in, ephemeral sign-in, unmount and
//! encryption migration.

use std::path::PathBuf;

use log::{error, info, warn};

use osutils::platform::Platform;
use storage_api::config::VaultOptions;
use storage_api::error::{MountError, StorageError, StorageResult, StorageResultExt};
use storage_api::keys::{FileSystemKey, FileSystemKeyReference};
use storage_api::layout;
use storage_api::users::ObfuscatedUsername;

use crate::homedirs::HomeDirs;
use crate::migration::{CancelFlag, MigrationHelper, MigrationMode, MigrationProgress, MigrationStatus};
use crate::mounter::Mounter;
use crate::vault::{CryptohomeVault, MountType};
use crate::vault_factory::CryptohomeVaultFactory;

struct ActiveMount<'a> {
    user: ObfuscatedUsername,
    mount_type: MountType,
    vault: CryptohomeVault<'a>,
}

/// Composes HomeDirs, the vault factory and the mounter into the mount
/// entry points. At most one cryptohome is active per orchestrator.
pub struct MountOrchestrator<'a> {
    platform: &'a dyn Platform,
    homedirs: HomeDirs<'a>,
    vault_factory: &'a CryptohomeVaultFactory<'a>,
    mounter: Mounter<'a>,
    active: Option<ActiveMount<'a>>,
    migration_cancel: CancelFlag,
}

impl<'a> MountOrchestrator<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        homedirs: HomeDirs<'a>,
        vault_factory: &'a CryptohomeVaultFactory<'a>,
        legacy_mount: bool,
        bind_mount_downloads: bool,
    ) -> Self {
        Self {
            platform,
            homedirs,
            vault_factory,
            mounter: Mounter::new(platform, legacy_mount, bind_mount_downloads),
            active: None,
            migration_cancel: CancelFlag::new(),
        }
    }

    pub fn homedirs(&self) -> &HomeDirs<'a> {
        &self.homedirs
    }

    pub fn is_mounted(&self) -> bool {
        self.active.is_some()
    }

    fn unwind_failed_mount(&mut self, mut vault: CryptohomeVault<'a>) {
        self.mounter.unmount_all();
        if let Err(e) = vault.teardown() {
            error!("Failed to tear down vault after mount failure: {e:#}");
        }
    }

    /// Mounts the user's persistent cryptohome: elect the vault type, set
    /// up its containers, build the mount graph. Any failure fully
    /// unwinds.
    pub fn mount_cryptohome(
        &mut self,
        user: &ObfuscatedUsername,
        key: &FileSystemKey,
        key_reference: &FileSystemKeyReference,
        options: &VaultOptions,
    ) -> StorageResult<()> {
        if self.active.is_some() {
            return Err(StorageError::new(
                MountError::MountPointBusy,
                "A cryptohome is already mounted",
            ));
        }

        let vault_type = self.homedirs.pick_vault_type(user, options)?;
        info!("Mounting cryptohome for {user} as {vault_type:?}");

        let mut vault = self
            .vault_factory
            .generate(user, key_reference, vault_type)?;
        vault.setup(key)?;

        let mount_type = match vault.mount_type() {
            Ok(mount_type) => mount_type,
            Err(e) => {
                self.unwind_failed_mount(vault);
                return Err(e);
            }
        };

        if let Err(e) = self.mounter.perform_mount(
            mount_type,
            user,
            &key_reference.fek_sig_hex(),
            &key_reference.fnek_sig_hex(),
        ) {
            self.unwind_failed_mount(vault);
            return Err(e);
        }

        self.active = Some(ActiveMount {
            user: user.clone(),
            mount_type,
            vault,
        });
        Ok(())
    }

    /// Mounts a RAM-backed cryptohome that disappears on sign-out.
    pub fn mount_ephemeral_cryptohome(&mut self, user: &ObfuscatedUsername) -> StorageResult<()> {
        if self.active.is_some() || !self.mounter.can_perform_ephemeral_mount() {
            return Err(StorageError::new(
                MountError::MountPointBusy,
                "A cryptohome is already mounted",
            ));
        }

        let mut vault = self.vault_factory.generate(
            user,
            &FileSystemKeyReference::default(),
            storage_api::config::StorageContainerType::Ephemeral,
        )?;
        // Sizing happens inside the container, from the free space of the
        // ephemeral root.
        vault.setup(&FileSystemKey::default())?;

        let loop_device = vault.get_container_backing_location();
        if let Err(e) = self.mounter.perform_ephemeral_mount(user, &loop_device) {
            self.unwind_failed_mount(vault);
            return Err(e);
        }

        self.active = Some(ActiveMount {
            user: user.clone(),
            mount_type: MountType::Ephemeral,
            vault,
        });
        Ok(())
    }

    /// Reverses the mount graph and tears the vault down. Teardown issues
    /// are logged and do not abort the unmount.
    pub fn unmount_cryptohome(&mut self) {
        self.mounter.unmount_all();
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.vault.teardown() {
                warn!("Vault teardown reported: {e:#}");
            }
        }
    }

    /// Evicts every filesystem key of the active vault, leaving the mount
    /// graph in place but the data unreadable.
    pub fn evict_device_key(&mut self) -> StorageResult<()> {
        match self.active.as_mut() {
            Some(active) => active.vault.evict_key(),
            None => Err(StorageError::new(
                MountError::Fatal,
                "No active cryptohome to evict keys from",
            )),
        }
    }

    /// Restores previously evicted filesystem keys.
    pub fn restore_device_key(&mut self, key: &FileSystemKey) -> StorageResult<()> {
        match self.active.as_mut() {
            Some(active) => active.vault.restore_key(key),
            None => Err(StorageError::new(
                MountError::Fatal,
                "No active cryptohome to restore keys into",
            )),
        }
    }

    /// Requests cancellation of a running migration; takes effect at the
    /// next file boundary.
    pub fn cancel_migration(&self) {
        self.migration_cancel.request_cancel();
    }

    fn migration_endpoints(
        user: &ObfuscatedUsername,
        mount_type: MountType,
    ) -> Option<(PathBuf, PathBuf, PathBuf)> {
        // Returns (source mount, destination mount, source state to purge).
        match mount_type {
            MountType::EcryptfsToFscrypt | MountType::EcryptfsToDmcrypt => Some((
                layout::user_temporary_mount_directory(user),
                layout::user_mount_directory(user),
                layout::ecryptfs_vault_path(user),
            )),
            MountType::FscryptToDmcrypt => Some((
                layout::user_mount_directory(user),
                layout::user_temporary_mount_directory(user),
                layout::user_mount_directory(user),
            )),
            _ => None,
        }
    }

    /// Copies the mounted source home onto the destination container,
    /// reports progress through `progress`, and on success flips the
    /// on-disk state so the next mount observes only the destination type.
    pub fn migrate_encryption(
        &mut self,
        progress: &mut dyn FnMut(MigrationProgress),
        mode: MigrationMode,
    ) -> StorageResult<MigrationStatus> {
        let Some(active) = self.active.as_ref() else {
            return Err(StorageError::new(
                MountError::UnexpectedMountType,
                "No active cryptohome to migrate",
            ));
        };
        let Some((source, destination, purge_path)) =
            Self::migration_endpoints(&active.user, active.mount_type)
        else {
            return Err(StorageError::new(
                MountError::UnexpectedMountType,
                "Active mount is not a migrating type",
            ));
        };
        let user = active.user.clone();

        let helper = MigrationHelper::new(self.platform, self.migration_cancel.clone());
        let status = helper
            .migrate(&source, &destination, mode, progress)
            .or_kind(MountError::Fatal, "Encryption migration failed")?;
        self.migration_cancel.reset();

        if status == MigrationStatus::Canceled {
            info!("Encryption migration for {user} canceled; migration state kept");
            return Ok(status);
        }

        // Migration is complete: drop the mounts, tear the vault down and
        // delete the legacy container's state so the next election
        // observes only the destination.
        self.unmount_cryptohome();
        self.platform
            .delete_path_recursively(&purge_path)
            .or_kind(MountError::Fatal, "Failed to purge migration source")?;
        let temporary_mount = layout::user_temporary_mount_directory(&user);
        if let Err(e) = self.platform.delete_path_recursively(&temporary_mount) {
            warn!("Failed to remove temporary mount directory: {e:#}");
        }

        info!("Encryption migration for {user} complete");
        Ok(MigrationStatus::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::path::Path;

    use osutils::lvm::Thinpool;
    use osutils::testutils::FakePlatform;
    use storage_api::config::StorageContainerType;
    use storage_api::keys::SecureBytes;

    use crate::homedirs::PolicyReader;
    use crate::keyring::testing::FakeKeyring;

    struct NoPolicy;

    impl PolicyReader for NoPolicy {
        fn is_enterprise_owned(&self) -> bool {
            false
        }

        fn owner(&self) -> Option<ObfuscatedUsername> {
            None
        }

        fn should_remove_based_on_policy(&self, _user: &ObfuscatedUsername) -> bool {
            false
        }
    }

    struct Fixture {
        platform: FakePlatform,
        keyring: FakeKeyring,
        policy: NoPolicy,
    }

    impl Fixture {
        fn new() -> Self {
            let platform = FakePlatform::new();
            for dir in ["/home/user", "/home/root", "/home/chronos/user", "/run/cryptohome"] {
                platform.create_directory(Path::new(dir)).unwrap();
            }
            platform
                .create_dir_with_owner(Path::new("/home/chronos"), 0o755, 1000, 1000)
                .unwrap();
            Self {
                platform,
                keyring: FakeKeyring::new(),
                policy: NoPolicy,
            }
        }

        fn factory(&self, lvm: bool) -> CryptohomeVaultFactory<'_> {
            CryptohomeVaultFactory::new(
                &self.platform,
                &self.keyring,
                lvm.then(|| Thinpool {
                    volume_group: "stateful".into(),
                    thinpool: "thinpool".into(),
                }),
                false,
                false,
            )
        }
    }

    fn orchestrator<'a>(
        fixture: &'a Fixture,
        factory: &'a CryptohomeVaultFactory<'a>,
        lvm_migration: bool,
    ) -> MountOrchestrator<'a> {
        let homedirs = HomeDirs::new(&fixture.platform, factory, &fixture.policy, lvm_migration);
        MountOrchestrator::new(&fixture.platform, homedirs, factory, true, false)
    }

    fn user() -> ObfuscatedUsername {
        ObfuscatedUsername::from_sanitized("0123456789abcdef").unwrap()
    }

    fn key() -> FileSystemKey {
        FileSystemKey {
            fek: SecureBytes::new(vec![0x5a; 64]),
            ..Default::default()
        }
    }

    fn reference() -> FileSystemKeyReference {
        FileSystemKeyReference {
            fek_sig: vec![0xaa; 8],
            fnek_sig: vec![0xbb; 8],
        }
    }

    #[test]
    fn fresh_user_on_lvm_gets_dmcrypt_vault() {
        let fixture = Fixture::new();
        let factory = fixture.factory(true);
        let mut orchestrator = orchestrator(&fixture, &factory, false);

        orchestrator
            .mount_cryptohome(&user(), &key(), &reference(), &VaultOptions::default())
            .unwrap();
        assert!(orchestrator.is_mounted());

        // Thin volumes exist, the data filesystem is formatted and the
        // user-visible graph is up.
        assert!(factory.container_exists(&user(), "data"));
        assert!(factory.container_exists(&user(), "cache"));
        assert!(fixture
            .platform
            .was_formatted(Path::new("/dev/mapper/dmcrypt-01234567-data")));
        assert!(fixture
            .platform
            .is_directory_mounted(&layout::user_multi_home(&user()))
            .unwrap());
        assert!(fixture
            .platform
            .is_directory_mounted(&layout::root_multi_home(&user()))
            .unwrap());

        // Unmount reverses every bind and mount.
        orchestrator.unmount_cryptohome();
        assert!(!orchestrator.is_mounted());
        assert!(fixture.platform.mounts().is_empty());
    }

    #[test]
    fn second_mount_is_rejected_while_active() {
        let fixture = Fixture::new();
        let factory = fixture.factory(true);
        let mut orchestrator = orchestrator(&fixture, &factory, false);

        orchestrator
            .mount_cryptohome(&user(), &key(), &reference(), &VaultOptions::default())
            .unwrap();
        let err = orchestrator
            .mount_cryptohome(&user(), &key(), &reference(), &VaultOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), MountError::MountPointBusy);
        orchestrator.unmount_cryptohome();
    }

    #[test]
    fn blocked_old_encryption_performs_no_mounts() {
        let fixture = Fixture::new();
        fixture
            .platform
            .create_directory(&layout::ecryptfs_vault_path(&user()))
            .unwrap();
        let factory = fixture.factory(true);
        let mut orchestrator = orchestrator(&fixture, &factory, false);

        let err = orchestrator
            .mount_cryptohome(
                &user(),
                &key(),
                &reference(),
                &VaultOptions {
                    block_ecryptfs: true,
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert_eq!(err.kind(), MountError::OldEncryption);
        assert!(fixture.platform.mounts().is_empty());
        assert!(!orchestrator.is_mounted());
    }

    #[test]
    fn ephemeral_mount_uses_a_ramdisk() {
        let fixture = Fixture::new();
        fixture.platform.set_statvfs_size(1 << 24);
        let factory = fixture.factory(false);
        let mut orchestrator = orchestrator(&fixture, &factory, false);

        orchestrator.mount_ephemeral_cryptohome(&user()).unwrap();
        assert!(orchestrator.is_mounted());
        assert!(fixture
            .platform
            .was_formatted(Path::new("/dev/loop0")));
        assert!(fixture
            .platform
            .is_directory_mounted(&layout::ephemeral_mount_directory(&user()))
            .unwrap());

        orchestrator.unmount_cryptohome();
        assert!(fixture.platform.mounts().is_empty());
        // The ramdisk backing is gone with the session.
        assert!(!fixture
            .platform
            .file_exists(&layout::ephemeral_sparse_file(&user())));
    }

    #[test]
    fn ecryptfs_to_dmcrypt_migration_flips_the_vault_type() {
        let fixture = Fixture::new();
        // Existing eCryptfs home with user data.
        let vault_dir = layout::ecryptfs_vault_path(&user());
        fixture
            .platform
            .create_directory(&vault_dir.join("user"))
            .unwrap();
        fs::write(
            fixture.platform.translate(&vault_dir.join("user/doc.txt")),
            "precious",
        )
        .unwrap();

        let factory = fixture.factory(true);
        let mut orchestrator = orchestrator(&fixture, &factory, true);

        let options = VaultOptions {
            migrate: true,
            ..Default::default()
        };
        orchestrator
            .mount_cryptohome(&user(), &key(), &reference(), &options)
            .unwrap();

        // Source exposed at the temporary mount, destination at mount/.
        assert!(fixture
            .platform
            .is_directory_mounted(&layout::user_temporary_mount_directory(&user()))
            .unwrap());
        assert!(fixture
            .platform
            .is_directory_mounted(&layout::user_mount_directory(&user()))
            .unwrap());

        // Simulate the eCryptfs overlay exposing the vault content at the
        // temporary mount point.
        let temporary = layout::user_temporary_mount_directory(&user());
        fixture
            .platform
            .create_directory(&temporary.join("user"))
            .unwrap();
        fs::write(
            fixture.platform.translate(&temporary.join("user/doc.txt")),
            "precious",
        )
        .unwrap();

        let mut reports = Vec::new();
        let status = orchestrator
            .migrate_encryption(&mut |p| reports.push(p), MigrationMode::Full)
            .unwrap();
        assert_eq!(status, MigrationStatus::Success);
        assert!(!reports.is_empty());

        // Data arrived at the destination and the legacy vault is gone.
        assert!(fixture.platform.file_exists(
            &layout::user_mount_directory(&user()).join("user/doc.txt")
        ));
        assert!(!fixture.platform.directory_exists(&vault_dir));
        assert!(!orchestrator.is_mounted());

        // The next election observes a plain dm-crypt vault.
        let homedirs = HomeDirs::new(&fixture.platform, &factory, &fixture.policy, true);
        assert_eq!(
            homedirs
                .pick_vault_type(&user(), &VaultOptions::default())
                .unwrap(),
            StorageContainerType::Dmcrypt
        );
    }

    #[test]
    fn canceled_migration_keeps_the_migrating_state() {
        let fixture = Fixture::new();
        let vault_dir = layout::ecryptfs_vault_path(&user());
        fixture
            .platform
            .create_directory(&vault_dir.join("user"))
            .unwrap();

        let factory = fixture.factory(true);
        let mut orchestrator = orchestrator(&fixture, &factory, true);
        let options = VaultOptions {
            migrate: true,
            ..Default::default()
        };
        orchestrator
            .mount_cryptohome(&user(), &key(), &reference(), &options)
            .unwrap();

        let temporary = layout::user_temporary_mount_directory(&user());
        fixture
            .platform
            .create_directory(&temporary.join("user"))
            .unwrap();
        for name in ["a", "b"] {
            fs::write(
                fixture
                    .platform
                    .translate(&temporary.join(format!("user/{name}"))),
                "x",
            )
            .unwrap();
        }

        orchestrator.cancel_migration();
        let status = orchestrator
            .migrate_encryption(&mut |_| {}, MigrationMode::Full)
            .unwrap();
        assert_eq!(status, MigrationStatus::Canceled);

        // Nothing was promoted: the vault dir survives and the mount is
        // still up, so the next mount still observes the migrating type.
        assert!(fixture.platform.directory_exists(&vault_dir));
        assert!(orchestrator.is_mounted());
        orchestrator.unmount_cryptohome();

        let homedirs = HomeDirs::new(&fixture.platform, &factory, &fixture.policy, true);
        let err = homedirs
            .pick_vault_type(&user(), &VaultOptions::default())
            .unwrap_err();
        assert_eq!(err.kind(), MountError::PreviousMigrationIncomplete);
    }

    #[test]
    fn migration_requires_a_migrating_mount() {
        let fixture = Fixture::new();
        let factory = fixture.factory(true);
        let mut orchestrator = orchestrator(&fixture, &factory, false);

        // Nothing mounted.
        let err = orchestrator
            .migrate_encryption(&mut |_| {}, MigrationMode::Full)
            .unwrap_err();
        assert_eq!(err.kind(), MountError::UnexpectedMountType);

        // A plain mount is not migratable either.
        orchestrator
            .mount_cryptohome(&user(), &key(), &reference(), &VaultOptions::default())
            .unwrap();
        let err = orchestrator
            .migrate_encryption(&mut |_| {}, MigrationMode::Full)
            .unwrap_err();
        assert_eq!(err.kind(), MountError::UnexpectedMountType);
        orchestrator.unmount_cryptohome();
    }

    #[test]
    fn key_eviction_round_trip_on_active_mount() {
        let fixture = Fixture::new();
        let factory = fixture.factory(true);
        let mut orchestrator = orchestrator(&fixture, &factory, false);

        orchestrator
            .mount_cryptohome(&user(), &key(), &reference(), &VaultOptions::default())
            .unwrap();
        orchestrator.evict_device_key().unwrap();
        orchestrator.restore_device_key(&key()).unwrap();

        let messages = fixture.platform.dm_messages("dmcrypt-01234567-data");
        assert_eq!(messages[0], "key wipe");
        assert!(messages[1].starts_with("key set"));
        orchestrator.unmount_cryptohome();
    }
}
