//! Assembly of the visible mount graph from a ready vault.

mod downloads;
mod stack;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use log::{error, info, warn};

use osutils::mounts::RemountOption;
use osutils::platform::{Platform, UnmountError};
use storage_api::error::{MountError, StorageError, StorageResult, StorageResultExt};
use storage_api::layout::{
    self, CACHE_DIR, DAEMON_STORE_CACHE_DIR, DOWNLOADS_DIR, GCACHE_DIR, GCACHE_VERSION2_DIR,
    LEGACY_HOME_DIR, MY_FILES_DIR, ROOT_HOME_SUFFIX, USER_HOME_SUFFIX,
};
use storage_api::users::ObfuscatedUsername;

use crate::vault::MountType;

pub use downloads::{DownloadsMigrationStatus, MigrationStage};
pub use stack::MountStack;

// Owner of the user session.
const DEFAULT_UID: u32 = 1000;
const DEFAULT_GID: u32 = 1000;
// Group for files shared with the UI.
const DEFAULT_ACCESS_GID: u32 = 1001;

const MOUNT_OWNER_UID: u32 = 0;
const MOUNT_OWNER_GID: u32 = 0;
const DAEMON_STORE_GID: u32 = 400;

const ACCESS_MODE: u32 = 0o750;
const TRACKED_DIR_MODE: u32 = 0o700;
const ROOT_DIR_MODE: u32 = 0o1770;
const GROUP_WRITE_ACCESS: u32 = 0o020;
const USER_MOUNT_POINT_MODE: u32 = 0o750;
const ROOT_MOUNT_POINT_MODE: u32 = 0o700;
const PATH_COMPONENT_MODE: u32 = 0o755;
const SKELETON_SUB_DIR_MODE: u32 = 0o750;

const ECRYPTFS_KEY_BYTES: u32 = 16;

const DMCRYPT_MOUNT_TYPE: &str = "ext4";
const DMCRYPT_MOUNT_OPTIONS: &str = "discard,commit=600";
const EPHEMERAL_MOUNT_TYPE: &str = "ext4";
const EPHEMERAL_MOUNT_OPTIONS: &str = "discard";

const EPHEMERAL_CRYPTOHOME_ROOT_CONTEXT: &str = "u:object_r:cros_home_shadow_uid:s0";

/// Ownership and mode of one directory inside a vault.
#[derive(Debug, Clone)]
struct DirectoryAcl {
    path: PathBuf,
    mode: u32,
    uid: u32,
    gid: u32,
}

pub struct Mounter<'a> {
    platform: &'a dyn Platform,
    legacy_mount: bool,
    bind_mount_downloads: bool,
    stack: MountStack,
}

impl<'a> Mounter<'a> {
    pub fn new(platform: &'a dyn Platform, legacy_mount: bool, bind_mount_downloads: bool) -> Self {
        Self {
            platform,
            legacy_mount,
            bind_mount_downloads,
            stack: MountStack::new(),
        }
    }

    pub fn mount_performed(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn is_path_mounted(&self, path: &Path) -> bool {
        self.stack.contains_dest(path)
    }

    pub fn mounted_paths(&self) -> Vec<PathBuf> {
        self.stack.destinations()
    }

    // Subdirectory tables.

    fn common_subdirectories(&self, base: &Path) -> Vec<DirectoryAcl> {
        let user = base.join(USER_HOME_SUFFIX);
        let root = base.join(ROOT_HOME_SUFFIX);
        let mut subdirs = vec![
            DirectoryAcl {
                path: root.clone(),
                mode: ROOT_DIR_MODE,
                uid: MOUNT_OWNER_UID,
                gid: DAEMON_STORE_GID,
            },
            DirectoryAcl {
                path: root.join(DAEMON_STORE_CACHE_DIR),
                mode: ROOT_DIR_MODE,
                uid: MOUNT_OWNER_UID,
                gid: DAEMON_STORE_GID,
            },
            DirectoryAcl {
                path: user.clone(),
                mode: ACCESS_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_ACCESS_GID,
            },
            DirectoryAcl {
                path: user.join(MY_FILES_DIR),
                mode: ACCESS_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_ACCESS_GID,
            },
            DirectoryAcl {
                path: user.join(MY_FILES_DIR).join(DOWNLOADS_DIR),
                mode: ACCESS_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_ACCESS_GID,
            },
            DirectoryAcl {
                path: user.join(CACHE_DIR),
                mode: TRACKED_DIR_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_GID,
            },
            DirectoryAcl {
                path: user.join(GCACHE_DIR),
                mode: ACCESS_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_ACCESS_GID,
            },
            DirectoryAcl {
                path: user.join(GCACHE_DIR).join(GCACHE_VERSION2_DIR),
                mode: ACCESS_MODE | GROUP_WRITE_ACCESS,
                uid: DEFAULT_UID,
                gid: DEFAULT_ACCESS_GID,
            },
        ];
        if self.bind_mount_downloads {
            subdirs.push(DirectoryAcl {
                path: user.join(DOWNLOADS_DIR),
                mode: ACCESS_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_ACCESS_GID,
            });
        }
        subdirs
    }

    fn cache_volume_subdirectories(&self, cache_base: &Path) -> Vec<DirectoryAcl> {
        let user = cache_base.join(USER_HOME_SUFFIX);
        let root = cache_base.join(ROOT_HOME_SUFFIX);
        vec![
            DirectoryAcl {
                path: root.clone(),
                mode: ROOT_DIR_MODE,
                uid: MOUNT_OWNER_UID,
                gid: DAEMON_STORE_GID,
            },
            DirectoryAcl {
                path: root.join(DAEMON_STORE_CACHE_DIR),
                mode: ROOT_DIR_MODE,
                uid: MOUNT_OWNER_UID,
                gid: DAEMON_STORE_GID,
            },
            DirectoryAcl {
                path: user.clone(),
                mode: ACCESS_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_ACCESS_GID,
            },
            DirectoryAcl {
                path: user.join(CACHE_DIR),
                mode: TRACKED_DIR_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_GID,
            },
            DirectoryAcl {
                path: user.join(GCACHE_DIR),
                mode: ACCESS_MODE,
                uid: DEFAULT_UID,
                gid: DEFAULT_ACCESS_GID,
            },
            DirectoryAcl {
                path: user.join(GCACHE_DIR).join(GCACHE_VERSION2_DIR),
                mode: ACCESS_MODE | GROUP_WRITE_ACCESS,
                uid: DEFAULT_UID,
                gid: DEFAULT_ACCESS_GID,
            },
        ]
    }

    /// Creates the tracked subdirectories with exact ownership. Root-owned
    /// directories in the wrong state are recreated; user-owned ones are
    /// corrected in place so their data survives.
    fn create_vault_directory_structure(&self, subdirs: &[DirectoryAcl]) -> Result<(), Error> {
        let mut result = Ok(());
        for subdir in subdirs {
            if let Err(e) = self.ensure_subdirectory(subdir) {
                error!("Failed to set up '{}': {e:#}", subdir.path.display());
                result = Err(e);
            }
        }
        result
    }

    fn ensure_subdirectory(&self, subdir: &DirectoryAcl) -> Result<(), Error> {
        let Some(st) = self.platform.stat(&subdir.path)? else {
            return self.platform.create_dir_with_owner(
                &subdir.path,
                subdir.mode,
                subdir.uid,
                subdir.gid,
            );
        };

        if !st.is_dir() {
            // A stale file or symlink is squatting on the name.
            self.platform.delete_file(&subdir.path)?;
            return self.platform.create_dir_with_owner(
                &subdir.path,
                subdir.mode,
                subdir.uid,
                subdir.gid,
            );
        }

        if st.uid == subdir.uid && st.gid == subdir.gid && st.permissions() == subdir.mode {
            return Ok(());
        }

        if subdir.uid == MOUNT_OWNER_UID && st.uid != MOUNT_OWNER_UID {
            // Only root may own this directory; recreate it.
            self.platform.delete_path_recursively(&subdir.path)?;
            return self.platform.create_dir_with_owner(
                &subdir.path,
                subdir.mode,
                subdir.uid,
                subdir.gid,
            );
        }

        self.platform
            .set_ownership(&subdir.path, subdir.uid, subdir.gid)?;
        self.platform.set_permissions(&subdir.path, subdir.mode)
    }

    /// Tags every tracked directory with its plaintext name so it stays
    /// identifiable without the encryption key.
    fn set_tracking_xattrs(&self, subdirs: &[DirectoryAcl]) -> Result<(), Error> {
        for subdir in subdirs {
            let name = subdir
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.platform
                .set_xattr(
                    &subdir.path,
                    layout::TRACKED_DIRECTORY_NAME_XATTR,
                    name.as_bytes(),
                )
                .context(format!("Unable to tag '{}'", subdir.path.display()))?;
        }
        Ok(())
    }

    // Mount-point plumbing.

    fn ensure_path_component(&self, path: &Path, uid: u32, gid: u32) -> Result<(), Error> {
        let Some(st) = self.platform.stat(path)? else {
            return self
                .platform
                .create_dir_with_owner(path, PATH_COMPONENT_MODE, uid, gid);
        };
        if !st.is_dir() {
            bail!("Non-directory path: '{}'", path.display());
        }
        if st.uid != uid {
            bail!("Owner mismatch on '{}': {} != {uid}", path.display(), st.uid);
        }
        if st.gid != gid {
            bail!("Group mismatch on '{}': {} != {gid}", path.display(), st.gid);
        }
        if st.permissions() & 0o002 != 0 {
            bail!("Permissions too lenient on '{}'", path.display());
        }
        Ok(())
    }

    fn ensure_mount_point_path(&self, dir: &Path) -> Result<(), Error> {
        let mut check_path = PathBuf::from("/");
        for component in dir.strip_prefix("/")?.components() {
            check_path.push(component);
            self.ensure_path_component(&check_path, MOUNT_OWNER_UID, MOUNT_OWNER_GID)?;
        }
        Ok(())
    }

    fn clean_mount_point(&self, path: &Path) -> Result<(), Error> {
        if !self.platform.directory_exists(path) {
            return Ok(());
        }
        if self.platform.is_directory_mounted(path)? {
            bail!("Mount point '{}' is already mounted", path.display());
        }
        self.platform.delete_path_recursively(path)
    }

    /// Prepares `/home/user/<u>`, `/home/root/<u>` and `/home/chronos/u-<u>`
    /// as empty, unmounted directories with the right ownership.
    fn ensure_user_mount_points(&self, user: &ObfuscatedUsername) -> Result<(), Error> {
        let multi_home_user = layout::user_multi_home(user);
        let multi_home_root = layout::root_multi_home(user);
        let new_user_path = layout::new_user_path(user);

        for path in [&multi_home_user, &multi_home_root, &new_user_path] {
            self.clean_mount_point(path)
                .context(format!("Failed to clean mount point '{}'", path.display()))?;
        }

        self.ensure_mount_point_path(multi_home_user.parent().expect("user home has a parent"))?;
        self.ensure_mount_point_path(multi_home_root.parent().expect("root home has a parent"))?;
        let chronos_dir = new_user_path.parent().expect("new user path has a parent");
        self.ensure_mount_point_path(chronos_dir.parent().expect("chronos dir has a parent"))?;
        self.ensure_path_component(chronos_dir, DEFAULT_UID, DEFAULT_GID)?;

        self.platform.create_dir_with_owner(
            &multi_home_user,
            USER_MOUNT_POINT_MODE,
            DEFAULT_UID,
            DEFAULT_ACCESS_GID,
        )?;
        self.platform.create_dir_with_owner(
            &new_user_path,
            USER_MOUNT_POINT_MODE,
            DEFAULT_UID,
            DEFAULT_ACCESS_GID,
        )?;
        self.platform.create_dir_with_owner(
            &multi_home_root,
            ROOT_MOUNT_POINT_MODE,
            MOUNT_OWNER_UID,
            MOUNT_OWNER_GID,
        )?;
        Ok(())
    }

    fn mount_and_push(
        &mut self,
        src: &Path,
        dest: &Path,
        fstype: &str,
        options: &str,
    ) -> Result<(), Error> {
        self.platform
            .mount(src, dest, fstype, options)
            .context(format!(
                "Mount failed: '{}' -> '{}'",
                src.display(),
                dest.display()
            ))?;
        self.stack.push(src.into(), dest.into());
        Ok(())
    }

    fn bind_and_push(
        &mut self,
        src: &Path,
        dest: &Path,
        remount: RemountOption,
    ) -> Result<(), Error> {
        self.platform.bind(src, dest, remount).context(format!(
            "Bind mount failed: '{}' -> '{}'",
            src.display(),
            dest.display()
        ))?;
        self.stack.push(src.into(), dest.into());
        Ok(())
    }

    fn mount_legacy_home(&mut self, from: &Path) -> Result<(), Error> {
        // Multiple mounts can't live on the legacy mount point.
        if self.platform.is_directory_mounted(Path::new(LEGACY_HOME_DIR))? {
            info!("Skipping binding to {LEGACY_HOME_DIR}");
            return Ok(());
        }
        self.bind_and_push(
            from,
            Path::new(LEGACY_HOME_DIR),
            RemountOption::MountsFlowIn,
        )
    }

    fn handle_my_files_downloads(&mut self, user_home: &Path) -> Result<(), Error> {
        if !self.bind_mount_downloads {
            match downloads::move_downloads_to_my_files(self.platform, user_home) {
                Ok(_status) => return Ok(()),
                Err(e) => warn!("Downloads migration failed, falling back to bind mount: {e:#}"),
            }
        }

        let downloads = user_home.join(DOWNLOADS_DIR);
        let downloads_in_my_files = user_home.join(MY_FILES_DIR).join(DOWNLOADS_DIR);

        // A crash during bind teardown may have left user files in
        // ~/MyFiles/Downloads; put them back before shadowing the
        // directory with the bind mount.
        downloads::move_directory_contents(self.platform, &downloads_in_my_files, &downloads);
        downloads::clear_migration_stage(self.platform, user_home);

        self.bind_and_push(&downloads, &downloads_in_my_files, RemountOption::NoRemount)
    }

    fn mount_daemon_store_directories(
        &mut self,
        root_home: &Path,
        user: &ObfuscatedUsername,
        etc_base: &Path,
        run_base: &Path,
    ) -> Result<(), Error> {
        // The template list lives on rootfs, so nothing can sneak extra
        // directories into the blind bind below.
        if !self.platform.directory_exists(etc_base) {
            return Ok(());
        }

        for etc_daemon_store_path in self.platform.list_directory(etc_base)? {
            if !self.platform.directory_exists(&etc_daemon_store_path) {
                continue;
            }
            let daemon_name = etc_daemon_store_path
                .file_name()
                .map(|n| n.to_os_string())
                .context("daemon-store entry has no name")?;

            let run_daemon_store_path = run_base.join(&daemon_name);
            if !self.platform.directory_exists(&run_daemon_store_path) {
                // Init is responsible for creating this tree.
                bail!(
                    "Daemon store directory '{}' does not exist",
                    run_daemon_store_path.display()
                );
            }

            let mount_source = root_home.join(&daemon_name);
            let mount_target = run_daemon_store_path.join(user.as_str());

            let etc_stat = self
                .platform
                .stat(&etc_daemon_store_path)?
                .context("daemon-store template vanished")?;

            // The bind target inherits the ownership the daemon declared
            // on its template directory.
            if self.platform.directory_exists(&mount_source) {
                self.platform
                    .set_permissions(&mount_source, etc_stat.permissions())?;
            } else {
                self.platform.create_dir_with_owner(
                    &mount_source,
                    etc_stat.permissions(),
                    etc_stat.uid,
                    etc_stat.gid,
                )?;
            }

            self.platform.create_directory(&mount_target)?;
            self.bind_and_push(&mount_source, &mount_target, RemountOption::NoRemount)?;
        }
        Ok(())
    }

    fn mount_daemon_store(
        &mut self,
        root_home: &Path,
        user: &ObfuscatedUsername,
    ) -> Result<(), Error> {
        self.mount_daemon_store_directories(
            root_home,
            user,
            Path::new(layout::ETC_DAEMON_STORE_BASE_DIR),
            Path::new(layout::RUN_DAEMON_STORE_BASE_DIR),
        )
    }

    fn mount_daemon_store_cache(
        &mut self,
        root_home: &Path,
        user: &ObfuscatedUsername,
    ) -> Result<(), Error> {
        self.mount_daemon_store_directories(
            &root_home.join(DAEMON_STORE_CACHE_DIR),
            user,
            Path::new(layout::ETC_DAEMON_STORE_BASE_DIR),
            Path::new(layout::RUN_DAEMON_STORE_CACHE_BASE_DIR),
        )
    }

    /// Binds the user- and root-visible views of a mounted vault.
    fn mount_homes_and_daemon_stores(
        &mut self,
        user: &ObfuscatedUsername,
        user_home: &Path,
        root_home: &Path,
    ) -> Result<(), Error> {
        // Self-bind both homes as shared so subsidiary mounts propagate
        // into every bind created below.
        self.bind_and_push(user_home, user_home, RemountOption::Shared)?;
        self.bind_and_push(root_home, root_home, RemountOption::Shared)?;

        if self.legacy_mount {
            self.mount_legacy_home(user_home)?;
        }

        let new_user_path = layout::new_user_path(user);
        self.bind_and_push(user_home, &new_user_path, RemountOption::MountsFlowIn)?;

        let user_multi_home = layout::user_multi_home(user);
        self.bind_and_push(user_home, &user_multi_home, RemountOption::MountsFlowIn)?;

        let root_multi_home = layout::root_multi_home(user);
        self.bind_and_push(root_home, &root_multi_home, RemountOption::MountsFlowIn)?;

        self.handle_my_files_downloads(user_home)?;

        self.mount_daemon_store(root_home, user)
    }

    fn mount_cache_subdirectories(
        &mut self,
        user: &ObfuscatedUsername,
        data_directory: &Path,
    ) -> Result<(), Error> {
        let cache_directory = layout::dmcrypt_user_cache_directory(user);

        let tracked_subdir_paths = [
            Path::new(USER_HOME_SUFFIX).join(CACHE_DIR),
            Path::new(USER_HOME_SUFFIX).join(GCACHE_DIR),
            Path::new(ROOT_HOME_SUFFIX).join(DAEMON_STORE_CACHE_DIR),
        ];

        for tracked_dir in &tracked_subdir_paths {
            let src_dir = cache_directory.join(tracked_dir);
            let dst_dir = data_directory.join(tracked_dir);
            self.bind_and_push(&src_dir, &dst_dir, RemountOption::MountsFlowIn)
                .context(format!("Failed to bind '{}'", src_dir.display()))?;
        }
        Ok(())
    }

    // Per-type mount recipes.

    fn setup_ecryptfs_mount(
        &mut self,
        user: &ObfuscatedUsername,
        fek_signature: &str,
        fnek_signature: &str,
        mount_point: &Path,
    ) -> Result<(), Error> {
        let vault_path = layout::ecryptfs_vault_path(user);

        let ecryptfs_options = format!(
            "ecryptfs_cipher=aes,ecryptfs_key_bytes={ECRYPTFS_KEY_BYTES},\
             ecryptfs_fnek_sig={fnek_signature},ecryptfs_sig={fek_signature},\
             ecryptfs_unlink_sigs"
        );

        // Tracked directories must exist before the overlay goes up; on
        // eCryptfs their names pass through unencrypted.
        let subdirs = self.common_subdirectories(&vault_path);
        self.create_vault_directory_structure(&subdirs)?;

        self.platform.create_directory(mount_point)?;
        self.mount_and_push(&vault_path, mount_point, "ecryptfs", &ecryptfs_options)
    }

    fn setup_dircrypto_mount(&mut self, user: &ObfuscatedUsername) -> Result<(), Error> {
        // The container already attached the policy; only the tracked
        // structure and its name tags are needed.
        let mount_point = layout::user_mount_directory(user);
        let subdirs = self.common_subdirectories(&mount_point);
        self.create_vault_directory_structure(&subdirs)?;
        self.set_tracking_xattrs(&subdirs)
    }

    fn setup_dmcrypt_mount(
        &mut self,
        user: &ObfuscatedUsername,
        data_mount_point: &Path,
    ) -> Result<(), Error> {
        let data_volume = layout::dmcrypt_data_volume(user);
        let cache_volume = layout::dmcrypt_cache_volume(user);
        let cache_mount_point = layout::dmcrypt_user_cache_directory(user);

        self.platform.create_directory(data_mount_point)?;
        self.platform.create_directory(&cache_mount_point)?;

        self.mount_and_push(
            &data_volume,
            data_mount_point,
            DMCRYPT_MOUNT_TYPE,
            DMCRYPT_MOUNT_OPTIONS,
        )
        .context("Failed to mount dm-crypt data volume")?;

        self.mount_and_push(
            &cache_volume,
            &cache_mount_point,
            DMCRYPT_MOUNT_TYPE,
            DMCRYPT_MOUNT_OPTIONS,
        )
        .context("Failed to mount dm-crypt cache volume")?;

        let data_subdirs = self.common_subdirectories(data_mount_point);
        self.create_vault_directory_structure(&data_subdirs)?;
        let cache_subdirs = self.cache_volume_subdirectories(&cache_mount_point);
        self.create_vault_directory_structure(&cache_subdirs)
    }

    // Skeleton handling.

    fn recursive_copy(&self, source: &Path, destination: &Path) -> Result<(), Error> {
        for entry in self.platform.list_directory(source)? {
            let name = entry.file_name().context("entry has no name")?;
            let destination_entry = destination.join(name);
            if self.platform.directory_exists(&entry) {
                self.platform.create_dir_with_owner(
                    &destination_entry,
                    SKELETON_SUB_DIR_MODE,
                    DEFAULT_UID,
                    DEFAULT_GID,
                )?;
                self.recursive_copy(&entry, &destination_entry)?;
            } else {
                self.platform.copy_file(&entry, &destination_entry)?;
                self.platform
                    .set_ownership(&destination_entry, DEFAULT_UID, DEFAULT_GID)?;
            }
        }
        Ok(())
    }

    fn copy_skeleton(&self, user_home: &Path) {
        let skel = Path::new(layout::SKEL_DIR);
        if !self.platform.directory_exists(skel) {
            return;
        }
        if let Err(e) = self.recursive_copy(skel, user_home) {
            warn!("Failed to copy skeleton into '{}': {e:#}", user_home.display());
        }
    }

    /// True once the user home holds anything beyond the initial vault
    /// structure and skeleton, i.e. a session has completed before.
    fn is_first_mount_complete(&self, user: &ObfuscatedUsername) -> bool {
        let mount_point = layout::user_mount_directory(user);
        let user_home = mount_point.join(USER_HOME_SUFFIX);

        let mut initial_nodes: Vec<PathBuf> = self
            .common_subdirectories(&mount_point)
            .iter()
            .map(|acl| acl.path.clone())
            .collect();
        if let Ok(skel_entries) = self.platform.list_directory(Path::new(layout::SKEL_DIR)) {
            for entry in skel_entries {
                if let Some(name) = entry.file_name() {
                    initial_nodes.push(user_home.join(name));
                }
            }
        }

        let Ok(entries) = self.platform.list_directory(&user_home) else {
            return false;
        };
        for entry in entries {
            if !initial_nodes.contains(&entry) {
                info!("Not a first mount, found: '{}'", entry.display());
                return true;
            }
        }
        false
    }

    // Entry points.

    /// Builds the whole mount graph for a set-up vault.
    pub fn perform_mount(
        &mut self,
        mount_type: MountType,
        user: &ObfuscatedUsername,
        fek_signature: &str,
        fnek_signature: &str,
    ) -> StorageResult<()> {
        info!("Performing mount of type {mount_type}");

        // Stale mounts are cleaned before sign-in, so an in-use mount
        // point here means a concurrent mount of the same user.
        let mount_point = layout::user_mount_directory(user);
        for busy_candidate in [
            mount_point.clone(),
            layout::user_multi_home(user),
            layout::root_multi_home(user),
            layout::new_user_path(user),
        ] {
            if self
                .platform
                .is_directory_mounted(&busy_candidate)
                .or_kind(MountError::Fatal, "Failed to probe mount point")?
            {
                return Err(StorageError::new(
                    MountError::MountPointBusy,
                    format!("Mount point is busy: {}", busy_candidate.display()),
                ));
            }
        }

        self.ensure_user_mount_points(user).or_kind(
            MountError::CreateCryptohomeFailed,
            "Error creating mount points",
        )?;

        let user_home = mount_point.join(USER_HOME_SUFFIX);
        let root_home = mount_point.join(ROOT_HOME_SUFFIX);

        match mount_type {
            MountType::Ecryptfs => {
                self.setup_ecryptfs_mount(user, fek_signature, fnek_signature, &mount_point)
                    .or_kind(MountError::MountEcryptfsFailed, "Can't set up ecryptfs")?;
            }
            MountType::EcryptfsToFscrypt => {
                self.setup_ecryptfs_mount(
                    user,
                    fek_signature,
                    fnek_signature,
                    &layout::user_temporary_mount_directory(user),
                )
                .or_kind(
                    MountError::MountEcryptfsFailed,
                    "Can't set up ecryptfs for migration to fscrypt",
                )?;
                self.setup_dircrypto_mount(user).or_kind(
                    MountError::MountFscryptFailed,
                    "Can't set up fscrypt migration target",
                )?;
                // The migration helper consumes both mounts from here.
                return Ok(());
            }
            MountType::EcryptfsToDmcrypt => {
                self.setup_ecryptfs_mount(
                    user,
                    fek_signature,
                    fnek_signature,
                    &layout::user_temporary_mount_directory(user),
                )
                .or_kind(
                    MountError::MountEcryptfsFailed,
                    "Can't set up ecryptfs for migration to dmcrypt",
                )?;
                self.setup_dmcrypt_mount(user, &mount_point).or_kind(
                    MountError::MountDmcryptFailed,
                    "Can't set up dmcrypt to migrate from ecryptfs",
                )?;
                self.mount_cache_subdirectories(user, &mount_point).or_kind(
                    MountError::MountDmcryptFailed,
                    "Can't set up dmcrypt cache to migrate from ecryptfs",
                )?;
                self.mount_daemon_store_cache(&root_home, user).or_kind(
                    MountError::MountDmcryptFailed,
                    "Can't mount daemon-store-cache",
                )?;
                return Ok(());
            }
            MountType::Dircrypto => {
                self.setup_dircrypto_mount(user).or_kind(
                    MountError::MountFscryptFailed,
                    "Can't set up fscrypt home",
                )?;
            }
            MountType::FscryptToDmcrypt => {
                self.setup_dircrypto_mount(user).or_kind(
                    MountError::MountFscryptFailed,
                    "Can't set up fscrypt migration source",
                )?;
                let temporary_mount = layout::user_temporary_mount_directory(user);
                self.setup_dmcrypt_mount(user, &temporary_mount).or_kind(
                    MountError::MountDmcryptFailed,
                    "Can't set up dmcrypt to migrate from fscrypt",
                )?;
                self.mount_cache_subdirectories(user, &temporary_mount)
                    .or_kind(
                        MountError::MountDmcryptFailed,
                        "Can't set up dmcrypt cache to migrate from fscrypt",
                    )?;
                self.mount_daemon_store_cache(&root_home, user).or_kind(
                    MountError::MountDmcryptFailed,
                    "Can't mount daemon-store-cache",
                )?;
                return Ok(());
            }
            MountType::Dmcrypt => {
                self.setup_dmcrypt_mount(user, &mount_point).or_kind(
                    MountError::MountDmcryptFailed,
                    "Dm-crypt mount failed",
                )?;
            }
            MountType::Ephemeral => {
                return Err(StorageError::new(
                    MountError::Fatal,
                    "Ephemeral homes use perform_ephemeral_mount",
                ));
            }
        }

        if !self.is_first_mount_complete(user) {
            self.copy_skeleton(&user_home);
        }

        self.mount_homes_and_daemon_stores(user, &user_home, &root_home)
            .or_kind(
                MountError::MountHomesAndDaemonStoresFailed,
                "Can't mount home or daemon stores",
            )?;

        if mount_type == MountType::Dmcrypt {
            self.mount_cache_subdirectories(user, &mount_point).or_kind(
                MountError::MountDmcryptFailed,
                "Failed to mount tracked subdirectories from the cache volume",
            )?;
        }

        self.mount_daemon_store_cache(&root_home, user).or_kind(
            MountError::MountDmcryptFailed,
            "Can't mount daemon-store-cache",
        )?;

        Ok(())
    }

    pub fn can_perform_ephemeral_mount(&self) -> bool {
        self.stack.is_empty()
    }

    /// Mounts an ephemeral home from an attached loop device.
    pub fn perform_ephemeral_mount(
        &mut self,
        user: &ObfuscatedUsername,
        ephemeral_loop_device: &Path,
    ) -> StorageResult<()> {
        // Ephemeral mounts are exclusive with any recorded mount.
        if !self.can_perform_ephemeral_mount() {
            return Err(StorageError::new(
                MountError::MountPointBusy,
                "An ephemeral mount cannot coexist with other mounts",
            ));
        }

        let mount_point = layout::ephemeral_mount_directory(user);
        self.platform
            .create_directory(&mount_point)
            .or_kind(MountError::Fatal, "Can't create ephemeral mount point")?;

        self.mount_and_push(
            ephemeral_loop_device,
            &mount_point,
            EPHEMERAL_MOUNT_TYPE,
            EPHEMERAL_MOUNT_OPTIONS,
        )
        .or_kind(MountError::Fatal, "Can't mount ephemeral home")?;

        // A fresh filesystem carries no context; label the root before
        // anything is created inside.
        self.platform
            .set_selinux_context(&mount_point, EPHEMERAL_CRYPTOHOME_ROOT_CONTEXT)
            .or_kind(MountError::Fatal, "Can't set ephemeral SELinux context")?;

        self.ensure_user_mount_points(user)
            .or_kind(MountError::Fatal, "Can't ensure ephemeral mount points")?;

        let subdirs = self.common_subdirectories(&mount_point);
        self.create_vault_directory_structure(&subdirs)
            .or_kind(MountError::Fatal, "Can't create ephemeral vault structure")?;

        let user_home = mount_point.join(USER_HOME_SUFFIX);
        let root_home = mount_point.join(ROOT_HOME_SUFFIX);

        self.copy_skeleton(&user_home);

        self.mount_homes_and_daemon_stores(user, &user_home, &root_home)
            .or_kind(
                MountError::MountHomesAndDaemonStoresFailed,
                "Can't mount ephemeral home and daemon stores",
            )?;

        self.mount_daemon_store_cache(&root_home, user).or_kind(
            MountError::MountHomesAndDaemonStoresFailed,
            "Can't mount ephemeral daemon-store-cache",
        )?;

        Ok(())
    }

    fn force_unmount(&self, src: &Path, dest: &Path) {
        match self.platform.unmount(dest) {
            Ok(()) => {}
            Err(UnmountError::Busy) => {
                warn!("Couldn't unmount '{}' immediately, it is busy", dest.display());
                // Sync first so a lazy detach cannot lose dirty pages.
                if let Err(e) = self.platform.sync_directory(dest) {
                    warn!("Failed to sync '{}': {e:#}", dest.display());
                }
                if let Err(e) = self.platform.lazy_unmount(dest) {
                    error!("Failed to lazily unmount '{}': {e:#}", dest.display());
                }
                if let Err(e) = self.platform.sync_directory(src) {
                    warn!("Failed to sync '{}': {e:#}", src.display());
                }
            }
            Err(UnmountError::Other(e)) => {
                error!("Couldn't unmount '{}': {e:#}", dest.display());
                if let Err(e) = self.platform.lazy_unmount(dest) {
                    error!("Failed to lazily unmount '{}': {e:#}", dest.display());
                }
            }
        }
    }

    /// Pops the whole stack, reversing every recorded mount. A busy mount
    /// falls back to sync-then-lazy unmount, so the stack always drains.
    pub fn unmount_all(&mut self) {
        while let Some((src, dest)) = self.stack.pop() {
            self.force_unmount(&src, &dest);
        }

        // Clean up the mount points of ephemeral loop-device mounts.
        let ephemeral_mount_root =
            Path::new(layout::EPHEMERAL_CRYPTOHOME_DIR).join(layout::EPHEMERAL_MOUNT_DIR);
        if let Err(e) = self.platform.delete_path_recursively(&ephemeral_mount_root) {
            warn!(
                "Failed to clean '{}': {e:#}",
                ephemeral_mount_root.display()
            );
        }
    }
}

impl Drop for Mounter<'_> {
    fn drop(&mut self) {
        if !self.stack.is_empty() {
            error!("Mount stack is not empty at shutdown; unmounting");
            self.unmount_all();
        }
    }
}

#[cfg(test)]
mod tests;
