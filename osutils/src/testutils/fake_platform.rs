//! In-process [`Platform`] double.
//!
//! File and directory operations are real, remapped into a private temp
//! directory so canonical absolute paths can be used unchanged. Mounts,
//! loop devices, device-mapper tables, logical volumes, xattrs and fscrypt
//! state are virtual: recorded in memory and inspectable by tests.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context, Error};
use tempfile::TempDir;

use crate::{
    devmapper::TargetVersion,
    e2fsck::{FsckOption, FSCK_SUCCESS},
    files,
    fscrypt::KeyState,
    lvm::Thinpool,
    mounts::RemountOption,
    platform::{FileMetadata, Platform, UnmountError},
};

#[derive(Default)]
struct State {
    mounts: Vec<(PathBuf, PathBuf)>,
    mount_details: Vec<(PathBuf, PathBuf, String, String)>,
    busy_targets: HashSet<PathBuf>,
    // Ownership and xattrs are keyed by inode so they follow renames.
    owners: HashMap<u64, (u32, u32)>,
    xattrs: HashMap<u64, HashMap<String, Vec<u8>>>,
    key_states: HashMap<PathBuf, KeyState>,
    loop_devices: HashMap<PathBuf, PathBuf>,
    next_loop: u32,
    dm_tables: HashMap<String, String>,
    dm_deferred: HashSet<String>,
    dm_messages: Vec<(String, String)>,
    logical_volumes: HashMap<String, u64>,
    active_volumes: HashSet<String>,
    formatted: HashSet<PathBuf>,
    fsck_results: HashMap<PathBuf, i32>,
    tune2fs_failures: HashSet<PathBuf>,
    tune2fs_applied: Vec<(PathBuf, Vec<String>)>,
    selinux_contexts: HashMap<PathBuf, String>,
}

pub struct FakePlatform {
    root: TempDir,
    state: RefCell<State>,
    default_key_state: RefCell<KeyState>,
    statvfs_size: RefCell<u64>,
    stateful_size: RefCell<u64>,
    dm_version: RefCell<Option<TargetVersion>>,
}

impl Default for FakePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("create FakePlatform root"),
            state: RefCell::new(State::default()),
            default_key_state: RefCell::new(KeyState::NoKey),
            statvfs_size: RefCell::new(1 << 30),
            stateful_size: RefCell::new(16 << 30),
            dm_version: RefCell::new(Some(TargetVersion(1, 15, 0))),
        }
    }

    /// Maps a canonical absolute path into the private root.
    pub fn translate(&self, path: &Path) -> PathBuf {
        match path.strip_prefix("/") {
            Ok(rel) => self.root.path().join(rel),
            Err(_) => self.root.path().join(path),
        }
    }

    fn inode(&self, path: &Path) -> Result<u64, Error> {
        let st = files::maybe_stat(self.translate(path))?
            .ok_or_else(|| anyhow!("'{}' does not exist", path.display()))?;
        Ok(st.st_ino)
    }

    // Test knobs and probes.

    pub fn mounts(&self) -> Vec<(PathBuf, PathBuf)> {
        self.state.borrow().mounts.clone()
    }

    /// Filesystem mounts with their type and option string, in order.
    pub fn mount_details(&self) -> Vec<(PathBuf, PathBuf, String, String)> {
        self.state.borrow().mount_details.clone()
    }

    pub fn make_busy(&self, target: &Path) {
        self.state.borrow_mut().busy_targets.insert(target.into());
    }

    pub fn set_key_state(&self, dir: &Path, state: KeyState) {
        self.state.borrow_mut().key_states.insert(dir.into(), state);
    }

    pub fn set_default_key_state(&self, state: KeyState) {
        *self.default_key_state.borrow_mut() = state;
    }

    pub fn set_fsck_result(&self, device: &Path, code: i32) {
        self.state
            .borrow_mut()
            .fsck_results
            .insert(device.into(), code);
    }

    pub fn fail_tune2fs(&self, device: &Path) {
        self.state
            .borrow_mut()
            .tune2fs_failures
            .insert(device.into());
    }

    pub fn tune2fs_applied(&self, device: &Path) -> Vec<Vec<String>> {
        self.state
            .borrow()
            .tune2fs_applied
            .iter()
            .filter(|(path, _)| path == device)
            .map(|(_, opts)| opts.clone())
            .collect()
    }

    pub fn was_formatted(&self, device: &Path) -> bool {
        self.state.borrow().formatted.contains(device)
    }

    pub fn dm_table(&self, name: &str) -> Option<String> {
        self.state.borrow().dm_tables.get(name).cloned()
    }

    pub fn dm_marked_deferred(&self, name: &str) -> bool {
        self.state.borrow().dm_deferred.contains(name)
    }

    pub fn dm_messages(&self, name: &str) -> Vec<String> {
        self.state
            .borrow()
            .dm_messages
            .iter()
            .filter(|(device, _)| device == name)
            .map(|(_, message)| message.clone())
            .collect()
    }

    pub fn add_logical_volume(&self, volume_group: &str, name: &str, size_mib: u64) {
        self.state
            .borrow_mut()
            .logical_volumes
            .insert(format!("{volume_group}/{name}"), size_mib);
    }

    pub fn selinux_context(&self, path: &Path) -> Option<String> {
        self.state.borrow().selinux_contexts.get(path).cloned()
    }

    pub fn set_statvfs_size(&self, size: u64) {
        *self.statvfs_size.borrow_mut() = size;
    }

    pub fn set_stateful_size(&self, size: u64) {
        *self.stateful_size.borrow_mut() = size;
    }

    pub fn set_dm_version(&self, version: Option<TargetVersion>) {
        *self.dm_version.borrow_mut() = version;
    }

    fn loop_backing_of(&self, device: &Path) -> Option<PathBuf> {
        self.state
            .borrow()
            .loop_devices
            .iter()
            .find(|(_, dev)| dev.as_path() == device)
            .map(|(backing, _)| backing.clone())
    }
}

impl Platform for FakePlatform {
    fn file_exists(&self, path: &Path) -> bool {
        self.translate(path).is_file()
    }

    fn directory_exists(&self, path: &Path) -> bool {
        self.translate(path).is_dir()
    }

    fn create_directory(&self, path: &Path) -> Result<(), Error> {
        files::create_dirs(self.translate(path))
    }

    fn create_dir_with_owner(
        &self,
        path: &Path,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(), Error> {
        let real = self.translate(path);
        if !real.is_dir() {
            if real.exists() {
                bail!("Path '{}' exists and is not a directory", path.display());
            }
            fs::create_dir(&real)
                .context(format!("Failed to create '{}'", path.display()))?;
        }
        fs::set_permissions(&real, fs::Permissions::from_mode(mode))?;
        self.set_ownership(path, uid, gid)
    }

    fn set_ownership(&self, path: &Path, uid: u32, gid: u32) -> Result<(), Error> {
        let ino = self.inode(path)?;
        self.state.borrow_mut().owners.insert(ino, (uid, gid));
        Ok(())
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<(), Error> {
        fs::set_permissions(self.translate(path), fs::Permissions::from_mode(mode))
            .context(format!("Failed to chmod '{}'", path.display()))
    }

    fn stat(&self, path: &Path) -> Result<Option<FileMetadata>, Error> {
        let Some(st) = files::maybe_stat(self.translate(path))? else {
            return Ok(None);
        };
        // Paths with no recorded ownership read as root-owned, matching
        // the daemon's view of directories that init provides.
        let (uid, gid) = self
            .state
            .borrow()
            .owners
            .get(&st.st_ino)
            .copied()
            .unwrap_or((0, 0));
        Ok(Some(FileMetadata {
            mode: st.st_mode,
            uid,
            gid,
            size: st.st_size as u64,
        }))
    }

    fn delete_file(&self, path: &Path) -> Result<(), Error> {
        let real = self.translate(path);
        if real.is_dir() {
            fs::remove_dir(&real)
        } else {
            fs::remove_file(&real)
        }
        .context(format!("Failed to delete '{}'", path.display()))
    }

    fn delete_path_recursively(&self, path: &Path) -> Result<(), Error> {
        let real = self.translate(path);
        if !real.exists() {
            return Ok(());
        }
        if real.is_dir() {
            fs::remove_dir_all(&real)
        } else {
            fs::remove_file(&real)
        }
        .context(format!("Failed to recursively delete '{}'", path.display()))
    }

    fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>, Error> {
        let real = self.translate(path);
        let mut entries = Vec::new();
        for entry in
            fs::read_dir(&real).context(format!("Failed to enumerate '{}'", path.display()))?
        {
            entries.push(path.join(entry?.file_name()));
        }
        entries.sort();
        Ok(entries)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<(), Error> {
        fs::copy(self.translate(from), self.translate(to))
            .map(|_| ())
            .context(format!(
                "Failed to copy '{}' to '{}'",
                from.display(),
                to.display()
            ))
    }

    fn rename_no_replace(&self, from: &Path, to: &Path) -> Result<(), std::io::Error> {
        files::rename_no_replace(self.translate(from), self.translate(to))
    }

    fn exchange(&self, a: &Path, b: &Path) -> Result<(), Error> {
        files::exchange(self.translate(a), self.translate(b))
    }

    fn create_sparse_file(&self, path: &Path, size: u64) -> Result<(), Error> {
        files::create_sparse_file(self.translate(path), size)
    }

    fn sync_directory(&self, _path: &Path) -> Result<(), Error> {
        Ok(())
    }

    fn get_xattr(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>, Error> {
        let ino = self.inode(path)?;
        Ok(self
            .state
            .borrow()
            .xattrs
            .get(&ino)
            .and_then(|attrs| attrs.get(name))
            .cloned())
    }

    fn set_xattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<(), Error> {
        let ino = self.inode(path)?;
        self.state
            .borrow_mut()
            .xattrs
            .entry(ino)
            .or_default()
            .insert(name.into(), value.to_vec());
        Ok(())
    }

    fn remove_xattr(&self, path: &Path, name: &str) -> Result<bool, Error> {
        let ino = self.inode(path)?;
        Ok(self
            .state
            .borrow_mut()
            .xattrs
            .get_mut(&ino)
            .and_then(|attrs| attrs.remove(name))
            .is_some())
    }

    fn mount(&self, src: &Path, dst: &Path, fstype: &str, data: &str) -> Result<(), Error> {
        if !self.translate(dst).exists() {
            bail!("Mount point '{}' does not exist", dst.display());
        }
        // An overlay filesystem exposes the lower directory's tree at the
        // mount point; materialize that view so path-based code sees it.
        if fstype == "ecryptfs" {
            mirror_tree(&self.translate(src), &self.translate(dst))?;
        }
        let mut state = self.state.borrow_mut();
        state.mounts.push((src.into(), dst.into()));
        state
            .mount_details
            .push((src.into(), dst.into(), fstype.into(), data.into()));
        Ok(())
    }

    fn bind(&self, src: &Path, dst: &Path, _remount: RemountOption) -> Result<(), Error> {
        if !self.translate(src).exists() {
            bail!("Bind source '{}' does not exist", src.display());
        }
        if !self.translate(dst).exists() {
            bail!("Bind target '{}' does not exist", dst.display());
        }
        self.state
            .borrow_mut()
            .mounts
            .push((src.into(), dst.into()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), UnmountError> {
        let mut state = self.state.borrow_mut();
        if state.busy_targets.contains(target) {
            return Err(UnmountError::Busy);
        }
        match state.mounts.iter().rposition(|(_, dst)| dst == target) {
            Some(index) => {
                state.mounts.remove(index);
                Ok(())
            }
            None => Err(UnmountError::Other(anyhow!(
                "'{}' is not mounted",
                target.display()
            ))),
        }
    }

    fn lazy_unmount(&self, target: &Path) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        state.busy_targets.remove(target);
        match state.mounts.iter().rposition(|(_, dst)| dst == target) {
            Some(index) => {
                state.mounts.remove(index);
                Ok(())
            }
            None => bail!("'{}' is not mounted", target.display()),
        }
    }

    fn is_directory_mounted(&self, path: &Path) -> Result<bool, Error> {
        Ok(self.state.borrow().mounts.iter().any(|(_, dst)| dst == path))
    }

    fn attach_loop(&self, backing_file: &Path) -> Result<PathBuf, Error> {
        if !self.translate(backing_file).exists() {
            bail!("Backing file '{}' does not exist", backing_file.display());
        }
        let mut state = self.state.borrow_mut();
        if state.loop_devices.contains_key(backing_file) {
            bail!(
                "Backing file '{}' is already attached",
                backing_file.display()
            );
        }
        let device = PathBuf::from(format!("/dev/loop{}", state.next_loop));
        state.next_loop += 1;
        state.loop_devices.insert(backing_file.into(), device.clone());
        Ok(device)
    }

    fn detach_loop(&self, device: &Path) -> Result<(), Error> {
        let backing = self
            .loop_backing_of(device)
            .ok_or_else(|| anyhow!("Loop device '{}' is not attached", device.display()))?;
        self.state.borrow_mut().loop_devices.remove(&backing);
        Ok(())
    }

    fn loop_device_for(&self, backing_file: &Path) -> Result<Option<PathBuf>, Error> {
        Ok(self.state.borrow().loop_devices.get(backing_file).cloned())
    }

    fn get_blk_size(&self, device: &Path) -> Result<u64, Error> {
        if let Some(backing) = self.loop_backing_of(device) {
            let st = files::maybe_stat(self.translate(&backing))?
                .ok_or_else(|| anyhow!("Backing '{}' vanished", backing.display()))?;
            return Ok(st.st_size as u64);
        }
        if let Ok(name) = device.strip_prefix("/dev/mapper") {
            let name = name.to_string_lossy();
            let state = self.state.borrow();
            let table = state
                .dm_tables
                .get(name.as_ref())
                .ok_or_else(|| anyhow!("Unknown dm device '{}'", device.display()))?;
            let sectors: u64 = table
                .split_whitespace()
                .nth(1)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            return Ok(sectors * 512);
        }
        if let Some(lv_size) = device
            .strip_prefix("/dev")
            .ok()
            .map(|rel| rel.to_string_lossy().into_owned())
            .and_then(|key| self.state.borrow().logical_volumes.get(&key).copied())
        {
            return Ok(lv_size << 20);
        }
        let st = files::maybe_stat(self.translate(device))?
            .ok_or_else(|| anyhow!("Unknown device '{}'", device.display()))?;
        Ok(st.st_size as u64)
    }

    fn udev_settle(&self, _device: &Path) -> Result<(), Error> {
        Ok(())
    }

    fn dm_target_version(&self, _target: &str) -> Result<Option<TargetVersion>, Error> {
        Ok(*self.dm_version.borrow())
    }

    fn dm_create(&self, name: &str, table: &str) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        if state.dm_tables.contains_key(name) {
            bail!("Device-mapper device '{name}' already exists");
        }
        state.dm_tables.insert(name.into(), table.into());
        Ok(())
    }

    fn dm_remove(&self, name: &str, deferred: bool) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        if state.dm_tables.remove(name).is_none() {
            bail!("Device-mapper device '{name}' does not exist");
        }
        if deferred {
            state.dm_deferred.insert(name.into());
        }
        Ok(())
    }

    fn dm_message(&self, name: &str, message: &str) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        if !state.dm_tables.contains_key(name) {
            bail!("Device-mapper device '{name}' does not exist");
        }
        state.dm_messages.push((name.into(), message.into()));
        Ok(())
    }

    fn lv_create_thin(&self, pool: &Thinpool, name: &str, size_mib: u64) -> Result<(), Error> {
        let key = format!("{}/{}", pool.volume_group, name);
        let mut state = self.state.borrow_mut();
        if state.logical_volumes.contains_key(&key) {
            bail!("Logical volume '{key}' already exists");
        }
        state.logical_volumes.insert(key.clone(), size_mib);
        state.active_volumes.insert(key);
        Ok(())
    }

    fn lv_remove(&self, volume_group: &str, name: &str) -> Result<(), Error> {
        let key = format!("{volume_group}/{name}");
        let mut state = self.state.borrow_mut();
        state.active_volumes.remove(&key);
        if state.logical_volumes.remove(&key).is_none() {
            bail!("Logical volume '{key}' does not exist");
        }
        Ok(())
    }

    fn lv_exists(&self, volume_group: &str, name: &str) -> Result<bool, Error> {
        Ok(self
            .state
            .borrow()
            .logical_volumes
            .contains_key(&format!("{volume_group}/{name}")))
    }

    fn lv_activate(&self, volume_group: &str, name: &str) -> Result<PathBuf, Error> {
        let key = format!("{volume_group}/{name}");
        let mut state = self.state.borrow_mut();
        if !state.logical_volumes.contains_key(&key) {
            bail!("Logical volume '{key}' does not exist");
        }
        state.active_volumes.insert(key.clone());
        Ok(Path::new("/dev").join(key))
    }

    fn lv_deactivate(&self, volume_group: &str, name: &str) -> Result<(), Error> {
        self.state
            .borrow_mut()
            .active_volumes
            .remove(&format!("{volume_group}/{name}"));
        Ok(())
    }

    fn format_ext4(&self, device: &Path, _opts: &[String]) -> Result<(), Error> {
        if let Some(backing) = self.loop_backing_of(device) {
            let st = files::maybe_stat(self.translate(&backing))?
                .ok_or_else(|| anyhow!("Backing '{}' vanished", backing.display()))?;
            if st.st_size == 0 {
                bail!(
                    "Refusing to format zero-sized backing file '{}'",
                    backing.display()
                );
            }
        }
        self.state.borrow_mut().formatted.insert(device.into());
        Ok(())
    }

    fn fsck(&self, device: &Path, _option: FsckOption) -> Result<i32, Error> {
        Ok(self
            .state
            .borrow()
            .fsck_results
            .get(device)
            .copied()
            .unwrap_or(FSCK_SUCCESS))
    }

    fn tune2fs(&self, device: &Path, opts: &[String]) -> Result<(), Error> {
        if self.state.borrow().tune2fs_failures.contains(device) {
            bail!("tune2fs failed for '{}'", device.display());
        }
        self.state
            .borrow_mut()
            .tune2fs_applied
            .push((device.into(), opts.to_vec()));
        Ok(())
    }

    fn get_dir_crypto_key_state(&self, dir: &Path) -> KeyState {
        self.state
            .borrow()
            .key_states
            .get(dir)
            .copied()
            .unwrap_or(*self.default_key_state.borrow())
    }

    fn set_directory_policy(
        &self,
        dir: &Path,
        _key_descriptor: &[u8],
        _v2: bool,
    ) -> Result<(), Error> {
        if !self.translate(dir).is_dir() {
            bail!("'{}' is not a directory", dir.display());
        }
        self.state
            .borrow_mut()
            .key_states
            .insert(dir.into(), KeyState::Encrypted);
        Ok(())
    }

    fn statvfs_size(&self, _path: &Path) -> Result<u64, Error> {
        Ok(*self.statvfs_size.borrow())
    }

    fn stateful_device_size(&self) -> Result<u64, Error> {
        Ok(*self.stateful_size.borrow())
    }

    fn set_selinux_context(&self, path: &Path, context: &str) -> Result<(), Error> {
        self.state
            .borrow_mut()
            .selinux_contexts
            .insert(path.into(), context.into());
        Ok(())
    }
}

fn mirror_tree(src: &Path, dst: &Path) -> Result<(), Error> {
    for entry in fs::read_dir(src).context(format!("Failed to read '{}'", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            if !target.is_dir() {
                fs::create_dir(&target)?;
            }
            mirror_tree(&entry.path(), &target)?;
        } else if !target.exists() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_translation_and_file_ops() {
        let platform = FakePlatform::new();
        let dir = Path::new("/home/.shadow/0123");
        platform.create_directory(dir).unwrap();
        assert!(platform.directory_exists(dir));
        assert!(!platform.directory_exists(Path::new("/home/.shadow/4567")));

        let entries = platform.list_directory(Path::new("/home/.shadow")).unwrap();
        assert_eq!(entries, vec![PathBuf::from("/home/.shadow/0123")]);
    }

    #[test]
    fn test_virtual_mount_table() {
        let platform = FakePlatform::new();
        let src = Path::new("/home/.shadow/u/mount");
        let dst = Path::new("/home/user/u");
        platform.create_directory(src).unwrap();
        platform.create_directory(dst).unwrap();

        platform.bind(src, dst, RemountOption::NoRemount).unwrap();
        assert!(platform.is_directory_mounted(dst).unwrap());

        platform.unmount(dst).unwrap();
        assert!(!platform.is_directory_mounted(dst).unwrap());
        assert!(matches!(
            platform.unmount(dst),
            Err(UnmountError::Other(_))
        ));
    }

    #[test]
    fn test_busy_unmount_falls_back_to_lazy() {
        let platform = FakePlatform::new();
        let dst = Path::new("/home/user/u");
        platform.create_directory(dst).unwrap();
        platform.create_directory(Path::new("/src")).unwrap();
        platform
            .bind(Path::new("/src"), dst, RemountOption::NoRemount)
            .unwrap();

        platform.make_busy(dst);
        assert!(matches!(platform.unmount(dst), Err(UnmountError::Busy)));
        platform.lazy_unmount(dst).unwrap();
        assert!(!platform.is_directory_mounted(dst).unwrap());
    }

    #[test]
    fn test_xattrs_follow_renames() {
        let platform = FakePlatform::new();
        let a = Path::new("/data/a");
        let b = Path::new("/data/b");
        platform.create_directory(a).unwrap();
        platform.set_xattr(a, "user.Marker", b"migrating").unwrap();

        platform.rename_no_replace(a, b).unwrap();
        assert_eq!(
            platform.get_xattr(b, "user.Marker").unwrap().unwrap(),
            b"migrating"
        );
    }

    #[test]
    fn test_loop_and_dm_devices() {
        let platform = FakePlatform::new();
        let backing = Path::new("/run/backing");
        platform.create_sparse_file(backing, 1 << 20).unwrap();

        let device = platform.attach_loop(backing).unwrap();
        assert_eq!(platform.loop_device_for(backing).unwrap(), Some(device.clone()));
        assert_eq!(platform.get_blk_size(&device).unwrap(), 1 << 20);

        platform.dm_create("crypt-dev", "0 2048 crypt aes xyz 0 /dev/loop0 0").unwrap();
        assert_eq!(
            platform.get_blk_size(Path::new("/dev/mapper/crypt-dev")).unwrap(),
            2048 * 512
        );
        platform.dm_remove("crypt-dev", false).unwrap();
        platform.dm_remove("crypt-dev", false).unwrap_err();

        platform.detach_loop(&device).unwrap();
        assert_eq!(platform.loop_device_for(backing).unwrap(), None);
    }

    #[test]
    fn test_ownership_is_recorded() {
        let platform = FakePlatform::new();
        let dir = Path::new("/home/user/x");
        platform.create_dir_with_owner(dir, 0o700, 1000, 400).unwrap();
        let st = platform.stat(dir).unwrap().unwrap();
        assert_eq!((st.uid, st.gid), (1000, 400));
        assert_eq!(st.permissions(), 0o700);
        assert!(st.is_dir());
    }
}
