//! The seam between the storage logic and the operating system.
//!
//! Every filesystem, mount, device-mapper, loop-device and fscrypt
//! operation the storage core performs goes through [`Platform`], so the
//! logic above it can be exercised against `testutils::FakePlatform`.

use std::{
    fs,
    mem,
    os::fd::AsRawFd,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Error};
use log::error;
use nix::request_code_read;

use crate::{
    devmapper::{self, TargetVersion},
    e2fsck::{self, FsckOption},
    files, fscrypt,
    fscrypt::KeyState,
    loopdev,
    lvm::{self, Thinpool},
    mkfs, mounts,
    mounts::RemountOption,
    tune2fs, udevadm, xattr,
};

/// Subset of stat(2) results the storage core inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMetadata {
    /// Full `st_mode`, type bits included.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
}

impl FileMetadata {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Why an eager unmount failed.
#[derive(Debug)]
pub enum UnmountError {
    /// The mount is busy; the caller may sync and retry lazily.
    Busy,
    Other(Error),
}

pub trait Platform {
    // File and directory operations.
    fn file_exists(&self, path: &Path) -> bool;
    fn directory_exists(&self, path: &Path) -> bool;
    fn create_directory(&self, path: &Path) -> Result<(), Error>;
    fn create_dir_with_owner(&self, path: &Path, mode: u32, uid: u32, gid: u32)
        -> Result<(), Error>;
    fn set_ownership(&self, path: &Path, uid: u32, gid: u32) -> Result<(), Error>;
    fn set_permissions(&self, path: &Path, mode: u32) -> Result<(), Error>;
    fn stat(&self, path: &Path) -> Result<Option<FileMetadata>, Error>;
    fn delete_file(&self, path: &Path) -> Result<(), Error>;
    fn delete_path_recursively(&self, path: &Path) -> Result<(), Error>;
    fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>, Error>;
    fn copy_file(&self, from: &Path, to: &Path) -> Result<(), Error>;
    fn rename_no_replace(&self, from: &Path, to: &Path) -> Result<(), std::io::Error>;
    fn exchange(&self, a: &Path, b: &Path) -> Result<(), Error>;
    fn create_sparse_file(&self, path: &Path, size: u64) -> Result<(), Error>;
    fn sync_directory(&self, path: &Path) -> Result<(), Error>;

    // Extended attributes.
    fn get_xattr(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>, Error>;
    fn set_xattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<(), Error>;
    fn remove_xattr(&self, path: &Path, name: &str) -> Result<bool, Error>;

    // Mount graph.
    fn mount(&self, src: &Path, dst: &Path, fstype: &str, data: &str) -> Result<(), Error>;
    fn bind(&self, src: &Path, dst: &Path, remount: RemountOption) -> Result<(), Error>;
    fn unmount(&self, target: &Path) -> Result<(), UnmountError>;
    fn lazy_unmount(&self, target: &Path) -> Result<(), Error>;
    fn is_directory_mounted(&self, path: &Path) -> Result<bool, Error>;

    fn are_directories_mounted(&self, paths: &[PathBuf]) -> Result<Vec<bool>, Error> {
        paths
            .iter()
            .map(|path| self.is_directory_mounted(path))
            .collect()
    }

    // Block devices.
    fn attach_loop(&self, backing_file: &Path) -> Result<PathBuf, Error>;
    fn detach_loop(&self, device: &Path) -> Result<(), Error>;
    fn loop_device_for(&self, backing_file: &Path) -> Result<Option<PathBuf>, Error>;
    fn get_blk_size(&self, device: &Path) -> Result<u64, Error>;
    fn udev_settle(&self, device: &Path) -> Result<(), Error>;

    // Device mapper.
    fn dm_target_version(&self, target: &str) -> Result<Option<TargetVersion>, Error>;
    fn dm_create(&self, name: &str, table: &str) -> Result<(), Error>;
    fn dm_remove(&self, name: &str, deferred: bool) -> Result<(), Error>;
    fn dm_message(&self, name: &str, message: &str) -> Result<(), Error>;
    fn dm_device_path(&self, name: &str) -> PathBuf {
        devmapper::device_path(name)
    }

    // Logical volumes.
    fn lv_create_thin(&self, pool: &Thinpool, name: &str, size_mib: u64) -> Result<(), Error>;
    fn lv_remove(&self, volume_group: &str, name: &str) -> Result<(), Error>;
    fn lv_exists(&self, volume_group: &str, name: &str) -> Result<bool, Error>;
    fn lv_activate(&self, volume_group: &str, name: &str) -> Result<PathBuf, Error>;
    fn lv_deactivate(&self, volume_group: &str, name: &str) -> Result<(), Error>;

    // Filesystem tooling.
    fn format_ext4(&self, device: &Path, opts: &[String]) -> Result<(), Error>;
    fn fsck(&self, device: &Path, option: FsckOption) -> Result<i32, Error>;
    fn tune2fs(&self, device: &Path, opts: &[String]) -> Result<(), Error>;

    // fscrypt.
    fn get_dir_crypto_key_state(&self, dir: &Path) -> KeyState;
    fn set_directory_policy(&self, dir: &Path, key_descriptor: &[u8], v2: bool)
        -> Result<(), Error>;

    // Miscellaneous.
    fn statvfs_size(&self, path: &Path) -> Result<u64, Error>;
    fn stateful_device_size(&self) -> Result<u64, Error>;
    fn set_selinux_context(&self, path: &Path, context: &str) -> Result<(), Error>;
}

/// Production [`Platform`] delegating to the real system.
pub struct SysPlatform {
    stateful_device: PathBuf,
}

impl SysPlatform {
    pub fn new(stateful_device: PathBuf) -> Self {
        Self { stateful_device }
    }
}

impl Platform for SysPlatform {
    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn directory_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn create_directory(&self, path: &Path) -> Result<(), Error> {
        files::create_dirs(path)
    }

    fn create_dir_with_owner(
        &self,
        path: &Path,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<(), Error> {
        files::create_dir_with_owner(path, mode, uid, gid)
    }

    fn set_ownership(&self, path: &Path, uid: u32, gid: u32) -> Result<(), Error> {
        nix::unistd::chown(
            path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        )
        .context(format!("Failed to chown '{}'", path.display()))
    }

    fn set_permissions(&self, path: &Path, mode: u32) -> Result<(), Error> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .context(format!("Failed to chmod '{}'", path.display()))
    }

    fn stat(&self, path: &Path) -> Result<Option<FileMetadata>, Error> {
        Ok(files::maybe_stat(path)?.map(|st| FileMetadata {
            mode: st.st_mode,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size as u64,
        }))
    }

    fn delete_file(&self, path: &Path) -> Result<(), Error> {
        let result = if path.is_dir() {
            fs::remove_dir(path)
        } else {
            fs::remove_file(path)
        };
        result.context(format!("Failed to delete '{}'", path.display()))
    }

    fn delete_path_recursively(&self, path: &Path) -> Result<(), Error> {
        if !path.exists() {
            return Ok(());
        }
        if path.is_dir() {
            fs::remove_dir_all(path)
        } else {
            fs::remove_file(path)
        }
        .context(format!("Failed to recursively delete '{}'", path.display()))
    }

    fn list_directory(&self, path: &Path) -> Result<Vec<PathBuf>, Error> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)
            .context(format!("Failed to enumerate '{}'", path.display()))?
        {
            entries.push(entry?.path());
        }
        entries.sort();
        Ok(entries)
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<(), Error> {
        fs::copy(from, to)
            .map(|_| ())
            .context(format!(
                "Failed to copy '{}' to '{}'",
                from.display(),
                to.display()
            ))
    }

    fn rename_no_replace(&self, from: &Path, to: &Path) -> Result<(), std::io::Error> {
        files::rename_no_replace(from, to)
    }

    fn exchange(&self, a: &Path, b: &Path) -> Result<(), Error> {
        files::exchange(a, b)
    }

    fn create_sparse_file(&self, path: &Path, size: u64) -> Result<(), Error> {
        files::create_sparse_file(path, size)
    }

    fn sync_directory(&self, path: &Path) -> Result<(), Error> {
        files::sync_directory(path)
    }

    fn get_xattr(&self, path: &Path, name: &str) -> Result<Option<Vec<u8>>, Error> {
        xattr::get(path, name)
    }

    fn set_xattr(&self, path: &Path, name: &str, value: &[u8]) -> Result<(), Error> {
        xattr::set(path, name, value)
    }

    fn remove_xattr(&self, path: &Path, name: &str) -> Result<bool, Error> {
        xattr::remove(path, name)
    }

    fn mount(&self, src: &Path, dst: &Path, fstype: &str, data: &str) -> Result<(), Error> {
        mounts::mount_filesystem(src, dst, fstype, mounts::default_mount_flags(), data)
    }

    fn bind(&self, src: &Path, dst: &Path, remount: RemountOption) -> Result<(), Error> {
        mounts::bind(src, dst, remount)
    }

    fn unmount(&self, target: &Path) -> Result<(), UnmountError> {
        match mounts::unmount(target) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::EBUSY) => Err(UnmountError::Busy),
            Err(e) => Err(UnmountError::Other(Error::new(e).context(format!(
                "Failed to unmount '{}'",
                target.display()
            )))),
        }
    }

    fn lazy_unmount(&self, target: &Path) -> Result<(), Error> {
        mounts::lazy_unmount(target)
    }

    fn is_directory_mounted(&self, path: &Path) -> Result<bool, Error> {
        mounts::is_mounted(path)
    }

    fn attach_loop(&self, backing_file: &Path) -> Result<PathBuf, Error> {
        loopdev::attach(backing_file)
    }

    fn detach_loop(&self, device: &Path) -> Result<(), Error> {
        loopdev::detach(device)
    }

    fn loop_device_for(&self, backing_file: &Path) -> Result<Option<PathBuf>, Error> {
        loopdev::find_by_backing_file(backing_file)
    }

    fn get_blk_size(&self, device: &Path) -> Result<u64, Error> {
        get_block_device_size(device)
    }

    fn udev_settle(&self, device: &Path) -> Result<(), Error> {
        udevadm::settle(Some(device))
    }

    fn dm_target_version(&self, target: &str) -> Result<Option<TargetVersion>, Error> {
        devmapper::target_version(target)
    }

    fn dm_create(&self, name: &str, table: &str) -> Result<(), Error> {
        devmapper::create(name, table)
    }

    fn dm_remove(&self, name: &str, deferred: bool) -> Result<(), Error> {
        devmapper::remove(name, deferred)
    }

    fn dm_message(&self, name: &str, message: &str) -> Result<(), Error> {
        devmapper::message(name, message)
    }

    fn lv_create_thin(&self, pool: &Thinpool, name: &str, size_mib: u64) -> Result<(), Error> {
        lvm::create_thin_volume(pool, name, size_mib)
    }

    fn lv_remove(&self, volume_group: &str, name: &str) -> Result<(), Error> {
        lvm::remove_volume(volume_group, name)
    }

    fn lv_exists(&self, volume_group: &str, name: &str) -> Result<bool, Error> {
        lvm::volume_exists(volume_group, name)
    }

    fn lv_activate(&self, volume_group: &str, name: &str) -> Result<PathBuf, Error> {
        lvm::activate_volume(volume_group, name)
    }

    fn lv_deactivate(&self, volume_group: &str, name: &str) -> Result<(), Error> {
        lvm::deactivate_volume(volume_group, name)
    }

    fn format_ext4(&self, device: &Path, opts: &[String]) -> Result<(), Error> {
        mkfs::format_ext4(device, opts)
    }

    fn fsck(&self, device: &Path, option: FsckOption) -> Result<i32, Error> {
        e2fsck::run(device, option)
    }

    fn tune2fs(&self, device: &Path, opts: &[String]) -> Result<(), Error> {
        tune2fs::run(device, opts)
    }

    fn get_dir_crypto_key_state(&self, dir: &Path) -> KeyState {
        match fscrypt::get_key_state(dir) {
            Ok(state) => state,
            Err(e) => {
                error!("Failed to probe key state of '{}': {e:#}", dir.display());
                KeyState::Unknown
            }
        }
    }

    fn set_directory_policy(
        &self,
        dir: &Path,
        key_descriptor: &[u8],
        v2: bool,
    ) -> Result<(), Error> {
        if v2 {
            fscrypt::set_policy_v2(dir, key_descriptor)
        } else {
            fscrypt::set_policy_v1(dir, key_descriptor)
        }
    }

    fn statvfs_size(&self, path: &Path) -> Result<u64, Error> {
        let stat = nix::sys::statvfs::statvfs(path)
            .context(format!("Failed to statvfs '{}'", path.display()))?;
        Ok(stat.blocks() as u64 * stat.fragment_size() as u64)
    }

    fn stateful_device_size(&self) -> Result<u64, Error> {
        get_block_device_size(&self.stateful_device)
    }

    fn set_selinux_context(&self, path: &Path, context: &str) -> Result<(), Error> {
        use crate::exe::RunAndCheck;
        crate::dependencies::Dependency::Chcon
            .cmd()
            .arg(context)
            .arg(path)
            .run_and_check()
            .context(format!(
                "Failed to set SELinux context on '{}'",
                path.display()
            ))
    }
}

/// Size in bytes of a block device, falling back to the file length for
/// regular files.
pub fn get_block_device_size(device: &Path) -> Result<u64, Error> {
    let file = fs::File::open(device)
        .context(format!("Failed to open device '{}'", device.display()))?;
    let metadata = file
        .metadata()
        .context(format!("Failed to stat '{}'", device.display()))?;
    if metadata.file_type().is_file() {
        return Ok(metadata.len());
    }

    // BLKGETSIZE64.
    let request = request_code_read!(0x12, 114, mem::size_of::<u64>()) as libc::c_ulong;
    let mut size: u64 = 0;
    let ret = unsafe { libc::ioctl(file.as_raw_fd(), request, &mut size as *mut u64) };
    if ret != 0 {
        return Err(Error::new(std::io::Error::last_os_error())
            .context(format!("BLKGETSIZE64 failed for '{}'", device.display())));
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_metadata_flags() {
        let meta = FileMetadata {
            mode: libc::S_IFDIR | 0o1770,
            uid: 0,
            gid: 400,
            size: 0,
        };
        assert!(meta.is_dir());
        assert_eq!(meta.permissions(), 0o1770);

        let file = FileMetadata {
            mode: libc::S_IFREG | 0o644,
            uid: 1000,
            gid: 1000,
            size: 42,
        };
        assert!(!file.is_dir());
    }

    #[test]
    fn test_block_size_of_regular_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4096).unwrap();
        assert_eq!(get_block_device_size(file.path()).unwrap(), 4096);
    }

    #[test]
    fn test_sys_platform_file_ops() {
        let platform = SysPlatform::new("/dev/null".into());
        let dir = tempfile::TempDir::new().unwrap();

        let sub = dir.path().join("a/b");
        platform.create_directory(&sub).unwrap();
        assert!(platform.directory_exists(&sub));
        assert!(!platform.file_exists(&sub));

        let file = sub.join("f");
        fs::write(&file, "x").unwrap();
        assert!(platform.file_exists(&file));

        let st = platform.stat(&file).unwrap().unwrap();
        assert_eq!(st.size, 1);
        assert!(!st.is_dir());

        platform.delete_path_recursively(dir.path().join("a").as_path()).unwrap();
        assert!(!platform.directory_exists(&sub));
    }
}
