use std::{
    ffi::CString,
    fs,
    os::unix::ffi::OsStrExt,
    os::unix::fs::{OpenOptionsExt, PermissionsExt},
    path::Path,
};

use anyhow::{bail, Context, Error};
use nix::sys::stat::{stat, FileStat, SFlag};
use nix::unistd::{chown, Gid, Uid};

/// Creates a directory (and missing parents).
pub fn create_dirs(path: impl AsRef<Path>) -> Result<(), Error> {
    fs::create_dir_all(path.as_ref()).context(format!(
        "Failed to create directory '{}'",
        path.as_ref().display()
    ))
}

/// Creates a single directory and applies the given mode and ownership.
/// Fails if the path already exists as anything but a directory.
pub fn create_dir_with_owner(
    path: impl AsRef<Path>,
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<(), Error> {
    let path = path.as_ref();
    if !path.is_dir() {
        if path.exists() {
            bail!("Path '{}' exists and is not a directory", path.display());
        }
        fs::create_dir(path).context(format!("Failed to create '{}'", path.display()))?;
    }
    set_owner_and_mode(path, mode, uid, gid)
}

/// Applies mode and ownership to an existing path.
pub fn set_owner_and_mode(
    path: impl AsRef<Path>,
    mode: u32,
    uid: u32,
    gid: u32,
) -> Result<(), Error> {
    let path = path.as_ref();
    chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
        .context(format!("Failed to chown '{}'", path.display()))?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .context(format!("Failed to chmod '{}'", path.display()))
}

/// Stat that distinguishes "absent" from real errors.
pub fn maybe_stat(path: impl AsRef<Path>) -> Result<Option<FileStat>, Error> {
    match stat(path.as_ref()) {
        Ok(st) => Ok(Some(st)),
        Err(nix::errno::Errno::ENOENT) => Ok(None),
        Err(e) => Err(Error::new(e).context(format!(
            "Failed to stat '{}'",
            path.as_ref().display()
        ))),
    }
}

/// True if the stat result describes a directory.
pub fn is_dir(st: &FileStat) -> bool {
    SFlag::from_bits_truncate(st.st_mode).contains(SFlag::S_IFDIR)
}

/// Creates a sparse file of the requested size with mode 0600.
pub fn create_sparse_file(path: impl AsRef<Path>, size: u64) -> Result<(), Error> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        create_dirs(parent)?;
    }
    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .context(format!("Failed to create '{}'", path.display()))?;
    file.set_len(size)
        .context(format!("Failed to size '{}'", path.display()))
}

/// Fsyncs a directory so preceding renames inside it are durable.
pub fn sync_directory(path: impl AsRef<Path>) -> Result<(), Error> {
    let dir = fs::File::open(path.as_ref()).context(format!(
        "Failed to open directory '{}'",
        path.as_ref().display()
    ))?;
    dir.sync_all().context(format!(
        "Failed to sync directory '{}'",
        path.as_ref().display()
    ))
}

fn to_cstring(path: &Path) -> Result<CString, Error> {
    CString::new(path.as_os_str().as_bytes())
        .context(format!("Path '{}' contains a NUL byte", path.display()))
}

fn renameat2(from: &Path, to: &Path, flags: libc::c_uint) -> Result<(), std::io::Error> {
    let invalid = |e| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{e:#}"));
    let from = to_cstring(from).map_err(invalid)?;
    let to = to_cstring(to).map_err(invalid)?;
    // renameat2 has no libc wrapper on all supported toolchains.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            libc::AT_FDCWD,
            from.as_ptr(),
            libc::AT_FDCWD,
            to.as_ptr(),
            flags,
        )
    };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Renames without clobbering the destination. Returns the raw
/// `io::Error` so callers can distinguish `EEXIST` collisions.
pub fn rename_no_replace(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<(), std::io::Error> {
    renameat2(from.as_ref(), to.as_ref(), libc::RENAME_NOREPLACE as libc::c_uint)
}

/// Atomically swaps two paths. Both must exist.
pub fn exchange(a: impl AsRef<Path>, b: impl AsRef<Path>) -> Result<(), Error> {
    renameat2(a.as_ref(), b.as_ref(), libc::RENAME_EXCHANGE as libc::c_uint).context(format!(
        "Failed to exchange '{}' and '{}'",
        a.as_ref().display(),
        b.as_ref().display()
    ))
}
