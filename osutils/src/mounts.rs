use std::{fs, path::Path, path::PathBuf};

use anyhow::{Context, Error};
use nix::mount::{mount, umount, umount2, MntFlags, MsFlags};

/// Flags applied to every filesystem mount performed by the storage core.
pub fn default_mount_flags() -> MsFlags {
    MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID
}

/// Propagation mode applied to a fresh bind mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemountOption {
    NoRemount,
    Private,
    /// Mount events on this mount propagate to its peers.
    Shared,
    /// Mount events flow into this mount from its peers, not back out.
    MountsFlowIn,
    Unbindable,
}

/// Mounts a filesystem of the given type.
pub fn mount_filesystem(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    fstype: &str,
    flags: MsFlags,
    data: &str,
) -> Result<(), Error> {
    mount(
        Some(src.as_ref()),
        dst.as_ref(),
        Some(fstype),
        flags,
        if data.is_empty() { None } else { Some(data) },
    )
    .context(format!(
        "Failed to mount '{}' -> '{}' as {}",
        src.as_ref().display(),
        dst.as_ref().display(),
        fstype
    ))
}

/// Bind-mounts `src` onto `dst` and applies the requested propagation mode.
pub fn bind(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    remount: RemountOption,
) -> Result<(), Error> {
    mount(
        Some(src.as_ref()),
        dst.as_ref(),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .context(format!(
        "Failed to bind '{}' -> '{}'",
        src.as_ref().display(),
        dst.as_ref().display()
    ))?;

    let propagation = match remount {
        RemountOption::NoRemount => return Ok(()),
        RemountOption::Private => MsFlags::MS_PRIVATE,
        RemountOption::Shared => MsFlags::MS_SHARED,
        RemountOption::MountsFlowIn => MsFlags::MS_SLAVE,
        RemountOption::Unbindable => MsFlags::MS_UNBINDABLE,
    };
    mount(
        None::<&str>,
        dst.as_ref(),
        None::<&str>,
        propagation,
        None::<&str>,
    )
    .context(format!(
        "Failed to change propagation of '{}'",
        dst.as_ref().display()
    ))
}

/// Eager unmount. The caller decides how to react to `EBUSY`.
pub fn unmount(target: impl AsRef<Path>) -> Result<(), nix::errno::Errno> {
    umount(target.as_ref())
}

/// Detaches the mount immediately and cleans up references lazily.
pub fn lazy_unmount(target: impl AsRef<Path>) -> Result<(), Error> {
    umount2(target.as_ref(), MntFlags::MNT_DETACH).context(format!(
        "Failed to lazily unmount '{}'",
        target.as_ref().display()
    ))
}

/// True if `path` is a mount point according to /proc/self/mounts.
pub fn is_mounted(path: impl AsRef<Path>) -> Result<bool, Error> {
    let target = path.as_ref();
    Ok(mounted_targets()?.iter().any(|t| t == target))
}

/// All mount targets currently visible to this process.
pub fn mounted_targets() -> Result<Vec<PathBuf>, Error> {
    let mounts =
        fs::read_to_string("/proc/self/mounts").context("Failed to read /proc/self/mounts")?;
    Ok(mounts
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(decode_mount_path)
        .map(PathBuf::from)
        .collect())
}

// /proc/mounts octal-escapes spaces, tabs, newlines and backslashes.
fn decode_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let digits: String = chars.by_ref().take(3).collect();
        match u8::from_str_radix(&digits, 8) {
            Ok(byte) => out.push(byte as char),
            Err(_) => {
                out.push('\\');
                out.push_str(&digits);
            }
        }
    }
    out
}
