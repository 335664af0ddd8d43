use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};
use log::warn;

use crate::{dependencies::Dependency, exe::RunAndCheck};

/// Version of a device-mapper target as reported by `dmsetup targets`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TargetVersion(pub u32, pub u32, pub u32);

/// Returns the version of the named device-mapper target, or `None` if the
/// target is not registered.
pub fn target_version(target: &str) -> Result<Option<TargetVersion>, Error> {
    let output = Dependency::Dmsetup
        .cmd()
        .arg("targets")
        .output_and_check()
        .context("Failed to list device-mapper targets")?;

    for line in output.lines() {
        let mut fields = line.split_whitespace();
        let (Some(name), Some(version)) = (fields.next(), fields.next()) else {
            continue;
        };
        if name != target {
            continue;
        }
        return Ok(parse_version(version));
    }
    Ok(None)
}

fn parse_version(version: &str) -> Option<TargetVersion> {
    let mut parts = version.trim_start_matches('v').splitn(3, '.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next()?.parse().ok()?;
    Some(TargetVersion(major, minor, patch))
}

/// Creates a device-mapper device from a single-line table.
///
/// The table is passed on stdin so key material never shows up in the
/// process list.
pub fn create(name: &str, table: &str) -> Result<(), Error> {
    use std::io::Write;
    use std::process::Stdio;

    let mut child = Dependency::Dmsetup
        .cmd()
        .arg("create")
        .arg(name)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to spawn dmsetup")?;

    child
        .stdin
        .take()
        .context("dmsetup stdin unavailable")?
        .write_all(table.as_bytes())
        .context("Failed to write device-mapper table")?;

    let output = child
        .wait_with_output()
        .context("Failed to wait for dmsetup")?;
    if !output.status.success() {
        bail!(
            "dmsetup create '{}' failed: {}",
            name,
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

/// Sends a target message to sector 0 of a device-mapper device, e.g.
/// `key wipe` for dm-crypt key eviction.
pub fn message(name: &str, message: &str) -> Result<(), Error> {
    Dependency::Dmsetup
        .cmd()
        .arg("message")
        .arg(name)
        .arg("0")
        .arg(message)
        .run_and_check()
        .context(format!("Failed to message device-mapper device '{name}'"))
}

/// Removes a device-mapper device. With `deferred`, removal happens once
/// the last holder closes the device.
pub fn remove(name: &str, deferred: bool) -> Result<(), Error> {
    let mut cmd = Dependency::Dmsetup.cmd();
    cmd.arg("remove");
    if deferred {
        cmd.arg("--deferred");
    }
    cmd.arg(name)
        .run_and_check()
        .context(format!("Failed to remove device-mapper device '{name}'"))
}

/// Path of a device-mapper device node.
pub fn device_path(name: &str) -> PathBuf {
    Path::new("/dev/mapper").join(name)
}

/// True if the device node exists.
pub fn device_exists(name: &str) -> bool {
    device_path(name).exists()
}

/// Best-effort removal used on teardown paths.
pub fn remove_logged(name: &str) -> bool {
    match remove(name, false) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to remove device-mapper device '{name}': {e:#}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("v1.15.0"), Some(TargetVersion(1, 15, 0)));
        assert_eq!(parse_version("1.2.3"), Some(TargetVersion(1, 2, 3)));
        assert_eq!(parse_version("bogus"), None);
    }

    #[test]
    fn test_version_ordering() {
        assert!(TargetVersion(1, 15, 0) > TargetVersion(1, 14, 9));
        assert!(TargetVersion(2, 0, 0) > TargetVersion(1, 15, 0));
        assert!(TargetVersion(1, 15, 0) >= TargetVersion(1, 15, 0));
    }

    #[test]
    fn test_device_path() {
        assert_eq!(
            device_path("dmcrypt-0123-data"),
            Path::new("/dev/mapper/dmcrypt-0123-data")
        );
    }
}
