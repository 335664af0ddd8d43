use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Error};

use crate::{dependencies::Dependency, exe::RunAndCheck};

/// Attaches `backing_file` to a free loop device and returns its path.
pub fn attach(backing_file: impl AsRef<Path>) -> Result<PathBuf, Error> {
    let output = Dependency::Losetup
        .cmd()
        .arg("--find")
        .arg("--show")
        .arg(backing_file.as_ref())
        .output_and_check()
        .context(format!(
            "Failed to attach loop device for '{}'",
            backing_file.as_ref().display()
        ))?;

    let device = output.trim();
    if device.is_empty() {
        bail!(
            "losetup reported no device for '{}'",
            backing_file.as_ref().display()
        );
    }
    Ok(PathBuf::from(device))
}

/// Detaches the loop device at `device_path`.
pub fn detach(device_path: impl AsRef<Path>) -> Result<(), Error> {
    Dependency::Losetup
        .cmd()
        .arg("--detach")
        .arg(device_path.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to detach loop device '{}'",
            device_path.as_ref().display()
        ))
}

/// Finds the loop device currently attached to `backing_file`, if any.
pub fn find_by_backing_file(backing_file: impl AsRef<Path>) -> Result<Option<PathBuf>, Error> {
    let output = Dependency::Losetup
        .cmd()
        .arg("--associated")
        .arg(backing_file.as_ref())
        .output_and_check()
        .context(format!(
            "Failed to query loop devices for '{}'",
            backing_file.as_ref().display()
        ))?;

    // Output lines look like `/dev/loop3: [2049]:131 (/path/to/file)`.
    Ok(output
        .lines()
        .next()
        .and_then(|line| line.split(':').next())
        .map(str::trim)
        .filter(|device| !device.is_empty())
        .map(PathBuf::from))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_by_backing_file_absent() {
        // A file that was never attached yields no device. Environments
        // without util-linux report the spawn failure instead.
        let file = tempfile::NamedTempFile::new().unwrap();
        if let Ok(device) = find_by_backing_file(file.path()) {
            assert_eq!(device, None);
        }
    }
}
