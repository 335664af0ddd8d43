use std::path::Path;

use anyhow::{bail, Context, Error};

use crate::{dependencies::Dependency, exe::RunAndCheck, files};

/// Formats `device_path` as ext4 with the given extra options.
///
/// Formatting a zero-sized backing is refused up front; mke2fs would
/// otherwise fail with a much less useful diagnostic.
pub fn format_ext4(device_path: impl AsRef<Path>, opts: &[String]) -> Result<(), Error> {
    let device_path = device_path.as_ref();
    if let Some(st) = files::maybe_stat(device_path)? {
        if st.st_size == 0 && !files::is_dir(&st) && st.st_rdev == 0 {
            bail!(
                "Refusing to format zero-sized backing file '{}'",
                device_path.display()
            );
        }
    }

    Dependency::MkfsExt4
        .cmd()
        .args(opts)
        .arg(device_path)
        .run_and_check()
        .context(format!("Failed to format '{}'", device_path.display()))
}
