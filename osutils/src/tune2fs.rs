use std::path::Path;

use anyhow::{Context, Error};

use crate::{dependencies::Dependency, exe::RunAndCheck};

/// Applies tune2fs options to the filesystem on `device_path`.
pub fn run(device_path: impl AsRef<Path>, opts: &[String]) -> Result<(), Error> {
    Dependency::Tune2fs
        .cmd()
        .args(opts)
        .arg(device_path.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to tune filesystem on '{}'",
            device_path.as_ref().display()
        ))
}
