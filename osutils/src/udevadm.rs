use std::path::Path;

use anyhow::{Context, Error};

use crate::{dependencies::Dependency, exe::RunAndCheck};

/// Waits for udev to process pending events. When `exists_path` is given,
/// settling stops early once that device node has appeared.
pub fn settle(exists_path: Option<&Path>) -> Result<(), Error> {
    let mut cmd = Dependency::Udevadm.cmd();
    cmd.arg("settle");
    if let Some(path) = exists_path {
        cmd.arg(format!("--exit-if-exists={}", path.display()));
    }
    cmd.run_and_check().context("udevadm settle failed")
}
