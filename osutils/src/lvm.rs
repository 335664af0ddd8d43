use std::path::{Path, PathBuf};

use anyhow::{Context, Error};

use crate::{dependencies::Dependency, exe::RunAndCheck};

/// A preconfigured volume group with a thin pool, required for
/// logical-volume backed storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thinpool {
    pub volume_group: String,
    pub thinpool: String,
}

/// Creates a thin logical volume of `size_mib` inside the pool.
pub fn create_thin_volume(pool: &Thinpool, name: &str, size_mib: u64) -> Result<(), Error> {
    Dependency::Lvcreate
        .cmd()
        .arg("--thin")
        .arg("--virtualsize")
        .arg(format!("{size_mib}M"))
        .arg("--name")
        .arg(name)
        .arg(format!("{}/{}", pool.volume_group, pool.thinpool))
        .run_and_check()
        .context(format!("Failed to create thin logical volume '{name}'"))
}

/// Removes a logical volume and its backing thin allocation.
pub fn remove_volume(volume_group: &str, name: &str) -> Result<(), Error> {
    Dependency::Lvremove
        .cmd()
        .arg("--force")
        .arg(format!("{volume_group}/{name}"))
        .run_and_check()
        .context(format!("Failed to remove logical volume '{name}'"))
}

/// True if the named logical volume exists in the volume group.
pub fn volume_exists(volume_group: &str, name: &str) -> Result<bool, Error> {
    let output = Dependency::Lvs
        .cmd()
        .arg("--noheadings")
        .arg("--options")
        .arg("lv_name")
        .arg(volume_group)
        .output();

    // A missing volume group reports an error; treat it as "no volumes".
    let Ok(output) = output else {
        return Ok(false);
    };
    if !output.status.success() {
        return Ok(false);
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .any(|line| line.trim() == name))
}

/// Activates a logical volume and returns its device node.
pub fn activate_volume(volume_group: &str, name: &str) -> Result<PathBuf, Error> {
    Dependency::Lvchange
        .cmd()
        .arg("--activate")
        .arg("y")
        .arg(format!("{volume_group}/{name}"))
        .run_and_check()
        .context(format!("Failed to activate logical volume '{name}'"))?;

    Ok(device_path(volume_group, name))
}

/// Deactivates a logical volume.
pub fn deactivate_volume(volume_group: &str, name: &str) -> Result<(), Error> {
    Dependency::Lvchange
        .cmd()
        .arg("--activate")
        .arg("n")
        .arg(format!("{volume_group}/{name}"))
        .run_and_check()
        .context(format!("Failed to deactivate logical volume '{name}'"))
}

/// Device node of an active logical volume.
pub fn device_path(volume_group: &str, name: &str) -> PathBuf {
    // lvm exposes nodes as /dev/<vg>/<lv>, with dashes escaped in the
    // mapper name; the per-vg directory form avoids the escaping rules.
    Path::new("/dev").join(volume_group).join(name)
}
