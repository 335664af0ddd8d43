use std::path::Path;

use anyhow::{Context, Error};
use log::trace;

use crate::{dependencies::Dependency, exe::OutputChecker};

/// Bits of the e2fsck exit code.
pub const FSCK_SUCCESS: i32 = 0;
pub const FSCK_ERRORS_CORRECTED: i32 = 1 << 0;
pub const FSCK_SYSTEM_SHOULD_REBOOT: i32 = 1 << 1;
pub const FSCK_ERRORS_LEFT_UNCORRECTED: i32 = 1 << 2;

/// How aggressively to check the filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsckOption {
    /// `-p`: automatic repair of safe problems only.
    Preen,
    /// `-f -y`: full check, answering yes to every repair.
    Full,
}

/// Runs e2fsck on `device_path`. Returns the raw exit-code bit set; callers
/// inspect it for `FSCK_ERRORS_LEFT_UNCORRECTED`.
pub fn run(device_path: impl AsRef<Path>, option: FsckOption) -> Result<i32, Error> {
    let mut cmd = Dependency::E2fsck.cmd();
    match option {
        FsckOption::Preen => cmd.arg("-p"),
        FsckOption::Full => cmd.arg("-f").arg("-y"),
    };

    let output = cmd
        .arg(device_path.as_ref())
        .output()
        .context("Failed to execute e2fsck")?;
    let code = output.exit_code().unwrap_or(FSCK_ERRORS_LEFT_UNCORRECTED);
    trace!(
        "e2fsck of '{}' returned {code}: {}",
        device_path.as_ref().display(),
        output.output_report()
    );
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fsck_bits() {
        assert_eq!(FSCK_ERRORS_CORRECTED, 1);
        assert_eq!(FSCK_ERRORS_LEFT_UNCORRECTED, 4);
    }

    #[test]
    fn test_missing_device_reports_uncorrected() {
        // Environments without e2fsprogs report the spawn failure instead.
        let Ok(code) = run("/dev/nonexistent-device-1234", FsckOption::Preen) else {
            return;
        };
        assert_ne!(code & !FSCK_ERRORS_CORRECTED, FSCK_SUCCESS);
    }
}
