use std::process::Command;

use strum_macros::IntoStaticStr;

/// External tools invoked by the storage core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum Dependency {
    Chcon,
    Dmsetup,
    E2fsck,
    Losetup,
    Lvchange,
    Lvcreate,
    Lvremove,
    Lvs,
    #[strum(serialize = "mkfs.ext4")]
    MkfsExt4,
    Tune2fs,
    Udevadm,
}

impl Dependency {
    /// The binary name, resolved through PATH at execution time.
    pub fn name(&self) -> &'static str {
        self.into()
    }

    /// A new [`Command`] for this tool.
    pub fn cmd(&self) -> Command {
        Command::new(self.name())
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_binary_names() {
        assert_eq!(Dependency::MkfsExt4.name(), "mkfs.ext4");
        assert_eq!(Dependency::Dmsetup.name(), "dmsetup");
        assert_eq!(Dependency::Udevadm.name(), "udevadm");
        assert_eq!(Dependency::Lvcreate.name(), "lvcreate");
    }
}
