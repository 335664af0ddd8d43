use std::path::PathBuf;

use anyhow::{bail, Context, Error};
use log::warn;

use osutils::fscrypt::{KeyState, KEY_DESCRIPTOR_SIZE};
use osutils::platform::Platform;
use storage_api::config::StorageContainerType;
use storage_api::keys::{FileSystemKey, FileSystemKeyReference};

use crate::keyring::{remove_key_logged, KeyType, Keyring};

use super::{ScopeGuard, StorageContainer};

/// Per-directory encryption via an fscrypt policy on the mount directory.
pub struct FscryptContainer<'a> {
    backing_dir: PathBuf,
    key_reference: FileSystemKeyReference,
    use_v2: bool,
    platform: &'a dyn Platform,
    keyring: &'a dyn Keyring,
}

impl<'a> FscryptContainer<'a> {
    pub fn new(
        backing_dir: PathBuf,
        key_reference: FileSystemKeyReference,
        use_v2: bool,
        platform: &'a dyn Platform,
        keyring: &'a dyn Keyring,
    ) -> Self {
        Self {
            backing_dir,
            key_reference,
            use_v2,
            platform,
            keyring,
        }
    }

    fn key_type(&self) -> KeyType {
        if self.use_v2 {
            KeyType::FscryptV2
        } else {
            KeyType::FscryptV1
        }
    }

    fn policy_descriptor(&self) -> Vec<u8> {
        if self.use_v2 {
            self.key_reference.fek_sig.clone()
        } else {
            // v1 policies address keys by the leading 8 signature bytes.
            self.key_reference.fek_sig[..self.key_reference.fek_sig.len().min(KEY_DESCRIPTOR_SIZE)]
                .to_vec()
        }
    }
}

impl StorageContainer for FscryptContainer<'_> {
    fn exists(&self) -> bool {
        self.platform.directory_exists(&self.backing_dir)
            && self.platform.get_dir_crypto_key_state(&self.backing_dir) == KeyState::Encrypted
    }

    fn setup(&mut self, key: &FileSystemKey) -> Result<(), Error> {
        if !self.platform.directory_exists(&self.backing_dir) {
            self.platform
                .create_directory(&self.backing_dir)
                .context("Failed to create fscrypt mount directory")?;
        }

        match self.platform.get_dir_crypto_key_state(&self.backing_dir) {
            KeyState::NotSupported => bail!(
                "Filesystem of '{}' does not support fscrypt",
                self.backing_dir.display()
            ),
            KeyState::Unknown => bail!(
                "Directory '{}' has inconsistent fscrypt state",
                self.backing_dir.display()
            ),
            KeyState::NoKey | KeyState::Encrypted => {}
        }

        self.keyring
            .add_key(self.key_type(), key, &mut self.key_reference)?;

        let keyring = self.keyring;
        let key_type = self.key_type();
        let reference = self.key_reference.clone();
        let guard = ScopeGuard::new(move || {
            remove_key_logged(keyring, key_type, &reference);
        });

        self.platform
            .set_directory_policy(&self.backing_dir, &self.policy_descriptor(), self.use_v2)
            .context("Failed to attach fscrypt policy")?;

        guard.dismiss();
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), Error> {
        self.keyring
            .remove_key(self.key_type(), &self.key_reference)
    }

    fn purge(&mut self) -> Result<(), Error> {
        self.platform.delete_path_recursively(&self.backing_dir)
    }

    fn set_lazy_teardown_when_unused(&mut self) -> Result<(), Error> {
        warn!("fscrypt containers release keys only on teardown");
        bail!("fscrypt containers do not support lazy teardown")
    }

    fn get_type(&self) -> StorageContainerType {
        StorageContainerType::Fscrypt
    }

    fn get_backing_location(&self) -> PathBuf {
        self.backing_dir.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::Path;

    use osutils::testutils::FakePlatform;

    use crate::keyring::testing::FakeKeyring;

    fn reference() -> FileSystemKeyReference {
        FileSystemKeyReference {
            fek_sig: vec![0xcd; 16],
            fnek_sig: vec![],
        }
    }

    fn container<'a>(
        platform: &'a FakePlatform,
        keyring: &'a FakeKeyring,
        v2: bool,
    ) -> FscryptContainer<'a> {
        FscryptContainer::new(
            "/home/.shadow/u/mount".into(),
            reference(),
            v2,
            platform,
            keyring,
        )
    }

    #[test]
    fn setup_attaches_policy() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        let mut fscrypt = container(&platform, &keyring, false);

        assert!(!fscrypt.exists());
        fscrypt.setup(&FileSystemKey::default()).unwrap();
        assert!(fscrypt.exists());
        assert_eq!(
            platform.get_dir_crypto_key_state(Path::new("/home/.shadow/u/mount")),
            KeyState::Encrypted
        );
    }

    #[test]
    fn v2_setup_uses_rewritten_reference() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        let mut fscrypt = container(&platform, &keyring, true);

        fscrypt.setup(&FileSystemKey::default()).unwrap();
        // The fake kernel rewrote the signature to its own identifier.
        assert_eq!(fscrypt.key_reference.fek_sig, vec![0xf2; 16]);

        fscrypt.teardown().unwrap();
        assert_eq!(keyring.installed_count(), 0);
    }

    #[test]
    fn unsupported_filesystem_fails_setup() {
        let platform = FakePlatform::new();
        platform.set_default_key_state(KeyState::NotSupported);
        let keyring = FakeKeyring::new();
        let mut fscrypt = container(&platform, &keyring, false);

        fscrypt.setup(&FileSystemKey::default()).unwrap_err();
        assert_eq!(keyring.installed_count(), 0);
    }

    #[test]
    fn inconsistent_state_fails_setup() {
        let platform = FakePlatform::new();
        platform.set_key_state(Path::new("/home/.shadow/u/mount"), KeyState::Unknown);
        let keyring = FakeKeyring::new();
        let mut fscrypt = container(&platform, &keyring, false);

        fscrypt.setup(&FileSystemKey::default()).unwrap_err();
    }
}
