use std::path::PathBuf;

use anyhow::{Context, Error};

use osutils::platform::Platform;
use storage_api::config::StorageContainerType;
use storage_api::keys::{FileSystemKey, FileSystemKeyReference};

use crate::keyring::{KeyType, Keyring};

use super::StorageContainer;

/// Filename-encrypting overlay. The backing is a plain directory; the
/// kernel mount over it is performed by the mounter, parameterized by the
/// key signatures provisioned here.
pub struct EcryptfsContainer<'a> {
    backing_dir: PathBuf,
    key_reference: FileSystemKeyReference,
    platform: &'a dyn Platform,
    keyring: &'a dyn Keyring,
}

impl<'a> EcryptfsContainer<'a> {
    pub fn new(
        backing_dir: PathBuf,
        key_reference: FileSystemKeyReference,
        platform: &'a dyn Platform,
        keyring: &'a dyn Keyring,
    ) -> Self {
        Self {
            backing_dir,
            key_reference,
            platform,
            keyring,
        }
    }
}

impl StorageContainer for EcryptfsContainer<'_> {
    fn exists(&self) -> bool {
        self.platform.directory_exists(&self.backing_dir)
    }

    fn setup(&mut self, key: &FileSystemKey) -> Result<(), Error> {
        if !self.platform.directory_exists(&self.backing_dir) {
            self.platform
                .create_directory(&self.backing_dir)
                .context("Failed to create eCryptfs backing directory")?;
        }
        self.keyring
            .add_key(KeyType::Ecryptfs, key, &mut self.key_reference)
    }

    fn teardown(&mut self) -> Result<(), Error> {
        self.keyring
            .remove_key(KeyType::Ecryptfs, &self.key_reference)
    }

    fn purge(&mut self) -> Result<(), Error> {
        self.platform.delete_path_recursively(&self.backing_dir)
    }

    fn get_type(&self) -> StorageContainerType {
        StorageContainerType::Ecryptfs
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
            fek_sig: vec![0xaa; 8],
            fnek_sig: vec![0xbb; 8],
        }
    }

    #[test]
    fn setup_creates_directory_and_provisions_key() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        let mut container = EcryptfsContainer::new(
            "/home/.shadow/u/vault".into(),
            reference(),
            &platform,
            &keyring,
        );

        assert!(!container.exists());
        container.setup(&FileSystemKey::default()).unwrap();
        assert!(container.exists());
        assert_eq!(keyring.installed_count(), 1);

        container.teardown().unwrap();
        assert_eq!(keyring.installed_count(), 0);
        // Teardown leaves the vault directory in place.
        assert!(container.exists());
    }

    #[test]
    fn purge_removes_the_vault_directory() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        let mut container = EcryptfsContainer::new(
            "/home/.shadow/u/vault".into(),
            reference(),
            &platform,
            &keyring,
        );

        container.setup(&FileSystemKey::default()).unwrap();
        platform
            .create_directory(Path::new("/home/.shadow/u/vault/user"))
            .unwrap();
        container.purge().unwrap();
        assert!(!container.exists());
    }

    #[test]
    fn unsupported_operations() {
        let platform = FakePlatform::new();
        let keyring = FakeKeyring::new();
        let mut container = EcryptfsContainer::new(
            "/home/.shadow/u/vault".into(),
            reference(),
            &platform,
            &keyring,
        );
        container.evict_key().unwrap_err();
        container.reset().unwrap_err();
        container.set_lazy_teardown_when_unused().unwrap_err();
    }
}
