//! Polymorphic storage containers backing a user's encrypted home.

mod dmcrypt;
mod ecryptfs;
mod ephemeral;
mod ext4;
mod fscrypt;
mod migrating;

use std::path::PathBuf;

use anyhow::{bail, Error};

use storage_api::config::StorageContainerType;
use storage_api::keys::FileSystemKey;

pub use dmcrypt::DmcryptContainer;
pub use ecryptfs::EcryptfsContainer;
pub use ephemeral::EphemeralContainer;
pub use ext4::Ext4Container;
pub use fscrypt::FscryptContainer;
pub use migrating::MigratingContainer;

/// One encryption/storage layer of a vault.
///
/// `setup` must be atomic on failure: any partially created resource is
/// rolled back before the error is returned. `teardown` is best-effort and
/// releases as much as it can even when a step fails.
pub trait StorageContainer {
    /// True iff persistent state exists on disk. Side-effect free.
    fn exists(&self) -> bool;

    /// Makes the container's content accessible at `get_backing_location`.
    /// Creates a fresh filesystem when no persistent state existed.
    fn setup(&mut self, key: &FileSystemKey) -> Result<(), Error>;

    /// Reverses `setup`.
    fn teardown(&mut self) -> Result<(), Error>;

    /// Makes the data unreadable without a full teardown.
    fn evict_key(&mut self) -> Result<(), Error> {
        bail!("{:?} containers do not support key eviction", self.get_type())
    }

    /// Rebinds an evicted key without a full setup.
    fn restore_key(&mut self, _key: &FileSystemKey) -> Result<(), Error> {
        bail!("{:?} containers do not support key restore", self.get_type())
    }

    /// Discards the content of a disposable filesystem.
    fn reset(&mut self) -> Result<(), Error> {
        bail!("{:?} containers do not support reset", self.get_type())
    }

    /// Deletes all persistent state. The container must be torn down first;
    /// implementations tear down stale resources themselves where needed.
    fn purge(&mut self) -> Result<(), Error>;

    /// Schedules deferred release of the container's devices once the last
    /// user is gone.
    fn set_lazy_teardown_when_unused(&mut self) -> Result<(), Error> {
        bail!("{:?} containers do not support lazy teardown", self.get_type())
    }

    fn get_type(&self) -> StorageContainerType;

    fn get_backing_location(&self) -> PathBuf;
}

/// Runs a rollback action on drop unless dismissed.
pub(crate) struct ScopeGuard<'f> {
    action: Option<Box<dyn FnOnce() + 'f>>,
}

impl<'f> ScopeGuard<'f> {
    pub fn new(action: impl FnOnce() + 'f) -> Self {
        Self {
            action: Some(Box::new(action)),
        }
    }

    /// The protected operation succeeded; keep its resources.
    pub fn dismiss(mut self) {
        self.action = None;
    }
}

impl Drop for ScopeGuard<'_> {
    fn drop(&mut self) {
        if let Some(action) = self.action.take() {
            action();
        }
    }
}
