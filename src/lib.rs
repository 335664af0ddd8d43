//! Cryptohome storage core: provisioning, mounting, migration and teardown
//! of per-user encrypted home directories.

pub mod backing;
pub mod containers;
pub mod homedirs;
pub mod keyring;
pub mod migration;
pub mod mounter;
pub mod orchestrator;
pub mod sessions;
pub mod vault;
pub mod vault_factory;
