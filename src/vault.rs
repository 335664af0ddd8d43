//! A user's collection of active encrypted containers.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Error};
use log::{error, warn};
use strum_macros::Display;

use storage_api::config::StorageContainerType;
use storage_api::error::{MountError, StorageError, StorageResult, StorageResultExt};
use storage_api::keys::FileSystemKey;
use storage_api::users::ObfuscatedUsername;

use crate::containers::StorageContainer;

/// Coarse mount recipe selector derived from the vault's container types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum MountType {
    Ecryptfs,
    Dircrypto,
    Dmcrypt,
    Ephemeral,
    EcryptfsToFscrypt,
    EcryptfsToDmcrypt,
    FscryptToDmcrypt,
}

impl MountType {
    pub fn is_migrating(self) -> bool {
        matches!(
            self,
            Self::EcryptfsToFscrypt | Self::EcryptfsToDmcrypt | Self::FscryptToDmcrypt
        )
    }
}

/// The user's active encrypted containers: one primary (which for a
/// migration in progress is the source/destination composite), an optional
/// cache container for dm-crypt vaults, and per-application containers.
pub struct CryptohomeVault<'a> {
    user: ObfuscatedUsername,
    primary: Box<dyn StorageContainer + 'a>,
    cache: Option<Box<dyn StorageContainer + 'a>>,
    apps: HashMap<String, Box<dyn StorageContainer + 'a>>,
}

impl std::fmt::Debug for CryptohomeVault<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptohomeVault")
            .field("user", &self.user)
            .field("primary", &self.primary.get_type())
            .field("cache", &self.cache.as_ref().map(|c| c.get_type()))
            .field("apps", &self.apps.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn supports_key_eviction(container_type: StorageContainerType) -> bool {
    matches!(
        container_type,
        StorageContainerType::Dmcrypt | StorageContainerType::Ext4
    )
}

impl<'a> CryptohomeVault<'a> {
    pub fn new(
        user: ObfuscatedUsername,
        primary: Box<dyn StorageContainer + 'a>,
        cache: Option<Box<dyn StorageContainer + 'a>>,
        apps: HashMap<String, Box<dyn StorageContainer + 'a>>,
    ) -> Self {
        Self {
            user,
            primary,
            cache,
            apps,
        }
    }

    pub fn user(&self) -> &ObfuscatedUsername {
        &self.user
    }

    pub fn get_container_type(&self) -> StorageContainerType {
        self.primary.get_type()
    }

    pub fn get_container_backing_location(&self) -> PathBuf {
        self.primary.get_backing_location()
    }

    /// Sets up every container, in order: primary (source before
    /// destination for a migrating vault), cache, applications. Already
    /// set-up containers are torn down in reverse when a later one fails.
    pub fn setup(&mut self, key: &FileSystemKey) -> StorageResult<()> {
        self.primary.setup(key).or_kind(
            MountError::CreateCryptohomeFailed,
            format!("Failed to set up primary container for {}", self.user),
        )?;

        if let Some(cache) = self.cache.as_mut() {
            if let Err(e) = cache.setup(key) {
                if let Err(primary_err) = self.primary.teardown() {
                    error!("Failed to tear down primary container: {primary_err:#}");
                }
                return Err(StorageError::with_source(
                    MountError::CreateCryptohomeFailed,
                    format!("Failed to set up cache container for {}", self.user),
                    e,
                ));
            }
        }

        let mut names: Vec<String> = self.apps.keys().cloned().collect();
        names.sort();
        let mut ready: Vec<String> = Vec::new();
        for name in names {
            let result = self
                .apps
                .get_mut(&name)
                .expect("app vanished during setup")
                .setup(key);
            if let Err(e) = result {
                for done in &ready {
                    let container = self.apps.get_mut(done).expect("app vanished during setup");
                    if let Err(app_err) = container.teardown() {
                        error!("Failed to tear down app container '{done}': {app_err:#}");
                    }
                }
                if let Some(cache) = self.cache.as_mut() {
                    if let Err(cache_err) = cache.teardown() {
                        error!("Failed to tear down cache container: {cache_err:#}");
                    }
                }
                if let Err(primary_err) = self.primary.teardown() {
                    error!("Failed to tear down primary container: {primary_err:#}");
                }
                return Err(StorageError::with_source(
                    MountError::CreateCryptohomeFailed,
                    format!("Failed to set up app container '{name}' for {}", self.user),
                    e,
                ));
            }
            ready.push(name);
        }

        Ok(())
    }

    /// Tears down every present container. Individual failures are logged
    /// and do not stop the remaining teardowns; the first failure wins.
    pub fn teardown(&mut self) -> Result<(), Error> {
        let mut first_error: Option<Error> = None;

        for (name, app) in self.apps.iter_mut() {
            if let Err(e) = app.teardown() {
                error!("Failed to tear down app container '{name}': {e:#}");
                first_error.get_or_insert(e);
            }
        }
        if let Some(cache) = self.cache.as_mut() {
            if let Err(e) = cache.teardown() {
                error!("Failed to tear down cache container: {e:#}");
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.primary.teardown() {
            error!("Failed to tear down primary container: {e:#}");
            first_error.get_or_insert(e);
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(anyhow!(e).context(format!("Vault teardown failed for {}", self.user))),
        }
    }

    /// Evicts keys from every container that supports eviction; all other
    /// containers are skipped so whole-vault eviction is one call.
    pub fn evict_key(&mut self) -> StorageResult<()> {
        for container in self.key_holding_containers() {
            container.evict_key().or_kind(
                MountError::KeyringFailed,
                "Failed to evict filesystem key",
            )?;
        }
        Ok(())
    }

    /// Restores keys into every container that supports eviction.
    pub fn restore_key(&mut self, key: &FileSystemKey) -> StorageResult<()> {
        for container in self.key_holding_containers() {
            container.restore_key(key).or_kind(
                MountError::KeyringFailed,
                "Failed to restore filesystem key",
            )?;
        }
        Ok(())
    }

    /// Deletes the primary container's persistent state. The caller ensures
    /// the vault has been torn down.
    pub fn purge(&mut self) -> Result<(), Error> {
        self.primary.purge()
    }

    /// Discards the content of the cache container.
    pub fn purge_cache_container(&mut self) -> Result<(), Error> {
        match self.cache.as_mut() {
            Some(cache) => cache.purge(),
            None => Ok(()),
        }
    }

    /// Drops all data of one application container. Raw containers have no
    /// filesystem to reformat; their storage is purged and recreated by the
    /// next setup.
    pub fn reset_application_container(&mut self, app: &str) -> Result<(), Error> {
        let container = self
            .apps
            .get_mut(app)
            .ok_or_else(|| anyhow!("No application container '{app}'"))?;
        match container.reset() {
            Ok(()) => Ok(()),
            Err(_) if container.get_type() == StorageContainerType::Dmcrypt => container.purge(),
            Err(e) => Err(e),
        }
    }

    /// Schedules deferred device release across all containers.
    pub fn set_lazy_teardown_when_unused(&mut self) -> Result<(), Error> {
        let mut first_error: Option<Error> = None;
        for container in self.all_containers() {
            if supports_key_eviction(container.get_type()) {
                if let Err(e) = container.set_lazy_teardown_when_unused() {
                    warn!("Lazy teardown not scheduled: {e:#}");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Mount recipe for the mounter, derived from the container types.
    pub fn mount_type(&self) -> StorageResult<MountType> {
        match self.primary.get_type() {
            StorageContainerType::Ecryptfs => Ok(MountType::Ecryptfs),
            StorageContainerType::Fscrypt => Ok(MountType::Dircrypto),
            StorageContainerType::Dmcrypt | StorageContainerType::Ext4 => Ok(MountType::Dmcrypt),
            StorageContainerType::Ephemeral => Ok(MountType::Ephemeral),
            StorageContainerType::EcryptfsToFscrypt => Ok(MountType::EcryptfsToFscrypt),
            StorageContainerType::EcryptfsToDmcrypt => Ok(MountType::EcryptfsToDmcrypt),
            StorageContainerType::FscryptToDmcrypt => Ok(MountType::FscryptToDmcrypt),
            StorageContainerType::Unknown => Err(StorageError::new(
                MountError::Fatal,
                "Vault has no usable container type",
            )),
        }
    }

    fn key_holding_containers(&mut self) -> Vec<&mut Box<dyn StorageContainer + 'a>> {
        let mut containers = Vec::new();
        if supports_key_eviction(self.primary.get_type()) {
            containers.push(&mut self.primary);
        }
        if let Some(cache) = self.cache.as_mut() {
            if supports_key_eviction(cache.get_type()) {
                containers.push(cache);
            }
        }
        for app in self.apps.values_mut() {
            if supports_key_eviction(app.get_type()) {
                containers.push(app);
            }
        }
        containers
    }

    fn all_containers(&mut self) -> Vec<&mut Box<dyn StorageContainer + 'a>> {
        let mut containers = vec![&mut self.primary];
        if let Some(cache) = self.cache.as_mut() {
            containers.push(cache);
        }
        containers.extend(self.apps.values_mut());
        containers
    }
}
