use std::path::PathBuf;

use anyhow::{anyhow, bail, Error};
use log::error;

use storage_api::config::StorageContainerType;
use storage_api::keys::FileSystemKey;

use super::StorageContainer;

/// Composite container used while copying a home between encryption
/// schemes: the legacy source stays mountable at the temporary mount point
/// while the destination is built at the canonical one. Consumed by the
/// mounter's migration path.
pub struct MigratingContainer<'a> {
    migrating_type: StorageContainerType,
    src: Box<dyn StorageContainer + 'a>,
    dst: Box<dyn StorageContainer + 'a>,
}

impl<'a> MigratingContainer<'a> {
    pub fn new(
        migrating_type: StorageContainerType,
        src: Box<dyn StorageContainer + 'a>,
        dst: Box<dyn StorageContainer + 'a>,
    ) -> Result<Self, Error> {
        if !migrating_type.is_migrating() {
            bail!("{migrating_type:?} is not a migrating container type");
        }
        Ok(Self {
            migrating_type,
            src,
            dst,
        })
    }

    pub fn source(&mut self) -> &mut (dyn StorageContainer + 'a) {
        self.src.as_mut()
    }

    pub fn destination(&mut self) -> &mut (dyn StorageContainer + 'a) {
        self.dst.as_mut()
    }

    pub fn destination_type(&self) -> StorageContainerType {
        self.dst.get_type()
    }
}

impl StorageContainer for MigratingContainer<'_> {
    /// The source is authoritative: migration is pending while it exists.
    fn exists(&self) -> bool {
        self.src.exists()
    }

    fn setup(&mut self, key: &FileSystemKey) -> Result<(), Error> {
        self.src.setup(key)?;
        if let Err(e) = self.dst.setup(key) {
            if let Err(src_err) = self.src.teardown() {
                error!("Failed to tear down migration source: {src_err:#}");
            }
            return Err(e);
        }
        Ok(())
    }

    fn teardown(&mut self) -> Result<(), Error> {
        let mut first_error = None;
        for (what, container) in [("source", &mut self.src), ("destination", &mut self.dst)] {
            if let Err(e) = container.teardown() {
                error!("Failed to tear down migration {what}: {e:#}");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(anyhow!(e).context("Migrating container teardown failed")),
        }
    }

    fn purge(&mut self) -> Result<(), Error> {
        bail!("migrating containers do not support purge")
    }

    fn get_type(&self) -> StorageContainerType {
        self.migrating_type
    }

    fn get_backing_location(&self) -> PathBuf {
        self.src.get_backing_location()
    }
}
