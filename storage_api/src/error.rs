use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::IntoStaticStr;

/// Wire-visible failure kinds for storage operations.
///
/// These are the values reported back to the RPC layer; everything else about
/// a failure (origin message, underlying cause chain) is diagnostic only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, thiserror::Error, Serialize, Deserialize, IntoStaticStr,
)]
#[serde(rename_all = "kebab-case")]
pub enum MountError {
    #[error("Mount point is busy")]
    MountPointBusy,
    #[error("Failed to create cryptohome")]
    CreateCryptohomeFailed,
    #[error("Failed to mount eCryptfs")]
    MountEcryptfsFailed,
    #[error("Failed to mount fscrypt cryptohome")]
    MountFscryptFailed,
    #[error("Failed to mount dm-crypt cryptohome")]
    MountDmcryptFailed,
    #[error("Failed to mount homes and daemon stores")]
    MountHomesAndDaemonStoresFailed,
    #[error("Failed to set up the process keyring")]
    SetupProcessKeyringFailed,
    #[error("Previous encryption migration is incomplete")]
    PreviousMigrationIncomplete,
    #[error("Vault uses old encryption and migration was not requested")]
    OldEncryption,
    #[error("Unexpected mount type for the requested operation")]
    UnexpectedMountType,
    #[error("Kernel keyring operation failed")]
    KeyringFailed,
    #[error("Fatal storage inconsistency")]
    Fatal,
}

/// A failed storage operation: a wire-visible kind plus a human-readable
/// origin. Internal causes ride along as an `anyhow` chain for logs.
#[derive(Debug)]
pub struct StorageError {
    kind: MountError,
    message: Cow<'static, str>,
    source: Option<anyhow::Error>,
}

impl StorageError {
    pub fn new(kind: MountError, message: impl Into<Cow<'static, str>>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        kind: MountError,
        message: impl Into<Cow<'static, str>>,
        source: anyhow::Error,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn kind(&self) -> MountError {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(source) = &self.source {
            write!(f, ": {source:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Attaches a storage error kind and origin message to an internal failure.
pub trait StorageResultExt<T> {
    fn or_kind(self, kind: MountError, message: impl Into<Cow<'static, str>>) -> StorageResult<T>;
}

impl<T> StorageResultExt<T> for Result<T, anyhow::Error> {
    fn or_kind(self, kind: MountError, message: impl Into<Cow<'static, str>>) -> StorageResult<T> {
        self.map_err(|e| StorageError::with_source(kind, message, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use anyhow::anyhow;

    #[test]
    fn kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&MountError::PreviousMigrationIncomplete).unwrap(),
            "\"previous-migration-incomplete\""
        );
        assert_eq!(
            serde_json::to_string(&MountError::OldEncryption).unwrap(),
            "\"old-encryption\""
        );
    }

    #[test]
    fn error_carries_kind_and_origin() {
        let err = StorageError::new(MountError::MountPointBusy, "mount point in use");
        assert_eq!(err.kind(), MountError::MountPointBusy);
        assert!(err.to_string().contains("mount point in use"));
    }

    #[test]
    fn or_kind_wraps_internal_failures() {
        let res: Result<(), anyhow::Error> = Err(anyhow!("dm_setup failed"));
        let err = res
            .or_kind(MountError::MountDmcryptFailed, "setting up data volume")
            .unwrap_err();
        assert_eq!(err.kind(), MountError::MountDmcryptFailed);
        assert!(err.to_string().contains("dm_setup failed"));
    }
}
