//! Provisioning and revocation of filesystem keys in kernel keyrings.

mod ecryptfs;

use std::path::PathBuf;

use anyhow::{bail, Context, Error};
use log::warn;

use osutils::{
    fscrypt,
    keyutils::{self, Keyring as KernelKeyring},
};
use storage_api::keys::{FileSystemKey, FileSystemKeyReference};

/// Key flavors, each provisioned into a different kernel structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Ecryptfs,
    FscryptV1,
    FscryptV2,
    Dmcrypt,
}

/// Installs and evicts filesystem keys.
///
/// Depending on the key type the reference is either consumed as-is or
/// rewritten by the kernel; callers must use the reference as it is left
/// after `add_key` returns.
pub trait Keyring {
    fn add_key(
        &self,
        key_type: KeyType,
        key: &FileSystemKey,
        reference: &mut FileSystemKeyReference,
    ) -> Result<(), Error>;

    fn remove_key(
        &self,
        key_type: KeyType,
        reference: &FileSystemKeyReference,
    ) -> Result<(), Error>;
}

const DMCRYPT_KEY_DESCRIPTOR_PREFIX: &str = "dmcrypt:";
const FSCRYPT_KEY_DESCRIPTOR_PREFIX: &str = "fscrypt:";
const LOGON_KEY_TYPE: &str = "logon";
const USER_KEY_TYPE: &str = "user";

/// Keyring description of a dm-crypt logon key.
pub fn dmcrypt_key_name(reference: &FileSystemKeyReference) -> String {
    format!("{DMCRYPT_KEY_DESCRIPTOR_PREFIX}{}", reference.fek_sig_hex())
}

/// Key descriptor consumed by the dm-crypt table when the key lives in the
/// kernel keyring.
pub fn dmcrypt_key_descriptor(key_size: usize, reference: &FileSystemKeyReference) -> String {
    format!(":{key_size}:{LOGON_KEY_TYPE}:{}", dmcrypt_key_name(reference))
}

/// Production keyring backed by the kernel interfaces.
pub struct RealKeyring {
    /// Mount whose filesystem keyring receives fscrypt v2 keys.
    fscrypt_mount_root: PathBuf,
}

impl Default for RealKeyring {
    fn default() -> Self {
        Self {
            fscrypt_mount_root: PathBuf::from("/home"),
        }
    }
}

impl RealKeyring {
    pub fn new(fscrypt_mount_root: PathBuf) -> Self {
        Self { fscrypt_mount_root }
    }

    fn add_ecryptfs_keys(
        &self,
        key: &FileSystemKey,
        reference: &FileSystemKeyReference,
    ) -> Result<(), Error> {
        let fek_sig = reference.fek_sig_hex();
        let token =
            ecryptfs::build_auth_token(key.fek.as_bytes(), &fek_sig, key.fek_salt.as_bytes())?;
        keyutils::add_key(USER_KEY_TYPE, &fek_sig, &token, KernelKeyring::UserSession)
            .context("Failed to insert eCryptfs FEK auth token")?;

        if reference.fnek_sig.is_empty() {
            return Ok(());
        }
        let fnek_sig = reference.fnek_sig_hex();
        let token =
            ecryptfs::build_auth_token(key.fnek.as_bytes(), &fnek_sig, key.fnek_salt.as_bytes())?;
        keyutils::add_key(USER_KEY_TYPE, &fnek_sig, &token, KernelKeyring::UserSession)
            .context("Failed to insert eCryptfs FNEK auth token")
            .map(|_| ())
    }
}

// fscrypt v1 legacy payload: mode, raw key, size.
const FSCRYPT_MODE_AES_256_XTS: u32 = 1;

fn fscrypt_v1_payload(key: &[u8]) -> Result<Vec<u8>, Error> {
    const FSCRYPT_MAX_KEY_SIZE: usize = 64;
    if key.is_empty() || key.len() > FSCRYPT_MAX_KEY_SIZE {
        bail!(
            "fscrypt key must be 1..={FSCRYPT_MAX_KEY_SIZE} bytes, got {}",
            key.len()
        );
    }
    let mut payload = Vec::with_capacity(8 + FSCRYPT_MAX_KEY_SIZE);
    payload.extend_from_slice(&FSCRYPT_MODE_AES_256_XTS.to_ne_bytes());
    payload.extend_from_slice(key);
    payload.resize(4 + FSCRYPT_MAX_KEY_SIZE, 0);
    payload.extend_from_slice(&(key.len() as u32).to_ne_bytes());
    Ok(payload)
}

fn fscrypt_v1_key_name(reference: &FileSystemKeyReference) -> String {
    format!(
        "{FSCRYPT_KEY_DESCRIPTOR_PREFIX}{}",
        hex::encode(&reference.fek_sig[..reference.fek_sig.len().min(fscrypt::KEY_DESCRIPTOR_SIZE)])
    )
}

impl Keyring for RealKeyring {
    fn add_key(
        &self,
        key_type: KeyType,
        key: &FileSystemKey,
        reference: &mut FileSystemKeyReference,
    ) -> Result<(), Error> {
        match key_type {
            KeyType::Ecryptfs => self.add_ecryptfs_keys(key, reference),
            KeyType::FscryptV1 => {
                let payload = fscrypt_v1_payload(key.fek.as_bytes())?;
                keyutils::add_key(
                    LOGON_KEY_TYPE,
                    &fscrypt_v1_key_name(reference),
                    &payload,
                    KernelKeyring::Session,
                )
                .context("Failed to insert fscrypt v1 policy key")?;
                Ok(())
            }
            KeyType::FscryptV2 => {
                // The kernel picks the key identifier; the reference is
                // rewritten so later operations can address the key.
                let identifier =
                    fscrypt::add_key_v2(&self.fscrypt_mount_root, key.fek.as_bytes())
                        .context("Failed to insert fscrypt v2 key")?;
                reference.fek_sig = identifier.to_vec();
                Ok(())
            }
            KeyType::Dmcrypt => {
                // The thread keyring ties the key lifetime to this process:
                // if we die before invalidating it, the kernel drops it.
                keyutils::add_key(
                    LOGON_KEY_TYPE,
                    &dmcrypt_key_name(reference),
                    key.fek.as_bytes(),
                    KernelKeyring::Thread,
                )
                .context("Failed to insert dm-crypt logon key")?;
                Ok(())
            }
        }
    }

    fn remove_key(
        &self,
        key_type: KeyType,
        reference: &FileSystemKeyReference,
    ) -> Result<(), Error> {
        match key_type {
            KeyType::Ecryptfs => {
                keyutils::search_and_invalidate(
                    USER_KEY_TYPE,
                    &reference.fek_sig_hex(),
                    KernelKeyring::UserSession,
                )
                .context("Failed to invalidate eCryptfs FEK auth token")?;
                if !reference.fnek_sig.is_empty() {
                    keyutils::search_and_invalidate(
                        USER_KEY_TYPE,
                        &reference.fnek_sig_hex(),
                        KernelKeyring::UserSession,
                    )
                    .context("Failed to invalidate eCryptfs FNEK auth token")?;
                }
                Ok(())
            }
            KeyType::FscryptV1 => keyutils::search_and_invalidate(
                LOGON_KEY_TYPE,
                &fscrypt_v1_key_name(reference),
                KernelKeyring::Session,
            )
            .context("Failed to invalidate fscrypt v1 policy key"),
            KeyType::FscryptV2 => {
                fscrypt::remove_key_v2(&self.fscrypt_mount_root, &reference.fek_sig)
                    .context("Failed to remove fscrypt v2 key")
            }
            KeyType::Dmcrypt => keyutils::search_and_invalidate(
                LOGON_KEY_TYPE,
                &dmcrypt_key_name(reference),
                KernelKeyring::Thread,
            )
            .context("Failed to invalidate dm-crypt logon key"),
        }
    }
}

/// Removes a key on a teardown path where failure must not stop the
/// teardown. Returns whether the removal succeeded.
pub fn remove_key_logged(
    keyring: &dyn Keyring,
    key_type: KeyType,
    reference: &FileSystemKeyReference,
) -> bool {
    match keyring.remove_key(key_type, reference) {
        Ok(()) => true,
        Err(e) => {
            warn!("Failed to remove {key_type:?} key: {e:#}");
            false
        }
    }
}
