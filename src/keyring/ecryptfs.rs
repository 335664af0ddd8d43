//! Construction of eCryptfs authentication tokens.
//!
//! The kernel expects a `user`-type key whose payload is the packed
//! `ecryptfs_auth_tok` structure; the layout below follows the kernel ABI
//! and must not be rearranged.

use anyhow::{bail, Error};

pub const ECRYPTFS_VERSION: u16 = 0x0004;
pub const ECRYPTFS_PASSWORD: u16 = 0;
pub const ECRYPTFS_SESSION_KEY_ENCRYPTION_KEY_SET: u32 = 0x0000_0002;

pub const ECRYPTFS_MAX_KEY_BYTES: usize = 64;
pub const ECRYPTFS_MAX_ENCRYPTED_KEY_BYTES: usize = 512;
pub const ECRYPTFS_SALT_SIZE: usize = 8;
pub const ECRYPTFS_SIG_SIZE_HEX: usize = 16;

#[repr(C)]
#[derive(Clone, Copy)]
struct EcryptfsSessionKey {
    flags: u32,
    encrypted_key_size: u32,
    decrypted_key_size: u32,
    encrypted_key: [u8; ECRYPTFS_MAX_ENCRYPTED_KEY_BYTES],
    decrypted_key: [u8; ECRYPTFS_MAX_KEY_BYTES],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct EcryptfsPassword {
    password_bytes: u32,
    hash_algo: i32,
    hash_iterations: u32,
    session_key_encryption_key_bytes: u32,
    flags: u32,
    session_key_encryption_key: [u8; ECRYPTFS_MAX_KEY_BYTES],
    signature: [u8; ECRYPTFS_SIG_SIZE_HEX + 1],
    salt: [u8; ECRYPTFS_SALT_SIZE],
}

#[repr(C)]
#[derive(Clone, Copy)]
struct EcryptfsAuthTok {
    version: u16,
    token_type: u16,
    flags: u32,
    session_key: EcryptfsSessionKey,
    reserved: [u8; 32],
    password: EcryptfsPassword,
}

/// Serializes an auth token for `key` addressed by the hex `signature`.
pub fn build_auth_token(key: &[u8], signature: &str, salt: &[u8]) -> Result<Vec<u8>, Error> {
    if key.is_empty() || key.len() > ECRYPTFS_MAX_KEY_BYTES {
        bail!("eCryptfs key must be 1..={ECRYPTFS_MAX_KEY_BYTES} bytes, got {}", key.len());
    }
    if signature.len() != ECRYPTFS_SIG_SIZE_HEX {
        bail!(
            "eCryptfs signature must be {ECRYPTFS_SIG_SIZE_HEX} hex chars, got {}",
            signature.len()
        );
    }
    if salt.len() > ECRYPTFS_SALT_SIZE {
        bail!("eCryptfs salt must be at most {ECRYPTFS_SALT_SIZE} bytes, got {}", salt.len());
    }

    let mut token = EcryptfsAuthTok {
        version: ECRYPTFS_VERSION,
        token_type: ECRYPTFS_PASSWORD,
        flags: 0,
        session_key: EcryptfsSessionKey {
            flags: 0,
            encrypted_key_size: 0,
            decrypted_key_size: 0,
            encrypted_key: [0; ECRYPTFS_MAX_ENCRYPTED_KEY_BYTES],
            decrypted_key: [0; ECRYPTFS_MAX_KEY_BYTES],
        },
        reserved: [0; 32],
        password: EcryptfsPassword {
            password_bytes: 0,
            hash_algo: 0,
            hash_iterations: 0,
            session_key_encryption_key_bytes: key.len() as u32,
            flags: ECRYPTFS_SESSION_KEY_ENCRYPTION_KEY_SET,
            session_key_encryption_key: [0; ECRYPTFS_MAX_KEY_BYTES],
            signature: [0; ECRYPTFS_SIG_SIZE_HEX + 1],
            salt: [0; ECRYPTFS_SALT_SIZE],
        },
    };
    token.password.session_key_encryption_key[..key.len()].copy_from_slice(key);
    token.password.signature[..signature.len()].copy_from_slice(signature.as_bytes());
    token.password.salt[..salt.len()].copy_from_slice(salt);

    let bytes = unsafe {
        std::slice::from_raw_parts(
            &token as *const EcryptfsAuthTok as *const u8,
            std::mem::size_of::<EcryptfsAuthTok>(),
        )
    }
    .to_vec();

    // Scrub the stack copy of the key.
    for byte in token.password.session_key_encryption_key.iter_mut() {
        unsafe { std::ptr::write_volatile(byte, 0) };
    }
    Ok(bytes)
}
