use std::fmt;

use serde::{Deserialize, Serialize};

/// Secret byte string. Never printed; zeroed on drop.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecureBytes(Vec<u8>);

impl SecureBytes {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Debug for SecureBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecureBytes({} bytes)", self.0.len())
    }
}

impl Drop for SecureBytes {
    fn drop(&mut self) {
        for byte in self.0.iter_mut() {
            // Volatile so the wipe is not optimized away.
            unsafe { std::ptr::write_volatile(byte, 0) };
        }
    }
}

impl From<&[u8]> for SecureBytes {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

/// Filesystem encryption key material. Only `fek` is mandatory; the
/// filename-encryption key and the salts are used by eCryptfs alone.
#[derive(Debug, Clone, Default)]
pub struct FileSystemKey {
    pub fek: SecureBytes,
    pub fnek: SecureBytes,
    pub fek_salt: SecureBytes,
    pub fnek_salt: SecureBytes,
}

/// Non-secret identifiers that address a provisioned key in the kernel.
///
/// For fscrypt v2 the kernel substitutes its own identifier for `fek_sig`
/// during key installation, so holders must treat the reference as in-out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemKeyReference {
    #[serde(with = "hex_bytes")]
    pub fek_sig: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub fnek_sig: Vec<u8>,
}

impl FileSystemKeyReference {
    pub fn fek_sig_hex(&self) -> String {
        hex::encode(&self.fek_sig)
    }

    pub fn fnek_sig_hex(&self) -> String {
        hex::encode(&self.fnek_sig)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
