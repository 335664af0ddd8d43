use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// User-visible account identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Username(String);

impl Username {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Username {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

/// Salted hash of a [`Username`], used as the stable on-disk path component
/// for everything belonging to that user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObfuscatedUsername(String);

impl ObfuscatedUsername {
    /// Wraps an already-sanitized value, e.g. a shadow directory basename.
    /// Returns `None` if the value is not in canonical form.
    pub fn from_sanitized(value: impl Into<String>) -> Option<Self> {
        let value = value.into();
        is_sanitized(&value).then_some(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObfuscatedUsername {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Obfuscates a username with the system salt: lowercase the account id,
/// then hex-encode `SHA256(salt || lowercased)`.
pub fn sanitize_user_name(username: &Username, salt: &[u8]) -> ObfuscatedUsername {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(username.as_str().to_lowercase());
    ObfuscatedUsername(hex::encode(hasher.finalize()))
}

/// True for strings that look like a sanitized username: non-empty, even
/// length, lowercase hex only.
pub fn is_sanitized(value: &str) -> bool {
    !value.is_empty()
        && value.len() % 2 == 0
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
