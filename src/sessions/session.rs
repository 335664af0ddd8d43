use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Error};
use uuid::Uuid;

use storage_api::users::Username;

/// Unguessable 128-bit session identifier. The canonical textual form is
/// the lowercase hex of its 16 bytes with no separators; the parser
/// rejects every other form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AuthSessionToken([u8; 16]);

impl AuthSessionToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for AuthSessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for AuthSessionToken {
    type Err = Error;

    fn from_str(serialized: &str) -> Result<Self, Self::Err> {
        if serialized.len() != 32 {
            bail!("AuthSession token must be 32 hex characters");
        }
        if serialized
            .bytes()
            .any(|b| !b.is_ascii_digit() && !(b'a'..=b'f').contains(&b))
        {
            bail!("AuthSession token must be lowercase hex");
        }
        let bytes = hex::decode(serialized)?;
        let mut token = [0u8; 16];
        token.copy_from_slice(&bytes);
        Ok(Self(token))
    }
}

/// What the caller wants the authenticated session for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthIntent {
    Decrypt,
    VerifyOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    Authenticated,
}

/// A live authentication session. Owned by the manager while parked in its
/// slot and by exactly one `InUseAuthSession` while checked out.
pub struct AuthSession {
    token: AuthSessionToken,
    account: Username,
    intent: AuthIntent,
    state: AuthState,
}

impl AuthSession {
    pub(super) fn new(account: Username, intent: AuthIntent) -> Self {
        Self {
            token: AuthSessionToken::generate(),
            account,
            intent,
            state: AuthState::Unauthenticated,
        }
    }

    pub fn token(&self) -> AuthSessionToken {
        self.token
    }

    pub fn account(&self) -> &Username {
        &self.account
    }

    pub fn intent(&self) -> AuthIntent {
        self.intent
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    pub(super) fn set_authenticated(&mut self) {
        self.state = AuthState::Authenticated;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_and_round_trip() {
        let token = AuthSessionToken::generate();
        assert_ne!(token, AuthSessionToken::generate());

        let serialized = token.to_string();
        assert_eq!(serialized.len(), 32);
        assert_eq!(serialized.parse::<AuthSessionToken>().unwrap(), token);
    }

    #[test]
    fn parser_rejects_non_canonical_forms() {
        // Wrong length.
        "abc".parse::<AuthSessionToken>().unwrap_err();
        // Uppercase hex.
        "AABBCCDDEEFF00112233445566778899"
            .parse::<AuthSessionToken>()
            .unwrap_err();
        // Separators.
        "aabbccdd-eeff-0011-2233-445566778899"
            .parse::<AuthSessionToken>()
            .unwrap_err();
        // Non-hex.
        "zzbbccddeeff00112233445566778899"
            .parse::<AuthSessionToken>()
            .unwrap_err();

        "aabbccddeeff00112233445566778899"
            .parse::<AuthSessionToken>()
            .unwrap();
    }

    #[test]
    fn sessions_start_unauthenticated() {
        let session = AuthSession::new(Username::from("alice"), AuthIntent::Decrypt);
        assert_eq!(session.state(), AuthState::Unauthenticated);
        assert_eq!(session.intent(), AuthIntent::Decrypt);
        assert_eq!(session.account().as_str(), "alice");
    }
}
