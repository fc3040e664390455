//! Session token generation and digesting
//!
//! A session token is 20 bytes from a cryptographically secure source,
//! rendered as lowercase base32 (32 characters, no padding needed). The server
//! only ever stores the SHA-256 digest of the token, hex encoded, so a leaked
//! `sessions` table cannot be replayed as bearer credentials.

use data_encoding::{BASE32, HEXLOWER};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Number of random bytes in a session token
pub const TOKEN_BYTES: usize = 20;

/// Length of an encoded session token (base32 of [`TOKEN_BYTES`])
pub const TOKEN_LENGTH: usize = 32;

/// Length of a hex-encoded session digest
pub const DIGEST_LENGTH: usize = 64;

/// The entropy source could not supply bytes
#[derive(Debug, thiserror::Error)]
#[error("random source unavailable: {0}")]
pub struct EntropyError(pub String);

/// Source of cryptographically secure random bytes
pub trait EntropySource: Send + Sync {
    /// Fill `buf` entirely or fail
    fn fill(&self, buf: &mut [u8]) -> Result<(), EntropyError>;
}

/// Operating system CSPRNG
#[derive(Debug, Clone, Copy, Default)]
pub struct OsEntropy;

impl EntropySource for OsEntropy {
    fn fill(&self, buf: &mut [u8]) -> Result<(), EntropyError> {
        getrandom::fill(buf).map_err(|e| EntropyError(e.to_string()))
    }
}

/// Opaque bearer token handed to a client.
///
/// `Debug` is redacted so tokens never end up in logs by accident.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    /// The transport form of the token (cookie or header value)
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Storage key for this token
    pub fn digest(&self) -> SessionDigest {
        SessionDigest::from_token(self)
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

impl AsRef<str> for SessionToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Hex-encoded SHA-256 of a session token; primary key of a session row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SessionDigest(String);

impl SessionDigest {
    /// Digest an issued token
    pub fn from_token(token: &SessionToken) -> Self {
        Self::from_token_str(token.as_str())
    }

    /// Digest a token as presented by a client. Any string is accepted.
    pub fn from_token_str(token: &str) -> Self {
        let hash = Sha256::digest(token.as_bytes());
        Self(HEXLOWER.encode(&hash))
    }

    /// Parse an already computed digest (64 lowercase hex characters)
    pub fn from_hex(hex: impl Into<String>) -> Result<Self, InvalidDigest> {
        let hex = hex.into();
        let well_formed = hex.len() == DIGEST_LENGTH
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if well_formed {
            Ok(Self(hex))
        } else {
            Err(InvalidDigest(hex))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading characters only, for log lines
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for SessionDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SessionDigest> for String {
    fn from(digest: SessionDigest) -> Self {
        digest.0
    }
}

impl TryFrom<String> for SessionDigest {
    type Error = InvalidDigest;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(value)
    }
}

/// A string that is not a well-formed session digest
#[derive(Debug, thiserror::Error)]
#[error("invalid session digest: {0:?}")]
pub struct InvalidDigest(pub String);

/// Digest a presented token
pub fn digest(token: &str) -> SessionDigest {
    SessionDigest::from_token_str(token)
}

/// Generate a new session token from the operating system CSPRNG
pub fn generate_session_token() -> Result<SessionToken, EntropyError> {
    generate_session_token_with(&OsEntropy)
}

/// Generate a new session token from the given entropy source.
///
/// Failures are returned as-is; retrying on a broken entropy source is
/// never safe.
pub fn generate_session_token_with(
    source: &dyn EntropySource,
) -> Result<SessionToken, EntropyError> {
    let mut bytes = [0u8; TOKEN_BYTES];
    source.fill(&mut bytes)?;
    Ok(SessionToken(BASE32.encode(&bytes).to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FixedEntropy(u8);

    impl EntropySource for FixedEntropy {
        fn fill(&self, buf: &mut [u8]) -> Result<(), EntropyError> {
            buf.fill(self.0);
            Ok(())
        }
    }

    struct BrokenEntropy;

    impl EntropySource for BrokenEntropy {
        fn fill(&self, _buf: &mut [u8]) -> Result<(), EntropyError> {
            Err(EntropyError("device not ready".to_string()))
        }
    }

    #[test]
    fn test_token_shape() {
        let token = generate_session_token().expect("entropy available");

        assert_eq!(token.as_str().len(), TOKEN_LENGTH);
        assert!(!token.as_str().contains('='));
        assert!(token
            .as_str()
            .chars()
            .all(|c| c.is_ascii_lowercase() || ('2'..='7').contains(&c)));
    }

    #[test]
    fn test_token_encoding_is_lowercase_base32() {
        let token = generate_session_token_with(&FixedEntropy(0)).unwrap();
        assert_eq!(token.as_str(), "a".repeat(TOKEN_LENGTH));

        let token = generate_session_token_with(&FixedEntropy(0xff)).unwrap();
        assert_eq!(token.as_str(), "7".repeat(TOKEN_LENGTH));
    }

    #[test]
    fn test_broken_entropy_is_reported() {
        let err = generate_session_token_with(&BrokenEntropy).unwrap_err();
        assert!(err.to_string().contains("device not ready"));
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = generate_session_token().unwrap();
        let rendered = format!("{:?}", token);
        assert!(!rendered.contains(token.as_str()));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_digest_known_vector() {
        // SHA-256("abc")
        assert_eq!(
            digest("abc").as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_digest_of_token_matches_digest_of_str() {
        let token = generate_session_token().unwrap();
        assert_eq!(token.digest(), digest(token.as_str()));
        assert_ne!(token.digest().as_str(), token.as_str());
    }

    #[test]
    fn test_from_hex_validation() {
        let valid = digest("whatever");
        assert_eq!(SessionDigest::from_hex(valid.to_string()).unwrap(), valid);

        assert!(SessionDigest::from_hex("abc").is_err());
        assert!(SessionDigest::from_hex(valid.as_str().to_uppercase()).is_err());
        assert!(SessionDigest::from_hex("g".repeat(DIGEST_LENGTH)).is_err());
    }

    #[test]
    fn test_digest_serde_rejects_malformed() {
        let valid = digest("serde");
        let json = serde_json::to_string(&valid).unwrap();
        let back: SessionDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, valid);

        assert!(serde_json::from_str::<SessionDigest>("\"not-a-digest\"").is_err());
    }

    #[test]
    fn test_tokens_and_digests_do_not_collide() {
        let mut tokens = HashSet::new();
        let mut digests = HashSet::new();

        for _ in 0..10_000 {
            let token = generate_session_token().unwrap();
            assert!(digests.insert(token.digest()));
            assert!(tokens.insert(token.into_string()));
        }
    }
}
