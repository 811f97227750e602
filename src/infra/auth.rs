//! Credential guard for the metrics endpoint
//!
//! Both the provided username and password are SHA-256 hashed and compared
//! against the expected digests with a constant-time comparison, so response
//! timing does not depend on where a mismatch occurs. Hashing first gives
//! fixed-length inputs regardless of what the client sends.
//!
//! No rate limiting or lockout: repeated failures are not throttled.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Realm advertised in the `WWW-Authenticate` challenge
pub const REALM: &str = "Prometheus - Shelly";

/// SHA-256 digest of a secret
pub type Sha256Digest = [u8; 32];

pub fn sha256(input: &str) -> Sha256Digest {
    Sha256::digest(input.as_bytes()).into()
}

/// Expected credentials, immutable after startup
pub struct CredentialGuard {
    username_digest: Sha256Digest,
    password_digest: Sha256Digest,
    realm: &'static str,
}

impl CredentialGuard {
    /// Build a guard from the expected username and the digest of the expected
    /// password. The plaintext password never reaches the guard.
    pub fn new(username: &str, password_digest: Sha256Digest) -> Self {
        Self { username_digest: sha256(username), password_digest, realm: REALM }
    }

    /// True iff both username and password match
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let username_ok = sha256(username).as_slice().ct_eq(self.username_digest.as_slice());
        let password_ok = sha256(password).as_slice().ct_eq(self.password_digest.as_slice());
        // Non-short-circuiting: both comparisons always run
        (username_ok & password_ok).into()
    }

    pub fn realm(&self) -> &str {
        self.realm
    }

    /// Value for the `WWW-Authenticate` response header
    pub fn challenge(&self) -> String {
        format!(r#"Basic realm="{}", charset="UTF-8""#, self.realm)
    }
}

impl std::fmt::Debug for CredentialGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialGuard").field("realm", &self.realm).finish_non_exhaustive()
    }
}
