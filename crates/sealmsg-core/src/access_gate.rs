//! Secondary-credential check guarding the hidden section.
//!
//! The contract is an exact, case-sensitive match against the credential the
//! user chose at signup. No lockout and no throttling live here; the engine
//! decides what to cache after a successful check.

use anyhow::{anyhow, Result};
use argon2::{Argon2, Params};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::models::Identity;

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;
pub const DERIVED_KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;

#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecondaryCredential {
    /// Stored as typed.
    Plain { secret: String },
    /// Argon2id digest of the credential; hex fields.
    Argon2 {
        salt: String,
        hash: String,
        m_cost: u32,
        t_cost: u32,
        p_cost: u32,
    },
}

impl std::fmt::Debug for SecondaryCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plain { .. } => f.write_str("SecondaryCredential::Plain(..)"),
            Self::Argon2 { .. } => f.write_str("SecondaryCredential::Argon2(..)"),
        }
    }
}

impl SecondaryCredential {
    pub fn plain(secret: impl Into<String>) -> Self {
        Self::Plain {
            secret: secret.into(),
        }
    }

    /// Hash with the default Argon2id cost parameters.
    pub fn hashed(secret: &str) -> Result<Self> {
        Self::hashed_with_params(secret, KDF_MEMORY_COST, KDF_TIME_COST, KDF_PARALLELISM)
    }

    pub fn hashed_with_params(secret: &str, m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self> {
        let mut salt = [0u8; SALT_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        let hash = derive(secret, &salt, m_cost, t_cost, p_cost)?;
        Ok(Self::Argon2 {
            salt: hex::encode(salt),
            hash: hex::encode(hash.as_slice()),
            m_cost,
            t_cost,
            p_cost,
        })
    }

    /// True iff `attempt` is byte-for-byte the stored credential.
    pub fn matches(&self, attempt: &str) -> bool {
        match self {
            Self::Plain { secret } => {
                let expected: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
                let actual: [u8; 32] = Sha256::digest(attempt.as_bytes()).into();
                constant_time_eq(&expected, &actual)
            }
            Self::Argon2 {
                salt,
                hash,
                m_cost,
                t_cost,
                p_cost,
            } => {
                let (Ok(salt), Ok(expected)) = (hex::decode(salt), hex::decode(hash)) else {
                    tracing::warn!("stored secondary credential is not valid hex");
                    return false;
                };
                match derive(attempt, &salt, *m_cost, *t_cost, *p_cost) {
                    Ok(actual) => constant_time_eq(&expected, actual.as_slice()),
                    Err(err) => {
                        tracing::warn!(error = %err, "secondary credential derivation failed");
                        false
                    }
                }
            }
        }
    }
}

/// Check `attempt` against the identity's secondary credential.
pub fn verify_secondary(identity: &Identity, attempt: &str) -> bool {
    identity.secondary_credential.matches(attempt)
}

fn derive(
    secret: &str,
    salt: &[u8],
    m_cost: u32,
    t_cost: u32,
    p_cost: u32,
) -> Result<Zeroizing<Vec<u8>>> {
    let params = Params::new(m_cost, t_cost, p_cost, Some(DERIVED_KEY_LEN))
        .map_err(|e| anyhow!("argon2 params: {e}"))?;
    let argon = Argon2::from(params);
    let mut out = Zeroizing::new(vec![0u8; DERIVED_KEY_LEN]);
    argon
        .hash_password_into(secret.as_bytes(), salt, &mut out)
        .map_err(|e| anyhow!("argon2 derive: {e}"))?;
    Ok(out)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(credential: SecondaryCredential) -> Identity {
        Identity {
            id: "u1".into(),
            display_name: "Sam".into(),
            secondary_credential: credential,
        }
    }

    #[test]
    fn plain_requires_exact_match() {
        let id = identity(SecondaryCredential::plain("Open Sesame"));
        assert!(verify_secondary(&id, "Open Sesame"));
        assert!(!verify_secondary(&id, "open sesame"));
        assert!(!verify_secondary(&id, "Open Sesame "));
        assert!(!verify_secondary(&id, ""));
    }

    #[test]
    fn hashed_credential_keeps_the_same_contract() {
        let cred = SecondaryCredential::hashed_with_params("Open Sesame", 1024, 1, 1).unwrap();
        let id = identity(cred);
        assert!(verify_secondary(&id, "Open Sesame"));
        assert!(!verify_secondary(&id, "OPEN SESAME"));
        assert!(!verify_secondary(&id, "Open Sesam"));
    }

    #[test]
    fn hashed_credential_roundtrips_through_json() {
        let cred = SecondaryCredential::hashed_with_params("pw", 1024, 1, 1).unwrap();
        let json = serde_json::to_string(&cred).unwrap();
        assert!(!json.contains("\"pw\""));
        let back: SecondaryCredential = serde_json::from_str(&json).unwrap();
        assert!(back.matches("pw"));
    }

    #[test]
    fn corrupt_hash_never_matches() {
        let cred = SecondaryCredential::Argon2 {
            salt: "zz".into(),
            hash: "00".into(),
            m_cost: 1024,
            t_cost: 1,
            p_cost: 1,
        };
        assert!(!cred.matches("anything"));
    }

    #[test]
    fn debug_redacts_secret() {
        let cred = SecondaryCredential::plain("hunter2");
        assert!(!format!("{cred:?}").contains("hunter2"));
    }
}
