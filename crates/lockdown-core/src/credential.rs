//! Administrative credential hashing.
//!
//! Credentials are stored as Argon2id PHC strings on the first line of the
//! configuration file. Rotation re-derives the hash with the cost parameters
//! of the hash being replaced.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use rand::rngs::OsRng;

use crate::error::CredentialError;

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;

/// Argon2 cost parameters for a freshly hashed credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialCost {
    pub memory_kib: u32,
    pub time: u32,
    pub parallelism: u32,
}

impl Default for CredentialCost {
    fn default() -> Self {
        Self {
            memory_kib: KDF_MEMORY_COST,
            time: KDF_TIME_COST,
            parallelism: KDF_PARALLELISM,
        }
    }
}

impl CredentialCost {
    fn params(&self) -> Result<Params, CredentialError> {
        Params::new(self.memory_kib, self.time, self.parallelism, None)
            .map_err(|e| CredentialError::Hash(format!("argon2 params: {e}")))
    }
}

pub fn hash_credential(password: &str) -> Result<String, CredentialError> {
    hash_credential_with_cost(password, CredentialCost::default())
}

pub fn hash_credential_with_cost(
    password: &str,
    cost: CredentialCost,
) -> Result<String, CredentialError> {
    hash_with_params(password, cost.params()?)
}

/// Hash `password` with the same Argon2 parameters as `stored`.
pub fn rehash_like(stored: &str, password: &str) -> Result<String, CredentialError> {
    let parsed = PasswordHash::new(stored).map_err(|e| CredentialError::Hash(e.to_string()))?;
    let params =
        Params::try_from(&parsed).map_err(|e| CredentialError::Hash(format!("argon2 params: {e}")))?;
    hash_with_params(password, params)
}

fn hash_with_params(password: &str, params: Params) -> Result<String, CredentialError> {
    if password.is_empty() {
        return Err(CredentialError::Empty);
    }
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| CredentialError::Hash(format!("argon2 derive: {e}")))?;
    Ok(hash.to_string())
}

/// Returns whether `stored` is a PHC string this module can verify against.
pub fn validate_hash(stored: &str) -> Result<(), String> {
    PasswordHash::new(stored).map(|_| ()).map_err(|e| e.to_string())
}

pub fn verify_credential(stored: &str, candidate: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(candidate.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> CredentialCost {
        CredentialCost {
            memory_kib: 1024,
            time: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn hash_verifies_only_original_password() {
        let hash = hash_credential_with_cost("correct horse", cheap()).unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_credential(&hash, "correct horse"));
        assert!(!verify_credential(&hash, "battery staple"));
    }

    #[test]
    fn salts_differ_between_hashes() {
        let a = hash_credential_with_cost("same", cheap()).unwrap();
        let b = hash_credential_with_cost("same", cheap()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rehash_keeps_cost_parameters() {
        let original = hash_credential_with_cost("old secret", cheap()).unwrap();
        let rotated = rehash_like(&original, "new secret").unwrap();
        assert!(rotated.contains("m=1024,t=1,p=1"));
        assert!(verify_credential(&rotated, "new secret"));
        assert!(!verify_credential(&rotated, "old secret"));
    }

    #[test]
    fn empty_password_is_rejected() {
        assert!(matches!(
            hash_credential_with_cost("", cheap()),
            Err(CredentialError::Empty)
        ));
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(validate_hash("not-a-hash").is_err());
        assert!(!verify_credential("not-a-hash", "anything"));
    }
}
