//! Password and secret hashing with Argon2id, and password policy checks.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::{Engine as _, engine::general_purpose};
use rand::prelude::RngExt;
use rand::rng;

use crate::config::PasswordConfig;
use crate::errors::Error;

/// Argon2 cost parameters.
#[derive(Debug, Clone, Copy)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Argon2Params {
    fn hasher(self) -> Result<Argon2<'static>, Error> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None).map_err(|e| Error::Internal {
            operation: format!("create argon2 params: {e}"),
        })?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            memory_kib: 19456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl From<&PasswordConfig> for Argon2Params {
    fn from(config: &PasswordConfig) -> Self {
        Self {
            memory_kib: config.argon2_memory_kib,
            iterations: config.argon2_iterations,
            parallelism: config.argon2_parallelism,
        }
    }
}

/// Hash a password or a reset secret. Falls back to the default cost when `params` is `None`.
pub fn hash_string_with_params(input: &str, params: Option<Argon2Params>) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = params
        .unwrap_or_default()
        .hasher()?
        .hash_password(input.as_bytes(), &salt)
        .map_err(|e| Error::Internal {
            operation: format!("hash string: {e}"),
        })?;
    Ok(hash.to_string())
}

pub fn hash_string(input: &str) -> Result<String, Error> {
    hash_string_with_params(input, None)
}

/// Verify a secret against a PHC hash string. The cost parameters are read from the hash.
pub fn verify_string(input: &str, hash: &str) -> Result<bool, Error> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| Error::Internal {
        operation: format!("parse hash: {e}"),
    })?;
    Ok(Argon2::default().verify_password(input.as_bytes(), &parsed_hash).is_ok())
}

/// 256 random bits, base64url without padding (43 characters).
pub fn generate_reset_token() -> String {
    let mut token_bytes = [0u8; 32];
    rng().fill(&mut token_bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(token_bytes)
}

/// Check a new password against the length policy and its confirmation.
pub fn validate_new_password(password: &str, confirmation: Option<&str>, policy: &PasswordConfig) -> Result<(), Error> {
    if let Some(confirmation) = confirmation
        && confirmation != password
    {
        return Err(Error::BadRequest {
            message: "Passwords do not match".to_string(),
        });
    }
    let length = password.chars().count();
    if length < policy.min_length {
        return Err(Error::BadRequest {
            message: format!("Password must be at least {} characters", policy.min_length),
        });
    }
    if length > policy.max_length {
        return Err(Error::BadRequest {
            message: format!("Password must be at most {} characters", policy.max_length),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cheap() -> Option<Argon2Params> {
        Some(Argon2Params {
            memory_kib: 1024,
            iterations: 1,
            parallelism: 1,
        })
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_string_with_params("s3cret-pass", cheap()).unwrap();
        assert!(hash.starts_with("$argon2id$"));
        assert!(verify_string("s3cret-pass", &hash).unwrap());
        assert!(!verify_string("s3cret-pas", &hash).unwrap());
    }

    #[test]
    fn test_salt_makes_hashes_differ() {
        let first = hash_string_with_params("same", cheap()).unwrap();
        let second = hash_string_with_params("same", cheap()).unwrap();
        assert_ne!(first, second);
        assert!(verify_string("same", &first).unwrap());
        assert!(verify_string("same", &second).unwrap());
    }

    #[test]
    fn test_default_cost_hash_verifies() {
        let hash = hash_string("default-cost").unwrap();
        assert!(verify_string("default-cost", &hash).unwrap());
    }

    #[test]
    fn test_garbage_hash_is_an_error() {
        assert!(verify_string("anything", "not-a-phc-string").is_err());
    }

    #[test]
    fn test_reset_token_shape() {
        let token = generate_reset_token();
        assert_eq!(token.len(), 43);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, generate_reset_token());
    }

    #[test]
    fn test_password_policy() {
        let policy = PasswordConfig::default();
        assert!(validate_new_password("longenough", Some("longenough"), &policy).is_ok());
        assert!(validate_new_password("longenough", Some("different!"), &policy).is_err());
        assert!(validate_new_password("short", None, &policy).is_err());
        assert!(validate_new_password(&"x".repeat(policy.max_length + 1), None, &policy).is_err());
    }
}
