//! Password policy and hashing

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use common::error::{Error, Result};

/// Minimum password length in characters
pub const MIN_LENGTH: usize = 8;

/// Check the password policy: length, lowercase, uppercase, digit and symbol
pub fn check_policy(password: &str) -> Result<()> {
    let long_enough = password.chars().count() >= MIN_LENGTH;
    let has_lower = password.chars().any(|c| c.is_lowercase());
    let has_upper = password.chars().any(|c| c.is_uppercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password
        .chars()
        .any(|c| !c.is_alphanumeric() && !c.is_whitespace());

    if long_enough && has_lower && has_upper && has_digit && has_symbol {
        Ok(())
    } else {
        Err(Error::InvalidInput(
            "Password must be at least 8 characters and contain lowercase, uppercase, digit and symbol characters".to_string(),
        ))
    }
}

/// Hash a password with argon2 and a random salt
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::encode_b64(uuid::Uuid::new_v4().as_bytes())
        .map_err(|e| Error::Internal(format!("failed to create password salt: {}", e)))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| Error::Internal(format!("password hash failed: {}", e)))?
        .to_string();
    Ok(hash)
}

/// Verify a password against a stored hash
pub fn verify_password(stored: &str, password: &str) -> bool {
    let parsed = match PasswordHash::new(stored) {
        Ok(v) => v,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_requires_every_class() {
        assert!(check_policy("Aaaaaaa1!").is_ok());
        assert!(check_policy("Aa1!").is_err());
        assert!(check_policy("aaaaaaa1!").is_err());
        assert!(check_policy("AAAAAAA1!").is_err());
        assert!(check_policy("Aaaaaaaa!").is_err());
        assert!(check_policy("Aaaaaaaa1").is_err());
        assert!(check_policy("Aaaa aaa1").is_err());
    }

    #[test]
    fn hash_round_trip() {
        let hash = hash_password("Aaaaaaa1!").unwrap();
        assert!(verify_password(&hash, "Aaaaaaa1!"));
        assert!(!verify_password(&hash, "Aaaaaaa1?"));
        assert!(!verify_password("not-a-hash", "Aaaaaaa1!"));
    }
}
