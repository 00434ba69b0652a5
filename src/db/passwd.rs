//! Password hash primitive.
//!
//! The rest of the daemon treats this as an opaque verify/hash pair; only
//! the SASL path and account provisioning call in here.

use bcrypt::DEFAULT_COST;

/// Check a candidate password against a stored bcrypt hash. A malformed
/// hash counts as a mismatch.
pub fn verify(candidate: &str, hash: &str) -> bool {
    bcrypt::verify(candidate, hash).unwrap_or(false)
}

/// Hash a password for storage.
pub fn hash(password: &str) -> Result<String, bcrypt::BcryptError> {
    bcrypt::hash(password, DEFAULT_COST)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let hashed = hash("pw").unwrap();
        assert!(verify("pw", &hashed));
        assert!(!verify("other", &hashed));
    }

    #[test]
    fn malformed_hash_is_mismatch() {
        assert!(!verify("pw", "not-a-bcrypt-hash"));
    }
}
