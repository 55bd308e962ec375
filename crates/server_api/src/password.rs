use rand::{rngs::OsRng, RngCore};
use subtle::ConstantTimeEq;

const SALT_LEN: usize = 16;
const HASH_CONTEXT: &str = "parley password-hash v1";

/// Hashes a password with a fresh random salt. The stored form is
/// `hex(salt)$hex(digest)`.
pub fn hash_password(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let digest = salted_digest(&salt, password);
    format!("{}${}", hex::encode(salt), hex::encode(digest))
}

/// Verifies a password against a stored hash in constant time. Malformed
/// stored values verify as false rather than erroring.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let Some((salt_hex, digest_hex)) = stored.split_once('$') else {
        return false;
    };
    let Ok(salt) = hex::decode(salt_hex) else {
        return false;
    };
    let Ok(expected) = hex::decode(digest_hex) else {
        return false;
    };
    let computed = salted_digest(&salt, password);
    expected.len() == computed.len() && bool::from(computed.as_slice().ct_eq(&expected))
}

fn salted_digest(salt: &[u8], password: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new_derive_key(HASH_CONTEXT);
    hasher.update(salt);
    hasher.update(password.as_bytes());
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verifies_its_own_hashes() {
        let stored = hash_password("hunter2");
        assert!(verify_password("hunter2", &stored));
    }

    #[test]
    fn rejects_a_wrong_password() {
        let stored = hash_password("hunter2");
        assert!(!verify_password("hunter3", &stored));
    }

    #[test]
    fn salts_make_equal_passwords_hash_differently() {
        assert_ne!(hash_password("hunter2"), hash_password("hunter2"));
    }

    #[test]
    fn rejects_malformed_stored_values() {
        assert!(!verify_password("hunter2", ""));
        assert!(!verify_password("hunter2", "no-separator"));
        assert!(!verify_password("hunter2", "zz$zz"));
        assert!(!verify_password("hunter2", "abcd$1234"));
    }
}
