use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::{AppError, Res};

const MIN_SECRET_LEN: usize = 30;

type HmacSha256 = Hmac<Sha256>;

/// Keyed hash used to store API key secrets. Only hashes ever reach the store.
#[derive(Clone)]
pub struct Hasher {
    /// Keyed once at startup, cloned per hash.
    mac: HmacSha256,
}

impl Hasher {
    pub fn new(secret: &str) -> Res<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(AppError::Validation(format!(
                "hash salt is too short, need at least {} chars",
                MIN_SECRET_LEN
            )));
        }
        let mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| AppError::Validation(format!("wrong hash salt: {}", e)))?;
        Ok(Self { mac })
    }

    pub fn hash_key(&self, key: &str) -> String {
        let mut mac = self.mac.clone();
        mac.update(key.as_bytes());
        URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
    }
}

impl std::fmt::Debug for Hasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hasher").finish_non_exhaustive()
    }
}

/// Random secret for a newly issued key.
pub fn generate_secret() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALT: &str = "0123456789012345678901234567890123456789";

    #[test]
    fn rejects_short_salt() {
        assert!(Hasher::new("short").is_err());
    }

    #[test]
    fn hash_is_stable_and_salted() {
        let a = Hasher::new(SALT).unwrap();
        let b = Hasher::new(&format!("{}x", SALT)).unwrap();
        assert_eq!(a.hash_key("key"), a.hash_key("key"));
        assert_ne!(a.hash_key("key"), a.hash_key("key2"));
        assert_ne!(a.hash_key("key"), b.hash_key("key"));
        assert!(!a.hash_key("key").contains("key"));
    }

    #[test]
    fn matches_plain_hmac() {
        let hasher = Hasher::new(SALT).unwrap();
        // reuse of the keyed state must not leak between calls
        hasher.hash_key("warm-up");
        let mut mac = HmacSha256::new_from_slice(SALT.as_bytes()).unwrap();
        mac.update(b"key");
        assert_eq!(hasher.hash_key("key"), URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()));
    }

    #[test]
    fn secrets_are_unique() {
        let s = generate_secret();
        assert_eq!(s.len(), 64);
        assert_ne!(s, generate_secret());
    }
}
