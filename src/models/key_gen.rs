use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Default relay key prefix
pub const DEFAULT_KEY_PREFIX: &str = "tg_live_";

/// Generate a new relay key with the given prefix.
///
/// Returns a tuple of (raw_key, key_hash) where:
/// - raw_key is the full key to show the caller (only shown once on creation)
/// - key_hash is the SHA-256 hash to store in the database
pub fn generate_key_with_prefix(prefix: &str) -> (String, String) {
    // 32 random bytes (256 bits of entropy)
    let mut rng = rand::thread_rng();
    let mut random_bytes = [0u8; 32];
    rng.fill(&mut random_bytes);

    let random_part = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(random_bytes);
    let raw_key = format!("{}{}", prefix, random_part);
    let key_hash = hash_key(&raw_key);

    (raw_key, key_hash)
}

/// Generate a new relay key with the default prefix `tg_live_`.
pub fn generate_key() -> (String, String) {
    generate_key_with_prefix(DEFAULT_KEY_PREFIX)
}

/// Hash a relay key using SHA-256.
///
/// Returns the hex-encoded hash for storage in the database. Hashing is
/// deterministic, so the hash doubles as the cache index for the key.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let result = hasher.finalize();
    hex::encode(result)
}

/// Verify that a raw key matches a stored hash using constant-time comparison.
pub fn verify_key(raw_key: &str, stored_hash: &str) -> bool {
    let computed_hash = hash_key(raw_key);
    computed_hash
        .as_bytes()
        .ct_eq(stored_hash.as_bytes())
        .into()
}

/// Check if a relay key has a valid prefix using constant-time comparison.
///
/// Always takes the same amount of time regardless of how many characters
/// match, preventing timing attacks.
pub fn has_valid_prefix(key: &str, expected_prefix: &str) -> bool {
    // Compare raw bytes; slicing the str would panic when a multi-byte
    // character straddles the prefix boundary
    let key = key.as_bytes();
    let prefix = expected_prefix.as_bytes();
    if key.len() < prefix.len() {
        return false;
    }
    key[..prefix.len()].ct_eq(prefix).into()
}
