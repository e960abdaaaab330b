use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `bytes`. This is the unit of comparison for change detection.
pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
