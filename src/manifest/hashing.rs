//! SHA-256 content identities.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Lowercase hex SHA-256 of `bytes`
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Hash of a file's contents. A missing or unreadable file hashes as empty
/// content.
pub fn file_hash(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => content_hash(&bytes),
        Err(e) => {
            tracing::debug!("Hashing {:?} as empty content: {}", path, e);
            content_hash(&[])
        }
    }
}

/// Hash of an optional file; `None` hashes as empty content
pub fn optional_file_hash(path: Option<&Path>) -> String {
    path.map_or_else(|| content_hash(&[]), file_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn known_digests() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(content_hash(b""), EMPTY);
    }

    #[test]
    fn missing_file_hashes_as_empty() {
        assert_eq!(file_hash(Path::new("/definitely/not/here.csv")), EMPTY);
        assert_eq!(optional_file_hash(None), EMPTY);
    }
}
