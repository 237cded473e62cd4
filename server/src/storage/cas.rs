//! Content Addressable Storage (CAS) utilities using SHA-256
//!
//! Canonical digests for files, chunks and manifests. Every digest is a
//! lowercase hex-encoded SHA-256 (64 chars); identical bytes always give
//! identical digests, so hashes double as cache keys.

use sha2::{Digest, Sha256};
use std::io::{self, Read};
use std::path::Path;

/// Read granularity for streaming hashes.
pub const HASH_BLOCK_SIZE: usize = 1024 * 1024;

/// Length of a `file_id` in hex chars.
pub const FILE_ID_LEN: usize = 12;

/// Compute the SHA-256 of one chunk's bytes.
pub fn chunk_hash_of_bytes(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Streaming SHA-256 over a reader, in `HASH_BLOCK_SIZE` blocks.
pub fn file_hash<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn file_hash_path(path: &Path) -> io::Result<String> {
    file_hash(std::fs::File::open(path)?)
}

/// Verify that content matches expected hash (case-insensitive on the expected side)
pub fn verify_hash(content: &[u8], expected_hash: &str) -> bool {
    chunk_hash_of_bytes(content) == expected_hash.trim().to_ascii_lowercase()
}

/// Short stable identifier derived from a normalized relative path.
pub fn file_id_for(path: &str) -> String {
    let mut id = chunk_hash_of_bytes(path.as_bytes());
    id.truncate(FILE_ID_LEN);
    id
}

/// Deterministic pseudo-random byte stream for `seed` (BLAKE3 XOF).
///
/// Only used for synthetic manifests; never for real content.
pub fn seeded_stream(seed: &str) -> blake3::OutputReader {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"depot-synthetic-v1:");
    hasher.update(seed.as_bytes());
    hasher.finalize_xof()
}

/// Materialize the first `size` bytes of `seeded_stream(seed)`.
pub fn seeded_bytes(seed: &str, size: u64) -> Vec<u8> {
    let mut out = vec![0u8; size as usize];
    seeded_stream(seed).fill(&mut out);
    out
}

/// SHA-256 over the first `size` bytes of `seeded_stream(seed)`, streamed.
pub fn seeded_chunk_hash(seed: &str, size: u64) -> String {
    let mut stream = seeded_stream(seed);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];
    let mut remaining = size;
    while remaining > 0 {
        let take = remaining.min(HASH_BLOCK_SIZE as u64) as usize;
        stream.fill(&mut buffer[..take]);
        hasher.update(&buffer[..take]);
        remaining -= take as u64;
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_hash_of_bytes() {
        let hash = chunk_hash_of_bytes(b"hello world");

        // SHA-256 for "hello world"
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn test_empty_content() {
        assert_eq!(
            chunk_hash_of_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_verify_hash() {
        let hash = "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9";
        assert!(verify_hash(b"hello world", hash));
        assert!(!verify_hash(b"hello world", "invalid"));
    }

    #[test]
    fn test_streaming_matches_one_shot() {
        let data: Vec<u8> = (0..(HASH_BLOCK_SIZE * 2 + 17)).map(|i| (i % 251) as u8).collect();
        assert_eq!(file_hash(&data[..]).unwrap(), chunk_hash_of_bytes(&data));
    }

    #[test]
    fn test_file_id_is_short_and_stable() {
        let a = file_id_for("bin/game.exe");
        assert_eq!(a.len(), FILE_ID_LEN);
        assert_eq!(a, file_id_for("bin/game.exe"));
        assert_ne!(a, file_id_for("bin/game.dll"));
    }

    #[test]
    fn test_seeded_hash_matches_materialized_bytes() {
        let size = (HASH_BLOCK_SIZE + 4096) as u64;
        let bytes = seeded_bytes("demo:abc:0", size);
        assert_eq!(bytes.len() as u64, size);
        assert_eq!(seeded_chunk_hash("demo:abc:0", size), chunk_hash_of_bytes(&bytes));
        assert_ne!(seeded_chunk_hash("demo:abc:1", size), chunk_hash_of_bytes(&bytes));
    }
}
