//! Synthetic manifests for games with no content source
//!
//! Chunk `i` of file `f` is the first `size` bytes of the seeded stream for
//! `"{game_id}:{file_id}:{i}"`, so the CDN can serve bytes that verify.

use sha2::{Digest, Sha256};

use super::builder::{file_entry, CdnHosts};
use super::model::{Manifest, ManifestIdentity};
use crate::storage::cas::{chunk_hash_of_bytes, file_id_for, seeded_bytes, seeded_stream, HASH_BLOCK_SIZE};
use crate::storage::chunking::{ChunkDigest, FileDigest};
use crate::storage::chunk_spans;

const STUB_MIN_SIZE: u64 = 64 * 1024;
const STUB_SIZE_SPREAD: u64 = 3 * 1024 * 1024;

pub fn stub_seed(game_id: &str, file_id: &str, index: u32) -> String {
    format!("{game_id}:{file_id}:{index}")
}

pub fn stub_chunk_bytes(game_id: &str, file_id: &str, index: u32, size: u64) -> Vec<u8> {
    seeded_bytes(&stub_seed(game_id, file_id, index), size)
}

fn stub_paths(slug: &str) -> Vec<String> {
    vec![
        format!("bin/{slug}.bin"),
        "data/content.pak".to_string(),
        "readme.txt".to_string(),
    ]
}

fn stub_size(identity: &ManifestIdentity, path: &str) -> u64 {
    let digest = chunk_hash_of_bytes(format!("{}:{}:{path}", identity.game_id, identity.slug).as_bytes());
    let n = u64::from_str_radix(&digest[..8], 16).unwrap_or(0);
    STUB_MIN_SIZE + n % STUB_SIZE_SPREAD
}

fn stub_digest(game_id: &str, file_id: &str, size: u64, chunk_size: u64) -> FileDigest {
    let mut file_hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];
    let mut chunks = Vec::new();
    for span in chunk_spans(size, chunk_size) {
        let mut stream = seeded_stream(&stub_seed(game_id, file_id, span.index));
        let mut chunk_hasher = Sha256::new();
        let mut remaining = span.size;
        while remaining > 0 {
            let take = remaining.min(HASH_BLOCK_SIZE as u64) as usize;
            stream.fill(&mut buffer[..take]);
            file_hasher.update(&buffer[..take]);
            chunk_hasher.update(&buffer[..take]);
            remaining -= take as u64;
        }
        chunks.push(ChunkDigest {
            span,
            hash: hex::encode(chunk_hasher.finalize()),
        });
    }
    FileDigest {
        size,
        hash: hex::encode(file_hasher.finalize()),
        chunks,
    }
}

/// Deterministic placeholder manifest derived from game id and slug.
pub fn build_stub(identity: &ManifestIdentity, chunk_size: u64, hosts: &CdnHosts) -> Manifest {
    let files = stub_paths(&identity.slug)
        .into_iter()
        .map(|path| {
            let file_id = file_id_for(&path);
            let size = stub_size(identity, &path);
            let digest = stub_digest(&identity.game_id, &file_id, size, chunk_size);
            file_entry(&path, digest, identity, hosts, None)
        })
        .collect();
    let mut manifest = Manifest::new(identity, chunk_size);
    manifest.files = files;
    manifest.finalize()
}
