//! Fixed-size chunking with SHA-256 per chunk
//!
//! Chunk `i` of a file covers `[i * chunk_size, min((i + 1) * chunk_size, size))`.
//! The whole-file hash is computed over the same byte stream in the same
//! pass, so it never depends on chunk boundaries.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use super::cas::{chunk_hash_of_bytes, HASH_BLOCK_SIZE};

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Position of one chunk within a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: u32,
    pub offset: u64,
    pub size: u64,
}

impl ChunkSpan {
    /// End offset (exclusive) of this chunk
    pub fn end_offset(&self) -> u64 {
        self.offset + self.size
    }
}

/// A hashed chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDigest {
    pub span: ChunkSpan,
    pub hash: String,
}

/// Result of chunking a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub hash: String,
    pub chunks: Vec<ChunkDigest>,
}

/// Layout of a `size`-byte file. A zero-byte file has no chunks.
pub fn chunk_spans(size: u64, chunk_size: u64) -> Vec<ChunkSpan> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut spans = Vec::with_capacity(size.div_ceil(chunk_size) as usize);
    let mut offset = 0u64;
    let mut index = 0u32;
    while offset < size {
        let len = chunk_size.min(size - offset);
        spans.push(ChunkSpan { index, offset, size: len });
        offset += len;
        index += 1;
    }
    spans
}

/// Hash a reader as a file: whole-file digest plus one digest per chunk.
pub fn digest_reader<R: Read>(mut reader: R, chunk_size: u64) -> io::Result<FileDigest> {
    assert!(chunk_size > 0, "chunk_size must be positive");
    let mut file_hasher = Sha256::new();
    let mut chunk_hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BLOCK_SIZE];
    let mut chunks = Vec::new();
    let mut total = 0u64;
    let mut chunk_offset = 0u64;
    let mut in_chunk = 0u64;

    loop {
        let want = (chunk_size - in_chunk).min(HASH_BLOCK_SIZE as u64) as usize;
        let read = reader.read(&mut buffer[..want])?;
        if read == 0 {
            break;
        }
        file_hasher.update(&buffer[..read]);
        chunk_hasher.update(&buffer[..read]);
        in_chunk += read as u64;
        total += read as u64;

        if in_chunk == chunk_size {
            let hash = hex::encode(std::mem::take(&mut chunk_hasher).finalize());
            chunks.push(ChunkDigest {
                span: ChunkSpan {
                    index: chunks.len() as u32,
                    offset: chunk_offset,
                    size: in_chunk,
                },
                hash,
            });
            chunk_offset += in_chunk;
            in_chunk = 0;
        }
    }

    if in_chunk > 0 {
        chunks.push(ChunkDigest {
            span: ChunkSpan {
                index: chunks.len() as u32,
                offset: chunk_offset,
                size: in_chunk,
            },
            hash: hex::encode(chunk_hasher.finalize()),
        });
    }

    Ok(FileDigest {
        size: total,
        hash: hex::encode(file_hasher.finalize()),
        chunks,
    })
}

/// Chunk a file from disk in one streaming pass.
pub fn digest_file(path: &Path, chunk_size: u64) -> io::Result<FileDigest> {
    let file = File::open(path)?;
    digest_reader(BufReader::with_capacity(HASH_BLOCK_SIZE, file), chunk_size)
}

/// Chunk in-memory data.
pub fn digest_bytes(data: &[u8], chunk_size: u64) -> FileDigest {
    let chunks = chunk_spans(data.len() as u64, chunk_size)
        .into_iter()
        .map(|span| ChunkDigest {
            hash: chunk_hash_of_bytes(&data[span.offset as usize..span.end_offset() as usize]),
            span,
        })
        .collect();
    FileDigest {
        size: data.len() as u64,
        hash: chunk_hash_of_bytes(data),
        chunks,
    }
}

/// Reassemble chunks, given in index order, into complete file data
pub fn reassemble_chunks(chunks: &[(&str, &[u8])], expected_size: u64) -> io::Result<Vec<u8>> {
    let mut result = Vec::with_capacity(expected_size as usize);

    for (expected_hash, data) in chunks {
        let actual_hash = chunk_hash_of_bytes(data);
        if actual_hash != *expected_hash {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "Chunk hash mismatch: expected {}, got {}",
                    expected_hash, actual_hash
                ),
            ));
        }
        result.extend_from_slice(data);
    }

    if result.len() as u64 != expected_size {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "Size mismatch: expected {} bytes, got {}",
                expected_size,
                result.len()
            ),
        ));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 253) as u8).collect()
    }

    #[test]
    fn test_spans_cover_file_exactly() {
        let spans = chunk_spans(2_500, 1_000);
        assert_eq!(spans.len(), 3);
        assert_eq!(spans.iter().map(|s| s.size).sum::<u64>(), 2_500);
        assert!(spans[..2].iter().all(|s| s.size == 1_000));
        assert_eq!(spans[2], ChunkSpan { index: 2, offset: 2_000, size: 500 });
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        assert!(chunk_spans(0, 1024).is_empty());
        let digest = digest_bytes(b"", 1024);
        assert!(digest.chunks.is_empty());
        assert_eq!(digest.hash, chunk_hash_of_bytes(b""));
    }

    #[test]
    fn test_exact_multiple_has_no_tail() {
        let spans = chunk_spans(4096, 1024);
        assert_eq!(spans.len(), 4);
        assert!(spans.iter().all(|s| s.size == 1024));
    }

    #[test]
    fn test_streaming_digest_matches_in_memory() {
        // chunk size deliberately not a multiple of the read block
        let data = pattern(HASH_BLOCK_SIZE * 2 + 12_345);
        let chunk_size = 700_001;
        let streamed = digest_reader(&data[..], chunk_size).unwrap();
        let in_memory = digest_bytes(&data, chunk_size);
        assert_eq!(streamed, in_memory);
    }

    #[test]
    fn test_file_hash_independent_of_chunking() {
        let data = pattern(10_000);
        let a = digest_bytes(&data, 1_000);
        let b = digest_bytes(&data, 3_333);
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.chunks.len(), b.chunks.len());

        let pieces: Vec<(&str, &[u8])> = a
            .chunks
            .iter()
            .map(|c| (c.hash.as_str(), &data[c.span.offset as usize..c.span.end_offset() as usize]))
            .collect();
        let rebuilt = reassemble_chunks(&pieces, data.len() as u64).unwrap();
        assert_eq!(chunk_hash_of_bytes(&rebuilt), a.hash);
    }

    #[test]
    fn test_reassemble_rejects_bad_chunk() {
        let data = pattern(2_000);
        let digest = digest_bytes(&data, 1_000);
        let pieces: Vec<(&str, &[u8])> = vec![
            (digest.chunks[0].hash.as_str(), &data[1_000..]),
            (digest.chunks[1].hash.as_str(), &data[..1_000]),
        ];
        assert!(reassemble_chunks(&pieces, 2_000).is_err());
    }

    #[test]
    fn test_digest_file_from_disk() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("blob.bin");
        let data = pattern(5_000);
        std::fs::write(&path, &data).unwrap();
        assert_eq!(digest_file(&path, 2_048).unwrap(), digest_bytes(&data, 2_048));
    }
}
