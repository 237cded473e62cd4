pub mod atomic;
pub mod cas;
pub mod chunking;
pub mod fast_hash;
pub mod paths;

pub use atomic::write_atomic;
pub use chunking::{chunk_spans, digest_file, ChunkSpan, FileDigest, DEFAULT_CHUNK_SIZE};
pub use fast_hash::{select_fast_hasher, FastHashKind, FastHasher};
pub use paths::{normalize_relative_path, safe_join, PathError};
