pub mod fetcher;

pub use fetcher::{chunk_range, ChunkFetcher, ChunkPayload, ChunkRange, FetchError, FetchPolicy};
