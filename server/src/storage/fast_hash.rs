//! Fast re-verification hashes
//!
//! A scan records a cheap hash next to the canonical SHA-256 so the next scan
//! can confirm an unchanged file without paying for SHA-256 again. The hasher
//! is picked once at startup by [`select_fast_hasher`].

use std::fmt;
use std::io::{self, Read};
use std::str::FromStr;
use std::sync::Arc;

use super::cas::HASH_BLOCK_SIZE;

/// Running state of a fast hash.
pub trait FastState: Send {
    fn update(&mut self, data: &[u8]);
    /// Rendered as `"{name}:{hex}"`.
    fn finish(self: Box<Self>) -> String;
}

/// Capability interface for the fast hash tier.
pub trait FastHasher: Send + Sync {
    fn name(&self) -> &'static str;
    fn start(&self) -> Box<dyn FastState>;

    fn hash_reader(&self, reader: &mut dyn Read) -> io::Result<String> {
        let mut state = self.start();
        let mut buffer = vec![0u8; HASH_BLOCK_SIZE];
        loop {
            let read = reader.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            state.update(&buffer[..read]);
        }
        Ok(state.finish())
    }
}

/// BLAKE3, SIMD accelerated on x86_64/aarch64.
pub struct NativeHasher;

struct NativeState(blake3::Hasher);

impl FastState for NativeState {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(self: Box<Self>) -> String {
        format!("blake3:{}", self.0.finalize().to_hex())
    }
}

impl FastHasher for NativeHasher {
    fn name(&self) -> &'static str {
        "blake3"
    }

    fn start(&self) -> Box<dyn FastState> {
        Box::new(NativeState(blake3::Hasher::new()))
    }
}

/// CRC32, table driven, no platform requirements.
pub struct PortableHasher;

struct PortableState(crc32fast::Hasher);

impl FastState for PortableState {
    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finish(self: Box<Self>) -> String {
        format!("crc32:{:08x}", self.0.finalize())
    }
}

impl FastHasher for PortableHasher {
    fn name(&self) -> &'static str {
        "crc32"
    }

    fn start(&self) -> Box<dyn FastState> {
        Box::new(PortableState(crc32fast::Hasher::new()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FastHashKind {
    #[default]
    Auto,
    Native,
    Portable,
}

impl FromStr for FastHashKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(FastHashKind::Auto),
            "native" | "blake3" => Ok(FastHashKind::Native),
            "portable" | "crc32" => Ok(FastHashKind::Portable),
            other => Err(format!("unknown fast hash kind: {other}")),
        }
    }
}

impl fmt::Display for FastHashKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FastHashKind::Auto => "auto",
            FastHashKind::Native => "native",
            FastHashKind::Portable => "portable",
        };
        f.write_str(name)
    }
}

/// Factory used once at startup.
pub fn select_fast_hasher(kind: FastHashKind) -> Arc<dyn FastHasher> {
    let native_preferred = cfg!(any(target_arch = "x86_64", target_arch = "aarch64"));
    let hasher: Arc<dyn FastHasher> = match kind {
        FastHashKind::Native => Arc::new(NativeHasher),
        FastHashKind::Portable => Arc::new(PortableHasher),
        FastHashKind::Auto if native_preferred => Arc::new(NativeHasher),
        FastHashKind::Auto => Arc::new(PortableHasher),
    };
    tracing::info!(requested = %kind, selected = hasher.name(), "fast hasher selected");
    hasher
}
