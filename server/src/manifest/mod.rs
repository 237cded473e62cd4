//! Manifest building, resolution and caching

pub mod archive;
pub mod builder;
pub mod cache;
pub mod catalog;
pub mod model;
pub mod service;
pub mod stub;

pub use builder::{build_from_archive_index, build_from_directory, BuildError, CdnHosts};
pub use model::{ChunkEntry, FileEntry, InstallMode, Manifest, ManifestIdentity, ManifestSummary};
pub use service::{ManifestError, ManifestOrigin, ManifestService, ResolvedManifest};
