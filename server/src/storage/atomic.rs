use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;

/// Write `content` to `path` atomically: unique sibling temp file, fsync,
/// rename.
///
/// Readers see either the old file or one complete new one, also when several
/// writers race on the same path.
pub fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;

    // Dropped (and removed) on any error before persist
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;

    // Rename to final path (atomic on most filesystems)
    temp.persist(path).map_err(|e| e.error)?;
    tracing::debug!(path = %path.display(), bytes = content.len(), "atomic write");
    Ok(())
}
