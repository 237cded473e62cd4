use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PathError {
    #[error("empty path")]
    Empty,
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("parent traversal not allowed: {0}")]
    Traversal(String),
    #[error("path contains invalid null byte")]
    NullByte,
}

/// Forward slashes, no leading `/`.
pub fn normalize_relative_path(path: &str) -> String {
    path.trim().replace('\\', "/").trim_start_matches('/').to_string()
}

/// Normalize `rel` and join it under `root`, rejecting escapes.
pub fn safe_join(root: &Path, rel: &str) -> Result<PathBuf, PathError> {
    if rel.contains('\0') {
        return Err(PathError::NullByte);
    }
    // drive letters survive normalization
    if rel.len() >= 2 && rel.as_bytes()[1] == b':' {
        return Err(PathError::Absolute(rel.to_string()));
    }
    let normalized = normalize_relative_path(rel);
    if normalized.is_empty() {
        return Err(PathError::Empty);
    }
    let candidate = Path::new(&normalized);
    for comp in candidate.components() {
        match comp {
            Component::ParentDir => return Err(PathError::Traversal(normalized.clone())),
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(normalized.clone()))
            }
            _ => {}
        }
    }
    Ok(root.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize_relative_path("\\bin\\game.exe"), "bin/game.exe");
        assert_eq!(normalize_relative_path("/data/a.pak"), "data/a.pak");
        assert_eq!(normalize_relative_path("plain.txt"), "plain.txt");
    }

    #[test]
    fn test_safe_join_accepts_nested() {
        let root = Path::new("/games/demo");
        assert_eq!(
            safe_join(root, "/bin\\game.exe").unwrap(),
            PathBuf::from("/games/demo/bin/game.exe")
        );
    }

    #[test]
    fn test_safe_join_rejects_escapes() {
        let root = Path::new("/games/demo");
        assert!(matches!(safe_join(root, "../etc/passwd"), Err(PathError::Traversal(_))));
        assert!(matches!(safe_join(root, "a/../../b"), Err(PathError::Traversal(_))));
        assert!(matches!(safe_join(root, "C:\\Windows"), Err(PathError::Absolute(_))));
        assert_eq!(safe_join(root, ""), Err(PathError::Empty));
        assert_eq!(safe_join(root, "a\0b"), Err(PathError::NullByte));
    }
}
