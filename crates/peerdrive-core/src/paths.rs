//! Path normalization for index keys and transfer-table keys.
//!
//! Index keys are watch-path-relative, forward-slash separated, with no
//! leading slash. The transfer table uses a "drive path" form with a leading
//! slash so its keys can never collide with absolute filesystem paths.

use std::path::{Path, PathBuf};

/// Normalize a relative path into index-key form.
///
/// Backslashes become forward slashes, leading slashes and `./` prefixes are
/// stripped, and empty segments collapse.
pub fn normalize(path: &str) -> String {
    let mut out = Vec::new();
    for seg in path.replace('\\', "/").split('/') {
        match seg {
            "" | "." => {}
            other => out.push(other),
        }
    }
    out.join("/")
}

/// Relative index key for `abs` under `root`, or `None` when `abs` is not
/// inside `root`.
pub fn to_rel(root: &Path, abs: &Path) -> Option<String> {
    let stripped = abs.strip_prefix(root).ok()?;
    let mut segs = Vec::new();
    for comp in stripped.components() {
        segs.push(comp.as_os_str().to_str()?);
    }
    if segs.is_empty() {
        return None;
    }
    Some(segs.join("/"))
}

/// Absolute filesystem path for an index key under `root`.
pub fn to_abs(root: &Path, rel: &str) -> PathBuf {
    rel.split('/')
        .filter(|s| !s.is_empty())
        .fold(root.to_path_buf(), |p, seg| p.join(seg))
}

/// Transfer-table key form: the index key with a leading slash.
pub fn drive_path(rel: &str) -> String {
    format!("/{}", normalize(rel))
}

/// Inverse of [`drive_path`].
pub fn from_drive_path(drive: &str) -> &str {
    drive.strip_prefix('/').unwrap_or(drive)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_prefixes() {
        assert_eq!(normalize("a/b.txt"), "a/b.txt");
        assert_eq!(normalize("/a/b.txt"), "a/b.txt");
        assert_eq!(normalize("./a/b.txt"), "a/b.txt");
        assert_eq!(normalize("a//b.txt"), "a/b.txt");
        assert_eq!(normalize("a\\b.txt"), "a/b.txt");
    }

    #[test]
    fn test_normalize_keeps_spaces() {
        assert_eq!(normalize("with space/file name.txt"), "with space/file name.txt");
    }

    #[test]
    fn test_to_rel_inside_root() {
        let root = Path::new("/watch");
        assert_eq!(
            to_rel(root, Path::new("/watch/nested/folder/data.bin")),
            Some("nested/folder/data.bin".to_string())
        );
        assert_eq!(to_rel(root, Path::new("/watch")), None);
        assert_eq!(to_rel(root, Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn test_to_abs_roundtrip() {
        let root = Path::new("/watch");
        let abs = to_abs(root, "nested/folder/data.bin");
        assert_eq!(to_rel(root, &abs), Some("nested/folder/data.bin".to_string()));
    }

    #[test]
    fn test_drive_path_roundtrip() {
        assert_eq!(drive_path("a/b.txt"), "/a/b.txt");
        assert_eq!(from_drive_path("/a/b.txt"), "a/b.txt");
        assert_eq!(from_drive_path("a/b.txt"), "a/b.txt");
    }

    #[test]
    fn test_deep_paths() {
        let rel: String = (0..16).map(|i| format!("d{}", i)).collect::<Vec<_>>().join("/");
        let root = Path::new("/watch");
        let abs = to_abs(root, &rel);
        assert_eq!(to_rel(root, &abs), Some(rel));
    }
}
