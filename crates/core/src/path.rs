//! Fingerprint & Path Service (spec §4.A).
//!
//! Normalizes paths cross-platform, hashes file content, and walks a folder
//! tree honoring ignore patterns. Grounded on `codescope`'s `scan.rs`
//! (`ignore::WalkBuilder`-based parallel walk) and `types.rs::validate_path`
//! (traversal rejection via `canonicalize` + `starts_with`).

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PathError;

/// Directories always excluded from a walk, regardless of caller-supplied
/// ignore patterns (§4.A: "at least node_modules/**, .git/**, and the
/// folder's own metadata directory are excluded").
pub const ALWAYS_IGNORED_DIRS: &[&str] = &["node_modules", ".git"];

/// Name of the per-folder metadata directory (§6 "persisted state layout").
pub const METADATA_DIR_NAME: &str = ".folderd";

/// Content-derived identity of a file: path, hash, size, and mtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFingerprint {
    pub path: PathBuf,
    pub hash: String,
    pub size: u64,
    pub mtime_unix_ms: i64,
}

/// Compute the fingerprint of a single file by streaming its bytes through a
/// cryptographic digest. Deterministic and collision-resistant per the
/// invariant in §3; never buffers the whole file in memory.
pub fn fingerprint(path: &Path) -> Result<FileFingerprint, PathError> {
    let map_io = |source: std::io::Error| PathError::Io { path: path.to_path_buf(), source };

    let metadata = std::fs::metadata(path).map_err(map_io)?;
    let size = metadata.len();
    let mtime_unix_ms = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let mut file = File::open(path).map_err(map_io)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(map_io)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    let hash = hex_encode(&hasher.finalize());

    Ok(FileFingerprint { path: path.to_path_buf(), hash, size, mtime_unix_ms })
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Truncate a hash to a shorter prefix for display only (§4.A).
pub fn short_hash(hash: &str, len: usize) -> &str {
    &hash[..hash.len().min(len)]
}

/// Normalize a path: URL-decode if decodable, resolve to absolute, fold case
/// on case-insensitive filesystems, strip a trailing separator except at the
/// root.
pub fn normalize(path: &Path) -> PathBuf {
    let decoded = url_decode_if_possible(&path.to_string_lossy());
    let candidate = PathBuf::from(decoded);

    let absolute = if candidate.is_absolute() {
        candidate
    } else {
        std::env::current_dir().map(|cwd| cwd.join(&candidate)).unwrap_or(candidate)
    };

    let resolved = absolute.canonicalize().unwrap_or(absolute);

    let mut s = resolved.to_string_lossy().into_owned();
    if fs_is_case_insensitive() {
        s = s.to_lowercase();
    }
    if s.len() > 1 && (s.ends_with('/') || s.ends_with('\\')) {
        s.pop();
    }
    PathBuf::from(s)
}

/// Whether the host filesystem folds case. Windows and macOS default to
/// case-insensitive filesystems; everything else (Linux) is treated as
/// case-sensitive.
fn fs_is_case_insensitive() -> bool {
    cfg!(any(target_os = "windows", target_os = "macos"))
}

fn url_decode_if_possible(s: &str) -> String {
    if !s.contains('%') {
        return s.to_string();
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(byte) = u8::from_str_radix(hex, 16) {
                    out.push(byte);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).unwrap_or_else(|_| s.to_string())
}

/// True iff `child` is a strict sub-path of `parent`: the relative path is
/// non-empty, does not begin with an upward component, and is not itself
/// absolute.
pub fn is_sub_path(child: &Path, parent: &Path) -> bool {
    let child = normalize(child);
    let parent = normalize(parent);
    match child.strip_prefix(&parent) {
        Ok(rel) => {
            !rel.as_os_str().is_empty()
                && !rel.starts_with("..")
                && !rel.is_absolute()
        }
        Err(_) => false,
    }
}

/// Generate a stable, URL-safe document id from a relative path: separators
/// and non-alphanumerics collapse to `-`, leading/trailing `-` are trimmed.
pub fn generate_document_id(relative_path: &str) -> Result<String, PathError> {
    let mut out = String::with_capacity(relative_path.len());
    let mut last_was_dash = false;
    for c in relative_path.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_dash = false;
        } else if !last_was_dash {
            out.push('-');
            last_was_dash = true;
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        return Err(PathError::EmptyDocumentId(relative_path.to_string()));
    }
    Ok(trimmed)
}

/// Walk `root`, honoring `extensions` (empty = all files) and
/// `ignore_patterns` (glob patterns relative to root), always excluding
/// [`ALWAYS_IGNORED_DIRS`] and [`METADATA_DIR_NAME`]. Returns every regular
/// file discovered, in walk order (unspecified across directories).
pub fn walk(
    root: &Path,
    extensions: &[String],
    ignore_patterns: &[String],
) -> Result<Vec<PathBuf>, PathError> {
    let mut overrides = ignore::overrides::OverrideBuilder::new(root);
    for pat in ignore_patterns {
        let _ = overrides.add(&format!("!{pat}"));
    }
    for dir in ALWAYS_IGNORED_DIRS {
        let _ = overrides.add(&format!("!{dir}/**"));
    }
    let _ = overrides.add(&format!("!{METADATA_DIR_NAME}/**"));
    let overrides = overrides
        .build()
        .map_err(|e| PathError::Io { path: root.to_path_buf(), source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e) })?;

    let ext_filter: Option<std::collections::HashSet<&str>> =
        if extensions.is_empty() { None } else { Some(extensions.iter().map(|s| s.as_str()).collect()) };

    let mut out = Vec::new();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .overrides(overrides)
        .build();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let path = entry.path();
        if let Some(exts) = &ext_filter {
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !exts.contains(ext) {
                continue;
            }
        }
        out.push(path.to_path_buf());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn fingerprint_changes_with_content() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "hello").unwrap();
        let fp1 = fingerprint(&file).unwrap();

        fs::write(&file, "hello world").unwrap();
        let fp2 = fingerprint(&file).unwrap();

        assert_ne!(fp1.hash, fp2.hash);
        assert_ne!(fp1.size, fp2.size);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, "stable content").unwrap();
        let fp1 = fingerprint(&file).unwrap();
        let fp2 = fingerprint(&file).unwrap();
        assert_eq!(fp1.hash, fp2.hash);
    }

    #[test]
    fn is_sub_path_rejects_same_path() {
        let dir = tempdir().unwrap();
        assert!(!is_sub_path(dir.path(), dir.path()));
    }

    #[test]
    fn is_sub_path_accepts_strict_descendant() {
        let dir = tempdir().unwrap();
        let child = dir.path().join("child");
        fs::create_dir(&child).unwrap();
        assert!(is_sub_path(&child, dir.path()));
        assert!(!is_sub_path(dir.path(), &child));
    }

    #[test]
    fn document_id_collapses_separators() {
        let id = generate_document_id("src/docs/My File (v2).md").unwrap();
        assert_eq!(id, "src-docs-my-file-v2-md");
    }

    #[test]
    fn document_id_rejects_empty_result() {
        let err = generate_document_id("///").unwrap_err();
        assert!(matches!(err, PathError::EmptyDocumentId(_)));
    }

    #[test]
    fn walk_skips_always_ignored_dirs() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("node_modules")).unwrap();
        fs::write(dir.path().join("node_modules/pkg.js"), "x").unwrap();
        fs::write(dir.path().join("keep.txt"), "x").unwrap();

        let files = walk(dir.path(), &[], &[]).unwrap();
        assert!(files.iter().any(|p| p.ends_with("keep.txt")));
        assert!(!files.iter().any(|p| p.to_string_lossy().contains("node_modules")));
    }

    #[test]
    fn walk_honors_extension_filter() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.md"), "x").unwrap();
        fs::write(dir.path().join("b.bin"), "x").unwrap();

        let files = walk(dir.path(), &["md".to_string()], &[]).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("a.md"));
    }
}
