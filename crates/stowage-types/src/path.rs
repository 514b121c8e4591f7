//! Logical path normalization.
//!
//! Every driver speaks the same path dialect: slash-separated, rooted at
//! `/`, with a trailing slash distinguishing a directory reference from a
//! file reference. Backslashes are folded to `/`, repeated slashes collapse,
//! and `..` segments are rejected outright — drivers never resolve relative
//! traversal against a remote backend.

use crate::error::{ErrorCode, Result, StorageError};

/// Normalize a raw path.
///
/// `as_directory` forces (`Some(true)`) or strips (`Some(false)`) the
/// trailing slash; `None` preserves whatever the caller wrote.
pub fn normalize(raw: &str, as_directory: Option<bool>) -> Result<String> {
    let unified = raw.replace('\\', "/");
    let had_trailing = unified.ends_with('/');

    let mut segments = Vec::new();
    for seg in unified.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        if seg == ".." {
            return Err(StorageError::new(
                ErrorCode::DotsInPath,
                format!("path must not contain '..' segments: {raw}"),
            ));
        }
        segments.push(seg);
    }

    if segments.is_empty() {
        return Ok("/".to_string());
    }

    let mut out = String::with_capacity(unified.len() + 1);
    out.push('/');
    out.push_str(&segments.join("/"));

    let want_trailing = match as_directory {
        Some(v) => v,
        None => had_trailing,
    };
    if want_trailing {
        out.push('/');
    }
    Ok(out)
}

/// Whether a normalized path is the root.
pub fn is_root(path: &str) -> bool {
    path == "/"
}

/// Parent directory of a normalized path, always with a trailing slash.
pub fn parent(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => format!("{}/", &trimmed[..idx]),
    }
}

/// Final segment of a normalized path; empty for the root.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Final segment, failing with `EMPTY_NAME` when the path has none.
pub fn require_name(path: &str) -> Result<&str> {
    let name = file_name(path);
    if name.is_empty() {
        return Err(StorageError::new(
            ErrorCode::EmptyName,
            format!("path has no name component: {path}"),
        ));
    }
    Ok(name)
}

/// Join a normalized directory path and a child name.
pub fn join(dir: &str, name: &str) -> String {
    let base = dir.trim_end_matches('/');
    format!("{base}/{name}")
}

/// Strip the leading slash for backends that address repo-relative paths.
pub fn strip_root(path: &str) -> &str {
    path.trim_start_matches('/')
}
