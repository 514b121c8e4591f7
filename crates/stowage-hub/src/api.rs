//! Wire types and URL construction for the hub HTTP APIs.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde::Deserialize;

use stowage_types::{Result, StorageError};

/// Escape set for one path segment: keep ALPHA / DIGIT / `-._~`, escape
/// separators, percent signs, query metacharacters, spaces and controls.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'%')
    .add(b'?')
    .add(b'#')
    .add(b'/');

pub fn quote_segment(seg: &str) -> String {
    utf8_percent_encode(seg, SEGMENT).to_string()
}

/// Percent-encode a repo-relative path, segment by segment.
pub fn quote_path(path: &str) -> String {
    path.split('/')
        .map(quote_segment)
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether the repo is addressed under `/datasets/...` or `/models/...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HubRepoType {
    #[default]
    Dataset,
    Model,
}

impl HubRepoType {
    pub fn plural(self) -> &'static str {
        match self {
            HubRepoType::Dataset => "datasets",
            HubRepoType::Model => "models",
        }
    }

    /// Prefix used by resolve URLs; models resolve at the bare repo path.
    pub fn resolve_prefix(self) -> &'static str {
        match self {
            HubRepoType::Dataset => "datasets/",
            HubRepoType::Model => "",
        }
    }
}

/// Backend-specific payload of the config envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct HubBackend {
    /// `org/name`.
    pub repo: String,
    #[serde(default = "default_revision")]
    pub revision: String,
    #[serde(default)]
    pub repo_type: HubRepoType,
}

fn default_revision() -> String {
    "main".to_string()
}

/// Repo metadata from the init probe.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoInfo {
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub gated: serde_json::Value,
}

impl RepoInfo {
    /// `gated` is `false`, `"auto"` or `"manual"` on the wire.
    pub fn is_gated(&self) -> bool {
        !matches!(&self.gated, serde_json::Value::Bool(false) | serde_json::Value::Null)
    }
}

/// Access facts cached for 60 s.
#[derive(Debug, Clone, Default)]
pub struct AccessInfo {
    pub is_private: bool,
    pub is_gated: bool,
    pub requires_auth: bool,
}

/// `GET …/refs` response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefsInfo {
    #[serde(default)]
    pub branches: Vec<RefEntry>,
    #[serde(default)]
    pub tags: Vec<RefEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefEntry {
    pub name: String,
}

impl RefsInfo {
    pub fn branch_names(&self) -> Vec<String> {
        self.branches.iter().map(|r| r.name.clone()).collect()
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags.iter().map(|r| r.name.clone()).collect()
    }
}

/// One row of a tree listing or paths-info response.
#[derive(Debug, Clone, Deserialize)]
pub struct TreeEntry {
    pub path: String,
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub lfs: Option<LfsPointer>,
    #[serde(default, rename = "xetHash")]
    pub xet_hash: Option<String>,
    #[serde(default, rename = "lastCommit")]
    pub last_commit: Option<LastCommit>,
}

impl TreeEntry {
    pub fn is_directory(&self) -> bool {
        self.entry_type == "directory"
    }

    /// Content size, preferring the LFS pointer's true size.
    pub fn content_size(&self) -> Option<u64> {
        self.lfs.as_ref().map(|l| l.size).or(self.size)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LfsPointer {
    pub oid: String,
    pub size: u64,
    #[serde(default, rename = "pointerSize")]
    pub pointer_size: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastCommit {
    #[serde(default)]
    pub date: Option<String>,
}

/// Parse the `cursor` query parameter out of an RFC 5988 `Link` header,
/// `<https://…?cursor=X>; rel="next"`.
pub fn next_cursor_from_link(link_header: &str) -> Option<String> {
    for part in link_header.split(',') {
        let part = part.trim();
        if !part.contains("rel=\"next\"") {
            continue;
        }
        let start = part.find('<')? + 1;
        let end = part.find('>')?;
        let raw_url = &part[start..end];
        let parsed = url::Url::parse(raw_url).ok()?;
        for (key, value) in parsed.query_pairs() {
            if key == "cursor" {
                return Some(value.into_owned());
            }
        }
    }
    None
}

/// `/lfs-files` listing page.
#[derive(Debug, Clone, Deserialize)]
pub struct LfsFilesPage {
    #[serde(default)]
    pub lfs_files: Vec<LfsFileRow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LfsFileRow {
    /// Storage-level file oid used by the batch deletion endpoint.
    #[serde(rename = "fileOid")]
    pub file_oid: String,
    /// Content sha256 matching pointers in the tree.
    #[serde(default)]
    pub oid: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

/// Decode a JSON body, preserving the `INVALID_JSON` code with a snippet.
pub fn decode_json<T: serde::de::DeserializeOwned>(body: &str) -> Result<T> {
    serde_json::from_str(body).map_err(|e| {
        StorageError::new(
            stowage_types::ErrorCode::InvalidJson,
            format!("malformed backend JSON: {e}: {}", stowage_types::snippet(body)),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_quoting() {
        assert_eq!(quote_segment("a b"), "a%20b");
        assert_eq!(quote_segment("100%"), "100%25");
        assert_eq!(quote_path("docs/a b/c.txt"), "docs/a%20b/c.txt");
    }

    #[test]
    fn gated_values() {
        let info: RepoInfo = serde_json::from_str(r#"{"private": false, "gated": "auto"}"#)
            .expect("decode");
        assert!(info.is_gated());
        let info: RepoInfo =
            serde_json::from_str(r#"{"private": true, "gated": false}"#).expect("decode");
        assert!(!info.is_gated());
        assert!(info.private);
    }

    #[test]
    fn tree_entry_prefers_lfs_size() {
        let entry: TreeEntry = serde_json::from_str(
            r#"{"path": "big.bin", "type": "file", "size": 134,
                "lfs": {"oid": "abc", "size": 1048576, "pointerSize": 134}}"#,
        )
        .expect("decode");
        assert_eq!(entry.content_size(), Some(1_048_576));
        assert!(!entry.is_directory());
    }

    #[test]
    fn link_header_cursor() {
        let header = r#"<https://hub.example/api/datasets/o/r/tree/main/docs?cursor=eyJwYWdlIjoyfQ%3D%3D&limit=100>; rel="next""#;
        assert_eq!(
            next_cursor_from_link(header).as_deref(),
            Some("eyJwYWdlIjoyfQ==")
        );
        assert!(next_cursor_from_link(r#"<https://x/y>; rel="prev""#).is_none());
        assert!(next_cursor_from_link("garbage").is_none());
    }

    #[test]
    fn decode_json_carries_code() {
        let err = decode_json::<RepoInfo>("{oops").expect_err("bad json");
        assert_eq!(err.code(), stowage_types::ErrorCode::InvalidJson);
    }
}
