//! Wire types for the Contents and Git Database APIs.

use serde::{Deserialize, Serialize};

use stowage_types::{ErrorCode, Result, StorageError};

/// Backend-specific payload of the config envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct GitHostBackend {
    pub owner: String,
    pub repo: String,
    /// Branch, tag or commit id; only branches accept writes.
    #[serde(default = "default_reference")]
    pub reference: String,
    /// Raw-content CDN base; rewritten through `cdn_proxy` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_endpoint: Option<String>,
    /// Optional proxy base that replaces the raw CDN host.
    #[serde(default)]
    pub cdn_proxy: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
}

fn default_reference() -> String {
    "main".to_string()
}

/// `GET /repos/{owner}/{repo}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepoMeta {
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub default_branch: Option<String>,
    /// Repository size in kilobytes; zero usually means an empty repo.
    #[serde(default)]
    pub size: u64,
}

/// One entry of a Contents-API directory listing.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentsEntry {
    pub name: String,
    pub path: String,
    pub sha: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "type")]
    pub entry_type: String,
}

impl ContentsEntry {
    pub fn is_dir(&self) -> bool {
        self.entry_type == "dir"
    }

    pub fn is_submodule(&self) -> bool {
        self.entry_type == "submodule"
    }
}

/// `GET …/contents/{path}` with `Accept: application/vnd.github.object+json`.
#[derive(Debug, Clone, Deserialize)]
pub struct ContentsObject {
    #[serde(rename = "type")]
    pub object_type: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub entries: Option<Vec<ContentsEntry>>,
}

/// `GET …/git/ref/heads/{branch}`.
#[derive(Debug, Deserialize)]
pub struct GitRef {
    pub object: GitRefObject,
}

#[derive(Debug, Deserialize)]
pub struct GitRefObject {
    pub sha: String,
}

/// `GET …/git/commits/{sha}`.
#[derive(Debug, Deserialize)]
pub struct GitCommit {
    pub tree: GitTreeRef,
}

#[derive(Debug, Deserialize)]
pub struct GitTreeRef {
    pub sha: String,
}

/// `GET …/git/trees/{sha}`.
#[derive(Debug, Deserialize)]
pub struct GitTree {
    pub sha: String,
    pub tree: Vec<GitTreeEntry>,
    #[serde(default)]
    pub truncated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitTreeEntry {
    pub path: String,
    pub mode: String,
    /// `blob`, `tree` or `commit` (submodule).
    #[serde(rename = "type")]
    pub entry_type: String,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

impl GitTreeEntry {
    pub fn is_blob(&self) -> bool {
        self.entry_type == "blob"
    }

    pub fn is_submodule(&self) -> bool {
        self.entry_type == "commit"
    }
}

/// A recursive tree marked `truncated` cannot back bulk operations; any
/// copy/move/delete built on it would be silently incomplete.
pub fn reject_truncated(tree: &GitTree) -> Result<()> {
    if tree.truncated {
        return Err(StorageError::new(
            ErrorCode::TreeTruncated,
            "the recursive tree listing was truncated by the backend",
        ));
    }
    Ok(())
}

/// `POST …/git/blobs` response.
#[derive(Debug, Deserialize)]
pub struct CreatedObject {
    pub sha: String,
}

/// One entry of a `POST …/git/trees` request.
#[derive(Debug, Serialize)]
pub struct NewTreeEntry {
    pub path: String,
    pub mode: &'static str,
    #[serde(rename = "type")]
    pub entry_type: &'static str,
    /// `None` serializes as `null`, deleting the path from the tree.
    pub sha: Option<String>,
}

impl NewTreeEntry {
    pub fn blob(path: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: "100644",
            entry_type: "blob",
            sha: Some(sha.into()),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mode: "100644",
            entry_type: "blob",
            sha: None,
        }
    }
}

/// `GET …/commits?path=…&per_page=1` row.
#[derive(Debug, Deserialize)]
pub struct CommitListRow {
    pub commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
pub struct CommitDetail {
    #[serde(default)]
    pub committer: Option<CommitSignature>,
}

#[derive(Debug, Deserialize)]
pub struct CommitSignature {
    #[serde(default)]
    pub date: Option<String>,
}

/// Submodule entries get a distinct mimetype so front ends can render them
/// as read-only.
pub const SUBMODULE_MIMETYPE: &str = "application/vnd.git.submodule";

pub fn submodule_error(path: &str) -> StorageError {
    StorageError::new(
        ErrorCode::SubmoduleUnsupported,
        format!("{path} is a submodule; submodules are read-only markers"),
    )
}
