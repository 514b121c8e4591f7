//! Operation inputs and outputs shared across the driver contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which backend family a driver belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    HubDataset,
    GitHost,
    MessageAttachment,
    Webdav,
    HttpMirror,
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriverKind::HubDataset => write!(f, "hub_dataset"),
            DriverKind::GitHost => write!(f, "git_host"),
            DriverKind::MessageAttachment => write!(f, "message_attachment"),
            DriverKind::Webdav => write!(f, "webdav"),
            DriverKind::HttpMirror => write!(f, "http_mirror"),
        }
    }
}

impl std::str::FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hub_dataset" | "hub" => Ok(DriverKind::HubDataset),
            "git_host" | "github" => Ok(DriverKind::GitHost),
            "message_attachment" | "discord" => Ok(DriverKind::MessageAttachment),
            "webdav" | "dav" => Ok(DriverKind::Webdav),
            "http_mirror" | "mirror" => Ok(DriverKind::HttpMirror),
            _ => anyhow::bail!("unknown driver kind: {}", s),
        }
    }
}

/// One entry as returned by `stat` and `list_directory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatRecord {
    /// Normalized logical path.
    pub path: String,
    /// Display name (final path segment, percent-decoded where relevant).
    pub name: String,
    pub is_directory: bool,
    /// `None` means unknown; callers render it as "—".
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
    pub mimetype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_backend: Option<DriverKind>,
}

impl StatRecord {
    /// A directory record with the conventional mimetype.
    pub fn directory(path: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            is_directory: true,
            size: None,
            modified: None,
            mimetype: "application/x-directory".to_string(),
            etag: None,
            storage_backend: None,
        }
    }

    /// A file record; mimetype is guessed from the name.
    pub fn file(path: impl Into<String>, name: impl Into<String>, size: Option<u64>) -> Self {
        let name = name.into();
        let mimetype = guess_mimetype(&name);
        Self {
            path: path.into(),
            name,
            is_directory: false,
            size,
            modified: None,
            mimetype,
            etag: None,
            storage_backend: None,
        }
    }
}

/// Extension-based mimetype with a binary fallback.
pub fn guess_mimetype(name: &str) -> String {
    mime_guess::from_path(name)
        .first_raw()
        .unwrap_or("application/octet-stream")
        .to_string()
}

/// Options for `list_directory`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListOptions {
    /// Request a single page instead of the accumulated listing.
    #[serde(default)]
    pub paged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Bypass the driver's listing caches.
    #[serde(default)]
    pub refresh: bool,
}

/// Result of `list_directory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirListing {
    pub items: Vec<StatRecord>,
    pub is_root: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_more: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Options for `generate_direct_link`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkOptions {
    pub force_download: bool,
}

/// How a download URL may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    /// Directly usable by a browser without credentials.
    NativeDirect,
    /// Must be fetched through the orchestrator's proxy.
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadLink {
    pub url: String,
    pub kind: LinkKind,
}

/// Options for `upload_file`.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadOutcome {
    /// Echoes the caller's path convention byte-for-byte.
    pub storage_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOutcome {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDirOutcome {
    pub path: String,
    pub already_existed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Success,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub status: TransferStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TransferOutcome {
    pub fn success() -> Self {
        Self { status: TransferStatus::Success, error: None }
    }

    pub fn skipped() -> Self {
        Self { status: TransferStatus::Skipped, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { status: TransferStatus::Failed, error: Some(error.into()) }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    pub skip_existing: bool,
}

/// One per-path failure from `batch_remove_items`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveFailure {
    pub path: String,
    pub error: String,
}

/// Result of `batch_remove_items`; partial failure is reported per path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRemoveReport {
    pub success: Vec<String>,
    pub failed: Vec<RemoveFailure>,
    /// Non-fatal follow-up problems (e.g. LFS cleanup after a delete).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn driver_kind_round_trip() {
        for kind in [
            DriverKind::HubDataset,
            DriverKind::GitHost,
            DriverKind::MessageAttachment,
            DriverKind::Webdav,
            DriverKind::HttpMirror,
        ] {
            let s = kind.to_string();
            assert_eq!(DriverKind::from_str(&s).expect("parse"), kind);
        }
        assert!(DriverKind::from_str("ftp").is_err());
    }

    #[test]
    fn mimetype_guessing() {
        assert_eq!(guess_mimetype("a.txt"), "text/plain");
        assert_eq!(guess_mimetype("a.json"), "application/json");
        assert_eq!(guess_mimetype("mystery.zzz"), "application/octet-stream");
    }

    #[test]
    fn stat_constructors() {
        let d = StatRecord::directory("/docs/", "docs");
        assert!(d.is_directory);
        assert_eq!(d.mimetype, "application/x-directory");

        let f = StatRecord::file("/a.csv", "a.csv", Some(10));
        assert!(!f.is_directory);
        assert_eq!(f.size, Some(10));
        assert_eq!(f.mimetype, "text/csv");
    }

    #[test]
    fn unknown_size_serializes_as_null() {
        let f = StatRecord::file("/a.bin", "a.bin", None);
        let json = serde_json::to_value(&f).expect("serialize");
        assert!(json.get("size").expect("size present").is_null());
    }

    #[test]
    fn transfer_outcomes() {
        assert_eq!(TransferOutcome::success().status, TransferStatus::Success);
        let failed = TransferOutcome::failed("boom");
        assert_eq!(failed.status, TransferStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }
}
