//! Multipart upload session vocabulary.
//!
//! The session record itself lives in `stowage-sessions`; these are the
//! contract-level enums and part descriptors drivers exchange with the
//! orchestrator.

use serde::{Deserialize, Serialize};

/// How a driver runs a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStrategy {
    /// Client PUTs each part to a presigned URL (hub LFS multipart).
    PerPartUrl,
    /// Client submits chunks to the driver, which re-posts them upstream.
    SingleSession,
    /// The provider composes the final object from a commit (git-backed).
    ProviderCommit,
}

/// Upload mode resolved at session init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    Basic,
    Multipart,
    /// The backend already holds the content; no transfer needed.
    AlreadyUploaded,
}

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initiated,
    InProgress,
    Aborted,
    Completed,
}

impl SessionStatus {
    /// Whether the session still accepts parts.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Initiated | SessionStatus::InProgress)
    }
}

/// One uploaded (or to-be-uploaded) part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartInfo {
    /// 1-based part number.
    pub part_number: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}
