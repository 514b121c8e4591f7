//! LFS batch protocol and NDJSON commit composition.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use stowage_types::{ErrorCode, Result, StorageError};

/// `POST …/info/lfs/objects/batch` body.
#[derive(Debug, Serialize)]
pub struct LfsBatchRequest {
    pub operation: &'static str,
    pub transfers: Vec<&'static str>,
    pub hash_algo: &'static str,
    pub objects: Vec<LfsObjectRef>,
    #[serde(rename = "ref", skip_serializing_if = "Option::is_none")]
    pub git_ref: Option<LfsRef>,
}

impl LfsBatchRequest {
    pub fn upload(oid: &str, size: u64, multipart: bool, branch: Option<&str>) -> Self {
        Self {
            operation: "upload",
            transfers: if multipart {
                vec!["basic", "multipart"]
            } else {
                vec!["basic"]
            },
            hash_algo: "sha_256",
            objects: vec![LfsObjectRef { oid: oid.to_string(), size }],
            git_ref: branch.map(|b| LfsRef { name: format!("refs/heads/{b}") }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LfsObjectRef {
    pub oid: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct LfsRef {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct LfsBatchResponse {
    pub objects: Vec<LfsBatchObject>,
}

#[derive(Debug, Deserialize)]
pub struct LfsBatchObject {
    pub oid: String,
    #[serde(default)]
    pub actions: Option<LfsActions>,
    #[serde(default)]
    pub error: Option<LfsObjectError>,
}

#[derive(Debug, Deserialize)]
pub struct LfsObjectError {
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LfsActions {
    #[serde(default)]
    pub upload: Option<LfsAction>,
}

#[derive(Debug, Deserialize)]
pub struct LfsAction {
    pub href: String,
    #[serde(default)]
    pub header: Option<BTreeMap<String, String>>,
}

/// What the batch response authorizes for one object.
#[derive(Debug)]
pub enum UploadAuthorization {
    /// The server already holds the content; skip the transfer entirely.
    AlreadyUploaded,
    /// Single PUT to a presigned URL with the given extra headers.
    Basic {
        href: String,
        headers: BTreeMap<String, String>,
    },
    /// Numbered part URLs plus a completion endpoint.
    Multipart(MultipartPresign),
}

#[derive(Debug, Clone)]
pub struct MultipartPresign {
    pub chunk_size: u64,
    /// Part URLs in part order (header keys `"00001"`, `"00002"`, …).
    pub urls: Vec<String>,
    /// The action `href` doubles as the completion endpoint.
    pub completion_url: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Interpret a batch response for one object.
///
/// The server's word is authoritative: an object without an `upload` action
/// is deduplicated server-side, not an error.
pub fn interpret_batch(response: &LfsBatchResponse, oid: &str) -> Result<UploadAuthorization> {
    let object = response
        .objects
        .iter()
        .find(|o| o.oid == oid)
        .ok_or_else(|| {
            StorageError::new(
                ErrorCode::InvalidResponse,
                format!("LFS batch response is missing object {oid}"),
            )
        })?;

    if let Some(error) = &object.error {
        return Err(StorageError::new(
            ErrorCode::InvalidResponse,
            format!(
                "LFS batch rejected object {oid}: {} ({})",
                error.message.as_deref().unwrap_or("unknown"),
                error.code.unwrap_or(0)
            ),
        ));
    }

    let Some(action) = object.actions.as_ref().and_then(|a| a.upload.as_ref()) else {
        return Ok(UploadAuthorization::AlreadyUploaded);
    };

    let headers = action.header.clone().unwrap_or_default();
    if let Some(presign) = extract_multipart(action) {
        return Ok(UploadAuthorization::Multipart(presign));
    }
    Ok(UploadAuthorization::Basic { href: action.href.clone(), headers })
}

/// Pull a multipart presign out of an upload action, if one is offered.
///
/// Multipart actions carry `chunk_size` plus zero-padded numeric keys in the
/// header map; everything else in the map is a real header.
fn extract_multipart(action: &LfsAction) -> Option<MultipartPresign> {
    let headers = action.header.as_ref()?;
    let chunk_size: u64 = headers.get("chunk_size")?.parse().ok().filter(|s| *s > 0)?;

    let mut numbered: Vec<(u32, String)> = headers
        .iter()
        .filter_map(|(key, value)| {
            key.parse::<u32>().ok().map(|n| (n, value.clone()))
        })
        .collect();
    if numbered.is_empty() {
        return None;
    }
    numbered.sort_by_key(|(n, _)| *n);
    let urls: Vec<String> = numbered.into_iter().map(|(_, url)| url).collect();

    Some(MultipartPresign {
        chunk_size,
        expires_at: presign_expiry(&urls[0], Utc::now()),
        completion_url: action.href.clone(),
        urls,
    })
}

/// TTL from the first URL's `X-Amz-Expires` query parameter.
pub fn presign_expiry(first_url: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let parsed = url::Url::parse(first_url).ok()?;
    let secs: i64 = parsed
        .query_pairs()
        .find(|(k, _)| k.eq_ignore_ascii_case("x-amz-expires"))
        .and_then(|(_, v)| v.parse().ok())?;
    Some(now + Duration::seconds(secs))
}

/// `ceil(size / chunk_size)` must equal the number of presigned URLs.
pub fn validate_part_count(size: u64, chunk_size: u64, url_count: usize) -> Result<u32> {
    if chunk_size == 0 {
        return Err(StorageError::new(
            ErrorCode::InvalidResponse,
            "LFS multipart offer has chunk_size 0",
        ));
    }
    let expected = size.div_ceil(chunk_size);
    if expected != url_count as u64 {
        return Err(StorageError::new(
            ErrorCode::MultipartPartsMismatch,
            format!(
                "expected {expected} part URLs for {size} bytes at {chunk_size}-byte parts, got {url_count}"
            ),
        ));
    }
    Ok(expected as u32)
}

/// Body for the multipart completion POST.
#[derive(Debug, Serialize)]
pub struct MultipartCompletion {
    pub oid: String,
    pub parts: Vec<CompletionPart>,
}

#[derive(Debug, Serialize)]
pub struct CompletionPart {
    #[serde(rename = "partNumber")]
    pub part_number: u32,
    pub etag: String,
}

/// Builder for the NDJSON commit payload: one JSON object per line, starting
/// with the `header` line.
#[derive(Debug)]
pub struct CommitBuilder {
    lines: Vec<serde_json::Value>,
}

impl CommitBuilder {
    pub fn new(summary: &str, description: &str) -> Self {
        Self {
            lines: vec![serde_json::json!({
                "key": "header",
                "value": {"summary": summary, "description": description},
            })],
        }
    }

    /// Inline file content, base64-encoded.
    pub fn add_file(&mut self, path: &str, content: &[u8]) -> &mut Self {
        use base64::Engine;
        self.lines.push(serde_json::json!({
            "key": "file",
            "value": {
                "path": path,
                "encoding": "base64",
                "content": base64::engine::general_purpose::STANDARD.encode(content),
            },
        }));
        self
    }

    /// Reference an LFS object by oid; no content moves.
    pub fn add_lfs_file(&mut self, path: &str, oid: &str, size: u64) -> &mut Self {
        self.lines.push(serde_json::json!({
            "key": "lfsFile",
            "value": {"path": path, "algo": "sha256", "oid": oid, "size": size},
        }));
        self
    }

    pub fn delete_file(&mut self, path: &str) -> &mut Self {
        self.lines.push(serde_json::json!({
            "key": "deletedFile",
            "value": {"path": path},
        }));
        self
    }

    pub fn delete_folder(&mut self, path: &str) -> &mut Self {
        self.lines.push(serde_json::json!({
            "key": "deletedFolder",
            "value": {"path": path},
        }));
        self
    }

    /// Number of operation lines, excluding the header.
    pub fn operation_count(&self) -> usize {
        self.lines.len() - 1
    }

    pub fn build(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(&line.to_string());
            out.push('\n');
        }
        out
    }
}

/// Content sha256, lowercase hex — the LFS oid.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
