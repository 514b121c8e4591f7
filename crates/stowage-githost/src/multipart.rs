//! Provider-composed multipart uploads.
//!
//! The git host has no presigned-part concept, so chunks flow through the
//! driver (`provider_commit` strategy): each proxied chunk becomes its own
//! blob, the session ledger records `{part_no, sha, size}`, and completion
//! stitches the chunks back together into the final blob inside one commit.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::driver::{BLOB_LIMIT, Change, GitHostDriver};
use stowage_core::http::{RetryMode, ensure_success, send_with_retry};
use stowage_core::{ByteSource, MultipartComplete, MultipartInitOutcome, MultipartInitRequest, OpContext};
use stowage_sessions::{SessionPatch, SessionStore, UploadSessionRecord};
use stowage_types::{
    DriverKind, ErrorCode, PartInfo, Result, SessionStatus, StorageError, UploadMode,
    UploadOutcome, UploadStrategy, path,
};

const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct GitHostSessionMeta {
    repo_path: String,
    size: u64,
    #[serde(default)]
    parts: Vec<ChunkRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkRecord {
    part_no: u32,
    sha: String,
    size: u64,
}

fn store_err(e: anyhow::Error) -> StorageError {
    StorageError::upstream(format!("session store failed: {e}"))
}

fn load_active(
    driver: &GitHostDriver,
    session_id: &str,
) -> Result<(UploadSessionRecord, GitHostSessionMeta)> {
    let record = driver
        .sessions
        .get(session_id)
        .map_err(|_| StorageError::not_found(format!("upload session {session_id}")))?;
    if !record.status.is_active() {
        return Err(StorageError::invalid_config(format!(
            "upload session {session_id} is {:?} and no longer accepts operations",
            record.status
        )));
    }
    let meta: GitHostSessionMeta = serde_json::from_value(record.provider_meta.clone())
        .map_err(|e| StorageError::upstream(format!("corrupt session metadata: {e}")))?;
    Ok((record, meta))
}

pub(crate) fn initialize(
    driver: &GitHostDriver,
    cx: &OpContext,
    request: &MultipartInitRequest,
) -> Result<MultipartInitOutcome> {
    let _ = cx;
    let normalized = path::normalize(&request.path, Some(false))?;
    path::require_name(&normalized)?;
    driver.ensure_writable()?;
    if request.size > BLOB_LIMIT {
        return Err(StorageError::new(
            ErrorCode::FileTooLarge,
            format!("{} bytes exceeds the 100 MiB blob limit", request.size),
        ));
    }

    let part_size = driver.options.part_size.unwrap_or(DEFAULT_PART_SIZE);
    let total_parts = request.size.div_ceil(part_size).max(1) as u32;

    let mut record = UploadSessionRecord::new(
        DriverKind::GitHost,
        normalized.clone(),
        UploadStrategy::ProviderCommit,
    );
    record.part_size = Some(part_size);
    record.total_parts = Some(total_parts);
    let meta = GitHostSessionMeta {
        repo_path: path::strip_root(&normalized).to_string(),
        size: request.size,
        parts: Vec::new(),
    };
    record.provider_meta = serde_json::to_value(&meta)?;
    let session_id = record.id.clone();
    driver.sessions.create(record).map_err(store_err)?;

    Ok(MultipartInitOutcome {
        session_id,
        strategy: UploadStrategy::ProviderCommit,
        mode: UploadMode::Multipart,
        part_size: Some(part_size),
        total_parts: Some(total_parts),
        presigned_urls: None,
        expires_at: None,
    })
}

pub(crate) fn proxy_chunk(
    driver: &GitHostDriver,
    cx: &OpContext,
    session_id: &str,
    part_number: u32,
    chunk: ByteSource,
) -> Result<PartInfo> {
    let (_, mut meta) = load_active(driver, session_id)?;
    if part_number == 0 {
        return Err(StorageError::invalid_config("part numbers start at 1"));
    }
    let bytes = chunk.into_bytes()?;
    let size = bytes.len() as u64;
    let sha = driver.create_blob(cx, bytes)?;

    meta.parts.retain(|p| p.part_no != part_number);
    meta.parts.push(ChunkRecord { part_no: part_number, sha: sha.clone(), size });
    meta.parts.sort_by_key(|p| p.part_no);

    let patch = SessionPatch::meta(serde_json::to_value(&meta)?)
        .with_status(SessionStatus::InProgress);
    driver.sessions.update(session_id, patch).map_err(store_err)?;

    Ok(PartInfo { part_number, etag: Some(sha), size: Some(size) })
}

pub(crate) fn list_parts(
    driver: &GitHostDriver,
    _cx: &OpContext,
    session_id: &str,
) -> Result<Vec<PartInfo>> {
    let (_, meta) = load_active(driver, session_id)?;
    Ok(meta
        .parts
        .iter()
        .map(|p| PartInfo {
            part_number: p.part_no,
            etag: Some(p.sha.clone()),
            size: Some(p.size),
        })
        .collect())
}

pub(crate) fn complete(
    driver: &GitHostDriver,
    cx: &OpContext,
    session_id: &str,
    complete: &MultipartComplete,
) -> Result<UploadOutcome> {
    let (record, meta) = load_active(driver, session_id)?;

    let expected = record.total_parts.unwrap_or(meta.parts.len() as u32);
    if meta.parts.len() as u32 != expected {
        return Err(StorageError::new(
            ErrorCode::MultipartPartsMismatch,
            format!("session holds {} of {expected} parts", meta.parts.len()),
        ));
    }
    for (idx, part) in meta.parts.iter().enumerate() {
        if part.part_no != idx as u32 + 1 {
            return Err(StorageError::new(
                ErrorCode::MultipartPartsMismatch,
                format!("part sequence has a gap at {}", idx + 1),
            ));
        }
    }
    // When the caller provides a ledger it must agree with ours.
    if !complete.parts.is_empty() && complete.parts.len() as u32 != expected {
        return Err(StorageError::new(
            ErrorCode::MultipartPartsMismatch,
            format!("caller reports {} parts, session holds {expected}", complete.parts.len()),
        ));
    }

    let mut assembled = Vec::with_capacity(meta.size as usize);
    for part in &meta.parts {
        cx.cancel.checkpoint()?;
        assembled.extend_from_slice(&fetch_blob(driver, cx, &part.sha)?);
    }
    if assembled.len() as u64 != meta.size {
        return Err(StorageError::new(
            ErrorCode::MultipartPartsMismatch,
            format!("assembled {} bytes, expected {}", assembled.len(), meta.size),
        ));
    }

    driver.commit_changes(
        cx,
        &format!("Upload {}", meta.repo_path),
        vec![Change::Content { path: meta.repo_path.clone(), bytes: assembled }],
    )?;

    driver
        .sessions
        .update(session_id, SessionPatch::status(SessionStatus::Completed))
        .map_err(store_err)?;
    Ok(UploadOutcome { storage_path: record.path })
}

pub(crate) fn abort(driver: &GitHostDriver, _cx: &OpContext, session_id: &str) -> Result<()> {
    driver
        .sessions
        .update(session_id, SessionPatch::status(SessionStatus::Aborted))
        .map_err(store_err)
}

/// `GET …/git/blobs/{sha}` returns base64 content with embedded newlines.
fn fetch_blob(driver: &GitHostDriver, cx: &OpContext, sha: &str) -> Result<Vec<u8>> {
    #[derive(Deserialize)]
    struct BlobBody {
        content: String,
        #[serde(default)]
        encoding: String,
    }

    let url = format!("{}/git/blobs/{sha}", driver.api_base());
    let req = driver.authed(driver.client.get(&url));
    let resp = send_with_retry(&req, RetryMode::Read, &driver.read_backoff(), &cx.cancel)?;
    let resp = ensure_success(resp)?;
    let body: BlobBody = resp
        .json()
        .map_err(|e| StorageError::upstream(format!("malformed blob body: {e}")))?;
    if body.encoding != "base64" {
        return Err(StorageError::new(
            ErrorCode::InvalidResponse,
            format!("unexpected blob encoding {}", body.encoding),
        ));
    }
    let compact: String = body.content.split_whitespace().collect();
    base64::engine::general_purpose::STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| {
            StorageError::new(ErrorCode::InvalidResponse, format!("undecodable blob content: {e}"))
        })
}
