//! Front-end multipart uploads against the LFS presign endpoints.
//!
//! The client uploads parts straight to presigned URLs; the driver only
//! brokers sessions: it asks the LFS batch endpoint for part URLs, records
//! them (with their TTL) in the session ledger, refreshes them on demand and
//! finishes the upload with a completion POST plus an NDJSON commit.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::HubDriver;
use crate::lfs::{
    CommitBuilder, CompletionPart, MultipartCompletion, UploadAuthorization, validate_part_count,
};
use stowage_core::http::{RetryMode, ensure_success, send_with_retry};
use stowage_core::{MultipartComplete, MultipartInitOutcome, MultipartInitRequest, OpContext, SignedParts};
use stowage_sessions::{SessionPatch, SessionStore, UploadSessionRecord};
use stowage_types::{
    DriverKind, ErrorCode, PartInfo, Result, SessionStatus, StorageError, UploadMode,
    UploadOutcome, UploadStrategy, path,
};

/// Driver-owned session state, opaque to everyone else.
#[derive(Debug, Serialize, Deserialize)]
struct HubSessionMeta {
    oid: String,
    size: u64,
    repo_path: String,
    mode: UploadMode,
    #[serde(default)]
    presigned_urls: Vec<String>,
    #[serde(default)]
    completion_url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

fn store_err(e: anyhow::Error) -> StorageError {
    StorageError::upstream(format!("session store failed: {e}"))
}

fn load_active(driver: &HubDriver, session_id: &str) -> Result<(UploadSessionRecord, HubSessionMeta)> {
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
    let meta: HubSessionMeta = serde_json::from_value(record.provider_meta.clone())
        .map_err(|e| StorageError::upstream(format!("corrupt session metadata: {e}")))?;
    Ok((record, meta))
}

pub(crate) fn initialize(
    driver: &HubDriver,
    cx: &OpContext,
    request: &MultipartInitRequest,
) -> Result<MultipartInitOutcome> {
    let normalized = path::normalize(&request.path, Some(false))?;
    path::require_name(&normalized)?;
    driver.refuse_xet()?;
    let branch = driver.ensure_writable(cx)?;
    let repo_path = path::strip_root(&normalized).to_string();

    let oid = request.checksum.clone().ok_or_else(|| {
        StorageError::invalid_config("multipart upload requires the file's sha256 checksum")
    })?;
    let size = request.size;

    let mut record = UploadSessionRecord::new(
        DriverKind::HubDataset,
        normalized.clone(),
        UploadStrategy::PerPartUrl,
    );

    let (meta, outcome) = match driver.lfs_batch(cx, &oid, size, true, &branch)? {
        UploadAuthorization::AlreadyUploaded => {
            debug!(oid = %oid, "multipart init: content already on the server");
            let meta = HubSessionMeta {
                oid,
                size,
                repo_path,
                mode: UploadMode::AlreadyUploaded,
                presigned_urls: Vec::new(),
                completion_url: None,
                headers: BTreeMap::new(),
            };
            let outcome = MultipartInitOutcome {
                session_id: record.id.clone(),
                strategy: UploadStrategy::PerPartUrl,
                mode: UploadMode::AlreadyUploaded,
                part_size: None,
                total_parts: Some(0),
                presigned_urls: None,
                expires_at: None,
            };
            (meta, outcome)
        }
        UploadAuthorization::Multipart(presign) => {
            let total_parts = validate_part_count(size, presign.chunk_size, presign.urls.len())?;
            record.part_size = Some(presign.chunk_size);
            record.total_parts = Some(total_parts);
            record.expires_at = presign.expires_at;
            let meta = HubSessionMeta {
                oid,
                size,
                repo_path,
                mode: UploadMode::Multipart,
                presigned_urls: presign.urls.clone(),
                completion_url: Some(presign.completion_url),
                headers: BTreeMap::new(),
            };
            let outcome = MultipartInitOutcome {
                session_id: record.id.clone(),
                strategy: UploadStrategy::PerPartUrl,
                mode: UploadMode::Multipart,
                part_size: Some(presign.chunk_size),
                total_parts: Some(total_parts),
                presigned_urls: Some(presign.urls),
                expires_at: presign.expires_at,
            };
            (meta, outcome)
        }
        UploadAuthorization::Basic { href, headers } => {
            record.part_size = Some(size);
            record.total_parts = Some(1);
            let meta = HubSessionMeta {
                oid,
                size,
                repo_path,
                mode: UploadMode::Basic,
                presigned_urls: vec![href.clone()],
                completion_url: None,
                headers,
            };
            let outcome = MultipartInitOutcome {
                session_id: record.id.clone(),
                strategy: UploadStrategy::PerPartUrl,
                mode: UploadMode::Basic,
                part_size: Some(size),
                total_parts: Some(1),
                presigned_urls: Some(vec![href]),
                expires_at: None,
            };
            (meta, outcome)
        }
    };

    record.provider_meta = serde_json::to_value(&meta)?;
    driver.sessions.create(record).map_err(store_err)?;
    Ok(outcome)
}

/// Refresh presigned URLs when the cached set is missing or expired.
pub(crate) fn sign(driver: &HubDriver, cx: &OpContext, session_id: &str) -> Result<SignedParts> {
    let (record, mut meta) = load_active(driver, session_id)?;

    if meta.mode == UploadMode::AlreadyUploaded {
        return Ok(SignedParts {
            presigned_urls: Vec::new(),
            completion_url: None,
            expires_at: None,
            reset_uploaded_parts: false,
        });
    }

    let stale = meta.presigned_urls.is_empty() || record.is_expired(Utc::now());
    if !stale {
        return Ok(SignedParts {
            presigned_urls: meta.presigned_urls,
            completion_url: meta.completion_url,
            expires_at: record.expires_at,
            reset_uploaded_parts: false,
        });
    }

    let branch = driver.ensure_writable(cx)?;
    let mut expires_at = None;
    match driver.lfs_batch(cx, &meta.oid, meta.size, true, &branch)? {
        UploadAuthorization::Multipart(presign) => {
            validate_part_count(meta.size, presign.chunk_size, presign.urls.len())?;
            meta.presigned_urls = presign.urls;
            meta.completion_url = Some(presign.completion_url);
            meta.mode = UploadMode::Multipart;
            expires_at = presign.expires_at;
        }
        UploadAuthorization::Basic { href, headers } => {
            meta.presigned_urls = vec![href];
            meta.completion_url = None;
            meta.headers = headers;
            meta.mode = UploadMode::Basic;
        }
        UploadAuthorization::AlreadyUploaded => {
            meta.presigned_urls = Vec::new();
            meta.completion_url = None;
            meta.mode = UploadMode::AlreadyUploaded;
        }
    }

    let patch = SessionPatch::meta(serde_json::to_value(&meta)?)
        .with_status(SessionStatus::InProgress)
        .with_expires_at(expires_at);
    driver.sessions.update(session_id, patch).map_err(store_err)?;

    // Fresh URLs invalidate whatever the client already uploaded.
    Ok(SignedParts {
        presigned_urls: meta.presigned_urls,
        completion_url: meta.completion_url,
        expires_at,
        reset_uploaded_parts: true,
    })
}

pub(crate) fn list_parts(
    driver: &HubDriver,
    _cx: &OpContext,
    session_id: &str,
) -> Result<Vec<PartInfo>> {
    let record = driver
        .sessions
        .get(session_id)
        .map_err(|_| StorageError::not_found(format!("upload session {session_id}")))?;
    // The client owns the parts ledger for presigned uploads; the driver only
    // knows the expected shape.
    let total = record.total_parts.unwrap_or(0);
    Ok((1..=total)
        .map(|part_number| PartInfo {
            part_number,
            etag: None,
            size: record.part_size,
        })
        .collect())
}

pub(crate) fn complete(
    driver: &HubDriver,
    cx: &OpContext,
    session_id: &str,
    complete: &MultipartComplete,
) -> Result<UploadOutcome> {
    let (record, meta) = load_active(driver, session_id)?;

    if meta.mode == UploadMode::Multipart {
        let expected = record.total_parts.unwrap_or(0) as usize;
        if complete.parts.len() != expected {
            return Err(StorageError::new(
                ErrorCode::MultipartPartsMismatch,
                format!("expected {expected} parts, got {}", complete.parts.len()),
            ));
        }
        let mut parts = Vec::with_capacity(complete.parts.len());
        for part in &complete.parts {
            let etag = part.etag.clone().filter(|e| !e.is_empty()).ok_or_else(|| {
                StorageError::new(
                    ErrorCode::MultipartPartsMismatch,
                    format!("part {} is missing its ETag", part.part_number),
                )
            })?;
            parts.push(CompletionPart { part_number: part.part_number, etag });
        }
        let completion_url = meta.completion_url.as_deref().ok_or_else(|| {
            StorageError::upstream("session has no completion URL")
        })?;
        let body = MultipartCompletion { oid: meta.oid.clone(), parts };
        let req = driver
            .authed(driver.client.post(completion_url))
            .json(&body);
        let resp = send_with_retry(&req, RetryMode::Write, &driver.write_backoff(), &cx.cancel)?;
        ensure_success(resp)?;
    }

    let mut builder = CommitBuilder::new(&format!("Upload {}", meta.repo_path), "");
    builder.add_lfs_file(&meta.repo_path, &meta.oid, meta.size);
    driver.send_commit(cx, &builder)?;

    driver
        .sessions
        .update(session_id, SessionPatch::status(SessionStatus::Completed))
        .map_err(store_err)?;
    Ok(UploadOutcome { storage_path: record.path })
}

pub(crate) fn abort(driver: &HubDriver, _cx: &OpContext, session_id: &str) -> Result<()> {
    driver
        .sessions
        .update(session_id, SessionPatch::status(SessionStatus::Aborted))
        .map_err(store_err)
}
