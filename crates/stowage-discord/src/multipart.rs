//! Proxied multipart uploads (`single_session` strategy).
//!
//! The client splits the file and submits every chunk to the driver, which
//! re-posts each chunk as its own attachment message and appends a part
//! record to the session's `provider_meta`. Completion promotes the
//! accumulated parts to a `discord_chunks_v1` node under the target path.
//! Abort only marks the session; already-posted messages stay where they
//! are, which costs storage but never correctness.

use serde::{Deserialize, Serialize};

use crate::chunks::{ChunkLayout, ChunkPart, ContentRef};
use crate::driver::DiscordDriver;
use crate::index::{NodeStore, VfsNode, ensure_dirs};
use stowage_core::{ByteSource, MultipartComplete, MultipartInitOutcome, MultipartInitRequest, OpContext};
use stowage_sessions::{SessionPatch, SessionStore, UploadSessionRecord};
use stowage_types::{
    DriverKind, ErrorCode, PartInfo, Result, SessionStatus, StorageError, UploadMode,
    UploadOutcome, UploadStrategy, guess_mimetype, path,
};

const DEFAULT_PART_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
struct DiscordSessionMeta {
    filename: String,
    content_type: String,
    #[serde(default)]
    parts: Vec<ChunkPart>,
}

fn store_err(e: anyhow::Error) -> StorageError {
    StorageError::upstream(format!("session store failed: {e}"))
}

fn load_active(
    driver: &DiscordDriver,
    session_id: &str,
) -> Result<(UploadSessionRecord, DiscordSessionMeta)> {
    let record = driver
        .sessions_store()
        .get(session_id)
        .map_err(|_| StorageError::not_found(format!("upload session {session_id}")))?;
    if !record.status.is_active() {
        return Err(StorageError::invalid_config(format!(
            "upload session {session_id} is {:?} and no longer accepts operations",
            record.status
        )));
    }
    let meta: DiscordSessionMeta = serde_json::from_value(record.provider_meta.clone())
        .map_err(|e| StorageError::upstream(format!("corrupt session metadata: {e}")))?;
    Ok((record, meta))
}

pub(crate) fn initialize(
    driver: &DiscordDriver,
    _cx: &OpContext,
    request: &MultipartInitRequest,
) -> Result<MultipartInitOutcome> {
    let normalized = path::normalize(&request.path, Some(false))?;
    let name = path::require_name(&normalized)?.to_string();

    let part_size = driver.part_size().unwrap_or(DEFAULT_PART_SIZE);
    let total_parts = request.size.div_ceil(part_size).max(1) as u32;
    let filename = request.filename.clone().unwrap_or(name);
    let content_type = request
        .content_type
        .clone()
        .unwrap_or_else(|| guess_mimetype(&filename));

    let mut record = UploadSessionRecord::new(
        DriverKind::MessageAttachment,
        normalized,
        UploadStrategy::SingleSession,
    );
    record.part_size = Some(part_size);
    record.total_parts = Some(total_parts);
    record.provider_meta = serde_json::to_value(&DiscordSessionMeta {
        filename,
        content_type,
        parts: Vec::new(),
    })?;
    let session_id = record.id.clone();
    driver.sessions_store().create(record).map_err(store_err)?;

    Ok(MultipartInitOutcome {
        session_id,
        strategy: UploadStrategy::SingleSession,
        mode: UploadMode::Multipart,
        part_size: Some(part_size),
        total_parts: Some(total_parts),
        presigned_urls: None,
        expires_at: None,
    })
}

pub(crate) fn proxy_chunk(
    driver: &DiscordDriver,
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
    let part_name = format!("{}.part{part_number:05}", meta.filename);

    let (message_id, attachment) =
        driver.post_attachment(cx, &part_name, "application/octet-stream", bytes)?;

    meta.parts.retain(|p| p.part_no != part_number);
    meta.parts.push(ChunkPart {
        part_no: part_number,
        size: Some(size),
        byte_start: None,
        byte_end: None,
        message_id,
        attachment_id: attachment.id.clone(),
        url: Some(attachment.url),
        channel_id: Some(driver.channel_id().to_string()),
    });
    meta.parts.sort_by_key(|p| p.part_no);

    // The chunk message is durable; losing this update would orphan it, so
    // it rides the hardened index-write path.
    let patch = SessionPatch::meta(serde_json::to_value(&meta)?)
        .with_status(SessionStatus::InProgress);
    driver.write_index(|| driver.sessions_store().update(session_id, patch.clone()))?;

    Ok(PartInfo { part_number, etag: Some(attachment.id), size: Some(size) })
}

pub(crate) fn list_parts(
    driver: &DiscordDriver,
    _cx: &OpContext,
    session_id: &str,
) -> Result<Vec<PartInfo>> {
    let (_, meta) = load_active(driver, session_id)?;
    Ok(meta
        .parts
        .iter()
        .map(|p| PartInfo {
            part_number: p.part_no,
            etag: Some(p.attachment_id.clone()),
            size: p.size,
        })
        .collect())
}

pub(crate) fn complete(
    driver: &DiscordDriver,
    _cx: &OpContext,
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
    if !complete.parts.is_empty() && complete.parts.len() as u32 != expected {
        return Err(StorageError::new(
            ErrorCode::MultipartPartsMismatch,
            format!(
                "caller reports {} parts, session holds {expected}",
                complete.parts.len()
            ),
        ));
    }

    let layout = ChunkLayout::resolve(meta.parts.clone());
    let content_ref = serde_json::to_value(ContentRef::Chunks { parts: layout.parts.clone() })?;
    let total_size = layout.total_size;

    let normalized = record.path.clone();
    let (owner, scope) = driver.owner_scope();
    let name = path::require_name(&normalized)?.to_string();
    let parent = ensure_dirs(
        driver.nodes_store(),
        &owner,
        &scope,
        &path::parent(&normalized),
    )?;

    driver.write_index(|| {
        let existing = driver
            .nodes_store()
            .lookup(&owner, &scope, parent.as_deref(), &name)?;
        match existing {
            Some(node) => {
                let mut updated = node;
                updated.mime = meta.content_type.clone();
                updated.size = total_size;
                updated.content_ref = content_ref.clone();
                updated.updated_at = chrono::Utc::now();
                driver.nodes_store().update(&updated)
            }
            None => driver.nodes_store().insert(VfsNode::new_file(
                &owner,
                &scope,
                parent.clone(),
                &name,
                meta.content_type.clone(),
                total_size,
                content_ref.clone(),
            )),
        }
    })?;

    if let Err(e) = driver
        .sessions_store()
        .update(session_id, SessionPatch::status(SessionStatus::Completed))
    {
        // The node is in place; a stale session record is only cosmetic.
        tracing::warn!(error = %e, "failed to mark session completed");
    }
    Ok(UploadOutcome { storage_path: record.path })
}

pub(crate) fn abort(driver: &DiscordDriver, _cx: &OpContext, session_id: &str) -> Result<()> {
    driver
        .sessions_store()
        .update(session_id, SessionPatch::status(SessionStatus::Aborted))
        .map_err(store_err)
}
