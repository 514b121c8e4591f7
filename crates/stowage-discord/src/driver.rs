//! The message-attachment driver proper.
//!
//! Storage writes are non-reversible: once a message is posted the bytes are
//! persisted whether or not the index write lands. The driver therefore
//! never retries the message send, retries the index write aggressively, and
//! surfaces `DISCORD_INDEX_WRITE_FAILED` — explicitly warning against a
//! re-upload — when the index stays unreachable. Deletes touch the index
//! only; message content is intentionally left in place.

use std::sync::{Arc, Mutex};

use reqwest::blocking::Client;
use reqwest::blocking::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use crate::chunks::{ChunkLayout, ContentRef, PartRead};
use crate::index::{NodeStore, VfsNode, ensure_dirs, index_error, resolve_path};
use stowage_core::http::{
    RetryMode, build_client, ensure_success, response_stream, send_with_retry, transport_error,
};
use stowage_core::semaphore::{FairSemaphore, shared_semaphore};
use stowage_core::{
    ByteRange, ByteSource, ByteStream, CancelToken, OpContext, RangeFallback, StorageDriver,
    StreamDescriptor, StreamMeta, StreamOpener, slice_stream,
};
use stowage_retry::{
    BackoffConfig, BackoffKind, RateLimitPrecedence, RetryDecision, run_with_backoff,
};
use stowage_sessions::SessionStore;
use stowage_types::{
    BatchRemoveReport, Capability, CapabilitySet, CopyOptions, CreateDirOutcome,
    CredentialDecryptor, DirListing, DriverConfig, DriverKind, DriverOptions, ErrorCode,
    ListOptions, RemoveFailure, Result, StatRecord, StorageError, TransferOutcome, UpdateOutcome,
    UploadOptions, UploadOutcome, guess_mimetype, path,
};

/// Index writes retry far harder than ordinary calls; the alternative is an
/// orphaned upload.
const INDEX_WRITE_ATTEMPTS: u32 = 6;

/// Backend-specific payload of the config envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct DiscordBackend {
    pub channel_id: String,
    /// Owner of the index scope; falls back to the channel id.
    #[serde(default)]
    pub admin_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageResponse {
    id: String,
    #[serde(default)]
    attachments: Vec<AttachmentInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct AttachmentInfo {
    pub(crate) id: String,
    pub(crate) url: String,
    #[serde(default)]
    pub(crate) size: Option<u64>,
    #[serde(default)]
    pub(crate) content_type: Option<String>,
}

/// Driver over a chat channel's message attachments.
pub struct DiscordDriver {
    name: String,
    options: DriverOptions,
    backend: DiscordBackend,
    endpoint: String,
    client: Client,
    token: Option<String>,
    capabilities: CapabilitySet,
    semaphore: Arc<FairSemaphore>,
    nodes: Arc<dyn NodeStore>,
    sessions: Arc<dyn stowage_sessions::SessionStore>,
}

impl DiscordDriver {
    pub fn new(
        config: DriverConfig,
        nodes: Arc<dyn NodeStore>,
        sessions: Arc<dyn stowage_sessions::SessionStore>,
    ) -> Result<Self> {
        let backend: DiscordBackend = config.backend_config()?;
        if backend.channel_id.is_empty() {
            return Err(StorageError::invalid_config(
                "message-attachment driver requires a channel id",
            ));
        }
        let endpoint = config
            .endpoint
            .as_deref()
            .unwrap_or("https://discord.com/api/v10")
            .trim_end_matches('/')
            .to_string();
        let client = build_client(
            None,
            stowage_core::http::DEFAULT_TIMEOUT,
            config.options.tls_skip_verify,
        )?;
        // Shared across every instance pointed at this channel; a rebuild
        // with a new concurrency updates the shared limit in place.
        let semaphore = shared_semaphore(
            &format!("discord:{}", backend.channel_id),
            config.options.upload_concurrency,
        );
        Ok(Self {
            name: config.name,
            options: config.options,
            backend,
            endpoint,
            client,
            token: config.credential,
            capabilities: CapabilitySet::EMPTY,
            semaphore,
            nodes,
            sessions,
        })
    }

    pub(crate) fn sessions_store(&self) -> &dyn stowage_sessions::SessionStore {
        self.sessions.as_ref()
    }

    pub(crate) fn nodes_store(&self) -> &dyn NodeStore {
        self.nodes.as_ref()
    }

    pub(crate) fn part_size(&self) -> Option<u64> {
        self.options.part_size
    }

    pub(crate) fn channel_id(&self) -> &str {
        &self.backend.channel_id
    }

    /// Owner precedence: configured admin id, else the channel id.
    pub fn owner_scope(&self) -> (String, String) {
        let owner = self
            .backend
            .admin_id
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.backend.channel_id)
            .to_string();
        (owner, self.backend.channel_id.clone())
    }

    /// This backend documents its authoritative wait in the error body
    /// (fractional seconds); the header is a rounded echo.
    fn read_backoff(&self) -> BackoffConfig {
        BackoffConfig::reads()
            .with_max_attempts(self.options.retry_attempts)
            .with_max_delay(self.options.retry_max_delay)
            .with_precedence(RateLimitPrecedence::BodyFirst)
    }

    fn auth_header(&self) -> Result<String> {
        self.token
            .as_ref()
            .map(|t| format!("Bot {t}"))
            .ok_or_else(|| {
                StorageError::new(
                    ErrorCode::TokenRequiredForWrite,
                    "posting attachments requires a bot token",
                )
            })
    }

    /// Post one attachment message. Never retried: a success that we fail to
    /// observe would duplicate storage on a blind resend.
    pub(crate) fn post_attachment(
        &self,
        cx: &OpContext,
        filename: &str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> Result<(String, AttachmentInfo)> {
        let auth = self.auth_header()?;
        let guard = self.semaphore.acquire(&cx.cancel)?;
        cx.cancel.checkpoint()?;

        let payload = serde_json::json!({
            "attachments": [{"id": 0, "filename": filename}],
        });
        let part = Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime)
            .map_err(|e| StorageError::invalid_config(format!("invalid content type: {e}")))?;
        let form = Form::new()
            .text("payload_json", payload.to_string())
            .part("files[0]", part);

        let url = format!(
            "{}/channels/{}/messages",
            self.endpoint, self.backend.channel_id
        );
        let resp = self
            .client
            .post(&url)
            .header("authorization", &auth)
            .multipart(form)
            .send()
            .map_err(transport_error)?;
        drop(guard);

        let resp = ensure_success(resp)?;
        let message: MessageResponse = resp
            .json()
            .map_err(|e| StorageError::upstream(format!("malformed message response: {e}")))?;
        let attachment = message.attachments.into_iter().next().ok_or_else(|| {
            StorageError::new(
                ErrorCode::InvalidResponse,
                "message was created without an attachment",
            )
        })?;
        debug!(message_id = %message.id, attachment_id = %attachment.id, "posted attachment");
        Ok((message.id, attachment))
    }

    /// Write an index node with the aggressive retry the atomicity note in
    /// the module docs requires.
    pub(crate) fn write_index<F>(&self, mut write: F) -> Result<()>
    where
        F: FnMut() -> anyhow::Result<()>,
    {
        let backoff = BackoffConfig {
            kind: BackoffKind::Exponential,
            max_attempts: INDEX_WRITE_ATTEMPTS,
            base_delay: std::time::Duration::from_millis(200),
            max_delay: std::time::Duration::from_secs(5),
            jitter: 0.2,
            ..Default::default()
        };
        run_with_backoff(&backoff, |_| write(), |_| Some(RetryDecision::Backoff)).map_err(|e| {
            StorageError::new(
                ErrorCode::DiscordIndexWriteFailed,
                format!(
                    "the upload is stored but its index entry could not be written: {e}. \
                     Do NOT re-upload; repair the index instead"
                ),
            )
        })
    }

    fn node_record(&self, logical_path: &str, node: &VfsNode) -> StatRecord {
        if node.is_dir() {
            StatRecord::directory(format!("{}/", logical_path.trim_end_matches('/')), node.name.clone())
        } else {
            let mut record =
                StatRecord::file(logical_path.to_string(), node.name.clone(), node.size);
            record.mimetype = node.mime.clone();
            record.modified = Some(node.updated_at);
            record.storage_backend = Some(DriverKind::MessageAttachment);
            record
        }
    }

    fn resolve_file(&self, normalized: &str) -> Result<VfsNode> {
        let (owner, scope) = self.owner_scope();
        let node = resolve_path(self.nodes.as_ref(), &owner, &scope, normalized)?
            .ok_or_else(|| StorageError::invalid_path("the root is not a file"))?;
        if node.is_dir() {
            return Err(StorageError::invalid_path(format!(
                "{normalized} is a directory"
            )));
        }
        Ok(node)
    }

    fn fetcher(&self) -> ChunksFetcher {
        ChunksFetcher {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            token: self.token.clone(),
            semaphore: Arc::clone(&self.semaphore),
            default_channel: self.backend.channel_id.clone(),
            backoff: self.read_backoff(),
        }
    }

    fn remove_node_recursive(&self, owner: &str, scope: &str, node: &VfsNode) -> Result<()> {
        if node.is_dir() {
            let children = self
                .nodes
                .children(owner, scope, Some(&node.id))
                .map_err(index_error)?;
            for child in children {
                self.remove_node_recursive(owner, scope, &child)?;
            }
        }
        self.nodes.remove(owner, scope, &node.id).map_err(index_error)
    }

    fn copy_node_recursive(
        &self,
        owner: &str,
        scope: &str,
        node: &VfsNode,
        new_parent: Option<String>,
        new_name: &str,
    ) -> Result<()> {
        if node.is_dir() {
            let dir = VfsNode::new_dir(owner, scope, new_parent, new_name);
            let dir_id = dir.id.clone();
            self.nodes.insert(dir).map_err(index_error)?;
            let children = self
                .nodes
                .children(owner, scope, Some(&node.id))
                .map_err(index_error)?;
            for child in children {
                self.copy_node_recursive(owner, scope, &child, Some(dir_id.clone()), &child.name)?;
            }
            Ok(())
        } else {
            // Content is shared, not duplicated: both nodes point at the
            // same attachments.
            let copy = VfsNode::new_file(
                owner,
                scope,
                new_parent,
                new_name,
                node.mime.clone(),
                node.size,
                node.content_ref.clone(),
            );
            self.nodes.insert(copy).map_err(index_error)
        }
    }

    /// Full logical path of a node, rebuilt through parent links.
    fn node_path(&self, owner: &str, scope: &str, node: &VfsNode) -> Result<String> {
        let mut segments = vec![node.name.clone()];
        let mut parent = node.parent_id.clone();
        while let Some(id) = parent {
            let ancestor = self
                .nodes
                .get(owner, scope, &id)
                .map_err(index_error)?
                .ok_or_else(|| StorageError::upstream("index has a dangling parent link"))?;
            segments.push(ancestor.name.clone());
            parent = ancestor.parent_id.clone();
        }
        segments.reverse();
        Ok(format!("/{}", segments.join("/")))
    }
}

impl StorageDriver for DiscordDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::MessageAttachment
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    fn initialize(&mut self, decryptor: Option<&dyn CredentialDecryptor>) -> Result<()> {
        if let Some(raw) = self.token.take() {
            let resolved = stowage_types::RawCredential::parse(&raw).resolve(decryptor)?;
            self.token = Some(resolved);
        }
        let mut caps =
            CapabilitySet::new(&[Capability::Reader, Capability::Proxy, Capability::Search]);
        if self.token.is_some() {
            caps.insert(Capability::Writer);
            caps.insert(Capability::Multipart);
        }
        self.capabilities = caps;
        Ok(())
    }

    fn stat(&self, _cx: &OpContext, raw: &str) -> Result<StatRecord> {
        let normalized = path::normalize(raw, None)?;
        if path::is_root(&normalized) {
            return Ok(StatRecord::directory("/", ""));
        }
        let (owner, scope) = self.owner_scope();
        let node = resolve_path(self.nodes.as_ref(), &owner, &scope, &normalized)?
            .ok_or_else(|| StorageError::not_found(&normalized))?;
        Ok(self.node_record(normalized.trim_end_matches('/'), &node))
    }

    fn list_directory(&self, _cx: &OpContext, raw: &str, _opts: &ListOptions) -> Result<DirListing> {
        let normalized = path::normalize(raw, Some(true))?;
        let (owner, scope) = self.owner_scope();
        let parent_id = if path::is_root(&normalized) {
            None
        } else {
            let node = resolve_path(self.nodes.as_ref(), &owner, &scope, &normalized)?
                .ok_or_else(|| StorageError::not_found(&normalized))?;
            if !node.is_dir() {
                return Err(StorageError::invalid_path(format!(
                    "{normalized} is not a directory"
                )));
            }
            Some(node.id)
        };

        let children = self
            .nodes
            .children(&owner, &scope, parent_id.as_deref())
            .map_err(index_error)?;
        let items = children
            .iter()
            .map(|child| {
                let logical = path::join(&normalized, &child.name);
                self.node_record(&logical, child)
            })
            .collect();
        Ok(DirListing {
            items,
            is_root: path::is_root(&normalized),
            has_more: None,
            next_cursor: None,
        })
    }

    fn download_file(&self, _cx: &OpContext, raw: &str) -> Result<StreamDescriptor> {
        let normalized = path::normalize(raw, Some(false))?;
        let node = self.resolve_file(&normalized)?;
        let content = ContentRef::decode(&node.content_ref)?;

        match content {
            ContentRef::Attachment {
                channel_id,
                message_id,
                attachment_id,
                url,
                size,
                content_type,
            } => {
                let opener = AttachmentOpener {
                    fetcher: self.fetcher(),
                    channel_id,
                    message_id,
                    attachment_id,
                    url: Mutex::new(url),
                };
                let mime = content_type.unwrap_or_else(|| node.mime.clone());
                Ok(StreamDescriptor::new(mime, Box::new(opener))
                    .with_size(size.or(node.size))
                    .with_last_modified(Some(node.updated_at))
                    .with_range_support(RangeFallback::Honor206))
            }
            ContentRef::Chunks { parts } => {
                let layout = ChunkLayout::resolve(parts);
                let offsets_known = layout.offsets_known;
                let size = layout.total_size.or(node.size);
                let opener = ChunksOpener { fetcher: self.fetcher(), layout };
                let mut descriptor = StreamDescriptor::new(node.mime.clone(), Box::new(opener))
                    .with_size(size)
                    .with_last_modified(Some(node.updated_at));
                if offsets_known {
                    descriptor = descriptor.with_range_support(RangeFallback::Honor206);
                }
                Ok(descriptor)
            }
        }
    }

    fn upload_file(
        &self,
        cx: &OpContext,
        raw: &str,
        source: ByteSource,
        opts: &UploadOptions,
    ) -> Result<UploadOutcome> {
        let normalized = path::normalize(raw, Some(false))?;
        let name = path::require_name(&normalized)?.to_string();
        self.auth_header()?;

        let filename = opts.filename.clone().unwrap_or_else(|| name.clone());
        let mime = opts
            .content_type
            .clone()
            .unwrap_or_else(|| guess_mimetype(&filename));
        let bytes = source.into_bytes()?;
        let size = bytes.len() as u64;

        let (owner, scope) = self.owner_scope();
        let parent = ensure_dirs(self.nodes.as_ref(), &owner, &scope, &path::parent(&normalized))?;
        let existing = self
            .nodes
            .lookup(&owner, &scope, parent.as_deref(), &name)
            .map_err(index_error)?;

        let (message_id, attachment) = self.post_attachment(cx, &filename, &mime, bytes)?;
        let content_ref = serde_json::to_value(ContentRef::Attachment {
            channel_id: self.backend.channel_id.clone(),
            message_id,
            attachment_id: attachment.id.clone(),
            url: attachment.url.clone(),
            size: attachment.size.or(Some(size)),
            content_type: attachment.content_type.clone().or(Some(mime.clone())),
        })?;

        // From here on the bytes are durably stored; only the index write
        // may be retried.
        self.write_index(|| match &existing {
            Some(node) => {
                let mut updated = node.clone();
                updated.mime = mime.clone();
                updated.size = Some(size);
                updated.content_ref = content_ref.clone();
                updated.updated_at = chrono::Utc::now();
                self.nodes.update(&updated)
            }
            None => self.nodes.insert(VfsNode::new_file(
                &owner,
                &scope,
                parent.clone(),
                &name,
                mime.clone(),
                Some(size),
                content_ref.clone(),
            )),
        })?;

        Ok(UploadOutcome { storage_path: raw.to_string() })
    }

    fn update_file(&self, cx: &OpContext, raw: &str, body: &[u8]) -> Result<UpdateOutcome> {
        self.upload_file(
            cx,
            raw,
            ByteSource::from_bytes(body.to_vec()),
            &UploadOptions::default(),
        )?;
        Ok(UpdateOutcome { path: path::normalize(raw, Some(false))? })
    }

    fn create_directory(&self, _cx: &OpContext, raw: &str) -> Result<CreateDirOutcome> {
        let normalized = path::normalize(raw, Some(true))?;
        path::require_name(&normalized)?;
        let (owner, scope) = self.owner_scope();
        let already_existed =
            resolve_path(self.nodes.as_ref(), &owner, &scope, &normalized).is_ok_and(|n| n.is_some());
        if !already_existed {
            ensure_dirs(self.nodes.as_ref(), &owner, &scope, &normalized)?;
        }
        Ok(CreateDirOutcome { path: normalized, already_existed })
    }

    fn rename_item(&self, _cx: &OpContext, src: &str, dst: &str) -> Result<TransferOutcome> {
        let src_norm = path::normalize(src, None)?;
        let dst_norm = path::normalize(dst, None)?;
        let (owner, scope) = self.owner_scope();

        let node = resolve_path(self.nodes.as_ref(), &owner, &scope, &src_norm)?
            .ok_or_else(|| StorageError::invalid_path("cannot rename the root"))?;
        let dst_parent =
            ensure_dirs(self.nodes.as_ref(), &owner, &scope, &path::parent(&dst_norm))?;
        let new_name = path::require_name(&dst_norm)?.to_string();

        if self
            .nodes
            .lookup(&owner, &scope, dst_parent.as_deref(), &new_name)
            .map_err(index_error)?
            .is_some()
        {
            return Ok(TransferOutcome::failed(format!("{dst_norm} already exists")));
        }

        let mut moved = node.clone();
        moved.parent_id = dst_parent;
        moved.name = new_name;
        moved.updated_at = chrono::Utc::now();
        self.nodes.update(&moved).map_err(index_error)?;
        Ok(TransferOutcome::success())
    }

    fn copy_item(
        &self,
        _cx: &OpContext,
        src: &str,
        dst: &str,
        opts: &CopyOptions,
    ) -> Result<TransferOutcome> {
        let src_norm = path::normalize(src, None)?;
        let dst_norm = path::normalize(dst, None)?;
        let (owner, scope) = self.owner_scope();

        let node = resolve_path(self.nodes.as_ref(), &owner, &scope, &src_norm)?
            .ok_or_else(|| StorageError::invalid_path("cannot copy the root"))?;
        let dst_parent =
            ensure_dirs(self.nodes.as_ref(), &owner, &scope, &path::parent(&dst_norm))?;
        let new_name = path::require_name(&dst_norm)?.to_string();

        if self
            .nodes
            .lookup(&owner, &scope, dst_parent.as_deref(), &new_name)
            .map_err(index_error)?
            .is_some()
        {
            if opts.skip_existing {
                return Ok(TransferOutcome::skipped());
            }
            return Ok(TransferOutcome::failed(format!("{dst_norm} already exists")));
        }

        self.copy_node_recursive(&owner, &scope, &node, dst_parent, &new_name)?;
        Ok(TransferOutcome::success())
    }

    fn batch_remove_items(
        &self,
        _cx: &OpContext,
        paths: &[String],
        display_paths: &[String],
    ) -> Result<BatchRemoveReport> {
        let (owner, scope) = self.owner_scope();
        let mut report = BatchRemoveReport::default();
        let mut seen = std::collections::HashSet::new();

        for (idx, raw) in paths.iter().enumerate() {
            let display = display_paths.get(idx).unwrap_or(raw).clone();
            let normalized = match path::normalize(raw, None) {
                Ok(p) => p,
                Err(e) => {
                    report.failed.push(RemoveFailure { path: display, error: e.to_string() });
                    continue;
                }
            };
            if path::is_root(&normalized) {
                report.failed.push(RemoveFailure {
                    path: display,
                    error: "refusing to remove the mount root".to_string(),
                });
                continue;
            }
            if !seen.insert(normalized.clone()) {
                continue;
            }
            match resolve_path(self.nodes.as_ref(), &owner, &scope, &normalized) {
                Ok(Some(node)) => match self.remove_node_recursive(&owner, &scope, &node) {
                    Ok(()) => report.success.push(display),
                    Err(e) => {
                        report.failed.push(RemoveFailure { path: display, error: e.to_string() })
                    }
                },
                Ok(None) => {
                    report.failed.push(RemoveFailure {
                        path: display,
                        error: "refusing to remove the mount root".to_string(),
                    });
                }
                Err(e) if e.is_not_found() => {
                    // Absence is success for a delete.
                    report.success.push(display);
                }
                Err(e) => {
                    report.failed.push(RemoveFailure { path: display, error: e.to_string() })
                }
            }
        }
        Ok(report)
    }

    fn search(&self, _cx: &OpContext, query: &str) -> Result<Vec<StatRecord>> {
        let (owner, scope) = self.owner_scope();
        let hits = self
            .nodes
            .search(&owner, &scope, query)
            .map_err(index_error)?;
        let mut records = Vec::with_capacity(hits.len());
        for node in &hits {
            let logical = self.node_path(&owner, &scope, node)?;
            records.push(self.node_record(&logical, node));
        }
        Ok(records)
    }

    fn initialize_multipart_upload(
        &self,
        cx: &OpContext,
        request: &stowage_core::MultipartInitRequest,
    ) -> Result<stowage_core::MultipartInitOutcome> {
        crate::multipart::initialize(self, cx, request)
    }

    fn list_multipart_parts(
        &self,
        cx: &OpContext,
        session_id: &str,
    ) -> Result<Vec<stowage_types::PartInfo>> {
        crate::multipart::list_parts(self, cx, session_id)
    }

    fn list_multipart_uploads(
        &self,
        _cx: &OpContext,
    ) -> Result<Vec<stowage_sessions::UploadSessionRecord>> {
        self.sessions
            .list_active(&stowage_sessions::SessionFilter {
                driver: Some(DriverKind::MessageAttachment),
                path_prefix: None,
            })
            .map_err(|e| StorageError::upstream(format!("session store failed: {e}")))
    }

    fn complete_multipart_upload(
        &self,
        cx: &OpContext,
        session_id: &str,
        complete: &stowage_core::MultipartComplete,
    ) -> Result<UploadOutcome> {
        crate::multipart::complete(self, cx, session_id, complete)
    }

    fn abort_multipart_upload(&self, cx: &OpContext, session_id: &str) -> Result<()> {
        crate::multipart::abort(self, cx, session_id)
    }

    fn proxy_multipart_chunk(
        &self,
        cx: &OpContext,
        session_id: &str,
        part_number: u32,
        chunk: ByteSource,
    ) -> Result<stowage_types::PartInfo> {
        crate::multipart::proxy_chunk(self, cx, session_id, part_number, chunk)
    }
}

/// Shared fetch machinery for attachment CDN reads.
#[derive(Clone)]
pub(crate) struct ChunksFetcher {
    pub(crate) client: Client,
    pub(crate) endpoint: String,
    pub(crate) token: Option<String>,
    pub(crate) semaphore: Arc<FairSemaphore>,
    pub(crate) default_channel: String,
    pub(crate) backoff: BackoffConfig,
}

impl ChunksFetcher {
    fn refresh_url(
        &self,
        cancel: &CancelToken,
        channel_id: &str,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<String> {
        let token = self.token.as_ref().ok_or_else(|| {
            StorageError::new(
                ErrorCode::TokenRequired,
                "refreshing an expired attachment URL requires a bot token",
            )
        })?;
        let _guard = self.semaphore.acquire(cancel)?;
        let url = format!("{}/channels/{channel_id}/messages/{message_id}", self.endpoint);
        let req = self.client.get(&url).header("authorization", format!("Bot {token}"));
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff, cancel)?;
        let resp = ensure_success(resp)?;
        let message: MessageResponse = resp
            .json()
            .map_err(|e| StorageError::upstream(format!("malformed message response: {e}")))?;
        message
            .attachments
            .into_iter()
            .find(|a| a.id == attachment_id)
            .map(|a| a.url)
            .ok_or_else(|| StorageError::not_found(format!("attachment {attachment_id}")))
    }

    fn fetch_url(
        &self,
        cancel: &CancelToken,
        url: &str,
        range: Option<&ByteRange>,
    ) -> Result<ByteStream> {
        let mut req = self.client.get(url);
        if let Some(range) = range {
            req = req.header("range", range.header_value());
        }
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff, cancel)?;
        let resp = ensure_success(resp)?;
        Ok(response_stream(resp))
    }

    /// Fetch one planned part, slicing in software when the CDN ignores the
    /// Range header.
    pub(crate) fn fetch_part(&self, cancel: &CancelToken, read: &PartRead) -> Result<ByteStream> {
        cancel.checkpoint()?;
        let channel = read
            .part
            .channel_id
            .as_deref()
            .unwrap_or(&self.default_channel)
            .to_string();
        let url = match &read.part.url {
            Some(url) => url.clone(),
            None => self.refresh_url(
                cancel,
                &channel,
                &read.part.message_id,
                &read.part.attachment_id,
            )?,
        };
        let wants_range = !read.is_whole_part();
        let range = wants_range.then_some(read.local);

        let stream = match self.fetch_url(cancel, &url, range.as_ref()) {
            Ok(stream) => stream,
            Err(e) if e.is_not_found() || e.code() == ErrorCode::Forbidden => {
                // Signed CDN URLs expire; refresh once and retry.
                let fresh = self.refresh_url(
                    cancel,
                    &channel,
                    &read.part.message_id,
                    &read.part.attachment_id,
                )?;
                self.fetch_url(cancel, &fresh, range.as_ref())?
            }
            Err(e) => return Err(e),
        };

        if wants_range && !stream.partial {
            return slice_stream(stream, read.local);
        }
        Ok(stream)
    }
}

/// Lazily chains planned part reads into one stream.
struct ChunksReader {
    fetcher: Arc<ChunksFetcher>,
    plan: std::collections::VecDeque<PartRead>,
    current: Option<ByteStream>,
    cancel: CancelToken,
}

impl std::io::Read for ChunksReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(std::io::Error::other("operation cancelled"));
            }
            if let Some(current) = self.current.as_mut() {
                let n = current.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                self.current = None;
            }
            let Some(next) = self.plan.pop_front() else {
                return Ok(0);
            };
            let stream = self
                .fetcher
                .fetch_part(&self.cancel, &next)
                .map_err(std::io::Error::other)?;
            self.current = Some(stream);
        }
    }
}

/// Opener for single-attachment files.
struct AttachmentOpener {
    fetcher: ChunksFetcher,
    channel_id: String,
    message_id: String,
    attachment_id: String,
    url: Mutex<String>,
}

impl AttachmentOpener {
    fn open(&self, cancel: &CancelToken, range: Option<ByteRange>) -> Result<ByteStream> {
        let url = self.url.lock().expect("url poisoned").clone();
        match self.fetcher.fetch_url(cancel, &url, range.as_ref()) {
            Ok(stream) => Ok(stream),
            Err(e) if e.is_not_found() || e.code() == ErrorCode::Forbidden => {
                let fresh = self.fetcher.refresh_url(
                    cancel,
                    &self.channel_id,
                    &self.message_id,
                    &self.attachment_id,
                )?;
                *self.url.lock().expect("url poisoned") = fresh.clone();
                self.fetcher.fetch_url(cancel, &fresh, range.as_ref())
            }
            Err(e) => Err(e),
        }
    }
}

impl StreamOpener for AttachmentOpener {
    fn open_full(&self, cancel: &CancelToken) -> Result<ByteStream> {
        self.open(cancel, None)
    }

    fn open_range(&self, cancel: &CancelToken, range: ByteRange) -> Result<ByteStream> {
        self.open(cancel, Some(range))
    }

    fn open_head(&self, cancel: &CancelToken) -> Result<StreamMeta> {
        let url = self.url.lock().expect("url poisoned").clone();
        let req = self.fetcher.client.head(&url);
        let resp = send_with_retry(&req, RetryMode::Read, &self.fetcher.backoff, cancel)?;
        Ok(StreamMeta {
            status: resp.status().as_u16(),
            size: resp.content_length(),
            content_type: resp
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            etag: None,
            last_modified: None,
        })
    }
}

/// Opener for chunked files.
struct ChunksOpener {
    fetcher: ChunksFetcher,
    layout: ChunkLayout,
}

impl ChunksOpener {
    fn reader(&self, cancel: &CancelToken, plan: Vec<PartRead>, partial: bool) -> ByteStream {
        let content_length = plan
            .iter()
            .map(|r| r.local.len().or(r.part.size))
            .try_fold(0u64, |acc, len| len.map(|l| acc + l));
        let reader = ChunksReader {
            fetcher: Arc::new(self.fetcher.clone()),
            plan: plan.into(),
            current: None,
            cancel: cancel.clone(),
        };
        ByteStream::new(Box::new(reader), partial, content_length)
    }
}

impl StreamOpener for ChunksOpener {
    fn open_full(&self, cancel: &CancelToken) -> Result<ByteStream> {
        Ok(self.reader(cancel, self.layout.plan_full(), false))
    }

    fn open_range(&self, cancel: &CancelToken, range: ByteRange) -> Result<ByteStream> {
        let plan = self.layout.plan_range(range)?;
        // Parts are already sliced to the requested window.
        Ok(self.reader(cancel, plan, true))
    }

    fn open_head(&self, _cancel: &CancelToken) -> Result<StreamMeta> {
        Ok(StreamMeta {
            status: 200,
            size: self.layout.total_size,
            content_type: None,
            etag: None,
            last_modified: None,
        })
    }
}
