//! The uniform driver contract.
//!
//! Each backend implements [`StorageDriver`] and publishes a capability set
//! from `initialize`. Default method bodies refuse what a driver does not
//! implement, before any network I/O — capability honesty is enforced here,
//! not in the orchestrator.

use std::collections::HashMap;
use std::io::Read;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::stream::StreamDescriptor;
use stowage_sessions::UploadSessionRecord;
use stowage_types::{
    BatchRemoveReport, Capability, CapabilitySet, CopyOptions, CreateDirOutcome,
    CredentialDecryptor, DirListing, DownloadLink, DriverKind, LinkKind, LinkOptions, ListOptions,
    PartInfo, Result, StatRecord, StorageError, TransferOutcome, UpdateOutcome, UploadMode,
    UploadOptions, UploadOutcome, UploadStrategy,
};

/// Per-operation context threaded through every driver call.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    pub cancel: CancelToken,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

/// Bytes flowing into an upload.
///
/// Small writes arrive buffered; large ones stream. Drivers that need the
/// whole body (multipart message posts) call [`ByteSource::into_bytes`];
/// drivers that can stream (WebDAV PUT, blob creation) consume the reader.
pub enum ByteSource {
    Bytes(Vec<u8>),
    Reader {
        reader: Box<dyn Read + Send>,
        len: Option<u64>,
    },
}

impl ByteSource {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        ByteSource::Bytes(bytes.into())
    }

    pub fn from_reader(reader: Box<dyn Read + Send>, len: Option<u64>) -> Self {
        ByteSource::Reader { reader, len }
    }

    /// Known length, when any.
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            ByteSource::Bytes(b) => Some(b.len() as u64),
            ByteSource::Reader { len, .. } => *len,
        }
    }

    /// Buffer the whole source into memory.
    pub fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            ByteSource::Bytes(b) => Ok(b),
            ByteSource::Reader { mut reader, len } => {
                let mut out = Vec::with_capacity(len.unwrap_or(0) as usize);
                reader
                    .read_to_end(&mut out)
                    .map_err(|e| StorageError::upstream(format!("reading upload source failed: {e}")).with_cause(e))?;
                Ok(out)
            }
        }
    }
}

impl std::fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ByteSource::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            ByteSource::Reader { len, .. } => f.debug_struct("Reader").field("len", len).finish(),
        }
    }
}

/// Request to start a front-end multipart upload.
#[derive(Debug, Clone)]
pub struct MultipartInitRequest {
    pub path: String,
    pub size: u64,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    /// sha256 of the content, when the backend addresses by digest.
    pub checksum: Option<String>,
}

/// Result of `initialize_multipart_upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartInitOutcome {
    pub session_id: String,
    pub strategy: UploadStrategy,
    pub mode: UploadMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_parts: Option<u32>,
    /// Part URLs for the `per_part_url` strategy, in part order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presigned_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// Result of `sign_multipart_parts` (a refresh of presigned material).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedParts {
    pub presigned_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// When true the client must discard its uploaded-parts ledger and
    /// restart from part 1 against the fresh URLs.
    pub reset_uploaded_parts: bool,
}

/// Input to `complete_multipart_upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartComplete {
    pub parts: Vec<PartInfo>,
}

/// The uniform driver contract.
///
/// Operations not overridden by a driver fail with a semantic refusal; the
/// refusal fires before any network call.
pub trait StorageDriver: Send + Sync {
    fn kind(&self) -> DriverKind;

    /// The mount name from the config envelope.
    fn name(&self) -> &str;

    /// Capabilities as computed by the last `initialize`.
    fn capabilities(&self) -> CapabilitySet;

    /// Resolve credentials, probe backend metadata and compute capabilities.
    fn initialize(&mut self, decryptor: Option<&dyn CredentialDecryptor>) -> Result<()>;

    fn stat(&self, cx: &OpContext, path: &str) -> Result<StatRecord>;

    /// `false` on not-found; every other failure re-raises.
    fn exists(&self, cx: &OpContext, path: &str) -> Result<bool> {
        match self.stat(cx, path) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn list_directory(&self, cx: &OpContext, path: &str, opts: &ListOptions)
    -> Result<DirListing>;

    fn download_file(&self, cx: &OpContext, path: &str) -> Result<StreamDescriptor>;

    fn generate_direct_link(
        &self,
        _cx: &OpContext,
        _path: &str,
        _opts: &LinkOptions,
    ) -> Result<DownloadLink> {
        Err(StorageError::new(
            stowage_types::ErrorCode::DirectLinkNotAvailable,
            "backend cannot produce a browser-usable direct link",
        ))
    }

    fn generate_proxy_link(&self, _cx: &OpContext, path: &str) -> Result<DownloadLink> {
        if !self.capabilities().contains(Capability::Proxy) {
            return Err(StorageError::unsupported("proxy links"));
        }
        Ok(proxy_link(self.name(), path))
    }

    fn upload_file(
        &self,
        _cx: &OpContext,
        _path: &str,
        _source: ByteSource,
        _opts: &UploadOptions,
    ) -> Result<UploadOutcome> {
        Err(StorageError::unsupported("uploads"))
    }

    fn update_file(&self, _cx: &OpContext, _path: &str, _body: &[u8]) -> Result<UpdateOutcome> {
        Err(StorageError::unsupported("updates"))
    }

    fn create_directory(&self, _cx: &OpContext, _path: &str) -> Result<CreateDirOutcome> {
        Err(StorageError::unsupported("directory creation"))
    }

    fn rename_item(&self, _cx: &OpContext, _src: &str, _dst: &str) -> Result<TransferOutcome> {
        Err(StorageError::unsupported("renames"))
    }

    fn copy_item(
        &self,
        _cx: &OpContext,
        _src: &str,
        _dst: &str,
        _opts: &CopyOptions,
    ) -> Result<TransferOutcome> {
        Err(StorageError::unsupported("copies"))
    }

    /// Remove many paths; directory paths expand to their leaf objects.
    ///
    /// `display_paths` parallels `paths` for error reporting and must be the
    /// same length when provided.
    fn batch_remove_items(
        &self,
        _cx: &OpContext,
        _paths: &[String],
        _display_paths: &[String],
    ) -> Result<BatchRemoveReport> {
        Err(StorageError::unsupported("removal"))
    }

    /// Name-substring search, for drivers advertising `SEARCH`.
    fn search(&self, _cx: &OpContext, _query: &str) -> Result<Vec<StatRecord>> {
        Err(StorageError::unsupported("search"))
    }

    // -- Front-end multipart session operations

    fn initialize_multipart_upload(
        &self,
        _cx: &OpContext,
        _request: &MultipartInitRequest,
    ) -> Result<MultipartInitOutcome> {
        Err(StorageError::unsupported("multipart uploads"))
    }

    fn sign_multipart_parts(&self, _cx: &OpContext, _session_id: &str) -> Result<SignedParts> {
        Err(StorageError::unsupported("multipart uploads"))
    }

    fn list_multipart_parts(&self, _cx: &OpContext, _session_id: &str) -> Result<Vec<PartInfo>> {
        Err(StorageError::unsupported("multipart uploads"))
    }

    fn list_multipart_uploads(&self, _cx: &OpContext) -> Result<Vec<UploadSessionRecord>> {
        Err(StorageError::unsupported("multipart uploads"))
    }

    fn complete_multipart_upload(
        &self,
        _cx: &OpContext,
        _session_id: &str,
        _complete: &MultipartComplete,
    ) -> Result<UploadOutcome> {
        Err(StorageError::unsupported("multipart uploads"))
    }

    fn abort_multipart_upload(&self, _cx: &OpContext, _session_id: &str) -> Result<()> {
        Err(StorageError::unsupported("multipart uploads"))
    }

    /// Accept one proxied chunk for the `single_session` strategy.
    fn proxy_multipart_chunk(
        &self,
        _cx: &OpContext,
        _session_id: &str,
        _part_number: u32,
        _chunk: ByteSource,
    ) -> Result<PartInfo> {
        Err(StorageError::unsupported("multipart uploads"))
    }
}

/// The proxy route shape the orchestrator serves for `PROXY` drivers.
pub fn proxy_link(mount: &str, path: &str) -> DownloadLink {
    DownloadLink {
        url: format!("/api/mounts/{mount}/proxy{path}"),
        kind: LinkKind::Proxy,
    }
}

/// Named collection of initialized drivers; the orchestrator dispatches by
/// capability query, never by downcasting.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Box<dyn StorageDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, driver: Box<dyn StorageDriver>) {
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn get(&self, name: &str) -> Option<&dyn StorageDriver> {
        self.drivers.get(name).map(|d| d.as_ref())
    }

    /// Fetch a driver only when it advertises a capability.
    pub fn get_with(&self, name: &str, capability: Capability) -> Result<&dyn StorageDriver> {
        let driver = self
            .get(name)
            .ok_or_else(|| StorageError::not_found(format!("mount '{name}'")))?;
        if !driver.capabilities().contains(capability) {
            return Err(StorageError::unsupported(capability.as_str()));
        }
        Ok(driver)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }
}
