//! The git-hosting driver proper.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Body, Client, RequestBuilder};
use tracing::{debug, warn};

use crate::api::{
    CommitListRow, ContentsObject, CreatedObject, GitCommit, GitHostBackend, GitRef, GitTree,
    GitTreeEntry, NewTreeEntry, RepoMeta, SUBMODULE_MIMETYPE, reject_truncated, submodule_error,
};
use crate::encode::JsonBase64Body;
use stowage_core::cache::{FifoMap, TtlCell};
use stowage_core::http::{
    RetryMode, build_client, ensure_success, response_stream, send_with_retry, status_error,
    transport_error,
};
use stowage_core::{
    ByteRange, ByteSource, ByteStream, CancelToken, OpContext, RangeFallback, StorageDriver,
    StreamDescriptor, StreamMeta, StreamOpener,
};
use stowage_retry::BackoffConfig;
use stowage_sessions::SessionStore;
use stowage_types::refspec::is_commit_id;
use stowage_types::{
    BatchRemoveReport, Capability, CapabilitySet, CopyOptions, CreateDirOutcome,
    CredentialDecryptor, DirListing, DownloadLink, DriverConfig, DriverKind, DriverOptions,
    ErrorCode, LinkKind, LinkOptions, ListOptions, RemoveFailure, Result, StatRecord,
    StorageError, TransferOutcome, UpdateOutcome, UploadOptions, UploadOutcome, path,
};

/// Blob creation caps out at 100 MiB on the backend.
pub(crate) const BLOB_LIMIT: u64 = 100 * 1024 * 1024;

/// Contents-API listings at or past this size switch to one `trees` call.
const CONTENTS_SWITCH: usize = 1000;

const MODIFIED_CACHE_CAP: usize = 1000;
const TREE_SHA_CACHE_CAP: usize = 500;
const REPO_META_TTL: std::time::Duration = std::time::Duration::from_secs(60);

/// One mutation in a composed commit.
pub(crate) enum Change {
    /// New content, streamed into a fresh blob.
    Content { path: String, bytes: Vec<u8> },
    /// Reuse an existing blob under a new path.
    Reuse { path: String, sha: String },
    Delete { path: String },
}

/// Driver for Git-hosting repositories (Contents + Git Database APIs).
pub struct GitHostDriver {
    name: String,
    pub(crate) options: DriverOptions,
    pub(crate) backend: GitHostBackend,
    endpoint: String,
    pub(crate) client: Client,
    token: Option<String>,
    capabilities: CapabilitySet,
    repo_meta: TtlCell<RepoMeta>,
    modified: FifoMap<String, Option<DateTime<Utc>>>,
    tree_shas: FifoMap<String, String>,
    /// Serializes the whole HEAD→tree→commit→ref pipeline and carries the
    /// finish time of the previous write for throttling.
    write_gate: Mutex<Option<Instant>>,
    pub(crate) sessions: Arc<dyn SessionStore>,
}

impl GitHostDriver {
    pub fn new(config: DriverConfig, sessions: Arc<dyn SessionStore>) -> Result<Self> {
        let backend: GitHostBackend = config.backend_config()?;
        if backend.owner.is_empty() || backend.repo.is_empty() {
            return Err(StorageError::invalid_config(
                "git host driver requires owner and repo",
            ));
        }
        let endpoint = config
            .endpoint
            .as_deref()
            .unwrap_or("https://api.github.com")
            .trim_end_matches('/')
            .to_string();
        let client = build_client(
            None,
            stowage_core::http::DEFAULT_TIMEOUT,
            config.options.tls_skip_verify,
        )?;
        Ok(Self {
            name: config.name,
            options: config.options,
            backend,
            endpoint,
            client,
            token: config.credential,
            capabilities: CapabilitySet::EMPTY,
            repo_meta: TtlCell::new(),
            modified: FifoMap::new(MODIFIED_CACHE_CAP),
            tree_shas: FifoMap::new(TREE_SHA_CACHE_CAP),
            write_gate: Mutex::new(None),
            sessions,
        })
    }

    pub(crate) fn api_base(&self) -> String {
        format!(
            "{}/repos/{}/{}",
            self.endpoint, self.backend.owner, self.backend.repo
        )
    }

    fn raw_base(&self) -> String {
        let base = self
            .backend
            .cdn_proxy
            .as_deref()
            .or(self.backend.raw_endpoint.as_deref())
            .unwrap_or("https://raw.githubusercontent.com")
            .trim_end_matches('/');
        format!(
            "{base}/{}/{}/{}",
            self.backend.owner, self.backend.repo, self.backend.reference
        )
    }

    pub(crate) fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        let builder = builder.header("x-github-api-version", "2022-11-28");
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub(crate) fn read_backoff(&self) -> BackoffConfig {
        BackoffConfig::reads()
            .with_max_attempts(self.options.retry_attempts)
            .with_max_delay(self.options.retry_max_delay)
    }

    /// One attempt, plus the single re-send the write gate grants to a
    /// proven-unexecuted rate limit. Double-commit risk rules out anything
    /// looser.
    fn write_backoff(&self) -> BackoffConfig {
        BackoffConfig::writes().with_max_delay(self.options.retry_max_delay)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, cx: &OpContext, url: &str) -> Result<T> {
        let req = self.authed(self.client.get(url));
        let resp = send_with_retry(&req, RetryMode::Read, &self.read_backoff(), &cx.cancel)?;
        let resp = ensure_success(resp)?;
        let body = resp
            .text()
            .map_err(|e| StorageError::upstream(format!("reading response failed: {e}")))?;
        serde_json::from_str(&body).map_err(|e| {
            StorageError::new(
                ErrorCode::InvalidJson,
                format!("malformed backend JSON: {e}: {}", stowage_types::snippet(&body)),
            )
        })
    }

    fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        cx: &OpContext,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        let req = self.authed(self.client.post(url)).json(body);
        let resp = send_with_retry(&req, RetryMode::Write, &self.write_backoff(), &cx.cancel)?;
        let resp = ensure_success(resp)?;
        let body = resp
            .text()
            .map_err(|e| StorageError::upstream(format!("reading response failed: {e}")))?;
        serde_json::from_str(&body).map_err(|e| {
            StorageError::new(
                ErrorCode::InvalidJson,
                format!("malformed backend JSON: {e}: {}", stowage_types::snippet(&body)),
            )
        })
    }

    fn fetch_repo_meta(&self, cx: &OpContext) -> Result<RepoMeta> {
        self.repo_meta.get_or_fetch(REPO_META_TTL, &cx.cancel, || {
            self.get_json(cx, &self.api_base())
        })
    }

    /// The branch name when the configured reference is writable.
    fn writable_branch(&self) -> Option<&str> {
        let reference = self.backend.reference.as_str();
        if is_commit_id(reference) {
            return None;
        }
        if reference.starts_with("refs/tags/") || reference.starts_with("tags/") {
            return None;
        }
        Some(
            reference
                .strip_prefix("refs/heads/")
                .or_else(|| reference.strip_prefix("heads/"))
                .unwrap_or(reference),
        )
    }

    pub(crate) fn ensure_writable(&self) -> Result<&str> {
        if self.token.is_none() {
            return Err(StorageError::new(
                ErrorCode::TokenRequiredForWrite,
                "writing requires a credential with push access",
            ));
        }
        self.writable_branch().ok_or_else(|| {
            StorageError::new(
                ErrorCode::RevisionNotWritable,
                format!(
                    "reference {} is not a branch; only branches accept writes",
                    self.backend.reference
                ),
            )
        })
    }

    // -- Object lookups

    fn contents_url(&self, repo_path: &str) -> String {
        if repo_path.is_empty() {
            format!("{}/contents/?ref={}", self.api_base(), self.backend.reference)
        } else {
            format!(
                "{}/contents/{}?ref={}",
                self.api_base(),
                repo_path,
                self.backend.reference
            )
        }
    }

    fn contents_object(&self, cx: &OpContext, repo_path: &str) -> Result<ContentsObject> {
        let req = self
            .authed(self.client.get(self.contents_url(repo_path)))
            .header("accept", "application/vnd.github.object+json");
        let resp = send_with_retry(&req, RetryMode::Read, &self.read_backoff(), &cx.cancel)?;
        if resp.status().as_u16() == 404 {
            return Err(StorageError::not_found(format!("/{repo_path}")));
        }
        let resp = ensure_success(resp)?;
        let body = resp
            .text()
            .map_err(|e| StorageError::upstream(format!("reading contents failed: {e}")))?;
        serde_json::from_str(&body).map_err(|e| {
            StorageError::new(
                ErrorCode::InvalidJson,
                format!("malformed contents object: {e}: {}", stowage_types::snippet(&body)),
            )
        })
    }

    /// Best-effort last-modified via the commits listing, FIFO-cached.
    ///
    /// Never called during directory listings; one query per file would put
    /// N+1 pressure on the rate limit.
    fn last_modified(&self, cx: &OpContext, repo_path: &str) -> Option<DateTime<Utc>> {
        if let Some(cached) = self.modified.get(&repo_path.to_string()) {
            return cached;
        }
        let url = format!(
            "{}/commits?path={}&sha={}&per_page=1",
            self.api_base(),
            repo_path,
            self.backend.reference
        );
        let value = self
            .get_json::<Vec<CommitListRow>>(cx, &url)
            .ok()
            .and_then(|rows| {
                rows.first()
                    .and_then(|row| row.commit.committer.as_ref())
                    .and_then(|sig| sig.date.as_deref())
                    .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
                    .map(|d| d.with_timezone(&Utc))
            });
        self.modified.insert(repo_path.to_string(), value);
        value
    }

    /// Resolve HEAD of the configured branch: (commit sha, tree sha).
    fn resolve_head(&self, cx: &OpContext, branch: &str) -> Result<(String, String)> {
        let ref_url = format!("{}/git/ref/heads/{branch}", self.api_base());
        let git_ref: GitRef = self.get_json(cx, &ref_url)?;
        let commit_url = format!("{}/git/commits/{}", self.api_base(), git_ref.object.sha);
        let commit: GitCommit = self.get_json(cx, &commit_url)?;
        Ok((git_ref.object.sha, commit.tree.sha))
    }

    /// Tree sha for a directory, walking path segments from HEAD.
    fn tree_sha_for(&self, cx: &OpContext, repo_path: &str) -> Result<String> {
        let key = format!("{}:{repo_path}", self.backend.reference);
        if let Some(sha) = self.tree_shas.get(&key) {
            return Ok(sha);
        }
        let branch = self
            .writable_branch()
            .unwrap_or(self.backend.reference.as_str());
        let (_, mut sha) = self.resolve_head(cx, branch)?;
        if !repo_path.is_empty() {
            for segment in repo_path.split('/') {
                let url = format!("{}/git/trees/{sha}", self.api_base());
                let tree: GitTree = self.get_json(cx, &url)?;
                sha = tree
                    .tree
                    .iter()
                    .find(|e| e.entry_type == "tree" && e.path == segment)
                    .and_then(|e| e.sha.clone())
                    .ok_or_else(|| StorageError::not_found(format!("/{repo_path}")))?;
            }
        }
        self.tree_shas.insert(key, sha.clone());
        Ok(sha)
    }

    /// Recursive tree from HEAD; fails on truncation.
    pub(crate) fn recursive_tree(&self, cx: &OpContext) -> Result<GitTree> {
        let branch = self
            .writable_branch()
            .unwrap_or(self.backend.reference.as_str());
        let (_, tree_sha) = self.resolve_head(cx, branch)?;
        let url = format!("{}/git/trees/{tree_sha}?recursive=1", self.api_base());
        let tree: GitTree = self.get_json(cx, &url)?;
        reject_truncated(&tree)?;
        Ok(tree)
    }

    // -- Write pipeline

    /// Create one blob from a streaming base64 body.
    pub(crate) fn create_blob(&self, cx: &OpContext, bytes: Vec<u8>) -> Result<String> {
        if bytes.len() as u64 > BLOB_LIMIT {
            return Err(StorageError::new(
                ErrorCode::FileTooLarge,
                format!("{} bytes exceeds the 100 MiB blob limit", bytes.len()),
            ));
        }
        cx.cancel.checkpoint()?;
        let body = JsonBase64Body::new(std::io::Cursor::new(bytes), Some(BLOB_LIMIT));
        let url = format!("{}/git/blobs", self.api_base());
        // The body streams, so this request is not replayable; writes do not
        // retry anyway.
        let resp = self
            .authed(self.client.post(&url))
            .header("content-type", "application/json")
            .body(Body::new(body))
            .send()
            .map_err(transport_error)?;
        let resp = ensure_success(resp)?;
        let created: CreatedObject = resp
            .json()
            .map_err(|e| StorageError::upstream(format!("malformed blob response: {e}")))?;
        Ok(created.sha)
    }

    /// Compose and land one commit; strictly serial per instance.
    pub(crate) fn commit_changes(
        &self,
        cx: &OpContext,
        message: &str,
        changes: Vec<Change>,
    ) -> Result<String> {
        let branch = self.ensure_writable()?.to_string();
        if changes.is_empty() {
            return Err(StorageError::invalid_config("commit has no changes"));
        }

        let mut gate = self.write_gate.lock().expect("write gate poisoned");
        if let Some(last) = *gate {
            let since = last.elapsed();
            if since < self.options.write_throttle {
                std::thread::sleep(self.options.write_throttle - since);
            }
        }
        cx.cancel.checkpoint()?;

        let (head_sha, base_tree) = match self.resolve_head(cx, &branch) {
            Ok(head) => head,
            Err(e) if e.is_not_found() => {
                self.bootstrap_empty_repo(cx, &branch)?;
                self.resolve_head(cx, &branch)?
            }
            Err(e) => return Err(e),
        };

        let mut entries = Vec::with_capacity(changes.len());
        for change in changes {
            cx.cancel.checkpoint()?;
            match change {
                Change::Content { path, bytes } => {
                    let sha = self.create_blob(cx, bytes)?;
                    entries.push(NewTreeEntry::blob(path, sha));
                }
                Change::Reuse { path, sha } => entries.push(NewTreeEntry::blob(path, sha)),
                Change::Delete { path } => entries.push(NewTreeEntry::delete(path)),
            }
        }

        let tree: CreatedObject = self.post_json(
            cx,
            &format!("{}/git/trees", self.api_base()),
            &serde_json::json!({"base_tree": base_tree, "tree": entries}),
        )?;

        let mut commit_body = serde_json::json!({
            "message": message,
            "tree": tree.sha,
            "parents": [head_sha],
        });
        if let (Some(name), Some(email)) =
            (&self.backend.author_name, &self.backend.author_email)
        {
            commit_body["author"] = serde_json::json!({"name": name, "email": email});
            commit_body["committer"] = serde_json::json!({"name": name, "email": email});
        }
        let commit: CreatedObject =
            self.post_json(cx, &format!("{}/git/commits", self.api_base()), &commit_body)?;

        let patch_url = format!("{}/git/refs/heads/{branch}", self.api_base());
        let req = self
            .authed(self.client.patch(&patch_url))
            .json(&serde_json::json!({"sha": commit.sha, "force": false}));
        let resp = send_with_retry(&req, RetryMode::Write, &self.write_backoff(), &cx.cancel)?;
        ensure_success(resp)?;

        *gate = Some(Instant::now());
        drop(gate);

        self.modified.clear();
        self.tree_shas.clear();
        debug!(commit = %commit.sha, "landed commit");
        Ok(commit.sha)
    }

    /// Seed an empty repository: a Contents-API PUT creates the first commit
    /// and the branch ref in one step.
    fn bootstrap_empty_repo(&self, cx: &OpContext, branch: &str) -> Result<()> {
        let meta = self.fetch_repo_meta(cx).unwrap_or_default();
        debug!(size = meta.size, "branch missing; seeding empty repository");
        let url = format!("{}/contents/.gitkeep", self.api_base());
        let req = self.authed(self.client.put(&url)).json(&serde_json::json!({
            "message": "Initialize repository",
            "content": "",
            "branch": branch,
        }));
        let resp = send_with_retry(&req, RetryMode::Write, &self.write_backoff(), &cx.cancel)?;
        ensure_success(resp)?;
        Ok(())
    }

    fn entry_record(&self, parent_logical: &str, entry: &crate::api::ContentsEntry) -> StatRecord {
        let logical = path::join(parent_logical, &entry.name);
        if entry.is_dir() {
            StatRecord::directory(format!("{logical}/"), entry.name.clone())
        } else if entry.is_submodule() {
            StatRecord {
                path: logical,
                name: entry.name.clone(),
                is_directory: false,
                size: None,
                modified: None,
                mimetype: SUBMODULE_MIMETYPE.to_string(),
                etag: Some(entry.sha.clone()),
                storage_backend: Some(DriverKind::GitHost),
            }
        } else {
            let mut record =
                StatRecord::file(logical, entry.name.clone(), Some(entry.size));
            record.etag = Some(entry.sha.clone());
            record.storage_backend = Some(DriverKind::GitHost);
            record
        }
    }

    fn tree_entry_record(&self, parent_logical: &str, entry: &GitTreeEntry) -> StatRecord {
        let name = entry.path.clone();
        let logical = path::join(parent_logical, &name);
        if entry.entry_type == "tree" {
            StatRecord::directory(format!("{logical}/"), name)
        } else if entry.is_submodule() {
            StatRecord {
                path: logical,
                name,
                is_directory: false,
                size: None,
                modified: None,
                mimetype: SUBMODULE_MIMETYPE.to_string(),
                etag: entry.sha.clone(),
                storage_backend: Some(DriverKind::GitHost),
            }
        } else {
            let mut record = StatRecord::file(logical, name, entry.size);
            record.etag = entry.sha.clone();
            record.storage_backend = Some(DriverKind::GitHost);
            record
        }
    }

    /// Collect the blobs under a directory from one recursive tree fetch.
    ///
    /// Any submodule in the subtree rejects the operation.
    pub(crate) fn blobs_under(
        &self,
        cx: &OpContext,
        repo_prefix: &str,
    ) -> Result<Vec<GitTreeEntry>> {
        let tree = self.recursive_tree(cx)?;
        let prefix = if repo_prefix.is_empty() {
            String::new()
        } else {
            format!("{repo_prefix}/")
        };
        let mut blobs = Vec::new();
        for entry in tree.tree {
            let in_scope =
                repo_prefix.is_empty() || entry.path.starts_with(&prefix) || entry.path == repo_prefix;
            if !in_scope {
                continue;
            }
            if entry.is_submodule() {
                return Err(submodule_error(&format!("/{}", entry.path)));
            }
            if entry.is_blob() {
                blobs.push(entry);
            }
        }
        Ok(blobs)
    }

    fn transfer_item(
        &self,
        cx: &OpContext,
        src: &str,
        dst: &str,
        skip_existing: bool,
        delete_source: bool,
    ) -> Result<TransferOutcome> {
        let src_norm = path::normalize(src, None)?;
        let dst_norm = path::normalize(dst, None)?;
        self.ensure_writable()?;

        if skip_existing && self.exists(cx, &dst_norm)? {
            return Ok(TransferOutcome::skipped());
        }

        let verb = if delete_source { "Rename" } else { "Copy" };
        let message = format!("{verb} {src_norm} to {dst_norm}");
        let mut changes = Vec::new();

        if src_norm.ends_with('/') {
            let src_repo = path::strip_root(src_norm.trim_end_matches('/')).to_string();
            let dst_repo = path::strip_root(dst_norm.trim_end_matches('/')).to_string();
            let blobs = self.blobs_under(cx, &src_repo)?;
            if blobs.is_empty() {
                return Err(StorageError::not_found(&src_norm));
            }
            let prefix = format!("{src_repo}/");
            for blob in blobs {
                let sha = blob.sha.clone().ok_or_else(|| {
                    StorageError::new(ErrorCode::InvalidResponse, "tree entry without sha")
                })?;
                let rel = blob.path.strip_prefix(&prefix).unwrap_or(&blob.path);
                changes.push(Change::Reuse { path: format!("{dst_repo}/{rel}"), sha: sha.clone() });
                if delete_source {
                    changes.push(Change::Delete { path: blob.path.clone() });
                }
            }
        } else {
            let src_repo = path::strip_root(&src_norm).to_string();
            let dst_repo = path::strip_root(&dst_norm).to_string();
            let object = self.contents_object(cx, &src_repo)?;
            match object.object_type.as_str() {
                "file" | "symlink" => {}
                "submodule" => return Err(submodule_error(&src_norm)),
                "dir" => {
                    return Err(StorageError::invalid_path(format!(
                        "{src_norm} is a directory; use a trailing slash"
                    )));
                }
                other => {
                    return Err(StorageError::new(
                        ErrorCode::InvalidResponse,
                        format!("unexpected object type {other}"),
                    ));
                }
            }
            changes.push(Change::Reuse { path: dst_repo, sha: object.sha.clone() });
            if delete_source {
                changes.push(Change::Delete { path: src_repo });
            }
        }

        self.commit_changes(cx, &message, changes)?;
        Ok(TransferOutcome::success())
    }
}

impl StorageDriver for GitHostDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::GitHost
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

        let mut caps = CapabilitySet::new(&[Capability::Reader, Capability::Proxy]);
        if self.token.is_some() && self.writable_branch().is_some() {
            caps.insert(Capability::Writer);
            caps.insert(Capability::Atomic);
            caps.insert(Capability::Multipart);
        }

        let cx = OpContext::new();
        match self.fetch_repo_meta(&cx) {
            Ok(meta) if !meta.private => caps.insert(Capability::DirectLink),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "repo probe failed during initialize"),
        }
        self.capabilities = caps;
        Ok(())
    }

    fn stat(&self, cx: &OpContext, raw: &str) -> Result<StatRecord> {
        let normalized = path::normalize(raw, None)?;
        if path::is_root(&normalized) {
            return Ok(StatRecord::directory("/", ""));
        }
        let repo_path = path::strip_root(normalized.trim_end_matches('/'));
        let object = self.contents_object(cx, repo_path)?;
        let parent = path::parent(&normalized);
        let name = path::file_name(&normalized).to_string();
        let record = match object.object_type.as_str() {
            "dir" => StatRecord::directory(format!("{}{name}/", parent), name),
            "submodule" => StatRecord {
                path: normalized.clone(),
                name,
                is_directory: false,
                size: None,
                modified: None,
                mimetype: SUBMODULE_MIMETYPE.to_string(),
                etag: Some(object.sha.clone()),
                storage_backend: Some(DriverKind::GitHost),
            },
            _ => {
                let mut record =
                    StatRecord::file(normalized.clone(), name, Some(object.size));
                record.etag = Some(object.sha.clone());
                record.modified = self.last_modified(cx, repo_path);
                record.storage_backend = Some(DriverKind::GitHost);
                record
            }
        };
        Ok(record)
    }

    fn list_directory(&self, cx: &OpContext, raw: &str, _opts: &ListOptions) -> Result<DirListing> {
        let normalized = path::normalize(raw, Some(true))?;
        let repo_path = path::strip_root(normalized.trim_end_matches('/')).to_string();
        let parent_logical = normalized.trim_end_matches('/');
        let parent_logical = if parent_logical.is_empty() { "/" } else { parent_logical };

        let object = self.contents_object(cx, &repo_path)?;
        let entries = object.entries.unwrap_or_default();

        let items: Vec<StatRecord> = if entries.len() >= CONTENTS_SWITCH {
            // Contents caps out; one non-recursive trees call sees everything.
            let sha = self.tree_sha_for(cx, &repo_path)?;
            let url = format!("{}/git/trees/{sha}", self.api_base());
            let tree: GitTree = self.get_json(cx, &url)?;
            tree.tree
                .iter()
                .filter(|e| e.path != ".gitkeep")
                .map(|e| self.tree_entry_record(parent_logical, e))
                .collect()
        } else {
            entries
                .iter()
                .filter(|e| e.name != ".gitkeep")
                .map(|e| self.entry_record(parent_logical, e))
                .collect()
        };

        Ok(DirListing {
            items,
            is_root: path::is_root(&normalized),
            has_more: None,
            next_cursor: None,
        })
    }

    fn download_file(&self, cx: &OpContext, raw: &str) -> Result<StreamDescriptor> {
        let normalized = path::normalize(raw, Some(false))?;
        let repo_path = path::strip_root(&normalized).to_string();
        let record = self.stat(cx, &normalized)?;
        if record.is_directory {
            return Err(StorageError::invalid_path(format!("{normalized} is a directory")));
        }
        if record.mimetype == SUBMODULE_MIMETYPE {
            return Err(submodule_error(&normalized));
        }

        let is_private = self.fetch_repo_meta(cx).map(|m| m.private).unwrap_or(true);
        let contents_raw = RawTarget {
            url: self.contents_url(&repo_path),
            accept: Some("application/vnd.github.raw"),
            token: self.token.clone(),
        };
        let (primary, fallback) = if is_private {
            (contents_raw, None)
        } else {
            (
                RawTarget {
                    url: format!("{}/{repo_path}", self.raw_base()),
                    accept: None,
                    token: None,
                },
                Some(contents_raw),
            )
        };

        let opener = GitHostOpener {
            client: self.client.clone(),
            primary,
            fallback,
            backoff: self.read_backoff(),
        };
        Ok(StreamDescriptor::new(record.mimetype.clone(), Box::new(opener))
            .with_size(record.size)
            .with_etag(record.etag)
            .with_last_modified(record.modified)
            .with_range_support(RangeFallback::Honor206))
    }

    fn generate_direct_link(
        &self,
        cx: &OpContext,
        raw: &str,
        _opts: &LinkOptions,
    ) -> Result<DownloadLink> {
        let normalized = path::normalize(raw, Some(false))?;
        let is_private = self.fetch_repo_meta(cx).map(|m| m.private).unwrap_or(true);
        if is_private {
            return Err(StorageError::new(
                ErrorCode::DirectLinkNotAvailable,
                "private repositories cannot be linked directly; use the proxy",
            ));
        }
        Ok(DownloadLink {
            url: format!("{}{normalized}", self.raw_base()),
            kind: LinkKind::NativeDirect,
        })
    }

    fn upload_file(
        &self,
        cx: &OpContext,
        raw: &str,
        source: ByteSource,
        _opts: &UploadOptions,
    ) -> Result<UploadOutcome> {
        let normalized = path::normalize(raw, Some(false))?;
        path::require_name(&normalized)?;
        self.ensure_writable()?;
        if let Some(len) = source.len_hint() {
            if len > BLOB_LIMIT {
                return Err(StorageError::new(
                    ErrorCode::FileTooLarge,
                    format!("{len} bytes exceeds the 100 MiB blob limit"),
                ));
            }
        }
        let repo_path = path::strip_root(&normalized).to_string();
        let bytes = source.into_bytes()?;
        self.commit_changes(
            cx,
            &format!("Upload {repo_path}"),
            vec![Change::Content { path: repo_path, bytes }],
        )?;
        Ok(UploadOutcome { storage_path: raw.to_string() })
    }

    fn update_file(&self, cx: &OpContext, raw: &str, body: &[u8]) -> Result<UpdateOutcome> {
        let normalized = path::normalize(raw, Some(false))?;
        self.ensure_writable()?;
        let repo_path = path::strip_root(&normalized).to_string();
        self.commit_changes(
            cx,
            &format!("Update {repo_path}"),
            vec![Change::Content { path: repo_path, bytes: body.to_vec() }],
        )?;
        Ok(UpdateOutcome { path: normalized })
    }

    fn create_directory(&self, cx: &OpContext, raw: &str) -> Result<CreateDirOutcome> {
        let normalized = path::normalize(raw, Some(true))?;
        path::require_name(&normalized)?;
        self.ensure_writable()?;
        let repo_path = path::strip_root(normalized.trim_end_matches('/')).to_string();
        if self.contents_object(cx, &repo_path).is_ok() {
            return Ok(CreateDirOutcome { path: normalized, already_existed: true });
        }
        self.commit_changes(
            cx,
            &format!("Create directory {repo_path}"),
            vec![Change::Content { path: format!("{repo_path}/.gitkeep"), bytes: Vec::new() }],
        )?;
        Ok(CreateDirOutcome { path: normalized, already_existed: false })
    }

    fn rename_item(&self, cx: &OpContext, src: &str, dst: &str) -> Result<TransferOutcome> {
        self.transfer_item(cx, src, dst, false, true)
    }

    fn copy_item(
        &self,
        cx: &OpContext,
        src: &str,
        dst: &str,
        opts: &CopyOptions,
    ) -> Result<TransferOutcome> {
        self.transfer_item(cx, src, dst, opts.skip_existing, false)
    }

    fn batch_remove_items(
        &self,
        cx: &OpContext,
        paths: &[String],
        display_paths: &[String],
    ) -> Result<BatchRemoveReport> {
        self.ensure_writable()?;
        let mut report = BatchRemoveReport::default();
        let mut changes = Vec::new();
        let mut committed = Vec::new();
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
            let repo_path = path::strip_root(normalized.trim_end_matches('/')).to_string();
            if normalized.ends_with('/') {
                match self.blobs_under(cx, &repo_path) {
                    Ok(blobs) => {
                        for blob in blobs {
                            changes.push(Change::Delete { path: blob.path });
                        }
                        committed.push(display);
                    }
                    Err(e) => {
                        report.failed.push(RemoveFailure { path: display, error: e.to_string() });
                    }
                }
            } else {
                changes.push(Change::Delete { path: repo_path });
                committed.push(display);
            }
        }

        if !changes.is_empty() {
            match self.commit_changes(cx, "Delete files", changes) {
                Ok(_) => report.success = committed,
                Err(e) => {
                    let message = e.to_string();
                    report.failed.extend(committed.into_iter().map(|path| RemoveFailure {
                        path,
                        error: message.clone(),
                    }));
                }
            }
        }
        Ok(report)
    }

    fn initialize_multipart_upload(
        &self,
        cx: &OpContext,
        request: &stowage_core::MultipartInitRequest,
    ) -> Result<stowage_core::MultipartInitOutcome> {
        crate::multipart::initialize(self, cx, request)
    }

    fn sign_multipart_parts(
        &self,
        _cx: &OpContext,
        _session_id: &str,
    ) -> Result<stowage_core::SignedParts> {
        // Chunks flow through the driver; there is nothing to presign.
        Ok(stowage_core::SignedParts {
            presigned_urls: Vec::new(),
            completion_url: None,
            expires_at: None,
            reset_uploaded_parts: false,
        })
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
                driver: Some(DriverKind::GitHost),
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

/// One raw-content target: a URL plus the headers it needs.
struct RawTarget {
    url: String,
    accept: Option<&'static str>,
    token: Option<String>,
}

impl RawTarget {
    fn request(&self, client: &Client, range: Option<&ByteRange>) -> RequestBuilder {
        let mut req = client.get(&self.url);
        if let Some(accept) = self.accept {
            req = req.header("accept", accept);
        }
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(range) = range {
            req = req.header("range", range.header_value());
        }
        req
    }
}

/// CDN-first opener with a Contents-API fallback on 404.
struct GitHostOpener {
    client: Client,
    primary: RawTarget,
    fallback: Option<RawTarget>,
    backoff: BackoffConfig,
}

impl GitHostOpener {
    fn open(&self, cancel: &CancelToken, range: Option<ByteRange>) -> Result<ByteStream> {
        let resp = send_with_retry(
            &self.primary.request(&self.client, range.as_ref()),
            RetryMode::Read,
            &self.backoff,
            cancel,
        )?;
        if resp.status().as_u16() == 404 {
            // The CDN 404s for fresh files and for submodules; the Contents
            // API distinguishes a real miss.
            if let Some(fallback) = &self.fallback {
                let resp = send_with_retry(
                    &fallback.request(&self.client, range.as_ref()),
                    RetryMode::Read,
                    &self.backoff,
                    cancel,
                )?;
                let resp = ensure_success(resp)?;
                return Ok(response_stream(resp));
            }
        }
        let resp = ensure_success(resp)?;
        Ok(response_stream(resp))
    }
}

impl StreamOpener for GitHostOpener {
    fn open_full(&self, cancel: &CancelToken) -> Result<ByteStream> {
        self.open(cancel, None)
    }

    fn open_range(&self, cancel: &CancelToken, range: ByteRange) -> Result<ByteStream> {
        self.open(cancel, Some(range))
    }

    fn open_head(&self, cancel: &CancelToken) -> Result<StreamMeta> {
        let mut req = self.client.head(&self.primary.url);
        if let Some(token) = &self.primary.token {
            req = req.bearer_auth(token);
        }
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff, cancel)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(status_error(status, ""));
        }
        Ok(StreamMeta {
            status: status.as_u16(),
            size: resp
                .headers()
                .get("content-length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok()),
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
