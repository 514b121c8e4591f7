//! The hub dataset driver proper.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder};
use tracing::{debug, warn};

use crate::api::{
    AccessInfo, HubBackend, RefsInfo, RepoInfo, TreeEntry, decode_json, next_cursor_from_link,
    quote_path, quote_segment,
};
use crate::lfs::{
    CommitBuilder, LfsBatchRequest, LfsBatchResponse, UploadAuthorization, interpret_batch,
    sha256_hex,
};
use stowage_core::cache::{TtlCell, TtlMap};
use stowage_core::http::{
    RetryMode, build_client, ensure_success, response_stream, send_with_retry, status_error,
};
use stowage_core::{
    ByteRange, ByteSource, ByteStream, CancelToken, OpContext, RangeFallback, StorageDriver,
    StreamDescriptor, StreamMeta, StreamOpener,
};
use stowage_retry::BackoffConfig;
use stowage_sessions::SessionStore;
use stowage_types::refspec::{RefKind, is_commit_id};
use stowage_types::{
    BatchRemoveReport, Capability, CapabilitySet, CopyOptions, CreateDirOutcome,
    CredentialDecryptor, DirListing, DownloadLink, DriverConfig, DriverKind, DriverOptions,
    ErrorCode, LinkKind, LinkOptions, ListOptions, RemoveFailure, Result, StatRecord,
    StorageError, TransferOutcome, UpdateOutcome, UploadOptions, UploadOutcome, path,
};

const ACCESS_TTL: Duration = Duration::from_secs(60);
const REFS_TTL: Duration = Duration::from_secs(60);
const PATHS_INFO_TTL: Duration = Duration::from_secs(30);
const TREE_PAGE_TTL: Duration = Duration::from_secs(10);

/// Paths-info requests are chunked and submitted with bounded concurrency.
const PATHS_INFO_CHUNK: usize = 200;
const PATHS_INFO_CONCURRENCY: usize = 2;

/// LFS permanent-deletion batches.
const LFS_DELETE_BATCH: usize = 1000;

#[derive(Debug, Clone)]
pub(crate) struct TreePage {
    pub entries: Vec<TreeEntry>,
    pub next_cursor: Option<String>,
}

/// Driver for dataset-hub repositories.
pub struct HubDriver {
    name: String,
    pub(crate) options: DriverOptions,
    pub(crate) backend: HubBackend,
    endpoint: String,
    pub(crate) client: Client,
    pub(crate) token: Option<String>,
    capabilities: CapabilitySet,
    access: TtlCell<AccessInfo>,
    refs: TtlCell<Arc<RefsInfo>>,
    paths_info: TtlMap<String, Option<TreeEntry>>,
    tree_pages: TtlMap<String, TreePage>,
    pub(crate) sessions: Arc<dyn SessionStore>,
}

impl HubDriver {
    pub fn new(config: DriverConfig, sessions: Arc<dyn SessionStore>) -> Result<Self> {
        let backend: HubBackend = config.backend_config()?;
        if backend.repo.is_empty() {
            return Err(StorageError::invalid_config("hub driver requires a repo"));
        }
        let endpoint = config
            .endpoint
            .as_deref()
            .unwrap_or("https://huggingface.co")
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
            access: TtlCell::new(),
            refs: TtlCell::new(),
            paths_info: TtlMap::new(PATHS_INFO_TTL),
            tree_pages: TtlMap::new(TREE_PAGE_TTL),
            sessions,
        })
    }

    // -- URL construction

    fn api_base(&self) -> String {
        format!(
            "{}/api/{}/{}",
            self.endpoint,
            self.backend.repo_type.plural(),
            self.backend.repo
        )
    }

    fn tree_url(&self, repo_path: &str) -> String {
        format!(
            "{}/tree/{}/{}",
            self.api_base(),
            quote_segment(&self.backend.revision),
            quote_path(repo_path)
        )
    }

    pub(crate) fn commit_url(&self) -> String {
        format!(
            "{}/commit/{}",
            self.api_base(),
            quote_segment(&self.backend.revision)
        )
    }

    pub(crate) fn resolve_url(&self, repo_path: &str) -> String {
        format!(
            "{}/{}{}/resolve/{}/{}",
            self.endpoint,
            self.backend.repo_type.resolve_prefix(),
            self.backend.repo,
            quote_segment(&self.backend.revision),
            quote_path(repo_path)
        )
    }

    pub(crate) fn lfs_batch_url(&self) -> String {
        format!(
            "{}/{}{}.git/info/lfs/objects/batch",
            self.endpoint,
            self.backend.repo_type.resolve_prefix(),
            self.backend.repo
        )
    }

    // -- Request plumbing

    pub(crate) fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
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
    /// proven-unexecuted rate limit.
    pub(crate) fn write_backoff(&self) -> BackoffConfig {
        BackoffConfig::writes().with_max_delay(self.options.retry_max_delay)
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, cx: &OpContext, url: &str) -> Result<T> {
        let req = self.authed(self.client.get(url));
        let resp = send_with_retry(&req, RetryMode::Read, &self.read_backoff(), &cx.cancel)?;
        let resp = ensure_success(resp)?;
        let body = resp
            .text()
            .map_err(|e| StorageError::upstream(format!("reading response failed: {e}")))?;
        decode_json(&body)
    }

    // -- Probes and caches

    fn fetch_access(&self, cx: &OpContext) -> Result<AccessInfo> {
        self.access.get_or_fetch(ACCESS_TTL, &cx.cancel, || {
            let url = self.api_base();
            let req = self.authed(self.client.get(&url));
            let resp = send_with_retry(&req, RetryMode::Read, &self.read_backoff(), &cx.cancel)?;
            let status = resp.status();
            if status.as_u16() == 401 {
                return Ok(AccessInfo {
                    is_private: true,
                    is_gated: false,
                    requires_auth: true,
                });
            }
            let resp = ensure_success(resp)?;
            let body = resp
                .text()
                .map_err(|e| StorageError::upstream(format!("reading repo info failed: {e}")))?;
            let info: RepoInfo = decode_json(&body)?;
            Ok(AccessInfo {
                is_private: info.private,
                is_gated: info.is_gated(),
                requires_auth: info.private || info.is_gated(),
            })
        })
    }

    fn fetch_refs(&self, cx: &OpContext) -> Result<Arc<RefsInfo>> {
        self.refs.get_or_fetch(REFS_TTL, &cx.cancel, || {
            let url = format!("{}/refs", self.api_base());
            let refs: RefsInfo = self.get_json(cx, &url)?;
            Ok(Arc::new(refs))
        })
    }

    /// Before any write: credential present, revision a branch.
    ///
    /// A refs-probe failure does not block the write — the backend rejects
    /// unwritable refs itself.
    pub(crate) fn ensure_writable(&self, cx: &OpContext) -> Result<String> {
        if self.token.is_none() {
            return Err(StorageError::new(
                ErrorCode::TokenRequiredForWrite,
                "writing to the hub requires a credential",
            ));
        }
        let revision = &self.backend.revision;
        if is_commit_id(revision) {
            return Err(StorageError::new(
                ErrorCode::RevisionNotWritable,
                format!("revision {revision} is a commit id; only branches accept writes"),
            ));
        }
        match self.fetch_refs(cx) {
            Ok(refs) => {
                let kind =
                    RefKind::classify(revision, &refs.branch_names(), &refs.tag_names());
                if !kind.is_writable() {
                    return Err(StorageError::new(
                        ErrorCode::RevisionNotWritable,
                        format!("revision {revision} is not a branch"),
                    ));
                }
                Ok(kind.short_name().to_string())
            }
            Err(e) if e.is_aborted() => Err(e),
            Err(e) => {
                warn!(error = %e, "refs probe failed; proceeding optimistically");
                Ok(revision.clone())
            }
        }
    }

    pub(crate) fn invalidate_listing_caches(&self) {
        self.tree_pages.clear();
        self.paths_info.clear();
    }

    // -- Paths-info

    fn paths_info_key(&self, repo_path: &str, expand: bool) -> String {
        // Repo, revision and auth mode are fixed per driver instance.
        format!("{expand}|{repo_path}")
    }

    /// Batched paths-info lookup with per-path caching.
    pub(crate) fn paths_info(
        &self,
        cx: &OpContext,
        repo_paths: &[String],
        expand: bool,
    ) -> Result<BTreeMap<String, TreeEntry>> {
        if !self.options.use_paths_info {
            return self.paths_info_via_tree(cx, repo_paths);
        }

        let mut found = BTreeMap::new();
        let mut misses = Vec::new();
        for p in repo_paths {
            match self.paths_info.get(&self.paths_info_key(p, expand)) {
                Some(Some(entry)) => {
                    found.insert(p.clone(), entry);
                }
                Some(None) => {}
                None => misses.push(p.clone()),
            }
        }
        if misses.is_empty() {
            return Ok(found);
        }

        let url = format!(
            "{}/paths-info/{}",
            self.api_base(),
            quote_segment(&self.backend.revision)
        );
        let chunks: Vec<Vec<String>> = misses
            .chunks(PATHS_INFO_CHUNK)
            .map(|c| c.to_vec())
            .collect();
        let queue = Mutex::new(chunks);
        let results: Mutex<Vec<Result<Vec<TreeEntry>>>> = Mutex::new(Vec::new());

        std::thread::scope(|scope| {
            for _ in 0..PATHS_INFO_CONCURRENCY.min(misses.len()) {
                scope.spawn(|| {
                    loop {
                        let chunk = {
                            let mut queue = queue.lock().expect("paths-info queue");
                            match queue.pop() {
                                Some(chunk) => chunk,
                                None => break,
                            }
                        };
                        let outcome = (|| {
                            cx.cancel.checkpoint()?;
                            let req = self
                                .authed(self.client.post(&url))
                                .json(&serde_json::json!({"paths": chunk, "expand": expand}));
                            let resp = send_with_retry(
                                &req,
                                RetryMode::Read,
                                &self.read_backoff(),
                                &cx.cancel,
                            )?;
                            let resp = ensure_success(resp)?;
                            let body = resp.text().map_err(|e| {
                                StorageError::upstream(format!("reading paths-info failed: {e}"))
                            })?;
                            decode_json::<Vec<TreeEntry>>(&body)
                        })();
                        results.lock().expect("paths-info results").push(outcome);
                    }
                });
            }
        });

        let mut fetched = Vec::new();
        for outcome in results.into_inner().expect("paths-info results") {
            fetched.extend(outcome?);
        }
        for entry in fetched {
            self.paths_info.insert(
                self.paths_info_key(&entry.path, expand),
                Some(entry.clone()),
            );
            found.insert(entry.path.clone(), entry);
        }
        // Negative results are cacheable too.
        for p in &misses {
            if !found.contains_key(p) {
                self.paths_info.insert(self.paths_info_key(p, expand), None);
            }
        }
        Ok(found)
    }

    /// Fallback when `use_paths_info` is off: stat through parent listings.
    fn paths_info_via_tree(
        &self,
        cx: &OpContext,
        repo_paths: &[String],
    ) -> Result<BTreeMap<String, TreeEntry>> {
        let mut found = BTreeMap::new();
        for p in repo_paths {
            let parent = match p.rfind('/') {
                Some(idx) => &p[..idx],
                None => "",
            };
            let page = self.tree_page(cx, parent, None, None, false)?;
            if let Some(entry) = page.entries.into_iter().find(|e| e.path == *p) {
                found.insert(p.clone(), entry);
            }
        }
        Ok(found)
    }

    // -- Tree listing

    fn default_limit(&self, expand: bool) -> u32 {
        self.options
            .tree_page_limit
            .unwrap_or(if expand { 100 } else { 1000 })
    }

    pub(crate) fn tree_page(
        &self,
        cx: &OpContext,
        repo_path: &str,
        limit: Option<u32>,
        cursor: Option<&str>,
        refresh: bool,
    ) -> Result<TreePage> {
        let expand = true;
        let limit = limit.unwrap_or_else(|| self.default_limit(expand));
        let key = format!(
            "{repo_path}|{expand}|false|{limit}|{}",
            cursor.unwrap_or("")
        );
        if !refresh {
            if let Some(page) = self.tree_pages.get(&key) {
                return Ok(page);
            }
        }

        cx.cancel.checkpoint()?;
        let mut req = self
            .authed(self.client.get(self.tree_url(repo_path)))
            .query(&[("limit", limit.to_string()), ("expand", "true".to_string())]);
        if let Some(cursor) = cursor {
            req = req.query(&[("cursor", cursor)]);
        }
        let resp = send_with_retry(&req, RetryMode::Read, &self.read_backoff(), &cx.cancel)?;
        let next_cursor = resp
            .headers()
            .get("link")
            .and_then(|v| v.to_str().ok())
            .and_then(next_cursor_from_link);
        let resp = ensure_success(resp)?;
        let body = resp
            .text()
            .map_err(|e| StorageError::upstream(format!("reading tree page failed: {e}")))?;
        let entries: Vec<TreeEntry> = decode_json(&body)?;

        let page = TreePage { entries, next_cursor };
        self.tree_pages.insert(key, page.clone());
        Ok(page)
    }

    /// Accumulate every page of a listing; terminates on a repeated cursor.
    pub(crate) fn tree_all(
        &self,
        cx: &OpContext,
        repo_path: &str,
        refresh: bool,
    ) -> Result<Vec<TreeEntry>> {
        let mut entries = Vec::new();
        let mut cursor: Option<String> = None;
        let mut seen = std::collections::HashSet::new();
        loop {
            let page = self.tree_page(cx, repo_path, None, cursor.as_deref(), refresh)?;
            entries.extend(page.entries);
            match page.next_cursor {
                Some(next) => {
                    if !seen.insert(next.clone()) {
                        debug!(cursor = %next, "tree cursor repeated; stopping pagination");
                        break;
                    }
                    cursor = Some(next);
                }
                None => break,
            }
        }
        Ok(entries)
    }

    /// Every file under a directory, walking sub-trees iteratively.
    pub(crate) fn walk_files(&self, cx: &OpContext, repo_path: &str) -> Result<Vec<TreeEntry>> {
        let mut files = Vec::new();
        let mut stack = vec![repo_path.to_string()];
        while let Some(dir) = stack.pop() {
            cx.cancel.checkpoint()?;
            for entry in self.tree_all(cx, &dir, false)? {
                if entry.is_directory() {
                    stack.push(entry.path.clone());
                } else {
                    files.push(entry);
                }
            }
        }
        Ok(files)
    }

    fn entry_to_stat(&self, entry: &TreeEntry) -> StatRecord {
        let name = entry.path.rsplit('/').next().unwrap_or(&entry.path).to_string();
        let logical = format!("/{}", entry.path);
        if entry.is_directory() {
            StatRecord::directory(format!("{logical}/"), name)
        } else {
            let mut record = StatRecord::file(logical, name, entry.content_size());
            record.etag = entry.lfs.as_ref().map(|l| l.oid.clone());
            record.modified = entry
                .last_commit
                .as_ref()
                .and_then(|c| c.date.as_deref())
                .and_then(parse_timestamp);
            record.storage_backend = Some(DriverKind::HubDataset);
            record
        }
    }

    fn stat_repo_path(&self, cx: &OpContext, repo_path: &str) -> Result<TreeEntry> {
        let found = self.paths_info(cx, &[repo_path.to_string()], true)?;
        found
            .get(repo_path)
            .cloned()
            .ok_or_else(|| StorageError::not_found(format!("/{repo_path}")))
    }

    pub(crate) fn is_restricted(&self, cx: &OpContext) -> Result<bool> {
        let access = self.fetch_access(cx)?;
        Ok(access.is_private || access.is_gated)
    }

    /// Read a file's content through the resolve endpoint.
    pub(crate) fn read_content(&self, cx: &OpContext, repo_path: &str) -> Result<Vec<u8>> {
        let req = self.authed(self.client.get(self.resolve_url(repo_path)));
        let resp = send_with_retry(&req, RetryMode::Read, &self.read_backoff(), &cx.cancel)?;
        let resp = ensure_success(resp)?;
        response_stream(resp).read_all(&cx.cancel)
    }

    /// Compose and send one NDJSON commit.
    pub(crate) fn send_commit(&self, cx: &OpContext, builder: &CommitBuilder) -> Result<()> {
        let body = builder.build();
        let req = self
            .authed(self.client.post(self.commit_url()))
            .header("content-type", "application/x-ndjson")
            .body(body);
        let resp = send_with_retry(&req, RetryMode::Write, &self.write_backoff(), &cx.cancel)?;
        ensure_success(resp)?;
        self.invalidate_listing_caches();
        Ok(())
    }

    /// Run the LFS batch call and interpret the result for `oid`.
    pub(crate) fn lfs_batch(
        &self,
        cx: &OpContext,
        oid: &str,
        size: u64,
        multipart: bool,
        branch: &str,
    ) -> Result<UploadAuthorization> {
        let request = LfsBatchRequest::upload(oid, size, multipart, Some(branch));
        let req = self
            .authed(self.client.post(self.lfs_batch_url()))
            .header("accept", "application/vnd.git-lfs+json")
            .header("content-type", "application/vnd.git-lfs+json")
            .json(&request);
        let resp = send_with_retry(&req, RetryMode::Read, &self.read_backoff(), &cx.cancel)?;
        let resp = ensure_success(resp)?;
        let body = resp
            .text()
            .map_err(|e| StorageError::upstream(format!("reading LFS batch failed: {e}")))?;
        let parsed: LfsBatchResponse = decode_json(&body)?;
        interpret_batch(&parsed, oid)
    }

    pub(crate) fn refuse_xet(&self) -> Result<()> {
        if self.options.use_xet {
            return Err(StorageError::new(
                ErrorCode::WasmDisallowed,
                "the Xet upload path needs a Wasm runtime this environment disallows; \
                 disable use_xet to fall back to LFS",
            ));
        }
        Ok(())
    }

    /// Copy or move one file, reusing the LFS object when there is one.
    fn transfer_file(
        &self,
        cx: &OpContext,
        builder: &mut CommitBuilder,
        src_entry: &TreeEntry,
        dst_repo: &str,
        delete_source: bool,
    ) -> Result<()> {
        match &src_entry.lfs {
            Some(lfs) => {
                builder.add_lfs_file(dst_repo, &lfs.oid, lfs.size);
            }
            None => {
                let content = self.read_content(cx, &src_entry.path)?;
                builder.add_file(dst_repo, &content);
            }
        }
        if delete_source {
            builder.delete_file(&src_entry.path);
        }
        Ok(())
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
        self.ensure_writable(cx)?;

        if skip_existing {
            let dst_repo = path::strip_root(dst_norm.trim_end_matches('/'));
            if self.stat_repo_path(cx, dst_repo).is_ok() {
                return Ok(TransferOutcome::skipped());
            }
        }

        let summary = if delete_source {
            format!("Rename {src_norm} to {dst_norm}")
        } else {
            format!("Copy {src_norm} to {dst_norm}")
        };
        let mut builder = CommitBuilder::new(&summary, "");

        if src_norm.ends_with('/') {
            let src_repo = path::strip_root(src_norm.trim_end_matches('/')).to_string();
            let dst_repo = path::strip_root(dst_norm.trim_end_matches('/')).to_string();
            let files = self.walk_files(cx, &src_repo)?;
            if files.is_empty() {
                return Err(StorageError::not_found(&src_norm));
            }
            let prefix = format!("{src_repo}/");
            for entry in &files {
                let rel = entry.path.strip_prefix(&prefix).unwrap_or(&entry.path);
                let target = format!("{dst_repo}/{rel}");
                self.transfer_file(cx, &mut builder, entry, &target, delete_source)?;
            }
            if delete_source {
                builder.delete_folder(&src_repo);
            }
        } else {
            let src_repo = path::strip_root(&src_norm);
            let dst_repo = path::strip_root(&dst_norm);
            let entry = self.stat_repo_path(cx, src_repo)?;
            if entry.is_directory() {
                return Err(StorageError::invalid_path(format!(
                    "{src_norm} is a directory; use a trailing slash"
                )));
            }
            self.transfer_file(cx, &mut builder, &entry, dst_repo, delete_source)?;
        }

        self.send_commit(cx, &builder)?;
        Ok(TransferOutcome::success())
    }

    /// After a delete commit, permanently remove the LFS payloads.
    ///
    /// Failures degrade to warnings; the delete itself already succeeded.
    fn cleanup_lfs_objects(&self, cx: &OpContext, oids: &[String]) -> Vec<String> {
        let mut warnings = Vec::new();
        if oids.is_empty() {
            return warnings;
        }
        let wanted: std::collections::HashSet<&str> =
            oids.iter().map(String::as_str).collect();
        let mut file_oids = Vec::new();

        let mut cursor: Option<String> = None;
        loop {
            if cx.cancel.is_cancelled() {
                warnings.push("LFS cleanup cancelled".to_string());
                return warnings;
            }
            let mut url = format!("{}/lfs-files", self.api_base());
            if let Some(c) = &cursor {
                url = format!("{url}?cursor={c}");
            }
            let page: crate::api::LfsFilesPage = match self.get_json(cx, &url) {
                Ok(page) => page,
                Err(e) => {
                    warnings.push(format!("LFS file listing failed: {e}"));
                    return warnings;
                }
            };
            if page.lfs_files.is_empty() {
                break;
            }
            for row in &page.lfs_files {
                if row
                    .oid
                    .as_deref()
                    .is_some_and(|oid| wanted.contains(oid))
                {
                    file_oids.push(row.file_oid.clone());
                }
            }
            // Early termination once every wanted oid is matched.
            if file_oids.len() >= wanted.len() {
                break;
            }
            match page
                .lfs_files
                .last()
                .map(|row| row.file_oid.clone())
            {
                Some(last) if cursor.as_deref() != Some(last.as_str()) => cursor = Some(last),
                _ => break,
            }
        }

        for chunk in file_oids.chunks(LFS_DELETE_BATCH) {
            let req = self
                .authed(self.client.post(format!("{}/lfs-files/batch", self.api_base())))
                .json(&serde_json::json!({
                    "deletions": {"sha": chunk},
                    "rewriteHistory": false,
                }));
            let outcome = send_with_retry(&req, RetryMode::Write, &self.write_backoff(), &cx.cancel)
                .and_then(ensure_success);
            if let Err(e) = outcome {
                warnings.push(format!("LFS batch deletion failed: {e}"));
            }
        }
        warnings
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

impl StorageDriver for HubDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::HubDataset
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

        let mut caps = CapabilitySet::new(&[
            Capability::Reader,
            Capability::DirectLink,
            Capability::Proxy,
            Capability::PagedList,
        ]);
        // Optimistic: the lazy refs probe may still refuse a non-branch ref
        // at write time.
        if self.token.is_some() && !is_commit_id(&self.backend.revision) {
            caps.insert(Capability::Writer);
            caps.insert(Capability::Atomic);
            caps.insert(Capability::Multipart);
        }
        self.capabilities = caps;

        let cx = OpContext::new();
        if let Err(e) = self.fetch_access(&cx) {
            warn!(error = %e, "access probe failed during initialize");
        }
        Ok(())
    }

    fn stat(&self, cx: &OpContext, raw: &str) -> Result<StatRecord> {
        let normalized = path::normalize(raw, None)?;
        if path::is_root(&normalized) {
            return Ok(StatRecord::directory("/", ""));
        }
        let repo_path = path::strip_root(normalized.trim_end_matches('/'));
        let entry = self.stat_repo_path(cx, repo_path)?;
        Ok(self.entry_to_stat(&entry))
    }

    fn list_directory(&self, cx: &OpContext, raw: &str, opts: &ListOptions) -> Result<DirListing> {
        let normalized = path::normalize(raw, Some(true))?;
        let repo_path = path::strip_root(normalized.trim_end_matches('/')).to_string();
        let is_root = path::is_root(&normalized);

        let (entries, next_cursor) = if opts.paged {
            let page = self.tree_page(
                cx,
                &repo_path,
                opts.limit,
                opts.cursor.as_deref(),
                opts.refresh,
            )?;
            (page.entries, page.next_cursor)
        } else {
            (self.tree_all(cx, &repo_path, opts.refresh)?, None)
        };

        let items = entries
            .iter()
            .filter(|e| !e.path.ends_with(".gitkeep"))
            .map(|e| self.entry_to_stat(e))
            .collect();
        Ok(DirListing {
            items,
            is_root,
            has_more: opts.paged.then_some(next_cursor.is_some()),
            next_cursor,
        })
    }

    fn download_file(&self, cx: &OpContext, raw: &str) -> Result<StreamDescriptor> {
        let normalized = path::normalize(raw, Some(false))?;
        let repo_path = path::strip_root(&normalized).to_string();
        let entry = self.stat_repo_path(cx, &repo_path)?;
        if entry.is_directory() {
            return Err(StorageError::invalid_path(format!(
                "{normalized} is a directory"
            )));
        }
        let record = self.entry_to_stat(&entry);

        let opener = HubOpener {
            client: self.client.clone(),
            url: self.resolve_url(&repo_path),
            token: self.token.clone(),
            backoff: self.read_backoff(),
        };
        Ok(StreamDescriptor::new(record.mimetype, Box::new(opener))
            .with_size(record.size)
            .with_etag(record.etag)
            .with_last_modified(record.modified)
            .with_range_support(RangeFallback::Honor206))
    }

    fn generate_direct_link(
        &self,
        cx: &OpContext,
        raw: &str,
        opts: &LinkOptions,
    ) -> Result<DownloadLink> {
        let normalized = path::normalize(raw, Some(false))?;
        if self.is_restricted(cx)? {
            return Err(StorageError::new(
                ErrorCode::DirectLinkNotAvailable,
                "private or gated repos cannot be linked directly; use the proxy",
            ));
        }
        let mut url = self.resolve_url(path::strip_root(&normalized));
        if opts.force_download {
            url.push_str("?download=true");
        }
        Ok(DownloadLink { url, kind: LinkKind::NativeDirect })
    }

    fn upload_file(
        &self,
        cx: &OpContext,
        raw: &str,
        source: ByteSource,
        opts: &UploadOptions,
    ) -> Result<UploadOutcome> {
        let normalized = path::normalize(raw, Some(false))?;
        path::require_name(&normalized)?;
        self.refuse_xet()?;
        let branch = self.ensure_writable(cx)?;
        let repo_path = path::strip_root(&normalized).to_string();

        let bytes = source.into_bytes()?;
        let oid = sha256_hex(&bytes);
        let size = bytes.len() as u64;

        match self.lfs_batch(cx, &oid, size, false, &branch)? {
            UploadAuthorization::AlreadyUploaded => {
                debug!(oid = %oid, "content deduplicated server-side");
            }
            UploadAuthorization::Basic { href, headers } => {
                cx.cancel.checkpoint()?;
                let mut req = self.client.put(&href).body(bytes);
                for (name, value) in &headers {
                    req = req.header(name, value);
                }
                if let Some(ct) = &opts.content_type {
                    req = req.header("content-type", ct);
                }
                let resp =
                    send_with_retry(&req, RetryMode::Write, &self.write_backoff(), &cx.cancel)?;
                ensure_success(resp)?;
            }
            UploadAuthorization::Multipart(_) => {
                return Err(StorageError::new(
                    ErrorCode::PresignRequiresMultipart,
                    format!("{size}-byte upload must go through the multipart flow"),
                ));
            }
        }

        let mut builder = CommitBuilder::new(&format!("Upload {repo_path}"), "");
        builder.add_lfs_file(&repo_path, &oid, size);
        self.send_commit(cx, &builder)?;

        Ok(UploadOutcome { storage_path: raw.to_string() })
    }

    fn update_file(&self, cx: &OpContext, raw: &str, body: &[u8]) -> Result<UpdateOutcome> {
        let normalized = path::normalize(raw, Some(false))?;
        self.refuse_xet()?;
        self.ensure_writable(cx)?;
        let repo_path = path::strip_root(&normalized).to_string();

        let mut builder = CommitBuilder::new(&format!("Update {repo_path}"), "");
        builder.add_file(&repo_path, body);
        self.send_commit(cx, &builder)?;
        Ok(UpdateOutcome { path: normalized })
    }

    fn create_directory(&self, cx: &OpContext, raw: &str) -> Result<CreateDirOutcome> {
        let normalized = path::normalize(raw, Some(true))?;
        path::require_name(&normalized)?;
        self.ensure_writable(cx)?;
        let repo_path = path::strip_root(normalized.trim_end_matches('/')).to_string();

        if self.stat_repo_path(cx, &repo_path).is_ok() {
            return Ok(CreateDirOutcome { path: normalized, already_existed: true });
        }

        let mut builder = CommitBuilder::new(&format!("Create directory {repo_path}"), "");
        builder.add_file(&format!("{repo_path}/.gitkeep"), b"");
        self.send_commit(cx, &builder)?;
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
        self.ensure_writable(cx)?;
        let mut report = BatchRemoveReport::default();
        let mut builder = CommitBuilder::new("Delete files", "");
        let mut seen = std::collections::HashSet::new();
        let mut committed: Vec<String> = Vec::new();
        let mut lfs_oids: Vec<String> = Vec::new();

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
                builder.delete_folder(&repo_path);
            } else {
                if self.options.delete_lfs_on_remove {
                    if let Ok(entry) = self.stat_repo_path(cx, &repo_path) {
                        if let Some(lfs) = &entry.lfs {
                            lfs_oids.push(lfs.oid.clone());
                        }
                    }
                }
                builder.delete_file(&repo_path);
            }
            committed.push(display);
        }

        if builder.operation_count() > 0 {
            match self.send_commit(cx, &builder) {
                Ok(()) => {
                    report.success = committed;
                    if self.options.delete_lfs_on_remove {
                        report.warnings = self.cleanup_lfs_objects(cx, &lfs_oids);
                    }
                }
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
        cx: &OpContext,
        session_id: &str,
    ) -> Result<stowage_core::SignedParts> {
        crate::multipart::sign(self, cx, session_id)
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
                driver: Some(DriverKind::HubDataset),
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
}

/// Opener for the resolve endpoint; Range passes straight through.
struct HubOpener {
    client: Client,
    url: String,
    token: Option<String>,
    backoff: BackoffConfig,
}

impl HubOpener {
    fn request(&self, head: bool) -> RequestBuilder {
        let builder = if head {
            self.client.head(&self.url)
        } else {
            self.client.get(&self.url)
        };
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

impl StreamOpener for HubOpener {
    fn open_full(&self, cancel: &CancelToken) -> Result<ByteStream> {
        let resp = send_with_retry(&self.request(false), RetryMode::Read, &self.backoff, cancel)?;
        let resp = ensure_success(resp)?;
        Ok(response_stream(resp))
    }

    fn open_range(&self, cancel: &CancelToken, range: ByteRange) -> Result<ByteStream> {
        let req = self.request(false).header("range", range.header_value());
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff, cancel)?;
        let status = resp.status();
        if status.as_u16() == 416 {
            return Err(StorageError::invalid_path("requested range is unsatisfiable"));
        }
        let resp = ensure_success(resp)?;
        Ok(response_stream(resp))
    }

    fn open_head(&self, cancel: &CancelToken) -> Result<StreamMeta> {
        let resp = send_with_retry(&self.request(true), RetryMode::Read, &self.backoff, cancel)?;
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
            etag: resp
                .headers()
                .get("etag")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            last_modified: resp
                .headers()
                .get("last-modified")
                .and_then(|v| v.to_str().ok())
                .and_then(stowage_core::http::parse_http_date),
        })
    }
}
