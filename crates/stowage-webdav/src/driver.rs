//! The WebDAV driver proper.

use reqwest::Method;
use reqwest::blocking::Body;
use tracing::debug;

use crate::client::{DavCredentials, WebdavClient};
use crate::propfind::DavResource;
use stowage_core::http::{
    RetryMode, ensure_success, parse_http_date, response_stream, send_with_retry, status_error,
    transport_error,
};
use stowage_core::{
    ByteRange, ByteSource, ByteStream, CancelToken, OpContext, RangeFallback, StorageDriver,
    StreamDescriptor, StreamMeta, StreamOpener,
};
use stowage_retry::BackoffConfig;
use stowage_types::{
    BatchRemoveReport, Capability, CapabilitySet, CopyOptions, CreateDirOutcome,
    CredentialDecryptor, DirListing, DriverConfig, DriverKind, DriverOptions, ListOptions,
    RemoveFailure, Result, StatRecord, StorageError, TransferOutcome, UpdateOutcome,
    UploadOptions, UploadOutcome, guess_mimetype, path,
};

/// Sizes at or under this are suspect: several servers report `0`, `1` or
/// `2` for freshly uploaded files in depth-1 listings and only answer
/// truthfully when asked about the file alone.
const SUSPECT_SIZE: u64 = 2;

/// Quota facts from the RFC 4331 probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DavQuota {
    Unsupported,
    Known {
        available: Option<u64>,
        used: Option<u64>,
    },
}

/// Driver for RFC 4918 servers.
pub struct WebdavDriver {
    name: String,
    options: DriverOptions,
    endpoint: String,
    credential: Option<String>,
    resolved: Option<DavCredentials>,
    client: Option<WebdavClient>,
    capabilities: CapabilitySet,
}

impl WebdavDriver {
    pub fn new(config: DriverConfig) -> Result<Self> {
        let endpoint = config.require_endpoint()?;
        Ok(Self {
            name: config.name,
            options: config.options,
            endpoint,
            credential: config.credential,
            resolved: None,
            client: None,
            capabilities: CapabilitySet::EMPTY,
        })
    }

    fn backoff(&self) -> BackoffConfig {
        BackoffConfig::reads()
            .with_max_attempts(self.options.retry_attempts)
            .with_max_delay(self.options.retry_max_delay)
    }

    fn dav(&self) -> Result<&WebdavClient> {
        self.client
            .as_ref()
            .ok_or_else(|| StorageError::invalid_config("driver is not initialized"))
    }

    fn resource_record(&self, logical_dir: &str, resource: &DavResource) -> StatRecord {
        let name = resource.name();
        if resource.is_collection {
            let logical = format!("{}{}/", logical_dir, name);
            let mut record = StatRecord::directory(logical, name);
            record.modified = resource.modified;
            record
        } else {
            let logical = format!("{}{}", logical_dir, name);
            let mut record = StatRecord::file(logical, name, resource.size);
            if let Some(ct) = &resource.content_type {
                record.mimetype = ct.clone();
            }
            record.modified = resource.modified;
            record.etag = resource.etag.clone();
            record.storage_backend = Some(DriverKind::Webdav);
            record
        }
    }

    fn stat_resource(&self, cx: &OpContext, normalized: &str) -> Result<DavResource> {
        let dav = self.dav()?;
        let url = dav.url_for(normalized)?;
        let mut resources = dav.propfind(&cx.cancel, url, 0, false)?;
        resources
            .drain(..)
            .next()
            .ok_or_else(|| StorageError::not_found(normalized))
    }

    /// MKCOL every directory from the root down to `dir_path`.
    fn ensure_parents(&self, cx: &OpContext, dir_path: &str) -> Result<()> {
        let dav = self.dav()?;
        let mut walked = String::from("/");
        for segment in dir_path.trim_matches('/').split('/') {
            if segment.is_empty() {
                continue;
            }
            walked.push_str(segment);
            walked.push('/');
            let url = dav.url_for(&walked)?;
            // "Already present" dialects (405/409/501) are fine.
            dav.mkcol(&cx.cancel, url)?;
        }
        Ok(())
    }
}

impl StorageDriver for WebdavDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Webdav
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    fn initialize(&mut self, decryptor: Option<&dyn CredentialDecryptor>) -> Result<()> {
        let credentials = match &self.credential {
            Some(raw) => {
                let resolved = stowage_types::RawCredential::parse(raw).resolve(decryptor)?;
                Some(DavCredentials::parse(&resolved)?)
            }
            None => None,
        };
        let has_credentials = credentials.is_some();
        self.resolved = credentials.clone();
        self.client = Some(WebdavClient::new(
            &self.endpoint,
            credentials,
            self.options.tls_skip_verify,
            self.backoff(),
        )?);

        let mut caps = CapabilitySet::new(&[Capability::Reader, Capability::Proxy]);
        if has_credentials {
            caps.insert(Capability::Writer);
            caps.insert(Capability::Atomic);
        }
        self.capabilities = caps;
        Ok(())
    }

    fn stat(&self, cx: &OpContext, raw: &str) -> Result<StatRecord> {
        let normalized = path::normalize(raw, None)?;
        if path::is_root(&normalized) {
            return Ok(StatRecord::directory("/", ""));
        }
        let resource = self.stat_resource(cx, &normalized)?;
        Ok(self.resource_record(&path::parent(&normalized), &resource))
    }

    fn list_directory(&self, cx: &OpContext, raw: &str, _opts: &ListOptions) -> Result<DirListing> {
        let normalized = path::normalize(raw, Some(true))?;
        let dav = self.dav()?;
        let dir_url = dav.url_for(&normalized)?;
        let resources = dav.propfind(&cx.cancel, dir_url.clone(), 1, false)?;

        let dir_path = dir_url.path().trim_end_matches('/');
        let mut items = Vec::new();
        for resource in &resources {
            // Depth-1 includes the directory itself; skip it by href.
            if resource.href.trim_end_matches('/') == dir_path {
                continue;
            }
            let mut record = self.resource_record(&normalized, resource);
            // Known server quirk: tiny reported sizes are lies; re-stat the
            // child alone to get the truth.
            if !record.is_directory && record.size.is_none_or(|s| s <= SUSPECT_SIZE) {
                if let Ok(fresh) = self.stat_resource(cx, &record.path) {
                    record.size = fresh.size;
                    record.modified = fresh.modified.or(record.modified);
                }
            }
            items.push(record);
        }
        Ok(DirListing {
            items,
            is_root: path::is_root(&normalized),
            has_more: None,
            next_cursor: None,
        })
    }

    fn download_file(&self, cx: &OpContext, raw: &str) -> Result<StreamDescriptor> {
        let normalized = path::normalize(raw, Some(false))?;
        let dav = self.dav()?;
        let url = dav.url_for(&normalized)?;

        // HEAD first; complete missing metadata with a stat.
        let head = dav.request(Method::HEAD, url.clone());
        let resp = send_with_retry(&head, RetryMode::Read, dav.backoff(), &cx.cancel)?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(StorageError::not_found(&normalized));
        }
        if !status.is_success() {
            return Err(status_error(status, ""));
        }
        let mut size = resp.content_length().filter(|s| *s > 0);
        let mut modified = resp
            .headers()
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| guess_mimetype(path::file_name(&normalized)));
        let etag = resp
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if size.is_none() {
            if let Ok(resource) = self.stat_resource(cx, &normalized) {
                size = resource.size;
                modified = modified.or(resource.modified);
            }
        }

        let opener = DavOpener {
            client: self.dav()?.client().clone(),
            url,
            credentials: self.resolved.clone(),
            backoff: self.backoff(),
        };
        // Some deployments answer 200 to ranged requests without saying so;
        // slicing would corrupt reads, so the policy degrades to a full
        // fetch.
        Ok(StreamDescriptor::new(content_type, Box::new(opener))
            .with_size(size)
            .with_etag(etag)
            .with_last_modified(modified)
            .with_range_support(RangeFallback::Full))
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
        let dav = self.dav()?;
        if !self.capabilities.contains(Capability::Writer) {
            return Err(StorageError::new(
                stowage_types::ErrorCode::TokenRequiredForWrite,
                "uploading requires credentials",
            ));
        }

        self.ensure_parents(cx, &path::parent(&normalized))?;
        cx.cancel.checkpoint()?;

        let url = dav.url_for(&normalized)?;
        let mut req = dav.request(Method::PUT, url);
        if let Some(ct) = &opts.content_type {
            req = req.header("content-type", ct.clone());
        }
        // Stream sources PUT without buffering; anything else goes up in
        // one body.
        let req = match source {
            ByteSource::Reader { reader, len: Some(len) } => {
                req.body(Body::sized(reader, len))
            }
            ByteSource::Reader { reader, len: None } => req.body(Body::new(reader)),
            ByteSource::Bytes(bytes) => req.body(bytes),
        };
        let resp = req.send().map_err(transport_error)?;
        ensure_success(resp)?;
        debug!(path = %normalized, "uploaded");
        Ok(UploadOutcome { storage_path: raw.to_string() })
    }

    fn update_file(&self, cx: &OpContext, raw: &str, body: &[u8]) -> Result<UpdateOutcome> {
        let normalized = path::normalize(raw, Some(false))?;
        self.upload_file(
            cx,
            raw,
            ByteSource::from_bytes(body.to_vec()),
            &UploadOptions::default(),
        )?;
        Ok(UpdateOutcome { path: normalized })
    }

    fn create_directory(&self, cx: &OpContext, raw: &str) -> Result<CreateDirOutcome> {
        let normalized = path::normalize(raw, Some(true))?;
        path::require_name(&normalized)?;
        let dav = self.dav()?;
        self.ensure_parents(cx, &path::parent(&normalized))?;
        let url = dav.url_for(&normalized)?;
        let created = dav.mkcol(&cx.cancel, url)?;
        Ok(CreateDirOutcome { path: normalized, already_existed: !created })
    }

    fn rename_item(&self, cx: &OpContext, src: &str, dst: &str) -> Result<TransferOutcome> {
        let src_norm = path::normalize(src, None)?;
        let dst_norm = path::normalize(dst, None)?;
        let dav = self.dav()?;
        self.ensure_parents(cx, &path::parent(&dst_norm))?;
        let from = dav.url_for(&src_norm)?;
        let to = dav.url_for(&dst_norm)?;
        if dav.move_or_copy(&cx.cancel, "MOVE", from, &to, true)? {
            Ok(TransferOutcome::success())
        } else {
            Ok(TransferOutcome::failed("destination exists"))
        }
    }

    fn copy_item(
        &self,
        cx: &OpContext,
        src: &str,
        dst: &str,
        opts: &CopyOptions,
    ) -> Result<TransferOutcome> {
        let src_norm = path::normalize(src, None)?;
        let dst_norm = path::normalize(dst, None)?;
        let dav = self.dav()?;
        self.ensure_parents(cx, &path::parent(&dst_norm))?;
        let from = dav.url_for(&src_norm)?;
        let to = dav.url_for(&dst_norm)?;
        let overwrite = !opts.skip_existing;
        match dav.move_or_copy(&cx.cancel, "COPY", from, &to, overwrite)? {
            true => Ok(TransferOutcome::success()),
            false if opts.skip_existing => Ok(TransferOutcome::skipped()),
            false => Ok(TransferOutcome::failed("destination exists")),
        }
    }

    fn batch_remove_items(
        &self,
        cx: &OpContext,
        paths: &[String],
        display_paths: &[String],
    ) -> Result<BatchRemoveReport> {
        let dav = self.dav()?;
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
            let outcome = dav
                .url_for(&normalized)
                .and_then(|url| dav.delete(&cx.cancel, url));
            match outcome {
                Ok(()) => report.success.push(display),
                Err(e) => {
                    report.failed.push(RemoveFailure { path: display, error: e.to_string() })
                }
            }
        }
        Ok(report)
    }
}

impl WebdavDriver {
    /// RFC 4331 quota, degrading to `Unsupported` on servers without it.
    pub fn get_quota(&self, cx: &OpContext) -> Result<DavQuota> {
        let dav = self.dav()?;
        match dav.quota(&cx.cancel)? {
            Some((available, used)) => Ok(DavQuota::Known { available, used }),
            None => Ok(DavQuota::Unsupported),
        }
    }
}

/// GET opener with cache-defeating ranged requests.
struct DavOpener {
    client: reqwest::blocking::Client,
    url: url::Url,
    credentials: Option<DavCredentials>,
    backoff: BackoffConfig,
}

impl DavOpener {
    fn request(&self) -> reqwest::blocking::RequestBuilder {
        let req = self.client.get(self.url.clone());
        match &self.credentials {
            Some(creds) => req.basic_auth(&creds.username, Some(&creds.password)),
            None => req,
        }
    }
}

impl StreamOpener for DavOpener {
    fn open_full(&self, cancel: &CancelToken) -> Result<ByteStream> {
        let resp = send_with_retry(&self.request(), RetryMode::Read, &self.backoff, cancel)?;
        let resp = ensure_success(resp)?;
        Ok(response_stream(resp))
    }

    fn open_range(&self, cancel: &CancelToken, range: ByteRange) -> Result<ByteStream> {
        // Intermediaries love to transform or cache ranged DAV responses;
        // pin identity encoding and defeat caches.
        let req = self
            .request()
            .header("range", range.header_value())
            .header("accept-encoding", "identity")
            .header("cache-control", "no-cache")
            .header("pragma", "no-cache");
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff, cancel)?;
        let resp = ensure_success(resp)?;
        Ok(response_stream(resp))
    }

    fn open_head(&self, cancel: &CancelToken) -> Result<StreamMeta> {
        let req = self.client.head(self.url.clone());
        let req = match &self.credentials {
            Some(creds) => req.basic_auth(&creds.username, Some(&creds.password)),
            None => req,
        };
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff, cancel)?;
        Ok(StreamMeta {
            status: resp.status().as_u16(),
            size: resp.content_length(),
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
                .and_then(parse_http_date),
        })
    }
}
