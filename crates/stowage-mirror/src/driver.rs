//! The HTTP-mirror driver proper (read-only).

use std::io::Read;

use reqwest::blocking::Client;
use tracing::debug;
use url::Url;

use crate::parse::{
    IndexEntry, MirrorPreset, dedupe, looks_like_directory_index, parse_anchor_index,
    parse_json_index, parse_table_index, slice_portal_region,
};
use stowage_core::http::{
    RetryMode, build_client, ensure_success, parse_http_date, response_stream, send_with_retry,
    status_error,
};
use stowage_core::{
    ByteRange, ByteStream, CancelToken, OpContext, RangeFallback, StorageDriver, StreamDescriptor,
    StreamMeta, StreamOpener,
};
use stowage_retry::BackoffConfig;
use stowage_types::{
    Capability, CapabilitySet, CredentialDecryptor, DirListing, DownloadLink, DriverConfig,
    DriverKind, DriverOptions, LinkKind, LinkOptions, ListOptions, Result, StatRecord,
    StorageError, guess_mimetype, path,
};

/// Pages are read up to this bound; indexes past it are pathological.
const MAX_INDEX_BYTES: u64 = 2 * 1024 * 1024;

/// A browser-like agent: several mirrors serve bots a different (or empty)
/// page.
const BROWSER_UA: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct MirrorBackend {
    #[serde(default)]
    pub preset: MirrorPreset,
}

/// Read-only driver over an HTTP directory index.
pub struct MirrorDriver {
    name: String,
    options: DriverOptions,
    backend: MirrorBackend,
    base: Url,
    client: Client,
    capabilities: CapabilitySet,
}

impl MirrorDriver {
    pub fn new(config: DriverConfig) -> Result<Self> {
        let backend: MirrorBackend = if config.backend.is_null() {
            MirrorBackend { preset: MirrorPreset::Generic }
        } else {
            config.backend_config()?
        };
        let endpoint = config.require_endpoint()?;
        let mut base = Url::parse(&endpoint)
            .map_err(|e| StorageError::invalid_config(format!("invalid endpoint: {e}")))?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let client = build_client(
            Some(BROWSER_UA),
            stowage_core::http::DEFAULT_TIMEOUT,
            config.options.tls_skip_verify,
        )?;
        Ok(Self {
            name: config.name,
            options: config.options,
            backend,
            base,
            client,
            capabilities: CapabilitySet::EMPTY,
        })
    }

    fn backoff(&self) -> BackoffConfig {
        BackoffConfig::reads()
            .with_max_attempts(self.options.retry_attempts)
            .with_max_delay(self.options.retry_max_delay)
    }

    fn url_for(&self, normalized: &str) -> Result<Url> {
        let rest = normalized.trim_start_matches('/');
        self.base
            .join(rest)
            .map_err(|e| StorageError::invalid_path(format!("{normalized}: {e}")))
    }

    /// Fetch a page body, bounded.
    fn fetch_page(&self, cancel: &CancelToken, url: &Url) -> Result<String> {
        let req = self.client.get(url.clone());
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff(), cancel)?;
        if resp.status().as_u16() == 404 {
            return Err(StorageError::not_found(url.path()));
        }
        let resp = ensure_success(resp)?;
        let mut body = String::new();
        resp.take(MAX_INDEX_BYTES)
            .read_to_string(&mut body)
            .map_err(|e| StorageError::upstream(format!("reading index page failed: {e}")))?;
        Ok(body)
    }

    fn parse_listing(&self, body: &str, page_url: &Url) -> Vec<IndexEntry> {
        let trimmed = body.trim_start();
        if trimmed.starts_with('[') || trimmed.starts_with('{') {
            if let Some(entries) = parse_json_index(trimmed) {
                return entries;
            }
        }
        if trimmed.starts_with("<?xml") {
            if let Some(entries) = crate::parse::parse_xml_index(trimmed) {
                return entries;
            }
        }
        match self.backend.preset {
            MirrorPreset::Generic => parse_anchor_index(body, page_url),
            MirrorPreset::Portal => parse_anchor_index(slice_portal_region(body), page_url),
            MirrorPreset::Tuna | MirrorPreset::Aliyun => parse_table_index(body, page_url),
        }
    }
}

impl StorageDriver for MirrorDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::HttpMirror
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    fn initialize(&mut self, _decryptor: Option<&dyn CredentialDecryptor>) -> Result<()> {
        // Nothing to probe and nothing to decrypt: the mirror is public and
        // strictly read-only.
        self.capabilities = CapabilitySet::new(&[
            Capability::Reader,
            Capability::DirectLink,
            Capability::Proxy,
        ]);
        Ok(())
    }

    fn stat(&self, cx: &OpContext, raw: &str) -> Result<StatRecord> {
        let normalized = path::normalize(raw, None)?;
        if path::is_root(&normalized) {
            return Ok(StatRecord::directory("/", ""));
        }
        let url = self.url_for(&normalized)?;
        let req = self.client.head(url.clone());
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff(), &cx.cancel)?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(StorageError::not_found(&normalized));
        }
        if !status.is_success() {
            return Err(status_error(status, ""));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let size = resp.content_length();
        let modified = resp
            .headers()
            .get("last-modified")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_http_date);
        let name = path::file_name(&normalized).to_string();

        // HTML answers are ambiguous: sniff a little of the body and call it
        // a directory only when it reads like an index.
        if content_type.starts_with("text/html") {
            let sniff = self
                .client
                .get(url)
                .header("range", "bytes=0-2047")
                .send()
                .ok()
                .and_then(|resp| {
                    let mut buf = String::new();
                    resp.take(2048).read_to_string(&mut buf).ok()?;
                    Some(buf)
                })
                .unwrap_or_default();
            if looks_like_directory_index(&sniff) {
                return Ok(StatRecord::directory(
                    format!("{}/", normalized.trim_end_matches('/')),
                    name,
                ));
            }
        }

        let mut record = StatRecord::file(normalized.clone(), name.clone(), size);
        if !content_type.is_empty() {
            record.mimetype = content_type;
        } else {
            record.mimetype = guess_mimetype(&name);
        }
        record.modified = modified;
        record.storage_backend = Some(DriverKind::HttpMirror);
        Ok(record)
    }

    fn list_directory(&self, cx: &OpContext, raw: &str, _opts: &ListOptions) -> Result<DirListing> {
        let normalized = path::normalize(raw, Some(true))?;
        let url = self.url_for(&normalized)?;
        let body = self.fetch_page(&cx.cancel, &url)?;
        let mut entries = self.parse_listing(&body, &url);

        // Aliyun portals paginate; one extra page covers the long tail.
        if self.backend.preset == MirrorPreset::Aliyun {
            let mut second = url.clone();
            second.set_query(Some("page=2"));
            if let Ok(more) = self.fetch_page(&cx.cancel, &second) {
                entries.extend(self.parse_listing(&more, &url));
            }
        }
        let entries = dedupe(entries);
        debug!(path = %normalized, count = entries.len(), "parsed index page");

        let items = entries
            .into_iter()
            .map(|entry| {
                let logical = path::join(&normalized, &entry.name);
                if entry.is_directory {
                    let mut record = StatRecord::directory(format!("{logical}/"), entry.name);
                    record.modified = entry.modified;
                    record
                } else {
                    let mut record = StatRecord::file(logical, entry.name, entry.size);
                    record.modified = entry.modified;
                    record.storage_backend = Some(DriverKind::HttpMirror);
                    record
                }
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
        let url = self.url_for(&normalized)?;
        let opener = MirrorOpener {
            client: self.client.clone(),
            url,
            backoff: self.backoff(),
        };
        Ok(
            StreamDescriptor::new(guess_mimetype(path::file_name(&normalized)), Box::new(opener))
                .with_range_support(RangeFallback::Honor206),
        )
    }

    fn generate_direct_link(
        &self,
        _cx: &OpContext,
        raw: &str,
        _opts: &LinkOptions,
    ) -> Result<DownloadLink> {
        let normalized = path::normalize(raw, Some(false))?;
        Ok(DownloadLink {
            url: self.url_for(&normalized)?.to_string(),
            kind: LinkKind::NativeDirect,
        })
    }
}

/// Native passthrough opener.
struct MirrorOpener {
    client: Client,
    url: Url,
    backoff: BackoffConfig,
}

impl StreamOpener for MirrorOpener {
    fn open_full(&self, cancel: &CancelToken) -> Result<ByteStream> {
        let req = self.client.get(self.url.clone());
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff, cancel)?;
        let resp = ensure_success(resp)?;
        Ok(response_stream(resp))
    }

    fn open_range(&self, cancel: &CancelToken, range: ByteRange) -> Result<ByteStream> {
        let req = self
            .client
            .get(self.url.clone())
            .header("range", range.header_value());
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff, cancel)?;
        let resp = ensure_success(resp)?;
        Ok(response_stream(resp))
    }

    fn open_head(&self, cancel: &CancelToken) -> Result<StreamMeta> {
        let req = self.client.head(self.url.clone());
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
