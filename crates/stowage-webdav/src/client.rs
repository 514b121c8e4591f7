//! Low-level WebDAV client: method plumbing and URL discipline.

use std::time::Duration;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::Method;
use reqwest::blocking::{Client, RequestBuilder};
use url::Url;

use crate::propfind::{DavResource, PROPFIND_BODY, QUOTA_BODY, parse_multistatus};
use stowage_core::CancelToken;
use stowage_core::http::{RetryMode, build_client, send_with_retry, status_error};
use stowage_retry::BackoffConfig;
use stowage_types::{ErrorCode, Result, StorageError};

/// Escape set for one path segment.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'%')
    .add(b'?')
    .add(b'#')
    .add(b'/');

/// Basic-auth credentials, split from the config `user:password` form.
#[derive(Debug, Clone)]
pub struct DavCredentials {
    pub username: String,
    pub password: String,
}

impl DavCredentials {
    pub fn parse(raw: &str) -> Result<DavCredentials> {
        let (username, password) = raw.split_once(':').ok_or_else(|| {
            StorageError::invalid_config("webdav credential must be 'user:password'")
        })?;
        Ok(DavCredentials {
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[derive(Debug)]
pub struct WebdavClient {
    base: Url,
    client: Client,
    credentials: Option<DavCredentials>,
    backoff: BackoffConfig,
    /// Mutations get one re-send, and only for a proven-unexecuted rate
    /// limit; the Write gate in the transport enforces the proof.
    write_backoff: BackoffConfig,
}

impl WebdavClient {
    /// Normalize the endpoint: require an http(s) scheme and force a
    /// trailing slash so URL joins cannot silently drop the last segment.
    pub fn new(
        endpoint: &str,
        credentials: Option<DavCredentials>,
        tls_skip_verify: bool,
        backoff: BackoffConfig,
    ) -> Result<Self> {
        let mut base = Url::parse(endpoint)
            .map_err(|e| StorageError::invalid_config(format!("invalid endpoint: {e}")))?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(StorageError::invalid_config(format!(
                "endpoint scheme must be http or https, got {}",
                base.scheme()
            )));
        }
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        let client = build_client(None, Duration::from_secs(60), tls_skip_verify)?;
        let write_backoff = BackoffConfig::writes().with_max_delay(backoff.max_delay);
        Ok(Self { base, client, credentials, backoff, write_backoff })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    /// Absolute URL for a normalized logical path.
    pub fn url_for(&self, normalized: &str) -> Result<Url> {
        let mut out = self.base.clone();
        if normalized.trim_matches('/').is_empty() {
            return Ok(out);
        }
        {
            let mut segments = out.path_segments_mut().map_err(|_| {
                StorageError::invalid_config("endpoint cannot be a base URL")
            })?;
            segments.pop_if_empty();
            for segment in normalized.trim_matches('/').split('/') {
                if segment.is_empty() {
                    continue;
                }
                segments.push(&utf8_percent_encode(segment, SEGMENT).to_string());
            }
        }
        if normalized.ends_with('/') && !normalized.trim_matches('/').is_empty() {
            out.set_path(&format!("{}/", out.path()));
        }
        Ok(out)
    }

    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.client.request(method, url);
        match &self.credentials {
            Some(creds) => req.basic_auth(&creds.username, Some(&creds.password)),
            None => req,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    fn dav_method(name: &str) -> Method {
        Method::from_bytes(name.as_bytes()).unwrap_or(Method::GET)
    }

    /// PROPFIND at the given depth.
    pub fn propfind(
        &self,
        cancel: &CancelToken,
        url: Url,
        depth: u8,
        quota: bool,
    ) -> Result<Vec<DavResource>> {
        let body = if quota { QUOTA_BODY } else { PROPFIND_BODY };
        let req = self
            .request(Self::dav_method("PROPFIND"), url)
            .header("depth", depth.to_string())
            .header("content-type", "application/xml")
            .body(body);
        let resp = send_with_retry(&req, RetryMode::Read, &self.backoff, cancel)?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(StorageError::not_found("remote resource"));
        }
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(status_error(status, &body));
        }
        let body = resp
            .text()
            .map_err(|e| StorageError::upstream(format!("reading multistatus failed: {e}")))?;
        parse_multistatus(&body)
    }

    /// MKCOL, treating "already there" shapes as success.
    pub fn mkcol(&self, cancel: &CancelToken, url: Url) -> Result<bool> {
        let req = self.request(Self::dav_method("MKCOL"), url);
        let resp = send_with_retry(&req, RetryMode::Write, &self.write_backoff, cancel)?;
        match resp.status().as_u16() {
            201 => Ok(true),
            // Servers report an existing collection in several dialects.
            405 | 409 | 501 => Ok(false),
            _ => {
                let status = resp.status();
                let body = resp.text().unwrap_or_default();
                Err(status_error(status, &body))
            }
        }
    }

    /// MOVE or COPY with `Overwrite` semantics.
    ///
    /// Returns `false` when the precondition failed (destination exists and
    /// overwrite was off).
    pub fn move_or_copy(
        &self,
        cancel: &CancelToken,
        method: &str,
        from: Url,
        to: &Url,
        overwrite: bool,
    ) -> Result<bool> {
        let req = self
            .request(Self::dav_method(method), from)
            .header("destination", to.as_str())
            .header("overwrite", if overwrite { "T" } else { "F" });
        let resp = send_with_retry(&req, RetryMode::Write, &self.write_backoff, cancel)?;
        match resp.status().as_u16() {
            201 | 204 => Ok(true),
            412 => Ok(false),
            404 => Err(StorageError::not_found("source resource")),
            _ => {
                let status = resp.status();
                let body = resp.text().unwrap_or_default();
                Err(status_error(status, &body))
            }
        }
    }

    /// DELETE; absence counts as success.
    pub fn delete(&self, cancel: &CancelToken, url: Url) -> Result<()> {
        let req = self.request(Method::DELETE, url);
        let resp = send_with_retry(&req, RetryMode::Write, &self.write_backoff, cancel)?;
        match resp.status().as_u16() {
            200 | 204 | 404 => Ok(()),
            _ => {
                let status = resp.status();
                let body = resp.text().unwrap_or_default();
                Err(status_error(status, &body))
            }
        }
    }

    /// RFC 4331 quota probe; `Ok(None)` when the server lacks the properties.
    pub fn quota(&self, cancel: &CancelToken) -> Result<Option<(Option<u64>, Option<u64>)>> {
        let outcome = self.propfind(cancel, self.base.clone(), 0, true);
        match outcome {
            Ok(resources) => {
                let root = resources.into_iter().next();
                let quota = root.and_then(|r| {
                    if r.quota_available.is_none() && r.quota_used.is_none() {
                        None
                    } else {
                        Some((r.quota_available, r.quota_used))
                    }
                });
                Ok(quota)
            }
            // Many deployments reject the quota props outright.
            Err(e) if e.code() == ErrorCode::InvalidResponse => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
