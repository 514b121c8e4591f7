//! Blocking HTTP plumbing shared by the drivers.
//!
//! One client builder (user agent, timeout, optional TLS bypass for
//! self-hosted backends) and one retrying send helper that encodes the
//! universal discipline: reads retry on 429/5xx with provider hints
//! dominating computed backoff; writes are never retried unless the provider
//! proves the request was not executed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use tracing::debug;

use crate::cancel::CancelToken;
use crate::stream::ByteStream;
use stowage_retry::{BackoffConfig, RateLimitHints, rate_limit_delay};
use stowage_types::{ErrorClass, ErrorCode, Result, StorageError, snippet};

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default user agent for upstream requests.
pub const USER_AGENT: &str = concat!("stowage/", env!("CARGO_PKG_VERSION"));

/// Build the blocking client a driver holds for its lifetime.
pub fn build_client(
    user_agent: Option<&str>,
    timeout: Duration,
    tls_skip_verify: bool,
) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(user_agent.unwrap_or(USER_AGENT))
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10));
    if tls_skip_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder
        .build()
        .map_err(|e| StorageError::upstream(format!("failed to build HTTP client: {e}")).with_cause(e))
}

/// Map a transport-level failure (connect, timeout, body read).
pub fn transport_error(e: reqwest::Error) -> StorageError {
    let kind = if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "connection failed"
    } else {
        "request failed"
    };
    StorageError::upstream(format!("upstream {kind}: {e}")).with_cause(e)
}

/// Map a non-success status to the taxonomy.
pub fn status_error(status: StatusCode, body: &str) -> StorageError {
    match status.as_u16() {
        401 => StorageError::new(ErrorCode::TokenRequired, "backend requires authentication"),
        403 => StorageError::new(ErrorCode::Forbidden, "backend refused the request"),
        404 | 410 => StorageError::not_found("remote object"),
        413 => StorageError::new(ErrorCode::FileTooLarge, "backend rejected the payload size"),
        429 => StorageError::too_many_requests("backend rate limit exceeded"),
        s if s >= 500 => StorageError::upstream(format!(
            "backend error ({s}): {}",
            snippet(body)
        )),
        s => StorageError::invalid_response(s, body),
    }
}

/// Fail unless the response is 2xx, consuming the body into the error.
pub fn ensure_success(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().unwrap_or_default();
    Err(status_error(status, &body))
}

/// Harvest rate-limit headers from a response.
pub fn rate_limit_hints(resp: &Response) -> RateLimitHints {
    let header = |name: &str| {
        resp.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    RateLimitHints {
        retry_after_header: header("retry-after"),
        body_retry_after: None,
        ratelimit_reset: header("x-ratelimit-reset"),
        ratelimit_reset_after: header("x-ratelimit-reset-after"),
    }
}

/// Whether a request in this mode may be re-sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// Idempotent read: retry 429 and 5xx.
    Read,
    /// Mutation: retry only a 429 whose hints prove non-execution.
    Write,
}

/// Send with the driver retry discipline.
///
/// Terminal retryable statuses (429/5xx after exhaustion) surface as errors;
/// every other status returns the response for the caller to interpret.
pub fn send_with_retry(
    request: &RequestBuilder,
    mode: RetryMode,
    backoff: &BackoffConfig,
    cancel: &CancelToken,
) -> Result<Response> {
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        cancel.checkpoint()?;
        let req = request
            .try_clone()
            .ok_or_else(|| StorageError::upstream("request body is not replayable"))?;

        let resp = match req.send() {
            Ok(resp) => resp,
            Err(e) => {
                if mode == RetryMode::Read && attempt < max_attempts {
                    let delay = stowage_retry::delay_for_attempt(backoff, attempt);
                    debug!(attempt, ?delay, "network error, retrying read");
                    sleep_with_cancel(delay, cancel)?;
                    attempt += 1;
                    continue;
                }
                return Err(transport_error(e));
            }
        };

        let status = resp.status();
        let retryable_status = status.as_u16() == 429 || status.is_server_error();
        if !retryable_status {
            return Ok(resp);
        }

        let mut hints = rate_limit_hints(&resp);
        let body = resp.text().unwrap_or_default();
        hints = hints.with_body(&body);

        let proven_not_executed = status.as_u16() == 429
            && (hints.retry_after_header.is_some()
                || hints.body_retry_after.is_some()
                || hints.ratelimit_reset_after.is_some()
                || hints.ratelimit_reset.is_some());
        let may_retry = match mode {
            RetryMode::Read => true,
            RetryMode::Write => proven_not_executed,
        };

        if !may_retry || attempt >= max_attempts {
            return Err(status_error(status, &body));
        }

        let delay = rate_limit_delay(&hints, backoff, attempt, Utc::now());
        debug!(status = status.as_u16(), attempt, ?delay, "retrying after throttle");
        sleep_with_cancel(delay, cancel)?;
        attempt += 1;
    }
}

/// Sleep in short slices so cancellation stays responsive.
fn sleep_with_cancel(total: Duration, cancel: &CancelToken) -> Result<()> {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        cancel.checkpoint()?;
        let step = remaining.min(Duration::from_millis(100));
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    cancel.checkpoint()
}

/// Wrap a response body as a [`ByteStream`].
pub fn response_stream(resp: Response) -> ByteStream {
    let partial = resp.status() == StatusCode::PARTIAL_CONTENT;
    let content_length = resp.content_length();
    ByteStream::new(Box::new(resp), partial, content_length)
}

/// `Last-Modified`-style HTTP date.
pub fn parse_http_date(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(raw.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Header accessor that tolerates missing or non-UTF-8 values.
pub fn header_str<'a>(resp: &'a Response, name: &str) -> Option<&'a str> {
    resp.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Auth errors carry write-intent context so callers can distinguish
/// "no token at all" from "token lacks write access".
pub fn auth_error_for_write(err: StorageError) -> StorageError {
    if err.code() == ErrorCode::TokenRequired {
        return StorageError::new(
            ErrorCode::TokenRequiredForWrite,
            "a credential with write access is required for this operation",
        )
        .with_class(ErrorClass::Permanent);
    }
    err
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tiny_http::{Header, Response as HttpResponse, Server};

    fn spawn_server<F>(handler: F) -> String
    where
        F: Fn(u32) -> HttpResponse<std::io::Cursor<Vec<u8>>> + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").expect("bind");
        let addr = format!("http://{}", server.server_addr());
        std::thread::spawn(move || {
            let hits = AtomicU32::new(0);
            for request in server.incoming_requests() {
                let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = request.respond(handler(n));
            }
        });
        addr
    }

    #[test]
    fn read_retries_500_then_succeeds() {
        let addr = spawn_server(|n| {
            if n < 3 {
                HttpResponse::from_string("oops").with_status_code(500)
            } else {
                HttpResponse::from_string("ok")
            }
        });
        let client = build_client(None, DEFAULT_TIMEOUT, false).expect("client");
        let backoff = BackoffConfig {
            kind: stowage_retry::BackoffKind::Immediate,
            max_attempts: 4,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let resp = send_with_retry(&client.get(&addr), RetryMode::Read, &backoff, &cancel)
            .expect("response");
        assert_eq!(resp.status().as_u16(), 200);
        assert_eq!(resp.text().expect("body"), "ok");
    }

    #[test]
    fn read_exhaustion_surfaces_rate_limit() {
        let addr = spawn_server(|_| {
            HttpResponse::from_string("{\"retry_after\": 0.01}").with_status_code(429)
        });
        let client = build_client(None, DEFAULT_TIMEOUT, false).expect("client");
        let backoff = BackoffConfig {
            kind: stowage_retry::BackoffKind::Immediate,
            max_attempts: 2,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let err = send_with_retry(&client.get(&addr), RetryMode::Read, &backoff, &cancel)
            .expect_err("throttled");
        assert_eq!(err.code(), ErrorCode::TooManyRequests);
    }

    #[test]
    fn write_does_not_retry_500() {
        let hits = Arc::new(AtomicU32::new(0));
        let hits_in = Arc::clone(&hits);
        let server = Server::http("127.0.0.1:0").expect("bind");
        let addr = format!("http://{}", server.server_addr());
        std::thread::spawn(move || {
            for request in server.incoming_requests() {
                hits_in.fetch_add(1, Ordering::SeqCst);
                let _ = request.respond(HttpResponse::from_string("oops").with_status_code(500));
            }
        });

        let client = build_client(None, DEFAULT_TIMEOUT, false).expect("client");
        let backoff = BackoffConfig {
            kind: stowage_retry::BackoffKind::Immediate,
            max_attempts: 4,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let err = send_with_retry(
            &client.post(&addr).body("payload"),
            RetryMode::Write,
            &backoff,
            &cancel,
        )
        .expect_err("server error");
        assert_eq!(err.code(), ErrorCode::UpstreamError);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn write_retries_429_with_proof() {
        let addr = spawn_server(|n| {
            if n == 1 {
                let header = Header::from_bytes("Retry-After", "0").expect("header");
                HttpResponse::from_string("slow down")
                    .with_status_code(429)
                    .with_header(header)
            } else {
                HttpResponse::from_string("committed")
            }
        });
        let client = build_client(None, DEFAULT_TIMEOUT, false).expect("client");
        let backoff = BackoffConfig {
            kind: stowage_retry::BackoffKind::Immediate,
            max_attempts: 3,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let resp = send_with_retry(
            &client.post(&addr).body("payload"),
            RetryMode::Write,
            &backoff,
            &cancel,
        )
        .expect("retried");
        assert_eq!(resp.text().expect("body"), "committed");
    }

    #[test]
    fn write_does_not_retry_unproven_429() {
        let addr = spawn_server(|_| HttpResponse::from_string("nope").with_status_code(429));
        let client = build_client(None, DEFAULT_TIMEOUT, false).expect("client");
        let backoff = BackoffConfig {
            kind: stowage_retry::BackoffKind::Immediate,
            max_attempts: 3,
            ..Default::default()
        };
        let cancel = CancelToken::new();
        let err = send_with_retry(
            &client.post(&addr).body("x"),
            RetryMode::Write,
            &backoff,
            &cancel,
        )
        .expect_err("throttled");
        assert_eq!(err.code(), ErrorCode::TooManyRequests);
    }

    #[test]
    fn cancellation_interrupts_before_send() {
        let client = build_client(None, DEFAULT_TIMEOUT, false).expect("client");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = send_with_retry(
            &client.get("http://127.0.0.1:9/never"),
            RetryMode::Read,
            &BackoffConfig::reads(),
            &cancel,
        )
        .expect_err("aborted");
        assert!(err.is_aborted());
    }

    #[test]
    fn status_error_mapping() {
        assert_eq!(
            status_error(StatusCode::UNAUTHORIZED, "").code(),
            ErrorCode::TokenRequired
        );
        assert_eq!(
            status_error(StatusCode::NOT_FOUND, "").code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            status_error(StatusCode::FORBIDDEN, "").code(),
            ErrorCode::Forbidden
        );
        assert_eq!(
            status_error(StatusCode::BAD_GATEWAY, "upstream sad").code(),
            ErrorCode::UpstreamError
        );
        assert_eq!(
            status_error(StatusCode::IM_A_TEAPOT, "{}").code(),
            ErrorCode::InvalidResponse
        );
    }

    #[test]
    fn http_date_parsing() {
        let parsed = parse_http_date("Wed, 21 Oct 2015 07:28:00 GMT").expect("parse");
        assert_eq!(parsed.timestamp(), 1_445_412_480);
        assert!(parse_http_date("yesterday-ish").is_none());
    }
}
