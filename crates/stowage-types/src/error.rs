//! The stable error taxonomy shared by every driver.
//!
//! Errors carry a machine [`ErrorCode`], an HTTP status hint for transport
//! mapping, an `expose` bit (safe to show verbatim to an end user) and
//! optional structured details. Drivers must preserve the code when wrapping:
//! local recovery happens only where the retry policy allows it, otherwise
//! the error propagates unchanged.

use serde::{Deserialize, Serialize};

/// Stable machine codes for every failure a driver can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation — fail fast, surface verbatim.
    InvalidConfig,
    InvalidPath,
    EmptyName,
    DotsInPath,
    // Auth — never retried.
    TokenRequired,
    TokenRequiredForWrite,
    Forbidden,
    // Absence is authoritative.
    NotFound,
    // Upstream protocol — bad-gateway class.
    InvalidResponse,
    InvalidJson,
    TreeTruncated,
    MultipartPartsMismatch,
    // Semantic refusals — caller may route to an alternative.
    RevisionNotWritable,
    DirectLinkNotAvailable,
    SubmoduleUnsupported,
    FileTooLarge,
    WasmDisallowed,
    PresignRequiresMultipart,
    UnsupportedOperation,
    // Flow control.
    TooManyRequests,
    Aborted,
    // Index-vs-storage divergence: the upload landed, the index write did not.
    DiscordIndexWriteFailed,
    // Residual transport/upstream failures.
    UpstreamError,
}

impl ErrorCode {
    /// The wire identifier, e.g. `INVALID_PATH`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::InvalidPath => "INVALID_PATH",
            ErrorCode::EmptyName => "EMPTY_NAME",
            ErrorCode::DotsInPath => "DOTS_IN_PATH",
            ErrorCode::TokenRequired => "TOKEN_REQUIRED",
            ErrorCode::TokenRequiredForWrite => "TOKEN_REQUIRED_FOR_WRITE",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::InvalidResponse => "INVALID_RESPONSE",
            ErrorCode::InvalidJson => "INVALID_JSON",
            ErrorCode::TreeTruncated => "TREE_TRUNCATED",
            ErrorCode::MultipartPartsMismatch => "MULTIPART_PARTS_MISMATCH",
            ErrorCode::RevisionNotWritable => "REVISION_NOT_WRITABLE",
            ErrorCode::DirectLinkNotAvailable => "DIRECT_LINK_NOT_AVAILABLE",
            ErrorCode::SubmoduleUnsupported => "SUBMODULE_UNSUPPORTED",
            ErrorCode::FileTooLarge => "FILE_TOO_LARGE",
            ErrorCode::WasmDisallowed => "WASM_DISALLOWED",
            ErrorCode::PresignRequiresMultipart => "PRESIGN_REQUIRES_MULTIPART",
            ErrorCode::UnsupportedOperation => "UNSUPPORTED_OPERATION",
            ErrorCode::TooManyRequests => "TOO_MANY_REQUESTS",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::DiscordIndexWriteFailed => "DISCORD_INDEX_WRITE_FAILED",
            ErrorCode::UpstreamError => "UPSTREAM_ERROR",
        }
    }

    /// Default HTTP status hint for transport mapping.
    pub fn default_status(&self) -> u16 {
        match self {
            ErrorCode::InvalidConfig
            | ErrorCode::InvalidPath
            | ErrorCode::EmptyName
            | ErrorCode::DotsInPath => 400,
            ErrorCode::TokenRequired | ErrorCode::TokenRequiredForWrite => 401,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::InvalidResponse
            | ErrorCode::InvalidJson
            | ErrorCode::TreeTruncated
            | ErrorCode::MultipartPartsMismatch => 502,
            ErrorCode::RevisionNotWritable
            | ErrorCode::DirectLinkNotAvailable
            | ErrorCode::SubmoduleUnsupported
            | ErrorCode::WasmDisallowed
            | ErrorCode::PresignRequiresMultipart
            | ErrorCode::UnsupportedOperation => 409,
            ErrorCode::FileTooLarge => 413,
            ErrorCode::TooManyRequests => 429,
            ErrorCode::Aborted => 499,
            ErrorCode::DiscordIndexWriteFailed => 500,
            ErrorCode::UpstreamError => 502,
        }
    }

    /// Whether the message is safe to show verbatim.
    pub fn expose_by_default(&self) -> bool {
        !matches!(self, ErrorCode::UpstreamError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Retry classification for a failure.
///
/// `Ambiguous` marks failures where the upstream may have executed the
/// request (a write that timed out mid-flight); those are never retried
/// blindly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    #[default]
    Retryable,
    Ambiguous,
    Permanent,
}

/// The error type returned by every driver operation.
#[derive(Debug)]
pub struct StorageError {
    code: ErrorCode,
    message: String,
    status: u16,
    expose: bool,
    details: Option<serde_json::Value>,
    class: ErrorClass,
    cause: Option<anyhow::Error>,
}

impl StorageError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        let class = match code {
            ErrorCode::TooManyRequests => ErrorClass::Retryable,
            ErrorCode::UpstreamError => ErrorClass::Retryable,
            _ => ErrorClass::Permanent,
        };
        Self {
            code,
            message: message.into(),
            status: code.default_status(),
            expose: code.expose_by_default(),
            details: None,
            class,
            cause: None,
        }
    }

    /// Override the HTTP status hint.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Override the retry classification.
    pub fn with_class(mut self, class: ErrorClass) -> Self {
        self.class = class;
        self
    }

    /// Attach an underlying cause, preserving the semantic code.
    pub fn with_cause(mut self, cause: impl Into<anyhow::Error>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn expose(&self) -> bool {
        self.expose
    }

    pub fn details(&self) -> Option<&serde_json::Value> {
        self.details.as_ref()
    }

    pub fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    pub fn is_aborted(&self) -> bool {
        self.code == ErrorCode::Aborted
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }

    // -- Common constructors

    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::NotFound, format!("not found: {what}"))
    }

    pub fn invalid_path(path: impl std::fmt::Display) -> Self {
        Self::new(ErrorCode::InvalidPath, format!("invalid path: {path}"))
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidConfig, message)
    }

    pub fn aborted() -> Self {
        Self::new(ErrorCode::Aborted, "operation cancelled")
    }

    pub fn unsupported(operation: &str) -> Self {
        Self::new(
            ErrorCode::UnsupportedOperation,
            format!("driver does not support {operation}"),
        )
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TooManyRequests, message)
    }

    /// Upstream protocol failure carrying a short redacted body snippet.
    pub fn invalid_response(status: u16, body: &str) -> Self {
        Self::new(
            ErrorCode::InvalidResponse,
            format!("unexpected upstream response ({status}): {}", snippet(body)),
        )
        .with_status(502)
    }

    /// Residual transport failure; retryable unless marked otherwise.
    pub fn upstream(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamError, message)
    }
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::new(ErrorCode::InvalidJson, format!("malformed JSON: {e}")).with_cause(e)
    }
}

/// A specialized result type for driver operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Trim a response body to a short, single-line snippet for error messages.
pub fn snippet(body: &str) -> String {
    const MAX: usize = 200;
    let flat: String = body
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .take(MAX)
        .collect();
    if body.chars().count() > MAX {
        format!("{flat}…")
    } else {
        flat
    }
}
