//! Lazy download handles and Range semantics.
//!
//! `download_file` never transfers bytes eagerly. It returns a
//! [`StreamDescriptor`]: metadata plus an opener the transport layer drives.
//! When a ranged open comes back as a plain `200`, the descriptor's
//! [`RangeFallback`] decides what happens — software-slice the full body
//! (safe only where the upstream is known slice-safe) or hand back the whole
//! resource and let the caller downgrade.

use std::io::Read;

use chrono::{DateTime, Utc};

use crate::cancel::CancelToken;
use stowage_types::{Result, StorageError};

/// An inclusive byte range, `bytes=start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    /// Inclusive end; `None` means "to the end of the resource".
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end: Some(end) }
    }

    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    /// The `Range` header value.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    /// Number of bytes covered, when bounded.
    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start) + 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// What to do when a ranged request comes back `200`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeFallback {
    /// Software-slice the full stream to the requested window.
    #[default]
    Honor206,
    /// Deliver the complete resource; slicing is unsafe for this backend.
    Full,
}

/// Metadata from a HEAD-style open.
#[derive(Debug, Clone, Default)]
pub struct StreamMeta {
    pub status: u16,
    pub size: Option<u64>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// An open byte stream from the backend.
pub struct ByteStream {
    /// Whether the upstream honored the Range request (`206`).
    pub partial: bool,
    /// Length of this stream's body, when known.
    pub content_length: Option<u64>,
    reader: Box<dyn Read + Send>,
}

impl ByteStream {
    pub fn new(reader: Box<dyn Read + Send>, partial: bool, content_length: Option<u64>) -> Self {
        Self { partial, content_length, reader }
    }

    pub fn from_bytes(bytes: Vec<u8>, partial: bool) -> Self {
        let len = bytes.len() as u64;
        Self::new(Box::new(std::io::Cursor::new(bytes)), partial, Some(len))
    }

    /// Drain the stream into memory, checking the cancel token between
    /// chunks.
    pub fn read_all(mut self, cancel: &CancelToken) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            cancel.checkpoint()?;
            let n = self
                .reader
                .read(&mut buf)
                .map_err(|e| StorageError::upstream(format!("stream read failed: {e}")).with_cause(e))?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        Ok(out)
    }
}

impl Read for ByteStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl std::fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteStream")
            .field("partial", &self.partial)
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Driver-side open operations captured by a descriptor.
pub trait StreamOpener: Send + Sync {
    fn open_full(&self, cancel: &CancelToken) -> Result<ByteStream>;
    fn open_range(&self, cancel: &CancelToken, range: ByteRange) -> Result<ByteStream>;
    fn open_head(&self, cancel: &CancelToken) -> Result<StreamMeta>;
}

/// The lazy handle `download_file` returns.
pub struct StreamDescriptor {
    pub size: Option<u64>,
    pub content_type: String,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub supports_range: bool,
    pub range_fallback: RangeFallback,
    opener: Box<dyn StreamOpener>,
}

impl StreamDescriptor {
    pub fn new(content_type: impl Into<String>, opener: Box<dyn StreamOpener>) -> Self {
        Self {
            size: None,
            content_type: content_type.into(),
            etag: None,
            last_modified: None,
            supports_range: false,
            range_fallback: RangeFallback::default(),
            opener,
        }
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    pub fn with_etag(mut self, etag: Option<String>) -> Self {
        self.etag = etag;
        self
    }

    pub fn with_last_modified(mut self, modified: Option<DateTime<Utc>>) -> Self {
        self.last_modified = modified;
        self
    }

    pub fn with_range_support(mut self, fallback: RangeFallback) -> Self {
        self.supports_range = true;
        self.range_fallback = fallback;
        self
    }

    pub fn open_full(&self, cancel: &CancelToken) -> Result<ByteStream> {
        cancel.checkpoint()?;
        self.opener.open_full(cancel)
    }

    pub fn open_head(&self, cancel: &CancelToken) -> Result<StreamMeta> {
        cancel.checkpoint()?;
        self.opener.open_head(cancel)
    }

    /// Open a range, applying the fallback policy when the upstream ignores
    /// Range and answers `200`.
    pub fn open_range(&self, cancel: &CancelToken, range: ByteRange) -> Result<ByteStream> {
        cancel.checkpoint()?;
        let stream = self.opener.open_range(cancel, range)?;
        if stream.partial {
            return Ok(stream);
        }
        match self.range_fallback {
            RangeFallback::Honor206 => slice_stream(stream, range),
            RangeFallback::Full => Ok(stream),
        }
    }
}

impl std::fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .field("supports_range", &self.supports_range)
            .field("range_fallback", &self.range_fallback)
            .finish_non_exhaustive()
    }
}

/// Reduce a full-body stream to the requested window by skipping and
/// truncating. Only valid when the whole resource is being delivered.
pub fn slice_stream(stream: ByteStream, range: ByteRange) -> Result<ByteStream> {
    let total = stream.content_length;
    let mut reader: Box<dyn Read + Send> = Box::new(stream);

    if range.start > 0 {
        let mut skip = reader.take(range.start);
        std::io::copy(&mut skip, &mut std::io::sink())
            .map_err(|e| StorageError::upstream(format!("range skip failed: {e}")).with_cause(e))?;
        reader = skip.into_inner();
    }

    let remaining = total.map(|t| t.saturating_sub(range.start));
    let (reader, len): (Box<dyn Read + Send>, Option<u64>) = match range.len() {
        Some(window) => {
            let len = remaining.map(|r| r.min(window)).or(Some(window));
            (Box::new(reader.take(window)), len)
        }
        None => (reader, remaining),
    };
    Ok(ByteStream::new(reader, true, len))
}
