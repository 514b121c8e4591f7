//! Shared core for stowage drivers.
//!
//! Everything the five backend drivers have in common lives here:
//!
//! - [`StorageDriver`] — the uniform operation contract, with default method
//!   bodies that refuse what a driver does not implement
//! - [`StreamDescriptor`] — lazy download handles with Range semantics and a
//!   per-driver fallback policy for servers that ignore Range
//! - [`CancelToken`] — the cancellation handle threaded through every fetch
//! - [`cache`] — single-flight TTL cells, TTL maps and bounded FIFO maps
//! - [`semaphore`] — a fair FIFO semaphore with a process-wide registry, for
//!   drivers whose rate limits span instances
//! - [`http`] — blocking client construction and the retrying send helper
//!   that encodes the read/write retry discipline
//!
//! # Example
//!
//! ```
//! use stowage_core::CancelToken;
//!
//! let cancel = CancelToken::new();
//! assert!(cancel.checkpoint().is_ok());
//! cancel.cancel();
//! assert!(cancel.checkpoint().is_err());
//! ```

pub mod cache;
mod cancel;
mod driver;
pub mod http;
pub mod semaphore;
mod stream;

pub use cancel::CancelToken;
pub use driver::{
    ByteSource, DriverRegistry, MultipartComplete, MultipartInitOutcome, MultipartInitRequest,
    OpContext, SignedParts, StorageDriver, proxy_link,
};
pub use stream::{
    ByteRange, ByteStream, RangeFallback, StreamDescriptor, StreamMeta, StreamOpener, slice_stream,
};
