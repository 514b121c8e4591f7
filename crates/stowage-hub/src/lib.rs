//! Hub dataset driver.
//!
//! Exposes a dataset-style Git repository over its HTTP APIs as a file
//! system: tree listings with cursor pagination, batched paths-info lookups,
//! LFS presign (basic and front-end multipart) with NDJSON commits, and
//! server-side LFS copies that move large files without moving bytes.
//!
//! The driver is read-optimistic and write-careful: reads come from short-TTL
//! caches with single-flight population, writes go through writable-ref
//! enforcement and land as atomic commits on a branch.

mod api;
mod driver;
mod lfs;
mod multipart;
mod summary;

pub use api::{HubBackend, HubRepoType};
pub use driver::HubDriver;
pub use summary::{DirSummary, directory_summary};
