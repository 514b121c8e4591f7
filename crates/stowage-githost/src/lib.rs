//! Git-hosting driver.
//!
//! Exposes a hosted Git repository (at a branch, tag or commit) as a
//! read-write file system over the Contents and Git Database APIs. Reads go
//! through Contents-API listings with a `trees` switch for huge directories;
//! writes compose blobs, a tree, a commit and a `force:false` ref patch
//! under a per-instance lock with a minimum inter-write delay. Submodules
//! are surfaced read-only and refused everywhere else.

mod api;
mod driver;
mod encode;
mod multipart;

pub use api::{GitHostBackend, SUBMODULE_MIMETYPE};
pub use driver::GitHostDriver;
pub use encode::JsonBase64Body;
