//! Core domain types for stowage.
//!
//! This crate defines the vocabulary shared by every storage driver:
//!
//! - [`StorageError`] / [`ErrorCode`] — the stable error taxonomy drivers
//!   return across the contract boundary
//! - [`Capability`] / [`CapabilitySet`] — the operation set a driver
//!   publishes after initialization
//! - [`path`] — logical path normalization (slash rules, `..` rejection)
//! - [`refspec`] — branch/tag/commit classification for Git-backed drivers
//! - [`StatRecord`], [`DirListing`], [`DownloadLink`] and the other
//!   operation inputs/outputs
//! - [`DriverConfig`] — the uniform configuration envelope with a
//!   backend-specific payload
//!
//! # Example
//!
//! ```
//! use stowage_types::{Capability, CapabilitySet, path};
//!
//! let caps = CapabilitySet::new(&[Capability::Reader, Capability::Proxy]);
//! assert!(caps.contains(Capability::Reader));
//! assert!(!caps.contains(Capability::Writer));
//!
//! let p = path::normalize("docs\\guide//intro.md", None).expect("normalize");
//! assert_eq!(p, "/docs/guide/intro.md");
//! ```

mod capability;
mod config;
mod error;
pub mod path;
pub mod refspec;
mod records;
mod session;

pub use capability::{Capability, CapabilitySet};
pub use config::{CredentialDecryptor, DriverConfig, DriverOptions, RawCredential};
pub use error::{ErrorClass, ErrorCode, Result, StorageError, snippet};
pub use records::{
    BatchRemoveReport, CopyOptions, CreateDirOutcome, DirListing, DownloadLink, DriverKind,
    LinkKind, LinkOptions, ListOptions, RemoveFailure, StatRecord, TransferOutcome,
    TransferStatus, UpdateOutcome, UploadOptions, UploadOutcome, guess_mimetype,
};
pub use session::{PartInfo, SessionStatus, UploadMode, UploadStrategy};
