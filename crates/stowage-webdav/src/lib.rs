//! WebDAV driver.
//!
//! Maps the driver contract onto RFC 4918 primitives: PROPFIND listings
//! (with a re-stat pass for servers that falsify small sizes), streaming
//! PUT uploads, MKCOL parent walks, MOVE/COPY with `Overwrite` semantics,
//! and an RFC 4331 quota probe that degrades gracefully. Range responses
//! are never software-sliced here — too many deployments answer `200`
//! without meaning it.

mod client;
mod driver;
mod propfind;

pub use client::{DavCredentials, WebdavClient};
pub use driver::{DavQuota, WebdavDriver};
pub use propfind::{DavResource, parse_multistatus};
