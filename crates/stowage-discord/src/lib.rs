//! Message-attachment driver.
//!
//! Presents a chat channel's message stream as a file system: the directory
//! tree lives in an external node store, file bytes live in message
//! attachments. Uploads post messages; downloads resolve (and refresh)
//! attachment URLs; large files are reconstructed from ordered chunk
//! attachments with byte-accurate Range support; mutations touch the index
//! only.

mod chunks;
mod driver;
mod index;
mod multipart;

pub use chunks::{ChunkLayout, ChunkPart, ContentRef};
pub use driver::{DiscordBackend, DiscordDriver};
pub use index::{MemoryNodeStore, NodeStore, NodeType, VfsNode};
