//! Split-file reconstruction.
//!
//! Large files are stored as ordered chunk attachments. When every part has
//! a known positive size the driver computes absolute byte offsets once and
//! serves Range requests by fetching only the covering parts, asking each
//! CDN URL for a local sub-range and software-slicing any part whose server
//! answered `200` instead of `206`.

use serde::{Deserialize, Serialize};

use stowage_core::ByteRange;
use stowage_types::{ErrorCode, Result, StorageError};

/// One stored chunk, as recorded in `content_ref.parts`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkPart {
    pub part_no: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub byte_end: Option<u64>,
    pub message_id: String,
    pub attachment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

/// The `content_ref` payloads a file node can carry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ContentRef {
    #[serde(rename = "discord_attachment_v1")]
    Attachment {
        channel_id: String,
        message_id: String,
        attachment_id: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    #[serde(rename = "discord_chunks_v1")]
    Chunks { parts: Vec<ChunkPart> },
}

impl ContentRef {
    pub fn decode(value: &serde_json::Value) -> Result<ContentRef> {
        serde_json::from_value(value.clone()).map_err(|e| {
            StorageError::new(
                ErrorCode::InvalidResponse,
                format!("unrecognized content_ref: {e}"),
            )
        })
    }
}

/// Parts with absolute offsets resolved. Built once per open.
#[derive(Debug, Clone)]
pub struct ChunkLayout {
    pub parts: Vec<ChunkPart>,
    pub total_size: Option<u64>,
    /// Range support requires every part size to be known and positive.
    pub offsets_known: bool,
}

impl ChunkLayout {
    /// Sort parts, compute `byte_start`/`byte_end` when sizes allow.
    pub fn resolve(mut parts: Vec<ChunkPart>) -> ChunkLayout {
        parts.sort_by_key(|p| p.part_no);
        let offsets_known = !parts.is_empty()
            && parts.iter().all(|p| p.size.is_some_and(|s| s > 0));
        let mut total = 0u64;
        if offsets_known {
            for part in &mut parts {
                let size = part.size.unwrap_or(0);
                part.byte_start = Some(total);
                part.byte_end = Some(total + size - 1);
                total += size;
            }
        }
        ChunkLayout {
            total_size: offsets_known.then_some(total),
            parts,
            offsets_known,
        }
    }

    /// Select the parts covering `range`, with the local sub-range to read
    /// from each.
    pub fn plan_range(&self, range: ByteRange) -> Result<Vec<PartRead>> {
        if !self.offsets_known {
            return Err(StorageError::new(
                ErrorCode::InvalidResponse,
                "chunked file has unknown part sizes; range reads are unavailable",
            ));
        }
        let total = self.total_size.unwrap_or(0);
        if range.start >= total {
            return Err(StorageError::invalid_path(format!(
                "range start {} is past the end of a {total}-byte file",
                range.start
            )));
        }
        let global_end = range.end.map_or(total - 1, |e| e.min(total - 1));

        let mut reads = Vec::new();
        for part in &self.parts {
            let (start, end) = (part.byte_start.unwrap_or(0), part.byte_end.unwrap_or(0));
            if end < range.start || start > global_end {
                continue;
            }
            let local_start = range.start.saturating_sub(start);
            let local_end = global_end.min(end) - start;
            reads.push(PartRead {
                part: part.clone(),
                local: ByteRange::new(local_start, local_end),
            });
        }
        Ok(reads)
    }

    /// Full-file plan: every part, in order, unranged.
    pub fn plan_full(&self) -> Vec<PartRead> {
        self.parts
            .iter()
            .map(|part| PartRead { part: part.clone(), local: ByteRange::from(0) })
            .collect()
    }
}

/// One planned fetch: a part plus the sub-range needed from it.
#[derive(Debug, Clone)]
pub struct PartRead {
    pub part: ChunkPart,
    /// Local to the part; `ByteRange::from(0)` means the whole part.
    pub local: ByteRange,
}

impl PartRead {
    /// Whether this read wants the entire part.
    pub fn is_whole_part(&self) -> bool {
        self.local.start == 0
            && match (self.local.end, self.part.size) {
                (None, _) => true,
                (Some(end), Some(size)) => end + 1 == size,
                (Some(_), None) => false,
            }
    }
}
