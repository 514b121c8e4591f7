//! HTTP-mirror driver (read-only).
//!
//! Browses an HTTP directory index as a file system. Presets select the
//! parsing strategy for the upstream's page layout; every parser filters to
//! same-origin direct children and takes names from resolved hrefs, never
//! from link text. Downloads and Range requests pass straight through.

mod driver;
mod parse;

pub use driver::{MirrorBackend, MirrorDriver};
pub use parse::{IndexEntry, MirrorPreset, parse_anchor_index, parse_human_size, parse_table_index};
