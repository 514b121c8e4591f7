//! Directory-index page parsing.
//!
//! Upstream layouts drift without notice, so every preset is one replaceable
//! parsing strategy: swap the function, keep the driver. Names always come
//! from resolved hrefs, never from link text — navigation labels lie.

use std::sync::OnceLock;

use chrono::{DateTime, NaiveDateTime, Utc};
use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::Deserialize;
use url::Url;

/// Which parser a mount uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorPreset {
    /// Plain anchor list (nginx/apache autoindex).
    #[default]
    Generic,
    /// Portal page with mixed sections; only the mirrors region counts.
    Portal,
    /// Table layout with modified time and human-readable size.
    Tuna,
    /// Table layout plus a second paginated page.
    Aliyun,
}

/// One parsed listing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub name: String,
    pub is_directory: bool,
    pub size: Option<u64>,
    pub modified: Option<DateTime<Utc>>,
}

fn anchor_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"<a\s+[^>]*?href\s*=\s*["']([^"']+)["']"#).expect("anchor regex")
    })
}

/// Extract direct children of `base` from an anchor list.
///
/// Only called with a known base URL: the same-origin and direct-child
/// filters are what separate real entries from navigation links.
pub fn parse_anchor_index(html: &str, base: &Url) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    let base_path = base.path();
    for capture in anchor_re().captures_iter(html) {
        let href = &capture[1];
        if href.starts_with('#') || href.starts_with("mailto:") || href.starts_with("javascript:") {
            continue;
        }
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        // External-origin anchors never yield entries.
        if resolved.origin() != base.origin() {
            continue;
        }
        let path = resolved.path();
        if !path.starts_with(base_path) || path == base_path {
            continue;
        }
        let rest = &path[base_path.len()..];
        let rest = rest.trim_start_matches('/');
        if rest.is_empty() {
            continue;
        }
        // Direct children only: one segment, optionally a trailing slash.
        let is_directory = rest.ends_with('/');
        let segment = rest.trim_end_matches('/');
        if segment.contains('/') || segment.is_empty() {
            continue;
        }
        let name = percent_decode_str(segment).decode_utf8_lossy().into_owned();
        if name == ".." || name == "." {
            continue;
        }
        entries.push(IndexEntry { name, is_directory, size: None, modified: None });
    }
    entries
}

/// Portal pages mix a mirror list with DNS/NTP sections; keep only the
/// region before those headings.
pub fn slice_portal_region(html: &str) -> &str {
    let mut cut = html.len();
    for marker in [">DNS", ">NTP", "id=\"dns\"", "id=\"ntp\""] {
        if let Some(idx) = html.find(marker) {
            cut = cut.min(idx);
        }
    }
    &html[..cut]
}

fn table_row_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // href, then the modified-time cell, then the size cell.
        Regex::new(
            r#"(?s)<tr[^>]*>.*?<a\s+[^>]*?href\s*=\s*["']([^"']+)["'][^>]*>.*?</a>.*?<td[^>]*>([^<]*)</td>\s*<td[^>]*>([^<]*)</td>.*?</tr>"#,
        )
        .expect("table row regex")
    })
}

/// Table-style listings (tuna/aliyun): entries carry a modified time and a
/// human-readable size.
pub fn parse_table_index(html: &str, base: &Url) -> Vec<IndexEntry> {
    let mut entries = Vec::new();
    for capture in table_row_re().captures_iter(html) {
        let href = &capture[1];
        let Ok(resolved) = base.join(href) else {
            continue;
        };
        if resolved.origin() != base.origin() {
            continue;
        }
        let path = resolved.path();
        let base_path = base.path();
        if !path.starts_with(base_path) || path == base_path {
            continue;
        }
        let rest = path[base_path.len()..].trim_start_matches('/');
        let is_directory = rest.ends_with('/');
        let segment = rest.trim_end_matches('/');
        if segment.is_empty() || segment.contains('/') {
            continue;
        }
        let name = percent_decode_str(segment).decode_utf8_lossy().into_owned();
        if name == ".." {
            continue;
        }
        entries.push(IndexEntry {
            name,
            is_directory,
            size: parse_human_size(capture[3].trim()),
            modified: parse_index_timestamp(capture[2].trim()),
        });
    }
    entries
}

/// `"1.2 MiB"`, `"456 B"`, `"3.4M"`, `"-"`.
pub fn parse_human_size(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if raw.is_empty() || raw == "-" {
        return None;
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(raw.len());
    let value: f64 = raw[..split].parse().ok()?;
    let unit = raw[split..].trim().trim_end_matches(['i', 'B', 'b']).trim();
    let factor: u64 = match unit {
        "" => 1,
        "K" | "k" => 1024,
        "M" | "m" => 1024 * 1024,
        "G" | "g" => 1024 * 1024 * 1024,
        "T" | "t" => 1024u64.pow(4),
        _ => return None,
    };
    Some((value * factor as f64).round() as u64)
}

/// `"2024-04-23 11:22"` or `"23-Apr-2024 11:22"`.
pub fn parse_index_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    for format in ["%Y-%m-%d %H:%M", "%d-%b-%Y %H:%M", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }
    None
}

/// JSON autoindex bodies (`nginx autoindex_format json` and similar).
pub fn parse_json_index(body: &str) -> Option<Vec<IndexEntry>> {
    #[derive(Deserialize)]
    struct Row {
        name: String,
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        size: Option<u64>,
        #[serde(default)]
        mtime: Option<String>,
    }

    let rows: Vec<Row> = serde_json::from_str(body).ok()?;
    Some(
        rows.into_iter()
            .map(|row| IndexEntry {
                is_directory: row.kind == "directory",
                modified: row
                    .mtime
                    .as_deref()
                    .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
                    .map(|d| d.with_timezone(&Utc)),
                name: row.name,
                size: row.size,
            })
            .collect(),
    )
}

fn xml_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<Key>([^<]+)</Key>|<Prefix>([^<]+)</Prefix>").expect("xml regex"))
}

/// S3-style XML bucket listings (`ListBucketResult`): `<Key>` rows are
/// files, `<CommonPrefixes><Prefix>` rows are directories.
pub fn parse_xml_index(body: &str) -> Option<Vec<IndexEntry>> {
    if !body.contains("<ListBucketResult") {
        return None;
    }
    let mut entries = Vec::new();
    for capture in xml_key_re().captures_iter(body) {
        if let Some(key) = capture.get(1) {
            let name = key.as_str().rsplit('/').next().unwrap_or(key.as_str());
            if name.is_empty() {
                continue;
            }
            entries.push(IndexEntry {
                name: name.to_string(),
                is_directory: false,
                size: None,
                modified: None,
            });
        } else if let Some(prefix) = capture.get(2) {
            let name = prefix
                .as_str()
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or("");
            if name.is_empty() {
                continue;
            }
            entries.push(IndexEntry {
                name: name.to_string(),
                is_directory: true,
                size: None,
                modified: None,
            });
        }
    }
    Some(entries)
}

/// De-duplicate by `(kind, name)`, first occurrence wins.
pub fn dedupe(entries: Vec<IndexEntry>) -> Vec<IndexEntry> {
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert((e.is_directory, e.name.clone())))
        .collect()
}

/// A quick sniff for "this HTML is a directory index, not a document".
pub fn looks_like_directory_index(snippet: &str) -> bool {
    let lower = snippet.to_lowercase();
    lower.contains("index of")
        || lower.contains("href=\"../\"")
        || lower.contains("parent directory")
        || lower.contains("autoindex")
}
