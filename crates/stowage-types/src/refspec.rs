//! Git reference classification.
//!
//! Drivers backed by Git repositories accept a revision string that may name
//! a branch, a tag or a commit. Only branches are writable; classification
//! happens without a network round-trip, with an optional known-branch list
//! (from a driver's refs cache) to resolve bare names.

use serde::{Deserialize, Serialize};

/// What a revision string names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Branch(String),
    Tag(String),
    Commit(String),
    /// A bare name that could not be resolved against a refs list.
    Unknown(String),
}

impl RefKind {
    /// Classify a revision string.
    ///
    /// `known_branches` and `known_tags` resolve bare names; pass empty
    /// slices when no refs listing is available.
    pub fn classify(raw: &str, known_branches: &[String], known_tags: &[String]) -> RefKind {
        if let Some(name) = raw
            .strip_prefix("refs/heads/")
            .or_else(|| raw.strip_prefix("heads/"))
        {
            return RefKind::Branch(name.to_string());
        }
        if let Some(name) = raw
            .strip_prefix("refs/tags/")
            .or_else(|| raw.strip_prefix("tags/"))
        {
            return RefKind::Tag(name.to_string());
        }
        if is_commit_id(raw) {
            return RefKind::Commit(raw.to_string());
        }
        if known_branches.iter().any(|b| b == raw) {
            return RefKind::Branch(raw.to_string());
        }
        if known_tags.iter().any(|t| t == raw) {
            return RefKind::Tag(raw.to_string());
        }
        RefKind::Unknown(raw.to_string())
    }

    /// Branch name when the ref is writable.
    pub fn branch_name(&self) -> Option<&str> {
        match self {
            RefKind::Branch(name) => Some(name),
            _ => None,
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, RefKind::Commit(_))
    }

    /// Only branches are writable; tags and commit ids are read-only.
    pub fn is_writable(&self) -> bool {
        matches!(self, RefKind::Branch(_))
    }

    /// The bare revision name, without any `refs/…` prefix.
    pub fn short_name(&self) -> &str {
        match self {
            RefKind::Branch(s) | RefKind::Tag(s) | RefKind::Commit(s) | RefKind::Unknown(s) => s,
        }
    }
}

/// A full 40-character lowercase hex object id.
pub fn is_commit_id(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
