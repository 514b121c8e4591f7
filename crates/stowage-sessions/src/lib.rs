//! Upload-session records and the pluggable session store.
//!
//! Multipart uploads outlive single requests, so their state lives in an
//! external store the orchestrator owns. Drivers author the record at init,
//! mutate it on sign/refresh, and terminate it on complete or abort. The
//! `provider_meta` field is opaque JSON owned entirely by the authoring
//! driver — nothing else interprets it.
//!
//! # Example
//!
//! ```
//! use stowage_sessions::{MemorySessionStore, SessionPatch, SessionStore, UploadSessionRecord};
//! use stowage_types::{DriverKind, SessionStatus, UploadStrategy};
//!
//! let store = MemorySessionStore::new();
//! let record = UploadSessionRecord::new(
//!     DriverKind::HubDataset,
//!     "/data/big.bin",
//!     UploadStrategy::PerPartUrl,
//! );
//! let id = store.create(record).expect("create");
//!
//! store
//!     .update(&id, SessionPatch::status(SessionStatus::InProgress))
//!     .expect("update");
//! assert!(store.get(&id).expect("get").status.is_active());
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stowage_types::{DriverKind, SessionStatus, UploadStrategy};

/// Persistent state of one multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSessionRecord {
    pub id: String,
    pub driver: DriverKind,
    /// Logical target path of the upload.
    pub path: String,
    pub strategy: UploadStrategy,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_parts: Option<u32>,
    /// Authoritative over any presigned URLs cached in `provider_meta`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    /// Driver-owned JSON; opaque to the orchestrator.
    #[serde(default)]
    pub provider_meta: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UploadSessionRecord {
    pub fn new(driver: DriverKind, path: impl Into<String>, strategy: UploadStrategy) -> Self {
        let now = Utc::now();
        Self {
            id: new_session_id(),
            driver,
            path: path.into(),
            strategy,
            status: SessionStatus::Initiated,
            part_size: None,
            total_parts: None,
            expires_at: None,
            provider_meta: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether cached presigned material has expired.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Random 24-hex-char session id.
fn new_session_id() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("ups_{}", hex::encode(bytes))
}

/// A partial update to a session record. Unset fields are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_parts: Option<u32>,
    /// `Some(None)` clears the expiry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_meta: Option<serde_json::Value>,
}

impl SessionPatch {
    pub fn status(status: SessionStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    pub fn meta(provider_meta: serde_json::Value) -> Self {
        Self { provider_meta: Some(provider_meta), ..Default::default() }
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_expires_at(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_parts(mut self, part_size: u64, total_parts: u32) -> Self {
        self.part_size = Some(part_size);
        self.total_parts = Some(total_parts);
        self
    }

    fn apply(self, record: &mut UploadSessionRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(part_size) = self.part_size {
            record.part_size = Some(part_size);
        }
        if let Some(total_parts) = self.total_parts {
            record.total_parts = Some(total_parts);
        }
        if let Some(expires_at) = self.expires_at {
            record.expires_at = expires_at;
        }
        if let Some(meta) = self.provider_meta {
            record.provider_meta = meta;
        }
        record.updated_at = Utc::now();
    }
}

/// Filter for `list_active`.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub driver: Option<DriverKind>,
    pub path_prefix: Option<String>,
}

impl SessionFilter {
    fn matches(&self, record: &UploadSessionRecord) -> bool {
        if !record.status.is_active() {
            return false;
        }
        if let Some(driver) = self.driver {
            if record.driver != driver {
                return false;
            }
        }
        if let Some(prefix) = &self.path_prefix {
            if !record.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

/// The external session ledger.
///
/// Updates are optimistic: drivers tolerate one-shot update failures by
/// logging and proceeding, so implementations should prefer availability
/// over strict consistency.
pub trait SessionStore: Send + Sync {
    fn create(&self, record: UploadSessionRecord) -> anyhow::Result<String>;
    fn get(&self, id: &str) -> anyhow::Result<UploadSessionRecord>;
    fn update(&self, id: &str, patch: SessionPatch) -> anyhow::Result<()>;
    fn list_active(&self, filter: &SessionFilter) -> anyhow::Result<Vec<UploadSessionRecord>>;
}

/// In-memory store for tests and embedded use.
#[derive(Default)]
pub struct MemorySessionStore {
    records: Mutex<HashMap<String, UploadSessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn create(&self, record: UploadSessionRecord) -> anyhow::Result<String> {
        let id = record.id.clone();
        let mut records = self.records.lock().expect("session store poisoned");
        records.insert(id.clone(), record);
        Ok(id)
    }

    fn get(&self, id: &str) -> anyhow::Result<UploadSessionRecord> {
        let records = self.records.lock().expect("session store poisoned");
        records
            .get(id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown upload session: {id}"))
    }

    fn update(&self, id: &str, patch: SessionPatch) -> anyhow::Result<()> {
        let mut records = self.records.lock().expect("session store poisoned");
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow::anyhow!("unknown upload session: {id}"))?;
        patch.apply(record);
        Ok(())
    }

    fn list_active(&self, filter: &SessionFilter) -> anyhow::Result<Vec<UploadSessionRecord>> {
        let records = self.records.lock().expect("session store poisoned");
        let mut out: Vec<_> = records.values().filter(|r| filter.matches(r)).cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}

/// File-backed store: one JSON document per session under a base directory.
///
/// Writes go through a temp file and rename so a crashed update never leaves
/// a torn record.
pub struct FileSessionStore {
    base_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.json"))
    }

    fn write_record(&self, record: &UploadSessionRecord) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_record(&self, path: &Path) -> anyhow::Result<UploadSessionRecord> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl SessionStore for FileSessionStore {
    fn create(&self, record: UploadSessionRecord) -> anyhow::Result<String> {
        let id = record.id.clone();
        self.write_record(&record)?;
        Ok(id)
    }

    fn get(&self, id: &str) -> anyhow::Result<UploadSessionRecord> {
        let path = self.record_path(id);
        if !path.exists() {
            anyhow::bail!("unknown upload session: {id}");
        }
        self.read_record(&path)
    }

    fn update(&self, id: &str, patch: SessionPatch) -> anyhow::Result<()> {
        let mut record = self.get(id)?;
        patch.apply(&mut record);
        self.write_record(&record)
    }

    fn list_active(&self, filter: &SessionFilter) -> anyhow::Result<Vec<UploadSessionRecord>> {
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&self.base_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            // Skip records we cannot parse; a torn write must not poison the
            // whole listing.
            if let Ok(record) = self.read_record(&path) {
                if filter.matches(&record) {
                    out.push(record);
                }
            }
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str) -> UploadSessionRecord {
        UploadSessionRecord::new(DriverKind::HubDataset, path, UploadStrategy::PerPartUrl)
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let a = record("/a");
        let b = record("/b");
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("ups_"));
        assert_eq!(a.id.len(), 4 + 24);
    }

    #[test]
    fn memory_store_crud() {
        let store = MemorySessionStore::new();
        let id = store.create(record("/x.bin")).expect("create");

        let fetched = store.get(&id).expect("get");
        assert_eq!(fetched.status, SessionStatus::Initiated);

        store
            .update(
                &id,
                SessionPatch::meta(serde_json::json!({"urls": ["a", "b"]}))
                    .with_status(SessionStatus::InProgress),
            )
            .expect("update");

        let fetched = store.get(&id).expect("get");
        assert_eq!(fetched.status, SessionStatus::InProgress);
        assert_eq!(fetched.provider_meta["urls"][1], "b");

        assert!(store.get("ups_missing").is_err());
    }

    #[test]
    fn list_active_filters_status_driver_and_prefix() {
        let store = MemorySessionStore::new();
        let a = store.create(record("/data/a.bin")).expect("create");
        let b = store.create(record("/other/b.bin")).expect("create");
        let mut done = record("/data/c.bin");
        done.status = SessionStatus::Completed;
        store.create(done).expect("create");

        let all = store.list_active(&SessionFilter::default()).expect("list");
        assert_eq!(all.len(), 2);

        let filtered = store
            .list_active(&SessionFilter {
                driver: Some(DriverKind::HubDataset),
                path_prefix: Some("/data/".to_string()),
            })
            .expect("list");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].id, a);
        assert_ne!(filtered[0].id, b);
    }

    #[test]
    fn patch_clears_expiry_with_explicit_none() {
        let store = MemorySessionStore::new();
        let mut rec = record("/x");
        rec.expires_at = Some(Utc::now());
        let id = store.create(rec).expect("create");

        store
            .update(&id, SessionPatch::default().with_expires_at(None))
            .expect("update");
        assert!(store.get(&id).expect("get").expires_at.is_none());
    }

    #[test]
    fn expiry_check() {
        let mut rec = record("/x");
        assert!(!rec.is_expired(Utc::now()));
        rec.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(rec.is_expired(Utc::now()));
    }

    #[test]
    fn file_store_round_trips() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(td.path());

        let id = store.create(record("/big.bin")).expect("create");
        store
            .update(&id, SessionPatch::default().with_parts(8 * 1024 * 1024, 5))
            .expect("update");

        let fetched = store.get(&id).expect("get");
        assert_eq!(fetched.part_size, Some(8 * 1024 * 1024));
        assert_eq!(fetched.total_parts, Some(5));

        let active = store.list_active(&SessionFilter::default()).expect("list");
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn file_store_ignores_torn_records() {
        let td = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(td.path());
        store.create(record("/ok.bin")).expect("create");
        std::fs::write(td.path().join("ups_torn.json"), b"{not json").expect("write");

        let active = store.list_active(&SessionFilter::default()).expect("list");
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn file_store_empty_dir_lists_nothing() {
        let store = FileSessionStore::new("/nonexistent/stowage-sessions-test");
        assert!(store
            .list_active(&SessionFilter::default())
            .expect("list")
            .is_empty());
    }
}
