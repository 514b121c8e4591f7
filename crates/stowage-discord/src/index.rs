//! The external VFS index.
//!
//! The chat service stores bytes; the file-system shape lives in an external
//! node store the orchestrator provides. Each node is a directory or a file;
//! file nodes carry a `content_ref` pointing at one attachment or at an
//! ordered list of chunk attachments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stowage_types::{Result, StorageError, path};

/// Node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Dir,
    File,
}

/// One row of the VFS index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VfsNode {
    pub id: String,
    /// `None` parents a node at the root.
    pub parent_id: Option<String>,
    pub owner: String,
    pub scope: String,
    pub name: String,
    pub node_type: NodeType,
    pub mime: String,
    pub size: Option<u64>,
    /// `discord_attachment_v1` or `discord_chunks_v1` JSON.
    #[serde(default)]
    pub content_ref: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VfsNode {
    pub fn new_dir(owner: &str, scope: &str, parent_id: Option<String>, name: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_node_id(),
            parent_id,
            owner: owner.to_string(),
            scope: scope.to_string(),
            name: name.to_string(),
            node_type: NodeType::Dir,
            mime: "application/x-directory".to_string(),
            size: None,
            content_ref: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn new_file(
        owner: &str,
        scope: &str,
        parent_id: Option<String>,
        name: &str,
        mime: String,
        size: Option<u64>,
        content_ref: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_node_id(),
            parent_id,
            owner: owner.to_string(),
            scope: scope.to_string(),
            name: name.to_string(),
            node_type: NodeType::File,
            mime,
            size,
            content_ref,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Dir
    }
}

fn new_node_id() -> String {
    use rand::RngCore;

    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("vfs_{}", hex::encode(bytes))
}

/// The external index store. All operations are scoped to `(owner, scope)`.
pub trait NodeStore: Send + Sync {
    fn get(&self, owner: &str, scope: &str, id: &str) -> anyhow::Result<Option<VfsNode>>;

    fn lookup(
        &self,
        owner: &str,
        scope: &str,
        parent_id: Option<&str>,
        name: &str,
    ) -> anyhow::Result<Option<VfsNode>>;

    fn children(
        &self,
        owner: &str,
        scope: &str,
        parent_id: Option<&str>,
    ) -> anyhow::Result<Vec<VfsNode>>;

    fn insert(&self, node: VfsNode) -> anyhow::Result<()>;

    fn update(&self, node: &VfsNode) -> anyhow::Result<()>;

    fn remove(&self, owner: &str, scope: &str, id: &str) -> anyhow::Result<()>;

    /// Case-insensitive name-substring search.
    fn search(&self, owner: &str, scope: &str, query: &str) -> anyhow::Result<Vec<VfsNode>>;
}

/// In-memory store for tests and embedded deployments.
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: std::sync::Mutex<Vec<VfsNode>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, owner: &str, scope: &str, id: &str) -> anyhow::Result<Option<VfsNode>> {
        let nodes = self.nodes.lock().expect("node store poisoned");
        Ok(nodes
            .iter()
            .find(|n| n.owner == owner && n.scope == scope && n.id == id)
            .cloned())
    }

    fn lookup(
        &self,
        owner: &str,
        scope: &str,
        parent_id: Option<&str>,
        name: &str,
    ) -> anyhow::Result<Option<VfsNode>> {
        let nodes = self.nodes.lock().expect("node store poisoned");
        Ok(nodes
            .iter()
            .find(|n| {
                n.owner == owner
                    && n.scope == scope
                    && n.parent_id.as_deref() == parent_id
                    && n.name == name
            })
            .cloned())
    }

    fn children(
        &self,
        owner: &str,
        scope: &str,
        parent_id: Option<&str>,
    ) -> anyhow::Result<Vec<VfsNode>> {
        let nodes = self.nodes.lock().expect("node store poisoned");
        let mut out: Vec<VfsNode> = nodes
            .iter()
            .filter(|n| n.owner == owner && n.scope == scope && n.parent_id.as_deref() == parent_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn insert(&self, node: VfsNode) -> anyhow::Result<()> {
        let mut nodes = self.nodes.lock().expect("node store poisoned");
        if nodes.iter().any(|n| {
            n.owner == node.owner
                && n.scope == node.scope
                && n.parent_id == node.parent_id
                && n.name == node.name
        }) {
            anyhow::bail!("node {} already exists in this directory", node.name);
        }
        nodes.push(node);
        Ok(())
    }

    fn update(&self, node: &VfsNode) -> anyhow::Result<()> {
        let mut nodes = self.nodes.lock().expect("node store poisoned");
        let slot = nodes
            .iter_mut()
            .find(|n| n.id == node.id)
            .ok_or_else(|| anyhow::anyhow!("unknown node {}", node.id))?;
        *slot = node.clone();
        Ok(())
    }

    fn remove(&self, owner: &str, scope: &str, id: &str) -> anyhow::Result<()> {
        let mut nodes = self.nodes.lock().expect("node store poisoned");
        nodes.retain(|n| !(n.owner == owner && n.scope == scope && n.id == id));
        Ok(())
    }

    fn search(&self, owner: &str, scope: &str, query: &str) -> anyhow::Result<Vec<VfsNode>> {
        let needle = query.to_lowercase();
        let nodes = self.nodes.lock().expect("node store poisoned");
        Ok(nodes
            .iter()
            .filter(|n| {
                n.owner == owner && n.scope == scope && n.name.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect())
    }
}

/// Walk a normalized logical path down from the root.
pub fn resolve_path(
    store: &dyn NodeStore,
    owner: &str,
    scope: &str,
    normalized: &str,
) -> Result<Option<VfsNode>> {
    if path::is_root(normalized) {
        return Ok(None);
    }
    let mut parent: Option<String> = None;
    let mut node = None;
    for segment in normalized.trim_matches('/').split('/') {
        let found = store
            .lookup(owner, scope, parent.as_deref(), segment)
            .map_err(index_error)?;
        match found {
            Some(n) => {
                parent = Some(n.id.clone());
                node = Some(n);
            }
            None => return Err(StorageError::not_found(normalized)),
        }
    }
    Ok(node)
}

/// Ensure every directory along `dir_path` exists, returning the leaf dir id.
pub fn ensure_dirs(
    store: &dyn NodeStore,
    owner: &str,
    scope: &str,
    dir_path: &str,
) -> Result<Option<String>> {
    if path::is_root(dir_path) {
        return Ok(None);
    }
    let mut parent: Option<String> = None;
    for segment in dir_path.trim_matches('/').split('/') {
        let found = store
            .lookup(owner, scope, parent.as_deref(), segment)
            .map_err(index_error)?;
        let id = match found {
            Some(node) if node.is_dir() => node.id,
            Some(_) => {
                return Err(StorageError::invalid_path(format!(
                    "{segment} is a file, not a directory"
                )));
            }
            None => {
                let node = VfsNode::new_dir(owner, scope, parent.clone(), segment);
                let id = node.id.clone();
                store.insert(node).map_err(index_error)?;
                id
            }
        };
        parent = Some(id);
    }
    Ok(parent)
}

pub fn index_error(e: anyhow::Error) -> StorageError {
    StorageError::upstream(format!("vfs index failed: {e}"))
}
