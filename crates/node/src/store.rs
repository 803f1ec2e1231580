//! # Flow persistence
//!
//! `KvStore` is the durable key/value contract the node consumes; writes are
//! on disk before the call returns, so the work loop may rely on anything it
//! wrote surviving a crash. `FlowStore` layers the two key families the core
//! uses on top:
//!
//! - `flow/<flow-id>` → serialized [`Flow`]
//! - `job-flow/<job-addr>` → flow id
//!
//! The job binding is monotonic: once a job address maps to a flow id, it is
//! never rewritten to a different one.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nosana_common::{Flow, FlowId, NodeError, Result};
use parking_lot::Mutex;

const FLOW_PREFIX: &str = "flow/";
const JOB_PREFIX: &str = "job-flow/";

/// Durable ordered key/value store.
pub trait KvStore: Debug + Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Durable before returning.
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// All keys with the given prefix, in lexicographic order.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

// ─── In-memory store ─────────────────────────────────────────────────────────

/// Volatile store for tests.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .map
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

// ─── File-backed store ───────────────────────────────────────────────────────

/// One file per key under a root directory.
///
/// File names are the hex encoding of the key bytes, which is
/// order-preserving, so a sorted directory listing yields sorted keys.
/// Writes go through a temp file and rename.
#[derive(Debug, Clone)]
pub struct FileKvStore {
    root: PathBuf,
}

impl FileKvStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| NodeError::Storage(format!("create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(hex::encode(key.as_bytes()))
    }

    fn atomic_write(&self, dest: &Path, data: &[u8]) -> std::io::Result<()> {
        let tmp = dest.with_extension("tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(data)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, dest)
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read(&path)
            .map(Some)
            .map_err(|e| NodeError::Storage(format!("read {key}: {e}")))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.atomic_write(&self.path_for(key), value)
            .map_err(|e| NodeError::Storage(format!("write {key}: {e}")))
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let entries = fs::read_dir(&self.root)
            .map_err(|e| NodeError::Storage(format!("list {}: {e}", self.root.display())))?;
        for entry in entries {
            let entry = entry.map_err(|e| NodeError::Storage(format!("list entry: {e}")))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // skip interrupted writes
            if name.ends_with(".tmp") {
                continue;
            }
            let Ok(raw) = hex::decode(name) else { continue };
            let Ok(key) = String::from_utf8(raw) else { continue };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }
}

// ─── Flow store ──────────────────────────────────────────────────────────────

/// Typed flow persistence over a [`KvStore`].
#[derive(Clone)]
pub struct FlowStore {
    kv: Arc<dyn KvStore>,
}

impl FlowStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn get_flow(&self, id: &str) -> Result<Option<Flow>> {
        let key = format!("{FLOW_PREFIX}{id}");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| NodeError::Decode(format!("flow {id}: {e}"))),
        }
    }

    pub fn put_flow(&self, flow: &Flow) -> Result<()> {
        let key = format!("{FLOW_PREFIX}{}", flow.id);
        let bytes = serde_json::to_vec(flow)
            .map_err(|e| NodeError::Decode(format!("flow {}: {e}", flow.id)))?;
        self.kv.put(&key, &bytes)
    }

    /// Flow id previously bound to a job address, if any.
    pub fn flow_for_job(&self, job_addr: &str) -> Result<Option<FlowId>> {
        let key = format!("{JOB_PREFIX}{job_addr}");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|e| NodeError::Decode(format!("job binding {job_addr}: {e}"))),
        }
    }

    /// Bind a job address to a flow id. Rebinding to the same id is a
    /// no-op; rebinding to a different id is refused.
    pub fn bind_job(&self, job_addr: &str, flow_id: &str) -> Result<()> {
        if let Some(existing) = self.flow_for_job(job_addr)? {
            if existing == flow_id {
                return Ok(());
            }
            return Err(NodeError::Storage(format!(
                "job {job_addr} already bound to flow {existing}"
            )));
        }
        let key = format!("{JOB_PREFIX}{job_addr}");
        self.kv.put(&key, flow_id.as_bytes())
    }

    /// Ids of every persisted flow.
    pub fn flow_ids(&self) -> Result<Vec<FlowId>> {
        Ok(self
            .kv
            .keys(FLOW_PREFIX)?
            .into_iter()
            .map(|k| k[FLOW_PREFIX.len()..].to_string())
            .collect())
    }
}
