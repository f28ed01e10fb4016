//! Run and artifact persistence
//!
//! [`JsonStateStore`] keeps one pretty-printed JSON document per run and one
//! text file per artifact, written through temp-file + rename so a reader
//! never observes a half-written document. [`MemoryStateStore`] is the
//! in-process equivalent used by tests and embedders.
//!
//! Both hand out [`RunLease`]s: whoever holds a run's lease is the only one
//! allowed to step it, whichever process they live in.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use super::lease::{FileLease, DEFAULT_LEASE_TTL};
use super::schema::{self, keys, NS_ARCHIVE, NS_ARTIFACTS, NS_RUNS};
use crate::pipeline::{ArtifactHandle, WorkflowState};

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error in {key}: {message}")]
    Deserialization { key: String, message: String },

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage of workflow state, keyed by run id
pub trait RunStore: Send + Sync {
    fn save_run(&self, state: &WorkflowState) -> StoreResult<()>;

    /// Live run, if any
    fn load_run(&self, run_id: &str) -> StoreResult<Option<WorkflowState>>;

    /// Archived run, if any
    fn load_archived(&self, run_id: &str) -> StoreResult<Option<WorkflowState>>;

    /// All live runs, oldest first
    fn list_runs(&self) -> StoreResult<Vec<WorkflowState>>;

    /// Move a run from the live namespace to the archive
    fn archive_run(&self, state: &WorkflowState) -> StoreResult<()>;

    /// Exclusive hold on a run; `None` while someone else holds it
    fn try_lease(&self, run_id: &str) -> StoreResult<Option<RunLease>>;

    /// Ask the lease holder to abandon its step
    fn request_cancel(&self, run_id: &str) -> StoreResult<()>;

    fn cancel_requested(&self, run_id: &str) -> StoreResult<bool>;

    fn clear_cancel(&self, run_id: &str) -> StoreResult<()>;
}

/// Exclusive hold on a run, released on drop
#[derive(Debug)]
pub enum RunLease {
    File(FileLease),
    Memory(MemoryLease),
}

impl RunLease {
    /// Keep the lease alive; `false` when it was lost to a takeover
    pub fn refresh(&self) -> StoreResult<bool> {
        match self {
            Self::File(lease) => Ok(lease.refresh()?),
            Self::Memory(_) => Ok(true),
        }
    }
}

#[derive(Debug)]
pub struct MemoryLease {
    held: Arc<Mutex<HashSet<String>>>,
    run_id: String,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        if let Ok(mut held) = self.held.lock() {
            held.remove(&self.run_id);
        }
    }
}

/// Immutable artifact blobs, owned by their run
pub trait ArtifactStore: Send + Sync {
    fn put_artifact(&self, handle: &ArtifactHandle, text: &str) -> StoreResult<()>;

    fn get_artifact(&self, handle: &ArtifactHandle) -> StoreResult<Option<String>>;

    fn has_artifact(&self, handle: &ArtifactHandle) -> StoreResult<bool> {
        Ok(self.get_artifact(handle)?.is_some())
    }

    /// Drop every artifact of a run; returns how many were removed
    fn purge_run(&self, run_id: &str) -> StoreResult<usize>;
}

/// Shared reference to a run store
pub type SharedRunStore = Arc<dyn RunStore>;

/// Shared reference to an artifact store
pub type SharedArtifactStore = Arc<dyn ArtifactStore>;

fn check_key(key: &str) -> StoreResult<()> {
    if keys::is_safe(key) {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Write `bytes` to `path` via a sibling temp file and rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("doc");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Read and parse a JSON document; `None` when the file does not exist.
pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| StoreError::Deserialization {
            key: path.display().to_string(),
            message: e.to_string(),
        })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    write_atomic(path, json.as_bytes())?;
    Ok(())
}

// ============================================================================
// JSON directory backend
// ============================================================================

/// Directory-backed store for runs and artifacts
pub struct JsonStateStore {
    root: PathBuf,
    lease_ttl: Duration,
}

impl JsonStateStore {
    /// Open or create a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        for ns in schema::ALL_NAMESPACES {
            std::fs::create_dir_all(root.join(ns))?;
        }
        Ok(Self {
            root,
            lease_ttl: DEFAULT_LEASE_TTL,
        })
    }

    /// Age after which a run lease nobody refreshed may be taken over
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn run_path(&self, ns: &str, run_id: &str) -> StoreResult<PathBuf> {
        check_key(run_id)?;
        Ok(self.root.join(ns).join(keys::run(run_id)))
    }

    fn marker_path(&self, run_id: &str, name: fn(&str) -> String) -> StoreResult<PathBuf> {
        check_key(run_id)?;
        Ok(self.root.join(NS_RUNS).join(name(run_id)))
    }

    fn artifact_path(&self, handle: &ArtifactHandle) -> StoreResult<PathBuf> {
        check_key(&handle.run_id)?;
        Ok(self
            .root
            .join(NS_ARTIFACTS)
            .join(&handle.run_id)
            .join(keys::artifact(handle)))
    }
}

impl RunStore for JsonStateStore {
    fn save_run(&self, state: &WorkflowState) -> StoreResult<()> {
        write_json(&self.run_path(NS_RUNS, &state.run_id)?, state)
    }

    fn load_run(&self, run_id: &str) -> StoreResult<Option<WorkflowState>> {
        read_json(&self.run_path(NS_RUNS, run_id)?)
    }

    fn load_archived(&self, run_id: &str) -> StoreResult<Option<WorkflowState>> {
        read_json(&self.run_path(NS_ARCHIVE, run_id)?)
    }

    fn list_runs(&self) -> StoreResult<Vec<WorkflowState>> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(self.root.join(NS_RUNS))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(state) = read_json::<WorkflowState>(&path)? {
                runs.push(state);
            }
        }
        runs.sort_by_key(|s| s.created_at);
        Ok(runs)
    }

    fn archive_run(&self, state: &WorkflowState) -> StoreResult<()> {
        write_json(&self.run_path(NS_ARCHIVE, &state.run_id)?, state)?;
        match std::fs::remove_file(self.run_path(NS_RUNS, &state.run_id)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn try_lease(&self, run_id: &str) -> StoreResult<Option<RunLease>> {
        let path = self.marker_path(run_id, keys::run_lease)?;
        Ok(FileLease::try_acquire(&path, self.lease_ttl)?.map(RunLease::File))
    }

    fn request_cancel(&self, run_id: &str) -> StoreResult<()> {
        let path = self.marker_path(run_id, keys::run_cancel)?;
        write_atomic(&path, chrono::Utc::now().to_rfc3339().as_bytes())?;
        Ok(())
    }

    fn cancel_requested(&self, run_id: &str) -> StoreResult<bool> {
        Ok(self.marker_path(run_id, keys::run_cancel)?.is_file())
    }

    fn clear_cancel(&self, run_id: &str) -> StoreResult<()> {
        match std::fs::remove_file(self.marker_path(run_id, keys::run_cancel)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ArtifactStore for JsonStateStore {
    fn put_artifact(&self, handle: &ArtifactHandle, text: &str) -> StoreResult<()> {
        let path = self.artifact_path(handle)?;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        write_atomic(&path, text.as_bytes())?;
        Ok(())
    }

    fn get_artifact(&self, handle: &ArtifactHandle) -> StoreResult<Option<String>> {
        match std::fs::read_to_string(self.artifact_path(handle)?) {
            Ok(text) => Ok(Some(text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn has_artifact(&self, handle: &ArtifactHandle) -> StoreResult<bool> {
        Ok(self.artifact_path(handle)?.is_file())
    }

    fn purge_run(&self, run_id: &str) -> StoreResult<usize> {
        check_key(run_id)?;
        let dir = self.root.join(NS_ARTIFACTS).join(run_id);
        if !dir.exists() {
            return Ok(0);
        }
        let count = std::fs::read_dir(&dir)?.count();
        std::fs::remove_dir_all(&dir)?;
        Ok(count)
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

#[derive(Default)]
pub struct MemoryStateStore {
    runs: RwLock<HashMap<String, WorkflowState>>,
    archive: RwLock<HashMap<String, WorkflowState>>,
    artifacts: RwLock<HashMap<ArtifactHandle, String>>,
    leases: Arc<Mutex<HashSet<String>>>,
    cancels: RwLock<HashSet<String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Remove an artifact behind the controller's back (corruption tests)
    pub fn remove_artifact(&self, handle: &ArtifactHandle) -> StoreResult<bool> {
        let mut artifacts = self.artifacts.write().map_err(|_| StoreError::LockPoisoned)?;
        Ok(artifacts.remove(handle).is_some())
    }
}

impl RunStore for MemoryStateStore {
    fn save_run(&self, state: &WorkflowState) -> StoreResult<()> {
        let mut runs = self.runs.write().map_err(|_| StoreError::LockPoisoned)?;
        runs.insert(state.run_id.clone(), state.clone());
        Ok(())
    }

    fn load_run(&self, run_id: &str) -> StoreResult<Option<WorkflowState>> {
        let runs = self.runs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(runs.get(run_id).cloned())
    }

    fn load_archived(&self, run_id: &str) -> StoreResult<Option<WorkflowState>> {
        let archive = self.archive.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(archive.get(run_id).cloned())
    }

    fn list_runs(&self) -> StoreResult<Vec<WorkflowState>> {
        let runs = self.runs.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut list: Vec<_> = runs.values().cloned().collect();
        list.sort_by_key(|s| s.created_at);
        Ok(list)
    }

    fn archive_run(&self, state: &WorkflowState) -> StoreResult<()> {
        self.archive
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(state.run_id.clone(), state.clone());
        self.runs
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .remove(&state.run_id);
        Ok(())
    }

    fn try_lease(&self, run_id: &str) -> StoreResult<Option<RunLease>> {
        let mut held = self.leases.lock().map_err(|_| StoreError::LockPoisoned)?;
        if !held.insert(run_id.to_string()) {
            return Ok(None);
        }
        Ok(Some(RunLease::Memory(MemoryLease {
            held: Arc::clone(&self.leases),
            run_id: run_id.to_string(),
        })))
    }

    fn request_cancel(&self, run_id: &str) -> StoreResult<()> {
        self.cancels
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(run_id.to_string());
        Ok(())
    }

    fn cancel_requested(&self, run_id: &str) -> StoreResult<bool> {
        let cancels = self.cancels.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(cancels.contains(run_id))
    }

    fn clear_cancel(&self, run_id: &str) -> StoreResult<()> {
        self.cancels
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .remove(run_id);
        Ok(())
    }
}

impl ArtifactStore for MemoryStateStore {
    fn put_artifact(&self, handle: &ArtifactHandle, text: &str) -> StoreResult<()> {
        let mut artifacts = self.artifacts.write().map_err(|_| StoreError::LockPoisoned)?;
        artifacts.insert(handle.clone(), text.to_string());
        Ok(())
    }

    fn get_artifact(&self, handle: &ArtifactHandle) -> StoreResult<Option<String>> {
        let artifacts = self.artifacts.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(artifacts.get(handle).cloned())
    }

    fn purge_run(&self, run_id: &str) -> StoreResult<usize> {
        let mut artifacts = self.artifacts.write().map_err(|_| StoreError::LockPoisoned)?;
        let before = artifacts.len();
        artifacts.retain(|h, _| h.run_id != run_id);
        Ok(before - artifacts.len())
    }
}
