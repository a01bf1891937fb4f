//! LocalReplicaStore - where the local replica state lives.
//!
//! The engine reads the whole [`LocalReplicaState`] and writes partial
//! updates ([`ReplicaPatch`]); last writer wins.
//!
//! - [`MemoryReplicaStore`] keeps it in memory (tests, ephemeral sessions)
//! - [`FileReplicaStore`] keeps it in a JSON file shared by namespaces:
//!   `{ "<namespace>": { ...state... } }`

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use walletsync_types::{LocalReplicaState, ReplicaPatch};

/// Replica store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// File could not be read or written.
    #[error("replica I/O error on '{path}': {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// File content is not a valid replica document.
    #[error("replica file '{path}' is corrupt: {source}")]
    Json {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// Persistence for the local replica state.
#[async_trait]
pub trait LocalReplicaStore: Send + Sync {
    /// Read the current state.
    async fn get(&self) -> Result<LocalReplicaState, StoreError>;

    /// Apply a patch and return the resulting state.
    async fn merge(&self, patch: ReplicaPatch) -> Result<LocalReplicaState, StoreError>;
}

/// In-memory replica store.
#[derive(Debug, Default, Clone)]
pub struct MemoryReplicaStore {
    state: Arc<Mutex<LocalReplicaState>>,
}

impl MemoryReplicaStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `state`.
    pub fn with_state(state: LocalReplicaState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }
}

#[async_trait]
impl LocalReplicaStore for MemoryReplicaStore {
    async fn get(&self) -> Result<LocalReplicaState, StoreError> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn merge(&self, patch: ReplicaPatch) -> Result<LocalReplicaState, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.apply(patch);
        Ok(state.clone())
    }
}

/// Replica store backed by a JSON file.
///
/// The state is cached in memory; every merge rewrites the file through a
/// temp file and a rename. With `persist` off, merges only touch the cache.
#[derive(Debug)]
pub struct FileReplicaStore {
    path: PathBuf,
    namespace: String,
    persist: AtomicBool,
    cache: tokio::sync::Mutex<LocalReplicaState>,
}

impl FileReplicaStore {
    /// Open the store, loading `namespace` from `path` if the file exists.
    pub async fn open(
        path: impl Into<PathBuf>,
        namespace: impl Into<String>,
        persist: bool,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let namespace = namespace.into();

        let state = if persist {
            let document = read_document(&path).await?;
            match document.get(&namespace) {
                Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                    StoreError::Json {
                        path: path.clone(),
                        source: e,
                    }
                })?,
                None => LocalReplicaState::default(),
            }
        } else {
            LocalReplicaState::default()
        };

        tracing::debug!(
            "Opened replica '{}' at {} (persist: {})",
            namespace,
            path.display(),
            persist
        );
        Ok(Self {
            path,
            namespace,
            persist: AtomicBool::new(persist),
            cache: tokio::sync::Mutex::new(state),
        })
    }

    /// File location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Namespace key inside the file.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Whether merges are written to disk.
    pub fn persists(&self) -> bool {
        self.persist.load(Ordering::SeqCst)
    }

    /// Switch between disk and memory-only.
    ///
    /// Turning persistence on writes the cached state out immediately.
    pub async fn set_persist(&self, persist: bool) -> Result<(), StoreError> {
        let cache = self.cache.lock().await;
        if persist && !self.persists() {
            self.write(&cache).await?;
        }
        self.persist.store(persist, Ordering::SeqCst);
        Ok(())
    }

    async fn write(&self, state: &LocalReplicaState) -> Result<(), StoreError> {
        let mut document = read_document(&self.path).await?;
        let value = serde_json::to_value(state).map_err(|e| self.json_error(e))?;
        document.insert(self.namespace.clone(), value);
        let contents =
            serde_json::to_vec_pretty(&Value::Object(document)).map_err(|e| self.json_error(e))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(parent, e))?;
            }
        }

        // Write atomically using a temp file
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, &contents)
            .await
            .map_err(|e| io_error(&temp_path, e))?;
        set_file_permissions_0600(&temp_path).await?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| io_error(&self.path, e))?;
        Ok(())
    }

    fn json_error(&self, source: serde_json::Error) -> StoreError {
        StoreError::Json {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl LocalReplicaStore for FileReplicaStore {
    async fn get(&self) -> Result<LocalReplicaState, StoreError> {
        Ok(self.cache.lock().await.clone())
    }

    async fn merge(&self, patch: ReplicaPatch) -> Result<LocalReplicaState, StoreError> {
        let mut cache = self.cache.lock().await;
        let mut next = cache.clone();
        next.apply(patch);

        if self.persists() {
            self.write(&next).await?;
        }
        *cache = next.clone();
        Ok(next)
    }
}

async fn read_document(path: &Path) -> Result<Map<String, Value>, StoreError> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(io_error(path, e)),
    };
    serde_json::from_slice(&contents).map_err(|e| StoreError::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Set file permissions to 0600 (owner read/write only) on Unix.
/// No-op on non-Unix platforms.
async fn set_file_permissions_0600(path: &Path) -> Result<(), StoreError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| io_error(path, e))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
