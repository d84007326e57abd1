use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tracing::{info, warn};

/// Store key for the identity the local cache currently belongs to.
pub const CURRENT_IDENTITY_KEY: &str = "currentIdentityId";

trait MarkerStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn save(&self) -> anyhow::Result<()>;
}

/// JSON file on disk, loaded once and rewritten atomically on save.
struct FileStore {
    path: PathBuf,
    data: Mutex<HashMap<String, String>>,
}

impl FileStore {
    fn open(path: &Path) -> anyhow::Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!(
                    target: "ledgerline",
                    event = "marker_store_unreadable",
                    path = %path.display(),
                    error = %err
                );
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            data: Mutex::new(data),
        })
    }
}

impl MarkerStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data
            .lock()
            .map(|guard| guard.get(key).cloned())
            .unwrap_or_default()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard.insert(key.to_string(), value.to_string());
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        let snapshot = self
            .data
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        let raw = serde_json::to_string_pretty(&snapshot)?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create marker store directory {}", parent.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw)
            .with_context(|| format!("write marker store {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replace marker store {}", self.path.display()))?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryStore {
    data: Mutex<HashMap<String, String>>,
}

impl MarkerStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.data
            .lock()
            .map(|guard| guard.get(key).cloned())
            .unwrap_or_default()
    }

    fn set(&self, key: &str, value: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard.insert(key.to_string(), value.to_string());
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Handle to wherever the identity marker lives. File-backed in the app,
/// in-memory in tests.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn MarkerStore + Send + Sync>,
}

impl StoreHandle {
    pub fn file(path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            inner: Arc::new(FileStore::open(path)?),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(MemoryStore::default()),
        }
    }

    /// Identity the cache was last reconciled for, if any.
    pub fn current_identity(&self) -> Option<String> {
        self.inner
            .get(CURRENT_IDENTITY_KEY)
            .filter(|v| !v.is_empty())
    }

    pub fn record_identity(&self, identity: &str) {
        self.inner.set(CURRENT_IDENTITY_KEY, identity);
        if let Err(err) = self.inner.save() {
            warn!(
                target: "ledgerline",
                event = "marker_store_save_failed",
                error = %err
            );
        } else {
            info!(
                target: "ledgerline",
                event = "identity_marker_recorded",
                identity = %identity
            );
        }
    }
}
