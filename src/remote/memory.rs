use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::entity::EntityType;

use super::{RemoteApi, RemoteError};

/// In-process stand-in for the remote service, with scripted failures.
/// Used by the integration tests and the CLI dry-run mode.
#[derive(Default)]
pub struct MemoryRemote {
    state: Mutex<State>,
    create_seq: AtomicU64,
}

#[derive(Default)]
struct State {
    identity: Option<String>,
    collections: HashMap<EntityType, BTreeMap<String, Value>>,
    // op key ("create:invoice") -> remaining forced failures
    failures: HashMap<String, u32>,
    next_create_ids: Vec<String>,
    calls: Vec<String>,
    latency: Option<Duration>,
}

impl MemoryRemote {
    pub fn new(identity: Option<&str>) -> Self {
        let remote = Self::default();
        remote.state.lock().unwrap().identity = identity.map(str::to_string);
        remote
    }

    pub fn set_identity(&self, identity: Option<&str>) {
        self.state.lock().unwrap().identity = identity.map(str::to_string);
    }

    /// Force the next `times` invocations of `verb` on `entity` to fail
    /// with a transport error.
    pub fn fail(&self, verb: &str, entity: EntityType, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(format!("{verb}:{}", entity.as_str()), times);
    }

    /// Pin the canonical id assigned to the next `create`.
    pub fn next_create_id(&self, id: &str) {
        self.state.lock().unwrap().next_create_ids.push(id.to_string());
    }

    /// Simulate a slow link; applied to every gated operation.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = Some(latency);
    }

    /// Records without an `_id` are stored under a synthetic key so tests
    /// can exercise the quarantine path.
    pub fn seed(&self, entity: EntityType, record: Value) {
        let mut state = self.state.lock().unwrap();
        let id = record
            .get("_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("anon-{}", state.calls.len() + 1));
        state
            .collections
            .entry(entity)
            .or_default()
            .insert(id, record);
    }

    pub fn record(&self, entity: EntityType, id: &str) -> Option<Value> {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(&entity)
            .and_then(|c| c.get(id))
            .cloned()
    }

    pub fn record_count(&self, entity: EntityType) -> usize {
        self.state
            .lock()
            .unwrap()
            .collections
            .get(&entity)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Every operation performed, in order, as `verb:entity` strings.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    async fn gate(&self, verb: &str, entity: EntityType) -> Result<(), RemoteError> {
        let (latency, outcome) = {
            let key = format!("{verb}:{}", entity.as_str());
            let mut state = self.state.lock().unwrap();
            state.calls.push(key.clone());
            let outcome = match state.failures.get_mut(&key) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    Err(RemoteError::Transport("scripted failure".to_string()))
                }
                _ => Ok(()),
            };
            (state.latency, outcome)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        outcome
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn resolve_current_identity(&self) -> Result<Option<String>, RemoteError> {
        Ok(self.state.lock().unwrap().identity.clone())
    }

    async fn fetch_all(&self, entity: EntityType, _owner: &str) -> Result<Vec<Value>, RemoteError> {
        self.gate("fetch", entity).await?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .collections
            .get(&entity)
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn create(&self, entity: EntityType, payload: &Value) -> Result<Value, RemoteError> {
        self.gate("create", entity).await?;
        let mut state = self.state.lock().unwrap();
        let id = if state.next_create_ids.is_empty() {
            format!("srv-{}", self.create_seq.fetch_add(1, Ordering::SeqCst) + 1)
        } else {
            state.next_create_ids.remove(0)
        };
        let mut canonical = payload.clone();
        if let Some(map) = canonical.as_object_mut() {
            map.insert("_id".to_string(), Value::String(id.clone()));
            if !map.contains_key("owner_id") {
                if let Some(identity) = &state.identity {
                    map.insert("owner_id".to_string(), Value::String(identity.clone()));
                }
            }
        } else {
            return Err(RemoteError::Payload("create payload must be an object".into()));
        }
        state
            .collections
            .entry(entity)
            .or_default()
            .insert(id, canonical.clone());
        Ok(canonical)
    }

    async fn update(
        &self,
        entity: EntityType,
        id: &str,
        payload: &Value,
    ) -> Result<Value, RemoteError> {
        self.gate("update", entity).await?;
        let mut state = self.state.lock().unwrap();
        let collection = state.collections.entry(entity).or_default();
        let existing = collection.get(id).ok_or(RemoteError::NotFound)?;
        let mut canonical = existing.clone();
        if let (Some(target), Some(changes)) = (canonical.as_object_mut(), payload.as_object()) {
            for (key, value) in changes {
                target.insert(key.clone(), value.clone());
            }
            target.insert("_id".to_string(), Value::String(id.to_string()));
        }
        collection.insert(id.to_string(), canonical.clone());
        Ok(canonical)
    }

    async fn delete(&self, entity: EntityType, id: &str) -> Result<(), RemoteError> {
        self.gate("delete", entity).await?;
        let mut state = self.state.lock().unwrap();
        let collection = state.collections.entry(entity).or_default();
        if collection.remove(id).is_none() {
            return Err(RemoteError::NotFound);
        }
        Ok(())
    }

    async fn send(&self, entity: EntityType, id: &str) -> Result<Value, RemoteError> {
        self.gate("send", entity).await?;
        let mut state = self.state.lock().unwrap();
        let collection = state.collections.entry(entity).or_default();
        let existing = collection.get(id).ok_or(RemoteError::NotFound)?;
        let mut canonical = existing.clone();
        if let Some(map) = canonical.as_object_mut() {
            map.insert("status".to_string(), Value::String("sent".to_string()));
        }
        collection.insert(id.to_string(), canonical.clone());
        Ok(canonical)
    }
}
