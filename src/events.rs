use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};
use ts_rs::TS;

use crate::entity::EntityType;

/// Answer to the clear-local-data prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ClearDecision {
    /// Discard the local cache (and queue) and continue.
    Clear,
    /// Flush the mutation queue first, then clear and continue.
    Sync,
    /// Abort the sync run, leave everything untouched.
    Cancel,
}

/// Why the engine is asking before touching the local cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum ClearReason {
    IdentitySwitch,
    ForeignResidue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum SyncSource {
    Outbound,
    Inbound,
}

/// Lifecycle notifications published on the bus. Tag values match the
/// channel names the client listens on.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(tag = "type")]
#[ts(export, export_to = "bindings/")]
pub enum SyncEvent {
    #[serde(rename = "sync:start")]
    SyncStart {
        source: SyncSource,
        #[ts(type = "number")]
        pending: i64,
    },
    #[serde(rename = "sync:finished")]
    SyncFinished {
        source: SyncSource,
        #[ts(type = "number")]
        applied: i64,
        #[ts(type = "number")]
        failed: i64,
    },
    #[serde(rename = "sync:error")]
    SyncError {
        source: SyncSource,
        #[ts(optional)]
        entity_type: Option<EntityType>,
        message: String,
    },
    #[serde(rename = "sync:cleared")]
    SyncCleared,
    #[serde(rename = "data:refreshed")]
    DataRefreshed,
    #[serde(rename = "confirm:clear-local-data")]
    ConfirmClearLocalData {
        reason: ClearReason,
        #[ts(type = "number")]
        pending: i64,
    },
}

/// Process-wide publish/subscribe channel plus the one-shot confirmation
/// exchange. Cheap to clone; all clones share the same channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
    prompt: Arc<Mutex<Option<oneshot::Sender<ClearDecision>>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            tx,
            prompt: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    /// Best-effort publish; an absent or lagging subscriber is not an error.
    pub fn emit(&self, event: SyncEvent) {
        debug!(target: "ledgerline", event = "bus_emit", payload = ?event);
        let _ = self.tx.send(event);
    }

    /// Publish `confirm:clear-local-data` and wait (bounded) for a
    /// subscriber to answer through [`EventBus::respond_clear`]. `None`
    /// means nobody answered in time; the caller applies its fallback.
    pub async fn request_clear_decision(
        &self,
        reason: ClearReason,
        pending: i64,
        wait: Duration,
    ) -> Option<ClearDecision> {
        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.prompt.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                warn!(
                    target: "ledgerline",
                    event = "clear_prompt_already_outstanding"
                );
                return None;
            }
            *slot = Some(tx);
        }

        self.emit(SyncEvent::ConfirmClearLocalData { reason, pending });

        let decision = match tokio::time::timeout(wait, rx).await {
            Ok(Ok(decision)) => Some(decision),
            Ok(Err(_)) | Err(_) => None,
        };

        // Drop a sender left behind by a timeout so a late answer is a no-op.
        self.prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if decision.is_none() {
            warn!(
                target: "ledgerline",
                event = "clear_prompt_unanswered",
                reason = ?reason
            );
        }
        decision
    }

    /// Resolve an outstanding clear prompt. Returns false when no prompt
    /// is waiting (already answered, timed out, or never asked).
    pub fn respond_clear(&self, decision: ClearDecision) -> bool {
        let sender = self
            .prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn prompt_outstanding(&self) -> bool {
        self.prompt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
