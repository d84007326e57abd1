use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::entity::{ensure_supported, Action, EntityType};
use crate::events::{ClearDecision, EventBus, SyncEvent};
use crate::id::{is_temp_id, new_temp_id};
use crate::identity::StoreHandle;
use crate::inbound::{InboundOutcome, InboundSyncEngine};
use crate::outbound::{OutboundOutcome, OutboundSyncEngine};
use crate::ownership::extract_owners;
use crate::queue::{self, QueueItem};
use crate::remote::RemoteApi;
use crate::sanitize::sanitize;
use crate::session::{SyncConfig, SyncSession};
use crate::store::{self, RecordWrite, SyncStatus};
use crate::{AppError, AppResult};

/// Facade over the reconciliation engine: local-first mutations in, sync
/// triggers and lifecycle events out. Clones share all state.
#[derive(Clone)]
pub struct SyncService {
    pool: SqlitePool,
    bus: EventBus,
    config: Arc<SyncConfig>,
    session: SyncSession,
    outbound: OutboundSyncEngine,
    inbound: InboundSyncEngine,
}

impl SyncService {
    pub fn new(
        pool: SqlitePool,
        remote: Arc<dyn RemoteApi>,
        marker: StoreHandle,
        config: SyncConfig,
    ) -> Self {
        let bus = EventBus::new();
        let config = Arc::new(config);
        let session = SyncSession::new();
        let outbound = OutboundSyncEngine::new(
            pool.clone(),
            remote.clone(),
            bus.clone(),
            config.clone(),
            session.clone(),
        );
        let inbound = InboundSyncEngine::new(
            pool.clone(),
            remote,
            bus.clone(),
            config.clone(),
            session.clone(),
            marker,
            outbound.clone(),
        );
        Self {
            pool,
            bus,
            config,
            session,
            outbound,
            inbound,
        }
    }

    /// Open (or create) the database at `db_path`, run migrations, and
    /// build a service on top of it.
    pub async fn open(
        db_path: &Path,
        remote: Arc<dyn RemoteApi>,
        marker: StoreHandle,
        config: SyncConfig,
    ) -> anyhow::Result<Self> {
        let pool = crate::db::open_sqlite_pool(db_path).await?;
        crate::migrate::apply_migrations(&pool).await?;
        Ok(Self::new(pool, remote, marker, config))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.bus.subscribe()
    }

    pub fn is_syncing(&self) -> bool {
        self.session.is_syncing()
    }

    /// Queue a local mutation for later dispatch and apply it to the local
    /// cache immediately. Returns the identifier the caller should use to
    /// address the record from now on (for `Create`, the temp id until the
    /// remote confirms). Remote failures never surface here; they are the
    /// outbound engine's business.
    pub async fn enqueue(
        &self,
        entity: EntityType,
        action: Action,
        entity_id: Option<&str>,
        payload: Value,
        temp_id: Option<String>,
    ) -> AppResult<String> {
        ensure_supported(entity, action)?;
        let (clean, report) = sanitize(&payload);
        if !report.is_clean() {
            warn!(
                target: "ledgerline",
                event = "enqueue_payload_pruned",
                entity_type = %entity.as_str(),
                dropped = report.dropped.len()
            );
        }

        let id = match action {
            Action::Create => {
                let temp = temp_id.unwrap_or_else(new_temp_id);
                let mut data = clean;
                if let Some(map) = data.as_object_mut() {
                    map.insert("_id".to_string(), Value::String(temp.clone()));
                } else {
                    return Err(AppError::new(
                        "QUEUE/INVALID_PAYLOAD",
                        "Create payloads must be JSON objects",
                    )
                    .with_context("entity_type", entity.as_str()));
                }
                let owners = extract_owners(entity, &data);
                store::insert(
                    &self.pool,
                    entity,
                    RecordWrite {
                        external_id: temp.clone(),
                        owner_id: match entity.owner_shape() {
                            crate::entity::OwnerShape::Single => owners.first().cloned(),
                            crate::entity::OwnerShape::Members => None,
                        },
                        member_ids: match entity.owner_shape() {
                            crate::entity::OwnerShape::Single => Vec::new(),
                            crate::entity::OwnerShape::Members => owners,
                        },
                        sync_status: SyncStatus::Pending,
                        data: data.clone(),
                    },
                )
                .await?;
                queue::enqueue(&self.pool, entity, Action::Create, &temp, &data).await?;
                temp
            }
            Action::Update => {
                let id = require_entity_id(entity_id)?;
                store::update_data(&self.pool, entity, &id, &clean, SyncStatus::Pending).await?;
                queue::enqueue(&self.pool, entity, Action::Update, &id, &clean).await?;
                id
            }
            Action::Delete => {
                let id = require_entity_id(entity_id)?;
                if is_temp_id(&id) {
                    // The create never reached the remote; cancel the whole
                    // lineage locally and skip the remote round-trip.
                    let removed = queue::remove_for_entity(&self.pool, entity, &id).await?;
                    store::delete(&self.pool, entity, &id).await?;
                    info!(
                        target: "ledgerline",
                        event = "local_only_delete",
                        entity_type = %entity.as_str(),
                        entity_id = %id,
                        cancelled_mutations = removed
                    );
                    return Ok(id);
                }
                store::delete(&self.pool, entity, &id).await?;
                queue::enqueue(&self.pool, entity, Action::Delete, &id, &clean).await?;
                id
            }
            Action::Send => {
                let id = require_entity_id(entity_id)?;
                store::set_sync_status(&self.pool, entity, &id, SyncStatus::Pending).await?;
                queue::enqueue(&self.pool, entity, Action::Send, &id, &clean).await?;
                id
            }
        };

        if self.config.auto_flush {
            let engine = self.outbound.clone();
            tokio::spawn(async move {
                engine.run().await;
            });
        }

        Ok(id)
    }

    /// Explicit outbound trigger; redundant calls join the in-flight drain.
    pub async fn run_outbound_sync(&self) -> OutboundOutcome {
        self.outbound.run().await
    }

    /// Explicit inbound trigger; redundant calls join the in-flight pull.
    pub async fn run_inbound_sync(&self) -> InboundOutcome {
        self.inbound.run().await
    }

    /// Resolve an outstanding clear-local-data prompt. Returns false when
    /// no prompt is waiting.
    pub fn respond_to_clear_prompt(&self, decision: ClearDecision) -> bool {
        self.bus.respond_clear(decision)
    }

    pub async fn list_failed_mutations(&self) -> AppResult<Vec<QueueItem>> {
        queue::list_failed(&self.pool).await
    }

    pub async fn clear_failed_mutations(&self) -> AppResult<()> {
        queue::clear_failed(&self.pool).await
    }

    pub async fn clear_all_mutations(&self) -> AppResult<()> {
        queue::clear_all(&self.pool).await
    }
}

fn require_entity_id(entity_id: Option<&str>) -> AppResult<String> {
    entity_id
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            AppError::new(
                "QUEUE/MISSING_ID",
                "This action requires the target entity identifier",
            )
        })
}
