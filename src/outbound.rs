use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::entity::{Action, EntityType};
use crate::events::{EventBus, SyncEvent, SyncSource};
use crate::id::is_temp_id;
use crate::ownership::extract_owners;
use crate::queue::{self, QueueItem};
use crate::remote::RemoteApi;
use crate::sanitize::sanitize;
use crate::session::{SyncConfig, SyncSession};
use crate::store::{self, RecordWrite, SyncStatus};
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Result of one drain pass. Cloneable so coalesced callers share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundOutcome {
    /// Nothing was due.
    Idle,
    Completed {
        dispatched: i64,
        retried: i64,
        failed: i64,
    },
    /// The drain itself could not run (local store fault).
    Faulted(String),
}

/// Drains the mutation queue against the remote service. One logical drain
/// at a time; concurrent `run` calls join the in-flight pass.
#[derive(Clone)]
pub struct OutboundSyncEngine {
    pool: SqlitePool,
    remote: Arc<dyn RemoteApi>,
    bus: EventBus,
    config: Arc<SyncConfig>,
    session: SyncSession,
}

impl OutboundSyncEngine {
    pub fn new(
        pool: SqlitePool,
        remote: Arc<dyn RemoteApi>,
        bus: EventBus,
        config: Arc<SyncConfig>,
        session: SyncSession,
    ) -> Self {
        Self {
            pool,
            remote,
            bus,
            config,
            session,
        }
    }

    pub async fn run(&self) -> OutboundOutcome {
        let engine = self.clone();
        let flight = self
            .session
            .outbound
            .run(move || async move { engine.drain().await });
        flight.await
    }

    async fn drain(&self) -> OutboundOutcome {
        let due = match queue::list_due(&self.pool, now_ms()).await {
            Ok(due) => due,
            Err(err) => {
                self.bus.emit(SyncEvent::SyncError {
                    source: SyncSource::Outbound,
                    entity_type: None,
                    message: err.to_string(),
                });
                return OutboundOutcome::Faulted(err.to_string());
            }
        };
        if due.is_empty() {
            return OutboundOutcome::Idle;
        }

        self.bus.emit(SyncEvent::SyncStart {
            source: SyncSource::Outbound,
            pending: due.len() as i64,
        });
        info!(
            target: "ledgerline",
            event = "outbound_drain_start",
            due = due.len()
        );

        let mut dispatched = 0_i64;
        let mut retried = 0_i64;
        let mut failed = 0_i64;

        for snapshot in due {
            // Re-read the item: an earlier dispatch in this pass may have
            // repointed it to a canonical id, or a local-only delete may
            // have cancelled it.
            let item = match queue::get(&self.pool, snapshot.id).await {
                Ok(Some(item)) if !item.failed => item,
                Ok(_) => continue,
                Err(err) => {
                    self.bus.emit(SyncEvent::SyncError {
                        source: SyncSource::Outbound,
                        entity_type: Some(snapshot.entity_type),
                        message: err.to_string(),
                    });
                    return OutboundOutcome::Faulted(err.to_string());
                }
            };

            // Burn the attempt before dispatch so a crash mid-flight still
            // counts toward the retry budget.
            if let Err(err) = queue::mark_attempt(&self.pool, item.id).await {
                self.bus.emit(SyncEvent::SyncError {
                    source: SyncSource::Outbound,
                    entity_type: Some(item.entity_type),
                    message: err.to_string(),
                });
                return OutboundOutcome::Faulted(err.to_string());
            }
            let attempts = item.attempts + 1;

            match self.dispatch(&item).await {
                Ok(()) => {
                    if let Err(err) = queue::remove(&self.pool, item.id).await {
                        warn!(
                            target: "ledgerline",
                            event = "queue_remove_failed",
                            item_id = item.id,
                            error = %err
                        );
                    }
                    dispatched += 1;
                }
                Err(err) => {
                    let message = err.to_string();
                    self.bus.emit(SyncEvent::SyncError {
                        source: SyncSource::Outbound,
                        entity_type: Some(item.entity_type),
                        message: message.clone(),
                    });
                    if attempts >= self.config.max_attempts {
                        if let Err(mark_err) =
                            queue::mark_failed(&self.pool, item.id, &message).await
                        {
                            warn!(
                                target: "ledgerline",
                                event = "queue_mark_failed_error",
                                item_id = item.id,
                                error = %mark_err
                            );
                        }
                        warn!(
                            target: "ledgerline",
                            event = "mutation_terminally_failed",
                            item_id = item.id,
                            entity_type = %item.entity_type.as_str(),
                            action = %item.action.as_str(),
                            attempts,
                            error = %message
                        );
                        failed += 1;
                    } else {
                        let backoff = self.config.backoff_delay_ms(attempts);
                        if let Err(mark_err) =
                            queue::mark_retry(&self.pool, item.id, backoff, &message).await
                        {
                            warn!(
                                target: "ledgerline",
                                event = "queue_mark_retry_error",
                                item_id = item.id,
                                error = %mark_err
                            );
                        }
                        retried += 1;
                    }
                }
            }
        }

        self.bus.emit(SyncEvent::SyncFinished {
            source: SyncSource::Outbound,
            applied: dispatched,
            failed,
        });
        info!(
            target: "ledgerline",
            event = "outbound_drain_finished",
            dispatched,
            retried,
            failed
        );
        OutboundOutcome::Completed {
            dispatched,
            retried,
            failed,
        }
    }

    /// Entity/action routing. Success means the mutation is settled from
    /// the queue's point of view; the canonical response (when there is
    /// one) is already persisted.
    async fn dispatch(&self, item: &QueueItem) -> AppResult<()> {
        match (item.entity_type, item.action) {
            (entity, Action::Create) => self.dispatch_create(entity, item).await,
            (entity, Action::Update) => self.dispatch_update(entity, item).await,
            (entity, Action::Delete) => self.dispatch_delete(entity, item).await,
            (EntityType::Invoice | EntityType::WithdrawalRequest, Action::Send) => {
                self.dispatch_send(item.entity_type, item).await
            }
            (entity, Action::Send) => {
                // enqueue() rejects these; a row like this means the queue
                // was edited out-of-band. Settle it rather than retry forever.
                warn!(
                    target: "ledgerline",
                    event = "unsupported_queue_item_dropped",
                    entity_type = %entity.as_str(),
                    action = %item.action.as_str(),
                    item_id = item.id
                );
                Ok(())
            }
        }
    }

    async fn dispatch_create(&self, entity: EntityType, item: &QueueItem) -> AppResult<()> {
        let canonical = self
            .remote
            .create(entity, &item.payload)
            .await
            .map_err(AppError::from)?;
        let (clean, _) = sanitize(&canonical);
        let external_id = store::external_id_of(&clean)
            .map(str::to_string)
            .ok_or_else(|| {
                AppError::new("SYNC/MISSING_CANONICAL_ID", "Create response carries no _id")
                    .with_context("entity_type", entity.as_str())
            })?;

        // Follow-up mutations queued against the temp id now target the
        // canonical record.
        queue::repoint_entity(&self.pool, entity, &item.entity_id, &external_id).await?;
        let still_pending =
            queue::has_pending_for(&self.pool, entity, &external_id, Some(item.id)).await?;

        let owners = extract_owners(entity, &clean);
        store::replace_external_id(
            &self.pool,
            entity,
            &item.entity_id,
            RecordWrite {
                external_id: external_id.clone(),
                owner_id: single_owner(entity, &owners),
                member_ids: member_owners(entity, owners),
                sync_status: if still_pending {
                    SyncStatus::Pending
                } else {
                    SyncStatus::Synced
                },
                data: clean,
            },
        )
        .await?;
        info!(
            target: "ledgerline",
            event = "create_confirmed",
            entity_type = %entity.as_str(),
            temp_id = %item.entity_id,
            external_id = %external_id
        );
        Ok(())
    }

    async fn dispatch_update(&self, entity: EntityType, item: &QueueItem) -> AppResult<()> {
        if is_temp_id(&item.entity_id) {
            // The create for this record never reached the remote (it was
            // cancelled or terminally failed); there is nothing to update.
            warn!(
                target: "ledgerline",
                event = "update_without_remote_linkage",
                entity_type = %entity.as_str(),
                entity_id = %item.entity_id
            );
            return Ok(());
        }
        match self.remote.update(entity, &item.entity_id, &item.payload).await {
            Ok(canonical) => self.persist_canonical(entity, item, &canonical).await,
            Err(err) if err.is_not_found() => {
                info!(
                    target: "ledgerline",
                    event = "update_target_gone",
                    entity_type = %entity.as_str(),
                    entity_id = %item.entity_id
                );
                Ok(())
            }
            Err(err) => Err(AppError::from(err)),
        }
    }

    async fn dispatch_delete(&self, entity: EntityType, item: &QueueItem) -> AppResult<()> {
        if is_temp_id(&item.entity_id) {
            // No remote linkage; resolve locally only.
            store::delete(&self.pool, entity, &item.entity_id).await?;
            return Ok(());
        }
        match self.remote.delete(entity, &item.entity_id).await {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                info!(
                    target: "ledgerline",
                    event = "delete_target_gone",
                    entity_type = %entity.as_str(),
                    entity_id = %item.entity_id
                );
            }
            Err(err) => return Err(AppError::from(err)),
        }
        store::delete(&self.pool, entity, &item.entity_id).await
    }

    async fn dispatch_send(&self, entity: EntityType, item: &QueueItem) -> AppResult<()> {
        if is_temp_id(&item.entity_id) {
            warn!(
                target: "ledgerline",
                event = "send_without_remote_linkage",
                entity_type = %entity.as_str(),
                entity_id = %item.entity_id
            );
            return Ok(());
        }
        match self.remote.send(entity, &item.entity_id).await {
            Ok(canonical) => self.persist_canonical(entity, item, &canonical).await,
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(AppError::from(err)),
        }
    }

    /// Persist a canonical response after a confirmed mutation. The write
    /// is unconditional: this mutation is the one the pending flag was
    /// protecting, so it may overwrite. Remaining queued mutations for the
    /// same record keep it pending.
    async fn persist_canonical(
        &self,
        entity: EntityType,
        item: &QueueItem,
        canonical: &serde_json::Value,
    ) -> AppResult<()> {
        let (clean, _) = sanitize(canonical);
        let external_id = store::external_id_of(&clean)
            .map(str::to_string)
            .unwrap_or_else(|| item.entity_id.clone());
        let still_pending =
            queue::has_pending_for(&self.pool, entity, &external_id, Some(item.id)).await?;
        let owners = extract_owners(entity, &clean);
        store::upsert(
            &self.pool,
            entity,
            RecordWrite {
                external_id,
                owner_id: single_owner(entity, &owners),
                member_ids: member_owners(entity, owners),
                sync_status: if still_pending {
                    SyncStatus::Pending
                } else {
                    SyncStatus::Synced
                },
                data: clean,
            },
        )
        .await
    }
}

fn single_owner(entity: EntityType, owners: &[String]) -> Option<String> {
    match entity.owner_shape() {
        crate::entity::OwnerShape::Single => owners.first().cloned(),
        crate::entity::OwnerShape::Members => None,
    }
}

fn member_owners(entity: EntityType, owners: Vec<String>) -> Vec<String> {
    match entity.owner_shape() {
        crate::entity::OwnerShape::Single => Vec::new(),
        crate::entity::OwnerShape::Members => owners,
    }
}
