use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::entity::EntityType;
use crate::events::{ClearDecision, ClearReason, EventBus, SyncEvent, SyncSource};
use crate::identity::StoreHandle;
use crate::outbound::OutboundSyncEngine;
use crate::ownership::{self, extract_owners, is_foreign};
use crate::queue;
use crate::remote::RemoteApi;
use crate::sanitize::sanitize;
use crate::session::{SyncConfig, SyncSession};
use crate::store::{self, RecordWrite, SyncStatus};
use crate::time::now_ms;
use crate::AppResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A full pull ran more recently than the configured interval.
    RateLimited,
    /// Nobody is signed in; there is nothing to reconcile against.
    NoIdentity,
}

/// Result of one full pull. Cloneable so coalesced callers share it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    Skipped(SkipReason),
    /// The ownership guard aborted the run; the cache is untouched.
    Cancelled,
    Completed {
        applied: i64,
        skipped: i64,
        quarantined: i64,
        failed_groups: i64,
    },
    Faulted(String),
}

/// Full pull-and-reconcile from the remote service into the local store.
#[derive(Clone)]
pub struct InboundSyncEngine {
    pool: SqlitePool,
    remote: Arc<dyn RemoteApi>,
    bus: EventBus,
    config: Arc<SyncConfig>,
    session: SyncSession,
    marker: StoreHandle,
    outbound: OutboundSyncEngine,
}

impl InboundSyncEngine {
    pub fn new(
        pool: SqlitePool,
        remote: Arc<dyn RemoteApi>,
        bus: EventBus,
        config: Arc<SyncConfig>,
        session: SyncSession,
        marker: StoreHandle,
        outbound: OutboundSyncEngine,
    ) -> Self {
        Self {
            pool,
            remote,
            bus,
            config,
            session,
            marker,
            outbound,
        }
    }

    pub async fn run(&self) -> InboundOutcome {
        if let Some(last) = self.session.last_full_sync_at() {
            if now_ms() - last < self.config.min_full_sync_interval_ms {
                debug!(target: "ledgerline", event = "inbound_rate_limited", last_full_sync_at = last);
                return InboundOutcome::Skipped(SkipReason::RateLimited);
            }
        }
        let engine = self.clone();
        let flight = self
            .session
            .inbound
            .run(move || async move { engine.pull().await });
        flight.await
    }

    async fn pull(&self) -> InboundOutcome {
        let identity = match self.remote.resolve_current_identity().await {
            Ok(Some(identity)) => identity,
            Ok(None) => {
                info!(target: "ledgerline", event = "inbound_skipped_signed_out");
                return InboundOutcome::Skipped(SkipReason::NoIdentity);
            }
            Err(err) => {
                self.bus.emit(SyncEvent::SyncError {
                    source: SyncSource::Inbound,
                    entity_type: None,
                    message: err.to_string(),
                });
                return InboundOutcome::Faulted(err.to_string());
            }
        };

        match self.resolve_ownership(&identity).await {
            Ok(true) => {}
            Ok(false) => return InboundOutcome::Cancelled,
            Err(err) => {
                self.bus.emit(SyncEvent::SyncError {
                    source: SyncSource::Inbound,
                    entity_type: None,
                    message: err.to_string(),
                });
                return InboundOutcome::Faulted(err.to_string());
            }
        }

        // Give pending local changes a chance to resolve before the pull;
        // whatever is still pending afterwards stays protected.
        self.outbound.run().await;

        self.bus.emit(SyncEvent::SyncStart {
            source: SyncSource::Inbound,
            pending: 0,
        });

        let mut applied = 0_i64;
        let mut skipped = 0_i64;
        let mut quarantined = 0_i64;
        let mut failed_groups = 0_i64;

        for entity in EntityType::ALL {
            let records = match self.remote.fetch_all(*entity, &identity).await {
                Ok(records) => records,
                Err(err) => {
                    // One failed fetch group never aborts the others.
                    failed_groups += 1;
                    warn!(
                        target: "ledgerline",
                        event = "fetch_group_failed",
                        entity_type = %entity.as_str(),
                        error = %err
                    );
                    self.bus.emit(SyncEvent::SyncError {
                        source: SyncSource::Inbound,
                        entity_type: Some(*entity),
                        message: err.to_string(),
                    });
                    continue;
                }
            };

            for record in records {
                match self.reconcile_record(*entity, &identity, &record).await {
                    Ok(RecordFate::Applied) => applied += 1,
                    Ok(RecordFate::Skipped) => skipped += 1,
                    Ok(RecordFate::Quarantined) => quarantined += 1,
                    Err(err) => {
                        // Store faults on one record degrade to a placeholder
                        // rather than poisoning the batch.
                        quarantined += 1;
                        let external_id = store::external_id_of(&record).map(str::to_string);
                        warn!(
                            target: "ledgerline",
                            event = "record_reconcile_failed",
                            entity_type = %entity.as_str(),
                            external_id = %external_id.as_deref().unwrap_or("?"),
                            error = %err
                        );
                        if let Some(external_id) = external_id {
                            let _ =
                                store::write_placeholder(&self.pool, *entity, &external_id).await;
                            let _ = store::quarantine(
                                &self.pool,
                                *entity,
                                Some(&external_id),
                                "upsert_failed",
                                &record,
                            )
                            .await;
                        }
                    }
                }
            }
        }

        self.session.record_full_sync(now_ms());
        self.marker.record_identity(&identity);

        self.bus.emit(SyncEvent::SyncFinished {
            source: SyncSource::Inbound,
            applied,
            failed: failed_groups,
        });
        self.bus.emit(SyncEvent::DataRefreshed);
        info!(
            target: "ledgerline",
            event = "inbound_pull_finished",
            applied,
            skipped,
            quarantined,
            failed_groups
        );

        InboundOutcome::Completed {
            applied,
            skipped,
            quarantined,
            failed_groups,
        }
    }

    /// Detect stale or foreign local data and resolve it. Returns false
    /// when the run must abort (cancel decision).
    async fn resolve_ownership(&self, identity: &str) -> AppResult<bool> {
        let marker = self.marker.current_identity();
        let switched = marker.as_deref().is_some_and(|m| m != identity);
        let residue = ownership::has_foreign_residue(&self.pool, identity).await?;
        if !switched && !residue {
            return Ok(true);
        }

        let reason = if switched {
            ClearReason::IdentitySwitch
        } else {
            ClearReason::ForeignResidue
        };
        let pending = queue::pending_count(&self.pool).await?;
        info!(
            target: "ledgerline",
            event = "ownership_conflict",
            reason = ?reason,
            pending,
            previous = %marker.as_deref().unwrap_or(""),
            current = %identity
        );

        if pending == 0 {
            // Nothing to lose; no prompt needed.
            self.clear_local_data().await?;
            self.marker.record_identity(identity);
            return Ok(true);
        }

        let decision = self
            .bus
            .request_clear_decision(
                reason,
                pending,
                Duration::from_millis(self.config.prompt_timeout_ms),
            )
            .await
            .unwrap_or(match reason {
                ClearReason::IdentitySwitch => ClearDecision::Cancel,
                ClearReason::ForeignResidue => ClearDecision::Sync,
            });

        match decision {
            ClearDecision::Cancel => {
                info!(target: "ledgerline", event = "ownership_conflict_cancelled");
                Ok(false)
            }
            ClearDecision::Sync => {
                self.outbound.run().await;
                self.clear_local_data().await?;
                self.marker.record_identity(identity);
                Ok(true)
            }
            ClearDecision::Clear => {
                self.clear_local_data().await?;
                self.marker.record_identity(identity);
                Ok(true)
            }
        }
    }

    async fn clear_local_data(&self) -> AppResult<()> {
        store::clear_all_entities(&self.pool).await?;
        queue::clear_all(&self.pool).await?;
        self.bus.emit(SyncEvent::SyncCleared);
        info!(target: "ledgerline", event = "local_data_cleared");
        Ok(())
    }

    async fn reconcile_record(
        &self,
        entity: EntityType,
        identity: &str,
        record: &serde_json::Value,
    ) -> AppResult<RecordFate> {
        let (clean, report) = sanitize(record);

        let Some(external_id) = store::external_id_of(&clean).map(str::to_string) else {
            store::quarantine(&self.pool, entity, None, "missing_id", record).await?;
            return Ok(RecordFate::Quarantined);
        };

        if !report.is_clean() {
            // The pruned projection is still usable; keep the original
            // around for inspection.
            store::quarantine(
                &self.pool,
                entity,
                Some(&external_id),
                "sanitize_dropped_leaves",
                record,
            )
            .await?;
        }

        let owners = extract_owners(entity, &clean);
        if is_foreign(&owners, identity) {
            debug!(
                target: "ledgerline",
                event = "inbound_record_foreign",
                entity_type = %entity.as_str(),
                external_id = %external_id
            );
            return Ok(RecordFate::Skipped);
        }

        let applied = store::upsert_unless_pending(
            &self.pool,
            entity,
            RecordWrite {
                external_id: external_id.clone(),
                owner_id: match entity.owner_shape() {
                    crate::entity::OwnerShape::Single => owners.first().cloned(),
                    crate::entity::OwnerShape::Members => None,
                },
                member_ids: match entity.owner_shape() {
                    crate::entity::OwnerShape::Single => Vec::new(),
                    crate::entity::OwnerShape::Members => owners,
                },
                sync_status: SyncStatus::Synced,
                data: clean,
            },
        )
        .await?;

        if applied {
            Ok(RecordFate::Applied)
        } else {
            debug!(
                target: "ledgerline",
                event = "inbound_record_pending_protected",
                entity_type = %entity.as_str(),
                external_id = %external_id
            );
            Ok(RecordFate::Skipped)
        }
    }
}

enum RecordFate {
    Applied,
    Skipped,
    Quarantined,
}
