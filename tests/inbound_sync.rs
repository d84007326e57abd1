use std::sync::Arc;

use anyhow::Result;
use ledgerline::identity::StoreHandle;
use ledgerline::inbound::SkipReason;
use ledgerline::remote::memory::MemoryRemote;
use ledgerline::store::{self, RecordWrite, SyncStatus};
use ledgerline::{
    Action, EntityType, InboundOutcome, SyncConfig, SyncEvent, SyncService, SyncSource,
};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

fn test_config() -> SyncConfig {
    SyncConfig {
        auto_flush: false,
        min_full_sync_interval_ms: 0,
        prompt_timeout_ms: 200,
        ..SyncConfig::default()
    }
}

async fn memory_service_with(
    remote: Arc<MemoryRemote>,
    config: SyncConfig,
) -> Result<SyncService> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    ledgerline::migrate::apply_migrations(&pool).await?;
    Ok(SyncService::new(
        pool,
        remote,
        StoreHandle::in_memory(),
        config,
    ))
}

async fn memory_service(remote: Arc<MemoryRemote>) -> Result<SyncService> {
    memory_service_with(remote, test_config()).await
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn pull_upserts_by_external_id() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.seed(
        EntityType::Invoice,
        json!({"_id": "srv-1", "amount": 10, "owner_id": "alice"}),
    );
    let service = memory_service(remote.clone()).await?;

    // Stale cached copy with a different surrogate-independent shape.
    store::upsert(
        service.pool(),
        EntityType::Invoice,
        RecordWrite {
            external_id: "srv-1".to_string(),
            owner_id: Some("alice".to_string()),
            member_ids: Vec::new(),
            sync_status: SyncStatus::Synced,
            data: json!({"_id": "srv-1", "amount": 3, "owner_id": "alice"}),
        },
    )
    .await?;

    let outcome = service.run_inbound_sync().await;
    assert!(matches!(outcome, InboundOutcome::Completed { applied: 1, .. }));

    let record = store::get(service.pool(), EntityType::Invoice, "srv-1")
        .await?
        .expect("record");
    assert_eq!(record.data["amount"], json!(10));
    assert_eq!(store::count(service.pool(), EntityType::Invoice).await?, 1);
    Ok(())
}

#[tokio::test]
async fn foreign_records_are_excluded() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.seed(
        EntityType::Invoice,
        json!({"_id": "srv-1", "amount": 10, "owner_id": "alice"}),
    );
    remote.seed(
        EntityType::Invoice,
        json!({"_id": "srv-2", "amount": 20, "owner_id": "bob"}),
    );
    remote.seed(EntityType::Invoice, json!({"_id": "srv-3", "amount": 30}));
    remote.seed(
        EntityType::Customer,
        json!({"_id": "cus-1", "name": "Acme", "member_ids": ["bob", "carol"]}),
    );
    let service = memory_service(remote).await?;

    service.run_inbound_sync().await;

    assert!(store::get(service.pool(), EntityType::Invoice, "srv-1")
        .await?
        .is_some());
    // Populated owner fields, none matching alice: never cached.
    assert!(store::get(service.pool(), EntityType::Invoice, "srv-2")
        .await?
        .is_none());
    // Ownerless records pass through.
    assert!(store::get(service.pool(), EntityType::Invoice, "srv-3")
        .await?
        .is_some());
    assert!(store::get(service.pool(), EntityType::Customer, "cus-1")
        .await?
        .is_none());
    Ok(())
}

#[tokio::test]
async fn one_failed_fetch_group_does_not_abort_the_rest() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.seed(
        EntityType::Invoice,
        json!({"_id": "srv-1", "amount": 10, "owner_id": "alice"}),
    );
    remote.seed(
        EntityType::Customer,
        json!({"_id": "cus-1", "name": "Acme", "member_ids": ["alice"]}),
    );
    remote.fail("fetch", EntityType::WorkRecord, 1);
    let service = memory_service(remote).await?;
    let mut rx = service.subscribe();

    match service.run_inbound_sync().await {
        InboundOutcome::Completed {
            applied,
            failed_groups,
            ..
        } => {
            assert_eq!(applied, 2);
            assert_eq!(failed_groups, 1);
        }
        other => panic!("expected completion, got {other:?}"),
    }

    assert!(store::get(service.pool(), EntityType::Invoice, "srv-1")
        .await?
        .is_some());
    assert!(store::get(service.pool(), EntityType::Customer, "cus-1")
        .await?
        .is_some());

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::SyncError {
            source: SyncSource::Inbound,
            entity_type: Some(EntityType::WorkRecord),
            ..
        }
    )));
    Ok(())
}

#[tokio::test]
async fn pending_records_survive_the_pull() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.seed(
        EntityType::Invoice,
        json!({"_id": "srv-1", "amount": 99, "owner_id": "alice"}),
    );
    // The flush inside the pull fails, so the local edit stays queued.
    remote.fail("update", EntityType::Invoice, 1);
    let service = memory_service(remote).await?;

    store::upsert(
        service.pool(),
        EntityType::Invoice,
        RecordWrite {
            external_id: "srv-1".to_string(),
            owner_id: Some("alice".to_string()),
            member_ids: Vec::new(),
            sync_status: SyncStatus::Synced,
            data: json!({"_id": "srv-1", "amount": 10, "owner_id": "alice"}),
        },
    )
    .await?;
    service
        .enqueue(
            EntityType::Invoice,
            Action::Update,
            Some("srv-1"),
            json!({"_id": "srv-1", "amount": 20, "owner_id": "alice"}),
            None,
        )
        .await?;

    service.run_inbound_sync().await;

    let record = store::get(service.pool(), EntityType::Invoice, "srv-1")
        .await?
        .expect("record");
    assert_eq!(record.sync_status, SyncStatus::Pending);
    assert_eq!(record.data["amount"], json!(20), "pull must not clobber the pending edit");
    Ok(())
}

#[tokio::test]
async fn records_without_an_id_are_quarantined() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.seed(EntityType::Invoice, json!({"amount": 44, "owner_id": "alice"}));
    let service = memory_service(remote).await?;

    let outcome = service.run_inbound_sync().await;
    assert!(matches!(
        outcome,
        InboundOutcome::Completed { quarantined: 1, .. }
    ));
    assert_eq!(store::count(service.pool(), EntityType::Invoice).await?, 0);
    assert_eq!(store::quarantine_count(service.pool()).await?, 1);
    Ok(())
}

#[tokio::test]
async fn second_pull_inside_the_interval_is_skipped() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    let service = memory_service_with(
        remote,
        SyncConfig {
            auto_flush: false,
            prompt_timeout_ms: 200,
            ..SyncConfig::default()
        },
    )
    .await?;

    assert!(matches!(
        service.run_inbound_sync().await,
        InboundOutcome::Completed { .. }
    ));
    assert_eq!(
        service.run_inbound_sync().await,
        InboundOutcome::Skipped(SkipReason::RateLimited)
    );
    Ok(())
}

#[tokio::test]
async fn signed_out_pull_is_skipped() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(None));
    let service = memory_service(remote).await?;
    assert_eq!(
        service.run_inbound_sync().await,
        InboundOutcome::Skipped(SkipReason::NoIdentity)
    );
    Ok(())
}

#[tokio::test]
async fn completion_emits_finished_then_refreshed() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.seed(
        EntityType::Invoice,
        json!({"_id": "srv-1", "amount": 10, "owner_id": "alice"}),
    );
    let service = memory_service(remote).await?;
    let mut rx = service.subscribe();

    service.run_inbound_sync().await;

    let events = drain_events(&mut rx);
    let finished = events.iter().position(|e| {
        matches!(
            e,
            SyncEvent::SyncFinished {
                source: SyncSource::Inbound,
                ..
            }
        )
    });
    let refreshed = events
        .iter()
        .position(|e| matches!(e, SyncEvent::DataRefreshed));
    assert!(finished.is_some());
    assert!(refreshed.is_some());
    assert!(finished < refreshed, "sync:finished precedes data:refreshed");
    Ok(())
}
