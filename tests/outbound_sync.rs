use std::sync::Arc;

use anyhow::Result;
use ledgerline::identity::StoreHandle;
use ledgerline::remote::memory::MemoryRemote;
use ledgerline::store::{self, SyncStatus};
use ledgerline::{queue, Action, EntityType, OutboundOutcome, SyncConfig, SyncService};
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

async fn memory_service(remote: Arc<MemoryRemote>) -> Result<SyncService> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    ledgerline::migrate::apply_migrations(&pool).await?;
    Ok(SyncService::new(
        pool,
        remote,
        StoreHandle::in_memory(),
        test_config(),
    ))
}

#[tokio::test]
async fn create_replaces_temp_with_canonical() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.next_create_id("srv-9");
    let service = memory_service(remote.clone()).await?;

    let id = service
        .enqueue(
            EntityType::Invoice,
            Action::Create,
            None,
            json!({"amount": 1450, "owner_id": "alice"}),
            Some("tmp-1".to_string()),
        )
        .await?;
    assert_eq!(id, "tmp-1");

    // Local-first: the temp record is readable and pending before dispatch.
    let temp = store::get(service.pool(), EntityType::Invoice, "tmp-1")
        .await?
        .expect("temp record");
    assert_eq!(temp.sync_status, SyncStatus::Pending);

    let outcome = service.run_outbound_sync().await;
    assert_eq!(
        outcome,
        OutboundOutcome::Completed {
            dispatched: 1,
            retried: 0,
            failed: 0
        }
    );

    assert!(store::get(service.pool(), EntityType::Invoice, "tmp-1")
        .await?
        .is_none());
    let canonical = store::get(service.pool(), EntityType::Invoice, "srv-9")
        .await?
        .expect("canonical record");
    assert_eq!(canonical.sync_status, SyncStatus::Synced);
    assert_eq!(canonical.data["amount"], json!(1450));
    assert_eq!(store::count(service.pool(), EntityType::Invoice).await?, 1);
    assert_eq!(queue::pending_count(service.pool()).await?, 0);
    assert!(remote.record(EntityType::Invoice, "srv-9").is_some());
    Ok(())
}

#[tokio::test]
async fn delete_of_unknown_remote_id_converges() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    let service = memory_service(remote.clone()).await?;

    service
        .enqueue(
            EntityType::Invoice,
            Action::Delete,
            Some("srv-404"),
            json!({}),
            None,
        )
        .await?;
    let outcome = service.run_outbound_sync().await;

    assert_eq!(
        outcome,
        OutboundOutcome::Completed {
            dispatched: 1,
            retried: 0,
            failed: 0
        }
    );
    assert_eq!(queue::pending_count(service.pool()).await?, 0);
    Ok(())
}

#[tokio::test]
async fn local_only_delete_cancels_pending_create() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    let service = memory_service(remote.clone()).await?;

    let temp = service
        .enqueue(
            EntityType::WorkRecord,
            Action::Create,
            None,
            json!({"title": "callout", "owner_id": "alice"}),
            None,
        )
        .await?;
    service
        .enqueue(
            EntityType::WorkRecord,
            Action::Delete,
            Some(&temp),
            json!({}),
            None,
        )
        .await?;

    // Both the create and the delete are settled without the remote.
    assert_eq!(queue::pending_count(service.pool()).await?, 0);
    assert!(store::get(service.pool(), EntityType::WorkRecord, &temp)
        .await?
        .is_none());
    assert_eq!(service.run_outbound_sync().await, OutboundOutcome::Idle);
    assert!(remote.calls().is_empty());
    Ok(())
}

#[tokio::test]
async fn queued_updates_follow_the_canonical_id() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.next_create_id("srv-3");
    let service = memory_service(remote.clone()).await?;

    let temp = service
        .enqueue(
            EntityType::Invoice,
            Action::Create,
            None,
            json!({"amount": 100, "owner_id": "alice"}),
            None,
        )
        .await?;
    service
        .enqueue(
            EntityType::Invoice,
            Action::Update,
            Some(&temp),
            json!({"amount": 180}),
            None,
        )
        .await?;

    let outcome = service.run_outbound_sync().await;
    assert_eq!(
        outcome,
        OutboundOutcome::Completed {
            dispatched: 2,
            retried: 0,
            failed: 0
        }
    );

    let remote_record = remote
        .record(EntityType::Invoice, "srv-3")
        .expect("remote record");
    assert_eq!(remote_record["amount"], json!(180));

    let local = store::get(service.pool(), EntityType::Invoice, "srv-3")
        .await?
        .expect("local record");
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.data["amount"], json!(180));
    assert_eq!(store::count(service.pool(), EntityType::Invoice).await?, 1);
    Ok(())
}

#[tokio::test]
async fn send_dispatches_the_state_transition() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.seed(
        EntityType::Invoice,
        json!({"_id": "srv-5", "amount": 90, "owner_id": "alice"}),
    );
    let service = memory_service(remote.clone()).await?;
    store::upsert(
        service.pool(),
        EntityType::Invoice,
        ledgerline::store::RecordWrite {
            external_id: "srv-5".to_string(),
            owner_id: Some("alice".to_string()),
            member_ids: Vec::new(),
            sync_status: SyncStatus::Synced,
            data: json!({"_id": "srv-5", "amount": 90, "owner_id": "alice"}),
        },
    )
    .await?;

    service
        .enqueue(
            EntityType::Invoice,
            Action::Send,
            Some("srv-5"),
            json!({}),
            None,
        )
        .await?;
    let pending = store::get(service.pool(), EntityType::Invoice, "srv-5")
        .await?
        .expect("record");
    assert_eq!(pending.sync_status, SyncStatus::Pending);

    service.run_outbound_sync().await;

    let remote_record = remote
        .record(EntityType::Invoice, "srv-5")
        .expect("remote record");
    assert_eq!(remote_record["status"], json!("sent"));
    let local = store::get(service.pool(), EntityType::Invoice, "srv-5")
        .await?
        .expect("record");
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.data["status"], json!("sent"));
    Ok(())
}

#[tokio::test]
async fn unsupported_actions_are_rejected_at_enqueue() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    let service = memory_service(remote).await?;

    let err = service
        .enqueue(
            EntityType::Wallet,
            Action::Create,
            None,
            json!({"currency": "EUR"}),
            None,
        )
        .await
        .expect_err("wallet create must be rejected");
    assert_eq!(err.code(), "QUEUE/UNSUPPORTED_ACTION");

    let err = service
        .enqueue(
            EntityType::Customer,
            Action::Send,
            Some("cus-1"),
            json!({}),
            None,
        )
        .await
        .expect_err("customer send must be rejected");
    assert_eq!(err.code(), "QUEUE/UNSUPPORTED_ACTION");

    assert_eq!(queue::pending_count(service.pool()).await?, 0);
    Ok(())
}
