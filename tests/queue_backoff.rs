use std::sync::Arc;

use anyhow::Result;
use ledgerline::identity::StoreHandle;
use ledgerline::remote::memory::MemoryRemote;
use ledgerline::{queue, Action, EntityType, SyncConfig, SyncService};
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

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

async fn scheduled_delay(pool: &SqlitePool, item_id: i64) -> Result<Option<i64>> {
    let row: (Option<i64>, Option<i64>) = sqlx::query_as(
        "SELECT next_attempt_at, last_attempt_at FROM mutation_queue WHERE id = ?",
    )
    .bind(item_id)
    .fetch_one(pool)
    .await?;
    Ok(match row {
        (Some(next), Some(last)) => Some(next - last),
        _ => None,
    })
}

async fn force_due(pool: &SqlitePool) -> Result<()> {
    sqlx::query("UPDATE mutation_queue SET next_attempt_at = 0 WHERE failed = 0")
        .execute(pool)
        .await?;
    Ok(())
}

#[tokio::test]
async fn backoff_grows_until_the_item_fails_terminally() -> Result<()> {
    let config = test_config();
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.fail("create", EntityType::Invoice, 99);
    let service = memory_service(remote).await?;

    service
        .enqueue(
            EntityType::Invoice,
            Action::Create,
            None,
            json!({"amount": 10, "owner_id": "alice"}),
            None,
        )
        .await?;
    let item_id = queue::list_due(service.pool(), ledgerline::time::now_ms()).await?[0].id;

    let mut previous_delay = 0_i64;
    for attempt in 1..=config.max_attempts {
        service.run_outbound_sync().await;

        if attempt < config.max_attempts {
            let delay = scheduled_delay(service.pool(), item_id)
                .await?
                .expect("retry scheduled");
            assert!(
                delay >= previous_delay,
                "backoff must be monotone: {delay} < {previous_delay}"
            );
            // The two bookkeeping writes happen a few ms apart.
            let expected = config.backoff_delay_ms(attempt);
            assert!(delay >= expected && delay < expected + 1_000);
            previous_delay = delay;
            force_due(service.pool()).await?;
        }
    }

    let failed = service.list_failed_mutations().await?;
    assert_eq!(failed.len(), 1);
    let item = &failed[0];
    assert_eq!(item.id, item_id);
    assert!(item.failed);
    assert_eq!(item.attempts, config.max_attempts);
    assert!(item
        .last_error
        .as_deref()
        .unwrap_or_default()
        .contains("scripted failure"));
    Ok(())
}

#[tokio::test]
async fn failed_items_are_retained_but_never_redispatched() -> Result<()> {
    let config = test_config();
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.fail("update", EntityType::Customer, 99);
    let service = memory_service(remote.clone()).await?;

    ledgerline::store::upsert(
        service.pool(),
        EntityType::Customer,
        ledgerline::store::RecordWrite {
            external_id: "cus-1".to_string(),
            owner_id: None,
            member_ids: vec!["alice".to_string()],
            sync_status: ledgerline::store::SyncStatus::Synced,
            data: json!({"_id": "cus-1", "name": "Acme"}),
        },
    )
    .await?;
    service
        .enqueue(
            EntityType::Customer,
            Action::Update,
            Some("cus-1"),
            json!({"name": "Acme Ltd"}),
            None,
        )
        .await?;

    for _ in 0..config.max_attempts {
        service.run_outbound_sync().await;
        force_due(service.pool()).await?;
    }
    let dispatch_calls = remote.calls().len();
    assert_eq!(service.list_failed_mutations().await?.len(), 1);

    // Terminal items never come due again.
    service.run_outbound_sync().await;
    assert_eq!(remote.calls().len(), dispatch_calls);

    service.clear_failed_mutations().await?;
    assert!(service.list_failed_mutations().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn enqueue_never_surfaces_remote_failures() -> Result<()> {
    let remote = Arc::new(MemoryRemote::new(Some("alice")));
    remote.fail("create", EntityType::Invoice, 99);
    let service = memory_service(remote).await?;

    // The remote is down; queuing still succeeds and stays local.
    let id = service
        .enqueue(
            EntityType::Invoice,
            Action::Create,
            None,
            json!({"amount": 5, "owner_id": "alice"}),
            None,
        )
        .await?;
    assert!(id.starts_with("tmp-"));
    assert_eq!(queue::pending_count(service.pool()).await?, 1);
    Ok(())
}
