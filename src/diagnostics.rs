use serde::Serialize;
use sqlx::SqlitePool;

use crate::entity::EntityType;
use crate::identity::StoreHandle;
use crate::queue;
use crate::store;
use crate::AppResult;

/// Snapshot of the sync state of the local database, for the CLI and
/// support tooling.
#[derive(Debug, Serialize)]
pub struct SyncSummary {
    pub identity: Option<String>,
    pub entities: Vec<EntityCount>,
    pub queue_pending: i64,
    pub queue_failed: i64,
    pub quarantined: i64,
}

#[derive(Debug, Serialize)]
pub struct EntityCount {
    pub entity_type: &'static str,
    pub cached: i64,
}

pub async fn gather(pool: &SqlitePool, marker: &StoreHandle) -> AppResult<SyncSummary> {
    let mut entities = Vec::with_capacity(EntityType::ALL.len());
    for entity in EntityType::ALL {
        entities.push(EntityCount {
            entity_type: entity.as_str(),
            cached: store::count(pool, *entity).await?,
        });
    }
    Ok(SyncSummary {
        identity: marker.current_identity(),
        entities,
        queue_pending: queue::pending_count(pool).await?,
        queue_failed: queue::failed_count(pool).await?,
        quarantined: store::quarantine_count(pool).await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    #[tokio::test]
    async fn summary_reflects_queue_and_cache() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect sqlite::memory:");
        crate::migrate::apply_migrations(&pool).await.expect("migrations");

        queue::enqueue(
            &pool,
            EntityType::Invoice,
            crate::entity::Action::Create,
            "tmp-1",
            &serde_json::json!({}),
        )
        .await
        .unwrap();

        let marker = StoreHandle::in_memory();
        marker.record_identity("alice");

        let summary = gather(&pool, &marker).await.unwrap();
        assert_eq!(summary.identity.as_deref(), Some("alice"));
        assert_eq!(summary.queue_pending, 1);
        assert_eq!(summary.queue_failed, 0);
        assert_eq!(summary.entities.len(), EntityType::ALL.len());
    }
}
