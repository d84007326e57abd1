use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};

use crate::entity::EntityType;
use crate::id::new_uuid_v7;
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Reconciliation state of a cached record. `Pending` rows are shielded
/// from inbound overwrites until their queued mutation resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Synced,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
        }
    }

    fn parse(value: &str) -> SyncStatus {
        match value {
            "pending" => SyncStatus::Pending,
            _ => SyncStatus::Synced,
        }
    }
}

/// One cached projection of a remote entity.
#[derive(Debug, Clone)]
pub struct LocalRecord {
    pub id: String,
    pub external_id: String,
    pub owner_id: Option<String>,
    pub member_ids: Vec<String>,
    pub sync_status: SyncStatus,
    pub failed_sync: bool,
    pub data: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields the caller controls when writing a record; surrogate id and
/// timestamps are assigned here.
#[derive(Debug, Clone)]
pub struct RecordWrite {
    pub external_id: String,
    pub owner_id: Option<String>,
    pub member_ids: Vec<String>,
    pub sync_status: SyncStatus,
    pub data: Value,
}

fn record_from_row(row: &SqliteRow) -> AppResult<LocalRecord> {
    let member_ids: Option<String> = row.try_get("member_ids").map_err(AppError::from)?;
    let member_ids = match member_ids {
        Some(raw) if !raw.is_empty() => serde_json::from_str(&raw).map_err(AppError::from)?,
        _ => Vec::new(),
    };
    let data: String = row.try_get("data").map_err(AppError::from)?;
    let status: String = row.try_get("sync_status").map_err(AppError::from)?;
    let failed: i64 = row.try_get("failed_sync").map_err(AppError::from)?;
    Ok(LocalRecord {
        id: row.try_get("id").map_err(AppError::from)?,
        external_id: row.try_get("external_id").map_err(AppError::from)?,
        owner_id: row.try_get("owner_id").map_err(AppError::from)?,
        member_ids,
        sync_status: SyncStatus::parse(&status),
        failed_sync: failed != 0,
        data: serde_json::from_str(&data).map_err(AppError::from)?,
        created_at: row.try_get("created_at").map_err(AppError::from)?,
        updated_at: row.try_get("updated_at").map_err(AppError::from)?,
    })
}

/// The stable reconciliation key carried inside a payload.
pub fn external_id_of(value: &Value) -> Option<&str> {
    value
        .get("_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
}

fn member_ids_json(member_ids: &[String]) -> AppResult<Option<String>> {
    if member_ids.is_empty() {
        Ok(None)
    } else {
        Ok(Some(
            serde_json::to_string(member_ids).map_err(AppError::from)?,
        ))
    }
}

pub async fn get(
    pool: &SqlitePool,
    entity: EntityType,
    external_id: &str,
) -> AppResult<Option<LocalRecord>> {
    let sql = format!("SELECT * FROM {} WHERE external_id = ?", entity.table());
    let row = sqlx::query(&sql)
        .bind(external_id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)?;
    row.as_ref().map(record_from_row).transpose()
}

pub async fn list(pool: &SqlitePool, entity: EntityType) -> AppResult<Vec<LocalRecord>> {
    let sql = format!("SELECT * FROM {} ORDER BY created_at, id", entity.table());
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(AppError::from)?;
    rows.iter().map(record_from_row).collect()
}

pub async fn count(pool: &SqlitePool, entity: EntityType) -> AppResult<i64> {
    let sql = format!("SELECT COUNT(*) FROM {}", entity.table());
    sqlx::query_scalar(&sql)
        .fetch_one(pool)
        .await
        .map_err(AppError::from)
}

/// Insert a brand-new record (used for local-first `Create` with a temp id).
pub async fn insert(pool: &SqlitePool, entity: EntityType, write: RecordWrite) -> AppResult<()> {
    let now = now_ms();
    let sql = format!(
        "INSERT INTO {} (id, external_id, owner_id, member_ids, sync_status, failed_sync, data, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)",
        entity.table()
    );
    sqlx::query(&sql)
        .bind(new_uuid_v7())
        .bind(&write.external_id)
        .bind(&write.owner_id)
        .bind(member_ids_json(&write.member_ids)?)
        .bind(write.sync_status.as_str())
        .bind(write.data.to_string())
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

/// Upsert by `external_id`, unconditionally. The inbound local surrogate
/// key is never trusted; conflict resolution always runs on `external_id`.
pub async fn upsert(pool: &SqlitePool, entity: EntityType, write: RecordWrite) -> AppResult<()> {
    upsert_with_guard(pool, entity, write, false).await.map(|_| ())
}

/// Upsert by `external_id`, skipping rows whose `sync_status` is `pending`.
/// Returns false when the pending guard suppressed the write.
pub async fn upsert_unless_pending(
    pool: &SqlitePool,
    entity: EntityType,
    write: RecordWrite,
) -> AppResult<bool> {
    upsert_with_guard(pool, entity, write, true).await
}

async fn upsert_with_guard(
    pool: &SqlitePool,
    entity: EntityType,
    write: RecordWrite,
    respect_pending: bool,
) -> AppResult<bool> {
    let now = now_ms();
    let guard = if respect_pending {
        " WHERE sync_status != 'pending'"
    } else {
        ""
    };
    let sql = format!(
        "INSERT INTO {} (id, external_id, owner_id, member_ids, sync_status, failed_sync, data, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?) \
         ON CONFLICT(external_id) DO UPDATE SET \
           owner_id = excluded.owner_id, \
           member_ids = excluded.member_ids, \
           sync_status = excluded.sync_status, \
           failed_sync = 0, \
           data = excluded.data, \
           updated_at = excluded.updated_at{guard}",
        entity.table()
    );
    let res = sqlx::query(&sql)
        .bind(new_uuid_v7())
        .bind(&write.external_id)
        .bind(&write.owner_id)
        .bind(member_ids_json(&write.member_ids)?)
        .bind(write.sync_status.as_str())
        .bind(write.data.to_string())
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(res.rows_affected() > 0)
}

/// Replace a JSON document in place, keeping ownership columns.
pub async fn update_data(
    pool: &SqlitePool,
    entity: EntityType,
    external_id: &str,
    data: &Value,
    sync_status: SyncStatus,
) -> AppResult<()> {
    let sql = format!(
        "UPDATE {} SET data = ?, sync_status = ?, updated_at = ? WHERE external_id = ?",
        entity.table()
    );
    let res = sqlx::query(&sql)
        .bind(data.to_string())
        .bind(sync_status.as_str())
        .bind(now_ms())
        .bind(external_id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    if res.rows_affected() == 0 {
        return Err(AppError::new("STORE/NOT_FOUND", "No cached record to update")
            .with_context("entity_type", entity.as_str())
            .with_context("external_id", external_id.to_string()));
    }
    Ok(())
}

pub async fn set_sync_status(
    pool: &SqlitePool,
    entity: EntityType,
    external_id: &str,
    status: SyncStatus,
) -> AppResult<()> {
    let sql = format!(
        "UPDATE {} SET sync_status = ?, updated_at = ? WHERE external_id = ?",
        entity.table()
    );
    sqlx::query(&sql)
        .bind(status.as_str())
        .bind(now_ms())
        .bind(external_id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

pub async fn delete(pool: &SqlitePool, entity: EntityType, external_id: &str) -> AppResult<()> {
    let sql = format!("DELETE FROM {} WHERE external_id = ?", entity.table());
    sqlx::query(&sql)
        .bind(external_id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

/// Atomic temp→canonical swap after a confirmed remote `Create`: the row
/// keyed by the temp id goes away and the canonical record lands in the
/// same transaction. No observer ever sees both or neither halves applied.
pub async fn replace_external_id(
    pool: &SqlitePool,
    entity: EntityType,
    temp_id: &str,
    canonical: RecordWrite,
) -> AppResult<()> {
    let table = entity.table();
    let delete_sql = format!("DELETE FROM {table} WHERE external_id = ?");
    let upsert_sql = format!(
        "INSERT INTO {table} (id, external_id, owner_id, member_ids, sync_status, failed_sync, data, created_at, updated_at) \
         VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?) \
         ON CONFLICT(external_id) DO UPDATE SET \
           owner_id = excluded.owner_id, \
           member_ids = excluded.member_ids, \
           sync_status = excluded.sync_status, \
           failed_sync = 0, \
           data = excluded.data, \
           updated_at = excluded.updated_at"
    );
    let member_ids = member_ids_json(&canonical.member_ids)?;

    // Dropping the transaction on any error path rolls both halves back.
    let mut tx = pool.begin().await.map_err(AppError::from)?;
    sqlx::query(&delete_sql)
        .bind(temp_id)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;
    let now = now_ms();
    sqlx::query(&upsert_sql)
        .bind(new_uuid_v7())
        .bind(&canonical.external_id)
        .bind(&canonical.owner_id)
        .bind(&member_ids)
        .bind(canonical.sync_status.as_str())
        .bind(canonical.data.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;
    tx.commit().await.map_err(AppError::from)?;
    Ok(())
}

/// Minimal stand-in for a record that failed integrity checks during a
/// pull. Existing data is kept; only the marker flips.
pub async fn write_placeholder(
    pool: &SqlitePool,
    entity: EntityType,
    external_id: &str,
) -> AppResult<()> {
    let now = now_ms();
    let sql = format!(
        "INSERT INTO {} (id, external_id, owner_id, member_ids, sync_status, failed_sync, data, created_at, updated_at) \
         VALUES (?, ?, NULL, NULL, 'synced', 1, '{{}}', ?, ?) \
         ON CONFLICT(external_id) DO UPDATE SET failed_sync = 1, updated_at = excluded.updated_at",
        entity.table()
    );
    sqlx::query(&sql)
        .bind(new_uuid_v7())
        .bind(external_id)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

/// Preserve an offending payload for later inspection.
pub async fn quarantine(
    pool: &SqlitePool,
    entity: EntityType,
    external_id: Option<&str>,
    reason: &str,
    payload: &Value,
) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO sync_quarantine (entity_type, external_id, reason, payload, created_at) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(entity.as_str())
    .bind(external_id)
    .bind(reason)
    .bind(payload.to_string())
    .bind(now_ms())
    .execute(pool)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

/// Quarantined payload, preserved verbatim for inspection.
#[derive(Debug, Clone)]
pub struct QuarantineRow {
    pub id: i64,
    pub entity_type: String,
    pub external_id: Option<String>,
    pub reason: String,
    pub payload: Value,
    pub created_at: i64,
}

pub async fn list_quarantine(pool: &SqlitePool) -> AppResult<Vec<QuarantineRow>> {
    let rows = sqlx::query("SELECT * FROM sync_quarantine ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(AppError::from)?;
    rows.iter()
        .map(|row| {
            let payload: String = row.try_get("payload").map_err(AppError::from)?;
            Ok(QuarantineRow {
                id: row.try_get("id").map_err(AppError::from)?,
                entity_type: row.try_get("entity_type").map_err(AppError::from)?,
                external_id: row.try_get("external_id").map_err(AppError::from)?,
                reason: row.try_get("reason").map_err(AppError::from)?,
                payload: serde_json::from_str(&payload).map_err(AppError::from)?,
                created_at: row.try_get("created_at").map_err(AppError::from)?,
            })
        })
        .collect()
}

pub async fn quarantine_count(pool: &SqlitePool) -> AppResult<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM sync_quarantine")
        .fetch_one(pool)
        .await
        .map_err(AppError::from)
}

pub async fn clear_quarantine(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query("DELETE FROM sync_quarantine")
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

/// Drop every cached entity collection. The queue and quarantine are
/// managed by their own operations.
pub async fn clear_all_entities(pool: &SqlitePool) -> AppResult<()> {
    for entity in EntityType::ALL {
        let sql = format!("DELETE FROM {}", entity.table());
        sqlx::query(&sql)
            .execute(pool)
            .await
            .map_err(AppError::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("connect sqlite::memory:");
        crate::migrate::apply_migrations(&pool)
            .await
            .expect("migrations");
        pool
    }

    fn write(external_id: &str, status: SyncStatus, data: Value) -> RecordWrite {
        RecordWrite {
            external_id: external_id.to_string(),
            owner_id: Some("alice".to_string()),
            member_ids: Vec::new(),
            sync_status: status,
            data,
        }
    }

    #[tokio::test]
    async fn upsert_resolves_on_external_id() {
        let pool = memory_pool().await;
        upsert(
            &pool,
            EntityType::Invoice,
            write("srv-1", SyncStatus::Synced, json!({"amount": 10})),
        )
        .await
        .unwrap();
        upsert(
            &pool,
            EntityType::Invoice,
            write("srv-1", SyncStatus::Synced, json!({"amount": 25})),
        )
        .await
        .unwrap();

        assert_eq!(count(&pool, EntityType::Invoice).await.unwrap(), 1);
        let rec = get(&pool, EntityType::Invoice, "srv-1")
            .await
            .unwrap()
            .expect("record");
        assert_eq!(rec.data["amount"], json!(25));
    }

    #[tokio::test]
    async fn pending_rows_resist_guarded_upserts() {
        let pool = memory_pool().await;
        upsert(
            &pool,
            EntityType::Invoice,
            write("srv-1", SyncStatus::Pending, json!({"amount": 10})),
        )
        .await
        .unwrap();

        let applied = upsert_unless_pending(
            &pool,
            EntityType::Invoice,
            write("srv-1", SyncStatus::Synced, json!({"amount": 99})),
        )
        .await
        .unwrap();
        assert!(!applied);

        let rec = get(&pool, EntityType::Invoice, "srv-1")
            .await
            .unwrap()
            .expect("record");
        assert_eq!(rec.data["amount"], json!(10));
        assert_eq!(rec.sync_status, SyncStatus::Pending);
    }

    #[tokio::test]
    async fn replace_swaps_temp_for_canonical_atomically() {
        let pool = memory_pool().await;
        insert(
            &pool,
            EntityType::Invoice,
            write("tmp-1", SyncStatus::Pending, json!({"amount": 10})),
        )
        .await
        .unwrap();

        replace_external_id(
            &pool,
            EntityType::Invoice,
            "tmp-1",
            write("srv-9", SyncStatus::Synced, json!({"amount": 10})),
        )
        .await
        .unwrap();

        assert!(get(&pool, EntityType::Invoice, "tmp-1")
            .await
            .unwrap()
            .is_none());
        let rec = get(&pool, EntityType::Invoice, "srv-9")
            .await
            .unwrap()
            .expect("canonical record");
        assert_eq!(rec.sync_status, SyncStatus::Synced);
        assert_eq!(count(&pool, EntityType::Invoice).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn placeholder_marks_without_clobbering_data() {
        let pool = memory_pool().await;
        upsert(
            &pool,
            EntityType::Customer,
            write("cus-1", SyncStatus::Synced, json!({"name": "Acme"})),
        )
        .await
        .unwrap();
        write_placeholder(&pool, EntityType::Customer, "cus-1")
            .await
            .unwrap();

        let rec = get(&pool, EntityType::Customer, "cus-1")
            .await
            .unwrap()
            .expect("record");
        assert!(rec.failed_sync);
        assert_eq!(rec.data["name"], json!("Acme"));

        write_placeholder(&pool, EntityType::Customer, "cus-404")
            .await
            .unwrap();
        let stub = get(&pool, EntityType::Customer, "cus-404")
            .await
            .unwrap()
            .expect("stub");
        assert!(stub.failed_sync);
        assert_eq!(stub.data, json!({}));
    }

    #[tokio::test]
    async fn clear_all_entities_empties_every_table() {
        let pool = memory_pool().await;
        for entity in EntityType::ALL {
            upsert(
                &pool,
                *entity,
                write("x-1", SyncStatus::Synced, json!({})),
            )
            .await
            .unwrap();
        }
        clear_all_entities(&pool).await.unwrap();
        for entity in EntityType::ALL {
            assert_eq!(count(&pool, *entity).await.unwrap(), 0);
        }
    }
}
