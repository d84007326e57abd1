use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use ts_rs::TS;

use crate::entity::{Action, EntityType};
use crate::time::now_ms;
use crate::{AppError, AppResult};

/// One pending outgoing mutation awaiting remote confirmation.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "bindings/")]
pub struct QueueItem {
    #[ts(type = "number")]
    pub id: i64,
    pub entity_type: EntityType,
    pub action: Action,
    pub entity_id: String,
    #[ts(type = "unknown")]
    pub payload: Value,
    #[ts(type = "number")]
    pub attempts: i64,
    #[ts(optional, type = "number")]
    pub last_attempt_at: Option<i64>,
    #[ts(optional, type = "number")]
    pub next_attempt_at: Option<i64>,
    pub failed: bool,
    #[ts(optional)]
    pub last_error: Option<String>,
    #[ts(type = "number")]
    pub created_at: i64,
}

fn item_from_row(row: &SqliteRow) -> AppResult<QueueItem> {
    let entity_type: String = row.try_get("entity_type").map_err(AppError::from)?;
    let action: String = row.try_get("action").map_err(AppError::from)?;
    let payload: String = row.try_get("payload").map_err(AppError::from)?;
    let failed: i64 = row.try_get("failed").map_err(AppError::from)?;
    Ok(QueueItem {
        id: row.try_get("id").map_err(AppError::from)?,
        entity_type: EntityType::parse(&entity_type)?,
        action: Action::parse(&action)?,
        entity_id: row.try_get("entity_id").map_err(AppError::from)?,
        payload: serde_json::from_str(&payload).map_err(AppError::from)?,
        attempts: row.try_get("attempts").map_err(AppError::from)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(AppError::from)?,
        next_attempt_at: row.try_get("next_attempt_at").map_err(AppError::from)?,
        failed: failed != 0,
        last_error: row.try_get("last_error").map_err(AppError::from)?,
        created_at: row.try_get("created_at").map_err(AppError::from)?,
    })
}

/// Append a mutation. Attempts start at zero; the item is immediately due.
pub async fn enqueue(
    pool: &SqlitePool,
    entity: EntityType,
    action: Action,
    entity_id: &str,
    payload: &Value,
) -> AppResult<i64> {
    let res = sqlx::query(
        "INSERT INTO mutation_queue (entity_type, action, entity_id, payload, attempts, created_at) \
         VALUES (?, ?, ?, ?, 0, ?)",
    )
    .bind(entity.as_str())
    .bind(action.as_str())
    .bind(entity_id)
    .bind(payload.to_string())
    .bind(now_ms())
    .execute(pool)
    .await
    .map_err(AppError::from)?;
    Ok(res.last_insert_rowid())
}

/// Items eligible for dispatch at `now`: never terminally failed, and
/// either never scheduled or scheduled at or before `now`. Fresh items keep
/// insertion order; retried items sort by their schedule, not the tail.
pub async fn list_due(pool: &SqlitePool, now: i64) -> AppResult<Vec<QueueItem>> {
    let rows = sqlx::query(
        "SELECT * FROM mutation_queue \
         WHERE failed = 0 AND (next_attempt_at IS NULL OR next_attempt_at <= ?) \
         ORDER BY COALESCE(next_attempt_at, 0), id",
    )
    .bind(now)
    .fetch_all(pool)
    .await
    .map_err(AppError::from)?;
    rows.iter().map(item_from_row).collect()
}

pub async fn get(pool: &SqlitePool, id: i64) -> AppResult<Option<QueueItem>> {
    let row = sqlx::query("SELECT * FROM mutation_queue WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(AppError::from)?;
    row.as_ref().map(item_from_row).transpose()
}

pub async fn remove(pool: &SqlitePool, id: i64) -> AppResult<()> {
    sqlx::query("DELETE FROM mutation_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

/// Count an attempt before the dispatch goes out, so a crash mid-dispatch
/// still burns retry budget.
pub async fn mark_attempt(pool: &SqlitePool, id: i64) -> AppResult<()> {
    sqlx::query("UPDATE mutation_queue SET attempts = attempts + 1, last_attempt_at = ? WHERE id = ?")
        .bind(now_ms())
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

pub async fn mark_retry(pool: &SqlitePool, id: i64, backoff_ms: i64, error: &str) -> AppResult<()> {
    sqlx::query(
        "UPDATE mutation_queue SET next_attempt_at = ?, last_error = ? WHERE id = ?",
    )
    .bind(now_ms() + backoff_ms)
    .bind(error)
    .bind(id)
    .execute(pool)
    .await
    .map_err(AppError::from)?;
    Ok(())
}

/// Terminal: the item stays for inspection but is never auto-retried.
pub async fn mark_failed(pool: &SqlitePool, id: i64, error: &str) -> AppResult<()> {
    sqlx::query("UPDATE mutation_queue SET failed = 1, last_error = ? WHERE id = ?")
        .bind(error)
        .bind(id)
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

pub async fn list_failed(pool: &SqlitePool) -> AppResult<Vec<QueueItem>> {
    let rows = sqlx::query("SELECT * FROM mutation_queue WHERE failed = 1 ORDER BY id")
        .fetch_all(pool)
        .await
        .map_err(AppError::from)?;
    rows.iter().map(item_from_row).collect()
}

pub async fn clear_failed(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query("DELETE FROM mutation_queue WHERE failed = 1")
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

pub async fn clear_all(pool: &SqlitePool) -> AppResult<()> {
    sqlx::query("DELETE FROM mutation_queue")
        .execute(pool)
        .await
        .map_err(AppError::from)?;
    Ok(())
}

pub async fn pending_count(pool: &SqlitePool) -> AppResult<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM mutation_queue WHERE failed = 0")
        .fetch_one(pool)
        .await
        .map_err(AppError::from)
}

pub async fn failed_count(pool: &SqlitePool) -> AppResult<i64> {
    sqlx::query_scalar("SELECT COUNT(*) FROM mutation_queue WHERE failed = 1")
        .fetch_one(pool)
        .await
        .map_err(AppError::from)
}

/// Does any live (non-failed) mutation still target this identifier?
/// `excluding` masks the item currently being dispatched, which is only
/// removed from the table after its handler returns.
pub async fn has_pending_for(
    pool: &SqlitePool,
    entity: EntityType,
    entity_id: &str,
    excluding: Option<i64>,
) -> AppResult<bool> {
    let found: Option<i64> = sqlx::query_scalar(
        "SELECT 1 FROM mutation_queue \
         WHERE failed = 0 AND entity_type = ? AND entity_id = ? AND id != ? LIMIT 1",
    )
    .bind(entity.as_str())
    .bind(entity_id)
    .bind(excluding.unwrap_or(-1))
    .fetch_optional(pool)
    .await
    .map_err(AppError::from)?;
    Ok(found.is_some())
}

/// Re-key queued mutations after a `Create` resolves: follow-up items that
/// still target the temp id must dispatch against the canonical one.
pub async fn repoint_entity(
    pool: &SqlitePool,
    entity: EntityType,
    from: &str,
    to: &str,
) -> AppResult<u64> {
    let res = sqlx::query(
        "UPDATE mutation_queue SET entity_id = ? WHERE entity_type = ? AND entity_id = ?",
    )
    .bind(to)
    .bind(entity.as_str())
    .bind(from)
    .execute(pool)
    .await
    .map_err(AppError::from)?;
    Ok(res.rows_affected())
}

/// Drop every queued mutation for one identifier. Used when a local delete
/// cancels out a `Create` that never reached the remote.
pub async fn remove_for_entity(
    pool: &SqlitePool,
    entity: EntityType,
    entity_id: &str,
) -> AppResult<u64> {
    let res = sqlx::query(
        "DELETE FROM mutation_queue WHERE entity_type = ? AND entity_id = ?",
    )
    .bind(entity.as_str())
    .bind(entity_id)
    .execute(pool)
    .await
    .map_err(AppError::from)?;
    Ok(res.rows_affected())
}
