use serde_json::Value;
use sqlx::SqlitePool;
use tracing::info;

use crate::entity::{EntityType, OwnerShape};
use crate::{AppError, AppResult};

/// Owner identities claimed by a record payload, per the entity's shape.
/// Empty means the payload does not assert ownership at all.
pub fn extract_owners(entity: EntityType, data: &Value) -> Vec<String> {
    match entity.owner_shape() {
        OwnerShape::Single => data
            .get("owner_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| vec![s.to_string()])
            .unwrap_or_default(),
        OwnerShape::Members => data
            .get("member_ids")
            .and_then(Value::as_array)
            .map(|members| {
                members
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    }
}

/// A record is foreign when it names at least one owner and none of them
/// is the current identity. Ownerless records are never foreign.
pub fn is_foreign(owners: &[String], identity: &str) -> bool {
    !owners.is_empty() && !owners.iter().any(|o| o == identity)
}

/// Scan every cached collection for records left behind by another
/// identity. Stops at the first hit.
pub async fn has_foreign_residue(pool: &SqlitePool, identity: &str) -> AppResult<bool> {
    for entity in EntityType::ALL {
        let found = match entity.owner_shape() {
            OwnerShape::Single => {
                let sql = format!(
                    "SELECT external_id FROM {} \
                     WHERE owner_id IS NOT NULL AND owner_id != '' AND owner_id != ? LIMIT 1",
                    entity.table()
                );
                sqlx::query_scalar::<_, String>(&sql)
                    .bind(identity)
                    .fetch_optional(pool)
                    .await
                    .map_err(AppError::from)?
            }
            OwnerShape::Members => {
                let sql = format!(
                    "SELECT external_id, member_ids FROM {} \
                     WHERE member_ids IS NOT NULL AND member_ids != '' AND member_ids != '[]'",
                    entity.table()
                );
                let rows: Vec<(String, String)> = sqlx::query_as(&sql)
                    .fetch_all(pool)
                    .await
                    .map_err(AppError::from)?;
                rows.into_iter()
                    .find(|(_, raw)| {
                        let members: Vec<String> =
                            serde_json::from_str(raw).unwrap_or_default();
                        is_foreign(&members, identity)
                    })
                    .map(|(external_id, _)| external_id)
            }
        };
        if let Some(external_id) = found {
            info!(
                target: "ledgerline",
                event = "foreign_residue_found",
                entity_type = %entity.as_str(),
                external_id = %external_id
            );
            return Ok(true);
        }
    }
    Ok(false)
}
