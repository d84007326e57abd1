use uuid::Uuid;

pub const TEMP_ID_PREFIX: &str = "tmp-";

pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Placeholder identifier for a record whose `Create` has not reached the
/// remote yet. Replaced by the canonical id on dispatch.
pub fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7())
}

pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}
