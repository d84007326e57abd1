use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::{AppError, AppResult};

/// Closed set of entity types the reconciliation engine knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum EntityType {
    Invoice,
    WorkRecord,
    Customer,
    UtilityService,
    Wallet,
    WithdrawalRequest,
}

/// Which column(s) identify the owning account on a cached record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerShape {
    /// Single `owner_id` column.
    Single,
    /// `member_ids` JSON array; any member counts as an owner.
    Members,
}

impl EntityType {
    pub const ALL: &'static [EntityType] = &[
        EntityType::Invoice,
        EntityType::WorkRecord,
        EntityType::Customer,
        EntityType::UtilityService,
        EntityType::Wallet,
        EntityType::WithdrawalRequest,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            EntityType::Invoice => "invoices",
            EntityType::WorkRecord => "work_records",
            EntityType::Customer => "customers",
            EntityType::UtilityService => "utility_services",
            EntityType::Wallet => "wallets",
            EntityType::WithdrawalRequest => "withdrawal_requests",
        }
    }

    /// Remote collection segment, as the service names it.
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::Invoice => "invoices",
            EntityType::WorkRecord => "records",
            EntityType::Customer => "customers",
            EntityType::UtilityService => "services",
            EntityType::Wallet => "wallets",
            EntityType::WithdrawalRequest => "withdrawals",
        }
    }

    pub fn owner_shape(&self) -> OwnerShape {
        match self {
            EntityType::Customer | EntityType::UtilityService => OwnerShape::Members,
            _ => OwnerShape::Single,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Invoice => "invoice",
            EntityType::WorkRecord => "work_record",
            EntityType::Customer => "customer",
            EntityType::UtilityService => "utility_service",
            EntityType::Wallet => "wallet",
            EntityType::WithdrawalRequest => "withdrawal_request",
        }
    }

    pub fn parse(value: &str) -> AppResult<EntityType> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|e| e.as_str() == value)
            .ok_or_else(|| {
                AppError::new("ENTITY/UNKNOWN", "Unknown entity type")
                    .with_context("entity_type", value.to_string())
            })
    }
}

/// Mutations the queue can carry. `Send` is the entity-specific state
/// transition (invoice dispatch, withdrawal submission).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
#[ts(export, export_to = "bindings/")]
pub enum Action {
    Create,
    Update,
    Delete,
    Send,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Send => "send",
        }
    }

    pub fn parse(value: &str) -> AppResult<Action> {
        match value {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            "send" => Ok(Action::Send),
            other => Err(AppError::new("ACTION/UNKNOWN", "Unknown action")
                .with_context("action", other.to_string())),
        }
    }
}

/// Entity-specific subset of supported actions, checked at enqueue time.
pub fn ensure_supported(entity: EntityType, action: Action) -> AppResult<()> {
    let supported = match (entity, action) {
        // The wallet is created and settled remotely; only its settings
        // are mutable from the client.
        (EntityType::Wallet, Action::Update) => true,
        (EntityType::Wallet, _) => false,
        (EntityType::Invoice, Action::Send) => true,
        (EntityType::WithdrawalRequest, Action::Send) => true,
        (_, Action::Send) => false,
        (_, Action::Create | Action::Update | Action::Delete) => true,
    };
    if supported {
        Ok(())
    } else {
        Err(
            AppError::new("QUEUE/UNSUPPORTED_ACTION", "Action not supported for entity")
                .with_context("entity_type", entity.as_str())
                .with_context("action", action.as_str()),
        )
    }
}
