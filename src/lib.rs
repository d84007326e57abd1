//! Offline-first reconciliation core for the Ledgerline billing client.
//!
//! The client works against a local SQLite cache of business data while the
//! remote service stays the source of truth. This crate owns the pieces
//! that keep the two consistent: the outgoing mutation queue with retry and
//! idempotent replacement, the inbound full resync with ownership
//! filtering, and the sanitization boundary in front of the local store.

pub mod db;
pub mod diagnostics;
pub mod entity;
pub mod error;
pub mod events;
pub mod id;
pub mod identity;
pub mod inbound;
pub mod logging;
pub mod migrate;
pub mod outbound;
pub mod ownership;
pub mod queue;
pub mod remote;
pub mod sanitize;
pub mod service;
pub mod session;
pub mod store;
pub mod time;

pub use entity::{Action, EntityType};
pub use error::{AppError, AppResult};
pub use events::{ClearDecision, ClearReason, EventBus, SyncEvent, SyncSource};
pub use identity::StoreHandle;
pub use inbound::InboundOutcome;
pub use outbound::OutboundOutcome;
pub use queue::QueueItem;
pub use service::SyncService;
pub use session::SyncConfig;
