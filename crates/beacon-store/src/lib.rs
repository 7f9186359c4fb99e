//! SQLite-backed outbox store for the Beacon agent.
//!
//! This crate provides:
//! - `Store`: the durable sample outbox with send-state tracking
//! - Typed key/value configuration tables with upsert semantics
//! - Generic typed column access for auxiliary mapping tables
//! - Versioned, additive schema migrations
//!
//! The live database is held in memory for operating efficiency; a full
//! copy-in runs at startup and a copy-out (`Store::persist`) on clean
//! shutdown, both through the SQLite backup API. All access is serialized
//! under a single lock, and the in-flight delivery counter is kept under
//! that same lock so counter and row state never diverge.

mod error;
mod migrations;
mod models;
mod store;

pub use error::{StoreError, StoreResult};
pub use migrations::{run_migrations, CURRENT_VERSION};
pub use models::{Column, ColumnValue, ConfigValue, Sample};
pub use store::{Store, CONF_NUM, CONF_STR, MIN_VALID_TIMESTAMP_MS};
