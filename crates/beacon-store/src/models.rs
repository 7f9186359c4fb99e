//! Store model types.

use serde::{Deserialize, Serialize};

/// One measurement event in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Surrogate key assigned by the store, monotonically increasing.
    pub id: i64,
    /// Short dotted string identifying the measured quantity.
    pub stream: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub value: f64,
    /// False until a transport confirms delivery.
    pub is_sent: bool,
    /// Correlation handle held while the sample is in flight.
    pub message_id: Option<i64>,
    /// When the in-flight claim was taken (ms since epoch).
    pub claimed_at: Option<i64>,
}

/// A typed configuration value.
///
/// String values live in the `conf_str` table; doubles and 64-bit
/// integers in `conf_num` (SQLite keeps the two numeric affinities
/// apart).
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Str(String),
    Double(f64),
    Int64(i64),
}

/// A typed column value for generic row access. `Null` round-trips.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Integer(i32),
    Int64(i64),
    Double(f64),
    Text(String),
}

/// A named column for `write_row`.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub value: ColumnValue,
}

impl Column {
    pub fn new(name: &str, value: ColumnValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}
