//! The outbox store: sample rows, send-state tracking, and typed
//! configuration access.

use crate::{migrations, Column, ColumnValue, ConfigValue, Sample, StoreError, StoreResult};
use chrono::Utc;
use rusqlite::backup::Backup;
use rusqlite::types::{ToSqlOutput, Value, ValueRef};
use rusqlite::{params, Connection, ToSql};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// String configuration table.
pub const CONF_STR: &str = "conf_str";
/// Numeric (double / int64) configuration table.
pub const CONF_NUM: &str = "conf_num";

/// Timestamps before 2000-01-01T00:00:00Z are treated as unset.
pub const MIN_VALID_TIMESTAMP_MS: i64 = 946_684_800_000;

/// Pages copied per backup step during copy-in/copy-out.
const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 64;

struct StoreInner {
    conn: Connection,
    /// Samples currently claimed by an unresolved delivery attempt.
    in_flight: usize,
    /// Next correlation handle to hand out.
    next_message_id: i64,
}

/// Durable sample outbox and configuration store.
///
/// The live database lives in memory; `open` copies a durable file in when
/// one exists and `persist` copies the current state back out. Every
/// public operation takes the single internal lock for the duration of one
/// logical operation and never touches the network while holding it.
pub struct Store {
    inner: Mutex<StoreInner>,
    durable_path: Option<PathBuf>,
}

impl Store {
    /// Open the store backed by a durable file, restoring previous state
    /// when the file exists and running migrations.
    pub fn open(durable_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = durable_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut conn = Connection::open_in_memory()?;

        if durable_path.exists() {
            let src = Connection::open(durable_path)?;
            let backup = Backup::new(&src, &mut conn)?;
            backup.run_to_completion(BACKUP_PAGES_PER_STEP, Duration::from_millis(5), None)?;
            info!(path = %durable_path.display(), "Restored durable state");
        }

        Self::finish_open(conn, Some(durable_path.to_path_buf()))
    }

    /// Open a purely in-memory store (tests, ephemeral runs).
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::finish_open(conn, None)
    }

    fn finish_open(conn: Connection, durable_path: Option<PathBuf>) -> StoreResult<Self> {
        migrations::run_migrations(&conn)?;

        let next_message_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(message_id), 0) + 1 FROM samples",
            [],
            |row| row.get(0),
        )?;

        Ok(Self {
            inner: Mutex::new(StoreInner {
                conn,
                in_flight: 0,
                next_message_id,
            }),
            durable_path,
        })
    }

    /// Copy the live database out to durable storage.
    ///
    /// No-op for in-memory stores. Called on clean shutdown; calling it at
    /// other times is safe.
    pub fn persist(&self) -> StoreResult<()> {
        let path = match &self.durable_path {
            Some(p) => p.clone(),
            None => return Ok(()),
        };

        let inner = self.lock();
        let mut dst = Connection::open(&path)?;
        let backup = Backup::new(&inner.conn, &mut dst)?;
        backup.run_to_completion(BACKUP_PAGES_PER_STEP, Duration::from_millis(5), None)?;
        info!(path = %path.display(), "Persisted durable state");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ==========================================
    // Samples
    // ==========================================

    /// Insert a sample, returning its assigned id.
    ///
    /// Timestamps predating year 2000 are treated as unset and replaced
    /// with the current time.
    pub fn insert_sample(&self, stream: &str, timestamp: i64, value: f64) -> StoreResult<i64> {
        let timestamp = if timestamp < MIN_VALID_TIMESTAMP_MS {
            Utc::now().timestamp_millis()
        } else {
            timestamp
        };

        let inner = self.lock();
        inner.conn.execute(
            "INSERT INTO samples (stream, timestamp, value, is_sent, message_id)
             VALUES (?1, ?2, ?3, 0, NULL)",
            params![stream, timestamp, value],
        )?;
        let id = inner.conn.last_insert_rowid();
        debug!(id, stream, timestamp, value, "Inserted sample");
        Ok(id)
    }

    /// Read up to `limit` dispatch-eligible samples in insertion order.
    ///
    /// Eligible means not sent and not claimed. Rows are not claimed by
    /// this call.
    pub fn read_unsent(&self, limit: usize) -> StoreResult<Vec<Sample>> {
        let inner = self.lock();
        let mut stmt = inner.conn.prepare(
            "SELECT id, stream, timestamp, value, is_sent, message_id, claimed_at
             FROM samples
             WHERE is_sent = 0 AND message_id IS NULL
             ORDER BY id ASC
             LIMIT ?1",
        )?;

        let rows = stmt.query_map(params![limit as i64], row_to_sample)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Claim a row for one in-flight delivery attempt.
    ///
    /// No-op if the row no longer exists or is already claimed or sent.
    pub fn mark_in_flight(&self, id: i64, message_id: i64) -> StoreResult<()> {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.lock();
        let changed = inner.conn.execute(
            "UPDATE samples SET message_id = ?1, claimed_at = ?2
             WHERE id = ?3 AND is_sent = 0 AND message_id IS NULL",
            params![message_id, now, id],
        )?;
        inner.in_flight += changed;
        Ok(())
    }

    /// Atomically claim up to `limit` eligible samples under one message id
    /// and return them in insertion order.
    ///
    /// This is the composite form of `read_unsent` + `mark_in_flight` for
    /// callers that can race with each other over the same rows.
    pub fn claim_unsent(&self, limit: usize, message_id: i64) -> StoreResult<Vec<Sample>> {
        let now = Utc::now().timestamp_millis();
        let mut inner = self.lock();
        let claimed = inner.conn.execute(
            "UPDATE samples SET message_id = ?1, claimed_at = ?2
             WHERE id IN (
                 SELECT id FROM samples
                 WHERE is_sent = 0 AND message_id IS NULL
                 ORDER BY id ASC
                 LIMIT ?3
             )",
            params![message_id, now, limit as i64],
        )?;
        inner.in_flight += claimed;

        if claimed == 0 {
            return Ok(Vec::new());
        }

        let mut stmt = inner.conn.prepare(
            "SELECT id, stream, timestamp, value, is_sent, message_id, claimed_at
             FROM samples
             WHERE message_id = ?1 AND is_sent = 0
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![message_id], row_to_sample)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Resolve a delivery attempt.
    ///
    /// With `delete` the matching rows are removed; otherwise they are
    /// marked sent and retained. Unknown message ids affect zero rows and
    /// are not an error.
    pub fn confirm_sent(&self, message_id: i64, delete: bool) -> StoreResult<usize> {
        let mut inner = self.lock();
        let changed = if delete {
            inner.conn.execute(
                "DELETE FROM samples WHERE message_id = ?1",
                params![message_id],
            )?
        } else {
            inner.conn.execute(
                "UPDATE samples SET is_sent = 1 WHERE message_id = ?1 AND is_sent = 0",
                params![message_id],
            )?
        };
        inner.in_flight = inner.in_flight.saturating_sub(changed);
        debug!(message_id, delete, confirmed = changed, "Confirmed delivery");
        Ok(changed)
    }

    /// Release a claim after a failed delivery attempt, making the rows
    /// dispatch-eligible again.
    pub fn release_claim(&self, message_id: i64) -> StoreResult<usize> {
        let mut inner = self.lock();
        let changed = inner.conn.execute(
            "UPDATE samples SET message_id = NULL, claimed_at = NULL
             WHERE message_id = ?1 AND is_sent = 0",
            params![message_id],
        )?;
        inner.in_flight = inner.in_flight.saturating_sub(changed);
        Ok(changed)
    }

    /// Release every claim older than `window`, returning how many rows
    /// became eligible again. Prevents permanent starvation when an ack is
    /// lost to a disconnect.
    pub fn reclaim_stale(&self, window: Duration) -> StoreResult<usize> {
        let cutoff = Utc::now().timestamp_millis() - window.as_millis() as i64;
        let mut inner = self.lock();
        let changed = inner.conn.execute(
            "UPDATE samples SET message_id = NULL, claimed_at = NULL
             WHERE is_sent = 0 AND message_id IS NOT NULL AND claimed_at <= ?1",
            params![cutoff],
        )?;
        inner.in_flight = inner.in_flight.saturating_sub(changed);
        if changed > 0 {
            warn!(reclaimed = changed, "Released stale in-flight claims");
        }
        Ok(changed)
    }

    /// Number of samples currently claimed by unresolved delivery attempts.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    /// Hand out the next correlation handle.
    pub fn next_message_id(&self) -> i64 {
        let mut inner = self.lock();
        let id = inner.next_message_id;
        inner.next_message_id += 1;
        id
    }

    // ==========================================
    // Configuration
    // ==========================================

    /// Typed upsert into a configuration table.
    pub fn set_config(&self, table: &str, key: &str, value: &ConfigValue) -> StoreResult<()> {
        validate_identifier(table)?;
        let sql = format!(
            "INSERT INTO {table} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        );

        let inner = self.lock();
        match value {
            ConfigValue::Str(s) => inner.conn.execute(&sql, params![key, s])?,
            ConfigValue::Double(d) => inner.conn.execute(&sql, params![key, d])?,
            ConfigValue::Int64(i) => inner.conn.execute(&sql, params![key, i])?,
        };
        Ok(())
    }

    /// Read a configuration value. Absent keys are `None`, not an error.
    pub fn get_config(&self, table: &str, key: &str) -> StoreResult<Option<ConfigValue>> {
        validate_identifier(table)?;
        let sql = format!("SELECT value FROM {table} WHERE key = ?1");

        let inner = self.lock();
        let mut stmt = inner.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![key])?;

        match rows.next()? {
            Some(row) => match row.get_ref(0)? {
                ValueRef::Null => Ok(None),
                ValueRef::Integer(i) => Ok(Some(ConfigValue::Int64(i))),
                ValueRef::Real(f) => Ok(Some(ConfigValue::Double(f))),
                ValueRef::Text(t) => Ok(Some(ConfigValue::Str(
                    String::from_utf8_lossy(t).into_owned(),
                ))),
                ValueRef::Blob(_) => Err(StoreError::InvalidData(format!(
                    "unexpected blob value for config key {key}"
                ))),
            },
            None => Ok(None),
        }
    }

    /// Read a string config value from the standard string table.
    pub fn get_string(&self, key: &str) -> StoreResult<Option<String>> {
        match self.get_config(CONF_STR, key)? {
            Some(ConfigValue::Str(s)) => Ok(Some(s)),
            Some(_) | None => Ok(None),
        }
    }

    pub fn set_string(&self, key: &str, value: &str) -> StoreResult<()> {
        self.set_config(CONF_STR, key, &ConfigValue::Str(value.to_string()))
    }

    /// Read a double config value from the numeric table.
    pub fn get_double(&self, key: &str) -> StoreResult<Option<f64>> {
        match self.get_config(CONF_NUM, key)? {
            Some(ConfigValue::Double(d)) => Ok(Some(d)),
            Some(ConfigValue::Int64(i)) => Ok(Some(i as f64)),
            Some(_) | None => Ok(None),
        }
    }

    pub fn set_double(&self, key: &str, value: f64) -> StoreResult<()> {
        self.set_config(CONF_NUM, key, &ConfigValue::Double(value))
    }

    /// Read an int64 config value from the numeric table.
    pub fn get_int64(&self, key: &str) -> StoreResult<Option<i64>> {
        match self.get_config(CONF_NUM, key)? {
            Some(ConfigValue::Int64(i)) => Ok(Some(i)),
            Some(_) | None => Ok(None),
        }
    }

    pub fn set_int64(&self, key: &str, value: i64) -> StoreResult<()> {
        self.set_config(CONF_NUM, key, &ConfigValue::Int64(value))
    }

    // ==========================================
    // Generic row access
    // ==========================================

    /// All row ids of an auxiliary table, ascending.
    pub fn row_ids(&self, table: &str) -> StoreResult<Vec<i64>> {
        validate_identifier(table)?;
        let sql = format!("SELECT id FROM {table} ORDER BY id ASC");

        let inner = self.lock();
        let mut stmt = inner.conn.prepare(&sql)?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Insert a row into an auxiliary table, returning the assigned id.
    pub fn write_row(&self, table: &str, columns: &[Column]) -> StoreResult<i64> {
        validate_identifier(table)?;
        if columns.is_empty() {
            return Err(StoreError::InvalidData("write_row needs columns".to_string()));
        }
        for column in columns {
            validate_identifier(&column.name)?;
        }

        let names: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
        let markers: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            names.join(", "),
            markers.join(", ")
        );

        let values: Vec<&dyn ToSql> = columns.iter().map(|c| &c.value as &dyn ToSql).collect();

        let inner = self.lock();
        inner.conn.execute(&sql, values.as_slice())?;
        Ok(inner.conn.last_insert_rowid())
    }

    /// Read the named columns of one row. `None` when the row is absent;
    /// NULL column values round-trip as `ColumnValue::Null`.
    pub fn read_row(
        &self,
        table: &str,
        id: i64,
        columns: &[&str],
    ) -> StoreResult<Option<Vec<ColumnValue>>> {
        validate_identifier(table)?;
        for name in columns {
            validate_identifier(name)?;
        }

        let sql = format!(
            "SELECT {} FROM {table} WHERE id = ?1",
            columns.join(", ")
        );

        let inner = self.lock();
        let mut stmt = inner.conn.prepare(&sql)?;
        let mut rows = stmt.query(params![id])?;

        match rows.next()? {
            Some(row) => {
                let mut values = Vec::with_capacity(columns.len());
                for i in 0..columns.len() {
                    values.push(match row.get_ref(i)? {
                        ValueRef::Null => ColumnValue::Null,
                        ValueRef::Integer(v) => ColumnValue::Int64(v),
                        ValueRef::Real(v) => ColumnValue::Double(v),
                        ValueRef::Text(t) => {
                            ColumnValue::Text(String::from_utf8_lossy(t).into_owned())
                        }
                        ValueRef::Blob(_) => {
                            return Err(StoreError::InvalidData(format!(
                                "unexpected blob in {table}.{}",
                                columns[i]
                            )))
                        }
                    });
                }
                Ok(Some(values))
            }
            None => Ok(None),
        }
    }

    /// Execute raw SQL, e.g. to create an auxiliary mapping table.
    pub fn execute_batch(&self, sql: &str) -> StoreResult<()> {
        let inner = self.lock();
        inner.conn.execute_batch(sql)?;
        Ok(())
    }
}

fn row_to_sample(row: &rusqlite::Row<'_>) -> rusqlite::Result<Sample> {
    Ok(Sample {
        id: row.get(0)?,
        stream: row.get(1)?,
        timestamp: row.get(2)?,
        value: row.get(3)?,
        is_sent: row.get(4)?,
        message_id: row.get(5)?,
        claimed_at: row.get(6)?,
    })
}

impl ToSql for ColumnValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ColumnValue::Null => ToSqlOutput::Owned(Value::Null),
            ColumnValue::Integer(i) => ToSqlOutput::Owned(Value::Integer(*i as i64)),
            ColumnValue::Int64(i) => ToSqlOutput::Owned(Value::Integer(*i)),
            ColumnValue::Double(d) => ToSqlOutput::Owned(Value::Real(*d)),
            ColumnValue::Text(s) => ToSqlOutput::Owned(Value::Text(s.clone())),
        })
    }
}

/// Table and column names are interpolated into SQL; only plain
/// identifiers pass.
fn validate_identifier(name: &str) -> StoreResult<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}
