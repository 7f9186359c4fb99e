//! Schema migrations.
//!
//! Migrations are additive and applied exactly once per version gap.
//! The applied version is tracked as a `schema_version` counter in the
//! numeric config table rather than a separate bookkeeping table, so the
//! durable file carries it through the copy-in/copy-out cycle.

use crate::StoreResult;
use rusqlite::{params, Connection};
use tracing::{debug, info};

/// Current schema version.
pub const CURRENT_VERSION: i64 = 2;

/// Key under which the schema version is stored in `conf_num`.
const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    // The config tables bootstrap unconditionally; they hold the version
    // counter that gates everything else.
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conf_str (
            key TEXT PRIMARY KEY,
            value TEXT
        );

        CREATE TABLE IF NOT EXISTS conf_num (
            key TEXT PRIMARY KEY,
            value
        );
        ",
    )?;

    let current_version = schema_version(conn)?;

    info!(
        current_version,
        target_version = CURRENT_VERSION,
        "Running migrations"
    );

    if current_version < 1 {
        migrate_v1_samples(conn)?;
        record_version(conn, 1)?;
    }
    if current_version < 2 {
        migrate_v2_claim_tracking(conn)?;
        record_version(conn, 2)?;
    }

    Ok(())
}

/// Read the stored schema version, zero for a fresh database.
pub fn schema_version(conn: &Connection) -> StoreResult<i64> {
    let version = conn
        .query_row(
            "SELECT value FROM conf_num WHERE key = ?1",
            params![SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .unwrap_or(0);
    Ok(version)
}

fn record_version(conn: &Connection, version: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO conf_num (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![SCHEMA_VERSION_KEY, version],
    )?;
    debug!(version, "Migration applied");
    Ok(())
}

/// V1: the sample outbox.
fn migrate_v1_samples(conn: &Connection) -> StoreResult<()> {
    info!("Applying migration v1: sample outbox");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS samples (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            stream TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            value REAL NOT NULL,
            is_sent INTEGER NOT NULL DEFAULT 0,
            message_id INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_samples_unsent
            ON samples(is_sent, message_id);
        ",
    )?;

    Ok(())
}

/// V2: claim timestamps so stale in-flight claims can be released after a
/// bounded window.
fn migrate_v2_claim_tracking(conn: &Connection) -> StoreResult<()> {
    info!("Applying migration v2: claim tracking");

    conn.execute_batch(
        "
        ALTER TABLE samples ADD COLUMN claimed_at INTEGER;

        CREATE INDEX IF NOT EXISTS idx_samples_message_id
            ON samples(message_id);
        ",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_migrates_to_current() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent_across_runs() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        // A second run must be a no-op; v2's ALTER TABLE would fail if the
        // version gate did not hold it back.
        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn test_v1_database_gains_claim_column() {
        let conn = Connection::open_in_memory().unwrap();
        // Simulate a database left at v1.
        conn.execute_batch(
            "CREATE TABLE conf_str (key TEXT PRIMARY KEY, value TEXT);
             CREATE TABLE conf_num (key TEXT PRIMARY KEY, value);
             CREATE TABLE samples (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                stream TEXT NOT NULL,
                timestamp INTEGER NOT NULL,
                value REAL NOT NULL,
                is_sent INTEGER NOT NULL DEFAULT 0,
                message_id INTEGER
             );
             INSERT INTO conf_num (key, value) VALUES ('schema_version', 1);",
        )
        .unwrap();

        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), CURRENT_VERSION);

        // claimed_at exists now
        conn.execute(
            "UPDATE samples SET claimed_at = 1 WHERE id = -1",
            [],
        )
        .unwrap();
    }
}
