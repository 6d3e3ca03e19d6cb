//! Database schema and migrations.

use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS measurements (
            id INTEGER PRIMARY KEY,
            created_at TEXT NOT NULL,
            download_mbps REAL NOT NULL,
            upload_mbps REAL NOT NULL,
            latency_ms REAL NOT NULL,
            result_url TEXT NOT NULL,
            server_id INTEGER,
            server_name TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_measurements_created ON measurements(created_at);

        CREATE TABLE IF NOT EXISTS schedule_config (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            interval_secs INTEGER NOT NULL,
            server_id INTEGER,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS cooldown (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_attempt_at TEXT
        );

        CREATE TABLE IF NOT EXISTS run_lock (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            held INTEGER NOT NULL DEFAULT 0,
            owner TEXT,
            pid INTEGER,
            acquired_at TEXT
        );
        INSERT OR IGNORE INTO run_lock (id, held) VALUES (1, 0);
        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;

    // v2: boot id and start time of the lock owner, so a reused pid is not
    // mistaken for the owner.
    let has_owner_start: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('run_lock') WHERE name = 'owner_start'",
        [],
        |row| row.get(0),
    )?;
    if !has_owner_start {
        conn.execute_batch("ALTER TABLE run_lock ADD COLUMN owner_start TEXT;")?;
    }
    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (2)", [])?;

    Ok(())
}
