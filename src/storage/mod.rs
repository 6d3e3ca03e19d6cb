//! SQLite storage layer -- measurement history, schedule and cooldown singletons.
//!
//! Every write is a single autocommit statement on a `synchronous = FULL`
//! connection, so it is on disk before the call returns. Crash recovery in the
//! scheduler relies on that.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::ScheduleConfig;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt {table} row: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: impl AsRef<Path>) -> Result<Pool> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = FULL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)
        .with_context(|| format!("failed to open database {}", path.display()))?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn).context("failed to migrate database schema")?;

    Ok(pool)
}

/// One completed bandwidth measurement. Rates are in Mbps, latency in ms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRecord {
    pub timestamp: DateTime<Utc>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
    pub result_url: String,
    pub server_id: Option<u32>,
    pub server_name: Option<String>,
}

/// Last time a measurement was attempted, `None` before the first run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CooldownState {
    pub last_attempt: Option<DateTime<Utc>>,
}

/// Fixed-width RFC 3339 so lexical order in SQLite matches time order.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(table: &'static str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            table,
            detail: format!("bad timestamp '{}': {}", raw, e),
        })
}

/// Durable state for the measurement subsystem.
#[derive(Clone)]
pub struct StateStore {
    pool: Pool,
}

impl StateStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// The persisted schedule, or `None` if none was ever saved.
    pub fn get_schedule(&self) -> Result<Option<ScheduleConfig>, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT interval_secs, server_id FROM schedule_config WHERE id = 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<u32>>(1)?)),
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((interval, server_id)) => {
                let interval_secs = u64::try_from(interval).map_err(|_| StoreError::Corrupt {
                    table: "schedule_config",
                    detail: format!("negative interval {}", interval),
                })?;
                Ok(Some(ScheduleConfig {
                    interval_secs,
                    server_id,
                }))
            }
        }
    }

    pub fn put_schedule(&self, cfg: &ScheduleConfig) -> Result<(), StoreError> {
        let interval = i64::try_from(cfg.interval_secs).map_err(|_| StoreError::Corrupt {
            table: "schedule_config",
            detail: format!("interval {} out of range", cfg.interval_secs),
        })?;
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO schedule_config (id, interval_secs, server_id, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                interval_secs = excluded.interval_secs,
                server_id = excluded.server_id,
                updated_at = excluded.updated_at",
            params![interval, cfg.server_id, format_ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn get_cooldown(&self) -> Result<CooldownState, StoreError> {
        let conn = self.pool.get()?;
        let raw: Option<Option<String>> = conn
            .query_row(
                "SELECT last_attempt_at FROM cooldown WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let last_attempt = match raw.flatten() {
            Some(s) => Some(parse_ts("cooldown", &s)?),
            None => None,
        };
        Ok(CooldownState { last_attempt })
    }

    pub fn put_cooldown(&self, ts: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO cooldown (id, last_attempt_at) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET last_attempt_at = excluded.last_attempt_at",
            params![format_ts(ts)],
        )?;
        Ok(())
    }

    /// Append a measurement to the history.
    pub fn append_record(&self, r: &MeasurementRecord) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO measurements
                (created_at, download_mbps, upload_mbps, latency_ms, result_url, server_id, server_name)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                format_ts(r.timestamp),
                r.download_mbps,
                r.upload_mbps,
                r.latency_ms,
                r.result_url,
                r.server_id,
                r.server_name,
            ],
        )?;
        Ok(())
    }

    /// The `n` most recent measurements, newest first.
    pub fn list_recent(&self, n: usize) -> Result<Vec<MeasurementRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT created_at, download_mbps, upload_mbps, latency_ms, result_url, server_id, server_name
             FROM measurements
             ORDER BY created_at DESC, id DESC
             LIMIT ?1",
        )?;

        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<u32>>(5)?,
                row.get::<_, Option<String>>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for r in rows {
            let (created_at, download_mbps, upload_mbps, latency_ms, result_url, server_id, server_name) =
                r?;
            records.push(MeasurementRecord {
                timestamp: parse_ts("measurements", &created_at)?,
                download_mbps,
                upload_mbps,
                latency_ms,
                result_url,
                server_id,
                server_name,
            });
        }
        Ok(records)
    }
}
