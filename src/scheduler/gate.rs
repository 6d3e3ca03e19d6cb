//! Run gate: at most one measurement at a time, across threads and processes.
//!
//! The flag lives in the `run_lock` row so it is visible to every process
//! sharing the database (the daemon and one-shot CLI runs). A crash while
//! holding it leaves the row set; [`RunGate::reconcile`] clears it on the next
//! start when the recorded owner is gone.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::storage::{format_ts, parse_ts, Pool, StoreError};

/// Snapshot of the gate for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockStatus {
    pub held: bool,
    pub owner_pid: Option<u32>,
    pub acquired_at: Option<DateTime<Utc>>,
}

/// Mutual-exclusion flag shared by manual and scheduled runs.
pub trait RunGate: Send + Sync {
    /// Atomic test-and-set. Never waits for the current holder.
    fn try_acquire(&self) -> Result<bool, StoreError>;

    /// Release if held by this gate. Releasing an unheld gate is a no-op.
    fn release(&self) -> Result<(), StoreError>;

    fn status(&self) -> Result<LockStatus, StoreError>;

    /// Clear a flag left behind by an owner that no longer exists.
    /// Returns `true` if a stale flag was cleared.
    fn reconcile(&self) -> Result<bool, StoreError>;

    fn is_held(&self) -> Result<bool, StoreError> {
        Ok(self.status()?.held)
    }
}

/// Holds the gate for its lifetime and releases it on drop, including
/// during unwinding.
pub struct GateGuard {
    gate: Arc<dyn RunGate>,
}

impl GateGuard {
    /// `Ok(None)` means someone else holds the gate.
    pub fn try_acquire(gate: Arc<dyn RunGate>) -> Result<Option<Self>, StoreError> {
        if gate.try_acquire()? {
            Ok(Some(Self { gate }))
        } else {
            Ok(None)
        }
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if let Err(e) = self.gate.release() {
            error!(error = %e, "failed to release run gate");
        }
    }
}

/// [`RunGate`] backed by the `run_lock` table.
///
/// Each instance has its own owner id; create one per process.
pub struct SqliteGate {
    pool: Pool,
    owner: String,
    pid: u32,
    /// `boot_id:start_time` of this process, `None` where it can't be read.
    identity: Option<String>,
    /// In-process holder flag, checked before touching the database.
    active: AtomicBool,
}

impl SqliteGate {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            owner: uuid::Uuid::new_v4().to_string(),
            pid: std::process::id(),
            identity: process_identity(std::process::id()),
            active: AtomicBool::new(false),
        }
    }

    /// Clear the flag regardless of owner. Operator recovery only.
    pub fn force_release(&self) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let changed = conn.execute(
            "UPDATE run_lock
             SET held = 0, owner = NULL, pid = NULL, owner_start = NULL, acquired_at = NULL
             WHERE id = 1 AND held = 1",
            [],
        )?;
        self.active.store(false, Ordering::SeqCst);
        Ok(changed == 1)
    }
}

impl RunGate for SqliteGate {
    fn try_acquire(&self) -> Result<bool, StoreError> {
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(false);
        }

        // `owner = ?1` reclaims a row whose release failed earlier in this
        // process; `active` already guarantees nobody here holds it.
        let result = self.pool.get().map_err(StoreError::from).and_then(|conn| {
            conn.execute(
                "UPDATE run_lock
                 SET held = 1, owner = ?1, pid = ?2, owner_start = ?3, acquired_at = ?4
                 WHERE id = 1 AND (held = 0 OR owner = ?1)",
                params![self.owner, self.pid, self.identity, format_ts(Utc::now())],
            )
            .map_err(StoreError::from)
        });

        match result {
            Ok(1) => {
                debug!(owner = %self.owner, "run gate acquired");
                Ok(true)
            }
            Ok(_) => {
                self.active.store(false, Ordering::SeqCst);
                Ok(false)
            }
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn release(&self) -> Result<(), StoreError> {
        if !self.active.load(Ordering::SeqCst) {
            return Ok(());
        }

        let result = self.pool.get().map_err(StoreError::from).and_then(|conn| {
            conn.execute(
                "UPDATE run_lock
                 SET held = 0, owner = NULL, pid = NULL, owner_start = NULL, acquired_at = NULL
                 WHERE id = 1 AND owner = ?1",
                params![self.owner],
            )
            .map_err(StoreError::from)
        });

        // Cleared even on failure; the next acquire here reclaims the row.
        self.active.store(false, Ordering::SeqCst);
        result?;
        debug!(owner = %self.owner, "run gate released");
        Ok(())
    }

    fn status(&self) -> Result<LockStatus, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT held, pid, acquired_at FROM run_lock WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<u32>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((held, owner_pid, acquired_at)) = row else {
            return Ok(LockStatus {
                held: false,
                owner_pid: None,
                acquired_at: None,
            });
        };

        let acquired_at = match acquired_at {
            Some(raw) => Some(parse_ts("run_lock", &raw)?),
            None => None,
        };
        Ok(LockStatus {
            held: held != 0,
            owner_pid,
            acquired_at,
        })
    }

    fn reconcile(&self) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let row = conn
            .query_row(
                "SELECT held, owner, pid, owner_start FROM run_lock WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<u32>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((held, owner, pid, owner_start)) = row else {
            return Ok(false);
        };
        if held == 0 || owner.as_deref() == Some(self.owner.as_str()) {
            return Ok(false);
        }

        if let Some(pid) = pid {
            if owner_alive(pid, owner_start.as_deref()) {
                warn!(pid, "run gate held by a live process, leaving it");
                return Ok(false);
            }
        }

        let changed = conn.execute(
            "UPDATE run_lock
             SET held = 0, owner = NULL, pid = NULL, owner_start = NULL, acquired_at = NULL
             WHERE id = 1 AND held = 1 AND owner IS ?1",
            params![owner],
        )?;
        if changed == 1 {
            info!(?pid, "cleared stale run gate left by a previous process");
        }
        Ok(changed == 1)
    }
}

/// Whether the process that wrote `pid` may still be running.
///
/// A pid alone can't tell the owner apart from an unrelated process that got
/// the same pid later (after a reboot, or in a container where the daemon is
/// pid 1), so the owner's recorded identity has to match too. Rows without an
/// identity are treated as stale.
fn owner_alive(pid: u32, recorded: Option<&str>) -> bool {
    if pid == std::process::id() {
        return false;
    }
    let Some(recorded) = recorded else {
        return false;
    };
    if !cfg!(target_os = "linux") {
        // No cheap liveness check elsewhere; treat the owner as gone.
        return false;
    }
    if !std::path::Path::new(&format!("/proc/{}", pid)).exists() {
        return false;
    }
    match process_identity(pid) {
        Some(current) => current == recorded,
        // Running but unreadable (e.g. hidepid); don't steal from it.
        None => true,
    }
}

/// `boot_id:start_time` for `pid`. Unique for the life of the machine, unlike
/// the pid itself.
#[cfg(target_os = "linux")]
fn process_identity(pid: u32) -> Option<String> {
    let boot_id = std::fs::read_to_string("/proc/sys/kernel/random/boot_id").ok()?;
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    let start_time = parse_start_time(&stat)?;
    Some(format!("{}:{}", boot_id.trim(), start_time))
}

#[cfg(not(target_os = "linux"))]
fn process_identity(_pid: u32) -> Option<String> {
    None
}

/// Field 22 of `/proc/<pid>/stat`. The command name (field 2) may contain
/// spaces and parentheses, so fields are counted from the last `)`.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_start_time(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().nth(19)?.parse().ok()
}
