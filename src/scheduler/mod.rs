//! Measurement scheduling: the run gate, manual-trigger cooldown, and the
//! recurring timer controller.

pub mod controller;
pub mod cooldown;
pub mod gate;
mod engine;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StoreError;

pub use self::controller::ScheduleController;
pub use self::gate::{GateGuard, RunGate, SqliteGate};

/// Interval floor used when no configuration overrides it.
pub const DEFAULT_MIN_INTERVAL_SECS: u64 = 300;

/// Longest accepted interval: 366 days.
pub const MAX_INTERVAL_SECS: u64 = 366 * 24 * 60 * 60;

/// Recurring measurement configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub interval_secs: u64,
    /// Fixed server for scheduled runs; `None` lets the probe pick.
    #[serde(default)]
    pub server_id: Option<u32>,
}

impl ScheduleConfig {
    /// Reject intervals below `min_interval_secs` or above
    /// [`MAX_INTERVAL_SECS`].
    pub fn validate(&self, min_interval_secs: u64) -> Result<(), ScheduleError> {
        if self.interval_secs < min_interval_secs || self.interval_secs > MAX_INTERVAL_SECS {
            return Err(ScheduleError::InvalidInterval {
                requested: self.interval_secs,
                minimum: min_interval_secs,
                maximum: MAX_INTERVAL_SECS,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("interval {requested}s is outside the allowed range of {minimum}s to {maximum}s")]
    InvalidInterval {
        requested: u64,
        minimum: u64,
        maximum: u64,
    },

    #[error("schedule is already armed")]
    AlreadyArmed,

    #[error("not authorized to change the schedule")]
    Unauthorized,

    #[error(transparent)]
    Store(#[from] StoreError),
}
