//! Schedule controller: owns the single recurring measurement timer.
//!
//! State transitions (`start`, `reconfigure`, `stop`) are serialized by one
//! async mutex. Status reads go through a separate lock and never wait on a
//! transition in progress.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use super::engine::{deadline_after, TimerHandle};
use super::{ScheduleConfig, ScheduleError, MAX_INTERVAL_SECS};
use crate::runner::MeasurementRunner;
use crate::storage::StateStore;

/// Active schedule as seen by status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArmedStatus {
    pub config: ScheduleConfig,
    pub next_fire: Instant,
}

struct Shared {
    runner: MeasurementRunner,
    store: StateStore,
    min_interval_secs: u64,
    timer: Mutex<Option<TimerHandle>>,
    status: Arc<RwLock<Option<ArmedStatus>>>,
}

#[derive(Clone)]
pub struct ScheduleController {
    shared: Arc<Shared>,
}

impl ScheduleController {
    pub fn new(runner: MeasurementRunner, store: StateStore, min_interval_secs: u64) -> Self {
        Self {
            shared: Arc::new(Shared {
                runner,
                store,
                // A zero floor would allow a zero-length period.
                min_interval_secs: min_interval_secs.max(1),
                timer: Mutex::new(None),
                status: Arc::new(RwLock::new(None)),
            }),
        }
    }

    pub fn min_interval_secs(&self) -> u64 {
        self.shared.min_interval_secs
    }

    /// Arm the timer. Fails with [`ScheduleError::AlreadyArmed`] if a
    /// schedule is active; use [`ScheduleController::reconfigure`] instead.
    pub async fn start(&self, cfg: ScheduleConfig) -> Result<(), ScheduleError> {
        cfg.validate(self.shared.min_interval_secs)?;

        let mut timer = self.shared.timer.lock().await;
        if timer.is_some() {
            return Err(ScheduleError::AlreadyArmed);
        }
        *timer = Some(self.arm(cfg).await);
        Ok(())
    }

    /// Replace the active schedule with `cfg` and persist it.
    ///
    /// The old timer is fully stopped before the new one is armed. If the
    /// store rejects the write, the previous schedule is re-armed and the
    /// error returned.
    pub async fn reconfigure(&self, cfg: ScheduleConfig) -> Result<(), ScheduleError> {
        cfg.validate(self.shared.min_interval_secs)?;

        let mut timer = self.shared.timer.lock().await;
        let previous = self.current().await;

        if let Some(old) = timer.take() {
            old.cancel().await;
        }
        *self.shared.status.write().await = None;

        if let Err(e) = self.shared.store.put_schedule(&cfg) {
            if let Some(prev) = previous {
                warn!(error = %e, "failed to persist schedule, restoring previous one");
                *timer = Some(self.arm(prev).await);
            }
            return Err(e.into());
        }

        *timer = Some(self.arm(cfg).await);
        info!(
            interval_secs = cfg.interval_secs,
            server_id = ?cfg.server_id,
            "schedule reconfigured"
        );
        Ok(())
    }

    /// Validate and persist `cfg` without arming it, for a process that does
    /// not run the schedule itself. The next [`ScheduleController::resume`]
    /// picks it up. Fails with [`ScheduleError::AlreadyArmed`] while this
    /// controller has a timer.
    pub async fn save(&self, cfg: ScheduleConfig) -> Result<(), ScheduleError> {
        cfg.validate(self.shared.min_interval_secs)?;

        let timer = self.shared.timer.lock().await;
        if timer.is_some() {
            return Err(ScheduleError::AlreadyArmed);
        }
        self.shared.store.put_schedule(&cfg)?;
        info!(
            interval_secs = cfg.interval_secs,
            server_id = ?cfg.server_id,
            "schedule saved for next start"
        );
        Ok(())
    }

    /// Disarm the timer. A no-op when already stopped.
    pub async fn stop(&self) {
        let mut timer = self.shared.timer.lock().await;
        if let Some(old) = timer.take() {
            old.cancel().await;
            info!("schedule stopped");
        }
        *self.shared.status.write().await = None;
    }

    /// Load the persisted schedule (or `default`) and arm it.
    ///
    /// A stored interval outside the accepted range (the floor was raised
    /// since it was saved, or an older build stored an oversized value) is
    /// clamped rather than rejected.
    pub async fn resume(&self, default: ScheduleConfig) -> Result<ScheduleConfig, ScheduleError> {
        let mut cfg = match self.shared.store.get_schedule()? {
            Some(cfg) => cfg,
            None => {
                info!(interval_secs = default.interval_secs, "no stored schedule, using default");
                default
            }
        };

        let min = self.shared.min_interval_secs;
        if cfg.interval_secs < min {
            warn!(
                stored = cfg.interval_secs,
                minimum = min,
                "stored interval below minimum, clamping"
            );
            cfg.interval_secs = min;
        } else if cfg.interval_secs > MAX_INTERVAL_SECS {
            warn!(
                stored = cfg.interval_secs,
                maximum = MAX_INTERVAL_SECS,
                "stored interval above maximum, clamping"
            );
            cfg.interval_secs = MAX_INTERVAL_SECS;
        }

        self.start(cfg).await?;
        Ok(cfg)
    }

    /// The armed configuration, `None` when stopped.
    pub async fn current(&self) -> Option<ScheduleConfig> {
        self.shared.status.read().await.map(|s| s.config)
    }

    /// Time until the next firing, `None` when stopped.
    pub async fn next_fire_in(&self) -> Option<Duration> {
        self.shared
            .status
            .read()
            .await
            .map(|s| s.next_fire.saturating_duration_since(Instant::now()))
    }

    /// Wall-clock time of the next firing, `None` when stopped.
    pub async fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        let remaining = self.next_fire_in().await?;
        let remaining = chrono::Duration::from_std(remaining).ok()?;
        Utc::now().checked_add_signed(remaining)
    }

    async fn arm(&self, cfg: ScheduleConfig) -> TimerHandle {
        let first_fire = deadline_after(Instant::now(), cfg.interval_secs);
        *self.shared.status.write().await = Some(ArmedStatus {
            config: cfg,
            next_fire: first_fire,
        });
        TimerHandle::spawn(
            self.shared.runner.clone(),
            cfg,
            first_fire,
            self.shared.status.clone(),
        )
    }
}
