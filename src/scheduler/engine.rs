//! Recurring timer task driven by the schedule controller.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::controller::ArmedStatus;
use super::{ScheduleConfig, MAX_INTERVAL_SECS};
use crate::runner::{MeasurementRunner, RunError, Trigger};

/// A running timer. Only [`TimerHandle::cancel`] stops it deterministically.
pub(super) struct TimerHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TimerHandle {
    pub(super) fn spawn(
        runner: MeasurementRunner,
        config: ScheduleConfig,
        first_fire: Instant,
        status: Arc<RwLock<Option<ArmedStatus>>>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(timer_loop(runner, config, first_fire, status, shutdown_rx));
        Self {
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Signal the timer and wait for its task to exit. Once this returns the
    /// old timer cannot fire again.
    pub(super) async fn cancel(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            if e.is_panic() {
                error!(error = %e, "schedule timer panicked");
            }
        }
    }
}

async fn timer_loop(
    runner: MeasurementRunner,
    config: ScheduleConfig,
    first_fire: Instant,
    status: Arc<RwLock<Option<ArmedStatus>>>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut deadline = first_fire;
    info!(interval_secs = config.interval_secs, server_id = ?config.server_id, "schedule timer started");

    loop {
        tokio::select! {
            biased;
            // Fires on an explicit cancel or when the handle is dropped.
            _ = &mut shutdown => break,
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let fired_at = Instant::now();
        deadline = next_deadline(deadline, fired_at, config.interval_secs);
        if let Some(s) = status.write().await.as_mut() {
            s.next_fire = deadline;
        }

        fire(runner.clone(), config.server_id);
    }

    debug!(interval_secs = config.interval_secs, "schedule timer stopped");
}

/// `from + interval_secs`, capped at [`MAX_INTERVAL_SECS`] if the sum would
/// not fit in an `Instant`.
pub(super) fn deadline_after(from: Instant, interval_secs: u64) -> Instant {
    from.checked_add(Duration::from_secs(interval_secs))
        .unwrap_or_else(|| from + Duration::from_secs(MAX_INTERVAL_SECS))
}

/// Deadline following `deadline`. If the runtime stalled past a whole
/// period, the missed ticks are skipped.
fn next_deadline(deadline: Instant, fired_at: Instant, interval_secs: u64) -> Instant {
    let next = deadline_after(deadline, interval_secs);
    if next <= fired_at {
        deadline_after(fired_at, interval_secs)
    } else {
        next
    }
}

/// Fire-and-forget: the outcome is only observable through the store.
fn fire(runner: MeasurementRunner, server_id: Option<u32>) {
    tokio::spawn(async move {
        match runner.run(server_id, Trigger::Scheduled).await {
            Ok(record) => info!(
                download_mbps = record.download_mbps,
                upload_mbps = record.upload_mbps,
                "scheduled measurement stored"
            ),
            Err(RunError::Busy) => {
                warn!("scheduled measurement skipped, another run is in progress")
            }
            Err(e) => error!(error = %e, "scheduled measurement failed"),
        }
    });
}
