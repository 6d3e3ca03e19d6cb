//! Measurement runner: gate, probe, classify, persist.

use std::sync::Arc;
use std::time::Duration;

use chrono::{SubsecRound, Utc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::probes::{report, Probe};
use crate::scheduler::cooldown::{self, CooldownDecision};
use crate::scheduler::{GateGuard, RunGate};
use crate::storage::{MeasurementRecord, StateStore, StoreError};

#[derive(Debug, Error)]
pub enum RunError {
    /// Another measurement holds the gate. Not a failure.
    #[error("a measurement is already in progress")]
    Busy,

    #[error("manual runs are cooling down, retry in {remaining_secs}s")]
    CooldownActive { remaining_secs: u64 },

    #[error("speedtest failed: {message}")]
    ProbeFailed { message: String },

    #[error("could not parse speedtest output: {message}")]
    ParseFailed { message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("measurement worker stopped unexpectedly: {0}")]
    Worker(String),
}

/// Who asked for a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Timer firing. Ignores and never starts the manual cooldown.
    Scheduled,
    /// User request, refused within `cooldown` of the last manual run.
    Manual { cooldown: Duration },
}

/// Runs one measurement at a time, whoever asks.
#[derive(Clone)]
pub struct MeasurementRunner {
    store: StateStore,
    gate: Arc<dyn RunGate>,
    probe: Arc<dyn Probe>,
}

impl MeasurementRunner {
    pub fn new(store: StateStore, gate: Arc<dyn RunGate>, probe: Arc<dyn Probe>) -> Self {
        Self { store, gate, probe }
    }

    /// Run a measurement against `server_id` (or the probe's choice).
    ///
    /// Returns [`RunError::Busy`] without side effects if the gate is held.
    /// For manual triggers the cooldown is checked and stamped while the gate
    /// is held, so two manual runs can never both pass the same window. The
    /// gate is released on every exit path.
    pub async fn run(
        &self,
        server_id: Option<u32>,
        trigger: Trigger,
    ) -> Result<MeasurementRecord, RunError> {
        let Some(_guard) = GateGuard::try_acquire(self.gate.clone())? else {
            debug!(?server_id, "run gate busy");
            return Err(RunError::Busy);
        };

        if let Trigger::Manual { cooldown: period } = trigger {
            let state = self.store.get_cooldown()?;
            if let CooldownDecision::Denied { remaining_secs } =
                cooldown::allowed(Utc::now(), state.last_attempt, period)
            {
                info!(remaining_secs, "manual measurement refused, cooling down");
                return Err(RunError::CooldownActive { remaining_secs });
            }
        }

        info!(?server_id, "starting measurement");
        let output = self
            .probe
            .invoke(server_id)
            .await
            .map_err(|e| RunError::ProbeFailed {
                message: format!("{:#}", e),
            })?;

        if !output.success() {
            let message =
                report::diagnostic_message(&output.stderr, &output.stdout, output.exit_code);
            warn!(exit_code = ?output.exit_code, %message, "speedtest reported failure");
            return Err(RunError::ProbeFailed { message });
        }

        let parsed = report::parse_report(&output.stdout).map_err(|e| RunError::ParseFailed {
            message: e.to_string(),
        })?;
        // Microseconds, matching what the store keeps.
        let record = parsed.into_record(Utc::now().trunc_subsecs(6));

        self.store.append_record(&record)?;

        if matches!(trigger, Trigger::Manual { .. }) {
            // The record is already saved; a failed stamp is logged, not returned.
            if let Err(e) = self.store.put_cooldown(record.timestamp) {
                error!(error = %e, "failed to record last manual run time");
            }
        }

        info!(
            download_mbps = record.download_mbps,
            upload_mbps = record.upload_mbps,
            latency_ms = record.latency_ms,
            server_id = ?record.server_id,
            "measurement complete"
        );
        Ok(record)
    }

    /// Run on a spawned worker task and wait for it, so the caller's task is
    /// never the one driving the probe.
    pub async fn run_on_worker(
        &self,
        server_id: Option<u32>,
        trigger: Trigger,
    ) -> Result<MeasurementRecord, RunError> {
        let runner = self.clone();
        tokio::spawn(async move { runner.run(server_id, trigger).await })
            .await
            .map_err(|e| RunError::Worker(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixture, report_json, FakeProbe, ProbeScript};

    const MANUAL: Trigger = Trigger::Manual {
        cooldown: Duration::from_secs(300),
    };

    #[tokio::test]
    async fn test_success_appends_record_and_stamps_cooldown() {
        let fx = fixture(FakeProbe::new(ProbeScript::Report(report_json(12_500_000.0))));

        let record = fx.runner.run(None, MANUAL).await.unwrap();
        assert_eq!(record.download_mbps, 100.0);

        let stored = fx.store.list_recent(10).unwrap();
        assert_eq!(stored, vec![record.clone()]);
        let cooldown = fx.store.get_cooldown().unwrap();
        assert_eq!(cooldown.last_attempt, Some(record.timestamp));
        assert!(!fx.gate.is_held().unwrap());
    }

    #[tokio::test]
    async fn test_server_id_forwarded_to_probe() {
        let probe = FakeProbe::new(ProbeScript::Report(report_json(1.0)));
        let fx = fixture(probe.clone());

        fx.runner.run(Some(4321), Trigger::Scheduled).await.unwrap();
        assert_eq!(probe.targets(), vec![Some(4321)]);
    }

    #[tokio::test]
    async fn test_concurrent_run_is_busy() {
        let probe = FakeProbe::new(ProbeScript::Report(report_json(5.0))).held();
        let fx = fixture(probe.clone());

        let runner = fx.runner.clone();
        let first = tokio::spawn(async move { runner.run(None, Trigger::Scheduled).await });
        probe.wait_started().await;

        let second = fx.runner.run(None, Trigger::Scheduled).await;
        assert!(matches!(second, Err(RunError::Busy)));
        assert_eq!(probe.calls(), 1);

        probe.finish();
        assert!(first.await.unwrap().is_ok());
        assert!(!fx.gate.is_held().unwrap());
        assert_eq!(fx.store.list_recent(10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_probe_failure_extracts_message() {
        let stderr = r#"{"type":"log","message":"Cannot open socket: Timeout occurred in connect.","level":"error"}"#;
        let fx = fixture(FakeProbe::new(ProbeScript::Exit {
            code: 2,
            stderr: stderr.to_string(),
        }));

        match fx.runner.run(None, MANUAL).await {
            Err(RunError::ProbeFailed { message }) => {
                assert_eq!(message, "Cannot open socket: Timeout occurred in connect.")
            }
            other => panic!("expected ProbeFailed, got {:?}", other),
        }
        assert!(fx.store.list_recent(10).unwrap().is_empty());
        assert_eq!(fx.store.get_cooldown().unwrap().last_attempt, None);
        assert!(!fx.gate.is_held().unwrap());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_probe_failed() {
        let fx = fixture(FakeProbe::new(ProbeScript::SpawnError));
        assert!(matches!(
            fx.runner.run(None, Trigger::Scheduled).await,
            Err(RunError::ProbeFailed { .. })
        ));
        assert!(!fx.gate.is_held().unwrap());
    }

    #[tokio::test]
    async fn test_unparseable_output_is_parse_failed() {
        let fx = fixture(FakeProbe::new(ProbeScript::Report("not json".to_string())));
        assert!(matches!(
            fx.runner.run(None, Trigger::Scheduled).await,
            Err(RunError::ParseFailed { .. })
        ));
        assert!(fx.store.list_recent(10).unwrap().is_empty());
        assert!(!fx.gate.is_held().unwrap());
    }

    #[tokio::test]
    async fn test_store_failure_releases_gate() {
        let fx = fixture(FakeProbe::new(ProbeScript::Report(report_json(12_500_000.0))));
        fx.store
            .pool()
            .get()
            .unwrap()
            .execute_batch("DROP TABLE measurements;")
            .unwrap();

        let result = fx.runner.run(None, Trigger::Scheduled).await;
        assert!(matches!(result, Err(RunError::Store(StoreError::Unavailable(_)))));
        assert!(!fx.gate.is_held().unwrap());

        // Next trigger can acquire again.
        assert!(fx.gate.try_acquire().unwrap());
    }

    #[tokio::test]
    async fn test_panicking_probe_releases_gate() {
        let fx = fixture(FakeProbe::new(ProbeScript::Panic));
        let result = fx.runner.run_on_worker(None, Trigger::Scheduled).await;
        assert!(matches!(result, Err(RunError::Worker(_))));
        assert!(!fx.gate.is_held().unwrap());
    }

    #[tokio::test]
    async fn test_busy_has_no_side_effects() {
        let probe = FakeProbe::new(ProbeScript::Report(report_json(1.0)));
        let fx = fixture(probe.clone());
        assert!(fx.gate.try_acquire().unwrap());

        assert!(matches!(fx.runner.run(None, Trigger::Scheduled).await, Err(RunError::Busy)));
        assert_eq!(probe.calls(), 0);
        // Still held by the outside holder.
        assert!(fx.gate.is_held().unwrap());
    }

    #[tokio::test]
    async fn test_scheduled_run_leaves_cooldown_alone() {
        let probe = FakeProbe::new(ProbeScript::Report(report_json(1.0)));
        let fx = fixture(probe.clone());
        let earlier = Utc::now().trunc_subsecs(6) - chrono::Duration::seconds(10);
        fx.store.put_cooldown(earlier).unwrap();

        // Inside the manual window, but timer runs don't consult it.
        fx.runner.run(None, Trigger::Scheduled).await.unwrap();
        assert_eq!(probe.calls(), 1);
        assert_eq!(fx.store.get_cooldown().unwrap().last_attempt, Some(earlier));
    }

    #[tokio::test]
    async fn test_manual_cooldown_denial_has_no_side_effects() {
        let probe = FakeProbe::new(ProbeScript::Report(report_json(1.0)));
        let fx = fixture(probe.clone());
        fx.store
            .put_cooldown(Utc::now() - chrono::Duration::seconds(100))
            .unwrap();

        match fx.runner.run(None, MANUAL).await {
            Err(RunError::CooldownActive { remaining_secs }) => {
                assert!((199..=200).contains(&remaining_secs))
            }
            other => panic!("expected cooldown, got {:?}", other),
        }
        assert_eq!(probe.calls(), 0);
        assert!(fx.store.list_recent(10).unwrap().is_empty());
        assert!(!fx.gate.is_held().unwrap());
    }

    #[tokio::test]
    async fn test_manual_run_queued_behind_another_sees_its_stamp() {
        let probe = FakeProbe::new(ProbeScript::Report(report_json(5.0))).held();
        let fx = fixture(probe.clone());

        let runner = fx.runner.clone();
        let first = tokio::spawn(async move { runner.run(None, MANUAL).await });
        probe.wait_started().await;
        // Cooldown is still clear here; the gate is what turns this away.
        assert_eq!(fx.store.get_cooldown().unwrap().last_attempt, None);
        assert!(matches!(fx.runner.run(None, MANUAL).await, Err(RunError::Busy)));

        probe.finish();
        first.await.unwrap().unwrap();

        // The stamp was written before the gate was released.
        assert!(matches!(
            fx.runner.run(None, MANUAL).await,
            Err(RunError::CooldownActive { .. })
        ));
        assert_eq!(probe.calls(), 1);
    }
}
