//! Operational surface of the measurement subsystem.
//!
//! [`SpeedService`] wires the store, gate, runner and schedule controller
//! together and is what the HTTP layer and the CLI talk to.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AppConfig, ScheduleSettings};
use crate::directory::{DirectoryClient, ServerList};
use crate::probes::{OoklaCli, Probe};
use crate::runner::{MeasurementRunner, RunError, Trigger};
use crate::scheduler::cooldown::{self, CooldownDecision};
use crate::scheduler::gate::LockStatus;
use crate::scheduler::{RunGate, ScheduleConfig, ScheduleController, ScheduleError, SqliteGate};
use crate::storage::{MeasurementRecord, Pool, StateStore, StoreError};

/// Who is asking, as far as the transport knows.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub client_addr: Option<IpAddr>,
}

/// Decides whether a caller may change the schedule.
pub trait AccessPolicy: Send + Sync {
    fn authorize(&self, ctx: &RequestContext) -> bool;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleStatus {
    /// `None` when no schedule is armed.
    pub active: Option<ScheduleConfig>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub min_interval_secs: u64,
}

pub struct SpeedService {
    store: StateStore,
    gate: Arc<SqliteGate>,
    runner: MeasurementRunner,
    controller: ScheduleController,
    directory: DirectoryClient,
    policy: Arc<dyn AccessPolicy>,
    cooldown: Duration,
    default_schedule: ScheduleConfig,
}

impl SpeedService {
    pub fn new(
        pool: Pool,
        probe: Arc<dyn Probe>,
        directory: DirectoryClient,
        policy: Arc<dyn AccessPolicy>,
        settings: &ScheduleSettings,
    ) -> Self {
        let store = StateStore::new(pool.clone());
        let gate = Arc::new(SqliteGate::new(pool));
        let runner = MeasurementRunner::new(store.clone(), gate.clone(), probe);
        let controller =
            ScheduleController::new(runner.clone(), store.clone(), settings.min_interval_secs);

        Self {
            store,
            gate,
            runner,
            controller,
            directory,
            policy,
            cooldown: Duration::from_secs(settings.cooldown_secs),
            default_schedule: settings.default_schedule(),
        }
    }

    /// Build with the Ookla CLI probe and the configured directory.
    pub fn from_config(config: &AppConfig, pool: Pool, policy: Arc<dyn AccessPolicy>) -> Result<Self> {
        let probe = Arc::new(OoklaCli::new(
            config.probe.path.clone(),
            config.probe.extra_args.clone(),
        ));
        let directory = DirectoryClient::new(
            config.directory.url.clone(),
            Duration::from_secs(config.directory.timeout_secs),
        )?;
        Ok(Self::new(pool, probe, directory, policy, &config.schedule))
    }

    /// Startup recovery: clear a gate left by a crashed process, then arm the
    /// persisted schedule.
    pub async fn bootstrap(&self) -> Result<ScheduleConfig, ScheduleError> {
        if self.gate.reconcile()? {
            warn!("previous run did not finish cleanly; run gate reset");
        }
        let cfg = self.controller.resume(self.default_schedule).await?;
        info!(
            interval_secs = cfg.interval_secs,
            server_id = ?cfg.server_id,
            "measurement schedule armed"
        );
        Ok(cfg)
    }

    pub async fn shutdown(&self) {
        self.controller.stop().await;
    }

    /// User-requested measurement. Subject to the gate and the cooldown.
    pub async fn trigger_manual(
        &self,
        server_id: Option<u32>,
    ) -> Result<MeasurementRecord, RunError> {
        let trigger = Trigger::Manual {
            cooldown: self.cooldown,
        };
        self.runner.run_on_worker(server_id, trigger).await
    }

    pub fn cooldown_status(&self) -> Result<CooldownDecision, StoreError> {
        let state = self.store.get_cooldown()?;
        Ok(cooldown::allowed(Utc::now(), state.last_attempt, self.cooldown))
    }

    pub fn recent_results(&self, n: usize) -> Result<Vec<MeasurementRecord>, StoreError> {
        self.store.list_recent(n)
    }

    pub async fn schedule(&self) -> ScheduleStatus {
        ScheduleStatus {
            active: self.controller.current().await,
            next_run_at: self.controller.next_fire_time().await,
            min_interval_secs: self.controller.min_interval_secs(),
        }
    }

    pub async fn set_schedule(
        &self,
        ctx: &RequestContext,
        cfg: ScheduleConfig,
    ) -> Result<ScheduleStatus, ScheduleError> {
        if !self.policy.authorize(ctx) {
            warn!(client = ?ctx.client_addr, "schedule change refused");
            return Err(ScheduleError::Unauthorized);
        }
        self.controller.reconfigure(cfg).await?;
        Ok(self.schedule().await)
    }

    /// Persist a schedule for the next daemon start. Only for a local
    /// process that found no daemon to send the change to.
    pub async fn save_schedule(&self, cfg: ScheduleConfig) -> Result<(), ScheduleError> {
        self.controller.save(cfg).await
    }

    pub fn lock_status(&self) -> Result<LockStatus, StoreError> {
        self.gate.status()
    }

    pub async fn servers(&self, limit: usize) -> ServerList {
        self.directory.fetch(limit).await
    }
}
