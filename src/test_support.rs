//! Fakes shared by unit tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::probes::{Probe, ProbeOutput};
use crate::runner::MeasurementRunner;
use crate::scheduler::SqliteGate;
use crate::storage::{open_pool, StateStore};

pub enum ProbeScript {
    /// Exit 0 with this stdout.
    Report(String),
    Exit { code: i32, stderr: String },
    SpawnError,
    Panic,
}

struct FakeInner {
    script: ProbeScript,
    hold: AtomicBool,
    started: Notify,
    proceed: Notify,
    targets: Mutex<Vec<Option<u32>>>,
    invoked_at: Mutex<Vec<Instant>>,
}

/// Scripted probe that records every invocation.
#[derive(Clone)]
pub struct FakeProbe {
    inner: Arc<FakeInner>,
}

impl FakeProbe {
    pub fn new(script: ProbeScript) -> Self {
        Self {
            inner: Arc::new(FakeInner {
                script,
                hold: AtomicBool::new(false),
                started: Notify::new(),
                proceed: Notify::new(),
                targets: Mutex::new(Vec::new()),
                invoked_at: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Block each invocation until [`FakeProbe::finish`] is called.
    pub fn held(self) -> Self {
        self.inner.hold.store(true, Ordering::SeqCst);
        self
    }

    pub async fn wait_started(&self) {
        self.inner.started.notified().await;
    }

    pub fn finish(&self) {
        self.inner.proceed.notify_one();
    }

    pub fn calls(&self) -> usize {
        self.inner.targets.lock().unwrap().len()
    }

    pub fn targets(&self) -> Vec<Option<u32>> {
        self.inner.targets.lock().unwrap().clone()
    }

    pub fn invoked_at(&self) -> Vec<Instant> {
        self.inner.invoked_at.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Probe for FakeProbe {
    async fn invoke(&self, server_id: Option<u32>) -> Result<ProbeOutput> {
        self.inner.targets.lock().unwrap().push(server_id);
        self.inner.invoked_at.lock().unwrap().push(Instant::now());

        if self.inner.hold.load(Ordering::SeqCst) {
            self.inner.started.notify_one();
            self.inner.proceed.notified().await;
        }

        match &self.inner.script {
            ProbeScript::Report(stdout) => Ok(ProbeOutput {
                exit_code: Some(0),
                stdout: stdout.clone(),
                stderr: String::new(),
            }),
            ProbeScript::Exit { code, stderr } => Ok(ProbeOutput {
                exit_code: Some(*code),
                stdout: String::new(),
                stderr: stderr.clone(),
            }),
            ProbeScript::SpawnError => Err(anyhow!("No such file or directory (os error 2)")),
            ProbeScript::Panic => panic!("probe crashed"),
        }
    }
}

/// Minimal successful speedtest JSON.
pub fn report_json(download_bytes_per_sec: f64) -> String {
    serde_json::json!({
        "type": "result",
        "ping": { "latency": 9.5 },
        "download": { "bandwidth": download_bytes_per_sec },
        "upload": { "bandwidth": 1_250_000.0 },
        "server": { "id": 4321, "name": "Example Telecom" },
        "result": { "url": "https://www.speedtest.net/result/c/test" }
    })
    .to_string()
}

pub struct Fixture {
    pub _dir: tempfile::TempDir,
    pub store: StateStore,
    pub gate: Arc<SqliteGate>,
    pub runner: MeasurementRunner,
}

pub fn fixture(probe: FakeProbe) -> Fixture {
    let dir = tempfile::TempDir::new().unwrap();
    let pool = open_pool(dir.path().join("speedwarden.db")).unwrap();
    let store = StateStore::new(pool.clone());
    let gate = Arc::new(SqliteGate::new(pool));
    let runner = MeasurementRunner::new(store.clone(), gate.clone(), Arc::new(probe));
    Fixture {
        _dir: dir,
        store,
        gate,
        runner,
    }
}
