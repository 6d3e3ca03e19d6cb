//! Ookla JSON output: parse successful reports, extract failure diagnostics.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::storage::MeasurementRecord;

/// Bytes per second in one megabit per second.
pub const BYTES_PER_SEC_PER_MBPS: f64 = 125_000.0;

/// Parsed `speedtest --format=json` result (subset of fields we care about).
#[derive(Debug, Deserialize)]
pub struct SpeedReport {
    pub ping: Ping,
    pub download: Transfer,
    pub upload: Transfer,
    pub result: ResultLink,
    #[serde(default)]
    pub server: Option<ServerInfo>,
}

#[derive(Debug, Deserialize)]
pub struct Ping {
    pub latency: f64,
}

#[derive(Debug, Deserialize)]
pub struct Transfer {
    /// Bytes per second.
    pub bandwidth: f64,
}

#[derive(Debug, Deserialize)]
pub struct ResultLink {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
}

impl SpeedReport {
    pub fn into_record(self, timestamp: DateTime<Utc>) -> MeasurementRecord {
        let (server_id, server_name) = match self.server {
            Some(s) => (s.id, s.name),
            None => (None, None),
        };
        MeasurementRecord {
            timestamp,
            download_mbps: self.download.bandwidth / BYTES_PER_SEC_PER_MBPS,
            upload_mbps: self.upload.bandwidth / BYTES_PER_SEC_PER_MBPS,
            latency_ms: self.ping.latency,
            result_url: self.result.url,
            server_id,
            server_name,
        }
    }
}

/// Parse the stdout of a successful run.
pub fn parse_report(json_str: &str) -> Result<SpeedReport> {
    let report: SpeedReport = serde_json::from_str(json_str.trim())?;
    for (field, value) in [
        ("download.bandwidth", report.download.bandwidth),
        ("upload.bandwidth", report.upload.bandwidth),
        ("ping.latency", report.ping.latency),
    ] {
        if !value.is_finite() || value < 0.0 {
            bail!("{} is negative or not finite: {}", field, value);
        }
    }
    Ok(report)
}

/// Best human-readable message from a failed run.
///
/// The CLI logs JSON lines such as
/// `{"type":"log","level":"error","message":"..."}` or `{"error":"..."}`.
/// The last error-level message wins; otherwise any message; otherwise the
/// raw text.
pub fn diagnostic_message(stderr: &str, stdout: &str, exit_code: Option<i32>) -> String {
    for text in [stderr, stdout] {
        if let Some(msg) = structured_message(text) {
            return msg;
        }
    }

    let raw = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    if !raw.is_empty() {
        return raw.to_string();
    }

    match exit_code {
        Some(code) => format!("speedtest exited with status {}", code),
        None => "speedtest terminated by signal".to_string(),
    }
}

fn structured_message(text: &str) -> Option<String> {
    let mut fallback = None;
    let mut error = None;

    for line in text.lines() {
        let Ok(value) = serde_json::from_str::<serde_json::Value>(line.trim()) else {
            continue;
        };
        let msg = value
            .get("error")
            .or_else(|| value.get("message"))
            .and_then(|m| m.as_str())
            .map(str::to_string);
        let Some(msg) = msg else { continue };

        let is_error = value.get("error").is_some()
            || value.get("level").and_then(|l| l.as_str()) == Some("error");
        if is_error {
            error = Some(msg);
        } else {
            fallback = Some(msg);
        }
    }

    error.or(fallback)
}
