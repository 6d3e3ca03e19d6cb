//! Client for a running daemon's HTTP API.
//!
//! The CLI sends schedule changes here first so they reach the live timer and
//! pass the daemon's access policy.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::scheduler::ScheduleConfig;
use crate::service::ScheduleStatus;

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

pub struct DaemonClient {
    http: reqwest::Client,
    base_url: String,
}

impl DaemonClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("speedwarden/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Client for a daemon bound to `bind` (`[server] bind`). A wildcard
    /// bind is reached over loopback.
    pub fn for_bind(bind: &str, timeout: Duration) -> Result<Self> {
        let addr: SocketAddr = bind
            .parse()
            .with_context(|| format!("invalid bind address '{}'", bind))?;
        Self::new(format!("http://{}", local_target(addr)), timeout)
    }

    /// `PUT /api/v1/schedule`. `Ok(None)` means no daemon is listening; a
    /// refusal comes back as `Err` carrying the daemon's message.
    pub async fn put_schedule(&self, cfg: &ScheduleConfig) -> Result<Option<ScheduleStatus>> {
        let url = format!("{}/api/v1/schedule", self.base_url);
        let resp = match self.http.put(&url).json(cfg).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_connect() => {
                debug!(%url, error = %e, "no daemon listening");
                return Ok(None);
            }
            Err(e) => return Err(e).context("schedule request to daemon failed"),
        };

        let status = resp.status();
        if status.is_success() {
            let body: Envelope<ScheduleStatus> = resp
                .json()
                .await
                .context("unexpected daemon response")?;
            return Ok(Some(body.data));
        }

        match resp.json::<ErrorEnvelope>().await {
            Ok(body) => bail!(
                "daemon refused the schedule ({}): {}",
                body.error.code,
                body.error.message
            ),
            Err(_) => bail!("daemon refused the schedule with status {}", status),
        }
    }
}

fn local_target(addr: SocketAddr) -> SocketAddr {
    match addr.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), addr.port())
        }
        _ => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn cfg() -> ScheduleConfig {
        ScheduleConfig {
            interval_secs: 900,
            server_id: Some(12),
        }
    }

    #[test]
    fn test_wildcard_bind_targets_loopback() {
        let target = |s: &str| local_target(s.parse().unwrap()).to_string();
        assert_eq!(target("0.0.0.0:5000"), "127.0.0.1:5000");
        assert_eq!(target("[::]:5000"), "[::1]:5000");
        assert_eq!(target("192.168.1.4:8080"), "192.168.1.4:8080");
        assert!(DaemonClient::for_bind("not-an-address", Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_applied_schedule_returns_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/schedule"))
            .and(body_json(json!({ "interval_secs": 900, "server_id": 12 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": {
                    "active": { "interval_secs": 900, "server_id": 12 },
                    "next_run_at": "2026-10-19T12:15:00Z",
                    "min_interval_secs": 300
                },
                "meta": { "version": "0.1.0" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = DaemonClient::for_bind(&server.address().to_string(), Duration::from_secs(5))
            .unwrap();
        let status = client.put_schedule(&cfg()).await.unwrap().unwrap();
        assert_eq!(status.active, Some(cfg()));
        assert!(status.next_run_at.is_some());
        assert_eq!(status.min_interval_secs, 300);
    }

    #[tokio::test]
    async fn test_refusal_carries_daemon_message() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/schedule"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {
                    "code": "unauthorized",
                    "message": "not authorized to change the schedule"
                }
            })))
            .mount(&server)
            .await;

        let client = DaemonClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.put_schedule(&cfg()).await.unwrap_err().to_string();
        assert!(err.contains("unauthorized"), "{}", err);
        assert!(err.contains("not authorized"), "{}", err);
    }

    #[tokio::test]
    async fn test_refusal_without_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = DaemonClient::new(server.uri(), Duration::from_secs(5)).unwrap();
        let err = client.put_schedule(&cfg()).await.unwrap_err().to_string();
        assert!(err.contains("500"), "{}", err);
    }

    #[tokio::test]
    async fn test_no_daemon_is_none() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client =
            DaemonClient::for_bind(&format!("127.0.0.1:{}", port), Duration::from_secs(5)).unwrap();
        assert!(client.put_schedule(&cfg()).await.unwrap().is_none());
    }
}
