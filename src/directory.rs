//! Candidate speedtest servers from the public directory.
//!
//! Lookup failures are folded into [`ServerList::error`] instead of being
//! returned as `Err`: an unreachable directory just means "no suggestions".

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeServer {
    #[serde(deserialize_with = "de_server_id")]
    pub id: u32,
    #[serde(default)]
    pub sponsor: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub country: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerList {
    pub servers: Vec<ProbeServer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The directory reports ids as strings; accept numbers too.
fn de_server_id<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u32),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

pub struct DirectoryClient {
    http: reqwest::Client,
    url: String,
}

impl DirectoryClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("speedwarden/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    /// Up to `limit` servers, nearest first as ranked by the directory.
    pub async fn fetch(&self, limit: usize) -> ServerList {
        match self.try_fetch(limit).await {
            Ok(servers) => {
                debug!(count = servers.len(), "fetched server directory");
                ServerList {
                    servers,
                    error: None,
                }
            }
            Err(e) => {
                warn!(url = %self.url, error = %format!("{:#}", e), "server directory lookup failed");
                ServerList {
                    servers: Vec::new(),
                    error: Some(format!("{:#}", e)),
                }
            }
        }
    }

    async fn try_fetch(&self, limit: usize) -> Result<Vec<ProbeServer>> {
        let mut servers: Vec<ProbeServer> = self
            .http
            .get(&self.url)
            .query(&[("limit", limit)])
            .send()
            .await
            .context("request failed")?
            .error_for_status()
            .context("directory returned an error status")?
            .json()
            .await
            .context("unexpected directory response")?;
        servers.truncate(limit);
        Ok(servers)
    }
}
