//! Ookla `speedtest` CLI wrapper.

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::debug;

use super::{Probe, ProbeOutput};

pub struct OoklaCli {
    path: String,
    extra_args: Vec<String>,
}

impl OoklaCli {
    pub fn new(path: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            path: path.into(),
            extra_args,
        }
    }

    fn args(&self, server_id: Option<u32>) -> Vec<String> {
        let mut args = vec![
            "--accept-license".to_string(),
            "--accept-gdpr".to_string(),
            "--format=json".to_string(),
        ];
        if let Some(id) = server_id {
            args.push(format!("--server-id={}", id));
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

#[async_trait::async_trait]
impl Probe for OoklaCli {
    async fn invoke(&self, server_id: Option<u32>) -> Result<ProbeOutput> {
        let args = self.args(server_id);
        debug!(path = %self.path, ?args, "spawning speedtest");

        let output = Command::new(&self.path)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run '{}' (is the Ookla CLI installed?)", self.path))?;

        Ok(ProbeOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
