use anyhow::Result;

pub mod ookla;
pub mod report;

pub use self::ookla::OoklaCli;

/// Raw result of one probe invocation, before classification.
#[derive(Debug, Clone, Default)]
pub struct ProbeOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProbeOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// An external bandwidth measurement tool.
///
/// `Err` means the tool could not be started at all; a tool that ran and
/// failed is reported through a non-zero [`ProbeOutput::exit_code`].
#[async_trait::async_trait]
pub trait Probe: Send + Sync {
    async fn invoke(&self, server_id: Option<u32>) -> Result<ProbeOutput>;
}
