use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;

use super::HyperExecutor;

/// Hands commands to a local dispatch client: `<client> <control> <command>`.
///
/// The client owns delivery to the agents; a non-zero exit means the command
/// was not accepted.
pub struct ShellExecutor {
    client: PathBuf,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new(client: PathBuf, timeout_secs: u64) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(timeout_secs.max(1)),
        }
    }

    async fn run_command(&self, args: &[&str]) -> Result<String> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.client).args(args).kill_on_drop(true).output(),
        )
        .await
        .with_context(|| format!("Dispatch client timed out after {:?}", self.timeout))?
        .with_context(|| format!("Failed to execute {}", self.client.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Dispatch client failed: {}", stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl HyperExecutor for ShellExecutor {
    fn name(&self) -> &'static str {
        "shell"
    }

    async fn is_available(&self) -> bool {
        tokio::fs::metadata(&self.client)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    async fn execute(&self, control: &str, command: &str) -> Result<()> {
        let out = self.run_command(&[control, command]).await?;
        if !out.is_empty() {
            tracing::debug!(output = %out, "Dispatch client output");
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_client_is_unavailable() {
        let shell = ShellExecutor::new(PathBuf::from("/nonexistent/hyper-dispatch"), 5);
        assert!(!shell.is_available().await);
        assert!(shell.execute("inter=1", "true").await.is_err());
    }

    #[tokio::test]
    async fn test_exit_status_is_checked() {
        let ok = ShellExecutor::new(PathBuf::from("/bin/echo"), 5);
        assert!(ok.is_available().await);
        assert!(ok.execute("inter=1", "anything").await.is_ok());

        let failing = ShellExecutor::new(PathBuf::from("/bin/false"), 5);
        assert!(failing.execute("inter=1", "anything").await.is_err());
    }
}
