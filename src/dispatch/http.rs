use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

use super::HyperExecutor;

#[derive(Serialize)]
struct CommandEnvelope<'a> {
    control: &'a str,
    command: &'a str,
}

/// Posts commands as JSON to a message broker sitting in front of the agents
pub struct HttpExecutor {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpExecutor {
    pub fn new(endpoint: &str, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl HyperExecutor for HttpExecutor {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn is_available(&self) -> bool {
        self.client
            .get(&self.endpoint)
            .send()
            .await
            .map(|r| !r.status().is_server_error())
            .unwrap_or(false)
    }

    async fn execute(&self, control: &str, command: &str) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&CommandEnvelope { control, command })
            .send()
            .await
            .with_context(|| format!("Failed to reach dispatch broker at {}", self.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Dispatch broker returned {}: {}", status, body.trim());
        }
        Ok(())
    }
}
