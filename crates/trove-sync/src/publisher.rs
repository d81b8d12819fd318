use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;
use trove_core::JobOutcome;

/// Receives a report for every finished job. Errors are logged by the
/// caller and never fail the job.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, outcome: &JobOutcome) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn publish(&self, outcome: &JobOutcome) -> Result<()> {
        info!(
            run_id = %outcome.run_id,
            provider = %outcome.provider,
            user_id = outcome.user_id,
            mode = %outcome.mode,
            status = ?outcome.status,
            num_persisted = outcome.num_persisted,
            error = outcome.error.as_deref().unwrap_or(""),
            "job finished"
        );
        Ok(())
    }
}

/// POSTs each outcome as JSON.
#[derive(Debug, Clone)]
pub struct WebhookPublisher {
    client: reqwest::Client,
    url: String,
}

impl WebhookPublisher {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building webhook client")?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Publisher for WebhookPublisher {
    async fn publish(&self, outcome: &JobOutcome) -> Result<()> {
        self.client
            .post(&self.url)
            .json(outcome)
            .send()
            .await
            .with_context(|| format!("posting outcome to {}", self.url))?
            .error_for_status()
            .with_context(|| format!("webhook {} rejected outcome", self.url))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trove_core::{Job, Provider};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn webhook_posts_outcome_json() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/trove"))
            .and(body_partial_json(json!({
                "provider": "spotify", "user_id": 7, "mode": "refresh",
                "status": "succeeded", "num_persisted": 0
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let publisher =
            WebhookPublisher::new(format!("{}/hooks/trove", server.uri()), Duration::from_secs(5)).unwrap();
        let outcome = JobOutcome::succeeded(&Job::refresh(Provider::Spotify, 7), 0);
        publisher.publish(&outcome).await.unwrap();
    }

    #[tokio::test]
    async fn webhook_rejection_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let publisher = WebhookPublisher::new(server.uri(), Duration::from_secs(5)).unwrap();
        let outcome = JobOutcome::succeeded(&Job::refresh(Provider::Reddit, 1), 3);
        assert!(publisher.publish(&outcome).await.is_err());
    }
}
