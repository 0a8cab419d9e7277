//! Discord-style webhook notifier.
//! Best-effort: a failed webhook post is logged and swallowed by callers, it
//! never fails a decision cycle.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;

use crate::domain::ports::Notifier;

pub struct WebhookNotifier {
    webhook_url: Option<String>,
    http: reqwest_middleware::ClientWithMiddleware,
}

impl WebhookNotifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        let retry_policy = reqwest_retry::policies::ExponentialBackoff::builder().build_with_max_retries(1);
        let http = reqwest_middleware::ClientBuilder::new(reqwest::Client::new())
            .with(reqwest_retry::RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        Self { webhook_url, http }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, message: &str) -> Result<()> {
        let Some(url) = &self.webhook_url else {
            tracing::debug!("notifier has no webhook configured, dropping message");
            return Ok(());
        };
        self.http
            .post(url)
            .json(&json!({ "content": message }))
            .send()
            .await
            .context("posting webhook notification")?
            .error_for_status()
            .context("webhook endpoint returned an error status")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_notifier_is_a_noop() {
        let notifier = WebhookNotifier::disabled();
        assert!(notifier.notify("hello").await.is_ok());
    }
}
