//! HTTP webhook notification channel.
//!
//! Posts each notification as a JSON document. `${VAR}` references in the
//! URL are resolved from the environment when the channel is built, so
//! tokens need not live in the config file.

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::domain::error::QcwatchError;
use crate::domain::notification::Notification;
use crate::ports::notifier_port::NotifierPort;

fn config_error(reason: impl Into<String>) -> QcwatchError {
    QcwatchError::ConfigInvalid {
        section: "notify".into(),
        key: "webhook_url".into(),
        reason: reason.into(),
    }
}

fn resolve_env_vars(input: &str) -> Result<String, QcwatchError> {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| config_error(format!("unclosed variable reference in '{}'", input)))?;
        let name = &after[..end];
        let value = std::env::var(name)
            .map_err(|_| config_error(format!("environment variable {} is not set", name)))?;
        result.push_str(&value);
        rest = &after[end + 1..];
    }
    result.push_str(rest);
    Ok(result)
}

#[derive(Debug)]
pub struct WebhookNotifier {
    url: String,
    client: Client,
}

impl WebhookNotifier {
    pub fn new(url: &str, timeout: Duration) -> Result<Self, QcwatchError> {
        let url = resolve_env_vars(url.trim())?;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(config_error(format!("'{}' is not an http(s) URL", url)));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| config_error(e.to_string()))?;
        Ok(Self { url, client })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl NotifierPort for WebhookNotifier {
    fn send(&self, notification: &Notification) -> Result<(), QcwatchError> {
        let failed = |reason: String| QcwatchError::Notification {
            channel: "webhook".into(),
            reason,
        };

        let body = serde_json::to_string(notification)?;
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response
                .text()
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(failed(format!("webhook returned {}: {}", status, text)));
        }
        debug!(url = %self.url, %status, "webhook notification delivered");
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "webhook"
    }
}
