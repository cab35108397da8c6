use crate::config::AlertConfig;
use std::collections::HashMap;
use std::time::Duration;

const CRASH_ALERT_BUDGET: Duration = Duration::from_secs(5);

/// Best-effort crash alerting over the Mailgun HTTP API. When the config is
/// absent the worker only logs; the process exit never waits on email.
pub struct AdminAlerting {
    config: Option<AlertConfig>,
    http_client: reqwest::Client,
}

impl AdminAlerting {
    pub fn new(config: Option<AlertConfig>) -> Self {
        if config.is_none() {
            log::warn!("Mailgun configuration not found, crash alert emails will be disabled");
        }
        Self {
            config,
            http_client: reqwest::Client::new(),
        }
    }

    /// Attempt the alert within the crash budget, then return regardless.
    pub async fn send_crash_alert(&self, subject: &str, body: &str) {
        let Some(config) = &self.config else {
            return;
        };

        let send = self.send_via_mailgun(subject, body, config);
        match tokio::time::timeout(CRASH_ALERT_BUDGET, send).await {
            Ok(Ok(())) => log::info!("Crash alert email sent to {}", config.recipient),
            Ok(Err(e)) => log::error!("Failed to send crash alert email: {}", e),
            Err(_) => log::error!("Crash alert email timed out after {:?}", CRASH_ALERT_BUDGET),
        }
    }

    async fn send_via_mailgun(
        &self,
        subject: &str,
        body: &str,
        config: &AlertConfig,
    ) -> Result<(), String> {
        let base_url = config
            .base_url
            .as_deref()
            .unwrap_or("https://api.mailgun.net");
        let url = format!("{}/v3/{}/messages", base_url, config.domain);

        let from_email = format!("{} <{}>", config.from_name, config.from_email);

        let mut form = HashMap::new();
        form.insert("from", from_email.as_str());
        form.insert("to", config.recipient.as_str());
        form.insert("subject", subject);
        form.insert("text", body);

        let response = self
            .http_client
            .post(&url)
            .basic_auth("api", Some(&config.api_key))
            .form(&form)
            .send()
            .await
            .map_err(|e| format!("Mailgun request error: {}", e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "no error details".to_string());
            Err(format!("Mailgun API error: {} - {}", status, error_text))
        }
    }
}
