//! Outbound client for the messaging vendor.
//!
//! Replies go out as form-encoded POSTs under basic auth. When messaging is
//! disabled (local development, tests) sends are recorded instead.

use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::Client;
use tracing::{info, warn};

use bullion_config::MessagingConfig;

pub struct Messenger {
    config: MessagingConfig,
    http: Client,
    /// Sends recorded while disabled; inspected by tests.
    recorded: Mutex<Vec<(String, String)>>,
}

impl Messenger {
    pub fn new(config: MessagingConfig) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to create reqwest client");
        Self {
            config,
            http,
            recorded: Mutex::new(Vec::new()),
        }
    }

    /// Send one plain-text message to a subscriber.
    pub async fn send(&self, to: &str, body: &str) -> Result<()> {
        if !self.config.enabled {
            info!(to, "messaging disabled, recording reply");
            self.recorded
                .lock()
                .unwrap()
                .push((to.to_string(), body.to_string()));
            return Ok(());
        }

        let url = format!(
            "{}/Accounts/{}/Messages.json",
            self.config.api_url.trim_end_matches('/'),
            self.config.account_sid
        );
        let to = if to.starts_with("whatsapp:") {
            to.to_string()
        } else {
            format!("whatsapp:{to}")
        };
        let params = [
            ("To", to.as_str()),
            ("From", self.config.sender.as_str()),
            ("Body", body),
        ];
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, to, "vendor rejected outbound message");
            return Err(anyhow!("vendor send failed with status {status}"));
        }
        Ok(())
    }

    /// Messages recorded while messaging was disabled.
    pub fn recorded(&self) -> Vec<(String, String)> {
        self.recorded.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_messenger_records_instead_of_sending() {
        let messenger = Messenger::new(MessagingConfig::default());
        messenger.send("whatsapp:+971501234567", "hello").await.unwrap();
        let recorded = messenger.recorded();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].1, "hello");
    }
}
