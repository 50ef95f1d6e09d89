//! Side-effect sinks dispatched by the rule engine: an HTTP webhook
//! notifier (Discord/Slack/generic JSON payloads) and a PowerShell
//! remediator that reuses the [`RemoteExecutor`] transport. Modeled on the
//! Python original's `send_webhook` (`utils.py`) and `Responder`
//! (`analyzer.py`).

use crate::error::{Result, SentinelError};
use crate::transport::{Credentials, RemoteExecutor};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Delivers an alert to an external sink. Abstracted so the rule engine
/// can be exercised against a [`MockNotifier`] in tests.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, url: &str, text: &str, flavor: &str) -> Result<()>;
    async fn send_email(&self, to: Option<&str>, text: &str) -> Result<()>;
}

/// Builds the flavor-specific JSON payload: Discord, Slack, or a generic
/// fallback (spec §4.7).
fn payload_for(flavor: &str, text: &str) -> serde_json::Value {
    match flavor {
        "discord" => json!({ "content": text, "username": "Headless Sentinel" }),
        "slack" => json!({ "text": text, "username": "Headless Sentinel", "icon_emoji": ":shield:" }),
        _ => json!({ "message": text, "source": "Headless Sentinel" }),
    }
}

/// The production webhook notifier. Email is treated as a stub per spec
/// §1 (out of scope): it logs and returns success without sending.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .expect("reqwest client construction should not fail with static config");
        Self { client }
    }
}

impl Default for WebhookNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, url: &str, text: &str, flavor: &str) -> Result<()> {
        let body = payload_for(flavor, text);
        let response = self.client.post(url).json(&body).send().await?;
        let status = response.status();

        if status.as_u16() == 200 || status.as_u16() == 204 {
            Ok(())
        } else {
            Err(SentinelError::Notifier {
                url: url.to_string(),
                message: format!("unexpected status {status}"),
            })
        }
    }

    async fn send_email(&self, _to: Option<&str>, _text: &str) -> Result<()> {
        tracing::debug!("email notifier is a stub; no message was sent");
        Ok(())
    }
}

/// Runs a remediation script against one host over the remote executor.
pub struct Remediator {
    executor: Arc<dyn RemoteExecutor>,
}

impl Remediator {
    pub fn new(executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { executor }
    }

    /// Executes `script` on `host`, returning its stdout or a
    /// `RemediationError` (spec §4.7). Runs on a blocking-pool thread since
    /// the underlying executor is synchronous.
    pub async fn run(&self, host: &str, script: &str, credentials: &Credentials) -> Result<Vec<u8>> {
        let executor = Arc::clone(&self.executor);
        let target = crate::model::HostTarget {
            ip: host.to_string(),
            port: 5985,
            transport: Default::default(),
            timeout: 120,
            credentials: None,
        };
        let credentials = credentials.clone();
        let script = script.to_string();
        let host_for_error = host.to_string();

        tokio::task::spawn_blocking(move || executor.execute(&target, &credentials, &script))
            .await
            .map_err(|join_err| SentinelError::Remediation {
                host: host_for_error.clone(),
                message: format!("remediation task panicked: {join_err}"),
            })?
            .map(|output| output.stdout)
            .map_err(|e| SentinelError::Remediation {
                host: host_for_error,
                message: e.to_string(),
            })
    }
}

/// Records every alert text it would have sent, for assertions in tests.
#[derive(Default)]
pub struct MockNotifier {
    sent: std::sync::Mutex<Vec<String>>,
}

impl MockNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn send(&self, _url: &str, text: &str, _flavor: &str) -> Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_email(&self, _to: Option<&str>, text: &str) -> Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discord_payload_shape() {
        let p = payload_for("discord", "hello");
        assert_eq!(p["content"], "hello");
        assert_eq!(p["username"], "Headless Sentinel");
    }

    #[test]
    fn slack_payload_shape() {
        let p = payload_for("slack", "hello");
        assert_eq!(p["text"], "hello");
        assert_eq!(p["icon_emoji"], ":shield:");
    }

    #[test]
    fn unknown_flavor_falls_back_to_generic_payload() {
        let p = payload_for("teams", "hello");
        assert_eq!(p["message"], "hello");
        assert_eq!(p["source"], "Headless Sentinel");
    }

    #[tokio::test]
    async fn remediator_runs_script_via_executor() {
        let exec = Arc::new(crate::transport::MockExecutor::new());
        exec.push_stdout("10.0.0.1", b"done".to_vec());
        let remediator = Remediator::new(exec);
        let creds = Credentials {
            username: "u".into(),
            password: "p".into(),
        };
        let out = remediator.run("10.0.0.1", "Restart-Service foo", &creds).await.unwrap();
        assert_eq!(out, b"done");
    }
}
