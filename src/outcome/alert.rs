//! # Operator Alerts
//!
//! Best-effort notifications for failed replications. Alerting never blocks
//! message processing: `AlertDispatcher::notify` only enqueues, a background
//! task does the delivery, and delivery failures go to their own channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::errors::{OutcomeError, OutcomeResult};

/// Alerts queued beyond this are dropped (and reported as failures)
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// A failed replication worth an operator's attention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub error: String,
    /// The failing envelope, for diagnosis
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Value>,
}

impl Alert {
    pub fn new(subject: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            operation_id: None,
            error: error.into(),
            envelope: None,
        }
    }

    pub fn with_operation_id(mut self, id: impl Into<String>) -> Self {
        self.operation_id = Some(id.into());
        self
    }

    pub fn with_envelope(mut self, envelope: Value) -> Self {
        self.envelope = Some(envelope);
        self
    }

    /// Plain-text body
    pub fn render_body(&self) -> String {
        let envelope = self
            .envelope
            .as_ref()
            .and_then(|e| serde_json::to_string_pretty(e).ok())
            .unwrap_or_else(|| "(unavailable)".to_string());

        format!(
            "A replication operation failed.\n\n\
            Operation: {}\n\
            Error: {}\n\n\
            Envelope:\n{}\n",
            self.operation_id.as_deref().unwrap_or("(unknown)"),
            self.error,
            envelope
        )
    }
}

/// Delivers one alert
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(&self, alert: &Alert) -> OutcomeResult<()>;
}

/// SMTP settings for operator alerts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub smtp_host: String,

    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,

    /// Empty means no authentication (local relays)
    #[serde(default)]
    pub smtp_user: String,

    #[serde(default)]
    pub smtp_password: String,

    pub from_email: String,

    #[serde(default = "default_from_name")]
    pub from_name: String,

    /// Operators receiving alerts
    pub recipients: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_from_name() -> String {
    "gate-replicator".to_string()
}

/// Sends alerts as plain-text email
pub struct SmtpAlertSender {
    config: AlertConfig,
}

impl SmtpAlertSender {
    pub fn new(config: AlertConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AlertSender for SmtpAlertSender {
    async fn send(&self, alert: &Alert) -> OutcomeResult<()> {
        use lettre::{
            message::header::ContentType, transport::smtp::authentication::Credentials,
            AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
        };

        let from = format!("{} <{}>", self.config.from_name, self.config.from_email)
            .parse()
            .map_err(|e| OutcomeError::Alert(format!("Invalid from address: {}", e)))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(format!("[gate-replicator] {}", alert.subject))
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.config.recipients {
            builder = builder.to(recipient
                .parse()
                .map_err(|e| OutcomeError::Alert(format!("Invalid recipient {}: {}", recipient, e)))?);
        }
        let email = builder
            .body(alert.render_body())
            .map_err(|e| OutcomeError::Alert(format!("Failed to build email: {}", e)))?;

        let mailer = if self.config.smtp_user.is_empty() {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.smtp_host)
                .port(self.config.smtp_port)
                .build()
        } else {
            let creds = Credentials::new(
                self.config.smtp_user.clone(),
                self.config.smtp_password.clone(),
            );
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.smtp_host)
                .map_err(|e| OutcomeError::Alert(format!("SMTP relay error: {}", e)))?
                .credentials(creds)
                .port(self.config.smtp_port)
                .build()
        };

        mailer
            .send(email)
            .await
            .map_err(|e| OutcomeError::Alert(format!("Failed to send email: {}", e)))?;
        Ok(())
    }
}

/// Records alerts instead of sending them; can be told to fail
#[derive(Debug, Default)]
pub struct MemoryAlertSender {
    sent: Mutex<Vec<Alert>>,
    failing: AtomicBool,
}

impl MemoryAlertSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sender whose every delivery fails
    pub fn failing() -> Self {
        let sender = Self::default();
        sender.failing.store(true, Ordering::SeqCst);
        sender
    }

    pub fn sent(&self) -> Vec<Alert> {
        self.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Alert>> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl AlertSender for MemoryAlertSender {
    async fn send(&self, alert: &Alert) -> OutcomeResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(OutcomeError::Alert("alert channel unavailable".to_string()));
        }
        self.lock().push(alert.clone());
        Ok(())
    }
}

/// An alert that could not be delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertFailure {
    pub operation_id: Option<String>,
    pub error: String,
}

/// Receives delivery failures from the dispatcher
pub struct AlertFailures {
    rx: mpsc::Receiver<AlertFailure>,
}

impl AlertFailures {
    /// Next failure; `None` once the dispatcher task is gone
    pub async fn recv(&mut self) -> Option<AlertFailure> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AlertFailure> {
        self.rx.try_recv().ok()
    }
}

/// Non-blocking, notify-and-forget front of an `AlertSender`
#[derive(Clone)]
pub struct AlertDispatcher {
    queue: Option<mpsc::Sender<Alert>>,
    failures: Option<mpsc::Sender<AlertFailure>>,
}

impl AlertDispatcher {
    /// Start the delivery task. Must be called inside a Tokio runtime.
    pub fn spawn(sender: Arc<dyn AlertSender>) -> (Self, AlertFailures) {
        Self::spawn_with_capacity(sender, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn spawn_with_capacity(
        sender: Arc<dyn AlertSender>,
        capacity: usize,
    ) -> (Self, AlertFailures) {
        let (queue_tx, mut queue_rx) = mpsc::channel::<Alert>(capacity);
        let (failure_tx, failure_rx) = mpsc::channel::<AlertFailure>(capacity);

        let failures = failure_tx.clone();
        tokio::spawn(async move {
            while let Some(alert) = queue_rx.recv().await {
                let operation_id = alert.operation_id.clone();

                let error = match sender.send(&alert).await {
                    Ok(()) => {
                        debug!(operation_id = ?operation_id, "alert delivered");
                        continue;
                    }
                    Err(e) => e.to_string(),
                };

                warn!(operation_id = ?operation_id, error = %error, "alert delivery failed");
                let _ = failures.try_send(AlertFailure {
                    operation_id,
                    error,
                });
            }
        });

        (
            Self {
                queue: Some(queue_tx),
                failures: Some(failure_tx),
            },
            AlertFailures { rx: failure_rx },
        )
    }

    /// Dispatcher that drops every alert (alerting not configured)
    pub fn disabled() -> Self {
        Self {
            queue: None,
            failures: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.queue.is_some()
    }

    /// Enqueue an alert without waiting for delivery
    pub fn notify(&self, alert: Alert) {
        let Some(queue) = &self.queue else {
            debug!(subject = %alert.subject, "alerting disabled; alert dropped");
            return;
        };

        if let Err(e) = queue.try_send(alert) {
            let alert = match e {
                mpsc::error::TrySendError::Full(alert) | mpsc::error::TrySendError::Closed(alert) => alert,
            };
            warn!(operation_id = ?alert.operation_id, "alert queue unavailable; alert dropped");
            if let Some(failures) = &self.failures {
                let _ = failures.try_send(AlertFailure {
                    operation_id: alert.operation_id,
                    error: "alert queue full or closed".to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_render_body_includes_envelope() {
        let alert = Alert::new("create companies failed", "Mirror store unavailable")
            .with_operation_id("op_1_abc")
            .with_envelope(json!({"table": "companies"}));

        let body = alert.render_body();
        assert!(body.contains("op_1_abc"));
        assert!(body.contains("Mirror store unavailable"));
        assert!(body.contains("\"table\": \"companies\""));
    }

    #[test]
    fn test_alert_config_defaults() {
        let config: AlertConfig = serde_json::from_value(json!({
            "smtp_host": "smtp.example.com",
            "from_email": "replicator@example.com",
            "recipients": ["ops@example.com"]
        }))
        .unwrap();

        assert_eq!(config.smtp_port, 587);
        assert_eq!(config.from_name, "gate-replicator");
        assert!(config.smtp_user.is_empty());
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_background() {
        let sender = Arc::new(MemoryAlertSender::new());
        let (dispatcher, _failures) = AlertDispatcher::spawn(sender.clone());

        dispatcher.notify(Alert::new("subject", "boom"));

        for _ in 0..100 {
            if sender.sent_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sender.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_reported_on_failure_channel() {
        let (dispatcher, mut failures) =
            AlertDispatcher::spawn(Arc::new(MemoryAlertSender::failing()));

        dispatcher.notify(Alert::new("subject", "boom").with_operation_id("op_9"));

        let failure = tokio::time::timeout(Duration::from_secs(1), failures.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.operation_id.as_deref(), Some("op_9"));
        assert!(failure.error.contains("unavailable"));
    }

    #[test]
    fn test_disabled_dispatcher_is_a_no_op() {
        let dispatcher = AlertDispatcher::disabled();
        assert!(!dispatcher.is_enabled());
        dispatcher.notify(Alert::new("subject", "boom"));
    }
}
