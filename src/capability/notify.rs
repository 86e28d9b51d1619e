//! 邮件通知：notify.send_email(recipient, subject, body) → Sent | Failed{reason}
//!
//! 传输由 Notifier 实现；默认 LogNotifier 只写日志并在内存中留存（同步 send-or-fail）。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{CapabilityError, SideEffect, TypedCapability};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NotifyOutcome {
    Sent { message_id: String },
    Failed { reason: String },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, email: &Email) -> NotifyOutcome;
}

/// 只记录日志的通知器
#[derive(Debug, Default)]
pub struct LogNotifier {
    sent: Mutex<Vec<Email>>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Email> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, email: &Email) -> NotifyOutcome {
        if !email.recipient.contains('@') {
            return NotifyOutcome::Failed {
                reason: format!("invalid recipient '{}'", email.recipient),
            };
        }
        tracing::info!(recipient = %email.recipient, subject = %email.subject, "email sent");
        let message_id = format!("msg_{}", uuid::Uuid::new_v4().simple());
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(email.clone());
        }
        NotifyOutcome::Sent { message_id }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SendEmailArgs {
    /// 收件人邮箱
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

/// notify.send_email；按幂等键去重，重复调用返回首次结果而不重发
pub struct SendEmail {
    notifier: Arc<dyn Notifier>,
    delivered: Mutex<HashMap<String, Value>>,
}

impl SendEmail {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self {
            notifier,
            delivered: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl TypedCapability for SendEmail {
    type Args = SendEmailArgs;
    const NAME: &'static str = "notify.send_email";
    const DESCRIPTION: &'static str = "Send an email (recipient, subject, body); returns sent or failed with a reason";
    const SIDE_EFFECT: SideEffect = SideEffect::NonIdempotentWrite;

    async fn run(&self, args: SendEmailArgs, idempotency_key: Option<&str>) -> Result<Value, CapabilityError> {
        if let Some(key) = idempotency_key {
            if let Some(previous) = self.delivered.lock().ok().and_then(|d| d.get(key).cloned()) {
                return Ok(previous);
            }
        }
        let outcome = self
            .notifier
            .send(&Email {
                recipient: args.recipient,
                subject: args.subject,
                body: args.body,
            })
            .await;
        let value = serde_json::to_value(&outcome).map_err(|e| CapabilityError::Failed(e.to_string()))?;
        if let (Some(key), NotifyOutcome::Sent { .. }) = (idempotency_key, &outcome) {
            if let Ok(mut delivered) = self.delivered.lock() {
                delivered.insert(key.to_string(), value.clone());
            }
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(recipient: &str) -> SendEmailArgs {
        SendEmailArgs {
            recipient: recipient.into(),
            subject: "Maintenance report".into(),
            body: "All good".into(),
        }
    }

    #[tokio::test]
    async fn test_send_and_dedupe_by_key() {
        let notifier = Arc::new(LogNotifier::new());
        let cap = SendEmail::new(notifier.clone());
        let first = cap.run(args("ops@plant.local"), Some("s1:3:0")).await.unwrap();
        let again = cap.run(args("ops@plant.local"), Some("s1:3:0")).await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first["status"], "sent");
        assert_eq!(notifier.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_delivery_is_reported_not_raised() {
        let cap = SendEmail::new(Arc::new(LogNotifier::new()));
        let out = cap.run(args("nobody"), Some("s1:1:0")).await.unwrap();
        assert_eq!(out["status"], "failed");
    }
}
