use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Delivers a plain-text message to one person, addressed by platform user id.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<(), NotifyError>;
}

/// Writes notices to the log. Used when no messaging platform is configured.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<(), NotifyError> {
        info!(event_name = "notify.logged", recipient_id, text, "notification");
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentNotice {
    pub recipient_id: String,
    pub text: String,
}

#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    sent: Arc<Mutex<Vec<SentNotice>>>,
    failing: Arc<Mutex<Option<NotifyError>>>,
}

impl InMemoryNotifier {
    pub fn sent(&self) -> Vec<SentNotice> {
        match self.sent.lock() {
            Ok(sent) => sent.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Every following `send` fails with `error` until cleared with `None`.
    pub fn fail_with(&self, error: Option<NotifyError>) {
        match self.failing.lock() {
            Ok(mut slot) => *slot = error,
            Err(poisoned) => *poisoned.into_inner() = error,
        }
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<(), NotifyError> {
        let failure = match self.failing.lock() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        if let Some(error) = failure {
            return Err(error);
        }

        let notice = SentNotice { recipient_id: recipient_id.to_string(), text: text.to_string() };
        match self.sent.lock() {
            Ok(mut sent) => sent.push(notice),
            Err(poisoned) => poisoned.into_inner().push(notice),
        }
        Ok(())
    }
}
