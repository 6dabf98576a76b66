use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use accord_core::notify::{Notifier, NotifyError};

use crate::client::EempClient;

/// Sends notices as platform work messages.
pub struct EempNotifier {
    client: Arc<EempClient>,
}

impl EempNotifier {
    pub fn new(client: Arc<EempClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for EempNotifier {
    async fn send(&self, recipient_id: &str, text: &str) -> Result<(), NotifyError> {
        self.client.send_text(recipient_id, text).await.map_err(|error| {
            if error.is_unreachable() {
                NotifyError::Unavailable(error.to_string())
            } else {
                NotifyError::Rejected(error.to_string())
            }
        })?;
        debug!(event_name = "eemp.notify.sent", recipient_id, "platform message sent");
        Ok(())
    }
}
