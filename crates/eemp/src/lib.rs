//! Enterprise messaging platform integration: open API client, external approval provider,
//! work-message notifier and the encrypted callback protocol.

pub mod callback;
pub mod client;
pub mod crypto;
pub mod notifier;
pub mod provider;

#[cfg(test)]
mod fake;

use std::sync::Arc;

use accord_core::config::EempConfig;
use thiserror::Error;

pub use callback::{CallbackEnvelope, CallbackError, CallbackEvent, CallbackHandler, CallbackQuery};
pub use client::{ClientError, EempClient};
pub use crypto::{CallbackCrypto, CryptoError};
pub use notifier::EempNotifier;
pub use provider::ExternalProvider;

#[derive(Debug, Error)]
pub enum EempSetupError {
    #[error("platform integration is disabled")]
    Disabled,
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Everything the service needs from the platform, built from one config section.
pub struct EempRuntime {
    pub client: Arc<EempClient>,
    pub provider: Arc<ExternalProvider>,
    pub notifier: Arc<EempNotifier>,
    pub callbacks: Arc<CallbackHandler>,
}

impl EempRuntime {
    pub fn from_config(config: &EempConfig) -> Result<Self, EempSetupError> {
        if !config.enabled {
            return Err(EempSetupError::Disabled);
        }

        let crypto = CallbackCrypto::new(
            config.callback_token.clone(),
            &config.aes_key,
            config.receiver_id.clone(),
        )?;
        let client = Arc::new(EempClient::new(config)?);

        Ok(Self {
            provider: Arc::new(ExternalProvider::new(client.clone(), config)),
            notifier: Arc::new(EempNotifier::new(client.clone())),
            callbacks: Arc::new(CallbackHandler::new(crypto)),
            client,
        })
    }
}
