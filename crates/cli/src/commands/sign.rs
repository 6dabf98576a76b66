use accord_eemp::crypto::signature;
use secrecy::ExposeSecret;
use serde_json::json;

use crate::commands::{load_config, CommandResult, EXIT_INVALID_INPUT};

/// Computes the callback signature for hand-built test deliveries. Without an
/// explicit token the configured callback token is used.
pub fn run(token: Option<&str>, timestamp: &str, nonce: &str, payload: &str) -> CommandResult {
    let signed = match token {
        Some(token) => signature(token, timestamp, nonce, payload),
        None => {
            let config = match load_config("sign") {
                Ok(config) => config,
                Err(failure) => return failure,
            };
            let token = config.eemp.callback_token.expose_secret();
            if token.trim().is_empty() {
                return CommandResult::failure(
                    "sign",
                    "invalid_input",
                    "no --token given and eemp.callback_token is not configured",
                    EXIT_INVALID_INPUT,
                );
            }
            signature(token, timestamp, nonce, payload)
        }
    };

    CommandResult::success_with_data(
        "sign",
        signed.clone(),
        Some(json!({ "signature": signed, "timestamp": timestamp, "nonce": nonce })),
    )
}
