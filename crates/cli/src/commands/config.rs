use std::env;
use std::fs;
use std::path::Path;

use accord_core::config::{resolve_config_path, AppConfig, LoadOptions};
use secrecy::{ExposeSecret, SecretString};
use toml::Value;

/// One line of the effective-config report.
struct Field {
    key: &'static str,
    env_key: &'static str,
    value: String,
}

impl Field {
    fn new(key: &'static str, env_key: &'static str, value: impl ToString) -> Self {
        Self { key, env_key, value: value.to_string() }
    }

    fn secret(key: &'static str, env_key: &'static str, value: &SecretString) -> Self {
        Self::new(key, env_key, redact_secret(value.expose_secret()))
    }
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let file_path = resolve_config_path(None);
    let file_doc = load_config_file_doc(file_path.as_deref());

    let mut lines =
        vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in fields(&config) {
        let source = field_source(&field, file_doc.as_ref(), file_path.as_deref());
        lines.push(format!("- {} = {} (source: {source})", field.key, field.value));
    }
    lines.join("\n")
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let optional = |value: &Option<String>| value.clone().unwrap_or_else(|| "<unset>".to_string());
    let eemp = &config.eemp;

    vec![
        Field::new("database.url", "ACCORD_DATABASE_URL", &config.database.url),
        Field::new(
            "database.max_connections",
            "ACCORD_DATABASE_MAX_CONNECTIONS",
            config.database.max_connections,
        ),
        Field::new(
            "database.timeout_secs",
            "ACCORD_DATABASE_TIMEOUT_SECS",
            config.database.timeout_secs,
        ),
        Field::new(
            "server.bind_address",
            "ACCORD_SERVER_BIND_ADDRESS",
            &config.server.bind_address,
        ),
        Field::new("server.port", "ACCORD_SERVER_PORT", config.server.port),
        Field::new(
            "server.graceful_shutdown_secs",
            "ACCORD_SERVER_GRACEFUL_SHUTDOWN_SECS",
            config.server.graceful_shutdown_secs,
        ),
        Field::new("eemp.enabled", "ACCORD_EEMP_ENABLED", eemp.enabled),
        Field::new("eemp.base_url", "ACCORD_EEMP_BASE_URL", &eemp.base_url),
        Field::new("eemp.app_key", "ACCORD_EEMP_APP_KEY", &eemp.app_key),
        Field::secret("eemp.app_secret", "ACCORD_EEMP_APP_SECRET", &eemp.app_secret),
        Field::new("eemp.template_id", "ACCORD_EEMP_TEMPLATE_ID", &eemp.template_id),
        Field::secret("eemp.callback_token", "ACCORD_EEMP_CALLBACK_TOKEN", &eemp.callback_token),
        Field::secret("eemp.aes_key", "ACCORD_EEMP_AES_KEY", &eemp.aes_key),
        Field::new("eemp.receiver_id", "ACCORD_EEMP_RECEIVER_ID", &eemp.receiver_id),
        Field::new("eemp.approver_id", "ACCORD_EEMP_APPROVER_ID", optional(&eemp.approver_id)),
        Field::new(
            "eemp.routing_rule_id",
            "ACCORD_EEMP_ROUTING_RULE_ID",
            optional(&eemp.routing_rule_id),
        ),
        Field::new(
            "eemp.request_timeout_secs",
            "ACCORD_EEMP_REQUEST_TIMEOUT_SECS",
            eemp.request_timeout_secs,
        ),
        Field::new(
            "engine.webhook_timeout_secs",
            "ACCORD_ENGINE_WEBHOOK_TIMEOUT_SECS",
            config.engine.webhook_timeout_secs,
        ),
        Field::new(
            "engine.reconcile_interval_secs",
            "ACCORD_ENGINE_RECONCILE_INTERVAL_SECS",
            config.engine.reconcile_interval_secs,
        ),
        Field::new("engine.event_buffer", "ACCORD_ENGINE_EVENT_BUFFER", config.engine.event_buffer),
        Field::new("logging.level", "ACCORD_LOGGING_LEVEL", &config.logging.level),
        Field::new(
            "logging.format",
            "ACCORD_LOGGING_FORMAT",
            format!("{:?}", config.logging.format),
        ),
    ]
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let raw = fs::read_to_string(path?).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(field: &Field, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    let alias = match field.env_key {
        "ACCORD_LOGGING_LEVEL" => Some("ACCORD_LOG_LEVEL"),
        "ACCORD_LOGGING_FORMAT" => Some("ACCORD_LOG_FORMAT"),
        _ => None,
    };
    for env_key in std::iter::once(field.env_key).chain(alias) {
        if env::var_os(env_key).is_some() {
            return format!("env ({env_key})");
        }
    }

    if file_doc.is_some_and(|doc| contains_path(doc, field.key)) {
        let file_path = file_path
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "config file".to_string());
        return format!("file ({file_path})");
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

/// Only the length of a secret is shown, which is enough to spot a truncated AES key.
fn redact_secret(secret: &str) -> String {
    match secret.trim().chars().count() {
        0 => "<empty>".to_string(),
        len => format!("<redacted, {len} chars>"),
    }
}

#[cfg(test)]
mod tests {
    use super::redact_secret;

    #[test]
    fn secrets_never_render_in_full() {
        assert_eq!(redact_secret(""), "<empty>");
        assert_eq!(redact_secret("  "), "<empty>");
        let key = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFE";
        let shown = redact_secret(key);
        assert_eq!(shown, "<redacted, 43 chars>");
        assert!(!shown.contains("abc"));
    }
}
