use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Length of the callback AES key as issued by the platform (base64 without padding).
pub const AES_KEY_LEN: usize = 43;

pub const CONFIG_FILE_CANDIDATES: [&str; 2] = ["accord.toml", "config/accord.toml"];

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub server: ServerConfig,
    pub eemp: EempConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub graceful_shutdown_secs: u64,
}

/// External enterprise-messaging platform integration.
#[derive(Clone, Debug)]
pub struct EempConfig {
    pub enabled: bool,
    pub base_url: String,
    pub app_key: String,
    pub app_secret: SecretString,
    pub template_id: String,
    pub callback_token: SecretString,
    pub aes_key: SecretString,
    /// Suffix every encrypted callback carries; usually the app key or corp id.
    pub receiver_id: String,
    pub approver_id: Option<String>,
    pub routing_rule_id: Option<String>,
    pub request_timeout_secs: u64,
}

impl EempConfig {
    /// Whether enough is configured to open instances on the platform.
    pub fn has_credentials(&self) -> bool {
        !self.app_key.trim().is_empty()
            && !self.app_secret.expose_secret().trim().is_empty()
            && !self.template_id.trim().is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub webhook_timeout_secs: u64,
    /// Zero disables the periodic reconciliation sweep.
    pub reconcile_interval_secs: u64,
    pub event_buffer: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub database_url: Option<String>,
    pub log_level: Option<String>,
    pub server_port: Option<u16>,
    pub eemp_enabled: Option<bool>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite://accord.db".to_string(),
                max_connections: 5,
                timeout_secs: 30,
            },
            server: ServerConfig {
                bind_address: "127.0.0.1".to_string(),
                port: 8080,
                graceful_shutdown_secs: 15,
            },
            eemp: EempConfig {
                enabled: false,
                base_url: "https://oapi.dingtalk.com".to_string(),
                app_key: String::new(),
                app_secret: String::new().into(),
                template_id: String::new(),
                callback_token: String::new().into(),
                aes_key: String::new().into(),
                receiver_id: String::new(),
                approver_id: None,
                routing_rule_id: None,
                request_timeout_secs: 10,
            },
            engine: EngineConfig {
                webhook_timeout_secs: 10,
                reconcile_interval_secs: 0,
                event_buffer: 256,
            },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options
                .config_path
                .unwrap_or_else(|| PathBuf::from(CONFIG_FILE_CANDIDATES[0]));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(database) = patch.database {
            if let Some(url) = database.url {
                self.database.url = url;
            }
            if let Some(max_connections) = database.max_connections {
                self.database.max_connections = max_connections;
            }
            if let Some(timeout_secs) = database.timeout_secs {
                self.database.timeout_secs = timeout_secs;
            }
        }

        if let Some(server) = patch.server {
            if let Some(bind_address) = server.bind_address {
                self.server.bind_address = bind_address;
            }
            if let Some(port) = server.port {
                self.server.port = port;
            }
            if let Some(graceful_shutdown_secs) = server.graceful_shutdown_secs {
                self.server.graceful_shutdown_secs = graceful_shutdown_secs;
            }
        }

        if let Some(eemp) = patch.eemp {
            if let Some(enabled) = eemp.enabled {
                self.eemp.enabled = enabled;
            }
            if let Some(base_url) = eemp.base_url {
                self.eemp.base_url = base_url;
            }
            if let Some(app_key) = eemp.app_key {
                self.eemp.app_key = app_key;
            }
            if let Some(app_secret) = eemp.app_secret {
                self.eemp.app_secret = secret_value(app_secret);
            }
            if let Some(template_id) = eemp.template_id {
                self.eemp.template_id = template_id;
            }
            if let Some(callback_token) = eemp.callback_token {
                self.eemp.callback_token = secret_value(callback_token);
            }
            if let Some(aes_key) = eemp.aes_key {
                self.eemp.aes_key = secret_value(aes_key);
            }
            if let Some(receiver_id) = eemp.receiver_id {
                self.eemp.receiver_id = receiver_id;
            }
            if let Some(approver_id) = eemp.approver_id {
                self.eemp.approver_id = Some(approver_id);
            }
            if let Some(routing_rule_id) = eemp.routing_rule_id {
                self.eemp.routing_rule_id = Some(routing_rule_id);
            }
            if let Some(request_timeout_secs) = eemp.request_timeout_secs {
                self.eemp.request_timeout_secs = request_timeout_secs;
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(webhook_timeout_secs) = engine.webhook_timeout_secs {
                self.engine.webhook_timeout_secs = webhook_timeout_secs;
            }
            if let Some(reconcile_interval_secs) = engine.reconcile_interval_secs {
                self.engine.reconcile_interval_secs = reconcile_interval_secs;
            }
            if let Some(event_buffer) = engine.event_buffer {
                self.engine.event_buffer = event_buffer;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("ACCORD_DATABASE_URL") {
            self.database.url = value;
        }
        if let Some(value) = read_env("ACCORD_DATABASE_MAX_CONNECTIONS") {
            self.database.max_connections = parse_u32("ACCORD_DATABASE_MAX_CONNECTIONS", &value)?;
        }
        if let Some(value) = read_env("ACCORD_DATABASE_TIMEOUT_SECS") {
            self.database.timeout_secs = parse_u64("ACCORD_DATABASE_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("ACCORD_SERVER_BIND_ADDRESS") {
            self.server.bind_address = value;
        }
        if let Some(value) = read_env("ACCORD_SERVER_PORT") {
            self.server.port = parse_u16("ACCORD_SERVER_PORT", &value)?;
        }
        if let Some(value) = read_env("ACCORD_SERVER_GRACEFUL_SHUTDOWN_SECS") {
            self.server.graceful_shutdown_secs =
                parse_u64("ACCORD_SERVER_GRACEFUL_SHUTDOWN_SECS", &value)?;
        }

        if let Some(value) = read_env("ACCORD_EEMP_ENABLED") {
            self.eemp.enabled = parse_bool("ACCORD_EEMP_ENABLED", &value)?;
        }
        if let Some(value) = read_env("ACCORD_EEMP_BASE_URL") {
            self.eemp.base_url = value;
        }
        if let Some(value) = read_env("ACCORD_EEMP_APP_KEY") {
            self.eemp.app_key = value;
        }
        if let Some(value) = read_env("ACCORD_EEMP_APP_SECRET") {
            self.eemp.app_secret = secret_value(value);
        }
        if let Some(value) = read_env("ACCORD_EEMP_TEMPLATE_ID") {
            self.eemp.template_id = value;
        }
        if let Some(value) = read_env("ACCORD_EEMP_CALLBACK_TOKEN") {
            self.eemp.callback_token = secret_value(value);
        }
        if let Some(value) = read_env("ACCORD_EEMP_AES_KEY") {
            self.eemp.aes_key = secret_value(value);
        }
        if let Some(value) = read_env("ACCORD_EEMP_RECEIVER_ID") {
            self.eemp.receiver_id = value;
        }
        if let Some(value) = read_env("ACCORD_EEMP_APPROVER_ID") {
            self.eemp.approver_id = Some(value);
        }
        if let Some(value) = read_env("ACCORD_EEMP_ROUTING_RULE_ID") {
            self.eemp.routing_rule_id = Some(value);
        }
        if let Some(value) = read_env("ACCORD_EEMP_REQUEST_TIMEOUT_SECS") {
            self.eemp.request_timeout_secs =
                parse_u64("ACCORD_EEMP_REQUEST_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("ACCORD_ENGINE_WEBHOOK_TIMEOUT_SECS") {
            self.engine.webhook_timeout_secs =
                parse_u64("ACCORD_ENGINE_WEBHOOK_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("ACCORD_ENGINE_RECONCILE_INTERVAL_SECS") {
            self.engine.reconcile_interval_secs =
                parse_u64("ACCORD_ENGINE_RECONCILE_INTERVAL_SECS", &value)?;
        }
        if let Some(value) = read_env("ACCORD_ENGINE_EVENT_BUFFER") {
            self.engine.event_buffer = parse_usize("ACCORD_ENGINE_EVENT_BUFFER", &value)?;
        }

        let log_level = read_env("ACCORD_LOGGING_LEVEL").or_else(|| read_env("ACCORD_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("ACCORD_LOGGING_FORMAT").or_else(|| read_env("ACCORD_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(database_url) = overrides.database_url {
            self.database.url = database_url;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(port) = overrides.server_port {
            self.server.port = port;
        }
        if let Some(enabled) = overrides.eemp_enabled {
            self.eemp.enabled = enabled;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_database(&self.database)?;
        validate_server(&self.server)?;
        validate_eemp(&self.eemp)?;
        validate_engine(&self.engine)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

pub fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    CONFIG_FILE_CANDIDATES.into_iter().map(PathBuf::from).find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_database(database: &DatabaseConfig) -> Result<(), ConfigError> {
    let url = database.url.trim();
    let sqlite_url =
        url.starts_with("sqlite://") || url.starts_with("sqlite::") || url == ":memory:";
    if !sqlite_url {
        return Err(ConfigError::Validation(
            "database.url must be a sqlite URL (`sqlite://...`, `sqlite::...`, or `:memory:`)"
                .to_string(),
        ));
    }

    if database.max_connections == 0 {
        return Err(ConfigError::Validation(
            "database.max_connections must be greater than zero".to_string(),
        ));
    }

    if database.timeout_secs == 0 || database.timeout_secs > 300 {
        return Err(ConfigError::Validation(
            "database.timeout_secs must be in range 1..=300".to_string(),
        ));
    }

    Ok(())
}

fn validate_server(server: &ServerConfig) -> Result<(), ConfigError> {
    if server.port == 0 {
        return Err(ConfigError::Validation("server.port must be greater than zero".to_string()));
    }

    if server.graceful_shutdown_secs == 0 {
        return Err(ConfigError::Validation(
            "server.graceful_shutdown_secs must be greater than zero".to_string(),
        ));
    }

    Ok(())
}

fn validate_eemp(eemp: &EempConfig) -> Result<(), ConfigError> {
    if !eemp.enabled {
        return Ok(());
    }

    if !eemp.base_url.starts_with("http://") && !eemp.base_url.starts_with("https://") {
        return Err(ConfigError::Validation(
            "eemp.base_url must start with http:// or https://".to_string(),
        ));
    }
    if !eemp.has_credentials() {
        return Err(ConfigError::Validation(
            "eemp.enabled is true but eemp.app_key, eemp.app_secret or eemp.template_id is \
             missing. Copy them from the platform's developer console > Application > Credentials"
                .to_string(),
        ));
    }
    if eemp.callback_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "eemp.callback_token is required to verify callback signatures".to_string(),
        ));
    }

    let aes_key = eemp.aes_key.expose_secret();
    if aes_key.len() != AES_KEY_LEN {
        return Err(ConfigError::Validation(format!(
            "eemp.aes_key must be exactly {AES_KEY_LEN} characters (got {})",
            aes_key.len()
        )));
    }
    if eemp.receiver_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "eemp.receiver_id is required (hint: it is usually the app key or corp id)"
                .to_string(),
        ));
    }

    let has_route = eemp.approver_id.as_deref().is_some_and(|id| !id.trim().is_empty())
        || eemp.routing_rule_id.as_deref().is_some_and(|id| !id.trim().is_empty());
    if !has_route {
        return Err(ConfigError::Validation(
            "eemp needs a routing hint: set eemp.approver_id or eemp.routing_rule_id".to_string(),
        ));
    }

    if eemp.request_timeout_secs == 0 || eemp.request_timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "eemp.request_timeout_secs must be in range 1..=120".to_string(),
        ));
    }

    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.webhook_timeout_secs == 0 || engine.webhook_timeout_secs > 120 {
        return Err(ConfigError::Validation(
            "engine.webhook_timeout_secs must be in range 1..=120".to_string(),
        ));
    }
    if engine.event_buffer == 0 {
        return Err(ConfigError::Validation(
            "engine.event_buffer must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn invalid_override(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnvOverride { key: key.to_string(), value: value.to_string() }
}

fn parse_u16(key: &str, value: &str) -> Result<u16, ConfigError> {
    value.parse::<u16>().map_err(|_| invalid_override(key, value))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| invalid_override(key, value))
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| invalid_override(key, value))
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| invalid_override(key, value))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| invalid_override(key, value))
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    database: Option<DatabasePatch>,
    server: Option<ServerPatch>,
    eemp: Option<EempPatch>,
    engine: Option<EnginePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct DatabasePatch {
    url: Option<String>,
    max_connections: Option<u32>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerPatch {
    bind_address: Option<String>,
    port: Option<u16>,
    graceful_shutdown_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EempPatch {
    enabled: Option<bool>,
    base_url: Option<String>,
    app_key: Option<String>,
    app_secret: Option<String>,
    template_id: Option<String>,
    callback_token: Option<String>,
    aes_key: Option<String>,
    receiver_id: Option<String>,
    approver_id: Option<String>,
    routing_rule_id: Option<String>,
    request_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    webhook_timeout_secs: Option<u64>,
    reconcile_interval_secs: Option<u64>,
    event_buffer: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
