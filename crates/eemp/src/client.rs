//! HTTP client for the messaging platform's open API.

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use accord_core::config::EempConfig;

/// Tokens are refreshed this long before the platform says they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("platform unreachable: {0}")]
    Transport(String),
    #[error("platform returned HTTP {status}")]
    Http { status: u16 },
    #[error("platform error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("unexpected platform response: {0}")]
    Decode(String),
}

impl ClientError {
    /// Whether the platform could not be reached at all, as opposed to refusing the call.
    pub fn is_unreachable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Http { status } => *status >= 500,
            Self::Api { .. } | Self::Decode(_) => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FormComponent {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CreateInstanceRequest {
    pub process_code: String,
    pub originator_user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approvers: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_rule_id: Option<String>,
    pub form_component_values: Vec<FormComponent>,
}

/// Instance status fields as the platform spells them.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct InstanceSnapshot {
    pub status: String,
    #[serde(default)]
    pub result: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct CreateInstanceResponse {
    process_instance_id: String,
}

#[derive(Debug, Deserialize)]
struct GetInstanceResponse {
    process_instance: InstanceSnapshot,
}

#[derive(Clone)]
struct CachedToken {
    value: SecretString,
    expires_at: DateTime<Utc>,
}

pub struct EempClient {
    http: Client,
    base_url: String,
    app_key: String,
    app_secret: SecretString,
    token: Mutex<Option<CachedToken>>,
}

impl EempClient {
    pub fn new(config: &EempConfig) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            app_key: config.app_key.clone(),
            app_secret: config.app_secret.clone(),
            token: Mutex::new(None),
        })
    }

    /// Cached access token, fetched again once it is within the refresh margin.
    pub async fn access_token(&self) -> Result<SecretString, ClientError> {
        let mut cached = self.token.lock().await;
        let now = Utc::now();
        if let Some(token) = cached.as_ref() {
            if token.expires_at - chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > now {
                return Ok(token.value.clone());
            }
        }

        let response = self
            .http
            .get(format!("{}/gettoken", self.base_url))
            .query(&[
                ("appkey", self.app_key.as_str()),
                ("appsecret", self.app_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let token: TokenResponse = decode_response(response).await?;

        debug!(
            event_name = "eemp.client.token_refreshed",
            expires_in = token.expires_in,
            "platform access token refreshed"
        );
        let value: SecretString = token.access_token.into();
        *cached = Some(CachedToken {
            value: value.clone(),
            expires_at: now + chrono::Duration::seconds(token.expires_in.clamp(0, 86_400)),
        });
        Ok(value)
    }

    async fn call<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ClientError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .query(&[("access_token", token.expose_secret())])
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let result = decode_response(response).await;
        if let Err(error) = &result {
            warn!(
                event_name = "eemp.client.call_failed",
                path,
                error = %error,
                "platform call failed"
            );
        }
        result
    }

    pub async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
    ) -> Result<String, ClientError> {
        let body = serde_json::to_value(request).map_err(|e| ClientError::Decode(e.to_string()))?;
        let created: CreateInstanceResponse =
            self.call("/topapi/processinstance/create", &body).await?;
        Ok(created.process_instance_id)
    }

    pub async fn add_comment(
        &self,
        instance_id: &str,
        user_id: &str,
        text: &str,
    ) -> Result<(), ClientError> {
        let body = json!({
            "request": {
                "process_instance_id": instance_id,
                "comment_user_id": user_id,
                "text": text,
            }
        });
        self.call::<Value>("/topapi/process/instance/comment/add", &body).await.map(|_| ())
    }

    pub async fn terminate_instance(
        &self,
        instance_id: &str,
        remark: &str,
    ) -> Result<(), ClientError> {
        let body = json!({
            "request": {
                "process_instance_id": instance_id,
                "is_system": true,
                "remark": remark,
            }
        });
        self.call::<Value>("/topapi/process/instance/terminate", &body).await.map(|_| ())
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<InstanceSnapshot, ClientError> {
        let body = json!({ "process_instance_id": instance_id });
        let found: GetInstanceResponse = self.call("/topapi/processinstance/get", &body).await?;
        Ok(found.process_instance)
    }

    pub async fn send_text(&self, user_id: &str, text: &str) -> Result<(), ClientError> {
        let body = json!({
            "userid_list": user_id,
            "msg": { "msgtype": "text", "text": { "content": text } },
        });
        self.call::<Value>("/topapi/message/corpconversation/asyncsend_v2", &body)
            .await
            .map(|_| ())
    }
}

/// Checks HTTP status and the `errcode` envelope, then decodes the body.
async fn decode_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ClientError> {
    let status = response.status();
    if !status.is_success() {
        return Err(ClientError::Http { status: status.as_u16() });
    }

    let body: Value = response.json().await.map_err(|e| ClientError::Decode(e.to_string()))?;
    let code = body.get("errcode").and_then(Value::as_i64).unwrap_or(0);
    if code != 0 {
        let message =
            body.get("errmsg").and_then(Value::as_str).unwrap_or("unknown error").to_string();
        return Err(ClientError::Api { code, message });
    }

    serde_json::from_value(body).map_err(|e| ClientError::Decode(e.to_string()))
}
