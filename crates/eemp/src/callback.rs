//! Inbound callback handling: URL verification handshake and encrypted event delivery.

use accord_core::approvals::ExternalReport;
use accord_core::domain::approval::ReportedStatus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::crypto::{CallbackCrypto, CryptoError};

/// Literal body the platform expects after a delivered event.
pub const ACK_BODY: &str = "success";

const EVENT_CHECK_URL: &str = "check_url";
const EVENT_INSTANCE_CHANGE: &str = "bpms_instance_change";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackQuery {
    #[serde(alias = "msg_signature")]
    pub signature: String,
    pub timestamp: String,
    pub nonce: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallbackEnvelope {
    pub encrypt: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallbackEvent {
    /// Platform re-verifying the callback URL; acknowledge only.
    CheckUrl,
    InstanceChange(ExternalReport),
    /// Subscribed but irrelevant event types are acknowledged and dropped.
    Ignored { event_type: String },
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallbackError {
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("verification request carries no challenge")]
    MissingChallenge,
    #[error("malformed callback event: {0}")]
    MalformedEvent(String),
}

impl CallbackError {
    pub fn is_signature_failure(&self) -> bool {
        matches!(self, Self::Crypto(CryptoError::SignatureInvalid))
    }
}

#[derive(Debug)]
pub struct CallbackHandler {
    crypto: CallbackCrypto,
}

impl CallbackHandler {
    pub fn new(crypto: CallbackCrypto) -> Self {
        Self { crypto }
    }

    pub fn crypto(&self) -> &CallbackCrypto {
        &self.crypto
    }

    /// Answers the URL verification GET: the decrypted challenge, echoed back.
    pub fn handshake(&self, query: &CallbackQuery) -> Result<String, CallbackError> {
        let challenge = query.challenge.as_deref().ok_or(CallbackError::MissingChallenge)?;
        Ok(self.crypto.open(&query.signature, &query.timestamp, &query.nonce, challenge)?)
    }

    pub fn open_event(
        &self,
        query: &CallbackQuery,
        envelope: &CallbackEnvelope,
    ) -> Result<CallbackEvent, CallbackError> {
        let message =
            self.crypto.open(&query.signature, &query.timestamp, &query.nonce, &envelope.encrypt)?;
        parse_event(&message)
    }

    /// Builds a signed query and envelope the way the platform would send them.
    pub fn seal(
        &self,
        payload: &str,
        timestamp: &str,
        nonce: &str,
    ) -> Result<(CallbackQuery, CallbackEnvelope), CallbackError> {
        let encrypt = self.crypto.encrypt(payload)?;
        let query = CallbackQuery {
            signature: self.crypto.sign(timestamp, nonce, &encrypt),
            timestamp: timestamp.to_string(),
            nonce: nonce.to_string(),
            challenge: None,
        };
        Ok((query, CallbackEnvelope { encrypt }))
    }
}

fn text_field<'a>(message: &'a Value, name: &str) -> Option<&'a str> {
    message.get(name).and_then(Value::as_str).map(str::trim).filter(|value| !value.is_empty())
}

pub fn parse_event(message: &str) -> Result<CallbackEvent, CallbackError> {
    let value: Value = serde_json::from_str(message)
        .map_err(|e| CallbackError::MalformedEvent(format!("invalid JSON: {e}")))?;
    let event_type = text_field(&value, "EventType")
        .ok_or_else(|| CallbackError::MalformedEvent("missing EventType".to_string()))?;

    match event_type {
        EVENT_CHECK_URL => Ok(CallbackEvent::CheckUrl),
        EVENT_INSTANCE_CHANGE => instance_change(&value).map(CallbackEvent::InstanceChange),
        other => Ok(CallbackEvent::Ignored { event_type: other.to_string() }),
    }
}

fn instance_change(value: &Value) -> Result<ExternalReport, CallbackError> {
    let reference_id = text_field(value, "processInstanceId")
        .ok_or_else(|| CallbackError::MalformedEvent("missing processInstanceId".to_string()))?;
    let change_type = text_field(value, "type")
        .ok_or_else(|| CallbackError::MalformedEvent("missing type".to_string()))?;

    let reported_status = match (change_type, text_field(value, "result")) {
        ("start", _) => ReportedStatus::Running,
        ("terminate", _) => ReportedStatus::Terminated,
        ("finish", Some("agree")) => ReportedStatus::Approved,
        ("finish", Some("refuse")) => ReportedStatus::Rejected,
        (kind, result) => {
            return Err(CallbackError::MalformedEvent(format!(
                "unsupported instance change type={kind} result={}",
                result.unwrap_or("<none>")
            )));
        }
    };

    Ok(ExternalReport {
        reference_id: reference_id.to_string(),
        reported_status,
        reporter_id: text_field(value, "staffId").map(str::to_string),
        comment: text_field(value, "remark").map(str::to_string),
    })
}
