use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::entity::EntityId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    NotSubmitted,
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotSubmitted => "not_submitted",
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Approved and rejected close a cycle; only a resubmission can move on from them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Approved | Self::Rejected)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Submit,
    Approve,
    Reject,
    Withdraw,
    Resubmit,
}

impl ApprovalAction {
    pub const ALL: [ApprovalAction; 5] =
        [Self::Submit, Self::Approve, Self::Reject, Self::Withdraw, Self::Resubmit];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submit => "submit",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Withdraw => "withdraw",
            Self::Resubmit => "resubmit",
        }
    }

    pub fn opens_cycle(self) -> bool {
        matches!(self, Self::Submit | Self::Resubmit)
    }

    pub fn is_decision(self) -> bool {
        matches!(self, Self::Approve | Self::Reject)
    }

    /// Wording used in the ledger when the operator left no comment.
    pub fn default_comment(self) -> &'static str {
        match self {
            Self::Submit => "Submitted for approval",
            Self::Approve => "Approved",
            Self::Reject => "Rejected",
            Self::Withdraw => "Withdrawn",
            Self::Resubmit => "Resubmitted for approval",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalChannel {
    Internal,
    External,
    Api,
}

impl ApprovalChannel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
            Self::Api => "api",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Internal => "internal app",
            Self::External => "external platform",
            Self::Api => "API",
        }
    }
}

/// Which provider owns the active approval cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Internal,
    External,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => "internal",
            Self::External => "external",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("unknown {kind} value `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self { kind, value: value.to_string() }
    }
}

impl FromStr for ApprovalStatus {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "not_submitted" => Ok(Self::NotSubmitted),
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(ParseEnumError::new("approval status", value)),
        }
    }
}

impl FromStr for ApprovalAction {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "submit" => Ok(Self::Submit),
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "withdraw" => Ok(Self::Withdraw),
            "resubmit" => Ok(Self::Resubmit),
            _ => Err(ParseEnumError::new("approval action", value)),
        }
    }
}

impl FromStr for ApprovalChannel {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "internal" => Ok(Self::Internal),
            "external" => Ok(Self::External),
            "api" => Ok(Self::Api),
            _ => Err(ParseEnumError::new("approval channel", value)),
        }
    }
}

impl FromStr for ProviderKind {
    type Err = ParseEnumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "internal" => Ok(Self::Internal),
            "external" => Ok(Self::External),
            _ => Err(ParseEnumError::new("provider kind", value)),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for ApprovalChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command against one entity. Built by a caller, consumed once by the engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalOperation {
    pub action: ApprovalAction,
    pub entity_id: EntityId,
    pub operator_id: String,
    pub channel: ApprovalChannel,
    pub comment: Option<String>,
    pub reason: Option<String>,
    /// When set, the operation only applies while the entity is still on this cycle.
    pub expected_cycle: Option<u32>,
    pub metadata: BTreeMap<String, String>,
}

impl ApprovalOperation {
    pub fn new(
        entity_id: EntityId,
        action: ApprovalAction,
        operator_id: impl Into<String>,
        channel: ApprovalChannel,
    ) -> Self {
        Self {
            action,
            entity_id,
            operator_id: operator_id.into(),
            channel,
            comment: None,
            reason: None,
            expected_cycle: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn for_cycle(mut self, cycle_sequence: u32) -> Self {
        self.expected_cycle = Some(cycle_sequence);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub record_id: String,
    pub entity_id: EntityId,
    pub cycle_sequence: u32,
    pub action: ApprovalAction,
    pub resulting_status: ApprovalStatus,
    pub channel: ApprovalChannel,
    pub operator_id: String,
    pub external_reference_id: Option<String>,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

impl ApprovalRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entity_id: EntityId,
        cycle_sequence: u32,
        action: ApprovalAction,
        resulting_status: ApprovalStatus,
        channel: ApprovalChannel,
        operator_id: impl Into<String>,
        external_reference_id: Option<String>,
        comment: impl Into<String>,
    ) -> Self {
        Self {
            record_id: format!("APREC-{}", Uuid::new_v4().simple()),
            entity_id,
            cycle_sequence,
            action,
            resulting_status,
            channel,
            operator_id: operator_id.into(),
            external_reference_id,
            comment: comment.into(),
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.resulting_status.is_terminal()
    }
}

/// Published by the engine after every committed operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalEvent {
    pub entity_id: EntityId,
    pub cycle_sequence: u32,
    pub action: ApprovalAction,
    pub channel: ApprovalChannel,
    pub new_status: ApprovalStatus,
    pub approval_channel: Option<ProviderKind>,
    pub external_reference_id: Option<String>,
    pub operator_id: String,
    pub submitted_by: Option<String>,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Instance status as reported by the external platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportedStatus {
    Running,
    Approved,
    Rejected,
    Terminated,
}

impl ReportedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Terminated => "terminated",
        }
    }

    /// The engine action that applies this report to a pending cycle.
    pub fn action(self) -> Option<ApprovalAction> {
        match self {
            Self::Running => None,
            Self::Approved => Some(ApprovalAction::Approve),
            Self::Rejected => Some(ApprovalAction::Reject),
            Self::Terminated => Some(ApprovalAction::Withdraw),
        }
    }

    /// The internal status this report claims the cycle ended in.
    pub fn implied_status(self) -> ApprovalStatus {
        match self {
            Self::Running => ApprovalStatus::Pending,
            Self::Approved => ApprovalStatus::Approved,
            Self::Rejected => ApprovalStatus::Rejected,
            Self::Terminated => ApprovalStatus::NotSubmitted,
        }
    }
}

impl fmt::Display for ReportedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
