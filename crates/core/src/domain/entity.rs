use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::approval::{ApprovalStatus, ProviderKind};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// User-facing mirror of [`ApprovalStatus`]. Never stored independently of it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusinessStatus {
    Draft,
    InApproval,
    Approved,
    Rejected,
}

impl BusinessStatus {
    pub fn derive(status: ApprovalStatus) -> Self {
        match status {
            ApprovalStatus::NotSubmitted => Self::Draft,
            ApprovalStatus::Pending => Self::InApproval,
            ApprovalStatus::Approved => Self::Approved,
            ApprovalStatus::Rejected => Self::Rejected,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::InApproval => "in_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "in_approval" => Some(Self::InApproval),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldValue {
    Text { value: String },
    Number { value: Decimal },
    Money { amount: Decimal, currency: String },
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text { value: value.into() }
    }

    pub fn money(amount: Decimal, currency: impl Into<String>) -> Self {
        Self::Money { amount, currency: currency.into() }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Number { .. } => "number",
            Self::Money { .. } => "money",
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Text { value } => value.clone(),
            Self::Number { value } => value.normalize().to_string(),
            Self::Money { amount, currency } => format!("{} {currency}", amount.round_dp(2)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotField {
    pub label: String,
    pub value: FieldValue,
}

/// What an approver sees about the record, rendered into the external form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub title: String,
    pub fields: Vec<SnapshotField>,
}

impl EntitySnapshot {
    pub fn new(title: impl Into<String>) -> Self {
        Self { title: title.into(), fields: Vec::new() }
    }

    pub fn with_field(mut self, label: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push(SnapshotField { label: label.into(), value });
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovableEntity {
    pub id: EntityId,
    pub approval_status: ApprovalStatus,
    pub business_status: BusinessStatus,
    pub external_reference_id: Option<String>,
    pub approval_channel: Option<ProviderKind>,
    pub submitted_by: Option<String>,
    pub decided_by: Option<String>,
    pub decided_at: Option<DateTime<Utc>>,
    pub decision_reason: Option<String>,
    pub cycle_sequence: u32,
    pub version: i64,
    pub snapshot: EntitySnapshot,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ApprovableEntity {
    pub fn new(id: EntityId, snapshot: EntitySnapshot) -> Self {
        let now = Utc::now();
        Self {
            id,
            approval_status: ApprovalStatus::NotSubmitted,
            business_status: BusinessStatus::Draft,
            external_reference_id: None,
            approval_channel: None,
            submitted_by: None,
            decided_by: None,
            decided_at: None,
            decision_reason: None,
            cycle_sequence: 0,
            version: 0,
            snapshot,
            created_at: now,
            updated_at: now,
        }
    }

    /// Writes the status and its derived mirror together.
    pub fn set_status(&mut self, status: ApprovalStatus) {
        self.approval_status = status;
        self.business_status = BusinessStatus::derive(status);
    }

    pub fn has_drifted_mirror(&self) -> bool {
        self.business_status != BusinessStatus::derive(self.approval_status)
    }

    pub(crate) fn open_cycle(
        &mut self,
        owner: ProviderKind,
        reference_id: String,
        submitted_by: &str,
    ) {
        self.cycle_sequence = self.cycle_sequence.saturating_add(1);
        self.approval_channel = Some(owner);
        self.external_reference_id = Some(reference_id);
        self.submitted_by = Some(submitted_by.to_string());
        self.decided_by = None;
        self.decided_at = None;
        self.decision_reason = None;
    }

    pub(crate) fn record_decision(&mut self, decided_by: &str, reason: Option<String>) {
        self.decided_by = Some(decided_by.to_string());
        self.decided_at = Some(Utc::now());
        self.decision_reason = reason;
    }

    pub(crate) fn close_withdrawn(&mut self) {
        self.external_reference_id = None;
    }
}
