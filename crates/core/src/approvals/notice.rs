//! Text of the messages sent to people when the two channels disagree or a
//! decision needs announcing.

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use thiserror::Error;

use crate::domain::approval::{ApprovalChannel, ApprovalStatus, ReportedStatus};
use crate::domain::entity::EntityId;

const CLARIFICATION_AGREE: &str = "clarification_agree";
const CLARIFICATION_CONFLICT: &str = "clarification_conflict";
const DECISION: &str = "decision";

const CLARIFICATION_AGREE_TEMPLATE: &str = "\
Approval {{ entity_id }} (cycle {{ cycle }}): your result `{{ reported }}` on instance \
{{ reference_id }} matches the recorded outcome. It was already {{ status }} by \
{{ decided_by }} via the {{ channel }}. No further action is needed.";

const CLARIFICATION_CONFLICT_TEMPLATE: &str = "\
Approval {{ entity_id }} (cycle {{ cycle }}): your result `{{ reported }}` on instance \
{{ reference_id }} was NOT applied. This cycle is final: {{ status }} by {{ decided_by }} \
via the {{ channel }}. Your click changes nothing.\
{% if status == \"rejected\" %} The submitter may resubmit to open a new cycle.{% endif %}";

const DECISION_TEMPLATE: &str = "\
Approval {{ entity_id }} was {{ status }} by {{ decided_by }} via the {{ channel }}.\
{% if reason %} Reason: {{ reason }}{% endif %}";

#[derive(Debug, Error)]
pub enum NoticeError {
    #[error("notice template error: {0}")]
    Template(String),
}

impl From<tera::Error> for NoticeError {
    fn from(value: tera::Error) -> Self {
        Self::Template(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Agreement {
    Agree,
    Conflict,
}

/// What the reporter needs to know about a click that could not change a closed cycle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Clarification {
    pub entity_id: EntityId,
    pub cycle_sequence: u32,
    pub reference_id: String,
    pub reported: ReportedStatus,
    pub authoritative_status: ApprovalStatus,
    pub authoritative_channel: ApprovalChannel,
    pub decided_by: String,
    pub agreement: Agreement,
}

pub struct NoticeRenderer {
    tera: Tera,
}

impl NoticeRenderer {
    pub fn new() -> Result<Self, NoticeError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (CLARIFICATION_AGREE, CLARIFICATION_AGREE_TEMPLATE),
            (CLARIFICATION_CONFLICT, CLARIFICATION_CONFLICT_TEMPLATE),
            (DECISION, DECISION_TEMPLATE),
        ])?;
        Ok(Self { tera })
    }

    pub fn clarification(&self, notice: &Clarification) -> Result<String, NoticeError> {
        let mut context = Context::new();
        context.insert("entity_id", &notice.entity_id.0);
        context.insert("cycle", &notice.cycle_sequence);
        context.insert("reference_id", &notice.reference_id);
        context.insert("reported", notice.reported.as_str());
        context.insert("status", notice.authoritative_status.as_str());
        context.insert("channel", notice.authoritative_channel.label());
        context.insert("decided_by", &notice.decided_by);

        let template = match notice.agreement {
            Agreement::Agree => CLARIFICATION_AGREE,
            Agreement::Conflict => CLARIFICATION_CONFLICT,
        };
        Ok(self.tera.render(template, &context)?)
    }

    pub fn decision(
        &self,
        entity_id: &EntityId,
        status: ApprovalStatus,
        decided_by: &str,
        channel: ApprovalChannel,
        reason: Option<&str>,
    ) -> Result<String, NoticeError> {
        let mut context = Context::new();
        context.insert("entity_id", &entity_id.0);
        context.insert("status", status.as_str());
        context.insert("decided_by", decided_by);
        context.insert("channel", channel.label());
        context.insert("reason", &reason.filter(|value| !value.trim().is_empty()));
        Ok(self.tera.render(DECISION, &context)?)
    }
}
