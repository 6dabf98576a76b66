//! Read side of the append-only approval ledger, plus status drift repair.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::approval::{ApprovalAction, ApprovalChannel, ApprovalRecord, ApprovalStatus};
use crate::domain::entity::{ApprovableEntity, BusinessStatus, EntityId};
use crate::errors::ApplicationError;
use crate::store::ApprovalStore;

/// Ledger wording for one operation: `"<text> (via <channel label>)"`.
///
/// The text is the operator comment, else the reason, else the action's
/// default wording. Blank strings count as absent.
pub fn standardize_comment(
    action: ApprovalAction,
    channel: ApprovalChannel,
    comment: Option<&str>,
    reason: Option<&str>,
) -> String {
    let text = [comment, reason]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| action.default_comment());
    format!("{text} (via {})", channel.label())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub total_records: u64,
    pub by_action: BTreeMap<String, u64>,
    pub by_channel: BTreeMap<String, u64>,
    pub by_status: BTreeMap<String, u64>,
}

impl LedgerStatistics {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a ApprovalRecord>) -> Self {
        let mut stats = Self::default();
        for record in records {
            stats.add(
                record.action.as_str(),
                record.channel.as_str(),
                record.resulting_status.as_str(),
                1,
            );
        }
        stats
    }

    /// Folds one pre-aggregated bucket in. Used by stores that count in SQL.
    pub fn add(&mut self, action: &str, channel: &str, status: &str, count: u64) {
        self.total_records += count;
        *self.by_action.entry(action.to_string()).or_default() += count;
        *self.by_channel.entry(channel.to_string()).or_default() += count;
        *self.by_status.entry(status.to_string()).or_default() += count;
    }
}

/// Status implied by the ledger: the last record of the highest cycle.
pub fn derive_status(records: &[ApprovalRecord]) -> ApprovalStatus {
    let Some(latest_cycle) = records.iter().map(|record| record.cycle_sequence).max() else {
        return ApprovalStatus::NotSubmitted;
    };
    records
        .iter()
        .rev()
        .find(|record| record.cycle_sequence == latest_cycle)
        .map(|record| record.resulting_status)
        .unwrap_or(ApprovalStatus::NotSubmitted)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDrift {
    pub entity_id: EntityId,
    pub stored_status: ApprovalStatus,
    pub stored_business_status: BusinessStatus,
    pub derived_status: ApprovalStatus,
}

pub fn detect_drift(entity: &ApprovableEntity, records: &[ApprovalRecord]) -> Option<StatusDrift> {
    let derived = derive_status(records);
    let drifted = entity.approval_status != derived
        || entity.business_status != BusinessStatus::derive(derived);
    drifted.then(|| StatusDrift {
        entity_id: entity.id.clone(),
        stored_status: entity.approval_status,
        stored_business_status: entity.business_status,
        derived_status: derived,
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    Consistent { status: ApprovalStatus },
    Repaired { drift: StatusDrift },
}

#[derive(Clone)]
pub struct ApprovalLedger {
    store: Arc<dyn ApprovalStore>,
}

impl ApprovalLedger {
    pub fn new(store: Arc<dyn ApprovalStore>) -> Self {
        Self { store }
    }

    pub async fn history(
        &self,
        entity_id: &EntityId,
    ) -> Result<Vec<ApprovalRecord>, ApplicationError> {
        Ok(self.store.history(entity_id).await?)
    }

    pub async fn statistics(&self) -> Result<LedgerStatistics, ApplicationError> {
        Ok(self.store.statistics().await?)
    }

    pub async fn check(
        &self,
        entity_id: &EntityId,
    ) -> Result<Option<StatusDrift>, ApplicationError> {
        let entity = self.load(entity_id).await?;
        let records = self.store.history(entity_id).await?;
        Ok(detect_drift(&entity, &records))
    }

    /// Rewrites the stored status from the ledger when they disagree.
    ///
    /// Callers that race the engine should hold the entity lock; the version
    /// check still rejects a concurrent commit.
    pub async fn repair(&self, entity_id: &EntityId) -> Result<RepairOutcome, ApplicationError> {
        let mut entity = self.load(entity_id).await?;
        let records = self.store.history(entity_id).await?;
        let Some(drift) = detect_drift(&entity, &records) else {
            return Ok(RepairOutcome::Consistent { status: entity.approval_status });
        };

        warn!(
            event_name = "approval.ledger.drift_detected",
            entity_id = %entity_id,
            stored_status = %drift.stored_status,
            derived_status = %drift.derived_status,
            "stored approval status disagrees with ledger"
        );

        let expected_version = entity.version;
        entity.set_status(drift.derived_status);
        entity.version += 1;
        entity.updated_at = chrono::Utc::now();
        self.store.update_entity(&entity, expected_version).await?;

        info!(
            event_name = "approval.ledger.drift_repaired",
            entity_id = %entity_id,
            status = %drift.derived_status,
            "approval status repaired from ledger"
        );
        Ok(RepairOutcome::Repaired { drift })
    }

    async fn load(&self, entity_id: &EntityId) -> Result<ApprovableEntity, ApplicationError> {
        self.store
            .load_entity(entity_id)
            .await?
            .ok_or_else(|| ApplicationError::EntityNotFound(entity_id.clone()))
    }
}
