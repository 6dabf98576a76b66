//! The single authority for approval state transitions.
//!
//! Every ingress path (internal UI, API callers, verified platform callbacks)
//! ends up in [`ApprovalEngine::execute`]. Work on one entity is serialized by
//! an in-process lock and guarded across processes by the entity version.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::approvals::ledger::{
    standardize_comment, ApprovalLedger, LedgerStatistics, RepairOutcome,
};
use crate::approvals::machine::transition;
use crate::approvals::provider::ProviderSet;
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink};
use crate::domain::approval::{
    ApprovalAction, ApprovalChannel, ApprovalEvent, ApprovalOperation, ApprovalRecord,
    ApprovalStatus, ProviderKind,
};
use crate::domain::entity::{ApprovableEntity, EntityId};
use crate::errors::{ApplicationError, DomainError};
use crate::store::ApprovalStore;

pub const DEFAULT_EVENT_BUFFER: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub entity_id: EntityId,
    pub previous_status: ApprovalStatus,
    pub new_status: ApprovalStatus,
    pub cycle_sequence: u32,
    pub external_reference_id: Option<String>,
    pub record: ApprovalRecord,
}

/// Flat view of an `execute` result for callers that only need a verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResult {
    pub success: bool,
    pub message: String,
    pub new_status: Option<ApprovalStatus>,
    pub external_reference_id: Option<String>,
    pub retryable: bool,
}

impl ApprovalResult {
    pub fn from_result(result: &Result<ExecutionOutcome, ApplicationError>) -> Self {
        match result {
            Ok(outcome) => Self {
                success: true,
                message: outcome.record.comment.clone(),
                new_status: Some(outcome.new_status),
                external_reference_id: outcome.external_reference_id.clone(),
                retryable: false,
            },
            Err(error) => Self {
                success: false,
                message: error.to_string(),
                new_status: None,
                external_reference_id: None,
                retryable: error.is_retryable(),
            },
        }
    }
}

#[derive(Default)]
struct EntityLocks {
    slots: Mutex<HashMap<EntityId, Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityLocks {
    async fn acquire(&self, entity_id: &EntityId) -> EntityLease<'_> {
        let slot = {
            let mut slots = match self.slots.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            slots.entry(entity_id.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        EntityLease { locks: self, entity_id: entity_id.clone(), guard: Some(guard) }
    }

    fn prune(&self, entity_id: &EntityId) {
        let mut slots = match self.slots.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slots.get(entity_id).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            slots.remove(entity_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        match self.slots.lock() {
            Ok(slots) => slots.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }
}

struct EntityLease<'a> {
    locks: &'a EntityLocks,
    entity_id: EntityId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for EntityLease<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks.prune(&self.entity_id);
    }
}

pub struct ApprovalEngine {
    store: Arc<dyn ApprovalStore>,
    providers: ProviderSet,
    ledger: ApprovalLedger,
    audit: Arc<dyn AuditSink>,
    events: broadcast::Sender<ApprovalEvent>,
    locks: EntityLocks,
}

impl ApprovalEngine {
    pub fn new(store: Arc<dyn ApprovalStore>, providers: ProviderSet) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_BUFFER);
        Self {
            ledger: ApprovalLedger::new(store.clone()),
            store,
            providers,
            audit: Arc::new(NoopAuditSink),
            events,
            locks: EntityLocks::default(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Replaces the event channel. Subscribe after calling this.
    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        self.events = events;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ApprovalEvent> {
        self.events.subscribe()
    }

    pub fn providers(&self) -> &ProviderSet {
        &self.providers
    }

    pub fn store(&self) -> &Arc<dyn ApprovalStore> {
        &self.store
    }

    pub async fn register(&self, entity: ApprovableEntity) -> Result<(), ApplicationError> {
        let entity_id = entity.id.clone();
        self.store.insert_entity(entity).await?;
        info!(
            event_name = "approval.entity_registered",
            entity_id = %entity_id,
            "approvable entity registered"
        );
        Ok(())
    }

    pub async fn entity(
        &self,
        entity_id: &EntityId,
    ) -> Result<ApprovableEntity, ApplicationError> {
        self.store
            .load_entity(entity_id)
            .await?
            .ok_or_else(|| ApplicationError::EntityNotFound(entity_id.clone()))
    }

    pub async fn current_status(
        &self,
        entity_id: &EntityId,
    ) -> Result<ApprovalStatus, ApplicationError> {
        Ok(self.entity(entity_id).await?.approval_status)
    }

    pub async fn history(
        &self,
        entity_id: &EntityId,
    ) -> Result<Vec<ApprovalRecord>, ApplicationError> {
        self.ledger.history(entity_id).await
    }

    pub async fn statistics(&self) -> Result<LedgerStatistics, ApplicationError> {
        self.ledger.statistics().await
    }

    pub async fn repair(&self, entity_id: &EntityId) -> Result<RepairOutcome, ApplicationError> {
        let _lease = self.locks.acquire(entity_id).await;
        self.ledger.repair(entity_id).await
    }

    pub async fn execute(
        &self,
        operation: ApprovalOperation,
    ) -> Result<ExecutionOutcome, ApplicationError> {
        let correlation_id = operation
            .metadata
            .get("correlation_id")
            .cloned()
            .unwrap_or_else(|| format!("approval-{}", Uuid::new_v4().simple()));

        let result = {
            let _lease = self.locks.acquire(&operation.entity_id).await;
            self.execute_locked(&operation).await
        };

        match &result {
            Ok(outcome) => {
                info!(
                    event_name = "approval.transition_applied",
                    correlation_id = %correlation_id,
                    entity_id = %operation.entity_id,
                    action = %operation.action,
                    channel = %operation.channel,
                    from = %outcome.previous_status,
                    to = %outcome.new_status,
                    cycle_sequence = outcome.cycle_sequence,
                    "approval transition applied"
                );
                self.audit.emit(
                    self.audit_event(&operation, &correlation_id, AuditOutcome::Success)
                        .with_metadata("from", outcome.previous_status.as_str())
                        .with_metadata("to", outcome.new_status.as_str())
                        .with_metadata("cycle_sequence", outcome.cycle_sequence.to_string())
                        .with_metadata("record_id", outcome.record.record_id.clone()),
                );
            }
            Err(error) => {
                warn!(
                    event_name = "approval.transition_rejected",
                    correlation_id = %correlation_id,
                    entity_id = %operation.entity_id,
                    action = %operation.action,
                    channel = %operation.channel,
                    error_class = error.error_class(),
                    error = %error,
                    "approval transition rejected"
                );
                let outcome = if error.is_retryable() {
                    AuditOutcome::Failed
                } else {
                    AuditOutcome::Rejected
                };
                self.audit.emit(
                    self.audit_event(&operation, &correlation_id, outcome)
                        .with_metadata("error_class", error.error_class())
                        .with_metadata("error", error.to_string()),
                );
            }
        }

        result
    }

    async fn execute_locked(
        &self,
        operation: &ApprovalOperation,
    ) -> Result<ExecutionOutcome, ApplicationError> {
        let mut entity = self.entity(&operation.entity_id).await?;
        let previous_status = entity.approval_status;
        let expected_version = entity.version;

        if previous_status.is_terminal() && operation.action != ApprovalAction::Resubmit {
            return Err(DomainError::FinalStateProtected {
                entity_id: entity.id.clone(),
                cycle_sequence: entity.cycle_sequence,
                status: previous_status,
            }
            .into());
        }
        if let Some(expected) = operation.expected_cycle {
            if expected != entity.cycle_sequence {
                return Err(DomainError::StaleCycle {
                    entity_id: entity.id.clone(),
                    expected,
                    current: entity.cycle_sequence,
                }
                .into());
            }
        }

        let step = transition(previous_status, operation.action).map_err(DomainError::from)?;
        check_permission(&entity, operation)?;

        let reason = operation.reason.clone().or_else(|| operation.comment.clone());
        let mut record_reference = entity.external_reference_id.clone();
        let mut opened_on = None;

        match operation.action {
            ApprovalAction::Submit | ApprovalAction::Resubmit => {
                let (owner, reference_id) =
                    self.providers.submit(&entity, &operation.operator_id).await?;
                entity.open_cycle(owner, reference_id.clone(), &operation.operator_id);
                record_reference = Some(reference_id);
                opened_on = Some(owner);
            }
            ApprovalAction::Approve | ApprovalAction::Reject => {
                let provider =
                    self.providers.for_cycle(entity.approval_channel, operation.channel)?;
                if let Some(reference_id) = entity.external_reference_id.as_deref() {
                    provider
                        .decide(
                            reference_id,
                            operation.action,
                            &operation.operator_id,
                            reason.as_deref(),
                        )
                        .await?;
                }
                entity.record_decision(&operation.operator_id, reason.clone());
            }
            ApprovalAction::Withdraw => {
                let provider =
                    self.providers.for_cycle(entity.approval_channel, operation.channel)?;
                if let Some(reference_id) = entity.external_reference_id.as_deref() {
                    provider.cancel(reference_id).await?;
                }
                entity.close_withdrawn();
            }
        }

        entity.set_status(step.to);
        entity.version = expected_version + 1;
        entity.updated_at = Utc::now();

        let record = ApprovalRecord::new(
            entity.id.clone(),
            entity.cycle_sequence,
            operation.action,
            step.to,
            operation.channel,
            operation.operator_id.clone(),
            record_reference,
            standardize_comment(
                operation.action,
                operation.channel,
                operation.comment.as_deref(),
                operation.reason.as_deref(),
            ),
        );

        if let Err(store_error) = self.store.commit(&entity, expected_version, &record).await {
            if let (Some(owner), Some(reference_id)) =
                (opened_on, record.external_reference_id.as_deref())
            {
                self.abandon_opened_cycle(owner, reference_id, &entity.id).await;
            }
            return Err(store_error.into());
        }

        let event = ApprovalEvent {
            entity_id: entity.id.clone(),
            cycle_sequence: entity.cycle_sequence,
            action: operation.action,
            channel: operation.channel,
            new_status: step.to,
            approval_channel: entity.approval_channel,
            external_reference_id: record.external_reference_id.clone(),
            operator_id: operation.operator_id.clone(),
            submitted_by: entity.submitted_by.clone(),
            reason,
            occurred_at: record.created_at,
        };
        if self.events.send(event).is_err() {
            debug!(
                event_name = "approval.event_unobserved",
                entity_id = %entity.id,
                "no subscriber for approval event"
            );
        }

        Ok(ExecutionOutcome {
            entity_id: entity.id.clone(),
            previous_status,
            new_status: step.to,
            cycle_sequence: entity.cycle_sequence,
            external_reference_id: entity.external_reference_id.clone(),
            record,
        })
    }

    async fn abandon_opened_cycle(
        &self,
        owner: ProviderKind,
        reference_id: &str,
        entity_id: &EntityId,
    ) {
        let provider = match owner {
            ProviderKind::External => self.providers.external(),
            ProviderKind::Internal => Some(self.providers.internal()),
        };
        let Some(provider) = provider else {
            return;
        };
        if let Err(cancel_error) = provider.cancel(reference_id).await {
            error!(
                event_name = "approval.orphaned_instance",
                entity_id = %entity_id,
                reference_id,
                error = %cancel_error,
                "commit failed and the opened approval instance could not be cancelled"
            );
        }
    }

    fn audit_event(
        &self,
        operation: &ApprovalOperation,
        correlation_id: &str,
        outcome: AuditOutcome,
    ) -> AuditEvent {
        let event_type = match outcome {
            AuditOutcome::Success => "approval.transition_applied",
            AuditOutcome::Rejected | AuditOutcome::Failed => "approval.transition_rejected",
        };
        AuditEvent::new(
            Some(operation.entity_id.clone()),
            correlation_id,
            event_type,
            AuditCategory::Approval,
            operation.operator_id.clone(),
            outcome,
        )
        .with_metadata("action", operation.action.as_str())
        .with_metadata("channel", operation.channel.as_str())
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.len()
    }
}

/// Only the submitter may withdraw through the internal app or the API.
/// Withdrawals reported by the platform were authorized there.
fn check_permission(
    entity: &ApprovableEntity,
    operation: &ApprovalOperation,
) -> Result<(), DomainError> {
    if operation.action != ApprovalAction::Withdraw
        || operation.channel == ApprovalChannel::External
    {
        return Ok(());
    }
    match entity.submitted_by.as_deref() {
        Some(submitter) if submitter != operation.operator_id => {
            Err(DomainError::PermissionDenied {
                entity_id: entity.id.clone(),
                operator_id: operation.operator_id.clone(),
                action: operation.action,
                reason: format!("only the submitter `{submitter}` may withdraw"),
            })
        }
        _ => Ok(()),
    }
}
