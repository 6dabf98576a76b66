//! Keeps the internal ledger and the external platform telling the same story.
//!
//! Outbound: decisions taken in the internal app close the matching platform
//! instance. Inbound: platform reports are replayed through the engine, and
//! reports that can no longer change a closed cycle turn into a clarification
//! notice for whoever clicked.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::approvals::engine::ApprovalEngine;
use crate::approvals::notice::{Agreement, Clarification, NoticeError, NoticeRenderer};
use crate::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, NoopAuditSink};
use crate::domain::approval::{
    ApprovalChannel, ApprovalEvent, ApprovalOperation, ApprovalRecord, ApprovalStatus,
    ProviderKind, ReportedStatus,
};
use crate::domain::entity::EntityId;
use crate::errors::{ApplicationError, DomainError};
use crate::notify::Notifier;
use crate::store::ReferenceOwner;

const RECONCILER_OPERATOR: &str = "eemp-reconciler";

/// One status report about a platform instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalReport {
    pub reference_id: String,
    pub reported_status: ReportedStatus,
    /// Platform user who acted. `None` for reports pulled by the reconciler,
    /// which never produce notices.
    pub reporter_id: Option<String>,
    pub comment: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Applied {
        entity_id: EntityId,
        cycle_sequence: u32,
        new_status: ApprovalStatus,
    },
    Unchanged {
        entity_id: EntityId,
        cycle_sequence: u32,
    },
    Protected {
        entity_id: EntityId,
        cycle_sequence: u32,
        authoritative_status: ApprovalStatus,
        authoritative_channel: ApprovalChannel,
        agreement: Agreement,
        notice_sent: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PropagationOutcome {
    Skipped,
    Propagated { instance_cancelled: bool, submitter_notified: bool },
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub examined: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub failed: usize,
}

pub struct SyncService {
    engine: Arc<ApprovalEngine>,
    notifier: Arc<dyn Notifier>,
    notices: NoticeRenderer,
    audit: Arc<dyn AuditSink>,
}

impl SyncService {
    pub fn new(
        engine: Arc<ApprovalEngine>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self, NoticeError> {
        Ok(Self {
            engine,
            notifier,
            notices: NoticeRenderer::new()?,
            audit: Arc::new(NoopAuditSink),
        })
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn engine(&self) -> &Arc<ApprovalEngine> {
        &self.engine
    }

    pub async fn sync_from_external(
        &self,
        report: ExternalReport,
    ) -> Result<SyncOutcome, ApplicationError> {
        let owner = self
            .engine
            .store()
            .find_reference_owner(&report.reference_id)
            .await?
            .ok_or_else(|| ApplicationError::UnknownReference(report.reference_id.clone()))?;

        let Some(action) = report.reported_status.action() else {
            debug!(
                event_name = "sync.inbound.running",
                entity_id = %owner.entity_id,
                reference_id = %report.reference_id,
                "instance still running, nothing to apply"
            );
            return Ok(SyncOutcome::Unchanged {
                entity_id: owner.entity_id,
                cycle_sequence: owner.cycle_sequence,
            });
        };

        let operator = report.reporter_id.as_deref().unwrap_or(RECONCILER_OPERATOR);
        let mut operation = ApprovalOperation::new(
            owner.entity_id.clone(),
            action,
            operator,
            ApprovalChannel::External,
        )
        .for_cycle(owner.cycle_sequence)
        .with_metadata("reference_id", report.reference_id.clone());
        if let Some(comment) = report.comment.as_deref().filter(|value| !value.trim().is_empty()) {
            operation = operation.with_comment(comment);
        }

        match self.engine.execute(operation).await {
            Ok(outcome) => {
                info!(
                    event_name = "sync.inbound.applied",
                    entity_id = %outcome.entity_id,
                    reference_id = %report.reference_id,
                    new_status = %outcome.new_status,
                    "platform report applied"
                );
                Ok(SyncOutcome::Applied {
                    entity_id: outcome.entity_id,
                    cycle_sequence: outcome.cycle_sequence,
                    new_status: outcome.new_status,
                })
            }
            Err(error) if error.is_closed_cycle() => self.protect(owner, &report).await,
            Err(error) => Err(error),
        }
    }

    async fn protect(
        &self,
        owner: ReferenceOwner,
        report: &ExternalReport,
    ) -> Result<SyncOutcome, ApplicationError> {
        let history = self.engine.history(&owner.entity_id).await?;
        let authoritative = closing_record(&history, owner.cycle_sequence).ok_or_else(|| {
            DomainError::InvariantViolation(format!(
                "closed cycle {} of {} has no ledger record",
                owner.cycle_sequence, owner.entity_id
            ))
        })?;

        let claimed = report.reported_status.implied_status();
        let agreement = if claimed == authoritative.resulting_status {
            Agreement::Agree
        } else {
            Agreement::Conflict
        };
        let unchanged = SyncOutcome::Unchanged {
            entity_id: owner.entity_id.clone(),
            cycle_sequence: owner.cycle_sequence,
        };

        if agreement == Agreement::Agree && authoritative.channel == ApprovalChannel::External {
            debug!(
                event_name = "sync.inbound.replay",
                entity_id = %owner.entity_id,
                reference_id = %report.reference_id,
                "replayed platform report ignored"
            );
            return Ok(unchanged);
        }
        if report.reported_status == ReportedStatus::Terminated {
            debug!(
                event_name = "sync.inbound.termination_echo",
                entity_id = %owner.entity_id,
                reference_id = %report.reference_id,
                "termination of an already closed cycle ignored"
            );
            return Ok(unchanged);
        }

        let notice_sent = match report.reporter_id.as_deref() {
            Some(reporter_id) => {
                let clarification = Clarification {
                    entity_id: owner.entity_id.clone(),
                    cycle_sequence: owner.cycle_sequence,
                    reference_id: report.reference_id.clone(),
                    reported: report.reported_status,
                    authoritative_status: authoritative.resulting_status,
                    authoritative_channel: authoritative.channel,
                    decided_by: authoritative.operator_id.clone(),
                    agreement,
                };
                self.send_clarification(reporter_id, &clarification).await
            }
            None => false,
        };

        warn!(
            event_name = "sync.inbound.protected",
            entity_id = %owner.entity_id,
            cycle_sequence = owner.cycle_sequence,
            reference_id = %report.reference_id,
            reported = %report.reported_status,
            authoritative = %authoritative.resulting_status,
            agreement = ?agreement,
            notice_sent,
            "platform report hit a closed cycle"
        );

        Ok(SyncOutcome::Protected {
            entity_id: owner.entity_id,
            cycle_sequence: owner.cycle_sequence,
            authoritative_status: authoritative.resulting_status,
            authoritative_channel: authoritative.channel,
            agreement,
            notice_sent,
        })
    }

    async fn send_clarification(&self, reporter_id: &str, clarification: &Clarification) -> bool {
        let sent = match self.notices.clarification(clarification) {
            Ok(text) => self.notifier.send(reporter_id, &text).await.map_err(|e| e.to_string()),
            Err(render_error) => Err(render_error.to_string()),
        };

        let outcome = match &sent {
            Ok(()) => AuditOutcome::Success,
            Err(reason) => {
                error!(
                    event_name = "sync.clarification_failed",
                    entity_id = %clarification.entity_id,
                    recipient_id = reporter_id,
                    error = %reason,
                    "clarification notice not delivered"
                );
                AuditOutcome::Failed
            }
        };
        self.audit.emit(
            AuditEvent::new(
                Some(clarification.entity_id.clone()),
                clarification.reference_id.clone(),
                "sync.clarification_sent",
                AuditCategory::Sync,
                reporter_id,
                outcome,
            )
            .with_metadata("agreement", format!("{:?}", clarification.agreement))
            .with_metadata("authoritative_status", clarification.authoritative_status.as_str()),
        );
        sent.is_ok()
    }

    /// Outbound half: mirror an internal-app decision onto the platform.
    ///
    /// Platform-originated events are skipped, which is what keeps the two
    /// directions from feeding each other.
    pub async fn handle_event(&self, event: &ApprovalEvent) -> PropagationOutcome {
        if event.channel != ApprovalChannel::Internal
            || !event.action.is_decision()
            || event.approval_channel != Some(ProviderKind::External)
        {
            return PropagationOutcome::Skipped;
        }
        let Some(reference_id) = event.external_reference_id.as_deref() else {
            return PropagationOutcome::Skipped;
        };
        let Some(external) = self.engine.providers().external() else {
            warn!(
                event_name = "sync.outbound.no_external_provider",
                entity_id = %event.entity_id,
                reference_id,
                "externally owned cycle decided internally but no external provider is configured"
            );
            return PropagationOutcome::Skipped;
        };

        let instance_cancelled = match external.cancel(reference_id).await {
            Ok(()) => {
                info!(
                    event_name = "sync.outbound.instance_closed",
                    entity_id = %event.entity_id,
                    reference_id,
                    "platform instance closed after internal decision"
                );
                true
            }
            Err(cancel_error) => {
                error!(
                    event_name = "sync.outbound.cancel_failed",
                    entity_id = %event.entity_id,
                    reference_id,
                    error = %cancel_error,
                    "could not close platform instance; decision stands"
                );
                false
            }
        };

        let submitter_notified = match event.submitted_by.as_deref() {
            Some(submitter) => self.notify_submitter(submitter, event).await,
            None => false,
        };

        self.audit.emit(
            AuditEvent::new(
                Some(event.entity_id.clone()),
                reference_id,
                "sync.outbound_propagated",
                AuditCategory::Sync,
                event.operator_id.clone(),
                if instance_cancelled { AuditOutcome::Success } else { AuditOutcome::Failed },
            )
            .with_metadata("status", event.new_status.as_str())
            .with_metadata("submitter_notified", submitter_notified.to_string()),
        );

        PropagationOutcome::Propagated { instance_cancelled, submitter_notified }
    }

    async fn notify_submitter(&self, submitter: &str, event: &ApprovalEvent) -> bool {
        let text = match self.notices.decision(
            &event.entity_id,
            event.new_status,
            &event.operator_id,
            event.channel,
            event.reason.as_deref(),
        ) {
            Ok(text) => text,
            Err(render_error) => {
                error!(
                    event_name = "sync.decision_notice_failed",
                    entity_id = %event.entity_id,
                    error = %render_error,
                    "decision notice could not be rendered"
                );
                return false;
            }
        };
        match self.notifier.send(submitter, &text).await {
            Ok(()) => true,
            Err(send_error) => {
                warn!(
                    event_name = "sync.decision_notice_failed",
                    entity_id = %event.entity_id,
                    recipient_id = submitter,
                    error = %send_error,
                    "decision notice not delivered"
                );
                false
            }
        }
    }

    /// Consumes engine events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: broadcast::Receiver<ApprovalEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.handle_event(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        event_name = "sync.outbound.lagged",
                        skipped,
                        "sync service fell behind; reconciliation will catch up"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(event_name = "sync.outbound.stopped", "approval event stream closed");
                    break;
                }
            }
        }
    }

    /// Pulls the platform status of every pending externally owned cycle and
    /// applies whatever has been decided there.
    pub async fn reconcile_pending(&self) -> Result<ReconcileSummary, ApplicationError> {
        let mut summary = ReconcileSummary::default();
        let Some(external) = self.engine.providers().external().cloned() else {
            return Ok(summary);
        };
        let pending = self
            .engine
            .store()
            .list_by_status(ApprovalStatus::Pending, Some(ProviderKind::External))
            .await?;

        for entity in pending {
            let Some(reference_id) = entity.external_reference_id.clone() else {
                continue;
            };
            summary.examined += 1;

            let reported = match external.query_status(&reference_id).await {
                Ok(Some(status)) => status,
                Ok(None) => {
                    summary.unchanged += 1;
                    continue;
                }
                Err(query_error) => {
                    warn!(
                        event_name = "sync.reconcile.query_failed",
                        entity_id = %entity.id,
                        reference_id = %reference_id,
                        error = %query_error,
                        "platform status query failed"
                    );
                    summary.failed += 1;
                    continue;
                }
            };

            let report = ExternalReport {
                reference_id,
                reported_status: reported,
                reporter_id: None,
                comment: None,
            };
            match self.sync_from_external(report).await {
                Ok(SyncOutcome::Applied { .. }) => summary.applied += 1,
                Ok(_) => summary.unchanged += 1,
                Err(sync_error) => {
                    warn!(
                        event_name = "sync.reconcile.apply_failed",
                        entity_id = %entity.id,
                        error = %sync_error,
                        "reconciliation could not apply platform status"
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            event_name = "sync.reconcile.completed",
            examined = summary.examined,
            applied = summary.applied,
            failed = summary.failed,
            "reconciliation sweep finished"
        );
        Ok(summary)
    }
}

/// The record that closed `cycle`: its last entry.
fn closing_record(history: &[ApprovalRecord], cycle: u32) -> Option<&ApprovalRecord> {
    history.iter().rev().find(|record| record.cycle_sequence == cycle)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{ExternalReport, PropagationOutcome, ReconcileSummary, SyncOutcome, SyncService};
    use crate::approvals::engine::ApprovalEngine;
    use crate::approvals::notice::Agreement;
    use crate::approvals::provider::testing::{ProviderCall, ScriptedProvider};
    use crate::approvals::provider::{InternalProvider, ProviderSet};
    use crate::domain::approval::{
        ApprovalAction, ApprovalChannel, ApprovalOperation, ApprovalStatus, ReportedStatus,
    };
    use crate::domain::entity::{ApprovableEntity, EntityId, EntitySnapshot};
    use crate::errors::ApplicationError;
    use crate::notify::{InMemoryNotifier, NotifyError};
    use crate::store::InMemoryApprovalStore;

    struct Harness {
        sync: Arc<SyncService>,
        engine: Arc<ApprovalEngine>,
        external: Arc<ScriptedProvider>,
        notifier: InMemoryNotifier,
    }

    async fn harness(references: &[&str]) -> Harness {
        let external = Arc::new(ScriptedProvider::with_references(references));
        let engine = Arc::new(ApprovalEngine::new(
            Arc::new(InMemoryApprovalStore::new()),
            ProviderSet::new(Arc::new(InternalProvider), Some(external.clone())),
        ));
        engine
            .register(ApprovableEntity::new(EntityId::new("Q-1"), EntitySnapshot::new("Q-1")))
            .await
            .expect("register");
        let notifier = InMemoryNotifier::default();
        let sync = Arc::new(
            SyncService::new(engine.clone(), Arc::new(notifier.clone())).expect("sync service"),
        );
        Harness { sync, engine, external, notifier }
    }

    /// Executes an internal-app operation and lets the sync service see its event.
    async fn run(h: &Harness, action: ApprovalAction, operator: &str) -> PropagationOutcome {
        let mut events = h.engine.subscribe();
        h.engine
            .execute(ApprovalOperation::new(
                EntityId::new("Q-1"),
                action,
                operator,
                ApprovalChannel::Internal,
            ))
            .await
            .expect("operation");
        let event = events.recv().await.expect("event");
        h.sync.handle_event(&event).await
    }

    fn report(reference: &str, status: ReportedStatus, reporter: &str) -> ExternalReport {
        ExternalReport {
            reference_id: reference.to_string(),
            reported_status: status,
            reporter_id: Some(reporter.to_string()),
            comment: None,
        }
    }

    #[tokio::test]
    async fn late_external_rejection_after_internal_approval_is_protected() {
        let h = harness(&["R1"]).await;
        run(&h, ApprovalAction::Submit, "alice").await;
        run(&h, ApprovalAction::Approve, "bob").await;

        let outcome = h
            .sync
            .sync_from_external(report("R1", ReportedStatus::Rejected, "ext-carol"))
            .await
            .expect("sync");

        assert_eq!(
            outcome,
            SyncOutcome::Protected {
                entity_id: EntityId::new("Q-1"),
                cycle_sequence: 1,
                authoritative_status: ApprovalStatus::Approved,
                authoritative_channel: ApprovalChannel::Internal,
                agreement: Agreement::Conflict,
                notice_sent: true,
            }
        );
        assert_eq!(
            h.engine.current_status(&EntityId::new("Q-1")).await.expect("status"),
            ApprovalStatus::Approved
        );
        let to_reporter: Vec<_> = h
            .notifier
            .sent()
            .into_iter()
            .filter(|notice| notice.recipient_id == "ext-carol")
            .collect();
        assert_eq!(to_reporter.len(), 1);
        assert!(to_reporter[0].text.contains("NOT applied"));
        assert!(h.external.calls().contains(&ProviderCall::Cancel { reference_id: "R1".into() }));
    }

    #[tokio::test]
    async fn pending_cycle_applies_external_decision_without_echoing_it() {
        let h = harness(&["R1"]).await;
        run(&h, ApprovalAction::Submit, "alice").await;
        let mut events = h.engine.subscribe();

        let outcome = h
            .sync
            .sync_from_external(report("R1", ReportedStatus::Approved, "ext-carol"))
            .await
            .expect("sync");

        assert!(matches!(
            outcome,
            SyncOutcome::Applied { new_status: ApprovalStatus::Approved, cycle_sequence: 1, .. }
        ));
        let event = events.recv().await.expect("event");
        assert_eq!(event.channel, ApprovalChannel::External);
        assert_eq!(h.sync.handle_event(&event).await, PropagationOutcome::Skipped);
        assert_eq!(h.external.calls(), vec![ProviderCall::Submit { entity_id: "Q-1".into() }]);

        let history = h.engine.history(&EntityId::new("Q-1")).await.expect("history");
        assert_eq!(history[1].comment, "Approved (via external platform)");
        assert_eq!(history[1].operator_id, "ext-carol");
    }

    #[tokio::test]
    async fn replayed_external_decision_is_a_silent_no_op() {
        let h = harness(&["R1"]).await;
        run(&h, ApprovalAction::Submit, "alice").await;
        let first = report("R1", ReportedStatus::Rejected, "ext-carol");
        h.sync.sync_from_external(first.clone()).await.expect("first delivery");

        let replay = h.sync.sync_from_external(first).await.expect("replay");

        assert_eq!(
            replay,
            SyncOutcome::Unchanged { entity_id: EntityId::new("Q-1"), cycle_sequence: 1 }
        );
        assert!(h.notifier.sent().is_empty());
        assert_eq!(h.engine.history(&EntityId::new("Q-1")).await.expect("history").len(), 2);
    }

    #[tokio::test]
    async fn agreeing_report_after_internal_decision_gets_informational_notice() {
        let h = harness(&["R1"]).await;
        run(&h, ApprovalAction::Submit, "alice").await;
        run(&h, ApprovalAction::Approve, "bob").await;

        let outcome = h
            .sync
            .sync_from_external(report("R1", ReportedStatus::Approved, "ext-carol"))
            .await
            .expect("sync");

        assert!(matches!(
            outcome,
            SyncOutcome::Protected { agreement: Agreement::Agree, notice_sent: true, .. }
        ));
        let to_reporter: Vec<_> = h
            .notifier
            .sent()
            .into_iter()
            .filter(|notice| notice.recipient_id == "ext-carol")
            .collect();
        assert!(to_reporter[0].text.contains("matches the recorded outcome"));
    }

    #[tokio::test]
    async fn report_for_a_past_cycle_cannot_touch_the_current_one() {
        let h = harness(&["R1", "R2"]).await;
        run(&h, ApprovalAction::Submit, "alice").await;
        run(&h, ApprovalAction::Reject, "bob").await;
        run(&h, ApprovalAction::Resubmit, "alice").await;

        let outcome = h
            .sync
            .sync_from_external(report("R1", ReportedStatus::Approved, "ext-carol"))
            .await
            .expect("sync");

        assert!(matches!(
            outcome,
            SyncOutcome::Protected {
                cycle_sequence: 1,
                authoritative_status: ApprovalStatus::Rejected,
                agreement: Agreement::Conflict,
                ..
            }
        ));
        let entity = h.engine.entity(&EntityId::new("Q-1")).await.expect("entity");
        assert_eq!(entity.approval_status, ApprovalStatus::Pending);
        assert_eq!(entity.cycle_sequence, 2);
    }

    #[tokio::test]
    async fn late_decision_on_a_withdrawn_cycle_is_protected() {
        let h = harness(&["R1"]).await;
        run(&h, ApprovalAction::Submit, "alice").await;
        run(&h, ApprovalAction::Withdraw, "alice").await;
        assert!(h.external.calls().contains(&ProviderCall::Cancel { reference_id: "R1".into() }));

        let echo = h
            .sync
            .sync_from_external(report("R1", ReportedStatus::Terminated, "alice"))
            .await
            .expect("termination echo");
        assert!(matches!(echo, SyncOutcome::Unchanged { cycle_sequence: 1, .. }));

        let outcome = h
            .sync
            .sync_from_external(report("R1", ReportedStatus::Approved, "ext-carol"))
            .await
            .expect("sync");

        assert_eq!(
            outcome,
            SyncOutcome::Protected {
                entity_id: EntityId::new("Q-1"),
                cycle_sequence: 1,
                authoritative_status: ApprovalStatus::NotSubmitted,
                authoritative_channel: ApprovalChannel::Internal,
                agreement: Agreement::Conflict,
                notice_sent: true,
            }
        );
        let entity = h.engine.entity(&EntityId::new("Q-1")).await.expect("entity");
        assert_eq!(entity.approval_status, ApprovalStatus::NotSubmitted);
        assert!(entity.external_reference_id.is_none());
        assert_eq!(h.engine.history(&EntityId::new("Q-1")).await.expect("history").len(), 2);
        let sent = h.notifier.sent();
        let to_reporter = sent.iter().filter(|notice| notice.recipient_id == "ext-carol").count();
        assert_eq!(to_reporter, 1);
    }

    #[tokio::test]
    async fn termination_echo_of_our_own_cancel_is_ignored() {
        let h = harness(&["R1"]).await;
        run(&h, ApprovalAction::Submit, "alice").await;
        run(&h, ApprovalAction::Approve, "bob").await;

        let outcome = h
            .sync
            .sync_from_external(report("R1", ReportedStatus::Terminated, "alice"))
            .await
            .expect("sync");

        assert!(matches!(outcome, SyncOutcome::Unchanged { .. }));
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_id, "alice");
    }

    #[tokio::test]
    async fn running_and_unknown_reports() {
        let h = harness(&["R1"]).await;
        run(&h, ApprovalAction::Submit, "alice").await;

        let running = h
            .sync
            .sync_from_external(report("R1", ReportedStatus::Running, "ext-carol"))
            .await
            .expect("running");
        let unknown = h
            .sync
            .sync_from_external(report("R404", ReportedStatus::Approved, "ext-carol"))
            .await
            .expect_err("unknown reference");

        assert!(matches!(running, SyncOutcome::Unchanged { .. }));
        assert_eq!(unknown, ApplicationError::UnknownReference("R404".into()));
    }

    #[tokio::test]
    async fn undeliverable_notice_still_reports_protection() {
        let h = harness(&["R1"]).await;
        run(&h, ApprovalAction::Submit, "alice").await;
        run(&h, ApprovalAction::Approve, "bob").await;
        h.notifier.fail_with(Some(NotifyError::Unavailable("platform down".into())));

        let outcome = h
            .sync
            .sync_from_external(report("R1", ReportedStatus::Rejected, "ext-carol"))
            .await
            .expect("sync");

        assert!(matches!(outcome, SyncOutcome::Protected { notice_sent: false, .. }));
    }

    #[tokio::test]
    async fn internal_decision_closes_instance_and_tells_submitter() {
        let h = harness(&["R1"]).await;
        assert_eq!(run(&h, ApprovalAction::Submit, "alice").await, PropagationOutcome::Skipped);
        let mut events = h.engine.subscribe();
        h.engine
            .execute(
                ApprovalOperation::new(
                    EntityId::new("Q-1"),
                    ApprovalAction::Reject,
                    "bob",
                    ApprovalChannel::Internal,
                )
                .with_reason("price too high"),
            )
            .await
            .expect("reject");
        let event = events.recv().await.expect("event");

        let propagated = h.sync.handle_event(&event).await;

        assert_eq!(
            propagated,
            PropagationOutcome::Propagated { instance_cancelled: true, submitter_notified: true }
        );
        assert_eq!(
            h.external.calls(),
            vec![
                ProviderCall::Submit { entity_id: "Q-1".into() },
                ProviderCall::Decide { reference_id: "R1".into(), action: ApprovalAction::Reject },
                ProviderCall::Cancel { reference_id: "R1".into() },
            ]
        );
        let sent = h.notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient_id, "alice");
        assert!(sent[0].text.contains("Reason: price too high"));
    }

    #[tokio::test]
    async fn reconciliation_applies_decisions_taken_on_the_platform() {
        let h = harness(&["R1"]).await;
        run(&h, ApprovalAction::Submit, "alice").await;
        if let Ok(mut reported) = h.external.reported.lock() {
            *reported = Some(ReportedStatus::Approved);
        }

        let summary = h.sync.reconcile_pending().await.expect("sweep");
        let second = h.sync.reconcile_pending().await.expect("second sweep");

        assert_eq!(summary, ReconcileSummary { examined: 1, applied: 1, unchanged: 0, failed: 0 });
        assert_eq!(second, ReconcileSummary::default());
        let history = h.engine.history(&EntityId::new("Q-1")).await.expect("history");
        assert_eq!(history[1].operator_id, "eemp-reconciler");
        assert!(h.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn event_loop_propagates_internal_decisions() {
        let h = harness(&["R1"]).await;
        let worker = tokio::spawn(h.sync.clone().run(h.engine.subscribe()));
        h.engine
            .execute(ApprovalOperation::new(
                EntityId::new("Q-1"),
                ApprovalAction::Submit,
                "alice",
                ApprovalChannel::Internal,
            ))
            .await
            .expect("submit");
        h.engine
            .execute(ApprovalOperation::new(
                EntityId::new("Q-1"),
                ApprovalAction::Approve,
                "bob",
                ApprovalChannel::Internal,
            ))
            .await
            .expect("approve");

        let cancelled = tokio::time::timeout(Duration::from_secs(2), async {
            let expected = ProviderCall::Cancel { reference_id: "R1".into() };
            loop {
                if h.external.calls().contains(&expected) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;

        worker.abort();
        assert!(cancelled.is_ok(), "outbound cancel never observed");
    }
}
