pub mod approvals;
pub mod audit;
pub mod config;
pub mod domain;
pub mod errors;
pub mod notify;
pub mod store;

pub use approvals::{
    ApprovalEngine, ApprovalLedger, ApprovalProvider, ApprovalResult, ExecutionOutcome,
    ExternalReport, InternalProvider, LedgerStatistics, ProviderError, ProviderSet,
    PropagationOutcome, RepairOutcome, SyncOutcome, SyncService,
};
pub use audit::{AuditEvent, AuditSink};
pub use config::AppConfig;
pub use domain::approval::{
    ApprovalAction, ApprovalChannel, ApprovalEvent, ApprovalOperation, ApprovalRecord,
    ApprovalStatus, ProviderKind, ReportedStatus,
};
pub use domain::entity::{ApprovableEntity, BusinessStatus, EntityId, EntitySnapshot, FieldValue};
pub use errors::{ApplicationError, ApprovalError, DomainError, InterfaceError};
pub use notify::{Notifier, NotifyError};
pub use store::{ApprovalStore, InMemoryApprovalStore, StoreError};
