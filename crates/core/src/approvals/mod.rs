pub mod engine;
pub mod ledger;
pub mod machine;
pub mod notice;
pub mod provider;
pub mod sync;

pub use engine::{ApprovalEngine, ApprovalResult, ExecutionOutcome};
pub use ledger::{ApprovalLedger, LedgerStatistics, RepairOutcome, StatusDrift};
pub use machine::{transition, Transition, TransitionError};
pub use notice::{Agreement, NoticeRenderer};
pub use provider::{ApprovalProvider, InternalProvider, ProviderError, ProviderSet};
pub use sync::{ExternalReport, PropagationOutcome, ReconcileSummary, SyncOutcome, SyncService};
