use std::sync::Arc;

use accord_core::approvals::{ApprovalLedger, RepairOutcome};
use accord_core::domain::entity::EntityId;
use accord_db::SqlApprovalStore;

use crate::commands::history::application_failure;
use crate::commands::{load_config, with_pool, CommandResult, EXIT_INVALID_INPUT};

/// Re-derives the stored status of one entity from its ledger.
pub fn run(entity_id: &str) -> CommandResult {
    let entity_id = entity_id.trim();
    if entity_id.is_empty() {
        return CommandResult::failure(
            "repair",
            "invalid_input",
            "entity id must not be empty",
            EXIT_INVALID_INPUT,
        );
    }
    let config = match load_config("repair") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let entity_id = EntityId::new(entity_id);
    with_pool("repair", &config, |pool| async move {
        let ledger = ApprovalLedger::new(Arc::new(SqlApprovalStore::new(pool)));
        match ledger.repair(&entity_id).await {
            Ok(outcome) => {
                let message = match &outcome {
                    RepairOutcome::Consistent { status } => {
                        format!("{entity_id} is consistent with its ledger ({status})")
                    }
                    RepairOutcome::Repaired { drift } => format!(
                        "{entity_id} repaired: {} -> {}",
                        drift.stored_status, drift.derived_status
                    ),
                };
                CommandResult::success_with_data(
                    "repair",
                    message,
                    serde_json::to_value(&outcome).ok(),
                )
            }
            Err(error) => application_failure("repair", error),
        }
    })
}
