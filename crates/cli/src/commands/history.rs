use std::sync::Arc;

use accord_core::approvals::ApprovalLedger;
use accord_core::domain::entity::EntityId;
use accord_core::errors::ApplicationError;
use accord_core::store::ApprovalStore;
use accord_db::SqlApprovalStore;
use serde_json::json;

use crate::commands::{
    load_config, with_pool, CommandResult, EXIT_INVALID_INPUT, EXIT_NOT_FOUND, EXIT_STORE,
};

pub fn run(entity_id: &str) -> CommandResult {
    let entity_id = entity_id.trim();
    if entity_id.is_empty() {
        return CommandResult::failure(
            "history",
            "invalid_input",
            "entity id must not be empty",
            EXIT_INVALID_INPUT,
        );
    }
    let config = match load_config("history") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    let entity_id = EntityId::new(entity_id);
    with_pool("history", &config, |pool| async move {
        let store: Arc<dyn ApprovalStore> = Arc::new(SqlApprovalStore::new(pool));
        let entity = match store.load_entity(&entity_id).await {
            Ok(Some(entity)) => entity,
            Ok(None) => return not_found("history", &entity_id),
            Err(error) => {
                return CommandResult::failure("history", "store", error.to_string(), EXIT_STORE)
            }
        };

        match ApprovalLedger::new(store).history(&entity_id).await {
            Ok(records) => CommandResult::success_with_data(
                "history",
                format!(
                    "{} record(s) for {entity_id}; current status {} (cycle {})",
                    records.len(),
                    entity.approval_status,
                    entity.cycle_sequence
                ),
                Some(json!({ "entity": entity, "records": records })),
            ),
            Err(error) => application_failure("history", error),
        }
    })
}

pub(crate) fn not_found(command: &str, entity_id: &EntityId) -> CommandResult {
    CommandResult::failure(
        command,
        "not_found",
        format!("approvable entity {entity_id} does not exist"),
        EXIT_NOT_FOUND,
    )
}

pub(crate) fn application_failure(command: &str, error: ApplicationError) -> CommandResult {
    let exit_code = match &error {
        ApplicationError::EntityNotFound(_) => EXIT_NOT_FOUND,
        _ => EXIT_STORE,
    };
    CommandResult::failure(command, error.error_class(), error.to_string(), exit_code)
}
