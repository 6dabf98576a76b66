use accord_db::migrations;

use crate::commands::{load_config, with_pool, CommandResult, EXIT_MIGRATION};

pub fn run() -> CommandResult {
    let config = match load_config("migrate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };

    with_pool("migrate", &config, |pool| async move {
        match migrations::run_pending(&pool).await {
            Ok(()) => CommandResult::success("migrate", "applied pending migrations"),
            Err(error) => {
                CommandResult::failure("migrate", "migration", error.to_string(), EXIT_MIGRATION)
            }
        }
    })
}
