pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "accord",
    about = "Accord approval-sync operator CLI",
    long_about = "Operate the approval sync service: migrations, config inspection, readiness, \
                  ledger history, status repair, and callback signing.",
    after_help = "Examples:\n  accord doctor --json\n  accord history Q-1001"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, DB connectivity, schema state, and platform readiness")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Print the approval ledger of one entity, oldest record first")]
    History {
        #[arg(help = "Identifier of the approvable entity")]
        entity_id: String,
    },
    #[command(about = "Re-derive the stored approval status of one entity from its ledger")]
    Repair {
        #[arg(help = "Identifier of the approvable entity")]
        entity_id: String,
    },
    #[command(about = "Compute the callback signature for a hand-built webhook delivery")]
    Sign {
        #[arg(long, help = "Callback token; defaults to eemp.callback_token")]
        token: Option<String>,
        #[arg(long)]
        timestamp: String,
        #[arg(long)]
        nonce: String,
        #[arg(long, help = "Encrypted payload exactly as it will be delivered")]
        payload: String,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::History { entity_id } => commands::history::run(&entity_id),
        Command::Repair { entity_id } => commands::repair::run(&entity_id),
        Command::Sign { token, timestamp, nonce, payload } => {
            commands::sign::run(token.as_deref(), &timestamp, &nonce, &payload)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::Cli;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }
}
