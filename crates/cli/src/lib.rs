pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "adloop",
    about = "Adloop operator CLI",
    long_about = "Operate adloop migrations, config inspection, and historical winner backfill.",
    after_help = "Examples:\n  adloop migrate\n  adloop config\n  adloop backfill --since-hours 48"
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
    #[command(about = "Re-run winner detection over stored snapshots under the active criteria")]
    Backfill {
        #[arg(long, default_value_t = 24, help = "How far back to re-evaluate, in hours")]
        since_hours: u64,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Backfill { since_hours } => commands::backfill::run(since_hours),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
