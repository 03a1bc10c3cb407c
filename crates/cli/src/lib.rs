pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "reimburse",
    about = "Reimbursement operator CLI",
    long_about = "Apply migrations, inspect configuration, run retention cleanup and render entry documents.",
    after_help = "Examples:\n  reimburse migrate\n  reimburse sweep\n  reimburse pdf 42 --out-dir out\n  reimburse export 41 42 43"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Delete archived entries older than the configured age limit")]
    Sweep,
    #[command(about = "Delete uploads that were never linked to an item")]
    PurgeOrphans,
    #[command(about = "Render the reimbursement form of one entry")]
    Pdf {
        #[arg(help = "Entry id")]
        entry_id: i64,
        #[arg(long, default_value = ".", help = "Directory the PDF is written to")]
        out_dir: PathBuf,
    },
    #[command(about = "Render the accounting import file for one or more entries")]
    Export {
        #[arg(required = true, num_args = 1.., help = "Entry ids")]
        entry_ids: Vec<i64>,
        #[arg(long, default_value = ".", help = "Directory the CSV or ZIP is written to")]
        out_dir: PathBuf,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Sweep => commands::retention::sweep(),
        Command::PurgeOrphans => commands::retention::purge_orphans(),
        Command::Pdf { entry_id, out_dir } => commands::pdf::run(entry_id, &out_dir),
        Command::Export { entry_ids, out_dir } => commands::export::run(&entry_ids, &out_dir),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
