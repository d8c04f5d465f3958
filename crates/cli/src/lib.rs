pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "tenantry",
    about = "Tenantry operator CLI",
    long_about = "Apply platform and tenant migrations, inspect effective configuration, and check readiness.",
    after_help = "Examples:\n  tenantry migrate\n  tenantry config\n  tenantry doctor --json"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Explicit config file; must exist when given")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply platform migrations, then tenant migrations for every tenant store")]
    Migrate,
    #[command(about = "Inspect effective configuration values with source attribution")]
    Config,
    #[command(about = "Validate config, platform DB connectivity and the tenant data directory")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = commands::load_options(cli.config);

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(&options),
        Command::Config => commands::config::run(&options),
        Command::Doctor { json } => commands::doctor::run(&options, json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
