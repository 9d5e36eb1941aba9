mod bootstrap_helpers;
mod cli_args;
mod commands;

use anyhow::Result;
use clap::Parser;

use crate::bootstrap_helpers::{init_tracing, load_engine_config};
use crate::cli_args::Cli;
use crate::commands::execute_command;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_engine_config(&cli)?;
    execute_command(cli.command, config).await
}
