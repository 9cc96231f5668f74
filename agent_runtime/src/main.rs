//! Main entry point for the agent runtime CLI.

use agent_runtime::{cli, settings::Settings, telemetry};
use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    // Parse command line arguments
    let args = cli::Cli::parse();

    // Load settings
    let settings = Settings::load_from(args.config.as_deref())?;

    // Initialize telemetry
    telemetry::init(&settings.logging)?;

    // Execute the requested command
    cli::run(args.command, &settings)
}
