//! kiln CLI - boots freshly built embedded Linux images in ephemeral VMs
//! and validates them.

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "kiln=debug,kiln_harness=debug,kiln_cli=debug"
    } else {
        "kiln=info,kiln_harness=info,kiln_cli=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Test(args) => commands::test::execute(args, cli.format).await,
        Commands::Results(cmd) => commands::results::execute(cmd, cli.format),
    }
}
