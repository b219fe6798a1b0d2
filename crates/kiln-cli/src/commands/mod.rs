//! CLI command implementations.
//!
//! - `test`: boot instances from a built image and run the scenario suite
//! - `results`: inspect and compare persisted runs

use clap::{Parser, Subcommand, ValueEnum};

pub mod results;

/// kiln - embedded Linux image validation harness
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, global = true, default_value = "table")]
    pub format: OutputFormat,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,
}

/// Output format for command results.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
    /// Quiet mode (pass/fail summary only)
    Quiet,
}

/// Available commands
#[derive(Subcommand)]
pub enum Commands {
    /// Boot VM instances from a built image and run the test suite
    Test(test::TestArgs),

    /// Inspect persisted test results
    #[command(subcommand)]
    Results(results::ResultsCommands),
}
