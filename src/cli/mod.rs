//! Command-line interface definitions for the `statepull` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `statepull` binary.
#[derive(Debug, Parser)]
#[command(
    name = "statepull",
    about = "Generate backend files from remote state objects and pull their state",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Generate backend files, then run init and state pull for every class.
    #[command(
        name = "run",
        about = "Generate backend files, then run init and state pull for every class"
    )]
    Run(RunCommand),
    /// Generate backend files only.
    #[command(name = "generate", about = "Generate backend files only")]
    Generate(GenerateCommand),
}

/// Arguments for the `statepull run` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct RunCommand {
    /// Restrict the run to these configured environments (repeatable).
    #[arg(long = "environment", short = 'e', value_name = "NAME")]
    pub(crate) environments: Vec<String>,
    /// Override the maximum number of concurrent tool processes.
    #[arg(long, value_name = "N")]
    pub(crate) concurrency: Option<usize>,
    /// Override the per-job timeout in seconds; 0 disables it.
    #[arg(long, value_name = "SECS")]
    pub(crate) timeout: Option<u64>,
}

/// Arguments for the `statepull generate` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct GenerateCommand {
    /// Restrict generation to these configured environments (repeatable).
    #[arg(long = "environment", short = 'e', value_name = "NAME")]
    pub(crate) environments: Vec<String>,
}
