//! Clap derive structures for the `edgectl` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// edgectl -- edge automation controller
#[derive(Debug, Parser)]
#[command(
    name = "edgectl",
    version,
    about = "Run local control loops for field sensors and actuators",
    long_about = "Evaluates threshold, PID and scheduled rules against field sensors,\n\
        drives actuators, and syncs telemetry to an MQTT broker with\n\
        store-and-forward buffering while the network is down.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Configuration file (TOML or JSON)
    #[arg(long, short = 'c', env = "EDGECTL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Log line format
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Plain text summary
    Text,
    /// Pretty-printed JSON
    Json,
}

// ── Commands ─────────────────────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the controller until interrupted
    Run(RunArgs),

    /// Load the configuration and report accepted and skipped entries
    Validate(ValidateArgs),

    /// Inspect or maintain the outbound message queue
    Queue(QueueArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Never contact the broker; every outbound message stays queued
    #[arg(long)]
    pub offline: bool,
}

#[derive(Debug, Args)]
pub struct ValidateArgs {
    /// Output format
    #[arg(long, short = 'o', default_value = "text")]
    pub output: OutputFormat,

    /// Print the effective settings after layering file and environment
    #[arg(long)]
    pub dump: bool,
}

#[derive(Debug, Args)]
pub struct QueueArgs {
    #[command(subcommand)]
    pub command: QueueCommand,
}

#[derive(Debug, Subcommand)]
pub enum QueueCommand {
    /// Show pending, sent and reading counts
    Stats {
        #[arg(long, short = 'o', default_value = "text")]
        output: OutputFormat,
    },

    /// Delete sent entries older than the retention window
    Prune {
        /// Retention in hours (defaults to the configured value)
        #[arg(long)]
        older_than_hours: Option<u64>,
    },
}
