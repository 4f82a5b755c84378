// CLI - Command line interface of the staking simulator
// Principle: Simple, clear, composable commands

pub mod config;
pub mod runner;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Staking simulator - drives the epoch staking engine on an in-memory chain
#[derive(Parser, Debug)]
#[command(name = "staking-sim")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Epoch-based validator staking and delegation simulator")]
#[command(long_about = r#"
Runs the validator registry, the delegation ledgers and the epoch controller
against an in-memory chain.

Run the built-in walkthrough:
  staking-sim demo

Replay a scripted scenario:
  staking-sim run --scenario scenario.json --config sim.json

Print the effective configuration:
  staking-sim config
"#)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", env = "STAKING_LOG")]
    pub log_level: String,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the built-in walkthrough scenario
    Demo(DemoCmd),

    /// Replay a scenario file
    Run(RunCmd),

    /// Print the effective configuration as JSON
    Config(ConfigCmd),
}

/// Engine parameters shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Configuration file (JSON)
    #[arg(short, long, env = "STAKING_CONFIG")]
    pub config: Option<PathBuf>,

    /// Blocks per epoch after the first
    #[arg(long)]
    pub epoch_length: Option<u64>,

    /// Blocks in the first epoch
    #[arg(long)]
    pub first_epoch_length: Option<u64>,

    /// Epochs between an unstake request and its withdrawal
    #[arg(long)]
    pub cooldown_epochs: Option<u64>,

    /// Epochs before new stake starts earning
    #[arg(long)]
    pub activation_delay_epochs: Option<u64>,

    /// Validator commission in basis points
    #[arg(long)]
    pub commission_bps: Option<u32>,
}

/// Run the walkthrough
#[derive(Parser, Debug)]
pub struct DemoCmd {
    #[command(flatten)]
    pub params: ConfigArgs,

    /// Print a snapshot after every step
    #[arg(long)]
    pub trace_state: bool,
}

/// Replay a scenario
#[derive(Parser, Debug)]
pub struct RunCmd {
    /// Scenario file (JSON)
    #[arg(short, long)]
    pub scenario: PathBuf,

    #[command(flatten)]
    pub params: ConfigArgs,

    /// Print a snapshot after every step
    #[arg(long)]
    pub trace_state: bool,
}

/// Show configuration
#[derive(Parser, Debug)]
pub struct ConfigCmd {
    #[command(flatten)]
    pub params: ConfigArgs,
}
