//! CLI command definitions using clap.
//!
//! Operator commands over the state directory:
//! - init/status/reset/check/record: breaker and state management
//! - run: drive the agent loop
//! - monitor: read-only live view

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Ralph - an autonomous agent loop with a circuit breaker
#[derive(Parser, Debug)]
#[command(name = "ralph")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// State directory (overrides state_dir from config)
    #[arg(short = 'd', long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the state document
    Init {
        /// Iteration cap (defaults to loop.max_iterations)
        #[arg(short, long)]
        max_iterations: Option<u64>,

        /// Replace an existing document
        #[arg(short, long)]
        force: bool,
    },

    /// Show circuit breaker state
    Status {
        /// Print the breaker section as JSON
        #[arg(long)]
        json: bool,
    },

    /// Move an open breaker to half-open and clear counters
    Reset,

    /// Exit 0 if the loop may run, 1 if the breaker is open
    Check,

    /// Feed one iteration's observations to the breaker
    Record {
        /// Loop number of the iteration
        iteration: u64,

        /// Number of files changed
        files_changed: u64,

        /// Whether the iteration produced errors (true/false)
        #[arg(value_parser = parse_flag, action = clap::ArgAction::Set)]
        has_errors: bool,

        /// Output length in bytes
        output_length: u64,
    },

    /// Run the agent loop until a stop condition
    Run,

    /// Watch the state document
    Monitor {
        /// Print one snapshot and exit
        #[arg(long)]
        once: bool,

        /// Poll interval (defaults to monitor.poll_interval_ms)
        #[arg(short, long)]
        interval_ms: Option<u64>,
    },
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(format!("expected true or false, got '{}'", other)),
    }
}
