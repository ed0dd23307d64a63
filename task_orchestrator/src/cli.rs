//! Command-line interface definitions using clap derive API.

use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Multi-agent task orchestrator CLI
#[derive(Parser)]
#[command(name = "orchestrator-cli")]
#[command(about = "Plans goals into task graphs and runs them on registered agents")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind to (defaults to server.host:server.port)
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Plan and execute a single goal, printing the outcome as JSON
    Run {
        /// Goal to accomplish
        #[arg(short, long)]
        goal: String,

        /// Checkpoint orchestrator state to this file
        #[arg(long)]
        state_file: Option<PathBuf>,
    },
    /// Continue the unfinished plan stored in a state file
    Resume {
        #[arg(long)]
        state_file: PathBuf,
    },
    /// Print the registered agents as JSON
    Agents,
}
