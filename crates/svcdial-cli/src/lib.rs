//! svcdial CLI library

pub mod commands;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};

/// svcdial - dial Kubernetes services by name from outside the cluster
#[derive(Parser, Debug)]
#[command(name = "svcdial")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Keep tunnels to every watched service open until interrupted
    Run(commands::run::RunArgs),
    /// Fetch a URL on a cluster service through its tunnel
    Get(commands::get::GetArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Run(args) => commands::run::run(args).await,
            Commands::Get(args) => commands::get::run(args).await,
        }
    }
}
