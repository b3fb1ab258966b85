use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "constellation",
    about = "Distributed orchestration runtime",
    version
)]
pub struct Cli {
    /// Path to the controller configuration file
    #[arg(short, long, default_value = "constellation.toml", env = "CONSTELLATION_CONFIG")]
    pub config: String,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the controller node until interrupted
    Serve {
        /// Override the node name from the config
        #[arg(long)]
        node_name: Option<String>,
        /// Seed nodes to join ("host:port", repeatable)
        #[arg(long)]
        seed: Vec<String>,
    },

    /// Print a status snapshot of a freshly wired controller
    Status {
        /// Emit JSON instead of the table view
        #[arg(long)]
        json: bool,
    },

    /// Write a default configuration file
    Init {
        /// Destination path
        #[arg(default_value = "constellation.toml")]
        path: String,
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}
