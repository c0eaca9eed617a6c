use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "reelforge")]
#[command(author, version, about = "Media production pipeline orchestrator")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run one job through the pipeline and print the final job document
    Run {
        /// Job identifier
        job_id: String,

        /// Topic for the script stage
        #[arg(long)]
        topic: Option<String>,

        /// Full payload as a JSON object (merged under --topic)
        #[arg(long)]
        payload: Option<String>,
    },

    /// Show the capabilities each stage would receive for a job
    Plan {
        /// Job identifier
        job_id: String,
    },

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}
