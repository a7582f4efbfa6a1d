//! CLI argument definitions using clap
//!
//! The command implementations live in the `commands` module.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Duet - Pair fast and slow transaction notifications
#[derive(Parser)]
#[command(name = "duet")]
#[command(about = "Ingest, dedupe and match transaction notifications", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Database path
    #[arg(long, default_value = "duet.db", global = true)]
    pub db: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize the database
    Init,

    /// Ingest a single notification
    Submit {
        /// Raw notification text
        text: String,

        /// Channel: fast (sms) or slow (email)
        #[arg(short, long, default_value = "fast")]
        channel: String,

        /// Sender address or short code
        #[arg(short, long)]
        sender: Option<String>,

        /// User the notification belongs to
        #[arg(short, long)]
        user: String,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run the enrichment worker until Ctrl-C
    Worker {
        /// Process the jobs due now and exit
        #[arg(long)]
        once: bool,
    },

    /// Start the web server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Do not run the enrichment worker in this process
        #[arg(long)]
        no_worker: bool,
    },

    /// Show database and queue status
    Status,

    /// List enrichment jobs
    Jobs {
        /// Only show jobs that failed for good
        #[arg(long)]
        failed: bool,

        /// Number of jobs to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },

    /// List recent transactions
    Transactions {
        /// Only show this user's transactions
        #[arg(short, long)]
        user: Option<String>,

        /// Number of transactions to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}
