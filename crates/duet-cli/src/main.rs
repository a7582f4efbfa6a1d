//! Duet CLI - Fast/slow channel transaction pipeline
//!
//! Usage:
//!   duet init                               Initialize database
//!   duet submit "Rs.500 debited ..." -c sms Ingest one notification
//!   duet worker --once                      Drain due enrichment jobs
//!   duet serve --port 3000                  Start web server and worker

mod cli;
mod commands;


use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cli::*;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    // Priority: RUST_LOG env var > --verbose flag > default (info)
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact())
        .init();

    match cli.command {
        Commands::Init => commands::cmd_init(&cli.db),
        Commands::Submit {
            text,
            channel,
            sender,
            user,
            json,
        } => {
            let db = commands::open_db(&cli.db)?;
            commands::cmd_submit(&db, &text, &channel, sender.as_deref(), &user, json)
        }
        Commands::Worker { once } => {
            let db = commands::open_db(&cli.db)?;
            if once {
                commands::cmd_worker_once(&db).await
            } else {
                commands::cmd_worker(&db).await
            }
        }
        Commands::Serve {
            port,
            host,
            no_worker,
        } => commands::cmd_serve(&cli.db, &host, port, no_worker).await,
        Commands::Status => commands::cmd_status(&cli.db),
        Commands::Jobs { failed, limit } => {
            let db = commands::open_db(&cli.db)?;
            commands::cmd_jobs_list(&db, failed, limit)
        }
        Commands::Transactions { user, limit } => {
            let db = commands::open_db(&cli.db)?;
            commands::cmd_transactions_list(&db, user.as_deref(), limit)
        }
    }
}
