//! Core command implementations and shared utilities
//!
//! - `open_db` - Shared utility to open the database
//! - `cmd_init` - Initialize the database
//! - `cmd_status` - Record and queue overview

use std::path::Path;

use anyhow::{Context, Result};
use duet_core::db::Database;

/// Open the database, creating and migrating it if needed
pub fn open_db(db_path: &Path) -> Result<Database> {
    Database::new(&db_path.to_string_lossy()).context("Failed to open database")
}

pub fn cmd_init(db_path: &Path) -> Result<()> {
    println!("🔧 Initializing database at {}...", db_path.display());

    open_db(db_path)?;

    println!("✅ Database initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  1. Submit a notification: duet submit \"Rs.500 debited at SWIGGY\" --user me");
    println!("  2. Start the API and worker: duet serve");

    Ok(())
}

pub fn cmd_status(db_path: &Path) -> Result<()> {
    println!();
    println!("📊 Duet Status");
    println!("   ─────────────────────────────────────────────────────────────");
    println!("   Database: {}", db_path.display());

    if !db_path.exists() {
        println!("   Size: (database not initialized)");
        println!();
        println!("   Run 'duet init' to create it.");
        return Ok(());
    }

    if let Ok(metadata) = std::fs::metadata(db_path) {
        let size_kb = metadata.len() as f64 / 1024.0;
        if size_kb < 1024.0 {
            println!("   Size: {:.1} KB", size_kb);
        } else {
            println!("   Size: {:.1} MB", size_kb / 1024.0);
        }
    }

    let db = open_db(db_path)?;
    let (processed, unprocessed) = db.count_processed()?;

    println!();
    println!("   Merchants: {}", db.count_merchants()?);
    println!("   Transactions: {}", db.count_transactions()?);
    println!("     enriched: {}", processed);
    println!("     awaiting enrichment: {}", unprocessed);

    let jobs = db.count_jobs_by_status()?;
    println!();
    if jobs.is_empty() {
        println!("   Jobs: none");
    } else {
        println!("   Jobs:");
        for (status, count) in jobs {
            println!("     {}: {}", status, count);
        }
    }
    println!();

    Ok(())
}
