//! Server command implementation

use std::path::Path;

use anyhow::Result;

use super::open_db;

pub async fn cmd_serve(db_path: &Path, host: &str, port: u16, no_worker: bool) -> Result<()> {
    println!("🚀 Starting duet server...");
    println!("   Database: {}", db_path.display());
    println!("   Listening: http://{}:{}", host, port);
    if no_worker {
        println!("   Enrichment worker: disabled (--no-worker)");
    }

    let allowed_origins: Vec<String> = std::env::var("DUET_CORS_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    let config = duet_server::ServerConfig {
        allowed_origins,
        run_worker: !no_worker,
        ..duet_server::ServerConfig::from_env()
    };

    let db = open_db(db_path)?;
    duet_server::serve(db, host, port, config).await
}
