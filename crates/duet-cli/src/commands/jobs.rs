//! Enrichment worker and job queue commands

use anyhow::{Context, Result};
use duet_core::{
    db::Database, AnchorClient, CategorizerClient, EnrichmentWorker, JobOutcome, PipelineConfig,
    WorkerConfig,
};
use duet_core::models::JobStatus;

use super::truncate;

/// Run the worker in the foreground until Ctrl-C
pub async fn cmd_worker(db: &Database) -> Result<()> {
    let requeued = db.requeue_expired_leases(chrono::Utc::now())?;
    if requeued > 0 {
        println!("♻️  Requeued {} job(s) with expired leases", requeued);
    }

    println!("⚙️  Enrichment worker running (Ctrl-C to stop)...");
    let handle = duet_server::start_enrichment_worker(
        db.clone(),
        WorkerConfig::from_env(),
        PipelineConfig::from_env(),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    println!("   Finishing in-flight jobs...");
    handle.stop().await;
    println!("✅ Worker stopped");
    Ok(())
}

/// Lease and run the jobs that are due now, then exit
pub async fn cmd_worker_once(db: &Database) -> Result<()> {
    let worker = EnrichmentWorker::new(
        db.clone(),
        AnchorClient::from_env(),
        CategorizerClient::from_env(),
        WorkerConfig::from_env(),
        PipelineConfig::from_env(),
    );

    let outcomes = worker.run_once().await?;
    if outcomes.is_empty() {
        println!("No jobs due.");
        return Ok(());
    }

    let mut enriched = 0;
    let mut skipped = 0;
    let mut absorbed = 0;
    let mut retrying = 0;
    let mut failed = 0;
    for outcome in &outcomes {
        match outcome {
            JobOutcome::Enriched => enriched += 1,
            JobOutcome::AlreadyProcessed => skipped += 1,
            JobOutcome::Absorbed(_) => absorbed += 1,
            JobOutcome::Retrying(_) => retrying += 1,
            JobOutcome::Failed => failed += 1,
        }
    }

    println!("⚙️  Processed {} job(s)", outcomes.len());
    println!("   Enriched: {}", enriched);
    if skipped > 0 {
        println!("   Already processed: {}", skipped);
    }
    if absorbed > 0 {
        println!("   Absorbed by a late match: {}", absorbed);
    }
    if retrying > 0 {
        println!("   Retrying later: {}", retrying);
    }
    if failed > 0 {
        println!("   ❌ Failed: {}", failed);
    }
    Ok(())
}

pub fn cmd_jobs_list(db: &Database, failed_only: bool, limit: i64) -> Result<()> {
    let status = failed_only.then_some(JobStatus::Failed);
    let jobs = db.list_jobs(status, limit)?;

    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!();
    println!("📋 Enrichment Jobs");
    println!("   ─────────────────────────────────────────────────────────────");

    for job in jobs {
        println!(
            "   #{:<5} │ {:<11} │ tx {:<6} │ {:<9} │ {}/{} │ {}",
            job.id,
            job.kind.as_str(),
            job.transaction_id,
            job.status.as_str(),
            job.attempts,
            job.max_attempts,
            job.last_error
                .as_deref()
                .map(|e| truncate(e, 40))
                .unwrap_or_else(|| job.not_before.format("%Y-%m-%d %H:%M:%S").to_string()),
        );
    }

    Ok(())
}
