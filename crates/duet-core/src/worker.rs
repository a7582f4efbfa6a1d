//! Enrichment worker
//!
//! Pulls due jobs from the queue and finalizes their transactions:
//! fingerprint, anchor, categorize, then mark processed. At most
//! `concurrency` jobs run at once so the anchoring and categorization
//! services are not flooded.
//!
//! Jobs are replay-safe. A job for a transaction that is already processed
//! acknowledges without calling any collaborator, and the final write only
//! lands on an unprocessed record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::anchor::IntegrityAnchor;
use crate::categorize::Categorizer;
use crate::config::{PipelineConfig, WorkerConfig};
use crate::db::{Database, FailOutcome};
use crate::error::{Error, Result};
use crate::matcher::CrossChannelMatcher;
use crate::models::{EnrichmentJob, JobKind, MatchStatus, Transaction};

/// Content fingerprint: hex SHA-256 over the length-prefixed defining fields
///
/// The amount is normalized first, so `500` and `500.00` agree.
pub fn fingerprint(user_id: &str, amount: Decimal, merchant_id: i64, raw_text: &str) -> String {
    let amount = amount.normalize().to_string();
    let merchant_id = merchant_id.to_string();

    let mut hasher = Sha256::new();
    for field in [user_id, amount.as_str(), merchant_id.as_str(), raw_text] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint of a stored transaction
pub fn transaction_fingerprint(tx: &Transaction) -> String {
    fingerprint(&tx.user_id, tx.amount, tx.merchant_id, &tx.raw_text)
}

/// How a job run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Enrichment written
    Enriched,
    /// Transaction was already processed; nothing done
    AlreadyProcessed,
    /// Transaction was folded into the record with this id; nothing done
    Absorbed(i64),
    /// Failed, will run again at this time
    Retrying(DateTime<Utc>),
    /// Failed for good
    Failed,
}

enum Execution {
    Enriched,
    AlreadyProcessed,
    Absorbed(i64),
}

/// Queue consumer that enriches transactions
pub struct EnrichmentWorker<A, C> {
    db: Database,
    anchor: Arc<A>,
    categorizer: Arc<C>,
    config: WorkerConfig,
    pipeline: PipelineConfig,
    permits: Arc<Semaphore>,
}

impl<A, C> Clone for EnrichmentWorker<A, C> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            anchor: self.anchor.clone(),
            categorizer: self.categorizer.clone(),
            config: self.config.clone(),
            pipeline: self.pipeline.clone(),
            permits: self.permits.clone(),
        }
    }
}

impl<A, C> EnrichmentWorker<A, C>
where
    A: IntegrityAnchor + 'static,
    C: Categorizer + 'static,
{
    pub fn new(
        db: Database,
        anchor: A,
        categorizer: C,
        config: WorkerConfig,
        pipeline: PipelineConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency));
        Self {
            db,
            anchor: Arc::new(anchor),
            categorizer: Arc::new(categorizer),
            config,
            pipeline,
            permits,
        }
    }

    /// Poll and run jobs until `shutdown` flips to true (or its sender is
    /// dropped), then wait for in-flight jobs to finish
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            concurrency = self.config.concurrency,
            max_attempts = self.config.max_attempts,
            "Enrichment worker started"
        );

        let mut in_flight = JoinSet::new();

        loop {
            while let Some(finished) = in_flight.try_join_next() {
                if let Err(e) = finished {
                    error!("Enrichment task panicked: {}", e);
                }
            }

            let free = self.permits.available_permits();
            let leased = if free == 0 {
                Vec::new()
            } else {
                match self
                    .db
                    .lease_jobs(Utc::now(), self.config.lease_duration, free)
                {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!("Failed to lease jobs: {}", e);
                        Vec::new()
                    }
                }
            };

            let idle = leased.is_empty();
            for job in leased {
                self.spawn_job(&mut in_flight, job, None).await?;
            }

            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }

            if *shutdown.borrow() {
                break;
            }
        }

        info!(in_flight = in_flight.len(), "Enrichment worker stopping");
        while let Some(finished) = in_flight.join_next().await {
            if let Err(e) = finished {
                error!("Enrichment task panicked: {}", e);
            }
        }
        info!("Enrichment worker stopped");
        Ok(())
    }

    /// Lease one batch of due jobs, run them, and wait for all of them
    pub async fn run_once(&self) -> Result<Vec<JobOutcome>> {
        self.run_once_at(Utc::now()).await
    }

    /// `run_once` as if the clock read `now`
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<Vec<JobOutcome>> {
        let leased = self
            .db
            .lease_jobs(now, self.config.lease_duration, self.config.concurrency)?;

        let mut in_flight = JoinSet::new();
        for job in leased {
            self.spawn_job(&mut in_flight, job, Some(now)).await?;
        }

        let mut outcomes = Vec::new();
        while let Some(finished) = in_flight.join_next().await {
            match finished {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Enrichment task panicked: {}", e),
            }
        }
        Ok(outcomes)
    }

    async fn spawn_job(
        &self,
        in_flight: &mut JoinSet<JobOutcome>,
        job: EnrichmentJob,
        now: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::Queue("worker semaphore closed".into()))?;

        let worker = self.clone();
        let span = info_span!(
            "job",
            job_key = %job.job_key,
            kind = job.kind.as_str(),
            attempt = job.attempts
        );
        in_flight.spawn(
            async move {
                let outcome = worker.process_job(&job, now.unwrap_or_else(Utc::now)).await;
                drop(permit);
                outcome
            }
            .instrument(span),
        );
        Ok(())
    }

    /// Run one leased job and record the result on the queue
    pub async fn process_job(&self, job: &EnrichmentJob, now: DateTime<Utc>) -> JobOutcome {
        let result = self.execute(job, now).await;

        let outcome = match result {
            Ok(execution) => {
                if let Err(e) = self.db.ack_job(job.id) {
                    error!("Failed to acknowledge job: {}", e);
                }
                match execution {
                    Execution::Enriched => JobOutcome::Enriched,
                    Execution::AlreadyProcessed => JobOutcome::AlreadyProcessed,
                    Execution::Absorbed(into) => JobOutcome::Absorbed(into),
                }
            }
            Err(e) => {
                let retryable = e.is_retryable();
                match self.db.fail_job(job.id, &e.to_string(), retryable, now) {
                    Ok(FailOutcome::Retrying(at)) => {
                        warn!(retry_at = %at, "Enrichment failed, will retry: {}", e);
                        JobOutcome::Retrying(at)
                    }
                    Ok(FailOutcome::Failed) => {
                        error!(
                            transaction_id = job.transaction_id,
                            retryable,
                            "Enrichment failed permanently: {}",
                            e
                        );
                        JobOutcome::Failed
                    }
                    Err(queue_err) => {
                        error!("Failed to record job failure ({}): {}", e, queue_err);
                        JobOutcome::Failed
                    }
                }
            }
        };

        debug!(?outcome, "Job finished");
        outcome
    }

    async fn execute(&self, job: &EnrichmentJob, now: DateTime<Utc>) -> Result<Execution> {
        let tx = self
            .db
            .get_transaction(job.transaction_id)?
            .ok_or_else(|| Error::NotFound(format!("transaction {}", job.transaction_id)))?;

        if tx.processed {
            debug!(transaction_id = tx.id, "Already processed, skipping");
            return Ok(Execution::AlreadyProcessed);
        }

        let merchant = self
            .db
            .get_merchant(tx.merchant_id)?
            .ok_or_else(|| Error::NotFound(format!("merchant {}", tx.merchant_id)))?;
        let metadata = self.db.get_metadata(tx.id)?;

        if let Some(into) = metadata.as_ref().and_then(|m| m.absorbed_into) {
            debug!(transaction_id = tx.id, absorbed_into = into, "Absorbed by a late match, skipping");
            return Ok(Execution::Absorbed(into));
        }

        let pending = metadata
            .as_ref()
            .is_some_and(|m| m.match_status == MatchStatus::Pending);
        if job.kind == JobKind::RetryMatch && pending {
            let matcher = CrossChannelMatcher::new(&self.db, &self.pipeline);
            if let Some(absorbed_id) = matcher.rematch(&tx, &merchant, now)? {
                info!(transaction_id = tx.id, absorbed_id, "Late match folded into record");
            }
        }

        let fingerprint = transaction_fingerprint(&tx);
        let signature = self.anchor.anchor(&fingerprint).await?;

        // Products may have been merged in by a match since the job was queued
        let products = self
            .db
            .get_metadata(tx.id)?
            .and_then(|m| m.product_details);
        let category = match self
            .categorizer
            .categorize(&merchant.name, products.as_deref())
            .await
        {
            Ok(category) => Some(category),
            Err(e) => {
                warn!(transaction_id = tx.id, "Categorization failed, leaving uncategorized: {}", e);
                None
            }
        };

        if !self
            .db
            .complete_enrichment(tx.id, &fingerprint, &signature, category.as_deref())?
        {
            debug!(transaction_id = tx.id, "Processed or absorbed concurrently, nothing written");
            return Ok(Execution::AlreadyProcessed);
        }

        info!(
            transaction_id = tx.id,
            anchor = self.anchor.name(),
            category = category.as_deref().unwrap_or("-"),
            "Transaction enriched"
        );
        Ok(Execution::Enriched)
    }
}
