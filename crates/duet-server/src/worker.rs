//! Background enrichment worker
//!
//! The server drains the job queue in-process. Collaborators are chosen
//! from the environment:
//!
//! - `DUET_ANCHOR_URL`: HTTP integrity anchor (local digest anchor otherwise)
//! - `ML_SERVICE_URL`: HTTP categorizer (keyword map otherwise)
//!
//! The worker stops when [`WorkerHandle::stop`] is called, after finishing
//! the jobs it is running.

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use duet_core::{
    AnchorClient, CategorizerClient, Database, EnrichmentWorker, IntegrityAnchor, PipelineConfig,
    WorkerConfig,
};

/// Handle to a running enrichment worker task
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop and wait for in-flight jobs
    pub async fn stop(self) {
        // A send error means the task already exited
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Enrichment worker task failed: {}", e);
        }
    }
}

/// Start the enrichment worker as a background task
pub fn start_enrichment_worker(
    db: Database,
    config: WorkerConfig,
    pipeline: PipelineConfig,
) -> WorkerHandle {
    let anchor = AnchorClient::from_env();
    let categorizer = CategorizerClient::from_env();
    info!(
        anchor = anchor.name(),
        categorizer = categorizer_kind(&categorizer),
        "Starting enrichment worker"
    );

    let worker = EnrichmentWorker::new(db, anchor, categorizer, config, pipeline);
    let (shutdown, rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        if let Err(e) = worker.run(rx).await {
            error!("Enrichment worker stopped with error: {}", e);
        }
    });

    WorkerHandle { shutdown, task }
}

fn categorizer_kind(categorizer: &CategorizerClient) -> &'static str {
    match categorizer {
        CategorizerClient::Http(_) => "http",
        CategorizerClient::Keyword(_) => "keyword",
    }
}
