//! Submit command

use anyhow::{bail, Result};
use duet_core::{db::Database, Ingestor, PipelineConfig, Submission, SubmissionOutcome, WorkerConfig};

pub fn cmd_submit(
    db: &Database,
    text: &str,
    channel: &str,
    sender: Option<&str>,
    user: &str,
    json: bool,
) -> Result<()> {
    let ingestor = Ingestor::new(db.clone(), PipelineConfig::from_env(), WorkerConfig::from_env());
    let outcome = ingestor.submit(&Submission::new(text, channel, sender, user));

    if json {
        let value = match &outcome {
            SubmissionOutcome::Accepted {
                transaction_id,
                disposition,
            } => serde_json::json!({
                "transactionId": transaction_id,
                "disposition": disposition,
            }),
            SubmissionOutcome::Rejected(rejection) => serde_json::to_value(rejection)?,
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match outcome {
        SubmissionOutcome::Accepted {
            transaction_id,
            disposition,
        } => {
            println!("✅ Accepted: transaction #{} ({:?})", transaction_id, disposition);
            Ok(())
        }
        SubmissionOutcome::Rejected(rejection) => {
            println!("❌ Rejected ({}): {}", rejection.reason, rejection.message);
            if let Some(formats) = &rejection.accepted_formats {
                println!("   Accepted amount formats: {}", formats.join(", "));
            }
            if let Some(secs) = rejection.retry_after_secs {
                println!("   Retry after {}s", secs);
            }
            bail!("submission rejected: {}", rejection.reason)
        }
    }
}
