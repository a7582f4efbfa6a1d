//! Ingestion orchestrator
//!
//! Runs one submission through extraction, merchant resolution, duplicate
//! detection and cross-channel matching, then either completes a PENDING
//! record or creates a new one. Enrichment is handed to the job queue; the
//! caller only learns whether the submission was accepted.
//!
//! Internal failures are logged with a per-submission correlation id and
//! reported to the caller as `internal_error` carrying that id, never with
//! the underlying detail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, WorkerConfig};
use crate::db::Database;
use crate::dedup::DuplicateDetector;
use crate::error::Result;
use crate::extract::{extract_fields, AmountError};
use crate::matcher::{CrossChannelMatcher, MatchRequest};
use crate::merchant::MerchantResolver;
use crate::models::{
    Channel, ChannelEvent, JobKind, JobSchedule, MatchEnrichment, NewJob, NewMetadata,
    NewTransaction,
};

/// A raw notification as delivered by a channel integration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Submission {
    #[serde(alias = "raw_text")]
    pub raw_text: String,
    pub channel: String,
    #[serde(alias = "sender_info")]
    pub sender_info: Option<String>,
    #[serde(alias = "user_id")]
    pub user_id: String,
}

impl Submission {
    pub fn new(raw_text: &str, channel: &str, sender_info: Option<&str>, user_id: &str) -> Self {
        Self {
            raw_text: raw_text.to_string(),
            channel: channel.to_string(),
            sender_info: sender_info.map(str::to_string),
            user_id: user_id.to_string(),
        }
    }
}

/// Why a submission was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    MissingFields,
    InvalidChannel,
    UnparseableAmount,
    UnparseableMerchant,
    Duplicate,
    InternalError,
}

impl RejectReason {
    /// Wire code
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingFields => "missing_fields",
            Self::InvalidChannel => "invalid_channel",
            Self::UnparseableAmount => "unparseable_amount",
            Self::UnparseableMerchant => "unparseable_merchant",
            Self::Duplicate => "duplicate",
            Self::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A rejected submission, with whatever the caller needs to fix or retry it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepted_formats: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Rejection {
    fn new(reason: RejectReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            accepted_formats: None,
            retry_after_secs: None,
            correlation_id: None,
        }
    }

    fn unparseable_amount(err: &AmountError) -> Self {
        Self {
            accepted_formats: Some(
                err.accepted_formats()
                    .iter()
                    .map(|f| f.to_string())
                    .collect(),
            ),
            ..Self::new(RejectReason::UnparseableAmount, err.to_string())
        }
    }

    /// A request body that could not be read as a submission at all
    pub fn malformed_body(detail: impl std::fmt::Display) -> Self {
        Self::new(
            RejectReason::MissingFields,
            format!("Request body is not a valid submission: {}", detail),
        )
    }

    fn internal(correlation_id: Uuid) -> Self {
        Self {
            correlation_id: Some(correlation_id.to_string()),
            ..Self::new(
                RejectReason::InternalError,
                "Submission could not be processed",
            )
        }
    }
}

/// Whether an accepted submission created a record or completed one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// New PENDING record
    Created,
    /// Completed an existing record from the other channel
    Matched,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    Accepted {
        transaction_id: i64,
        disposition: Disposition,
    },
    Rejected(Rejection),
}

impl SubmissionOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    pub fn transaction_id(&self) -> Option<i64> {
        match self {
            Self::Accepted { transaction_id, .. } => Some(*transaction_id),
            Self::Rejected(_) => None,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            Self::Accepted { .. } => None,
            Self::Rejected(r) => Some(r.reason),
        }
    }
}

/// Synchronous ingestion front end
#[derive(Clone)]
pub struct Ingestor {
    db: Database,
    pipeline: PipelineConfig,
    jobs: WorkerConfig,
}

impl Ingestor {
    pub fn new(db: Database, pipeline: PipelineConfig, jobs: WorkerConfig) -> Self {
        Self { db, pipeline, jobs }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Ingest a submission observed now
    pub fn submit(&self, submission: &Submission) -> SubmissionOutcome {
        self.submit_at(submission, Utc::now())
    }

    /// Ingest a submission observed at `at`
    ///
    /// `at` is both the transaction timestamp and the clock used for match
    /// expiry.
    pub fn submit_at(&self, submission: &Submission, at: DateTime<Utc>) -> SubmissionOutcome {
        let correlation_id = Uuid::new_v4();
        let span = info_span!(
            "ingest",
            %correlation_id,
            channel = %submission.channel.trim(),
            user_id = %submission.user_id.trim()
        );
        let _guard = span.enter();

        match self.ingest(submission, at) {
            Ok(outcome) => {
                match &outcome {
                    SubmissionOutcome::Accepted {
                        transaction_id,
                        disposition,
                    } => info!(transaction_id, ?disposition, "Submission accepted"),
                    SubmissionOutcome::Rejected(r) => {
                        info!(reason = r.reason.as_str(), "Submission rejected: {}", r.message)
                    }
                }
                outcome
            }
            Err(e) => {
                error!("Ingestion failed: {}", e);
                SubmissionOutcome::Rejected(Rejection::internal(correlation_id))
            }
        }
    }

    fn ingest(&self, submission: &Submission, at: DateTime<Utc>) -> Result<SubmissionOutcome> {
        let raw_text = submission.raw_text.trim();
        let channel = submission.channel.trim();
        let user_id = submission.user_id.trim();
        let sender = submission
            .sender_info
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let missing: Vec<&str> = [("rawText", raw_text), ("channel", channel), ("userId", user_id)]
            .into_iter()
            .filter(|(_, value)| value.is_empty())
            .map(|(name, _)| name)
            .collect();
        if !missing.is_empty() {
            return Ok(reject(
                RejectReason::MissingFields,
                format!("Missing required fields: {}", missing.join(", ")),
            ));
        }

        let channel: Channel = match channel.parse() {
            Ok(c) => c,
            Err(e) => return Ok(reject(RejectReason::InvalidChannel, e)),
        };

        let event = ChannelEvent::new(channel, raw_text.to_string(), sender.map(str::to_string));
        let fields = match extract_fields(&event) {
            Ok(fields) => fields,
            Err(e) => {
                return Ok(SubmissionOutcome::Rejected(Rejection::unparseable_amount(&e)));
            }
        };

        let Some(merchant) = MerchantResolver::new(&self.db).resolve(raw_text, sender)? else {
            return Ok(reject(
                RejectReason::UnparseableMerchant,
                "Could not identify the merchant; include a clear merchant name",
            ));
        };

        let detector = DuplicateDetector::new(&self.db, &self.pipeline);
        if let Some(previous) =
            detector.find_duplicate(user_id, merchant.id, channel, fields.amount, at)?
        {
            debug!(duplicate_of = previous.transaction_id, "Same-channel repeat");
            return Ok(SubmissionOutcome::Rejected(Rejection {
                retry_after_secs: Some(detector.retry_after_secs(&previous, at)),
                ..Rejection::new(
                    RejectReason::Duplicate,
                    "A matching transaction from this channel was just recorded",
                )
            }));
        }

        let enrichment = MatchEnrichment {
            product_details: fields.product_details(),
            direction: fields.direction,
            payment_mode: fields.payment_mode,
        };

        let request = MatchRequest {
            user_id,
            raw_text,
            merchant: &merchant,
            channel,
            amount: fields.amount,
            at,
        };
        let matcher = CrossChannelMatcher::new(&self.db, &self.pipeline);
        if let Some(matched) = matcher.match_and_claim(&request, &enrichment, at)? {
            let existing = &matched.candidate.transaction;
            let job = NewJob::for_transaction(existing, &self.schedule(JobKind::Enrich, at));
            // The claim is committed; a queue hiccup must not turn it into a rejection
            if let Err(e) = self.db.enqueue_job(&job) {
                warn!(transaction_id = existing.id, "Failed to schedule enrichment: {}", e);
            }
            return Ok(SubmissionOutcome::Accepted {
                transaction_id: existing.id,
                disposition: Disposition::Matched,
            });
        }

        let created = self.db.create_transaction_with_metadata(
            &NewTransaction {
                user_id: user_id.to_string(),
                raw_text: raw_text.to_string(),
                amount: fields.amount,
                merchant_id: merchant.id,
                channel,
                sender_info: sender.map(str::to_string),
                transaction_date: at,
            },
            &NewMetadata {
                product_details: enrichment.product_details,
                direction: enrichment.direction,
                payment_mode: enrichment.payment_mode,
                match_expires_at: at + self.pipeline.match_expiry,
            },
            Some(&self.schedule(JobKind::RetryMatch, at + self.pipeline.retry_match_delay)),
        )?;

        Ok(SubmissionOutcome::Accepted {
            transaction_id: created.id,
            disposition: Disposition::Created,
        })
    }

    fn schedule(&self, kind: JobKind, not_before: DateTime<Utc>) -> JobSchedule {
        JobSchedule {
            kind,
            not_before,
            max_attempts: self.jobs.max_attempts,
            backoff_ms: self.jobs.backoff_ms,
        }
    }
}

fn reject(reason: RejectReason, message: impl Into<String>) -> SubmissionOutcome {
    SubmissionOutcome::Rejected(Rejection::new(reason, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ingestor() -> Ingestor {
        Ingestor::new(
            Database::in_memory().unwrap(),
            PipelineConfig::default(),
            WorkerConfig::default(),
        )
    }

    #[test]
    fn test_missing_fields() {
        let ing = ingestor();
        let outcome = ing.submit(&Submission::new("  ", "fast", None, "u1"));
        match outcome {
            SubmissionOutcome::Rejected(r) => {
                assert_eq!(r.reason, RejectReason::MissingFields);
                assert!(r.message.contains("rawText"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_channel() {
        let ing = ingestor();
        let outcome = ing.submit(&Submission::new("Rs.10 paid to SWIGGY", "fax", None, "u1"));
        assert_eq!(outcome.reject_reason(), Some(RejectReason::InvalidChannel));
    }

    #[test]
    fn test_unparseable_amount_lists_formats() {
        let ing = ingestor();
        match ing.submit(&Submission::new("paid to SWIGGY", "fast", None, "u1")) {
            SubmissionOutcome::Rejected(r) => {
                assert_eq!(r.reason, RejectReason::UnparseableAmount);
                let formats = r.accepted_formats.unwrap();
                assert!(formats.iter().any(|f| f == "INR 1,234.56"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(ing.db().count_transactions().unwrap(), 0);
    }

    #[test]
    fn test_unparseable_merchant() {
        let ing = ingestor();
        let outcome = ing.submit(&Submission::new("Rs.410 deducted", "fast", None, "u1"));
        assert_eq!(outcome.reject_reason(), Some(RejectReason::UnparseableMerchant));
    }

    #[test]
    fn test_created_record_is_pending_with_retry_job() {
        let ing = ingestor();
        let at = Utc::now();
        let outcome = ing.submit_at(
            &Submission::new("Rs.500 debited for purchase at SWIGGY", "fast", None, "u1"),
            at,
        );
        let SubmissionOutcome::Accepted {
            transaction_id,
            disposition,
        } = outcome
        else {
            panic!("expected acceptance");
        };
        assert_eq!(disposition, Disposition::Created);

        let meta = ing.db().get_metadata(transaction_id).unwrap().unwrap();
        assert_eq!(meta.match_status, crate::models::MatchStatus::Pending);
        let expires = meta.match_expires_at.unwrap();
        assert!((expires - (at + chrono::Duration::minutes(10))).num_milliseconds().abs() < 2);

        let job = ing.db().live_job_for(transaction_id).unwrap().unwrap();
        assert_eq!(job.kind, JobKind::RetryMatch);
        assert_eq!(job.job_key, format!("enrich:{}", transaction_id));
    }

    #[test]
    fn test_submission_accepts_camel_and_snake_case() {
        let camel: Submission = serde_json::from_str(
            r#"{"rawText":"Rs.5 paid to ZOMATO","channel":"sms","senderInfo":"ZMT","userId":"u"}"#,
        )
        .unwrap();
        let snake: Submission = serde_json::from_str(
            r#"{"raw_text":"Rs.5 paid to ZOMATO","channel":"sms","sender_info":"ZMT","user_id":"u"}"#,
        )
        .unwrap();
        assert_eq!(camel.raw_text, snake.raw_text);
        assert_eq!(camel.user_id, "u");

        let partial: Submission = serde_json::from_str(r#"{"channel":"fast"}"#).unwrap();
        assert!(partial.raw_text.is_empty());
    }

    #[test]
    fn test_store_failure_is_internal_error_and_writes_nothing() {
        let ing = ingestor();
        ing.db()
            .conn()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_metadata BEFORE INSERT ON transaction_metadata
                 BEGIN SELECT RAISE(ABORT, 'disk unavailable'); END;",
            )
            .unwrap();

        let outcome = ing.submit(&Submission::new("Rs.500 paid to SWIGGY", "fast", None, "u1"));
        let SubmissionOutcome::Rejected(rejection) = outcome else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.reason, RejectReason::InternalError);
        let correlation_id = rejection.correlation_id.expect("correlation id");
        assert!(Uuid::parse_str(&correlation_id).is_ok());

        let conn = ing.db().conn().unwrap();
        let count = |table: &str| -> i64 {
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
                .unwrap()
        };
        assert_eq!(count("transactions"), 0);
        assert_eq!(count("transaction_metadata"), 0);
        assert_eq!(count("enrichment_jobs"), 0);
    }

    #[test]
    fn test_malformed_body_rejection() {
        let rejection = Rejection::malformed_body("expected value at line 1 column 2");
        assert_eq!(rejection.reason, RejectReason::MissingFields);
        assert!(rejection.message.contains("line 1 column 2"));
        assert_eq!(rejection.correlation_id, None);
    }
}
