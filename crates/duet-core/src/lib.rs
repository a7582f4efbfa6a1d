//! Duet Core Library
//!
//! Shared functionality for the duet transaction pipeline:
//! - Field extraction from fast-channel (SMS-like) and slow-channel
//!   (email-like) notifications
//! - Merchant resolution to canonical identities
//! - Same-channel duplicate detection
//! - Cross-channel matching of PENDING records
//! - SQLite record store and enrichment job queue
//! - Enrichment worker with pluggable anchoring and categorization backends

pub mod anchor;
pub mod categorize;
pub mod config;
pub mod db;
pub mod dedup;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod matcher;
pub mod merchant;
pub mod models;
pub mod worker;

pub use anchor::{AnchorClient, DigestAnchor, HttpAnchor, IntegrityAnchor, MockAnchor};
pub use categorize::{
    Categorizer, CategorizerClient, HttpCategorizer, KeywordCategorizer, MockCategorizer,
};
pub use config::{MatchSelection, PipelineConfig, WorkerConfig};
pub use db::Database;
pub use error::{CollaboratorError, Error, Result};
pub use ingest::{Disposition, Ingestor, RejectReason, Rejection, Submission, SubmissionOutcome};
pub use worker::{EnrichmentWorker, JobOutcome};
