//! Domain models for duet

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Currency every extracted amount is denominated in
pub const CURRENCY: &str = "INR";

/// Storage bounds for free-text columns
pub const MAX_RAW_TEXT_LEN: usize = 1024;
pub const MAX_SENDER_LEN: usize = 100;
pub const MAX_MERCHANT_NAME_LEN: usize = 255;

/// Origin pathway of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    /// Near-real-time short message (SMS-like)
    Fast,
    /// Richer, delayed message (email-like)
    Slow,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Slow => "slow",
        }
    }

    /// The complementary channel a match is searched in
    pub fn opposite(&self) -> Self {
        match self {
            Self::Fast => Self::Slow,
            Self::Slow => Self::Fast,
        }
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" | "sms" => Ok(Self::Fast),
            "slow" | "email" => Ok(Self::Slow),
            _ => Err(format!("Unknown channel: {}", s)),
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A notification from the fast channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastChannelEvent {
    pub raw_text: String,
    pub sender: Option<String>,
}

/// A notification from the slow channel; carries product details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlowChannelEvent {
    pub raw_text: String,
    pub sender: Option<String>,
}

/// A validated inbound notification, typed by the channel it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Fast(FastChannelEvent),
    Slow(SlowChannelEvent),
}

impl ChannelEvent {
    pub fn new(channel: Channel, raw_text: String, sender: Option<String>) -> Self {
        match channel {
            Channel::Fast => Self::Fast(FastChannelEvent { raw_text, sender }),
            Channel::Slow => Self::Slow(SlowChannelEvent { raw_text, sender }),
        }
    }

    pub fn channel(&self) -> Channel {
        match self {
            Self::Fast(_) => Channel::Fast,
            Self::Slow(_) => Channel::Slow,
        }
    }

    pub fn raw_text(&self) -> &str {
        match self {
            Self::Fast(e) => &e.raw_text,
            Self::Slow(e) => &e.raw_text,
        }
    }

    pub fn sender(&self) -> Option<&str> {
        match self {
            Self::Fast(e) => e.sender.as_deref(),
            Self::Slow(e) => e.sender.as_deref(),
        }
    }
}

/// Money movement direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionDirection {
    Debit,
    Credit,
    #[default]
    Unknown,
}

impl TransactionDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debit => "DEBIT",
            Self::Credit => "CREDIT",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::str::FromStr for TransactionDirection {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DEBIT" => Ok(Self::Debit),
            "CREDIT" => Ok(Self::Credit),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("Unknown transaction direction: {}", s)),
        }
    }
}

impl std::fmt::Display for TransactionDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment rail used for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMode {
    Upi,
    CreditCard,
    DebitCard,
    Netbanking,
    Wallet,
    Cash,
    Emi,
    Loan,
    #[default]
    Unknown,
}

impl PaymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upi => "UPI",
            Self::CreditCard => "CREDIT_CARD",
            Self::DebitCard => "DEBIT_CARD",
            Self::Netbanking => "NETBANKING",
            Self::Wallet => "WALLET",
            Self::Cash => "CASH",
            Self::Emi => "EMI",
            Self::Loan => "LOAN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::str::FromStr for PaymentMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "UPI" => Ok(Self::Upi),
            "CREDIT_CARD" => Ok(Self::CreditCard),
            "DEBIT_CARD" => Ok(Self::DebitCard),
            "NETBANKING" => Ok(Self::Netbanking),
            "WALLET" => Ok(Self::Wallet),
            "CASH" => Ok(Self::Cash),
            "EMI" => Ok(Self::Emi),
            "LOAN" => Ok(Self::Loan),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("Unknown payment mode: {}", s)),
        }
    }
}

impl std::fmt::Display for PaymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Canonical counterparty identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: i64,
    /// Display name in its original casing
    pub name: String,
    /// Lowercase, separator-collapsed lookup key (unique)
    pub normalized_key: String,
    pub created_at: DateTime<Utc>,
}

/// One purchase event as seen from one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub user_id: String,
    pub raw_text: String,
    pub amount: Decimal,
    pub merchant_id: i64,
    pub channel: Channel,
    pub sender_info: Option<String>,
    pub transaction_date: DateTime<Utc>,
    /// Set once enrichment completes; never reset
    pub processed: bool,
    pub category: Option<String>,
    /// Hex SHA-256 over the defining fields
    pub fingerprint: Option<String>,
    /// Handle returned by the integrity anchor
    pub anchor_signature: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A transaction to be created (before DB insertion)
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub user_id: String,
    pub raw_text: String,
    pub amount: Decimal,
    pub merchant_id: i64,
    pub channel: Channel,
    pub sender_info: Option<String>,
    pub transaction_date: DateTime<Utc>,
}

/// Matching state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchStatus {
    Pending,
    Matched,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Matched => "MATCHED",
        }
    }
}

impl std::str::FromStr for MatchStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "MATCHED" => Ok(Self::Matched),
            _ => Err(format!("Unknown match status: {}", s)),
        }
    }
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Matching and enrichment state, one-to-one with a transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionMetadata {
    pub transaction_id: i64,
    pub match_status: MatchStatus,
    /// Only set while PENDING
    pub match_expires_at: Option<DateTime<Utc>>,
    pub product_details: Option<String>,
    pub direction: TransactionDirection,
    pub payment_mode: PaymentMode,
    /// Earlier record this one was folded into by a late match
    pub absorbed_into: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// A matched submission folded into an existing record
///
/// Stored so that a retransmission of it is still caught by duplicate
/// detection even though it never became a transaction of its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbsorbedSubmission {
    pub id: i64,
    /// Record the submission was merged into
    pub transaction_id: i64,
    pub user_id: String,
    pub merchant_id: i64,
    pub channel: Channel,
    pub amount: Decimal,
    pub raw_text: String,
    pub observed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// An absorbed submission to be recorded
#[derive(Debug, Clone)]
pub struct NewAbsorbedSubmission {
    pub user_id: String,
    pub merchant_id: i64,
    pub channel: Channel,
    pub amount: Decimal,
    pub raw_text: String,
    pub observed_at: DateTime<Utc>,
}

/// Metadata written alongside a new PENDING transaction
#[derive(Debug, Clone)]
pub struct NewMetadata {
    pub product_details: Option<String>,
    pub direction: TransactionDirection,
    pub payment_mode: PaymentMode,
    pub match_expires_at: DateTime<Utc>,
}

/// Fields a matching submission merges into the claimed record
#[derive(Debug, Clone, Default)]
pub struct MatchEnrichment {
    pub product_details: Option<String>,
    pub direction: TransactionDirection,
    pub payment_mode: PaymentMode,
}

impl From<&TransactionMetadata> for MatchEnrichment {
    fn from(metadata: &TransactionMetadata) -> Self {
        Self {
            product_details: metadata.product_details.clone(),
            direction: metadata.direction,
            payment_mode: metadata.payment_mode,
        }
    }
}

/// Kind of queued work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fingerprint, anchor and categorize a transaction
    Enrich,
    /// Look for a late complementary record, then enrich
    RetryMatch,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enrich => "enrich",
            Self::RetryMatch => "retry_match",
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "enrich" => Ok(Self::Enrich),
            "retry_match" => Ok(Self::RetryMatch),
            _ => Err(format!("Unknown job kind: {}", s)),
        }
    }
}

/// Lifecycle of a queued job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Live jobs hold the job key; terminal ones release it
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot carried by an enrichment job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub user_id: String,
    pub merchant_id: i64,
    pub amount: Decimal,
    pub raw_text: String,
}

impl JobPayload {
    pub fn for_transaction(tx: &Transaction) -> Self {
        Self {
            user_id: tx.user_id.clone(),
            merchant_id: tx.merchant_id,
            amount: tx.amount,
            raw_text: tx.raw_text.clone(),
        }
    }
}

/// A job as stored in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentJob {
    pub id: i64,
    pub job_key: String,
    pub kind: JobKind,
    pub transaction_id: i64,
    pub payload: JobPayload,
    pub status: JobStatus,
    /// Number of times the job has been leased
    pub attempts: u32,
    pub max_attempts: u32,
    /// Base delay; doubled per retry
    pub backoff_ms: u64,
    pub not_before: DateTime<Utc>,
    pub leased_until: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for putting work on the queue
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub transaction_id: i64,
    pub payload: JobPayload,
    pub not_before: DateTime<Utc>,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl NewJob {
    pub fn for_transaction(tx: &Transaction, schedule: &JobSchedule) -> Self {
        Self {
            kind: schedule.kind,
            transaction_id: tx.id,
            payload: JobPayload::for_transaction(tx),
            not_before: schedule.not_before,
            max_attempts: schedule.max_attempts,
            backoff_ms: schedule.backoff_ms,
        }
    }
}

/// When and how to run a job for a transaction that may not exist yet
#[derive(Debug, Clone)]
pub struct JobSchedule {
    pub kind: JobKind,
    pub not_before: DateTime<Utc>,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

/// Truncate on a char boundary
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
