//! Same-channel duplicate detection
//!
//! Notification sources retransmit. A submission is a duplicate when the
//! same user already has a record for the same merchant on the same channel,
//! with an amount within the tolerance of the new amount, inside the trailing
//! window that ends at the new submission's timestamp. Submissions that
//! were matched and absorbed into an existing record count as sightings too.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::PipelineConfig;
use crate::db::Database;
use crate::error::Result;
use crate::models::Channel;

/// Amount bounds `amount × (1 ± tolerance)`
pub fn tolerance_range(amount: Decimal, tolerance: Decimal) -> (Decimal, Decimal) {
    let delta = amount * tolerance;
    (amount - delta, amount + delta)
}

/// The most recent earlier sighting of a repeated submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorSubmission {
    /// Record the earlier submission was stored as or absorbed into
    pub transaction_id: i64,
    pub seen_at: DateTime<Utc>,
}

pub struct DuplicateDetector<'a> {
    db: &'a Database,
    config: &'a PipelineConfig,
}

impl<'a> DuplicateDetector<'a> {
    pub fn new(db: &'a Database, config: &'a PipelineConfig) -> Self {
        Self { db, config }
    }

    /// The latest earlier sighting this submission repeats, if any
    ///
    /// Lookup errors propagate; a failed check is never read as "not a
    /// duplicate".
    pub fn find_duplicate(
        &self,
        user_id: &str,
        merchant_id: i64,
        channel: Channel,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> Result<Option<PriorSubmission>> {
        let (min_amount, max_amount) = tolerance_range(amount, self.config.dedup_tolerance);
        let from = at - self.config.dedup_window;

        let stored = self
            .db
            .find_similar_transactions(user_id, merchant_id, channel, min_amount, max_amount, from, at)?
            .into_iter()
            .map(|t| PriorSubmission {
                transaction_id: t.id,
                seen_at: t.transaction_date,
            });
        let absorbed = self
            .db
            .find_absorbed_submissions(user_id, merchant_id, channel, min_amount, max_amount, from, at)?
            .into_iter()
            .map(|a| PriorSubmission {
                transaction_id: a.transaction_id,
                seen_at: a.observed_at,
            });

        Ok(stored.chain(absorbed).max_by_key(|p| p.seen_at))
    }

    /// Seconds until a repeat of this submission would be accepted
    pub fn retry_after_secs(&self, prior: &PriorSubmission, at: DateTime<Utc>) -> i64 {
        let clears_at = prior.seen_at + self.config.dedup_window;
        (clears_at - at).num_seconds().max(0) + 1
    }
}
