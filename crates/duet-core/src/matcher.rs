//! Cross-channel matching
//!
//! The same purchase usually arrives twice: once on the fast channel and
//! once, later and richer, on the slow channel. A new submission is matched
//! against still-PENDING records of the opposite channel for the same user
//! whose amount and timestamp are close and whose merchant name is similar
//! enough. Claiming a candidate is a conditional update, so two concurrent
//! submissions can never both win the same record.
//!
//! A matched submission is absorbed into the record it claimed rather than
//! stored on its own. When the slow channel arrives first and the fast one
//! only later, the late record is folded into the earlier one once its
//! retry-match job runs, so a purchase always ends as one enriched record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::config::{MatchSelection, PipelineConfig};
use crate::db::{Database, PendingCandidate};
use crate::dedup::tolerance_range;
use crate::error::Result;
use crate::models::{Channel, MatchEnrichment, Merchant, NewAbsorbedSubmission, Transaction};

/// Corporate suffixes that say nothing about who the merchant is
const IGNORED_NAME_TOKENS: &[&str] = &[
    "ltd", "pvt", "private", "limited", "inc", "llc", "corp", "co", "india",
];

/// Similarity of two merchants in `0.0..=1.0`
///
/// The same stored merchant always scores 1.0.
pub fn merchant_similarity(a: &Merchant, b: &Merchant) -> f64 {
    if a.id == b.id {
        return 1.0;
    }
    name_similarity(&a.name, &b.name)
}

/// Sørensen–Dice coefficient over character bigrams of the names' core
/// tokens
///
/// Names are case-folded, split on anything non-alphanumeric and stripped of
/// corporate suffixes before comparison, so "Zomato" and "ZOMATO LTD" are
/// identical.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = comparable_form(a);
    let b = comparable_form(b);

    if a == b {
        return 1.0;
    }
    if a.chars().count() < 2 || b.chars().count() < 2 {
        return 0.0;
    }

    let a_bigrams = bigrams(&a);
    let b_bigrams = bigrams(&b);
    let a_total: usize = a_bigrams.values().sum();
    let b_total: usize = b_bigrams.values().sum();

    let shared: usize = a_bigrams
        .iter()
        .map(|(bigram, count)| (*count).min(*b_bigrams.get(bigram).unwrap_or(&0)))
        .sum();

    (2 * shared) as f64 / (a_total + b_total) as f64
}

fn comparable_form(name: &str) -> String {
    let lowered = name.to_lowercase();
    let tokens: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    let core: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|t| !IGNORED_NAME_TOKENS.contains(t))
        .collect();

    // A name made only of suffixes is still a name
    if core.is_empty() {
        tokens.concat()
    } else {
        core.concat()
    }
}

fn bigrams(s: &str) -> HashMap<(char, char), usize> {
    let chars: Vec<char> = s.chars().collect();
    let mut counts = HashMap::new();
    for pair in chars.windows(2) {
        *counts.entry((pair[0], pair[1])).or_insert(0) += 1;
    }
    counts
}

/// A qualifying candidate and how similar its merchant is
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub candidate: PendingCandidate,
    pub similarity: f64,
}

/// What a submission looks like to the matcher
#[derive(Debug, Clone)]
pub struct MatchRequest<'r> {
    pub user_id: &'r str,
    pub raw_text: &'r str,
    pub merchant: &'r Merchant,
    /// Channel of the new submission; candidates come from the other one
    pub channel: Channel,
    pub amount: Decimal,
    pub at: DateTime<Utc>,
}

impl MatchRequest<'_> {
    fn as_absorbed(&self) -> NewAbsorbedSubmission {
        NewAbsorbedSubmission {
            user_id: self.user_id.to_string(),
            merchant_id: self.merchant.id,
            channel: self.channel,
            amount: self.amount,
            raw_text: self.raw_text.to_string(),
            observed_at: self.at,
        }
    }
}

pub struct CrossChannelMatcher<'a> {
    db: &'a Database,
    config: &'a PipelineConfig,
}

impl<'a> CrossChannelMatcher<'a> {
    pub fn new(db: &'a Database, config: &'a PipelineConfig) -> Self {
        Self { db, config }
    }

    /// Candidates over the similarity threshold, in the order they should be
    /// tried
    pub fn rank_candidates(
        &self,
        request: &MatchRequest<'_>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredCandidate>> {
        let (min_amount, max_amount) = tolerance_range(request.amount, self.config.match_tolerance);
        let candidates = self.db.find_pending_candidates(
            request.user_id,
            request.channel.opposite(),
            min_amount,
            max_amount,
            request.at - self.config.match_window,
            request.at + self.config.match_window,
            now,
        )?;

        let mut scored: Vec<ScoredCandidate> = candidates
            .into_iter()
            .map(|candidate| ScoredCandidate {
                similarity: merchant_similarity(&candidate.merchant, request.merchant),
                candidate,
            })
            .filter(|s| s.similarity >= self.config.similarity_threshold)
            .collect();

        if self.config.selection == MatchSelection::Best {
            scored.sort_by(|a, b| {
                b.similarity
                    .total_cmp(&a.similarity)
                    .then_with(|| {
                        distance(&a.candidate.transaction, request.at)
                            .cmp(&distance(&b.candidate.transaction, request.at))
                    })
                    .then_with(|| a.candidate.transaction.id.cmp(&b.candidate.transaction.id))
            });
        }

        Ok(scored)
    }

    /// Find a PENDING record this submission completes, claim it and
    /// record the submission as absorbed into it
    ///
    /// Candidates are tried in rank order; one that another submission
    /// claimed first (or that just expired) is skipped.
    pub fn match_and_claim(
        &self,
        request: &MatchRequest<'_>,
        enrichment: &MatchEnrichment,
        now: DateTime<Utc>,
    ) -> Result<Option<ScoredCandidate>> {
        let absorbed = request.as_absorbed();
        for scored in self.rank_candidates(request, now)? {
            let id = scored.candidate.transaction.id;
            if self.db.claim_and_absorb(id, enrichment, &absorbed, now)? {
                debug!(
                    transaction_id = id,
                    similarity = scored.similarity,
                    "Claimed cross-channel match"
                );
                return Ok(Some(scored));
            }
            debug!(transaction_id = id, "Candidate already claimed or expired");
        }
        Ok(None)
    }

    /// Late match for a record that is still PENDING
    ///
    /// Looks for an opposite-channel PENDING record that arrived after this
    /// one and folds it into this record. Returns the absorbed record's id.
    pub fn rematch(
        &self,
        transaction: &Transaction,
        merchant: &Merchant,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>> {
        let request = MatchRequest {
            user_id: &transaction.user_id,
            raw_text: &transaction.raw_text,
            merchant,
            channel: transaction.channel,
            amount: transaction.amount,
            at: transaction.transaction_date,
        };

        for scored in self.rank_candidates(&request, now)? {
            let late = &scored.candidate.transaction;
            if late.id == transaction.id
                || late.processed
                || late.transaction_date < transaction.transaction_date
            {
                continue;
            }

            let late_fields = match self.db.get_metadata(late.id)? {
                Some(metadata) => MatchEnrichment::from(&metadata),
                None => continue,
            };

            if self
                .db
                .absorb_late_record(transaction.id, late.id, &late_fields, now)?
            {
                debug!(
                    transaction_id = transaction.id,
                    absorbed_id = late.id,
                    "Absorbed late cross-channel match"
                );
                return Ok(Some(late.id));
            }
        }
        Ok(None)
    }
}

fn distance(transaction: &Transaction, at: DateTime<Utc>) -> i64 {
    (transaction.transaction_date - at).num_milliseconds().abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixes_do_not_count() {
        assert_eq!(name_similarity("Zomato", "ZOMATO LTD"), 1.0);
        assert_eq!(name_similarity("Swiggy", "Swiggy India Pvt Ltd"), 1.0);
    }

    #[test]
    fn test_unrelated_names_score_low() {
        assert!(name_similarity("Zomato", "Flipkart") < 0.2);
        assert!(name_similarity("Amazon", "Amazon Pay Later") < 0.8);
    }

    #[test]
    fn test_dice_coefficient() {
        // "night" / "nacht": one shared bigram ("ht") out of 4 + 4
        assert!((name_similarity("night", "nacht") - 0.25).abs() < 1e-9);
        assert_eq!(name_similarity("a", "b"), 0.0);
    }

    #[test]
    fn test_suffix_only_names_still_compare() {
        assert_eq!(name_similarity("Ltd", "LTD"), 1.0);
    }

    #[test]
    fn test_same_merchant_id_is_identical() {
        let m = Merchant {
            id: 7,
            name: "BigBasket".into(),
            normalized_key: "bigbasket".into(),
            created_at: Utc::now(),
        };
        let mut other = m.clone();
        other.name = "BB".into();
        assert_eq!(merchant_similarity(&m, &other), 1.0);
    }
}
