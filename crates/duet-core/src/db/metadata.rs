//! Match state operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;

use super::transactions::{row_to_transaction, TRANSACTION_COLUMNS};
use super::{format_datetime, parse_datetime, parse_decimal, parse_enum, Database};
use crate::error::Result;
use crate::models::{
    AbsorbedSubmission, Channel, MatchEnrichment, MatchStatus, Merchant, NewAbsorbedSubmission,
    Transaction, TransactionMetadata,
};

const ABSORBED_COLUMNS: &str = "id, transaction_id, user_id, merchant_id, channel, amount, \
                                raw_text, observed_at, created_at";

/// A PENDING record that may describe the same purchase as a new submission
#[derive(Debug, Clone)]
pub struct PendingCandidate {
    pub transaction: Transaction,
    pub merchant: Merchant,
}

impl Database {
    /// Get the metadata row for a transaction
    pub fn get_metadata(&self, transaction_id: i64) -> Result<Option<TransactionMetadata>> {
        let conn = self.conn()?;
        let metadata = conn
            .query_row(
                r#"
                SELECT transaction_id, match_status, match_expires_at, product_details,
                       direction, payment_mode, updated_at, absorbed_into
                FROM transaction_metadata WHERE transaction_id = ?
                "#,
                params![transaction_id],
                row_to_metadata,
            )
            .optional()?;
        Ok(metadata)
    }

    /// Unexpired PENDING records of one user and channel inside a time and
    /// amount range (both inclusive)
    ///
    /// Results are ordered by creation (id), which is the order the
    /// first-over-threshold selection walks them in.
    #[allow(clippy::too_many_arguments)]
    pub fn find_pending_candidates(
        &self,
        user_id: &str,
        channel: Channel,
        min_amount: Decimal,
        max_amount: Decimal,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingCandidate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {}, mc.id, mc.name, mc.normalized_key, mc.created_at
            FROM transactions t
            JOIN transaction_metadata m ON m.transaction_id = t.id
            JOIN merchants mc ON mc.id = t.merchant_id
            WHERE t.user_id = ? AND t.channel = ?
              AND t.transaction_date >= ? AND t.transaction_date <= ?
              AND m.match_status = 'PENDING' AND m.match_expires_at > ?
            ORDER BY t.id
            "#,
            TRANSACTION_COLUMNS
        ))?;

        let rows = stmt
            .query_map(
                params![
                    user_id,
                    channel.as_str(),
                    format_datetime(from),
                    format_datetime(to),
                    format_datetime(now)
                ],
                |row| {
                    let created_at: String = row.get(17)?;
                    Ok(PendingCandidate {
                        transaction: row_to_transaction(row)?,
                        merchant: Merchant {
                            id: row.get(14)?,
                            name: row.get(15)?,
                            normalized_key: row.get(16)?,
                            created_at: parse_datetime(&created_at),
                        },
                    })
                },
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter(|c| c.transaction.amount >= min_amount && c.transaction.amount <= max_amount)
            .collect())
    }

    /// Atomically move a PENDING, unexpired record to MATCHED and merge in
    /// the matching submission's fields
    ///
    /// Returns false if the record was already claimed or has expired.
    pub fn claim_match(
        &self,
        transaction_id: i64,
        enrichment: &MatchEnrichment,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        claim_with(&conn, transaction_id, enrichment, now)
    }

    /// Claim a record for a matching submission and keep the submission
    /// as absorbed into it, in one database transaction
    ///
    /// Returns false, recording nothing, if the record was already claimed
    /// or has expired.
    pub fn claim_and_absorb(
        &self,
        transaction_id: i64,
        enrichment: &MatchEnrichment,
        submission: &NewAbsorbedSubmission,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !claim_with(&tx, transaction_id, enrichment, now)? {
            return Ok(false);
        }

        tx.execute(
            r#"
            INSERT INTO absorbed_submissions
                (transaction_id, user_id, merchant_id, channel, amount, raw_text, observed_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                transaction_id,
                submission.user_id,
                submission.merchant_id,
                submission.channel.as_str(),
                submission.amount.to_string(),
                submission.raw_text,
                format_datetime(submission.observed_at),
                format_datetime(now)
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    /// Fold a late-arriving PENDING record into the earlier record it matches
    ///
    /// The earlier (canonical) record becomes MATCHED and takes the late
    /// record's fields. The late record becomes MATCHED with
    /// `absorbed_into` pointing at the canonical one, and is never enriched.
    /// Both changes happen in one database transaction; if either record is
    /// no longer PENDING and unexpired, or the late one was already
    /// enriched, nothing changes and false is returned.
    pub fn absorb_late_record(
        &self,
        canonical_id: i64,
        late_id: i64,
        late_fields: &MatchEnrichment,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !claim_with(&tx, canonical_id, late_fields, now)? {
            return Ok(false);
        }

        let absorbed = tx.execute(
            r#"
            UPDATE transaction_metadata
            SET match_status = 'MATCHED',
                match_expires_at = NULL,
                absorbed_into = ?1,
                updated_at = ?2
            WHERE transaction_id = ?3
              AND match_status = 'PENDING'
              AND match_expires_at > ?2
              AND EXISTS (SELECT 1 FROM transactions WHERE id = ?3 AND processed = 0)
            "#,
            params![canonical_id, format_datetime(now), late_id],
        )?;
        if absorbed != 1 {
            // Dropping the transaction rolls back the canonical claim
            return Ok(false);
        }

        tx.commit()?;
        Ok(true)
    }

    /// Absorbed submissions of one user, merchant and channel observed
    /// inside a time range (inclusive), newest first
    #[allow(clippy::too_many_arguments)]
    pub fn find_absorbed_submissions(
        &self,
        user_id: &str,
        merchant_id: i64,
        channel: Channel,
        min_amount: Decimal,
        max_amount: Decimal,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AbsorbedSubmission>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM absorbed_submissions
            WHERE user_id = ? AND merchant_id = ? AND channel = ?
              AND observed_at >= ? AND observed_at <= ?
            ORDER BY observed_at DESC, id DESC
            "#,
            ABSORBED_COLUMNS
        ))?;

        let rows = stmt
            .query_map(
                params![
                    user_id,
                    merchant_id,
                    channel.as_str(),
                    format_datetime(from),
                    format_datetime(to)
                ],
                row_to_absorbed,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .filter(|a| a.amount >= min_amount && a.amount <= max_amount)
            .collect())
    }

    /// Submissions that were absorbed into a record, oldest first
    pub fn list_absorbed_submissions(&self, transaction_id: i64) -> Result<Vec<AbsorbedSubmission>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM absorbed_submissions WHERE transaction_id = ? ORDER BY id",
            ABSORBED_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![transaction_id], row_to_absorbed)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Known values from the submission win; UNKNOWN and missing ones keep
/// what the record already had
fn claim_with(
    conn: &Connection,
    transaction_id: i64,
    enrichment: &MatchEnrichment,
    now: DateTime<Utc>,
) -> Result<bool> {
    let now_str = format_datetime(now);
    let updated = conn.execute(
        r#"
        UPDATE transaction_metadata
        SET match_status = 'MATCHED',
            match_expires_at = NULL,
            product_details = COALESCE(?1, product_details),
            direction = CASE WHEN ?2 = 'UNKNOWN' THEN direction ELSE ?2 END,
            payment_mode = CASE WHEN ?3 = 'UNKNOWN' THEN payment_mode ELSE ?3 END,
            updated_at = ?4
        WHERE transaction_id = ?5
          AND match_status = 'PENDING'
          AND match_expires_at > ?4
        "#,
        params![
            enrichment.product_details,
            enrichment.direction.as_str(),
            enrichment.payment_mode.as_str(),
            now_str,
            transaction_id
        ],
    )?;
    Ok(updated == 1)
}

fn row_to_metadata(row: &rusqlite::Row) -> rusqlite::Result<TransactionMetadata> {
    let status: String = row.get(1)?;
    let expires_at: Option<String> = row.get(2)?;
    let direction: String = row.get(4)?;
    let payment_mode: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(TransactionMetadata {
        transaction_id: row.get(0)?,
        match_status: parse_enum::<MatchStatus>(1, &status)?,
        match_expires_at: expires_at.as_deref().map(parse_datetime),
        product_details: row.get(3)?,
        direction: parse_enum(4, &direction)?,
        payment_mode: parse_enum(5, &payment_mode)?,
        updated_at: parse_datetime(&updated_at),
        absorbed_into: row.get(7)?,
    })
}

fn row_to_absorbed(row: &rusqlite::Row) -> rusqlite::Result<AbsorbedSubmission> {
    let channel: String = row.get(4)?;
    let amount: String = row.get(5)?;
    let observed_at: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    Ok(AbsorbedSubmission {
        id: row.get(0)?,
        transaction_id: row.get(1)?,
        user_id: row.get(2)?,
        merchant_id: row.get(3)?,
        channel: parse_enum(4, &channel)?,
        amount: parse_decimal(5, &amount)?,
        raw_text: row.get(6)?,
        observed_at: parse_datetime(&observed_at),
        created_at: parse_datetime(&created_at),
    })
}
