//! Transaction operations

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use rust_decimal::Decimal;

use super::jobs::insert_or_merge_job;
use super::{format_datetime, parse_datetime, parse_decimal, parse_enum, Database};
use crate::error::{Error, Result};
use crate::models::{
    truncate_chars, Channel, JobSchedule, MatchStatus, NewJob, NewMetadata, NewTransaction,
    Transaction, MAX_RAW_TEXT_LEN, MAX_SENDER_LEN,
};

pub(crate) const TRANSACTION_COLUMNS: &str = "t.id, t.user_id, t.raw_text, t.amount, t.merchant_id, \
     t.channel, t.sender_info, t.transaction_date, t.processed, t.category, t.fingerprint, \
     t.anchor_signature, t.created_at, t.updated_at";

impl Database {
    /// Insert a transaction and its PENDING metadata in one database transaction
    ///
    /// A follow-up job, if given, is queued in the same transaction, so a
    /// record never exists without the work that finalizes it. Raw text and
    /// sender are truncated to their storage bounds.
    pub fn create_transaction_with_metadata(
        &self,
        new_tx: &NewTransaction,
        metadata: &NewMetadata,
        follow_up: Option<&JobSchedule>,
    ) -> Result<Transaction> {
        if new_tx.amount <= Decimal::ZERO {
            return Err(Error::InvalidData(format!(
                "amount must be positive, got {}",
                new_tx.amount
            )));
        }

        let raw_text = truncate_chars(&new_tx.raw_text, MAX_RAW_TEXT_LEN);
        let sender_info = new_tx
            .sender_info
            .as_deref()
            .map(|s| truncate_chars(s, MAX_SENDER_LEN));
        let now = Utc::now();
        let now_str = format_datetime(now);

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            r#"
            INSERT INTO transactions (user_id, raw_text, amount, merchant_id, channel,
                                      sender_info, transaction_date, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                new_tx.user_id,
                raw_text,
                new_tx.amount.to_string(),
                new_tx.merchant_id,
                new_tx.channel.as_str(),
                sender_info,
                format_datetime(new_tx.transaction_date),
                now_str,
                now_str,
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            r#"
            INSERT INTO transaction_metadata (transaction_id, match_status, match_expires_at,
                                              product_details, direction, payment_mode, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                id,
                MatchStatus::Pending.as_str(),
                format_datetime(metadata.match_expires_at),
                metadata.product_details,
                metadata.direction.as_str(),
                metadata.payment_mode.as_str(),
                now_str,
            ],
        )?;

        let transaction = Transaction {
            id,
            user_id: new_tx.user_id.clone(),
            raw_text,
            amount: new_tx.amount,
            merchant_id: new_tx.merchant_id,
            channel: new_tx.channel,
            sender_info,
            transaction_date: new_tx.transaction_date,
            processed: false,
            category: None,
            fingerprint: None,
            anchor_signature: None,
            created_at: now,
            updated_at: now,
        };

        if let Some(schedule) = follow_up {
            insert_or_merge_job(&tx, &NewJob::for_transaction(&transaction, schedule))?;
        }

        tx.commit()?;
        Ok(transaction)
    }

    /// Get a single transaction by ID
    pub fn get_transaction(&self, id: i64) -> Result<Option<Transaction>> {
        let conn = self.conn()?;
        let transaction = conn
            .query_row(
                &format!("SELECT {} FROM transactions t WHERE t.id = ?", TRANSACTION_COLUMNS),
                params![id],
                row_to_transaction,
            )
            .optional()?;
        Ok(transaction)
    }

    /// List the most recent transactions, optionally for one user
    ///
    /// Records absorbed into another record by a late match are left out.
    pub fn list_transactions(&self, user_id: Option<&str>, limit: i64) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM transactions t
            LEFT JOIN transaction_metadata m ON m.transaction_id = t.id
            WHERE (?1 IS NULL OR t.user_id = ?1) AND m.absorbed_into IS NULL
            ORDER BY t.transaction_date DESC, t.id DESC
            LIMIT ?2
            "#,
            TRANSACTION_COLUMNS
        ))?;

        let transactions = stmt
            .query_map(params![user_id, limit], row_to_transaction)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(transactions)
    }

    /// Count transactions, not counting absorbed records
    pub fn count_transactions(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            r#"
            SELECT COUNT(*) FROM transactions t
            LEFT JOIN transaction_metadata m ON m.transaction_id = t.id
            WHERE m.absorbed_into IS NULL
            "#,
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Count non-absorbed transactions by processed flag:
    /// (processed, unprocessed)
    pub fn count_processed(&self) -> Result<(i64, i64)> {
        let conn = self.conn()?;
        let counts = conn.query_row(
            r#"
            SELECT COALESCE(SUM(t.processed), 0), COALESCE(SUM(1 - t.processed), 0)
            FROM transactions t
            LEFT JOIN transaction_metadata m ON m.transaction_id = t.id
            WHERE m.absorbed_into IS NULL
            "#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(counts)
    }

    /// Same-user, same-merchant, same-channel records in a time range whose
    /// amount lies within `[min_amount, max_amount]`
    ///
    /// The time range is inclusive at both ends.
    #[allow(clippy::too_many_arguments)]
    pub fn find_similar_transactions(
        &self,
        user_id: &str,
        merchant_id: i64,
        channel: Channel,
        min_amount: Decimal,
        max_amount: Decimal,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            r#"
            SELECT {} FROM transactions t
            WHERE t.user_id = ? AND t.merchant_id = ? AND t.channel = ?
              AND t.transaction_date >= ? AND t.transaction_date <= ?
            ORDER BY t.transaction_date DESC, t.id DESC
            "#,
            TRANSACTION_COLUMNS
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
                row_to_transaction,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        // Amounts are decimal text, so the range check happens here
        Ok(rows
            .into_iter()
            .filter(|t| t.amount >= min_amount && t.amount <= max_amount)
            .collect())
    }

    /// Record enrichment results and set `processed`
    ///
    /// Returns false when the transaction was already processed or has been
    /// absorbed into another record; nothing is written in that case.
    pub fn complete_enrichment(
        &self,
        id: i64,
        fingerprint: &str,
        anchor_signature: &str,
        category: Option<&str>,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            r#"
            UPDATE transactions
            SET fingerprint = ?, anchor_signature = ?, category = ?, processed = 1, updated_at = ?
            WHERE id = ? AND processed = 0
              AND NOT EXISTS (
                  SELECT 1 FROM transaction_metadata m
                  WHERE m.transaction_id = transactions.id AND m.absorbed_into IS NOT NULL
              )
            "#,
            params![
                fingerprint,
                anchor_signature,
                category,
                format_datetime(Utc::now()),
                id
            ],
        )?;
        Ok(updated == 1)
    }
}

pub(crate) fn row_to_transaction(row: &rusqlite::Row) -> rusqlite::Result<Transaction> {
    let amount_str: String = row.get(3)?;
    let channel_str: String = row.get(5)?;
    let date_str: String = row.get(7)?;
    let processed: i64 = row.get(8)?;
    let created_at_str: String = row.get(12)?;
    let updated_at_str: String = row.get(13)?;
    Ok(Transaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        raw_text: row.get(2)?,
        amount: parse_decimal(3, &amount_str)?,
        merchant_id: row.get(4)?,
        channel: parse_enum(5, &channel_str)?,
        sender_info: row.get(6)?,
        transaction_date: parse_datetime(&date_str),
        processed: processed != 0,
        category: row.get(9)?,
        fingerprint: row.get(10)?,
        anchor_signature: row.get(11)?,
        created_at: parse_datetime(&created_at_str),
        updated_at: parse_datetime(&updated_at_str),
    })
}
