//! Merchant operations

use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::{format_datetime, parse_datetime, Database};
use crate::error::{Error, Result};
use crate::merchant::MerchantCandidate;
use crate::models::Merchant;

const MERCHANT_COLUMNS: &str = "id, name, normalized_key, created_at";

impl Database {
    /// Find the stored merchant for a candidate, creating it on first sight
    ///
    /// Lookup and insert run in one IMMEDIATE transaction. If a concurrent
    /// writer still wins the race, the UNIQUE violation is answered by
    /// re-reading the row it created.
    pub fn resolve_merchant(&self, candidate: &MerchantCandidate) -> Result<Merchant> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) =
            find_merchant_with(&tx, &candidate.normalized_key, &candidate.display_name)?
        {
            tx.commit()?;
            return Ok(existing);
        }

        let now = Utc::now();
        let inserted = tx.execute(
            "INSERT INTO merchants (name, normalized_key, created_at) VALUES (?, ?, ?)",
            params![
                candidate.display_name,
                candidate.normalized_key,
                format_datetime(now)
            ],
        );

        match inserted {
            Ok(_) => {
                let id = tx.last_insert_rowid();
                tx.commit()?;
                debug!(merchant_id = id, key = %candidate.normalized_key, "Created merchant");
                Ok(Merchant {
                    id,
                    name: candidate.display_name.clone(),
                    normalized_key: candidate.normalized_key.clone(),
                    created_at: now,
                })
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                drop(tx);
                self.find_merchant(&candidate.normalized_key, &candidate.display_name)?
                    .ok_or_else(|| Error::NotFound(format!("merchant {}", candidate.normalized_key)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a merchant by normalized key or case-insensitive display name
    pub fn find_merchant(&self, normalized_key: &str, display_name: &str) -> Result<Option<Merchant>> {
        let conn = self.conn()?;
        find_merchant_with(&conn, normalized_key, display_name)
    }

    /// Get a merchant by ID
    pub fn get_merchant(&self, id: i64) -> Result<Option<Merchant>> {
        let conn = self.conn()?;
        let merchant = conn
            .query_row(
                &format!("SELECT {} FROM merchants WHERE id = ?", MERCHANT_COLUMNS),
                params![id],
                row_to_merchant,
            )
            .optional()?;
        Ok(merchant)
    }

    /// Count stored merchants
    pub fn count_merchants(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM merchants", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn find_merchant_with(
    conn: &Connection,
    normalized_key: &str,
    display_name: &str,
) -> Result<Option<Merchant>> {
    // Prefer the key match when both exist
    let merchant = conn
        .query_row(
            &format!(
                "SELECT {} FROM merchants
                 WHERE normalized_key = ?1 OR name = ?2 COLLATE NOCASE
                 ORDER BY (normalized_key = ?1) DESC, id
                 LIMIT 1",
                MERCHANT_COLUMNS
            ),
            params![normalized_key, display_name],
            row_to_merchant,
        )
        .optional()?;
    Ok(merchant)
}

pub(crate) fn row_to_merchant(row: &rusqlite::Row) -> rusqlite::Result<Merchant> {
    let created_at: String = row.get(3)?;
    Ok(Merchant {
        id: row.get(0)?,
        name: row.get(1)?,
        normalized_key: row.get(2)?,
        created_at: parse_datetime(&created_at),
    })
}
