//! Transaction command implementations

use anyhow::Result;
use duet_core::db::Database;

use super::truncate;

pub fn cmd_transactions_list(db: &Database, user_id: Option<&str>, limit: i64) -> Result<()> {
    let transactions = db.list_transactions(user_id, limit)?;

    if transactions.is_empty() {
        println!("No transactions found. Submit one with:");
        println!("  duet submit \"Rs.500 debited at SWIGGY\" --user me");
        return Ok(());
    }

    println!();
    println!("📝 Recent Transactions");
    println!("   ─────────────────────────────────────────────────────────────");

    for tx in transactions {
        let state = if tx.processed {
            tx.category.as_deref().unwrap_or("enriched")
        } else {
            "pending"
        };

        println!(
            "   {} │ {:<4} │ ₹{:>10} │ {:<16} │ {}",
            tx.transaction_date.format("%Y-%m-%d %H:%M"),
            tx.channel.as_str(),
            tx.amount,
            truncate(state, 16),
            truncate(&tx.raw_text, 40)
        );
    }

    Ok(())
}
