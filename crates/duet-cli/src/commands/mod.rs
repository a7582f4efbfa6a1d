//! CLI command implementations
//!
//! Commands are organized by domain:
//! - `core` - init, status and the shared `open_db`
//! - `ingest` - submit a notification
//! - `jobs` - enrichment worker and queue listing
//! - `serve` - web server command
//! - `transactions` - transaction listing

pub mod core;
pub mod ingest;
pub mod jobs;
pub mod serve;
pub mod transactions;

// Re-export command functions for main.rs
pub use core::*;
pub use ingest::*;
pub use jobs::*;
pub use serve::*;
pub use transactions::*;

/// Truncate a string to a maximum length, adding "..." if truncated
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
