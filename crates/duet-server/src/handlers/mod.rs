//! HTTP request handlers organized by domain
//!
//! Each submodule contains handlers for a specific API area.

pub mod health;
pub mod jobs;
pub mod submissions;
pub mod transactions;

// Re-export all handlers for use in router
pub use health::*;
pub use jobs::*;
pub use submissions::*;
pub use transactions::*;
