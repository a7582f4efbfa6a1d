//! Integrity anchoring
//!
//! A transaction's fingerprint is handed to an anchoring service, which
//! returns a signature (a handle proving the fingerprint was recorded).
//!
//! # Configuration
//!
//! - `DUET_ANCHOR_URL`: HTTP anchoring endpoint. When unset, fingerprints are
//!   anchored locally with [`DigestAnchor`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::CollaboratorError;

/// Request timeout for the HTTP anchor
const ANCHOR_TIMEOUT: Duration = Duration::from_secs(15);

/// Records a fingerprint and returns its signature
#[async_trait]
pub trait IntegrityAnchor: Send + Sync {
    async fn anchor(&self, fingerprint: &str) -> Result<String, CollaboratorError>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

#[derive(Debug, Serialize)]
struct AnchorRequest<'a> {
    hash: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnchorResponse {
    signature: Option<String>,
}

/// Anchor backed by an HTTP service (`POST {url}` with `{"hash": ...}`)
#[derive(Clone)]
pub struct HttpAnchor {
    http_client: Client,
    url: String,
}

impl HttpAnchor {
    pub fn new(url: &str) -> Self {
        let http_client = Client::builder()
            .timeout(ANCHOR_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http_client,
            url: url.trim_end_matches('/').to_string(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("DUET_ANCHOR_URL").ok()?;
        Some(Self::new(&url))
    }
}

#[async_trait]
impl IntegrityAnchor for HttpAnchor {
    async fn anchor(&self, fingerprint: &str) -> Result<String, CollaboratorError> {
        let response = self
            .http_client
            .post(&self.url)
            .json(&AnchorRequest { hash: fingerprint })
            .send()
            .await?
            .error_for_status()?;

        let body: AnchorResponse = response.json().await?;
        body.signature
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CollaboratorError::retryable("anchor returned no signature"))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Local anchor: the signature is a domain-separated digest of the
/// fingerprint
///
/// Deterministic, so re-anchoring the same fingerprint yields the same
/// signature.
#[derive(Clone, Default)]
pub struct DigestAnchor;

#[async_trait]
impl IntegrityAnchor for DigestAnchor {
    async fn anchor(&self, fingerprint: &str) -> Result<String, CollaboratorError> {
        if fingerprint.is_empty() {
            return Err(CollaboratorError::permanent("empty fingerprint"));
        }
        let mut hasher = Sha256::new();
        hasher.update(b"duet-anchor:");
        hasher.update(fingerprint.as_bytes());
        Ok(format!("local:{}", hex::encode(hasher.finalize())))
    }

    fn name(&self) -> &'static str {
        "digest"
    }
}

/// Anchor selected from the environment
#[derive(Clone)]
pub enum AnchorClient {
    Http(HttpAnchor),
    Digest(DigestAnchor),
}

impl AnchorClient {
    pub fn from_env() -> Self {
        match HttpAnchor::from_env() {
            Some(http) => Self::Http(http),
            None => Self::Digest(DigestAnchor),
        }
    }
}

#[async_trait]
impl IntegrityAnchor for AnchorClient {
    async fn anchor(&self, fingerprint: &str) -> Result<String, CollaboratorError> {
        match self {
            Self::Http(a) => a.anchor(fingerprint).await,
            Self::Digest(a) => a.anchor(fingerprint).await,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Http(a) => a.name(),
            Self::Digest(a) => a.name(),
        }
    }
}

/// Mock anchor for testing
///
/// Counts calls and can be scripted to fail a number of times before
/// succeeding.
#[derive(Clone, Default)]
pub struct MockAnchor {
    calls: Arc<AtomicUsize>,
    failures: Arc<Mutex<VecDeque<CollaboratorError>>>,
}

impl MockAnchor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail with these errors, in order, before succeeding
    pub fn failing_with(errors: Vec<CollaboratorError>) -> Self {
        Self {
            calls: Arc::default(),
            failures: Arc::new(Mutex::new(errors.into())),
        }
    }

    /// Number of anchor calls so far (including failed ones)
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IntegrityAnchor for MockAnchor {
    async fn anchor(&self, fingerprint: &str) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let scripted = self
            .failures
            .lock()
            .map_err(|_| CollaboratorError::retryable("mock anchor poisoned"))?
            .pop_front();
        match scripted {
            Some(err) => Err(err),
            None => Ok(format!("mock:{}", &fingerprint[..fingerprint.len().min(16)])),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
