//! Transaction categorization
//!
//! # Configuration
//!
//! - `ML_SERVICE_URL`: HTTP categorization endpoint (`POST` with
//!   `{"text": ...}`, answering `{"category": ...}`). When unset or failing,
//!   a keyword map is used.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CollaboratorError;

/// Label for text no rule recognizes
pub const UNCATEGORIZED: &str = "Uncategorized";

/// Request timeout for the HTTP categorizer
const CATEGORIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Merchant keywords and their category, checked in order
const CATEGORY_KEYWORDS: &[(&str, &str)] = &[
    ("swiggy", "Food & Dining"),
    ("zomato", "Food & Dining"),
    ("dominos", "Food & Dining"),
    ("pizzahut", "Food & Dining"),
    ("amazon", "Shopping"),
    ("flipkart", "Shopping"),
    ("nykaa", "Shopping"),
    ("tatacliq", "Shopping"),
    ("ola", "Transport"),
    ("uber", "Transport"),
    ("rapido", "Transport"),
    ("indriver", "Transport"),
    ("airtel", "Utilities"),
    ("jio", "Utilities"),
    ("bsnl", "Utilities"),
    ("tatapower", "Utilities"),
    ("bigbasket", "Groceries"),
    ("blinkit", "Groceries"),
    ("dmart", "Groceries"),
    ("spencers", "Groceries"),
    ("makemytrip", "Travel"),
    ("goibibo", "Travel"),
    ("easemytrip", "Travel"),
    ("irctc", "Travel"),
    ("myntra", "Clothing"),
    ("ajio", "Clothing"),
    ("hm", "Clothing"),
    ("zara", "Clothing"),
    ("apollo", "Healthcare"),
    ("pharmeasy", "Healthcare"),
    ("netmeds", "Healthcare"),
    ("practo", "Healthcare"),
    ("iocl", "Fuel"),
    ("hpcl", "Fuel"),
    ("bpcl", "Fuel"),
    ("shell", "Fuel"),
    ("lic", "Insurance"),
    ("bajajallianz", "Insurance"),
    ("hdfcergo", "Insurance"),
    ("icicipru", "Insurance"),
    ("zerodha", "Investments"),
    ("groww", "Investments"),
    ("upstox", "Investments"),
    ("kuvera", "Investments"),
    ("nobroker", "Rent"),
    ("housing", "Rent"),
    ("magicbricks", "Rent"),
    ("nestaway", "Rent"),
    ("byjus", "Education"),
    ("unacademy", "Education"),
    ("upgrad", "Education"),
    ("coursera", "Education"),
];

/// Assigns a category label from merchant and product text
#[async_trait]
pub trait Categorizer: Send + Sync {
    async fn categorize(
        &self,
        merchant: &str,
        products: Option<&str>,
    ) -> Result<String, CollaboratorError>;
}

/// The text a categorizer sees: merchant name, then products if any
pub fn categorization_text(merchant: &str, products: Option<&str>) -> String {
    match products {
        Some(p) if !p.trim().is_empty() => format!("{} {}", merchant, p),
        _ => merchant.to_string(),
    }
}

/// Keyword lookup over merchant and product text
///
/// Keywords are matched against whole words, so "ola" does not fire on
/// "Motorola" and "hm" does not fire on "Rahman".
#[derive(Clone, Default)]
pub struct KeywordCategorizer;

impl KeywordCategorizer {
    pub fn lookup(&self, text: &str) -> &'static str {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        CATEGORY_KEYWORDS
            .iter()
            .find(|(keyword, _)| words.contains(keyword))
            .map(|(_, category)| *category)
            .unwrap_or(UNCATEGORIZED)
    }
}

#[async_trait]
impl Categorizer for KeywordCategorizer {
    async fn categorize(
        &self,
        merchant: &str,
        products: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        Ok(self
            .lookup(&categorization_text(merchant, products))
            .to_string())
    }
}

#[derive(Debug, Serialize)]
struct CategorizeRequest<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct CategorizeResponse {
    category: Option<String>,
}

/// HTTP categorization service with keyword fallback
#[derive(Clone)]
pub struct HttpCategorizer {
    http_client: Client,
    url: String,
    fallback: KeywordCategorizer,
}

impl HttpCategorizer {
    pub fn new(url: &str) -> Self {
        let http_client = Client::builder()
            .timeout(CATEGORIZE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            http_client,
            url: url.to_string(),
            fallback: KeywordCategorizer,
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("ML_SERVICE_URL").ok()?;
        Some(Self::new(&url))
    }

    async fn remote(&self, text: &str) -> Result<String, CollaboratorError> {
        let response = self
            .http_client
            .post(&self.url)
            .json(&CategorizeRequest { text })
            .send()
            .await?
            .error_for_status()?;
        let body: CategorizeResponse = response.json().await?;
        Ok(body
            .category
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| UNCATEGORIZED.to_string()))
    }
}

#[async_trait]
impl Categorizer for HttpCategorizer {
    async fn categorize(
        &self,
        merchant: &str,
        products: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        let text = categorization_text(merchant, products);
        match self.remote(&text).await {
            Ok(category) => Ok(category),
            Err(e) => {
                warn!("Categorization service failed, using keyword map: {}", e);
                Ok(self.fallback.lookup(&text).to_string())
            }
        }
    }
}

/// Categorizer selected from the environment
#[derive(Clone)]
pub enum CategorizerClient {
    Http(HttpCategorizer),
    Keyword(KeywordCategorizer),
}

impl CategorizerClient {
    pub fn from_env() -> Self {
        match HttpCategorizer::from_env() {
            Some(http) => Self::Http(http),
            None => Self::Keyword(KeywordCategorizer),
        }
    }
}

#[async_trait]
impl Categorizer for CategorizerClient {
    async fn categorize(
        &self,
        merchant: &str,
        products: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        match self {
            Self::Http(c) => c.categorize(merchant, products).await,
            Self::Keyword(c) => c.categorize(merchant, products).await,
        }
    }
}

/// Mock categorizer for testing: a fixed answer or a fixed failure
#[derive(Clone)]
pub struct MockCategorizer {
    response: Result<String, CollaboratorError>,
    calls: Arc<AtomicUsize>,
}

impl MockCategorizer {
    pub fn returning(category: &str) -> Self {
        Self {
            response: Ok(category.to_string()),
            calls: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            response: Err(CollaboratorError::retryable("categorizer unavailable")),
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Categorizer for MockCategorizer {
    async fn categorize(
        &self,
        _merchant: &str,
        _products: Option<&str>,
    ) -> Result<String, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.response.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyword_lookup() {
        let c = KeywordCategorizer;
        assert_eq!(c.lookup("SWIGGY"), "Food & Dining");
        assert_eq!(c.lookup("Order from BigBasket: Atta, Rice"), "Groceries");
        assert_eq!(c.lookup("Corner Bakery"), UNCATEGORIZED);
    }

    #[test]
    fn test_keyword_lookup_whole_words_only() {
        let c = KeywordCategorizer;
        assert_eq!(c.lookup("Motorola Store"), UNCATEGORIZED);
        assert_eq!(c.lookup("Ola Cabs"), "Transport");
    }

    #[test]
    fn test_categorization_text() {
        assert_eq!(categorization_text("ZOMATO", Some("Veg Thali")), "ZOMATO Veg Thali");
        assert_eq!(categorization_text("ZOMATO", Some("  ")), "ZOMATO");
        assert_eq!(categorization_text("ZOMATO", None), "ZOMATO");
    }

    #[tokio::test]
    async fn test_http_categorizer_falls_back_when_unreachable() {
        // Nothing listens on port 9 locally; the request fails fast
        let c = HttpCategorizer::new("http://127.0.0.1:9/categorize");
        let category = c.categorize("Myntra", None).await.unwrap();
        assert_eq!(category, "Clothing");
    }

    #[tokio::test]
    async fn test_mock_categorizer() {
        let c = MockCategorizer::failing();
        assert!(c.categorize("x", None).await.is_err());
        assert_eq!(c.calls(), 1);
    }
}
