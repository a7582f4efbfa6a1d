//! Merchant identity resolution
//!
//! A notification names its counterparty in free text ("paid to ZOMATO",
//! "purchase at swiggy.in") or only through its sender ("orders@swiggy.in").
//! Both routes produce a [`MerchantCandidate`]; the resolver then reuses the
//! stored merchant with that key or creates it.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::db::Database;
use crate::error::Result;
use crate::models::{truncate_chars, Merchant, MAX_MERCHANT_NAME_LEN};

/// Normalized keys are capped at this many characters
pub const MAX_NORMALIZED_KEY_LEN: usize = 64;

/// Normalized keys shorter than this are unusable
const MIN_NORMALIZED_KEY_LEN: usize = 3;

/// Tokens that the text patterns can pick up but never name a merchant
const NON_MERCHANT_TOKENS: &[&str] = &["inr", "rs", "your", "the", "account", "acct"];

/// Sender short codes and domains mapped to their canonical brand
const SENDER_ALIASES: &[(&str, &str)] = &[
    ("ZOMATO", "ZOMATO"),
    ("ZMT", "ZOMATO"),
    ("SWIGGY", "SWIGGY"),
    ("SWGY", "SWIGGY"),
    ("FLIPKART", "FLIPKART"),
    ("AMAZON", "AMAZON"),
    ("BIGBASKET", "BIGBASKET"),
];

/// Tried in order; the first usable capture wins
static TEXT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\b(?:paid to|payment to|to)\s+([A-Z0-9*]+)",
        r"(?i)\bvia\s+upi\s+to\s+([A-Z0-9*]+)",
        r"(?i)\bfor\s+(SWIGGY|ZOMATO|AMAZON|FLIPKART|BIGBASKET)\b",
        r"(?i)\border\s+(?:from|with)\s+([A-Z0-9*]+)",
        r"(?i)\bat\s+([a-z0-9]+(?:\.[a-z]{2,6})?)\b",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

static WILDCARD_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\*.*$").expect("valid regex"));

static SENDER_DOMAIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)@?([a-z0-9-]+)\.").expect("valid regex"));

/// Operator/region header on SMS sender ids, e.g. `VM-` in `VM-ZMT`
static SMS_HEADER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z]{2}-").expect("valid regex"));

static SEPARATOR_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

/// A merchant name pulled from a notification, not yet resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerchantCandidate {
    /// Name as written, bounded for storage
    pub display_name: String,
    pub normalized_key: String,
}

impl MerchantCandidate {
    pub fn new(display_name: &str) -> Option<Self> {
        let display_name = display_name.trim();
        let normalized_key = normalize_merchant(display_name)?;
        Some(Self {
            display_name: truncate_chars(display_name, MAX_MERCHANT_NAME_LEN),
            normalized_key,
        })
    }
}

/// Normalize a merchant name into its lookup key
///
/// Lowercases, drops `*`, turns every other non-alphanumeric run into a
/// single `-`, trims separators and caps the length. Returns `None` when
/// fewer than three characters remain. Applying it to its own output is a
/// no-op.
pub fn normalize_merchant(name: &str) -> Option<String> {
    let lowered = name.trim().to_lowercase().replace('*', "");
    let dashed = SEPARATOR_RUN_RE.replace_all(&lowered, "-");
    let trimmed = dashed.trim_matches('-');

    if trimmed.len() < MIN_NORMALIZED_KEY_LEN {
        return None;
    }

    // Keys are ASCII at this point, so byte slicing is safe
    let capped = &trimmed[..trimmed.len().min(MAX_NORMALIZED_KEY_LEN)];
    let capped = capped.trim_end_matches('-');

    if capped.len() < MIN_NORMALIZED_KEY_LEN {
        return None;
    }
    Some(capped.to_string())
}

/// Find a merchant mention in text, falling back to the sender identity
pub fn extract_merchant(raw_text: &str, sender: Option<&str>) -> Option<MerchantCandidate> {
    if let Some(candidate) = merchant_from_text(raw_text) {
        return Some(candidate);
    }
    sender.and_then(merchant_from_sender)
}

fn merchant_from_text(raw_text: &str) -> Option<MerchantCandidate> {
    for pattern in TEXT_PATTERNS.iter() {
        let Some(captured) = pattern.captures(raw_text).and_then(|c| c.get(1)) else {
            continue;
        };

        let name = WILDCARD_SUFFIX_RE.replace(captured.as_str(), "");
        let Some(candidate) = MerchantCandidate::new(&name) else {
            continue;
        };

        if NON_MERCHANT_TOKENS.contains(&candidate.normalized_key.as_str()) {
            continue;
        }
        return Some(candidate);
    }
    None
}

fn merchant_from_sender(sender: &str) -> Option<MerchantCandidate> {
    let token = match SENDER_DOMAIN_RE.captures(sender).and_then(|c| c.get(1)) {
        Some(domain) => domain.as_str(),
        None => {
            let sender = sender.trim();
            SMS_HEADER_RE
                .find(sender)
                .map(|m| &sender[m.end()..])
                .unwrap_or(sender)
        }
    };

    let cleaned: String = token
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_uppercase();

    let canonical = SENDER_ALIASES
        .iter()
        .find(|(alias, _)| *alias == cleaned)
        .map(|(_, brand)| *brand)
        .unwrap_or(cleaned.as_str());

    MerchantCandidate::new(canonical)
}

/// Resolves merchant mentions to stored merchants
pub struct MerchantResolver<'a> {
    db: &'a Database,
}

impl<'a> MerchantResolver<'a> {
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Resolve the merchant named by a notification
    ///
    /// `Ok(None)` means no usable merchant could be found in the text or the
    /// sender.
    pub fn resolve(&self, raw_text: &str, sender: Option<&str>) -> Result<Option<Merchant>> {
        let Some(candidate) = extract_merchant(raw_text, sender) else {
            return Ok(None);
        };

        let merchant = self.db.resolve_merchant(&candidate)?;
        debug!(
            merchant_id = merchant.id,
            key = %merchant.normalized_key,
            "Resolved merchant"
        );
        Ok(Some(merchant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize_merchant("ZOMATO LTD").as_deref(), Some("zomato-ltd"));
        assert_eq!(normalize_merchant("  Amazon.in  ").as_deref(), Some("amazon-in"));
        assert_eq!(normalize_merchant("SWIGGY*ORDER").as_deref(), Some("swiggyorder"));
        assert_eq!(normalize_merchant("--Big  Basket!!").as_deref(), Some("big-basket"));
    }

    #[test]
    fn test_normalize_rejects_short() {
        assert_eq!(normalize_merchant("ab"), None);
        assert_eq!(normalize_merchant("a-b"), Some("a-b".to_string()));
        assert_eq!(normalize_merchant("**"), None);
        assert_eq!(normalize_merchant(""), None);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let long = "x-".repeat(40);
        let inputs = [
            "ZOMATO LTD",
            "Swiggy Instamart",
            "amazon.in",
            "Reliance  Fresh -- Koramangala",
            "ÜBER Eats",
            long.as_str(),
        ];
        for input in inputs {
            if let Some(once) = normalize_merchant(input) {
                assert_eq!(normalize_merchant(&once).as_deref(), Some(once.as_str()));
                assert!(once.len() <= MAX_NORMALIZED_KEY_LEN);
            }
        }
    }

    #[test]
    fn test_extract_paid_to() {
        let c = extract_merchant("Rs.250.00 paid to ZOMATO on 12-03", None).unwrap();
        assert_eq!(c.display_name, "ZOMATO");
        assert_eq!(c.normalized_key, "zomato");
    }

    #[test]
    fn test_extract_strips_wildcard_suffix() {
        let c = extract_merchant("INR 99 paid to PAYU*SWIGGY via card", None).unwrap();
        assert_eq!(c.normalized_key, "payu");
    }

    #[test]
    fn test_extract_at_pattern() {
        let c = extract_merchant("Rs.500 debited for purchase at SWIGGY", None).unwrap();
        assert_eq!(c.normalized_key, "swiggy");

        let c = extract_merchant("Spent INR 1,200 at amazon.in today", None).unwrap();
        assert_eq!(c.normalized_key, "amazon-in");
    }

    #[test]
    fn test_extract_brand_literal() {
        let c = extract_merchant("Rs.320 charged for Zomato order", None).unwrap();
        assert_eq!(c.normalized_key, "zomato");
    }

    #[test]
    fn test_extract_skips_non_merchant_tokens() {
        // "to Rs" and "to your" are not merchants; the sender decides
        let c = extract_merchant(
            "Rs.50 credited to your account",
            Some("alerts@hdfcbank.net"),
        )
        .unwrap();
        assert_eq!(c.normalized_key, "hdfcbank");
    }

    #[test]
    fn test_extract_does_not_split_words() {
        // "to" inside "Zomato" must not start a match
        let c = extract_merchant("Rs.250 debited at Zomato on 12-03", None).unwrap();
        assert_eq!(c.normalized_key, "zomato");
    }

    #[test]
    fn test_sender_alias_fallback() {
        let c = extract_merchant("Your order is confirmed. Rs.500", Some("noreply@swiggy.in")).unwrap();
        assert_eq!(c.display_name, "SWIGGY");

        let c = extract_merchant("Rs.410 deducted", Some("VM-ZMT")).unwrap();
        assert_eq!(c.normalized_key, "zomato");

        let c = extract_merchant("Rs.410 deducted", Some("orders@myntra.com")).unwrap();
        assert_eq!(c.display_name, "MYNTRA");
    }

    #[test]
    fn test_no_merchant_anywhere() {
        assert_eq!(extract_merchant("Rs.410 deducted", None), None);
        assert_eq!(extract_merchant("Rs.410 deducted", Some("@x.")), None);
    }

    #[test]
    fn test_resolver_reuses_existing_merchant() {
        let db = Database::in_memory().unwrap();
        let resolver = MerchantResolver::new(&db);

        let first = resolver
            .resolve("Rs.250 paid to ZOMATO", None)
            .unwrap()
            .unwrap();
        let second = resolver
            .resolve("Order from zomato delivered. Rs.100", None)
            .unwrap()
            .unwrap();
        assert_eq!(first.id, second.id);

        assert!(resolver.resolve("Rs.410 deducted", None).unwrap().is_none());
    }
}
