//! Field extraction from notification text
//!
//! Pulls the amount, money direction and payment mode out of free text. Slow
//! channel notifications additionally yield product names, gathered in
//! layers: labeled lines ("Items: ..."), inline order phrases ("order for X
//! and Y is confirmed"), "worth" phrasing and numbered lists.
//!
//! A missing or non-positive amount rejects the whole notification; nothing
//! else extracted from it is used.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{ChannelEvent, PaymentMode, TransactionDirection};

/// Amount layouts the extractor understands, shown to callers on failure
pub const ACCEPTED_AMOUNT_FORMATS: &[&str] = &["INR 1,234.56", "Rs.599.00", "₹250"];

/// Amounts above this with no direction cue are assumed to be debits
const LARGE_AMOUNT_DEBIT_THRESHOLD: i64 = 100_000;

/// Lines at least this long are prose, not list entries
const MAX_LIST_LINE_LEN: usize = 100;

static AMOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:₹|\b(?:INR|Rs))\.?\s*(\d{1,3}(?:,\d{2,3})+(?:\.\d{1,2})?|\d+(?:\.\d{1,2})?)")
        .expect("valid regex")
});

static DEBIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)debited|purchased?|\bspent\b|\bcharged\b|payment (?:to|of)|sent to|\bpaid\b|withdrawal|\bdr\b",
    )
    .expect("valid regex")
});

static CREDIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)credited|received|refund|deposit|money added|cashback|reward|reversed|\bcr\b|interest earned",
    )
    .expect("valid regex")
});

static UPI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bupi\b|\bvpa\b|\bqr\b").expect("valid regex"));

/// `name@bank` handles; a trailing `.tld` means it is an email address instead
static HANDLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[\w.\-]+@([a-z0-9]+)(\.[a-z]{2,})?").expect("valid regex")
});

static MODE_PATTERNS: LazyLock<Vec<(PaymentMode, Regex)>> = LazyLock::new(|| {
    [
        (
            PaymentMode::CreditCard,
            r"(?i)credit card|\bcc\b|\bvisa\b|mastercard",
        ),
        (PaymentMode::DebitCard, r"(?i)debit card|\bdc\b|atm card"),
        (
            PaymentMode::Netbanking,
            r"(?i)net[ -]?banking|\bimps\b|\bneft\b|\brtgs\b",
        ),
        (
            PaymentMode::Wallet,
            r"(?i)wallet|paytm|amazon pay|phonepe|mobi?kwik",
        ),
        (PaymentMode::Cash, r"(?i)\bcash\b|\bcod\b"),
        (PaymentMode::Emi, r"(?i)\bemi\b|equated monthly"),
        (PaymentMode::Loan, r"(?i)\bloan\b|repayment"),
    ]
    .into_iter()
    .map(|(mode, pattern)| (mode, Regex::new(pattern).expect("valid regex")))
    .collect()
});

static MASKED_CARD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)card\s*(?:no\.?\s*)?[x*]+\d{4}").expect("valid regex"));

static MASKED_ACCOUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)a/?c(?:ct)?\s*(?:no\.?\s*)?[x*]+\d{4}").expect("valid regex"));

static LABELED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:items?|products?)\s*[:\-]\s*(.+?)\s*(?:\.\s|\.$|expected|delivered|$)")
        .expect("valid regex")
});

static INLINE_ORDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)order\s+(?:for|of)\s+([\w\s,.\-&]+?)\s+(?:is\s+|has\s+been\s+)?(?:confirmed|placed|dispatched)",
    )
    .expect("valid regex")
});

static WORTH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)order\s+(?:for|of)\s+(.+?)\s+worth\s+").expect("valid regex"));

static NUMBERED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+[.)]\s+(.+)$").expect("valid regex"));

static LIST_SPLIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i),|\s+and\s+").expect("valid regex"));

/// Why an amount could not be extracted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("Could not extract a valid amount")]
    Missing,

    #[error("Amount must be greater than zero (parsed '{0}')")]
    NotPositive(String),

    #[error("Amount '{0}' is too large to represent")]
    OutOfRange(String),
}

impl AmountError {
    pub fn accepted_formats(&self) -> &'static [&'static str] {
        ACCEPTED_AMOUNT_FORMATS
    }
}

/// Everything pulled out of one notification
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedFields {
    pub amount: Decimal,
    pub direction: TransactionDirection,
    pub payment_mode: PaymentMode,
    /// Always empty for the fast channel
    pub product_names: Vec<String>,
}

impl ExtractedFields {
    /// Product names as stored on metadata
    pub fn product_details(&self) -> Option<String> {
        if self.product_names.is_empty() {
            None
        } else {
            Some(self.product_names.join(", "))
        }
    }
}

/// Extract all fields for a notification
pub fn extract_fields(event: &ChannelEvent) -> Result<ExtractedFields, AmountError> {
    let text = event.raw_text();
    let amount = extract_amount(text)?;

    let product_names = match event {
        ChannelEvent::Fast(_) => Vec::new(),
        ChannelEvent::Slow(e) => extract_product_names(&e.raw_text),
    };

    Ok(ExtractedFields {
        amount,
        direction: extract_direction(text, Some(amount)),
        payment_mode: extract_payment_mode(text),
        product_names,
    })
}

/// Extract the first currency-marked amount
pub fn extract_amount(text: &str) -> Result<Decimal, AmountError> {
    let raw = AMOUNT_RE
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .ok_or(AmountError::Missing)?;

    let amount = Decimal::from_str(&raw.replace(',', ""))
        .map_err(|_| AmountError::OutOfRange(raw.to_string()))?;

    if amount <= Decimal::ZERO {
        return Err(AmountError::NotPositive(raw.to_string()));
    }

    Ok(amount.normalize())
}

/// Classify direction by keyword cues; debit cues win over credit cues
pub fn extract_direction(text: &str, amount: Option<Decimal>) -> TransactionDirection {
    if DEBIT_RE.is_match(text) {
        return TransactionDirection::Debit;
    }
    if CREDIT_RE.is_match(text) {
        return TransactionDirection::Credit;
    }

    match amount {
        Some(a) if a > Decimal::from(LARGE_AMOUNT_DEBIT_THRESHOLD) => TransactionDirection::Debit,
        _ => TransactionDirection::Unknown,
    }
}

/// Classify the payment rail; UPI is checked first
pub fn extract_payment_mode(text: &str) -> PaymentMode {
    if is_upi(text) {
        return PaymentMode::Upi;
    }

    for (mode, re) in MODE_PATTERNS.iter() {
        if re.is_match(text) {
            return *mode;
        }
    }

    if MASKED_CARD_RE.is_match(text) {
        return PaymentMode::CreditCard;
    }
    if MASKED_ACCOUNT_RE.is_match(text) {
        return PaymentMode::Netbanking;
    }

    PaymentMode::Unknown
}

fn is_upi(text: &str) -> bool {
    if UPI_RE.is_match(text) {
        return true;
    }
    HANDLE_RE
        .captures_iter(text)
        .any(|c| c.get(2).is_none())
}

/// Extract product names from a slow-channel notification
///
/// Results keep first-seen order with duplicates removed.
pub fn extract_product_names(text: &str) -> Vec<String> {
    let mut names = Vec::new();

    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.len() >= MAX_LIST_LINE_LEN {
            continue;
        }
        if let Some(c) = NUMBERED_RE.captures(line) {
            push_item(&mut names, &c[1]);
        }
    }

    for line in text.lines().map(str::trim) {
        if let Some(c) = LABELED_RE.captures(line) {
            names.extend(split_list(&c[1]));
        }
    }

    if let Some(c) = INLINE_ORDER_RE.captures(text) {
        names.extend(split_list(&c[1]));
    }

    if let Some(c) = WORTH_RE.captures(text) {
        names.extend(split_list(&c[1]));
    }

    let mut seen = HashSet::new();
    names.retain(|n| seen.insert(n.clone()));
    names
}

fn push_item(names: &mut Vec<String>, raw: &str) {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = cleaned.trim_end_matches('.').trim();
    if cleaned.chars().count() > 2 {
        names.push(cleaned.to_string());
    }
}

fn split_list(raw: &str) -> Vec<String> {
    let mut out = Vec::new();
    for part in LIST_SPLIT_RE.split(raw) {
        push_item(&mut out, part);
    }
    out
}
