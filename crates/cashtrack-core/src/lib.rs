//! Core domain model and rate normalization for cashtrack.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cashtrack-core";

/// Reserved category key for the headline rate of a merchant page.
pub const MAIN_CATEGORY: &str = "Main";

/// Rate text recorded when no strategy found a usable rate.
pub const DEFAULT_RATE_TEXT: &str = "0%";

/// Sentinel merchant name used when neither the document nor the URL yields one.
pub const UNKNOWN_MERCHANT: &str = "Unknown Store";

/// Category labels longer than this many characters are truncated.
pub const MAX_CATEGORY_CHARS: usize = 100;

/// One per-category rate found on a merchant page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryRate {
    pub category: String,
    pub rate_text: String,
    pub rate_numeric: f64,
}

impl CategoryRate {
    /// Builds a record from raw label and rate text, truncating long labels and
    /// normalizing the rate.
    pub fn new(category: &str, rate_text: &str) -> Self {
        let rate_text = rate_text.trim().to_string();
        Self {
            category: truncate_category(category.trim()),
            rate_numeric: parse_rate(&rate_text),
            rate_text,
        }
    }
}

/// Handoff contract from the extraction pipeline into the history engine.
///
/// Contains no timestamps: capture time is assigned when the result is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub merchant_name: String,
    pub source_url: String,
    pub main_rate_text: String,
    pub main_rate_numeric: f64,
    pub upsized: bool,
    pub prior_offer: Option<String>,
    pub categories: Vec<CategoryRate>,
    pub success: bool,
    pub error: Option<String>,
}

impl ExtractionResult {
    /// A failed scrape: defaults for every rate field and the error text recorded.
    pub fn failure(
        merchant_name: impl Into<String>,
        source_url: impl Into<String>,
        error: impl std::fmt::Display,
    ) -> Self {
        Self {
            merchant_name: merchant_name.into(),
            source_url: source_url.into(),
            main_rate_text: DEFAULT_RATE_TEXT.to_string(),
            main_rate_numeric: 0.0,
            upsized: false,
            prior_offer: None,
            categories: Vec::new(),
            success: false,
            error: Some(error.to_string()),
        }
    }

    /// True when the scrape succeeded but found neither a headline rate nor
    /// any category rate.
    pub fn is_degraded(&self) -> bool {
        self.success && self.main_rate_text == DEFAULT_RATE_TEXT && self.categories.is_empty()
    }

    /// `(category, rate_text, rate_numeric)` for the headline rate followed by
    /// every category rate, in page order.
    pub fn observations(&self) -> impl Iterator<Item = (&str, &str, f64)> + '_ {
        std::iter::once::<(&str, &str, f64)>((
            MAIN_CATEGORY,
            self.main_rate_text.as_str(),
            self.main_rate_numeric,
        ))
        .chain(
            self.categories
                .iter()
                .map(|c| (c.category.as_str(), c.rate_text.as_str(), c.rate_numeric)),
        )
    }
}

/// Persisted merchant identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Merchant {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One immutable ledger entry: a single category of a single scrape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateObservation {
    pub id: i64,
    pub merchant_id: i64,
    pub merchant_name: String,
    pub merchant_url: String,
    pub main_rate_text: String,
    pub main_rate_numeric: f64,
    pub category: String,
    pub rate_text: String,
    pub rate_numeric: f64,
    pub upsized: bool,
    pub prior_offer: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

/// Running extremum record for a (merchant, category) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateStatistic {
    pub merchant_id: i64,
    pub merchant_name: String,
    pub category: String,
    pub current_rate: f64,
    pub highest_rate: f64,
    pub lowest_rate: f64,
    pub highest_date: DateTime<Utc>,
    pub lowest_date: DateTime<Utc>,
}

impl RateStatistic {
    /// Applies one more observation. Ties never move an extremum or its date.
    pub fn observe(&mut self, rate: f64, at: DateTime<Utc>) {
        self.current_rate = rate;
        if rate > self.highest_rate {
            self.highest_rate = rate;
            self.highest_date = at;
        }
        if rate < self.lowest_rate {
            self.lowest_rate = rate;
            self.lowest_date = at;
        }
    }
}

/// Filter for the observation ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryQuery {
    /// Case-insensitive substring of the merchant name.
    pub merchant: Option<String>,
    /// Exact source URL.
    pub url: Option<String>,
    pub category: Option<String>,
    pub limit: u32,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            merchant: None,
            url: None,
            category: None,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsQuery {
    pub merchant: Option<String>,
    pub category: Option<String>,
}

static RATE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)up to\s+(\d+\.?\d*)%",
        r"(?i)(\d+\.?\d*)%\s*cashback",
        r"(\d+\.?\d*)%",
        r"\$(\d+\.?\d*)",
        r"(\d+\.?\d*)\s+%",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("rate pattern"))
    .collect()
});

/// Parses free-form promotional text into a non-negative rate.
///
/// Patterns are tried most specific first; the first one whose capture parses
/// wins. Anything unrecognized is `0.0`.
pub fn parse_rate(text: &str) -> f64 {
    let text = text.trim();
    if text.is_empty() {
        return 0.0;
    }
    for pattern in RATE_PATTERNS.iter() {
        let Some(caps) = pattern.captures(text) else {
            continue;
        };
        match caps[1].parse::<f64>() {
            Ok(value) if value.is_finite() => return value.max(0.0),
            _ => continue,
        }
    }
    0.0
}

fn truncate_category(category: &str) -> String {
    if category.chars().count() > MAX_CATEGORY_CHARS {
        let mut cut: String = category.chars().take(MAX_CATEGORY_CHARS).collect();
        cut.push_str("...");
        cut
    } else {
        category.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_up_to_phrasing() {
        assert_eq!(parse_rate("Up to 8.5% Cashback"), 8.5);
        assert_eq!(parse_rate("up to 12% cashback"), 12.0);
    }

    #[test]
    fn parses_currency_amount() {
        assert_eq!(parse_rate("$10"), 10.0);
        assert_eq!(parse_rate("Up to $7.50 Cashback"), 7.5);
    }

    #[test]
    fn loosely_spaced_percent_is_accepted() {
        assert_eq!(parse_rate("3 % back"), 3.0);
    }

    #[test]
    fn empty_or_digitless_text_is_zero() {
        assert_eq!(parse_rate(""), 0.0);
        assert_eq!(parse_rate("   "), 0.0);
        assert_eq!(parse_rate("No cashback today"), 0.0);
    }

    #[test]
    fn rate_is_never_negative() {
        for input in ["-5%", "Cashback -3 %", "$-2", "—", "%%%", "1e400%"] {
            assert!(parse_rate(input) >= 0.0, "{input}");
        }
    }

    #[test]
    fn specific_pattern_beats_generic_one() {
        // "Up to" must win over the first bare percentage in the text.
        assert_eq!(parse_rate("Was 2%, now Up to 6%"), 6.0);
    }

    #[test]
    fn long_category_labels_are_truncated() {
        let label = "x".repeat(150);
        let rate = CategoryRate::new(&label, " 5% ");
        assert_eq!(rate.category.chars().count(), MAX_CATEGORY_CHARS + 3);
        assert!(rate.category.ends_with("..."));
        assert_eq!(rate.rate_text, "5%");
        assert_eq!(rate.rate_numeric, 5.0);
    }

    #[test]
    fn failure_result_has_defaults() {
        let result = ExtractionResult::failure("Agoda", "https://example.com/agoda", "timed out");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("timed out"));
        assert_eq!(result.main_rate_text, DEFAULT_RATE_TEXT);
        assert_eq!(result.main_rate_numeric, 0.0);
        assert!(result.categories.is_empty());
        assert!(!result.is_degraded());
        assert_eq!(result.observations().count(), 1);
    }

    #[test]
    fn observations_start_with_main() {
        let mut result = ExtractionResult::failure("A", "u", "x");
        result.success = true;
        result.error = None;
        result.categories.push(CategoryRate::new("Travel", "4%"));
        let cats: Vec<_> = result.observations().map(|(c, _, _)| c).collect();
        assert_eq!(cats, vec![MAIN_CATEGORY, "Travel"]);
    }

    #[test]
    fn statistic_ties_keep_first_dates() {
        let t0 = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap();
        let t1 = Utc.with_ymd_and_hms(2026, 1, 2, 0, 0, 0).single().unwrap();
        let t2 = Utc.with_ymd_and_hms(2026, 1, 3, 0, 0, 0).single().unwrap();
        let mut stat = RateStatistic {
            merchant_id: 1,
            merchant_name: "A".into(),
            category: MAIN_CATEGORY.into(),
            current_rate: 4.0,
            highest_rate: 4.0,
            lowest_rate: 4.0,
            highest_date: t0,
            lowest_date: t0,
        };
        stat.observe(6.0, t1);
        stat.observe(6.0, t2);
        stat.observe(4.0, t2);
        assert_eq!(stat.highest_rate, 6.0);
        assert_eq!(stat.highest_date, t1);
        assert_eq!(stat.lowest_rate, 4.0);
        assert_eq!(stat.lowest_date, t0);
        assert_eq!(stat.current_rate, 4.0);
    }

    #[test]
    fn extraction_result_serializes_stable_field_names() {
        let result = ExtractionResult::failure("A", "u", "boom");
        let value = serde_json::to_value(&result).unwrap();
        for key in [
            "merchant_name",
            "source_url",
            "main_rate_text",
            "main_rate_numeric",
            "upsized",
            "prior_offer",
            "categories",
            "success",
            "error",
        ] {
            assert!(value.get(key).is_some(), "{key}");
        }
    }
}
