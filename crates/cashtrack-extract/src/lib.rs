//! Cashback extraction pipeline: ordered fallback strategies over an unstable
//! merchant page layout.
//!
//! Every field is produced by walking a fixed, named strategy table in
//! priority order. A strategy that errors is logged and skipped; a field that no
//! strategy fills gets its documented default. The pipeline never fails.

mod document;
mod identity;

use std::sync::LazyLock;

use cashtrack_core::{parse_rate, CategoryRate, ExtractionResult, DEFAULT_RATE_TEXT};
use regex::Regex;
use scraper::ElementRef;
use thiserror::Error;
use tracing::{debug, info, info_span, warn};

pub use document::{element_text, marker_selector, select_within, text_or_none, Document, MARKER_ATTR};
pub use identity::{merchant_name_from_url, resolve_merchant_name};

pub const CRATE_NAME: &str = "cashtrack-extract";

/// Page-wide sweeps only consider text blocks shorter than this.
pub const MAX_SWEEP_BLOCK_CHARS: usize = 200;

/// Emphasis text at or above this length is prose, not a rate.
pub const MAX_EMPHASIS_CHARS: usize = 50;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
}

/// One named heuristic in a fallback chain.
pub struct Strategy<T> {
    pub name: &'static str,
    pub run: fn(&Document) -> Result<T, ExtractError>,
}

pub type MainRateStrategy = Strategy<Option<String>>;
pub type CategoryStrategy = Strategy<Vec<CategoryRate>>;

/// Primary-rate strategies, highest trust first. The first one returning a
/// non-default rate wins.
pub const MAIN_RATE_STRATEGIES: &[MainRateStrategy] = &[
    Strategy {
        name: "current-offer-marker",
        run: current_offer_marker,
    },
    Strategy {
        name: "legacy-rate-marker",
        run: legacy_rate_marker,
    },
    Strategy {
        name: "heading",
        run: heading_rate,
    },
    Strategy {
        name: "emphasis",
        run: emphasis_rate,
    },
    Strategy {
        name: "page-sweep",
        run: page_sweep_rate,
    },
];

/// Category strategies. The first one yielding at least one record
/// short-circuits the rest.
pub const CATEGORY_STRATEGIES: &[CategoryStrategy] = &[
    Strategy {
        name: "tier-block-table",
        run: tier_block_rates,
    },
    Strategy {
        name: "all-rates-rows",
        run: all_rates_rows,
    },
    Strategy {
        name: "colon-sweep",
        run: colon_sweep_rates,
    },
];

const CURRENT_OFFER_MARKER: &str = "current-offer";
const LEGACY_RATE_MARKER: &str = "cashback-rate";
const WORSE_OFFER_MARKER: &str = "worse-offer";
const RATE_TABLE_MARKER: &str = "cashback-rates";
const TIER_BLOCK_MARKER: &str = "cashback-tier-block";
const ALL_RATES_MARKER: &str = "all-cashback-rates";

const TIER_ROW_SELECTOR: &str = r#"div[class*="flex_row"][class*="justify_space-between"]"#;
const ALL_RATES_ROW_SELECTOR: &str = r#"div[class*="bg_sbds-background-color-secondary"]"#;
const LABEL_REGION_SELECTOR: &str = r#"div[class*="flex_1"]"#;
const BOLD_FRAGMENT_SELECTOR: &str = r#"p[class*="font_bold"]"#;
const STRIKETHROUGH_SELECTOR: &str = r#"s, del, strike, [class*="text-decor_line-through"]"#;

/// Text blocks the colon sweep considers, outermost first in document order.
const SWEEP_BLOCK_SELECTOR: &str = "li, p, td, dt, dd, div, span";

const HEADING_TAGS: &[&str] = &["h1", "h2", "h3", "h4", "h5", "h6"];
const EMPHASIS_TAGS: &[&str] = &["strong", "b", "em"];

/// Words that mark a bold fragment as row metadata rather than the rate.
const ROW_METADATA_WORDS: &[&str] = &["upsized", "ends"];

static UPSIZED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bupsized\b").expect("upsized regex"));

static PAGE_SWEEP_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bup to\s+(\d+\.?\d*%)\s*cashback",
        r"(?i)(\d+\.?\d*%)\s*cashback",
        r"(?i)\bearn\s+(\d+\.?\d*%)",
        r"(?i)\bget\s+(\d+\.?\d*%)",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("page sweep regex"))
    .collect()
});

/// Runs the whole pipeline over one document.
///
/// The output depends only on `doc` and `url`; capture time is assigned by
/// the history engine.
pub fn scrape(doc: &Document, url: &str) -> ExtractionResult {
    let span = info_span!("scrape", url);
    let _guard = span.enter();

    let merchant_name = resolve_merchant_name(doc, url);
    let main_rate_text = extract_main_rate(doc);
    let upsized = detect_upsized(doc);
    let prior_offer = extract_prior_offer(doc);
    let categories = extract_category_rates(doc);

    let result = ExtractionResult {
        merchant_name,
        source_url: url.to_string(),
        main_rate_numeric: parse_rate(&main_rate_text),
        main_rate_text,
        upsized,
        prior_offer,
        categories,
        success: true,
        error: None,
    };

    if result.is_degraded() {
        info!(merchant = %result.merchant_name, "degraded extraction: no rate signal on page");
    }
    info!(
        merchant = %result.merchant_name,
        main_rate = %result.main_rate_text,
        categories = result.categories.len(),
        upsized = result.upsized,
        "extraction finished"
    );
    result
}

/// Parses `markup` and runs [`scrape`] on it.
pub fn scrape_markup(markup: &str, url: &str) -> ExtractionResult {
    let doc = Document::parse(markup);
    scrape(&doc, url)
}

/// Well-formed result for a scrape that failed before any strategy could run.
pub fn failed_scrape(url: &str, error: impl std::fmt::Display) -> ExtractionResult {
    let result = ExtractionResult::failure(merchant_name_from_url(url), url, error);
    warn!(url, error = result.error.as_deref().unwrap_or_default(), "scrape failed before extraction");
    result
}

pub fn extract_main_rate(doc: &Document) -> String {
    first_main_rate(doc, MAIN_RATE_STRATEGIES)
}

/// Walks `strategies` in order; `"0%"` when none produces a rate.
pub fn first_main_rate(doc: &Document, strategies: &[MainRateStrategy]) -> String {
    for strategy in strategies {
        match (strategy.run)(doc) {
            Ok(Some(text)) if !text.is_empty() && text != DEFAULT_RATE_TEXT => {
                debug!(strategy = strategy.name, rate = %text, "primary rate found");
                return text;
            }
            Ok(_) => {}
            Err(err) => warn!(strategy = strategy.name, error = %err, "primary rate strategy failed"),
        }
    }
    info!("no primary rate on page; using default");
    DEFAULT_RATE_TEXT.to_string()
}

pub fn extract_category_rates(doc: &Document) -> Vec<CategoryRate> {
    first_category_rates(doc, CATEGORY_STRATEGIES)
}

/// Walks `strategies` in order and returns the first non-empty record list.
pub fn first_category_rates(doc: &Document, strategies: &[CategoryStrategy]) -> Vec<CategoryRate> {
    for strategy in strategies {
        match (strategy.run)(doc) {
            Ok(rates) if !rates.is_empty() => {
                debug!(strategy = strategy.name, count = rates.len(), "category rates found");
                return rates;
            }
            Ok(_) => {}
            Err(err) => warn!(strategy = strategy.name, error = %err, "category strategy failed"),
        }
    }
    info!("no category rates on page");
    Vec::new()
}

/// True when any visible text carries the word "Upsized".
pub fn detect_upsized(doc: &Document) -> bool {
    doc.find_text(&UPSIZED).is_some()
}

/// The displaced offer: the worse-offer marker, else struck-through text
/// containing a percent sign.
pub fn extract_prior_offer(doc: &Document) -> Option<String> {
    match prior_offer(doc) {
        Ok(offer) => offer,
        Err(err) => {
            warn!(error = %err, "prior offer lookup failed");
            None
        }
    }
}

fn prior_offer(doc: &Document) -> Result<Option<String>, ExtractError> {
    if let Some(text) = doc.find_marker(WORSE_OFFER_MARKER)?.and_then(text_or_none) {
        return Ok(Some(text));
    }
    Ok(doc
        .find_all(STRIKETHROUGH_SELECTOR)?
        .into_iter()
        .map(element_text)
        .find(|text| text.contains('%')))
}

fn current_offer_marker(doc: &Document) -> Result<Option<String>, ExtractError> {
    Ok(doc.find_marker(CURRENT_OFFER_MARKER)?.and_then(text_or_none))
}

fn legacy_rate_marker(doc: &Document) -> Result<Option<String>, ExtractError> {
    Ok(doc.find_marker(LEGACY_RATE_MARKER)?.and_then(text_or_none))
}

/// Headings are tried by tag rank, not document order: every `h1` before any
/// `h2`, and so on. A matching `h2` wins over an earlier matching `h5`.
fn heading_rate(doc: &Document) -> Result<Option<String>, ExtractError> {
    for tag in HEADING_TAGS {
        for heading in doc.find_all(tag)? {
            if is_struck_through(heading) {
                continue;
            }
            let text = element_text(heading);
            let lower = text.to_lowercase();
            if text.contains('%') && (lower.contains("up to") || lower.contains("cashback")) {
                return Ok(Some(text));
            }
        }
    }
    Ok(None)
}

fn emphasis_rate(doc: &Document) -> Result<Option<String>, ExtractError> {
    for tag in EMPHASIS_TAGS {
        for el in doc.find_all(tag)? {
            let text = element_text(el);
            if text.contains('%') && text.chars().count() < MAX_EMPHASIS_CHARS {
                return Ok(Some(text));
            }
        }
    }
    Ok(None)
}

fn page_sweep_rate(doc: &Document) -> Result<Option<String>, ExtractError> {
    let text = doc.full_text();
    Ok(PAGE_SWEEP_PATTERNS
        .iter()
        .find_map(|pattern| pattern.captures(&text))
        .map(|caps| caps[1].to_string()))
}

fn tier_block_rates(doc: &Document) -> Result<Vec<CategoryRate>, ExtractError> {
    let Some(table) = doc.find_marker(RATE_TABLE_MARKER)? else {
        return Ok(Vec::new());
    };
    let Some(block) = select_within(table, &marker_selector(None, TIER_BLOCK_MARKER))?
        .into_iter()
        .next()
    else {
        debug!("rate table has no tier block");
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for (idx, row) in select_within(block, TIER_ROW_SELECTOR)?.into_iter().enumerate() {
        let fragments = select_within(row, "p")?;
        let [label, rate, ..] = fragments.as_slice() else {
            debug!(row = idx, fragments = fragments.len(), "tier row without label/rate pair");
            continue;
        };
        let label = element_text(*label);
        let rate = element_text(*rate);
        if label.is_empty() || !rate.contains('%') {
            debug!(row = idx, %label, %rate, "tier row rejected");
            continue;
        }
        out.push(CategoryRate::new(&label, &rate));
    }
    Ok(out)
}

fn all_rates_rows(doc: &Document) -> Result<Vec<CategoryRate>, ExtractError> {
    let Some(container) = doc.find_marker(ALL_RATES_MARKER)? else {
        return Ok(Vec::new());
    };

    let mut out = Vec::new();
    for (idx, row) in select_within(container, ALL_RATES_ROW_SELECTOR)?.into_iter().enumerate() {
        let Some(region) = select_within(row, LABEL_REGION_SELECTOR)?.into_iter().next() else {
            continue;
        };
        let label = select_within(region, "p")?
            .into_iter()
            .next()
            .map(element_text)
            .unwrap_or_default();
        if label.is_empty() {
            continue;
        }
        let rate = select_within(row, BOLD_FRAGMENT_SELECTOR)?
            .into_iter()
            .map(element_text)
            .find(|text| text.contains('%') && !is_row_metadata(text));
        match rate {
            Some(rate) => out.push(CategoryRate::new(&label, &rate)),
            None => info!(row = idx, category = %label, "degraded row: no bold rate fragment"),
        }
    }
    Ok(out)
}

fn colon_sweep_rates(doc: &Document) -> Result<Vec<CategoryRate>, ExtractError> {
    let mut out = Vec::new();
    for el in doc.find_all(SWEEP_BLOCK_SELECTOR)? {
        let text = element_text(el);
        if !is_colon_rate_block(&text) {
            continue;
        }
        // The innermost qualifying block carries the pair; wrappers repeat it.
        let has_inner_block = select_within(el, SWEEP_BLOCK_SELECTOR)?
            .into_iter()
            .any(|inner| is_colon_rate_block(&element_text(inner)));
        if has_inner_block {
            continue;
        }
        let mut parts = text.split(':');
        let (Some(label), Some(rate), None) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        if label.trim().is_empty() || !rate.contains('%') {
            continue;
        }
        out.push(CategoryRate::new(label, rate));
    }
    Ok(out)
}

fn is_colon_rate_block(text: &str) -> bool {
    text.chars().count() < MAX_SWEEP_BLOCK_CHARS && text.contains('%') && text.contains(':')
}

fn is_struck_through(el: ElementRef<'_>) -> bool {
    el.value()
        .attr("class")
        .is_some_and(|class| class.contains("line-through"))
}

fn is_row_metadata(text: &str) -> bool {
    let lower = text.to_lowercase();
    ROW_METADATA_WORDS.iter().any(|word| lower.contains(word))
}
