//! Canonical merchant naming.

use std::sync::LazyLock;

use cashtrack_core::UNKNOWN_MERCHANT;
use regex::Regex;
use tracing::debug;

use crate::document::{parse_selector, text_or_none, Document};

const TITLE_SEPARATOR: char = '|';

static BOILERPLATE_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(cashback|discount|codes|vouchers|deals)\b").expect("boilerplate regex")
});

/// Derives a non-empty merchant name from the page, falling back to the URL
/// slug and finally to [`UNKNOWN_MERCHANT`].
pub fn resolve_merchant_name(doc: &Document, url: &str) -> String {
    if let Some(name) = title_name(doc) {
        return name;
    }
    if let Some(name) = og_title_name(doc) {
        return name;
    }
    merchant_name_from_url(url)
}

/// URL-only resolution, for scrapes that failed before a document existed.
pub fn merchant_name_from_url(url: &str) -> String {
    slug_name(url).unwrap_or_else(|| UNKNOWN_MERCHANT.to_string())
}

fn title_name(doc: &Document) -> Option<String> {
    let sel = parse_selector("title").ok()?;
    let title = doc.html().select(&sel).next().and_then(text_or_none)?;
    let name = clean_title(&title);
    if name.is_none() {
        debug!(%title, "title carried no merchant name");
    }
    name
}

fn og_title_name(doc: &Document) -> Option<String> {
    let sel = parse_selector(r#"meta[property="og:title"]"#).ok()?;
    let content = doc
        .html()
        .select(&sel)
        .next()
        .and_then(|el| el.value().attr("content"))?;
    clean_title(content)
}

/// First separator segment with boilerplate words removed.
fn clean_title(title: &str) -> Option<String> {
    let first = title.split(TITLE_SEPARATOR).next()?;
    let stripped = BOILERPLATE_WORDS.replace_all(first, " ");
    let name = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn slug_name(url: &str) -> Option<String> {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .trim_end_matches('/');
    // The first segment is the host; a bare host names no merchant.
    let (_, path) = path.split_once('/')?;
    let slug = path.rsplit('/').next()?.trim();
    let name = slug
        .split('-')
        .filter(|w| !w.is_empty())
        .map(capitalize)
        .collect::<Vec<_>>()
        .join(" ");
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => {
            let mut s = String::new();
            s.extend(first.to_uppercase());
            s.push_str(&chars.as_str().to_lowercase());
            s
        }
        None => String::new(),
    }
}
