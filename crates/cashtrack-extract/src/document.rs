//! Parsed-document wrapper over [`scraper::Html`].
//!
//! Text helpers skip the contents of `script`, `style`, `noscript` and
//! `template`, and collapse whitespace runs to single spaces.

use std::collections::HashSet;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use crate::ExtractError;

const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// Attribute carrying the stable layout markers used by merchant pages.
pub const MARKER_ATTR: &str = "data-testid";

pub struct Document {
    html: Html,
}

impl Document {
    pub fn parse(markup: &str) -> Self {
        Self {
            html: Html::parse_document(markup),
        }
    }

    pub fn html(&self) -> &Html {
        &self.html
    }

    /// First element carrying `data-testid="{marker}"`.
    pub fn find_marker(&self, marker: &str) -> Result<Option<ElementRef<'_>>, ExtractError> {
        let sel = parse_selector(&marker_selector(None, marker))?;
        Ok(self.html.select(&sel).next())
    }

    /// All elements matching a CSS selector, in document order.
    pub fn find_all(&self, selector: &str) -> Result<Vec<ElementRef<'_>>, ExtractError> {
        let sel = parse_selector(selector)?;
        Ok(self.html.select(&sel).collect())
    }

    /// The element owning the first visible text node matching `pattern`.
    pub fn find_text(&self, pattern: &Regex) -> Option<ElementRef<'_>> {
        self.elements_with_text(pattern).into_iter().next()
    }

    /// Elements owning a visible text node matching `pattern`, deduplicated,
    /// in document order.
    pub fn elements_with_text(&self, pattern: &Regex) -> Vec<ElementRef<'_>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for node in self.html.root_element().descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            let Some(parent) = node.parent().and_then(ElementRef::wrap) else {
                continue;
            };
            if is_hidden(parent) || !pattern.is_match(text) {
                continue;
            }
            if seen.insert(parent.id()) {
                out.push(parent);
            }
        }
        out
    }

    /// Visible text of the whole page, text nodes separated by spaces.
    pub fn full_text(&self) -> String {
        let mut out = String::new();
        for node in self.html.root_element().descendants() {
            let Some(text) = node.value().as_text() else {
                continue;
            };
            if node.parent().and_then(ElementRef::wrap).is_some_and(is_hidden) {
                continue;
            }
            out.push_str(text);
            out.push(' ');
        }
        collapse_whitespace(&out)
    }
}

/// Visible text of one element, whitespace-collapsed and trimmed.
pub fn element_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    for node in element.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        if node.parent().and_then(ElementRef::wrap).is_some_and(is_hidden) {
            continue;
        }
        out.push_str(text);
    }
    collapse_whitespace(&out)
}

/// Visible text, or `None` when it is empty.
pub fn text_or_none(element: ElementRef<'_>) -> Option<String> {
    let text = element_text(element);
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Elements below `scope` matching a CSS selector, in document order.
pub fn select_within<'a>(
    scope: ElementRef<'a>,
    selector: &str,
) -> Result<Vec<ElementRef<'a>>, ExtractError> {
    let sel = parse_selector(selector)?;
    Ok(scope.select(&sel).collect())
}

/// `tag[data-testid="marker"]`, or any tag when `tag` is `None`.
pub fn marker_selector(tag: Option<&str>, marker: &str) -> String {
    format!("{}[{MARKER_ATTR}=\"{marker}\"]", tag.unwrap_or(""))
}

pub(crate) fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn is_hidden(element: ElementRef<'_>) -> bool {
    HIDDEN_TAGS.contains(&element.value().name())
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
