//! Classification and parsing of rendered pages.

use std::collections::HashSet;

use scraper::{Html, Selector};
use unitscout_core::{AppError, ScrapeFailure, ScrapeFailureKind};

/// Title fragments of pages served instead of the requested content when a
/// site blocks or rate-limits the crawler.
const BLOCKED_TITLES: &[&str] = &[
    "429",
    "too many requests",
    "403",
    "forbidden",
    "access denied",
    "attention required",
    "just a moment",
    "rate limit",
    "captcha",
];

/// Markup of interstitial challenge pages.
const CHALLENGE_MARKERS: &[&str] = &[
    "cf-challenge",
    "challenge-platform",
    "g-recaptcha",
    "h-captcha",
    "px-captcha",
];

/// Recognise a rendered page that is actually a block or rate-limit page.
pub fn detect_block_page(title: &str, html: &str) -> Option<ScrapeFailure> {
    let title_lower = title.to_lowercase();
    if let Some(hit) = BLOCKED_TITLES.iter().find(|t| title_lower.contains(*t)) {
        return Some(ScrapeFailure::new(
            ScrapeFailureKind::RateLimited,
            format!("Blocked page served (title matched '{hit}'): {}", title.trim()),
        ));
    }

    let html_lower = html.to_lowercase();
    CHALLENGE_MARKERS
        .iter()
        .find(|m| html_lower.contains(*m))
        .map(|hit| {
            ScrapeFailure::new(
                ScrapeFailureKind::RateLimited,
                format!("Challenge page served (marker '{hit}')"),
            )
        })
}

/// Collect unit codes from catalogue HTML: the trimmed, whitespace-collapsed
/// text of every element matching `selector`, de-duplicated, in document
/// order.
pub fn extract_codes(html: &str, selector: &str) -> Result<Vec<String>, AppError> {
    let selector = Selector::parse(selector)
        .map_err(|e| AppError::ConfigError(format!("Invalid selector '{selector}': {e}")))?;
    let document = Html::parse_document(html);

    let mut seen = HashSet::new();
    let codes = document
        .select(&selector)
        .map(|el| el.text().collect::<Vec<_>>().join(" "))
        .map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|code| !code.is_empty())
        .filter(|code| seen.insert(code.clone()))
        .collect();
    Ok(codes)
}
