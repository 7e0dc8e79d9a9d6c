//! # Watermark
//!
//! Incremental ingest keeps one watermark per source: the newest scraper position that has
//! been fully stored. Rows at or below it are skipped by the next run.
use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::record::{date, text};

static RESULT_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/result/(\d+)").expect("result id pattern is valid"));

/// The newest position stored for `source`. Advanced in the same transaction as the insert
/// it covers, so it never runs ahead of the rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Watermark {
    pub source: String,
    pub last_seen: String,
}

/// Ordering of scraper positions: purely numeric positions compare as numbers and sort
/// before any other text, which compares lexically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSeen(String);

impl LastSeen {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    fn numeric(&self) -> Option<&str> {
        if !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit()) {
            Some(self.0.trim_start_matches('0'))
        } else {
            None
        }
    }
}

impl Ord for LastSeen {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            // Without leading zeros a longer digit string is the larger number.
            (Some(a), Some(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for LastSeen {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The scraper position of one raw row: an explicit `last_seen` / `last_processed_at`,
/// else the numeric result id in the url, else the ISO `date_added`.
pub fn record_last_seen(row: &Value) -> Option<LastSeen> {
    for key in ["last_seen", "last_processed_at"] {
        if let Some(explicit) = text(row.get(key)) {
            return Some(LastSeen(explicit));
        }
    }

    if let Some(url) = text(row.get("url")) {
        if let Some(id) = RESULT_ID_RE.captures(&url).and_then(|c| c.get(1)) {
            return Some(LastSeen(id.as_str().to_owned()));
        }
    }

    date(row.get("date_added")).map(|d| LastSeen(d.format("%Y-%m-%d").to_string()))
}

/// Whether a row at `position` still needs processing given the stored watermark `since`.
/// Rows without a position are always processed.
pub fn is_newer(position: Option<&LastSeen>, since: Option<&LastSeen>) -> bool {
    match (position, since) {
        (Some(position), Some(since)) => position > since,
        _ => true,
    }
}
