//! # Record
//!
//! One applicant entry as stored in the `applicants` table, plus the normalization
//! applied to raw scraper rows before they are persisted.
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Enumeration of validation errors for a `Record`.
/// None of these can be fixed by retrying: the payload itself is wrong.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("record is missing its identity key (url)")]
    MissingIdentityKey,
    #[error("record has no descriptive field set")]
    NoDescriptiveField,
    #[error("expected a JSON object but found {0}")]
    NotAnObject(&'static str),
    #[error("failed to decode record payload: {0}")]
    DecodeError(#[from] serde_json::Error),
}

static NUMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[-+]?\d*\.?\d+").expect("number pattern is valid"));

const DATE_FORMATS: [&str; 3] = ["%B %d, %Y", "%b %d, %Y", "%Y-%m-%d"];

/// A flat applicant entry. `url` is the identity key: unique in storage when present,
/// while rows without it are stored without any deduplication.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
#[serde(default)]
pub struct Record {
    pub url: Option<String>,
    pub program: Option<String>,
    pub comments: Option<String>,
    pub date_added: Option<NaiveDate>,
    pub status: Option<String>,
    pub term: Option<String>,
    pub us_or_international: Option<String>,
    pub gpa: Option<f64>,
    pub gre: Option<f64>,
    pub gre_v: Option<f64>,
    pub gre_aw: Option<f64>,
    pub degree: Option<f64>,
    pub llm_generated_program: Option<String>,
    pub llm_generated_university: Option<String>,
}

impl Record {
    /// Return the identity key, or `None` when the key is absent or blank.
    pub fn identity_key(&self) -> Option<&str> {
        self.url.as_deref().filter(|key| !key.trim().is_empty())
    }

    fn has_descriptive_field(&self) -> bool {
        [
            &self.program,
            &self.comments,
            &self.status,
            &self.term,
            &self.us_or_international,
            &self.llm_generated_program,
            &self.llm_generated_university,
        ]
        .iter()
        .any(|field| field.as_deref().is_some_and(|value| !value.trim().is_empty()))
    }

    /// Check the minimum a record needs before it may be handed to the broker:
    /// an identity key and at least one descriptive field.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.identity_key().is_none() {
            return Err(RecordError::MissingIdentityKey);
        }
        if !self.has_descriptive_field() {
            return Err(RecordError::NoDescriptiveField);
        }
        Ok(())
    }

    /// Check the minimum a record needs before it may be written: at least one descriptive
    /// field. Keyless records pass, and are stored without deduplication.
    pub fn validate_for_storage(&self) -> Result<(), RecordError> {
        if !self.has_descriptive_field() {
            return Err(RecordError::NoDescriptiveField);
        }
        Ok(())
    }

    /// Build a `Record` from one raw scraper row.
    /// Scraper rows use their own field names (`applicant_status`, `citizenship`, ...) and carry
    /// free-form values, so every field is coerced into its stored type here.
    pub fn from_scraped(row: &Value) -> Result<Self, RecordError> {
        let row = row
            .as_object()
            .ok_or_else(|| RecordError::NotAnObject(json_type_name(row)))?;

        Ok(Self {
            url: text(row.get("url")),
            program: text(row.get("program")),
            comments: text(row.get("comments")),
            date_added: date(row.get("date_added")),
            status: text(row.get("applicant_status")),
            term: text(row.get("semester_year_start")),
            us_or_international: text(row.get("citizenship")),
            gpa: number(row.get("gpa")),
            gre: number(row.get("gre")),
            gre_v: number(row.get("gre_v")),
            gre_aw: number(row.get("gre_aw")),
            degree: degree(row.get("masters_or_phd")),
            llm_generated_program: first_text(
                row,
                &["llm-generated-program", "llm_generated_program"],
            ),
            llm_generated_university: first_text(
                row,
                &["llm-generated-university", "llm_generated_university"],
            ),
        })
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Stringify any non-null value, dropping NUL bytes Postgres refuses to store in TEXT.
pub(crate) fn text(value: Option<&Value>) -> Option<String> {
    let raw = match value? {
        Value::Null => return None,
        Value::String(s) => s.to_owned(),
        other => other.to_string(),
    };
    Some(raw.replace('\0', ""))
}

/// The first key holding a truthy value wins; empty strings fall through.
fn first_text(row: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| row.get(*key))
        .find(|value| match value {
            Value::Null => false,
            Value::String(s) => !s.is_empty(),
            _ => true,
        })
        .and_then(|value| text(Some(value)))
}

/// Numbers pass through; strings yield their first decimal number ("GPA 3.80" -> 3.8).
fn number(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => NUMBER_RE
            .find(s)
            .and_then(|found| found.as_str().parse::<f64>().ok()),
        _ => None,
    }
}

pub(crate) fn date(value: Option<&Value>) -> Option<NaiveDate> {
    let raw = value?.as_str()?.trim();
    if raw.is_empty() {
        return None;
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(raw, format).ok())
}

/// Degree labels collapse to 2.0 for doctorates and 1.0 for masters.
fn degree(value: Option<&Value>) -> Option<f64> {
    let normalized = value?.as_str()?.trim().to_lowercase();
    if normalized.is_empty() {
        return None;
    }
    if normalized.contains("phd") || normalized.contains("doctor") {
        return Some(2.0);
    }
    if normalized.contains("master") || ["ms", "ma", "msc", "mba"].contains(&normalized.as_str())
    {
        return Some(1.0);
    }
    None
}
