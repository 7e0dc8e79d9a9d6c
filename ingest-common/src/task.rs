//! # Task
//!
//! Task requests sent from the api to the worker on the task queue. Unlike record messages,
//! a task names work for the worker to do (`kind`) with optional parameters (`payload`).
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::record::{json_type_name, text};
use crate::watermark::LastSeen;

/// Incremental ingest of the scraper output. Also the watermark source name.
pub const SCRAPE_NEW_DATA: &str = "scrape_new_data";

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("failed to decode task message: {0}")]
    DecodeError(#[from] serde_json::Error),
    #[error("task message is missing its kind")]
    MissingKind,
    #[error("unsupported task kind: {0}")]
    UnsupportedKind(String),
    #[error("task payload field {field} must be {expected}, found {found}")]
    InvalidPayload {
        field: &'static str,
        expected: &'static str,
        found: &'static str,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TaskMessage {
    pub kind: String,
    pub ts: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl TaskMessage {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_owned(),
            ts: Utc::now(),
            payload,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(body: &[u8]) -> Result<Self, TaskError> {
        let message: TaskMessage = serde_json::from_slice(body)?;
        if message.kind.trim().is_empty() {
            return Err(TaskError::MissingKind);
        }
        Ok(message)
    }
}

/// Parameters of a `scrape_new_data` task. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapeRequest {
    /// Overrides the stored watermark for this run.
    pub since: Option<LastSeen>,
    /// Rows to ingest instead of reading the scraper output file.
    pub records: Option<Vec<Value>>,
    /// Scraper output file to read instead of the configured one.
    pub data_file: Option<PathBuf>,
}

impl ScrapeRequest {
    pub fn from_payload(payload: &Value) -> Result<Self, TaskError> {
        let empty = Map::new();
        let fields = match payload {
            Value::Null => &empty,
            Value::Object(fields) => fields,
            other => {
                return Err(TaskError::InvalidPayload {
                    field: "payload",
                    expected: "an object",
                    found: json_type_name(other),
                })
            }
        };

        let records = match fields.get("records") {
            None | Some(Value::Null) => None,
            Some(Value::Array(rows)) => Some(rows.clone()),
            Some(other) => {
                return Err(TaskError::InvalidPayload {
                    field: "records",
                    expected: "an array",
                    found: json_type_name(other),
                })
            }
        };

        Ok(Self {
            since: text(fields.get("since")).map(LastSeen::new),
            records,
            data_file: fields
                .get("data_file")
                .and_then(Value::as_str)
                .filter(|path| !path.is_empty())
                .map(PathBuf::from),
        })
    }
}
