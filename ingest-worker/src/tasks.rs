//! # Tasks
//!
//! Runs tasks queued by the api. The only supported kind is `scrape_new_data`: an
//! incremental ingest of the scraper output that skips rows at or below the stored
//! watermark and advances the watermark in the same transaction as the insert.
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use ingest_common::metrics::TASK_ROWS_INSERTED;
use ingest_common::record::Record;
use ingest_common::source;
use ingest_common::store::{self, RecordStore};
use ingest_common::task::{ScrapeRequest, TaskError, TaskMessage, SCRAPE_NEW_DATA};
use ingest_common::watermark::{is_newer, record_last_seen, LastSeen, Watermark};

use crate::consumer::{DeliveryHandler, Disposition};
use crate::error::TaskRunError;

/// What one `scrape_new_data` run did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ScrapeReport {
    /// Rows read from the request or the scraper output.
    pub read: usize,
    /// Rows past the watermark.
    pub newer: usize,
    pub inserted: u64,
    /// The watermark after the run, when it moved.
    pub last_seen: Option<String>,
}

pub struct TaskHandler<S> {
    store: Arc<S>,
    /// Scraper output read when a task does not name its own rows or file.
    data_file: PathBuf,
}

impl<S: RecordStore> TaskHandler<S> {
    pub fn new(store: Arc<S>, data_file: impl Into<PathBuf>) -> Self {
        Self {
            store,
            data_file: data_file.into(),
        }
    }

    pub async fn run(&self, message: &TaskMessage) -> Result<ScrapeReport, TaskRunError> {
        match message.kind.as_str() {
            SCRAPE_NEW_DATA => self.scrape_new_data(&message.payload).await,
            other => Err(TaskError::UnsupportedKind(other.to_owned()).into()),
        }
    }

    pub async fn scrape_new_data(&self, payload: &Value) -> Result<ScrapeReport, TaskRunError> {
        let request = ScrapeRequest::from_payload(payload)?;

        let since = match request.since {
            Some(since) => Some(since),
            None => self
                .store
                .last_seen(SCRAPE_NEW_DATA)
                .await?
                .map(LastSeen::new),
        };

        let rows = match request.records {
            Some(rows) => rows,
            None => {
                let path = request.data_file.unwrap_or_else(|| self.data_file.clone());
                source::read_rows(&path).await?
            }
        };

        let mut newest: Option<LastSeen> = None;
        let mut records = Vec::new();
        for (index, row) in rows.iter().enumerate() {
            let position = record_last_seen(row);
            if !is_newer(position.as_ref(), since.as_ref()) {
                continue;
            }

            let record = Record::from_scraped(row)
                .map_err(|error| TaskRunError::InvalidRow { index, error })?;
            records.push(record);

            // Rows skipped below as already stored still move the watermark.
            if let Some(position) = position {
                if newest.as_ref().map_or(true, |current| position > *current) {
                    newest = Some(position);
                }
            }
        }
        let newer = records.len();

        let seen = store::load_seen_keys(self.store.as_ref()).await?;
        let fresh = store::filter_new(records, &seen);

        let watermark = newest.map(|position| Watermark {
            source: SCRAPE_NEW_DATA.to_owned(),
            last_seen: position.into_string(),
        });
        let inserted =
            store::insert_advancing(self.store.as_ref(), &fresh, watermark.as_ref()).await?;
        metrics::counter!(TASK_ROWS_INSERTED, "kind" => SCRAPE_NEW_DATA).increment(inserted);

        Ok(ScrapeReport {
            read: rows.len(),
            newer,
            inserted,
            last_seen: watermark.map(|watermark| watermark.last_seen),
        })
    }
}

#[async_trait]
impl<S: RecordStore> DeliveryHandler for TaskHandler<S> {
    fn name(&self) -> &'static str {
        "tasks"
    }

    async fn handle(&self, body: &[u8]) -> Disposition {
        let message = match TaskMessage::decode(body) {
            Ok(message) => message,
            Err(e) => {
                warn!("rejecting malformed task: {}", e);
                return Disposition::Reject;
            }
        };

        match self.run(&message).await {
            Ok(report) => {
                info!(
                    kind = %message.kind,
                    read = report.read,
                    newer = report.newer,
                    inserted = report.inserted,
                    last_seen = report.last_seen.as_deref().unwrap_or(""),
                    "task complete"
                );
                Disposition::Stored
            }
            Err(e) if e.is_retryable() => {
                warn!(kind = %message.kind, "task failed, requeueing: {}", e);
                Disposition::Requeue
            }
            Err(e) => {
                warn!(kind = %message.kind, "rejecting task: {}", e);
                Disposition::Reject
            }
        }
    }
}
