//! # Pipeline
//!
//! The pull pipeline: `fetch -> clean -> persist`, run strictly in order.
//!
//! Each stage sits behind a trait so tests (and other scrapers) can substitute their own.
//! The runner stops at the first failing stage and reports which one failed. It never
//! retries and never compensates: rows persisted before a failure stay persisted.
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use ingest_common::record::{Record, RecordError};
use ingest_common::source::{self, SourceError};
use ingest_common::store::{self, RecordStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fetch,
    Clean,
    Persist,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let stage = match self {
            Stage::Fetch => "fetch",
            Stage::Clean => "clean",
            Stage::Persist => "persist",
        };
        f.write_str(stage)
    }
}

/// Enumeration of errors raised inside a single stage.
#[derive(Error, Debug)]
pub enum StageError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("row {index} is invalid: {error}")]
    InvalidRow { index: usize, error: RecordError },
    #[error(transparent)]
    StoreError(#[from] StoreError),
    #[error("{0}")]
    Other(String),
}

/// A stage failure, tagged with the stage that raised it.
#[derive(Error, Debug)]
#[error("{stage} stage failed: {source}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl PipelineError {
    pub fn is_transient(&self) -> bool {
        matches!(&self.source, StageError::StoreError(error) if error.is_transient())
    }
}

/// Parameters for one pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullParams {
    /// Upper bound on rows taken from the source. `None` takes everything.
    pub target_rows: Option<usize>,
}

/// What a successful run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineReport {
    pub fetched: usize,
    pub cleaned: usize,
    pub inserted: u64,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, params: &PullParams) -> Result<Vec<Value>, StageError>;
}

#[async_trait]
pub trait Cleaner: Send + Sync {
    async fn clean(&self, raw: Vec<Value>) -> Result<Vec<Record>, StageError>;
}

#[async_trait]
pub trait Persister: Send + Sync {
    /// Persist `records`, returning how many rows were actually inserted.
    async fn persist(&self, records: Vec<Record>) -> Result<u64, StageError>;
}

/// The three stages of a pull, in execution order.
#[derive(Clone)]
pub struct Pipeline {
    fetcher: Arc<dyn Fetcher>,
    cleaner: Arc<dyn Cleaner>,
    persister: Arc<dyn Persister>,
}

impl Pipeline {
    pub fn new(
        fetcher: impl Fetcher + 'static,
        cleaner: impl Cleaner + 'static,
        persister: impl Persister + 'static,
    ) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            cleaner: Arc::new(cleaner),
            persister: Arc::new(persister),
        }
    }

    pub async fn run(&self, params: &PullParams) -> Result<PipelineReport, PipelineError> {
        let raw = self
            .fetcher
            .fetch(params)
            .await
            .map_err(|source| PipelineError {
                stage: Stage::Fetch,
                source,
            })?;
        let fetched = raw.len();
        debug!(fetched, "fetch stage complete");

        let records = self.cleaner.clean(raw).await.map_err(|source| PipelineError {
            stage: Stage::Clean,
            source,
        })?;
        let cleaned = records.len();
        debug!(cleaned, "clean stage complete");

        let inserted = self
            .persister
            .persist(records)
            .await
            .map_err(|source| PipelineError {
                stage: Stage::Persist,
                source,
            })?;
        info!(fetched, cleaned, inserted, "pipeline complete");

        Ok(PipelineReport {
            fetched,
            cleaned,
            inserted,
        })
    }
}

/// Reads the scraper output: a JSON array, or JSON Lines.
pub struct JsonFileFetcher {
    path: PathBuf,
}

impl JsonFileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl Fetcher for JsonFileFetcher {
    async fn fetch(&self, params: &PullParams) -> Result<Vec<Value>, StageError> {
        let mut rows = source::read_rows(&self.path).await?;
        if let Some(target) = params.target_rows {
            rows.truncate(target);
        }
        Ok(rows)
    }
}

/// Normalizes raw scraper rows into `Record`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapedRecordCleaner;

#[async_trait]
impl Cleaner for ScrapedRecordCleaner {
    async fn clean(&self, raw: Vec<Value>) -> Result<Vec<Record>, StageError> {
        raw.iter()
            .enumerate()
            .map(|(index, row)| {
                Record::from_scraped(row).map_err(|error| StageError::InvalidRow { index, error })
            })
            .collect()
    }
}

/// Drops already stored identity keys, then inserts the rest in one call.
///
/// The consumer writes to the same table while a pull runs. When it stores one of the
/// pulled keys between the key load and the insert, the insert is retried once against
/// freshly loaded keys.
pub struct StorePersister<S> {
    store: Arc<S>,
}

impl<S: RecordStore> StorePersister<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: RecordStore + 'static> Persister for StorePersister<S> {
    async fn persist(&self, records: Vec<Record>) -> Result<u64, StageError> {
        let seen = store::load_seen_keys(self.store.as_ref()).await?;
        let fresh = store::filter_new(records, &seen);
        debug!(seen = seen.len(), fresh = fresh.len(), "filtered stored keys");

        match store::insert(self.store.as_ref(), &fresh).await {
            Err(StoreError::Duplicate(key)) => {
                warn!(%key, "key stored concurrently during pull, retrying with fresh keys");
                let seen = store::load_seen_keys(self.store.as_ref()).await?;
                let fresh = store::filter_new(fresh, &seen);
                Ok(store::insert(self.store.as_ref(), &fresh).await?)
            }
            result => Ok(result?),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;

    use super::*;
    use ingest_common::memory::MemoryStore;
    use ingest_common::watermark::Watermark;

    struct StaticFetcher(Vec<Value>);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _params: &PullParams) -> Result<Vec<Value>, StageError> {
            Ok(self.0.clone())
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl Fetcher for FailingFetcher {
        async fn fetch(&self, _params: &PullParams) -> Result<Vec<Value>, StageError> {
            Err(StageError::Other("scraper unreachable".to_owned()))
        }
    }

    /// Records whether it ran, to check short-circuiting.
    #[derive(Clone, Default)]
    struct SpyPersister(Arc<AtomicBool>);

    #[async_trait]
    impl Persister for SpyPersister {
        async fn persist(&self, records: Vec<Record>) -> Result<u64, StageError> {
            self.0.store(true, Ordering::SeqCst);
            Ok(records.len() as u64)
        }
    }

    const PARAMS: PullParams = PullParams { target_rows: None };

    fn row(url: &str) -> Value {
        json!({"url": url, "program": "Computer Science", "applicant_status": "Accepted"})
    }

    #[tokio::test]
    async fn test_runs_stages_in_order() {
        let store = Arc::new(MemoryStore::default());
        let pipeline = Pipeline::new(
            StaticFetcher(vec![
                row("https://example.com/result/1"),
                row("https://example.com/result/2"),
                row("https://example.com/result/1"),
            ]),
            ScrapedRecordCleaner,
            StorePersister::new(store.clone()),
        );

        let report = pipeline.run(&PARAMS).await.unwrap();

        assert_eq!(
            report,
            PipelineReport {
                fetched: 3,
                cleaned: 3,
                inserted: 2
            }
        );
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_stops_at_first_failing_stage() {
        let persisted = SpyPersister::default();
        let pipeline = Pipeline::new(FailingFetcher, ScrapedRecordCleaner, persisted.clone());

        let error = pipeline.run(&PARAMS).await.unwrap_err();

        assert_eq!(error.stage, Stage::Fetch);
        assert_eq!(
            error.to_string(),
            "fetch stage failed: scraper unreachable"
        );
        assert!(!persisted.0.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_clean_failure_names_the_row() {
        let persisted = SpyPersister::default();
        let pipeline = Pipeline::new(
            StaticFetcher(vec![row("https://example.com/result/1"), json!("oops")]),
            ScrapedRecordCleaner,
            persisted.clone(),
        );

        let error = pipeline.run(&PARAMS).await.unwrap_err();

        assert_eq!(error.stage, Stage::Clean);
        assert!(matches!(
            error.source,
            StageError::InvalidRow { index: 1, .. }
        ));
        assert!(!persisted.0.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_transient_store_failure_is_a_persist_failure() {
        let store = Arc::new(MemoryStore::default());
        store.set_unavailable(true);
        let pipeline = Pipeline::new(
            StaticFetcher(vec![row("https://example.com/result/1")]),
            ScrapedRecordCleaner,
            StorePersister::new(store),
        );

        let error = pipeline.run(&PARAMS).await.unwrap_err();

        assert_eq!(error.stage, Stage::Persist);
        assert!(error.is_transient());
    }

    /// Serves an empty key set on the first load, as if the consumer stored a key right
    /// after the pull read the table.
    struct StaleFirstLoad {
        inner: MemoryStore,
        stale: AtomicBool,
    }

    #[async_trait]
    impl RecordStore for StaleFirstLoad {
        async fn existing_keys(&self) -> Result<HashSet<String>, StoreError> {
            if self.stale.swap(false, Ordering::SeqCst) {
                return Ok(HashSet::new());
            }
            self.inner.existing_keys().await
        }

        async fn existing_keys_among(
            &self,
            keys: &[String],
        ) -> Result<HashSet<String>, StoreError> {
            self.inner.existing_keys_among(keys).await
        }

        async fn insert_records(&self, records: &[Record]) -> Result<u64, StoreError> {
            self.inner.insert_records(records).await
        }

        async fn last_seen(&self, source: &str) -> Result<Option<String>, StoreError> {
            self.inner.last_seen(source).await
        }

        async fn insert_records_advancing(
            &self,
            records: &[Record],
            watermark: &Watermark,
        ) -> Result<u64, StoreError> {
            self.inner.insert_records_advancing(records, watermark).await
        }
    }

    #[tokio::test]
    async fn test_key_stored_concurrently_is_skipped_on_retry() {
        let inner = MemoryStore::default();
        let stored_by_consumer =
            Record::from_scraped(&row("https://example.com/result/1")).unwrap();
        inner.insert_records(&[stored_by_consumer]).await.unwrap();
        let store = Arc::new(StaleFirstLoad {
            inner: inner.clone(),
            stale: AtomicBool::new(true),
        });
        let pipeline = Pipeline::new(
            StaticFetcher(vec![
                row("https://example.com/result/1"),
                row("https://example.com/result/2"),
            ]),
            ScrapedRecordCleaner,
            StorePersister::new(store),
        );

        let report = pipeline.run(&PARAMS).await.unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(inner.len(), 2);
    }

    #[tokio::test]
    async fn test_file_fetcher() {
        let dir = std::env::temp_dir().join(format!("ingest-api-{}", uuid::Uuid::now_v7()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let path = dir.join("applicant_data.json");
        tokio::fs::write(&path, "{\"url\": \"a\"}\n{\"url\": \"b\"}\n{\"url\": \"c\"}\n")
            .await
            .unwrap();

        let fetcher = JsonFileFetcher::new(&path);
        let rows = fetcher
            .fetch(&PullParams {
                target_rows: Some(2),
            })
            .await
            .unwrap();
        assert_eq!(rows, vec![json!({"url": "a"}), json!({"url": "b"})]);

        let missing = JsonFileFetcher::new(dir.join("missing.json"));
        assert!(matches!(
            missing.fetch(&PARAMS).await,
            Err(StageError::Source(SourceError::ReadError { .. }))
        ));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
