//! # Store
//!
//! Identity-key deduplication in front of the `applicants` table.
//!
//! A `SeenKeySet` is always rebuilt from storage when needed and never cached across
//! runs: the pipeline and the consumer write to the same table concurrently, and a stale
//! set would make a writer skip a key that was never actually stored.
use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use thiserror::Error;

use crate::record::Record;
use crate::watermark::Watermark;

/// Enumeration of errors for operations against the record store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Connection, pool and timeout class failures. Trying again later may succeed.
    #[error("transient storage failure during {command}: {error}")]
    Transient { command: String, error: String },
    /// The store refused the data itself. Retrying the same data will fail the same way.
    #[error("storage rejected {command}: {error}")]
    Rejected { command: String, error: String },
    /// A concurrent writer stored the same identity key first.
    #[error("identity key already stored: {0}")]
    Duplicate(String),
    #[error("required table {0} is missing")]
    MissingTable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }

    /// Classify a sqlx error by its SQLSTATE class.
    fn from_sqlx(command: &str, error: sqlx::Error) -> Self {
        let transient = match &error {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db_error) => {
                let code = db_error.code().unwrap_or_default();
                if db_error.is_unique_violation() {
                    return StoreError::Duplicate(db_error.message().to_owned());
                }
                // 08: connection exception, 40: transaction rollback, 53: insufficient resources,
                // 57P: operator intervention (admin shutdown, cannot connect now).
                code.starts_with("08")
                    || code.starts_with("40")
                    || code.starts_with("53")
                    || code.starts_with("57P")
            }
            _ => false,
        };

        if transient {
            StoreError::Transient {
                command: command.to_owned(),
                error: error.to_string(),
            }
        } else {
            StoreError::Rejected {
                command: command.to_owned(),
                error: error.to_string(),
            }
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// The relational store behind the dedup accessor.
/// Implementations acquire a connection per call and release it before returning.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Return every identity key currently stored.
    async fn existing_keys(&self) -> StoreResult<HashSet<String>>;

    /// Return which of `keys` are currently stored.
    async fn existing_keys_among(&self, keys: &[String]) -> StoreResult<HashSet<String>>;

    /// Insert all `records` or none of them.
    async fn insert_records(&self, records: &[Record]) -> StoreResult<u64>;

    /// Return the stored watermark position of `source`, if any.
    async fn last_seen(&self, source: &str) -> StoreResult<Option<String>>;

    /// Insert all `records` and move `watermark` forward, or do neither.
    async fn insert_records_advancing(
        &self,
        records: &[Record],
        watermark: &Watermark,
    ) -> StoreResult<u64>;
}

/// Identity keys already present in storage, scoped to one pipeline run or one delivery.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SeenKeySet(HashSet<String>);

impl SeenKeySet {
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<HashSet<String>> for SeenKeySet {
    fn from(keys: HashSet<String>) -> Self {
        Self(keys)
    }
}

impl<S: Into<String>> FromIterator<S> for SeenKeySet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Query storage for all existing identity keys.
pub async fn load_seen_keys<S: RecordStore + ?Sized>(store: &S) -> StoreResult<SeenKeySet> {
    Ok(SeenKeySet(store.existing_keys().await?))
}

/// Query storage for the subset of `keys` already present.
pub async fn load_seen_keys_among<S: RecordStore + ?Sized>(
    store: &S,
    keys: &[String],
) -> StoreResult<SeenKeySet> {
    if keys.is_empty() {
        return Ok(SeenKeySet::default());
    }
    Ok(SeenKeySet(store.existing_keys_among(keys).await?))
}

/// Keep the records whose identity key is not in `seen`, in input order.
///
/// Keyless records always pass through. Within the batch the first occurrence of a key wins:
/// keys emitted earlier in the batch count as seen for the records after them.
pub fn filter_new(records: Vec<Record>, seen: &SeenKeySet) -> Vec<Record> {
    let mut emitted: HashSet<String> = HashSet::new();

    records
        .into_iter()
        .filter(|record| match record.identity_key() {
            None => true,
            Some(key) => !seen.contains(key) && emitted.insert(key.to_owned()),
        })
        .collect()
}

/// Bulk insert. The whole call succeeds or fails as one unit.
pub async fn insert<S: RecordStore + ?Sized>(store: &S, records: &[Record]) -> StoreResult<u64> {
    if records.is_empty() {
        return Ok(0);
    }
    store.insert_records(records).await
}

/// Bulk insert that also records how far the source has been ingested.
/// Without a watermark this is a plain `insert`.
pub async fn insert_advancing<S: RecordStore + ?Sized>(
    store: &S,
    records: &[Record],
    watermark: Option<&Watermark>,
) -> StoreResult<u64> {
    match watermark {
        Some(watermark) => store.insert_records_advancing(records, watermark).await,
        None => insert(store, records).await,
    }
}

const INSERT_COLUMNS: &str = "INSERT INTO applicants (program, comments, date_added, url, status, term, us_or_international, gpa, gre, gre_v, gre_aw, degree, llm_generated_program, llm_generated_university) ";

/// A `RecordStore` on top of the `applicants` table in PostgreSQL.
#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
    /// Page size used when reading existing keys.
    query_limit: i64,
    /// Rows per INSERT statement. All statements of one call share a transaction.
    insert_batch_size: usize,
}

impl PgRecordStore {
    /// Build a store with a lazily connecting pool; connections are opened on first use.
    pub fn new(
        url: &str,
        max_connections: u32,
        query_limit: u32,
        insert_batch_size: usize,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(|error| StoreError::from_sqlx("CONNECT", error))?;

        Ok(Self::new_from_pool(pool, query_limit, insert_batch_size))
    }

    pub fn new_from_pool(pool: PgPool, query_limit: u32, insert_batch_size: usize) -> Self {
        Self {
            pool,
            query_limit: i64::from(query_limit.max(1)),
            insert_batch_size: insert_batch_size.max(1),
        }
    }

    /// Fail unless the `applicants` table exists. The table is provisioned out of band.
    pub async fn verify_table(&self) -> StoreResult<()> {
        let found: Option<String> = sqlx::query_scalar("SELECT to_regclass($1)::text")
            .bind("public.applicants")
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::from_sqlx("SELECT", error))?;

        match found {
            Some(_) => Ok(()),
            None => Err(StoreError::MissingTable("public.applicants".to_owned())),
        }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn existing_keys(&self) -> StoreResult<HashSet<String>> {
        let base_query = r#"
SELECT
    url
FROM
    applicants
WHERE
    url IS NOT NULL
    AND btrim(url) <> ''
ORDER BY
    p_id
LIMIT $1
OFFSET $2
        "#;

        let mut keys = HashSet::new();
        let mut offset = 0;

        loop {
            let page: Vec<String> = sqlx::query_scalar(base_query)
                .bind(self.query_limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await
                .map_err(|error| StoreError::from_sqlx("SELECT", error))?;

            let page_len = page.len() as i64;
            keys.extend(page);

            if page_len < self.query_limit {
                break;
            }
            offset += self.query_limit;
        }

        Ok(keys)
    }

    async fn existing_keys_among(&self, keys: &[String]) -> StoreResult<HashSet<String>> {
        let base_query = r#"
SELECT
    url
FROM
    applicants
WHERE
    url = ANY($1)
        "#;

        let found: Vec<String> = sqlx::query_scalar(base_query)
            .bind(keys)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::from_sqlx("SELECT", error))?;

        Ok(found.into_iter().collect())
    }

    async fn insert_records(&self, records: &[Record]) -> StoreResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::from_sqlx("BEGIN", error))?;

        let inserted = self.insert_chunks(&mut tx, records).await?;

        tx.commit()
            .await
            .map_err(|error| StoreError::from_sqlx("COMMIT", error))?;

        Ok(inserted)
    }

    async fn last_seen(&self, source: &str) -> StoreResult<Option<String>> {
        let found: Option<Option<String>> =
            sqlx::query_scalar("SELECT last_seen FROM ingestion_watermarks WHERE source = $1")
                .bind(source)
                .fetch_optional(&self.pool)
                .await
                .map_err(|error| StoreError::from_sqlx("SELECT", error))?;

        Ok(found.flatten())
    }

    async fn insert_records_advancing(
        &self,
        records: &[Record],
        watermark: &Watermark,
    ) -> StoreResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|error| StoreError::from_sqlx("BEGIN", error))?;

        let inserted = self.insert_chunks(&mut tx, records).await?;

        // Last write of the transaction: the watermark never covers rows that were not committed.
        let upsert = r#"
INSERT INTO ingestion_watermarks
    (source, last_seen)
VALUES
    ($1, $2)
ON CONFLICT (source) DO UPDATE
SET
    last_seen = EXCLUDED.last_seen,
    updated_at = NOW()
        "#;
        sqlx::query(upsert)
            .bind(&watermark.source)
            .bind(&watermark.last_seen)
            .execute(&mut *tx)
            .await
            .map_err(|error| StoreError::from_sqlx("UPSERT", error))?;

        tx.commit()
            .await
            .map_err(|error| StoreError::from_sqlx("COMMIT", error))?;

        Ok(inserted)
    }
}

impl PgRecordStore {
    async fn insert_chunks(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        records: &[Record],
    ) -> StoreResult<u64> {
        let mut inserted = 0;
        for chunk in records.chunks(self.insert_batch_size) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(INSERT_COLUMNS);
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(&record.program)
                    .push_bind(&record.comments)
                    .push_bind(record.date_added)
                    .push_bind(&record.url)
                    .push_bind(&record.status)
                    .push_bind(&record.term)
                    .push_bind(&record.us_or_international)
                    .push_bind(record.gpa)
                    .push_bind(record.gre)
                    .push_bind(record.gre_v)
                    .push_bind(record.gre_aw)
                    .push_bind(record.degree)
                    .push_bind(&record.llm_generated_program)
                    .push_bind(&record.llm_generated_university);
            });

            // An error drops the transaction, which rolls back every chunk written so far.
            let result = builder
                .build()
                .execute(&mut **tx)
                .await
                .map_err(|error| StoreError::from_sqlx("INSERT", error))?;
            inserted += result.rows_affected();
        }

        Ok(inserted)
    }
}
