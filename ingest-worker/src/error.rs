use ingest_common::broker::BrokerError;
use ingest_common::record::RecordError;
use ingest_common::source::SourceError;
use ingest_common::store::StoreError;
use ingest_common::task::TaskError;
use thiserror::Error;

/// Enumeration of errors that end a consuming session.
/// Storage failures never show up here: they become an ack or nack decision per delivery.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("broker channel failed: {0}")]
    BrokerError(#[from] BrokerError),
}

/// Enumeration of errors that fail one queued task.
#[derive(Error, Debug)]
pub enum TaskRunError {
    #[error(transparent)]
    Task(#[from] TaskError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("row {index} is invalid: {error}")]
    InvalidRow { index: usize, error: RecordError },
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskRunError {
    /// Whether running the same task again may succeed.
    ///
    /// A duplicate key means another writer stored one of the rows after they were filtered.
    /// The next attempt filters against fresh keys, so it counts as retryable here.
    pub fn is_retryable(&self) -> bool {
        match self {
            TaskRunError::Store(error) => {
                error.is_transient() || matches!(error, StoreError::Duplicate(_))
            }
            _ => false,
        }
    }
}
