//! # Publisher
//!
//! Validates records and hands them to the broker as persistent messages, and queues task
//! requests for the worker on a separate exchange.
//! `publish` and `publish_task` only return `Ok` once the broker has durably accepted the message.
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use ingest_common::broker::{BrokerError, BrokerPublisher, DeliveryMode, OutgoingMessage, Topology};
use ingest_common::envelope::{RecordEnvelope, CONTENT_TYPE};
use ingest_common::metrics::{RECORDS_PUBLISHED, TASKS_QUEUED};
use ingest_common::record::{Record, RecordError};
use ingest_common::task::TaskMessage;

pub const SOURCE: &str = "web-api";

#[derive(Error, Debug)]
pub enum PublishError {
    /// The record is unusable. The broker was not contacted.
    #[error("invalid record: {0}")]
    Invalid(#[from] RecordError),
    #[error("failed to encode message: {0}")]
    EncodeError(#[from] serde_json::Error),
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

pub struct Publisher {
    broker: Arc<dyn BrokerPublisher>,
    topology: Topology,
    task_topology: Topology,
    declared: OnceCell<()>,
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn BrokerPublisher>,
        topology: Topology,
        task_topology: Topology,
    ) -> Self {
        Self {
            broker,
            topology,
            task_topology,
            declared: OnceCell::new(),
        }
    }

    /// Declare the exchanges, queues and bindings for records and tasks.
    /// Runs once; a failure is retried on the next call.
    pub async fn declare(&self) -> Result<(), PublishError> {
        self.declared
            .get_or_try_init(|| async {
                for topology in [&self.topology, &self.task_topology] {
                    self.broker.declare(topology).await?;
                    info!(
                        exchange = %topology.exchange,
                        queue = %topology.queue,
                        routing_key = %topology.routing_key,
                        "declared broker topology"
                    );
                }
                Ok::<(), PublishError>(())
            })
            .await?;
        Ok(())
    }

    pub async fn publish(&self, record: Record) -> Result<RecordEnvelope, PublishError> {
        record.validate()?;
        self.declare().await?;

        let envelope = RecordEnvelope::new(SOURCE, record);
        let message = OutgoingMessage {
            exchange: self.topology.exchange.clone(),
            routing_key: self.topology.routing_key.clone(),
            body: envelope.to_bytes()?,
            content_type: CONTENT_TYPE.to_owned(),
            delivery_mode: DeliveryMode::Persistent,
        };

        self.broker.publish(message).await?;
        debug!(url = ?envelope.record.url, "published record");
        metrics::counter!(RECORDS_PUBLISHED).increment(1);

        Ok(envelope)
    }

    /// Queue a task of `kind` for the worker.
    pub async fn publish_task(
        &self,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<TaskMessage, PublishError> {
        self.declare().await?;

        let task = TaskMessage::new(kind, payload);
        let message = OutgoingMessage {
            exchange: self.task_topology.exchange.clone(),
            routing_key: self.task_topology.routing_key.clone(),
            body: task.to_bytes()?,
            content_type: CONTENT_TYPE.to_owned(),
            delivery_mode: DeliveryMode::Persistent,
        };

        self.broker.publish(message).await?;
        debug!(kind, "queued task");
        metrics::counter!(TASKS_QUEUED, "kind" => kind.to_owned()).increment(1);

        Ok(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_common::memory::MemoryBroker;

    fn topology() -> Topology {
        Topology {
            exchange: "applicant.events".to_owned(),
            queue: "applicant.ingest".to_owned(),
            routing_key: "applicant.created".to_owned(),
        }
    }

    fn task_topology() -> Topology {
        Topology {
            exchange: "tasks".to_owned(),
            queue: "tasks_q".to_owned(),
            routing_key: "tasks".to_owned(),
        }
    }

    fn publisher(broker: &MemoryBroker) -> Publisher {
        Publisher::new(Arc::new(broker.clone()), topology(), task_topology())
    }

    fn valid_record() -> Record {
        Record {
            url: Some("https://example.com/result/11".to_owned()),
            program: Some("Statistics".to_owned()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_wraps_record_in_envelope() {
        let broker = MemoryBroker::default();
        let publisher = publisher(&broker);

        let envelope = publisher.publish(valid_record()).await.unwrap();

        assert_eq!(envelope.event_type, "applicant.created");
        assert_eq!(envelope.source, "web-api");
        let queued = broker.peek("applicant.ingest");
        assert_eq!(queued.len(), 1);
        assert_eq!(RecordEnvelope::decode(&queued[0]).unwrap(), envelope);
    }

    #[tokio::test]
    async fn test_invalid_record_never_reaches_broker() {
        let broker = MemoryBroker::default();
        let publisher = publisher(&broker);

        let keyless = Record {
            program: Some("Statistics".to_owned()),
            ..Default::default()
        };
        let error = publisher.publish(keyless).await.unwrap_err();

        assert!(matches!(
            error,
            PublishError::Invalid(RecordError::MissingIdentityKey)
        ));
        assert_eq!(broker.ready("applicant.ingest"), 0);
    }

    #[tokio::test]
    async fn test_broker_failure_is_reported() {
        let broker = MemoryBroker::default();
        broker.set_unavailable(true);
        let publisher = publisher(&broker);

        let error = publisher.publish(valid_record()).await.unwrap_err();

        assert!(matches!(error, PublishError::Broker(_)));
    }

    #[tokio::test]
    async fn test_publish_task_goes_to_task_queue() {
        let broker = MemoryBroker::default();
        let publisher = publisher(&broker);

        let task = publisher
            .publish_task("scrape_new_data", serde_json::json!({}))
            .await
            .unwrap();

        assert_eq!(broker.ready("applicant.ingest"), 0);
        let queued = broker.peek("tasks_q");
        assert_eq!(queued.len(), 1);
        assert_eq!(TaskMessage::decode(&queued[0]).unwrap(), task);
        assert_eq!(task.kind, "scrape_new_data");
    }
}
