//! # Consumer
//!
//! Settles deliveries from one queue, one at a time. What a delivery means is up to the
//! `DeliveryHandler`: `RecordHandler` applies published records to storage, and
//! `crate::tasks::TaskHandler` runs queued tasks.
//!
//! Delivery is at-least-once, so applying a record must be idempotent: a record whose
//! identity key is already stored is acknowledged without writing. Storage failures are
//! mapped to a disposition per delivery:
//!
//! * transient failures requeue the delivery so the broker hands it out again,
//! * anything that would fail the same way forever is rejected without requeue.
use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use ingest_common::broker::{Delivery, DeliverySource, DeliveryTag};
use ingest_common::envelope::RecordEnvelope;
use ingest_common::health::HealthHandle;
use ingest_common::metrics::CONSUMER_DELIVERIES;
use ingest_common::store::{self, RecordStore, StoreError};

use crate::error::WorkerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Written to storage. Ack.
    Stored,
    /// The identity key was already stored. Ack without writing.
    AlreadyStored,
    /// Might succeed later. Nack with requeue.
    Requeue,
    /// Can never succeed. Nack without requeue.
    Reject,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Stored => "stored",
            Disposition::AlreadyStored => "already_stored",
            Disposition::Requeue => "requeued",
            Disposition::Reject => "rejected",
        }
    }

    pub(crate) fn from_store_error(error: &StoreError) -> Self {
        match error {
            // A concurrent writer got there first: the record is stored either way.
            StoreError::Duplicate(_) => Disposition::AlreadyStored,
            error if error.is_transient() => Disposition::Requeue,
            _ => Disposition::Reject,
        }
    }
}

/// Decide what to do with one message body, writing the record if it is new.
pub async fn apply<S: RecordStore + ?Sized>(store: &S, body: &[u8]) -> Disposition {
    let envelope = match RecordEnvelope::decode(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("rejecting malformed payload: {}", e);
            return Disposition::Reject;
        }
    };
    let record = envelope.record;
    if let Err(e) = record.validate_for_storage() {
        warn!("rejecting incomplete record: {}", e);
        return Disposition::Reject;
    }

    // Only this record's key matters, so ask storage about that key alone, fresh each time.
    let keys: Vec<String> = record.identity_key().map(str::to_owned).into_iter().collect();
    let seen = match store::load_seen_keys_among(store, &keys).await {
        Ok(seen) => seen,
        Err(e) => {
            warn!("failed to check stored keys: {}", e);
            return Disposition::from_store_error(&e);
        }
    };

    let fresh = store::filter_new(vec![record], &seen);
    if fresh.is_empty() {
        return Disposition::AlreadyStored;
    }

    match store::insert(store, &fresh).await {
        Ok(_) => Disposition::Stored,
        Err(e) => {
            warn!("failed to store record: {}", e);
            Disposition::from_store_error(&e)
        }
    }
}

/// Decides the disposition of one message body.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    /// Label used in logs and metrics.
    fn name(&self) -> &'static str;

    async fn handle(&self, body: &[u8]) -> Disposition;
}

/// Applies published record envelopes to storage.
pub struct RecordHandler<S> {
    store: Arc<S>,
}

impl<S: RecordStore> RecordHandler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: RecordStore> DeliveryHandler for RecordHandler<S> {
    fn name(&self) -> &'static str {
        "records"
    }

    async fn handle(&self, body: &[u8]) -> Disposition {
        apply(self.store.as_ref(), body).await
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processed {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub disposition: Disposition,
}

pub struct Consumer<H, D> {
    handler: H,
    source: D,
    /// The interval for polling the queue when it is empty.
    poll_interval: time::Duration,
    /// How long to wait before reopening a failed channel.
    reconnect_delay: time::Duration,
    /// The liveness check handle, to call on a schedule to report healthy
    liveness: HealthHandle,
}

impl<H, D> Consumer<H, D>
where
    H: DeliveryHandler,
    D: DeliverySource,
{
    pub fn new(
        handler: H,
        source: D,
        poll_interval: time::Duration,
        reconnect_delay: time::Duration,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            handler,
            source,
            poll_interval,
            reconnect_delay,
            liveness,
        }
    }

    /// Consume forever. A failed channel is reopened after `reconnect_delay`.
    pub async fn run(&self) {
        loop {
            if let Err(e) = self.consume().await {
                error!(
                    handler = self.handler.name(),
                    "{}; reopening channel in {:?}",
                    e,
                    self.reconnect_delay
                );
                tokio::time::sleep(self.reconnect_delay).await;
            }
        }
    }

    /// One channel session: recover orphaned deliveries, then poll until the channel fails.
    async fn consume(&self) -> Result<(), WorkerError> {
        let recovered = self.source.recover().await?;
        if recovered > 0 {
            info!(
                handler = self.handler.name(),
                recovered,
                "returned unacknowledged deliveries to the queue"
            );
        }

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            self.liveness.report_healthy();

            while self.process_next().await?.is_some() {
                self.liveness.report_healthy();
            }
        }
    }

    /// Take the next delivery, if any, and settle it.
    pub async fn process_next(&self) -> Result<Option<Processed>, WorkerError> {
        let Some(delivery) = self.source.next_delivery().await? else {
            return Ok(None);
        };

        let processed = Processed {
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            disposition: self.handler.handle(&delivery.body).await,
        };
        self.settle(delivery, processed.disposition).await?;

        debug!(
            handler = self.handler.name(),
            delivery_tag = %processed.delivery_tag,
            redelivered = processed.redelivered,
            disposition = processed.disposition.as_str(),
            "settled delivery"
        );
        metrics::counter!(
            CONSUMER_DELIVERIES,
            "handler" => self.handler.name(),
            "disposition" => processed.disposition.as_str()
        )
        .increment(1);

        Ok(Some(processed))
    }

    async fn settle(&self, delivery: Delivery, disposition: Disposition) -> Result<(), WorkerError> {
        match disposition {
            Disposition::Stored | Disposition::AlreadyStored => self.source.ack(delivery).await?,
            Disposition::Requeue => self.source.nack(delivery, true).await?,
            Disposition::Reject => self.source.nack(delivery, false).await?,
        }
        Ok(())
    }
}
