//! In-memory implementations of the store and broker traits, for tests.
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::broker::{
    BrokerError, BrokerPublisher, BrokerResult, Delivery, DeliverySource, DeliveryTag,
    OutgoingMessage, Topology,
};
use crate::record::Record;
use crate::store::{RecordStore, StoreError, StoreResult};
use crate::watermark::Watermark;

/// A `RecordStore` holding rows in a shared vector.
/// Enforces identity-key uniqueness the way the unique index on `applicants.url` does.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<Mutex<Vec<Record>>>,
    unavailable: Arc<AtomicBool>,
    /// Errors returned by the next inserts, oldest first.
    insert_failures: Arc<Mutex<VecDeque<StoreError>>>,
    watermarks: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStore {
    /// While unavailable every call fails with a transient error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next `count` inserts fail with a transient error.
    pub fn fail_next_inserts(&self, count: usize) {
        for _ in 0..count {
            self.fail_next_insert_with(StoreError::Transient {
                command: "INSERT".to_owned(),
                error: "connection reset by peer".to_owned(),
            });
        }
    }

    /// Queue `error` for the first insert without an earlier queued failure. Nothing is written.
    pub fn fail_next_insert_with(&self, error: StoreError) {
        self.insert_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    pub fn len(&self) -> usize {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rows(&self) -> Vec<Record> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn check_available(&self, command: &str) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Transient {
                command: command.to_owned(),
                error: "connection refused".to_owned(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn existing_keys(&self) -> StoreResult<HashSet<String>> {
        self.check_available("SELECT")?;
        let rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(rows
            .iter()
            .filter_map(|row| row.identity_key().map(str::to_owned))
            .collect())
    }

    async fn existing_keys_among(&self, keys: &[String]) -> StoreResult<HashSet<String>> {
        let all = self.existing_keys().await?;
        Ok(keys.iter().filter(|key| all.contains(*key)).cloned().collect())
    }

    async fn insert_records(&self, records: &[Record]) -> StoreResult<u64> {
        self.write(records, None)
    }

    async fn last_seen(&self, source: &str) -> StoreResult<Option<String>> {
        self.check_available("SELECT")?;
        let watermarks = self.watermarks.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(watermarks.get(source).cloned())
    }

    async fn insert_records_advancing(
        &self,
        records: &[Record],
        watermark: &Watermark,
    ) -> StoreResult<u64> {
        self.write(records, Some(watermark))
    }
}

impl MemoryStore {
    /// Apply rows and watermark under both locks so readers see both or neither.
    fn write(&self, records: &[Record], watermark: Option<&Watermark>) -> StoreResult<u64> {
        self.check_available("INSERT")?;
        let injected = self
            .insert_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = injected {
            return Err(error);
        }

        let mut rows = self.rows.lock().unwrap_or_else(PoisonError::into_inner);
        let mut watermarks = self.watermarks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: HashSet<String> = rows
            .iter()
            .filter_map(|row| row.identity_key().map(str::to_owned))
            .collect();

        for record in records {
            if let Some(key) = record.identity_key() {
                if !keys.insert(key.to_owned()) {
                    return Err(StoreError::Duplicate(key.to_owned()));
                }
            }
        }

        rows.extend_from_slice(records);
        if let Some(watermark) = watermark {
            watermarks.insert(watermark.source.clone(), watermark.last_seen.clone());
        }
        Ok(records.len() as u64)
    }
}

#[derive(Debug)]
struct StoredMessage {
    tag: DeliveryTag,
    redelivered: bool,
    body: Vec<u8>,
    content_type: String,
}

#[derive(Default)]
struct BrokerState {
    bindings: HashSet<Topology>,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    /// Outstanding deliveries by tag, with the queue they came from and the consumer holding them.
    unacked: HashMap<DeliveryTag, (String, String, StoredMessage)>,
    dead: Vec<Vec<u8>>,
    next_tag: i64,
}

/// A broker living in process memory. Clones share the same queues.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryBroker {
    fn lock_state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// While unavailable, publishing fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn channel(&self, queue: &str, consumer_tag: &str, prefetch: usize) -> MemoryChannel {
        MemoryChannel {
            broker: self.clone(),
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            prefetch: prefetch.max(1),
        }
    }

    /// Number of messages ready for delivery on `queue`.
    pub fn ready(&self, queue: &str) -> usize {
        let state = self.lock_state();
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn unacked(&self) -> usize {
        self.lock_state().unacked.len()
    }

    /// Bodies of every dead-lettered message, oldest first.
    pub fn dead_letters(&self) -> Vec<Vec<u8>> {
        self.lock_state().dead.clone()
    }

    /// Bodies of messages ready on `queue`, oldest first.
    pub fn peek(&self, queue: &str) -> Vec<Vec<u8>> {
        let state = self.lock_state();
        state
            .queues
            .get(queue)
            .map(|messages| messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BrokerPublisher for MemoryBroker {
    async fn declare(&self, topology: &Topology) -> BrokerResult<()> {
        let mut state = self.lock_state();
        state.queues.entry(topology.queue.clone()).or_default();
        state.bindings.insert(topology.clone());
        Ok(())
    }

    async fn publish(&self, message: OutgoingMessage) -> BrokerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable("connection refused".to_owned()));
        }

        let mut state = self.lock_state();
        let queues: Vec<String> = state
            .bindings
            .iter()
            .filter(|b| b.exchange == message.exchange && b.routing_key == message.routing_key)
            .map(|b| b.queue.clone())
            .collect();

        if queues.is_empty() {
            return Err(BrokerError::Unroutable {
                exchange: message.exchange,
                routing_key: message.routing_key,
            });
        }

        for queue in queues {
            state.next_tag += 1;
            let stored = StoredMessage {
                tag: DeliveryTag(state.next_tag),
                redelivered: false,
                body: message.body.clone(),
                content_type: message.content_type.clone(),
            };
            state.queues.entry(queue).or_default().push_back(stored);
        }
        Ok(())
    }
}

pub struct MemoryChannel {
    broker: MemoryBroker,
    queue: String,
    consumer_tag: String,
    prefetch: usize,
}

impl MemoryChannel {
    fn take_unacked(&self, tag: DeliveryTag) -> BrokerResult<StoredMessage> {
        let mut state = self.broker.lock_state();
        match state.unacked.remove(&tag) {
            Some((queue, consumer, message)) if queue == self.queue && consumer == self.consumer_tag => {
                Ok(message)
            }
            Some(entry) => {
                state.unacked.insert(tag, entry);
                Err(BrokerError::UnknownDelivery(tag))
            }
            None => Err(BrokerError::UnknownDelivery(tag)),
        }
    }

    fn requeue(&self, mut message: StoredMessage) {
        message.redelivered = true;
        let mut state = self.broker.lock_state();
        let queue = state.queues.entry(self.queue.clone()).or_default();
        // Requeued messages go back in tag order, ahead of anything published later.
        let position = queue
            .iter()
            .position(|m| m.tag.0 > message.tag.0)
            .unwrap_or(queue.len());
        queue.insert(position, message);
    }
}

#[async_trait]
impl DeliverySource for MemoryChannel {
    async fn next_delivery(&self) -> BrokerResult<Option<Delivery>> {
        let mut state = self.broker.lock_state();
        let in_flight = state
            .unacked
            .values()
            .filter(|(queue, consumer, _)| *queue == self.queue && *consumer == self.consumer_tag)
            .count();
        if in_flight >= self.prefetch {
            return Ok(None);
        }

        let Some(message) = state
            .queues
            .get_mut(&self.queue)
            .and_then(VecDeque::pop_front)
        else {
            return Ok(None);
        };

        let delivery = Delivery {
            delivery_tag: message.tag,
            redelivered: message.redelivered,
            body: message.body.clone(),
            content_type: message.content_type.clone(),
        };
        state.unacked.insert(
            message.tag,
            (self.queue.clone(), self.consumer_tag.clone(), message),
        );
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: Delivery) -> BrokerResult<()> {
        self.take_unacked(delivery.delivery_tag).map(|_| ())
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> BrokerResult<()> {
        let message = self.take_unacked(delivery.delivery_tag)?;
        if requeue {
            self.requeue(message);
        } else {
            self.broker.lock_state().dead.push(message.body);
        }
        Ok(())
    }

    async fn recover(&self) -> BrokerResult<u64> {
        let orphans: Vec<StoredMessage> = {
            let mut state = self.broker.lock_state();
            let tags: Vec<DeliveryTag> = state
                .unacked
                .iter()
                .filter(|(_, (queue, consumer, _))| {
                    *queue == self.queue && *consumer == self.consumer_tag
                })
                .map(|(tag, _)| *tag)
                .collect();
            tags.into_iter()
                .filter_map(|tag| state.unacked.remove(&tag).map(|(_, _, m)| m))
                .collect()
        };

        let recovered = orphans.len() as u64;
        for message in orphans {
            self.requeue(message);
        }
        Ok(recovered)
    }
}
