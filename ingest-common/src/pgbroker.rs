//! # PgBroker
//!
//! A durable broker implemented on top of PostgreSQL tables.
//!
//! Bindings live in `broker_bindings` and messages in `broker_messages`. Publishing copies a
//! message into every queue bound to the exchange with the message's routing key. Consumers
//! claim messages with `FOR UPDATE SKIP LOCKED`, so several consumers may share a queue
//! without ever being handed the same message.
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};

use crate::broker::{
    BrokerError, BrokerPublisher, BrokerResult, Delivery, DeliverySource, DeliveryTag,
    OutgoingMessage, Topology,
};

/// A message row as claimed by a consumer.
#[derive(sqlx::FromRow, Debug)]
struct MessageRow {
    id: i64,
    redelivered: bool,
    body: Vec<u8>,
    content_type: String,
}

/// A broker backed by a PostgreSQL connection pool.
#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
}

impl PgBroker {
    /// Initialize a new PgBroker by lazily connecting to the database in `url`.
    ///
    /// # Arguments
    ///
    /// * `url`: A URL pointing to where the PostgreSQL database is hosted.
    /// * `max_connections`: Upper bound for the connection pool.
    /// * `app_name`: Reported to PostgreSQL as `application_name`.
    pub fn new(url: &str, max_connections: u32, app_name: &'static str) -> BrokerResult<Self> {
        let options = PgConnectOptions::from_str(url)
            .map_err(|error| BrokerError::PoolCreationError { error })?
            .application_name(app_name);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy_with(options);

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a consuming channel on `queue`.
    /// The channel keeps its own handle on the pool for the rest of the process.
    pub fn channel(&self, queue: &str, consumer_tag: &str, prefetch: usize) -> PgChannel {
        PgChannel {
            pool: self.pool.clone(),
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            prefetch: prefetch.max(1),
            in_flight: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BrokerPublisher for PgBroker {
    async fn declare(&self, topology: &Topology) -> BrokerResult<()> {
        let base_query = r#"
INSERT INTO broker_bindings
    (exchange, queue, routing_key)
VALUES
    ($1, $2, $3)
ON CONFLICT DO NOTHING
        "#;

        sqlx::query(base_query)
            .bind(&topology.exchange)
            .bind(&topology.queue)
            .bind(&topology.routing_key)
            .execute(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(())
    }

    async fn publish(&self, message: OutgoingMessage) -> BrokerResult<()> {
        // A single statement routes to every bound queue; once it returns the rows are committed.
        let base_query = r#"
INSERT INTO broker_messages
    (queue, exchange, routing_key, body, content_type, persistent)
SELECT
    queue,
    exchange,
    routing_key,
    $3,
    $4,
    $5
FROM
    broker_bindings
WHERE
    exchange = $1
    AND routing_key = $2
        "#;

        let result = sqlx::query(base_query)
            .bind(&message.exchange)
            .bind(&message.routing_key)
            .bind(&message.body)
            .bind(&message.content_type)
            .bind(message.delivery_mode.is_persistent())
            .execute(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        if result.rows_affected() == 0 {
            return Err(BrokerError::Unroutable {
                exchange: message.exchange,
                routing_key: message.routing_key,
            });
        }

        Ok(())
    }
}

/// A consuming channel over one queue of a `PgBroker`.
pub struct PgChannel {
    pool: PgPool,
    queue: String,
    consumer_tag: String,
    prefetch: usize,
    in_flight: AtomicUsize,
}

impl PgChannel {
    fn settled(&self) {
        // Saturating: a stale ack after `recover` must not wrap the counter.
        _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

#[async_trait]
impl DeliverySource for PgChannel {
    async fn next_delivery(&self) -> BrokerResult<Option<Delivery>> {
        if self.in_flight.load(Ordering::SeqCst) >= self.prefetch {
            return Ok(None);
        }

        // The query that follows uses a FOR UPDATE SKIP LOCKED clause.
        // For more details on this see: 2ndquadrant.com/en/blog/what-is-select-skip-locked-for-in-postgresql-9-5.
        let base_query = r#"
WITH next_in_queue AS (
    SELECT
        id
    FROM
        broker_messages
    WHERE
        status = 'ready'
        AND queue = $1
    ORDER BY
        id
    LIMIT 1
    FOR UPDATE SKIP LOCKED
)
UPDATE
    broker_messages
SET
    status = 'unacked'::message_status,
    consumer_tag = $2,
    delivered_at = NOW(),
    delivery_count = broker_messages.delivery_count + 1
FROM
    next_in_queue
WHERE
    broker_messages.id = next_in_queue.id
RETURNING
    broker_messages.id,
    broker_messages.redelivered,
    broker_messages.body,
    broker_messages.content_type
        "#;

        let row: Option<MessageRow> = sqlx::query_as(base_query)
            .bind(&self.queue)
            .bind(&self.consumer_tag)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        Ok(row.map(|row| {
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            Delivery {
                delivery_tag: DeliveryTag(row.id),
                redelivered: row.redelivered,
                body: row.body,
                content_type: row.content_type,
            }
        }))
    }

    async fn ack(&self, delivery: Delivery) -> BrokerResult<()> {
        let base_query = r#"
DELETE FROM
    broker_messages
WHERE
    id = $1
    AND queue = $2
    AND consumer_tag = $3
    AND status = 'unacked'
        "#;

        let result = sqlx::query(base_query)
            .bind(delivery.delivery_tag.0)
            .bind(&self.queue)
            .bind(&self.consumer_tag)
            .execute(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;
        self.settled();

        if result.rows_affected() == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.delivery_tag));
        }
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, requeue: bool) -> BrokerResult<()> {
        let base_query = if requeue {
            r#"
UPDATE
    broker_messages
SET
    status = 'ready'::message_status,
    redelivered = TRUE,
    consumer_tag = NULL
WHERE
    id = $1
    AND queue = $2
    AND consumer_tag = $3
    AND status = 'unacked'
            "#
        } else {
            r#"
UPDATE
    broker_messages
SET
    status = 'dead'::message_status,
    dead_lettered_at = NOW(),
    consumer_tag = NULL
WHERE
    id = $1
    AND queue = $2
    AND consumer_tag = $3
    AND status = 'unacked'
            "#
        };

        let result = sqlx::query(base_query)
            .bind(delivery.delivery_tag.0)
            .bind(&self.queue)
            .bind(&self.consumer_tag)
            .execute(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;
        self.settled();

        if result.rows_affected() == 0 {
            return Err(BrokerError::UnknownDelivery(delivery.delivery_tag));
        }
        Ok(())
    }

    async fn recover(&self) -> BrokerResult<u64> {
        let base_query = r#"
UPDATE
    broker_messages
SET
    status = 'ready'::message_status,
    redelivered = TRUE,
    consumer_tag = NULL
WHERE
    queue = $1
    AND consumer_tag = $2
    AND status = 'unacked'
        "#;

        let result = sqlx::query(base_query)
            .bind(&self.queue)
            .bind(&self.consumer_tag)
            .execute(&self.pool)
            .await
            .map_err(|error| BrokerError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;
        self.in_flight.store(0, Ordering::SeqCst);

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DeliveryMode;

    fn topology(queue: &str) -> Topology {
        Topology {
            exchange: "applicant.events".to_owned(),
            queue: queue.to_owned(),
            routing_key: "applicant.created".to_owned(),
        }
    }

    fn message(body: &str) -> OutgoingMessage {
        OutgoingMessage {
            exchange: "applicant.events".to_owned(),
            routing_key: "applicant.created".to_owned(),
            body: body.as_bytes().to_vec(),
            content_type: "application/json".to_owned(),
            delivery_mode: DeliveryMode::Persistent,
        }
    }

    async fn count(pool: &PgPool, status: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM broker_messages WHERE status::text = $1")
            .bind(status)
            .fetch_one(pool)
            .await
            .expect("failed to count messages")
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_publish_without_binding_is_unroutable(db: PgPool) {
        let broker = PgBroker::new_from_pool(db);

        let error = broker.publish(message("{}")).await.unwrap_err();

        assert!(matches!(error, BrokerError::Unroutable { .. }));
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_prefetch_window_and_ack(db: PgPool) {
        let broker = PgBroker::new_from_pool(db.clone());
        broker.declare(&topology("ingest")).await.unwrap();
        broker.declare(&topology("ingest")).await.unwrap();

        broker.publish(message("1")).await.unwrap();
        broker.publish(message("2")).await.unwrap();

        let channel = broker.channel("ingest", "worker-1", 1);
        let first = channel.next_delivery().await.unwrap().expect("a delivery");
        assert_eq!(first.body, b"1");
        assert!(!first.redelivered);

        // The window is full until the first delivery is settled.
        assert!(channel.next_delivery().await.unwrap().is_none());

        channel.ack(first).await.unwrap();
        let second = channel.next_delivery().await.unwrap().expect("a delivery");
        assert_eq!(second.body, b"2");
        channel.ack(second).await.unwrap();

        assert_eq!(count(&db, "ready").await, 0);
        assert_eq!(count(&db, "unacked").await, 0);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_nack_requeues_or_dead_letters(db: PgPool) {
        let broker = PgBroker::new_from_pool(db.clone());
        broker.declare(&topology("ingest")).await.unwrap();
        broker.publish(message("retry me")).await.unwrap();
        broker.publish(message("poison")).await.unwrap();

        let channel = broker.channel("ingest", "worker-1", 1);

        let delivery = channel.next_delivery().await.unwrap().unwrap();
        let tag = delivery.delivery_tag;
        channel.nack(delivery, true).await.unwrap();

        let redelivery = channel.next_delivery().await.unwrap().unwrap();
        assert_eq!(redelivery.delivery_tag, tag);
        assert!(redelivery.redelivered);
        channel.ack(redelivery).await.unwrap();

        let poison = channel.next_delivery().await.unwrap().unwrap();
        channel.nack(poison, false).await.unwrap();

        assert!(channel.next_delivery().await.unwrap().is_none());
        assert_eq!(count(&db, "dead").await, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    #[ignore = "requires a running PostgreSQL"]
    async fn test_recover_returns_orphaned_deliveries(db: PgPool) {
        let broker = PgBroker::new_from_pool(db);
        broker.declare(&topology("ingest")).await.unwrap();
        broker.publish(message("orphan")).await.unwrap();

        let crashed = broker.channel("ingest", "worker-1", 1);
        let orphan = crashed.next_delivery().await.unwrap().unwrap();
        let tag = orphan.delivery_tag;
        drop(orphan);

        let restarted = broker.channel("ingest", "worker-1", 1);
        assert_eq!(restarted.recover().await.unwrap(), 1);

        let delivery = restarted.next_delivery().await.unwrap().unwrap();
        assert_eq!(delivery.delivery_tag, tag);
        assert!(delivery.redelivered);
    }
}
