//! Consume published records and queued tasks from the broker and apply them to storage.
use std::sync::Arc;

use axum::{routing::get, Router};
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ingest_common::broker::BrokerPublisher;
use ingest_common::health::HealthRegistry;
use ingest_common::metrics::{serve, setup_metrics_routes};
use ingest_common::pgbroker::PgBroker;
use ingest_common::store::PgRecordStore;
use ingest_worker::config::{resolve_consumer_tag, Config};
use ingest_worker::consumer::{Consumer, RecordHandler};
use ingest_worker::tasks::TaskHandler;

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().expect("Invalid configuration:");
    let consumer_tag = resolve_consumer_tag(&config.consumer_tag);

    let liveness = HealthRegistry::new("liveness");
    // Several poll intervals, and long enough to ride out one reconnect delay.
    let deadline = chrono::Duration::from_std(config.reconnect_delay.0 * 3)?;
    let records_liveness = liveness.register("consumer", deadline);
    let tasks_liveness = liveness.register("tasks", deadline);

    let store = Arc::new(PgRecordStore::new(
        &config.database_url,
        config.max_pg_connections,
        ingest_common::config::MAX_QUERY_LIMIT,
        1,
    )?);

    // The consumers own this pool for the life of the process.
    let broker = PgBroker::new(&config.database_url, config.max_pg_connections, "ingest-worker")?;
    let topology = config.topology();
    let task_topology = config.task_topology();
    broker.declare(&topology).await?;
    broker.declare(&task_topology).await?;

    let records = Consumer::new(
        RecordHandler::new(store.clone()),
        broker.channel(&topology.queue, &consumer_tag, config.prefetch.0),
        config.poll_interval.0,
        config.reconnect_delay.0,
        records_liveness,
    );
    let tasks = Consumer::new(
        TaskHandler::new(store, &config.data_file),
        broker.channel(&task_topology.queue, &consumer_tag, 1),
        config.poll_interval.0,
        config.reconnect_delay.0,
        tasks_liveness,
    );

    let router = Router::new().route(
        "/_liveness",
        get(move || std::future::ready(liveness.get_status())),
    );
    let router = setup_metrics_routes(router)?;
    let bind = config.bind();

    info!(
        queue = %topology.queue,
        task_queue = %task_topology.queue,
        consumer_tag = %consumer_tag,
        "starting consumers"
    );

    let http_server = Box::pin(serve(router, &bind));
    let consume_loops = Box::pin(select(Box::pin(records.run()), Box::pin(tasks.run())));

    match select(http_server, consume_loops).await {
        Either::Left((Err(e), _)) => error!("failed to serve metrics and liveness, {}", e),
        Either::Left((Ok(_), _)) => error!("metrics and liveness server exited"),
        Either::Right((Either::Left(_), _)) => error!("record consumer loop exited"),
        Either::Right((Either::Right(_), _)) => error!("task consumer loop exited"),
    }

    Ok(())
}
