//! Serve the pull triggers, the pull status and the publish endpoint.
use std::sync::Arc;

use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use ingest_api::config::Config;
use ingest_api::coordinator::PullCoordinator;
use ingest_api::handlers::{app, AppState};
use ingest_api::pipeline::{JsonFileFetcher, Pipeline, PullParams, ScrapedRecordCleaner, StorePersister};
use ingest_api::publisher::Publisher;
use ingest_common::metrics::setup_metrics_recorder;
use ingest_common::pgbroker::PgBroker;
use ingest_common::store::PgRecordStore;

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let log_layer = tracing_subscriber::fmt::layer().with_filter(filter);
    tracing_subscriber::registry().with(log_layer).init();
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    info!("shutting down gracefully");
}

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let store = Arc::new(PgRecordStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.query_limit.0,
        config.insert_batch_size.0,
    )?);
    store.verify_table().await?;

    let pipeline = Pipeline::new(
        JsonFileFetcher::new(&config.data_file),
        ScrapedRecordCleaner,
        StorePersister::new(store),
    );
    let coordinator = Arc::new(PullCoordinator::new(
        pipeline,
        PullParams {
            target_rows: config.target_rows(),
        },
    ));

    // The publisher gets its own pool, separate from the consumer's channel.
    let broker = PgBroker::new(&config.database_url, config.max_pg_connections, "ingest-api")?;
    let publisher = Arc::new(Publisher::new(
        Arc::new(broker),
        config.broker.topology(),
        config.broker.task_topology(),
    ));
    if let Err(e) = publisher.declare().await {
        warn!("broker topology not declared yet, will retry on publish: {}", e);
    }

    let recorder_handle = if config.export_prometheus {
        Some(setup_metrics_recorder()?)
    } else {
        None
    };

    let state = AppState {
        coordinator: coordinator.clone(),
        publisher,
    };

    info!("listening on {}", config.bind());
    listen(app(state, recorder_handle), config.bind()).await?;

    // Let a background pull record its outcome before the process exits.
    if let Some(Err(e)) = coordinator.wait().await {
        warn!("background pull did not complete cleanly: {}", e);
    }

    Ok(())
}
