//! Prometheus metrics shared by the api and the worker.
use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Pull runs by outcome (`success`, `failure`).
pub const PULL_RUNS: &str = "pull_runs_total";
pub const PULL_ROWS_INSERTED: &str = "pull_rows_inserted_total";
pub const RECORDS_PUBLISHED: &str = "records_published_total";
/// Broker deliveries by handler and disposition (`stored`, `already_stored`, `requeued`,
/// `rejected`).
pub const CONSUMER_DELIVERIES: &str = "consumer_deliveries_total";
pub const TASKS_QUEUED: &str = "tasks_queued_total";
pub const TASK_ROWS_INSERTED: &str = "task_rows_inserted_total";
pub const HTTP_REQUESTS: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION: &str = "http_requests_duration_seconds";

/// Paths that are polled constantly and would drown the request metrics.
const UNTRACKED_PATHS: [&str; 2] = ["/metrics", "/_liveness"];

const REQUEST_SECONDS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Bind a `TcpListener` on `bind` and serve `router` on it until the process stops.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the recorder and add a `/metrics` route plus request tracking to `router`.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

/// Install the global Prometheus recorder. Can only succeed once per process.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION.to_owned()),
            REQUEST_SECONDS,
        )?
        .install_recorder()?;

    describe_metrics();
    Ok(handle)
}

fn describe_metrics() {
    metrics::describe_counter!(PULL_RUNS, "Finished pull runs, by outcome");
    metrics::describe_counter!(PULL_ROWS_INSERTED, "Rows inserted by pull runs");
    metrics::describe_counter!(RECORDS_PUBLISHED, "Records accepted by the broker");
    metrics::describe_counter!(CONSUMER_DELIVERIES, "Settled deliveries, by disposition");
    metrics::describe_counter!(TASKS_QUEUED, "Tasks accepted by the broker, by kind");
    metrics::describe_counter!(TASK_ROWS_INSERTED, "Rows inserted by queued tasks");
    metrics::describe_counter!(HTTP_REQUESTS, "HTTP requests served");
    metrics::describe_histogram!(
        HTTP_REQUEST_DURATION,
        metrics::Unit::Seconds,
        "HTTP request latency"
    );
}

/// Middleware recording a request counter and a latency histogram labelled by route template.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    if UNTRACKED_PATHS.contains(&route.as_str()) {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let start = Instant::now();
    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION, &labels).record(start.elapsed().as_secs_f64());

    response
}
