use std::sync::Arc;

use axum::{routing, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use ingest_common::metrics;

use super::{publish, pull};
use crate::coordinator::PullCoordinator;
use crate::publisher::Publisher;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<PullCoordinator>,
    pub publisher: Arc<Publisher>,
}

pub fn app(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/health", routing::get(health))
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .route("/pull-data", routing::post(pull::pull_data))
        .route(
            "/pull-data/background",
            routing::post(pull::pull_data_background),
        )
        .route("/pull-data/queued", routing::post(pull::pull_data_queued))
        .route("/pull-status", routing::get(pull::pull_status))
        .route("/update-analysis", routing::post(pull::update_analysis))
        .route("/publish", routing::post(publish::post))
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(metrics::track_metrics))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "ingest api"
}

pub async fn health() -> Json<Value> {
    Json(json!({"status": "healthy"}))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_json_diff::assert_json_include;
    use async_trait::async_trait;
    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
    };
    use http_body_util::BodyExt; // for `collect`
    use serde_json::{json, Value};
    use tokio::sync::Notify;
    use tower::ServiceExt; // for `oneshot`

    use super::*;
    use crate::pipeline::{
        Fetcher, Pipeline, PullParams, ScrapedRecordCleaner, StageError, StorePersister,
    };
    use ingest_common::broker::Topology;
    use ingest_common::memory::{MemoryBroker, MemoryStore};
    use ingest_common::record::Record;
    use ingest_common::store;

    struct StaticFetcher(Vec<Value>);

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _params: &PullParams) -> Result<Vec<Value>, StageError> {
            Ok(self.0.clone())
        }
    }

    struct GatedFetcher(Arc<Notify>);

    #[async_trait]
    impl Fetcher for GatedFetcher {
        async fn fetch(&self, _params: &PullParams) -> Result<Vec<Value>, StageError> {
            self.0.notified().await;
            Ok(Vec::new())
        }
    }

    struct Harness {
        router: Router,
        state: AppState,
        store: MemoryStore,
        broker: MemoryBroker,
    }

    fn harness(fetcher: impl Fetcher + 'static) -> Harness {
        let store = MemoryStore::default();
        let broker = MemoryBroker::default();
        let pipeline = Pipeline::new(
            fetcher,
            ScrapedRecordCleaner,
            StorePersister::new(Arc::new(store.clone())),
        );
        let state = AppState {
            coordinator: Arc::new(PullCoordinator::new(
                pipeline,
                PullParams { target_rows: None },
            )),
            publisher: Arc::new(Publisher::new(
                Arc::new(broker.clone()),
                Topology {
                    exchange: "applicant.events".to_owned(),
                    queue: "applicant.ingest".to_owned(),
                    routing_key: "applicant.created".to_owned(),
                },
                Topology {
                    exchange: "tasks".to_owned(),
                    queue: "tasks_q".to_owned(),
                    routing_key: "tasks".to_owned(),
                },
            )),
        };

        Harness {
            router: app(state.clone(), None),
            state,
            store,
            broker,
        }
    }

    fn post(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri(uri)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap()
    }

    async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    fn scraped(id: u32) -> Value {
        json!({
            "url": format!("https://www.thegradcafe.com/result/{id}"),
            "program": "Computer Science, Example University",
            "applicant_status": "Accepted",
            "gpa": "3.85",
        })
    }

    #[tokio::test]
    async fn test_index_and_health() {
        let harness = harness(StaticFetcher(Vec::new()));

        let response = harness
            .router
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ingest api");

        let (status, body) = send(
            &harness.router,
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "healthy"}));
    }

    #[tokio::test]
    async fn test_pull_inserts_new_rows_once() {
        let harness = harness(StaticFetcher(
            [1, 2, 3, 4, 5].into_iter().map(scraped).collect(),
        ));
        let already_stored: Vec<Record> = [1, 2]
            .into_iter()
            .map(|id| Record::from_scraped(&scraped(id)).unwrap())
            .collect();
        store::insert(&harness.store, &already_stored).await.unwrap();

        let (status, body) = send(&harness.router, post("/pull-data", Body::empty())).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_json_include!(
            actual: body,
            expected: json!({"ok": true, "message": "Data Pull Complete. Inserted 3 new rows."})
        );
        assert_eq!(harness.store.len(), 5);

        let (status, body) = send(&harness.router, post("/pull-data", Body::empty())).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_json_include!(
            actual: body,
            expected: json!({"ok": true, "message": "Data Pull Complete. Inserted 0 new rows."})
        );
        assert_eq!(harness.store.len(), 5);
    }

    #[tokio::test]
    async fn test_pull_failure_is_reported() {
        let harness = harness(StaticFetcher(vec![scraped(1)]));
        harness.store.set_unavailable(true);

        let (status, body) = send(&harness.router, post("/pull-data", Body::empty())).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            json!({"ok": false, "error": "Pull failed due to an internal error."})
        );

        let (_, status_body) = send(
            &harness.router,
            Request::builder()
                .uri("/pull-status")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_json_include!(actual: status_body, expected: json!({"status": "error"}));
    }

    #[tokio::test]
    async fn test_every_trigger_is_busy_while_running() {
        let gate = Arc::new(Notify::new());
        let harness = harness(GatedFetcher(gate.clone()));

        let response = harness
            .router
            .clone()
            .oneshot(post("/pull-data/background", Body::empty()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(response.headers()[http::header::LOCATION], "/");

        let busy = json!({
            "busy": true,
            "message": "Data pull is running. Please wait for a follow-up message when complete."
        });
        for uri in [
            "/pull-data",
            "/pull-data/background",
            "/pull-data/queued",
            "/update-analysis",
        ] {
            let (status, body) = send(&harness.router, post(uri, Body::empty())).await;
            assert_eq!(status, StatusCode::CONFLICT, "{uri}");
            assert_eq!(body, busy, "{uri}");
        }

        let (status, body) = send(
            &harness.router,
            Request::builder()
                .uri("/pull-status")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_json_include!(actual: body, expected: json!({"status": "running"}));

        assert_eq!(harness.broker.ready("tasks_q"), 0);

        gate.notify_one();
        harness.state.coordinator.wait().await.unwrap().unwrap();

        let (status, body) = send(&harness.router, post("/update-analysis", Body::empty())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"ok": true, "message": "Analysis refreshed with latest data pull results."})
        );

        let (_, body) = send(
            &harness.router,
            Request::builder()
                .uri("/pull-status")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_json_include!(
            actual: body,
            expected: json!({"status": "done", "message": "Data Pull Complete. Inserted 0 new rows."})
        );
    }

    #[tokio::test]
    async fn test_publish() {
        let harness = harness(StaticFetcher(Vec::new()));
        let record = json!({
            "url": "https://www.thegradcafe.com/result/77",
            "program": "Mathematics",
            "gpa": 3.9,
        });

        let (status, body) = send(
            &harness.router,
            post("/publish", Body::from(record.to_string())),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({"status": "queued"}));
        assert_eq!(harness.broker.ready("applicant.ingest"), 1);

        let (status, body) = send(
            &harness.router,
            post("/publish", Body::from(json!({"program": "Mathematics"}).to_string())),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());

        let (status, _) = send(&harness.router, post("/publish", Body::from("{not json"))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        harness.broker.set_unavailable(true);
        let (status, body) = send(
            &harness.router,
            post("/publish", Body::from(record.to_string())),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({"error": "publish_failed"}));
        assert_eq!(harness.broker.ready("applicant.ingest"), 1);
    }

    #[tokio::test]
    async fn test_queued_pull_publishes_task() {
        let harness = harness(StaticFetcher(vec![scraped(1)]));

        let (status, body) = send(&harness.router, post("/pull-data/queued", Body::empty())).await;

        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({"status": "queued", "task": "scrape_new_data"}));
        let queued = harness.broker.peek("tasks_q");
        assert_eq!(queued.len(), 1);
        let task: Value = serde_json::from_slice(&queued[0]).unwrap();
        assert_eq!(task["kind"], "scrape_new_data");
        // The worker does the pull; nothing was written here.
        assert!(harness.store.is_empty());

        harness.broker.set_unavailable(true);
        let (status, body) = send(&harness.router, post("/pull-data/queued", Body::empty())).await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, json!({"error": "publish_failed"}));
        assert_eq!(harness.broker.ready("tasks_q"), 1);
    }
}
