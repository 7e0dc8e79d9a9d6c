use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use ingest_common::record::Record;

use crate::publisher::PublishError;

use super::AppState;

pub const PUBLISH_FAILED: &str = "publish_failed";

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct PublishResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Kind of the queued task, for task requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn rejected(status: StatusCode, error: String) -> (StatusCode, Json<PublishResponse>) {
    (
        status,
        Json(PublishResponse {
            status: None,
            task: None,
            error: Some(error),
        }),
    )
}

pub async fn post(
    State(state): State<AppState>,
    payload: Result<Json<Record>, JsonRejection>,
) -> Result<(StatusCode, Json<PublishResponse>), (StatusCode, Json<PublishResponse>)> {
    let Json(record) = payload.map_err(|e| {
        debug!("rejected publish payload: {}", e);
        rejected(StatusCode::BAD_REQUEST, e.body_text())
    })?;

    match state.publisher.publish(record).await {
        Ok(_) => Ok((
            StatusCode::ACCEPTED,
            Json(PublishResponse {
                status: Some("queued".to_owned()),
                task: None,
                error: None,
            }),
        )),
        Err(PublishError::Invalid(e)) => Err(rejected(StatusCode::BAD_REQUEST, e.to_string())),
        Err(e) => {
            error!("failed to publish record: {}", e);
            Err(rejected(
                StatusCode::SERVICE_UNAVAILABLE,
                PUBLISH_FAILED.to_owned(),
            ))
        }
    }
}
