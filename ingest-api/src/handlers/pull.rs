use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use ingest_common::task::SCRAPE_NEW_DATA;

use crate::coordinator::{CoordinatorError, PullOutcome, StartOutcome};
use crate::run_state::{RunState, RunStatus, FAILED_MESSAGE, RUNNING_MESSAGE};

use super::publish::{PublishResponse, PUBLISH_FAILED};
use super::AppState;

pub const ANALYSIS_REFRESHED_MESSAGE: &str = "Analysis refreshed with latest data pull results.";

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct PullResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
pub struct BusyResponse {
    pub busy: bool,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("a data pull is already running")]
    Busy,
    #[error("data pull failed")]
    PullFailed,
    #[error("data pull could not be coordinated: {0}")]
    CoordinatorError(#[from] CoordinatorError),
    #[error("data pull could not be queued")]
    PublishFailed,
}

impl IntoResponse for TriggerError {
    fn into_response(self) -> Response {
        match self {
            TriggerError::Busy => (
                StatusCode::CONFLICT,
                Json(BusyResponse {
                    busy: true,
                    message: RUNNING_MESSAGE.to_owned(),
                }),
            )
                .into_response(),
            TriggerError::PullFailed | TriggerError::CoordinatorError(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PullResponse {
                    ok: false,
                    message: None,
                    error: Some(FAILED_MESSAGE.to_owned()),
                }),
            )
                .into_response(),
            TriggerError::PublishFailed => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(PublishResponse {
                    status: None,
                    task: None,
                    error: Some(PUBLISH_FAILED.to_owned()),
                }),
            )
                .into_response(),
        }
    }
}

/// Run a pull and answer once it has finished.
pub async fn pull_data(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<PullResponse>), TriggerError> {
    let outcome = state
        .coordinator
        .run_sync()
        .await
        .inspect_err(|e| error!("pull coordination failed: {}", e))?;

    match outcome {
        PullOutcome::Busy(_) => Err(TriggerError::Busy),
        PullOutcome::Failed(_) => Err(TriggerError::PullFailed),
        PullOutcome::Completed(finished) => Ok((
            StatusCode::ACCEPTED,
            Json(PullResponse {
                ok: true,
                message: Some(finished.message),
                error: None,
            }),
        )),
    }
}

/// Start a pull in the background and send the browser back to the index.
pub async fn pull_data_background(
    State(state): State<AppState>,
) -> Result<Redirect, TriggerError> {
    match state.coordinator.start_background() {
        StartOutcome::Busy(_) => Err(TriggerError::Busy),
        StartOutcome::Started(_) => Ok(Redirect::to("/")),
    }
}

/// Hand the pull to the worker as a `scrape_new_data` task instead of running it here.
pub async fn pull_data_queued(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<PublishResponse>), TriggerError> {
    if state.coordinator.is_running() {
        return Err(TriggerError::Busy);
    }

    let task = state
        .publisher
        .publish_task(SCRAPE_NEW_DATA, serde_json::json!({}))
        .await
        .map_err(|e| {
            error!("failed to queue {}: {}", SCRAPE_NEW_DATA, e);
            TriggerError::PublishFailed
        })?;
    info!(kind = %task.kind, "queued data pull");

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishResponse {
            status: Some("queued".to_owned()),
            task: Some(task.kind),
            error: None,
        }),
    ))
}

pub async fn update_analysis(
    State(state): State<AppState>,
) -> Result<Json<PullResponse>, TriggerError> {
    let current = state.coordinator.status();
    let message = match current.status {
        RunStatus::Running => return Err(TriggerError::Busy),
        RunStatus::Done => ANALYSIS_REFRESHED_MESSAGE.to_owned(),
        RunStatus::Idle | RunStatus::Error => String::new(),
    };

    Ok(Json(PullResponse {
        ok: true,
        message: Some(message),
        error: None,
    }))
}

pub async fn pull_status(State(state): State<AppState>) -> Json<RunState> {
    let mut current = state.coordinator.status();
    if current.status == RunStatus::Running && current.message.is_empty() {
        current.message = RUNNING_MESSAGE.to_owned();
    }
    Json(current)
}
