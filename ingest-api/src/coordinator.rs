//! # PullCoordinator
//!
//! Owns the `RunStateMachine` and the pipeline, and is the only way to start a pull.
//!
//! Both entry points run the pipeline on a supervised task. The supervisor holds the
//! `RunTicket` and completes the run whatever happens to the pipeline task, including a
//! panic, so the state never stays `running` after the work has ended. The synchronous
//! entry point awaits the supervisor; the background one keeps its handle.
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};
use uuid::Uuid;

use ingest_common::metrics::{PULL_ROWS_INSERTED, PULL_RUNS};

use crate::pipeline::{Pipeline, PullParams};
use crate::run_state::{
    completed_message, RunOutcome, RunState, RunStateError, RunStateMachine, RunStatus,
    RunTicket, FAILED_MESSAGE,
};

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    RunStateError(#[from] RunStateError),
    #[error("pull supervisor did not finish: {0}")]
    SupervisorError(#[from] JoinError),
}

/// Result of a synchronous pull.
#[derive(Debug, Clone, PartialEq)]
pub enum PullOutcome {
    Busy(RunState),
    Completed(RunState),
    Failed(RunState),
}

/// Result of starting a background pull.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Busy(RunState),
    Started(Uuid),
}

type Supervisor = JoinHandle<Result<RunState, RunStateError>>;

pub struct PullCoordinator {
    state: Arc<RunStateMachine>,
    pipeline: Pipeline,
    params: PullParams,
    background: Mutex<Option<Supervisor>>,
}

impl PullCoordinator {
    pub fn new(pipeline: Pipeline, params: PullParams) -> Self {
        Self {
            state: Arc::new(RunStateMachine::new()),
            pipeline,
            params,
            background: Mutex::new(None),
        }
    }

    pub fn status(&self) -> RunState {
        self.state.current_status()
    }

    pub fn is_running(&self) -> bool {
        self.status().status == RunStatus::Running
    }

    /// Run a pull and wait for it to finish.
    pub async fn run_sync(&self) -> Result<PullOutcome, CoordinatorError> {
        let Some(ticket) = self.state.try_begin_run() else {
            return Ok(PullOutcome::Busy(self.status()));
        };

        let finished = self.supervise(ticket).await??;
        Ok(match finished.status {
            RunStatus::Done => PullOutcome::Completed(finished),
            _ => PullOutcome::Failed(finished),
        })
    }

    /// Start a pull and return without waiting for it.
    pub fn start_background(&self) -> StartOutcome {
        let Some(ticket) = self.state.try_begin_run() else {
            return StartOutcome::Busy(self.status());
        };

        let run_id = ticket.run_id();
        let supervisor = self.supervise(ticket);
        let previous = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(supervisor);
        // A new run can only begin after the previous supervisor completed its run.
        drop(previous);

        StartOutcome::Started(run_id)
    }

    /// Wait for the most recent background pull, if there is one.
    pub async fn wait(&self) -> Option<Result<RunState, CoordinatorError>> {
        let supervisor = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;

        Some(match supervisor.await {
            Ok(finished) => finished.map_err(CoordinatorError::from),
            Err(error) => Err(CoordinatorError::from(error)),
        })
    }

    fn supervise(&self, ticket: RunTicket) -> Supervisor {
        let state = self.state.clone();
        let pipeline = self.pipeline.clone();
        let params = self.params;

        tokio::spawn(async move {
            let run_id = ticket.run_id();
            info!(%run_id, "starting data pull");

            let work = tokio::spawn(async move { pipeline.run(&params).await });
            let (outcome, message) = match work.await {
                Ok(Ok(report)) => {
                    info!(%run_id, inserted = report.inserted, "data pull complete");
                    metrics::counter!(PULL_ROWS_INSERTED).increment(report.inserted);
                    (RunOutcome::Success, completed_message(report.inserted))
                }
                Ok(Err(pipeline_error)) => {
                    error!(%run_id, stage = %pipeline_error.stage, "data pull failed: {}", pipeline_error);
                    (RunOutcome::Failure, FAILED_MESSAGE.to_owned())
                }
                Err(join_error) => {
                    error!(%run_id, "data pull task ended abnormally: {}", join_error);
                    (RunOutcome::Failure, FAILED_MESSAGE.to_owned())
                }
            };

            let label = match outcome {
                RunOutcome::Success => "success",
                RunOutcome::Failure => "failure",
            };
            metrics::counter!(PULL_RUNS, "outcome" => label).increment(1);

            state
                .complete_run(ticket, outcome, message)
                .inspect_err(|e| warn!(%run_id, "could not record pull completion: {}", e))
        })
    }
}
