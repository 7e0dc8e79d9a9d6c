//! # RunState
//!
//! The single-flight gate in front of the pull pipeline.
//!
//! One `RunStateMachine` exists per process. Every read and write goes through one mutex
//! around the whole `RunState`, so observers never see a status from one transition paired
//! with a message or timestamp from another.
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub const RUNNING_MESSAGE: &str =
    "Data pull is running. Please wait for a follow-up message when complete.";
pub const FAILED_MESSAGE: &str = "Pull failed due to an internal error.";

pub fn completed_message(inserted: u64) -> String {
    format!("Data Pull Complete. Inserted {} new rows.", inserted)
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let status = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
        };
        f.write_str(status)
    }
}

/// A consistent snapshot of the pull status.
#[derive(Serialize, Debug, Clone, PartialEq, Default)]
pub struct RunState {
    pub status: RunStatus,
    pub message: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failure,
}

/// Proof of holding the current run. Only the holder can complete it, and only once.
#[derive(Debug)]
#[must_use = "a run that is never completed stays `running` until the process restarts"]
pub struct RunTicket {
    run_id: Uuid,
}

impl RunTicket {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RunStateError {
    #[error("run {0} is not the run in progress")]
    NotCurrentRun(Uuid),
}

#[derive(Debug, Default)]
struct Inner {
    state: RunState,
    current_run: Option<Uuid>,
}

#[derive(Debug, Default)]
pub struct RunStateMachine {
    inner: Mutex<Inner>,
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Every critical section only assigns fields, so a poisoned guard still holds a
        // consistent state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a run unless one is already running.
    /// Exactly one of any set of overlapping callers gets a ticket.
    pub fn try_begin_run(&self) -> Option<RunTicket> {
        let mut inner = self.lock();
        if inner.state.status == RunStatus::Running {
            return None;
        }

        let run_id = Uuid::now_v7();
        inner.current_run = Some(run_id);
        inner.state = RunState {
            status: RunStatus::Running,
            message: String::new(),
            started_at: Some(Utc::now()),
            finished_at: None,
        };

        Some(RunTicket { run_id })
    }

    /// Finish the run held by `ticket`, returning the resulting snapshot.
    pub fn complete_run(
        &self,
        ticket: RunTicket,
        outcome: RunOutcome,
        message: impl Into<String>,
    ) -> Result<RunState, RunStateError> {
        let mut inner = self.lock();
        if inner.state.status != RunStatus::Running || inner.current_run != Some(ticket.run_id) {
            return Err(RunStateError::NotCurrentRun(ticket.run_id));
        }

        inner.current_run = None;
        inner.state.status = match outcome {
            RunOutcome::Success => RunStatus::Done,
            RunOutcome::Failure => RunStatus::Error,
        };
        inner.state.message = message.into();
        inner.state.finished_at = Some(Utc::now());

        Ok(inner.state.clone())
    }

    pub fn current_status(&self) -> RunState {
        self.lock().state.clone()
    }
}
