//! Run and stage execution state

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Overall status of a bootstrap or teardown run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// Run has not started
    Pending,
    /// Run is in progress
    Running,
    /// Every stage reached readiness (bootstrap) or was removed (teardown)
    Completed,
    /// A stage install failed or a readiness wait timed out
    Failed,
    /// Run was cancelled by the operator
    Cancelled,
}

/// State of a single stage within a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageState {
    /// Stage has not been touched yet
    Pending,
    /// Install action is running
    Installing { started_at: DateTime<Utc> },
    /// Install finished, readiness probe is polling
    Waiting { started_at: DateTime<Utc> },
    /// Readiness probe succeeded
    Ready {
        started_at: DateTime<Utc>,
        ready_at: DateTime<Utc>,
    },
    /// Install failed or the readiness wait timed out
    Failed {
        error: String,
        failed_at: DateTime<Utc>,
    },
    /// Stage was skipped (e.g. operator declined a destructive teardown step)
    Skipped { reason: String },
}

impl StageState {
    /// Check if the stage is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageState::Ready { .. } | StageState::Failed { .. } | StageState::Skipped { .. }
        )
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, StageState::Ready { .. })
    }
}

/// State of a whole run over a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Unique run ID
    pub run_id: Uuid,

    /// Current run status
    pub status: RunStatus,

    /// When the run started
    pub started_at: Option<DateTime<Utc>>,

    /// When the run completed or failed
    pub completed_at: Option<DateTime<Utc>>,

    /// Total number of stages in the plan
    pub total_stages: usize,

    /// Number of stages that reached readiness
    pub ready_stages: usize,

    /// Number of failed stages
    pub failed_stages: usize,
}

impl RunState {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            status: RunStatus::Pending,
            started_at: None,
            completed_at: None,
            total_stages: 0,
            ready_stages: 0,
            failed_stages: 0,
        }
    }

    /// Mark the run as started
    pub fn start(&mut self, total_stages: usize) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        self.total_stages = total_stages;
    }

    /// Mark the run as completed
    pub fn complete(&mut self) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the run as failed
    pub fn fail(&mut self) {
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the run as cancelled
    pub fn cancel(&mut self) {
        self.status = RunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Progress as a fraction (0.0 to 1.0)
    pub fn progress(&self) -> f64 {
        if self.total_stages == 0 {
            return 0.0;
        }
        (self.ready_stages + self.failed_stages) as f64 / self.total_stages as f64
    }
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}
