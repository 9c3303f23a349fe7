//! Core types for flow orchestration

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::FlowError;

/// How a step finished
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Precondition and action succeeded
    Completed,
    /// The step failed and its recovery continuation succeeded instead
    Recovered,
}

/// Record of one step that ran to completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    /// Step name
    pub name: String,

    /// Final status
    pub status: StepStatus,

    /// Wall-clock start
    pub started_at: DateTime<Utc>,

    /// Execution time in milliseconds
    pub duration_ms: u64,
}

/// Terminal result of a task run. Exactly one per run.
#[derive(Debug, Clone)]
pub enum Outcome {
    Success,
    Failure {
        /// Name of the step that failed, when the failure happened inside a step
        step: Option<String>,
        error: FlowError,
        /// Screenshot captured for diagnosis, if one could be taken
        snapshot: Option<PathBuf>,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }

    /// Process exit status for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Success => 0,
            Outcome::Failure { .. } => 1,
        }
    }

    pub fn error(&self) -> Option<&FlowError> {
        match self {
            Outcome::Success => None,
            Outcome::Failure { error, .. } => Some(error),
        }
    }
}

/// Flow execution result
#[derive(Debug, Clone)]
pub struct FlowResult {
    pub outcome: Outcome,

    /// Steps that completed, in order
    pub steps: Vec<StepReport>,

    /// Total execution time in milliseconds
    pub total_duration_ms: u64,
}

impl FlowResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }
}
