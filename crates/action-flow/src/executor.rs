//! Step sequencer

use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use crate::diagnostics::DiagnosticCapture;
use crate::page::PageHandle;
use crate::step::Step;
use crate::types::{FlowResult, Outcome, StepReport};

/// Runs steps strictly in order and stops at the first unrecovered failure
#[derive(Debug, Clone, Default)]
pub struct StepSequencer {
    diagnostics: DiagnosticCapture,
}

impl StepSequencer {
    /// Create a new sequencer
    pub fn new(diagnostics: DiagnosticCapture) -> Self {
        Self { diagnostics }
    }

    pub fn diagnostics(&self) -> &DiagnosticCapture {
        &self.diagnostics
    }

    /// Execute `steps` against `page`
    pub async fn run(&self, page: &PageHandle, steps: &[Step]) -> FlowResult {
        let run_started = Instant::now();
        let mut reports = Vec::with_capacity(steps.len());

        for (index, step) in steps.iter().enumerate() {
            debug!("Executing step {}/{}: {}", index + 1, steps.len(), step.name());
            let started_at = Utc::now();
            let step_started = Instant::now();

            match step.run(page).await {
                Ok(status) => {
                    info!(step = %step.name(), ?status, "{}", step.name());
                    reports.push(StepReport {
                        name: step.name().to_string(),
                        status,
                        started_at,
                        duration_ms: step_started.elapsed().as_millis() as u64,
                    });
                }
                Err(error) => {
                    let snapshot = self
                        .diagnostics
                        .capture(page, Some(step.name()), &error)
                        .await;
                    return FlowResult {
                        outcome: Outcome::Failure {
                            step: Some(step.name().to_string()),
                            error,
                            snapshot,
                        },
                        steps: reports,
                        total_duration_ms: run_started.elapsed().as_millis() as u64,
                    };
                }
            }
        }

        FlowResult {
            outcome: Outcome::Success,
            steps: reports,
            total_duration_ms: run_started.elapsed().as_millis() as u64,
        }
    }
}
