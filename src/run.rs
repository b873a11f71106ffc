use crate::error::{FailureKind, PipelineError, Result};
use crate::stage::StageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunState {
    Queued {
        queued_at: DateTime<Utc>,
    },
    Running {
        started_at: DateTime<Utc>,
        current_stage: StageId,
    },
    Completed {
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
        duration_ms: u64,
        families_analyzed: usize,
    },
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        error: String,
        kind: FailureKind,
        failed_stage: StageId,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
        reason: String,
    },
}

impl RunState {
    pub fn state_name(&self) -> &'static str {
        match self {
            RunState::Queued { .. } => "queued",
            RunState::Running { .. } => "running",
            RunState::Completed { .. } => "completed",
            RunState::Failed { .. } => "failed",
            RunState::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Completed { .. } | RunState::Failed { .. } | RunState::Cancelled { .. }
        )
    }
}

/// Run model: identity plus state. Written to `run.json` at the end of the
/// run alongside the per-stage reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub reference_taxon: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(reference_taxon: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            reference_taxon: reference_taxon.into(),
            state: RunState::Queued { queued_at: now },
            created_at: now,
            updated_at: now,
        }
    }
}

/// Guards the legal transitions between run states.
pub struct RunStateMachine {
    run: PipelineRun,
}

impl RunStateMachine {
    pub fn new(run: PipelineRun) -> Self {
        Self { run }
    }

    pub fn run(&self) -> &PipelineRun {
        &self.run
    }

    pub fn into_run(self) -> PipelineRun {
        self.run
    }

    /// QUEUED -> RUNNING
    pub fn start(&mut self, stage: StageId) -> Result<()> {
        match &self.run.state {
            RunState::Queued { .. } => {
                let now = Utc::now();
                self.run.state = RunState::Running {
                    started_at: now,
                    current_stage: stage,
                };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid("running")),
        }
    }

    /// Update the current stage of a running run.
    pub fn advance(&mut self, stage: StageId) -> Result<()> {
        match &mut self.run.state {
            RunState::Running { current_stage, .. } => {
                *current_stage = stage;
                self.run.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.invalid("running (advance)")),
        }
    }

    /// RUNNING -> COMPLETED
    pub fn complete(&mut self, families_analyzed: usize) -> Result<()> {
        match &self.run.state {
            RunState::Running { started_at, .. } => {
                let now = Utc::now();
                let duration_ms = (now - *started_at).num_milliseconds().max(0) as u64;
                self.run.state = RunState::Completed {
                    started_at: *started_at,
                    completed_at: now,
                    duration_ms,
                    families_analyzed,
                };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid("completed")),
        }
    }

    /// RUNNING -> FAILED
    pub fn fail(&mut self, error: String, kind: FailureKind, failed_stage: StageId) -> Result<()> {
        match &self.run.state {
            RunState::Running { started_at, .. } => {
                let now = Utc::now();
                self.run.state = RunState::Failed {
                    started_at: *started_at,
                    failed_at: now,
                    error,
                    kind,
                    failed_stage,
                };
                self.run.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid("failed")),
        }
    }

    /// Any non-terminal state -> CANCELLED
    pub fn cancel(&mut self, reason: String) -> Result<()> {
        if self.run.state.is_terminal() {
            return Err(self.invalid("cancelled"));
        }
        let now = Utc::now();
        self.run.state = RunState::Cancelled {
            cancelled_at: now,
            reason,
        };
        self.run.updated_at = now;
        Ok(())
    }

    fn invalid(&self, to: &str) -> PipelineError {
        PipelineError::InvalidStateTransition {
            from: self.run.state.state_name().to_string(),
            to: to.to_string(),
        }
    }
}
