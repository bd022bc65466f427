use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Pipeline state
///
/// Linear progression `Idle -> Ingesting -> ... -> Complete`; `Failed` is
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Ingesting,
    ValidatingRaw,
    Staging,
    ValidatingSilver,
    Modeling,
    ValidatingGold,
    Complete,
    Failed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Ingesting => "ingesting",
            PipelineState::ValidatingRaw => "validating_raw",
            PipelineState::Staging => "staging",
            PipelineState::ValidatingSilver => "validating_silver",
            PipelineState::Modeling => "modeling",
            PipelineState::ValidatingGold => "validating_gold",
            PipelineState::Complete => "complete",
            PipelineState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Complete | PipelineState::Failed)
    }

    /// Successor on the happy path
    pub fn next(&self) -> Option<PipelineState> {
        match self {
            PipelineState::Idle => Some(PipelineState::Ingesting),
            PipelineState::Ingesting => Some(PipelineState::ValidatingRaw),
            PipelineState::ValidatingRaw => Some(PipelineState::Staging),
            PipelineState::Staging => Some(PipelineState::ValidatingSilver),
            PipelineState::ValidatingSilver => Some(PipelineState::Modeling),
            PipelineState::Modeling => Some(PipelineState::ValidatingGold),
            PipelineState::ValidatingGold => Some(PipelineState::Complete),
            PipelineState::Complete | PipelineState::Failed => None,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
}

/// State machine for a single run
pub struct RunStateMachine {
    run_id: Uuid,
    state: PipelineState,
    history: Vec<Transition>,
    /// Set when the run short-circuited on an unchanged source
    skipped: bool,
}

impl RunStateMachine {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            state: PipelineState::Idle,
            history: Vec::new(),
            skipped: false,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    pub fn was_skipped(&self) -> bool {
        self.skipped
    }

    fn transition(&mut self, to: PipelineState) {
        self.history.push(Transition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = to;
    }

    fn invalid(&self, to: PipelineState) -> PipelineError {
        PipelineError::InvalidStateTransition {
            from: self.state.as_str().to_string(),
            to: to.as_str().to_string(),
        }
    }

    /// Transition: IDLE | COMPLETE → INGESTING
    pub fn begin(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Idle | PipelineState::Complete => {
                self.skipped = false;
                self.transition(PipelineState::Ingesting);
                Ok(())
            }
            _ => Err(self.invalid(PipelineState::Ingesting)),
        }
    }

    /// Transition to the next state on the happy path
    pub fn advance(&mut self) -> Result<PipelineState> {
        match self.state {
            PipelineState::Idle | PipelineState::Complete | PipelineState::Failed => {
                Err(self.invalid(self.state.next().unwrap_or(self.state)))
            }
            current => {
                let next = current.next().ok_or_else(|| self.invalid(current))?;
                self.transition(next);
                Ok(next)
            }
        }
    }

    /// Transition: INGESTING → COMPLETE (source unchanged since last complete run)
    pub fn skip_unchanged(&mut self) -> Result<()> {
        match self.state {
            PipelineState::Ingesting => {
                self.skipped = true;
                self.transition(PipelineState::Complete);
                Ok(())
            }
            _ => Err(self.invalid(PipelineState::Complete)),
        }
    }

    /// Transition: * (non-terminal) → FAILED, returning the state that failed
    pub fn fail(&mut self) -> Result<PipelineState> {
        if self.state.is_terminal() {
            return Err(self.invalid(PipelineState::Failed));
        }
        let failed_in = self.state;
        self.transition(PipelineState::Failed);
        Ok(failed_in)
    }
}
