use chrono::{DateTime, Utc};
use medallion_storage::{StageEntry, StageStatus};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{info, warn};

use crate::state::PipelineState;

/// Stage metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub rows_in: u64,
    pub rows_out: u64,
    /// Free-form note stored with the ledger entry (skipped rows, dropped groups)
    pub detail: Option<String>,
}

impl StageMetrics {
    pub fn new(rows_in: usize, rows_out: usize) -> Self {
        Self {
            rows_in: rows_in as u64,
            rows_out: rows_out as u64,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Wall-clock and ledger timing for one stage attempt
pub struct StageTimer {
    state: PipelineState,
    started_at: DateTime<Utc>,
    start: Instant,
}

impl StageTimer {
    pub fn start(state: PipelineState) -> Self {
        Self {
            state,
            started_at: Utc::now(),
            start: Instant::now(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Close the attempt as successful and log the transition line
    pub fn success(self, metrics: StageMetrics) -> StageEntry {
        let entry = StageEntry {
            stage: self.state.as_str().to_string(),
            status: StageStatus::Success,
            rows_in: metrics.rows_in,
            rows_out: metrics.rows_out,
            started_at: self.started_at,
            finished_at: Utc::now(),
            detail: metrics.detail,
        };
        info!(
            "Stage {} passed - rows in {}, rows out {}, {}ms",
            entry.stage,
            entry.rows_in,
            entry.rows_out,
            self.start.elapsed().as_millis()
        );
        entry
    }

    /// Close the attempt as failed and log the transition line
    pub fn failure(self, rows_in: u64, error: &impl std::fmt::Display) -> StageEntry {
        let entry = StageEntry {
            stage: self.state.as_str().to_string(),
            status: StageStatus::Failed,
            rows_in,
            rows_out: 0,
            started_at: self.started_at,
            finished_at: Utc::now(),
            detail: Some(error.to_string()),
        };
        warn!(
            "Stage {} failed - rows in {}, {}ms: {}",
            entry.stage,
            entry.rows_in,
            self.start.elapsed().as_millis(),
            error
        );
        entry
    }
}
