//! Stage-specific data-quality gates
//!
//! Each stage runs the same six check kinds against its own data:
//!
//! | check        | raw (CSV)                    | silver (staged)              | gold (models)                 |
//! |--------------|------------------------------|------------------------------|-------------------------------|
//! | schema       | required headers             | categorical fields non-empty | expected tables and columns   |
//! | null         | `customerID`, `Churn`        | `customer_id`                | dimension cells               |
//! | type         | tenure / charges parse       | charges finite, non-negative | rates in range, rounding      |
//! | uniqueness   | `customerID`                 | `customer_id`                | dimension key per table       |
//! | business     | churn / senior encodings     | segment and revenue derive   | executive total = segments    |
//! | sample_size  | row count                    | rows per segment             | customers per segment         |
//!
//! Severity decides what a failure does: `critical` aborts the run,
//! `warning` is logged, `waived` skips the check entirely.

mod checks;

use medallion_storage::{ModelTable, StagedRecord};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{Severity, SeverityConfig};
use crate::error::{PipelineError, Result};
use crate::raw_store::RawTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStage {
    Raw,
    Silver,
    Gold,
}

impl ValidationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStage::Raw => "raw",
            ValidationStage::Silver => "silver",
            ValidationStage::Gold => "gold",
        }
    }
}

impl std::fmt::Display for ValidationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Schema,
    Null,
    Type,
    Uniqueness,
    Business,
    SampleSize,
}

impl CheckKind {
    pub const ALL: [CheckKind; 6] = [
        CheckKind::Schema,
        CheckKind::Null,
        CheckKind::Type,
        CheckKind::Uniqueness,
        CheckKind::Business,
        CheckKind::SampleSize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Schema => "schema",
            CheckKind::Null => "null",
            CheckKind::Type => "type",
            CheckKind::Uniqueness => "uniqueness",
            CheckKind::Business => "business",
            CheckKind::SampleSize => "sample_size",
        }
    }
}

impl std::fmt::Display for CheckKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Failed,
    Waived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub check: CheckKind,
    pub status: CheckStatus,
    pub severity: Severity,
    pub offending_rows: usize,
    pub detail: String,
}

impl CheckResult {
    pub fn is_blocking(&self) -> bool {
        self.status == CheckStatus::Failed && self.severity == Severity::Critical
    }
}

/// Outcome of every check for one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub stage: ValidationStage,
    pub checks: Vec<CheckResult>,
}

impl ValidationReport {
    pub fn get(&self, check: CheckKind) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.check == check)
    }

    /// First failed critical check, if any
    pub fn blocking_failure(&self) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.is_blocking())
    }

    pub fn warnings(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Failed && c.severity == Severity::Warning)
    }

    pub fn passed(&self) -> bool {
        self.blocking_failure().is_none()
    }

    /// e.g. `5 passed, 1 failed, 0 waived`
    pub fn summary(&self) -> String {
        let count = |status: CheckStatus| self.checks.iter().filter(|c| c.status == status).count();
        format!(
            "{} passed, {} failed, {} waived",
            count(CheckStatus::Passed),
            count(CheckStatus::Failed),
            count(CheckStatus::Waived)
        )
    }

    /// Log warnings and turn a critical failure into `ValidationFailure`
    pub fn enforce(&self) -> Result<()> {
        for w in self.warnings() {
            warn!(
                "Validation warning at {} stage ({} check, {} rows): {}",
                self.stage, w.check, w.offending_rows, w.detail
            );
        }
        match self.blocking_failure() {
            Some(failure) => Err(PipelineError::ValidationFailure {
                stage: self.stage,
                check: failure.check,
                detail: failure.detail.clone(),
            }),
            None => Ok(()),
        }
    }
}

/// Data handed to the validator
#[derive(Debug, Clone, Copy)]
pub enum Dataset<'a> {
    Raw(&'a RawTable),
    Silver(&'a [StagedRecord]),
    Gold(&'a [ModelTable]),
}

impl Dataset<'_> {
    pub fn stage(&self) -> ValidationStage {
        match self {
            Dataset::Raw(_) => ValidationStage::Raw,
            Dataset::Silver(_) => ValidationStage::Silver,
            Dataset::Gold(_) => ValidationStage::Gold,
        }
    }
}

/// Offending row count plus a human-readable description
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Finding {
    pub offending: usize,
    pub detail: String,
}

impl Finding {
    pub fn clean(detail: impl Into<String>) -> Self {
        Self {
            offending: 0,
            detail: detail.into(),
        }
    }

    pub fn offending(count: usize, detail: impl Into<String>) -> Self {
        Self {
            offending: count,
            detail: detail.into(),
        }
    }
}

pub struct Validator {
    severity: SeverityConfig,
    min_sample_size: usize,
}

impl Validator {
    pub fn new(severity: SeverityConfig, min_sample_size: usize) -> Self {
        Self {
            severity,
            min_sample_size,
        }
    }

    pub fn validate(&self, dataset: Dataset<'_>) -> ValidationReport {
        let stage = dataset.stage();
        let checks = CheckKind::ALL
            .iter()
            .map(|&check| {
                let severity = self.severity.for_check(stage, check);
                if severity == Severity::Waived {
                    return CheckResult {
                        check,
                        status: CheckStatus::Waived,
                        severity,
                        offending_rows: 0,
                        detail: "waived".to_string(),
                    };
                }

                let finding = checks::run(check, dataset, self.min_sample_size);
                CheckResult {
                    check,
                    status: if finding.offending == 0 {
                        CheckStatus::Passed
                    } else {
                        CheckStatus::Failed
                    },
                    severity,
                    offending_rows: finding.offending,
                    detail: finding.detail,
                }
            })
            .collect();

        ValidationReport { stage, checks }
    }
}
