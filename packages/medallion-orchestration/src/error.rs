use medallion_storage::StorageError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::validation::{CheckKind, ValidationStage};

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Source unavailable for dataset {dataset}: {reason}")]
    SourceUnavailable { dataset: String, reason: String },

    #[error("Empty payload for dataset {dataset}: no data rows")]
    EmptyPayload { dataset: String },

    #[error("Validation failed at {stage} stage ({check} check): {detail}")]
    ValidationFailure {
        stage: ValidationStage,
        check: CheckKind,
        detail: String,
    },

    #[error("Transformation error for record {record_id}: {reason}")]
    TransformationError { record_id: String, reason: String },

    #[error("Aggregation error for table {table}: {reason}")]
    AggregationError { table: String, reason: String },

    #[error("Run in progress: lock held by run {holder}")]
    RunInProgress { holder: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

impl PipelineError {
    pub fn source_unavailable(dataset: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::SourceUnavailable {
            dataset: dataset.into(),
            reason: reason.to_string(),
        }
    }

    pub fn transformation(record_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransformationError {
            record_id: record_id.into(),
            reason: reason.into(),
        }
    }

    pub fn aggregation(table: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AggregationError {
            table: table.into(),
            reason: reason.into(),
        }
    }

    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    /// Process exit code for the `medallion` binary
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::SourceUnavailable { .. } | PipelineError::EmptyPayload { .. } => 10,
            PipelineError::ValidationFailure { stage, .. } => match stage {
                ValidationStage::Raw => 11,
                ValidationStage::Silver => 13,
                ValidationStage::Gold => 15,
            },
            PipelineError::TransformationError { .. } => 12,
            PipelineError::AggregationError { .. } => 14,
            PipelineError::RunInProgress { .. } => 20,
            PipelineError::Config(_) => 2,
            PipelineError::Storage(_)
            | PipelineError::Io(_)
            | PipelineError::Serialization(_)
            | PipelineError::InvalidStateTransition { .. } => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_per_stage() {
        let cases = [
            (PipelineError::source_unavailable("telco", "timeout"), 10),
            (
                PipelineError::EmptyPayload {
                    dataset: "telco".to_string(),
                },
                10,
            ),
            (
                PipelineError::ValidationFailure {
                    stage: ValidationStage::Raw,
                    check: CheckKind::Schema,
                    detail: String::new(),
                },
                11,
            ),
            (PipelineError::transformation("7590-VHVEG", "bad tenure"), 12),
            (
                PipelineError::ValidationFailure {
                    stage: ValidationStage::Silver,
                    check: CheckKind::Null,
                    detail: String::new(),
                },
                13,
            ),
            (PipelineError::aggregation("churn_summary", "empty"), 14),
            (
                PipelineError::ValidationFailure {
                    stage: ValidationStage::Gold,
                    check: CheckKind::Type,
                    detail: String::new(),
                },
                15,
            ),
            (
                PipelineError::RunInProgress {
                    holder: "x".to_string(),
                },
                20,
            ),
            (PipelineError::Config(ConfigError::Invalid("x".to_string())), 2),
            (PipelineError::serialization("bad json"), 1),
        ];

        for (err, code) in cases {
            assert_eq!(err.exit_code(), code, "{}", err);
        }
    }

    #[test]
    fn test_validation_failure_message() {
        let err = PipelineError::ValidationFailure {
            stage: ValidationStage::Silver,
            check: CheckKind::Uniqueness,
            detail: "2 duplicate customer_id values".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Validation failed at silver stage (uniqueness check): 2 duplicate customer_id values"
        );
    }
}
