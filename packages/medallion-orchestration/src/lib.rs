/*
 * Medallion Orchestration - bronze / silver / gold batch pipeline
 *
 * Lands a raw customer-churn extract, stages it into a typed cleaned store
 * and rebuilds the analytics models, gating every layer on data-quality checks.
 *
 * Architecture:
 * - Run State Machine (Idle -> ... -> Complete | Failed)
 * - Run Lock + Ledger (SQLite, shared with the warehouse)
 * - Raw Landing (immutable CSV artifacts + checksum)
 * - Silver Staging / Gold Modeling (full refresh)
 * - Validation Gates (critical / warning / waived), reported per run
 */

// Public modules
pub mod config;
pub mod error;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod raw_store;
pub mod reports;
pub mod source;
pub mod stages;
pub mod state;
pub mod validation;

// Re-exports
pub use config::{
    ConfigError, DedupPolicy, IdempotencyMode, PipelineConfig, RowErrorPolicy, Severity,
    SeverityConfig, SourceConfig,
};
pub use error::{PipelineError, Result};
pub use orchestrator::{PipelineOrchestrator, RunOutcome};
pub use pipeline::{StageMetrics, StageTimer};
pub use raw_store::{fetch_batch, FsRawStore, InMemoryRawStore, RawBatch, RawStore, RawTable};
pub use source::{source_from_config, DatasetSource, HttpSource, InMemorySource, LocalFileSource};
pub use reports::{read_validation_report, write_run_reports};
pub use stages::{BusinessInsights, GoldBuilder, SilverTransformer, StagedSet};
pub use state::{PipelineState, RunStateMachine};
pub use validation::{
    CheckKind, CheckResult, CheckStatus, Dataset, ValidationReport, ValidationStage, Validator,
};
