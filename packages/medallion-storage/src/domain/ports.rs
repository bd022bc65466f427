//! Storage ports
//!
//! `Warehouse` is the relational store reached by the silver and gold stages.
//! `RunLedger` is the append-only execution log that also hosts the run lock.

use async_trait::async_trait;
use uuid::Uuid;

use super::models::{LockAttempt, ModelTable, RunLock, RunRecord, StageEntry, StagedRecord};
use crate::Result;

/// Cleaned store (`silver`) and model store (`gold`)
///
/// Both replace operations are full refreshes: either the whole new content
/// becomes visible or the previous content stays in place.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Replace `silver.customers_staging` with `records`
    async fn replace_staged(&self, records: &[StagedRecord]) -> Result<usize>;

    /// Load the current staged set
    async fn load_staged(&self) -> Result<Vec<StagedRecord>>;

    async fn count_staged(&self) -> Result<usize>;

    /// Replace every given model table in one atomic step
    async fn replace_models(&self, tables: &[ModelTable]) -> Result<()>;

    /// Load a model table by name (without the `gold.` prefix)
    async fn load_model(&self, name: &str) -> Result<ModelTable>;

    /// Names of the model tables currently present, sorted
    async fn model_names(&self) -> Result<Vec<String>>;
}

/// Append-only run history plus the cross-invocation run lock
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Take the run lock for `run_id`, or report the current holder
    async fn try_acquire_lock(&self, run_id: Uuid) -> Result<LockAttempt>;

    /// Release the lock if `run_id` holds it; a no-op otherwise
    async fn release_lock(&self, run_id: Uuid) -> Result<()>;

    /// Drop the lock regardless of holder, returning who held it
    async fn force_release_lock(&self) -> Result<Option<RunLock>>;

    async fn current_lock(&self) -> Result<Option<RunLock>>;

    /// Append one stage attempt for a run in progress
    async fn record_stage(&self, run_id: Uuid, entry: &StageEntry) -> Result<()>;

    /// Write the final run summary. Fails if the run was already finished.
    async fn finish_run(&self, record: &RunRecord) -> Result<()>;

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord>;

    /// Latest run with status `Complete` for the dataset
    async fn last_successful_run(&self, dataset_id: &str) -> Result<Option<RunRecord>>;

    /// Most recent runs first
    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>>;
}
