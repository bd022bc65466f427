//! In-memory adapters (tests and dry runs)

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use uuid::Uuid;

use crate::domain::{
    LockAttempt, ModelTable, RunLedger, RunLock, RunRecord, RunStatus, StageEntry, StagedRecord,
    Warehouse,
};
use crate::{Result, StorageError};

/// Warehouse kept entirely in memory
#[derive(Default)]
pub struct InMemoryWarehouse {
    staged: Mutex<Vec<StagedRecord>>,
    models: Mutex<BTreeMap<String, ModelTable>>,
    writes: AtomicUsize,
}

impl InMemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of replace operations performed so far
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Warehouse for InMemoryWarehouse {
    async fn replace_staged(&self, records: &[StagedRecord]) -> Result<usize> {
        let mut staged = self.staged.lock();
        *staged = records.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(staged.len())
    }

    async fn load_staged(&self) -> Result<Vec<StagedRecord>> {
        Ok(self.staged.lock().clone())
    }

    async fn count_staged(&self) -> Result<usize> {
        Ok(self.staged.lock().len())
    }

    async fn replace_models(&self, tables: &[ModelTable]) -> Result<()> {
        let mut models = self.models.lock();
        for table in tables {
            models.insert(table.name.clone(), table.clone());
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load_model(&self, name: &str) -> Result<ModelTable> {
        self.models
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::table_not_found(format!("gold.{}", name)))
    }

    async fn model_names(&self) -> Result<Vec<String>> {
        Ok(self.models.lock().keys().cloned().collect())
    }
}

/// Run ledger kept entirely in memory
#[derive(Default)]
pub struct InMemoryRunLedger {
    lock: Mutex<Option<RunLock>>,
    stages: Mutex<Vec<(Uuid, StageEntry)>>,
    runs: Mutex<Vec<RunRecord>>,
}

impl InMemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_stages(&self, mut record: RunRecord) -> RunRecord {
        record.stages = self
            .stages
            .lock()
            .iter()
            .filter(|(id, _)| *id == record.run_id)
            .map(|(_, entry)| entry.clone())
            .collect();
        record
    }
}

#[async_trait]
impl RunLedger for InMemoryRunLedger {
    async fn try_acquire_lock(&self, run_id: Uuid) -> Result<LockAttempt> {
        let mut lock = self.lock.lock();
        if let Some(held) = lock.as_ref() {
            return Ok(LockAttempt::Held(held.clone()));
        }
        let acquired = RunLock {
            run_id,
            acquired_at: Utc::now(),
        };
        *lock = Some(acquired.clone());
        Ok(LockAttempt::Acquired(acquired))
    }

    async fn release_lock(&self, run_id: Uuid) -> Result<()> {
        let mut lock = self.lock.lock();
        if lock.as_ref().is_some_and(|held| held.run_id == run_id) {
            *lock = None;
        }
        Ok(())
    }

    async fn force_release_lock(&self) -> Result<Option<RunLock>> {
        Ok(self.lock.lock().take())
    }

    async fn current_lock(&self) -> Result<Option<RunLock>> {
        Ok(self.lock.lock().clone())
    }

    async fn record_stage(&self, run_id: Uuid, entry: &StageEntry) -> Result<()> {
        self.stages.lock().push((run_id, entry.clone()));
        Ok(())
    }

    async fn finish_run(&self, record: &RunRecord) -> Result<()> {
        let mut runs = self.runs.lock();
        if runs.iter().any(|r| r.run_id == record.run_id) {
            return Err(StorageError::transaction(format!(
                "Run {} already finished",
                record.run_id
            )));
        }
        let mut header = record.clone();
        header.stages.clear();
        runs.push(header);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<RunRecord> {
        let found = self
            .runs
            .lock()
            .iter()
            .find(|r| r.run_id == run_id)
            .cloned()
            .ok_or_else(|| StorageError::run_not_found(run_id))?;
        Ok(self.with_stages(found))
    }

    async fn last_successful_run(&self, dataset_id: &str) -> Result<Option<RunRecord>> {
        let found = self
            .runs
            .lock()
            .iter()
            .rev()
            .find(|r| r.dataset_id == dataset_id && r.status == RunStatus::Complete)
            .cloned();
        Ok(found.map(|r| self.with_stages(r)))
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let runs: Vec<RunRecord> = self.runs.lock().iter().rev().take(limit).cloned().collect();
        Ok(runs.into_iter().map(|r| self.with_stages(r)).collect())
    }
}
