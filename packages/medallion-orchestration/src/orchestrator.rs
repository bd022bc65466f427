use chrono::{DateTime, Utc};
use medallion_storage::{
    LockAttempt, ModelTable, RunLedger, RunRecord, RunStatus, StageEntry, Warehouse,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{IdempotencyMode, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::pipeline::{StageMetrics, StageTimer};
use crate::raw_store::{fetch_batch, RawBatch, RawStore, RawTable};
use crate::source::DatasetSource;
use crate::stages::{BusinessInsights, GoldBuilder, SilverTransformer, StagedSet};
use crate::state::{PipelineState, RunStateMachine};
use crate::validation::{Dataset, ValidationReport, Validator};

/// Result of one `run()` invocation
///
/// A run that reached `Failed` is still an `Ok` outcome: the error is kept in
/// `error` and the run record has already been written.
#[derive(Debug)]
pub struct RunOutcome {
    pub final_state: PipelineState,
    pub record: RunRecord,
    pub reports: Vec<ValidationReport>,
    /// Model tables written by this run (empty unless modeling succeeded)
    pub tables: Vec<ModelTable>,
    /// Read off `tables` once the gold gate has passed
    pub insights: Option<BusinessInsights>,
    pub error: Option<PipelineError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn was_skipped(&self) -> bool {
        self.record.status == RunStatus::Skipped
    }

    /// 0 for complete or skipped runs, the error's code otherwise
    pub fn exit_code(&self) -> i32 {
        self.error.as_ref().map_or(0, PipelineError::exit_code)
    }
}

/// Everything a run accumulates on its way through the stages
struct RunProgress {
    run_id: Uuid,
    batch: Option<RawBatch>,
    stages: Vec<StageEntry>,
    reports: Vec<ValidationReport>,
    tables: Vec<ModelTable>,
    insights: Option<BusinessInsights>,
}

impl RunProgress {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            batch: None,
            stages: Vec::new(),
            reports: Vec::new(),
            tables: Vec::new(),
            insights: None,
        }
    }
}

/// Medallion pipeline orchestrator
///
/// Drives one dataset through raw landing, staging and modeling, gating each
/// layer on its validation report. All collaborators are injected.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    source: Arc<dyn DatasetSource>,
    raw_store: Arc<dyn RawStore>,
    warehouse: Arc<dyn Warehouse>,
    ledger: Arc<dyn RunLedger>,
    validator: Validator,
    transformer: SilverTransformer,
    builder: GoldBuilder,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn DatasetSource>,
        raw_store: Arc<dyn RawStore>,
        warehouse: Arc<dyn Warehouse>,
        ledger: Arc<dyn RunLedger>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            validator: Validator::new(config.severity.clone(), config.min_sample_size),
            transformer: SilverTransformer::new(config.dedup_policy, config.row_error_policy),
            builder: GoldBuilder::new(config.min_sample_size),
            config,
            source,
            raw_store,
            warehouse,
            ledger,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute one run (main entry point)
    ///
    /// Returns `Err(RunInProgress)` without touching any store when another
    /// run holds the lock. Ledger failures while closing the run are also
    /// returned as `Err`; everything else ends up in `RunOutcome::error`.
    pub async fn run(&self) -> Result<RunOutcome> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        match self.ledger.try_acquire_lock(run_id).await? {
            LockAttempt::Held(holder) => {
                warn!(
                    "Run {}: lock held by run {} since {}, not starting",
                    run_id, holder.run_id, holder.acquired_at
                );
                return Err(PipelineError::RunInProgress {
                    holder: holder.run_id.to_string(),
                });
            }
            LockAttempt::Acquired(_) => {}
        }

        let result = self.run_locked(run_id, started_at).await;

        // Released on every path, after the run record is written
        let released = self.ledger.release_lock(run_id).await;
        let outcome = result?;
        released?;
        Ok(outcome)
    }

    async fn run_locked(&self, run_id: Uuid, started_at: DateTime<Utc>) -> Result<RunOutcome> {
        let start_time = Instant::now();
        info!(
            "Starting run {} for dataset {} (source: {})",
            run_id,
            self.config.dataset_id,
            self.source.describe()
        );

        let mut sm = RunStateMachine::new(run_id);
        let mut progress = RunProgress::new(run_id);

        let result = self.execute(&mut sm, &mut progress).await;

        let (status, failed_stage, error) = match result {
            Ok(()) if sm.was_skipped() => (RunStatus::Skipped, None, None),
            Ok(()) => (RunStatus::Complete, None, None),
            Err(e) => {
                let failed_in = sm.fail()?;
                error!("Run {} failed in stage {}: {}", run_id, failed_in, e);
                (RunStatus::Failed, Some(failed_in.as_str().to_string()), Some(e))
            }
        };

        let record = RunRecord {
            run_id,
            dataset_id: self.config.dataset_id.clone(),
            status,
            started_at,
            finished_at: Utc::now(),
            raw_checksum: progress.batch.as_ref().map(|b| b.checksum.clone()),
            raw_artifact: progress.batch.as_ref().map(|b| b.location.clone()),
            failed_stage,
            error: error.as_ref().map(|e| e.to_string()),
            stages: progress.stages,
        };
        self.ledger.finish_run(&record).await?;

        info!(
            "Run {} finished with status {} - {} stages in {}ms",
            run_id,
            record.status,
            record.stages.len(),
            start_time.elapsed().as_millis()
        );

        Ok(RunOutcome {
            final_state: sm.state(),
            record,
            reports: progress.reports,
            tables: progress.tables,
            insights: progress.insights,
            error,
        })
    }

    /// Walk the state machine from `Idle` to `Complete`
    async fn execute(&self, sm: &mut RunStateMachine, progress: &mut RunProgress) -> Result<()> {
        sm.begin()?;

        // ── Ingesting ──
        let timer = StageTimer::start(sm.state());
        let fetched = fetch_batch(
            self.source.as_ref(),
            self.raw_store.as_ref(),
            &self.config.dataset_id,
            self.config.fetch_timeout(),
        )
        .await
        .map(|(batch, table)| {
            let metrics = StageMetrics::new(table.row_count(), table.row_count())
                .with_detail(format!("{} (sha256 {})", batch.location, batch.checksum));
            ((batch, table), metrics)
        });
        let (batch, table) = self.close_stage(progress, timer, 0, fetched).await?;
        progress.batch = Some(batch.clone());

        if self.is_unchanged(&batch).await? {
            info!(
                "Run {}: raw snapshot {} unchanged since last complete run, skipping remaining stages",
                progress.run_id, batch.checksum
            );
            sm.skip_unchanged()?;
            return Ok(());
        }

        // ── ValidatingRaw ──
        sm.advance()?;
        self.gate(progress, sm.state(), Dataset::Raw(&table), table.row_count())
            .await?;

        // ── Staging ──
        sm.advance()?;
        let timer = StageTimer::start(sm.state());
        let staged = self.stage_silver(&table, batch.ingested_at).await;
        let staged = self
            .close_stage(progress, timer, table.row_count() as u64, staged)
            .await?;

        // ── ValidatingSilver ──
        sm.advance()?;
        let rows = staged.records.len();
        self.gate(progress, sm.state(), Dataset::Silver(&staged.records), rows)
            .await?;

        // ── Modeling ──
        sm.advance()?;
        let timer = StageTimer::start(sm.state());
        let built = self.build_gold(&staged).await;
        let tables = self.close_stage(progress, timer, rows as u64, built).await?;

        // ── ValidatingGold ──
        sm.advance()?;
        let model_rows = tables.iter().map(|t| t.rows.len()).sum();
        let gated = self
            .gate(progress, sm.state(), Dataset::Gold(&tables), model_rows)
            .await;
        progress.tables = tables;
        gated?;

        progress.insights = BusinessInsights::from_tables(&progress.tables);
        if let Some(insights) = &progress.insights {
            insights.log();
        }

        sm.advance()?;
        Ok(())
    }

    /// Whether `batch` matches the checksum of the last complete run
    async fn is_unchanged(&self, batch: &RawBatch) -> Result<bool> {
        if self.config.idempotency != IdempotencyMode::SkipIfUnchanged {
            return Ok(false);
        }
        let last = self
            .ledger
            .last_successful_run(&self.config.dataset_id)
            .await?;
        Ok(last
            .and_then(|run| run.raw_checksum)
            .is_some_and(|previous| previous == batch.checksum))
    }

    /// Coerce the raw table and fully refresh the cleaned store
    async fn stage_silver(
        &self,
        table: &RawTable,
        ingested_at: DateTime<Utc>,
    ) -> Result<(StagedSet, StageMetrics)> {
        let staged = self.transformer.transform(table, ingested_at)?;
        let written = self.warehouse.replace_staged(&staged.records).await?;
        let metrics = StageMetrics::new(staged.rows_in, written).with_detail(staged.summary());
        Ok((staged, metrics))
    }

    /// Aggregate every model and fully refresh the model store
    async fn build_gold(&self, staged: &StagedSet) -> Result<(Vec<ModelTable>, StageMetrics)> {
        let tables = self.builder.build(&staged.records, Utc::now())?;
        self.warehouse.replace_models(&tables).await?;

        let rows_out = tables.iter().map(|t| t.rows.len()).sum();
        let names: Vec<&str> = tables.iter().map(|t| t.name.as_str()).collect();
        let metrics =
            StageMetrics::new(staged.records.len(), rows_out).with_detail(names.join(", "));
        Ok((tables, metrics))
    }

    /// Run the validator for one layer and enforce its critical checks
    async fn gate(
        &self,
        progress: &mut RunProgress,
        state: PipelineState,
        dataset: Dataset<'_>,
        rows: usize,
    ) -> Result<()> {
        let timer = StageTimer::start(state);
        let report = self.validator.validate(dataset);
        let summary = report.summary();
        let enforced = report.enforce();
        progress.reports.push(report);

        let gated = enforced.map(|()| ((), StageMetrics::new(rows, rows).with_detail(summary)));
        self.close_stage(progress, timer, rows as u64, gated).await
    }

    /// Append the stage attempt to the ledger and pass the stage result through
    async fn close_stage<T>(
        &self,
        progress: &mut RunProgress,
        timer: StageTimer,
        rows_in: u64,
        result: Result<(T, StageMetrics)>,
    ) -> Result<T> {
        match result {
            Ok((value, metrics)) => {
                let entry = timer.success(metrics);
                self.ledger.record_stage(progress.run_id, &entry).await?;
                progress.stages.push(entry);
                Ok(value)
            }
            Err(e) => {
                let entry = timer.failure(rows_in, &e);
                if let Err(ledger_err) = self.ledger.record_stage(progress.run_id, &entry).await {
                    warn!(
                        "Run {}: could not record failed stage {}: {}",
                        progress.run_id, entry.stage, ledger_err
                    );
                }
                progress.stages.push(entry);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DedupPolicy, SourceConfig};
    use crate::raw_store::InMemoryRawStore;
    use crate::source::InMemorySource;
    use crate::stages::silver::tests::{csv_row, HEADER};
    use medallion_storage::{InMemoryRunLedger, InMemoryWarehouse, StageStatus};

    fn csv(rows: usize) -> String {
        let mut out = String::from(HEADER);
        for i in 0..rows {
            let churn = if i % 4 == 0 { "Yes" } else { "No" };
            let tenure = (i * 3) % 72;
            out.push('\n');
            out.push_str(&csv_row(
                &format!("C-{:04}", i),
                &tenure.to_string(),
                "50.00",
                &format!("{:.2}", 50.0 * tenure as f64),
                churn,
            ));
        }
        out.push('\n');
        out
    }

    fn config() -> PipelineConfig {
        let mut config = PipelineConfig::new(
            SourceConfig::Local {
                path: "unused.csv".into(),
            },
            DedupPolicy::KeepFirst,
        );
        config.min_sample_size = 1;
        config
    }

    fn orchestrator(
        source: InMemorySource,
    ) -> (PipelineOrchestrator, Arc<InMemoryWarehouse>, Arc<InMemoryRunLedger>) {
        let warehouse = Arc::new(InMemoryWarehouse::new());
        let ledger = Arc::new(InMemoryRunLedger::new());
        let orchestrator = PipelineOrchestrator::new(
            config(),
            Arc::new(source),
            Arc::new(InMemoryRawStore::new()),
            warehouse.clone(),
            ledger.clone(),
        )
        .unwrap();
        (orchestrator, warehouse, ledger)
    }

    #[tokio::test]
    async fn test_complete_run_records_every_stage() {
        let (orchestrator, warehouse, ledger) = orchestrator(InMemorySource::new(csv(40)));

        let outcome = orchestrator.run().await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.final_state, PipelineState::Complete);
        assert_eq!(outcome.record.status, RunStatus::Complete);
        assert_eq!(outcome.reports.len(), 3);
        assert_eq!(outcome.tables.len(), 4);
        assert_eq!(warehouse.write_count(), 2);
        let insights = outcome.insights.as_ref().unwrap();
        assert_eq!(insights.total_customers, 40.0);

        let stages: Vec<&str> = outcome.record.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(
            stages,
            vec![
                "ingesting",
                "validating_raw",
                "staging",
                "validating_silver",
                "modeling",
                "validating_gold"
            ]
        );

        let stored = ledger.get_run(outcome.record.run_id).await.unwrap();
        assert_eq!(stored.stages.len(), 6);
        assert!(ledger.current_lock().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_stage_is_recorded() {
        let (orchestrator, warehouse, ledger) =
            orchestrator(InMemorySource::failing("connection refused"));

        let outcome = orchestrator.run().await.unwrap();
        assert_eq!(outcome.final_state, PipelineState::Failed);
        assert!(matches!(
            outcome.error,
            Some(PipelineError::SourceUnavailable { .. })
        ));
        assert_eq!(outcome.exit_code(), 10);
        assert_eq!(outcome.record.failed_stage.as_deref(), Some("ingesting"));
        assert_eq!(outcome.record.stages[0].status, StageStatus::Failed);
        assert!(outcome.record.raw_checksum.is_none());
        assert!(outcome.insights.is_none());
        assert_eq!(warehouse.write_count(), 0);
        assert!(ledger.current_lock().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_held_lock_is_not_released_by_rejected_run() {
        let (orchestrator, _warehouse, ledger) = orchestrator(InMemorySource::new(csv(10)));
        let holder = Uuid::new_v4();
        ledger.try_acquire_lock(holder).await.unwrap();

        let err = orchestrator.run().await.unwrap_err();
        assert_eq!(err.exit_code(), 20);
        assert_eq!(ledger.current_lock().await.unwrap().unwrap().run_id, holder);
        assert!(ledger.recent_runs(10).await.unwrap().is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = config();
        config.min_sample_size = 0;

        let result = PipelineOrchestrator::new(
            config,
            Arc::new(InMemorySource::new("")),
            Arc::new(InMemoryRawStore::new()),
            Arc::new(InMemoryWarehouse::new()),
            Arc::new(InMemoryRunLedger::new()),
        );
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }
}
