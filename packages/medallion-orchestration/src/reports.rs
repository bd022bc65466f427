//! Per-run report files
//!
//! ```text
//! <report_dir>/<dataset>/<run_id>/raw_validation.json
//! <report_dir>/<dataset>/<run_id>/silver_validation.json
//! <report_dir>/<dataset>/<run_id>/gold_validation.json
//! <report_dir>/<dataset>/<run_id>/insights.json
//! ```
//!
//! Only the gates a run actually reached get a file. A skipped run writes
//! nothing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::orchestrator::RunOutcome;
use crate::validation::{ValidationReport, ValidationStage};

#[derive(Serialize)]
struct ReportFile<'a, T: Serialize> {
    run_id: Uuid,
    dataset_id: &'a str,
    written_at: DateTime<Utc>,
    #[serde(flatten)]
    body: &'a T,
}

pub fn run_report_dir(report_dir: &Path, dataset_id: &str, run_id: Uuid) -> PathBuf {
    report_dir.join(dataset_id).join(run_id.to_string())
}

pub fn validation_file_name(stage: ValidationStage) -> String {
    format!("{}_validation.json", stage)
}

async fn write_json<T: Serialize>(
    path: PathBuf,
    run_id: Uuid,
    dataset_id: &str,
    body: &T,
) -> Result<PathBuf> {
    let file = ReportFile {
        run_id,
        dataset_id,
        written_at: Utc::now(),
        body,
    };
    let bytes = serde_json::to_vec_pretty(&file).map_err(PipelineError::serialization)?;
    tokio::fs::write(&path, bytes).await?;
    debug!("Wrote report {}", path.display());
    Ok(path)
}

/// Write the validation reports and insights of `outcome`, returning the
/// files written
pub async fn write_run_reports(report_dir: &Path, outcome: &RunOutcome) -> Result<Vec<PathBuf>> {
    if outcome.reports.is_empty() && outcome.insights.is_none() {
        return Ok(Vec::new());
    }

    let record = &outcome.record;
    let dir = run_report_dir(report_dir, &record.dataset_id, record.run_id);
    tokio::fs::create_dir_all(&dir).await?;

    let mut written = Vec::with_capacity(outcome.reports.len() + 1);
    for report in &outcome.reports {
        let path = dir.join(validation_file_name(report.stage));
        written.push(write_json(path, record.run_id, &record.dataset_id, report).await?);
    }
    if let Some(insights) = &outcome.insights {
        let path = dir.join("insights.json");
        written.push(write_json(path, record.run_id, &record.dataset_id, insights).await?);
    }
    Ok(written)
}

/// Load a validation report written by `write_run_reports`
pub async fn read_validation_report(path: &Path) -> Result<ValidationReport> {
    let bytes = tokio::fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(PipelineError::serialization)
}
