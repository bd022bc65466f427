//! Domain models shared by the cleaned store, the model store and the run ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, StorageError};

// ═══════════════════════════════════════════════════════════════════════════
// Silver: staged customers
// ═══════════════════════════════════════════════════════════════════════════

/// Tenure bucket derived during staging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CustomerSegment {
    New,
    Growing,
    Loyal,
}

impl CustomerSegment {
    pub const ALL: [CustomerSegment; 3] = [
        CustomerSegment::New,
        CustomerSegment::Growing,
        CustomerSegment::Loyal,
    ];

    /// Half-open tenure buckets: [0, 12), [12, 36), [36, inf)
    pub fn from_tenure(tenure_months: u32) -> Self {
        match tenure_months {
            0..=11 => CustomerSegment::New,
            12..=35 => CustomerSegment::Growing,
            _ => CustomerSegment::Loyal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CustomerSegment::New => "New",
            CustomerSegment::Growing => "Growing",
            CustomerSegment::Loyal => "Loyal",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "New" => Ok(CustomerSegment::New),
            "Growing" => Ok(CustomerSegment::Growing),
            "Loyal" => Ok(CustomerSegment::Loyal),
            _ => Err(StorageError::serialization(format!(
                "Invalid customer segment: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for CustomerSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One cleaned customer row (`silver.customers_staging`)
///
/// Invariants upheld by the staging stage: `customer_id` is non-empty and
/// unique within a staged set, numeric fields are non-negative, and
/// `churned` is always a concrete boolean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRecord {
    pub customer_id: String,
    pub gender: String,
    pub senior_citizen: bool,
    pub partner: bool,
    pub dependents: bool,
    pub tenure: u32,
    pub phone_service: bool,
    pub multiple_lines: String,
    pub internet_service: String,
    pub online_security: String,
    pub online_backup: String,
    pub device_protection: String,
    pub tech_support: String,
    pub streaming_tv: String,
    pub streaming_movies: String,
    pub contract_type: String,
    pub paperless_billing: bool,
    pub payment_method: String,
    pub monthly_charges: f64,
    pub total_charges: f64,
    pub avg_monthly_revenue: f64,
    pub customer_segment: CustomerSegment,
    pub churned: bool,
    pub ingested_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Gold: model tables
// ═══════════════════════════════════════════════════════════════════════════

/// Measure kind, which fixes the storage type and rounding precision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureKind {
    /// Whole-number count
    Count,
    /// Money, 2 decimal places
    Currency,
    /// Percentage in [0, 100], 2 decimal places
    Rate,
    /// Months, 1 decimal place
    Duration,
}

impl MeasureKind {
    pub fn decimal_places(&self) -> u32 {
        match self {
            MeasureKind::Count => 0,
            MeasureKind::Currency | MeasureKind::Rate => 2,
            MeasureKind::Duration => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MeasureKind::Count => "count",
            MeasureKind::Currency => "currency",
            MeasureKind::Rate => "rate",
            MeasureKind::Duration => "duration",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "count" => Ok(MeasureKind::Count),
            "currency" => Ok(MeasureKind::Currency),
            "rate" => Ok(MeasureKind::Rate),
            "duration" => Ok(MeasureKind::Duration),
            _ => Err(StorageError::serialization(format!(
                "Invalid measure kind: {}",
                s
            ))),
        }
    }

    /// Round a raw value to this kind's precision
    pub fn round(&self, value: f64) -> f64 {
        round_to(value, self.decimal_places())
    }
}

/// Round half away from zero to `places` decimal places
pub fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Whether `value` carries no more than `places` decimal places
pub fn is_rounded_to(value: f64, places: u32) -> bool {
    let scaled = value * 10f64.powi(places as i32);
    (scaled - scaled.round()).abs() < 1e-6
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasureColumn {
    pub name: String,
    pub kind: MeasureKind,
}

impl MeasureColumn {
    pub fn new(name: impl Into<String>, kind: MeasureKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// One aggregated row: dimension values followed by measure values,
/// positionally aligned with the owning table's columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRow {
    pub dimensions: Vec<String>,
    pub measures: Vec<f64>,
}

/// Pre-aggregated analytics table (`gold.<name>`)
///
/// A model table holds no state of its own: every row is reproducible from
/// the staged set it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelTable {
    pub name: String,
    pub dimensions: Vec<String>,
    pub measures: Vec<MeasureColumn>,
    pub rows: Vec<ModelRow>,
    pub calculated_at: DateTime<Utc>,
}

impl ModelTable {
    pub fn new(
        name: impl Into<String>,
        dimensions: Vec<String>,
        measures: Vec<MeasureColumn>,
        calculated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            dimensions,
            measures,
            rows: Vec::new(),
            calculated_at,
        }
    }

    /// Append a row, rounding every measure to its declared precision
    pub fn push_row(&mut self, dimensions: Vec<String>, measures: Vec<f64>) -> Result<()> {
        if dimensions.len() != self.dimensions.len() || measures.len() != self.measures.len() {
            return Err(StorageError::schema(format!(
                "Row shape ({} dims, {} measures) does not match table {} ({} dims, {} measures)",
                dimensions.len(),
                measures.len(),
                self.name,
                self.dimensions.len(),
                self.measures.len()
            )));
        }

        let measures = measures
            .into_iter()
            .zip(&self.measures)
            .map(|(value, column)| column.kind.round(value))
            .collect();

        self.rows.push(ModelRow {
            dimensions,
            measures,
        });
        Ok(())
    }

    pub fn measure_index(&self, name: &str) -> Option<usize> {
        self.measures.iter().position(|m| m.name == name)
    }

    /// Value of measure `name` in `row`
    pub fn measure(&self, row: &ModelRow, name: &str) -> Option<f64> {
        self.measure_index(name)
            .and_then(|idx| row.measures.get(idx).copied())
    }

    /// Find a row by its full dimension key
    pub fn find_row(&self, key: &[&str]) -> Option<&ModelRow> {
        self.rows.iter().find(|row| {
            row.dimensions.len() == key.len()
                && row.dimensions.iter().zip(key).all(|(a, b)| a == b)
        })
    }

    /// All column names in storage order (dimensions, measures, calculated_at)
    pub fn column_names(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .cloned()
            .chain(self.measures.iter().map(|m| m.name.clone()))
            .chain(std::iter::once("calculated_at".to_string()))
            .collect()
    }

    pub fn qualified_name(&self) -> String {
        format!("gold.{}", self.name)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Run ledger
// ═══════════════════════════════════════════════════════════════════════════

/// Final outcome of one orchestrator invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    /// All stages ran and passed their gates
    Complete,
    /// Short-circuited: raw snapshot unchanged since the last complete run
    Skipped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Complete => "complete",
            RunStatus::Skipped => "skipped",
            RunStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "complete" => Ok(RunStatus::Complete),
            "skipped" => Ok(RunStatus::Skipped),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(StorageError::serialization(format!(
                "Invalid run status: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Success,
    Failed,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageStatus::Success => "success",
            StageStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(StageStatus::Success),
            "failed" => Ok(StageStatus::Failed),
            _ => Err(StorageError::serialization(format!(
                "Invalid stage status: {}",
                s
            ))),
        }
    }
}

/// One stage attempt within a run (append-only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: String,
    pub status: StageStatus,
    pub rows_in: u64,
    pub rows_out: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub detail: Option<String>,
}

impl StageEntry {
    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Immutable summary of one orchestrator invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub dataset_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Checksum of the raw batch this run ingested, if ingestion succeeded
    pub raw_checksum: Option<String>,
    /// Landing artifact location of that batch
    pub raw_artifact: Option<String>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
    pub stages: Vec<StageEntry>,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Complete | RunStatus::Skipped)
    }
}

/// Holder of the scoped run lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLock {
    pub run_id: Uuid,
    pub acquired_at: DateTime<Utc>,
}

/// Result of a lock acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired(RunLock),
    Held(RunLock),
}
