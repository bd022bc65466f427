//! medallion-storage - cleaned store, model store and run ledger
//!
//! ## Layout
//!
//! - `silver.customers_staging`: typed, deduplicated customers (full refresh)
//! - `gold.<model>`: aggregated analytics tables, each with `calculated_at`
//! - `pipeline_runs` / `pipeline_stage_runs` / `pipeline_lock`: run ledger
//!
//! ## Usage
//!
//! ```rust,ignore
//! use medallion_storage::{SqliteStore, Warehouse, RunLedger};
//!
//! let store = SqliteStore::open("warehouse.db")?;
//! store.replace_staged(&records).await?;
//! let last = store.last_successful_run("telco-customer-churn").await?;
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    is_rounded_to, round_to, CustomerSegment, LockAttempt, MeasureColumn, MeasureKind, ModelRow,
    ModelTable, RunLedger, RunLock, RunRecord, RunStatus, StageEntry, StageStatus, StagedRecord,
    Warehouse,
};
pub use infrastructure::memory::{InMemoryRunLedger, InMemoryWarehouse};
#[cfg(feature = "sqlite")]
pub use infrastructure::sqlite::SqliteStore;
