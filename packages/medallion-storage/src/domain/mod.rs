//! Domain layer for the medallion stores
//!
//! # Domain Models
//!
//! - `StagedRecord`: one cleaned customer (silver)
//! - `ModelTable`: pre-aggregated analytics table (gold)
//! - `RunRecord` / `StageEntry`: execution history
//!
//! # Port Traits
//!
//! - `Warehouse`: cleaned + model store
//! - `RunLedger`: run history and run lock
//!
//! # Examples
//!
//! ```rust,ignore
//! use medallion_storage::domain::{ModelTable, Warehouse};
//!
//! async fn publish(store: &dyn Warehouse, tables: Vec<ModelTable>) -> Result<()> {
//!     // All tables become visible together, or none do
//!     store.replace_models(&tables).await?;
//!     let summary = store.load_model("churn_summary").await?;
//!     assert!(!summary.is_empty());
//!     Ok(())
//! }
//! ```

pub mod models;
pub mod ports;

pub use models::{
    is_rounded_to, round_to, CustomerSegment, LockAttempt, MeasureColumn, MeasureKind,
    ModelRow, ModelTable, RunLock, RunRecord, RunStatus, StageEntry, StageStatus, StagedRecord,
};
pub use ports::{RunLedger, Warehouse};
