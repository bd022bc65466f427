// Stage implementations
pub mod gold;
pub mod insights;
pub mod silver;

// Re-exports
pub use gold::{GoldBuilder, ModelDefinition, MODEL_DEFINITIONS};
pub use insights::BusinessInsights;
pub use silver::{RowRejection, SilverTransformer, StagedSet};
