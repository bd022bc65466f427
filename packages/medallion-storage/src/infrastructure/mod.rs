//! Storage adapters

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;
