//! Raw (bronze) landing area
//!
//! Every fetch lands exactly one new, immutable artifact:
//!
//! ```text
//! <landing>/<dataset>/<dataset>_<YYYYMMDDTHHMMSS.ffffffZ>.csv
//! <landing>/<dataset>/<dataset>_<YYYYMMDDTHHMMSS.ffffffZ>.meta.json
//! ```
//!
//! Existing artifacts are never rewritten. A name collision is an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::source::DatasetSource;
use crate::validation::{CheckKind, ValidationStage};

/// Handle to one landed artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBatch {
    pub location: String,
    pub dataset_id: String,
    pub ingested_at: DateTime<Utc>,
    /// Data rows, header excluded
    pub row_count: usize,
    /// SHA-256, lowercase hex
    pub checksum: String,
    pub byte_size: u64,
}

/// One CSV line that could not be framed as a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRow {
    pub line: u64,
    pub reason: String,
}

/// Parsed view of a raw batch; blank cells are `None`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<Option<String>>>,
    pub malformed: Vec<MalformedRow>,
}

impl RawTable {
    /// Parse CSV bytes. Framing errors are collected per line, not raised.
    ///
    /// A header that cannot be decoded is a raw schema failure.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .from_reader(payload);

        let headers = match reader.headers() {
            Ok(headers) => headers.iter().map(|h| h.trim().to_string()).collect(),
            Err(e) => {
                return Err(PipelineError::ValidationFailure {
                    stage: ValidationStage::Raw,
                    check: CheckKind::Schema,
                    detail: format!("unreadable CSV header: {}", e),
                })
            }
        };

        let mut rows = Vec::new();
        let mut malformed = Vec::new();
        for (idx, record) in reader.records().enumerate() {
            match record {
                Ok(record) => rows.push(
                    record
                        .iter()
                        .map(|cell| {
                            let trimmed = cell.trim();
                            (!trimmed.is_empty()).then(|| trimmed.to_string())
                        })
                        .collect(),
                ),
                Err(e) => malformed.push(MalformedRow {
                    line: e
                        .position()
                        .map(|p| p.line())
                        .unwrap_or(idx as u64 + 2),
                    reason: e.to_string(),
                }),
            }
        }

        Ok(Self {
            headers,
            rows,
            malformed,
        })
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    /// Value of column `col` in `row`, `None` when blank or absent
    pub fn cell<'a>(&self, row: &'a [Option<String>], col: usize) -> Option<&'a str> {
        row.get(col).and_then(|c| c.as_deref())
    }

    /// Data rows seen, including malformed ones
    pub fn row_count(&self) -> usize {
        self.rows.len() + self.malformed.len()
    }
}

/// SHA-256 of a payload, lowercase hex
pub fn checksum(payload: &[u8]) -> String {
    format!("{:x}", Sha256::digest(payload))
}

/// Artifact file stem for a dataset at a timestamp
pub fn artifact_stem(dataset_id: &str, ingested_at: DateTime<Utc>) -> String {
    format!(
        "{}_{}",
        dataset_id,
        ingested_at.format("%Y%m%dT%H%M%S%.6fZ")
    )
}

#[async_trait]
pub trait RawStore: Send + Sync {
    /// Persist `payload` unmodified as a new artifact
    async fn land(&self, batch: &RawBatch, payload: &[u8]) -> Result<()>;

    async fn read_bytes(&self, batch: &RawBatch) -> Result<Vec<u8>>;

    /// Landed batches for a dataset, oldest first
    async fn list(&self, dataset_id: &str) -> Result<Vec<RawBatch>>;

    /// Where an artifact for `dataset_id` at `ingested_at` would live
    fn location_for(&self, dataset_id: &str, ingested_at: DateTime<Utc>) -> String;

    async fn read(&self, batch: &RawBatch) -> Result<RawTable> {
        let bytes = self.read_bytes(batch).await?;
        RawTable::parse(&bytes)
    }
}

/// Fetch from `source` and land one new raw batch
///
/// Fails with `SourceUnavailable` on fetch failure or timeout and with
/// `EmptyPayload` when the file carries no data rows. A header that does not
/// decode fails the raw schema check. Nothing is landed in any of these cases.
pub async fn fetch_batch(
    source: &dyn DatasetSource,
    store: &dyn RawStore,
    dataset_id: &str,
    timeout: Duration,
) -> Result<(RawBatch, RawTable)> {
    info!("Fetching dataset {} from {}", dataset_id, source.describe());

    let payload = match tokio::time::timeout(timeout, source.fetch(dataset_id)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(PipelineError::source_unavailable(
                dataset_id,
                format!("fetch timed out after {}s", timeout.as_secs_f64()),
            ))
        }
    };

    let table = RawTable::parse(&payload)?;
    if table.row_count() == 0 {
        return Err(PipelineError::EmptyPayload {
            dataset: dataset_id.to_string(),
        });
    }

    let ingested_at = Utc::now();
    let batch = RawBatch {
        location: store.location_for(dataset_id, ingested_at),
        dataset_id: dataset_id.to_string(),
        ingested_at,
        row_count: table.row_count(),
        checksum: checksum(&payload),
        byte_size: payload.len() as u64,
    };
    store.land(&batch, &payload).await?;

    info!(
        "Landed {} rows ({} bytes) at {}",
        batch.row_count, batch.byte_size, batch.location
    );
    Ok((batch, table))
}

/// Filesystem landing area
pub struct FsRawStore {
    root: PathBuf,
}

impl FsRawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sidecar_path(location: &Path) -> PathBuf {
        location.with_extension("meta.json")
    }
}

async fn write_new(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl RawStore for FsRawStore {
    async fn land(&self, batch: &RawBatch, payload: &[u8]) -> Result<()> {
        let location = PathBuf::from(&batch.location);
        if let Some(parent) = location.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        write_new(&location, payload).await?;

        let meta = serde_json::to_vec_pretty(batch).map_err(PipelineError::serialization)?;
        write_new(&Self::sidecar_path(&location), &meta).await?;

        debug!("Wrote raw artifact {}", location.display());
        Ok(())
    }

    async fn read_bytes(&self, batch: &RawBatch) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(&batch.location).await?)
    }

    async fn list(&self, dataset_id: &str) -> Result<Vec<RawBatch>> {
        let dir = self.root.join(dataset_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut batches = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_meta = path
                .file_name()
                .map(|n| n.to_string_lossy().ends_with(".meta.json"))
                .unwrap_or(false);
            if !is_meta {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            let batch: RawBatch =
                serde_json::from_slice(&bytes).map_err(PipelineError::serialization)?;
            batches.push(batch);
        }

        batches.sort_by_key(|b| b.ingested_at);
        Ok(batches)
    }

    fn location_for(&self, dataset_id: &str, ingested_at: DateTime<Utc>) -> String {
        self.root
            .join(dataset_id)
            .join(format!("{}.csv", artifact_stem(dataset_id, ingested_at)))
            .to_string_lossy()
            .into_owned()
    }
}

/// Landing area kept in memory (tests)
#[derive(Default)]
pub struct InMemoryRawStore {
    artifacts: Mutex<Vec<(RawBatch, Vec<u8>)>>,
}

impl InMemoryRawStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn artifact_count(&self) -> usize {
        self.artifacts.lock().len()
    }
}

#[async_trait]
impl RawStore for InMemoryRawStore {
    async fn land(&self, batch: &RawBatch, payload: &[u8]) -> Result<()> {
        let mut artifacts = self.artifacts.lock();
        if artifacts.iter().any(|(b, _)| b.location == batch.location) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("raw artifact already exists: {}", batch.location),
            )
            .into());
        }
        artifacts.push((batch.clone(), payload.to_vec()));
        Ok(())
    }

    async fn read_bytes(&self, batch: &RawBatch) -> Result<Vec<u8>> {
        self.artifacts
            .lock()
            .iter()
            .find(|(b, _)| b.location == batch.location)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("raw artifact not found: {}", batch.location),
                )
                .into()
            })
    }

    async fn list(&self, dataset_id: &str) -> Result<Vec<RawBatch>> {
        let mut batches: Vec<RawBatch> = self
            .artifacts
            .lock()
            .iter()
            .filter(|(b, _)| b.dataset_id == dataset_id)
            .map(|(b, _)| b.clone())
            .collect();
        batches.sort_by_key(|b| b.ingested_at);
        Ok(batches)
    }

    fn location_for(&self, dataset_id: &str, ingested_at: DateTime<Utc>) -> String {
        format!(
            "memory://{}/{}.csv",
            dataset_id,
            artifact_stem(dataset_id, ingested_at)
        )
    }
}
