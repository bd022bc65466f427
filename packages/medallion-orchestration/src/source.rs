//! Dataset sources
//!
//! A source hands back the unmodified dataset bytes. It never writes
//! anything; landing is the raw store's job.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::SourceConfig;
use crate::error::{PipelineError, Result};

#[async_trait]
pub trait DatasetSource: Send + Sync {
    /// Human-readable location, used in logs
    fn describe(&self) -> String;

    /// Fetch the full dataset. Any failure is `SourceUnavailable`.
    async fn fetch(&self, dataset_id: &str) -> Result<Vec<u8>>;
}

/// HTTP(S) download with an optional bearer token
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpSource {
    pub fn new(url: impl Into<String>, token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PipelineError::source_unavailable("-", e))?;
        Ok(Self {
            client,
            url: url.into(),
            token,
        })
    }
}

#[async_trait]
impl DatasetSource for HttpSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self, dataset_id: &str) -> Result<Vec<u8>> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| PipelineError::source_unavailable(dataset_id, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::source_unavailable(
                dataset_id,
                format!("HTTP {} from {}", status, self.url),
            ));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| PipelineError::source_unavailable(dataset_id, e))?;
        debug!("Fetched {} bytes from {}", body.len(), self.url);
        Ok(body.to_vec())
    }
}

/// A dataset file already present on disk
pub struct LocalFileSource {
    path: PathBuf,
}

impl LocalFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DatasetSource for LocalFileSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn fetch(&self, dataset_id: &str) -> Result<Vec<u8>> {
        tokio::fs::read(&self.path).await.map_err(|e| {
            PipelineError::source_unavailable(dataset_id, format!("{}: {}", self.path.display(), e))
        })
    }
}

enum Payload {
    Bytes(Vec<u8>),
    Failure(String),
    Hang,
}

/// Source with a fixed, swappable payload (tests)
pub struct InMemorySource {
    payload: Mutex<Payload>,
    fetches: AtomicUsize,
}

impl InMemorySource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Mutex::new(Payload::Bytes(bytes.into())),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Source whose every fetch fails with `reason`
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            payload: Mutex::new(Payload::Failure(reason.into())),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Source whose fetch never completes
    pub fn hanging() -> Self {
        Self {
            payload: Mutex::new(Payload::Hang),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn set_payload(&self, bytes: impl Into<Vec<u8>>) {
        *self.payload.lock() = Payload::Bytes(bytes.into());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DatasetSource for InMemorySource {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn fetch(&self, dataset_id: &str) -> Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let outcome = match &*self.payload.lock() {
            Payload::Bytes(bytes) => Some(Ok(bytes.clone())),
            Payload::Failure(reason) => {
                Some(Err(PipelineError::source_unavailable(dataset_id, reason)))
            }
            Payload::Hang => None,
        };
        match outcome {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

/// Build the configured source
pub fn source_from_config(
    config: &SourceConfig,
    timeout: Duration,
) -> Result<Arc<dyn DatasetSource>> {
    let source: Arc<dyn DatasetSource> = match config {
        SourceConfig::Http { url, token } => {
            Arc::new(HttpSource::new(url.clone(), token.clone(), timeout)?)
        }
        SourceConfig::Local { path } => Arc::new(LocalFileSource::new(path.clone())),
    };
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("telco.csv");
        std::fs::write(&path, b"customerID,Churn\n1,No\n").unwrap();

        let source = LocalFileSource::new(&path);
        let bytes = source.fetch("telco").await.unwrap();
        assert_eq!(bytes, b"customerID,Churn\n1,No\n");
    }

    #[tokio::test]
    async fn test_missing_local_file_is_source_unavailable() {
        let source = LocalFileSource::new("/nonexistent/telco.csv");
        let err = source.fetch("telco").await.unwrap_err();
        assert!(matches!(err, PipelineError::SourceUnavailable { .. }));
        assert_eq!(err.exit_code(), 10);
    }

    #[tokio::test]
    async fn test_in_memory_source_swaps_payload() {
        let source = InMemorySource::new("a\n1\n");
        assert_eq!(source.fetch("d").await.unwrap(), b"a\n1\n");

        source.set_payload("a\n2\n");
        assert_eq!(source.fetch("d").await.unwrap(), b"a\n2\n");
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_failing_source() {
        let source = InMemorySource::failing("connection refused");
        match source.fetch("telco").await {
            Err(PipelineError::SourceUnavailable { dataset, reason }) => {
                assert_eq!(dataset, "telco");
                assert_eq!(reason, "connection refused");
            }
            other => panic!("Expected SourceUnavailable, got {:?}", other),
        }
    }

    #[test]
    fn test_hanging_source_stays_pending() {
        let source = InMemorySource::hanging();
        let mut fetch = tokio_test::task::spawn(source.fetch("telco"));

        tokio_test::assert_pending!(fetch.poll());
        tokio_test::assert_pending!(fetch.poll());
        assert_eq!(source.fetch_count(), 1);
    }

    #[test]
    fn test_source_from_config() {
        let local = SourceConfig::Local {
            path: PathBuf::from("telco.csv"),
        };
        let source = source_from_config(&local, Duration::from_secs(1)).unwrap();
        assert_eq!(source.describe(), "telco.csv");
    }
}
