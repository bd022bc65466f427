//! Pipeline configuration
//!
//! Loaded in layers, later layers overriding earlier ones:
//!
//! 1. Built-in defaults (serde field defaults)
//! 2. YAML file (`medallion.yaml`, `--config <file>` or `MEDALLION_CONFIG`)
//! 3. Environment variables prefixed with `MEDALLION_`, nested keys split on
//!    `__` (e.g. `MEDALLION_SEVERITY__RAW__UNIQUENESS=critical`)
//!
//! `dedup_policy` and `source` have no default and must be set explicitly.

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::validation::{CheckKind, ValidationStage};

/// Config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "medallion.yaml";

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "MEDALLION_CONFIG";

const ENV_PREFIX: &str = "MEDALLION_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Unreadable .env file: {0}")]
    DotEnv(#[from] dotenvy::Error),
}

/// How duplicate `customer_id` rows are resolved during staging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    KeepFirst,
    KeepLast,
    Reject,
}

/// What happens to a row that fails type coercion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowErrorPolicy {
    Skip,
    #[default]
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyMode {
    /// Every invocation runs every stage
    #[default]
    Always,
    /// Short-circuit when the fetched batch matches the last complete run
    SkipIfUnchanged,
}

/// Where the raw dataset comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    Local {
        path: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Failure aborts the run
    Critical,
    /// Failure is logged and the run continues
    Warning,
    /// Check is not run
    Waived,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::Warning => "warning",
            Severity::Waived => "waived",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-check overrides for one stage; unset checks use the stage default
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckSeverities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub null: Option<Severity>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_check: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uniqueness: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub business: Option<Severity>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_size: Option<Severity>,
}

impl CheckSeverities {
    fn get(&self, check: CheckKind) -> Option<Severity> {
        match check {
            CheckKind::Schema => self.schema,
            CheckKind::Null => self.null,
            CheckKind::Type => self.type_check,
            CheckKind::Uniqueness => self.uniqueness,
            CheckKind::Business => self.business,
            CheckKind::SampleSize => self.sample_size,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityConfig {
    pub raw: CheckSeverities,
    pub silver: CheckSeverities,
    pub gold: CheckSeverities,
}

impl SeverityConfig {
    /// Effective severity of `check` at `stage`
    pub fn for_check(&self, stage: ValidationStage, check: CheckKind) -> Severity {
        let overrides = match stage {
            ValidationStage::Raw => &self.raw,
            ValidationStage::Silver => &self.silver,
            ValidationStage::Gold => &self.gold,
        };
        overrides
            .get(check)
            .unwrap_or_else(|| Self::default_for(stage, check))
    }

    fn default_for(stage: ValidationStage, check: CheckKind) -> Severity {
        match (stage, check) {
            // Raw duplicates are resolved by the explicit dedup policy
            (ValidationStage::Raw, CheckKind::Uniqueness) => Severity::Warning,
            (_, CheckKind::SampleSize) => Severity::Warning,
            _ => Severity::Critical,
        }
    }
}

/// A missing `.env` is fine; one that exists but does not parse is not
fn env_file_loaded<T: std::fmt::Debug>(
    result: std::result::Result<T, dotenvy::Error>,
) -> Result<(), ConfigError> {
    match result {
        Ok(loaded) => {
            debug!("Loaded environment file {:?}", loaded);
            Ok(())
        }
        Err(e) if e.not_found() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_dataset_id")]
    pub dataset_id: String,

    pub source: SourceConfig,

    /// SQLite file for ledger, silver and gold (`:memory:` allowed)
    #[serde(default = "default_warehouse_path")]
    pub warehouse_path: PathBuf,

    #[serde(default = "default_landing_dir")]
    pub landing_dir: PathBuf,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Per-run validation reports and insights, one directory per run
    #[serde(default = "default_report_dir")]
    pub report_dir: PathBuf,

    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    pub dedup_policy: DedupPolicy,

    #[serde(default)]
    pub row_error_policy: RowErrorPolicy,

    #[serde(default)]
    pub idempotency: IdempotencyMode,

    /// Minimum group size for sample-size checks and service correlation
    #[serde(default = "default_min_sample_size")]
    pub min_sample_size: usize,

    #[serde(default)]
    pub severity: SeverityConfig,
}

fn default_dataset_id() -> String {
    "telco-customer-churn".to_string()
}

fn default_warehouse_path() -> PathBuf {
    PathBuf::from("data/warehouse.db")
}

fn default_landing_dir() -> PathBuf {
    PathBuf::from("data/bronze")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("data/reports")
}

fn default_fetch_timeout_secs() -> u64 {
    60
}

fn default_min_sample_size() -> usize {
    10
}

impl PipelineConfig {
    /// Config with every default applied, for the given required choices
    pub fn new(source: SourceConfig, dedup_policy: DedupPolicy) -> Self {
        Self {
            dataset_id: default_dataset_id(),
            source,
            warehouse_path: default_warehouse_path(),
            landing_dir: default_landing_dir(),
            log_dir: default_log_dir(),
            report_dir: default_report_dir(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            dedup_policy,
            row_error_policy: RowErrorPolicy::default(),
            idempotency: IdempotencyMode::default(),
            min_sample_size: default_min_sample_size(),
            severity: SeverityConfig::default(),
        }
    }

    /// Load configuration from file and environment.
    ///
    /// `explicit` (from `--config`) wins over `MEDALLION_CONFIG`, which wins
    /// over `medallion.yaml` in the working directory. An explicitly named
    /// file must exist; the default file is optional.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        env_file_loaded(dotenvy::dotenv())?;

        let (path, required) = match explicit {
            Some(path) => (path.to_path_buf(), true),
            None => match std::env::var_os(CONFIG_PATH_ENV) {
                Some(path) => (PathBuf::from(path), true),
                None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
            },
        };

        let mut figment = Figment::new();
        if path.exists() {
            figment = figment.merge(Yaml::file(&path));
        } else if required {
            return Err(ConfigError::NotFound(path));
        }

        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Extract and validate from an already assembled figment
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: PipelineConfig = figment.extract().map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML document (no environment layer)
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Self::from_figment(Figment::new().merge(Yaml::string(yaml)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset_id.is_empty() {
            return Err(ConfigError::Invalid("dataset_id must not be empty".to_string()));
        }
        // Used as a directory and file name in the landing area
        if !self
            .dataset_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "dataset_id {:?} may only contain ASCII letters, digits, '-' and '_'",
                self.dataset_id
            )));
        }
        if self.min_sample_size == 0 {
            return Err(ConfigError::Invalid(
                "min_sample_size must be at least 1".to_string(),
            ));
        }
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let SourceConfig::Http { url, .. } = &self.source {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::Invalid(format!(
                    "source url must be http(s): {}",
                    url
                )));
            }
        }
        Ok(())
    }

    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Effective configuration as YAML, with the source token redacted
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        let mut shown = self.clone();
        if let SourceConfig::Http { token, .. } = &mut shown.source {
            if token.is_some() {
                *token = Some("***".to_string());
            }
        }
        serde_yaml::to_string(&shown).map_err(|e| ConfigError::Invalid(e.to_string()))
    }
}
