//! Configuration loading and validation.
//!
//! Configuration is a YAML file interpolated with environment variables
//! before parsing, so deployments can keep the usual `DATABASE_URL`,
//! `S3_BUCKET`, `RUN_ON_START` style of configuration.

mod vars;

pub use vars::interpolate;

use indexmap::IndexSet;
use regex::Regex;
use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use crate::error::{
    ConfigError, DuplicateTableSnafu, EmptySinkUrlSnafu, EmptySourceUrlSnafu,
    EnvInterpolationSnafu, InvalidTableNameSnafu, InvalidTargetHourSnafu, NoTablesSnafu,
    ReadFileSnafu, YamlParseSnafu, ZeroValueSnafu,
};

/// One kibibyte.
pub const KB: usize = 1024;

static TABLE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*)?$")
        .expect("Invalid regex pattern")
});

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub source: SourceConfig,
    pub sink: SinkConfig,
    pub tables: Vec<TableConfig>,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Relational source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    /// PostgreSQL connection string (key-value or URI form).
    pub url: String,

    /// Maximum pooled connections (default: 10).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Rows fetched per server-side cursor round trip (default: 1000).
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
}

fn default_max_connections() -> usize {
    10
}

fn default_fetch_size() -> usize {
    1000
}

/// Object storage sink configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkConfig {
    /// Root URL of the output location.
    /// Examples: "s3://my-data-warehouse", "gs://bucket/prefix", "/var/lib/snowdrift"
    pub url: String,

    /// Storage options (credentials, region, etc.)
    #[serde(default)]
    pub storage_options: HashMap<String, String>,

    /// Parquet compression codec (default: zstd).
    #[serde(default = "default_compression")]
    pub compression: ParquetCompression,

    /// Records per Arrow batch during conversion (default: 8192).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Directory for staging files (default: the OS temp dir).
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,

    /// Object key of the run metadata (default: "etl.json").
    #[serde(default = "default_metadata_key")]
    pub metadata_key: String,
}

fn default_compression() -> ParquetCompression {
    ParquetCompression::Zstd
}

fn default_batch_size() -> usize {
    8192
}

fn default_metadata_key() -> String {
    "etl.json".to_string()
}

impl SinkConfig {
    /// Directory staging files are written to.
    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Parquet compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParquetCompression {
    Uncompressed,
    Snappy,
    Gzip,
    #[default]
    Zstd,
    Lz4,
}

/// Table entry as written in YAML: a bare name or a mapping.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TableEntry {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        query: Option<String>,
    },
}

/// One configured source table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "TableEntry")]
pub struct TableConfig {
    /// Table name, optionally schema-qualified.
    pub name: String,
    /// Query override; defaults to selecting every column of the table.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl From<TableEntry> for TableConfig {
    fn from(entry: TableEntry) -> Self {
        match entry {
            TableEntry::Name(name) => Self { name, query: None },
            TableEntry::Detailed { name, query } => Self { name, query },
        }
    }
}

impl TableConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: None,
        }
    }

    /// The query issued for this table.
    pub fn query(&self) -> String {
        match &self.query {
            Some(query) => query.clone(),
            None => format!("SELECT * FROM {}", quote_table(&self.name)),
        }
    }
}

/// Quote a possibly schema-qualified table name as SQL identifiers.
pub fn quote_table(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Daily schedule configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleConfig {
    /// Local hour of day (0-23) at which the daily run fires (default: 3).
    #[serde(default = "default_target_hour")]
    pub target_hour: u32,

    /// Run once immediately at startup (default: false).
    #[serde(default)]
    pub run_on_start: bool,

    /// Seconds between clock checks (default: 60).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound on a single table job, in seconds (default: none).
    #[serde(default)]
    pub table_timeout_secs: Option<u64>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            target_hour: default_target_hour(),
            run_on_start: false,
            poll_interval_secs: default_poll_interval_secs(),
            table_timeout_secs: None,
        }
    }
}

impl ScheduleConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn table_timeout(&self) -> Option<Duration> {
        self.table_timeout_secs.map(Duration::from_secs)
    }
}

fn default_target_hour() -> u32 {
    3
}

fn default_poll_interval_secs() -> u64 {
    60
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).context(ReadFileSnafu { path })?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string, interpolating environment variables.
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let text = interpolate(contents).map_err(|errors| {
            EnvInterpolationSnafu {
                message: errors.join("\n"),
            }
            .build()
        })?;

        let config: Config = serde_yaml::from_str(&text).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(!self.source.url.trim().is_empty(), EmptySourceUrlSnafu);
        ensure!(!self.sink.url.trim().is_empty(), EmptySinkUrlSnafu);
        ensure!(!self.tables.is_empty(), NoTablesSnafu);

        let mut seen = IndexSet::new();
        for table in &self.tables {
            ensure!(
                TABLE_NAME.is_match(&table.name),
                InvalidTableNameSnafu { table: &table.name }
            );
            ensure!(
                seen.insert(table.name.as_str()),
                DuplicateTableSnafu { table: &table.name }
            );
        }

        ensure!(
            self.schedule.target_hour <= 23,
            InvalidTargetHourSnafu {
                hour: self.schedule.target_hour
            }
        );

        for (field, value) in [
            ("source.max_connections", self.source.max_connections as u64),
            ("source.fetch_size", self.source.fetch_size as u64),
            ("sink.batch_size", self.sink.batch_size as u64),
            ("schedule.poll_interval_secs", self.schedule.poll_interval_secs),
            (
                "schedule.table_timeout_secs",
                self.schedule.table_timeout_secs.unwrap_or(1),
            ),
        ] {
            ensure!(value > 0, ZeroValueSnafu { field });
        }

        Ok(())
    }

    /// Table names in configured order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}
