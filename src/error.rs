//! Error types for snowdrift using snafu.
//!
//! Each concern gets its own enum with context selectors. Display strings
//! include the underlying source so that a single `to_string()` is a complete
//! message; that string is what ends up in the run metadata.

use snafu::prelude::*;

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// Required regex capture group missing (internal error).
    #[snafu(display("Missing required URL component: {group}"))]
    RegexGroupMissing { group: String },

    /// Object store operation failed.
    #[snafu(display("Storage operation failed: {source}"))]
    ObjectStore { source: object_store::Error },

    /// IO error during storage operations.
    #[snafu(display("IO error: {source}"))]
    Io { source: std::io::Error },

    /// S3 configuration error.
    #[snafu(display("S3 configuration error: {source}"))]
    S3Config { source: object_store::Error },

    /// GCS configuration error.
    #[snafu(display("GCS configuration error: {source}"))]
    GcsConfig { source: object_store::Error },
}

impl StorageError {
    /// Check if this error represents a "not found" condition (404, NoSuchKey, etc.)
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::ObjectStore { source } => {
                matches!(source, object_store::Error::NotFound { .. })
            }
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Source connection string is empty.
    #[snafu(display("Source url cannot be empty"))]
    EmptySourceUrl,

    /// Sink URL is empty.
    #[snafu(display("Sink url cannot be empty"))]
    EmptySinkUrl,

    /// No tables configured.
    #[snafu(display("At least one table must be configured"))]
    NoTables,

    /// Table name is not a valid (optionally schema-qualified) identifier.
    #[snafu(display("Invalid table name '{table}': expected [schema.]identifier"))]
    InvalidTableName { table: String },

    /// Same table configured twice.
    #[snafu(display("Table '{table}' is configured more than once"))]
    DuplicateTable { table: String },

    /// Target hour outside 0..=23.
    #[snafu(display("schedule.target_hour must be between 0 and 23, got {hour}"))]
    InvalidTargetHour { hour: u32 },

    /// A numeric setting that must be positive was zero.
    #[snafu(display("{field} must be greater than zero"))]
    ZeroValue { field: String },

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file {}: {source}", path.display()))]
    ReadFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },
}

// ============ Source Errors ============

/// Errors raised by the relational source.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SourceError {
    /// Connection string could not be parsed.
    #[snafu(display("Invalid source connection string: {source}"))]
    ConnectionString { source: tokio_postgres::Error },

    /// Failed to build the connection pool.
    #[snafu(display("Failed to build connection pool: {source}"))]
    PoolBuild {
        source: deadpool_postgres::BuildError,
    },

    /// No connection could be checked out of the pool.
    #[snafu(display("Failed to acquire connection for {table}: {source}"))]
    Acquire {
        table: String,
        source: deadpool_postgres::PoolError,
    },

    /// Opening the cursor or fetching a batch failed.
    #[snafu(display("Query failed for {table}: {source}"))]
    Query {
        table: String,
        source: tokio_postgres::Error,
    },

    /// A fetched row could not be turned into a record.
    #[snafu(display("Unexpected row shape in {table}: {message}"))]
    RowShape { table: String, message: String },

    /// The stream was polled after its connection had been released.
    #[snafu(display("Connection for {table} was released while streaming"))]
    Released { table: String },

    /// Error injected by an in-memory source.
    #[cfg(any(test, feature = "testing"))]
    #[snafu(display("{message}"))]
    Injected { message: String },
}

// ============ Loader Errors ============

/// Errors raised while staging rows or converting them to Parquet.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum LoaderError {
    /// Failed to create the staging file.
    #[snafu(display("Failed to create staging file {}: {source}", path.display()))]
    CreateStaging {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Failed to append to the staging file.
    #[snafu(display("Failed to write staging file {}: {source}", path.display()))]
    StagingWrite {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// Failed to read the staging file back.
    #[snafu(display("Failed to read staging file {}: {source}", path.display()))]
    StagingRead {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    /// A row could not be serialized as a JSON line.
    #[snafu(display("Failed to serialize row: {source}"))]
    Serialize { source: serde_json::Error },

    /// The row stream yielded an error.
    #[snafu(display("Row stream failed: {source}"))]
    Read { source: SourceError },

    /// Decoding staged records into Arrow batches failed.
    #[snafu(display("Failed to decode staged records: {source}"))]
    Decode { source: arrow::error::ArrowError },

    /// Parquet writer failed.
    #[snafu(display("Parquet write failed: {source}"))]
    ParquetWrite {
        source: parquet::errors::ParquetError,
    },

    /// The blocking conversion task could not be joined.
    #[snafu(display("Conversion task failed: {source}"))]
    ConversionTask { source: tokio::task::JoinError },

    /// The load was cancelled before the stream was drained.
    #[snafu(display("Load cancelled"))]
    Cancelled,
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics server already initialized (double-init attempted).
    #[snafu(display("Metrics server already initialized"))]
    AlreadyInitialized,
}

// ============ Pipeline Error (top-level) ============

/// Top-level errors for a run and for process bootstrap.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// A table job could not obtain its row stream.
    #[snafu(display("Extraction of {table} failed: {source}"))]
    Extract { table: String, source: SourceError },

    /// A table job failed while staging or converting.
    #[snafu(display("Load of {table} failed: {source}"))]
    Load { table: String, source: LoaderError },

    /// A table job exceeded its time budget.
    #[snafu(display("Table {table} timed out after {secs}s"))]
    Timeout { table: String, secs: u64 },

    /// A table job was cancelled before it finished.
    #[snafu(display("Table {table} was cancelled"))]
    TableCancelled { table: String },

    /// Failed to serialize run metadata.
    #[snafu(display("Failed to serialize run metadata: {source}"))]
    MetadataSerialize { source: serde_json::Error },

    /// Failed to upload run metadata.
    #[snafu(display("Failed to upload run metadata: {source}"))]
    MetadataUpload { source: StorageError },

    /// Storage error.
    #[snafu(display("Storage error: {source}"))]
    Storage { source: StorageError },

    /// Source setup error.
    #[snafu(display("Source error: {source}"))]
    Source { source: SourceError },

    /// Configuration error.
    #[snafu(display("Configuration error: {source}"))]
    Config { source: ConfigError },

    /// Address parsing error.
    #[snafu(display("Failed to parse metrics address: {source}"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error: {source}"))]
    Metrics { source: MetricsError },
}

impl PipelineError {
    /// Whether this error is only a consequence of a sibling failure or shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            PipelineError::TableCancelled { .. }
                | PipelineError::Load {
                    source: LoaderError::Cancelled,
                    ..
                }
        )
    }
}

impl From<StorageError> for PipelineError {
    fn from(source: StorageError) -> Self {
        PipelineError::Storage { source }
    }
}

impl From<ConfigError> for PipelineError {
    fn from(source: ConfigError) -> Self {
        PipelineError::Config { source }
    }
}

impl From<SourceError> for PipelineError {
    fn from(source: SourceError) -> Self {
        PipelineError::Source { source }
    }
}
