//! snowdrift: daily PostgreSQL table snapshots to Parquet on object storage.
//!
//! Once per day (and optionally at startup) every configured table is
//! streamed out of the database through a server-side cursor, staged to
//! local disk as NDJSON, converted to a compressed Parquet file and uploaded
//! to `<table>/YYYY/MM/DD.parquet`. A single run-metadata document records
//! the per-table row counts and whether the run succeeded.
//!
//! - `source/` - Extractor trait, PostgreSQL cursor extractor, row counting
//! - `loader/` - NDJSON staging and Parquet conversion
//! - `pipeline/` - Orchestrator and run metadata
//! - `scheduler/` - Daily trigger and polling loop
//! - `storage/` - Object storage (S3, GCS, local) and dated output paths
//! - `config/` - YAML configuration with environment variable interpolation
//! - `metrics/` - Internal events and the Prometheus endpoint

pub mod config;
pub mod error;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod scheduler;
pub mod signal;
pub mod source;
pub mod storage;
pub mod tracing;

pub use config::Config;
pub use error::{ConfigError, LoaderError, PipelineError, SourceError, StorageError};
pub use loader::ColumnarLoader;
pub use pipeline::{Orchestrator, RunMetadata, RunStatus, TableJob};
pub use scheduler::{Clock, DailyTrigger, Runner, Scheduler, SystemClock};
pub use signal::{cancel_on_signal, shutdown_signal};
pub use source::{Extractor, PostgresExtractor};
pub use storage::{StorageProvider, StorageProviderRef};
pub use tracing::init_tracing;
