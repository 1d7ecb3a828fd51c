//! Internal events for snowdrift metrics emission.
//!
//! Each event struct represents a measurable occurrence in a run. Events
//! implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric. Per-table events carry a `table` label.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Outcome label shared by job and run events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    Cancelled,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Error => "error",
            Outcome::Cancelled => "cancelled",
        }
    }
}

// ============================================================================
// Extraction and staging events
// ============================================================================

/// Event emitted when rows of a table have been drained into staging.
pub struct RowsExtracted {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for RowsExtracted {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Rows extracted");
        counter!("snowdrift_rows_extracted_total", "table" => self.table).increment(self.count);
    }
}

/// Event emitted when bytes are appended to a staging file.
pub struct StagingBytesWritten {
    pub bytes: u64,
    pub table: String,
}

impl InternalEvent for StagingBytesWritten {
    fn emit(self) {
        trace!(bytes = self.bytes, table = %self.table, "Staging bytes written");
        counter!("snowdrift_staging_bytes_written_total", "table" => self.table)
            .increment(self.bytes);
    }
}

/// Event emitted when staged records could not be parsed and were skipped.
pub struct MalformedRecordsSkipped {
    pub count: u64,
    pub table: String,
}

impl InternalEvent for MalformedRecordsSkipped {
    fn emit(self) {
        trace!(count = self.count, table = %self.table, "Malformed records skipped");
        counter!("snowdrift_malformed_records_total", "table" => self.table).increment(self.count);
    }
}

/// Event emitted when the Parquet conversion of a table completes.
pub struct ConversionCompleted {
    pub duration: Duration,
    pub table: String,
}

impl InternalEvent for ConversionCompleted {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            table = %self.table,
            "Conversion completed"
        );
        histogram!("snowdrift_conversion_duration_seconds", "table" => self.table)
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when the number of checked-out source connections changes.
pub struct ActiveConnections {
    pub count: usize,
}

impl InternalEvent for ActiveConnections {
    fn emit(self) {
        trace!(count = self.count, "Active source connections");
        gauge!("snowdrift_active_connections").set(self.count as f64);
    }
}

// ============================================================================
// Run events
// ============================================================================

/// Event emitted when a table job settles.
pub struct TableJobCompleted {
    pub outcome: Outcome,
    pub table: String,
}

impl InternalEvent for TableJobCompleted {
    fn emit(self) {
        trace!(outcome = self.outcome.as_str(), table = %self.table, "Table job completed");
        counter!(
            "snowdrift_table_jobs_total",
            "outcome" => self.outcome.as_str(),
            "table" => self.table
        )
        .increment(1);
    }
}

/// Event emitted when a run settles.
pub struct RunCompleted {
    pub outcome: Outcome,
    pub duration: Duration,
}

impl InternalEvent for RunCompleted {
    fn emit(self) {
        trace!(
            outcome = self.outcome.as_str(),
            duration_ms = self.duration.as_millis(),
            "Run completed"
        );
        counter!("snowdrift_runs_total", "outcome" => self.outcome.as_str()).increment(1);
        histogram!("snowdrift_run_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// How a run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    Startup,
    Scheduled,
    Skipped,
}

impl TriggerKind {
    fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::Startup => "startup",
            TriggerKind::Scheduled => "scheduled",
            TriggerKind::Skipped => "skipped",
        }
    }
}

/// Event emitted when the scheduler fires (or declines to fire) a run.
pub struct RunTriggered {
    pub kind: TriggerKind,
}

impl InternalEvent for RunTriggered {
    fn emit(self) {
        trace!(kind = self.kind.as_str(), "Run triggered");
        counter!("snowdrift_triggers_total", "kind" => self.kind.as_str()).increment(1);
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
        }
    }
}

/// Status of a storage request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request"
        );
        counter!(
            "snowdrift_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!(
            "snowdrift_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}
