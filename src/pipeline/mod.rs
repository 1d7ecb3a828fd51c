//! Run orchestration.
//!
//! A run takes every configured table through extract → stage → Parquet
//! concurrently, aggregates one outcome and persists it as [`RunMetadata`].
//!
//! Connection discipline:
//! - every extraction handle is released exactly once, on every path
//!   (success, own failure, sibling failure, timeout, shutdown)
//! - the first failure cancels the remaining jobs, but the run still waits
//!   for all of them to settle
//! - the extractor is closed only after every job has settled

mod metadata;

pub use metadata::{RunMetadata, RunStatus};

use async_trait::async_trait;
use chrono::{Local, NaiveDate, SubsecRound, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use indexmap::IndexMap;
use object_store::path::Path;
use snafu::prelude::*;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, TableConfig};
use crate::emit;
use crate::error::{
    ExtractSnafu, LoadSnafu, MetadataSerializeSnafu, MetadataUploadSnafu, PipelineError,
    TableCancelledSnafu, TimeoutSnafu,
};
use crate::loader::ColumnarLoader;
use crate::metrics::events::{Outcome, RowsExtracted, RunCompleted, TableJobCompleted};
use crate::scheduler::Runner;
use crate::source::{ExtractionHandle, Extractor};
use crate::storage::date_path;

/// One table processed end-to-end within a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableJob {
    pub name: String,
    pub query: String,
    /// Object key of the Parquet output, relative to the sink URL.
    pub output_path: Path,
}

impl TableJob {
    pub fn new(table: &TableConfig, date: NaiveDate) -> Self {
        Self {
            name: table.name.clone(),
            query: table.query(),
            output_path: date_path(&table.name, date, "parquet"),
        }
    }
}

/// Runs all table jobs and records the outcome.
pub struct Orchestrator {
    extractor: Arc<dyn Extractor>,
    loader: ColumnarLoader,
    tables: Vec<TableConfig>,
    metadata_key: Path,
    table_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(
        extractor: Arc<dyn Extractor>,
        loader: ColumnarLoader,
        tables: Vec<TableConfig>,
        metadata_key: impl Into<Path>,
    ) -> Self {
        Self {
            extractor,
            loader,
            tables,
            metadata_key: metadata_key.into(),
            table_timeout: None,
        }
    }

    /// Build an orchestrator from configuration.
    pub fn from_config(
        config: &Config,
        extractor: Arc<dyn Extractor>,
        loader: ColumnarLoader,
    ) -> Self {
        Self::new(
            extractor,
            loader,
            config.tables.clone(),
            config.sink.metadata_key.as_str(),
        )
        .with_table_timeout(config.schedule.table_timeout())
    }

    pub fn with_table_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.table_timeout = timeout;
        self
    }

    /// Jobs for a run whose outputs are dated `date`.
    pub fn jobs(&self, date: NaiveDate) -> Vec<TableJob> {
        self.tables
            .iter()
            .map(|table| TableJob::new(table, date))
            .collect()
    }

    /// Execute one run.
    ///
    /// Returns the persisted metadata on success. On failure the first job
    /// error is returned; the error metadata has been uploaded on a
    /// best-effort basis by then.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<RunMetadata, PipelineError> {
        let run_id = Uuid::now_v7();
        let start = Instant::now();
        let started_at = Utc::now().trunc_subsecs(3);
        let jobs = self.jobs(started_at.with_timezone(&Local).date_naive());

        info!(%run_id, tables = jobs.len(), "Starting run");

        let cancel = shutdown.child_token();
        let cancel_ref = &cancel;
        let mut counts: IndexMap<String, u64> =
            jobs.iter().map(|job| (job.name.clone(), 0)).collect();
        let mut failure: Option<PipelineError> = None;

        let mut pending: FuturesUnordered<_> = jobs
            .iter()
            .map(|job| async move { (job, self.run_job(job, run_id, cancel_ref).await) })
            .collect();

        while let Some((job, result)) = pending.next().await {
            match result {
                Ok(count) => {
                    info!(%run_id, table = %job.name, rows = count, "Table complete");
                    emit!(TableJobCompleted {
                        outcome: Outcome::Success,
                        table: job.name.clone(),
                    });
                    counts.insert(job.name.clone(), count);
                }
                Err(e) => {
                    let outcome = if e.is_cancelled() {
                        Outcome::Cancelled
                    } else {
                        Outcome::Error
                    };
                    emit!(TableJobCompleted {
                        outcome,
                        table: job.name.clone(),
                    });

                    if failure.is_none() {
                        error!(%run_id, table = %job.name, error = %e, "Table failed, cancelling remaining tables");
                        cancel.cancel();
                        failure = Some(e);
                    } else if outcome == Outcome::Error {
                        warn!(%run_id, table = %job.name, error = %e, "Table also failed");
                    } else {
                        debug!(%run_id, table = %job.name, "Table cancelled");
                    }
                }
            }
        }
        drop(pending);

        // Every handle has been released by now.
        self.extractor.close().await;

        let duration = start.elapsed();
        match failure {
            None => {
                let metadata = RunMetadata::success(counts, duration, started_at);
                let upload = self.write_metadata(&metadata).await;
                let outcome = if upload.is_ok() {
                    Outcome::Success
                } else {
                    Outcome::Error
                };
                emit!(RunCompleted { outcome, duration });
                upload?;

                info!(%run_id, duration_ms = metadata.duration_ms, "Run complete");
                Ok(metadata)
            }
            Some(e) => {
                let metadata = RunMetadata::failure(
                    counts.into_keys(),
                    e.to_string(),
                    duration,
                    Utc::now().trunc_subsecs(3),
                );
                emit!(RunCompleted {
                    outcome: Outcome::Error,
                    duration,
                });
                if let Err(upload) = self.write_metadata(&metadata).await {
                    error!(%run_id, error = %upload, "Failed to record failed run");
                }

                error!(%run_id, duration_ms = metadata.duration_ms, error = %e, "Run failed");
                Err(e)
            }
        }
    }

    /// Extract → load for one table. Returns the number of rows streamed.
    async fn run_job(
        &self,
        job: &TableJob,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<u64, PipelineError> {
        let deadline = self
            .table_timeout
            .map(|limit| tokio::time::Instant::now() + limit);
        let timed_out = || {
            TimeoutSnafu {
                table: job.name.as_str(),
                secs: self.table_timeout.map_or(0, |t| t.as_secs()),
            }
            .build()
        };

        let acquire = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => TableCancelledSnafu { table: job.name.as_str() }.fail(),
                handle = self.extractor.extract(&job.name, &job.query) => {
                    handle.context(ExtractSnafu { table: job.name.as_str() })
                }
            }
        };
        let ExtractionHandle {
            stream,
            counter,
            release,
        } = within(deadline, acquire).await.ok_or_else(timed_out)??;

        debug!(%run_id, table = %job.name, output = %job.output_path, "Streaming table");
        let load = self
            .loader
            .convert(stream, &job.name, run_id, &job.output_path, cancel);
        let loaded = within(deadline, load).await;

        release.release().await;

        loaded
            .ok_or_else(timed_out)?
            .context(LoadSnafu { table: job.name.as_str() })?;

        let rows = counter.get();
        emit!(RowsExtracted {
            count: rows,
            table: job.name.clone(),
        });
        Ok(rows)
    }

    async fn write_metadata(&self, metadata: &RunMetadata) -> Result<(), PipelineError> {
        let body = serde_json::to_vec_pretty(metadata).context(MetadataSerializeSnafu)?;
        self.loader
            .storage()
            .put_json(&self.metadata_key, body)
            .await
            .context(MetadataUploadSnafu)
    }
}

/// Await `fut`, giving up at `deadline` if there is one.
async fn within<F: Future>(deadline: Option<tokio::time::Instant>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, fut).await.ok(),
        None => Some(fut.await),
    }
}

#[async_trait]
impl Runner for Orchestrator {
    async fn execute(&self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        self.run(&shutdown).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_job_paths() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 9).unwrap();
        let job = TableJob::new(&TableConfig::new("orders"), date);

        assert_eq!(job.name, "orders");
        assert_eq!(job.query, r#"SELECT * FROM "orders""#);
        assert_eq!(job.output_path.as_ref(), "orders/2024/03/09.parquet");
    }
}
