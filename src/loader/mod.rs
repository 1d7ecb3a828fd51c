//! Columnar loader: stage a row stream to disk, convert it to Parquet.
//!
//! The staging file is removed after every load, whether staging, conversion
//! or upload failed or not.

mod convert;
mod staging;

pub use convert::{Conversion, ParquetOptions};
pub use staging::{StagedRows, StagingFile};

use object_store::path::Path;
use std::path::PathBuf;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::SinkConfig;
use crate::emit;
use crate::error::LoaderError;
use crate::metrics::events::{ConversionCompleted, MalformedRecordsSkipped, StagingBytesWritten};
use crate::source::RowStream;
use crate::storage::StorageProviderRef;

/// Summary of one table load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    pub staged: StagedRows,
    pub conversion: Conversion,
}

/// Stages rows as NDJSON and writes them as one Parquet object.
#[derive(Debug, Clone)]
pub struct ColumnarLoader {
    storage: StorageProviderRef,
    staging_dir: PathBuf,
    options: ParquetOptions,
}

impl ColumnarLoader {
    pub fn new(storage: StorageProviderRef, sink: &SinkConfig) -> Self {
        Self {
            storage,
            staging_dir: sink.staging_dir(),
            options: ParquetOptions {
                compression: sink.compression,
                batch_size: sink.batch_size,
            },
        }
    }

    pub fn storage(&self) -> &StorageProviderRef {
        &self.storage
    }

    /// Drain `rows` for `table` and write them to `output`.
    ///
    /// `run_id` keeps staging names unique across runs. Any failure is
    /// returned after the staging file has been removed.
    pub async fn convert(
        &self,
        rows: RowStream,
        table: &str,
        run_id: Uuid,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<LoadSummary, LoaderError> {
        let (staging, writer) = StagingFile::create(&self.staging_dir, table, run_id).await?;
        let result = self.stage_and_convert(&staging, writer, rows, table, output, cancel).await;
        staging.remove().await;
        result
    }

    async fn stage_and_convert(
        &self,
        staging: &StagingFile,
        writer: tokio::io::BufWriter<tokio::fs::File>,
        rows: RowStream,
        table: &str,
        output: &Path,
        cancel: &CancellationToken,
    ) -> Result<LoadSummary, LoaderError> {
        let staged = staging::write_rows(rows, writer, staging.path(), cancel).await?;
        emit!(StagingBytesWritten {
            bytes: staged.bytes,
            table: table.to_string(),
        });
        debug!(table = %table, rows = staged.rows, bytes = staged.bytes, "Staged rows");

        let start = Instant::now();
        let conversion = convert::write_parquet(
            staging.path().to_path_buf(),
            &self.storage,
            output,
            self.options,
            cancel,
        )
        .await?;
        emit!(ConversionCompleted {
            duration: start.elapsed(),
            table: table.to_string(),
        });

        if conversion.malformed > 0 {
            emit!(MalformedRecordsSkipped {
                count: conversion.malformed,
                table: table.to_string(),
            });
        }

        if conversion.written {
            info!(
                table = %table,
                records = conversion.records,
                skipped = conversion.malformed,
                uri = %self.storage.uri_for(output),
                "Wrote parquet"
            );
        } else {
            info!(table = %table, "No records, skipped parquet output");
        }

        Ok(LoadSummary { staged, conversion })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParquetCompression;
    use crate::error::SourceError;
    use crate::source::Row;
    use crate::storage::StorageProvider;
    use arrow::array::StringArray;
    use futures::{StreamExt, stream};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _out: TempDir,
        out_dir: PathBuf,
        staging: TempDir,
        loader: ColumnarLoader,
    }

    async fn fixture() -> Fixture {
        let out = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let storage = StorageProvider::for_url_with_options(
            out.path().to_str().unwrap(),
            HashMap::new(),
        )
        .await
        .unwrap();
        let loader = ColumnarLoader {
            storage: Arc::new(storage),
            staging_dir: staging.path().to_path_buf(),
            options: ParquetOptions {
                compression: ParquetCompression::Zstd,
                batch_size: 4,
            },
        };
        Fixture {
            out_dir: out.path().to_path_buf(),
            _out: out,
            staging,
            loader,
        }
    }

    fn rows(n: usize) -> RowStream {
        stream::iter((0..n).map(|i| {
            let mut row = Row::new();
            row.insert("id".into(), json!(i));
            row.insert("email".into(), json!(format!("user{i}@example.com")));
            row.insert("deleted_at".into(), json!(null));
            Ok(row)
        }))
        .boxed()
    }

    fn staging_is_empty(dir: &TempDir) -> bool {
        std::fs::read_dir(dir.path()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn test_writes_parquet_and_removes_staging() {
        let fx = fixture().await;
        let output = Path::from("customers/2024/01/05.parquet");

        let summary = fx
            .loader
            .convert(rows(10), "customers", Uuid::now_v7(), &output, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.staged.rows, 10);
        assert_eq!(summary.conversion.records, 10);
        assert!(summary.conversion.written);
        assert!(staging_is_empty(&fx.staging));

        let file = std::fs::File::open(fx.out_dir.join("customers/2024/01/05.parquet")).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap();
        let batches: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        let total: usize = batches.iter().map(|b| b.num_rows()).sum();
        assert_eq!(total, 10);
        assert!(batches[0].schema().field_with_name("deleted_at").is_ok());
    }

    #[tokio::test]
    async fn test_empty_stream_writes_nothing() {
        let fx = fixture().await;
        let output = Path::from("events/2024/01/05.parquet");

        let summary = fx
            .loader
            .convert(rows(0), "events", Uuid::now_v7(), &output, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.staged.rows, 0);
        assert!(!summary.conversion.written);
        assert!(!fx.out_dir.join("events/2024/01/05.parquet").exists());
        assert!(staging_is_empty(&fx.staging));
    }

    #[tokio::test]
    async fn test_stream_failure_removes_staging() {
        let fx = fixture().await;
        let failing = rows(3)
            .chain(stream::iter(vec![Err(SourceError::Injected {
                message: "connection reset".into(),
            })]))
            .boxed();

        let err = fx
            .loader
            .convert(
                failing,
                "orders",
                Uuid::now_v7(),
                &Path::from("orders/2024/01/05.parquet"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("connection reset"));
        assert!(staging_is_empty(&fx.staging));
        assert!(!fx.out_dir.join("orders/2024/01/05.parquet").exists());
    }

    #[tokio::test]
    async fn test_conflicting_shapes_are_kept_as_json_text() {
        let fx = fixture().await;
        let payloads = [json!({"a": 1}), json!([1, 2]), json!("plain")];
        let conflicting = stream::iter(payloads.into_iter().map(|payload| {
            let mut row = Row::new();
            row.insert("payload".into(), payload);
            Ok(row)
        }))
        .boxed();

        let summary = fx
            .loader
            .convert(
                conflicting,
                "events",
                Uuid::now_v7(),
                &Path::from("events/2024/01/05.parquet"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.conversion.records, 3);
        assert_eq!(summary.conversion.malformed, 0);
        assert!(staging_is_empty(&fx.staging));

        let file = std::fs::File::open(fx.out_dir.join("events/2024/01/05.parquet")).unwrap();
        let batch = ParquetRecordBatchReaderBuilder::try_new(file)
            .unwrap()
            .build()
            .unwrap()
            .next()
            .unwrap()
            .unwrap();
        let payload = batch
            .column_by_name("payload")
            .unwrap()
            .as_any()
            .downcast_ref::<StringArray>()
            .unwrap();
        let values: Vec<_> = payload.iter().map(|v| v.unwrap().to_string()).collect();
        assert_eq!(values, vec!["{\"a\":1}", "[1,2]", "plain"]);
    }

    #[tokio::test]
    async fn test_write_failure_removes_staging() {
        let fx = fixture().await;
        // A directory where the output file should go makes the upload fail.
        std::fs::create_dir_all(fx.out_dir.join("orders/2024/01/05.parquet")).unwrap();

        let result = fx
            .loader
            .convert(
                rows(5),
                "orders",
                Uuid::now_v7(),
                &Path::from("orders/2024/01/05.parquet"),
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        assert!(staging_is_empty(&fx.staging));
    }

    #[tokio::test]
    async fn test_cancel_removes_staging() {
        let fx = fixture().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = fx
            .loader
            .convert(
                stream::pending().boxed(),
                "orders",
                Uuid::now_v7(),
                &Path::from("orders/2024/01/05.parquet"),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LoaderError::Cancelled));
        assert!(staging_is_empty(&fx.staging));
    }
}
