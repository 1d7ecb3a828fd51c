//! End-to-end runs against the in-memory extractor and local storage.

use std::collections::HashMap;
use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use snowdrift::config::{ParquetCompression, SinkConfig, TableConfig};
use snowdrift::source::{MemoryExtractor, MemoryTable, SourceCall};
use snowdrift::{ColumnarLoader, Orchestrator, PipelineError, RunMetadata, RunStatus, StorageProvider};

struct Harness {
    out: TempDir,
    staging: TempDir,
    extractor: Arc<MemoryExtractor>,
    orchestrator: Orchestrator,
}

impl Harness {
    async fn new(extractor: MemoryExtractor, tables: &[&str]) -> Self {
        let out = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();

        let sink = SinkConfig {
            url: out.path().to_str().unwrap().to_string(),
            storage_options: HashMap::new(),
            compression: ParquetCompression::Zstd,
            batch_size: 4,
            staging_dir: Some(staging.path().to_path_buf()),
            metadata_key: "etl.json".to_string(),
        };
        let storage = StorageProvider::for_url_with_options(&sink.url, HashMap::new())
            .await
            .unwrap();
        let loader = ColumnarLoader::new(Arc::new(storage), &sink);

        let extractor = Arc::new(extractor);
        let orchestrator = Orchestrator::new(
            extractor.clone(),
            loader,
            tables.iter().map(|t| TableConfig::new(*t)).collect(),
            "etl.json",
        );

        Self {
            out,
            staging,
            extractor,
            orchestrator,
        }
    }

    fn metadata(&self) -> RunMetadata {
        let bytes = std::fs::read(self.out.path().join("etl.json")).unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn staging_is_empty(&self) -> bool {
        std::fs::read_dir(self.staging.path()).unwrap().next().is_none()
    }

    /// Parquet files written for `table`, at any date.
    fn parquet_files(&self, table: &str) -> Vec<PathBuf> {
        let mut files = Vec::new();
        collect_files(&self.out.path().join(table), &mut files);
        files.retain(|path| path.extension().is_some_and(|ext| ext == "parquet"));
        files
    }

    /// Every table extracted was released exactly once, and close came last.
    fn assert_connection_discipline(&self, extracted: &[&str]) {
        for table in extracted {
            assert_eq!(self.extractor.releases(table), 1, "releases of {table}");
        }
        assert_eq!(self.extractor.outstanding(), 0);
        assert_eq!(self.extractor.closes(), 1);
        assert_eq!(self.extractor.calls().last(), Some(&SourceCall::Close));
    }
}

fn collect_files(dir: &FsPath, files: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries {
        let path = entry.unwrap().path();
        if path.is_dir() {
            collect_files(&path, files);
        } else {
            files.push(path);
        }
    }
}

fn parquet_rows(path: &FsPath) -> usize {
    let file = std::fs::File::open(path).unwrap();
    ParquetRecordBatchReaderBuilder::try_new(file)
        .unwrap()
        .build()
        .unwrap()
        .map(|batch| batch.unwrap().num_rows())
        .sum()
}

fn three_tables() -> MemoryExtractor {
    MemoryExtractor::new()
        .with_table("customers", MemoryTable::generated("customers", 5))
        .with_table("orders", MemoryTable::generated("orders", 12))
        .with_table("events", MemoryTable::generated("events", 0))
}

#[tokio::test]
async fn test_successful_run() {
    let harness = Harness::new(three_tables(), &["customers", "orders", "events"]).await;

    let metadata = harness
        .orchestrator
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let counts: Vec<(&str, u64)> = metadata
        .counts
        .iter()
        .map(|(table, count)| (table.as_str(), *count))
        .collect();
    assert_eq!(counts, vec![("customers", 5), ("orders", 12), ("events", 0)]);
    assert_eq!(metadata.status, RunStatus::Success);
    assert_eq!(metadata.error, None);
    assert_eq!(harness.metadata(), metadata);

    let customers = harness.parquet_files("customers");
    assert_eq!(customers.len(), 1);
    assert_eq!(parquet_rows(&customers[0]), 5);
    let orders = harness.parquet_files("orders");
    assert_eq!(orders.len(), 1);
    assert_eq!(parquet_rows(&orders[0]), 12);
    assert!(harness.parquet_files("events").is_empty());

    harness.assert_connection_discipline(&["customers", "orders", "events"]);
    assert!(harness.staging_is_empty());
}

#[tokio::test]
async fn test_metadata_json_shape() {
    let harness = Harness::new(three_tables(), &["customers", "orders", "events"]).await;
    harness
        .orchestrator
        .run(&CancellationToken::new())
        .await
        .unwrap();

    let text = std::fs::read_to_string(harness.out.path().join("etl.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();

    assert_eq!(value["status"], "success");
    assert!(value.get("error").is_none());
    assert!(value["duration_ms"].is_u64());
    let last_run_at = value["last_run_at"].as_str().unwrap();
    assert!(last_run_at.ends_with('Z'));
    assert_eq!(last_run_at.len(), "2024-03-09T03:00:00.000Z".len());
    assert!(text.find("\"customers\"") < text.find("\"orders\""));
    assert!(text.find("\"orders\"") < text.find("\"events\""));
}

#[tokio::test]
async fn test_mid_stream_failure_fails_run() {
    let extractor = MemoryExtractor::new()
        .with_table("customers", MemoryTable::generated("customers", 5))
        .with_table(
            "orders",
            MemoryTable::generated("orders", 12).fail_after(3, "connection reset"),
        )
        .with_table("events", MemoryTable::generated("events", 2));
    let harness = Harness::new(extractor, &["customers", "orders", "events"]).await;

    let err = harness
        .orchestrator
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(&err, PipelineError::Load { table, .. } if table == "orders"));

    let metadata = harness.metadata();
    assert_eq!(metadata.status, RunStatus::Error);
    let error = metadata.error.unwrap();
    assert!(error.contains("orders"));
    assert!(error.contains("connection reset"));
    assert_eq!(
        metadata.counts.keys().collect::<Vec<_>>(),
        vec!["customers", "orders", "events"]
    );
    assert!(metadata.counts.values().all(|count| *count == 0));

    assert!(harness.parquet_files("orders").is_empty());
    harness.assert_connection_discipline(&["customers", "orders", "events"]);
    assert!(harness.staging_is_empty());
}

#[tokio::test]
async fn test_extract_failure_releases_siblings() {
    let extractor = MemoryExtractor::new()
        .with_table(
            "customers",
            MemoryTable::generated("customers", 50).with_row_delay(Duration::from_millis(5)),
        )
        .with_table("orders", MemoryTable::default().fail_on_extract("pool exhausted"));
    let harness = Harness::new(extractor, &["customers", "orders"]).await;

    let err = harness
        .orchestrator
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(&err, PipelineError::Extract { table, .. } if table == "orders"));
    assert!(err.to_string().contains("pool exhausted"));

    // customers may be cancelled before or after it obtained a handle
    assert_eq!(harness.extractor.releases("orders"), 0);
    assert!(harness.extractor.releases("customers") <= 1);
    harness.assert_connection_discipline(&[]);
    assert!(harness.parquet_files("customers").is_empty());
    assert!(harness.staging_is_empty());
    assert_eq!(harness.metadata().status, RunStatus::Error);
}

#[tokio::test]
async fn test_stalled_table_times_out() {
    let extractor = MemoryExtractor::new()
        .with_table("customers", MemoryTable::generated("customers", 5))
        .with_table("events", MemoryTable::generated("events", 2).stalled());
    let mut harness = Harness::new(extractor, &["customers", "events"]).await;
    harness.orchestrator = harness
        .orchestrator
        .with_table_timeout(Some(Duration::from_secs(1)));

    let err = harness
        .orchestrator
        .run(&CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(&err, PipelineError::Timeout { table, secs: 1 } if table == "events"));

    harness.assert_connection_discipline(&["customers", "events"]);
    assert!(harness.staging_is_empty());
    let metadata = harness.metadata();
    assert_eq!(metadata.status, RunStatus::Error);
    assert!(metadata.error.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_shutdown_before_run() {
    let harness = Harness::new(three_tables(), &["customers", "orders", "events"]).await;
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let err = harness.orchestrator.run(&shutdown).await.unwrap_err();
    assert!(err.is_cancelled());

    assert_eq!(harness.extractor.calls(), vec![SourceCall::Close]);
    assert_eq!(harness.metadata().status, RunStatus::Error);
}

#[tokio::test]
async fn test_repeated_runs_overwrite_metadata() {
    let harness = Harness::new(three_tables(), &["customers", "orders", "events"]).await;

    let first = harness
        .orchestrator
        .run(&CancellationToken::new())
        .await
        .unwrap();
    let second = harness
        .orchestrator
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(first.counts, second.counts);
    assert_eq!(harness.metadata(), second);

    let top_level: Vec<String> = std::fs::read_dir(harness.out.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".json"))
        .collect();
    assert_eq!(top_level, vec!["etl.json"]);
    assert_eq!(harness.parquet_files("customers").len(), 1);
    assert_eq!(harness.extractor.closes(), 2);
}

#[tokio::test]
async fn test_conflicting_column_shapes_do_not_fail_run() {
    let mut rows: Vec<snowdrift::source::Row> = (0..999)
        .map(|i| {
            serde_json::from_value(serde_json::json!({"id": i, "properties": {"k": i}})).unwrap()
        })
        .collect();
    rows.push(
        serde_json::from_value(serde_json::json!({"id": 999, "properties": "legacy"})).unwrap(),
    );
    let extractor = MemoryExtractor::new()
        .with_table("customers", MemoryTable::generated("customers", 5))
        .with_table("events", MemoryTable::new(rows));
    let harness = Harness::new(extractor, &["customers", "events"]).await;

    let metadata = harness
        .orchestrator
        .run(&CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(metadata.status, RunStatus::Success);
    assert_eq!(metadata.counts["events"], 1000);
    let events = harness.parquet_files("events");
    assert_eq!(events.len(), 1);
    assert_eq!(parquet_rows(&events[0]), 1000);
    harness.assert_connection_discipline(&["customers", "events"]);
}

/// A directory squatting on the metadata key makes every metadata write fail.
fn block_metadata(harness: &Harness) {
    std::fs::create_dir(harness.out.path().join("etl.json")).unwrap();
}

#[tokio::test]
async fn test_table_error_wins_over_metadata_failure() {
    let extractor = MemoryExtractor::new()
        .with_table("customers", MemoryTable::generated("customers", 5))
        .with_table(
            "orders",
            MemoryTable::generated("orders", 12).fail_after(3, "connection reset"),
        );
    let harness = Harness::new(extractor, &["customers", "orders"]).await;
    block_metadata(&harness);

    let err = harness
        .orchestrator
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(&err, PipelineError::Load { table, .. } if table == "orders"));
    assert!(err.to_string().contains("connection reset"));
    harness.assert_connection_discipline(&["customers", "orders"]);
    assert!(harness.staging_is_empty());
}

#[tokio::test]
async fn test_metadata_failure_fails_successful_run() {
    let harness = Harness::new(three_tables(), &["customers", "orders", "events"]).await;
    block_metadata(&harness);

    let err = harness
        .orchestrator
        .run(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::MetadataUpload { .. }));
    // the table outputs themselves were written
    assert_eq!(harness.parquet_files("customers").len(), 1);
    assert_eq!(harness.parquet_files("orders").len(), 1);
    harness.assert_connection_discipline(&["customers", "orders", "events"]);
}
