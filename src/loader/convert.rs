//! Staged NDJSON to Parquet conversion.
//!
//! Two passes over the staging file: the first infers an Arrow schema from
//! every well-formed record, the second decodes records into batches and
//! streams them into a Parquet writer that uploads straight to object
//! storage. Lines that are not JSON objects are skipped and counted.
//!
//! Records whose shapes disagree (an object in one row, a string in the
//! next) do not fail the table: the conflicting column is widened to `Utf8`
//! and non-string values are written as their JSON text. A record that still
//! cannot be decoded against the final schema is skipped and counted.

use arrow::array::RecordBatch;
use arrow::datatypes::{DataType, Field, FieldRef, Fields, Schema, SchemaRef};
use arrow::error::ArrowError;
use arrow::json::ReaderBuilder;
use arrow::json::reader::{Decoder, infer_json_schema_from_iterator};
use indexmap::IndexMap;
use object_store::buffered::BufWriter;
use object_store::path::Path;
use parquet::arrow::AsyncArrowWriter;
use parquet::basic::{Compression, GzipLevel, ZstdLevel};
use parquet::file::properties::WriterProperties;
use serde_json::Value;
use snafu::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ParquetCompression;
use crate::error::{
    CancelledSnafu, ConversionTaskSnafu, DecodeSnafu, LoaderError, ParquetWriteSnafu,
    StagingReadSnafu,
};
use crate::storage::{PARQUET_CONTENT_TYPE, StorageProvider};

/// Batches in flight between the decoding thread and the writer.
const CHANNEL_CAPACITY: usize = 2;

/// Outcome of one conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conversion {
    /// Records written to the Parquet file.
    pub records: u64,
    /// Lines that were not JSON objects plus records that failed to decode.
    pub malformed: u64,
    /// Whether a Parquet object was produced.
    pub written: bool,
}

/// Writer settings for the Parquet output.
#[derive(Debug, Clone, Copy)]
pub struct ParquetOptions {
    pub compression: ParquetCompression,
    pub batch_size: usize,
}

impl ParquetOptions {
    fn writer_properties(&self) -> WriterProperties {
        let compression = match self.compression {
            ParquetCompression::Uncompressed => Compression::UNCOMPRESSED,
            ParquetCompression::Snappy => Compression::SNAPPY,
            ParquetCompression::Gzip => Compression::GZIP(GzipLevel::default()),
            ParquetCompression::Zstd => Compression::ZSTD(ZstdLevel::default()),
            ParquetCompression::Lz4 => Compression::LZ4_RAW,
        };

        WriterProperties::builder()
            .set_compression(compression)
            .set_max_row_group_size(self.batch_size.max(1) * 16)
            .build()
    }
}

/// Iterator over the well-formed records of a staging file.
///
/// Blank lines are ignored; anything else that is not a JSON object is
/// counted in `malformed`. An I/O error ends iteration and is kept for
/// [`Records::finish`].
struct Records {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    valid: u64,
    malformed: u64,
    error: Option<std::io::Error>,
}

impl Records {
    fn open(path: PathBuf) -> Result<Self, LoaderError> {
        let file = File::open(&path).context(StagingReadSnafu { path: &path })?;
        Ok(Self {
            path,
            lines: BufReader::new(file).lines(),
            valid: 0,
            malformed: 0,
            error: None,
        })
    }

    /// `(valid, malformed)` counts, or the I/O error that cut reading short.
    fn finish(self) -> Result<(u64, u64), LoaderError> {
        match self.error {
            Some(source) => Err(source).context(StagingReadSnafu { path: self.path }),
            None => Ok((self.valid, self.malformed)),
        }
    }
}

impl Iterator for Records {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => {
                    self.error = Some(e);
                    return None;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(value @ Value::Object(_)) => {
                    self.valid += 1;
                    return Some(value);
                }
                _ => self.malformed += 1,
            }
        }
    }
}

/// First pass: schema of every well-formed record, plus record counts.
///
/// The whole file is inferred in one go first. If arrow rejects it because
/// two records disagree on a column's shape, the file is read again and the
/// per-record schemas are merged with [`merge_type`].
fn infer_schema(path: PathBuf) -> Result<(SchemaRef, u64, u64), LoaderError> {
    let mut records = Records::open(path.clone())?;
    match infer_json_schema_from_iterator(records.by_ref().map(Ok)) {
        Ok(schema) => {
            let (valid, malformed) = records.finish()?;
            Ok((coerce_schema(&schema), valid, malformed))
        }
        Err(e) => {
            debug!(error = %e, "Record shapes conflict, widening columns");
            let mut records = Records::open(path)?;
            let fields = merge_record_schemas(records.by_ref());
            let (valid, malformed) = records.finish()?;
            Ok((coerce_schema(&Schema::new(fields)), valid, malformed))
        }
    }
}

fn merge_record_schemas(records: impl Iterator<Item = Value>) -> Fields {
    let mut columns: IndexMap<String, DataType> = IndexMap::new();
    for record in records {
        // A record that is inconsistent on its own contributes nothing here;
        // decoding decides whether it survives.
        if let Ok(schema) = infer_json_schema_from_iterator(std::iter::once(Ok(record))) {
            for field in schema.fields() {
                merge_column(&mut columns, field);
            }
        }
    }
    into_fields(columns)
}

fn merge_column(columns: &mut IndexMap<String, DataType>, field: &Field) {
    match columns.get_mut(field.name()) {
        Some(existing) => *existing = merge_type(existing, field.data_type()),
        None => {
            columns.insert(field.name().clone(), field.data_type().clone());
        }
    }
}

fn into_fields(columns: IndexMap<String, DataType>) -> Fields {
    columns
        .into_iter()
        .map(|(name, data_type)| Field::new(name, data_type, true))
        .collect()
}

/// Smallest type that holds values of both `a` and `b`; `Utf8` when the two
/// shapes cannot be reconciled.
fn merge_type(a: &DataType, b: &DataType) -> DataType {
    match (a, b) {
        (a, b) if a == b => a.clone(),
        (DataType::Null, other) | (other, DataType::Null) => other.clone(),
        (DataType::Int64, DataType::Float64) | (DataType::Float64, DataType::Int64) => {
            DataType::Float64
        }
        (DataType::List(x), DataType::List(y)) => DataType::List(Arc::new(Field::new(
            x.name(),
            merge_type(x.data_type(), y.data_type()),
            true,
        ))),
        (DataType::Struct(x), DataType::Struct(y)) => {
            let mut columns: IndexMap<String, DataType> = x
                .iter()
                .map(|f| (f.name().clone(), f.data_type().clone()))
                .collect();
            for field in y.iter() {
                merge_column(&mut columns, field);
            }
            DataType::Struct(into_fields(columns))
        }
        _ => DataType::Utf8,
    }
}

/// Replace `Null` types (columns that were null in every record) with
/// nullable `Utf8` so that the output carries a concrete type.
fn coerce_schema(schema: &Schema) -> SchemaRef {
    let fields: Vec<FieldRef> = schema
        .fields()
        .iter()
        .map(|f| coerce_field(f.clone()))
        .collect();

    Arc::new(Schema::new_with_metadata(fields, schema.metadata().clone()))
}

fn coerce_field(field: FieldRef) -> FieldRef {
    match field.data_type() {
        DataType::Null => Arc::new(Field::new(field.name(), DataType::Utf8, true)),
        DataType::List(inner) => {
            let coerced = coerce_field(inner.clone());
            if Arc::ptr_eq(&coerced, inner) {
                field
            } else {
                Arc::new(Field::new(
                    field.name(),
                    DataType::List(coerced),
                    field.is_nullable(),
                ))
            }
        }
        DataType::Struct(children) => {
            let coerced: Vec<FieldRef> =
                children.iter().map(|f| coerce_field(f.clone())).collect();
            if coerced
                .iter()
                .zip(children.iter())
                .all(|(c, o)| Arc::ptr_eq(c, o))
            {
                field
            } else {
                Arc::new(Field::new(
                    field.name(),
                    DataType::Struct(coerced.into()),
                    field.is_nullable(),
                ))
            }
        }
        _ => field,
    }
}

/// Bring `record` in line with `schema` before decoding.
fn conform_record(record: &mut Value, schema: &Schema) {
    if let Value::Object(map) = record {
        for field in schema.fields() {
            if let Some(value) = map.get_mut(field.name()) {
                conform(value, field.data_type());
            }
        }
    }
}

fn conform(value: &mut Value, data_type: &DataType) {
    match data_type {
        DataType::Utf8 => {
            if !(value.is_string() || value.is_null()) {
                *value = Value::String(value.to_string());
            }
        }
        DataType::List(item) => match value {
            Value::Array(items) => items
                .iter_mut()
                .for_each(|item_value| conform(item_value, item.data_type())),
            Value::Null => {}
            scalar => {
                let mut single = scalar.take();
                conform(&mut single, item.data_type());
                *scalar = Value::Array(vec![single]);
            }
        },
        DataType::Struct(fields) => {
            if let Value::Object(map) = value {
                for field in fields {
                    if let Some(child) = map.get_mut(field.name()) {
                        conform(child, field.data_type());
                    }
                }
            }
        }
        _ => {}
    }
}

fn new_decoder(schema: &SchemaRef, batch_size: usize) -> Result<Decoder, LoaderError> {
    ReaderBuilder::new(schema.clone())
        .with_batch_size(batch_size)
        .with_strict_mode(false)
        .with_coerce_primitive(true)
        .build_decoder()
        .context(DecodeSnafu)
}

fn try_decode<S: serde::Serialize>(
    decoder: &mut Decoder,
    records: &[S],
) -> Result<Option<RecordBatch>, ArrowError> {
    decoder.serialize(records)?;
    decoder.flush()
}

/// Decode one chunk into a batch, plus the number of records dropped.
///
/// A failing chunk is retried record by record so that a single bad record
/// only costs itself.
fn decode_chunk(
    schema: &SchemaRef,
    chunk: &[Value],
) -> Result<(Option<RecordBatch>, u64), LoaderError> {
    let mut decoder = new_decoder(schema, chunk.len())?;
    if let Ok(batch) = try_decode(&mut decoder, chunk) {
        return Ok((batch, 0));
    }

    let mut accepted = Vec::with_capacity(chunk.len());
    let mut skipped = 0u64;
    for record in chunk {
        let mut single = new_decoder(schema, 1)?;
        match try_decode(&mut single, std::slice::from_ref(record)) {
            Ok(_) => accepted.push(record),
            Err(e) => {
                debug!(error = %e, "Skipping record that does not fit the schema");
                skipped += 1;
            }
        }
    }

    let mut decoder = new_decoder(schema, chunk.len())?;
    let batch = try_decode(&mut decoder, &accepted[..]).context(DecodeSnafu)?;
    Ok((batch, skipped))
}

/// Second pass: decode records into batches and push them down `tx`.
///
/// Returns the number of records that could not be decoded. Returns early
/// without error when the receiver has gone away.
fn decode_batches(
    path: PathBuf,
    schema: SchemaRef,
    batch_size: usize,
    tx: mpsc::Sender<RecordBatch>,
) -> Result<u64, LoaderError> {
    let mut records = Records::open(path)?;
    let mut chunk = Vec::with_capacity(batch_size);
    let mut skipped = 0u64;

    loop {
        chunk.clear();
        chunk.extend(records.by_ref().take(batch_size).map(|mut record| {
            conform_record(&mut record, &schema);
            record
        }));
        if chunk.is_empty() {
            break;
        }

        let (batch, rejected) = decode_chunk(&schema, &chunk)?;
        skipped += rejected;
        if let Some(batch) = batch {
            if tx.blocking_send(batch).is_err() {
                return Ok(skipped);
            }
        }
    }

    records.finish()?;
    Ok(skipped)
}

/// Convert the staging file at `staging` into a Parquet object at `output`.
///
/// No object is written when the file holds no well-formed records.
pub async fn write_parquet(
    staging: PathBuf,
    storage: &StorageProvider,
    output: &Path,
    options: ParquetOptions,
    cancel: &CancellationToken,
) -> Result<Conversion, LoaderError> {
    let (schema, valid, malformed) = {
        let path = staging.clone();
        tokio::task::spawn_blocking(move || infer_schema(path))
            .await
            .context(ConversionTaskSnafu)??
    };

    if valid == 0 {
        debug!(malformed, "No records to convert");
        return Ok(Conversion {
            records: 0,
            malformed,
            written: false,
        });
    }
    debug!(fields = schema.fields().len(), records = valid, "Inferred schema");

    let sink = BufWriter::new(storage.object_store(), storage.qualify_path(output).into_owned())
        .with_attributes(storage.content_attributes(PARQUET_CONTENT_TYPE));

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let decode = {
        let schema = schema.clone();
        tokio::task::spawn_blocking(move || decode_batches(staging, schema, options.batch_size, tx))
    };

    let (records, skipped) =
        upload(sink, schema, options.writer_properties(), rx, decode, cancel).await?;

    Ok(Conversion {
        records,
        malformed: malformed + skipped,
        written: true,
    })
}

/// Stream decoded batches into `sink` and complete the upload.
///
/// Any failure before the writer is closed aborts the upload, so a large
/// object does not leave an incomplete multipart upload behind.
async fn upload(
    mut sink: BufWriter,
    schema: SchemaRef,
    props: WriterProperties,
    rx: mpsc::Receiver<RecordBatch>,
    decode: JoinHandle<Result<u64, LoaderError>>,
    cancel: &CancellationToken,
) -> Result<(u64, u64), LoaderError> {
    let mut writer =
        AsyncArrowWriter::try_new(&mut sink, schema, Some(props)).context(ParquetWriteSnafu)?;

    let streamed = write_batches(&mut writer, rx, decode, cancel).await;
    match streamed {
        Ok(counts) => {
            writer.close().await.context(ParquetWriteSnafu)?;
            Ok(counts)
        }
        Err(e) => {
            drop(writer);
            if let Err(abort) = sink.abort().await {
                warn!(error = %abort, "Failed to abort parquet upload");
            }
            Err(e)
        }
    }
}

/// Returns `(records written, records skipped while decoding)`.
async fn write_batches(
    writer: &mut AsyncArrowWriter<&mut BufWriter>,
    mut rx: mpsc::Receiver<RecordBatch>,
    decode: JoinHandle<Result<u64, LoaderError>>,
    cancel: &CancellationToken,
) -> Result<(u64, u64), LoaderError> {
    let mut records = 0u64;
    let mut written = Ok(());
    while let Some(batch) = rx.recv().await {
        if cancel.is_cancelled() {
            written = CancelledSnafu.fail();
            break;
        }
        if let Err(e) = writer.write(&batch).await {
            written = Err(e).context(ParquetWriteSnafu);
            break;
        }
        records += batch.num_rows() as u64;
    }
    drop(rx);

    let decoded = decode.await.context(ConversionTaskSnafu)?;
    written?;
    let skipped = decoded?;
    Ok((records, skipped))
}
