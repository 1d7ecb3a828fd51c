//! Line-delimited staging files.
//!
//! A staging file holds one JSON object per line and lives only for the
//! duration of one table job. Its name carries the table and the run ID so
//! concurrent jobs and back-to-back runs never share a file.

use futures::StreamExt;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{
    CancelledSnafu, CreateStagingSnafu, LoaderError, ReadSnafu, SerializeSnafu, StagingWriteSnafu,
};
use crate::source::RowStream;

/// Write buffer in front of the staging file.
const WRITE_BUFFER_SIZE: usize = 256 * crate::config::KB;

/// Totals for one drained stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagedRows {
    pub rows: u64,
    pub bytes: u64,
}

/// A staging file on local disk, removed on [`StagingFile::remove`] or drop.
#[derive(Debug)]
pub struct StagingFile {
    path: PathBuf,
    removed: bool,
}

impl StagingFile {
    /// `<dir>/<table>-<run_id>.ndjson`
    pub fn path_for(dir: &Path, table: &str, run_id: Uuid) -> PathBuf {
        dir.join(format!("{table}-{run_id}.ndjson"))
    }

    /// Create (or truncate) the staging file for `table` in `dir`.
    pub async fn create(
        dir: &Path,
        table: &str,
        run_id: Uuid,
    ) -> Result<(Self, BufWriter<File>), LoaderError> {
        let path = Self::path_for(dir, table, run_id);

        tokio::fs::create_dir_all(dir)
            .await
            .context(CreateStagingSnafu { path: dir })?;
        let file = File::create(&path)
            .await
            .context(CreateStagingSnafu { path: &path })?;

        debug!(path = %path.display(), "Created staging file");
        let writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
        Ok((
            Self {
                path,
                removed: false,
            },
            writer,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Failures are logged and otherwise ignored.
    pub async fn remove(mut self) {
        self.removed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed staging file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.path.display(), error = %e, "Failed to remove staging file"),
        }
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Drain `rows` into `writer`, one JSON object per line.
///
/// Each row is written before the next is requested, so the source never
/// runs ahead of the disk. Cancellation is observed between rows.
pub async fn write_rows(
    mut rows: RowStream,
    mut writer: BufWriter<File>,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<StagedRows, LoaderError> {
    let mut staged = StagedRows::default();
    let mut line = Vec::with_capacity(1024);

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return CancelledSnafu.fail(),
            next = rows.next() => next,
        };
        let Some(row) = next else { break };
        let row = row.context(ReadSnafu)?;

        line.clear();
        serde_json::to_writer(&mut line, &row).context(SerializeSnafu)?;
        line.push(b'\n');
        writer
            .write_all(&line)
            .await
            .context(StagingWriteSnafu { path })?;

        staged.rows += 1;
        staged.bytes += line.len() as u64;
    }

    writer.flush().await.context(StagingWriteSnafu { path })?;
    writer
        .into_inner()
        .sync_all()
        .await
        .context(StagingWriteSnafu { path })?;

    Ok(staged)
}
