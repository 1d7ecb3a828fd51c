//! In-memory extractor with scripted tables.
//!
//! Serves fixed rows per table and can inject failures at handle creation
//! or mid-stream. Every `release` and `close` is recorded so callers can
//! check connection discipline without a database.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use indexmap::IndexMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::{InjectedSnafu, SourceError};

use super::{ExtractionHandle, Extractor, ReleaseHandle, Row};

/// Scripted contents of one table.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    rows: Vec<Row>,
    fail_on_extract: Option<String>,
    fail_after: Option<(usize, String)>,
    row_delay: Option<Duration>,
    stall: bool,
}

impl MemoryTable {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    /// `count` rows of the form `{"id": n, "name": "<table>-n"}`.
    pub fn generated(name: &str, count: usize) -> Self {
        let rows = (0..count)
            .map(|id| {
                let mut row = Row::new();
                row.insert("id".into(), id.into());
                row.insert("name".into(), format!("{name}-{id}").into());
                row
            })
            .collect();
        Self::new(rows)
    }

    /// Reject the extraction itself, as a pool or query failure would.
    pub fn fail_on_extract(mut self, message: impl Into<String>) -> Self {
        self.fail_on_extract = Some(message.into());
        self
    }

    /// Yield `rows` rows, then a read error.
    pub fn fail_after(mut self, rows: usize, message: impl Into<String>) -> Self {
        self.fail_after = Some((rows, message.into()));
        self
    }

    /// Sleep before each row.
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }

    /// Never finish after the scripted rows.
    pub fn stalled(mut self) -> Self {
        self.stall = true;
        self
    }
}

/// Recorded calls against a [`MemoryExtractor`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceCall {
    Extract(String),
    Release(String),
    Close,
}

/// Extractor serving [`MemoryTable`]s.
#[derive(Debug, Default)]
pub struct MemoryExtractor {
    tables: IndexMap<String, MemoryTable>,
    calls: Arc<Mutex<Vec<SourceCall>>>,
}

impl MemoryExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: impl Into<String>, table: MemoryTable) -> Self {
        self.tables.insert(name.into(), table);
        self
    }

    /// Every call in the order it happened.
    pub fn calls(&self) -> Vec<SourceCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// How many times the handle for `table` was released.
    pub fn releases(&self, table: &str) -> usize {
        self.count(|call| matches!(call, SourceCall::Release(t) if t == table))
    }

    pub fn closes(&self) -> usize {
        self.count(|call| matches!(call, SourceCall::Close))
    }

    /// Handles created and not yet released.
    pub fn outstanding(&self) -> usize {
        let extracts = self.count(|call| matches!(call, SourceCall::Extract(_)));
        let releases = self.count(|call| matches!(call, SourceCall::Release(_)));
        extracts.saturating_sub(releases)
    }

    fn count(&self, pred: impl Fn(&SourceCall) -> bool) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|call| pred(call))
            .count()
    }

    fn record(&self, call: SourceCall) {
        record(&self.calls, call);
    }
}

fn record(calls: &Mutex<Vec<SourceCall>>, call: SourceCall) {
    calls
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(call);
}

#[async_trait]
impl Extractor for MemoryExtractor {
    async fn extract(&self, table: &str, _query: &str) -> Result<ExtractionHandle, SourceError> {
        let script = self.tables.get(table).cloned().unwrap_or_default();
        if let Some(message) = script.fail_on_extract {
            return InjectedSnafu { message }.fail();
        }
        self.record(SourceCall::Extract(table.to_string()));

        let mut items: Vec<Result<Row, SourceError>> = match &script.fail_after {
            Some((n, _)) => script.rows.into_iter().take(*n).map(Ok).collect(),
            None => script.rows.into_iter().map(Ok).collect(),
        };
        if let Some((_, message)) = script.fail_after {
            items.push(InjectedSnafu { message }.fail());
        }

        let delay = script.row_delay;
        let rows = stream::iter(items).then(move |item| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            item
        });
        let stream = if script.stall {
            rows.chain(stream::pending()).boxed()
        } else {
            rows.boxed()
        };

        let calls = self.calls.clone();
        let table = table.to_string();
        let release = ReleaseHandle::new(move || async move {
            record(&calls, SourceCall::Release(table));
        });

        Ok(ExtractionHandle::new(stream, release))
    }

    async fn close(&self) {
        self.record(SourceCall::Close);
    }
}
