//! Relational source: row streams, counting and extraction handles.
//!
//! An [`Extractor`] binds one table to one query and hands back an
//! [`ExtractionHandle`]: a lazily fetched row stream, a live row counter and
//! a release handle that returns the underlying connection. The release
//! handle must be consumed exactly once whatever happens downstream.

mod counting;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
mod postgres;

pub use counting::{RowCounter, counted};
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryExtractor, MemoryTable, SourceCall};
pub use postgres::PostgresExtractor;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::future::Future;

use crate::error::SourceError;

/// A schema-less record as produced by the source query.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Lazily fetched, ordered rows of one query.
pub type RowStream = BoxStream<'static, Result<Row, SourceError>>;

type ReleaseFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Returns a checked-out connection to its pool.
///
/// Consuming `release` makes a second call impossible; dropping the handle
/// without calling it is a bug in the caller.
pub struct ReleaseHandle {
    release: ReleaseFn,
}

impl ReleaseHandle {
    pub fn new<F, Fut>(release: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            release: Box::new(move || release().boxed()),
        }
    }

    pub async fn release(self) {
        (self.release)().await
    }
}

impl std::fmt::Debug for ReleaseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ReleaseHandle")
    }
}

/// Everything a table job needs from the source.
pub struct ExtractionHandle {
    pub stream: RowStream,
    pub counter: RowCounter,
    pub release: ReleaseHandle,
}

impl ExtractionHandle {
    /// Insert the counting stage on `stream` and pair it with `release`.
    pub fn new(stream: RowStream, release: ReleaseHandle) -> Self {
        let (stream, counter) = counted(stream);
        Self {
            stream,
            counter,
            release,
        }
    }
}

/// A source of table snapshots.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Check out one connection and start streaming `query` for `table`.
    ///
    /// Pool exhaustion and query failures are returned here; errors after
    /// the handle exists surface on its stream.
    async fn extract(&self, table: &str, query: &str) -> Result<ExtractionHandle, SourceError>;

    /// Drop idle connections once every handle of a run has been released.
    async fn close(&self);
}
