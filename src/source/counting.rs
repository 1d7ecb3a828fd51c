//! Pass-through row counting.

use futures::stream::{BoxStream, Stream, StreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, monotonically increasing row count.
///
/// Cloning shares the count. Reading is valid at any time; the value is
/// final once the counted stream has been drained.
#[derive(Debug, Clone, Default)]
pub struct RowCounter(Arc<AtomicU64>);

impl RowCounter {
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::AcqRel);
    }
}

/// Wrap `stream` so that every `Ok` item bumps the returned counter as it
/// is handed to the consumer.
///
/// Items are forwarded one at a time, in order, unchanged. Errors are
/// forwarded but not counted.
pub fn counted<'a, T, E, S>(stream: S) -> (BoxStream<'a, Result<T, E>>, RowCounter)
where
    S: Stream<Item = Result<T, E>> + Send + 'a,
    T: Send + 'a,
    E: Send + 'a,
{
    let counter = RowCounter::default();
    let observed = counter.clone();
    let stream = stream
        .inspect(move |item| {
            if item.is_ok() {
                observed.increment();
            }
        })
        .boxed();
    (stream, counter)
}
