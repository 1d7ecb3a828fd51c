//! Metrics and observability infrastructure.
//!
//! - `events`: Internal event types and the `InternalEvent` trait
//! - `server`: Prometheus HTTP server and initialization

pub mod events;
pub mod server;

pub use server::init;

/// Macro for emitting metric events.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding Prometheus metric.
///
/// ```ignore
/// use snowdrift::metrics::events::RowsExtracted;
///
/// emit!(RowsExtracted { count: 100, table: "orders".into() });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
