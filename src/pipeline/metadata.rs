//! Run metadata document.
//!
//! One JSON object, overwritten at a fixed key after every run:
//!
//! ```json
//! {
//!   "counts": { "customers": 5, "orders": 12, "events": 0 },
//!   "duration_ms": 1834,
//!   "last_run_at": "2024-03-09T03:00:00.123Z",
//!   "status": "success"
//! }
//! ```

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
}

/// Outcome of one run as persisted to storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Rows streamed per table, in configured order. All zero on failure.
    pub counts: IndexMap<String, u64>,
    pub duration_ms: u64,
    #[serde(serialize_with = "millis", deserialize_with = "rfc3339")]
    pub last_run_at: DateTime<Utc>,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunMetadata {
    pub fn success(counts: IndexMap<String, u64>, duration: Duration, at: DateTime<Utc>) -> Self {
        Self {
            counts,
            duration_ms: duration.as_millis() as u64,
            last_run_at: at,
            status: RunStatus::Success,
            error: None,
        }
    }

    /// Partial counts are never reported; every table gets zero.
    pub fn failure(
        tables: impl IntoIterator<Item = String>,
        error: String,
        duration: Duration,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            counts: tables.into_iter().map(|table| (table, 0)).collect(),
            duration_ms: duration.as_millis() as u64,
            last_run_at: at,
            status: RunStatus::Error,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }
}

fn millis<S: Serializer>(at: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn rfc3339<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    let text = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}
