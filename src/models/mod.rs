use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One row of the `OUTPUT` array: field name → JSON value, in API order.
pub type Record = serde_json::Map<String, serde_json::Value>;

// ── Date window ───────────────────────────────────────────────────────────────

/// Inclusive date range submitted as a single API query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start <= end, "window start after end");
        Self { start, end }
    }

    /// Number of calendar days covered, both bounds included.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

// ── Site ──────────────────────────────────────────────────────────────────────

/// Opaque facility hash. Never parsed, only compared and echoed back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Partition key ─────────────────────────────────────────────────────────────

/// Unit of idempotent replacement in the sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    pub window: DateWindow,
    pub site: SiteId,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "site {} {}", self.site, self.window)
    }
}

// ── Fetch batch ───────────────────────────────────────────────────────────────

/// Rows returned by one API call, tied to the partition they were fetched for.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchBatch {
    pub window: DateWindow,
    pub site: SiteId,
    pub records: Vec<Record>,
}

impl FetchBatch {
    pub fn key(&self) -> PartitionKey {
        PartitionKey {
            window: self.window,
            site: self.site.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Body of a successful `/api/sitrep/site/{site}/` call.
#[derive(Debug, Deserialize)]
pub struct SitrepResponse {
    #[serde(rename = "OUTPUT")]
    pub output: Vec<Record>,
}
