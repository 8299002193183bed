//! Idempotent partition loader.
//!
//! Each load replaces one `(window, site)` partition: open a fresh sink
//! connection, delete whatever the partition already holds, append the new
//! rows in chunks. Delete and insert are separate statements, so a crash in
//! between leaves the partition empty until the next run reloads it.

use crate::error::{Result, SmartError};
use crate::models::{DateWindow, FetchBatch, PartitionKey, Record, SiteId};
use crate::storage::columns::{Column, infer_columns};
use crate::storage::{REPORT_DATE_FIELD, SITE_ID_FIELD, Sink, SinkConnection};
use crate::utils::retry_once;
use chrono::NaiveDate;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Rows per INSERT statement unless configured otherwise.
pub const DEFAULT_CHUNK_SIZE: usize = 150;

pub struct IdempotentLoader<K> {
    sink: K,
    cooloff: Duration,
    chunk_size: usize,
}

impl<K: Sink> IdempotentLoader<K> {
    pub fn new(sink: K, cooloff: Duration) -> Self {
        Self {
            sink,
            cooloff,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    /// Replace the batch's partition in the sink. Returns rows inserted.
    ///
    /// A failed attempt is redone from a new connection after the cooloff;
    /// a second failure is fatal for the run.
    pub async fn load(&self, batch: &FetchBatch) -> Result<usize> {
        let key = batch.key();
        let records = stamp_site(&batch.records, &batch.site);
        let columns = infer_columns(&records);
        let label = format!("load {key}");

        let stray = outside_window(&records, &batch.window);
        if stray > 0 {
            warn!("{}: {} rows report a date outside the window; a re-run will not replace them", key, stray);
        }

        let (key_ref, columns_ref, records_ref) = (&key, &columns, &records);
        let inserted = retry_once(&label, self.cooloff, move || async move {
            self.load_once(key_ref, columns_ref, records_ref)
        })
        .await
        .map_err(|e| SmartError::LoadExhausted {
            key: key.clone(),
            source: Box::new(e),
        })?;

        info!(
            "Upload successful for site {} from {} to {} ({} rows)",
            key.site, key.window.start, key.window.end, inserted
        );
        Ok(inserted)
    }

    fn load_once(&self, key: &PartitionKey, columns: &[Column], records: &[Record]) -> Result<usize> {
        let conn = self.sink.connect()?;

        if conn.table_exists()? {
            conn.sync_columns(columns)?;
            let removed = conn.delete_partition(key)?;
            debug!("{}: removed {} previously loaded rows", key, removed);
        } else if !records.is_empty() {
            conn.create_table(columns)?;
        }

        conn.insert_rows(columns, records, self.chunk_size)
    }
}

/// Rows whose `reportDate` parses but falls outside `window`.
fn outside_window(records: &[Record], window: &DateWindow) -> usize {
    records
        .iter()
        .filter_map(report_day)
        .filter(|day| !window.contains(*day))
        .count()
}

fn report_day(record: &Record) -> Option<NaiveDate> {
    let text = record.get(REPORT_DATE_FIELD)?.as_str()?;
    NaiveDate::parse_from_str(text.get(..10)?, "%Y-%m-%d").ok()
}

/// Rows without a `siteId` get the partition's site so later deletes match them.
fn stamp_site(records: &[Record], site: &SiteId) -> Vec<Record> {
    records
        .iter()
        .map(|record| {
            let mut record = record.clone();
            if record.get(SITE_ID_FIELD).is_none_or(Value::is_null) {
                record.insert(SITE_ID_FIELD.to_string(), Value::String(site.as_str().to_string()));
            }
            record
        })
        .collect()
}

#[cfg(test)]
pub mod testing {
    //! Sink wrapper that injects connection and insert failures.

    use super::*;
    use crate::storage::{DuckDbSink, Repository};
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub struct FlakySink {
        pub inner: DuckDbSink,
        connect_failures: AtomicUsize,
        insert_failures: AtomicUsize,
        pub connects: AtomicUsize,
    }

    impl FlakySink {
        pub fn new(connect_failures: usize, insert_failures: usize) -> Self {
            Self {
                inner: DuckDbSink::in_memory("main", "sitrep").unwrap(),
                connect_failures: AtomicUsize::new(connect_failures),
                insert_failures: AtomicUsize::new(insert_failures),
                connects: AtomicUsize::new(0),
            }
        }

        pub fn reliable() -> Self {
            Self::new(0, 0)
        }

        pub fn fail_next_inserts(&self, n: usize) {
            self.insert_failures.store(n, Ordering::SeqCst);
        }

        pub fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        pub fn repo(&self) -> Repository {
            self.inner.connect().unwrap()
        }
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub struct FlakyConnection<'a> {
        inner: Repository,
        sink: &'a FlakySink,
    }

    impl<'a> Sink for &'a FlakySink {
        type Connection = FlakyConnection<'a>;

        fn connect(&self) -> Result<FlakyConnection<'a>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.connect_failures) {
                return Err(SmartError::Sink("connection refused".into()));
            }
            Ok(FlakyConnection {
                inner: self.inner.connect()?,
                sink: *self,
            })
        }
    }

    impl SinkConnection for FlakyConnection<'_> {
        fn table_exists(&self) -> Result<bool> {
            self.inner.table_exists()
        }

        fn create_table(&self, columns: &[Column]) -> Result<()> {
            self.inner.create_table(columns)
        }

        fn sync_columns(&self, columns: &[Column]) -> Result<()> {
            self.inner.sync_columns(columns)
        }

        fn delete_partition(&self, key: &PartitionKey) -> Result<usize> {
            self.inner.delete_partition(key)
        }

        fn insert_rows(&self, columns: &[Column], records: &[Record], chunk_size: usize) -> Result<usize> {
            if take_failure(&self.sink.insert_failures) {
                return Err(SmartError::Sink("connection dropped mid-insert".into()));
            }
            self.inner.insert_rows(columns, records, chunk_size)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FlakySink;
    use super::*;
    use crate::fetcher::testing::rows_for;
    use crate::models::DateWindow;
    use crate::storage::DuckDbSink;
    use chrono::NaiveDate;
    use serde_json::json;
    use tokio::time::Instant;

    fn batch(start: (u32, u32), end: (u32, u32), site: &str) -> FetchBatch {
        let window = DateWindow::new(
            NaiveDate::from_ymd_opt(2024, start.0, start.1).unwrap(),
            NaiveDate::from_ymd_opt(2024, end.0, end.1).unwrap(),
        );
        let site = SiteId::new(site);
        FetchBatch {
            records: rows_for(&window, &site),
            window,
            site,
        }
    }

    #[tokio::test]
    async fn test_load_creates_table_and_inserts() {
        let sink = DuckDbSink::in_memory("main", "sitrep").unwrap();
        let loader = IdempotentLoader::new(sink, Duration::ZERO).with_chunk_size(3);
        let b = batch((3, 4), (3, 10), "abc");

        assert_eq!(loader.load(&b).await.unwrap(), 7);

        let repo = loader.sink().connect().unwrap();
        assert_eq!(repo.row_count().unwrap(), 7);
        assert_eq!(repo.partition_count(&b.key()).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_load_twice_leaves_one_copy() {
        let loader = IdempotentLoader::new(DuckDbSink::in_memory("main", "sitrep").unwrap(), Duration::ZERO);
        let b = batch((3, 4), (3, 10), "abc");

        loader.load(&b).await.unwrap();
        loader.load(&b).await.unwrap();
        loader.load(&b).await.unwrap();

        let repo = loader.sink().connect().unwrap();
        assert_eq!(repo.row_count().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_load_replaces_only_its_partition() {
        let loader = IdempotentLoader::new(DuckDbSink::in_memory("main", "sitrep").unwrap(), Duration::ZERO);
        let older = batch((3, 1), (3, 3), "abc");
        let other_site = batch((3, 4), (3, 10), "def");
        let mut fresh = batch((3, 4), (3, 10), "abc");

        loader.load(&older).await.unwrap();
        loader.load(&other_site).await.unwrap();
        loader.load(&fresh).await.unwrap();

        // The API now reports fewer days for the same partition.
        fresh.records.truncate(2);
        loader.load(&fresh).await.unwrap();

        let repo = loader.sink().connect().unwrap();
        assert_eq!(repo.partition_count(&fresh.key()).unwrap(), 2);
        assert_eq!(repo.partition_count(&older.key()).unwrap(), 3);
        assert_eq!(repo.partition_count(&other_site.key()).unwrap(), 7);
    }

    #[tokio::test]
    async fn test_empty_batch_clears_partition() {
        let loader = IdempotentLoader::new(DuckDbSink::in_memory("main", "sitrep").unwrap(), Duration::ZERO);
        let mut b = batch((3, 4), (3, 10), "abc");
        loader.load(&b).await.unwrap();

        b.records.clear();
        assert_eq!(loader.load(&b).await.unwrap(), 0);
        assert_eq!(loader.sink().connect().unwrap().partition_count(&b.key()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_without_table_is_noop() {
        let loader = IdempotentLoader::new(DuckDbSink::in_memory("main", "sitrep").unwrap(), Duration::ZERO);
        let mut b = batch((3, 4), (3, 10), "abc");
        b.records.clear();

        assert_eq!(loader.load(&b).await.unwrap(), 0);
        assert!(!loader.sink().connect().unwrap().table_exists().unwrap());
    }

    #[tokio::test]
    async fn test_rows_without_site_are_stamped() {
        let loader = IdempotentLoader::new(DuckDbSink::in_memory("main", "sitrep").unwrap(), Duration::ZERO);
        let mut b = batch((3, 4), (3, 5), "abc");
        for record in &mut b.records {
            record.remove(SITE_ID_FIELD);
        }
        b.records[1].insert(SITE_ID_FIELD.into(), json!(null));

        loader.load(&b).await.unwrap();
        loader.load(&b).await.unwrap();

        assert_eq!(loader.sink().connect().unwrap().partition_count(&b.key()).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_fractional_values_after_integer_batch_are_kept() {
        let loader = IdempotentLoader::new(DuckDbSink::in_memory("main", "sitrep").unwrap(), Duration::ZERO);
        let mut first = batch((3, 4), (3, 10), "abc");
        for record in &mut first.records {
            record.insert("occupancy".into(), json!(1));
        }
        let mut later = batch((3, 1), (3, 3), "abc");
        for record in &mut later.records {
            record.insert("occupancy".into(), json!(0.4));
        }

        loader.load(&first).await.unwrap();
        loader.load(&later).await.unwrap();

        let repo = loader.sink().connect().unwrap();
        let occupancy = |day: &str| -> f64 {
            repo.conn()
                .query_row(
                    "SELECT occupancy FROM main.sitrep WHERE \"reportDate\" = ?",
                    [day],
                    |r| r.get(0),
                )
                .unwrap()
        };
        assert_eq!(occupancy("2024-03-02"), 0.4);
        assert_eq!(occupancy("2024-03-05"), 1.0);
        assert_eq!(repo.row_count().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_text_after_numeric_batch_loads_and_new_fields_are_added() {
        let loader = IdempotentLoader::new(DuckDbSink::in_memory("main", "sitrep").unwrap(), Duration::ZERO);
        let first = batch((3, 4), (3, 10), "abc");
        let mut later = batch((3, 1), (3, 3), "abc");
        for record in &mut later.records {
            record.insert("bedsOpen".into(), json!("n/a"));
            record.insert("ward".into(), json!("A1"));
        }

        loader.load(&first).await.unwrap();
        assert_eq!(loader.load(&later).await.unwrap(), 3);

        let repo = loader.sink().connect().unwrap();
        let columns = repo.columns().unwrap();
        assert!(columns.contains(&("bedsOpen".to_string(), "VARCHAR".to_string())));
        assert!(columns.contains(&("ward".to_string(), "VARCHAR".to_string())));
        assert_eq!(repo.row_count().unwrap(), 10);
    }

    #[test]
    fn test_outside_window_counts_stray_report_dates() {
        let b = batch((3, 4), (3, 10), "abc");
        assert_eq!(outside_window(&b.records, &b.window), 0);

        let mut records = b.records.clone();
        records[0].insert(REPORT_DATE_FIELD.into(), json!("2024-03-11T00:00:00"));
        records[1].insert(REPORT_DATE_FIELD.into(), json!("2024-03-03"));
        records[2].insert(REPORT_DATE_FIELD.into(), json!("not a date"));
        assert_eq!(outside_window(&records, &b.window), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_retried_after_cooloff() {
        let sink = FlakySink::new(1, 0);
        let loader = IdempotentLoader::new(&sink, Duration::from_secs(120));
        let b = batch((3, 4), (3, 10), "abc");
        let started = Instant::now();

        assert_eq!(loader.load(&b).await.unwrap(), 7);
        assert_eq!(sink.connects(), 2);
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert_eq!(sink.repo().row_count().unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insert_failure_after_delete_is_redone_in_full() {
        let sink = FlakySink::reliable();
        let loader = IdempotentLoader::new(&sink, Duration::from_secs(1));
        let b = batch((3, 4), (3, 10), "abc");
        loader.load(&b).await.unwrap();

        // Attempt one deletes the partition, then loses the insert.
        // Attempt two re-deletes (nothing left) and inserts again.
        sink.fail_next_inserts(1);
        assert_eq!(loader.load(&b).await.unwrap(), 7);

        assert_eq!(sink.connects(), 3);
        let repo = sink.repo();
        assert_eq!(repo.partition_count(&b.key()).unwrap(), 7);
        assert_eq!(repo.row_count().unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_failures_are_fatal() {
        let sink = FlakySink::new(1, 1);
        let loader = IdempotentLoader::new(&sink, Duration::from_secs(1));
        let b = batch((3, 4), (3, 10), "abc");

        let err = loader.load(&b).await.unwrap_err();

        match &err {
            SmartError::LoadExhausted { key, source } => {
                assert_eq!(key, &b.key());
                assert!(matches!(**source, SmartError::Sink(ref m) if m.contains("mid-insert")));
            }
            other => panic!("expected LoadExhausted, got {other:?}"),
        }
        // No third attempt.
        assert_eq!(sink.connects(), 2);
    }
}
