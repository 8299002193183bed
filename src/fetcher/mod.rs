pub mod http_client;
pub mod parsers;

use crate::error::{Result, SmartError};
use crate::models::{DateWindow, FetchBatch, Record, SiteId};
use crate::utils::retry_once;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

pub use self::http_client::SmartApiClient;

// ── Source trait ──────────────────────────────────────────────────────────────

/// Swappable site report source: one call, one window, one site.
#[async_trait]
pub trait SiteReportSource: Send + Sync {
    async fn fetch_site_report(&self, window: &DateWindow, site: &SiteId) -> Result<Vec<Record>>;
}

// ── Fetcher ───────────────────────────────────────────────────────────────────

/// Wraps a source with a single retry after `cooloff`.
///
/// Pacing between requests is the orchestrator's job; this only ever sleeps
/// between the two attempts of the same call.
pub struct RateLimitedFetcher<S> {
    source: S,
    cooloff: Duration,
    requests_sent: AtomicUsize,
}

impl<S: SiteReportSource> RateLimitedFetcher<S> {
    pub fn new(source: S, cooloff: Duration) -> Self {
        Self {
            source,
            cooloff,
            requests_sent: AtomicUsize::new(0),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Calls made to the source so far, retries included.
    pub fn requests_sent(&self) -> usize {
        self.requests_sent.load(Ordering::Relaxed)
    }

    /// Fetch one partition. Two failures in a row are fatal for the run.
    pub async fn fetch(&self, window: &DateWindow, site: &SiteId) -> Result<FetchBatch> {
        let label = format!("fetch site {site} {window}");

        let records = retry_once(&label, self.cooloff, move || {
            self.requests_sent.fetch_add(1, Ordering::Relaxed);
            self.source.fetch_site_report(window, site)
        })
        .await
        .map_err(|e| SmartError::FetchExhausted {
            site: site.clone(),
            window: *window,
            source: Box::new(e),
        })?;

        debug!("site {} {}: {} rows fetched", site, window, records.len());

        Ok(FetchBatch {
            window: *window,
            site: site.clone(),
            records,
        })
    }
}
