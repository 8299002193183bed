//! Run orchestrator: ties fetcher → loader together.
//!
//! ## Run shape
//!
//! For each planned window (most recent first), for each configured site:
//!   1. wait for the rate limiter (skipped only for the job's very first request)
//!   2. fetch the partition, retrying once after the cooloff
//!   3. replace the partition in the sink, retrying once after the cooloff
//!
//! Strictly sequential. The first fatal error stops the run; partitions loaded
//! before it stay loaded.

use crate::config::AppConfig;
use crate::error::Result;
use crate::fetcher::{RateLimitedFetcher, SiteReportSource, SmartApiClient};
use crate::loader::IdempotentLoader;
use crate::models::{DateWindow, SiteId};
use crate::storage::{DuckDbSink, Sink};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

// ── Rate limiter ──────────────────────────────────────────────────────────────

/// Job-wide pacing: every request but the first waits `delay`.
#[derive(Debug)]
pub struct RequestPacer {
    delay: Duration,
    first_request_pending: bool,
}

impl RequestPacer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            first_request_pending: true,
        }
    }

    pub async fn wait_turn(&mut self) {
        if self.first_request_pending {
            self.first_request_pending = false;
            return;
        }
        debug!("Rate limit: waiting {:?}", self.delay);
        sleep(self.delay).await;
    }
}

/// Mutable state of one run. Created per `execute` call, never shared.
#[derive(Debug)]
struct JobContext {
    pacer: RequestPacer,
    stats: RunStats,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunStats {
    pub windows_processed: usize,
    pub partitions_loaded: usize,
    pub rows_loaded: usize,
    /// HTTP calls sent, retries included.
    pub requests: usize,
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct Pipeline<S, K> {
    fetcher: RateLimitedFetcher<S>,
    loader: IdempotentLoader<K>,
    wait_period: Duration,
}

impl Pipeline<SmartApiClient, DuckDbSink> {
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let cooloff = config.job.wait_cooloff();
        let client = SmartApiClient::new(&config.api)?;
        let loader = IdempotentLoader::new(DuckDbSink::new(&config.sink), cooloff)
            .with_chunk_size(config.sink.chunk_size);

        Ok(Self::new(
            RateLimitedFetcher::new(client, cooloff),
            loader,
            config.job.wait_period(),
        ))
    }
}

impl<S: SiteReportSource, K: Sink> Pipeline<S, K> {
    pub fn new(fetcher: RateLimitedFetcher<S>, loader: IdempotentLoader<K>, wait_period: Duration) -> Self {
        Self {
            fetcher,
            loader,
            wait_period,
        }
    }

    pub async fn execute(&self, windows: &[DateWindow], sites: &[SiteId]) -> Result<RunStats> {
        let mut ctx = JobContext {
            pacer: RequestPacer::new(self.wait_period),
            stats: RunStats::default(),
        };
        let sent_before = self.fetcher.requests_sent();

        info!(
            "=== {} windows × {} sites = {} partitions ===",
            windows.len(),
            sites.len(),
            windows.len() * sites.len()
        );

        for (i, window) in windows.iter().enumerate() {
            info!("=== Window {}/{}: {} ===", i + 1, windows.len(), window);

            for site in sites {
                ctx.pacer.wait_turn().await;

                let batch = self.fetcher.fetch(window, site).await?;
                let rows = self.loader.load(&batch).await?;

                ctx.stats.partitions_loaded += 1;
                ctx.stats.rows_loaded += rows;
            }

            ctx.stats.windows_processed += 1;
        }

        ctx.stats.requests = self.fetcher.requests_sent() - sent_before;

        info!(
            "=== Done: {} partitions | {} rows | {} requests ===",
            ctx.stats.partitions_loaded, ctx.stats.rows_loaded, ctx.stats.requests
        );

        Ok(ctx.stats)
    }
}
