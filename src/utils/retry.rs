//! Single-retry-after-cooloff combinator shared by the fetcher and the loader.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::FixedInterval;
use tracing::warn;

/// Attempts made by [`retry_once`] before giving up.
pub const MAX_ATTEMPTS: usize = 2;

/// Run `action`; if it fails, wait `cooloff` and run it once more from scratch.
///
/// Returns the error of the second attempt when both fail. Every failed
/// attempt is logged with `label`.
pub async fn retry_once<T, E, F, Fut>(label: &str, cooloff: Duration, action: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let strategy = FixedInterval::new(cooloff).take(MAX_ATTEMPTS - 1);
    let mut attempt = 0usize;

    RetryIf::spawn(strategy, action, |e: &E| {
        attempt += 1;
        if attempt < MAX_ATTEMPTS {
            warn!("{label}: attempt {attempt}/{MAX_ATTEMPTS} failed ({e}), cooling off for {cooloff:?}");
        } else {
            warn!("{label}: attempt {attempt}/{MAX_ATTEMPTS} failed ({e}), giving up");
        }
        true
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_first_success_needs_no_cooloff() {
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        let out: Result<u32, String> = retry_once("op", Duration::from_secs(30), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await;

        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_attempt_after_cooloff() {
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        let out: Result<u32, String> = retry_once("op", Duration::from_secs(30), || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err("boom".to_string()),
                _ => Ok(9),
            }
        })
        .await;

        assert_eq!(out, Ok(9));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_two_attempts() {
        let calls = AtomicUsize::new(0);

        let out: Result<u32, String> = retry_once("op", Duration::from_secs(1), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Err(format!("failure {n}"))
        })
        .await;

        assert_eq!(out, Err("failure 1".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
