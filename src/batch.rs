//! Bounded concurrent fetching of many independent items.
//!
//! Each item runs its own retry ladder behind a shared worker semaphore.
//! Items that exhaust their retries map to `None`; they never abort the
//! batch, and the result always carries exactly one key per input item.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{info, warn};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::error::{FetchError, FetchErrorKind};

/// Settings for one [`fetch_all`] batch.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Maximum number of in-flight fetches.
    pub worker_limit: usize,
    /// Retry ceiling per item.
    pub max_attempts: usize,
    /// Optional overall deadline. Once expired, no new items are dispatched
    /// and pending retries stop; unfinished items come back as `None`.
    pub deadline: Option<Duration>,
    /// Log a progress line every this many completions.
    pub progress_every: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            worker_limit: 5,
            max_attempts: 5,
            deadline: None,
            progress_every: 25,
        }
    }
}

/// Backoff before retry `attempt + 1`, by error kind. Connection trouble is
/// treated as more severe than ordinary rate limiting and backed off harder;
/// anything else gets a short linear ramp.
fn backoff_for(kind: FetchErrorKind, attempt: usize) -> Duration {
    match kind {
        FetchErrorKind::RateLimited => Duration::from_secs((1u64 << attempt.min(6)).min(8)),
        FetchErrorKind::Connection => Duration::from_secs((1u64 << (attempt.min(6) + 1)).min(16)),
        FetchErrorKind::Other => Duration::from_secs_f64(0.5 * (attempt as f64 + 1.0)),
    }
}

/// Run one resilient fetch per item under a fixed worker cap and aggregate
/// the results into a map keyed by item.
///
/// The map always contains every input item exactly once; items that failed
/// all retries (or were cut off by the deadline) map to `None`. Completion
/// order is non-deterministic.
pub async fn fetch_all<K, T, F>(
    items: Vec<K>,
    config: BatchConfig,
    fetch: F,
) -> HashMap<K, Option<T>>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    T: Send + 'static,
    F: Fn(K) -> BoxFuture<'static, Result<T, FetchError>> + Send + Sync + 'static,
{
    let total = items.len();
    let mut results = HashMap::with_capacity(total);
    if total == 0 {
        return results;
    }

    let semaphore = Arc::new(Semaphore::new(config.worker_limit.max(1)));
    let fetch = Arc::new(fetch);
    let deadline = config.deadline.map(|d| Instant::now() + d);
    let completed = Arc::new(AtomicUsize::new(0));
    let succeeded = Arc::new(AtomicUsize::new(0));
    let progress_every = config.progress_every.max(1);
    let max_attempts = config.max_attempts.max(1);

    let mut handles = Vec::with_capacity(total);
    for item in items {
        let semaphore = Arc::clone(&semaphore);
        let fetch = Arc::clone(&fetch);
        let completed = Arc::clone(&completed);
        let succeeded = Arc::clone(&succeeded);
        let task_item = item.clone();

        let handle = tokio::spawn(async move {
            // Permit bounds in-flight work; acquire can only fail if the
            // semaphore is closed, which never happens here.
            let _permit = semaphore.acquire_owned().await.ok()?;
            if past(deadline) {
                return None;
            }
            let result = fetch_with_retry(&*fetch, task_item, max_attempts, deadline).await;

            let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
            if result.is_some() {
                succeeded.fetch_add(1, Ordering::Relaxed);
            }
            if done % progress_every == 0 {
                let ok = succeeded.load(Ordering::Relaxed);
                info!("Fetched {}/{} items ({} ok, {} failed)", done, total, ok, done - ok);
            }
            result
        });
        handles.push((item, handle));
    }

    for (item, handle) in handles {
        let result = handle.await.unwrap_or_default();
        results.insert(item, result);
    }

    let ok = succeeded.load(Ordering::Relaxed);
    info!("Batch complete: {}/{} items fetched", ok, total);
    results
}

fn past(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() >= d)
}

async fn fetch_with_retry<K, T, F>(
    fetch: &F,
    item: K,
    max_attempts: usize,
    deadline: Option<Instant>,
) -> Option<T>
where
    K: Clone,
    F: Fn(K) -> BoxFuture<'static, Result<T, FetchError>>,
{
    for attempt in 0..max_attempts {
        match fetch(item.clone()).await {
            Ok(value) => return Some(value),
            Err(e) => {
                if attempt + 1 >= max_attempts {
                    warn!("Item failed after {} attempts: {}", max_attempts, e);
                    return None;
                }
                let delay = backoff_for(e.kind(), attempt);
                if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                    warn!("Batch deadline reached, giving up on item");
                    return None;
                }
                tokio::time::sleep(delay).await;
            }
        }
    }
    None
}
