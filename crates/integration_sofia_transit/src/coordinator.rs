//! Periodic refresh of all configured stops
//!
//! One cycle fetches every stop in order, normalizes what came back and
//! publishes the concatenated lines. A cycle that collects nothing serves the
//! last good result until the failure threshold is reached.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::client::StopFetcher;
use crate::error::TransitError;
use crate::models::{AggregateResult, LineRecord};
use crate::normalize::normalize_stop;

/// Cloneable read handle on the last published aggregate
#[derive(Debug, Clone)]
pub struct PublishedLines {
    current: Arc<ArcSwapOption<AggregateResult>>,
    last_update_success: Arc<AtomicBool>,
    notify: watch::Sender<u64>,
}

impl Default for PublishedLines {
    fn default() -> Self {
        Self::new()
    }
}

impl PublishedLines {
    /// Empty handle, nothing published yet
    #[must_use]
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            current: Arc::new(ArcSwapOption::empty()),
            last_update_success: Arc::new(AtomicBool::new(false)),
            notify,
        }
    }

    /// Last published aggregate
    #[must_use]
    pub fn latest(&self) -> Option<Arc<AggregateResult>> {
        self.current.load_full()
    }

    /// Look up one line of the last published aggregate
    #[must_use]
    pub fn line(&self, id: &str) -> Option<LineRecord> {
        self.current
            .load()
            .as_ref()
            .and_then(|aggregate| aggregate.line(id).cloned())
    }

    /// Whether the most recent cycle succeeded
    #[must_use]
    pub fn last_update_success(&self) -> bool {
        self.last_update_success.load(Ordering::Acquire)
    }

    /// Receive a new version number after every publish
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    fn publish(&self, aggregate: Arc<AggregateResult>) {
        self.current.store(Some(aggregate));
        self.last_update_success.store(true, Ordering::Release);
        self.notify.send_modify(|version| *version += 1);
    }

    fn mark_failed(&self) {
        self.last_update_success.store(false, Ordering::Release);
    }
}

/// Shortest period accepted by [`RefreshCoordinator::run`]
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Drives refresh cycles over a fixed list of stops
#[derive(Debug)]
pub struct RefreshCoordinator<F> {
    fetcher: F,
    stop_ids: Vec<String>,
    interval: Duration,
    failure_threshold: u32,
    consecutive_failures: u32,
    last_success: Option<Arc<AggregateResult>>,
    published: PublishedLines,
}

impl<F: StopFetcher> RefreshCoordinator<F> {
    /// Create a coordinator in the no-data state
    ///
    /// Intervals shorter than [`MIN_REFRESH_INTERVAL`] are raised to it.
    #[must_use]
    pub fn new(
        fetcher: F,
        stop_ids: Vec<String>,
        interval: Duration,
        failure_threshold: u32,
    ) -> Self {
        if interval < MIN_REFRESH_INTERVAL {
            warn!(
                requested_ms = interval.as_millis(),
                "Refresh interval too short, using the minimum"
            );
        }
        Self {
            fetcher,
            stop_ids,
            interval: interval.max(MIN_REFRESH_INTERVAL),
            failure_threshold,
            consecutive_failures: 0,
            last_success: None,
            published: PublishedLines::new(),
        }
    }

    /// Handle for consumers of published results
    #[must_use]
    pub fn published(&self) -> PublishedLines {
        self.published.clone()
    }

    /// Empty cycles since the last successful one
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Run one refresh cycle
    ///
    /// # Errors
    ///
    /// Returns [`TransitError::NoDataAvailable`] when no stop yielded data and
    /// there is no previous result that may still be served.
    #[instrument(skip(self), fields(stops = self.stop_ids.len()))]
    pub async fn refresh(&mut self) -> Result<Arc<AggregateResult>, TransitError> {
        let mut lines = Vec::new();

        for stop_id in &self.stop_ids {
            match self.fetcher.fetch(stop_id).await {
                Ok(payload) => {
                    debug!(stop_id = %stop_id, routes = payload.len(), "Stop fetched");
                    lines.extend(normalize_stop(stop_id, &payload.routes));
                },
                Err(e) => {
                    warn!(stop_id = %stop_id, error = %e, "Skipping stop for this cycle");
                },
            }
        }

        if !lines.is_empty() {
            let aggregate = Arc::new(AggregateResult { lines });
            self.consecutive_failures = 0;
            self.last_success = Some(Arc::clone(&aggregate));
            self.published.publish(Arc::clone(&aggregate));
            info!(lines = aggregate.lines.len(), "Refresh complete");
            return Ok(aggregate);
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        match &self.last_success {
            Some(previous) if self.consecutive_failures < self.failure_threshold => {
                warn!(
                    consecutive_failures = self.consecutive_failures,
                    failure_threshold = self.failure_threshold,
                    "No data this cycle, serving last good result"
                );
                let previous = Arc::clone(previous);
                self.published.publish(Arc::clone(&previous));
                return Ok(previous);
            },
            _ => {},
        }

        self.published.mark_failed();
        Err(TransitError::NoDataAvailable {
            consecutive_failures: self.consecutive_failures,
        })
    }

    /// Startup refresh with fresh credentials
    ///
    /// # Errors
    ///
    /// Propagates the cycle's error; the caller should abort setup.
    pub async fn first_refresh(&mut self) -> Result<Arc<AggregateResult>, TransitError> {
        self.fetcher.reset_session();
        self.refresh().await
    }

    /// Refresh on the configured interval until `shutdown` resolves
    ///
    /// The first cycle runs one interval from now, so call
    /// [`first_refresh`](Self::first_refresh) beforehand. Cycles never overlap.
    pub async fn run<S>(mut self, shutdown: S)
    where
        S: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!(interval_secs = self.interval.as_secs(), "Refresh loop started");

        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("Refresh loop stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        error!(error = %e, "Refresh cycle failed");
                    }
                }
            }
        }
    }
}
