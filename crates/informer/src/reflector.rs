//! List/watch driver feeding the delta queue.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use tether_core::{Delta, ListWatch, Resource, SourceError};
use tether_store::{DeltaQueue, StoreError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::config::BackoffConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReflectorState {
    Idle,
    Listing,
    Watching,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Degraded { consecutive_failures: u32 },
}

/// Observable reflector progress, shared with the informer façade.
pub(crate) struct Status {
    pub(crate) state: watch::Sender<ReflectorState>,
    pub(crate) health: watch::Sender<Health>,
    pub(crate) last_rv: Mutex<Option<String>>,
}

impl Status {
    pub(crate) fn new() -> Self {
        Self {
            state: watch::channel(ReflectorState::Idle).0,
            health: watch::channel(Health::Healthy).0,
            last_rv: Mutex::new(None),
        }
    }
}

enum Listed {
    Done(String),
    Failed(SourceError),
    Cancelled,
}

enum WatchEnd {
    Closed,
    Expired,
    Failed(SourceError),
    Cancelled,
}

pub(crate) struct Reflector<K: Resource> {
    pub(crate) source: Arc<dyn ListWatch<K>>,
    pub(crate) queue: DeltaQueue<K>,
    pub(crate) backoff: BackoffConfig,
    pub(crate) status: Arc<Status>,
}

impl<K: Resource> Reflector<K> {
    pub(crate) async fn run(self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(&self.backoff);
        // paces relists when watches keep ending right after they open
        let mut relist = Backoff::new(&self.backoff);
        let mut quick_ends: u32 = 0;
        let mut failures: u32 = 0;
        loop {
            self.status.state.send_replace(ReflectorState::Listing);
            let rv = match self.list_and_replace(&cancel).await {
                Listed::Done(rv) => {
                    failures = 0;
                    backoff.reset();
                    self.status.health.send_replace(Health::Healthy);
                    rv
                }
                Listed::Cancelled => break,
                Listed::Failed(err) => {
                    self.record_failure(&mut failures, "list", &err);
                    if !sleep_or_cancel(backoff.next_delay(), &cancel).await { break; }
                    continue;
                }
            };

            self.status.state.send_replace(ReflectorState::Watching);
            let opened = tokio::time::Instant::now();
            match self.watch(rv, &cancel).await {
                WatchEnd::Cancelled => break,
                end @ (WatchEnd::Closed | WatchEnd::Expired) => {
                    counter!("tether_watch_restarts_total", 1u64);
                    if matches!(end, WatchEnd::Expired) {
                        info!("watch position expired; relisting");
                    } else {
                        debug!("watch stream ended; relisting");
                    }
                    if opened.elapsed() < self.backoff.initial() {
                        quick_ends = quick_ends.saturating_add(1);
                    } else {
                        quick_ends = 0;
                        relist.reset();
                    }
                    if quick_ends > 1 {
                        let delay = relist.next_delay();
                        debug!(quick_ends, delay_ms = delay.as_millis() as u64, "watch keeps ending early; delaying relist");
                        if !sleep_or_cancel(delay, &cancel).await { break; }
                    }
                }
                WatchEnd::Failed(err) => {
                    counter!("tether_watch_restarts_total", 1u64);
                    self.record_failure(&mut failures, "watch", &err);
                    if !sleep_or_cancel(backoff.next_delay(), &cancel).await { break; }
                }
            }
        }
        self.status.state.send_replace(ReflectorState::Stopped);
        info!("reflector stopped");
    }

    async fn list_and_replace(&self, cancel: &CancellationToken) -> Listed {
        let t0 = Instant::now();
        let page = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Listed::Cancelled,
            res = self.source.list() => match res { Ok(p) => p, Err(e) => return Listed::Failed(e) },
        };
        histogram!("tether_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("tether_relist_total", 1u64);

        let rv = page.resource_version;
        let listed = page.items.len();
        let objects = page.items.into_iter().map(Arc::new).collect();
        let replaced = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Listed::Cancelled,
            res = self.queue.replace(objects, rv.clone()) => res,
        };
        match replaced {
            Ok(s) => info!(resource_version = %rv, listed, added = s.added, updated = s.updated, deleted = s.deleted, "list applied"),
            Err(e) => {
                debug!(error = %e, "queue refused relist");
                return Listed::Cancelled;
            }
        }
        *self.status.last_rv.lock() = Some(rv.clone());
        Listed::Done(rv)
    }

    async fn watch(&self, mut rv: String, cancel: &CancellationToken) -> WatchEnd {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return WatchEnd::Cancelled,
            res = self.source.watch(&rv) => res,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) if e.is_expired() => return WatchEnd::Expired,
            Err(e) => return WatchEnd::Failed(e),
        };
        debug!(resource_version = %rv, "watch opened");

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WatchEnd::Cancelled,
                ev = stream.next() => ev,
            };
            let event = match next {
                None => return WatchEnd::Closed,
                Some(Err(e)) if e.is_expired() => return WatchEnd::Expired,
                Some(Err(e)) => return WatchEnd::Failed(e),
                Some(Ok(ev)) => ev,
            };
            if !event.resource_version().is_empty() {
                rv = event.resource_version().to_string();
                *self.status.last_rv.lock() = Some(rv.clone());
            }
            if let Some((kind, object)) = event.into_change() {
                let pushed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return WatchEnd::Cancelled,
                    res = self.queue.push(Delta::new(kind, Arc::new(object))) => res,
                };
                match pushed {
                    Ok(()) => {}
                    Err(StoreError::Key(e)) => {
                        counter!("tether_malformed_total", 1u64);
                        warn!(error = %e, ?kind, "dropping watch event without identity");
                    }
                    Err(_) => return WatchEnd::Cancelled,
                }
            }
        }
    }

    fn record_failure(&self, failures: &mut u32, phase: &'static str, err: &SourceError) {
        *failures = failures.saturating_add(1);
        counter!("tether_source_errors_total", 1u64, "phase" => phase);
        warn!(phase, error = %err, consecutive_failures = *failures, "source call failed; backing off");
        if let Some(limit) = self.backoff.degraded_after {
            if *failures >= limit {
                let next = Health::Degraded { consecutive_failures: *failures };
                if *self.status.health.borrow() == Health::Healthy {
                    warn!(consecutive_failures = *failures, "informer degraded");
                }
                self.status.health.send_replace(next);
            }
        }
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Periodically asks the queue to re-deliver every stored object as Sync.
pub(crate) async fn resync_loop<K: Resource>(queue: DeltaQueue<K>, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let queued = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            res = queue.resync() => res,
        };
        match queued {
            Ok(n) => {
                counter!("tether_resync_total", 1u64);
                debug!(queued = n, "resync");
            }
            Err(_) => break,
        }
    }
    debug!("resync loop stopped");
}
