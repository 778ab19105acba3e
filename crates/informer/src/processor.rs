//! Single consumer of the delta queue: applies deltas to the store and fans out notifications.

use std::sync::Arc;

use metrics::counter;
use tether_core::{Delta, DeltaKind, ObjectKey, Resource};
use tether_store::{DeltaQueue, Entry, ObjectStore, QueueItem, Replaced, Upsert};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::listener::{Fanout, Listeners, Notification};

pub(crate) struct Processor<K: Resource> {
    pub(crate) queue: DeltaQueue<K>,
    pub(crate) store: ObjectStore<K>,
    pub(crate) listeners: Arc<Listeners<K>>,
    pub(crate) synced: watch::Sender<bool>,
}

impl<K: Resource> Processor<K> {
    pub(crate) async fn run(self, cancel: CancellationToken) {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = self.queue.pop() => item,
            };
            let delivered = match item {
                Some(QueueItem::Entry(entry)) => self.apply_entry(entry, &cancel).await,
                Some(QueueItem::Replaced(r)) => self.apply_replaced(r, &cancel).await,
                None => break,
            };
            if !delivered { break; }
        }
        debug!("processor stopped");
    }

    /// Apply under the gate, then wait for listener room outside it.
    async fn apply_entry(&self, entry: Entry<K>, cancel: &CancellationToken) -> bool {
        let Entry { key, deltas } = entry;
        let (batch, fanout) = {
            let _gate = self.listeners.gate();
            let batch: Vec<_> = deltas
                .into_iter()
                .filter_map(|delta| {
                    counter!("tether_deltas_applied_total", 1u64);
                    self.apply(&key, delta)
                })
                .collect();
            (batch, self.listeners.fanout())
        };
        self.queue.done();
        fanout.send(batch, cancel).await
    }

    fn apply(&self, key: &ObjectKey, delta: Delta<K>) -> Option<Notification<K>> {
        match delta.kind {
            DeltaKind::Added | DeltaKind::Updated => match self.store.update(Arc::clone(&delta.object)) {
                Ok(Upsert::Inserted) => Some(Notification::Add(delta.object)),
                Ok(Upsert::Replaced(old)) => Some(Notification::Update { old, new: delta.object }),
                Ok(Upsert::Stale(current)) => {
                    counter!("tether_stale_updates_total", 1u64);
                    debug!(key = %key, stored = ?current.version(), incoming = ?delta.object.version(), "skipping stale delta");
                    None
                }
                Err(e) => {
                    counter!("tether_malformed_total", 1u64);
                    warn!(key = %key, error = %e, "skipping delta without identity");
                    None
                }
            },
            // last known state is what listeners saw; absent identities produce nothing
            DeltaKind::Deleted => self.store.delete(key).map(Notification::Delete),
            DeltaKind::Sync => {
                let current = self.store.get(key);
                if current.is_none() { trace!(key = %key, "sync for absent object skipped"); }
                current.map(Notification::Sync)
            }
        }
    }

    async fn apply_replaced(&self, r: Replaced<K>, cancel: &CancellationToken) -> bool {
        let (batch, fanout) = self.replace_store(r);
        fanout.send(batch, cancel).await
    }

    fn replace_store(&self, r: Replaced<K>) -> (Vec<Notification<K>>, Fanout<K>) {
        let _gate = self.listeners.gate();
        // identities changed after the listing keep their applied state
        let mut target: Vec<Arc<K>> = r
            .objects
            .into_iter()
            .filter(|o| o.key().map(|k| !r.superseded.contains(&k)).unwrap_or(false))
            .collect();
        target.extend(r.superseded.iter().filter_map(|k| self.store.get(k)));

        let out = self.store.replace_all(target);
        if !out.is_noop() {
            info!(
                resource_version = %r.resource_version,
                added = out.added.len(),
                updated = out.updated.len(),
                removed = out.removed.len(),
                "relist corrected cache"
            );
        }
        let mut batch = Vec::with_capacity(out.removed.len() + out.added.len() + out.updated.len());
        batch.extend(out.removed.into_iter().map(Notification::Delete));
        batch.extend(out.added.into_iter().map(Notification::Add));
        batch.extend(out.updated.into_iter().map(|(old, new)| Notification::Update { old, new }));

        if !*self.synced.borrow() {
            self.synced.send_replace(true);
            info!(objects = self.store.len(), resource_version = %r.resource_version, "cache synced");
        }
        (batch, self.listeners.fanout())
    }
}
