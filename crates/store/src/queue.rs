//! Delta queue: per-identity compressing FIFO between the reflector and the processor.

use std::collections::VecDeque;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};
use tether_core::{Delta, DeltaKind, ObjectKey, Resource};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::{ObjectStore, StoreError};

/// Pending deltas for one identity. Holds at most two deltas: `[Deleted, Added]`
/// when an object was removed and recreated before the consumer caught up.
pub type Deltas<K> = SmallVec<[Delta<K>; 2]>;

#[derive(Debug)]
pub struct Entry<K> {
    pub key: ObjectKey,
    pub deltas: Deltas<K>,
}

/// Marker that follows the deltas of a relist.
#[derive(Debug)]
pub struct Replaced<K> {
    pub objects: Vec<Arc<K>>,
    pub resource_version: String,
    /// Identities that received newer deltas folded into entries ahead of this marker;
    /// their listed state is already outdated.
    pub superseded: FxHashSet<ObjectKey>,
}

#[derive(Debug)]
pub enum QueueItem<K> {
    Entry(Entry<K>),
    Replaced(Replaced<K>),
}

/// Deltas emitted by a relist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
}

enum Slot {
    Key(ObjectKey, u64),
    Barrier(u64),
}

struct Pending<K> {
    seq: u64,
    deltas: Deltas<K>,
}

struct Barrier<K> {
    seq: u64,
    objects: Vec<Arc<K>>,
    resource_version: String,
    superseded: FxHashSet<ObjectKey>,
}

struct State<K> {
    entries: FxHashMap<ObjectKey, Pending<K>>,
    order: VecDeque<Slot>,
    barriers: VecDeque<Barrier<K>>,
    // identity popped by the consumer and not yet applied to `known`
    in_flight: Option<ObjectKey>,
    seq: u64,
    closed: bool,
}

struct Shared<K> {
    state: Mutex<State<K>>,
    not_empty: Notify,
    not_full: Notify,
    capacity: usize,
    known: ObjectStore<K>,
}

/// Ordered, deduplicating queue consumed by a single processing loop.
///
/// Entries pop in order of first push per identity; later pushes for a pending identity
/// are folded into its entry. Capacity bounds the number of pending identities, and
/// `push` waits for room rather than dropping anything.
pub struct DeltaQueue<K> {
    shared: Arc<Shared<K>>,
}

impl<K> Clone for DeltaQueue<K> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

enum Fold {
    Kept,
    Dropped,
}

impl<K: Resource> DeltaQueue<K> {
    /// `known` is the store the consumer applies to; it decides whether an Added+Deleted
    /// pair can vanish and what a relist has to delete.
    pub fn new(capacity: usize, known: ObjectStore<K>) -> Self {
        let state = State {
            entries: FxHashMap::default(),
            order: VecDeque::new(),
            barriers: VecDeque::new(),
            in_flight: None,
            seq: 0,
            closed: false,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                not_empty: Notify::new(),
                not_full: Notify::new(),
                capacity: capacity.max(1),
                known,
            }),
        }
    }

    pub fn len(&self) -> usize { self.shared.state.lock().entries.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub fn capacity(&self) -> usize { self.shared.capacity }
    pub fn is_closed(&self) -> bool { self.shared.state.lock().closed }

    /// Pending delta kinds for `key`, oldest first.
    pub fn pending(&self, key: &ObjectKey) -> Vec<DeltaKind> {
        self.shared.state.lock().entries.get(key).map(|p| p.deltas.iter().map(|d| d.kind).collect()).unwrap_or_default()
    }

    /// Enqueue a delta, folding it into a pending entry for the same identity.
    /// Waits while the queue is full and the identity is not already pending.
    pub async fn push(&self, delta: Delta<K>) -> Result<(), StoreError> {
        let key = delta.object.key()?;
        loop {
            let mut notified = std::pin::pin!(self.shared.not_full.notified());
            notified.as_mut().enable();
            {
                let mut st = self.shared.state.lock();
                if st.closed { return Err(StoreError::Closed); }
                if st.entries.contains_key(&key) || st.entries.len() < self.shared.capacity {
                    self.fold(&mut st, key, delta);
                    return Ok(());
                }
            }
            trace!(key = %key, "queue full; waiting");
            notified.await;
        }
    }

    /// Wait for the next item. Returns `None` once the queue is closed.
    ///
    /// A popped entry counts as existing for compression until the consumer calls
    /// [`DeltaQueue::done`] or pops again.
    pub async fn pop(&self) -> Option<QueueItem<K>> {
        self.done();
        loop {
            let mut notified = std::pin::pin!(self.shared.not_empty.notified());
            notified.as_mut().enable();
            {
                let mut st = self.shared.state.lock();
                if st.closed { return None; }
                if let Some(item) = Self::take_front(&mut st) {
                    gauge!("tether_queue_depth", st.entries.len() as f64);
                    drop(st);
                    self.shared.not_full.notify_waiters();
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// The last popped entry has been applied to the store.
    pub fn done(&self) { self.shared.state.lock().in_flight = None; }

    /// Diff a fresh listing against the known state (store plus pending entries),
    /// enqueue the resulting deltas, then a [`Replaced`] marker carrying the listing.
    pub async fn replace(&self, listed: Vec<Arc<K>>, resource_version: String) -> Result<ReplaceSummary, StoreError> {
        let mut objects = Vec::with_capacity(listed.len());
        let mut keyed = Vec::with_capacity(listed.len());
        for obj in listed {
            match obj.key() {
                Ok(key) => {
                    keyed.push((key, Arc::clone(&obj)));
                    objects.push(obj);
                }
                Err(e) => {
                    counter!("tether_malformed_total", 1u64);
                    warn!(error = %e, "relist: dropping object without identity");
                }
            }
        }

        let mut summary = ReplaceSummary::default();
        let deltas = {
            let st = self.shared.state.lock();
            if st.closed { return Err(StoreError::Closed); }
            let mut out = Vec::new();
            let mut seen = FxHashSet::default();
            for (key, obj) in keyed {
                match self.known_object(&st, &key) {
                    None => {
                        summary.added += 1;
                        out.push(Delta::added(obj));
                    }
                    Some(prev) => {
                        let changed = match (prev.version(), obj.version()) {
                            (Some(a), Some(b)) => a != b,
                            _ => true,
                        };
                        if changed {
                            summary.updated += 1;
                            out.push(Delta::updated(obj));
                        }
                    }
                }
                seen.insert(key);
            }
            let mut known_keys: Vec<ObjectKey> = self.shared.known.keys();
            known_keys.extend(st.entries.keys().cloned());
            known_keys.sort_unstable();
            known_keys.dedup();
            for key in known_keys.into_iter().filter(|k| !seen.contains(k)) {
                if let Some(prev) = self.known_object(&st, &key) {
                    summary.deleted += 1;
                    out.push(Delta::deleted(prev));
                }
            }
            out
        };

        for d in deltas { self.push(d).await?; }

        let mut st = self.shared.state.lock();
        if st.closed { return Err(StoreError::Closed); }
        st.seq += 1;
        let seq = st.seq;
        st.barriers.push_back(Barrier { seq, objects, resource_version, superseded: FxHashSet::default() });
        st.order.push_back(Slot::Barrier(seq));
        drop(st);
        self.shared.not_empty.notify_waiters();
        debug!(added = summary.added, updated = summary.updated, deleted = summary.deleted, "relist enqueued");
        Ok(summary)
    }

    /// Enqueue a Sync delta for every stored object without a pending entry.
    pub async fn resync(&self) -> Result<usize, StoreError> {
        let mut queued = 0usize;
        for obj in self.shared.known.list() {
            let key = obj.key()?;
            if !self.pending(&key).is_empty() { continue; }
            self.push(Delta::sync(obj)).await?;
            queued += 1;
        }
        Ok(queued)
    }

    /// Close the queue: blocked producers get `Closed`, the consumer gets `None`.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.not_empty.notify_waiters();
        self.shared.not_full.notify_waiters();
    }

    /// Latest state of `key` as the consumer will see it after draining.
    fn known_object(&self, st: &State<K>, key: &ObjectKey) -> Option<Arc<K>> {
        match st.entries.get(key).and_then(|p| p.deltas.last()) {
            Some(d) if d.kind == DeltaKind::Deleted => None,
            Some(d) => Some(Arc::clone(&d.object)),
            None => self.shared.known.get(key),
        }
    }

    fn take_front(st: &mut State<K>) -> Option<QueueItem<K>> {
        while let Some(slot) = st.order.pop_front() {
            match slot {
                Slot::Key(key, seq) => {
                    if st.entries.get(&key).map(|p| p.seq) != Some(seq) { continue; }
                    if let Some(p) = st.entries.remove(&key) {
                        st.in_flight = Some(key.clone());
                        return Some(QueueItem::Entry(Entry { key, deltas: p.deltas }));
                    }
                }
                Slot::Barrier(seq) => {
                    let Some(b) = st.barriers.pop_front() else { continue };
                    debug_assert_eq!(b.seq, seq);
                    return Some(QueueItem::Replaced(Replaced {
                        objects: b.objects,
                        resource_version: b.resource_version,
                        superseded: b.superseded,
                    }));
                }
            }
        }
        None
    }

    fn fold(&self, st: &mut State<K>, key: ObjectKey, delta: Delta<K>) {
        counter!("tether_queue_pushed_total", 1u64);
        let State { entries, order, barriers, in_flight, seq, .. } = st;
        let Some(pending) = entries.get_mut(&key) else {
            *seq += 1;
            entries.insert(key.clone(), Pending { seq: *seq, deltas: smallvec![delta] });
            order.push_back(Slot::Key(key, *seq));
            gauge!("tether_queue_depth", entries.len() as f64);
            self.shared.not_empty.notify_waiters();
            return;
        };
        // a Sync only ever fills an otherwise idle identity
        if delta.kind == DeltaKind::Sync { return; }

        for b in barriers.iter_mut().filter(|b| b.seq > pending.seq) {
            b.superseded.insert(key.clone());
        }
        counter!("tether_queue_compressed_total", 1u64);
        let exists = in_flight.as_ref() == Some(&key) || self.shared.known.contains(&key);
        if let Fold::Dropped = fold_tail(&mut pending.deltas, delta, exists) {
            entries.remove(&key);
            counter!("tether_queue_dropped_total", 1u64);
            trace!(key = %key, "added then deleted before delivery; dropped");
            gauge!("tether_queue_depth", entries.len() as f64);
            self.shared.not_full.notify_waiters();
        }
    }
}

/// Compression rules, applied against the newest pending delta.
fn fold_tail<K>(deltas: &mut Deltas<K>, new: Delta<K>, exists_in_store: bool) -> Fold {
    let Some(tail) = deltas.last_mut() else {
        deltas.push(new);
        return Fold::Kept;
    };
    match (tail.kind, new.kind) {
        (DeltaKind::Sync, _) => *tail = new,
        (DeltaKind::Added, DeltaKind::Added | DeltaKind::Updated) => tail.object = new.object,
        (DeltaKind::Added, DeltaKind::Deleted) => {
            deltas.pop();
            if deltas.is_empty() {
                if !exists_in_store { return Fold::Dropped; }
                deltas.push(new);
            }
        }
        (DeltaKind::Updated, DeltaKind::Added | DeltaKind::Updated) => tail.object = new.object,
        (DeltaKind::Updated | DeltaKind::Deleted, DeltaKind::Deleted) => *tail = new,
        (DeltaKind::Deleted, DeltaKind::Added | DeltaKind::Updated) => deltas.push(Delta::added(new.object)),
        (_, DeltaKind::Sync) => {}
    }
    Fold::Kept
}
