//! Event handlers and the listener registry.
//!
//! Every registered handler owns a bounded channel drained by its own task.
//! A handler that falls behind fills its channel, which stalls the processor
//! and, through the bounded delta queue, the reflector.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use parking_lot::{Mutex, MutexGuard};
use tether_core::{DeltaKind, Resource};
use tether_store::ObjectStore;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Callbacks invoked for cache transitions. Called from the listener's own task,
/// one notification at a time, in processor order.
pub trait EventHandler<K>: Send + Sync + 'static {
    fn on_add(&self, obj: &Arc<K>);
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>);
    fn on_delete(&self, obj: &Arc<K>);
    /// Periodic re-delivery of an unchanged object. Defaults to `on_update(obj, obj)`.
    fn on_sync(&self, obj: &Arc<K>) { self.on_update(obj, obj) }
}

type AddFn<K> = Box<dyn Fn(&Arc<K>) + Send + Sync>;
type UpdateFn<K> = Box<dyn Fn(&Arc<K>, &Arc<K>) + Send + Sync>;

/// Closure-based handler; unset callbacks are no-ops.
pub struct HandlerFns<K> {
    add: Option<AddFn<K>>,
    update: Option<UpdateFn<K>>,
    delete: Option<AddFn<K>>,
}

impl<K> Default for HandlerFns<K> {
    fn default() -> Self { Self { add: None, update: None, delete: None } }
}

impl<K> HandlerFns<K> {
    pub fn new() -> Self { Self::default() }
    pub fn on_add(mut self, f: impl Fn(&Arc<K>) + Send + Sync + 'static) -> Self {
        self.add = Some(Box::new(f));
        self
    }
    pub fn on_update(mut self, f: impl Fn(&Arc<K>, &Arc<K>) + Send + Sync + 'static) -> Self {
        self.update = Some(Box::new(f));
        self
    }
    pub fn on_delete(mut self, f: impl Fn(&Arc<K>) + Send + Sync + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }
}

impl<K: Send + Sync + 'static> EventHandler<K> for HandlerFns<K> {
    fn on_add(&self, obj: &Arc<K>) {
        if let Some(f) = &self.add { f(obj) }
    }
    fn on_update(&self, old: &Arc<K>, new: &Arc<K>) {
        if let Some(f) = &self.update { f(old, new) }
    }
    fn on_delete(&self, obj: &Arc<K>) {
        if let Some(f) = &self.delete { f(obj) }
    }
}

/// One cache transition as delivered to listeners.
#[derive(Debug)]
pub enum Notification<K> {
    Add(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
    Sync(Arc<K>),
}

impl<K> Clone for Notification<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Add(o) => Self::Add(Arc::clone(o)),
            Self::Update { old, new } => Self::Update { old: Arc::clone(old), new: Arc::clone(new) },
            Self::Delete(o) => Self::Delete(Arc::clone(o)),
            Self::Sync(o) => Self::Sync(Arc::clone(o)),
        }
    }
}

impl<K: 'static> Notification<K> {
    pub fn kind(&self) -> DeltaKind {
        match self {
            Self::Add(_) => DeltaKind::Added,
            Self::Update { .. } => DeltaKind::Updated,
            Self::Delete(_) => DeltaKind::Deleted,
            Self::Sync(_) => DeltaKind::Sync,
        }
    }

    pub fn dispatch(&self, handler: &dyn EventHandler<K>) {
        match self {
            Self::Add(o) => handler.on_add(o),
            Self::Update { old, new } => handler.on_update(old, new),
            Self::Delete(o) => handler.on_delete(o),
            Self::Sync(o) => handler.on_sync(o),
        }
    }
}

/// Handle returned by registration; pass it back to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerRegistration {
    id: u64,
}

impl HandlerRegistration {
    pub fn id(&self) -> u64 { self.id }
}

pub(crate) struct Slot<K> {
    id: u64,
    tx: mpsc::Sender<Notification<K>>,
    cancel: CancellationToken,
}

pub(crate) struct Listeners<K> {
    // held by the processor across store apply + fan-out snapshot and by registration
    // across store snapshot + insert, so a new listener sees each transition exactly once
    gate: Mutex<()>,
    slots: ArcSwap<Vec<Arc<Slot<K>>>>,
    next_id: AtomicU64,
    buffer: usize,
}

/// Listeners that were registered when a batch of transitions was applied.
pub(crate) struct Fanout<K> {
    slots: Arc<Vec<Arc<Slot<K>>>>,
}

impl<K: Resource> Fanout<K> {
    /// Deliver `batch` in order, waiting for room in each listener's buffer.
    /// Returns `false` if `cancel` fired first.
    pub(crate) async fn send(&self, batch: Vec<Notification<K>>, cancel: &CancellationToken) -> bool {
        for n in batch {
            for slot in self.slots.iter() {
                let sent = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return false,
                    res = slot.tx.send(n.clone()) => res,
                };
                // a closed channel means the listener was removed
                if sent.is_err() { trace!(listener = slot.id, "listener gone; skipping"); }
            }
        }
        true
    }
}

impl<K: Resource> Listeners<K> {
    pub(crate) fn new(buffer: usize) -> Self {
        Self {
            gate: Mutex::new(()),
            slots: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU64::new(0),
            buffer: buffer.max(1),
        }
    }

    pub(crate) fn gate(&self) -> MutexGuard<'_, ()> { self.gate.lock() }

    pub(crate) fn len(&self) -> usize { self.slots.load().len() }

    /// Register `handler`, priming it with a synthetic Add for every object in `store`.
    /// The primer is handed to the listener task directly, so it never waits on the
    /// buffer. Must run inside a tokio runtime.
    pub(crate) fn register(
        &self,
        handler: Arc<dyn EventHandler<K>>,
        store: &ObjectStore<K>,
        parent: &CancellationToken,
    ) -> HandlerRegistration {
        let _gate = self.gate.lock();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(self.buffer);
        let primer = store.list();
        let primed = primer.len();
        let cancel = parent.child_token();
        tokio::spawn(run_listener(id, handler, primer, rx, cancel.clone()));

        let mut next = Vec::clone(&self.slots.load());
        next.push(Arc::new(Slot { id, tx, cancel }));
        self.slots.store(Arc::new(next));
        gauge!("tether_listeners", self.len() as f64);
        debug!(listener = id, primed, "event handler registered");
        HandlerRegistration { id }
    }

    pub(crate) fn remove(&self, reg: HandlerRegistration) -> bool {
        let _gate = self.gate.lock();
        let current = self.slots.load();
        let Some(slot) = current.iter().find(|s| s.id == reg.id) else { return false };
        slot.cancel.cancel();
        let next: Vec<_> = current.iter().filter(|s| s.id != reg.id).cloned().collect();
        self.slots.store(Arc::new(next));
        gauge!("tether_listeners", self.len() as f64);
        debug!(listener = reg.id, "event handler removed");
        true
    }

    /// Current listener set. Callers hold the gate, then send after releasing it.
    pub(crate) fn fanout(&self) -> Fanout<K> { Fanout { slots: self.slots.load_full() } }
}

fn deliver<K: Resource>(id: u64, handler: &dyn EventHandler<K>, n: &Notification<K>) {
    if catch_unwind(AssertUnwindSafe(|| n.dispatch(handler))).is_err() {
        counter!("tether_listener_panics_total", 1u64);
        error!(listener = id, kind = ?n.kind(), "event handler panicked; continuing with next notification");
    }
}

async fn run_listener<K: Resource>(
    id: u64,
    handler: Arc<dyn EventHandler<K>>,
    primer: Vec<Arc<K>>,
    mut rx: mpsc::Receiver<Notification<K>>,
    cancel: CancellationToken,
) {
    for obj in primer {
        if cancel.is_cancelled() { return; }
        deliver(id, handler.as_ref(), &Notification::Add(obj));
    }
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            n = rx.recv() => match n { Some(n) => n, None => break },
        };
        deliver(id, handler.as_ref(), &n);
    }
    debug!(listener = id, "listener stopped");
}
