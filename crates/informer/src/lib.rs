//! Tether informer: keeps a local cache of a remote collection in sync through
//! list + watch, and fans cache transitions out to registered handlers.
//!
//! ```text
//! ListWatch ─► Reflector ─► DeltaQueue ─► Processor ─► ObjectStore
//!                                              └─────► listeners (one task each)
//! ```

#![forbid(unsafe_code)]

mod backoff;
mod config;
mod factory;
mod listener;
mod processor;
mod reflector;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tether_store::{DeltaQueue, Indexers, ObjectStore, StoreError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub use backoff::Backoff;
pub use config::{BackoffConfig, InformerConfig};
pub use factory::InformerFactory;
pub use listener::{EventHandler, HandlerFns, HandlerRegistration, Notification};
pub use reflector::{Health, ReflectorState};
pub use tether_core::{
    Delta, DeltaKind, KeyError, ListPage, ListWatch, ObjectKey, Resource, SourceError, Version, WatchEvent, WatchStream,
};
pub use tether_store::{Lister, NamespaceLister, NAMESPACE_INDEX};

use listener::Listeners;
use processor::Processor;
use reflector::{Reflector, Status};

#[derive(Debug, thiserror::Error)]
pub enum InformerError {
    #[error("informer already started")]
    AlreadyStarted,
    #[error("informer stopped")]
    Stopped,
    #[error("no tokio runtime in the calling context")]
    NoRuntime,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Builder for informers that need extra indexers.
pub struct InformerBuilder<K: Resource> {
    source: Arc<dyn ListWatch<K>>,
    config: InformerConfig,
    indexers: Indexers<K>,
}

impl<K: Resource> InformerBuilder<K> {
    pub fn config(mut self, config: InformerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a secondary index. `f` maps an object to its index values.
    pub fn indexer<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ObjectKey, &K) -> Vec<String> + Send + Sync + 'static,
    {
        self.indexers = self.indexers.add(name, f);
        self
    }

    pub fn build(self) -> SharedInformer<K> { SharedInformer::assemble(self.source, self.config, self.indexers) }
}

/// One list/watch session shared by any number of handlers. Dropping it stops the tasks.
pub struct SharedInformer<K: Resource> {
    source: Arc<dyn ListWatch<K>>,
    config: InformerConfig,
    store: ObjectStore<K>,
    queue: DeltaQueue<K>,
    listeners: Arc<Listeners<K>>,
    synced: watch::Sender<bool>,
    status: Arc<Status>,
    shutdown: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<K: Resource> SharedInformer<K> {
    pub fn new<L: ListWatch<K>>(source: L, config: InformerConfig) -> Self {
        Self::assemble(Arc::new(source), config, Indexers::with_namespace())
    }

    pub fn builder<L: ListWatch<K>>(source: L) -> InformerBuilder<K> {
        InformerBuilder { source: Arc::new(source), config: InformerConfig::default(), indexers: Indexers::with_namespace() }
    }

    fn assemble(source: Arc<dyn ListWatch<K>>, config: InformerConfig, indexers: Indexers<K>) -> Self {
        let store = ObjectStore::with_indexers(indexers);
        let queue = DeltaQueue::new(config.queue_capacity, store.clone());
        let listeners = Arc::new(Listeners::new(config.listener_buffer));
        Self {
            source,
            config,
            store,
            queue,
            listeners,
            synced: watch::channel(false).0,
            status: Arc::new(Status::new()),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the reflector, processor and resync tasks. Cancelling `stop` stops the informer.
    pub fn start(&self, stop: &CancellationToken) -> Result<(), InformerError> {
        if self.shutdown.is_cancelled() { return Err(InformerError::Stopped); }
        tokio::runtime::Handle::try_current().map_err(|_| InformerError::NoRuntime)?;
        if self.started.swap(true, Ordering::SeqCst) { return Err(InformerError::AlreadyStarted); }

        let mut tasks = self.tasks.lock();
        let reflector = Reflector {
            source: Arc::clone(&self.source),
            queue: self.queue.clone(),
            backoff: self.config.backoff.clone(),
            status: Arc::clone(&self.status),
        };
        tasks.push(tokio::spawn(reflector.run(self.shutdown.clone())));

        let processor = Processor {
            queue: self.queue.clone(),
            store: self.store.clone(),
            listeners: Arc::clone(&self.listeners),
            synced: self.synced.clone(),
        };
        tasks.push(tokio::spawn(processor.run(self.shutdown.clone())));

        if let Some(period) = self.config.resync_period() {
            tasks.push(tokio::spawn(reflector::resync_loop(self.queue.clone(), period, self.shutdown.clone())));
        }

        let (stop, shutdown, queue) = (stop.clone(), self.shutdown.clone(), self.queue.clone());
        tasks.push(tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => halt(&shutdown, &queue),
                _ = shutdown.cancelled() => {}
            }
        }));
        info!(
            resync_secs = self.config.resync_secs,
            queue_capacity = self.config.queue_capacity,
            handlers = self.listeners.len(),
            "informer started"
        );
        Ok(())
    }

    /// Wait until the first listing has been applied to the store. Returns `false`
    /// if `stop` fires (or the informer stops) before that.
    pub async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> bool {
        let mut rx = self.synced.subscribe();
        tokio::select! {
            biased;
            synced = async { rx.wait_for(|synced| *synced).await.is_ok() } => synced,
            _ = stop.cancelled() => false,
            _ = self.shutdown.cancelled() => false,
        }
    }

    pub fn has_synced(&self) -> bool { *self.synced.borrow() }

    /// Register a handler. It first receives an Add for every cached object,
    /// then live notifications. Requires a tokio runtime.
    pub fn add_event_handler<H: EventHandler<K>>(&self, handler: H) -> Result<HandlerRegistration, InformerError> {
        self.add_shared_handler(Arc::new(handler))
    }

    pub fn add_shared_handler(&self, handler: Arc<dyn EventHandler<K>>) -> Result<HandlerRegistration, InformerError> {
        if self.shutdown.is_cancelled() { return Err(InformerError::Stopped); }
        tokio::runtime::Handle::try_current().map_err(|_| InformerError::NoRuntime)?;
        Ok(self.listeners.register(handler, &self.store, &self.shutdown))
    }

    /// Stop delivering to a handler. Returns `false` if it was not registered.
    pub fn remove_event_handler(&self, registration: HandlerRegistration) -> bool { self.listeners.remove(registration) }

    pub fn handler_count(&self) -> usize { self.listeners.len() }

    pub fn lister(&self) -> Lister<K> { Lister::new(self.store.clone()) }

    /// Objects whose index `name` yields `value`.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<Arc<K>>, InformerError> {
        Ok(self.store.by_index(name, value)?)
    }

    /// Fetch by the `namespace/name` form used in logs and CLIs.
    pub fn get_by_key(&self, key: &str) -> Result<Option<Arc<K>>, KeyError> {
        let key: ObjectKey = key.parse()?;
        Ok(self.store.get(&key))
    }

    pub fn health(&self) -> Health { *self.status.health.borrow() }

    pub fn reflector_state(&self) -> ReflectorState { *self.status.state.borrow() }

    /// Watermark of the most recent list or watch event observed.
    pub fn last_sync_resource_version(&self) -> Option<String> { self.status.last_rv.lock().clone() }

    pub fn queue_len(&self) -> usize { self.queue.len() }

    pub fn is_stopped(&self) -> bool { self.shutdown.is_cancelled() }

    /// Stop all tasks. Idempotent; does not wait.
    pub fn stop(&self) { halt(&self.shutdown, &self.queue) }

    /// Stop and wait for every task to finish.
    pub async fn shutdown(&self) {
        self.stop();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for t in tasks {
            let _ = t.await;
        }
        debug!("informer shut down");
    }
}

impl<K: Resource> Drop for SharedInformer<K> {
    fn drop(&mut self) { halt(&self.shutdown, &self.queue) }
}

fn halt<K: Resource>(shutdown: &CancellationToken, queue: &DeltaQueue<K>) {
    if shutdown.is_cancelled() { return; }
    shutdown.cancel();
    queue.close();
    info!("informer stopping");
}
