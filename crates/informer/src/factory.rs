//! Informer factory: one config, one start, one sync wait for a set of informers.

use std::any::{type_name, Any, TypeId};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tether_core::{ListWatch, Resource};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{InformerConfig, InformerError, SharedInformer};

/// Type-erased view of a member informer.
trait Member: Send + Sync {
    fn start(&self, stop: &CancellationToken) -> Result<(), InformerError>;
    fn synced(&self) -> watch::Receiver<bool>;
    fn stopped(&self) -> CancellationToken;
    fn stop(&self);
    fn kind(&self) -> &'static str;
}

impl<K: Resource> Member for SharedInformer<K> {
    fn start(&self, stop: &CancellationToken) -> Result<(), InformerError> { SharedInformer::start(self, stop) }
    fn synced(&self) -> watch::Receiver<bool> { self.synced.subscribe() }
    fn stopped(&self) -> CancellationToken { self.shutdown.clone() }
    fn stop(&self) { SharedInformer::stop(self) }
    fn kind(&self) -> &'static str { type_name::<K>() }
}

struct Registered {
    any: Arc<dyn Any + Send + Sync>,
    member: Arc<dyn Member>,
    started: bool,
}

/// Hands out one [`SharedInformer`] per object type, all built from the same
/// [`InformerConfig`] (and so the same default resync period).
pub struct InformerFactory {
    config: InformerConfig,
    informers: Mutex<FxHashMap<TypeId, Registered>>,
    order: Mutex<Vec<TypeId>>,
}

impl Default for InformerFactory {
    fn default() -> Self { Self::new(InformerConfig::default()) }
}

impl InformerFactory {
    pub fn new(config: InformerConfig) -> Self {
        Self { config, informers: Mutex::new(FxHashMap::default()), order: Mutex::new(Vec::new()) }
    }

    pub fn config(&self) -> &InformerConfig { &self.config }

    /// Informer for `K`. The first call builds it from `source`; later calls return
    /// the same informer and drop their `source`.
    pub fn informer<K, L>(&self, source: L) -> Arc<SharedInformer<K>>
    where
        K: Resource,
        L: ListWatch<K>,
    {
        let id = TypeId::of::<K>();
        let mut informers = self.informers.lock();
        if let Some(existing) = informers.get(&id) {
            if let Ok(shared) = Arc::clone(&existing.any).downcast::<SharedInformer<K>>() {
                return shared;
            }
        }
        let informer = Arc::new(SharedInformer::new(source, self.config.clone()));
        informers.insert(
            id,
            Registered {
                any: Arc::clone(&informer) as Arc<dyn Any + Send + Sync>,
                member: Arc::clone(&informer) as Arc<dyn Member>,
                started: false,
            },
        );
        self.order.lock().push(id);
        debug!(kind = type_name::<K>(), "informer registered with factory");
        informer
    }

    pub fn len(&self) -> usize { self.informers.lock().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Start every informer not started yet. Safe to call again after adding more.
    pub fn start(&self, stop: &CancellationToken) -> Result<(), InformerError> {
        let order = self.order.lock().clone();
        let mut informers = self.informers.lock();
        let mut started = 0usize;
        for id in order {
            let Some(reg) = informers.get_mut(&id) else { continue };
            if reg.started { continue; }
            reg.member.start(stop)?;
            reg.started = true;
            started += 1;
        }
        info!(started, total = informers.len(), "factory started informers");
        Ok(())
    }

    /// Wait until every registered informer has synced. Returns `false` if `stop`
    /// fires, or any informer stops, first.
    pub async fn wait_for_cache_sync(&self, stop: &CancellationToken) -> bool {
        let members: Vec<Arc<dyn Member>> = {
            let order = self.order.lock().clone();
            let informers = self.informers.lock();
            order.iter().filter_map(|id| informers.get(id).map(|r| Arc::clone(&r.member))).collect()
        };
        for m in members {
            let mut rx = m.synced();
            let stopped = m.stopped();
            let synced = tokio::select! {
                biased;
                synced = async { rx.wait_for(|synced| *synced).await.is_ok() } => synced,
                _ = stop.cancelled() => false,
                _ = stopped.cancelled() => false,
            };
            if !synced {
                debug!(kind = m.kind(), "cache sync abandoned");
                return false;
            }
        }
        true
    }

    /// Stop every informer handed out so far.
    pub fn stop(&self) {
        for reg in self.informers.lock().values() { reg.member.stop(); }
    }
}
