//! Keyed object cache with secondary indices.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tether_core::{KeyError, ObjectKey, Resource};
use tracing::{debug, warn};

use crate::StoreError;

/// Name of the index registered by [`Indexers::with_namespace`].
pub const NAMESPACE_INDEX: &str = "namespace";

/// Maps an object to zero or more index values.
pub type IndexFn<K> = Arc<dyn Fn(&ObjectKey, &K) -> Vec<String> + Send + Sync>;

/// Named index functions, fixed at store construction.
pub struct Indexers<K> {
    fns: FxHashMap<String, IndexFn<K>>,
}

impl<K> Default for Indexers<K> {
    fn default() -> Self { Self { fns: FxHashMap::default() } }
}

impl<K: Resource> Indexers<K> {
    pub fn new() -> Self { Self::default() }

    /// Indexers with the built-in `namespace` index.
    pub fn with_namespace() -> Self {
        Self::new().add(NAMESPACE_INDEX, |key: &ObjectKey, _: &K| key.namespace().map(|ns| vec![ns.to_string()]).unwrap_or_default())
    }

    pub fn add<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ObjectKey, &K) -> Vec<String> + Send + Sync + 'static,
    {
        self.fns.insert(name.into(), Arc::new(f));
        self
    }

    pub fn contains(&self, name: &str) -> bool { self.fns.contains_key(name) }
}

/// Outcome of [`ObjectStore::update`].
#[derive(Debug)]
pub enum Upsert<K> {
    Inserted,
    Replaced(Arc<K>),
    /// Incoming version is older than the stored one; store left untouched.
    Stale(Arc<K>),
}

/// Transitions produced by [`ObjectStore::replace_all`].
#[derive(Debug)]
pub struct ReplaceOutcome<K> {
    pub added: Vec<Arc<K>>,
    pub updated: Vec<(Arc<K>, Arc<K>)>,
    pub removed: Vec<Arc<K>>,
}

impl<K> ReplaceOutcome<K> {
    pub fn is_noop(&self) -> bool { self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty() }
}

struct State<K> {
    items: BTreeMap<ObjectKey, Arc<K>>,
    // index name -> index value -> keys
    indices: FxHashMap<String, FxHashMap<String, BTreeSet<ObjectKey>>>,
}

struct Inner<K> {
    state: RwLock<State<K>>,
    indexers: Indexers<K>,
}

/// Thread-safe cache of the latest applied object per identity.
///
/// Writers serialize on one lock; readers share it and always observe a whole write,
/// so `list` is a consistent point-in-time view and `replace_all` is atomic.
pub struct ObjectStore<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for ObjectStore<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K: Resource> Default for ObjectStore<K> {
    fn default() -> Self { Self::new() }
}

fn newer_or_equal<K: Resource>(incoming: &K, stored: &K) -> bool {
    match (incoming.version(), stored.version()) {
        (Some(new), Some(old)) => new >= old,
        _ => true,
    }
}

fn same_version<K: Resource>(a: &K, b: &K) -> bool {
    match (a.version(), b.version()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

impl<K: Resource> ObjectStore<K> {
    /// Store with the `namespace` index.
    pub fn new() -> Self { Self::with_indexers(Indexers::with_namespace()) }

    pub fn with_indexers(indexers: Indexers<K>) -> Self {
        let indices = indexers.fns.keys().map(|n| (n.clone(), FxHashMap::default())).collect();
        let state = State { items: BTreeMap::new(), indices };
        Self { inner: Arc::new(Inner { state: RwLock::new(state), indexers }) }
    }

    pub fn len(&self) -> usize { self.inner.state.read().items.len() }
    pub fn is_empty(&self) -> bool { self.inner.state.read().items.is_empty() }
    pub fn contains(&self, key: &ObjectKey) -> bool { self.inner.state.read().items.contains_key(key) }
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> { self.inner.state.read().items.get(key).cloned() }

    /// Snapshot of every object, in key order.
    pub fn list(&self) -> Vec<Arc<K>> { self.inner.state.read().items.values().cloned().collect() }

    pub fn keys(&self) -> Vec<ObjectKey> { self.inner.state.read().items.keys().cloned().collect() }

    /// Insert or overwrite unconditionally; returns the previous object.
    pub fn add(&self, obj: Arc<K>) -> Result<Option<Arc<K>>, KeyError> {
        let key = obj.key()?;
        let mut st = self.inner.state.write();
        Ok(self.put(&mut st, key, obj))
    }

    /// Insert or overwrite unless the incoming version is older than the stored one.
    pub fn update(&self, obj: Arc<K>) -> Result<Upsert<K>, KeyError> {
        let key = obj.key()?;
        let mut st = self.inner.state.write();
        if let Some(prev) = st.items.get(&key) {
            if !newer_or_equal(obj.as_ref(), prev.as_ref()) {
                debug!(key = %key, "ignoring stale update");
                return Ok(Upsert::Stale(Arc::clone(prev)));
            }
        }
        Ok(match self.put(&mut st, key, obj) {
            Some(prev) => Upsert::Replaced(prev),
            None => Upsert::Inserted,
        })
    }

    pub fn delete(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut st = self.inner.state.write();
        let prev = st.items.remove(key)?;
        self.unindex(&mut st, key, prev.as_ref());
        Some(prev)
    }

    /// Atomically swap the whole content for `objects`, reporting what changed.
    /// Objects without an identity are skipped.
    pub fn replace_all(&self, objects: Vec<Arc<K>>) -> ReplaceOutcome<K> {
        let mut next = BTreeMap::new();
        for obj in objects {
            match obj.key() {
                Ok(key) => { next.insert(key, obj); }
                Err(e) => warn!(error = %e, "replace_all: skipping object without identity"),
            }
        }
        let mut st = self.inner.state.write();
        let mut out = ReplaceOutcome { added: Vec::new(), updated: Vec::new(), removed: Vec::new() };
        for (key, prev) in st.items.iter() {
            match next.get(key) {
                None => out.removed.push(Arc::clone(prev)),
                Some(obj) if !Arc::ptr_eq(obj, prev) && !same_version(obj.as_ref(), prev.as_ref()) => {
                    out.updated.push((Arc::clone(prev), Arc::clone(obj)))
                }
                Some(_) => {}
            }
        }
        for (key, obj) in next.iter() {
            if !st.items.contains_key(key) { out.added.push(Arc::clone(obj)); }
        }
        for idx in st.indices.values_mut() { idx.clear(); }
        let State { items, indices } = &mut *st;
        for (key, obj) in next.iter() {
            index_into(indices, &self.inner.indexers, key, obj.as_ref());
        }
        *items = next;
        out
    }

    /// Identities whose index `name` yields `value`.
    pub fn index_keys(&self, name: &str, value: &str) -> Result<Vec<ObjectKey>, StoreError> {
        let st = self.inner.state.read();
        let idx = st.indices.get(name).ok_or_else(|| StoreError::UnknownIndex(name.to_string()))?;
        Ok(idx.get(value).map(|keys| keys.iter().cloned().collect()).unwrap_or_default())
    }

    /// Objects whose index `name` yields `value`, in key order.
    pub fn by_index(&self, name: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError> {
        let st = self.inner.state.read();
        let idx = st.indices.get(name).ok_or_else(|| StoreError::UnknownIndex(name.to_string()))?;
        Ok(idx
            .get(value)
            .map(|keys| keys.iter().filter_map(|k| st.items.get(k).cloned()).collect())
            .unwrap_or_default())
    }

    /// Every value currently present in index `name`.
    pub fn index_values(&self, name: &str) -> Result<Vec<String>, StoreError> {
        let st = self.inner.state.read();
        let idx = st.indices.get(name).ok_or_else(|| StoreError::UnknownIndex(name.to_string()))?;
        let mut values: Vec<String> = idx.keys().cloned().collect();
        values.sort_unstable();
        Ok(values)
    }

    pub fn has_index(&self, name: &str) -> bool { self.inner.indexers.contains(name) }

    fn put(&self, st: &mut State<K>, key: ObjectKey, obj: Arc<K>) -> Option<Arc<K>> {
        let prev = st.items.insert(key.clone(), Arc::clone(&obj));
        if let Some(p) = &prev { self.unindex(st, &key, p.as_ref()); }
        index_into(&mut st.indices, &self.inner.indexers, &key, obj.as_ref());
        prev
    }

    fn unindex(&self, st: &mut State<K>, key: &ObjectKey, obj: &K) {
        for (name, f) in self.inner.indexers.fns.iter() {
            let Some(idx) = st.indices.get_mut(name) else { continue };
            for value in f(key, obj) {
                if let Some(keys) = idx.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() { idx.remove(&value); }
                }
            }
        }
    }
}

fn index_into<K>(
    indices: &mut FxHashMap<String, FxHashMap<String, BTreeSet<ObjectKey>>>,
    indexers: &Indexers<K>,
    key: &ObjectKey,
    obj: &K,
) {
    for (name, f) in indexers.fns.iter() {
        let idx = indices.entry(name.clone()).or_default();
        for value in f(key, obj) {
            idx.entry(value).or_default().insert(key.clone());
        }
    }
}
