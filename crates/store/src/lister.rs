//! Read-only views over an [`ObjectStore`].

use std::sync::Arc;

use tether_core::{ObjectKey, Resource};

use crate::{ObjectStore, StoreError, NAMESPACE_INDEX};

/// Read-only query façade. Reads are legal before the cache has synced; they just
/// may not see everything yet.
pub struct Lister<K> {
    store: ObjectStore<K>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self { Self { store: self.store.clone() } }
}

impl<K: Resource> Lister<K> {
    pub fn new(store: ObjectStore<K>) -> Self { Self { store } }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> { self.store.get(key) }

    pub fn list_all(&self) -> Vec<Arc<K>> { self.store.list() }

    pub fn list_by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>, StoreError> {
        self.store.by_index(index, value)
    }

    pub fn namespaced(&self, namespace: impl Into<String>) -> NamespaceLister<K> {
        NamespaceLister { store: self.store.clone(), namespace: namespace.into() }
    }
}

/// Lister restricted to one namespace.
pub struct NamespaceLister<K> {
    store: ObjectStore<K>,
    namespace: String,
}

impl<K: Resource> NamespaceLister<K> {
    pub fn get(&self, name: &str) -> Option<Arc<K>> {
        self.store.get(&ObjectKey::namespaced(self.namespace.clone(), name))
    }

    pub fn list(&self) -> Vec<Arc<K>> {
        if self.store.has_index(NAMESPACE_INDEX) {
            if let Ok(items) = self.store.by_index(NAMESPACE_INDEX, &self.namespace) {
                return items;
            }
        }
        // no namespace index registered: scan
        self.store
            .list()
            .into_iter()
            .filter(|o| o.key().ok().and_then(|k| k.namespace).as_deref() == Some(self.namespace.as_str()))
            .collect()
    }
}
