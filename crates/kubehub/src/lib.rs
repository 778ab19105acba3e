//! Tether kubehub: list/watch source backed by a typed `kube::Api`.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::ops::Deref;

use futures::StreamExt;
use kube::api::{Api, ListParams, WatchEvent as KubeEvent, WatchParams};
use kube::error::ErrorResponse;
use kube::Resource as KubeResource;
use serde::de::DeserializeOwned;
use tether_core::{KeyError, ListPage, ListWatch, ObjectKey, Resource, SourceError, Version, WatchEvent, WatchStream};
use tracing::debug;

/// Server-side cap for a single watch request.
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;

/// Kubernetes object as a cacheable [`Resource`]: identity from `metadata.{namespace,name}`,
/// version from `metadata.resourceVersion`.
#[derive(Debug, Clone, PartialEq)]
pub struct KubeObject<K>(pub K);

impl<K> Deref for KubeObject<K> {
    type Target = K;
    fn deref(&self) -> &K { &self.0 }
}

impl<K> KubeObject<K> {
    pub fn into_inner(self) -> K { self.0 }
}

impl<K> Resource for KubeObject<K>
where
    K: KubeResource + Clone + Send + Sync + 'static,
{
    fn key(&self) -> Result<ObjectKey, KeyError> {
        let meta = self.0.meta();
        match meta.name.as_deref() {
            Some(name) if !name.is_empty() => Ok(ObjectKey::new(meta.namespace.clone(), name)),
            _ => Err(KeyError::MissingName),
        }
    }

    fn version(&self) -> Option<Version> { self.0.meta().resource_version.clone().map(Version::from) }
}

/// [`ListWatch`] over one `Api<K>` (namespaced, all-namespaces or cluster scoped, as constructed).
pub struct KubeListWatch<K> {
    api: Api<K>,
    labels: Option<String>,
    fields: Option<String>,
    timeout_secs: u32,
}

impl<K> KubeListWatch<K> {
    pub fn new(api: Api<K>) -> Self { Self { api, labels: None, fields: None, timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS } }

    /// Watch timeout from `TETHER_WATCH_TIMEOUT_SECS`, clamped below the server limit.
    pub fn with_env(mut self) -> Self {
        if let Some(secs) = std::env::var("TETHER_WATCH_TIMEOUT_SECS").ok().and_then(|s| s.parse::<u32>().ok()) {
            self.timeout_secs = secs.clamp(1, DEFAULT_WATCH_TIMEOUT_SECS);
        }
        self
    }

    pub fn labels(mut self, selector: impl Into<String>) -> Self {
        self.labels = Some(selector.into());
        self
    }

    pub fn fields(mut self, selector: impl Into<String>) -> Self {
        self.fields = Some(selector.into());
        self
    }

    pub fn timeout_secs(mut self, secs: u32) -> Self {
        self.timeout_secs = secs.clamp(1, DEFAULT_WATCH_TIMEOUT_SECS);
        self
    }

    fn list_params(&self) -> ListParams {
        let mut lp = ListParams::default();
        if let Some(l) = &self.labels { lp = lp.labels(l); }
        if let Some(f) = &self.fields { lp = lp.fields(f); }
        lp
    }

    fn watch_params(&self) -> WatchParams {
        let mut wp = WatchParams::default().timeout(self.timeout_secs);
        if let Some(l) = &self.labels { wp = wp.labels(l); }
        if let Some(f) = &self.fields { wp = wp.fields(f); }
        wp
    }
}

fn is_gone(e: &ErrorResponse) -> bool { e.code == 410 }

fn source_error(err: kube::Error) -> SourceError {
    match err {
        kube::Error::Api(e) if is_gone(&e) => SourceError::Expired(e.message),
        other => SourceError::transport(other),
    }
}

fn resource_version_of<K: KubeResource>(obj: &K) -> String { obj.meta().resource_version.clone().unwrap_or_default() }

fn convert<K: KubeResource>(item: Result<KubeEvent<K>, kube::Error>) -> Result<WatchEvent<KubeObject<K>>, SourceError> {
    match item.map_err(source_error)? {
        KubeEvent::Added(o) => {
            let rv = resource_version_of(&o);
            Ok(WatchEvent::added(KubeObject(o), rv))
        }
        KubeEvent::Modified(o) => {
            let rv = resource_version_of(&o);
            Ok(WatchEvent::modified(KubeObject(o), rv))
        }
        KubeEvent::Deleted(o) => {
            let rv = resource_version_of(&o);
            Ok(WatchEvent::deleted(KubeObject(o), rv))
        }
        KubeEvent::Bookmark(b) => Ok(WatchEvent::Bookmark { resource_version: b.metadata.resource_version }),
        KubeEvent::Error(e) if is_gone(&e) => Err(SourceError::Expired(e.message)),
        KubeEvent::Error(e) => Err(SourceError::transport(kube::Error::Api(e))),
    }
}

#[async_trait::async_trait]
impl<K> ListWatch<KubeObject<K>> for KubeListWatch<K>
where
    K: KubeResource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self) -> Result<ListPage<KubeObject<K>>, SourceError> {
        let list = self.api.list(&self.list_params()).await.map_err(source_error)?;
        let resource_version = list.metadata.resource_version.unwrap_or_default();
        debug!(items = list.items.len(), resource_version = %resource_version, "kube list");
        Ok(ListPage { items: list.items.into_iter().map(KubeObject).collect(), resource_version })
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<KubeObject<K>>, SourceError> {
        let stream = self.api.watch(&self.watch_params(), resource_version).await.map_err(source_error)?;
        Ok(stream.map(convert).boxed())
    }
}
