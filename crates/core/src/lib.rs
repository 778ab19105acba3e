//! Tether core types: object identity, versions, deltas and the list/watch boundary.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

/// Stable identity of an object: `namespace/name`, or bare `name` for cluster-scoped objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.filter(|ns| !ns.is_empty()), name: name.into() }
    }

    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(Some(namespace.into()), name)
    }

    pub fn cluster(name: impl Into<String>) -> Self { Self { namespace: None, name: name.into() } }

    pub fn namespace(&self) -> Option<&str> { self.namespace.as_deref() }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [name] if !name.is_empty() => Ok(Self::cluster(*name)),
            [ns, name] if !ns.is_empty() && !name.is_empty() => Ok(Self::namespaced(*ns, *name)),
            _ => Err(KeyError::Invalid(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("object has no name")]
    MissingName,
    #[error("invalid object key {0:?} (expect name or namespace/name)")]
    Invalid(String),
}

/// Server-assigned version token.
///
/// Tokens are opaque, but the store needs a per-identity order to reject stale updates.
/// Two purely decimal tokens compare numerically (shorter is older); anything else
/// falls back to plain string order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
    pub fn new(token: impl Into<String>) -> Self { Self(token.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

fn is_decimal(s: &str) -> bool { !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) }

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b) = (self.0.as_str(), other.0.as_str());
        if is_decimal(a) && is_decimal(b) {
            a.len().cmp(&b.len()).then_with(|| a.cmp(b))
        } else {
            a.cmp(b)
        }
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for Version {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for Version {
    fn from(s: String) -> Self { Self(s) }
}

/// Anything the informer can cache: it must expose an identity and, ideally, a version.
pub trait Resource: Clone + Send + Sync + 'static {
    /// Derive the identity. Objects without one are dropped by the reflector.
    fn key(&self) -> Result<ObjectKey, KeyError>;

    /// Per-object version token, if the source assigns one.
    fn version(&self) -> Option<Version>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum DeltaKind {
    Added,
    Updated,
    Deleted,
    /// Periodic re-delivery of cached state; not a remote change.
    Sync,
}

/// A single change record. Objects are shared immutable snapshots.
#[derive(Debug)]
pub struct Delta<K> {
    pub kind: DeltaKind,
    pub object: Arc<K>,
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self { Self { kind: self.kind, object: Arc::clone(&self.object) } }
}

impl<K> Delta<K> {
    pub fn new(kind: DeltaKind, object: Arc<K>) -> Self { Self { kind, object } }
    pub fn added(object: Arc<K>) -> Self { Self::new(DeltaKind::Added, object) }
    pub fn updated(object: Arc<K>) -> Self { Self::new(DeltaKind::Updated, object) }
    pub fn deleted(object: Arc<K>) -> Self { Self::new(DeltaKind::Deleted, object) }
    pub fn sync(object: Arc<K>) -> Self { Self::new(DeltaKind::Sync, object) }
}

// ---- list/watch boundary ----

/// Result of a full collection fetch.
#[derive(Debug, Clone)]
pub struct ListPage<K> {
    pub items: Vec<K>,
    /// Watermark to resume a watch from.
    pub resource_version: String,
}

/// One event from a watch stream, each carrying the new watermark.
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    Added { object: K, resource_version: String },
    Modified { object: K, resource_version: String },
    Deleted { object: K, resource_version: String },
    /// Progress marker: newer watermark, no object change.
    Bookmark { resource_version: String },
}

impl<K> WatchEvent<K> {
    pub fn added(object: K, resource_version: impl Into<String>) -> Self {
        Self::Added { object, resource_version: resource_version.into() }
    }

    pub fn modified(object: K, resource_version: impl Into<String>) -> Self {
        Self::Modified { object, resource_version: resource_version.into() }
    }

    pub fn deleted(object: K, resource_version: impl Into<String>) -> Self {
        Self::Deleted { object, resource_version: resource_version.into() }
    }

    pub fn resource_version(&self) -> &str {
        match self {
            Self::Added { resource_version, .. }
            | Self::Modified { resource_version, .. }
            | Self::Deleted { resource_version, .. }
            | Self::Bookmark { resource_version } => resource_version,
        }
    }

    /// Split into the delta kind and object, `None` for bookmarks.
    pub fn into_change(self) -> Option<(DeltaKind, K)> {
        match self {
            Self::Added { object, .. } => Some((DeltaKind::Added, object)),
            Self::Modified { object, .. } => Some((DeltaKind::Updated, object)),
            Self::Deleted { object, .. } => Some((DeltaKind::Deleted, object)),
            Self::Bookmark { .. } => None,
        }
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The watermark was compacted away; only a full relist can recover.
    #[error("resource version too old: {0}")]
    Expired(String),
    #[error("transport: {0}")]
    Transport(#[source] BoxError),
}

impl SourceError {
    pub fn transport(err: impl Into<BoxError>) -> Self { Self::Transport(err.into()) }
    pub fn is_expired(&self) -> bool { matches!(self, Self::Expired(_)) }
}

pub type WatchStream<K> = BoxStream<'static, Result<WatchEvent<K>, SourceError>>;

/// The two operations the reflector needs from a transport.
#[async_trait::async_trait]
pub trait ListWatch<K: Send + 'static>: Send + Sync + 'static {
    async fn list(&self) -> Result<ListPage<K>, SourceError>;

    /// Open a change stream starting after `resource_version`.
    async fn watch(&self, resource_version: &str) -> Result<WatchStream<K>, SourceError>;
}

pub mod prelude {
    pub use super::{
        Delta, DeltaKind, KeyError, ListPage, ListWatch, ObjectKey, Resource, SourceError, Version, WatchEvent,
        WatchStream,
    };
}
