//! Tether store: in-RAM object cache, compressing delta queue and listers.

#![forbid(unsafe_code)]

mod lister;
mod object_store;
mod queue;

pub use lister::{Lister, NamespaceLister};
pub use object_store::{IndexFn, Indexers, ObjectStore, ReplaceOutcome, Upsert, NAMESPACE_INDEX};
pub use queue::{DeltaQueue, Deltas, Entry, QueueItem, ReplaceSummary, Replaced};

use tether_core::KeyError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error("queue closed")]
    Closed,
    #[error(transparent)]
    Key(#[from] KeyError),
}
