#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tether_informer::{EventHandler, KeyError, ListPage, ListWatch, ObjectKey, Resource, SourceError, Version, WatchEvent, WatchStream};
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq)]
pub struct Obj {
    pub ns: String,
    pub name: String,
    pub rv: u64,
    pub team: String,
}

impl Resource for Obj {
    fn key(&self) -> Result<ObjectKey, KeyError> {
        if self.name.is_empty() { return Err(KeyError::MissingName); }
        Ok(ObjectKey::namespaced(self.ns.clone(), self.name.clone()))
    }
    fn version(&self) -> Option<Version> { Some(Version::new(self.rv.to_string())) }
}

pub fn obj(name: &str, rv: u64) -> Obj { Obj { ns: "default".into(), name: name.into(), rv, team: "core".into() } }

pub fn obj_in(ns: &str, name: &str, team: &str) -> Obj { Obj { ns: ns.into(), name: name.into(), rv: 1, team: team.into() } }

pub type Feed = mpsc::UnboundedSender<Result<WatchEvent<Obj>, SourceError>>;

enum ListScript {
    Page(ListPage<Obj>),
    Fail(String),
    Hang,
}

enum WatchScript {
    Events(mpsc::UnboundedReceiver<Result<WatchEvent<Obj>, SourceError>>),
    Expired,
}

#[derive(Default)]
struct Inner {
    lists: Mutex<VecDeque<ListScript>>,
    watches: Mutex<VecDeque<WatchScript>>,
    list_calls: AtomicUsize,
    watch_rvs: Mutex<Vec<String>>,
}

/// Scripted source: each call consumes the next scripted answer. Unscripted lists
/// and watches hang.
#[derive(Clone, Default)]
pub struct FakeSource {
    inner: Arc<Inner>,
}

impl FakeSource {
    pub fn new() -> Self { Self::default() }

    pub fn push_list(&self, items: Vec<Obj>, rv: &str) -> &Self {
        self.inner.lists.lock().push_back(ListScript::Page(ListPage { items, resource_version: rv.into() }));
        self
    }

    pub fn push_list_error(&self, msg: &str) -> &Self {
        self.inner.lists.lock().push_back(ListScript::Fail(msg.into()));
        self
    }

    pub fn push_list_hang(&self) -> &Self {
        self.inner.lists.lock().push_back(ListScript::Hang);
        self
    }

    /// Script a watch that yields whatever is sent on the returned feed; dropping the feed ends it.
    pub fn push_watch(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.watches.lock().push_back(WatchScript::Events(rx));
        tx
    }

    pub fn push_watch_expired(&self) -> &Self {
        self.inner.watches.lock().push_back(WatchScript::Expired);
        self
    }

    pub fn list_calls(&self) -> usize { self.inner.list_calls.load(Ordering::SeqCst) }

    pub fn watch_rvs(&self) -> Vec<String> { self.inner.watch_rvs.lock().clone() }
}

#[async_trait::async_trait]
impl ListWatch<Obj> for FakeSource {
    async fn list(&self) -> Result<ListPage<Obj>, SourceError> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.inner.lists.lock().pop_front();
        match next {
            Some(ListScript::Page(p)) => Ok(p),
            Some(ListScript::Fail(msg)) => Err(SourceError::transport(msg)),
            Some(ListScript::Hang) | None => futures::future::pending().await,
        }
    }

    async fn watch(&self, resource_version: &str) -> Result<WatchStream<Obj>, SourceError> {
        self.inner.watch_rvs.lock().push(resource_version.to_string());
        let next = self.inner.watches.lock().pop_front();
        match next {
            Some(WatchScript::Events(mut rx)) => Ok(Box::pin(async_stream::stream! {
                while let Some(ev) = rx.recv().await {
                    yield ev;
                }
            })),
            Some(WatchScript::Expired) => Err(SourceError::Expired("too old resource version".into())),
            None => Ok(Box::pin(futures::stream::pending())),
        }
    }
}

/// Handler that renders every notification as a short string.
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
    changed: Arc<Notify>,
}

fn tag(o: &Obj) -> String { format!("{}@{}", o.name, o.rv) }

impl Recorder {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<String> { self.events.lock().clone() }

    fn record(&self, e: String) {
        self.events.lock().push(e);
        self.changed.notify_waiters();
    }

    /// Wait until `pred` holds for the recorded events; panics after 5s.
    pub async fn wait_until(&self, pred: impl Fn(&[String]) -> bool) -> Vec<String> {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let evs = self.events.lock();
                    if pred(&evs) { return evs.clone(); }
                }
                notified.await;
            }
        };
        match tokio::time::timeout(Duration::from_secs(5), wait).await {
            Ok(evs) => evs,
            Err(_) => panic!("condition not reached; events so far: {:?}", self.events()),
        }
    }

    pub async fn wait_len(&self, n: usize) -> Vec<String> { self.wait_until(|e| e.len() >= n).await }
}

impl EventHandler<Obj> for Recorder {
    fn on_add(&self, obj: &Arc<Obj>) { self.record(format!("+{}", tag(obj))) }
    fn on_update(&self, old: &Arc<Obj>, new: &Arc<Obj>) { self.record(format!("~{}->{}", tag(old), tag(new))) }
    fn on_delete(&self, obj: &Arc<Obj>) { self.record(format!("-{}", tag(obj))) }
    fn on_sync(&self, obj: &Arc<Obj>) { self.record(format!("={}", tag(obj))) }
}

/// Records like [`Recorder`], but parks inside `on_add` for objects named `gate`
/// until the returned sender is dropped.
pub struct Gated {
    pub rec: Recorder,
    release: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl Gated {
    pub fn new() -> (Self, std::sync::mpsc::Sender<()>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Self { rec: Recorder::new(), release: Mutex::new(rx) }, tx)
    }
}

impl EventHandler<Obj> for Gated {
    fn on_add(&self, obj: &Arc<Obj>) {
        self.rec.on_add(obj);
        if obj.name == "gate" {
            let _ = self.release.lock().recv();
        }
    }
    fn on_update(&self, old: &Arc<Obj>, new: &Arc<Obj>) { self.rec.on_update(old, new) }
    fn on_delete(&self, obj: &Arc<Obj>) { self.rec.on_delete(obj) }
    fn on_sync(&self, obj: &Arc<Obj>) { self.rec.on_sync(obj) }
}

/// Poll `cond` every few milliseconds; panics after 5s.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}
