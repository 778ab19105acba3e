#![forbid(unsafe_code)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use support::{eventually, obj, obj_in, FakeSource, Gated, Obj, Recorder};
use tether_informer::{
    HandlerFns, Health, InformerConfig, InformerError, InformerFactory, ObjectKey, ReflectorState, SharedInformer, SourceError,
    WatchEvent,
};
use tokio_util::sync::CancellationToken;

fn quiet() -> InformerConfig { InformerConfig { resync_secs: 0, ..InformerConfig::default() } }

async fn synced(informer: &SharedInformer<Obj>, stop: &CancellationToken) {
    informer.start(stop).unwrap();
    let ok = tokio::time::timeout(Duration::from_secs(5), informer.wait_for_cache_sync(stop)).await.unwrap();
    assert!(ok, "cache never synced");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_then_watch_drives_cache_and_handlers() {
    let source = FakeSource::new();
    source.push_list(vec![obj("a", 1), obj("b", 1)], "10");
    let feed = source.push_watch();
    let informer = SharedInformer::new(source.clone(), quiet());
    let rec = Recorder::new();
    informer.add_event_handler(rec.clone()).unwrap();
    let stop = CancellationToken::new();
    synced(&informer, &stop).await;

    assert_eq!(rec.wait_len(2).await, vec!["+a@1", "+b@1"]);
    assert_eq!(informer.lister().list_all().len(), 2);

    feed.send(Ok(WatchEvent::modified(obj("a", 2), "11"))).unwrap();
    rec.wait_len(3).await;
    feed.send(Ok(WatchEvent::deleted(obj("b", 1), "12"))).unwrap();
    let evs = rec.wait_len(4).await;
    assert_eq!(evs, vec!["+a@1", "+b@1", "~a@1->a@2", "-b@1"]);

    let lister = informer.lister();
    assert_eq!(lister.get(&ObjectKey::namespaced("default", "a")).unwrap().rv, 2);
    assert!(lister.get(&ObjectKey::namespaced("default", "b")).is_none());
    assert_eq!(informer.last_sync_resource_version().as_deref(), Some("12"));
    assert_eq!(informer.health(), Health::Healthy);
    assert_eq!(informer.reflector_state(), ReflectorState::Watching);
    assert_eq!(source.watch_rvs(), vec!["10"]);

    stop.cancel();
    tokio::time::timeout(Duration::from_secs(5), informer.shutdown()).await.unwrap();
    assert_eq!(informer.reflector_state(), ReflectorState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_handler_is_primed_with_current_contents() {
    let source = FakeSource::new();
    source.push_list((0..100).map(|i| obj(&format!("o{i:03}"), 1)).collect(), "5");
    let feed = source.push_watch();
    let informer = SharedInformer::new(source, quiet());
    let stop = CancellationToken::new();
    synced(&informer, &stop).await;

    let rec = Recorder::new();
    informer.add_event_handler(rec.clone()).unwrap();
    feed.send(Ok(WatchEvent::modified(obj("o000", 2), "6"))).unwrap();

    let evs = rec.wait_len(101).await;
    assert!(evs[..100].iter().all(|e| e.starts_with('+')));
    let mut unique = evs[..100].to_vec();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 100);
    assert_eq!(evs[100], "~o000@1->o000@2");
    informer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn resync_delivers_one_sync_per_object_per_period() {
    let source = FakeSource::new();
    source.push_list(vec![obj("a", 1), obj("b", 1), obj("c", 1)], "1");
    let informer = SharedInformer::new(source, InformerConfig { resync_secs: 30, ..InformerConfig::default() });
    let rec = Recorder::new();
    informer.add_event_handler(rec.clone()).unwrap();
    let stop = CancellationToken::new();
    synced(&informer, &stop).await;
    rec.wait_len(3).await;

    tokio::time::sleep(Duration::from_secs(31)).await;
    let syncs = |evs: &[String]| evs.iter().filter(|e| e.starts_with('=')).count();
    assert_eq!(syncs(&rec.wait_len(6).await), 3);
    let mut first_round: Vec<_> = rec.events()[3..].to_vec();
    first_round.sort();
    assert_eq!(first_round, vec!["=a@1", "=b@1", "=c@1"]);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(syncs(&rec.wait_len(9).await), 6);

    let versions: Vec<u64> = informer.lister().list_all().iter().map(|o| o.rv).collect();
    assert_eq!(versions, vec![1, 1, 1]);
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_handler_sees_the_same_order() {
    let source = FakeSource::new();
    source.push_list(vec![obj("a", 1)], "1");
    let feed = source.push_watch();
    let informer = SharedInformer::new(source, quiet());
    let (l1, l2) = (Recorder::new(), Recorder::new());
    informer.add_event_handler(l1.clone()).unwrap();
    informer.add_event_handler(l2.clone()).unwrap();
    let stop = CancellationToken::new();
    synced(&informer, &stop).await;

    feed.send(Ok(WatchEvent::modified(obj("a", 2), "2"))).unwrap();
    feed.send(Ok(WatchEvent::added(obj("b", 1), "3"))).unwrap();
    feed.send(Ok(WatchEvent::deleted(obj("a", 2), "4"))).unwrap();
    feed.send(Ok(WatchEvent::modified(obj("b", 2), "5"))).unwrap();

    let done = |evs: &[String]| evs.iter().any(|e| e.ends_with("b@2")) && evs.iter().any(|e| e.starts_with("-a"));
    let seen1 = l1.wait_until(done).await;
    let seen2 = l2.wait_until(done).await;
    assert_eq!(seen1, seen2);
    assert_eq!(seen1.first().map(String::as_str), Some("+a@1"));
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_initial_list() {
    let source = FakeSource::new();
    source.push_list_hang();
    let informer = SharedInformer::new(source, quiet());
    let stop = CancellationToken::new();
    informer.start(&stop).unwrap();

    let canceller = {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        })
    };
    let synced = tokio::time::timeout(Duration::from_secs(5), informer.wait_for_cache_sync(&stop)).await.unwrap();
    assert!(!synced);
    canceller.await.unwrap();

    tokio::time::timeout(Duration::from_secs(5), informer.shutdown()).await.unwrap();
    assert!(informer.is_stopped());
    assert!(!informer.has_synced());
    assert_eq!(informer.reflector_state(), ReflectorState::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn panicking_handler_does_not_affect_others() {
    let source = FakeSource::new();
    source.push_list(vec![obj("boom", 1), obj("calm", 1)], "1");
    let feed = source.push_watch();
    let informer = SharedInformer::new(source, quiet());

    let survivor = Recorder::new();
    let after_panic = Recorder::new();
    let fragile = HandlerFns::new().on_add({
        let after_panic = after_panic.clone();
        move |o: &Arc<Obj>| {
            if o.name == "boom" { panic!("handler failure on {}", o.name); }
            tether_informer::EventHandler::on_add(&after_panic, o);
        }
    });
    informer.add_event_handler(fragile).unwrap();
    informer.add_event_handler(survivor.clone()).unwrap();
    let stop = CancellationToken::new();
    synced(&informer, &stop).await;

    feed.send(Ok(WatchEvent::added(obj("late", 1), "2"))).unwrap();
    assert_eq!(survivor.wait_len(3).await, vec!["+boom@1", "+calm@1", "+late@1"]);
    assert_eq!(after_panic.wait_len(2).await, vec!["+calm@1", "+late@1"]);
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn expired_watch_relists_and_reconciles() {
    let source = FakeSource::new();
    source.push_list(vec![obj("a", 1), obj("b", 1)], "10");
    let first = source.push_watch();
    source.push_list(vec![obj("a", 2), obj("c", 1)], "20");
    let _second = source.push_watch();
    let informer = SharedInformer::new(source.clone(), quiet());
    let rec = Recorder::new();
    informer.add_event_handler(rec.clone()).unwrap();
    let stop = CancellationToken::new();
    synced(&informer, &stop).await;
    rec.wait_len(2).await;

    first.send(Err(SourceError::Expired("too old resource version".into()))).unwrap();
    let evs = rec.wait_len(5).await;
    assert_eq!(evs, vec!["+a@1", "+b@1", "~a@1->a@2", "+c@1", "-b@1"]);
    assert_eq!(source.list_calls(), 2);
    tokio::time::timeout(Duration::from_secs(5), async {
        while source.watch_rvs().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(source.watch_rvs(), vec!["10", "20"]);
    let names: Vec<String> = informer.lister().list_all().iter().map(|o| o.name.clone()).collect();
    assert_eq!(names, vec!["a", "c"]);
    informer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_list_failures_degrade_health() {
    let source = FakeSource::new();
    source.push_list_error("connection refused").push_list_error("connection refused").push_list_error("connection refused");
    source.push_list_hang();
    let mut config = quiet();
    config.backoff.initial_ms = 10;
    config.backoff.degraded_after = Some(3);
    let informer = SharedInformer::new(source.clone(), config);
    let stop = CancellationToken::new();
    informer.start(&stop).unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(source.list_calls(), 4);
    assert_eq!(informer.health(), Health::Degraded { consecutive_failures: 3 });
    assert!(!informer.has_synced());
    stop.cancel();
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn removed_handler_stops_receiving() {
    let source = FakeSource::new();
    source.push_list(vec![obj("a", 1)], "1");
    let feed = source.push_watch();
    let informer = SharedInformer::new(source, quiet());
    let (gone, kept) = (Recorder::new(), Recorder::new());
    let reg = informer.add_event_handler(gone.clone()).unwrap();
    informer.add_event_handler(kept.clone()).unwrap();
    let stop = CancellationToken::new();
    synced(&informer, &stop).await;
    gone.wait_len(1).await;

    assert!(informer.remove_event_handler(reg));
    assert!(!informer.remove_event_handler(reg));
    assert_eq!(informer.handler_count(), 1);

    feed.send(Ok(WatchEvent::added(obj("b", 1), "2"))).unwrap();
    kept.wait_len(2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(gone.events(), vec!["+a@1"]);
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_watch_event_is_dropped() {
    let source = FakeSource::new();
    source.push_list(vec![], "1");
    let feed = source.push_watch();
    let informer = SharedInformer::new(source, quiet());
    let rec = Recorder::new();
    informer.add_event_handler(rec.clone()).unwrap();
    let stop = CancellationToken::new();
    synced(&informer, &stop).await;

    feed.send(Ok(WatchEvent::added(obj("", 1), "2"))).unwrap();
    feed.send(Ok(WatchEvent::added(obj("ok", 1), "3"))).unwrap();
    assert_eq!(rec.wait_len(1).await, vec!["+ok@1"]);
    assert_eq!(informer.lister().list_all().len(), 1);
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_indexer_and_namespace_lister() {
    let source = FakeSource::new();
    source.push_list(vec![obj_in("prod", "api", "web"), obj_in("prod", "db", "data"), obj_in("dev", "api", "web")], "1");
    let informer = SharedInformer::builder(source)
        .config(quiet())
        .indexer("team", |_key: &ObjectKey, o: &Obj| vec![o.team.clone()])
        .build();
    let stop = CancellationToken::new();
    synced(&informer, &stop).await;

    let web: Vec<String> = informer.by_index("team", "web").unwrap().iter().map(|o| format!("{}/{}", o.ns, o.name)).collect();
    assert_eq!(web, vec!["dev/api", "prod/api"]);
    assert!(matches!(informer.by_index("owner", "x"), Err(InformerError::Store(_))));

    let prod = informer.lister().namespaced("prod");
    assert_eq!(prod.list().len(), 2);
    assert_eq!(prod.get("db").unwrap().team, "data");
    assert_eq!(informer.get_by_key("dev/api").unwrap().unwrap().team, "web");
    informer.shutdown().await;
}

#[tokio::test]
async fn lifecycle_errors() {
    let source = FakeSource::new();
    let informer = SharedInformer::new(source, quiet());
    let stop = CancellationToken::new();
    informer.start(&stop).unwrap();
    assert!(matches!(informer.start(&stop), Err(InformerError::AlreadyStarted)));

    informer.stop();
    informer.stop();
    assert!(matches!(informer.add_event_handler(Recorder::new()), Err(InformerError::Stopped)));
    assert!(!informer.wait_for_cache_sync(&stop).await);
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bookmark_advances_watermark_only() {
    let source = FakeSource::new();
    source.push_list(vec![obj("a", 1)], "7");
    let feed = source.push_watch();
    let informer = SharedInformer::new(source, quiet());
    let rec = Recorder::new();
    informer.add_event_handler(rec.clone()).unwrap();
    let stop = CancellationToken::new();
    synced(&informer, &stop).await;
    rec.wait_len(1).await;

    feed.send(Ok(WatchEvent::Bookmark { resource_version: "40".into() })).unwrap();
    feed.send(Ok(WatchEvent::modified(obj("a", 41), "41"))).unwrap();
    rec.wait_len(2).await;
    assert_eq!(informer.last_sync_resource_version().as_deref(), Some("41"));

    feed.send(Ok(WatchEvent::Bookmark { resource_version: "50".into() })).unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        while informer.last_sync_resource_version().as_deref() != Some("50") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(rec.events(), vec!["+a@1", "~a@1->a@41"]);
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn updates_folded_before_processing_deliver_one_callback() {
    let source = FakeSource::new();
    source.push_list(vec![obj("a", 1), obj("gate", 1), obj("pad1", 1), obj("pad2", 1)], "1");
    let feed = source.push_watch();
    let informer = SharedInformer::new(source, InformerConfig { listener_buffer: 1, ..quiet() });
    let (gated, release) = Gated::new();
    let rec = gated.rec.clone();
    informer.add_event_handler(gated).unwrap();
    let stop = CancellationToken::new();
    informer.start(&stop).unwrap();

    // the handler parks on gate, pad1 fills its buffer and the processor waits on pad2
    rec.wait_until(|e| e.iter().any(|e| e == "+gate@1")).await;
    eventually("listed entries taken", || informer.queue_len() == 0).await;
    feed.send(Ok(WatchEvent::modified(obj("a", 2), "2"))).unwrap();
    feed.send(Ok(WatchEvent::modified(obj("a", 3), "3"))).unwrap();
    feed.send(Ok(WatchEvent::added(obj("tail", 1), "4"))).unwrap();
    eventually("both watch entries queued", || informer.queue_len() == 2).await;

    drop(release);
    let evs = rec.wait_len(6).await;
    assert_eq!(evs, vec!["+a@1", "+gate@1", "+pad1@1", "+pad2@1", "~a@1->a@3", "+tail@1"]);
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_handler_backpressures_the_reflector() {
    let source = FakeSource::new();
    source.push_list(vec![obj("gate", 1)], "1");
    let feed = source.push_watch();
    let config = InformerConfig { queue_capacity: 2, listener_buffer: 1, ..quiet() };
    let informer = SharedInformer::new(source, config);
    let (gated, release) = Gated::new();
    let rec = gated.rec.clone();
    informer.add_event_handler(gated).unwrap();
    let stop = CancellationToken::new();
    informer.start(&stop).unwrap();
    rec.wait_len(1).await;

    for i in 0..50 {
        feed.send(Ok(WatchEvent::added(obj(&format!("n{i:02}"), 1), (i + 2).to_string()))).unwrap();
    }
    eventually("queue to fill", || informer.queue_len() == 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(informer.queue_len(), 2);
    assert!(informer.lister().list_all().len() <= 3, "processor ran ahead of a blocked handler");

    drop(release);
    let evs = rec.wait_len(51).await;
    assert_eq!(evs.last().map(String::as_str), Some("+n49@1"));
    informer.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn watches_that_keep_expiring_pace_relists() {
    let source = FakeSource::new();
    for _ in 0..4 {
        source.push_list(vec![obj("a", 1)], "1");
        source.push_watch_expired();
    }
    let mut config = quiet();
    config.backoff.initial_ms = 100;
    let informer = SharedInformer::new(source.clone(), config);
    let stop = CancellationToken::new();
    let started = tokio::time::Instant::now();
    informer.start(&stop).unwrap();

    while source.list_calls() < 4 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    // first relist is immediate, then 100ms, then 200ms
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(informer.health(), Health::Healthy);
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn factory_shares_one_informer_per_type() {
    let source = FakeSource::new();
    source.push_list(vec![obj("a", 1)], "1");
    let factory = InformerFactory::new(quiet());
    let informer = factory.informer::<Obj, _>(source.clone());
    let again = factory.informer::<Obj, _>(FakeSource::new());
    assert!(Arc::ptr_eq(&informer, &again));
    assert_eq!(factory.len(), 1);

    let rec = Recorder::new();
    informer.add_event_handler(rec.clone()).unwrap();
    let stop = CancellationToken::new();
    factory.start(&stop).unwrap();
    factory.start(&stop).unwrap();
    let synced = tokio::time::timeout(Duration::from_secs(5), factory.wait_for_cache_sync(&stop)).await.unwrap();
    assert!(synced);
    assert_eq!(rec.wait_len(1).await, vec!["+a@1"]);
    assert_eq!(source.list_calls(), 1);

    factory.stop();
    assert!(informer.is_stopped());
    informer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn factory_sync_wait_gives_up_on_stop() {
    let source = FakeSource::new();
    source.push_list_hang();
    let factory = InformerFactory::new(quiet());
    let informer = factory.informer::<Obj, _>(source);
    let stop = CancellationToken::new();
    factory.start(&stop).unwrap();

    let canceller = {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.cancel();
        })
    };
    let synced = tokio::time::timeout(Duration::from_secs(5), factory.wait_for_cache_sync(&stop)).await.unwrap();
    assert!(!synced);
    canceller.await.unwrap();
    informer.shutdown().await;
}
