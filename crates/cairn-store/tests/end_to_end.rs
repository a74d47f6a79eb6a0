use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use cairn_bus::{handler_fn, BusConfig, MessageManager, TaskManager};
use cairn_codec::Record;
use cairn_store::{
    ContentEvent, ContentEventKind, ContentInfo, FsStreamStore, InfoCache, LockManager,
    MarkerState, OperationJournal, PutOutcome, Repository, RepositoryMessage, RetryPolicy,
    StoreConfig, StreamStore,
};
use cairn_types::ContentHash;
use uuid::Uuid;

fn bus() -> Arc<MessageManager> {
    let tasks = TaskManager::new(&BusConfig::default()).unwrap();
    Arc::new(MessageManager::new(Arc::new(tasks)))
}

fn wait_for(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn journal_cache_and_bus_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn StreamStore> = Arc::new(FsStreamStore::new(dir.path(), false));
    let locks = Arc::new(LockManager::new(2).unwrap());
    let journal = OperationJournal::open(Arc::clone(&store), Arc::clone(&locks)).unwrap();
    let cache = InfoCache::open(Arc::clone(&store), 2, 16, RetryPolicy::default()).unwrap();

    let h = ContentHash::of(b"abcd");
    let info = ContentInfo::new(h, 4);
    assert!(info.metadata.is_empty());

    assert!(journal.begin(&info).unwrap());
    assert!(!journal.begin(&info).unwrap());

    journal.complete(&info).unwrap();
    assert_eq!(journal.state(&h).unwrap(), Some(MarkerState::Completed));
    assert!(journal.pending().unwrap().is_empty());

    cache.put(&info).unwrap();
    assert_eq!(cache.get(&h).unwrap(), Some(info.clone()));
    journal.clear(&info);
    assert!(!locks.is_locked(&h));

    let bus = bus();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.register(handler_fn::<RepositoryMessage, _>("observe", move |m| {
        sink.lock().unwrap().push(*m);
        Ok(())
    }));

    let guid = Uuid::now_v7();
    assert_eq!(bus.post(RepositoryMessage::Opened(guid)).unwrap(), 1);
    assert!(wait_for(Duration::from_secs(2), || !seen.lock().unwrap().is_empty()));
    bus.tasks().stop();
    assert_eq!(*seen.lock().unwrap(), vec![RepositoryMessage::Opened(guid)]);
}

#[test]
fn repository_round_trip_with_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        key_length: 1,
        max_loaded_pages: 4,
        ..StoreConfig::with_root(dir.path().join("node"))
    };
    let bus = bus();

    let stored = Arc::new(AtomicUsize::new(0));
    let deleted = Arc::new(AtomicUsize::new(0));
    let (s, d) = (Arc::clone(&stored), Arc::clone(&deleted));
    bus.register(handler_fn::<ContentEvent, _>("count", move |event| {
        match event.kind {
            ContentEventKind::Stored => s.fetch_add(1, Ordering::SeqCst),
            ContentEventKind::Deleted => d.fetch_add(1, Ordering::SeqCst),
        };
        Ok(())
    }));

    let repo = Repository::open(&config, Arc::clone(&bus)).unwrap();
    let mut infos = Vec::new();
    for i in 0..20u32 {
        let body = format!("item-{i}");
        let (info, outcome) = repo
            .ingest(body.as_bytes(), Record::new().with("index", i as i32))
            .unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        infos.push(info);
    }
    assert!(repo.cache().loaded_pages() <= 4);
    assert!(repo.delete(&infos[0].hash).unwrap());

    assert!(wait_for(Duration::from_secs(2), || {
        stored.load(Ordering::SeqCst) == 20 && deleted.load(Ordering::SeqCst) == 1
    }));
    let guid = repo.guid();
    repo.close();

    let reopened = Repository::open(&config, bus).unwrap();
    assert_eq!(reopened.guid(), guid);
    assert_eq!(reopened.info(&infos[0].hash).unwrap(), None);
    for info in &infos[1..] {
        assert_eq!(reopened.info(&info.hash).unwrap().as_ref(), Some(info));
    }
    let status = reopened.status().unwrap();
    assert_eq!(status.deleted, 1);
    assert_eq!(status.buckets, 16);
}
