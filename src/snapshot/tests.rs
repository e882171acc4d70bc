use super::*;
use crate::{
    callrecord::CallStatus,
    fixtures::{call, ScriptedApi},
    history::DEFAULT_MAX_HISTORY,
    storage::{KeyValueStoreRef, MemoryStore, CALL_HISTORY_KEY},
};

struct Harness {
    api: Arc<ScriptedApi>,
    store: KeyValueStoreRef,
    history: Arc<Mutex<HistoryStore>>,
    cache: SnapshotCache,
}

fn harness(freshness: Duration) -> Harness {
    let api = Arc::new(ScriptedApi::default());
    let store: KeyValueStoreRef = Arc::new(MemoryStore::default());
    let history = Arc::new(Mutex::new(HistoryStore::new(
        store.clone(),
        DEFAULT_MAX_HISTORY,
    )));
    let cache = SnapshotCache::new(api.clone(), history.clone(), freshness, None);
    Harness {
        api,
        store,
        history,
        cache,
    }
}

#[tokio::test]
async fn test_fresh_snapshot_is_served_from_cache() {
    let h = harness(Duration::from_secs(60));
    h.api.set_calls(vec![call("c1", "r1", CallStatus::Ringing)]);

    let first = h.cache.get_snapshot().await;
    assert!(!first.from_cache);
    assert_eq!(first.records.len(), 1);

    h.api.set_calls(vec![]);
    let second = h.cache.get_snapshot().await;
    assert!(second.from_cache);
    assert_eq!(second.records.len(), 1);
    assert_eq!(h.api.list_count(), 1);
}

#[tokio::test]
async fn test_stale_snapshot_is_refetched() {
    let h = harness(Duration::ZERO);
    h.api.set_calls(vec![call("c1", "r1", CallStatus::Ringing)]);
    h.cache.get_snapshot().await;
    h.api.set_calls(vec![]);

    let snapshot = h.cache.get_snapshot().await;
    assert!(!snapshot.from_cache);
    assert!(snapshot.records.is_empty());
    assert_eq!(h.api.list_count(), 2);
}

#[tokio::test]
async fn test_invalidate_forces_fetch() {
    let h = harness(Duration::from_secs(60));
    h.cache.get_snapshot().await;
    h.cache.invalidate().await;
    h.cache.get_snapshot().await;
    assert_eq!(h.api.list_count(), 2);
}

#[tokio::test]
async fn test_concurrent_callers_share_one_fetch() {
    let h = harness(Duration::from_secs(60));
    h.api.set_calls(vec![call("c1", "r1", CallStatus::Active)]);
    let (a, b) = tokio::join!(h.cache.get_snapshot(), h.cache.get_snapshot());
    assert_eq!(a.records, b.records);
    assert_eq!(h.api.list_count(), 1);
}

#[tokio::test]
async fn test_failure_returns_last_known_list() {
    let h = harness(Duration::ZERO);
    h.api.set_calls(vec![call("c1", "r1", CallStatus::Active)]);
    h.cache.get_snapshot().await;

    h.api.fail_next(2);
    let failed = h.cache.get_snapshot().await;
    assert!(!failed.is_ok());
    assert!(failed.from_cache);
    assert_eq!(failed.records.len(), 1);
    h.cache.get_snapshot().await;
    assert_eq!(h.cache.consecutive_failures().await, 2);

    let recovered = h.cache.get_snapshot().await;
    assert!(recovered.is_ok());
    assert_eq!(h.cache.consecutive_failures().await, 0);
}

#[tokio::test]
async fn test_failure_without_previous_list_is_empty() {
    let h = harness(Duration::ZERO);
    h.api.fail_next(1);
    let snapshot = h.cache.get_snapshot().await;
    assert!(snapshot.records.is_empty());
    assert!(snapshot.error.is_some());

    h.cache.reset_failures().await;
    assert_eq!(h.cache.consecutive_failures().await, 0);
}

#[tokio::test]
async fn test_fetch_updates_history() {
    let h = harness(Duration::ZERO);
    h.history.lock().await.mark_initial_load_complete();
    h.api.set_calls(vec![
        call("c1", "r1", CallStatus::Active),
        call("c2", "r2", CallStatus::Ringing),
    ]);
    h.cache.get_snapshot().await;
    {
        let history = h.history.lock().await;
        assert_eq!(history.list().len(), 2);
        assert!(history.list().iter().all(|e| !e.status.is_terminal()));
    }
    assert!(h.store.get(CALL_HISTORY_KEY).await.unwrap().is_some());

    // c2 disappears from the server list
    h.api.set_calls(vec![call("c1", "r1", CallStatus::Active)]);
    h.cache.get_snapshot().await;
    let history = h.history.lock().await;
    assert_eq!(history.list().len(), 2);
    assert_eq!(history.get("c2").unwrap().status, CallStatus::Terminated);
    assert_eq!(history.get("c1").unwrap().status, CallStatus::Active);
}

#[tokio::test]
async fn test_no_persist_before_initial_load() {
    let h = harness(Duration::ZERO);
    h.api.set_calls(vec![call("c1", "r1", CallStatus::Active)]);
    h.cache.get_snapshot().await;
    assert_eq!(h.history.lock().await.list().len(), 1);
    assert!(h.store.get(CALL_HISTORY_KEY).await.unwrap().is_none());
}
