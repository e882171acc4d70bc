use super::*;
use crate::storage::{KeyValueStore, MemoryStore};
use async_trait::async_trait;
use chrono::{Duration, TimeZone};
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

#[derive(Default)]
struct CountingStore {
    inner: MemoryStore,
    writes: AtomicUsize,
}

#[async_trait]
impl KeyValueStore for CountingStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, value).await
    }
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_735_725_600 + secs, 0).unwrap()
}

fn call(id: &str, sip: Option<&str>, status: CallStatus) -> CallRecord {
    CallRecord {
        id: id.to_string(),
        sip_call_id: sip.map(|s| s.to_string()),
        status,
        direction: CallDirection::Outbound,
        room_name: Some("r1".to_string()),
        start_time: Some(at(0)),
        ..Default::default()
    }
}

fn assert_unique_identities(history: &HistoryStore) {
    let mut seen = HashSet::new();
    for entry in history.list() {
        assert!(seen.insert(entry.identity().to_string()), "duplicate {}", entry.identity());
        if let Some(sip) = &entry.sip_call_id {
            let holders = history
                .list()
                .iter()
                .filter(|e| e.matches_identity(sip))
                .count();
            assert_eq!(holders, 1, "sip call id {} resolves twice", sip);
        }
    }
}

fn memory_history() -> HistoryStore {
    HistoryStore::new(Arc::new(MemoryStore::default()), DEFAULT_MAX_HISTORY)
}

#[test]
fn test_upsert_is_idempotent() {
    let mut history = memory_history();
    let record = CallRecord {
        start_time: None,
        duration_seconds: Some(12),
        ..call("a", Some("c1"), CallStatus::Completed)
    };
    history.upsert(&record, at(30));
    let once = history.list().to_vec();
    history.upsert(&record, at(90));
    assert_eq!(history.list(), once.as_slice());
    assert_eq!(once[0].start_time, at(30));
}

#[test]
fn test_identity_prefers_sip_call_id_then_id() {
    let mut history = memory_history();
    history.upsert(&call("a", None, CallStatus::Connecting), at(0));
    history.upsert(&call("a", Some("c1"), CallStatus::Ringing), at(1));
    history.upsert(&call("other-local-id", Some("c1"), CallStatus::Active), at(2));

    assert_eq!(history.list().len(), 1);
    let entry = &history.list()[0];
    assert_eq!(entry.id, "a");
    assert_eq!(entry.sip_call_id.as_deref(), Some("c1"));
    assert_eq!(entry.status, CallStatus::Active);
}

#[test]
fn test_terminal_status_is_sticky() {
    let mut history = memory_history();
    history.upsert(&call("a", Some("c1"), CallStatus::Active), at(0));
    history.upsert(&call("a", Some("c1"), CallStatus::Completed), at(60));
    history.upsert(&call("a", Some("c1"), CallStatus::Active), at(70));

    let entry = history.get("c1").unwrap();
    assert_eq!(entry.status, CallStatus::Completed);
    assert_eq!(entry.end_time, Some(at(60)));
    assert_eq!(entry.duration_seconds, Some(60));
}

#[test]
fn test_newer_fields_win_but_empty_fields_do_not_erase() {
    let mut history = memory_history();
    let mut first = call("a", Some("c1"), CallStatus::Ringing);
    first.called_uri = Some("+15551234567".to_string());
    first.human_participant_name = Some("Ana".to_string());
    history.upsert(&first, at(0));

    let mut second = call("a", Some("c1"), CallStatus::Active);
    second.human_participant_name = Some("Ana Maria".to_string());
    history.upsert(&second, at(5));

    let entry = history.get("a").unwrap();
    assert_eq!(entry.called_uri.as_deref(), Some("+15551234567"));
    assert_eq!(entry.human_participant_name.as_deref(), Some("Ana Maria"));
}

#[test]
fn test_mark_all_terminated_except() {
    let mut history = memory_history();
    history.upsert(&call("a", Some("c1"), CallStatus::Active), at(0));
    history.upsert(&call("b", Some("c2"), CallStatus::Active), at(0));
    let mut with_end = call("c", None, CallStatus::Ringing);
    with_end.end_time = Some(at(20));
    history.upsert(&with_end, at(0));

    let active: HashSet<String> = ["c2".to_string()].into_iter().collect();
    assert_eq!(history.mark_all_terminated_except(&active, at(45)), 2);

    let a = history.get("c1").unwrap();
    assert_eq!(a.status, CallStatus::Terminated);
    assert_eq!(a.duration_seconds, Some(45));
    let c = history.get("c").unwrap();
    assert_eq!(c.end_time, Some(at(20)));
    assert_eq!(c.duration_seconds, Some(20));
    assert_eq!(history.get("c2").unwrap().status, CallStatus::Active);

    // already terminal entries are left alone
    assert_eq!(history.mark_all_terminated_except(&HashSet::new(), at(100)), 1);
    assert_eq!(history.get("c1").unwrap().end_time, Some(at(45)));
}

#[test]
fn test_mark_ended_only_touches_live_entries() {
    let mut history = memory_history();
    history.upsert(&call("a", Some("c1"), CallStatus::Ringing), at(0));
    assert!(history.mark_ended("a", CallStatus::Failed, at(45)));
    assert!(!history.mark_terminated("c1", at(50)));
    assert_eq!(history.get("c1").unwrap().status, CallStatus::Failed);
    assert!(!history.mark_terminated("missing", at(50)));
}

#[test]
fn test_retention_keeps_newest_entries() {
    let mut history = memory_history();
    for i in 0..DEFAULT_MAX_HISTORY {
        let mut record = call(&format!("id-{i}"), Some(&format!("sip-{i}")), CallStatus::Completed);
        record.start_time = Some(at(i as i64));
        history.upsert(&record, at(i as i64));
    }
    assert_eq!(history.list().len(), DEFAULT_MAX_HISTORY);

    let mut newest = call("newest", Some("sip-new"), CallStatus::Ringing);
    newest.start_time = Some(at(5_000));
    history.upsert(&newest, at(5_000));

    assert_eq!(history.list().len(), DEFAULT_MAX_HISTORY);
    assert_eq!(history.list()[0].id, "newest");
    assert!(history.get("sip-0").is_none());
    assert!(history.get("sip-1").is_some());
    let starts: Vec<_> = history.list().iter().map(|e| e.start_time).collect();
    assert!(starts.windows(2).all(|w| w[0] >= w[1]));
}

#[test]
fn test_snapshot_sequences_never_duplicate_identities() {
    let mut history = memory_history();
    let sequences = vec![
        vec![call("a", None, CallStatus::Connecting)],
        vec![call("a", Some("c1"), CallStatus::Ringing), call("b", None, CallStatus::Ringing)],
        vec![call("x", Some("c1"), CallStatus::Active), call("b", Some("c2"), CallStatus::Active)],
        vec![call("b", Some("c2"), CallStatus::OnHold), call("c2", None, CallStatus::OnHold)],
        vec![],
        vec![call("a", Some("c1"), CallStatus::Active)],
    ];
    for (tick, snapshot) in sequences.iter().enumerate() {
        let now = at(tick as i64 * 6);
        for record in snapshot {
            history.upsert(record, now);
        }
        let active: HashSet<String> = snapshot
            .iter()
            .filter(|r| !r.is_terminal())
            .map(|r| r.identity().to_string())
            .collect();
        history.mark_all_terminated_except(&active, now);
        assert_unique_identities(&history);
    }
    assert_eq!(history.list().len(), 2);
    // c1 went away at tick 4 and must not come back to life
    assert!(history.get("c1").unwrap().status.is_terminal());
}

#[tokio::test]
async fn test_empty_history_does_not_overwrite_before_initial_load() {
    let store = Arc::new(CountingStore::default());
    store
        .inner
        .put(
            CALL_HISTORY_KEY,
            serde_json::to_string(&vec![HistoryEntry::from_record(
                &call("old", Some("c0"), CallStatus::Completed),
                at(0),
            )])
            .unwrap(),
        )
        .await
        .unwrap();

    let mut history = HistoryStore::new(store.clone(), DEFAULT_MAX_HISTORY);
    assert_eq!(history.persist().await.unwrap(), PersistOutcome::RefusedEmpty);
    assert_eq!(store.writes.load(Ordering::SeqCst), 0);
    assert!(store.get(CALL_HISTORY_KEY).await.unwrap().unwrap().contains("c0"));

    history.mark_initial_load_complete();
    assert_eq!(history.persist().await.unwrap(), PersistOutcome::Written);
    assert_eq!(store.get(CALL_HISTORY_KEY).await.unwrap(), Some("[]".to_string()));
}

#[tokio::test]
async fn test_persist_skips_unchanged_content() {
    let store = Arc::new(CountingStore::default());
    let mut history = HistoryStore::new(store.clone(), DEFAULT_MAX_HISTORY);
    history.upsert(&call("a", Some("c1"), CallStatus::Active), at(0));

    assert_eq!(history.persist().await.unwrap(), PersistOutcome::Written);
    assert_eq!(history.persist().await.unwrap(), PersistOutcome::Unchanged);
    history.upsert(&call("a", Some("c1"), CallStatus::Active), at(3));
    assert_eq!(history.persist().await.unwrap(), PersistOutcome::Unchanged);
    history.upsert(&call("a", Some("c1"), CallStatus::OnHold), at(6));
    assert_eq!(history.persist().await.unwrap(), PersistOutcome::Written);
    assert_eq!(store.writes.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_load_merges_under_observed_entries() {
    let store: KeyValueStoreRef = Arc::new(MemoryStore::default());
    let mut previous = HistoryStore::new(store.clone(), DEFAULT_MAX_HISTORY);
    previous.upsert(&call("a", Some("c1"), CallStatus::Completed), at(0));
    previous.upsert(&call("b", Some("c2"), CallStatus::Completed), at(0));
    previous.persist().await.unwrap();

    let mut history = HistoryStore::new(store, DEFAULT_MAX_HISTORY);
    let mut live = call("b", Some("c2"), CallStatus::Active);
    live.start_time = Some(at(0) + Duration::seconds(1));
    history.upsert(&live, at(1));
    assert_eq!(history.load().await.unwrap(), 2);

    assert_eq!(history.list().len(), 2);
    assert_eq!(history.get("c2").unwrap().status, CallStatus::Active);
    assert_eq!(history.get("c1").unwrap().status, CallStatus::Completed);
}

#[tokio::test]
async fn test_clear_requires_initial_load() {
    let mut history = memory_history();
    history.upsert(&call("a", Some("c1"), CallStatus::Completed), at(0));
    assert!(matches!(history.clear().await, Err(Error::Conflict(_))));
    assert_eq!(history.list().len(), 1);

    history.mark_initial_load_complete();
    assert_eq!(history.clear().await.unwrap(), PersistOutcome::Written);
    assert!(history.list().is_empty());
}
