use crate::{
    api::CallControlApiRef,
    callrecord::{active_calls, CallDirection, CallRecord},
    history::HistoryStore,
};
use chrono::Utc;
use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, warn};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub records: Vec<CallRecord>,
    pub from_cache: bool,
    /// Set when the fetch failed; `records` then holds the last good list.
    pub error: Option<String>,
}

impl Snapshot {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
struct CacheState {
    records: Option<Vec<CallRecord>>,
    fetched_at: Option<Instant>,
    consecutive_failures: u32,
}

/// Short-lived cache in front of `GET /calls`.
///
/// The state lock is held across the fetch so concurrent callers wait for
/// the in-flight request and then read its result instead of fetching again.
pub struct SnapshotCache {
    api: CallControlApiRef,
    history: Arc<Mutex<HistoryStore>>,
    freshness: Duration,
    direction: Option<CallDirection>,
    state: Mutex<CacheState>,
}

impl SnapshotCache {
    pub fn new(
        api: CallControlApiRef,
        history: Arc<Mutex<HistoryStore>>,
        freshness: Duration,
        direction: Option<CallDirection>,
    ) -> Self {
        Self {
            api,
            history,
            freshness,
            direction,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub async fn get_snapshot(&self) -> Snapshot {
        let mut state = self.state.lock().await;
        if let (Some(records), Some(fetched_at)) = (&state.records, state.fetched_at) {
            if fetched_at.elapsed() < self.freshness {
                return Snapshot {
                    records: records.clone(),
                    from_cache: true,
                    error: None,
                };
            }
        }

        match self.api.list_calls(self.direction).await {
            Ok(records) => {
                state.records = Some(records.clone());
                state.fetched_at = Some(Instant::now());
                state.consecutive_failures = 0;
                self.record_history(&records).await;
                Snapshot {
                    records,
                    from_cache: false,
                    error: None,
                }
            }
            Err(e) => {
                state.consecutive_failures += 1;
                warn!(
                    failures = state.consecutive_failures,
                    "failed to fetch calls, using last known list: {}", e
                );
                Snapshot {
                    records: state.records.clone().unwrap_or_default(),
                    from_cache: true,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Upserts a fresh list into history and stamps whatever disappeared.
    async fn record_history(&self, records: &[CallRecord]) {
        let now = Utc::now();
        let active: HashSet<String> = active_calls(records)
            .iter()
            .flat_map(|r| std::iter::once(r.id.clone()).chain(r.sip_call_id.clone()))
            .collect();

        let mut history = self.history.lock().await;
        for record in records {
            history.upsert(record, now);
        }
        history.mark_all_terminated_except(&active, now);
        if !history.is_initial_load_complete() {
            debug!("history not loaded yet, deferring persist");
            return;
        }
        if let Err(e) = history.persist().await {
            warn!("failed to persist call history: {}", e);
        }
    }

    /// The last good list, without fetching.
    pub async fn last_known(&self) -> Vec<CallRecord> {
        self.state.lock().await.records.clone().unwrap_or_default()
    }

    /// Forces the next `get_snapshot` to hit the API.
    pub async fn invalidate(&self) {
        self.state.lock().await.fetched_at = None;
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.state.lock().await.consecutive_failures
    }

    pub async fn reset_failures(&self) {
        self.state.lock().await.consecutive_failures = 0;
    }
}
