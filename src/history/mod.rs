use crate::{
    callrecord::{CallDirection, CallRecord, CallStatus},
    error::{Error, Result},
    storage::{KeyValueStoreRef, CALL_HISTORY_KEY},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

pub const DEFAULT_MAX_HISTORY: usize = 1000;

/// Persisted projection of a call, one per resolved identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    pub sip_call_id: Option<String>,
    pub status: CallStatus,
    pub direction: CallDirection,
    pub room_name: Option<String>,
    pub caller_id_raw: Option<String>,
    pub called_uri: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
    pub human_participant_name: Option<String>,
}

impl HistoryEntry {
    fn from_record(record: &CallRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: record.id.clone(),
            sip_call_id: record.sip_call_id.clone(),
            status: record.status.clone(),
            direction: record.direction,
            room_name: record.room_name.clone(),
            caller_id_raw: record.caller_id_raw.clone(),
            called_uri: record.called_uri.clone(),
            start_time: record.start_time.unwrap_or(now),
            end_time: record.end_time,
            duration_seconds: record.duration_seconds,
            human_participant_name: record.human_participant_name.clone(),
        }
    }

    pub fn identity(&self) -> &str {
        self.sip_call_id.as_deref().unwrap_or(&self.id)
    }

    pub fn matches_identity(&self, identity: &str) -> bool {
        self.id == identity || self.sip_call_id.as_deref() == Some(identity)
    }

    /// Newer observation wins for every field it carries; a terminal status
    /// is never replaced.
    fn merge(&mut self, record: &CallRecord, now: DateTime<Utc>) {
        fn take<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                *slot = value.clone();
            }
        }
        if self.sip_call_id.is_none() {
            self.sip_call_id = record.sip_call_id.clone();
        }
        if record.direction != CallDirection::Unknown {
            self.direction = record.direction;
        }
        take(&mut self.room_name, &record.room_name);
        take(&mut self.caller_id_raw, &record.caller_id_raw);
        take(&mut self.called_uri, &record.called_uri);
        take(&mut self.end_time, &record.end_time);
        take(&mut self.duration_seconds, &record.duration_seconds);
        take(&mut self.human_participant_name, &record.human_participant_name);
        if let Some(start) = record.start_time {
            self.start_time = start;
        }
        if !self.status.is_terminal() {
            self.status = record.status.clone();
        }
        if self.status.is_terminal() {
            self.terminate(self.status.clone(), now);
        }
    }

    fn terminate(&mut self, status: CallStatus, now: DateTime<Utc>) {
        let end = self.end_time.unwrap_or(now);
        self.status = status;
        self.end_time = Some(end);
        self.duration_seconds = Some((end - self.start_time).num_seconds().max(0) as u64);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Written,
    Unchanged,
    /// An empty history was not written over a non-empty persisted one.
    RefusedEmpty,
}

/// Append-or-merge log of every call ever observed.
pub struct HistoryStore {
    store: KeyValueStoreRef,
    entries: Vec<HistoryEntry>,
    max_entries: usize,
    last_written_hash: Option<String>,
    persisted_non_empty: bool,
    initial_load_complete: bool,
}

impl HistoryStore {
    pub fn new(store: KeyValueStoreRef, max_entries: usize) -> Self {
        Self {
            store,
            entries: Vec::new(),
            max_entries: max_entries.max(1),
            last_written_hash: None,
            persisted_non_empty: false,
            initial_load_complete: false,
        }
    }

    /// Reads persisted history, merging it under anything already observed.
    pub async fn load(&mut self) -> Result<usize> {
        let raw = self
            .store
            .get(CALL_HISTORY_KEY)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        let Some(raw) = raw else {
            return Ok(0);
        };
        let persisted: Vec<HistoryEntry> = serde_json::from_str(&raw)
            .map_err(|e| Error::Storage(format!("decode {}: {}", CALL_HISTORY_KEY, e)))?;
        self.persisted_non_empty = !persisted.is_empty();
        self.last_written_hash = Some(content_hash(&raw));

        let loaded = persisted.len();
        for entry in persisted {
            let known = self.entries.iter().any(|e| {
                e.matches_identity(&entry.id)
                    || entry.sip_call_id.as_deref().is_some_and(|sip| e.matches_identity(sip))
            });
            if !known {
                self.entries.push(entry);
            }
        }
        self.enforce_retention();
        info!(loaded, total = self.entries.len(), "call history loaded");
        Ok(loaded)
    }

    pub fn mark_initial_load_complete(&mut self) {
        self.initial_load_complete = true;
    }

    pub fn is_initial_load_complete(&self) -> bool {
        self.initial_load_complete
    }

    pub fn list(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn get(&self, identity: &str) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.matches_identity(identity))
    }

    fn position(&self, record: &CallRecord) -> Option<usize> {
        record
            .sip_call_id
            .as_deref()
            .and_then(|sip| self.entries.iter().position(|e| e.matches_identity(sip)))
            .or_else(|| self.entries.iter().position(|e| e.matches_identity(&record.id)))
    }

    pub fn upsert(&mut self, record: &CallRecord, now: DateTime<Utc>) {
        match self.position(record) {
            Some(pos) => self.entries[pos].merge(record, now),
            None => {
                debug!(identity = record.identity(), status = %record.status, "new call in history");
                let mut entry = HistoryEntry::from_record(record, now);
                if entry.status.is_terminal() {
                    entry.terminate(entry.status.clone(), now);
                }
                self.entries.push(entry);
            }
        }
        self.enforce_retention();
    }

    pub fn mark_terminated(&mut self, identity: &str, now: DateTime<Utc>) -> bool {
        self.mark_ended(identity, CallStatus::Terminated, now)
    }

    /// Stamps a terminal status on a non-terminal entry. Returns whether
    /// anything changed.
    pub fn mark_ended(&mut self, identity: &str, status: CallStatus, now: DateTime<Utc>) -> bool {
        match self.entries.iter_mut().find(|e| e.matches_identity(identity)) {
            Some(entry) if !entry.status.is_terminal() => {
                entry.terminate(status, now);
                true
            }
            _ => false,
        }
    }

    /// Stamps every non-terminal entry whose identity is absent from
    /// `active` as terminated. Returns how many entries changed.
    pub fn mark_all_terminated_except(
        &mut self,
        active: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut changed = 0;
        for entry in self.entries.iter_mut() {
            if entry.status.is_terminal() {
                continue;
            }
            let still_active = active.contains(&entry.id)
                || entry
                    .sip_call_id
                    .as_ref()
                    .is_some_and(|sip| active.contains(sip));
            if !still_active {
                entry.terminate(CallStatus::Terminated, now);
                changed += 1;
            }
        }
        if changed > 0 {
            debug!(changed, "history entries terminated");
        }
        changed
    }

    fn enforce_retention(&mut self) {
        self.entries
            .sort_by(|a, b| b.start_time.cmp(&a.start_time));
        if self.entries.len() > self.max_entries {
            let dropped = self.entries.len() - self.max_entries;
            self.entries.truncate(self.max_entries);
            debug!(dropped, "history retention applied");
        }
    }

    /// Drops every entry. Only allowed once the initial load is confirmed.
    pub async fn clear(&mut self) -> Result<PersistOutcome> {
        if !self.initial_load_complete {
            return Err(Error::Conflict(
                "history cannot be cleared before it has been loaded".to_string(),
            ));
        }
        self.entries.clear();
        self.persist().await
    }

    pub async fn persist(&mut self) -> Result<PersistOutcome> {
        if self.entries.is_empty()
            && !self.initial_load_complete
            && (self.persisted_non_empty || self.stored_history_non_empty().await?)
        {
            warn!("refusing to overwrite persisted call history with an empty list");
            return Ok(PersistOutcome::RefusedEmpty);
        }
        let content = serde_json::to_string(&self.entries)
            .map_err(|e| Error::Storage(format!("encode {}: {}", CALL_HISTORY_KEY, e)))?;
        let hash = content_hash(&content);
        if self.last_written_hash.as_deref() == Some(hash.as_str()) {
            return Ok(PersistOutcome::Unchanged);
        }
        self.store
            .put(CALL_HISTORY_KEY, content)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.last_written_hash = Some(hash);
        self.persisted_non_empty = !self.entries.is_empty();
        Ok(PersistOutcome::Written)
    }
}

impl HistoryStore {
    async fn stored_history_non_empty(&self) -> Result<bool> {
        let raw = self
            .store
            .get(CALL_HISTORY_KEY)
            .await
            .map_err(|e| Error::Storage(e.to_string()))?;
        Ok(match raw {
            None => false,
            // unreadable content still counts as something worth keeping
            Some(raw) => serde_json::from_str::<Vec<serde_json::Value>>(&raw)
                .map(|items| !items.is_empty())
                .unwrap_or(!raw.trim().is_empty()),
        })
    }
}

fn content_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
