use crate::{
    error::{Error, Result},
    storage::{KeyValueStoreRef, CREATED_ROOMS_KEY, ROOM_META_KEY},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

pub const MAX_PARTICIPANT_NAME_LEN: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMeta {
    pub display_name: Option<String>,
}

/// Rooms this client originated, as opposed to joined.
///
/// Advisory only: entries never expire and the server remains the
/// authority on which rooms exist.
#[derive(Debug, Clone, Default)]
pub struct RoomIdentityRegistry {
    created: HashMap<String, DateTime<Utc>>,
    meta: HashMap<String, RoomMeta>,
}

impl RoomIdentityRegistry {
    pub async fn load(store: &KeyValueStoreRef) -> Result<Self> {
        let created = read_map(store, CREATED_ROOMS_KEY).await?;
        let meta = read_map(store, ROOM_META_KEY).await?;
        info!(created = created.len(), meta = meta.len(), "room registry loaded");
        Ok(Self { created, meta })
    }

    pub async fn save(&self, store: &KeyValueStoreRef) -> Result<()> {
        write_map(store, CREATED_ROOMS_KEY, &self.created).await?;
        write_map(store, ROOM_META_KEY, &self.meta).await
    }

    pub fn mark_created(&mut self, room_name: &str, now: DateTime<Utc>) {
        self.created.entry(room_name.to_string()).or_insert(now);
    }

    pub fn is_created_by_us(&self, room_name: &str) -> bool {
        self.created.contains_key(room_name)
    }

    pub fn created_at(&self, room_name: &str) -> Option<DateTime<Utc>> {
        self.created.get(room_name).copied()
    }

    pub fn set_display_name(&mut self, room_name: &str, display_name: &str) {
        self.meta.entry(room_name.to_string()).or_default().display_name =
            Some(display_name.to_string());
    }

    pub fn meta(&self, room_name: &str) -> Option<&RoomMeta> {
        self.meta.get(room_name)
    }

    /// Carries the created marker and metadata of a provisional room name
    /// over to its authoritative name. Existing values on `to_room` win.
    pub fn propagate_meta(&mut self, from_room: &str, to_room: &str) {
        if from_room == to_room {
            return;
        }
        if let Some(created) = self.created.get(from_room).copied() {
            self.created.entry(to_room.to_string()).or_insert(created);
        }
        if let Some(meta) = self.meta.get(from_room).cloned() {
            let target = self.meta.entry(to_room.to_string()).or_default();
            if target.display_name.is_none() {
                target.display_name = meta.display_name;
            }
        }
        debug!(from_room, to_room, "room metadata propagated");
    }

    /// Picks the name a participant joins `room_name` under.
    ///
    /// When `desired` collides with the name recorded for the room or with
    /// anyone in `roster`, a numeric suffix is added, shortening the base so
    /// the result stays within [`MAX_PARTICIPANT_NAME_LEN`] characters.
    pub fn negotiate_participant_name(
        &self,
        room_name: &str,
        desired: &str,
        roster: &[String],
    ) -> String {
        let base: String = desired.trim().chars().take(MAX_PARTICIPANT_NAME_LEN).collect();
        let recorded = self
            .meta
            .get(room_name)
            .and_then(|m| m.display_name.as_deref());
        let taken = |candidate: &str| {
            recorded.is_some_and(|r| r.eq_ignore_ascii_case(candidate))
                || roster.iter().any(|n| n.eq_ignore_ascii_case(candidate))
        };
        if !taken(&base) {
            return base;
        }
        let mut n = 2usize;
        loop {
            let suffix = format!("-{}", n);
            let keep = MAX_PARTICIPANT_NAME_LEN.saturating_sub(suffix.len());
            let candidate: String = base.chars().take(keep).collect::<String>() + &suffix;
            if !taken(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

async fn read_map<T: serde::de::DeserializeOwned>(
    store: &KeyValueStoreRef,
    key: &str,
) -> Result<HashMap<String, T>> {
    let raw = store
        .get(key)
        .await
        .map_err(|e| Error::Storage(e.to_string()))?;
    match raw {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|e| Error::Storage(format!("decode {}: {}", key, e))),
        None => Ok(HashMap::new()),
    }
}

async fn write_map<T: Serialize>(
    store: &KeyValueStoreRef,
    key: &str,
    map: &HashMap<String, T>,
) -> Result<()> {
    let content =
        serde_json::to_string(map).map_err(|e| Error::Storage(format!("encode {}: {}", key, e)))?;
    store
        .put(key, content)
        .await
        .map_err(|e| Error::Storage(e.to_string()))
}
