use crate::{callrecord::CallRecord, rooms::OutgoingRoomState};
use std::{
    collections::{HashSet, VecDeque},
    time::Duration,
};
use tokio::time::Instant;
use tracing::debug;


const MAX_REMEMBERED_KEYS: usize = 512;
const NO_SIP: &str = "noSip";

/// Which timer observed the end of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorSource {
    RoomWatch,
    GlobalPoll,
}

/// Identifies one call attempt for notification purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NotificationDedupKey(String);

impl NotificationDedupKey {
    pub fn new(room_name: &str, sip_call_id: Option<&str>) -> Self {
        Self(format!("{}:{}", room_name, sip_call_id.unwrap_or(NO_SIP)))
    }

    /// Key for the call attached to `room`, falling back to the record id
    /// when the call has no SIP call id.
    pub fn for_room(room: &OutgoingRoomState) -> Self {
        let call_id = room.sip_call_id.as_deref().or_else(|| {
            room.call_data
                .as_ref()
                .map(|c| c.call_id.as_str())
                .filter(|id| !id.is_empty())
        });
        Self::new(&room.room_name, call_id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEnded {
    pub key: NotificationDedupKey,
    pub room_name: String,
    pub sip_call_id: Option<String>,
    pub source: DetectorSource,
    /// False when this attempt was already reported; the room should still
    /// be cleared but nothing shown to the user.
    pub notify: bool,
}

/// Detects that the call attached to the outgoing room went away, reporting
/// each distinct attempt at most once.
#[derive(Debug, Default)]
pub struct CallEndDetector {
    emitted: HashSet<NotificationDedupKey>,
    order: VecDeque<NotificationDedupKey>,
    suppressed_until: Option<Instant>,
}

impl CallEndDetector {
    /// Silences detection around a deliberate room switch.
    pub fn suppress_for(&mut self, window: Duration, now: Instant) {
        let until = now + window;
        if self.suppressed_until.map_or(true, |current| current < until) {
            self.suppressed_until = Some(until);
        }
        debug!(?window, "call-end detection suppressed");
    }

    pub fn is_suppressed(&self, now: Instant) -> bool {
        self.suppressed_until.is_some_and(|until| now < until)
    }

    pub fn already_emitted(&self, key: &NotificationDedupKey) -> bool {
        self.emitted.contains(key)
    }

    /// Records `key` as notified. Returns false when it already was.
    pub fn claim(&mut self, key: NotificationDedupKey) -> bool {
        if !self.emitted.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);
        while self.order.len() > MAX_REMEMBERED_KEYS {
            if let Some(oldest) = self.order.pop_front() {
                self.emitted.remove(&oldest);
            }
        }
        true
    }

    /// Evaluates the outgoing room against the current active calls.
    ///
    /// The call is considered present when any non-terminal record matches
    /// either the room's current or requested name, or the last known SIP
    /// call id. Rooms waiting out a terminal-status grace delay are left to
    /// that path.
    pub fn evaluate(
        &mut self,
        room: &OutgoingRoomState,
        active: &[CallRecord],
        source: DetectorSource,
        now: Instant,
    ) -> Option<CallEnded> {
        if !room.has_active_sip_call || room.has_pending_detach() || self.is_suppressed(now) {
            return None;
        }
        let live = active.iter().filter(|r| !r.is_terminal());
        let by_room = live
            .clone()
            .any(|r| r.room_name.as_deref().is_some_and(|n| room.matches_room(n)));
        let by_sip = room
            .sip_call_id
            .as_deref()
            .is_some_and(|sip| live.clone().any(|r| r.sip_call_id.as_deref() == Some(sip)));
        if by_room || by_sip {
            return None;
        }

        let key = NotificationDedupKey::for_room(room);
        let notify = self.claim(key.clone());
        if !notify {
            debug!(key = key.as_str(), ?source, "call end already reported");
        }
        Some(CallEnded {
            key,
            room_name: room.room_name.clone(),
            sip_call_id: room.sip_call_id.clone(),
            source,
            notify,
        })
    }
}
