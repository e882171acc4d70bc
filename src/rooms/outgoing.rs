use super::registry::RoomIdentityRegistry;
use crate::{
    callrecord::{CallProjection, CallRecord},
    error::{Error, Result},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomPhase {
    #[default]
    None,
    Provisional,
    RealNameAssigned,
    SipAttached,
    SipDetached,
    Closed,
}

/// The self-created booth room used to place outbound calls.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingRoomState {
    pub requested_room_name: String,
    pub room_name: String,
    pub display_name: String,
    pub is_active: bool,
    pub has_active_sip_call: bool,
    pub is_media_connected: bool,
    pub sip_call_id: Option<String>,
    pub call_data: Option<CallProjection>,
    #[serde(skip)]
    renamed: bool,
    #[serde(skip)]
    pending_detach_at: Option<Instant>,
}

impl OutgoingRoomState {
    /// Current or requested name.
    pub fn matches_room(&self, room_name: &str) -> bool {
        self.room_name == room_name || self.requested_room_name == room_name
    }

    pub fn has_pending_detach(&self) -> bool {
        self.pending_detach_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Ignored,
    Attached,
    Updated,
    /// The attached call reached a terminal status; detach after the grace delay.
    DetachScheduled(Duration),
}

pub struct OutgoingRoom {
    phase: RoomPhase,
    state: Option<OutgoingRoomState>,
    detach_grace: Duration,
}

impl OutgoingRoom {
    pub fn new(detach_grace: Duration) -> Self {
        Self {
            phase: RoomPhase::None,
            state: None,
            detach_grace,
        }
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase
    }

    pub fn state(&self) -> Option<&OutgoingRoomState> {
        self.state.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_active)
    }

    pub fn create(
        &mut self,
        requested_name: &str,
        display_name: &str,
        registry: &mut RoomIdentityRegistry,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(existing) = self.state.as_ref().filter(|s| s.is_active) {
            return Err(Error::Conflict(format!(
                "outgoing room {} is still active",
                existing.room_name
            )));
        }
        if requested_name.trim().is_empty() {
            return Err(Error::Validation("room name must not be empty".to_string()));
        }
        registry.mark_created(requested_name, now);
        registry.set_display_name(requested_name, display_name);
        self.state = Some(OutgoingRoomState {
            requested_room_name: requested_name.to_string(),
            room_name: requested_name.to_string(),
            display_name: display_name.to_string(),
            is_active: true,
            has_active_sip_call: false,
            is_media_connected: false,
            sip_call_id: None,
            call_data: None,
            renamed: false,
            pending_detach_at: None,
        });
        self.phase = RoomPhase::Provisional;
        info!(room_name = requested_name, display_name, "outgoing room created");
        Ok(())
    }

    /// Replaces the provisional name with the server-assigned one. Happens at
    /// most once per room; repeating the current name is a no-op.
    pub fn update_room_name(
        &mut self,
        real_name: &str,
        registry: &mut RoomIdentityRegistry,
    ) -> Result<bool> {
        let Some(state) = self.state.as_mut().filter(|s| s.is_active) else {
            return Err(Error::Conflict("no active outgoing room to rename".to_string()));
        };
        if real_name.trim().is_empty() {
            return Err(Error::Validation("room name must not be empty".to_string()));
        }
        if state.room_name == real_name {
            return Ok(false);
        }
        if state.renamed {
            warn!(
                room_name = state.room_name,
                rejected = real_name,
                "outgoing room already has its server name"
            );
            return Err(Error::Conflict(format!(
                "room {} was already renamed",
                state.room_name
            )));
        }
        registry.propagate_meta(&state.room_name, real_name);
        info!(from = state.room_name, to = real_name, "outgoing room renamed");
        state.room_name = real_name.to_string();
        state.renamed = true;
        if self.phase == RoomPhase::Provisional {
            self.phase = RoomPhase::RealNameAssigned;
        }
        Ok(true)
    }

    /// Folds one polled call into the room.
    ///
    /// Calls without a SIP call id are matched by room name alone, which can
    /// misattribute two attempts placed from the same room in quick
    /// succession.
    pub fn sync_call_to_room(&mut self, record: &CallRecord, now: Instant) -> SyncOutcome {
        let Some(state) = self.state.as_mut().filter(|s| s.is_active) else {
            return SyncOutcome::Ignored;
        };
        if !record
            .room_name
            .as_deref()
            .is_some_and(|room| state.matches_room(room))
        {
            return SyncOutcome::Ignored;
        }

        if state.has_active_sip_call {
            let same_call = match (&state.sip_call_id, &record.sip_call_id) {
                (Some(current), Some(seen)) => current == seen,
                _ => true,
            };
            if !same_call {
                return SyncOutcome::Ignored;
            }
            if state.sip_call_id.is_none() {
                state.sip_call_id = record.sip_call_id.clone();
            }
            state.call_data = Some(record.projection());
            if record.is_terminal() && state.pending_detach_at.is_none() {
                state.pending_detach_at = Some(now + self.detach_grace);
                debug!(
                    room_name = state.room_name,
                    status = %record.status,
                    "call reached terminal status, detaching after grace"
                );
                return SyncOutcome::DetachScheduled(self.detach_grace);
            }
            return SyncOutcome::Updated;
        }

        if record.is_terminal() {
            return SyncOutcome::Ignored;
        }
        state.has_active_sip_call = true;
        state.sip_call_id = record.sip_call_id.clone();
        state.call_data = Some(record.projection());
        self.phase = RoomPhase::SipAttached;
        info!(
            room_name = state.room_name,
            sip_call_id = record.sip_call_id.as_deref().unwrap_or("-"),
            status = %record.status,
            "call attached to outgoing room"
        );
        SyncOutcome::Attached
    }

    pub fn detach_due(&self, now: Instant) -> bool {
        self.state
            .as_ref()
            .and_then(|s| s.pending_detach_at)
            .is_some_and(|at| now >= at)
    }

    /// Detaches the current call; the room stays up for the next one.
    pub fn clear_call_from_room(&mut self) -> bool {
        let Some(state) = self.state.as_mut().filter(|s| s.has_active_sip_call) else {
            return false;
        };
        info!(
            room_name = state.room_name,
            sip_call_id = state.sip_call_id.as_deref().unwrap_or("-"),
            "call detached from outgoing room"
        );
        state.has_active_sip_call = false;
        state.sip_call_id = None;
        state.call_data = None;
        state.pending_detach_at = None;
        self.phase = RoomPhase::SipDetached;
        true
    }

    pub fn clear_outgoing_room(&mut self) -> Option<OutgoingRoomState> {
        self.phase = RoomPhase::Closed;
        let state = self.state.take();
        if let Some(state) = &state {
            info!(room_name = state.room_name, "outgoing room closed");
        }
        state
    }

    pub fn set_media_connected(&mut self, connected: bool) {
        if let Some(state) = self.state.as_mut() {
            state.is_media_connected = connected;
        }
    }
}
