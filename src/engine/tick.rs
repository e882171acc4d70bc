use crate::{
    callrecord::{active_calls, CallRecord, CallStatus},
    detector::{CallEndDetector, DetectorSource, NotificationDedupKey},
    event::Notification,
    history::HistoryStore,
    rooms::{OutgoingRoom, RoomIdentityRegistry, SyncOutcome},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum PollingState {
    #[default]
    Running,
    Suspended { reason: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallFlowStep {
    #[default]
    Idle,
    CreatingRoom,
    Dialing,
    Ringing,
    Connected,
    Ended,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Generic,
    Bot,
}

/// An outbound call that has been placed but not yet answered or ended.
#[derive(Debug, Clone)]
pub struct CallAttempt {
    pub sip_call_id: Option<String>,
    pub room_name: String,
    pub target: String,
    pub kind: AttemptKind,
    pub started_at: Instant,
    pub timeout: Duration,
    pub answered: bool,
    /// Record id of the matching call, used when it has no SIP call id.
    pub record_id: Option<String>,
    /// Identifies the attempt before the server reported any record for it.
    pub local_id: String,
}

impl CallAttempt {
    fn matches(&self, record: &CallRecord) -> bool {
        match (&self.sip_call_id, &record.sip_call_id) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => record.in_room(&self.room_name),
        }
    }

    fn dedup_key(&self) -> NotificationDedupKey {
        let call_id = self
            .sip_call_id
            .as_deref()
            .or(self.record_id.as_deref())
            .unwrap_or(&self.local_id);
        NotificationDedupKey::new(&self.room_name, Some(call_id))
    }
}

/// A room joined rather than created; its media is torn down once the last
/// call in it goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRoom {
    pub room_name: String,
    pub last_sip_call_id: Option<String>,
    pub saw_call: bool,
}

/// Everything the reconciliation loop owns between ticks.
pub struct EngineState {
    pub outgoing: OutgoingRoom,
    pub detector: CallEndDetector,
    pub registry: RoomIdentityRegistry,
    pub active_calls: Vec<CallRecord>,
    pub polling: PollingState,
    pub attempt: Option<CallAttempt>,
    pub flow_step: CallFlowStep,
    pub joined_room: Option<JoinedRoom>,
}

impl EngineState {
    pub fn new(detach_grace: Duration) -> Self {
        Self {
            outgoing: OutgoingRoom::new(detach_grace),
            detector: CallEndDetector::default(),
            registry: RoomIdentityRegistry::default(),
            active_calls: Vec::new(),
            polling: PollingState::Running,
            attempt: None,
            flow_step: CallFlowStep::Idle,
            joined_room: None,
        }
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.polling, PollingState::Suspended { .. })
    }

    pub fn has_attached_call(&self) -> bool {
        self.outgoing
            .state()
            .is_some_and(|s| s.is_active && s.has_active_sip_call)
    }

    /// Ends the current attempt when it belongs to `room_name`.
    fn finish_attempt_in(&mut self, room_name: &str, effects: &mut Vec<Effect>) {
        if !self.attempt.as_ref().is_some_and(|a| a.room_name == room_name) {
            return;
        }
        let Some(attempt) = self.attempt.take() else {
            return;
        };
        self.flow_step = if attempt.answered {
            CallFlowStep::Ended
        } else {
            CallFlowStep::Failed
        };
        effects.push(Effect::StopAttemptMonitor);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    pub now: Instant,
    pub wall: DateTime<Utc>,
    pub source: DetectorSource,
    /// The records are a stale fallback after a failed fetch.
    pub stale: bool,
}

/// Side effects a tick asks the engine to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Notify(Notification),
    ScheduleDetach(Duration),
    LeaveMedia { room_name: String },
    StopAttemptMonitor,
}

/// One reconciliation pass over a snapshot.
///
/// History has already seen `records` when they came from a fresh fetch.
/// End detection is skipped on stale data so a network failure is never
/// mistaken for a dropped call.
pub fn reconcile(
    state: &mut EngineState,
    history: &mut HistoryStore,
    records: &[CallRecord],
    ctx: &TickContext,
) -> Vec<Effect> {
    let mut effects = apply_pending_detach(state, history, ctx.now, ctx.wall);

    state.active_calls = active_calls(records);

    for record in records {
        match state.outgoing.sync_call_to_room(record, ctx.now) {
            SyncOutcome::Attached => {
                if state.attempt.is_none() {
                    state.flow_step = flow_step_for(&record.status);
                }
            }
            SyncOutcome::DetachScheduled(delay) => effects.push(Effect::ScheduleDetach(delay)),
            SyncOutcome::Updated | SyncOutcome::Ignored => {}
        }
    }

    evaluate_attempt(state, history, records, ctx, &mut effects);

    if ctx.stale {
        return effects;
    }

    let ended = match state.outgoing.state() {
        Some(room) => {
            state
                .detector
                .evaluate(room, &state.active_calls, ctx.source, ctx.now)
        }
        None => None,
    };
    if let Some(ended) = ended {
        info!(
            room_name = ended.room_name,
            sip_call_id = ended.sip_call_id.as_deref().unwrap_or("-"),
            source = ?ended.source,
            "outgoing call ended"
        );
        state.outgoing.clear_call_from_room();
        if let Some(sip) = &ended.sip_call_id {
            history.mark_terminated(sip, ctx.wall);
        }
        if ended.notify {
            effects.push(Effect::Notify(Notification::call_ended(&ended.room_name)));
        }
        state.finish_attempt_in(&ended.room_name, &mut effects);
    }

    check_joined_room(state, history, ctx, &mut effects);
    effects
}

/// Completes a terminal-status detach once its grace delay has passed.
pub fn apply_pending_detach(
    state: &mut EngineState,
    history: &mut HistoryStore,
    now: Instant,
    wall: DateTime<Utc>,
) -> Vec<Effect> {
    let mut effects = Vec::new();
    if !state.outgoing.detach_due(now) {
        return effects;
    }
    let Some(room) = state.outgoing.state().cloned() else {
        return effects;
    };
    state.outgoing.clear_call_from_room();
    let status = room
        .call_data
        .as_ref()
        .map(|c| c.status.clone())
        .unwrap_or(CallStatus::Terminated);
    if let Some(sip) = &room.sip_call_id {
        history.mark_ended(sip, status, wall);
    }
    if state.detector.claim(NotificationDedupKey::for_room(&room)) {
        effects.push(Effect::Notify(Notification::call_ended(&room.room_name)));
    }
    state.finish_attempt_in(&room.room_name, &mut effects);
    effects
}

fn flow_step_for(status: &CallStatus) -> CallFlowStep {
    match status {
        CallStatus::Ringing => CallFlowStep::Ringing,
        s if s.is_established() => CallFlowStep::Connected,
        s if s.is_terminal() => CallFlowStep::Ended,
        _ => CallFlowStep::Dialing,
    }
}

fn evaluate_attempt(
    state: &mut EngineState,
    history: &mut HistoryStore,
    records: &[CallRecord],
    ctx: &TickContext,
    effects: &mut Vec<Effect>,
) {
    let Some(attempt) = state.attempt.as_mut() else {
        return;
    };
    // a later record for the same call supersedes an earlier one
    if let Some(record) = records.iter().rev().find(|r| attempt.matches(r)) {
        if attempt.sip_call_id.is_none() && record.sip_call_id.is_some() {
            attempt.sip_call_id = record.sip_call_id.clone();
        }
        if attempt.record_id.is_none() {
            attempt.record_id = Some(record.id.clone());
        }
        if record.status.is_established() && !attempt.answered {
            attempt.answered = true;
            info!(called = attempt.target, "call answered");
            effects.push(Effect::Notify(Notification::call_answered(&attempt.target)));
        }
        if record.is_terminal() {
            let attempt = attempt.clone();
            state.attempt = None;
            effects.push(Effect::StopAttemptMonitor);
            if attempt.answered {
                state.flow_step = CallFlowStep::Ended;
            } else {
                state.flow_step = CallFlowStep::Failed;
                if state.detector.claim(attempt.dedup_key()) {
                    effects.push(Effect::Notify(Notification::call_failed(format!(
                        "Call to {} {}",
                        attempt.target, record.status
                    ))));
                }
            }
            return;
        }
        state.flow_step = flow_step_for(&record.status);
    }

    let Some(attempt) = state.attempt.as_ref() else {
        return;
    };
    if attempt.answered || ctx.now.duration_since(attempt.started_at) < attempt.timeout {
        return;
    }
    let attempt = attempt.clone();
    warn!(
        called = attempt.target,
        timeout = attempt.timeout.as_secs(),
        kind = ?attempt.kind,
        "call was not established in time"
    );
    state.attempt = None;
    state.flow_step = CallFlowStep::Failed;
    effects.push(Effect::StopAttemptMonitor);
    if let Some(sip) = &attempt.sip_call_id {
        history.mark_ended(sip, CallStatus::Failed, ctx.wall);
    }
    if state
        .outgoing
        .state()
        .is_some_and(|s| s.matches_room(&attempt.room_name))
    {
        state.outgoing.clear_call_from_room();
    }
    if state.detector.claim(attempt.dedup_key()) {
        effects.push(Effect::Notify(Notification::call_failed(format!(
            "No answer from {} within {}s",
            attempt.target,
            attempt.timeout.as_secs()
        ))));
    }
}

fn check_joined_room(
    state: &mut EngineState,
    history: &mut HistoryStore,
    ctx: &TickContext,
    effects: &mut Vec<Effect>,
) {
    if state.detector.is_suppressed(ctx.now) {
        return;
    }
    let Some(joined) = state.joined_room.as_mut() else {
        return;
    };
    if let Some(call) = state
        .active_calls
        .iter()
        .find(|r| r.in_room(&joined.room_name))
    {
        joined.saw_call = true;
        joined.last_sip_call_id = call.sip_call_id.clone();
        return;
    }
    if !joined.saw_call {
        return;
    }
    // self-created rooms are kept for reuse
    if state.registry.is_created_by_us(&joined.room_name) {
        debug!(room_name = joined.room_name, "joined room was created here, keeping media");
        joined.saw_call = false;
        return;
    }
    let Some(joined) = state.joined_room.take() else {
        return;
    };
    info!(room_name = joined.room_name, "last call left joined room");
    if let Some(sip) = &joined.last_sip_call_id {
        history.mark_terminated(sip, ctx.wall);
    }
    effects.push(Effect::LeaveMedia {
        room_name: joined.room_name.clone(),
    });
    let key = NotificationDedupKey::new(&joined.room_name, joined.last_sip_call_id.as_deref());
    if state.detector.claim(key) {
        effects.push(Effect::Notify(Notification::call_ended(&joined.room_name)));
    }
}
