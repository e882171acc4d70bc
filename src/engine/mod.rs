use crate::{
    api::{validate_e164, CallControlApiRef, CreateRoomRequest, OriginateRequest},
    callrecord::{CallDirection, CallRecord, CallStatus},
    config::{Config, DialerConfig, EngineConfig},
    detector::{DetectorSource, NotificationDedupKey},
    error::{Error, Result},
    event::{Notification, NotificationReceiver, NotificationSender, Severity},
    history::{HistoryEntry, HistoryStore, PersistOutcome},
    media::{DetachedMediaSession, JoinRequest, MediaEvent, MediaSessionRef},
    rooms::{OutgoingRoomState, RoomIdentityRegistry, RoomPhase},
    scheduler::{Scheduler, TaskFn},
    snapshot::{Snapshot, SnapshotCache},
    storage::{KeyValueStoreRef, MemoryStore},
};
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use std::{
    future::Future,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod tick;
pub use tick::{
    reconcile, AttemptKind, CallAttempt, CallFlowStep, Effect, EngineState, JoinedRoom,
    PollingState, TickContext,
};


const POLL_TIMER: &str = "snapshot-poll";
const ROOM_WATCH_TIMER: &str = "room-watch";
const ATTEMPT_TIMER: &str = "attempt-monitor";
const DETACH_TIMER: &str = "room-detach";
const DEFAULT_INITIATOR: &str = "callbridge";

/// What the UI renders.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallsView {
    pub active_calls: Vec<CallRecord>,
    pub outgoing_room: Option<OutgoingRoomState>,
    pub room_phase: RoomPhase,
    pub flow_step: CallFlowStep,
    pub polling: PollingState,
}

impl CallsView {
    fn of(state: &EngineState) -> Self {
        Self {
            active_calls: state.active_calls.clone(),
            outgoing_room: state.outgoing.state().cloned(),
            room_phase: state.outgoing.phase(),
            flow_step: state.flow_step,
            polling: state.polling.clone(),
        }
    }
}

pub struct CallEngineBuilder {
    config: Option<Config>,
    api: Option<CallControlApiRef>,
    media: Option<MediaSessionRef>,
    store: Option<KeyValueStoreRef>,
    cancel_token: Option<CancellationToken>,
}

impl CallEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            api: None,
            media: None,
            store: None,
            cancel_token: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_api(mut self, api: CallControlApiRef) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_media(mut self, media: MediaSessionRef) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_store(mut self, store: KeyValueStoreRef) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = Some(cancel_token);
        self
    }

    pub fn build(self) -> Result<Arc<CallEngine>> {
        let Some(api) = self.api else {
            return Err(Error::Validation(
                "call-control api is not configured".to_string(),
            ));
        };
        let config = self.config.unwrap_or_default();
        let media = self
            .media
            .unwrap_or_else(|| Arc::new(DetachedMediaSession::default()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::default()));
        let cancel_token = self.cancel_token.unwrap_or_default();

        let engine_config = config.engine;
        let direction = config
            .api
            .direction
            .as_deref()
            .map(CallDirection::parse)
            .filter(|d| *d != CallDirection::Unknown);
        let history = Arc::new(Mutex::new(HistoryStore::new(
            store.clone(),
            engine_config.max_history,
        )));
        let cache = SnapshotCache::new(
            api.clone(),
            history.clone(),
            engine_config.snapshot_freshness(),
            direction,
        );
        let state = EngineState::new(engine_config.detach_grace());
        let (notifications, _) = broadcast::channel(64);
        let (view, _) = watch::channel(CallsView::of(&state));

        Ok(Arc::new(CallEngine {
            config: engine_config,
            dialer: config.dialer,
            api,
            media,
            store,
            cache,
            history,
            state: Mutex::new(state),
            scheduler: Scheduler::new(cancel_token),
            notifications,
            view,
        }))
    }
}

impl Default for CallEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Reconciles the polled call list, the outgoing room and call history into
/// one view and turns user intents into call-control requests.
///
/// Lock order is `state` before `history`; the snapshot cache takes
/// `history` on its own, so a snapshot is never fetched with `state` held.
pub struct CallEngine {
    config: EngineConfig,
    dialer: DialerConfig,
    api: CallControlApiRef,
    media: MediaSessionRef,
    store: KeyValueStoreRef,
    cache: SnapshotCache,
    history: Arc<Mutex<HistoryStore>>,
    state: Mutex<EngineState>,
    scheduler: Scheduler,
    notifications: NotificationSender,
    view: watch::Sender<CallsView>,
}

/// Wraps an engine method as a timer task that stops doing anything once
/// the engine is gone.
fn engine_task<F, Fut>(engine: &Arc<CallEngine>, f: F) -> TaskFn
where
    F: Fn(Arc<CallEngine>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let weak: Weak<CallEngine> = Arc::downgrade(engine);
    Arc::new(move || {
        let fut = weak.upgrade().map(&f);
        async move {
            if let Some(fut) = fut {
                fut.await;
            }
        }
        .boxed()
    })
}

impl CallEngine {
    /// Loads persisted state and starts the poll timers.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut history = self.history.lock().await;
            match history.load().await {
                Ok(count) => {
                    history.mark_initial_load_complete();
                    info!(count, "call history loaded");
                }
                // leave the load unconfirmed so an empty list never replaces what is on disk
                Err(e) => warn!("failed to load call history: {}", e),
            }
        }
        match RoomIdentityRegistry::load(&self.store).await {
            Ok(registry) => self.state.lock().await.registry = registry,
            Err(e) => warn!("failed to load room registry: {}", e),
        }
        self.schedule_polling();
        Ok(())
    }

    fn schedule_polling(self: &Arc<Self>) {
        self.scheduler.every(
            POLL_TIMER,
            Duration::ZERO,
            self.config.poll_interval(),
            engine_task(self, |engine| async move {
                engine.poll_tick(DetectorSource::GlobalPoll).await
            }),
        );
        let watch_interval = self.config.room_watch_interval();
        self.scheduler.every(
            ROOM_WATCH_TIMER,
            watch_interval,
            watch_interval,
            engine_task(self, |engine| async move { engine.room_watch_tick().await }),
        );
    }

    fn schedule_attempt_monitor(self: &Arc<Self>) {
        let interval = self.config.attempt_monitor_interval();
        self.scheduler.every(
            ATTEMPT_TIMER,
            interval,
            interval,
            engine_task(self, |engine| async move { engine.attempt_tick().await }),
        );
    }

    /// Cancels every timer; no callback fires afterwards.
    pub fn stop_monitoring(&self) {
        self.scheduler.cancel_all();
    }

    pub fn subscribe(&self) -> NotificationReceiver {
        self.notifications.subscribe()
    }

    pub fn watch_view(&self) -> watch::Receiver<CallsView> {
        self.view.subscribe()
    }

    pub fn view(&self) -> CallsView {
        self.view.borrow().clone()
    }

    pub fn is_scheduled(&self, name: &str) -> bool {
        self.scheduler.is_scheduled(name)
    }

    pub async fn history(&self) -> Vec<HistoryEntry> {
        self.history.lock().await.list().to_vec()
    }

    pub async fn clear_history(&self) -> Result<PersistOutcome> {
        let result = self.history.lock().await.clear().await;
        result.map_err(|e| self.reject(e))
    }

    fn notify(&self, notification: Notification) {
        match notification.severity {
            Severity::Error | Severity::Warning => warn!(
                title = notification.title,
                "{}", notification.message
            ),
            _ => info!(title = notification.title, "{}", notification.message),
        }
        self.notifications.send(notification).ok();
    }

    /// Surfaces user-facing errors as a notification and hands them back.
    fn reject(&self, error: Error) -> Error {
        if error.is_user_facing() {
            let title = match &error {
                Error::Conflict(_) => "Not Allowed",
                _ => "Invalid Input",
            };
            self.notify(Notification::new(title, error.to_string(), Severity::Warning));
        }
        error
    }

    fn publish(&self, state: &EngineState) {
        self.view.send_replace(CallsView::of(state));
    }

    async fn persist_history(&self, history: &mut HistoryStore) {
        if !history.is_initial_load_complete() {
            return;
        }
        if let Err(e) = history.persist().await {
            warn!("failed to persist call history: {}", e);
        }
    }

    async fn save_registry(&self) {
        let registry = self.state.lock().await.registry.clone();
        if let Err(e) = registry.save(&self.store).await {
            warn!("failed to save room registry: {}", e);
        }
    }

    /// Fetches (or reuses) a snapshot and runs one reconciliation pass.
    pub async fn refresh(self: &Arc<Self>) {
        self.poll_tick(DetectorSource::GlobalPoll).await
    }

    async fn poll_tick(self: &Arc<Self>, source: DetectorSource) {
        if self.state.lock().await.is_suspended() {
            self.local_tick(source).await;
            return;
        }
        let snapshot = self.cache.get_snapshot().await;
        if let Some(error) = &snapshot.error {
            let failures = self.cache.consecutive_failures().await;
            if failures >= self.config.max_consecutive_failures.max(1) {
                self.suspend_polling(failures, error).await;
                return;
            }
        }
        self.apply_snapshot(&snapshot, source).await;
    }

    /// Runs the local-only part of a tick over the last known list, so an
    /// attempt can still time out while the server is unreachable.
    async fn local_tick(self: &Arc<Self>, source: DetectorSource) {
        if self.state.lock().await.attempt.is_none() {
            debug!(?source, "polling suspended, skipping tick");
            return;
        }
        let snapshot = Snapshot {
            records: self.cache.last_known().await,
            from_cache: true,
            error: Some("polling suspended".to_string()),
        };
        self.apply_snapshot(&snapshot, source).await;
    }

    async fn room_watch_tick(self: &Arc<Self>) {
        if !self.state.lock().await.has_attached_call() {
            return;
        }
        self.poll_tick(DetectorSource::RoomWatch).await
    }

    async fn attempt_tick(self: &Arc<Self>) {
        if self.state.lock().await.attempt.is_none() {
            self.scheduler.cancel(ATTEMPT_TIMER);
            return;
        }
        self.poll_tick(DetectorSource::RoomWatch).await
    }

    async fn apply_snapshot(self: &Arc<Self>, snapshot: &Snapshot, source: DetectorSource) {
        let effects = {
            let mut state = self.state.lock().await;
            let mut history = self.history.lock().await;
            let ctx = TickContext {
                now: Instant::now(),
                wall: Utc::now(),
                source,
                stale: snapshot.error.is_some(),
            };
            let effects = reconcile(&mut state, &mut history, &snapshot.records, &ctx);
            self.persist_history(&mut history).await;
            self.publish(&state);
            effects
        };
        self.apply_effects(effects).await;
    }

    async fn apply_effects(self: &Arc<Self>, effects: Vec<Effect>) {
        for room_name in self.dispatch_effects(effects) {
            if self.media.room_name().as_deref() != Some(room_name.as_str()) {
                continue;
            }
            if let Err(e) = self.media.leave().await {
                warn!(room_name, "failed to leave media session: {}", e);
            }
        }
    }

    /// Carries out the synchronous effects; returns the rooms to leave.
    fn dispatch_effects(self: &Arc<Self>, effects: Vec<Effect>) -> Vec<String> {
        let mut leave = Vec::new();
        for effect in effects {
            match effect {
                Effect::Notify(notification) => self.notify(notification),
                Effect::ScheduleDetach(delay) => self.scheduler.after(
                    DETACH_TIMER,
                    delay,
                    engine_task(self, |engine| async move { engine.detach_tick().await }),
                ),
                Effect::LeaveMedia { room_name } => leave.push(room_name),
                Effect::StopAttemptMonitor => {
                    self.scheduler.cancel(ATTEMPT_TIMER);
                }
            }
        }
        leave
    }

    async fn detach_tick(self: &Arc<Self>) {
        let effects = {
            let mut state = self.state.lock().await;
            let mut history = self.history.lock().await;
            let effects =
                tick::apply_pending_detach(&mut state, &mut history, Instant::now(), Utc::now());
            self.persist_history(&mut history).await;
            self.publish(&state);
            effects
        };
        self.apply_effects(effects).await;
    }

    async fn suspend_polling(&self, failures: u32, error: &str) {
        let mut state = self.state.lock().await;
        if state.is_suspended() {
            return;
        }
        warn!(failures, "call-control unreachable, suspending polling");
        state.polling = PollingState::Suspended {
            reason: error.to_string(),
        };
        self.scheduler.cancel(POLL_TIMER);
        self.scheduler.cancel(ROOM_WATCH_TIMER);
        self.publish(&state);
        self.notify(Notification::error(
            "Call Monitoring Paused",
            format!(
                "Could not reach call control after {} attempts: {}",
                failures, error
            ),
        ));
    }

    /// Restarts polling after it was suspended by repeated failures.
    pub async fn resume_polling(self: &Arc<Self>) {
        let has_attempt = {
            let mut state = self.state.lock().await;
            if !state.is_suspended() {
                return;
            }
            state.polling = PollingState::Running;
            self.publish(&state);
            state.attempt.is_some()
        };
        self.cache.reset_failures().await;
        self.cache.invalidate().await;
        info!("call monitoring resumed");
        self.schedule_polling();
        if has_attempt {
            self.schedule_attempt_monitor();
        }
    }

    /// Creates the booth room used to place outbound calls and joins it.
    pub async fn create_voice_room(self: &Arc<Self>, display_name: &str) -> Result<String> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(self.reject(Error::Validation(
                "display name must not be empty".to_string(),
            )));
        }
        let requested = format!("booth-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        {
            let mut state = self.state.lock().await;
            let EngineState {
                outgoing, registry, ..
            } = &mut *state;
            outgoing
                .create(&requested, display_name, registry, Utc::now())
                .map_err(|e| self.reject(e))?;
            state.flow_step = CallFlowStep::CreatingRoom;
            self.publish(&state);
        }

        let request = CreateRoomRequest::new(
            self.config.room_duration_secs,
            self.config.room_capacity,
            display_name,
        );
        let room_name = match self.api.create_room(&request).await {
            Ok(response) => response.room_name,
            Err(e) => {
                self.abandon_room(CallFlowStep::Failed).await;
                self.notify(Notification::error("Room Creation Failed", e.to_string()));
                return Err(e);
            }
        };

        {
            let mut state = self.state.lock().await;
            let EngineState {
                outgoing, registry, ..
            } = &mut *state;
            outgoing.update_room_name(&room_name, registry)?;
            self.publish(&state);
        }
        self.save_registry().await;

        let join = JoinRequest {
            room_name: room_name.clone(),
            participant_name: display_name.to_string(),
            call_id_hint: None,
        };
        if let Err(e) = self.media.join(join).await {
            self.abandon_room(CallFlowStep::Failed).await;
            let error = Error::TransientFetch(format!("join room {}: {}", room_name, e));
            self.notify(Notification::error("Room Join Failed", error.to_string()));
            return Err(error);
        }

        let mut state = self.state.lock().await;
        state.outgoing.set_media_connected(self.media.is_connected());
        state.flow_step = CallFlowStep::Idle;
        self.publish(&state);
        info!(room_name, "voice room ready");
        Ok(room_name)
    }

    async fn abandon_room(&self, flow_step: CallFlowStep) {
        let mut state = self.state.lock().await;
        state.outgoing.clear_outgoing_room();
        state.flow_step = flow_step;
        self.publish(&state);
    }

    /// Places an outbound call from the booth room, creating it if needed.
    /// Returns the SIP call id when the server assigned one.
    pub async fn place_call(self: &Arc<Self>, number: &str) -> Result<Option<String>> {
        self.place_outbound(number, None).await
    }

    /// Like [`CallEngine::place_call`] but originated by a bot, which starts
    /// speaking immediately and gets the longer establishment window.
    pub async fn place_bot_call(
        self: &Arc<Self>,
        number: &str,
        bot_name: &str,
    ) -> Result<Option<String>> {
        self.place_outbound(number, Some(bot_name)).await
    }

    async fn place_outbound(
        self: &Arc<Self>,
        number: &str,
        bot_name: Option<&str>,
    ) -> Result<Option<String>> {
        let called_number = validate_e164(number).map_err(|e| self.reject(e))?;
        let caller_id_number = match self.dialer.caller_id_number.as_deref() {
            Some(number) => validate_e164(number).map_err(|e| self.reject(e))?,
            None => {
                return Err(self.reject(Error::Validation(
                    "dialer.caller_id_number is not configured".to_string(),
                )))
            }
        };
        let initiator_name = bot_name
            .map(str::to_string)
            .or_else(|| self.dialer.initiator_name.clone())
            .unwrap_or_else(|| DEFAULT_INITIATOR.to_string());

        let existing = {
            let state = self.state.lock().await;
            if state.attempt.is_some() || state.has_attached_call() {
                drop(state);
                return Err(self.reject(Error::Conflict(
                    "a call is already in progress".to_string(),
                )));
            }
            state
                .outgoing
                .state()
                .filter(|s| s.is_active)
                .map(|s| s.room_name.clone())
        };
        let room_name = match existing {
            Some(room_name) => room_name,
            None => self.create_voice_room(&initiator_name).await?,
        };

        let (kind, timeout) = match bot_name {
            Some(_) => (AttemptKind::Bot, self.config.bot_attempt_timeout()),
            None => (AttemptKind::Generic, self.config.attempt_timeout()),
        };
        let request = OriginateRequest {
            room_name: room_name.clone(),
            called_number: called_number.clone(),
            caller_id_number,
            initiator_name,
            start_with_initiator_audio: bot_name.map(|_| true),
        };
        {
            let mut state = self.state.lock().await;
            state.flow_step = CallFlowStep::Dialing;
            self.publish(&state);
        }
        info!(room_name, called_number, ?kind, "placing outbound call");

        let response = match self.api.originate_call(&request).await {
            Ok(response) => response,
            Err(e) => {
                let mut state = self.state.lock().await;
                state.flow_step = CallFlowStep::Failed;
                self.publish(&state);
                drop(state);
                self.notify(Notification::call_failed(e.to_string()));
                return Err(e);
            }
        };

        {
            let mut state = self.state.lock().await;
            let EngineState {
                outgoing, registry, ..
            } = &mut *state;
            if let Err(e) = outgoing.update_room_name(&response.room_name, registry) {
                warn!(
                    room_name,
                    assigned = response.room_name,
                    "ignoring room name from originate: {}",
                    e
                );
            }
            let room_name = outgoing
                .state()
                .map(|s| s.room_name.clone())
                .unwrap_or(response.room_name.clone());
            state.attempt = Some(CallAttempt {
                sip_call_id: response.sip_call_id.clone(),
                room_name: room_name.clone(),
                target: called_number.clone(),
                kind,
                started_at: Instant::now(),
                timeout,
                answered: false,
                record_id: None,
                local_id: uuid::Uuid::new_v4().to_string(),
            });

            // without a sip call id the local record could never be matched again
            if let Some(sip_call_id) = &response.sip_call_id {
                let record = CallRecord {
                    id: sip_call_id.clone(),
                    sip_call_id: Some(sip_call_id.clone()),
                    status: CallStatus::Connecting,
                    direction: CallDirection::Outbound,
                    room_name: Some(room_name),
                    called_uri: Some(called_number),
                    start_time: Some(Utc::now()),
                    ..Default::default()
                };
                let mut history = self.history.lock().await;
                history.upsert(&record, Utc::now());
                self.persist_history(&mut history).await;
            }
            self.publish(&state);
        }
        self.save_registry().await;
        self.cache.invalidate().await;
        self.schedule_attempt_monitor();
        Ok(response.sip_call_id)
    }

    pub async fn hang_up(self: &Arc<Self>, call_id: &str) -> Result<()> {
        if call_id.trim().is_empty() {
            return Err(self.reject(Error::Validation("call id must not be empty".to_string())));
        }
        if let Err(e) = self.api.end_call(call_id).await {
            self.notify(Notification::error("Hang Up Failed", e.to_string()));
            return Err(e);
        }
        info!(call_id, "call hung up");

        let mut notifications = Vec::new();
        let mut stop_monitor = false;
        {
            let mut state = self.state.lock().await;
            let mut history = self.history.lock().await;
            history.mark_terminated(call_id, Utc::now());
            self.persist_history(&mut history).await;
            drop(history);

            let room = state
                .outgoing
                .state()
                .filter(|s| s.sip_call_id.as_deref() == Some(call_id))
                .cloned();
            if let Some(room) = room {
                state.outgoing.clear_call_from_room();
                let key = NotificationDedupKey::new(&room.room_name, Some(call_id));
                if state.detector.claim(key) {
                    notifications.push(Notification::call_ended(&room.room_name));
                }
            }
            if state
                .attempt
                .as_ref()
                .is_some_and(|a| a.sip_call_id.as_deref() == Some(call_id))
            {
                let answered = state.attempt.take().is_some_and(|a| a.answered);
                state.flow_step = if answered {
                    CallFlowStep::Ended
                } else {
                    CallFlowStep::Idle
                };
                stop_monitor = true;
            }
            self.publish(&state);
        }
        if stop_monitor {
            self.scheduler.cancel(ATTEMPT_TIMER);
        }
        for notification in notifications {
            self.notify(notification);
        }
        self.cache.invalidate().await;
        Ok(())
    }

    pub async fn hold(&self, call_id: &str) -> Result<()> {
        self.set_hold(call_id, true).await
    }

    pub async fn unhold(&self, call_id: &str) -> Result<()> {
        self.set_hold(call_id, false).await
    }

    async fn set_hold(&self, call_id: &str, on_hold: bool) -> Result<()> {
        let ended = self
            .history
            .lock()
            .await
            .get(call_id)
            .filter(|e| e.status.is_terminal())
            .map(|e| e.status.clone());
        if let Some(status) = ended {
            // the next tick reports the end through the detector
            debug!(call_id, %status, "hold change on a call that already ended");
            self.cache.invalidate().await;
            return Err(Error::TerminalCall {
                call: call_id.to_string(),
                status,
            });
        }
        let result = if on_hold {
            self.api.hold_call(call_id).await
        } else {
            self.api.unhold_call(call_id).await
        };
        if let Err(e) = result {
            let title = if on_hold { "Hold Failed" } else { "Resume Failed" };
            self.notify(Notification::error(title, e.to_string()));
            return Err(e);
        }
        info!(call_id, on_hold, "hold state changed");
        self.cache.invalidate().await;
        Ok(())
    }

    /// Leaves the media session and closes the booth room.
    pub async fn disconnect_room(&self) {
        if let Err(e) = self.media.leave().await {
            warn!("failed to leave media session: {}", e);
        }
        self.scheduler.cancel(ATTEMPT_TIMER);
        self.scheduler.cancel(DETACH_TIMER);
        let mut state = self.state.lock().await;
        state.outgoing.clear_outgoing_room();
        state.joined_room = None;
        state.attempt = None;
        state.flow_step = CallFlowStep::Idle;
        self.publish(&state);
    }

    /// Joins a room, picking a participant name that does not collide with
    /// the one recorded for it or with the current roster.
    pub async fn join_room(&self, room_name: &str, participant_name: &str) -> Result<String> {
        if room_name.trim().is_empty() || participant_name.trim().is_empty() {
            return Err(self.reject(Error::Validation(
                "room and participant name must not be empty".to_string(),
            )));
        }
        let roster: Vec<String> = self
            .media
            .participants()
            .into_iter()
            .map(|p| p.name)
            .collect();
        let (negotiated, call_id_hint) = {
            let state = self.state.lock().await;
            let negotiated =
                state
                    .registry
                    .negotiate_participant_name(room_name, participant_name, &roster);
            let call_id_hint = match state.outgoing.state().filter(|s| s.matches_room(room_name)) {
                Some(room) => room.sip_call_id.clone(),
                None => state
                    .active_calls
                    .iter()
                    .find(|r| r.in_room(room_name))
                    .and_then(|r| r.sip_call_id.clone()),
            };
            (negotiated, call_id_hint)
        };
        let request = JoinRequest {
            room_name: room_name.to_string(),
            participant_name: negotiated.clone(),
            call_id_hint,
        };
        self.media.join(request).await.map_err(|e| {
            Error::TransientFetch(format!("join room {}: {}", room_name, e))
        })?;

        let mut state = self.state.lock().await;
        let own_room = state
            .outgoing
            .state()
            .is_some_and(|s| s.matches_room(room_name));
        if own_room {
            state.outgoing.set_media_connected(true);
            state.joined_room = None;
        } else {
            state.joined_room = Some(JoinedRoom {
                room_name: room_name.to_string(),
                last_sip_call_id: None,
                saw_call: false,
            });
        }
        self.publish(&state);
        info!(room_name, participant = negotiated, "joined room");
        Ok(negotiated)
    }

    /// Moves the media session to another room without the move being
    /// reported as a dropped call.
    pub async fn switch_room(&self, room_name: &str, participant_name: &str) -> Result<String> {
        {
            let mut state = self.state.lock().await;
            let window = self.config.switch_suppression();
            state.detector.suppress_for(window, Instant::now());
        }
        if let Err(e) = self.media.leave().await {
            warn!("failed to leave media session before switch: {}", e);
        }
        {
            let mut state = self.state.lock().await;
            state.outgoing.set_media_connected(false);
            state.joined_room = None;
        }
        self.join_room(room_name, participant_name).await
    }

    pub async fn handle_media_event(&self, event: MediaEvent) {
        debug!(?event, "media event");
        let mut notifications = Vec::new();
        {
            let mut state = self.state.lock().await;
            match &event {
                MediaEvent::Connected { room_name } | MediaEvent::Disconnected { room_name } => {
                    let connected = matches!(event, MediaEvent::Connected { .. });
                    if state
                        .outgoing
                        .state()
                        .is_some_and(|s| s.matches_room(room_name))
                    {
                        state.outgoing.set_media_connected(connected);
                    }
                }
                MediaEvent::RoomEnded { room_name } => {
                    let room = state
                        .outgoing
                        .state()
                        .filter(|s| s.matches_room(room_name))
                        .cloned();
                    if let Some(room) = room {
                        if room.has_active_sip_call {
                            if state.detector.claim(NotificationDedupKey::for_room(&room)) {
                                notifications.push(Notification::call_ended(&room.room_name));
                            }
                            if let Some(sip) = &room.sip_call_id {
                                let mut history = self.history.lock().await;
                                history.mark_terminated(sip, Utc::now());
                                self.persist_history(&mut history).await;
                            }
                        }
                        state.outgoing.clear_outgoing_room();
                        if state.attempt.take().is_some() {
                            self.scheduler.cancel(ATTEMPT_TIMER);
                        }
                        state.flow_step = CallFlowStep::Ended;
                        info!(room_name, "outgoing room ended by server");
                    }
                    if state
                        .joined_room
                        .as_ref()
                        .is_some_and(|j| &j.room_name == room_name)
                    {
                        state.joined_room = None;
                    }
                }
            }
            self.publish(&state);
        }
        for notification in notifications {
            self.notify(notification);
        }
    }

    /// Collapsing the call view would drop an embedded live connection.
    pub async fn ensure_view_collapsible(&self) -> Result<()> {
        let room_connected = self
            .state
            .lock()
            .await
            .outgoing
            .state()
            .is_some_and(|s| s.is_media_connected);
        if room_connected || self.media.is_connected() {
            return Err(self.reject(Error::Conflict(
                "disconnect from the room before collapsing the call view".to_string(),
            )));
        }
        Ok(())
    }
}
