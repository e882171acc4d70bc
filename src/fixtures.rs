//! Scripted collaborators shared by the unit tests.
use crate::{
    api::{
        CallControlApi, CreateRoomRequest, CreateRoomResponse, OriginateRequest,
        OriginateResponse,
    },
    callrecord::{CallDirection, CallRecord, CallStatus},
    error::{Error, Result},
    media::{JoinRequest, MediaSession, Participant},
};
use async_trait::async_trait;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Mutex,
};

pub fn call(sip_call_id: &str, room_name: &str, status: CallStatus) -> CallRecord {
    CallRecord {
        id: format!("id-{}", sip_call_id),
        sip_call_id: Some(sip_call_id.to_string()),
        status,
        direction: CallDirection::Outbound,
        room_name: Some(room_name.to_string()),
        called_uri: Some("sip:+15551234567@trunk".to_string()),
        ..Default::default()
    }
}

/// Call-control server whose call list is set by the test.
#[derive(Default)]
pub struct ScriptedApi {
    calls: Mutex<Vec<CallRecord>>,
    failures_left: AtomicUsize,
    pub list_count: AtomicUsize,
    pub originated: Mutex<Vec<OriginateRequest>>,
    pub ended: Mutex<Vec<String>>,
    pub held: Mutex<Vec<(String, bool)>>,
    /// Name the server assigns to created rooms; echoes the request when unset.
    pub server_room_name: Mutex<Option<String>>,
    pub originate_sip_call_id: Mutex<Option<String>>,
    pub reject_actions: AtomicBool,
}

impl ScriptedApi {
    pub fn set_calls(&self, calls: Vec<CallRecord>) {
        if let Ok(mut current) = self.calls.lock() {
            *current = calls;
        }
    }

    pub fn fail_next(&self, count: usize) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn list_count(&self) -> usize {
        self.list_count.load(Ordering::SeqCst)
    }

    fn action(&self) -> Result<()> {
        if self.reject_actions.load(Ordering::SeqCst) {
            return Err(Error::TransientFetch("action rejected".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CallControlApi for ScriptedApi {
    async fn list_calls(&self, _direction: Option<CallDirection>) -> Result<Vec<CallRecord>> {
        self.list_count.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::TransientFetch("connection refused".to_string()));
        }
        Ok(self.calls.lock().unwrap().clone())
    }

    async fn originate_call(&self, request: &OriginateRequest) -> Result<OriginateResponse> {
        self.originated.lock().unwrap().push(request.clone());
        Ok(OriginateResponse {
            sip_call_id: self.originate_sip_call_id.lock().unwrap().clone(),
            room_name: request.room_name.clone(),
        })
    }

    async fn end_call(&self, call_id: &str) -> Result<()> {
        self.action()?;
        self.ended.lock().unwrap().push(call_id.to_string());
        Ok(())
    }

    async fn hold_call(&self, call_id: &str) -> Result<()> {
        self.action()?;
        self.held.lock().unwrap().push((call_id.to_string(), true));
        Ok(())
    }

    async fn unhold_call(&self, call_id: &str) -> Result<()> {
        self.action()?;
        self.held.lock().unwrap().push((call_id.to_string(), false));
        Ok(())
    }

    async fn create_room(&self, _request: &CreateRoomRequest) -> Result<CreateRoomResponse> {
        match self.server_room_name.lock().unwrap().clone() {
            Some(room_name) => Ok(CreateRoomResponse { room_name }),
            None => Err(Error::TransientFetch("room service unavailable".to_string())),
        }
    }
}

/// Media session that records what the engine asked of it.
#[derive(Default)]
pub struct RecordingMedia {
    current: Mutex<Option<JoinRequest>>,
    pub joins: Mutex<Vec<JoinRequest>>,
    pub leaves: AtomicUsize,
    pub roster: Mutex<Vec<Participant>>,
}

impl RecordingMedia {
    pub fn leave_count(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.joins
            .lock()
            .unwrap()
            .iter()
            .map(|j| j.room_name.clone())
            .collect()
    }
}

#[async_trait]
impl MediaSession for RecordingMedia {
    fn room_name(&self) -> Option<String> {
        self.current
            .lock()
            .unwrap()
            .as_ref()
            .map(|j| j.room_name.clone())
    }

    fn is_connected(&self) -> bool {
        self.current.lock().unwrap().is_some()
    }

    fn participants(&self) -> Vec<Participant> {
        self.roster.lock().unwrap().clone()
    }

    async fn join(&self, request: JoinRequest) -> anyhow::Result<()> {
        self.joins.lock().unwrap().push(request.clone());
        *self.current.lock().unwrap() = Some(request);
        Ok(())
    }

    async fn leave(&self) -> anyhow::Result<()> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        *self.current.lock().unwrap() = None;
        Ok(())
    }
}
