use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub room_name: String,
    pub participant_name: String,
    /// Correlates the media leg with a SIP call when one is known.
    pub call_id_hint: Option<String>,
}

/// Events the media layer feeds back into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    Connected { room_name: String },
    Disconnected { room_name: String },
    /// The server closed the room.
    RoomEnded { room_name: String },
}

/// Handle on the live audio room. The engine only needs its identity,
/// roster and the ability to join or leave.
#[async_trait]
pub trait MediaSession: Send + Sync {
    fn room_name(&self) -> Option<String>;
    fn is_connected(&self) -> bool;
    fn participants(&self) -> Vec<Participant>;
    async fn join(&self, request: JoinRequest) -> Result<()>;
    async fn leave(&self) -> Result<()>;
}

pub type MediaSessionRef = Arc<dyn MediaSession>;

/// Media session that tracks membership without carrying any audio.
#[derive(Default)]
pub struct DetachedMediaSession {
    current: Mutex<Option<JoinRequest>>,
}

#[async_trait]
impl MediaSession for DetachedMediaSession {
    fn room_name(&self) -> Option<String> {
        self.current
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|r| r.room_name.clone()))
    }

    fn is_connected(&self) -> bool {
        self.current.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    fn participants(&self) -> Vec<Participant> {
        self.current
            .lock()
            .ok()
            .and_then(|c| {
                c.as_ref().map(|r| {
                    vec![Participant {
                        id: "local".to_string(),
                        name: r.participant_name.clone(),
                        muted: false,
                    }]
                })
            })
            .unwrap_or_default()
    }

    async fn join(&self, request: JoinRequest) -> Result<()> {
        info!(
            room_name = request.room_name,
            participant = request.participant_name,
            "media session joined"
        );
        if let Ok(mut current) = self.current.lock() {
            *current = Some(request);
        }
        Ok(())
    }

    async fn leave(&self) -> Result<()> {
        if let Ok(mut current) = self.current.lock() {
            if let Some(previous) = current.take() {
                info!(room_name = previous.room_name, "media session left");
            }
        }
        Ok(())
    }
}
