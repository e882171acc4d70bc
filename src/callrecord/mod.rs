use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt};

mod wire;
pub use wire::{parse_call, parse_call_list};


#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Inbound,
    Outbound,
    #[default]
    Unknown,
}

impl CallDirection {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbound" | "incoming" | "in" => CallDirection::Inbound,
            "outbound" | "outgoing" | "out" => CallDirection::Outbound,
            _ => CallDirection::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
            CallDirection::Unknown => "unknown",
        }
    }
}

/// Call status as reported by the call-control API.
///
/// Parsing is case-insensitive and never fails: values this client does not
/// know about land in [`CallStatus::Other`] and are treated as non-terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CallStatus {
    #[default]
    Connecting,
    Ringing,
    Active,
    OnHold,
    Terminated,
    Failed,
    Completed,
    Rejected,
    Cancelled,
    Other(String),
}

impl CallStatus {
    pub fn parse(value: &str) -> Self {
        let normalized = value.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        match normalized.as_str() {
            "connecting" | "initiating" | "dialing" => CallStatus::Connecting,
            "ringing" | "early" => CallStatus::Ringing,
            "connected" | "active" | "answered" => CallStatus::Active,
            "on-hold" | "onhold" | "hold" | "held" => CallStatus::OnHold,
            "terminated" | "ended" => CallStatus::Terminated,
            "failed" => CallStatus::Failed,
            "completed" => CallStatus::Completed,
            "rejected" => CallStatus::Rejected,
            "cancelled" | "canceled" => CallStatus::Cancelled,
            _ => CallStatus::Other(value.trim().to_string()),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Terminated
                | CallStatus::Failed
                | CallStatus::Completed
                | CallStatus::Rejected
                | CallStatus::Cancelled
        )
    }

    /// Media is flowing: answered, possibly held.
    pub fn is_established(&self) -> bool {
        matches!(self, CallStatus::Active | CallStatus::OnHold)
    }

    pub fn as_str(&self) -> &str {
        match self {
            CallStatus::Connecting => "connecting",
            CallStatus::Ringing => "ringing",
            CallStatus::Active => "active",
            CallStatus::OnHold => "on-hold",
            CallStatus::Terminated => "terminated",
            CallStatus::Failed => "failed",
            CallStatus::Completed => "completed",
            CallStatus::Rejected => "rejected",
            CallStatus::Cancelled => "cancelled",
            CallStatus::Other(raw) => raw.as_str(),
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for CallStatus {
    fn from(value: String) -> Self {
        CallStatus::parse(&value)
    }
}

impl From<CallStatus> for String {
    fn from(value: CallStatus) -> Self {
        value.as_str().to_string()
    }
}

/// One telephony call as known to the call-control API at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub id: String,
    pub sip_call_id: Option<String>,
    pub status: CallStatus,
    pub direction: CallDirection,
    pub room_name: Option<String>,
    pub caller_id_raw: Option<String>,
    pub called_uri: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<u64>,
    pub on_hold: bool,
    pub active_media_source: Option<String>,
    pub human_participant_name: Option<String>,
}

impl CallRecord {
    /// Resolved identity: `sip_call_id` when present, else the local `id`.
    pub fn identity(&self) -> &str {
        match self.sip_call_id.as_deref() {
            Some(sip) if !sip.is_empty() => sip,
            _ => self.id.as_str(),
        }
    }

    pub fn matches_identity(&self, identity: &str) -> bool {
        self.id == identity || self.sip_call_id.as_deref() == Some(identity)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn in_room(&self, room_name: &str) -> bool {
        self.room_name.as_deref() == Some(room_name)
    }

    pub fn projection(&self) -> CallProjection {
        CallProjection {
            call_id: self.id.clone(),
            sip_call_id: self.sip_call_id.clone(),
            status: self.status.clone(),
            called_uri: self.called_uri.clone(),
            caller_id_raw: self.caller_id_raw.clone(),
            start_time: self.start_time,
            on_hold: self.on_hold,
            human_participant_name: self.human_participant_name.clone(),
        }
    }
}

/// Reduced view of a call kept on the outgoing room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallProjection {
    /// Server-side record id; identifies calls that never got a SIP call id.
    #[serde(default)]
    pub call_id: String,
    pub sip_call_id: Option<String>,
    pub status: CallStatus,
    pub called_uri: Option<String>,
    pub caller_id_raw: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub on_hold: bool,
    pub human_participant_name: Option<String>,
}

/// Non-terminal calls of a snapshot, one per resolved identity.
///
/// A record seen later in the snapshot replaces an earlier one with the same
/// `sip_call_id` or `id`, and keeps the earlier position in the list.
pub fn active_calls(records: &[CallRecord]) -> Vec<CallRecord> {
    let mut active: Vec<CallRecord> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for record in records.iter().filter(|r| !r.is_terminal()) {
        let existing = record
            .sip_call_id
            .as_ref()
            .and_then(|sip| index.get(sip))
            .or_else(|| index.get(&record.id))
            .copied();
        let slot = match existing {
            Some(slot) => {
                active[slot] = record.clone();
                slot
            }
            None => {
                active.push(record.clone());
                active.len() - 1
            }
        };
        index.insert(record.id.clone(), slot);
        if let Some(sip) = &record.sip_call_id {
            index.insert(sip.clone(), slot);
        }
    }
    active
}
