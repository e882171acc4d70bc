use super::{CallDirection, CallRecord, CallStatus};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::warn;

const ENVELOPE_KEYS: [&str; 4] = ["calls", "data", "result", "items"];
const MAX_ENVELOPE_DEPTH: usize = 3;

/// Decodes a `GET /calls` response body.
///
/// Accepts a bare array or an array nested under one of the usual envelope
/// keys. Entries that cannot be decoded are skipped.
pub fn parse_call_list(body: &Value) -> Vec<CallRecord> {
    let Some(items) = find_call_array(body, 0) else {
        warn!("call list response has no call array");
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let record = parse_call(item);
            if record.is_none() {
                warn!(item = %item, "skipping call entry without identity");
            }
            record
        })
        .collect()
}

fn find_call_array(body: &Value, depth: usize) -> Option<&Vec<Value>> {
    match body {
        Value::Array(items) => Some(items),
        Value::Object(obj) if depth < MAX_ENVELOPE_DEPTH => ENVELOPE_KEYS
            .iter()
            .filter_map(|key| obj.get(*key))
            .find_map(|inner| find_call_array(inner, depth + 1)),
        _ => None,
    }
}

/// Decodes one call object, tolerating camelCase and snake_case keys.
/// Returns `None` when neither an id nor a SIP call id is present.
pub fn parse_call(item: &Value) -> Option<CallRecord> {
    let obj = item.as_object()?;
    let sip_call_id = string_field(obj, &["sipCallId", "sip_call_id", "callId", "call_id"]);
    let id = string_field(obj, &["id", "_id", "uuid"]).or_else(|| sip_call_id.clone())?;

    let status = string_field(obj, &["status", "state", "callStatus"])
        .map(|s| CallStatus::parse(&s))
        .unwrap_or_default();
    let on_hold = bool_field(obj, &["onHold", "on_hold", "held"]).unwrap_or(false)
        || status == CallStatus::OnHold;

    Some(CallRecord {
        id,
        sip_call_id,
        direction: string_field(obj, &["direction"])
            .map(|d| CallDirection::parse(&d))
            .unwrap_or_default(),
        room_name: string_field(obj, &["roomName", "room_name", "room"]),
        caller_id_raw: string_field(obj, &["callerIdRaw", "callerId", "caller_id", "caller", "from"]),
        called_uri: string_field(obj, &["calledUri", "called_uri", "calledNumber", "callee", "to"]),
        start_time: time_field(obj, &["startTime", "start_time", "startedAt", "createdAt"]),
        end_time: time_field(obj, &["endTime", "end_time", "endedAt"]),
        duration_seconds: u64_field(obj, &["durationSeconds", "duration_seconds", "duration"]),
        active_media_source: string_field(
            obj,
            &["activeMediaSource", "active_media_source", "mediaSource"],
        ),
        human_participant_name: string_field(
            obj,
            &["humanParticipantName", "human_participant_name", "participantName"],
        ),
        status,
        on_hold,
    })
}

fn first<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| obj.get(*key))
        .find(|v| !v.is_null())
}

fn string_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match first(obj, keys)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn bool_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<bool> {
    match first(obj, keys)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        Value::Number(n) => n.as_u64().map(|v| v != 0),
        _ => None,
    }
}

fn u64_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<u64> {
    match first(obj, keys)? {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn time_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<DateTime<Utc>> {
    match first(obj, keys)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().and_then(epoch_to_time)),
        Value::Number(n) => n.as_i64().and_then(epoch_to_time),
        _ => None,
    }
}

// values above 1e11 are taken as milliseconds
fn epoch_to_time(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}
