use crate::{
    callrecord::{CallDirection, CallRecord},
    error::Result,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

mod http;
mod phone;
pub use http::HttpCallControl;
pub use phone::validate_e164;


#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginateRequest {
    pub room_name: String,
    pub called_number: String,
    pub caller_id_number: String,
    pub initiator_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_with_initiator_audio: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginateResponse {
    pub sip_call_id: Option<String>,
    pub room_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomRequest {
    pub action: String,
    pub duration: u64,
    pub capacity: u32,
    pub user_name: String,
}

impl CreateRoomRequest {
    pub fn new(duration: u64, capacity: u32, user_name: &str) -> Self {
        Self {
            action: "create".to_string(),
            duration,
            capacity,
            user_name: user_name.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoomResponse {
    pub room_name: String,
}

/// The remote call-control service.
#[async_trait]
pub trait CallControlApi: Send + Sync {
    async fn list_calls(&self, direction: Option<CallDirection>) -> Result<Vec<CallRecord>>;
    async fn originate_call(&self, request: &OriginateRequest) -> Result<OriginateResponse>;
    async fn end_call(&self, call_id: &str) -> Result<()>;
    async fn hold_call(&self, call_id: &str) -> Result<()>;
    async fn unhold_call(&self, call_id: &str) -> Result<()>;
    async fn create_room(&self, request: &CreateRoomRequest) -> Result<CreateRoomResponse>;
}

pub type CallControlApiRef = Arc<dyn CallControlApi>;
