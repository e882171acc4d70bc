use super::{
    CallControlApi, CreateRoomRequest, CreateRoomResponse, OriginateRequest, OriginateResponse,
};
use crate::{
    callrecord::{parse_call_list, CallDirection, CallRecord},
    config::ApiConfig,
    error::{Error, Result},
    version::get_useragent,
};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashMap, time::Duration, time::Instant};
use tracing::{debug, warn};
use url::Url;

/// Call-control API over HTTPS/JSON.
pub struct HttpCallControl {
    client: Client,
    base_url: Url,
    api_key: Option<String>,
    headers: HashMap<String, String>,
}

impl HttpCallControl {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let Some(base_url) = config.base_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Err(Error::Validation("api.base_url is not configured".to_string()));
        };
        // without the trailing slash Url::join would drop the last path segment
        let base_url = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{}/", base_url))?
        };
        let client = Client::builder()
            .user_agent(get_useragent())
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            headers: config.headers.clone().unwrap_or_default(),
        })
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let url = self.base_url.join(path.trim_start_matches('/'))?;
        Ok(self.request_url(method, url))
    }

    fn request_url(&self, method: Method, url: Url) -> RequestBuilder {
        let mut request = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }
        request
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Value> {
        let start_time = Instant::now();
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let body: Value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        debug!(
            what,
            status = status.as_u16(),
            elapsed = start_time.elapsed().as_millis(),
            "call-control request"
        );

        if !status.is_success() {
            let message = error_message(&body).unwrap_or_else(|| status.to_string());
            warn!(what, status = status.as_u16(), error = %message, "call-control request failed");
            return Err(Error::TransientFetch(format!("{}: {}", what, message)));
        }
        if body.get("success").and_then(Value::as_bool) == Some(false) {
            let message = error_message(&body).unwrap_or_else(|| "request rejected".to_string());
            return Err(Error::TransientFetch(format!("{}: {}", what, message)));
        }
        Ok(body)
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, payload: &T, what: &str) -> Result<Value> {
        let request = self.request(Method::POST, path)?.json(payload);
        self.send(request, what).await
    }

    async fn call_action(&self, call_id: &str, action: &str) -> Result<()> {
        if call_id.trim().is_empty() {
            return Err(Error::Validation("call id must not be empty".to_string()));
        }
        let mut url = self.base_url.join("calls/")?;
        url.path_segments_mut()
            .map_err(|_| Error::Validation("api.base_url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push(call_id)
            .push(action);
        let request = self
            .request_url(Method::POST, url)
            .json(&serde_json::json!({}));
        self.send(request, action).await?;
        Ok(())
    }
}

#[async_trait]
impl CallControlApi for HttpCallControl {
    async fn list_calls(&self, direction: Option<CallDirection>) -> Result<Vec<CallRecord>> {
        let mut request = self.request(Method::GET, "calls")?;
        if let Some(direction) = direction.filter(|d| *d != CallDirection::Unknown) {
            request = request.query(&[("direction", direction.as_str())]);
        }
        let body = self.send(request, "list calls").await?;
        Ok(parse_call_list(&body))
    }

    async fn originate_call(&self, request: &OriginateRequest) -> Result<OriginateResponse> {
        let body = self.post("calls/outgoing", request, "originate call").await?;
        let body = unwrap_envelope(&body);
        Ok(OriginateResponse {
            sip_call_id: string_at(body, &["sipCallId", "sip_call_id", "callId"]),
            room_name: string_at(body, &["roomName", "room_name"])
                .unwrap_or_else(|| request.room_name.clone()),
        })
    }

    async fn end_call(&self, call_id: &str) -> Result<()> {
        self.call_action(call_id, "end").await
    }

    async fn hold_call(&self, call_id: &str) -> Result<()> {
        self.call_action(call_id, "hold").await
    }

    async fn unhold_call(&self, call_id: &str) -> Result<()> {
        self.call_action(call_id, "unhold").await
    }

    async fn create_room(&self, request: &CreateRoomRequest) -> Result<CreateRoomResponse> {
        let body = self.post("rooms", request, "create room").await?;
        let body = unwrap_envelope(&body);
        match string_at(body, &["roomName", "room_name", "name"]) {
            Some(room_name) => Ok(CreateRoomResponse { room_name }),
            None => Err(Error::TransientFetch(
                "create room: response carries no room name".to_string(),
            )),
        }
    }
}

/// `{data: {...}}` and `{result: {...}}` wrap the payload in some deployments.
pub(super) fn unwrap_envelope(body: &Value) -> &Value {
    ["data", "result"]
        .iter()
        .find_map(|key| body.get(*key).filter(|v| v.is_object()))
        .unwrap_or(body)
}

pub(super) fn string_at(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| body.get(*key))
        .find_map(|v| v.as_str().filter(|s| !s.is_empty()).map(str::to_string))
}

pub(super) fn error_message(body: &Value) -> Option<String> {
    match body {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Object(_) => string_at(body, &["error", "message", "detail"]).or_else(|| {
            body.get("error")
                .and_then(|e| string_at(e, &["message", "detail"]))
        }),
        _ => None,
    }
}
