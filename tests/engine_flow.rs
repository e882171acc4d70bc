use async_trait::async_trait;
use callbridge::{
    api::{
        CallControlApi, CreateRoomRequest, CreateRoomResponse, OriginateRequest,
        OriginateResponse,
    },
    callrecord::{CallDirection, CallRecord, CallStatus},
    config::Config,
    engine::{CallEngineBuilder, CallFlowStep},
    storage::{create_store, KeyValueStoreRef, StorageConfig, CALL_HISTORY_KEY},
    Error, Result,
};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

#[derive(Default)]
struct FakeServer {
    calls: Mutex<Vec<CallRecord>>,
}

impl FakeServer {
    fn set(&self, calls: Vec<CallRecord>) {
        *self.calls.lock().unwrap() = calls;
    }
}

#[async_trait]
impl CallControlApi for FakeServer {
    async fn list_calls(&self, _direction: Option<CallDirection>) -> Result<Vec<CallRecord>> {
        Ok(self.calls.lock().unwrap().clone())
    }

    async fn originate_call(&self, request: &OriginateRequest) -> Result<OriginateResponse> {
        Ok(OriginateResponse {
            sip_call_id: Some("sip-1".to_string()),
            room_name: request.room_name.clone(),
        })
    }

    async fn end_call(&self, _call_id: &str) -> Result<()> {
        Ok(())
    }

    async fn hold_call(&self, _call_id: &str) -> Result<()> {
        Ok(())
    }

    async fn unhold_call(&self, _call_id: &str) -> Result<()> {
        Ok(())
    }

    async fn create_room(&self, _request: &CreateRoomRequest) -> Result<CreateRoomResponse> {
        Ok(CreateRoomResponse {
            room_name: "room-42".to_string(),
        })
    }
}

fn record(sip: &str, room: &str, status: CallStatus) -> CallRecord {
    CallRecord {
        id: sip.to_string(),
        sip_call_id: Some(sip.to_string()),
        status,
        direction: CallDirection::Outbound,
        room_name: Some(room.to_string()),
        ..Default::default()
    }
}

fn config() -> Config {
    let mut config = Config::default();
    config.engine.snapshot_freshness_ms = 0;
    config.engine.detach_grace_ms = 0;
    config.dialer.caller_id_number = Some("+15550001111".to_string());
    config
}

fn file_store(path: &std::path::Path) -> KeyValueStoreRef {
    create_store(&StorageConfig::Local {
        path: path.to_string_lossy().to_string(),
    })
    .unwrap()
}

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = tempdir().unwrap();
    let server = Arc::new(FakeServer::default());

    let engine = CallEngineBuilder::new()
        .with_config(config())
        .with_api(server.clone())
        .with_store(file_store(dir.path()))
        .build()
        .unwrap();
    engine.start().await.unwrap();
    engine.stop_monitoring();

    engine.place_call("+15551234567").await.unwrap();
    server.set(vec![record("sip-1", "room-42", CallStatus::Active)]);
    engine.refresh().await;
    assert_eq!(engine.view().flow_step, CallFlowStep::Connected);
    server.set(vec![]);
    engine.refresh().await;
    engine.stop_monitoring();
    drop(engine);

    let restarted = CallEngineBuilder::new()
        .with_config(config())
        .with_api(server.clone())
        .with_store(file_store(dir.path()))
        .build()
        .unwrap();
    restarted.start().await.unwrap();
    restarted.stop_monitoring();
    let history = restarted.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].sip_call_id.as_deref(), Some("sip-1"));
    assert_eq!(history[0].status, CallStatus::Terminated);
    assert!(history[0].duration_seconds.is_some());
}

#[tokio::test]
async fn test_empty_poll_before_load_keeps_persisted_history() {
    let dir = tempdir().unwrap();
    let store = file_store(dir.path());
    let persisted = serde_json::json!([{
        "id": "old",
        "sipCallId": "old",
        "status": "completed",
        "direction": "inbound",
        "startTime": "2024-05-01T10:00:00Z",
        "endTime": "2024-05-01T10:02:00Z",
        "durationSeconds": 120
    }])
    .to_string();
    store.put(CALL_HISTORY_KEY, persisted.clone()).await.unwrap();

    let server = Arc::new(FakeServer::default());
    let engine = CallEngineBuilder::new()
        .with_config(config())
        .with_api(server)
        .with_store(store.clone())
        .build()
        .unwrap();

    // a poll lands before the persisted history was read
    engine.refresh().await;
    assert_eq!(
        store.get(CALL_HISTORY_KEY).await.unwrap().as_deref(),
        Some(persisted.as_str())
    );

    engine.start().await.unwrap();
    engine.stop_monitoring();
    let history = engine.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, CallStatus::Completed);
    assert_eq!(history[0].duration_seconds, Some(120));
}

#[tokio::test]
async fn test_invalid_number_never_reaches_server() {
    let server = Arc::new(FakeServer::default());
    let engine = CallEngineBuilder::new()
        .with_config(config())
        .with_api(server)
        .build()
        .unwrap();
    let result = engine.place_call("1234567890").await;
    assert!(matches!(result, Err(Error::Validation(_))));
    assert!(engine.view().outgoing_room.is_none());
    assert!(engine.history().await.is_empty());
}
