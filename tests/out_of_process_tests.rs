//! Out-of-process dispatch: one worker invocation per batch, applying the
//! JSON batch-result document.

mod common;

use std::sync::Arc;

use async_trait::async_trait;
use entoxide::{
    BatchInvoker, BatchWorkRequest, Client, ClientError, DispatchMode, EntityId, FailureKind,
    InMemoryHost,
};

use common::CALL_TIMEOUT;

// A worker that implements counter semantics externally: set/add/get, plus a
// "broadcast" operation that emits signals to other entities.
struct CounterWorker;

#[async_trait]
impl BatchInvoker for CounterWorker {
    async fn invoke_batch(&self, request: &BatchWorkRequest) -> Result<String, String> {
        let mut value: i64 = request
            .entity_state
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let mut exists = request.entity_exists;
        let mut responses = Vec::new();
        let mut signals = Vec::new();
        for op in &request.operations {
            exists = true;
            let outcome = match op.operation.as_str() {
                "set" => {
                    value = op.input.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
                    serde_json::json!({ "result": null, "isError": false })
                }
                "add" => {
                    value += op
                        .input
                        .as_deref()
                        .and_then(|s| s.parse::<i64>().ok())
                        .unwrap_or(0);
                    serde_json::json!({ "result": null, "isError": false })
                }
                "get" => serde_json::json!({ "result": value.to_string(), "isError": false }),
                "broadcast" => {
                    signals.push(serde_json::json!({
                        "target": { "className": "Counter", "key": "mirror" },
                        "name": "add",
                        "input": value.to_string(),
                    }));
                    serde_json::json!({ "result": null, "isError": false })
                }
                other => serde_json::json!({
                    "result": format!("no such operation: {other}"),
                    "isError": true,
                }),
            };
            if !op.is_signal {
                responses.push(outcome);
            }
        }
        Ok(serde_json::json!({
            "entityExists": exists,
            "entityState": value.to_string(),
            "responses": responses,
            "signals": signals,
        })
        .to_string())
    }
}

fn setup_out_of_proc(invoker: Arc<dyn BatchInvoker>) -> (Arc<InMemoryHost>, Client) {
    common::init_tracing();
    let host = InMemoryHost::builder()
        .dispatch_mode(DispatchMode::OutOfProcess(invoker))
        .build();
    let client = Client::new(host.clone());
    (host, client)
}

#[tokio::test]
async fn batched_worker_drives_counter() {
    let (host, client) = setup_out_of_proc(Arc::new(CounterWorker));
    let id = EntityId::new("Counter", "oop");

    let r1 = client
        .call_entity(&id, "set", Some("5".into()), CALL_TIMEOUT)
        .await
        .unwrap();
    let r2 = client
        .call_entity(&id, "add", Some("3".into()), CALL_TIMEOUT)
        .await
        .unwrap();
    let r3 = client.call_entity(&id, "get", None, CALL_TIMEOUT).await.unwrap();
    assert_eq!(r1, None);
    assert_eq!(r2, None);
    assert_eq!(r3.as_deref(), Some("8"));

    let snapshot = host.read_state_snapshot(&id).await.unwrap();
    let state: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(state["entityExists"], true);
    assert_eq!(state["entityState"], "8");
}

#[tokio::test]
async fn worker_errors_map_onto_responses_by_position() {
    let (_host, client) = setup_out_of_proc(Arc::new(CounterWorker));
    let id = EntityId::new("Counter", "oop-err");

    client
        .call_entity(&id, "set", Some("1".into()), CALL_TIMEOUT)
        .await
        .unwrap();
    let err = client
        .call_entity(&id, "badOp", None, CALL_TIMEOUT)
        .await
        .unwrap_err();
    match err {
        ClientError::Operation { kind, details } => {
            assert_eq!(kind, FailureKind::OperationFailed);
            assert!(details.contains("no such operation"), "details: {details}");
        }
        other => panic!("expected operation failure, got {other}"),
    }
    // Later traffic still works against the worker-maintained state.
    let value = client.call_entity(&id, "get", None, CALL_TIMEOUT).await.unwrap();
    assert_eq!(value.as_deref(), Some("1"));
}

#[tokio::test]
async fn worker_signals_get_fresh_ids_and_deliver() {
    let (_host, client) = setup_out_of_proc(Arc::new(CounterWorker));
    let id = EntityId::new("Counter", "oop-src");
    let mirror = EntityId::new("Counter", "mirror");

    client
        .call_entity(&id, "set", Some("7".into()), CALL_TIMEOUT)
        .await
        .unwrap();
    client.call_entity(&id, "broadcast", None, CALL_TIMEOUT).await.unwrap();

    let value = client.call_entity(&mirror, "get", None, CALL_TIMEOUT).await.unwrap();
    assert_eq!(value.as_deref(), Some("7"));
}

// Non-JSON worker output is fatal for the batch: every caller hears about
// it and the entity state is left untouched.
struct GarbageWorker;

#[async_trait]
impl BatchInvoker for GarbageWorker {
    async fn invoke_batch(&self, _request: &BatchWorkRequest) -> Result<String, String> {
        Ok("certainly not json".to_string())
    }
}

#[tokio::test]
async fn non_json_worker_output_is_a_batch_failure() {
    let (host, client) = setup_out_of_proc(Arc::new(GarbageWorker));
    let id = EntityId::new("Counter", "oop-garbage");

    let err = client
        .call_entity(&id, "set", Some("5".into()), CALL_TIMEOUT)
        .await
        .unwrap_err();
    match err {
        ClientError::Operation { kind, .. } => {
            assert_eq!(kind, FailureKind::OutOfProcessFailure);
        }
        other => panic!("expected out-of-process failure, got {other}"),
    }
    // State was never modified.
    let snapshot = host.read_state_snapshot(&id).await;
    if let Some(snapshot) = snapshot {
        let state: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
        assert_eq!(state["entityExists"], false);
        assert!(state["entityState"].is_null());
    }
}
