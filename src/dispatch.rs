//! Operation dispatch: invoking user code for each admitted request and
//! capturing its result, failure, and buffered effects.
//!
//! Two modes exist. In-process dispatch invokes one registered handler per
//! operation. Out-of-process dispatch hands the whole batch to an external
//! worker and applies the JSON batch-result document it returns. In both
//! modes a user failure is captured into the pending response and execution
//! of the remaining batch continues; the first failure per iteration is also
//! surfaced to the runtime for diagnostics.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::EntityContext;
use crate::registry::{EntityRegistry, OperationError};
use crate::runtime::{Host, OutboundMessage};
use crate::state::SchedulerState;
use crate::status::{CurrentOperation, EntityStatus};
use crate::{
    EntityId, FailureDetails, FailureKind, RequestMessage, ResponseMessage, RELEASE_OPERATION,
};

/// How user code is invoked for a batch.
#[derive(Clone)]
pub enum DispatchMode {
    /// One handler invocation per operation, resolved from the registry.
    InProcess(EntityRegistry),
    /// One invocation per batch against an external worker.
    OutOfProcess(Arc<dyn BatchInvoker>),
}

/// External worker for out-of-process dispatch: consumes a batch document and
/// returns the serialized [`BatchWorkResult`] JSON.
#[async_trait]
pub trait BatchInvoker: Send + Sync {
    async fn invoke_batch(&self, request: &BatchWorkRequest) -> Result<String, String>;
}

/// The document handed to an out-of-process worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWorkRequest {
    pub entity: EntityId,
    pub entity_exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_state: Option<String>,
    pub operations: Vec<BatchOperation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperation {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default)]
    pub is_signal: bool,
}

/// The document an out-of-process worker returns for one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchWorkResult {
    pub entity_exists: bool,
    #[serde(default)]
    pub entity_state: Option<String>,
    /// One entry per non-signal operation, in batch order.
    #[serde(default)]
    pub responses: Vec<BatchOperationResult>,
    /// Signals to other entities; the scheduler stamps fresh ids on them.
    #[serde(default)]
    pub signals: Vec<BatchSignal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOperationResult {
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSignal {
    pub target: EntityId,
    pub name: String,
    #[serde(default)]
    pub input: Option<String>,
}

/// Identity and runtime handles shared by every dispatch in an iteration.
pub(crate) struct ExecutionEnv<'a> {
    pub entity_id: &'a EntityId,
    pub instance_id: &'a str,
    pub host: &'a Arc<dyn Host>,
    pub is_replaying: bool,
}

/// Execute the operations of a batch in order, mutating `state` and
/// appending responses and signals to `outbox`. Returns the first failure of
/// the iteration, if any.
pub(crate) async fn execute_operations(
    mode: &DispatchMode,
    env: &ExecutionEnv<'_>,
    state: &mut SchedulerState,
    operations: Vec<RequestMessage>,
    outbox: &mut Vec<OutboundMessage>,
) -> Option<FailureDetails> {
    match mode {
        DispatchMode::InProcess(registry) => {
            let mut first_failure = None;
            for request in operations {
                if request.operation == RELEASE_OPERATION {
                    // Releases are consumed at ingest; one in a batch means a
                    // stale or crafted message. Never answered.
                    warn!(
                        target: "entoxide::locks",
                        entity = %env.entity_id,
                        "dropping queued release message"
                    );
                    continue;
                }
                let failure = dispatch_one(registry, env, state, request, outbox).await;
                if first_failure.is_none() {
                    first_failure = failure;
                }
            }
            first_failure
        }
        DispatchMode::OutOfProcess(invoker) => {
            dispatch_batched(invoker.as_ref(), env, state, operations, outbox).await
        }
    }
}

async fn dispatch_one(
    registry: &EntityRegistry,
    env: &ExecutionEnv<'_>,
    state: &mut SchedulerState,
    request: RequestMessage,
    outbox: &mut Vec<OutboundMessage>,
) -> Option<FailureDetails> {
    let exists_before = state.entity_exists;
    let ctx = EntityContext::for_operation(
        env.entity_id.clone(),
        env.instance_id.to_string(),
        env.host.clone(),
        env.is_replaying,
        &request,
        exists_before,
        state.entity_state.clone(),
    );
    // The entity exists from the first operation that touches it, even if
    // that operation raises.
    state.entity_exists = true;
    env.host.publish_status(
        env.entity_id,
        EntityStatus::of(
            state,
            Some(CurrentOperation {
                operation: request.operation.clone(),
                id: request.id.clone(),
                parent_instance_id: request.parent_instance_id.clone(),
                start_time_ms: env.host.now_ms(),
            }),
        ),
    );

    let class_name = &env.entity_id.class_name;
    let outcome: Result<(), FailureDetails> =
        match registry.resolve_operation(class_name, &request.operation) {
            Some(handler) => handler
                .invoke(ctx.clone(), request.input.clone())
                .await
                .map_err(|e| match e {
                    OperationError::Failed(details) => FailureDetails {
                        kind: FailureKind::OperationFailed,
                        details,
                    },
                    OperationError::Serialization(details) => FailureDetails {
                        kind: FailureKind::SerializationFailed,
                        details,
                    },
                }),
            None if registry.has(class_name) => Err(FailureDetails {
                kind: FailureKind::OperationNotFound,
                details: format!("no such operation: {}", request.operation),
            }),
            None => Err(FailureDetails {
                kind: FailureKind::ClassNotFound,
                details: format!("no such entity class: {class_name}"),
            }),
        };

    let effects = ctx.take_effects();
    match outcome {
        Ok(()) => {
            if effects.state_dirty {
                state.entity_state = effects.state;
            }
            if effects.destruct_on_exit {
                state.entity_exists = false;
                state.entity_state = None;
            } else if state.entity_state.is_none() {
                // Touched but never written: carry a JSON null blob so
                // existence and state stay coherent.
                state.entity_state = Some("null".to_string());
            }
            for (target, name, input) in effects.signals {
                let signal =
                    RequestMessage::signal(env.host.new_guid(), env.instance_id, name, input);
                outbox.push(OutboundMessage::request(target.scheduler_id(), signal));
            }
            if !request.is_signal {
                outbox.push(OutboundMessage::response(
                    request.parent_instance_id,
                    request.id,
                    ResponseMessage::success(effects.return_value),
                ));
            }
            None
        }
        Err(details) => {
            // Failed operations leave no trace: buffered state writes and
            // signals are discarded with `effects`, and an existence flip
            // from this very operation is rolled back.
            state.entity_exists = exists_before;
            warn!(
                target: "entoxide::dispatch",
                entity = %env.entity_id,
                operation = %request.operation,
                kind = %details.kind,
                "operation failed: {}",
                details.details
            );
            if !request.is_signal {
                outbox.push(OutboundMessage::response(
                    request.parent_instance_id,
                    request.id,
                    ResponseMessage::failure(details.kind, details.details.clone()),
                ));
            }
            Some(details)
        }
    }
}

async fn dispatch_batched(
    invoker: &dyn BatchInvoker,
    env: &ExecutionEnv<'_>,
    state: &mut SchedulerState,
    operations: Vec<RequestMessage>,
    outbox: &mut Vec<OutboundMessage>,
) -> Option<FailureDetails> {
    // Releases are consumed at ingest; the worker sees only real operations.
    let mut work: Vec<RequestMessage> = Vec::new();
    for request in operations {
        if request.operation == RELEASE_OPERATION {
            warn!(
                target: "entoxide::locks",
                entity = %env.entity_id,
                "dropping queued release message"
            );
        } else {
            work.push(request);
        }
    }
    let Some(first) = work.first() else {
        return None;
    };
    env.host.publish_status(
        env.entity_id,
        EntityStatus::of(
            state,
            Some(CurrentOperation {
                operation: first.operation.clone(),
                id: first.id.clone(),
                parent_instance_id: first.parent_instance_id.clone(),
                start_time_ms: env.host.now_ms(),
            }),
        ),
    );

    let document = BatchWorkRequest {
        entity: env.entity_id.clone(),
        entity_exists: state.entity_exists,
        entity_state: state.entity_state.clone(),
        operations: work
            .iter()
            .map(|r| BatchOperation {
                operation: r.operation.clone(),
                input: r.input.clone(),
                is_signal: r.is_signal,
            })
            .collect(),
    };

    let parsed: Result<BatchWorkResult, String> = match invoker.invoke_batch(&document).await {
        Ok(raw) => {
            serde_json::from_str(&raw).map_err(|e| format!("batch result is not valid JSON: {e}"))
        }
        Err(e) => Err(format!("batch invocation failed: {e}")),
    };

    let result = match parsed {
        Ok(result) => result,
        Err(message) => {
            // Fatal for the batch: every caller learns, state stays as-is.
            let details = FailureDetails {
                kind: FailureKind::OutOfProcessFailure,
                details: message,
            };
            warn!(
                target: "entoxide::dispatch",
                entity = %env.entity_id,
                "out-of-process batch failed: {}",
                details.details
            );
            for request in &work {
                if !request.is_signal {
                    outbox.push(OutboundMessage::response(
                        request.parent_instance_id.clone(),
                        request.id.clone(),
                        ResponseMessage::failure(details.kind, details.details.clone()),
                    ));
                }
            }
            return Some(details);
        }
    };

    state.entity_exists = result.entity_exists;
    state.entity_state = if result.entity_exists {
        Some(result.entity_state.unwrap_or_else(|| "null".to_string()))
    } else {
        None
    };

    let mut first_failure: Option<FailureDetails> = None;
    let mut responses = result.responses.into_iter();
    for request in &work {
        if request.is_signal {
            continue;
        }
        let response = match responses.next() {
            Some(r) if r.is_error => {
                let details = FailureDetails {
                    kind: FailureKind::OperationFailed,
                    details: r.result.unwrap_or_default(),
                };
                if first_failure.is_none() {
                    first_failure = Some(details.clone());
                }
                ResponseMessage::failure(details.kind, details.details)
            }
            Some(r) => ResponseMessage::success(r.result),
            None => {
                let details = FailureDetails {
                    kind: FailureKind::OutOfProcessFailure,
                    details: "batch result is missing a response".to_string(),
                };
                if first_failure.is_none() {
                    first_failure = Some(details.clone());
                }
                ResponseMessage::failure(details.kind, details.details)
            }
        };
        outbox.push(OutboundMessage::response(
            request.parent_instance_id.clone(),
            request.id.clone(),
            response,
        ));
    }
    for signal in result.signals {
        let message =
            RequestMessage::signal(env.host.new_guid(), env.instance_id, signal.name, signal.input);
        outbox.push(OutboundMessage::request(signal.target.scheduler_id(), message));
    }
    first_failure
}
