//! The per-entity scheduler loop.
//!
//! The scheduler is a replayable orchestration executing one iteration per
//! activation: rehydrate persisted state, ingest the messages the runtime
//! delivered, assemble a batch, execute it, and hand the re-encoded state to
//! the runtime's ContinueAsNew tail-call — or terminate when the entity is
//! latent and idle. The outbox is buffered for the whole iteration and
//! flushed by the host only after the write-back commits, so replayed
//! iterations rebuild but never re-send it.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::batch;
use crate::dispatch::{self, DispatchMode, ExecutionEnv};
use crate::locks;
use crate::runtime::{Host, OutboundMessage, SchedulerOptions};
use crate::state::SchedulerState;
use crate::status::EntityStatus;
use crate::{EntityId, FailureDetails, RequestMessage, RELEASE_OPERATION};

/// Errors that abort an iteration. The runtime re-runs the iteration from
/// the last persisted state; nothing partial is observable because the
/// outbox only flushes after a successful write-back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// The persisted state snapshot failed to deserialize. Not retryable:
    /// replaying the same bytes fails the same way.
    CorruptState { message: String },
    /// Re-encoding state for write-back failed.
    WriteBack { message: String },
}

impl SchedulerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::CorruptState { .. } => false,
            SchedulerError::WriteBack { .. } => true,
        }
    }
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::CorruptState { message } => write!(f, "corrupt state: {message}"),
            SchedulerError::WriteBack { message } => write!(f, "state write-back: {message}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// How the iteration ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationDecision {
    /// Tail-call the next iteration with this serialized state. Also used to
    /// park an alive-but-idle entity: the state rides along unchanged until
    /// the runtime delivers more messages.
    ContinueAsNew { state: String },
    /// The entity is latent with an empty queue and no held lock; the
    /// scheduler orchestration ends. A later message re-creates it.
    Terminate,
}

/// Everything one activation produced.
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub decision: IterationDecision,
    /// Buffered responses and inter-entity messages, to be flushed after the
    /// state write-back commits.
    pub outbox: Vec<OutboundMessage>,
    /// First user failure of the iteration, surfaced as a runtime failure
    /// trace for diagnostics. Every failure is also in its response.
    pub failure: Option<FailureDetails>,
}

/// The replayable driver for one entity.
pub struct EntityScheduler {
    entity_id: EntityId,
    instance_id: String,
    mode: DispatchMode,
    host: Arc<dyn Host>,
    options: SchedulerOptions,
}

impl EntityScheduler {
    pub fn new(entity_id: EntityId, mode: DispatchMode, host: Arc<dyn Host>) -> Self {
        Self::with_options(entity_id, mode, host, SchedulerOptions::default())
    }

    pub fn with_options(
        entity_id: EntityId,
        mode: DispatchMode,
        host: Arc<dyn Host>,
        options: SchedulerOptions,
    ) -> Self {
        let instance_id = entity_id.scheduler_id();
        Self {
            entity_id,
            instance_id,
            mode,
            host,
            options,
        }
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// The release comes from the critical-section owner via the reserved
    /// operation name; the cleared lock is committed with this iteration's
    /// write-back and no response is ever delivered, even when the sender
    /// forgot to mark it as a signal. A release from anyone but the holder
    /// is a protocol violation: logged and dropped.
    fn apply_release(&self, state: &mut SchedulerState, message: &RequestMessage) {
        match &state.locked_by {
            Some(holder) if *holder == message.parent_instance_id => {
                debug!(
                    target: "entoxide::locks",
                    instance_id = %self.instance_id,
                    parent_instance_id = %message.parent_instance_id,
                    "critical section released"
                );
                state.locked_by = None;
            }
            _ => {
                warn!(
                    target: "entoxide::locks",
                    instance_id = %self.instance_id,
                    parent_instance_id = %message.parent_instance_id,
                    locked_by = ?state.locked_by,
                    "dropping release from non-holder"
                );
            }
        }
    }

    /// Run one iteration. `snapshot` is the state carried by the previous
    /// iteration's ContinueAsNew (`None` on cold activation); `inbound` is
    /// the complete set of messages the runtime delivered for this
    /// activation, in arrival order.
    pub async fn execute_iteration(
        &self,
        snapshot: Option<&str>,
        inbound: Vec<RequestMessage>,
        is_replaying: bool,
    ) -> Result<IterationResult, SchedulerError> {
        let mut state = SchedulerState::decode(snapshot)
            .map_err(|message| SchedulerError::CorruptState { message })?;

        for message in inbound {
            // Releases act at ingest: clearing `locked_by` must not wait in
            // line behind blocked messages (a foreign lock request at the
            // queue head would bar the holder from ever unlocking). The
            // queue is re-scanned by the batch build below.
            if message.operation == RELEASE_OPERATION && !message.is_lock_request() {
                self.apply_release(&mut state, &message);
                continue;
            }
            if message.is_lock_request() {
                if let Err(reason) = locks::validate(&self.entity_id, &message) {
                    warn!(
                        target: "entoxide::scheduler",
                        instance_id = %self.instance_id,
                        id = %message.id,
                        "dropping invalid lock request: {reason}"
                    );
                    continue;
                }
            }
            state.enqueue(message);
        }

        let batch = batch::build_batch(&mut state, self.options.max_batch_operations);
        if batch.is_empty() {
            if state.can_terminate() {
                debug!(
                    target: "entoxide::scheduler",
                    instance_id = %self.instance_id,
                    "latent and idle; terminating"
                );
                return Ok(IterationResult {
                    decision: IterationDecision::Terminate,
                    outbox: Vec::new(),
                    failure: None,
                });
            }
            // Parked: alive (or lock-blocked) with nothing eligible. Carry
            // state forward and wait for the next delivery.
            self.host
                .publish_status(&self.entity_id, EntityStatus::of(&state, None));
            let encoded = state
                .encode()
                .map_err(|message| SchedulerError::WriteBack { message })?;
            return Ok(IterationResult {
                decision: IterationDecision::ContinueAsNew { state: encoded },
                outbox: Vec::new(),
                failure: None,
            });
        }

        let mut outbox: Vec<OutboundMessage> = Vec::new();
        let env = ExecutionEnv {
            entity_id: &self.entity_id,
            instance_id: &self.instance_id,
            host: &self.host,
            is_replaying,
        };
        let failure =
            dispatch::execute_operations(&self.mode, &env, &mut state, batch.operations, &mut outbox)
                .await;

        if let Some(lock_request) = batch.lock_request {
            // `locked_by` was recorded when the request was admitted as the
            // batch terminator; here the chain advances.
            locks::advance(lock_request, &mut outbox);
        }

        debug_assert!(state.is_coherent(), "entity_state must track entity_exists");
        self.host
            .publish_status(&self.entity_id, EntityStatus::of(&state, None));

        let encoded = state
            .encode()
            .map_err(|message| SchedulerError::WriteBack { message })?;
        debug!(
            target: "entoxide::scheduler",
            instance_id = %self.instance_id,
            outbox = outbox.len(),
            queued = state.queue.len(),
            entity_exists = state.entity_exists,
            "iteration complete"
        );
        Ok(IterationResult {
            decision: IterationDecision::ContinueAsNew { state: encoded },
            outbox,
            failure,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::EntityRegistry;
    use crate::runtime::EntityMessage;
    use crate::{EntityClass, EntityContext};
    use async_trait::async_trait;

    struct TestHost;

    #[async_trait]
    impl Host for TestHost {
        fn new_guid(&self) -> String {
            "guid-1".to_string()
        }
        fn now_ms(&self) -> u64 {
            1
        }
        async fn call_activity(&self, name: &str, _input: String) -> Result<String, String> {
            Err(format!("unregistered activity: {name}"))
        }
    }

    fn counter_scheduler() -> EntityScheduler {
        let class = EntityClass::builder("Counter")
            .operation("increment", |ctx: EntityContext, _: ()| async move {
                let n: i64 = ctx.get_state()?;
                ctx.set_state(&(n + 1))
            })
            .build();
        let registry = EntityRegistry::builder().register(class).build();
        EntityScheduler::new(
            EntityId::new("Counter", "c1"),
            DispatchMode::InProcess(registry),
            Arc::new(TestHost),
        )
    }

    #[tokio::test]
    async fn cold_idle_activation_terminates() {
        let scheduler = counter_scheduler();
        let result = scheduler.execute_iteration(None, Vec::new(), false).await.unwrap();
        assert_eq!(result.decision, IterationDecision::Terminate);
        assert!(result.outbox.is_empty());
    }

    #[tokio::test]
    async fn alive_entity_parks_instead_of_terminating() {
        let scheduler = counter_scheduler();
        let signal = RequestMessage::signal("r1", "p1", "increment", None);
        let result = scheduler
            .execute_iteration(None, vec![signal], false)
            .await
            .unwrap();
        let IterationDecision::ContinueAsNew { state } = result.decision else {
            panic!("expected continue-as-new");
        };

        // Next activation with nothing new: parked, state unchanged.
        let parked = scheduler
            .execute_iteration(Some(&state), Vec::new(), false)
            .await
            .unwrap();
        assert_eq!(
            parked.decision,
            IterationDecision::ContinueAsNew { state: state.clone() }
        );
        assert!(parked.outbox.is_empty());
    }

    #[tokio::test]
    async fn invalid_lock_request_is_dropped() {
        let scheduler = counter_scheduler();
        // Addressed to a different entity than the cursor points at.
        let request = RequestMessage::lock(
            "r1",
            "orch-1",
            vec![EntityId::new("Counter", "other")],
        );
        let result = scheduler
            .execute_iteration(None, vec![request], false)
            .await
            .unwrap();
        assert_eq!(result.decision, IterationDecision::Terminate);
    }

    #[tokio::test]
    async fn crafted_release_with_lock_set_is_dropped() {
        let scheduler = counter_scheduler();
        // Built directly on the wire, not via RequestMessage::lock: the
        // reserved release name combined with a populated lock set must
        // neither acquire nor be answered.
        let mut request =
            RequestMessage::lock("r1", "orch-1", vec![EntityId::new("Counter", "c1")]);
        request.operation = crate::RELEASE_OPERATION.to_string();
        let result = scheduler
            .execute_iteration(None, vec![request], false)
            .await
            .unwrap();
        assert_eq!(result.decision, IterationDecision::Terminate);
        assert!(result.outbox.is_empty());
    }

    #[tokio::test]
    async fn lock_request_marked_as_signal_is_dropped() {
        let scheduler = counter_scheduler();
        let mut request =
            RequestMessage::lock("r1", "orch-1", vec![EntityId::new("Counter", "c1")]);
        request.is_signal = true;
        let result = scheduler
            .execute_iteration(None, vec![request], false)
            .await
            .unwrap();
        assert_eq!(result.decision, IterationDecision::Terminate);
        assert!(result.outbox.is_empty(), "signals must never be answered");
    }

    #[tokio::test]
    async fn signals_produce_no_responses() {
        let scheduler = counter_scheduler();
        let inbound = vec![
            RequestMessage::signal("r1", "p1", "increment", None),
            RequestMessage::signal("r2", "p1", "increment", None),
        ];
        let result = scheduler.execute_iteration(None, inbound, false).await.unwrap();
        assert!(result.outbox.is_empty(), "signals must never be answered");
        let IterationDecision::ContinueAsNew { state } = result.decision else {
            panic!("expected continue-as-new");
        };
        let parsed = SchedulerState::decode(Some(&state)).unwrap();
        assert_eq!(parsed.entity_state.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn responses_preserve_dispatch_order() {
        let scheduler = counter_scheduler();
        let inbound = vec![
            RequestMessage::operation("r1", "p1", "increment", None),
            RequestMessage::operation("r2", "p1", "increment", None),
        ];
        let result = scheduler.execute_iteration(None, inbound, false).await.unwrap();
        let ids: Vec<&str> = result
            .outbox
            .iter()
            .filter_map(|o| match &o.message {
                EntityMessage::Response { correlation_id, .. } => Some(correlation_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, ["r1", "r2"]);
    }
}
