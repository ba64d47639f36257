//! Execution-time surface lent to user operation handlers.
//!
//! The scheduler owns the entity state; for the duration of one operation it
//! lends the handler an [`EntityContext`] view. The context buffers every
//! effect — state writes, the return value, outbound signals, the destruct
//! flag — and the dispatcher collects them when the handler returns. Nothing
//! escapes the dispatch boundary: a failed operation's buffered effects are
//! discarded wholesale.

use std::sync::{Arc, Mutex};

use serde::{de::DeserializeOwned, Serialize};

use crate::_typed_codec::{Codec, Json};
use crate::runtime::Host;
use crate::{EntityId, RequestMessage};

/// Context handle for the operation currently being dispatched.
///
/// Cheap to clone; all clones share the same per-operation buffers. Handlers
/// receive it by value and may move it into spawned futures, but effects are
/// collected the moment the handler's future resolves.
#[derive(Clone)]
pub struct EntityContext {
    inner: Arc<Mutex<ContextInner>>,
}

struct ContextInner {
    self_id: EntityId,
    instance_id: String,
    operation_name: String,
    input: Option<String>,
    is_signal: bool,
    is_replaying: bool,
    is_newly_constructed: bool,
    /// Serialized user state as of operation start; replaced on `set_state`.
    state: Option<String>,
    /// Set only by `set_state`: a read-only operation writes nothing back,
    /// leaving the persisted bytes untouched.
    state_dirty: bool,
    return_value: Option<String>,
    destruct_on_exit: bool,
    outgoing_signals: Vec<(EntityId, String, Option<String>)>,
    host: Arc<dyn Host>,
}

/// Effects drained from a context after its handler returned.
pub(crate) struct OperationEffects {
    pub return_value: Option<String>,
    pub state: Option<String>,
    pub state_dirty: bool,
    pub destruct_on_exit: bool,
    pub signals: Vec<(EntityId, String, Option<String>)>,
}

impl EntityContext {
    pub(crate) fn for_operation(
        self_id: EntityId,
        instance_id: String,
        host: Arc<dyn Host>,
        is_replaying: bool,
        request: &RequestMessage,
        exists_before: bool,
        state: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ContextInner {
                self_id,
                instance_id,
                operation_name: request.operation.clone(),
                input: request.input.clone(),
                is_signal: request.is_signal,
                is_replaying,
                is_newly_constructed: !exists_before,
                state,
                state_dirty: false,
                return_value: None,
                destruct_on_exit: false,
                outgoing_signals: Vec::new(),
                host,
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContextInner> {
        // Poisoning indicates a panic in a handler holding the guard; state
        // for this operation is unusable either way.
        self.inner.lock().expect("entity context mutex poisoned")
    }

    /// Drain the buffered effects. Called by the dispatcher once the handler
    /// future resolved; clones stashed by the handler keep working but their
    /// later writes are ignored.
    pub(crate) fn take_effects(&self) -> OperationEffects {
        let mut inner = self.lock();
        OperationEffects {
            return_value: inner.return_value.take(),
            state: inner.state.clone(),
            state_dirty: inner.state_dirty,
            destruct_on_exit: inner.destruct_on_exit,
            signals: std::mem::take(&mut inner.outgoing_signals),
        }
    }

    // === Operation metadata ===

    /// The entity being operated on.
    pub fn entity_id(&self) -> EntityId {
        self.lock().self_id.clone()
    }

    /// The entity key (second component of the address).
    pub fn key(&self) -> String {
        self.lock().self_id.key.clone()
    }

    /// The scheduler instance id this entity runs under.
    pub fn instance_id(&self) -> String {
        self.lock().instance_id.clone()
    }

    /// Name of the operation being dispatched.
    pub fn operation_name(&self) -> String {
        self.lock().operation_name.clone()
    }

    /// Whether the current request is a signal (its return value is ignored).
    pub fn is_signal(&self) -> bool {
        self.lock().is_signal
    }

    /// Whether this iteration is a replay of history. Handlers can consult
    /// this to skip diagnostics they only want once.
    pub fn is_replaying(&self) -> bool {
        self.lock().is_replaying
    }

    /// True when the entity did not exist before this operation (first-ever
    /// operation, or first after a destruct).
    pub fn is_newly_constructed(&self) -> bool {
        self.lock().is_newly_constructed
    }

    /// The raw serialized operation input, if any.
    pub fn input_raw(&self) -> Option<String> {
        self.lock().input.clone()
    }

    /// Deserialize the operation input. A missing payload decodes as JSON
    /// `null`, so `Option<T>` inputs map absence to `None`.
    pub fn get_input<T: DeserializeOwned>(&self) -> Result<T, String> {
        let input = self.lock().input.clone();
        match input {
            Some(s) => Json::decode(&s),
            None => Json::decode("null"),
        }
    }

    // === State access ===

    /// Deserialize the entity state. While the entity holds no state the
    /// type's default is returned.
    pub fn get_state<T: DeserializeOwned + Default>(&self) -> Result<T, String> {
        let state = self.lock().state.clone();
        match state.as_deref() {
            None | Some("null") => Ok(T::default()),
            Some(s) => Json::decode(s),
        }
    }

    /// Replace the entity state. Marks the state dirty so the new bytes are
    /// written back when the operation completes successfully.
    pub fn set_state<T: Serialize>(&self, value: &T) -> Result<(), String> {
        let encoded = Json::encode(value)?;
        let mut inner = self.lock();
        inner.state = Some(encoded);
        inner.state_dirty = true;
        Ok(())
    }

    // === Effects ===

    /// Record the operation's result. Ignored for signals.
    pub fn return_value<T: Serialize>(&self, value: &T) -> Result<(), String> {
        let encoded = Json::encode(value)?;
        self.lock().return_value = Some(encoded);
        Ok(())
    }

    /// Record an already-serialized result payload.
    pub fn return_raw(&self, payload: impl Into<String>) {
        self.lock().return_value = Some(payload.into());
    }

    /// Delete this entity when the operation exits: state is cleared and the
    /// entity reverts to non-existing. A later operation recreates it.
    pub fn destruct_on_exit(&self) {
        self.lock().destruct_on_exit = true;
    }

    /// Buffer a fire-and-forget signal to another entity. Delivered with the
    /// iteration's outbox flush, after state write-back commits.
    pub fn signal_entity(&self, target: &EntityId, operation: impl Into<String>, input: Option<String>) {
        self.lock()
            .outgoing_signals
            .push((target.clone(), operation.into(), input));
    }

    /// Typed variant of [`EntityContext::signal_entity`].
    pub fn signal_entity_typed<T: Serialize>(
        &self,
        target: &EntityId,
        operation: impl Into<String>,
        input: &T,
    ) -> Result<(), String> {
        let encoded = Json::encode(input)?;
        self.signal_entity(target, operation, Some(encoded));
        Ok(())
    }

    /// Invoke an activity through the underlying runtime. The runtime records
    /// the result, keeping replay deterministic.
    pub async fn call_activity(
        &self,
        name: impl AsRef<str>,
        input: impl Into<String>,
    ) -> Result<String, String> {
        let host = self.lock().host.clone();
        host.call_activity(name.as_ref(), input.into()).await
    }

    // === Tracing ===

    /// Emit an INFO trace entry correlated with this entity and operation.
    pub fn trace_info(&self, message: impl Into<String>) {
        let inner = self.lock();
        tracing::info!(
            target: "entoxide::entity",
            instance_id = %inner.instance_id,
            entity = %inner.self_id,
            operation = %inner.operation_name,
            "{}",
            message.into()
        );
    }

    /// Emit a WARN trace entry correlated with this entity and operation.
    pub fn trace_warn(&self, message: impl Into<String>) {
        let inner = self.lock();
        tracing::warn!(
            target: "entoxide::entity",
            instance_id = %inner.instance_id,
            entity = %inner.self_id,
            operation = %inner.operation_name,
            "{}",
            message.into()
        );
    }

    /// Emit an ERROR trace entry correlated with this entity and operation.
    pub fn trace_error(&self, message: impl Into<String>) {
        let inner = self.lock();
        tracing::error!(
            target: "entoxide::entity",
            instance_id = %inner.instance_id,
            entity = %inner.self_id,
            operation = %inner.operation_name,
            "{}",
            message.into()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NullHost;

    #[async_trait]
    impl Host for NullHost {
        fn new_guid(&self) -> String {
            "guid-0".to_string()
        }
        fn now_ms(&self) -> u64 {
            0
        }
        async fn call_activity(&self, name: &str, _input: String) -> Result<String, String> {
            Err(format!("unregistered activity: {name}"))
        }
    }

    fn ctx(state: Option<&str>, exists: bool) -> EntityContext {
        let request = RequestMessage::operation("r1", "p1", "op", Some("5".into()));
        EntityContext::for_operation(
            EntityId::new("Counter", "c1"),
            "@Counter@c1".to_string(),
            Arc::new(NullHost),
            false,
            &request,
            exists,
            state.map(String::from),
        )
    }

    #[test]
    fn state_defaults_when_absent() {
        let ctx1 = ctx(None, false);
        assert_eq!(ctx1.get_state::<i64>().unwrap(), 0);
        assert!(ctx1.is_newly_constructed());

        // JSON null blobs (touched but never written) also read as default.
        let ctx2 = ctx(Some("null"), true);
        assert_eq!(ctx2.get_state::<i64>().unwrap(), 0);
    }

    #[test]
    fn read_only_operation_is_not_dirty() {
        let ctx = ctx(Some("8"), true);
        let _: i64 = ctx.get_state().unwrap();
        let effects = ctx.take_effects();
        assert!(!effects.state_dirty);
        assert_eq!(effects.state.as_deref(), Some("8"));
    }

    #[test]
    fn set_state_marks_dirty() {
        let ctx = ctx(Some("8"), true);
        ctx.set_state(&9i64).unwrap();
        let effects = ctx.take_effects();
        assert!(effects.state_dirty);
        assert_eq!(effects.state.as_deref(), Some("9"));
    }

    #[test]
    fn effects_capture_signals_and_destruct() {
        let ctx = ctx(None, false);
        ctx.return_value(&42i64).unwrap();
        ctx.destruct_on_exit();
        ctx.signal_entity(&EntityId::new("Counter", "other"), "increment", None);
        let effects = ctx.take_effects();
        assert_eq!(effects.return_value.as_deref(), Some("42"));
        assert!(effects.destruct_on_exit);
        assert_eq!(effects.signals.len(), 1);
    }

    #[test]
    fn typed_input_decodes() {
        let ctx = ctx(None, false);
        assert_eq!(ctx.get_input::<i64>().unwrap(), 5);
        assert_eq!(ctx.input_raw().as_deref(), Some("5"));
    }
}
