//! Client for driving entities from outside: signals, calls, status reads,
//! and multi-entity critical sections.
//!
//! The client talks to the host only through the [`EntityTransport`]
//! abstraction (reliable enqueue + response pickup), so it can live in any
//! process that can reach the underlying runtime. Each client gets its own
//! instance id, which becomes the `parent_instance_id` — and thus the reply
//! target and lock owner — of everything it sends.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::_typed_codec::{Codec, Json};
use crate::runtime::EntityTransport;
use crate::status::EntityStatus;
use crate::{EntityId, FailureKind, RequestMessage, ResponseMessage, RELEASE_OPERATION};

// Constants for polling behavior while awaiting a response
/// Initial delay between response polls (5ms)
const INITIAL_POLL_DELAY_MS: u64 = 5;

/// Maximum delay between response polls (100ms)
const MAX_POLL_DELAY_MS: u64 = 100;

/// Multiplier for exponential backoff
const POLL_DELAY_MULTIPLIER: u64 = 2;

/// Errors surfaced by the client API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Transport-level failure (enqueue, response pickup, state read).
    Transport(String),

    /// No response arrived within the caller's timeout. The request is not
    /// cancelled — a late response is simply ignored.
    Timeout,

    /// Client-side validation failed before anything was sent.
    InvalidInput { message: String },

    /// The entity processed the request and reported a failure.
    Operation { kind: FailureKind, details: String },
}

impl ClientError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(_) => true,
            ClientError::Timeout => true,
            ClientError::InvalidInput { .. } => false,
            ClientError::Operation { .. } => false,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::Transport(e) => write!(f, "transport error: {e}"),
            ClientError::Timeout => write!(f, "operation timed out"),
            ClientError::InvalidInput { message } => write!(f, "invalid input: {message}"),
            ClientError::Operation { kind, details } => write!(f, "{kind}: {details}"),
        }
    }
}

impl std::error::Error for ClientError {}

/// Client for entity control-plane operations.
///
/// `Client` is `Clone` and can be shared across tasks; clones share the same
/// instance id and therefore the same reply mailbox and lock ownership.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn EntityTransport>,
    instance_id: String,
}

impl Client {
    /// Create a client bound to a transport. Each `new` call mints a fresh
    /// client instance id.
    pub fn new(transport: Arc<dyn EntityTransport>) -> Self {
        let instance_id = format!("client-{}", transport.new_guid());
        Self {
            transport,
            instance_id,
        }
    }

    /// The instance id this client sends under (its reply address and lock
    /// ownership identity).
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Enqueue a fire-and-forget signal. Returns as soon as the signal is
    /// reliably enqueued; no response is ever awaited or delivered.
    pub async fn signal_entity(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: Option<String>,
    ) -> Result<(), ClientError> {
        let message = RequestMessage::signal(
            self.transport.new_guid(),
            self.instance_id.clone(),
            operation,
            input,
        );
        debug!(
            target: "entoxide::client",
            entity = %entity,
            operation = %message.operation,
            "signaling entity"
        );
        self.transport
            .send_request(&entity.scheduler_id(), message)
            .await
            .map_err(ClientError::Transport)
    }

    /// Typed variant of [`Client::signal_entity`].
    pub async fn signal_entity_typed<T: Serialize>(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: &T,
    ) -> Result<(), ClientError> {
        let encoded = Json::encode(input).map_err(|message| ClientError::InvalidInput { message })?;
        self.signal_entity(entity, operation, Some(encoded)).await
    }

    /// Request/response interaction: send an operation and await its reply.
    /// `Ok(None)` means the operation completed without recording a result.
    pub async fn call_entity(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: Option<String>,
        timeout: Duration,
    ) -> Result<Option<String>, ClientError> {
        let id = self.transport.new_guid();
        let message = RequestMessage::operation(
            id.clone(),
            self.instance_id.clone(),
            operation,
            input,
        );
        debug!(
            target: "entoxide::client",
            entity = %entity,
            operation = %message.operation,
            id = %id,
            "calling entity"
        );
        self.transport
            .send_request(&entity.scheduler_id(), message)
            .await
            .map_err(ClientError::Transport)?;
        let response = self.wait_for_response(&id, timeout).await?;
        match response.failure_details() {
            Some(failure) => Err(ClientError::Operation {
                kind: failure.kind,
                details: failure.details,
            }),
            None => Ok(response.result),
        }
    }

    /// Typed variant of [`Client::call_entity`]. An absent result decodes as
    /// JSON `null`, so `Out = Option<T>` maps it to `None`.
    pub async fn call_entity_typed<In: Serialize, Out: DeserializeOwned>(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: &In,
        timeout: Duration,
    ) -> Result<Out, ClientError> {
        let encoded = Json::encode(input).map_err(|message| ClientError::InvalidInput { message })?;
        let result = self
            .call_entity(entity, operation, Some(encoded), timeout)
            .await?;
        let raw = result.unwrap_or_else(|| "null".to_string());
        Json::decode(&raw).map_err(|message| ClientError::InvalidInput { message })
    }

    /// Read the bounded diagnostic snapshot for an entity. An entity whose
    /// scheduler never ran (or terminated) reads as latent with an empty
    /// queue.
    pub async fn read_entity_status(&self, entity: &EntityId) -> Result<EntityStatus, ClientError> {
        let snapshot = self
            .transport
            .read_state(&entity.scheduler_id())
            .await
            .map_err(ClientError::Transport)?;
        EntityStatus::from_snapshot(snapshot.as_deref()).map_err(ClientError::Transport)
    }

    /// Acquire a critical section over several entities at once. The lock
    /// set is normalized into the canonical order and acquired entity by
    /// entity along the chain; the returned guard must be [released]
    /// explicitly.
    ///
    /// [released]: CriticalSection::release
    pub async fn lock_entities(
        &self,
        entities: Vec<EntityId>,
        timeout: Duration,
    ) -> Result<CriticalSection, ClientError> {
        if entities.is_empty() {
            return Err(ClientError::InvalidInput {
                message: "lock set must not be empty".to_string(),
            });
        }
        let id = self.transport.new_guid();
        let message = RequestMessage::lock(id.clone(), self.instance_id.clone(), entities);
        let lock_set = message.lock_set.clone();
        let first = lock_set[0].scheduler_id();
        self.transport
            .send_request(&first, message)
            .await
            .map_err(ClientError::Transport)?;
        let response = self.wait_for_response(&id, timeout).await?;
        if let Some(failure) = response.failure_details() {
            return Err(ClientError::Operation {
                kind: failure.kind,
                details: failure.details,
            });
        }
        debug!(
            target: "entoxide::client",
            entities = lock_set.len(),
            owner = %self.instance_id,
            "critical section acquired"
        );
        Ok(CriticalSection {
            transport: self.transport.clone(),
            owner_instance_id: self.instance_id.clone(),
            lock_set,
            released: false,
        })
    }

    async fn wait_for_response(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<ResponseMessage, ClientError> {
        let deadline = Instant::now() + timeout;
        let mut delay = INITIAL_POLL_DELAY_MS;
        loop {
            if let Some(response) = self
                .transport
                .take_response(&self.instance_id, correlation_id)
                .await
                .map_err(ClientError::Transport)?
            {
                return Ok(response);
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(delay)).await;
            delay = (delay * POLL_DELAY_MULTIPLIER).min(MAX_POLL_DELAY_MS);
        }
    }
}

/// A held multi-entity lock. Release is explicit: the owner sends the
/// reserved release signal to every member of the lock set.
pub struct CriticalSection {
    transport: Arc<dyn EntityTransport>,
    owner_instance_id: String,
    lock_set: Vec<EntityId>,
    released: bool,
}

impl CriticalSection {
    /// The entities held, in canonical order.
    pub fn lock_set(&self) -> &[EntityId] {
        &self.lock_set
    }

    /// Release every entity in the lock set. Queued messages from other
    /// senders become eligible again on each entity's next iteration.
    pub async fn release(mut self) -> Result<(), ClientError> {
        self.released = true;
        for entity in &self.lock_set {
            let message = RequestMessage::signal(
                self.transport.new_guid(),
                self.owner_instance_id.clone(),
                RELEASE_OPERATION,
                None,
            );
            self.transport
                .send_request(&entity.scheduler_id(), message)
                .await
                .map_err(ClientError::Transport)?;
        }
        debug!(
            target: "entoxide::client",
            owner = %self.owner_instance_id,
            "critical section released"
        );
        Ok(())
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                target: "entoxide::client",
                owner = %self.owner_instance_id,
                entities = self.lock_set.len(),
                "critical section dropped without release; entities remain locked"
            );
        }
    }
}
